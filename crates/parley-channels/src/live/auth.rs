use std::time::Duration;

use async_trait::async_trait;
use parley_common::{Error, Result};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;

/// Source of the session credential presented when connecting.
#[async_trait]
pub trait SessionAuthenticator: Send + Sync {
    /// Credential for the next connect, if any.
    async fn credential(&self) -> Result<Option<String>>;

    /// Re-authenticate. Returns true when a new credential was obtained and
    /// the live connection should be re-established with it.
    async fn refresh(&self) -> Result<bool>;
}

/// Fixed credential that never changes.
pub struct StaticSession {
    token: Option<String>,
}

impl StaticSession {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

#[async_trait]
impl SessionAuthenticator for StaticSession {
    async fn credential(&self) -> Result<Option<String>> {
        Ok(self.token.clone())
    }

    async fn refresh(&self) -> Result<bool> {
        Ok(false)
    }
}

/// Refreshes the session by POSTing the current token to a refresh endpoint
/// that answers `{"token": "..."}`.
pub struct HttpSessionRefresher {
    client: Client,
    refresh_url: String,
    token: RwLock<Option<String>>,
}

#[derive(Deserialize)]
struct RefreshResponse {
    token: String,
}

impl HttpSessionRefresher {
    pub fn new(refresh_url: impl Into<String>, initial: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Auth(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            refresh_url: refresh_url.into(),
            token: RwLock::new(initial),
        })
    }
}

#[async_trait]
impl SessionAuthenticator for HttpSessionRefresher {
    async fn credential(&self) -> Result<Option<String>> {
        Ok(self.token.read().await.clone())
    }

    async fn refresh(&self) -> Result<bool> {
        let current = self.token.read().await.clone();
        let mut request = self.client.post(&self.refresh_url);
        if let Some(token) = &current {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Auth(format!("session refresh request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Auth(format!(
                "session refresh rejected: status={}",
                status.as_u16()
            )));
        }

        let body: RefreshResponse = response
            .json()
            .await
            .map_err(|e| Error::Auth(format!("invalid refresh response: {e}")))?;
        if body.token.is_empty() {
            return Err(Error::Auth("refresh returned an empty token".into()));
        }

        debug!("session credential refreshed");
        *self.token.write().await = Some(body.token);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn refresh_swaps_in_new_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session/refresh"))
            .and(header("authorization", "Bearer old"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "new"})))
            .expect(1)
            .mount(&server)
            .await;

        let auth = HttpSessionRefresher::new(
            format!("{}/session/refresh", server.uri()),
            Some("old".into()),
            Duration::from_secs(2),
        )
        .unwrap();
        assert!(auth.refresh().await.unwrap());
        assert_eq!(auth.credential().await.unwrap().as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn rejected_refresh_keeps_old_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let auth =
            HttpSessionRefresher::new(server.uri(), Some("old".into()), Duration::from_secs(2)).unwrap();
        let err = auth.refresh().await.unwrap_err();
        assert!(matches!(err, Error::Auth(ref m) if m.contains("status=401")));
        assert_eq!(auth.credential().await.unwrap().as_deref(), Some("old"));
    }

    #[tokio::test]
    async fn static_session_never_refreshes() {
        let auth = StaticSession::new(Some("t".into()));
        assert!(!auth.refresh().await.unwrap());
        assert_eq!(auth.credential().await.unwrap().as_deref(), Some("t"));
    }
}
