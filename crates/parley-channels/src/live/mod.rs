//! Live event-stream connection: a websocket to the chat server carrying
//! `{"type": ..., "content": ...}` envelopes in both directions.

mod auth;
mod publisher;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parley_common::{Error, Result};
use parley_config::LiveConfig;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::traits::{ChannelLifecycle, ChannelStatus, FrameHandler};

pub use auth::{HttpSessionRefresher, SessionAuthenticator, StaticSession};
pub use publisher::LivePublisher;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WRITER_SHUTDOWN: Duration = Duration::from_secs(2);

/// One read from the socket, sorted by what the read loop does with it.
enum Inbound {
    Frame(String),
    Closed(Result<()>),
    Skip,
}

fn classify(next: Option<std::result::Result<Message, WsError>>) -> Inbound {
    let message = match next {
        Some(Ok(message)) => message,
        Some(Err(e)) => return Inbound::Closed(Err(Error::Channel(format!("live read failed: {e}")))),
        None => {
            return Inbound::Closed(Err(Error::Channel(
                "live stream ended without a close frame".into(),
            )));
        }
    };
    match message {
        Message::Text(text) => Inbound::Frame(text.to_string()),
        Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
            Ok(text) => Inbound::Frame(text),
            Err(_) => {
                warn!("dropping non-utf8 binary frame");
                Inbound::Skip
            }
        },
        Message::Close(Some(frame)) if frame.code == CloseCode::Normal => {
            info!("live connection closed normally");
            Inbound::Closed(Ok(()))
        }
        Message::Close(frame) => Inbound::Closed(Err(Error::Channel(format!(
            "live connection closed unexpectedly: {frame:?}"
        )))),
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Inbound::Skip,
    }
}

/// Why one connected session ended.
enum SessionEnd {
    Cancelled,
    Refreshed,
    Read(Result<()>),
}

/// Supervises the live connection: connect, read loop, reconnect after a
/// fixed delay, and periodic session refresh that forces a reconnect.
pub struct LiveConnection {
    url: String,
    auth: Arc<dyn SessionAuthenticator>,
    publisher: LivePublisher,
    reader: Option<SplitStream<WsStream>>,
    writer: Option<JoinHandle<()>>,
    status: ChannelStatus,
    /// Frames delivered since the last connect.
    delivered: u64,
    reconnect_delay: Duration,
    refresh_interval: Duration,
    max_consecutive_failures: u32,
    outbound_buffer: usize,
}

impl LiveConnection {
    pub fn new(config: &LiveConfig, auth: Arc<dyn SessionAuthenticator>) -> Self {
        Self::with_publisher(config, auth, LivePublisher::new())
    }

    /// Reuse a publisher owned elsewhere, e.g. one shared across restarts.
    pub fn with_publisher(
        config: &LiveConfig,
        auth: Arc<dyn SessionAuthenticator>,
        publisher: LivePublisher,
    ) -> Self {
        Self {
            url: config.url.clone(),
            auth,
            publisher,
            reader: None,
            writer: None,
            status: ChannelStatus::Disconnected,
            delivered: 0,
            reconnect_delay: config.reconnect_delay(),
            refresh_interval: config.refresh_interval(),
            max_consecutive_failures: config.max_consecutive_failures.max(1),
            outbound_buffer: config.outbound_buffer.max(1),
        }
    }

    /// Handle for publishing envelopes over whichever transport is current.
    pub fn publisher(&self) -> LivePublisher {
        self.publisher.clone()
    }

    /// Deliver inbound frames to `handler` until the transport closes.
    /// A normal closure returns `Ok`; any other closure or read failure is a
    /// channel error.
    pub async fn read_messages(&mut self, handler: &dyn FrameHandler) -> Result<()> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| Error::Channel("read on a closed live connection".into()))?;

        loop {
            match classify(reader.next().await) {
                Inbound::Frame(text) => {
                    self.delivered += 1;
                    handler.on_frame(text).await;
                }
                Inbound::Closed(result) => return result,
                Inbound::Skip => {}
            }
        }
    }

    /// Like `read_messages`, but also stops on cancellation or a refresh
    /// signal. Only the socket read is interrupted; a frame already handed
    /// to `handler` is handled to completion first.
    async fn read_session(
        &mut self,
        handler: &dyn FrameHandler,
        refresh: &mut mpsc::Receiver<()>,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let Some(reader) = self.reader.as_mut() else {
            return SessionEnd::Read(Err(Error::Channel(
                "read on a closed live connection".into(),
            )));
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return SessionEnd::Cancelled,
                Some(()) = refresh.recv() => return SessionEnd::Refreshed,
                next = reader.next() => next,
            };
            match classify(next) {
                Inbound::Frame(text) => {
                    self.delivered += 1;
                    handler.on_frame(text).await;
                }
                Inbound::Closed(result) => return SessionEnd::Read(result),
                Inbound::Skip => {}
            }
        }
    }

    /// Connect-and-read loop. Returns `Ok` on cancellation or a normal close.
    /// Returns an error at once for a non-transport connect failure such as a
    /// bad url, and otherwise once `max_consecutive_failures` connects or
    /// sessions in a row failed without delivering a frame.
    pub async fn run(&mut self, handler: Arc<dyn FrameHandler>, cancel: CancellationToken) -> Result<()> {
        let (refresh_tx, mut refresh_rx) = mpsc::channel::<()>(1);
        let refresher = self.spawn_refresher(refresh_tx, cancel.child_token());

        let mut failures = 0u32;
        let result = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }

            if let Err(e) = self.connect().await {
                failures += 1;
                warn!(attempt = failures, error = %e, "live connect failed");
                self.status = ChannelStatus::Error(e.to_string());
                if !e.is_transport() || failures >= self.max_consecutive_failures {
                    break Err(e);
                }
                if wait_or_cancel(self.reconnect_delay, &cancel).await {
                    break Ok(());
                }
                continue;
            }
            // This connect already used the newest credential.
            while refresh_rx.try_recv().is_ok() {}

            let end = self
                .read_session(handler.as_ref(), &mut refresh_rx, &cancel)
                .await;

            if let Err(e) = self.disconnect().await {
                debug!(error = %e, "disconnect after session end failed");
            }
            // A session that carried traffic was healthy.
            if self.delivered > 0 {
                failures = 0;
            }

            match end {
                SessionEnd::Cancelled => break Ok(()),
                SessionEnd::Read(Ok(())) => break Ok(()),
                SessionEnd::Refreshed => {
                    info!("session refreshed, reconnecting");
                    self.status = ChannelStatus::Reconnecting;
                }
                SessionEnd::Read(Err(e)) => {
                    failures += 1;
                    warn!(attempt = failures, error = %e, "live connection lost");
                    self.status = ChannelStatus::Reconnecting;
                    if failures >= self.max_consecutive_failures {
                        break Err(e);
                    }
                    if wait_or_cancel(self.reconnect_delay, &cancel).await {
                        break Ok(());
                    }
                }
            }
        };

        refresher.abort();
        if let Err(e) = self.disconnect().await {
            debug!(error = %e, "final disconnect failed");
        }
        result
    }

    /// Re-authenticate on a fixed interval. A successful refresh leaves at
    /// most one pending reconnect signal; failures wait for the next tick.
    fn spawn_refresher(&self, signal: mpsc::Sender<()>, cancel: CancellationToken) -> JoinHandle<()> {
        let auth = Arc::clone(&self.auth);
        let period = self.refresh_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match auth.refresh().await {
                    Ok(true) => {
                        if signal.try_send(()).is_err() {
                            debug!("reconnect already pending");
                        }
                    }
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "session refresh failed, retrying next tick"),
                }
            }
        })
    }
}

#[async_trait]
impl ChannelLifecycle for LiveConnection {
    fn display_name(&self) -> &str {
        "live"
    }

    async fn connect(&mut self) -> Result<()> {
        if self.reader.is_some() {
            self.disconnect().await?;
        }
        self.status = ChannelStatus::Connecting;

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::Config(format!("invalid live url '{}': {e}", self.url)))?;
        if let Some(token) = self.auth.credential().await? {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| Error::Auth(format!("session token is not a valid header: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| Error::Channel(format!("live connect to {} failed: {e}", self.url)))?;
        let (sink, reader) = stream.split();
        self.delivered = 0;

        let (tx, rx) = mpsc::channel(self.outbound_buffer);
        self.writer = Some(tokio::spawn(write_loop(sink, rx)));
        self.reader = Some(reader);
        self.publisher.attach(tx).await;
        self.status = ChannelStatus::Connected;
        info!(url = %self.url, "live connection established");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.publisher.detach().await;
        self.reader = None;
        if let Some(writer) = self.writer.take() {
            let abort = writer.abort_handle();
            if tokio::time::timeout(WRITER_SHUTDOWN, writer).await.is_err() {
                abort.abort();
            }
        }
        self.status = ChannelStatus::Disconnected;
        Ok(())
    }

    fn status(&self) -> ChannelStatus {
        self.status.clone()
    }
}

/// Forward outbound frames until the publisher detaches, then close with a
/// normal close frame.
async fn write_loop(mut sink: SplitSink<WsStream, Message>, mut outbound: mpsc::Receiver<String>) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = sink.send(Message::Text(frame.into())).await {
            warn!(error = %e, "live write failed");
            return;
        }
    }
    let close = CloseFrame {
        code: CloseCode::Normal,
        reason: String::new().into(),
    };
    let _ = sink.send(Message::Close(Some(close))).await;
    let _ = sink.close().await;
}

/// Sleep for `delay`; returns true if cancelled first.
async fn wait_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
