use std::sync::Arc;

use async_trait::async_trait;
use parley_common::{Broadcaster, Envelope, Error, Result};
use tokio::sync::{RwLock, mpsc};

/// Send handle for the live connection. Clones share one outbound slot that
/// the connection swaps on every reconnect, so handles held by in-flight
/// replies keep working across reconnects.
#[derive(Clone, Default)]
pub struct LivePublisher {
    slot: Arc<RwLock<Option<mpsc::Sender<String>>>>,
}

impl LivePublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn attach(&self, sender: mpsc::Sender<String>) {
        *self.slot.write().await = Some(sender);
    }

    /// Drop the outbound sender; the writer task drains and closes.
    pub(crate) async fn detach(&self) {
        self.slot.write().await.take();
    }

    pub async fn is_attached(&self) -> bool {
        self.slot.read().await.is_some()
    }

    pub async fn send_text(&self, frame: String) -> Result<()> {
        let sender = self
            .slot
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::Channel("live connection is not established".into()))?;
        sender
            .send(frame)
            .await
            .map_err(|_| Error::Channel("live connection writer has stopped".into()))
    }
}

#[async_trait]
impl Broadcaster for LivePublisher {
    async fn publish(&self, envelope: Envelope) -> Result<()> {
        self.send_text(envelope.encode()?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_common::{ConversationId, InterruptSignal, UserId};

    fn envelope() -> Envelope {
        Envelope::InterruptSignal(InterruptSignal {
            conversation: ConversationId::from("c"),
            sender: UserId::from("u"),
        })
    }

    #[tokio::test]
    async fn publish_without_connection_is_channel_error() {
        let publisher = LivePublisher::new();
        let err = publisher.publish(envelope()).await.unwrap_err();
        assert!(matches!(err, Error::Channel(_)));
    }

    #[tokio::test]
    async fn clones_follow_reattached_sender() {
        let publisher = LivePublisher::new();
        let handle = publisher.clone();

        let (tx, mut rx) = mpsc::channel(4);
        publisher.attach(tx).await;
        handle.publish(envelope()).await.unwrap();
        assert!(rx.recv().await.unwrap().contains("interrupt_signal"));

        publisher.detach().await;
        assert!(!handle.is_attached().await);

        let (tx, mut rx) = mpsc::channel(4);
        publisher.attach(tx).await;
        handle.send_text("ping".into()).await.unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("ping"));
    }
}
