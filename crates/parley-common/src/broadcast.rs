use async_trait::async_trait;

use crate::error::Result;
use crate::message::Envelope;

/// Outbound publish path for envelopes. Implemented by the live connection's
/// publisher (bot side) and by the subscriber hub (server side).
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn publish(&self, envelope: Envelope) -> Result<()>;
}
