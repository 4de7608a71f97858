use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_common::Result;

/// One crash of a supervised unit.
#[derive(Debug, Clone, PartialEq)]
pub struct CrashRecord {
    pub actor: String,
    pub attempt: u32,
    pub error: String,
    pub at: DateTime<Utc>,
}

impl CrashRecord {
    pub fn now(actor: impl Into<String>, attempt: u32, error: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            attempt,
            error: error.into(),
            at: Utc::now(),
        }
    }
}

/// Durable, append-only record of supervisor restarts.
#[async_trait]
pub trait CrashLog: Send + Sync {
    async fn append(&self, record: &CrashRecord) -> Result<()>;

    /// Most recent records first.
    async fn recent(&self, limit: usize) -> Result<Vec<CrashRecord>>;
}
