pub mod crash_log;
pub mod sqlite;
pub mod store;

pub use crash_log::{CrashLog, CrashRecord};
pub use sqlite::SqliteStore;
pub use store::{ConversationConfig, MessageStore, Page, ToolInit};
