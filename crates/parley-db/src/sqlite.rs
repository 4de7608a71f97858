use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_common::{ChatMessage, ConversationId, Error, MessageId, Result};
use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::crash_log::{CrashLog, CrashRecord};
use crate::store::{ConversationConfig, MessageStore, Page};

/// SQLite-backed message store and crash log.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("opening message store at {}", db_path.display());
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Database(format!("failed to create {}: {e}", parent.display()))
            })?;
        }

        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;

        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            conversation TEXT NOT NULL,
            sender TEXT NOT NULL,
            text TEXT NOT NULL,
            attachments TEXT NOT NULL DEFAULT '[]',
            metadata TEXT NOT NULL DEFAULT '{}',
            timestamp TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation);

        CREATE TABLE IF NOT EXISTS conversation_configs (
            conversation TEXT PRIMARY KEY,
            config TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS crash_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            actor TEXT NOT NULL,
            attempt INTEGER NOT NULL,
            error TEXT NOT NULL,
            at TEXT NOT NULL
        );",
    )
    .map_err(|e| Error::Database(format!("migration failed: {e}")))
}

type MessageRow = (String, String, String, String, String, String, String);

fn row_to_message(row: MessageRow) -> ChatMessage {
    let (id, conversation, sender, text, attachments, metadata, timestamp) = row;
    ChatMessage {
        id: MessageId(id),
        conversation: ConversationId(conversation),
        sender: sender.into(),
        text,
        attachments: serde_json::from_str(&attachments).unwrap_or_else(|e| {
            warn!("dropping unreadable attachments column: {e}");
            Vec::new()
        }),
        metadata: serde_json::from_str(&metadata).unwrap_or_else(|e| {
            warn!("dropping unreadable metadata column: {e}");
            Default::default()
        }),
        timestamp: parse_timestamp(&timestamp),
    }
}

fn read_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn create_message(&self, message: &ChatMessage) -> Result<()> {
        let attachments = serde_json::to_string(&message.attachments)?;
        let metadata = serde_json::to_string(&message.metadata)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO messages (id, conversation, sender, text, attachments, metadata, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.id.as_str(),
                message.conversation.as_str(),
                message.sender.as_str(),
                message.text,
                attachments,
                metadata,
                message.timestamp.to_rfc3339(),
            ],
        )
        .map_err(|e| Error::Database(format!("failed to create message: {e}")))?;
        Ok(())
    }

    async fn get_message(&self, id: &MessageId) -> Result<Option<ChatMessage>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT id, conversation, sender, text, attachments, metadata, timestamp
                 FROM messages WHERE id = ?1",
                params![id.as_str()],
                read_message_row,
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to load message: {e}")))?;
        Ok(row.map(row_to_message))
    }

    async fn list_messages(
        &self,
        conversation: &ConversationId,
        page: Page,
    ) -> Result<Vec<ChatMessage>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT id, conversation, sender, text, attachments, metadata, timestamp
                 FROM messages
                 WHERE conversation = ?1
                   AND (?2 IS NULL OR rowid < (SELECT rowid FROM messages WHERE id = ?2))
                 ORDER BY rowid DESC
                 LIMIT ?3",
            )
            .map_err(|e| Error::Database(format!("failed to prepare message query: {e}")))?;

        let before = page.before.as_ref().map(|id| id.as_str().to_string());
        let rows = stmt
            .query_map(
                params![conversation.as_str(), before, page.limit as i64],
                read_message_row,
            )
            .map_err(|e| Error::Database(format!("failed to list messages: {e}")))?;

        let mut messages = Vec::new();
        for row in rows {
            let row =
                row.map_err(|e| Error::Database(format!("failed to read message row: {e}")))?;
            messages.push(row_to_message(row));
        }
        messages.reverse();
        Ok(messages)
    }

    async fn conversation_config(
        &self,
        conversation: &ConversationId,
    ) -> Result<Option<ConversationConfig>> {
        let conn = self.conn.lock().await;
        let raw: Option<String> = conn
            .query_row(
                "SELECT config FROM conversation_configs WHERE conversation = ?1",
                params![conversation.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to load conversation config: {e}")))?;

        raw.map(|json| {
            serde_json::from_str(&json)
                .map_err(|e| Error::Database(format!("corrupt conversation config: {e}")))
        })
        .transpose()
    }

    async fn set_conversation_config(
        &self,
        conversation: &ConversationId,
        config: &ConversationConfig,
    ) -> Result<()> {
        let json = serde_json::to_string(config)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO conversation_configs (conversation, config)
             VALUES (?1, ?2)
             ON CONFLICT(conversation) DO UPDATE SET
               config = excluded.config,
               updated_at = datetime('now')",
            params![conversation.as_str(), json],
        )
        .map_err(|e| Error::Database(format!("failed to save conversation config: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl CrashLog for SqliteStore {
    async fn append(&self, record: &CrashRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO crash_log (actor, attempt, error, at) VALUES (?1, ?2, ?3, ?4)",
            params![
                record.actor,
                record.attempt,
                record.error,
                record.at.to_rfc3339()
            ],
        )
        .map_err(|e| Error::Database(format!("failed to append crash record: {e}")))?;
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<CrashRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT actor, attempt, error, at FROM crash_log ORDER BY id DESC LIMIT ?1",
            )
            .map_err(|e| Error::Database(format!("failed to prepare crash query: {e}")))?;

        let rows = stmt
            .query_map(params![limit as i64], |row| {
                let at: String = row.get(3)?;
                Ok(CrashRecord {
                    actor: row.get(0)?,
                    attempt: row.get(1)?,
                    error: row.get(2)?,
                    at: parse_timestamp(&at),
                })
            })
            .map_err(|e| Error::Database(format!("failed to load crash records: {e}")))?;

        let mut records = Vec::new();
        for row in rows {
            records
                .push(row.map_err(|e| Error::Database(format!("failed to read crash row: {e}")))?);
        }
        Ok(records)
    }
}
