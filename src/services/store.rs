use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::config;
use crate::models::Conversation;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The durable store is out of space. Distinct from generic I/O so the
    /// caller can suggest clearing local data instead of a retry.
    #[error("Local storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Storage failure: {0}")]
    Io(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(err, ref msg) = e {
            if err.code == rusqlite::ErrorCode::DiskFull {
                return StoreError::QuotaExceeded(
                    msg.clone().unwrap_or_else(|| err.to_string()),
                );
            }
        }
        StoreError::Io(e.to_string())
    }
}

/// Durable adapter for the conversation list. Everything lives as one JSON
/// payload under a named slot; the in-memory repository is the source of
/// truth and this is only its commit target.
#[derive(Debug, Clone)]
pub struct ConversationStore {
    conn: Arc<Mutex<Connection>>,
}

impl ConversationStore {
    pub fn open_default() -> Result<Self, StoreError> {
        let path = Self::db_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Io(format!(
                    "Failed to create data directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let conn = Connection::open(&path)?;
        Self::with_connection(conn)
    }

    /// In-memory store, used in tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             CREATE TABLE IF NOT EXISTS store (
                 slot TEXT PRIMARY KEY,
                 payload TEXT NOT NULL
             );",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn db_path() -> Result<PathBuf, StoreError> {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|_| {
                std::env::var("HOME").map(|home| PathBuf::from(home).join(".local/share"))
            })
            .map_err(|_| StoreError::Io("Neither XDG_DATA_HOME nor HOME is set".to_string()))?;
        Ok(data_dir.join(config::APP_DIR).join("murmur.db"))
    }

    /// Commit the conversation list. Non-persistable fields (generated
    /// images) are dropped by the serialized projection. An empty list
    /// removes the slot entirely.
    pub async fn save(&self, conversations: &[Conversation]) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();

        if conversations.is_empty() {
            conn.execute("DELETE FROM store WHERE slot = ?1", params![config::STORE_SLOT])?;
            return Ok(());
        }

        let payload = serde_json::to_string(conversations)
            .map_err(|e| StoreError::Io(e.to_string()))?;
        conn.execute(
            "INSERT INTO store (slot, payload) VALUES (?1, ?2)
             ON CONFLICT(slot) DO UPDATE SET payload = excluded.payload",
            params![config::STORE_SLOT, payload],
        )?;

        Ok(())
    }

    /// Load the persisted list. An absent slot means a fresh start; a
    /// corrupt payload is erased and reported as empty so the failure does
    /// not repeat on every read.
    pub async fn load(&self) -> Result<Vec<Conversation>, StoreError> {
        let conn = self.conn.lock().unwrap();

        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM store WHERE slot = ?1",
                params![config::STORE_SLOT],
                |row| row.get(0),
            )
            .optional()?;

        let Some(payload) = payload else {
            return Ok(Vec::new());
        };

        match serde_json::from_str::<Vec<Conversation>>(&payload) {
            Ok(conversations) => Ok(conversations),
            Err(e) => {
                tracing::warn!("Discarding corrupt conversation record: {}", e);
                conn.execute("DELETE FROM store WHERE slot = ?1", params![config::STORE_SLOT])?;
                Ok(Vec::new())
            }
        }
    }
}

#[cfg(test)]
impl ConversationStore {
    /// Drop the backing table so the next write fails.
    pub(crate) fn poison(&self) {
        self.conn
            .lock()
            .unwrap()
            .execute_batch("DROP TABLE store")
            .unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GeneratedImage, LogicalModel, Message};

    fn conversation_with_message() -> Conversation {
        let mut conv = Conversation::new(LogicalModel::Flash);
        conv.messages.push(Message::user("hello", Vec::new()));
        conv
    }

    #[tokio::test]
    async fn save_load_roundtrip() {
        let store = ConversationStore::open_in_memory().unwrap();
        let conv = conversation_with_message();

        store.save(std::slice::from_ref(&conv)).await.unwrap();
        let loaded = store.load().await.unwrap();

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, conv.id);
        assert_eq!(loaded[0].messages[0].content, "hello");
    }

    #[tokio::test]
    async fn generated_images_are_stripped_by_persistence() {
        let store = ConversationStore::open_in_memory().unwrap();
        let mut conv = conversation_with_message();
        let mut msg = Message::error("here is your image");
        msg.images.push(GeneratedImage {
            mime_type: "image/png".to_string(),
            data: "cGl4ZWxz".to_string(),
        });
        let completed_at = msg.completed_at;
        conv.messages.push(msg);

        store.save(&[conv]).await.unwrap();
        let loaded = store.load().await.unwrap();

        let reloaded = &loaded[0].messages[1];
        assert!(reloaded.images.is_empty());
        assert_eq!(reloaded.content, "here is your image");
        assert_eq!(reloaded.completed_at, completed_at);
    }

    #[tokio::test]
    async fn empty_list_removes_the_slot() {
        let store = ConversationStore::open_in_memory().unwrap();
        store.save(&[conversation_with_message()]).await.unwrap();

        store.save(&[]).await.unwrap();

        let count: i64 = {
            let conn = store.conn.lock().unwrap();
            conn.query_row("SELECT COUNT(*) FROM store", [], |row| row.get(0))
                .unwrap()
        };
        assert_eq!(count, 0);
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_payload_is_erased_and_reported_empty() {
        let store = ConversationStore::open_in_memory().unwrap();
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO store (slot, payload) VALUES (?1, ?2)",
                params![config::STORE_SLOT, "{not json"],
            )
            .unwrap();
        }

        assert!(store.load().await.unwrap().is_empty());

        // The corrupt row is gone, so the next read hits the clean path
        let count: i64 = {
            let conn = store.conn.lock().unwrap();
            conn.query_row("SELECT COUNT(*) FROM store", [], |row| row.get(0))
                .unwrap()
        };
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn unknown_model_identifier_coerces_to_default() {
        let store = ConversationStore::open_in_memory().unwrap();
        let conv = conversation_with_message();
        store.save(&[conv]).await.unwrap();

        {
            let conn = store.conn.lock().unwrap();
            let payload: String = conn
                .query_row(
                    "SELECT payload FROM store WHERE slot = ?1",
                    params![config::STORE_SLOT],
                    |row| row.get(0),
                )
                .unwrap();
            let doctored = payload.replace("\"flash\"", "\"gemini-9000\"");
            conn.execute(
                "UPDATE store SET payload = ?1 WHERE slot = ?2",
                params![doctored, config::STORE_SLOT],
            )
            .unwrap();
        }

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded[0].model, LogicalModel::Flash);
    }
}
