use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::DateTime;
use rf_common::{Message, MessageType};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info};

use crate::{MessageStorage, Result, StorageError};

/// Database file location for a named queue: `<documents_dir>/<name>.db`,
/// falling back to the temp dir on hosts without a documents directory.
pub fn storage_path(queue_name: &str) -> PathBuf {
    let base = dirs::document_dir().unwrap_or_else(std::env::temp_dir);
    base.join(format!("{queue_name}.db"))
}

/// SQLite-backed message log.
///
/// Owns a single connection; sqlx serializes statements on it, which gives
/// every call atomicity and keeps insertion order total.
pub struct SqliteStorage {
    pool: Pool<Sqlite>,
}

impl SqliteStorage {
    /// Open (creating if needed) the database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Database(format!("create {}: {e}", parent.display())))?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await?;

        let storage = Self { pool };
        storage.create_schema().await?;
        info!(path = %path.display(), "Message database opened");
        Ok(storage)
    }

    /// In-memory database, used by tests.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let storage = Self { pool };
        storage.create_schema().await?;
        Ok(storage)
    }

    /// Close the underlying connection, releasing the database file.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn create_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                user_id TEXT,
                anonymous_id TEXT,
                timestamp REAL NOT NULL,
                api_version TEXT NOT NULL,
                event TEXT,
                properties TEXT,
                traits TEXT,
                context TEXT NOT NULL,
                created_at REAL NOT NULL DEFAULT (julianday('now'))
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_messages_created_at
            ON messages (created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_message(row: &SqliteRow) -> Result<Message> {
        let type_name: String = row.get("type");
        let message_type = MessageType::parse(&type_name)
            .ok_or_else(|| StorageError::Database(format!("unknown message type: {type_name}")))?;

        let timestamp_secs: f64 = row.get("timestamp");
        let timestamp = DateTime::from_timestamp_micros((timestamp_secs * 1e6).round() as i64)
            .ok_or_else(|| {
                StorageError::Database(format!("timestamp out of range: {timestamp_secs}"))
            })?;

        let properties: Option<String> = row.get("properties");
        let traits: Option<String> = row.get("traits");
        let context: String = row.get("context");

        Ok(Message {
            id: row.get("id"),
            message_type,
            user_id: row.get("user_id"),
            anonymous_id: row.get("anonymous_id"),
            timestamp,
            api_version: row.get("api_version"),
            event: row.get("event"),
            properties: properties.map(|raw| serde_json::from_str(&raw)).transpose()?,
            traits: traits.map(|raw| serde_json::from_str(&raw)).transpose()?,
            context: serde_json::from_str(&context)?,
        })
    }
}

#[async_trait]
impl MessageStorage for SqliteStorage {
    async fn store(&self, message: &Message) -> Result<()> {
        let properties = message
            .properties
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let traits = message
            .traits
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let context = serde_json::to_string(&message.context)?;
        let timestamp = message.timestamp.timestamp_micros() as f64 / 1e6;

        // OR IGNORE: id is the dedup key, a repeated store keeps the original
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO messages
                (id, type, user_id, anonymous_id, timestamp, api_version, event, properties, traits, context)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.id)
        .bind(message.message_type.as_str())
        .bind(&message.user_id)
        .bind(&message.anonymous_id)
        .bind(timestamp)
        .bind(&message.api_version)
        .bind(&message.event)
        .bind(&properties)
        .bind(&traits)
        .bind(&context)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(message_id = %message.id, "Duplicate message id, skipping");
        }
        Ok(())
    }

    async fn fetch(&self, limit: usize) -> Result<Vec<Message>> {
        // rowid tie-break keeps insertion order when created_at collides
        let rows = sqlx::query(
            r#"
            SELECT id, type, user_id, anonymous_id, timestamp, api_version,
                   event, properties, traits, context
            FROM messages
            ORDER BY created_at ASC, rowid ASC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_message).collect()
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("DELETE FROM messages WHERE id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let result = query.execute(&self.pool).await?;

        debug!(
            requested = ids.len(),
            deleted = result.rows_affected(),
            "Deleted messages"
        );
        Ok(())
    }

    async fn size(&self) -> Result<usize> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM messages")
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.get("count");
        Ok(count as usize)
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM messages").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rf_common::MessageContext;
    use serde_json::json;

    fn test_message(id: &str) -> Message {
        let raw = json!({"step": 1, "label": id});
        let mut msg = Message::track("test_event", raw.as_object().unwrap(), MessageContext::default());
        msg.id = id.to_string();
        msg.anonymous_id = Some("anon".to_string());
        msg
    }

    #[tokio::test]
    async fn test_store_and_fetch_fifo() {
        let storage = SqliteStorage::open_in_memory().await.unwrap();

        for i in 0..5 {
            storage.store(&test_message(&format!("msg_{i}"))).await.unwrap();
        }

        let fetched = storage.fetch(10).await.unwrap();
        let ids: Vec<&str> = fetched.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["msg_0", "msg_1", "msg_2", "msg_3", "msg_4"]);

        // Limit returns the oldest prefix
        let first_two = storage.fetch(2).await.unwrap();
        assert_eq!(first_two[0].id, "msg_0");
        assert_eq!(first_two[1].id, "msg_1");
    }

    #[tokio::test]
    async fn test_roundtrip_preserves_fields() {
        let storage = SqliteStorage::open_in_memory().await.unwrap();
        let msg = test_message("full");
        storage.store(&msg).await.unwrap();

        let fetched = storage.fetch(1).await.unwrap().remove(0);
        assert_eq!(fetched.id, msg.id);
        assert_eq!(fetched.message_type, msg.message_type);
        assert_eq!(fetched.event, msg.event);
        assert_eq!(fetched.properties, msg.properties);
        assert_eq!(fetched.anonymous_id, msg.anonymous_id);
        assert_eq!(fetched.context, msg.context);
        // Stored as seconds-since-epoch double, microsecond precision survives
        assert_eq!(fetched.timestamp.timestamp_micros(), msg.timestamp.timestamp_micros());
    }

    #[tokio::test]
    async fn test_order_under_selective_delete() {
        let storage = SqliteStorage::open_in_memory().await.unwrap();
        for i in 0..10 {
            storage.store(&test_message(&i.to_string())).await.unwrap();
        }

        storage
            .delete(&["2".to_string(), "5".to_string(), "7".to_string()])
            .await
            .unwrap();

        let ids: Vec<String> = storage
            .fetch(10)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, ["0", "1", "3", "4", "6", "8", "9"]);
    }

    #[tokio::test]
    async fn test_size_and_missing_deletes() {
        let storage = SqliteStorage::open_in_memory().await.unwrap();
        for i in 0..4 {
            storage.store(&test_message(&format!("m{i}"))).await.unwrap();
        }
        assert_eq!(storage.size().await.unwrap(), 4);

        // Missing ids are ignored, empty input is a no-op
        storage.delete(&[]).await.unwrap();
        storage.delete(&["ghost".to_string()]).await.unwrap();
        assert_eq!(storage.size().await.unwrap(), 4);

        storage
            .delete(&["m0".to_string(), "m3".to_string(), "ghost".to_string()])
            .await
            .unwrap();
        assert_eq!(storage.size().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_clear() {
        let storage = SqliteStorage::open_in_memory().await.unwrap();
        for i in 0..3 {
            storage.store(&test_message(&format!("c{i}"))).await.unwrap();
        }

        storage.clear().await.unwrap();
        assert_eq!(storage.size().await.unwrap(), 0);
        assert!(storage.fetch(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_id_is_noop() {
        let storage = SqliteStorage::open_in_memory().await.unwrap();
        let original = test_message("dup");
        storage.store(&original).await.unwrap();

        let mut changed = test_message("dup");
        changed.event = Some("other_event".to_string());
        storage.store(&changed).await.unwrap();

        assert_eq!(storage.size().await.unwrap(), 1);
        let fetched = storage.fetch(1).await.unwrap().remove(0);
        assert_eq!(fetched.event.as_deref(), Some("test_event"));
    }

    #[tokio::test]
    async fn test_persistence_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persist-queue.db");

        let storage = SqliteStorage::open(&path).await.unwrap();
        for i in 0..5 {
            storage.store(&test_message(&format!("p{i}"))).await.unwrap();
        }
        storage.close().await;

        let reopened = SqliteStorage::open(&path).await.unwrap();
        assert_eq!(reopened.size().await.unwrap(), 5);
        let ids: Vec<String> = reopened
            .fetch(10)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, ["p0", "p1", "p2", "p3", "p4"]);
    }
}
