//! Durable FIFO storage for telemetry messages
//!
//! One storage instance backs one queue. [`SqliteStorage`] is the durable
//! default; [`MemoryStorage`] is the in-process fallback used when the
//! database cannot be opened.

use async_trait::async_trait;
use rf_common::Message;

pub mod error;
mod memory;
mod sqlite;

pub use error::StorageError;
pub use memory::MemoryStorage;
pub use sqlite::{storage_path, SqliteStorage};

pub type Result<T> = std::result::Result<T, StorageError>;

/// FIFO durable log of messages.
///
/// Implementations serialize their own operations; callers see a total order
/// equal to call-acceptance order. Fetch is non-destructive: consuming a
/// batch requires an explicit `delete` of its ids.
#[async_trait]
pub trait MessageStorage: Send + Sync {
    /// Append a message, preserving arrival order. Storing an id that
    /// already exists is a no-op.
    async fn store(&self, message: &Message) -> Result<()>;

    /// Return the oldest `limit` messages in insertion order.
    async fn fetch(&self, limit: usize) -> Result<Vec<Message>>;

    /// Remove messages by id. Unknown ids are ignored; an empty set is a
    /// no-op.
    async fn delete(&self, ids: &[String]) -> Result<()>;

    /// Count of stored messages.
    async fn size(&self) -> Result<usize>;

    /// Remove everything.
    async fn clear(&self) -> Result<()>;
}
