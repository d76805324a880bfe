//! Job persistence
//!
//! Persisted jobs are opaque blobs keyed by `(queue_name, job_uuid)`;
//! restore returns a queue's blobs in the order they were first put. The
//! file backend keeps one JSON document per queue under a base directory;
//! any ordered persistent map satisfies the contract.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Serialized-job store. Implementations must be safe for concurrent access
/// from scheduler workers.
#[async_trait]
pub trait JobPersister: Send + Sync {
    /// All blobs for a queue, in original insertion order.
    async fn restore(&self, queue_name: &str) -> anyhow::Result<Vec<String>>;

    /// Upsert: a known uuid keeps its slot, a new one appends.
    async fn put(&self, queue_name: &str, job_uuid: &str, blob: &str) -> anyhow::Result<()>;

    async fn remove(&self, queue_name: &str, job_uuid: &str) -> anyhow::Result<()>;

    async fn clear_all(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedEntry {
    uuid: String,
    blob: String,
}

/// In-memory persister for tests and non-durable hosts.
#[derive(Default)]
pub struct MemoryPersister {
    queues: Mutex<HashMap<String, Vec<PersistedEntry>>>,
}

impl MemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobPersister for MemoryPersister {
    async fn restore(&self, queue_name: &str) -> anyhow::Result<Vec<String>> {
        let queues = self.queues.lock();
        Ok(queues
            .get(queue_name)
            .map(|entries| entries.iter().map(|e| e.blob.clone()).collect())
            .unwrap_or_default())
    }

    async fn put(&self, queue_name: &str, job_uuid: &str, blob: &str) -> anyhow::Result<()> {
        let mut queues = self.queues.lock();
        let entries = queues.entry(queue_name.to_string()).or_default();
        if let Some(existing) = entries.iter_mut().find(|e| e.uuid == job_uuid) {
            existing.blob = blob.to_string();
        } else {
            entries.push(PersistedEntry {
                uuid: job_uuid.to_string(),
                blob: blob.to_string(),
            });
        }
        Ok(())
    }

    async fn remove(&self, queue_name: &str, job_uuid: &str) -> anyhow::Result<()> {
        let mut queues = self.queues.lock();
        if let Some(entries) = queues.get_mut(queue_name) {
            entries.retain(|e| e.uuid != job_uuid);
        }
        Ok(())
    }

    async fn clear_all(&self) -> anyhow::Result<()> {
        self.queues.lock().clear();
        Ok(())
    }
}

/// File-backed persister: `<dir>/<queue_name>.jobs.json`, one ordered array
/// per queue. The file is rewritten whole on each mutation; job state
/// changes are low-frequency compared to message traffic.
pub struct FilePersister {
    dir: PathBuf,
    io_lock: tokio::sync::Mutex<()>,
}

impl FilePersister {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            io_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn queue_file(&self, queue_name: &str) -> PathBuf {
        self.dir.join(format!("{queue_name}.jobs.json"))
    }

    async fn load(&self, queue_name: &str) -> Vec<PersistedEntry> {
        let path = self.queue_file(queue_name);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Discarding unreadable job file");
                Vec::new()
            }),
            Err(_) => Vec::new(),
        }
    }

    async fn save(&self, queue_name: &str, entries: &[PersistedEntry]) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let raw = serde_json::to_string_pretty(entries)?;
        tokio::fs::write(self.queue_file(queue_name), raw).await?;
        Ok(())
    }
}

#[async_trait]
impl JobPersister for FilePersister {
    async fn restore(&self, queue_name: &str) -> anyhow::Result<Vec<String>> {
        let _guard = self.io_lock.lock().await;
        Ok(self
            .load(queue_name)
            .await
            .into_iter()
            .map(|e| e.blob)
            .collect())
    }

    async fn put(&self, queue_name: &str, job_uuid: &str, blob: &str) -> anyhow::Result<()> {
        let _guard = self.io_lock.lock().await;
        let mut entries = self.load(queue_name).await;
        if let Some(existing) = entries.iter_mut().find(|e| e.uuid == job_uuid) {
            existing.blob = blob.to_string();
        } else {
            entries.push(PersistedEntry {
                uuid: job_uuid.to_string(),
                blob: blob.to_string(),
            });
        }
        self.save(queue_name, &entries).await
    }

    async fn remove(&self, queue_name: &str, job_uuid: &str) -> anyhow::Result<()> {
        let _guard = self.io_lock.lock().await;
        let mut entries = self.load(queue_name).await;
        let before = entries.len();
        entries.retain(|e| e.uuid != job_uuid);
        if entries.len() != before {
            self.save(queue_name, &entries).await?;
        }
        Ok(())
    }

    async fn clear_all(&self) -> anyhow::Result<()> {
        let _guard = self.io_lock.lock().await;
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(_) => return Ok(()),
        };
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            if name.to_string_lossy().ends_with(".jobs.json") {
                tokio::fs::remove_file(entry.path()).await?;
            }
        }
        Ok(())
    }
}
