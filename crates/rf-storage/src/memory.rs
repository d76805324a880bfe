use std::collections::HashSet;

use async_trait::async_trait;
use rf_common::Message;
use tokio::sync::Mutex;

use crate::{MessageStorage, Result};

/// In-process fallback storage.
///
/// Used when the SQLite database cannot be opened. Contents do not survive a
/// restart; callers accept that trade when they reach for this backend.
#[derive(Default)]
pub struct MemoryStorage {
    messages: Mutex<Vec<Message>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStorage for MemoryStorage {
    async fn store(&self, message: &Message) -> Result<()> {
        let mut messages = self.messages.lock().await;
        if messages.iter().any(|m| m.id == message.id) {
            return Ok(());
        }
        messages.push(message.clone());
        Ok(())
    }

    async fn fetch(&self, limit: usize) -> Result<Vec<Message>> {
        let messages = self.messages.lock().await;
        Ok(messages.iter().take(limit).cloned().collect())
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let ids: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut messages = self.messages.lock().await;
        messages.retain(|m| !ids.contains(m.id.as_str()));
        Ok(())
    }

    async fn size(&self) -> Result<usize> {
        Ok(self.messages.lock().await.len())
    }

    async fn clear(&self) -> Result<()> {
        self.messages.lock().await.clear();
        Ok(())
    }
}
