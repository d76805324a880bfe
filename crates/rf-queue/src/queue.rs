use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rf_common::Message;
use rf_storage::{storage_path, MemoryStorage, MessageStorage, SqliteStorage, StorageError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{MessageConsumer, QueueOptions};

/// Fetch limit when no batching window is configured.
const DEFAULT_FETCH_LIMIT: usize = 100;

/// Pause after a consumer failure before giving up the drain.
const CONSUME_FAILURE_PAUSE: Duration = Duration::from_millis(100);

/// Pause after a storage fetch failure before giving up the drain.
const FETCH_FAILURE_PAUSE: Duration = Duration::from_millis(500);

/// Queue lifecycle. `Stopped` is terminal for the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Idle,
    Processing,
    Stopped,
}

/// Durable FIFO queue feeding a [`MessageConsumer`].
///
/// All mutation funnels through the inner drain guard, so no two drains ever
/// run concurrently against the same instance.
pub struct MessageQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    name: String,
    options: QueueOptions,
    storage: Arc<dyn MessageStorage>,
    consumer: Arc<dyn MessageConsumer>,
    state: Mutex<QueueState>,
    drain_lock: tokio::sync::Mutex<()>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl MessageQueue {
    /// Open the queue's database and build the queue around it.
    ///
    /// If the database cannot be opened the queue falls back to in-memory
    /// storage: emission keeps working, but buffered events will not survive
    /// a restart.
    pub async fn new(
        name: impl Into<String>,
        options: QueueOptions,
        consumer: Arc<dyn MessageConsumer>,
    ) -> Self {
        let name = name.into();
        let storage: Arc<dyn MessageStorage> =
            match SqliteStorage::open(&storage_path(&name)).await {
                Ok(storage) => Arc::new(storage),
                Err(e) => {
                    warn!(
                        queue = %name,
                        error = %e,
                        "Could not open message database, falling back to in-memory storage"
                    );
                    Arc::new(MemoryStorage::new())
                }
            };
        Self::with_storage(name, options, storage, consumer)
    }

    /// Build the queue over an explicit storage backend.
    pub fn with_storage(
        name: impl Into<String>,
        options: QueueOptions,
        storage: Arc<dyn MessageStorage>,
        consumer: Arc<dyn MessageConsumer>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name: name.into(),
                options,
                storage,
                consumer,
                state: Mutex::new(QueueState::Idle),
                drain_lock: tokio::sync::Mutex::new(()),
                timer: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> QueueState {
        *self.inner.state.lock()
    }

    /// Append a message and kick the batching trigger.
    ///
    /// Durable before return; never blocks on delivery and never surfaces an
    /// error. Emission failures are logged and swallowed.
    pub async fn emit(&self, message: Message) {
        if let Err(e) = self.inner.storage.store(&message).await {
            warn!(queue = %self.inner.name, message_id = %message.id, error = %e, "Failed to store message");
            return;
        }
        debug!(queue = %self.inner.name, message_id = %message.id, "Message stored");
        QueueInner::trigger_processing_if_needed(&self.inner);
    }

    /// Count of buffered messages.
    pub async fn size(&self) -> Result<usize, StorageError> {
        self.inner.storage.size().await
    }

    /// Cancel the batch timer and drop everything buffered.
    pub async fn clear_queue(&self) -> Result<(), StorageError> {
        self.inner.cancel_timer();
        self.inner.storage.clear().await
    }

    /// Transition `idle -> processing`: drain any backlog once, then start
    /// the periodic batch timer when batching is configured.
    pub async fn start_runloop(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state != QueueState::Idle {
                debug!(queue = %self.inner.name, state = ?*state, "Runloop start ignored");
                return;
            }
            *state = QueueState::Processing;
        }
        info!(queue = %self.inner.name, "Queue runloop started");

        self.inner.drain().await;

        if let Some(window) = &self.inner.options.batching {
            QueueInner::spawn_timer(&self.inner, window.time_window);
        }
    }

    /// Terminal stop: no further batches are consumed by this instance.
    /// Emitted messages still reach storage.
    pub fn stop(&self) {
        *self.inner.state.lock() = QueueState::Stopped;
        self.inner.cancel_timer();
        info!(queue = %self.inner.name, "Queue stopped");
    }

    /// One-shot drain, used for final flushes on shutdown. No-op unless the
    /// queue is processing.
    pub async fn flush(&self) {
        if *self.inner.state.lock() == QueueState::Processing {
            self.inner.drain().await;
        }
    }
}

impl QueueInner {
    /// Count-or-immediate trigger evaluated after each emit. The drain runs
    /// on its own task so producers never wait on delivery.
    fn trigger_processing_if_needed(inner: &Arc<Self>) {
        if *inner.state.lock() != QueueState::Processing {
            return;
        }
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            let should_drain = match &inner.options.batching {
                None => true,
                Some(window) => match inner.storage.size().await {
                    Ok(size) => size >= window.max_count,
                    Err(e) => {
                        warn!(queue = %inner.name, error = %e, "Size check failed, deferring to timer");
                        false
                    }
                },
            };
            if should_drain {
                inner.drain().await;
            }
        });
    }

    fn spawn_timer(inner: &Arc<Self>, window: Duration) {
        let ticker_owner = Arc::clone(inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(window);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // interval's first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if *ticker_owner.state.lock() != QueueState::Processing {
                    break;
                }
                // Detached so cancelling the timer never kills an in-flight
                // consume; the drain guard serializes overlapping ticks.
                let drain_target = Arc::clone(&ticker_owner);
                tokio::spawn(async move {
                    drain_target.drain().await;
                });
            }
        });

        let mut timer = inner.timer.lock();
        if let Some(previous) = timer.replace(handle) {
            previous.abort();
        }
    }

    fn cancel_timer(&self) {
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
        }
    }

    /// Fetch-consume-delete until storage is empty or a failure halts
    /// progress. Batches that fail to consume are kept for the next trigger.
    async fn drain(&self) {
        let _guard = self.drain_lock.lock().await;

        let limit = self
            .options
            .batching
            .as_ref()
            .map(|w| w.max_count)
            .unwrap_or(DEFAULT_FETCH_LIMIT);

        loop {
            if *self.state.lock() != QueueState::Processing {
                break;
            }

            let batch = match self.storage.fetch(limit).await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(queue = %self.name, error = %e, "Fetch failed, pausing drain");
                    tokio::time::sleep(FETCH_FAILURE_PAUSE).await;
                    break;
                }
            };
            if batch.is_empty() {
                break;
            }

            let ids: Vec<String> = batch.iter().map(|m| m.id.clone()).collect();
            match self.consumer.consume(batch).await {
                Ok(()) => {
                    if let Err(e) = self.storage.delete(&ids).await {
                        warn!(queue = %self.name, error = %e, "Delete after consume failed");
                        break;
                    }
                    debug!(queue = %self.name, count = ids.len(), "Batch consumed");
                }
                Err(e) => {
                    warn!(queue = %self.name, error = %e, "Consumer failed, batch kept for retry");
                    tokio::time::sleep(CONSUME_FAILURE_PAUSE).await;
                    break;
                }
            }
        }
    }
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
        }
    }
}
