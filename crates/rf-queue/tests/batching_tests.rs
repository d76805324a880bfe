//! Batching behavior tests
//!
//! End-to-end runs of the queue against a recording consumer:
//! - count-triggered batches split at max_count in FIFO order
//! - timer-triggered batches collect everything present at tick time
//! - mixed triggers fire on whichever condition is hit first
//! - consumer failures keep messages until recovery
//! - a fresh queue over the same database delivers the backlog

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use rf_common::{Message, MessageContext};
use rf_queue::{MessageConsumer, MessageQueue, QueueOptions};
use rf_storage::{MemoryStorage, SqliteStorage};

struct RecordingConsumer {
    batches: Mutex<Vec<Vec<String>>>,
    fail: AtomicBool,
}

impl RecordingConsumer {
    fn new() -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        }
    }

    fn batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().clone()
    }

    fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().iter().map(|b| b.len()).collect()
    }

    fn delivered_ids(&self) -> Vec<String> {
        self.batches.lock().iter().flatten().cloned().collect()
    }

    fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageConsumer for RecordingConsumer {
    async fn consume(&self, batch: Vec<Message>) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("consumer unavailable");
        }
        self.batches
            .lock()
            .push(batch.into_iter().map(|m| m.id).collect());
        Ok(())
    }
}

fn test_message(id: &str) -> Message {
    let raw = json!({"seq": id});
    let mut msg = Message::track("batch_test", raw.as_object().unwrap(), MessageContext::default());
    msg.id = id.to_string();
    msg
}

fn memory_queue(options: QueueOptions, consumer: Arc<RecordingConsumer>) -> MessageQueue {
    MessageQueue::with_storage("batch-test", options, Arc::new(MemoryStorage::new()), consumer)
}

#[tokio::test]
async fn test_count_batching() {
    // max_count=3 with a timer window far beyond the test horizon: only the
    // count trigger can fire.
    let consumer = Arc::new(RecordingConsumer::new());
    let queue = memory_queue(
        QueueOptions::batched(Duration::from_secs(10), 3),
        consumer.clone(),
    );

    queue.start_runloop().await;
    for i in 0..6 {
        queue.emit(test_message(&format!("batch_{i:03}"))).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(
        consumer.batches(),
        vec![
            vec!["batch_000", "batch_001", "batch_002"],
            vec!["batch_003", "batch_004", "batch_005"],
        ]
    );
    assert_eq!(queue.size().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_time_batching() {
    // max_count far above the emit count: only the timer can fire, and one
    // tick collects everything present.
    let consumer = Arc::new(RecordingConsumer::new());
    let queue = memory_queue(
        QueueOptions::batched(Duration::from_millis(500), 100),
        consumer.clone(),
    );

    queue.start_runloop().await;
    queue.emit(test_message("time_1")).await;
    queue.emit(test_message("time_2")).await;

    // Before the window elapses nothing is delivered
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(consumer.batches().is_empty());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(consumer.batches(), vec![vec!["time_1", "time_2"]]);

    // Empty ticks produce no batch
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(consumer.batches().len(), 1);
}

#[tokio::test]
async fn test_mixed_triggering() {
    // First wave hits the count trigger, second wave waits for the timer.
    let consumer = Arc::new(RecordingConsumer::new());
    let queue = memory_queue(
        QueueOptions::batched(Duration::from_millis(1000), 3),
        consumer.clone(),
    );

    queue.start_runloop().await;
    for i in 0..3 {
        queue.emit(test_message(&format!("mixed1_{i:03}"))).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    for i in 0..2 {
        queue.emit(test_message(&format!("mixed2_{i:03}"))).await;
    }

    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(consumer.batch_sizes(), vec![3, 2]);
    assert_eq!(
        consumer.delivered_ids(),
        vec!["mixed1_000", "mixed1_001", "mixed1_002", "mixed2_000", "mixed2_001"]
    );
}

#[tokio::test]
async fn test_consumer_error_then_recovery() {
    let consumer = Arc::new(RecordingConsumer::new());
    consumer.set_fail(true);
    let queue = memory_queue(
        QueueOptions::batched(Duration::from_millis(200), 100),
        consumer.clone(),
    );

    queue.start_runloop().await;
    for i in 0..6 {
        queue.emit(test_message(&format!("retry_{i}"))).await;
    }

    // While the consumer errors, nothing is lost and nothing is delivered
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(queue.size().await.unwrap(), 6);
    assert!(consumer.batches().is_empty());

    consumer.set_fail(false);
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(queue.size().await.unwrap(), 0);
    assert_eq!(
        consumer.delivered_ids(),
        vec!["retry_0", "retry_1", "retry_2", "retry_3", "retry_4", "retry_5"]
    );
}

#[tokio::test]
async fn test_persistence_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("restart-queue.db");

    // First instance is stopped: emits reach storage, the consumer does not
    {
        let storage = Arc::new(SqliteStorage::open(&path).await.unwrap());
        let consumer = Arc::new(RecordingConsumer::new());
        let queue = MessageQueue::with_storage(
            "restart-queue",
            QueueOptions::immediate(),
            storage.clone(),
            consumer.clone(),
        );
        queue.stop();

        for i in 0..5 {
            queue.emit(test_message(&format!("persist_{i}"))).await;
        }
        assert_eq!(queue.size().await.unwrap(), 5);
        assert!(consumer.batches().is_empty());
        storage.close().await;
    }

    // A fresh instance over the same database delivers the backlog in order
    let storage = Arc::new(SqliteStorage::open(&path).await.unwrap());
    let consumer = Arc::new(RecordingConsumer::new());
    let queue = MessageQueue::with_storage(
        "restart-queue",
        QueueOptions::immediate(),
        storage,
        consumer.clone(),
    );
    queue.start_runloop().await;

    assert_eq!(
        consumer.delivered_ids(),
        vec!["persist_0", "persist_1", "persist_2", "persist_3", "persist_4"]
    );
    assert_eq!(queue.size().await.unwrap(), 0);
}

#[tokio::test]
async fn test_size_non_decreasing_while_consumer_fails() {
    let consumer = Arc::new(RecordingConsumer::new());
    consumer.set_fail(true);
    let queue = memory_queue(QueueOptions::immediate(), consumer.clone());

    queue.start_runloop().await;
    let mut last_size = 0;
    for i in 0..5 {
        queue.emit(test_message(&format!("nd_{i}"))).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let size = queue.size().await.unwrap();
        assert!(size >= last_size);
        last_size = size;
    }
    assert_eq!(last_size, 5);
}
