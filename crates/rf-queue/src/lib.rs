//! Telemetry message queue
//!
//! Buffers messages in a [`rf_storage::MessageStorage`] backend and hands
//! them to a [`MessageConsumer`] in FIFO batches, triggered by count or
//! timer. The queue never drops data on consumer failure: undelivered
//! batches stay in storage and are retried on the next trigger.

use std::time::Duration;

use async_trait::async_trait;
use rf_common::Message;

mod queue;

pub use queue::{MessageQueue, QueueState};

/// Batch trigger configuration: drain when `max_count` messages have
/// accumulated, or every `time_window`, whichever fires first.
#[derive(Debug, Clone)]
pub struct BatchingWindow {
    pub time_window: Duration,
    pub max_count: usize,
}

/// Queue configuration. Without a batching window, every emit triggers an
/// immediate drain.
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    pub batching: Option<BatchingWindow>,
}

impl QueueOptions {
    /// Deliver each message as soon as it is emitted.
    pub fn immediate() -> Self {
        Self { batching: None }
    }

    /// Deliver in batches of up to `max_count`, flushed every `time_window`.
    pub fn batched(time_window: Duration, max_count: usize) -> Self {
        Self {
            batching: Some(BatchingWindow {
                time_window,
                max_count,
            }),
        }
    }
}

/// Receiver for drained batches.
///
/// Returning `Ok` means the batch has been handed off durably and the queue
/// may delete it from storage. Returning an error keeps the batch in place
/// for a later attempt.
#[async_trait]
pub trait MessageConsumer: Send + Sync {
    async fn consume(&self, batch: Vec<Message>) -> anyhow::Result<()>;
}
