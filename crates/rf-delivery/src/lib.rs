//! Batch delivery
//!
//! Bridges the message queue to the job scheduler: consuming a batch means
//! scheduling a persistent, network-gated send job, after which the job owns
//! delivery. The queue's copy of the batch is deleted the moment the job is
//! durably scheduled; retries from there on are the scheduler's business.

use rf_config::SdkConfig;
use rf_queue::QueueOptions;

mod consumer;
mod payload;
mod send_job;

pub use consumer::DeliveryConsumer;
pub use payload::{BatchItem, BatchPayload};
pub use send_job::{
    DeliveryConfig, NetworkError, SendBatchJob, SendBatchJobCreator, SEND_BATCH_JOB_TYPE,
};

/// Map SDK options onto queue batching behavior.
pub fn queue_options(config: &SdkConfig) -> QueueOptions {
    if config.use_batch {
        QueueOptions::batched(config.flush_interval_duration(), config.flush_queue_size)
    } else {
        QueueOptions::immediate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_options_follow_use_batch() {
        let mut config = SdkConfig::default();
        config.flush_queue_size = 7;

        let options = queue_options(&config);
        let window = options.batching.expect("batching enabled by default");
        assert_eq!(window.max_count, 7);
        assert_eq!(window.time_window, config.flush_interval_duration());

        config.use_batch = false;
        assert!(queue_options(&config).batching.is_none());
    }
}
