use async_trait::async_trait;
use rf_common::Message;
use rf_queue::MessageConsumer;
use rf_scheduler::{JobBuilder, JobScheduler, QualityOfService, Reachability};
use tracing::debug;

use crate::send_job::{DeliveryConfig, SEND_BATCH_JOB_TYPE};

/// Adapts queue batches into scheduled delivery jobs.
///
/// `consume` succeeds once the job is durably scheduled; unbounded retries
/// on the job side mean a scheduled batch is never abandoned on transient
/// network failure.
pub struct DeliveryConsumer {
    scheduler: JobScheduler,
    config: DeliveryConfig,
}

impl DeliveryConsumer {
    pub fn new(scheduler: JobScheduler, config: DeliveryConfig) -> Self {
        Self { scheduler, config }
    }
}

#[async_trait]
impl MessageConsumer for DeliveryConsumer {
    async fn consume(&self, batch: Vec<Message>) -> anyhow::Result<()> {
        let count = batch.len();
        let uuid = JobBuilder::new(SEND_BATCH_JOB_TYPE)
            .param("messages", serde_json::to_value(&batch)?)
            .param("configuration", serde_json::to_value(&self.config)?)
            .internet(Reachability::Any)
            .persist()
            .service(QualityOfService::Background)
            .retry(-1)
            .schedule(&self.scheduler)
            .await?;

        debug!(job = %uuid, count, "Delivery job scheduled");
        Ok(())
    }
}
