use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rf_common::Message;
use rf_config::SdkConfig;
use rf_scheduler::{Job, JobCompletion, JobCreator, JobSpec, RetryConstraint};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::payload::BatchPayload;

/// Job type string; selects [`SendBatchJobCreator`] in the scheduler
/// registry, both for fresh batches and for batches restored after a
/// restart.
pub const SEND_BATCH_JOB_TYPE: &str = "SendBatchingMessageJob";

/// First retry backoff; doubles per attempt.
const RETRY_INITIAL_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("HTTP status {0}")]
    Http(u16),

    #[error("transport error: {0}")]
    Transport(String),
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Endpoint settings carried inside the job params, so a restored job can
/// rebuild its HTTP client without access to live SDK state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryConfig {
    pub server_url: String,
    pub api_key: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            server_url: rf_config::DEFAULT_SERVER_URL.to_string(),
            api_key: String::new(),
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl From<&SdkConfig> for DeliveryConfig {
    fn from(config: &SdkConfig) -> Self {
        Self {
            server_url: config.server_url.clone(),
            api_key: config.api_key.clone(),
            ..Self::default()
        }
    }
}

/// One batch upload: `POST {serverUrl}/batch` with `X-API-Key`.
///
/// Any non-2xx status and any transport error is transient here: the server
/// deduplicates by message id, so resending is always safe.
pub struct SendBatchJob {
    messages: Vec<Message>,
    config: DeliveryConfig,
    client: reqwest::Client,
}

impl SendBatchJob {
    pub fn new(messages: Vec<Message>, config: DeliveryConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            messages,
            config,
            client,
        })
    }

    fn batch_url(&self) -> String {
        format!("{}/batch", self.config.server_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Job for SendBatchJob {
    async fn on_run(&self) -> anyhow::Result<()> {
        let url = self.batch_url();
        let payload = BatchPayload::new(&self.messages, Utc::now());
        debug!(count = self.messages.len(), url = %url, "Uploading batch");

        let response = self
            .client
            .post(&url)
            .header("X-API-Key", &self.config.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| NetworkError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            debug!(count = self.messages.len(), status = status.as_u16(), "Batch accepted");
            Ok(())
        } else {
            warn!(status = status.as_u16(), "Batch upload rejected");
            Err(NetworkError::Http(status.as_u16()).into())
        }
    }

    async fn on_retry(&self, error: &anyhow::Error) -> RetryConstraint {
        debug!(error = %error, "Delivery failed, backing off");
        RetryConstraint::Exponential {
            initial: RETRY_INITIAL_BACKOFF,
        }
    }

    async fn on_remove(&self, completion: &JobCompletion) {
        match completion {
            Ok(()) => debug!(count = self.messages.len(), "Delivery job finished"),
            Err(e) => warn!(count = self.messages.len(), error = %e, "Delivery job removed without success"),
        }
    }
}

/// Rebuilds a [`SendBatchJob`] from its persisted params:
/// `{"messages": [...], "configuration": {...}}`.
pub struct SendBatchJobCreator;

impl JobCreator for SendBatchJobCreator {
    fn create(&self, spec: &JobSpec) -> anyhow::Result<Box<dyn Job>> {
        let messages = spec
            .params
            .get("messages")
            .ok_or_else(|| anyhow::anyhow!("send job missing messages param"))?;
        let messages: Vec<Message> = serde_json::from_value(messages.clone())?;

        let config = spec
            .params
            .get("configuration")
            .ok_or_else(|| anyhow::anyhow!("send job missing configuration param"))?;
        let config: DeliveryConfig = serde_json::from_value(config.clone())?;

        Ok(Box::new(SendBatchJob::new(messages, config)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rf_common::MessageContext;
    use serde_json::json;

    #[test]
    fn test_batch_url_tolerates_trailing_slash() {
        let mut config = DeliveryConfig::default();
        config.server_url = "https://collector.example.com/".to_string();
        let job = SendBatchJob::new(Vec::new(), config).unwrap();
        assert_eq!(job.batch_url(), "https://collector.example.com/batch");
    }

    #[test]
    fn test_creator_rebuilds_from_params() {
        let raw = json!({"k": 1});
        let message = Message::track("evt", raw.as_object().unwrap(), MessageContext::default());

        let spec = rf_scheduler::JobBuilder::new(SEND_BATCH_JOB_TYPE)
            .param("messages", serde_json::to_value(vec![message.clone()]).unwrap())
            .param(
                "configuration",
                serde_json::to_value(DeliveryConfig {
                    server_url: "https://collector.example.com".to_string(),
                    api_key: "wk".to_string(),
                    ..DeliveryConfig::default()
                })
                .unwrap(),
            )
            .build();

        let job = SendBatchJobCreator.create(&spec).unwrap();
        drop(job);
    }

    #[test]
    fn test_creator_rejects_missing_params() {
        let spec = rf_scheduler::JobBuilder::new(SEND_BATCH_JOB_TYPE).build();
        assert!(SendBatchJobCreator.create(&spec).is_err());
    }
}
