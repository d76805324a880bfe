use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{JobCompletion, JobError};
use crate::scheduler::JobScheduler;

/// Minimum connectivity a job demands before it may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reachability {
    /// Any route to the network.
    Any,
    /// Cellular or better.
    Cellular,
    /// Wi-Fi only.
    Wifi,
}

/// What to do when a job with the same unique name is already scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UniquePolicy {
    /// Reject the incoming job.
    DropIncoming,
    /// Cancel the existing job, then schedule the incoming one.
    DropExisting,
    /// Reject the incoming job and log loudly.
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueConstraint {
    pub name: String,
    pub policy: UniquePolicy,
}

/// Scheduling priority hint. The scheduler does not reorder on it today; it
/// travels with the job so hosts can surface it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityOfService {
    Background,
    Utility,
    #[default]
    Standard,
    UserInitiated,
}

/// Repeat the job `count` times total, `interval` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Periodic {
    pub count: u32,
    pub interval: Duration,
}

/// Per-job lifecycle state, persisted on every transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Scheduled,
    WaitingForConstraint,
    Queued,
    Running,
    Retrying,
    Terminated,
}

/// The full constraint set a job is scheduled with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConstraints {
    pub network: Option<Reachability>,
    pub persist: bool,
    pub delay: Option<Duration>,
    pub deadline: Option<DateTime<Utc>>,
    pub unique: Option<UniqueConstraint>,
    /// Retries after the first attempt; -1 means unbounded.
    pub max_retries: i32,
    pub periodic: Option<Periodic>,
    pub qos: QualityOfService,
    pub tags: HashSet<String>,
    pub require_charging: bool,
    /// Per-attempt wall-clock limit.
    pub timeout: Option<Duration>,
}

/// Serializable description of a scheduled job: everything needed to
/// recreate it after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub uuid: Uuid,
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub constraints: JobConstraints,
    #[serde(default)]
    pub state: JobState,
    #[serde(default)]
    pub attempt: u32,
}

impl JobSpec {
    /// Serializer bucket this job runs in; defaults to its type.
    pub fn group_key(&self) -> &str {
        self.group.as_deref().unwrap_or(&self.job_type)
    }
}

/// Policy answer from `Job::on_retry` after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryConstraint {
    /// Run again after a fixed delay.
    Retry { delay: Duration },
    /// Run again after a delay dictated by the failure (e.g. Retry-After).
    RetryAfter { delay: Duration },
    /// Run again after `initial * 2^(attempt-1)`.
    Exponential { initial: Duration },
    /// Give up; the job terminates with `on_retry_cancel`.
    Cancel,
}

/// The work itself, implemented by the scheduler's consumer.
#[async_trait]
pub trait Job: Send + Sync {
    /// Perform one attempt.
    async fn on_run(&self) -> anyhow::Result<()>;

    /// Decide how to proceed after a failed attempt. Only consulted while
    /// retries remain.
    async fn on_retry(&self, _error: &anyhow::Error) -> RetryConstraint {
        RetryConstraint::Retry {
            delay: Duration::ZERO,
        }
    }

    /// Terminal callback, fired exactly once per job.
    async fn on_remove(&self, _completion: &JobCompletion) {}
}

/// Instantiates a [`Job`] from its spec; the job type string selects the
/// creator, both for fresh schedules and for jobs restored from persistence.
pub trait JobCreator: Send + Sync {
    fn create(&self, spec: &JobSpec) -> anyhow::Result<Box<dyn Job>>;
}

/// Fluent construction of a [`JobSpec`].
///
/// ```ignore
/// JobBuilder::new("SendBatchingMessageJob")
///     .internet(Reachability::Any)
///     .persist()
///     .retry(-1)
///     .schedule(&scheduler)
///     .await?;
/// ```
pub struct JobBuilder {
    spec: JobSpec,
}

impl JobBuilder {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            spec: JobSpec {
                uuid: Uuid::new_v4(),
                job_type: job_type.into(),
                group: None,
                params: serde_json::Map::new(),
                constraints: JobConstraints::default(),
                state: JobState::Scheduled,
                attempt: 0,
            },
        }
    }

    /// Replace the whole payload map.
    pub fn params(mut self, params: serde_json::Map<String, serde_json::Value>) -> Self {
        self.spec.params = params;
        self
    }

    /// Set a single payload entry.
    pub fn param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.spec.params.insert(key.into(), value);
        self
    }

    /// Serializer bucket; jobs sharing a group run one at a time.
    pub fn group(mut self, name: impl Into<String>) -> Self {
        self.spec.group = Some(name.into());
        self
    }

    /// Gate the job on network reachability.
    pub fn internet(mut self, at_least: Reachability) -> Self {
        self.spec.constraints.network = Some(at_least);
        self
    }

    /// Serialize the job across restarts.
    pub fn persist(mut self) -> Self {
        self.spec.constraints.persist = true;
        self
    }

    /// Earliest-run time is schedule time plus `delay`.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.spec.constraints.delay = Some(delay);
        self
    }

    /// Fail with a deadline error if not completed by `instant`.
    pub fn deadline(mut self, instant: DateTime<Utc>) -> Self {
        self.spec.constraints.deadline = Some(instant);
        self
    }

    /// Deduplicate by name according to `policy`.
    pub fn unique(mut self, name: impl Into<String>, policy: UniquePolicy) -> Self {
        self.spec.constraints.unique = Some(UniqueConstraint {
            name: name.into(),
            policy,
        });
        self
    }

    /// Maximum retry attempts after the first run; -1 is unbounded.
    pub fn retry(mut self, max: i32) -> Self {
        self.spec.constraints.max_retries = max;
        self
    }

    /// Run `count` times total, spaced by `interval`.
    pub fn periodic(mut self, count: u32, interval: Duration) -> Self {
        self.spec.constraints.periodic = Some(Periodic { count, interval });
        self
    }

    /// Scheduling priority hint.
    pub fn service(mut self, qos: QualityOfService) -> Self {
        self.spec.constraints.qos = qos;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.spec.constraints.tags.insert(tag.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec
            .constraints
            .tags
            .extend(tags.into_iter().map(Into::into));
        self
    }

    /// Gate the job on AC power.
    pub fn require_charging(mut self) -> Self {
        self.spec.constraints.require_charging = true;
        self
    }

    /// Per-attempt wall-clock limit.
    pub fn timeout(mut self, limit: Duration) -> Self {
        self.spec.constraints.timeout = Some(limit);
        self
    }

    /// Finish without scheduling; used by tests and custom pipelines.
    pub fn build(self) -> JobSpec {
        self.spec
    }

    /// Hand the job to the scheduler.
    pub async fn schedule(self, scheduler: &JobScheduler) -> Result<Uuid, JobError> {
        scheduler.schedule(self.spec).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_sets_constraints() {
        let deadline = Utc::now() + chrono::Duration::hours(1);
        let spec = JobBuilder::new("upload")
            .group("io")
            .internet(Reachability::Wifi)
            .persist()
            .delay(Duration::from_secs(5))
            .deadline(deadline)
            .unique("upload-1", UniquePolicy::DropExisting)
            .retry(3)
            .periodic(2, Duration::from_secs(60))
            .service(QualityOfService::Background)
            .tags(["telemetry", "bulk"])
            .require_charging()
            .timeout(Duration::from_secs(30))
            .build();

        assert_eq!(spec.job_type, "upload");
        assert_eq!(spec.group_key(), "io");
        assert_eq!(spec.constraints.network, Some(Reachability::Wifi));
        assert!(spec.constraints.persist);
        assert_eq!(spec.constraints.delay, Some(Duration::from_secs(5)));
        assert_eq!(spec.constraints.deadline, Some(deadline));
        assert_eq!(
            spec.constraints.unique,
            Some(UniqueConstraint {
                name: "upload-1".to_string(),
                policy: UniquePolicy::DropExisting,
            })
        );
        assert_eq!(spec.constraints.max_retries, 3);
        assert_eq!(
            spec.constraints.periodic,
            Some(Periodic {
                count: 2,
                interval: Duration::from_secs(60),
            })
        );
        assert_eq!(spec.constraints.qos, QualityOfService::Background);
        assert_eq!(spec.constraints.tags.len(), 2);
        assert!(spec.constraints.require_charging);
        assert_eq!(spec.constraints.timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_group_defaults_to_job_type() {
        let spec = JobBuilder::new("cleanup").build();
        assert_eq!(spec.group_key(), "cleanup");
    }

    #[test]
    fn test_spec_serde_roundtrip() {
        let spec = JobBuilder::new("send")
            .param("messages", serde_json::json!([{"id": "m1"}]))
            .internet(Reachability::Any)
            .persist()
            .retry(-1)
            .build();

        let blob = serde_json::to_string(&spec).unwrap();
        let restored: JobSpec = serde_json::from_str(&blob).unwrap();

        assert_eq!(restored.uuid, spec.uuid);
        assert_eq!(restored.job_type, "send");
        assert_eq!(restored.params["messages"][0]["id"], "m1");
        assert_eq!(restored.constraints.max_retries, -1);
        assert!(restored.constraints.persist);
        assert_eq!(restored.state, JobState::Scheduled);
    }
}
