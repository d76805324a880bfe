use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backoff;
use crate::error::{JobCompletion, JobError};
use crate::job::{Job, JobCreator, JobSpec, JobState, Reachability, RetryConstraint, UniquePolicy};
use crate::monitor::{NetworkMonitor, PowerMonitor, StaticNetworkMonitor, StaticPowerMonitor};
use crate::persist::{JobPersister, MemoryPersister};

/// Concurrent running jobs across all groups.
const DEFAULT_CONCURRENCY: usize = 8;

/// Idle time before a group lane worker exits and frees its channel.
const LANE_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

const LANE_CAPACITY: usize = 64;

/// Observer of scheduler lifecycle events. Callbacks run inline on worker
/// tasks; implementations must not call back into the scheduler.
pub trait SchedulerListener: Send + Sync {
    fn on_scheduled(&self, _spec: &JobSpec) {}
    fn on_before_run(&self, _spec: &JobSpec) {}
    fn on_after_run(&self, _spec: &JobSpec, _success: bool) {}
    fn on_terminated(&self, _spec: &JobSpec, _completion: &JobCompletion) {}
}

/// Configures and constructs a [`JobScheduler`].
pub struct SchedulerBuilder {
    queue_name: String,
    concurrency: usize,
    creators: HashMap<String, Arc<dyn JobCreator>>,
    persister: Arc<dyn JobPersister>,
    network: Arc<dyn NetworkMonitor>,
    power: Arc<dyn PowerMonitor>,
    listeners: Vec<Arc<dyn SchedulerListener>>,
}

impl SchedulerBuilder {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            concurrency: DEFAULT_CONCURRENCY,
            creators: HashMap::new(),
            persister: Arc::new(MemoryPersister::new()),
            network: Arc::new(StaticNetworkMonitor::online()),
            power: Arc::new(StaticPowerMonitor::plugged_in()),
            listeners: Vec::new(),
        }
    }

    /// Register the creator selected by `job_type`.
    pub fn creator(mut self, job_type: impl Into<String>, creator: Arc<dyn JobCreator>) -> Self {
        self.creators.insert(job_type.into(), creator);
        self
    }

    pub fn persister(mut self, persister: Arc<dyn JobPersister>) -> Self {
        self.persister = persister;
        self
    }

    pub fn network_monitor(mut self, monitor: Arc<dyn NetworkMonitor>) -> Self {
        self.network = monitor;
        self
    }

    pub fn power_monitor(mut self, monitor: Arc<dyn PowerMonitor>) -> Self {
        self.power = monitor;
        self
    }

    pub fn concurrency(mut self, limit: usize) -> Self {
        self.concurrency = limit.max(1);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn SchedulerListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Construct the scheduler and restore persisted jobs for its queue, in
    /// original insertion order.
    pub async fn build(self) -> JobScheduler {
        let scheduler = JobScheduler {
            inner: Arc::new(SchedulerInner {
                queue_name: self.queue_name,
                creators: self.creators,
                persister: self.persister,
                network: self.network,
                power: self.power,
                semaphore: Arc::new(Semaphore::new(self.concurrency)),
                lanes: DashMap::new(),
                handles: DashMap::new(),
                unique_names: DashMap::new(),
                listeners: self.listeners,
                running: AtomicBool::new(true),
            }),
        };
        scheduler.restore_persisted().await;
        scheduler
    }
}

/// Durable, constraint-aware job runner.
///
/// Cheap to clone; all clones share one scheduler.
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    queue_name: String,
    creators: HashMap<String, Arc<dyn JobCreator>>,
    persister: Arc<dyn JobPersister>,
    network: Arc<dyn NetworkMonitor>,
    power: Arc<dyn PowerMonitor>,
    semaphore: Arc<Semaphore>,
    /// Per-group serial lanes.
    lanes: DashMap<String, mpsc::Sender<LaneTask>>,
    /// Live jobs, for cancellation and uniqueness bookkeeping.
    handles: DashMap<Uuid, JobHandle>,
    unique_names: DashMap<String, Uuid>,
    listeners: Vec<Arc<dyn SchedulerListener>>,
    running: AtomicBool,
}

struct JobHandle {
    tags: HashSet<String>,
    unique_name: Option<String>,
    cancel: watch::Sender<bool>,
}

struct LaneTask {
    spec: JobSpec,
    job: Box<dyn Job>,
    cancel_rx: watch::Receiver<bool>,
}

enum AttemptError {
    Timeout,
    Job(anyhow::Error),
}

impl JobScheduler {
    pub fn queue_name(&self) -> &str {
        &self.inner.queue_name
    }

    /// Jobs currently scheduled, waiting, running, or retrying.
    pub fn active_count(&self) -> usize {
        self.inner.handles.len()
    }

    /// Validate, deduplicate, and enqueue a job spec.
    pub async fn schedule(&self, spec: JobSpec) -> Result<Uuid, JobError> {
        let inner = &self.inner;
        if !inner.running.load(Ordering::SeqCst) {
            return Err(JobError::Stopped);
        }

        let creator = inner
            .creators
            .get(&spec.job_type)
            .cloned()
            .ok_or_else(|| JobError::UnknownType(spec.job_type.clone()))?;

        if let Some(unique) = &spec.constraints.unique {
            if let Some(existing) = inner.unique_names.get(&unique.name).map(|e| *e.value()) {
                match unique.policy {
                    UniquePolicy::DropIncoming => {
                        debug!(
                            unique_name = %unique.name,
                            existing_job = %existing,
                            "Dropping incoming duplicate job"
                        );
                        return Err(JobError::Duplicate(unique.name.clone()));
                    }
                    UniquePolicy::Error => {
                        error!(
                            unique_name = %unique.name,
                            existing_job = %existing,
                            "Duplicate job for unique name"
                        );
                        return Err(JobError::Duplicate(unique.name.clone()));
                    }
                    UniquePolicy::DropExisting => {
                        info!(
                            unique_name = %unique.name,
                            existing_job = %existing,
                            "Cancelling existing job in favor of incoming"
                        );
                        self.cancel(existing);
                    }
                }
            }
        }

        let job = creator.create(&spec).map_err(JobError::Failed)?;
        Ok(Arc::clone(inner).enqueue(spec, job, true).await)
    }

    /// Flag a job for cancellation. Observed cooperatively: an in-flight
    /// `on_run` completes first. Returns false for unknown or finished jobs.
    pub fn cancel(&self, uuid: Uuid) -> bool {
        match self.inner.handles.get(&uuid) {
            Some(handle) => {
                let _ = handle.cancel.send(true);
                true
            }
            None => false,
        }
    }

    /// Cancel every live job carrying `tag`; returns how many were flagged.
    pub fn cancel_with_tag(&self, tag: &str) -> usize {
        let mut flagged = 0;
        for entry in self.inner.handles.iter() {
            if entry.value().tags.contains(tag) {
                let _ = entry.value().cancel.send(true);
                flagged += 1;
            }
        }
        flagged
    }

    pub fn cancel_all(&self) -> usize {
        let mut flagged = 0;
        for entry in self.inner.handles.iter() {
            let _ = entry.value().cancel.send(true);
            flagged += 1;
        }
        flagged
    }

    /// Reject new schedules. Live jobs run to completion; pair with
    /// [`cancel_all`](Self::cancel_all) for a hard stop.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        info!(queue = %self.inner.queue_name, "Scheduler stopped");
    }

    async fn restore_persisted(&self) {
        let blobs = match self.inner.persister.restore(&self.inner.queue_name).await {
            Ok(blobs) => blobs,
            Err(e) => {
                warn!(queue = %self.inner.queue_name, error = %e, "Could not restore persisted jobs");
                return;
            }
        };
        if blobs.is_empty() {
            return;
        }
        info!(queue = %self.inner.queue_name, count = blobs.len(), "Restoring persisted jobs");

        for blob in blobs {
            let mut spec: JobSpec = match serde_json::from_str(&blob) {
                Ok(spec) => spec,
                Err(e) => {
                    warn!(queue = %self.inner.queue_name, error = %e, "Dropping unreadable persisted job");
                    continue;
                }
            };
            // Blobs for types without a creator stay in the persister: a
            // later binary that registers the type will pick them up.
            let Some(creator) = self.inner.creators.get(&spec.job_type) else {
                warn!(job_type = %spec.job_type, job = %spec.uuid, "No creator for persisted job, leaving blob in place");
                continue;
            };
            spec.state = JobState::Scheduled;
            match creator.create(&spec) {
                Ok(job) => {
                    Arc::clone(&self.inner).enqueue(spec, job, false).await;
                }
                Err(e) => {
                    warn!(job = %spec.uuid, error = %e, "Creator rejected persisted job");
                }
            }
        }
    }
}

impl SchedulerInner {
    /// Register bookkeeping for a job and hand it to its group lane.
    async fn enqueue(self: Arc<Self>, spec: JobSpec, job: Box<dyn Job>, persist_now: bool) -> Uuid {
        let uuid = spec.uuid;

        if persist_now {
            self.persist_spec(&spec).await;
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        if let Some(unique) = &spec.constraints.unique {
            self.unique_names.insert(unique.name.clone(), uuid);
        }
        self.handles.insert(
            uuid,
            JobHandle {
                tags: spec.constraints.tags.clone(),
                unique_name: spec.constraints.unique.as_ref().map(|u| u.name.clone()),
                cancel: cancel_tx,
            },
        );

        for listener in &self.listeners {
            listener.on_scheduled(&spec);
        }
        debug!(job = %uuid, job_type = %spec.job_type, group = %spec.group_key(), "Job scheduled");

        let lane_key = spec.group_key().to_string();
        let mut task = LaneTask {
            spec,
            job,
            cancel_rx,
        };
        // A lane worker may have idle-exited between lookup and send; retry
        // once with a fresh lane.
        match Self::lane_sender(&self, &lane_key).send(task).await {
            Ok(()) => {}
            Err(mpsc::error::SendError(returned)) => {
                debug!(group = %lane_key, "Lane worker exited, recreating");
                self.lanes.remove(&lane_key);
                task = returned;
                if let Err(e) = Self::lane_sender(&self, &lane_key).send(task).await {
                    error!(group = %lane_key, job = %e.0.spec.uuid, "Failed to enqueue job on fresh lane");
                    self.handles.remove(&e.0.spec.uuid);
                }
            }
        }
        uuid
    }

    fn lane_sender(inner: &Arc<Self>, key: &str) -> mpsc::Sender<LaneTask> {
        match inner.lanes.entry(key.to_string()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let (tx, rx) = mpsc::channel(LANE_CAPACITY);
                entry.insert(tx.clone());
                let worker = Arc::clone(inner);
                let lane_key = key.to_string();
                tokio::spawn(async move {
                    worker.run_lane(lane_key, rx).await;
                });
                tx
            }
        }
    }

    /// Serial worker for one group. Exits after an idle timeout, draining
    /// any stragglers that raced the shutdown.
    async fn run_lane(self: Arc<Self>, key: String, mut rx: mpsc::Receiver<LaneTask>) {
        debug!(group = %key, "Lane worker started");
        loop {
            let task = match tokio::time::timeout(LANE_IDLE_TIMEOUT, rx.recv()).await {
                Ok(Some(task)) => task,
                Ok(None) => break,
                Err(_) => {
                    if rx.is_empty() {
                        self.lanes.remove(&key);
                        break;
                    }
                    continue;
                }
            };
            self.run_job(task).await;
        }

        rx.close();
        while let Some(task) = rx.recv().await {
            self.run_job(task).await;
        }
        debug!(group = %key, "Lane worker exited");
    }

    async fn run_job(&self, task: LaneTask) {
        let LaneTask {
            mut spec,
            job,
            mut cancel_rx,
        } = task;
        let completion = self.execute(&mut spec, job.as_ref(), &mut cancel_rx).await;
        self.finish(spec, job, completion).await;
    }

    /// Drive one job through constraints, attempts, and retries.
    async fn execute(
        &self,
        spec: &mut JobSpec,
        job: &dyn Job,
        cancel: &mut watch::Receiver<bool>,
    ) -> JobCompletion {
        let deadline = spec.constraints.deadline;

        if let Some(delay) = spec.constraints.delay {
            if spec.attempt == 0 {
                self.transition(spec, JobState::WaitingForConstraint).await;
                sleep_cancellable(delay, cancel).await?;
            }
        }

        let mut runs_completed: u32 = 0;
        let mut retries_left = spec.constraints.max_retries;

        loop {
            // Deadline and cancellation are checked before the first run and
            // before every retry attempt.
            if deadline_expired(deadline) {
                return Err(JobError::Deadline);
            }
            if *cancel.borrow() {
                return Err(JobError::Canceled);
            }

            if let Some(required) = spec.constraints.network {
                self.transition(spec, JobState::WaitingForConstraint).await;
                self.wait_for_network(required, deadline, cancel).await?;
            }
            if spec.constraints.require_charging {
                self.transition(spec, JobState::WaitingForConstraint).await;
                self.wait_for_charging(deadline, cancel).await?;
            }

            self.transition(spec, JobState::Queued).await;
            let permit = match self.semaphore.acquire().await {
                Ok(permit) => permit,
                Err(_) => return Err(JobError::Stopped),
            };

            self.transition(spec, JobState::Running).await;
            for listener in &self.listeners {
                listener.on_before_run(spec);
            }
            spec.attempt += 1;

            let attempt_result: Result<(), AttemptError> = match spec.constraints.timeout {
                Some(limit) => match tokio::time::timeout(limit, job.on_run()).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(AttemptError::Job(e)),
                    Err(_) => Err(AttemptError::Timeout),
                },
                None => job.on_run().await.map_err(AttemptError::Job),
            };
            drop(permit);

            for listener in &self.listeners {
                listener.on_after_run(spec, attempt_result.is_ok());
            }

            match attempt_result {
                Ok(()) => {
                    runs_completed += 1;
                    if let Some(periodic) = spec.constraints.periodic {
                        if runs_completed < periodic.count {
                            debug!(
                                job = %spec.uuid,
                                run = runs_completed,
                                of = periodic.count,
                                "Periodic run complete, waiting for next interval"
                            );
                            self.transition(spec, JobState::Scheduled).await;
                            sleep_cancellable(periodic.interval, cancel).await?;
                            continue;
                        }
                    }
                    return Ok(());
                }
                Err(AttemptError::Timeout) => {
                    warn!(job = %spec.uuid, attempt = spec.attempt, "Job attempt timed out");
                    return Err(JobError::Timeout);
                }
                Err(AttemptError::Job(e)) => {
                    if retries_left == 0 {
                        return Err(JobError::Failed(e));
                    }
                    match job.on_retry(&e).await {
                        RetryConstraint::Cancel => {
                            return Err(JobError::OnRetryCancel(e));
                        }
                        constraint => {
                            // retry_delay only returns None for Cancel
                            let delay = backoff::retry_delay(constraint, spec.attempt)
                                .unwrap_or(Duration::ZERO);
                            warn!(
                                job = %spec.uuid,
                                attempt = spec.attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "Job attempt failed, retrying"
                            );
                            if retries_left > 0 {
                                retries_left -= 1;
                            }
                            self.transition(spec, JobState::Retrying).await;
                            sleep_cancellable(delay, cancel).await?;
                        }
                    }
                }
            }
        }
    }

    /// Terminal bookkeeping: drop persistence, release the unique name, fire
    /// `on_remove` and listeners.
    async fn finish(&self, mut spec: JobSpec, job: Box<dyn Job>, completion: JobCompletion) {
        spec.state = JobState::Terminated;

        match &completion {
            Ok(()) => debug!(job = %spec.uuid, job_type = %spec.job_type, "Job completed"),
            Err(e) => warn!(job = %spec.uuid, job_type = %spec.job_type, error = %e, "Job terminated with failure"),
        }

        if spec.constraints.persist {
            if let Err(e) = self
                .persister
                .remove(&self.queue_name, &spec.uuid.to_string())
                .await
            {
                warn!(job = %spec.uuid, error = %e, "Failed to remove persisted job");
            }
        }

        if let Some((_, handle)) = self.handles.remove(&spec.uuid) {
            if let Some(name) = handle.unique_name {
                self.unique_names.remove_if(&name, |_, v| *v == spec.uuid);
            }
        }

        job.on_remove(&completion).await;
        for listener in &self.listeners {
            listener.on_terminated(&spec, &completion);
        }
    }

    async fn transition(&self, spec: &mut JobSpec, state: JobState) {
        spec.state = state;
        self.persist_spec(spec).await;
    }

    async fn persist_spec(&self, spec: &JobSpec) {
        if !spec.constraints.persist {
            return;
        }
        match serde_json::to_string(spec) {
            Ok(blob) => {
                if let Err(e) = self
                    .persister
                    .put(&self.queue_name, &spec.uuid.to_string(), &blob)
                    .await
                {
                    warn!(job = %spec.uuid, error = %e, "Failed to persist job");
                }
            }
            Err(e) => warn!(job = %spec.uuid, error = %e, "Failed to serialize job"),
        }
    }

    async fn wait_for_network(
        &self,
        required: Reachability,
        deadline: Option<DateTime<Utc>>,
        cancel: &mut watch::Receiver<bool>,
    ) -> JobCompletion {
        let mut rx = self.network.subscribe();
        loop {
            if rx.borrow_and_update().satisfies(required) {
                return Ok(());
            }
            debug!(required = ?required, "Waiting for network reachability");
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(JobError::Stopped);
                    }
                }
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        return Err(JobError::Canceled);
                    }
                }
                _ = deadline_sleep(deadline) => {
                    return Err(JobError::Deadline);
                }
            }
        }
    }

    async fn wait_for_charging(
        &self,
        deadline: Option<DateTime<Utc>>,
        cancel: &mut watch::Receiver<bool>,
    ) -> JobCompletion {
        let mut rx = self.power.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return Ok(());
            }
            debug!("Waiting for AC power");
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(JobError::Stopped);
                    }
                }
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        return Err(JobError::Canceled);
                    }
                }
                _ = deadline_sleep(deadline) => {
                    return Err(JobError::Deadline);
                }
            }
        }
    }
}

fn deadline_expired(deadline: Option<DateTime<Utc>>) -> bool {
    deadline.map(|d| Utc::now() >= d).unwrap_or(false)
}

/// Sleep until the deadline instant; pends forever when there is none.
async fn deadline_sleep(deadline: Option<DateTime<Utc>>) {
    match deadline {
        Some(deadline) => {
            let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(remaining).await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Sleep that wakes early on cancellation.
async fn sleep_cancellable(duration: Duration, cancel: &mut watch::Receiver<bool>) -> JobCompletion {
    if *cancel.borrow() {
        return Err(JobError::Canceled);
    }
    let sleep = tokio::time::sleep(duration);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return Ok(()),
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    return Err(JobError::Canceled);
                }
            }
        }
    }
}
