//! Constraint-aware background job scheduler
//!
//! Jobs are scheduled through [`JobBuilder`], instantiated by a registered
//! [`JobCreator`], and executed with retry/backoff, network and charging
//! gates, group serialization, and optional persistence across restarts.
//!
//! Groups run serially; distinct groups run in parallel on a bounded worker
//! pool. A persisted job survives a process restart: on construction the
//! scheduler restores every serialized job for its queue, in the order they
//! were first scheduled.

mod backoff;
mod error;
mod job;
mod monitor;
mod persist;
mod scheduler;

pub use backoff::exponential_delay;
pub use error::{JobCompletion, JobError};
pub use job::{
    Job, JobBuilder, JobConstraints, JobCreator, JobSpec, JobState, Periodic, QualityOfService,
    Reachability, RetryConstraint, UniqueConstraint, UniquePolicy,
};
pub use monitor::{
    NetworkMonitor, NetworkStatus, PowerMonitor, StaticNetworkMonitor, StaticPowerMonitor,
};
pub use persist::{FilePersister, JobPersister, MemoryPersister};
pub use scheduler::{JobScheduler, SchedulerBuilder, SchedulerListener};
