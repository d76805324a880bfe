use thiserror::Error;

/// Terminal outcome delivered to `Job::on_remove` and listeners.
pub type JobCompletion = std::result::Result<(), JobError>;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("duplicate job for unique name {0:?}")]
    Duplicate(String),

    #[error("job canceled")]
    Canceled,

    #[error("deadline elapsed before completion")]
    Deadline,

    #[error("attempt exceeded its timeout")]
    Timeout,

    #[error("retry handler canceled the job: {0}")]
    OnRetryCancel(#[source] anyhow::Error),

    #[error("job failed: {0}")]
    Failed(#[source] anyhow::Error),

    #[error("no creator registered for job type {0:?}")]
    UnknownType(String),

    #[error("scheduler stopped")]
    Stopped,
}
