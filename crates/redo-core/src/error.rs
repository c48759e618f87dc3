use thiserror::Error;

/// Library-level failures.
#[derive(Debug, Error)]
pub enum RedoError {
    /// Invalid engine or logging configuration.
    #[error("configure error: {0}")]
    Configure(String),

    /// The store backend could not read or persist a task.
    #[error("data error: {0}")]
    Data(String),
}

/// What the caller of a wrapped function observes when the call fails.
///
/// The wrapper never silences a failure on the caller's side; these variants
/// classify what went wrong after the retry bookkeeping has run.
#[derive(Debug, Error)]
pub enum CallError {
    /// The user function failed. For an idempotent task a retry has been
    /// scheduled by the time the caller sees this.
    #[error("{0}")]
    User(String),

    /// The user function demanded a retry with replacement arguments; the
    /// retry has been scheduled.
    #[error("retry requested for task {0}")]
    RetryRequested(String),

    /// The failure (or the success cleanup) could not be recorded.
    #[error(transparent)]
    Data(#[from] RedoError),
}
