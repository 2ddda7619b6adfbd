//! Task workers: long-lived units executing a series of tasks.
//!
//! A [`Worker`] wraps an execution context and gives callers a job-oriented
//! surface: enqueue tasks, ask for graceful shutdown, or kill outright. The
//! same trait is implemented by a single [`TaskWorker`](task_worker::TaskWorker)
//! and by a [`WorkerPool`](pool::WorkerPool) fanning out over many.

pub mod pool;
pub mod runner;
pub mod task_worker;

use async_trait::async_trait;

use crate::channel::protocol::TaskSpec;

/// Worker-level faults.
///
/// Cloneable so a memoized shutdown outcome can be handed to every caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkerError {
    /// The worker was asked for new work after `shutdown` was requested.
    #[error("the worker has been shut down")]
    Shutdown,

    /// The worker was killed; in-flight and queued jobs are lost.
    #[error("the worker has been killed")]
    Killed,

    /// Transport or context failure while talking to the unit.
    #[error("communication with the worker failed: {0}")]
    Communication(String),

    /// The unit answered a job with something other than a task result.
    #[error("the unit sent an unexpected message type in response to a job")]
    UnexpectedResultType,

    /// The unit answered with a result for a different job. The worker is
    /// killed when this is detected; results can no longer be correlated.
    #[error("the unit sent a result for a different job")]
    OutOfOrder,

    /// The task itself failed inside the unit.
    #[error("the task raised {kind}: {message}")]
    TaskFailed { kind: String, message: String },

    /// The unit's exit result was a failure during graceful shutdown.
    #[error("the worker exited with {kind}: {message}")]
    ExitFailed { kind: String, message: String },

    #[error("failed to start the worker: {0}")]
    Start(String),

    /// A worker was constructed around a context that is already running.
    #[error("the context is already running")]
    AlreadyRunning,

    #[error("pool size must be at least 1")]
    InvalidPoolSize,

    /// A lease was requested from a pool that is shutting down.
    #[error("the pool has been shut down")]
    PoolShutdown,
}

/// Job-oriented view over one or more execution units.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Whether work can still be submitted.
    fn is_running(&self) -> bool;

    /// Whether a submission would run without queueing behind another job.
    fn is_idle(&self) -> bool;

    /// Run one task to completion and return its value.
    ///
    /// Concurrent calls are executed one at a time in submission order; a
    /// failed predecessor does not poison the jobs queued behind it.
    async fn enqueue(&self, task: TaskSpec) -> Result<serde_json::Value, WorkerError>;

    /// Gracefully stop: let in-flight work finish, then collect the unit's
    /// exit code. Memoized; every caller sees the same outcome.
    async fn shutdown(&self) -> Result<i32, WorkerError>;

    /// Immediately terminate, abandoning any in-flight work.
    fn kill(&self);
}
