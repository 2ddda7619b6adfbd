//! Parallel task execution over pooled worker processes and threads.
//!
//! A controller spawns execution units (OS processes or native threads),
//! authenticates them, and drives them over a length-framed JSON channel.
//! On top of that sit [`TaskWorker`], which runs one task at a time over one
//! unit, and [`WorkerPool`], which recycles a bounded set of workers through
//! drop-returned leases.

pub mod channel;
pub mod context;
pub mod worker;

pub use channel::protocol::{JobId, Outcome, RemoteFault, TaskSpec, UnitRequest, UnitResponse};
pub use channel::{ChannelError, FramedChannel};
pub use context::process::{CommandSpawner, ProcessContext, UnitSpawner};
pub use context::thread::ThreadContext;
pub use context::{Context, ContextError};
pub use worker::pool::{
    PooledWorker, ProcessWorkerFactory, ThreadWorkerFactory, WorkerFactory, WorkerPool,
    DEFAULT_MAX_SIZE,
};
pub use worker::runner::{run_worker, serve_tasks, TaskHandler};
pub use worker::task_worker::TaskWorker;
pub use worker::{Worker, WorkerError};
