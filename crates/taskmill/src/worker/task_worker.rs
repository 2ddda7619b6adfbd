//! Single worker dispatching tasks over one execution context.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, OnceCell};

use crate::channel::protocol::{JobId, Outcome, TaskSpec, UnitRequest, UnitResponse};
use crate::context::{Context, ContextError};

use super::{Worker, WorkerError};

/// One unit, one job at a time.
///
/// The context is started lazily on the first `enqueue`, so constructing a
/// worker is cheap and synchronous. Concurrent `enqueue` calls line up behind
/// the dispatch lock and run in submission order; `kill` never waits for the
/// job in flight.
pub struct TaskWorker {
    context: Box<dyn Context>,
    /// Serializes job dispatch. Held across send+receive of one job.
    dispatch: Mutex<()>,
    /// Jobs submitted but not yet answered, including those queued.
    active: AtomicUsize,
    started: AtomicBool,
    shutdown_requested: AtomicBool,
    /// Memoized terminal outcome, set by `shutdown` or `kill`.
    exit: OnceCell<Result<i32, WorkerError>>,
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl TaskWorker {
    /// Wrap an unstarted context.
    pub fn new(context: Box<dyn Context>) -> Result<Self, WorkerError> {
        if context.is_running() {
            return Err(WorkerError::AlreadyRunning);
        }
        Ok(Self::wrap(context, false))
    }

    /// Wrap a context that `restart` already started.
    fn from_running(context: Box<dyn Context>) -> Self {
        Self::wrap(context, true)
    }

    fn wrap(context: Box<dyn Context>, started: bool) -> Self {
        Self {
            context,
            dispatch: Mutex::new(()),
            active: AtomicUsize::new(0),
            started: AtomicBool::new(started),
            shutdown_requested: AtomicBool::new(false),
            exit: OnceCell::new(),
        }
    }

    fn check_accepting(&self) -> Result<(), WorkerError> {
        if let Some(Err(WorkerError::Killed)) = self.exit.get() {
            return Err(WorkerError::Killed);
        }
        if self.exit.get().is_some() || self.shutdown_requested.load(Ordering::Acquire) {
            return Err(WorkerError::Shutdown);
        }
        Ok(())
    }

    async fn dispatch_one(&self, task: TaskSpec) -> Result<serde_json::Value, WorkerError> {
        if !self.started.swap(true, Ordering::AcqRel) {
            self.context
                .start()
                .await
                .map_err(|e| WorkerError::Start(e.to_string()))?;
        }

        let id = JobId::new();
        tracing::debug!(job_id = %id, task = %task.name, "dispatching job");

        self.context
            .send(UnitRequest::Job { id, task })
            .await
            .map_err(|e| self.fail(e))?;

        match self.context.receive().await.map_err(|e| self.fail(e))? {
            UnitResponse::TaskResult { id: answered, outcome } if answered == id => {
                match outcome {
                    Outcome::Success { value } => Ok(value),
                    Outcome::Failure { fault } => Err(WorkerError::TaskFailed {
                        kind: fault.kind,
                        message: fault.message,
                    }),
                }
            }
            UnitResponse::TaskResult { id: answered, .. } => {
                tracing::error!(expected = %id, got = %answered, "job answer out of order");
                self.kill();
                Err(WorkerError::OutOfOrder)
            }
            other => {
                tracing::error!(?other, "unexpected message in response to a job");
                self.kill();
                Err(WorkerError::UnexpectedResultType)
            }
        }
    }

    /// Record a dispatch fault. Synchronization and unresponsiveness faults
    /// mean the context has already torn itself down; the worker must follow,
    /// or a pool would recycle it and every later task would fail.
    fn fail(&self, e: ContextError) -> WorkerError {
        if matches!(
            e,
            ContextError::Synchronization(_) | ContextError::Unresponsive(_)
        ) {
            self.kill();
        }
        communication(e)
    }

    /// Tear this worker down and build a replacement over a fresh unit.
    pub async fn restart(&self, force: bool) -> Result<TaskWorker, WorkerError> {
        if force {
            self.kill();
        } else if let Err(e) = self.shutdown().await {
            // The replacement does not inherit the old unit's fate.
            tracing::debug!(error = %e, "old worker failed during restart drain");
        }

        let fresh = self.context.restart(force).await.map_err(|e| match e {
            ContextError::Start(message) => WorkerError::Start(message),
            other => WorkerError::Communication(other.to_string()),
        })?;
        Ok(TaskWorker::from_running(fresh))
    }
}

fn communication(e: ContextError) -> WorkerError {
    WorkerError::Communication(e.to_string())
}

#[async_trait]
impl Worker for TaskWorker {
    fn is_running(&self) -> bool {
        self.exit.get().is_none() && !self.shutdown_requested.load(Ordering::Acquire)
    }

    fn is_idle(&self) -> bool {
        self.is_running() && self.active.load(Ordering::Acquire) == 0
    }

    async fn enqueue(&self, task: TaskSpec) -> Result<serde_json::Value, WorkerError> {
        self.check_accepting()?;

        self.active.fetch_add(1, Ordering::AcqRel);
        let _active = ActiveGuard(&self.active);

        // Fair lock: concurrent submissions run in arrival order. A failed
        // predecessor releases the lock like any other; its error belongs to
        // its own caller only.
        let _dispatch = self.dispatch.lock().await;
        self.check_accepting()?;

        self.dispatch_one(task).await
    }

    async fn shutdown(&self) -> Result<i32, WorkerError> {
        self.exit
            .get_or_init(|| async {
                self.shutdown_requested.store(true, Ordering::Release);

                // Wait for the job in flight; new submissions are already
                // refused by the flag.
                let _dispatch = self.dispatch.lock().await;

                if !self.started.load(Ordering::Acquire) {
                    // Never spawned anything; nothing to stop.
                    return Ok(0);
                }

                self.context
                    .send(UnitRequest::Shutdown)
                    .await
                    .map_err(communication)?;

                match self.context.join().await {
                    Ok(value) => Ok(value.as_i64().unwrap_or(0) as i32),
                    Err(ContextError::Panic { kind, message }) => {
                        Err(WorkerError::ExitFailed { kind, message })
                    }
                    Err(e) => Err(communication(e)),
                }
            })
            .await
            .clone()
    }

    fn kill(&self) {
        // Killed only counts once work has been dispatched; killing a worker
        // that never ran anything is a clean zero, as shutdown would be.
        let outcome = if self.started.load(Ordering::Acquire) {
            Err(WorkerError::Killed)
        } else {
            Ok(0)
        };
        self.context.kill();
        if self.exit.set(outcome).is_ok() {
            self.shutdown_requested.store(true, Ordering::Release);
            tracing::debug!("worker killed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::channel::protocol::RemoteFault;
    use crate::context::thread::ThreadContext;
    use crate::worker::runner::{serve_tasks, TaskHandler};

    struct SlowEcho;

    #[async_trait]
    impl TaskHandler for SlowEcho {
        async fn run(&self, task: TaskSpec) -> Result<serde_json::Value, RemoteFault> {
            match task.name.as_str() {
                "echo" => Ok(task.input),
                "sleep-ms" => {
                    let ms = task.input.as_u64().unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(task.input)
                }
                "fail" => Err(RemoteFault::new("TaskError", "told to fail")),
                other => Err(RemoteFault::new("UnknownTask", other.to_string())),
            }
        }
    }

    fn thread_worker() -> TaskWorker {
        let context = ThreadContext::new(|channel| serve_tasks(channel, Arc::new(SlowEcho)));
        TaskWorker::new(Box::new(context)).unwrap()
    }

    #[tokio::test]
    async fn enqueue_runs_a_task_and_shutdown_is_clean() {
        let worker = thread_worker();
        assert!(worker.is_running());
        assert!(worker.is_idle());

        let value = worker
            .enqueue(TaskSpec::new("echo", json!({"n": 7})))
            .await
            .unwrap();
        assert_eq!(value, json!({"n": 7}));

        assert_eq!(worker.shutdown().await.unwrap(), 0);
        assert!(!worker.is_running());
    }

    #[tokio::test]
    async fn task_failure_does_not_poison_the_worker() {
        let worker = thread_worker();

        let err = worker
            .enqueue(TaskSpec::new("fail", json!(null)))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::TaskFailed { ref kind, .. } if kind == "TaskError"));

        let value = worker
            .enqueue(TaskSpec::new("echo", json!(1)))
            .await
            .unwrap();
        assert_eq!(value, json!(1));

        worker.kill();
    }

    #[tokio::test]
    async fn concurrent_submissions_are_serialized() {
        let worker = Arc::new(thread_worker());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut jobs = Vec::new();
        for i in 0..4 {
            let worker = Arc::clone(&worker);
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            jobs.push(tokio::spawn(async move {
                let now = in_flight.fetch_add(1, Ordering::AcqRel) + 1;
                peak.fetch_max(now, Ordering::AcqRel);
                let result = worker.enqueue(TaskSpec::new("sleep-ms", json!(30))).await;
                in_flight.fetch_sub(1, Ordering::AcqRel);
                (i, result)
            }));
        }

        for job in jobs {
            let (i, result) = job.await.unwrap();
            assert_eq!(result.unwrap(), json!(30), "job {i}");
        }
        // All four were submitted concurrently but served one at a time.
        assert!(peak.load(Ordering::Acquire) >= 2);

        assert_eq!(worker.shutdown().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_is_refused() {
        let worker = thread_worker();
        assert_eq!(worker.shutdown().await.unwrap(), 0);

        assert!(matches!(
            worker.enqueue(TaskSpec::new("echo", json!(0))).await,
            Err(WorkerError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn shutdown_without_any_work_never_starts_the_unit() {
        let worker = thread_worker();
        // No enqueue happened, so there is no unit to stop.
        assert_eq!(worker.shutdown().await.unwrap(), 0);
        assert_eq!(worker.shutdown().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn kill_abandons_the_job_in_flight() {
        let worker = Arc::new(thread_worker());

        let runner = Arc::clone(&worker);
        let slow = tokio::spawn(async move {
            runner
                .enqueue(TaskSpec::new("sleep-ms", json!(10_000)))
                .await
        });

        // Let the job reach the unit before killing.
        tokio::time::sleep(Duration::from_millis(100)).await;
        worker.kill();

        let result = tokio::time::timeout(Duration::from_secs(2), slow)
            .await
            .expect("kill must not wait for the job")
            .unwrap();
        assert!(result.is_err());
        assert!(matches!(
            worker.enqueue(TaskSpec::new("echo", json!(0))).await,
            Err(WorkerError::Killed)
        ));
    }

    #[tokio::test]
    async fn unit_exiting_mid_job_kills_the_worker() {
        // The unit swallows the job and exits instead of answering it.
        let context = ThreadContext::new(|channel| async move {
            let _ = channel.receive().await;
            Ok(serde_json::json!(0))
        });
        let worker = TaskWorker::new(Box::new(context)).unwrap();

        let err = worker
            .enqueue(TaskSpec::new("echo", json!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Communication(_)));

        // The worker must not present itself as leasable again.
        assert!(!worker.is_running());
        assert!(!worker.is_idle());
        assert!(matches!(
            worker.enqueue(TaskSpec::new("echo", json!(2))).await,
            Err(WorkerError::Killed)
        ));
    }

    #[tokio::test]
    async fn restart_produces_a_working_replacement() {
        let worker = thread_worker();
        worker
            .enqueue(TaskSpec::new("echo", json!("before")))
            .await
            .unwrap();

        let fresh = worker.restart(false).await.unwrap();
        assert!(!worker.is_running());
        assert!(fresh.is_running());

        let value = fresh
            .enqueue(TaskSpec::new("echo", json!("after")))
            .await
            .unwrap();
        assert_eq!(value, json!("after"));
        assert_eq!(fresh.shutdown().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn forced_restart_abandons_the_job_in_flight() {
        let worker = Arc::new(thread_worker());

        let runner = Arc::clone(&worker);
        let slow = tokio::spawn(async move {
            runner
                .enqueue(TaskSpec::new("sleep-ms", json!(10_000)))
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let fresh = worker.restart(true).await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), slow)
            .await
            .expect("forced restart must not drain")
            .unwrap();
        assert!(result.is_err());

        assert_eq!(
            fresh.enqueue(TaskSpec::new("echo", json!(1))).await.unwrap(),
            json!(1)
        );
        fresh.kill();
    }
}
