//! Bounded pool of task workers with leased checkout.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify, OnceCell};

use crate::channel::protocol::TaskSpec;
use crate::context::process::{ProcessContext, UnitSpawner};
use crate::context::thread::ThreadContext;

use super::runner::{serve_tasks, TaskHandler};
use super::task_worker::TaskWorker;
use super::{Worker, WorkerError};

/// Upper bound on pool size when none is given.
pub const DEFAULT_MAX_SIZE: usize = 32;

/// Builds one worker for a pool. The pool calls this lazily, only when all
/// existing workers are busy and the bound has not been reached.
pub trait WorkerFactory: Send + Sync {
    fn create(&self) -> Result<TaskWorker, WorkerError>;
}

/// Factory spawning process-backed workers.
pub struct ProcessWorkerFactory {
    spawner: Arc<dyn UnitSpawner>,
    start_timeout: Option<Duration>,
}

impl ProcessWorkerFactory {
    pub fn new(spawner: Arc<dyn UnitSpawner>) -> Self {
        Self {
            spawner,
            start_timeout: None,
        }
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = Some(timeout);
        self
    }
}

impl WorkerFactory for ProcessWorkerFactory {
    fn create(&self) -> Result<TaskWorker, WorkerError> {
        let mut context = ProcessContext::new(Arc::clone(&self.spawner));
        if let Some(timeout) = self.start_timeout {
            context = context.with_start_timeout(timeout);
        }
        TaskWorker::new(Box::new(context))
    }
}

/// Factory spawning thread-backed workers running the given handler.
pub struct ThreadWorkerFactory<H: TaskHandler> {
    handler: Arc<H>,
}

impl<H: TaskHandler> ThreadWorkerFactory<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }
}

impl<H: TaskHandler> WorkerFactory for ThreadWorkerFactory<H> {
    fn create(&self) -> Result<TaskWorker, WorkerError> {
        let handler = Arc::clone(&self.handler);
        let context =
            ThreadContext::new(move |channel| serve_tasks(channel, Arc::clone(&handler)));
        TaskWorker::new(Box::new(context))
    }
}

struct PoolShared {
    idle_tx: mpsc::Sender<Arc<TaskWorker>>,
    idle_rx: Mutex<mpsc::Receiver<Arc<TaskWorker>>>,
    idle_count: AtomicUsize,
    /// Every live worker, leased or idle.
    workers: StdMutex<Vec<Arc<TaskWorker>>>,
    running: AtomicBool,
    closed: Notify,
    /// Signals capacity opening up outside the idle queue: a dead worker was
    /// deregistered, so a waiter's grow path can run again.
    vacancy: Notify,
}

impl PoolShared {
    fn deregister(&self, worker: &Arc<TaskWorker>) {
        self.workers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .retain(|registered| !Arc::ptr_eq(registered, worker));
        self.vacancy.notify_waiters();
    }

    /// Return a lease. Only a running worker goes back to the idle queue; a
    /// closed pool leaves its workers to `shutdown`/`kill`, which hold their
    /// own snapshot of the registry.
    fn checkin(&self, worker: Arc<TaskWorker>) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        if !worker.is_running() {
            self.deregister(&worker);
            return;
        }
        // Count before queueing: a waiter may receive and decrement the
        // instant the send lands, and the counter must never wrap.
        self.idle_count.fetch_add(1, Ordering::AcqRel);
        match self.idle_tx.try_send(worker) {
            Ok(()) => {}
            Err(e) => {
                self.idle_count.fetch_sub(1, Ordering::AcqRel);
                // Queue capacity equals the pool bound, so this is a worker
                // that no longer belongs here.
                self.deregister(match &e {
                    mpsc::error::TrySendError::Full(w) => w,
                    mpsc::error::TrySendError::Closed(w) => w,
                });
            }
        }
    }
}

/// A worker checked out of a pool.
///
/// Dropping the lease returns the worker to the pool; [`release`](Self::release)
/// does the same explicitly. The underlying worker is reachable through
/// `Deref`, so a lease is used exactly like a [`TaskWorker`].
pub struct PooledWorker {
    worker: Arc<TaskWorker>,
    shared: Arc<PoolShared>,
    returned: AtomicBool,
}

impl PooledWorker {
    pub fn release(self) {
        // Drop does the work.
    }

    fn checkin(&self) {
        if !self.returned.swap(true, Ordering::AcqRel) {
            self.shared.checkin(Arc::clone(&self.worker));
        }
    }
}

impl std::ops::Deref for PooledWorker {
    type Target = TaskWorker;

    fn deref(&self) -> &TaskWorker {
        &self.worker
    }
}

impl Drop for PooledWorker {
    fn drop(&mut self) {
        self.checkin();
    }
}

/// Fixed-bound pool creating workers on demand and recycling them via leases.
///
/// Also a [`Worker`] itself: `enqueue` transparently checks a worker out,
/// runs the task, and returns it.
pub struct WorkerPool {
    factory: Arc<dyn WorkerFactory>,
    max_size: usize,
    shared: Arc<PoolShared>,
    exit: OnceCell<Result<i32, WorkerError>>,
}

impl WorkerPool {
    pub fn new(factory: Arc<dyn WorkerFactory>) -> Self {
        Self::with_max_size(factory, DEFAULT_MAX_SIZE)
            .unwrap_or_else(|_| unreachable!("default size is nonzero"))
    }

    pub fn with_max_size(
        factory: Arc<dyn WorkerFactory>,
        max_size: usize,
    ) -> Result<Self, WorkerError> {
        if max_size == 0 {
            return Err(WorkerError::InvalidPoolSize);
        }

        let (idle_tx, idle_rx) = mpsc::channel(max_size);
        Ok(Self {
            factory,
            max_size,
            shared: Arc::new(PoolShared {
                idle_tx,
                idle_rx: Mutex::new(idle_rx),
                idle_count: AtomicUsize::new(0),
                workers: StdMutex::new(Vec::new()),
                running: AtomicBool::new(true),
                closed: Notify::new(),
                vacancy: Notify::new(),
            }),
            exit: OnceCell::new(),
        })
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Number of live workers, leased or idle.
    pub fn worker_count(&self) -> usize {
        self.shared
            .workers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub fn idle_count(&self) -> usize {
        self.shared.idle_count.load(Ordering::Acquire)
    }

    fn lease(&self, worker: Arc<TaskWorker>) -> PooledWorker {
        PooledWorker {
            worker,
            shared: Arc::clone(&self.shared),
            returned: AtomicBool::new(false),
        }
    }

    /// Check a worker out, suspending while all workers are leased and the
    /// pool is at its bound.
    pub async fn get(&self) -> Result<PooledWorker, WorkerError> {
        loop {
            if !self.shared.running.load(Ordering::Acquire) {
                return Err(WorkerError::PoolShutdown);
            }

            // Fast path: an idle worker is waiting.
            let recycled = self.shared.idle_rx.lock().await.try_recv().ok();
            if let Some(worker) = recycled {
                self.shared.idle_count.fetch_sub(1, Ordering::AcqRel);
                if worker.is_running() {
                    return Ok(self.lease(worker));
                }
                // Died while idle; replace it through the grow path.
                self.shared.deregister(&worker);
                continue;
            }

            // Grow while under the bound.
            {
                let mut workers = self
                    .shared
                    .workers
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                if workers.len() < self.max_size {
                    let worker = Arc::new(self.factory.create()?);
                    workers.push(Arc::clone(&worker));
                    tracing::debug!(workers = workers.len(), "created pool worker");
                    return Ok(self.lease(worker));
                }
            }

            // At the bound with every worker leased: wait for a return, a
            // vacancy from a dead return, or the pool closing.
            let closed = self.shared.closed.notified();
            tokio::pin!(closed);
            closed.as_mut().enable();
            let vacancy = self.shared.vacancy.notified();
            tokio::pin!(vacancy);
            vacancy.as_mut().enable();

            if !self.shared.running.load(Ordering::Acquire) {
                return Err(WorkerError::PoolShutdown);
            }
            // A deregistration between the grow check above and enabling the
            // vacancy waiter would otherwise go unseen.
            {
                let workers = self
                    .shared
                    .workers
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                if workers.len() < self.max_size {
                    continue;
                }
            }

            let mut rx = self.shared.idle_rx.lock().await;
            tokio::select! {
                biased;

                returned = rx.recv() => {
                    drop(rx);
                    match returned {
                        Some(worker) => {
                            self.shared.idle_count.fetch_sub(1, Ordering::AcqRel);
                            if self.shared.running.load(Ordering::Acquire)
                                && worker.is_running()
                            {
                                return Ok(self.lease(worker));
                            }
                            self.shared.deregister(&worker);
                        }
                        None => return Err(WorkerError::PoolShutdown),
                    }
                }

                _ = &mut closed => {}

                _ = &mut vacancy => {}
            }
        }
    }

    /// Tear this pool down and build an empty replacement over the same
    /// factory and bound.
    pub async fn restart(&self, force: bool) -> Result<WorkerPool, WorkerError> {
        if force {
            self.kill();
        } else if let Err(e) = self.shutdown().await {
            tracing::debug!(error = %e, "old pool failed during restart drain");
        }
        WorkerPool::with_max_size(Arc::clone(&self.factory), self.max_size)
    }

    fn close(&self) -> Vec<Arc<TaskWorker>> {
        self.shared.running.store(false, Ordering::Release);
        self.shared.closed.notify_waiters();

        // Drop idle entries; every one of them is also in the registry
        // snapshot below. A waiter holding the queue lock is on its way out
        // through the `closed` wakeup.
        if let Ok(mut rx) = self.shared.idle_rx.try_lock() {
            while rx.try_recv().is_ok() {}
        }
        self.shared.idle_count.store(0, Ordering::Release);

        let mut workers = self
            .shared
            .workers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        std::mem::take(&mut *workers)
    }
}

#[async_trait]
impl Worker for WorkerPool {
    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    fn is_idle(&self) -> bool {
        self.idle_count() > 0 || self.worker_count() == 0
    }

    async fn enqueue(&self, task: TaskSpec) -> Result<serde_json::Value, WorkerError> {
        let worker = self.get().await?;
        worker.enqueue(task).await
        // Lease drops here, returning the worker.
    }

    /// Gracefully stop every worker. The pool's exit code is the first
    /// failure if any worker's shutdown failed, otherwise the first nonzero
    /// worker exit code, otherwise zero.
    async fn shutdown(&self) -> Result<i32, WorkerError> {
        self.exit
            .get_or_init(|| async {
                let workers = self.close();
                tracing::debug!(workers = workers.len(), "shutting pool down");

                let mut aggregate: Result<i32, WorkerError> = Ok(0);
                for worker in workers {
                    match worker.shutdown().await {
                        Ok(0) => {}
                        Ok(code) => {
                            if matches!(aggregate, Ok(0)) {
                                aggregate = Ok(code);
                            }
                        }
                        Err(e) => {
                            if aggregate.is_ok() {
                                aggregate = Err(e);
                            }
                        }
                    }
                }
                aggregate
            })
            .await
            .clone()
    }

    fn kill(&self) {
        for worker in self.close() {
            worker.kill();
        }
        if self.exit.set(Err(WorkerError::Killed)).is_ok() {
            tracing::debug!("pool killed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NeverCalled;

    impl WorkerFactory for NeverCalled {
        fn create(&self) -> Result<TaskWorker, WorkerError> {
            panic!("the factory must not run for these tests");
        }
    }

    #[test]
    fn zero_sized_pool_is_rejected() {
        assert!(matches!(
            WorkerPool::with_max_size(Arc::new(NeverCalled), 0),
            Err(WorkerError::InvalidPoolSize)
        ));
    }

    #[test]
    fn default_bound_applies() {
        let pool = WorkerPool::new(Arc::new(NeverCalled));
        assert_eq!(pool.max_size(), DEFAULT_MAX_SIZE);
        assert_eq!(pool.worker_count(), 0);
        assert!(pool.is_running());
        assert!(pool.is_idle());
    }

    #[tokio::test]
    async fn get_after_shutdown_is_refused() {
        let pool = WorkerPool::new(Arc::new(NeverCalled));
        assert_eq!(pool.shutdown().await.unwrap(), 0);
        assert!(!pool.is_running());
        assert!(matches!(pool.get().await, Err(WorkerError::PoolShutdown)));
    }
}
