//! Thread-backed execution context.
//!
//! The unit is a native OS thread driving its own current-thread runtime over
//! one half of a socketpair, so it exchanges the same framed protocol as a
//! process unit. A thread's death is not observable through the socket when
//! the channel has been cloned into other tasks, so `receive`/`join` poll the
//! join handle while suspended and close the channel shortly after the thread
//! dies.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::channel::protocol::{RemoteFault, UnitRequest, UnitResponse};
use crate::channel::ChannelError;

use super::transport::generate_key;
use super::{await_handshake, Context, ContextError, ControllerChannel, Lifecycle, UnitChannel};

/// How often to ask the join handle whether the thread is still alive while a
/// caller is suspended in `receive`/`join`. The exact interval is a tuning
/// knob; the binding guarantee is that data flushed before thread death is
/// still delivered, which the one-interval grace before closing preserves.
const EXIT_CHECK_INTERVAL: Duration = Duration::from_millis(250);

const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(10);

/// Entry point invoked on the unit thread with its channel.
pub type ThreadEntry = Arc<
    dyn Fn(Arc<UnitChannel>) -> BoxFuture<'static, Result<serde_json::Value, RemoteFault>>
        + Send
        + Sync,
>;

/// Execution context backed by a native thread in the host address space.
pub struct ThreadContext {
    entry: ThreadEntry,
    start_timeout: Duration,
    lifecycle: Lifecycle,
    channel: StdMutex<Option<Arc<ControllerChannel>>>,
    handle: StdMutex<Option<std::thread::JoinHandle<()>>>,
}

impl ThreadContext {
    pub fn new<F, Fut>(entry: F) -> Self
    where
        F: Fn(Arc<UnitChannel>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<serde_json::Value, RemoteFault>> + Send + 'static,
    {
        Self::from_entry(Arc::new(move |channel| entry(channel).boxed()))
    }

    pub(crate) fn from_entry(entry: ThreadEntry) -> Self {
        Self {
            entry,
            start_timeout: DEFAULT_START_TIMEOUT,
            lifecycle: Lifecycle::new(),
            channel: StdMutex::new(None),
            handle: StdMutex::new(None),
        }
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    fn channel(&self) -> Result<Arc<ControllerChannel>, ContextError> {
        self.channel
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
            .ok_or(ContextError::NotRunning)
    }

    fn thread_finished(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .map_or(true, |handle| handle.is_finished())
    }

    fn finish(&self) -> Option<std::thread::JoinHandle<()>> {
        self.lifecycle.exit();
        if let Some(channel) = self
            .channel
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            channel.close();
        }
        self.handle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    async fn start_inner(&self) -> Result<(), ContextError> {
        let (controller_stream, unit_stream) = std::os::unix::net::UnixStream::pair()
            .map_err(|e| ContextError::Start(format!("failed to create socket pair: {e}")))?;

        let key = generate_key();
        let entry = Arc::clone(&self.entry);
        let unit_key = key.clone();

        let handle = std::thread::Builder::new()
            .name("taskmill-unit".into())
            .spawn(move || run_unit_thread(unit_stream, unit_key, entry))
            .map_err(|e| ContextError::Start(format!("failed to spawn unit thread: {e}")))?;

        *self
            .handle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handle);

        controller_stream
            .set_nonblocking(true)
            .map_err(|e| ContextError::Start(e.to_string()))?;
        let stream = tokio::net::UnixStream::from_std(controller_stream)
            .map_err(|e| ContextError::Start(e.to_string()))?;

        let channel = Arc::new(ControllerChannel::from_stream(stream));
        await_handshake(&channel, &key, self.start_timeout).await?;

        *self
            .channel
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(channel);
        Ok(())
    }

    /// Receive with liveness polling. The select is biased toward the channel
    /// so buffered data always wins over the death verdict.
    async fn watched_receive(
        &self,
        channel: &ControllerChannel,
    ) -> Result<UnitResponse, ChannelError> {
        let receive = channel.receive();
        tokio::pin!(receive);

        let mut ticker = tokio::time::interval(EXIT_CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut seen_dead = false;

        loop {
            tokio::select! {
                biased;

                result = &mut receive => return result,

                _ = ticker.tick() => {
                    if self.thread_finished() {
                        if seen_dead {
                            // One grace interval has passed since the thread
                            // died; anything it flushed has been decoded.
                            channel.close();
                        }
                        seen_dead = true;
                    }
                }
            }
        }
    }
}

fn run_unit_thread(
    unit_stream: std::os::unix::net::UnixStream,
    key: String,
    entry: ThreadEntry,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "failed to build unit thread runtime");
            return;
        }
    };

    runtime.block_on(async move {
        if let Err(e) = unit_stream.set_nonblocking(true) {
            tracing::error!(error = %e, "failed to configure unit socket");
            return;
        }
        let stream = match tokio::net::UnixStream::from_std(unit_stream) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(error = %e, "failed to register unit socket");
                return;
            }
        };

        let channel = Arc::new(UnitChannel::from_stream(stream));
        if channel.send(UnitResponse::Hello { key }).await.is_err() {
            // Controller is gone; nothing is listening for an error either.
            return;
        }

        let result = entry(Arc::clone(&channel)).await;
        if let Err(e) = channel.send_exit(result).await {
            tracing::debug!(error = %e, "failed to deliver exit result");
        }
    });
}

#[async_trait]
impl Context for ThreadContext {
    async fn start(&self) -> Result<(), ContextError> {
        if !self.lifecycle.begin_start() {
            return Err(ContextError::AlreadyStarted);
        }

        match self.start_inner().await {
            Ok(()) => {
                self.lifecycle.set_running();
                tracing::debug!("unit thread started");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "unit thread failed to start");
                self.kill();
                Err(e)
            }
        }
    }

    fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    async fn send(&self, request: UnitRequest) -> Result<(), ContextError> {
        let channel = self.channel()?;
        channel.send(request).await.map_err(ContextError::from)
    }

    async fn receive(&self) -> Result<UnitResponse, ContextError> {
        let channel = self.channel()?;
        match self.watched_receive(&channel).await {
            Ok(UnitResponse::Exit { .. }) => {
                self.kill();
                Err(ContextError::Synchronization(
                    "the unit unexpectedly sent its exit result".into(),
                ))
            }
            Ok(message) => Ok(message),
            Err(e @ ChannelError::Serialization(_)) => Err(ContextError::Channel(e)),
            Err(e) => {
                self.kill();
                Err(ContextError::Unresponsive(e))
            }
        }
    }

    async fn join(&self) -> Result<serde_json::Value, ContextError> {
        let channel = self.channel()?;
        match self.watched_receive(&channel).await {
            Ok(UnitResponse::Exit { outcome }) => {
                if let Some(handle) = self.finish() {
                    let _ = tokio::task::spawn_blocking(move || handle.join()).await;
                }
                match outcome.into_result() {
                    Ok(value) => Ok(value),
                    Err(fault) => Err(ContextError::Panic {
                        kind: fault.kind,
                        message: fault.message,
                    }),
                }
            }
            Ok(_) => {
                self.kill();
                Err(ContextError::Synchronization(
                    "did not receive an exit result from the unit".into(),
                ))
            }
            Err(e) => {
                self.kill();
                Err(ContextError::Unresponsive(e))
            }
        }
    }

    fn kill(&self) {
        // A thread cannot be terminated from outside; closing the channel is
        // the terminal signal its loop observes. The handle is detached.
        let _ = self.finish();
    }

    async fn restart(&self, force: bool) -> Result<Box<dyn Context>, ContextError> {
        if force {
            self.kill();
        } else if self.is_running() {
            if let Err(e) = self.join().await {
                tracing::debug!(error = %e, "joining the old unit before restart failed");
            }
        }

        let fresh = ThreadContext::from_entry(Arc::clone(&self.entry))
            .with_start_timeout(self.start_timeout);
        fresh.start().await?;
        Ok(Box::new(fresh))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::protocol::{JobId, Outcome, TaskSpec};
    use serde_json::json;

    #[tokio::test]
    async fn join_returns_the_entry_value() {
        let context = ThreadContext::new(|_channel| async { Ok(json!(42)) });

        assert!(!context.is_running());
        context.start().await.unwrap();
        assert!(context.is_running());

        assert_eq!(context.join().await.unwrap(), json!(42));
        assert!(!context.is_running());
    }

    #[tokio::test]
    async fn entry_failure_surfaces_as_panic_error() {
        let context = ThreadContext::new(|_channel| async {
            Err(RemoteFault::new("ValueError", "the entry point exploded"))
        });

        context.start().await.unwrap();
        match context.join().await {
            Err(ContextError::Panic { kind, message }) => {
                assert_eq!(kind, "ValueError");
                assert!(message.contains("exploded"));
            }
            other => panic!("expected panic error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn echoed_job_flows_both_ways() {
        let context = ThreadContext::new(|channel| async move {
            match channel.receive().await {
                Ok(UnitRequest::Job { id, task }) => {
                    channel
                        .send(UnitResponse::TaskResult {
                            id,
                            outcome: Outcome::success(task.input),
                        })
                        .await
                        .map_err(|e| RemoteFault::new("channel", e.to_string()))?;
                    Ok(json!(0))
                }
                _ => Err(RemoteFault::new("protocol", "expected a job")),
            }
        });

        context.start().await.unwrap();

        let id = JobId::new();
        context
            .send(UnitRequest::Job {
                id,
                task: TaskSpec::new("echo", json!("payload")),
            })
            .await
            .unwrap();

        match context.receive().await.unwrap() {
            UnitResponse::TaskResult { id: got, outcome } => {
                assert_eq!(got, id);
                assert_eq!(outcome.into_result().unwrap(), json!("payload"));
            }
            other => panic!("wrong message: {:?}", other),
        }

        assert_eq!(context.join().await.unwrap(), json!(0));
    }

    #[tokio::test]
    async fn exit_result_during_receive_is_a_synchronization_error() {
        let context = ThreadContext::new(|_channel| async { Ok(json!("done")) });
        context.start().await.unwrap();

        assert!(matches!(
            context.receive().await,
            Err(ContextError::Synchronization(_))
        ));
        assert!(!context.is_running());
    }

    #[tokio::test]
    async fn restart_yields_a_fresh_running_context() {
        let context = ThreadContext::new(|_channel| async { Ok(json!(1)) });
        context.start().await.unwrap();

        let fresh = context.restart(false).await.unwrap();
        assert!(!context.is_running());
        assert!(fresh.is_running());
        assert_eq!(fresh.join().await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn forced_restart_skips_the_drain() {
        let context = ThreadContext::new(|channel| async move {
            // Hold until the controller goes away.
            let _ = channel.receive().await;
            Ok(json!(0))
        });
        context.start().await.unwrap();

        let fresh = context.restart(true).await.unwrap();
        assert!(!context.is_running());
        assert!(fresh.is_running());
        fresh.kill();
    }
}
