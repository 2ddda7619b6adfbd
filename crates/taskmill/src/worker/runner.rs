//! Unit-side task loop and worker-process entry point.
//!
//! [`serve_tasks`] is the receive-dispatch-respond loop every unit runs,
//! whether it lives in a spawned process or a thread. [`run_worker`] wraps it
//! with the process-side handshake so a worker binary is a `main` of a few
//! lines around a [`TaskHandler`].

use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::io::AsyncReadExt;

use crate::channel::protocol::{Outcome, RemoteFault, TaskSpec, UnitRequest, UnitResponse};
use crate::context::transport::{connect, connect_info_from_env, KEY_LENGTH};
use crate::context::UnitChannel;

/// Application logic executed inside a unit, one call per job.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn run(&self, task: TaskSpec) -> Result<serde_json::Value, RemoteFault>;
}

fn panic_fault(payload: Box<dyn std::any::Any + Send>) -> RemoteFault {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "task panicked".into());
    RemoteFault::new("panic", message)
}

/// Serve jobs from the channel until a shutdown request or channel failure.
///
/// Panics in the handler are caught and reported as failed task results; the
/// loop keeps serving. The return value is the unit's exit result: exit code
/// zero after a clean shutdown, or the fault that stopped the loop.
pub async fn serve_tasks<H: TaskHandler>(
    channel: Arc<UnitChannel>,
    handler: Arc<H>,
) -> Result<serde_json::Value, RemoteFault> {
    loop {
        let request = match channel.receive().await {
            Ok(request) => request,
            Err(crate::channel::ChannelError::Closed) => {
                // Controller went away without a shutdown request.
                return Err(RemoteFault::new("channel", "the channel closed unexpectedly"));
            }
            Err(e) => return Err(RemoteFault::new("channel", e.to_string())),
        };

        match request {
            UnitRequest::Job { id, task } => {
                let name = task.name.clone();
                tracing::debug!(job_id = %id, task = %name, "running task");

                let run = std::panic::AssertUnwindSafe(handler.run(task));
                let outcome = match run.catch_unwind().await {
                    Ok(Ok(value)) => Outcome::success(value),
                    Ok(Err(fault)) => Outcome::failure(fault),
                    Err(payload) => Outcome::failure(panic_fault(payload)),
                };

                let response = UnitResponse::TaskResult { id, outcome };
                if let Err(e) = channel.send(response).await {
                    match e {
                        crate::channel::ChannelError::Serialization(message) => {
                            // The value was computed but cannot cross the
                            // wire; tell the controller that instead.
                            let substitute = UnitResponse::TaskResult {
                                id,
                                outcome: Outcome::failure(RemoteFault::new(
                                    "serialization",
                                    format!("failed to serialize the task result: {message}"),
                                )),
                            };
                            channel
                                .send(substitute)
                                .await
                                .map_err(|e| RemoteFault::new("channel", e.to_string()))?;
                        }
                        e => return Err(RemoteFault::new("channel", e.to_string())),
                    }
                }
            }
            UnitRequest::Shutdown => {
                tracing::debug!("shutdown requested");
                return Ok(serde_json::json!(0));
            }
        }
    }
}

/// Full lifecycle of a worker process: handshake, serve, report exit.
///
/// Reads the authentication key from stdin, connects to the controller's
/// socket from the environment, sends the hello, and runs [`serve_tasks`].
/// An `Err` return means the caller should exit nonzero.
pub async fn run_worker<H: TaskHandler>(handler: H) -> std::io::Result<()> {
    let mut key = [0u8; KEY_LENGTH];
    tokio::io::stdin().read_exact(&mut key).await?;
    let key = String::from_utf8(key.to_vec())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let info = connect_info_from_env()?;
    let stream = connect(info).await?;
    let channel = Arc::new(UnitChannel::from_stream(stream));

    channel
        .send(UnitResponse::Hello { key })
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::BrokenPipe, e.to_string()))?;
    tracing::debug!("handshake sent, serving tasks");

    let result = serve_tasks(Arc::clone(&channel), Arc::new(handler)).await;
    channel
        .send_exit(result)
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::BrokenPipe, e.to_string()))
}
