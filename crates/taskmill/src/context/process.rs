//! Process-backed execution context.
//!
//! `start()` binds a fresh Unix listener, spawns the unit through a
//! [`UnitSpawner`], pushes a random authentication key down the child's
//! stdin, and requires the first channel message to echo that key back. A
//! unit that connects to the wrong endpoint can never pass the handshake.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

use crate::channel::protocol::{UnitRequest, UnitResponse};
use crate::channel::ChannelError;

use super::transport::{generate_key, UnitListener, CONNECT_INFO_ENV};
use super::{await_handshake, Context, ContextError, ControllerChannel, Lifecycle};

const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn unit process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different unit spawn strategies.
///
/// The spawner receives the serialized connect info and must arrange for the
/// child to see it (the default puts it in the environment) and for stdin to
/// be piped so the controller can deliver the handshake key.
pub trait UnitSpawner: Send + Sync {
    fn spawn(&self, connect_info: &str) -> Result<Child, SpawnError>;
}

/// Spawner running a configurable worker program.
///
/// stdout and stderr are inherited: unit logging is the host binary's
/// explicit concern, not something the protocol redirects behind its back.
pub struct CommandSpawner {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl UnitSpawner for CommandSpawner {
    fn spawn(&self, connect_info: &str) -> Result<Child, SpawnError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env(CONNECT_INFO_ENV, connect_info)
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        for (key, value) in &self.envs {
            command.env(key, value);
        }
        Ok(command.spawn()?)
    }
}

/// Execution context backed by a spawned OS process.
pub struct ProcessContext {
    spawner: Arc<dyn UnitSpawner>,
    start_timeout: Duration,
    lifecycle: Lifecycle,
    channel: StdMutex<Option<Arc<ControllerChannel>>>,
    child: StdMutex<Option<Child>>,
}

impl ProcessContext {
    pub fn new(spawner: Arc<dyn UnitSpawner>) -> Self {
        Self {
            spawner,
            start_timeout: DEFAULT_START_TIMEOUT,
            lifecycle: Lifecycle::new(),
            channel: StdMutex::new(None),
            child: StdMutex::new(None),
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

    async fn start_inner(&self) -> Result<(), ContextError> {
        let listener = UnitListener::bind()
            .map_err(|e| ContextError::Start(format!("failed to bind unit socket: {e}")))?;
        let connect_info = listener
            .connect_info_env()
            .map_err(|e| ContextError::Start(e.to_string()))?;

        let key = generate_key();

        let mut child = self
            .spawner
            .spawn(&connect_info)
            .map_err(|e| ContextError::Start(e.to_string()))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ContextError::Start("unit stdin was not captured".into()))?;

        // Keep the handle around so cleanup can kill a half-started unit.
        *self
            .child
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(child);

        // Key goes over the side channel before the unit opens the socket.
        stdin
            .write_all(key.as_bytes())
            .await
            .map_err(|e| ContextError::Start(format!("failed to deliver handshake key: {e}")))?;
        drop(stdin);

        let stream = tokio::time::timeout(self.start_timeout, listener.accept())
            .await
            .map_err(|_| ContextError::Start("timed out waiting for the unit to connect".into()))?
            .map_err(|e| ContextError::Start(format!("failed to accept unit connection: {e}")))?;

        let channel = Arc::new(ControllerChannel::from_stream(stream));
        await_handshake(&channel, &key, self.start_timeout).await?;

        *self
            .channel
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(channel);
        Ok(())
    }

    /// Mark exited and reap the child, returning its channel for final use.
    fn finish(&self) -> Option<Child> {
        self.lifecycle.exit();
        if let Some(channel) = self
            .channel
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            channel.close();
        }
        self.child
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }
}

#[async_trait]
impl Context for ProcessContext {
    async fn start(&self) -> Result<(), ContextError> {
        if !self.lifecycle.begin_start() {
            return Err(ContextError::AlreadyStarted);
        }

        match self.start_inner().await {
            Ok(()) => {
                self.lifecycle.set_running();
                tracing::debug!("unit process started");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "unit process failed to start");
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
        match channel.receive().await {
            Ok(UnitResponse::Exit { .. }) => {
                self.kill();
                Err(ContextError::Synchronization(
                    "the unit unexpectedly sent its exit result".into(),
                ))
            }
            Ok(message) => Ok(message),
            // A single undecodable payload leaves the transport intact.
            Err(e @ ChannelError::Serialization(_)) => Err(ContextError::Channel(e)),
            Err(e) => {
                self.kill();
                Err(ContextError::Unresponsive(e))
            }
        }
    }

    async fn join(&self) -> Result<serde_json::Value, ContextError> {
        let channel = self.channel()?;
        match channel.receive().await {
            Ok(UnitResponse::Exit { outcome }) => {
                if let Some(mut child) = self.finish() {
                    let _ = child.wait().await;
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
        if let Some(mut child) = self.finish() {
            if let Err(e) = child.start_kill() {
                tracing::trace!(error = %e, "unit process already gone");
            }
            // Dropping the handle hands the zombie to tokio's orphan reaper.
        }
    }

    async fn restart(&self, force: bool) -> Result<Box<dyn Context>, ContextError> {
        if force {
            self.kill();
        } else if self.is_running() {
            // Drain the current unit; its outcome was already observable.
            if let Err(e) = self.join().await {
                tracing::debug!(error = %e, "joining the old unit before restart failed");
            }
        }

        let fresh = ProcessContext::new(Arc::clone(&self.spawner))
            .with_start_timeout(self.start_timeout);
        fresh.start().await?;
        Ok(Box::new(fresh))
    }
}
