//! Length-framed, serializing duplex channel between controller and unit.
//!
//! A [`FramedChannel`] pairs the read and write halves of a byte stream with
//! [`FrameCodec`]. Sends are serialized behind a writer lock so two frames can
//! never interleave; receives suspend until the codec yields one message or
//! the stream closes.

pub mod codec;
pub mod protocol;

use std::sync::atomic::{AtomicBool, Ordering};

use futures::{SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{Mutex, Notify};
use tokio_util::codec::{FramedRead, FramedWrite};

use codec::FrameCodec;

/// Channel-level faults, split so callers can react per class: a framing
/// fault is fatal to the channel, a serialization fault only to the one
/// message involved.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    /// The peer sent bytes that cannot be a legitimate frame header. The
    /// transport is corrupt; the channel must not be used further.
    #[error("malformed frame header {header:02x?}")]
    Framing { header: Vec<u8> },

    /// A value failed to serialize on send, or a well-framed payload failed
    /// to deserialize on receive. The transport itself is intact.
    #[error("message serialization failed: {0}")]
    Serialization(String),

    /// The stream closed before a complete frame arrived.
    #[error("the channel closed unexpectedly")]
    Closed,

    #[error("channel i/o error: {0}")]
    Io(String),
}

/// Duplex channel sending `Tx` frames and receiving `Rx` frames.
pub struct FramedChannel<Tx, Rx> {
    writer: Mutex<FramedWrite<OwnedWriteHalf, FrameCodec<Tx>>>,
    reader: Mutex<FramedRead<OwnedReadHalf, FrameCodec<Rx>>>,
    closed: AtomicBool,
    close_notify: Notify,
}

impl<Tx, Rx> FramedChannel<Tx, Rx>
where
    Tx: Serialize + Send,
    Rx: DeserializeOwned + Send,
{
    pub fn new(read: OwnedReadHalf, write: OwnedWriteHalf) -> Self {
        Self {
            writer: Mutex::new(FramedWrite::new(write, FrameCodec::new())),
            reader: Mutex::new(FramedRead::new(read, FrameCodec::new())),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        }
    }

    pub fn from_stream(stream: UnixStream) -> Self {
        let (read, write) = stream.into_split();
        Self::new(read, write)
    }

    /// Encode and write one complete frame.
    ///
    /// A serialization failure surfaces here without writing anything, so the
    /// channel stays usable for later messages.
    pub async fn send(&self, message: Tx) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }

        let mut writer = self.writer.lock().await;
        writer.send(message).await
    }

    /// Suspend until one decoded message arrives.
    pub async fn receive(&self) -> Result<Rx, ChannelError> {
        let notified = self.close_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_closed() {
            return Err(ChannelError::Closed);
        }

        let mut reader = self.reader.lock().await;
        tokio::select! {
            biased;

            frame = reader.next() => match frame {
                Some(Ok(message)) => Ok(message),
                Some(Err(e)) => Err(e),
                None => Err(ChannelError::Closed),
            },

            _ = &mut notified => Err(ChannelError::Closed),
        }
    }

    /// Close the channel. Idempotent; wakes any pending `receive`.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close_notify.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl FramedChannel<protocol::UnitResponse, protocol::UnitRequest> {
    /// Send the unit's final exit result.
    ///
    /// If the result itself fails to serialize, a substitute failure
    /// describing the serialization fault is sent instead; that frame is
    /// trivially serializable, so the controller always learns why.
    pub async fn send_exit(
        &self,
        result: Result<serde_json::Value, protocol::RemoteFault>,
    ) -> Result<(), ChannelError> {
        let outcome = match result {
            Ok(value) => protocol::Outcome::success(value),
            Err(fault) => protocol::Outcome::failure(fault),
        };

        match self.send(protocol::UnitResponse::Exit { outcome }).await {
            Err(ChannelError::Serialization(message)) => {
                let substitute = protocol::Outcome::failure(protocol::RemoteFault::new(
                    "serialization",
                    format!("failed to serialize the exit result: {message}"),
                ));
                self.send(protocol::UnitResponse::Exit {
                    outcome: substitute,
                })
                .await
            }
            other => other,
        }
    }
}
