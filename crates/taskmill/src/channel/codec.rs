//! Framed codec for unit communication.
//!
//! Frame layout: `[1-byte type][4-byte big-endian length][length bytes of JSON]`.
//! The type byte doubles as a transport self-check: only [`FRAME_DATA`] is a
//! legitimate value, so a stream that has lost framing is detected at the
//! header instead of producing garbage payloads.

use std::io;
use std::marker::PhantomData;

use serde::{de::DeserializeOwned, Serialize};
use tokio_util::bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::ChannelError;

/// The only frame type currently on the wire. 0x00 is reserved.
pub const FRAME_DATA: u8 = 0x01;

/// Frame header size: type byte plus length field.
pub const HEADER_LEN: usize = 5;

/// Upper bound on a declared payload length. A header claiming more than this
/// is treated as stream corruption, not as an allocation request.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Codec framing serde-serializable messages of type `T`.
pub struct FrameCodec<T> {
    _phantom: PhantomData<T>,
}

impl<T> Default for FrameCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FrameCodec<T> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for FrameCodec<T> {
    type Item = T;
    type Error = ChannelError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        let frame_type = src[0];
        let length = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;

        if frame_type != FRAME_DATA || length > MAX_FRAME_LEN {
            return Err(ChannelError::Framing {
                header: src[..HEADER_LEN].to_vec(),
            });
        }

        if src.len() < HEADER_LEN + length {
            src.reserve(HEADER_LEN + length - src.len());
            return Ok(None);
        }

        let _ = src.split_to(HEADER_LEN);
        let payload = src.split_to(length);

        let item = serde_json::from_slice(&payload)
            .map_err(|e| ChannelError::Serialization(e.to_string()))?;
        Ok(Some(item))
    }
}

impl<T: Serialize> Encoder<T> for FrameCodec<T> {
    type Error = ChannelError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        // Serialize before touching the buffer so an unserializable value
        // never leaves a partial frame on the transport.
        let json =
            serde_json::to_vec(&item).map_err(|e| ChannelError::Serialization(e.to_string()))?;

        if json.len() > MAX_FRAME_LEN {
            return Err(ChannelError::Serialization(format!(
                "message of {} bytes exceeds maximum frame length",
                json.len()
            )));
        }

        tracing::trace!(payload_bytes = json.len(), "encoding frame");

        dst.reserve(HEADER_LEN + json.len());
        dst.put_u8(FRAME_DATA);
        dst.put_u32(json.len() as u32);
        dst.extend_from_slice(&json);
        Ok(())
    }
}

impl From<io::Error> for ChannelError {
    fn from(e: io::Error) -> Self {
        ChannelError::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::protocol::{JobId, Outcome, TaskSpec, UnitRequest, UnitResponse};

    #[test]
    fn codec_roundtrip_job() {
        let mut codec = FrameCodec::<UnitRequest>::new();
        let mut buf = BytesMut::new();

        let id = JobId::new();
        let req = UnitRequest::Job {
            id,
            task: TaskSpec::new("echo", serde_json::json!({"x": 1})),
        };
        codec.encode(req, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        match decoded {
            UnitRequest::Job { id: got, task } => {
                assert_eq!(got, id);
                assert_eq!(task.name, "echo");
            }
            other => panic!("wrong variant: {:?}", other),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn codec_roundtrip_exit() {
        let mut codec = FrameCodec::<UnitResponse>::new();
        let mut buf = BytesMut::new();

        let resp = UnitResponse::Exit {
            outcome: Outcome::success(serde_json::json!(0)),
        };
        codec.encode(resp, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert!(matches!(decoded, UnitResponse::Exit { .. }));
    }

    #[test]
    fn decode_waits_for_full_header() {
        let mut codec = FrameCodec::<serde_json::Value>::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[FRAME_DATA, 0, 0]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decode_waits_for_full_payload() {
        let mut codec = FrameCodec::<serde_json::Value>::new();
        let mut full = BytesMut::new();
        codec
            .encode(serde_json::json!({"k": "value"}), &mut full)
            .unwrap();

        // Feed the frame one byte at a time; only the final byte yields a message.
        let mut buf = BytesMut::new();
        let bytes = full.to_vec();
        for (i, b) in bytes.iter().enumerate() {
            buf.put_u8(*b);
            let result = codec.decode(&mut buf).unwrap();
            if i + 1 < bytes.len() {
                assert!(result.is_none());
            } else {
                assert_eq!(result.unwrap(), serde_json::json!({"k": "value"}));
            }
        }
    }

    #[test]
    fn invalid_type_byte_is_framing_error() {
        let mut codec = FrameCodec::<serde_json::Value>::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x00, 0, 0, 0, 2]);
        buf.extend_from_slice(b"{}");

        match codec.decode(&mut buf) {
            Err(ChannelError::Framing { header }) => {
                assert_eq!(header, vec![0x00, 0, 0, 0, 2]);
            }
            other => panic!("expected framing error, got {:?}", other),
        }
    }

    #[test]
    fn implausible_length_is_framing_error() {
        let mut codec = FrameCodec::<serde_json::Value>::new();
        let mut buf = BytesMut::new();
        buf.put_u8(FRAME_DATA);
        buf.put_u32(u32::MAX);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ChannelError::Framing { .. })
        ));
    }

    #[test]
    fn garbage_payload_is_serialization_error() {
        let mut codec = FrameCodec::<serde_json::Value>::new();
        let mut buf = BytesMut::new();
        buf.put_u8(FRAME_DATA);
        buf.put_u32(4);
        buf.extend_from_slice(&[0xff, 0xfe, 0xfd, 0xfc]);

        match codec.decode(&mut buf) {
            Err(ChannelError::Serialization(_)) => {}
            other => panic!("expected serialization error, got {:?}", other),
        }
        // The broken frame was consumed; the buffer is usable again.
        assert!(buf.is_empty());
    }

    #[test]
    fn encode_failure_writes_nothing() {
        struct Unserializable;
        impl serde::Serialize for Unserializable {
            fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
                Err(serde::ser::Error::custom("refused"))
            }
        }

        let mut codec = FrameCodec::<Unserializable>::new();
        let mut buf = BytesMut::new();
        assert!(matches!(
            codec.encode(Unserializable, &mut buf),
            Err(ChannelError::Serialization(_))
        ));
        assert!(buf.is_empty());
    }
}
