//! Wire encoding for messages.
//!
//! Messages are encoded as MessagePack with named fields. Several encoded messages can be packed into a
//! single body with [`encode_frames`], each prefixed by a big-endian `u32` length, which is the framing
//! used on TCP connections and in HTTP long-poll bodies alike.

use bytes::{Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// A message that can travel over a wire transport.
pub trait WireMessage: Serialize + DeserializeOwned + Send + 'static {}

impl<M> WireMessage for M where M: Serialize + DeserializeOwned + Send + 'static {}

/// Largest frame accepted on the wire.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// An error that occurs during codec encode/decode operations.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The message could not be serialized.
    #[error("failed to encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    /// The bytes could not be deserialized into a message.
    #[error("failed to decode message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    /// A frame header was invalid or a frame exceeded [`MAX_FRAME_LENGTH`].
    #[error("invalid frame: {0}")]
    Frame(#[from] std::io::Error),
    /// Bytes were left over after the last complete frame.
    #[error("{0} trailing bytes after last frame")]
    TrailingBytes(usize),
}

/// Builds the length-delimited codec used for all framing.
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Serializes a message into a MessagePack payload.
pub fn encode<M: Serialize>(message: &M) -> Result<Bytes, CodecError> {
    Ok(Bytes::from(rmp_serde::to_vec_named(message)?))
}

/// Deserializes a MessagePack payload into a message.
pub fn decode<M: DeserializeOwned>(bytes: &[u8]) -> Result<M, CodecError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// Packs encoded payloads into a single length-delimited body.
pub fn encode_frames<I>(frames: I) -> Result<Bytes, CodecError>
where
    I: IntoIterator<Item = Bytes>,
{
    let mut codec = frame_codec();
    let mut buf = BytesMut::new();
    for frame in frames {
        codec.encode(frame, &mut buf)?;
    }
    Ok(buf.freeze())
}

/// Splits a length-delimited body back into its payloads.
pub fn decode_frames(body: &[u8]) -> Result<Vec<Bytes>, CodecError> {
    let mut codec = frame_codec();
    let mut buf = BytesMut::from(body);
    let mut frames = Vec::new();
    while let Some(frame) = codec.decode(&mut buf)? {
        frames.push(frame.freeze());
    }
    if !buf.is_empty() {
        return Err(CodecError::TrailingBytes(buf.len()));
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_keep_boundaries() -> Result<(), CodecError> {
        let first = encode(&"ping".to_string())?;
        let second = encode(&vec![1u32, 2, 3])?;

        let body = encode_frames([first, second])?;
        let frames = decode_frames(&body)?;

        assert_eq!(frames.len(), 2);
        assert_eq!(decode::<String>(&frames[0])?, "ping");
        assert_eq!(decode::<Vec<u32>>(&frames[1])?, vec![1, 2, 3]);
        Ok(())
    }

    #[test]
    fn empty_body_has_no_frames() -> Result<(), CodecError> {
        assert!(decode_frames(&[])?.is_empty());
        Ok(())
    }

    #[test]
    fn truncated_body_is_rejected() -> Result<(), CodecError> {
        let body = encode_frames([encode(&"pong".to_string())?])?;
        let err = decode_frames(&body[..body.len() - 1]).unwrap_err();
        assert!(matches!(err, CodecError::TrailingBytes(_)));
        Ok(())
    }
}
