//! Tokio codec for topic-addressed frames
//!
//! Frame layout:
//! - length: 4 bytes (u32, little-endian), counts every byte that follows
//! - topic: 20 bytes (see [`crate::topic`])
//! - payload: `length - 21` bytes
//! - terminator: 1 NUL byte

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::message::Message;
use crate::topic::{Topic, TOPIC_SIZE};

/// Size of the length prefix in bytes
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum value accepted in a length prefix (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Bytes after the length prefix that are not payload
const FRAME_OVERHEAD: usize = TOPIC_SIZE + 1;

/// Codec for encoding/decoding topic frames
#[derive(Debug, Default)]
pub struct TopicCodec {
    /// Length prefix already consumed for the frame being decoded (if any)
    pending_length: Option<usize>,
}

impl TopicCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self {
            pending_length: None,
        }
    }

    /// Number of bytes `message` occupies on the wire
    pub fn encoded_len(message: &Message) -> usize {
        LENGTH_PREFIX_SIZE + FRAME_OVERHEAD + message.payload.len()
    }
}

impl Decoder for TopicCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let length = match self.pending_length.take() {
            Some(length) => length,
            None => {
                if src.len() < LENGTH_PREFIX_SIZE {
                    return Ok(None);
                }
                let length = src.get_u32_le() as usize;
                if length <= TOPIC_SIZE {
                    return Err(ProtocolError::MalformedFrame(length));
                }
                if length > MAX_FRAME_SIZE {
                    return Err(ProtocolError::FrameTooLarge {
                        size: length,
                        max: MAX_FRAME_SIZE,
                    });
                }
                length
            }
        };

        if src.len() < length {
            src.reserve(length - src.len());
            self.pending_length = Some(length);
            return Ok(None);
        }

        let mut frame = src.split_to(length);
        let topic = Topic::decode(&mut frame).ok_or(ProtocolError::MalformedFrame(length))?;
        let payload = frame.split_to(length - FRAME_OVERHEAD).freeze();

        Ok(Some(Message { topic, payload }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(message) = self.decode(src)? {
            return Ok(Some(message));
        }

        match self.pending_length {
            Some(expected) => Err(ProtocolError::Truncated {
                expected,
                actual: src.len(),
            }),
            None if !src.is_empty() => Err(ProtocolError::Truncated {
                expected: LENGTH_PREFIX_SIZE,
                actual: src.len(),
            }),
            None => Ok(None),
        }
    }
}

impl Encoder<Message> for TopicCodec {
    type Error = ProtocolError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = FRAME_OVERHEAD + message.payload.len();
        if length > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: MAX_FRAME_SIZE,
            });
        }

        dst.reserve(LENGTH_PREFIX_SIZE + length);
        dst.put_u32_le(length as u32);
        message.topic.encode(dst);
        dst.extend_from_slice(&message.payload);
        dst.put_u8(0);

        Ok(())
    }
}
