//! Length-prefixed message framing
//!
//! ```text
//! +-------------------+-----------+------------------+
//! | length (u32, LE)  |  prefix   |       body       |
//! |     4 bytes       |  4 bytes  | length - 4 bytes |
//! +-------------------+-----------+------------------+
//! ```
//!
//! `length` counts everything after itself (prefix + body).

use crate::network::message::Message;
use crate::network::registry::MessageRegistry;
use crate::wire::{MessagePrefix, WireError, PREFIX_SIZE};
use bytes::{Buf, BufMut, BytesMut};
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};

/// Size of the length field
pub const LENGTH_SIZE: usize = 4;

/// Default maximum frame length (prefix + body)
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 256 * 1024;

/// Message codec for length-prefixed framing
#[derive(Debug, Clone)]
pub struct FrameCodec {
    registry: Arc<MessageRegistry>,
    max_length: usize,
}

impl FrameCodec {
    pub fn new(registry: Arc<MessageRegistry>, max_length: usize) -> Self {
        Self {
            registry,
            max_length,
        }
    }

    /// Full encoded size of a message, including the length field
    pub fn frame_size(message: &Message) -> usize {
        LENGTH_SIZE + PREFIX_SIZE + message.body_size()
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least the length field
        if src.len() < LENGTH_SIZE {
            return Ok(None);
        }

        let length = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length < PREFIX_SIZE {
            return Err(WireError::Malformed(format!(
                "frame length {} shorter than prefix",
                length
            )));
        }
        if length > self.max_length {
            return Err(WireError::MessageTooLarge {
                size: length,
                max: self.max_length,
            });
        }

        // Check if we have the full frame
        if src.len() < LENGTH_SIZE + length {
            src.reserve(LENGTH_SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_SIZE);
        let frame = src.split_to(length);

        let mut raw_prefix = [0u8; PREFIX_SIZE];
        raw_prefix.copy_from_slice(&frame[..PREFIX_SIZE]);
        let prefix = MessagePrefix::new(raw_prefix)?;
        let kind = self.registry.kind_of(&prefix)?;

        Message::decode_body(kind, &frame[PREFIX_SIZE..]).map(Some)
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = WireError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let prefix = self.registry.prefix_of(item.kind())?;
        let length = PREFIX_SIZE + item.body_size();

        if length > self.max_length {
            return Err(WireError::MessageTooLarge {
                size: length,
                max: self.max_length,
            });
        }

        dst.reserve(LENGTH_SIZE + length);
        dst.put_u32_le(length as u32);
        dst.put_slice(prefix.as_bytes());
        item.encode_body(dst);

        Ok(())
    }
}
