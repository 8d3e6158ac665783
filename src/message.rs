//! Application messages and the factory that decodes them.
//!
//! The connection core treats message payloads as opaque: a body knows how
//! to encode itself onto a bit stream, and the application-supplied
//! [`MessageFactory`] owns the type-tag dispatch needed to decode one. The
//! factory must be identical on both endpoints.

use std::any::Any;
use std::fmt;

use bytes::Bytes;
use tracing::warn;

use crate::coding::{self, BitCounter, BitReader, WriteBits};

/// User-defined message payload, opaque to the connection core
pub trait MessageBody: Any + fmt::Debug {
    /// Append the wire encoding of the body to the stream
    ///
    /// Called both for serialization and, against a [`BitCounter`], for
    /// measurement, so the encoding must be deterministic.
    fn encode(&self, stream: &mut dyn WriteBits) -> coding::Result<()>;
}

/// Decodes message bodies from their 16-bit type tag
///
/// Supplied by the application; both endpoints of a connection must use
/// identical factories or they will fail to deserialize each other.
pub trait MessageFactory {
    /// Largest type tag [`decode_body`](Self::decode_body) accepts
    fn max_message_type(&self) -> u16;

    /// Construct the body for `message_type` from the stream
    fn decode_body(
        &self,
        message_type: u16,
        stream: &mut BitReader,
    ) -> coding::Result<Box<dyn MessageBody>>;
}

/// An application-level message: a type tag, a channel-assigned id, an
/// optional attached block of bytes, and an opaque body
#[derive(Debug)]
pub struct Message {
    message_type: u16,
    id: u16,
    block: Option<Bytes>,
    body: Box<dyn MessageBody>,
}

impl Message {
    pub fn new(message_type: u16, body: Box<dyn MessageBody>) -> Self {
        Self {
            message_type,
            id: 0,
            block: None,
            body,
        }
    }

    /// A message carrying a block of bytes, possibly larger than a packet
    pub fn with_block(message_type: u16, body: Box<dyn MessageBody>, block: Bytes) -> Self {
        Self {
            message_type,
            id: 0,
            block: Some(block),
            body,
        }
    }

    pub fn message_type(&self) -> u16 {
        self.message_type
    }

    /// Message id; assigned by the reliable channel on send, and equal to
    /// the packet sequence on the unreliable receive side
    pub fn id(&self) -> u16 {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: u16) {
        self.id = id;
    }

    pub fn block(&self) -> Option<&[u8]> {
        self.block.as_deref()
    }

    pub fn take_block(&mut self) -> Option<Bytes> {
        self.block.take()
    }

    pub(crate) fn set_block(&mut self, block: Bytes) {
        self.block = Some(block);
    }

    /// Downcast the body to its concrete type
    pub fn body<T: MessageBody>(&self) -> Option<&T> {
        let any: &dyn Any = &*self.body;
        any.downcast_ref::<T>()
    }

    pub(crate) fn encode_body(&self, stream: &mut dyn WriteBits) -> coding::Result<()> {
        self.body.encode(stream)
    }

    /// Size of the encoded body in bits, via the measurement stream
    pub(crate) fn measured_bits(&self) -> usize {
        let mut counter = BitCounter::new();
        match self.body.encode(&mut counter) {
            Ok(()) => counter.bits_written(),
            Err(_) => {
                // a body that cannot even be measured can never be packed
                warn!(message_type = self.message_type, "message body failed to measure");
                debug_assert!(false, "message body failed to measure");
                usize::MAX
            }
        }
    }
}
