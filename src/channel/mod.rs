//! Message channels: independent streams within a connection, each with a
//! fixed reliability/ordering policy.

use std::time::Instant;

use thiserror::Error;

use crate::config::{ChannelConfig, ChannelKind};
use crate::frame::{IncomingData, OutgoingData};
use crate::message::{Message, MessageFactory};

mod reliable;
mod unreliable;

pub use reliable::ReliableChannel;
pub use unreliable::UnreliableChannel;

/// Sticky channel failure states
///
/// Once set, the channel accepts no further sends, delivers no further
/// messages and ignores incoming packet data until it is reset. The owning
/// client or server is expected to observe the error and disconnect.
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum ChannelError {
    /// A send was attempted on a full send queue
    #[error("message send queue is full")]
    SendQueueFull,
    /// The peer sent data inconsistent with this channel's receive state
    #[error("channel desynchronized")]
    Desync,
    /// An incoming channel entry could not be deserialized
    #[error("failed to deserialize channel data")]
    FailedToDeserialize,
    /// A block fragment arrived on a channel configured without blocks
    #[error("block messages are disabled on this channel")]
    BlocksDisabled,
    /// Storage for a block could not be allocated
    #[error("out of memory")]
    OutOfMemory,
}

/// Per-channel counters, reset with [`Channel::reset_counters`]
#[derive(Debug, Default, Copy, Clone)]
pub struct ChannelCounters {
    pub messages_sent: u64,
    pub messages_received: u64,
    /// Unreliable messages discarded for lack of packet budget or queue
    /// space; always zero on reliable channels
    pub messages_dropped: u64,
}

/// A single channel of a connection
///
/// Channels are a closed set of two policies, so they are a sum type rather
/// than a trait object; the connection dispatches on the variant.
#[derive(Debug)]
pub enum Channel {
    Reliable(ReliableChannel),
    Unreliable(UnreliableChannel),
}

impl Channel {
    pub(crate) fn new(config: ChannelConfig, index: usize, now: Instant) -> Self {
        config.validate();
        match config.kind {
            ChannelKind::ReliableOrdered => {
                Self::Reliable(ReliableChannel::new(config, index, now))
            }
            ChannelKind::UnreliableUnordered => {
                Self::Unreliable(UnreliableChannel::new(config, index))
            }
        }
    }

    /// Whether a message sent right now would be accepted
    pub fn can_send_message(&self) -> bool {
        match self {
            Self::Reliable(channel) => channel.can_send_message(),
            Self::Unreliable(channel) => channel.can_send_message(),
        }
    }

    pub fn has_messages_to_send(&self) -> bool {
        match self {
            Self::Reliable(channel) => channel.has_messages_to_send(),
            Self::Unreliable(channel) => channel.has_messages_to_send(),
        }
    }

    /// Enqueue a message; on failure the message is dropped and the channel
    /// error level records why
    pub fn send_message(&mut self, message: Message) {
        match self {
            Self::Reliable(channel) => channel.send_message(message),
            Self::Unreliable(channel) => channel.send_message(message),
        }
    }

    /// Dequeue the next message owed to the application, if any
    pub fn receive_message(&mut self) -> Option<Message> {
        match self {
            Self::Reliable(channel) => channel.receive_message(),
            Self::Unreliable(channel) => channel.receive_message(),
        }
    }

    pub fn error(&self) -> Option<ChannelError> {
        match self {
            Self::Reliable(channel) => channel.error(),
            Self::Unreliable(channel) => channel.error(),
        }
    }

    pub fn counters(&self) -> &ChannelCounters {
        match self {
            Self::Reliable(channel) => channel.counters(),
            Self::Unreliable(channel) => channel.counters(),
        }
    }

    pub fn reset_counters(&mut self) {
        match self {
            Self::Reliable(channel) => channel.reset_counters(),
            Self::Unreliable(channel) => channel.reset_counters(),
        }
    }

    /// Release all queued messages and return to the initial state
    pub fn reset(&mut self) {
        match self {
            Self::Reliable(channel) => channel.reset(),
            Self::Unreliable(channel) => channel.reset(),
        }
    }

    pub(crate) fn advance_time(&mut self, now: Instant) {
        match self {
            Self::Reliable(channel) => channel.advance_time(now),
            Self::Unreliable(_) => {}
        }
    }

    pub(crate) fn generate_packet_data(
        &mut self,
        packet_sequence: u16,
        available_bits: usize,
        factory: &dyn MessageFactory,
    ) -> Option<(OutgoingData, usize)> {
        match self {
            Self::Reliable(channel) => {
                channel.generate_packet_data(packet_sequence, available_bits, factory)
            }
            Self::Unreliable(channel) => {
                channel.generate_packet_data(available_bits, factory)
            }
        }
    }

    pub(crate) fn process_packet_data(&mut self, data: IncomingData, packet_sequence: u16) {
        match self {
            Self::Reliable(channel) => channel.process_packet_data(data),
            Self::Unreliable(channel) => channel.process_packet_data(data, packet_sequence),
        }
    }

    pub(crate) fn process_ack(&mut self, ack: u16) {
        match self {
            Self::Reliable(channel) => channel.process_ack(ack),
            // unreliable channels do not track sent packets
            Self::Unreliable(_) => {}
        }
    }
}
