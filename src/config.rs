//! Connection and channel configuration.

use std::time::Duration;

/// Most channels a single connection can multiplex
pub const MAX_CHANNELS: usize = 64;

/// Reliability and ordering policy of a channel
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ChannelKind {
    /// Messages are delivered exactly once, in send order, driven by
    /// per-message and per-fragment retransmission
    ReliableOrdered,
    /// Messages are delivered at most once, in packet arrival order;
    /// whatever does not fit the packet budget is dropped
    UnreliableUnordered,
}

/// Per-channel tuning
///
/// The defaults match a 60 Hz game sending modest message volumes. The
/// three queue sizes must each divide 65536 exactly so that
/// sequence-modulo-capacity indexing stays monotone across wraparound.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub kind: ChannelKind,
    /// Reject block messages on this channel
    pub disable_blocks: bool,
    /// Packets remembered for ack translation (reliable only)
    pub sent_packet_buffer_size: usize,
    pub message_send_queue_size: usize,
    pub message_receive_queue_size: usize,
    pub max_messages_per_packet: usize,
    /// Cap in bytes on this channel's share of each packet; `None` means
    /// whatever the packet has left
    pub packet_budget: Option<usize>,
    /// Largest block a message may carry
    pub max_block_size: usize,
    /// Bytes of block data per fragment
    pub block_fragment_size: usize,
    /// Wait before retransmitting an unacked message
    pub message_resend_time: Duration,
    /// Wait before retransmitting an unacked block fragment
    pub block_fragment_resend_time: Duration,
}

impl ChannelConfig {
    pub fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            disable_blocks: false,
            sent_packet_buffer_size: 1024,
            message_send_queue_size: 1024,
            message_receive_queue_size: 1024,
            max_messages_per_packet: 256,
            packet_budget: None,
            max_block_size: 256 * 1024,
            block_fragment_size: 1024,
            message_resend_time: Duration::from_millis(100),
            block_fragment_resend_time: Duration::from_millis(250),
        }
    }

    pub fn max_fragments_per_block(&self) -> usize {
        self.max_block_size.div_ceil(self.block_fragment_size)
    }

    pub(crate) fn validate(&self) {
        for (name, size) in [
            ("sent_packet_buffer_size", self.sent_packet_buffer_size),
            ("message_send_queue_size", self.message_send_queue_size),
            ("message_receive_queue_size", self.message_receive_queue_size),
        ] {
            assert!(size > 0 && 65536 % size == 0, "{name} must divide 65536");
        }
        assert!(self.max_messages_per_packet > 0);
        assert!(self.block_fragment_size > 0);
        assert!(self.max_block_size >= self.block_fragment_size);
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::new(ChannelKind::ReliableOrdered)
    }
}

/// Configuration for a [`Connection`](crate::Connection)
///
/// Both endpoints must agree on every field that shapes the wire format:
/// the channel count and order, per-channel kinds, `max_messages_per_packet`,
/// and the block sizing fields.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Largest datagram the connection will fill
    pub max_packet_size: usize,
    pub channels: Vec<ChannelConfig>,
}

impl ConnectionConfig {
    pub fn new(channels: Vec<ChannelConfig>) -> Self {
        Self {
            max_packet_size: 8 * 1024,
            channels,
        }
    }

    pub(crate) fn validate(&self) {
        assert!(
            !self.channels.is_empty() && self.channels.len() <= MAX_CHANNELS,
            "connection must have between 1 and {MAX_CHANNELS} channels"
        );
        for channel in &self.channels {
            channel.validate();
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new(vec![ChannelConfig::default()])
    }
}
