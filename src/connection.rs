//! A connection: an ordered set of channels multiplexed into datagrams.
//!
//! The connection is sans-IO. Some external packet sequencing endpoint
//! assigns packet sequence numbers, moves the generated bytes, reassembles
//! inbound payloads and reports which past sequences the peer acknowledged;
//! this type only turns channel state into packet payloads and back.

use std::time::Instant;

use thiserror::Error;
use tracing::{trace, warn};

use crate::channel::Channel;
use crate::coding::{self, bits_required, BitReader, BitWriter, WriteBits};
use crate::config::ConnectionConfig;
use crate::frame::{
    self, OutgoingData, CONSERVATIVE_CHANNEL_HEADER_BITS, CONSERVATIVE_PACKET_HEADER_BITS,
};
use crate::message::{Message, MessageFactory};

/// Sticky connection failure states
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionError {
    /// Some channel is in an error state; inspect the channels for which
    #[error("a channel is in an error state")]
    ChannelError,
    /// An incoming packet could not be deserialized
    #[error("failed to read packet")]
    ReadPacketFailed,
}

/// Multiplexes message channels over a datagram transport
pub struct Connection {
    config: ConnectionConfig,
    factory: Box<dyn MessageFactory>,
    channels: Vec<Channel>,
    error: Option<ConnectionError>,
}

impl Connection {
    /// Panics if the configuration is invalid (see [`ConnectionConfig`])
    pub fn new(config: ConnectionConfig, factory: Box<dyn MessageFactory>, now: Instant) -> Self {
        config.validate();
        let channels = config
            .channels
            .iter()
            .enumerate()
            .map(|(index, channel_config)| Channel::new(channel_config.clone(), index, now))
            .collect();
        Self {
            config,
            factory,
            channels,
            error: None,
        }
    }

    pub fn channel(&self, index: usize) -> &Channel {
        &self.channels[index]
    }

    pub fn channel_mut(&mut self, index: usize) -> &mut Channel {
        &mut self.channels[index]
    }

    pub fn error(&self) -> Option<ConnectionError> {
        self.error
    }

    pub fn can_send_message(&self, channel: usize) -> bool {
        self.channels[channel].can_send_message()
    }

    pub fn has_messages_to_send(&self, channel: usize) -> bool {
        self.channels[channel].has_messages_to_send()
    }

    /// Enqueue `message` on `channel`
    pub fn send_message(&mut self, channel: usize, message: Message) {
        self.channels[channel].send_message(message);
    }

    /// Dequeue the next message `channel` owes the application
    pub fn receive_message(&mut self, channel: usize) -> Option<Message> {
        self.channels[channel].receive_message()
    }

    /// Fill `buffer` with a packet payload and return its length in bytes
    ///
    /// Asks each channel in order for packet data within the remaining bit
    /// budget, then serializes the collected entries. A packet is produced
    /// even when no channel has data (the entry count is still written), so
    /// the caller can use it as an ack carrier; an errored connection
    /// produces nothing and returns 0.
    ///
    /// `packet_sequence` values must be strictly increasing across calls;
    /// the sequencing endpoint owns that guarantee, and the sent-packet
    /// bookkeeping in the reliable channels relies on it.
    pub fn generate_packet(
        &mut self,
        packet_sequence: u16,
        buffer: &mut [u8],
    ) -> coding::Result<usize> {
        if self.error.is_some() {
            return Ok(0);
        }
        let capacity = buffer.len().min(self.config.max_packet_size);
        let buffer = &mut buffer[..capacity];
        debug_assert!(
            bits_required(self.config.channels.len() as u32) as usize
                <= CONSERVATIVE_PACKET_HEADER_BITS
        );
        let mut available_bits = (capacity * 8).saturating_sub(CONSERVATIVE_PACKET_HEADER_BITS);
        let mut entries: Vec<OutgoingData> = Vec::new();
        for channel in &mut self.channels {
            if available_bits <= CONSERVATIVE_CHANNEL_HEADER_BITS {
                break;
            }
            available_bits -= CONSERVATIVE_CHANNEL_HEADER_BITS;
            if let Some((entry, used_bits)) =
                channel.generate_packet_data(packet_sequence, available_bits, &*self.factory)
            {
                debug_assert!(used_bits <= available_bits);
                available_bits = available_bits.saturating_sub(used_bits);
                entries.push(entry);
            }
        }
        trace!(
            sequence = packet_sequence,
            entries = entries.len(),
            "generating packet"
        );
        let mut writer = BitWriter::new(buffer);
        frame::encode_entries(&mut writer, &entries, &*self.factory, &self.config)?;
        writer.finish()
    }

    /// Integrate a reassembled packet payload; returns whether it parsed
    ///
    /// Parse failures set the sticky [`ConnectionError::ReadPacketFailed`];
    /// a channel-level deserialization failure only errors that channel.
    pub fn process_packet(&mut self, packet_sequence: u16, data: &[u8]) -> bool {
        if self.error.is_some() {
            return false;
        }
        let mut reader = BitReader::new(data);
        match frame::decode_entries(&mut reader, &*self.factory, &self.config) {
            Ok(entries) => {
                trace!(
                    sequence = packet_sequence,
                    entries = entries.len(),
                    "processing packet"
                );
                for entry in entries {
                    let channel = entry.channel();
                    self.channels[channel].process_packet_data(entry, packet_sequence);
                }
                true
            }
            Err(error) => {
                warn!(sequence = packet_sequence, %error, "failed to read packet");
                self.error = Some(ConnectionError::ReadPacketFailed);
                false
            }
        }
    }

    /// Forward packet-level acks from the sequencing endpoint to every
    /// channel
    pub fn process_acks(&mut self, acks: &[u16]) {
        for &ack in acks {
            for channel in &mut self.channels {
                channel.process_ack(ack);
            }
        }
    }

    /// Advance to `now`, surfacing any channel error
    ///
    /// Once a channel reports an error the connection transitions to
    /// [`ConnectionError::ChannelError`] and stops advancing.
    pub fn advance_time(&mut self, now: Instant) {
        if self.error.is_some() {
            return;
        }
        for channel in &mut self.channels {
            channel.advance_time(now);
        }
        if self.channels.iter().any(|channel| channel.error().is_some()) {
            self.error = Some(ConnectionError::ChannelError);
        }
    }

    /// Release every queued message and return to the initial state
    pub fn reset(&mut self) {
        self.error = None;
        for channel in &mut self.channels {
            channel.reset();
        }
    }
}
