//! Wire codec for channel packet data.
//!
//! A connection packet is an entry count followed by up to one entry per
//! channel. Each entry is either a list of messages or a single block
//! fragment. Encoding and decoding are asymmetric on purpose: outgoing
//! entries borrow messages from the send queues (shared `Rc`s, so the
//! queues keep their references for retransmission), while incoming entries
//! own the messages they decoded.

use std::rc::Rc;

use bytes::Bytes;

use crate::coding::{
    self, bits_required, read_sequence_relative, write_sequence_relative, BitCounter, BitReader,
    WriteBits,
};
use crate::config::{ChannelConfig, ChannelKind, ConnectionConfig};
use crate::message::{Message, MessageFactory};

/// Reserved for the connection packet header (the entry count)
pub(crate) const CONSERVATIVE_PACKET_HEADER_BITS: usize = 16;
/// Reserved per channel entry for its index, flags and message count
pub(crate) const CONSERVATIVE_CHANNEL_HEADER_BITS: usize = 32;
/// Reserved per message for its id and type tag
pub(crate) const CONSERVATIVE_MESSAGE_HEADER_BITS: usize = 32;
/// Reserved per block fragment for its header fields
pub(crate) const CONSERVATIVE_FRAGMENT_HEADER_BITS: usize = 64;

/// One channel's contribution to an outgoing packet
#[derive(Debug)]
pub(crate) enum OutgoingData {
    Messages {
        channel: usize,
        messages: Vec<Rc<Message>>,
    },
    Fragment {
        channel: usize,
        message_id: u16,
        fragment_id: usize,
        num_fragments: usize,
        data: Bytes,
        /// The block message itself rides along with fragment zero
        first_message: Option<Rc<Message>>,
    },
}

impl OutgoingData {
    pub(crate) fn channel(&self) -> usize {
        match self {
            Self::Messages { channel, .. } | Self::Fragment { channel, .. } => *channel,
        }
    }

    fn encode(
        &self,
        stream: &mut dyn WriteBits,
        factory: &dyn MessageFactory,
        config: &ConnectionConfig,
    ) -> coding::Result<()> {
        let num_channels = config.channels.len();
        if num_channels > 1 {
            stream.write_int(self.channel() as u32, 0, num_channels as u32 - 1)?;
        }
        let channel_config = &config.channels[self.channel()];
        match self {
            Self::Messages { messages, .. } => {
                stream.write_bool(false)?;
                encode_message_list(stream, messages, factory, channel_config)
            }
            Self::Fragment {
                message_id,
                fragment_id,
                num_fragments,
                data,
                first_message,
                ..
            } => {
                stream.write_bool(true)?;
                encode_fragment(
                    stream,
                    *message_id,
                    *fragment_id,
                    *num_fragments,
                    data,
                    first_message.as_deref(),
                    factory,
                    channel_config,
                )
            }
        }
    }
}

/// One channel entry parsed from an incoming packet
#[derive(Debug)]
pub(crate) enum IncomingData {
    Messages {
        channel: usize,
        messages: Vec<Message>,
        /// Set when a message body failed to decode; the owning channel
        /// reports `FailedToDeserialize` instead of the whole packet failing
        failed: bool,
    },
    Fragment {
        channel: usize,
        message_id: u16,
        fragment_id: usize,
        num_fragments: usize,
        data: Bytes,
        first_message: Option<Message>,
    },
}

impl IncomingData {
    pub(crate) fn channel(&self) -> usize {
        match self {
            Self::Messages { channel, .. } | Self::Fragment { channel, .. } => *channel,
        }
    }
}

/// Write the body of a connection packet: entry count, then entries
pub(crate) fn encode_entries(
    stream: &mut dyn WriteBits,
    entries: &[OutgoingData],
    factory: &dyn MessageFactory,
    config: &ConnectionConfig,
) -> coding::Result<()> {
    let num_channels = config.channels.len() as u32;
    debug_assert!(entries.len() as u32 <= num_channels);
    stream.write_int(entries.len() as u32, 0, num_channels)?;
    for entry in entries {
        entry.encode(stream, factory, config)?;
    }
    Ok(())
}

/// Parse the body of a connection packet
///
/// A failure inside a message body marks that entry and stops parsing (bit
/// positions after it are meaningless), succeeding at this level; failures
/// in headers, fragments or block messages fail the whole packet.
pub(crate) fn decode_entries(
    stream: &mut BitReader,
    factory: &dyn MessageFactory,
    config: &ConnectionConfig,
) -> coding::Result<Vec<IncomingData>> {
    let num_channels = config.channels.len();
    let count = stream.read_int(0, num_channels as u32)? as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let channel = if num_channels > 1 {
            stream.read_int(0, num_channels as u32 - 1)? as usize
        } else {
            0
        };
        let channel_config = &config.channels[channel];
        if stream.read_bool()? {
            entries.push(decode_fragment(stream, channel, factory, channel_config)?);
        } else {
            let entry = decode_message_list(stream, channel, factory, channel_config)?;
            let failed = matches!(&entry, IncomingData::Messages { failed: true, .. });
            entries.push(entry);
            if failed {
                break;
            }
        }
    }
    Ok(entries)
}

fn encode_message_list(
    stream: &mut dyn WriteBits,
    messages: &[Rc<Message>],
    factory: &dyn MessageFactory,
    config: &ChannelConfig,
) -> coding::Result<()> {
    stream.write_bool(!messages.is_empty())?;
    if messages.is_empty() {
        return Ok(());
    }
    debug_assert!(messages.len() <= config.max_messages_per_packet);
    stream.write_int(
        messages.len() as u32,
        1,
        config.max_messages_per_packet as u32,
    )?;
    if config.kind == ChannelKind::ReliableOrdered {
        stream.write_u16(messages[0].id())?;
        for pair in messages.windows(2) {
            write_sequence_relative(stream, pair[0].id(), pair[1].id())?;
        }
    }
    for message in messages {
        stream.write_int(
            message.message_type() as u32,
            0,
            factory.max_message_type() as u32,
        )?;
        message.encode_body(stream)?;
        if config.kind == ChannelKind::UnreliableUnordered {
            encode_message_block(stream, message.block(), config.max_block_size)?;
        }
    }
    Ok(())
}

fn decode_message_list(
    stream: &mut BitReader,
    channel: usize,
    factory: &dyn MessageFactory,
    config: &ChannelConfig,
) -> coding::Result<IncomingData> {
    if !stream.read_bool()? {
        return Ok(IncomingData::Messages {
            channel,
            messages: Vec::new(),
            failed: false,
        });
    }
    let count = stream.read_int(1, config.max_messages_per_packet as u32)? as usize;
    let reliable = config.kind == ChannelKind::ReliableOrdered;
    let mut ids = Vec::new();
    if reliable {
        ids.reserve(count);
        ids.push(stream.read_u16()?);
        for i in 1..count {
            ids.push(read_sequence_relative(stream, ids[i - 1])?);
        }
    }
    let mut messages = Vec::with_capacity(count);
    for i in 0..count {
        let message_type = stream.read_int(0, factory.max_message_type() as u32)? as u16;
        let body = match factory.decode_body(message_type, stream) {
            Ok(body) => body,
            Err(_) => {
                return Ok(IncomingData::Messages {
                    channel,
                    messages: Vec::new(),
                    failed: true,
                });
            }
        };
        let mut message = Message::new(message_type, body);
        if reliable {
            message.set_id(ids[i]);
        } else if let Some(block) = decode_message_block(stream, config.max_block_size)? {
            message.set_block(block);
        }
        messages.push(message);
    }
    Ok(IncomingData::Messages {
        channel,
        messages,
        failed: false,
    })
}

#[allow(clippy::too_many_arguments)]
fn encode_fragment(
    stream: &mut dyn WriteBits,
    message_id: u16,
    fragment_id: usize,
    num_fragments: usize,
    data: &[u8],
    first_message: Option<&Message>,
    factory: &dyn MessageFactory,
    config: &ChannelConfig,
) -> coding::Result<()> {
    stream.write_u16(message_id)?;
    let max_fragments = config.max_fragments_per_block();
    if max_fragments > 1 {
        stream.write_int(num_fragments as u32, 1, max_fragments as u32)?;
    }
    if num_fragments > 1 {
        stream.write_int(fragment_id as u32, 0, num_fragments as u32 - 1)?;
    }
    stream.write_int(data.len() as u32, 1, config.block_fragment_size as u32)?;
    stream.write_bytes(data)?;
    if fragment_id == 0 {
        let message = first_message.expect("fragment zero carries its message");
        stream.write_int(
            message.message_type() as u32,
            0,
            factory.max_message_type() as u32,
        )?;
        message.encode_body(stream)?;
    }
    Ok(())
}

fn decode_fragment(
    stream: &mut BitReader,
    channel: usize,
    factory: &dyn MessageFactory,
    config: &ChannelConfig,
) -> coding::Result<IncomingData> {
    let message_id = stream.read_u16()?;
    let max_fragments = config.max_fragments_per_block();
    let num_fragments = if max_fragments > 1 {
        stream.read_int(1, max_fragments as u32)? as usize
    } else {
        1
    };
    let fragment_id = if num_fragments > 1 {
        stream.read_int(0, num_fragments as u32 - 1)? as usize
    } else {
        0
    };
    let size = stream.read_int(1, config.block_fragment_size as u32)? as usize;
    let mut data = vec![0u8; size];
    stream.read_bytes(&mut data)?;
    let first_message = if fragment_id == 0 {
        let message_type = stream.read_int(0, factory.max_message_type() as u32)? as u16;
        let body = factory.decode_body(message_type, stream)?;
        let mut message = Message::new(message_type, body);
        message.set_id(message_id);
        Some(message)
    } else {
        None
    };
    Ok(IncomingData::Fragment {
        channel,
        message_id,
        fragment_id,
        num_fragments,
        data: Bytes::from(data),
        first_message,
    })
}

fn encode_message_block(
    stream: &mut dyn WriteBits,
    block: Option<&[u8]>,
    max_block_size: usize,
) -> coding::Result<()> {
    stream.write_bool(block.is_some())?;
    if let Some(block) = block {
        debug_assert!(!block.is_empty() && block.len() <= max_block_size);
        stream.write_int(block.len() as u32, 1, max_block_size as u32)?;
        stream.write_bytes(block)?;
    }
    Ok(())
}

fn decode_message_block(
    stream: &mut BitReader,
    max_block_size: usize,
) -> coding::Result<Option<Bytes>> {
    if !stream.read_bool()? {
        return Ok(None);
    }
    let size = stream.read_int(1, max_block_size as u32)? as usize;
    let mut data = vec![0u8; size];
    stream.read_bytes(&mut data)?;
    Ok(Some(Bytes::from(data)))
}

/// Bits one unreliable message costs on the wire: type tag, body and any
/// inline block
pub(crate) fn unreliable_message_bits(
    message: &Message,
    message_type_bits: usize,
    max_block_size: usize,
) -> usize {
    let mut counter = BitCounter::new();
    let measure = (|| {
        counter.write_bits(0, message_type_bits as u32)?;
        message.encode_body(&mut counter)?;
        encode_message_block(&mut counter, message.block(), max_block_size)
    })();
    match measure {
        Ok(()) => counter.bits_written(),
        Err(_) => usize::MAX,
    }
}

/// Bits needed for a channel's message-type field
pub(crate) fn message_type_bits(factory: &dyn MessageFactory) -> usize {
    bits_required(factory.max_message_type() as u32) as usize
}
