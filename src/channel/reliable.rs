//! Reliable-ordered channel: exactly-once, in-order message delivery driven
//! by packet-level acknowledgements.
//!
//! Messages are retained in the send queue until acked. Each generated
//! packet records which message ids (or which block fragment) it carried;
//! when the packet sequencing endpoint reports that packet acked, the entry
//! translates into per-message or per-fragment progress. Messages with an
//! attached block are transmitted as a series of fragments, one per packet,
//! with at most one block in flight at a time.

use std::rc::Rc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use super::{ChannelCounters, ChannelError};
use crate::coding::sequence_relative_bits;
use crate::config::ChannelConfig;
use crate::frame::{
    message_type_bits, IncomingData, OutgoingData, CONSERVATIVE_FRAGMENT_HEADER_BITS,
    CONSERVATIVE_MESSAGE_HEADER_BITS,
};
use crate::message::{Message, MessageFactory};
use crate::sequence::{sequence_greater_than, sequence_less_than, SequenceBuffer};

#[derive(Debug)]
struct SendEntry {
    message: Rc<Message>,
    time_last_sent: Option<Instant>,
    measured_bits: usize,
}

#[derive(Debug, Copy, Clone)]
enum SentPacketKind {
    /// Non-block packet; the carried ids live in the channel's flat id
    /// arena at this packet's slot
    Messages { count: usize },
    Fragment { message_id: u16, fragment_id: usize },
}

#[derive(Debug)]
struct SentPacket {
    acked: bool,
    kind: SentPacketKind,
}

#[derive(Debug)]
struct SendBlock {
    message_id: u16,
    num_fragments: usize,
    num_acked_fragments: usize,
    acked: Vec<bool>,
    fragment_send_time: Vec<Option<Instant>>,
}

#[derive(Debug)]
struct ReceiveBlock {
    message_id: u16,
    num_fragments: usize,
    num_received_fragments: usize,
    received: Vec<bool>,
    data: Vec<u8>,
    block_size: Option<usize>,
    message: Option<Message>,
}

#[derive(Debug)]
pub struct ReliableChannel {
    index: usize,
    config: ChannelConfig,
    time: Instant,
    error: Option<ChannelError>,
    counters: ChannelCounters,
    /// Next id to assign on send
    send_message_id: u16,
    /// Next id the application will dequeue
    receive_message_id: u16,
    /// Left edge of the retransmission window
    oldest_unacked_message_id: u16,
    send_queue: SequenceBuffer<SendEntry>,
    receive_queue: SequenceBuffer<Message>,
    sent_packets: SequenceBuffer<SentPacket>,
    /// Flat arena backing `SentPacketKind::Messages` id lists, indexed by
    /// `(packet_sequence % sent_packet_buffer_size) * max_messages_per_packet`
    sent_packet_message_ids: Box<[u16]>,
    send_block: Option<SendBlock>,
    receive_block: Option<ReceiveBlock>,
}

impl ReliableChannel {
    pub(crate) fn new(config: ChannelConfig, index: usize, now: Instant) -> Self {
        let arena = vec![0u16; config.sent_packet_buffer_size * config.max_messages_per_packet];
        Self {
            send_queue: SequenceBuffer::new(config.message_send_queue_size),
            receive_queue: SequenceBuffer::new(config.message_receive_queue_size),
            sent_packets: SequenceBuffer::new(config.sent_packet_buffer_size),
            sent_packet_message_ids: arena.into_boxed_slice(),
            index,
            config,
            time: now,
            error: None,
            counters: ChannelCounters::default(),
            send_message_id: 0,
            receive_message_id: 0,
            oldest_unacked_message_id: 0,
            send_block: None,
            receive_block: None,
        }
    }

    pub fn can_send_message(&self) -> bool {
        self.error.is_none() && self.send_queue.available(self.send_message_id)
    }

    pub fn has_messages_to_send(&self) -> bool {
        self.oldest_unacked_message_id != self.send_message_id
    }

    pub fn error(&self) -> Option<ChannelError> {
        self.error
    }

    pub fn counters(&self) -> &ChannelCounters {
        &self.counters
    }

    pub fn reset_counters(&mut self) {
        self.counters = ChannelCounters::default();
    }

    pub fn send_message(&mut self, mut message: Message) {
        if self.error.is_some() {
            return;
        }
        if let Some(block) = message.block() {
            debug_assert!(!self.config.disable_blocks, "blocks are disabled on this channel");
            debug_assert!(!block.is_empty() && block.len() <= self.config.max_block_size);
        }
        if !self.send_queue.available(self.send_message_id) {
            self.set_error(ChannelError::SendQueueFull);
            return;
        }
        message.set_id(self.send_message_id);
        let measured_bits = message.measured_bits();
        self.send_queue.insert_ordered(
            self.send_message_id,
            SendEntry {
                message: Rc::new(message),
                time_last_sent: None,
                measured_bits,
            },
        );
        self.counters.messages_sent += 1;
        self.send_message_id = self.send_message_id.wrapping_add(1);
    }

    pub fn receive_message(&mut self) -> Option<Message> {
        if self.error.is_some() {
            return None;
        }
        let message = self.receive_queue.remove(self.receive_message_id)?;
        trace!(id = self.receive_message_id, "delivering message");
        self.counters.messages_received += 1;
        self.receive_message_id = self.receive_message_id.wrapping_add(1);
        Some(message)
    }

    pub fn reset(&mut self) {
        self.error = None;
        self.counters = ChannelCounters::default();
        self.send_message_id = 0;
        self.receive_message_id = 0;
        self.oldest_unacked_message_id = 0;
        self.send_queue.reset();
        self.receive_queue.reset();
        self.sent_packets.reset();
        self.send_block = None;
        self.receive_block = None;
    }

    pub(crate) fn advance_time(&mut self, now: Instant) {
        self.time = now;
    }

    fn set_error(&mut self, error: ChannelError) {
        if self.error.is_none() {
            warn!(channel = self.index, %error, "channel error");
            self.error = Some(error);
        }
    }

    /// Whether the next message owed to the wire is a block message
    fn sending_block_message(&self) -> bool {
        self.send_queue
            .find(self.oldest_unacked_message_id)
            .is_some_and(|entry| entry.message.block().is_some())
    }

    fn budgeted_bits(&self, available_bits: usize) -> usize {
        match self.config.packet_budget {
            Some(budget) => available_bits.min(budget * 8),
            None => available_bits,
        }
    }

    pub(crate) fn generate_packet_data(
        &mut self,
        packet_sequence: u16,
        available_bits: usize,
        factory: &dyn MessageFactory,
    ) -> Option<(OutgoingData, usize)> {
        if self.error.is_some() || !self.has_messages_to_send() {
            return None;
        }
        let available_bits = self.budgeted_bits(available_bits);
        if self.sending_block_message() {
            self.generate_fragment(packet_sequence, available_bits, factory)
        } else {
            self.generate_messages(packet_sequence, available_bits, factory)
        }
    }

    fn generate_messages(
        &mut self,
        packet_sequence: u16,
        available_bits: usize,
        factory: &dyn MessageFactory,
    ) -> Option<(OutgoingData, usize)> {
        let now = self.time;
        let type_bits = message_type_bits(factory);
        let scan_limit = self
            .config
            .message_send_queue_size
            .min(self.config.message_receive_queue_size);
        let mut messages: Vec<Rc<Message>> = Vec::new();
        let mut used_bits = 0;
        let mut give_up = 0;
        let mut previous_id = 0u16;
        for offset in 0..scan_limit {
            if messages.len() == self.config.max_messages_per_packet {
                break;
            }
            if available_bits.saturating_sub(used_bits) < CONSERVATIVE_MESSAGE_HEADER_BITS {
                break;
            }
            let id = self.oldest_unacked_message_id.wrapping_add(offset as u16);
            let Some(entry) = self.send_queue.find_mut(id) else {
                continue;
            };
            if entry.message.block().is_some() {
                continue;
            }
            if let Some(last_sent) = entry.time_last_sent {
                if last_sent + self.config.message_resend_time > now {
                    continue;
                }
            }
            if entry.measured_bits > available_bits {
                continue;
            }
            let id_bits = if messages.is_empty() {
                16
            } else {
                sequence_relative_bits(previous_id, id)
            };
            let cost = entry.measured_bits + type_bits + id_bits;
            if used_bits + cost > available_bits {
                give_up += 1;
                if give_up > self.config.message_send_queue_size {
                    break;
                }
                continue;
            }
            entry.time_last_sent = Some(now);
            messages.push(entry.message.clone());
            previous_id = id;
            used_bits += cost;
        }
        if messages.is_empty() {
            return None;
        }
        self.record_sent_messages(packet_sequence, &messages);
        Some((
            OutgoingData::Messages {
                channel: self.index,
                messages,
            },
            used_bits,
        ))
    }

    fn record_sent_messages(&mut self, packet_sequence: u16, messages: &[Rc<Message>]) {
        let slot = (packet_sequence as usize % self.config.sent_packet_buffer_size)
            * self.config.max_messages_per_packet;
        for (offset, message) in messages.iter().enumerate() {
            self.sent_packet_message_ids[slot + offset] = message.id();
        }
        self.sent_packets.insert_ordered(
            packet_sequence,
            SentPacket {
                acked: false,
                kind: SentPacketKind::Messages {
                    count: messages.len(),
                },
            },
        );
    }

    fn generate_fragment(
        &mut self,
        packet_sequence: u16,
        available_bits: usize,
        factory: &dyn MessageFactory,
    ) -> Option<(OutgoingData, usize)> {
        let now = self.time;
        if self.send_block.is_none() {
            let entry = self.send_queue.find(self.oldest_unacked_message_id)?;
            let block = entry.message.block()?;
            let num_fragments = block.len().div_ceil(self.config.block_fragment_size);
            debug_assert!(num_fragments >= 1);
            debug_assert!(num_fragments <= self.config.max_fragments_per_block());
            trace!(
                message_id = self.oldest_unacked_message_id,
                num_fragments,
                "starting block send"
            );
            self.send_block = Some(SendBlock {
                message_id: self.oldest_unacked_message_id,
                num_fragments,
                num_acked_fragments: 0,
                acked: vec![false; num_fragments],
                fragment_send_time: vec![None; num_fragments],
            });
        }

        let send_block = self.send_block.as_ref()?;
        let resend_time = self.config.block_fragment_resend_time;
        let fragment_id = (0..send_block.num_fragments).find(|&id| {
            !send_block.acked[id]
                && send_block.fragment_send_time[id].is_none_or(|sent| sent + resend_time < now)
        })?;
        let message_id = send_block.message_id;
        let num_fragments = send_block.num_fragments;

        let entry = self.send_queue.find(message_id)?;
        let block = entry.message.block()?;
        let start = fragment_id * self.config.block_fragment_size;
        let end = (start + self.config.block_fragment_size).min(block.len());
        let mut used_bits = CONSERVATIVE_FRAGMENT_HEADER_BITS + (end - start) * 8;
        if fragment_id == 0 {
            used_bits += message_type_bits(factory) + entry.measured_bits;
        }
        if used_bits > available_bits {
            return None;
        }
        let data = Bytes::copy_from_slice(&block[start..end]);
        let first_message = (fragment_id == 0).then(|| entry.message.clone());

        if let Some(send_block) = self.send_block.as_mut() {
            send_block.fragment_send_time[fragment_id] = Some(now);
        }
        self.sent_packets.insert_ordered(
            packet_sequence,
            SentPacket {
                acked: false,
                kind: SentPacketKind::Fragment {
                    message_id,
                    fragment_id,
                },
            },
        );
        trace!(message_id, fragment_id, "sending block fragment");
        Some((
            OutgoingData::Fragment {
                channel: self.index,
                message_id,
                fragment_id,
                num_fragments,
                data,
                first_message,
            },
            used_bits,
        ))
    }

    pub(crate) fn process_packet_data(&mut self, data: IncomingData) {
        if self.error.is_some() {
            return;
        }
        match data {
            IncomingData::Messages {
                messages, failed, ..
            } => {
                if failed {
                    self.set_error(ChannelError::FailedToDeserialize);
                    return;
                }
                self.process_messages(messages);
            }
            IncomingData::Fragment {
                message_id,
                fragment_id,
                num_fragments,
                data,
                first_message,
                ..
            } => {
                if self.config.disable_blocks {
                    self.set_error(ChannelError::BlocksDisabled);
                    return;
                }
                self.process_fragment(message_id, fragment_id, num_fragments, data, first_message);
            }
        }
    }

    fn process_messages(&mut self, messages: Vec<Message>) {
        let newest_accepted = self
            .receive_message_id
            .wrapping_add(self.config.message_receive_queue_size as u16 - 1);
        for message in messages {
            let id = message.id();
            if sequence_less_than(id, self.receive_message_id) {
                // already delivered, a stale retransmit
                continue;
            }
            if sequence_greater_than(id, newest_accepted) {
                warn!(
                    id,
                    expected = self.receive_message_id,
                    "message id beyond receive window"
                );
                self.set_error(ChannelError::Desync);
                return;
            }
            if self.receive_queue.exists(id) {
                continue;
            }
            self.receive_queue.insert(id, message);
        }
    }

    fn process_fragment(
        &mut self,
        message_id: u16,
        fragment_id: usize,
        num_fragments: usize,
        data: Bytes,
        first_message: Option<Message>,
    ) {
        // fragments are only assembled for the next undelivered message;
        // anything else is a stale or premature retransmit and will be sent
        // again once it matters
        if message_id != self.receive_message_id || self.receive_queue.exists(message_id) {
            return;
        }
        let fragment_size = self.config.block_fragment_size;
        let mut receive_block = match self.receive_block.take() {
            Some(receive_block) => receive_block,
            None => {
                let mut data = Vec::new();
                if data.try_reserve_exact(num_fragments * fragment_size).is_err() {
                    self.set_error(ChannelError::OutOfMemory);
                    return;
                }
                data.resize(num_fragments * fragment_size, 0);
                ReceiveBlock {
                    message_id,
                    num_fragments,
                    num_received_fragments: 0,
                    received: vec![false; num_fragments],
                    data,
                    block_size: None,
                    message: None,
                }
            }
        };
        if receive_block.message_id != message_id
            || receive_block.num_fragments != num_fragments
            || fragment_id >= num_fragments
        {
            self.set_error(ChannelError::Desync);
            return;
        }
        let last_fragment = fragment_id == num_fragments - 1;
        if !last_fragment && data.len() != fragment_size {
            self.set_error(ChannelError::Desync);
            return;
        }
        if receive_block.received[fragment_id] {
            self.receive_block = Some(receive_block);
            return;
        }
        receive_block.received[fragment_id] = true;
        receive_block.num_received_fragments += 1;
        let start = fragment_id * fragment_size;
        receive_block.data[start..start + data.len()].copy_from_slice(&data);
        if fragment_id == 0 {
            receive_block.message = first_message;
        }
        if last_fragment {
            let block_size = (num_fragments - 1) * fragment_size + data.len();
            if block_size > self.config.max_block_size {
                self.set_error(ChannelError::Desync);
                return;
            }
            receive_block.block_size = Some(block_size);
        }
        trace!(
            message_id,
            fragment_id,
            received = receive_block.num_received_fragments,
            total = num_fragments,
            "received block fragment"
        );
        if receive_block.num_received_fragments < receive_block.num_fragments {
            self.receive_block = Some(receive_block);
            return;
        }
        let (Some(mut message), Some(block_size)) =
            (receive_block.message.take(), receive_block.block_size)
        else {
            self.set_error(ChannelError::Desync);
            return;
        };
        receive_block.data.truncate(block_size);
        message.set_id(message_id);
        message.set_block(Bytes::from(receive_block.data));
        debug!(message_id, block_size, "block receive completed");
        self.receive_queue.insert(message_id, message);
    }

    pub(crate) fn process_ack(&mut self, ack: u16) {
        let kind = {
            // acks for packets that already fell out of the buffer are ignored
            let Some(sent) = self.sent_packets.find_mut(ack) else {
                return;
            };
            if sent.acked {
                return;
            }
            sent.acked = true;
            sent.kind
        };
        match kind {
            SentPacketKind::Messages { count } => {
                let slot = (ack as usize % self.config.sent_packet_buffer_size)
                    * self.config.max_messages_per_packet;
                for offset in 0..count {
                    let id = self.sent_packet_message_ids[slot + offset];
                    if self.send_queue.remove(id).is_some() {
                        trace!(id, "message acked");
                    }
                }
                self.advance_oldest_unacked();
            }
            SentPacketKind::Fragment {
                message_id,
                fragment_id,
            } => {
                let mut block_completed = false;
                if let Some(send_block) = self.send_block.as_mut() {
                    if send_block.message_id == message_id && !send_block.acked[fragment_id] {
                        send_block.acked[fragment_id] = true;
                        send_block.num_acked_fragments += 1;
                        trace!(
                            message_id,
                            fragment_id,
                            acked = send_block.num_acked_fragments,
                            total = send_block.num_fragments,
                            "block fragment acked"
                        );
                        block_completed =
                            send_block.num_acked_fragments == send_block.num_fragments;
                    }
                }
                if block_completed {
                    debug!(message_id, "block send completed");
                    self.send_queue.remove(message_id);
                    self.send_block = None;
                    self.advance_oldest_unacked();
                }
            }
        }
    }

    fn advance_oldest_unacked(&mut self) {
        while self.oldest_unacked_message_id != self.send_message_id
            && !self.send_queue.exists(self.oldest_unacked_message_id)
        {
            self.oldest_unacked_message_id = self.oldest_unacked_message_id.wrapping_add(1);
        }
    }

    #[cfg(test)]
    pub(crate) fn oldest_unacked_message_id(&self) -> u16 {
        self.oldest_unacked_message_id
    }

    #[cfg(test)]
    pub(crate) fn has_active_send_block(&self) -> bool {
        self.send_block.is_some()
    }

    /// Pretend the channel has already cycled through ids up to `id`
    #[cfg(test)]
    pub(crate) fn set_send_message_id(&mut self, id: u16) {
        assert!(!self.has_messages_to_send());
        self.send_message_id = id;
        self.oldest_unacked_message_id = id;
    }

    #[cfg(test)]
    pub(crate) fn set_receive_message_id(&mut self, id: u16) {
        self.receive_message_id = id;
    }
}
