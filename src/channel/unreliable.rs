//! Unreliable-unordered channel: best-effort packing of queued messages
//! into whatever packet budget is left, dropping what does not fit.

use std::rc::Rc;

use tracing::{debug, warn};

use super::{ChannelCounters, ChannelError};
use crate::config::ChannelConfig;
use crate::frame::{
    message_type_bits, unreliable_message_bits, IncomingData, OutgoingData,
    CONSERVATIVE_MESSAGE_HEADER_BITS,
};
use crate::message::{Message, MessageFactory};
use crate::queue::BoundedQueue;

#[derive(Debug)]
pub struct UnreliableChannel {
    index: usize,
    config: ChannelConfig,
    error: Option<ChannelError>,
    counters: ChannelCounters,
    send_queue: BoundedQueue<Rc<Message>>,
    receive_queue: BoundedQueue<Message>,
}

impl UnreliableChannel {
    pub(crate) fn new(config: ChannelConfig, index: usize) -> Self {
        Self {
            send_queue: BoundedQueue::new(config.message_send_queue_size),
            receive_queue: BoundedQueue::new(config.message_receive_queue_size),
            index,
            config,
            error: None,
            counters: ChannelCounters::default(),
        }
    }

    pub fn can_send_message(&self) -> bool {
        self.error.is_none() && !self.send_queue.is_full()
    }

    pub fn has_messages_to_send(&self) -> bool {
        !self.send_queue.is_empty()
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

    pub fn send_message(&mut self, message: Message) {
        if self.error.is_some() {
            return;
        }
        if let Some(block) = message.block() {
            debug_assert!(!self.config.disable_blocks, "blocks are disabled on this channel");
            debug_assert!(!block.is_empty() && block.len() <= self.config.max_block_size);
        }
        if self.send_queue.is_full() {
            self.set_error(ChannelError::SendQueueFull);
            return;
        }
        self.send_queue.push(Rc::new(message));
        self.counters.messages_sent += 1;
    }

    pub fn receive_message(&mut self) -> Option<Message> {
        if self.error.is_some() {
            return None;
        }
        let message = self.receive_queue.pop()?;
        self.counters.messages_received += 1;
        Some(message)
    }

    pub fn reset(&mut self) {
        self.error = None;
        self.counters = ChannelCounters::default();
        self.send_queue.clear();
        self.receive_queue.clear();
    }

    fn set_error(&mut self, error: ChannelError) {
        if self.error.is_none() {
            warn!(channel = self.index, %error, "channel error");
            self.error = Some(error);
        }
    }

    pub(crate) fn generate_packet_data(
        &mut self,
        available_bits: usize,
        factory: &dyn MessageFactory,
    ) -> Option<(OutgoingData, usize)> {
        if self.error.is_some() || self.send_queue.is_empty() {
            return None;
        }
        let available_bits = match self.config.packet_budget {
            Some(budget) => available_bits.min(budget * 8),
            None => available_bits,
        };
        let type_bits = message_type_bits(factory);
        let mut messages = Vec::new();
        let mut used_bits = 0;
        while messages.len() < self.config.max_messages_per_packet {
            if available_bits.saturating_sub(used_bits) < CONSERVATIVE_MESSAGE_HEADER_BITS {
                break;
            }
            let Some(message) = self.send_queue.pop() else {
                break;
            };
            let bits = unreliable_message_bits(&message, type_bits, self.config.max_block_size);
            if used_bits + bits > available_bits {
                // dropped, not deferred: an unreliable message that missed
                // its packet is stale by the time the next one goes out
                debug!(bits, "dropping unreliable message over packet budget");
                self.counters.messages_dropped += 1;
                continue;
            }
            used_bits += bits;
            messages.push(message);
        }
        if messages.is_empty() {
            return None;
        }
        Some((
            OutgoingData::Messages {
                channel: self.index,
                messages,
            },
            used_bits,
        ))
    }

    pub(crate) fn process_packet_data(&mut self, data: IncomingData, packet_sequence: u16) {
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
                for mut message in messages {
                    message.set_id(packet_sequence);
                    if !self.receive_queue.push(message) {
                        debug!("unreliable receive queue full, dropping message");
                        self.counters.messages_dropped += 1;
                    }
                }
            }
            IncomingData::Fragment { .. } => {
                // the unreliable channel never fragments; a peer that sends
                // one is confused, but this is not worth killing the channel
                warn!(channel = self.index, "ignoring block fragment on unreliable channel");
            }
        }
    }
}
