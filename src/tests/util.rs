//! Shared test fixtures: a message vocabulary and a deterministic two-peer
//! link with seeded loss, latency and jitter standing in for the packet
//! sequencing endpoint.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

use crate::coding::{self, BitReader, WriteBits};
use crate::{Connection, ConnectionConfig, Message, MessageBody, MessageFactory};

pub(crate) const MAX_DATA_LEN: u32 = 1024;

/// Type tag 0: a length-prefixed byte payload
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct DataBody(pub(crate) Vec<u8>);

impl MessageBody for DataBody {
    fn encode(&self, stream: &mut dyn WriteBits) -> coding::Result<()> {
        stream.write_int(self.0.len() as u32, 0, MAX_DATA_LEN)?;
        stream.write_bytes(&self.0)
    }
}

/// Type tag 1: a bare counter
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct CounterBody(pub(crate) u32);

impl MessageBody for CounterBody {
    fn encode(&self, stream: &mut dyn WriteBits) -> coding::Result<()> {
        stream.write_u32(self.0)
    }
}

pub(crate) struct TestFactory;

impl MessageFactory for TestFactory {
    fn max_message_type(&self) -> u16 {
        1
    }

    fn decode_body(
        &self,
        message_type: u16,
        stream: &mut BitReader,
    ) -> coding::Result<Box<dyn MessageBody>> {
        match message_type {
            0 => {
                let length = stream.read_int(0, MAX_DATA_LEN)? as usize;
                let mut data = vec![0u8; length];
                stream.read_bytes(&mut data)?;
                Ok(Box::new(DataBody(data)))
            }
            1 => Ok(Box::new(CounterBody(stream.read_u32()?))),
            _ => Err(coding::Error::ValueOutOfRange),
        }
    }
}

pub(crate) fn data_message(payload: &[u8]) -> Message {
    Message::new(0, Box::new(DataBody(payload.to_vec())))
}

pub(crate) fn counter_message(value: u32) -> Message {
    Message::new(1, Box::new(CounterBody(value)))
}

pub(crate) fn block_message(block: Vec<u8>) -> Message {
    Message::with_block(0, Box::new(DataBody(Vec::new())), Bytes::from(block))
}

/// One endpoint: a connection plus the sequencing state the real packet
/// layer would own
pub(crate) struct Peer {
    pub(crate) connection: Connection,
    next_sequence: u16,
    /// Recently processed packet sequences, redundantly carried on every
    /// outgoing packet so ack delivery survives loss
    recent_acks: VecDeque<u16>,
}

impl Peer {
    fn new(config: ConnectionConfig, now: Instant) -> Self {
        Self {
            connection: Connection::new(config, Box::new(TestFactory), now),
            // start near the top so packet sequences wrap during most runs
            next_sequence: 65500,
            recent_acks: VecDeque::new(),
        }
    }
}

struct InFlight {
    deliver_at: Instant,
    to_server: bool,
    sequence: u16,
    data: Vec<u8>,
    acks: Vec<u16>,
}

/// Two connections joined by a simulated datagram link
pub(crate) struct Pair {
    pub(crate) now: Instant,
    pub(crate) client: Peer,
    pub(crate) server: Peer,
    pub(crate) loss: f64,
    pub(crate) latency: Duration,
    pub(crate) jitter: Duration,
    rng: StdRng,
    in_flight: Vec<InFlight>,
}

impl Pair {
    pub(crate) fn new(config: ConnectionConfig, seed: u64) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let now = Instant::now();
        Self {
            now,
            client: Peer::new(config.clone(), now),
            server: Peer::new(config, now),
            loss: 0.0,
            latency: Duration::ZERO,
            jitter: Duration::ZERO,
            rng: StdRng::seed_from_u64(seed),
            in_flight: Vec::new(),
        }
    }

    /// One simulation step: advance time, deliver whatever is due, then let
    /// each side emit one packet
    pub(crate) fn tick(&mut self, dt: Duration) {
        self.now += dt;
        self.client.connection.advance_time(self.now);
        self.server.connection.advance_time(self.now);

        let now = self.now;
        let mut due = Vec::new();
        let mut index = 0;
        while index < self.in_flight.len() {
            if self.in_flight[index].deliver_at <= now {
                due.push(self.in_flight.swap_remove(index));
            } else {
                index += 1;
            }
        }
        due.sort_by_key(|packet| packet.deliver_at);
        for packet in due {
            let receiver = if packet.to_server {
                &mut self.server
            } else {
                &mut self.client
            };
            receiver.connection.process_acks(&packet.acks);
            if receiver.connection.process_packet(packet.sequence, &packet.data) {
                receiver.recent_acks.push_back(packet.sequence);
                if receiver.recent_acks.len() > 64 {
                    receiver.recent_acks.pop_front();
                }
            }
        }

        self.transmit(true);
        self.transmit(false);
    }

    fn transmit(&mut self, from_client: bool) {
        let (sequence, data, acks) = {
            let sender = if from_client {
                &mut self.client
            } else {
                &mut self.server
            };
            let sequence = sender.next_sequence;
            sender.next_sequence = sequence.wrapping_add(1);
            let mut buffer = vec![0u8; 1300];
            let length = sender
                .connection
                .generate_packet(sequence, &mut buffer)
                .expect("packet generation");
            if length == 0 {
                return;
            }
            buffer.truncate(length);
            let acks: Vec<u16> = sender.recent_acks.iter().copied().collect();
            (sequence, buffer, acks)
        };
        if self.rng.gen::<f64>() < self.loss {
            return;
        }
        let jitter = if self.jitter.is_zero() {
            Duration::ZERO
        } else {
            self.jitter.mul_f64(self.rng.gen::<f64>())
        };
        self.in_flight.push(InFlight {
            deliver_at: self.now + self.latency + jitter,
            to_server: from_client,
            sequence,
            data,
            acks,
        });
    }
}
