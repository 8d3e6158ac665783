//! Per-channel reliability and ordering for messages multiplexed over a
//! lossy, unordered datagram transport.
//!
//! This crate is the message connection core of a client/server networking
//! stack for real-time multiplayer games. A [`Connection`] composes up to
//! 64 independent [`Channel`]s, each either reliable-ordered (exactly-once,
//! in-order delivery with per-message and per-fragment retransmission,
//! including *blocks* larger than a packet) or unreliable-unordered
//! (best-effort packing into leftover packet budget). Channel payloads are
//! bit-packed into fixed-budget datagrams; packet-level acknowledgements
//! from the transport translate back into per-message progress.
//!
//! The crate is sans-IO and single-threaded: no sockets, no clock, no
//! internal concurrency. The caller owns a *packet sequencing endpoint*
//! that assigns 16-bit packet sequence numbers, transmits and reassembles
//! datagrams, and reports acknowledged sequences; it drives the connection
//! through [`Connection::generate_packet`], [`Connection::process_packet`],
//! [`Connection::process_acks`] and [`Connection::advance_time`].
//!
//! Messages are application-defined: implement [`MessageBody`] for each
//! payload type and [`MessageFactory`] to decode them, identically on both
//! endpoints.
//!
//! Out of scope here, by design: encryption, authentication, congestion
//! control, NAT traversal, and any ordering guarantee *across* channels.

mod channel;
pub mod coding;
mod config;
mod connection;
mod frame;
mod message;
mod queue;
mod sequence;

#[cfg(test)]
mod tests;

pub use channel::{Channel, ChannelCounters, ChannelError, ReliableChannel, UnreliableChannel};
pub use config::{ChannelConfig, ChannelKind, ConnectionConfig, MAX_CHANNELS};
pub use connection::{Connection, ConnectionError};
pub use message::{Message, MessageBody, MessageFactory};
pub use sequence::{sequence_greater_than, sequence_less_than, SequenceBuffer};
