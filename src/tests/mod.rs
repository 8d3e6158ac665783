//! End-to-end scenarios over a simulated lossy link.

use std::collections::HashSet;
use std::time::Duration;

use crate::channel::ChannelError;
use crate::config::{ChannelConfig, ChannelKind, ConnectionConfig};
use crate::{Channel, ConnectionError};

pub(crate) mod util;

use util::{block_message, counter_message, data_message, CounterBody, DataBody, Pair};

/// 60 Hz simulation step
const TICK: Duration = Duration::from_micros(16_667);

fn reliable_channel_of(connection: &crate::Connection) -> &crate::ReliableChannel {
    let Channel::Reliable(reliable) = connection.channel(0) else {
        panic!("channel 0 is not reliable");
    };
    reliable
}

#[test]
fn loopback_single_message() {
    let mut pair = Pair::new(ConnectionConfig::default(), 1);
    pair.client
        .connection
        .send_message(0, data_message(&[0xDE, 0xAD, 0xBE, 0xEF]));

    let mut received = None;
    for _ in 0..10 {
        pair.tick(TICK);
        if let Some(message) = pair.server.connection.receive_message(0) {
            received = Some(message);
            break;
        }
    }
    let message = received.expect("message delivered");
    assert_eq!(message.id(), 0);
    assert_eq!(
        message.body::<DataBody>(),
        Some(&DataBody(vec![0xDE, 0xAD, 0xBE, 0xEF]))
    );
    assert_eq!(
        pair.client.connection.channel(0).counters().messages_sent,
        1
    );
    assert_eq!(
        pair.server.connection.channel(0).counters().messages_received,
        1
    );
}

#[test]
fn lossy_reliable_burst_delivers_in_order() {
    let mut pair = Pair::new(ConnectionConfig::default(), 42);
    pair.loss = 0.5;
    pair.jitter = Duration::from_millis(20);

    for value in 0..1000u32 {
        pair.client.connection.send_message(0, counter_message(value));
    }

    let mut next_expected = 0u32;
    let mut elapsed = Duration::ZERO;
    while elapsed < Duration::from_secs(30) {
        if next_expected == 1000
            && reliable_channel_of(&pair.client.connection).oldest_unacked_message_id() == 1000
        {
            break;
        }
        pair.tick(TICK);
        elapsed += TICK;
        while let Some(message) = pair.server.connection.receive_message(0) {
            assert_eq!(message.id(), next_expected as u16);
            assert_eq!(message.body::<CounterBody>(), Some(&CounterBody(next_expected)));
            next_expected += 1;
        }
    }
    assert_eq!(next_expected, 1000, "all messages delivered in order");
    assert!(pair.client.connection.error().is_none());
    assert!(pair.server.connection.error().is_none());
    assert_eq!(
        reliable_channel_of(&pair.client.connection).oldest_unacked_message_id(),
        1000
    );
}

#[test]
fn block_survives_fragmentation_and_loss() {
    let mut channel_config = ChannelConfig::new(ChannelKind::ReliableOrdered);
    channel_config.max_block_size = 10_000;
    channel_config.block_fragment_size = 1024;
    let mut pair = Pair::new(ConnectionConfig::new(vec![channel_config]), 7);
    pair.loss = 0.25;

    let block: Vec<u8> = (0..10_000usize).map(|i| (i * 33 + 1) as u8).collect();
    pair.client.connection.send_message(0, block_message(block.clone()));

    let mut received = None;
    let mut elapsed = Duration::ZERO;
    while received.is_none() && elapsed < Duration::from_secs(30) {
        pair.tick(TICK);
        elapsed += TICK;
        received = pair.server.connection.receive_message(0);
    }
    let message = received.expect("block delivered");
    assert_eq!(message.id(), 0);
    assert_eq!(message.block(), Some(&block[..]));

    // let the remaining fragment acks drain so the send block retires
    let mut elapsed = Duration::ZERO;
    while reliable_channel_of(&pair.client.connection).has_active_send_block()
        && elapsed < Duration::from_secs(30)
    {
        pair.tick(TICK);
        elapsed += TICK;
    }
    assert!(!reliable_channel_of(&pair.client.connection).has_active_send_block());
    assert!(!pair.client.connection.has_messages_to_send(0));
}

#[test]
fn send_queue_overflow_errors_the_channel() {
    let mut config = ConnectionConfig::default();
    config.channels[0].message_send_queue_size = 8;
    let mut pair = Pair::new(config, 3);

    for value in 0..9u32 {
        pair.client.connection.send_message(0, counter_message(value));
    }
    assert_eq!(
        pair.client.connection.channel(0).error(),
        Some(ChannelError::SendQueueFull)
    );
    assert_eq!(
        pair.client.connection.channel(0).counters().messages_sent,
        8
    );
    assert!(pair.client.connection.receive_message(0).is_none());

    pair.tick(TICK);
    assert_eq!(
        pair.client.connection.error(),
        Some(ConnectionError::ChannelError)
    );
}

#[test]
fn receive_window_overrun_desyncs_receiver() {
    let mut config = ConnectionConfig::default();
    config.channels[0].message_receive_queue_size = 8;
    let mut pair = Pair::new(config, 5);

    {
        let Channel::Reliable(reliable) = pair.client.connection.channel_mut(0) else {
            panic!("channel 0 is not reliable");
        };
        reliable.set_send_message_id(20);
    }
    pair.client.connection.send_message(0, counter_message(0));

    for _ in 0..10 {
        pair.tick(TICK);
        if pair.server.connection.channel(0).error().is_some() {
            break;
        }
    }
    assert_eq!(
        pair.server.connection.channel(0).error(),
        Some(ChannelError::Desync)
    );
    // the connection surfaces the channel error on its next advance
    pair.tick(TICK);
    assert_eq!(
        pair.server.connection.error(),
        Some(ConnectionError::ChannelError)
    );
}

#[test]
fn message_ids_wrap_cleanly() {
    let mut pair = Pair::new(ConnectionConfig::default(), 11);
    {
        let Channel::Reliable(reliable) = pair.client.connection.channel_mut(0) else {
            panic!("channel 0 is not reliable");
        };
        reliable.set_send_message_id(65530);
    }
    {
        let Channel::Reliable(reliable) = pair.server.connection.channel_mut(0) else {
            panic!("channel 0 is not reliable");
        };
        reliable.set_receive_message_id(65530);
    }

    for value in 0..20u32 {
        pair.client.connection.send_message(0, counter_message(value));
    }

    let expected_ids: Vec<u16> = (0..20u16).map(|offset| 65530u16.wrapping_add(offset)).collect();
    let mut delivered = Vec::new();
    let mut elapsed = Duration::ZERO;
    while delivered.len() < 20 && elapsed < Duration::from_secs(10) {
        pair.tick(TICK);
        elapsed += TICK;
        while let Some(message) = pair.server.connection.receive_message(0) {
            assert_eq!(
                message.body::<CounterBody>(),
                Some(&CounterBody(delivered.len() as u32))
            );
            delivered.push(message.id());
        }
    }
    assert_eq!(delivered, expected_ids);
}

#[test]
fn unreliable_channel_drops_but_never_duplicates() {
    let config = ConnectionConfig::new(vec![ChannelConfig::new(ChannelKind::UnreliableUnordered)]);
    let mut pair = Pair::new(config, 9);
    pair.loss = 0.3;

    let mut seen = HashSet::new();
    let mut sent = 0u32;
    for _ in 0..100 {
        for _ in 0..5 {
            pair.client.connection.send_message(0, counter_message(sent));
            sent += 1;
        }
        pair.tick(TICK);
        while let Some(message) = pair.server.connection.receive_message(0) {
            let CounterBody(value) = message.body::<CounterBody>().expect("counter body");
            assert!(*value < sent);
            assert!(seen.insert(*value), "duplicate delivery of {value}");
        }
    }
    // lossy link: some got through, and with 30% loss some did not
    assert!(!seen.is_empty());
    assert!((seen.len() as u32) < sent);
    assert!(pair.client.connection.error().is_none());
    assert!(pair.server.connection.error().is_none());
}
