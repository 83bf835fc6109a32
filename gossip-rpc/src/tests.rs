//! Full conversations over in-memory connections.
use std::sync::Arc;
use std::{io, thread, time};

use qcheck_macros::quickcheck;

use crate::admission::PlatformStatus;
use crate::clock::RefClock;
use crate::config::Config;
use crate::events::{Event, SyncPhase};
use crate::gossip::Gossip;
use crate::message::{EventWindow, GossipEvent, KnownTips, Ping, SyncData};
use crate::protocol::{Error, PeerProtocol, Sender, State};
use crate::test::handler::{Received, Recorder};
use crate::test::logger;
use crate::transport::pipe::Pipe;
use crate::transport::Connection;
use crate::wire::{Batch, Decode, Encode, Message};
use crate::{LocalDuration, LocalTime, NodeId};

const TIMEOUT: time::Duration = time::Duration::from_secs(10);

fn node(clock: &RefClock) -> Gossip {
    logger::init(log::Level::Debug);

    let gossip = Gossip::new(Config::default(), 3, Arc::new(clock.clone()));
    gossip.update_platform_status(PlatformStatus::Active);
    gossip
}

fn events(count: u32) -> Vec<GossipEvent> {
    (0..count)
        .map(|i| GossipEvent::from(i.to_be_bytes().to_vec()))
        .collect()
}

/// Acts as a peer speaking the wire protocol directly.
struct RawPeer {
    reader: io::BufReader<<Pipe as Connection>::Reader>,
    writer: <Pipe as Connection>::Writer,
}

impl RawPeer {
    fn new(pipe: &Pipe) -> Self {
        let (reader, writer) = pipe.split().unwrap();

        Self {
            reader: io::BufReader::new(reader),
            writer,
        }
    }

    fn read(&mut self) -> Batch {
        Batch::decode(&mut self.reader).unwrap()
    }

    /// Read batches until the end-of-conversation marker, returning every message.
    fn read_until_end(&mut self) -> Vec<Message> {
        let mut messages = Vec::new();

        while let Batch::Messages(batch) = self.read() {
            messages.extend(batch);
        }
        messages
    }

    fn send(&mut self, messages: Vec<Message>) {
        Batch::Messages(messages).encode(&mut self.writer).unwrap();
    }

    fn end(&mut self) {
        Batch::EndOfConversation.encode(&mut self.writer).unwrap();
    }
}

fn without_pings(messages: Vec<Message>) -> Vec<Message> {
    messages
        .into_iter()
        .filter(|m| !matches!(m, Message::Ping(_)))
        .collect()
}

#[test]
fn test_conversation() {
    let clock = RefClock::from(LocalTime::from_secs(1_000));
    let (alice_node, bob_node) = (node(&clock), node(&clock));
    let mut alice = alice_node.create_peer_instance(NodeId(2), Recorder::new);
    let mut bob = bob_node.create_peer_instance(NodeId(1), Recorder::new);
    let probe = bob.handler().probe();
    let outbox = alice.outbox().clone();
    let sync_data = SyncData {
        window: EventWindow {
            latest_consensus_round: 42,
            ..EventWindow::default()
        },
        tips: vec![],
    };

    assert!(alice.should_initiate());
    assert!(bob.should_accept());

    alice.send_sync_data(sync_data.clone());
    alice.send_tips(KnownTips(vec![true, false, true]));
    alice.send_events(events(600));
    alice.send_end_of_events();

    let (a, b) = Pipe::pair();
    thread::scope(|s| {
        let alice_run = s.spawn(|| alice.run_protocol(&a));
        let bob_run = s.spawn(|| bob.run_protocol(&b));

        assert!(probe.wait_for(TIMEOUT, |log| log
            .received
            .contains(&Received::EventsFinished)));
        outbox.break_conversation();

        alice_run.join().unwrap().unwrap();
        bob_run.join().unwrap().unwrap();
    });

    let all = events(600);
    assert_eq!(
        probe.received(),
        vec![
            Received::SyncData(sync_data),
            Received::Tips(KnownTips(vec![true, false, true])),
            Received::Events(all[..512].to_vec()),
            Received::Events(all[512..].to_vec()),
            Received::EventsFinished,
        ]
    );
    assert_eq!(alice.state(), State::Idle);
    assert_eq!(bob.state(), State::Idle);
    assert_eq!(alice_node.permits().acquired(), 0);
    assert_eq!(bob_node.permits().acquired(), 0);
    assert_eq!(alice_node.phase(&NodeId(2)), SyncPhase::OutsideOfRpc);
    assert_eq!(bob_node.phase(&NodeId(1)), SyncPhase::OutsideOfRpc);
}

#[test]
fn test_break_conversation_twice() {
    let clock = RefClock::from(LocalTime::from_secs(1_000));
    let node = node(&clock);
    let mut engine = node.create_peer_instance(NodeId(2), Recorder::new);
    let outbox = engine.outbox().clone();
    let (local, remote) = Pipe::pair();
    let mut peer = RawPeer::new(&remote);

    assert!(engine.should_initiate());

    thread::scope(|s| {
        let run = s.spawn(|| engine.run_protocol(&local));

        while !outbox.is_running() {
            thread::yield_now();
        }
        outbox.break_conversation();
        outbox.break_conversation();

        // Exactly one end-of-conversation marker, then nothing.
        assert!(without_pings(peer.read_until_end()).is_empty());
        peer.end();

        run.join().unwrap().unwrap();
    });
    drop(local);

    let mut rest = Vec::new();
    io::Read::read_to_end(&mut peer.reader, &mut rest).ok();
    assert!(rest.is_empty());
}

#[test]
fn test_unhealthy_ends_conversation_then_times_out() {
    let clock = RefClock::from(LocalTime::from_secs(1_000));
    let node = node(&clock);
    let events = node.events();
    let mut engine = node.create_peer_instance(NodeId(2), Recorder::new);
    let outbox = engine.outbox().clone();
    let probe = engine.handler().probe();
    let max_sync_time = node.config().max_sync_time;
    let (local, remote) = Pipe::pair();
    let mut peer = RawPeer::new(&remote);

    assert!(engine.should_accept());
    node.permits().revoke_all();

    let result = thread::scope(|s| {
        let run = s.spawn(|| engine.run_protocol(&local));

        // The handler sees an unhealthy pool and ends our side.
        peer.read_until_end();
        assert!(outbox.is_finish_pending());
        assert_eq!(probe.log().healthy, Some(false));

        // The peer keeps talking past the deadline.
        clock.elapse(LocalDuration::from_millis(max_sync_time.as_millis() + 1));
        peer.send(vec![Message::EventsFinished]);

        run.join().unwrap()
    });

    assert!(
        matches!(result, Err(Error::Timeout { max, .. }) if max == max_sync_time),
        "unexpected result {result:?}"
    );
    assert_eq!(node.permits().acquired(), 0);
    assert!(events.try_iter().any(|e| matches!(
        e,
        Event::ConversationEnded {
            error: Some(_),
            ..
        }
    )));
}

#[test]
fn test_peer_end_within_deadline() {
    let clock = RefClock::from(LocalTime::from_secs(1_000));
    let node = node(&clock);
    let mut engine = node.create_peer_instance(NodeId(2), Recorder::new);
    let outbox = engine.outbox().clone();
    let max_sync_time = node.config().max_sync_time;
    let (local, remote) = Pipe::pair();
    let mut peer = RawPeer::new(&remote);

    assert!(engine.should_initiate());

    thread::scope(|s| {
        let run = s.spawn(|| engine.run_protocol(&local));

        while !outbox.is_running() {
            thread::yield_now();
        }
        outbox.break_conversation();
        peer.read_until_end();

        // Still within the deadline.
        clock.elapse(max_sync_time);
        peer.send(vec![Message::EventsFinished]);
        peer.end();

        run.join().unwrap().unwrap();
    });
    assert_eq!(
        engine.handler().log().received,
        vec![Received::EventsFinished]
    );
}

#[test]
fn test_conversations_share_connection() {
    let clock = RefClock::from(LocalTime::from_secs(1_000));
    let node = node(&clock);
    let mut engine = node.create_peer_instance(NodeId(2), Recorder::new);
    let probe = engine.handler().probe();
    let (local, remote) = Pipe::pair();
    let mut peer = RawPeer::new(&remote);

    // Both conversations arrive in a single write.
    let mut bytes = Vec::new();
    Batch::EndOfConversation.encode(&mut bytes).unwrap();
    Batch::Messages(vec![Message::EventsFinished])
        .encode(&mut bytes)
        .unwrap();
    Batch::EndOfConversation.encode(&mut bytes).unwrap();
    io::Write::write_all(&mut peer.writer, &bytes).unwrap();

    assert!(engine.should_accept());
    engine.run_protocol(&local).unwrap();
    assert!(probe.received().is_empty());

    assert!(engine.should_accept());
    engine.run_protocol(&local).unwrap();
    assert_eq!(probe.received(), vec![Received::EventsFinished]);

    // One end marker from us per conversation.
    assert!(without_pings(peer.read_until_end()).is_empty());
    assert!(without_pings(peer.read_until_end()).is_empty());
}

#[test]
fn test_handler_done() {
    let clock = RefClock::from(LocalTime::from_secs(1_000));
    let node = node(&clock);
    let mut engine = node.create_peer_instance(NodeId(2), Recorder::new);
    let probe = engine.handler().probe();
    let outbox = engine.handler().outbox().clone();
    let (local, remote) = Pipe::pair();
    let mut peer = RawPeer::new(&remote);

    assert!(engine.should_accept());

    thread::scope(|s| {
        let run = s.spawn(|| engine.run_protocol(&local));

        while !outbox.is_running() {
            thread::yield_now();
        }
        probe.stop();
        peer.read_until_end();
        assert!(outbox.is_finish_pending());

        peer.end();
        run.join().unwrap().unwrap();
    });
    assert!(!outbox.is_running());
    assert!(probe.log().periodic_checks > 0);
    assert_eq!(probe.log().healthy, Some(true));
}

#[test]
fn test_ping_reply() {
    let clock = RefClock::from(LocalTime::from_secs(1_000));
    let node = node(&clock);
    let mut engine = node.create_peer_instance(NodeId(2), Recorder::new);
    let (local, remote) = Pipe::pair();
    let mut peer = RawPeer::new(&remote);

    assert!(engine.should_accept());

    thread::scope(|s| {
        let run = s.spawn(|| engine.run_protocol(&local));

        peer.send(vec![Message::Ping(Ping {
            timestamp: 1,
            correlation_id: 7,
        })]);

        let mut replies = Vec::new();
        while replies.is_empty() {
            let Batch::Messages(messages) = peer.read() else {
                panic!("conversation ended early");
            };
            replies.extend(messages.into_iter().filter_map(|m| match m {
                Message::PingReply(reply) => Some(reply),
                _ => None,
            }));
        }
        peer.end();

        let rest = peer.read_until_end();
        assert!(!rest.iter().any(|m| matches!(m, Message::PingReply(_))));
        assert_eq!(
            replies,
            vec![Ping {
                timestamp: clock.local_time().as_millis(),
                correlation_id: 7
            }]
        );
        run.join().unwrap().unwrap();
    });
}

#[test]
fn test_ping_latency() {
    let clock = RefClock::from(LocalTime::from_secs(1_000));
    let node = node(&clock);
    let events = node.events();
    let mut engine = node.create_peer_instance(NodeId(2), Recorder::new);
    let (local, remote) = Pipe::pair();
    let mut peer = RawPeer::new(&remote);

    assert!(engine.should_accept());

    thread::scope(|s| {
        let run = s.spawn(|| engine.run_protocol(&local));

        // The engine pings as soon as it's idle.
        let ping = loop {
            let Batch::Messages(messages) = peer.read() else {
                panic!("conversation ended early");
            };
            if let Some(Message::Ping(ping)) = messages.into_iter().next() {
                break ping;
            }
        };
        assert_eq!(ping.correlation_id, 1);

        clock.elapse(LocalDuration::from_millis(40));
        peer.send(vec![Message::PingReply(Ping {
            timestamp: 0,
            correlation_id: ping.correlation_id,
        })]);

        let latency = loop {
            match events.recv_timeout(TIMEOUT).unwrap() {
                Event::PingLatency { latency, .. } => break latency,
                _ => continue,
            }
        };
        assert_eq!(latency, LocalDuration::from_millis(40));

        peer.end();
        peer.read_until_end();
        run.join().unwrap().unwrap();
    });
}

#[test]
fn test_dispatch_failure() {
    let clock = RefClock::from(LocalTime::from_secs(1_000));
    let (alice_node, bob_node) = (node(&clock), node(&clock));
    let mut alice = alice_node.create_peer_instance(NodeId(2), Recorder::new);
    let mut bob = bob_node.create_peer_instance(NodeId(1), Recorder::new);
    let probe = bob.handler().probe();

    probe.fail_on_events_finished();
    assert!(alice.should_initiate());
    assert!(bob.should_accept());
    alice.send_events(events(3));
    alice.send_end_of_events();

    let (a, b) = Pipe::pair();
    let result = thread::scope(|s| {
        let alice_run = s.spawn(|| alice.run_protocol(&a));
        let bob_run = s.spawn(|| bob.run_protocol(&b));
        let result = bob_run.join().unwrap();

        // Either side of the race is fine, as long as it ends.
        alice_run.join().unwrap().ok();

        result
    });
    assert!(matches!(result, Err(Error::Dispatch(_))), "{result:?}");
    assert_eq!(probe.received(), vec![Received::Events(events(3))]);
    assert_eq!(bob_node.permits().acquired(), 0);

    // The engine can be used again, on a new connection.
    assert!(alice.should_initiate());
    assert!(bob.should_accept());
    alice.send_end_of_events();

    let outbox = alice.outbox().clone();
    let (a, b) = Pipe::pair();
    thread::scope(|s| {
        let alice_run = s.spawn(|| alice.run_protocol(&a));
        let bob_run = s.spawn(|| bob.run_protocol(&b));

        assert!(probe.wait_for(TIMEOUT, |log| log
            .received
            .contains(&Received::EventsFinished)));
        outbox.break_conversation();

        alice_run.join().unwrap().unwrap();
        bob_run.join().unwrap().unwrap();
    });
}

#[test]
fn test_protocol_error() {
    let clock = RefClock::from(LocalTime::from_secs(1_000));
    let node = node(&clock);
    let mut engine = node.create_peer_instance(NodeId(2), Recorder::new);
    let (local, remote) = Pipe::pair();
    let (_, mut writer) = remote.split().unwrap();

    assert!(engine.should_accept());

    let result = thread::scope(|s| {
        let run = s.spawn(|| engine.run_protocol(&local));

        // One message with an unknown tag.
        io::Write::write_all(&mut writer, &[0x00, 0x01, 0x2a]).unwrap();

        run.join().unwrap()
    });
    assert!(matches!(
        result,
        Err(Error::Wire(crate::wire::Error::UnknownMessageType(42)))
    ));
    assert_eq!(node.permits().acquired(), 0);
}

#[test]
fn test_pause_ends_conversations() {
    let clock = RefClock::from(LocalTime::from_secs(1_000));
    let mut node = node(&clock);
    let mut engine = node.create_peer_instance(NodeId(2), Recorder::new);
    let outbox = engine.outbox().clone();
    let (local, remote) = Pipe::pair();
    let mut peer = RawPeer::new(&remote);

    node.start().unwrap();
    assert!(engine.should_initiate());

    thread::scope(|s| {
        let run = s.spawn(|| engine.run_protocol(&local));
        s.spawn(move || {
            peer.read_until_end();
            peer.end();
        });
        while !outbox.is_running() {
            thread::yield_now();
        }
        node.pause().unwrap();

        run.join().unwrap().unwrap();
    });
    assert!(!engine.should_initiate());
}

#[quickcheck]
fn prop_frames_fifo(messages: Vec<Message>) {
    let clock = RefClock::from(LocalTime::from_secs(1_000));
    let node = node(&clock);
    let mut engine: PeerProtocol<Recorder> = node.create_peer_instance(NodeId(2), Recorder::new);
    let (local, remote) = Pipe::pair();
    let mut peer = RawPeer::new(&remote);
    let mut expected = Vec::new();

    assert!(engine.should_initiate());

    for message in messages {
        match message.clone() {
            Message::SyncData(data) => engine.send_sync_data(data),
            Message::KnownTips(tips) => engine.send_tips(tips),
            Message::Event(event) => engine.send_events(vec![event]),
            Message::EventsFinished => engine.send_end_of_events(),
            Message::Ping(_) | Message::PingReply(_) => continue,
        }
        expected.push(message);
    }

    thread::scope(|s| {
        let run = s.spawn(|| engine.run_protocol(&local));
        let mut received = Vec::new();

        while received.len() < expected.len() {
            let Batch::Messages(messages) = peer.read() else {
                panic!("conversation ended early");
            };
            received.extend(without_pings(messages));
        }
        peer.end();
        received.extend(without_pings(peer.read_until_end()));

        assert_eq!(received, expected);
        run.join().unwrap().unwrap();
    });
}
