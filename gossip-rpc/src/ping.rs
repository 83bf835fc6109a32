//! Keep-alive pings and round-trip latency measurement.
//!
//! The writer side owns a [`PingTracker`] and decides when to probe the peer. Replies are
//! matched on the dispatcher side by a [`PingHandler`]. The two share only the map of pings
//! still awaiting a reply.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::events::{Event, Reporter};
use crate::message::Ping;
use crate::{LocalDuration, LocalTime, NodeId};

/// Pings sent and not yet answered, keyed by correlation id.
#[derive(Debug, Clone, Default)]
pub struct PendingPings(Arc<Mutex<HashMap<u64, LocalTime>>>);

impl PendingPings {
    fn insert(&self, correlation_id: u64, sent: LocalTime) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(correlation_id, sent);
    }

    fn remove(&self, correlation_id: u64) -> Option<LocalTime> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&correlation_id)
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decides when to ping a peer. Confined to the writer thread.
#[derive(Debug)]
pub struct PingTracker {
    period: LocalDuration,
    /// Correlation id of the next ping.
    next_id: u64,
    last_ping: Option<LocalTime>,
    pending: PendingPings,
}

impl PingTracker {
    pub fn new(period: LocalDuration, pending: PendingPings) -> Self {
        Self {
            period,
            next_id: 1,
            last_ping: None,
            pending,
        }
    }

    /// Create a new ping if at least one ping period has elapsed since the last one.
    pub fn possibly_initiate_ping(&mut self, now: LocalTime) -> Option<Ping> {
        if let Some(last) = self.last_ping {
            let elapsed = now.as_millis().saturating_sub(last.as_millis());

            if (elapsed as u128) < self.period.as_millis() {
                return None;
            }
        }
        let correlation_id = self.next_id;

        self.next_id += 1;
        self.last_ping = Some(now);
        self.pending.insert(correlation_id, now);

        Some(Ping {
            timestamp: now.as_millis(),
            correlation_id,
        })
    }
}

/// Answers pings and matches replies to the pings we sent.
#[derive(Debug, Clone)]
pub struct PingHandler {
    peer: NodeId,
    pending: PendingPings,
    reporter: Reporter,
}

impl PingHandler {
    pub fn new(peer: NodeId, pending: PendingPings, reporter: Reporter) -> Self {
        Self {
            peer,
            pending,
            reporter,
        }
    }

    /// Build the reply to a ping from the peer.
    pub fn handle_incoming_ping(&self, ping: &Ping, now: LocalTime) -> Ping {
        Ping {
            timestamp: now.as_millis(),
            correlation_id: ping.correlation_id,
        }
    }

    /// Complete the measurement started by one of our pings.
    ///
    /// The round trip is measured against our own send time only, so clock skew between
    /// the two nodes doesn't matter. Returns `None` if no ping with this id is pending.
    pub fn handle_incoming_ping_reply(&self, reply: &Ping, now: LocalTime) -> Option<LocalDuration> {
        let Some(sent) = self.pending.remove(reply.correlation_id) else {
            log::warn!(
                target: "ping",
                "Received ping reply from {} for unknown correlation id {}",
                self.peer,
                reply.correlation_id
            );
            return None;
        };
        let latency =
            LocalDuration::from_millis(now.as_millis().saturating_sub(sent.as_millis()) as u128);

        log::trace!(
            target: "ping",
            "Ping {} to {} answered in {}ms",
            reply.correlation_id,
            self.peer,
            latency.as_millis()
        );
        self.reporter.emit(Event::PingLatency {
            peer: self.peer,
            latency,
        });

        Some(latency)
    }
}
