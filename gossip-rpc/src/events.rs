//! Observable protocol events and per-peer sync phases.
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_channel as chan;

use crate::{LocalDuration, NodeId};

/// What a peer conversation is currently doing.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncPhase {
    #[default]
    Idle,
    ExchangingWindows,
    ExchangingTips,
    ExchangingEvents,
    SendingEvents,
    ReceivingEvents,
    OtherFallenBehind,
    SelfFallenBehind,
    /// Gossip is halted, conversations are refused.
    GossipHalted,
    /// The platform status doesn't allow syncing.
    PlatformStatusPreventingSync,
    /// No sync permit was available.
    NoPermit,
    /// No conversation is running with the peer.
    OutsideOfRpc,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Why a conversation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    Halted,
    PlatformStatus,
    NoPermit,
}

impl SkipReason {
    /// The phase reported for a peer when a conversation is refused for this reason.
    pub fn phase(&self) -> SyncPhase {
        match self {
            Self::Halted => SyncPhase::GossipHalted,
            Self::PlatformStatus => SyncPhase::PlatformStatusPreventingSync,
            Self::NoPermit => SyncPhase::NoPermit,
        }
    }
}

/// A protocol event, for subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    PhaseChanged {
        peer: NodeId,
        from: SyncPhase,
        to: SyncPhase,
    },
    SyncSkipped {
        peer: NodeId,
        reason: SkipReason,
    },
    PingLatency {
        peer: NodeId,
        latency: LocalDuration,
    },
    ConversationStarted {
        peer: NodeId,
    },
    ConversationEnded {
        peer: NodeId,
        /// Set if the conversation failed.
        error: Option<String>,
    },
}

/// Publishes events to subscribers.
#[derive(Debug, Clone)]
pub struct Emitter<T> {
    subscribers: Arc<Mutex<Vec<chan::Sender<T>>>>,
}

impl<T> Default for Emitter<T> {
    fn default() -> Emitter<T> {
        Emitter {
            subscribers: Default::default(),
        }
    }
}

impl<T: Clone> Emitter<T> {
    /// Emit event to subscribers and drop those who can't receive it.
    pub fn emit(&self, event: T) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|s| s.try_send(event.clone()).is_ok());
    }

    /// Subscribe to events stream.
    pub fn subscribe(&self) -> chan::Receiver<T> {
        let (sender, receiver) = chan::unbounded();
        let mut subs = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subs.push(sender);

        receiver
    }
}

/// Shared event emitter and sync phase registry.
#[derive(Debug, Clone, Default)]
pub struct Reporter {
    emitter: Emitter<Event>,
    phases: Arc<Mutex<HashMap<NodeId, SyncPhase>>>,
}

impl Reporter {
    pub fn emit(&self, event: Event) {
        self.emitter.emit(event)
    }

    pub fn subscribe(&self) -> chan::Receiver<Event> {
        self.emitter.subscribe()
    }

    /// Record the sync phase of a peer, returning the phase it replaces.
    pub fn report_phase(&self, peer: NodeId, phase: SyncPhase) -> SyncPhase {
        let previous = self
            .phases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer, phase)
            .unwrap_or_default();

        if previous != phase {
            log::trace!(target: "gossip", "Peer {peer} sync phase {previous} -> {phase}");

            self.emit(Event::PhaseChanged {
                peer,
                from: previous,
                to: phase,
            });
        }
        previous
    }

    /// Current sync phase of a peer.
    pub fn phase(&self, peer: &NodeId) -> SyncPhase {
        self.phases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .copied()
            .unwrap_or_default()
    }

    /// Record that a conversation with a peer was refused.
    pub fn skipped(&self, peer: NodeId, reason: SkipReason) {
        self.report_phase(peer, reason.phase());
        self.emit(Event::SyncSkipped { peer, reason });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emitter_drops_closed_subscribers() {
        let emitter = Emitter::<u8>::default();
        let first = emitter.subscribe();
        let second = emitter.subscribe();

        drop(second);
        emitter.emit(1);
        emitter.emit(2);

        assert_eq!(first.try_iter().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(emitter.subscribers.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_report_phase() {
        let reporter = Reporter::default();
        let events = reporter.subscribe();
        let peer = NodeId(3);

        assert_eq!(reporter.phase(&peer), SyncPhase::Idle);
        assert_eq!(
            reporter.report_phase(peer, SyncPhase::ExchangingTips),
            SyncPhase::Idle
        );
        assert_eq!(
            reporter.report_phase(peer, SyncPhase::ExchangingTips),
            SyncPhase::ExchangingTips
        );
        assert_eq!(reporter.phase(&peer), SyncPhase::ExchangingTips);

        // Reporting the same phase twice only emits once.
        assert_eq!(
            events.try_iter().collect::<Vec<_>>(),
            vec![Event::PhaseChanged {
                peer,
                from: SyncPhase::Idle,
                to: SyncPhase::ExchangingTips
            }]
        );
    }

    #[test]
    fn test_skipped() {
        let reporter = Reporter::default();
        let events = reporter.subscribe();
        let peer = NodeId(1);

        reporter.skipped(peer, SkipReason::NoPermit);

        assert_eq!(reporter.phase(&peer), SyncPhase::NoPermit);
        assert!(events.try_iter().any(|e| e
            == Event::SyncSkipped {
                peer,
                reason: SkipReason::NoPermit
            }));
    }
}
