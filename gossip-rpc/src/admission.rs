//! Admission control: whether a conversation with a peer may start right now.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::events::{Reporter, SkipReason};
use crate::permits::{Permit, Permits};
use crate::{Link, NodeId};

/// Lifecycle status of the local platform.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformStatus {
    #[default]
    StartingUp,
    Active,
    ReplayingEvents,
    Observing,
    Freezing,
    FreezeComplete,
    Behind,
    ReconnectComplete,
    Checking,
    CatastrophicFailure,
}

impl PlatformStatus {
    /// Whether gossip may run in this status.
    pub fn permits_sync(&self) -> bool {
        matches!(
            self,
            Self::Active | Self::Freezing | Self::Checking | Self::Observing | Self::ReconnectComplete
        )
    }
}

/// Gossip halt flag, shared by every peer conversation.
#[derive(Debug, Clone, Default)]
pub struct Halt(Arc<AtomicBool>);

impl Halt {
    pub fn is_halted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, halted: bool) {
        self.0.store(halted, Ordering::SeqCst);
    }
}

/// Latest known platform status, shared by every peer conversation.
#[derive(Debug, Clone, Default)]
pub struct Status(Arc<RwLock<PlatformStatus>>);

impl Status {
    pub fn get(&self) -> PlatformStatus {
        *self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, status: PlatformStatus) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = status;
    }
}

/// Per-peer admission controller.
///
/// Holds the sync permit of the admitted conversation, until the conversation ends or the
/// connection attempt fails.
#[derive(Debug)]
pub struct Admission {
    peer: NodeId,
    halt: Halt,
    status: Status,
    permits: Permits,
    reporter: Reporter,
    permit: Option<Permit>,
}

impl Admission {
    pub fn new(peer: NodeId, halt: Halt, status: Status, permits: Permits, reporter: Reporter) -> Self {
        Self {
            peer,
            halt,
            status,
            permits,
            reporter,
            permit: None,
        }
    }

    /// Whether we should open a conversation with the peer.
    pub fn should_initiate(&mut self) -> bool {
        self.admit(Link::Outbound)
    }

    /// Whether we should accept a conversation opened by the peer.
    pub fn should_accept(&mut self) -> bool {
        self.admit(Link::Inbound)
    }

    /// Both sides initiating at once is fine, the connection is used either way.
    pub fn accept_on_simultaneous_initiate(&self) -> bool {
        true
    }

    /// The connection we were admitted for could not be opened.
    pub fn initiate_failed(&mut self) {
        self.release();
    }

    /// The connection we were admitted for could not be accepted.
    pub fn accept_failed(&mut self) {
        self.release();
    }

    fn admit(&mut self, link: Link) -> bool {
        if self.halt.is_halted() {
            self.refuse(link, SkipReason::Halted);
            return false;
        }
        let status = self.status.get();
        if !status.permits_sync() {
            log::trace!(target: "gossip", "Not syncing with {} while {status:?}", self.peer);
            self.refuse(link, SkipReason::PlatformStatus);
            return false;
        }
        let Some(permit) = self.permits.try_acquire() else {
            self.refuse(link, SkipReason::NoPermit);
            return false;
        };
        // A permit left over from an earlier admission is released here.
        self.permit = Some(permit);

        true
    }

    fn refuse(&mut self, link: Link, reason: SkipReason) {
        log::trace!(target: "gossip", "Refusing {link} conversation with {}: {reason:?}", self.peer);

        self.release();
        self.reporter.skipped(self.peer, reason);
    }

    fn release(&mut self) {
        self.permit = None;
    }

    /// Take the permit of the admitted conversation.
    pub(crate) fn take_permit(&mut self) -> Option<Permit> {
        self.permit.take()
    }

    pub fn holds_permit(&self) -> bool {
        self.permit.is_some()
    }

    pub fn is_halted(&self) -> bool {
        self.halt.is_halted()
    }

    pub fn halt(&self) -> &Halt {
        &self.halt
    }

    pub fn permits(&self) -> &Permits {
        &self.permits
    }
}
