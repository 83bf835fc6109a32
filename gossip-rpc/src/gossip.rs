//! Gossip controller: shared state of every peer conversation.
use std::sync::Arc;

use crossbeam_channel as chan;
use thiserror::Error;

use crate::admission::{Admission, Halt, PlatformStatus, Status};
use crate::clock::Clock;
use crate::config::Config;
use crate::events::{Event, Reporter, SyncPhase};
use crate::permits::{Permits, Rates};
use crate::protocol::{Outbox, PeerHandler, PeerProtocol};
use crate::{LocalDuration, NodeId};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("gossip is already started")]
    AlreadyStarted,
    #[error("gossip is not started")]
    NotStarted,
}

/// Owns the halt flag, platform status and permit pool shared by all peer engines.
pub struct Gossip {
    config: Config,
    clock: Arc<dyn Clock>,
    halt: Halt,
    status: Status,
    permits: Permits,
    reporter: Reporter,
    started: bool,
}

impl Gossip {
    /// Create a controller for a roster of the given size, including ourselves.
    pub fn new(config: Config, roster_size: usize, clock: Arc<dyn Clock>) -> Self {
        let permits = Permits::new(config.permits_for(roster_size), Rates::from(&config));

        log::debug!(
            target: "gossip",
            "Initialized gossip with {} sync permit(s) for a roster of {roster_size}",
            permits.total()
        );

        Self {
            config,
            clock,
            halt: Halt::default(),
            status: Status::default(),
            permits,
            reporter: Reporter::default(),
            started: false,
        }
    }

    /// Create the conversation engine of a peer.
    pub fn create_peer_instance<H, F>(&self, peer: NodeId, handler: F) -> PeerProtocol<H>
    where
        H: PeerHandler,
        F: FnOnce(Outbox) -> H,
    {
        let admission = Admission::new(
            peer,
            self.halt.clone(),
            self.status.clone(),
            self.permits.clone(),
            self.reporter.clone(),
        );
        PeerProtocol::new(
            peer,
            admission,
            self.reporter.clone(),
            self.clock.clone(),
            self.config.clone(),
            handler,
        )
    }

    pub fn update_platform_status(&self, status: PlatformStatus) {
        let previous = self.status.get();

        if previous != status {
            log::info!(target: "gossip", "Platform status changed from {previous:?} to {status:?}");
            self.status.set(status);
        }
    }

    pub fn platform_status(&self) -> PlatformStatus {
        self.status.get()
    }

    pub fn start(&mut self) -> Result<(), Error> {
        if self.started {
            return Err(Error::AlreadyStarted);
        }
        self.started = true;
        self.halt.set(false);

        log::info!(target: "gossip", "Gossip started");

        Ok(())
    }

    /// Halt gossip, and wait for running conversations to end.
    pub fn stop(&mut self) -> Result<(), Error> {
        if !self.started {
            return Err(Error::NotStarted);
        }
        self.started = false;
        self.halt.set(true);
        self.permits.wait_for_all_released();

        log::info!(target: "gossip", "Gossip stopped");

        Ok(())
    }

    /// Halt gossip, and wait for running conversations to end.
    pub fn pause(&self) -> Result<(), Error> {
        if !self.started {
            return Err(Error::NotStarted);
        }
        self.halt.set(true);
        self.permits.wait_for_all_released();

        log::info!(target: "gossip", "Gossip paused");

        Ok(())
    }

    /// Resume gossip after a pause.
    ///
    /// All permits start out revoked, and are returned as the system reports being healthy.
    pub fn resume(&self) -> Result<(), Error> {
        if !self.started {
            return Err(Error::NotStarted);
        }
        self.permits.revoke_all();
        self.halt.set(false);

        log::info!(target: "gossip", "Gossip resumed");

        Ok(())
    }

    pub fn is_halted(&self) -> bool {
        self.halt.is_halted()
    }

    /// Report how long the system has been unhealthy, zero when healthy.
    pub fn report_unhealthy_duration(&self, duration: LocalDuration) {
        self.permits
            .report_unhealthy_duration(duration, self.clock.now());
    }

    /// Grow or shrink the permit pool, eg. when peers join or leave the roster.
    pub fn adjust_total_permits(&self, delta: isize) {
        self.permits.adjust_total(delta);
    }

    pub fn permits(&self) -> &Permits {
        &self.permits
    }

    /// Current sync phase of a peer.
    pub fn phase(&self, peer: &NodeId) -> SyncPhase {
        self.reporter.phase(peer)
    }

    /// Subscribe to protocol events.
    pub fn events(&self) -> chan::Receiver<Event> {
        self.reporter.subscribe()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
