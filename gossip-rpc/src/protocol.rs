//! Per-peer conversation engine.
//!
//! A conversation runs three loops over one connection:
//!
//! * the *writer* drains the outbound queue onto the connection, pinging the peer when idle,
//! * the *reader* decodes batches off the connection and queues them for the dispatcher,
//! * the *dispatcher* hands inbound messages to the [`PeerHandler`], one at a time.
//!
//! Each side ends its half of the conversation by sending the end-of-conversation marker.
//! The conversation is over once both markers went through, or as soon as any loop fails.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::io::Write as _;
use std::{error, fmt, io, mem, time};

use crossbeam_channel as chan;

use crate::admission::{Admission, Halt};
use crate::clock::Clock;
use crate::config::Config;
use crate::events::{Event, Reporter, SyncPhase};
use crate::executor;
use crate::message::{GossipEvent, KnownTips, Ping, SyncData};
use crate::permits::Permits;
use crate::ping::{PendingPings, PingHandler, PingTracker};
use crate::transport::Connection;
use crate::wire;
use crate::wire::{Decode, Encode, Frame, Header, Message, END_OF_CONVERSATION};
use crate::{Link, LocalDuration, LocalTime, NodeId};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("wire: {0}")]
    Wire(#[from] wire::Error),
    #[error(
        "peer did not end the conversation {}ms after we asked to finish (limit is {}ms)",
        .elapsed.as_millis(),
        .max.as_millis()
    )]
    Timeout {
        elapsed: LocalDuration,
        max: LocalDuration,
    },
    #[error("dispatch: {0}")]
    Dispatch(Box<dyn error::Error + Send + Sync + 'static>),
    #[error(transparent)]
    Panic(#[from] executor::Panic),
}

/// Conversation phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No conversation, none admitted.
    Idle,
    /// A conversation was admitted and is about to run.
    Admitted(Link),
    /// The conversation is running.
    Running,
    /// We asked to finish, and are waiting for the peer to do the same.
    FinishPending,
}

/// Inbound work for the dispatcher.
#[derive(Debug)]
pub enum Task {
    SyncData(SyncData),
    Tips(KnownTips),
    /// Consecutive events of one batch.
    Events(Vec<GossipEvent>),
    EventsFinished,
    PingReply(Ping),
    /// Stops the dispatcher.
    PoisonPill,
}

/// Outbound side of a conversation, as seen by the handler.
///
/// Every method only enqueues, and never blocks.
pub trait Sender {
    fn send_sync_data(&self, data: SyncData);
    fn send_tips(&self, tips: KnownTips);
    /// Send events. An empty list sends nothing.
    fn send_events(&self, events: Vec<GossipEvent>);
    fn send_end_of_events(&self);
    /// Ask to end the conversation. The peer has `max_sync_time` to do the same.
    fn break_conversation(&self);
}

/// Inbound side of a conversation. Called from the dispatcher thread only, in wire order.
pub trait Receiver {
    type Error: error::Error + Send + Sync + 'static;

    fn receive_sync_data(&mut self, data: SyncData) -> Result<(), Self::Error>;
    fn receive_tips(&mut self, tips: KnownTips) -> Result<(), Self::Error>;
    fn receive_events(&mut self, events: Vec<GossipEvent>) -> Result<(), Self::Error>;
    fn receive_events_finished(&mut self) -> Result<(), Self::Error>;
}

/// Drives the sync algorithm of one peer.
pub trait PeerHandler: Receiver + Send {
    /// Called on every dispatcher iteration, with the health of the permit pool.
    /// Returning `false` ends our half of the conversation.
    fn check_for_periodic_actions(&mut self, healthy: bool) -> bool;
    /// Drop any state kept for the peer.
    fn cleanup(&mut self);
}

/// Sentinel stored while no finish is pending.
const NOT_PENDING: u64 = u64::MAX;

/// Conversation flags, shared between the loops and the [`Outbox`].
#[derive(Debug)]
struct Flags {
    running: AtomicBool,
    process_messages: AtomicBool,
    /// When we asked to finish, in milliseconds.
    finish_pending: AtomicU64,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            running: AtomicBool::new(false),
            process_messages: AtomicBool::new(false),
            finish_pending: AtomicU64::new(NOT_PENDING),
        }
    }
}

impl Flags {
    fn start(&self) {
        self.finish_pending.store(NOT_PENDING, Ordering::SeqCst);
        self.process_messages.store(true, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
    }

    fn end(&self) {
        self.process_messages.store(false, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
    }

    fn stop_processing(&self) {
        self.process_messages.store(false, Ordering::SeqCst);
    }

    /// Stop processing and start the finish deadline, unless it's already running.
    fn finish(&self, now: LocalTime) {
        self.finish_pending
            .compare_exchange(
                NOT_PENDING,
                now.as_millis(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .ok();
        self.stop_processing();
    }

    fn is_processing(&self) -> bool {
        self.process_messages.load(Ordering::SeqCst)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn finish_pending(&self) -> Option<u64> {
        match self.finish_pending.load(Ordering::SeqCst) {
            NOT_PENDING => None,
            millis => Some(millis),
        }
    }
}

/// Cloneable handle to enqueue frames for a peer.
#[derive(Clone)]
pub struct Outbox {
    peer: NodeId,
    queue: chan::Sender<Frame>,
    flags: Arc<Flags>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for Outbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outbox")
            .field("peer", &self.peer)
            .field("queued", &self.queue.len())
            .field("flags", &self.flags)
            .finish()
    }
}

impl Outbox {
    pub fn peer(&self) -> NodeId {
        self.peer
    }

    /// Number of frames waiting for the writer.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn is_running(&self) -> bool {
        self.flags.is_running()
    }

    /// Whether we asked to finish the running conversation.
    pub fn is_finish_pending(&self) -> bool {
        self.flags.finish_pending().is_some()
    }

    fn enqueue(&self, frame: Frame) {
        if self.queue.send(frame).is_err() {
            log::debug!(target: "rpc", "Dropping frame for {}: conversation is gone", self.peer);
        }
    }
}

impl Sender for Outbox {
    fn send_sync_data(&self, data: SyncData) {
        self.enqueue(Frame::SyncData(data));
    }

    fn send_tips(&self, tips: KnownTips) {
        self.enqueue(Frame::KnownTips(tips));
    }

    fn send_events(&self, events: Vec<GossipEvent>) {
        if events.is_empty() {
            return;
        }
        self.enqueue(Frame::Events(events));
    }

    fn send_end_of_events(&self) {
        self.enqueue(Frame::EventsFinished);
    }

    fn break_conversation(&self) {
        if self.flags.is_processing() {
            log::debug!(target: "rpc", "Finishing conversation with {}", self.peer);
        }
        self.flags.finish(self.clock.now());
    }
}

/// Conversation engine for one peer.
pub struct PeerProtocol<H> {
    peer: NodeId,
    handler: H,
    admission: Admission,
    /// Link of the admitted conversation, until it runs.
    admitted: Option<Link>,
    outbox: Outbox,
    outbound: chan::Receiver<Frame>,
    inbound: (chan::Sender<Task>, chan::Receiver<Task>),
    tracker: PingTracker,
    pings: PingHandler,
    reporter: Reporter,
    clock: Arc<dyn Clock>,
    config: Config,
    /// Sync phase the peer was in when the last conversation ended.
    previous_phase: SyncPhase,
}

impl<H: fmt::Debug> fmt::Debug for PeerProtocol<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerProtocol")
            .field("peer", &self.peer)
            .field("handler", &self.handler)
            .field("admitted", &self.admitted)
            .field("outbox", &self.outbox)
            .field("previous_phase", &self.previous_phase)
            .finish()
    }
}

impl<H: PeerHandler> PeerProtocol<H> {
    /// Create an engine. The handler is built from the engine's [`Outbox`].
    pub fn new<F>(
        peer: NodeId,
        admission: Admission,
        reporter: Reporter,
        clock: Arc<dyn Clock>,
        config: Config,
        handler: F,
    ) -> Self
    where
        F: FnOnce(Outbox) -> H,
    {
        let (queue, outbound) = chan::unbounded();
        let outbox = Outbox {
            peer,
            queue,
            flags: Arc::new(Flags::default()),
            clock: clock.clone(),
        };
        let pending = PendingPings::default();
        let tracker = PingTracker::new(config.ping_period, pending.clone());
        let pings = PingHandler::new(peer, pending, reporter.clone());

        Self {
            peer,
            handler: handler(outbox.clone()),
            admission,
            admitted: None,
            outbox,
            outbound,
            inbound: chan::unbounded(),
            tracker,
            pings,
            reporter,
            clock,
            config,
            previous_phase: SyncPhase::Idle,
        }
    }

    pub fn peer(&self) -> NodeId {
        self.peer
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn admission(&self) -> &Admission {
        &self.admission
    }

    pub fn state(&self) -> State {
        if self.outbox.is_running() {
            if self.outbox.is_finish_pending() {
                State::FinishPending
            } else {
                State::Running
            }
        } else if let Some(link) = self.admitted {
            State::Admitted(link)
        } else {
            State::Idle
        }
    }

    /// Whether we should open a conversation with the peer. On success, a permit is held
    /// until the conversation ends or [`Self::initiate_failed`] is called.
    pub fn should_initiate(&mut self) -> bool {
        self.admit(Link::Outbound)
    }

    /// Whether we should accept a conversation opened by the peer. On success, a permit is
    /// held until the conversation ends or [`Self::accept_failed`] is called.
    pub fn should_accept(&mut self) -> bool {
        self.admit(Link::Inbound)
    }

    pub fn accept_on_simultaneous_initiate(&self) -> bool {
        self.admission.accept_on_simultaneous_initiate()
    }

    pub fn initiate_failed(&mut self) {
        self.admitted = None;
        self.admission.initiate_failed();
    }

    pub fn accept_failed(&mut self) {
        self.admitted = None;
        self.admission.accept_failed();
    }

    fn admit(&mut self, link: Link) -> bool {
        let admitted = match link {
            Link::Outbound => self.admission.should_initiate(),
            Link::Inbound => self.admission.should_accept(),
        };
        self.admitted = admitted.then_some(link);

        admitted
    }

    /// Clear the handler's state for the peer.
    pub fn cleanup(&mut self) {
        self.handler.cleanup();
    }

    /// Run a conversation over the given connection, until both sides have ended it or one
    /// of the loops fails.
    ///
    /// On failure the connection is disconnected. The sync permit is released in any case.
    pub fn run_protocol<C: Connection>(&mut self, connection: &C) -> Result<(), Error> {
        let peer = self.peer;
        let permit = self.admission.take_permit();

        match self.admitted.take() {
            Some(link) => log::debug!(target: "rpc", "Starting {link} conversation with {peer}"),
            None => log::warn!(
                target: "rpc",
                "Starting conversation with {peer} without having been admitted"
            ),
        }
        if permit.is_none() {
            log::warn!(target: "rpc", "Conversation with {peer} runs without a sync permit");
        }
        self.outbox.flags.start();
        self.reporter.report_phase(peer, self.previous_phase);
        self.reporter.emit(Event::ConversationStarted { peer });

        // Tasks left over from an aborted conversation, including its poison pill.
        for task in self.inbound.1.try_iter() {
            log::trace!(target: "rpc", "Discarding stale task {task:?} for {peer}");
        }
        let result = self.converse(connection);

        self.outbox.flags.end();
        match &result {
            Ok(()) => log::debug!(target: "rpc", "Conversation with {peer} ended"),
            Err(e) => log::error!(target: "rpc", "Failure during conversation with {peer}: {e}"),
        }
        drop(permit);

        self.previous_phase = self.reporter.report_phase(peer, SyncPhase::OutsideOfRpc);
        self.reporter.emit(Event::ConversationEnded {
            peer,
            error: result.as_ref().err().map(|e| e.to_string()),
        });

        result
    }

    fn converse<C: Connection>(&mut self, connection: &C) -> Result<(), Error> {
        let (reader, writer) = connection.split()?;
        let peer = self.peer;
        let flags = &*self.outbox.flags;
        let clock = &*self.clock;

        let dispatcher = Dispatcher {
            handler: &mut self.handler,
            inbound: &self.inbound.1,
            pings: &self.pings,
            permits: self.admission.permits(),
            flags,
            clock,
            peer,
            timeout: std_duration(self.config.idle_dispatch_poll_timeout),
        };
        let reader = Reader {
            input: reader,
            inbound: &self.inbound.0,
            stale: &self.inbound.1,
            outbox: &self.outbox,
            pings: &self.pings,
            flags,
            clock,
            peer,
            max_sync_time: self.config.max_sync_time,
        };
        let writer = Writer {
            output: io::BufWriter::new(writer),
            outbound: &self.outbound,
            tracker: &mut self.tracker,
            halt: self.admission.halt(),
            flags,
            clock,
            peer,
            timeout: std_duration(self.config.idle_write_poll_timeout),
        };

        let dispatch: executor::Task<'_, Error> = Box::new(move || dispatcher.run());
        let read: executor::Task<'_, Error> = Box::new(move || reader.run());
        let write: executor::Task<'_, Error> = Box::new(move || writer.run());

        executor::do_parallel_with_handler(
            &peer,
            || connection.disconnect(),
            vec![
                ("rpc-dispatch", dispatch),
                ("rpc-read", read),
                ("rpc-write", write),
            ],
        )
    }
}

impl<H> Sender for PeerProtocol<H> {
    fn send_sync_data(&self, data: SyncData) {
        self.outbox.send_sync_data(data)
    }

    fn send_tips(&self, tips: KnownTips) {
        self.outbox.send_tips(tips)
    }

    fn send_events(&self, events: Vec<GossipEvent>) {
        self.outbox.send_events(events)
    }

    fn send_end_of_events(&self) {
        self.outbox.send_end_of_events()
    }

    fn break_conversation(&self) {
        self.outbox.break_conversation()
    }
}

fn std_duration(duration: LocalDuration) -> time::Duration {
    time::Duration::from_millis(duration.as_millis() as u64)
}

/// Hands inbound tasks to the handler.
struct Dispatcher<'a, H> {
    handler: &'a mut H,
    inbound: &'a chan::Receiver<Task>,
    pings: &'a PingHandler,
    permits: &'a Permits,
    flags: &'a Flags,
    clock: &'a dyn Clock,
    peer: NodeId,
    timeout: time::Duration,
}

impl<H: PeerHandler> Dispatcher<'_, H> {
    fn run(mut self) -> Result<(), Error> {
        loop {
            match self.inbound.recv_timeout(self.timeout) {
                Ok(Task::PoisonPill) => break,
                Ok(task) => self.dispatch(task)?,
                Err(chan::RecvTimeoutError::Timeout) => {}
                Err(chan::RecvTimeoutError::Disconnected) => break,
            }
            if !self
                .handler
                .check_for_periodic_actions(self.permits.is_healthy())
            {
                if self.flags.is_processing() {
                    log::debug!(target: "rpc", "Handler for {} is done, finishing conversation", self.peer);
                }
                self.flags.finish(self.clock.now());
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, task: Task) -> Result<(), Error> {
        let result = match task {
            Task::SyncData(data) => self.handler.receive_sync_data(data),
            Task::Tips(tips) => self.handler.receive_tips(tips),
            Task::Events(events) => self.handler.receive_events(events),
            Task::EventsFinished => self.handler.receive_events_finished(),
            Task::PingReply(reply) => {
                self.pings
                    .handle_incoming_ping_reply(&reply, self.clock.now());
                Ok(())
            }
            Task::PoisonPill => Ok(()),
        };
        result.map_err(|e| Error::Dispatch(Box::new(e)))
    }
}

/// Decodes batches off the connection.
///
/// Reads are unbuffered and never go past the end-of-conversation marker: the bytes that
/// follow it belong to whatever runs next on the connection.
struct Reader<'a, R> {
    input: R,
    inbound: &'a chan::Sender<Task>,
    /// Our own end of the inbound queue, to drop what's left on timeout.
    stale: &'a chan::Receiver<Task>,
    outbox: &'a Outbox,
    pings: &'a PingHandler,
    flags: &'a Flags,
    clock: &'a dyn Clock,
    peer: NodeId,
    max_sync_time: LocalDuration,
}

impl<R: io::Read> Reader<'_, R> {
    fn run(mut self) -> Result<(), Error> {
        let result = self.read_batches();

        self.push(Task::PoisonPill);
        self.flags.stop_processing();

        result
    }

    fn read_batches(&mut self) -> Result<(), Error> {
        loop {
            self.check_deadline()?;

            let size = match Header::decode(&mut self.input) {
                Ok(Header::Messages(size)) => size,
                Ok(Header::EndOfConversation) => {
                    log::debug!(target: "rpc", "Peer {} ended the conversation", self.peer);
                    return Ok(());
                }
                Err(e) if e.is_eof() => {
                    log::warn!(
                        target: "rpc",
                        "Connection with {} closed before the end of the conversation",
                        self.peer
                    );
                    return Err(e.into());
                }
                Err(e) => return Err(e.into()),
            };
            let mut events = Vec::new();

            for _ in 0..size {
                match Message::decode(&mut self.input)? {
                    Message::Event(event) => events.push(event),
                    message => {
                        self.push_events(&mut events);
                        self.handle(message);
                    }
                }
            }
            self.push_events(&mut events);
        }
    }

    fn check_deadline(&self) -> Result<(), Error> {
        let Some(requested) = self.flags.finish_pending() else {
            return Ok(());
        };
        let elapsed = self.clock.now().as_millis().saturating_sub(requested);

        if elapsed as u128 > self.max_sync_time.as_millis() {
            for task in self.stale.try_iter() {
                log::trace!(target: "rpc", "Dropping task {task:?} for {}", self.peer);
            }
            return Err(Error::Timeout {
                elapsed: LocalDuration::from_millis(elapsed as u128),
                max: self.max_sync_time,
            });
        }
        Ok(())
    }

    fn handle(&self, message: Message) {
        match message {
            Message::SyncData(data) => self.push(Task::SyncData(data)),
            Message::KnownTips(tips) => self.push(Task::Tips(tips)),
            Message::Event(event) => self.push(Task::Events(vec![event])),
            Message::EventsFinished => self.push(Task::EventsFinished),
            Message::Ping(ping) => {
                let reply = self.pings.handle_incoming_ping(&ping, self.clock.now());
                self.outbox.enqueue(Frame::PingReply(reply));
            }
            Message::PingReply(reply) => self.push(Task::PingReply(reply)),
        }
    }

    fn push_events(&self, events: &mut Vec<GossipEvent>) {
        if !events.is_empty() {
            self.push(Task::Events(mem::take(events)));
        }
    }

    fn push(&self, task: Task) {
        // The engine owns the receiving end, so this can't fail while we run.
        self.inbound.send(task).ok();
    }
}

/// Writes queued frames onto the connection.
struct Writer<'a, W: io::Write> {
    output: io::BufWriter<W>,
    outbound: &'a chan::Receiver<Frame>,
    tracker: &'a mut PingTracker,
    halt: &'a Halt,
    flags: &'a Flags,
    clock: &'a dyn Clock,
    peer: NodeId,
    timeout: time::Duration,
}

impl<W: io::Write> Writer<'_, W> {
    fn run(mut self) -> Result<(), Error> {
        while self.flags.is_processing() && !self.halt.is_halted() {
            match self.outbound.recv_timeout(self.timeout) {
                Ok(frame) => {
                    frame.encode(&mut self.output)?;
                }
                Err(chan::RecvTimeoutError::Timeout) => {
                    if let Some(ping) = self.tracker.possibly_initiate_ping(self.clock.now()) {
                        Frame::Ping(ping).encode(&mut self.output)?;
                    }
                }
                Err(chan::RecvTimeoutError::Disconnected) => break,
            }
            if self.outbound.is_empty() {
                self.output.flush()?;
            }
        }
        log::debug!(target: "rpc", "Ending our side of the conversation with {}", self.peer);

        END_OF_CONVERSATION.encode(&mut self.output)?;
        self.output.flush()?;

        Ok(())
    }
}
