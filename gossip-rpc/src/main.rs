use std::convert::Infallible;
use std::sync::Arc;
use std::{net, path::PathBuf, process};

use anyhow::Context;

use gossip_rpc::logger;
use gossip_rpc::prelude::*;

pub const HELP_MSG: &str = r#"
Usage

   gossip-rpc-node (--listen <address> | --connect <address>) [<option>...]

   Runs a single gossip conversation with a peer over TCP: both sides send their event
   window, a number of random events, and end the conversation once the peer is done.

Options

    --config             <path>         Config file to use (default: built-in defaults)
    --listen             <address>      Wait for the peer on this address
    --connect            <address>      Connect to the peer at this address
    --peer               <id>           Node id of the peer (default: 1)
    --events             <count>        Number of random events to send (default: 16)
    --log                <level>        Set log level (default: info)
    --help                              Print help
"#;

#[derive(Debug)]
enum Mode {
    Listen(net::SocketAddr),
    Connect(net::SocketAddr),
}

#[derive(Debug)]
struct Options {
    config: Option<PathBuf>,
    mode: Mode,
    peer: NodeId,
    events: usize,
    log: Option<log::Level>,
}

impl Options {
    fn from_env() -> Result<Self, anyhow::Error> {
        use lexopt::prelude::*;

        let mut parser = lexopt::Parser::from_env();
        let mut config = None;
        let mut mode = None;
        let mut peer = NodeId(1);
        let mut events = 16;
        let mut log = None;

        while let Some(arg) = parser.next()? {
            match arg {
                Long("config") => {
                    let value = parser.value()?;
                    let path = PathBuf::from(value);
                    config = Some(path);
                }
                Long("listen") => {
                    let addr = parser.value()?.parse()?;
                    mode = Some(Mode::Listen(addr));
                }
                Long("connect") => {
                    let addr = parser.value()?.parse()?;
                    mode = Some(Mode::Connect(addr));
                }
                Long("peer") => {
                    peer = parser.value()?.parse()?;
                }
                Long("events") => {
                    events = parser.value()?.parse()?;
                }
                Long("log") => {
                    log = Some(parser.value()?.parse()?);
                }
                Long("help") | Short('h') => {
                    println!("{HELP_MSG}");
                    process::exit(0);
                }
                _ => anyhow::bail!(arg.unexpected()),
            }
        }
        let Some(mode) = mode else {
            anyhow::bail!("either `--listen` or `--connect` must be specified");
        };

        Ok(Self {
            config,
            mode,
            peer,
            events,
            log,
        })
    }
}

/// Logs what the peer sends, and ends the conversation after the peer's last event.
#[derive(Debug)]
struct Demo {
    outbox: Outbox,
    received: usize,
    done: bool,
}

impl Demo {
    fn new(outbox: Outbox) -> Self {
        Self {
            outbox,
            received: 0,
            done: false,
        }
    }
}

impl Receiver for Demo {
    type Error = Infallible;

    fn receive_sync_data(&mut self, data: SyncData) -> Result<(), Self::Error> {
        log::info!(
            target: "node",
            "Peer is at round {} with {} tip(s)",
            data.window.latest_consensus_round,
            data.tips.len()
        );
        self.outbox
            .send_tips(KnownTips(vec![false; data.tips.len()]));

        Ok(())
    }

    fn receive_tips(&mut self, tips: KnownTips) -> Result<(), Self::Error> {
        log::info!(target: "node", "Peer knows {} of our tip(s)", tips.0.iter().filter(|t| **t).count());
        Ok(())
    }

    fn receive_events(&mut self, events: Vec<GossipEvent>) -> Result<(), Self::Error> {
        self.received += events.len();
        log::debug!(target: "node", "Received {} event(s)", events.len());

        Ok(())
    }

    fn receive_events_finished(&mut self) -> Result<(), Self::Error> {
        log::info!(target: "node", "Peer is done after {} event(s)", self.received);
        self.done = true;

        Ok(())
    }
}

impl PeerHandler for Demo {
    fn check_for_periodic_actions(&mut self, healthy: bool) -> bool {
        healthy && !self.done
    }

    fn cleanup(&mut self) {
        self.received = 0;
        self.done = false;
    }
}

fn random_events(count: usize) -> Vec<GossipEvent> {
    let mut rng = fastrand::Rng::new();

    (0..count)
        .map(|_| {
            let len = rng.usize(1..=256);
            GossipEvent::from(std::iter::repeat_with(|| rng.u8(..)).take(len).collect::<Vec<_>>())
        })
        .collect()
}

fn execute() -> anyhow::Result<()> {
    let options = Options::from_env()?;
    let config = match &options.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    logger::init(
        options
            .log
            .or_else(logger::env_level)
            .unwrap_or(log::Level::Info),
    )?;

    let gossip = Gossip::new(config, 2, Arc::new(SystemClock));
    gossip.update_platform_status(PlatformStatus::Active);

    let mut engine = gossip.create_peer_instance(options.peer, Demo::new);
    let (stream, admitted) = match options.mode {
        Mode::Listen(addr) => {
            let listener = net::TcpListener::bind(addr)
                .with_context(|| format!("couldn't listen on {addr}"))?;
            log::info!(target: "node", "Waiting for {} on {addr}..", options.peer);

            let (stream, remote) = listener.accept()?;
            log::info!(target: "node", "Accepted connection from {remote}");

            (stream, engine.should_accept())
        }
        Mode::Connect(addr) => {
            let admitted = engine.should_initiate();
            let stream = net::TcpStream::connect(addr)
                .with_context(|| format!("couldn't connect to {addr}"));

            match stream {
                Ok(stream) => (stream, admitted),
                Err(e) => {
                    engine.initiate_failed();
                    return Err(e);
                }
            }
        }
    };
    if !admitted {
        anyhow::bail!("conversation with {} was not admitted", options.peer);
    }

    engine.send_sync_data(SyncData {
        window: EventWindow {
            latest_consensus_round: fastrand::u64(1..1024),
            ..EventWindow::default()
        },
        tips: vec![],
    });
    engine.send_events(random_events(options.events));
    engine.send_end_of_events();
    engine.run_protocol(&stream)?;
    engine.cleanup();

    log::info!(target: "node", "Conversation with {} complete", options.peer);

    Ok(())
}

fn main() {
    if let Err(err) = execute() {
        if log::log_enabled!(target: "node", log::Level::Error) {
            log::error!(target: "node", "Fatal: {err:#}");
        } else {
            eprintln!("Error: {err:#}");
        }
        process::exit(1);
    }
}
