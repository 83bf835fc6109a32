pub mod admission;
pub mod clock;
pub mod config;
pub mod events;
pub mod executor;
pub mod gossip;
pub mod logger;
pub mod message;
pub mod permits;
pub mod ping;
pub mod protocol;
pub mod serde_ext;
#[cfg(test)]
mod tests;
pub mod transport;
pub mod wire;

use std::fmt;

pub use localtime::{LocalDuration, LocalTime};

/// Identifies a peer in the roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

impl std::str::FromStr for NodeId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Which side opened the connection a conversation runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Link {
    /// We initiated the conversation.
    Outbound,
    /// The peer initiated the conversation.
    Inbound,
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Outbound => write!(f, "outbound"),
            Self::Inbound => write!(f, "inbound"),
        }
    }
}

pub mod prelude {
    pub use crate::admission::PlatformStatus;
    pub use crate::clock::{Clock, RefClock, SystemClock};
    pub use crate::config::Config;
    pub use crate::events::{Event, SyncPhase};
    pub use crate::gossip::Gossip;
    pub use crate::message::{EventWindow, GossipEvent, KnownTips, Ping, SyncData};
    pub use crate::protocol::{Outbox, PeerHandler, PeerProtocol, Receiver, Sender};
    pub use crate::transport::Connection;
    pub use crate::{Link, LocalDuration, LocalTime, NodeId};
}
