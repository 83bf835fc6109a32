//! Protocol records exchanged during a conversation.
use std::{fmt, io};

use crate::wire;
use crate::wire::{Decode, Encode};

/// Length of an event hash, in bytes.
pub const HASH_LEN: usize = 48;

/// Hash identifying an event.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventHash(pub [u8; HASH_LEN]);

impl fmt::Debug for EventHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventHash({self})")
    }
}

impl fmt::Display for EventHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; HASH_LEN]> for EventHash {
    fn from(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }
}

/// How event ancientness is measured.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AncientMode {
    #[default]
    Generation = 0,
    BirthRound = 1,
}

impl TryFrom<u8> for AncientMode {
    type Error = u8;

    fn try_from(other: u8) -> Result<Self, Self::Error> {
        match other {
            0 => Ok(Self::Generation),
            1 => Ok(Self::BirthRound),
            _ => Err(other),
        }
    }
}

/// The range of events a node still cares about.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventWindow {
    pub latest_consensus_round: u64,
    pub ancient_threshold: u64,
    pub expired_threshold: u64,
    pub ancient_mode: AncientMode,
}

/// Opening message of a sync: our event window and current tips.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncData {
    pub window: EventWindow,
    pub tips: Vec<EventHash>,
}

/// One flag per tip received from the peer: whether we already know it.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KnownTips(pub Vec<bool>);

impl KnownTips {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<bool>> for KnownTips {
    fn from(tips: Vec<bool>) -> Self {
        Self(tips)
    }
}

/// An event, as opaque bytes.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct GossipEvent(pub Vec<u8>);

impl fmt::Debug for GossipEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GossipEvent({} bytes)", self.0.len())
    }
}

impl From<Vec<u8>> for GossipEvent {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for GossipEvent {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Latency probe. Replies carry the responder's time and the request's correlation id.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ping {
    /// Sender's local time, in milliseconds.
    pub timestamp: u64,
    pub correlation_id: u64,
}

impl Encode for EventHash {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.0.encode(writer)
    }
}

impl Decode for EventHash {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        <[u8; HASH_LEN]>::decode(reader).map(Self)
    }
}

impl Encode for EventWindow {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut n = 0;

        n += self.latest_consensus_round.encode(writer)?;
        n += self.ancient_threshold.encode(writer)?;
        n += self.expired_threshold.encode(writer)?;
        n += (self.ancient_mode as u8).encode(writer)?;

        Ok(n)
    }
}

impl Decode for EventWindow {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        let latest_consensus_round = u64::decode(reader)?;
        let ancient_threshold = u64::decode(reader)?;
        let expired_threshold = u64::decode(reader)?;
        let ancient_mode =
            AncientMode::try_from(u8::decode(reader)?).map_err(wire::Error::UnknownAncientMode)?;

        Ok(Self {
            latest_consensus_round,
            ancient_threshold,
            expired_threshold,
            ancient_mode,
        })
    }
}

impl Encode for SyncData {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let count = u16::try_from(self.tips.len()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("too many tips to encode: {}", self.tips.len()),
            )
        })?;
        let mut n = self.window.encode(writer)?;

        n += count.encode(writer)?;
        for tip in &self.tips {
            n += tip.encode(writer)?;
        }
        Ok(n)
    }
}

impl Decode for SyncData {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        let window = EventWindow::decode(reader)?;
        let count = u16::decode(reader)?;
        let mut tips = Vec::with_capacity(count as usize);

        for _ in 0..count {
            tips.push(EventHash::decode(reader)?);
        }
        Ok(Self { window, tips })
    }
}

impl Encode for KnownTips {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let count = u32::try_from(self.0.len())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let mut bits = vec![0u8; self.0.len().div_ceil(8)];

        for (i, known) in self.0.iter().enumerate() {
            if *known {
                bits[i / 8] |= 1 << (i % 8);
            }
        }
        let n = count.encode(writer)?;
        writer.write_all(&bits)?;

        Ok(n + bits.len())
    }
}

impl Decode for KnownTips {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        let count = u32::decode(reader)? as usize;
        let len = count.div_ceil(8);

        if len > wire::MAX_RECORD_SIZE {
            return Err(wire::Error::RecordTooLarge {
                actual: len as u64,
                max: wire::MAX_RECORD_SIZE,
            });
        }
        let mut bits = vec![0u8; len];
        reader.read_exact(&mut bits)?;

        let tips = (0..count).map(|i| bits[i / 8] & (1 << (i % 8)) != 0).collect();

        Ok(Self(tips))
    }
}

impl Encode for GossipEvent {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let len = u32::try_from(self.0.len())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let n = len.encode(writer)?;
        writer.write_all(&self.0)?;

        Ok(n + self.0.len())
    }
}

impl Decode for GossipEvent {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        let len = u32::decode(reader)? as usize;

        if len > wire::MAX_RECORD_SIZE {
            return Err(wire::Error::RecordTooLarge {
                actual: len as u64,
                max: wire::MAX_RECORD_SIZE,
            });
        }
        let mut bytes = vec![0; len];
        reader.read_exact(&mut bytes)?;

        Ok(Self(bytes))
    }
}

impl Encode for Ping {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut n = 0;

        n += self.timestamp.encode(writer)?;
        n += self.correlation_id.encode(writer)?;

        Ok(n)
    }
}

impl Decode for Ping {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        let timestamp = u64::decode(reader)?;
        let correlation_id = u64::decode(reader)?;

        Ok(Self {
            timestamp,
            correlation_id,
        })
    }
}
