use std::io;

use crate::message::{GossipEvent, KnownTips, Ping, SyncData};
use crate::wire;
use crate::wire::varint::record;
use crate::wire::{Decode, Encode, Size, END_OF_CONVERSATION, EVENT_BATCH_SIZE};

/// Message type.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    SyncData = 1,
    KnownTips = 2,
    Event = 3,
    EventsFinished = 4,
    Ping = 5,
    PingReply = 6,
}

impl From<MessageType> for u8 {
    fn from(other: MessageType) -> Self {
        other as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(other: u8) -> Result<Self, Self::Error> {
        match other {
            1 => Ok(MessageType::SyncData),
            2 => Ok(MessageType::KnownTips),
            3 => Ok(MessageType::Event),
            4 => Ok(MessageType::EventsFinished),
            5 => Ok(MessageType::Ping),
            6 => Ok(MessageType::PingReply),
            _ => Err(other),
        }
    }
}

impl Encode for MessageType {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        u8::from(*self).encode(writer)
    }
}

impl Decode for MessageType {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        let type_id = u8::decode(reader)?;

        MessageType::try_from(type_id).map_err(wire::Error::UnknownMessageType)
    }
}

/// A single tagged message, as found inside a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    SyncData(SyncData),
    KnownTips(KnownTips),
    Event(GossipEvent),
    EventsFinished,
    Ping(Ping),
    PingReply(Ping),
}

impl Message {
    pub fn type_id(&self) -> MessageType {
        match self {
            Self::SyncData(_) => MessageType::SyncData,
            Self::KnownTips(_) => MessageType::KnownTips,
            Self::Event(_) => MessageType::Event,
            Self::EventsFinished => MessageType::EventsFinished,
            Self::Ping(_) => MessageType::Ping,
            Self::PingReply(_) => MessageType::PingReply,
        }
    }
}

/// Write a tag followed by its length-prefixed record.
fn encode_tagged<T, W>(type_id: MessageType, record: &T, writer: &mut W) -> io::Result<usize>
where
    T: Encode + ?Sized,
    W: io::Write + ?Sized,
{
    let n = type_id.encode(writer)?;

    Ok(n + record::encode(record, writer)?)
}

impl Encode for Message {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let type_id = self.type_id();

        match self {
            Self::SyncData(data) => encode_tagged(type_id, data, writer),
            Self::KnownTips(tips) => encode_tagged(type_id, tips, writer),
            Self::Event(event) => encode_tagged(type_id, event, writer),
            Self::EventsFinished => type_id.encode(writer),
            Self::Ping(ping) | Self::PingReply(ping) => encode_tagged(type_id, ping, writer),
        }
    }
}

impl Decode for Message {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        match MessageType::decode(reader)? {
            MessageType::SyncData => Ok(Self::SyncData(record::decode(reader)?)),
            MessageType::KnownTips => Ok(Self::KnownTips(record::decode(reader)?)),
            MessageType::Event => Ok(Self::Event(record::decode(reader)?)),
            MessageType::EventsFinished => Ok(Self::EventsFinished),
            MessageType::Ping => Ok(Self::Ping(record::decode(reader)?)),
            MessageType::PingReply => Ok(Self::PingReply(record::decode(reader)?)),
        }
    }
}

/// An outbound unit of work, queued by the protocol and serialized by the writer.
///
/// Every frame is written as one or more complete batches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    SyncData(SyncData),
    KnownTips(KnownTips),
    /// Events, split into batches of at most [`EVENT_BATCH_SIZE`]. Empty lists write nothing.
    Events(Vec<GossipEvent>),
    EventsFinished,
    Ping(Ping),
    PingReply(Ping),
}

impl Frame {
    /// Number of batches this frame is written as.
    pub fn batches(&self) -> usize {
        match self {
            Self::Events(events) => events.len().div_ceil(EVENT_BATCH_SIZE),
            _ => 1,
        }
    }

    /// Write the frame's batches, failing before anything is written if a record can't be
    /// encoded.
    fn encode_batches(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        match self {
            Self::SyncData(data) => encode_single(MessageType::SyncData, data, buf),
            Self::KnownTips(tips) => encode_single(MessageType::KnownTips, tips, buf),
            Self::Events(events) => {
                for chunk in events.chunks(EVENT_BATCH_SIZE) {
                    (chunk.len() as Size).encode(buf)?;

                    for event in chunk {
                        encode_tagged(MessageType::Event, event, buf)?;
                    }
                }
                Ok(())
            }
            Self::EventsFinished => {
                (1 as Size).encode(buf)?;
                MessageType::EventsFinished.encode(buf)?;

                Ok(())
            }
            Self::Ping(ping) => encode_single(MessageType::Ping, ping, buf),
            Self::PingReply(ping) => encode_single(MessageType::PingReply, ping, buf),
        }
    }
}

/// Write a batch holding a single message.
fn encode_single<T: Encode>(type_id: MessageType, record: &T, buf: &mut Vec<u8>) -> io::Result<()> {
    (1 as Size).encode(buf)?;
    encode_tagged(type_id, record, buf)?;

    Ok(())
}

impl Encode for Frame {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut buf = Vec::new();

        self.encode_batches(&mut buf)?;
        writer.write_all(&buf)?;

        Ok(buf.len())
    }
}

/// Header of a batch: how many messages follow, or the end-of-conversation marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Header {
    Messages(usize),
    EndOfConversation,
}

impl Decode for Header {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        let size = Size::decode(reader)?;

        if size == END_OF_CONVERSATION {
            return Ok(Self::EndOfConversation);
        }
        if size < 0 {
            return Err(wire::Error::InvalidBatchSize(size));
        }
        Ok(Self::Messages(size as usize))
    }
}

/// A batch as read off the wire: either messages, or the end-of-conversation marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Batch {
    Messages(Vec<Message>),
    EndOfConversation,
}

impl Encode for Batch {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        match self {
            Self::Messages(messages) => {
                let size = Size::try_from(messages.len())
                    .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
                let mut n = size.encode(writer)?;

                for message in messages {
                    n += message.encode(writer)?;
                }
                Ok(n)
            }
            Self::EndOfConversation => END_OF_CONVERSATION.encode(writer),
        }
    }
}

impl Decode for Batch {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        let size = match Header::decode(reader)? {
            Header::EndOfConversation => return Ok(Self::EndOfConversation),
            Header::Messages(size) => size,
        };
        let mut messages = Vec::with_capacity(size);
        for _ in 0..size {
            messages.push(Message::decode(reader)?);
        }
        Ok(Self::Messages(messages))
    }
}
