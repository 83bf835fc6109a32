//! Variable-length integers, used to prefix record payloads with their length.
#![warn(clippy::missing_docs_in_private_items)]

// This implementation is largely based on the `quinn` crate.
// Copyright (c) 2018 The quinn developers.
use std::{fmt, io};

use byteorder::ReadBytesExt;
use thiserror::Error;

use crate::wire;
use crate::wire::{Decode, Encode};

/// An integer less than 2^62, encoded on 1, 2, 4 or 8 bytes.
///
/// The two most significant bits of the first byte hold the base-2 logarithm of the
/// encoding length, the value follows in network byte order (RFC 9000, section 16).
///
/// ```text
/// MSB   Length   Usable Bits   Range
/// ----------------------------------------------------
/// 00    1        6             0 - 63
/// 01    2        14            0 - 16383
/// 10    4        30            0 - 1073741823
/// 11    8        62            0 - 4611686018427387903
/// ```
#[derive(Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VarInt(pub(crate) u64);

impl VarInt {
    /// The largest representable value.
    pub const MAX: VarInt = VarInt((1 << 62) - 1);

    /// Succeeds iff `x` < 2^62.
    pub fn new(x: u64) -> Result<Self, BoundsExceeded> {
        if x <= Self::MAX.0 {
            Ok(Self(x))
        } else {
            Err(BoundsExceeded)
        }
    }

    /// The integer value.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for VarInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Error returned when constructing a `VarInt` from a value >= 2^62.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[error("value too large for varint encoding")]
pub struct BoundsExceeded;

impl Decode for VarInt {
    fn decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, wire::Error> {
        let mut buf = [0; 8];
        buf[0] = r.read_u8()?;

        // Integer length.
        let tag = buf[0] >> 6;
        buf[0] &= 0b0011_1111;

        let x = match tag {
            0b00 => u64::from(buf[0]),
            0b01 => {
                r.read_exact(&mut buf[1..2])?;
                u64::from(u16::from_be_bytes([buf[0], buf[1]]))
            }
            0b10 => {
                r.read_exact(&mut buf[1..4])?;
                u64::from(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]))
            }
            _ => {
                r.read_exact(&mut buf[1..8])?;
                u64::from_be_bytes(buf)
            }
        };
        Ok(Self(x))
    }
}

impl Encode for VarInt {
    fn encode<W: io::Write + ?Sized>(&self, w: &mut W) -> io::Result<usize> {
        let x: u64 = self.0;

        if x < 2u64.pow(6) {
            (x as u8).encode(w)
        } else if x < 2u64.pow(14) {
            (0b01 << 14 | x as u16).encode(w)
        } else if x < 2u64.pow(30) {
            (0b10 << 30 | x as u32).encode(w)
        } else if x < 2u64.pow(62) {
            (0b11 << 62 | x).encode(w)
        } else {
            panic!("VarInt::encode: integer overflow");
        }
    }
}

/// Length-prefixed protocol records.
///
/// A record is encoded into a buffer first, then written behind its varint length, so that a
/// reader can reject an oversized record before allocating for it.
pub mod record {
    use super::*;

    /// Encode a record, prefixed with the length of its encoding.
    pub fn encode<T, W>(record: &T, writer: &mut W) -> io::Result<usize>
    where
        T: Encode + ?Sized,
        W: io::Write + ?Sized,
    {
        let mut payload = Vec::new();
        record.encode(&mut payload)?;

        if payload.len() > wire::MAX_RECORD_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "record of {} bytes exceeds the maximum of {} bytes",
                    payload.len(),
                    wire::MAX_RECORD_SIZE
                ),
            ));
        }
        // Records are bounded well below 2^62.
        let n = VarInt(payload.len() as u64).encode(writer)?;
        writer.write_all(&payload)?;

        Ok(n + payload.len())
    }

    /// Decode a length-prefixed record. The record must consume its payload exactly.
    pub fn decode<T, R>(reader: &mut R) -> Result<T, wire::Error>
    where
        T: Decode,
        R: io::Read + ?Sized,
    {
        let size = VarInt::decode(reader)?.get();
        if size > wire::MAX_RECORD_SIZE as u64 {
            return Err(wire::Error::RecordTooLarge {
                actual: size,
                max: wire::MAX_RECORD_SIZE,
            });
        }
        let mut payload = vec![0; size as usize];
        reader.read_exact(&mut payload[..])?;

        wire::deserialize(&payload)
    }
}
