// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: 8-byte datagram exchanged between the two cores
//! OWNERS: @runtime
//!
//! Slot layout (two little-endian 32-bit words):
//!
//! ```text
//! word 0: | flag (u16) | kind (u8) | channel (u8) |
//! word 1: |             value (u32)               |
//! ```

use core::fmt;

use crate::{Error, Result};

/// Flag carried by an `Open` record during the handshake.
pub const OPEN_MAGIC: u16 = 0xBEEE;
/// Flag carried by a `Close` record.
pub const CLOSE_MAGIC: u16 = 0xEDDD;

/// Size of one record on the wire.
pub const RECORD_SIZE: usize = 8;

/// Record type byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Kind {
    /// Handshake: the sender opened the channel.
    Open = 1,
    /// Handshake: the sender closed the channel.
    Close = 2,
    /// Payload record.
    Data = 3,
    /// Asynchronous notification.
    Event = 4,
    /// Request that expects a `Done`.
    Command = 5,
    /// Completion of a `Command`.
    Done = 6,
    /// The peer hit a fatal fault.
    Die = 11,
}

impl Kind {
    pub const fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => Self::Open,
            2 => Self::Close,
            3 => Self::Data,
            4 => Self::Event,
            5 => Self::Command,
            6 => Self::Done,
            11 => Self::Die,
            _ => return None,
        })
    }

    /// `true` for the handshake kinds that may travel on a channel that is
    /// not yet open.
    pub const fn is_handshake(self) -> bool {
        matches!(self, Self::Open | Self::Close)
    }
}

/// One datagram. Plain data, copied by value across the boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WireRecord {
    pub channel: u8,
    pub kind: Kind,
    pub flag: u16,
    pub value: u32,
}

impl WireRecord {
    pub const fn new(channel: u8, kind: Kind, flag: u16, value: u32) -> Self {
        Self { channel, kind, flag, value }
    }

    pub const fn data(channel: u8, value: u32) -> Self {
        Self::new(channel, Kind::Data, 0, value)
    }

    pub const fn open(channel: u8) -> Self {
        Self::new(channel, Kind::Open, OPEN_MAGIC, 0)
    }

    pub const fn close(channel: u8) -> Self {
        Self::new(channel, Kind::Close, CLOSE_MAGIC, 0)
    }

    /// `true` if this is the peer's half of the open handshake.
    pub const fn is_open_handshake(&self) -> bool {
        matches!(self.kind, Kind::Open) && self.flag == OPEN_MAGIC
    }

    pub const fn encode(&self) -> [u32; 2] {
        let head = self.channel as u32 | (self.kind as u32) << 8 | (self.flag as u32) << 16;
        [head, self.value]
    }

    pub fn decode(words: [u32; 2]) -> Result<Self> {
        let [head, value] = words;
        let channel = (head & 0xff) as u8;
        let raw_kind = ((head >> 8) & 0xff) as u8;
        let kind = Kind::from_u8(raw_kind).ok_or(Error::Malformed { channel, kind: raw_kind })?;
        Ok(Self { channel, kind, flag: (head >> 16) as u16, value })
    }

    /// Packs the record into one word so a cache slot can be a single atomic.
    pub(crate) const fn pack(&self) -> u64 {
        let [head, value] = self.encode();
        head as u64 | (value as u64) << 32
    }

    pub(crate) fn unpack(packed: u64) -> Result<Self> {
        Self::decode([packed as u32, (packed >> 32) as u32])
    }
}

impl fmt::Display for WireRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ch={} kind={:?} flag={:#06x} value={:#010x}",
            self.channel, self.kind, self.flag, self.value
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_matches_slot_layout() {
        let record = WireRecord::new(5, Kind::Data, 0x1234, 42);
        let [head, value] = record.encode();
        assert_eq!(head.to_le_bytes(), [5, 3, 0x34, 0x12]);
        assert_eq!(value, 42);
    }

    #[test]
    fn decode_rejects_unknown_kind() {
        let err = WireRecord::decode([7 | 0x20 << 8, 0]).unwrap_err();
        assert_eq!(err, Error::Malformed { channel: 7, kind: 0x20 });
        assert!(WireRecord::decode([0, 0]).is_err());
    }

    #[test]
    fn handshake_records_carry_magic() {
        assert!(WireRecord::open(9).is_open_handshake());
        assert!(!WireRecord::new(9, Kind::Open, 0, 0).is_open_handshake());
        assert_eq!(WireRecord::close(9).flag, CLOSE_MAGIC);
        assert!(Kind::Close.is_handshake());
        assert!(!Kind::Die.is_handshake());
    }

    #[test]
    fn packed_form_survives_high_bits() {
        let record = WireRecord::new(0xff, Kind::Die, 0xffff, u32::MAX);
        assert_eq!(WireRecord::unpack(record.pack()).unwrap(), record);
    }
}
