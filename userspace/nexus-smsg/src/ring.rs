// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Shared-memory circular buffer of wire records
//! OWNERS: @runtime
//!
//! One ring per direction per link. The platform supplies where the slot
//! array and the two index words live; indices are free-running `u32`
//! counters and the slot is `index % capacity`.
//!
//! INVARIANTS:
//!   - `write_index - read_index <= capacity` (wrapping arithmetic)
//!   - the producer publishes a slot before bumping `write_index`
//!   - the consumer copies a slot before bumping `read_index`

use log::error;
use nexus_hal::{Doorbell, SharedMemory};

use crate::record::{WireRecord, RECORD_SIZE};
use crate::{Error, Result};

/// Location of one ring inside a shared region. All offsets are in bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingDescriptor {
    /// Start of the slot array.
    pub slots_offset: usize,
    /// Number of slots; a power of two.
    pub slot_count: u32,
    /// Word holding the producer's free-running index.
    pub write_index_offset: usize,
    /// Word holding the consumer's free-running index.
    pub read_index_offset: usize,
}

impl RingDescriptor {
    /// Checks alignment, capacity and bounds against a region of `region_len` bytes.
    pub fn validate(&self, region_len: usize) -> Result<()> {
        if self.slot_count == 0 || !self.slot_count.is_power_of_two() {
            return Err(Error::InvalidDescriptor("slot count must be a non-zero power of two"));
        }
        if self.slot_count > 1 << 31 {
            return Err(Error::InvalidDescriptor("slot count exceeds index range"));
        }
        if self.slots_offset % 4 != 0
            || self.write_index_offset % 4 != 0
            || self.read_index_offset % 4 != 0
        {
            return Err(Error::InvalidDescriptor("offsets must be word aligned"));
        }
        if self.write_index_offset == self.read_index_offset {
            return Err(Error::InvalidDescriptor("index words overlap"));
        }
        let slots_end = (self.slot_count as usize)
            .checked_mul(RECORD_SIZE)
            .and_then(|bytes| bytes.checked_add(self.slots_offset))
            .ok_or(Error::InvalidDescriptor("slot array overflows"))?;
        let word_end = |offset: usize| {
            offset.checked_add(4).ok_or(Error::InvalidDescriptor("index word overflows"))
        };
        if slots_end > region_len
            || word_end(self.write_index_offset)? > region_len
            || word_end(self.read_index_offset)? > region_len
        {
            return Err(Error::InvalidDescriptor("ring does not fit in the shared region"));
        }
        let inside_slots =
            |offset: usize| offset >= self.slots_offset && offset < slots_end;
        if inside_slots(self.write_index_offset) || inside_slots(self.read_index_offset) {
            return Err(Error::InvalidDescriptor("index words overlap the slot array"));
        }
        Ok(())
    }

    /// Bytes spanned by the slot array.
    pub const fn slots_len(&self) -> usize {
        (self.slot_count as usize).saturating_mul(RECORD_SIZE)
    }
}

/// Both directions of one link, as seen from the local core.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkDescriptor {
    /// Ring the local core produces into.
    pub tx: RingDescriptor,
    /// Ring the local core drains.
    pub rx: RingDescriptor,
}

impl LinkDescriptor {
    /// Lays out both rings in one region starting at offset zero:
    /// the four index words first, then the tx slots, then the rx slots.
    pub const fn contiguous(slot_count: u32) -> Self {
        let slots_len = slot_count as usize * RECORD_SIZE;
        Self {
            tx: RingDescriptor {
                slots_offset: 16,
                slot_count,
                write_index_offset: 0,
                read_index_offset: 4,
            },
            rx: RingDescriptor {
                slots_offset: 16 + slots_len,
                slot_count,
                write_index_offset: 8,
                read_index_offset: 12,
            },
        }
    }

    /// The same link as seen from the peer core.
    pub const fn mirrored(&self) -> Self {
        Self { tx: self.rx, rx: self.tx }
    }

    /// Smallest region that holds both rings. Saturates for descriptors
    /// that do not fit the address space; `validate` rejects those.
    pub fn region_len(&self) -> usize {
        [self.tx, self.rx]
            .iter()
            .flat_map(|ring| {
                [
                    ring.slots_offset.saturating_add(ring.slots_len()),
                    ring.write_index_offset.saturating_add(4),
                    ring.read_index_offset.saturating_add(4),
                ]
            })
            .max()
            .unwrap_or(0)
    }

    pub fn validate(&self, region_len: usize) -> Result<()> {
        self.tx.validate(region_len)?;
        self.rx.validate(region_len)?;
        let (tx_start, tx_end) = (self.tx.slots_offset, self.tx.slots_offset + self.tx.slots_len());
        let (rx_start, rx_end) = (self.rx.slots_offset, self.rx.slots_offset + self.rx.slots_len());
        if tx_start < rx_end && rx_start < tx_end {
            return Err(Error::InvalidDescriptor("tx and rx slot arrays overlap"));
        }
        let words = [
            self.tx.write_index_offset,
            self.tx.read_index_offset,
            self.rx.write_index_offset,
            self.rx.read_index_offset,
        ];
        for (i, word) in words.iter().enumerate() {
            if words[i + 1..].contains(word) {
                return Err(Error::InvalidDescriptor("index words overlap"));
            }
        }
        Ok(())
    }
}

/// One direction of a link over shared memory.
pub struct RingTransport<M> {
    memory: M,
    desc: RingDescriptor,
}

impl<M: SharedMemory> RingTransport<M> {
    /// Wraps an already validated descriptor. See [`RingDescriptor::validate`].
    pub fn new(memory: M, desc: RingDescriptor) -> Self {
        Self { memory, desc }
    }

    pub const fn capacity(&self) -> u32 {
        self.desc.slot_count
    }

    /// Records published but not yet consumed.
    pub fn len(&self) -> u32 {
        self.write_index().wrapping_sub(self.read_index())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Producer side. Fails with [`Error::Busy`] when the ring is full;
    /// otherwise publishes the record and rings the peer.
    pub fn try_enqueue(&mut self, record: WireRecord, doorbell: &dyn Doorbell) -> Result<()> {
        let write = self.write_index();
        if write.wrapping_sub(self.read_index()) >= self.capacity() {
            return Err(Error::Busy);
        }
        let slot = self.slot_offset(write);
        let [head, value] = record.encode();
        self.memory.write_u32(slot, head);
        self.memory.write_u32(slot + 4, value);
        self.memory.write_u32(self.desc.write_index_offset, write.wrapping_add(1));
        doorbell.ring();
        Ok(())
    }

    /// Consumer side. Yields every published record, advancing
    /// `read_index` past each slot once it has been copied out.
    pub fn drain(&mut self) -> Drain<'_, M> {
        Drain { ring: self }
    }

    fn write_index(&self) -> u32 {
        self.memory.read_u32(self.desc.write_index_offset)
    }

    fn read_index(&self) -> u32 {
        self.memory.read_u32(self.desc.read_index_offset)
    }

    fn slot_offset(&self, index: u32) -> usize {
        self.desc.slots_offset + (index & (self.capacity() - 1)) as usize * RECORD_SIZE
    }
}

/// Iterator returned by [`RingTransport::drain`]. Malformed slots are
/// yielded as errors; they are consumed all the same.
pub struct Drain<'a, M> {
    ring: &'a mut RingTransport<M>,
}

impl<M: SharedMemory> Iterator for Drain<'_, M> {
    type Item = Result<WireRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let ring = &mut *self.ring;
        let write = ring.write_index();
        let read = ring.read_index();
        if write == read {
            return None;
        }
        if write.wrapping_sub(read) > ring.capacity() {
            error!(
                "smsg: ring indices corrupt (write={write:#x} read={read:#x} cap={}), resyncing",
                ring.capacity()
            );
            ring.memory.write_u32(ring.desc.read_index_offset, write);
            return None;
        }
        let slot = ring.slot_offset(read);
        let words = [ring.memory.read_u32(slot), ring.memory.read_u32(slot + 4)];
        ring.memory.write_u32(ring.desc.read_index_offset, read.wrapping_add(1));
        Some(WireRecord::decode(words))
    }
}
