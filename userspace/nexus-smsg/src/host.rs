// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: In-process emulation of the shared region and the co-processor
//!
//! OWNERS: @runtime
//!
//! PUBLIC API:
//!   - struct HostRegion: heap-backed SharedMemory of atomic words
//!   - struct SimulatedPeer: the remote core's side of a link
//!   - SimulatedPeer::send(): publish a record into the local rx ring
//!   - SimulatedPeer::deliver(): publish a record and run the drain routine
//!   - SimulatedPeer::recv_all(): consume everything the local core sent
//!   - SimulatedPeer::answer_opens(): complete pending open handshakes
//!
//! SECURITY INVARIANTS:
//!   - No unsafe code; the region is a slice of atomics
//!   - Word loads acquire, word stores release
//!
//! DEPENDENCIES:
//!   - parking_lot::Mutex: serializes peer-side producers and consumers

use core::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use nexus_hal::SharedMemory;
use parking_lot::Mutex;

use crate::link::LinkController;
use crate::record::WireRecord;
use crate::ring::{LinkDescriptor, RingTransport};
use crate::Result;

/// Shared region living on the host heap. Clones view the same words.
#[derive(Clone)]
pub struct HostRegion {
    words: Arc<[AtomicU32]>,
}

impl HostRegion {
    /// Allocates a zeroed region of at least `len` bytes.
    pub fn new(len: usize) -> Self {
        Self { words: (0..(len + 3) / 4).map(|_| AtomicU32::new(0)).collect() }
    }
}

impl SharedMemory for HostRegion {
    fn read_u32(&self, offset: usize) -> u32 {
        self.words[offset / 4].load(Ordering::Acquire)
    }

    fn write_u32(&self, offset: usize, value: u32) {
        self.words[offset / 4].store(value, Ordering::Release)
    }

    fn len(&self) -> usize {
        self.words.len() * 4
    }
}

impl fmt::Debug for HostRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostRegion").field("len", &SharedMemory::len(self)).finish()
    }
}

/// The co-processor side of a link, driving the same region from the
/// opposite end.
pub struct SimulatedPeer<M> {
    outbound: Mutex<RingTransport<M>>,
    inbound: Mutex<RingTransport<M>>,
}

impl<M: SharedMemory + Clone> SimulatedPeer<M> {
    /// `descriptor` is the peer's view, usually `LinkDescriptor::mirrored()`
    /// of the local one.
    pub fn new(memory: M, descriptor: LinkDescriptor) -> Self {
        Self {
            outbound: Mutex::new(RingTransport::new(memory.clone(), descriptor.tx)),
            inbound: Mutex::new(RingTransport::new(memory, descriptor.rx)),
        }
    }
}

impl<M: SharedMemory> SimulatedPeer<M> {
    /// Publishes `record` without raising the local interrupt.
    pub fn send(&self, record: WireRecord) -> Result<()> {
        self.outbound.lock().try_enqueue(record, &|| {})
    }

    /// Publishes `record` and runs the local drain routine, as the
    /// doorbell would.
    pub fn deliver<L: SharedMemory>(&self, link: &LinkController<L>, record: WireRecord) -> Result<()> {
        self.send(record)?;
        link.handle_interrupt();
        Ok(())
    }

    /// Consumes every record the local core has published, skipping
    /// malformed slots.
    pub fn recv_all(&self) -> Vec<WireRecord> {
        self.inbound.lock().drain().filter_map(core::result::Result::ok).collect()
    }

    /// Answers every pending `Open` from the local core with the peer's own
    /// `Open`. Returns the other records consumed along the way.
    pub fn answer_opens<L: SharedMemory>(&self, link: &LinkController<L>) -> Result<Vec<WireRecord>> {
        let mut others = Vec::new();
        for record in self.recv_all() {
            if record.is_open_handshake() {
                self.deliver(link, WireRecord::open(record.channel))?;
            } else {
                others.push(record);
            }
        }
        Ok(others)
    }
}
