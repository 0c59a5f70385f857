// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-channel state and receive cache
//! OWNERS: @runtime
//!
//! A [`ChannelObject`] is allocated by `open` and shared through an `Arc`.
//! Its cache is single-producer (the drain routine) / single-consumer (the
//! `recv` caller holding the reader lock) and built from atomics only, so the
//! producer side never allocates and never blocks on another reader.

use core::fmt;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::record::WireRecord;
use crate::{Error, Result, Wait};

/// Lifecycle of one channel slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChannelState {
    /// No local user and no pending peer open.
    Unused = 0,
    /// The peer's `Open` arrived before the local `open` call.
    Waiting = 1,
    /// Handshake complete.
    Opened = 2,
    /// Teardown in progress.
    Free = 3,
}

impl ChannelState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Unused,
            1 => Self::Waiting,
            2 => Self::Opened,
            _ => Self::Free,
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Unused => "unused",
            Self::Waiting => "waiting",
            Self::Opened => "opened",
            Self::Free => "free",
        };
        f.write_str(label)
    }
}

/// Atomic cell holding a [`ChannelState`].
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) const fn new() -> Self {
        Self(AtomicU8::new(ChannelState::Unused as u8))
    }

    pub(crate) fn get(&self) -> ChannelState {
        ChannelState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub(crate) fn set(&self, state: ChannelState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// Moves `from -> to`; returns the observed state on mismatch.
    pub(crate) fn transition(
        &self,
        from: ChannelState,
        to: ChannelState,
    ) -> core::result::Result<(), ChannelState> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(drop)
            .map_err(ChannelState::from_u8)
    }
}

/// Fixed-capacity SPSC ring of cached records.
struct RecordCache {
    slots: Box<[AtomicU64]>,
    write: AtomicU32,
    read: AtomicU32,
}

impl RecordCache {
    fn new(depth: usize) -> Self {
        debug_assert!(depth.is_power_of_two());
        Self {
            slots: (0..depth).map(|_| AtomicU64::new(0)).collect(),
            write: AtomicU32::new(0),
            read: AtomicU32::new(0),
        }
    }

    fn mask(&self) -> u32 {
        self.slots.len() as u32 - 1
    }

    fn len(&self) -> u32 {
        self.write.load(Ordering::Acquire).wrapping_sub(self.read.load(Ordering::Acquire))
    }

    /// Producer side. Returns `false` when full; the record is dropped.
    fn push(&self, record: WireRecord) -> bool {
        let write = self.write.load(Ordering::Relaxed);
        if write.wrapping_sub(self.read.load(Ordering::Acquire)) as usize >= self.slots.len() {
            return false;
        }
        self.slots[(write & self.mask()) as usize].store(record.pack(), Ordering::Relaxed);
        self.write.store(write.wrapping_add(1), Ordering::Release);
        true
    }

    /// Consumer side.
    fn pop(&self) -> Option<WireRecord> {
        let read = self.read.load(Ordering::Relaxed);
        if read == self.write.load(Ordering::Acquire) {
            return None;
        }
        let packed = self.slots[(read & self.mask()) as usize].load(Ordering::Relaxed);
        self.read.store(read.wrapping_add(1), Ordering::Release);
        // Only records that decoded on the way in are ever packed.
        WireRecord::unpack(packed).ok()
    }
}

/// Software side of one open channel.
pub struct ChannelObject {
    cache: RecordCache,
    reader: Mutex<()>,
    signal: Mutex<()>,
    ready: Condvar,
    /// Receivers between their final emptiness check and wake-up.
    waiters: AtomicUsize,
    live: Arc<AtomicUsize>,
}

impl ChannelObject {
    /// Allocates a channel with a cache of `depth` records. `live` counts
    /// objects currently allocated on the owning link.
    pub(crate) fn new(depth: usize, live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self {
            cache: RecordCache::new(depth),
            reader: Mutex::new(()),
            signal: Mutex::new(()),
            ready: Condvar::new(),
            waiters: AtomicUsize::new(0),
            live,
        }
    }

    /// Records waiting to be received.
    pub fn cached(&self) -> usize {
        self.cache.len() as usize
    }

    /// Drain-routine entry: caches the record and wakes a receiver.
    /// Returns `false` when the cache was full and the record was dropped.
    ///
    /// The signal lock is only touched when a receiver is parked; it is then
    /// held by the receiver for a constant-time check at most, so the drain
    /// routine never waits on another thread's unbounded work.
    pub(crate) fn deliver(&self, record: WireRecord) -> bool {
        if !self.cache.push(record) {
            return false;
        }
        // Pairs with the fence in `recv`: either this load sees the waiter
        // or the waiter's recheck sees the record.
        fence(Ordering::SeqCst);
        if self.waiters.load(Ordering::Relaxed) != 0 {
            self.wake_all();
        }
        true
    }

    /// Wakes every waiter so it re-examines the cache and channel state.
    pub(crate) fn wake_all(&self) {
        // Taking the signal lock orders this wake after any waiter's final
        // check, so it cannot slip in before the wait.
        let _signal = self.signal.lock();
        self.ready.notify_all();
    }

    /// Takes the next record. `gone` reports whether the channel is being
    /// torn down.
    pub(crate) fn recv(&self, wait: Wait, gone: impl Fn() -> bool) -> Result<WireRecord> {
        let deadline = wait.deadline();
        let _reader = match (wait, deadline) {
            (Wait::Immediate, _) => self.reader.try_lock().ok_or(Error::Busy)?,
            (_, Some(deadline)) => self.reader.try_lock_until(deadline).ok_or(Error::TimedOut)?,
            (_, None) => self.reader.lock(),
        };
        loop {
            if gone() {
                return Err(Error::ChannelGone);
            }
            if let Some(record) = self.cache.pop() {
                return Ok(record);
            }
            if wait == Wait::Immediate {
                return Err(Error::NoData);
            }
            let mut signal = self.signal.lock();
            self.waiters.fetch_add(1, Ordering::Relaxed);
            fence(Ordering::SeqCst);
            let timed_out = if self.cache.len() != 0 || gone() {
                false
            } else {
                match deadline {
                    None => {
                        self.ready.wait(&mut signal);
                        false
                    }
                    Some(deadline) => {
                        Instant::now() >= deadline
                            || self.ready.wait_until(&mut signal, deadline).timed_out()
                    }
                }
            };
            self.waiters.fetch_sub(1, Ordering::Relaxed);
            drop(signal);
            if timed_out {
                if gone() {
                    return Err(Error::ChannelGone);
                }
                return self.cache.pop().ok_or(Error::TimedOut);
            }
        }
    }
}

impl Drop for ChannelObject {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for ChannelObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelObject")
            .field("cached", &self.cached())
            .field("depth", &self.cache.slots.len())
            .finish()
    }
}
