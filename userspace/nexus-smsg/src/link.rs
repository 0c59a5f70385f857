// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-destination link controller: channel lifecycle and drain routine
//! OWNERS: @runtime
//! STATUS: Functional
//!
//! PUBLIC API:
//!   - LinkController::open(): handshake a channel open
//!   - LinkController::close(): tear a channel down without sleeping
//!   - LinkController::send(): enqueue a record on the tx ring
//!   - LinkController::recv(): take a record from a channel cache
//!   - LinkController::handle_interrupt(): drain the rx ring into channel caches
//!
//! SYNCHRONIZATION:
//!   - tx ring: `SpinLock`, one sender at a time across all channels
//!   - rx ring: `SpinLock`, drain runs are serialized
//!   - slot object pointer: `SpinLock`, O(1) critical sections only
//!   - busy counter: every accessor of a channel object is inside a
//!     `BusyGuard`, and `close` spins until it observes zero; callers that
//!     arrive after `Free` is published never enter, so the wait is bounded
//!   - a receiver treats its object as gone once the slot is `Free` or no
//!     longer holds that object
//!
//! INVARIANTS:
//!   - at most one channel object is installed per slot
//!   - `Free` is only set while the closing object is installed
//!   - removing the object and resetting to `Unused` happen under the same lock
//!   - a closed object is released only once no transient reference remains

use core::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, error, info, warn};
use nexus_hal::{Doorbell, SharedMemory};
use nexus_sync::{BusyCounter, SpinLock};

use crate::channel::{ChannelObject, ChannelState, StateCell};
use crate::config::{DiePolicy, SmsgConfig};
use crate::record::{Kind, WireRecord};
use crate::ring::{LinkDescriptor, RingTransport};
use crate::table::ChannelTable;
use crate::{Error, Result, Wait};

struct ChannelSlot {
    id: u8,
    state: StateCell,
    busy: BusyCounter,
    object: SpinLock<Option<Arc<ChannelObject>>>,
}

impl ChannelSlot {
    fn new(id: u8) -> Self {
        Self {
            id,
            state: StateCell::new(),
            busy: BusyCounter::new(),
            object: SpinLock::new(None),
        }
    }

    fn installed(&self) -> Option<Arc<ChannelObject>> {
        self.object.lock().clone()
    }

    fn is_closing(&self) -> bool {
        self.state.get() == ChannelState::Free
    }

    /// `true` once `object` may no longer be used: teardown has begun, or
    /// the object is not the one installed anymore.
    fn detached(&self, object: &ChannelObject) -> bool {
        self.is_closing() || !holds(&self.object.lock(), object)
    }

    /// Receives from `object`, which the caller resolved from this slot.
    /// The reference is released before returning.
    fn receive(&self, object: Arc<ChannelObject>, wait: Wait) -> Result<WireRecord> {
        object.recv(wait, || self.detached(&object))
    }
}

/// Identity check against the installed object. Callers keep the
/// allocation alive (strong or weak) so the address cannot be reused.
fn holds(installed: &Option<Arc<ChannelObject>>, object: *const ChannelObject) -> bool {
    installed.as_ref().is_some_and(|current| holds_ptr(current, object))
}

fn holds_ptr(current: &Arc<ChannelObject>, object: *const ChannelObject) -> bool {
    core::ptr::eq(Arc::as_ptr(current), object)
}

#[derive(Default)]
struct Counters {
    tx_records: AtomicU64,
    tx_busy: AtomicU64,
    rx_records: AtomicU64,
    delivered: AtomicU64,
    dropped_cache_full: AtomicU64,
    dropped_not_open: AtomicU64,
    unconfigured: AtomicU64,
    malformed: AtomicU64,
    die: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Point-in-time copy of a link's traffic counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub tx_records: u64,
    /// Sends rejected because the tx ring was full.
    pub tx_busy: u64,
    pub rx_records: u64,
    /// Records stored into a channel cache.
    pub delivered: u64,
    pub dropped_cache_full: u64,
    /// Records for channels without a live object (or being torn down).
    pub dropped_not_open: u64,
    pub unconfigured: u64,
    pub malformed: u64,
    pub die: u64,
}

/// Debug view of one channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub id: u8,
    pub name: String,
    pub state: ChannelState,
    pub busy: i32,
    /// Cached records, if a channel object is installed.
    pub cached: Option<usize>,
}

/// Debug view of a whole link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkSnapshot {
    pub dst: u8,
    pub tx_pending: u32,
    pub tx_capacity: u32,
    pub rx_pending: u32,
    pub rx_capacity: u32,
    pub live_objects: usize,
    pub stats: LinkStats,
    pub channels: Vec<ChannelSnapshot>,
}

impl fmt::Display for LinkSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "smsg dst {}:", self.dst)?;
        writeln!(
            f,
            "  tx {}/{} rx {}/{} objects {}",
            self.tx_pending, self.tx_capacity, self.rx_pending, self.rx_capacity, self.live_objects
        )?;
        let s = &self.stats;
        writeln!(
            f,
            "  sent {} (busy {}) received {} delivered {} dropped full={} closed={} \
             unconfigured={} malformed={} die={}",
            s.tx_records,
            s.tx_busy,
            s.rx_records,
            s.delivered,
            s.dropped_cache_full,
            s.dropped_not_open,
            s.unconfigured,
            s.malformed,
            s.die
        )?;
        for channel in self.channels.iter().filter(|c| c.state != ChannelState::Unused) {
            write!(f, "  ch {:3} {:<16} {:<8} busy={}", channel.id, channel.name, channel.state, channel.busy)?;
            match channel.cached {
                Some(cached) => writeln!(f, " cached={cached}")?,
                None => writeln!(f)?,
            }
        }
        Ok(())
    }
}

/// All channels towards one destination processor.
pub struct LinkController<M> {
    dst: u8,
    table: Arc<ChannelTable>,
    slots: Box<[ChannelSlot]>,
    tx: SpinLock<RingTransport<M>>,
    rx: SpinLock<RingTransport<M>>,
    doorbell: Box<dyn Doorbell + Send + Sync>,
    cache_depth: usize,
    die_policy: DiePolicy,
    live: Arc<AtomicUsize>,
    counters: Counters,
}

impl<M: SharedMemory + Clone> LinkController<M> {
    /// Builds a link over `memory`, validating `descriptor` against it.
    pub fn new(
        dst: u8,
        memory: M,
        descriptor: LinkDescriptor,
        doorbell: impl Doorbell + Send + Sync + 'static,
        table: Arc<ChannelTable>,
        config: &SmsgConfig,
    ) -> Result<Self> {
        descriptor.validate(memory.len())?;
        if config.cache_depth == 0 || !config.cache_depth.is_power_of_two() {
            return Err(Error::InvalidDescriptor("cache depth must be a non-zero power of two"));
        }
        let slots = table.iter().map(|entry| ChannelSlot::new(entry.id)).collect();
        info!(
            "smsg: dst {dst} link up: {} channels, tx {} slots, rx {} slots",
            table.len(),
            descriptor.tx.slot_count,
            descriptor.rx.slot_count
        );
        Ok(Self {
            dst,
            table,
            slots,
            tx: SpinLock::new(RingTransport::new(memory.clone(), descriptor.tx)),
            rx: SpinLock::new(RingTransport::new(memory, descriptor.rx)),
            doorbell: Box::new(doorbell),
            cache_depth: config.cache_depth,
            die_policy: config.die_policy,
            live: Arc::new(AtomicUsize::new(0)),
            counters: Counters::default(),
        })
    }
}

impl<M: SharedMemory> LinkController<M> {
    /// Destination processor id.
    pub fn dst(&self) -> u8 {
        self.dst
    }

    pub fn channel_table(&self) -> &ChannelTable {
        &self.table
    }

    fn slot(&self, channel: u8) -> Result<&ChannelSlot> {
        self.table.lookup(channel).map(|index| &self.slots[index]).ok_or(Error::InvalidChannel)
    }

    /// Opens `channel`, completing the handshake with the peer.
    ///
    /// If the peer's `Open` already arrived the call does not wait;
    /// otherwise it waits for it according to `wait`. On failure the slot is
    /// left as it was before the call.
    pub fn open(&self, channel: u8, wait: Wait) -> Result<()> {
        let slot = self.slot(channel)?;
        if slot.is_closing() {
            return Err(Error::Busy);
        }
        let _busy = slot.busy.enter();
        let object = Arc::new(ChannelObject::new(self.cache_depth, self.live.clone()));
        {
            let mut installed = slot.object.lock();
            if installed.is_some() {
                return Err(match slot.state.get() {
                    ChannelState::Opened => Error::AlreadyOpen,
                    _ => Error::Busy,
                });
            }
            *installed = Some(object.clone());
        }

        if let Err(err) = self.handshake(slot, &object, wait) {
            debug!("smsg: dst {} ch {channel}: open failed: {err}", self.dst);
            self.rollback(slot, &object);
            return Err(err);
        }

        loop {
            match slot.state.get() {
                ChannelState::Free => {
                    self.rollback(slot, &object);
                    return Err(Error::ChannelGone);
                }
                current => {
                    if slot.state.transition(current, ChannelState::Opened).is_ok() {
                        break;
                    }
                }
            }
        }
        debug!("smsg: dst {} ch {channel}: opened", self.dst);
        Ok(())
    }

    fn handshake(&self, slot: &ChannelSlot, object: &ChannelObject, wait: Wait) -> Result<()> {
        self.transmit(WireRecord::open(slot.id))?;
        if slot.state.get() == ChannelState::Waiting {
            return Ok(());
        }
        let deadline = wait.deadline();
        loop {
            let record = object.recv(wait.remaining(deadline), || slot.detached(object))?;
            if record.is_open_handshake() {
                return Ok(());
            }
            debug!(
                "smsg: dst {} ch {}: discarding {record} while waiting for open",
                self.dst, slot.id
            );
        }
    }

    /// Undoes a failed open. A concurrent close that already flagged the
    /// slot `Free` owns the teardown and is left to finish it.
    fn rollback(&self, slot: &ChannelSlot, object: &Arc<ChannelObject>) {
        let mut installed = slot.object.lock();
        if !holds(&installed, Arc::as_ptr(object)) || slot.is_closing() {
            return;
        }
        *installed = None;
        slot.state.set(ChannelState::Unused);
    }

    /// Closes `channel`. Never sleeps and never fails for a configured
    /// channel: a lost `Close` notification is only logged.
    pub fn close(&self, channel: u8) -> Result<()> {
        let slot = self.slot(channel)?;
        let Some(closing) = slot.object.lock().as_ref().map(Arc::downgrade) else {
            let _ = slot.state.transition(ChannelState::Waiting, ChannelState::Unused);
            return Ok(());
        };
        self.teardown(slot, &closing);
        Ok(())
    }

    /// Tears down `closing` if it is still the installed object. Only a weak
    /// reference is held across the waits, so the allocation stays pinned
    /// without counting as a user.
    fn teardown(&self, slot: &ChannelSlot, closing: &Weak<ChannelObject>) {
        let (object, notified) = {
            let installed = slot.object.lock();
            let Some(object) = installed.as_ref().filter(|o| holds_ptr(o, closing.as_ptr())) else {
                return;
            };
            // The notification goes out under the slot lock so it cannot
            // belong to a session opened after this one.
            let notified = if slot.is_closing() {
                Ok(())
            } else {
                let sent = self.transmit(WireRecord::close(slot.id));
                slot.state.set(ChannelState::Free);
                sent
            };
            (object.clone(), notified)
        };
        if let Err(err) = notified {
            error!("smsg: dst {} ch {}: close notification not sent: {err}", self.dst, slot.id);
        }
        object.wake_all();
        drop(object);
        slot.busy.wait_idle();

        let taken = {
            let mut installed = slot.object.lock();
            if !holds(&installed, closing.as_ptr()) {
                // A concurrent close finished the teardown.
                return;
            }
            slot.state.set(ChannelState::Unused);
            installed.take()
        };
        if let Some(object) = taken {
            // Accessors that entered between the busy check and the removal
            // may still hold a clone. They observe the removal once woken.
            object.wake_all();
            while Arc::strong_count(&object) > 1 {
                core::hint::spin_loop();
            }
            drop(object);
        }
        debug!("smsg: dst {} ch {}: closed", self.dst, slot.id);
    }

    /// Sends one record. Data kinds require an open channel; `Open` and
    /// `Close` may be sent in any state. A full ring is reported as
    /// [`Error::Busy`] and not retried.
    pub fn send(&self, record: WireRecord) -> Result<()> {
        let slot = self.slot(record.channel)?;
        if !record.kind.is_handshake() && slot.state.get() != ChannelState::Opened {
            return Err(Error::ChannelNotOpened);
        }
        self.transmit(record)
    }

    fn transmit(&self, record: WireRecord) -> Result<()> {
        let result = self.tx.lock().try_enqueue(record, &*self.doorbell);
        match result {
            Ok(()) => bump(&self.counters.tx_records),
            Err(_) => bump(&self.counters.tx_busy),
        }
        result
    }

    /// Receives the next record cached for `channel`.
    pub fn recv(&self, channel: u8, wait: Wait) -> Result<WireRecord> {
        let slot = self.slot(channel)?;
        if slot.is_closing() {
            return Err(Error::ChannelGone);
        }
        let _busy = slot.busy.enter();
        let object = slot.installed().ok_or(Error::ChannelGone)?;
        slot.receive(object, wait)
    }

    /// Drain routine, run once per doorbell from the peer. Routes every
    /// published record into its channel cache and returns how many slots
    /// were consumed. Never sleeps and never allocates.
    pub fn handle_interrupt(&self) -> usize {
        let mut rx = self.rx.lock();
        let mut drained = 0;
        for item in rx.drain() {
            drained += 1;
            match item {
                Ok(record) => self.dispatch(record),
                Err(err) => {
                    bump(&self.counters.malformed);
                    warn!("smsg: dst {}: dropping slot: {err}", self.dst);
                }
            }
        }
        drained
    }

    fn dispatch(&self, record: WireRecord) {
        bump(&self.counters.rx_records);
        if record.kind == Kind::Die {
            bump(&self.counters.die);
            match self.die_policy {
                DiePolicy::Fatal => {
                    panic!("smsg: dst {} reported a fatal fault ({record})", self.dst)
                }
                DiePolicy::Discard => {
                    error!("smsg: dst {} reported a fatal fault ({record}), ignoring", self.dst);
                    return;
                }
            }
        }

        let Ok(slot) = self.slot(record.channel) else {
            bump(&self.counters.unconfigured);
            warn!("smsg: dst {}: dropping record for unconfigured channel: {record}", self.dst);
            return;
        };

        if slot.is_closing() {
            bump(&self.counters.dropped_not_open);
            debug!("smsg: dst {}: channel closing, dropping {record}", self.dst);
            return;
        }
        // The guard is declared first so the clone below is released while
        // still inside the busy window.
        let _busy = slot.busy.enter();
        let object = {
            let installed = slot.object.lock();
            match installed.as_ref() {
                Some(object) => object.clone(),
                None => {
                    if record.is_open_handshake()
                        && slot.state.transition(ChannelState::Unused, ChannelState::Waiting).is_ok()
                    {
                        debug!("smsg: dst {} ch {}: peer opened first", self.dst, slot.id);
                    } else {
                        bump(&self.counters.dropped_not_open);
                        warn!("smsg: dst {}: channel not opened, dropping {record}", self.dst);
                    }
                    return;
                }
            }
        };
        if slot.is_closing() {
            bump(&self.counters.dropped_not_open);
            debug!("smsg: dst {}: channel closing, dropping {record}", self.dst);
            return;
        }
        if object.deliver(record) {
            bump(&self.counters.delivered);
        } else {
            bump(&self.counters.dropped_cache_full);
            warn!("smsg: dst {} ch {}: cache full, dropping {record}", self.dst, slot.id);
        }
    }

    /// Closes every channel that still has an object installed.
    pub fn shutdown(&self) {
        for slot in self.slots.iter() {
            if slot.installed().is_some() {
                if let Err(err) = self.close(slot.id) {
                    warn!("smsg: dst {} ch {}: close during shutdown failed: {err}", self.dst, slot.id);
                }
            }
        }
        info!("smsg: dst {} link down", self.dst);
    }

    pub fn channel_state(&self, channel: u8) -> Result<ChannelState> {
        Ok(self.slot(channel)?.state.get())
    }

    /// Accessors currently inside `channel`.
    pub fn busy(&self, channel: u8) -> Result<i32> {
        Ok(self.slot(channel)?.busy.get())
    }

    /// Channel objects currently allocated on this link, including ones
    /// that are closed but not yet released.
    pub fn live_objects(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> LinkStats {
        let c = &self.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        LinkStats {
            tx_records: load(&c.tx_records),
            tx_busy: load(&c.tx_busy),
            rx_records: load(&c.rx_records),
            delivered: load(&c.delivered),
            dropped_cache_full: load(&c.dropped_cache_full),
            dropped_not_open: load(&c.dropped_not_open),
            unconfigured: load(&c.unconfigured),
            malformed: load(&c.malformed),
            die: load(&c.die),
        }
    }

    pub fn snapshot(&self) -> LinkSnapshot {
        let (tx_pending, tx_capacity) = {
            let tx = self.tx.lock();
            (tx.len(), tx.capacity())
        };
        let (rx_pending, rx_capacity) = {
            let rx = self.rx.lock();
            (rx.len(), rx.capacity())
        };
        let channels = self
            .table
            .iter()
            .zip(self.slots.iter())
            .map(|(entry, slot)| ChannelSnapshot {
                id: slot.id,
                name: entry.name.clone(),
                state: slot.state.get(),
                busy: slot.busy.get(),
                cached: slot.installed().map(|object| object.cached()),
            })
            .collect();
        LinkSnapshot {
            dst: self.dst,
            tx_pending,
            tx_capacity,
            rx_pending,
            rx_capacity,
            live_objects: self.live_objects(),
            stats: self.stats(),
            channels,
        }
    }
}

impl<M> fmt::Debug for LinkController<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkController")
            .field("dst", &self.dst)
            .field("channels", &self.slots.len())
            .field("cache_depth", &self.cache_depth)
            .finish()
    }
}

#[cfg(all(test, feature = "host"))]
mod tests {
    use super::*;
    use crate::host::{HostRegion, SimulatedPeer};
    use crate::table::ChannelConfig;
    use std::thread;
    use std::time::Duration;

    fn link(slots: u32) -> (LinkController<HostRegion>, SimulatedPeer<HostRegion>) {
        let descriptor = LinkDescriptor::contiguous(slots);
        let region = HostRegion::new(descriptor.region_len());
        let table = Arc::new(
            ChannelTable::new(&[ChannelConfig::new(5, "tty"), ChannelConfig::new(9, "vbc")])
                .unwrap(),
        );
        let config = SmsgConfig { cache_depth: 4, die_policy: DiePolicy::Discard, ..SmsgConfig::default() };
        let link = LinkController::new(1, region.clone(), descriptor, || {}, table, &config).unwrap();
        (link, SimulatedPeer::new(region, descriptor.mirrored()))
    }

    #[test]
    fn open_skips_wait_when_peer_opened_first() {
        let (link, peer) = link(8);
        peer.deliver(&link, WireRecord::open(5)).unwrap();
        assert_eq!(link.channel_state(5), Ok(ChannelState::Waiting));
        link.open(5, Wait::Immediate).unwrap();
        assert_eq!(link.channel_state(5), Ok(ChannelState::Opened));
        assert_eq!(peer.recv_all(), vec![WireRecord::open(5)]);
    }

    #[test]
    fn failed_open_rolls_back() {
        let (link, _peer) = link(8);
        assert_eq!(link.open(5, Wait::Immediate), Err(Error::NoData));
        assert_eq!(link.channel_state(5), Ok(ChannelState::Unused));
        assert_eq!(link.busy(5), Ok(0));
        assert_eq!(link.live_objects(), 0);
    }

    #[test]
    fn open_propagates_full_ring() {
        let (link, peer) = link(1);
        link.send(WireRecord::close(9)).unwrap();
        assert_eq!(link.open(5, Wait::Immediate), Err(Error::Busy));
        assert_eq!(link.live_objects(), 0);
        peer.recv_all();
        peer.deliver(&link, WireRecord::open(5)).unwrap();
        link.open(5, Wait::Immediate).unwrap();
    }

    #[test]
    fn second_open_is_rejected() {
        let (link, peer) = link(8);
        peer.deliver(&link, WireRecord::open(5)).unwrap();
        link.open(5, Wait::Immediate).unwrap();
        assert_eq!(link.open(5, Wait::Immediate), Err(Error::AlreadyOpen));
        assert_eq!(link.live_objects(), 1);
    }

    #[test]
    fn close_without_object_clears_waiting() {
        let (link, peer) = link(8);
        peer.deliver(&link, WireRecord::open(9)).unwrap();
        link.close(9).unwrap();
        assert_eq!(link.channel_state(9), Ok(ChannelState::Unused));
        assert!(peer.recv_all().is_empty());
    }

    #[test]
    fn close_survives_full_ring() {
        let (link, peer) = link(1);
        peer.deliver(&link, WireRecord::open(5)).unwrap();
        link.open(5, Wait::Immediate).unwrap();
        link.close(5).unwrap();
        assert_eq!(link.channel_state(5), Ok(ChannelState::Unused));
        assert_eq!(link.live_objects(), 0);
        assert_eq!(link.stats().tx_busy, 1);
    }

    #[test]
    fn drain_routes_and_counts() {
        let (link, peer) = link(8);
        peer.deliver(&link, WireRecord::open(5)).unwrap();
        link.open(5, Wait::Immediate).unwrap();
        for value in 0..6 {
            peer.send(WireRecord::data(5, value)).unwrap();
        }
        peer.send(WireRecord::data(9, 1)).unwrap();
        peer.send(WireRecord::data(77, 1)).unwrap();
        assert_eq!(link.handle_interrupt(), 8);

        let stats = link.stats();
        assert_eq!(stats.delivered, 4);
        assert_eq!(stats.dropped_cache_full, 2);
        assert_eq!(stats.dropped_not_open, 1);
        assert_eq!(stats.unconfigured, 1);
        let values: Vec<u32> = (0..4).map(|_| link.recv(5, Wait::Immediate).unwrap().value).collect();
        assert_eq!(values, vec![0, 1, 2, 3]);
    }

    #[test]
    fn data_send_requires_open_channel() {
        let (link, peer) = link(8);
        assert_eq!(link.send(WireRecord::data(5, 1)), Err(Error::ChannelNotOpened));
        assert_eq!(link.send(WireRecord::data(6, 1)), Err(Error::InvalidChannel));
        peer.deliver(&link, WireRecord::open(5)).unwrap();
        link.open(5, Wait::Immediate).unwrap();
        link.send(WireRecord::data(5, 1)).unwrap();
        assert_eq!(peer.recv_all(), vec![WireRecord::open(5), WireRecord::data(5, 1)]);
    }

    #[test]
    fn snapshot_renders_open_channels() {
        let (link, peer) = link(8);
        peer.deliver(&link, WireRecord::open(5)).unwrap();
        link.open(5, Wait::Immediate).unwrap();
        peer.deliver(&link, WireRecord::data(5, 3)).unwrap();

        let snapshot = link.snapshot();
        assert_eq!(snapshot.tx_pending, 1);
        assert_eq!(snapshot.live_objects, 1);
        let tty = &snapshot.channels[0];
        assert_eq!((tty.state, tty.cached), (ChannelState::Opened, Some(1)));
        let dump = snapshot.to_string();
        assert!(dump.contains("ch   5 tty"));
        assert!(!dump.contains("vbc"));
    }

    #[test]
    fn shutdown_closes_everything() {
        let (link, peer) = link(8);
        peer.deliver(&link, WireRecord::open(5)).unwrap();
        peer.deliver(&link, WireRecord::open(9)).unwrap();
        link.open(5, Wait::Immediate).unwrap();
        link.open(9, Wait::Immediate).unwrap();
        link.shutdown();
        assert_eq!(link.live_objects(), 0);
        assert_eq!(link.channel_state(9), Ok(ChannelState::Unused));
    }

    #[test]
    fn receiver_parked_on_removed_object_sees_gone() {
        let (link, peer) = link(8);
        peer.deliver(&link, WireRecord::open(5)).unwrap();
        link.open(5, Wait::Immediate).unwrap();
        let slot = link.slot(5).unwrap();
        let late = slot.installed().unwrap();

        thread::scope(|scope| {
            let receiver = scope.spawn(move || slot.receive(late, Wait::Infinite));
            thread::sleep(Duration::from_millis(20));
            // Removal exactly as teardown performs it, never passing
            // through `Free` from the receiver's point of view.
            let taken = {
                let mut installed = slot.object.lock();
                slot.state.set(ChannelState::Unused);
                installed.take().unwrap()
            };
            taken.wake_all();
            assert_eq!(receiver.join().unwrap(), Err(Error::ChannelGone));
            assert_eq!(Arc::strong_count(&taken), 1);
        });
        assert_eq!(link.live_objects(), 0);
    }

    #[test]
    fn close_waits_out_clone_taken_after_quiescence() {
        let (link, peer) = link(8);
        peer.deliver(&link, WireRecord::open(5)).unwrap();
        link.open(5, Wait::Immediate).unwrap();
        let slot = link.slot(5).unwrap();
        // Held outside the busy window, like a receiver that resolved the
        // object just after `close` saw the channel idle.
        let late = slot.installed().unwrap();

        thread::scope(|scope| {
            let receiver = scope.spawn(move || slot.receive(late, Wait::Infinite));
            thread::sleep(Duration::from_millis(20));
            link.close(5).unwrap();
            assert_eq!(receiver.join().unwrap(), Err(Error::ChannelGone));
        });
        assert_eq!(link.live_objects(), 0);
        assert_eq!(link.channel_state(5), Ok(ChannelState::Unused));
    }

    #[test]
    fn closing_channel_turns_new_callers_away() {
        let (link, peer) = link(8);
        peer.deliver(&link, WireRecord::open(5)).unwrap();
        link.open(5, Wait::Immediate).unwrap();
        let slot = link.slot(5).unwrap();
        slot.state.set(ChannelState::Free);

        assert_eq!(link.recv(5, Wait::Infinite), Err(Error::ChannelGone));
        assert_eq!(link.open(5, Wait::Infinite), Err(Error::Busy));
        peer.deliver(&link, WireRecord::data(5, 1)).unwrap();
        assert_eq!(link.busy(5), Ok(0));
        assert_eq!(link.stats().dropped_not_open, 1);
        assert_eq!(slot.installed().unwrap().cached(), 0);
    }

    #[test]
    fn stale_close_leaves_new_session_alone() {
        let (link, peer) = link(8);
        peer.deliver(&link, WireRecord::open(5)).unwrap();
        link.open(5, Wait::Immediate).unwrap();
        let slot = link.slot(5).unwrap();
        let stale = slot.object.lock().as_ref().map(Arc::downgrade).unwrap();
        link.close(5).unwrap();

        peer.deliver(&link, WireRecord::open(5)).unwrap();
        link.open(5, Wait::Immediate).unwrap();
        peer.recv_all();

        link.teardown(slot, &stale);
        assert!(peer.recv_all().is_empty());
        assert_eq!(link.channel_state(5), Ok(ChannelState::Opened));
        assert_eq!(link.live_objects(), 1);
    }
}
