// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Registry of links, one per destination processor.
//!
//! Constructed once at startup and handed to every user; the platform layer
//! registers a link when the shared region and doorbell of a destination
//! become available.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::info;
use nexus_hal::{Doorbell, SharedMemory};
use parking_lot::RwLock;

use crate::config::{ConfigError, SmsgConfig};
use crate::link::LinkController;
use crate::record::WireRecord;
use crate::ring::LinkDescriptor;
use crate::table::ChannelTable;
use crate::{Error, Result, Wait};

/// Shared handle onto a registered link.
pub type LinkHandle<M> = Arc<LinkController<M>>;

pub struct SmsgHub<M> {
    config: SmsgConfig,
    table: Arc<ChannelTable>,
    links: RwLock<BTreeMap<u8, LinkHandle<M>>>,
}

impl<M> SmsgHub<M> {
    pub fn new(config: SmsgConfig) -> core::result::Result<Self, ConfigError> {
        let table = Arc::new(config.channel_table()?);
        Ok(Self { config, table, links: RwLock::new(BTreeMap::new()) })
    }

    pub fn config(&self) -> &SmsgConfig {
        &self.config
    }

    pub fn channel_table(&self) -> &ChannelTable {
        &self.table
    }

    /// Registered destinations in ascending order.
    pub fn destinations(&self) -> Vec<u8> {
        self.links.read().keys().copied().collect()
    }

    /// Handle onto the link towards `dst`.
    pub fn link(&self, dst: u8) -> Result<LinkHandle<M>> {
        self.links.read().get(&dst).cloned().ok_or(Error::NoDevice)
    }
}

impl<M: SharedMemory + Clone> SmsgHub<M> {
    /// Registers the link towards `dst`. `descriptor` locates both rings in
    /// `memory`; `doorbell` raises the peer's interrupt.
    pub fn register_link(
        &self,
        dst: u8,
        memory: M,
        descriptor: LinkDescriptor,
        doorbell: impl Doorbell + Send + Sync + 'static,
    ) -> Result<LinkHandle<M>> {
        let mut links = self.links.write();
        if links.contains_key(&dst) {
            return Err(Error::LinkExists);
        }
        let link = Arc::new(LinkController::new(
            dst,
            memory,
            descriptor,
            doorbell,
            self.table.clone(),
            &self.config,
        )?);
        links.insert(dst, link.clone());
        Ok(link)
    }
}

impl<M: SharedMemory> SmsgHub<M> {
    /// Removes the link towards `dst` and closes its channels.
    pub fn unregister_link(&self, dst: u8) -> Result<()> {
        let link = self.links.write().remove(&dst).ok_or(Error::NoDevice)?;
        link.shutdown();
        info!("smsg: dst {dst} unregistered");
        Ok(())
    }

    pub fn open(&self, dst: u8, channel: u8, wait: Wait) -> Result<()> {
        self.link(dst)?.open(channel, wait)
    }

    pub fn close(&self, dst: u8, channel: u8) -> Result<()> {
        self.link(dst)?.close(channel)
    }

    pub fn send(&self, dst: u8, record: WireRecord) -> Result<()> {
        self.link(dst)?.send(record)
    }

    pub fn recv(&self, dst: u8, channel: u8, wait: Wait) -> Result<WireRecord> {
        self.link(dst)?.recv(channel, wait)
    }

    /// Interrupt entry for `dst`; see [`LinkController::handle_interrupt`].
    pub fn handle_interrupt(&self, dst: u8) -> Result<usize> {
        Ok(self.link(dst)?.handle_interrupt())
    }
}
