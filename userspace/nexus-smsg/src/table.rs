// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sparse channel id (0..=255) to dense slot index mapping.
//!
//! Built once from the configured `(id, name)` list and read-only afterwards.

use serde::Deserialize;

use crate::config::ConfigError;

/// One configured channel.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ChannelConfig {
    pub id: u8,
    pub name: String,
}

impl ChannelConfig {
    pub fn new(id: u8, name: impl Into<String>) -> Self {
        Self { id, name: name.into() }
    }
}

/// Channel set shipped with the modem/co-processor firmware.
pub const DEFAULT_CHANNELS: &[(u8, &str)] = &[
    (0, "ctrl"),
    (1, "comm"),
    (2, "rpc-ap"),
    (3, "rpc-cp"),
    (4, "plog"),
    (5, "tty"),
    (6, "data0"),
    (7, "data1"),
    (8, "data2"),
    (9, "vbc"),
    (10, "playback"),
    (11, "capture"),
    (12, "monitor-audio"),
    (13, "ctrl-voip"),
    (14, "playback-voip"),
    (15, "capture-voip"),
    (16, "monitor-voip"),
    (17, "data3"),
    (18, "loopback"),
    (19, "assert"),
];

#[derive(Debug)]
pub struct ChannelTable {
    dense: [Option<u16>; 256],
    entries: Vec<ChannelConfig>,
}

impl ChannelTable {
    pub fn new(channels: &[ChannelConfig]) -> Result<Self, ConfigError> {
        if channels.is_empty() {
            return Err(ConfigError::EmptyTable);
        }
        let mut dense = [None; 256];
        for (index, channel) in channels.iter().enumerate() {
            let slot = &mut dense[channel.id as usize];
            if slot.is_some() {
                return Err(ConfigError::DuplicateChannel(channel.id));
            }
            // At most 256 distinct ids, so the index always fits.
            *slot = Some(index as u16);
        }
        Ok(Self { dense, entries: channels.to_vec() })
    }

    pub fn lookup(&self, channel: u8) -> Option<usize> {
        self.dense[channel as usize].map(usize::from)
    }

    pub fn name(&self, channel: u8) -> Option<&str> {
        self.lookup(channel).map(|index| self.entries[index].name.as_str())
    }

    /// Number of configured channels (the number of dense slots).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configured channels in dense-index order.
    pub fn iter(&self) -> impl Iterator<Item = &ChannelConfig> + '_ {
        self.entries.iter()
    }
}

impl Default for ChannelTable {
    fn default() -> Self {
        let dense_ids = DEFAULT_CHANNELS;
        let mut dense = [None; 256];
        for (index, (id, _)) in dense_ids.iter().enumerate() {
            dense[*id as usize] = Some(index as u16);
        }
        let entries =
            dense_ids.iter().map(|(id, name)| ChannelConfig::new(*id, *name)).collect();
        Self { dense, entries }
    }
}
