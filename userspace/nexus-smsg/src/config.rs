// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Messaging core configuration, loadable from TOML.
//!
//! ```toml
//! cache_depth = 32
//! die_policy = "discard"
//!
//! [[channels]]
//! id = 5
//! name = "tty"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::table::{ChannelConfig, ChannelTable, DEFAULT_CHANNELS};

/// Default depth of each channel's receive cache.
pub const DEFAULT_CACHE_DEPTH: usize = 64;

/// What the drain routine does when the peer reports a fatal fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiePolicy {
    /// Escalate to a local panic.
    Fatal,
    /// Log and drop the record.
    Discard,
}

impl Default for DiePolicy {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self::Fatal
        } else {
            Self::Discard
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read smsg config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse smsg config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("channel {0} configured twice")]
    DuplicateChannel(u8),
    #[error("channel table is empty")]
    EmptyTable,
    #[error("cache depth {0} is not a non-zero power of two")]
    CacheDepth(usize),
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SmsgConfig {
    #[serde(default = "default_channels")]
    pub channels: Vec<ChannelConfig>,
    #[serde(default = "default_cache_depth")]
    pub cache_depth: usize,
    #[serde(default)]
    pub die_policy: DiePolicy,
}

impl Default for SmsgConfig {
    fn default() -> Self {
        Self {
            channels: default_channels(),
            cache_depth: DEFAULT_CACHE_DEPTH,
            die_policy: DiePolicy::default(),
        }
    }
}

impl SmsgConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&data)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_depth == 0 || !self.cache_depth.is_power_of_two() || self.cache_depth > 1 << 16
        {
            return Err(ConfigError::CacheDepth(self.cache_depth));
        }
        ChannelTable::new(&self.channels).map(drop)
    }

    /// Builds the channel table described by this configuration.
    pub fn channel_table(&self) -> Result<ChannelTable, ConfigError> {
        self.validate()?;
        ChannelTable::new(&self.channels)
    }
}

fn default_channels() -> Vec<ChannelConfig> {
    DEFAULT_CHANNELS.iter().map(|(id, name)| ChannelConfig::new(*id, *name)).collect()
}

fn default_cache_depth() -> usize {
    DEFAULT_CACHE_DEPTH
}
