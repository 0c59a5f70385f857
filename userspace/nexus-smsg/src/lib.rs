// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Shared-memory messaging between the application core and a co-processor
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module, integration tests under tests/
//!
//! PUBLIC API:
//!   - SmsgHub: registry of links, one per destination processor
//!   - LinkController: open/close/send/recv and the interrupt drain routine
//!   - WireRecord/Kind: the 8-byte datagram
//!   - RingTransport: one shared-memory ring direction
//!   - ChannelTable/SmsgConfig: channel configuration
//!   - Wait: blocking behaviour of recv/open
//!   - Error: error taxonomy
//!
//! DEPENDENCIES:
//!   - nexus-hal: SharedMemory/Doorbell platform primitives
//!   - nexus-sync: spin locks and busy counters for non-sleeping paths
//!   - parking_lot: reader lock and wait condition of each channel
//!
//! ADR: docs/adr/0003-ipc-runtime-architecture.md

#![forbid(unsafe_code)]
#![deny(clippy::all)]

use core::time::Duration;
use std::time::Instant;

pub mod channel;
pub mod config;
pub mod hub;
pub mod link;
pub mod record;
pub mod ring;
pub mod table;

#[cfg(feature = "host")]
pub mod host;

pub use channel::ChannelState;
pub use config::{ConfigError, DiePolicy, SmsgConfig};
pub use hub::{LinkHandle, SmsgHub};
pub use link::{ChannelSnapshot, LinkController, LinkSnapshot, LinkStats};
pub use nexus_hal::{Doorbell, SharedMemory};
pub use record::{Kind, WireRecord, CLOSE_MAGIC, OPEN_MAGIC};
pub use ring::{LinkDescriptor, RingDescriptor, RingTransport};
pub use table::{ChannelConfig, ChannelTable};

/// Result type returned by messaging operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors produced by the messaging core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The channel id is not in the channel table.
    #[error("channel is not configured")]
    InvalidChannel,
    /// No link is registered for the destination processor.
    #[error("no link registered for destination")]
    NoDevice,
    /// Ring full or reader lock contended; the caller may retry.
    #[error("resource busy")]
    Busy,
    /// Non-blocking receive found the cache empty.
    #[error("no data available")]
    NoData,
    /// Timed receive expired.
    #[error("operation timed out")]
    TimedOut,
    /// The channel was closed while the call was in flight.
    #[error("channel closed")]
    ChannelGone,
    /// Data sent on a channel whose handshake has not completed.
    #[error("channel not opened")]
    ChannelNotOpened,
    /// `open` on a channel that is already open.
    #[error("channel already open")]
    AlreadyOpen,
    /// A link is already registered for the destination processor.
    #[error("link already registered")]
    LinkExists,
    /// Ring descriptor rejected at registration.
    #[error("invalid ring descriptor: {0}")]
    InvalidDescriptor(&'static str),
    /// A slot held an unknown record kind.
    #[error("malformed record on channel {channel}: kind {kind:#04x}")]
    Malformed {
        /// Channel byte of the slot.
        channel: u8,
        /// Unrecognized kind byte.
        kind: u8,
    },
}

/// Behaviour of a call that may block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait {
    /// Return immediately if no progress can be made.
    Immediate,
    /// Block until the operation completes or the channel is closed.
    Infinite,
    /// Block until the operation completes or the timeout expires.
    Timed(Duration),
}

impl Wait {
    /// Maps the signed-millisecond convention: `0` is immediate, negative
    /// is infinite, positive is a bound.
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            0 => Self::Immediate,
            ms if ms < 0 => Self::Infinite,
            ms => Self::Timed(Duration::from_millis(ms.unsigned_abs())),
        }
    }

    /// Absolute deadline for a timed wait, computed from now.
    pub fn deadline(self) -> Option<Instant> {
        match self {
            Self::Timed(timeout) => Some(Instant::now() + timeout),
            Self::Immediate | Self::Infinite => None,
        }
    }

    /// Remaining budget of a wait that started with `deadline`.
    pub(crate) fn remaining(self, deadline: Option<Instant>) -> Self {
        match (self, deadline) {
            (Self::Timed(_), Some(deadline)) => {
                Self::Timed(deadline.saturating_duration_since(Instant::now()))
            }
            (wait, _) => wait,
        }
    }
}
