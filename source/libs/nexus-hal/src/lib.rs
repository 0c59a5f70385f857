// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Platform primitives consumed by the shared-memory messaging core.
//!
//! The messaging core never touches hardware directly. A platform layer
//! hands it a [`SharedMemory`] window onto the region both cores can see and
//! a [`Doorbell`] that raises the peer's interrupt line.

#![cfg_attr(not(test), no_std)]

/// 32-bit word access into a region shared with another processor.
///
/// Offsets are in bytes and must be 4-aligned. Implementations give
/// `read_u32` acquire semantics and `write_u32` release semantics so a
/// producer that writes a payload and then an index word publishes the
/// payload to a consumer that reads the index word first.
pub trait SharedMemory {
    /// Loads the word at `offset`.
    fn read_u32(&self, offset: usize) -> u32;
    /// Stores `value` at `offset`.
    fn write_u32(&self, offset: usize, value: u32);
    /// Size of the region in bytes.
    fn len(&self) -> usize;

    /// Returns `true` when the region holds no words.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<M: SharedMemory + ?Sized> SharedMemory for &M {
    fn read_u32(&self, offset: usize) -> u32 {
        (**self).read_u32(offset)
    }

    fn write_u32(&self, offset: usize, value: u32) {
        (**self).write_u32(offset, value)
    }

    fn len(&self) -> usize {
        (**self).len()
    }
}

/// Raises the peer processor's interrupt.
pub trait Doorbell {
    fn ring(&self);
}

impl<F: Fn()> Doorbell for F {
    fn ring(&self) {
        self()
    }
}
