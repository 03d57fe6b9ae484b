// Copyright © 2026 The snapfuzz Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Guest RAM snapshot and restore for fuzzing loops.
//!
//! Guest RAM is saved once to a flat image file and then replaced in place
//! by a private copy-on-write mapping of that image, so every restore is a
//! remap instead of a copy. One page of guest RAM can additionally be
//! swapped for a shared file mapping (the shared window) that an external
//! process reads and writes while the guest runs.

#[macro_use]
extern crate log;

pub mod backing_store;
pub mod config;
pub mod engine;
pub mod mailbox;
pub mod mapping;
pub mod shared_window;
pub mod state;

use thiserror::Error;
use vm_memory::VolatileSlice;

pub use crate::config::SnapshotConfig;
pub use crate::engine::SnapshotEngine;
pub use crate::mailbox::SharedMailbox;
pub use crate::shared_window::SharedWindow;
pub use crate::state::{NonMemoryState, StateError, StateSerializer};

/// Granularity of the shared window.
pub const PAGE_SIZE: usize = 0x1000;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Cannot restore before a snapshot has been saved")]
    NotSaved,
    #[error("Backing store failure")]
    BackingStore(#[source] backing_store::Error),
    #[error("Shared window failure")]
    SharedWindow(#[source] shared_window::Error),
    #[error("Failed to replace the guest RAM mapping")]
    ReplaceRam(#[source] mapping::Error),
    #[error("Failed to capture non-memory state")]
    CaptureState(#[source] StateError),
    #[error("Failed to apply non-memory state")]
    ApplyState(#[source] StateError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// How a failure must be handled by the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad shared window address. Nothing was changed.
    Configuration,
    /// A file could not be created, grown or synced. The operation was
    /// rolled back.
    Io,
    /// The request is not valid in the current state. Nothing was changed.
    Protocol,
    /// The non-memory state collaborator failed.
    State,
    /// A syscall failed half way through rewriting the guest address
    /// space. The guest RAM can no longer be trusted.
    FatalMapping,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotSaved => ErrorKind::Protocol,
            Error::BackingStore(_) => ErrorKind::Io,
            Error::SharedWindow(e) => e.kind(),
            Error::ReplaceRam(_) => ErrorKind::FatalMapping,
            Error::CaptureState(_) | Error::ApplyState(_) => ErrorKind::State,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::FatalMapping
    }
}

impl From<backing_store::Error> for Error {
    fn from(e: backing_store::Error) -> Self {
        Error::BackingStore(e)
    }
}

impl From<shared_window::Error> for Error {
    fn from(e: shared_window::Error) -> Self {
        Error::SharedWindow(e)
    }
}

/// Location of guest RAM in this process for the duration of one operation.
///
/// The RAM allocation belongs to the VM; every operation receives the
/// current location because it may change between accesses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GuestRam {
    base: *mut u8,
    len: usize,
}

impl GuestRam {
    /// # Safety
    ///
    /// `base` must be page aligned and point to `len` bytes of mapped
    /// memory which this crate is allowed to unmap and replace in place.
    /// The allocation must outlive every operation given this value.
    pub unsafe fn new(base: *mut u8, len: usize) -> Self {
        GuestRam { base, len }
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Checks that `[offset, offset + len)` lies inside guest RAM.
    pub fn contains(&self, offset: u64, len: usize) -> bool {
        offset
            .checked_add(len as u64)
            .is_some_and(|end| end <= self.len as u64)
    }

    /// Host address of `offset`, which must have been checked with
    /// [`GuestRam::contains`].
    pub(crate) fn host_address(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.len);
        self.base.wrapping_add(offset)
    }

    /// Volatile view of the whole region, for callers inspecting or
    /// seeding guest memory.
    pub fn as_volatile_slice(&self) -> VolatileSlice<'_> {
        // SAFETY: `GuestRam::new` guarantees the range is mapped.
        unsafe { VolatileSlice::new(self.base, self.len) }
    }
}

/// Source of the current guest RAM location.
pub trait GuestRamProvider: Send + Sync {
    /// `None` until the VM has allocated its RAM.
    fn guest_ram(&self) -> Option<GuestRam>;
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::path::Path;

    use vm_memory::{Bytes, MmapRegion};

    use super::*;

    /// Anonymous memory standing in for a VM's RAM allocation.
    pub struct TestRam {
        region: MmapRegion,
    }

    impl TestRam {
        pub fn new(len: usize) -> Self {
            TestRam {
                region: MmapRegion::new(len).unwrap(),
            }
        }

        pub fn ram(&self) -> GuestRam {
            // SAFETY: the region stays mapped for as long as `self` lives.
            unsafe { GuestRam::new(self.region.as_ptr(), self.region.size()) }
        }

        pub fn fill(&self, pattern: impl Fn(usize) -> u8) {
            let bytes: Vec<u8> = (0..self.region.size()).map(pattern).collect();
            self.ram().as_volatile_slice().write_slice(&bytes, 0).unwrap();
        }

        pub fn write(&self, offset: usize, bytes: &[u8]) {
            self.ram()
                .as_volatile_slice()
                .write_slice(bytes, offset)
                .unwrap();
        }

        pub fn contents(&self) -> Vec<u8> {
            let mut bytes = vec![0u8; self.region.size()];
            self.ram()
                .as_volatile_slice()
                .read_slice(&mut bytes, 0)
                .unwrap();
            bytes
        }

        pub fn page(&self, offset: usize) -> Vec<u8> {
            self.contents()[offset..offset + PAGE_SIZE].to_vec()
        }
    }

    pub fn test_config(dir: &Path) -> SnapshotConfig {
        SnapshotConfig {
            snapshot_path: dir.join("snapshot0"),
            shared_path: dir.join("snapshot_data"),
        }
    }

    #[derive(Default)]
    pub struct TestCpu {
        pub registers: Vec<u8>,
        pub fail_capture: bool,
    }

    impl StateSerializer for TestCpu {
        fn capture_state(&mut self) -> std::result::Result<NonMemoryState, StateError> {
            if self.fail_capture {
                return Err(StateError::Capture(anyhow::anyhow!("vCPU is running")));
            }
            Ok(NonMemoryState::new(self.registers.clone()))
        }

        fn apply_state(&mut self, state: &NonMemoryState) -> std::result::Result<(), StateError> {
            self.registers = state.as_bytes().to_vec();
            Ok(())
        }
    }
}
