// Copyright © 2026 The snapfuzz Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Emulates the devices through which a guest drives snapshots.

#[macro_use]
extern crate log;

pub mod snapshot;

pub use self::snapshot::{Command, SnapshotDevice, SnapshotDeviceError};
