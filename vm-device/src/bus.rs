// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// Copyright © 2026 The snapfuzz Authors
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.

//! Handles routing to devices in an address space.

use std::cmp::Ordering;
use std::collections::btree_map::BTreeMap;
use std::result;
use std::sync::{Arc, Barrier, Mutex};

use thiserror::Error;

/// Trait for devices that respond to reads or writes in an arbitrary address space.
///
/// The device does not care where it exists in address space as each method is only given an offset
/// into its allocated portion of address space.
#[allow(unused_variables)]
pub trait BusDevice: Send {
    /// Reads at `offset` from this device
    fn read(&mut self, base: u64, offset: u64, data: &mut [u8]) {}
    /// Writes at `offset` into this device
    fn write(&mut self, base: u64, offset: u64, data: &[u8]) -> Option<Arc<Barrier>> {
        None
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// The insertion failed because the new device overlapped with an old device.
    #[error("New device overlaps with an old device")]
    Overlap,
    /// The insertion failed because the range is empty.
    #[error("Cannot insert a device with an empty range")]
    EmptyRange,
    /// No device claims the accessed address.
    #[error("No device is registered at address {0:#x}")]
    MissingAddressRange(u64),
}

pub type Result<T> = result::Result<T, Error>;

/// Holds a base and length representing the address space occupied by a `BusDevice`.
///
/// * base - The address at which the range start.
/// * len - The length of the range in bytes.
#[derive(Debug, Copy, Clone)]
pub struct BusRange {
    pub base: u64,
    pub len: u64,
}

impl BusRange {
    /// Returns true if there is overlap with the given range.
    pub fn overlaps(&self, base: u64, len: u64) -> bool {
        self.base < (base + len) && base < self.base + self.len
    }
}

impl Eq for BusRange {}

impl PartialEq for BusRange {
    fn eq(&self, other: &BusRange) -> bool {
        self.base == other.base
    }
}

impl Ord for BusRange {
    fn cmp(&self, other: &BusRange) -> Ordering {
        self.base.cmp(&other.base)
    }
}

impl PartialOrd for BusRange {
    fn partial_cmp(&self, other: &BusRange) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A device container for routing reads and writes over some address space.
///
/// No two devices can overlap in this address space. Every access goes
/// through the device mutex, which also serializes the accesses a device
/// sees when several vCPU threads share the bus.
#[derive(Clone, Default)]
pub struct Bus {
    devices: BTreeMap<BusRange, Arc<Mutex<dyn BusDevice>>>,
}

impl Bus {
    /// Constructs a bus with an empty address space.
    pub fn new() -> Bus {
        Bus {
            devices: BTreeMap::new(),
        }
    }

    fn first_before(&self, addr: u64) -> Option<(BusRange, &Mutex<dyn BusDevice>)> {
        let (range, dev) = self
            .devices
            .range(..=BusRange { base: addr, len: 1 })
            .next_back()?;
        Some((*range, dev.as_ref()))
    }

    /// Returns the base of the range holding `addr`, the offset of `addr`
    /// inside that range and the device owning it.
    pub fn resolve(&self, addr: u64) -> Option<(u64, u64, &Mutex<dyn BusDevice>)> {
        let (range, dev) = self.first_before(addr)?;
        let offset = addr - range.base;
        if offset < range.len {
            return Some((range.base, offset, dev));
        }
        None
    }

    /// Puts the given device at the given address space.
    pub fn insert(&mut self, device: Arc<Mutex<dyn BusDevice>>, base: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Err(Error::EmptyRange);
        }

        if self
            .devices
            .keys()
            .any(|range| range.overlaps(base, len))
        {
            return Err(Error::Overlap);
        }

        if self
            .devices
            .insert(BusRange { base, len }, device)
            .is_some()
        {
            return Err(Error::Overlap);
        }

        Ok(())
    }

    /// Reads data from the device that owns the range containing `addr` and puts it into `data`.
    pub fn read(&self, addr: u64, data: &mut [u8]) -> Result<()> {
        let (base, offset, dev) = self
            .resolve(addr)
            .ok_or(Error::MissingAddressRange(addr))?;
        // OK to unwrap as lock() failing is a serious error condition and should panic.
        dev.lock()
            .expect("Failed to acquire device lock")
            .read(base, offset, data);
        Ok(())
    }

    /// Writes `data` to the device that owns the range containing `addr`.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<Option<Arc<Barrier>>> {
        let (base, offset, dev) = self
            .resolve(addr)
            .ok_or(Error::MissingAddressRange(addr))?;
        // OK to unwrap as lock() failing is a serious error condition and should panic.
        Ok(dev
            .lock()
            .expect("Failed to acquire device lock")
            .write(base, offset, data))
    }
}
