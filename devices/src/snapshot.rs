// Copyright © 2026 The snapfuzz Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::result;
use std::sync::{Arc, Barrier, Mutex};

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;
use vm_device::BusDevice;
use vm_snapshot::{GuestRamProvider, SnapshotEngine, StateSerializer};

pub const SNAPSHOT_VENDOR_ID: u16 = 0x1234;
pub const SNAPSHOT_DEVICE_ID: u16 = 0xf987;
pub const SNAPSHOT_REVISION_ID: u8 = 0x10;

pub const SNAPSHOT_DEVICE_MMIO_SIZE: u64 = 0x10_0000;

// Register offsets
pub const SNAPSHOT_COMMAND_OFF: u64 = 0x00;
pub const SNAPSHOT_SHARED_ADDR_OFF: u64 = 0x10;

// Values accepted by the command register
const CMD_SAVE: u64 = 0x101;
const CMD_RESTORE: u64 = 0x102;
const CMD_RELEASE_SHARED: u64 = 0x202;

/// A request decoded from a guest register write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Save,
    Restore,
    ReleaseShared,
    SetSharedAddress(u64),
}

impl Command {
    /// Decodes a write of `value` at register `offset`. Unknown offsets and
    /// opcodes give `None`.
    pub fn decode(offset: u64, value: u64) -> Option<Command> {
        match (offset, value) {
            (SNAPSHOT_COMMAND_OFF, CMD_SAVE) => Some(Command::Save),
            (SNAPSHOT_COMMAND_OFF, CMD_RESTORE) => Some(Command::Restore),
            (SNAPSHOT_COMMAND_OFF, CMD_RELEASE_SHARED) => Some(Command::ReleaseShared),
            (SNAPSHOT_SHARED_ADDR_OFF, addr) => Some(Command::SetSharedAddress(addr)),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SnapshotDeviceError {
    #[error("Guest RAM is not allocated yet")]
    RamUnavailable,
    #[error("Device is unusable after a failed guest RAM remap")]
    Broken,
    #[error("Snapshot engine failure")]
    Engine(#[source] vm_snapshot::Error),
}

pub type Result<T> = result::Result<T, SnapshotDeviceError>;

/// Control device letting the guest save and restore itself and bind the
/// shared window.
pub struct SnapshotDevice {
    id: String,
    engine: SnapshotEngine,
    ram: Arc<dyn GuestRamProvider>,
    state: Arc<Mutex<dyn StateSerializer>>,
    broken: bool,
}

impl SnapshotDevice {
    pub fn new(
        id: String,
        engine: SnapshotEngine,
        ram: Arc<dyn GuestRamProvider>,
        state: Arc<Mutex<dyn StateSerializer>>,
    ) -> Self {
        SnapshotDevice {
            id,
            engine,
            ram,
            state,
            broken: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn engine(&self) -> &SnapshotEngine {
        &self.engine
    }

    /// Set once a remap failed half way. Guest RAM can't be trusted then
    /// and every later command is refused.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn execute(&mut self, command: Command) -> Result<()> {
        if self.broken {
            return Err(SnapshotDeviceError::Broken);
        }

        // The RAM location is read once and used for the whole command.
        let ram = self
            .ram
            .guest_ram()
            .ok_or(SnapshotDeviceError::RamUnavailable)?;

        let ret = match command {
            Command::Save => self.engine.save(&ram, &mut *self.state.lock().unwrap()),
            Command::Restore => self
                .engine
                .restore(&ram, &mut *self.state.lock().unwrap()),
            Command::ReleaseShared => self.engine.release_shared(&ram),
            Command::SetSharedAddress(addr) => self.engine.set_shared_address(&ram, addr),
        };

        ret.map_err(|e| {
            if e.is_fatal() {
                self.broken = true;
            }
            SnapshotDeviceError::Engine(e)
        })
    }
}

impl BusDevice for SnapshotDevice {
    fn read(&mut self, _base: u64, offset: u64, data: &mut [u8]) {
        debug!("{}: read at offset {:#x}", self.id, offset);
        data.fill(0);
    }

    fn write(&mut self, _base: u64, offset: u64, data: &[u8]) -> Option<Arc<Barrier>> {
        let value = match data.len() {
            4 => LittleEndian::read_u32(data) as u64,
            8 => LittleEndian::read_u64(data),
            len => {
                warn!("{}: ignoring {len} byte write at {offset:#x}", self.id);
                return None;
            }
        };

        let Some(command) = Command::decode(offset, value) else {
            debug!("{}: ignoring write of {value:#x} at {offset:#x}", self.id);
            return None;
        };

        match self.execute(command) {
            Ok(()) => debug!("{}: {command:?} done", self.id),
            Err(SnapshotDeviceError::RamUnavailable) => {
                warn!("{}: {command:?} ignored, guest RAM not allocated", self.id)
            }
            Err(e) => error!("{}: {command:?} failed: {e:?}", self.id),
        }

        None
    }
}
