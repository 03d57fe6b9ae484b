// Copyright © 2026 The snapfuzz Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! One page of guest RAM swapped for a mapping of a file that an external
//! process maps as well.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::mapping::{self, AnonMapping, Sharing};
use crate::{ErrorKind, GuestRam, PAGE_SIZE};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Shared window address {offset:#x} is not a page of guest RAM ({ram_len:#x} bytes)")]
    InvalidAddress { offset: u64, ram_len: usize },
    #[error("A shared window is already active at {0:#x}")]
    WindowActive(u64),
    #[error("Failed to open shared memory file {0}")]
    OpenFile(PathBuf, #[source] io::Error),
    #[error("Failed to expand shared memory file to one page")]
    SetLen(#[source] io::Error),
    #[error("Failed to allocate the displaced page backup")]
    AllocateBackup(#[source] mapping::Error),
    #[error("Failed to unmap the guest page")]
    UnmapGuestPage(#[source] mapping::Error),
    #[error("Failed to map the shared memory file into guest RAM")]
    MapSharedFile(#[source] mapping::Error),
    #[error("Failed to move the displaced page back into guest RAM")]
    RestoreBackup(#[source] mapping::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidAddress { .. } => ErrorKind::Configuration,
            Error::WindowActive(_) => ErrorKind::Protocol,
            Error::OpenFile(..) | Error::SetLen(_) | Error::AllocateBackup(_) => ErrorKind::Io,
            Error::UnmapGuestPage(_) | Error::MapSharedFile(_) | Error::RestoreBackup(_) => {
                ErrorKind::FatalMapping
            }
        }
    }
}

/// An active window: the guest page at `offset` maps the shared file and
/// `backup` holds the bytes it displaced.
#[derive(Debug)]
struct ActiveWindow {
    offset: usize,
    backup: AnonMapping,
}

/// The shared window and the file backing it.
#[derive(Debug)]
pub struct SharedWindow {
    path: PathBuf,
    active: Option<ActiveWindow>,
}

impl SharedWindow {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SharedWindow {
            path: path.into(),
            active: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Guest RAM offset of the active window.
    pub fn address(&self) -> Option<u64> {
        self.active.as_ref().map(|w| w.offset as u64)
    }

    fn validate(ram: &GuestRam, offset: u64) -> Result<usize> {
        if offset % PAGE_SIZE as u64 != 0 || !ram.contains(offset, PAGE_SIZE) {
            return Err(Error::InvalidAddress {
                offset,
                ram_len: ram.len(),
            });
        }

        Ok(offset as usize)
    }

    fn open_shared_file(&self) -> Result<File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o666)
            .custom_flags(libc::O_SYNC)
            .open(&self.path)
            .map_err(|e| Error::OpenFile(self.path.clone(), e))?;
        file.set_len(PAGE_SIZE as u64).map_err(Error::SetLen)?;

        Ok(file)
    }

    /// Replaces the guest page at `offset` with a shared mapping of the
    /// shared memory file. The file keeps whatever an earlier activation
    /// or the external process left in it.
    pub fn activate(&mut self, ram: &GuestRam, offset: u64) -> Result<()> {
        let offset = Self::validate(ram, offset)?;
        if let Some(active) = &self.active {
            return Err(Error::WindowActive(active.offset as u64));
        }

        let file = self.open_shared_file()?;
        let backup = AnonMapping::new(PAGE_SIZE).map_err(Error::AllocateBackup)?;
        let page = ram.host_address(offset);

        // SAFETY: `page` is a validated page of guest RAM and `backup` is a
        // fresh page owned here.
        unsafe { std::ptr::copy_nonoverlapping(page, backup.as_ptr(), PAGE_SIZE) };
        // SAFETY: the page belongs to guest RAM, which this crate may
        // rewrite in place.
        unsafe {
            mapping::unmap(page, PAGE_SIZE).map_err(Error::UnmapGuestPage)?;
            mapping::map_file_fixed(page, PAGE_SIZE, &file, Sharing::Shared)
                .map_err(Error::MapSharedFile)?;
        }

        self.active = Some(ActiveWindow { offset, backup });
        info!(
            "Shared window active at {offset:#x}, backed by {}",
            self.path.display()
        );
        Ok(())
    }

    /// Puts the displaced bytes back in place of the shared mapping. Does
    /// nothing when no window is active.
    pub fn deactivate(&mut self, ram: &GuestRam) -> Result<()> {
        let Some(active) = self.active.take() else {
            return Ok(());
        };
        let offset = active.offset;
        let page = ram.host_address(offset);

        // SAFETY: the page was validated when the window was activated.
        unsafe {
            mapping::unmap(page, PAGE_SIZE).map_err(Error::UnmapGuestPage)?;
            active.backup.move_to(page).map_err(Error::RestoreBackup)?;
        }

        info!("Shared window at {offset:#x} released");
        Ok(())
    }

    /// Tears the window down ahead of a whole-RAM replacement and returns
    /// the offset it was bound to. The displaced bytes are dropped since
    /// the page is about to be overwritten anyway.
    pub(crate) fn discard(&mut self, ram: &GuestRam) -> Result<Option<u64>> {
        let Some(active) = self.active.take() else {
            return Ok(None);
        };

        // SAFETY: the page was validated when the window was activated.
        unsafe { mapping::unmap(ram.host_address(active.offset), PAGE_SIZE) }
            .map_err(Error::UnmapGuestPage)?;

        debug!("Shared window at {:#x} discarded", active.offset);
        Ok(Some(active.offset as u64))
    }
}
