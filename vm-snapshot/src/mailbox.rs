// Copyright © 2026 The snapfuzz Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The external process' end of the shared window.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use vm_memory::mmap::MmapRegionError;
use vm_memory::{Bytes, FileOffset, MmapRegion, VolatileMemoryError, VolatileSlice};

use crate::PAGE_SIZE;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to open shared memory file {0}")]
    Open(PathBuf, #[source] io::Error),
    #[error("Failed to expand shared memory file to one page")]
    SetLen(#[source] io::Error),
    #[error("Failed to map shared memory file")]
    Map(#[source] MmapRegionError),
    #[error("Access of {len:#x} bytes at {offset:#x} is outside the mailbox")]
    OutOfBounds { offset: usize, len: usize },
    #[error("Failed to access the mailbox")]
    Access(#[source] VolatileMemoryError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Shared mapping of the shared memory file, as seen by a fuzzer feeding
/// input to the guest. Writes are visible to the guest as soon as the
/// window is active and survive window deactivation.
pub struct SharedMailbox {
    path: PathBuf,
    region: MmapRegion,
}

impl SharedMailbox {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o666)
            .open(&path)
            .map_err(|e| Error::Open(path.clone(), e))?;
        file.set_len(PAGE_SIZE as u64).map_err(Error::SetLen)?;

        let region = MmapRegion::build(
            Some(FileOffset::new(file, 0)),
            PAGE_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
        )
        .map_err(Error::Map)?;

        Ok(SharedMailbox { path, region })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.region.size()
    }

    pub fn is_empty(&self) -> bool {
        self.region.size() == 0
    }

    fn slice(&self) -> VolatileSlice<'_> {
        // SAFETY: the region is mapped for as long as `self` lives.
        unsafe { VolatileSlice::new(self.region.as_ptr(), self.region.size()) }
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len() => Ok(()),
            _ => Err(Error::OutOfBounds { offset, len }),
        }
    }

    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check(offset, buf.len())?;
        self.slice()
            .read_slice(buf, offset)
            .map_err(Error::Access)
    }

    pub fn write(&self, offset: usize, buf: &[u8]) -> Result<()> {
        self.check(offset, buf.len())?;
        self.slice()
            .write_slice(buf, offset)
            .map_err(Error::Access)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use vmm_sys_util::tempdir::TempDir;

    use super::*;
    use crate::test_util::TestRam;
    use crate::SharedWindow;

    #[test]
    fn test_mailbox_creates_page_sized_file() {
        let dir = TempDir::new_with_prefix("/tmp/snapfuzz-mailbox").unwrap();
        let path = dir.as_path().join("snapshot_data");

        let mailbox = SharedMailbox::open(&path).unwrap();
        assert_eq!(mailbox.len(), PAGE_SIZE);
        assert_eq!(fs::metadata(&path).unwrap().len(), PAGE_SIZE as u64);

        mailbox.write(0x10, b"seed").unwrap();
        assert_eq!(&fs::read(&path).unwrap()[0x10..0x14], b"seed");
    }

    #[test]
    fn test_mailbox_bounds() {
        let dir = TempDir::new_with_prefix("/tmp/snapfuzz-mailbox").unwrap();
        let mailbox = SharedMailbox::open(dir.as_path().join("snapshot_data")).unwrap();

        let mut buf = [0u8; 8];
        assert!(matches!(
            mailbox.read(PAGE_SIZE - 4, &mut buf),
            Err(Error::OutOfBounds { .. })
        ));
        assert!(matches!(
            mailbox.write(usize::MAX, &buf),
            Err(Error::OutOfBounds { .. })
        ));
        mailbox.read(PAGE_SIZE - 8, &mut buf).unwrap();
    }

    #[test]
    fn test_mailbox_talks_to_active_window() {
        let dir = TempDir::new_with_prefix("/tmp/snapfuzz-mailbox").unwrap();
        let path = dir.as_path().join("snapshot_data");
        let ram = TestRam::new(4 * PAGE_SIZE);
        let mut window = SharedWindow::new(&path);
        window.activate(&ram.ram(), 0x1000).unwrap();

        let mailbox = SharedMailbox::open(&path).unwrap();
        mailbox.write(0, b"input").unwrap();
        assert_eq!(&ram.page(0x1000)[..5], b"input");

        ram.write(0x1000 + 0x20, b"crash");
        let mut buf = [0u8; 5];
        mailbox.read(0x20, &mut buf).unwrap();
        assert_eq!(&buf, b"crash");
    }
}
