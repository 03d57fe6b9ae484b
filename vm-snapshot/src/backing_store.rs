// Copyright © 2026 The snapfuzz Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Flat file holding the saved guest RAM image.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use vm_memory::mmap::MmapRegionError;
use vm_memory::{FileOffset, MmapRegion};

use crate::GuestRam;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Guest RAM is empty")]
    EmptyRam,
    #[error("Failed to remove stale image {0}")]
    RemoveStale(PathBuf, #[source] io::Error),
    #[error("Failed to create image {0}")]
    Create(PathBuf, #[source] io::Error),
    #[error("Failed to expand image to {0:#x} bytes")]
    SetLen(u64, #[source] io::Error),
    #[error("Failed to map image for writing")]
    Map(#[source] MmapRegionError),
    #[error("Failed to flush image to storage")]
    Sync(#[source] io::Error),
    #[error("Failed to open image {0}")]
    Open(PathBuf, #[source] io::Error),
    #[error("Image is {found:#x} bytes but guest RAM is {expected:#x} bytes")]
    SizeMismatch { expected: u64, found: u64 },
}

pub type Result<T> = std::result::Result<T, Error>;

/// The file at a fixed path holding a byte-exact image of guest RAM.
#[derive(Debug)]
pub struct BackingStore {
    path: PathBuf,
}

impl BackingStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        BackingStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the current image, `None` when nothing was saved yet.
    pub fn image_len(&self) -> Result<Option<u64>> {
        match fs::metadata(&self.path) {
            Ok(m) => Ok(Some(m.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Open(self.path.clone(), e)),
        }
    }

    /// Writes the whole of `ram` to the image file and flushes it.
    ///
    /// A previous image is unlinked rather than truncated: guest RAM may
    /// still be a private mapping of it, and truncating a mapped file
    /// turns later guest accesses into SIGBUS.
    pub fn save(&self, ram: &GuestRam) -> Result<()> {
        if ram.is_empty() {
            return Err(Error::EmptyRam);
        }

        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed stale image {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::RemoveStale(self.path.clone(), e)),
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|e| Error::Create(self.path.clone(), e))?;
        let len = ram.len() as u64;
        file.set_len(len).map_err(|e| Error::SetLen(len, e))?;

        let image = MmapRegion::<()>::build(
            Some(FileOffset::new(file, 0)),
            ram.len(),
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
        )
        .map_err(Error::Map)?;

        // SAFETY: both ranges are `ram.len()` bytes long and belong to
        // different mappings.
        unsafe { std::ptr::copy_nonoverlapping(ram.base(), image.as_ptr(), ram.len()) };

        // SAFETY: `image` is a live mapping of exactly this length.
        let ret = unsafe {
            libc::msync(
                image.as_ptr() as *mut libc::c_void,
                image.size(),
                libc::MS_SYNC,
            )
        };
        if ret == -1 {
            return Err(Error::Sync(io::Error::last_os_error()));
        }
        if let Some(file_offset) = image.file_offset() {
            file_offset.file().sync_all().map_err(Error::Sync)?;
        }

        Ok(())
    }

    /// Opens the image for a private mapping covering `ram_len` bytes.
    ///
    /// The file is opened read-only so a `MAP_PRIVATE` mapping of it can
    /// never write back, whatever the guest does afterwards.
    pub fn open_for_cow_restore(&self, ram_len: usize) -> Result<File> {
        let file = File::open(&self.path).map_err(|e| Error::Open(self.path.clone(), e))?;
        let found = file
            .metadata()
            .map_err(|e| Error::Open(self.path.clone(), e))?
            .len();
        if found != ram_len as u64 {
            return Err(Error::SizeMismatch {
                expected: ram_len as u64,
                found,
            });
        }

        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use vmm_sys_util::tempdir::TempDir;

    use super::*;
    use crate::mapping::{self, Sharing};
    use crate::test_util::TestRam;

    #[test]
    fn test_save_writes_exact_image() {
        let dir = TempDir::new_with_prefix("/tmp/snapfuzz-backing").unwrap();
        let store = BackingStore::new(dir.as_path().join("image"));
        assert!(store.image_len().unwrap().is_none());

        let ram = TestRam::new(4 * crate::PAGE_SIZE);
        ram.fill(|i| (i % 251) as u8);
        store.save(&ram.ram()).unwrap();

        assert_eq!(store.image_len().unwrap(), Some(4 * crate::PAGE_SIZE as u64));
        assert_eq!(fs::read(store.path()).unwrap(), ram.contents());
    }

    #[test]
    fn test_save_replaces_previous_image() {
        let dir = TempDir::new_with_prefix("/tmp/snapfuzz-backing").unwrap();
        let store = BackingStore::new(dir.as_path().join("image"));
        fs::write(store.path(), vec![0xffu8; 3 * crate::PAGE_SIZE]).unwrap();

        let ram = TestRam::new(2 * crate::PAGE_SIZE);
        ram.fill(|_| 0x5a);
        store.save(&ram.ram()).unwrap();

        assert_eq!(fs::read(store.path()).unwrap(), vec![0x5a; 2 * crate::PAGE_SIZE]);
    }

    #[test]
    fn test_cow_mapping_never_reaches_file() {
        let dir = TempDir::new_with_prefix("/tmp/snapfuzz-backing").unwrap();
        let store = BackingStore::new(dir.as_path().join("image"));
        let ram = TestRam::new(2 * crate::PAGE_SIZE);
        ram.fill(|_| 0x42);
        store.save(&ram.ram()).unwrap();

        let image = store.open_for_cow_restore(ram.ram().len()).unwrap();
        let guest = ram.ram();
        // SAFETY: the test owns the RAM mapping and the image matches its size.
        unsafe { mapping::map_file_fixed(guest.base(), guest.len(), &image, Sharing::Private) }
            .unwrap();
        ram.fill(|_| 0x99);

        assert_eq!(fs::read(store.path()).unwrap(), vec![0x42; 2 * crate::PAGE_SIZE]);
    }

    #[test]
    fn test_restore_rejects_wrong_size_or_missing_image() {
        let dir = TempDir::new_with_prefix("/tmp/snapfuzz-backing").unwrap();
        let store = BackingStore::new(dir.as_path().join("image"));
        assert!(matches!(
            store.open_for_cow_restore(crate::PAGE_SIZE),
            Err(Error::Open(..))
        ));

        let ram = TestRam::new(crate::PAGE_SIZE);
        store.save(&ram.ram()).unwrap();
        assert!(matches!(
            store.open_for_cow_restore(2 * crate::PAGE_SIZE),
            Err(Error::SizeMismatch {
                expected: 0x2000,
                found: 0x1000
            })
        ));
    }

    #[test]
    fn test_save_fails_when_directory_is_missing() {
        let store = BackingStore::new("/nonexistent-snapfuzz-dir/image");
        let ram = TestRam::new(crate::PAGE_SIZE);
        assert!(matches!(store.save(&ram.ram()), Err(Error::Create(..))));
    }
}
