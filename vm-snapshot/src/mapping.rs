// Copyright © 2026 The snapfuzz Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Thin wrappers around the address space syscalls used to swap guest RAM
//! backings in place.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::ptr::NonNull;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to unmap {len:#x} bytes at {addr:#x}")]
    Unmap {
        addr: usize,
        len: usize,
        #[source]
        source: io::Error,
    },
    #[error("Failed to map {len:#x} bytes of file at {addr:#x}")]
    MapFile {
        addr: usize,
        len: usize,
        #[source]
        source: io::Error,
    },
    #[error("Failed to move {len:#x} bytes to {addr:#x}")]
    Remap {
        addr: usize,
        len: usize,
        #[source]
        source: io::Error,
    },
    #[error("Failed to allocate {0:#x} bytes of anonymous memory")]
    Anonymous(usize, #[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Whether guest writes through a file mapping reach the file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sharing {
    /// Copy-on-write: writes stay private to this process.
    Private,
    /// Writes are visible to every process mapping the same file.
    Shared,
}

impl Sharing {
    fn flags(self) -> libc::c_int {
        match self {
            Sharing::Private => libc::MAP_PRIVATE,
            Sharing::Shared => libc::MAP_SHARED,
        }
    }
}

/// Removes every mapping in `[addr, addr + len)`.
///
/// # Safety
///
/// Nothing may access the range until it is mapped again, and no Rust
/// reference into it may outlive this call.
pub unsafe fn unmap(addr: *mut u8, len: usize) -> Result<()> {
    // SAFETY: the caller owns the range.
    let ret = unsafe { libc::munmap(addr as *mut libc::c_void, len) };
    if ret == -1 {
        return Err(Error::Unmap {
            addr: addr as usize,
            len,
            source: io::Error::last_os_error(),
        });
    }

    Ok(())
}

/// Maps the first `len` bytes of `file` read-write at exactly `addr`,
/// replacing anything mapped there.
///
/// # Safety
///
/// `[addr, addr + len)` must be owned by the caller, and `file` must be at
/// least `len` bytes long.
pub unsafe fn map_file_fixed(
    addr: *mut u8,
    len: usize,
    file: &File,
    sharing: Sharing,
) -> Result<()> {
    // SAFETY: MAP_FIXED only touches the caller-owned range.
    let ret = unsafe {
        libc::mmap(
            addr as *mut libc::c_void,
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            sharing.flags() | libc::MAP_FIXED,
            file.as_raw_fd(),
            0,
        )
    };
    if ret == libc::MAP_FAILED {
        return Err(Error::MapFile {
            addr: addr as usize,
            len,
            source: io::Error::last_os_error(),
        });
    }

    Ok(())
}

/// An anonymous private mapping owned by this process, unmapped on drop
/// unless it was moved somewhere else first.
#[derive(Debug)]
pub struct AnonMapping {
    addr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is plain process memory with a single owner.
unsafe impl Send for AnonMapping {}

impl AnonMapping {
    pub fn new(len: usize) -> Result<Self> {
        // SAFETY: a fresh mapping chosen by the kernel aliases nothing.
        let ret = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ret == libc::MAP_FAILED {
            return Err(Error::Anonymous(len, io::Error::last_os_error()));
        }

        let addr = NonNull::new(ret as *mut u8)
            .ok_or_else(|| Error::Anonymous(len, io::Error::from(io::ErrorKind::InvalidData)))?;
        Ok(AnonMapping { addr, len })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping is readable and lives as long as `self`.
        unsafe { std::slice::from_raw_parts(self.addr.as_ptr(), self.len) }
    }

    /// Relocates the pages to `dst` without copying them. Whatever was
    /// mapped at `dst` is replaced. On failure the pages are released.
    ///
    /// # Safety
    ///
    /// `[dst, dst + len)` must be owned by the caller.
    pub unsafe fn move_to(self, dst: *mut u8) -> Result<()> {
        // SAFETY: both ranges are owned; MREMAP_FIXED replaces `dst`.
        let ret = unsafe {
            libc::mremap(
                self.addr.as_ptr() as *mut libc::c_void,
                self.len,
                self.len,
                libc::MREMAP_MAYMOVE | libc::MREMAP_FIXED,
                dst as *mut libc::c_void,
            )
        };
        if ret == libc::MAP_FAILED {
            return Err(Error::Remap {
                addr: dst as usize,
                len: self.len,
                source: io::Error::last_os_error(),
            });
        }

        // The source range no longer exists.
        std::mem::forget(self);
        Ok(())
    }
}

impl Drop for AnonMapping {
    fn drop(&mut self) {
        // SAFETY: the mapping is owned by `self`.
        if let Err(e) = unsafe { unmap(self.addr.as_ptr(), self.len) } {
            warn!("Failed to release anonymous mapping: {e}");
        }
    }
}
