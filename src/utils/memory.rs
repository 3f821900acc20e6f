// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::os::unix::io::RawFd;
use std::result::Result;

use vm_memory::{mmap::MmapRegionError, MmapRegion};

/// Errors associated with operations on memory.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// Genral error on I/O operation.
    #[error("General error on I/O operation: {0}")]
    Os(#[from] std::io::Error),
    /// Memory region for vm build error.
    #[error("Memory region for vm build error: {0}")]
    BuildMmapRegion(MmapRegionError),
}

/// A `MAP_SHARED` mapping created outside of vm-memory.
///
/// `MmapRegion::build_raw` does not take ownership of the pages, so the
/// mapping is released here when the value is dropped.
#[derive(Debug)]
pub struct SharedMapping {
    region: MmapRegion,
}

impl SharedMapping {
    pub fn size(&self) -> usize {
        self.region.size()
    }

    #[cfg(test)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.region.as_ptr()
    }
}

impl Drop for SharedMapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.region.as_ptr() as *mut libc::c_void, self.region.size());
        }
    }
}

fn map_shared(
    size: usize,
    fd: RawFd,
    offset: i64,
    extra_flags: i32,
) -> Result<SharedMapping, MemoryError> {
    let prot = libc::PROT_READ | libc::PROT_WRITE;
    let flags = libc::MAP_SHARED | libc::MAP_POPULATE | extra_flags;

    let ptr = unsafe { libc::mmap(std::ptr::null_mut(), size, prot, flags, fd, offset) };
    if ptr == libc::MAP_FAILED {
        return Err(MemoryError::Os(std::io::Error::last_os_error()));
    }
    match unsafe { MmapRegion::build_raw(ptr as *mut u8, size, prot, flags) } {
        Ok(region) => Ok(SharedMapping { region }),
        Err(e) => {
            unsafe { libc::munmap(ptr, size) };
            Err(MemoryError::BuildMmapRegion(e))
        }
    }
}

/// Maps `size` bytes of `fd` starting at `offset`, e.g. the `kvm_run` area of a vcpu.
pub(crate) fn mmap(size: usize, fd: RawFd, offset: i64) -> Result<SharedMapping, MemoryError> {
    map_shared(size, fd, offset, 0)
}

/// Maps `size` zeroed bytes that are not backed by any file.
#[cfg(test)]
pub fn mmap_anonymous(size: usize) -> Result<SharedMapping, MemoryError> {
    map_shared(size, -1, 0, libc::MAP_ANONYMOUS)
}
