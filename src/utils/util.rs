// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

pub use vmm_sys_util::errno;

pub fn get_page_size() -> Result<usize, errno::Error> {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        -1 => Err(errno::Error::last()),
        ps => Ok(ps as usize),
    }
}

/// Returns true when `value` is a multiple of the host page size.
pub fn is_page_aligned(value: u64, page_size: usize) -> bool {
    value & (page_size as u64 - 1) == 0
}
