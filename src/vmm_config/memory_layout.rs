// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::utils::util::is_page_aligned;
use serde::{Deserialize, Serialize};

/// Errors associated with actions on `RegionSpec`.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MemoryLayoutError {
    /// The memory layout has no regions.
    #[error("The memory layout is empty.")]
    Empty,
    /// A region has a size of zero.
    #[error("The size of region '{0}' is zero.")]
    ZeroSize(String),
    /// A region ends past the guest physical address space.
    #[error("Region '{0}' overflows the guest physical address space.")]
    Overflow(String),
    /// A region base or size is not a multiple of the host page size.
    #[error("Region '{0}' is not aligned to the host page size.")]
    Unaligned(String),
    /// Two regions share guest physical addresses.
    #[error("Region '{0}' overlaps region '{1}'.")]
    Overlap(String, String),
}

/// One entry of the guest physical memory map, as found in the configuration file.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct RegionSpec {
    /// Name used in log output.
    pub name: String,
    /// Guest physical base address.
    pub guest_addr: u64,
    /// Size in bytes.
    pub size: u64,
    /// Registered with `KVM_MEM_READONLY`; guest writes turn into MMIO exits.
    #[serde(default)]
    pub read_only: bool,
    /// Image segments may be copied into this region.
    #[serde(default)]
    pub loadable: bool,
}

impl RegionSpec {
    pub fn new(name: &str, guest_addr: u64, size: u64) -> Self {
        RegionSpec {
            name: name.to_string(),
            guest_addr,
            size,
            read_only: false,
            loadable: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn loadable(mut self) -> Self {
        self.loadable = true;
        self
    }

    /// First guest address past the region, or `None` on overflow.
    pub fn end(&self) -> Option<u64> {
        self.guest_addr.checked_add(self.size)
    }
}

/// Validates `specs` and returns them sorted by ascending guest address.
///
/// Address lookups walk this order backwards, so the order is part of the
/// table's contract and is never left to the caller.
pub fn sorted_layout(
    specs: &[RegionSpec],
    page_size: usize,
) -> Result<Vec<RegionSpec>, MemoryLayoutError> {
    if specs.is_empty() {
        return Err(MemoryLayoutError::Empty);
    }
    for spec in specs {
        if spec.size == 0 {
            return Err(MemoryLayoutError::ZeroSize(spec.name.clone()));
        }
        if spec.end().is_none() {
            return Err(MemoryLayoutError::Overflow(spec.name.clone()));
        }
        if !is_page_aligned(spec.guest_addr, page_size) || !is_page_aligned(spec.size, page_size)
        {
            return Err(MemoryLayoutError::Unaligned(spec.name.clone()));
        }
    }

    let mut sorted = specs.to_vec();
    sorted.sort_by_key(|spec| spec.guest_addr);
    for pair in sorted.windows(2) {
        // end() was checked above
        let prev_end = pair[0].guest_addr + pair[0].size;
        if prev_end > pair[1].guest_addr {
            return Err(MemoryLayoutError::Overlap(
                pair[1].name.clone(),
                pair[0].name.clone(),
            ));
        }
    }
    Ok(sorted)
}
