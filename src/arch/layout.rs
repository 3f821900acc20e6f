// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Guest physical memory map.
//!
//! ```text
//!  +----------------------------------+ <-- 0x00000000
//!  | ROM (image code)                 |
//!  +----------------------------------+ <-- 0x00a00000
//!
//!  +----------------------------------+ <-- 0x0e100000
//!  | Secure RAM (image data)          |
//!  +----------------------------------+ <-- 0x0f000000
//!
//!  +----------------------------------+ <-- 0x10000000
//!  | MMIO probe (read-only slot)      |
//!  +----------------------------------+ <-- 0x10001000
//!
//!  +----------------------------------+ <-- 0x42000000
//!  | Non-secure static SHM            |
//!  +----------------------------------+ <-- 0x42200000
//! ```
//!
//! Guest writes to the MMIO probe hit a read-only memslot and come back to
//! the host as MMIO exits.

use crate::vmm_config::memory_layout::RegionSpec;

pub const ROM_START: u64 = 0x0000_0000;
pub const ROM_SIZE: u64 = 0x00a0_0000;

pub const RAM_START: u64 = 0x0e10_0000;
pub const RAM_SIZE: u64 = 0x00f0_0000;

pub const MMIO_PROBE_START: u64 = 0x1000_0000;
pub const MMIO_PROBE_SIZE: u64 = 0x1000;

pub const SHM_START: u64 = 0x4200_0000;
pub const SHM_SIZE: u64 = 0x0020_0000;

pub fn default_memory_layout() -> Vec<RegionSpec> {
    vec![
        RegionSpec::new("rom", ROM_START, ROM_SIZE).loadable(),
        RegionSpec::new("ram", RAM_START, RAM_SIZE).loadable(),
        RegionSpec::new("mmio", MMIO_PROBE_START, MMIO_PROBE_SIZE).read_only(),
        RegionSpec::new("shm", SHM_START, SHM_SIZE),
    ]
}
