// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::utils::util::get_page_size;
use crate::vmm_config::memory_layout::{sorted_layout, MemoryLayoutError, RegionSpec};
use kvm_bindings::{kvm_userspace_memory_region, KVM_MEM_READONLY};
use vm_memory::{
    mmap::{MmapRegionBuilder, MmapRegionError},
    Address, Bytes, GuestAddress, GuestMemoryError, GuestMemoryRegion, MemoryRegionAddress,
};

pub type GuestRegionMmap = vm_memory::GuestRegionMmap;
pub type GuestMmapRegion = vm_memory::MmapRegion;

/// Errors associated with building the guest memory.
#[derive(Debug, thiserror::Error)]
pub enum GuestMemoryLayoutError {
    /// Cannot read the host page size.
    #[error("Cannot retrieve the host page size: {0}")]
    PageSize(vmm_sys_util::errno::Error),
    /// The configured layout is invalid.
    #[error("Invalid memory layout: {0}")]
    Layout(#[from] MemoryLayoutError),
    /// Cannot allocate the host buffer of a region.
    #[error("Cannot allocate host memory for region '{0}': {1}")]
    Allocate(String, MmapRegionError),
    /// The host buffer cannot be placed at the guest address.
    #[error("Cannot create guest region '{0}': {1}")]
    GuestRegion(String, vm_memory::Error),
}

/// Allocates an anonymous, shared host buffer of `size` bytes.
///
/// The mapping is owned by the returned region and unmapped when it is dropped.
pub fn create_region(size: usize) -> Result<GuestMmapRegion, MmapRegionError> {
    MmapRegionBuilder::<()>::new(size)
        .with_mmap_prot(libc::PROT_READ | libc::PROT_WRITE)
        .with_mmap_flags(libc::MAP_SHARED | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE)
        .build()
}

/// A guest physical memory region backed by a host buffer.
#[derive(Debug)]
pub struct MemoryRegion {
    name: String,
    read_only: bool,
    loadable: bool,
    mapping: GuestRegionMmap,
    slot: Option<u32>,
}

impl MemoryRegion {
    fn new(spec: &RegionSpec) -> Result<Self, GuestMemoryLayoutError> {
        let mmap = create_region(spec.size as usize)
            .map_err(|e| GuestMemoryLayoutError::Allocate(spec.name.clone(), e))?;
        let mapping = GuestRegionMmap::new(mmap, GuestAddress(spec.guest_addr))
            .map_err(|e| GuestMemoryLayoutError::GuestRegion(spec.name.clone(), e))?;
        Ok(MemoryRegion {
            name: spec.name.clone(),
            read_only: spec.read_only,
            loadable: spec.loadable,
            mapping,
            slot: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn guest_base(&self) -> GuestAddress {
        self.mapping.start_addr()
    }

    pub fn size(&self) -> u64 {
        self.mapping.len()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_loadable(&self) -> bool {
        self.loadable
    }

    /// Slot assigned when the region was registered with the VM.
    pub fn slot(&self) -> Option<u32> {
        self.slot
    }

    pub(crate) fn set_slot(&mut self, slot: u32) {
        self.slot = Some(slot);
    }

    pub fn host_address(&self) -> u64 {
        self.mapping.as_ptr() as u64
    }

    /// The `KVM_SET_USER_MEMORY_REGION` payload for this region.
    pub fn kvm_region(&self, slot: u32) -> kvm_userspace_memory_region {
        kvm_userspace_memory_region {
            slot,
            flags: if self.read_only { KVM_MEM_READONLY } else { 0 },
            guest_phys_addr: self.guest_base().raw_value(),
            memory_size: self.size(),
            userspace_addr: self.host_address(),
        }
    }

    pub fn write_slice(&self, buf: &[u8], offset: u64) -> Result<(), GuestMemoryError> {
        self.mapping.write_slice(buf, MemoryRegionAddress(offset))
    }

    pub fn read_slice(&self, buf: &mut [u8], offset: u64) -> Result<(), GuestMemoryError> {
        self.mapping.read_slice(buf, MemoryRegionAddress(offset))
    }
}

/// The guest physical memory map: regions sorted by ascending base address,
/// never overlapping.
#[derive(Debug, Default)]
pub struct GuestMemoryLayout {
    regions: Vec<MemoryRegion>,
}

impl GuestMemoryLayout {
    /// Validates `specs` and allocates one host buffer per region.
    pub fn new(specs: &[RegionSpec]) -> Result<Self, GuestMemoryLayoutError> {
        let page_size = get_page_size().map_err(GuestMemoryLayoutError::PageSize)?;
        let regions = sorted_layout(specs, page_size)?
            .iter()
            .map(MemoryRegion::new)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(GuestMemoryLayout { regions })
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut MemoryRegion> {
        self.regions.iter_mut()
    }

    pub fn num_regions(&self) -> usize {
        self.regions.len()
    }

    /// Returns the region with the greatest base that is `<= addr`.
    ///
    /// The region is not guaranteed to contain `addr`; callers bound check
    /// the offset against [`MemoryRegion::size`].
    pub fn find_region(&self, addr: GuestAddress) -> Option<&MemoryRegion> {
        self.regions.iter().rev().find(|r| r.guest_base() <= addr)
    }

    /// Like [`find_region`](Self::find_region), but only considers regions
    /// image segments may be loaded into.
    pub fn find_loadable_region(&self, addr: GuestAddress) -> Option<&MemoryRegion> {
        self.regions
            .iter()
            .rev()
            .filter(|r| r.is_loadable())
            .find(|r| r.guest_base() <= addr)
    }

    pub fn region_by_name(&self, name: &str) -> Option<&MemoryRegion> {
        self.regions.iter().find(|r| r.name() == name)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    fn small_layout() -> GuestMemoryLayout {
        GuestMemoryLayout::new(&[
            RegionSpec::new("c", 0x10_0000, 0x1000).read_only(),
            RegionSpec::new("a", 0x0, 0x4000).loadable(),
            RegionSpec::new("b", 0x8000, 0x2000).loadable(),
        ])
        .unwrap()
    }

    #[test]
    fn test_create_region() {
        let region = create_region(0x4000).unwrap();
        assert_eq!(region.size(), 0x4000);
        assert!(region.file_offset().is_none());
        assert_eq!(region.prot(), libc::PROT_READ | libc::PROT_WRITE);
    }

    #[test]
    fn test_layout_is_sorted() {
        let layout = small_layout();
        let bases: Vec<_> = layout.iter().map(|r| r.guest_base().raw_value()).collect();
        assert_eq!(bases, [0x0, 0x8000, 0x10_0000]);
        assert_eq!(layout.num_regions(), 3);
        assert!(layout.iter().all(|r| r.slot().is_none()));
        let c = layout.region_by_name("c").unwrap();
        assert!(c.is_read_only());
        assert!(!c.is_loadable());
    }

    #[test]
    fn test_find_region_returns_greatest_base_below() {
        let layout = small_layout();
        let bases = [0x0u64, 0x8000, 0x10_0000];
        for addr in [0x0u64, 0x1, 0x3fff, 0x4000, 0x7fff, 0x8000, 0x9fff, 0xa000, 0x10_0000, 0x20_0000] {
            let expected = bases.iter().filter(|b| **b <= addr).max().copied();
            let found = layout
                .find_region(GuestAddress(addr))
                .map(|r| r.guest_base().raw_value());
            assert_eq!(found, expected, "lookup of {:#x}", addr);
        }
    }

    #[test]
    fn test_find_region_below_every_base() {
        let layout = GuestMemoryLayout::new(&[RegionSpec::new("a", 0x10000, 0x1000)]).unwrap();
        assert!(layout.find_region(GuestAddress(0xffff)).is_none());
        assert!(layout.find_region(GuestAddress(0x10000)).is_some());
    }

    #[test]
    fn test_find_loadable_region_skips_other_regions() {
        let layout = small_layout();
        let region = layout.find_loadable_region(GuestAddress(0x10_0000)).unwrap();
        assert_eq!(region.name(), "b");
        assert_eq!(layout.find_region(GuestAddress(0x10_0000)).unwrap().name(), "c");
    }

    #[test]
    fn test_kvm_region() {
        let layout = small_layout();
        let c = layout.region_by_name("c").unwrap();
        let region = c.kvm_region(7);
        assert_eq!(region.slot, 7);
        assert_eq!(region.flags, KVM_MEM_READONLY);
        assert_eq!(region.guest_phys_addr, 0x10_0000);
        assert_eq!(region.memory_size, 0x1000);
        assert_eq!(region.userspace_addr, c.host_address());

        let a = layout.region_by_name("a").unwrap().kvm_region(0);
        assert_eq!(a.flags, 0);
    }

    #[test]
    fn test_read_write_slice() {
        let layout = small_layout();
        let a = layout.region_by_name("a").unwrap();
        a.write_slice(&[1, 2, 3], 0x10).unwrap();
        let mut buf = [0u8; 5];
        a.read_slice(&mut buf, 0xf).unwrap();
        assert_eq!(buf, [0, 1, 2, 3, 0]);
        assert!(a.write_slice(&[0; 2], 0x3fff).is_err());
    }

    #[test]
    fn test_layout_rejects_overlap() {
        let err = GuestMemoryLayout::new(&[
            RegionSpec::new("a", 0x0, 0x2000),
            RegionSpec::new("b", 0x1000, 0x1000),
        ])
        .unwrap_err();
        assert!(matches!(
            err,
            GuestMemoryLayoutError::Layout(MemoryLayoutError::Overlap(_, _))
        ));
    }
}
