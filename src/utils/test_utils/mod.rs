// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::hypervisor::{
    Capability, Hypervisor, HypervisorError, HypervisorVcpu, HypervisorVm, VcpuInit, VmExit,
};
use crate::loader::{ImageError, ImageSource, Segment};
use crate::utils::memory::{mmap_anonymous, SharedMapping};
use kvm_bindings::kvm_userspace_memory_region;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use vm_memory::GuestAddress;
use vmm_sys_util::errno;

/// An image kept in memory, recording how the loader drives it.
#[derive(Debug, Default)]
pub struct VecImage {
    entry: u64,
    segments: Vec<(u64, Vec<u8>)>,
    pending: VecDeque<Segment>,
    pub opened_with: Option<String>,
    pub closed: bool,
    pub fail_open: bool,
}

impl VecImage {
    pub fn new(entry: u64, segments: Vec<(u64, Vec<u8>)>) -> Self {
        VecImage {
            entry,
            segments,
            ..Default::default()
        }
    }
}

impl ImageSource for VecImage {
    fn open(&mut self, name: &str) -> Result<(), ImageError> {
        if self.fail_open {
            return Err(ImageError::NotOpen);
        }
        self.opened_with = Some(name.to_string());
        self.closed = false;
        self.pending = self
            .segments
            .iter()
            .map(|(addr, data)| Segment::new(data.clone(), GuestAddress(*addr)))
            .collect();
        Ok(())
    }

    fn has_next_segment(&self) -> bool {
        !self.pending.is_empty()
    }

    fn next_segment(&mut self) -> Result<Segment, ImageError> {
        self.pending.pop_front().ok_or(ImageError::NoMoreSegments)
    }

    fn entry_address(&self) -> GuestAddress {
        GuestAddress(self.entry)
    }

    fn close(&mut self) {
        self.pending.clear();
        self.closed = true;
    }
}

/// One `PT_LOAD` entry for [`build_elf`].
pub struct ElfSegment {
    pub paddr: u64,
    pub data: Vec<u8>,
    pub mem_size: u64,
}

/// Builds a little-endian aarch64 ELF64 executable with one program header
/// per segment and no section headers.
pub fn build_elf(entry: u64, segments: &[ElfSegment]) -> Vec<u8> {
    const EHDR_SIZE: usize = 64;
    const PHDR_SIZE: usize = 56;

    let phnum = segments.len();
    let mut elf = Vec::new();
    elf.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
    elf.extend_from_slice(&[0; 8]);
    elf.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    elf.extend_from_slice(&183u16.to_le_bytes()); // EM_AARCH64
    elf.extend_from_slice(&1u32.to_le_bytes());
    elf.extend_from_slice(&entry.to_le_bytes());
    let phoff = if phnum > 0 { EHDR_SIZE as u64 } else { 0 };
    elf.extend_from_slice(&phoff.to_le_bytes());
    elf.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
    elf.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    elf.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
    elf.extend_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
    elf.extend_from_slice(&(phnum as u16).to_le_bytes());
    elf.extend_from_slice(&64u16.to_le_bytes()); // e_shentsize
    elf.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
    elf.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx

    let mut offset = (EHDR_SIZE + phnum * PHDR_SIZE) as u64;
    for segment in segments {
        let file_size = segment.data.len() as u64;
        elf.extend_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        elf.extend_from_slice(&5u32.to_le_bytes()); // PF_R | PF_X
        elf.extend_from_slice(&offset.to_le_bytes());
        elf.extend_from_slice(&segment.paddr.to_le_bytes()); // p_vaddr
        elf.extend_from_slice(&segment.paddr.to_le_bytes());
        elf.extend_from_slice(&file_size.to_le_bytes());
        elf.extend_from_slice(&segment.mem_size.to_le_bytes());
        elf.extend_from_slice(&0x1000u64.to_le_bytes());
        offset += file_size;
    }
    for segment in segments {
        elf.extend_from_slice(&segment.data);
    }
    elf
}

/// Everything the mock backend is configured with or has been asked to do.
#[derive(Debug)]
pub struct MockState {
    pub api_version: i32,
    pub max_memory_slots: usize,
    pub run_state_size: usize,
    pub capabilities: Vec<Capability>,
    pub preferred_init: VcpuInit,
    pub fail_register_at_slot: Option<u32>,

    pub vms_created: usize,
    pub vcpus_created: Vec<u64>,
    pub registered: Vec<kvm_userspace_memory_region>,
    pub vcpu_init: Option<VcpuInit>,
    pub registers: Vec<(u64, u64)>,
    pub exits: VecDeque<Result<VmExit, errno::Error>>,
    pub resumes: usize,
    /// Mock handles in the order they were dropped.
    pub dropped: Vec<&'static str>,
}

impl Default for MockState {
    fn default() -> Self {
        MockState {
            api_version: crate::arch::KVM_API_VERSION,
            max_memory_slots: 32,
            run_state_size: std::mem::size_of::<kvm_bindings::kvm_run>().max(0x3000),
            capabilities: vec![
                Capability::UserMemory,
                Capability::ReadonlyMem,
                Capability::ArmPsci02,
                Capability::OneReg,
            ],
            preferred_init: VcpuInit {
                target: 5,
                features: [0; 7],
            },
            fail_register_at_slot: None,
            vms_created: 0,
            vcpus_created: Vec::new(),
            registered: Vec::new(),
            vcpu_init: None,
            registers: Vec::new(),
            exits: VecDeque::new(),
            resumes: 0,
            dropped: Vec::new(),
        }
    }
}

pub type SharedMockState = Rc<RefCell<MockState>>;

fn record_drop(state: &SharedMockState, handle: &'static str) {
    if let Ok(mut state) = state.try_borrow_mut() {
        state.dropped.push(handle);
    }
}

/// A hypervisor that answers from a [`MockState`] shared with the test.
#[derive(Debug, Default)]
pub struct MockHypervisor {
    state: SharedMockState,
}

impl MockHypervisor {
    pub fn new() -> Self {
        Default::default()
    }

    /// Handle kept by the test after the hypervisor is moved into a session.
    pub fn state(&self) -> SharedMockState {
        self.state.clone()
    }

    pub fn with_api_version(self, version: i32) -> Self {
        self.state.borrow_mut().api_version = version;
        self
    }

    pub fn with_max_memory_slots(self, slots: usize) -> Self {
        self.state.borrow_mut().max_memory_slots = slots;
        self
    }

    pub fn with_run_state_size(self, size: usize) -> Self {
        self.state.borrow_mut().run_state_size = size;
        self
    }

    pub fn without_capability(self, cap: Capability) -> Self {
        self.state.borrow_mut().capabilities.retain(|c| *c != cap);
        self
    }

    pub fn failing_registration_at(self, slot: u32) -> Self {
        self.state.borrow_mut().fail_register_at_slot = Some(slot);
        self
    }

    pub fn with_exits(self, exits: Vec<Result<VmExit, errno::Error>>) -> Self {
        self.state.borrow_mut().exits.extend(exits);
        self
    }
}

impl Drop for MockHypervisor {
    fn drop(&mut self) {
        record_drop(&self.state, "hypervisor");
    }
}

impl Hypervisor for MockHypervisor {
    type Vm = MockVm;

    fn api_version(&self) -> i32 {
        self.state.borrow().api_version
    }

    fn max_memory_slots(&self) -> usize {
        self.state.borrow().max_memory_slots
    }

    fn run_state_size(&self) -> Result<usize, HypervisorError> {
        Ok(self.state.borrow().run_state_size)
    }

    fn new_vm(&self) -> Result<MockVm, HypervisorError> {
        self.state.borrow_mut().vms_created += 1;
        Ok(MockVm {
            state: self.state.clone(),
        })
    }
}

#[derive(Debug)]
pub struct MockVm {
    state: SharedMockState,
}

impl Drop for MockVm {
    fn drop(&mut self) {
        record_drop(&self.state, "vm");
    }
}

impl HypervisorVm for MockVm {
    type Vcpu = MockVcpu;

    fn has_capability(&self, cap: Capability) -> bool {
        self.state.borrow().capabilities.contains(&cap)
    }

    unsafe fn register_memory_region(
        &self,
        region: kvm_userspace_memory_region,
    ) -> Result<(), HypervisorError> {
        let mut state = self.state.borrow_mut();
        if state.fail_register_at_slot == Some(region.slot) {
            return Err(HypervisorError::SetUserMemoryRegion(errno::Error::new(
                libc::EINVAL,
            )));
        }
        state.registered.push(region);
        Ok(())
    }

    fn new_vcpu(&self, id: u64) -> Result<MockVcpu, HypervisorError> {
        self.state.borrow_mut().vcpus_created.push(id);
        Ok(MockVcpu {
            state: self.state.clone(),
        })
    }

    fn preferred_vcpu_init(&self) -> Result<VcpuInit, HypervisorError> {
        Ok(self.state.borrow().preferred_init)
    }
}

#[derive(Debug)]
pub struct MockVcpu {
    state: SharedMockState,
}

impl Drop for MockVcpu {
    fn drop(&mut self) {
        record_drop(&self.state, "vcpu");
    }
}

impl HypervisorVcpu for MockVcpu {
    fn init_vcpu(&self, init: &VcpuInit) -> Result<(), HypervisorError> {
        self.state.borrow_mut().vcpu_init = Some(*init);
        Ok(())
    }

    fn map_run_state(&self, size: usize) -> Result<SharedMapping, HypervisorError> {
        mmap_anonymous(size).map_err(HypervisorError::MapRunState)
    }

    fn set_register(&self, id: u64, value: u64) -> Result<(), HypervisorError> {
        self.state.borrow_mut().registers.push((id, value));
        Ok(())
    }

    fn resume(&mut self) -> Result<VmExit, errno::Error> {
        let mut state = self.state.borrow_mut();
        state.resumes += 1;
        state
            .exits
            .pop_front()
            .unwrap_or_else(|| Err(errno::Error::new(libc::EINTR)))
    }
}
