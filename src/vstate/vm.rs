// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::hypervisor::{Capability, Hypervisor, HypervisorError, HypervisorVm};
use crate::vstate::memory::GuestMemoryLayout;
use log::debug;

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// Cannot create the VM.
    #[error("Cannot create the VM: {0}")]
    VmFd(#[source] HypervisorError),
    /// A capability the launcher relies on is missing.
    #[error("Extension '{0}' not available")]
    MissingCapability(Capability),
    /// The number of configured slots is bigger than maximum reported by KVM.
    #[error("The number of memory regions ({0}) is bigger than the maximum reported by KVM ({1})")]
    NotEnoughMemorySlots(usize, usize),
    /// Cannot set memory region.
    #[error("Cannot register memory region '{0}': {1}")]
    SetUserMemoryRegion(String, #[source] HypervisorError),
}

/// A VM and the memory slots handed out for it.
pub struct Vm<M: HypervisorVm> {
    fd: M,
    max_memslots: usize,
    next_slot: u32,
}

impl<M: HypervisorVm> Vm<M> {
    pub fn new<H: Hypervisor<Vm = M>>(hypervisor: &H) -> Result<Self, VmError> {
        let fd = hypervisor.new_vm().map_err(VmError::VmFd)?;
        Ok(Vm {
            fd,
            max_memslots: hypervisor.max_memory_slots(),
            next_slot: 0,
        })
    }

    /// Fails unless the VM reports `cap`.
    pub fn require(&self, cap: Capability) -> Result<(), VmError> {
        if self.fd.has_capability(cap) {
            Ok(())
        } else {
            Err(VmError::MissingCapability(cap))
        }
    }

    /// Hands out the next slot id. Slot ids are never reused.
    fn allocate_slot(&mut self) -> u32 {
        let slot = self.next_slot;
        self.next_slot += 1;
        slot
    }

    /// Registers every region of `guest_mem` with the VM, in address order.
    ///
    /// The VM must be dropped before `guest_mem`.
    pub fn memory_init(&mut self, guest_mem: &mut GuestMemoryLayout) -> Result<(), VmError> {
        self.require(Capability::UserMemory)?;
        if guest_mem.num_regions() > self.max_memslots {
            return Err(VmError::NotEnoughMemorySlots(
                guest_mem.num_regions(),
                self.max_memslots,
            ));
        }
        for region in guest_mem.iter_mut() {
            if region.is_read_only() {
                // writes to this region turn into MMIO exits
                self.require(Capability::ReadonlyMem)?;
            }
            let slot = self.allocate_slot();
            let memory_region = region.kvm_region(slot);
            // The session owns both the VM and the layout and drops the VM first.
            unsafe { self.fd.register_memory_region(memory_region) }
                .map_err(|e| VmError::SetUserMemoryRegion(region.name().to_string(), e))?;
            region.set_slot(slot);
            debug!(
                "Registered region '{}' in slot {}: guest {:#010x}, size {:#x}, host {:#x}{}",
                region.name(),
                slot,
                memory_region.guest_phys_addr,
                memory_region.memory_size,
                memory_region.userspace_addr,
                if region.is_read_only() { " (read-only)" } else { "" },
            );
        }
        Ok(())
    }

    pub fn fd(&self) -> &M {
        &self.fd
    }
}
