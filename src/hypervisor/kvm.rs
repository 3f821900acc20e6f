// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::{
    Capability, Hypervisor, HypervisorError, HypervisorVcpu, HypervisorVm, VcpuInit, VmExit,
};
use crate::utils::memory::{self, SharedMapping};
use kvm_bindings::kvm_userspace_memory_region;
use kvm_ioctls::{Cap, Kvm, VcpuExit, VcpuFd, VmFd};
use std::os::unix::io::AsRawFd;
use vmm_sys_util::errno;

/// Opens `/dev/kvm`.
pub fn open_kvm() -> Result<Kvm, HypervisorError> {
    Kvm::new().map_err(HypervisorError::Open)
}

impl Hypervisor for Kvm {
    type Vm = VmFd;

    fn api_version(&self) -> i32 {
        self.get_api_version()
    }

    fn max_memory_slots(&self) -> usize {
        self.get_nr_memslots()
    }

    fn run_state_size(&self) -> Result<usize, HypervisorError> {
        self.get_vcpu_mmap_size()
            .map_err(HypervisorError::VcpuMmapSize)
    }

    fn new_vm(&self) -> Result<VmFd, HypervisorError> {
        // > ioctl(kvm_fd, KVM_CREATE_VM, 0)
        // The returned VmFd closes the fd when dropped.
        self.create_vm().map_err(HypervisorError::CreateVm)
    }
}

impl HypervisorVm for VmFd {
    type Vcpu = VcpuFd;

    fn has_capability(&self, cap: Capability) -> bool {
        let cap = match cap {
            Capability::UserMemory => Cap::UserMemory,
            Capability::ReadonlyMem => Cap::ReadonlyMem,
            Capability::OneReg => Cap::OneReg,
            #[cfg(target_arch = "aarch64")]
            Capability::ArmPsci02 => Cap::ArmPsci02,
            #[cfg(not(target_arch = "aarch64"))]
            Capability::ArmPsci02 => return false,
        };
        self.check_extension(cap)
    }

    unsafe fn register_memory_region(
        &self,
        region: kvm_userspace_memory_region,
    ) -> Result<(), HypervisorError> {
        // > ioctl(vm_fd, KVM_SET_USER_MEMORY_REGION, &region)
        self.set_user_memory_region(region)
            .map_err(HypervisorError::SetUserMemoryRegion)
    }

    fn new_vcpu(&self, id: u64) -> Result<VcpuFd, HypervisorError> {
        // > ioctl(vm_fd, KVM_CREATE_VCPU, id)
        self.create_vcpu(id).map_err(HypervisorError::CreateVcpu)
    }

    #[cfg(target_arch = "aarch64")]
    fn preferred_vcpu_init(&self) -> Result<VcpuInit, HypervisorError> {
        let mut kvi = kvm_bindings::kvm_vcpu_init::default();
        self.get_preferred_target(&mut kvi)
            .map_err(HypervisorError::PreferredTarget)?;
        Ok(VcpuInit {
            target: kvi.target,
            features: kvi.features,
        })
    }

    #[cfg(not(target_arch = "aarch64"))]
    fn preferred_vcpu_init(&self) -> Result<VcpuInit, HypervisorError> {
        Err(HypervisorError::UnsupportedArch("KVM_ARM_PREFERRED_TARGET"))
    }
}

impl HypervisorVcpu for VcpuFd {
    #[cfg(target_arch = "aarch64")]
    fn init_vcpu(&self, init: &VcpuInit) -> Result<(), HypervisorError> {
        let kvi = kvm_bindings::kvm_vcpu_init {
            target: init.target,
            features: init.features,
        };
        self.vcpu_init(&kvi).map_err(HypervisorError::VcpuInit)
    }

    #[cfg(not(target_arch = "aarch64"))]
    fn init_vcpu(&self, _init: &VcpuInit) -> Result<(), HypervisorError> {
        Err(HypervisorError::UnsupportedArch("KVM_ARM_VCPU_INIT"))
    }

    fn map_run_state(&self, size: usize) -> Result<SharedMapping, HypervisorError> {
        // Second mapping of the area `VcpuFd` already maps; used only to check the size.
        // > mmap(NULL, size, PROT_READ | PROT_WRITE, MAP_SHARED | MAP_POPULATE, vcpu_fd, 0)
        memory::mmap(size, self.as_raw_fd(), 0).map_err(HypervisorError::MapRunState)
    }

    #[cfg(target_arch = "aarch64")]
    fn set_register(&self, id: u64, value: u64) -> Result<(), HypervisorError> {
        self.set_one_reg(id, &value.to_le_bytes())
            .map(|_| ())
            .map_err(|e| HypervisorError::SetOneReg(id, e))
    }

    #[cfg(not(target_arch = "aarch64"))]
    fn set_register(&self, _id: u64, _value: u64) -> Result<(), HypervisorError> {
        Err(HypervisorError::UnsupportedArch("KVM_SET_ONE_REG"))
    }

    fn resume(&mut self) -> Result<VmExit, errno::Error> {
        let exit = match self.run()? {
            VcpuExit::MmioRead(addr, data) => VmExit::MmioRead {
                addr,
                len: data.len(),
            },
            VcpuExit::MmioWrite(addr, data) => VmExit::MmioWrite {
                addr,
                data: data.to_vec(),
            },
            VcpuExit::SystemEvent(event_type, _) => VmExit::SystemEvent(event_type),
            VcpuExit::Intr => VmExit::Intr,
            VcpuExit::FailEntry(reason, cpu) => VmExit::FailEntry { reason, cpu },
            VcpuExit::InternalError => VmExit::InternalError,
            other => VmExit::Other(format!("{:?}", other)),
        };
        Ok(exit)
    }
}
