// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

pub mod exit;

use crate::{
    arch::aarch64,
    hypervisor::{
        Capability, Hypervisor, HypervisorError, HypervisorVcpu, HypervisorVm, VcpuInit, VmExit,
    },
    utils::memory::SharedMapping,
    vstate::vm::{Vm, VmError},
};
use kvm_bindings::kvm_run;
use log::info;
use vm_memory::{Address, GuestAddress};
use vmm_sys_util::errno;

/// Errors associated with actions on vcpu.
#[derive(Debug, thiserror::Error)]
pub enum VcpuError {
    /// Cannot open the vcpu file descriptor.
    #[error("Cannot open the vcpu file descriptor: {0}")]
    VcpuFd(#[source] HypervisorError),
    /// Failed to get the preferred vcpu target.
    #[error("{0}")]
    PreferredTarget(#[source] HypervisorError),
    /// A capability the vcpu setup relies on is missing.
    #[error("{0}")]
    Capability(#[source] VmError),
    /// Failed to initialize the vcpu.
    #[error("{0}")]
    VcpuInit(#[source] HypervisorError),
    /// Failed to get vcpu mmap size.
    #[error("{0}")]
    VcpuMmapSize(#[source] HypervisorError),
    /// The vcpu mmap size is smaller than `struct kvm_run`.
    #[error("KVM_GET_VCPU_MMAP_SIZE unexpectedly small: {0} < {1}")]
    VcpuMmapTooSmall(usize, usize),
    /// Failed to execute mmap.
    #[error("{0}")]
    VcpuMmapError(#[source] HypervisorError),
    /// Failed to set the program counter.
    #[error("{0}")]
    SetProgramCounter(#[source] HypervisorError),
}

pub struct Vcpu<V: HypervisorVcpu> {
    /// The vcpu's `kvm_run` area, mapped once the vcpu is initialized.
    /// Declared first so it is unmapped before the vcpu fd is closed.
    ///
    /// Never read. kvm-ioctls maps its own copy for `VcpuFd::run`; this one
    /// only proves the reported size can be mapped.
    run_state: Option<SharedMapping>,
    fd: V,
}

impl<V: HypervisorVcpu> Vcpu<V> {
    pub fn new<M: HypervisorVm<Vcpu = V>>(index: u64, vm: &Vm<M>) -> Result<Self, VcpuError> {
        let fd = vm.fd().new_vcpu(index).map_err(VcpuError::VcpuFd)?;
        Ok(Vcpu {
            run_state: None,
            fd,
        })
    }

    /// Initializes the vcpu with the host's preferred target and PSCI v0.2,
    /// which the guest uses to power itself off.
    pub fn configure<M: HypervisorVm<Vcpu = V>>(
        &self,
        vm: &Vm<M>,
    ) -> Result<VcpuInit, VcpuError> {
        info!("Retrieving physical CPU information");
        let mut init = vm
            .fd()
            .preferred_vcpu_init()
            .map_err(VcpuError::PreferredTarget)?;
        vm.require(Capability::ArmPsci02)
            .map_err(VcpuError::Capability)?;
        aarch64::enable_psci(&mut init);

        info!("Initializing VCPU");
        self.fd.init_vcpu(&init).map_err(VcpuError::VcpuInit)?;
        Ok(init)
    }

    /// Maps the shared run state of the vcpu.
    ///
    /// 1. Get the vcpu mmap size from KVM
    /// > ioctl(kvm_fd, KVM_GET_VCPU_MMAP_SIZE, NULL)
    ///
    /// 2. Map `struct kvm_run` (created by KVM_CREATE_VCPU in the host kernel)
    ///    into the process
    /// > mmap(NULL, mmap_size, PROT_READ | PROT_WRITE, MAP_SHARED | MAP_POPULATE, vcpu_fd, 0)
    pub fn setup_run_state<H: Hypervisor>(&mut self, hypervisor: &H) -> Result<(), VcpuError> {
        let mmap_size = hypervisor
            .run_state_size()
            .map_err(VcpuError::VcpuMmapSize)?;
        let min_size = std::mem::size_of::<kvm_run>();
        if mmap_size < min_size {
            return Err(VcpuError::VcpuMmapTooSmall(mmap_size, min_size));
        }
        let run_state = self
            .fd
            .map_run_state(mmap_size)
            .map_err(VcpuError::VcpuMmapError)?;
        self.run_state = Some(run_state);
        Ok(())
    }

    /// Points the program counter at `entry_addr`.
    pub fn set_entry_point<M: HypervisorVm<Vcpu = V>>(
        &self,
        vm: &Vm<M>,
        entry_addr: GuestAddress,
    ) -> Result<(), VcpuError> {
        vm.require(Capability::OneReg)
            .map_err(VcpuError::Capability)?;
        info!(
            "Setting program counter to entry address {:#010x}",
            entry_addr.raw_value()
        );
        self.fd
            .set_register(aarch64::PC_REG_ID, entry_addr.raw_value())
            .map_err(VcpuError::SetProgramCounter)
    }

    /// Size of the mapped run state, if it is mapped.
    pub fn run_state_size(&self) -> Option<usize> {
        self.run_state.as_ref().map(SharedMapping::size)
    }

    /// Enters the guest. Blocks until the guest exits; there is no timeout.
    pub fn run(&mut self) -> Result<VmExit, errno::Error> {
        self.fd.resume()
    }

    pub fn fd(&self) -> &V {
        &self.fd
    }
}
