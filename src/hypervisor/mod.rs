// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The small set of hypervisor operations the launcher needs.
//!
//! `kvm_ioctls::{Kvm, VmFd, VcpuFd}` implement these traits (see [`kvm`]).
//! The session only talks to the traits, which keeps the setup state machine
//! and the exit dispatcher testable without `/dev/kvm`.

pub mod kvm;

use crate::utils::memory::{MemoryError, SharedMapping};
use kvm_bindings::kvm_userspace_memory_region;
use vmm_sys_util::errno;

/// Errors returned by the hypervisor backend.
#[derive(Debug, thiserror::Error)]
pub enum HypervisorError {
    /// Cannot open the hypervisor control device.
    #[error("{}", ({
        if .0.errno() == libc::EACCES {
            format!(
                "Error opening /dev/kvm [{}]\nMake sure the user \
                launching the teevmm process is configured on the /dev/kvm file's ACL.",
                .0
            )
        } else {
            format!("Error opening /dev/kvm. [{}]", .0)
        }
    }))]
    Open(#[source] errno::Error),
    /// Cannot create the VM file descriptor.
    #[error("Cannot create the VM file descriptor: {0}")]
    CreateVm(#[source] errno::Error),
    /// Failed to get vcpu mmap size.
    #[error("Failed to get vcpu mmap size: {0}")]
    VcpuMmapSize(#[source] errno::Error),
    /// Cannot set memory region.
    #[error("Cannot set memory region: {0}")]
    SetUserMemoryRegion(#[source] errno::Error),
    /// Cannot create the vcpu file descriptor.
    #[error("Cannot create the vcpu file descriptor: {0}")]
    CreateVcpu(#[source] errno::Error),
    /// Failed to query the preferred vcpu target.
    #[error("Failed to query the preferred vcpu target: {0}")]
    PreferredTarget(#[source] errno::Error),
    /// Failed to initialize the vcpu.
    #[error("Failed to initialize the vcpu: {0}")]
    VcpuInit(#[source] errno::Error),
    /// Failed to map the shared `kvm_run` area.
    #[error("Failed to map the vcpu run state: {0}")]
    MapRunState(#[source] MemoryError),
    /// Failed to write a vcpu register.
    #[error("Failed to set vcpu register {0:#x}: {1}")]
    SetOneReg(u64, #[source] errno::Error),
    /// The operation only exists for aarch64 guests.
    #[error("Operation '{0}' is only supported on aarch64 hosts")]
    UnsupportedArch(&'static str),
}

/// Capabilities the launcher checks for before relying on them.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Capability {
    /// `KVM_CAP_USER_MEMORY`
    UserMemory,
    /// `KVM_CAP_READONLY_MEM`
    ReadonlyMem,
    /// `KVM_CAP_ARM_PSCI_0_2`
    ArmPsci02,
    /// `KVM_CAP_ONE_REG`
    OneReg,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Capability::UserMemory => "KVM_CAP_USER_MEMORY",
            Capability::ReadonlyMem => "KVM_CAP_READONLY_MEM",
            Capability::ArmPsci02 => "KVM_CAP_ARM_PSCI_0_2",
            Capability::OneReg => "KVM_CAP_ONE_REG",
        };
        f.write_str(name)
    }
}

/// Architecture neutral copy of `struct kvm_vcpu_init`.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct VcpuInit {
    pub target: u32,
    pub features: [u32; 7],
}

/// Why the vcpu returned to the host, decoded from the shared run state.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum VmExit {
    /// The guest read from an address without backing memory.
    MmioRead { addr: u64, len: usize },
    /// The guest wrote `data` to an address without (writable) backing memory.
    MmioWrite { addr: u64, data: Vec<u8> },
    /// `KVM_EXIT_SYSTEM_EVENT` with its `type` field.
    SystemEvent(u32),
    /// `KVM_EXIT_INTR`
    Intr,
    /// `KVM_EXIT_FAIL_ENTRY` with the hardware reason and the cpu.
    FailEntry { reason: u64, cpu: u32 },
    /// `KVM_EXIT_INTERNAL_ERROR`
    InternalError,
    /// Any exit the launcher does not classify.
    Other(String),
}

/// The hypervisor control device (`/dev/kvm`).
pub trait Hypervisor {
    type Vm: HypervisorVm;

    /// Value of `KVM_GET_API_VERSION`.
    fn api_version(&self) -> i32;
    /// Number of memory slots a VM may use.
    fn max_memory_slots(&self) -> usize;
    /// Size of the area to map from a vcpu fd.
    fn run_state_size(&self) -> Result<usize, HypervisorError>;
    fn new_vm(&self) -> Result<Self::Vm, HypervisorError>;
}

/// A VM created from a [`Hypervisor`].
pub trait HypervisorVm {
    type Vcpu: HypervisorVcpu;

    fn has_capability(&self, cap: Capability) -> bool;

    /// Maps host memory into the guest physical address space.
    ///
    /// # Safety
    ///
    /// `region.userspace_addr` must point to `region.memory_size` bytes that
    /// stay mapped for as long as the VM exists.
    unsafe fn register_memory_region(
        &self,
        region: kvm_userspace_memory_region,
    ) -> Result<(), HypervisorError>;

    fn new_vcpu(&self, id: u64) -> Result<Self::Vcpu, HypervisorError>;
    fn preferred_vcpu_init(&self) -> Result<VcpuInit, HypervisorError>;
}

/// A vcpu created from a [`HypervisorVm`].
pub trait HypervisorVcpu {
    fn init_vcpu(&self, init: &VcpuInit) -> Result<(), HypervisorError>;
    /// Maps the vcpu's shared run state into the host.
    fn map_run_state(&self, size: usize) -> Result<SharedMapping, HypervisorError>;
    fn set_register(&self, id: u64, value: u64) -> Result<(), HypervisorError>;
    /// Enters the guest and blocks until it exits.
    fn resume(&mut self) -> Result<VmExit, errno::Error>;
}
