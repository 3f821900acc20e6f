// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The launcher's single owned session: hypervisor handle, VM, memory and vcpu.

use crate::{
    arch::{BOOT_VCPU_ID, KVM_API_VERSION},
    hypervisor::{kvm::open_kvm, Hypervisor, HypervisorError, HypervisorVm},
    loader::{self, ImageSource, LoadError},
    vmm_config::memory_layout::RegionSpec,
    vstate::{
        memory::{GuestMemoryLayout, GuestMemoryLayoutError},
        vcpu::{
            exit::{handle_exit, ExitOutcome},
            Vcpu, VcpuError,
        },
        vm::{Vm, VmError},
    },
};
use kvm_ioctls::Kvm;
use log::{error, info};
use vm_memory::{Address, GuestAddress};

type VcpuOf<H> = <<H as Hypervisor>::Vm as HypervisorVm>::Vcpu;

/// Lifecycle of a [`VmSession`]. Setup steps only move forward.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionState {
    Uninitialized,
    DeviceOpen,
    VmCreated,
    MemoryRegistered,
    ImageLoaded,
    VcpuReady,
    Running,
    Exited,
    Closed,
}

/// Errors associated with setting up or running the session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Cannot open the hypervisor.
    #[error("{0}")]
    Hypervisor(#[source] HypervisorError),
    /// The hypervisor speaks another API version.
    #[error("KVM API version mismatch: expected {expected}, got {actual}")]
    ApiVersion { expected: i32, actual: i32 },
    /// VM error.
    #[error("Vm error: {0}")]
    Vm(#[source] VmError),
    /// The guest memory cannot be built.
    #[error("Cannot build the guest memory: {0}")]
    Memory(#[source] GuestMemoryLayoutError),
    /// The image cannot be loaded.
    #[error("Cannot load the guest image: {0}")]
    Load(#[source] LoadError),
    /// Vcpu error.
    #[error("Vcpu error: {0}")]
    Vcpu(#[source] VcpuError),
    /// An operation was called out of order.
    #[error("Cannot {operation} in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
}

/// A single-vcpu guest and every resource acquired for it.
///
/// Resources are released in reverse acquisition order, exactly once, by
/// [`close`](Self::close) or on drop.
pub struct VmSession<H: Hypervisor> {
    // Drop order: vcpu (with its run state), vm, device, guest memory.
    vcpu: Option<Vcpu<VcpuOf<H>>>,
    vm: Option<Vm<H::Vm>>,
    hypervisor: Option<H>,
    memory: Option<GuestMemoryLayout>,
    entry_addr: Option<GuestAddress>,
    state: SessionState,
}

impl VmSession<Kvm> {
    /// Opens `/dev/kvm` and checks its API version.
    pub fn open_device(&mut self) -> Result<(), SessionError> {
        self.expect_state(SessionState::Uninitialized, "open the hypervisor")?;
        info!("Opening /dev/kvm");
        let kvm = open_kvm().map_err(SessionError::Hypervisor)?;
        self.open_with(kvm)
    }
}

impl<H: Hypervisor> Default for VmSession<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Hypervisor> VmSession<H> {
    pub fn new() -> Self {
        VmSession {
            vcpu: None,
            vm: None,
            hypervisor: None,
            memory: None,
            entry_addr: None,
            state: SessionState::Uninitialized,
        }
    }

    /// Opens a session on an already opened hypervisor.
    pub fn with_hypervisor(hypervisor: H) -> Result<Self, SessionError> {
        let mut session = Self::new();
        session.open_with(hypervisor)?;
        Ok(session)
    }

    /// Runs every setup step, leaving the session ready to [`step`](Self::step).
    pub fn setup<I: ImageSource + ?Sized>(
        hypervisor: H,
        layout: &[RegionSpec],
        image: &mut I,
        image_name: &str,
    ) -> Result<Self, SessionError> {
        let mut session = Self::with_hypervisor(hypervisor)?;
        session.create_vm()?;
        session.register_memory(layout)?;
        session.load_image(image, image_name)?;
        session.setup_vcpu()?;
        Ok(session)
    }

    fn expect_state(
        &self,
        expected: SessionState,
        operation: &'static str,
    ) -> Result<(), SessionError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn invalid_state(&self, operation: &'static str) -> SessionError {
        SessionError::InvalidState {
            operation,
            state: self.state,
        }
    }

    /// Takes ownership of `hypervisor` once its API version is the expected one.
    pub fn open_with(&mut self, hypervisor: H) -> Result<(), SessionError> {
        self.expect_state(SessionState::Uninitialized, "open the hypervisor")?;
        let actual = hypervisor.api_version();
        if actual != KVM_API_VERSION {
            return Err(SessionError::ApiVersion {
                expected: KVM_API_VERSION,
                actual,
            });
        }
        info!("KVM API version: {}", actual);
        self.hypervisor = Some(hypervisor);
        self.state = SessionState::DeviceOpen;
        Ok(())
    }

    pub fn create_vm(&mut self) -> Result<(), SessionError> {
        self.expect_state(SessionState::DeviceOpen, "create the VM")?;
        let hypervisor = self
            .hypervisor
            .as_ref()
            .ok_or_else(|| self.invalid_state("create the VM"))?;
        info!("Creating VM");
        let vm = Vm::new(hypervisor).map_err(SessionError::Vm)?;
        self.vm = Some(vm);
        self.state = SessionState::VmCreated;
        Ok(())
    }

    /// Allocates the guest memory described by `layout` and registers it with the VM.
    ///
    /// A failed registration closes the session.
    pub fn register_memory(&mut self, layout: &[RegionSpec]) -> Result<(), SessionError> {
        self.expect_state(SessionState::VmCreated, "register guest memory")?;
        info!("Creating guest memory");
        // Stored before registration so the buffers outlive the VM on error.
        let memory = self
            .memory
            .insert(GuestMemoryLayout::new(layout).map_err(SessionError::Memory)?);
        let vm = self.vm.as_mut().ok_or(SessionError::InvalidState {
            operation: "register guest memory",
            state: self.state,
        })?;
        if let Err(e) = vm.memory_init(memory) {
            // The VM may still refer to the regions registered so far.
            self.close();
            return Err(SessionError::Vm(e));
        }
        self.state = SessionState::MemoryRegistered;
        Ok(())
    }

    /// Copies the segments of `image_name` into guest memory and records the
    /// entry address.
    pub fn load_image<I: ImageSource + ?Sized>(
        &mut self,
        image: &mut I,
        image_name: &str,
    ) -> Result<(), SessionError> {
        self.expect_state(SessionState::MemoryRegistered, "load the image")?;
        let memory = self
            .memory
            .as_ref()
            .ok_or_else(|| self.invalid_state("load the image"))?;
        info!("Loading image {}", image_name);
        loader::load_image(image, image_name, memory).map_err(SessionError::Load)?;
        let entry_addr = image.entry_address();
        info!("Image entry address: {:#010x}", entry_addr.raw_value());
        self.entry_addr = Some(entry_addr);
        self.state = SessionState::ImageLoaded;
        Ok(())
    }

    /// Creates the boot vcpu, maps its run state and points it at the entry address.
    pub fn setup_vcpu(&mut self) -> Result<(), SessionError> {
        self.expect_state(SessionState::ImageLoaded, "set up the vcpu")?;
        let (Some(hypervisor), Some(vm), Some(entry_addr)) =
            (self.hypervisor.as_ref(), self.vm.as_ref(), self.entry_addr)
        else {
            return Err(self.invalid_state("set up the vcpu"));
        };

        info!("Creating VCPU {}", BOOT_VCPU_ID);
        let mut vcpu = Vcpu::new(BOOT_VCPU_ID, vm).map_err(SessionError::Vcpu)?;
        vcpu.configure(vm).map_err(SessionError::Vcpu)?;
        vcpu.setup_run_state(hypervisor).map_err(SessionError::Vcpu)?;
        vcpu.set_entry_point(vm, entry_addr).map_err(SessionError::Vcpu)?;

        self.vcpu = Some(vcpu);
        self.state = SessionState::VcpuReady;
        Ok(())
    }

    /// Resumes the guest once and classifies the exit.
    ///
    /// Blocks until the guest exits. A system event closes the session.
    pub fn step(&mut self) -> Result<ExitOutcome, SessionError> {
        if !matches!(self.state, SessionState::VcpuReady | SessionState::Running) {
            return Err(self.invalid_state("run the guest"));
        }
        let vcpu = match self.vcpu.as_mut() {
            Some(vcpu) => vcpu,
            None => return Err(self.invalid_state("run the guest")),
        };
        self.state = SessionState::Running;

        let exit = match vcpu.run() {
            Ok(exit) => exit,
            Err(e) => {
                error!("Failed to run the vcpu: {}", e);
                return Ok(ExitOutcome::Error(e.errno()));
            }
        };
        let outcome = handle_exit(&exit);
        if let ExitOutcome::Stopped(_) = outcome {
            self.state = SessionState::Exited;
            self.close();
        }
        Ok(outcome)
    }

    /// Drops every handle in reverse acquisition order. Idempotent.
    ///
    /// kvm-ioctls closes its fds in `Drop` and discards the result of
    /// `close(2)`, so a failing close cannot be reported here.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if self.vcpu.take().is_some() {
            info!("Closing VCPU {} fd", BOOT_VCPU_ID);
        }
        if self.vm.take().is_some() {
            info!("Closing VM fd");
        }
        if self.hypervisor.take().is_some() {
            info!("Closing /dev/kvm");
        }
        if let Some(memory) = self.memory.take() {
            info!("Unmapping {} guest memory regions", memory.num_regions());
        }
        self.state = SessionState::Closed;
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The guest memory, until the session is closed.
    pub fn memory(&self) -> Option<&GuestMemoryLayout> {
        self.memory.as_ref()
    }

    pub fn entry_address(&self) -> Option<GuestAddress> {
        self.entry_addr
    }

    /// Size of the vcpu's mapped run state, once the vcpu is set up.
    pub fn run_state_size(&self) -> Option<usize> {
        self.vcpu.as_ref().and_then(Vcpu::run_state_size)
    }
}

impl<H: Hypervisor> Drop for VmSession<H> {
    fn drop(&mut self) {
        self.close();
    }
}
