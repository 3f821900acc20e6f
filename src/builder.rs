// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    hypervisor::Hypervisor,
    loader::elf::ElfImage,
    resources::{LaunchResources, ResourcesError},
    session::{SessionError, VmSession},
    vstate::vcpu::exit::{ExitOutcome, SystemEventKind},
};
use kvm_ioctls::Kvm;
use log::{error, info};

/// Errors associated with starting the guest.
#[derive(Debug, thiserror::Error, derive_more::From)]
pub enum StartVmError {
    /// Invalid launch configuration.
    #[error("Invalid launch configuration: {0}")]
    Resources(ResourcesError),
    /// Setting up or running the session failed.
    #[error("{0}")]
    Session(SessionError),
    /// Entering the guest failed with the errno.
    #[error("Failed to run the guest: errno {0}")]
    #[from(ignore)]
    Run(i32),
}

/// Opens `/dev/kvm` and sets up a session for `resources`.
pub fn build_session(resources: &LaunchResources) -> Result<VmSession<Kvm>, StartVmError> {
    let mut session = VmSession::new();
    session.open_device()?;
    session.create_vm()?;
    session.register_memory(&resources.memory_layout)?;
    let mut image = ElfImage::new();
    session.load_image(&mut image, resources.image_path())?;
    session.setup_vcpu()?;
    Ok(session)
}

/// Runs the guest until it raises a system event.
///
/// MMIO accesses and other recoverable exits are logged and the guest is
/// resumed. There is no timeout.
pub fn run_session<H: Hypervisor>(
    session: &mut VmSession<H>,
) -> Result<SystemEventKind, StartVmError> {
    loop {
        match session.step()? {
            ExitOutcome::Continue(_) => continue,
            ExitOutcome::Stopped(kind) => return Ok(kind),
            ExitOutcome::Error(errno) => {
                error!("Guest stopped on a failed resume");
                session.close();
                return Err(StartVmError::Run(errno));
            }
        }
    }
}

/// Builds a session from a JSON launch configuration and runs it to completion.
pub fn launch_from_json(config_json: &str) -> Result<SystemEventKind, StartVmError> {
    let resources = LaunchResources::from_json(config_json)?;
    let mut session = build_session(&resources)?;
    info!("Starting guest");
    let kind = run_session(&mut session)?;
    info!("Guest stopped: {:?}", kind);
    Ok(kind)
}
