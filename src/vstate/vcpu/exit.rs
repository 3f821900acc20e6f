// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Classification of vcpu exits.

use crate::hypervisor::VmExit;
use byteorder::{ByteOrder, LittleEndian};
use kvm_bindings::{KVM_SYSTEM_EVENT_CRASH, KVM_SYSTEM_EVENT_RESET, KVM_SYSTEM_EVENT_SHUTDOWN};
use log::{debug, info, warn};

/// Cause of a `KVM_EXIT_SYSTEM_EVENT`, raised by the guest through PSCI.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SystemEventKind {
    Shutdown,
    Reset,
    Crash,
    Unknown(u32),
}

impl From<u32> for SystemEventKind {
    fn from(event_type: u32) -> Self {
        match event_type {
            KVM_SYSTEM_EVENT_SHUTDOWN => SystemEventKind::Shutdown,
            KVM_SYSTEM_EVENT_RESET => SystemEventKind::Reset,
            KVM_SYSTEM_EVENT_CRASH => SystemEventKind::Crash,
            other => SystemEventKind::Unknown(other),
        }
    }
}

/// What the dispatcher observed on an exit that does not end the session.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ExitReport {
    MmioWrite { addr: u64, len: usize, value: u64 },
    MmioRead { addr: u64, len: usize },
    Interrupted,
    FailEntry { reason: u64, cpu: u32 },
    InternalError,
    Unclassified(String),
}

/// Result of one `step` of the guest.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ExitOutcome {
    /// The guest may be resumed.
    Continue(ExitReport),
    /// The guest raised a system event; the session has been closed.
    Stopped(SystemEventKind),
    /// Entering the guest failed with this errno. The guest state is unknown
    /// and the session should be closed.
    Error(i32),
}

/// Decodes an MMIO payload: `data |= byte[i] << (8 * i)`.
///
/// KVM never hands out more than 8 bytes; anything past that is ignored.
pub fn decode_mmio_data(data: &[u8]) -> u64 {
    let len = data.len().min(8);
    if len == 0 {
        return 0;
    }
    LittleEndian::read_uint(&data[..len], len)
}

/// Classifies `exit` and reports it.
pub fn handle_exit(exit: &VmExit) -> ExitOutcome {
    match exit {
        VmExit::MmioWrite { addr, data } => {
            let value = decode_mmio_data(data);
            info!("Is Write: 1 - Address: {:#010x}", addr);
            info!("Guest wrote {:#010x} (length={})", value, data.len());
            ExitOutcome::Continue(ExitReport::MmioWrite {
                addr: *addr,
                len: data.len(),
                value,
            })
        }
        VmExit::MmioRead { addr, len } => {
            debug!("Guest read {} bytes at {:#010x}", len, addr);
            ExitOutcome::Continue(ExitReport::MmioRead {
                addr: *addr,
                len: *len,
            })
        }
        VmExit::SystemEvent(event_type) => {
            // The guest made a PSCI call over HVC.
            let kind = SystemEventKind::from(*event_type);
            info!("Exit Reason: KVM_EXIT_SYSTEM_EVENT");
            match kind {
                SystemEventKind::Shutdown => info!("Cause: Shutdown"),
                SystemEventKind::Reset => info!("Cause: Reset"),
                SystemEventKind::Crash => info!("Cause: Crash"),
                SystemEventKind::Unknown(t) => info!("Cause: Unknown ({})", t),
            }
            ExitOutcome::Stopped(kind)
        }
        VmExit::Intr => {
            info!("Exit Reason: KVM_EXIT_INTR");
            ExitOutcome::Continue(ExitReport::Interrupted)
        }
        VmExit::FailEntry { reason, cpu } => {
            warn!(
                "Exit Reason: KVM_EXIT_FAIL_ENTRY (hardware reason {:#x}, cpu {})",
                reason, cpu
            );
            ExitOutcome::Continue(ExitReport::FailEntry {
                reason: *reason,
                cpu: *cpu,
            })
        }
        VmExit::InternalError => {
            warn!("Exit Reason: KVM_EXIT_INTERNAL_ERROR");
            ExitOutcome::Continue(ExitReport::InternalError)
        }
        VmExit::Other(description) => {
            warn!("Exit Reason: other ({})", description);
            ExitOutcome::Continue(ExitReport::Unclassified(description.clone()))
        }
    }
}
