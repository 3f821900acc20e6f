// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! A minimal single-vcpu KVM launcher for bare-metal aarch64 guests.
//!
//! The guest memory map is fixed (see [`arch::layout`]), the image's loadable
//! segments are copied into it, and the vcpu runs until the guest powers
//! itself off through PSCI.

pub mod arch;
pub mod builder;
pub mod hypervisor;
pub mod loader;
pub mod resources;
pub mod session;
pub mod utils;
pub mod vmm_config;
pub mod vstate;

pub use crate::session::{SessionError, SessionState, VmSession};
pub use crate::vstate::vcpu::exit::{ExitOutcome, ExitReport, SystemEventKind};
