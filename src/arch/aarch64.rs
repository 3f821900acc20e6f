// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! aarch64 register ids and vcpu features used to boot the guest.
//!
//! These values are part of the KVM ABI. They are spelled out here instead of
//! being taken from `kvm-bindings` so the rest of the crate stays buildable on
//! hosts of another architecture.

use crate::hypervisor::VcpuInit;

const KVM_REG_ARM64: u64 = 0x6000_0000_0000_0000;
const KVM_REG_SIZE_U64: u64 = 0x0030_0000_0000_0000;
const KVM_REG_ARM_CORE: u64 = 0x0010_0000;

// `struct kvm_regs` starts with `user_pt_regs { regs[31], sp, pc, pstate }`.
// Core register ids are expressed as offsets in 32-bit words.
const PC_OFFSET_WORDS: u64 = (31 + 1) * 8 / 4;

/// Id of the program counter for `KVM_SET_ONE_REG`.
pub const PC_REG_ID: u64 = KVM_REG_ARM64 | KVM_REG_SIZE_U64 | KVM_REG_ARM_CORE | PC_OFFSET_WORDS;

/// `KVM_ARM_VCPU_PSCI_0_2`: expose PSCI v0.2 so the guest can power itself off.
pub const VCPU_FEATURE_PSCI_0_2: u32 = 2;

/// Turns on the PSCI v0.2 feature bit in the first feature word.
pub fn enable_psci(init: &mut VcpuInit) {
    init.features[0] |= 1 << VCPU_FEATURE_PSCI_0_2;
}
