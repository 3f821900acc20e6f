// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

pub mod aarch64;
pub mod layout;

/// The API version of `/dev/kvm` this launcher speaks. Anything else is refused.
pub const KVM_API_VERSION: i32 = 12;

/// Index of the single vcpu the guest runs on.
pub const BOOT_VCPU_ID: u64 = 0;
