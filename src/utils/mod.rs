// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

pub mod memory;
#[cfg(test)]
pub mod test_utils;
pub mod util;
