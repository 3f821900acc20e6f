// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

use crate::arch::layout::default_memory_layout;
use crate::utils::util::get_page_size;
use crate::vmm_config::boot_source::{BootSourceConfig, BootSourceConfigError};
use crate::vmm_config::memory_layout::{sorted_layout, MemoryLayoutError, RegionSpec};

/// Errors associated with actions on configuring the launch resources.
#[derive(Debug, thiserror::Error, derive_more::From)]
pub enum ResourcesError {
    /// Boot source configuration error.
    #[error("Boot source error: {0}")]
    BootSource(BootSourceConfigError),
    /// JSON is invalid.
    #[error("Invalid JSON: {0}")]
    InvalidJson(serde_json::Error),
    /// Memory layout configuration error.
    #[error("Memory layout error: {0}")]
    MemoryLayout(MemoryLayoutError),
    /// Cannot read the host page size.
    #[error("Cannot retrieve the host page size: {0}")]
    PageSize(vmm_sys_util::errno::Error),
}

/// Used for configuring a launch from json.
#[derive(Default, Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct LaunchConfig {
    #[serde(rename = "boot-source")]
    boot_source: BootSourceConfig,
    #[serde(rename = "memory-layout", default)]
    memory_layout: Option<Vec<RegionSpec>>,
}

/// Everything needed to build a session.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LaunchResources {
    pub boot_source: BootSourceConfig,
    pub memory_layout: Vec<RegionSpec>,
}

impl Default for LaunchResources {
    fn default() -> Self {
        LaunchResources {
            boot_source: BootSourceConfig::default(),
            memory_layout: default_memory_layout(),
        }
    }
}

impl LaunchResources {
    pub fn from_json(config_json: &str) -> Result<Self, ResourcesError> {
        let config: LaunchConfig = serde_json::from_str::<LaunchConfig>(config_json)?;
        let mut resources: Self = Default::default();

        resources.build_boot_source(config.boot_source)?;
        if let Some(memory_layout) = config.memory_layout {
            resources.build_memory_layout(memory_layout)?;
        }
        Ok(resources)
    }

    /// Set the boot source.
    pub fn build_boot_source(
        &mut self,
        boot_source: BootSourceConfig,
    ) -> Result<(), BootSourceConfigError> {
        boot_source.validate()?;
        self.boot_source = boot_source;
        Ok(())
    }

    /// Replace the default memory layout, keeping it sorted by guest address.
    pub fn build_memory_layout(&mut self, layout: Vec<RegionSpec>) -> Result<(), ResourcesError> {
        let page_size = get_page_size()?;
        self.memory_layout = sorted_layout(&layout, page_size)?;
        Ok(())
    }

    pub fn image_path(&self) -> &str {
        &self.boot_source.image_path
    }
}
