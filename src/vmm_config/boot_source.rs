// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::path::Path;

/// This represents part of the guest's configuration file in json format.
#[derive(Default, Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct BootSourceConfig {
    /// Path of the ELF image loaded into guest memory.
    pub image_path: String,
}

/// Errors associated with actions on `BootSourceConfig`.
#[derive(Debug, thiserror::Error)]
pub enum BootSourceConfigError {
    /// No image path was given.
    #[error("The image path is empty.")]
    MissingImagePath,
    /// The image file does not exist or cannot be inspected.
    #[error("The image file cannot be opened: {0}")]
    InvalidImagePath(std::io::Error),
}

impl BootSourceConfig {
    /// Checks that the image path names an existing file.
    pub fn validate(&self) -> Result<(), BootSourceConfigError> {
        if self.image_path.is_empty() {
            return Err(BootSourceConfigError::MissingImagePath);
        }
        Path::new(&self.image_path)
            .metadata()
            .map_err(BootSourceConfigError::InvalidImagePath)?;
        Ok(())
    }
}
