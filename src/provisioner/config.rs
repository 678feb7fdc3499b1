//! Allocator configuration and on-disk layout
//!
//! The base and dynamic directories are pinned once at startup. Storage class
//! parameters naming them are only checked for agreement, never trusted.
//!
//! ```text
//! <base_dir>/<dyn_dir>/<volume name>    dynamic volumes
//! <base_dir>/<claim name>               static volumes, pre-existing
//! ```

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

/// Storage class parameter naming the base directory
pub const BASE_DIR_PARAMETER: &str = "basedir";

/// Storage class parameter naming the dynamic subdirectory
pub const DYN_DIR_PARAMETER: &str = "dyndir";

// =============================================================================
// Allocator Configuration
// =============================================================================

/// Immutable root-path configuration of the allocator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorConfig {
    base_dir: PathBuf,
    dyn_dir: PathBuf,
}

impl AllocatorConfig {
    /// Validate and pin the base directory and dynamic subdirectory
    pub fn new(base_dir: impl Into<PathBuf>, dyn_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        let dyn_dir = dyn_dir.into();

        if base_dir.as_os_str().is_empty() {
            return Err(Error::Configuration("Base directory not set".into()));
        }
        if dyn_dir.as_os_str().is_empty() {
            return Err(Error::Configuration("Dynamic directory not set".into()));
        }
        if !base_dir.is_absolute() {
            return Err(Error::Configuration(format!(
                "Base directory must be absolute: {}",
                base_dir.display()
            )));
        }
        if !dyn_dir
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(Error::Configuration(format!(
                "Dynamic directory must be relative to the base directory: {}",
                dyn_dir.display()
            )));
        }

        Ok(Self { base_dir, dyn_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn dyn_dir(&self) -> &Path {
        &self.dyn_dir
    }

    /// Staging area holding every dynamic volume
    pub fn dynamic_root(&self) -> PathBuf {
        self.base_dir.join(&self.dyn_dir)
    }

    /// Backing path of a dynamic volume
    pub fn dynamic_volume_path(&self, volume_name: &str) -> Result<PathBuf> {
        validate_component(volume_name)?;
        Ok(self.dynamic_root().join(volume_name))
    }

    /// Backing path of a static volume
    pub fn static_volume_path(&self, claim_name: &str) -> Result<PathBuf> {
        validate_component(claim_name)?;
        Ok(self.base_dir.join(claim_name))
    }

    /// Check storage class parameters against the pinned configuration.
    ///
    /// Absent keys are fine; present ones must be non-empty and match.
    pub fn check_parameters(&self, parameters: &BTreeMap<String, String>) -> Result<()> {
        check_parameter(parameters, BASE_DIR_PARAMETER, &self.base_dir)?;
        check_parameter(parameters, DYN_DIR_PARAMETER, &self.dyn_dir)
    }
}

fn check_parameter(
    parameters: &BTreeMap<String, String>,
    key: &str,
    pinned: &Path,
) -> Result<()> {
    match parameters.get(key) {
        None => Ok(()),
        Some(value) if value.is_empty() => Err(Error::Configuration(format!(
            "Storage class parameter {} is empty",
            key
        ))),
        Some(value) if Path::new(value) != pinned => Err(Error::Configuration(format!(
            "Storage class parameter {}={} disagrees with configured {}",
            key,
            value,
            pinned.display()
        ))),
        Some(_) => Ok(()),
    }
}

/// Reject names that would escape their parent directory
pub fn validate_component(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        "name is empty"
    } else if name.contains('/') || name.contains('\0') {
        "name must be a single path component"
    } else if name == "." || name == ".." {
        "name must not refer to a parent or current directory"
    } else {
        return Ok(());
    };

    Err(Error::InvalidVolumeName {
        name: name.to_string(),
        reason: reason.to_string(),
    })
}
