//! Publication configuration

use std::path::PathBuf;

use crate::error::{Result, StoreError};
use crate::registry::MAX_REGION_NAME_LEN;

/// Well-known name of the shared control region hosting the registry
pub const CONTROL_REGION_NAME: &str = "waystore-registry";

/// File name of the publisher serialization lock, under the system temp dir
pub const LOCK_FILE_NAME: &str = "waystore.lock";

/// Set to `1` to skip locking the publisher's pages into memory
pub const NO_MLOCK_ENV: &str = "WAYSTORE_NO_MLOCK";

/// Configuration for one publication run
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path prefix of the dataset files; `<base_path><extension>` must name
    /// each dataset file
    pub base_path: PathBuf,
    /// Logical dataset name; region names are `<dataset>/static` and
    /// `<dataset>/updatable`
    pub dataset_name: String,
    /// Name of the shared control region
    pub control_region_name: String,
    /// Path of the publisher serialization lock file
    pub lock_path: PathBuf,
}

impl StorageConfig {
    /// Create a configuration with the well-known control region and lock
    pub fn new(base_path: impl Into<PathBuf>, dataset_name: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
            dataset_name: dataset_name.into(),
            control_region_name: CONTROL_REGION_NAME.to_string(),
            lock_path: std::env::temp_dir().join(LOCK_FILE_NAME),
        }
    }

    /// Override the control region name
    pub fn with_control_region_name(mut self, name: impl Into<String>) -> Self {
        self.control_region_name = name.into();
        self
    }

    /// Override the lock file path
    pub fn with_lock_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.lock_path = path.into();
        self
    }

    /// Name of the static region published by this configuration
    pub fn static_region(&self) -> String {
        format!("{}/static", self.dataset_name)
    }

    /// Name of the updatable region published by this configuration
    pub fn updatable_region(&self) -> String {
        format!("{}/updatable", self.dataset_name)
    }

    /// Path of the dataset file with the given extension
    pub fn path_for(&self, extension: &str) -> PathBuf {
        let mut path = self.base_path.clone().into_os_string();
        path.push(extension);
        PathBuf::from(path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.dataset_name.is_empty() {
            return Err(StoreError::invalid_parameter(
                "dataset_name",
                "dataset name must not be empty",
            ));
        }
        if self.dataset_name.contains('/') || self.dataset_name.contains('\0') {
            return Err(StoreError::invalid_parameter(
                "dataset_name",
                "dataset name must not contain '/' or NUL",
            ));
        }
        // the longest derived region name must fit a registry slot
        if self.updatable_region().len() >= MAX_REGION_NAME_LEN {
            return Err(StoreError::invalid_parameter(
                "dataset_name",
                format!(
                    "dataset name too long, region names must stay under {} bytes",
                    MAX_REGION_NAME_LEN
                ),
            ));
        }
        if self.base_path.as_os_str().is_empty() {
            return Err(StoreError::invalid_parameter(
                "base_path",
                "base path must not be empty",
            ));
        }
        if self.control_region_name.is_empty() {
            return Err(StoreError::invalid_parameter(
                "control_region_name",
                "control region name must not be empty",
            ));
        }
        Ok(())
    }
}
