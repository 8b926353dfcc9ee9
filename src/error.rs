//! Error types and handling for waystore

use std::path::{Path, PathBuf};

/// Result type alias for waystore operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Error types for the shared-memory dataset store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// I/O related errors (file operations, mmap, etc.)
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Invalid parameters or configuration
    #[error("Invalid parameter: {parameter} - {message}")]
    InvalidParameter { parameter: String, message: String },

    /// A block name was not found in a layout
    #[error("Unknown block: {name}")]
    UnknownBlock { name: String },

    /// A serialized layout descriptor could not be decoded
    #[error("Malformed layout: {message}")]
    MalformedLayout { message: String },

    /// A required dataset file is absent
    #[error("Could not find required dataset file: {}", path.display())]
    MissingRequiredFile { path: PathBuf },

    /// A dataset container file failed validation
    #[error("Malformed dataset file {}: {}", path.display(), message)]
    DatasetFormat { path: PathBuf, message: String },

    /// Every shared memory key in [1, 255] is reserved
    #[error("Shared memory keys exhausted")]
    KeyExhausted,

    /// No free slot remains in the region registry
    #[error("Region registry is full")]
    RegistryFull,

    /// Region not found in the registry
    #[error("Region not found: {name}")]
    RegionNotFound { name: String },

    /// The registry mutex could not be acquired within the swap deadline
    #[error("Could not acquire region lock after {waited_secs} seconds, data update failed")]
    SwapTimedOut { waited_secs: i64 },

    /// Platform-specific errors (shm, pthread, mlock)
    #[error("Platform error: {message}")]
    Platform { message: String },
}

impl StoreError {
    /// Create an I/O error from a standard I/O error
    pub fn from_io(source: std::io::Error, context: &str) -> Self {
        Self::Io {
            message: format!("{}: {}", context, source),
            source: Some(source),
        }
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    /// Create an unknown block error
    pub fn unknown_block(name: impl Into<String>) -> Self {
        Self::UnknownBlock { name: name.into() }
    }

    /// Create a malformed layout error
    pub fn malformed_layout(message: impl Into<String>) -> Self {
        Self::MalformedLayout {
            message: message.into(),
        }
    }

    /// Create a missing required file error
    pub fn missing_required_file(path: impl Into<PathBuf>) -> Self {
        Self::MissingRequiredFile { path: path.into() }
    }

    /// Create a dataset format error
    pub fn dataset_format(path: &Path, message: impl Into<String>) -> Self {
        Self::DatasetFormat {
            path: path.to_path_buf(),
            message: message.into(),
        }
    }

    /// Create a region not found error
    pub fn region_not_found(name: impl Into<String>) -> Self {
        Self::RegionNotFound { name: name.into() }
    }

    /// Create a platform error
    pub fn platform(message: impl Into<String>) -> Self {
        Self::Platform {
            message: message.into(),
        }
    }

    /// Create a platform error carrying the calling thread's errno
    pub fn last_os_error(context: &str) -> Self {
        Self::Platform {
            message: format!("{}: {}", context, std::io::Error::last_os_error()),
        }
    }
}

// Convert from common error types
impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::from_io(err, "I/O operation failed")
    }
}

impl From<nix::Error> for StoreError {
    fn from(err: nix::Error) -> Self {
        Self::platform(format!("system call failed: {}", err))
    }
}
