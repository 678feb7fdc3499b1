//! Error types for the OCFS2 simple provisioner
//!
//! Provides structured error types for the volume allocator and the
//! controller binding that drives it.

use std::path::PathBuf;
use thiserror::Error;

/// Unified error type for the provisioner
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Allocation Errors
    // =========================================================================
    #[error("Directory not found: {}", path.display())]
    DirectoryNotFound { path: PathBuf },

    #[error("Could not find mode annotation on {object}")]
    MissingModeAnnotation { object: String },

    #[error("Invalid mode annotation value: {value:?}")]
    InvalidModeAnnotation { value: String },

    #[error("Could not find static directory {}, it has to exist prior to the claim", path.display())]
    StaticPathMissing { path: PathBuf },

    #[error("Invalid volume name {name:?}: {reason}")]
    InvalidVolumeName { name: String, reason: String },

    #[error("Failed to create volume directory {}: {source}", path.display())]
    ProvisionFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove volume directory {}: {source}", path.display())]
    DeleteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    // =========================================================================
    // Metrics Errors
    // =========================================================================
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Action the controller takes after a failed provision or delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Try again on the next resync, subject to the failure threshold
    Requeue,
    /// Stop retrying until the object changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Malformed objects or config never heal on their own
            Error::Configuration(_)
            | Error::MissingModeAnnotation { .. }
            | Error::InvalidModeAnnotation { .. }
            | Error::InvalidVolumeName { .. } => ErrorAction::NoRequeue,

            // An administrator may still create the directory
            Error::DirectoryNotFound { .. } | Error::StaticPathMissing { .. } => {
                ErrorAction::Requeue
            }

            Error::ProvisionFailed { .. }
            | Error::DeleteFailed { .. }
            | Error::Kube(_)
            | Error::Metrics(_)
            | Error::Internal(_) => ErrorAction::Requeue,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }
}

/// Result type alias for the provisioner
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::Configuration("base directory not set".into());
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::InvalidModeAnnotation {
            value: "maybe".into(),
        };
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::StaticPathMissing {
            path: PathBuf::from("/export/myclaim"),
        };
        assert_eq!(err.action(), ErrorAction::Requeue);
    }

    #[test]
    fn test_error_retryable() {
        let fs_err = Error::DeleteFailed {
            path: PathBuf::from("/export/dyn/pvc-1"),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert!(fs_err.is_retryable());

        let missing = Error::MissingModeAnnotation {
            object: "PersistentVolume/pvc-1".into(),
        };
        assert!(!missing.is_retryable());
    }

    #[test]
    fn test_static_missing_message() {
        let err = Error::StaticPathMissing {
            path: PathBuf::from("/export/myclaim"),
        };
        assert!(err.to_string().contains("has to exist prior to the claim"));
    }
}
