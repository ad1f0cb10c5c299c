//! Error taxonomy for capture sessions
//!
//! Every error that can end a session maps onto one [`ErrorKind`]. The
//! messages are kept as strings so errors can be cloned into session
//! snapshots and mirrored onto the event bus.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Coarse classification of a session error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Device or process could not start
    AcquisitionFailed,
    /// Backgrounding or external preemption while recording
    DeviceInterrupted,
    /// Stop/signal did not produce a valid output file
    FinalizeError,
    /// Non-fatal: raw file kept, conversion skipped
    TranscodeDegraded,
    /// Output directory unwritable or out of space
    StorageError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::AcquisitionFailed => "AcquisitionFailed",
            ErrorKind::DeviceInterrupted => "DeviceInterrupted",
            ErrorKind::FinalizeError => "FinalizeError",
            ErrorKind::TranscodeDegraded => "TranscodeDegraded",
            ErrorKind::StorageError => "StorageError",
        };
        f.write_str(name)
    }
}

/// Why an acquisition failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionCause {
    PermissionDenied,
    DeviceBusy,
    DeviceNotFound,
    BinaryNotFound,
    /// Requested resolution/frame rate is not supported
    Unsupported,
    /// Capture process exited during the liveness check
    ExitedEarly,
    /// Backend already has an outstanding acquisition
    AlreadyAcquired,
    Other,
}

impl fmt::Display for AcquisitionCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AcquisitionCause::PermissionDenied => "permission denied",
            AcquisitionCause::DeviceBusy => "device busy",
            AcquisitionCause::DeviceNotFound => "device not found",
            AcquisitionCause::BinaryNotFound => "binary not found",
            AcquisitionCause::Unsupported => "unsupported configuration",
            AcquisitionCause::ExitedEarly => "exited early",
            AcquisitionCause::AlreadyAcquired => "already acquired",
            AcquisitionCause::Other => "other",
        };
        f.write_str(name)
    }
}

/// Errors raised by backends, the path resolver and the transcoder
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("acquisition failed ({cause}): {message}")]
    AcquisitionFailed {
        cause: AcquisitionCause,
        message: String,
    },

    #[error("device interrupted: {0}")]
    DeviceInterrupted(String),

    #[error("finalize failed: {0}")]
    FinalizeError(String),

    #[error("transcode degraded: {0}")]
    TranscodeDegraded(String),

    #[error("storage error at {path:?}: {message}")]
    StorageError { path: PathBuf, message: String },
}

impl CaptureError {
    pub fn acquisition(cause: AcquisitionCause, message: impl Into<String>) -> Self {
        CaptureError::AcquisitionFailed {
            cause,
            message: message.into(),
        }
    }

    pub fn storage(path: impl Into<PathBuf>, err: impl fmt::Display) -> Self {
        CaptureError::StorageError {
            path: path.into(),
            message: err.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CaptureError::AcquisitionFailed { .. } => ErrorKind::AcquisitionFailed,
            CaptureError::DeviceInterrupted(_) => ErrorKind::DeviceInterrupted,
            CaptureError::FinalizeError(_) => ErrorKind::FinalizeError,
            CaptureError::TranscodeDegraded(_) => ErrorKind::TranscodeDegraded,
            CaptureError::StorageError { .. } => ErrorKind::StorageError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let err = CaptureError::acquisition(AcquisitionCause::BinaryNotFound, "libcamera-vid");
        assert_eq!(err.kind(), ErrorKind::AcquisitionFailed);
        assert!(err.to_string().contains("binary not found"));

        let err = CaptureError::storage("/nope", "read-only file system");
        assert_eq!(err.kind(), ErrorKind::StorageError);
        assert!(err.to_string().contains("read-only"));
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::TranscodeDegraded).unwrap();
        assert_eq!(json, "\"transcode_degraded\"");
    }
}
