//! Structured error types for tracepipe
//!
//! Using thiserror for automatic Display implementation and error chaining.

use std::path::PathBuf;
use thiserror::Error;
use tracepipe_common::wire::DecodeError;

/// Setup failures of a system trace collector
///
/// Every variant is returned only after resources acquired by earlier setup
/// steps have been released.
#[derive(Error, Debug)]
pub enum SysTraceError {
    #[error("Collector is already running")]
    AlreadyRunning,

    #[error("{0} system tracing is not available on this platform")]
    Unsupported(&'static str),

    #[error("Permission denied: cannot enable the system profile privilege (os error {0})")]
    PrivilegeDenied(u32),

    #[error("Failed to stop stale kernel logger session (os error {0})")]
    StaleSession(u32),

    #[error("Failed to start kernel logger session (os error {0})")]
    SessionStart(u32),

    #[error("Failed to open real-time trace consumer (os error {0})")]
    ConsumerOpen(u32),

    #[error("No tracefs mount found under /sys/kernel/tracing or /sys/kernel/debug/tracing")]
    TraceFsNotFound,

    #[error("Failed to write '{value}' to {}: {source}", path.display())]
    TraceFsWrite {
        path: PathBuf,
        value: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SysTraceError {
    /// True when the failure is a missing privilege rather than a broken system.
    #[must_use]
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Self::PrivilegeDenied(_) => true,
            Self::TraceFsWrite { source, .. } => {
                source.kind() == std::io::ErrorKind::PermissionDenied
            }
            Self::Io(e) => e.kind() == std::io::ErrorKind::PermissionDenied,
            _ => false,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue already has a consumer")]
    ConsumerTaken,

    #[error("Thread-local token is unavailable (thread is exiting)")]
    ThreadExiting,

    #[error("Thread-local token is already borrowed on this thread")]
    Reentrant,
}

#[derive(Error, Debug)]
pub enum DumpError {
    #[error("Invalid stream header: {0}")]
    Header(DecodeError),

    #[error("Corrupt record at byte offset {offset}: {error}")]
    Record { offset: usize, error: DecodeError },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracefs_write_error_display() {
        let err = SysTraceError::TraceFsWrite {
            path: PathBuf::from("/sys/kernel/tracing/tracing_on"),
            value: "1".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        let msg = err.to_string();
        assert!(msg.contains("/sys/kernel/tracing/tracing_on"));
        assert!(msg.contains("'1'"));
        assert!(err.is_permission_denied());
    }

    #[test]
    fn test_privilege_error() {
        let err = SysTraceError::PrivilegeDenied(1300);
        assert!(err.to_string().starts_with("Permission denied"));
        assert!(err.is_permission_denied());
        assert!(!SysTraceError::SessionStart(5).is_permission_denied());
    }

    #[test]
    fn test_dump_record_error() {
        let err = DumpError::Record { offset: 17, error: DecodeError::Truncated };
        assert_eq!(err.to_string(), "Corrupt record at byte offset 17: record stream truncated");
    }
}
