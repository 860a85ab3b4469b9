//! Synchronization error types

use thiserror::Error;

/// Faults observable by callers of the locking API
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// `wait`/`notify` (or an unbalanced exit) by a thread that does not own the monitor
    #[error("IllegalMonitorStateException: current thread is not owner ({op} on {object})")]
    IllegalMonitorState {
        /// Operation that was attempted
        op: &'static str,
        /// Description of the object involved
        object: String,
    },

    /// A `wait` observed an interrupt and returned early
    #[error("InterruptedException: wait interrupted")]
    Interrupted,
}

/// Result alias for locking operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Invalid configuration values
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Bulk revoke must trigger strictly after bulk rebias
    #[error("bulk_revoke_threshold ({revoke}) must be greater than bulk_rebias_threshold ({rebias})")]
    BulkThresholds {
        /// Rebias threshold
        rebias: u32,
        /// Revoke threshold
        revoke: u32,
    },

    /// A size or count that must be nonzero was zero
    #[error("{0} must be nonzero")]
    Zero(&'static str),

    /// Percentage outside 0..=100
    #[error("{name} must be a percentage, got {value}")]
    Percentage {
        /// Field name
        name: &'static str,
        /// Offending value
        value: u32,
    },
}

/// Abort on a broken internal invariant.
///
/// Corrupted lists, double frees and lock word/monitor disagreement are never
/// recoverable; log the diagnostic and panic.
#[cold]
#[track_caller]
pub fn fatal(msg: std::fmt::Arguments<'_>) -> ! {
    tracing::error!(target: "otter_vm_sync", "fatal: {msg}");
    panic!("otter-vm-sync fatal error: {msg}");
}

/// `fatal(format_args!(...))` shorthand
#[macro_export]
macro_rules! sync_fatal {
    ($($arg:tt)*) => {
        $crate::error::fatal(format_args!($($arg)*))
    };
}
