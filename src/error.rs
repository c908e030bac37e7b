//! Error types for vesper
//!
//! This module defines the error types used throughout the compositing core.
//! We use thiserror for convenient error derivation and avoid panics in
//! production code by properly propagating errors. Failures on the per-frame
//! hot path are caught at component boundaries and converted into state
//! transitions (retry, fallback, disable) rather than propagated.

use std::fmt;

use crate::output::OutputId;

/// Main error type for vesper operations
#[derive(Debug, thiserror::Error)]
pub enum VesperError {
    /// A staged hardware configuration failed validation; always recoverable
    /// by reverting the pending state and retrying with a safe configuration
    #[error("Configuration rejected by hardware: {0}")]
    Validation(String),

    /// A previously validated configuration still failed to commit; fatal
    /// for the affected output until the next topology re-scan
    #[error("Hardware commit failed on output {0:?}: {1}")]
    CommitFailed(OutputId, String),

    /// No compositing backend could be initialized
    #[error("No usable compositing backend: {0}")]
    NoBackend(String),

    /// A single frame failed to present; recovered locally by the render loop
    #[error("Frame presentation failed on output {0:?}")]
    FrameFailed(OutputId),

    /// An output disappeared between enumeration and commit
    #[error("Output {0:?} vanished")]
    OutputVanished(OutputId),

    /// Output not known to the fleet
    #[error("Output {0:?} not found")]
    OutputNotFound(OutputId),

    /// An operation was issued in a state that does not allow it
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// IO error (persisted layout store)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed persisted layout data
    #[error("Layout store error: {0}")]
    LayoutStore(#[from] serde_json::Error),
}

/// Result type alias for vesper operations
pub type VesperResult<T> = Result<T, VesperError>;

/// Extension trait for Option to convert to Result with error context
pub trait OptionExt<T> {
    /// Convert None to an error with context
    fn ok_or_log<F>(self, error_fn: F) -> VesperResult<T>
    where
        F: FnOnce() -> VesperError;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_log<F>(self, error_fn: F) -> VesperResult<T>
    where
        F: FnOnce() -> VesperError,
    {
        match self {
            Some(val) => Ok(val),
            None => {
                let err = error_fn();
                tracing::error!("{err}");
                Err(err)
            }
        }
    }
}

/// Helper for operations that should log errors but not propagate them
pub fn log_error<T, E: fmt::Display>(result: Result<T, E>) -> Option<T> {
    match result {
        Ok(val) => Some(val),
        Err(err) => {
            tracing::error!("Operation failed: {err}");
            None
        }
    }
}
