//! Error types for the execution engine.
//!
//! All engine operations that can fail return [`EngineResult`]. The error enum
//! deliberately distinguishes *rejection* (the engine never accepted the work)
//! from *cancellation* (accepted work dropped during shutdown) from *execution
//! failure* (the work ran and failed), because callers handle the three very
//! differently.
//!
//! Event execution and device methods are user code and report failures as
//! `anyhow::Error`; the engine wraps those in [`EngineError::ExecutionFailed`]
//! (or [`EngineError::DeviceAttribute`] on the proxy path) so they can be
//! recorded on a future and re-raised by every awaiter. That requires `Clone`,
//! hence the `Arc` around the underlying error.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::data::coords::DataCoordinates;

/// Convenience alias for results using the engine error type.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// The engine has been shut down and accepts no new work.
    #[error("submission rejected: engine is shut down")]
    SubmissionRejected,

    /// The target worker's queue is at its configured depth limit.
    #[error("submission rejected: queue for worker '{worker}' is full ({depth} items)")]
    QueueFull { worker: String, depth: usize },

    /// A queued (not yet running) item was dropped by `shutdown(wait=false)`.
    #[error("work item cancelled before execution")]
    Cancelled,

    /// The event's `execute()` returned an error or panicked.
    #[error("event execution failed: {0:#}")]
    ExecutionFailed(Arc<anyhow::Error>),

    /// `stop`/`abort`/`await_data` called on a future whose event does not
    /// declare the corresponding capability.
    #[error("event does not support capability '{0}'")]
    CapabilityUnsupported(&'static str),

    /// The coordinates can never be produced by the event, or arrived after
    /// the handler was finished.
    #[error("coordinates {0} will not be produced")]
    UnknownCoordinates(DataCoordinates),

    /// A blocking wait expired.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The storage backend or one of the data handler's threads failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// The underlying device raised on attribute access or method call.
    #[error("device '{device}' failed on '{attribute}': {reason:#}")]
    DeviceAttribute {
        device: String,
        attribute: String,
        reason: Arc<anyhow::Error>,
    },

    /// A device with the same name is already registered.
    #[error("device with name '{0}' already exists")]
    DuplicateDevice(String),

    /// No device registered under this name.
    #[error("no device with name '{0}'")]
    UnknownDevice(String),

    /// Configuration file or environment parsing failed.
    #[error("configuration error: {0}")]
    Config(String),

    /// Configuration parsed but holds semantically invalid values.
    #[error("configuration validation error: {0}")]
    Configuration(String),
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}

impl EngineError {
    /// Wrap a user-code failure for recording on a future.
    pub(crate) fn execution(err: anyhow::Error) -> Self {
        EngineError::ExecutionFailed(Arc::new(err))
    }
}
