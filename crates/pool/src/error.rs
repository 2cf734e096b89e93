// Error types for the worker pool

use std::time::Duration;

use thiserror::Error;

use crate::value::{ErrorValue, Value};

/// Result type alias for pool operations
pub type Result<T> = std::result::Result<T, PoolError>;

/// Default reason used when a call is cancelled without an explicit reason
pub const DEFAULT_ABORT_REASON: &str = "Operation aborted";

/// Default reason used when a readiness wait is cancelled without an explicit reason
pub const DEFAULT_INIT_ABORT_REASON: &str = "Worker initialization aborted";

/// Errors surfaced by the pool, the call protocol and the worker side
///
/// Errors are `Clone` so that one failure (a destroyed pool, a failed worker
/// start) can be delivered to every waiter it affects.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    /// Options could not be normalized into a valid configuration
    #[error("invalid pool configuration: {0}")]
    Configuration(String),

    /// Worker handle does not belong to the pool it was used with
    #[error("Invalid tagged worker: worker {worker_id} does not belong to pool {pool}")]
    Ownership { pool: String, worker_id: u64 },

    /// Worker reported a failed initialization; carries its error verbatim
    #[error("{0}")]
    Initialization(Value),

    /// Worker failed fatally before completing the readiness handshake
    #[error("Worker initialization error: {message}")]
    InitializationCrashed { message: String },

    /// Worker did not complete the readiness handshake in time
    #[error("Worker initialization timed out after {} ms", .timeout.as_millis())]
    InitializationTimeout { timeout: Duration },

    /// Exposed method failed; carries its error verbatim
    #[error("{0}")]
    Remote(Value),

    /// Worker failed fatally while serving calls
    #[error("Worker error: {message}")]
    WorkerCrashed { message: String },

    /// Worker channel is gone
    #[error("worker channel closed")]
    ChannelClosed,

    /// Operation was cancelled
    #[error("{0}")]
    Aborted(String),

    /// Pool was destroyed while the operation was outstanding
    #[error("Worker pool {name} has been destroyed")]
    Destroyed { name: String },

    /// Worker was retired by the pool (explicitly or by idle reclamation)
    #[error("Worker {id} has been destroyed")]
    WorkerDestroyed { id: u64 },

    /// Worker factory failed to produce a worker
    #[error("failed to create worker: {0}")]
    Factory(String),

    /// Message could not be copied or transferred across the worker boundary
    #[error("could not clone message: {0}")]
    DataClone(String),

    /// `expose` was called twice on one worker
    #[error("expose can only be called once per worker")]
    AlreadyExposed,

    /// `notify_ready` was called twice on one worker
    #[error("notify_ready can only be called once per worker")]
    AlreadyNotified,
}

impl PoolError {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        PoolError::Configuration(msg.into())
    }

    /// Create a cancellation error with the default reason
    pub fn aborted() -> Self {
        PoolError::Aborted(DEFAULT_ABORT_REASON.to_string())
    }

    /// Create a cancellation error with a custom reason
    pub fn aborted_with(reason: impl Into<String>) -> Self {
        PoolError::Aborted(reason.into())
    }

    /// Create a worker crash error
    pub fn crashed(message: impl Into<String>) -> Self {
        PoolError::WorkerCrashed {
            message: message.into(),
        }
    }

    /// Create a factory error
    pub fn factory(msg: impl Into<String>) -> Self {
        PoolError::Factory(msg.into())
    }

    /// Create a data clone error
    pub fn data_clone(msg: impl Into<String>) -> Self {
        PoolError::DataClone(msg.into())
    }

    /// Check if this error was caused by pool destruction
    pub fn is_destroyed(&self) -> bool {
        matches!(self, PoolError::Destroyed { .. })
    }

    /// Check if this error is an initialization timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, PoolError::InitializationTimeout { .. })
    }

    /// Check if this error is a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PoolError::Aborted(_))
    }

    /// Check if this error came from the worker's own code
    pub fn is_remote(&self) -> bool {
        matches!(self, PoolError::Remote(_) | PoolError::Initialization(_))
    }

    /// Error value raised by the worker, if any
    pub fn remote_value(&self) -> Option<&Value> {
        match self {
            PoolError::Remote(value) | PoolError::Initialization(value) => Some(value),
            _ => None,
        }
    }

    /// Convert into a value that can travel inside a message
    pub fn into_value(self) -> Value {
        match self {
            PoolError::Remote(value) | PoolError::Initialization(value) => value,
            other => Value::Error(ErrorValue::new(other.to_string())),
        }
    }
}
