//! Cancellation scopes carrying a rejection reason
//!
//! An [`AbortSignal`] is a [`CancellationToken`] plus the error every
//! operation bound to it should fail with. Each pool worker owns one; callers
//! may pass their own to [`crate::WorkerPool::call_with_signal`].

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{PoolError, Result};

#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    token: CancellationToken,
    reason: Arc<Mutex<Option<PoolError>>>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort without an explicit reason
    pub fn abort(&self) {
        self.token.cancel();
    }

    /// Abort with `reason`; a signal that is already aborted keeps its reason
    pub fn abort_with(&self, reason: PoolError) {
        {
            let mut slot = self.reason.lock();
            if slot.is_none() && !self.token.is_cancelled() {
                *slot = Some(reason);
            }
        }
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Error bound operations fail with
    pub fn reason(&self) -> PoolError {
        self.reason.lock().clone().unwrap_or_else(PoolError::aborted)
    }

    pub(crate) fn has_default_reason(&self) -> bool {
        self.reason.lock().is_none()
    }

    /// Fail with the reason if already aborted
    pub fn check(&self) -> Result<()> {
        if self.is_aborted() {
            Err(self.reason())
        } else {
            Ok(())
        }
    }

    /// Resolves with the reason once aborted
    pub async fn aborted(&self) -> PoolError {
        self.token.cancelled().await;
        self.reason()
    }
}

/// Resolves when `signal` aborts; never resolves without a signal
pub(crate) async fn wait_aborted(signal: Option<&AbortSignal>) -> PoolError {
    match signal {
        Some(signal) => signal.aborted().await,
        None => std::future::pending().await,
    }
}
