//! Borrowed worker handles

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::abort::AbortSignal;
use crate::channel::Worker;
use crate::error::PoolError;

use super::scheduler::WorkerPool;

/// A worker tracked by a pool
///
/// Cloning is cheap; clones refer to the same worker. The handle is tagged
/// with the owning pool so it cannot be used with another one.
#[derive(Clone)]
pub struct WorkerHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    id: u64,
    pool_id: u64,
    worker: Arc<dyn Worker>,
    scope: AbortSignal,
    busy: AtomicBool,
}

impl WorkerHandle {
    /// New handles start out busy: they are created for a borrower
    pub(crate) fn new(id: u64, pool_id: u64, worker: Arc<dyn Worker>, scope: AbortSignal) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                pool_id,
                worker,
                scope,
                busy: AtomicBool::new(true),
            }),
        }
    }

    /// Worker id, unique within its pool
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::SeqCst)
    }

    /// Whether the pool has retired this worker
    pub fn is_destroyed(&self) -> bool {
        self.inner.scope.is_aborted()
    }

    pub fn worker(&self) -> &Arc<dyn Worker> {
        &self.inner.worker
    }

    pub(crate) fn pool_id(&self) -> u64 {
        self.inner.pool_id
    }

    pub(crate) fn scope(&self) -> &AbortSignal {
        &self.inner.scope
    }

    pub(crate) fn set_busy(&self, busy: bool) {
        self.inner.busy.store(busy, Ordering::SeqCst);
    }

    pub(crate) fn same(&self, other: &WorkerHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Fail everything bound to the worker and stop it
    pub(crate) fn shutdown(&self, reason: PoolError) {
        self.inner.scope.abort_with(reason);
        self.inner.worker.terminate();
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id())
            .field("busy", &self.is_busy())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// Borrowed worker that goes back to its pool when dropped
///
/// Returned by [`WorkerPool::lease`]. Dereferences to the [`WorkerHandle`].
pub struct WorkerLease {
    pool: WorkerPool,
    handle: WorkerHandle,
}

impl WorkerLease {
    pub(crate) fn new(pool: WorkerPool, handle: WorkerHandle) -> Self {
        Self { pool, handle }
    }

    pub fn handle(&self) -> &WorkerHandle {
        &self.handle
    }
}

impl Deref for WorkerLease {
    type Target = WorkerHandle;

    fn deref(&self) -> &WorkerHandle {
        &self.handle
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.pool.return_worker(&self.handle);
    }
}

impl fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WorkerLease").field(&self.handle).finish()
    }
}
