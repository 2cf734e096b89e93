//! Worker pool scheduler
//!
//! Owns the worker set, the pending-borrow queue and the idle reclamation
//! timer. All state transitions happen under one lock that is never held
//! across an await; creation, readiness and crash watching run in spawned
//! tasks that report back through the same lock.
//!
//! ```text
//!  borrow_worker ─┬─ idle worker? ───────────────────────────▶ busy
//!                 ├─ creation delay, retry idle
//!                 ├─ below max? ── spawn: create ─▶ ready ───▶ busy
//!                 └─ queue (FIFO) ◀── return_worker / crash ──┘
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, instrument, trace, warn};

use super::handle::{WorkerHandle, WorkerLease};
use super::options::{PoolConfig, PoolOptions};
use crate::abort::AbortSignal;
use crate::channel::{Subscription, Worker, WorkerEvent};
use crate::error::{PoolError, Result};
use crate::factory::{SourceFactory, WorkerFactory, WorkerSource};
use crate::protocol::call::{call_worker, CallRequest};
use crate::protocol::ready::wait_for_ready_on;
use crate::protocol::sequence::SequenceGenerator;
use crate::value::Value;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Point-in-time worker counts
///
/// `total` is always `idle + busy + initializing`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub total: usize,
    pub idle: usize,
    pub busy: usize,
    pub initializing: usize,
}

/// Pool of workers serving method calls
///
/// Cheap to clone; clones share the same workers. Dropping the last clone
/// destroys the pool.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

type Waiter = oneshot::Sender<Result<WorkerHandle>>;

struct PoolInner {
    id: u64,
    options: Arc<PoolOptions>,
    factory: Arc<dyn WorkerFactory>,
    ids: SequenceGenerator,
    state: Mutex<PoolState>,
}

#[derive(Default)]
struct PoolState {
    /// Keyed by worker id, so iteration goes oldest first
    workers: BTreeMap<u64, WorkerHandle>,
    initializing: BTreeMap<u64, AbortSignal>,
    pending: VecDeque<Waiter>,
    cleanup: Option<CleanupTimer>,
    next_worker_id: u64,
    cleanup_generation: u64,
}

struct CleanupTimer {
    generation: u64,
    task: AbortHandle,
}

impl PoolState {
    fn total(&self) -> usize {
        self.workers.len() + self.initializing.len()
    }

    fn take_idle(&mut self) -> Option<WorkerHandle> {
        let handle = self.workers.values().find(|h| !h.is_busy())?.clone();
        handle.set_busy(true);
        Some(handle)
    }

    fn tracks(&self, pool_id: u64, handle: &WorkerHandle) -> bool {
        handle.pool_id() == pool_id
            && self
                .workers
                .get(&handle.id())
                .is_some_and(|tracked| tracked.same(handle))
    }
}

impl WorkerPool {
    /// Create a pool running workers from `source`
    pub fn new(source: WorkerSource, config: PoolConfig) -> Result<Self> {
        Self::with_factory(Arc::new(SourceFactory::new(source)), config)
    }

    /// Create a pool around a custom worker factory
    pub fn with_factory(factory: Arc<dyn WorkerFactory>, config: PoolConfig) -> Result<Self> {
        let options = PoolOptions::from_config(&config)?;
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);

        info!(
            pool = %options.name,
            max_workers = options.max_workers,
            min_idle_workers = options.min_idle_workers,
            idle_timeout_ms = options.idle_timeout.as_millis() as u64,
            "Worker pool created"
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                id,
                options: Arc::new(options),
                factory,
                ids: SequenceGenerator::new(),
                state: Mutex::new(PoolState::default()),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.options.name
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    /// Borrow a worker for exclusive use
    ///
    /// Reuses an idle worker, creates one while under capacity, or waits in
    /// FIFO order for one to be returned. The worker must be handed back with
    /// [`WorkerPool::return_worker`]; [`WorkerPool::lease`] does that
    /// automatically.
    #[instrument(skip(self), fields(pool = %self.inner.options.name))]
    pub async fn borrow_worker(&self) -> Result<WorkerHandle> {
        self.inner.borrow().await
    }

    /// Borrow a worker that is returned when the lease is dropped
    pub async fn lease(&self) -> Result<WorkerLease> {
        let handle = self.borrow_worker().await?;
        Ok(WorkerLease::new(self.clone(), handle))
    }

    /// Hand a borrowed worker back
    ///
    /// Destroyed and foreign workers are ignored.
    pub fn return_worker(&self, handle: &WorkerHandle) {
        self.inner.release(handle);
    }

    /// Call `method` on any available worker
    pub async fn call(&self, method: impl Into<String>, args: Vec<Value>) -> Result<Value> {
        self.call_with(CallRequest::new(method, args)).await
    }

    #[instrument(skip(self, request), fields(pool = %self.inner.options.name, method = %request.method))]
    pub async fn call_with(&self, request: CallRequest) -> Result<Value> {
        let lease = self.lease().await?;
        self.call_worker_with(&lease, request).await
    }

    /// Like [`WorkerPool::call_with`], giving up once `signal` aborts
    ///
    /// The worker is returned to the pool whichever way the call ends.
    pub async fn call_with_signal(&self, request: CallRequest, signal: &AbortSignal) -> Result<Value> {
        signal.check()?;
        tokio::select! {
            biased;
            reason = signal.aborted() => Err(reason),
            result = self.call_with(request) => result,
        }
    }

    /// Call `method` on a worker borrowed from this pool
    pub async fn call_worker(
        &self,
        handle: &WorkerHandle,
        method: impl Into<String>,
        args: Vec<Value>,
    ) -> Result<Value> {
        self.call_worker_with(handle, CallRequest::new(method, args))
            .await
    }

    pub async fn call_worker_with(&self, handle: &WorkerHandle, request: CallRequest) -> Result<Value> {
        if handle.pool_id() != self.inner.id {
            return Err(PoolError::Ownership {
                pool: self.inner.options.name.clone(),
                worker_id: handle.id(),
            });
        }
        call_worker(
            handle.worker().as_ref(),
            &self.inner.ids,
            Some(handle.scope()),
            request,
            self.inner.options.max_copy_overhead,
        )
        .await
    }

    /// Retire one worker, failing its in-flight calls
    pub fn destroy_worker(&self, handle: &WorkerHandle) {
        let reason = PoolError::WorkerDestroyed { id: handle.id() };
        if self.inner.destroy_worker(handle, reason) {
            self.inner.process_pending();
        }
    }

    /// Tear down every worker and reject every pending borrow
    ///
    /// Idempotent. The pool stays usable: later borrows start fresh workers.
    #[instrument(skip(self), fields(pool = %self.inner.options.name))]
    pub fn destroy(&self) {
        let status = self.status();
        info!(
            total = status.total,
            pending = self.pending_count(),
            "Destroying worker pool"
        );
        self.inner.teardown();
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        let busy = state.workers.values().filter(|h| h.is_busy()).count();
        PoolStatus {
            total: state.total(),
            idle: state.workers.len() - busy,
            busy,
            initializing: state.initializing.len(),
        }
    }

    /// Number of borrowers waiting for a worker
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.inner.options.name)
            .field("status", &self.status())
            .finish()
    }
}

impl PoolInner {
    async fn borrow(self: &Arc<Self>) -> Result<WorkerHandle> {
        if let Some(handle) = self.state.lock().take_idle() {
            trace!(worker_id = handle.id(), "Reusing idle worker");
            return Ok(handle);
        }

        let delay = {
            let state = self.state.lock();
            let total = state.total();
            total > 0 && total >= self.options.min_idle_workers && total < self.options.max_workers
        };
        if delay {
            // Give a busy worker the chance to come back before paying for a new one
            if self.options.creation_delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(self.options.creation_delay).await;
            }
        }

        let reply = {
            let mut state = self.state.lock();
            if let Some(handle) = state.take_idle() {
                return Ok(handle);
            }
            let (tx, rx) = oneshot::channel();
            if state.total() < self.options.max_workers {
                self.spawn_creation(&mut state, tx);
            } else {
                state.pending.push_back(tx);
                debug!(pending = state.pending.len(), "Pool at capacity, waiting for a worker");
            }
            rx
        };

        reply.await.unwrap_or_else(|_| {
            Err(PoolError::Destroyed {
                name: self.options.name.clone(),
            })
        })
    }

    fn release(self: &Arc<Self>, handle: &WorkerHandle) {
        {
            let mut state = self.state.lock();
            if !state.tracks(self.id, handle) {
                trace!(worker_id = handle.id(), "Ignoring return of untracked worker");
                return;
            }
            handle.set_busy(false);
            self.process_pending_locked(&mut state);
        }
        self.schedule_cleanup();
    }

    /// Reserve a slot and start a worker for `reply` in the background
    ///
    /// The borrower may go away while the worker starts; the finished worker
    /// then goes back to the pool instead of leaking the slot.
    fn spawn_creation(self: &Arc<Self>, state: &mut PoolState, reply: Waiter) {
        let Ok(runtime) = Handle::try_current() else {
            let _ = reply.send(Err(PoolError::factory(
                "worker creation requires a Tokio runtime",
            )));
            return;
        };

        let slot = state.next_worker_id;
        state.next_worker_id += 1;
        let scope = AbortSignal::new();
        state.initializing.insert(slot, scope.clone());
        debug!(pool = %self.options.name, worker_id = slot, "Creating worker");

        let pool = Arc::downgrade(self);
        let factory = Arc::clone(&self.factory);
        let options = Arc::clone(&self.options);
        runtime.spawn(async move {
            let result = init_worker(&pool, factory.as_ref(), &options, slot, scope).await;
            if let Err(Ok(handle)) = reply.send(result) {
                if let Some(pool) = pool.upgrade() {
                    debug!(worker_id = handle.id(), "Borrower went away, keeping new worker");
                    pool.release(&handle);
                }
            }
        });
    }

    fn finish_creation(
        self: &Arc<Self>,
        slot: u64,
        scope: AbortSignal,
        ready: Result<(Arc<dyn Worker>, Subscription)>,
    ) -> Result<WorkerHandle> {
        let mut state = self.state.lock();
        let tracked = state.initializing.remove(&slot).is_some();

        match ready {
            Ok((worker, events)) if tracked && !scope.is_aborted() => {
                let handle = WorkerHandle::new(slot, self.id, worker, scope);
                state.workers.insert(slot, handle.clone());
                drop(state);

                debug!(pool = %self.options.name, worker_id = slot, "Worker ready");
                self.watch_worker(handle.clone(), events);
                Ok(handle)
            }
            Ok((worker, _)) => {
                drop(state);
                worker.terminate();
                Err(scope.reason())
            }
            Err(err) => {
                if tracked {
                    self.fail_pending(&mut state, &err);
                }
                drop(state);
                warn!(
                    pool = %self.options.name,
                    worker_id = slot,
                    error = %err,
                    "Worker initialization failed"
                );
                Err(err)
            }
        }
    }

    /// Destroy the worker on its first fatal error
    fn watch_worker(self: &Arc<Self>, handle: WorkerHandle, mut events: Subscription) {
        let pool = Arc::downgrade(self);
        tokio::spawn(async move {
            let message = loop {
                tokio::select! {
                    biased;
                    _ = handle.scope().aborted() => return,
                    event = events.recv() => match event {
                        Some(WorkerEvent::Fatal(message)) => break message,
                        Some(WorkerEvent::Message(_)) => {}
                        None => break "worker channel closed".to_string(),
                    },
                }
            };
            drop(events);

            let Some(pool) = pool.upgrade() else {
                return;
            };
            error!(
                pool = %pool.options.name,
                worker_id = handle.id(),
                error = %message,
                "Worker failed"
            );
            if pool.destroy_worker(&handle, PoolError::WorkerCrashed { message }) {
                pool.process_pending();
            }
        });
    }

    fn destroy_worker(&self, handle: &WorkerHandle, reason: PoolError) -> bool {
        let removed = {
            let mut state = self.state.lock();
            state.tracks(self.id, handle) && state.workers.remove(&handle.id()).is_some()
        };
        if removed {
            debug!(pool = %self.options.name, worker_id = handle.id(), "Destroying worker");
            handle.shutdown(reason);
        }
        removed
    }

    fn process_pending(self: &Arc<Self>) {
        let mut state = self.state.lock();
        self.process_pending_locked(&mut state);
    }

    /// Serve queued borrowers in order: idle workers first, then new ones
    fn process_pending_locked(self: &Arc<Self>, state: &mut PoolState) {
        while let Some(waiter) = state.pending.pop_front() {
            if waiter.is_closed() {
                continue;
            }
            if let Some(handle) = state.take_idle() {
                if let Err(Ok(handle)) = waiter.send(Ok(handle)) {
                    handle.set_busy(false);
                }
                continue;
            }
            if state.total() < self.options.max_workers {
                self.spawn_creation(state, waiter);
                continue;
            }
            state.pending.push_front(waiter);
            break;
        }
    }

    fn fail_pending(&self, state: &mut PoolState, err: &PoolError) {
        for waiter in state.pending.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
    }

    /// Re-arm the single idle reclamation timer
    fn schedule_cleanup(self: &Arc<Self>) {
        let timeout = self.options.idle_timeout;
        if timeout.is_zero() {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            return;
        };

        let mut state = self.state.lock();
        state.cleanup_generation += 1;
        let generation = state.cleanup_generation;

        let pool = Arc::downgrade(self);
        let task = runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(pool) = pool.upgrade() {
                pool.reclaim_idle(generation);
            }
        });

        let timer = CleanupTimer {
            generation,
            task: task.abort_handle(),
        };
        if let Some(previous) = state.cleanup.replace(timer) {
            previous.task.abort();
        }
    }

    fn reclaim_idle(&self, generation: u64) {
        let retired: Vec<WorkerHandle> = {
            let mut state = self.state.lock();
            let current = state
                .cleanup
                .as_ref()
                .is_some_and(|timer| timer.generation == generation);
            if !current {
                return;
            }
            state.cleanup = None;
            if !state.pending.is_empty() {
                return;
            }

            let idle: Vec<u64> = state
                .workers
                .values()
                .filter(|h| !h.is_busy())
                .map(WorkerHandle::id)
                .collect();
            let excess = idle.len().saturating_sub(self.options.min_idle_workers);
            idle.into_iter()
                .take(excess)
                .filter_map(|id| state.workers.remove(&id))
                .collect()
        };

        if !retired.is_empty() {
            debug!(
                pool = %self.options.name,
                count = retired.len(),
                "Reclaiming idle workers"
            );
        }
        for handle in retired {
            let reason = PoolError::WorkerDestroyed { id: handle.id() };
            handle.shutdown(reason);
        }
    }

    fn teardown(&self) {
        let (workers, initializing, pending, cleanup) = {
            let mut state = self.state.lock();
            (
                std::mem::take(&mut state.workers),
                std::mem::take(&mut state.initializing),
                std::mem::take(&mut state.pending),
                state.cleanup.take(),
            )
        };

        if let Some(timer) = cleanup {
            timer.task.abort();
        }
        let reason = PoolError::Destroyed {
            name: self.options.name.clone(),
        };
        for handle in workers.into_values() {
            handle.shutdown(reason.clone());
        }
        for scope in initializing.into_values() {
            scope.abort_with(reason.clone());
        }
        for waiter in pending {
            let _ = waiter.send(Err(reason.clone()));
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Create a worker and complete its readiness handshake
async fn init_worker(
    pool: &Weak<PoolInner>,
    factory: &dyn WorkerFactory,
    options: &PoolOptions,
    slot: u64,
    scope: AbortSignal,
) -> Result<WorkerHandle> {
    let created = tokio::select! {
        biased;
        reason = scope.aborted() => Err(reason),
        created = factory.create(&options.worker) => created,
    };

    // One subscription spans the handshake and the fatal watcher
    let ready = match created {
        Ok(worker) => {
            let mut events = worker.subscribe();
            match wait_for_ready_on(&mut events, options.init_timeout, Some(&scope)).await {
                Ok(()) => Ok((worker, events)),
                Err(err) => {
                    worker.terminate();
                    Err(err)
                }
            }
        }
        Err(err) => Err(err),
    };

    match pool.upgrade() {
        Some(pool) => pool.finish_creation(slot, scope, ready),
        None => match ready {
            Ok((worker, _)) => {
                worker.terminate();
                Err(scope.reason())
            }
            Err(err) => Err(err),
        },
    }
}
