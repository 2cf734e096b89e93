//! Worker sources and the factory seam
//!
//! A [`WorkerSource`] says *what* a pool runs; a [`WorkerFactory`] turns the
//! pool's [`WorkerOptions`] into a live [`Worker`]. The pool only ever talks
//! to the factory.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;

use crate::channel::Worker;
use crate::error::{PoolError, Result};
use crate::pool::options::WorkerOptions;
use crate::worker::{ThreadEntry, ThreadWorker, WorkerScope};

/// What a lazily resolved source produced
#[derive(Clone)]
pub enum ResolvedSource {
    /// Run this entry on a new thread worker
    Entry(ThreadEntry),
    /// Use this already constructed worker
    Worker(Arc<dyn Worker>),
}

impl ResolvedSource {
    pub fn entry<F, Fut>(entry: F) -> Self
    where
        F: Fn(WorkerScope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + 'static,
    {
        ResolvedSource::Entry(thread_entry(entry))
    }

    pub fn worker(worker: impl Worker) -> Self {
        ResolvedSource::Worker(Arc::new(worker))
    }
}

/// Async callback resolving a worker source
pub type SourceCallback =
    Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<ResolvedSource>> + Send + Sync>;

/// What the pool runs in each worker
#[derive(Clone)]
pub enum WorkerSource {
    /// Entry point run on a dedicated thread per worker
    Thread(ThreadEntry),
    /// Callback invoked to resolve each worker
    ///
    /// Once it yields an entry, that entry is reused and the callback is not
    /// called again. Callbacks yielding ready-made workers run every time.
    Callback(SourceCallback),
}

impl WorkerSource {
    /// Source running `entry` on a thread worker
    pub fn thread<F, Fut>(entry: F) -> Self
    where
        F: Fn(WorkerScope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + 'static,
    {
        WorkerSource::Thread(thread_entry(entry))
    }

    /// Source resolved by an async callback
    pub fn callback<F, Fut>(callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ResolvedSource>> + Send + 'static,
    {
        WorkerSource::Callback(Arc::new(move || callback().boxed()))
    }
}

fn thread_entry<F, Fut>(entry: F) -> ThreadEntry
where
    F: Fn(WorkerScope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + 'static,
{
    Arc::new(move |scope| entry(scope).boxed_local())
}

/// Creates workers for a pool
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    /// Create one worker with the pool's pass-through options
    async fn create(&self, options: &WorkerOptions) -> Result<Arc<dyn Worker>>;
}

/// [`WorkerFactory`] backed by a [`WorkerSource`]
pub struct SourceFactory {
    source: WorkerSource,
    resolved: Mutex<Option<ThreadEntry>>,
}

impl SourceFactory {
    pub fn new(source: WorkerSource) -> Self {
        Self {
            source,
            resolved: Mutex::new(None),
        }
    }
}

#[async_trait]
impl WorkerFactory for SourceFactory {
    async fn create(&self, options: &WorkerOptions) -> Result<Arc<dyn Worker>> {
        let callback = match &self.source {
            WorkerSource::Thread(entry) => return spawn_thread(options, entry.clone()),
            WorkerSource::Callback(callback) => Arc::clone(callback),
        };

        let cached = self.resolved.lock().clone();
        if let Some(entry) = cached {
            return spawn_thread(options, entry);
        }

        match callback().await.map_err(|e| PoolError::factory(format!("{e:#}")))? {
            ResolvedSource::Entry(entry) => {
                *self.resolved.lock() = Some(entry.clone());
                spawn_thread(options, entry)
            }
            ResolvedSource::Worker(worker) => Ok(worker),
        }
    }
}

fn spawn_thread(options: &WorkerOptions, entry: ThreadEntry) -> Result<Arc<dyn Worker>> {
    Ok(Arc::new(ThreadWorker::spawn(options, entry)?))
}
