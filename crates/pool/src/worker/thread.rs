//! Thread-backed worker
//!
//! Each [`ThreadWorker`] owns a named OS thread running a current-thread
//! Tokio runtime. The entry point receives a [`WorkerScope`] and usually ends
//! in [`WorkerScope::expose`]. Messages cross the thread boundary through
//! [`structured_clone`], so transfers detach the sender's buffers exactly like
//! they would across a process boundary.
//!
//! ```text
//!   host thread                         worker thread
//!   ┌──────────────┐   inbox (mpsc)    ┌──────────────────────┐
//!   │ ThreadWorker │ ────────────────▶ │ WorkerScope          │
//!   │              │                   │   expose(methods)    │
//!   │  subscribe() │ ◀──────────────── │   post / notify      │
//!   └──────────────┘   EventHub        └──────────────────────┘
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::LocalBoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::dispatcher::panic_message;
use super::scope::WorkerScope;
use crate::channel::{EventHub, Subscription, Worker, WorkerEvent};
use crate::error::{PoolError, Result};
use crate::pool::options::WorkerOptions;
use crate::value::{structured_clone, ByteBuffer, Value};

/// Entry point run on a worker thread
pub type ThreadEntry =
    Arc<dyn Fn(WorkerScope) -> LocalBoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

const DEFAULT_WORKER_NAME: &str = "worker";

/// Worker running on a dedicated OS thread
pub struct ThreadWorker {
    name: String,
    inbox: mpsc::UnboundedSender<Value>,
    events: Arc<EventHub>,
    shutdown: CancellationToken,
}

impl ThreadWorker {
    /// Spawn a worker thread running `entry`
    pub fn spawn(options: &WorkerOptions, entry: ThreadEntry) -> Result<Self> {
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| DEFAULT_WORKER_NAME.to_string());
        let (inbox, rx) = mpsc::unbounded_channel();
        let events = Arc::new(EventHub::new());
        let shutdown = CancellationToken::new();

        let scope = WorkerScope::new(name.clone(), rx, Arc::clone(&events));
        let mut builder = std::thread::Builder::new().name(name.clone());
        if let Some(stack_size) = options.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let thread_events = Arc::clone(&events);
        let thread_shutdown = shutdown.clone();
        builder
            .spawn(move || run(entry, scope, thread_events, thread_shutdown))
            .map_err(|e| PoolError::factory(format!("failed to spawn worker thread: {e}")))?;

        debug!(worker = %name, "Worker thread spawned");
        Ok(Self {
            name,
            inbox,
            events,
            shutdown,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_terminated(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Worker for ThreadWorker {
    fn send(&self, message: Value, transfer: Vec<ByteBuffer>) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(PoolError::ChannelClosed);
        }
        let message = structured_clone(&message, &transfer)?;
        self.inbox
            .send(message)
            .map_err(|_| PoolError::ChannelClosed)
    }

    fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    fn terminate(&self) {
        if !self.shutdown.is_cancelled() {
            debug!(worker = %self.name, "Terminating worker thread");
            self.shutdown.cancel();
        }
        self.events.close();
    }
}

impl Drop for ThreadWorker {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn run(entry: ThreadEntry, scope: WorkerScope, events: Arc<EventHub>, shutdown: CancellationToken) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            events.emit(WorkerEvent::Fatal(format!(
                "failed to start worker runtime: {e}"
            )));
            events.close();
            return;
        }
    };

    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
        runtime.block_on(async {
            tokio::select! {
                result = entry(scope) => Some(result),
                _ = shutdown.cancelled() => None,
            }
        })
    }));

    match outcome {
        Ok(Some(Err(err))) => {
            let message = format!("{err:#}");
            error!(error = %message, "Worker entry failed");
            events.emit(WorkerEvent::Fatal(message));
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(error = %message, "Worker thread panicked");
            events.emit(WorkerEvent::Fatal(message));
        }
        Ok(_) => {}
    }

    // Dropping the runtime cancels in-flight requests
    drop(runtime);
    events.close();
}
