//! # Offload Worker Pool
//!
//! Runs CPU-heavy work on a bounded set of workers and exposes it through a
//! single async call interface.
//!
//! ## Features
//!
//! - **Correlated calls**: every request carries an id and resolves with the
//!   matching response, the worker's fatal error or caller cancellation
//! - **Readiness handshake**: a worker only joins the pool once it signals its
//!   method table is ready, bounded by an init timeout
//! - **Backpressure**: borrowers beyond `max_workers` wait in FIFO order
//! - **Idle reclamation**: surplus idle workers are retired after a quiet period
//! - **Buffer transfer**: binary payloads move between host and worker instead
//!   of being copied when that is cheaper
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        WorkerPool                            │
//! │  (borrow / return, pending queue, idle reclamation)         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Protocol                                 │
//! │  (envelopes, correlation ids, call, readiness handshake)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │  Worker trait
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                ThreadWorker  /  custom Worker                │
//! │  (WorkerScope::expose serves a MethodTable)                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use offload_pool::prelude::*;
//!
//! let pool = WorkerPool::new(
//!     WorkerSource::thread(|mut scope| async move {
//!         let methods = MethodTable::new().method("echo", |args| async move {
//!             Ok::<_, Value>(args.into_iter().next().unwrap_or_default())
//!         });
//!         scope.expose(methods).await?;
//!         Ok(())
//!     }),
//!     PoolConfig::from_env()?,
//! )?;
//!
//! let reply = pool.call("echo", vec![Value::from("hello")]).await?;
//! ```

pub mod abort;
pub mod channel;
pub mod error;
pub mod factory;
pub mod pool;
pub mod protocol;
pub mod value;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::abort::AbortSignal;
    pub use crate::error::{PoolError, Result};
    pub use crate::factory::{ResolvedSource, WorkerFactory, WorkerSource};
    pub use crate::pool::{
        PoolConfig, PoolOptions, PoolStatus, WorkerHandle, WorkerLease, WorkerOptions, WorkerPool,
    };
    pub use crate::protocol::CallRequest;
    pub use crate::value::{BinaryView, ByteBuffer, ErrorValue, Value};
    pub use crate::worker::{MethodTable, WorkerResult, WorkerScope};
}

// Re-export key types at crate root
pub use abort::AbortSignal;
pub use channel::{EventHub, Subscription, Worker, WorkerEvent};
pub use error::{PoolError, Result};
pub use factory::{ResolvedSource, SourceCallback, SourceFactory, WorkerFactory, WorkerSource};
pub use pool::{
    PoolConfig, PoolOptions, PoolStatus, WorkerHandle, WorkerLease, WorkerOptions, WorkerPool,
};
pub use protocol::{CallRequest, SequenceGenerator};
pub use value::{structured_clone, BinaryView, ByteBuffer, ErrorValue, Value};
pub use worker::{MethodResult, MethodTable, ThreadEntry, ThreadWorker, WorkerResult, WorkerScope};
