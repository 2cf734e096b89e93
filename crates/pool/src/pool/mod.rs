//! Worker pool
//!
//! This module provides:
//! - [`WorkerPool`] - Bounded pool of workers behind a single call interface
//! - [`PoolConfig`] / [`PoolOptions`] - Raw and normalized configuration
//! - [`WorkerHandle`] / [`WorkerLease`] - Borrowed workers
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        WorkerPool                            │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐   │
//! │  │   workers    │  │ initializing │  │  pending (FIFO)  │   │
//! │  │ idle / busy  │  │  abort scope │  │  oneshot waiters │   │
//! │  └──────┬───────┘  └──────┬───────┘  └──────────────────┘   │
//! │         │                 │                                  │
//! │         │                 ▼                                  │
//! │         │        WorkerFactory + readiness handshake        │
//! │         ▼                                                    │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │   call protocol (one correlation id per request)    │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! │                                                              │
//! │  idle reclamation timer (debounced, re-armed on return)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use offload_pool::prelude::*;
//!
//! let source = WorkerSource::thread(|mut scope| async move {
//!     scope
//!         .expose(MethodTable::new().method("double", |args| async move {
//!             let n = args.first().and_then(Value::as_i64).unwrap_or(0);
//!             Ok::<_, Value>(Value::Int(n * 2))
//!         }))
//!         .await?;
//!     Ok(())
//! });
//!
//! let pool = WorkerPool::new(source, PoolConfig::new().with_max_workers(4))?;
//! let doubled = pool.call("double", vec![Value::Int(21)]).await?;
//! pool.destroy();
//! ```

mod handle;
pub mod options;
mod scheduler;

pub use handle::{WorkerHandle, WorkerLease};
pub use options::{
    default_max_workers, PoolConfig, PoolOptions, WorkerOptions, DEFAULT_CREATION_DELAY,
    DEFAULT_IDLE_TIMEOUT, DEFAULT_INIT_TIMEOUT, DEFAULT_MIN_IDLE_WORKERS, DEFAULT_POOL_NAME,
};
pub use scheduler::{PoolStatus, WorkerPool};
