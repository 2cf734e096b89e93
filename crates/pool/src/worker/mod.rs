//! Worker side of the pool
//!
//! Code running inside a worker receives a [`WorkerScope`], exposes a
//! [`MethodTable`] and then serves requests until the pool terminates it:
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                 worker thread                 │
//! │                                               │
//! │  entry(scope)                                 │
//! │    └─ scope.expose(methods)                   │
//! │         ├─ notify_ready  ──▶ Init{id: -1}     │
//! │         └─ serve loop                         │
//! │              Request{id} ──▶ dispatch ──▶     │
//! │                              Response{id}     │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! [`ThreadWorker`] is the built-in backend; anything implementing
//! [`crate::Worker`] can be pooled instead.

mod dispatcher;
mod scope;
mod thread;

pub use dispatcher::{MethodResult, MethodTable, WorkerResult};
pub use scope::WorkerScope;
pub use thread::{ThreadEntry, ThreadWorker};
