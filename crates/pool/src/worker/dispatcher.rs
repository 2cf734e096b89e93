//! Method table and request dispatch inside a worker

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::debug;

use crate::protocol::message::{Request, Response};
use crate::value::{ByteBuffer, ErrorValue, Value};

/// Method result with buffers to hand back by transfer
#[derive(Debug, Clone)]
pub struct WorkerResult {
    pub result: Value,
    pub transfer: Vec<ByteBuffer>,
}

impl WorkerResult {
    pub fn new(result: impl Into<Value>, transfer: Vec<ByteBuffer>) -> Self {
        Self {
            result: result.into(),
            transfer,
        }
    }
}

impl From<Value> for WorkerResult {
    fn from(result: Value) -> Self {
        Self {
            result,
            transfer: Vec::new(),
        }
    }
}

/// Outcome of an exposed method: a result or an error value
pub type MethodResult = std::result::Result<WorkerResult, Value>;

type Method = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, MethodResult> + Send + Sync>;

/// Methods a worker exposes to the pool
#[derive(Clone, Default)]
pub struct MethodTable {
    methods: HashMap<String, Method>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async method under `name`
    ///
    /// The handler receives the call arguments and returns either a value
    /// (anything convertible into [`WorkerResult`]) or an error value, which
    /// is delivered to the caller unchanged.
    pub fn method<F, Fut, R>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, Value>> + Send + 'static,
        R: Into<WorkerResult>,
    {
        let method: Method = Arc::new(move |args| {
            let call = handler(args);
            async move { call.await.map(Into::into) }.boxed()
        });
        self.methods.insert(name.into(), method);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Run one request to completion
    ///
    /// Never fails: unknown methods, errors and panics all become an error
    /// response. Returns the response and the buffers to transfer with it.
    pub async fn dispatch(&self, request: Request) -> (Response, Vec<ByteBuffer>) {
        let Request { id, method, args } = request;

        let outcome = match self.methods.get(&method) {
            Some(handler) => AssertUnwindSafe(async { handler(args).await })
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(panic_value(panic.as_ref()))),
            None => {
                debug!(method = %method, "Method not found");
                Err(ErrorValue::new(format!("Method not found: {method}")).into())
            }
        };

        match outcome {
            Ok(WorkerResult { result, transfer }) => (Response::success(id, result), transfer),
            Err(Value::Null) => (
                Response::failure(id, ErrorValue::new("Unknown error").into()),
                Vec::new(),
            ),
            Err(error) => (Response::failure(id, error), Vec::new()),
        }
    }
}

impl fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.methods.keys().collect();
        names.sort();
        f.debug_struct("MethodTable").field("methods", &names).finish()
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_string()
    }
}

fn panic_value(panic: &(dyn Any + Send)) -> Value {
    ErrorValue::with_name("Panic", panic_message(panic)).into()
}
