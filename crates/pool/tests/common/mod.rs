//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use offload_pool::prelude::*;
use offload_pool::ThreadEntry;

/// Methods every test worker exposes
///
/// - `echo(value)` returns its argument
/// - `sleep(ms, value)` waits, then returns `value`
/// - `error(value)` fails with `value`
/// - `transfer(binary)` hands the argument back by transfer
/// - `inspect(binary)` describes the view it received
pub fn methods() -> MethodTable {
    MethodTable::new()
        .method("echo", |args| async move {
            Ok::<_, Value>(args.into_iter().next().unwrap_or_default())
        })
        .method("sleep", |args| async move {
            let ms = args.first().and_then(Value::as_i64).unwrap_or(0).max(0);
            tokio::time::sleep(Duration::from_millis(ms as u64)).await;
            Ok::<_, Value>(args.get(1).cloned().unwrap_or_default())
        })
        .method("error", |args| async move {
            Err::<Value, _>(args.into_iter().next().unwrap_or_default())
        })
        .method("transfer", |args| async move {
            let view = binary_arg(&args)?;
            let buffer = view.buffer().clone();
            Ok::<_, Value>(WorkerResult::new(view, vec![buffer]))
        })
        .method("inspect", |args| async move {
            let view = binary_arg(&args)?;
            Ok::<_, Value>(Value::map([
                ("byte_offset", Value::Int(view.byte_offset() as i64)),
                ("byte_length", Value::Int(view.byte_length() as i64)),
                ("backing_length", Value::Int(view.backing_length() as i64)),
            ]))
        })
}

fn binary_arg(args: &[Value]) -> std::result::Result<BinaryView, Value> {
    args.first()
        .and_then(Value::as_binary)
        .cloned()
        .ok_or_else(|| ErrorValue::with_name("TypeError", "expected a binary argument").into())
}

/// Source exposing [`methods`]
pub fn source() -> WorkerSource {
    counted_source(Arc::new(AtomicUsize::new(0)))
}

/// Source exposing [`methods`], counting started workers
pub fn counted_source(started: Arc<AtomicUsize>) -> WorkerSource {
    WorkerSource::thread(move |mut scope| {
        started.fetch_add(1, Ordering::SeqCst);
        async move {
            scope.expose(methods()).await?;
            Ok(())
        }
    })
}

/// Raw entry exposing [`methods`]
pub fn entry() -> ThreadEntry {
    Arc::new(|mut scope| {
        async move {
            scope.expose(methods()).await?;
            Ok(())
        }
        .boxed_local()
    })
}

/// Poll `condition` until it holds, failing after five seconds
pub async fn until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Run `future` with a deadline so a hung pool fails the test instead
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), future)
        .await
        .expect("operation timed out")
}
