//! Worker pool behavior against real thread-backed workers

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use offload_pool::prelude::*;
use offload_pool::protocol::{Response, MESSAGE_ID_KEY};
use offload_pool::ThreadWorker;
use parking_lot::Mutex;

use common::{counted_source, entry, methods, source, until, within};

fn config(name: &str) -> PoolConfig {
    PoolConfig::new().with_name(name)
}

#[test_log::test(tokio::test)]
async fn test_parallel_calls_use_separate_workers() {
    let started = Arc::new(AtomicUsize::new(0));
    let pool = WorkerPool::new(counted_source(started.clone()), config("parallel").with_max_workers(4))
        .unwrap();

    let calls = (0..4).map(|i| pool.call("sleep", vec![Value::Int(100), Value::Int(i)]));
    let results = within(join_all(calls)).await;

    let results: Vec<i64> = results
        .into_iter()
        .map(|r| r.unwrap().as_i64().unwrap())
        .collect();
    assert_eq!(results, vec![0, 1, 2, 3]);
    assert_eq!(started.load(Ordering::SeqCst), 4);
    assert_eq!(
        pool.status(),
        PoolStatus {
            total: 4,
            idle: 4,
            busy: 0,
            initializing: 0
        }
    );
}

#[tokio::test]
async fn test_calls_beyond_capacity_wait() {
    let started = Arc::new(AtomicUsize::new(0));
    let pool = WorkerPool::new(counted_source(started.clone()), config("bounded").with_max_workers(2))
        .unwrap();

    let calls = (0..6).map(|i| pool.call("sleep", vec![Value::Int(20), Value::Int(i)]));
    let results = within(join_all(calls)).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(started.load(Ordering::SeqCst), 2);
    assert_eq!(pool.status().total, 2);
    assert_eq!(pool.pending_count(), 0);
}

#[tokio::test]
async fn test_pending_borrows_served_in_order() {
    let pool = WorkerPool::new(source(), config("fifo").with_max_workers(1)).unwrap();
    let first = pool.borrow_worker().await.unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut waiters = Vec::new();
    for i in 0..3 {
        let borrower = pool.clone();
        let order = order.clone();
        waiters.push(tokio::spawn(async move {
            let handle = borrower.borrow_worker().await.unwrap();
            order.lock().push(i);
            borrower.return_worker(&handle);
        }));
        until(|| pool.pending_count() == i + 1).await;
    }

    pool.return_worker(&first);
    for waiter in waiters {
        within(waiter).await.unwrap();
    }
    assert_eq!(*order.lock(), vec![0, 1, 2]);
}

#[tokio::test]
async fn test_idle_workers_reclaimed_to_zero() {
    let pool = WorkerPool::new(
        source(),
        config("reclaim")
            .with_max_workers(2)
            .with_min_idle_workers(0)
            .with_idle_timeout(Duration::from_millis(100)),
    )
    .unwrap();

    let calls = (0..2).map(|_| pool.call("sleep", vec![Value::Int(50)]));
    within(join_all(calls)).await;
    assert_eq!(pool.status().total, 2);

    until(|| pool.status().total == 0).await;
}

#[tokio::test]
async fn test_idle_reclaim_keeps_min_idle() {
    let pool = WorkerPool::new(
        source(),
        config("reclaim-min")
            .with_max_workers(3)
            .with_min_idle_workers(1)
            .with_idle_timeout(Duration::from_millis(100)),
    )
    .unwrap();

    let calls = (0..3).map(|_| pool.call("sleep", vec![Value::Int(50)]));
    within(join_all(calls)).await;
    assert_eq!(pool.status().total, 3);

    until(|| pool.status().total == 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(pool.status().idle, 1);
}

#[tokio::test]
async fn test_destroy_idle_pool_is_reusable() {
    let started = Arc::new(AtomicUsize::new(0));
    let pool = WorkerPool::new(counted_source(started.clone()), config("reuse")).unwrap();
    pool.call("echo", vec![Value::Int(1)]).await.unwrap();

    pool.destroy();
    pool.destroy();
    assert_eq!(pool.status(), PoolStatus::default());

    let result = within(pool.call("echo", vec![Value::Int(2)])).await.unwrap();
    assert_eq!(result, Value::Int(2));
    assert_eq!(started.load(Ordering::SeqCst), 2);
}

#[test_log::test(tokio::test)]
async fn test_destroy_rejects_busy_call() {
    let pool = WorkerPool::new(source(), config("busy")).unwrap();

    let call = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.call("sleep", vec![Value::Int(5000)]).await })
    };
    until(|| pool.status().busy == 1).await;

    pool.destroy();
    let err = within(call).await.unwrap().unwrap_err();
    assert!(err.is_destroyed());
    assert_eq!(err.to_string(), "Worker pool busy has been destroyed");
    assert_eq!(pool.status(), PoolStatus::default());
}

#[tokio::test]
async fn test_destroy_rejects_initializing_worker() {
    let source = WorkerSource::thread(|mut scope| async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        scope.expose(methods()).await?;
        Ok(())
    });
    let pool = WorkerPool::new(source, config("slow-start")).unwrap();

    let call = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.call("echo", vec![]).await })
    };
    until(|| pool.status().initializing == 1).await;

    pool.destroy();
    let err = within(call).await.unwrap().unwrap_err();
    assert!(err.is_destroyed());
    assert_eq!(pool.status(), PoolStatus::default());
}

#[tokio::test]
async fn test_destroy_rejects_pending_borrow() {
    let pool = WorkerPool::new(source(), config("queue").with_max_workers(1)).unwrap();
    let _held = pool.borrow_worker().await.unwrap();

    let call = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.call("echo", vec![]).await })
    };
    until(|| pool.pending_count() == 1).await;

    pool.destroy();
    let err = within(call).await.unwrap().unwrap_err();
    assert!(err.is_destroyed());
}

#[tokio::test]
async fn test_remote_errors_keep_their_shape() {
    let pool = WorkerPool::new(source(), config("errors").with_max_workers(1)).unwrap();

    for error in [
        Value::from("test error"),
        Value::map([("message", "test error")]),
        Value::from(ErrorValue::with_name("RangeError", "test error")),
    ] {
        let err = pool.call("error", vec![error.clone()]).await.unwrap_err();
        assert!(err.is_remote());
        assert_eq!(err.remote_value(), Some(&error));
    }

    let err = pool.call("missing", vec![]).await.unwrap_err();
    assert_eq!(err.to_string(), "Error: Method not found: missing");

    // failures do not retire the worker
    assert_eq!(
        pool.status(),
        PoolStatus {
            total: 1,
            idle: 1,
            busy: 0,
            initializing: 0
        }
    );
}

#[tokio::test]
async fn test_foreign_messages_ignored() {
    let source = WorkerSource::thread(|mut scope| async move {
        scope.post(Value::from("hello from the worker"), vec![])?;
        scope.post(Value::map([(MESSAGE_ID_KEY, Value::Int(-10))]), vec![])?;
        scope.post(Response::success(424_242, Value::from("stale")).into(), vec![])?;
        scope.expose(methods()).await?;
        Ok(())
    });
    let pool = WorkerPool::new(source, config("noisy")).unwrap();

    let result = within(pool.call("echo", vec![Value::from("real")])).await.unwrap();
    assert_eq!(result, Value::from("real"));
}

#[test_log::test(tokio::test)]
async fn test_unhandled_worker_error_fails_call() {
    let source = WorkerSource::thread(|mut scope| async move {
        tokio::select! {
            served = scope.expose(methods()) => served?,
            _ = tokio::time::sleep(Duration::from_millis(200)) => {
                return Err(anyhow::anyhow!("unhandled error foo"));
            }
        }
        Ok(())
    });
    let pool = WorkerPool::new(source, config("crashy")).unwrap();

    let err = within(pool.call("sleep", vec![Value::Int(5000)]))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Worker error: unhandled error foo");

    until(|| pool.status().total == 0).await;
}

#[tokio::test]
async fn test_worker_from_other_pool_rejected() {
    let pool_a = WorkerPool::new(source(), config("pool-a")).unwrap();
    let pool_b = WorkerPool::new(source(), config("pool-b")).unwrap();

    let handle = pool_a.borrow_worker().await.unwrap();
    let err = pool_b
        .call_worker(&handle, "echo", vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::Ownership { .. }));
    assert!(err.to_string().starts_with("Invalid tagged worker"));

    let ok = pool_a.call_worker(&handle, "echo", vec![Value::Int(7)]).await;
    assert_eq!(ok.unwrap(), Value::Int(7));
    pool_a.return_worker(&handle);
}

#[tokio::test]
async fn test_init_crash_rejects_call() {
    let source = WorkerSource::thread(|_scope| async move { Err(anyhow::anyhow!("init error")) });
    let pool = WorkerPool::new(source, config("init-crash")).unwrap();

    let err = within(pool.call("echo", vec![])).await.unwrap_err();
    assert_eq!(err.to_string(), "Worker initialization error: init error");
    assert_eq!(pool.status().total, 0);
}

#[tokio::test]
async fn test_init_timeout_rejects_call() {
    let source = WorkerSource::thread(|mut scope| async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        scope.expose(methods()).await?;
        Ok(())
    });
    let pool = WorkerPool::new(
        source,
        config("init-timeout").with_init_timeout(Duration::from_millis(100)),
    )
    .unwrap();

    let err = within(pool.call("echo", vec![])).await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(err.to_string(), "Worker initialization timed out after 100 ms");
    assert_eq!(pool.status().total, 0);
}

#[tokio::test]
async fn test_expose_error_rejects_call() {
    let source = WorkerSource::thread(|mut scope| async move {
        scope
            .expose_with(async { Err(ErrorValue::new("expose error").into()) })
            .await?;
        Ok(())
    });
    let pool = WorkerPool::new(source, config("expose-error")).unwrap();

    let err = within(pool.call("echo", vec![])).await.unwrap_err();
    assert!(matches!(err, PoolError::Initialization(_)));
    assert_eq!(
        err.remote_value(),
        Some(&Value::from(ErrorValue::new("expose error")))
    );
    assert_eq!(pool.status().total, 0);
}

#[tokio::test]
async fn test_call_with_signal_aborts_and_returns_worker() {
    let pool = WorkerPool::new(source(), config("abortable").with_max_workers(1)).unwrap();
    let signal = AbortSignal::new();

    let call = {
        let pool = pool.clone();
        let signal = signal.clone();
        tokio::spawn(async move {
            pool.call_with_signal(CallRequest::new("sleep", vec![Value::Int(5000)]), &signal)
                .await
        })
    };
    until(|| pool.status().busy == 1).await;

    signal.abort_with(PoolError::aborted_with("caller gave up"));
    let err = within(call).await.unwrap().unwrap_err();
    assert_eq!(err.to_string(), "caller gave up");

    // the worker keeps serving
    assert_eq!(pool.status().idle, 1);
    let result = within(pool.call("echo", vec![Value::Int(3)])).await.unwrap();
    assert_eq!(result, Value::Int(3));
}

#[tokio::test]
async fn test_call_with_default_abort_reason() {
    let pool = WorkerPool::new(source(), config("abort-default")).unwrap();
    let signal = AbortSignal::new();
    signal.abort();

    let err = pool
        .call_with_signal(CallRequest::new("echo", vec![]), &signal)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(err.to_string(), "Operation aborted");
}

#[tokio::test]
async fn test_callback_source_resolved_once() {
    let resolved = Arc::new(AtomicUsize::new(0));
    let source = WorkerSource::callback({
        let resolved = resolved.clone();
        move || {
            resolved.fetch_add(1, Ordering::SeqCst);
            async {
                Ok(ResolvedSource::entry(|mut scope| async move {
                    scope.expose(methods()).await?;
                    Ok(())
                }))
            }
        }
    });
    let pool = WorkerPool::new(source, config("lazy").with_max_workers(2)).unwrap();

    let first = pool.lease().await.unwrap();
    let second = pool.lease().await.unwrap();
    assert_ne!(first.id(), second.id());
    assert_eq!(
        pool.call_worker(&second, "echo", vec![Value::Int(9)])
            .await
            .unwrap(),
        Value::Int(9)
    );
    assert_eq!(resolved.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_callback_source_returning_worker() {
    let source = WorkerSource::callback(|| async {
        let worker = ThreadWorker::spawn(&WorkerOptions::new().with_name("prebuilt"), entry())?;
        Ok(ResolvedSource::worker(worker))
    });
    let pool = WorkerPool::new(source, config("prebuilt")).unwrap();

    let result = within(pool.call("echo", vec![Value::from("ok")])).await.unwrap();
    assert_eq!(result, Value::from("ok"));
}

#[tokio::test]
async fn test_callback_source_failure() {
    let source = WorkerSource::callback(|| async { Err(anyhow::anyhow!("Cannot load worker")) });
    let pool = WorkerPool::new(source, config("broken")).unwrap();

    let err = within(pool.call("echo", vec![])).await.unwrap_err();
    assert!(matches!(err, PoolError::Factory(_)));
    assert_eq!(pool.status().total, 0);
}

#[tokio::test]
async fn test_pool_from_environment_lookup() {
    let vars: HashMap<&str, &str> = [
        ("OFFLOAD_POOL_NAME", "from-env"),
        ("OFFLOAD_POOL_MAX_WORKERS", "2"),
        ("OFFLOAD_POOL_MIN_IDLE_WORKERS", "0"),
        ("OFFLOAD_POOL_IDLE_TIMEOUT_MS", "50"),
    ]
    .into_iter()
    .collect();
    let config = PoolConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();

    let pool = WorkerPool::new(source(), config).unwrap();
    assert_eq!(pool.name(), "from-env");
    assert_eq!(pool.options().max_workers, 2);
    assert_eq!(pool.options().idle_timeout, Duration::from_millis(50));

    pool.call("echo", vec![]).await.unwrap();
    until(|| pool.status().total == 0).await;
}

#[tokio::test]
async fn test_dropping_pool_stops_workers() {
    let spawned = Arc::new(Mutex::new(Vec::<Arc<ThreadWorker>>::new()));
    let source = WorkerSource::callback({
        let spawned = spawned.clone();
        move || {
            let spawned = spawned.clone();
            async move {
                let worker = Arc::new(ThreadWorker::spawn(&WorkerOptions::new(), entry())?);
                spawned.lock().push(worker.clone());
                Ok(ResolvedSource::Worker(worker))
            }
        }
    });
    let pool = WorkerPool::new(source, config("dropped")).unwrap();
    pool.call("echo", vec![]).await.unwrap();

    let worker = spawned.lock()[0].clone();
    assert!(!worker.is_terminated());
    drop(pool);
    assert!(worker.is_terminated());
}
