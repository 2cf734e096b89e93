//! Parallel Echo Example - Fan work out to a small pool
//!
//! Starts a pool of thread workers exposing a slow `echo` and a `checksum`
//! method, fires more calls than there are workers and prints the pool
//! status along the way. Idle workers are reclaimed after a short timeout.
//!
//! Run with: RUST_LOG=offload_pool=debug cargo run -p offload-pool --example parallel_echo

use std::time::{Duration, Instant};

use futures::future::join_all;
use offload_pool::prelude::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn methods() -> MethodTable {
    MethodTable::new()
        .method("echo", |args| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, Value>(args.into_iter().next().unwrap_or_default())
        })
        .method("checksum", |args| async move {
            let view = args
                .first()
                .and_then(Value::as_binary)
                .cloned()
                .ok_or_else(|| Value::from(ErrorValue::with_name("TypeError", "expected bytes")))?;
            let sum = view
                .to_vec()
                .iter()
                .fold(0u32, |acc, byte| acc.wrapping_mul(31).wrapping_add(u32::from(*byte)));
            Ok::<_, Value>(Value::from(sum))
        })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "offload_pool=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    println!("=== Parallel Echo (offload-pool) ===\n");

    // 1. Configure from the environment, with demo-friendly overrides
    let config = PoolConfig::from_env()?
        .with_name("demo")
        .with_max_workers(3)
        .with_min_idle_workers(0)
        .with_idle_timeout(Duration::from_millis(500));

    // 2. Start the pool
    let pool = WorkerPool::new(
        WorkerSource::thread(|mut scope| async move {
            scope.expose(methods()).await?;
            Ok(())
        }),
        config,
    )?;

    // 3. Nine calls on three workers: three rounds
    let started = Instant::now();
    let calls = (0..9).map(|i| pool.call("echo", vec![Value::Int(i)]));
    let results = join_all(calls).await;
    for result in &results {
        match result {
            Ok(value) => print!("{value} "),
            Err(err) => print!("<{err}> "),
        }
    }
    println!("\n\n(9 calls in {:?})", started.elapsed());
    println!("status: {:?}", pool.status());

    // 4. Move a large buffer instead of copying it
    let payload = BinaryView::new((0..=255).cycle().take(1 << 20).collect());
    let buffer = payload.buffer().clone();
    let checksum = pool
        .call_with(
            CallRequest::new("checksum", vec![Value::Binary(payload.clone())])
                .with_transfer(vec![buffer]),
        )
        .await?;
    println!("checksum: {checksum} (payload detached: {})", payload.buffer().is_detached());

    // 5. Remote errors come back unchanged
    match pool.call("checksum", vec![Value::from("not bytes")]).await {
        Err(err) => println!("remote error: {err}"),
        Ok(value) => println!("unexpected: {value}"),
    }

    // 6. Let idle reclamation retire the workers
    tokio::time::sleep(Duration::from_millis(700)).await;
    println!("status after idle timeout: {:?}", pool.status());

    pool.destroy();
    Ok(())
}
