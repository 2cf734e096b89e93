//! Host side of the readiness handshake

use std::time::Duration;

use tokio::time::sleep;

use crate::abort::{wait_aborted, AbortSignal};
use crate::channel::{Subscription, Worker, WorkerEvent};
use crate::error::{PoolError, Result, DEFAULT_INIT_ABORT_REASON};
use crate::protocol::message::Envelope;

/// Wait for `worker` to send its init signal
///
/// Fails with the worker's own init error, with
/// [`PoolError::InitializationCrashed`] if it dies first, with
/// [`PoolError::InitializationTimeout`] once `timeout` elapses (zero waits
/// forever) or with the signal's reason when cancelled.
pub async fn wait_for_worker_ready(
    worker: &dyn Worker,
    timeout: Duration,
    signal: Option<&AbortSignal>,
) -> Result<()> {
    let mut events = worker.subscribe();
    wait_for_ready_on(&mut events, timeout, signal).await
}

/// Same as [`wait_for_worker_ready`], on a subscription the caller keeps
///
/// Events queued behind the init signal stay in `events`, so a listener
/// taking over afterwards sees every one of them.
pub async fn wait_for_ready_on(
    events: &mut Subscription,
    timeout: Duration,
    signal: Option<&AbortSignal>,
) -> Result<()> {
    let deadline = async {
        if timeout.is_zero() {
            std::future::pending::<()>().await;
        } else {
            sleep(timeout).await;
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            biased;
            reason = wait_aborted(signal) => return Err(init_abort_reason(reason, signal)),
            _ = &mut deadline => return Err(PoolError::InitializationTimeout { timeout }),
            event = events.recv() => match event {
                Some(WorkerEvent::Message(message)) => {
                    if let Some(Envelope::Init(init)) = Envelope::parse(&message) {
                        return init.into_result();
                    }
                }
                Some(WorkerEvent::Fatal(message)) => {
                    return Err(PoolError::InitializationCrashed { message });
                }
                None => {
                    return Err(PoolError::InitializationCrashed {
                        message: "worker channel closed before initialization".to_string(),
                    });
                }
            },
        }
    }
}

// A signal aborted without an explicit reason reports an init-specific one
fn init_abort_reason(reason: PoolError, signal: Option<&AbortSignal>) -> PoolError {
    match signal {
        Some(signal) if signal.has_default_reason() => {
            PoolError::aborted_with(DEFAULT_INIT_ABORT_REASON)
        }
        _ => reason,
    }
}
