//! Correlated request/response over a single worker
//!
//! ```text
//!   call_worker ──▶ check signal ──▶ next id ──▶ compact large views
//!        │                                              │
//!        │            subscribe ◀───────────────────────┘
//!        │                │
//!        │              send ──▶ first of:
//!        │                       ├─ Response{id}   → result / Remote error
//!        │                       ├─ Fatal(msg)     → "Worker error: msg"
//!        │                       ├─ channel closed → ChannelClosed
//!        │                       └─ signal aborted → reason
//!        ▼
//!   subscription dropped on every path
//! ```

use tracing::trace;

use crate::abort::{wait_aborted, AbortSignal};
use crate::channel::{Worker, WorkerEvent};
use crate::error::{PoolError, Result};
use crate::protocol::message::{Envelope, Request};
use crate::protocol::sequence::SequenceGenerator;
use crate::value::{BinaryView, ByteBuffer, Value};

/// Default slack above which a binary argument is compacted and transferred
pub const MAX_COPY_OVERHEAD: usize = 16 * 1024;

/// A method invocation with its arguments
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub method: String,
    pub args: Vec<Value>,
    /// Buffers to transfer instead of copy. `None` lets the protocol decide.
    pub transfer: Option<Vec<ByteBuffer>>,
}

impl CallRequest {
    pub fn new(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            args,
            transfer: None,
        }
    }

    /// Transfer exactly these buffers (an empty list disables compaction)
    pub fn with_transfer(mut self, transfer: Vec<ByteBuffer>) -> Self {
        self.transfer = Some(transfer);
        self
    }
}

/// Whether `view` sits on a backing buffer much larger than itself
pub fn should_compact(view: &BinaryView, max_copy_overhead: usize) -> bool {
    view.byte_length().saturating_add(max_copy_overhead) < view.backing_length()
}

/// Replace oversized binary arguments with tight copies
///
/// Returns the buffers of the copies, which are safe to transfer since
/// nothing else references them.
pub fn compact_args(args: &mut [Value], max_copy_overhead: usize) -> Vec<ByteBuffer> {
    let mut transfer = Vec::new();
    for arg in args.iter_mut() {
        if let Value::Binary(view) = arg {
            if should_compact(view, max_copy_overhead) {
                let copy = view.compact();
                transfer.push(copy.buffer().clone());
                *arg = Value::Binary(copy);
            }
        }
    }
    transfer
}

/// Send one request to `worker` and wait for its settlement
pub async fn call_worker(
    worker: &dyn Worker,
    ids: &SequenceGenerator,
    signal: Option<&AbortSignal>,
    request: CallRequest,
    max_copy_overhead: usize,
) -> Result<Value> {
    if let Some(signal) = signal {
        signal.check()?;
    }

    let id = ids.next_id();
    let CallRequest {
        method,
        mut args,
        transfer,
    } = request;
    let transfer = match transfer {
        Some(transfer) => transfer,
        None => compact_args(&mut args, max_copy_overhead),
    };

    let mut events = worker.subscribe();
    worker.send(Request { id, method, args }.into(), transfer)?;

    loop {
        tokio::select! {
            biased;
            reason = wait_aborted(signal) => return Err(reason),
            event = events.recv() => match event {
                Some(WorkerEvent::Message(message)) => match Envelope::parse(&message) {
                    Some(Envelope::Response(response)) if response.id == id => {
                        return response.into_result();
                    }
                    _ => trace!(id, "Ignoring unrelated worker message"),
                },
                Some(WorkerEvent::Fatal(message)) => return Err(PoolError::WorkerCrashed { message }),
                None => return Err(PoolError::ChannelClosed),
            },
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::channel::{EventHub, Subscription};
    use crate::protocol::message::{Response, MESSAGE_ID_KEY};

    type Responder = Box<dyn Fn(&Request) -> Vec<WorkerEvent> + Send + Sync>;

    /// Worker that answers each request synchronously with scripted events
    pub(crate) struct ScriptedWorker {
        hub: Arc<EventHub>,
        sent: Mutex<Vec<(Value, Vec<ByteBuffer>)>>,
        responder: Responder,
    }

    impl ScriptedWorker {
        pub(crate) fn new(
            responder: impl Fn(&Request) -> Vec<WorkerEvent> + Send + Sync + 'static,
        ) -> Self {
            Self {
                hub: Arc::new(EventHub::new()),
                sent: Mutex::new(Vec::new()),
                responder: Box::new(responder),
            }
        }

        pub(crate) fn hub(&self) -> &Arc<EventHub> {
            &self.hub
        }

        pub(crate) fn sent_count(&self) -> usize {
            self.sent.lock().len()
        }
    }

    impl Worker for ScriptedWorker {
        fn send(&self, message: Value, transfer: Vec<ByteBuffer>) -> Result<()> {
            if let Some(Envelope::Request(request)) = Envelope::parse(&message) {
                for event in (self.responder)(&request) {
                    self.hub.emit(event);
                }
            }
            self.sent.lock().push((message, transfer));
            Ok(())
        }

        fn subscribe(&self) -> Subscription {
            self.hub.subscribe()
        }

        fn terminate(&self) {
            self.hub.close();
        }
    }

    fn echo(request: &Request) -> Vec<WorkerEvent> {
        let result = request.args.first().cloned().unwrap_or_default();
        vec![WorkerEvent::Message(Response::success(request.id, result).into())]
    }

    #[tokio::test]
    async fn test_resolves_with_matching_response() {
        let worker = ScriptedWorker::new(|request| {
            vec![
                WorkerEvent::Message(Value::from("diagnostic")),
                WorkerEvent::Message(Value::map([(MESSAGE_ID_KEY, Value::Int(-10))])),
                WorkerEvent::Message(Response::success(request.id + 100, Value::from("wrong")).into()),
                WorkerEvent::Message(Response::success(request.id, Value::from("right")).into()),
            ]
        });
        let ids = SequenceGenerator::new();

        let result = call_worker(
            &worker,
            &ids,
            None,
            CallRequest::new("echo", vec![]),
            MAX_COPY_OVERHEAD,
        )
        .await
        .unwrap();
        assert_eq!(result, Value::from("right"));
        assert_eq!(worker.hub().listener_count(), 0);
    }

    #[tokio::test]
    async fn test_remote_error_passthrough() {
        let worker = ScriptedWorker::new(|request| {
            vec![WorkerEvent::Message(
                Response::failure(request.id, Value::map([("code", 7)])).into(),
            )]
        });
        let err = call_worker(
            &worker,
            &SequenceGenerator::new(),
            None,
            CallRequest::new("fail", vec![]),
            MAX_COPY_OVERHEAD,
        )
        .await
        .unwrap_err();
        assert_eq!(err.remote_value(), Some(&Value::map([("code", 7)])));
    }

    #[tokio::test]
    async fn test_fatal_error_wrapped() {
        let worker = ScriptedWorker::new(|_| vec![WorkerEvent::Fatal("segfault".into())]);
        let err = call_worker(
            &worker,
            &SequenceGenerator::new(),
            None,
            CallRequest::new("echo", vec![]),
            MAX_COPY_OVERHEAD,
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "Worker error: segfault");
        assert_eq!(worker.hub().listener_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_channel() {
        let worker = ScriptedWorker::new(|_| vec![]);
        worker.terminate();
        let err = call_worker(
            &worker,
            &SequenceGenerator::new(),
            None,
            CallRequest::new("echo", vec![]),
            MAX_COPY_OVERHEAD,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PoolError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_pre_aborted_sends_nothing() {
        let worker = ScriptedWorker::new(echo);
        let signal = AbortSignal::new();
        signal.abort();

        let err = call_worker(
            &worker,
            &SequenceGenerator::new(),
            Some(&signal),
            CallRequest::new("echo", vec![]),
            MAX_COPY_OVERHEAD,
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "Operation aborted");
        assert_eq!(worker.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_abort_while_waiting() {
        let worker = Arc::new(ScriptedWorker::new(|_| vec![]));
        let signal = AbortSignal::new();

        let call = {
            let worker = worker.clone();
            let signal = signal.clone();
            tokio::spawn(async move {
                call_worker(
                    worker.as_ref(),
                    &SequenceGenerator::new(),
                    Some(&signal),
                    CallRequest::new("never", vec![]),
                    MAX_COPY_OVERHEAD,
                )
                .await
            })
        };

        while worker.sent_count() == 0 {
            tokio::task::yield_now().await;
        }
        signal.abort_with(PoolError::aborted_with("caller gave up"));

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "caller gave up");
        assert_eq!(worker.hub().listener_count(), 0);
    }

    #[test]
    fn test_should_compact() {
        let buffer = ByteBuffer::new(vec![0; 128 * 1024]);
        let small = BinaryView::range(&buffer, 0, 64 * 1024).unwrap();
        assert!(should_compact(&small, MAX_COPY_OVERHEAD));

        let large = BinaryView::range(&buffer, 8 * 1024, 120 * 1024).unwrap();
        assert!(!should_compact(&large, MAX_COPY_OVERHEAD));

        let tight = BinaryView::new(vec![0; 64 * 1024]);
        assert!(!should_compact(&tight, MAX_COPY_OVERHEAD));
        assert!(!should_compact(&tight, 0));
    }

    #[test]
    fn test_compact_args() {
        let buffer = ByteBuffer::new((0..=255).cycle().take(128 * 1024).collect());
        let view = BinaryView::range(&buffer, 1024, 1024).unwrap();
        let mut args = vec![Value::from("keep"), Value::Binary(view.clone())];

        let transfer = compact_args(&mut args, MAX_COPY_OVERHEAD);
        assert_eq!(transfer.len(), 1);

        let compacted = args[1].as_binary().unwrap();
        assert_eq!(compacted, &view);
        assert_eq!(compacted.backing_length(), 1024);
        assert!(compacted.buffer().same_buffer(&transfer[0]));
        assert_eq!(args[0], Value::from("keep"));
        // the caller's view is untouched
        assert_eq!(view.byte_length(), 1024);
    }

    #[tokio::test]
    async fn test_explicit_transfer_skips_compaction() {
        let worker = ScriptedWorker::new(echo);
        let buffer = ByteBuffer::new(vec![1; 128 * 1024]);
        let view = BinaryView::range(&buffer, 0, 16).unwrap();

        call_worker(
            &worker,
            &SequenceGenerator::new(),
            None,
            CallRequest::new("echo", vec![Value::Binary(view)]).with_transfer(vec![]),
            MAX_COPY_OVERHEAD,
        )
        .await
        .unwrap();

        let sent = worker.sent.lock();
        let (message, transfer) = &sent[0];
        assert!(transfer.is_empty());
        let Some(Envelope::Request(request)) = Envelope::parse(message) else {
            panic!("expected request");
        };
        assert_eq!(request.args[0].as_binary().unwrap().backing_length(), 128 * 1024);
    }
}
