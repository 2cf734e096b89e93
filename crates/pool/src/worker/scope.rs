//! Worker-side view of the channel to the pool

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::dispatcher::MethodTable;
use crate::channel::{EventHub, WorkerEvent};
use crate::error::{PoolError, Result};
use crate::protocol::message::{Envelope, InitSignal, Response};
use crate::value::{structured_clone, ByteBuffer, ErrorValue, Value};

/// Handle a worker entry point receives from its host
///
/// Exposes the method table ([`WorkerScope::expose`]), performs the
/// readiness handshake and gives raw access to the channel for diagnostic
/// traffic.
pub struct WorkerScope {
    name: String,
    inbox: mpsc::UnboundedReceiver<Value>,
    host: Arc<EventHub>,
    exposed: bool,
    ready_sent: AtomicBool,
}

impl WorkerScope {
    pub(crate) fn new(
        name: impl Into<String>,
        inbox: mpsc::UnboundedReceiver<Value>,
        host: Arc<EventHub>,
    ) -> Self {
        Self {
            name: name.into(),
            inbox,
            host,
            exposed: false,
            ready_sent: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Post a message to the host, moving the `transfer` buffers
    pub fn post(&self, message: Value, transfer: Vec<ByteBuffer>) -> Result<()> {
        post_message(&self.host, &message, &transfer)
    }

    /// Send the one-time init signal, failed if `error` is set
    pub fn notify_ready(&self, error: Option<Value>) -> Result<()> {
        if self.ready_sent.swap(true, Ordering::SeqCst) {
            return Err(PoolError::AlreadyNotified);
        }
        let signal = match error {
            Some(error) => InitSignal::failed(error),
            None => InitSignal::ready(),
        };
        self.post(signal.into(), Vec::new())
    }

    /// Next raw message from the host, `None` once the worker is shut down
    pub async fn recv(&mut self) -> Option<Value> {
        self.inbox.recv().await
    }

    /// Expose `methods`, signal readiness and serve requests until shutdown
    pub async fn expose(&mut self, methods: MethodTable) -> Result<()> {
        self.expose_with(async move { Ok(methods) }).await
    }

    /// Like [`WorkerScope::expose`], building the table asynchronously
    ///
    /// A failed build is reported to the host through the init signal and
    /// nothing is served.
    pub async fn expose_with<F>(&mut self, init: F) -> Result<()>
    where
        F: Future<Output = std::result::Result<MethodTable, Value>>,
    {
        if self.exposed {
            return Err(PoolError::AlreadyExposed);
        }
        self.exposed = true;

        let methods = match init.await {
            Ok(methods) => methods,
            Err(error) => {
                warn!(worker = %self.name, error = %error, "Worker method table failed to build");
                return self.notify_ready(Some(error));
            }
        };
        self.notify_ready(None)?;
        debug!(worker = %self.name, methods = methods.len(), "Worker serving requests");

        self.serve(Arc::new(methods)).await;
        Ok(())
    }

    async fn serve(&mut self, methods: Arc<MethodTable>) {
        while let Some(message) = self.inbox.recv().await {
            let Some(Envelope::Request(request)) = Envelope::parse(&message) else {
                continue;
            };

            let methods = Arc::clone(&methods);
            let host = Arc::clone(&self.host);
            tokio::spawn(async move {
                let id = request.id;
                let (response, transfer) = methods.dispatch(request).await;
                if let Err(err) = post_message(&host, &response.into(), &transfer) {
                    let fallback = Response::failure(
                        id,
                        ErrorValue::with_name("DataCloneError", err.to_string()).into(),
                    );
                    let _ = post_message(&host, &fallback.into(), &[]);
                }
            });
        }
    }
}

fn post_message(host: &EventHub, message: &Value, transfer: &[ByteBuffer]) -> Result<()> {
    let message = structured_clone(message, transfer)?;
    host.emit(WorkerEvent::Message(message));
    Ok(())
}
