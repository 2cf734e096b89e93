//! Worker capability consumed by the pool
//!
//! A [`Worker`] is anything that can take messages, report messages and
//! fatal errors back, and be terminated. Listening is done through
//! [`Subscription`]s handed out by an [`EventHub`]: every awaiting operation
//! holds its own subscription and dropping it deregisters the listener, so
//! no completion path can leak one.
//!
//! ```text
//!              ┌──────────────┐
//!   worker ───▶│   EventHub   │──▶ Subscription (call #1)
//!   events     │ (+ backlog)  │──▶ Subscription (call #2)
//!              └──────────────┘──▶ Subscription (fatal watcher)
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::value::{ByteBuffer, Value};

/// Event reported by a worker
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A message posted by the worker
    Message(Value),
    /// An unrecoverable worker failure
    Fatal(String),
}

/// Communication channel to one worker
pub trait Worker: Send + Sync + 'static {
    /// Deliver a message, moving ownership of the `transfer` buffers
    fn send(&self, message: Value, transfer: Vec<ByteBuffer>) -> Result<()>;

    /// Start listening for worker events
    fn subscribe(&self) -> Subscription;

    /// Forcibly stop the worker. Idempotent.
    fn terminate(&self);
}

/// Fan-out of worker events to live subscriptions
///
/// Events emitted while nobody listens are held back and handed to the next
/// subscriber, the way a message port queues until a listener attaches.
#[derive(Debug, Default)]
pub struct EventHub {
    state: Mutex<HubState>,
}

#[derive(Debug, Default)]
struct HubState {
    listeners: HashMap<u64, mpsc::UnboundedSender<WorkerEvent>>,
    backlog: VecDeque<WorkerEvent>,
    next_listener: u64,
    closed: bool,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: WorkerEvent) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        if state.listeners.is_empty() {
            state.backlog.push_back(event);
            return;
        }
        state
            .listeners
            .retain(|_, listener| listener.send(event.clone()).is_ok());
    }

    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();

        for event in state.backlog.drain(..) {
            let _ = tx.send(event);
        }

        let id = state.next_listener;
        state.next_listener += 1;
        if !state.closed {
            state.listeners.insert(id, tx);
        }

        Subscription {
            id,
            hub: Arc::downgrade(self),
            events: rx,
        }
    }

    /// End every subscription; later ones end right after the backlog
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.listeners.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }
}

/// Live listener on an [`EventHub`]; deregisters on drop
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    hub: Weak<EventHub>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
}

impl Subscription {
    /// Next event, or `None` once the channel is closed
    pub async fn recv(&mut self) -> Option<WorkerEvent> {
        self.events.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.state.lock().listeners.remove(&self.id);
        }
    }
}
