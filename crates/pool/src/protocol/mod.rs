//! Request/response protocol between the pool and its workers
//!
//! - [`message`]: wire envelopes (request, response, init signal)
//! - [`sequence`]: correlation id generator
//! - [`call`]: one correlated call over a worker channel
//! - [`ready`]: host side of the readiness handshake

pub mod call;
pub mod message;
pub mod ready;
pub mod sequence;

pub use call::{call_worker, compact_args, should_compact, CallRequest, MAX_COPY_OVERHEAD};
pub use message::{
    message_id, Envelope, InitSignal, Request, Response, INIT_MESSAGE_ID, MESSAGE_ID_KEY,
};
pub use ready::{wait_for_ready_on, wait_for_worker_ready};
pub use sequence::{SequenceGenerator, MAX_SEQUENCE_ID};
