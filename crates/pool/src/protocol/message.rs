//! Wire envelopes exchanged between the pool and its workers
//!
//! Every protocol message is a [`Value::Map`] carrying a numeric correlation
//! id under the reserved [`MESSAGE_ID_KEY`]. Anything without one is foreign
//! traffic and is ignored by every listener.

use std::collections::BTreeMap;

use crate::error::{PoolError, Result};
use crate::value::{ErrorValue, Value};

/// Reserved key holding the correlation id
pub const MESSAGE_ID_KEY: &str = "@offload/pool\0id\0";

/// Correlation id reserved for the readiness signal
pub const INIT_MESSAGE_ID: i64 = -1;

const METHOD_KEY: &str = "method";
const ARGS_KEY: &str = "args";
const RESULT_KEY: &str = "result";
const ERROR_KEY: &str = "error";

/// Correlation id of a message, if it is a protocol envelope
pub fn message_id(message: &Value) -> Option<i64> {
    match message.get(MESSAGE_ID_KEY)? {
        Value::Int(id) => Some(*id),
        Value::Float(id) if id.is_finite() && id.fract() == 0.0 => Some(*id as i64),
        _ => None,
    }
}

/// Request sent by the pool to a worker
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: i64,
    pub method: String,
    pub args: Vec<Value>,
}

/// Reply sent by a worker for a [`Request`]
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: i64,
    pub result: Option<Value>,
    pub error: Option<Value>,
}

impl Response {
    pub fn success(id: i64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: i64, error: Value) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Settle a call from this response
    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(error) => Err(PoolError::Remote(error)),
            None => Ok(self.result.unwrap_or_default()),
        }
    }
}

/// One-shot readiness signal sent by a worker after startup
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InitSignal {
    pub error: Option<Value>,
}

impl InitSignal {
    pub fn ready() -> Self {
        Self { error: None }
    }

    /// Failed initialization; non-error values are coerced into an [`ErrorValue`]
    pub fn failed(error: Value) -> Self {
        let error = match error {
            Value::Error(_) => error,
            Value::Null => Value::Error(ErrorValue::new("Unknown error")),
            Value::String(message) => Value::Error(ErrorValue::new(message)),
            other => Value::Error(ErrorValue::new(other.to_string())),
        };
        Self { error: Some(error) }
    }

    pub fn into_result(self) -> Result<()> {
        match self.error {
            Some(error) => Err(PoolError::Initialization(error)),
            None => Ok(()),
        }
    }
}

/// A classified protocol message
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Request(Request),
    Response(Response),
    Init(InitSignal),
}

impl Envelope {
    /// Classify a raw message; `None` for foreign or malformed traffic
    pub fn parse(message: &Value) -> Option<Self> {
        let id = message_id(message)?;
        let fields = message.as_map()?;

        if id == INIT_MESSAGE_ID {
            return Some(Envelope::Init(InitSignal {
                error: present(fields.get(ERROR_KEY)),
            }));
        }

        if let Some(method) = fields.get(METHOD_KEY) {
            return Some(Envelope::Request(Request {
                id,
                method: method.as_str()?.to_string(),
                args: fields.get(ARGS_KEY)?.as_list()?.to_vec(),
            }));
        }

        Some(Envelope::Response(Response {
            id,
            result: fields.get(RESULT_KEY).cloned(),
            error: present(fields.get(ERROR_KEY)),
        }))
    }
}

fn present(value: Option<&Value>) -> Option<Value> {
    value.filter(|value| !value.is_null()).cloned()
}

fn envelope(id: i64) -> BTreeMap<String, Value> {
    let mut fields = BTreeMap::new();
    fields.insert(MESSAGE_ID_KEY.to_string(), Value::Int(id));
    fields
}

impl From<Request> for Value {
    fn from(request: Request) -> Self {
        let mut fields = envelope(request.id);
        fields.insert(METHOD_KEY.to_string(), Value::String(request.method));
        fields.insert(ARGS_KEY.to_string(), Value::List(request.args));
        Value::Map(fields)
    }
}

impl From<Response> for Value {
    fn from(response: Response) -> Self {
        let mut fields = envelope(response.id);
        if let Some(result) = response.result {
            fields.insert(RESULT_KEY.to_string(), result);
        }
        if let Some(error) = response.error {
            fields.insert(ERROR_KEY.to_string(), error);
        }
        Value::Map(fields)
    }
}

impl From<InitSignal> for Value {
    fn from(signal: InitSignal) -> Self {
        let mut fields = envelope(INIT_MESSAGE_ID);
        if let Some(error) = signal.error {
            fields.insert(ERROR_KEY.to_string(), error);
        }
        Value::Map(fields)
    }
}
