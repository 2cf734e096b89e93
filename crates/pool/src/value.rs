//! Values carried by worker messages
//!
//! Messages exchanged with workers are dynamic [`Value`]s. Binary payloads are
//! [`BinaryView`]s over shared, detachable [`ByteBuffer`]s, so that sending a
//! message can either copy a buffer or move its allocation to the receiving
//! side (a *transfer*), leaving the sender's buffer detached.
//!
//! ```text
//!   sender                          receiver
//!   ┌──────────────┐   copy      ┌──────────────┐
//!   │ ByteBuffer A │ ──────────▶ │ ByteBuffer A'│   (new allocation)
//!   └──────────────┘             └──────────────┘
//!   ┌──────────────┐   transfer  ┌──────────────┐
//!   │ ByteBuffer B │ ──────────▶ │ ByteBuffer B'│   (same allocation,
//!   │  (detached)  │             └──────────────┘    B reports length 0)
//!   └──────────────┘
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{PoolError, Result};

/// Shared, detachable byte buffer
///
/// Clones share the same storage. Detaching moves the allocation out; every
/// clone then observes an empty, detached buffer.
#[derive(Clone)]
pub struct ByteBuffer {
    inner: Arc<Mutex<Option<Vec<u8>>>>,
}

impl ByteBuffer {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(bytes))),
        }
    }

    /// Length of the backing storage (0 once detached)
    pub fn byte_length(&self) -> usize {
        self.inner.lock().as_ref().map_or(0, Vec::len)
    }

    pub fn is_detached(&self) -> bool {
        self.inner.lock().is_none()
    }

    /// Address of the backing allocation, if still attached
    pub fn address(&self) -> Option<usize> {
        self.inner.lock().as_ref().map(|bytes| bytes.as_ptr() as usize)
    }

    /// Whether both handles refer to the same buffer
    pub fn same_buffer(&self, other: &ByteBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Copy of the whole backing storage
    pub fn to_vec(&self) -> Vec<u8> {
        self.with_bytes(|bytes| bytes.map(<[u8]>::to_vec).unwrap_or_default())
    }

    pub(crate) fn with_bytes<R>(&self, f: impl FnOnce(Option<&[u8]>) -> R) -> R {
        let guard = self.inner.lock();
        f(guard.as_deref())
    }

    pub(crate) fn detach(&self) -> Option<Vec<u8>> {
        self.inner.lock().take()
    }

    fn key(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }
}

impl From<Vec<u8>> for ByteBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl fmt::Debug for ByteBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteBuffer")
            .field("byte_length", &self.byte_length())
            .field("detached", &self.is_detached())
            .finish()
    }
}

/// View over a contiguous region of a [`ByteBuffer`]
#[derive(Clone)]
pub struct BinaryView {
    buffer: ByteBuffer,
    offset: usize,
    len: usize,
}

impl BinaryView {
    /// View covering a freshly allocated buffer
    pub fn new(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        Self {
            buffer: ByteBuffer::new(bytes),
            offset: 0,
            len,
        }
    }

    /// View over `len` bytes of `buffer` starting at `offset`
    ///
    /// Returns `None` when the range does not fit the buffer.
    pub fn range(buffer: &ByteBuffer, offset: usize, len: usize) -> Option<Self> {
        let end = offset.checked_add(len)?;
        if end > buffer.byte_length() {
            return None;
        }
        Some(Self {
            buffer: buffer.clone(),
            offset,
            len,
        })
    }

    pub fn buffer(&self) -> &ByteBuffer {
        &self.buffer
    }

    pub fn byte_offset(&self) -> usize {
        if self.buffer.is_detached() {
            0
        } else {
            self.offset
        }
    }

    /// Length of the viewed region (0 once the buffer is detached)
    pub fn byte_length(&self) -> usize {
        if self.buffer.is_detached() {
            0
        } else {
            self.len
        }
    }

    /// Length of the whole backing buffer
    pub fn backing_length(&self) -> usize {
        self.buffer.byte_length()
    }

    pub fn is_empty(&self) -> bool {
        self.byte_length() == 0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.buffer.with_bytes(|bytes| {
            bytes
                .and_then(|bytes| bytes.get(self.offset..self.offset + self.len))
                .map(<[u8]>::to_vec)
                .unwrap_or_default()
        })
    }

    /// Tightly sized copy of the viewed bytes in a new buffer
    pub fn compact(&self) -> BinaryView {
        BinaryView::new(self.to_vec())
    }
}

impl PartialEq for BinaryView {
    fn eq(&self, other: &Self) -> bool {
        self.to_vec() == other.to_vec()
    }
}

impl fmt::Debug for BinaryView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinaryView")
            .field("byte_offset", &self.byte_offset())
            .field("byte_length", &self.byte_length())
            .field("backing_length", &self.backing_length())
            .finish()
    }
}

impl From<Vec<u8>> for BinaryView {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<&[u8]> for BinaryView {
    fn from(bytes: &[u8]) -> Self {
        Self::new(bytes.to_vec())
    }
}

impl Serialize for BinaryView {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.to_vec())
    }
}

impl<'de> Deserialize<'de> for BinaryView {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Vec::<u8>::deserialize(deserializer).map(BinaryView::new)
    }
}

/// Native error shape raised by worker code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorValue {
    pub name: String,
    pub message: String,
}

impl ErrorValue {
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_name("Error", message)
    }

    pub fn with_name(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            f.write_str(&self.message)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

/// Dynamic value carried by worker messages
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Binary(BinaryView),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Error(ErrorValue),
}

impl Value {
    /// Binary value over a fresh buffer
    pub fn bytes(bytes: Vec<u8>) -> Self {
        Value::Binary(BinaryView::new(bytes))
    }

    /// Map value from key/value pairs
    pub fn map<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        Value::Map(
            entries
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&BinaryView> {
        match self {
            Value::Binary(view) => Some(view),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&ErrorValue> {
        match self {
            Value::Error(error) => Some(error),
            _ => None,
        }
    }

    /// Field of a map value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map()?.get(key)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::String(s) => f.write_str(s),
            Value::Binary(view) => write!(f, "<binary {} bytes>", view.byte_length()),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Map(map) => {
                f.write_str("{")?;
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key:?}: {value}")?;
                }
                f.write_str("}")
            }
            Value::Error(error) => write!(f, "{error}"),
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Null
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<BinaryView> for Value {
    fn from(view: BinaryView) -> Self {
        Value::Binary(view)
    }
}

impl From<ErrorValue> for Value {
    fn from(error: ErrorValue) -> Self {
        Value::Error(error)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.into_iter()
                    .map(|(key, value)| (key, Value::from(value)))
                    .collect(),
            ),
        }
    }
}

/// Copy `value` the way it crosses a worker boundary
///
/// Buffers listed in `transfer` are detached from the sender and their
/// allocations moved into the copy. Every other buffer reachable from `value`
/// is copied whole, once per buffer, so views sharing a buffer keep sharing
/// it on the receiving side. On error the sender is left untouched.
pub fn structured_clone(value: &Value, transfer: &[ByteBuffer]) -> Result<Value> {
    let mut transferred = HashSet::with_capacity(transfer.len());
    for buffer in transfer {
        if buffer.is_detached() {
            return Err(PoolError::data_clone(
                "transfer list contains a detached buffer",
            ));
        }
        if !transferred.insert(buffer.key()) {
            return Err(PoolError::data_clone(
                "buffer listed more than once in transfer list",
            ));
        }
    }
    ensure_cloneable(value, &transferred)?;

    let moved: HashMap<usize, ByteBuffer> = transfer
        .iter()
        .map(|buffer| {
            let key = buffer.key();
            (key, ByteBuffer::new(buffer.detach().unwrap_or_default()))
        })
        .collect();
    let mut copied = HashMap::new();
    Ok(clone_value(value, &moved, &mut copied))
}

fn ensure_cloneable(value: &Value, transferred: &HashSet<usize>) -> Result<()> {
    match value {
        Value::Binary(view)
            if view.buffer.is_detached() && !transferred.contains(&view.buffer.key()) =>
        {
            Err(PoolError::data_clone("view over a detached buffer"))
        }
        Value::List(items) => items
            .iter()
            .try_for_each(|item| ensure_cloneable(item, transferred)),
        Value::Map(map) => map
            .values()
            .try_for_each(|item| ensure_cloneable(item, transferred)),
        _ => Ok(()),
    }
}

fn clone_value(
    value: &Value,
    moved: &HashMap<usize, ByteBuffer>,
    copied: &mut HashMap<usize, ByteBuffer>,
) -> Value {
    match value {
        Value::Binary(view) => {
            let key = view.buffer.key();
            let buffer = match moved.get(&key) {
                Some(buffer) => buffer.clone(),
                None => copied
                    .entry(key)
                    .or_insert_with(|| ByteBuffer::new(view.buffer.to_vec()))
                    .clone(),
            };
            Value::Binary(BinaryView {
                buffer,
                offset: view.offset,
                len: view.len,
            })
        }
        Value::List(items) => Value::List(
            items
                .iter()
                .map(|item| clone_value(item, moved, copied))
                .collect(),
        ),
        Value::Map(map) => Value::Map(
            map.iter()
                .map(|(key, item)| (key.clone(), clone_value(item, moved, copied)))
                .collect(),
        ),
        other => other.clone(),
    }
}
