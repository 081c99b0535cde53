use std::borrow::Borrow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::event::error::EventSystemError;

/// Largest magnitude a priority may take (2^53 - 1).
pub const MAX_PRIORITY: i64 = 9_007_199_254_740_991;

/// Normalized event name: surrounding whitespace trimmed, never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventName(Arc<str>);

impl EventName {
    /// Trim `raw` (whitespace and byte order marks) and reject it if nothing
    /// is left.
    pub fn parse(raw: &str) -> Result<Self, EventSystemError> {
        let trimmed = raw.trim_matches(|c: char| c.is_whitespace() || c == '\u{FEFF}');
        if trimmed.is_empty() {
            return Err(EventSystemError::EmptyEventName);
        }
        Ok(Self(Arc::from(trimmed)))
    }

    /// Parse a name that arrives as untyped data (scenario files, JSON input).
    pub fn from_value(value: &Value) -> Result<Self, EventSystemError> {
        match value {
            Value::String(raw) => Self::parse(raw),
            other => Err(EventSystemError::InvalidEventName {
                reason: format!("got {}", json_kind(other)),
            }),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for EventName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for EventName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Dispatch priority. Higher values dequeue first.
///
/// Every constructor normalizes: fractional input truncates toward zero,
/// magnitudes clamp to [`MAX_PRIORITY`], and non-finite input becomes zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "f64", into = "i64")]
pub struct Priority(i64);

impl Priority {
    pub const ZERO: Priority = Priority(0);
    pub const MAX: Priority = Priority(MAX_PRIORITY);
    pub const MIN: Priority = Priority(-MAX_PRIORITY);

    pub fn new(value: i64) -> Self {
        Priority(value.clamp(-MAX_PRIORITY, MAX_PRIORITY))
    }

    pub fn from_f64(value: f64) -> Self {
        if !value.is_finite() {
            return Priority::ZERO;
        }
        let truncated = value.trunc();
        if truncated >= MAX_PRIORITY as f64 {
            Priority::MAX
        } else if truncated <= -(MAX_PRIORITY as f64) {
            Priority::MIN
        } else {
            Priority(truncated as i64)
        }
    }

    pub fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Priority {
    fn from(value: i64) -> Self {
        Priority::new(value)
    }
}

impl From<i32> for Priority {
    fn from(value: i32) -> Self {
        Priority::new(i64::from(value))
    }
}

impl From<u32> for Priority {
    fn from(value: u32) -> Self {
        Priority::new(i64::from(value))
    }
}

impl From<f64> for Priority {
    fn from(value: f64) -> Self {
        Priority::from_f64(value)
    }
}

impl From<Priority> for i64 {
    fn from(priority: Priority) -> Self {
        priority.0
    }
}

/// Opaque handler identity, unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

impl HandlerId {
    pub fn next() -> Self {
        HandlerId(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler#{}", self.0)
    }
}

/// Payload of one emission.
///
/// Cloning an `EventData` clones the handle, not the record: every handler
/// and middleware callback of one emission sees the same record, so a write
/// made by an earlier handler is visible to the ones that run after it.
/// Callers that need isolation should take a [`snapshot`](Self::snapshot).
#[derive(Clone, Default)]
pub struct EventData {
    record: Arc<RwLock<Map<String, Value>>>,
}

impl EventData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.read(|record| record.get(key).cloned())
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.update(|record| record.insert(key.into(), value.into()))
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.update(|record| record.remove(key))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.read(|record| record.contains_key(key))
    }

    pub fn len(&self) -> usize {
        self.read(|record| record.len())
    }

    pub fn is_empty(&self) -> bool {
        self.read(|record| record.is_empty())
    }

    /// Copy of the record as it is right now.
    pub fn snapshot(&self) -> Map<String, Value> {
        self.read(|record| record.clone())
    }

    /// Run `f` with shared access to the record.
    pub fn read<R>(&self, f: impl FnOnce(&Map<String, Value>) -> R) -> R {
        let record = self.record.read().unwrap_or_else(PoisonError::into_inner);
        f(&record)
    }

    /// Run `f` with exclusive access to the record.
    pub fn update<R>(&self, f: impl FnOnce(&mut Map<String, Value>) -> R) -> R {
        let mut record = self.record.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut record)
    }

    /// True if both handles point at the same record.
    pub fn same_record(&self, other: &EventData) -> bool {
        Arc::ptr_eq(&self.record, &other.record)
    }
}

impl From<Map<String, Value>> for EventData {
    fn from(record: Map<String, Value>) -> Self {
        Self {
            record: Arc::new(RwLock::new(record)),
        }
    }
}

impl fmt::Debug for EventData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.read(|record| f.debug_tuple("EventData").field(record).finish())
    }
}
