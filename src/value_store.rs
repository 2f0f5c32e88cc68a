//! Named values shared with the outside world.
//!
//! The core only ever calls [`ValueStore::publish`] and
//! [`ValueStore::current_value`]; how values travel to subscribers is the
//! store's business. [`MemoryStore`] is the in-process implementation used by
//! the binary and the tests.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
    Array(Vec<f64>),
}

/// How a setting read from the instrument is typed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Enumerated or free text, kept exactly as the instrument sent it.
    Text,
    Float,
    Int,
}

impl ValueKind {
    /// Coerce one reply token, or `None` if it does not fit this kind.
    pub fn parse(self, token: &str) -> Option<Value> {
        let token = token.trim();
        match self {
            Self::Text => Some(Value::Text(token.to_string())),
            Self::Float => token.parse().ok().map(Value::Float),
            Self::Int => token.parse().ok().map(Value::Int).or_else(|| {
                // the scope sometimes answers counts in NR3 form
                token
                    .parse::<f64>()
                    .ok()
                    .filter(|v| v.fract() == 0.0 && v.abs() < 9.0e15)
                    .map(|v| Value::Int(v as i64))
            }),
        }
    }
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Text(s) => s.trim().parse().ok(),
            Self::Array(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            Self::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(s) => write!(f, "{s}"),
            Self::Array(values) => write!(f, "[{} values]", values.len()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Self::Array(v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    Always,
    /// Skip the write when the stored value is already equal.
    IfChanged,
}

pub trait ValueStore: Send + Sync {
    /// Store `value` under `name`, stamped with `timestamp` or the current
    /// time. Returns whether the store was written.
    fn publish(
        &self,
        name: &str,
        value: Value,
        mode: PublishMode,
        timestamp: Option<SystemTime>,
    ) -> bool;

    fn current_value(&self, name: &str) -> Option<Value>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub value: Value,
    pub timestamp: SystemTime,
    /// Number of writes since the name first appeared.
    pub updates: u64,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self, name: &str) -> Option<Entry> {
        self.entries.lock().get(name).cloned()
    }

    pub fn updates(&self, name: &str) -> u64 {
        self.entries.lock().get(name).map_or(0, |e| e.updates)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

impl ValueStore for MemoryStore {
    fn publish(
        &self,
        name: &str,
        value: Value,
        mode: PublishMode,
        timestamp: Option<SystemTime>,
    ) -> bool {
        let mut entries = self.entries.lock();
        let timestamp = timestamp.unwrap_or_else(SystemTime::now);
        match entries.get_mut(name) {
            Some(entry) if mode == PublishMode::IfChanged && entry.value == value => false,
            Some(entry) => {
                log::trace!("{name} = {value}");
                entry.value = value;
                entry.timestamp = timestamp;
                entry.updates += 1;
                true
            }
            None => {
                log::trace!("{name} = {value}");
                entries.insert(
                    name.to_string(),
                    Entry {
                        value,
                        timestamp,
                        updates: 1,
                    },
                );
                true
            }
        }
    }

    fn current_value(&self, name: &str) -> Option<Value> {
        self.entries.lock().get(name).map(|e| e.value.clone())
    }
}
