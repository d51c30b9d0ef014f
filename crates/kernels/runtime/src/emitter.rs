//! Emitters - simulation output abstraction
//!
//! The engine hands every emitter a projection of the tree (the leaves whose
//! effective `emit` flag is set, with serializers applied) at each emission
//! time. Emitters are strictly observers: nothing they do feeds back into the
//! simulation.
//!
//! # Emitter Trait
//!
//! - `emit()` - Called with the time and the projection
//! - `get_data()` - Recorded snapshots, oldest first
//! - `get_timeseries()` - The same data pivoted to one list per leaf
//! - `flush()` / `close()` - Ensure output is written; finalize
//!
//! # Implementations
//!
//! - `NullEmitter` - Discard output
//! - `RamEmitter` - Keep every snapshot in memory
//! - `JsonEmitter` - Newline-delimited JSON to any writer

pub mod json;

pub use json::{JsonEmitter, read_history};

use indexmap::IndexMap;
use terrarium_foundation::Path;

use crate::types::{Value, ValueMap};

/// Result type for emitter operations
pub type Result<T> = std::result::Result<T, EmitterError>;

/// Errors that can occur while emitting
#[derive(Debug, thiserror::Error)]
pub enum EmitterError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Emitter already closed")]
    AlreadyClosed,
}

/// Emitted snapshots in emission order.
pub type History = Vec<(f64, Value)>;

/// Trait for simulation output
///
/// # Lifecycle
///
/// 1. The engine emits the initial snapshot when it is built
/// 2. `emit()` at every time landing on the emission cadence
/// 3. `flush()` and `close()` from `Engine::end()`
pub trait Emitter: Send {
    /// Record the projection taken at `time`.
    fn emit(&mut self, time: f64, data: &Value) -> Result<()>;

    /// Recorded snapshots, oldest first. Emitters that keep nothing return
    /// an empty history.
    fn get_data(&self) -> History;

    /// One list per emitted leaf, aligned with a `time` list.
    fn get_timeseries(&self) -> Value {
        timeseries(&self.get_data())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Finalize output. The emitter must not be used afterwards.
    fn close(&mut self) -> Result<()> {
        self.flush()
    }
}

/// Null emitter - discards all data
#[derive(Debug, Default)]
pub struct NullEmitter;

impl Emitter for NullEmitter {
    fn emit(&mut self, _time: f64, _data: &Value) -> Result<()> {
        Ok(())
    }

    fn get_data(&self) -> History {
        Vec::new()
    }
}

/// In-memory emitter
#[derive(Debug, Default)]
pub struct RamEmitter {
    history: History,
    closed: bool,
}

impl RamEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot recorded at exactly `time`, if any.
    pub fn at(&self, time: f64) -> Option<&Value> {
        self.history.iter().find(|(t, _)| *t == time).map(|(_, v)| v)
    }

    /// Emission times, oldest first.
    pub fn times(&self) -> Vec<f64> {
        self.history.iter().map(|(t, _)| *t).collect()
    }
}

impl Emitter for RamEmitter {
    fn emit(&mut self, time: f64, data: &Value) -> Result<()> {
        if self.closed {
            return Err(EmitterError::AlreadyClosed);
        }
        self.history.push((time, data.clone()));
        Ok(())
    }

    fn get_data(&self) -> History {
        self.history.clone()
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Pivot snapshots into per-leaf lists.
///
/// A leaf missing from some snapshot gets `null` there, so every list has
/// one entry per snapshot. Empty branches carry no series.
pub fn timeseries(history: &[(f64, Value)]) -> Value {
    let mut series: IndexMap<Path, Vec<Value>> = IndexMap::new();
    for (index, (_, snapshot)) in history.iter().enumerate() {
        for (path, value) in snapshot.flatten() {
            if matches!(value, Value::Map(map) if map.is_empty()) || path.is_empty() {
                continue;
            }
            let column = series.entry(path).or_insert_with(|| vec![Value::Null; index]);
            column.push(value.clone());
        }
        for column in series.values_mut() {
            column.resize(index + 1, Value::Null);
        }
    }

    let mut root = ValueMap::new();
    for (path, column) in series {
        if let Some(keys) = path.keys() {
            insert_at(&mut root, &keys, Value::List(column));
        }
    }
    root.insert(
        "time".to_string(),
        Value::List(history.iter().map(|(t, _)| Value::Float(*t)).collect()),
    );
    Value::Map(root)
}

fn insert_at(map: &mut ValueMap, keys: &[&str], value: Value) {
    let Some((first, rest)) = keys.split_first() else {
        return;
    };
    if rest.is_empty() {
        map.insert(first.to_string(), value);
        return;
    }
    let entry = map
        .entry(first.to_string())
        .or_insert_with(|| Value::Map(ValueMap::new()));
    if !matches!(entry, Value::Map(_)) {
        *entry = Value::Map(ValueMap::new());
    }
    if let Value::Map(child) = entry {
        insert_at(child, rest, value);
    }
}
