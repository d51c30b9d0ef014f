//! Name-keyed function tables for updaters, dividers and serializers.
//!
//! Schemas refer to these functions by name so that declarations stay plain
//! data. A name that is not registered is reported the first time a store
//! needs it ([`Error::UnknownUpdater`] and friends).
//!
//! # Built-ins
//!
//! | kind | name | behaviour |
//! |------|------|-----------|
//! | updater | `accumulate` | numeric sum, map-wise for maps, concatenation for lists; `null` is the identity |
//! | updater | `set` | replace |
//! | updater | `nonnegative_accumulate` | `accumulate`, clamped at zero |
//! | updater | `null` | ignore the update |
//! | updater | `merge` | deep map merge, update wins |
//! | updater | `delete` | remove the listed keys from a map value |
//! | divider | `set` | every daughter gets a copy |
//! | divider | `split` | two daughters; integers split with the remainder to the second, floats halved |
//! | divider | `binomial` | two daughters; integer count split by a seeded binomial draw |
//! | divider | `zero` | every daughter gets zero |
//! | serializer | `string` | emit the value as text |

use anyhow::{anyhow, bail};
use indexmap::IndexMap;
use terrarium_foundation::RngStream;

use crate::error::{Error, Result};
use crate::types::{Value, ValueMap};

/// Merge an update payload into the current value.
pub type UpdaterFn = Box<dyn Fn(&Value, &Value) -> anyhow::Result<Value> + Send + Sync>;

/// Produce one value per daughter from the mother's value.
pub type DividerFn =
    Box<dyn Fn(&Value, usize, &mut RngStream) -> anyhow::Result<Vec<Value>> + Send + Sync>;

/// Convert a value for emission.
pub type SerializerFn = Box<dyn Fn(&Value) -> Value + Send + Sync>;

/// A registered divider and the daughter count it supports.
pub struct Divider {
    /// `None` accepts any daughter count.
    pub arity: Option<usize>,
    pub func: DividerFn,
}

/// Registry of named updaters, dividers and serializers.
pub struct Registry {
    updaters: IndexMap<String, UpdaterFn>,
    dividers: IndexMap<String, Divider>,
    serializers: IndexMap<String, SerializerFn>,
}

impl Registry {
    /// Create an empty registry.
    pub fn empty() -> Self {
        Self {
            updaters: IndexMap::new(),
            dividers: IndexMap::new(),
            serializers: IndexMap::new(),
        }
    }

    /// Create a registry holding the built-ins.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register_updater("accumulate", accumulate);
        registry.register_updater("set", |_, update| Ok(update.clone()));
        registry.register_updater("nonnegative_accumulate", |current, update| {
            Ok(clamp_nonnegative(accumulate(current, update)?))
        });
        registry.register_updater("null", |current, _| Ok(current.clone()));
        registry.register_updater("merge", |current, update| Ok(deep_merge(current, update)));
        registry.register_updater("delete", delete_keys);

        registry.register_divider("set", None, |value, n, _| Ok(vec![value.clone(); n]));
        registry.register_divider("split", Some(2), |value, _, _| split_even(value));
        registry.register_divider("binomial", Some(2), binomial_split);
        registry.register_divider("zero", None, |value, n, _| Ok(vec![zero_like(value); n]));

        registry.register_serializer("string", |value| Value::Text(value.to_string()));
        registry
    }

    /// Register or replace an updater.
    pub fn register_updater(
        &mut self,
        name: impl Into<String>,
        func: impl Fn(&Value, &Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    ) {
        self.updaters.insert(name.into(), Box::new(func));
    }

    /// Register or replace a divider.
    pub fn register_divider(
        &mut self,
        name: impl Into<String>,
        arity: Option<usize>,
        func: impl Fn(&Value, usize, &mut RngStream) -> anyhow::Result<Vec<Value>> + Send + Sync + 'static,
    ) {
        self.dividers.insert(
            name.into(),
            Divider {
                arity,
                func: Box::new(func),
            },
        );
    }

    /// Register or replace a serializer.
    pub fn register_serializer(
        &mut self,
        name: impl Into<String>,
        func: impl Fn(&Value) -> Value + Send + Sync + 'static,
    ) {
        self.serializers.insert(name.into(), Box::new(func));
    }

    pub fn updater(&self, name: &str) -> Result<&UpdaterFn> {
        self.updaters
            .get(name)
            .ok_or_else(|| Error::UnknownUpdater(name.to_string()))
    }

    pub fn divider(&self, name: &str) -> Result<&Divider> {
        self.dividers
            .get(name)
            .ok_or_else(|| Error::UnknownDivider(name.to_string()))
    }

    pub fn serializer(&self, name: &str) -> Result<&SerializerFn> {
        self.serializers
            .get(name)
            .ok_or_else(|| Error::UnknownSerializer(name.to_string()))
    }

    /// Names of all registered updaters.
    pub fn updater_names(&self) -> impl Iterator<Item = &str> {
        self.updaters.keys().map(String::as_str)
    }

    /// Names of all registered dividers.
    pub fn divider_names(&self) -> impl Iterator<Item = &str> {
        self.dividers.keys().map(String::as_str)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("updaters", &self.updaters.keys().collect::<Vec<_>>())
            .field("dividers", &self.dividers.keys().collect::<Vec<_>>())
            .field("serializers", &self.serializers.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ============================================================================
// Updaters
// ============================================================================

/// Add `update` into `current`.
pub fn accumulate(current: &Value, update: &Value) -> anyhow::Result<Value> {
    Ok(match (current, update) {
        (current, Value::Null) => current.clone(),
        (Value::Null, update) => update.clone(),
        (Value::Int(a), Value::Int(b)) => Value::Int(
            a.checked_add(*b)
                .ok_or_else(|| anyhow!("integer overflow adding {b} to {a}"))?,
        ),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            Value::Float(current.as_f64().unwrap_or_default() + update.as_f64().unwrap_or_default())
        }
        (Value::List(a), Value::List(b)) => Value::List(a.iter().chain(b).cloned().collect()),
        (Value::Map(a), Value::Map(b)) => {
            let mut out = a.clone();
            for (key, delta) in b {
                let merged = match a.get(key) {
                    Some(existing) => accumulate(existing, delta)?,
                    None => delta.clone(),
                };
                out.insert(key.clone(), merged);
            }
            Value::Map(out)
        }
        (current, update) => bail!("cannot accumulate {} into {}", update.kind(), current.kind()),
    })
}

fn clamp_nonnegative(value: Value) -> Value {
    match value {
        Value::Int(i) => Value::Int(i.max(0)),
        Value::Float(x) => Value::Float(x.max(0.0)),
        Value::Map(map) => Value::Map(
            map.into_iter()
                .map(|(k, v)| (k, clamp_nonnegative(v)))
                .collect(),
        ),
        other => other,
    }
}

fn deep_merge(current: &Value, update: &Value) -> Value {
    match (current, update) {
        (Value::Map(a), Value::Map(b)) => {
            let mut out = a.clone();
            for (key, value) in b {
                let merged = match a.get(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value.clone(),
                };
                out.insert(key.clone(), merged);
            }
            Value::Map(out)
        }
        (_, update) => update.clone(),
    }
}

fn delete_keys(current: &Value, update: &Value) -> anyhow::Result<Value> {
    let Value::Map(map) = current else {
        bail!("cannot delete keys from {}", current.kind());
    };
    let keys: Vec<&str> = match update {
        Value::Text(key) => vec![key.as_str()],
        Value::List(keys) => keys
            .iter()
            .map(|k| k.as_str().ok_or_else(|| anyhow!("delete key must be text, found {}", k.kind())))
            .collect::<anyhow::Result<_>>()?,
        Value::Null => Vec::new(),
        other => bail!("delete expects a key or list of keys, found {}", other.kind()),
    };
    let out: ValueMap = map
        .iter()
        .filter(|(k, _)| !keys.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Ok(Value::Map(out))
}

// ============================================================================
// Dividers
// ============================================================================

fn split_even(value: &Value) -> anyhow::Result<Vec<Value>> {
    match value {
        Value::Int(i) => {
            let first = i.div_euclid(2);
            Ok(vec![Value::Int(first), Value::Int(i - first)])
        }
        Value::Float(x) => Ok(vec![Value::Float(x / 2.0), Value::Float(x / 2.0)]),
        Value::Map(map) => {
            let mut first = ValueMap::new();
            let mut second = ValueMap::new();
            for (key, child) in map {
                let [a, b]: [Value; 2] = split_even(child)?
                    .try_into()
                    .map_err(|_| anyhow!("split produced the wrong number of halves"))?;
                first.insert(key.clone(), a);
                second.insert(key.clone(), b);
            }
            Ok(vec![Value::Map(first), Value::Map(second)])
        }
        Value::Null => Ok(vec![Value::Null, Value::Null]),
        other => bail!("cannot split {}", other.kind()),
    }
}

fn binomial_split(value: &Value, _: usize, rng: &mut RngStream) -> anyhow::Result<Vec<Value>> {
    match value {
        Value::Int(count) if *count >= 0 => {
            let first = rng.binomial(*count as u64, 0.5) as i64;
            Ok(vec![Value::Int(first), Value::Int(count - first)])
        }
        other => bail!("binomial division needs a non-negative integer, found {other}"),
    }
}

fn zero_like(value: &Value) -> Value {
    match value {
        Value::Int(_) => Value::Int(0),
        Value::Float(_) => Value::Float(0.0),
        Value::Map(map) => Value::Map(map.iter().map(|(k, v)| (k.clone(), zero_like(v))).collect()),
        Value::List(_) => Value::List(Vec::new()),
        other => other.clone(),
    }
}

// ============================================================================
// Tests
// ============================================================================
