//! Core value and update types.
//!
//! [`Value`] is the dynamic payload stored at leaves and handed to units as
//! views. [`Update`] is what units return: a tree mirroring their ports whose
//! leaves are merge payloads and whose branches may carry structural
//! [`Directive`]s.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use terrarium_foundation::Path;

/// Ordered map of child name to value.
pub type ValueMap = IndexMap<String, Value>;

/// Dynamic leaf payload.
///
/// Serializes untagged, so a `Value` reads and writes as plain JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Absent value. Identity for accumulation.
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<Value>),
    Map(ValueMap),
}

impl Value {
    /// An empty map.
    pub fn map() -> Self {
        Value::Map(ValueMap::new())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view of `Int` and `Float`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ValueMap> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Child of a map value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|map| map.get(key))
    }

    /// Nested lookup through map values. Parent markers never match.
    pub fn get_path(&self, path: &Path) -> Option<&Value> {
        path.segments()
            .iter()
            .try_fold(self, |value, segment| value.get(segment.as_key()?))
    }

    /// Equality that treats numerically equal `Int` and `Float` as equal.
    pub fn loosely_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                self.as_f64() == other.as_f64()
            }
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loosely_eq(y))
            }
            (Value::Map(a), Value::Map(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).is_some_and(|w| v.loosely_eq(w)))
            }
            _ => self == other,
        }
    }

    /// Every non-map value keyed by its path below this value.
    ///
    /// Empty maps are reported as leaves so they survive a round trip.
    pub fn flatten(&self) -> Vec<(Path, &Value)> {
        let mut out = Vec::new();
        flatten_into(self, Path::root(), &mut out);
        out
    }

    /// Short type name for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }
}

fn flatten_into<'a>(value: &'a Value, at: Path, out: &mut Vec<(Path, &'a Value)>) {
    match value {
        Value::Map(map) if !map.is_empty() => {
            for (key, child) in map {
                flatten_into(child, at.child(key.clone()), out);
            }
        }
        other => out.push((at, other)),
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x:?}"),
            Value::Text(s) => f.write_str(s),
            Value::List(_) | Value::Map(_) => match serde_json::to_string(self) {
                Ok(json) => f.write_str(&json),
                Err(_) => Err(fmt::Error),
            },
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<ValueMap> for Value {
    fn from(map: ValueMap) -> Self {
        Value::Map(map)
    }
}

impl<K: Into<String>, V: Into<Value>, const N: usize> From<[(K, V); N]> for Value {
    fn from(entries: [(K, V); N]) -> Self {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Text(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

// ============================================================================
// Updates
// ============================================================================

/// A unit's requested change to the tree.
///
/// Shaped like the unit's ports: `Value` entries are merged into leaves by
/// their declared updater, `Branch` entries recurse and may carry directives.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Value(Value),
    Branch(UpdateBranch),
}

/// Child updates plus structural directives for one branch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateBranch {
    pub children: IndexMap<String, Update>,
    pub directives: Vec<Directive>,
}

impl Default for Update {
    fn default() -> Self {
        Update::empty()
    }
}

impl Update {
    /// The update that changes nothing.
    pub fn empty() -> Self {
        Update::Branch(UpdateBranch::default())
    }

    /// True when applying this update cannot change the tree.
    pub fn is_empty(&self) -> bool {
        match self {
            Update::Value(_) => false,
            Update::Branch(branch) => {
                branch.directives.is_empty() && branch.children.values().all(Update::is_empty)
            }
        }
    }

    /// Add a child update, turning a `Value` map into a branch first.
    pub fn with(self, key: impl Into<String>, update: impl Into<Update>) -> Self {
        let mut branch = self.into_branch();
        branch.children.insert(key.into(), update.into());
        Update::Branch(branch)
    }

    /// Attach a directive to this branch.
    pub fn directive(self, directive: Directive) -> Self {
        let mut branch = self.into_branch();
        branch.directives.push(directive);
        Update::Branch(branch)
    }

    /// View as a branch, or `None` for a scalar that has no branch form.
    /// `Null` reads as the empty branch.
    pub fn try_into_branch(self) -> Option<UpdateBranch> {
        match self {
            Update::Value(Value::Map(_)) | Update::Branch(_) => Some(self.into_branch()),
            Update::Value(Value::Null) => Some(UpdateBranch::default()),
            Update::Value(_) => None,
        }
    }

    /// View as a branch. Map values become child updates; other values are dropped.
    pub fn into_branch(self) -> UpdateBranch {
        match self {
            Update::Branch(branch) => branch,
            Update::Value(Value::Map(map)) => UpdateBranch {
                children: map.into_iter().map(|(k, v)| (k, Update::Value(v))).collect(),
                directives: Vec::new(),
            },
            Update::Value(_) => UpdateBranch::default(),
        }
    }
}

impl From<Value> for Update {
    fn from(value: Value) -> Self {
        Update::Value(value)
    }
}

impl From<serde_json::Value> for Update {
    fn from(json: serde_json::Value) -> Self {
        Update::Value(Value::from(json))
    }
}

impl From<f64> for Update {
    fn from(x: f64) -> Self {
        Update::Value(Value::Float(x))
    }
}

impl From<i64> for Update {
    fn from(i: i64) -> Self {
        Update::Value(Value::Int(i))
    }
}

/// Structural change carried by an update branch.
///
/// Keys are children of the branch the directive is applied to. Each
/// directive commits completely or not at all.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// Create new children with initial state.
    Add(Vec<AddEntry>),
    /// Remove children and everything below them.
    Delete(Vec<String>),
    /// Split one child into daughters and remove it.
    Divide(Division),
    /// Re-parent children under another branch.
    Move(Vec<MoveEntry>),
}

/// One child created by [`Directive::Add`].
#[derive(Debug, Clone, PartialEq)]
pub struct AddEntry {
    pub key: String,
    pub state: Value,
}

impl AddEntry {
    pub fn new(key: impl Into<String>, state: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            state: state.into(),
        }
    }
}

/// Daughter produced by a division.
#[derive(Debug, Clone, PartialEq)]
pub struct Daughter {
    pub key: String,
    /// Values set into the daughter after division.
    pub state: Option<Value>,
}

impl Daughter {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            state: None,
        }
    }

    pub fn with_state(mut self, state: impl Into<Value>) -> Self {
        self.state = Some(state.into());
        self
    }
}

/// Payload of [`Directive::Divide`].
#[derive(Debug, Clone, PartialEq)]
pub struct Division {
    pub mother: String,
    pub daughters: Vec<Daughter>,
    /// Divider overrides keyed by leaf path relative to the mother.
    pub dividers: IndexMap<Path, String>,
}

impl Division {
    pub fn new(mother: impl Into<String>, daughters: impl IntoIterator<Item = Daughter>) -> Self {
        Self {
            mother: mother.into(),
            daughters: daughters.into_iter().collect(),
            dividers: IndexMap::new(),
        }
    }

    pub fn with_divider(mut self, leaf: impl Into<Path>, divider: impl Into<String>) -> Self {
        self.dividers.insert(leaf.into(), divider.into());
        self
    }
}

/// One child relocated by [`Directive::Move`].
#[derive(Debug, Clone, PartialEq)]
pub struct MoveEntry {
    pub key: String,
    /// Destination branch, relative to the branch holding the directive.
    pub target: Path,
}

impl MoveEntry {
    pub fn new(key: impl Into<String>, target: impl Into<Path>) -> Self {
        Self {
            key: key.into(),
            target: target.into(),
        }
    }
}
