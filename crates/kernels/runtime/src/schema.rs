//! Port and store schemas.
//!
//! A unit describes each port with a [`Schema`]. Declaring a port at a tree
//! node records the leaf attributes ([`LeafSchema`]) on the node; later
//! declarations of the same node must agree with earlier ones.
//!
//! Schemas can be written in Rust with the builder methods, or parsed from a
//! [`Value`] using the attribute keys below, which is how `store_schema`
//! overrides are expressed as well:
//!
//! | key | meaning |
//! |-----|---------|
//! | `_default` | initial value of the leaf |
//! | `_updater` | registry name of the merge strategy |
//! | `_divider` | registry name of the division strategy |
//! | `_emit` | include the leaf in emitted snapshots |
//! | `_serializer` | registry name of the emit-time conversion |
//! | `_output` | port is write-only and masked from views |
//! | `_each` | schema declared on every child of the branch |
//! | `_value` | (overrides only) value to set on the store |

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use terrarium_foundation::Path;

use crate::error::{Error, Result};
use crate::types::Value;

/// Updater used when a leaf declares none.
pub const DEFAULT_UPDATER: &str = "accumulate";
/// Divider used when a leaf declares none.
pub const DEFAULT_DIVIDER: &str = "set";

/// How conflicting re-declarations of a leaf are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaPolicy {
    /// Only identical declarations unify.
    #[default]
    Strict,
    /// Numerically equal defaults (`1` and `1.0`) unify as well.
    Equality,
}

/// Attributes of a leaf store. Unset fields fall back to ancestors'
/// overrides and then to the built-in defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeafSchema {
    pub default: Option<Value>,
    pub updater: Option<String>,
    pub divider: Option<String>,
    pub emit: Option<bool>,
    pub serializer: Option<String>,
    /// Port-level flag; never recorded on a store.
    #[serde(default)]
    pub output: bool,
}

impl LeafSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn with_updater(mut self, updater: impl Into<String>) -> Self {
        self.updater = Some(updater.into());
        self
    }

    pub fn with_divider(mut self, divider: impl Into<String>) -> Self {
        self.divider = Some(divider.into());
        self
    }

    pub fn with_emit(mut self, emit: bool) -> Self {
        self.emit = Some(emit);
        self
    }

    pub fn with_serializer(mut self, serializer: impl Into<String>) -> Self {
        self.serializer = Some(serializer.into());
        self
    }

    /// True when no store attribute is set.
    pub fn is_blank(&self) -> bool {
        self.default.is_none()
            && self.updater.is_none()
            && self.divider.is_none()
            && self.emit.is_none()
            && self.serializer.is_none()
    }

    /// Fill unset attributes from `fallback`.
    pub fn or(&self, fallback: &LeafSchema) -> LeafSchema {
        LeafSchema {
            default: self.default.clone().or_else(|| fallback.default.clone()),
            updater: self.updater.clone().or_else(|| fallback.updater.clone()),
            divider: self.divider.clone().or_else(|| fallback.divider.clone()),
            emit: self.emit.or(fallback.emit),
            serializer: self.serializer.clone().or_else(|| fallback.serializer.clone()),
            output: self.output,
        }
    }

    /// Updater name with the built-in default applied.
    pub fn updater_name(&self) -> &str {
        self.updater.as_deref().unwrap_or(DEFAULT_UPDATER)
    }

    /// Divider name with the built-in default applied.
    pub fn divider_name(&self) -> &str {
        self.divider.as_deref().unwrap_or(DEFAULT_DIVIDER)
    }

    pub fn emits(&self) -> bool {
        self.emit.unwrap_or(false)
    }

    /// Merge a new declaration into this one.
    ///
    /// Emit flags combine with OR. Every other attribute must agree with what
    /// is already declared, or be left unset by one side.
    pub fn unify(&mut self, incoming: &LeafSchema, policy: SchemaPolicy, path: &Path) -> Result<()> {
        if let (Some(existing), Some(new)) = (&self.default, &incoming.default) {
            let agrees = match policy {
                SchemaPolicy::Strict => existing == new,
                SchemaPolicy::Equality => existing.loosely_eq(new),
            };
            if !agrees {
                return Err(conflict(path, "default", existing, new));
            }
        }
        unify_name(&self.updater, &incoming.updater, path, "updater")?;
        unify_name(&self.divider, &incoming.divider, path, "divider")?;
        unify_name(&self.serializer, &incoming.serializer, path, "serializer")?;

        *self = self.or(incoming);
        if incoming.emit == Some(true) {
            self.emit = Some(true);
        }
        self.output = false;
        Ok(())
    }

    fn to_value(&self) -> Value {
        let mut map = IndexMap::new();
        if let Some(default) = &self.default {
            map.insert("_default".to_string(), default.clone());
        }
        if let Some(updater) = &self.updater {
            map.insert("_updater".to_string(), Value::from(updater.as_str()));
        }
        if let Some(divider) = &self.divider {
            map.insert("_divider".to_string(), Value::from(divider.as_str()));
        }
        if let Some(emit) = self.emit {
            map.insert("_emit".to_string(), Value::Bool(emit));
        }
        if let Some(serializer) = &self.serializer {
            map.insert("_serializer".to_string(), Value::from(serializer.as_str()));
        }
        Value::Map(map)
    }
}

fn unify_name(existing: &Option<String>, incoming: &Option<String>, path: &Path, field: &'static str) -> Result<()> {
    match (existing, incoming) {
        (Some(a), Some(b)) if a != b => Err(Error::SchemaConflict {
            path: path.clone(),
            field,
            existing: a.clone(),
            incoming: b.clone(),
        }),
        _ => Ok(()),
    }
}

fn conflict(path: &Path, field: &'static str, existing: &Value, incoming: &Value) -> Error {
    Error::SchemaConflict {
        path: path.clone(),
        field,
        existing: existing.to_string(),
        incoming: incoming.to_string(),
    }
}

/// Declared children of a branch port.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BranchSchema {
    pub children: IndexMap<String, Schema>,
    /// Declared on every current and future child.
    pub each: Option<Box<Schema>>,
    pub output: bool,
}

/// Shape a unit expects at a port.
///
/// A branch with neither children nor `each` accepts any subtree and views
/// it whole.
#[derive(Debug, Clone, PartialEq)]
pub enum Schema {
    Leaf(LeafSchema),
    Branch(BranchSchema),
}

impl Default for Schema {
    fn default() -> Self {
        Schema::any()
    }
}

impl Schema {
    pub fn leaf(leaf: LeafSchema) -> Self {
        Schema::Leaf(leaf)
    }

    /// Leaf with only a default value.
    pub fn value(default: impl Into<Value>) -> Self {
        Schema::Leaf(LeafSchema::new().with_default(default))
    }

    /// Branch accepting any subtree.
    pub fn any() -> Self {
        Schema::Branch(BranchSchema::default())
    }

    pub fn branch<K: Into<String>>(children: impl IntoIterator<Item = (K, Schema)>) -> Self {
        Schema::Branch(BranchSchema {
            children: children.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            each: None,
            output: false,
        })
    }

    /// Branch whose every child has `schema`.
    pub fn each(schema: Schema) -> Self {
        Schema::Branch(BranchSchema {
            children: IndexMap::new(),
            each: Some(Box::new(schema)),
            output: false,
        })
    }

    /// Mark as a write-only port.
    pub fn output(mut self) -> Self {
        match &mut self {
            Schema::Leaf(leaf) => leaf.output = true,
            Schema::Branch(branch) => branch.output = true,
        }
        self
    }

    pub fn is_output(&self) -> bool {
        match self {
            Schema::Leaf(leaf) => leaf.output,
            Schema::Branch(branch) => branch.output,
        }
    }

    /// Schema of a named child; anything under an open branch is open.
    pub fn child(&self, key: &str) -> Option<&Schema> {
        match self {
            Schema::Leaf(_) => None,
            Schema::Branch(branch) => branch
                .children
                .get(key)
                .or(branch.each.as_deref()),
        }
    }

    /// Follow a port path down the schema.
    pub fn descend(&self, path: &Path) -> Option<&Schema> {
        path.segments().iter().try_fold(self, |schema, segment| {
            let key = segment.as_key()?;
            match schema {
                Schema::Branch(b) if b.children.is_empty() && b.each.is_none() => Some(schema),
                _ => schema.child(key),
            }
        })
    }

    /// Parse the attribute-key form described in the module docs.
    pub fn from_value(value: &Value) -> Result<Self> {
        let Value::Map(map) = value else {
            return Err(Error::InvalidConfig(format!(
                "schema must be a map, found {}",
                value.kind()
            )));
        };

        let is_leaf = map
            .keys()
            .any(|k| k.starts_with('_') && k != "_output" && k != "_each");
        let output = match map.get("_output") {
            Some(flag) => flag.as_bool().ok_or_else(|| bad_attr("_output", flag))?,
            None => false,
        };

        if is_leaf {
            let mut leaf = LeafSchema {
                output,
                ..LeafSchema::default()
            };
            for (key, attr) in map {
                match key.as_str() {
                    "_default" => leaf.default = Some(attr.clone()),
                    "_updater" => leaf.updater = Some(text_attr(key, attr)?),
                    "_divider" => leaf.divider = Some(text_attr(key, attr)?),
                    "_serializer" => leaf.serializer = Some(text_attr(key, attr)?),
                    "_emit" => leaf.emit = Some(attr.as_bool().ok_or_else(|| bad_attr(key, attr))?),
                    "_output" => {}
                    other => {
                        return Err(Error::InvalidConfig(format!(
                            "unexpected key '{other}' in leaf schema"
                        )));
                    }
                }
            }
            return Ok(Schema::Leaf(leaf));
        }

        let mut branch = BranchSchema {
            output,
            ..BranchSchema::default()
        };
        for (key, child) in map {
            match key.as_str() {
                "_output" => {}
                "_each" | "*" => branch.each = Some(Box::new(Schema::from_value(child)?)),
                _ => {
                    branch
                        .children
                        .insert(key.clone(), Schema::from_value(child)?);
                }
            }
        }
        Ok(Schema::Branch(branch))
    }

    /// Attribute-key form of this schema.
    pub fn to_value(&self) -> Value {
        match self {
            Schema::Leaf(leaf) => {
                let mut value = leaf.to_value();
                if leaf.output
                    && let Value::Map(map) = &mut value
                {
                    map.insert("_output".to_string(), Value::Bool(true));
                }
                value
            }
            Schema::Branch(branch) => {
                let mut map: IndexMap<String, Value> = branch
                    .children
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_value()))
                    .collect();
                if let Some(each) = &branch.each {
                    map.insert("_each".to_string(), each.to_value());
                }
                if branch.output {
                    map.insert("_output".to_string(), Value::Bool(true));
                }
                Value::Map(map)
            }
        }
    }
}

fn text_attr(key: &str, attr: &Value) -> Result<String> {
    attr.as_str()
        .map(str::to_string)
        .ok_or_else(|| bad_attr(key, attr))
}

fn bad_attr(key: &str, attr: &Value) -> Error {
    Error::InvalidConfig(format!("schema attribute {key} cannot be {}", attr.kind()))
}

/// Attribute overrides applied over a subtree before a run.
///
/// Parsed from the `store_schema` configuration. Attributes on a branch
/// apply to every current and future descendant; `_value` sets the store's
/// value, creating the store if needed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaOverride {
    pub attrs: LeafSchema,
    pub value: Option<Value>,
    pub children: IndexMap<String, SchemaOverride>,
}

impl SchemaOverride {
    pub fn from_value(value: &Value) -> Result<Self> {
        let Value::Map(map) = value else {
            return Err(Error::InvalidConfig(format!(
                "store_schema must be a map, found {}",
                value.kind()
            )));
        };
        let mut out = SchemaOverride::default();
        for (key, attr) in map {
            match key.as_str() {
                "_value" => out.value = Some(attr.clone()),
                "_default" => out.attrs.default = Some(attr.clone()),
                "_updater" => out.attrs.updater = Some(text_attr(key, attr)?),
                "_divider" => out.attrs.divider = Some(text_attr(key, attr)?),
                "_serializer" => out.attrs.serializer = Some(text_attr(key, attr)?),
                "_emit" => out.attrs.emit = Some(attr.as_bool().ok_or_else(|| bad_attr(key, attr))?),
                other if other.starts_with('_') => {
                    return Err(Error::InvalidConfig(format!(
                        "unexpected key '{other}' in store_schema"
                    )));
                }
                _ => {
                    out.children
                        .insert(key.clone(), SchemaOverride::from_value(attr)?);
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(json: serde_json::Value) -> Schema {
        Schema::from_value(&Value::from(json)).unwrap()
    }

    #[test]
    fn parses_leaves_and_branches() {
        let schema = parse(json!({
            "internal": {"A": {"_default": 1.0, "_updater": "set"}},
            "output": {"B": {"_default": 0, "_emit": true}, "_output": true},
            "agents": {"_each": {"mass": {"_default": 1.0}}},
        }));
        let Schema::Branch(root) = &schema else {
            panic!("expected branch");
        };
        assert_eq!(
            schema.descend(&Path::parse("internal/A")),
            Some(&Schema::leaf(
                LeafSchema::new().with_default(1.0).with_updater("set")
            ))
        );
        assert!(root.children["output"].is_output());
        assert!(schema.descend(&Path::parse("agents/any_key/mass")).is_some());
    }

    #[test]
    fn rejects_unknown_leaf_attributes() {
        let err = Schema::from_value(&Value::from(json!({"_defualt": 1}))).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn identical_declarations_unify() {
        let mut declared = LeafSchema::new().with_default(1.0).with_updater("set");
        let again = LeafSchema::new().with_default(1.0).with_emit(true);
        declared
            .unify(&again, SchemaPolicy::Strict, &Path::parse("a"))
            .unwrap();
        assert_eq!(declared.updater_name(), "set");
        assert!(declared.emits());
    }

    #[test]
    fn differing_defaults_conflict_unless_equal() {
        let path = Path::parse("a");
        let mut declared = LeafSchema::new().with_default(1);
        let incoming = LeafSchema::new().with_default(1.0);
        let err = declared
            .clone()
            .unify(&incoming, SchemaPolicy::Strict, &path)
            .unwrap_err();
        assert!(matches!(err, Error::SchemaConflict { field: "default", .. }));
        declared
            .unify(&incoming, SchemaPolicy::Equality, &path)
            .unwrap();
    }

    #[test]
    fn differing_updaters_always_conflict() {
        let mut declared = LeafSchema::new().with_updater("set");
        let incoming = LeafSchema::new().with_updater("accumulate");
        let err = declared
            .unify(&incoming, SchemaPolicy::Equality, &Path::parse("a"))
            .unwrap_err();
        assert!(matches!(err, Error::SchemaConflict { field: "updater", .. }));
    }

    #[test]
    fn override_tree_separates_values_and_children() {
        let overrides = SchemaOverride::from_value(&Value::from(json!({
            "_emit": true,
            "agents": {"1": {"extra": {"_value": 1.0, "_emit": true}}},
        })))
        .unwrap();
        assert_eq!(overrides.attrs.emit, Some(true));
        let extra = &overrides.children["agents"].children["1"].children["extra"];
        assert_eq!(extra.value, Some(Value::Float(1.0)));
    }
}
