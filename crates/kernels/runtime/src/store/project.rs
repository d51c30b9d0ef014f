//! Read-only projections of the tree: plain values, configuration dumps,
//! emitted snapshots, and the unit listing the engine schedules from.

use terrarium_foundation::Path;

use super::{NodeKind, StateTree, StoreId};
use crate::error::{Error, Result};
use crate::schema::SchemaOverride;
use crate::types::{Value, ValueMap};

impl StateTree {
    /// Plain value of a subtree. Units and unit-only branches are left out.
    pub fn value_of(&self, id: StoreId) -> Value {
        let Ok(node) = self.node(id) else {
            return Value::Null;
        };
        match &node.kind {
            NodeKind::Leaf(leaf) => leaf.value.clone(),
            NodeKind::Unit(_) => Value::Null,
            NodeKind::Branch(branch) => Value::Map(
                branch
                    .children
                    .iter()
                    .filter(|(_, child)| self.has_state(**child))
                    .map(|(key, child)| (key.clone(), self.value_of(*child)))
                    .collect(),
            ),
        }
    }

    /// Whether a subtree holds anything besides units.
    ///
    /// Empty branches count as state.
    pub(crate) fn has_state(&self, id: StoreId) -> bool {
        match self.node(id).map(|node| &node.kind) {
            Ok(NodeKind::Leaf(_)) => true,
            Ok(NodeKind::Branch(branch)) => {
                branch.children.is_empty() || branch.children.values().any(|child| self.has_state(*child))
            }
            _ => false,
        }
    }

    /// Plain value at an absolute path.
    pub fn get_value(&self, path: impl Into<Path>) -> Result<Value> {
        let id = self.resolve(&path.into())?;
        Ok(self.value_of(id))
    }

    /// Values of the named children of the branch at `path`.
    pub fn state_for(&self, path: impl Into<Path>, keys: &[&str]) -> Result<Value> {
        let path = path.into();
        let id = self.resolve(&path)?;
        let mut out = ValueMap::new();
        for key in keys {
            let child = self.child(id, key).ok_or_else(|| Error::NotFound {
                parent: path.clone(),
                key: key.to_string(),
            })?;
            out.insert(key.to_string(), self.value_of(child));
        }
        Ok(Value::Map(out))
    }

    /// Full dump of the tree including units.
    ///
    /// With `with_schema` each leaf becomes `{_value, _default, _updater, ...}`
    /// using its effective attributes; units appear as
    /// `{_unit, _kind, _topology}`.
    pub fn get_config(&self, with_schema: bool) -> Value {
        self.config_of(self.root, with_schema)
    }

    fn config_of(&self, id: StoreId, with_schema: bool) -> Value {
        let Ok(node) = self.node(id) else {
            return Value::Null;
        };
        match &node.kind {
            NodeKind::Leaf(leaf) if with_schema => {
                let schema = self.effective_schema(id).unwrap_or_default();
                let mut map = ValueMap::new();
                map.insert("_value".into(), leaf.value.clone());
                if let Some(default) = &schema.default {
                    map.insert("_default".into(), default.clone());
                }
                map.insert("_updater".into(), Value::from(schema.updater_name()));
                map.insert("_divider".into(), Value::from(schema.divider_name()));
                map.insert("_emit".into(), Value::Bool(schema.emits()));
                if let Some(serializer) = &schema.serializer {
                    map.insert("_serializer".into(), Value::from(serializer.as_str()));
                }
                Value::Map(map)
            }
            NodeKind::Leaf(leaf) => leaf.value.clone(),
            NodeKind::Unit(binding) => Value::from([
                ("_unit", Value::from(binding.name.as_str())),
                ("_kind", Value::from(binding.kind.as_str())),
                ("_topology", binding.topology.to_value()),
            ]),
            NodeKind::Branch(branch) => Value::Map(
                branch
                    .children
                    .iter()
                    .map(|(key, child)| (key.clone(), self.config_of(*child, with_schema)))
                    .collect(),
            ),
        }
    }

    /// Snapshot of the emitting leaves.
    ///
    /// Every branch appears, as an empty map when nothing below it emits;
    /// units are left out. Serializers are applied here.
    pub fn emit_projection(&self) -> Result<Value> {
        self.emit_of(self.root)
    }

    fn emit_of(&self, id: StoreId) -> Result<Value> {
        let node = self.node(id)?;
        match &node.kind {
            NodeKind::Leaf(_) | NodeKind::Unit(_) => Ok(Value::Null),
            NodeKind::Branch(branch) => {
                let mut out = ValueMap::new();
                for (key, child) in &branch.children {
                    match &self.node(*child)?.kind {
                        NodeKind::Unit(_) => {}
                        NodeKind::Branch(_) => {
                            if self.has_state(*child) {
                                out.insert(key.clone(), self.emit_of(*child)?);
                            }
                        }
                        NodeKind::Leaf(leaf) => {
                            let schema = self.effective_schema(*child)?;
                            if !schema.emits() {
                                continue;
                            }
                            let value = match &schema.serializer {
                                Some(name) => (self.registry.serializer(name)?)(&leaf.value),
                                None => leaf.value.clone(),
                            };
                            out.insert(key.clone(), value);
                        }
                    }
                }
                Ok(Value::Map(out))
            }
        }
    }

    /// Apply `store_schema` overrides below the root.
    ///
    /// Attributes are recorded on the named nodes, which are created as
    /// branches when missing; `_value` sets or creates the store.
    pub fn apply_overrides(&mut self, overrides: &SchemaOverride) -> Result<()> {
        self.apply_override_at(&Path::root(), overrides)
    }

    fn apply_override_at(&mut self, path: &Path, overrides: &SchemaOverride) -> Result<()> {
        if let Some(value) = &overrides.value {
            self.set_value(path.clone(), value.clone())?;
        }
        let id = match self.resolve(path) {
            Ok(id) => id,
            Err(Error::PathError { .. }) => self.ensure_branch(path)?,
            Err(other) => return Err(other),
        };
        if !overrides.attrs.is_blank() {
            let node = self.node_mut(id)?;
            node.overrides = overrides.attrs.clone().or(&node.overrides);
        }
        for (key, child) in &overrides.children {
            self.apply_override_at(&path.child(key.clone()), child)?;
        }
        Ok(())
    }

    /// Every unit in the tree, depth-first in insertion order.
    pub fn units(&self) -> Vec<StoreId> {
        let mut out = Vec::new();
        self.collect_units(self.root, &mut out);
        out
    }

    fn collect_units(&self, id: StoreId, out: &mut Vec<StoreId>) {
        match self.node(id).map(|node| &node.kind) {
            Ok(NodeKind::Unit(_)) => out.push(id),
            Ok(NodeKind::Branch(branch)) => {
                for child in branch.children.values() {
                    self.collect_units(*child, out);
                }
            }
            _ => {}
        }
    }
}
