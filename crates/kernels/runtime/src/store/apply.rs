//! Merging updates into the tree.

use std::collections::HashSet;

use terrarium_foundation::Path;
use tracing::debug;

use super::{Blueprint, NodeKind, StateTree, StoreId, validate_blueprint_value, validate_key};
use crate::error::{Error, Result};
use crate::types::{AddEntry, Directive, MoveEntry, Update, Value, ValueMap};

impl StateTree {
    /// Merge `update` at `path`.
    ///
    /// Leaf values go through the leaf's updater. Branch updates apply their
    /// child updates first, then their directives in order.
    pub fn apply_update(&mut self, path: impl Into<Path>, update: &Update) -> Result<()> {
        let id = self.resolve(&path.into())?;
        self.apply_at(id, update)
    }

    /// Add children to the branch at `at`. No child is added unless all can be.
    pub fn add(&mut self, at: impl Into<Path>, entries: &[AddEntry]) -> Result<()> {
        let id = self.resolve(&at.into())?;
        self.add_children(id, entries)
    }

    /// Delete the store at `path` and everything below it.
    pub fn delete(&mut self, path: impl Into<Path>) -> Result<()> {
        let path = path.into().normalize();
        let (Some(parent), Some(key)) = (path.parent(), path.last_key()) else {
            return Err(Error::path(&path, "cannot delete the root"));
        };
        let parent_id = self.resolve(&parent)?;
        self.delete_children(parent_id, &[key.to_string()])
    }

    /// Move the store at `path` under the branch at `target`, keeping handles.
    pub fn relocate(&mut self, path: impl Into<Path>, target: impl Into<Path>) -> Result<()> {
        let path = path.into().normalize();
        let (Some(parent), Some(key)) = (path.parent(), path.last_key()) else {
            return Err(Error::path(&path, "cannot move the root"));
        };
        let parent_id = self.resolve(&parent)?;
        let target = target.into().normalize().relative_to(&parent);
        self.move_children(parent_id, &[MoveEntry::new(key, target)])
    }

    pub(crate) fn apply_at(&mut self, id: StoreId, update: &Update) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        let shape = match &self.node(id)?.kind {
            NodeKind::Leaf(_) => Shape::Leaf,
            NodeKind::Branch(_) => Shape::Branch,
            NodeKind::Unit(_) => Shape::Unit,
        };

        match (shape, update) {
            (Shape::Leaf, Update::Value(value)) => self.update_leaf(id, value),
            (Shape::Leaf, Update::Branch(branch)) => {
                if !branch.directives.is_empty() {
                    return Err(Error::path(&self.path_of(id)?, "directives addressed to a leaf"));
                }
                let value = update_to_value(update);
                self.update_leaf(id, &value)
            }
            (Shape::Branch, Update::Value(Value::Map(map))) => {
                for (key, value) in map {
                    self.apply_child(id, key, &Update::Value(value.clone()))?;
                }
                Ok(())
            }
            (Shape::Branch, Update::Value(other)) => Err(Error::SchemaConflict {
                path: self.path_of(id)?,
                field: "kind",
                existing: "branch".into(),
                incoming: other.kind().into(),
            }),
            (Shape::Branch, Update::Branch(branch)) => {
                for (key, child) in &branch.children {
                    self.apply_child(id, key, child)?;
                }
                for directive in &branch.directives {
                    self.apply_directive(id, directive)?;
                }
                Ok(())
            }
            (Shape::Unit, _) => Err(Error::path(&self.path_of(id)?, "cannot update a unit")),
        }
    }

    fn apply_child(&mut self, parent: StoreId, key: &str, update: &Update) -> Result<()> {
        if let Some(child) = self.child(parent, key) {
            return self.apply_at(child, update);
        }
        if update.is_empty() {
            return Ok(());
        }
        validate_key(key)?;
        match update {
            Update::Value(value) => {
                validate_blueprint_value(value)?;
                self.graft(parent, key.to_string(), Blueprint::from_value(value));
                self.declare_child_schema(parent, key)
            }
            Update::Branch(_) => {
                let child = self.graft(parent, key.to_string(), Blueprint::from_value(&Value::map()));
                self.declare_child_schema(parent, key)?;
                self.apply_at(child, update)
            }
        }
    }

    fn update_leaf(&mut self, id: StoreId, incoming: &Value) -> Result<()> {
        let schema = self.effective_schema(id)?;
        let name = schema.updater_name().to_string();
        let registry = self.registry.clone();
        let updater = registry.updater(&name)?;
        let path = self.path_of(id)?;
        let NodeKind::Leaf(leaf) = &mut self.node_mut(id)?.kind else {
            return Err(Error::path(&path, "not a leaf"));
        };
        leaf.value = updater(&leaf.value, incoming).map_err(|source| Error::UpdaterFailed {
            path,
            function: name,
            source,
        })?;
        Ok(())
    }

    fn apply_directive(&mut self, branch: StoreId, directive: &Directive) -> Result<()> {
        match directive {
            Directive::Add(entries) => self.add_children(branch, entries),
            Directive::Delete(keys) => self.delete_children(branch, keys),
            Directive::Divide(division) => self.divide_at(branch, division),
            Directive::Move(entries) => self.move_children(branch, entries),
        }
    }

    fn add_children(&mut self, branch: StoreId, entries: &[AddEntry]) -> Result<()> {
        let parent = self.path_of(branch)?;
        let mut seen = HashSet::new();
        for entry in entries {
            validate_key(&entry.key)?;
            validate_blueprint_value(&entry.state)?;
            if self.child(branch, &entry.key).is_some() || !seen.insert(entry.key.as_str()) {
                return Err(Error::DuplicateKey {
                    parent,
                    key: entry.key.clone(),
                });
            }
        }
        for entry in entries {
            self.graft(branch, entry.key.clone(), Blueprint::from_value(&entry.state));
            self.declare_child_schema(branch, &entry.key)?;
            debug!(parent = %parent, key = %entry.key, "added store");
        }
        Ok(())
    }

    fn delete_children(&mut self, branch: StoreId, keys: &[String]) -> Result<()> {
        let parent = self.path_of(branch)?;
        let mut targets = Vec::with_capacity(keys.len());
        for key in keys {
            let child = self.child(branch, key).ok_or_else(|| Error::NotFound {
                parent: parent.clone(),
                key: key.clone(),
            })?;
            if !targets.contains(&child) {
                targets.push(child);
            }
        }
        for child in targets {
            self.remove_subtree(child)?;
        }
        debug!(parent = %parent, count = keys.len(), "deleted stores");
        Ok(())
    }

    fn move_children(&mut self, branch: StoreId, entries: &[MoveEntry]) -> Result<()> {
        let origin = self.path_of(branch)?;
        let mut plan = Vec::with_capacity(entries.len());
        let mut incoming: HashSet<(StoreId, &str)> = HashSet::new();
        for entry in entries {
            let source = self.child(branch, &entry.key).ok_or_else(|| Error::NotFound {
                parent: origin.clone(),
                key: entry.key.clone(),
            })?;
            let target_path = origin.join(&entry.target).normalize();
            let target = self.resolve(&target_path)?;
            if !matches!(self.node(target)?.kind, NodeKind::Branch(_)) {
                return Err(Error::path(&target_path, "move target is not a branch"));
            }
            let source_path = origin.child(entry.key.clone());
            if target_path.starts_with(&source_path) {
                return Err(Error::path(&target_path, "cannot move a store inside itself"));
            }
            if target != branch
                && (self.child(target, &entry.key).is_some() || !incoming.insert((target, entry.key.as_str())))
            {
                return Err(Error::DuplicateKey {
                    parent: target_path,
                    key: entry.key.clone(),
                });
            }
            plan.push((source, target));
        }
        for (source, target) in plan {
            self.reparent(source, target)?;
        }
        Ok(())
    }

    /// Detach `id` from its parent and attach it under `target`, keeping
    /// every handle in the subtree valid.
    pub(crate) fn reparent(&mut self, id: StoreId, target: StoreId) -> Result<()> {
        let node = self.node(id)?;
        let key = node.key.clone();
        let Some(parent) = node.parent else {
            return Err(Error::path(&Path::root(), "cannot move the root"));
        };
        if parent == target {
            return Ok(());
        }
        if let NodeKind::Branch(b) = &mut self.node_mut(parent)?.kind {
            b.children.shift_remove(&key);
        }
        if let NodeKind::Branch(b) = &mut self.node_mut(target)?.kind {
            b.children.insert(key.clone(), id);
        }
        self.node_mut(id)?.parent = Some(target);
        self.declare_child_schema(target, &key)?;
        self.touch_structure();
        debug!(from = %self.path_of(parent)?, to = %self.path_of(id)?, "moved store");
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Shape {
    Leaf,
    Branch,
    Unit,
}

/// Collapse a branch update addressed to a leaf into a map value.
fn update_to_value(update: &Update) -> Value {
    match update {
        Update::Value(value) => value.clone(),
        Update::Branch(branch) => Value::Map(
            branch
                .children
                .iter()
                .map(|(k, v)| (k.clone(), update_to_value(v)))
                .collect::<ValueMap>(),
        ),
    }
}
