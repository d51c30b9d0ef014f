//! Schema declaration onto stores.

use terrarium_foundation::Path;

use super::{Blueprint, NodeKind, StateTree, StoreId};
use crate::error::{Error, Result};
use crate::schema::{BranchSchema, Schema};
use crate::types::Value;

impl StateTree {
    /// Declare `schema` at an absolute path, creating stores as needed.
    ///
    /// Leaf declarations unify with what is already declared; a fresh leaf,
    /// or one still holding `null`, takes the declared default.
    pub(crate) fn declare_at(&mut self, path: &Path, schema: &Schema) -> Result<StoreId> {
        let path = path.normalize();
        match schema {
            Schema::Leaf(leaf_schema) => {
                let Ok(id) = self.resolve(&path) else {
                    let mut declared = leaf_schema.clone();
                    declared.output = false;
                    let blueprint = Blueprint::Leaf {
                        value: declared.default.clone().unwrap_or_default(),
                        schema: declared,
                        overrides: Default::default(),
                    };
                    return self.create_at(&path, blueprint);
                };
                let policy = self.policy;
                match &mut self.node_mut(id)?.kind {
                    NodeKind::Leaf(leaf) => {
                        leaf.schema.unify(leaf_schema, policy, &path)?;
                        if leaf.value.is_null()
                            && let Some(default) = &leaf.schema.default
                        {
                            leaf.value = default.clone();
                        }
                        Ok(id)
                    }
                    _ if leaf_schema.is_blank() => Ok(id),
                    NodeKind::Branch(_) => Err(kind_conflict(&path, "branch", "leaf")),
                    NodeKind::Unit(_) => Err(kind_conflict(&path, "unit", "leaf")),
                }
            }
            Schema::Branch(branch_schema) => {
                let id = match self.resolve(&path) {
                    Ok(id) => id,
                    Err(Error::PathError { .. }) => self.ensure_branch(&path)?,
                    Err(other) => return Err(other),
                };
                match &self.node(id)?.kind {
                    NodeKind::Branch(_) => {}
                    _ if is_open(branch_schema) => return Ok(id),
                    NodeKind::Leaf(_) => return Err(kind_conflict(&path, "leaf", "branch")),
                    NodeKind::Unit(_) => return Err(kind_conflict(&path, "unit", "branch")),
                }
                if let Some(each) = &branch_schema.each {
                    self.declare_each(id, each)?;
                }
                for (key, child) in &branch_schema.children {
                    self.declare_at(&path.child(key.clone()), child)?;
                }
                Ok(id)
            }
        }
    }

    /// Record `schema` as the child schema of a branch and declare it on
    /// every existing child.
    pub(crate) fn declare_each(&mut self, branch: StoreId, schema: &Schema) -> Result<()> {
        if let NodeKind::Branch(b) = &mut self.node_mut(branch)?.kind
            && b.child_schema.is_none()
        {
            b.child_schema = Some(schema.clone());
        }
        let base = self.path_of(branch)?;
        let keys: Vec<String> = self.children(branch)?.keys().cloned().collect();
        for key in keys {
            self.declare_at(&base.child(key), schema)?;
        }
        Ok(())
    }

    /// Apply the parent's child schema, if any, to a newly attached child.
    pub(crate) fn declare_child_schema(&mut self, parent: StoreId, key: &str) -> Result<()> {
        let schema = match &self.node(parent)?.kind {
            NodeKind::Branch(b) => b.child_schema.clone(),
            _ => None,
        };
        if let Some(schema) = schema {
            let path = self.path_of(parent)?.child(key);
            self.declare_at(&path, &schema)?;
        }
        Ok(())
    }

    /// Whether `schema` could be declared at `id` without a conflict.
    pub(crate) fn check_compatible(&self, id: StoreId, schema: &Schema) -> Result<()> {
        let path = self.path_of(id)?;
        match (schema, &self.node(id)?.kind) {
            (Schema::Leaf(leaf_schema), NodeKind::Leaf(leaf)) => {
                let mut trial = leaf.schema.clone();
                trial.unify(leaf_schema, self.policy, &path)
            }
            (Schema::Leaf(leaf_schema), _) if leaf_schema.is_blank() => Ok(()),
            (Schema::Leaf(_), NodeKind::Branch(_)) => Err(kind_conflict(&path, "branch", "leaf")),
            (Schema::Branch(b), NodeKind::Branch(_)) => {
                for (key, child_schema) in &b.children {
                    if let Some(child) = self.child(id, key) {
                        self.check_compatible(child, child_schema)?;
                    }
                }
                Ok(())
            }
            (Schema::Branch(b), _) if is_open(b) => Ok(()),
            (Schema::Branch(_), NodeKind::Leaf(_)) => Err(kind_conflict(&path, "leaf", "branch")),
            (_, NodeKind::Unit(_)) => Err(kind_conflict(&path, "unit", "port")),
        }
    }
}

fn is_open(schema: &BranchSchema) -> bool {
    schema.children.is_empty() && schema.each.is_none()
}

fn kind_conflict(path: &Path, existing: &str, incoming: &str) -> Error {
    Error::SchemaConflict {
        path: path.clone(),
        field: "kind",
        existing: existing.to_string(),
        incoming: incoming.to_string(),
    }
}

/// Default shown for a store that has not been created.
pub(crate) fn absent_view(schema: &Schema) -> Value {
    match schema {
        Schema::Leaf(leaf) => leaf.default.clone().unwrap_or_default(),
        Schema::Branch(branch) => Value::Map(
            branch
                .children
                .iter()
                .filter(|(_, child)| !child.is_output())
                .map(|(key, child)| (key.clone(), absent_view(child)))
                .collect(),
        ),
    }
}
