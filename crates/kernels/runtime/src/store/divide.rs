//! Division of a subtree into daughters.
//!
//! Every leaf of the mother is split by its divider into one value per
//! daughter; branches are rebuilt around the split leaves and units are
//! forked. The mother is removed only after every leaf has divided and every
//! daughter state has been applied, so a failed division changes nothing.

use std::collections::HashSet;

use indexmap::IndexMap;
use terrarium_foundation::{Path, RngStream};
use tracing::debug;

use super::{Blueprint, NodeKind, StateTree, StoreId, validate_key};
use crate::error::{Error, Result};
use crate::types::{Division, Value};

impl StateTree {
    /// Divide child `division.mother` of the branch at `parent`.
    pub fn divide(&mut self, parent: impl Into<Path>, division: &Division) -> Result<()> {
        let parent = self.resolve(&parent.into())?;
        self.divide_at(parent, division)
    }

    pub(crate) fn divide_at(&mut self, parent: StoreId, division: &Division) -> Result<()> {
        let parent_path = self.path_of(parent)?;
        let mother = self
            .child(parent, &division.mother)
            .ok_or_else(|| Error::NotFound {
                parent: parent_path.clone(),
                key: division.mother.clone(),
            })?;
        let mother_path = self.path_of(mother)?;
        let count = division.daughters.len();
        if count == 0 {
            return Err(Error::path(&mother_path, "division names no daughters"));
        }

        let mut seen = HashSet::new();
        for daughter in &division.daughters {
            validate_key(&daughter.key)?;
            let taken = daughter.key != division.mother && self.child(parent, &daughter.key).is_some();
            if taken || !seen.insert(daughter.key.as_str()) {
                return Err(Error::DuplicateKey {
                    parent: parent_path,
                    key: daughter.key.clone(),
                });
            }
        }

        let mut blueprints = self.split(mother, &Path::root(), count, &division.dividers)?;
        for (blueprint, daughter) in blueprints.iter_mut().zip(&division.daughters) {
            if let Some(state) = &daughter.state {
                blueprint
                    .set_state(state)
                    .map_err(|reason| Error::path(&parent_path.child(daughter.key.clone()), reason))?;
            }
        }

        self.remove_subtree(mother)?;
        for (blueprint, daughter) in blueprints.into_iter().zip(&division.daughters) {
            self.graft(parent, daughter.key.clone(), blueprint);
            self.declare_child_schema(parent, &daughter.key)?;
        }
        debug!(mother = %mother_path, daughters = count, "divided store");
        Ok(())
    }

    /// Values the subtree at `path` would divide into, without dividing it.
    pub fn divide_value(&self, path: impl Into<Path>, count: usize) -> Result<Vec<Value>> {
        let path = path.into();
        let id = self.resolve(&path)?;
        if count == 0 {
            return Err(Error::path(&path, "division names no daughters"));
        }
        let parts = self.split(id, &Path::root(), count, &IndexMap::new())?;
        Ok(parts.iter().map(blueprint_value).collect())
    }

    /// One blueprint per daughter for the subtree at `id`.
    ///
    /// `rel` is the path of `id` below the mother, used to look up divider
    /// overrides.
    fn split(
        &self,
        id: StoreId,
        rel: &Path,
        count: usize,
        dividers: &IndexMap<Path, String>,
    ) -> Result<Vec<Blueprint>> {
        let node = self.node(id)?;
        match &node.kind {
            NodeKind::Leaf(leaf) => {
                let path = self.path_of(id)?;
                let name = match dividers.get(rel) {
                    Some(name) => name.clone(),
                    None => self.effective_schema(id)?.divider_name().to_string(),
                };
                let divider = self.registry.divider(&name)?;
                if let Some(arity) = divider.arity
                    && arity != count
                {
                    return Err(Error::DividerMismatch {
                        path,
                        divider: name,
                        expected: arity,
                        actual: count,
                    });
                }
                let mut rng = RngStream::derive(self.seed ^ self.structure_version, &path.to_string());
                let values = (divider.func)(&leaf.value, count, &mut rng).map_err(|source| {
                    Error::UpdaterFailed {
                        path: path.clone(),
                        function: name.clone(),
                        source,
                    }
                })?;
                if values.len() != count {
                    return Err(Error::DividerMismatch {
                        path,
                        divider: name,
                        expected: values.len(),
                        actual: count,
                    });
                }
                Ok(values
                    .into_iter()
                    .map(|value| Blueprint::Leaf {
                        value,
                        schema: leaf.schema.clone(),
                        overrides: node.overrides.clone(),
                    })
                    .collect())
            }
            NodeKind::Branch(branch) => {
                let mut daughters: Vec<IndexMap<String, Blueprint>> =
                    (0..count).map(|_| IndexMap::new()).collect();
                for (key, child) in &branch.children {
                    let parts = self.split(*child, &rel.child(key.clone()), count, dividers)?;
                    for (daughter, part) in daughters.iter_mut().zip(parts) {
                        daughter.insert(key.clone(), part);
                    }
                }
                Ok(daughters
                    .into_iter()
                    .map(|children| Blueprint::Branch {
                        children,
                        child_schema: branch.child_schema.clone(),
                        overrides: node.overrides.clone(),
                    })
                    .collect())
            }
            NodeKind::Unit(binding) => (0..count)
                .map(|_| {
                    let forked = binding
                        .fork()
                        .ok_or_else(|| Error::path(rel, format!("unit '{}' is busy", binding.name)))?;
                    Ok(Blueprint::Unit {
                        binding: forked,
                        overrides: node.overrides.clone(),
                    })
                })
                .collect(),
        }
    }
}

fn blueprint_value(blueprint: &Blueprint) -> Value {
    match blueprint {
        Blueprint::Leaf { value, .. } => value.clone(),
        Blueprint::Unit { .. } => Value::Null,
        Blueprint::Branch { children, .. } => Value::Map(
            children
                .iter()
                .filter(|(_, child)| !matches!(child, Blueprint::Unit { .. }))
                .map(|(key, child)| (key.clone(), blueprint_value(child)))
                .collect(),
        ),
    }
}
