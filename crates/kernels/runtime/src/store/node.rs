//! Arena slots and node variants.

use indexmap::IndexMap;
use terrarium_foundation::Path;

use crate::schema::{LeafSchema, Schema};
use crate::topology::Topology;
use crate::types::Value;
use crate::unit::{Unit, UnitKind};

/// Stable handle to a node of one particular [`StateTree`](super::StateTree).
///
/// Handles carry the identity of their tree and a generation counter, so a
/// handle from another tree, or one whose node has been deleted, is detected
/// instead of silently addressing a recycled slot. Relocating a node keeps
/// its handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreId {
    pub(crate) tree: u32,
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

pub(crate) struct Slot {
    pub generation: u32,
    pub node: Option<Node>,
}

pub(crate) struct Node {
    pub key: String,
    /// `None` only for the root.
    pub parent: Option<StoreId>,
    /// `store_schema` attributes; on a branch they cover every descendant.
    pub overrides: LeafSchema,
    pub kind: NodeKind,
}

pub(crate) enum NodeKind {
    Leaf(Leaf),
    Branch(Branch),
    Unit(UnitBinding),
}

#[derive(Clone)]
pub(crate) struct Leaf {
    pub value: Value,
    pub schema: LeafSchema,
}

#[derive(Default)]
pub(crate) struct Branch {
    pub children: IndexMap<String, StoreId>,
    /// Declared on every current and future child.
    pub child_schema: Option<Schema>,
}

/// A schedulable unit grafted into the tree.
pub struct UnitBinding {
    /// Empty while the engine is computing the unit's update.
    pub(crate) unit: Option<Unit>,
    pub(crate) name: String,
    pub(crate) kind: UnitKind,
    pub(crate) parallel: bool,
    /// Cached `ports_schema()`, always a branch.
    pub(crate) ports: Schema,
    pub(crate) topology: Topology,
    /// Steps that must run first, relative to this unit's parent.
    pub(crate) flow: Vec<Path>,
}

impl UnitBinding {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    pub fn ports(&self) -> &Schema {
        &self.ports
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn flow(&self) -> &[Path] {
        &self.flow
    }

    pub fn unit(&self) -> Option<&Unit> {
        self.unit.as_ref()
    }

    /// Copy of this binding around a forked unit.
    pub(crate) fn fork(&self) -> Option<UnitBinding> {
        let unit = self.unit.as_ref()?.fork();
        Some(UnitBinding {
            unit: Some(unit),
            name: self.name.clone(),
            kind: self.kind,
            parallel: self.parallel,
            ports: self.ports.clone(),
            topology: self.topology.clone(),
            flow: self.flow.clone(),
        })
    }
}

/// Detached subtree waiting to be grafted.
///
/// Directives build blueprints first and graft them only once every part of
/// the directive has validated.
pub(crate) enum Blueprint {
    Leaf {
        value: Value,
        schema: LeafSchema,
        overrides: LeafSchema,
    },
    Branch {
        children: IndexMap<String, Blueprint>,
        child_schema: Option<Schema>,
        overrides: LeafSchema,
    },
    Unit {
        binding: UnitBinding,
        overrides: LeafSchema,
    },
}

impl Blueprint {
    /// Plain state: maps become branches, everything else a leaf.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Map(map) => Blueprint::Branch {
                children: map
                    .iter()
                    .map(|(k, v)| (k.clone(), Blueprint::from_value(v)))
                    .collect(),
                child_schema: None,
                overrides: LeafSchema::default(),
            },
            other => Blueprint::Leaf {
                value: other.clone(),
                schema: LeafSchema::default(),
                overrides: LeafSchema::default(),
            },
        }
    }

    /// Overwrite values with `state`, adding stores that are missing.
    pub fn set_state(&mut self, state: &Value) -> Result<(), String> {
        match (self, state) {
            (Blueprint::Leaf { value, .. }, state) => {
                *value = state.clone();
                Ok(())
            }
            (Blueprint::Branch { children, .. }, Value::Map(map)) => {
                for (key, child_state) in map {
                    match children.get_mut(key) {
                        Some(child) => child.set_state(child_state)?,
                        None => {
                            children.insert(key.clone(), Blueprint::from_value(child_state));
                        }
                    }
                }
                Ok(())
            }
            (Blueprint::Branch { .. }, other) => {
                Err(format!("cannot set a {} over a branch", other.kind()))
            }
            (Blueprint::Unit { binding, .. }, _) => {
                Err(format!("cannot set state over unit '{}'", binding.name))
            }
        }
    }
}
