//! The hierarchical state tree.
//!
//! All simulated state lives in one [`StateTree`]: an arena of nodes addressed
//! by generational [`StoreId`] handles. Every node records its parent handle,
//! so relative paths (`../../structure/radius`) resolve by walking handles and
//! never by aliasing references between nodes.
//!
//! # Node variants
//!
//! - **Leaf**: a [`Value`] plus its declared [`LeafSchema`].
//! - **Branch**: insertion-ordered children, optionally with a child schema
//!   declared on every current and future child.
//! - **Unit**: a [`UnitBinding`]. Behaves as a leaf for the purposes of the
//!   tree but is schedulable; navigation can pass through its ports.
//!
//! # Mutation
//!
//! Updates are merged by [`StateTree::apply_update`] through the leaves'
//! updaters. Structural directives (add, delete, divide, move) validate
//! completely before they change anything. Every structural change bumps
//! [`StateTree::structure_version`], which the engine watches to know when
//! its unit registry must be re-derived.

mod apply;
mod declare;
mod divide;
mod node;
mod project;
mod units;


pub(crate) use declare::absent_view;
pub use node::{StoreId, UnitBinding};
pub use units::ConnectTarget;
pub(crate) use node::{Blueprint, Branch, Leaf, Node, NodeKind, Slot};

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use indexmap::IndexMap;
use terrarium_foundation::{Path, Segment};
use tracing::debug;

use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::schema::{LeafSchema, Schema, SchemaPolicy};
use crate::types::Value;

/// Contents a multi-step mutation may touch, captured so that a failure
/// part way through can be undone. Unit bindings are not captured; the
/// mutations that use checkpoints only add units.
pub(crate) struct Checkpoint {
    live: HashSet<StoreId>,
    leaves: Vec<(StoreId, Leaf)>,
    child_schemas: Vec<(StoreId, Option<Schema>)>,
}

static NEXT_TREE_ID: AtomicU32 = AtomicU32::new(1);

/// Hierarchical, schema-governed simulation state.
pub struct StateTree {
    id: u32,
    slots: Vec<Slot>,
    free: Vec<u32>,
    root: StoreId,
    registry: Arc<Registry>,
    policy: SchemaPolicy,
    seed: u64,
    structure_version: u64,
}

impl StateTree {
    /// Empty tree resolving updater and divider names through `registry`.
    pub fn new(registry: Arc<Registry>) -> Self {
        let id = NEXT_TREE_ID.fetch_add(1, Ordering::Relaxed);
        let root = StoreId {
            tree: id,
            index: 0,
            generation: 0,
        };
        let root_node = Node {
            key: String::new(),
            parent: None,
            overrides: LeafSchema::default(),
            kind: NodeKind::Branch(Branch::default()),
        };
        Self {
            id,
            slots: vec![Slot {
                generation: 0,
                node: Some(root_node),
            }],
            free: Vec::new(),
            root,
            registry,
            policy: SchemaPolicy::default(),
            seed: 0,
            structure_version: 0,
        }
    }

    /// How conflicting schema declarations are treated.
    pub fn with_policy(mut self, policy: SchemaPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Seed for randomised dividers.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn policy(&self) -> SchemaPolicy {
        self.policy
    }

    pub fn root(&self) -> StoreId {
        self.root
    }

    /// Incremented by every change to the shape of the tree or its wiring.
    pub fn structure_version(&self) -> u64 {
        self.structure_version
    }

    pub(crate) fn touch_structure(&mut self) {
        self.structure_version += 1;
    }

    // ========================================================================
    // Arena
    // ========================================================================

    /// Whether `id` is a live node of this tree.
    pub fn contains(&self, id: StoreId) -> bool {
        self.slot_node(id).is_some()
    }

    fn slot_node(&self, id: StoreId) -> Option<&Node> {
        if id.tree != self.id {
            return None;
        }
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_ref()
    }

    pub(crate) fn node(&self, id: StoreId) -> Result<&Node> {
        self.slot_node(id).ok_or_else(|| stale(id))
    }

    pub(crate) fn node_mut(&mut self, id: StoreId) -> Result<&mut Node> {
        if id.tree != self.id {
            return Err(stale(id));
        }
        match self.slots.get_mut(id.index as usize) {
            Some(slot) if slot.generation == id.generation => slot.node.as_mut().ok_or_else(|| stale(id)),
            _ => Err(stale(id)),
        }
    }

    fn alloc(&mut self, node: Node) -> StoreId {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.node = Some(node);
                StoreId {
                    tree: self.id,
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                StoreId {
                    tree: self.id,
                    index,
                    generation: 0,
                }
            }
        }
    }

    fn release(&mut self, id: StoreId) -> Option<Node> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let node = slot.node.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        node
    }

    fn live_ids(&self) -> impl Iterator<Item = (StoreId, &Node)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            let node = slot.node.as_ref()?;
            let id = StoreId {
                tree: self.id,
                index: index as u32,
                generation: slot.generation,
            };
            Some((id, node))
        })
    }

    pub(crate) fn checkpoint(&self) -> Checkpoint {
        let mut checkpoint = Checkpoint {
            live: HashSet::new(),
            leaves: Vec::new(),
            child_schemas: Vec::new(),
        };
        for (id, node) in self.live_ids() {
            checkpoint.live.insert(id);
            match &node.kind {
                NodeKind::Leaf(leaf) => checkpoint.leaves.push((id, leaf.clone())),
                NodeKind::Branch(branch) => {
                    checkpoint.child_schemas.push((id, branch.child_schema.clone()))
                }
                NodeKind::Unit(_) => {}
            }
        }
        checkpoint
    }

    /// Drop every node created since `checkpoint` and restore the leaves and
    /// child schemas it captured.
    pub(crate) fn rollback(&mut self, checkpoint: Checkpoint) -> Result<()> {
        let created: Vec<StoreId> = self
            .live_ids()
            .filter(|(id, node)| {
                !checkpoint.live.contains(id)
                    && node.parent.is_some_and(|parent| checkpoint.live.contains(&parent))
            })
            .map(|(id, _)| id)
            .collect();
        for id in created {
            self.remove_subtree(id)?;
        }
        for (id, leaf) in checkpoint.leaves {
            if let Ok(Node {
                kind: NodeKind::Leaf(current),
                ..
            }) = self.node_mut(id)
            {
                *current = leaf;
            }
        }
        for (id, child_schema) in checkpoint.child_schemas {
            if let Ok(Node {
                kind: NodeKind::Branch(branch),
                ..
            }) = self.node_mut(id)
            {
                branch.child_schema = child_schema;
            }
        }
        debug!("rolled back to checkpoint");
        Ok(())
    }

    /// Children of a branch, in insertion order.
    pub(crate) fn children(&self, id: StoreId) -> Result<&IndexMap<String, StoreId>> {
        match &self.node(id)?.kind {
            NodeKind::Branch(branch) => Ok(&branch.children),
            _ => Err(Error::path(&self.path_of(id)?, "not a branch")),
        }
    }

    pub(crate) fn child(&self, id: StoreId, key: &str) -> Option<StoreId> {
        match &self.slot_node(id)?.kind {
            NodeKind::Branch(branch) => branch.children.get(key).copied(),
            _ => None,
        }
    }

    /// Absolute path of a live node.
    pub fn path_of(&self, id: StoreId) -> Result<Path> {
        let mut keys = Vec::new();
        let mut current = self.node(id)?;
        while let Some(parent) = current.parent {
            keys.push(Segment::Key(current.key.clone()));
            current = self.node(parent)?;
        }
        keys.reverse();
        Ok(Path::new(keys))
    }

    /// Path of a unit's parent: the origin its relative wires resolve from.
    pub(crate) fn origin_of(&self, id: StoreId) -> Result<Path> {
        let node = self.node(id)?;
        match node.parent {
            Some(parent) => self.path_of(parent),
            None => Ok(Path::root()),
        }
    }

    /// Detach and free a node and everything below it.
    pub(crate) fn remove_subtree(&mut self, id: StoreId) -> Result<()> {
        let parent = self.node(id)?.parent;
        let key = self.node(id)?.key.clone();
        if let Some(parent) = parent
            && let Ok(Node {
                kind: NodeKind::Branch(branch),
                ..
            }) = self.node_mut(parent)
        {
            branch.children.shift_remove(&key);
        }

        let mut pending = vec![id];
        while let Some(next) = pending.pop() {
            if let Some(Node {
                kind: NodeKind::Branch(branch),
                ..
            }) = self.release(next)
            {
                pending.extend(branch.children.into_values());
            }
        }
        self.touch_structure();
        Ok(())
    }

    /// Materialise a blueprint as child `key` of `parent`.
    pub(crate) fn graft(&mut self, parent: StoreId, key: String, blueprint: Blueprint) -> StoreId {
        let (kind, overrides, children) = match blueprint {
            Blueprint::Leaf {
                value,
                schema,
                overrides,
            } => (NodeKind::Leaf(Leaf { value, schema }), overrides, None),
            Blueprint::Branch {
                children,
                child_schema,
                overrides,
            } => (
                NodeKind::Branch(Branch {
                    children: IndexMap::new(),
                    child_schema,
                }),
                overrides,
                Some(children),
            ),
            Blueprint::Unit { binding, overrides } => (NodeKind::Unit(binding), overrides, None),
        };

        let id = self.alloc(Node {
            key: key.clone(),
            parent: Some(parent),
            overrides,
            kind,
        });
        if let Ok(Node {
            kind: NodeKind::Branch(branch),
            ..
        }) = self.node_mut(parent)
        {
            branch.children.insert(key, id);
        }
        if let Some(children) = children {
            for (child_key, child) in children {
                self.graft(id, child_key, child);
            }
        }
        self.touch_structure();
        id
    }

    // ========================================================================
    // Navigation
    // ========================================================================

    /// Resolve an absolute path.
    pub fn resolve(&self, path: &Path) -> Result<StoreId> {
        self.resolve_from(self.root, path)
    }

    /// Resolve `path` starting at `start`.
    ///
    /// Reaching a unit with segments left follows the unit's port wiring,
    /// so `p1/port1/var_a` lands on whatever `port1` of `p1` is wired to.
    pub fn resolve_from(&self, start: StoreId, path: &Path) -> Result<StoreId> {
        let segments = path.segments();
        let mut current = start;
        self.node(current)?;
        let mut i = 0;
        while i < segments.len() {
            let node = self.node(current)?;
            match &segments[i] {
                Segment::Parent => {
                    current = node
                        .parent
                        .ok_or_else(|| Error::path(path, "climbs above the root"))?;
                    i += 1;
                }
                Segment::Key(key) => match &node.kind {
                    NodeKind::Branch(branch) => {
                        current = *branch
                            .children
                            .get(key)
                            .ok_or_else(|| Error::path(path, format!("no child '{key}'")))?;
                        i += 1;
                    }
                    NodeKind::Unit(binding) => {
                        let origin = self.origin_of(current)?;
                        let (target, used) = binding
                            .topology
                            .port_target(&origin, &segments[i..])
                            .ok_or_else(|| {
                                Error::path(path, format!("unit '{}' has no port '{key}'", node.key))
                            })?;
                        let rest = Path::new(segments[i + used..].to_vec());
                        return self.resolve(&target.join(&rest).normalize());
                    }
                    NodeKind::Leaf(_) => {
                        return Err(Error::path(path, format!("'{}' is a leaf", node.key)));
                    }
                },
            }
        }
        Ok(current)
    }

    /// Live view of the node at an absolute path.
    pub fn get(&self, path: impl Into<Path>) -> Result<StoreRef<'_>> {
        let id = self.resolve(&path.into())?;
        self.store(id)
    }

    /// Live view of a node by handle.
    pub fn store(&self, id: StoreId) -> Result<StoreRef<'_>> {
        let node = self.node(id)?;
        Ok(StoreRef {
            tree: self,
            id,
            node,
        })
    }

    // ========================================================================
    // Creation
    // ========================================================================

    /// Create a store, adding intermediate branches as needed.
    ///
    /// A map value creates a subtree. Otherwise a leaf is created holding
    /// `value`, or the schema default when no value is given. With neither
    /// value nor schema an empty branch is created.
    pub fn create(
        &mut self,
        path: impl Into<Path>,
        value: Option<Value>,
        schema: Option<LeafSchema>,
    ) -> Result<StoreId> {
        let path = path.into();
        let blueprint = match (value, schema) {
            (None, None) => Blueprint::from_value(&Value::map()),
            (Some(value @ Value::Map(_)), schema) => {
                let mut blueprint = Blueprint::from_value(&value);
                if let (Some(schema), Blueprint::Branch { overrides, .. }) = (schema, &mut blueprint) {
                    *overrides = schema;
                }
                blueprint
            }
            (value, schema) => {
                let mut schema = schema.unwrap_or_default();
                schema.output = false;
                Blueprint::Leaf {
                    value: value.or_else(|| schema.default.clone()).unwrap_or_default(),
                    schema,
                    overrides: LeafSchema::default(),
                }
            }
        };
        let id = self.create_at(&path, blueprint)?;
        debug!(%path, "created store");
        Ok(id)
    }

    /// Graft a blueprint at `path`, which must not exist yet.
    pub(crate) fn create_at(&mut self, path: &Path, blueprint: Blueprint) -> Result<StoreId> {
        let path = path.normalize();
        let key = path
            .last_key()
            .ok_or_else(|| Error::PathConflict(path.clone()))?
            .to_string();
        validate_key(&key)?;
        let parent_path = path.parent().unwrap_or_default();
        let parent = self.ensure_branch(&parent_path)?;
        if self.child(parent, &key).is_some() {
            return Err(Error::PathConflict(path));
        }
        validate_blueprint(&blueprint)?;
        let id = self.graft(parent, key.clone(), blueprint);
        self.declare_child_schema(parent, &key)?;
        Ok(id)
    }

    /// Resolve `path` as a branch, creating missing branches along the way.
    pub(crate) fn ensure_branch(&mut self, path: &Path) -> Result<StoreId> {
        let mut current = self.root;
        for segment in path.normalize().segments() {
            let Segment::Key(key) = segment else {
                return Err(Error::path(path, "climbs above the root"));
            };
            current = match &self.node(current)?.kind {
                NodeKind::Branch(branch) => match branch.children.get(key) {
                    Some(child) => *child,
                    None => {
                        validate_key(key)?;
                        let id = self.graft(current, key.clone(), Blueprint::from_value(&Value::map()));
                        self.declare_child_schema(current, key)?;
                        id
                    }
                },
                NodeKind::Leaf(_) | NodeKind::Unit(_) => {
                    return Err(Error::path(path, format!("'{key}' is below a leaf")));
                }
            };
        }
        match &self.node(current)?.kind {
            NodeKind::Branch(_) => Ok(current),
            _ => Err(Error::path(path, "not a branch")),
        }
    }

    /// Set values at `path` without going through updaters.
    ///
    /// Missing stores are created. A map written over a branch sets each
    /// named child and leaves the others alone.
    pub fn set_value(&mut self, path: impl Into<Path>, value: impl Into<Value>) -> Result<()> {
        let path = path.into();
        let value = value.into();
        match self.resolve(&path) {
            Ok(id) => self.set_value_at(id, &value),
            Err(Error::PathError { .. }) => {
                let blueprint = Blueprint::from_value(&value);
                self.create_at(&path, blueprint).map(|_| ())
            }
            Err(other) => Err(other),
        }
    }

    pub(crate) fn set_value_at(&mut self, id: StoreId, value: &Value) -> Result<()> {
        let is_branch = matches!(self.node(id)?.kind, NodeKind::Branch(_));
        if is_branch {
            let Value::Map(map) = value else {
                return Err(Error::SchemaConflict {
                    path: self.path_of(id)?,
                    field: "kind",
                    existing: "branch".into(),
                    incoming: value.kind().into(),
                });
            };
            for (key, child_value) in map {
                match self.child(id, key) {
                    Some(child) => self.set_value_at(child, child_value)?,
                    None => {
                        validate_key(key)?;
                        validate_blueprint_value(child_value)?;
                        self.graft(id, key.clone(), Blueprint::from_value(child_value));
                        self.declare_child_schema(id, key)?;
                    }
                }
            }
            return Ok(());
        }
        let path = self.path_of(id)?;
        match &mut self.node_mut(id)?.kind {
            NodeKind::Leaf(leaf) => {
                leaf.value = value.clone();
                Ok(())
            }
            _ => Err(Error::path(&path, "cannot set the value of a unit")),
        }
    }

    /// Attributes in force at a node: its own overrides, then the nearest
    /// ancestor's, then its declaration.
    pub fn effective_schema(&self, id: StoreId) -> Result<LeafSchema> {
        let node = self.node(id)?;
        let mut schema = node.overrides.clone();
        let mut parent = node.parent;
        while let Some(ancestor) = parent {
            let ancestor = self.node(ancestor)?;
            schema = schema.or(&ancestor.overrides);
            parent = ancestor.parent;
        }
        if let NodeKind::Leaf(leaf) = &node.kind {
            schema = schema.or(&leaf.schema);
        }
        Ok(schema)
    }
}

impl Default for StateTree {
    fn default() -> Self {
        Self::new(Arc::new(Registry::new()))
    }
}

impl std::fmt::Debug for StateTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateTree")
            .field("id", &self.id)
            .field("nodes", &(self.slots.len() - self.free.len()))
            .field("structure_version", &self.structure_version)
            .finish()
    }
}

fn stale(id: StoreId) -> Error {
    Error::path(
        &Path::root(),
        format!("handle {}:{}@{} is stale or foreign", id.tree, id.index, id.generation),
    )
}

/// Keys must be non-empty single segments.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.contains('/') || key == ".." || key == "." {
        return Err(Error::InvalidKey(key.to_string()));
    }
    Ok(())
}

fn validate_blueprint(blueprint: &Blueprint) -> Result<()> {
    if let Blueprint::Branch { children, .. } = blueprint {
        for (key, child) in children {
            validate_key(key)?;
            validate_blueprint(child)?;
        }
    }
    Ok(())
}

pub(crate) fn validate_blueprint_value(value: &Value) -> Result<()> {
    if let Value::Map(map) = value {
        for (key, child) in map {
            validate_key(key)?;
            validate_blueprint_value(child)?;
        }
    }
    Ok(())
}

// ============================================================================
// StoreRef
// ============================================================================

/// Borrowed, live view of one node.
///
/// Reads always reflect the tree as it is; a `StoreRef` holds no copy.
#[derive(Clone, Copy)]
pub struct StoreRef<'a> {
    tree: &'a StateTree,
    id: StoreId,
    node: &'a Node,
}

impl<'a> StoreRef<'a> {
    pub fn id(&self) -> StoreId {
        self.id
    }

    pub fn key(&self) -> &'a str {
        &self.node.key
    }

    pub fn path(&self) -> Result<Path> {
        self.tree.path_of(self.id)
    }

    /// Navigate relative to this node; equivalent to one joined lookup.
    pub fn get(&self, path: impl Into<Path>) -> Result<StoreRef<'a>> {
        let id = self.tree.resolve_from(self.id, &path.into())?;
        self.tree.store(id)
    }

    pub fn parent(&self) -> Option<StoreRef<'a>> {
        self.node.parent.and_then(|id| self.tree.store(id).ok())
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.node.kind, NodeKind::Leaf(_))
    }

    pub fn is_branch(&self) -> bool {
        matches!(self.node.kind, NodeKind::Branch(_))
    }

    pub fn is_unit(&self) -> bool {
        matches!(self.node.kind, NodeKind::Unit(_))
    }

    /// Child keys of a branch, in insertion order.
    pub fn keys(&self) -> Vec<&'a str> {
        match &self.node.kind {
            NodeKind::Branch(branch) => branch.children.keys().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }

    /// Value of this subtree, excluding units.
    pub fn value(&self) -> Value {
        self.tree.value_of(self.id)
    }

    /// Attributes in force at this node.
    pub fn schema(&self) -> LeafSchema {
        self.tree.effective_schema(self.id).unwrap_or_default()
    }

    pub fn unit(&self) -> Option<&'a UnitBinding> {
        match &self.node.kind {
            NodeKind::Unit(binding) => Some(binding),
            _ => None,
        }
    }
}

impl std::fmt::Debug for StoreRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreRef")
            .field("id", &self.id)
            .field("key", &self.node.key)
            .finish()
    }
}
