//! Port wiring and per-tick resolution.
//!
//! A unit's [`Topology`] maps each port to a [`Wire`]. Wires are resolved
//! against the tree's *current* shape whenever a view is built or an update
//! is projected, so a subtree added since the last tick is picked up without
//! reconfiguration.
//!
//! ```text
//! Relative("../boundary")           from the unit's parent
//! Absolute("environment/fields")    from the root
//! Branch { base, remaps }           sub-ports remapped relative to base
//! Each { base, child }              one binding per current child of base
//! ```

use indexmap::IndexMap;
use terrarium_foundation::{Path, Segment};
use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::schema::Schema;
use crate::store::{NodeKind, StateTree, StoreId, absent_view};
use crate::types::{Update, UpdateBranch, Value, ValueMap};

/// Where one port points.
#[derive(Debug, Clone, PartialEq)]
pub enum Wire {
    /// Path from the unit's parent.
    Relative(Path),
    /// Path from the root.
    Absolute(Path),
    /// Base wire plus per-sub-port remaps resolved relative to the base.
    Branch {
        base: Box<Wire>,
        remaps: IndexMap<String, Wire>,
    },
    /// Wildcard: fans out over every child of `base` present at resolution
    /// time; `child` is resolved relative to each child.
    Each { base: Path, child: Box<Wire> },
}

impl Wire {
    pub fn relative(path: impl Into<Path>) -> Self {
        Wire::Relative(path.into())
    }

    pub fn absolute(path: impl Into<Path>) -> Self {
        Wire::Absolute(path.into())
    }

    pub fn branch(base: impl Into<Wire>) -> Self {
        Wire::Branch {
            base: Box::new(base.into()),
            remaps: IndexMap::new(),
        }
    }

    /// Wildcard over the children of `base`, binding each child itself.
    pub fn each(base: impl Into<Path>) -> Self {
        Wire::Each {
            base: base.into(),
            child: Box::new(Wire::Relative(Path::root())),
        }
    }

    /// Wildcard over the children of `base` with a wire inside each child.
    pub fn each_with(base: impl Into<Path>, child: Wire) -> Self {
        Wire::Each {
            base: base.into(),
            child: Box::new(child),
        }
    }

    /// Remap a sub-port. Turns a plain wire into a branch wire on the same base.
    pub fn remap(self, port: impl Into<String>, wire: impl Into<Wire>) -> Self {
        let (base, mut remaps) = match self {
            Wire::Branch { base, remaps } => (base, remaps),
            plain => (Box::new(plain), IndexMap::new()),
        };
        remaps.insert(port.into(), wire.into());
        Wire::Branch { base, remaps }
    }

    /// Absolute path this wire points at, and how many of `rest` it consumed.
    fn target(&self, origin: &Path, rest: &[Segment]) -> (Path, usize) {
        match self {
            Wire::Relative(path) => (origin.join(path).normalize(), 0),
            Wire::Absolute(path) => (path.normalize(), 0),
            Wire::Branch { base, remaps } => {
                let base = base.base_path(origin);
                if let Some(Segment::Key(key)) = rest.first()
                    && let Some(wire) = remaps.get(key)
                {
                    let (target, used) = wire.target(&base, &rest[1..]);
                    return (target, used + 1);
                }
                (base, 0)
            }
            Wire::Each { base, .. } => (origin.join(base).normalize(), 0),
        }
    }

    fn rewire(&mut self, origin: &Path, sub_ports: &[String], target: &Path) {
        let Some((first, rest)) = sub_ports.split_first() else {
            *self = Wire::Relative(target.relative_to(origin));
            return;
        };
        let base = self.base_path(origin);
        if !matches!(self, Wire::Branch { .. }) {
            let plain = std::mem::replace(self, Wire::Relative(Path::root()));
            *self = Wire::Branch {
                base: Box::new(plain),
                remaps: IndexMap::new(),
            };
        }
        if let Wire::Branch { remaps, .. } = self {
            remaps
                .entry(first.clone())
                .or_insert_with(|| Wire::Relative(Path::root().child(first.clone())))
                .rewire(&base, rest, target);
        }
    }

    /// Absolute path of the store this wire is anchored at.
    fn base_path(&self, origin: &Path) -> Path {
        self.target(origin, &[]).0
    }

    /// Plain-data form for configuration dumps.
    pub fn to_value(&self) -> Value {
        match self {
            Wire::Relative(path) => Value::Text(path.to_string()),
            Wire::Absolute(path) => Value::from([("_absolute", Value::Text(path.to_string()))]),
            Wire::Branch { base, remaps } => {
                let mut map = ValueMap::new();
                map.insert("_path".into(), base.to_value());
                for (port, wire) in remaps {
                    map.insert(port.clone(), wire.to_value());
                }
                Value::Map(map)
            }
            Wire::Each { base, child } => Value::from([
                ("_each", Value::Text(base.to_string())),
                ("_child", child.to_value()),
            ]),
        }
    }
}

impl From<&str> for Wire {
    fn from(s: &str) -> Self {
        Wire::Relative(Path::parse(s))
    }
}

impl From<Path> for Wire {
    fn from(path: Path) -> Self {
        Wire::Relative(path)
    }
}

/// Port name to wire, for one unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Topology {
    ports: IndexMap<String, Wire>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`insert`](Topology::insert).
    pub fn wire(mut self, port: impl Into<String>, wire: impl Into<Wire>) -> Self {
        self.insert(port, wire);
        self
    }

    pub fn insert(&mut self, port: impl Into<String>, wire: impl Into<Wire>) {
        self.ports.insert(port.into(), wire.into());
    }

    pub fn get(&self, port: &str) -> Option<&Wire> {
        self.ports.get(port)
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Wire)> {
        self.ports.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Point `port` (a port name, then sub-ports) at the absolute `target`.
    ///
    /// Plain wires on the way become branch wires. Returns false when the
    /// top-level port is not wired.
    pub(crate) fn rewire(&mut self, origin: &Path, port: &[String], target: &Path) -> bool {
        let Some((first, rest)) = port.split_first() else {
            return false;
        };
        match self.ports.get_mut(first) {
            Some(wire) => {
                wire.rewire(origin, rest, target);
                true
            }
            None => false,
        }
    }

    /// Follow `segments` (a port name, then sub-ports) to an absolute path.
    ///
    /// Returns the path and the number of segments consumed.
    pub fn port_target(&self, origin: &Path, segments: &[Segment]) -> Option<(Path, usize)> {
        let key = segments.first()?.as_key()?;
        let wire = self.ports.get(key)?;
        let (target, used) = wire.target(origin, &segments[1..]);
        Some((target, used + 1))
    }

    pub fn to_value(&self) -> Value {
        Value::Map(
            self.ports
                .iter()
                .map(|(k, v)| (k.clone(), v.to_value()))
                .collect(),
        )
    }
}

impl<const N: usize> From<[(&str, &str); N]> for Topology {
    fn from(entries: [(&str, &str); N]) -> Self {
        entries
            .into_iter()
            .fold(Topology::new(), |topology, (port, path)| topology.wire(port, path))
    }
}

/// Schema of each match of a wildcard port.
fn item_schema(schema: &Schema) -> &Schema {
    match schema {
        Schema::Branch(branch) if branch.children.is_empty() => branch.each.as_deref().unwrap_or(schema),
        _ => schema,
    }
}

/// Port context carried through resolution for error reporting.
struct PortCtx<'a> {
    unit: &'a Path,
    port: &'a str,
}

// ============================================================================
// Declaration, views and projection
// ============================================================================

impl StateTree {
    /// Declare every port of a unit at its wired targets.
    pub(crate) fn declare_ports(&mut self, unit: StoreId) -> Result<()> {
        let unit_path = self.path_of(unit)?;
        let origin = self.origin_of(unit)?;
        let (ports, topology) = {
            let binding = self.binding(unit)?;
            (binding.ports.clone(), binding.topology.clone())
        };
        let Schema::Branch(ports) = ports else {
            return Err(Error::wiring(&unit_path, "ports schema must be a branch"));
        };
        for (port, schema) in &ports.children {
            let wire = topology
                .get(port)
                .ok_or_else(|| Error::wiring(&unit_path, format!("port '{port}' is not wired")))?;
            self.declare_wire(&origin, schema, wire)?;
        }
        Ok(())
    }

    fn declare_wire(&mut self, origin: &Path, schema: &Schema, wire: &Wire) -> Result<()> {
        match wire {
            Wire::Relative(_) | Wire::Absolute(_) => {
                let (target, _) = wire.target(origin, &[]);
                self.declare_at(&target, schema).map(|_| ())
            }
            Wire::Branch { base, remaps } => {
                let base = base.base_path(origin);
                let Schema::Branch(branch) = schema else {
                    return self.declare_at(&base, schema).map(|_| ());
                };
                let base_id = self.ensure_branch(&base)?;
                if let Some(each) = &branch.each {
                    self.declare_each(base_id, each)?;
                }
                for (key, child) in &branch.children {
                    match remaps.get(key) {
                        Some(remap) => self.declare_wire(&base, child, remap)?,
                        None => {
                            self.declare_at(&base.child(key.clone()), child)?;
                        }
                    }
                }
                Ok(())
            }
            Wire::Each { base, child } => {
                let base = origin.join(base).normalize();
                let base_id = self.ensure_branch(&base)?;
                let keys: Vec<String> = self.children(base_id)?.keys().cloned().collect();
                let item = item_schema(schema);
                for key in keys {
                    self.declare_wire(&base.child(key), item, child)?;
                }
                Ok(())
            }
        }
    }

    /// Build the view a unit reads: one entry per non-output port.
    pub fn view_unit(&self, unit: StoreId) -> Result<Value> {
        let unit_path = self.path_of(unit)?;
        let origin = self.origin_of(unit)?;
        let binding = self.binding(unit)?;
        let Schema::Branch(ports) = &binding.ports else {
            return Err(Error::wiring(&unit_path, "ports schema must be a branch"));
        };

        let mut view = ValueMap::new();
        for (port, schema) in &ports.children {
            if schema.is_output() {
                continue;
            }
            let wire = binding
                .topology
                .get(port)
                .ok_or_else(|| Error::wiring(&unit_path, format!("port '{port}' is not wired")))?;
            let ctx = PortCtx {
                unit: &unit_path,
                port,
            };
            view.insert(port.clone(), self.view_wire(&origin, schema, wire, &ctx)?);
        }
        trace!(unit = %unit_path, "built view");
        Ok(Value::Map(view))
    }

    fn view_wire(&self, origin: &Path, schema: &Schema, wire: &Wire, ctx: &PortCtx<'_>) -> Result<Value> {
        match wire {
            Wire::Relative(_) | Wire::Absolute(_) => {
                let (target, _) = wire.target(origin, &[]);
                let id = self.resolve(&target)?;
                Ok(self.view_node(id, schema))
            }
            Wire::Branch { base, remaps } => {
                let base = base.base_path(origin);
                match schema {
                    Schema::Branch(branch) if !branch.children.is_empty() => {
                        let mut view = ValueMap::new();
                        for (key, child) in &branch.children {
                            if child.is_output() {
                                continue;
                            }
                            let value = match remaps.get(key) {
                                Some(remap) => self.view_wire(&base, child, remap, ctx)?,
                                None => self.view_path(&base.child(key.clone()), child),
                            };
                            view.insert(key.clone(), value);
                        }
                        Ok(Value::Map(view))
                    }
                    _ => {
                        let id = self.resolve(&base)?;
                        Ok(self.view_node(id, schema))
                    }
                }
            }
            Wire::Each { base, child } => {
                let base = origin.join(base).normalize();
                let base_id = self.resolve(&base)?;
                let keys = self.children(base_id)?;
                if keys.is_empty() {
                    return Err(Error::EmptyWildcard {
                        unit: ctx.unit.clone(),
                        port: ctx.port.to_string(),
                        base,
                    });
                }
                let item = item_schema(schema);
                let mut view = ValueMap::new();
                for key in keys.keys() {
                    let value = self.view_wire(&base.child(key.clone()), item, child, ctx)?;
                    view.insert(key.clone(), value);
                }
                Ok(Value::Map(view))
            }
        }
    }

    fn view_path(&self, path: &Path, schema: &Schema) -> Value {
        match self.resolve(path) {
            Ok(id) => self.view_node(id, schema),
            Err(_) => absent_view(schema),
        }
    }

    fn view_node(&self, id: StoreId, schema: &Schema) -> Value {
        let Schema::Branch(branch) = schema else {
            return self.value_of(id);
        };
        let children = match self.node(id).map(|node| &node.kind) {
            Ok(NodeKind::Branch(b)) => &b.children,
            _ => return self.value_of(id),
        };
        if branch.children.is_empty() && branch.each.is_none() {
            return self.value_of(id);
        }

        let mut view = ValueMap::new();
        for (key, child_schema) in &branch.children {
            if child_schema.is_output() {
                continue;
            }
            let value = match children.get(key) {
                Some(child) => self.view_node(*child, child_schema),
                None => absent_view(child_schema),
            };
            view.insert(key.clone(), value);
        }
        if let Some(each) = &branch.each {
            for (key, child) in children {
                if !branch.children.contains_key(key) && self.has_state(*child) {
                    view.insert(key.clone(), self.view_node(*child, each));
                }
            }
        }
        Value::Map(view)
    }

    /// Route a unit's update onto absolute paths, one entry per target.
    ///
    /// Several ports wired to one store produce several entries, each merged
    /// in turn.
    pub fn project_unit(&self, unit: StoreId, update: Update) -> Result<Vec<(Path, Update)>> {
        let unit_path = self.path_of(unit)?;
        let origin = self.origin_of(unit)?;
        let binding = self.binding(unit)?;
        let Schema::Branch(ports) = &binding.ports else {
            return Err(Error::wiring(&unit_path, "ports schema must be a branch"));
        };

        let update = update
            .try_into_branch()
            .ok_or_else(|| Error::wiring(&unit_path, "unit update must be a branch of ports"))?;
        if !update.directives.is_empty() {
            return Err(Error::wiring(&unit_path, "directives must be addressed to a port"));
        }
        let mut writes = Vec::new();
        for (port, port_update) in update.children {
            let schema = ports
                .children
                .get(&port)
                .ok_or_else(|| Error::wiring(&unit_path, format!("update for unknown port '{port}'")))?;
            let wire = binding
                .topology
                .get(&port)
                .ok_or_else(|| Error::wiring(&unit_path, format!("port '{port}' is not wired")))?;
            project_wire(&origin, schema, wire, port_update, &mut writes)
                .map_err(|message| Error::wiring(&unit_path, format!("port '{port}' {message}")))?;
        }
        Ok(writes)
    }

    /// Merge projected writes in order. Writes whose target no longer
    /// resolves are skipped.
    pub fn apply_projected(&mut self, writes: Vec<(Path, Update)>) -> Result<()> {
        for (path, update) in writes {
            if update.is_empty() {
                continue;
            }
            match self.resolve(&path) {
                Ok(id) => self.apply_at(id, &update)?,
                Err(Error::PathError { reason, .. }) => {
                    warn!(%path, %reason, "skipping update for unresolvable path");
                }
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }
}

/// Errors carry the reason only; the caller names the unit and port.
fn project_wire(
    origin: &Path,
    schema: &Schema,
    wire: &Wire,
    update: Update,
    out: &mut Vec<(Path, Update)>,
) -> std::result::Result<(), &'static str> {
    match wire {
        Wire::Relative(_) | Wire::Absolute(_) => {
            let (target, _) = wire.target(origin, &[]);
            out.push((target, update));
        }
        Wire::Branch { base, remaps } => {
            let base = base.base_path(origin);
            let is_structured = matches!(schema, Schema::Branch(b) if !b.children.is_empty());
            if !is_structured || remaps.is_empty() {
                out.push((base, update));
                return Ok(());
            }
            let branch = update.try_into_branch().ok_or("expects a branch update")?;
            let mut passthrough = UpdateBranch {
                children: IndexMap::new(),
                directives: branch.directives,
            };
            for (key, child_update) in branch.children {
                match remaps.get(&key) {
                    Some(remap) => {
                        let child_schema = schema.child(&key).cloned().unwrap_or_default();
                        project_wire(&base, &child_schema, remap, child_update, out)?;
                    }
                    None => {
                        passthrough.children.insert(key, child_update);
                    }
                }
            }
            out.push((base, Update::Branch(passthrough)));
        }
        Wire::Each { base, child } => {
            let base = origin.join(base).normalize();
            let item = item_schema(schema);
            let branch = update.try_into_branch().ok_or("expects a branch update")?;
            for (key, child_update) in branch.children {
                project_wire(&base.child(key), item, child, child_update, out)?;
            }
            if !branch.directives.is_empty() {
                out.push((
                    base,
                    Update::Branch(UpdateBranch {
                        children: IndexMap::new(),
                        directives: branch.directives,
                    }),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_wire_resolves_from_origin() {
        let wire = Wire::relative("../boundary/mass");
        let (target, used) = wire.target(&Path::parse("agents/1/processes"), &[]);
        assert_eq!(target, Path::parse("agents/1/boundary/mass"));
        assert_eq!(used, 0);
    }

    #[test]
    fn remaps_consume_sub_ports() {
        let topology = Topology::new().wire(
            "boundary",
            Wire::branch("..").remap("external", "../fields"),
        );
        let origin = Path::parse("agents/1/processes");
        let segments = Path::parse("boundary/external/glucose");
        let (target, used) = topology.port_target(&origin, segments.segments()).unwrap();
        assert_eq!(target, Path::parse("agents/fields"));
        assert_eq!(used, 2);

        let segments = Path::parse("boundary/mass");
        let (target, used) = topology.port_target(&origin, segments.segments()).unwrap();
        assert_eq!(target, Path::parse("agents/1"));
        assert_eq!(used, 1);
    }

    #[test]
    fn projection_splits_remapped_ports() {
        let schema = Schema::branch([
            ("external", Schema::value(0.0)),
            ("internal", Schema::value(0.0)),
        ]);
        let wire = Wire::branch("cell").remap("external", "../env");
        let update = Update::empty().with("external", 1.0).with("internal", 2.0);
        let mut out = Vec::new();
        project_wire(&Path::root(), &schema, &wire, update, &mut out).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].0, Path::parse("env"));
        assert_eq!(out[1].0, Path::parse("cell"));
    }

    #[test]
    fn wildcard_projection_rejects_scalars() {
        let schema = Schema::each(Schema::branch([("m", Schema::value(0.0))]));
        let wire = Wire::each("agents");
        let mut out = Vec::new();
        let err = project_wire(&Path::root(), &schema, &wire, Update::from(5.0), &mut out);
        assert_eq!(err, Err("expects a branch update"));
        assert!(out.is_empty());
    }

    #[test]
    fn absolute_wire_ignores_origin() {
        let wire = Wire::absolute("environment/fields");
        let (target, _) = wire.target(&Path::parse("deep/inside"), &[]);
        assert_eq!(target, Path::parse("environment/fields"));
    }
}
