//! Units in the tree: creation, composite insertion and rewiring.

use indexmap::IndexMap;
use terrarium_foundation::Path;
use tracing::debug;

use super::{Blueprint, NodeKind, StateTree, StoreId, UnitBinding};
use crate::composite::{Composite, UnitSpec};
use crate::error::{Error, Result};
use crate::schema::{LeafSchema, Schema};
use crate::types::Value;
use crate::unit::Unit;

/// What a port is connected to.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectTarget {
    Path(Path),
    Store(StoreId),
}

impl From<&str> for ConnectTarget {
    fn from(s: &str) -> Self {
        ConnectTarget::Path(Path::parse(s))
    }
}

impl From<Path> for ConnectTarget {
    fn from(path: Path) -> Self {
        ConnectTarget::Path(path)
    }
}

impl From<StoreId> for ConnectTarget {
    fn from(id: StoreId) -> Self {
        ConnectTarget::Store(id)
    }
}

impl StateTree {
    /// Create a unit at `path` and declare its ports.
    pub fn create_unit(&mut self, path: impl Into<Path>, spec: UnitSpec) -> Result<StoreId> {
        let path = path.into().normalize();
        let id = self.graft_unit(&path, spec)?;
        if let Err(err) = self.declare_ports(id) {
            self.remove_subtree(id)?;
            return Err(err);
        }
        debug!(%path, "created unit");
        Ok(id)
    }

    fn graft_unit(&mut self, path: &Path, spec: UnitSpec) -> Result<StoreId> {
        let UnitSpec { unit, topology, flow } = spec;
        let ports = unit.ports_schema();
        let Schema::Branch(branch) = &ports else {
            return Err(Error::wiring(path, "ports schema must be a branch"));
        };
        if let Some(port) = branch.children.keys().find(|port| topology.get(port).is_none()) {
            return Err(Error::wiring(path, format!("port '{port}' is not wired")));
        }
        let binding = UnitBinding {
            name: unit.name().to_string(),
            kind: unit.kind(),
            parallel: unit.is_parallel(),
            ports,
            topology,
            flow,
            unit: Some(unit),
        };
        self.create_at(
            path,
            Blueprint::Unit {
                binding,
                overrides: LeafSchema::default(),
            },
        )
    }

    /// Graft a composite under `at`.
    ///
    /// Every unit path is checked before anything changes. Ports are
    /// declared once all units exist, then the composite's initial state is
    /// written over the declared defaults. A failure at any point leaves the
    /// tree as it was.
    pub fn insert(&mut self, composite: Composite, at: impl Into<Path>) -> Result<Vec<StoreId>> {
        let at = at.into().normalize();
        let (units, state) = composite.into_parts();
        for path in units.keys() {
            let full = at.join(path).normalize();
            if self.resolve(&full).is_ok() {
                return Err(Error::PathConflict(full));
            }
        }

        let checkpoint = self.checkpoint();
        match self.graft_composite(&at, units, state) {
            Ok(ids) => {
                self.touch_structure();
                debug!(at = %at, units = ids.len(), "inserted composite");
                Ok(ids)
            }
            Err(err) => {
                self.rollback(checkpoint)?;
                Err(err)
            }
        }
    }

    fn graft_composite(
        &mut self,
        at: &Path,
        units: IndexMap<Path, UnitSpec>,
        state: Value,
    ) -> Result<Vec<StoreId>> {
        let mut ids = Vec::with_capacity(units.len());
        for (path, spec) in units {
            ids.push(self.graft_unit(&at.join(&path).normalize(), spec)?);
        }
        for id in &ids {
            self.declare_ports(*id)?;
        }
        if matches!(&state, Value::Map(map) if !map.is_empty()) {
            self.set_value(at.clone(), state)?;
        }
        Ok(ids)
    }

    /// Rewire one port, or a sub-port when `port` has several segments.
    ///
    /// A path target is read from the unit's parent, or from the root when
    /// `absolute` is set. The stored wire is always relative to the unit's
    /// parent.
    pub fn connect(
        &mut self,
        unit: impl Into<Path>,
        port: impl Into<Path>,
        target: impl Into<ConnectTarget>,
        absolute: bool,
    ) -> Result<()> {
        let requested = unit.into();
        let id = self.resolve(&requested)?;
        if !matches!(self.node(id)?.kind, NodeKind::Unit(_)) {
            return Err(Error::NotAUnit(requested));
        }
        let unit_path = self.path_of(id)?;
        let origin = self.origin_of(id)?;

        let port = port.into();
        let keys: Vec<String> = match port.keys() {
            Some(keys) if !keys.is_empty() => keys.into_iter().map(str::to_string).collect(),
            _ => return Err(Error::wiring(&unit_path, format!("invalid port path '{port}'"))),
        };
        let port_schema = self
            .binding(id)?
            .ports
            .descend(&port)
            .cloned()
            .ok_or_else(|| Error::wiring(&unit_path, format!("unknown port '{port}'")))?;

        let target_path = match target.into() {
            ConnectTarget::Store(store) => {
                if !self.contains(store) {
                    return Err(Error::wiring(&unit_path, "target handle is stale or from another tree"));
                }
                self.path_of(store)?
            }
            ConnectTarget::Path(path) if absolute => path.normalize(),
            ConnectTarget::Path(path) => origin.join(&path).normalize(),
        };
        match self.resolve(&target_path) {
            Ok(target) => self
                .check_compatible(target, &port_schema)
                .map_err(|err| Error::wiring(&unit_path, err.to_string()))?,
            Err(Error::PathError { .. }) => {}
            Err(other) => return Err(other),
        }

        let binding = self.binding_mut(id)?;
        if !binding.topology.rewire(&origin, &keys, &target_path) {
            return Err(Error::wiring(&unit_path, format!("port '{}' is not wired", keys[0])));
        }
        self.declare_ports(id)?;
        self.touch_structure();
        debug!(unit = %unit_path, %port, target = %target_path, "rewired port");
        Ok(())
    }

    /// Binding of a unit node.
    pub fn binding(&self, id: StoreId) -> Result<&UnitBinding> {
        match &self.node(id)?.kind {
            NodeKind::Unit(binding) => Ok(binding),
            _ => Err(Error::NotAUnit(self.path_of(id)?)),
        }
    }

    fn binding_mut(&mut self, id: StoreId) -> Result<&mut UnitBinding> {
        let path = self.path_of(id)?;
        match &mut self.node_mut(id)?.kind {
            NodeKind::Unit(binding) => Ok(binding),
            _ => Err(Error::NotAUnit(path)),
        }
    }

    /// Take a unit out of its binding for computation.
    pub(crate) fn take_unit(&mut self, id: StoreId) -> Result<Unit> {
        let path = self.path_of(id)?;
        self.binding_mut(id)?
            .unit
            .take()
            .ok_or_else(|| Error::path(&path, "unit is already computing"))
    }

    /// Put a unit back after computation. A unit whose node has gone is dropped.
    pub(crate) fn restore_unit(&mut self, id: StoreId, unit: Unit) {
        if let Ok(binding) = self.binding_mut(id) {
            binding.unit = Some(unit);
        }
    }
}
