//! Composites: units, their wiring and initial state, ready to insert.
//!
//! A composite is what a composer produces. Unit paths, topologies and flow
//! dependencies are all relative, so a composite can be nested under any
//! prefix and merged with others before it is inserted into a tree.

use indexmap::IndexMap;
use terrarium_foundation::Path;

use crate::topology::Topology;
use crate::types::{Value, ValueMap};
use crate::unit::{Process, Step, Unit};

/// One unit with its wiring.
#[derive(Debug)]
pub struct UnitSpec {
    pub unit: Unit,
    /// Port wires, relative to the unit's parent.
    pub topology: Topology,
    /// Steps that must run before this one, relative to the unit's parent.
    pub flow: Vec<Path>,
}

impl UnitSpec {
    pub fn new(unit: Unit, topology: impl Into<Topology>) -> Self {
        Self {
            unit,
            topology: topology.into(),
            flow: Vec::new(),
        }
    }

    /// Run after the step at `dependency`.
    pub fn after(mut self, dependency: impl Into<Path>) -> Self {
        self.flow.push(dependency.into());
        self
    }
}

/// Units plus initial state, keyed by path relative to the insertion point.
#[derive(Debug, Default)]
pub struct Composite {
    units: IndexMap<Path, UnitSpec>,
    initial_state: Value,
}

impl Composite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_unit(mut self, path: impl Into<Path>, spec: UnitSpec) -> Self {
        self.units.insert(path.into(), spec);
        self
    }

    pub fn with_process(
        self,
        path: impl Into<Path>,
        process: impl Process + 'static,
        topology: impl Into<Topology>,
    ) -> Self {
        self.with_unit(path, UnitSpec::new(Unit::process(process), topology))
    }

    /// Add a step that runs after every path in `flow`.
    pub fn with_step<P: Into<Path>>(
        self,
        path: impl Into<Path>,
        step: impl Step + 'static,
        topology: impl Into<Topology>,
        flow: impl IntoIterator<Item = P>,
    ) -> Self {
        let mut spec = UnitSpec::new(Unit::step(step), topology);
        spec.flow = flow.into_iter().map(Into::into).collect();
        self.with_unit(path, spec)
    }

    pub fn with_deriver(
        self,
        path: impl Into<Path>,
        step: impl Step + 'static,
        topology: impl Into<Topology>,
    ) -> Self {
        self.with_unit(path, UnitSpec::new(Unit::deriver(step), topology))
    }

    /// Deep-merge `state` into the initial state.
    pub fn with_state(mut self, state: impl Into<Value>) -> Self {
        let state = state.into();
        self.initial_state = merge_state(std::mem::take(&mut self.initial_state), state);
        self
    }

    pub fn units(&self) -> impl Iterator<Item = (&Path, &UnitSpec)> {
        self.units.iter()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn initial_state(&self) -> &Value {
        &self.initial_state
    }

    /// Combine with `other`. Units at the same path are replaced by `other`'s.
    pub fn merge(mut self, other: Composite) -> Self {
        self.units.extend(other.units);
        self.initial_state = merge_state(self.initial_state, other.initial_state);
        self
    }

    /// The same composite with every unit path and the state moved under `prefix`.
    pub fn nest(self, prefix: impl Into<Path>) -> Self {
        let prefix = prefix.into();
        let units = self
            .units
            .into_iter()
            .map(|(path, spec)| (prefix.join(&path), spec))
            .collect();
        let initial_state = match prefix.keys() {
            Some(keys) if !self.initial_state.is_null() => keys
                .into_iter()
                .rev()
                .fold(self.initial_state, |state, key| {
                    Value::Map(ValueMap::from([(key.to_string(), state)]))
                }),
            _ => self.initial_state,
        };
        Self { units, initial_state }
    }

    pub(crate) fn into_parts(self) -> (IndexMap<Path, UnitSpec>, Value) {
        (self.units, self.initial_state)
    }
}

fn merge_state(base: Value, incoming: Value) -> Value {
    match (base, incoming) {
        (Value::Map(mut base), Value::Map(incoming)) => {
            for (key, value) in incoming {
                match base.get_mut(&key) {
                    Some(existing) => *existing = merge_state(std::mem::take(existing), value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
            Value::Map(base)
        }
        (base, Value::Null) => base,
        (_, incoming) => incoming,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nest_prefixes_paths_and_state() {
        let composite = Composite::new()
            .with_state(Value::from([("mass", Value::from(1.0))]))
            .nest("agents/1");
        assert_eq!(
            composite.initial_state().get_path(&Path::parse("agents/1/mass")),
            Some(&Value::Float(1.0))
        );
    }

    #[test]
    fn with_state_merges_deeply() {
        let composite = Composite::new()
            .with_state(Value::from([("a", Value::from([("x", Value::from(1))]))]))
            .with_state(Value::from([("a", Value::from([("y", Value::from(2))]))]));
        let a = composite.initial_state().get("a").unwrap();
        assert_eq!(a.get("x"), Some(&Value::Int(1)));
        assert_eq!(a.get("y"), Some(&Value::Int(2)));
    }
}
