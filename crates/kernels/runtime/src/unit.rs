//! Schedulable units: processes, steps and derivers.
//!
//! Units are written outside the core. The engine only needs their ports
//! schema and the ability to turn a view of those ports into an [`Update`].
//!
//! - A [`Process`] advances on its own timestep. It is due whenever its
//!   front plus its timestep is the earliest pending time.
//! - A [`Step`] has no timestep. Steps re-run after every tick in dependency
//!   order, so they always see post-merge state.
//! - A deriver is a step that runs ahead of every other step, in
//!   registration order.
//!
//! Units are `Send` so that those flagged parallel can compute on the rayon
//! pool. The tree is never shared with a computing unit; it only receives an
//! owned view.

use crate::schema::Schema;
use crate::types::{Update, Value};

/// A unit advancing on its own timestep.
pub trait Process: Send {
    /// Name used in logs and profiles.
    fn name(&self) -> &str;

    /// Shape of every port. Must be a branch keyed by port name.
    fn ports_schema(&self) -> Schema;

    /// Compute the change over `timestep` given the current view of the ports.
    fn next_update(&mut self, timestep: f64, view: &Value) -> anyhow::Result<Update>;

    /// Nominal timestep.
    fn timestep(&self) -> f64 {
        1.0
    }

    /// Whether [`calculate_timestep`](Process::calculate_timestep) depends on
    /// state. When false the engine never builds a view just to ask.
    fn variable_timestep(&self) -> bool {
        false
    }

    /// Timestep to use for the next advance.
    fn calculate_timestep(&self, view: &Value) -> f64 {
        let _ = view;
        self.timestep()
    }

    /// Compute on the rayon pool instead of the scheduling thread.
    fn is_parallel(&self) -> bool {
        false
    }

    /// Fresh instance with the same parameters, used when a subtree divides.
    fn fork(&self) -> Box<dyn Process>;
}

/// A unit re-run after every tick in dependency order.
pub trait Step: Send {
    fn name(&self) -> &str;

    fn ports_schema(&self) -> Schema;

    fn next_update(&mut self, view: &Value) -> anyhow::Result<Update>;

    fn is_parallel(&self) -> bool {
        false
    }

    fn fork(&self) -> Box<dyn Step>;
}

/// Which scheduling discipline a unit follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitKind {
    Process,
    Step,
    Deriver,
}

impl UnitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitKind::Process => "process",
            UnitKind::Step => "step",
            UnitKind::Deriver => "deriver",
        }
    }
}

/// Closed set of unit variants.
pub enum Unit {
    Process(Box<dyn Process>),
    Step(Box<dyn Step>),
    /// Step that runs before every other step.
    Deriver(Box<dyn Step>),
}

impl Unit {
    pub fn process(process: impl Process + 'static) -> Self {
        Unit::Process(Box::new(process))
    }

    pub fn step(step: impl Step + 'static) -> Self {
        Unit::Step(Box::new(step))
    }

    pub fn deriver(step: impl Step + 'static) -> Self {
        Unit::Deriver(Box::new(step))
    }

    pub fn kind(&self) -> UnitKind {
        match self {
            Unit::Process(_) => UnitKind::Process,
            Unit::Step(_) => UnitKind::Step,
            Unit::Deriver(_) => UnitKind::Deriver,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Unit::Process(p) => p.name(),
            Unit::Step(s) | Unit::Deriver(s) => s.name(),
        }
    }

    pub fn ports_schema(&self) -> Schema {
        match self {
            Unit::Process(p) => p.ports_schema(),
            Unit::Step(s) | Unit::Deriver(s) => s.ports_schema(),
        }
    }

    pub fn is_parallel(&self) -> bool {
        match self {
            Unit::Process(p) => p.is_parallel(),
            Unit::Step(s) | Unit::Deriver(s) => s.is_parallel(),
        }
    }

    pub fn as_process(&self) -> Option<&dyn Process> {
        match self {
            Unit::Process(p) => Some(p.as_ref()),
            _ => None,
        }
    }

    pub fn fork(&self) -> Unit {
        match self {
            Unit::Process(p) => Unit::Process(p.fork()),
            Unit::Step(s) => Unit::Step(s.fork()),
            Unit::Deriver(s) => Unit::Deriver(s.fork()),
        }
    }

    /// Run the unit. `timestep` is ignored by steps.
    pub fn compute(&mut self, timestep: f64, view: &Value) -> anyhow::Result<Update> {
        match self {
            Unit::Process(p) => p.next_update(timestep, view),
            Unit::Step(s) | Unit::Deriver(s) => s.next_update(view),
        }
    }
}

impl std::fmt::Debug for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unit")
            .field("kind", &self.kind())
            .field("name", &self.name())
            .finish()
    }
}
