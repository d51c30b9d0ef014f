//! The tick scheduler.
//!
//! The [`Engine`] owns the tree for the duration of a run and advances it
//! through simulated time.
//!
//! # Tick
//!
//! ```text
//! plan      next = min(front + timestep) over processes, clipped to the boundary
//! views     one owned view per due unit, taken before anything computes
//! compute   parallel units on the rayon pool, the rest inline
//! merge     projected updates applied in registration order
//! clock     fronts and global time move to `next`
//! sync      unit registry and step graph re-derived after structural change
//! steps     derivers, then step layers, each layer merged before the next
//! emit      when `next` lands on the emission cadence
//! ```
//!
//! The steps pass that precedes a tick therefore runs right after the
//! previous tick's merge (the first one at construction), and emitted
//! snapshots always include derived state.
//!
//! # Determinism
//!
//! Registration order is depth-first tree order, with units that appear
//! later appended. Updates merge in that order whether or not they were
//! computed in parallel, so two engines built alike emit identical
//! sequences.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use rayon::prelude::*;
use terrarium_foundation::{Path, round_time};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::composite::Composite;
use crate::config::{EngineConfig, EngineContext};
use crate::dag::{DependencyGraph, GraphError};
use crate::emitter::Emitter;
use crate::error::{Error, Result};
use crate::store::{StateTree, StoreId};
use crate::types::{Update, Value};
use crate::unit::{Unit, UnitKind};

/// Scheduling record of one process.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Front {
    /// Time up to which the process's updates have been applied.
    pub time: f64,
    /// Timestep for the next advance, once computed.
    pub timestep: Option<f64>,
}

#[derive(Debug)]
struct UnitEntry {
    kind: UnitKind,
    path: Path,
    /// Only processes have a front.
    front: Option<Front>,
}

/// One unit's computation within a tick.
struct Job {
    id: StoreId,
    path: Path,
    timestep: f64,
    view: Value,
    unit: Unit,
    parallel: bool,
    outcome: Option<anyhow::Result<Update>>,
    elapsed: Duration,
}

impl Job {
    fn run(&mut self) {
        let start = Instant::now();
        self.outcome = Some(self.unit.compute(self.timestep, &self.view));
        self.elapsed = start.elapsed();
    }
}

/// Drives a [`StateTree`] through simulated time.
pub struct Engine {
    tree: StateTree,
    config: EngineConfig,
    emitter: Box<dyn Emitter>,
    units: IndexMap<StoreId, UnitEntry>,
    graph: DependencyGraph<StoreId>,
    global_time: f64,
    structure_seen: u64,
    steps_dirty: bool,
    profile: IndexMap<Path, Duration>,
    ended: bool,
}

impl Engine {
    /// Build a tree from `composite` and prepare it to run.
    pub fn new(composite: Composite, config: EngineConfig, context: EngineContext) -> Result<Self> {
        config.validate()?;
        let mut tree = StateTree::new(context.registry)
            .with_policy(config.schema_policy)
            .with_seed(config.seed);
        tree.insert(composite, Path::root())?;
        Self::from_tree(tree, config, context.emitter)
    }

    /// Run an existing tree.
    ///
    /// Applies `store_schema` overrides, registers every unit, runs the
    /// first steps pass and emits the initial snapshot.
    pub fn from_tree(mut tree: StateTree, config: EngineConfig, emitter: Box<dyn Emitter>) -> Result<Self> {
        config.validate()?;
        if let Some(overrides) = config.store_overrides()? {
            tree.apply_overrides(&overrides)?;
        }
        let global_time = round_time(config.initial_time, config.global_time_precision);
        let mut engine = Self {
            tree,
            config,
            emitter,
            units: IndexMap::new(),
            graph: DependencyGraph::new(),
            global_time,
            structure_seen: 0,
            steps_dirty: false,
            profile: IndexMap::new(),
            ended: false,
        };
        engine.sync()?;
        engine.run_steps()?;
        engine.emit()?;
        info!(
            units = engine.units.len(),
            steps = engine.graph.len(),
            time = engine.global_time,
            "engine ready"
        );
        Ok(engine)
    }

    pub fn global_time(&self) -> f64 {
        self.global_time
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tree(&self) -> &StateTree {
        &self.tree
    }

    /// Mutable access to the tree between runs. The next run starts with a
    /// steps pass and picks up any structural change.
    pub fn tree_mut(&mut self) -> &mut StateTree {
        self.steps_dirty = true;
        &mut self.tree
    }

    /// Plain value of the whole tree.
    pub fn state(&self) -> Value {
        self.tree.value_of(self.tree.root())
    }

    pub fn emitter(&self) -> &dyn Emitter {
        self.emitter.as_ref()
    }

    /// Fronts of every registered process, in registration order.
    pub fn front(&self) -> IndexMap<Path, Front> {
        self.units
            .values()
            .filter_map(|entry| entry.front.map(|front| (entry.path.clone(), front)))
            .collect()
    }

    /// Accumulated compute time per unit. Empty unless profiling.
    pub fn profile(&self) -> &IndexMap<Path, Duration> {
        &self.profile
    }

    /// Graft a composite while the engine is paused. New processes start at
    /// the current global time. On failure the tree, fronts and step graph
    /// are left as they were.
    pub fn insert(&mut self, composite: Composite, at: impl Into<Path>) -> Result<Vec<StoreId>> {
        if self.ended {
            return Err(Error::EngineEnded);
        }
        let checkpoint = self.tree.checkpoint();
        let inserted = self.tree.insert(composite, at).and_then(|ids| {
            self.sync()?;
            Ok(ids)
        });
        match inserted {
            Ok(ids) => {
                self.steps_dirty = true;
                Ok(ids)
            }
            Err(err) => {
                error!(%err, "insert failed, restoring the tree");
                self.tree.rollback(checkpoint)?;
                self.sync()?;
                Err(err)
            }
        }
    }

    /// Advance by `interval` without forcing lagging processes to the boundary.
    pub fn update(&mut self, interval: f64) -> Result<()> {
        self.run_for(interval, false)
    }

    /// Advance global time by `interval`.
    ///
    /// With `force_complete`, every process whose next advance would carry
    /// it past the boundary is run up to the boundary with a shortened
    /// timestep, so all fronts end at the boundary.
    #[instrument(skip(self), fields(from = self.global_time))]
    pub fn run_for(&mut self, interval: f64, force_complete: bool) -> Result<()> {
        if self.ended {
            return Err(Error::EngineEnded);
        }
        if !(interval.is_finite() && interval >= 0.0) {
            return Err(Error::InvalidConfig(format!("cannot run for {interval}")));
        }
        if self.steps_dirty {
            self.sync_if_changed()?;
            self.run_steps()?;
        }

        let boundary = self.round(self.global_time + interval);
        while self.global_time < boundary {
            self.tick(boundary, force_complete)?;
        }
        Ok(())
    }

    /// Flush and close the emitter and report the profile. Later runs fail
    /// with [`Error::EngineEnded`].
    pub fn end(&mut self) -> Result<()> {
        if self.ended {
            return Err(Error::EngineEnded);
        }
        self.ended = true;
        self.emitter.flush()?;
        self.emitter.close()?;
        if self.config.profile {
            let mut totals: Vec<_> = self.profile.iter().collect();
            totals.sort_by(|a, b| b.1.cmp(a.1));
            for (unit, elapsed) in totals {
                info!(%unit, ?elapsed, "profile");
            }
        }
        info!(time = self.global_time, "engine ended");
        Ok(())
    }

    // ========================================================================
    // Tick
    // ========================================================================

    #[instrument(skip(self), level = "debug", fields(time = self.global_time))]
    fn tick(&mut self, boundary: f64, force_complete: bool) -> Result<()> {
        let mut plan = Vec::new();
        let mut next = boundary;
        let processes: Vec<StoreId> = self
            .units
            .iter()
            .filter(|(_, entry)| entry.kind == UnitKind::Process)
            .map(|(id, _)| *id)
            .collect();
        for id in processes {
            let timestep = self.process_timestep(id)?;
            let front = self.front_of(id);
            let due_at = self.round(front + timestep);
            // below the clock's precision the front would never move
            if due_at <= front {
                error!(unit = %self.path_of(id), timestep, "timestep vanishes at clock precision");
                return Err(Error::InvalidTimestep {
                    unit: self.path_of(id),
                    timestep,
                });
            }
            next = next.min(due_at);
            plan.push((id, front, timestep, due_at));
        }

        let mut due = Vec::new();
        for (id, front, timestep, due_at) in plan {
            if due_at == next {
                due.push((id, timestep));
            } else if force_complete && next == boundary && front < boundary {
                due.push((id, boundary - front));
            }
        }
        trace!(next, due = due.len(), "planned tick");

        let results = self.compute(&due)?;
        self.merge(results)?;
        for (id, _) in &due {
            if let Some(Some(front)) = self.units.get_mut(id).map(|entry| entry.front.as_mut()) {
                front.time = next;
                front.timestep = None;
            }
        }
        self.global_time = next;
        if !due.is_empty() {
            self.steps_dirty = true;
        }

        self.sync_if_changed()?;
        if self.steps_dirty {
            self.run_steps()?;
        }
        if self.emits_at(next) {
            self.emit()?;
        }
        if self.config.progress_bar {
            info!(time = next, boundary, "progress");
        }
        Ok(())
    }

    /// Derivers, then steps layer by layer, until every step has run once.
    ///
    /// A structural change part way re-derives the graph; steps that already
    /// ran are not run again.
    #[instrument(skip(self), level = "debug", name = "steps")]
    fn run_steps(&mut self) -> Result<()> {
        self.steps_dirty = false;
        let mut done: HashSet<StoreId> = HashSet::new();
        'pass: loop {
            let layers = self
                .graph
                .get_execution_layers()
                .map_err(|err| self.graph_error(err))?;
            for layer in layers {
                let pending: Vec<(StoreId, f64)> = layer
                    .into_iter()
                    .filter(|id| !done.contains(id) && self.tree.contains(*id))
                    .map(|id| (id, 0.0))
                    .collect();
                if pending.is_empty() {
                    continue;
                }
                done.extend(pending.iter().map(|(id, _)| *id));
                let results = self.compute(&pending)?;
                self.merge(results)?;
                if self.sync_if_changed()? {
                    continue 'pass;
                }
            }
            break;
        }
        Ok(())
    }

    /// Compute every unit in `due`, in registration order.
    ///
    /// Views are all taken before any unit runs. On failure every unit is
    /// restored and nothing is returned for merging.
    fn compute(&mut self, due: &[(StoreId, f64)]) -> Result<Vec<(StoreId, Update)>> {
        if due.is_empty() {
            return Ok(Vec::new());
        }

        let mut views = Vec::with_capacity(due.len());
        for (id, timestep) in due {
            views.push((*id, *timestep, self.tree.view_unit(*id)?));
        }

        let mut jobs: Vec<Job> = Vec::with_capacity(views.len());
        for (id, timestep, view) in views {
            match self.tree.take_unit(id) {
                Ok(unit) => jobs.push(Job {
                    id,
                    path: self.path_of(id),
                    timestep,
                    view,
                    parallel: unit.is_parallel(),
                    unit,
                    outcome: None,
                    elapsed: Duration::ZERO,
                }),
                Err(err) => {
                    for job in jobs {
                        self.tree.restore_unit(job.id, job.unit);
                    }
                    return Err(err);
                }
            }
        }

        let (mut parallel, mut inline): (Vec<&mut Job>, Vec<&mut Job>) =
            jobs.iter_mut().partition(|job| job.parallel);
        if parallel.is_empty() {
            inline.iter_mut().for_each(|job| job.run());
        } else {
            rayon::join(
                || parallel.par_iter_mut().for_each(|job| job.run()),
                || inline.iter_mut().for_each(|job| job.run()),
            );
        }

        let mut results = Vec::with_capacity(jobs.len());
        let mut failure = None;
        for job in jobs {
            if self.config.profile {
                *self.profile.entry(job.path.clone()).or_default() += job.elapsed;
            }
            self.tree.restore_unit(job.id, job.unit);
            match job.outcome {
                Some(Ok(update)) => results.push((job.id, update)),
                Some(Err(source)) if failure.is_none() => {
                    error!(unit = %job.path, error = %source, "unit failed");
                    failure = Some(Error::UnitFailed {
                        unit: job.path,
                        source,
                    });
                }
                _ => {}
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(results),
        }
    }

    fn merge(&mut self, results: Vec<(StoreId, Update)>) -> Result<()> {
        for (id, update) in results {
            if !self.tree.contains(id) {
                warn!(unit = %self.path_of(id), "dropping update of a removed unit");
                continue;
            }
            let writes = self.tree.project_unit(id, update)?;
            self.tree.apply_projected(writes)?;
        }
        Ok(())
    }

    // ========================================================================
    // Registry
    // ========================================================================

    fn sync_if_changed(&mut self) -> Result<bool> {
        if self.tree.structure_version() == self.structure_seen {
            return Ok(false);
        }
        self.sync()?;
        Ok(true)
    }

    /// Re-derive the unit registry and step graph from the tree.
    fn sync(&mut self) -> Result<()> {
        let live = self.tree.units();
        let live_set: HashSet<StoreId> = live.iter().copied().collect();

        let dead: Vec<StoreId> = self
            .units
            .keys()
            .filter(|id| !live_set.contains(id))
            .copied()
            .collect();
        for id in dead {
            if let Some(entry) = self.units.shift_remove(&id) {
                debug!(unit = %entry.path, "unregistered unit");
            }
            if self.graph.contains(&id) {
                let removed = self.graph.remove(&id);
                trace!(count = removed.len(), "removed steps from graph");
            }
        }

        for id in live {
            let path = self.tree.path_of(id)?;
            match self.units.get_mut(&id) {
                Some(entry) => entry.path = path,
                None => {
                    let kind = self.tree.binding(id)?.kind();
                    let front = (kind == UnitKind::Process).then_some(Front {
                        time: self.global_time,
                        timestep: None,
                    });
                    debug!(unit = %path, kind = kind.as_str(), "registered unit");
                    self.units.insert(id, UnitEntry { kind, path, front });
                }
            }
        }

        let missing: Vec<(StoreId, UnitKind)> = self
            .units
            .iter()
            .filter(|(id, entry)| entry.kind != UnitKind::Process && !self.graph.contains(id))
            .map(|(id, entry)| (*id, entry.kind))
            .collect();
        for (id, kind) in missing {
            if kind == UnitKind::Deriver {
                self.graph.add_sequential(id);
                continue;
            }
            let origin = self.tree.origin_of(id)?;
            let mut dependencies = Vec::new();
            for dependency in self.tree.binding(id)?.flow() {
                let target = origin.join(dependency).normalize();
                let resolved = self
                    .tree
                    .resolve(&target)
                    .ok()
                    .filter(|dep| self.units.get(dep).is_some_and(|e| e.kind != UnitKind::Process));
                match resolved {
                    Some(dep) => dependencies.push(dep),
                    None => {
                        error!(step = %self.path_of(id), dependency = %target, "unresolved step dependency");
                        return Err(Error::MissingDependency {
                            step: self.path_of(id),
                            dependency: target,
                        });
                    }
                }
            }
            self.graph.add(id, dependencies);
        }

        self.structure_seen = self.tree.structure_version();
        Ok(())
    }

    fn graph_error(&self, err: GraphError<StoreId>) -> Error {
        match err {
            GraphError::Cycle { involved } => {
                let steps: Vec<Path> = involved.into_iter().map(|id| self.path_of(id)).collect();
                error!(?steps, "step graph has a cycle");
                Error::CycleDetected { steps }
            }
            GraphError::MissingDependency { node, dependency } => Error::MissingDependency {
                step: self.path_of(node),
                dependency: self.path_of(dependency),
            },
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn path_of(&self, id: StoreId) -> Path {
        match self.units.get(&id) {
            Some(entry) => entry.path.clone(),
            None => self.tree.path_of(id).unwrap_or_default(),
        }
    }

    fn front_of(&self, id: StoreId) -> f64 {
        self.units
            .get(&id)
            .and_then(|entry| entry.front)
            .map_or(self.global_time, |front| front.time)
    }

    /// Timestep of a process's next advance, computed once per advance.
    fn process_timestep(&mut self, id: StoreId) -> Result<f64> {
        if let Some(timestep) = self.units.get(&id).and_then(|e| e.front).and_then(|f| f.timestep) {
            return Ok(timestep);
        }
        let timestep = {
            let process = self
                .tree
                .binding(id)?
                .unit()
                .and_then(Unit::as_process)
                .ok_or_else(|| Error::NotAUnit(self.path_of(id)))?;
            if process.variable_timestep() {
                let view = self.tree.view_unit(id)?;
                process.calculate_timestep(&view)
            } else {
                process.timestep()
            }
        };
        if !(timestep.is_finite() && timestep > 0.0) {
            error!(unit = %self.path_of(id), timestep, "invalid timestep");
            return Err(Error::InvalidTimestep {
                unit: self.path_of(id),
                timestep,
            });
        }
        if let Some(Some(front)) = self.units.get_mut(&id).map(|entry| entry.front.as_mut()) {
            front.timestep = Some(timestep);
        }
        Ok(timestep)
    }

    fn round(&self, time: f64) -> f64 {
        round_time(time, self.config.global_time_precision)
    }

    fn emits_at(&self, time: f64) -> bool {
        match self.config.emit_step {
            None => true,
            Some(step) => {
                let steps = (time - self.config.initial_time) / step;
                (steps - steps.round()).abs() < 1e-9
            }
        }
    }

    fn emit(&mut self) -> Result<()> {
        let data = self.tree.emit_projection()?;
        trace!(time = self.global_time, "emit");
        self.emitter.emit(self.global_time, &data)?;
        Ok(())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("global_time", &self.global_time)
            .field("units", &self.units.len())
            .field("steps", &self.graph.len())
            .field("ended", &self.ended)
            .finish()
    }
}
