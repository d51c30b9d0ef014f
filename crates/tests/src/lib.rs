//! Integration test harness for Terrarium.
//!
//! Toy units small enough to reason about tick by tick, plus helpers for
//! building engines around them. The scenarios themselves live in
//! `tests/integration.rs`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail};
use terrarium_runtime::{
    AddEntry, Composite, Daughter, Directive, Division, Engine, EngineConfig, EngineContext,
    LeafSchema, MoveEntry, Process, Schema, Step, Update, Value,
};
use tracing_subscriber::{EnvFilter, fmt};

/// Initialize logging for a test run.
///
/// Use `RUST_LOG` to override the default filter. Safe to call from every
/// test; only the first call installs the subscriber.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,terrarium_runtime=info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_test_writer()
        .try_init();
}

/// Build an engine with the built-in registry and an in-memory emitter.
///
/// # Panics
///
/// Panics if the composite cannot be inserted or the first steps pass fails.
pub fn engine(composite: Composite, config: EngineConfig) -> Engine {
    init_logging();
    Engine::new(composite, config, EngineContext::new()).expect("engine construction failed")
}

/// Leaf that starts at `default` and appears in emitted snapshots.
pub fn emitted(default: impl Into<Value>) -> Schema {
    Schema::leaf(LeafSchema::new().with_default(default).with_emit(true))
}

/// Shared record of unit invocations, in invocation order.
pub type Log = Arc<Mutex<Vec<String>>>;

fn record(log: &Log, name: &str) -> anyhow::Result<()> {
    log.lock()
        .map_err(|_| anyhow!("invocation log poisoned"))?
        .push(name.to_string());
    Ok(())
}

/// Read a numeric port from a view.
pub fn number(view: &Value, port: &str) -> anyhow::Result<f64> {
    view.get(port)
        .and_then(Value::as_f64)
        .ok_or_else(|| anyhow!("port '{port}' is not a number in {view}"))
}

// ============================================================================
// Processes
// ============================================================================

/// Adds `rate * timestep` to its `count` port.
#[derive(Debug, Clone)]
pub struct Counter {
    pub timestep: f64,
    pub rate: f64,
    pub parallel: bool,
}

impl Counter {
    pub fn new(timestep: f64) -> Self {
        Self {
            timestep,
            rate: 1.0,
            parallel: false,
        }
    }

    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }
}

impl Process for Counter {
    fn name(&self) -> &str {
        "counter"
    }

    fn ports_schema(&self) -> Schema {
        Schema::branch([("count", emitted(0.0))])
    }

    fn next_update(&mut self, timestep: f64, _: &Value) -> anyhow::Result<Update> {
        Ok(Update::empty().with("count", self.rate * timestep))
    }

    fn timestep(&self) -> f64 {
        self.timestep
    }

    fn is_parallel(&self) -> bool {
        self.parallel
    }

    fn fork(&self) -> Box<dyn Process> {
        Box::new(self.clone())
    }
}

/// Sleeps for `delay`, then sets its `value` port. Always parallel.
#[derive(Debug, Clone)]
pub struct Sleeper {
    pub delay: Duration,
    pub value: f64,
}

impl Process for Sleeper {
    fn name(&self) -> &str {
        "sleeper"
    }

    fn ports_schema(&self) -> Schema {
        Schema::branch([("value", Schema::leaf(LeafSchema::new().with_default(0.0).with_updater("set")))])
    }

    fn next_update(&mut self, _: f64, _: &Value) -> anyhow::Result<Update> {
        std::thread::sleep(self.delay);
        Ok(Update::empty().with("value", self.value))
    }

    fn is_parallel(&self) -> bool {
        true
    }

    fn fork(&self) -> Box<dyn Process> {
        Box::new(self.clone())
    }
}

/// Process that only logs its invocations. Its `var` port is never written.
#[derive(Debug, Clone)]
pub struct RecordingProcess {
    pub name: String,
    pub timestep: f64,
    pub log: Log,
}

impl Process for RecordingProcess {
    fn name(&self) -> &str {
        &self.name
    }

    fn ports_schema(&self) -> Schema {
        Schema::branch([("var", Schema::value(0))])
    }

    fn next_update(&mut self, _: f64, _: &Value) -> anyhow::Result<Update> {
        record(&self.log, &self.name)?;
        Ok(Update::empty())
    }

    fn timestep(&self) -> f64 {
        self.timestep
    }

    fn fork(&self) -> Box<dyn Process> {
        Box::new(self.clone())
    }
}

/// Step or deriver that only logs its invocations.
#[derive(Debug, Clone)]
pub struct RecordingStep {
    pub name: String,
    pub log: Log,
}

impl Step for RecordingStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn ports_schema(&self) -> Schema {
        Schema::branch([("var", Schema::value(0))])
    }

    fn next_update(&mut self, _: &Value) -> anyhow::Result<Update> {
        record(&self.log, &self.name)?;
        Ok(Update::empty())
    }

    fn fork(&self) -> Box<dyn Step> {
        Box::new(self.clone())
    }
}

/// Agent process: grows `mass` linearly and divides its agent once the
/// mass reaches `threshold`.
///
/// Ports: `id` (the agent's own key), `mass`, and `agents`, the branch
/// holding the agent, which receives the divide directive.
#[derive(Debug, Clone)]
pub struct Grower {
    pub rate: f64,
    pub threshold: f64,
}

impl Process for Grower {
    fn name(&self) -> &str {
        "grower"
    }

    fn ports_schema(&self) -> Schema {
        Schema::branch([
            ("id", Schema::leaf(LeafSchema::new().with_updater("set"))),
            (
                "mass",
                Schema::leaf(
                    LeafSchema::new()
                        .with_default(1.0)
                        .with_divider("split")
                        .with_emit(true),
                ),
            ),
            ("agents", Schema::any().output()),
        ])
    }

    fn next_update(&mut self, timestep: f64, view: &Value) -> anyhow::Result<Update> {
        let mass = number(view, "mass")?;
        if mass < self.threshold {
            return Ok(Update::empty().with("mass", self.rate * timestep));
        }
        let Some(id) = view.get("id").and_then(Value::as_str) else {
            bail!("agent id missing from {view}");
        };
        let daughters = ["0", "1"].map(|suffix| {
            let key = format!("{id}{suffix}");
            Daughter::new(key.clone()).with_state(Value::from([("id", key)]))
        });
        let division = Division::new(id, daughters);
        Ok(Update::empty().with("agents", Update::empty().directive(Directive::Divide(division))))
    }

    fn fork(&self) -> Box<dyn Process> {
        Box::new(self.clone())
    }
}

/// Composite for one dividing agent under `agents/<id>`.
pub fn grower_agent(id: &str, grower: Grower) -> Composite {
    Composite::new()
        .with_process(
            format!("agents/{id}/grow").as_str(),
            grower,
            [("id", "id"), ("mass", "mass"), ("agents", "..")],
        )
        .with_state(Value::from([(
            "agents",
            Value::from([(id, Value::from([("id", id)]))]),
        )]))
}

/// Replaces every child of its `agents` port with a freshly numbered one.
#[derive(Debug, Clone, Default)]
pub struct Turnover {
    next: usize,
}

impl Process for Turnover {
    fn name(&self) -> &str {
        "turnover"
    }

    fn ports_schema(&self) -> Schema {
        Schema::branch([("agents", Schema::any())])
    }

    fn next_update(&mut self, _: f64, view: &Value) -> anyhow::Result<Update> {
        let existing: Vec<String> = view
            .get("agents")
            .and_then(Value::as_map)
            .map(|agents| agents.keys().cloned().collect())
            .unwrap_or_default();
        let key = format!("agent{}", self.next);
        self.next += 1;
        let agents = Update::empty()
            .directive(Directive::Delete(existing))
            .directive(Directive::Add(vec![AddEntry::new(key, Value::from([("x", 1.0)]))]));
        Ok(Update::empty().with("agents", agents))
    }

    fn fork(&self) -> Box<dyn Process> {
        Box::new(self.clone())
    }
}

/// Rotates the children of three stores: `one` into `two`, `two` into
/// `three`, `three` into `one`.
///
/// Move targets are relative to each port's store, so the three stores are
/// expected to be siblings named by `stores`.
#[derive(Debug, Clone)]
pub struct Mover {
    pub timestep: f64,
    pub stores: [String; 3],
}

impl Process for Mover {
    fn name(&self) -> &str {
        "mover"
    }

    fn ports_schema(&self) -> Schema {
        Schema::branch([("one", Schema::any()), ("two", Schema::any()), ("three", Schema::any())])
    }

    fn next_update(&mut self, _: f64, view: &Value) -> anyhow::Result<Update> {
        let mut update = Update::empty();
        for (index, port) in ["one", "two", "three"].into_iter().enumerate() {
            let target = format!("../{}", self.stores[(index + 1) % 3]);
            let entries: Vec<MoveEntry> = view
                .get(port)
                .and_then(Value::as_map)
                .map(|agents| {
                    agents
                        .keys()
                        .map(|key| MoveEntry::new(key.as_str(), target.as_str()))
                        .collect()
                })
                .unwrap_or_default();
            if !entries.is_empty() {
                update = update.with(port, Update::empty().directive(Directive::Move(entries)));
            }
        }
        Ok(update)
    }

    fn timestep(&self) -> f64 {
        self.timestep
    }

    fn fork(&self) -> Box<dyn Process> {
        Box::new(self.clone())
    }
}

/// Writes one unit through each of three ports, typically wired to one store.
#[derive(Debug, Clone, Default)]
pub struct ThreePorts;

impl Process for ThreePorts {
    fn name(&self) -> &str {
        "three_ports"
    }

    fn ports_schema(&self) -> Schema {
        Schema::branch([("a", emitted(0.0)), ("b", emitted(0.0)), ("c", emitted(0.0))])
    }

    fn next_update(&mut self, _: f64, _: &Value) -> anyhow::Result<Update> {
        Ok(Update::empty().with("a", 1.0).with("b", 1.0).with("c", 1.0))
    }

    fn fork(&self) -> Box<dyn Process> {
        Box::new(self.clone())
    }
}

/// Copies `input` into the write-only port `out`, failing if `out` shows up
/// in its view.
#[derive(Debug, Clone, Default)]
pub struct Relay;

impl Process for Relay {
    fn name(&self) -> &str {
        "relay"
    }

    fn ports_schema(&self) -> Schema {
        Schema::branch([
            ("input", Schema::value(2.0)),
            ("out", Schema::leaf(LeafSchema::new().with_default(0.0).with_updater("set")).output()),
        ])
    }

    fn next_update(&mut self, _: f64, view: &Value) -> anyhow::Result<Update> {
        if view.get("out").is_some() {
            bail!("output port leaked into the view");
        }
        Ok(Update::empty().with("out", number(view, "input")?))
    }

    fn fork(&self) -> Box<dyn Process> {
        Box::new(self.clone())
    }
}

/// Process whose timestep is read from its `dt` port before every advance.
#[derive(Debug, Clone, Default)]
pub struct Adaptive;

impl Process for Adaptive {
    fn name(&self) -> &str {
        "adaptive"
    }

    fn ports_schema(&self) -> Schema {
        Schema::branch([("dt", Schema::value(1.0)), ("elapsed", emitted(0.0))])
    }

    fn next_update(&mut self, timestep: f64, _: &Value) -> anyhow::Result<Update> {
        Ok(Update::empty().with("elapsed", timestep))
    }

    fn variable_timestep(&self) -> bool {
        true
    }

    fn calculate_timestep(&self, view: &Value) -> f64 {
        number(view, "dt").unwrap_or(f64::NAN)
    }

    fn fork(&self) -> Box<dyn Process> {
        Box::new(self.clone())
    }
}

/// Writes one number to its wildcard `cells` port instead of one update per
/// matched child.
#[derive(Debug, Clone, Default)]
pub struct FlatCensus;

impl Process for FlatCensus {
    fn name(&self) -> &str {
        "flat_census"
    }

    fn ports_schema(&self) -> Schema {
        Schema::branch([("cells", Schema::each(Schema::branch([("m", Schema::leaf(LeafSchema::new()))])))])
    }

    fn next_update(&mut self, _: f64, _: &Value) -> anyhow::Result<Update> {
        Ok(Update::empty().with("cells", 5.0))
    }

    fn fork(&self) -> Box<dyn Process> {
        Box::new(self.clone())
    }
}

/// Process that fails on every call.
#[derive(Debug, Clone, Default)]
pub struct Faulty;

impl Process for Faulty {
    fn name(&self) -> &str {
        "faulty"
    }

    fn ports_schema(&self) -> Schema {
        Schema::branch([("x", Schema::value(0.0))])
    }

    fn next_update(&mut self, _: f64, _: &Value) -> anyhow::Result<Update> {
        bail!("faulty process always fails")
    }

    fn fork(&self) -> Box<dyn Process> {
        Box::new(self.clone())
    }
}

// ============================================================================
// Steps
// ============================================================================

/// Sums the `mass` of every child reached through a wildcard port into
/// `total`.
#[derive(Debug, Clone, Default)]
pub struct MassTotal;

impl Step for MassTotal {
    fn name(&self) -> &str {
        "mass_total"
    }

    fn ports_schema(&self) -> Schema {
        Schema::branch([
            ("cells", Schema::each(Schema::branch([("mass", Schema::leaf(LeafSchema::new()))]))),
            (
                "total",
                Schema::leaf(
                    LeafSchema::new()
                        .with_default(0.0)
                        .with_updater("set")
                        .with_emit(true),
                ),
            ),
        ])
    }

    fn next_update(&mut self, view: &Value) -> anyhow::Result<Update> {
        let cells = view
            .get("cells")
            .and_then(Value::as_map)
            .ok_or_else(|| anyhow!("cells port is not a map"))?;
        let total: f64 = cells
            .values()
            .filter_map(|cell| cell.get("mass").and_then(Value::as_f64))
            .sum();
        Ok(Update::empty().with("total", total))
    }

    fn fork(&self) -> Box<dyn Step> {
        Box::new(self.clone())
    }
}
