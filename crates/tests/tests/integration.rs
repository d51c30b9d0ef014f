//! Integration tests for end-to-end Terrarium execution.
//!
//! These tests verify the full pipeline:
//! Compose units → Build engine → Run → Inspect tree and emitted history

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use terrarium_runtime::{
    Composite, EngineConfig, EngineContext, Engine, Error, JsonEmitter, Path, Topology, Value,
    Wire, read_history,
};
use terrarium_tests::{
    Adaptive, Counter, Faulty, FlatCensus, Grower, Log, MassTotal, Mover, RecordingProcess,
    RecordingStep, Relay, Sleeper, ThreePorts, Turnover, engine, grower_agent, init_logging,
};

fn v(json: serde_json::Value) -> Value {
    Value::from(json)
}

fn config(json: serde_json::Value) -> EngineConfig {
    EngineConfig::from_json(&json.to_string()).expect("valid config")
}

fn front_time(engine: &Engine, unit: &str) -> f64 {
    engine.front()[&Path::parse(unit)].time
}

fn value(engine: &Engine, path: &str) -> Value {
    engine.tree().get_value(path).expect("path resolves")
}

fn emitted_at(engine: &Engine, time: f64) -> Value {
    engine
        .emitter()
        .get_data()
        .into_iter()
        .find(|(t, _)| *t == time)
        .map(|(_, data)| data)
        .unwrap_or_else(|| panic!("nothing emitted at {time}"))
}

fn census() -> Topology {
    Topology::new()
        .wire("cells", Wire::each("agents"))
        .wire("total", "total")
}

// ============================================================================
// Scheduling
// ============================================================================

/// Processes on incommensurate timesteps advance independently; the final
/// forced run brings both to the boundary.
#[test]
fn test_timescales_with_force_complete() {
    let composite = Composite::new()
        .with_process("fast", Counter::new(0.75), [("count", "fast_count")])
        .with_process("slow", Counter::new(1.25), [("count", "slow_count")]);
    let mut engine = engine(composite, EngineConfig::default());

    for t in 1..=10 {
        let time = t as f64;
        engine.run_for(1.0, t == 10).unwrap();
        assert_eq!(engine.global_time(), time);
        if t < 10 {
            assert_eq!(front_time(&engine, "fast"), (time / 0.75).floor() * 0.75);
            assert_eq!(front_time(&engine, "slow"), (time / 1.25).floor() * 1.25);
        }
    }

    assert_eq!(front_time(&engine, "fast"), 10.0);
    assert_eq!(front_time(&engine, "slow"), 10.0);
    assert_eq!(value(&engine, "fast_count"), Value::Float(10.0));
    assert_eq!(value(&engine, "slow_count"), Value::Float(10.0));
}

/// Derivers run first, then steps by dependency layer, after every tick in
/// which a process ran.
#[test]
fn test_runtime_order() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let process = |name: &str, timestep: f64| RecordingProcess {
        name: name.to_string(),
        timestep,
        log: log.clone(),
    };
    let step = |name: &str| RecordingStep {
        name: name.to_string(),
        log: log.clone(),
    };
    let var = [("var", "store/var")];

    let composite = Composite::new()
        .with_process("process1", process("process1", 1.0), var)
        .with_process("process2", process("process2", 2.0), var)
        .with_deriver("deriver", step("deriver"), var)
        .with_step("step1", step("step1"), var, Vec::<&str>::new())
        .with_step("step2", step("step2"), var, ["step1"])
        .with_step("step3", step("step3"), var, ["step1"]);
    let mut engine = engine(composite, EngineConfig::default());
    engine.update(4.0).unwrap();

    let steps = ["deriver", "step1", "step2", "step3"];
    let mut expected: Vec<&str> = steps.to_vec();
    for t in 1..=4 {
        expected.push("process1");
        if t % 2 == 0 {
            expected.push("process2");
        }
        expected.extend(steps);
    }
    assert_eq!(*log.lock().unwrap(), expected);
}

#[test]
fn test_float_timesteps_are_rounded() {
    let composite = Composite::new().with_process("p", Counter::new(0.1), [("count", "count")]);
    let mut engine = engine(composite, config(json!({"global_time_precision": 5})));
    engine.update(1.0).unwrap();

    assert_eq!(engine.global_time(), 1.0);
    assert_eq!(front_time(&engine, "p"), 1.0);
    let times: Vec<f64> = engine.emitter().get_data().iter().map(|(t, _)| *t).collect();
    let expected: Vec<f64> = (0..=10).map(|k| k as f64 / 10.0).collect();
    assert_eq!(times, expected);
}

#[test]
fn test_variable_timestep_is_recomputed() {
    let composite = Composite::new()
        .with_process("p", Adaptive, [("dt", "dt"), ("elapsed", "elapsed")])
        .with_state(v(json!({"dt": 0.5})));
    let mut engine = engine(composite, EngineConfig::default());

    engine.update(2.0).unwrap();
    assert_eq!(front_time(&engine, "p"), 2.0);
    assert_eq!(engine.emitter().get_data().len(), 5);

    engine.tree_mut().set_value("dt", 1.0).unwrap();
    engine.update(2.0).unwrap();
    assert_eq!(front_time(&engine, "p"), 4.0);
    assert_eq!(engine.emitter().get_data().len(), 7);
    assert_eq!(value(&engine, "elapsed"), Value::Float(4.0));
}

#[test]
fn test_non_positive_timestep_is_rejected() {
    let composite = Composite::new()
        .with_process("p", Adaptive, [("dt", "dt"), ("elapsed", "elapsed")])
        .with_state(v(json!({"dt": 0.0})));
    let mut engine = engine(composite, EngineConfig::default());
    let err = engine.update(1.0).unwrap_err();
    assert!(matches!(err, Error::InvalidTimestep { timestep, .. } if timestep == 0.0));
}

/// A timestep that rounds away at the clock's precision would never move
/// the front.
#[test]
fn test_timestep_below_clock_precision_is_rejected() {
    let composite = Composite::new().with_process("p", Counter::new(0.001), [("count", "count")]);
    let mut engine = engine(composite, config(json!({"global_time_precision": 2})));

    let err = engine.update(1.0).unwrap_err();
    assert!(matches!(err, Error::InvalidTimestep { timestep, .. } if timestep == 0.001));
    assert_eq!(engine.global_time(), 0.0);
    assert_eq!(front_time(&engine, "p"), 0.0);
}

#[test]
fn test_emit_step_thins_the_history() {
    let composite = Composite::new().with_process("p", Counter::new(1.0), [("count", "count")]);
    let mut engine = engine(composite, config(json!({"emit_step": 2.0})));
    engine.update(5.0).unwrap();
    let times: Vec<f64> = engine.emitter().get_data().iter().map(|(t, _)| *t).collect();
    assert_eq!(times, vec![0.0, 2.0, 4.0]);
}

#[test]
fn test_inserted_units_start_at_current_time() {
    let composite = Composite::new().with_process("early", Counter::new(1.0), [("count", "early_count")]);
    let mut engine = engine(composite, EngineConfig::default());
    engine.update(2.0).unwrap();

    engine
        .insert(
            Composite::new().with_process("late", Counter::new(1.0), [("count", "late_count")]),
            "",
        )
        .unwrap();
    assert_eq!(front_time(&engine, "late"), 2.0);

    engine.update(2.0).unwrap();
    assert_eq!(value(&engine, "early_count"), Value::Float(4.0));
    assert_eq!(value(&engine, "late_count"), Value::Float(2.0));
}

/// A failed insert leaves no trace: no units, no stores, no fronts.
#[test]
fn test_failed_insert_changes_nothing() {
    let composite = Composite::new().with_process("early", Counter::new(1.0), [("count", "count")]);
    let mut engine = engine(composite, EngineConfig::default());
    engine.update(1.0).unwrap();
    let state = engine.state();

    // `input` declares a default of 2.0 on `count`, which already defaults to 0.0
    let clashing = Composite::new()
        .with_process("ok_unit", Counter::new(1.0), [("count", "fresh/count")])
        .with_process("clash", Relay, [("input", "count"), ("out", "relay_out")]);
    let err = engine.insert(clashing, "").unwrap_err();
    assert!(matches!(err, Error::SchemaConflict { .. }));

    assert_eq!(engine.state(), state);
    assert!(engine.tree().get("ok_unit").is_err());
    assert!(engine.tree().get("fresh").is_err());
    let fronts: Vec<Path> = engine.front().into_keys().collect();
    assert_eq!(fronts, vec![Path::parse("early")]);

    engine.update(1.0).unwrap();
    assert_eq!(engine.front().len(), 1);
    assert_eq!(value(&engine, "count"), Value::Float(2.0));
}

// ============================================================================
// Ports and merging
// ============================================================================

#[test]
fn test_ports_sharing_a_store_both_merge() {
    let ports = [("a", "shared/x"), ("b", "shared/x"), ("c", "shared/x")];
    let composite = Composite::new().with_process("p", ThreePorts, ports);
    let mut engine = engine(composite, EngineConfig::default());
    engine.update(3.0).unwrap();
    assert_eq!(value(&engine, "shared/x"), Value::Float(9.0));
}

#[test]
fn test_output_port_is_masked_from_view() {
    let composite = Composite::new().with_process("relay", Relay, [("input", "input"), ("out", "out")]);
    let mut engine = engine(composite, EngineConfig::default());
    engine.update(1.0).unwrap();
    assert_eq!(value(&engine, "out"), Value::Float(2.0));
}

#[test]
fn test_scalar_update_to_wildcard_port_is_rejected() {
    let composite = Composite::new()
        .with_process("census", FlatCensus, Topology::new().wire("cells", Wire::each("agents")))
        .with_state(v(json!({"agents": {"a": {"m": 1.0}}})));
    let mut engine = engine(composite, EngineConfig::default());
    let state = engine.state();

    let err = engine.update(1.0).unwrap_err();
    assert!(matches!(
        &err,
        Error::WiringError { message, .. } if message == "port 'cells' expects a branch update"
    ));
    assert_eq!(engine.state(), state);
}

/// Parallel updates merge in registration order whichever finishes first.
#[test]
fn test_parallel_updates_merge_in_registration_order() {
    let run = |first_delay: u64, second_delay: u64| {
        let sleeper = |delay: u64, value: f64| Sleeper {
            delay: Duration::from_millis(delay),
            value,
        };
        let composite = Composite::new()
            .with_process("first", sleeper(first_delay, 1.0), [("value", "shared")])
            .with_process("second", sleeper(second_delay, 2.0), [("value", "shared")]);
        let mut engine = engine(composite, EngineConfig::default());
        engine.update(1.0).unwrap();
        value(&engine, "shared")
    };

    assert_eq!(run(50, 0), Value::Float(2.0));
    assert_eq!(run(0, 50), Value::Float(2.0));
}

#[test]
fn test_failing_unit_aborts_the_tick() {
    let composite = Composite::new()
        .with_process("counter", Counter::new(1.0), [("count", "count")])
        .with_process("faulty", Faulty, [("x", "x")]);
    let mut engine = engine(composite, EngineConfig::default());

    let err = engine.update(1.0).unwrap_err();
    assert!(matches!(&err, Error::UnitFailed { unit, .. } if *unit == Path::parse("faulty")));
    assert_eq!(value(&engine, "count"), Value::Float(0.0));
    assert_eq!(engine.global_time(), 0.0);
}

// ============================================================================
// Structure
// ============================================================================

#[test]
fn test_add_and_delete_directives() {
    let composite = Composite::new()
        .with_process("turnover", Turnover::default(), [("agents", "agents")])
        .with_state(v(json!({"agents": {"founder": {"x": 1.0}}})));
    let mut engine = engine(composite, config(json!({"store_schema": {"agents": {"_emit": true}}})));

    assert_eq!(
        emitted_at(&engine, 0.0),
        v(json!({"agents": {"founder": {"x": 1.0}}}))
    );
    engine.update(3.0).unwrap();

    assert_eq!(
        engine.tree().get("agents").unwrap().keys(),
        vec!["agent2"]
    );
    assert_eq!(
        emitted_at(&engine, 1.0),
        v(json!({"agents": {"agent0": {"x": 1.0}}}))
    );
    assert_eq!(
        emitted_at(&engine, 3.0),
        v(json!({"agents": {"agent2": {"x": 1.0}}}))
    );
}

/// Agents rotate between three stores, carrying their state and their own
/// processes along.
#[test]
fn test_move_directive_carries_units() {
    let stores = ["store1", "store2", "store3"];
    let mover = Mover {
        timestep: 2.0,
        stores: stores.map(String::from),
    };
    let mut composite = Composite::new().with_process(
        "mover",
        mover,
        [("one", "store1"), ("two", "store2"), ("three", "store3")],
    );
    for (store, agent) in stores.iter().zip(["a1", "a2", "a3"]) {
        composite = composite.with_process(
            format!("{store}/{agent}/counter").as_str(),
            Counter::new(1.0),
            [("count", "count")],
        );
    }
    let mut engine = engine(composite, EngineConfig::default());
    engine.update(4.0).unwrap();

    assert_eq!(value(&engine, "store1"), v(json!({"a2": {"count": 4.0}})));
    assert_eq!(value(&engine, "store2"), v(json!({"a3": {"count": 4.0}})));
    assert_eq!(value(&engine, "store3"), v(json!({"a1": {"count": 4.0}})));
    assert_eq!(front_time(&engine, "store3/a1/counter"), 4.0);
}

/// An agent grows, divides, and its daughters' processes keep running.
#[test]
fn test_division_forks_agent_processes() {
    let grower = Grower {
        rate: 1.0,
        threshold: 2.0,
    };
    let composite = grower_agent("a", grower).with_step("census", MassTotal, census(), Vec::<&str>::new());
    let mut engine = engine(composite, EngineConfig::default());
    engine.update(4.0).unwrap();

    let agents = engine.tree().get("agents").unwrap();
    assert_eq!(agents.keys(), vec!["a00", "a01", "a10", "a11"]);
    for key in ["a00", "a01", "a10", "a11"] {
        assert_eq!(value(&engine, &format!("agents/{key}/mass")), Value::Float(1.0));
        assert_eq!(value(&engine, &format!("agents/{key}/id")), Value::from(key));
        assert_eq!(front_time(&engine, &format!("agents/{key}/grow")), 4.0);
    }
    assert_eq!(engine.front().len(), 4);

    // the wildcard follows the agents present at each tick
    let totals: Vec<Value> = engine
        .emitter()
        .get_data()
        .iter()
        .map(|(_, data)| data.get("total").cloned().unwrap_or_default())
        .collect();
    let expected: Vec<Value> = [1.0, 2.0, 2.0, 4.0, 4.0].map(Value::Float).to_vec();
    assert_eq!(totals, expected);
}

#[test]
fn test_wildcard_without_matches_is_an_error() {
    init_logging();
    let composite = Composite::new().with_step("census", MassTotal, census(), Vec::<&str>::new());
    let err = Engine::new(composite, EngineConfig::default(), EngineContext::new()).unwrap_err();
    assert!(matches!(err, Error::EmptyWildcard { port, .. } if port == "cells"));
}

#[test]
fn test_step_cycle_is_reported() {
    init_logging();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let step = |name: &str| RecordingStep {
        name: name.to_string(),
        log: log.clone(),
    };
    let var = [("var", "var")];
    let composite = Composite::new()
        .with_step("a", step("a"), var, ["b"])
        .with_step("b", step("b"), var, ["a"]);
    let err = Engine::new(composite, EngineConfig::default(), EngineContext::new()).unwrap_err();
    assert!(matches!(err, Error::CycleDetected { steps } if steps.len() == 2));
}

#[test]
fn test_unknown_step_dependency_is_reported() {
    init_logging();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let composite = Composite::new().with_step(
        "a",
        RecordingStep {
            name: "a".into(),
            log,
        },
        [("var", "var")],
        ["ghost"],
    );
    let err = Engine::new(composite, EngineConfig::default(), EngineContext::new()).unwrap_err();
    assert!(matches!(err, Error::MissingDependency { dependency, .. } if dependency == Path::parse("ghost")));
}

// ============================================================================
// Emission
// ============================================================================

#[test]
fn test_store_schema_masks_emission() {
    let composite = Composite::new()
        .with_process("p1", Counter::new(1.0), [("count", "values/e1")])
        .with_process("p2", Counter::new(1.0), [("count", "values/e2")]);
    let mut quiet = engine(
        Composite::new().with_process("p", Counter::new(1.0), [("count", "values/e1")]),
        config(json!({"store_schema": {"_emit": false}})),
    );
    quiet.update(1.0).unwrap();
    assert_eq!(emitted_at(&quiet, 1.0), v(json!({"values": {}})));

    let mut selective = engine(
        composite,
        config(json!({"store_schema": {"_emit": false, "values": {"e2": {"_emit": true}}}})),
    );
    selective.update(1.0).unwrap();
    assert_eq!(emitted_at(&selective, 1.0), v(json!({"values": {"e2": 1.0}})));
}

#[test]
fn test_store_schema_adds_new_state() {
    let composite = Composite::new().with_process("p", Counter::new(1.0), [("count", "agents/1/count")]);
    let mut engine = engine(
        composite,
        config(json!({"store_schema": {"agents": {"1": {"extra": {"_emit": true, "_value": 1.0}}}}})),
    );
    engine.update(5.0).unwrap();

    let series = engine.emitter().get_timeseries();
    let column = |path: &str| series.get_path(&Path::parse(path)).cloned();
    assert_eq!(column("time").and_then(|t| t.as_list().map(<[Value]>::len)), Some(6));
    assert_eq!(column("agents/1/extra"), Some(Value::List(vec![Value::Float(1.0); 6])));
    assert_eq!(
        column("agents/1/count"),
        Some(Value::List((0..6).map(|k| Value::Float(k as f64)).collect()))
    );
}

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_json_emitter_writes_every_snapshot() {
    init_logging();
    let buffer = SharedBuffer::default();
    let context = EngineContext::new().with_emitter(JsonEmitter::new(buffer.clone()));
    let composite = Composite::new().with_process("p", Counter::new(1.0), [("count", "count")]);
    let mut engine = Engine::new(composite, EngineConfig::default(), context).unwrap();
    engine.update(3.0).unwrap();
    engine.end().unwrap();

    let bytes = buffer.0.lock().unwrap().clone();
    let history = read_history(&bytes[..]).unwrap();
    let times: Vec<f64> = history.iter().map(|(t, _)| *t).collect();
    assert_eq!(times, vec![0.0, 1.0, 2.0, 3.0]);
    assert_eq!(history[3].1, v(json!({"count": 3.0})));
    assert_eq!(history, engine.emitter().get_data());
}

#[test]
fn test_ended_engine_rejects_runs() {
    let composite = Composite::new().with_process("p", Counter::new(1.0), [("count", "count")]);
    let mut engine = engine(composite, EngineConfig::default());
    engine.update(1.0).unwrap();
    engine.end().unwrap();
    assert!(matches!(engine.update(1.0), Err(Error::EngineEnded)));
    assert!(matches!(engine.end(), Err(Error::EngineEnded)));
}

// ============================================================================
// Determinism
// ============================================================================

fn colony() -> Composite {
    let grower = Grower {
        rate: 0.5,
        threshold: 2.0,
    };
    let mut composite = grower_agent("a", grower.clone()).merge(grower_agent("b", grower));
    for name in ["x", "y", "z"] {
        let wire = format!("counts/{name}");
        composite = composite.with_process(name, Counter::new(0.5).parallel(), [("count", wire.as_str())]);
    }
    composite.with_step("census", MassTotal, census(), Vec::<&str>::new())
}

/// Identical composites and configuration emit identical histories, with
/// parallel units computing on the rayon pool.
#[test]
fn test_runs_are_deterministic() {
    let run = || {
        let mut engine = engine(colony(), config(json!({"seed": 7})));
        engine.update(6.0).unwrap();
        engine.emitter().get_data()
    };
    let first = run();
    assert_eq!(first.len(), 13);
    assert_eq!(first, run());
}
