//! Terrarium Runtime.
//!
//! This crate composes simulation units into a hierarchical state tree and
//! advances that tree through simulated time.
//!
//! # Architecture
//!
//! The runtime is organized into several modules:
//!
//! - [`types`] - Core types: [`Value`], [`Update`], [`Directive`]
//! - [`schema`] - Leaf schemas, declaration unification and overrides
//! - [`registry`] - Named updaters, dividers and serializers
//! - [`store`] - The [`StateTree`] arena: lookup, updates, structural directives
//! - [`topology`] - Port wiring, views and update projection
//! - [`unit`] - The [`Process`] and [`Step`] traits
//! - [`composite`] - Bundles of units and initial state
//! - [`dag`] - Step dependency graph
//! - [`engine`] - The tick scheduler, [`Engine`]
//! - [`emitter`] - Output sinks for emitted snapshots
//! - [`config`] - [`EngineConfig`] and [`EngineContext`]
//! - [`error`] - Error types for tree and engine failures
//!
//! # Execution Model
//!
//! Each tick proceeds in order:
//!
//! 1. **Plan** - Find the earliest time any process is due
//! 2. **View** - Build an owned view for every due process
//! 3. **Compute** - Run due processes, parallel ones on the rayon pool
//! 4. **Merge** - Apply updates in registration order
//! 5. **Steps** - Re-run derivers and steps in dependency order
//! 6. **Emit** - Record the tree's emit projection
//!
//! # Example
//!
//! ```ignore
//! use terrarium_runtime::{Composite, Engine, EngineConfig, EngineContext};
//!
//! let composite = Composite::new()
//!     .with_process("growth", Growth::new(), [("mass", "cell/mass")]);
//! let mut engine = Engine::new(composite, EngineConfig::default(), EngineContext::new())?;
//! engine.update(10.0)?;
//! engine.end()?;
//! ```

pub mod composite;
pub mod config;
pub mod dag;
pub mod emitter;
pub mod engine;
pub mod error;
pub mod registry;
pub mod schema;
pub mod store;
pub mod topology;
pub mod types;
pub mod unit;

pub use composite::{Composite, UnitSpec};
pub use config::{EngineConfig, EngineContext, MAX_TIME_PRECISION};
pub use dag::{DependencyGraph, GraphError};
pub use emitter::{Emitter, EmitterError, JsonEmitter, NullEmitter, RamEmitter, read_history, timeseries};
pub use engine::{Engine, Front};
pub use error::{Error, Result};
pub use registry::{Divider, Registry};
pub use schema::{LeafSchema, Schema, SchemaOverride, SchemaPolicy};
pub use store::{ConnectTarget, StateTree, StoreId, StoreRef, UnitBinding};
pub use terrarium_foundation::{Path, Time};
pub use topology::{Topology, Wire};
pub use types::*;
pub use unit::{Process, Step, Unit, UnitKind};
