//! Engine configuration and execution context.
//!
//! [`EngineConfig`] holds plain, serializable options and can be loaded from
//! JSON. [`EngineContext`] carries what cannot be serialized: the function
//! registry and the emitter. Both are handed to the engine explicitly; there
//! is no process-wide registry.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::emitter::{Emitter, RamEmitter};
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::schema::{SchemaOverride, SchemaPolicy};
use crate::types::Value;

/// Largest accepted `global_time_precision`; f64 cannot carry more digits.
pub const MAX_TIME_PRECISION: u32 = 15;

/// Options recognised by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Emit only at multiples of this interval. Every tick emits when unset.
    pub emit_step: Option<f64>,

    /// Decimal places the clock is rounded to before comparisons.
    pub global_time_precision: Option<u32>,

    /// Schema overrides applied to the tree before the first step pass,
    /// in the `_emit` / `_updater` / `_value` attribute form.
    pub store_schema: Option<Value>,

    /// Log a progress line after every tick.
    pub progress_bar: bool,

    /// Time every unit's compute and report the totals at `end()`.
    pub profile: bool,

    /// Global time at construction.
    pub initial_time: f64,

    /// Seed for randomised dividers.
    pub seed: u64,

    pub schema_policy: SchemaPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            emit_step: None,
            global_time_precision: None,
            store_schema: None,
            progress_bar: false,
            profile: false,
            initial_time: 0.0,
            seed: 0,
            schema_policy: SchemaPolicy::Strict,
        }
    }
}

impl EngineConfig {
    /// Parse from JSON, then validate.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_json::from_str(json).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(step) = self.emit_step
            && !(step.is_finite() && step > 0.0)
        {
            return Err(Error::InvalidConfig(format!("emit_step must be positive, got {step}")));
        }
        if let Some(precision) = self.global_time_precision
            && precision > MAX_TIME_PRECISION
        {
            return Err(Error::InvalidConfig(format!(
                "global_time_precision must be at most {MAX_TIME_PRECISION}, got {precision}"
            )));
        }
        if !self.initial_time.is_finite() {
            return Err(Error::InvalidConfig("initial_time must be finite".into()));
        }
        self.store_overrides()?;
        Ok(())
    }

    /// Parsed `store_schema`, if any.
    pub fn store_overrides(&self) -> Result<Option<SchemaOverride>> {
        self.store_schema.as_ref().map(SchemaOverride::from_value).transpose()
    }
}

/// Registry and emitter for one engine.
pub struct EngineContext {
    pub registry: Arc<Registry>,
    pub emitter: Box<dyn Emitter>,
}

impl EngineContext {
    /// Built-in registry and an in-memory emitter.
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            emitter: Box::new(RamEmitter::new()),
        }
    }

    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_emitter(mut self, emitter: impl Emitter + 'static) -> Self {
        self.emitter = Box::new(emitter);
        self
    }
}

impl Default for EngineContext {
    fn default() -> Self {
        Self::new()
    }
}
