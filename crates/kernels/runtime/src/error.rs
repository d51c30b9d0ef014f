//! Runtime errors for tree mutation and simulation execution.
//!
//! # Error Categories
//!
//! - **Lookup errors**: [`Error::PathError`], [`Error::NotFound`], [`Error::NotAUnit`]
//! - **Structural errors**: [`Error::PathConflict`], [`Error::DuplicateKey`],
//!   [`Error::InvalidKey`], [`Error::DividerMismatch`]
//! - **Schema errors**: [`Error::SchemaConflict`], [`Error::UnknownUpdater`],
//!   [`Error::UnknownDivider`], [`Error::UnknownSerializer`], [`Error::UpdaterFailed`]
//! - **Wiring errors**: [`Error::WiringError`], [`Error::EmptyWildcard`]
//! - **Graph errors**: [`Error::CycleDetected`], [`Error::MissingDependency`]
//! - **Scheduling errors**: [`Error::InvalidTimestep`], [`Error::UnitFailed`],
//!   [`Error::EngineEnded`]
//! - **Configuration and output**: [`Error::InvalidConfig`], [`Error::Emitter`]
//!
//! # Error Handling Policy
//!
//! Nothing is retried and nothing is silently corrected. Structural directives
//! validate completely before they mutate, so a failed directive leaves the
//! tree exactly as it was. A failed unit aborts its tick before any update of
//! that tick is merged.

use terrarium_foundation::Path;
use thiserror::Error;

use crate::emitter::EmitterError;

/// Runtime result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the state tree and the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// A path does not resolve against the current shape of the tree.
    #[error("path does not resolve: {path} ({reason})")]
    PathError {
        /// The path that failed to resolve.
        path: Path,
        /// Where resolution stopped.
        reason: String,
    },

    /// `create` or `insert` targeted a path that already exists.
    #[error("path already exists: {0}")]
    PathConflict(Path),

    /// `delete` or a directive referenced a child that does not exist.
    #[error("no child '{key}' under {parent}")]
    NotFound {
        /// Branch that was searched.
        parent: Path,
        /// Missing key.
        key: String,
    },

    /// `add` or a daughter key collides with an existing child.
    #[error("duplicate key '{key}' under {parent}")]
    DuplicateKey {
        /// Branch that already holds the key.
        parent: Path,
        /// Colliding key.
        key: String,
    },

    /// A key is empty, contains `/`, or is the parent marker.
    #[error("invalid key '{0}'")]
    InvalidKey(String),

    /// Two declarations of the same node disagree.
    ///
    /// Identical declarations unify silently. Under
    /// [`SchemaPolicy::Equality`](crate::schema::SchemaPolicy::Equality)
    /// numerically equal defaults are tolerated as well.
    #[error("schema conflict at {path}: {field} declared as {existing} and {incoming}")]
    SchemaConflict {
        /// Node whose declaration conflicts.
        path: Path,
        /// Schema attribute in conflict (`default`, `updater`, ...).
        field: &'static str,
        /// Value already declared.
        existing: String,
        /// Value that was rejected.
        incoming: String,
    },

    /// A port could not be wired to its target.
    #[error("wiring error on {unit}: {message}")]
    WiringError {
        /// Unit whose port was being wired.
        unit: Path,
        /// Why the target was rejected.
        message: String,
    },

    /// A wildcard binding matched no children at the time of resolution.
    #[error("wildcard port '{port}' of {unit} matched no children under {base}")]
    EmptyWildcard {
        /// Unit owning the wildcard.
        unit: Path,
        /// Port carrying the wildcard.
        port: String,
        /// Branch whose children were enumerated.
        base: Path,
    },

    /// A divider was asked for a daughter count it cannot produce.
    #[error("divider '{divider}' at {path} produces {expected} daughters, {actual} requested")]
    DividerMismatch {
        /// Leaf being divided.
        path: Path,
        /// Divider name.
        divider: String,
        /// Daughter count the divider supports.
        expected: usize,
        /// Daughter count requested.
        actual: usize,
    },

    /// A schema references an updater that is not registered.
    #[error("unknown updater '{0}'")]
    UnknownUpdater(String),

    /// A schema references a divider that is not registered.
    #[error("unknown divider '{0}'")]
    UnknownDivider(String),

    /// A schema references a serializer that is not registered.
    #[error("unknown serializer '{0}'")]
    UnknownSerializer(String),

    /// An updater or divider rejected its input.
    #[error("{function} failed at {path}")]
    UpdaterFailed {
        /// Node being updated or divided.
        path: Path,
        /// Registry function that failed.
        function: String,
        /// Underlying failure.
        #[source]
        source: anyhow::Error,
    },

    /// The step graph contains a dependency cycle.
    #[error("cycle detected in step graph: {steps:?}")]
    CycleDetected {
        /// Steps that could not be scheduled.
        steps: Vec<Path>,
    },

    /// A step declares a dependency on a step that is not registered.
    #[error("step {step} depends on unregistered step {dependency}")]
    MissingDependency {
        /// Dependent step.
        step: Path,
        /// Missing predecessor.
        dependency: Path,
    },

    /// A process asked for a non-positive or non-finite timestep.
    #[error("process {unit} requested invalid timestep {timestep}")]
    InvalidTimestep {
        /// Offending process.
        unit: Path,
        /// Requested timestep.
        timestep: f64,
    },

    /// The addressed node is not a unit.
    #[error("not a unit: {0}")]
    NotAUnit(Path),

    /// A unit returned an error from `next_update`.
    #[error("unit {unit} failed")]
    UnitFailed {
        /// Failing unit.
        unit: Path,
        /// Error returned by the unit.
        #[source]
        source: anyhow::Error,
    },

    /// The emitter failed to record or flush output.
    #[error(transparent)]
    Emitter(#[from] EmitterError),

    /// The engine was used after `end()`.
    #[error("engine has ended")]
    EngineEnded,

    /// Engine configuration is invalid.
    #[error("invalid engine configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    pub(crate) fn path(path: &Path, reason: impl Into<String>) -> Self {
        Error::PathError {
            path: path.clone(),
            reason: reason.into(),
        }
    }

    pub(crate) fn wiring(unit: &Path, message: impl Into<String>) -> Self {
        Error::WiringError {
            unit: unit.clone(),
            message: message.into(),
        }
    }
}
