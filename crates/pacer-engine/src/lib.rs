//! Bounded multi-step execution for model-driven agents.
//!
//! The engine turns one task (or a phase DAG of tasks) into a sequence of
//! budgeted generation steps: the context window manager prunes and
//! re-anchors conversation state per step, the phase scheduler orders and
//! fans out phases, the model router picks a tier per step, and the spend
//! ledger (from `pacer-ledger`) gates and settles every run.

pub mod capability;
pub mod compress;
pub mod engine;
pub mod router;
pub mod scheduler;
pub mod window;

// Re-export the capability seam.
pub use capability::{
    CapabilityError, CompressionCapability, GenerationCapability, MockCompression,
    MockGeneration, StepOutcome, StepRequest, ToolInvocation, ToolResult,
};

// Re-export the run surface.
pub use compress::{CacheStats, CompressionCache};
pub use engine::{ExecutionEngine, ManagedGenerateResult, ManagedPhasesResult};
pub use router::{
    classify_complexity, resolve_routing_decision, Classification, ComplexityLevel, ModelTier,
    RoutingDecision,
};
pub use scheduler::{PhaseRunOptions, PhaseRunResult, PhaseScheduler};
pub use window::{
    ContextWindowManager, ManagedOptions, ManagedRunResult, RecordingStepObserver, StepObserver,
};

use pacer_core::config::ConfigError;
use pacer_ledger::LedgerError;

// ---------------------------------------------------------------------------
// Crate-level error type
// ---------------------------------------------------------------------------

/// Fatal configuration and ledger failures. Capability failures and budget
/// denials never appear here; they land in run results as finish reasons.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("duplicate phase id: {id}")]
    DuplicatePhase { id: String },

    #[error("phase {phase} depends on unknown phase {dependency}")]
    UnknownDependency { phase: String, dependency: String },

    #[error("phase dependency cycle detected; stuck phases: {}", .stuck.join(", "))]
    DependencyCycle { stuck: Vec<String> },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}
