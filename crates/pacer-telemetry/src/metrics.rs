use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

// ---------------------------------------------------------------------------
// EngineMetrics
// ---------------------------------------------------------------------------

/// Thread-safe counters for the execution engine's hot path.
///
/// Counters are atomics with relaxed ordering: they feed dashboards and
/// tests, never control flow, so cross-counter consistency is not required.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    steps_executed: AtomicU64,
    generation_failures: AtomicU64,
    budget_denials: AtomicU64,
    phases_completed: AtomicU64,
    runs_completed: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// One generation call returned an outcome.
    pub fn record_step(&self) {
        self.steps_executed.fetch_add(1, Ordering::Relaxed);
    }

    /// One generation call failed at the capability layer.
    pub fn record_generation_failure(&self) {
        self.generation_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A budget check stopped a run or a step.
    pub fn record_budget_denial(&self) {
        self.budget_denials.fetch_add(1, Ordering::Relaxed);
    }

    /// One phase produced its result, whatever its finish reason.
    pub fn record_phase_completed(&self) {
        self.phases_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// One managed run finished end to end.
    pub fn record_run_completed(&self) {
        self.runs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn steps_executed(&self) -> u64 {
        self.steps_executed.load(Ordering::Relaxed)
    }

    pub fn generation_failures(&self) -> u64 {
        self.generation_failures.load(Ordering::Relaxed)
    }

    pub fn budget_denials(&self) -> u64 {
        self.budget_denials.load(Ordering::Relaxed)
    }

    pub fn phases_completed(&self) -> u64 {
        self.phases_completed.load(Ordering::Relaxed)
    }

    pub fn runs_completed(&self) -> u64 {
        self.runs_completed.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            steps_executed: self.steps_executed(),
            generation_failures: self.generation_failures(),
            budget_denials: self.budget_denials(),
            phases_completed: self.phases_completed(),
            runs_completed: self.runs_completed(),
        }
    }
}

/// Serializable snapshot of the engine counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub steps_executed: u64,
    pub generation_failures: u64,
    pub budget_denials: u64,
    pub phases_completed: u64,
    pub runs_completed: u64,
}
