//! Phase scheduling: sequential chains and dependency-DAG fan-out.
//!
//! Sequential mode runs phases in declared order, each seeded with a
//! truncated handoff from its predecessor. Parallel mode repeatedly computes
//! the ready set (phases whose dependencies all have results), runs the whole
//! set concurrently, and joins before advancing; an empty ready set with
//! phases remaining means a dependency cycle and fails the run naming the
//! stuck phases.
//!
//! A phase failure never aborts the run: it lands as a `PhaseResult` with an
//! error finish reason so sibling phases and downstream aggregation proceed
//! with partial results.

use crate::window::{ContextWindowManager, ManagedOptions};
use crate::EngineError;
use ahash::{AHashMap, AHashSet};
use chrono::Utc;
use futures_util::future::join_all;
use pacer_core::tokens::truncate_chars;
use pacer_core::types::{Phase, PhaseMode, PhaseResult, TokenUsage};
use pacer_telemetry::EngineMetrics;
use std::sync::Arc;
use tracing::{debug, warn};

/// Default cap on the text a phase hands off to its dependents.
pub const DEFAULT_HANDOFF_MAX_CHARS: usize = 2_000;

// ---------------------------------------------------------------------------
// Options / result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PhaseRunOptions {
    pub phases: Vec<Phase>,
    /// The original task text; every phase sees it.
    pub input: String,
    pub mode: PhaseMode,
    /// Sequential mode only: seed each phase with the previous phase's text.
    pub input_from_previous: bool,
    /// Truncation cap applied to each predecessor's text in a handoff.
    pub handoff_max_chars: usize,
    /// Step-loop options every phase starts from; instructions, step cap, and
    /// tool allow-list come from the phase itself.
    pub base: ManagedOptions,
}

impl PhaseRunOptions {
    pub fn new(phases: Vec<Phase>, input: impl Into<String>) -> Self {
        Self {
            phases,
            input: input.into(),
            mode: PhaseMode::Sequential,
            input_from_previous: true,
            handoff_max_chars: DEFAULT_HANDOFF_MAX_CHARS,
            base: ManagedOptions::new(),
        }
    }

    pub fn with_mode(mut self, mode: PhaseMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn parallel(self) -> Self {
        self.with_mode(PhaseMode::Parallel)
    }

    pub fn with_input_from_previous(mut self, chain: bool) -> Self {
        self.input_from_previous = chain;
        self
    }

    pub fn with_handoff_max_chars(mut self, max_chars: usize) -> Self {
        self.handoff_max_chars = max_chars;
        self
    }

    pub fn with_base(mut self, base: ManagedOptions) -> Self {
        self.base = base;
        self
    }
}

/// Aggregate of one phased run. `final_text` is the text of the last phase
/// in declared order, not the last to finish.
#[derive(Debug, Clone)]
pub struct PhaseRunResult {
    pub phases: Vec<PhaseResult>,
    pub final_text: String,
    pub usage: TokenUsage,
    pub total_steps: u32,
}

// ---------------------------------------------------------------------------
// Validation / input composition
// ---------------------------------------------------------------------------

/// Reject duplicate phase ids and dependency references that resolve to no
/// known phase. Cycles surface later, from the ready-set loop.
pub(crate) fn validate_phases(phases: &[Phase]) -> Result<(), EngineError> {
    let mut ids: AHashSet<&str> = AHashSet::with_capacity(phases.len());
    for phase in phases {
        if !ids.insert(phase.id.as_str()) {
            return Err(EngineError::DuplicatePhase {
                id: phase.id.clone(),
            });
        }
    }
    for phase in phases {
        for dependency in &phase.depends_on {
            if !ids.contains(dependency.as_str()) {
                return Err(EngineError::UnknownDependency {
                    phase: phase.id.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Original task text plus each predecessor's truncated output.
pub(crate) fn compose_input(
    task: &str,
    predecessors: &[&PhaseResult],
    handoff_max_chars: usize,
) -> String {
    if predecessors.is_empty() {
        return task.to_string();
    }
    let mut composed = String::from(task);
    composed.push_str("\n\nContext from completed phases:");
    for predecessor in predecessors {
        composed.push_str(&format!(
            "\n\n[{}]\n{}",
            predecessor.name,
            truncate_chars(&predecessor.text, handoff_max_chars)
        ));
    }
    composed
}

// ---------------------------------------------------------------------------
// PhaseScheduler
// ---------------------------------------------------------------------------

/// Executes phase sets by delegating each phase to the context window
/// manager with that phase's own instructions and step budget.
pub struct PhaseScheduler {
    manager: Arc<ContextWindowManager>,
    metrics: Option<Arc<EngineMetrics>>,
}

impl PhaseScheduler {
    pub fn new(manager: Arc<ContextWindowManager>) -> Self {
        Self {
            manager,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn run_phases(
        &self,
        options: &PhaseRunOptions,
    ) -> Result<PhaseRunResult, EngineError> {
        validate_phases(&options.phases)?;

        let results = match options.mode {
            PhaseMode::Sequential => self.run_sequential(options).await,
            PhaseMode::Parallel => self.run_parallel(options).await?,
        };

        let mut usage = TokenUsage::default();
        let mut total_steps = 0;
        for result in &results {
            usage.add(&result.usage);
            total_steps += result.steps_used;
        }
        let final_text = results
            .last()
            .map(|result| result.text.clone())
            .unwrap_or_default();

        Ok(PhaseRunResult {
            phases: results,
            final_text,
            usage,
            total_steps,
        })
    }

    async fn run_sequential(&self, options: &PhaseRunOptions) -> Vec<PhaseResult> {
        let mut results: Vec<PhaseResult> = Vec::with_capacity(options.phases.len());
        for phase in &options.phases {
            let input = if options.input_from_previous {
                let previous: Vec<&PhaseResult> = results.last().into_iter().collect();
                compose_input(&options.input, &previous, options.handoff_max_chars)
            } else {
                options.input.clone()
            };
            let result = self.run_phase(phase, input, &options.base, None).await;
            results.push(result);
        }
        results
    }

    async fn run_parallel(
        &self,
        options: &PhaseRunOptions,
    ) -> Result<Vec<PhaseResult>, EngineError> {
        let mut completed: AHashMap<String, PhaseResult> =
            AHashMap::with_capacity(options.phases.len());
        let mut group: u32 = 0;

        while completed.len() < options.phases.len() {
            let ready: Vec<&Phase> = options
                .phases
                .iter()
                .filter(|phase| !completed.contains_key(&phase.id))
                .filter(|phase| {
                    phase
                        .depends_on
                        .iter()
                        .all(|dependency| completed.contains_key(dependency))
                })
                .collect();

            if ready.is_empty() {
                let stuck: Vec<String> = options
                    .phases
                    .iter()
                    .filter(|phase| !completed.contains_key(&phase.id))
                    .map(|phase| phase.id.clone())
                    .collect();
                return Err(EngineError::DependencyCycle { stuck });
            }

            group += 1;
            debug!(group, width = ready.len(), "parallel ready set");

            // Inputs are composed before any future exists so `completed`
            // is not borrowed across the joins below.
            let inputs: Vec<String> = ready
                .iter()
                .map(|phase| {
                    let predecessors: Vec<&PhaseResult> = phase
                        .depends_on
                        .iter()
                        .filter_map(|dependency| completed.get(dependency))
                        .collect();
                    compose_input(&options.input, &predecessors, options.handoff_max_chars)
                })
                .collect();

            let futures: Vec<_> = ready
                .iter()
                .zip(inputs)
                .map(|(phase, input)| self.run_phase(phase, input, &options.base, Some(group)))
                .collect();

            for result in join_all(futures).await {
                completed.insert(result.phase_id.clone(), result);
            }
        }

        let mut ordered = Vec::with_capacity(options.phases.len());
        for phase in &options.phases {
            if let Some(result) = completed.remove(&phase.id) {
                ordered.push(result);
            }
        }
        Ok(ordered)
    }

    async fn run_phase(
        &self,
        phase: &Phase,
        input: String,
        base: &ManagedOptions,
        parallel_group: Option<u32>,
    ) -> PhaseResult {
        let mut options = base.clone();
        if !phase.instructions.is_empty() {
            options.instructions = Some(phase.instructions.clone());
        }
        options.max_steps = phase.max_steps;
        if phase.tools.is_some() {
            options.allowed_tools = phase.tools.clone();
        }

        let started_at = Utc::now();
        debug!(phase = %phase.id, group = ?parallel_group, "phase started");
        let run = self.manager.run(&input, &options).await;
        let finished_at = Utc::now();

        if run.abort_reason.is_some() {
            warn!(
                phase = %phase.id,
                finish = %run.finish_reason,
                reason = run.abort_reason.as_deref().unwrap_or(""),
                "phase did not complete"
            );
        } else {
            debug!(phase = %phase.id, steps = run.steps_used, "phase complete");
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_phase_completed();
        }

        PhaseResult {
            phase_id: phase.id.clone(),
            name: phase.name.clone(),
            text: run.final_text,
            steps_used: run.steps_used,
            usage: run.usage,
            finish_reason: run.finish_reason,
            abort_reason: run.abort_reason,
            started_at,
            finished_at,
            parallel_group,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use pacer_core::types::FinishReason;

    fn phase(id: &str) -> Phase {
        Phase::new(id, format!("{id}-name"), format!("{id} instructions"))
    }

    fn result(id: &str, text: &str) -> PhaseResult {
        PhaseResult {
            phase_id: id.to_string(),
            name: format!("{id}-name"),
            text: text.to_string(),
            steps_used: 1,
            usage: TokenUsage::default(),
            finish_reason: FinishReason::Complete,
            abort_reason: None,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            parallel_group: None,
        }
    }

    // -- Validation --

    #[test]
    fn duplicate_phase_ids_rejected() {
        let err = validate_phases(&[phase("a"), phase("a")]).unwrap_err();
        assert!(matches!(err, EngineError::DuplicatePhase { id } if id == "a"));
    }

    #[test]
    fn unknown_dependency_rejected() {
        let phases = vec![phase("a"), phase("b").with_dependencies(["missing"])];
        let err = validate_phases(&phases).unwrap_err();
        match err {
            EngineError::UnknownDependency { phase, dependency } => {
                assert_eq!(phase, "b");
                assert_eq!(dependency, "missing");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn valid_dag_passes_validation() {
        let phases = vec![
            phase("a"),
            phase("b").with_dependencies(["a"]),
            phase("c").with_dependencies(["a", "b"]),
        ];
        assert!(validate_phases(&phases).is_ok());
    }

    // -- Input composition --

    #[test]
    fn compose_without_predecessors_is_the_task() {
        assert_eq!(compose_input("do the thing", &[], 100), "do the thing");
    }

    #[test]
    fn compose_labels_and_truncates_predecessors() {
        let long = result("a", &"x".repeat(50));
        let composed = compose_input("task", &[&long], 10);
        assert!(composed.starts_with("task\n\nContext from completed phases:"));
        assert!(composed.contains(&format!("[a-name]\n{}...", "x".repeat(10))));
        assert!(!composed.contains(&"x".repeat(11)));
    }

    #[test]
    fn compose_concatenates_multiple_predecessors_in_order() {
        let b = result("b", "beta output");
        let c = result("c", "gamma output");
        let composed = compose_input("task", &[&b, &c], 100);
        let pos_b = composed.find("[b-name]").unwrap();
        let pos_c = composed.find("[c-name]").unwrap();
        assert!(pos_b < pos_c);
    }
}
