//! Top-level execution engine: wires capabilities, the compression cache,
//! budget enforcement, and pricing into the caller-facing run surface.
//!
//! `managed_generate` wraps one context-managed run in the full spend
//! protocol: upfront budget check (a denied check makes zero generation
//! calls and reserves nothing), reservation before work, settle with actual
//! cost after. `run_phases` does the same around a phased run.

use crate::capability::{CompressionCapability, GenerationCapability};
use crate::compress::CompressionCache;
use crate::scheduler::{PhaseRunOptions, PhaseScheduler};
use crate::window::{ContextWindowManager, ManagedOptions, StepObserver};
use crate::EngineError;
use pacer_core::config::EngineConfig;
use pacer_core::types::{
    AgentProfile, FinishReason, PhaseResult, StepSummary, TokenUsage, ToolCallRecord,
};
use pacer_ledger::{BudgetCheckContext, BudgetEnforcement, PricingTable};
use pacer_telemetry::EngineMetrics;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome of one budget-wrapped managed run.
#[derive(Debug, Clone)]
pub struct ManagedGenerateResult {
    pub run_id: Uuid,
    pub final_text: String,
    pub steps: Vec<StepSummary>,
    pub records: Vec<ToolCallRecord>,
    pub usage: TokenUsage,
    pub steps_used: u32,
    pub finish_reason: FinishReason,
    pub abort_reason: Option<String>,
    /// Cost settled into the ledger; 0.0 when no ledger is wired or the run
    /// consumed no tokens.
    pub cost_usd: f64,
}

/// Outcome of one budget-wrapped phased run.
#[derive(Debug, Clone)]
pub struct ManagedPhasesResult {
    pub run_id: Uuid,
    pub phases: Vec<PhaseResult>,
    /// Text of the last phase in declared order.
    pub final_text: String,
    pub usage: TokenUsage,
    pub total_steps: u32,
    /// Set when the run was denied upfront and no phase executed.
    pub abort_reason: Option<String>,
    pub cost_usd: f64,
}

// ---------------------------------------------------------------------------
// ExecutionEngine
// ---------------------------------------------------------------------------

/// Long-lived engine instance. The compression cache, pricing table, and
/// metrics are shared across every run it starts.
pub struct ExecutionEngine {
    generation: Arc<dyn GenerationCapability>,
    compression: Option<Arc<dyn CompressionCapability>>,
    cache: CompressionCache,
    observer: Option<Arc<dyn StepObserver>>,
    ledger: Option<Arc<BudgetEnforcement>>,
    pricing: PricingTable,
    config: EngineConfig,
    metrics: Arc<EngineMetrics>,
}

impl ExecutionEngine {
    pub fn new(generation: Arc<dyn GenerationCapability>) -> Self {
        let config = EngineConfig::default();
        Self {
            generation,
            compression: None,
            cache: CompressionCache::new(config.compression.cache_capacity),
            observer: None,
            ledger: None,
            pricing: PricingTable::new(),
            config,
            metrics: Arc::new(EngineMetrics::new()),
        }
    }

    /// Apply a loaded configuration. Rebuilds the compression cache at the
    /// configured capacity, dropping any cached summaries.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.cache = CompressionCache::new(config.compression.cache_capacity);
        self.config = config;
        self
    }

    pub fn with_compression(mut self, compression: Arc<dyn CompressionCapability>) -> Self {
        self.compression = Some(compression);
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<BudgetEnforcement>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn StepObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<EngineMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn ledger(&self) -> Option<Arc<BudgetEnforcement>> {
        self.ledger.clone()
    }

    pub fn cache(&self) -> &CompressionCache {
        &self.cache
    }

    /// Step-loop options seeded from this engine's configuration.
    pub fn default_options(&self) -> ManagedOptions {
        ManagedOptions::from_config(&self.config)
    }

    /// Cancel abandoned reservations past the configured age. No-op without
    /// a ledger.
    pub async fn sweep_stale_reservations(&self) -> Result<usize, EngineError> {
        match &self.ledger {
            Some(ledger) => Ok(ledger.sweep_stale_reservations().await?),
            None => Ok(0),
        }
    }

    /// Build a window manager view sharing this engine's cache, metrics, and
    /// seams. Cheap; every shared piece is reference-counted.
    fn manager(&self) -> ContextWindowManager {
        let mut manager = ContextWindowManager::new(Arc::clone(&self.generation))
            .with_cache(self.cache.clone())
            .with_metrics(Arc::clone(&self.metrics));
        if let Some(compression) = &self.compression {
            manager = manager.with_compression(Arc::clone(compression));
        }
        if let Some(ledger) = &self.ledger {
            manager = manager.with_budget(Arc::clone(ledger));
        }
        if let Some(observer) = &self.observer {
            manager = manager.with_observer(Arc::clone(observer));
        }
        manager
    }

    /// Upfront gate plus reservation. `None` means the run is denied; the
    /// inner option is the reservation id when a ledger is wired.
    async fn open_run(
        &self,
        run_id: Uuid,
        agent: &AgentProfile,
        context: &BudgetCheckContext,
    ) -> Result<Option<Option<Uuid>>, EngineError> {
        let Some(ledger) = &self.ledger else {
            return Ok(Some(None));
        };

        let check = ledger.check(context).await?;
        if !check.allowed {
            self.metrics.record_budget_denial();
            info!(run = %run_id, agent = %agent.id, "run denied by budget check");
            return Ok(None);
        }

        let reservation = ledger
            .create_reservation(run_id, context, self.config.budget.run_cost_estimate_usd)
            .await?;
        Ok(Some(Some(reservation)))
    }

    /// Settle the reservation: finalize with actual cost when the run
    /// consumed tokens, cancel otherwise. Cost is priced at the run's primary
    /// model; per-tier splits are not tracked at run granularity.
    async fn settle_run(
        &self,
        reservation: Option<Uuid>,
        model: &str,
        usage: &TokenUsage,
    ) -> Result<f64, EngineError> {
        let Some(ledger) = &self.ledger else {
            return Ok(0.0);
        };
        let Some(reservation_id) = reservation else {
            return Ok(0.0);
        };

        if usage.total() > 0 {
            let cost_usd = self.pricing.cost_for(model, usage).await;
            ledger.finalize_reservation(reservation_id, cost_usd).await?;
            Ok(cost_usd)
        } else {
            ledger.cancel_reservation(reservation_id).await?;
            Ok(0.0)
        }
    }

    async fn cancel_on_failure(&self, reservation: Option<Uuid>) {
        if let (Some(ledger), Some(reservation_id)) = (&self.ledger, reservation) {
            if let Err(e) = ledger.cancel_reservation(reservation_id).await {
                warn!(reservation = %reservation_id, error = %e, "failed to release reservation");
            }
        }
    }

    // -- caller-facing runs --------------------------------------------------

    /// Run one context-managed step loop for `agent` under the full spend
    /// protocol. Budget denial is a result, not an error.
    pub async fn managed_generate(
        &self,
        agent: &AgentProfile,
        input: &str,
        options: ManagedOptions,
    ) -> Result<ManagedGenerateResult, EngineError> {
        let run_id = Uuid::new_v4();
        let mut options = options;
        if options.model.is_none() {
            options.model = Some(agent.primary_model.clone());
        }

        let context = BudgetCheckContext::from(agent);
        let reservation = match self.open_run(run_id, agent, &context).await? {
            Some(reservation) => reservation,
            None => {
                return Ok(ManagedGenerateResult {
                    run_id,
                    final_text: String::new(),
                    steps: Vec::new(),
                    records: Vec::new(),
                    usage: TokenUsage::default(),
                    steps_used: 0,
                    finish_reason: FinishReason::Aborted,
                    abort_reason: Some("budget violation: run denied before start".into()),
                    cost_usd: 0.0,
                });
            }
        };

        if self.ledger.is_some() {
            options.budget_context = Some(context);
        }

        let run = self.manager().run(input, &options).await;

        let model = options.model.as_deref().unwrap_or("");
        let cost_usd = self.settle_run(reservation, model, &run.usage).await?;
        self.metrics.record_run_completed();
        debug!(
            run = %run_id,
            steps = run.steps_used,
            cost = cost_usd,
            finish = %run.finish_reason,
            "managed run settled"
        );

        Ok(ManagedGenerateResult {
            run_id,
            final_text: run.final_text,
            steps: run.steps,
            records: run.records,
            usage: run.usage,
            steps_used: run.steps_used,
            finish_reason: run.finish_reason,
            abort_reason: run.abort_reason,
            cost_usd,
        })
    }

    /// Run a phase set for `agent` under the full spend protocol. Phase
    /// configuration errors (duplicate ids, unknown dependencies, cycles)
    /// release the reservation and propagate.
    pub async fn run_phases(
        &self,
        agent: &AgentProfile,
        options: PhaseRunOptions,
    ) -> Result<ManagedPhasesResult, EngineError> {
        let run_id = Uuid::new_v4();
        let mut options = options;
        if options.base.model.is_none() {
            options.base.model = Some(agent.primary_model.clone());
        }

        let context = BudgetCheckContext::from(agent);
        let reservation = match self.open_run(run_id, agent, &context).await? {
            Some(reservation) => reservation,
            None => {
                return Ok(ManagedPhasesResult {
                    run_id,
                    phases: Vec::new(),
                    final_text: String::new(),
                    usage: TokenUsage::default(),
                    total_steps: 0,
                    abort_reason: Some("budget violation: run denied before start".into()),
                    cost_usd: 0.0,
                });
            }
        };

        if self.ledger.is_some() {
            options.base.budget_context = Some(context);
        }

        let scheduler =
            PhaseScheduler::new(Arc::new(self.manager())).with_metrics(Arc::clone(&self.metrics));
        let result = match scheduler.run_phases(&options).await {
            Ok(result) => result,
            Err(e) => {
                self.cancel_on_failure(reservation).await;
                return Err(e);
            }
        };

        let model = options.base.model.as_deref().unwrap_or("");
        let cost_usd = self.settle_run(reservation, model, &result.usage).await?;
        self.metrics.record_run_completed();
        debug!(
            run = %run_id,
            phases = result.phases.len(),
            steps = result.total_steps,
            cost = cost_usd,
            "phased run settled"
        );

        Ok(ManagedPhasesResult {
            run_id,
            phases: result.phases,
            final_text: result.final_text,
            usage: result.usage,
            total_steps: result.total_steps,
            abort_reason: None,
            cost_usd,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::MockGeneration;
    use pacer_core::config::CompressionConfig;

    #[test]
    fn with_config_rebuilds_cache_capacity() {
        let config = EngineConfig {
            compression: CompressionConfig {
                cache_capacity: 7,
                ..CompressionConfig::default()
            },
            ..EngineConfig::default()
        };
        let engine =
            ExecutionEngine::new(Arc::new(MockGeneration::new())).with_config(config);
        assert_eq!(engine.cache().capacity(), 7);
    }

    #[test]
    fn default_options_reflect_config() {
        let engine = ExecutionEngine::new(Arc::new(MockGeneration::new()));
        let options = engine.default_options();
        assert_eq!(options.max_steps, engine.config().step.max_steps);
        assert_eq!(
            options.compression_threshold_chars,
            engine.config().compression.threshold_chars
        );
    }

    #[tokio::test]
    async fn sweep_without_ledger_is_a_noop() {
        let engine = ExecutionEngine::new(Arc::new(MockGeneration::new()));
        assert_eq!(engine.sweep_stale_reservations().await.unwrap(), 0);
    }
}
