//! Integration tests for the budget-wrapped run surface: reservation
//! lifecycle, cost settlement, and denial behavior.

use pacer_core::types::{AgentProfile, FinishReason, Phase};
use pacer_engine::{
    CapabilityError, EngineError, ExecutionEngine, MockGeneration, PhaseRunOptions, StepOutcome,
};
use pacer_ledger::{
    BudgetCheckContext, BudgetEnforcement, CostEventStatus, LevelPolicy, MemoryCostEventStore,
};
use serde_json::json;
use std::sync::Arc;

fn ledger_over(store: &MemoryCostEventStore) -> Arc<BudgetEnforcement> {
    Arc::new(BudgetEnforcement::new(Arc::new(store.clone())))
}

/// Exhaust the agent's monthly budget so the next check denies.
async fn exhaust_agent(ledger: &BudgetEnforcement, agent: &AgentProfile) {
    ledger
        .policies()
        .set_agent_policy(agent.id, LevelPolicy::hard(50.0))
        .await
        .unwrap();
    let context = BudgetCheckContext::for_agent(agent.id);
    ledger.record_spend(&context, 60.0, None).await.unwrap();
}

// -- managed_generate --

#[tokio::test]
async fn run_without_ledger_costs_nothing() {
    let mock = MockGeneration::new().with_outcome(StepOutcome::text("done").with_usage(100, 20));
    let engine = ExecutionEngine::new(Arc::new(mock));
    let agent = AgentProfile::new("coder", "primary-v1");

    let result = engine
        .managed_generate(&agent, "write it", engine.default_options())
        .await
        .unwrap();

    assert_eq!(result.finish_reason, FinishReason::Complete);
    assert_eq!(result.final_text, "done");
    assert_eq!(result.cost_usd, 0.0);
}

#[tokio::test]
async fn completed_run_finalizes_reservation_at_priced_cost() {
    let mock = MockGeneration::new()
        .with_outcome(StepOutcome::text("done").with_usage(1_000_000, 1_000_000));
    let store = MemoryCostEventStore::new();
    let engine = ExecutionEngine::new(Arc::new(mock)).with_ledger(ledger_over(&store));
    let agent = AgentProfile::new("coder", "primary-v1");

    let result = engine
        .managed_generate(&agent, "write it", engine.default_options())
        .await
        .unwrap();

    // primary-v1 default rates: $3/1M in + $15/1M out.
    assert_eq!(result.finish_reason, FinishReason::Complete);
    assert!((result.cost_usd - 18.0).abs() < 1e-9);

    let records = store.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, CostEventStatus::Finalized);
    assert!((records[0].amount_usd - 18.0).abs() < 1e-9);
    assert_eq!(records[0].agent_id, agent.id);
    assert_eq!(records[0].run_id, Some(result.run_id));

    assert_eq!(engine.metrics().steps_executed(), 1);
    assert_eq!(engine.metrics().runs_completed(), 1);
    assert_eq!(engine.metrics().budget_denials(), 0);
}

#[tokio::test]
async fn denied_run_reserves_nothing_and_calls_nothing() {
    let mock =
        MockGeneration::new().with_outcome(StepOutcome::text("unused").with_usage(10, 10));
    let store = MemoryCostEventStore::new();
    let ledger = ledger_over(&store);
    let agent = AgentProfile::new("coder", "primary-v1");
    exhaust_agent(&ledger, &agent).await;

    let engine = ExecutionEngine::new(Arc::new(mock.clone())).with_ledger(ledger);
    let result = engine
        .managed_generate(&agent, "task", engine.default_options())
        .await
        .unwrap();

    assert_eq!(result.finish_reason, FinishReason::Aborted);
    assert_eq!(
        result.abort_reason.as_deref(),
        Some("budget violation: run denied before start")
    );
    assert_eq!(result.cost_usd, 0.0);
    assert_eq!(mock.call_count().await, 0);

    // Only the seeded spend exists; no reservation was ever appended.
    let records = store.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, CostEventStatus::Finalized);
    assert_eq!(engine.metrics().budget_denials(), 1);
}

#[tokio::test]
async fn zero_usage_run_cancels_the_reservation() {
    let mock = MockGeneration::new();
    let store = MemoryCostEventStore::new();
    let engine = ExecutionEngine::new(Arc::new(mock.clone())).with_ledger(ledger_over(&store));
    let agent = AgentProfile::new("coder", "primary-v1");

    // Context estimate blows the token budget before any generation call.
    let options = engine.default_options().with_max_context_tokens(5);
    let result = engine
        .managed_generate(&agent, &"x".repeat(100), options)
        .await
        .unwrap();

    assert_eq!(result.finish_reason, FinishReason::Aborted);
    assert_eq!(result.cost_usd, 0.0);
    assert_eq!(mock.call_count().await, 0);

    let records = store.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, CostEventStatus::Cancelled);
    assert_eq!(records[0].amount_usd, 0.0);
}

#[tokio::test]
async fn failed_run_still_settles_consumed_usage() {
    let mock = MockGeneration::new()
        .with_outcome(
            StepOutcome::tool_exchange("search", json!({"q": "docs"}), "found")
                .with_usage(500_000, 0),
        )
        .with_error(CapabilityError::Timeout(30));
    let store = MemoryCostEventStore::new();
    let engine = ExecutionEngine::new(Arc::new(mock)).with_ledger(ledger_over(&store));
    let agent = AgentProfile::new("coder", "primary-v1");

    let result = engine
        .managed_generate(&agent, "task", engine.default_options())
        .await
        .unwrap();

    assert_eq!(result.finish_reason, FinishReason::Error);
    // 500k prompt tokens at $3/1M; the failed second step consumed nothing.
    assert!((result.cost_usd - 1.5).abs() < 1e-9);

    let records = store.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, CostEventStatus::Finalized);
    assert!((records[0].amount_usd - 1.5).abs() < 1e-9);
    assert_eq!(engine.metrics().generation_failures(), 1);
}

// -- run_phases --

#[tokio::test]
async fn phased_run_settles_aggregate_cost() {
    let mock = MockGeneration::new()
        .with_outcome(StepOutcome::text("plan ready").with_usage(1_000_000, 0))
        .with_outcome(StepOutcome::text("build ready").with_usage(0, 1_000_000));
    let store = MemoryCostEventStore::new();
    let engine = ExecutionEngine::new(Arc::new(mock)).with_ledger(ledger_over(&store));
    let agent = AgentProfile::new("coder", "primary-v1");

    let phases = vec![
        Phase::new("plan", "Plan", "lay out the steps"),
        Phase::new("build", "Build", "carry them out"),
    ];
    let result = engine
        .run_phases(&agent, PhaseRunOptions::new(phases, "ship the feature"))
        .await
        .unwrap();

    assert!(result.abort_reason.is_none());
    assert_eq!(result.phases.len(), 2);
    assert_eq!(result.final_text, "build ready");
    assert_eq!(result.total_steps, 2);
    assert!((result.cost_usd - 18.0).abs() < 1e-9);

    let records = store.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, CostEventStatus::Finalized);

    assert_eq!(engine.metrics().phases_completed(), 2);
    assert_eq!(engine.metrics().runs_completed(), 1);
}

#[tokio::test]
async fn denied_phased_run_executes_no_phase() {
    let mock = MockGeneration::new().with_outcome(StepOutcome::text("unused"));
    let store = MemoryCostEventStore::new();
    let ledger = ledger_over(&store);
    let agent = AgentProfile::new("coder", "primary-v1");
    exhaust_agent(&ledger, &agent).await;

    let engine = ExecutionEngine::new(Arc::new(mock.clone())).with_ledger(ledger);
    let phases = vec![Phase::new("plan", "Plan", "lay out the steps")];
    let result = engine
        .run_phases(&agent, PhaseRunOptions::new(phases, "task"))
        .await
        .unwrap();

    assert!(result.phases.is_empty());
    assert_eq!(
        result.abort_reason.as_deref(),
        Some("budget violation: run denied before start")
    );
    assert_eq!(mock.call_count().await, 0);
}

#[tokio::test]
async fn invalid_phase_set_releases_the_reservation() {
    let mock = MockGeneration::new();
    let store = MemoryCostEventStore::new();
    let engine = ExecutionEngine::new(Arc::new(mock)).with_ledger(ledger_over(&store));
    let agent = AgentProfile::new("coder", "primary-v1");

    let phases = vec![
        Phase::new("plan", "Plan", "a"),
        Phase::new("plan", "Plan", "b"),
    ];
    let err = engine
        .run_phases(&agent, PhaseRunOptions::new(phases, "task"))
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::DuplicatePhase { ref id } if id == "plan"));
    let records = store.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, CostEventStatus::Cancelled);
}

// -- sweep --

#[tokio::test]
async fn sweep_cancels_only_stale_reservations() {
    use chrono::{Duration, Utc};
    use pacer_ledger::{CostEvent, CostEventStore};
    use uuid::Uuid;

    let store = MemoryCostEventStore::new();
    let agent_id = Uuid::new_v4();
    let stale = CostEvent::reservation(Uuid::new_v4(), agent_id, 1.0)
        .with_created_at(Utc::now() - Duration::hours(2));
    let stale_id = store.append(stale).await.unwrap();
    let fresh_id = store
        .append(CostEvent::reservation(Uuid::new_v4(), agent_id, 1.0))
        .await
        .unwrap();

    let engine = ExecutionEngine::new(Arc::new(MockGeneration::new()))
        .with_ledger(ledger_over(&store));
    let swept = engine.sweep_stale_reservations().await.unwrap();
    assert_eq!(swept, 1);

    let records = store.records().await;
    let stale_event = records.iter().find(|r| r.id == stale_id).unwrap();
    let fresh_event = records.iter().find(|r| r.id == fresh_id).unwrap();
    assert_eq!(stale_event.status, CostEventStatus::Cancelled);
    assert_eq!(fresh_event.status, CostEventStatus::Reserved);
}
