//! Spend-governance ledger: monthly budget checks over a cost-event store,
//! a create/finalize/cancel reservation protocol, and deduplicated alerting.

use uuid::Uuid;

pub mod alerts;
pub mod enforcement;
pub mod policy;
pub mod pricing;
pub mod store;

pub use alerts::{AlertDispatcher, AlertKind, AlertSink, BudgetAlert, RecordingAlertSink, TracingAlertSink};
pub use enforcement::{
    month_start, BudgetCheckContext, BudgetCheckResult, BudgetEnforcement, BudgetLevel,
    BudgetViolation,
};
pub use policy::{BudgetPolicies, LevelPolicy, SubscriptionPolicy};
pub use pricing::{default_pricing_table, ModelPricing, PricingTable};
pub use store::{CostEvent, CostEventStatus, CostEventStore, CostScope, MemoryCostEventStore};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("invalid budget policy: {0}")]
    InvalidPolicy(String),

    #[error("cost event store error: {0}")]
    Store(String),

    #[error("alert sink error: {0}")]
    AlertSink(String),
}
