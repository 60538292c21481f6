use pacer_core::types::TokenUsage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

// ---------------------------------------------------------------------------
// ModelPricing
// ---------------------------------------------------------------------------

/// Cost rates for one model identity, in USD per million tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub model: String,
    pub input_cost_per_1m: f64,
    pub output_cost_per_1m: f64,
}

impl ModelPricing {
    pub fn new(model: impl Into<String>, input_cost_per_1m: f64, output_cost_per_1m: f64) -> Self {
        Self {
            model: model.into(),
            input_cost_per_1m,
            output_cost_per_1m,
        }
    }

    pub fn cost_for(&self, usage: &TokenUsage) -> f64 {
        let input = usage.prompt_tokens as f64 / 1_000_000.0 * self.input_cost_per_1m;
        let output = usage.completion_tokens as f64 / 1_000_000.0 * self.output_cost_per_1m;
        input + output
    }
}

/// Rates for the generic tier models used when no deployment-specific table
/// has been loaded.
pub fn default_pricing_table() -> Vec<ModelPricing> {
    vec![
        ModelPricing::new("fast-v1", 0.25, 1.25),
        ModelPricing::new("primary-v1", 3.00, 15.00),
        ModelPricing::new("escalation-v1", 5.00, 25.00),
        ModelPricing::new("reasoning-v1", 10.00, 40.00),
    ]
}

// ---------------------------------------------------------------------------
// PricingTable
// ---------------------------------------------------------------------------

/// Shared model → rates lookup used to settle reservations.
#[derive(Debug, Clone)]
pub struct PricingTable {
    entries: Arc<RwLock<ahash::AHashMap<String, ModelPricing>>>,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::with_entries(default_pricing_table())
    }
}

impl PricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty table; every lookup will miss until rates are loaded.
    pub fn empty() -> Self {
        Self {
            entries: Arc::new(RwLock::new(ahash::AHashMap::new())),
        }
    }

    pub fn with_entries(entries: Vec<ModelPricing>) -> Self {
        let map = entries
            .into_iter()
            .map(|p| (p.model.clone(), p))
            .collect::<ahash::AHashMap<_, _>>();
        Self {
            entries: Arc::new(RwLock::new(map)),
        }
    }

    pub async fn set_pricing(&self, pricing: ModelPricing) {
        self.entries
            .write()
            .await
            .insert(pricing.model.clone(), pricing);
    }

    pub async fn lookup(&self, model: &str) -> Option<ModelPricing> {
        self.entries.read().await.get(model).cloned()
    }

    /// Cost of `usage` on `model`; unknown models price at zero and log,
    /// matching the convention that missing rates are a configuration gap,
    /// not a run failure.
    pub async fn cost_for(&self, model: &str, usage: &TokenUsage) -> f64 {
        match self.lookup(model).await {
            Some(pricing) => pricing.cost_for(usage),
            None => {
                warn!(model = model, "no pricing entry for model; costing at zero");
                0.0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_scales_with_usage() {
        let pricing = ModelPricing::new("primary-v1", 3.0, 15.0);
        let usage = TokenUsage::new(1_000_000, 1_000_000);
        assert!((pricing.cost_for(&usage) - 18.0).abs() < 1e-9);

        let small = TokenUsage::new(500_000, 0);
        assert!((pricing.cost_for(&small) - 1.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn table_lookup_and_override() {
        let table = PricingTable::new();
        assert!(table.lookup("fast-v1").await.is_some());

        table
            .set_pricing(ModelPricing::new("fast-v1", 0.10, 0.50))
            .await;
        let updated = table.lookup("fast-v1").await.unwrap();
        assert_eq!(updated.input_cost_per_1m, 0.10);
    }

    #[tokio::test]
    async fn unknown_model_costs_zero() {
        let table = PricingTable::empty();
        let usage = TokenUsage::new(1000, 1000);
        assert_eq!(table.cost_for("mystery", &usage).await, 0.0);
    }
}
