use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

const DEFAULT_MAX_STEPS: u32 = 12;
const DEFAULT_WINDOW_SIZE: usize = 6;
const DEFAULT_ANCHOR_INTERVAL: u32 = 5;
const DEFAULT_MAX_CONTEXT_TOKENS: u64 = 60_000;

const DEFAULT_COMPRESSION_THRESHOLD_CHARS: usize = 2_000;
const DEFAULT_CONDENSED_MAX_CHARS: usize = 600;
const DEFAULT_CACHE_CAPACITY: usize = 200;

const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.75;

const DEFAULT_RESERVATION_MAX_AGE_MINUTES: i64 = 30;
const DEFAULT_ALERT_WINDOW_MINUTES: i64 = 60;
const DEFAULT_RUN_COST_ESTIMATE_USD: f64 = 0.50;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("config validation error: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Step-loop bounds applied to every managed run unless overridden per call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StepConfig {
    /// Hard cap on generation steps per phase.
    pub max_steps: u32,
    /// How many recent tool exchanges stay in context verbatim.
    pub window_size: usize,
    /// Re-anchor instructions every N steps.
    pub anchor_interval: u32,
    /// Context budget as an estimated token count.
    pub max_context_tokens: u64,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            window_size: DEFAULT_WINDOW_SIZE,
            anchor_interval: DEFAULT_ANCHOR_INTERVAL,
            max_context_tokens: DEFAULT_MAX_CONTEXT_TOKENS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Tool results larger than this many characters get condensed.
    pub threshold_chars: usize,
    /// Upper bound on the condensed form.
    pub condensed_max_chars: usize,
    /// Entry cap on the compression cache before oldest-first eviction.
    pub cache_capacity: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold_chars: DEFAULT_COMPRESSION_THRESHOLD_CHARS,
            condensed_max_chars: DEFAULT_CONDENSED_MAX_CHARS,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

/// Per-tier model identities. A tier without an override resolves to the
/// agent's primary model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TierOverrides {
    pub fast: Option<String>,
    pub primary: Option<String>,
    pub escalation: Option<String>,
    pub reasoning: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// When false every step targets the primary model.
    pub enabled: bool,
    /// Minimum classifier score before escalation is considered.
    pub confidence_threshold: f64,
    /// Downgrade moderate-complexity steps to the fast tier under budget
    /// pressure.
    pub budget_pressure_downgrade: bool,
    pub tiers: TierOverrides,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            budget_pressure_downgrade: true,
            tiers: TierOverrides::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Reservations older than this and never finalized get swept.
    pub reservation_max_age_minutes: i64,
    /// Dedup window for repeated budget alerts of the same kind.
    pub alert_window_minutes: i64,
    /// Provisional cost attached to a reservation before any usage exists.
    pub run_cost_estimate_usd: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            reservation_max_age_minutes: DEFAULT_RESERVATION_MAX_AGE_MINUTES,
            alert_window_minutes: DEFAULT_ALERT_WINDOW_MINUTES,
            run_cost_estimate_usd: DEFAULT_RUN_COST_ESTIMATE_USD,
        }
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub step: StepConfig,
    pub compression: CompressionConfig,
    pub routing: RoutingConfig,
    pub budget: BudgetConfig,
}

impl EngineConfig {
    /// Load from a TOML file; missing sections fall back to defaults.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: EngineConfig =
            toml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Reject configurations that would make the engine loop degenerate.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.step.max_steps == 0 {
            return Err(Self::reject("step.max_steps must be at least 1"));
        }
        if self.step.window_size == 0 {
            return Err(Self::reject("step.window_size must be at least 1"));
        }
        if self.step.anchor_interval == 0 {
            return Err(Self::reject("step.anchor_interval must be at least 1"));
        }
        if self.step.max_context_tokens == 0 {
            return Err(Self::reject("step.max_context_tokens must be at least 1"));
        }
        if self.compression.threshold_chars == 0 {
            return Err(Self::reject("compression.threshold_chars must be at least 1"));
        }
        if self.compression.condensed_max_chars == 0 {
            return Err(Self::reject(
                "compression.condensed_max_chars must be at least 1",
            ));
        }
        if self.compression.cache_capacity == 0 {
            return Err(Self::reject("compression.cache_capacity must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.routing.confidence_threshold) {
            return Err(Self::reject(
                "routing.confidence_threshold must be within 0.0..=1.0",
            ));
        }
        if self.budget.reservation_max_age_minutes <= 0 {
            return Err(Self::reject(
                "budget.reservation_max_age_minutes must be positive",
            ));
        }
        if self.budget.alert_window_minutes <= 0 {
            return Err(Self::reject("budget.alert_window_minutes must be positive"));
        }
        if self.budget.run_cost_estimate_usd < 0.0 {
            return Err(Self::reject(
                "budget.run_cost_estimate_usd must not be negative",
            ));
        }
        Ok(())
    }

    fn reject(rule: &str) -> ConfigError {
        warn!(rule = rule, "engine config rejected");
        ConfigError::Validation(rule.into())
    }
}
