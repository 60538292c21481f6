//! Heuristic model routing for cost-efficient step execution.
//!
//! Scores input complexity from surface features (length, multi-step
//! phrasing, code, keywords) and maps the score to a model tier:
//! - simple → fast tier (cheap model)
//! - moderate → primary tier, downgraded to fast under budget pressure
//! - complex → escalation tier once the score clears the confidence threshold
//! - reasoning-demanding input → reasoning tier when one is configured
//!
//! Routing is advisory: it picks which model a step targets, never whether
//! the step runs at all.

use pacer_core::config::RoutingConfig;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Scoring weights
// ---------------------------------------------------------------------------

const WEIGHT_MULTI_STEP: f64 = 0.25;
const WEIGHT_KEYWORD_HIT: f64 = 0.10;
const MAX_KEYWORD_HITS: usize = 3;
const WEIGHT_CODE: f64 = 0.20;
const WEIGHT_GREETING: f64 = -0.40;
const WEIGHT_SIMPLE_QUESTION: f64 = -0.20;
const SIMPLE_QUESTION_MAX_WORDS: usize = 12;

const SIMPLE_CEILING: f64 = 0.35;
const MODERATE_CEILING: f64 = 0.65;
const REASONING_SCORE_FLOOR: f64 = 0.85;

// ---------------------------------------------------------------------------
// Patterns
// ---------------------------------------------------------------------------

fn multi_step_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(step\s*\d+|first,|then,|after that|finally|followed by)")
            .expect("valid multi-step pattern")
    })
}

fn complex_keyword_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(analyze|analyse|architecture|architect|refactor|optimize|optimise|debug|implement|design|integrate|migrate|distributed|concurrency|concurrent|algorithm|benchmark|scalability)\b",
        )
        .expect("valid keyword pattern")
    })
}

fn code_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?m)^\s*(pub\s+fn\s|fn\s+\w+|def\s+\w+|class\s+\w+|import\s+\w+|#include\s|let\s+\w+\s*=|const\s+\w+)",
        )
        .expect("valid code pattern")
    })
}

fn greeting_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*(hi|hello|hey|thank you|thanks|good (morning|afternoon|evening))[\s!.,]*$")
            .expect("valid greeting pattern")
    })
}

fn reasoning_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(prove|proof|theorem|derive|derivation|formally|rigorous|first principles|chain of thought)\b")
            .expect("valid reasoning pattern")
    })
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Complexity band for an input, derived from its clamped score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityLevel {
    Simple,
    Moderate,
    Complex,
}

impl fmt::Display for ComplexityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Simple => "simple",
            Self::Moderate => "moderate",
            Self::Complex => "complex",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// Weighted heuristic score clamped to [0, 1].
    pub score: f64,
    pub level: ComplexityLevel,
    /// Input demands a reasoning-tier model when one is configured.
    pub needs_reasoning: bool,
}

/// Score input complexity from surface features.
///
/// Word-count bands set the base score; multi-step phrasing, complexity
/// keywords (capped at three hits), and code presence add to it; greetings
/// and short questions subtract. Purely lexical, no model calls.
pub fn classify_complexity(text: &str) -> Classification {
    let trimmed = text.trim();
    let word_count = trimmed.split_whitespace().count();

    let mut score: f64 = match word_count {
        0..=9 => 0.0,
        10..=49 => 0.10,
        50..=119 => 0.25,
        _ => 0.35,
    };

    if multi_step_re().is_match(trimmed) {
        score += WEIGHT_MULTI_STEP;
    }

    let keyword_hits = complex_keyword_re()
        .find_iter(trimmed)
        .take(MAX_KEYWORD_HITS)
        .count();
    score += keyword_hits as f64 * WEIGHT_KEYWORD_HIT;

    if trimmed.contains("```") || code_line_re().is_match(trimmed) {
        score += WEIGHT_CODE;
    }

    if greeting_re().is_match(trimmed) {
        score += WEIGHT_GREETING;
    }
    if trimmed.ends_with('?') && word_count < SIMPLE_QUESTION_MAX_WORDS {
        score += WEIGHT_SIMPLE_QUESTION;
    }

    let score = score.clamp(0.0, 1.0);
    let level = if score < SIMPLE_CEILING {
        ComplexityLevel::Simple
    } else if score < MODERATE_CEILING {
        ComplexityLevel::Moderate
    } else {
        ComplexityLevel::Complex
    };
    let needs_reasoning = reasoning_re().is_match(trimmed) || score >= REASONING_SCORE_FLOOR;

    Classification {
        score,
        level,
        needs_reasoning,
    }
}

// ---------------------------------------------------------------------------
// Routing decision
// ---------------------------------------------------------------------------

/// Model tiers ordered from cheapest to most capable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Fast,
    Primary,
    Escalation,
    Reasoning,
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Fast => "fast",
            Self::Primary => "primary",
            Self::Escalation => "escalation",
            Self::Reasoning => "reasoning",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub tier: ModelTier,
    /// Resolved model identity for the step's generation call.
    pub model: String,
    /// Why this tier was selected.
    pub reason: String,
}

fn tier_model(overridden: Option<&String>, primary_model: &str) -> String {
    overridden
        .cloned()
        .unwrap_or_else(|| primary_model.to_string())
}

/// Map a classification to a model tier under the routing config.
///
/// `budget_exceeded` reflects warning-level budget pressure from the caller;
/// with downgrade enabled it pushes moderate input onto the fast tier.
pub fn resolve_routing_decision(
    config: &RoutingConfig,
    primary_model: &str,
    input: &str,
    budget_exceeded: bool,
) -> RoutingDecision {
    if !config.enabled {
        return RoutingDecision {
            tier: ModelTier::Primary,
            model: primary_model.to_string(),
            reason: "routing disabled".into(),
        };
    }

    let classification = classify_complexity(input);

    // Reasoning demand trumps band routing when a reasoning model exists,
    // but never for clearly simple input.
    if classification.needs_reasoning && classification.level != ComplexityLevel::Simple {
        if let Some(model) = &config.tiers.reasoning {
            return RoutingDecision {
                tier: ModelTier::Reasoning,
                model: model.clone(),
                reason: format!("reasoning demanded (score {:.2})", classification.score),
            };
        }
    }

    let decision = match classification.level {
        ComplexityLevel::Simple => RoutingDecision {
            tier: ModelTier::Fast,
            model: tier_model(config.tiers.fast.as_ref(), primary_model),
            reason: format!("simple input (score {:.2})", classification.score),
        },
        ComplexityLevel::Moderate => {
            if budget_exceeded && config.budget_pressure_downgrade {
                RoutingDecision {
                    tier: ModelTier::Fast,
                    model: tier_model(config.tiers.fast.as_ref(), primary_model),
                    reason: format!(
                        "moderate input downgraded under budget pressure (score {:.2})",
                        classification.score
                    ),
                }
            } else {
                RoutingDecision {
                    tier: ModelTier::Primary,
                    model: tier_model(config.tiers.primary.as_ref(), primary_model),
                    reason: format!("moderate input (score {:.2})", classification.score),
                }
            }
        }
        ComplexityLevel::Complex => {
            if classification.score >= config.confidence_threshold {
                if let Some(model) = &config.tiers.escalation {
                    return RoutingDecision {
                        tier: ModelTier::Escalation,
                        model: model.clone(),
                        reason: format!(
                            "complex input escalated (score {:.2} >= threshold {:.2})",
                            classification.score, config.confidence_threshold
                        ),
                    };
                }
            }
            RoutingDecision {
                tier: ModelTier::Primary,
                model: tier_model(config.tiers.primary.as_ref(), primary_model),
                reason: format!("complex input (score {:.2})", classification.score),
            }
        }
    };

    tracing::debug!(
        tier = %decision.tier,
        model = %decision.model,
        score = classification.score,
        "routing decision"
    );
    decision
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use pacer_core::config::TierOverrides;

    fn full_config() -> RoutingConfig {
        RoutingConfig {
            enabled: true,
            confidence_threshold: 0.75,
            budget_pressure_downgrade: true,
            tiers: TierOverrides {
                fast: Some("fast-v1".into()),
                primary: Some("primary-v1".into()),
                escalation: Some("escalation-v1".into()),
                reasoning: Some("reasoning-v1".into()),
            },
        }
    }

    // Long multi-step input with a code block: 0.35 + 0.25 + 0.20 = 0.80,
    // under the reasoning floor so band routing applies.
    fn complex_input() -> String {
        let filler = "the pipeline ingests events and writes aggregates downstream ".repeat(25);
        format!("step 1: read the failure. step 2: apply a fix.\n```\nfn main() {{}}\n```\n{filler}")
    }

    // -- Classification --

    #[test]
    fn greeting_classifies_simple() {
        let c = classify_complexity("hi");
        assert_eq!(c.level, ComplexityLevel::Simple);
        assert_eq!(c.score, 0.0);
        assert!(!c.needs_reasoning);
    }

    #[test]
    fn short_question_classifies_simple() {
        let c = classify_complexity("what time is it?");
        assert_eq!(c.level, ComplexityLevel::Simple);
    }

    #[test]
    fn multi_step_code_input_classifies_complex() {
        let c = classify_complexity(&complex_input());
        assert_eq!(c.level, ComplexityLevel::Complex);
        assert!(c.score >= 0.75);
    }

    #[test]
    fn keyword_hits_cap_at_three() {
        // Six keyword hits in under ten words still only add 0.30.
        let c = classify_complexity("analyze refactor debug implement migrate benchmark");
        assert!(c.score <= 0.30 + 1e-9);
    }

    #[test]
    fn score_clamps_to_unit_interval() {
        let loaded = format!("{} analyze refactor debug implement", complex_input());
        let c = classify_complexity(&loaded);
        assert_eq!(c.score, 1.0);
        let g = classify_complexity("thanks!");
        assert!(g.score >= 0.0);
    }

    #[test]
    fn reasoning_keyword_sets_flag() {
        let c = classify_complexity(
            "prove that the scheduler terminates, working from first principles across the dependency graph",
        );
        assert!(c.needs_reasoning);
    }

    // -- Routing --

    #[test]
    fn disabled_routing_targets_primary_model() {
        let mut config = full_config();
        config.enabled = false;
        let decision = resolve_routing_decision(&config, "agent-model", "hi", false);
        assert_eq!(decision.tier, ModelTier::Primary);
        assert_eq!(decision.model, "agent-model");
    }

    #[test]
    fn simple_input_routes_fast() {
        let decision = resolve_routing_decision(&full_config(), "agent-model", "hi", false);
        assert_eq!(decision.tier, ModelTier::Fast);
        assert_eq!(decision.model, "fast-v1");
    }

    #[test]
    fn moderate_input_routes_primary() {
        let input = "first, read the config file and then, summarize what it sets";
        let decision = resolve_routing_decision(&full_config(), "agent-model", input, false);
        assert_eq!(decision.tier, ModelTier::Primary);
    }

    #[test]
    fn budget_pressure_downgrades_moderate_to_fast() {
        let input = "first, read the config file and then, summarize what it sets";
        let decision = resolve_routing_decision(&full_config(), "agent-model", input, true);
        assert_eq!(decision.tier, ModelTier::Fast);
        assert!(decision.reason.contains("budget pressure"));
    }

    #[test]
    fn budget_pressure_never_downgrades_complex() {
        let decision =
            resolve_routing_decision(&full_config(), "agent-model", &complex_input(), true);
        assert_ne!(decision.tier, ModelTier::Fast);
    }

    #[test]
    fn complex_input_over_threshold_escalates() {
        let decision =
            resolve_routing_decision(&full_config(), "agent-model", &complex_input(), false);
        assert_eq!(decision.tier, ModelTier::Escalation);
        assert_eq!(decision.model, "escalation-v1");
    }

    #[test]
    fn complex_without_escalation_model_stays_primary() {
        let mut config = full_config();
        config.tiers.escalation = None;
        let decision =
            resolve_routing_decision(&config, "agent-model", &complex_input(), false);
        assert_eq!(decision.tier, ModelTier::Primary);
    }

    // Moderate band (word count + multi-step) with reasoning keywords.
    fn reasoning_input() -> &'static str {
        "first, prove the retry loop terminates and then, derive its worst-case \
         step bound covering every branch of the dependency resolution path"
    }

    #[test]
    fn reasoning_demand_routes_reasoning_tier() {
        let decision =
            resolve_routing_decision(&full_config(), "agent-model", reasoning_input(), false);
        assert_eq!(decision.tier, ModelTier::Reasoning);
        assert_eq!(decision.model, "reasoning-v1");
    }

    #[test]
    fn reasoning_without_configured_model_falls_through() {
        let mut config = full_config();
        config.tiers.reasoning = None;
        let decision =
            resolve_routing_decision(&config, "agent-model", reasoning_input(), false);
        assert_ne!(decision.tier, ModelTier::Reasoning);
    }

    #[test]
    fn unset_tier_override_falls_back_to_primary_model() {
        let config = RoutingConfig::default();
        let decision = resolve_routing_decision(&config, "agent-model", "hi", false);
        assert_eq!(decision.tier, ModelTier::Fast);
        assert_eq!(decision.model, "agent-model");
    }

    #[test]
    fn tier_serialization_is_snake_case() {
        let json = serde_json::to_string(&ModelTier::Escalation).unwrap();
        assert_eq!(json, "\"escalation\"");
    }
}
