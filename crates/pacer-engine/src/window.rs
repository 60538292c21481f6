//! Token-budgeted context window management for bounded step loops.
//!
//! Drives one phase of agent work as an explicit state machine:
//! check budgets, assemble a pruned message window, make exactly one
//! generation call, fold tool results back into context, and advance until
//! the step budget, the context budget, or a final text ends the run.
//!
//! Window policy per step: the original request is always retained (pinned
//! for provider-side prompt caching); tool exchanges older than the window
//! collapse into a single summary block; the most recent `window_size`
//! exchanges travel verbatim. Instructions are re-anchored with a progress
//! reminder every `anchor_interval` steps to counteract drift on long runs.

use crate::capability::{CompressionCapability, GenerationCapability, StepOutcome, StepRequest};
use crate::compress::CompressionCache;
use crate::router::{resolve_routing_decision, ModelTier};
use pacer_core::config::{EngineConfig, RoutingConfig};
use pacer_core::tokens::{estimate_request_tokens, preview};
use pacer_core::types::{FinishReason, ManagedMessage, StepSummary, TokenUsage, ToolCallRecord};
use pacer_ledger::{BudgetCheckContext, BudgetEnforcement};
use pacer_telemetry::EngineMetrics;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

const TOOL_INPUT_PREVIEW_CHARS: usize = 200;
const TOOL_OUTPUT_PREVIEW_CHARS: usize = 400;
/// How many recent tool calls a progress anchor lists.
const PROGRESS_ANCHOR_CALLS: usize = 5;

// ---------------------------------------------------------------------------
// Step observer
// ---------------------------------------------------------------------------

/// Receives one [`StepSummary`] per generation step, for external
/// observability. Implementations must not block.
pub trait StepObserver: Send + Sync {
    fn on_step(&self, summary: &StepSummary);
}

/// Observer that stores every summary, for tests and diagnostics.
#[derive(Default)]
pub struct RecordingStepObserver {
    summaries: Mutex<Vec<StepSummary>>,
}

impl RecordingStepObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn summaries(&self) -> Vec<StepSummary> {
        self.summaries.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl StepObserver for RecordingStepObserver {
    fn on_step(&self, summary: &StepSummary) {
        if let Ok(mut summaries) = self.summaries.lock() {
            summaries.push(summary.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Options / result
// ---------------------------------------------------------------------------

/// Per-run knobs for the context window manager. Start from [`ManagedOptions::new`]
/// or [`ManagedOptions::from_config`] and override with the builder methods.
#[derive(Debug, Clone)]
pub struct ManagedOptions {
    /// Base instructions sent alongside every step.
    pub instructions: Option<String>,
    pub max_steps: u32,
    pub max_context_tokens: u64,
    /// Recent tool exchanges kept verbatim in the window.
    pub window_size: usize,
    /// Re-anchor instructions every N steps.
    pub anchor_interval: u32,
    pub compression_threshold_chars: usize,
    pub condensed_max_chars: usize,
    /// Model identity used when no tier override applies.
    pub model: Option<String>,
    pub allowed_tools: Option<Vec<String>>,
    pub routing: RoutingConfig,
    /// When set (and the manager holds budget enforcement), spend is checked
    /// before every step.
    pub budget_context: Option<BudgetCheckContext>,
}

impl ManagedOptions {
    pub fn new() -> Self {
        Self::from_config(&EngineConfig::default())
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            instructions: None,
            max_steps: config.step.max_steps,
            max_context_tokens: config.step.max_context_tokens,
            window_size: config.step.window_size,
            anchor_interval: config.step.anchor_interval,
            compression_threshold_chars: config.compression.threshold_chars,
            condensed_max_chars: config.compression.condensed_max_chars,
            model: None,
            allowed_tools: None,
            routing: config.routing.clone(),
            budget_context: None,
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_max_context_tokens(mut self, max_context_tokens: u64) -> Self {
        self.max_context_tokens = max_context_tokens;
        self
    }

    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size;
        self
    }

    pub fn with_anchor_interval(mut self, anchor_interval: u32) -> Self {
        self.anchor_interval = anchor_interval;
        self
    }

    pub fn with_compression_threshold(mut self, threshold_chars: usize) -> Self {
        self.compression_threshold_chars = threshold_chars;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_allowed_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_tools = Some(tools.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_routing(mut self, routing: RoutingConfig) -> Self {
        self.routing = routing;
        self
    }

    pub fn with_budget_context(mut self, context: BudgetCheckContext) -> Self {
        self.budget_context = Some(context);
        self
    }
}

impl Default for ManagedOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one managed run (one phase's worth of steps).
#[derive(Debug, Clone)]
pub struct ManagedRunResult {
    /// Final text, empty unless `finish_reason` is `Complete`.
    pub final_text: String,
    pub steps: Vec<StepSummary>,
    pub records: Vec<ToolCallRecord>,
    pub usage: TokenUsage,
    /// Generation calls that returned an outcome.
    pub steps_used: u32,
    pub finish_reason: FinishReason,
    pub abort_reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Step state machine
// ---------------------------------------------------------------------------

/// Explicit per-step states. Suspension points sit only on `AwaitGeneration`
/// (the capability call) and inside result folding (compression).
enum StepState {
    /// Budget and context gates, then request assembly.
    Gate,
    AwaitGeneration { request: StepRequest },
    FoldToolResults { outcome: StepOutcome },
    /// Step bookkeeping before the next gate.
    Advance,
    Complete { text: String },
    Abort { finish: FinishReason, reason: String },
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum OutcomeClass {
    ToolExchange,
    FinalText,
    Malfunction,
}

/// Tool calls continue the loop regardless of any text; bare text completes;
/// neither is a capability malfunction. Whitespace-only text counts as absent.
pub(crate) fn classify_outcome(outcome: &StepOutcome) -> OutcomeClass {
    if !outcome.tool_calls.is_empty() {
        return OutcomeClass::ToolExchange;
    }
    match outcome.text.as_deref() {
        Some(text) if !text.trim().is_empty() => OutcomeClass::FinalText,
        _ => OutcomeClass::Malfunction,
    }
}

// ---------------------------------------------------------------------------
// Window assembly
// ---------------------------------------------------------------------------

/// Assemble the message window for one step: pinned original request, a
/// collapsed summary block for exchanges that fell out of the window, then
/// the most recent `window_size` exchanges verbatim.
pub(crate) fn build_window(
    original: &ManagedMessage,
    exchanges: &[(u32, ManagedMessage)],
    records: &[ToolCallRecord],
    window_size: usize,
) -> Vec<ManagedMessage> {
    let mut messages = vec![original.clone()];

    if exchanges.len() > window_size {
        let keep_from = exchanges.len() - window_size;
        // Records belonging to steps before the first verbatim exchange.
        let cutoff = exchanges.get(keep_from).map(|(step, _)| *step);
        let lines: Vec<String> = records
            .iter()
            .filter(|r| cutoff.map_or(true, |c| r.step < c))
            .map(|r| {
                format!(
                    "- step {}: {}({}) -> {}",
                    r.step, r.tool, r.input_preview, r.output_preview
                )
            })
            .collect();
        if !lines.is_empty() {
            messages.push(ManagedMessage::assistant(format!(
                "Previous tool call summaries:\n{}",
                lines.join("\n")
            )));
        }
        messages.extend(exchanges[keep_from..].iter().map(|(_, m)| m.clone()));
    } else {
        messages.extend(exchanges.iter().map(|(_, m)| m.clone()));
    }

    messages
}

/// Base instructions, with a progress anchor appended every
/// `anchor_interval` steps once tool calls exist.
pub(crate) fn build_instructions(
    base: Option<&str>,
    step_number: u32,
    anchor_interval: u32,
    records: &[ToolCallRecord],
) -> Option<String> {
    let anchored =
        anchor_interval > 0 && step_number % anchor_interval == 0 && !records.is_empty();
    if !anchored {
        return base.map(str::to_string);
    }

    let start = records.len().saturating_sub(PROGRESS_ANCHOR_CALLS);
    let lines: Vec<String> = records[start..]
        .iter()
        .map(|r| {
            format!(
                "- step {}: {}({}) -> {}",
                r.step, r.tool, r.input_preview, r.output_preview
            )
        })
        .collect();
    let anchor = format!(
        "Progress so far (most recent tool calls):\n{}\n\nStay focused on the original task.",
        lines.join("\n")
    );
    Some(match base {
        Some(base) => format!("{base}\n\n{anchor}"),
        None => anchor,
    })
}

// ---------------------------------------------------------------------------
// ContextWindowManager
// ---------------------------------------------------------------------------

/// Owns the per-step loop for one logical agent. Holds the capability seams,
/// the shared compression cache, and optional budget enforcement; cheap to
/// construct per run since every shared piece is reference-counted.
pub struct ContextWindowManager {
    generation: Arc<dyn GenerationCapability>,
    compression: Option<Arc<dyn CompressionCapability>>,
    cache: CompressionCache,
    budget: Option<Arc<BudgetEnforcement>>,
    observer: Option<Arc<dyn StepObserver>>,
    metrics: Option<Arc<EngineMetrics>>,
}

impl ContextWindowManager {
    pub fn new(generation: Arc<dyn GenerationCapability>) -> Self {
        Self {
            generation,
            compression: None,
            cache: CompressionCache::default(),
            budget: None,
            observer: None,
            metrics: None,
        }
    }

    pub fn with_compression(mut self, compression: Arc<dyn CompressionCapability>) -> Self {
        self.compression = Some(compression);
        self
    }

    /// Replace the default cache, typically to share one across managers or
    /// to bound it differently.
    pub fn with_cache(mut self, cache: CompressionCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_budget(mut self, budget: Arc<BudgetEnforcement>) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn StepObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn cache(&self) -> &CompressionCache {
        &self.cache
    }

    fn notify(&self, summary: &StepSummary) {
        if let Some(observer) = &self.observer {
            observer.on_step(summary);
        }
    }

    /// Run the bounded step loop for one input. Never returns `Err`: every
    /// failure mode lands in the result's finish reason and abort reason.
    pub async fn run(&self, input: &str, options: &ManagedOptions) -> ManagedRunResult {
        let original = ManagedMessage::user(input).with_cache_hint();
        let mut exchanges: Vec<(u32, ManagedMessage)> = Vec::new();
        let mut records: Vec<ToolCallRecord> = Vec::new();
        let mut steps: Vec<StepSummary> = Vec::new();
        let mut usage = TokenUsage::default();
        let mut budget_pressure = false;
        // Steps completed so far; the in-flight step is number `step + 1`.
        let mut step: u32 = 0;
        let mut calls_made: u32 = 0;
        let mut state = StepState::Gate;

        loop {
            state = match state {
                StepState::Gate => {
                    let mut gated = None;
                    if let (Some(budget), Some(context)) = (&self.budget, &options.budget_context)
                    {
                        match budget.check(context).await {
                            Ok(result) if !result.allowed => {
                                if let Some(metrics) = &self.metrics {
                                    metrics.record_budget_denial();
                                }
                                gated = Some(StepState::Abort {
                                    finish: FinishReason::Aborted,
                                    reason: format!(
                                        "budget violation: {}",
                                        result.violation_summary()
                                    ),
                                });
                            }
                            Ok(result) => {
                                if result.has_warnings() {
                                    budget_pressure = true;
                                }
                            }
                            Err(e) => {
                                gated = Some(StepState::Abort {
                                    finish: FinishReason::Error,
                                    reason: format!("budget check failed: {e}"),
                                });
                            }
                        }
                    }

                    match gated {
                        Some(next) => next,
                        None => {
                            let step_number = step + 1;
                            let mut instructions = build_instructions(
                                options.instructions.as_deref(),
                                step_number,
                                options.anchor_interval,
                                &records,
                            );
                            let mut messages =
                                build_window(&original, &exchanges, &records, options.window_size);

                            let primary_model = options.model.as_deref().unwrap_or("");
                            let decision = resolve_routing_decision(
                                &options.routing,
                                primary_model,
                                input,
                                budget_pressure,
                            );

                            // Reasoning-tier providers take instructions
                            // inlined into the first user message rather than
                            // on a separate channel.
                            if decision.tier == ModelTier::Reasoning {
                                if let Some(base) = instructions.take() {
                                    if let Some(first) = messages.first_mut() {
                                        first.text = format!("{}\n\n{}", base, first.text);
                                    }
                                }
                            }

                            let estimate = estimate_request_tokens(
                                instructions.as_deref().unwrap_or(""),
                                &messages,
                            );
                            if estimate > options.max_context_tokens {
                                StepState::Abort {
                                    finish: FinishReason::Aborted,
                                    reason: format!(
                                        "context estimate {} tokens exceeds budget {} tokens",
                                        estimate, options.max_context_tokens
                                    ),
                                }
                            } else {
                                debug!(
                                    step = step_number,
                                    tokens = estimate,
                                    model = %decision.model,
                                    tier = %decision.tier,
                                    "generation step prepared"
                                );
                                let model = (!decision.model.is_empty())
                                    .then_some(decision.model.clone());
                                StepState::AwaitGeneration {
                                    request: StepRequest {
                                        messages,
                                        instructions,
                                        model,
                                        allowed_tools: options.allowed_tools.clone(),
                                    },
                                }
                            }
                        }
                    }
                }

                StepState::AwaitGeneration { request } => {
                    match self.generation.generate_step(request).await {
                        Ok(outcome) => StepState::FoldToolResults { outcome },
                        Err(e) => {
                            if let Some(metrics) = &self.metrics {
                                metrics.record_generation_failure();
                            }
                            StepState::Abort {
                                finish: FinishReason::Error,
                                reason: format!("generation failed: {e}"),
                            }
                        }
                    }
                }

                StepState::FoldToolResults { outcome } => {
                    calls_made += 1;
                    usage.add(&outcome.usage);
                    if let Some(metrics) = &self.metrics {
                        metrics.record_step();
                    }
                    let step_number = step + 1;

                    match classify_outcome(&outcome) {
                        OutcomeClass::FinalText => {
                            let text = outcome.text.clone().unwrap_or_default();
                            let summary = StepSummary {
                                step: step_number,
                                tool: None,
                                input_preview: None,
                                output_preview: None,
                                prompt_tokens: outcome.usage.prompt_tokens,
                                completion_tokens: outcome.usage.completion_tokens,
                                tool_invoked: false,
                                text: Some(text.clone()),
                            };
                            self.notify(&summary);
                            steps.push(summary);
                            StepState::Complete { text }
                        }
                        OutcomeClass::Malfunction => StepState::Abort {
                            finish: FinishReason::Error,
                            reason: "capability returned neither text nor tool call".into(),
                        },
                        OutcomeClass::ToolExchange => {
                            let mut sections = Vec::with_capacity(outcome.tool_calls.len());
                            let mut first_input_preview = None;
                            let mut first_output_preview = None;

                            for (i, call) in outcome.tool_calls.iter().enumerate() {
                                let raw = outcome
                                    .tool_results
                                    .get(i)
                                    .map(|r| r.output.as_str())
                                    .unwrap_or("");
                                let input_preview =
                                    preview(&call.input.to_string(), TOOL_INPUT_PREVIEW_CHARS);
                                let output_preview = preview(raw, TOOL_OUTPUT_PREVIEW_CHARS);

                                let condensed =
                                    if raw.chars().count() > options.compression_threshold_chars {
                                        self.cache
                                            .condense(
                                                &call.name,
                                                raw,
                                                options.condensed_max_chars,
                                                self.compression.as_deref(),
                                            )
                                            .await
                                    } else {
                                        raw.to_string()
                                    };

                                sections.push(format!(
                                    "Tool call: {}({})\nResult: {}",
                                    call.name, input_preview, condensed
                                ));
                                if i == 0 {
                                    first_input_preview = Some(input_preview.clone());
                                    first_output_preview = Some(output_preview.clone());
                                }
                                records.push(ToolCallRecord {
                                    step: step_number,
                                    tool: call.name.clone(),
                                    input_preview,
                                    output_preview,
                                });
                            }

                            exchanges.push((
                                step_number,
                                ManagedMessage::assistant(sections.join("\n\n")),
                            ));
                            debug!(
                                step = step_number,
                                tools = outcome.tool_calls.len(),
                                "tool exchange folded"
                            );

                            let summary = StepSummary {
                                step: step_number,
                                tool: outcome.tool_calls.first().map(|c| c.name.clone()),
                                input_preview: first_input_preview,
                                output_preview: first_output_preview,
                                prompt_tokens: outcome.usage.prompt_tokens,
                                completion_tokens: outcome.usage.completion_tokens,
                                tool_invoked: true,
                                text: outcome.text.clone(),
                            };
                            self.notify(&summary);
                            steps.push(summary);
                            StepState::Advance
                        }
                    }
                }

                StepState::Advance => {
                    step += 1;
                    if step >= options.max_steps {
                        StepState::Abort {
                            finish: FinishReason::Aborted,
                            reason: "reached maximum steps".into(),
                        }
                    } else {
                        StepState::Gate
                    }
                }

                StepState::Complete { text } => {
                    debug!(steps = calls_made, "managed run complete");
                    return ManagedRunResult {
                        final_text: text,
                        steps,
                        records,
                        usage,
                        steps_used: calls_made,
                        finish_reason: FinishReason::Complete,
                        abort_reason: None,
                    };
                }

                StepState::Abort { finish, reason } => {
                    warn!(finish = %finish, reason = %reason, "managed run aborted");
                    return ManagedRunResult {
                        final_text: String::new(),
                        steps,
                        records,
                        usage,
                        steps_used: calls_made,
                        finish_reason: finish,
                        abort_reason: Some(reason),
                    };
                }
            };
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
