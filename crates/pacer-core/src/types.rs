use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// MessageRole / ManagedMessage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        };
        write!(f, "{}", label)
    }
}

/// One ordered unit of conversational context. Only a bounded suffix of these,
/// plus the always-retained original request, is sent per generation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedMessage {
    pub role: MessageRole,
    pub text: String,
    /// Provider routing hint: pin this message for upstream prompt caching.
    #[serde(default)]
    pub cache_hint: bool,
}

impl ManagedMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            text: text.into(),
            cache_hint: false,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            text: text.into(),
            cache_hint: false,
        }
    }

    pub fn with_cache_hint(mut self) -> Self {
        self.cache_hint = true;
        self
    }
}

// ---------------------------------------------------------------------------
// FinishReason
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The step produced final text with no further tool calls.
    Complete,
    /// A capability call failed or malfunctioned mid-run.
    Error,
    /// A budget guard stopped the run (steps, context tokens, or spend).
    Aborted,
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FinishReason::Complete => "complete",
            FinishReason::Error => "error",
            FinishReason::Aborted => "aborted",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// A unit of work inside a phased run. Immutable once the run starts.
///
/// `depends_on` must reference known phase ids and form an acyclic graph;
/// both are validated before any phase executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub id: String,
    pub name: String,
    pub instructions: String,
    pub max_steps: u32,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    /// Capability allow-list forwarded to the generation capability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
}

impl Phase {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        instructions: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            instructions: instructions.into(),
            max_steps: 12,
            depends_on: BTreeSet::new(),
            tools: None,
        }
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = Some(tools.into_iter().map(Into::into).collect());
        self
    }
}

// ---------------------------------------------------------------------------
// PhaseMode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseMode {
    /// Execute phases in declared list order.
    Sequential,
    /// Execute the dependency DAG in concurrent ready-set groups.
    Parallel,
}

// ---------------------------------------------------------------------------
// PhaseResult
// ---------------------------------------------------------------------------

/// Output of one completed phase. Created once, never mutated; dependent
/// phases read it when composing their input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase_id: String,
    pub name: String,
    pub text: String,
    pub steps_used: u32,
    pub usage: TokenUsage,
    pub finish_reason: FinishReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// 1-based ready-set group index in parallel mode; `None` sequentially.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<u32>,
}

// ---------------------------------------------------------------------------
// ToolCallRecord
// ---------------------------------------------------------------------------

/// Historical entry for one tool exchange, retained for the lifetime of a
/// phase. Once an exchange falls outside the live window, only this record's
/// previews ever reach the generation capability again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub step: u32,
    pub tool: String,
    pub input_preview: String,
    pub output_preview: String,
}

// ---------------------------------------------------------------------------
// StepSummary
// ---------------------------------------------------------------------------

/// One step's observable outcome, delivered to the step observer. Immutable
/// once appended to the per-run list; never replayed into context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSummary {
    pub step: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_preview: Option<String>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub tool_invoked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

// ---------------------------------------------------------------------------
// TokenUsage
// ---------------------------------------------------------------------------

/// Prompt/completion token counters, accumulated per step, phase, and run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

// ---------------------------------------------------------------------------
// AgentProfile
// ---------------------------------------------------------------------------

/// The identity a managed run executes under. Budget scoping resolves the
/// agent, user, and organization levels from these ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: Uuid,
    pub name: String,
    /// Model used when routing is disabled or no tier override applies.
    pub primary_model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<Uuid>,
}

impl AgentProfile {
    pub fn new(name: impl Into<String>, primary_model: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            primary_model: primary_model.into(),
            user_id: None,
            organization_id: None,
        }
    }

    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_organization(mut self, organization_id: Uuid) -> Self {
        self.organization_id = Some(organization_id);
        self
    }
}
