//! Seams to the external model capabilities.
//!
//! The engine never talks to a provider directly; it drives a
//! [`GenerationCapability`] for steps and an optional
//! [`CompressionCapability`] for oversized tool output. Both are treated as
//! opaque, possibly slow, possibly failing remote calls. Mock implementations
//! with queued outcomes live here too, in the same spirit as a stub provider
//! shipped next to the real ones.

use async_trait::async_trait;
use pacer_core::types::{ManagedMessage, TokenUsage};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("capability not configured: {0}")]
    NotConfigured(String),

    #[error("api error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("capability error: {0}")]
    Other(String),
}

// ---------------------------------------------------------------------------
// Step request / outcome
// ---------------------------------------------------------------------------

/// One generation step's input: the assembled message window plus the
/// instructions channel and model identity chosen by the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRequest {
    pub messages: Vec<ManagedMessage>,
    /// `None` when the instructions were inlined into the first user message
    /// for a tier without a separate instructions channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub name: String,
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub name: String,
    pub output: String,
}

/// One step of model output. Tool calls pair with tool results by index;
/// the capability executes tools itself and reports both sides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolInvocation>,
    #[serde(default)]
    pub tool_results: Vec<ToolResult>,
    pub usage: TokenUsage,
    pub finish_reason: String,
}

impl StepOutcome {
    /// Final text with no tool activity.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            usage: TokenUsage::default(),
            finish_reason: "stop".to_string(),
        }
    }

    /// A single tool call with its executed result.
    pub fn tool_exchange(
        name: impl Into<String>,
        input: serde_json::Value,
        output: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            text: None,
            tool_calls: vec![ToolInvocation {
                name: name.clone(),
                input,
            }],
            tool_results: vec![ToolResult {
                name,
                output: output.into(),
            }],
            usage: TokenUsage::default(),
            finish_reason: "tool_calls".to_string(),
        }
    }

    /// The malformed shape: neither text nor tool call.
    pub fn empty() -> Self {
        Self {
            text: None,
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            usage: TokenUsage::default(),
            finish_reason: "stop".to_string(),
        }
    }

    pub fn with_usage(mut self, prompt_tokens: u64, completion_tokens: u64) -> Self {
        self.usage = TokenUsage::new(prompt_tokens, completion_tokens);
        self
    }
}

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

/// One bounded generation step. Must be safe to call repeatedly; retries, if
/// any, belong to the implementation's own transport.
#[async_trait]
pub trait GenerationCapability: Send + Sync {
    async fn generate_step(&self, request: StepRequest) -> Result<StepOutcome, CapabilityError>;

    /// Short identifier for logs.
    fn name(&self) -> &str;
}

/// Best-effort summarizer for oversized tool output. Callers fall back to
/// truncation when this fails.
#[async_trait]
pub trait CompressionCapability: Send + Sync {
    async fn summarize(
        &self,
        tool_name: &str,
        raw_text: &str,
        max_chars: usize,
    ) -> Result<String, CapabilityError>;
}

// ---------------------------------------------------------------------------
// MockGeneration
// ---------------------------------------------------------------------------

/// Queued-outcome generation capability for tests. Outcomes pop in FIFO
/// order; every request is captured for assertions.
#[derive(Clone, Default)]
pub struct MockGeneration {
    outcomes: Arc<Mutex<VecDeque<Result<StepOutcome, CapabilityError>>>>,
    captured: Arc<Mutex<Vec<StepRequest>>>,
}

impl MockGeneration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outcome(self, outcome: StepOutcome) -> Self {
        if let Ok(mut queue) = self.outcomes.try_lock() {
            queue.push_back(Ok(outcome));
        }
        self
    }

    pub fn with_error(self, error: CapabilityError) -> Self {
        if let Ok(mut queue) = self.outcomes.try_lock() {
            queue.push_back(Err(error));
        }
        self
    }

    pub async fn captured_requests(&self) -> Vec<StepRequest> {
        self.captured.lock().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.captured.lock().await.len()
    }
}

#[async_trait]
impl GenerationCapability for MockGeneration {
    async fn generate_step(&self, request: StepRequest) -> Result<StepOutcome, CapabilityError> {
        self.captured.lock().await.push(request);
        self.outcomes
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Err(CapabilityError::Other("mock outcome queue empty".into())))
    }

    fn name(&self) -> &str {
        "mock-generation"
    }
}

// ---------------------------------------------------------------------------
// MockCompression
// ---------------------------------------------------------------------------

/// Deterministic summarizer for tests: counts underlying calls so cache
/// idempotence is assertable, and can be told to fail to exercise the
/// truncation fallback.
#[derive(Clone, Default)]
pub struct MockCompression {
    calls: Arc<AtomicUsize>,
    fail: bool,
}

impl MockCompression {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            fail: true,
        }
    }

    /// How many summarize calls actually reached this capability.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompressionCapability for MockCompression {
    async fn summarize(
        &self,
        tool_name: &str,
        raw_text: &str,
        max_chars: usize,
    ) -> Result<String, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(CapabilityError::Other("summarizer unavailable".into()));
        }
        let body = pacer_core::tokens::preview(raw_text, max_chars.saturating_sub(tool_name.len() + 12));
        Ok(format!("[{} summary] {}", tool_name, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_generation_pops_in_order_and_captures() {
        let mock = MockGeneration::new()
            .with_outcome(StepOutcome::text("first"))
            .with_outcome(StepOutcome::text("second"));

        let request = StepRequest {
            messages: vec![ManagedMessage::user("go")],
            instructions: Some("do it".into()),
            model: None,
            allowed_tools: None,
        };

        let first = mock.generate_step(request.clone()).await.unwrap();
        assert_eq!(first.text.as_deref(), Some("first"));
        let second = mock.generate_step(request).await.unwrap();
        assert_eq!(second.text.as_deref(), Some("second"));

        assert_eq!(mock.call_count().await, 2);
        let captured = mock.captured_requests().await;
        assert_eq!(captured[0].instructions.as_deref(), Some("do it"));
    }

    #[tokio::test]
    async fn mock_generation_errors_when_queue_empty() {
        let mock = MockGeneration::new();
        let request = StepRequest {
            messages: vec![],
            instructions: None,
            model: None,
            allowed_tools: None,
        };
        let err = mock.generate_step(request).await.unwrap_err();
        assert!(matches!(err, CapabilityError::Other(_)));
    }

    #[tokio::test]
    async fn mock_compression_counts_calls() {
        let mock = MockCompression::new();
        let condensed = mock.summarize("search", "a very long result", 64).await.unwrap();
        assert!(condensed.starts_with("[search summary]"));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn failing_compression_reports_error() {
        let mock = MockCompression::failing();
        assert!(mock.summarize("search", "raw", 64).await.is_err());
        assert_eq!(mock.call_count(), 1);
    }

    #[test]
    fn tool_exchange_pairs_call_and_result() {
        let outcome = StepOutcome::tool_exchange(
            "search",
            serde_json::json!({"q": "rust"}),
            "3 results",
        );
        assert_eq!(outcome.tool_calls.len(), 1);
        assert_eq!(outcome.tool_results.len(), 1);
        assert_eq!(outcome.tool_calls[0].name, outcome.tool_results[0].name);
        assert_eq!(outcome.finish_reason, "tool_calls");
    }
}
