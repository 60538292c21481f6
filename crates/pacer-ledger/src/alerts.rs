use crate::enforcement::BudgetLevel;
use crate::LedgerError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// BudgetAlert
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Violation,
    Warning,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AlertKind::Violation => "violation",
            AlertKind::Warning => "warning",
        };
        write!(f, "{}", label)
    }
}

/// One deduplicated budget notification handed to the alert sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetAlert {
    pub level: BudgetLevel,
    pub kind: AlertKind,
    /// Stable identity of the breached scope, e.g. `agent:<uuid>`.
    pub scope_key: String,
    pub current_spend_usd: f64,
    pub limit_usd: f64,
    pub percent_used: f64,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// AlertSink
// ---------------------------------------------------------------------------

/// Downstream notification seam. Emission is best-effort: the dispatcher
/// logs failures and keeps going, so a broken sink can never block a check.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn emit(&self, alert: &BudgetAlert) -> Result<(), LedgerError>;
}

/// Default sink: structured log events only.
#[derive(Debug, Default, Clone)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn emit(&self, alert: &BudgetAlert) -> Result<(), LedgerError> {
        match alert.kind {
            AlertKind::Violation => warn!(
                level = %alert.level,
                scope = %alert.scope_key,
                spend = alert.current_spend_usd,
                limit = alert.limit_usd,
                "budget violation"
            ),
            AlertKind::Warning => info!(
                level = %alert.level,
                scope = %alert.scope_key,
                spend = alert.current_spend_usd,
                limit = alert.limit_usd,
                "budget warning"
            ),
        }
        Ok(())
    }
}

/// Test sink capturing every emitted alert; can be told to fail.
#[derive(Debug, Default, Clone)]
pub struct RecordingAlertSink {
    alerts: Arc<Mutex<Vec<BudgetAlert>>>,
    fail: bool,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose every emission fails, for exercising the best-effort
    /// path.
    pub fn failing() -> Self {
        Self {
            alerts: Arc::new(Mutex::new(Vec::new())),
            fail: true,
        }
    }

    pub async fn emitted(&self) -> Vec<BudgetAlert> {
        self.alerts.lock().await.clone()
    }
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn emit(&self, alert: &BudgetAlert) -> Result<(), LedgerError> {
        if self.fail {
            return Err(LedgerError::AlertSink("sink unavailable".into()));
        }
        self.alerts.lock().await.push(alert.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// AlertDispatcher
// ---------------------------------------------------------------------------

const DEDUP_TABLE_PRUNE_LEN: usize = 1024;

/// Deduplicates alerts per scope+level+kind inside a rolling window so a hot
/// check path cannot produce an alert storm.
#[derive(Clone)]
pub struct AlertDispatcher {
    sink: Arc<dyn AlertSink>,
    window: Duration,
    recent: Arc<DashMap<String, DateTime<Utc>>>,
}

impl AlertDispatcher {
    pub fn new(sink: Arc<dyn AlertSink>, window: Duration) -> Self {
        Self {
            sink,
            window,
            recent: Arc::new(DashMap::new()),
        }
    }

    /// Emit `alert` unless an identical scope+level+kind alert already went
    /// out inside the window. Returns whether the sink was invoked.
    pub async fn dispatch(&self, alert: BudgetAlert) -> bool {
        let key = format!("{}|{}|{}", alert.scope_key, alert.level, alert.kind);
        let now = Utc::now();

        if let Some(previous) = self.recent.get(&key) {
            if now - *previous < self.window {
                debug!(key = %key, "budget alert suppressed by dedup window");
                return false;
            }
        }
        self.recent.insert(key, now);

        if self.recent.len() > DEDUP_TABLE_PRUNE_LEN {
            let window = self.window;
            self.recent.retain(|_, emitted_at| now - *emitted_at < window);
        }

        if let Err(error) = self.sink.emit(&alert).await {
            warn!(error = %error, scope = %alert.scope_key, "budget alert emission failed");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert(scope: &str, kind: AlertKind) -> BudgetAlert {
        BudgetAlert {
            level: BudgetLevel::Agent,
            kind,
            scope_key: scope.to_string(),
            current_spend_usd: 90.0,
            limit_usd: 100.0,
            percent_used: 90.0,
            message: "near limit".into(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn duplicate_alert_suppressed_within_window() {
        let sink = Arc::new(RecordingAlertSink::new());
        let dispatcher = AlertDispatcher::new(sink.clone(), Duration::hours(1));

        assert!(dispatcher.dispatch(alert("agent:a", AlertKind::Warning)).await);
        assert!(!dispatcher.dispatch(alert("agent:a", AlertKind::Warning)).await);
        assert_eq!(sink.emitted().await.len(), 1);
    }

    #[tokio::test]
    async fn different_kind_or_scope_is_not_deduped() {
        let sink = Arc::new(RecordingAlertSink::new());
        let dispatcher = AlertDispatcher::new(sink.clone(), Duration::hours(1));

        dispatcher.dispatch(alert("agent:a", AlertKind::Warning)).await;
        dispatcher.dispatch(alert("agent:a", AlertKind::Violation)).await;
        dispatcher.dispatch(alert("agent:b", AlertKind::Warning)).await;
        assert_eq!(sink.emitted().await.len(), 3);
    }

    #[tokio::test]
    async fn expired_window_allows_re_emission() {
        let sink = Arc::new(RecordingAlertSink::new());
        // zero-width window: nothing is ever suppressed
        let dispatcher = AlertDispatcher::new(sink.clone(), Duration::zero());

        dispatcher.dispatch(alert("agent:a", AlertKind::Warning)).await;
        dispatcher.dispatch(alert("agent:a", AlertKind::Warning)).await;
        assert_eq!(sink.emitted().await.len(), 2);
    }

    #[tokio::test]
    async fn sink_failure_is_absorbed() {
        let sink = Arc::new(RecordingAlertSink::failing());
        let dispatcher = AlertDispatcher::new(sink.clone(), Duration::hours(1));

        // dispatch still reports the attempt; nothing recorded, no panic
        assert!(dispatcher.dispatch(alert("agent:a", AlertKind::Violation)).await);
        assert!(sink.emitted().await.is_empty());
    }

    #[test]
    fn alert_serializes_with_snake_case_discriminants() {
        let json = serde_json::to_string(&alert("agent:a", AlertKind::Violation))
            .expect("alert serializes");
        assert!(json.contains("\"level\":\"agent\""));
        assert!(json.contains("\"kind\":\"violation\""));
        assert!(json.contains("\"scope_key\":\"agent:a\""));
        assert!(json.contains("\"limit_usd\":100.0"));
    }
}
