use crate::alerts::{AlertDispatcher, AlertKind, AlertSink, BudgetAlert, TracingAlertSink};
use crate::policy::{BudgetPolicies, LevelPolicy, SubscriptionPolicy};
use crate::store::{CostEvent, CostEventStatus, CostEventStore, CostScope};
use crate::LedgerError;
use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use pacer_core::types::AgentProfile;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// BudgetLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetLevel {
    Subscription,
    Organization,
    User,
    Agent,
}

impl fmt::Display for BudgetLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BudgetLevel::Subscription => "subscription",
            BudgetLevel::Organization => "organization",
            BudgetLevel::User => "user",
            BudgetLevel::Agent => "agent",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// BudgetCheckContext
// ---------------------------------------------------------------------------

/// Who is asking to spend. Levels without an id present are skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetCheckContext {
    pub agent_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<Uuid>,
}

impl BudgetCheckContext {
    pub fn for_agent(agent_id: Uuid) -> Self {
        Self {
            agent_id,
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

impl From<&AgentProfile> for BudgetCheckContext {
    fn from(profile: &AgentProfile) -> Self {
        Self {
            agent_id: profile.id,
            user_id: profile.user_id,
            organization_id: profile.organization_id,
        }
    }
}

// ---------------------------------------------------------------------------
// BudgetViolation / BudgetCheckResult
// ---------------------------------------------------------------------------

/// One budget finding. Appears in the violation list when it blocks work and
/// in the warning list when it only signals pressure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetViolation {
    pub level: BudgetLevel,
    pub current_spend_usd: f64,
    pub limit_usd: f64,
    pub percent_used: f64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetCheckResult {
    /// False iff at least one violation exists. Warnings never block.
    pub allowed: bool,
    pub violations: Vec<BudgetViolation>,
    pub warnings: Vec<BudgetViolation>,
}

impl BudgetCheckResult {
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Joined violation messages, used verbatim as an abort reason.
    pub fn violation_summary(&self) -> String {
        self.violations
            .iter()
            .map(|v| v.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

// ---------------------------------------------------------------------------
// Level evaluation
// ---------------------------------------------------------------------------

/// First instant of the current calendar month; spend sums start here.
pub fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

fn evaluate_level(
    level: BudgetLevel,
    policy: &LevelPolicy,
    spend: f64,
) -> Option<(AlertKind, BudgetViolation)> {
    let limit = policy.monthly_limit_usd;
    let percent_used = if limit > 0.0 { spend / limit * 100.0 } else { 0.0 };

    if spend >= limit && policy.hard_limit {
        return Some((
            AlertKind::Violation,
            BudgetViolation {
                level,
                current_spend_usd: spend,
                limit_usd: limit,
                percent_used,
                message: format!(
                    "{} monthly budget exhausted: ${:.2} of ${:.2} ({:.0}%)",
                    level, spend, limit, percent_used
                ),
            },
        ));
    }
    if percent_used >= policy.alert_threshold_pct {
        return Some((
            AlertKind::Warning,
            BudgetViolation {
                level,
                current_spend_usd: spend,
                limit_usd: limit,
                percent_used,
                message: format!(
                    "{} monthly budget at {:.0}%: ${:.2} of ${:.2}",
                    level, percent_used, spend, limit
                ),
            },
        ));
    }
    None
}

fn evaluate_subscription(
    policy: &SubscriptionPolicy,
    spend: f64,
) -> Option<(AlertKind, BudgetViolation)> {
    let included = policy.included_credits_usd;
    let level = BudgetLevel::Subscription;

    if spend < included {
        let percent_used = spend / included * 100.0;
        if percent_used >= policy.alert_threshold_pct {
            return Some((
                AlertKind::Warning,
                BudgetViolation {
                    level,
                    current_spend_usd: spend,
                    limit_usd: included,
                    percent_used,
                    message: format!(
                        "subscription credits at {:.0}%: ${:.2} of ${:.2} included",
                        percent_used, spend, included
                    ),
                },
            ));
        }
        return None;
    }

    // Included credits are gone.
    if !policy.overage_enabled {
        let percent_used = spend / included * 100.0;
        return Some((
            AlertKind::Violation,
            BudgetViolation {
                level,
                current_spend_usd: spend,
                limit_usd: included,
                percent_used,
                message: format!(
                    "subscription credits exhausted: ${:.2} of ${:.2} included, overage disabled",
                    spend, included
                ),
            },
        ));
    }

    let ceiling = included + policy.overage_limit_usd;
    let percent_used = spend / ceiling * 100.0;
    let overage = spend - included;
    if overage >= policy.overage_limit_usd {
        return Some((
            AlertKind::Violation,
            BudgetViolation {
                level,
                current_spend_usd: spend,
                limit_usd: ceiling,
                percent_used,
                message: format!(
                    "subscription overage ceiling reached: ${:.2} overage of ${:.2} allowed",
                    overage, policy.overage_limit_usd
                ),
            },
        ));
    }
    Some((
        AlertKind::Warning,
        BudgetViolation {
            level,
            current_spend_usd: spend,
            limit_usd: ceiling,
            percent_used,
            message: format!(
                "subscription credits exhausted; consuming overage: ${:.2} of ${:.2}",
                overage, policy.overage_limit_usd
            ),
        },
    ))
}

// ---------------------------------------------------------------------------
// BudgetEnforcement
// ---------------------------------------------------------------------------

const DEFAULT_ALERT_WINDOW_MINUTES: i64 = 60;
const DEFAULT_RESERVATION_MAX_AGE_MINUTES: i64 = 30;

/// The spend ledger's decision surface: monthly checks over the cost-event
/// store plus the reservation protocol that closes check-then-act races.
#[derive(Clone)]
pub struct BudgetEnforcement {
    store: Arc<dyn CostEventStore>,
    policies: BudgetPolicies,
    sink: Arc<dyn AlertSink>,
    alerts: AlertDispatcher,
    alert_window: Duration,
    reservation_max_age: Duration,
}

impl BudgetEnforcement {
    pub fn new(store: Arc<dyn CostEventStore>) -> Self {
        let sink: Arc<dyn AlertSink> = Arc::new(TracingAlertSink);
        let alert_window = Duration::minutes(DEFAULT_ALERT_WINDOW_MINUTES);
        Self {
            store,
            policies: BudgetPolicies::new(),
            alerts: AlertDispatcher::new(sink.clone(), alert_window),
            sink,
            alert_window,
            reservation_max_age: Duration::minutes(DEFAULT_RESERVATION_MAX_AGE_MINUTES),
        }
    }

    pub fn with_alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sink = sink;
        self.alerts = AlertDispatcher::new(self.sink.clone(), self.alert_window);
        self
    }

    pub fn with_alert_window(mut self, window: Duration) -> Self {
        self.alert_window = window;
        self.alerts = AlertDispatcher::new(self.sink.clone(), window);
        self
    }

    pub fn with_reservation_max_age(mut self, max_age: Duration) -> Self {
        self.reservation_max_age = max_age;
        self
    }

    pub fn policies(&self) -> &BudgetPolicies {
        &self.policies
    }

    // -- check ---------------------------------------------------------------

    /// Evaluate every configured level against monthly-to-date spend.
    /// Findings are ordered subscription → organization → user → agent.
    pub async fn check(
        &self,
        context: &BudgetCheckContext,
    ) -> Result<BudgetCheckResult, LedgerError> {
        let since = month_start(Utc::now());
        let mut findings: Vec<(AlertKind, BudgetViolation, String)> = Vec::new();

        if let Some(org) = context.organization_id {
            let org_spend = self
                .store
                .sum_non_cancelled_since(since, &CostScope::Organization(org))
                .await?;

            if let Some(subscription) = self.policies.subscription_policy(org).await {
                if let Some((kind, finding)) = evaluate_subscription(&subscription, org_spend) {
                    findings.push((kind, finding, format!("subscription:{}", org)));
                }
            }
            if let Some(policy) = self.policies.organization_policy(org).await {
                if let Some((kind, finding)) =
                    evaluate_level(BudgetLevel::Organization, &policy, org_spend)
                {
                    findings.push((kind, finding, format!("organization:{}", org)));
                }
            }
        }

        if let Some(user) = context.user_id {
            if let Some(policy) = self.policies.user_policy(user).await {
                let scope = CostScope::User {
                    user_id: user,
                    organization_id: context.organization_id,
                };
                let spend = self.store.sum_non_cancelled_since(since, &scope).await?;
                if let Some((kind, finding)) = evaluate_level(BudgetLevel::User, &policy, spend) {
                    findings.push((kind, finding, format!("user:{}", user)));
                }
            }
        }

        if let Some(policy) = self.policies.agent_policy(context.agent_id).await {
            let spend = self
                .store
                .sum_non_cancelled_since(since, &CostScope::Agent(context.agent_id))
                .await?;
            if let Some((kind, finding)) = evaluate_level(BudgetLevel::Agent, &policy, spend) {
                findings.push((kind, finding, format!("agent:{}", context.agent_id)));
            }
        }

        let mut violations = Vec::new();
        let mut warnings = Vec::new();
        for (kind, finding, scope_key) in findings {
            self.alerts
                .dispatch(BudgetAlert {
                    level: finding.level,
                    kind,
                    scope_key,
                    current_spend_usd: finding.current_spend_usd,
                    limit_usd: finding.limit_usd,
                    percent_used: finding.percent_used,
                    message: finding.message.clone(),
                    created_at: Utc::now(),
                })
                .await;
            match kind {
                AlertKind::Violation => violations.push(finding),
                AlertKind::Warning => warnings.push(finding),
            }
        }

        let allowed = violations.is_empty();
        if allowed {
            debug!(agent = %context.agent_id, warnings = warnings.len(), "budget check allowed");
        } else {
            info!(agent = %context.agent_id, violations = violations.len(), "budget check denied");
        }
        Ok(BudgetCheckResult {
            allowed,
            violations,
            warnings,
        })
    }

    // -- spend recording -----------------------------------------------------

    /// Append settled spend with no reservation phase.
    pub async fn record_spend(
        &self,
        context: &BudgetCheckContext,
        amount_usd: f64,
        description: Option<String>,
    ) -> Result<Uuid, LedgerError> {
        let mut event = CostEvent::settled(context.agent_id, amount_usd);
        if let Some(user) = context.user_id {
            event = event.with_user(user);
        }
        if let Some(org) = context.organization_id {
            event = event.with_organization(org);
        }
        if let Some(description) = description {
            event = event.with_description(description);
        }
        self.store.append(event).await
    }

    // -- reservation protocol ------------------------------------------------

    /// Insert a `RESERVED` hold before spend-affecting work begins. The hold
    /// counts toward every scope in `context` immediately, which is what
    /// closes the check-then-act race between concurrent runs.
    pub async fn create_reservation(
        &self,
        run_id: Uuid,
        context: &BudgetCheckContext,
        estimated_cost_usd: f64,
    ) -> Result<Uuid, LedgerError> {
        let mut event = CostEvent::reservation(run_id, context.agent_id, estimated_cost_usd);
        if let Some(user) = context.user_id {
            event = event.with_user(user);
        }
        if let Some(org) = context.organization_id {
            event = event.with_organization(org);
        }
        let id = self.store.append(event).await?;
        debug!(reservation = %id, run = %run_id, estimated = estimated_cost_usd, "cost reservation created");
        Ok(id)
    }

    /// Settle a reservation with the true cost.
    pub async fn finalize_reservation(
        &self,
        reservation_id: Uuid,
        actual_cost_usd: f64,
    ) -> Result<(), LedgerError> {
        self.transition_reservation(
            reservation_id,
            CostEventStatus::Finalized,
            Some(actual_cost_usd),
        )
        .await
    }

    /// Release a reservation at zero cost.
    pub async fn cancel_reservation(&self, reservation_id: Uuid) -> Result<(), LedgerError> {
        self.transition_reservation(reservation_id, CostEventStatus::Cancelled, Some(0.0))
            .await
    }

    async fn transition_reservation(
        &self,
        reservation_id: Uuid,
        status: CostEventStatus,
        amount_usd: Option<f64>,
    ) -> Result<(), LedgerError> {
        let event = self
            .store
            .get(reservation_id)
            .await?
            .ok_or(LedgerError::NotFound {
                entity: "cost reservation",
                id: reservation_id,
            })?;
        if event.status != CostEventStatus::Reserved {
            return Err(LedgerError::InvalidOperation(format!(
                "reservation {} is already {}",
                reservation_id, event.status
            )));
        }
        self.store
            .update_status(reservation_id, status, amount_usd)
            .await?;
        debug!(reservation = %reservation_id, status = %status, "cost reservation settled");
        Ok(())
    }

    /// Cancel reservations past the configured age that were never
    /// finalized, so crashed runs cannot leak phantom spend. Cadence belongs
    /// to an external scheduler.
    pub async fn sweep_stale_reservations(&self) -> Result<usize, LedgerError> {
        self.sweep_older_than(self.reservation_max_age).await
    }

    pub async fn sweep_older_than(&self, max_age: Duration) -> Result<usize, LedgerError> {
        let cutoff = Utc::now() - max_age;
        let stale = self.store.reserved_older_than(cutoff).await?;
        let swept = stale.len();
        for event in stale {
            self.store
                .update_status(event.id, CostEventStatus::Cancelled, Some(0.0))
                .await?;
        }
        if swept > 0 {
            info!(swept, "stale cost reservations cancelled");
        }
        Ok(swept)
    }
}
