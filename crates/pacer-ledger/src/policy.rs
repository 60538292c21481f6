use crate::LedgerError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

pub const DEFAULT_ALERT_THRESHOLD_PCT: f64 = 80.0;

// ---------------------------------------------------------------------------
// LevelPolicy
// ---------------------------------------------------------------------------

/// Monthly budget policy for one hierarchy level (organization, user, or
/// agent). A hard limit blocks new work at the limit; a soft limit only
/// produces warnings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelPolicy {
    pub monthly_limit_usd: f64,
    pub hard_limit: bool,
    /// Percent of the limit at which warnings begin.
    pub alert_threshold_pct: f64,
}

impl LevelPolicy {
    pub fn hard(monthly_limit_usd: f64) -> Self {
        Self {
            monthly_limit_usd,
            hard_limit: true,
            alert_threshold_pct: DEFAULT_ALERT_THRESHOLD_PCT,
        }
    }

    pub fn soft(monthly_limit_usd: f64) -> Self {
        Self {
            monthly_limit_usd,
            hard_limit: false,
            alert_threshold_pct: DEFAULT_ALERT_THRESHOLD_PCT,
        }
    }

    pub fn with_alert_threshold(mut self, pct: f64) -> Self {
        self.alert_threshold_pct = pct;
        self
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.monthly_limit_usd <= 0.0 {
            return Err(LedgerError::InvalidPolicy(
                "monthly_limit_usd must be positive".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.alert_threshold_pct) {
            return Err(LedgerError::InvalidPolicy(
                "alert_threshold_pct must be within 0..=100".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SubscriptionPolicy
// ---------------------------------------------------------------------------

/// Subscription credit policy, keyed by organization. Included credits are
/// consumed first; once exhausted, work continues only when overage is
/// enabled and overage spend stays under its own ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionPolicy {
    pub included_credits_usd: f64,
    pub overage_enabled: bool,
    /// Ceiling on spend beyond the included credits. Ignored while overage
    /// is disabled.
    pub overage_limit_usd: f64,
    pub alert_threshold_pct: f64,
}

impl SubscriptionPolicy {
    pub fn credits(included_credits_usd: f64) -> Self {
        Self {
            included_credits_usd,
            overage_enabled: false,
            overage_limit_usd: 0.0,
            alert_threshold_pct: DEFAULT_ALERT_THRESHOLD_PCT,
        }
    }

    pub fn with_overage(mut self, overage_limit_usd: f64) -> Self {
        self.overage_enabled = true;
        self.overage_limit_usd = overage_limit_usd;
        self
    }

    pub fn with_alert_threshold(mut self, pct: f64) -> Self {
        self.alert_threshold_pct = pct;
        self
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.included_credits_usd <= 0.0 {
            return Err(LedgerError::InvalidPolicy(
                "included_credits_usd must be positive".into(),
            ));
        }
        if self.overage_enabled && self.overage_limit_usd <= 0.0 {
            return Err(LedgerError::InvalidPolicy(
                "overage_limit_usd must be positive when overage is enabled".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.alert_threshold_pct) {
            return Err(LedgerError::InvalidPolicy(
                "alert_threshold_pct must be within 0..=100".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// BudgetPolicies
// ---------------------------------------------------------------------------

/// Registry of configured policies per scope id. Policies are validated on
/// insert so a malformed policy surfaces at configuration time, never during
/// a hot-path check.
#[derive(Debug, Default, Clone)]
pub struct BudgetPolicies {
    organization: Arc<RwLock<ahash::AHashMap<Uuid, LevelPolicy>>>,
    user: Arc<RwLock<ahash::AHashMap<Uuid, LevelPolicy>>>,
    agent: Arc<RwLock<ahash::AHashMap<Uuid, LevelPolicy>>>,
    subscription: Arc<RwLock<ahash::AHashMap<Uuid, SubscriptionPolicy>>>,
}

impl BudgetPolicies {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_organization_policy(
        &self,
        organization_id: Uuid,
        policy: LevelPolicy,
    ) -> Result<(), LedgerError> {
        policy.validate()?;
        self.organization
            .write()
            .await
            .insert(organization_id, policy);
        Ok(())
    }

    pub async fn set_user_policy(
        &self,
        user_id: Uuid,
        policy: LevelPolicy,
    ) -> Result<(), LedgerError> {
        policy.validate()?;
        self.user.write().await.insert(user_id, policy);
        Ok(())
    }

    pub async fn set_agent_policy(
        &self,
        agent_id: Uuid,
        policy: LevelPolicy,
    ) -> Result<(), LedgerError> {
        policy.validate()?;
        self.agent.write().await.insert(agent_id, policy);
        Ok(())
    }

    pub async fn set_subscription_policy(
        &self,
        organization_id: Uuid,
        policy: SubscriptionPolicy,
    ) -> Result<(), LedgerError> {
        policy.validate()?;
        self.subscription
            .write()
            .await
            .insert(organization_id, policy);
        Ok(())
    }

    pub async fn organization_policy(&self, organization_id: Uuid) -> Option<LevelPolicy> {
        self.organization.read().await.get(&organization_id).cloned()
    }

    pub async fn user_policy(&self, user_id: Uuid) -> Option<LevelPolicy> {
        self.user.read().await.get(&user_id).cloned()
    }

    pub async fn agent_policy(&self, agent_id: Uuid) -> Option<LevelPolicy> {
        self.agent.read().await.get(&agent_id).cloned()
    }

    pub async fn subscription_policy(&self, organization_id: Uuid) -> Option<SubscriptionPolicy> {
        self.subscription.read().await.get(&organization_id).cloned()
    }
}
