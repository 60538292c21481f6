use crate::LedgerError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// CostEventStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostEventStatus {
    /// Provisional hold created before spend-affecting work begins.
    Reserved,
    /// Settled with the true cost.
    Finalized,
    /// Released; excluded from every spend sum.
    Cancelled,
}

impl fmt::Display for CostEventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CostEventStatus::Reserved => "reserved",
            CostEventStatus::Finalized => "finalized",
            CostEventStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// CostEvent
// ---------------------------------------------------------------------------

/// One ledger entry. Reservations and settled spend share this shape; only
/// the status differs across the lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostEvent {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    pub agent_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<Uuid>,
    pub amount_usd: f64,
    pub status: CostEventStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CostEvent {
    /// A provisional hold for a run that is about to start.
    pub fn reservation(run_id: Uuid, agent_id: Uuid, estimated_usd: f64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            run_id: Some(run_id),
            agent_id,
            user_id: None,
            organization_id: None,
            amount_usd: estimated_usd,
            status: CostEventStatus::Reserved,
            description: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A settled spend record with no reservation phase.
    pub fn settled(agent_id: Uuid, amount_usd: f64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            run_id: None,
            agent_id,
            user_id: None,
            organization_id: None,
            amount_usd,
            status: CostEventStatus::Finalized,
            description: None,
            created_at: now,
            updated_at: now,
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

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self.updated_at = created_at;
        self
    }
}

// ---------------------------------------------------------------------------
// CostScope
// ---------------------------------------------------------------------------

/// Which slice of the ledger a spend sum covers. Each budget level queries
/// its own scope; an event can match several scopes at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CostScope {
    Agent(Uuid),
    User {
        user_id: Uuid,
        organization_id: Option<Uuid>,
    },
    Organization(Uuid),
}

impl CostScope {
    pub fn matches(&self, event: &CostEvent) -> bool {
        match self {
            CostScope::Agent(agent_id) => event.agent_id == *agent_id,
            CostScope::User {
                user_id,
                organization_id,
            } => {
                event.user_id == Some(*user_id)
                    && match organization_id {
                        Some(org) => event.organization_id == Some(*org),
                        None => true,
                    }
            }
            CostScope::Organization(org) => event.organization_id == Some(*org),
        }
    }
}

// ---------------------------------------------------------------------------
// CostEventStore
// ---------------------------------------------------------------------------

/// Persistence seam for the ledger. The engine depends on these query
/// semantics (scoped sums over non-cancelled events, status updates) and not
/// on any storage engine.
#[async_trait]
pub trait CostEventStore: Send + Sync {
    /// Append a new event, returning its id.
    async fn append(&self, event: CostEvent) -> Result<Uuid, LedgerError>;

    /// Fetch a single event.
    async fn get(&self, id: Uuid) -> Result<Option<CostEvent>, LedgerError>;

    /// Sum `amount_usd` over non-cancelled events created at or after
    /// `since` that match `scope`.
    async fn sum_non_cancelled_since(
        &self,
        since: DateTime<Utc>,
        scope: &CostScope,
    ) -> Result<f64, LedgerError>;

    /// Update an event's status and, when given, its amount.
    async fn update_status(
        &self,
        id: Uuid,
        status: CostEventStatus,
        amount_usd: Option<f64>,
    ) -> Result<(), LedgerError>;

    /// Reservations still `Reserved` that were created before `cutoff`.
    async fn reserved_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<CostEvent>, LedgerError>;
}

// ---------------------------------------------------------------------------
// MemoryCostEventStore
// ---------------------------------------------------------------------------

/// In-memory reference implementation. Appends and sums run under one lock,
/// which is what lets two concurrent reservations observe each other.
#[derive(Debug, Default, Clone)]
pub struct MemoryCostEventStore {
    events: Arc<RwLock<ahash::AHashMap<Uuid, CostEvent>>>,
}

impl MemoryCostEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored event, unordered. Test/introspection helper.
    pub async fn records(&self) -> Vec<CostEvent> {
        self.events.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl CostEventStore for MemoryCostEventStore {
    async fn append(&self, event: CostEvent) -> Result<Uuid, LedgerError> {
        let id = event.id;
        self.events.write().await.insert(id, event);
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<CostEvent>, LedgerError> {
        Ok(self.events.read().await.get(&id).cloned())
    }

    async fn sum_non_cancelled_since(
        &self,
        since: DateTime<Utc>,
        scope: &CostScope,
    ) -> Result<f64, LedgerError> {
        let events = self.events.read().await;
        let total = events
            .values()
            .filter(|e| e.status != CostEventStatus::Cancelled)
            .filter(|e| e.created_at >= since)
            .filter(|e| scope.matches(e))
            .map(|e| e.amount_usd)
            .sum();
        Ok(total)
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: CostEventStatus,
        amount_usd: Option<f64>,
    ) -> Result<(), LedgerError> {
        let mut events = self.events.write().await;
        let event = events.get_mut(&id).ok_or(LedgerError::NotFound {
            entity: "cost event",
            id,
        })?;
        event.status = status;
        if let Some(amount) = amount_usd {
            event.amount_usd = amount;
        }
        event.updated_at = Utc::now();
        Ok(())
    }

    async fn reserved_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<CostEvent>, LedgerError> {
        let events = self.events.read().await;
        Ok(events
            .values()
            .filter(|e| e.status == CostEventStatus::Reserved && e.created_at < cutoff)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    // -- scope matching --

    #[test]
    fn agent_scope_matches_by_agent_id() {
        let agent = Uuid::new_v4();
        let event = CostEvent::settled(agent, 1.0);
        assert!(CostScope::Agent(agent).matches(&event));
        assert!(!CostScope::Agent(Uuid::new_v4()).matches(&event));
    }

    #[test]
    fn user_scope_requires_matching_org_when_given() {
        let user = Uuid::new_v4();
        let org = Uuid::new_v4();
        let event = CostEvent::settled(Uuid::new_v4(), 1.0)
            .with_user(user)
            .with_organization(org);

        let scoped = CostScope::User {
            user_id: user,
            organization_id: Some(org),
        };
        assert!(scoped.matches(&event));

        let wrong_org = CostScope::User {
            user_id: user,
            organization_id: Some(Uuid::new_v4()),
        };
        assert!(!wrong_org.matches(&event));

        let any_org = CostScope::User {
            user_id: user,
            organization_id: None,
        };
        assert!(any_org.matches(&event));
    }

    // -- memory store --

    #[tokio::test]
    async fn sum_excludes_cancelled_events() {
        let store = MemoryCostEventStore::new();
        let agent = Uuid::new_v4();
        let since = Utc::now() - Duration::hours(1);

        store.append(CostEvent::settled(agent, 2.0)).await.unwrap();
        let cancelled_id = store
            .append(CostEvent::reservation(Uuid::new_v4(), agent, 5.0))
            .await
            .unwrap();
        store
            .update_status(cancelled_id, CostEventStatus::Cancelled, Some(0.0))
            .await
            .unwrap();

        let sum = store
            .sum_non_cancelled_since(since, &CostScope::Agent(agent))
            .await
            .unwrap();
        assert_eq!(sum, 2.0);
    }

    #[tokio::test]
    async fn sum_excludes_events_before_since() {
        let store = MemoryCostEventStore::new();
        let agent = Uuid::new_v4();
        let since = Utc::now() - Duration::minutes(5);

        let old = CostEvent::settled(agent, 9.0).with_created_at(Utc::now() - Duration::days(40));
        store.append(old).await.unwrap();
        store.append(CostEvent::settled(agent, 1.5)).await.unwrap();

        let sum = store
            .sum_non_cancelled_since(since, &CostScope::Agent(agent))
            .await
            .unwrap();
        assert_eq!(sum, 1.5);
    }

    #[tokio::test]
    async fn reservations_count_toward_sums() {
        let store = MemoryCostEventStore::new();
        let agent = Uuid::new_v4();
        let since = Utc::now() - Duration::hours(1);

        store
            .append(CostEvent::reservation(Uuid::new_v4(), agent, 60.0))
            .await
            .unwrap();

        let sum = store
            .sum_non_cancelled_since(since, &CostScope::Agent(agent))
            .await
            .unwrap();
        assert_eq!(sum, 60.0);
    }

    #[tokio::test]
    async fn update_status_rejects_unknown_id() {
        let store = MemoryCostEventStore::new();
        let err = store
            .update_status(Uuid::new_v4(), CostEventStatus::Finalized, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { .. }));
    }

    #[tokio::test]
    async fn reserved_older_than_ignores_recent_and_finalized() {
        let store = MemoryCostEventStore::new();
        let agent = Uuid::new_v4();

        let stale = CostEvent::reservation(Uuid::new_v4(), agent, 1.0)
            .with_created_at(Utc::now() - Duration::hours(2));
        let stale_id = store.append(stale).await.unwrap();

        store
            .append(CostEvent::reservation(Uuid::new_v4(), agent, 1.0))
            .await
            .unwrap();

        let finalized = CostEvent::settled(agent, 1.0)
            .with_created_at(Utc::now() - Duration::hours(2));
        store.append(finalized).await.unwrap();

        let cutoff = Utc::now() - Duration::minutes(30);
        let stale_events = store.reserved_older_than(cutoff).await.unwrap();
        assert_eq!(stale_events.len(), 1);
        assert_eq!(stale_events[0].id, stale_id);
    }
}
