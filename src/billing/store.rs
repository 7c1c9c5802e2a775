use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::error::{BillingError, BillingResult};
use super::models::{
    Entitlement, EntitlementStatus, NormalizedProviderEvent, PlanId, Provider, SubscriptionRef,
};

/// key: entitlement-store -> canonical plan truth, optimistic concurrency
#[async_trait]
pub trait EntitlementStore: Send + Sync {
    /// Current record for `user_id`, created as `status = none` on first read.
    async fn load(&self, user_id: i32) -> BillingResult<Entitlement>;

    /// Writes `entitlement` only if the stored version still equals
    /// `expected_version`. Returns `false` when another writer got there first.
    async fn compare_and_swap(
        &self,
        user_id: i32,
        expected_version: i64,
        entitlement: &Entitlement,
    ) -> BillingResult<bool>;

    /// User bound to a subscription, either currently or as a superseded binding.
    async fn find_user_by_subscription(
        &self,
        subscription: &SubscriptionRef,
    ) -> BillingResult<Option<i32>>;

    /// Parks an event for manual review. The entitlement is not touched.
    async fn hold_event(&self, event: &NormalizedProviderEvent, reason: &str) -> BillingResult<()>;

    /// Users with an outstanding role elevation, for the grace sweep.
    async fn list_elevated(&self) -> BillingResult<Vec<i32>>;
}

#[derive(Debug, Clone)]
pub struct HeldEvent {
    pub event: NormalizedProviderEvent,
    pub reason: String,
    pub held_at: DateTime<Utc>,
}

/// key: entitlement-store-memory -> per-user records in a sharded map
#[derive(Default)]
pub struct InMemoryEntitlementStore {
    entitlements: DashMap<i32, Entitlement>,
    bindings: DashMap<SubscriptionRef, i32>,
    superseded_owners: DashMap<SubscriptionRef, i32>,
    held: DashMap<String, HeldEvent>,
}

impl InMemoryEntitlementStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn held_events(&self) -> Vec<HeldEvent> {
        self.held.iter().map(|entry| entry.value().clone()).collect()
    }
}

#[async_trait]
impl EntitlementStore for InMemoryEntitlementStore {
    async fn load(&self, user_id: i32) -> BillingResult<Entitlement> {
        Ok(self
            .entitlements
            .entry(user_id)
            .or_insert_with(|| Entitlement::new(user_id, Utc::now()))
            .clone())
    }

    async fn compare_and_swap(
        &self,
        user_id: i32,
        expected_version: i64,
        entitlement: &Entitlement,
    ) -> BillingResult<bool> {
        let mut current = self
            .entitlements
            .entry(user_id)
            .or_insert_with(|| Entitlement::new(user_id, Utc::now()));
        if current.version != expected_version {
            return Ok(false);
        }

        let previous = current.binding();
        let incoming = entitlement.binding();
        if let Some(binding) = incoming.clone() {
            match self.bindings.entry(binding) {
                Entry::Occupied(owner) if *owner.get() != user_id => {
                    return Err(BillingError::ProviderConflict {
                        subscription_id: owner.key().subscription_id.clone(),
                    });
                }
                Entry::Occupied(_) => {}
                Entry::Vacant(slot) => {
                    slot.insert(user_id);
                }
            }
        }
        if let Some(moved) = previous.filter(|previous| incoming.as_ref() != Some(previous)) {
            self.bindings.remove_if(&moved, |_, owner| *owner == user_id);
            self.superseded_owners.insert(moved, user_id);
        }

        let mut next = entitlement.clone();
        next.user_id = user_id;
        next.version = expected_version + 1;
        *current = next;
        Ok(true)
    }

    async fn find_user_by_subscription(
        &self,
        subscription: &SubscriptionRef,
    ) -> BillingResult<Option<i32>> {
        Ok(self
            .bindings
            .get(subscription)
            .or_else(|| self.superseded_owners.get(subscription))
            .map(|owner| *owner))
    }

    async fn hold_event(&self, event: &NormalizedProviderEvent, reason: &str) -> BillingResult<()> {
        self.held.insert(
            format!("{}:{}", event.provider.as_str(), event.event_id),
            HeldEvent {
                event: event.clone(),
                reason: reason.to_string(),
                held_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn list_elevated(&self) -> BillingResult<Vec<i32>> {
        Ok(self
            .entitlements
            .iter()
            .filter(|entry| entry.role_elevated)
            .map(|entry| *entry.key())
            .collect())
    }
}

/// key: entitlement-store-postgres -> version-conditioned updates
#[derive(Clone)]
pub struct PgEntitlementStore {
    pool: PgPool,
}

impl PgEntitlementStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const BINDING_CONSTRAINT: &str = "entitlements_provider_subscription_key";

#[async_trait]
impl EntitlementStore for PgEntitlementStore {
    async fn load(&self, user_id: i32) -> BillingResult<Entitlement> {
        sqlx::query(
            r#"
            INSERT INTO entitlements (user_id, plan_id, status, provider)
            VALUES ($1, 'free', 'none', 'none')
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query_as::<_, EntitlementRow>("SELECT * FROM entitlements WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Entitlement::try_from(row)
    }

    async fn compare_and_swap(
        &self,
        user_id: i32,
        expected_version: i64,
        entitlement: &Entitlement,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE entitlements SET
                plan_id = $3,
                status = $4,
                provider = $5,
                provider_subscription_id = $6,
                current_period_start = $7,
                current_period_end = $8,
                last_reconciled_event_id = $9,
                last_event_at = $10,
                recent_event_ids = $11,
                superseded = $12,
                role_elevated = $13,
                updated_at = $14,
                version = version + 1
            WHERE user_id = $1 AND version = $2
            "#,
        )
        .bind(user_id)
        .bind(expected_version)
        .bind(entitlement.plan_id.as_str())
        .bind(entitlement.status.as_str())
        .bind(entitlement.provider.map_or("none", |provider| provider.as_str()))
        .bind(&entitlement.provider_subscription_id)
        .bind(entitlement.current_period_start)
        .bind(entitlement.current_period_end)
        .bind(&entitlement.last_reconciled_event_id)
        .bind(entitlement.last_event_at)
        .bind(&entitlement.recent_event_ids)
        .bind(Json(&entitlement.superseded))
        .bind(entitlement.role_elevated)
        .bind(entitlement.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(done.rows_affected() == 1),
            Err(sqlx::Error::Database(db_err)) if db_err.constraint() == Some(BINDING_CONSTRAINT) => {
                Err(BillingError::ProviderConflict {
                    subscription_id: entitlement
                        .provider_subscription_id
                        .clone()
                        .unwrap_or_default(),
                })
            }
            Err(err) => Err(BillingError::Database(err)),
        }
    }

    async fn find_user_by_subscription(
        &self,
        subscription: &SubscriptionRef,
    ) -> BillingResult<Option<i32>> {
        let user_id = sqlx::query_scalar::<_, i32>(
            r#"
            SELECT user_id FROM entitlements
            WHERE (provider = $1 AND provider_subscription_id = $2)
               OR superseded @> $3
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(subscription.provider.as_str())
        .bind(&subscription.subscription_id)
        .bind(Json(vec![subscription]))
        .fetch_optional(&self.pool)
        .await?;
        Ok(user_id)
    }

    async fn hold_event(&self, event: &NormalizedProviderEvent, reason: &str) -> BillingResult<()> {
        let payload = serde_json::to_value(event).map_err(|err| anyhow!(err))?;
        sqlx::query(
            r#"
            INSERT INTO held_provider_events (id, provider, event_id, reason, payload)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (provider, event_id)
            DO UPDATE SET reason = EXCLUDED.reason, payload = EXCLUDED.payload, held_at = NOW()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event.provider.as_str())
        .bind(&event.event_id)
        .bind(reason)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_elevated(&self) -> BillingResult<Vec<i32>> {
        let users = sqlx::query_scalar::<_, i32>(
            "SELECT user_id FROM entitlements WHERE role_elevated = TRUE ORDER BY user_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(users)
    }
}

#[derive(Debug, FromRow)]
struct EntitlementRow {
    user_id: i32,
    plan_id: String,
    status: String,
    provider: String,
    provider_subscription_id: Option<String>,
    current_period_start: Option<DateTime<Utc>>,
    current_period_end: Option<DateTime<Utc>>,
    last_reconciled_event_id: Option<String>,
    last_event_at: Option<DateTime<Utc>>,
    recent_event_ids: Vec<String>,
    superseded: Json<Vec<SubscriptionRef>>,
    role_elevated: bool,
    version: i64,
    updated_at: DateTime<Utc>,
}

impl TryFrom<EntitlementRow> for Entitlement {
    type Error = BillingError;

    fn try_from(row: EntitlementRow) -> Result<Self, Self::Error> {
        let plan_id = PlanId::from_str(&row.plan_id)
            .ok_or_else(|| anyhow!("stored plan `{}` is not recognised", row.plan_id))?;
        let status = EntitlementStatus::from_str(&row.status)
            .ok_or_else(|| anyhow!("stored status `{}` is not recognised", row.status))?;
        let provider = match row.provider.as_str() {
            "none" => None,
            other => Some(
                Provider::from_str(other)
                    .ok_or_else(|| anyhow!("stored provider `{other}` is not recognised"))?,
            ),
        };
        Ok(Entitlement {
            user_id: row.user_id,
            plan_id,
            status,
            provider,
            provider_subscription_id: row.provider_subscription_id,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            last_reconciled_event_id: row.last_reconciled_event_id,
            last_event_at: row.last_event_at,
            recent_event_ids: row.recent_event_ids,
            superseded: row.superseded.0,
            role_elevated: row.role_elevated,
            version: row.version,
            updated_at: row.updated_at,
        })
    }
}
