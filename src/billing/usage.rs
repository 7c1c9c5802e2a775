use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use sqlx::{FromRow, PgPool};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::{BillingError, BillingResult};
use super::models::{
    Entitlement, PlanId, Reservation, ReservationState, UsageCounter, UsageQuotaOutcome,
};
use super::store::EntitlementStore;

/// key: billing-quota-policy -> plan to character allowance
#[derive(Debug, Clone, Copy)]
pub struct QuotaPolicy {
    pub free_monthly_characters: i64,
    pub monthly_plan_characters: i64,
    pub grace: Duration,
    pub reservation_ttl: Duration,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            free_monthly_characters: 10_000,
            monthly_plan_characters: 1_000_000,
            grace: Duration::hours(72),
            reservation_ttl: Duration::seconds(120),
        }
    }
}

impl QuotaPolicy {
    /// `None` means unlimited.
    pub fn limit_for(&self, plan_id: PlanId) -> Option<i64> {
        match plan_id {
            PlanId::Free => Some(self.free_monthly_characters),
            PlanId::Monthly => Some(self.monthly_plan_characters),
            PlanId::MonthlyPro | PlanId::Lifetime => None,
        }
    }

    /// Paid plans meter against their billing period; everything else
    /// against the calendar month.
    pub fn period_key(&self, entitlement: &Entitlement, plan_id: PlanId, now: DateTime<Utc>) -> String {
        match entitlement.current_period_start {
            Some(start) if plan_id != PlanId::Free && plan_id == entitlement.plan_id => {
                format!("period:{}", start.timestamp())
            }
            _ => format!("month:{}", now.format("%Y-%m")),
        }
    }
}

/// Result of an atomic check-and-add against one counter.
#[derive(Debug, Clone)]
pub enum ReserveAttempt {
    Reserved(Reservation),
    Exceeded(UsageCounter),
}

/// key: usage-counter-store -> atomic per-counter reservations
#[async_trait]
pub trait UsageCounterStore: Send + Sync {
    async fn counter(&self, user_id: i32, period_key: &str) -> BillingResult<UsageCounter>;

    /// Adds `characters` to the reserved total only if the result stays within
    /// `limit`. The check and the add are one atomic step.
    async fn try_reserve(
        &self,
        user_id: i32,
        period_key: &str,
        characters: i64,
        limit: Option<i64>,
        now: DateTime<Utc>,
    ) -> BillingResult<ReserveAttempt>;

    /// Moves a pending reservation to `committed`, charging at most the
    /// reserved amount. `None` when the reservation is unknown or already final.
    async fn commit(
        &self,
        reservation_id: Uuid,
        actual: i64,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<Reservation>>;

    async fn release(
        &self,
        reservation_id: Uuid,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<Reservation>>;

    async fn pending_created_before(&self, cutoff: DateTime<Utc>) -> BillingResult<Vec<Uuid>>;
}

/// key: usage-ledger -> quota checks over entitlement truth
#[derive(Clone)]
pub struct UsageLedger {
    entitlements: Arc<dyn EntitlementStore>,
    counters: Arc<dyn UsageCounterStore>,
    policy: QuotaPolicy,
}

impl UsageLedger {
    pub fn new(
        entitlements: Arc<dyn EntitlementStore>,
        counters: Arc<dyn UsageCounterStore>,
        policy: QuotaPolicy,
    ) -> Self {
        Self {
            entitlements,
            counters,
            policy,
        }
    }

    pub fn policy(&self) -> QuotaPolicy {
        self.policy
    }

    async fn quota_context(
        &self,
        user_id: i32,
        now: DateTime<Utc>,
    ) -> BillingResult<(PlanId, String, Option<i64>)> {
        let entitlement = self.entitlements.load(user_id).await?;
        let plan_id = entitlement.effective_plan(now, self.policy.grace);
        let period_key = self.policy.period_key(&entitlement, plan_id, now);
        Ok((plan_id, period_key, self.policy.limit_for(plan_id)))
    }

    /// Advisory check. Reserves nothing.
    pub async fn check(&self, user_id: i32, requested: i64) -> BillingResult<UsageQuotaOutcome> {
        let requested = validate_amount(requested)?;
        let (plan_id, period_key, limit) = self.quota_context(user_id, Utc::now()).await?;
        let counter = self.counters.counter(user_id, &period_key).await?;
        let remaining = limit.map(|limit| (limit - counter.in_use()).max(0));
        Ok(UsageQuotaOutcome {
            allowed: remaining.map_or(true, |remaining| requested <= remaining),
            plan_id,
            period_key,
            limit_characters: limit,
            consumed_characters: counter.characters_consumed,
            reserved_characters: counter.characters_reserved,
            remaining_characters: remaining,
        })
    }

    pub async fn check_and_reserve(&self, user_id: i32, requested: i64) -> BillingResult<Reservation> {
        let requested = validate_amount(requested)?;
        let now = Utc::now();
        let (plan_id, period_key, limit) = self.quota_context(user_id, now).await?;
        match self
            .counters
            .try_reserve(user_id, &period_key, requested, limit, now)
            .await?
        {
            ReserveAttempt::Reserved(reservation) => {
                debug!(
                    user_id,
                    reservation = %reservation.id,
                    characters = requested,
                    plan = plan_id.as_str(),
                    period = %period_key,
                    "usage reserved"
                );
                Ok(reservation)
            }
            ReserveAttempt::Exceeded(counter) => {
                let remaining = limit.map_or(i64::MAX, |limit| (limit - counter.in_use()).max(0));
                info!(
                    user_id,
                    requested,
                    remaining,
                    plan = plan_id.as_str(),
                    period = %period_key,
                    "usage quota exceeded"
                );
                Err(BillingError::QuotaExceeded {
                    requested,
                    remaining,
                })
            }
        }
    }

    /// Repeats and commits of already released reservations are no-ops.
    pub async fn commit(&self, reservation_id: Uuid, actual: i64) -> BillingResult<Option<Reservation>> {
        let committed = self
            .counters
            .commit(reservation_id, actual.max(0), Utc::now())
            .await?;
        match &committed {
            Some(reservation) => debug!(
                user_id = reservation.user_id,
                reservation = %reservation.id,
                charged = reservation.committed_characters.unwrap_or_default(),
                reserved = reservation.characters,
                "usage committed"
            ),
            None => debug!(reservation = %reservation_id, "commit ignored; reservation not pending"),
        }
        Ok(committed)
    }

    pub async fn release(&self, reservation_id: Uuid) -> BillingResult<Option<Reservation>> {
        let released = self.counters.release(reservation_id, Utc::now()).await?;
        if let Some(reservation) = &released {
            debug!(
                user_id = reservation.user_id,
                reservation = %reservation.id,
                characters = reservation.characters,
                "usage released"
            );
        }
        Ok(released)
    }

    /// Releases reservations left pending past the TTL. Returns how many.
    pub async fn sweep_abandoned(&self, now: DateTime<Utc>) -> BillingResult<usize> {
        let cutoff = now - self.policy.reservation_ttl;
        let mut released = 0;
        for reservation_id in self.counters.pending_created_before(cutoff).await? {
            match self.counters.release(reservation_id, now).await {
                Ok(Some(reservation)) => {
                    released += 1;
                    warn!(
                        user_id = reservation.user_id,
                        reservation = %reservation.id,
                        characters = reservation.characters,
                        "abandoned reservation released"
                    );
                }
                Ok(None) => {}
                Err(err) => warn!(?err, reservation = %reservation_id, "failed to release abandoned reservation"),
            }
        }
        Ok(released)
    }
}

fn validate_amount(requested: i64) -> BillingResult<i64> {
    if requested < 0 {
        return Err(BillingError::MalformedPayload(format!(
            "requested characters must not be negative, got {requested}"
        )));
    }
    Ok(requested)
}

/// key: usage-counter-memory -> sharded counters and reservations
#[derive(Default)]
pub struct InMemoryUsageStore {
    counters: DashMap<(i32, String), UsageCounter>,
    reservations: DashMap<Uuid, Reservation>,
}

impl InMemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn finish(
        &self,
        reservation_id: Uuid,
        state: ReservationState,
        actual: i64,
        now: DateTime<Utc>,
    ) -> Option<Reservation> {
        // Only pending reservations are tracked; finishing one drops it.
        let (_, mut reservation) = self
            .reservations
            .remove_if(&reservation_id, |_, reservation| {
                reservation.state == ReservationState::Pending
            })?;
        let charged = match state {
            ReservationState::Committed => actual.clamp(0, reservation.characters),
            _ => 0,
        };
        reservation.state = state;
        reservation.finished_at = Some(now);
        if state == ReservationState::Committed {
            reservation.committed_characters = Some(charged);
        }

        let key = (reservation.user_id, reservation.period_key.clone());
        if let Some(mut counter) = self.counters.get_mut(&key) {
            counter.characters_reserved -= reservation.characters;
            counter.characters_consumed += charged;
        }
        Some(reservation)
    }
}

#[async_trait]
impl UsageCounterStore for InMemoryUsageStore {
    async fn counter(&self, user_id: i32, period_key: &str) -> BillingResult<UsageCounter> {
        Ok(self
            .counters
            .get(&(user_id, period_key.to_string()))
            .map(|counter| counter.clone())
            .unwrap_or_else(|| UsageCounter::empty(user_id, period_key)))
    }

    async fn try_reserve(
        &self,
        user_id: i32,
        period_key: &str,
        characters: i64,
        limit: Option<i64>,
        now: DateTime<Utc>,
    ) -> BillingResult<ReserveAttempt> {
        {
            let mut counter = self
                .counters
                .entry((user_id, period_key.to_string()))
                .or_insert_with(|| UsageCounter::empty(user_id, period_key));
            if limit.map_or(false, |limit| counter.in_use() + characters > limit) {
                return Ok(ReserveAttempt::Exceeded(counter.clone()));
            }
            counter.characters_reserved += characters;
        }

        let reservation = Reservation {
            id: Uuid::new_v4(),
            user_id,
            period_key: period_key.to_string(),
            characters,
            state: ReservationState::Pending,
            committed_characters: None,
            created_at: now,
            finished_at: None,
        };
        self.reservations.insert(reservation.id, reservation.clone());
        Ok(ReserveAttempt::Reserved(reservation))
    }

    async fn commit(
        &self,
        reservation_id: Uuid,
        actual: i64,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<Reservation>> {
        Ok(self.finish(reservation_id, ReservationState::Committed, actual, now))
    }

    async fn release(
        &self,
        reservation_id: Uuid,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<Reservation>> {
        Ok(self.finish(reservation_id, ReservationState::Released, 0, now))
    }

    async fn pending_created_before(&self, cutoff: DateTime<Utc>) -> BillingResult<Vec<Uuid>> {
        Ok(self
            .reservations
            .iter()
            .filter(|entry| entry.state == ReservationState::Pending && entry.created_at < cutoff)
            .map(|entry| *entry.key())
            .collect())
    }
}

/// key: usage-counter-postgres -> conditional updates inside transactions
#[derive(Clone)]
pub struct PgUsageStore {
    pool: PgPool,
}

impl PgUsageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn finish(
        &self,
        reservation_id: Uuid,
        state: ReservationState,
        actual: i64,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<Reservation>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, ReservationRow>(
            r#"
            UPDATE usage_reservations SET
                state = $2,
                committed_characters = CASE WHEN $2 = 'committed'
                    THEN LEAST(GREATEST($3, 0), characters) ELSE NULL END,
                finished_at = $4
            WHERE id = $1 AND state = 'pending'
            RETURNING *
            "#,
        )
        .bind(reservation_id)
        .bind(state.as_str())
        .bind(actual)
        .bind(now)
        .fetch_optional(&mut tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let reservation = Reservation::try_from(row)?;

        sqlx::query(
            r#"
            UPDATE usage_counters SET
                characters_reserved = characters_reserved - $3,
                characters_consumed = characters_consumed + $4,
                updated_at = NOW()
            WHERE user_id = $1 AND period_key = $2
            "#,
        )
        .bind(reservation.user_id)
        .bind(&reservation.period_key)
        .bind(reservation.characters)
        .bind(reservation.committed_characters.unwrap_or_default())
        .execute(&mut tx)
        .await?;

        tx.commit().await?;
        Ok(Some(reservation))
    }
}

#[async_trait]
impl UsageCounterStore for PgUsageStore {
    async fn counter(&self, user_id: i32, period_key: &str) -> BillingResult<UsageCounter> {
        let counter = sqlx::query_as::<_, UsageCounter>(
            r#"
            SELECT user_id, period_key, characters_consumed, characters_reserved
            FROM usage_counters WHERE user_id = $1 AND period_key = $2
            "#,
        )
        .bind(user_id)
        .bind(period_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(counter.unwrap_or_else(|| UsageCounter::empty(user_id, period_key)))
    }

    async fn try_reserve(
        &self,
        user_id: i32,
        period_key: &str,
        characters: i64,
        limit: Option<i64>,
        now: DateTime<Utc>,
    ) -> BillingResult<ReserveAttempt> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO usage_counters (user_id, period_key)
            VALUES ($1, $2)
            ON CONFLICT (user_id, period_key) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(period_key)
        .execute(&mut tx)
        .await?;

        let updated = sqlx::query_as::<_, UsageCounter>(
            r#"
            UPDATE usage_counters SET
                characters_reserved = characters_reserved + $3,
                updated_at = NOW()
            WHERE user_id = $1 AND period_key = $2
              AND ($4::BIGINT IS NULL OR characters_consumed + characters_reserved + $3 <= $4)
            RETURNING user_id, period_key, characters_consumed, characters_reserved
            "#,
        )
        .bind(user_id)
        .bind(period_key)
        .bind(characters)
        .bind(limit)
        .fetch_optional(&mut tx)
        .await?;

        if updated.is_none() {
            let counter = sqlx::query_as::<_, UsageCounter>(
                r#"
                SELECT user_id, period_key, characters_consumed, characters_reserved
                FROM usage_counters WHERE user_id = $1 AND period_key = $2
                "#,
            )
            .bind(user_id)
            .bind(period_key)
            .fetch_one(&mut tx)
            .await?;
            tx.rollback().await?;
            return Ok(ReserveAttempt::Exceeded(counter));
        }

        let row = sqlx::query_as::<_, ReservationRow>(
            r#"
            INSERT INTO usage_reservations (id, user_id, period_key, characters, state, created_at)
            VALUES ($1, $2, $3, $4, 'pending', $5)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(period_key)
        .bind(characters)
        .bind(now)
        .fetch_one(&mut tx)
        .await?;
        tx.commit().await?;

        Ok(ReserveAttempt::Reserved(Reservation::try_from(row)?))
    }

    async fn commit(
        &self,
        reservation_id: Uuid,
        actual: i64,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<Reservation>> {
        self.finish(reservation_id, ReservationState::Committed, actual, now)
            .await
    }

    async fn release(
        &self,
        reservation_id: Uuid,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<Reservation>> {
        self.finish(reservation_id, ReservationState::Released, 0, now)
            .await
    }

    async fn pending_created_before(&self, cutoff: DateTime<Utc>) -> BillingResult<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM usage_reservations WHERE state = 'pending' AND created_at < $1",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

#[derive(Debug, FromRow)]
struct ReservationRow {
    id: Uuid,
    user_id: i32,
    period_key: String,
    characters: i64,
    state: String,
    committed_characters: Option<i64>,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<ReservationRow> for Reservation {
    type Error = BillingError;

    fn try_from(row: ReservationRow) -> Result<Self, Self::Error> {
        let state = ReservationState::from_str(&row.state)
            .ok_or_else(|| anyhow!("stored reservation state `{}` is not recognised", row.state))?;
        Ok(Reservation {
            id: row.id,
            user_id: row.user_id,
            period_key: row.period_key,
            characters: row.characters,
            state,
            committed_characters: row.committed_characters,
            created_at: row.created_at,
            finished_at: row.finished_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use crate::billing::models::EntitlementStatus;

    #[test]
    fn period_key_follows_paid_period() {
        let policy = QuotaPolicy::default();
        let now = Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap();
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();

        let mut entitlement = Entitlement::new(1, now);
        assert_eq!(
            policy.period_key(&entitlement, PlanId::Free, now),
            "month:2026-03"
        );

        entitlement.plan_id = PlanId::Monthly;
        entitlement.status = EntitlementStatus::Active;
        entitlement.current_period_start = Some(start);
        assert_eq!(
            policy.period_key(&entitlement, PlanId::Monthly, now),
            format!("period:{}", start.timestamp())
        );
        assert_eq!(
            policy.period_key(&entitlement, PlanId::Free, now),
            "month:2026-03"
        );
    }

    #[test]
    fn unlimited_plans_have_no_limit() {
        let policy = QuotaPolicy::default();
        assert_eq!(policy.limit_for(PlanId::Free), Some(10_000));
        assert_eq!(policy.limit_for(PlanId::Monthly), Some(1_000_000));
        assert_eq!(policy.limit_for(PlanId::MonthlyPro), None);
        assert_eq!(policy.limit_for(PlanId::Lifetime), None);
    }

    #[tokio::test]
    async fn commit_caps_at_reserved_amount() {
        let store = InMemoryUsageStore::new();
        let now = Utc::now();
        let ReserveAttempt::Reserved(reservation) = store
            .try_reserve(1, "month:2026-03", 50, Some(100), now)
            .await
            .unwrap()
        else {
            panic!("reservation should fit");
        };

        let committed = store.commit(reservation.id, 80, now).await.unwrap().unwrap();
        assert_eq!(committed.committed_characters, Some(50));
        assert!(store.commit(reservation.id, 80, now).await.unwrap().is_none());
        assert!(store.release(reservation.id, now).await.unwrap().is_none());

        let counter = store.counter(1, "month:2026-03").await.unwrap();
        assert_eq!(counter.characters_consumed, 50);
        assert_eq!(counter.characters_reserved, 0);
    }

    #[tokio::test]
    async fn finished_reservations_are_not_retained() {
        let store = InMemoryUsageStore::new();
        let now = Utc::now();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let ReserveAttempt::Reserved(reservation) = store
                .try_reserve(2, "month:2026-03", 10, None, now)
                .await
                .unwrap()
            else {
                panic!("unlimited reservation should fit");
            };
            ids.push(reservation.id);
        }

        store.commit(ids[0], 10, now).await.unwrap().unwrap();
        store.release(ids[1], now).await.unwrap().unwrap();

        assert_eq!(store.reservations.len(), 1);
        let later = now + chrono::Duration::minutes(1);
        assert_eq!(store.pending_created_before(later).await.unwrap(), vec![ids[2]]);
        assert!(store.release(ids[0], later).await.unwrap().is_none());
    }
}
