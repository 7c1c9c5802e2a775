use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// key: billing-plan -> closed set of sellable plans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanId {
    Free,
    Monthly,
    MonthlyPro,
    Lifetime,
}

impl PlanId {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanId::Free => "free",
            PlanId::Monthly => "monthly",
            PlanId::MonthlyPro => "monthly_pro",
            PlanId::Lifetime => "lifetime",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "free" => Some(Self::Free),
            "monthly" => Some(Self::Monthly),
            "monthly_pro" => Some(Self::MonthlyPro),
            "lifetime" => Some(Self::Lifetime),
            _ => None,
        }
    }

    /// Recurring plans renew on a monthly cycle; lifetime and free never do.
    pub fn is_recurring(&self) -> bool {
        matches!(self, PlanId::Monthly | PlanId::MonthlyPro)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementStatus {
    None,
    Active,
    Canceled,
    PastDue,
}

impl EntitlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntitlementStatus::None => "none",
            EntitlementStatus::Active => "active",
            EntitlementStatus::Canceled => "canceled",
            EntitlementStatus::PastDue => "past_due",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Self::None),
            "active" => Some(Self::Active),
            "canceled" => Some(Self::Canceled),
            "past_due" => Some(Self::PastDue),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Stripe,
    Paypal,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Stripe => "stripe",
            Provider::Paypal => "paypal",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "stripe" => Some(Self::Stripe),
            "paypal" => Some(Self::Paypal),
            _ => None,
        }
    }
}

/// key: billing-binding -> (provider, subscription) tag on a flat entitlement
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionRef {
    pub provider: Provider,
    pub subscription_id: String,
}

/// key: billing-entitlement-model -> canonical plan record per user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entitlement {
    pub user_id: i32,
    pub plan_id: PlanId,
    pub status: EntitlementStatus,
    pub provider: Option<Provider>,
    pub provider_subscription_id: Option<String>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub last_reconciled_event_id: Option<String>,
    /// `occurred_at` of the newest applied provider event.
    pub last_event_at: Option<DateTime<Utc>>,
    pub recent_event_ids: Vec<String>,
    pub superseded: Vec<SubscriptionRef>,
    pub role_elevated: bool,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl Entitlement {
    pub fn new(user_id: i32, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            plan_id: PlanId::Free,
            status: EntitlementStatus::None,
            provider: None,
            provider_subscription_id: None,
            current_period_start: None,
            current_period_end: None,
            last_reconciled_event_id: None,
            last_event_at: None,
            recent_event_ids: Vec::new(),
            superseded: Vec::new(),
            role_elevated: false,
            version: 0,
            updated_at: now,
        }
    }

    pub fn binding(&self) -> Option<SubscriptionRef> {
        match (self.provider, self.provider_subscription_id.as_ref()) {
            (Some(provider), Some(subscription_id)) => Some(SubscriptionRef {
                provider,
                subscription_id: subscription_id.clone(),
            }),
            _ => None,
        }
    }

    pub fn has_applied(&self, event_id: &str) -> bool {
        self.last_reconciled_event_id.as_deref() == Some(event_id)
            || self.recent_event_ids.iter().any(|id| id == event_id)
    }

    pub fn period_covers(&self, at: DateTime<Utc>) -> bool {
        let started = self.current_period_start.map_or(true, |start| start <= at);
        let not_ended = self.current_period_end.map_or(true, |end| at < end);
        started && not_ended
    }

    /// Plan whose quota applies right now. Non-active states keep their paid
    /// plan until the paid-through date (plus `grace` for renewals that are
    /// late rather than canceled), then fall back to free.
    pub fn effective_plan(&self, now: DateTime<Utc>, grace: Duration) -> PlanId {
        let grants = match self.status {
            EntitlementStatus::None => false,
            EntitlementStatus::Active => self
                .current_period_end
                .map_or(true, |end| now < end + grace),
            EntitlementStatus::PastDue => self
                .current_period_end
                .map_or(false, |end| now < end + grace),
            EntitlementStatus::Canceled => self.current_period_end.map_or(false, |end| now < end),
        };
        if grants {
            self.plan_id
        } else {
            PlanId::Free
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SubscriptionActivated,
    SubscriptionRenewed,
    SubscriptionCanceled,
    SubscriptionSuspended,
    OneTimePaid,
    Ignored,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SubscriptionActivated => "subscription_activated",
            EventKind::SubscriptionRenewed => "subscription_renewed",
            EventKind::SubscriptionCanceled => "subscription_canceled",
            EventKind::SubscriptionSuspended => "subscription_suspended",
            EventKind::OneTimePaid => "one_time_paid",
            EventKind::Ignored => "ignored",
        }
    }

    /// Kinds that grant (or re-grant) a paid plan.
    pub fn is_payment(&self) -> bool {
        matches!(
            self,
            EventKind::SubscriptionActivated
                | EventKind::SubscriptionRenewed
                | EventKind::OneTimePaid
        )
    }
}

/// key: billing-normalized-event -> provider agnostic notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedProviderEvent {
    pub event_id: String,
    pub provider: Provider,
    pub provider_subscription_id: String,
    pub kind: EventKind,
    pub occurred_at: DateTime<Utc>,
    pub amount_minor: i64,
    pub currency: String,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub plan_hint: Option<String>,
    pub user_ref: Option<i32>,
    pub source_type: String,
    pub synthetic: bool,
}

impl NormalizedProviderEvent {
    pub fn subscription(&self) -> SubscriptionRef {
        SubscriptionRef {
            provider: self.provider,
            subscription_id: self.provider_subscription_id.clone(),
        }
    }
}

/// key: billing-side-effects -> intents emitted once per causing event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SideEffectIntent {
    RevenueRecorded {
        user_id: i32,
        provider: Provider,
        plan_id: PlanId,
        amount_minor: i64,
        currency: String,
        event_id: String,
    },
    RoleElevated {
        user_id: i32,
        plan_id: PlanId,
        event_id: String,
    },
    RoleRevoked {
        user_id: i32,
        plan_id: PlanId,
        lapsed_at: DateTime<Utc>,
    },
}

impl SideEffectIntent {
    pub fn kind(&self) -> &'static str {
        match self {
            SideEffectIntent::RevenueRecorded { .. } => "revenue_recorded",
            SideEffectIntent::RoleElevated { .. } => "role_elevated",
            SideEffectIntent::RoleRevoked { .. } => "role_revoked",
        }
    }

    pub fn user_id(&self) -> i32 {
        match self {
            SideEffectIntent::RevenueRecorded { user_id, .. }
            | SideEffectIntent::RoleElevated { user_id, .. }
            | SideEffectIntent::RoleRevoked { user_id, .. } => *user_id,
        }
    }

    /// Stable across redeliveries so downstream sinks can dedupe.
    pub fn intent_id(&self) -> String {
        match self {
            SideEffectIntent::RevenueRecorded { event_id, .. }
            | SideEffectIntent::RoleElevated { event_id, .. } => {
                format!("{event_id}:{}", self.kind())
            }
            SideEffectIntent::RoleRevoked {
                user_id, lapsed_at, ..
            } => format!("{user_id}:{}:{}", lapsed_at.timestamp(), self.kind()),
        }
    }
}

/// key: billing-usage-window -> per user, per period consumption
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct UsageCounter {
    pub user_id: i32,
    pub period_key: String,
    pub characters_consumed: i64,
    pub characters_reserved: i64,
}

impl UsageCounter {
    pub fn empty(user_id: i32, period_key: &str) -> Self {
        Self {
            user_id,
            period_key: period_key.to_string(),
            characters_consumed: 0,
            characters_reserved: 0,
        }
    }

    pub fn in_use(&self) -> i64 {
        self.characters_consumed + self.characters_reserved
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    Pending,
    Committed,
    Released,
}

impl ReservationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationState::Pending => "pending",
            ReservationState::Committed => "committed",
            ReservationState::Released => "released",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "committed" => Some(Self::Committed),
            "released" => Some(Self::Released),
            _ => None,
        }
    }
}

/// key: billing-reservation -> provisional hold against a usage counter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub user_id: i32,
    pub period_key: String,
    pub characters: i64,
    pub state: ReservationState,
    pub committed_characters: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageQuotaOutcome {
    pub allowed: bool,
    pub plan_id: PlanId,
    pub period_key: String,
    pub limit_characters: Option<i64>,
    pub consumed_characters: i64,
    pub reserved_characters: i64,
    pub remaining_characters: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, 12, 0, 0).unwrap()
    }

    fn paid(status: EntitlementStatus) -> Entitlement {
        let mut entitlement = Entitlement::new(1, at(1));
        entitlement.plan_id = PlanId::Monthly;
        entitlement.status = status;
        entitlement.current_period_start = Some(at(1));
        entitlement.current_period_end = Some(at(10));
        entitlement
    }

    #[test]
    fn canceled_plan_holds_until_period_end() {
        let entitlement = paid(EntitlementStatus::Canceled);
        assert_eq!(
            entitlement.effective_plan(at(9), Duration::days(3)),
            PlanId::Monthly
        );
        assert_eq!(
            entitlement.effective_plan(at(10), Duration::days(3)),
            PlanId::Free
        );
    }

    #[test]
    fn past_due_plan_holds_through_grace() {
        let entitlement = paid(EntitlementStatus::PastDue);
        assert_eq!(
            entitlement.effective_plan(at(12), Duration::days(3)),
            PlanId::Monthly
        );
        assert_eq!(
            entitlement.effective_plan(at(13), Duration::days(3)),
            PlanId::Free
        );
    }

    #[test]
    fn lifetime_without_period_never_lapses() {
        let mut entitlement = Entitlement::new(1, at(1));
        entitlement.plan_id = PlanId::Lifetime;
        entitlement.status = EntitlementStatus::Active;
        assert_eq!(
            entitlement.effective_plan(at(28), Duration::zero()),
            PlanId::Lifetime
        );
    }

    #[test]
    fn intent_ids_are_stable() {
        let intent = SideEffectIntent::RoleElevated {
            user_id: 4,
            plan_id: PlanId::Monthly,
            event_id: "evt_1".into(),
        };
        assert_eq!(intent.intent_id(), "evt_1:role_elevated");
        assert_eq!(intent.intent_id(), intent.clone().intent_id());
    }
}
