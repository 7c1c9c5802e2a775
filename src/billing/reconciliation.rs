use std::sync::Arc;

use chrono::{DateTime, Duration, Months, Utc};
use tracing::{debug, info, warn};

use super::dispatcher::DispatchHandle;
use super::error::{BillingError, BillingResult};
use super::models::{
    Entitlement, EntitlementStatus, EventKind, NormalizedProviderEvent, PlanId, SideEffectIntent,
};
use super::store::EntitlementStore;

/// What the reducer decided about one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    Duplicate,
    Stale,
    ProviderConflict,
    Ignored,
}

impl TransitionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionOutcome::Applied => "applied",
            TransitionOutcome::Duplicate => "duplicate",
            TransitionOutcome::Stale => "stale",
            TransitionOutcome::ProviderConflict => "provider_conflict",
            TransitionOutcome::Ignored => "ignored",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub entitlement: Entitlement,
    pub intents: Vec<SideEffectIntent>,
    pub outcome: TransitionOutcome,
}

impl Transition {
    fn unchanged(current: &Entitlement, outcome: TransitionOutcome) -> Self {
        Self {
            entitlement: current.clone(),
            intents: Vec::new(),
            outcome,
        }
    }
}

/// key: billing-reconciler-reducer -> (entitlement, event) -> next entitlement + intents
///
/// Pure: no I/O, no clock reads beyond `now`. The caller persists the result
/// with a version-conditioned write and dispatches intents afterwards.
pub fn apply(
    current: &Entitlement,
    event: &NormalizedProviderEvent,
    now: DateTime<Utc>,
    recent_window: usize,
) -> BillingResult<Transition> {
    if event.kind == EventKind::Ignored {
        return Ok(Transition::unchanged(current, TransitionOutcome::Ignored));
    }
    if current.has_applied(&event.event_id) {
        return Ok(Transition::unchanged(current, TransitionOutcome::Duplicate));
    }

    let incoming = event.subscription();
    if current.superseded.contains(&incoming) {
        return Ok(Transition::unchanged(
            current,
            TransitionOutcome::ProviderConflict,
        ));
    }

    let not_older = current
        .last_event_at
        .map_or(true, |watermark| event.occurred_at >= watermark);
    let bound = current.binding();
    let same_subscription = bound.as_ref() == Some(&incoming);

    if same_subscription && !not_older {
        return Ok(Transition::unchanged(current, TransitionOutcome::Stale));
    }

    let mut next = current.clone();
    match bound {
        Some(previous) if previous != incoming => {
            // Only a newer payment may move the binding to another subscription.
            if !(event.kind.is_payment() && not_older) {
                return Ok(Transition::unchanged(
                    current,
                    TransitionOutcome::ProviderConflict,
                ));
            }
            next.superseded.push(previous);
        }
        _ => {}
    }

    let mut intents = Vec::new();
    match event.kind {
        EventKind::SubscriptionActivated | EventKind::SubscriptionRenewed | EventKind::OneTimePaid => {
            let plan_id = payment_plan(current, event, same_subscription)?;
            let covered = same_subscription
                && current.status == EntitlementStatus::Active
                && current.period_covers(event.occurred_at);
            let (period_start, period_end) = payment_period(current, event, plan_id, covered);

            next.plan_id = plan_id;
            next.status = EntitlementStatus::Active;
            next.current_period_start = period_start;
            next.current_period_end = period_end;

            if !covered {
                intents.push(SideEffectIntent::RevenueRecorded {
                    user_id: current.user_id,
                    provider: event.provider,
                    plan_id,
                    amount_minor: event.amount_minor,
                    currency: event.currency.clone(),
                    event_id: event.event_id.clone(),
                });
                intents.push(SideEffectIntent::RoleElevated {
                    user_id: current.user_id,
                    plan_id,
                    event_id: event.event_id.clone(),
                });
                next.role_elevated = true;
            }
        }
        EventKind::SubscriptionCanceled | EventKind::SubscriptionSuspended => {
            if let Some(hint) = &event.plan_hint {
                next.plan_id =
                    PlanId::from_str(hint).ok_or_else(|| BillingError::UnknownPlan(hint.clone()))?;
            }
            next.status = if event.kind == EventKind::SubscriptionCanceled {
                EntitlementStatus::Canceled
            } else {
                EntitlementStatus::PastDue
            };
            if let Some(end) = event.period_end {
                next.current_period_start = event.period_start.or(next.current_period_start);
                next.current_period_end = Some(end);
            }
        }
        EventKind::Ignored => {
            return Ok(Transition::unchanged(current, TransitionOutcome::Ignored));
        }
    }

    next.provider = Some(event.provider);
    next.provider_subscription_id = Some(event.provider_subscription_id.clone());
    next.last_reconciled_event_id = Some(event.event_id.clone());
    next.recent_event_ids.push(event.event_id.clone());
    if next.recent_event_ids.len() > recent_window {
        let overflow = next.recent_event_ids.len() - recent_window;
        next.recent_event_ids.drain(..overflow);
    }
    next.last_event_at = Some(
        current
            .last_event_at
            .map_or(event.occurred_at, |watermark| watermark.max(event.occurred_at)),
    );
    next.updated_at = now;

    Ok(Transition {
        entitlement: next,
        intents,
        outcome: TransitionOutcome::Applied,
    })
}

/// Plan granted by a payment. A bound subscription may omit the hint on renewal;
/// anything else without a recognisable plan is held.
fn payment_plan(
    current: &Entitlement,
    event: &NormalizedProviderEvent,
    same_subscription: bool,
) -> BillingResult<PlanId> {
    match &event.plan_hint {
        Some(hint) => PlanId::from_str(hint).ok_or_else(|| BillingError::UnknownPlan(hint.clone())),
        None if same_subscription && current.plan_id != PlanId::Free => Ok(current.plan_id),
        None => Err(BillingError::UnknownPlan(format!(
            "<missing plan for {}>",
            event.provider_subscription_id
        ))),
    }
}

fn payment_period(
    current: &Entitlement,
    event: &NormalizedProviderEvent,
    plan_id: PlanId,
    covered: bool,
) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    if plan_id == PlanId::Lifetime {
        return (None, None);
    }
    if let Some(end) = event.period_end {
        return (Some(event.period_start.unwrap_or(event.occurred_at)), Some(end));
    }
    if covered {
        return (current.current_period_start, current.current_period_end);
    }
    let start = event.period_start.unwrap_or(event.occurred_at);
    (Some(start), start.checked_add_months(Months::new(1)))
}

/// Revokes an outstanding role elevation once the paid-through date plus grace
/// has passed. Returns `None` while the plan still applies.
pub fn lapse(current: &Entitlement, now: DateTime<Utc>, grace: Duration) -> Option<Transition> {
    if !current.role_elevated || current.effective_plan(now, grace) != PlanId::Free {
        return None;
    }

    let mut next = current.clone();
    next.role_elevated = false;
    if next.status == EntitlementStatus::Active {
        next.status = EntitlementStatus::PastDue;
    }
    next.updated_at = now;

    Some(Transition {
        intents: vec![SideEffectIntent::RoleRevoked {
            user_id: current.user_id,
            plan_id: current.plan_id,
            lapsed_at: current.current_period_end.unwrap_or(now),
        }],
        entitlement: next,
        outcome: TransitionOutcome::Applied,
    })
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerSettings {
    pub max_attempts: u32,
    pub recent_event_window: usize,
    pub grace: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            recent_event_window: 32,
            grace: Duration::hours(72),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileReport {
    pub user_id: i32,
    pub outcome: TransitionOutcome,
    pub entitlement: Entitlement,
    pub intents: Vec<SideEffectIntent>,
}

/// key: billing-reconciler -> load, reduce, compare-and-swap, dispatch
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn EntitlementStore>,
    dispatcher: DispatchHandle,
    settings: ReconcilerSettings,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        dispatcher: DispatchHandle,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            store,
            dispatcher,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn EntitlementStore> {
        &self.store
    }

    pub fn settings(&self) -> ReconcilerSettings {
        self.settings
    }

    /// Entry point for verified webhook events: resolves the owning user from
    /// the stored binding or the event's own reference, then reconciles.
    pub async fn process(&self, event: &NormalizedProviderEvent) -> BillingResult<ReconcileReport> {
        if event.kind == EventKind::Ignored {
            return Err(BillingError::MalformedPayload(format!(
                "{} events are not reconciled",
                event.source_type
            )));
        }
        let user_id = self.resolve_user(event).await?;
        self.process_for_user(user_id, event).await
    }

    /// Reconciles an event for a user whose ownership is already established,
    /// as in client-initiated activation.
    pub async fn process_for_user(
        &self,
        user_id: i32,
        event: &NormalizedProviderEvent,
    ) -> BillingResult<ReconcileReport> {
        for attempt in 1..=self.settings.max_attempts {
            let current = self.store.load(user_id).await?;
            let transition =
                match apply(&current, event, Utc::now(), self.settings.recent_event_window) {
                    Ok(transition) => transition,
                    Err(err) if err.is_held() => {
                        self.hold(event, &err).await?;
                        return Err(err);
                    }
                    Err(err) => return Err(err),
                };

            if transition.outcome != TransitionOutcome::Applied {
                self.log_skipped(user_id, event, &current, transition.outcome);
                return Ok(ReconcileReport {
                    user_id,
                    outcome: transition.outcome,
                    entitlement: transition.entitlement,
                    intents: Vec::new(),
                });
            }

            match self
                .store
                .compare_and_swap(user_id, current.version, &transition.entitlement)
                .await
            {
                Ok(true) => {
                    let mut entitlement = transition.entitlement;
                    entitlement.version = current.version + 1;
                    info!(
                        user_id,
                        event_id = %event.event_id,
                        provider = event.provider.as_str(),
                        kind = event.kind.as_str(),
                        plan = entitlement.plan_id.as_str(),
                        status = entitlement.status.as_str(),
                        intents = transition.intents.len(),
                        synthetic = event.synthetic,
                        "entitlement reconciled"
                    );
                    self.dispatcher.submit(transition.intents.clone());
                    return Ok(ReconcileReport {
                        user_id,
                        outcome: TransitionOutcome::Applied,
                        entitlement,
                        intents: transition.intents,
                    });
                }
                Ok(false) => {
                    debug!(
                        user_id,
                        attempt,
                        event_id = %event.event_id,
                        "entitlement version moved; retrying"
                    );
                }
                Err(err @ BillingError::ProviderConflict { .. }) => {
                    warn!(
                        user_id,
                        event_id = %event.event_id,
                        subscription = %event.provider_subscription_id,
                        "ProviderConflict: subscription already bound to another user"
                    );
                    self.hold(event, &err).await?;
                    return Err(err);
                }
                Err(err) => return Err(err),
            }
        }

        warn!(
            user_id,
            event_id = %event.event_id,
            attempts = self.settings.max_attempts,
            "entitlement update kept conflicting"
        );
        Err(BillingError::ReconciliationConflict {
            user_id,
            attempts: self.settings.max_attempts,
        })
    }

    /// Grace sweep step for one user. Emits `RoleRevoked` at most once per lapse.
    pub async fn expire_lapsed(
        &self,
        user_id: i32,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<SideEffectIntent>> {
        for attempt in 1..=self.settings.max_attempts {
            let current = self.store.load(user_id).await?;
            let Some(transition) = lapse(&current, now, self.settings.grace) else {
                return Ok(None);
            };
            if self
                .store
                .compare_and_swap(user_id, current.version, &transition.entitlement)
                .await?
            {
                info!(
                    user_id,
                    plan = current.plan_id.as_str(),
                    status = transition.entitlement.status.as_str(),
                    "entitlement lapsed; role revoked"
                );
                let revoked = transition.intents.first().cloned();
                self.dispatcher.submit(transition.intents);
                return Ok(revoked);
            }
            debug!(user_id, attempt, "entitlement version moved during lapse; retrying");
        }
        Err(BillingError::ReconciliationConflict {
            user_id,
            attempts: self.settings.max_attempts,
        })
    }

    async fn resolve_user(&self, event: &NormalizedProviderEvent) -> BillingResult<i32> {
        let subscription = event.subscription();
        if let Some(owner) = self.store.find_user_by_subscription(&subscription).await? {
            if let Some(claimed) = event.user_ref.filter(|claimed| *claimed != owner) {
                warn!(
                    owner,
                    claimed,
                    subscription = %subscription.subscription_id,
                    "event metadata names a different user than the stored binding"
                );
            }
            return Ok(owner);
        }
        if let Some(user_id) = event.user_ref {
            return Ok(user_id);
        }

        warn!(
            event_id = %event.event_id,
            provider = event.provider.as_str(),
            kind = event.kind.as_str(),
            subscription = %event.provider_subscription_id,
            "no user bound to subscription yet; asking provider to redeliver"
        );
        Err(BillingError::UnresolvedSubscriber {
            provider: event.provider,
            subscription_id: event.provider_subscription_id.clone(),
        })
    }

    async fn hold(&self, event: &NormalizedProviderEvent, reason: &BillingError) -> BillingResult<()> {
        warn!(
            event_id = %event.event_id,
            provider = event.provider.as_str(),
            kind = event.kind.as_str(),
            reason = %reason,
            "provider event held for review"
        );
        self.store.hold_event(event, &reason.to_string()).await
    }

    fn log_skipped(
        &self,
        user_id: i32,
        event: &NormalizedProviderEvent,
        current: &Entitlement,
        outcome: TransitionOutcome,
    ) {
        match outcome {
            TransitionOutcome::ProviderConflict => warn!(
                user_id,
                event_id = %event.event_id,
                incoming = %event.provider_subscription_id,
                bound = current.provider_subscription_id.as_deref().unwrap_or("-"),
                kind = event.kind.as_str(),
                "ProviderConflict: event for a non-current subscription ignored"
            ),
            _ => debug!(
                user_id,
                event_id = %event.event_id,
                outcome = outcome.as_str(),
                "provider event left entitlement unchanged"
            ),
        }
    }
}
