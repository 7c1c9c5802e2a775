use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tokio::sync::mpsc::Receiver;
use voxmeter::billing::{
    dispatch_channel, sweep_lapsed, BillingError, BillingResult, Entitlement, EntitlementStatus,
    EntitlementStore,
    EventKind, EventNormalizer, InMemoryEntitlementStore, NormalizedProviderEvent, PaypalAdapter,
    PlanId, Provider, Reconciler, ReconcilerSettings, SideEffectIntent, StripeAdapter,
    SubscriptionRef, TransitionOutcome,
};

struct Harness {
    reconciler: Reconciler,
    store: Arc<InMemoryEntitlementStore>,
    intents: Receiver<SideEffectIntent>,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(InMemoryEntitlementStore::new());
        let (dispatcher, intents) = dispatch_channel(128);
        let reconciler = Reconciler::new(store.clone(), dispatcher, ReconcilerSettings::default());
        Self {
            reconciler,
            store,
            intents,
        }
    }

    fn drain(&mut self) -> Vec<SideEffectIntent> {
        let mut drained = Vec::new();
        while let Ok(intent) = self.intents.try_recv() {
            drained.push(intent);
        }
        drained
    }
}

fn count(intents: &[SideEffectIntent], kind: &str) -> usize {
    intents.iter().filter(|intent| intent.kind() == kind).count()
}

fn event(
    id: &str,
    provider: Provider,
    subscription: &str,
    kind: EventKind,
    occurred_at: DateTime<Utc>,
) -> NormalizedProviderEvent {
    NormalizedProviderEvent {
        event_id: id.to_string(),
        provider,
        provider_subscription_id: subscription.to_string(),
        kind,
        occurred_at,
        amount_minor: 900,
        currency: "usd".into(),
        period_start: Some(occurred_at),
        period_end: Some(occurred_at + Duration::days(30)),
        plan_hint: Some("monthly".into()),
        user_ref: Some(42),
        source_type: "test".into(),
        synthetic: false,
    }
}

/// Loses every versioned write and counts the attempts.
#[derive(Default)]
struct ContendedStore {
    inner: InMemoryEntitlementStore,
    writes: AtomicU32,
}

#[async_trait]
impl EntitlementStore for ContendedStore {
    async fn load(&self, user_id: i32) -> BillingResult<Entitlement> {
        self.inner.load(user_id).await
    }

    async fn compare_and_swap(
        &self,
        _user_id: i32,
        _expected_version: i64,
        _entitlement: &Entitlement,
    ) -> BillingResult<bool> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(false)
    }

    async fn find_user_by_subscription(
        &self,
        subscription: &SubscriptionRef,
    ) -> BillingResult<Option<i32>> {
        self.inner.find_user_by_subscription(subscription).await
    }

    async fn hold_event(&self, event: &NormalizedProviderEvent, reason: &str) -> BillingResult<()> {
        self.inner.hold_event(event, reason).await
    }

    async fn list_elevated(&self) -> BillingResult<Vec<i32>> {
        self.inner.list_elevated().await
    }
}

fn normalizer() -> EventNormalizer {
    EventNormalizer::new(StripeAdapter, PaypalAdapter::new(HashMap::new()))
}

// key: reconciliation-tests -> first activation
#[tokio::test]
async fn activation_without_entitlement_grants_plan_once() {
    let mut harness = Harness::new();
    let now = Utc::now();
    let activated = event("evt_a", Provider::Stripe, "sub_a", EventKind::SubscriptionActivated, now);

    let report = harness.reconciler.process(&activated).await.unwrap();
    assert_eq!(report.outcome, TransitionOutcome::Applied);
    assert_eq!(report.user_id, 42);
    assert_eq!(report.entitlement.status, EntitlementStatus::Active);
    assert_eq!(report.entitlement.plan_id, PlanId::Monthly);
    assert_eq!(report.entitlement.current_period_end, activated.period_end);

    let intents = harness.drain();
    assert_eq!(count(&intents, "role_elevated"), 1);
    assert_eq!(count(&intents, "revenue_recorded"), 1);
}

#[tokio::test]
async fn redelivered_event_records_revenue_once() {
    let mut harness = Harness::new();
    let activated = event(
        "evt_b",
        Provider::Stripe,
        "sub_b",
        EventKind::SubscriptionActivated,
        Utc::now(),
    );

    for _ in 0..4 {
        harness.reconciler.process(&activated).await.unwrap();
    }

    let intents = harness.drain();
    assert_eq!(count(&intents, "revenue_recorded"), 1);
    let stored = harness.store.load(42).await.unwrap();
    assert_eq!(stored.version, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_redeliveries_record_revenue_once() {
    let mut harness = Harness::new();
    let activated = event(
        "evt_c",
        Provider::Stripe,
        "sub_c",
        EventKind::SubscriptionActivated,
        Utc::now(),
    );

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let reconciler = harness.reconciler.clone();
        let activated = activated.clone();
        tasks.push(tokio::spawn(async move { reconciler.process(&activated).await }));
    }
    let mut applied = 0;
    for task in tasks {
        let report = task.await.unwrap().unwrap();
        if report.outcome == TransitionOutcome::Applied {
            applied += 1;
        }
    }

    assert_eq!(applied, 1);
    assert_eq!(count(&harness.drain(), "revenue_recorded"), 1);
}

// key: reconciliation-tests -> client activation racing the webhook
#[tokio::test]
async fn client_activation_then_webhook_records_revenue_once() {
    let mut harness = Harness::new();
    let normalizer = normalizer();
    let created = Utc::now().timestamp();
    let session = json!({
        "id": "cs_live_1",
        "mode": "subscription",
        "subscription": "sub_live_1",
        "client_reference_id": "42",
        "amount_total": 900,
        "currency": "usd",
        "metadata": { "plan_id": "monthly" }
    });

    let mut synthetic = normalizer
        .adapter(Provider::Stripe)
        .normalize_payload(&json!({
            "type": "checkout.session.completed",
            "created": created,
            "data": { "object": session.clone() }
        }))
        .unwrap();
    synthetic.synthetic = true;
    let report = harness.reconciler.process_for_user(42, &synthetic).await.unwrap();
    assert_eq!(report.outcome, TransitionOutcome::Applied);

    let webhook = json!({
        "id": "evt_live_checkout",
        "type": "checkout.session.completed",
        "created": created + 5,
        "data": { "object": session }
    });
    let delivered = normalizer
        .normalize(Provider::Stripe, webhook.to_string().as_bytes(), true)
        .unwrap();
    let report = harness.reconciler.process(&delivered).await.unwrap();
    assert_eq!(report.outcome, TransitionOutcome::Duplicate);

    let invoice = json!({
        "id": "evt_live_invoice",
        "type": "invoice.paid",
        "created": created + 5,
        "data": { "object": {
            "subscription": "sub_live_1",
            "billing_reason": "subscription_create",
            "amount_paid": 900,
            "currency": "usd",
            "lines": { "data": [ {
                "period": { "start": created, "end": created + 30 * 86_400 },
                "metadata": { "plan_id": "monthly" }
            } ] }
        } }
    });
    let delivered = normalizer
        .normalize(Provider::Stripe, invoice.to_string().as_bytes(), true)
        .unwrap();
    let report = harness.reconciler.process(&delivered).await.unwrap();
    assert_eq!(report.outcome, TransitionOutcome::Applied);

    let intents = harness.drain();
    assert_eq!(count(&intents, "revenue_recorded"), 1);
    assert_eq!(count(&intents, "role_elevated"), 1);
}

#[tokio::test]
async fn newer_payment_from_other_provider_takes_over_binding() {
    let mut harness = Harness::new();
    let start = Utc::now() - Duration::days(2);
    harness
        .reconciler
        .process(&event("evt_s1", Provider::Stripe, "sub_old", EventKind::SubscriptionActivated, start))
        .await
        .unwrap();

    let mut switched = event(
        "WH-1",
        Provider::Paypal,
        "I-NEW",
        EventKind::SubscriptionActivated,
        start + Duration::days(1),
    );
    switched.plan_hint = Some("monthly_pro".into());
    let report = harness.reconciler.process(&switched).await.unwrap();
    assert_eq!(report.outcome, TransitionOutcome::Applied);
    assert_eq!(report.entitlement.provider, Some(Provider::Paypal));
    assert_eq!(report.entitlement.plan_id, PlanId::MonthlyPro);
    assert_eq!(
        report.entitlement.superseded,
        vec![SubscriptionRef {
            provider: Provider::Stripe,
            subscription_id: "sub_old".into(),
        }]
    );

    // The old subscription still resolves to the user, and its cancel is ignored.
    let mut late_cancel = event(
        "evt_s2",
        Provider::Stripe,
        "sub_old",
        EventKind::SubscriptionCanceled,
        start + Duration::days(1) + Duration::hours(1),
    );
    late_cancel.user_ref = None;
    let report = harness.reconciler.process(&late_cancel).await.unwrap();
    assert_eq!(report.outcome, TransitionOutcome::ProviderConflict);
    assert_eq!(report.entitlement.status, EntitlementStatus::Active);
    assert_eq!(report.entitlement.plan_id, PlanId::MonthlyPro);

    assert_eq!(count(&harness.drain(), "revenue_recorded"), 2);
}

#[tokio::test]
async fn cancel_delivered_before_activation_wins() {
    let mut harness = Harness::new();
    let activated_at = Utc::now() - Duration::hours(2);
    let canceled = event(
        "evt_cancel",
        Provider::Stripe,
        "sub_ooo",
        EventKind::SubscriptionCanceled,
        activated_at + Duration::hours(1),
    );
    let activated = event(
        "evt_activate",
        Provider::Stripe,
        "sub_ooo",
        EventKind::SubscriptionActivated,
        activated_at,
    );

    harness.reconciler.process(&canceled).await.unwrap();
    let report = harness.reconciler.process(&activated).await.unwrap();
    assert_eq!(report.outcome, TransitionOutcome::Stale);
    assert_eq!(report.entitlement.status, EntitlementStatus::Canceled);
    assert!(harness.drain().is_empty());
}

#[tokio::test]
async fn unknown_plan_is_held_without_touching_entitlement() {
    let harness = Harness::new();
    let mut activated = event(
        "evt_unknown",
        Provider::Stripe,
        "sub_u",
        EventKind::SubscriptionActivated,
        Utc::now(),
    );
    activated.plan_hint = Some("enterprise".into());

    let err = harness.reconciler.process(&activated).await.unwrap_err();
    assert!(matches!(err, BillingError::UnknownPlan(_)));
    assert!(err.is_held());

    let held = harness.store.held_events();
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].event.event_id, "evt_unknown");
    assert_eq!(harness.store.load(42).await.unwrap().status, EntitlementStatus::None);
}

#[tokio::test]
async fn event_without_any_user_reference_is_left_for_redelivery() {
    let harness = Harness::new();
    let mut renewal = event(
        "evt_orphan",
        Provider::Paypal,
        "I-ORPHAN",
        EventKind::SubscriptionRenewed,
        Utc::now(),
    );
    renewal.user_ref = None;

    let err = harness.reconciler.process(&renewal).await.unwrap_err();
    assert!(matches!(err, BillingError::UnresolvedSubscriber { .. }));
    assert!(err.is_retryable());
    assert!(!err.is_held());
    assert!(harness.store.held_events().is_empty());
}

// key: reconciliation-tests -> cancel delivered before its activation
#[tokio::test]
async fn early_cancel_converges_once_redelivered() {
    let start = Utc::now();
    let activated = event("evt_act", Provider::Stripe, "sub_1", EventKind::SubscriptionActivated, start);
    let mut canceled = event(
        "evt_cancel",
        Provider::Stripe,
        "sub_1",
        EventKind::SubscriptionCanceled,
        start + Duration::hours(1),
    );
    canceled.user_ref = None;

    let in_order = Harness::new();
    in_order.reconciler.process(&activated).await.unwrap();
    in_order.reconciler.process(&canceled).await.unwrap();
    let expected = in_order.store.load(42).await.unwrap();
    assert_eq!(expected.status, EntitlementStatus::Canceled);

    let reversed = Harness::new();
    let err = reversed.reconciler.process(&canceled).await.unwrap_err();
    assert!(err.is_retryable());
    reversed.reconciler.process(&activated).await.unwrap();
    let redelivered = reversed.reconciler.process(&canceled).await.unwrap();
    assert_eq!(redelivered.outcome, TransitionOutcome::Applied);

    let converged = reversed.store.load(42).await.unwrap();
    assert_eq!(converged.status, expected.status);
    assert_eq!(converged.plan_id, expected.plan_id);
    assert_eq!(converged.current_period_end, expected.current_period_end);
    assert_eq!(converged.role_elevated, expected.role_elevated);
}

#[tokio::test]
async fn subscription_claimed_by_second_user_is_held() {
    let harness = Harness::new();
    let now = Utc::now();
    harness
        .reconciler
        .process(&event("evt_1", Provider::Stripe, "sub_shared", EventKind::SubscriptionActivated, now))
        .await
        .unwrap();

    let stolen = event(
        "evt_2",
        Provider::Stripe,
        "sub_shared",
        EventKind::SubscriptionActivated,
        now + Duration::minutes(1),
    );
    let err = harness
        .reconciler
        .process_for_user(99, &stolen)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::ProviderConflict { .. }));
    assert_eq!(harness.store.load(99).await.unwrap().status, EntitlementStatus::None);
}

// key: reconciliation-tests -> grace sweep
#[tokio::test]
async fn grace_sweep_revokes_lapsed_role_once() {
    let mut harness = Harness::new();
    let long_ago = Utc::now() - Duration::days(40);
    harness
        .reconciler
        .process(&event("evt_old", Provider::Stripe, "sub_lapsed", EventKind::SubscriptionActivated, long_ago))
        .await
        .unwrap();
    harness.drain();

    let now = Utc::now();
    assert_eq!(sweep_lapsed(&harness.reconciler, now).await.unwrap(), 1);
    assert_eq!(sweep_lapsed(&harness.reconciler, now).await.unwrap(), 0);

    let intents = harness.drain();
    assert_eq!(count(&intents, "role_revoked"), 1);
    let stored = harness.store.load(42).await.unwrap();
    assert_eq!(stored.status, EntitlementStatus::PastDue);
    assert!(!stored.role_elevated);
}

#[tokio::test]
async fn exhausted_retries_surface_conflict() {
    let store = Arc::new(ContendedStore::default());
    let (dispatcher, mut intents) = dispatch_channel(8);
    let settings = ReconcilerSettings {
        max_attempts: 3,
        ..ReconcilerSettings::default()
    };
    let reconciler = Reconciler::new(store.clone(), dispatcher, settings);
    let activated = event("evt_busy", Provider::Stripe, "sub_busy", EventKind::SubscriptionActivated, Utc::now());

    let err = reconciler.process_for_user(42, &activated).await.unwrap_err();
    assert!(matches!(
        err,
        BillingError::ReconciliationConflict {
            user_id: 42,
            attempts: 3
        }
    ));
    assert!(err.is_retryable());
    assert_eq!(store.writes.load(Ordering::SeqCst), 3);
    assert!(intents.try_recv().is_err());
}
