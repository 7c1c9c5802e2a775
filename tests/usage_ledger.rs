use std::sync::Arc;

use chrono::{Duration, Utc};
use voxmeter::billing::{
    BillingError, Entitlement, EntitlementStatus, EntitlementStore, InMemoryEntitlementStore,
    InMemoryUsageStore, PlanId, Provider, QuotaPolicy, ReservationState, UsageCounterStore,
    UsageLedger,
};

struct Harness {
    ledger: UsageLedger,
    entitlements: Arc<InMemoryEntitlementStore>,
    counters: Arc<InMemoryUsageStore>,
}

fn harness(free_characters: i64) -> Harness {
    let entitlements = Arc::new(InMemoryEntitlementStore::new());
    let counters = Arc::new(InMemoryUsageStore::new());
    let policy = QuotaPolicy {
        free_monthly_characters: free_characters,
        monthly_plan_characters: 5_000,
        ..QuotaPolicy::default()
    };
    let ledger = UsageLedger::new(entitlements.clone(), counters.clone(), policy);
    Harness {
        ledger,
        entitlements,
        counters,
    }
}

async fn grant(
    store: &InMemoryEntitlementStore,
    user_id: i32,
    plan_id: PlanId,
    status: EntitlementStatus,
    period_end: chrono::DateTime<Utc>,
) {
    let current = store.load(user_id).await.unwrap();
    let mut next = Entitlement::new(user_id, Utc::now());
    next.plan_id = plan_id;
    next.status = status;
    next.provider = Some(Provider::Stripe);
    next.provider_subscription_id = Some(format!("sub_{user_id}"));
    next.current_period_start = Some(period_end - Duration::days(30));
    next.current_period_end = Some(period_end);
    assert!(store
        .compare_and_swap(user_id, current.version, &next)
        .await
        .unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn racing_reservations_cannot_both_fit() {
    let harness = harness(1_000);
    let first = harness.ledger.clone();
    let second = harness.ledger.clone();

    let (small, large) = tokio::join!(
        tokio::spawn(async move { first.check_and_reserve(1, 400).await }),
        tokio::spawn(async move { second.check_and_reserve(1, 700).await }),
    );
    let results = [small.unwrap(), large.unwrap()];

    let granted = results.iter().filter(|result| result.is_ok()).count();
    let refused = results
        .iter()
        .filter(|result| matches!(result, Err(BillingError::QuotaExceeded { .. })))
        .count();
    assert_eq!(granted, 1);
    assert_eq!(refused, 1);

    let outcome = harness.ledger.check(1, 0).await.unwrap();
    assert!(outcome.reserved_characters == 400 || outcome.reserved_characters == 700);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reservations_never_exceed_limit() {
    let harness = harness(1_000);
    let mut tasks = Vec::new();
    for _ in 0..50 {
        let ledger = harness.ledger.clone();
        tasks.push(tokio::spawn(async move { ledger.check_and_reserve(3, 30).await }));
    }

    let mut granted = 0;
    for task in tasks {
        if task.await.unwrap().is_ok() {
            granted += 1;
        }
    }

    assert_eq!(granted, 33);
    let outcome = harness.ledger.check(3, 0).await.unwrap();
    assert_eq!(outcome.reserved_characters, 990);
    assert_eq!(outcome.remaining_characters, Some(10));
}

#[tokio::test]
async fn commit_charges_actual_and_repeats_are_noops() {
    let harness = harness(1_000);
    let reservation = harness.ledger.check_and_reserve(5, 300).await.unwrap();
    assert_eq!(reservation.state, ReservationState::Pending);

    let committed = harness
        .ledger
        .commit(reservation.id, 250)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(committed.state, ReservationState::Committed);
    assert_eq!(committed.committed_characters, Some(250));

    assert!(harness.ledger.commit(reservation.id, 250).await.unwrap().is_none());
    assert!(harness.ledger.release(reservation.id).await.unwrap().is_none());

    let outcome = harness.ledger.check(5, 0).await.unwrap();
    assert_eq!(outcome.consumed_characters, 250);
    assert_eq!(outcome.reserved_characters, 0);
    assert_eq!(outcome.remaining_characters, Some(750));
}

#[tokio::test]
async fn released_reservation_returns_capacity() {
    let harness = harness(1_000);
    let held = harness.ledger.check_and_reserve(6, 900).await.unwrap();
    assert!(harness.ledger.check_and_reserve(6, 200).await.is_err());

    let released = harness.ledger.release(held.id).await.unwrap().unwrap();
    assert_eq!(released.state, ReservationState::Released);
    assert!(harness.ledger.check_and_reserve(6, 200).await.is_ok());
}

#[tokio::test]
async fn abandoned_reservations_are_swept_after_ttl() {
    let harness = harness(1_000);
    let abandoned = harness.ledger.check_and_reserve(8, 500).await.unwrap();

    let ttl = harness.ledger.policy().reservation_ttl;
    assert_eq!(harness.ledger.sweep_abandoned(Utc::now()).await.unwrap(), 0);
    let later = Utc::now() + ttl + Duration::seconds(1);
    assert_eq!(harness.ledger.sweep_abandoned(later).await.unwrap(), 1);
    assert_eq!(harness.ledger.sweep_abandoned(later).await.unwrap(), 0);

    assert!(harness.ledger.commit(abandoned.id, 500).await.unwrap().is_none());
    let counter = harness
        .counters
        .counter(8, &abandoned.period_key)
        .await
        .unwrap();
    assert_eq!(counter.characters_reserved, 0);
    assert_eq!(counter.characters_consumed, 0);
}

#[tokio::test]
async fn check_is_advisory() {
    let harness = harness(1_000);
    let outcome = harness.ledger.check(9, 600).await.unwrap();
    assert!(outcome.allowed);
    assert_eq!(outcome.plan_id, PlanId::Free);
    assert_eq!(outcome.limit_characters, Some(1_000));

    let outcome = harness.ledger.check(9, 600).await.unwrap();
    assert_eq!(outcome.reserved_characters, 0);
    assert!(!harness.ledger.check(9, 1_001).await.unwrap().allowed);
}

#[tokio::test]
async fn negative_requests_are_rejected() {
    let harness = harness(1_000);
    let err = harness.ledger.check_and_reserve(10, -5).await.unwrap_err();
    assert!(matches!(err, BillingError::MalformedPayload(_)));
}

#[tokio::test]
async fn paid_plan_meters_against_billing_period() {
    let harness = harness(1_000);
    let period_end = Utc::now() + Duration::days(10);
    grant(&harness.entitlements, 11, PlanId::Monthly, EntitlementStatus::Active, period_end).await;

    let reservation = harness.ledger.check_and_reserve(11, 4_000).await.unwrap();
    let expected_key = format!("period:{}", (period_end - Duration::days(30)).timestamp());
    assert_eq!(reservation.period_key, expected_key);

    let outcome = harness.ledger.check(11, 0).await.unwrap();
    assert_eq!(outcome.plan_id, PlanId::Monthly);
    assert_eq!(outcome.limit_characters, Some(5_000));
    assert_eq!(outcome.remaining_characters, Some(1_000));
}

#[tokio::test]
async fn canceled_plan_keeps_quota_until_period_end() {
    let harness = harness(1_000);
    grant(
        &harness.entitlements,
        12,
        PlanId::Monthly,
        EntitlementStatus::Canceled,
        Utc::now() + Duration::days(2),
    )
    .await;
    assert_eq!(harness.ledger.check(12, 0).await.unwrap().plan_id, PlanId::Monthly);

    grant(
        &harness.entitlements,
        13,
        PlanId::Monthly,
        EntitlementStatus::Canceled,
        Utc::now() - Duration::hours(1),
    )
    .await;
    assert_eq!(harness.ledger.check(13, 0).await.unwrap().plan_id, PlanId::Free);
}

#[tokio::test]
async fn past_due_plan_falls_back_to_free_after_grace() {
    let harness = harness(1_000);
    let grace = harness.ledger.policy().grace;
    grant(
        &harness.entitlements,
        14,
        PlanId::Monthly,
        EntitlementStatus::PastDue,
        Utc::now() - grace + Duration::hours(1),
    )
    .await;
    assert_eq!(harness.ledger.check(14, 0).await.unwrap().plan_id, PlanId::Monthly);

    grant(
        &harness.entitlements,
        15,
        PlanId::Monthly,
        EntitlementStatus::PastDue,
        Utc::now() - grace - Duration::hours(1),
    )
    .await;
    let outcome = harness.ledger.check(15, 0).await.unwrap();
    assert_eq!(outcome.plan_id, PlanId::Free);
    assert!(outcome.period_key.starts_with("month:"));
}

#[tokio::test]
async fn pro_plan_is_unlimited() {
    let harness = harness(1_000);
    grant(
        &harness.entitlements,
        16,
        PlanId::MonthlyPro,
        EntitlementStatus::Active,
        Utc::now() + Duration::days(20),
    )
    .await;

    assert!(harness.ledger.check_and_reserve(16, 2_000_000).await.is_ok());
    let outcome = harness.ledger.check(16, 1).await.unwrap();
    assert!(outcome.allowed);
    assert_eq!(outcome.remaining_characters, None);
}
