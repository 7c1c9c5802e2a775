use chrono::{Duration, Utc};
use sqlx::PgPool;
use voxmeter::billing::{
    BillingError, Entitlement, EntitlementStatus, EntitlementStore, EventKind,
    NormalizedProviderEvent, PgEntitlementStore, PgUsageStore, PlanId, Provider,
    ReservationState, ReserveAttempt, SubscriptionRef, UsageCounterStore,
};

fn active(user_id: i32, subscription: &str) -> Entitlement {
    let now = Utc::now();
    let mut entitlement = Entitlement::new(user_id, now);
    entitlement.plan_id = PlanId::Monthly;
    entitlement.status = EntitlementStatus::Active;
    entitlement.provider = Some(Provider::Stripe);
    entitlement.provider_subscription_id = Some(subscription.to_string());
    entitlement.current_period_start = Some(now);
    entitlement.current_period_end = Some(now + Duration::days(30));
    entitlement.last_reconciled_event_id = Some("evt_1".into());
    entitlement.recent_event_ids = vec!["evt_1".into()];
    entitlement.role_elevated = true;
    entitlement
}

// key: billing-pg-tests -> versioned entitlement writes
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn entitlement_cas_round_trips_through_postgres(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = PgEntitlementStore::new(pool.clone());

    let fresh = store.load(1).await.unwrap();
    assert_eq!(fresh.version, 0);
    assert_eq!(fresh.status, EntitlementStatus::None);

    assert!(store.compare_and_swap(1, 0, &active(1, "sub_pg")).await.unwrap());
    assert!(!store.compare_and_swap(1, 0, &active(1, "sub_pg")).await.unwrap());

    let stored = store.load(1).await.unwrap();
    assert_eq!(stored.version, 1);
    assert_eq!(stored.plan_id, PlanId::Monthly);
    assert_eq!(stored.recent_event_ids, vec!["evt_1".to_string()]);
    assert!(stored.role_elevated);

    let owner = store
        .find_user_by_subscription(&SubscriptionRef {
            provider: Provider::Stripe,
            subscription_id: "sub_pg".into(),
        })
        .await
        .unwrap();
    assert_eq!(owner, Some(1));
    assert_eq!(store.list_elevated().await.unwrap(), vec![1]);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn subscription_cannot_bind_to_two_users(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = PgEntitlementStore::new(pool.clone());

    assert!(store.compare_and_swap(1, 0, &active(1, "sub_dup")).await.unwrap());
    let err = store
        .compare_and_swap(2, 0, &active(2, "sub_dup"))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::ProviderConflict { .. }));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn held_events_are_recorded_once(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = PgEntitlementStore::new(pool.clone());
    let event = NormalizedProviderEvent {
        event_id: "evt_held".into(),
        provider: Provider::Paypal,
        provider_subscription_id: "I-HELD".into(),
        kind: EventKind::SubscriptionRenewed,
        occurred_at: Utc::now(),
        amount_minor: 900,
        currency: "usd".into(),
        period_start: None,
        period_end: None,
        plan_hint: None,
        user_ref: None,
        source_type: "PAYMENT.SALE.COMPLETED".into(),
        synthetic: false,
    };

    store.hold_event(&event, "no subscriber").await.unwrap();
    store.hold_event(&event, "no subscriber").await.unwrap();

    let held: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM held_provider_events")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(held, 1);
}

// key: billing-pg-tests -> conditional usage reservations
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn usage_reservations_respect_limit(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = PgUsageStore::new(pool.clone());
    let now = Utc::now();

    let ReserveAttempt::Reserved(first) = store
        .try_reserve(3, "month:2026-03", 400, Some(1_000), now)
        .await
        .unwrap()
    else {
        panic!("first reservation should fit");
    };
    let second = store
        .try_reserve(3, "month:2026-03", 700, Some(1_000), now)
        .await
        .unwrap();
    assert!(matches!(second, ReserveAttempt::Exceeded(_)));

    let committed = store.commit(first.id, 350, now).await.unwrap().unwrap();
    assert_eq!(committed.state, ReservationState::Committed);
    assert_eq!(committed.committed_characters, Some(350));
    assert!(store.commit(first.id, 350, now).await.unwrap().is_none());

    let counter = store.counter(3, "month:2026-03").await.unwrap();
    assert_eq!(counter.characters_consumed, 350);
    assert_eq!(counter.characters_reserved, 0);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn stale_pending_reservations_are_listed(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = PgUsageStore::new(pool.clone());
    let long_ago = Utc::now() - Duration::minutes(10);

    let ReserveAttempt::Reserved(stale) = store
        .try_reserve(4, "month:2026-03", 100, None, long_ago)
        .await
        .unwrap()
    else {
        panic!("unlimited reservation should fit");
    };

    let pending = store
        .pending_created_before(Utc::now() - Duration::minutes(2))
        .await
        .unwrap();
    assert_eq!(pending, vec![stale.id]);

    let released = store.release(stale.id, Utc::now()).await.unwrap().unwrap();
    assert_eq!(released.state, ReservationState::Released);
    assert!(store
        .pending_created_before(Utc::now())
        .await
        .unwrap()
        .is_empty());
}
