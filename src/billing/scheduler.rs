use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time;
use tracing::{debug, info, warn};

use super::error::BillingResult;
use super::reconciliation::Reconciler;
use super::usage::UsageLedger;

/// key: billing-sweeps -> abandoned reservations and lapsed entitlements
pub fn spawn(
    ledger: UsageLedger,
    reconciler: Reconciler,
    reservation_interval: Duration,
    grace_interval: Duration,
) {
    tokio::spawn(async move {
        let mut ticker = time::interval(reservation_interval);
        loop {
            ticker.tick().await;
            if let Err(err) = sweep_reservations(&ledger, Utc::now()).await {
                warn!(?err, "reservation sweep tick failed");
            }
        }
    });

    tokio::spawn(async move {
        let mut ticker = time::interval(grace_interval);
        loop {
            ticker.tick().await;
            if let Err(err) = sweep_lapsed(&reconciler, Utc::now()).await {
                warn!(?err, "grace sweep tick failed");
            }
        }
    });
}

/// key: billing-sweeps -> reservation tick
pub async fn sweep_reservations(ledger: &UsageLedger, now: DateTime<Utc>) -> BillingResult<usize> {
    let released = ledger.sweep_abandoned(now).await?;
    if released > 0 {
        info!(released, "released abandoned usage reservations");
    }
    Ok(released)
}

/// key: billing-sweeps -> grace tick. Returns how many roles were revoked.
pub async fn sweep_lapsed(reconciler: &Reconciler, now: DateTime<Utc>) -> BillingResult<usize> {
    let mut revoked = 0;
    for user_id in reconciler.store().list_elevated().await? {
        match reconciler.expire_lapsed(user_id, now).await {
            Ok(Some(_)) => revoked += 1,
            Ok(None) => debug!(user_id, "entitlement within paid period or grace"),
            Err(err) => warn!(?err, user_id, "failed to expire lapsed entitlement"),
        }
    }
    Ok(revoked)
}
