use std::sync::Arc;

use axum::{extract::Extension, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::text_budget;

use super::models::{Entitlement, PlanId, Provider};
use super::providers::CheckoutVerifier;
use super::reconciliation::Reconciler;
use super::usage::UsageLedger;

#[derive(Debug, Serialize)]
pub struct EntitlementEnvelope {
    pub entitlement: Entitlement,
    pub effective_plan: PlanId,
    pub quota_characters: Option<i64>,
}

impl EntitlementEnvelope {
    fn new(entitlement: Entitlement, ledger: &UsageLedger) -> Self {
        let policy = ledger.policy();
        let effective_plan = entitlement.effective_plan(Utc::now(), policy.grace);
        Self {
            entitlement,
            effective_plan,
            quota_characters: policy.limit_for(effective_plan),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ActivateRequest {
    pub provider: Provider,
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub struct ActivationResponse {
    pub outcome: &'static str,
    #[serde(flatten)]
    pub entitlement: EntitlementEnvelope,
}

/// key: billing-api-activate -> client initiated checkout confirmation
pub async fn activate(
    Extension(reconciler): Extension<Reconciler>,
    Extension(checkout): Extension<Arc<dyn CheckoutVerifier>>,
    Extension(ledger): Extension<UsageLedger>,
    AuthUser { user_id }: AuthUser,
    Json(payload): Json<ActivateRequest>,
) -> AppResult<Json<ActivationResponse>> {
    let session_id = payload.session_id.trim();
    if session_id.is_empty() {
        return Err(AppError::BadRequest("session_id is required".into()));
    }

    let event = checkout
        .fetch_activation(payload.provider, session_id)
        .await?
        .ok_or(AppError::NotFound)?;
    if event.user_ref != Some(user_id) {
        warn!(
            user_id,
            owner = ?event.user_ref,
            provider = payload.provider.as_str(),
            session_id,
            "activation attempted for a checkout owned by someone else"
        );
        return Err(AppError::Forbidden);
    }

    let report = reconciler.process_for_user(user_id, &event).await?;
    Ok(Json(ActivationResponse {
        outcome: report.outcome.as_str(),
        entitlement: EntitlementEnvelope::new(report.entitlement, &ledger),
    }))
}

/// key: billing-api-entitlement -> current plan for the caller
pub async fn get_entitlement(
    Extension(reconciler): Extension<Reconciler>,
    Extension(ledger): Extension<UsageLedger>,
    AuthUser { user_id }: AuthUser,
) -> AppResult<Json<EntitlementEnvelope>> {
    let entitlement = reconciler.store().load(user_id).await?;
    Ok(Json(EntitlementEnvelope::new(entitlement, &ledger)))
}

#[derive(Debug, Deserialize)]
pub struct UsageCheckRequest {
    #[serde(default)]
    pub requested_characters: Option<i64>,
    /// Counted with the billable-text rules when no explicit amount is given.
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UsageCheckResponse {
    pub allowed: bool,
    pub plan: PlanId,
    pub period: String,
    pub requested: i64,
    pub quota: Option<i64>,
    pub consumed: i64,
    pub reserved: i64,
    pub remaining: Option<i64>,
}

/// key: usage-api-check -> advisory quota lookup
pub async fn check_usage(
    Extension(ledger): Extension<UsageLedger>,
    AuthUser { user_id }: AuthUser,
    Json(payload): Json<UsageCheckRequest>,
) -> AppResult<Json<UsageCheckResponse>> {
    let requested = match (payload.requested_characters, payload.text.as_deref()) {
        (Some(requested), _) => requested,
        (None, Some(text)) => text_budget::count_billable(&text_budget::normalize(text)) as i64,
        (None, None) => {
            return Err(AppError::BadRequest(
                "requested_characters or text is required".into(),
            ))
        }
    };

    let outcome = ledger.check(user_id, requested).await?;
    Ok(Json(UsageCheckResponse {
        allowed: outcome.allowed,
        plan: outcome.plan_id,
        period: outcome.period_key,
        requested,
        quota: outcome.limit_characters,
        consumed: outcome.consumed_characters,
        reserved: outcome.reserved_characters,
        remaining: outcome.remaining_characters,
    }))
}
