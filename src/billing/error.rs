use thiserror::Error;

use super::models::Provider;

/// key: billing-errors -> reconciliation and metering taxonomy
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("webhook signature could not be verified")]
    SignatureInvalid,
    #[error("malformed provider payload: {0}")]
    MalformedPayload(String),
    #[error("unknown plan `{0}`")]
    UnknownPlan(String),
    #[error("no user bound to {provider:?} subscription `{subscription_id}`")]
    UnresolvedSubscriber {
        provider: Provider,
        subscription_id: String,
    },
    #[error("subscription `{subscription_id}` is already bound to another user")]
    ProviderConflict { subscription_id: String },
    #[error("entitlement for user {user_id} kept changing after {attempts} attempts")]
    ReconciliationConflict { user_id: i32, attempts: u32 },
    #[error("quota exceeded: requested {requested}, remaining {remaining}")]
    QuotaExceeded { requested: i64, remaining: i64 },
    #[error("synthesis timed out")]
    SynthesisTimeout,
    #[error("synthesis provider error: {0}")]
    SynthesisProvider(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BillingError {
    /// Errors the delivery mechanism can heal by retrying the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::ReconciliationConflict { .. }
                | BillingError::UnresolvedSubscriber { .. }
                | BillingError::SynthesisTimeout
                | BillingError::SynthesisProvider(_)
                | BillingError::Database(_)
                | BillingError::Internal(_)
        )
    }

    /// Errors whose event is parked for manual review rather than retried.
    pub fn is_held(&self) -> bool {
        matches!(
            self,
            BillingError::UnknownPlan(_) | BillingError::ProviderConflict { .. }
        )
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
