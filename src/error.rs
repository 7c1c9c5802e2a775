use axum::{http::StatusCode, response::{IntoResponse, Response}};
use thiserror::Error;

use crate::billing::BillingError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Billing(#[from] BillingError),
    #[error("not found")]
    NotFound,
    #[error("forbidden")]
    Forbidden,
    #[error("bad request: {0}")]
    BadRequest(String),
}

fn billing_status(err: &BillingError) -> StatusCode {
    match err {
        BillingError::SignatureInvalid | BillingError::MalformedPayload(_) => {
            StatusCode::BAD_REQUEST
        }
        BillingError::QuotaExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
        BillingError::ProviderConflict { .. } => StatusCode::CONFLICT,
        BillingError::UnknownPlan(_) => StatusCode::UNPROCESSABLE_ENTITY,
        BillingError::ReconciliationConflict { .. }
        | BillingError::UnresolvedSubscriber { .. }
        | BillingError::SynthesisTimeout => StatusCode::SERVICE_UNAVAILABLE,
        BillingError::SynthesisProvider(_) => StatusCode::BAD_GATEWAY,
        BillingError::Database(_) | BillingError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Billing(err) => billing_status(err),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(?self);
        } else {
            tracing::debug!(?self, %status, "request rejected");
        }
        (status, self.to_string()).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
