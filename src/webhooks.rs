use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::billing::{
    BillingError, EventKind, EventNormalizer, Provider, Reconciler, WebhookVerifier,
};

/// Signature verifiers per provider.
#[derive(Clone)]
pub struct WebhookVerifiers {
    pub stripe: Arc<dyn WebhookVerifier>,
    pub paypal: Arc<dyn WebhookVerifier>,
}

impl WebhookVerifiers {
    fn for_provider(&self, provider: Provider) -> &Arc<dyn WebhookVerifier> {
        match provider {
            Provider::Stripe => &self.stripe,
            Provider::Paypal => &self.paypal,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

type WebhookResponse = (StatusCode, Json<WebhookAck>);

fn ack(status: StatusCode, label: &'static str, event_id: Option<String>, detail: Option<String>) -> WebhookResponse {
    (
        status,
        Json(WebhookAck {
            status: label,
            event_id,
            detail,
        }),
    )
}

/// key: webhooks-stripe -> signed delivery entrypoint
pub async fn stripe_webhook(
    Extension(verifiers): Extension<WebhookVerifiers>,
    Extension(normalizer): Extension<Arc<EventNormalizer>>,
    Extension(reconciler): Extension<Reconciler>,
    headers: HeaderMap,
    body: Bytes,
) -> WebhookResponse {
    receive(Provider::Stripe, &verifiers, &normalizer, &reconciler, &headers, &body).await
}

/// key: webhooks-paypal -> signed delivery entrypoint
pub async fn paypal_webhook(
    Extension(verifiers): Extension<WebhookVerifiers>,
    Extension(normalizer): Extension<Arc<EventNormalizer>>,
    Extension(reconciler): Extension<Reconciler>,
    headers: HeaderMap,
    body: Bytes,
) -> WebhookResponse {
    receive(Provider::Paypal, &verifiers, &normalizer, &reconciler, &headers, &body).await
}

/// Status codes tell the provider whether to redeliver: 2xx stops retries,
/// 400 marks the delivery as bad, 5xx asks for another attempt.
async fn receive(
    provider: Provider,
    verifiers: &WebhookVerifiers,
    normalizer: &EventNormalizer,
    reconciler: &Reconciler,
    headers: &HeaderMap,
    body: &[u8],
) -> WebhookResponse {
    let verified = match verifiers.for_provider(provider).verify(headers, body).await {
        Ok(verified) => verified,
        Err(err) => {
            error!(?err, provider = provider.as_str(), "webhook signature verification unavailable");
            return ack(StatusCode::BAD_GATEWAY, "verification_unavailable", None, None);
        }
    };

    let event = match normalizer.normalize(provider, body, verified) {
        Ok(event) => event,
        Err(BillingError::SignatureInvalid) => {
            warn!(provider = provider.as_str(), "webhook signature rejected");
            return ack(StatusCode::BAD_REQUEST, "invalid_signature", None, None);
        }
        Err(err) => {
            warn!(?err, provider = provider.as_str(), "webhook payload rejected");
            return ack(StatusCode::BAD_REQUEST, "malformed", None, Some(err.to_string()));
        }
    };

    if event.kind == EventKind::Ignored {
        info!(
            provider = provider.as_str(),
            source_type = %event.source_type,
            "webhook event type not reconciled"
        );
        return ack(StatusCode::OK, "ignored", Some(event.event_id), None);
    }

    match reconciler.process(&event).await {
        Ok(report) => ack(
            StatusCode::OK,
            report.outcome.as_str(),
            Some(event.event_id),
            None,
        ),
        Err(err) if err.is_held() => ack(
            StatusCode::ACCEPTED,
            "held",
            Some(event.event_id),
            Some(err.to_string()),
        ),
        Err(err @ BillingError::ReconciliationConflict { .. }) => ack(
            StatusCode::SERVICE_UNAVAILABLE,
            "conflict",
            Some(event.event_id),
            Some(err.to_string()),
        ),
        Err(err @ BillingError::UnresolvedSubscriber { .. }) => ack(
            StatusCode::SERVICE_UNAVAILABLE,
            "unresolved",
            Some(event.event_id),
            Some(err.to_string()),
        ),
        Err(err) => {
            error!(?err, event_id = %event.event_id, provider = provider.as_str(), "webhook reconciliation failed");
            ack(
                StatusCode::INTERNAL_SERVER_ERROR,
                "error",
                Some(event.event_id),
                None,
            )
        }
    }
}
