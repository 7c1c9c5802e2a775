use std::sync::Arc;

use axum::{
    extract::Extension,
    routing::{get, post},
    Router,
};

use crate::billing::{self, CheckoutVerifier, EventNormalizer, Reconciler, UsageLedger};
use crate::synthesis::{self, SynthesisService};
use crate::webhooks::{self, WebhookVerifiers};

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/webhooks/stripe", post(webhooks::stripe_webhook))
        .route("/api/webhooks/paypal", post(webhooks::paypal_webhook))
        .route("/api/billing/activate", post(billing::billing_activate))
        .route("/api/billing/entitlement", get(billing::billing_get_entitlement))
        .route("/api/usage/check", post(billing::usage_check))
        .route("/api/synthesize", post(synthesis::synthesize))
}

/// Everything the handlers pull out of request extensions.
#[derive(Clone)]
pub struct Services {
    pub reconciler: Reconciler,
    pub ledger: UsageLedger,
    pub synthesis: SynthesisService,
    pub normalizer: Arc<EventNormalizer>,
    pub verifiers: WebhookVerifiers,
    pub checkout: Arc<dyn CheckoutVerifier>,
}

/// API routes with their service layers attached.
pub fn app(services: Services) -> Router {
    api_routes()
        .layer(Extension(services.reconciler))
        .layer(Extension(services.ledger))
        .layer(Extension(services.synthesis))
        .layer(Extension(services.normalizer))
        .layer(Extension(services.verifiers))
        .layer(Extension(services.checkout))
}
