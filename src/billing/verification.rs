use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, warn};

use super::providers::{PaypalClient, PaypalTransmission};

type HmacSha256 = Hmac<Sha256>;

/// key: webhook-verifier -> provider signature check over the raw body
#[async_trait]
pub trait WebhookVerifier: Send + Sync {
    /// `Ok(false)` for a bad signature, `Err` when verification itself could
    /// not run and the provider should retry.
    async fn verify(&self, headers: &HeaderMap, body: &[u8]) -> Result<bool>;
}

/// Stripe `Stripe-Signature: t=<unix>,v1=<hex>[,v1=<hex>]` over `"{t}.{body}"`.
pub struct StripeSignatureVerifier {
    secret: Vec<u8>,
    tolerance: Duration,
}

impl StripeSignatureVerifier {
    pub fn new(secret: impl Into<Vec<u8>>, tolerance: Duration) -> Self {
        Self {
            secret: secret.into(),
            tolerance,
        }
    }

    pub fn verify_at(&self, header: &str, body: &[u8], now: DateTime<Utc>) -> bool {
        if self.secret.is_empty() {
            warn!("stripe webhook secret not configured; rejecting delivery");
            return false;
        }

        let mut timestamp = None;
        let mut candidates = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
                Some(("v1", value)) => candidates.push(value),
                _ => {}
            }
        }
        let Some(timestamp) = timestamp else {
            debug!("stripe signature header without timestamp");
            return false;
        };
        let skew = now.timestamp().checked_sub(timestamp).map(i64::unsigned_abs);
        if skew.map_or(true, |skew| skew > self.tolerance.num_seconds().unsigned_abs()) {
            debug!(timestamp, "stripe signature outside tolerance window");
            return false;
        }

        candidates.into_iter().any(|candidate| {
            let Ok(expected) = hex::decode(candidate) else {
                return false;
            };
            let Ok(mut mac) = HmacSha256::new_from_slice(&self.secret) else {
                return false;
            };
            mac.update(timestamp.to_string().as_bytes());
            mac.update(b".");
            mac.update(body);
            mac.verify_slice(&expected).is_ok()
        })
    }
}

#[async_trait]
impl WebhookVerifier for StripeSignatureVerifier {
    async fn verify(&self, headers: &HeaderMap, body: &[u8]) -> Result<bool> {
        let Some(header) = headers
            .get("stripe-signature")
            .and_then(|value| value.to_str().ok())
        else {
            return Ok(false);
        };
        Ok(self.verify_at(header, body, Utc::now()))
    }
}

/// Produces a `Stripe-Signature` header value for `body` at `timestamp`.
pub fn stripe_signature_header(secret: &[u8], body: &[u8], timestamp: i64) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret).context("invalid stripe signing secret")?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(format!(
        "t={timestamp},v1={}",
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// PayPal deliveries are checked through PayPal's verify-webhook-signature API.
pub struct PaypalSignatureVerifier {
    client: Arc<PaypalClient>,
}

impl PaypalSignatureVerifier {
    pub fn new(client: Arc<PaypalClient>) -> Self {
        Self { client }
    }
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

#[async_trait]
impl WebhookVerifier for PaypalSignatureVerifier {
    async fn verify(&self, headers: &HeaderMap, body: &[u8]) -> Result<bool> {
        if !self.client.is_configured() || self.client.webhook_id().is_empty() {
            warn!("paypal webhook verification not configured; rejecting delivery");
            return Ok(false);
        }
        let transmission = (|| {
            Some(PaypalTransmission {
                auth_algo: header(headers, "paypal-auth-algo")?,
                cert_url: header(headers, "paypal-cert-url")?,
                transmission_id: header(headers, "paypal-transmission-id")?,
                transmission_sig: header(headers, "paypal-transmission-sig")?,
                transmission_time: header(headers, "paypal-transmission-time")?,
            })
        })();
        let Some(transmission) = transmission else {
            debug!("paypal delivery missing transmission headers");
            return Ok(false);
        };
        let Ok(event) = serde_json::from_slice::<Value>(body) else {
            return Ok(false);
        };
        self.client
            .verify_webhook_signature(&transmission, &event)
            .await
    }
}
