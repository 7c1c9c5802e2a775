use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::adapters::EventNormalizer;
use super::error::{BillingError, BillingResult};
use super::models::{NormalizedProviderEvent, Provider};

/// key: stripe-client -> read-only session lookups
#[derive(Clone)]
pub struct StripeClient {
    http: reqwest::Client,
    api_base: String,
    secret_key: String,
}

impl StripeClient {
    pub fn new(http: reqwest::Client, api_base: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            secret_key: secret_key.into(),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.secret_key.is_empty()
    }

    /// Checkout session with its subscription expanded. `None` when Stripe
    /// does not know the id.
    pub async fn checkout_session(&self, session_id: &str) -> Result<Option<Value>> {
        let response = self
            .http
            .get(format!("{}/v1/checkout/sessions/{}", self.api_base, session_id))
            .bearer_auth(&self.secret_key)
            .query(&[("expand[]", "subscription")])
            .send()
            .await
            .context("stripe unreachable")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let session = response
            .error_for_status()
            .context("stripe rejected checkout session lookup")?
            .json::<Value>()
            .await
            .context("stripe returned an unreadable checkout session")?;
        Ok(Some(session))
    }
}

#[derive(Debug, Deserialize)]
struct PaypalToken {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// key: paypal-client -> oauth, lookups, webhook signature verification
pub struct PaypalClient {
    http: reqwest::Client,
    api_base: String,
    client_id: String,
    client_secret: String,
    webhook_id: String,
    token: Mutex<Option<CachedToken>>,
}

impl PaypalClient {
    pub fn new(
        http: reqwest::Client,
        api_base: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        webhook_id: impl Into<String>,
    ) -> Self {
        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            webhook_id: webhook_id.into(),
            token: Mutex::new(None),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.is_empty()
    }

    pub fn webhook_id(&self) -> &str {
        &self.webhook_id
    }

    async fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|token| token.expires_at > Instant::now()) {
            return Ok(token.value.clone());
        }

        let token = self
            .http
            .post(format!("{}/v1/oauth2/token", self.api_base))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .context("paypal unreachable")?
            .error_for_status()
            .context("paypal rejected client credentials")?
            .json::<PaypalToken>()
            .await
            .context("paypal returned an unreadable token")?;
        debug!(expires_in = token.expires_in, "paypal access token refreshed");

        // Refresh a minute early so a token never expires mid-request.
        let lifetime = Duration::from_secs(token.expires_in.saturating_sub(60));
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }

    async fn get_resource(&self, path: &str) -> Result<Option<Value>> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(format!("{}{}", self.api_base, path))
            .bearer_auth(token)
            .send()
            .await
            .context("paypal unreachable")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resource = response
            .error_for_status()
            .with_context(|| format!("paypal rejected lookup of {path}"))?
            .json::<Value>()
            .await
            .context("paypal returned an unreadable resource")?;
        Ok(Some(resource))
    }

    pub async fn subscription(&self, subscription_id: &str) -> Result<Option<Value>> {
        self.get_resource(&format!("/v1/billing/subscriptions/{subscription_id}"))
            .await
    }

    pub async fn order(&self, order_id: &str) -> Result<Option<Value>> {
        self.get_resource(&format!("/v2/checkout/orders/{order_id}"))
            .await
    }

    /// Asks PayPal whether the transmission headers sign `event`. Transport
    /// failures are errors, a negative answer is `Ok(false)`.
    pub async fn verify_webhook_signature(
        &self,
        transmission: &PaypalTransmission,
        event: &Value,
    ) -> Result<bool> {
        let token = self.access_token().await?;
        let response = self
            .http
            .post(format!(
                "{}/v1/notifications/verify-webhook-signature",
                self.api_base
            ))
            .bearer_auth(token)
            .json(&json!({
                "auth_algo": transmission.auth_algo,
                "cert_url": transmission.cert_url,
                "transmission_id": transmission.transmission_id,
                "transmission_sig": transmission.transmission_sig,
                "transmission_time": transmission.transmission_time,
                "webhook_id": self.webhook_id,
                "webhook_event": event,
            }))
            .send()
            .await
            .context("paypal unreachable")?;
        if response.status().is_client_error() {
            return Ok(false);
        }
        let verdict = response
            .error_for_status()
            .context("paypal signature verification failed")?
            .json::<Value>()
            .await
            .context("paypal returned an unreadable verification verdict")?;
        Ok(verdict.get("verification_status").and_then(Value::as_str) == Some("SUCCESS"))
    }
}

/// PayPal transmission headers, extracted by the webhook verifier.
#[derive(Debug, Clone)]
pub struct PaypalTransmission {
    pub auth_algo: String,
    pub cert_url: String,
    pub transmission_id: String,
    pub transmission_sig: String,
    pub transmission_time: String,
}

/// key: checkout-verifier -> client activation lookups
#[async_trait]
pub trait CheckoutVerifier: Send + Sync {
    /// Fetches a completed checkout from the provider and normalizes it into
    /// the event its webhook would produce. `None` when the id is unknown.
    async fn fetch_activation(
        &self,
        provider: Provider,
        session_id: &str,
    ) -> BillingResult<Option<NormalizedProviderEvent>>;
}

/// Wraps provider API objects in webhook envelopes so activation and webhook
/// paths share one adapter and one event id.
pub struct ProviderCheckoutVerifier {
    stripe: StripeClient,
    paypal: Arc<PaypalClient>,
    normalizer: Arc<EventNormalizer>,
}

impl ProviderCheckoutVerifier {
    pub fn new(stripe: StripeClient, paypal: Arc<PaypalClient>, normalizer: Arc<EventNormalizer>) -> Self {
        Self {
            stripe,
            paypal,
            normalizer,
        }
    }

    async fn stripe_activation(&self, session_id: &str) -> BillingResult<Option<Value>> {
        let Some(mut session) = self.stripe.checkout_session(session_id).await? else {
            return Ok(None);
        };
        let paid = matches!(
            session.get("payment_status").and_then(Value::as_str),
            Some("paid") | Some("no_payment_required")
        );
        if !paid {
            return Err(BillingError::MalformedPayload(format!(
                "checkout session {session_id} is not paid"
            )));
        }
        // Expanded subscriptions come back as objects; the adapter expects the id.
        if let Some(subscription) = session
            .get("subscription")
            .and_then(|subscription| subscription.get("id"))
            .cloned()
        {
            session["subscription"] = subscription;
        }
        let created = session
            .get("created")
            .and_then(Value::as_i64)
            .unwrap_or_else(|| Utc::now().timestamp());
        Ok(Some(json!({
            "type": "checkout.session.completed",
            "created": created,
            "data": { "object": session },
        })))
    }

    async fn paypal_activation(&self, session_id: &str) -> BillingResult<Option<Value>> {
        if session_id.starts_with("I-") {
            let Some(subscription) = self.paypal.subscription(session_id).await? else {
                return Ok(None);
            };
            let status = subscription.get("status").and_then(Value::as_str).unwrap_or_default();
            if status != "ACTIVE" {
                return Err(BillingError::MalformedPayload(format!(
                    "paypal subscription {session_id} is {status}, not ACTIVE"
                )));
            }
            let created = subscription
                .get("status_update_time")
                .or_else(|| subscription.get("create_time"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
            return Ok(Some(json!({
                "event_type": "BILLING.SUBSCRIPTION.ACTIVATED",
                "create_time": created,
                "resource": subscription,
            })));
        }

        let Some(order) = self.paypal.order(session_id).await? else {
            return Ok(None);
        };
        if order.get("status").and_then(Value::as_str) != Some("COMPLETED") {
            return Err(BillingError::MalformedPayload(format!(
                "paypal order {session_id} is not completed"
            )));
        }
        let unit = order
            .get("purchase_units")
            .and_then(Value::as_array)
            .and_then(|units| units.first())
            .ok_or_else(|| anyhow!("paypal order {session_id} has no purchase units"))?;
        let capture = unit
            .pointer("/payments/captures/0")
            .ok_or_else(|| anyhow!("paypal order {session_id} has no capture"))?;
        let created = capture
            .get("create_time")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
        Ok(Some(json!({
            "event_type": "PAYMENT.CAPTURE.COMPLETED",
            "create_time": created,
            "resource": {
                "id": capture.get("id").cloned().unwrap_or(Value::Null),
                "amount": capture.get("amount").cloned().unwrap_or(Value::Null),
                "custom_id": unit.get("custom_id").cloned().unwrap_or(Value::Null),
                "supplementary_data": { "related_ids": { "order_id": session_id } },
            },
        })))
    }
}

#[async_trait]
impl CheckoutVerifier for ProviderCheckoutVerifier {
    async fn fetch_activation(
        &self,
        provider: Provider,
        session_id: &str,
    ) -> BillingResult<Option<NormalizedProviderEvent>> {
        let envelope = match provider {
            Provider::Stripe => self.stripe_activation(session_id).await?,
            Provider::Paypal => self.paypal_activation(session_id).await?,
        };
        let Some(envelope) = envelope else {
            return Ok(None);
        };
        let mut event = self.normalizer.adapter(provider).normalize_payload(&envelope)?;
        event.synthetic = true;
        info!(
            provider = provider.as_str(),
            session_id,
            event_id = %event.event_id,
            "checkout fetched for client activation"
        );
        Ok(Some(event))
    }
}
