use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tracing::debug;

use super::error::{BillingError, BillingResult};
use super::models::{EventKind, NormalizedProviderEvent, Provider};

/// key: billing-adapter -> provider payload normalization
pub trait ProviderEventAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    /// Maps an already-verified provider payload onto the internal event shape.
    fn normalize_payload(&self, payload: &Value) -> BillingResult<NormalizedProviderEvent>;
}

/// key: billing-normalizer -> signature gate + adapter dispatch
pub struct EventNormalizer {
    stripe: StripeAdapter,
    paypal: PaypalAdapter,
}

impl EventNormalizer {
    pub fn new(stripe: StripeAdapter, paypal: PaypalAdapter) -> Self {
        Self { stripe, paypal }
    }

    pub fn adapter(&self, provider: Provider) -> &dyn ProviderEventAdapter {
        match provider {
            Provider::Stripe => &self.stripe,
            Provider::Paypal => &self.paypal,
        }
    }

    pub fn normalize(
        &self,
        provider: Provider,
        raw_payload: &[u8],
        verified_signature: bool,
    ) -> BillingResult<NormalizedProviderEvent> {
        if !verified_signature {
            return Err(BillingError::SignatureInvalid);
        }
        let payload: Value = serde_json::from_slice(raw_payload)
            .map_err(|err| BillingError::MalformedPayload(err.to_string()))?;
        let event = self.adapter(provider).normalize_payload(&payload)?;
        debug!(
            provider = provider.as_str(),
            event_id = %event.event_id,
            source_type = %event.source_type,
            kind = event.kind.as_str(),
            "normalized provider event"
        );
        Ok(event)
    }
}

/// key: billing-adapter-stripe -> card processor vocabulary
#[derive(Debug, Clone, Default)]
pub struct StripeAdapter;

impl ProviderEventAdapter for StripeAdapter {
    fn provider(&self) -> Provider {
        Provider::Stripe
    }

    fn normalize_payload(&self, payload: &Value) -> BillingResult<NormalizedProviderEvent> {
        let event_type = required_str(payload, &["type"])?;
        let created = jget(payload, &["created"])
            .and_then(Value::as_i64)
            .ok_or_else(|| malformed("stripe event missing `created`"))?;
        let occurred_at = from_unix(created)?;
        let object = jget(payload, &["data", "object"])
            .ok_or_else(|| malformed("stripe event missing `data.object`"))?;
        let native_id = extract_str(payload, &["id"]).map(str::to_string);

        let mut event = NormalizedProviderEvent {
            event_id: String::new(),
            provider: Provider::Stripe,
            provider_subscription_id: String::new(),
            kind: EventKind::Ignored,
            occurred_at,
            amount_minor: 0,
            currency: String::new(),
            period_start: None,
            period_end: None,
            plan_hint: None,
            user_ref: None,
            source_type: event_type.to_string(),
            synthetic: false,
        };

        match event_type {
            "checkout.session.completed" => {
                let session_id = required_str(object, &["id"])?;
                let mode = extract_str(object, &["mode"]).unwrap_or("subscription");
                if mode == "payment" {
                    event.kind = EventKind::OneTimePaid;
                    event.provider_subscription_id = session_id.to_string();
                } else {
                    event.kind = EventKind::SubscriptionActivated;
                    event.provider_subscription_id = required_str(object, &["subscription"])?.to_string();
                }
                event.event_id = stripe_checkout_event_id(session_id);
                event.amount_minor = extract_i64(object, &["amount_total"]).unwrap_or(0);
                event.currency = extract_str(object, &["currency"]).unwrap_or_default().to_string();
                event.plan_hint = extract_str(object, &["metadata", "plan_id"]).map(str::to_string);
                event.user_ref = extract_str(object, &["client_reference_id"])
                    .or_else(|| extract_str(object, &["metadata", "user_id"]))
                    .and_then(parse_user_ref);
                return Ok(event);
            }
            "invoice.paid" | "invoice.payment_succeeded" => {
                let Some(subscription) = extract_str(object, &["subscription"]) else {
                    return Ok(ignored(event, native_id));
                };
                event.provider_subscription_id = subscription.to_string();
                event.kind = if extract_str(object, &["billing_reason"]) == Some("subscription_create") {
                    EventKind::SubscriptionActivated
                } else {
                    EventKind::SubscriptionRenewed
                };
                event.amount_minor = extract_i64(object, &["amount_paid"]).unwrap_or(0);
                event.currency = extract_str(object, &["currency"]).unwrap_or_default().to_string();
                let line = jget(object, &["lines", "data"])
                    .and_then(Value::as_array)
                    .and_then(|lines| lines.first());
                if let Some(line) = line {
                    event.period_start = optional_unix(line, &["period", "start"])?;
                    event.period_end = optional_unix(line, &["period", "end"])?;
                    event.plan_hint = extract_str(line, &["price", "lookup_key"])
                        .or_else(|| extract_str(line, &["metadata", "plan_id"]))
                        .map(str::to_string);
                }
                if let Some(plan) = extract_str(object, &["subscription_details", "metadata", "plan_id"]) {
                    event.plan_hint = Some(plan.to_string());
                }
                event.user_ref = extract_str(object, &["subscription_details", "metadata", "user_id"])
                    .and_then(parse_user_ref);
            }
            "invoice.payment_failed" => {
                let Some(subscription) = extract_str(object, &["subscription"]) else {
                    return Ok(ignored(event, native_id));
                };
                event.provider_subscription_id = subscription.to_string();
                event.kind = EventKind::SubscriptionSuspended;
            }
            "customer.subscription.updated" | "customer.subscription.deleted" => {
                event.provider_subscription_id = required_str(object, &["id"])?.to_string();
                let status = extract_str(object, &["status"]).unwrap_or_default();
                let kind = match (event_type, status) {
                    ("customer.subscription.deleted", _) => Some(EventKind::SubscriptionCanceled),
                    (_, "canceled") => Some(EventKind::SubscriptionCanceled),
                    (_, "past_due") | (_, "unpaid") => Some(EventKind::SubscriptionSuspended),
                    _ => None,
                };
                let Some(kind) = kind else {
                    return Ok(ignored(event, native_id));
                };
                event.kind = kind;
                event.period_start = optional_unix(object, &["current_period_start"])?;
                event.period_end = optional_unix(object, &["current_period_end"])?;
                event.plan_hint = extract_str(object, &["metadata", "plan_id"]).map(str::to_string);
                event.user_ref = extract_str(object, &["metadata", "user_id"]).and_then(parse_user_ref);
            }
            _ => return Ok(ignored(event, native_id)),
        }

        event.event_id = native_id.unwrap_or_else(|| {
            synthesize_event_id(
                Provider::Stripe,
                &event.provider_subscription_id,
                event.kind,
                event.occurred_at,
            )
        });
        Ok(event)
    }
}

/// key: billing-adapter-paypal -> wallet processor vocabulary
#[derive(Debug, Clone, Default)]
pub struct PaypalAdapter {
    plan_map: HashMap<String, String>,
}

impl PaypalAdapter {
    /// `plan_map` translates PayPal billing plan ids (`P-…`) into internal plan ids.
    pub fn new(plan_map: HashMap<String, String>) -> Self {
        Self { plan_map }
    }

    fn translate_plan(&self, provider_plan: &str) -> String {
        self.plan_map
            .get(provider_plan)
            .cloned()
            .unwrap_or_else(|| provider_plan.to_string())
    }
}

impl ProviderEventAdapter for PaypalAdapter {
    fn provider(&self) -> Provider {
        Provider::Paypal
    }

    fn normalize_payload(&self, payload: &Value) -> BillingResult<NormalizedProviderEvent> {
        let event_type = required_str(payload, &["event_type"])?;
        let occurred_at = parse_rfc3339(required_str(payload, &["create_time"])?)?;
        let resource = jget(payload, &["resource"])
            .ok_or_else(|| malformed("paypal event missing `resource`"))?;
        let native_id = extract_str(payload, &["id"]).map(str::to_string);

        let mut event = NormalizedProviderEvent {
            event_id: String::new(),
            provider: Provider::Paypal,
            provider_subscription_id: String::new(),
            kind: EventKind::Ignored,
            occurred_at,
            amount_minor: 0,
            currency: String::new(),
            period_start: None,
            period_end: None,
            plan_hint: None,
            user_ref: None,
            source_type: event_type.to_string(),
            synthetic: false,
        };

        let custom = extract_str(resource, &["custom_id"])
            .or_else(|| extract_str(resource, &["custom"]))
            .map(parse_custom_id);
        if let Some((user_ref, plan)) = custom {
            event.user_ref = user_ref;
            event.plan_hint = plan;
        }

        match event_type {
            "BILLING.SUBSCRIPTION.ACTIVATED" => {
                let subscription = required_str(resource, &["id"])?;
                event.kind = EventKind::SubscriptionActivated;
                event.provider_subscription_id = subscription.to_string();
                event.event_id = paypal_activation_event_id(subscription);
                if event.plan_hint.is_none() {
                    event.plan_hint = extract_str(resource, &["plan_id"]).map(|plan| self.translate_plan(plan));
                }
                if let Some(payment) = jget(resource, &["billing_info", "last_payment"]) {
                    let (amount, currency) = paypal_amount(payment, "value", "currency_code");
                    event.amount_minor = amount;
                    event.currency = currency;
                    event.period_start = optional_rfc3339(payment, &["time"])?;
                }
                if event.period_start.is_none() {
                    event.period_start = optional_rfc3339(resource, &["start_time"])?;
                }
                event.period_end = optional_rfc3339(resource, &["billing_info", "next_billing_time"])?;
                return Ok(event);
            }
            "PAYMENT.SALE.COMPLETED" => {
                let Some(agreement) = extract_str(resource, &["billing_agreement_id"]) else {
                    return Ok(ignored(event, native_id));
                };
                event.kind = EventKind::SubscriptionRenewed;
                event.provider_subscription_id = agreement.to_string();
                if let Some(amount) = jget(resource, &["amount"]) {
                    let (minor, currency) = paypal_amount(amount, "total", "currency");
                    event.amount_minor = minor;
                    event.currency = currency;
                }
            }
            "PAYMENT.CAPTURE.COMPLETED" => {
                let capture = required_str(resource, &["id"])?;
                let order = extract_str(resource, &["supplementary_data", "related_ids", "order_id"]);
                event.kind = EventKind::OneTimePaid;
                event.provider_subscription_id = order.unwrap_or(capture).to_string();
                if let Some(amount) = jget(resource, &["amount"]) {
                    let (minor, currency) = paypal_amount(amount, "value", "currency_code");
                    event.amount_minor = minor;
                    event.currency = currency;
                }
                if let Some(order) = order {
                    event.event_id = paypal_order_event_id(order);
                    return Ok(event);
                }
            }
            "BILLING.SUBSCRIPTION.CANCELLED" | "BILLING.SUBSCRIPTION.EXPIRED" => {
                event.kind = EventKind::SubscriptionCanceled;
                event.provider_subscription_id = required_str(resource, &["id"])?.to_string();
            }
            "BILLING.SUBSCRIPTION.SUSPENDED" | "BILLING.SUBSCRIPTION.PAYMENT.FAILED" => {
                event.kind = EventKind::SubscriptionSuspended;
                event.provider_subscription_id = required_str(resource, &["id"])?.to_string();
            }
            _ => return Ok(ignored(event, native_id)),
        }

        event.event_id = native_id.unwrap_or_else(|| {
            synthesize_event_id(
                Provider::Paypal,
                &event.provider_subscription_id,
                event.kind,
                event.occurred_at,
            )
        });
        Ok(event)
    }
}

/// Shared by the webhook and the client activation path so both produce the
/// same idempotency token for one checkout.
pub fn stripe_checkout_event_id(session_id: &str) -> String {
    format!("checkout:{session_id}")
}

pub fn paypal_activation_event_id(subscription_id: &str) -> String {
    format!("activation:{subscription_id}")
}

pub fn paypal_order_event_id(order_id: &str) -> String {
    format!("order:{order_id}")
}

/// Deterministic id for events without a native one. Second resolution, so
/// two same-kind events inside one second collapse into one.
pub fn synthesize_event_id(
    provider: Provider,
    subscription_id: &str,
    kind: EventKind,
    occurred_at: DateTime<Utc>,
) -> String {
    format!(
        "{}:{}:{}:{}",
        provider.as_str(),
        subscription_id,
        kind.as_str(),
        occurred_at.timestamp()
    )
}

/// Converts a decimal amount such as `"9.99"` into minor units.
pub fn parse_minor_units(value: &str) -> Option<i64> {
    let value = value.trim();
    let (negative, value) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value),
    };
    let (whole, fraction) = value.split_once('.').unwrap_or((value, ""));
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    let whole: i64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut cents = fraction.chars().take(2).collect::<String>();
    while cents.len() < 2 {
        cents.push('0');
    }
    let cents: i64 = cents.parse().ok()?;
    let minor = whole.checked_mul(100)?.checked_add(cents)?;
    Some(if negative { -minor } else { minor })
}

fn ignored(mut event: NormalizedProviderEvent, native_id: Option<String>) -> NormalizedProviderEvent {
    event.kind = EventKind::Ignored;
    event.event_id = native_id.unwrap_or_else(|| format!("ignored:{}", event.source_type));
    event
}

fn paypal_amount(amount: &Value, value_key: &str, currency_key: &str) -> (i64, String) {
    let minor = extract_str(amount, &[value_key])
        .and_then(parse_minor_units)
        .unwrap_or(0);
    let currency = extract_str(amount, &[currency_key])
        .unwrap_or_default()
        .to_ascii_lowercase();
    (minor, currency)
}

/// `custom_id` carries `<user_id>` or `<user_id>:<plan>`.
fn parse_custom_id(value: &str) -> (Option<i32>, Option<String>) {
    match value.split_once(':') {
        Some((user, plan)) => (parse_user_ref(user), Some(plan.trim().to_string())),
        None => (parse_user_ref(value), None),
    }
}

fn parse_user_ref(value: &str) -> Option<i32> {
    value.trim().parse().ok()
}

fn jget<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = value;
    for key in path {
        current = current.get(*key)?;
    }
    Some(current)
}

fn extract_str<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    jget(value, path)?.as_str().filter(|value| !value.is_empty())
}

fn extract_i64(value: &Value, path: &[&str]) -> Option<i64> {
    jget(value, path)?.as_i64()
}

fn required_str<'a>(value: &'a Value, path: &[&str]) -> BillingResult<&'a str> {
    extract_str(value, path).ok_or_else(|| malformed(&format!("missing `{}`", path.join("."))))
}

fn optional_unix(value: &Value, path: &[&str]) -> BillingResult<Option<DateTime<Utc>>> {
    extract_i64(value, path).map(from_unix).transpose()
}

fn optional_rfc3339(value: &Value, path: &[&str]) -> BillingResult<Option<DateTime<Utc>>> {
    extract_str(value, path).map(parse_rfc3339).transpose()
}

fn from_unix(seconds: i64) -> BillingResult<DateTime<Utc>> {
    Utc.timestamp_opt(seconds, 0)
        .single()
        .ok_or_else(|| malformed(&format!("invalid timestamp {seconds}")))
}

fn parse_rfc3339(value: &str) -> BillingResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|err| malformed(&format!("invalid timestamp `{value}`: {err}")))
}

fn malformed(message: &str) -> BillingError {
    BillingError::MalformedPayload(message.to_string())
}
