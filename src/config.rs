use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::Duration;

use crate::billing::{QuotaPolicy, ReconcilerSettings};

/// Secret used for JWT verification. Must be set via the `JWT_SECRET` env variable.
pub static JWT_SECRET: Lazy<String> =
    Lazy::new(|| std::env::var("JWT_SECRET").expect("JWT_SECRET must be set"));

/// Address the HTTP server should bind to. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Port the HTTP server should listen on. Defaults to `3000`.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| parse_env("BIND_PORT").unwrap_or(3000));

/// When set to a truthy value, allows the application to continue running even if database
/// migrations fail. Defaults to `false`.
pub static ALLOW_MIGRATION_FAILURE: Lazy<bool> = Lazy::new(|| {
    std::env::var("ALLOW_MIGRATION_FAILURE")
        .ok()
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes")
        })
        .unwrap_or(false)
});

/// key: stripe-config -> api base for session lookups
pub static STRIPE_API_BASE: Lazy<String> = Lazy::new(|| {
    read_optional_env("STRIPE_API_BASE").unwrap_or_else(|| "https://api.stripe.com".to_string())
});

/// Secret API key used for checkout session lookups. Empty disables client activation.
pub static STRIPE_API_KEY: Lazy<String> =
    Lazy::new(|| read_optional_env("STRIPE_API_KEY").unwrap_or_default());

/// Endpoint signing secret (`whsec_…`). Empty rejects every Stripe delivery.
pub static STRIPE_WEBHOOK_SECRET: Lazy<String> =
    Lazy::new(|| read_optional_env("STRIPE_WEBHOOK_SECRET").unwrap_or_default());

/// Allowed clock skew between the signature timestamp and now.
pub static STRIPE_SIGNATURE_TOLERANCE_SECS: Lazy<i64> = Lazy::new(|| {
    parse_env("STRIPE_SIGNATURE_TOLERANCE_SECS")
        .filter(|value: &i64| *value > 0)
        .unwrap_or(300)
});

/// key: paypal-config -> rest api base
pub static PAYPAL_API_BASE: Lazy<String> = Lazy::new(|| {
    read_optional_env("PAYPAL_API_BASE").unwrap_or_else(|| "https://api-m.paypal.com".to_string())
});

pub static PAYPAL_CLIENT_ID: Lazy<String> =
    Lazy::new(|| read_optional_env("PAYPAL_CLIENT_ID").unwrap_or_default());

pub static PAYPAL_CLIENT_SECRET: Lazy<String> =
    Lazy::new(|| read_optional_env("PAYPAL_CLIENT_SECRET").unwrap_or_default());

/// Webhook id registered with PayPal, required for signature verification.
pub static PAYPAL_WEBHOOK_ID: Lazy<String> =
    Lazy::new(|| read_optional_env("PAYPAL_WEBHOOK_ID").unwrap_or_default());

/// PayPal billing plan ids mapped to internal plans, e.g. `P-1AB=monthly,P-2CD=monthly_pro`.
pub static PAYPAL_PLAN_MAP: Lazy<HashMap<String, String>> = Lazy::new(|| {
    read_optional_env("PAYPAL_PLAN_MAP")
        .map(|raw| parse_plan_map(&raw))
        .unwrap_or_default()
});

/// key: quota-config -> monthly allowance for free accounts
pub static FREE_MONTHLY_CHARACTERS: Lazy<i64> = Lazy::new(|| {
    parse_env("FREE_MONTHLY_CHARACTERS")
        .filter(|value: &i64| *value >= 0)
        .unwrap_or(10_000)
});

/// key: quota-config -> allowance for the `monthly` plan
pub static MONTHLY_PLAN_CHARACTERS: Lazy<i64> = Lazy::new(|| {
    parse_env("MONTHLY_PLAN_CHARACTERS")
        .filter(|value: &i64| *value >= 0)
        .unwrap_or(1_000_000)
});

/// Hours a late renewal keeps its paid plan past the period end.
pub static ENTITLEMENT_GRACE_HOURS: Lazy<i64> = Lazy::new(|| {
    parse_env("ENTITLEMENT_GRACE_HOURS")
        .filter(|value: &i64| *value >= 0)
        .unwrap_or(72)
});

/// Pending reservations older than this are released by the sweep.
pub static RESERVATION_TTL_SECS: Lazy<i64> = Lazy::new(|| {
    parse_env("RESERVATION_TTL_SECS")
        .filter(|value: &i64| *value > 0)
        .unwrap_or(120)
});

pub static RESERVATION_SWEEP_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| {
    parse_env("RESERVATION_SWEEP_INTERVAL_SECS")
        .filter(|value: &u64| *value > 0)
        .unwrap_or(30)
});

pub static ENTITLEMENT_GRACE_SWEEP_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| {
    parse_env("ENTITLEMENT_GRACE_SWEEP_INTERVAL_SECS")
        .filter(|value: &u64| *value > 0)
        .unwrap_or(300)
});

/// Compare-and-swap attempts before a webhook gets a retryable conflict.
pub static ENTITLEMENT_CAS_MAX_ATTEMPTS: Lazy<u32> = Lazy::new(|| {
    parse_env("ENTITLEMENT_CAS_MAX_ATTEMPTS")
        .filter(|value: &u32| *value > 0)
        .unwrap_or(5)
});

/// Applied event ids remembered per entitlement for redelivery detection.
pub static RECENT_EVENT_WINDOW: Lazy<usize> = Lazy::new(|| {
    parse_env("RECENT_EVENT_WINDOW")
        .filter(|value: &usize| *value > 0)
        .unwrap_or(32)
});

/// key: side-effect-config -> dispatcher queue and sink
pub static SIDE_EFFECT_QUEUE_CAPACITY: Lazy<usize> = Lazy::new(|| {
    parse_env("SIDE_EFFECT_QUEUE_CAPACITY")
        .filter(|value: &usize| *value > 0)
        .unwrap_or(256)
});

/// Collaborator endpoint receiving side-effect intents. Unset logs them only.
pub static SIDE_EFFECT_WEBHOOK_URL: Lazy<Option<String>> =
    Lazy::new(|| read_optional_env("SIDE_EFFECT_WEBHOOK_URL"));

/// key: synthesis-config -> speech provider endpoint
pub static SYNTHESIS_PROVIDER_URL: Lazy<String> = Lazy::new(|| {
    read_optional_env("SYNTHESIS_PROVIDER_URL")
        .unwrap_or_else(|| "http://127.0.0.1:8700/synthesize".to_string())
});

pub static SYNTHESIS_API_KEY: Lazy<Option<String>> =
    Lazy::new(|| read_optional_env("SYNTHESIS_API_KEY"));

pub static SYNTHESIS_TIMEOUT_SECS: Lazy<u64> = Lazy::new(|| {
    parse_env("SYNTHESIS_TIMEOUT_SECS")
        .filter(|value: &u64| *value > 0)
        .unwrap_or(30)
});

/// Billable characters accepted per synthesis request; longer text is truncated.
pub static MAX_REQUEST_CHARACTERS: Lazy<usize> = Lazy::new(|| {
    parse_env("MAX_REQUEST_CHARACTERS")
        .filter(|value: &usize| *value > 0)
        .unwrap_or(5_000)
});

/// Typed view over the env statics, so services and tests can be built with
/// explicit values.
#[derive(Debug, Clone, Copy)]
pub struct BillingSettings {
    pub quota: QuotaPolicy,
    pub reconciler: ReconcilerSettings,
    pub stripe_signature_tolerance: Duration,
    pub reservation_sweep_interval: StdDuration,
    pub grace_sweep_interval: StdDuration,
    pub side_effect_queue_capacity: usize,
    pub max_request_characters: usize,
    pub synthesis_timeout: StdDuration,
}

impl BillingSettings {
    pub fn from_env() -> Self {
        let grace = Duration::hours(*ENTITLEMENT_GRACE_HOURS);
        Self {
            quota: QuotaPolicy {
                free_monthly_characters: *FREE_MONTHLY_CHARACTERS,
                monthly_plan_characters: *MONTHLY_PLAN_CHARACTERS,
                grace,
                reservation_ttl: Duration::seconds(*RESERVATION_TTL_SECS),
            },
            reconciler: ReconcilerSettings {
                max_attempts: *ENTITLEMENT_CAS_MAX_ATTEMPTS,
                recent_event_window: *RECENT_EVENT_WINDOW,
                grace,
            },
            stripe_signature_tolerance: Duration::seconds(*STRIPE_SIGNATURE_TOLERANCE_SECS),
            reservation_sweep_interval: StdDuration::from_secs(*RESERVATION_SWEEP_INTERVAL_SECS),
            grace_sweep_interval: StdDuration::from_secs(*ENTITLEMENT_GRACE_SWEEP_INTERVAL_SECS),
            side_effect_queue_capacity: *SIDE_EFFECT_QUEUE_CAPACITY,
            max_request_characters: *MAX_REQUEST_CHARACTERS,
            synthesis_timeout: StdDuration::from_secs(*SYNTHESIS_TIMEOUT_SECS),
        }
    }
}

impl Default for BillingSettings {
    fn default() -> Self {
        Self {
            quota: QuotaPolicy::default(),
            reconciler: ReconcilerSettings::default(),
            stripe_signature_tolerance: Duration::seconds(300),
            reservation_sweep_interval: StdDuration::from_secs(30),
            grace_sweep_interval: StdDuration::from_secs(300),
            side_effect_queue_capacity: 256,
            max_request_characters: 5_000,
            synthesis_timeout: StdDuration::from_secs(30),
        }
    }
}

/// `P-1AB=monthly, P-2CD=lifetime` into a lookup table. Malformed pairs are skipped.
pub fn parse_plan_map(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (provider_plan, plan) = pair.split_once('=')?;
            let (provider_plan, plan) = (provider_plan.trim(), plan.trim());
            if provider_plan.is_empty() || plan.is_empty() {
                None
            } else {
                Some((provider_plan.to_string(), plan.to_string()))
            }
        })
        .collect()
}

fn parse_env<T: FromStr>(key: &str) -> Option<T> {
    read_optional_env(key).and_then(|value| value.parse::<T>().ok())
}

fn read_optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
