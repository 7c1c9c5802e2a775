pub mod adapters;
pub mod api;
pub mod dispatcher;
pub mod error;
pub mod models;
pub mod providers;
pub mod reconciliation;
pub mod scheduler;
pub mod store;
pub mod usage;
pub mod verification;

pub use adapters::{EventNormalizer, PaypalAdapter, ProviderEventAdapter, StripeAdapter};
pub use api::{
    activate as billing_activate, check_usage as usage_check,
    get_entitlement as billing_get_entitlement, ActivateRequest, ActivationResponse,
    EntitlementEnvelope, UsageCheckRequest, UsageCheckResponse,
};
pub use dispatcher::{
    dispatch_channel, start_dispatch_worker, DispatchHandle, HttpSink, LogSink, SideEffectSink,
};
pub use error::{BillingError, BillingResult};
pub use models::{
    Entitlement, EntitlementStatus, EventKind, NormalizedProviderEvent, PlanId, Provider,
    Reservation, ReservationState, SideEffectIntent, SubscriptionRef, UsageCounter,
    UsageQuotaOutcome,
};
pub use providers::{CheckoutVerifier, PaypalClient, ProviderCheckoutVerifier, StripeClient};
pub use reconciliation::{
    apply, lapse, ReconcileReport, Reconciler, ReconcilerSettings, Transition, TransitionOutcome,
};
pub use scheduler::{spawn as spawn_billing_sweeps, sweep_lapsed, sweep_reservations};
pub use store::{EntitlementStore, HeldEvent, InMemoryEntitlementStore, PgEntitlementStore};
pub use usage::{
    InMemoryUsageStore, PgUsageStore, QuotaPolicy, ReserveAttempt, UsageCounterStore, UsageLedger,
};
pub use verification::{
    stripe_signature_header, PaypalSignatureVerifier, StripeSignatureVerifier, WebhookVerifier,
};
