pub mod billing;
pub mod config;
pub mod error;
pub mod extractor;
pub mod routes;
pub mod synthesis;
pub mod text_budget;
pub mod webhooks;

pub use config::BillingSettings;
pub use routes::{api_routes, app, Services};
