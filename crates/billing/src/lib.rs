//! Lagen billing library
//!
//! Subscription synchronization and usage enforcement: the Stripe webhook
//! reconciler, the local subscription store, the per-user message ledger,
//! and the quota gate that sits in front of the chat pipeline.

pub mod client;
pub mod error;
pub mod quota;
pub mod subscriptions;
pub mod usage;
pub mod webhooks;

pub use client::StripeConfig;
pub use error::{BillingError, BillingResult};
pub use quota::{AdmissionDecision, AdmissionReason, QuotaConfig, QuotaGate};
pub use subscriptions::{SubscriptionStore, SubscriptionUpsert};
pub use usage::UsageLedger;
pub use webhooks::WebhookHandler;
