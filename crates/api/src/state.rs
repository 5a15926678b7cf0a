//! Shared application state

use std::sync::Arc;

use sqlx::PgPool;

use lagen_billing::{
    QuotaConfig, QuotaGate, StripeConfig, SubscriptionStore, UsageLedger, WebhookHandler,
};

use crate::config::Config;

/// Stripe-backed services, present only when the webhook secret is configured
pub struct BillingState {
    pub webhooks: WebhookHandler,
}

/// Shared application state passed to all handlers
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub stripe: StripeConfig,
    pub gate: QuotaGate,
    pub subscriptions: SubscriptionStore,
    pub ledger: UsageLedger,
    pub billing: Option<Arc<BillingState>>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let quota_config = QuotaConfig {
            free_message_limit: config.free_message_limit,
        };

        // Price-id mapping is always available; the webhook surface needs the
        // signing secret and stays disabled without it
        let stripe = StripeConfig {
            webhook_secret: config.stripe_webhook_secret.clone(),
            monthly_price_id: config.stripe_monthly_price_id.clone(),
            yearly_price_id: config.stripe_yearly_price_id.clone(),
        };

        let billing = if config.billing_enabled() {
            Some(Arc::new(BillingState {
                webhooks: WebhookHandler::new(stripe.clone(), pool.clone()),
            }))
        } else {
            tracing::warn!("Stripe webhook secret not configured, webhook endpoint disabled");
            None
        };

        Self {
            gate: QuotaGate::new(pool.clone(), quota_config),
            subscriptions: SubscriptionStore::new(pool.clone()),
            ledger: UsageLedger::new(pool.clone()),
            pool,
            config: Arc::new(config),
            stripe,
            billing,
        }
    }
}
