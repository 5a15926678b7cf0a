//! Subscription store
//!
//! Canonical local record of Stripe subscription state. Writes come only from
//! the webhook reconciler; the quota gate reads through `get_current`.
//!
//! Out-of-order webhook delivery is handled here: every upsert is guarded by
//! the stored `updated_at` (the event time of the last applied webhook), so a
//! stale update can never regress state.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use lagen_shared::{Subscription, SubscriptionStatus};

use crate::error::BillingResult;

/// Fields applied by an upsert, all derived from a webhook event
#[derive(Debug, Clone)]
pub struct SubscriptionUpsert {
    pub stripe_subscription_id: String,
    pub user_id: Option<Uuid>,
    pub stripe_customer_id: String,
    pub stripe_price_id: Option<String>,
    pub status: SubscriptionStatus,
    pub cancel_at_period_end: bool,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    /// Stripe event creation time; drives the stale-update guard
    pub event_time: OffsetDateTime,
}

/// Store for locally synced subscription rows
#[derive(Clone)]
pub struct SubscriptionStore {
    pool: PgPool,
}

impl SubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert or update a subscription by its Stripe id
    ///
    /// Returns `true` if the write applied, `false` if it was skipped because
    /// the stored row carries a newer event time (out-of-order delivery).
    pub async fn upsert(&self, params: SubscriptionUpsert) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO stripe_subscriptions (
                stripe_subscription_id, user_id, stripe_customer_id, stripe_price_id,
                status, cancel_at_period_end, current_period_start, current_period_end,
                updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (stripe_subscription_id) DO UPDATE SET
                user_id = COALESCE(EXCLUDED.user_id, stripe_subscriptions.user_id),
                stripe_price_id =
                    COALESCE(EXCLUDED.stripe_price_id, stripe_subscriptions.stripe_price_id),
                status = EXCLUDED.status,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                current_period_start = COALESCE(
                    EXCLUDED.current_period_start, stripe_subscriptions.current_period_start),
                current_period_end = COALESCE(
                    EXCLUDED.current_period_end, stripe_subscriptions.current_period_end),
                updated_at = EXCLUDED.updated_at
            WHERE stripe_subscriptions.updated_at <= EXCLUDED.updated_at
            "#,
        )
        .bind(&params.stripe_subscription_id)
        .bind(params.user_id)
        .bind(&params.stripe_customer_id)
        .bind(&params.stripe_price_id)
        .bind(params.status)
        .bind(params.cancel_at_period_end)
        .bind(params.current_period_start)
        .bind(params.current_period_end)
        .bind(params.event_time)
        .execute(&self.pool)
        .await?;

        let applied = result.rows_affected() > 0;
        if !applied {
            tracing::debug!(
                subscription_id = %params.stripe_subscription_id,
                event_time = %params.event_time,
                "Skipped stale subscription update"
            );
        }
        Ok(applied)
    }

    /// The row a user is gated against: paid statuses first, then past_due,
    /// then canceled; most recently updated wins within a rank.
    pub async fn get_current(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        let subscription: Option<Subscription> = sqlx::query_as(
            r#"
            SELECT
                stripe_subscription_id, user_id, stripe_customer_id, stripe_price_id,
                status, cancel_at_period_end, current_period_start, current_period_end,
                updated_at
            FROM stripe_subscriptions
            WHERE user_id = $1
            ORDER BY
                CASE status
                    WHEN 'active' THEN 0
                    WHEN 'trialing' THEN 0
                    WHEN 'past_due' THEN 1
                    ELSE 2
                END,
                updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(subscription)
    }

    /// Fetch a subscription row by its Stripe id
    pub async fn get_by_id(&self, subscription_id: &str) -> BillingResult<Option<Subscription>> {
        let subscription: Option<Subscription> = sqlx::query_as(
            r#"
            SELECT
                stripe_subscription_id, user_id, stripe_customer_id, stripe_price_id,
                status, cancel_at_period_end, current_period_start, current_period_end,
                updated_at
            FROM stripe_subscriptions
            WHERE stripe_subscription_id = $1
            "#,
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(subscription)
    }

    /// Terminal cancellation from `customer.subscription.deleted`
    pub async fn mark_canceled(
        &self,
        subscription_id: &str,
        event_time: OffsetDateTime,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE stripe_subscriptions
            SET status = 'canceled',
                updated_at = GREATEST(updated_at, $2)
            WHERE stripe_subscription_id = $1
            "#,
        )
        .bind(subscription_id)
        .bind(event_time)
        .execute(&self.pool)
        .await?;

        tracing::info!(subscription_id = %subscription_id, "Subscription marked canceled");
        Ok(())
    }

    /// Payment failure from `invoice.payment_failed`
    ///
    /// Never resurrects a canceled subscription.
    pub async fn mark_past_due(
        &self,
        subscription_id: &str,
        event_time: OffsetDateTime,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE stripe_subscriptions
            SET status = 'past_due',
                updated_at = GREATEST(updated_at, $2)
            WHERE stripe_subscription_id = $1
              AND status != 'canceled'
            "#,
        )
        .bind(subscription_id)
        .bind(event_time)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            tracing::warn!(subscription_id = %subscription_id, "Subscription marked past_due");
        }
        Ok(())
    }

    /// Resolve the local user that owns a Stripe customer
    pub async fn user_for_customer(&self, customer_id: &str) -> BillingResult<Option<Uuid>> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"SELECT user_id FROM stripe_customers WHERE stripe_customer_id = $1"#,
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id,)| id))
    }

    /// Record the user ↔ Stripe customer mapping (idempotent)
    pub async fn record_customer(&self, user_id: Uuid, customer_id: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO stripe_customers (user_id, stripe_customer_id)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE SET stripe_customer_id = EXCLUDED.stripe_customer_id
            "#,
        )
        .bind(user_id)
        .bind(customer_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Backfill product and price rows from webhook payload data, so every
    /// subscription row references a known product/price pair.
    pub async fn ensure_price(
        &self,
        price_id: &str,
        product_id: &str,
        product_name: &str,
        unit_amount: i64,
        currency: &str,
        recurring_interval: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO stripe_products (stripe_product_id, name)
            VALUES ($1, $2)
            ON CONFLICT (stripe_product_id) DO NOTHING
            "#,
        )
        .bind(product_id)
        .bind(product_name)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO stripe_prices (
                stripe_price_id, stripe_product_id, unit_amount, currency, recurring_interval
            ) VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (stripe_price_id) DO NOTHING
            "#,
        )
        .bind(price_id)
        .bind(product_id)
        .bind(unit_amount)
        .bind(currency)
        .bind(recurring_interval)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record an invoice for audit (payment succeeded or failed)
    #[allow(clippy::too_many_arguments)]
    pub async fn record_invoice(
        &self,
        invoice_id: &str,
        customer_id: &str,
        subscription_id: Option<&str>,
        amount_due: i64,
        amount_paid: i64,
        currency: &str,
        status: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO stripe_invoices (
                stripe_invoice_id, stripe_customer_id, stripe_subscription_id,
                amount_due, amount_paid, currency, status
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (stripe_invoice_id) DO UPDATE SET
                amount_paid = EXCLUDED.amount_paid,
                status = EXCLUDED.status
            "#,
        )
        .bind(invoice_id)
        .bind(customer_id)
        .bind(subscription_id)
        .bind(amount_due)
        .bind(amount_paid)
        .bind(currency)
        .bind(status)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
