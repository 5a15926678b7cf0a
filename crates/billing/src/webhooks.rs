//! Stripe webhook handling
//!
//! Verifies event signatures, deduplicates by event id, and applies
//! subscription state transitions to the local store. Every effect is
//! idempotent (upsert-by-key, reset-to-zero), so redelivered or out-of-order
//! events converge instead of double-applying.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use stripe::{Event, EventObject, EventType, Invoice, Subscription, Webhook};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeConfig;
use crate::error::{BillingError, BillingResult};
use crate::subscriptions::{SubscriptionStore, SubscriptionUpsert};
use crate::usage::UsageLedger;

type HmacSha256 = Hmac<Sha256>;

/// Signature timestamp tolerance (seconds)
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Events stuck in `processing` longer than this may be reclaimed
const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

/// Verify a Stripe `stripe-signature` header against a payload
///
/// Implements the `t=timestamp,v1=hex-hmac` scheme: HMAC-SHA256 over
/// `"{timestamp}.{payload}"` with the webhook signing secret. `now` is the
/// current unix time, injected so tolerance checks are testable.
pub fn verify_signature_at(
    payload: &str,
    signature: &str,
    webhook_secret: &str,
    now: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<String> = None;

    for part in signature.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0] {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => v1_signature = Some(kv[1].to_string()),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or(BillingError::WebhookSignatureInvalid)?;
    let v1_signature = v1_signature.ok_or(BillingError::WebhookSignatureInvalid)?;

    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    // The secret's "whsec_" prefix is not part of the key material
    let secret_key = webhook_secret
        .strip_prefix("whsec_")
        .unwrap_or(webhook_secret);
    let signed_payload = format!("{}.{}", timestamp, payload);

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(signed_payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed != v1_signature {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

/// Webhook handler for Stripe events
#[derive(Clone)]
pub struct WebhookHandler {
    config: StripeConfig,
    pool: PgPool,
    store: SubscriptionStore,
    ledger: UsageLedger,
}

impl WebhookHandler {
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        Self {
            store: SubscriptionStore::new(pool.clone()),
            ledger: UsageLedger::new(pool.clone()),
            config,
            pool,
        }
    }

    /// Verify and parse a Stripe webhook event
    ///
    /// Tries the stripe crate's standard verification first; falls back to
    /// manual signature verification for payloads from newer Stripe API
    /// versions that the crate's strict parser rejects.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        let webhook_secret = &self.config.webhook_secret;

        match Webhook::construct_event(payload, signature, webhook_secret) {
            Ok(event) => return Ok(event),
            Err(e) => {
                tracing::debug!(
                    stripe_error = %e,
                    "Standard webhook parsing failed, trying manual verification"
                );
            }
        }

        let now = OffsetDateTime::now_utc().unix_timestamp();
        verify_signature_at(payload, signature, webhook_secret, now)?;

        let event: Event = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse verified webhook payload");
            BillingError::WebhookSignatureInvalid
        })?;

        Ok(event)
    }

    /// Verify, deduplicate, and apply a raw webhook delivery
    pub async fn process(&self, payload: &str, signature: &str) -> BillingResult<()> {
        let event = self.verify_event(payload, signature)?;
        let raw: serde_json::Value =
            serde_json::from_str(payload).unwrap_or(serde_json::Value::Null);
        self.handle_event(event, raw).await
    }

    /// Handle a verified Stripe event
    ///
    /// Dedup via an atomic claim: `INSERT .. ON CONFLICT .. RETURNING` either
    /// grants exclusive processing rights or proves another delivery got
    /// there first. The claim row (with the raw payload) is durable before
    /// any state mutation, so a crash between "received" and "applied" leaves
    /// a reclaimable record rather than a lost event.
    pub async fn handle_event(&self, event: Event, payload: serde_json::Value) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let event_type_str = event.type_.to_string();
        let event_timestamp = OffsetDateTime::from_unix_timestamp(event.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());

        // Re-claimable states: stuck 'processing' past the timeout, and
        // 'error' (Stripe redelivers after our 5xx; the retry must actually
        // reprocess, not short-circuit as a duplicate).
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, event_timestamp, payload,
                 processing_result, processing_started_at)
            VALUES ($1, $2, $3, $4, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW()
            WHERE stripe_webhook_events.processing_result = 'error'
               OR (stripe_webhook_events.processing_result = 'processing'
                   AND stripe_webhook_events.processing_started_at
                       < NOW() - make_interval(mins => $5))
            RETURNING id
            "#,
        )
        .bind(&event_id)
        .bind(&event_type_str)
        .bind(event_timestamp)
        .bind(&payload)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(event_id = %event_id, error = %e, "Failed to claim webhook event");
            BillingError::Database(e.to_string())
        })?;

        if claimed.is_none() {
            tracing::info!(
                event_id = %event_id,
                event_type = %event_type_str,
                "Duplicate webhook event, skipping"
            );
            return Ok(());
        }

        tracing::info!(
            event_id = %event_id,
            event_type = %event_type_str,
            "Processing Stripe webhook event"
        );

        let result = self.apply_event(&event).await;

        let (processing_result, error_message) = match &result {
            Ok(()) => ("success", None),
            Err(e) => ("error", Some(e.to_string())),
        };

        if let Err(e) = sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(processing_result)
        .bind(&error_message)
        .bind(&event_id)
        .execute(&self.pool)
        .await
        {
            tracing::error!(
                event_id = %event_id,
                error = %e,
                "Failed to record webhook processing result; event may appear stuck"
            );
        }

        result
    }

    /// Dispatch on event type; unrecognized types are recorded-only
    async fn apply_event(&self, event: &Event) -> BillingResult<()> {
        let event_time = OffsetDateTime::from_unix_timestamp(event.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());

        match event.type_ {
            EventType::CustomerSubscriptionCreated => {
                let subscription = extract_subscription(event)?;
                self.handle_subscription_created(subscription, event_time)
                    .await
            }
            EventType::CustomerSubscriptionUpdated => {
                let subscription = extract_subscription(event)?;
                self.handle_subscription_updated(subscription, event_time)
                    .await
            }
            EventType::CustomerSubscriptionDeleted => {
                let subscription = extract_subscription(event)?;
                self.store
                    .mark_canceled(&subscription.id.to_string(), event_time)
                    .await
            }
            EventType::InvoicePaymentSucceeded | EventType::InvoicePaid => {
                let invoice = extract_invoice(event)?;
                self.handle_invoice(invoice, false, event_time).await
            }
            EventType::InvoicePaymentFailed => {
                let invoice = extract_invoice(event)?;
                self.handle_invoice(invoice, true, event_time).await
            }
            _ => {
                // Recorded for audit by the claim row; not an error
                tracing::info!(
                    event_type = %event.type_,
                    event_id = %event.id,
                    "Unhandled Stripe event type, recorded only"
                );
                Ok(())
            }
        }
    }

    async fn handle_subscription_created(
        &self,
        subscription: Subscription,
        event_time: OffsetDateTime,
    ) -> BillingResult<()> {
        let params = self.upsert_params(&subscription, event_time).await?;
        let user_id = params.user_id;
        let status = params.status;

        self.store.upsert(params).await?;

        // New paid subscription: give the user a fresh quota
        if status.is_paid() {
            if let Some(user_id) = user_id {
                self.ledger.reset_count(user_id).await?;
            } else {
                tracing::warn!(
                    subscription_id = %subscription.id,
                    "Subscription created for unmapped customer, skipping quota reset"
                );
            }
        }

        Ok(())
    }

    async fn handle_subscription_updated(
        &self,
        subscription: Subscription,
        event_time: OffsetDateTime,
    ) -> BillingResult<()> {
        let subscription_id = subscription.id.to_string();
        let prior = self.store.get_by_id(&subscription_id).await?;
        let params = self.upsert_params(&subscription, event_time).await?;
        let user_id = params.user_id;
        let new_status = params.status;

        let applied = self.store.upsert(params).await?;

        // Reset exactly on the transition into a paid state. Downgrades and
        // cancellations freeze the count where it is.
        let was_paid = prior.map(|p| p.status.is_paid()).unwrap_or(false);
        if applied && new_status.is_paid() && !was_paid {
            if let Some(user_id) = user_id {
                self.ledger.reset_count(user_id).await?;
            }
        }

        Ok(())
    }

    async fn handle_invoice(
        &self,
        invoice: Invoice,
        payment_failed: bool,
        event_time: OffsetDateTime,
    ) -> BillingResult<()> {
        let invoice_id = invoice.id.to_string();
        let customer_id = match &invoice.customer {
            Some(stripe::Expandable::Id(id)) => id.to_string(),
            Some(stripe::Expandable::Object(c)) => c.id.to_string(),
            None => String::new(),
        };
        let subscription_id = match &invoice.subscription {
            Some(stripe::Expandable::Id(id)) => Some(id.to_string()),
            Some(stripe::Expandable::Object(s)) => Some(s.id.to_string()),
            None => None,
        };

        self.store
            .record_invoice(
                &invoice_id,
                &customer_id,
                subscription_id.as_deref(),
                invoice.amount_due.unwrap_or(0),
                invoice.amount_paid.unwrap_or(0),
                &invoice
                    .currency
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "usd".to_string()),
                &invoice
                    .status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
            )
            .await?;

        if payment_failed {
            if let Some(subscription_id) = subscription_id {
                self.store
                    .mark_past_due(&subscription_id, event_time)
                    .await?;
            }
            tracing::warn!(invoice_id = %invoice_id, "Invoice payment failed");
        } else {
            // Payment success never touches message counts; the period
            // refresh rides on the subscription.updated event Stripe emits
            // alongside renewal invoices.
            tracing::info!(invoice_id = %invoice_id, "Invoice payment recorded");
        }

        Ok(())
    }

    /// Build upsert params from a Stripe subscription object, resolving the
    /// owning user and backfilling price/product rows
    async fn upsert_params(
        &self,
        subscription: &Subscription,
        event_time: OffsetDateTime,
    ) -> BillingResult<SubscriptionUpsert> {
        let customer_id = match &subscription.customer {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(c) => c.id.to_string(),
        };
        let user_id = self.store.user_for_customer(&customer_id).await?;

        let status_str = match subscription.status {
            stripe::SubscriptionStatus::Active => "active",
            stripe::SubscriptionStatus::Trialing => "trialing",
            stripe::SubscriptionStatus::PastDue => "past_due",
            stripe::SubscriptionStatus::Unpaid => "unpaid",
            stripe::SubscriptionStatus::Canceled => "canceled",
            stripe::SubscriptionStatus::Incomplete => "incomplete",
            stripe::SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            stripe::SubscriptionStatus::Paused => "paused",
        };
        let status = lagen_shared::SubscriptionStatus::from_stripe_lossy(status_str);

        // A future cancel_at date gates the same as cancel_at_period_end
        let cancel_at_period_end =
            subscription.cancel_at_period_end || subscription.cancel_at.is_some();

        let price = subscription
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref());

        let price_id = price.map(|p| p.id.to_string());
        if let Some(price) = price {
            if let Some(product) = price.product.as_ref() {
                let product_id = match product {
                    stripe::Expandable::Id(id) => id.to_string(),
                    stripe::Expandable::Object(p) => p.id.to_string(),
                };
                self.store
                    .ensure_price(
                        &price.id.to_string(),
                        &product_id,
                        price.nickname.as_deref().unwrap_or("Pro Plan"),
                        price.unit_amount.unwrap_or(0),
                        &price
                            .currency
                            .map(|c| c.to_string())
                            .unwrap_or_else(|| "usd".to_string()),
                        &price
                            .recurring
                            .as_ref()
                            .map(|r| r.interval.to_string())
                            .unwrap_or_else(|| "month".to_string()),
                    )
                    .await?;
            }
        }

        Ok(SubscriptionUpsert {
            stripe_subscription_id: subscription.id.to_string(),
            user_id,
            stripe_customer_id: customer_id,
            stripe_price_id: price_id,
            status,
            cancel_at_period_end,
            current_period_start: OffsetDateTime::from_unix_timestamp(
                subscription.current_period_start,
            )
            .ok(),
            current_period_end: OffsetDateTime::from_unix_timestamp(
                subscription.current_period_end,
            )
            .ok(),
            event_time,
        })
    }
}

fn extract_subscription(event: &Event) -> BillingResult<Subscription> {
    match &event.data.object {
        EventObject::Subscription(subscription) => Ok(subscription.clone()),
        other => Err(BillingError::Internal(format!(
            "Expected subscription object in {} event, got {:?}",
            event.type_, other
        ))),
    }
}

fn extract_invoice(event: &Event) -> BillingResult<Invoice> {
    match &event.data.object {
        EventObject::Invoice(invoice) => Ok(invoice.clone()),
        other => Err(BillingError::Internal(format!(
            "Expected invoice object in {} event, got {:?}",
            event.type_, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret_for_signature_checks";

    fn sign(payload: &str, timestamp: i64, secret: &str) -> String {
        let key = secret.strip_prefix("whsec_").unwrap_or(secret);
        let mut mac = HmacSha256::new_from_slice(key.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        let sig = hex::encode(mac.finalize().into_bytes());
        format!("t={},v1={}", timestamp, sig)
    }

    #[test]
    fn test_valid_signature_accepted() {
        let payload = r#"{"id":"evt_1","type":"customer.subscription.created"}"#;
        let now = 1_700_000_000;
        let header = sign(payload, now, SECRET);
        assert!(verify_signature_at(payload, &header, SECRET, now).is_ok());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let payload = r#"{"id":"evt_1"}"#;
        let now = 1_700_000_000;
        let header = sign(payload, now, "whsec_some_other_secret");
        assert!(matches!(
            verify_signature_at(payload, &header, SECRET, now),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let payload = r#"{"id":"evt_1","amount":100}"#;
        let now = 1_700_000_000;
        let header = sign(payload, now, SECRET);
        let tampered = r#"{"id":"evt_1","amount":99999}"#;
        assert!(matches!(
            verify_signature_at(tampered, &header, SECRET, now),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let payload = r#"{"id":"evt_1"}"#;
        let signed_at = 1_700_000_000;
        let header = sign(payload, signed_at, SECRET);
        let now = signed_at + SIGNATURE_TOLERANCE_SECS + 1;
        assert!(matches!(
            verify_signature_at(payload, &header, SECRET, now),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn test_timestamp_within_tolerance_accepted() {
        let payload = r#"{"id":"evt_1"}"#;
        let signed_at = 1_700_000_000;
        let header = sign(payload, signed_at, SECRET);
        let now = signed_at + SIGNATURE_TOLERANCE_SECS;
        assert!(verify_signature_at(payload, &header, SECRET, now).is_ok());
    }

    #[test]
    fn test_malformed_header_rejected() {
        let payload = r#"{"id":"evt_1"}"#;
        for header in ["", "garbage", "t=abc,v1=def", "v1=deadbeef"] {
            assert!(
                verify_signature_at(payload, header, SECRET, 1_700_000_000).is_err(),
                "header {:?} should be rejected",
                header
            );
        }
    }
}
