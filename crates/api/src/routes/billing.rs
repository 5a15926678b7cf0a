//! Subscription and webhook API routes

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Serialize;
use time::OffsetDateTime;

use lagen_shared::SubscriptionStatus;

use crate::{auth::AuthUser, error::ApiError, state::AppState};

/// Subscription summary for the authenticated user
#[derive(Debug, Serialize)]
pub struct SubscriptionStatusResponse {
    /// "pro" for a paid subscription, "free" otherwise
    pub plan: String,
    pub status: Option<SubscriptionStatus>,
    pub cancel_at_period_end: bool,
    pub billing_cycle: Option<String>,
    pub current_period_end: Option<String>,
}

/// Get the current subscription state (free by default)
pub async fn subscription_status(
    State(state): State<AppState>,
    auth_user: AuthUser,
) -> Result<Json<SubscriptionStatusResponse>, ApiError> {
    let subscription = state.subscriptions.get_current(auth_user.user_id).await?;

    let response = match subscription {
        Some(sub) if sub.status.is_paid() => SubscriptionStatusResponse {
            plan: "pro".to_string(),
            billing_cycle: sub
                .stripe_price_id
                .as_deref()
                .and_then(|price_id| state.stripe.billing_cycle_for_price(price_id))
                .map(str::to_string),
            status: Some(sub.status),
            cancel_at_period_end: sub.cancel_at_period_end,
            current_period_end: sub.current_period_end.map(format_datetime),
        },
        Some(sub) => SubscriptionStatusResponse {
            plan: "free".to_string(),
            status: Some(sub.status),
            cancel_at_period_end: sub.cancel_at_period_end,
            billing_cycle: None,
            current_period_end: sub.current_period_end.map(format_datetime),
        },
        None => SubscriptionStatusResponse {
            plan: "free".to_string(),
            status: None,
            cancel_at_period_end: false,
            billing_cycle: None,
            current_period_end: None,
        },
    };

    Ok(Json(response))
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub message_count: i64,
}

/// Reset the message count to zero
///
/// Allowed for admins and for users holding a paid subscription; the webhook
/// reconciler normally does this on upgrade, this endpoint covers the case
/// where that event was missed.
pub async fn reset_message_count(
    State(state): State<AppState>,
    auth_user: AuthUser,
) -> Result<Json<ResetResponse>, ApiError> {
    let allowed = if auth_user.role.is_admin() {
        true
    } else {
        state
            .subscriptions
            .get_current(auth_user.user_id)
            .await?
            .map(|sub| sub.status.is_paid())
            .unwrap_or(false)
    };

    if !allowed {
        return Err(ApiError::Forbidden);
    }

    state.ledger.reset_count(auth_user.user_id).await?;

    tracing::info!(user_id = %auth_user.user_id, "Message count reset via API");

    Ok(Json(ResetResponse { message_count: 0 }))
}

/// Handle an incoming Stripe webhook
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, ApiError> {
    tracing::info!(body_len = body.len(), "Stripe webhook received");

    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;

    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            ApiError::BadRequest("Missing Stripe signature".to_string())
        })?;

    let event = billing
        .webhooks
        .verify_event(&body, signature)
        .map_err(|e| {
            tracing::warn!(error = ?e, "Stripe webhook signature verification failed");
            ApiError::BadRequest("Invalid webhook signature".to_string())
        })?;

    tracing::info!(
        event_type = %event.type_,
        event_id = %event.id,
        "Stripe webhook event verified"
    );

    let raw: serde_json::Value = serde_json::from_str(&body).unwrap_or(serde_json::Value::Null);

    // Processing errors return 5xx so Stripe redelivers
    billing.webhooks.handle_event(event, raw).await.map_err(|e| {
        tracing::error!("Webhook handling error: {}", e);
        ApiError::Database(format!("Webhook handling error: {}", e))
    })?;

    Ok(StatusCode::OK)
}

/// Helper to format datetime as RFC3339
fn format_datetime(dt: OffsetDateTime) -> String {
    dt.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| dt.to_string())
}
