//! Usage status API routes

use axum::{extract::State, Json};
use serde::Serialize;

use lagen_billing::AdmissionReason;

use crate::{auth::AuthUser, error::ApiError, state::AppState};

/// Current usage snapshot for the authenticated user
#[derive(Debug, Serialize)]
pub struct UsageStatusResponse {
    pub count: i64,
    pub limit: u32,
    pub remaining: i64,
    /// Set once the count reaches 75% of the limit
    pub warning: bool,
    /// Admin role or paid subscription, no quota applies
    pub unlimited: bool,
}

/// Get the current message count against the free-tier limit
pub async fn usage_status(
    State(state): State<AppState>,
    auth_user: AuthUser,
) -> Result<Json<UsageStatusResponse>, ApiError> {
    // The admission decision skips the ledger read on bypass paths, so the
    // snapshot comes from the ledger regardless of role or subscription
    let usage = state.gate.usage(auth_user.user_id).await;
    let decision = state.gate.admit(auth_user.user_id, auth_user.role).await;

    tracing::debug!(
        user_id = %auth_user.user_id,
        count = usage.count,
        reason = ?decision.reason,
        "usage_status"
    );

    Ok(Json(UsageStatusResponse {
        count: usage.count,
        limit: usage.limit,
        remaining: usage.remaining,
        warning: usage.warning,
        unlimited: matches!(
            decision.reason,
            AdmissionReason::AdminBypass | AdmissionReason::PaidSubscription
        ),
    }))
}
