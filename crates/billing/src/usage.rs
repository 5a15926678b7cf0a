//! Usage ledger
//!
//! Tracks per-user message counts and enforces the free-tier quota.
//! Increments serialize at the storage layer (single conditional UPDATE),
//! so concurrent sends across service instances never lose updates.

use sqlx::PgPool;
use uuid::Uuid;

use lagen_shared::LimitCheck;

use crate::error::{BillingError, BillingResult};

/// Per-user message count ledger
#[derive(Clone)]
pub struct UsageLedger {
    pool: PgPool,
}

impl UsageLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Current message count for a user
    pub async fn get_count(&self, user_id: Uuid) -> BillingResult<i64> {
        let row: Option<(i32,)> =
            sqlx::query_as(r#"SELECT message_count FROM users WHERE id = $1"#)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((count,)) => Ok(i64::from(count)),
            None => Err(BillingError::UserNotFound(user_id)),
        }
    }

    /// Increment the message count and return the new value
    ///
    /// Atomic with respect to concurrent increments for the same user: the
    /// read-modify-write happens inside a single UPDATE, never in application
    /// code.
    pub async fn increment_count(&self, user_id: Uuid) -> BillingResult<i64> {
        let row: Option<(i32,)> = sqlx::query_as(
            r#"
            UPDATE users
            SET message_count = COALESCE(message_count, 0) + 1
            WHERE id = $1
            RETURNING message_count
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((count,)) => {
                tracing::debug!(user_id = %user_id, count = count, "Incremented message count");
                Ok(i64::from(count))
            }
            None => Err(BillingError::UserNotFound(user_id)),
        }
    }

    /// Reset the message count to zero. Idempotent.
    ///
    /// Unknown users are a no-op rather than an error: the reset is driven by
    /// webhook replays, which must converge regardless of delivery order.
    pub async fn reset_count(&self, user_id: Uuid) -> BillingResult<()> {
        let result = sqlx::query(r#"UPDATE users SET message_count = 0 WHERE id = $1"#)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            tracing::warn!(user_id = %user_id, "Reset requested for unknown user");
        } else {
            tracing::info!(user_id = %user_id, "Message count reset to zero");
        }
        Ok(())
    }

    /// Check the count against a limit. Pure read, never mutates.
    pub async fn check_limit(&self, user_id: Uuid, limit: u32) -> BillingResult<LimitCheck> {
        let count = self.get_count(user_id).await?;
        let limit = i64::from(limit);
        Ok(LimitCheck {
            allowed: count < limit,
            count,
            remaining: (limit - count).max(0),
        })
    }
}
