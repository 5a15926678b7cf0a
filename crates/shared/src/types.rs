//! Common types used across Lagen

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Enums
// =============================================================================

/// Account role supplied by the identity subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum UserRole {
    User,
    Admin,
}

impl Default for UserRole {
    fn default() -> Self {
        Self::User
    }
}

impl UserRole {
    /// Admins bypass the message quota entirely
    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Admin)
    }

    /// Parse a role from string (case insensitive)
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "ADMIN" => Self::Admin,
            _ => Self::User, // Default to user for unknown roles
        }
    }
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UserRole::User => write!(f, "USER"),
            UserRole::Admin => write!(f, "ADMIN"),
        }
    }
}

/// Subscription status as tracked locally
///
/// Stripe reports more states than we gate on; `from_stripe_lossy` folds them
/// into these four. Unknown states never grant the paid bypass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    /// Paid tiers (no quota applies)
    pub fn is_paid(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }

    /// Rank for choosing the row a user is gated against (lower wins)
    pub fn gating_rank(&self) -> u8 {
        match self {
            Self::Active | Self::Trialing => 0,
            Self::PastDue => 1,
            Self::Canceled => 2,
        }
    }

    /// Fold a raw Stripe status string into our local status set
    pub fn from_stripe_lossy(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            "trialing" => Self::Trialing,
            "past_due" | "unpaid" => Self::PastDue,
            _ => Self::Canceled,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trialing => "trialing",
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Records
// =============================================================================

/// A locally tracked Stripe subscription row
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub stripe_subscription_id: String,
    pub user_id: Option<Uuid>,
    pub stripe_customer_id: String,
    pub stripe_price_id: Option<String>,
    pub status: SubscriptionStatus,
    pub cancel_at_period_end: bool,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub updated_at: OffsetDateTime,
}

/// Result of a quota check against the usage ledger
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LimitCheck {
    pub allowed: bool,
    pub count: i64,
    pub remaining: i64,
}

/// Per-request usage snapshot, derived, never persisted
#[derive(Debug, Clone, Copy, Serialize)]
pub struct UsageState {
    pub count: i64,
    pub limit: u32,
    pub remaining: i64,
    pub warning: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parsing() {
        assert_eq!(UserRole::from_str_lossy("ADMIN"), UserRole::Admin);
        assert_eq!(UserRole::from_str_lossy("admin"), UserRole::Admin);
        assert_eq!(UserRole::from_str_lossy("USER"), UserRole::User);
        assert_eq!(UserRole::from_str_lossy("superuser"), UserRole::User);
        assert!(UserRole::Admin.is_admin());
        assert!(!UserRole::User.is_admin());
    }

    #[test]
    fn test_status_from_stripe() {
        assert_eq!(
            SubscriptionStatus::from_stripe_lossy("active"),
            SubscriptionStatus::Active
        );
        assert_eq!(
            SubscriptionStatus::from_stripe_lossy("trialing"),
            SubscriptionStatus::Trialing
        );
        assert_eq!(
            SubscriptionStatus::from_stripe_lossy("past_due"),
            SubscriptionStatus::PastDue
        );
        assert_eq!(
            SubscriptionStatus::from_stripe_lossy("unpaid"),
            SubscriptionStatus::PastDue
        );
        // Unknown states must not grant paid bypass
        assert_eq!(
            SubscriptionStatus::from_stripe_lossy("incomplete_expired"),
            SubscriptionStatus::Canceled
        );
    }

    #[test]
    fn test_gating_rank_prefers_paid() {
        assert!(
            SubscriptionStatus::Active.gating_rank() < SubscriptionStatus::PastDue.gating_rank()
        );
        assert!(
            SubscriptionStatus::PastDue.gating_rank() < SubscriptionStatus::Canceled.gating_rank()
        );
        assert_eq!(
            SubscriptionStatus::Active.gating_rank(),
            SubscriptionStatus::Trialing.gating_rank()
        );
    }

    #[test]
    fn test_paid_states() {
        assert!(SubscriptionStatus::Active.is_paid());
        assert!(SubscriptionStatus::Trialing.is_paid());
        assert!(!SubscriptionStatus::PastDue.is_paid());
        assert!(!SubscriptionStatus::Canceled.is_paid());
    }
}
