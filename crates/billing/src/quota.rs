//! Quota gate
//!
//! Admission control for the message-send path. The decision order is fixed:
//! admin bypass, then paid-subscription bypass, then the free-tier count
//! check. The count increments only after a confirmed send, via
//! `record_send`.
//!
//! Availability beats strict enforcement here: if a persistence read fails,
//! the gate admits the message and logs the failure for monitoring. A failed
//! increment is surfaced to the caller but never retried inline (inline
//! retries risk double-counting).

use sqlx::PgPool;
use uuid::Uuid;

use lagen_shared::{SubscriptionStatus, UsageState, UserRole};

use crate::error::BillingResult;
use crate::subscriptions::SubscriptionStore;
use crate::usage::UsageLedger;

/// Quota configuration, threaded explicitly so tests can run multiple limits
/// side by side. Never a process-wide constant.
#[derive(Debug, Clone, Copy)]
pub struct QuotaConfig {
    /// Free-tier message limit
    pub free_message_limit: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            free_message_limit: 20,
        }
    }
}

impl QuotaConfig {
    /// Count at which the "approaching limit" warning turns on:
    /// `ceil(0.75 × limit)`
    pub fn warning_threshold(&self) -> u32 {
        (3 * self.free_message_limit).div_ceil(4)
    }
}

/// Why a message was admitted or rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionReason {
    /// ADMIN role, no ledger or subscription read performed
    AdminBypass,
    /// Active or trialing subscription, no quota applies
    PaidSubscription,
    /// Free tier, count below the limit
    WithinFreeQuota,
    /// Free tier, count at or above the limit
    FreeQuotaExhausted,
    /// Persistence read failed; admitted per the fail-open policy
    FailOpen,
}

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub reason: AdmissionReason,
    /// Count at decision time; 0 when no ledger read happened (bypass paths)
    pub count: i64,
    pub limit: u32,
    pub remaining: i64,
    /// Informational only, never gates: `count >= ceil(0.75 × limit)`
    pub approaching_limit: bool,
}

/// Pure admission decision, given everything already read from storage
pub fn evaluate(
    role: UserRole,
    current_status: Option<SubscriptionStatus>,
    count: i64,
    config: QuotaConfig,
) -> AdmissionDecision {
    let limit = config.free_message_limit;

    if role.is_admin() {
        return AdmissionDecision {
            allowed: true,
            reason: AdmissionReason::AdminBypass,
            count: 0,
            limit,
            remaining: i64::from(limit),
            approaching_limit: false,
        };
    }

    if current_status.is_some_and(|s| s.is_paid()) {
        return AdmissionDecision {
            allowed: true,
            reason: AdmissionReason::PaidSubscription,
            count: 0,
            limit,
            remaining: i64::from(limit),
            approaching_limit: false,
        };
    }

    let allowed = count < i64::from(limit);
    AdmissionDecision {
        allowed,
        reason: if allowed {
            AdmissionReason::WithinFreeQuota
        } else {
            AdmissionReason::FreeQuotaExhausted
        },
        count,
        limit,
        remaining: (i64::from(limit) - count).max(0),
        approaching_limit: count >= i64::from(config.warning_threshold()),
    }
}

/// Usage snapshot derived from a stored count
///
/// Reports the real count for everyone: role and subscription bypass apply
/// to admission, never to reporting.
pub fn usage_state(count: i64, config: QuotaConfig) -> UsageState {
    let limit = config.free_message_limit;
    UsageState {
        count,
        limit,
        remaining: (i64::from(limit) - count).max(0),
        warning: count >= i64::from(config.warning_threshold()),
    }
}

/// Admission control service for the chat pipeline
#[derive(Clone)]
pub struct QuotaGate {
    store: SubscriptionStore,
    ledger: UsageLedger,
    config: QuotaConfig,
}

impl QuotaGate {
    pub fn new(pool: PgPool, config: QuotaConfig) -> Self {
        Self {
            store: SubscriptionStore::new(pool.clone()),
            ledger: UsageLedger::new(pool),
            config,
        }
    }

    pub fn config(&self) -> QuotaConfig {
        self.config
    }

    /// Decide whether a message may be sent. Reads only, never increments.
    pub async fn admit(&self, user_id: Uuid, role: UserRole) -> AdmissionDecision {
        // Admin bypass happens before any storage read
        if role.is_admin() {
            return evaluate(role, None, 0, self.config);
        }

        let status = match self.store.get_current(user_id).await {
            Ok(sub) => sub.map(|s| s.status),
            Err(e) => {
                tracing::error!(
                    user_id = %user_id,
                    error = %e,
                    "Subscription read failed during admission, failing open"
                );
                return self.fail_open();
            }
        };

        if status.is_some_and(|s| s.is_paid()) {
            return evaluate(role, status, 0, self.config);
        }

        match self.ledger.get_count(user_id).await {
            Ok(count) => evaluate(role, status, count, self.config),
            Err(e) => {
                tracing::error!(
                    user_id = %user_id,
                    error = %e,
                    "Usage count read failed during admission, failing open"
                );
                self.fail_open()
            }
        }
    }

    /// Usage snapshot for the status endpoint. Always reads the stored count.
    ///
    /// Fails open like `admit`: a read error reports an empty state rather
    /// than breaking the status surface.
    pub async fn usage(&self, user_id: Uuid) -> UsageState {
        match self.ledger.get_count(user_id).await {
            Ok(count) => usage_state(count, self.config),
            Err(e) => {
                tracing::error!(
                    user_id = %user_id,
                    error = %e,
                    "Usage count read failed for status, reporting zero"
                );
                usage_state(0, self.config)
            }
        }
    }

    /// Record a confirmed send. Call only after the chat pipeline reports
    /// success; a rejected admission never reaches this.
    ///
    /// Errors are returned for monitoring, not retried here.
    pub async fn record_send(&self, user_id: Uuid) -> BillingResult<i64> {
        match self.ledger.increment_count(user_id).await {
            Ok(count) => Ok(count),
            Err(e) => {
                tracing::error!(
                    user_id = %user_id,
                    error = %e,
                    "Failed to record sent message, count may undercount until reconciled"
                );
                Err(e)
            }
        }
    }

    fn fail_open(&self) -> AdmissionDecision {
        AdmissionDecision {
            allowed: true,
            reason: AdmissionReason::FailOpen,
            count: 0,
            limit: self.config.free_message_limit,
            remaining: i64::from(self.config.free_message_limit),
            approaching_limit: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit(n: u32) -> QuotaConfig {
        QuotaConfig {
            free_message_limit: n,
        }
    }

    #[test]
    fn test_admin_bypass_at_limit() {
        let decision = evaluate(UserRole::Admin, None, 20, limit(20));
        assert!(decision.allowed);
        assert_eq!(decision.reason, AdmissionReason::AdminBypass);
    }

    #[test]
    fn test_paid_bypass_at_limit() {
        for status in [SubscriptionStatus::Active, SubscriptionStatus::Trialing] {
            let decision = evaluate(UserRole::User, Some(status), 20, limit(20));
            assert!(decision.allowed);
            assert_eq!(decision.reason, AdmissionReason::PaidSubscription);
        }
    }

    #[test]
    fn test_free_user_denied_at_limit() {
        let decision = evaluate(UserRole::User, None, 20, limit(20));
        assert!(!decision.allowed);
        assert_eq!(decision.reason, AdmissionReason::FreeQuotaExhausted);
        assert_eq!(decision.remaining, 0);
    }

    #[test]
    fn test_free_user_allowed_below_limit() {
        let decision = evaluate(UserRole::User, None, 19, limit(20));
        assert!(decision.allowed);
        assert_eq!(decision.reason, AdmissionReason::WithinFreeQuota);
        assert_eq!(decision.remaining, 1);
    }

    #[test]
    fn test_past_due_and_canceled_do_not_bypass() {
        for status in [SubscriptionStatus::PastDue, SubscriptionStatus::Canceled] {
            let decision = evaluate(UserRole::User, Some(status), 20, limit(20));
            assert!(!decision.allowed);
        }
    }

    #[test]
    fn test_warning_threshold_limit_20() {
        assert_eq!(limit(20).warning_threshold(), 15);
        let below = evaluate(UserRole::User, None, 14, limit(20));
        assert!(!below.approaching_limit);
        let at = evaluate(UserRole::User, None, 15, limit(20));
        assert!(at.approaching_limit);
    }

    #[test]
    fn test_warning_threshold_limit_10() {
        assert_eq!(limit(10).warning_threshold(), 8);
        let below = evaluate(UserRole::User, None, 7, limit(10));
        assert!(!below.approaching_limit);
        let at = evaluate(UserRole::User, None, 8, limit(10));
        assert!(at.approaching_limit);
    }

    #[test]
    fn test_warning_never_set_on_bypass_paths() {
        let admin = evaluate(UserRole::Admin, None, 19, limit(20));
        assert!(!admin.approaching_limit);
        let paid = evaluate(
            UserRole::User,
            Some(SubscriptionStatus::Active),
            19,
            limit(20),
        );
        assert!(!paid.approaching_limit);
    }

    #[test]
    fn test_usage_state_reports_real_count() {
        // An admin past the warning threshold is still admitted, but the
        // status surface must show the stored count, not zeros
        let state = usage_state(16, limit(20));
        assert_eq!(state.count, 16);
        assert_eq!(state.remaining, 4);
        assert!(state.warning);
        assert!(evaluate(UserRole::Admin, None, 16, limit(20)).allowed);
    }

    #[test]
    fn test_usage_state_warning_boundary() {
        assert!(!usage_state(14, limit(20)).warning);
        assert!(usage_state(15, limit(20)).warning);
        let exhausted = usage_state(20, limit(20));
        assert_eq!(exhausted.remaining, 0);
        assert!(exhausted.warning);
    }

    #[test]
    fn test_two_limits_side_by_side() {
        // Same count, different configured limits
        let strict = evaluate(UserRole::User, None, 10, limit(10));
        let loose = evaluate(UserRole::User, None, 10, limit(20));
        assert!(!strict.allowed);
        assert!(loose.allowed);
    }
}
