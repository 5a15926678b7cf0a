//! Shared types and database utilities for Lagen

pub mod db;
pub mod types;

pub use types::{LimitCheck, Subscription, SubscriptionStatus, UsageState, UserRole};
