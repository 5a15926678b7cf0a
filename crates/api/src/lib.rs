//! Lagen API Library
//!
//! This crate contains the HTTP server components for Lagen: routes for
//! usage and subscription status, the Stripe webhook endpoint, JWT identity
//! extraction, and application config and state.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
