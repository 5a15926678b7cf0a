//! Application configuration

use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    // Authentication
    pub jwt_secret: String,

    // Quota
    pub free_message_limit: u32,

    // Stripe (an empty webhook secret disables the webhook surface at runtime)
    pub stripe_webhook_secret: String,
    pub stripe_monthly_price_id: String,
    pub stripe_yearly_price_id: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),

            // Database
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .unwrap_or(20),

            // Authentication
            jwt_secret: {
                let secret =
                    env::var("JWT_SECRET").map_err(|_| ConfigError::Missing("JWT_SECRET"))?;
                // A short signing key makes forged tokens feasible
                if secret.len() < 32 {
                    return Err(ConfigError::WeakSecret(
                        "JWT_SECRET must be at least 32 characters",
                    ));
                }
                secret
            },

            // Quota
            free_message_limit: env::var("FREE_USER_MESSAGE_LIMIT")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .unwrap_or(20),

            // Stripe
            stripe_webhook_secret: env::var("STRIPE_WEBHOOK_SECRET").unwrap_or_default(),
            stripe_monthly_price_id: env::var("STRIPE_MONTHLY_PRICE_ID")
                .unwrap_or_else(|_| "price_monthly".to_string()),
            stripe_yearly_price_id: env::var("STRIPE_YEARLY_PRICE_ID")
                .unwrap_or_else(|_| "price_yearly".to_string()),
        })
    }

    /// Whether the webhook signing secret is present, enabling the webhook
    /// surface
    pub fn billing_enabled(&self) -> bool {
        !self.stripe_webhook_secret.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to ensure config tests run serially (they modify shared env vars)
    static CONFIG_TEST_MUTEX: Mutex<()> = Mutex::new(());

    fn setup_minimal_config() {
        env::set_var("DATABASE_URL", "postgres://test");
        env::set_var(
            "JWT_SECRET",
            "test-jwt-secret-must-be-at-least-32-characters-long",
        );
    }

    fn cleanup_config() {
        env::remove_var("DATABASE_URL");
        env::remove_var("JWT_SECRET");
        env::remove_var("FREE_USER_MESSAGE_LIMIT");
        env::remove_var("STRIPE_WEBHOOK_SECRET");
    }

    #[test]
    fn test_config_validation() {
        let _lock = CONFIG_TEST_MUTEX.lock().unwrap();

        // === Test 1: Missing DATABASE_URL ===
        cleanup_config();
        env::set_var(
            "JWT_SECRET",
            "test-jwt-secret-must-be-at-least-32-characters-long",
        );
        let result = Config::from_env();
        assert!(
            matches!(result, Err(ConfigError::Missing("DATABASE_URL"))),
            "Missing DATABASE_URL should fail"
        );

        // === Test 2: Short JWT secret rejected ===
        setup_minimal_config();
        env::set_var("JWT_SECRET", "too-short");
        let result = Config::from_env();
        assert!(
            matches!(result, Err(ConfigError::WeakSecret(_))),
            "Short JWT secret should be rejected"
        );

        // === Test 3: Valid config with defaults ===
        setup_minimal_config();
        let config = Config::from_env().expect("Valid config should load");
        assert_eq!(config.free_message_limit, 20);
        assert_eq!(config.bind_address, "0.0.0.0:3000");
        assert!(!config.billing_enabled());

        // === Test 4: Quota limit override ===
        env::set_var("FREE_USER_MESSAGE_LIMIT", "10");
        let config = Config::from_env().expect("Valid config should load");
        assert_eq!(config.free_message_limit, 10);

        // === Test 5: Garbage limit falls back to default ===
        env::set_var("FREE_USER_MESSAGE_LIMIT", "not-a-number");
        let config = Config::from_env().expect("Valid config should load");
        assert_eq!(config.free_message_limit, 20);

        // === Test 6: Billing enabled when the webhook secret is set ===
        env::set_var("STRIPE_WEBHOOK_SECRET", "whsec_test_123");
        let config = Config::from_env().expect("Valid config should load");
        assert!(config.billing_enabled());

        cleanup_config();
    }
}
