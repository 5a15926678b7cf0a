//! Stripe billing configuration

/// Configuration for Stripe billing
///
/// The reconciler is webhook-driven, so this carries only what event
/// processing needs: the signing secret and our known price ids.
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe webhook signing secret
    pub webhook_secret: String,
    /// Price ID for the monthly Pro plan
    pub monthly_price_id: String,
    /// Price ID for the yearly Pro plan
    pub yearly_price_id: String,
}

impl StripeConfig {
    /// Billing cycle for one of our known price IDs
    pub fn billing_cycle_for_price(&self, price_id: &str) -> Option<&'static str> {
        if price_id == self.monthly_price_id {
            Some("month")
        } else if price_id == self.yearly_price_id {
            Some("year")
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billing_cycle_for_price() {
        let config = StripeConfig {
            webhook_secret: "whsec_test".to_string(),
            monthly_price_id: "price_monthly".to_string(),
            yearly_price_id: "price_yearly".to_string(),
        };
        assert_eq!(
            config.billing_cycle_for_price("price_monthly"),
            Some("month")
        );
        assert_eq!(config.billing_cycle_for_price("price_yearly"), Some("year"));
        assert_eq!(config.billing_cycle_for_price("price_unknown"), None);
    }
}
