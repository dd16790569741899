//! Stripe client configuration

use std::collections::BTreeMap;

use stripe::Client;

use crate::error::{LedgerError, LedgerResult};

const DEFAULT_SUBSCRIPTION_PERIOD_CREDITS: i32 = 120;

/// Configuration for Stripe payments
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
    /// Credits granted per subscription billing period
    pub subscription_period_credits: i32,
    /// One-time credit packs, keyed by charge amount in cents
    pub credit_packs: CreditPacks,
}

/// One-time credit packs, amount-in-cents to credits. Used as the fallback
/// when a payment intent carries no `credits` metadata.
#[derive(Debug, Clone, Default)]
pub struct CreditPacks {
    packs: BTreeMap<i64, i32>,
}

impl CreditPacks {
    /// Parse the `CREDIT_PACKS` format: comma-separated `cents:credits`
    /// pairs, e.g. "999:100,1999:250"
    pub fn parse(raw: &str) -> LedgerResult<Self> {
        let mut packs = BTreeMap::new();
        for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (cents, credits) = pair.split_once(':').ok_or_else(|| {
                LedgerError::Config(format!("CREDIT_PACKS entry '{}' is not cents:credits", pair))
            })?;
            let cents: i64 = cents.trim().parse().map_err(|_| {
                LedgerError::Config(format!("CREDIT_PACKS amount '{}' is not a number", cents))
            })?;
            let credits: i32 = credits.trim().parse().map_err(|_| {
                LedgerError::Config(format!("CREDIT_PACKS credits '{}' is not a number", credits))
            })?;
            if cents <= 0 || credits <= 0 {
                return Err(LedgerError::Config(format!(
                    "CREDIT_PACKS entry '{}' must be positive",
                    pair
                )));
            }
            packs.insert(cents, credits);
        }
        Ok(Self { packs })
    }

    /// Credits for an exact charge amount, if a pack is configured for it
    pub fn credits_for_amount(&self, amount_cents: i64) -> Option<i32> {
        self.packs.get(&amount_cents).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.packs.is_empty()
    }
}

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> LedgerResult<Self> {
        let subscription_period_credits = match std::env::var("SUBSCRIPTION_PERIOD_CREDITS") {
            Ok(raw) => raw.parse().map_err(|_| {
                LedgerError::Config("SUBSCRIPTION_PERIOD_CREDITS is not a number".to_string())
            })?,
            Err(_) => DEFAULT_SUBSCRIPTION_PERIOD_CREDITS,
        };

        let credit_packs = match std::env::var("CREDIT_PACKS") {
            Ok(raw) => CreditPacks::parse(&raw)?,
            Err(_) => CreditPacks::default(),
        };

        Ok(Self {
            secret_key: std::env::var("STRIPE_SECRET_KEY")
                .map_err(|_| LedgerError::Config("STRIPE_SECRET_KEY not set".to_string()))?,
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET")
                .map_err(|_| LedgerError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?,
            subscription_period_credits,
            credit_packs,
        })
    }
}

/// Stripe API client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self { client, config }
    }

    /// Create a new Stripe client from environment variables
    pub fn from_env() -> LedgerResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config))
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the config
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credit_packs_parse() {
        let packs = CreditPacks::parse("999:100,1999:250").expect("parse");
        assert_eq!(packs.credits_for_amount(999), Some(100));
        assert_eq!(packs.credits_for_amount(1999), Some(250));
        assert_eq!(packs.credits_for_amount(500), None);
    }

    #[test]
    fn test_credit_packs_parse_tolerates_whitespace_and_trailing_comma() {
        let packs = CreditPacks::parse(" 999 : 100 , ").expect("parse");
        assert_eq!(packs.credits_for_amount(999), Some(100));
    }

    #[test]
    fn test_credit_packs_rejects_garbage() {
        assert!(CreditPacks::parse("999").is_err());
        assert!(CreditPacks::parse("abc:100").is_err());
        assert!(CreditPacks::parse("999:-5").is_err());
    }

    #[test]
    fn test_empty_packs() {
        let packs = CreditPacks::default();
        assert!(packs.is_empty());
        assert_eq!(packs.credits_for_amount(999), None);
    }
}
