//! Client model: a downstream account copying one or more traders.

use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

/// API key pair of an exchange account.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub secret_key: SecretString,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            secret_key: SecretString::from(secret_key.into()),
        }
    }

    pub fn secret(&self) -> &str {
        self.secret_key.expose_secret()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

/// A client's request to copy `trader_name` scaled by `ratio`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubscriptionSpec {
    #[serde(alias = "name")]
    pub trader_name: String,

    pub ratio: Decimal,
}

impl SubscriptionSpec {
    pub fn new(trader_name: impl Into<String>, ratio: Decimal) -> Self {
        Self {
            trader_name: trader_name.into(),
            ratio,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_secret() {
        let creds = Credentials::new("pub-key", "very-secret");
        let printed = format!("{:?}", creds);
        assert!(printed.contains("pub-key"));
        assert!(!printed.contains("very-secret"));
        assert_eq!(creds.secret(), "very-secret");
    }
}
