//! `settings.json` loading and validation.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use secrecy::SecretString;
use serde::Deserialize;

use crate::api::FUTURES_BASE_URL;
use crate::coordinator::ClientSpec;
use crate::error::CopyError;
use crate::models::{Credentials, SubscriptionSpec, TraderProfile};
use crate::trading::EngineConfig;

/// Top-level settings file.
#[derive(Debug, Deserialize)]
pub struct Settings {
    /// Key used for read-only venue calls (leaderboard, exchange info)
    #[serde(alias = "master_public_api_key")]
    pub master_api_key: String,

    #[serde(default)]
    pub master_secret_key: Option<SecretString>,

    #[serde(alias = "binance_base_url", default = "default_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub traders: Vec<TraderProfile>,

    #[serde(default)]
    pub clients: Vec<ClientSettings>,

    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Debug, Deserialize)]
pub struct ClientSettings {
    pub name: String,

    #[serde(alias = "public_key")]
    pub api_key: String,

    #[serde(alias = "private_key")]
    pub secret_key: SecretString,

    #[serde(alias = "copy_traders", default)]
    pub subscriptions: Vec<SubscriptionSpec>,
}

fn default_base_url() -> String {
    FUTURES_BASE_URL.to_string()
}

impl ClientSettings {
    pub fn to_spec(&self) -> ClientSpec {
        ClientSpec {
            name: self.name.clone(),
            credentials: Credentials {
                api_key: self.api_key.clone(),
                secret_key: self.secret_key.clone(),
            },
            subscriptions: self.subscriptions.clone(),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("invalid settings file {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn master_credentials(&self) -> Credentials {
        Credentials {
            api_key: self.master_api_key.clone(),
            secret_key: self
                .master_secret_key
                .clone()
                .unwrap_or_else(|| SecretString::from(String::new())),
        }
    }

    pub fn client_specs(&self) -> Vec<ClientSpec> {
        self.clients.iter().map(ClientSettings::to_spec).collect()
    }

    /// Every configuration problem, in file order.
    pub fn problems(&self) -> Vec<CopyError> {
        let mut problems = Vec::new();

        let mut traders = HashSet::new();
        for t in &self.traders {
            if !traders.insert(t.name.as_str()) {
                problems.push(CopyError::DuplicateTrader(t.name.clone()));
            }
        }

        let mut clients = HashSet::new();
        for c in &self.clients {
            if !clients.insert(c.name.as_str()) {
                problems.push(CopyError::DuplicateClient(c.name.clone()));
            }
            if c.subscriptions.is_empty() {
                problems.push(CopyError::NoSubscriptions(c.name.clone()));
            }
            for sub in &c.subscriptions {
                if !traders.contains(sub.trader_name.as_str()) {
                    problems.push(CopyError::UnknownTrader {
                        client: c.name.clone(),
                        trader: sub.trader_name.clone(),
                    });
                }
                if sub.ratio <= Decimal::ZERO {
                    problems.push(CopyError::InvalidRatio {
                        client: c.name.clone(),
                        trader: sub.trader_name.clone(),
                        ratio: sub.ratio,
                    });
                }
            }
        }

        problems
    }

    /// Fail with one line per problem.
    pub fn validate(&self) -> Result<()> {
        let problems = self.problems();
        if problems.is_empty() {
            return Ok(());
        }
        let lines: Vec<String> = problems.iter().map(|p| format!("  - {}", p)).collect();
        bail!(
            "{} configuration problem(s):\n{}",
            problems.len(),
            lines.join("\n")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use secrecy::ExposeSecret;

    const SAMPLE: &str = r#"{
        "master_public_api_key": "MASTER",
        "binance_base_url": "https://testnet.binancefuture.com",
        "traders": [
            {"name": "alpha", "uid": "E921F42DCD4D9F6ECC0DFCE3BAB1D11A"},
            {"name": "beta", "uid": "3BAFAFCA68AB85929DF777C316F18C54"}
        ],
        "clients": [
            {
                "name": "c1",
                "public_key": "C1-KEY",
                "private_key": "C1-SECRET",
                "copy_traders": [{"name": "alpha", "ratio": 0.5}, {"name": "beta", "ratio": "2"}]
            }
        ]
    }"#;

    #[test]
    fn test_parse_settings_file_layout() {
        let settings = Settings::from_json(SAMPLE).unwrap();
        assert_eq!(settings.master_api_key, "MASTER");
        assert_eq!(settings.base_url, "https://testnet.binancefuture.com");
        assert_eq!(settings.traders[0].account_id, "E921F42DCD4D9F6ECC0DFCE3BAB1D11A");
        assert_eq!(settings.engine, EngineConfig::default());

        let spec = settings.clients[0].to_spec();
        assert_eq!(spec.credentials.api_key, "C1-KEY");
        assert_eq!(spec.credentials.secret(), "C1-SECRET");
        assert_eq!(
            spec.subscriptions,
            vec![
                SubscriptionSpec::new("alpha", dec!(0.5)),
                SubscriptionSpec::new("beta", dec!(2)),
            ]
        );
        assert!(settings.validate().is_ok());
        assert!(settings.master_credentials().secret_key.expose_secret().is_empty());
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let raw = r#"{
            "master_public_api_key": "MASTER",
            "traders": [{"name": "alpha", "uid": "1"}, {"name": "alpha", "uid": "2"}],
            "clients": [
                {"name": "c1", "public_key": "k", "private_key": "s",
                 "copy_traders": [{"name": "ghost", "ratio": 1}, {"name": "alpha", "ratio": 0}]},
                {"name": "c1", "public_key": "k2", "private_key": "s2", "copy_traders": []}
            ]
        }"#;
        let settings = Settings::from_json(raw).unwrap();
        assert_eq!(settings.base_url, FUTURES_BASE_URL);

        let problems = settings.problems();
        assert_eq!(problems.len(), 5);
        assert!(problems.iter().all(CopyError::is_configuration));

        let message = settings.validate().unwrap_err().to_string();
        assert!(message.starts_with("5 configuration problem(s):"));
        assert!(message.contains("duplicate trader name 'alpha'"));
        assert!(message.contains("client 'c1' subscribes to unknown trader 'ghost'"));
        assert!(message.contains("client 'c1' has no subscriptions"));
    }
}
