//! Configuration management for StealthPay.
//!
//! This module handles wallet settings stored in TOML format. It provides a
//! strongly-typed configuration structure with validation and reasonable
//! defaults.
//!
//! ## Security Considerations
//!
//! - No security-critical information is stored in this configuration
//! - Fee settings are validated before they are used to price transactions
//! - Configuration files must be protected from unauthorized modification

use anyhow::{anyhow, Result};
use bitcoin::Network;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::logging::LogConfig;
use crate::math::FeePolicy;

/// Main configuration structure for StealthPay
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub wallet: WalletConfig,

    #[serde(default)]
    pub fees: FeeConfig,

    #[serde(default)]
    pub send: SendConfig,

    #[serde(default)]
    pub poller: PollerConfig,

    #[serde(default)]
    pub logging: LogConfig,
}

/// Wallet-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletConfig {
    /// Network name as understood by `bitcoin::Network` ("bitcoin", "testnet", ...)
    #[serde(default = "default_network")]
    pub network: String,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
        }
    }
}

/// Transaction fee configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeConfig {
    /// Flat fee paid by every transaction, in satoshis
    #[serde(default = "default_pay_tx_fee")]
    pub pay_tx_fee_sats: u64,

    /// Fee rate applied to the transaction size, in sat/vB
    #[serde(default = "default_fee_rate")]
    pub fee_rate_sat_vb: f32,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            pay_tx_fee_sats: default_pay_tx_fee(),
            fee_rate_sat_vb: default_fee_rate(),
        }
    }
}

/// Send pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendConfig {
    /// Ask the user to confirm the computed fee before committing
    #[serde(default = "default_true")]
    pub require_fee_confirmation: bool,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            require_fee_confirmation: default_true(),
        }
    }
}

/// Balance poller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    #[serde(default = "default_poll_interval")]
    pub interval_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval(),
        }
    }
}

impl PollerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            fs::read_to_string(path).map_err(|e| anyhow!("Failed to read config file: {}", e))?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| anyhow!("Failed to parse config file: {}", e))
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| anyhow!("Failed to serialize config: {}", e))?;

        fs::write(path, content).map_err(|e| anyhow!("Failed to write config file: {}", e))?;

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        self.network()?;

        if !self.fees.fee_rate_sat_vb.is_finite() || self.fees.fee_rate_sat_vb < 0.0 {
            anyhow::bail!(
                "Invalid fee rate: {} sat/vB must be a non-negative number",
                self.fees.fee_rate_sat_vb
            );
        }

        if self.fees.pay_tx_fee_sats > crate::types::MAX_MONEY {
            anyhow::bail!("Invalid transaction fee: {} sats", self.fees.pay_tx_fee_sats);
        }

        if self.poller.interval_ms == 0 {
            return Err(anyhow!("Invalid poll interval: must be greater than 0"));
        }

        Ok(())
    }

    /// The configured Bitcoin network
    pub fn network(&self) -> Result<Network> {
        Network::from_str(&self.wallet.network.to_lowercase())
            .map_err(|_| anyhow!("Invalid network type: {}", self.wallet.network))
    }

    /// The fee policy handed to the transaction builder
    pub fn fee_policy(&self) -> FeePolicy {
        FeePolicy::from_sats(self.fees.pay_tx_fee_sats, self.fees.fee_rate_sat_vb)
    }
}

/// Ensure a configuration file exists at the specified path
/// If it doesn't exist, create it with default values
pub fn ensure_config_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .map_err(|e| anyhow!("Failed to create config directory: {}", e))?;
            }
        }

        Config::default().save(path)?;
    }

    Ok(())
}

// Default value functions

fn default_network() -> String {
    "bitcoin".to_string()
}

fn default_pay_tx_fee() -> u64 {
    10_000
}

fn default_fee_rate() -> f32 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    1_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::Amount;

    #[test]
    fn missing_sections_use_defaults() {
        let config = Config::from_toml("[fees]\npay_tx_fee_sats = 500\n").unwrap();

        assert_eq!(config.fees.pay_tx_fee_sats, 500);
        assert_eq!(config.fees.fee_rate_sat_vb, 1.0);
        assert_eq!(config.poller.interval_ms, 1_000);
        assert!(config.send.require_fee_confirmation);
        assert_eq!(config.network().unwrap(), Network::Bitcoin);
    }

    #[test]
    fn fee_policy_reflects_fee_section() {
        let config = Config::from_toml("[fees]\npay_tx_fee_sats = 10\nfee_rate_sat_vb = 0.0\n")
            .unwrap();
        assert_eq!(config.fee_policy().required_fee(1_000), Amount::from_sat(10));
    }

    #[test]
    fn rejects_unknown_network() {
        let mut config = Config::default();
        config.wallet.network = "moonnet".to_string();
        assert!(config.validate().is_err());

        config.wallet.network = "Testnet".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_poll_interval() {
        let mut config = Config::default();
        config.poller.interval_ms = 0;
        assert!(config.validate().is_err());
    }
}
