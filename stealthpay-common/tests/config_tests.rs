use anyhow::Result;
use bitcoin::{Amount, Network};
use stealthpay_common::config::{self, Config};
use stealthpay_common::logging::LogLevel;
use std::fs;
use tempfile::TempDir;

use test_utils::init_test_environment;

// Helper function to create a temporary directory and config file for testing
fn setup_test_config(content: &str) -> (TempDir, std::path::PathBuf) {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config_path = temp_dir.path().join("config.toml");

    fs::write(&config_path, content).expect("Failed to write test config");
    assert!(config_path.exists(), "Failed to create config file");

    (temp_dir, config_path)
}

#[test]
fn test_ensure_config_exists_creates_default() -> Result<()> {
    init_test_environment();
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config_path = temp_dir.path().join("nested").join("config.toml");

    config::ensure_config_exists(&config_path)?;
    assert!(config_path.exists(), "Config file was not created");

    let config = Config::load(&config_path)?;
    assert_eq!(config.network()?, Network::Bitcoin);
    assert_eq!(config.fees.pay_tx_fee_sats, 10_000);
    assert_eq!(config.poller.interval_ms, 1_000);
    assert!(config.send.require_fee_confirmation);
    config.validate()?;
    Ok(())
}

#[test]
fn test_ensure_config_exists_keeps_existing_file() -> Result<()> {
    init_test_environment();
    let (_dir, path) = setup_test_config("[wallet]\nnetwork = \"testnet\"\n");

    config::ensure_config_exists(&path)?;

    let config = Config::load(&path)?;
    assert_eq!(config.network()?, Network::Testnet);
    Ok(())
}

#[test]
fn test_load_full_config() -> Result<()> {
    init_test_environment();
    let (_dir, path) = setup_test_config(
        r#"
        [wallet]
        network = "regtest"

        [fees]
        pay_tx_fee_sats = 10
        fee_rate_sat_vb = 0.0

        [send]
        require_fee_confirmation = false

        [poller]
        interval_ms = 250

        [logging]
        level = "Debug"
        json_format = true
        "#,
    );

    let config = Config::load(&path)?;
    config.validate()?;

    assert_eq!(config.network()?, Network::Regtest);
    assert_eq!(config.fee_policy().required_fee(5_000), Amount::from_sat(10));
    assert!(!config.send.require_fee_confirmation);
    assert_eq!(config.poller.interval().as_millis(), 250);
    assert_eq!(config.logging.level, LogLevel::Debug);
    assert!(config.logging.json_format);
    assert!(config.logging.include_timestamps);
    Ok(())
}

#[test]
fn test_save_and_reload_round_trip() -> Result<()> {
    init_test_environment();
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("config.toml");

    let mut original = Config::default();
    original.fees.pay_tx_fee_sats = 1_234;
    original.wallet.network = "signet".to_string();
    original.save(&path)?;

    let reloaded = Config::load(&path)?;
    assert_eq!(reloaded.fees.pay_tx_fee_sats, 1_234);
    assert_eq!(reloaded.network()?, Network::Signet);
    Ok(())
}

#[test]
fn test_invalid_config_is_rejected() {
    init_test_environment();
    let (_dir, path) = setup_test_config("[fees]\nfee_rate_sat_vb = -1.0\n");

    let config = Config::load(&path).expect("syntactically valid config");
    assert!(config.validate().is_err());

    let (_dir, path) = setup_test_config("[fees\npay_tx_fee_sats = 1");
    assert!(Config::load(&path).is_err());
}

#[test]
fn test_missing_file_reports_error() {
    init_test_environment();
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let err = Config::load(&temp_dir.path().join("absent.toml")).unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));
}
