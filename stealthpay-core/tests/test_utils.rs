#![allow(dead_code)]

use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::{Address, Amount, Network, SignedAmount};
use std::sync::{Arc, Once};

use stealthpay_common::logging::{self, LogConfig, LogLevel};
use stealthpay_common::math::FeePolicy;
use stealthpay_common::types::Recipient;
use stealthpay_core::stealth::FixedSecretSource;
use stealthpay_core::{AutoApprove, FeeConfirmer, MemoryChain, MemoryWallet, SendPipeline, StealthAddress, WalletContext};

static GLOBAL_TEST_INIT: Once = Once::new();

pub const NETWORK: Network = Network::Testnet;

/// Flat fee used by most pipeline tests
pub const FLAT_FEE: u64 = 10;

pub type TestContext = Arc<WalletContext<MemoryChain, MemoryWallet>>;

pub fn init_test_environment() {
    GLOBAL_TEST_INIT.call_once(|| {
        let config = LogConfig {
            level: LogLevel::Error,
            log_file: None,
            include_timestamps: false,
            include_source_location: false,
            json_format: false,
        };
        let _ = logging::init(&config);
    });
}

pub fn secret(byte: u8) -> SecretKey {
    SecretKey::from_slice(&[byte; 32]).unwrap()
}

pub fn pubkey(secret: &SecretKey) -> PublicKey {
    PublicKey::from_secret_key(&Secp256k1::new(), secret)
}

/// A standard testnet address derived from `byte`
pub fn standard_address(byte: u8) -> String {
    let key = bitcoin::PublicKey::new(pubkey(&secret(byte)));
    Address::p2pkh(&key, NETWORK).to_string()
}

/// Scan and spend secrets of a stealth receiver
pub struct StealthReceiver {
    pub scan_secret: SecretKey,
    pub spend_secret: SecretKey,
}

impl StealthReceiver {
    pub fn new(scan: u8, spend: u8) -> Self {
        Self {
            scan_secret: secret(scan),
            spend_secret: secret(spend),
        }
    }

    pub fn address(&self) -> StealthAddress {
        StealthAddress::new(pubkey(&self.scan_secret), pubkey(&self.spend_secret))
    }

    pub fn encoded(&self) -> String {
        self.address().encode(NETWORK)
    }
}

pub fn pay(address: &str, sats: i64) -> Recipient {
    Recipient::new(address, SignedAmount::from_sat(sats))
}

pub fn pay_stealth(address: &str, sats: i64) -> Recipient {
    Recipient::stealth(address, SignedAmount::from_sat(sats))
}

/// A context whose wallet holds one confirmed coin per value
pub fn funded_context(values: &[u64]) -> TestContext {
    let mut wallet = MemoryWallet::new(NETWORK);
    for &value in values {
        wallet.add_coin(Amount::from_sat(value), 1);
    }
    Arc::new(WalletContext::new(MemoryChain::new(100), wallet, NETWORK))
}

/// A pipeline with a flat fee and reproducible ephemeral secrets
pub fn pipeline_with(
    context: &TestContext,
    confirmer: impl FeeConfirmer + Send + 'static,
) -> SendPipeline<MemoryChain, MemoryWallet> {
    let secrets = (0x40..0x60).map(secret).collect();
    SendPipeline::new(
        Arc::clone(context),
        FeePolicy::flat(Amount::from_sat(FLAT_FEE)),
        confirmer,
    )
    .with_secret_source(FixedSecretSource::new(secrets))
}

pub fn pipeline(context: &TestContext) -> SendPipeline<MemoryChain, MemoryWallet> {
    pipeline_with(context, AutoApprove)
}
