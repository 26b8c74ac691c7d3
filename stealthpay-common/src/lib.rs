//! StealthPay Common Library
//!
//! This crate provides the shared types and ambient infrastructure of the
//! StealthPay send pipeline.
//!
//! # Modules
//!
//! - `types`: Core domain types (recipients, send outcomes, balances)
//! - `error`: Infrastructure error type with context
//! - `math`: Fee policy and transaction size estimation
//! - `logging`: Security-aware logging infrastructure
//! - `config`: Configuration management
//! - `events`: Wallet change notifications
//! - `address_book`: Address labels recorded after payments
//!
//! # Security Considerations
//!
//! - Secrets only travel in zeroizing containers (`SensitiveBytes`)
//! - Logged values are sanitized
//! - Amounts are typed (`bitcoin::Amount`) rather than raw integers

/// Core domain types for the send pipeline
pub mod types;

/// Error handling for infrastructure code
pub mod error;

/// Fee policy and size estimation
pub mod math;

/// Secure logging functionality
pub mod logging;

/// Configuration management
pub mod config;

/// Wallet event bus
pub mod events;

/// Address book functionality
pub mod address_book;

pub use address_book::{AddressBook, AddressEntry};
pub use config::Config;
pub use error::{ErrorContext, StealthPayError, StealthPayResult};
pub use events::{WalletEvent, WalletEventBus};
pub use math::{estimate_tx_size, FeePolicy};

// Re-export important Bitcoin and BDK types
pub use bdk::FeeRate;
pub use bitcoin::{Amount, Network, OutPoint, SignedAmount, Txid};

/// Re-export common types for convenience
pub use types::{
    AddressKind, BalanceSnapshot, ChangeType, CoinControl, Recipient, SendError, SendResult,
    SensitiveBytes, MAX_ENCRYPTED_NARRATION_BYTES, MAX_MONEY, MAX_NARRATION_BYTES,
};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

use std::sync::OnceLock;

static INIT_RESULT: OnceLock<Result<(), String>> = OnceLock::new();

/// Library initialization
///
/// Sets up logging with the default configuration. Safe to call multiple
/// times; every call returns the result of the first initialization.
pub fn init() -> Result<(), String> {
    INIT_RESULT
        .get_or_init(|| {
            logging::init(&logging::LogConfig::default())
                .map_err(|e| format!("Failed to initialize logging: {}", e))
        })
        .clone()
}
