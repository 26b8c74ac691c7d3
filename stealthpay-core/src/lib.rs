//! StealthPay Core Library
//!
//! The security-sensitive half of the StealthPay wallet: it turns a list of
//! recipients into a committed transaction.
//!
//! # Modules
//!
//! - `address`: destination classification and validation
//! - `stealth`: stealth address encoding and one-time key agreement
//! - `narration`: narration encryption for stealth payments
//! - `script`: payment and data-carrier scripts
//! - `coin_selector`: balance sufficiency checks and coin grouping
//! - `tx_builder`: output planning and narration bookkeeping
//! - `wallet`: traits implemented by the wallet backend
//! - `session`: wallet/chain locking, unlocking and change-key reservation
//! - `confirm`: fee confirmation authorities
//! - `pipeline`: the send pipeline
//! - `poller`: periodic balance refresh
//! - `memory_wallet`: in-memory backend used by tests and demos
//!
//! # Security Considerations
//!
//! - Ephemeral and shared secrets never leave the builder and are wiped on drop
//! - Public keys are logged only at debug level
//! - The wallet is only mutated through a write session that holds both locks

pub mod address;
pub mod coin_selector;
pub mod confirm;
pub mod memory_wallet;
pub mod narration;
pub mod pipeline;
pub mod poller;
pub mod script;
pub mod session;
pub mod stealth;
pub mod tx_builder;
pub mod wallet;

use bitcoin::secp256k1::{All, Secp256k1};
use once_cell::sync::Lazy;

/// Shared secp256k1 context
pub(crate) static SECP: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

pub use address::{resolve_destination, validate_address, Destination};
pub use coin_selector::CoinGroups;
pub use confirm::{
    AlwaysDecline, AutoApprove, ChannelFeeConfirmer, FeeConfirmer, FeeRequest, ThresholdFeeConfirmer,
};
pub use memory_wallet::{ChangePlacement, MemoryChain, MemoryWallet};
pub use pipeline::{validate_recipients, SendPipeline, SendRequest, SendStage};
pub use poller::{BalancePoller, PollOutcome, PollerHandle};
pub use session::{ChangeKeyGuard, UnlockContext, WalletContext, WalletWriteSession};
pub use stealth::{EphemeralKeyPair, OsSecretSource, SecretSource, StealthAddress};
pub use tx_builder::{CandidateTransaction, OutputPlan, TransactionBuilder};
pub use wallet::{Coin, CoinFilter, ReservedKey, WalletBackend, WalletLock};

pub use stealthpay_common::types::{Recipient, SendError, SendResult};
