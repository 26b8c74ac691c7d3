//! Wallet collaborator interfaces
//!
//! The send pipeline never stores coins or keys itself. Everything it needs
//! from the wallet is expressed by the traits below; [`WalletBackend`] is
//! implemented automatically for any type that provides all of them.

use bitcoin::{Amount, Network, OutPoint, PublicKey, ScriptBuf, Txid};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use stealthpay_common::math::FeePolicy;
use stealthpay_common::types::{BalanceSnapshot, ChangeType, CoinControl, SendError};

use crate::tx_builder::{CandidateTransaction, OutputPlan};

/// A spendable output owned by the wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub outpoint: OutPoint,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub value: Amount,
    pub script: ScriptBuf,
    pub confirmations: u32,
    pub is_change: bool,
}

/// Which coins a caller may see
#[derive(Debug, Clone, Copy)]
pub struct CoinFilter<'a> {
    /// Skip coins without at least one confirmation
    pub only_confirmed: bool,
    /// Restrict to manually selected coins
    pub coin_control: Option<&'a CoinControl>,
}

impl<'a> CoinFilter<'a> {
    /// Confirmed coins, optionally restricted by coin control
    pub fn spendable(coin_control: Option<&'a CoinControl>) -> Self {
        Self {
            only_confirmed: true,
            coin_control,
        }
    }

    /// Every coin the wallet holds, confirmed or not
    pub fn all() -> Self {
        Self {
            only_confirmed: false,
            coin_control: None,
        }
    }

    pub fn accepts(&self, coin: &Coin) -> bool {
        if self.only_confirmed && coin.confirmations == 0 {
            return false;
        }
        self.coin_control
            .map_or(true, |control| control.allows(&coin.outpoint))
    }
}

/// A key taken from the key pool for the change output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedKey {
    pub index: u32,
    pub pubkey: PublicKey,
}

impl ReservedKey {
    pub fn script_pubkey(&self) -> ScriptBuf {
        ScriptBuf::new_p2pkh(&self.pubkey.pubkey_hash())
    }

    pub fn address(&self, network: Network) -> bitcoin::Address {
        bitcoin::Address::p2pkh(&self.pubkey, network)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyPoolError {
    #[error("Key pool is exhausted")]
    Exhausted,
    #[error("Key pool is locked")]
    Locked,
}

/// Why the wallet could not create a transaction
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CreateTxError {
    /// Not enough funds for the outputs plus `required_fee`
    #[error("Insufficient funds, {required_fee} fee required")]
    InsufficientFunds { required_fee: Amount },
    #[error("No outputs to pay")]
    NoOutputs,
    #[error("Change position {0} splits an output group")]
    InvalidChangePosition(usize),
    #[error("Transaction outputs do not match the requested outputs")]
    OutputMismatch,
    #[error("Transaction creation failed: {0}")]
    Other(String),
}

impl CreateTxError {
    pub fn required_fee(&self) -> Option<Amount> {
        match self {
            CreateTxError::InsufficientFunds { required_fee } => Some(*required_fee),
            _ => None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommitError {
    #[error("Transaction rejected: {0}")]
    Rejected(String),
    #[error("Transaction spends coins that are no longer available")]
    CoinsUnavailable,
}

impl From<KeyPoolError> for SendError {
    fn from(_: KeyPoolError) -> Self {
        SendError::TransactionCreationFailed
    }
}

impl From<CommitError> for SendError {
    fn from(_: CommitError) -> Self {
        SendError::TransactionCommitFailed
    }
}

/// Spendable coin listing
pub trait CoinSource {
    fn list_spendable_coins(&self, filter: &CoinFilter<'_>) -> Vec<Coin>;

    /// The coin spent by the first input of the transaction that created
    /// `coin`, if the wallet still knows it
    fn funding_coin(&self, _coin: &Coin) -> Option<Coin> {
        None
    }
}

/// Change-key reservation
///
/// A reserved key is either kept (after a successful commit) or returned to
/// the pool; [`ChangeKeyGuard`](crate::session::ChangeKeyGuard) makes sure one
/// of the two always happens.
pub trait KeyPool {
    fn reserve_change_key(&mut self) -> Result<ReservedKey, KeyPoolError>;
    fn return_key(&mut self, key: &ReservedKey);
    fn keep_key(&mut self, key: &ReservedKey);
}

/// Input selection, change and fee computation
pub trait TransactionFactory {
    /// Fund `plan`, placing change (if any) at a legal group boundary
    fn create_transaction(
        &mut self,
        plan: &OutputPlan,
        change_key: &ReservedKey,
        fee_policy: &FeePolicy,
        coin_control: Option<&CoinControl>,
    ) -> Result<CandidateTransaction, CreateTxError>;
}

/// Signing, recording and broadcasting
pub trait TransactionCommitter {
    fn commit_transaction(
        &mut self,
        tx: &CandidateTransaction,
        change_key: &ReservedKey,
    ) -> Result<Txid, CommitError>;
}

/// Address labels
pub trait AddressBookStore {
    fn address_label(&self, address: &str) -> Option<String>;
    fn is_mine(&self, address: &str) -> bool;
    fn set_address_label(&mut self, address: &str, label: &str) -> Option<ChangeType>;
    fn update_stealth_label(&mut self, address: &str, label: &str) -> Option<ChangeType>;
}

/// Balances for display
pub trait BalanceSource {
    fn balances(&self) -> BalanceSnapshot;
    fn transaction_count(&self) -> usize;
}

/// Wallet encryption state
///
/// Unlocking needs a passphrase and is left to the backend; callers only
/// ever ask whether the wallet is locked and lock it again.
pub trait WalletLock {
    fn is_locked(&self) -> bool;
    fn lock(&mut self);
}

/// Chain state
pub trait ChainView {
    fn best_height(&self) -> u32;
}

/// Everything the send pipeline needs from the wallet
pub trait WalletBackend:
    CoinSource + KeyPool + TransactionFactory + TransactionCommitter + AddressBookStore + BalanceSource
{
}

impl<T> WalletBackend for T where
    T: CoinSource
        + KeyPool
        + TransactionFactory
        + TransactionCommitter
        + AddressBookStore
        + BalanceSource
{
}
