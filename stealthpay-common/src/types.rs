//! Common data types for the StealthPay send pipeline
//!
//! These types represent the shared data structures passed between the
//! presentation layer and the send pipeline. They are designed to be
//! serializable and to NOT contain sensitive cryptographic material, with the
//! exception of [`SensitiveBytes`], which wipes itself on drop.
//!
//! # Security Boundaries
//!
//! These types are designed to be safely passed across security boundaries:
//! - Between UI and wallet logic
//! - Between the send pipeline and its wallet collaborators
//!
//! IMPORTANT: Apart from `SensitiveBytes`, these types MUST NOT contain
//! private keys, shared secrets or other sensitive material.

use bitcoin::{Amount, OutPoint, SignedAmount};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;
use zeroize::Zeroize;

// Constants for send-pipeline limits

/// Maximum raw length of a narration, in bytes
pub const MAX_NARRATION_BYTES: usize = 24;

/// Maximum length of an encrypted narration, in bytes
pub const MAX_ENCRYPTED_NARRATION_BYTES: usize = 48;

/// Addresses longer than this many characters are tried as stealth addresses first
pub const STEALTH_ADDRESS_LENGTH_THRESHOLD: usize = 75;

/// Descriptor tag carried by the first plain narration output
pub const NARRATION_TAG: [u8; 2] = *b"np";

/// Constant for satoshis per coin
pub const SATS_PER_COIN: u64 = 100_000_000;

/// Upper bound for any single amount handled by the pipeline, in satoshis
pub const MAX_MONEY: u64 = 21_000_000 * SATS_PER_COIN;

/// Binary data that contains secrets and must be zeroed when dropped
///
/// # Security
///
/// Shared secrets and ephemeral keys pass through this type so that they are
/// wiped from memory as soon as the owning value goes out of scope.
///
/// # Examples
///
/// ```
/// use stealthpay_common::types::SensitiveBytes;
///
/// let shared_secret = SensitiveBytes::new(vec![0x12, 0x34, 0x56, 0x78]);
/// assert_eq!(shared_secret.len(), 4);
/// // shared_secret is automatically zeroed when it goes out of scope
/// ```
#[derive(Zeroize)]
pub struct SensitiveBytes {
    inner: Vec<u8>,
}

impl SensitiveBytes {
    /// Create a new SensitiveBytes
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            inner: bytes.into(),
        }
    }

    /// Get a reference to the inner bytes
    ///
    /// # Security
    ///
    /// Only use the returned slice transiently and never log it.
    pub fn as_slice(&self) -> &[u8] {
        &self.inner
    }

    /// Expose the secret value (alias for as_slice)
    pub fn expose_secret(&self) -> &[u8] {
        self.as_slice()
    }

    /// Get the length of the byte array
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Check if the byte array is empty
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Clone for SensitiveBytes {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl fmt::Debug for SensitiveBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SensitiveBytes([REDACTED], length={})", self.len())
    }
}

impl PartialEq for SensitiveBytes {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}
impl Eq for SensitiveBytes {}

impl From<Vec<u8>> for SensitiveBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<&[u8]> for SensitiveBytes {
    fn from(bytes: &[u8]) -> Self {
        Self::new(bytes.to_vec())
    }
}

impl fmt::Display for SensitiveBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Drop for SensitiveBytes {
    fn drop(&mut self) {
        self.inner.zeroize();
    }
}

/// How the presentation layer classified a recipient address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AddressKind {
    /// Conventional pay-to-address destination
    #[default]
    Standard,
    /// Stealth address (scan key + spend key)
    Stealth,
}

impl fmt::Display for AddressKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressKind::Standard => write!(f, "Standard"),
            AddressKind::Stealth => write!(f, "Stealth"),
        }
    }
}

/// A single payment destination in a send request
///
/// Recipients are immutable once submitted to the pipeline. The amount is
/// signed because it comes straight from user input; the pipeline rejects
/// anything that is not strictly positive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    /// Encoded destination (standard or stealth address)
    pub address: String,
    /// Amount to pay, in satoshis
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub amount: SignedAmount,
    /// Optional note attached to the payment (at most 24 raw bytes)
    pub narration: String,
    /// Address-book label to record for this destination after commit
    pub label: String,
    /// Address classification chosen by the caller
    pub kind: AddressKind,
}

impl Recipient {
    /// Create a standard recipient without narration or label
    pub fn new(address: impl Into<String>, amount: SignedAmount) -> Self {
        Self {
            address: address.into(),
            amount,
            narration: String::new(),
            label: String::new(),
            kind: AddressKind::Standard,
        }
    }

    /// Create a stealth recipient without narration or label
    pub fn stealth(address: impl Into<String>, amount: SignedAmount) -> Self {
        Self {
            kind: AddressKind::Stealth,
            ..Self::new(address, amount)
        }
    }

    /// Attach a narration
    pub fn with_narration(mut self, narration: impl Into<String>) -> Self {
        self.narration = narration.into();
        self
    }

    /// Attach an address-book label
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Whether a narration was supplied
    pub fn has_narration(&self) -> bool {
        !self.narration.is_empty()
    }
}

/// Manual coin selection chosen by the user
///
/// When at least one outpoint is selected, only the selected coins may fund
/// the transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoinControl {
    selected: BTreeSet<OutPoint>,
}

impl CoinControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(&mut self, outpoint: OutPoint) {
        self.selected.insert(outpoint);
    }

    pub fn unselect(&mut self, outpoint: &OutPoint) {
        self.selected.remove(outpoint);
    }

    pub fn is_selected(&self, outpoint: &OutPoint) -> bool {
        self.selected.contains(outpoint)
    }

    pub fn has_selected(&self) -> bool {
        !self.selected.is_empty()
    }

    /// Whether a coin may be spent under this coin control
    pub fn allows(&self, outpoint: &OutPoint) -> bool {
        !self.has_selected() || self.is_selected(outpoint)
    }

    pub fn selected(&self) -> impl Iterator<Item = &OutPoint> {
        self.selected.iter()
    }
}

/// Balances cached for display purposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    /// Confirmed, spendable balance
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub spendable: Amount,
    /// Balance from transactions that are not yet confirmed
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub unconfirmed: Amount,
    /// Balance from outputs that have not matured yet
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub immature: Amount,
}

impl Default for BalanceSnapshot {
    fn default() -> Self {
        Self {
            spendable: Amount::ZERO,
            unconfirmed: Amount::ZERO,
            immature: Amount::ZERO,
        }
    }
}

/// Kind of change reported for a wallet record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeType {
    New,
    Updated,
    Deleted,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeType::New => write!(f, "New"),
            ChangeType::Updated => write!(f, "Updated"),
            ChangeType::Deleted => write!(f, "Deleted"),
        }
    }
}

/// Terminal failure of a send request
///
/// Exactly one outcome is produced per pipeline invocation: either the
/// committed transaction id or one of these variants.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendError {
    #[error("The recipient address is not valid")]
    InvalidAddress,

    #[error("The amount to pay must be larger than 0")]
    InvalidAmount,

    #[error("Duplicate address found, can only send to each address once per send operation")]
    DuplicateAddress,

    #[error("The amount exceeds your balance")]
    AmountExceedsBalance,

    #[error("The total exceeds your balance when the {0} transaction fee is included")]
    AmountWithFeeExceedsBalance(
        #[serde(with = "bitcoin::amount::serde::as_sat")] Amount,
    ),

    #[error("Narration is too long")]
    NarrationTooLong,

    #[error("Transaction creation failed")]
    TransactionCreationFailed,

    #[error("The transaction was rejected while committing it to the wallet")]
    TransactionCommitFailed,

    #[error("Send aborted")]
    Aborted,
}

impl SendError {
    /// Whether the caller may retry immediately after correcting its input
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            SendError::InvalidAddress
                | SendError::InvalidAmount
                | SendError::DuplicateAddress
                | SendError::NarrationTooLong
        )
    }

    /// The fee the caller must account for, when the failure carries one
    pub fn required_fee(&self) -> Option<Amount> {
        match self {
            SendError::AmountWithFeeExceedsBalance(fee) => Some(*fee),
            _ => None,
        }
    }
}

/// Outcome of one send pipeline invocation
pub type SendResult = Result<bitcoin::Txid, SendError>;
