//! Address Book functionality for StealthPay
//!
//! This module stores labels for destination addresses, both standard and
//! stealth. After a payment is committed, the send pipeline records the label
//! the user gave each recipient; every mutation reports what kind of change
//! happened so observers can be notified.
//!
//! # Security Considerations
//!
//! - Address book entries only store public addresses, never private keys
//! - Addresses are validated by the send pipeline before they are recorded
//!
//! # Examples
//!
//! ```
//! use stealthpay_common::address_book::AddressBook;
//! use stealthpay_common::types::ChangeType;
//! use bitcoin::Network;
//!
//! let mut address_book = AddressBook::new(Network::Bitcoin);
//!
//! let change = address_book.set_label("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa", "Satoshi", false);
//! assert_eq!(change, Some(ChangeType::New));
//!
//! // Writing the same label again is not a change
//! let change = address_book.set_label("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa", "Satoshi", false);
//! assert_eq!(change, None);
//! ```

use bitcoin::Network;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{with_io_context, ErrorContext, StealthPayResult};
use crate::types::ChangeType;

/// A single address book entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressEntry {
    /// The encoded destination
    pub address: String,
    /// Human-readable label for this address
    pub label: String,
    /// Whether the address belongs to this wallet
    pub is_mine: bool,
    /// Whether the address is a stealth address
    pub is_stealth: bool,
    /// Timestamp when this entry was created (in seconds since UNIX epoch)
    pub created_at: u64,
    /// Timestamp when this entry was last paid (in seconds since UNIX epoch)
    pub last_used: Option<u64>,
}

impl AddressEntry {
    pub fn new(address: String, label: String, is_mine: bool, is_stealth: bool) -> Self {
        AddressEntry {
            address,
            label,
            is_mine,
            is_stealth,
            created_at: unix_now(),
            last_used: None,
        }
    }

    /// Update the last used timestamp to now
    pub fn mark_as_used(&mut self) {
        self.last_used = Some(unix_now());
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// Address book container, indexed by encoded address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressBook {
    entries: HashMap<String, AddressEntry>,
    network: Network,
}

impl AddressBook {
    /// Create a new empty address book
    pub fn new(network: Network) -> Self {
        AddressBook {
            entries: HashMap::new(),
            network,
        }
    }

    /// Record a label for a standard address
    ///
    /// Returns `Some(ChangeType::New)` when the address was unknown,
    /// `Some(ChangeType::Updated)` when its label changed and `None` when the
    /// entry already carried this label.
    pub fn set_label(&mut self, address: &str, label: &str, is_mine: bool) -> Option<ChangeType> {
        match self.entries.get_mut(address) {
            None => {
                let entry =
                    AddressEntry::new(address.to_string(), label.to_string(), is_mine, false);
                self.entries.insert(address.to_string(), entry);
                Some(ChangeType::New)
            }
            Some(entry) if entry.label != label || entry.is_mine != is_mine => {
                entry.label = label.to_string();
                entry.is_mine = is_mine;
                Some(ChangeType::Updated)
            }
            Some(_) => None,
        }
    }

    /// Record a label for a stealth address
    ///
    /// Only the label is touched on existing entries; the entry is marked as
    /// stealth either way.
    pub fn update_stealth_label(&mut self, address: &str, label: &str) -> Option<ChangeType> {
        match self.entries.get_mut(address) {
            None => {
                let entry = AddressEntry::new(address.to_string(), label.to_string(), false, true);
                self.entries.insert(address.to_string(), entry);
                Some(ChangeType::New)
            }
            Some(entry) if entry.label != label || !entry.is_stealth => {
                entry.label = label.to_string();
                entry.is_stealth = true;
                Some(ChangeType::Updated)
            }
            Some(_) => None,
        }
    }

    /// Label recorded for an address
    pub fn label(&self, address: &str) -> Option<&str> {
        self.entries.get(address).map(|entry| entry.label.as_str())
    }

    pub fn get_entry(&self, address: &str) -> Option<&AddressEntry> {
        self.entries.get(address)
    }

    /// Mark an address as paid just now; unknown addresses are ignored
    pub fn mark_as_used(&mut self, address: &str) -> bool {
        match self.entries.get_mut(address) {
            Some(entry) => {
                entry.mark_as_used();
                true
            }
            None => false,
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &AddressEntry> {
        self.entries.values()
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize the address book to JSON
    pub fn to_json(&self) -> StealthPayResult<String> {
        serde_json::to_string(self).context("Failed to serialize address book")
    }

    /// Deserialize from JSON string
    pub fn from_json(json: &str) -> StealthPayResult<Self> {
        serde_json::from_str(json).context("Failed to deserialize address book")
    }

    /// Write the address book to a JSON file
    pub fn save(&self, path: &Path) -> StealthPayResult<()> {
        let json = self.to_json()?;
        with_io_context(fs::write(path, json), "Failed to write address book")
    }

    /// Read an address book from a JSON file
    pub fn load(path: &Path) -> StealthPayResult<Self> {
        let json = with_io_context(fs::read_to_string(path), "Failed to read address book")?;
        Self::from_json(&json)
    }
}
