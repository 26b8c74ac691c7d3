//! Destination classification and validation
//!
//! Long strings are tried as stealth addresses first; anything else (or a
//! long string that is not a stealth address) must be a standard address for
//! the configured network.

use bitcoin::address::NetworkUnchecked;
use bitcoin::{Address, Network, ScriptBuf};
use std::str::FromStr;

use stealthpay_common::types::STEALTH_ADDRESS_LENGTH_THRESHOLD;

use crate::stealth::StealthAddress;

/// A validated payment destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Standard(Address),
    Stealth(StealthAddress),
}

impl Destination {
    pub fn is_stealth(&self) -> bool {
        matches!(self, Destination::Stealth(_))
    }

    /// Payment script for standard destinations
    ///
    /// Stealth destinations have no fixed script; a fresh one is derived for
    /// every payment.
    pub fn script_pubkey(&self) -> Option<ScriptBuf> {
        match self {
            Destination::Standard(address) => Some(address.script_pubkey()),
            Destination::Stealth(_) => None,
        }
    }
}

/// Parse and classify a destination string
pub fn resolve_destination(address: &str, network: Network) -> Option<Destination> {
    if address.len() > STEALTH_ADDRESS_LENGTH_THRESHOLD {
        if let Ok(stealth) = StealthAddress::decode(address, network) {
            return Some(Destination::Stealth(stealth));
        }
    }

    Address::<NetworkUnchecked>::from_str(address)
        .ok()?
        .require_network(network)
        .ok()
        .map(Destination::Standard)
}

/// Whether `address` is a valid destination on `network`
pub fn validate_address(address: &str, network: Network) -> bool {
    resolve_destination(address, network).is_some()
}
