//! Stealth addresses and one-time key agreement
//!
//! A stealth address publishes two public keys: a scan key and a spend key.
//! The sender picks a fresh ephemeral secret `e` and computes
//!
//! ```text
//! shared  = SHA256(compressed(e · scan_pubkey))
//! derived = spend_pubkey + shared · G
//! ```
//!
//! The payment goes to the P2PKH address of `derived`; `e · G` is published
//! next to it so that the receiver, holding the scan secret, can recompute
//! `shared` and spend with `spend_secret + shared`.
//!
//! # Security Considerations
//!
//! - Ephemeral and shared secrets are wiped when the key pair is dropped
//! - Secrets are drawn from the operating system CSPRNG in production

use bitcoin::base58;
use bitcoin::secp256k1::{PublicKey, Scalar, SecretKey};
use bitcoin::{Address, Network};
use rand::rngs::OsRng;
use rand::TryRngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;
use zeroize::Zeroizing;

use stealthpay_common::types::{SendError, SensitiveBytes};

use crate::SECP;

/// Version byte of mainnet stealth addresses
pub const STEALTH_VERSION_MAINNET: u8 = 0x28;

/// Version byte of stealth addresses on test networks
pub const STEALTH_VERSION_TESTNET: u8 = 0x2b;

/// Length of the decoded payload (without checksum)
const STEALTH_PAYLOAD_LEN: usize = 1 + 1 + 33 + 1 + 33 + 1 + 1;

/// How often a secret source may draw an out-of-range scalar before giving up
const MAX_SECRET_ATTEMPTS: usize = 8;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StealthError {
    #[error("Malformed stealth address: {0}")]
    InvalidAddress(&'static str),
    #[error("Stealth address belongs to another network")]
    WrongNetwork,
    #[error("Random secret generation failed")]
    Randomness,
    #[error("Shared secret is not a valid scalar")]
    InvalidSharedSecret,
    #[error("Key derivation produced an invalid point")]
    KeyDerivation,
}

impl From<StealthError> for SendError {
    fn from(err: StealthError) -> Self {
        match err {
            StealthError::InvalidAddress(_) | StealthError::WrongNetwork => {
                SendError::InvalidAddress
            }
            _ => SendError::Aborted,
        }
    }
}

/// A decoded stealth address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StealthAddress {
    pub options: u8,
    pub scan_pubkey: PublicKey,
    pub spend_pubkey: PublicKey,
    pub number_signatures: u8,
    pub prefix_bits: u8,
}

impl StealthAddress {
    pub fn new(scan_pubkey: PublicKey, spend_pubkey: PublicKey) -> Self {
        Self {
            options: 0,
            scan_pubkey,
            spend_pubkey,
            number_signatures: 1,
            prefix_bits: 0,
        }
    }

    /// Version byte for a network
    pub fn version_for(network: Network) -> u8 {
        match network {
            Network::Bitcoin => STEALTH_VERSION_MAINNET,
            _ => STEALTH_VERSION_TESTNET,
        }
    }

    /// Base58check encoding for `network`
    pub fn encode(&self, network: Network) -> String {
        let mut payload = Vec::with_capacity(STEALTH_PAYLOAD_LEN);
        payload.push(Self::version_for(network));
        payload.push(self.options);
        payload.extend_from_slice(&self.scan_pubkey.serialize());
        payload.push(1);
        payload.extend_from_slice(&self.spend_pubkey.serialize());
        payload.push(self.number_signatures);
        payload.push(self.prefix_bits);
        base58::encode_check(&payload)
    }

    /// Decode an address and check that it belongs to `network`
    pub fn decode(encoded: &str, network: Network) -> Result<Self, StealthError> {
        let payload = base58::decode_check(encoded)
            .map_err(|_| StealthError::InvalidAddress("bad base58 checksum"))?;

        if payload.len() != STEALTH_PAYLOAD_LEN {
            return Err(StealthError::InvalidAddress("unexpected length"));
        }
        if payload[0] != STEALTH_VERSION_MAINNET && payload[0] != STEALTH_VERSION_TESTNET {
            return Err(StealthError::InvalidAddress("unknown version"));
        }
        if payload[0] != Self::version_for(network) {
            return Err(StealthError::WrongNetwork);
        }

        let scan_pubkey = PublicKey::from_slice(&payload[2..35])
            .map_err(|_| StealthError::InvalidAddress("invalid scan key"))?;
        if payload[35] != 1 {
            return Err(StealthError::InvalidAddress("unsupported spend key count"));
        }
        let spend_pubkey = PublicKey::from_slice(&payload[36..69])
            .map_err(|_| StealthError::InvalidAddress("invalid spend key"))?;
        if payload[70] != 0 {
            return Err(StealthError::InvalidAddress("prefix filters are not supported"));
        }

        Ok(Self {
            options: payload[1],
            scan_pubkey,
            spend_pubkey,
            number_signatures: payload[69],
            prefix_bits: payload[70],
        })
    }
}

/// Source of ephemeral secrets
pub trait SecretSource {
    fn ephemeral_secret(&mut self) -> Result<SecretKey, StealthError>;
}

/// Ephemeral secrets from the operating system CSPRNG
#[derive(Debug, Default, Clone, Copy)]
pub struct OsSecretSource;

impl SecretSource for OsSecretSource {
    fn ephemeral_secret(&mut self) -> Result<SecretKey, StealthError> {
        let mut bytes = Zeroizing::new([0u8; 32]);
        for _ in 0..MAX_SECRET_ATTEMPTS {
            OsRng
                .try_fill_bytes(&mut bytes[..])
                .map_err(|_| StealthError::Randomness)?;
            if let Ok(secret) = SecretKey::from_slice(&bytes[..]) {
                return Ok(secret);
            }
        }
        Err(StealthError::Randomness)
    }
}

/// Hands out a fixed list of secrets, then fails
///
/// Used to make key agreement reproducible.
#[derive(Clone)]
pub struct FixedSecretSource {
    secrets: Vec<SecretKey>,
    next: usize,
}

impl FixedSecretSource {
    pub fn new(secrets: Vec<SecretKey>) -> Self {
        Self { secrets, next: 0 }
    }
}

impl SecretSource for FixedSecretSource {
    fn ephemeral_secret(&mut self) -> Result<SecretKey, StealthError> {
        let secret = self
            .secrets
            .get(self.next)
            .copied()
            .ok_or(StealthError::Randomness)?;
        self.next += 1;
        Ok(secret)
    }
}

/// Result of one key agreement, scoped to a single payment
pub struct EphemeralKeyPair {
    secret: Zeroizing<[u8; 32]>,
    shared_secret: SensitiveBytes,
    derived_pubkey: PublicKey,
    ephemeral_pubkey: PublicKey,
}

impl EphemeralKeyPair {
    /// Run the key agreement with a fresh secret from `source`
    pub fn generate<S>(address: &StealthAddress, source: &mut S) -> Result<Self, StealthError>
    where
        S: SecretSource + ?Sized,
    {
        let secret = source.ephemeral_secret()?;
        Self::from_secret(address, &secret)
    }

    /// Run the key agreement with a caller-supplied ephemeral secret
    pub fn from_secret(address: &StealthAddress, secret: &SecretKey) -> Result<Self, StealthError> {
        let shared = shared_secret(secret, &address.scan_pubkey)?;
        let derived_pubkey = address
            .spend_pubkey
            .add_exp_tweak(&SECP, &Scalar::from(shared))
            .map_err(|_| StealthError::KeyDerivation)?;
        let ephemeral_pubkey = PublicKey::from_secret_key(&SECP, secret);

        log::debug!(
            "Stealth key agreement: derived {} ephemeral {}",
            hex::encode(derived_pubkey.serialize()),
            hex::encode(ephemeral_pubkey.serialize())
        );

        Ok(Self {
            secret: Zeroizing::new(secret.secret_bytes()),
            shared_secret: SensitiveBytes::new(shared.secret_bytes().to_vec()),
            derived_pubkey,
            ephemeral_pubkey,
        })
    }

    /// One-time destination public key
    pub fn derived_pubkey(&self) -> &PublicKey {
        &self.derived_pubkey
    }

    /// Public half of the ephemeral key, published in the data carrier output
    pub fn ephemeral_pubkey(&self) -> &PublicKey {
        &self.ephemeral_pubkey
    }

    /// Shared secret, used as the narration key
    pub fn shared_secret(&self) -> &SensitiveBytes {
        &self.shared_secret
    }

    pub fn ephemeral_secret(&self) -> &[u8; 32] {
        &self.secret
    }

    /// P2PKH address paying the derived key
    pub fn destination(&self, network: Network) -> Address {
        Address::p2pkh(&bitcoin::PublicKey::new(self.derived_pubkey), network)
    }
}

impl fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("secret", &"[REDACTED]")
            .field("shared_secret", &self.shared_secret)
            .field("derived_pubkey", &self.derived_pubkey)
            .field("ephemeral_pubkey", &self.ephemeral_pubkey)
            .finish()
    }
}

/// `SHA256(compressed(secret · point))`, required to be a valid scalar
fn shared_secret(secret: &SecretKey, point: &PublicKey) -> Result<SecretKey, StealthError> {
    let product = point
        .mul_tweak(&SECP, &Scalar::from(*secret))
        .map_err(|_| StealthError::KeyDerivation)?;
    let digest: Zeroizing<[u8; 32]> = Zeroizing::new(Sha256::digest(product.serialize()).into());
    SecretKey::from_slice(&digest[..]).map_err(|_| StealthError::InvalidSharedSecret)
}

/// Receiver side: the shared secret for a published ephemeral key
pub fn recover_shared_secret(
    scan_secret: &SecretKey,
    ephemeral_pubkey: &PublicKey,
) -> Result<SensitiveBytes, StealthError> {
    let shared = shared_secret(scan_secret, ephemeral_pubkey)?;
    Ok(SensitiveBytes::new(shared.secret_bytes().to_vec()))
}

/// Receiver side: the secret key that spends a stealth payment
pub fn recover_spend_secret(
    scan_secret: &SecretKey,
    spend_secret: &SecretKey,
    ephemeral_pubkey: &PublicKey,
) -> Result<SecretKey, StealthError> {
    let shared = shared_secret(scan_secret, ephemeral_pubkey)?;
    spend_secret
        .add_tweak(&Scalar::from(shared))
        .map_err(|_| StealthError::KeyDerivation)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(byte: u8) -> SecretKey {
        SecretKey::from_slice(&[byte; 32]).unwrap()
    }

    fn address() -> StealthAddress {
        StealthAddress::new(
            PublicKey::from_secret_key(&SECP, &secret(1)),
            PublicKey::from_secret_key(&SECP, &secret(2)),
        )
    }

    #[test]
    fn encoding_round_trips_on_both_networks() {
        let addr = address();
        for network in [Network::Bitcoin, Network::Testnet] {
            let encoded = addr.encode(network);
            assert!(encoded.len() > 75);
            assert_eq!(StealthAddress::decode(&encoded, network).unwrap(), addr);
        }
    }

    #[test]
    fn decoding_rejects_other_network() {
        let encoded = address().encode(Network::Testnet);
        assert_eq!(
            StealthAddress::decode(&encoded, Network::Bitcoin),
            Err(StealthError::WrongNetwork)
        );
    }

    #[test]
    fn decoding_rejects_corruption() {
        let mut encoded = address().encode(Network::Bitcoin);
        let last = encoded.pop().unwrap();
        encoded.push(if last == '1' { '2' } else { '1' });
        assert!(StealthAddress::decode(&encoded, Network::Bitcoin).is_err());
    }

    #[test]
    fn same_secret_gives_same_keys() {
        let a = EphemeralKeyPair::from_secret(&address(), &secret(7)).unwrap();
        let b = EphemeralKeyPair::from_secret(&address(), &secret(7)).unwrap();
        assert_eq!(a.derived_pubkey(), b.derived_pubkey());
        assert_eq!(a.ephemeral_pubkey(), b.ephemeral_pubkey());
        assert_eq!(a.shared_secret(), b.shared_secret());

        let c = EphemeralKeyPair::from_secret(&address(), &secret(8)).unwrap();
        assert_ne!(a.derived_pubkey(), c.derived_pubkey());
    }

    #[test]
    fn receiver_recovers_one_time_key() {
        let pair = EphemeralKeyPair::from_secret(&address(), &secret(9)).unwrap();
        let spend = recover_spend_secret(&secret(1), &secret(2), pair.ephemeral_pubkey()).unwrap();
        assert_eq!(&PublicKey::from_secret_key(&SECP, &spend), pair.derived_pubkey());

        let shared = recover_shared_secret(&secret(1), pair.ephemeral_pubkey()).unwrap();
        assert_eq!(&shared, pair.shared_secret());
    }

    #[test]
    fn fixed_source_runs_dry() {
        let mut source = FixedSecretSource::new(vec![secret(3)]);
        assert!(source.ephemeral_secret().is_ok());
        assert_eq!(source.ephemeral_secret(), Err(StealthError::Randomness));
    }

    #[test]
    fn os_source_produces_distinct_secrets() {
        let mut source = OsSecretSource;
        let a = source.ephemeral_secret().unwrap();
        let b = source.ephemeral_secret().unwrap();
        assert_ne!(a.secret_bytes(), b.secret_bytes());
    }
}
