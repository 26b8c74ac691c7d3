//! Narration encryption for stealth payments
//!
//! A narration is a short note (at most 24 bytes) attached to a payment.
//! For stealth payments it is encrypted with AES-256-GCM under the shared
//! secret of the key agreement, so only the receiver can read it. The nonce
//! is the first 12 bytes of `SHA256(ephemeral_pubkey)`; every ephemeral key
//! encrypts a single message, so the nonce is never reused under one key.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use bitcoin::secp256k1::PublicKey;
use sha2::{Digest, Sha256};
use thiserror::Error;

use stealthpay_common::types::{SendError, MAX_ENCRYPTED_NARRATION_BYTES, MAX_NARRATION_BYTES};

const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NarrationError {
    #[error("Narration is {0} bytes, at most {max} are allowed", max = MAX_NARRATION_BYTES)]
    TooLong(usize),
    #[error("Encrypted narration is {0} bytes, at most {max} are allowed", max = MAX_ENCRYPTED_NARRATION_BYTES)]
    CiphertextTooLong(usize),
    #[error("Narration key must be 32 bytes")]
    InvalidKey,
    #[error("Narration encryption failed")]
    Encryption,
    #[error("Narration decryption failed")]
    Decryption,
}

impl From<NarrationError> for SendError {
    fn from(err: NarrationError) -> Self {
        match err {
            NarrationError::TooLong(_) => SendError::NarrationTooLong,
            _ => SendError::Aborted,
        }
    }
}

/// Reject narrations longer than the raw limit
pub fn check_length(narration: &str) -> Result<(), NarrationError> {
    if narration.len() > MAX_NARRATION_BYTES {
        return Err(NarrationError::TooLong(narration.len()));
    }
    Ok(())
}

fn cipher_and_nonce(
    shared_secret: &[u8],
    ephemeral_pubkey: &PublicKey,
) -> Result<(Aes256Gcm, [u8; NONCE_SIZE]), NarrationError> {
    if shared_secret.len() != KEY_SIZE {
        return Err(NarrationError::InvalidKey);
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(shared_secret));

    let digest = Sha256::digest(ephemeral_pubkey.serialize());
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&digest[..NONCE_SIZE]);

    Ok((cipher, nonce))
}

/// Encrypt a narration for the holder of `shared_secret`
pub fn encrypt(
    narration: &str,
    shared_secret: &[u8],
    ephemeral_pubkey: &PublicKey,
) -> Result<Vec<u8>, NarrationError> {
    check_length(narration)?;
    let (cipher, nonce) = cipher_and_nonce(shared_secret, ephemeral_pubkey)?;

    let payload = Payload {
        msg: narration.as_bytes(),
        aad: &[],
    };
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), payload)
        .map_err(|_| NarrationError::Encryption)?;

    if ciphertext.len() > MAX_ENCRYPTED_NARRATION_BYTES {
        return Err(NarrationError::CiphertextTooLong(ciphertext.len()));
    }
    Ok(ciphertext)
}

/// Decrypt a narration published next to `ephemeral_pubkey`
pub fn decrypt(
    ciphertext: &[u8],
    shared_secret: &[u8],
    ephemeral_pubkey: &PublicKey,
) -> Result<String, NarrationError> {
    let (cipher, nonce) = cipher_and_nonce(shared_secret, ephemeral_pubkey)?;

    let payload = Payload {
        msg: ciphertext,
        aad: &[],
    };
    let plain = cipher
        .decrypt(Nonce::from_slice(&nonce), payload)
        .map_err(|_| NarrationError::Decryption)?;

    String::from_utf8(plain).map_err(|_| NarrationError::Decryption)
}
