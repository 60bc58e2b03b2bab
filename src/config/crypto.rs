//! Encryption at rest for the configuration file.
//!
//! The key is derived deterministically from the machine host name, so the
//! ciphertext is intentionally non-portable: copying the file to another
//! machine yields a MAC failure, not a readable config. Envelope layout is
//! `nonce(12) || ciphertext || blake3_tag(32)`, with the tag keyed
//! separately from the cipher key and computed over nonce + ciphertext.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use sha2::{Digest, Sha256};
use sysinfo::System;

use super::ConfigError;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 32;
const MAC_CONTEXT: &str = "lansentinel 2025 config mac";

/// Derive the machine-bound cipher key: SHA-256 over a fixed seed string
/// embedding the host name.
pub fn machine_key() -> [u8; 32] {
    let host = System::host_name().unwrap_or_else(|| "DEFAULT_MACHINE".to_string());
    let seed = format!("LANSENTINEL::{}::CONFIG", host);
    Sha256::digest(seed.as_bytes()).into()
}

fn mac_key(key: &[u8; 32]) -> [u8; 32] {
    blake3::derive_key(MAC_CONTEXT, key)
}

/// Encrypt and authenticate `plaintext`.
pub fn seal(key: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
    let nonce: [u8; NONCE_LEN] = rand::random();

    let mut body = plaintext.to_vec();
    let mut cipher = ChaCha20::new(key.into(), &nonce.into());
    cipher.apply_keystream(&mut body);

    let mut blob = Vec::with_capacity(NONCE_LEN + body.len() + TAG_LEN);
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&body);

    let tag = blake3::keyed_hash(&mac_key(key), &blob);
    blob.extend_from_slice(tag.as_bytes());
    blob
}

/// Verify and decrypt a sealed blob. Any truncation, bit flip, or wrong
/// key fails before a single byte is interpreted as configuration.
pub fn open_sealed(key: &[u8; 32], blob: &[u8]) -> Result<Vec<u8>, ConfigError> {
    if blob.len() < NONCE_LEN + TAG_LEN {
        return Err(ConfigError::Crypto("sealed blob too short".to_string()));
    }

    let (signed, tag_bytes) = blob.split_at(blob.len() - TAG_LEN);
    let tag: [u8; TAG_LEN] = tag_bytes.try_into().expect("tag is 32 bytes");
    let expected = blake3::keyed_hash(&mac_key(key), signed);
    // Hash::eq against a byte array is constant-time.
    if expected != blake3::Hash::from_bytes(tag) {
        return Err(ConfigError::Crypto(
            "authentication tag mismatch".to_string(),
        ));
    }

    let (nonce, ciphertext) = signed.split_at(NONCE_LEN);
    let nonce: [u8; NONCE_LEN] = nonce.try_into().expect("nonce is 12 bytes");

    let mut plaintext = ciphertext.to_vec();
    let mut cipher = ChaCha20::new(key.into(), &nonce.into());
    cipher.apply_keystream(&mut plaintext);
    Ok(plaintext)
}
