//! Signature verification backends for C3.
//!
//! Adapted from the upstream crate's single-key, compile-time-selected
//! verifier: that version picks exactly one curve via a Cargo feature and
//! imports one embedded key. Here the curve is chosen per-key by
//! [`crate::keystore::KeyType`] (so a table can mix NIST P-256 and
//! secp256k1 entries in the same binary) and the key bytes come from a
//! [`crate::keystore::KeySlot`] rather than a literal array.

use core::convert::TryFrom;

use crate::error::{Result, WolfBootError};
use crate::keystore::KeyType;

#[cfg(feature = "secp256k1")]
use k256::ecdsa::{signature::Verifier, Signature as K256Signature, VerifyingKey as K256VerifyingKey};
#[cfg(feature = "nistp256")]
use p256::ecdsa::{signature::Verifier, Signature as P256Signature, VerifyingKey as P256VerifyingKey};

/// Verifies `signature` over `message` using the raw, uncompressed
/// public-key encoding in `pubkey`, per `key_type`.
///
/// `message` is the exact bytes the image hash TLV covers - the digest is
/// computed inside the verifying-key backend, not by the caller, since
/// ECDSA signature verification needs the message, not a pre-hashed value,
/// for some backends and a pre-hashed one for others.
pub fn verify(key_type: KeyType, pubkey: &[u8], message: &[u8], signature: &[u8]) -> Result<bool> {
    match key_type {
        KeyType::NistP256 => verify_nistp256(pubkey, message, signature),
        KeyType::Secp256k1 => verify_secp256k1(pubkey, message, signature),
        KeyType::Ed25519 => Err(WolfBootError::CryptoError),
    }
}

#[cfg(feature = "nistp256")]
fn verify_nistp256(pubkey: &[u8], message: &[u8], signature: &[u8]) -> Result<bool> {
    let vk = P256VerifyingKey::from_sec1_bytes(pubkey).map_err(|_| WolfBootError::CryptoError)?;
    let sig = P256Signature::try_from(signature).map_err(|_| WolfBootError::BadSignature)?;
    Ok(vk.verify(message, &sig).is_ok())
}

#[cfg(not(feature = "nistp256"))]
fn verify_nistp256(_pubkey: &[u8], _message: &[u8], _signature: &[u8]) -> Result<bool> {
    Err(WolfBootError::CryptoError)
}

#[cfg(feature = "secp256k1")]
fn verify_secp256k1(pubkey: &[u8], message: &[u8], signature: &[u8]) -> Result<bool> {
    let vk = K256VerifyingKey::from_sec1_bytes(pubkey).map_err(|_| WolfBootError::CryptoError)?;
    let sig = K256Signature::try_from(signature).map_err(|_| WolfBootError::BadSignature)?;
    Ok(vk.verify(message, &sig).is_ok())
}

#[cfg(not(feature = "secp256k1"))]
fn verify_secp256k1(_pubkey: &[u8], _message: &[u8], _signature: &[u8]) -> Result<bool> {
    Err(WolfBootError::CryptoError)
}

// Exercised end-to-end by crate::image's tests, which sign a fixture image
// with a key generated from a fixed seed and verify it through this path.
