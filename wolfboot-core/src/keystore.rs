//! C5 - key store.
//!
//! Public keys the verifier is allowed to trust live in one of two places:
//! a table baked into the bootloader binary at build time, or a table
//! written into one-time-programmable flash by a provisioning step. Both
//! shapes are exposed through the same [`KeyStore`] trait so
//! [`crate::image`] never has to know which one it's talking to.
//!
//! Grounded on `import_pubkey`/`PubkeyTypes` in the upstream crate's
//! `crypto/signatures.rs`, which only ever imports one hardcoded key. This
//! generalizes that single slot into an indexed table with a role mask,
//! matching the `keystore.c`/`keystore.h` arrangement (`KEYSTORE_SLOTS`,
//! `keystore_get_pubkey`, `keystore_get_mask`) in the original
//! implementation.

use crate::error::{Result, WolfBootError};
use crate::header::img_type;

/// Which curve/algorithm a stored key is for; mirrors the auth bits of
/// [`crate::header::TlvType::ImgType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    NistP256,
    Secp256k1,
    Ed25519,
}

impl KeyType {
    fn auth_bits(self) -> u16 {
        match self {
            KeyType::NistP256 => img_type::AUTH_NISTP256,
            KeyType::Secp256k1 => img_type::AUTH_ECC256,
            KeyType::Ed25519 => img_type::AUTH_ED25519,
        }
    }
}

/// One entry: a raw public-key encoding, its algorithm, and the bitmask of
/// partition roles it's permitted to sign for (`1 << role_id`, interpreted
/// by the caller - `0xFFFF_FFFF` means "any role").
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeySlot<'a> {
    pub buffer: &'a [u8],
    pub key_type: KeyType,
    pub mask: u32,
}

/// Uniform accessor over a key table, whether it's a `&'static` array
/// compiled into the image or a view over an OTP region. Index `i` ranges
/// over `0..num_keys()`.
pub trait KeyStore {
    fn num_keys(&self) -> usize;
    fn slot(&self, i: usize) -> Result<KeySlot<'_>>;
}

/// A key table compiled directly into the bootloader binary, the shape
/// `rbsigner`'s output feeds into. Most targets use this.
pub struct EmbeddedKeyStore<'a> {
    slots: &'a [KeySlot<'a>],
}

impl<'a> EmbeddedKeyStore<'a> {
    pub const fn new(slots: &'a [KeySlot<'a>]) -> Self {
        EmbeddedKeyStore { slots }
    }
}

impl<'a> KeyStore for EmbeddedKeyStore<'a> {
    fn num_keys(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, i: usize) -> Result<KeySlot<'_>> {
        self.slots.get(i).copied().ok_or(WolfBootError::KeyNotFound)
    }
}

/// Fixed record layout for a key provisioned into one-time-programmable
/// flash: `[key_type: 1B][mask: 4B LE][len: 2B LE][key bytes ...]`,
/// repeated `num_keys` times back to back.
pub struct OtpKeyStore<'a> {
    region: &'a [u8],
    num_keys: usize,
}

impl<'a> OtpKeyStore<'a> {
    pub fn new(region: &'a [u8], num_keys: usize) -> Self {
        OtpKeyStore { region, num_keys }
    }

    fn offset_of(&self, i: usize) -> Result<usize> {
        let mut pos = 0usize;
        for idx in 0..i {
            let rec_len = self.record_len_at(pos)?;
            pos += rec_len;
            let _ = idx;
        }
        Ok(pos)
    }

    fn record_len_at(&self, pos: usize) -> Result<usize> {
        if pos + 7 > self.region.len() {
            return Err(WolfBootError::OutOfBounds);
        }
        let key_len = u16::from_le_bytes([self.region[pos + 5], self.region[pos + 6]]) as usize;
        if pos + 7 + key_len > self.region.len() {
            return Err(WolfBootError::OutOfBounds);
        }
        Ok(7 + key_len)
    }
}

impl<'a> KeyStore for OtpKeyStore<'a> {
    fn num_keys(&self) -> usize {
        self.num_keys
    }

    fn slot(&self, i: usize) -> Result<KeySlot<'_>> {
        if i >= self.num_keys {
            return Err(WolfBootError::KeyNotFound);
        }
        let pos = self.offset_of(i)?;
        if pos + 7 > self.region.len() {
            return Err(WolfBootError::OutOfBounds);
        }
        let key_type = match self.region[pos] {
            0 => KeyType::NistP256,
            1 => KeyType::Secp256k1,
            2 => KeyType::Ed25519,
            _ => return Err(WolfBootError::KeyNotFound),
        };
        let mask = u32::from_le_bytes([
            self.region[pos + 1],
            self.region[pos + 2],
            self.region[pos + 3],
            self.region[pos + 4],
        ]);
        let key_len = u16::from_le_bytes([self.region[pos + 5], self.region[pos + 6]]) as usize;
        let start = pos + 7;
        let end = start + key_len;
        if end > self.region.len() {
            return Err(WolfBootError::OutOfBounds);
        }
        Ok(KeySlot {
            buffer: &self.region[start..end],
            key_type,
            mask,
        })
    }
}

/// Finds the first slot whose algorithm matches the image's declared auth
/// type and whose mask permits `role_bit`, per the pubkey-hint TLV if
/// present, otherwise scanning the whole table.
pub fn find_key<'a>(
    store: &'a dyn KeyStore,
    auth_type: u16,
    role_bit: u32,
    hint: Option<&[u8]>,
) -> Result<KeySlot<'a>> {
    for i in 0..store.num_keys() {
        let slot = store.slot(i)?;
        if slot.key_type.auth_bits() != auth_type {
            continue;
        }
        if slot.mask != 0xFFFF_FFFF && slot.mask & role_bit == 0 {
            continue;
        }
        if let Some(h) = hint {
            if slot.buffer.len() >= h.len() && &slot.buffer[..h.len().min(4)] != &h[..h.len().min(4)] {
                continue;
            }
        }
        return Ok(slot);
    }
    Err(WolfBootError::KeyNotFound)
}
