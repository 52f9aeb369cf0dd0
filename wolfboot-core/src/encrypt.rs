//! C6 - encryption layer.
//!
//! Makes the external/update-partition flash transparent-at-rest: a
//! firmware payload sits on flash as ciphertext, and the engine works
//! with plaintext only in a caller-owned buffer, for exactly as long as
//! a read or write call needs it.
//!
//! Grounded on `encrypt.c`/`include/encrypt.h` in the original
//! implementation: `crypto_init`/`crypto_set_iv`/`crypto_encrypt`/
//! `crypto_decrypt` dispatching on one of `ENCRYPT_WITH_CHACHA`,
//! `ENCRYPT_WITH_AES128`, `ENCRYPT_WITH_AES256` selected at build time, and
//! `ext_flash_encrypt_write`/`ext_flash_decrypt_read` driving the
//! block-at-a-time keystream by the offset being accessed. Those two take
//! a plaintext/ciphertext buffer directly rather than going through a
//! flash trait, which this module follows instead of wrapping
//! [`FlashDevice`] - CTR keystream application is in place and needs no
//! allocation, which an owning wrapper's `write_at(&[u8])` signature would
//! have forced.

use cipher::{NewCipher, StreamCipher, StreamCipherSeek};

use crate::error::{Result, WolfBootError};
use crate::flash::FlashDevice;

/// Keystream block granularity; offsets are seeked to the nearest multiple
/// of this before applying the cipher, matching the original's
/// page-granularity IV reseek.
pub const BLOCK_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    Aes128Ctr,
    Aes256Ctr,
    ChaCha20,
}

/// Key material plus the base nonce; the keystream position is reseeked on
/// every call from the block-aligned flash offset, so two different
/// offsets under one key+nonce never reuse the same keystream bytes.
#[derive(Clone, Debug, PartialEq)]
pub struct EncryptionKey {
    pub kind: CipherKind,
    pub key: [u8; 32],
    pub nonce: [u8; 12],
}

#[cfg(feature = "encrypt-aes128")]
type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
#[cfg(feature = "encrypt-aes256")]
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

fn seek_for(base_offset: usize) -> u64 {
    (base_offset / BLOCK_SIZE) as u64 * BLOCK_SIZE as u64
}

/// XORs `buf` in place with the keystream for `base_offset` bytes into the
/// partition. Calling this twice with the same key and offset undoes the
/// first call - CTR mode is its own inverse - so this one routine serves
/// both encryption and decryption.
fn apply_keystream(key: &EncryptionKey, base_offset: usize, buf: &mut [u8]) -> Result<()> {
    let seek = seek_for(base_offset);
    match key.kind {
        #[cfg(feature = "encrypt-aes128")]
        CipherKind::Aes128Ctr => {
            let mut c = Aes128Ctr::new(
                aes::cipher::generic_array::GenericArray::from_slice(&key.key[..16]),
                aes::cipher::generic_array::GenericArray::from_slice(&key.nonce[..16]),
            );
            c.seek(seek);
            c.apply_keystream(buf);
            Ok(())
        }
        #[cfg(feature = "encrypt-aes256")]
        CipherKind::Aes256Ctr => {
            let mut c = Aes256Ctr::new(
                aes::cipher::generic_array::GenericArray::from_slice(&key.key[..32]),
                aes::cipher::generic_array::GenericArray::from_slice(&key.nonce[..16]),
            );
            c.seek(seek);
            c.apply_keystream(buf);
            Ok(())
        }
        #[cfg(feature = "encrypt-chacha")]
        CipherKind::ChaCha20 => {
            let mut c = chacha20::ChaCha20::new(
                chacha20::cipher::generic_array::GenericArray::from_slice(&key.key[..32]),
                chacha20::cipher::generic_array::GenericArray::from_slice(&key.nonce),
            );
            c.seek(seek);
            c.apply_keystream(buf);
            Ok(())
        }
        #[allow(unreachable_patterns)]
        _ => Err(WolfBootError::CryptoError),
    }
}

/// Encrypts `plaintext` in place, then writes it to `dev` at `addr`.
/// `base` is the address the key's keystream position 0 corresponds to.
pub fn encrypt_write(
    dev: &mut dyn FlashDevice,
    key: &EncryptionKey,
    base: usize,
    addr: usize,
    plaintext: &mut [u8],
) -> Result<()> {
    let offset = addr.checked_sub(base).ok_or(WolfBootError::OutOfBounds)?;
    apply_keystream(key, offset, plaintext)?;
    dev.write_at(addr, plaintext)
}

/// Reads ciphertext from `dev` at `addr` into `buf`, then decrypts it in
/// place.
pub fn decrypt_read(
    dev: &dyn FlashDevice,
    key: &EncryptionKey,
    base: usize,
    addr: usize,
    buf: &mut [u8],
) -> Result<()> {
    dev.read_at(addr, buf)?;
    let offset = addr.checked_sub(base).ok_or(WolfBootError::OutOfBounds)?;
    apply_keystream(key, offset, buf)
}

/// Holds (or doesn't) the currently provisioned key, mirroring
/// `wolfBoot_crypto_set_iv`/`wolfBoot_enable_fallback_iv`'s notion of a key
/// that can be absent, freshly set, or a disaster-recovery fallback.
pub struct KeySlotState {
    key: Option<EncryptionKey>,
    fallback: bool,
}

impl KeySlotState {
    pub fn empty() -> Self {
        KeySlotState {
            key: None,
            fallback: false,
        }
    }

    pub fn set(&mut self, key: EncryptionKey) {
        self.key = Some(key);
        self.fallback = false;
    }

    /// Arms a recovery path: if the primary key slot was erased by a crash
    /// mid-provision, fall back to treating the partition as plaintext
    /// rather than refusing to boot.
    pub fn enable_fallback(&mut self) {
        self.fallback = true;
    }

    pub fn get(&self) -> Result<Option<&EncryptionKey>> {
        match (&self.key, self.fallback) {
            (Some(k), _) => Ok(Some(k)),
            (None, true) => Ok(None),
            (None, false) => Err(WolfBootError::NoEncryptionKey),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::SimFlash;

    #[cfg(feature = "encrypt-chacha")]
    #[test]
    fn chacha20_round_trips_through_flash() {
        let mut dev = SimFlash::new(0, 0x1000);
        let key = EncryptionKey {
            kind: CipherKind::ChaCha20,
            key: [0x42; 32],
            nonce: [0x11; 12],
        };
        let mut plaintext = b"secret firmware bytes......".to_vec();
        let original = plaintext.clone();
        encrypt_write(&mut dev, &key, 0x100, 0x110, &mut plaintext).unwrap();

        let mut raw = vec![0u8; original.len()];
        dev.read_at(0x110, &mut raw).unwrap();
        assert_ne!(raw, original);

        let mut out = vec![0u8; original.len()];
        decrypt_read(&dev, &key, 0x100, 0x110, &mut out).unwrap();
        assert_eq!(out, original);
    }

    #[test]
    fn fallback_without_a_key_reads_as_plaintext() {
        let mut state = KeySlotState::empty();
        assert_eq!(state.get(), Err(WolfBootError::NoEncryptionKey));
        state.enable_fallback();
        assert_eq!(state.get().unwrap(), None);
    }

    #[test]
    fn setting_a_key_clears_the_fallback_flag() {
        let mut state = KeySlotState::empty();
        state.enable_fallback();
        state.set(EncryptionKey {
            kind: CipherKind::ChaCha20,
            key: [0u8; 32],
            nonce: [0u8; 12],
        });
        assert!(state.get().unwrap().is_some());
    }
}
