//! Shared fixtures for unit tests across [`crate::image`], [`crate::update`]
//! and [`crate::boot`]: a deterministic signing key plus a builder for a
//! fully signed, self-consistent image (header + payload) that
//! `image::verify_image` accepts.
#![cfg(test)]

use p256::ecdsa::{
    signature::{Signature as _, Signer},
    Signature, SigningKey,
};
use sha2::{Digest, Sha256};

use crate::geometry::{IMAGE_HEADER_OFFSET, IMAGE_HEADER_SIZE};
use crate::header::{self, img_type, HDR_PADDING, TlvType};
use crate::keystore::{KeySlot, KeyType};

/// A fixed, arbitrary P-256 scalar comfortably below the curve order - every
/// test that needs a signing key uses this one so a [`KeySlot`] built from
/// [`test_pubkey_bytes`] always matches it.
const TEST_SK_BYTES: [u8; 32] = [0x11; 32];

pub(crate) fn test_signing_key() -> SigningKey {
    SigningKey::from_bytes(&TEST_SK_BYTES).expect("fixed test scalar is a valid P-256 key")
}

pub(crate) fn test_pubkey_bytes() -> [u8; 65] {
    let point = test_signing_key().verifying_key().to_encoded_point(false);
    let mut out = [0u8; 65];
    out.copy_from_slice(point.as_bytes());
    out
}

pub(crate) fn test_key_slot(pubkey: &[u8]) -> KeySlot<'_> {
    KeySlot {
        buffer: pubkey,
        key_type: KeyType::NistP256,
        mask: 0xFFFF_FFFF,
    }
}

fn put_tlv(h: &mut [u8], pos: &mut usize, t: u16, v: &[u8]) {
    h[*pos..*pos + 2].copy_from_slice(&t.to_le_bytes());
    h[*pos + 2..*pos + 4].copy_from_slice(&(v.len() as u16).to_le_bytes());
    h[*pos + 4..*pos + 4 + v.len()].copy_from_slice(v);
    *pos += 4 + v.len();
}

/// Builds a complete signed image (header bytes followed by `payload`):
/// Version + ImgType(APP|NISTP256) + Sha256(header-prefix || payload) +
/// Signature(hash, signed with [`test_signing_key`]). No pubkey hint TLV,
/// matching every other test in this crate that doesn't exercise hint
/// matching.
pub(crate) fn build_signed_image(version: u32, payload: &[u8]) -> Vec<u8> {
    let mut header = vec![0u8; IMAGE_HEADER_SIZE];
    header[0..4].copy_from_slice(header::MAGIC);
    header[4..8].copy_from_slice(&(payload.len() as u32).to_le_bytes());

    let mut pos = IMAGE_HEADER_OFFSET;
    put_tlv(&mut header, &mut pos, TlvType::Version as u16, &version.to_le_bytes());
    let img_type_bits = img_type::ROLE_APP | img_type::AUTH_NISTP256;
    put_tlv(&mut header, &mut pos, TlvType::ImgType as u16, &img_type_bits.to_le_bytes());

    let prefix_len = pos;
    let mut hasher = Sha256::new();
    hasher.update(&header[..prefix_len]);
    hasher.update(payload);
    let hash = hasher.finalize();
    put_tlv(&mut header, &mut pos, TlvType::Sha256 as u16, &hash);

    let sig: Signature = test_signing_key().sign(&hash);
    let sig_bytes = sig.as_bytes();
    put_tlv(&mut header, &mut pos, TlvType::Signature as u16, &sig_bytes);

    header[pos] = 0;
    header[pos + 1] = 0;
    for b in header.iter_mut().skip(pos + 2) {
        *b = HDR_PADDING;
    }

    let mut image = header;
    image.extend_from_slice(payload);
    image
}

/// Like [`build_signed_image`], but carries the delta-patch TLVs a forward
/// patch against `base_version`/`base_hash` would declare. `patch_stream` is
/// the already-encoded [`crate::delta`] stream; `target_fw_size` is the
/// reconstructed payload's length (what the patch expands to).
pub(crate) fn build_signed_delta_image(
    version: u32,
    base_version: u32,
    base_hash: &[u8],
    patch_stream: &[u8],
    target_fw_size: u32,
    target_hash: &[u8; 32],
) -> Vec<u8> {
    let mut header = vec![0u8; IMAGE_HEADER_SIZE];
    header[0..4].copy_from_slice(header::MAGIC);
    header[4..8].copy_from_slice(&target_fw_size.to_le_bytes());

    let mut pos = IMAGE_HEADER_OFFSET;
    put_tlv(&mut header, &mut pos, TlvType::Version as u16, &version.to_le_bytes());
    let img_type_bits = img_type::ROLE_APP | img_type::AUTH_NISTP256;
    put_tlv(&mut header, &mut pos, TlvType::ImgType as u16, &img_type_bits.to_le_bytes());
    put_tlv(&mut header, &mut pos, TlvType::Sha256 as u16, target_hash);
    put_tlv(&mut header, &mut pos, TlvType::DeltaBase as u16, &base_version.to_le_bytes());
    put_tlv(&mut header, &mut pos, TlvType::DeltaBaseHash as u16, base_hash);
    put_tlv(
        &mut header,
        &mut pos,
        TlvType::DeltaSize as u16,
        &(patch_stream.len() as u32).to_le_bytes(),
    );

    let sig: Signature = test_signing_key().sign(target_hash);
    let sig_bytes = sig.as_bytes();
    put_tlv(&mut header, &mut pos, TlvType::Signature as u16, &sig_bytes);

    header[pos] = 0;
    header[pos + 1] = 0;
    for b in header.iter_mut().skip(pos + 2) {
        *b = HDR_PADDING;
    }

    let mut image = header;
    image.extend_from_slice(patch_stream);
    image
}
