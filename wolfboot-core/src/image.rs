//! C3 - image verifier.
//!
//! Ties together the header parser ([`crate::header`]), the key store
//! ([`crate::keystore`]) and the signing backends
//! ([`crate::crypto::signatures`]) into the two checks every candidate
//! image must pass before the update engine or the boot path will touch
//! its payload: integrity (does the payload hash match the header's hash
//! TLV) and authenticity (does a trusted key's signature cover that hash).
//!
//! Grounded on `image/image.rs`'s `RustbootImage` in the upstream crate,
//! which encodes the same two checks as inherent methods on a type-state
//! image handle. That type-state dance (`RustbootImage<Part, Init>` ->
//! `RustbootImage<Part, ImgHdrChecked>` -> ...) is tied to one hardware
//! target's boot flow; here the same checks are exposed as free functions
//! over a `&[u8]` header and payload so `update::Engine` and `boot` can
//! call them against whichever partition they're inspecting at the time.

use core::convert::TryInto;

use sha2::{Digest as Sha2Digest, Sha256, Sha384};
use sha3::Sha3_384;

use crate::error::{Result, WolfBootError};
use crate::header::{self, img_type, Tlv, TlvType};
use crate::keystore::{find_key, KeyStore};

/// Everything pulled out of a header once it's been located and parsed.
/// Borrows from the header buffer it was built from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageInfo<'a> {
    pub version: u32,
    pub timestamp: u64,
    pub fw_size: u32,
    pub img_type: u16,
    pub hash_tlv: Tlv<'a>,
    pub hash_kind: HashKind,
    pub signature: Option<&'a [u8]>,
    pub pubkey_hint: Option<&'a [u8]>,
    /// The header bytes from offset 0 up to (not including) the hash TLV's
    /// own record - everything the integrity hash covers besides the
    /// payload. Any header field placed ahead of the hash TLV (version,
    /// timestamp, img_type, ...) is therefore covered by `verify_integrity`
    /// the same way the payload is.
    pub header_prefix: &'a [u8],
    pub delta: Option<DeltaInfo<'a>>,
}

/// Delta-patch TLVs, present only when the image's payload is a patch
/// stream rather than a full binary. `base_hash`'s length matches whichever
/// [`HashKind`] the image's own hash TLV declares.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeltaInfo<'a> {
    pub base_version: u32,
    pub base_hash: &'a [u8],
    /// Forward patch stream: `forward_len` bytes starting at the image's
    /// own `fw_base` (offset 0 into the payload region).
    pub forward_len: usize,
    /// Inverse patch stream (new -> old, used for delta-encoded rollback),
    /// as `(offset, len)` into the payload region. Not every delta image
    /// carries one.
    pub inverse: Option<(usize, usize)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    Sha256,
    Sha384,
    Sha3_384,
}

impl HashKind {
    fn digest_len(self) -> usize {
        match self {
            HashKind::Sha256 => 32,
            HashKind::Sha384 => 48,
            HashKind::Sha3_384 => 48,
        }
    }
}

/// Parses `header` (exactly [`crate::geometry::IMAGE_HEADER_SIZE`] bytes)
/// into an [`ImageInfo`], failing if any mandatory field is missing or
/// malformed. Does not touch the firmware payload.
pub fn open_image(header: &[u8]) -> Result<ImageInfo<'_>> {
    let fw_size = header::parse_prelude(header)?;

    let version = read_u32(header::find(header, TlvType::Version)?.value)?;
    let timestamp = read_u64_opt(header::find(header, TlvType::Timestamp).ok());
    let img_type = read_u16(header::find(header, TlvType::ImgType)?.value)?;

    let (hash_tlv, hash_kind) = locate_hash(header)?;
    let header_prefix = &header[..hash_tlv.offset];

    let signature = header::find(header, TlvType::Signature).ok().map(|t| t.value);
    let pubkey_hint = header::find(header, TlvType::PubkeyHint).ok().map(|t| t.value);
    let delta = locate_delta(header)?;

    Ok(ImageInfo {
        version,
        timestamp,
        fw_size,
        img_type,
        hash_tlv,
        hash_kind,
        signature,
        pubkey_hint,
        header_prefix,
        delta,
    })
}

/// Looks for the delta-patch TLV trio (`DeltaBase`/`DeltaBaseHash`/
/// `DeltaSize`); an image carrying none of them is a direct (non-delta)
/// image. Carrying only some of them is malformed.
fn locate_delta(header: &[u8]) -> Result<Option<DeltaInfo<'_>>> {
    let base = header::find(header, TlvType::DeltaBase).ok();
    let base_hash = header::find(header, TlvType::DeltaBaseHash).ok();
    let size = header::find(header, TlvType::DeltaSize).ok();

    let (base, base_hash, size) = match (base, base_hash, size) {
        (Some(b), Some(h), Some(s)) => (b, h, s),
        (None, None, None) => return Ok(None),
        _ => return Err(WolfBootError::InvalidPatch),
    };

    let base_version = read_u32(base.value)?;
    let forward_len = read_u32(size.value)? as usize;

    let inverse_offset = header::find(header, TlvType::DeltaInverseOffset).ok();
    let inverse_size = header::find(header, TlvType::DeltaInverseSize).ok();
    let inverse = match (inverse_offset, inverse_size) {
        (Some(o), Some(s)) => Some((read_u32(o.value)? as usize, read_u32(s.value)? as usize)),
        (None, None) => None,
        _ => return Err(WolfBootError::InvalidPatch),
    };

    Ok(Some(DeltaInfo {
        base_version,
        base_hash: base_hash.value,
        forward_len,
        inverse,
    }))
}

fn locate_hash(header: &[u8]) -> Result<(Tlv<'_>, HashKind)> {
    if let Ok(t) = header::find(header, TlvType::Sha256) {
        return Ok((t, HashKind::Sha256));
    }
    if let Ok(t) = header::find(header, TlvType::Sha384) {
        return Ok((t, HashKind::Sha384));
    }
    if let Ok(t) = header::find(header, TlvType::Sha3_384) {
        return Ok((t, HashKind::Sha3_384));
    }
    Err(WolfBootError::TlvNotFound)
}

/// Hashes `info.header_prefix` (every header field ahead of the hash TLV)
/// followed by `payload` (the firmware bytes following the header, exactly
/// `info.fw_size` of them) and compares against the header's hash TLV. A
/// header field tampered with after signing - a spoofed `img_type` or
/// `version` - changes `header_prefix` and so is caught here, not just a
/// corrupted payload.
pub fn verify_integrity(info: &ImageInfo<'_>, payload: &[u8]) -> Result<()> {
    if payload.len() != info.fw_size as usize {
        return Err(WolfBootError::InvalidFirmwareSize);
    }
    if info.hash_tlv.value.len() != info.hash_kind.digest_len() {
        return Err(WolfBootError::InvalidHdrFieldLength);
    }
    let computed = digest(info.hash_kind, info.header_prefix, payload);
    if ct_eq(&computed[..info.hash_kind.digest_len()], info.hash_tlv.value) {
        Ok(())
    } else {
        Err(WolfBootError::IntegrityCheckFailed)
    }
}

/// Verifies the signature TLV covers the image's hash TLV, using a key
/// from `store` permitted for `role_bit` and matching the image's declared
/// auth type and (optional) pubkey hint.
pub fn verify_authenticity(
    info: &ImageInfo<'_>,
    store: &dyn KeyStore,
    role_bit: u32,
) -> Result<()> {
    let signature = info.signature.ok_or(WolfBootError::FieldNotSet)?;
    let auth_type = info.img_type & img_type::AUTH_MASK;
    let slot = find_key(store, auth_type, role_bit, info.pubkey_hint)?;
    let ok = crate::crypto::signatures::verify(
        slot.key_type,
        slot.buffer,
        info.hash_tlv.value,
        signature,
    )?;
    if ok {
        Ok(())
    } else {
        Err(WolfBootError::BadSignature)
    }
}

/// Runs both checks. Integrity is checked before authenticity throughout
/// this crate - there is no value in spending a signature verification on
/// a payload that's already known to be corrupt.
pub fn verify_image(
    info: &ImageInfo<'_>,
    payload: &[u8],
    store: &dyn KeyStore,
    role_bit: u32,
) -> Result<()> {
    verify_integrity(info, payload)?;
    verify_authenticity(info, store, role_bit)
}

fn digest(kind: HashKind, header_prefix: &[u8], payload: &[u8]) -> [u8; 48] {
    let mut out = [0u8; 48];
    match kind {
        HashKind::Sha256 => {
            let mut h = Sha256::new();
            h.update(header_prefix);
            h.update(payload);
            out[..32].copy_from_slice(&h.finalize());
        }
        HashKind::Sha384 => {
            let mut h = Sha384::new();
            h.update(header_prefix);
            h.update(payload);
            out[..48].copy_from_slice(&h.finalize());
        }
        HashKind::Sha3_384 => {
            let mut h = Sha3_384::new();
            h.update(header_prefix);
            h.update(payload);
            out[..48].copy_from_slice(&h.finalize());
        }
    }
    out
}

/// Constant-time-ish comparison: always walks the full shorter length so
/// the time taken doesn't leak how many leading bytes matched.
fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn read_u32(bytes: &[u8]) -> Result<u32> {
    if bytes.len() != 4 {
        return Err(WolfBootError::InvalidHdrFieldLength);
    }
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_u16(bytes: &[u8]) -> Result<u16> {
    if bytes.len() != 2 {
        return Err(WolfBootError::InvalidHdrFieldLength);
    }
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u64_opt(tlv: Option<Tlv<'_>>) -> u64 {
    match tlv {
        Some(t) if t.value.len() == 8 => u64::from_le_bytes(t.value.try_into().unwrap()),
        _ => 0,
    }
}
