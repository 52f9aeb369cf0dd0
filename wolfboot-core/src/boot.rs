//! C9 - boot entry.
//!
//! The sequence an integrator's `main` runs on every reset: look at BOOT's
//! trailer state, decide whether a pending swap needs to be resumed or a
//! previous boot needs to be rolled back, verify whatever image ends up in
//! BOOT, and hand control to it. This module owns that decision; it never
//! owns clock/UART init or the actual jump to the application entry point
//! - those stay with the integrator, same as `hal_init`/`hal_prepare_boot`
//! do upstream.
//!
//! A pending update is never swapped in blind: [`Engine::verify_update_candidate`]
//! gates every swap this module triggers (both a fresh update and an
//! emergency rollback), so a candidate that fails image type, size,
//! integrity, authenticity or version policy is rejected - UPDATE's trailer
//! is reset and BOOT keeps running what it already had - instead of being
//! swapped in and discovered bad only after the jump.
//!
//! Grounded on `libwolfboot.c`'s `wolfBoot_start` dispatch in the original
//! implementation and on the upstream crate's `nrf52840_example.rs`, which
//! wires the equivalent sequence together for one board.

use crate::encrypt::EncryptionKey;
use crate::error::{Result, WolfBootError};
use crate::flash::FlashDevice;
use crate::geometry::{Geometry, PartId, IMAGE_HEADER_SIZE};
use crate::header;
use crate::image::{self, ImageInfo};
use crate::keystore::KeyStore;
use crate::trailer::PartitionState;
use crate::update::{self, Config, DeltaScratch, Engine};

/// What `init` decided to do, returned so the integrator can log it and so
/// tests can assert on it without re-deriving the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootDecision {
    /// BOOT already passed self-test, or a pending update failed its
    /// pre-flight checks and was rejected; proceed straight to BOOT as-is.
    DirectBoot,
    /// A pending update passed its pre-flight checks; the swap ran (or
    /// resumed) and BOOT now holds the new image, armed for self-test.
    SwappedIn,
    /// BOOT was left in `Testing` from a previous boot that never called
    /// `success()`; its self-test is presumed failed and the backup in
    /// UPDATE was swapped back in.
    RolledBack,
}

/// What to do when BOOT's own verification fails even after a rollback
/// attempt. A hard-fault target wants [`PanicPolicy::Halt`]; a target with
/// a watchdog wants [`PanicPolicy::Reset`] so the watchdog gets another
/// shot at recovery on the next cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanicPolicy {
    Halt,
    Reset,
}

pub struct BootContext {
    pub geom: Geometry,
    pub engine: Engine,
    pub panic_policy: PanicPolicy,
}

impl BootContext {
    pub fn new(geom: Geometry, config: Config, panic_policy: PanicPolicy) -> Result<Self> {
        Ok(BootContext {
            geom,
            engine: Engine::new(geom, config)?,
            panic_policy,
        })
    }

    /// Runs the full decision sequence, mutating `boot`/`update`/`swap` as
    /// needed, and returns which path was taken. `payload_scratch`,
    /// `delta_base_scratch` and `delta_patch_scratch` back the pre-flight
    /// check's reads of the candidate (and, for a delta candidate, its
    /// diff base); they only need to be as large as the biggest firmware
    /// payload this target will ever carry. `encryption`, when set, is
    /// applied to every sector moved into or out of UPDATE/SWAP.
    #[allow(clippy::too_many_arguments)]
    pub fn init(
        &self,
        boot: &mut dyn FlashDevice,
        update: &mut dyn FlashDevice,
        swap: &mut dyn FlashDevice,
        store: &dyn KeyStore,
        payload_scratch: &mut [u8],
        delta_base_scratch: &mut [u8],
        delta_patch_scratch: &mut [u8],
        scratch: &mut [u8],
        encryption: Option<&EncryptionKey>,
    ) -> Result<BootDecision> {
        let boot_state = self
            .engine
            .get_partition_state(boot, PartId::Boot, scratch)?;

        let decision = match boot_state {
            PartitionState::Testing => {
                // A previous boot armed self-test and never confirmed it.
                // Roll back rather than trust an image that never proved
                // itself: re-arm UPDATE (which still holds the backup this
                // partition had before the failed attempt) and swap it back
                // in, allowing a version equal to (or lower than) what's
                // currently on BOOT, since BOOT's own version can't be
                // trusted here.
                self.rollback(
                    boot,
                    update,
                    swap,
                    store,
                    payload_scratch,
                    delta_base_scratch,
                    delta_patch_scratch,
                    scratch,
                    encryption,
                )?;
                BootDecision::RolledBack
            }
            PartitionState::Success | PartitionState::New => {
                let update_state = self
                    .engine
                    .get_partition_state(update, PartId::Update, scratch)?;
                if update_state == PartitionState::Updating {
                    self.apply_pending_update(
                        boot,
                        update,
                        swap,
                        store,
                        payload_scratch,
                        delta_base_scratch,
                        delta_patch_scratch,
                        scratch,
                        encryption,
                        false,
                    )?
                } else {
                    BootDecision::DirectBoot
                }
            }
            PartitionState::Updating | PartitionState::FinalFlags => {
                // Crash mid-swap on a previous boot; the candidate already
                // passed its pre-flight checks before this swap was first
                // armed, so resume it rather than re-gating.
                self.engine
                    .swap_and_final_erase(boot, update, swap, scratch, encryption)?;
                BootDecision::SwappedIn
            }
        };
        Ok(decision)
    }

    /// Gates UPDATE's candidate and, if it passes, runs the swap. A
    /// rejection-class failure (bad image, bad version, ...) resets
    /// UPDATE's trailer and falls back to `DirectBoot` rather than
    /// propagating; a flash I/O failure propagates as fatal.
    #[allow(clippy::too_many_arguments)]
    fn apply_pending_update(
        &self,
        boot: &mut dyn FlashDevice,
        update: &mut dyn FlashDevice,
        swap: &mut dyn FlashDevice,
        store: &dyn KeyStore,
        payload_scratch: &mut [u8],
        delta_base_scratch: &mut [u8],
        delta_patch_scratch: &mut [u8],
        scratch: &mut [u8],
        encryption: Option<&EncryptionKey>,
        fallback_allowed: bool,
    ) -> Result<BootDecision> {
        let delta_scratch = Some(DeltaScratch {
            base_payload: delta_base_scratch,
            patch_stream: delta_patch_scratch,
        });
        match self.engine.verify_update_candidate(
            boot,
            update,
            store,
            payload_scratch,
            delta_scratch,
            fallback_allowed,
        ) {
            Ok(()) => {
                self.engine
                    .swap_and_final_erase(boot, update, swap, scratch, encryption)?;
                Ok(BootDecision::SwappedIn)
            }
            Err(e) if update::is_candidate_rejection(e) => {
                self.engine.reject_update(update, scratch)?;
                Ok(BootDecision::DirectBoot)
            }
            Err(e) => Err(e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn rollback(
        &self,
        boot: &mut dyn FlashDevice,
        update: &mut dyn FlashDevice,
        swap: &mut dyn FlashDevice,
        store: &dyn KeyStore,
        payload_scratch: &mut [u8],
        delta_base_scratch: &mut [u8],
        delta_patch_scratch: &mut [u8],
        scratch: &mut [u8],
        encryption: Option<&EncryptionKey>,
    ) -> Result<()> {
        self.engine.update_trigger(update, scratch)?;
        match self.apply_pending_update(
            boot,
            update,
            swap,
            store,
            payload_scratch,
            delta_base_scratch,
            delta_patch_scratch,
            scratch,
            encryption,
            true,
        )? {
            BootDecision::SwappedIn => Ok(()),
            // The backup UPDATE was itself unusable - nothing left to roll
            // back to. Surface this as a failed integrity check rather than
            // silently continuing to boot the untested BOOT image.
            BootDecision::DirectBoot => Err(WolfBootError::IntegrityCheckFailed),
            BootDecision::RolledBack => unreachable!("apply_pending_update never returns RolledBack"),
        }
    }

    /// Verifies BOOT's header and payload against `store`, the last gate
    /// before handing off to the application. On failure, applies
    /// `panic_policy` via the returned error - the caller decides what
    /// "halt" and "reset" mean for its target; this just distinguishes the
    /// two so the caller doesn't have to re-derive the policy.
    pub fn verify_boot_image<'a>(
        &self,
        boot: &'a dyn FlashDevice,
        header_buf: &'a mut [u8; IMAGE_HEADER_SIZE],
        payload_buf: &'a mut [u8],
        store: &dyn KeyStore,
    ) -> Result<ImageInfo<'a>> {
        boot.read_at(self.geom.boot_base, header_buf)?;
        header::parse_prelude(header_buf)?;
        let info = image::open_image(header_buf)?;
        if payload_buf.len() < info.fw_size as usize {
            return Err(WolfBootError::InvalidFirmwareSize);
        }
        let payload = &mut payload_buf[..info.fw_size as usize];
        boot.read_at(self.geom.fw_base(PartId::Boot), payload)?;
        image::verify_image(&info, payload, store, crate::header::img_type::ROLE_APP as u32)?;
        // info borrows header_buf; re-open against it so the returned
        // value's lifetime is tied to `header_buf`, not the temporary used
        // for verification above.
        image::open_image(header_buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::SimFlash;
    use crate::header::{self as hdr, img_type};
    use crate::keystore::EmbeddedKeyStore;
    use crate::test_support::{build_signed_image, test_key_slot, test_pubkey_bytes};

    fn geom() -> Geometry {
        Geometry::new(0x400, 0x2000, 0x0, 0x2000, 0x4000)
    }

    fn write_fixture_image(dev: &mut SimFlash, base: usize, version: u32, payload: &[u8]) {
        let mut header = std::vec![0u8; IMAGE_HEADER_SIZE];
        header[0..4].copy_from_slice(hdr::MAGIC);
        header[4..8].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        let mut pos = crate::geometry::IMAGE_HEADER_OFFSET;
        let mut put = |t: u16, v: &[u8], pos: &mut usize| {
            header[*pos..*pos + 2].copy_from_slice(&t.to_le_bytes());
            header[*pos + 2..*pos + 4].copy_from_slice(&(v.len() as u16).to_le_bytes());
            header[*pos + 4..*pos + 4 + v.len()].copy_from_slice(v);
            *pos += 4 + v.len();
        };
        put(1, &version.to_le_bytes(), &mut pos);
        put(4, &img_type::ROLE_APP.to_le_bytes(), &mut pos);
        header[pos] = 0;
        header[pos + 1] = 0;
        for b in header.iter_mut().skip(pos + 2) {
            *b = hdr::HDR_PADDING;
        }
        dev.erase(base, header.len()).unwrap();
        dev.write_at(base, &header).unwrap();
        dev.erase(base + header.len(), payload.len().max(16)).unwrap();
        dev.write_at(base + header.len(), payload).unwrap();
    }

    fn write_signed_fixture(dev: &mut SimFlash, base: usize, version: u32, payload: &[u8]) {
        let image = build_signed_image(version, payload);
        dev.erase(base, image.len().max(16)).unwrap();
        dev.write_at(base, &image).unwrap();
    }

    struct Harness {
        geom: Geometry,
        ctx: BootContext,
        boot: SimFlash,
        update: SimFlash,
        swap: SimFlash,
        scratch: std::vec::Vec<u8>,
        payload_scratch: std::vec::Vec<u8>,
        delta_base_scratch: std::vec::Vec<u8>,
        delta_patch_scratch: std::vec::Vec<u8>,
    }

    impl Harness {
        fn new(cfg: Config) -> Self {
            let g = geom();
            let ctx = BootContext::new(g, cfg, PanicPolicy::Reset).unwrap();
            Harness {
                geom: g,
                ctx,
                boot: SimFlash::new(g.boot_base, g.partition_size),
                update: SimFlash::new(g.update_base, g.partition_size),
                swap: SimFlash::new(g.swap_base, g.sector_size),
                scratch: std::vec![0u8; g.sector_size],
                payload_scratch: std::vec![0u8; 256],
                delta_base_scratch: std::vec![0u8; 256],
                delta_patch_scratch: std::vec![0u8; 256],
            }
        }

        fn init(&mut self, store: &dyn KeyStore) -> Result<BootDecision> {
            self.ctx.init(
                &mut self.boot,
                &mut self.update,
                &mut self.swap,
                store,
                &mut self.payload_scratch,
                &mut self.delta_base_scratch,
                &mut self.delta_patch_scratch,
                &mut self.scratch,
                None,
            )
        }
    }

    fn default_cfg() -> Config {
        Config {
            write_once: false,
            flags_home: false,
            disable_backup: false,
        }
    }

    #[test]
    fn direct_boot_when_no_update_pending() {
        let mut h = Harness::new(default_cfg());
        write_fixture_image(&mut h.boot, h.geom.boot_base, 1, b"firmware v1.....");
        let store = EmbeddedKeyStore::new(&[]);
        let decision = h.init(&store).unwrap();
        assert_eq!(decision, BootDecision::DirectBoot);
    }

    #[test]
    fn swaps_in_a_pending_update_on_init() {
        let mut h = Harness::new(default_cfg());
        write_signed_fixture(&mut h.boot, h.geom.boot_base, 1, b"firmware v1.....");
        write_signed_fixture(&mut h.update, h.geom.update_base, 2, b"firmware v2.....");

        let pubkey = test_pubkey_bytes();
        let slots = [test_key_slot(&pubkey)];
        let store = EmbeddedKeyStore::new(&slots);
        h.ctx
            .engine
            .update_trigger(&mut h.update, &mut h.scratch)
            .unwrap();
        let decision = h.init(&store).unwrap();
        assert_eq!(decision, BootDecision::SwappedIn);
        assert_eq!(h.ctx.engine.current_firmware_version(&h.boot).unwrap(), 2);
        assert_eq!(
            h.ctx
                .engine
                .get_partition_state(&mut h.update, PartId::Update, &mut h.scratch)
                .unwrap(),
            PartitionState::New
        );
    }

    #[test]
    fn equal_version_candidate_is_rejected_and_boot_stays_put() {
        let mut h = Harness::new(default_cfg());
        write_signed_fixture(&mut h.boot, h.geom.boot_base, 2, b"firmware v2.....");
        write_signed_fixture(&mut h.update, h.geom.update_base, 2, b"also version 2..");

        let pubkey = test_pubkey_bytes();
        let slots = [test_key_slot(&pubkey)];
        let store = EmbeddedKeyStore::new(&slots);
        h.ctx
            .engine
            .update_trigger(&mut h.update, &mut h.scratch)
            .unwrap();
        let decision = h.init(&store).unwrap();
        assert_eq!(decision, BootDecision::DirectBoot);
        assert_eq!(h.ctx.engine.current_firmware_version(&h.boot).unwrap(), 2);
    }

    #[test]
    fn downgrade_candidate_is_rejected_and_boot_stays_on_newer_version() {
        let mut h = Harness::new(default_cfg());
        write_signed_fixture(&mut h.boot, h.geom.boot_base, 2, b"firmware v2.....");
        write_signed_fixture(&mut h.update, h.geom.update_base, 1, b"firmware v1.....");

        let pubkey = test_pubkey_bytes();
        let slots = [test_key_slot(&pubkey)];
        let store = EmbeddedKeyStore::new(&slots);
        h.ctx
            .engine
            .update_trigger(&mut h.update, &mut h.scratch)
            .unwrap();
        let decision = h.init(&store).unwrap();
        assert_eq!(decision, BootDecision::DirectBoot);
        assert_eq!(h.ctx.engine.current_firmware_version(&h.boot).unwrap(), 2);
    }

    #[test]
    fn mangled_candidate_hash_is_rejected_and_original_boot_survives() {
        let mut h = Harness::new(default_cfg());
        write_signed_fixture(&mut h.boot, h.geom.boot_base, 1, b"firmware v1.....");

        let mut corrupt = build_signed_image(2, b"firmware v2.....");
        let payload_off = IMAGE_HEADER_SIZE;
        corrupt[payload_off] ^= 0xFF;
        h.update.erase(h.geom.update_base, corrupt.len()).unwrap();
        h.update.write_at(h.geom.update_base, &corrupt).unwrap();

        let pubkey = test_pubkey_bytes();
        let slots = [test_key_slot(&pubkey)];
        let store = EmbeddedKeyStore::new(&slots);
        h.ctx
            .engine
            .update_trigger(&mut h.update, &mut h.scratch)
            .unwrap();
        let decision = h.init(&store).unwrap();
        assert_eq!(decision, BootDecision::DirectBoot);
        assert_eq!(h.ctx.engine.current_firmware_version(&h.boot).unwrap(), 1);
    }

    #[test]
    fn untested_boot_rolls_back_to_equal_version_backup() {
        let mut h = Harness::new(default_cfg());
        // BOOT holds a v2 image that was swapped in but never confirmed;
        // UPDATE still holds the v2 backup the swap copied there (backup
        // population only ever copies BOOT's pre-swap content, so in a real
        // rollback this would usually be the older version - using the same
        // version here exercises the version-equal allowance fallback
        // grants, since BOOT's own version can't be trusted while untested).
        write_signed_fixture(&mut h.boot, h.geom.boot_base, 2, b"firmware v2 bad.");
        write_signed_fixture(&mut h.update, h.geom.update_base, 2, b"backup unchanged");
        h.ctx
            .engine
            .set_partition_state(&mut h.boot, PartId::Boot, PartitionState::Testing, &mut h.scratch)
            .unwrap();

        let pubkey = test_pubkey_bytes();
        let slots = [test_key_slot(&pubkey)];
        let store = EmbeddedKeyStore::new(&slots);
        let decision = h.init(&store).unwrap();
        assert_eq!(decision, BootDecision::RolledBack);
        assert_eq!(
            h.ctx
                .engine
                .get_partition_state(&mut h.boot, PartId::Boot, &mut h.scratch)
                .unwrap(),
            PartitionState::Testing
        );
    }

    #[test]
    fn verify_boot_image_accepts_intact_unsigned_image() {
        let g = geom();
        let mut boot = SimFlash::new(g.boot_base, g.partition_size);
        write_fixture_image(&mut boot, g.boot_base, 1, b"firmware v1.....");
        let ctx = BootContext::new(g, default_cfg(), PanicPolicy::Halt).unwrap();
        let store = EmbeddedKeyStore::new(&[]);
        let mut header_buf = [0u8; IMAGE_HEADER_SIZE];
        let mut payload_buf = std::vec![0u8; 64];
        // No SHA tlv in this fixture -> integrity check can't run; this
        // exercises the header/size plumbing, not the crypto path.
        let result = ctx.verify_boot_image(&boot, &mut header_buf, &mut payload_buf, &store);
        assert_eq!(result.err(), Some(WolfBootError::TlvNotFound));
    }
}
