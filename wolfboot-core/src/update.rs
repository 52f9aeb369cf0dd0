//! C8 - update state machine.
//!
//! Drives the power-fail-safe three-way sector swap between the BOOT and
//! UPDATE partitions through the SWAP scratch partition, using one sector
//! flag per BOOT sector (persisted in the UPDATE partition's trailer) to
//! make every step resumable after a reset at any point. Before any sector
//! is touched, [`Engine::verify_update_candidate`] gates the swap on image
//! type, size, integrity, authenticity and version policy - a candidate
//! that fails any of those is rejected (its trailer reset to `New`) and the
//! caller keeps running the BOOT image it already has.
//!
//! Grounded on `libwolfboot.c`'s `wolfBoot_update`/`wolfBoot_start` loop in
//! the original implementation, which walks sectors from the top of the
//! partition down and performs the same gating (`wolfBoot_current_firmware_version`
//! vs `wolfBoot_update_firmware_version`, `wolfBoot_verify_integrity`,
//! `wolfBoot_verify_authenticity`) before ever touching a sector, and on
//! `update/mod.rs`'s `RustbootUpdater` in the upstream crate for the
//! surrounding `Engine`/`Config` shape (there, the loop is unrolled per-board
//! against fixed `BOOT`/`UPDATE` addresses; here it's parameterized by
//! [`crate::geometry::Geometry`] so one `Engine` drives every geometry the
//! test suite throws at it).

use crate::encrypt::{self, EncryptionKey};
use crate::error::{Result, WolfBootError};
use crate::flash::FlashDevice;
use crate::geometry::{Geometry, PartId, IMAGE_HEADER_SIZE};
use crate::header::{self, img_type};
use crate::image::{self, ImageInfo};
use crate::keystore::KeyStore;
use crate::trailer::{self, PartitionState, SectorFlag, Trailer, TrailerConfig};
use crate::delta;

/// Runtime policy knobs. See the crate-level `Cargo.toml` for why these
/// are fields here and not Cargo features.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub write_once: bool,
    pub flags_home: bool,
    /// Skip re-populating UPDATE with the previous BOOT image after a
    /// successful swap. Saves flash wear and swap time; forfeits the
    /// ability to recover by re-triggering an update from UPDATE's old
    /// contents.
    pub disable_backup: bool,
}

impl Config {
    /// Validates a configuration. `disable_backup && flags_home` is
    /// rejected: with FLAGS_HOME the UPDATE trailer is physically inside
    /// BOOT's own last sector, so UPDATE has no reserved trailer space of
    /// its own to preserve once backup-population is skipped, and the
    /// fresh-bank selector would have nothing to fall back to.
    pub fn validate(&self) -> Result<()> {
        if self.disable_backup && self.flags_home {
            return Err(WolfBootError::InvalidState);
        }
        Ok(())
    }
}

/// Scratch buffers [`Engine::verify_update_candidate`] needs only when the
/// candidate turns out to be delta-encoded: room for BOOT's current payload
/// (the diff base) and for the patch stream read off UPDATE.
pub struct DeltaScratch<'a> {
    pub base_payload: &'a mut [u8],
    pub patch_stream: &'a mut [u8],
}

pub struct Engine {
    geom: Geometry,
    config: Config,
}

impl Engine {
    pub fn new(geom: Geometry, config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Engine { geom, config })
    }

    pub fn geometry(&self) -> Geometry {
        self.geom
    }

    fn trailer_cfg(&self) -> TrailerConfig {
        TrailerConfig {
            write_once: self.config.write_once,
            flags_home: self.config.flags_home,
        }
    }

    fn trailer<'a>(
        &self,
        dev: &'a mut dyn FlashDevice,
        part: PartId,
        scratch: &'a mut [u8],
    ) -> Trailer<'a> {
        let top = trailer::region_top(&self.geom, part, &self.trailer_cfg());
        Trailer::new(
            dev,
            top,
            self.geom.sector_size,
            trailer::flag_byte_count(self.geom.sectors_per_partition()),
            self.config.write_once,
            scratch,
        )
    }

    pub fn get_partition_state(
        &self,
        dev: &mut dyn FlashDevice,
        part: PartId,
        scratch: &mut [u8],
    ) -> Result<PartitionState> {
        self.trailer(dev, part, scratch).get_state()
    }

    pub fn set_partition_state(
        &self,
        dev: &mut dyn FlashDevice,
        part: PartId,
        state: PartitionState,
        scratch: &mut [u8],
    ) -> Result<()> {
        self.trailer(dev, part, scratch).set_state(state)
    }

    /// Arms an update: erases stale per-sector flags and sets UPDATE's
    /// state to `Updating`. Idempotent - calling it again on an
    /// already-armed partition just re-erases and re-arms.
    pub fn update_trigger(&self, update_dev: &mut dyn FlashDevice, scratch: &mut [u8]) -> Result<()> {
        self.trailer(update_dev, PartId::Update, scratch)
            .update_trigger()
    }

    /// Marks BOOT as having passed its post-swap self-test. Called by the
    /// running application, not the bootloader itself.
    pub fn success(&self, boot_dev: &mut dyn FlashDevice, scratch: &mut [u8]) -> Result<()> {
        self.trailer(boot_dev, PartId::Boot, scratch)
            .set_state(PartitionState::Success)
    }

    pub fn erase_partition(&self, dev: &mut dyn FlashDevice, part: PartId, scratch: &mut [u8]) -> Result<()> {
        self.trailer(dev, part, scratch).erase_partition()
    }

    /// Rejects a pending update: resets UPDATE's trailer back to `New` so a
    /// candidate that failed [`Engine::verify_update_candidate`] isn't
    /// retried (and isn't left holding `Updating`, which would otherwise
    /// leave two partitions contending for the one `SUCCESS` state) on the
    /// next boot.
    pub fn reject_update(&self, update_dev: &mut dyn FlashDevice, scratch: &mut [u8]) -> Result<()> {
        self.trailer(update_dev, PartId::Update, scratch)
            .erase_partition()
    }

    fn read_header(&self, dev: &dyn FlashDevice, part: PartId, header_buf: &mut [u8; IMAGE_HEADER_SIZE]) -> Result<()> {
        dev.read_at(self.geom.base_of(part), header_buf)?;
        header::parse_prelude(header_buf)?;
        Ok(())
    }

    fn read_version(&self, dev: &dyn FlashDevice, part: PartId) -> Result<u32> {
        let mut hdr = [0u8; IMAGE_HEADER_SIZE];
        self.read_header(dev, part, &mut hdr)?;
        Ok(image::open_image(&hdr)?.version)
    }

    pub fn current_firmware_version(&self, boot_dev: &dyn FlashDevice) -> Result<u32> {
        self.read_version(boot_dev, PartId::Boot)
    }

    pub fn update_firmware_version(&self, update_dev: &dyn FlashDevice) -> Result<u32> {
        self.read_version(update_dev, PartId::Update)
    }

    fn max_payload_size(&self) -> usize {
        self.geom
            .max_payload_size(trailer::trailer_overhead(self.geom.sectors_per_partition()))
    }

    /// Runs every pre-swap check against the image sitting in UPDATE: role
    /// (must be an application image), size against the partition's payload
    /// budget, a delta-patch base-check and materialization if the image is
    /// patch-encoded, integrity, authenticity against `store`, and - unless
    /// `fallback_allowed` (an emergency rollback to a previously-known-good
    /// backup) - a strict version increase over whatever's currently on
    /// BOOT. Returns `Ok(())` only if the swap that follows is safe to run.
    pub fn verify_update_candidate(
        &self,
        boot: &dyn FlashDevice,
        update: &mut dyn FlashDevice,
        store: &dyn KeyStore,
        payload_scratch: &mut [u8],
        delta_scratch: Option<DeltaScratch<'_>>,
        fallback_allowed: bool,
    ) -> Result<()> {
        let mut header = [0u8; IMAGE_HEADER_SIZE];
        self.read_header(update, PartId::Update, &mut header)?;
        let info = image::open_image(&header)?;

        if info.img_type & img_type::ROLE_MASK != img_type::ROLE_APP {
            return Err(WolfBootError::InvalidImage);
        }
        let max_payload = self.max_payload_size();
        if info.fw_size as usize > max_payload || payload_scratch.len() < info.fw_size as usize {
            return Err(WolfBootError::InvalidFirmwareSize);
        }

        let target = &mut payload_scratch[..info.fw_size as usize];
        match info.delta {
            Some(delta) => {
                let scratch = delta_scratch.ok_or(WolfBootError::InvalidPatch)?;
                self.materialize_delta(boot, &delta, update, scratch, target)?;
            }
            None => {
                update.read_at(self.geom.fw_base(PartId::Update), target)?;
            }
        }

        image::verify_integrity(&info, target)?;
        image::verify_authenticity(&info, store, img_type::ROLE_APP as u32)?;

        if !fallback_allowed {
            let boot_version = self.read_version(boot, PartId::Boot).unwrap_or(0);
            if info.version <= boot_version {
                return Err(WolfBootError::BadVersion);
            }
        }
        Ok(())
    }

    /// Reconstructs a delta-encoded UPDATE image's payload from BOOT's
    /// current payload (the diff base) plus the patch stream stored in
    /// UPDATE, after checking that BOOT is actually the base the patch was
    /// computed against. The patch stream always runs forward (old ->
    /// new); this engine's own backups are always full images, so a
    /// rollback never needs the inverse direction, which isn't
    /// materialized here. Rewrites UPDATE's firmware region in place with
    /// the reconstructed bytes so every later step treats it exactly like a
    /// direct (non-delta) image.
    fn materialize_delta(
        &self,
        boot: &dyn FlashDevice,
        delta: &image::DeltaInfo<'_>,
        update: &mut dyn FlashDevice,
        scratch: DeltaScratch<'_>,
        target: &mut [u8],
    ) -> Result<()> {
        let mut boot_header = [0u8; IMAGE_HEADER_SIZE];
        self.read_header(boot, PartId::Boot, &mut boot_header)?;
        let boot_info = image::open_image(&boot_header)?;

        if boot_info.version != delta.base_version || boot_info.hash_tlv.value != delta.base_hash {
            return Err(WolfBootError::DeltaBaseMismatch);
        }

        if scratch.base_payload.len() < boot_info.fw_size as usize {
            return Err(WolfBootError::InvalidFirmwareSize);
        }
        let base_payload = &mut scratch.base_payload[..boot_info.fw_size as usize];
        boot.read_at(self.geom.fw_base(PartId::Boot), base_payload)?;
        image::verify_integrity(&boot_info, base_payload)?;

        if scratch.patch_stream.len() < delta.forward_len {
            return Err(WolfBootError::InvalidPatch);
        }
        let stream = &mut scratch.patch_stream[..delta.forward_len];
        update.read_at(self.geom.fw_base(PartId::Update), stream)?;

        let written = delta::patch(base_payload, stream, target)?;
        if written != target.len() {
            return Err(WolfBootError::InvalidPatch);
        }

        let fw_base = self.geom.fw_base(PartId::Update);
        let mut off = 0usize;
        while off < written {
            update.erase(fw_base + off, self.geom.sector_size)?;
            off += self.geom.sector_size;
        }
        update.write_at(fw_base, target)
    }

    /// Runs the three-way sector swap to completion, one state transition
    /// per sector per call-site loop iteration, so the whole thing can be
    /// interrupted and resumed (by calling this again) after a reset.
    /// Callers are expected to have already gated this with
    /// [`Engine::verify_update_candidate`]; this method itself performs no
    /// validation, only the swap and its final commit.
    ///
    /// `boot`, `update` and `swap` may be views over the same physical
    /// flash chip or three different ones - the engine only ever touches
    /// the sector range each [`PartId`] maps to. `encryption`, when set, is
    /// applied to every byte that crosses into or out of UPDATE or SWAP -
    /// BOOT is always treated as plaintext internal flash - so SWAP is
    /// never written to in cleartext.
    pub fn swap_and_final_erase(
        &self,
        boot: &mut dyn FlashDevice,
        update: &mut dyn FlashDevice,
        swap: &mut dyn FlashDevice,
        scratch: &mut [u8],
        encryption: Option<&EncryptionKey>,
    ) -> Result<()> {
        let sectors = self.geom.sectors_per_partition();
        let sector_size = self.geom.sector_size;

        for i in 0..sectors {
            loop {
                let flag = {
                    let t = self.trailer(update, PartId::Update, scratch);
                    t.get_sector_flag(i)?
                };
                match flag {
                    SectorFlag::New => {
                        // SWAP is a single scratch sector, reused for every
                        // BOOT sector in turn - always sector index 0 there.
                        // Writing BOOT's plaintext into SWAP under
                        // `encryption` is what keeps SWAP's contents
                        // confidential at rest between resets.
                        copy_sector(
                            boot,
                            swap,
                            self.geom.boot_base,
                            self.geom.swap_base,
                            i,
                            0,
                            sector_size,
                            None,
                            encryption,
                        )?;
                        self.set_sector_flag(update, i, SectorFlag::Swapping, scratch)?;
                    }
                    SectorFlag::Swapping => {
                        copy_sector(
                            update,
                            boot,
                            self.geom.update_base,
                            self.geom.boot_base,
                            i,
                            i,
                            sector_size,
                            encryption,
                            None,
                        )?;
                        self.set_sector_flag(update, i, SectorFlag::Backup, scratch)?;
                    }
                    SectorFlag::Backup => {
                        if !self.config.disable_backup {
                            copy_sector(
                                swap,
                                update,
                                self.geom.swap_base,
                                self.geom.update_base,
                                0,
                                i,
                                sector_size,
                                encryption,
                                encryption,
                            )?;
                        }
                        self.set_sector_flag(update, i, SectorFlag::Updated, scratch)?;
                    }
                    SectorFlag::Updated => break,
                }
            }
        }

        // Every sector has moved; commit. FINAL_FLAGS marks "the sector
        // loop is done, only the trailer state writes below are left" - a
        // reset between here and the Testing/New writes resumes into this
        // same arm (boot::BootContext::init matches Updating | FinalFlags
        // identically) and just re-issues them, which is safe since both
        // are idempotent.
        self.trailer(boot, PartId::Boot, scratch)
            .set_state(PartitionState::FinalFlags)?;
        self.trailer(boot, PartId::Boot, scratch)
            .set_state(PartitionState::Testing)?;
        // UPDATE goes back to New, not Success: invariant holds that at most
        // one of BOOT/UPDATE is ever SUCCESS, and UPDATE now holds the
        // previous BOOT image (or is erased, under disable_backup) rather
        // than anything that passed a version/integrity check of its own.
        self.trailer(update, PartId::Update, scratch)
            .erase_partition()
    }

    fn set_sector_flag(
        &self,
        update: &mut dyn FlashDevice,
        i: usize,
        flag: SectorFlag,
        scratch: &mut [u8],
    ) -> Result<()> {
        self.trailer(update, PartId::Update, scratch)
            .set_sector_flag(i, flag)
    }
}

/// Whether `err` reflects a defect in the *candidate image* (bad version,
/// corrupt payload, untrusted signature, malformed patch, ...) rather than a
/// flash/hardware fault. Callers use this to decide whether to reject the
/// update and keep running the current image, or propagate the error as
/// fatal.
pub fn is_candidate_rejection(err: WolfBootError) -> bool {
    matches!(
        err,
        WolfBootError::InvalidImage
            | WolfBootError::InvalidFirmwareSize
            | WolfBootError::TlvNotFound
            | WolfBootError::InvalidHdrFieldLength
            | WolfBootError::BadSignature
            | WolfBootError::KeyNotFound
            | WolfBootError::KeyNotPermitted
            | WolfBootError::FieldNotSet
            | WolfBootError::IntegrityCheckFailed
            | WolfBootError::BadVersion
            | WolfBootError::InvalidPatch
            | WolfBootError::DeltaBaseMismatch
            | WolfBootError::CryptoError
    )
}

#[allow(clippy::too_many_arguments)]
fn copy_sector(
    src: &mut dyn FlashDevice,
    dst: &mut dyn FlashDevice,
    src_base: usize,
    dst_base: usize,
    src_sector: usize,
    dst_sector: usize,
    sector_size: usize,
    src_key: Option<&EncryptionKey>,
    dst_key: Option<&EncryptionKey>,
) -> Result<()> {
    let mut buf = alloc_sector_buf(sector_size);
    let src_addr = src_base + src_sector * sector_size;
    let dst_addr = dst_base + dst_sector * sector_size;
    match src_key {
        Some(key) => encrypt::decrypt_read(src, key, src_base, src_addr, &mut buf)?,
        None => src.read_at(src_addr, &mut buf)?,
    }
    dst.erase(dst_addr, sector_size)?;
    match dst_key {
        Some(key) => encrypt::encrypt_write(dst, key, dst_base, dst_addr, &mut buf),
        None => dst.write_at(dst_addr, &buf),
    }
}

#[cfg(not(test))]
fn alloc_sector_buf(_len: usize) -> [u8; 0] {
    unreachable!("sector copy requires a HAL-sized on-stack buffer")
}

#[cfg(test)]
fn alloc_sector_buf(len: usize) -> std::vec::Vec<u8> {
    std::vec![0u8; len]
}
