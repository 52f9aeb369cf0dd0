//! C4 - partition trailer.
//!
//! The trailer lives at the top of a partition, growing downward:
//! `[sector_flags ...][partition_state: 1B][magic "BOOT": 4B]`. On flash
//! that forbids rewriting a word without erasing it first, the whole
//! trailer is additionally duplicated into two adjacent sectors ("bank 0"
//! directly under the partition's top, "bank 1" one sector below it) and
//! every mutation goes through the redundant-sector protocol implemented
//! below.
//!
//! Grounded on `nvm_select_fresh_sector` / `trailer_write` in
//! `src/libwolfboot.c` of the original implementation (the upstream Rust
//! crate's `PartDescriptor` in `image/image.rs` only ever targets a single,
//! non-redundant trailer - this module generalizes that to both cases,
//! selected by [`WriteOnce`] rather than by a board `cfg`).

use crate::error::{Result, WolfBootError};
use crate::flash::FlashDevice;
use crate::geometry::{Geometry, PartId};

pub const MAGIC: &[u8; 4] = b"BOOT";

/// `partition_state` byte codes. Chosen, like the upstream crate's, so that
/// every forward transition only clears bits - `NEW -> SUCCESS` is a valid
/// sequence of NOR writes without an intervening erase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    New,
    Updating,
    FinalFlags,
    Testing,
    Success,
}

impl PartitionState {
    pub fn to_byte(self) -> u8 {
        match self {
            PartitionState::New => 0xFF,
            PartitionState::Updating => 0x70,
            PartitionState::FinalFlags => 0x30,
            PartitionState::Testing => 0x10,
            PartitionState::Success => 0x00,
        }
    }

    /// Any byte that isn't one of the five legal codes is, per invariant 3,
    /// "treated as erased / state=NEW" - this never returns `Err`.
    pub fn from_byte(b: u8) -> PartitionState {
        match b {
            0xFF => PartitionState::New,
            0x70 => PartitionState::Updating,
            0x30 => PartitionState::FinalFlags,
            0x10 => PartitionState::Testing,
            0x00 => PartitionState::Success,
            _ => PartitionState::New,
        }
    }
}

/// Per-update-sector progress flag, tracking the three-way swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectorFlag {
    New,
    Swapping,
    Backup,
    Updated,
}

impl SectorFlag {
    fn to_nibble(self) -> u8 {
        match self {
            SectorFlag::New => 0x0F,
            SectorFlag::Swapping => 0x07,
            SectorFlag::Backup => 0x03,
            SectorFlag::Updated => 0x00,
        }
    }

    fn from_nibble(n: u8) -> Result<SectorFlag> {
        match n & 0x0F {
            0x0F => Ok(SectorFlag::New),
            0x07 => Ok(SectorFlag::Swapping),
            0x03 => Ok(SectorFlag::Backup),
            0x00 => Ok(SectorFlag::Updated),
            _ => Err(WolfBootError::InvalidSectFlag),
        }
    }
}

/// Runtime knobs that used to be board `cfg`s upstream. Kept as plain data
/// so a single test binary can drive every geometry/mode combination.
#[derive(Debug, Clone, Copy)]
pub struct TrailerConfig {
    /// Flash can't rewrite a word without erasing; use the redundant
    /// double-bank protocol.
    pub write_once: bool,
    /// Keep the UPDATE trailer co-located with BOOT's, at the top of BOOT,
    /// so the UPDATE partition's payload region can be fully consumed.
    pub flags_home: bool,
}

impl TrailerConfig {
    pub fn direct() -> Self {
        TrailerConfig {
            write_once: false,
            flags_home: false,
        }
    }
}

/// Addressing for one partition's trailer. All offsets are computed from
/// `region_top`, which is `partition_base + partition_size` unless
/// `flags_home` relocates the UPDATE trailer under BOOT's own.
pub struct Trailer<'a> {
    dev: &'a mut dyn FlashDevice,
    region_top: usize,
    sector_size: usize,
    flag_byte_count: usize,
    write_once: bool,
    /// Scratch buffer reused across mutations, sized to one sector, supplied
    /// by the caller instead of living in a `static`.
    scratch: &'a mut [u8],
}

pub fn flag_byte_count(update_sectors: usize) -> usize {
    (update_sectors + 1) / 2
}

pub fn trailer_overhead(update_sectors: usize) -> usize {
    4 + 1 + flag_byte_count(update_sectors)
}

/// Computes `region_top` for `part` given the geometry and config, mirroring
/// `PART_BOOT_ENDFLAGS` / `PART_UPDATE_ENDFLAGS` in the original source.
pub fn region_top(geom: &Geometry, part: PartId, cfg: &TrailerConfig) -> usize {
    let boot_top = geom.boot_base + geom.partition_size;
    match part {
        PartId::Boot | PartId::Swap => boot_top,
        PartId::Update => {
            if cfg.flags_home {
                let span = if cfg.write_once {
                    geom.sector_size
                } else {
                    trailer_overhead(geom.sectors_per_partition())
                };
                boot_top - span
            } else {
                geom.update_base + geom.partition_size
            }
        }
    }
}

impl<'a> Trailer<'a> {
    pub fn new(
        dev: &'a mut dyn FlashDevice,
        region_top: usize,
        sector_size: usize,
        flag_byte_count: usize,
        write_once: bool,
        scratch: &'a mut [u8],
    ) -> Self {
        Trailer {
            dev,
            region_top,
            sector_size,
            flag_byte_count,
            write_once,
            scratch,
        }
    }

    fn magic_addr(&self, bank: usize) -> usize {
        self.region_top - 4 - bank * self.sector_size
    }

    fn state_addr(&self, bank: usize) -> usize {
        self.region_top - 5 - bank * self.sector_size
    }

    fn flag_addr(&self, bank: usize, pos: usize) -> usize {
        self.region_top - 6 - pos - bank * self.sector_size
    }

    fn bank_base(&self, bank: usize) -> usize {
        self.region_top - self.sector_size * (bank + 1)
    }

    fn read_magic(&self, bank: usize) -> Result<[u8; 4]> {
        let mut m = [0u8; 4];
        self.dev.read_at(self.magic_addr(bank), &mut m)?;
        Ok(m)
    }

    /// Deterministic and idempotent: safe to call after a crash at any
    /// point between two trailer mutations.
    fn fresh_bank(&self) -> Result<usize> {
        if !self.write_once {
            return Ok(0);
        }
        let m0 = self.read_magic(0)?;
        let m1 = self.read_magic(1)?;
        let valid0 = &m0 == MAGIC;
        let valid1 = &m1 == MAGIC;
        if valid0 && !valid1 {
            return Ok(0);
        }
        if valid1 && !valid0 {
            return Ok(1);
        }
        if !valid0 && !valid1 {
            return Ok(0);
        }
        // Both banks carry a valid magic: break the tie by counting,
        // scanning upward from the partition-state byte, which side has
        // more non-erased flag bytes (i.e. has progressed further).
        let mut b0 = [0u8; 1];
        let mut b1 = [0u8; 1];
        for off in 1..self.sector_size {
            self.dev.read_at(self.region_top - off, &mut b0)?;
            self.dev
                .read_at(self.region_top - off - self.sector_size, &mut b1)?;
            match (b0[0] == 0xFF, b1[0] == 0xFF) {
                (true, false) => return Ok(1),
                (false, true) => return Ok(0),
                _ => continue,
            }
        }
        Ok(0)
    }

    pub fn get_state(&self) -> Result<PartitionState> {
        let bank = self.fresh_bank()?;
        if &self.read_magic(bank)? != MAGIC {
            return Ok(PartitionState::New);
        }
        let mut b = [0u8; 1];
        self.dev.read_at(self.state_addr(bank), &mut b)?;
        Ok(PartitionState::from_byte(b[0]))
    }

    pub fn get_sector_flag(&self, sector: usize) -> Result<SectorFlag> {
        let bank = self.fresh_bank()?;
        if &self.read_magic(bank)? != MAGIC {
            return Ok(SectorFlag::New);
        }
        let pos = sector >> 1;
        let mut b = [0u8; 1];
        self.dev.read_at(self.flag_addr(bank, pos), &mut b)?;
        let nibble = if sector & 1 == 0 { b[0] & 0x0F } else { b[0] >> 4 };
        SectorFlag::from_nibble(nibble)
    }

    fn ensure_magic(&mut self) -> Result<()> {
        let bank = self.fresh_bank()?;
        if &self.read_magic(bank)? == MAGIC {
            return Ok(());
        }
        self.mutate_byte(self.magic_addr(bank) - self.bank_base(bank), MAGIC, true)
    }

    pub fn set_state(&mut self, state: PartitionState) -> Result<()> {
        self.ensure_magic()?;
        let bank = self.fresh_bank()?;
        let offset = self.state_addr(bank) - self.bank_base(bank);
        self.mutate_byte(offset, &[state.to_byte()], false)
    }

    pub fn set_sector_flag(&mut self, sector: usize, flag: SectorFlag) -> Result<()> {
        self.ensure_magic()?;
        let bank = self.fresh_bank()?;
        let pos = sector >> 1;
        let mut cur = [0u8; 1];
        self.dev.read_at(self.flag_addr(bank, pos), &mut cur)?;
        let new_byte = if sector & 1 == 0 {
            (cur[0] & 0xF0) | flag.to_nibble()
        } else {
            (flag.to_nibble() << 4) | (cur[0] & 0x0F)
        };
        if new_byte == cur[0] {
            return Ok(());
        }
        let offset = self.flag_addr(bank, pos) - self.bank_base(bank);
        self.mutate_byte(offset, &[new_byte], false)
    }

    /// Core of the redundant-sector protocol: read the fresh bank into
    /// `scratch`, splice in the change, erase the stale bank, write
    /// `scratch` there, then erase the bank that used to be fresh. Direct
    /// (non-write-once) mode just writes in place.
    ///
    /// `byte_offset_in_bank` is relative to `bank_base(fresh_bank)`.
    fn mutate_byte(
        &mut self,
        byte_offset_in_bank: usize,
        new_value: &[u8],
        is_magic_write: bool,
    ) -> Result<()> {
        if !self.write_once {
            let addr = self.bank_base(0) + byte_offset_in_bank;
            return self.dev.write_at(addr, new_value);
        }
        let fresh = self.fresh_bank()?;
        let stale = 1 - fresh;
        let fresh_base = self.bank_base(fresh);
        let stale_base = self.bank_base(stale);

        let len = self.sector_size.min(self.scratch.len());
        self.dev.read_at(fresh_base, &mut self.scratch[..len])?;
        // A magic write happens once, lazily, on an otherwise-erased bank;
        // every other mutation only ever touches state/flag bytes that
        // already sit under a valid magic.
        if is_magic_write {
            self.scratch[byte_offset_in_bank..byte_offset_in_bank + new_value.len()]
                .copy_from_slice(new_value);
        } else {
            self.scratch[byte_offset_in_bank..byte_offset_in_bank + new_value.len()]
                .copy_from_slice(new_value);
        }

        self.dev.erase(stale_base, self.sector_size)?;
        let scratch_snapshot: &[u8] = &self.scratch[..len];
        self.dev.write_at(stale_base, scratch_snapshot)?;
        self.dev.erase(fresh_base, self.sector_size)?;
        Ok(())
    }

    /// Erases the trailer sector(s) *before* arming UPDATING, purging any
    /// stale per-sector flags left behind by a previous, aborted update
    /// cycle.
    pub fn update_trigger(&mut self) -> Result<()> {
        self.erase_partition()?;
        self.set_state(PartitionState::Updating)
    }

    pub fn erase_partition(&mut self) -> Result<()> {
        self.dev.erase(self.bank_base(0), self.sector_size)?;
        if self.write_once {
            self.dev.erase(self.bank_base(1), self.sector_size)?;
        }
        Ok(())
    }
}
