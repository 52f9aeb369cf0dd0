//! Flash geometry: sector size, partition size and the addresses of the
//! BOOT / UPDATE / SWAP partitions.
//!
//! The upstream bootloader bakes these into `target.h` per board, selected
//! at compile time by a board feature. A hosted test harness needs to drive
//! many different geometries (and the property tests in [`crate::trailer`]
//! need a tiny one), so here geometry is a runtime value threaded through
//! every component instead of a set of `pub const`s. Firmware builds still
//! get a single, fixed [`Geometry`] - constructed once in `boot::init` from
//! board-specific constants supplied by the integrator.

pub const IMAGE_HEADER_SIZE: usize = 0x100;
pub const IMAGE_HEADER_OFFSET: usize = 0x8;

/// Enumerates the three logical partitions the update engine knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartId {
    Boot,
    Update,
    Swap,
}

/// Flash layout for one boot/update engine instance.
///
/// `sector_size` must divide `partition_size` evenly, and `partition_size`
/// must be large enough to hold at least one header plus the trailer
/// overhead ([`crate::trailer::trailer_overhead`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub sector_size: usize,
    pub partition_size: usize,
    pub boot_base: usize,
    pub update_base: usize,
    pub swap_base: usize,
}

impl Geometry {
    pub fn new(
        sector_size: usize,
        partition_size: usize,
        boot_base: usize,
        update_base: usize,
        swap_base: usize,
    ) -> Self {
        Geometry {
            sector_size,
            partition_size,
            boot_base,
            update_base,
            swap_base,
        }
    }

    pub fn base_of(&self, part: PartId) -> usize {
        match part {
            PartId::Boot => self.boot_base,
            PartId::Update => self.update_base,
            PartId::Swap => self.swap_base,
        }
    }

    pub fn fw_base(&self, part: PartId) -> usize {
        self.base_of(part) + IMAGE_HEADER_SIZE
    }

    /// Number of update-unit sectors in a BOOT/UPDATE sized partition.
    pub fn sectors_per_partition(&self) -> usize {
        self.partition_size / self.sector_size
    }

    pub fn max_payload_size(&self, trailer_overhead: usize) -> usize {
        self.partition_size - IMAGE_HEADER_SIZE - trailer_overhead
    }
}
