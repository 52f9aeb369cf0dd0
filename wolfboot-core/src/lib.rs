#![cfg_attr(not(test), no_std)]

//! Micro-architecture agnostic secure bootloader core: image
//! authentication, power-fail-safe partition swapping, and update
//! rollback.
//!
//! The crate is organized the way the update flow itself is organized,
//! bottom-up: [`flash`] (C1) is the only thing that touches a byte of
//! physical storage; [`header`] (C2) and [`image`] (C3) interpret and
//! authenticate an image sitting in one; [`trailer`] (C4) persists swap
//! progress across resets; [`keystore`] (C5) and [`crypto`] supply the key
//! material and verification backends C3 calls into; [`encrypt`] (C6)
//! makes a partition transparent-at-rest; [`delta`] (C7) reconstructs a
//! full image from a patch; [`update`] (C8) drives the sector swap;
//! [`boot`] (C9) is the entry point an integrator's `main` calls into.

pub mod boot;
pub mod crypto;
pub mod delta;
pub mod encrypt;
pub mod error;
pub mod flash;
pub mod geometry;
pub mod header;
pub mod image;
pub mod keystore;
pub mod trailer;
pub mod update;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{Result, WolfBootError};
pub use geometry::{Geometry, PartId};

use flash::FlashDevice;
use trailer::PartitionState;
use update::{Config, Engine};

/// Convenience re-export of the handful of calls an integrator's
/// application (not the bootloader itself) needs: checking versions,
/// arming an update, and confirming one. Everything else in this crate is
/// the bootloader's own concern.
pub struct UpdateHandle {
    engine: Engine,
}

impl UpdateHandle {
    pub fn new(geom: Geometry, config: Config) -> Result<Self> {
        Ok(UpdateHandle {
            engine: Engine::new(geom, config)?,
        })
    }

    pub fn current_firmware_version(&self, boot_dev: &dyn FlashDevice) -> Result<u32> {
        self.engine.current_firmware_version(boot_dev)
    }

    pub fn update_firmware_version(&self, update_dev: &dyn FlashDevice) -> Result<u32> {
        self.engine.update_firmware_version(update_dev)
    }

    pub fn get_image_version(&self, dev: &dyn FlashDevice, part: PartId) -> Result<u32> {
        match part {
            PartId::Boot => self.engine.current_firmware_version(dev),
            PartId::Update => self.engine.update_firmware_version(dev),
            PartId::Swap => Err(WolfBootError::InvalidState),
        }
    }

    pub fn get_image_type(&self, dev: &dyn FlashDevice, part: PartId) -> Result<u16> {
        let mut hdr = [0u8; geometry::IMAGE_HEADER_SIZE];
        let geom = self.geom();
        dev.read_at(geom.base_of(part), &mut hdr)?;
        Ok(image::open_image(&hdr)?.img_type)
    }

    pub fn get_partition_state(
        &self,
        dev: &mut dyn FlashDevice,
        part: PartId,
        scratch: &mut [u8],
    ) -> Result<PartitionState> {
        self.engine.get_partition_state(dev, part, scratch)
    }

    pub fn set_partition_state(
        &self,
        dev: &mut dyn FlashDevice,
        part: PartId,
        state: PartitionState,
        scratch: &mut [u8],
    ) -> Result<()> {
        self.engine.set_partition_state(dev, part, state, scratch)
    }

    pub fn update_trigger(&self, update_dev: &mut dyn FlashDevice, scratch: &mut [u8]) -> Result<()> {
        self.engine.update_trigger(update_dev, scratch)
    }

    pub fn success(&self, boot_dev: &mut dyn FlashDevice, scratch: &mut [u8]) -> Result<()> {
        self.engine.success(boot_dev, scratch)
    }

    pub fn erase_partition(&self, dev: &mut dyn FlashDevice, part: PartId, scratch: &mut [u8]) -> Result<()> {
        self.engine.erase_partition(dev, part, scratch)
    }

    fn geom(&self) -> Geometry {
        // Engine keeps its own copy; UpdateHandle has no private fields to
        // read it from directly, so this mirrors it back out via a getter
        // rather than duplicating the field.
        self.engine.geometry()
    }
}
