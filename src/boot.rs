//! Persistent boot configuration and the commit/revert controller.
//!
//! The bootloader owns the on-flash record; the updater only ever touches it
//! through [`BootConfigStore`]. Writing the config is the single
//! transactional step of an update: until it lands, the previously active
//! slot keeps booting.

use bytemuck::{Pod, Zeroable};
use embedded_storage::nor_flash::{NorFlash, ReadNorFlash};
use log::{debug, info};

use crate::layout::FlashLayout;

/// `user_flags` bit: merge the previous filesystem into the new one at the
/// next apply.
pub const BOOT_F_MERGE_FS: u32 = 1 << 0;

const BOOT_CONFIG_MAGIC: u32 = u32::from_le_bytes(*b"btcf");
const BOOT_CONFIG_VERSION: u16 = 1;

/// On-flash form of the config. Field order is part of the format.
#[derive(Debug, Clone, Copy, Zeroable, Pod)]
#[repr(C)]
struct PersistentBootConfig {
    magic: u32,
    version: u16,
    active: u8,
    previous: u8,
    fw_updated: u8,
    is_first_boot: u8,
    boot_attempts: u8,
    _padding: u8,
    user_flags: u32,
    roms: [u32; 2],
    roms_sizes: [u32; 2],
    fs_addresses: [u32; 2],
    fs_sizes: [u32; 2],
}

const CONFIG_LEN: usize = core::mem::size_of::<PersistentBootConfig>();

/// In-memory view of the boot config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootConfig {
    /// Slot chosen at next boot.
    pub active: u8,
    /// Slot to revert to.
    pub previous: u8,
    /// A new image was written and has not been committed yet.
    pub fw_updated: bool,
    /// First boot after an update.
    pub is_first_boot: bool,
    /// Incremented by the bootloader on every attempt.
    pub boot_attempts: u8,
    pub user_flags: u32,
    pub roms: [u32; 2],
    pub roms_sizes: [u32; 2],
    pub fs_addresses: [u32; 2],
    pub fs_sizes: [u32; 2],
}

impl BootConfig {
    /// Freshly provisioned config: slot 0 active and committed, slot
    /// addresses mirrored from the layout, no images recorded.
    pub fn initial(layout: &FlashLayout) -> Self {
        Self {
            active: 0,
            previous: 1,
            fw_updated: false,
            is_first_boot: false,
            boot_attempts: 0,
            user_flags: 0,
            roms: [layout.slots[0].fw_addr, layout.slots[1].fw_addr],
            roms_sizes: [0; 2],
            fs_addresses: [layout.slots[0].fs_addr, layout.slots[1].fs_addr],
            fs_sizes: [0; 2],
        }
    }

    /// Merge the immutable layout of slot `id` with the sizes recorded here.
    pub fn slot_info(&self, layout: &FlashLayout, id: u8) -> SlotInfo {
        let slot = layout.slot(id);
        SlotInfo {
            id,
            fw_addr: slot.fw_addr,
            fw_cap: slot.fw_cap,
            fw_size: self.roms_sizes[id as usize],
            fs_addr: slot.fs_addr,
            fs_cap: slot.fs_cap,
            fs_size: self.fs_sizes[id as usize],
        }
    }
}

impl From<PersistentBootConfig> for BootConfig {
    fn from(raw: PersistentBootConfig) -> Self {
        Self {
            active: raw.active,
            previous: raw.previous,
            fw_updated: raw.fw_updated != 0,
            is_first_boot: raw.is_first_boot != 0,
            boot_attempts: raw.boot_attempts,
            user_flags: raw.user_flags,
            roms: raw.roms,
            roms_sizes: raw.roms_sizes,
            fs_addresses: raw.fs_addresses,
            fs_sizes: raw.fs_sizes,
        }
    }
}

impl From<BootConfig> for PersistentBootConfig {
    fn from(cfg: BootConfig) -> Self {
        Self {
            magic: BOOT_CONFIG_MAGIC,
            version: BOOT_CONFIG_VERSION,
            active: cfg.active,
            previous: cfg.previous,
            fw_updated: cfg.fw_updated.into(),
            is_first_boot: cfg.is_first_boot.into(),
            boot_attempts: cfg.boot_attempts,
            _padding: 0,
            user_flags: cfg.user_flags,
            roms: cfg.roms,
            roms_sizes: cfg.roms_sizes,
            fs_addresses: cfg.fs_addresses,
            fs_sizes: cfg.fs_sizes,
        }
    }
}

/// One slot as the update driver sees it: immutable addresses plus the
/// current image sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SlotInfo {
    pub id: u8,
    pub fw_addr: u32,
    pub fw_cap: u32,
    pub fw_size: u32,
    pub fs_addr: u32,
    pub fs_cap: u32,
    pub fs_size: u32,
}

/// Boot state as external callers see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BootState {
    pub active: u8,
    pub revert: u8,
    pub is_committed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BootError {
    Read,
    Write,
    Erase,
    /// Bad magic, version or slot index on flash.
    Invalid,
    BadSlot,
}

/// Accessor for the boot-config page.
#[derive(Debug)]
pub struct BootConfigStore {
    addr: u32,
}

impl BootConfigStore {
    pub const fn new(layout: &FlashLayout) -> Self {
        Self {
            addr: layout.boot_config_addr,
        }
    }

    pub fn load<F: ReadNorFlash>(&self, flash: &mut F) -> Result<BootConfig, BootError> {
        let mut buf = [0u8; CONFIG_LEN];
        flash
            .read(self.addr, &mut buf)
            .map_err(|_| BootError::Read)?;
        let raw: PersistentBootConfig = bytemuck::pod_read_unaligned(&buf);
        if raw.magic != BOOT_CONFIG_MAGIC || raw.version != BOOT_CONFIG_VERSION {
            return Err(BootError::Invalid);
        }
        if raw.active > 1 || raw.previous > 1 {
            return Err(BootError::Invalid);
        }
        Ok(raw.into())
    }

    pub fn store<F: NorFlash>(&self, flash: &mut F, cfg: &BootConfig) -> Result<(), BootError> {
        let raw = PersistentBootConfig::from(*cfg);
        flash
            .erase(self.addr, self.addr + F::ERASE_SIZE as u32)
            .map_err(|_| BootError::Erase)?;
        flash
            .write(self.addr, bytemuck::bytes_of(&raw))
            .map_err(|_| BootError::Write)?;
        Ok(())
    }

    pub fn get_state<F: ReadNorFlash>(&self, flash: &mut F) -> Result<BootState, BootError> {
        let cfg = self.load(flash)?;
        debug!(
            "cur {} prev {} fwu {}",
            cfg.active, cfg.previous, cfg.fw_updated
        );
        Ok(BootState {
            active: cfg.active,
            revert: cfg.previous,
            is_committed: !cfg.fw_updated,
        })
    }

    /// Write the external view back. Boot attempts and user flags are reset.
    pub fn set_state<F: NorFlash>(&self, flash: &mut F, state: &BootState) -> Result<(), BootError> {
        if state.active > 1 || state.revert > 1 {
            return Err(BootError::BadSlot);
        }
        let mut cfg = self.load(flash)?;
        cfg.active = state.active;
        cfg.previous = state.revert;
        cfg.fw_updated = !state.is_committed;
        cfg.is_first_boot = !state.is_committed;
        cfg.boot_attempts = 0;
        cfg.user_flags = 0;
        info!(
            "cur {} prev {} fwu {}",
            cfg.active, cfg.previous, cfg.fw_updated
        );
        self.store(flash, &cfg)
    }

    /// Acknowledge the running image as healthy. No-op once committed.
    ///
    /// Only the commit bits are touched, so a still-pending filesystem merge
    /// survives an early commit.
    pub fn commit<F: NorFlash>(&self, flash: &mut F) -> Result<bool, BootError> {
        let mut cfg = self.load(flash)?;
        if !cfg.fw_updated {
            return Ok(false);
        }
        info!("Committing slot {}", cfg.active);
        cfg.fw_updated = false;
        cfg.is_first_boot = false;
        self.store(flash, &cfg)?;
        Ok(true)
    }

    /// Swap back to the previous slot. No-op once committed; the caller
    /// reboots after a successful swap.
    pub fn revert<F: NorFlash>(&self, flash: &mut F) -> Result<bool, BootError> {
        let state = self.get_state(flash)?;
        if state.is_committed {
            return Ok(false);
        }
        let next = BootState {
            active: state.revert,
            revert: state.active,
            is_committed: true,
        };
        info!("Update failed, reverting to slot {}", next.active);
        self.set_state(flash, &next)?;
        Ok(true)
    }

    pub fn is_first_boot<F: ReadNorFlash>(&self, flash: &mut F) -> Result<bool, BootError> {
        Ok(self.load(flash)?.is_first_boot)
    }
}
