//! # Dual-Slot OTA Update Core
//!
//! `ota-core` is a `no_std` compatible engine for over-the-air firmware
//! updates on dual-slot devices with a small external bootloader.
//!
//! ## Core Features
//!
//! - **Streaming ingestion:** package files arrive in arbitrary network-sized
//!   chunks and are written straight to the inactive slot with word-aligned,
//!   erase-before-write flash discipline.
//! - **Content-addressed verification:** every component carries a SHA-1
//!   digest; images already present in flash are skipped, freshly written
//!   ones are verified before the update can complete.
//! - **Power-fail safety:** the boot config write at the end of `finalize` is
//!   the single transactional step. A crash at any earlier point leaves the
//!   device booting the old image.
//! - **Two-step commit:** the first boot of a new image must be committed
//!   within a timeout carried across the reboot, otherwise the device reverts
//!   to the previous slot.
//! - **Hardware agnostic:** all flash access goes through the
//!   [`embedded-storage`](https://docs.rs/embedded-storage) traits; watchdog
//!   and filesystem are small ports, so the whole core runs under `cargo
//!   test` against an in-memory flash.
//!
//! ## Usage
//!
//! The transport layer unpacks the archive and drives one file at a time:
//!
//! ```no_run
//! use ota_core::ports::NoWatchdog;
//! use ota_core::{FileAction, FlashLayout, Manifest, SlotLayout, UpdateDriver};
//!
//! # fn run<F: embedded_storage::nor_flash::NorFlash>(
//! #     flash: &mut F,
//! # ) -> Result<(), ota_core::UpdateError> {
//! let layout = FlashLayout {
//!     page_size: 0x1000,
//!     boot_addr: 0,
//!     boot_config_addr: 0x1000,
//!     slots: [
//!         SlotLayout { fw_addr: 0x2000, fw_cap: 0x8000, fs_addr: 0xA000, fs_cap: 0x8000 },
//!         SlotLayout { fw_addr: 0x1_2000, fw_cap: 0x8000, fs_addr: 0x1_A000, fs_cap: 0x8000 },
//!     ],
//! };
//! let manifest = Manifest::from_json(
//!     r#"{"fw": {"src": "fw.bin", "cs_sha1": "da39a3ee5e6b4b0d3255bfef95601890afd80709"},
//!         "fs": {"src": "fs.bin", "addr": 40960,
//!                "cs_sha1": "da39a3ee5e6b4b0d3255bfef95601890afd80709"}}"#,
//! )
//! .map_err(|_| ota_core::UpdateError::InvalidManifest)?;
//!
//! let mut update = UpdateDriver::begin(flash, NoWatchdog, layout, &manifest)?;
//! if update.file_begin("fw.bin", 8)? == FileAction::Process {
//!     let data = [0u8; 8];
//!     let consumed = update.file_data(&data)?;
//!     update.file_end(&data[consumed..])?;
//! }
//! // ... remaining files ...
//! update.finalize()?;
//! # Ok(())
//! # }
//! ```
//!
//! After the reboot the new image checks [`boot::BootConfigStore::is_first_boot`],
//! runs [`snapshot::apply_update`] to merge the previous filesystem, and calls
//! [`boot::BootConfigStore::commit`] once it considers itself healthy.

#![cfg_attr(not(test), no_std)]

pub mod boot;
pub mod checksum;
pub mod layout;
pub mod manifest;
pub mod ports;
pub mod record;
pub mod snapshot;
pub mod status;
pub mod update;
pub mod writer;

#[cfg(test)]
mod mem_flash;

// Pull in the std critical-section implementation for the status cell.
#[cfg(test)]
use critical_section as _;

// Re-export key types for easier access at the crate root.
pub use boot::{BOOT_F_MERGE_FS, BootConfig, BootConfigStore, BootState};
pub use layout::{FlashLayout, SlotLayout};
pub use manifest::Manifest;
pub use record::{CommitWindow, UpdateRecord};
pub use snapshot::{apply_update, create_snapshot};
pub use status::{OtaState, OtaStatus};
pub use update::{FileAction, UpdateDriver, UpdateError, update_in_progress};
