//! Slot snapshot and the post-update filesystem merge.
//!
//! A snapshot duplicates the active slot into the inactive one so a known
//! good baseline exists before risky operations (an in-place bootloader
//! rewrite, most notably). The merge runs on the first boot after an update
//! and carries user-writable filesystem entries from the previous image to
//! the new one.

use embedded_storage::nor_flash::NorFlash;
use log::{debug, error, info};

use crate::boot::{BOOT_F_MERGE_FS, BootConfigStore};
use crate::checksum::{compute_sha1, verify_sha1};
use crate::layout::FlashLayout;
use crate::ports::{Filesystem, Watchdog};
use crate::writer::{FlashError, FlashWriter};

/// Flash-to-flash copy window: 128 words, one watchdog feed per window.
const COPY_WINDOW: usize = 512;

const OLD_FS_LABEL: &str = "oldroot";
const OLD_FS_MOUNTPOINT: &str = "/old";
const ROOT_MOUNTPOINT: &str = "/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SnapshotError {
    /// Boot config unreadable.
    State,
    FwCopy,
    FsCopy,
    Persist,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ApplyError {
    Mount,
    Merge,
    Persist,
}

/// Copy `[src, src + len)` to `[dst, dst + len)`, skipping the copy when the
/// destination already carries the same bytes. The destination digest is
/// checked critically afterwards.
pub fn copy_region<F: NorFlash, W: Watchdog>(
    flash: &mut F,
    wdt: &mut W,
    layout: &FlashLayout,
    src: u32,
    dst: u32,
    len: u32,
) -> Result<(), FlashError> {
    let cs = compute_sha1(flash, wdt, src, len)?;
    let cs = core::str::from_utf8(&cs).unwrap_or("");
    if verify_sha1(flash, wdt, dst, len, cs, false).unwrap_or(false) {
        debug!("Skip copying {} @ {:#x} -> {:#x} (digest matches)", len, src, dst);
        return Ok(());
    }
    debug!("Copy {} @ {:#x} -> {:#x} ({})", len, src, dst, cs);

    let mut writer = FlashWriter::new(dst, len.next_multiple_of(layout.page_size), layout)?;
    writer.set_limit(len)?;
    let mut buf = [0u8; COPY_WINDOW];
    let mut offset = 0u32;
    while offset < len {
        let n = ((len - offset) as usize).min(COPY_WINDOW);
        flash
            .read(src + offset, &mut buf[..n])
            .map_err(|_| FlashError::Read)?;
        let consumed = writer.write(flash, &buf[..n])?;
        if consumed < n {
            // Flush the sub-word remainder of the last window.
            writer.finish(flash, &buf[consumed..n])?;
        }
        offset += n as u32;
        wdt.feed();
    }
    if !verify_sha1(flash, wdt, dst, len, cs, true)? {
        return Err(FlashError::Verify);
    }
    Ok(())
}

/// Duplicate the active slot's firmware and filesystem into the inactive
/// slot and record its layout in the boot config, without switching `active`.
/// Returns the snapshot slot.
pub fn create_snapshot<F: NorFlash, W: Watchdog>(
    flash: &mut F,
    wdt: &mut W,
    layout: &FlashLayout,
) -> Result<u8, SnapshotError> {
    let store = BootConfigStore::new(layout);
    let mut cfg = store.load(flash).map_err(|_| SnapshotError::State)?;
    let rsi = cfg.slot_info(layout, cfg.active);
    let wsi = cfg.slot_info(layout, cfg.active ^ 1);
    info!(
        "Snapshot: {} -> {}, FW: {:#x} ({}) -> {:#x}, FS: {:#x} ({}) -> {:#x}",
        rsi.id, wsi.id, rsi.fw_addr, rsi.fw_size, wsi.fw_addr, rsi.fs_addr, rsi.fs_size, wsi.fs_addr
    );
    copy_region(flash, wdt, layout, rsi.fw_addr, wsi.fw_addr, rsi.fw_size)
        .map_err(|_| SnapshotError::FwCopy)?;
    copy_region(flash, wdt, layout, rsi.fs_addr, wsi.fs_addr, rsi.fs_size)
        .map_err(|_| SnapshotError::FsCopy)?;

    let slot = usize::from(wsi.id);
    cfg.roms[slot] = wsi.fw_addr;
    cfg.roms_sizes[slot] = rsi.fw_size;
    cfg.fs_addresses[slot] = wsi.fs_addr;
    cfg.fs_sizes[slot] = rsi.fs_size;
    store
        .store(flash, &cfg)
        .map_err(|_| SnapshotError::Persist)?;
    info!("Snapshot created");
    Ok(wsi.id)
}

/// First-boot-after-update step: when the merge flag is set, mount the
/// previous slot's filesystem read-only and carry its entries into the new
/// one, then clear the flag. Returns whether a merge ran.
pub fn apply_update<F: NorFlash, V: Filesystem>(
    flash: &mut F,
    layout: &FlashLayout,
    fs: &mut V,
) -> Result<bool, ApplyError> {
    let store = BootConfigStore::new(layout);
    let mut cfg = store.load(flash).map_err(|_| ApplyError::Persist)?;
    if cfg.user_flags & BOOT_F_MERGE_FS == 0 {
        return Ok(false);
    }
    let old_fs_addr = cfg.fs_addresses[usize::from(cfg.previous)];
    let old_fs_size = cfg.fs_sizes[usize::from(cfg.previous)];
    info!("Mounting old FS: {} @ {:#x}", old_fs_size, old_fs_addr);
    if fs
        .mount(old_fs_addr, old_fs_size, OLD_FS_LABEL, OLD_FS_MOUNTPOINT)
        .is_err()
    {
        error!("Update failed: cannot mount previous file system");
        return Err(ApplyError::Mount);
    }

    let merged = fs.merge_dirs(OLD_FS_MOUNTPOINT, ROOT_MOUNTPOINT);
    let _ = fs.umount(OLD_FS_MOUNTPOINT);
    merged.map_err(|_| ApplyError::Merge)?;

    cfg.user_flags &= !BOOT_F_MERGE_FS;
    store.store(flash, &cfg).map_err(|_| ApplyError::Persist)?;
    Ok(true)
}
