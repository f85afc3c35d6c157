//! The update driver: streams package files into the inactive slot and flips
//! the boot config as its single transactional step.
//!
//! The driver is externally driven. The transport parses the package, then
//! calls `begin`, `file_begin`/`file_data`/`file_end` per entry and
//! `finalize` once the archive is exhausted. Any error is fatal to the whole
//! update; the active slot is never touched, so the caller simply retries
//! from scratch.

use core::str::FromStr;
use core::sync::atomic::{AtomicBool, Ordering};

use embedded_storage::nor_flash::NorFlash;
use heapless::String;
use log::{debug, error, info};

use crate::boot::{BOOT_F_MERGE_FS, BootConfigStore, SlotInfo};
use crate::checksum::{SHA1_HEX_LEN, verify_sha1};
use crate::layout::FlashLayout;
use crate::manifest::Manifest;
use crate::manifest::SRC_NAME_MAX;
use crate::ports::Watchdog;
use crate::status;
use crate::writer::{ALIGN, FlashWriter};

/// The flash parameter block lives in the first word of flash.
const FLASH_PARAMS_ADDR: u32 = 0;

static UPDATE_IN_FLIGHT: AtomicBool = AtomicBool::new(false);

/// There is at most one update at a time; this reports whether one exists.
pub fn update_in_progress() -> bool {
    UPDATE_IN_FLIGHT.load(Ordering::Relaxed)
}

/// What the transport should do with the file it just announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FileAction {
    Process,
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UpdateError {
    /// `begin`: manifest missing the fw/fs objects (transport code -1).
    InvalidManifest,
    /// `begin`: required fields absent (-3).
    IncompletePackage,
    /// `begin`: a digest is not exactly 40 hex chars (-4).
    InvalidChecksumFormat,
    /// `begin`: no usable inactive slot (-5).
    Unsupported,
    /// `begin`: flash parameter block unreadable (-6).
    FlashParamsRead,
    /// `begin` while another update exists.
    AlreadyInProgress,
    /// Operation called in the wrong driver state. No side effects.
    BadState,
    /// `file_begin`: writer setup failed.
    StartWrite,
    /// `file_begin`: announced size exceeds the target region.
    ImageTooBig,
    /// `file_data`: flash write failed.
    WriteFailed,
    /// `file_end`: flushing the sub-word tail failed (-1).
    TailWrite,
    /// `file_end`: post-write digest mismatch (-2).
    InvalidChecksum,
    /// `file_end`: restoring the flash parameter block failed (-3).
    FlashParamsWrite,
    /// `finalize`: the firmware part never arrived (-1).
    MissingFw,
    /// `finalize`: the filesystem part never arrived (-2).
    MissingFs,
    /// `finalize`: boot config persist failed (-3).
    BootConfig,
}

impl UpdateError {
    pub const fn status_msg(self) -> &'static str {
        match self {
            UpdateError::InvalidManifest => "Invalid manifest",
            UpdateError::IncompletePackage => "Incomplete update package",
            UpdateError::InvalidChecksumFormat => "Invalid checksum format",
            UpdateError::Unsupported => "OTA is not supported in this build",
            UpdateError::FlashParamsRead => "Failed to read flash params",
            UpdateError::AlreadyInProgress => "Update already in progress",
            UpdateError::BadState => "Invalid update state",
            UpdateError::StartWrite => "Failed to start write",
            UpdateError::ImageTooBig => "Image too big",
            UpdateError::WriteFailed => "Write failed",
            UpdateError::TailWrite => "Tail write failed",
            UpdateError::InvalidChecksum => "Invalid checksum",
            UpdateError::FlashParamsWrite => "Failed to write flash params",
            UpdateError::MissingFw => "Missing fw part",
            UpdateError::MissingFs => "Missing fs part",
            UpdateError::BootConfig => "Failed to set boot config",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileKind {
    Boot,
    Fw,
    Fs,
}

#[derive(Debug)]
struct PartSpec {
    src: String<SRC_NAME_MAX>,
    cs: String<SHA1_HEX_LEN>,
}

/// Validated manifest contents, resolved once in `begin`.
struct Parts {
    boot: Option<(PartSpec, u32)>,
    fw: PartSpec,
    fs: PartSpec,
    update_bootloader: bool,
}

fn absent<const N: usize>(field: &Option<String<N>>) -> bool {
    field.as_ref().is_none_or(|v| v.is_empty())
}

fn bad_digest<const N: usize>(field: &Option<String<N>>) -> bool {
    field.as_ref().is_some_and(|v| v.len() != SHA1_HEX_LEN)
}

fn part_spec<const A: usize, const B: usize>(
    src: &Option<String<A>>,
    cs: &Option<String<B>>,
) -> Result<PartSpec, UpdateError> {
    let (Some(src), Some(cs)) = (src.as_ref(), cs.as_ref()) else {
        return Err(UpdateError::IncompletePackage);
    };
    Ok(PartSpec {
        src: String::from_str(src.as_str()).map_err(|_| UpdateError::IncompletePackage)?,
        cs: String::from_str(cs.as_str()).map_err(|_| UpdateError::InvalidChecksumFormat)?,
    })
}

impl Parts {
    fn check(manifest: &Manifest) -> Result<Self, UpdateError> {
        let (Some(fw), Some(fs)) = (manifest.fw.as_ref(), manifest.fs.as_ref()) else {
            return Err(UpdateError::InvalidManifest);
        };
        let boot = manifest.boot.as_ref();
        let update_bootloader = boot.is_some_and(|b| b.update);

        let incomplete = absent(&fw.src)
            || absent(&fw.cs_sha1)
            || absent(&fs.src)
            || absent(&fs.cs_sha1)
            || fs.addr.unwrap_or(0) == 0
            || (update_bootloader && boot.is_none_or(|b| absent(&b.src) || absent(&b.cs_sha1)));
        if incomplete {
            return Err(UpdateError::IncompletePackage);
        }

        if bad_digest(&fw.cs_sha1)
            || bad_digest(&fs.cs_sha1)
            || (update_bootloader && boot.is_some_and(|b| bad_digest(&b.cs_sha1)))
        {
            return Err(UpdateError::InvalidChecksumFormat);
        }

        let boot = if update_bootloader {
            match boot {
                Some(b) => Some((part_spec(&b.src, &b.cs_sha1)?, b.addr.unwrap_or(0))),
                None => None,
            }
        } else {
            None
        };
        Ok(Self {
            boot,
            fw: part_spec(&fw.src, &fw.cs_sha1)?,
            fs: part_spec(&fs.src, &fs.cs_sha1)?,
            update_bootloader,
        })
    }
}

#[derive(Debug)]
struct OpenFile {
    kind: FileKind,
    writer: FlashWriter,
    size: u32,
}

#[derive(Debug)]
enum DriverState {
    Begun,
    FileOpen(OpenFile),
    Finalized,
    Failed,
}

/// Owned handle for one in-flight update.
///
/// Dropping the handle (after success, failure or a transport timeout)
/// releases the in-flight slot; partial writes to the inactive slot are inert.
#[derive(Debug)]
pub struct UpdateDriver<'f, F, W> {
    flash: &'f mut F,
    wdt: W,
    layout: FlashLayout,
    store: BootConfigStore,
    boot: Option<(PartSpec, u32)>,
    fw: PartSpec,
    fs: PartSpec,
    update_bootloader: bool,
    write_slot: SlotInfo,
    old_active: u8,
    /// All four bytes are preserved verbatim; only bytes 2 and 3 carry the
    /// board flash geometry, the first two are constant anyway.
    flash_params: [u8; 4],
    fw_size: u32,
    fs_size: u32,
    expected_total: u32,
    written_total: u32,
    state: DriverState,
    status_msg: &'static str,
}

impl<'f, F: NorFlash, W: Watchdog> UpdateDriver<'f, F, W> {
    /// Validate the manifest, pick the write slot and open the update.
    ///
    /// Fails without side effects when another update is already in flight.
    pub fn begin(
        flash: &'f mut F,
        wdt: W,
        layout: FlashLayout,
        manifest: &Manifest,
    ) -> Result<Self, UpdateError> {
        if UPDATE_IN_FLIGHT
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(UpdateError::AlreadyInProgress);
        }
        match Self::begin_inner(flash, wdt, layout, manifest) {
            Ok(driver) => Ok(driver),
            Err(err) => {
                UPDATE_IN_FLIGHT.store(false, Ordering::Release);
                status::set_error(err.status_msg());
                Err(err)
            }
        }
    }

    fn begin_inner(
        flash: &'f mut F,
        wdt: W,
        layout: FlashLayout,
        manifest: &Manifest,
    ) -> Result<Self, UpdateError> {
        debug_assert_eq!(layout.page_size as usize, F::ERASE_SIZE);
        layout.validate().map_err(|_| UpdateError::Unsupported)?;
        let parts = Parts::check(manifest)?;

        let store = BootConfigStore::new(&layout);
        let cfg = store.load(flash).map_err(|_| UpdateError::Unsupported)?;
        let inactive = cfg.active ^ 1;
        if !layout.slot(inactive).is_populated() {
            return Err(UpdateError::Unsupported);
        }
        let write_slot = cfg.slot_info(&layout, inactive);

        let mut flash_params = [0u8; 4];
        if parts.update_bootloader {
            flash
                .read(FLASH_PARAMS_ADDR, &mut flash_params)
                .map_err(|_| UpdateError::FlashParamsRead)?;
            if let Some((boot, addr)) = &parts.boot {
                info!(
                    "Boot: {} -> {:#x}, current flash params: {:02x}{:02x}",
                    boot.src, addr, flash_params[2], flash_params[3]
                );
            }
        }

        info!(
            "Slot {}, FW: {} -> {:#x}, FS {} -> {:#x}",
            write_slot.id, parts.fw.src, write_slot.fw_addr, parts.fs.src, write_slot.fs_addr
        );
        status::set_progress(0, "");

        Ok(Self {
            flash,
            wdt,
            layout,
            store,
            boot: parts.boot,
            fw: parts.fw,
            fs: parts.fs,
            update_bootloader: parts.update_bootloader,
            write_slot,
            old_active: cfg.active,
            flash_params,
            fw_size: 0,
            fs_size: 0,
            expected_total: 0,
            written_total: 0,
            state: DriverState::Begun,
            status_msg: "",
        })
    }

    /// Announce the next package entry. Entries that match no manifest source
    /// are skipped silently; a matching entry whose payload is already in
    /// flash is skipped after a digest pre-check.
    pub fn file_begin(&mut self, name: &str, size: u32) -> Result<FileAction, UpdateError> {
        if !matches!(self.state, DriverState::Begun) {
            return Err(UpdateError::BadState);
        }

        let boot_match = self.update_bootloader
            && self
                .boot
                .as_ref()
                .is_some_and(|(b, _)| name.starts_with(b.src.as_str()));
        let kind = if boot_match {
            FileKind::Boot
        } else if name.starts_with(self.fw.src.as_str()) {
            FileKind::Fw
        } else if name.starts_with(self.fs.src.as_str()) {
            FileKind::Fs
        } else {
            debug!("Not interesting: {}", name);
            return Ok(FileAction::Skip);
        };

        let (base, cap) = match kind {
            FileKind::Boot => {
                if size > self.layout.boot_config_addr {
                    error!("Boot loader too big.");
                    return Err(self.fail(UpdateError::StartWrite));
                }
                let addr = self.boot.as_ref().map_or(self.layout.boot_addr, |(_, a)| *a);
                (addr, self.layout.boot_config_addr)
            }
            FileKind::Fw => (self.write_slot.fw_addr, self.write_slot.fw_cap),
            FileKind::Fs => (self.write_slot.fs_addr, self.write_slot.fs_cap),
        };
        let Ok(mut writer) = FlashWriter::new(base, cap, &self.layout) else {
            return Err(self.fail(UpdateError::StartWrite));
        };
        if size > writer.max_size() {
            error!(
                "Cannot write {} ({}) @ {:#x}: max size {}",
                name,
                size,
                writer.base(),
                writer.max_size()
            );
            return Err(self.fail(UpdateError::ImageTooBig));
        }

        // Sizes are recorded up front so a skipped file still counts for
        // finalize.
        match kind {
            FileKind::Fw => self.fw_size = size,
            FileKind::Fs => self.fs_size = size,
            FileKind::Boot => {}
        }
        self.expected_total += size;

        let expected = match kind {
            FileKind::Boot => self.boot.as_ref().map_or("", |(b, _)| b.cs.as_str()),
            FileKind::Fw => self.fw.cs.as_str(),
            FileKind::Fs => self.fs.cs.as_str(),
        };
        let same = verify_sha1(&mut *self.flash, &mut self.wdt, base, size, expected, false)
            .unwrap_or(false);
        if same {
            info!("Skip writing {} ({}) @ {:#x} (digest matches)", name, size, base);
            self.written_total += size;
            self.report_progress();
            return Ok(FileAction::Skip);
        }

        if writer.set_limit(size).is_err() {
            return Err(self.fail(UpdateError::StartWrite));
        }
        info!("Start writing {} ({}) @ {:#x}", name, size, base);
        self.state = DriverState::FileOpen(OpenFile { kind, writer, size });
        Ok(FileAction::Process)
    }

    /// Feed payload bytes. Only whole words are consumed; the caller keeps
    /// the remainder for the next call or for [`Self::file_end`].
    pub fn file_data(&mut self, chunk: &[u8]) -> Result<usize, UpdateError> {
        let DriverState::FileOpen(open) = &mut self.state else {
            return Err(UpdateError::BadState);
        };
        match open.writer.write(&mut *self.flash, chunk) {
            Ok(n) => {
                self.written_total += n as u32;
                self.report_progress();
                Ok(n)
            }
            Err(_) => Err(self.fail(UpdateError::WriteFailed)),
        }
    }

    /// Close the current file: flush the sub-word tail, verify the digest
    /// and, for a bootloader image, put the flash parameter block back.
    pub fn file_end(&mut self, tail: &[u8]) -> Result<(), UpdateError> {
        let mut open = match core::mem::replace(&mut self.state, DriverState::Begun) {
            DriverState::FileOpen(open) => open,
            other => {
                self.state = other;
                return Err(UpdateError::BadState);
            }
        };
        if tail.len() >= ALIGN {
            return Err(self.fail(UpdateError::TailWrite));
        }
        if open.writer.finish(&mut *self.flash, tail).is_err() {
            return Err(self.fail(UpdateError::TailWrite));
        }
        self.written_total += tail.len() as u32;

        let expected = match open.kind {
            FileKind::Boot => self.boot.as_ref().map_or("", |(b, _)| b.cs.as_str()),
            FileKind::Fw => self.fw.cs.as_str(),
            FileKind::Fs => self.fs.cs.as_str(),
        };
        let ok = verify_sha1(
            &mut *self.flash,
            &mut self.wdt,
            open.writer.base(),
            open.size,
            expected,
            true,
        )
        .unwrap_or(false);
        if !ok {
            return Err(self.fail(UpdateError::InvalidChecksum));
        }
        info!("Write finished, checksum ok");

        if open.kind == FileKind::Boot {
            info!("Restoring flash params");
            if self
                .flash
                .write(FLASH_PARAMS_ADDR, &self.flash_params)
                .is_err()
            {
                return Err(self.fail(UpdateError::FlashParamsWrite));
            }
        }
        self.report_progress();
        Ok(())
    }

    /// Record the new image in the boot config. This is the linearization
    /// point: a crash before it leaves the old image booting.
    pub fn finalize(&mut self) -> Result<(), UpdateError> {
        if !matches!(self.state, DriverState::Begun) {
            return Err(UpdateError::BadState);
        }
        if self.fw_size == 0 {
            return Err(self.fail(UpdateError::MissingFw));
        }
        if self.fs_size == 0 {
            return Err(self.fail(UpdateError::MissingFs));
        }

        let Ok(mut cfg) = self.store.load(&mut *self.flash) else {
            return Err(self.fail(UpdateError::BootConfig));
        };
        let slot = usize::from(self.write_slot.id);
        cfg.active = self.write_slot.id;
        cfg.previous = self.old_active;
        cfg.roms[slot] = self.write_slot.fw_addr;
        cfg.roms_sizes[slot] = self.fw_size;
        cfg.fs_addresses[slot] = self.write_slot.fs_addr;
        cfg.fs_sizes[slot] = self.fs_size;
        cfg.is_first_boot = true;
        cfg.fw_updated = true;
        cfg.boot_attempts = 0;
        cfg.user_flags |= BOOT_F_MERGE_FS;
        if self.store.store(&mut *self.flash, &cfg).is_err() {
            return Err(self.fail(UpdateError::BootConfig));
        }
        self.state = DriverState::Finalized;
        info!(
            "New boot config: prev {}, active {}, fw {:#x} ({}), fs {:#x} ({})",
            cfg.previous,
            cfg.active,
            cfg.roms[slot],
            cfg.roms_sizes[slot],
            cfg.fs_addresses[slot],
            cfg.fs_sizes[slot]
        );
        status::set_success("");
        Ok(())
    }

    /// Last human-readable status message.
    pub fn status_msg(&self) -> &'static str {
        self.status_msg
    }

    /// Slot being written.
    pub fn target_slot(&self) -> u8 {
        self.write_slot.id
    }

    fn fail(&mut self, err: UpdateError) -> UpdateError {
        self.status_msg = err.status_msg();
        self.state = DriverState::Failed;
        status::set_error(self.status_msg);
        err
    }

    #[allow(clippy::cast_possible_truncation)]
    fn report_progress(&mut self) {
        if self.expected_total == 0 {
            return;
        }
        let written = u64::from(self.written_total.min(self.expected_total));
        let percent = (written * 100 / u64::from(self.expected_total)) as u8;
        status::set_progress(percent, self.status_msg);
    }
}

impl<F, W> Drop for UpdateDriver<'_, F, W> {
    fn drop(&mut self) {
        if !matches!(self.state, DriverState::Finalized | DriverState::Failed) {
            status::set_idle();
        }
        UPDATE_IN_FLIGHT.store(false, Ordering::Release);
    }
}
