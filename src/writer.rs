//! Word-aligned streaming writes into a bounded flash region.

use embedded_storage::nor_flash::NorFlash;
use log::{debug, trace};

use crate::layout::FlashLayout;

/// Flash write granularity in bytes. Sub-word tails are the caller's to keep
/// until the final short write.
pub(crate) const ALIGN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashError {
    /// Region misaligned or outside the device.
    Bounds,
    /// Region overlaps the boot config or reaches into the bootloader.
    Protected,
    WritePastCap,
    Erase,
    Write,
    Read,
    /// Post-write verification mismatch.
    Verify,
}

/// Half-open write cursor into `[base, base + cap)`.
///
/// Pages are erased on first touch, never re-erased, so a region can only be
/// streamed through once per erase cycle.
#[derive(Debug)]
pub struct FlashWriter {
    base: u32,
    cap: u32,
    limit: u32,
    written: u32,
    erased_until: u32,
}

impl FlashWriter {
    /// Set up a cursor for `[base, base + cap)`.
    ///
    /// Both bounds must be erase-page aligned. The boot-config page is never
    /// a legal target, and only the bootloader region itself may start below
    /// it.
    pub fn new(base: u32, cap: u32, layout: &FlashLayout) -> Result<Self, FlashError> {
        let page = layout.page_size;
        if cap == 0 || base % page != 0 || cap % page != 0 {
            return Err(FlashError::Bounds);
        }
        let end = base.checked_add(cap).ok_or(FlashError::Bounds)?;
        let config_end = layout.boot_config_addr + page;
        if base < config_end && end > layout.boot_config_addr {
            return Err(FlashError::Protected);
        }
        if base < layout.boot_config_addr && base != layout.boot_addr {
            return Err(FlashError::Protected);
        }
        Ok(Self {
            base,
            cap,
            limit: cap,
            written: 0,
            erased_until: base,
        })
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    /// Byte budget left for `write`/`finish`.
    pub fn max_size(&self) -> u32 {
        self.limit
    }

    pub fn bytes_written(&self) -> u32 {
        self.written
    }

    /// Tighten the byte budget to the announced file size. Erase stays
    /// page-granular within the original region.
    pub fn set_limit(&mut self, limit: u32) -> Result<(), FlashError> {
        if limit > self.cap {
            return Err(FlashError::WritePastCap);
        }
        self.limit = limit;
        Ok(())
    }

    /// Append the word-aligned prefix of `data`, returning how many source
    /// bytes were consumed. A sub-word tail is not buffered; the caller
    /// re-presents it on the next call or hands it to [`Self::finish`].
    pub fn write<F: NorFlash>(&mut self, flash: &mut F, data: &[u8]) -> Result<usize, FlashError> {
        let usable = data.len() & !(ALIGN - 1);
        if usable == 0 {
            return Ok(0);
        }
        if self.written + usable as u32 > self.limit {
            return Err(FlashError::WritePastCap);
        }
        let addr = self.base + self.written;
        self.erase_to(flash, addr + usable as u32)?;
        flash
            .write(addr, &data[..usable])
            .map_err(|_| FlashError::Write)?;
        self.written += usable as u32;
        Ok(usable)
    }

    /// Final short write: pad `tail` (less than one word) to a full word with
    /// the erased byte value and flush it.
    pub fn finish<F: NorFlash>(&mut self, flash: &mut F, tail: &[u8]) -> Result<(), FlashError> {
        if tail.is_empty() {
            return Ok(());
        }
        debug_assert!(tail.len() < ALIGN);
        if self.written + tail.len() as u32 > self.limit {
            return Err(FlashError::WritePastCap);
        }
        let mut word = [0xFFu8; ALIGN];
        word[..tail.len()].copy_from_slice(tail);
        let addr = self.base + self.written;
        self.erase_to(flash, addr + ALIGN as u32)?;
        flash.write(addr, &word).map_err(|_| FlashError::Write)?;
        self.written += tail.len() as u32;
        trace!("flushed {}-byte tail @ {:#x}", tail.len(), addr);
        Ok(())
    }

    /// Erase pages on first touch until `upto` is covered.
    fn erase_to<F: NorFlash>(&mut self, flash: &mut F, upto: u32) -> Result<(), FlashError> {
        if upto <= self.erased_until {
            return Ok(());
        }
        let page = F::ERASE_SIZE as u32;
        let end = upto.next_multiple_of(page).min(self.base + self.cap);
        debug!("erase {:#x}..{:#x}", self.erased_until, end);
        flash
            .erase(self.erased_until, end)
            .map_err(|_| FlashError::Erase)?;
        self.erased_until = end;
        Ok(())
    }
}
