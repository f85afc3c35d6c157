//! In-memory NOR flash double and shared fixtures for the tests.

use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};

use crate::boot::{BootConfig, BootConfigStore};
use crate::layout::{FlashLayout, SlotLayout};

/// RAM-backed flash with call recording. Writes copy bytes verbatim, like
/// the raw SPI flash primitives the core ultimately sits on.
#[derive(Debug)]
pub(crate) struct MemFlash<const SIZE: usize, const ERASE: usize, const WRITE: usize> {
    pub(crate) mem: Vec<u8>,
    /// `(offset, len)` of every write call.
    pub(crate) writes: Vec<(u32, usize)>,
    /// `(from, to)` of every erase call.
    pub(crate) erases: Vec<(u32, u32)>,
}

#[derive(Debug)]
pub(crate) struct MemFlashError(NorFlashErrorKind);

impl NorFlashError for MemFlashError {
    fn kind(&self) -> NorFlashErrorKind {
        self.0
    }
}

impl<const SIZE: usize, const ERASE: usize, const WRITE: usize> MemFlash<SIZE, ERASE, WRITE> {
    pub(crate) fn new() -> Self {
        Self {
            mem: vec![0xFF; SIZE],
            writes: Vec::new(),
            erases: Vec::new(),
        }
    }

    /// Number of write calls that touched `[from, to)`.
    pub(crate) fn writes_in(&self, from: u32, to: u32) -> usize {
        self.writes
            .iter()
            .filter(|(off, len)| *off < to && off + *len as u32 > from)
            .count()
    }
}

impl<const SIZE: usize, const ERASE: usize, const WRITE: usize> ErrorType
    for MemFlash<SIZE, ERASE, WRITE>
{
    type Error = MemFlashError;
}

impl<const SIZE: usize, const ERASE: usize, const WRITE: usize> ReadNorFlash
    for MemFlash<SIZE, ERASE, WRITE>
{
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let end = offset as usize + bytes.len();
        if end > SIZE {
            return Err(MemFlashError(NorFlashErrorKind::OutOfBounds));
        }
        bytes.copy_from_slice(&self.mem[offset as usize..end]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        SIZE
    }
}

impl<const SIZE: usize, const ERASE: usize, const WRITE: usize> NorFlash
    for MemFlash<SIZE, ERASE, WRITE>
{
    const WRITE_SIZE: usize = WRITE;
    const ERASE_SIZE: usize = ERASE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if from as usize % ERASE != 0 || to as usize % ERASE != 0 {
            return Err(MemFlashError(NorFlashErrorKind::NotAligned));
        }
        if to as usize > SIZE || from > to {
            return Err(MemFlashError(NorFlashErrorKind::OutOfBounds));
        }
        self.mem[from as usize..to as usize].fill(0xFF);
        self.erases.push((from, to));
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        if offset as usize % WRITE != 0 || bytes.len() % WRITE != 0 {
            return Err(MemFlashError(NorFlashErrorKind::NotAligned));
        }
        let end = offset as usize + bytes.len();
        if end > SIZE {
            return Err(MemFlashError(NorFlashErrorKind::OutOfBounds));
        }
        self.mem[offset as usize..end].copy_from_slice(bytes);
        self.writes.push((offset, bytes.len()));
        Ok(())
    }
}

/// 136 KiB device with 4 KiB pages and word writes, matching [`test_layout`].
pub(crate) type TestFlash = MemFlash<0x2_2000, 0x1000, 4>;

/// Small two-slot map used throughout the tests.
pub(crate) fn test_layout() -> FlashLayout {
    FlashLayout {
        page_size: 0x1000,
        boot_addr: 0,
        boot_config_addr: 0x1000,
        slots: [
            SlotLayout {
                fw_addr: 0x2000,
                fw_cap: 0x8000,
                fs_addr: 0xA000,
                fs_cap: 0x8000,
            },
            SlotLayout {
                fw_addr: 0x1_2000,
                fw_cap: 0x8000,
                fs_addr: 0x1_A000,
                fs_cap: 0x8000,
            },
        ],
    }
}

/// Fresh device: slot 0 active and committed, nothing recorded yet.
pub(crate) fn provision(flash: &mut TestFlash) -> FlashLayout {
    let layout = test_layout();
    let store = BootConfigStore::new(&layout);
    store
        .store(flash, &BootConfig::initial(&layout))
        .unwrap();
    layout
}

/// Tests that touch the process-wide update flag or status cell take this
/// guard so they do not interleave.
pub(crate) fn serial_guard() -> std::sync::MutexGuard<'static, ()> {
    static SERIAL: std::sync::Mutex<()> = std::sync::Mutex::new(());
    SERIAL.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
