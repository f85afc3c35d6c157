//! Externally observable OTA state.
//!
//! The update driver publishes its progress into a process-wide cell; RPC or
//! UI layers read it back without having to hold the driver handle.

use core::cell::Cell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embedded_storage::nor_flash::ReadNorFlash;

use crate::boot::{BootConfigStore, BootError};
use crate::layout::FlashLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OtaState {
    #[default]
    Idle,
    Progress,
    Error,
    Success,
}

impl OtaState {
    pub const fn as_str(self) -> &'static str {
        match self {
            OtaState::Idle => "idle",
            OtaState::Progress => "progress",
            OtaState::Error => "error",
            OtaState::Success => "success",
        }
    }
}

/// Full status as reported over RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OtaStatus {
    pub state: OtaState,
    pub msg: &'static str,
    /// Meaningful only while in [`OtaState::Progress`].
    pub progress_percent: Option<u8>,
    pub is_committed: bool,
    pub commit_timeout: i32,
    /// Currently active slot.
    pub partition: u8,
}

#[derive(Clone, Copy)]
struct Inner {
    state: OtaState,
    msg: &'static str,
    progress: u8,
}

static OTA_STATUS: Mutex<CriticalSectionRawMutex, Cell<Inner>> = Mutex::new(Cell::new(Inner {
    state: OtaState::Idle,
    msg: "",
    progress: 0,
}));

pub fn ota_state() -> OtaState {
    OTA_STATUS.lock(|cell| cell.get().state)
}

/// Last human-readable status message.
pub fn ota_message() -> &'static str {
    OTA_STATUS.lock(|cell| cell.get().msg)
}

pub(crate) fn set_progress(percent: u8, msg: &'static str) {
    OTA_STATUS.lock(|cell| {
        cell.set(Inner {
            state: OtaState::Progress,
            msg,
            progress: percent,
        });
    });
}

pub(crate) fn set_error(msg: &'static str) {
    OTA_STATUS.lock(|cell| {
        cell.set(Inner {
            state: OtaState::Error,
            msg,
            progress: 0,
        });
    });
}

pub(crate) fn set_success(msg: &'static str) {
    OTA_STATUS.lock(|cell| {
        cell.set(Inner {
            state: OtaState::Success,
            msg,
            progress: 100,
        });
    });
}

pub(crate) fn set_idle() {
    OTA_STATUS.lock(|cell| {
        cell.set(Inner {
            state: OtaState::Idle,
            msg: "",
            progress: 0,
        });
    });
}

impl OtaStatus {
    /// Assemble the full status from the driver-side cell and the boot
    /// config. `commit_timeout` comes from the persisted update record.
    pub fn collect<F: ReadNorFlash>(
        flash: &mut F,
        layout: &FlashLayout,
        commit_timeout: i32,
    ) -> Result<Self, BootError> {
        let boot = BootConfigStore::new(layout).get_state(flash)?;
        let inner = OTA_STATUS.lock(Cell::get);
        Ok(Self {
            state: inner.state,
            msg: inner.msg,
            progress_percent: (inner.state == OtaState::Progress).then_some(inner.progress),
            is_committed: boot.is_committed,
            commit_timeout,
            partition: boot.active,
        })
    }
}
