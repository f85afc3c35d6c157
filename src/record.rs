//! The record that carries the commit timeout across the update reboot.
//!
//! Written to a known file of the active filesystem at the end of an update
//! and read back during startup of the new image. The layout is explicit and
//! little-endian: `{magic: u32, version: u16, reserved: u16, commit_timeout:
//! i32}`.

use log::debug;

use crate::ports::RecordStore;

const RECORD_MAGIC: u32 = u32::from_le_bytes(*b"otar");
const RECORD_VERSION: u16 = 1;

pub const RECORD_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RecordError {
    Store,
    BadMagic,
    BadVersion,
    Truncated,
}

/// State handed from the updating firmware to the freshly booted one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UpdateRecord {
    /// Seconds the new image gets to call commit before auto-revert.
    pub commit_timeout: i32,
}

impl UpdateRecord {
    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        out[0..4].copy_from_slice(&RECORD_MAGIC.to_le_bytes());
        out[4..6].copy_from_slice(&RECORD_VERSION.to_le_bytes());
        out[8..12].copy_from_slice(&self.commit_timeout.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8; RECORD_LEN]) -> Result<Self, RecordError> {
        let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != RECORD_MAGIC {
            return Err(RecordError::BadMagic);
        }
        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version != RECORD_VERSION {
            return Err(RecordError::BadVersion);
        }
        let commit_timeout = i32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        Ok(Self { commit_timeout })
    }

    pub fn save<S: RecordStore>(&self, store: &mut S) -> Result<(), RecordError> {
        debug!("saving update record, commit timeout {}s", self.commit_timeout);
        store.write(&self.encode()).map_err(|_| RecordError::Store)
    }

    pub fn load<S: RecordStore>(store: &mut S) -> Result<Self, RecordError> {
        let mut buf = [0u8; RECORD_LEN];
        let n = store.read(&mut buf).map_err(|_| RecordError::Store)?;
        if n < RECORD_LEN {
            return Err(RecordError::Truncated);
        }
        Self::decode(&buf)
    }
}

/// Commit window armed at first boot. Expiry without an explicit commit means
/// the new image must be reverted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommitWindow {
    timeout_secs: i32,
}

impl CommitWindow {
    pub const fn new(record: UpdateRecord) -> Self {
        Self {
            timeout_secs: record.commit_timeout,
        }
    }

    pub const fn timeout_secs(&self) -> i32 {
        self.timeout_secs
    }

    /// A non-positive timeout disables the window.
    pub fn expired(&self, elapsed_secs: u32) -> bool {
        self.timeout_secs > 0 && elapsed_secs >= self.timeout_secs as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::RecordStore;

    #[derive(Default)]
    struct MemRecordStore {
        data: Vec<u8>,
    }

    impl RecordStore for MemRecordStore {
        type Error = ();

        fn read(&mut self, buf: &mut [u8]) -> Result<usize, ()> {
            let n = self.data.len().min(buf.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            Ok(n)
        }

        fn write(&mut self, data: &[u8]) -> Result<(), ()> {
            self.data = data.to_vec();
            Ok(())
        }
    }

    #[test]
    fn record_round_trips() {
        let mut store = MemRecordStore::default();
        let record = UpdateRecord { commit_timeout: 300 };
        record.save(&mut store).unwrap();
        assert_eq!(UpdateRecord::load(&mut store).unwrap(), record);
    }

    #[test]
    fn bad_magic_rejected() {
        let mut store = MemRecordStore::default();
        UpdateRecord { commit_timeout: 60 }.save(&mut store).unwrap();
        store.data[0] ^= 0xFF;
        assert_eq!(
            UpdateRecord::load(&mut store).err(),
            Some(RecordError::BadMagic)
        );
    }

    #[test]
    fn future_version_rejected() {
        let mut store = MemRecordStore::default();
        UpdateRecord { commit_timeout: 60 }.save(&mut store).unwrap();
        store.data[4] = 2;
        assert_eq!(
            UpdateRecord::load(&mut store).err(),
            Some(RecordError::BadVersion)
        );
    }

    #[test]
    fn short_record_rejected() {
        let mut store = MemRecordStore::default();
        store.data = vec![0; 4];
        assert_eq!(
            UpdateRecord::load(&mut store).err(),
            Some(RecordError::Truncated)
        );
    }

    #[test]
    fn expired_window_reverts_to_previous_slot() {
        use crate::boot::{BootConfigStore, BootState};
        use crate::mem_flash::{TestFlash, provision};

        let mut flash = TestFlash::new();
        let layout = provision(&mut flash);
        let store = BootConfigStore::new(&layout);
        // Device rebooted into slot 1 after an update.
        store
            .set_state(
                &mut flash,
                &BootState {
                    active: 1,
                    revert: 0,
                    is_committed: false,
                },
            )
            .unwrap();

        // The updating firmware left the timeout behind; the new image arms
        // the window from it at startup.
        let mut record_store = MemRecordStore::default();
        UpdateRecord { commit_timeout: 300 }.save(&mut record_store).unwrap();
        let window = CommitWindow::new(UpdateRecord::load(&mut record_store).unwrap());
        assert!(store.is_first_boot(&mut flash).unwrap());
        assert!(!window.expired(60));

        // No commit arrived in time.
        assert!(window.expired(300));
        assert!(store.revert(&mut flash).unwrap());
        let state = store.get_state(&mut flash).unwrap();
        assert_eq!(state.active, 0);
        assert!(state.is_committed);
    }

    #[test]
    fn window_expiry() {
        let window = CommitWindow::new(UpdateRecord { commit_timeout: 300 });
        assert!(!window.expired(299));
        assert!(window.expired(300));
        // Disabled window never expires.
        assert!(!CommitWindow::new(UpdateRecord::default()).expired(u32::MAX));
    }
}
