//! Seams to the platform: watchdog, filesystem and record storage.
//!
//! The core never talks to hardware or a VFS directly; everything passes
//! through these traits so the whole update path runs against doubles on the
//! host.

/// Hardware watchdog. Long flash loops feed it at bounded intervals.
pub trait Watchdog {
    fn feed(&mut self);
}

/// Watchdog stub for platforms (and tests) that do not arm one.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoWatchdog;

impl Watchdog for NoWatchdog {
    fn feed(&mut self) {}
}

/// Filesystem operations needed after an update: mounting the previous
/// slot's filesystem and carrying user-visible entries over to the new one.
pub trait Filesystem {
    type Error: core::fmt::Debug;

    /// Mount the filesystem image at `[addr, addr + size)` under `mountpoint`.
    fn mount(
        &mut self,
        addr: u32,
        size: u32,
        label: &str,
        mountpoint: &str,
    ) -> Result<(), Self::Error>;

    fn umount(&mut self, mountpoint: &str) -> Result<(), Self::Error>;

    /// Copy every entry of `src` that is not present in `dst` into `dst`.
    fn merge_dirs(&mut self, src: &str, dst: &str) -> Result<(), Self::Error>;
}

/// Backing store for the small record that survives the update reboot
/// (a known file in the active filesystem).
pub trait RecordStore {
    type Error: core::fmt::Debug;

    /// Read up to `buf.len()` bytes, returning how many were read.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;

    /// Replace the record contents.
    fn write(&mut self, data: &[u8]) -> Result<(), Self::Error>;
}
