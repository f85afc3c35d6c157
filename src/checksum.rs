//! Streaming SHA-1 over flash regions.
//!
//! One routine backs both the skip-if-already-flashed pre-check (non
//! critical) and the post-write integrity check (critical).

use embedded_storage::nor_flash::ReadNorFlash;
use log::{debug, error};
use sha1::{Digest, Sha1};

use crate::ports::Watchdog;
use crate::writer::FlashError;

pub const SHA1_HEX_LEN: usize = 40;

/// 64 words per read; the watchdog is fed once per buffer.
const BUF_LEN: usize = 64 * 4;

/// Digest `[addr, addr + len)` and return the lowercase hex form.
pub fn compute_sha1<F: ReadNorFlash, W: Watchdog>(
    flash: &mut F,
    wdt: &mut W,
    mut addr: u32,
    mut len: u32,
) -> Result<[u8; SHA1_HEX_LEN], FlashError> {
    let mut hasher = Sha1::new();
    let mut buf = [0u8; BUF_LEN];
    while len != 0 {
        let n = (len as usize).min(BUF_LEN);
        flash
            .read(addr, &mut buf[..n])
            .map_err(|_| FlashError::Read)?;
        hasher.update(&buf[..n]);
        wdt.feed();
        addr += n as u32;
        len -= n as u32;
    }
    let digest: [u8; 20] = hasher.finalize().into();
    Ok(hex(&digest))
}

/// Compare the digest of `[addr, addr + len)` against `expected`,
/// case-insensitively. Mismatches are only worth an error-level line when the
/// caller treats them as fatal.
pub fn verify_sha1<F: ReadNorFlash, W: Watchdog>(
    flash: &mut F,
    wdt: &mut W,
    addr: u32,
    len: u32,
    expected: &str,
    critical: bool,
) -> Result<bool, FlashError> {
    let cs = compute_sha1(flash, wdt, addr, len)?;
    let ok = expected.len() == SHA1_HEX_LEN && cs.eq_ignore_ascii_case(expected.as_bytes());
    let cs = core::str::from_utf8(&cs).unwrap_or("");
    if ok || !critical {
        debug!("SHA1 {} @ {:#x} = {}, want {}", len, addr, cs, expected);
    } else {
        error!("SHA1 {} @ {:#x} = {}, want {}", len, addr, cs, expected);
    }
    Ok(ok)
}

fn hex(digest: &[u8; 20]) -> [u8; SHA1_HEX_LEN] {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = [0u8; SHA1_HEX_LEN];
    for (i, b) in digest.iter().enumerate() {
        out[i * 2] = HEX[(b >> 4) as usize];
        out[i * 2 + 1] = HEX[(b & 0x0F) as usize];
    }
    out
}
