//! The update package manifest.
//!
//! A package describes up to three components: the firmware image, the
//! filesystem image and (rarely) a replacement bootloader. Each entry names
//! its source file inside the package and the expected SHA-1 of the payload.

use heapless::String;
use serde::Deserialize;

/// Longest accepted source file name.
pub const SRC_NAME_MAX: usize = 50;

/// Digest fields are parsed loosely and validated for exact length by the
/// update driver, so an over-long value fails with a checksum-format error
/// rather than a parse error.
const CS_FIELD_MAX: usize = 64;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartInfo {
    pub src: Option<String<SRC_NAME_MAX>>,
    pub addr: Option<u32>,
    pub cs_sha1: Option<String<CS_FIELD_MAX>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BootInfo {
    pub src: Option<String<SRC_NAME_MAX>>,
    pub addr: Option<u32>,
    pub cs_sha1: Option<String<CS_FIELD_MAX>>,
    #[serde(default)]
    pub update: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    pub boot: Option<BootInfo>,
    pub fw: Option<PartInfo>,
    pub fs: Option<PartInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ManifestError {
    Json,
}

impl Manifest {
    /// Parse the JSON component description shipped with the package.
    pub fn from_json(src: &str) -> Result<Self, ManifestError> {
        serde_json_core::from_str(src)
            .map(|(manifest, _)| manifest)
            .map_err(|_| ManifestError::Json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_manifest_parses() {
        let manifest = Manifest::from_json(
            r#"{
              "boot": {"src": "boot.bin", "addr": 0, "cs_sha1": "aa11", "update": true},
              "fw": {"src": "fw.bin", "addr": 8192, "cs_sha1": "bb22"},
              "fs": {"src": "fs.bin", "addr": 40960, "cs_sha1": "cc33"}
            }"#,
        )
        .unwrap();

        let boot = manifest.boot.unwrap();
        assert!(boot.update);
        assert_eq!(boot.addr, Some(0));
        assert_eq!(manifest.fw.unwrap().src.unwrap().as_str(), "fw.bin");
        assert_eq!(manifest.fs.unwrap().addr, Some(40960));
    }

    #[test]
    fn missing_sections_stay_none() {
        let manifest = Manifest::from_json(r#"{"fw": {"src": "fw.bin"}}"#).unwrap();
        assert!(manifest.boot.is_none());
        assert!(manifest.fs.is_none());
        assert!(manifest.fw.unwrap().cs_sha1.is_none());
    }

    #[test]
    fn garbage_rejected() {
        assert!(matches!(
            Manifest::from_json("not json"),
            Err(ManifestError::Json)
        ));
    }
}
