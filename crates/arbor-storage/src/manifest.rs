//! Store manifest
//!
//! The manifest names the live base index and overlay segments. It is the
//! only file ever rewritten in place, and that happens through a temporary
//! file and a rename, so a crash leaves either the old or the new version.

use crate::blob::BlobStorage;
use arbor_common::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Manifest file name
pub const MANIFEST_FILE: &str = "MANIFEST.json";

/// Temporary name used while a new manifest is written
const MANIFEST_TMP_FILE: &str = "MANIFEST.json.tmp";

/// Current manifest format version
pub const MANIFEST_VERSION: u32 = 1;

/// Persisted description of the live files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    /// Current base index, if one has been written
    pub base_index: Option<String>,
    /// Overlay segments, oldest first; the last one is active
    pub overlays: Vec<String>,
    pub next_base_id: u64,
    pub next_overlay_id: u64,
    /// Highest update sequence folded into the base index
    pub last_sequence: u64,
    /// Attribute names in registry order
    #[serde(default)]
    pub attributes: Vec<String>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            base_index: None,
            overlays: Vec::new(),
            next_base_id: 1,
            next_overlay_id: 1,
            last_sequence: 0,
            attributes: Vec::new(),
        }
    }
}

impl Manifest {
    /// Read the manifest; `None` if the store has never been written
    pub fn load(blobs: &dyn BlobStorage) -> Result<Option<Self>> {
        let exists = blobs
            .exists(MANIFEST_FILE)
            .map_err(|e| Error::manifest(format!("failed to stat manifest: {e}")))?;
        if !exists {
            return Ok(None);
        }

        let len = blobs
            .file_length(MANIFEST_FILE)
            .map_err(|e| Error::manifest(format!("failed to stat manifest: {e}")))?;
        let data = blobs
            .read_range(MANIFEST_FILE, 0, len as usize)
            .map_err(|e| Error::manifest(format!("failed to read manifest: {e}")))?;
        let manifest: Self = serde_json::from_slice(&data)
            .map_err(|e| Error::manifest(format!("failed to parse manifest: {e}")))?;

        if manifest.version != MANIFEST_VERSION {
            return Err(Error::manifest(format!(
                "unsupported manifest version {}",
                manifest.version
            )));
        }
        Ok(Some(manifest))
    }

    /// Durably replace the manifest
    pub fn store(&self, blobs: &dyn BlobStorage) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::manifest(format!("failed to encode manifest: {e}")))?;
        blobs
            .write_all(MANIFEST_TMP_FILE, &data)
            .map_err(|e| Error::manifest(format!("failed to write manifest: {e}")))?;
        blobs
            .rename(MANIFEST_TMP_FILE, MANIFEST_FILE)
            .map_err(|e| Error::manifest(format!("failed to install manifest: {e}")))?;
        debug!(
            "Manifest stored: base={:?} overlays={:?}",
            self.base_index, self.overlays
        );
        Ok(())
    }

    /// Reserve the next base index file name
    pub fn allocate_base(&mut self) -> String {
        let name = base_file_name(self.next_base_id);
        self.next_base_id += 1;
        name
    }

    /// Reserve the next overlay segment file name
    pub fn allocate_overlay(&mut self) -> String {
        let name = overlay_file_name(self.next_overlay_id);
        self.next_overlay_id += 1;
        name
    }

    /// Active overlay segment
    pub fn active_overlay(&self) -> Option<&str> {
        self.overlays.last().map(String::as_str)
    }
}

pub fn base_file_name(id: u64) -> String {
    format!("base-{id:08}.idx")
}

pub fn overlay_file_name(id: u64) -> String {
    format!("overlay-{id:08}.wal")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{LocalBlobStorage, MemoryBlobStorage};

    #[test]
    fn test_manifest_roundtrip() {
        let blobs = MemoryBlobStorage::new();
        assert!(Manifest::load(&blobs).unwrap().is_none());

        let mut manifest = Manifest::default();
        let base = manifest.allocate_base();
        let first = manifest.allocate_overlay();
        let second = manifest.allocate_overlay();
        manifest.base_index = Some(base);
        manifest.overlays = vec![first, second];
        manifest.attributes = vec!["md5".into()];
        manifest.store(&blobs).unwrap();

        let loaded = Manifest::load(&blobs).unwrap().unwrap();
        assert_eq!(loaded, manifest);
        assert_eq!(loaded.active_overlay(), Some("overlay-00000002.wal"));
        assert_eq!(loaded.base_index.as_deref(), Some("base-00000001.idx"));
        assert_eq!(loaded.next_overlay_id, 3);
        assert!(!blobs.exists(MANIFEST_TMP_FILE).unwrap());
    }

    #[test]
    fn test_garbage_manifest_is_fatal() {
        let blobs = MemoryBlobStorage::new();
        blobs.write_all(MANIFEST_FILE, b"{ not json").unwrap();
        assert!(matches!(Manifest::load(&blobs), Err(Error::Manifest(_))));
    }

    #[test]
    fn test_wrong_version_is_fatal() {
        let blobs = MemoryBlobStorage::new();
        let manifest = Manifest {
            version: 99,
            ..Manifest::default()
        };
        manifest.store(&blobs).unwrap();
        assert!(matches!(Manifest::load(&blobs), Err(Error::Manifest(_))));
    }

    #[test]
    fn test_manifest_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = LocalBlobStorage::new(dir.path());
        let mut manifest = Manifest::default();
        let segment = manifest.allocate_overlay();
        manifest.overlays.push(segment);
        manifest.store(&blobs).unwrap();

        let text = std::fs::read_to_string(dir.path().join(MANIFEST_FILE)).unwrap();
        assert!(text.contains("overlay-00000001.wal"));
        assert_eq!(Manifest::load(&blobs).unwrap().unwrap(), manifest);
    }
}
