//! Stack of overlay segments read as one

use super::{Override, OverlaySegment};
use crate::names::TreePath;
use crate::record::InternalFields;
use arbor_common::Result;
use std::sync::Arc;

/// Overlay segments ordered newest first; the newest is the write target
#[derive(Clone, Default)]
pub struct CompoundOverlay {
    segments: Vec<Arc<OverlaySegment>>,
}

impl CompoundOverlay {
    /// `segments` must be ordered newest first
    pub fn new(segments: Vec<Arc<OverlaySegment>>) -> Self {
        Self { segments }
    }

    pub fn segments(&self) -> &[Arc<OverlaySegment>] {
        &self.segments
    }

    /// Newest segment
    pub fn active(&self) -> Option<&Arc<OverlaySegment>> {
        self.segments.first()
    }

    /// Every segment except the newest
    pub fn frozen(&self) -> &[Arc<OverlaySegment>] {
        self.segments.get(1..).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Merge the answers of all segments for `path`.
    ///
    /// The newest full answer wins. Field changes seen above it are layered
    /// on top, newest first.
    pub fn get_override(&self, path: &TreePath) -> Result<Override> {
        let mut patch = None;
        for segment in &self.segments {
            let answer = segment.get_override(path)?;
            if let Some(resolved) = merge(answer, &mut patch) {
                return Ok(resolved);
            }
        }
        Ok(patch.map_or(Override::NotOverridden, Override::Patched))
    }

    /// Like [`get_override`](Self::get_override), `None` if any step needs I/O
    pub fn get_override_if_cached(&self, path: &TreePath) -> Option<Override> {
        let mut patch = None;
        for segment in &self.segments {
            let answer = segment.get_override_if_cached(path)?;
            if let Some(resolved) = merge(answer, &mut patch) {
                return Some(resolved);
            }
        }
        Some(patch.map_or(Override::NotOverridden, Override::Patched))
    }
}

/// Fold one segment's answer into the search state
fn merge(answer: Override, patch: &mut Option<InternalFields>) -> Option<Override> {
    match answer {
        Override::NotOverridden => None,
        Override::Patched(fields) => {
            patch.get_or_insert(fields);
            None
        }
        Override::Updated(mut record) => {
            if let Some(fields) = patch {
                record.apply_fields(fields);
            }
            Some(Override::Updated(record))
        }
        Override::Deleted => Some(Override::Deleted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStorage;
    use crate::codec::tests::test_codec;
    use crate::observer::NoopObserver;
    use crate::overlay::segment::tests::{dir_record, p};
    use arbor_common::OverlayConfig;

    fn segment(blobs: &Arc<MemoryBlobStorage>, name: &str) -> Arc<OverlaySegment> {
        Arc::new(
            OverlaySegment::create(
                blobs.clone(),
                name,
                test_codec(),
                &OverlayConfig::default(),
                Arc::new(NoopObserver),
            )
            .unwrap(),
        )
    }

    fn fields(seq: u64) -> InternalFields {
        InternalFields {
            update_sequence: seq,
            ..InternalFields::default()
        }
    }

    #[test]
    fn test_newest_wins() {
        let blobs = Arc::new(MemoryBlobStorage::new());
        let old = segment(&blobs, "1.wal");
        let new = segment(&blobs, "2.wal");
        old.put(&p("/a"), &dir_record("/a", &[], 1)).unwrap();
        old.put(&p("/b"), &dir_record("/b", &[], 1)).unwrap();
        new.put(&p("/a"), &dir_record("/a", &["x"], 2)).unwrap();
        new.remove(&p("/b")).unwrap();

        let overlay = CompoundOverlay::new(vec![new.clone(), old.clone()]);
        assert_eq!(overlay.active().unwrap().name(), "2.wal");
        assert_eq!(overlay.frozen().len(), 1);

        match overlay.get_override(&p("/a")).unwrap() {
            Override::Updated(record) => assert_eq!(record.update_sequence, 2),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(overlay.get_override(&p("/b")).unwrap(), Override::Deleted);
        assert_eq!(overlay.get_override(&p("/c")).unwrap(), Override::NotOverridden);
    }

    #[test]
    fn test_patch_applies_to_older_record() {
        let blobs = Arc::new(MemoryBlobStorage::new());
        let old = segment(&blobs, "1.wal");
        let mid = segment(&blobs, "2.wal");
        let new = segment(&blobs, "3.wal");
        old.put(&p("/a"), &dir_record("/a", &["k"], 1)).unwrap();
        mid.put_fields_only(&p("/a"), &fields(5)).unwrap();
        new.put_fields_only(&p("/a"), &fields(9)).unwrap();
        mid.put_fields_only(&p("/only-patched"), &fields(3)).unwrap();

        let overlay = CompoundOverlay::new(vec![new, mid, old]);
        match overlay.get_override(&p("/a")).unwrap() {
            Override::Updated(record) => {
                assert_eq!(record.update_sequence, 9);
                assert_eq!(record.children.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            overlay.get_override(&p("/only-patched")).unwrap(),
            Override::Patched(fields(3))
        );
    }

    #[test]
    fn test_patch_over_delete_stays_deleted() {
        let blobs = Arc::new(MemoryBlobStorage::new());
        let old = segment(&blobs, "1.wal");
        let new = segment(&blobs, "2.wal");
        old.remove(&p("/a")).unwrap();
        new.put_fields_only(&p("/a"), &fields(2)).unwrap();

        let overlay = CompoundOverlay::new(vec![new, old]);
        assert_eq!(overlay.get_override(&p("/a")).unwrap(), Override::Deleted);
    }

    #[test]
    fn test_empty_overlay() {
        let overlay = CompoundOverlay::default();
        assert!(overlay.is_empty());
        assert!(overlay.active().is_none());
        assert!(overlay.frozen().is_empty());
        assert_eq!(overlay.get_override(&p("/a")).unwrap(), Override::NotOverridden);
    }
}
