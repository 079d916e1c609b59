//! Arbor Storage - Layered persistent tree store
//!
//! This crate stores a large hierarchical tree of attributed records without
//! holding it all in memory:
//! - Node record codec with length-prefixed frames
//! - Read-only base index, paged in lazily and evicted under pressure
//! - Append-only overlay segments replayed into an override trie
//! - Union reads across the overlay stack and the base index
//! - Roll and compaction driven by a manifest
//!
//! ```text
//!            get / put / remove
//!                    │
//!              ┌─────▼─────┐
//!              │ TreeStore │── MANIFEST.json
//!              └─────┬─────┘
//!                    │ UnionView
//!   ┌────────────────┼─────────────────┐
//!   │ overlay-N.wal (active, writable) │  newest
//!   │ overlay-N-1.wal (frozen)         │
//!   │ ...                              │
//!   │ base-M.idx (read-only)           │  oldest
//!   └──────────────────────────────────┘
//! ```

pub mod attributes;
pub mod base;
pub mod blob;
pub mod codec;
pub mod encoding;
pub mod manifest;
pub mod names;
pub mod observer;
pub mod overlay;
pub mod record;
pub mod store;
pub mod union;

// Re-exports
pub use attributes::AttributeRegistry;
pub use base::{BaseIndex, Probe, ScratchNode, WriteSummary, write_base_index};
pub use blob::{BlobStorage, BlobWriter, LocalBlobStorage, MemoryBlobStorage};
pub use codec::{DecodedFrame, RecordCodec};
pub use manifest::Manifest;
pub use names::{InternedNames, Name, NameEncoder, TreePath};
pub use observer::{CountingObserver, NoopObserver, StoreObserver};
pub use overlay::{ChangeKind, CompoundOverlay, OverlaySegment, Override};
pub use record::{AttrStatus, AttrValue, Attribute, InternalFields, NodeKind, NodeRecord};
pub use store::{CompactionSummary, EvictionPolicy, StoreStats, TreeStore};
pub use union::UnionView;

/// Milliseconds since the unix epoch
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
