//! Overlay log
//!
//! Changes above the base index are appended to overlay segment files and
//! mirrored in an in-memory override trie. Only the newest segment accepts
//! writes; older ones are frozen until compaction folds them into a new base.
//!
//! Segment file format:
//! ```text
//! +----------------------+----------------------------------------------+
//! | Header (16B)         | Entry | Entry | ...                          |
//! +----------------------+----------------------------------------------+
//!
//! Entry:
//! +-------+------------+--------+--------+---------+--------+
//! | Strip | Suffix len | Suffix | Change | Payload | CRC32C |
//! | 2B    | 2B         | var    | 1B     | var     | 4B     |
//! +-------+------------+--------+--------+---------+--------+
//! ```
//!
//! The path is stored incrementally against the previous entry's path.

mod compound;
pub(crate) mod segment;
mod trie;

pub use compound::CompoundOverlay;
pub use segment::{OverlaySegment, SEGMENT_HEADER};

use crate::record::{InternalFields, NodeRecord};

/// Change byte of an overlay entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChangeKind {
    /// Full record replaced
    Update = 1,
    /// Node and its subtree removed
    Remove = 2,
    /// Only internal fields changed
    FieldsChanged = 3,
    /// Reserved; never written
    AttrChanged = 4,
}

impl ChangeKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Update),
            2 => Some(Self::Remove),
            3 => Some(Self::FieldsChanged),
            4 => Some(Self::AttrChanged),
            _ => None,
        }
    }
}

/// What an overlay layer says about a path
#[derive(Debug, Clone, PartialEq)]
pub enum Override {
    /// Nothing recorded here; ask older layers
    NotOverridden,
    /// Full record
    Updated(NodeRecord),
    /// The path does not exist
    Deleted,
    /// Internal fields changed; the record comes from older layers
    Patched(InternalFields),
}

impl Override {
    /// True if this answer ends the search through older layers
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Updated(_) | Self::Deleted)
    }
}
