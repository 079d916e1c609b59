//! Read-only base index
//!
//! A base index file is a depth-first preorder dump of the whole tree. The
//! root frame sits at offset 0 and every other frame is reachable only
//! through the child offsets embedded in its parent:
//!
//! ```text
//! offset 0                                                     file end
//! ├─ root ─┬─ /a ─┬─ /a/x ─┬─ /a/y ─┬─ /b ─┬─ /b/z ─┤
//!          │      └──── subtree of /a ──────┘       │
//!          └──────────── subtree of root ───────────┘
//! ```
//!
//! Because the layout is preorder, a node's subtree occupies the bytes from
//! its own offset up to its next sibling's offset, which is what eviction
//! uses as the cost estimate of a subtree.
//!
//! Nodes are paged in lazily ([`index`]), paged out under memory pressure
//! ([`evict`]) and a new file is produced by the two-pass [`writer`].

mod evict;
pub(crate) mod index;
mod writer;

pub use index::{BaseIndex, BaseIndexStats, BaseNode, Child, Probe};
pub use writer::{ScratchNode, WriteSummary, write_base_index};
