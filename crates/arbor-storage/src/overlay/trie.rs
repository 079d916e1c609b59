//! In-memory override trie
//!
//! One entry per path touched in a segment. Entries on the way to a touched
//! path exist as `Clean` markers so lookups can stop early on untouched
//! branches. Every entry carries its own lock; the trie itself has none.

use crate::names::{Name, TreePath};
use crate::record::{InternalFields, NodeRecord};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Where an `Update` payload lives in the segment file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Location {
    pub offset: u64,
    pub len: u32,
}

#[derive(Debug, Clone)]
pub(crate) enum EntryState {
    /// Marker: overrides exist below
    Clean,
    /// Record replaced; payload cached or reloadable from `location`
    Updated {
        location: Location,
        cached: Option<Arc<NodeRecord>>,
    },
    /// Node and subtree removed
    Deleted,
}

#[derive(Debug)]
struct EntryInner {
    state: EntryState,
    /// Internal fields changed after the last full record
    patch: Option<InternalFields>,
    /// Deleted at some point; older layers below this entry stay hidden.
    /// A `Clean` opaque entry is still absent itself.
    opaque: bool,
    children: BTreeMap<Name, Arc<TrieEntry>>,
}

impl EntryInner {
    fn is_absent(&self) -> bool {
        match self.state {
            EntryState::Deleted => true,
            EntryState::Clean => self.opaque,
            EntryState::Updated { .. } => false,
        }
    }
}

#[derive(Debug)]
pub(crate) struct TrieEntry {
    inner: RwLock<EntryInner>,
}

impl TrieEntry {
    fn new() -> Self {
        Self {
            inner: RwLock::new(EntryInner {
                state: EntryState::Clean,
                patch: None,
                opaque: false,
                children: BTreeMap::new(),
            }),
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self.inner.read().state, EntryState::Deleted)
    }

    /// Deleted, or only kept as a marker for something re-created below
    pub fn is_absent(&self) -> bool {
        self.inner.read().is_absent()
    }

    /// Store a decoded payload if the entry still points at `location`
    pub fn cache(&self, location: Location, record: Arc<NodeRecord>) {
        let mut inner = self.inner.write();
        if let EntryState::Updated {
            location: current,
            cached,
        } = &mut inner.state
        {
            if *current == location {
                *cached = Some(record);
            }
        }
    }
}

/// Result of a trie lookup
#[derive(Debug, Clone)]
pub(crate) enum TrieHit {
    NotOverridden,
    Deleted,
    Patched(InternalFields),
    Updated {
        entry: Arc<TrieEntry>,
        location: Location,
        cached: Option<Arc<NodeRecord>>,
        patch: Option<InternalFields>,
    },
}

#[derive(Debug)]
pub(crate) struct OverrideTrie {
    root: Arc<TrieEntry>,
}

impl OverrideTrie {
    pub fn new() -> Self {
        Self {
            root: Arc::new(TrieEntry::new()),
        }
    }

    pub fn lookup(&self, path: &TreePath) -> TrieHit {
        let mut entry = self.root.clone();
        let mut shadowed = false;

        for name in path.segments() {
            let next = {
                let inner = entry.inner.read();
                if matches!(inner.state, EntryState::Deleted) {
                    return TrieHit::Deleted;
                }
                shadowed |= inner.opaque;
                inner.children.get(name).cloned()
            };
            match next {
                Some(child) => entry = child,
                None if shadowed => return TrieHit::Deleted,
                None => return TrieHit::NotOverridden,
            }
        }

        let inner = entry.inner.read();
        match &inner.state {
            EntryState::Deleted => TrieHit::Deleted,
            EntryState::Updated { location, cached } => TrieHit::Updated {
                entry: entry.clone(),
                location: *location,
                cached: cached.clone(),
                patch: inner.patch,
            },
            EntryState::Clean if shadowed || inner.opaque => TrieHit::Deleted,
            EntryState::Clean => inner
                .patch
                .map_or(TrieHit::NotOverridden, TrieHit::Patched),
        }
    }

    /// Find or create the entry for `path`.
    ///
    /// Returns `None` when a strict ancestor is deleted: the path cannot exist
    /// in this layer, so the write would be meaningless.
    pub fn resolve(&self, path: &TreePath) -> Option<Arc<TrieEntry>> {
        let mut entry = self.root.clone();
        for name in path.segments() {
            let next = {
                let mut inner = entry.inner.write();
                if matches!(inner.state, EntryState::Deleted) {
                    return None;
                }
                inner
                    .children
                    .entry(name.clone())
                    .or_insert_with(|| Arc::new(TrieEntry::new()))
                    .clone()
            };
            entry = next;
        }
        Some(entry)
    }

    /// Find or create the entry for `path`, reopening deleted ancestors.
    ///
    /// A deleted ancestor becomes an opaque marker: it stays absent and its
    /// older contents stay hidden, but the new path can live beneath it.
    pub fn resolve_recreating(&self, path: &TreePath) -> Arc<TrieEntry> {
        let mut entry = self.root.clone();
        for name in path.segments() {
            let next = {
                let mut inner = entry.inner.write();
                if matches!(inner.state, EntryState::Deleted) {
                    inner.state = EntryState::Clean;
                    inner.opaque = true;
                }
                inner
                    .children
                    .entry(name.clone())
                    .or_insert_with(|| Arc::new(TrieEntry::new()))
                    .clone()
            };
            entry = next;
        }
        entry
    }

    /// Full record written at `location`
    pub fn apply_update(
        entry: &TrieEntry,
        location: Location,
        cached: Option<Arc<NodeRecord>>,
    ) {
        let mut inner = entry.inner.write();
        if matches!(inner.state, EntryState::Deleted) {
            inner.opaque = true;
        }
        inner.state = EntryState::Updated { location, cached };
        inner.patch = None;
    }

    /// Internal fields changed; returns false for an absent entry
    pub fn apply_fields(entry: &TrieEntry, fields: InternalFields) -> bool {
        let mut inner = entry.inner.write();
        if inner.is_absent() {
            return false;
        }
        inner.patch = Some(fields);
        true
    }

    /// Node removed with its whole subtree
    pub fn apply_remove(entry: &TrieEntry) {
        let mut inner = entry.inner.write();
        inner.state = EntryState::Deleted;
        inner.patch = None;
        inner.opaque = false;
        inner.children.clear();
    }

    /// Drop every cached payload; returns how many were dropped
    pub fn evict_cached(&self) -> usize {
        fn walk(entry: &TrieEntry) -> usize {
            let mut inner = entry.inner.write();
            let mut dropped = 0;
            if let EntryState::Updated { cached, .. } = &mut inner.state {
                if cached.take().is_some() {
                    dropped += 1;
                }
            }
            dropped + inner.children.values().map(|c| walk(c)).sum::<usize>()
        }
        walk(&self.root)
    }

    /// Entries other than the root
    pub fn len(&self) -> usize {
        fn walk(entry: &TrieEntry) -> usize {
            let inner = entry.inner.read();
            inner.children.len() + inner.children.values().map(|c| walk(c)).sum::<usize>()
        }
        walk(&self.root)
    }

    /// Cached payloads currently held
    pub fn cached(&self) -> usize {
        fn walk(entry: &TrieEntry) -> usize {
            let inner = entry.inner.read();
            let own = matches!(
                inner.state,
                EntryState::Updated {
                    cached: Some(_),
                    ..
                }
            );
            usize::from(own) + inner.children.values().map(|c| walk(c)).sum::<usize>()
        }
        walk(&self.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> TreePath {
        TreePath::parse(s).unwrap()
    }

    fn loc(offset: u64) -> Location {
        Location { offset, len: 10 }
    }

    fn fields(seq: u64) -> InternalFields {
        InternalFields {
            update_sequence: seq,
            ..InternalFields::default()
        }
    }

    #[test]
    fn test_markers_are_not_overrides() {
        let trie = OverrideTrie::new();
        let entry = trie.resolve(&p("/a/b/c")).unwrap();
        OverrideTrie::apply_update(&entry, loc(1), None);

        assert!(matches!(trie.lookup(&p("/a")), TrieHit::NotOverridden));
        assert!(matches!(trie.lookup(&p("/a/b")), TrieHit::NotOverridden));
        assert!(matches!(trie.lookup(&p("/a/b/c")), TrieHit::Updated { .. }));
        assert!(matches!(trie.lookup(&p("/x")), TrieHit::NotOverridden));
        assert_eq!(trie.len(), 3);
    }

    #[test]
    fn test_remove_hides_subtree() {
        let trie = OverrideTrie::new();
        let d1 = trie.resolve(&p("/a/b/c/d1")).unwrap();
        OverrideTrie::apply_update(&d1, loc(1), None);
        let e1 = trie.resolve(&p("/a/b/c/d1/e1")).unwrap();
        OverrideTrie::apply_update(&e1, loc(2), None);

        OverrideTrie::apply_remove(&d1);
        assert!(matches!(trie.lookup(&p("/a/b/c/d1")), TrieHit::Deleted));
        assert!(matches!(trie.lookup(&p("/a/b/c/d1/e1")), TrieHit::Deleted));
        assert!(matches!(trie.lookup(&p("/a/b/c/d1/zz/yy")), TrieHit::Deleted));
        assert!(matches!(trie.lookup(&p("/a/b/c")), TrieHit::NotOverridden));

        // Nothing can be created beneath a deleted node
        assert!(trie.resolve(&p("/a/b/c/d1/e1")).is_none());
    }

    #[test]
    fn test_recreate_is_opaque() {
        let trie = OverrideTrie::new();
        let a = trie.resolve(&p("/a")).unwrap();
        OverrideTrie::apply_remove(&a);
        OverrideTrie::apply_update(&a, loc(5), None);

        assert!(matches!(trie.lookup(&p("/a")), TrieHit::Updated { .. }));
        // Older layers' children of /a must not show through
        assert!(matches!(trie.lookup(&p("/a/old")), TrieHit::Deleted));

        let fresh = trie.resolve(&p("/a/new")).unwrap();
        OverrideTrie::apply_update(&fresh, loc(9), None);
        assert!(matches!(trie.lookup(&p("/a/new")), TrieHit::Updated { .. }));
    }

    #[test]
    fn test_recreate_beneath_deleted_ancestor() {
        let trie = OverrideTrie::new();
        let a = trie.resolve(&p("/a")).unwrap();
        OverrideTrie::apply_update(&a, loc(1), None);
        OverrideTrie::apply_remove(&a);

        let x = trie.resolve_recreating(&p("/a/x/y"));
        OverrideTrie::apply_update(&x, loc(2), None);

        // The ancestors stay absent and keep hiding older layers
        assert!(matches!(trie.lookup(&p("/a")), TrieHit::Deleted));
        assert!(matches!(trie.lookup(&p("/a/x")), TrieHit::Deleted));
        assert!(matches!(trie.lookup(&p("/a/old")), TrieHit::Deleted));
        assert!(matches!(trie.lookup(&p("/a/x/y")), TrieHit::Updated { .. }));
        assert!(a.is_absent() && !a.is_deleted());
        assert!(!OverrideTrie::apply_fields(&a, fields(3)));

        // Putting the parent back brings it into view, still opaque
        let a = trie.resolve_recreating(&p("/a"));
        OverrideTrie::apply_update(&a, loc(3), None);
        assert!(!a.is_absent());
        assert!(matches!(trie.lookup(&p("/a")), TrieHit::Updated { .. }));
        assert!(matches!(trie.lookup(&p("/a/old")), TrieHit::Deleted));
        assert!(matches!(trie.lookup(&p("/a/x/y")), TrieHit::Updated { .. }));
    }

    #[test]
    fn test_fields_only() {
        let trie = OverrideTrie::new();
        let a = trie.resolve(&p("/a")).unwrap();
        assert!(OverrideTrie::apply_fields(&a, fields(3)));
        assert!(matches!(trie.lookup(&p("/a")), TrieHit::Patched(f) if f.update_sequence == 3));

        OverrideTrie::apply_update(&a, loc(1), None);
        assert!(OverrideTrie::apply_fields(&a, fields(4)));
        match trie.lookup(&p("/a")) {
            TrieHit::Updated { patch, .. } => assert_eq!(patch, Some(fields(4))),
            other => panic!("unexpected {other:?}"),
        }

        // A full record supersedes earlier field changes
        OverrideTrie::apply_update(&a, loc(2), None);
        match trie.lookup(&p("/a")) {
            TrieHit::Updated { patch, .. } => assert_eq!(patch, None),
            other => panic!("unexpected {other:?}"),
        }

        OverrideTrie::apply_remove(&a);
        assert!(!OverrideTrie::apply_fields(&a, fields(5)));
        assert!(matches!(trie.lookup(&p("/a")), TrieHit::Deleted));
    }

    #[test]
    fn test_cache_follows_location() {
        let trie = OverrideTrie::new();
        let a = trie.resolve(&p("/a")).unwrap();
        OverrideTrie::apply_update(&a, loc(1), None);
        let record = Arc::new(NodeRecord::directory(Name::new("a").unwrap(), vec![]));

        // Stale location is ignored
        a.cache(loc(99), record.clone());
        assert_eq!(trie.cached(), 0);

        a.cache(loc(1), record);
        assert_eq!(trie.cached(), 1);
        assert_eq!(trie.evict_cached(), 1);
        assert_eq!(trie.cached(), 0);
    }
}
