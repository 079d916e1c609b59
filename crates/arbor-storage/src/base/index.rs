//! Lazily paged base index reader

use crate::blob::BlobStorage;
use crate::codec::{MIN_FRAME_SIZE, RecordCodec, peek_frame_len};
use crate::names::{Name, TreePath};
use crate::observer::StoreObserver;
use crate::record::{NodeKind, NodeRecord};
use arbor_common::{BaseIndexConfig, EvictionConfig, Error, PreloadMode, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// One slot of a node's child array
#[derive(Clone)]
pub enum Child {
    /// Decoded node
    Loaded(Arc<BaseNode>),
    /// Handle that can be decoded again from its offset
    Unloaded { name: Name, offset: u64 },
}

impl Child {
    pub fn name(&self) -> &Name {
        match self {
            Self::Loaded(node) => &node.record.name,
            Self::Unloaded { name, .. } => name,
        }
    }

    pub fn offset(&self) -> u64 {
        match self {
            Self::Loaded(node) => node.offset,
            Self::Unloaded { offset, .. } => *offset,
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded(_))
    }
}

/// A decoded base index node
pub struct BaseNode {
    pub(crate) record: NodeRecord,
    pub(crate) offset: u64,
    /// End of this node's subtree in the file
    pub(crate) end: u64,
    /// Child slots; replaced wholesale, never edited in place
    children: RwLock<Arc<[Child]>>,
    hits: AtomicU64,
    last_query: AtomicU64,
}

impl BaseNode {
    /// Snapshot of the child slots
    pub(crate) fn slots(&self) -> Arc<[Child]> {
        self.children.read().clone()
    }

    pub(crate) fn kind(&self) -> NodeKind {
        self.record.kind
    }

    /// Bytes this node's subtree occupies on disk
    pub(crate) fn extent(&self) -> u64 {
        self.end.saturating_sub(self.offset)
    }

    fn touch(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.last_query.store(crate::now_millis(), Ordering::Relaxed);
    }

    fn to_record(&self) -> NodeRecord {
        let mut record = self.record.clone();
        record.transient.lru_hits = self.hits.load(Ordering::Relaxed);
        record.transient.last_query_time = self.last_query.load(Ordering::Relaxed);
        record
    }

    /// Swap an unloaded slot for a freshly decoded node.
    ///
    /// If another reader won the race the node it installed is returned and
    /// ours is dropped.
    fn install(&self, idx: usize, node: Arc<BaseNode>) -> Arc<BaseNode> {
        let mut slots = self.children.write();
        match slots.get(idx) {
            Some(Child::Unloaded { offset, .. }) if *offset == node.offset => {
                let mut next: Vec<Child> = slots.iter().cloned().collect();
                next[idx] = Child::Loaded(node.clone());
                *slots = next.into();
                node
            }
            Some(Child::Loaded(existing)) if existing.offset == node.offset => existing.clone(),
            _ => node,
        }
    }

    /// Replace a loaded slot with its handle; returns the freed estimate
    pub(crate) fn evict_slot(&self, idx: usize) -> Option<u64> {
        let mut slots = self.children.write();
        let Some(Child::Loaded(node)) = slots.get(idx) else {
            return None;
        };
        let freed = node.extent();
        let handle = Child::Unloaded {
            name: node.record.name.clone(),
            offset: node.offset,
        };
        let mut next: Vec<Child> = slots.iter().cloned().collect();
        next[idx] = handle;
        *slots = next.into();
        Some(freed)
    }
}

/// Result of an in-memory probe
#[derive(Debug, Clone, PartialEq)]
pub enum Probe {
    /// Node is loaded
    Found(NodeRecord),
    /// Node definitely does not exist
    Missing,
    /// Answer would need I/O
    NotLoaded,
}

/// Base index counters
#[derive(Debug, Default)]
pub struct BaseIndexStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub loads: AtomicU64,
    pub frames_decoded: AtomicU64,
    pub bytes_read: AtomicU64,
    pub evictions: AtomicU64,
    pub evicted_bytes: AtomicU64,
}

/// Read-only, lazily paged tree of nodes
pub struct BaseIndex {
    file: Option<String>,
    blobs: Option<Arc<dyn BlobStorage>>,
    codec: Option<RecordCodec>,
    config: BaseIndexConfig,
    pub(crate) eviction: EvictionConfig,
    root: Option<Arc<BaseNode>>,
    file_len: u64,
    pub(crate) stats: BaseIndexStats,
    pub(crate) observer: Option<Arc<dyn StoreObserver>>,
}

impl BaseIndex {
    /// An index with no nodes
    pub fn empty() -> Self {
        Self {
            file: None,
            blobs: None,
            codec: None,
            config: BaseIndexConfig::default(),
            eviction: EvictionConfig::default(),
            root: None,
            file_len: 0,
            stats: BaseIndexStats::default(),
            observer: None,
        }
    }

    /// Open an index file and decode its root.
    ///
    /// A missing or empty file yields an empty index.
    pub fn open(
        blobs: Arc<dyn BlobStorage>,
        file: &str,
        codec: RecordCodec,
        config: BaseIndexConfig,
        eviction: EvictionConfig,
        observer: Arc<dyn StoreObserver>,
    ) -> Result<Self> {
        if !blobs.exists(file)? {
            warn!("Base index {} not found, starting empty", file);
            return Ok(Self::empty());
        }
        let file_len = blobs.file_length(file)?;
        if file_len == 0 {
            warn!("Base index {} is empty", file);
            return Ok(Self::empty());
        }

        let mut index = Self {
            file: Some(file.to_string()),
            blobs: Some(blobs),
            codec: Some(codec),
            config,
            eviction,
            root: None,
            file_len,
            stats: BaseIndexStats::default(),
            observer: Some(observer),
        };

        let read_ahead = index.config.preload == PreloadMode::ReadAhead;
        let (root, frames) = index.load_frame(Name::root(), 0, file_len, read_ahead)?;
        index.root = Some(root);

        info!(
            "Opened base index {} ({} bytes, {} frames preloaded)",
            file, file_len, frames
        );
        Ok(index)
    }

    /// File backing this index, if any
    pub fn file(&self) -> Option<&str> {
        self.file.as_deref()
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub(crate) fn root(&self) -> Option<&Arc<BaseNode>> {
        self.root.as_ref()
    }

    /// Look up a node, loading frames as needed
    pub fn get(&self, path: &TreePath) -> Result<Option<NodeRecord>> {
        let Some(mut node) = self.root.clone() else {
            return Ok(None);
        };
        for name in path.segments() {
            match self.child(&node, name)? {
                Some(next) => node = next,
                None => return Ok(None),
            }
        }
        node.touch();
        Ok(Some(node.to_record()))
    }

    /// Look up a node without doing any I/O
    pub fn get_if_in_memory(&self, path: &TreePath) -> Probe {
        let Some(mut node) = self.root.clone() else {
            return Probe::Missing;
        };
        for name in path.segments() {
            let slots = node.slots();
            let next = match search(&slots, name) {
                Some(idx) => match &slots[idx] {
                    Child::Loaded(child) => child.clone(),
                    Child::Unloaded { .. } => return Probe::NotLoaded,
                },
                None => return Probe::Missing,
            };
            node = next;
        }
        Probe::Found(node.to_record())
    }

    /// Number of nodes currently decoded
    pub fn resident_nodes(&self) -> u64 {
        fn count(node: &BaseNode) -> u64 {
            1 + node
                .slots()
                .iter()
                .map(|slot| match slot {
                    Child::Loaded(child) => count(child),
                    Child::Unloaded { .. } => 0,
                })
                .sum::<u64>()
        }
        self.root.as_deref().map_or(0, count)
    }

    pub fn stats(&self) -> &BaseIndexStats {
        &self.stats
    }

    /// Resolve one step, loading the child if it is only a handle
    fn child(&self, parent: &Arc<BaseNode>, name: &Name) -> Result<Option<Arc<BaseNode>>> {
        let slots = parent.slots();
        let Some(idx) = search(&slots, name) else {
            return Ok(None);
        };

        match &slots[idx] {
            Child::Loaded(child) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                if let Some(observer) = &self.observer {
                    observer.on_cache_hit();
                }
                Ok(Some(child.clone()))
            }
            Child::Unloaded { name, offset } => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                if let Some(observer) = &self.observer {
                    observer.on_cache_miss();
                }
                let end = slots.get(idx + 1).map_or(parent.end, Child::offset);
                let (node, _) = self.load_frame(name.clone(), *offset, end, true)?;
                Ok(Some(parent.install(idx, node)))
            }
        }
    }

    /// Read and decode the frame at `offset`, plus any further frames of its
    /// subtree that arrive in the same buffer when `read_ahead` is set
    fn load_frame(
        &self,
        name: Name,
        offset: u64,
        end: u64,
        read_ahead: bool,
    ) -> Result<(Arc<BaseNode>, usize)> {
        let (Some(blobs), Some(file)) = (&self.blobs, &self.file) else {
            return Err(Error::storage("base index has no backing file"));
        };

        let extent = usize::try_from(end.saturating_sub(offset)).unwrap_or(usize::MAX);
        let want = if read_ahead {
            extent.clamp(MIN_FRAME_SIZE, self.config.read_ahead_bytes.max(MIN_FRAME_SIZE))
        } else {
            MIN_FRAME_SIZE
        };
        let mut buf = blobs.read_range(file, offset, want)?;
        let frame_len = peek_frame_len(&buf).map_err(|e| e.at(file, offset))?;
        if frame_len > buf.len() {
            buf = blobs.read_range(file, offset, frame_len)?;
        }

        let mut frames = 0;
        let node = self
            .build_node(&buf, offset, name, offset, end, read_ahead, &mut frames)
            .map_err(|e| e.at(file, offset))?;

        self.stats.loads.fetch_add(1, Ordering::Relaxed);
        self.stats
            .frames_decoded
            .fetch_add(frames as u64, Ordering::Relaxed);
        self.stats
            .bytes_read
            .fetch_add(buf.len() as u64, Ordering::Relaxed);
        if let Some(observer) = &self.observer {
            observer.on_frames_loaded(frames, buf.len());
        }
        Ok((node, frames))
    }

    /// Decode the frame at file offset `offset` from `buf` (which starts at
    /// file offset `buf_start`), then speculatively its children
    #[allow(clippy::too_many_arguments)]
    fn build_node(
        &self,
        buf: &[u8],
        buf_start: u64,
        name: Name,
        offset: u64,
        end: u64,
        read_ahead: bool,
        frames: &mut usize,
    ) -> Result<Arc<BaseNode>> {
        let codec = self
            .codec
            .as_ref()
            .ok_or_else(|| Error::storage("base index has no codec"))?;
        let local = usize::try_from(offset - buf_start)
            .map_err(|_| Error::storage("frame offset outside buffer"))?;
        let frame = codec.decode_frame(buf.get(local..).unwrap_or_default(), name)?;
        *frames += 1;

        let frame_end = offset + frame.len as u64;
        let mut prev = frame_end;
        for child_offset in &frame.child_offsets {
            if *child_offset < prev || *child_offset >= end {
                return Err(Error::Serialization(format!(
                    "child offset {child_offset} outside subtree [{prev}, {end})"
                )));
            }
            prev = *child_offset + 1;
        }

        let buf_end = buf_start + buf.len() as u64;
        let count = frame.child_offsets.len();
        let mut slots = Vec::with_capacity(count);
        for (i, (child_name, &child_offset)) in frame
            .record
            .children
            .iter()
            .zip(&frame.child_offsets)
            .enumerate()
        {
            let child_end = frame.child_offsets.get(i + 1).copied().unwrap_or(end);
            let handle = Child::Unloaded {
                name: child_name.clone(),
                offset: child_offset,
            };

            if !read_ahead || child_offset >= buf_end {
                slots.push(handle);
                continue;
            }

            match self.build_node(
                buf,
                buf_start,
                child_name.clone(),
                child_offset,
                child_end,
                true,
                frames,
            ) {
                Ok(child) => slots.push(Child::Loaded(child)),
                Err(e) if e.is_eof() => slots.push(handle),
                Err(e) => {
                    debug!("Speculative decode at offset {} failed: {}", child_offset, e);
                    slots.push(handle);
                }
            }
        }

        Ok(Arc::new(BaseNode {
            record: frame.record,
            offset,
            end,
            children: RwLock::new(slots.into()),
            hits: AtomicU64::new(0),
            last_query: AtomicU64::new(0),
        }))
    }
}

/// Dichotomy search over a sorted slot array
pub(crate) fn search(slots: &[Child], name: &Name) -> Option<usize> {
    slots
        .binary_search_by(|slot| slot.name().as_str().cmp(name.as_str()))
        .ok()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::base::writer::{ScratchNode, write_base_index};
    use crate::blob::MemoryBlobStorage;
    use crate::codec::tests::test_codec;
    use crate::observer::{CountingObserver, NoopObserver};

    pub(crate) fn n(s: &str) -> Name {
        Name::new(s).unwrap()
    }

    pub(crate) fn p(s: &str) -> TreePath {
        TreePath::parse(s).unwrap()
    }

    pub(crate) fn dir(name: &str, children: Vec<ScratchNode>) -> ScratchNode {
        let names = children.iter().map(|c| c.record.name.clone()).collect();
        let mut record = NodeRecord::directory(n(name), names);
        record.update_sequence = name.len() as u64;
        ScratchNode::new(record, children)
    }

    pub(crate) fn file(name: &str, len: u64) -> ScratchNode {
        ScratchNode::new(NodeRecord::file(n(name), len), Vec::new())
    }

    /// /a/b/c/{d1/{e1}, d2, d3}
    pub(crate) fn chain_tree() -> ScratchNode {
        let mut root = dir(
            "a",
            vec![dir(
                "b",
                vec![dir(
                    "c",
                    vec![dir("d1", vec![dir("e1", vec![])]), dir("d2", vec![]), dir("d3", vec![])],
                )],
            )],
        );
        root = ScratchNode::new(
            NodeRecord::directory(Name::root(), vec![n("a")]),
            vec![root],
        );
        root
    }

    /// Root with `width` directories of `width` files each
    pub(crate) fn wide_tree(width: usize) -> ScratchNode {
        let dirs = (0..width)
            .map(|i| {
                let files = (0..width).map(|j| file(&format!("f{j:04}"), j as u64)).collect();
                dir(&format!("d{i:04}"), files)
            })
            .collect();
        let mut root = dir("root", dirs);
        root.record = root.record.renamed(Name::root());
        root
    }

    pub(crate) fn open_index(
        blobs: &Arc<MemoryBlobStorage>,
        read_ahead_bytes: usize,
        preload: PreloadMode,
        observer: Arc<dyn StoreObserver>,
    ) -> BaseIndex {
        let config = BaseIndexConfig {
            read_ahead_bytes,
            preload,
        };
        BaseIndex::open(
            blobs.clone(),
            "base.idx",
            test_codec(),
            config,
            EvictionConfig::default(),
            observer,
        )
        .unwrap()
    }

    pub(crate) fn write_tree(tree: &ScratchNode) -> Arc<MemoryBlobStorage> {
        let blobs = Arc::new(MemoryBlobStorage::new());
        write_base_index(blobs.as_ref(), "base.idx", tree, &test_codec()).unwrap();
        blobs
    }

    #[test]
    fn test_root_only_preload_then_lookup() {
        let blobs = write_tree(&chain_tree());
        let observer = Arc::new(CountingObserver::new());
        let index = open_index(&blobs, 64 * 1024, PreloadMode::RootOnly, observer.clone());
        assert_eq!(index.resident_nodes(), 1);

        let record = index.get(&p("/a/b/c")).unwrap().unwrap();
        assert_eq!(observer.misses(), 1);
        assert!(observer.hits() >= 2);

        let children: Vec<&str> = record.children.iter().map(Name::as_str).collect();
        assert_eq!(children, vec!["d1", "d2", "d3"]);
        assert_eq!(record.name.as_str(), "c");
        assert_eq!(record.update_sequence, 1);
        assert_eq!(record.transient.lru_hits, 1);

        // Everything arrived in the one read
        assert_eq!(index.resident_nodes(), 8);
    }

    #[test]
    fn test_lookup_missing() {
        let blobs = write_tree(&chain_tree());
        let index = open_index(&blobs, 4096, PreloadMode::ReadAhead, Arc::new(NoopObserver));
        assert!(index.get(&p("/a/x")).unwrap().is_none());
        assert!(index.get(&p("/a/b/c/d2/deeper")).unwrap().is_none());
        assert!(index.get(&p("/")).unwrap().is_some());
    }

    #[test]
    fn test_small_read_ahead_loads_lazily() {
        let tree = wide_tree(20);
        let blobs = write_tree(&tree);
        let observer = Arc::new(CountingObserver::new());
        let index = open_index(&blobs, 128, PreloadMode::ReadAhead, observer.clone());

        for i in (0..20).rev() {
            for j in [0, 7, 19] {
                let path = p(&format!("/d{i:04}/f{j:04}"));
                let record = index.get(&path).unwrap().unwrap();
                assert_eq!(record.external_length, j as u64);
            }
        }
        assert!(observer.misses() > 20);
        assert_eq!(index.resident_nodes(), 1 + 20 + 20 * 3);
    }

    #[test]
    fn test_children_sorted_everywhere() {
        let blobs = write_tree(&wide_tree(12));
        let index = open_index(&blobs, 256, PreloadMode::ReadAhead, Arc::new(NoopObserver));
        let root = index.get(&TreePath::root()).unwrap().unwrap();
        assert!(root.children.windows(2).all(|w| w[0] < w[1]));
        for child in &root.children {
            let record = index.get(&TreePath::root().child(child.clone())).unwrap().unwrap();
            assert!(record.children.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn test_probe_never_loads() {
        let blobs = write_tree(&chain_tree());
        let index = open_index(&blobs, 64 * 1024, PreloadMode::RootOnly, Arc::new(NoopObserver));

        assert_eq!(index.get_if_in_memory(&p("/a")), Probe::NotLoaded);
        assert_eq!(index.get_if_in_memory(&p("/zzz")), Probe::Missing);
        assert_eq!(index.resident_nodes(), 1);

        index.get(&p("/a")).unwrap();
        match index.get_if_in_memory(&p("/a/b/c/d1/e1")) {
            Probe::Found(record) => assert_eq!(record.name.as_str(), "e1"),
            other => panic!("unexpected probe {other:?}"),
        }
        assert_eq!(index.get_if_in_memory(&p("/a/b/nope")), Probe::Missing);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let blobs: Arc<dyn BlobStorage> = Arc::new(MemoryBlobStorage::new());
        let index = BaseIndex::open(
            blobs,
            "nope.idx",
            test_codec(),
            BaseIndexConfig::default(),
            EvictionConfig::default(),
            Arc::new(NoopObserver),
        )
        .unwrap();
        assert!(index.is_empty());
        assert!(index.get(&p("/a")).unwrap().is_none());
        assert_eq!(index.get_if_in_memory(&p("/a")), Probe::Missing);
    }

    #[test]
    fn test_corrupt_frame_is_fatal() {
        let blobs = write_tree(&chain_tree());
        // Clobber the delimiter of the /a frame, which follows the root frame
        let data = blobs.read_range("base.idx", 0, usize::MAX).unwrap();
        let root_len = peek_frame_len(&data).unwrap();
        let a_len = peek_frame_len(&data[root_len..]).unwrap();
        let mut data = data;
        data[root_len + a_len - 1] = 0;
        blobs.write_all("base.idx", &data).unwrap();

        let index = open_index(&blobs, 64 * 1024, PreloadMode::RootOnly, Arc::new(NoopObserver));
        let err = index.get(&p("/a")).unwrap_err();
        assert!(matches!(err, Error::Corrupt { .. }), "{err}");
    }

    #[test]
    fn test_speculative_corruption_is_not_fatal_until_read() {
        let blobs = write_tree(&chain_tree());
        let data = blobs.read_range("base.idx", 0, usize::MAX).unwrap();
        let root_len = peek_frame_len(&data).unwrap();
        let a_len = peek_frame_len(&data[root_len..]).unwrap();
        let mut data = data;
        data[root_len + a_len - 1] = 0;
        blobs.write_all("base.idx", &data).unwrap();

        // Root preload speculates into /a and quietly leaves it unloaded
        let index = open_index(&blobs, 64 * 1024, PreloadMode::ReadAhead, Arc::new(NoopObserver));
        assert_eq!(index.resident_nodes(), 1);
        assert!(index.get(&p("/a")).is_err());
    }
}
