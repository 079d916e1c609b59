//! Tree store
//!
//! Ties the base index, the overlay stack and the manifest together behind
//! the logical read/write surface, and runs roll and compaction.

use crate::attributes::AttributeRegistry;
use crate::base::{BaseIndex, Probe, write_base_index};
use crate::blob::{BlobStorage, LocalBlobStorage};
use crate::codec::RecordCodec;
use crate::manifest::Manifest;
use crate::names::{InternedNames, NameEncoder, TreePath};
use crate::observer::{NoopObserver, StoreObserver};
use crate::overlay::{CompoundOverlay, OverlaySegment};
use crate::record::NodeRecord;
use crate::union::UnionView;
use arbor_common::{Error, Result, StoreConfig};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How [`TreeStore::evict`] picks subtrees
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Depth-first, everything at or below the configured depths
    ByLevel,
    /// Random descent within the configured size band
    Random,
}

/// Outcome of a compaction
#[derive(Debug, Clone, Serialize)]
pub struct CompactionSummary {
    /// New base index, `None` if the tree is empty
    pub base_index: Option<String>,
    pub nodes: u64,
    pub bytes: u64,
    /// Overlay segments folded into the new base
    pub segments_folded: usize,
    pub elapsed_ms: u64,
}

/// Store statistics
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub base_index: Option<String>,
    pub base_file_bytes: u64,
    pub resident_nodes: u64,
    pub base_hits: u64,
    pub base_misses: u64,
    pub base_loads: u64,
    pub base_bytes_read: u64,
    /// Frames decoded by base index loads, read-ahead included
    pub base_frames_decoded: u64,
    pub evictions: u64,
    pub evicted_bytes: u64,
    pub segments: Vec<String>,
    pub active_segment_bytes: u64,
    pub overlay_bytes: u64,
    pub overlay_entries: u64,
    pub cached_records: usize,
    pub last_sequence: u64,
    pub puts: u64,
    pub field_updates: u64,
    pub removes: u64,
    pub skipped_writes: u64,
    pub rolls: u64,
    pub compactions: u64,
}

#[derive(Debug, Default)]
struct Counters {
    puts: AtomicU64,
    field_updates: AtomicU64,
    removes: AtomicU64,
    skipped_writes: AtomicU64,
    rolls: AtomicU64,
    compactions: AtomicU64,
}

struct StoreInner {
    blobs: Arc<dyn BlobStorage>,
    config: StoreConfig,
    codec: RecordCodec,
    observer: Arc<dyn StoreObserver>,
    /// Current layer set; replaced wholesale on roll and compaction
    layers: RwLock<Arc<UnionView>>,
    manifest: Mutex<Manifest>,
    /// Serializes overlay appends and layer swaps
    write_lock: Mutex<()>,
    compaction_lock: Mutex<()>,
    /// Last update sequence handed out
    sequence: AtomicU64,
    counters: Counters,
}

/// Persistent layered tree store
pub struct TreeStore {
    inner: Arc<StoreInner>,
    /// Shutdown flag for the maintenance thread
    shutdown: Arc<AtomicBool>,
    maintenance_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl TreeStore {
    /// Open the store in `config.data_dir` on the local filesystem
    pub fn open_local(config: StoreConfig) -> Result<Self> {
        let blobs = LocalBlobStorage::new(&config.data_dir)
            .with_write_buffer(config.overlay.write_buffer_size);
        Self::open(Arc::new(blobs), config)
    }

    /// Open or create a store on `blobs`
    pub fn open(blobs: Arc<dyn BlobStorage>, config: StoreConfig) -> Result<Self> {
        Self::open_with_observer(blobs, config, Arc::new(NoopObserver))
    }

    /// Open or create a store, reporting to `observer`
    pub fn open_with_observer(
        blobs: Arc<dyn BlobStorage>,
        config: StoreConfig,
        observer: Arc<dyn StoreObserver>,
    ) -> Result<Self> {
        config.validate()?;
        blobs.mkdirs()?;

        let (mut manifest, mut dirty) = match Manifest::load(blobs.as_ref())? {
            Some(manifest) => (manifest, false),
            None => {
                info!("Initializing new store in {}", blobs.describe());
                (Manifest::default(), true)
            }
        };

        let mut registry = AttributeRegistry::from_names(&manifest.attributes)?;
        for name in &config.attributes {
            if registry.index_of(name).is_err() {
                registry.register(name.clone())?;
                dirty = true;
            }
        }
        manifest.attributes = registry.names().to_vec();

        let names: Arc<dyn NameEncoder> = Arc::new(InternedNames::new());
        let codec = RecordCodec::new(Arc::new(registry), names);

        let base = match &manifest.base_index {
            Some(file) => BaseIndex::open(
                blobs.clone(),
                file,
                codec.clone(),
                config.base.clone(),
                config.eviction.clone(),
                observer.clone(),
            )?,
            None => BaseIndex::empty(),
        };

        if manifest.overlays.is_empty() {
            let name = manifest.allocate_overlay();
            manifest.overlays.push(name);
            dirty = true;
        }

        // Oldest first on disk, newest first in memory
        let mut segments = Vec::with_capacity(manifest.overlays.len());
        let last = manifest.overlays.len() - 1;
        for (i, name) in manifest.overlays.iter().enumerate() {
            let segment = if i == last {
                OverlaySegment::open_active(
                    blobs.clone(),
                    name,
                    codec.clone(),
                    &config.overlay,
                    observer.clone(),
                )?
            } else {
                OverlaySegment::open_frozen(
                    blobs.clone(),
                    name,
                    codec.clone(),
                    &config.overlay,
                    observer.clone(),
                )?
            };
            segments.push(Arc::new(segment));
        }
        segments.reverse();

        if dirty {
            manifest.store(blobs.as_ref())?;
        }

        let sequence = segments
            .iter()
            .map(|s| s.last_sequence())
            .fold(manifest.last_sequence, u64::max);

        let view = UnionView::new(Arc::new(base), CompoundOverlay::new(segments));
        let inner = Arc::new(StoreInner {
            blobs,
            config,
            codec,
            observer,
            layers: RwLock::new(Arc::new(view)),
            manifest: Mutex::new(manifest),
            write_lock: Mutex::new(()),
            compaction_lock: Mutex::new(()),
            sequence: AtomicU64::new(sequence),
            counters: Counters::default(),
        });

        let store = Self {
            inner,
            shutdown: Arc::new(AtomicBool::new(false)),
            maintenance_handle: Mutex::new(None),
        };

        if store.inner.config.compaction.background {
            store.start_background_maintenance();
        }

        {
            let manifest = store.inner.manifest.lock();
            info!(
                "Opened tree store in {} (base {:?}, active overlay {:?}, {} segments, sequence {})",
                store.inner.blobs.describe(),
                manifest.base_index,
                manifest.active_overlay(),
                manifest.overlays.len(),
                sequence
            );
        }
        Ok(store)
    }

    /// Current layer set
    pub fn view(&self) -> Arc<UnionView> {
        self.inner.view()
    }

    /// Attribute names the store can encode
    pub fn attributes(&self) -> Vec<String> {
        self.inner.codec.registry().names().to_vec()
    }

    /// Parse a `/`-separated path with the store's name encoder
    pub fn parse_path(&self, text: &str) -> Result<TreePath> {
        self.inner.codec.names().decode_path(text)
    }

    /// Current record at `path`
    pub fn get(&self, path: &TreePath) -> Result<Option<NodeRecord>> {
        self.inner.view().get(path)
    }

    /// Current record at `path` if it can be answered without I/O
    pub fn get_if_in_memory(&self, path: &TreePath) -> Probe {
        self.inner.view().get_if_in_memory(path)
    }

    /// Records of the existing children of `path`
    pub fn list_children(&self, path: &TreePath) -> Result<Vec<NodeRecord>> {
        self.inner.view().list_children(path)
    }

    /// Replace the record at `path`.
    ///
    /// The store stamps `update_time` and `update_sequence`. It does not add
    /// the name to the parent's child list; callers put the parent too. A
    /// removed ancestor does not block the write: the path is re-created
    /// and becomes reachable once its ancestors are put back.
    /// Returns the sequence assigned to the write.
    pub fn put(&self, path: &TreePath, record: &NodeRecord) -> Result<u64> {
        let _guard = self.inner.write_lock.lock();
        let sequence = self.inner.sequence.load(Ordering::SeqCst) + 1;
        let mut record = record.clone();
        record.update_time = crate::now_millis();
        record.update_sequence = sequence;

        self.inner.writable_view()?.put(path, &record)?;
        self.inner.finish_write(sequence, &self.inner.counters.puts);
        debug!("put {} seq={}", path, sequence);
        Ok(sequence)
    }

    /// Persist only the internal fields of `record` at `path`.
    ///
    /// Fails with [`Error::InvalidPath`] when nothing exists at `path`.
    pub fn put_fields_only(&self, path: &TreePath, record: &NodeRecord) -> Result<u64> {
        let _guard = self.inner.write_lock.lock();
        let sequence = self.inner.sequence.load(Ordering::SeqCst) + 1;
        let mut fields = record.internal_fields();
        fields.update_time = crate::now_millis();
        fields.update_sequence = sequence;

        let view = self.inner.writable_view()?;
        let applied = view.get(path)?.is_some() && view.put_fields_only(path, &fields)?;
        if !applied {
            self.inner
                .counters
                .skipped_writes
                .fetch_add(1, Ordering::Relaxed);
            return Err(Error::InvalidPath(format!("{path} does not exist")));
        }
        self.inner
            .finish_write(sequence, &self.inner.counters.field_updates);
        debug!("put_fields_only {} seq={}", path, sequence);
        Ok(sequence)
    }

    /// Remove `path` and its whole subtree
    pub fn remove(&self, path: &TreePath) -> Result<()> {
        let _guard = self.inner.write_lock.lock();
        let applied = self.inner.writable_view()?.remove(path)?;
        if applied {
            self.inner.counters.removes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner
                .counters
                .skipped_writes
                .fetch_add(1, Ordering::Relaxed);
        }
        debug!("remove {} applied={}", path, applied);
        Ok(())
    }

    /// Freeze the active segment and start a new one; returns its name
    pub fn roll(&self) -> Result<String> {
        self.inner.roll()
    }

    /// Roll if the active segment has outgrown the configured threshold
    pub fn maybe_roll(&self) -> Result<Option<String>> {
        self.inner.maybe_roll()
    }

    /// Fold the base index and all frozen segments into a new base index
    pub fn compact(&self) -> Result<CompactionSummary> {
        self.inner.compact()
    }

    /// Compact if more frozen segments piled up than configured
    pub fn maybe_compact(&self) -> Result<Option<CompactionSummary>> {
        self.inner.maybe_compact()
    }

    /// Page out base index subtrees; returns the estimated bytes freed
    pub fn evict(&self, target_bytes: u64, policy: EvictionPolicy) -> u64 {
        let view = self.inner.view();
        let freed = match policy {
            EvictionPolicy::ByLevel => view.base().evict_by_level(target_bytes),
            EvictionPolicy::Random => view
                .base()
                .evict_random(target_bytes, &mut rand::thread_rng()),
        };
        debug!("Evicted ~{} bytes ({:?})", freed, policy);
        freed
    }

    /// Drop cached overlay payloads; returns how many were dropped
    pub fn evict_overlay_cache(&self) -> usize {
        self.inner
            .view()
            .overlay()
            .segments()
            .iter()
            .map(|segment| segment.evict_cached())
            .sum()
    }

    /// Flush and sync the active segment
    pub fn sync(&self) -> Result<()> {
        self.inner.sync()
    }

    pub fn stats(&self) -> StoreStats {
        self.inner.stats()
    }

    /// Start the maintenance thread
    fn start_background_maintenance(&self) {
        let inner = Arc::clone(&self.inner);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = Duration::from_secs(inner.config.compaction.interval_secs);
        let tick = interval.clamp(Duration::from_millis(10), Duration::from_millis(100));

        let handle = thread::spawn(move || {
            info!("Background maintenance thread started");

            'outer: loop {
                // Sleep in short slices so shutdown is not held up by the interval
                let mut waited = Duration::ZERO;
                loop {
                    if shutdown.load(Ordering::Relaxed) {
                        break 'outer;
                    }
                    thread::sleep(tick);
                    waited += tick;
                    if waited >= interval {
                        break;
                    }
                }

                if let Err(e) = inner.maybe_roll() {
                    error!("Background roll failed: {}", e);
                }
                match inner.maybe_compact() {
                    Ok(Some(summary)) => info!(
                        "Background compaction completed: {:?} ({} nodes)",
                        summary.base_index, summary.nodes
                    ),
                    Ok(None) => {}
                    Err(e) => error!("Background compaction failed: {}", e),
                }
            }

            info!("Background maintenance thread stopped");
        });

        *self.maintenance_handle.lock() = Some(handle);
    }

    /// Stop background maintenance and sync
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);

        if let Some(handle) = self.maintenance_handle.lock().take() {
            let _ = handle.join();
        }

        if let Err(e) = self.inner.sync() {
            error!("Failed to sync overlay on shutdown: {}", e);
        }
    }
}

impl Drop for TreeStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl StoreInner {
    fn view(&self) -> Arc<UnionView> {
        self.layers.read().clone()
    }

    fn finish_write(&self, sequence: u64, counter: &AtomicU64) {
        self.sequence.store(sequence, Ordering::SeqCst);
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Current layers, rolled first if the active segment stopped taking
    /// writes after a failed append. Caller holds `write_lock`.
    fn writable_view(&self) -> Result<Arc<UnionView>> {
        let view = self.view();
        match view.overlay().active() {
            Some(active) if active.is_frozen() => {
                warn!("Overlay segment {} is closed, rolling", active.name());
                self.roll_locked()?;
                Ok(self.view())
            }
            _ => Ok(view),
        }
    }

    fn sync(&self) -> Result<()> {
        match self.view().overlay().active() {
            Some(active) => active.sync(),
            None => Ok(()),
        }
    }

    fn roll(&self) -> Result<String> {
        let _guard = self.write_lock.lock();
        self.roll_locked()
    }

    fn roll_locked(&self) -> Result<String> {
        let mut manifest = self.manifest.lock();
        let view = self.view();

        let mut next = manifest.clone();
        let name = next.allocate_overlay();
        let segment = OverlaySegment::create(
            self.blobs.clone(),
            &name,
            self.codec.clone(),
            &self.config.overlay,
            self.observer.clone(),
        )?;
        next.overlays.push(name.clone());
        next.store(self.blobs.as_ref())?;
        *manifest = next;

        if let Some(previous) = view.overlay().active() {
            previous.freeze()?;
        }

        let mut segments = Vec::with_capacity(view.overlay().len() + 1);
        segments.push(Arc::new(segment));
        segments.extend(view.overlay().segments().iter().cloned());
        *self.layers.write() = Arc::new(UnionView::new(
            view.base().clone(),
            CompoundOverlay::new(segments),
        ));

        self.counters.rolls.fetch_add(1, Ordering::Relaxed);
        self.observer.on_roll(&name);
        info!("Rolled overlay to {}", name);
        Ok(name)
    }

    fn maybe_roll(&self) -> Result<Option<String>> {
        let size = match self.view().overlay().active() {
            Some(active) => active.size(),
            None => return Ok(None),
        };
        if size > self.config.overlay.roll_threshold_bytes {
            debug!("Active segment at {} bytes, rolling", size);
            Ok(Some(self.roll()?))
        } else {
            Ok(None)
        }
    }

    fn maybe_compact(&self) -> Result<Option<CompactionSummary>> {
        let frozen = self.view().overlay().frozen().len();
        if frozen > self.config.compaction.max_frozen_segments {
            debug!("{} frozen segments, compacting", frozen);
            Ok(Some(self.compact()?))
        } else {
            Ok(None)
        }
    }

    fn compact(&self) -> Result<CompactionSummary> {
        let _compaction = self.compaction_lock.lock();
        let start = Instant::now();

        // Everything written so far becomes immutable
        self.roll()?;
        let view = self.view();
        let frozen: Vec<Arc<OverlaySegment>> = view.overlay().frozen().to_vec();
        let folded: HashSet<String> = frozen.iter().map(|s| s.name().to_string()).collect();
        let old_base = view.base().file().map(str::to_string);
        info!(
            "Compacting base {:?} with {} frozen segments",
            old_base,
            frozen.len()
        );

        let source = UnionView::new(view.base().clone(), CompoundOverlay::new(frozen.clone()));
        let tree = source.materialize()?;

        let (base, new_file, nodes, bytes) = match tree {
            Some(tree) => {
                let file = self.manifest.lock().allocate_base();
                let summary =
                    write_base_index(self.blobs.as_ref(), &file, &tree, &self.codec)?;
                let base = BaseIndex::open(
                    self.blobs.clone(),
                    &file,
                    self.codec.clone(),
                    self.config.base.clone(),
                    self.config.eviction.clone(),
                    self.observer.clone(),
                )?;
                (base, Some(file), summary.nodes, summary.bytes)
            }
            None => (BaseIndex::empty(), None, 0, 0),
        };
        let last_sequence = frozen.iter().map(|s| s.last_sequence()).max().unwrap_or(0);

        // Swap: new manifest first, then the in-memory layers
        {
            let _guard = self.write_lock.lock();
            let mut manifest = self.manifest.lock();
            let mut next = manifest.clone();
            next.base_index.clone_from(&new_file);
            next.overlays.retain(|name| !folded.contains(name));
            next.last_sequence = next.last_sequence.max(last_sequence);
            next.store(self.blobs.as_ref())?;
            *manifest = next;

            let current = self.view();
            let remaining = current
                .overlay()
                .segments()
                .iter()
                .filter(|s| !folded.contains(s.name()))
                .cloned()
                .collect();
            *self.layers.write() =
                Arc::new(UnionView::new(Arc::new(base), CompoundOverlay::new(remaining)));
        }

        // Old files are garbage only once the new manifest is in place
        let mut garbage: Vec<String> = frozen.iter().map(|s| s.name().to_string()).collect();
        if let Some(old) = old_base {
            if new_file.as_deref() != Some(old.as_str()) {
                garbage.push(old);
            }
        }
        for file in &garbage {
            if let Err(e) = self.blobs.delete(file) {
                warn!("Failed to delete compacted file {}: {}", file, e);
            }
        }

        let elapsed = start.elapsed();
        self.counters.compactions.fetch_add(1, Ordering::Relaxed);
        self.observer.on_compaction(nodes, bytes, elapsed);
        info!(
            "Compaction wrote {:?} ({} nodes, {} bytes) in {:?}",
            new_file, nodes, bytes, elapsed
        );

        Ok(CompactionSummary {
            base_index: new_file,
            nodes,
            bytes,
            segments_folded: frozen.len(),
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        })
    }

    fn stats(&self) -> StoreStats {
        let view = self.view();
        let base = view.base();
        let base_stats = base.stats();
        let segments = view.overlay().segments();

        StoreStats {
            base_index: base.file().map(str::to_string),
            base_file_bytes: base.file_len(),
            resident_nodes: base.resident_nodes(),
            base_hits: base_stats.hits.load(Ordering::Relaxed),
            base_misses: base_stats.misses.load(Ordering::Relaxed),
            base_loads: base_stats.loads.load(Ordering::Relaxed),
            base_bytes_read: base_stats.bytes_read.load(Ordering::Relaxed),
            base_frames_decoded: base_stats.frames_decoded.load(Ordering::Relaxed),
            evictions: base_stats.evictions.load(Ordering::Relaxed),
            evicted_bytes: base_stats.evicted_bytes.load(Ordering::Relaxed),
            // Oldest first, like the manifest
            segments: segments.iter().rev().map(|s| s.name().to_string()).collect(),
            active_segment_bytes: view.overlay().active().map_or(0, |s| s.size()),
            overlay_bytes: segments.iter().map(|s| s.size()).sum(),
            overlay_entries: segments.iter().map(|s| s.entries()).sum(),
            cached_records: segments.iter().map(|s| s.cached_records()).sum(),
            last_sequence: self.sequence.load(Ordering::SeqCst),
            puts: self.counters.puts.load(Ordering::Relaxed),
            field_updates: self.counters.field_updates.load(Ordering::Relaxed),
            removes: self.counters.removes.load(Ordering::Relaxed),
            skipped_writes: self.counters.skipped_writes.load(Ordering::Relaxed),
            rolls: self.counters.rolls.load(Ordering::Relaxed),
            compactions: self.counters.compactions.load(Ordering::Relaxed),
        }
    }
}
