//! Overlay segment: one append-only log file plus its override trie

use super::trie::{Location, OverrideTrie, TrieEntry, TrieHit};
use super::{ChangeKind, Override};
use crate::blob::{BlobStorage, BlobWriter};
use crate::codec::RecordCodec;
use crate::encoding::{Decoder, IncrementalDecoder, IncrementalEncoder};
use crate::names::TreePath;
use crate::observer::StoreObserver;
use crate::record::{InternalFields, NodeRecord};
use arbor_common::{Error, OverlayConfig, Result};
use bytes::BufMut;
use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, warn};

/// Fixed header at the start of every segment file
pub const SEGMENT_HEADER: &[u8; 16] = b"ARBOR-OVERLAY\x00\x01\n";

/// Size of a `FieldsChanged` payload
const FIELDS_PAYLOAD_SIZE: usize = 4 + 8 * 3;

/// Size of the trailing checksum
const CRC_SIZE: usize = 4;

/// Open writer of the active segment
struct SegmentWriter {
    out: Box<dyn BlobWriter>,
    paths: IncrementalEncoder,
}

/// One overlay segment
pub struct OverlaySegment {
    name: String,
    blobs: Arc<dyn BlobStorage>,
    codec: RecordCodec,
    trie: OverrideTrie,
    /// `None` once frozen
    writer: Mutex<Option<SegmentWriter>>,
    /// Bytes of valid log data
    size: AtomicU64,
    last_sequence: AtomicU64,
    entries: AtomicU64,
    sync_on_write: bool,
    observer: Arc<dyn StoreObserver>,
}

impl OverlaySegment {
    /// Create a new, empty active segment
    pub fn create(
        blobs: Arc<dyn BlobStorage>,
        name: &str,
        codec: RecordCodec,
        config: &OverlayConfig,
        observer: Arc<dyn StoreObserver>,
    ) -> Result<Self> {
        let mut out = blobs.open_write(name, false)?;
        out.write_all(SEGMENT_HEADER)?;
        out.flush()?;
        out.sync()?;

        info!("Created overlay segment {}", name);
        let segment = Self::new(blobs, name, codec, config, observer);
        segment
            .size
            .store(SEGMENT_HEADER.len() as u64, Ordering::Relaxed);
        *segment.writer.lock() = Some(SegmentWriter {
            out,
            paths: IncrementalEncoder::new(),
        });
        Ok(segment)
    }

    /// Replay an existing segment and reopen it for appends.
    ///
    /// A torn tail left by a crash is cut off; a missing file is created.
    pub fn open_active(
        blobs: Arc<dyn BlobStorage>,
        name: &str,
        codec: RecordCodec,
        config: &OverlayConfig,
        observer: Arc<dyn StoreObserver>,
    ) -> Result<Self> {
        if !blobs.exists(name)? {
            warn!("Overlay segment {} not found, starting empty", name);
            return Self::create(blobs, name, codec, config, observer);
        }

        let segment = Self::new(blobs, name, codec, config, observer);
        let replayed = segment.replay()?;

        let file_len = segment.blobs.file_length(name)?;
        if replayed.valid_len < SEGMENT_HEADER.len() as u64 {
            warn!("Overlay segment {} has no complete header, rewriting", name);
            let mut out = segment.blobs.open_write(name, false)?;
            out.write_all(SEGMENT_HEADER)?;
            out.flush()?;
            out.sync()?;
        } else if replayed.valid_len < file_len {
            warn!(
                "Overlay segment {}: discarding {} torn bytes at offset {}",
                name,
                file_len - replayed.valid_len,
                replayed.valid_len
            );
            segment.blobs.truncate(name, replayed.valid_len)?;
        }

        let out = segment.blobs.open_write(name, true)?;
        let mut paths = IncrementalEncoder::new();
        paths.reset_to(&replayed.last_key);
        *segment.writer.lock() = Some(SegmentWriter { out, paths });
        segment.size.store(
            replayed.valid_len.max(SEGMENT_HEADER.len() as u64),
            Ordering::Relaxed,
        );

        info!(
            "Opened overlay segment {} ({} entries, last sequence {})",
            name,
            segment.entries(),
            segment.last_sequence()
        );
        Ok(segment)
    }

    /// Replay an existing segment read-only
    pub fn open_frozen(
        blobs: Arc<dyn BlobStorage>,
        name: &str,
        codec: RecordCodec,
        config: &OverlayConfig,
        observer: Arc<dyn StoreObserver>,
    ) -> Result<Self> {
        let segment = Self::new(blobs, name, codec, config, observer);
        if !segment.blobs.exists(name)? {
            warn!("Overlay segment {} not found, treating as empty", name);
            return Ok(segment);
        }

        let replayed = segment.replay()?;
        segment.size.store(replayed.valid_len, Ordering::Relaxed);
        debug!(
            "Opened frozen overlay segment {} ({} entries)",
            name,
            segment.entries()
        );
        Ok(segment)
    }

    fn new(
        blobs: Arc<dyn BlobStorage>,
        name: &str,
        codec: RecordCodec,
        config: &OverlayConfig,
        observer: Arc<dyn StoreObserver>,
    ) -> Self {
        Self {
            name: name.to_string(),
            blobs,
            codec,
            trie: OverrideTrie::new(),
            writer: Mutex::new(None),
            size: AtomicU64::new(0),
            last_sequence: AtomicU64::new(0),
            entries: AtomicU64::new(0),
            sync_on_write: config.sync_on_write,
            observer,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bytes of log data, header included
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    /// Highest update sequence recorded here
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::Relaxed)
    }

    /// Entries applied, replayed ones included
    pub fn entries(&self) -> u64 {
        self.entries.load(Ordering::Relaxed)
    }

    pub fn is_frozen(&self) -> bool {
        self.writer.lock().is_none()
    }

    /// Paths with trie entries, markers included
    pub fn trie_len(&self) -> usize {
        self.trie.len()
    }

    /// Record payloads currently cached
    pub fn cached_records(&self) -> usize {
        self.trie.cached()
    }

    /// Replace the record at `path`.
    ///
    /// Ancestors deleted in this segment stay absent but no longer block the
    /// write, matching what a fresh segment on top would record.
    pub fn put(&self, path: &TreePath, record: &NodeRecord) -> Result<()> {
        let record = Arc::new(if record.name == path.leaf_name() {
            record.clone()
        } else {
            record.renamed(path.leaf_name())
        });
        let body = self.codec.record_bytes(&record)?;
        let body_len = u32::try_from(body.len())
            .map_err(|_| Error::invalid_argument("record exceeds 4GiB"))?;

        let mut guard = self.writer.lock();
        self.check_writable(guard.as_ref())?;
        let entry = self.trie.resolve_recreating(path);

        let location = self.append(&mut guard, path, ChangeKind::Update, |buf| {
            buf.put_u32_le(body_len);
            buf.put_slice(&body);
        })?;
        let location = Location {
            offset: location + 4,
            len: body_len,
        };

        OverrideTrie::apply_update(&entry, location, Some(record.clone()));
        self.note_sequence(record.update_sequence);
        Ok(())
    }

    /// Change only the internal fields at `path`.
    ///
    /// A no-op (nothing logged, returns false) when the path is absent in
    /// this segment.
    pub fn put_fields_only(&self, path: &TreePath, fields: &InternalFields) -> Result<bool> {
        let mut guard = self.writer.lock();
        self.check_writable(guard.as_ref())?;
        let Some(entry) = self.trie.resolve(path) else {
            return Ok(false);
        };
        if entry.is_absent() {
            return Ok(false);
        }

        self.append(&mut guard, path, ChangeKind::FieldsChanged, |buf| {
            put_fields(buf, fields);
        })?;
        OverrideTrie::apply_fields(&entry, *fields);
        self.note_sequence(fields.update_sequence);
        Ok(true)
    }

    /// Remove `path` and everything beneath it
    pub fn remove(&self, path: &TreePath) -> Result<bool> {
        let mut guard = self.writer.lock();
        self.check_writable(guard.as_ref())?;
        let Some(entry) = self.trie.resolve(path) else {
            return Ok(false);
        };
        if entry.is_deleted() {
            return Ok(false);
        }

        self.append(&mut guard, path, ChangeKind::Remove, |_| {})?;
        OverrideTrie::apply_remove(&entry);
        Ok(true)
    }

    /// What this segment says about `path`, reloading a dropped payload
    pub fn get_override(&self, path: &TreePath) -> Result<Override> {
        Ok(match self.trie.lookup(path) {
            TrieHit::NotOverridden => Override::NotOverridden,
            TrieHit::Deleted => Override::Deleted,
            TrieHit::Patched(fields) => Override::Patched(fields),
            TrieHit::Updated {
                entry,
                location,
                cached,
                patch,
            } => {
                let record = match cached {
                    Some(record) => record,
                    None => self.load_payload(&entry, path, location)?,
                };
                let mut record = NodeRecord::clone(&record);
                if let Some(fields) = patch {
                    record.apply_fields(&fields);
                }
                Override::Updated(record)
            }
        })
    }

    /// Like [`get_override`](Self::get_override) but `None` instead of I/O
    pub fn get_override_if_cached(&self, path: &TreePath) -> Option<Override> {
        Some(match self.trie.lookup(path) {
            TrieHit::NotOverridden => Override::NotOverridden,
            TrieHit::Deleted => Override::Deleted,
            TrieHit::Patched(fields) => Override::Patched(fields),
            TrieHit::Updated { cached, patch, .. } => {
                let mut record = (*cached?).clone();
                if let Some(fields) = patch {
                    record.apply_fields(&fields);
                }
                Override::Updated(record)
            }
        })
    }

    /// Drop cached record payloads; they reload from the file on demand
    pub fn evict_cached(&self) -> usize {
        let dropped = self.trie.evict_cached();
        debug!("Dropped {} cached payloads from {}", dropped, self.name);
        dropped
    }

    /// Flush and sync the writer
    pub fn sync(&self) -> Result<()> {
        if let Some(writer) = self.writer.lock().as_mut() {
            writer.out.flush()?;
            writer.out.sync()?;
        }
        Ok(())
    }

    /// Stop accepting writes; later writes fail with [`Error::Frozen`]
    pub fn freeze(&self) -> Result<()> {
        if let Some(mut writer) = self.writer.lock().take() {
            writer.out.flush()?;
            writer.out.sync()?;
            info!("Froze overlay segment {} ({} bytes)", self.name, self.size());
        }
        Ok(())
    }

    fn check_writable(&self, writer: Option<&SegmentWriter>) -> Result<()> {
        if writer.is_none() {
            return Err(Error::Frozen(self.name.clone()));
        }
        Ok(())
    }

    /// Encode and append one entry; returns the file offset of its payload.
    ///
    /// A failed write may leave part of the entry in the file. The segment
    /// then stops taking writes and the partial entry is cut off, so nothing
    /// acknowledged later can land behind it.
    fn append(
        &self,
        writer: &mut Option<SegmentWriter>,
        path: &TreePath,
        kind: ChangeKind,
        payload: impl FnOnce(&mut Vec<u8>),
    ) -> Result<u64> {
        let active = writer
            .as_mut()
            .ok_or_else(|| Error::Frozen(self.name.clone()))?;
        let mut paths = active.paths.clone();
        let mut buf = Vec::with_capacity(64);
        paths.encode(&mut buf, &path.to_key())?;
        buf.put_u8(kind as u8);
        let payload_offset = active.out.position() + buf.len() as u64;
        payload(&mut buf);
        let crc = crc32c::crc32c(&buf);
        buf.put_u32_le(crc);

        if let Err(e) = self.write_entry(&mut active.out, &buf) {
            // Dropped before truncating so no buffered bytes follow the cut
            drop(writer.take());
            self.discard_partial_entry();
            return Err(e);
        }
        active.paths = paths;

        self.size.fetch_add(buf.len() as u64, Ordering::Relaxed);
        self.entries.fetch_add(1, Ordering::Relaxed);
        self.observer.on_overlay_append(kind, buf.len());
        Ok(payload_offset)
    }

    fn write_entry(&self, out: &mut Box<dyn BlobWriter>, buf: &[u8]) -> Result<()> {
        out.write_all(buf)
            .map_err(|e| Error::Storage(format!("overlay write failed: {e}")))?;
        out.flush()?;
        if self.sync_on_write {
            out.sync()?;
        }
        Ok(())
    }

    fn discard_partial_entry(&self) {
        let size = self.size();
        error!(
            "Overlay segment {} failed mid-append, no longer accepting writes",
            self.name
        );
        if let Err(e) = self.blobs.truncate(&self.name, size) {
            warn!(
                "Overlay segment {}: could not cut back to {} bytes: {}",
                self.name, size, e
            );
        }
    }

    fn load_payload(
        &self,
        entry: &TrieEntry,
        path: &TreePath,
        location: Location,
    ) -> Result<Arc<NodeRecord>> {
        let bytes = self
            .blobs
            .read_range(&self.name, location.offset, location.len as usize)?;
        let mut dec = Decoder::new(&bytes);
        let record = self
            .codec
            .decode_record(&mut dec, path.leaf_name())
            .map_err(|e| e.at(&self.name, location.offset))?;
        let record = Arc::new(record);
        entry.cache(location, record.clone());
        Ok(record)
    }

    fn note_sequence(&self, sequence: u64) {
        self.last_sequence.fetch_max(sequence, Ordering::Relaxed);
    }

    /// Apply every intact entry in the file to the trie
    fn replay(&self) -> Result<Replayed> {
        let len = usize::try_from(self.blobs.file_length(&self.name)?)
            .map_err(|_| Error::storage("overlay segment too large"))?;
        let data = self.blobs.read_range(&self.name, 0, len)?;

        if data.len() < SEGMENT_HEADER.len() {
            return Ok(Replayed::default());
        }
        if &data[..SEGMENT_HEADER.len()] != SEGMENT_HEADER {
            return Err(Error::corrupt(&self.name, 0, "bad overlay segment header"));
        }

        let mut pos = SEGMENT_HEADER.len();
        let mut paths = IncrementalDecoder::new();
        let mut last_key = String::new();

        while pos < data.len() {
            let raw = match RawEntry::parse(&data[pos..], &mut paths) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(
                        "Overlay segment {}: stopping replay at offset {}: {}",
                        self.name, pos, e
                    );
                    break;
                }
            };

            self.apply_raw(&raw, pos as u64)
                .map_err(|e| e.at(&self.name, pos as u64))?;
            last_key = raw.key;
            pos += raw.len;
        }

        Ok(Replayed {
            valid_len: pos as u64,
            last_key,
        })
    }

    fn apply_raw(&self, raw: &RawEntry<'_>, entry_offset: u64) -> Result<()> {
        let path = self
            .codec
            .names()
            .decode_key(&raw.key)
            .map_err(|e| Error::Serialization(format!("bad path {:?}: {e}", raw.key)))?;

        match raw.kind {
            ChangeKind::Update => {
                let mut dec = Decoder::new(raw.payload);
                let body_len = dec.u32()?;
                let body = dec.bytes(body_len as usize)?;
                let record = self
                    .codec
                    .decode_record(&mut Decoder::new(body), path.leaf_name())?;
                let location = Location {
                    offset: entry_offset + raw.payload_start as u64 + 4,
                    len: body_len,
                };
                let entry = self.trie.resolve_recreating(&path);
                OverrideTrie::apply_update(&entry, location, None);
                self.note_sequence(record.update_sequence);
            }
            ChangeKind::Remove => {
                if let Some(entry) = self.trie.resolve(&path) {
                    OverrideTrie::apply_remove(&entry);
                }
            }
            ChangeKind::FieldsChanged => {
                let fields = get_fields(&mut Decoder::new(raw.payload))?;
                if let Some(entry) = self.trie.resolve(&path) {
                    OverrideTrie::apply_fields(&entry, fields);
                }
                self.note_sequence(fields.update_sequence);
            }
            ChangeKind::AttrChanged => {
                return Err(Error::Serialization(
                    "reserved attribute change entry".into(),
                ));
            }
        }
        self.entries.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Replayed {
    valid_len: u64,
    last_key: String,
}

/// Entry framing checked against its CRC, not yet interpreted
struct RawEntry<'a> {
    key: String,
    kind: ChangeKind,
    payload: &'a [u8],
    /// Offset of the payload within the entry
    payload_start: usize,
    /// Entry length, CRC included
    len: usize,
}

impl<'a> RawEntry<'a> {
    fn parse(buf: &'a [u8], paths: &mut IncrementalDecoder) -> Result<Self> {
        let mut dec = Decoder::new(buf);
        let key = paths.decode(&mut dec)?;
        let kind_byte = dec.u8()?;
        let kind = ChangeKind::from_u8(kind_byte)
            .ok_or_else(|| Error::Serialization(format!("unknown change kind {kind_byte}")))?;

        let payload_start = dec.position();
        match kind {
            ChangeKind::Update => {
                let body_len = dec.u32()? as usize;
                dec.bytes(body_len)?;
            }
            ChangeKind::Remove => {}
            ChangeKind::FieldsChanged => {
                dec.bytes(FIELDS_PAYLOAD_SIZE)?;
            }
            ChangeKind::AttrChanged => {}
        }
        let payload_end = dec.position();

        let stored = dec.u32()?;
        let computed = crc32c::crc32c(&buf[..payload_end]);
        if stored != computed {
            return Err(Error::Serialization(format!(
                "checksum mismatch (stored {stored:#010x}, computed {computed:#010x})"
            )));
        }

        Ok(Self {
            key,
            kind,
            payload: &buf[payload_start..payload_end],
            payload_start,
            len: payload_end + CRC_SIZE,
        })
    }
}

fn put_fields(buf: &mut Vec<u8>, fields: &InternalFields) {
    buf.put_u32_le(fields.flags);
    buf.put_u64_le(fields.update_time);
    buf.put_u64_le(fields.update_sequence);
    buf.put_u64_le(fields.last_refresh_time);
}

fn get_fields(dec: &mut Decoder<'_>) -> Result<InternalFields> {
    Ok(InternalFields {
        flags: dec.u32()?,
        update_time: dec.u64()?,
        update_sequence: dec.u64()?,
        last_refresh_time: dec.u64()?,
    })
}
