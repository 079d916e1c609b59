//! Instrumentation hook
//!
//! The store reports counts and durations through [`StoreObserver`] instead of
//! keeping global counters. All methods default to doing nothing.

use crate::overlay::ChangeKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Receives store signals
pub trait StoreObserver: Send + Sync {
    /// A path step resolved against an already-loaded base node
    fn on_cache_hit(&self) {}

    /// A base frame had to be read from storage
    fn on_cache_miss(&self) {}

    /// Frames decoded from one storage read, and the bytes fetched
    fn on_frames_loaded(&self, _frames: usize, _bytes: usize) {}

    /// A loaded subtree was replaced by its handle
    fn on_evicted(&self, _estimated_bytes: u64) {}

    /// An entry was appended to the active overlay segment
    fn on_overlay_append(&self, _kind: ChangeKind, _bytes: usize) {}

    /// A new overlay segment became the write target
    fn on_roll(&self, _segment: &str) {}

    /// A compaction finished
    fn on_compaction(&self, _nodes: u64, _bytes: u64, _elapsed: Duration) {}
}

/// Observer that ignores everything
#[derive(Debug, Default)]
pub struct NoopObserver;

impl StoreObserver for NoopObserver {}

/// Observer keeping running totals
#[derive(Debug, Default)]
pub struct CountingObserver {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub frames_loaded: AtomicU64,
    pub bytes_read: AtomicU64,
    pub evictions: AtomicU64,
    pub evicted_bytes: AtomicU64,
    pub appends: AtomicU64,
    pub appended_bytes: AtomicU64,
    pub rolls: AtomicU64,
    pub compactions: AtomicU64,
}

impl CountingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Zero every counter
    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.frames_loaded,
            &self.bytes_read,
            &self.evictions,
            &self.evicted_bytes,
            &self.appends,
            &self.appended_bytes,
            &self.rolls,
            &self.compactions,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl StoreObserver for CountingObserver {
    fn on_cache_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn on_cache_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn on_frames_loaded(&self, frames: usize, bytes: usize) {
        self.frames_loaded.fetch_add(frames as u64, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn on_evicted(&self, estimated_bytes: u64) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        self.evicted_bytes.fetch_add(estimated_bytes, Ordering::Relaxed);
    }

    fn on_overlay_append(&self, _kind: ChangeKind, bytes: usize) {
        self.appends.fetch_add(1, Ordering::Relaxed);
        self.appended_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn on_roll(&self, _segment: &str) {
        self.rolls.fetch_add(1, Ordering::Relaxed);
    }

    fn on_compaction(&self, _nodes: u64, _bytes: u64, _elapsed: Duration) {
        self.compactions.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting_observer() {
        let obs = CountingObserver::new();
        obs.on_cache_hit();
        obs.on_cache_hit();
        obs.on_cache_miss();
        obs.on_frames_loaded(3, 300);
        obs.on_overlay_append(ChangeKind::Update, 40);
        assert_eq!(obs.hits(), 2);
        assert_eq!(obs.misses(), 1);
        assert_eq!(obs.frames_loaded.load(Ordering::Relaxed), 3);
        assert_eq!(obs.appended_bytes.load(Ordering::Relaxed), 40);

        obs.reset();
        assert_eq!(obs.hits(), 0);
        assert_eq!(obs.bytes_read.load(Ordering::Relaxed), 0);
    }
}
