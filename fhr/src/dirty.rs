//! Tracking of modified chunks awaiting a save. Every entry owns a snapshot
//! of the chunk taken at mark time (an `Arc` clone, the live chunk is
//! mutated copy-on-write) and remembers when the chunk first and last
//! changed, which determines how urgently it should reach disk. Draining
//! groups the pending chunks into per-region batches so each region file is
//! locked and committed once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;

use crate::chunk::{Chunk, ChunkKey, RegionCoord};


/// Maximum number of chunks per region batch.
pub const MAX_BATCH_SIZE: usize = 20;

/// Age at which a pending chunk becomes urgent.
pub const URGENT_AGE: Duration = Duration::from_secs(30);
/// Age at which a pending chunk becomes a normal save candidate, provided it
/// has stopped changing.
pub const NORMAL_AGE: Duration = Duration::from_secs(5);
/// How long a chunk must have been left untouched to count as settled.
pub const NORMAL_IDLE: Duration = Duration::from_secs(2);


/// Urgency tiers of a pending chunk, lower values are drained first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Urgency {
    /// Reserved for the shutdown drain, never produced by classification.
    Critical,
    /// Dirty for so long that the save should not wait any further.
    Urgent,
    /// Old enough to save and no longer actively changing.
    Normal,
    /// Recently touched, saving can wait.
    Deferred,
}

/// Number of pending chunks in each urgency tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UrgencyCounts {
    pub critical: usize,
    pub urgent: usize,
    pub normal: usize,
    pub deferred: usize,
}


struct DirtyEntry {
    region: RegionCoord,
    first_dirty: Instant,
    last_dirty: Instant,
    snapshot: Arc<Chunk>,
}

impl DirtyEntry {

    fn classify(&self, now: Instant) -> Urgency {
        let age = now.saturating_duration_since(self.first_dirty);
        let idle = now.saturating_duration_since(self.last_dirty);
        if age > URGENT_AGE {
            Urgency::Urgent
        } else if age > NORMAL_AGE && idle > NORMAL_IDLE {
            Urgency::Normal
        } else {
            Urgency::Deferred
        }
    }

}


/// A group of pending chunks belonging to a single region, drained from the
/// dirty set and handed to the I/O pipeline (or written synchronously on
/// shutdown). The batch owns the snapshots until they are written.
pub struct RegionBatch {
    pub region: RegionCoord,
    pub chunks: Vec<(ChunkKey, Arc<Chunk>)>,
}

impl RegionBatch {

    #[inline]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

}


/// Map of pending chunk saves keyed by chunk, with deterministic iteration
/// order so draining stays fair across ticks.
#[derive(Default)]
pub struct DirtySet {
    entries: IndexMap<ChunkKey, DirtyEntry>,
}

impl DirtySet {

    pub fn new() -> Self {
        Self::default()
    }

    /// Record a modification of the given chunk. A chunk already pending
    /// keeps its first-dirty time but its snapshot is replaced, last write
    /// wins.
    pub fn mark(&mut self, key: ChunkKey, snapshot: &Arc<Chunk>, now: Instant) {
        match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.snapshot = Arc::clone(snapshot);
                entry.last_dirty = now;
            }
            None => {
                self.entries.insert(key, DirtyEntry {
                    region: key.region_coord(),
                    first_dirty: now,
                    last_dirty: now,
                    snapshot: Arc::clone(snapshot),
                });
            }
        }
    }

    /// Forget a pending save, typically because the chunk was just written
    /// synchronously. Returns whether an entry existed.
    pub fn remove(&mut self, key: ChunkKey) -> bool {
        self.entries.shift_remove(&key).is_some()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Classify every pending chunk against the given clock.
    pub fn urgency_counts(&self, now: Instant) -> UrgencyCounts {
        let mut counts = UrgencyCounts::default();
        for entry in self.entries.values() {
            match entry.classify(now) {
                Urgency::Critical => counts.critical += 1,
                Urgency::Urgent => counts.urgent += 1,
                Urgency::Normal => counts.normal += 1,
                Urgency::Deferred => counts.deferred += 1,
            }
        }
        counts
    }

    /// Drain pending chunks into at most `budget` per-region batches of up
    /// to [`MAX_BATCH_SIZE`] chunks, preferring the most urgent entries and
    /// clustering them by region. At most one batch per region is built per
    /// drain; whatever does not fit stays pending for a later tick. Deferred
    /// entries only ride along while the batch count is strictly below the
    /// budget.
    pub fn drain(&mut self, budget: usize, now: Instant) -> Vec<RegionBatch> {

        if self.entries.is_empty() || budget == 0 {
            return Vec::new();
        }
        let budget = budget.min(MAX_BATCH_SIZE);

        // Classify and order candidates: urgency first, then region so that
        // chunks of the same region end up adjacent.
        let mut candidates: Vec<(Urgency, u64, ChunkKey, RegionCoord)> = self.entries
            .iter()
            .map(|(&key, entry)| (entry.classify(now), entry.region.hash64(), key, entry.region))
            .collect();
        candidates.sort_by_key(|&(urgency, region_hash, _, _)| (urgency, region_hash));

        let mut batches: Vec<(RegionCoord, Vec<ChunkKey>)> = Vec::new();

        for (_, _, key, region) in candidates {
            match batches.iter_mut().find(|(coord, _)| *coord == region) {
                Some((_, keys)) => {
                    if keys.len() < MAX_BATCH_SIZE {
                        keys.push(key);
                    }
                }
                None => {
                    if batches.len() < budget {
                        batches.push((region, vec![key]));
                    }
                }
            }
        }

        self.take_batches(batches)

    }

    /// Drain every pending chunk, splitting regions into as many batches as
    /// needed. This is the shutdown path: nothing stays behind.
    pub fn drain_all(&mut self) -> Vec<RegionBatch> {

        let mut candidates: Vec<(u64, ChunkKey, RegionCoord)> = self.entries
            .iter()
            .map(|(&key, entry)| (entry.region.hash64(), key, entry.region))
            .collect();
        candidates.sort_by_key(|&(region_hash, _, _)| region_hash);

        let mut batches: Vec<(RegionCoord, Vec<ChunkKey>)> = Vec::new();
        for (_, key, region) in candidates {
            match batches.last_mut() {
                Some((coord, keys)) if *coord == region && keys.len() < MAX_BATCH_SIZE => {
                    keys.push(key);
                }
                _ => batches.push((region, vec![key])),
            }
        }

        self.take_batches(batches)

    }

    /// Remove the selected entries from the map, transferring snapshot
    /// ownership into the returned batches.
    fn take_batches(&mut self, batches: Vec<(RegionCoord, Vec<ChunkKey>)>) -> Vec<RegionBatch> {
        batches.into_iter()
            .map(|(region, keys)| {
                let chunks = keys.into_iter()
                    .filter_map(|key| {
                        self.entries.shift_remove(&key).map(|entry| (key, entry.snapshot))
                    })
                    .collect();
                RegionBatch { region, chunks }
            })
            .collect()
    }

}


#[cfg(test)]
mod tests {

    use super::*;

    fn key_in_region_0(i: usize) -> ChunkKey {
        ChunkKey::new((i % 8) as i16, ((i / 8) % 8) as i16, (i / 64) as i16, 0)
    }

    #[test]
    fn last_write_wins() {
        let mut set = DirtySet::new();
        let now = Instant::now();
        let key = ChunkKey::new(0, 0, 0, 0);
        set.mark(key, &Chunk::new_filled(1), now);
        set.mark(key, &Chunk::new_filled(2), now);
        assert_eq!(set.len(), 1);
        let batches = set.drain(4, now);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].chunks[0].1.block[0], 2);
        assert!(set.is_empty());
    }

    #[test]
    fn urgency_classification() {
        let mut set = DirtySet::new();
        let start = Instant::now();
        set.mark(ChunkKey::new(0, 0, 0, 0), &Chunk::new(), start);

        // Fresh entries are deferred.
        let counts = set.urgency_counts(start);
        assert_eq!(counts, UrgencyCounts { deferred: 1, ..Default::default() });

        // Old and settled: normal.
        let counts = set.urgency_counts(start + Duration::from_secs(6));
        assert_eq!(counts, UrgencyCounts { normal: 1, ..Default::default() });

        // Far too old: urgent.
        let counts = set.urgency_counts(start + Duration::from_secs(31));
        assert_eq!(counts, UrgencyCounts { urgent: 1, ..Default::default() });
    }

    #[test]
    fn recently_touched_entries_stay_deferred() {
        let mut set = DirtySet::new();
        let start = Instant::now();
        let key = ChunkKey::new(0, 0, 0, 0);
        set.mark(key, &Chunk::new(), start);
        // The chunk keeps changing: old but not idle.
        set.mark(key, &Chunk::new(), start + Duration::from_secs(5));
        let counts = set.urgency_counts(start + Duration::from_secs(6));
        assert_eq!(counts, UrgencyCounts { deferred: 1, ..Default::default() });
    }

    #[test]
    fn drain_caps_one_batch_per_region() {
        let mut set = DirtySet::new();
        let start = Instant::now();
        for i in 0..100 {
            set.mark(key_in_region_0(i), &Chunk::new(), start);
        }
        // All 100 entries are in region (0, 0, 0) and normal after 6 s; one
        // drain produces a single full batch and leaves the rest pending.
        let batches = set.drain(4, start + Duration::from_secs(6));
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].region, RegionCoord::new(0, 0, 0, 0));
        assert_eq!(batches[0].len(), MAX_BATCH_SIZE);
        assert_eq!(set.len(), 80);
    }

    #[test]
    fn drain_bounds_batches_by_budget() {
        let mut set = DirtySet::new();
        let start = Instant::now();
        for region in 0..3i16 {
            for i in 0..30 {
                let key = ChunkKey::new(region * 8 + (i % 8), i / 8, 0, 0);
                set.mark(key, &Chunk::new(), start);
            }
        }
        let batches = set.drain(2, start + Duration::from_secs(6));
        assert_eq!(batches.len(), 2);
        assert_ne!(batches[0].region, batches[1].region);
        for batch in &batches {
            assert_eq!(batch.len(), MAX_BATCH_SIZE);
        }
        assert_eq!(set.len(), 90 - 40);
    }

    #[test]
    fn fresh_entries_drain_when_idle() {
        let mut set = DirtySet::new();
        let now = Instant::now();
        set.mark(ChunkKey::new(0, 0, 0, 0), &Chunk::new(), now);
        let batches = set.drain(4, now);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
    }

    #[test]
    fn drain_all_splits_large_regions() {
        let mut set = DirtySet::new();
        let now = Instant::now();
        for i in 0..25 {
            set.mark(key_in_region_0(i), &Chunk::new(), now);
        }
        let batches = set.drain_all();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len() + batches[1].len(), 25);
        assert!(set.is_empty());
    }

    #[test]
    fn remove_discards_pending_entry() {
        let mut set = DirtySet::new();
        let now = Instant::now();
        let key = ChunkKey::new(1, 2, 3, 0);
        set.mark(key, &Chunk::new(), now);
        assert!(set.remove(key));
        assert!(!set.remove(key));
        assert!(set.is_empty());
    }

}
