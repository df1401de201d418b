//! Per-region liveness accounting.
//!
//! Workers attribute live words to regions on every successful bitmap mark.
//! Hitting a shared atomic per mark would serialize the hot path, so each
//! task batches into a small direct-mapped cache and evicts with one atomic
//! add per conflict or flush.

use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::heap::RegionIdx;

/// Shared liveness counters, one slot per region.
pub struct RegionMarkStats {
    live_words: Vec<CachePadded<AtomicUsize>>,
}

impl RegionMarkStats {
    pub fn new(max_regions: u32) -> Self {
        RegionMarkStats {
            live_words: (0..max_regions)
                .map(|_| CachePadded::new(AtomicUsize::new(0)))
                .collect(),
        }
    }

    #[inline]
    pub fn add_live_words(&self, region: RegionIdx, words: usize) {
        self.live_words[region.as_usize()].fetch_add(words, Ordering::Relaxed);
    }

    #[inline]
    pub fn live_words(&self, region: RegionIdx) -> usize {
        self.live_words[region.as_usize()].load(Ordering::Acquire)
    }

    pub fn clear(&self, region: RegionIdx) {
        self.live_words[region.as_usize()].store(0, Ordering::Release);
    }

    pub fn clear_all(&self) {
        for slot in &self.live_words {
            slot.store(0, Ordering::Release);
        }
    }
}

#[derive(Clone, Copy, Default)]
struct CacheEntry {
    region: u32,
    live_words: usize,
    occupied: bool,
}

/// Direct-mapped per-task cache in front of [`RegionMarkStats`].
///
/// # Examples
///
/// ```
/// use conmark::heap::RegionIdx;
/// use conmark::stats::{MarkStatsCache, RegionMarkStats};
///
/// let stats = RegionMarkStats::new(8);
/// let mut cache = MarkStatsCache::new(4);
///
/// cache.add_live_words(&stats, RegionIdx::new(1), 10);
/// cache.add_live_words(&stats, RegionIdx::new(1), 5);
/// assert_eq!(stats.live_words(RegionIdx::new(1)), 0); // still cached
///
/// cache.evict_all(&stats);
/// assert_eq!(stats.live_words(RegionIdx::new(1)), 15);
/// ```
pub struct MarkStatsCache {
    entries: Box<[CacheEntry]>,
    mask: usize,
    hits: usize,
    misses: usize,
}

impl MarkStatsCache {
    /// `num_entries` must be a power of two.
    pub fn new(num_entries: usize) -> Self {
        assert!(num_entries.is_power_of_two());
        MarkStatsCache {
            entries: vec![CacheEntry::default(); num_entries].into_boxed_slice(),
            mask: num_entries - 1,
            hits: 0,
            misses: 0,
        }
    }

    #[inline]
    fn slot(&self, region: RegionIdx) -> usize {
        region.as_usize() & self.mask
    }

    /// Record `words` live words for `region`, evicting a conflicting
    /// entry to the shared counters if needed.
    pub fn add_live_words(&mut self, stats: &RegionMarkStats, region: RegionIdx, words: usize) {
        let slot = self.slot(region);
        let entry = &mut self.entries[slot];
        if entry.occupied && entry.region == region.raw() {
            entry.live_words += words;
            self.hits += 1;
            return;
        }
        self.misses += 1;
        if entry.occupied && entry.live_words > 0 {
            stats.add_live_words(RegionIdx::new(entry.region), entry.live_words);
        }
        *entry = CacheEntry {
            region: region.raw(),
            live_words: words,
            occupied: true,
        };
    }

    /// Flush every cached counter to the shared array and return the
    /// accumulated (hits, misses) pair.
    pub fn evict_all(&mut self, stats: &RegionMarkStats) -> (usize, usize) {
        for entry in self.entries.iter_mut() {
            if entry.occupied && entry.live_words > 0 {
                stats.add_live_words(RegionIdx::new(entry.region), entry.live_words);
            }
            *entry = CacheEntry::default();
        }
        (self.hits, self.misses)
    }

    /// Drop any cached value for `region` without flushing it; used when a
    /// region's statistics are invalidated (eager humongous reclaim,
    /// overflow restart).
    pub fn reset_region(&mut self, region: RegionIdx) {
        let slot = self.slot(region);
        let entry = &mut self.entries[slot];
        if entry.occupied && entry.region == region.raw() {
            *entry = CacheEntry::default();
        }
    }

    /// Discard all cached values and counters.
    pub fn reset(&mut self) {
        for entry in self.entries.iter_mut() {
            *entry = CacheEntry::default();
        }
        self.hits = 0;
        self.misses = 0;
    }

    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn misses(&self) -> usize {
        self.misses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicting_regions_evict_to_shared_counters() {
        let stats = RegionMarkStats::new(16);
        let mut cache = MarkStatsCache::new(4);

        // Regions 1 and 5 collide in a 4-entry cache.
        cache.add_live_words(&stats, RegionIdx::new(1), 7);
        cache.add_live_words(&stats, RegionIdx::new(5), 3);
        assert_eq!(stats.live_words(RegionIdx::new(1)), 7);
        assert_eq!(stats.live_words(RegionIdx::new(5)), 0);

        cache.evict_all(&stats);
        assert_eq!(stats.live_words(RegionIdx::new(5)), 3);
    }

    #[test]
    fn hits_and_misses_are_tracked() {
        let stats = RegionMarkStats::new(8);
        let mut cache = MarkStatsCache::new(8);
        cache.add_live_words(&stats, RegionIdx::new(2), 1);
        cache.add_live_words(&stats, RegionIdx::new(2), 1);
        cache.add_live_words(&stats, RegionIdx::new(2), 1);
        let (hits, misses) = cache.evict_all(&stats);
        assert_eq!(hits, 2);
        assert_eq!(misses, 1);
        assert_eq!(stats.live_words(RegionIdx::new(2)), 3);
    }

    #[test]
    fn reset_region_discards_pending_counts() {
        let stats = RegionMarkStats::new(8);
        let mut cache = MarkStatsCache::new(8);
        cache.add_live_words(&stats, RegionIdx::new(3), 100);
        cache.reset_region(RegionIdx::new(3));
        cache.evict_all(&stats);
        assert_eq!(stats.live_words(RegionIdx::new(3)), 0);
    }
}
