//! Remembered-set rebuild policy.
//!
//! After remark, each old region's measured liveness decides whether its
//! remembered set is worth rebuilding for a later mixed collection. The
//! engine only consults the policy; the rebuild itself happens elsewhere.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::heap::Region;

/// Decisions the marking engine requests from the rebuild policy.
pub trait RemSetTracker: Send + Sync {
    /// Called once per region during remark, with the region's measured
    /// live bytes. Returns true when the region is selected for rebuild.
    fn update_before_rebuild(&self, region: &Region, live_bytes: usize) -> bool;

    /// Humongous variant: selection depends only on whether the object is
    /// live at all.
    fn update_humongous_before_rebuild(&self, region: &Region, is_live: bool) -> bool;

    /// Called once per region during cleanup, after the rebuild phase.
    fn update_after_rebuild(&self, region: &Region);

    /// Whether this region participates in rebuild bookkeeping at all.
    fn needs_scan_for_rebuild(&self, region: &Region) -> bool;
}

/// Default policy: select old regions whose live ratio is below a fixed
/// percentage of capacity.
///
/// # Examples
///
/// ```
/// use conmark::policy::{LivenessThresholdTracker, RemSetTracker};
/// use conmark::heap::{Region, RegionIdx, RegionType};
/// # use conmark::heap::HeapLayout;
/// # use conmark::object::HeapAddr;
/// # use std::sync::Arc;
///
/// let heap = HeapLayout::new(HeapAddr::new(0x1000_0000), 4, 1 << 20, 16);
/// let region = heap.region(RegionIdx::new(0));
/// region.set_region_type(RegionType::Old);
///
/// let tracker = LivenessThresholdTracker::new(85);
/// // A mostly dead old region is selected.
/// assert!(tracker.update_before_rebuild(region, 1024));
/// ```
pub struct LivenessThresholdTracker {
    live_threshold_percent: usize,
    selected: AtomicU32,
}

impl LivenessThresholdTracker {
    pub fn new(live_threshold_percent: usize) -> Self {
        assert!(live_threshold_percent <= 100);
        LivenessThresholdTracker {
            live_threshold_percent,
            selected: AtomicU32::new(0),
        }
    }

    /// Regions selected since construction or the last [`Self::reset`].
    pub fn num_selected(&self) -> u32 {
        self.selected.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.selected.store(0, Ordering::Release);
    }
}

impl RemSetTracker for LivenessThresholdTracker {
    fn update_before_rebuild(&self, region: &Region, live_bytes: usize) -> bool {
        if !region.is_old() {
            return false;
        }
        let selected = live_bytes * 100 < self.live_threshold_percent * region.capacity_bytes();
        if selected {
            self.selected.fetch_add(1, Ordering::AcqRel);
        }
        selected
    }

    fn update_humongous_before_rebuild(&self, region: &Region, is_live: bool) -> bool {
        debug_assert!(region.is_humongous());
        // Dead humongous objects are candidates for eager reclaim; their
        // regions keep remembered-set tracking until then.
        let selected = !is_live && region.is_starts_humongous();
        if selected {
            self.selected.fetch_add(1, Ordering::AcqRel);
        }
        selected
    }

    fn update_after_rebuild(&self, _region: &Region) {}

    fn needs_scan_for_rebuild(&self, region: &Region) -> bool {
        !(region.is_free() || region.is_young() || region.is_archive())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{HeapLayout, RegionIdx, RegionType};
    use crate::object::HeapAddr;

    fn heap() -> HeapLayout {
        HeapLayout::new(HeapAddr::new(0x2000_0000), 4, 1 << 20, 16)
    }

    #[test]
    fn selection_follows_the_live_ratio() {
        let heap = heap();
        let region = heap.region(RegionIdx::new(0));
        region.set_region_type(RegionType::Old);
        let tracker = LivenessThresholdTracker::new(50);

        assert!(tracker.update_before_rebuild(region, 0));
        assert!(!tracker.update_before_rebuild(region, region.capacity_bytes()));
        assert_eq!(tracker.num_selected(), 1);
    }

    #[test]
    fn young_and_free_regions_are_never_tracked() {
        let heap = heap();
        let region = heap.region(RegionIdx::new(1));
        let tracker = LivenessThresholdTracker::new(85);
        assert!(!tracker.needs_scan_for_rebuild(region)); // free

        region.set_region_type(RegionType::Young);
        assert!(!tracker.needs_scan_for_rebuild(region));
        assert!(!tracker.update_before_rebuild(region, 0));

        region.set_region_type(RegionType::Old);
        assert!(tracker.needs_scan_for_rebuild(region));
    }
}
