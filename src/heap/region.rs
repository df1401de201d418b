//! Per-region state.
//!
//! A region is the unit of claim and reclaim. Everything a worker mutates
//! concurrently (allocation frontier, marking snapshot, chain links, live
//! byte counters) is atomic; structural membership (the intrusive set
//! links) is guarded by the owning set's lock discipline.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};

use super::target_queue::TargetObjQueue;
use super::{RegionIdx, NO_REGION};
use crate::object::{HeapAddr, MemRegion};

/// The type a region currently is; exactly one at a time.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum RegionType {
    Free = 0,
    Young = 1,
    Survivor = 2,
    Old = 3,
    HumongousStart = 4,
    HumongousCont = 5,
    Archive = 6,
}

impl RegionType {
    fn from_raw(raw: u8) -> RegionType {
        match raw {
            0 => RegionType::Free,
            1 => RegionType::Young,
            2 => RegionType::Survivor,
            3 => RegionType::Old,
            4 => RegionType::HumongousStart,
            5 => RegionType::HumongousCont,
            6 => RegionType::Archive,
            _ => unreachable!("invalid region type tag"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RegionType::Free => "FREE",
            RegionType::Young => "YOUNG",
            RegionType::Survivor => "SURV",
            RegionType::Old => "OLD",
            RegionType::HumongousStart => "HUMS",
            RegionType::HumongousCont => "HUMC",
            RegionType::Archive => "ARCH",
        }
    }
}

/// One fixed-size heap region.
pub struct Region {
    idx: RegionIdx,
    bottom: HeapAddr,
    end: HeapAddr,

    /// First unallocated word; advanced by the allocator.
    top: AtomicUsize,
    /// Next-top-at-mark-start: `top` snapshot at cycle start. Objects at or
    /// above it are live by construction and never examined.
    ntams: AtomicUsize,
    /// `ntams` of the previous completed cycle.
    prev_tams: AtomicUsize,

    region_type: AtomicU8,
    /// For humongous-continues regions, the index of the starts region.
    humongous_start: AtomicU32,

    /// Live bytes attributed during the current cycle's finalization.
    marked_bytes: AtomicUsize,
    /// Live bytes of the previous completed cycle.
    prev_marked_bytes: AtomicUsize,

    /// Inbound cross-region references: this region's roots for the cycle.
    target_obj_queue: TargetObjQueue,

    /// Forward link of the memory-server collection set chain.
    cset_next: AtomicU32,
    /// Whether this region is in the current collection set.
    in_cset: AtomicBool,

    /// Intrusive links and owner tag, managed by `RegionSet` under its lock.
    pub(crate) set_next: AtomicU32,
    pub(crate) set_prev: AtomicU32,
    pub(crate) containing_set: AtomicU32,
}

/// Tag value meaning the region is in no set.
pub(crate) const NO_SET: u32 = 0;

impl Region {
    pub(crate) fn new(
        idx: RegionIdx,
        bottom: HeapAddr,
        end: HeapAddr,
        target_queue_capacity: usize,
    ) -> Self {
        Region {
            idx,
            bottom,
            end,
            top: AtomicUsize::new(bottom.as_usize()),
            ntams: AtomicUsize::new(bottom.as_usize()),
            prev_tams: AtomicUsize::new(bottom.as_usize()),
            region_type: AtomicU8::new(RegionType::Free as u8),
            humongous_start: AtomicU32::new(NO_REGION),
            marked_bytes: AtomicUsize::new(0),
            prev_marked_bytes: AtomicUsize::new(0),
            target_obj_queue: TargetObjQueue::new(target_queue_capacity),
            cset_next: AtomicU32::new(NO_REGION),
            in_cset: AtomicBool::new(false),
            set_next: AtomicU32::new(NO_REGION),
            set_prev: AtomicU32::new(NO_REGION),
            containing_set: AtomicU32::new(NO_SET),
        }
    }

    #[inline]
    pub fn index(&self) -> RegionIdx {
        self.idx
    }

    #[inline]
    pub fn bottom(&self) -> HeapAddr {
        self.bottom
    }

    #[inline]
    pub fn end(&self) -> HeapAddr {
        self.end
    }

    #[inline]
    pub fn top(&self) -> HeapAddr {
        HeapAddr::new(self.top.load(Ordering::Acquire))
    }

    pub fn set_top(&self, top: HeapAddr) {
        debug_assert!(top >= self.bottom && top <= self.end);
        self.top.store(top.as_usize(), Ordering::Release);
    }

    #[inline]
    pub fn ntams(&self) -> HeapAddr {
        HeapAddr::new(self.ntams.load(Ordering::Acquire))
    }

    #[inline]
    pub fn prev_tams(&self) -> HeapAddr {
        HeapAddr::new(self.prev_tams.load(Ordering::Acquire))
    }

    #[inline]
    pub fn capacity_bytes(&self) -> usize {
        self.end.as_usize() - self.bottom.as_usize()
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.top().as_usize() - self.bottom.as_usize()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.top() == self.bottom
    }

    #[inline]
    pub fn mem_region(&self) -> MemRegion {
        MemRegion::new(self.bottom, self.end)
    }

    #[inline]
    pub fn is_in_reserved(&self, addr: HeapAddr) -> bool {
        self.mem_region().contains(addr)
    }

    /// True when `addr` is at or above NTAMS: allocated since marking began
    /// and therefore implicitly live.
    #[inline]
    pub fn obj_allocated_since_mark_start(&self, addr: HeapAddr) -> bool {
        addr >= self.ntams()
    }

    pub fn region_type(&self) -> RegionType {
        RegionType::from_raw(self.region_type.load(Ordering::Acquire))
    }

    pub fn set_region_type(&self, t: RegionType) {
        self.region_type.store(t as u8, Ordering::Release);
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.region_type() == RegionType::Free
    }

    #[inline]
    pub fn is_young(&self) -> bool {
        matches!(self.region_type(), RegionType::Young | RegionType::Survivor)
    }

    #[inline]
    pub fn is_survivor(&self) -> bool {
        self.region_type() == RegionType::Survivor
    }

    #[inline]
    pub fn is_old(&self) -> bool {
        self.region_type() == RegionType::Old
    }

    #[inline]
    pub fn is_archive(&self) -> bool {
        self.region_type() == RegionType::Archive
    }

    #[inline]
    pub fn is_humongous(&self) -> bool {
        matches!(
            self.region_type(),
            RegionType::HumongousStart | RegionType::HumongousCont
        )
    }

    #[inline]
    pub fn is_starts_humongous(&self) -> bool {
        self.region_type() == RegionType::HumongousStart
    }

    #[inline]
    pub fn is_continues_humongous(&self) -> bool {
        self.region_type() == RegionType::HumongousCont
    }

    pub fn set_continues_humongous(&self, start: RegionIdx) {
        self.set_region_type(RegionType::HumongousCont);
        self.humongous_start.store(start.raw(), Ordering::Release);
    }

    /// For humongous regions, the starts-humongous region index.
    pub fn humongous_start_region(&self) -> Option<RegionIdx> {
        match self.region_type() {
            RegionType::HumongousStart => Some(self.idx),
            RegionType::HumongousCont => {
                RegionIdx::from_packed(self.humongous_start.load(Ordering::Acquire))
            }
            _ => None,
        }
    }

    pub fn target_obj_queue(&self) -> &TargetObjQueue {
        &self.target_obj_queue
    }

    // Collection-set chain.

    pub fn cset_next(&self) -> Option<RegionIdx> {
        RegionIdx::from_packed(self.cset_next.load(Ordering::Acquire))
    }

    pub fn set_cset_next(&self, next: Option<RegionIdx>) {
        self.cset_next.store(RegionIdx::pack(next), Ordering::Release);
    }

    pub fn in_cset(&self) -> bool {
        self.in_cset.load(Ordering::Acquire)
    }

    pub fn set_in_cset(&self, v: bool) {
        self.in_cset.store(v, Ordering::Release);
    }

    // Marking bookkeeping.

    /// Snapshot `top` into NTAMS; every region sees this at cycle start.
    pub fn note_start_of_marking(&self) {
        self.ntams.store(self.top.load(Ordering::Acquire), Ordering::Release);
    }

    /// Retire this cycle's counters into the previous-cycle slots.
    pub fn note_end_of_marking(&self) {
        self.prev_tams
            .store(self.ntams.load(Ordering::Acquire), Ordering::Release);
        self.prev_marked_bytes
            .store(self.marked_bytes.swap(0, Ordering::AcqRel), Ordering::Release);
    }

    pub fn add_to_marked_bytes(&self, bytes: usize) {
        self.marked_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn marked_bytes(&self) -> usize {
        self.marked_bytes.load(Ordering::Acquire)
    }

    pub fn prev_marked_bytes(&self) -> usize {
        self.prev_marked_bytes.load(Ordering::Acquire)
    }

    /// Upper bound on live bytes after remark: bytes proven live plus
    /// everything allocated since the marking snapshot.
    pub fn max_live_bytes(&self) -> usize {
        self.prev_marked_bytes()
            + (self.top().as_usize() - self.prev_tams().as_usize())
    }

    pub fn zero_marked_bytes(&self) {
        self.marked_bytes.store(0, Ordering::Release);
        self.prev_marked_bytes.store(0, Ordering::Release);
    }

    /// Reset to an empty free region after reclaim.
    pub fn reset_to_free(&self) {
        self.set_region_type(RegionType::Free);
        self.humongous_start.store(NO_REGION, Ordering::Release);
        self.top.store(self.bottom.as_usize(), Ordering::Release);
        self.ntams.store(self.bottom.as_usize(), Ordering::Release);
        self.prev_tams.store(self.bottom.as_usize(), Ordering::Release);
        self.zero_marked_bytes();
        self.target_obj_queue.set_empty();
        self.set_cset_next(None);
        self.set_in_cset(false);
    }

    // Set membership, called by `RegionSet` under its lock.

    pub(crate) fn containing_set_tag(&self) -> u32 {
        self.containing_set.load(Ordering::Acquire)
    }

    pub(crate) fn set_containing_set_tag(&self, tag: u32) {
        let old = self.containing_set.swap(tag, Ordering::AcqRel);
        // A region moves between "no set" and "one set", never set to set.
        assert!(
            old == NO_SET || tag == NO_SET,
            "region {} already in set {} while adding to {}",
            self.idx.raw(),
            old,
            tag
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> Region {
        Region::new(
            RegionIdx::new(3),
            HeapAddr::new(0x30_0000),
            HeapAddr::new(0x40_0000),
            16,
        )
    }

    #[test]
    fn ntams_snapshots_top() {
        let r = region();
        r.set_top(HeapAddr::new(0x30_8000));
        r.note_start_of_marking();
        assert_eq!(r.ntams(), HeapAddr::new(0x30_8000));

        // Objects allocated after the snapshot are implicitly live.
        r.set_top(HeapAddr::new(0x30_9000));
        assert!(r.obj_allocated_since_mark_start(HeapAddr::new(0x30_8800)));
        assert!(!r.obj_allocated_since_mark_start(HeapAddr::new(0x30_7000)));
    }

    #[test]
    fn end_of_marking_retires_counters() {
        let r = region();
        r.set_top(HeapAddr::new(0x30_8000));
        r.note_start_of_marking();
        r.add_to_marked_bytes(4096);
        r.note_end_of_marking();
        assert_eq!(r.prev_marked_bytes(), 4096);
        assert_eq!(r.marked_bytes(), 0);
        assert_eq!(r.max_live_bytes(), 4096);
    }

    #[test]
    fn humongous_start_resolution() {
        let start = region();
        start.set_region_type(RegionType::HumongousStart);
        assert_eq!(start.humongous_start_region(), Some(RegionIdx::new(3)));

        let cont = Region::new(
            RegionIdx::new(4),
            HeapAddr::new(0x40_0000),
            HeapAddr::new(0x50_0000),
            16,
        );
        cont.set_continues_humongous(RegionIdx::new(3));
        assert!(cont.is_continues_humongous());
        assert_eq!(cont.humongous_start_region(), Some(RegionIdx::new(3)));
    }

    #[test]
    #[should_panic(expected = "already in set")]
    fn double_set_membership_is_rejected() {
        let r = region();
        r.set_containing_set_tag(1);
        r.set_containing_set_tag(2);
    }

    #[test]
    fn reset_to_free_clears_marking_state() {
        let r = region();
        r.set_region_type(RegionType::Old);
        r.set_top(HeapAddr::new(0x31_0000));
        r.note_start_of_marking();
        r.add_to_marked_bytes(128);
        r.set_in_cset(true);
        r.reset_to_free();
        assert!(r.is_free());
        assert!(r.is_empty());
        assert!(!r.in_cset());
        assert_eq!(r.max_live_bytes(), 0);
    }
}
