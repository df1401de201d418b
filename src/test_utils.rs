//! In-process test heap and fixtures.
//!
//! The engine never touches real memory; everything it needs from the heap
//! goes through [`ObjectModel`]. `TestHeap` implements that trait over a
//! registry of synthetic objects so tests (and benches) can lay out object
//! graphs at chosen addresses and run full marking cycles against them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;

use crate::config::MarkingConfig;
use crate::heap::{HeapLayout, RegionIdx, RegionType, TargetRef};
use crate::marker::Marker;
use crate::object::{HeapAddr, ObjectModel, ObjectRef, WORD_BYTES};
use crate::policy::LivenessThresholdTracker;

/// Words of header before an object's reference slots.
pub const HEADER_WORDS: usize = 2;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ObjKind {
    /// Ordinary object: header plus reference slots.
    Plain,
    /// Array of references.
    ObjArray,
    /// Array of primitives: no reference slots.
    TypeArray,
}

struct TestObject {
    size_words: usize,
    kind: ObjKind,
    slots: Vec<AtomicUsize>,
    /// Completed field-iteration passes over this object.
    scans: AtomicUsize,
}

/// Synthetic heap backing the [`ObjectModel`] for tests.
pub struct TestHeap {
    layout: Arc<HeapLayout>,
    objects: DashMap<usize, TestObject>,
    /// Object start addresses ordered for slice-to-array resolution.
    starts: RwLock<BTreeMap<usize, usize>>,
    decommitted_regions: DashSet<u32>,
}

impl TestHeap {
    pub fn new(layout: Arc<HeapLayout>) -> Self {
        TestHeap {
            layout,
            objects: DashMap::new(),
            starts: RwLock::new(BTreeMap::new()),
            decommitted_regions: DashSet::new(),
        }
    }

    pub fn layout(&self) -> &Arc<HeapLayout> {
        &self.layout
    }

    fn register(&self, addr: HeapAddr, obj: TestObject) -> ObjectRef {
        let size = obj.size_words;
        self.starts.write().insert(addr.as_usize(), size);
        self.objects.insert(addr.as_usize(), obj);
        ObjectRef::from_addr_unchecked(addr)
    }

    /// Bump-allocate an ordinary object with `num_slots` reference slots in
    /// `region`, advancing the region's top.
    pub fn alloc(&self, region: RegionIdx, num_slots: usize) -> ObjectRef {
        self.alloc_kind(region, ObjKind::Plain, num_slots)
    }

    pub fn alloc_kind(&self, region: RegionIdx, kind: ObjKind, num_slots: usize) -> ObjectRef {
        let r = self.layout.region(region);
        let addr = r.top();
        // For type arrays `num_slots` is primitive payload words.
        let size_words = HEADER_WORDS + num_slots;
        let new_top = addr.add_words(size_words);
        assert!(new_top <= r.end(), "region {} overflow", region.raw());
        r.set_top(new_top);

        let slot_count = match kind {
            ObjKind::TypeArray => 0,
            _ => num_slots,
        };
        self.register(
            addr,
            TestObject {
                size_words,
                kind,
                slots: (0..slot_count).map(|_| AtomicUsize::new(0)).collect(),
                scans: AtomicUsize::new(0),
            },
        )
    }

    /// Lay out a humongous object of `words` total words starting at
    /// region `first`, with `num_slots` reference slots.
    pub fn alloc_humongous(&self, first: RegionIdx, words: usize, num_slots: usize) -> ObjectRef {
        assert!(words >= HEADER_WORDS + num_slots);
        self.layout.set_up_humongous(first, words);
        let bottom = self.layout.region(first).bottom();
        self.register(
            bottom,
            TestObject {
                size_words: words,
                kind: ObjKind::Plain,
                slots: (0..num_slots).map(|_| AtomicUsize::new(0)).collect(),
                scans: AtomicUsize::new(0),
            },
        )
    }

    /// Point reference slot `index` of `obj` at `target` (or null).
    pub fn set_slot(&self, obj: ObjectRef, index: usize, target: Option<ObjectRef>) {
        let entry = self.objects.get(&obj.addr().as_usize()).expect("unknown object");
        entry.slots[index].store(
            target.map(|t| t.addr().as_usize()).unwrap_or(0),
            Ordering::Release,
        );
    }

    /// Deliver `target` to `region`'s inbound queue, as the transport
    /// would for a cross-region root.
    pub fn push_target(&self, region: RegionIdx, target: ObjectRef) {
        self.layout
            .region(region)
            .target_obj_queue()
            .push(TargetRef::Full(target));
    }

    /// Simulate the CPU server decommitting a source region: references
    /// read out of it fail the transport check.
    pub fn decommit_source_region(&self, region: RegionIdx) {
        self.decommitted_regions.insert(region.raw());
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// How many times `obj`'s fields have been iterated.
    pub fn scan_count(&self, obj: ObjectRef) -> usize {
        self.with_object(obj, |o| o.scans.load(Ordering::Acquire))
    }

    fn with_object<R>(&self, obj: ObjectRef, f: impl FnOnce(&TestObject) -> R) -> R {
        let entry = self
            .objects
            .get(&obj.addr().as_usize())
            .unwrap_or_else(|| panic!("no object at {:?}", obj));
        f(entry.value())
    }
}

impl ObjectModel for TestHeap {
    fn size_in_words(&self, obj: ObjectRef) -> usize {
        self.with_object(obj, |o| o.size_words)
    }

    fn is_type_array(&self, obj: ObjectRef) -> bool {
        self.with_object(obj, |o| o.kind == ObjKind::TypeArray)
    }

    fn is_obj_array(&self, obj: ObjectRef) -> bool {
        self.with_object(obj, |o| o.kind == ObjKind::ObjArray)
    }

    fn obj_array_len(&self, obj: ObjectRef) -> usize {
        self.with_object(obj, |o| {
            debug_assert_eq!(o.kind, ObjKind::ObjArray);
            o.slots.len()
        })
    }

    fn obj_array_slot_addr(&self, obj: ObjectRef, index: usize) -> HeapAddr {
        obj.addr().add_words(HEADER_WORDS + index)
    }

    fn array_containing_slice(&self, slice: HeapAddr) -> ObjectRef {
        let starts = self.starts.read();
        let (&start, &size) = starts
            .range(..=slice.as_usize())
            .next_back()
            .expect("slice points below every object");
        assert!(
            slice.as_usize() < start + size * WORD_BYTES,
            "slice points past its array"
        );
        ObjectRef::from_addr_unchecked(HeapAddr::new(start))
    }

    fn for_each_field(&self, obj: ObjectRef, f: &mut dyn FnMut(usize)) {
        self.with_object(obj, |o| {
            o.scans.fetch_add(1, Ordering::AcqRel);
            for slot in &o.slots {
                f(slot.load(Ordering::Acquire));
            }
        })
    }

    fn for_each_array_slot(&self, obj: ObjectRef, from: usize, to: usize, f: &mut dyn FnMut(usize)) {
        self.with_object(obj, |o| {
            for slot in &o.slots[from..to] {
                f(slot.load(Ordering::Acquire));
            }
        })
    }

    fn source_region_committed(&self, addr: HeapAddr) -> bool {
        match self.layout.addr_to_region(addr) {
            Some(idx) => !self.decommitted_regions.contains(&idx.raw()),
            None => false,
        }
    }
}

/// A heap, a model and a marker wired together for tests.
pub struct TestFixture {
    pub heap: Arc<TestHeap>,
    pub marker: Marker,
}

impl TestFixture {
    /// Small heap, default configuration.
    pub fn new(num_regions: u32, workers: usize) -> Self {
        Self::new_with_config(MarkingConfig::default(), num_regions, workers)
    }

    pub fn new_with_config(config: MarkingConfig, num_regions: u32, workers: usize) -> Self {
        let layout = Arc::new(HeapLayout::new(
            HeapAddr::new(0x1000_0000),
            num_regions,
            config.region_bytes,
            config.target_queue_capacity,
        ));
        let heap = Arc::new(TestHeap::new(Arc::clone(&layout)));
        let tracker = Arc::new(LivenessThresholdTracker::new(
            config.rebuild_live_threshold_percent,
        ));
        let marker = Marker::new(
            layout,
            Arc::clone(&heap) as Arc<dyn ObjectModel>,
            tracker,
            config,
            workers,
        );
        TestFixture { heap, marker }
    }

    /// Make `region` an old region (the usual collection-set member type).
    pub fn make_old(&self, region: RegionIdx) -> RegionIdx {
        self.heap
            .layout()
            .region(region)
            .set_region_type(RegionType::Old);
        region
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_advances_top_and_registers() {
        let fixture = TestFixture::new(4, 1);
        let r = fixture.make_old(RegionIdx::new(0));
        let a = fixture.heap.alloc(r, 2);
        let b = fixture.heap.alloc(r, 0);
        assert_eq!(
            b.addr(),
            a.addr().add_words(HEADER_WORDS + 2),
            "bump allocation is contiguous"
        );
        assert_eq!(fixture.heap.size_in_words(a), HEADER_WORDS + 2);
    }

    #[test]
    fn slice_resolution_finds_owning_array() {
        let fixture = TestFixture::new(4, 1);
        let r = fixture.make_old(RegionIdx::new(0));
        let array = fixture.heap.alloc_kind(r, ObjKind::ObjArray, 64);
        let slice = fixture.heap.obj_array_slot_addr(array, 17);
        assert_eq!(fixture.heap.array_containing_slice(slice), array);
    }

    #[test]
    fn decommitted_regions_fail_the_read_check() {
        let fixture = TestFixture::new(4, 1);
        let r = fixture.make_old(RegionIdx::new(1));
        let obj = fixture.heap.alloc(r, 0);
        assert!(fixture.heap.source_region_committed(obj.addr()));
        fixture.heap.decommit_source_region(r);
        assert!(!fixture.heap.source_region_committed(obj.addr()));
    }
}
