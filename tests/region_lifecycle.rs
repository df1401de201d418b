//! Remark-time region bookkeeping: reclaiming dead regions, rebuild
//! selection, bitmap handover, producer buffers and root region scanning.

use std::sync::Arc;

use conmark::config::MarkingConfig;
use conmark::heap::{RegionIdx, RegionType};
use conmark::region_set::FreeRegionList;
use conmark::test_utils::TestFixture;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[test]
fn fully_dead_regions_are_reclaimed() {
    init_tracing();
    let fixture = TestFixture::new(4, 2);
    let dead = fixture.make_old(RegionIdx::new(0));
    let live = fixture.make_old(RegionIdx::new(1));
    let _garbage = fixture.heap.alloc(dead, 3);
    let root = fixture.heap.alloc(live, 0);
    fixture.heap.push_target(live, root);

    fixture.marker.run_cycle(&[dead, live], &[]).unwrap();

    let layout = fixture.heap.layout();
    assert!(layout.region(dead).is_free());
    assert!(layout.region(dead).is_empty());
    assert!(layout.region(live).is_old());

    // The reclaimed region landed on the cleanup list, ready to be merged
    // into the embedder's master free list.
    let mut master = FreeRegionList::new("master free list", Arc::clone(layout), None);
    master.set_unrealistically_long_length(100);
    fixture.marker.take_cleanup_list(&mut master);
    assert_eq!(master.iter().collect::<Vec<_>>(), vec![dead]);
    master.verify_list();
}

#[test]
fn rebuild_selection_records_tars_for_tracked_regions() {
    init_tracing();
    let fixture = TestFixture::new(4, 1);
    // Sparse old region: one small live object in a region-sized sea of
    // garbage; well below the liveness threshold, so selected.
    let sparse = fixture.make_old(RegionIdx::new(0));
    let keeper = fixture.heap.alloc(sparse, 0);
    let _garbage = fixture.heap.alloc(sparse, 500);
    fixture.heap.push_target(sparse, keeper);

    let young = RegionIdx::new(1);
    fixture
        .heap
        .layout()
        .region(young)
        .set_region_type(RegionType::Young);

    fixture.marker.run_cycle(&[sparse], &[]).unwrap();

    let layout = fixture.heap.layout();
    assert_eq!(
        fixture.marker.top_at_rebuild_start(sparse),
        Some(layout.region(sparse).top()),
        "selected region snapshots its frontier"
    );
    assert_eq!(fixture.marker.top_at_rebuild_start(young), None);
}

#[test]
fn bitmap_swap_hands_marks_to_prev() {
    init_tracing();
    let fixture = TestFixture::new(2, 1);
    let r0 = fixture.make_old(RegionIdx::new(0));
    let obj = fixture.heap.alloc(r0, 0);
    fixture.heap.push_target(r0, obj);

    fixture.marker.run_cycle(&[r0], &[]).unwrap();
    assert!(fixture.marker.is_marked_in_prev_bitmap(obj));

    // The retired bitmap becomes next and is cleared for reuse between
    // cycles; prev keeps this cycle's truth.
    fixture.marker.cleanup_for_next_mark();
    assert!(!fixture.marker.is_marked_in_next_bitmap(obj));
    assert!(fixture.marker.is_marked_in_prev_bitmap(obj));
}

#[test]
fn producer_buffer_entries_survive_into_the_marking() {
    init_tracing();
    let fixture = TestFixture::new(4, 2);
    let r0 = fixture.make_old(RegionIdx::new(0));
    let quiet = fixture.heap.alloc(r0, 0);
    let noisy = fixture.heap.alloc(r0, 0);
    fixture.heap.push_target(r0, quiet);

    fixture.marker.pre_initial_mark();
    fixture.marker.install_ms_cset(&[r0]);
    fixture.marker.post_initial_mark();

    // A mutator overwrites the last reference to `noisy` during marking;
    // its snapshot barrier logs the pre-image.
    fixture.marker.satb().enqueue(42, noisy);

    fixture.marker.scan_root_regions();
    fixture.marker.concurrent_marking();
    fixture.marker.remark().unwrap();
    fixture.marker.cleanup();

    assert!(fixture.marker.is_marked_in_prev_bitmap(quiet));
    assert!(
        fixture.marker.is_marked_in_prev_bitmap(noisy),
        "remark must drain the producer's private buffer"
    );
    assert!(!fixture.marker.satb().is_active());
}

#[test]
fn root_region_queues_seed_the_collection_set() {
    init_tracing();
    let fixture = TestFixture::new(4, 2);
    // The root region itself is not collected this cycle; its inbound
    // queue delivers implicitly live objects whose fields are traced.
    let root_region = fixture.make_old(RegionIdx::new(0));
    let cset_region = fixture.make_old(RegionIdx::new(1));

    let root_obj = fixture.heap.alloc(root_region, 1);
    let target = fixture.heap.alloc(cset_region, 0);
    fixture.heap.set_slot(root_obj, 0, Some(target));
    fixture.heap.push_target(root_region, root_obj);

    fixture.marker.pre_initial_mark();
    fixture.marker.install_ms_cset(&[cset_region]);
    fixture.marker.root_regions().add(root_region);
    fixture.marker.post_initial_mark();

    fixture.marker.scan_root_regions();
    assert!(!fixture.marker.root_regions().scan_in_progress());

    fixture.marker.concurrent_marking();
    fixture.marker.remark().unwrap();
    fixture.marker.cleanup();

    assert!(fixture.marker.is_marked_in_prev_bitmap(target));
    // The root object itself is outside the collection set: never marked.
    assert!(!fixture.marker.is_marked_in_prev_bitmap(root_obj));
}

#[test]
fn humongous_eager_reclaim_clears_marks_and_statistics() {
    init_tracing();
    let fixture = TestFixture::new(8, 1);
    let region_words = fixture.heap.layout().region_words();
    let start = RegionIdx::new(2);
    let h = fixture.heap.alloc_humongous(start, region_words * 2, 0);
    let r0 = fixture.make_old(RegionIdx::new(0));
    let a = fixture.heap.alloc(r0, 1);
    fixture.heap.set_slot(a, 0, Some(h));
    fixture.heap.push_target(r0, a);

    // Mid-cycle, before remark, the embedder eagerly reclaims the object.
    fixture.marker.pre_initial_mark();
    fixture.marker.install_ms_cset(&[r0, start]);
    fixture.marker.post_initial_mark();
    fixture.marker.concurrent_marking();

    assert!(fixture.marker.is_marked_in_next_bitmap(h));
    fixture.marker.humongous_object_eagerly_reclaimed(start);
    assert!(!fixture.marker.is_marked_in_next_bitmap(h));
    // Statistics across the spanned regions are gone, per-task caches
    // included, so remark will see the object as dead.
    assert_eq!(fixture.marker.liveness(start), 0);
    assert_eq!(fixture.marker.top_at_rebuild_start(start), None);
}

#[test]
fn weak_references_are_kept_alive_through_the_drain() {
    init_tracing();
    let config = MarkingConfig::default();
    let fixture = TestFixture::new_with_config(config, 4, 1);
    let r0 = fixture.make_old(RegionIdx::new(0));
    let strong = fixture.heap.alloc(r0, 0);
    let weakly_reachable = fixture.heap.alloc(r0, 0);
    fixture.heap.push_target(r0, strong);

    fixture.marker.pre_initial_mark();
    fixture.marker.install_ms_cset(&[r0]);
    fixture.marker.post_initial_mark();
    // Discovered during marking, e.g. by a reference-object scan.
    fixture.marker.ref_processor().discover(weakly_reachable);

    fixture.marker.scan_root_regions();
    fixture.marker.concurrent_marking();
    fixture.marker.remark().unwrap();
    fixture.marker.cleanup();

    assert!(fixture.marker.is_marked_in_prev_bitmap(strong));
    assert!(
        fixture.marker.is_marked_in_prev_bitmap(weakly_reachable),
        "the drain hands undiscovered referents to the marker"
    );
}
