//! Work stealing, termination and queue-closure behavior under imbalance.

use conmark::config::MarkingConfig;
use conmark::heap::RegionIdx;
use conmark::test_utils::TestFixture;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[test]
fn imbalanced_cset_is_shared_between_workers() {
    init_tracing();
    // Small local queues force frequent spills and give thieves something
    // to find even when one worker claims most regions.
    let config = MarkingConfig {
        task_queue_capacity: 256,
        ..Default::default()
    };
    let fixture = TestFixture::new_with_config(config, 12, 4);

    let mut regions = Vec::new();
    let mut all_objects = Vec::new();
    for i in 0..10 {
        let r = fixture.make_old(RegionIdx::new(i));
        let root = fixture.heap.alloc(r, 999);
        fixture.heap.push_target(r, root);
        all_objects.push(root);
        for slot in 0..999 {
            let child = fixture.heap.alloc(r, 0);
            fixture.heap.set_slot(root, slot, Some(child));
            all_objects.push(child);
        }
        regions.push(r);
    }

    fixture.marker.run_cycle(&regions, &[]).unwrap();

    // Every object marked and field-iterated exactly once.
    for obj in &all_objects {
        assert!(fixture.marker.is_marked_in_prev_bitmap(*obj));
        assert_eq!(fixture.heap.scan_count(*obj), 1);
    }

    // All references were reached exactly once in total: one queue entry
    // per region root plus one field reference per child.
    let refs: Vec<usize> = fixture.marker.per_worker_refs_reached();
    assert_eq!(refs.iter().sum::<usize>(), 10 * 1000);

    // The claim protocol and stealing spread the work; with ten regions
    // and four workers a single worker never ends up doing everything.
    let busy = refs.iter().filter(|&&r| r > 0).count();
    assert!(busy >= 2, "expected work distribution, got {:?}", refs);

    assert!(fixture.marker.mark_stack_empty());
    assert!(fixture.marker.task_queue_sizes().iter().all(|&s| s == 0));
}

#[test]
fn each_cset_region_is_claimed_exactly_once() {
    init_tracing();
    let fixture = TestFixture::new(16, 4);
    let mut regions = Vec::new();
    for i in 0..16 {
        let r = fixture.make_old(RegionIdx::new(i));
        let _ = fixture.heap.alloc(r, 0); // non-empty so claims succeed
        regions.push(r);
    }
    fixture.marker.pre_initial_mark();
    fixture.marker.install_ms_cset(&regions);

    let claimed: Vec<Vec<u32>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let marker = &fixture.marker;
                s.spawn(move || {
                    let mut mine = Vec::new();
                    while !marker.out_of_ms_cset() {
                        if let Some(idx) = marker.claim_region(worker) {
                            mine.push(idx.raw());
                        }
                    }
                    mine
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut all: Vec<u32> = claimed.into_iter().flatten().collect();
    all.sort_unstable();
    assert_eq!(all, (0..16).collect::<Vec<_>>(), "each region claimed once");
    assert!(fixture.marker.out_of_ms_cset());
}

#[test]
fn empty_regions_are_skipped_by_the_claim_protocol() {
    let fixture = TestFixture::new(4, 1);
    let r0 = fixture.make_old(RegionIdx::new(0));
    let r1 = fixture.make_old(RegionIdx::new(1)); // stays empty
    let r2 = fixture.make_old(RegionIdx::new(2));
    let _ = fixture.heap.alloc(r0, 0);
    let _ = fixture.heap.alloc(r2, 0);

    fixture.marker.pre_initial_mark();
    fixture.marker.install_ms_cset(&[r0, r1, r2]);

    let mut claimed = Vec::new();
    while !fixture.marker.out_of_ms_cset() {
        if let Some(idx) = fixture.marker.claim_region(0) {
            claimed.push(idx);
        }
    }
    // The empty region is passed over with a None that the caller retries.
    assert_eq!(claimed, vec![r0, r2]);
}
