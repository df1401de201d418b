//! The marking coordinator.
//!
//! One `Marker` owns everything a marking cycle shares: both cycle bitmaps,
//! the global overflow stack, the region claim finger, the worker tasks and
//! their queues, the overflow barrier pair, the terminator and the phase
//! machine. It is an explicitly constructed object handed to workers by
//! reference; there are no process-wide singletons, and a test harness
//! instantiates one per test.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::bitmap::MarkBitmap;
use crate::config::MarkingConfig;
use crate::error::{MarkError, MarkResult};
use crate::heap::{HeapLayout, Region, RegionIdx};
use crate::mark_stack::{MarkStack, ENTRIES_PER_CHUNK};
use crate::object::{HeapAddr, MemRegion, ObjectModel, ObjectRef, TaskEntry, WORD_BYTES};
use crate::policy::RemSetTracker;
use crate::refs::ReferenceProcessor;
use crate::region_set::{FreeListChecker, FreeRegionList, RegionSetChecker};
use crate::root_regions::RootRegionClaimer;
use crate::satb::SatbBufferSet;
use crate::stats::{MarkStatsCache, RegionMarkStats};
use crate::sync::{SuspendibleSet, Terminator, WorkerBarrier};
use crate::task::MarkerTask;
use crate::task_queue::{TaskQueue, TaskQueueStealer};

use crate::heap::NO_REGION;

/// Phases of the marking cycle state machine.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MarkPhase {
    Idle,
    PreInitialMark,
    PostInitialMark,
    RootRegionScan,
    ConcurrentMark,
    Remark,
    Cleanup,
    Aborted,
}

/// Callback slot for class/metadata unloading at remark. The engine only
/// provides the hook; policy lives with the embedder.
pub type ClassUnloadHook = Box<dyn Fn() + Send + Sync>;

/// Coordinator for concurrent marking over a memory-server collection set.
///
/// # Examples
///
/// ```
/// use conmark::heap::RegionIdx;
/// use conmark::test_utils::TestFixture;
///
/// let fixture = TestFixture::new(4, 2);
/// let region = fixture.make_old(RegionIdx::new(0));
/// let obj = fixture.heap.alloc(region, 0);
/// fixture.heap.push_target(region, obj);
///
/// fixture.marker.run_cycle(&[region], &[]).unwrap();
/// assert!(fixture.marker.is_marked_in_prev_bitmap(obj));
/// assert!(fixture.marker.mark_stack_empty());
/// ```
pub struct Marker {
    heap: Arc<HeapLayout>,
    model: Arc<dyn ObjectModel>,
    config: MarkingConfig,

    max_workers: usize,
    active_workers: AtomicUsize,
    pool: rayon::ThreadPool,

    prev_bitmap: ArcSwap<MarkBitmap>,
    next_bitmap: ArcSwap<MarkBitmap>,
    /// Reserved for the evacuation stage; allocated here, never read.
    dest_bitmap: Arc<MarkBitmap>,

    global_mark_stack: MarkStack,
    root_regions: RootRegionClaimer,
    satb: SatbBufferSet,
    ref_processor: ReferenceProcessor,
    remset_tracker: Arc<dyn RemSetTracker>,
    class_unload_hook: Option<ClassUnloadHook>,

    tasks: Vec<Mutex<MarkerTask>>,
    stealers: Vec<TaskQueueStealer>,

    region_mark_stats: RegionMarkStats,
    top_at_rebuild_starts: Vec<AtomicUsize>,

    /// Bottom address of the first unclaimed collection-set region;
    /// 0 is the canonical "collection set exhausted" signal.
    finger: AtomicUsize,
    cset_head: AtomicU32,

    first_sync: WorkerBarrier,
    second_sync: WorkerBarrier,
    terminator: Terminator,
    suspendible: SuspendibleSet,

    current_phase: ArcSwap<MarkPhase>,
    phase_tx: flume::Sender<MarkPhase>,
    phase_rx: flume::Receiver<MarkPhase>,

    has_overflown: AtomicBool,
    concurrent: AtomicBool,
    has_aborted: AtomicBool,
    restart_for_overflow: AtomicBool,
    /// Set between an overflow reset and the end of marking; claimed
    /// regions then rescan their marked objects to recover the work that
    /// was dropped with the queues.
    restarted_after_overflow: AtomicBool,
    /// Per-region claim for the liveness rebuild that accompanies an
    /// overflow rescan; the rebuild must happen exactly once per region
    /// per restart even when the rescan itself aborts and is redone.
    liveness_rebuilt: Vec<AtomicBool>,

    cleanup_list_lock: Arc<Mutex<()>>,
    cleanup_list: Mutex<FreeRegionList>,
}

impl Marker {
    pub fn new(
        heap: Arc<HeapLayout>,
        model: Arc<dyn ObjectModel>,
        remset_tracker: Arc<dyn RemSetTracker>,
        config: MarkingConfig,
        max_workers: usize,
    ) -> Self {
        assert!(max_workers >= 1, "need at least one marking worker");
        let covered = heap.reserved();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(max_workers)
            .thread_name(|i| format!("marking-worker-{}", i))
            .build()
            .expect("failed to create marking worker pool");

        let next_bitmap = Arc::new(MarkBitmap::new(covered));
        let mut tasks = Vec::with_capacity(max_workers);
        let mut stealers = Vec::with_capacity(max_workers);
        for worker_id in 0..max_workers {
            let queue = TaskQueue::new(config.task_queue_capacity);
            stealers.push(queue.stealer());
            tasks.push(Mutex::new(MarkerTask::new(
                worker_id,
                queue,
                MarkStatsCache::new(config.stats_cache_entries),
                Arc::clone(&next_bitmap),
            )));
        }

        let num_regions = heap.num_regions();
        let list_bound = config.resolved_list_bound(num_regions);
        let cleanup_list_lock = Arc::new(Mutex::new(()));
        let checker: Arc<dyn RegionSetChecker> =
            Arc::new(FreeListChecker::new(Arc::clone(&cleanup_list_lock)));
        let mut cleanup_list =
            FreeRegionList::new("cleanup list", Arc::clone(&heap), Some(checker));
        cleanup_list.set_unrealistically_long_length(list_bound);

        let (phase_tx, phase_rx) = flume::bounded(64);

        tracing::debug!(
            workers = max_workers,
            regions = num_regions,
            "initialize marking engine"
        );

        Marker {
            prev_bitmap: ArcSwap::from_pointee(MarkBitmap::new(covered)),
            next_bitmap: ArcSwap::new(Arc::clone(&next_bitmap)),
            dest_bitmap: Arc::new(MarkBitmap::new(covered)),
            global_mark_stack: MarkStack::new(
                config.mark_stack_initial_chunks,
                config.mark_stack_max_chunks,
            ),
            root_regions: RootRegionClaimer::new(num_regions as usize),
            satb: SatbBufferSet::new(config.satb_buffer_capacity, config.satb_process_threshold),
            ref_processor: ReferenceProcessor::new(),
            remset_tracker,
            class_unload_hook: None,
            tasks,
            stealers,
            region_mark_stats: RegionMarkStats::new(num_regions),
            top_at_rebuild_starts: (0..num_regions).map(|_| AtomicUsize::new(0)).collect(),
            finger: AtomicUsize::new(0),
            cset_head: AtomicU32::new(NO_REGION),
            first_sync: WorkerBarrier::new(max_workers),
            second_sync: WorkerBarrier::new(max_workers),
            terminator: Terminator::new(max_workers),
            suspendible: SuspendibleSet::new(),
            current_phase: ArcSwap::from_pointee(MarkPhase::Idle),
            phase_tx,
            phase_rx,
            has_overflown: AtomicBool::new(false),
            concurrent: AtomicBool::new(false),
            has_aborted: AtomicBool::new(false),
            restart_for_overflow: AtomicBool::new(false),
            restarted_after_overflow: AtomicBool::new(false),
            liveness_rebuilt: (0..num_regions).map(|_| AtomicBool::new(false)).collect(),
            cleanup_list_lock,
            cleanup_list: Mutex::new(cleanup_list),
            heap,
            model,
            config,
            max_workers,
            active_workers: AtomicUsize::new(max_workers),
            pool,
        }
    }

    /// Install the class-unloading hook invoked at the end of remark.
    pub fn set_class_unload_hook(&mut self, hook: ClassUnloadHook) {
        self.class_unload_hook = Some(hook);
    }

    // Accessors shared with the tasks.

    pub fn config(&self) -> &MarkingConfig {
        &self.config
    }

    pub fn heap(&self) -> &HeapLayout {
        &self.heap
    }

    pub fn model(&self) -> &dyn ObjectModel {
        self.model.as_ref()
    }

    pub fn satb(&self) -> &SatbBufferSet {
        &self.satb
    }

    pub fn ref_processor(&self) -> &ReferenceProcessor {
        &self.ref_processor
    }

    pub fn root_regions(&self) -> &RootRegionClaimer {
        &self.root_regions
    }

    pub fn suspendible(&self) -> &SuspendibleSet {
        &self.suspendible
    }

    pub(crate) fn terminator(&self) -> &Terminator {
        &self.terminator
    }

    pub(crate) fn region_mark_stats(&self) -> &RegionMarkStats {
        &self.region_mark_stats
    }

    pub fn dest_bitmap(&self) -> &Arc<MarkBitmap> {
        &self.dest_bitmap
    }

    pub fn global_mark_stack(&self) -> &MarkStack {
        &self.global_mark_stack
    }

    /// Whether the overflow barrier pair is currently in the aborted state.
    pub fn overflow_barriers_aborted(&self) -> bool {
        self.first_sync.is_aborted() && self.second_sync.is_aborted()
    }

    /// Per-worker reference counts for the current cycle, in worker order.
    pub fn per_worker_refs_reached(&self) -> Vec<usize> {
        self.tasks.iter().map(|t| t.lock().refs_reached()).collect()
    }

    /// Sizes of all task queues; all zero after a completed cycle.
    pub fn task_queue_sizes(&self) -> Vec<usize> {
        self.tasks.iter().map(|t| t.lock().queue().size()).collect()
    }

    pub fn current_phase(&self) -> MarkPhase {
        **self.current_phase.load()
    }

    /// Receiver of phase-change notifications.
    pub fn phase_events(&self) -> &flume::Receiver<MarkPhase> {
        &self.phase_rx
    }

    fn set_phase(&self, phase: MarkPhase) {
        self.current_phase.store(Arc::new(phase));
        let _ = self.phase_tx.try_send(phase);
    }

    pub fn has_overflown(&self) -> bool {
        self.has_overflown.load(Ordering::Acquire)
    }

    pub fn has_aborted(&self) -> bool {
        self.has_aborted.load(Ordering::Acquire)
    }

    pub fn concurrent(&self) -> bool {
        self.concurrent.load(Ordering::Acquire)
    }

    pub fn restart_for_overflow(&self) -> bool {
        self.restart_for_overflow.load(Ordering::Acquire)
    }

    pub(crate) fn restarted_after_overflow(&self) -> bool {
        self.restarted_after_overflow.load(Ordering::Acquire)
    }

    /// One worker per restart gets to rebuild a region's liveness from its
    /// surviving marks; the rescan itself may run more than once.
    pub(crate) fn claim_liveness_rebuild(&self, idx: RegionIdx) -> bool {
        !self.liveness_rebuilt[idx.as_usize()].swap(true, Ordering::AcqRel)
    }

    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::Acquire)
    }

    // Global mark stack.

    pub fn mark_stack_empty(&self) -> bool {
        self.global_mark_stack.is_empty()
    }

    pub(crate) fn mark_stack_size(&self) -> usize {
        self.global_mark_stack.size_in_entries()
    }

    /// Bulk-push a chunk; a failure raises the global overflow condition.
    pub(crate) fn mark_stack_push(&self, buffer: &[TaskEntry; ENTRIES_PER_CHUNK]) -> bool {
        if self.global_mark_stack.par_push_chunk(buffer) {
            true
        } else {
            self.has_overflown.store(true, Ordering::Release);
            false
        }
    }

    pub(crate) fn mark_stack_pop(&self, buffer: &mut [TaskEntry; ENTRIES_PER_CHUNK]) -> bool {
        self.global_mark_stack.par_pop_chunk(buffer)
    }

    // Collection-set claim protocol.

    /// Build the collection-set chain and point the finger at its head.
    /// The regions' marking snapshots must already be in place.
    pub fn install_ms_cset(&self, regions: &[RegionIdx]) {
        for pair in regions.windows(2) {
            self.heap.region(pair[0]).set_cset_next(Some(pair[1]));
        }
        if let Some(&last) = regions.last() {
            self.heap.region(last).set_cset_next(None);
        }
        for &idx in regions {
            let region = self.heap.region(idx);
            assert!(
                !region.is_continues_humongous(),
                "continues-humongous region {} must not enter the collection set",
                idx.raw()
            );
            region.set_in_cset(true);
        }
        let head = regions.first().copied();
        self.cset_head.store(RegionIdx::pack(head), Ordering::Release);
        let finger = head
            .map(|h| self.heap.region(h).bottom().as_usize())
            .unwrap_or(0);
        self.finger.store(finger, Ordering::Release);
    }

    /// A null finger is the sole "collection set exhausted" signal.
    pub fn out_of_ms_cset(&self) -> bool {
        self.finger.load(Ordering::Acquire) == 0
    }

    /// Claim the region under the finger and advance the finger along the
    /// intrusive chain. `None` either means the chain is exhausted (check
    /// [`Self::out_of_ms_cset`]) or this particular attempt lost the race
    /// or hit an empty region; the caller simply retries.
    pub fn claim_region(&self, _worker_id: usize) -> Option<RegionIdx> {
        loop {
            let old = self.finger.load(Ordering::Acquire);
            if old == 0 {
                return None;
            }
            let region = self
                .heap
                .region_containing(HeapAddr::new(old))
                .expect("finger points into the heap");
            // The acquire load above pairs with the chain publication; the
            // chain fields below must not be read before it.
            let next = region
                .cset_next()
                .map(|idx| self.heap.region(idx).bottom().as_usize())
                .unwrap_or(0);
            if self
                .finger
                .compare_exchange(old, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // Regions with nothing below NTAMS carry no markable
                // objects; the caller retries for the next region.
                if region.ntams() > region.bottom() {
                    return Some(region.index());
                }
                return None;
            }
            // Lost the race; re-read the finger and try again.
        }
    }

    /// Steal one entry from any other active worker's queue. `None` after a
    /// full survey found nothing.
    pub(crate) fn try_stealing(&self, worker_id: usize) -> Option<TaskEntry> {
        let n = self.active_workers();
        for i in 1..n {
            let victim = (worker_id + i) % n;
            if let Some(entry) = self.stealers[victim].steal() {
                return Some(entry);
            }
        }
        None
    }

    // Overflow barriers.

    /// First overflow rendezvous: after it, no task is touching shared
    /// marking state. Returns false when the barrier was aborted.
    pub(crate) fn enter_first_sync_barrier(&self, _worker_id: usize) -> bool {
        // Leave the suspendible set while parked so a pause requester is
        // not blocked on us; rejoin (and possibly wait out a pause) after.
        let concurrent = self.concurrent();
        if concurrent {
            self.suspendible.leave();
        }
        let entered = self.first_sync.enter();
        if concurrent {
            self.suspendible.join();
        }
        entered
    }

    /// Second overflow rendezvous: after it, the shared state has been
    /// reinitialized and tasks restart claiming from the chain head.
    pub(crate) fn enter_second_sync_barrier(&self, _worker_id: usize) {
        let concurrent = self.concurrent();
        if concurrent {
            self.suspendible.leave();
        }
        let _ = self.second_sync.enter();
        if concurrent {
            self.suspendible.join();
        }
    }

    // Marking state resets.

    /// Reinitialize the shared marking state after an overflow (worker 0,
    /// between the two barriers) or when marking finishes.
    pub(crate) fn reset_marking_for_restart(&self) {
        self.global_mark_stack.set_empty();

        if self.has_overflown() {
            self.global_mark_stack.expand();
            // Liveness is rebuilt from the surviving marks during the
            // restart rescan; stale counters would double-count.
            self.region_mark_stats.clear_all();
            for claimed in &self.liveness_rebuilt {
                claimed.store(false, Ordering::Release);
            }
            self.restarted_after_overflow.store(true, Ordering::Release);
        }
        self.has_overflown.store(false, Ordering::Release);

        let head = RegionIdx::from_packed(self.cset_head.load(Ordering::Acquire));
        let finger = head
            .map(|h| self.heap.region(h).bottom().as_usize())
            .unwrap_or(0);
        self.finger.store(finger, Ordering::Release);
    }

    fn set_concurrency(&self, active: usize) {
        assert!(active <= self.max_workers, "more active tasks than exist");
        self.active_workers.store(active, Ordering::Release);
        self.terminator.reset_for_reuse(active);
        self.first_sync.set_n_workers(active);
        self.second_sync.set_n_workers(active);
    }

    fn set_concurrency_and_phase(&self, active: usize, concurrent: bool) {
        self.set_concurrency(active);
        self.concurrent.store(concurrent, Ordering::Release);
        if !concurrent {
            // Entering a stop-the-world phase; marking must have consumed
            // the whole collection set by now.
            debug_assert!(self.out_of_ms_cset(), "STW phase with unclaimed regions");
        }
    }

    /// Reset everything for a new cycle. Stop-the-world.
    fn reset(&self) {
        self.has_aborted.store(false, Ordering::Release);
        self.restart_for_overflow.store(false, Ordering::Release);
        self.restarted_after_overflow.store(false, Ordering::Release);
        self.concurrent.store(false, Ordering::Release);
        self.reset_marking_for_restart();

        let next = self.next_bitmap.load_full();
        for task in &self.tasks {
            task.lock().reset(Arc::clone(&next));
        }
        self.region_mark_stats.clear_all();
        for tars in &self.top_at_rebuild_starts {
            tars.store(0, Ordering::Release);
        }
    }

    fn reset_at_marking_complete(&self) {
        self.reset_marking_for_restart();
        self.restarted_after_overflow.store(false, Ordering::Release);
        self.active_workers.store(0, Ordering::Release);
    }

    /// Clear global and per-task marking state with every worker stopped.
    /// A pending overflow still expands the stack and arms the restart
    /// rescan, exactly as the concurrent reset does.
    fn reset_marking_state_stw(&self) {
        self.reset_marking_for_restart();
        for task in &self.tasks {
            let mut task = task.lock();
            task.clear_region_fields();
            task.reset_mark_stats_cache();
            task.queue().set_empty();
        }
    }

    // Cycle control.

    /// Initial-mark pause, part one: reset marking structures and snapshot
    /// every region's allocation frontier into NTAMS.
    pub fn pre_initial_mark(&self) {
        self.set_phase(MarkPhase::PreInitialMark);
        self.reset();

        for region in self.heap.regions() {
            region.note_start_of_marking();
            // Stale membership from a previous, possibly aborted cycle.
            region.set_in_cset(false);
            region.set_cset_next(None);
        }
        self.cset_head.store(NO_REGION, Ordering::Release);
        self.finger.store(0, Ordering::Release);
        self.root_regions.reset();
    }

    /// Initial-mark pause, part two: arm reference discovery and the
    /// producer buffers, and publish the root regions for scanning.
    pub fn post_initial_mark(&self) {
        self.set_phase(MarkPhase::PostInitialMark);
        self.ref_processor.enable_discovery();
        self.ref_processor.setup_policy(false);
        self.satb.set_active_all_threads(true, false);
        self.root_regions.prepare_for_scan();
    }

    /// Concurrent root-region scan: workers drain each root region's
    /// inbound queue, tracing the entries' fields into the collection set.
    pub fn scan_root_regions(&self) {
        if !self.root_regions.scan_in_progress() {
            // Known-empty root set; retain the phase but skip the work.
            tracing::debug!("no root regions published, skipping root region scan");
            return;
        }
        self.set_phase(MarkPhase::RootRegionScan);
        let workers = self
            .max_workers
            .min(self.root_regions.num_root_regions())
            .max(1);
        tracing::debug!(
            workers,
            regions = self.root_regions.num_root_regions(),
            "root region scan"
        );
        self.pool.scope(|s| {
            for worker_id in 0..workers {
                s.spawn(move |_| {
                    let mut task = self.tasks[worker_id].lock();
                    while let Some(idx) = self.root_regions.claim_next() {
                        self.scan_root_region(&mut task, idx);
                    }
                });
            }
        });
        self.root_regions.scan_finished();
    }

    fn scan_root_region(&self, task: &mut MarkerTask, idx: RegionIdx) {
        let region = self.heap.region(idx);
        debug_assert!(
            region.is_old() || (region.is_survivor() && region.ntams() == region.bottom()),
            "root regions must be old or survivor"
        );
        // The inbound queue holds this cycle's roots: implicitly live
        // objects whose fields seed marking. The objects themselves are
        // not marked; only what they reach inside the collection set is.
        let queue = region.target_obj_queue();
        loop {
            let r = match queue.pop_overflow().or_else(|| queue.pop_local(0)) {
                Some(r) => r,
                None => break,
            };
            if let Some(obj) = r.decode(self.heap.start()) {
                task.scan_task_entry(self, TaskEntry::from_obj(obj));
            }
        }
    }

    fn do_yield_check(&self) {
        if self.suspendible.should_yield() {
            self.suspendible.yield_now();
        }
    }

    /// The concurrent marking phase: workers claim collection-set regions
    /// and trace until the set is exhausted and termination is agreed.
    /// Overflow restarts happen internally; a cycle abort makes every task
    /// drop out.
    pub fn concurrent_marking(&self) {
        self.restart_for_overflow.store(false, Ordering::Release);
        let active = self.max_workers.max(1);
        self.set_concurrency_and_phase(active, true);
        self.set_phase(MarkPhase::ConcurrentMark);
        tracing::info!(workers = active, "concurrent marking");

        self.pool.scope(|s| {
            for worker_id in 0..active {
                s.spawn(move |_| {
                    self.suspendible.join();
                    {
                        let mut task = self.tasks[worker_id].lock();
                        if !self.has_aborted() {
                            loop {
                                task.do_marking_step(
                                    self,
                                    self.config.step_time_target_ms,
                                    true,
                                    false,
                                );
                                self.do_yield_check();
                                if self.has_aborted() || !task.has_aborted() {
                                    break;
                                }
                            }
                        }
                    }
                    self.suspendible.leave();
                });
            }
        });
        self.print_stats();
    }

    /// Stop-the-world remark: finalize marking, settle weak references,
    /// flush liveness, swap the bitmaps, pick the rebuild set and reclaim
    /// regions that died entirely.
    pub fn remark(&self) -> MarkResult<()> {
        if self.has_aborted() {
            return Err(MarkError::CycleAborted);
        }
        self.set_phase(MarkPhase::Remark);
        self.finalize_marking();

        let mark_finished = !self.has_overflown();
        if mark_finished {
            self.weak_refs_work()?;
            self.satb.set_active_all_threads(false, true);
            self.flush_all_task_caches();
            self.swap_mark_bitmaps();
            self.update_remset_tracking_before_rebuild();
            self.reclaim_empty_regions();
            if let Some(hook) = &self.class_unload_hook {
                hook();
            }
            debug_assert!(!self.restart_for_overflow());
            self.reset_at_marking_complete();
        } else {
            // Overflow during the pause: no swap, no rebuild set. Clear the
            // marking state and restart the concurrent phase.
            tracing::info!("remark overflowed the mark stack, restarting concurrent mark");
            self.restart_for_overflow.store(true, Ordering::Release);
            self.reset_marking_state_stw();
        }
        Ok(())
    }

    /// Run every worker's marking step to completion, having each visit
    /// the producer threads' private buffers exactly once first.
    fn finalize_marking(&self) {
        let active = self.max_workers;
        self.set_concurrency_and_phase(active, false);

        let satb_threads = self.satb.threads_with_buffers();
        let cursor = AtomicUsize::new(0);
        let cursor = &cursor;
        let satb_threads = &satb_threads;

        self.pool.scope(|s| {
            for worker_id in 0..active {
                s.spawn(move |_| {
                    let mut task = self.tasks[worker_id].lock();
                    loop {
                        let i = cursor.fetch_add(1, Ordering::Relaxed);
                        match satb_threads.get(i) {
                            Some(&thread_id) => task.drain_thread_satb_buffer(self, thread_id),
                            None => break,
                        }
                    }
                    loop {
                        task.do_marking_step(self, 1_000_000_000.0, true, false);
                        // An overflow here must not restart inside the
                        // pause; remark reschedules the concurrent phase.
                        if !(task.has_aborted() && !self.has_overflown()) {
                            break;
                        }
                    }
                });
            }
        });

        assert!(
            self.has_overflown() || self.satb.completed_buffers_num() == 0,
            "producer buffers remain after finalize: {}",
            self.satb.completed_buffers_num()
        );
        self.print_stats();
    }

    /// Drain the discovered references through worker 0's keep-alive and
    /// marking paths. Overflow here is unrecoverable.
    fn weak_refs_work(&self) -> MarkResult<()> {
        debug_assert!(self.mark_stack_empty(), "mark stack should be empty");
        let task_cell = RefCell::new(self.tasks[0].lock());

        let is_alive = |obj: ObjectRef| self.is_live(obj);
        let mut keep_alive = |obj: ObjectRef| {
            let mut task = task_cell.borrow_mut();
            if let Some(region) = self.heap.region_containing(obj.addr()) {
                if region.in_cset() {
                    task.make_reference_alive(self, region, obj);
                }
            }
        };
        let mut complete_gc = || {
            let mut task = task_cell.borrow_mut();
            loop {
                task.do_marking_step(self, 1_000_000_000.0, true, true);
                if !(task.has_aborted() && !self.has_overflown()) {
                    break;
                }
            }
        };
        self.ref_processor
            .process_discovered_references(&is_alive, &mut keep_alive, &mut complete_gc);
        drop(task_cell);

        if self.has_overflown() {
            // Liveness can no longer be trusted; the embedder must grow
            // the configured maximum and retry from scratch.
            tracing::error!("mark stack overflow during reference processing");
            return Err(MarkError::ReferenceOverflow);
        }
        debug_assert!(self.mark_stack_empty(), "marking should have completed");
        Ok(())
    }

    fn flush_all_task_caches(&self) {
        let mut hits = 0;
        let mut misses = 0;
        for task in &self.tasks {
            let (h, m) = task.lock().flush_mark_stats_cache(self);
            hits += h;
            misses += m;
        }
        let total = hits + misses;
        tracing::debug!(
            hits,
            misses,
            ratio = if total > 0 { hits as f64 / total as f64 } else { 0.0 },
            "mark stats cache flushed"
        );
    }

    /// Install the completed bitmap as `prev`; the old `prev` becomes the
    /// `next` of the following cycle and is cleared before it starts.
    fn swap_mark_bitmaps(&self) {
        let prev = self.prev_bitmap.load_full();
        let next = self.next_bitmap.load_full();
        self.prev_bitmap.store(next);
        self.next_bitmap.store(prev);
    }

    fn update_remset_tracking_before_rebuild(&self) {
        let num_regions = self.heap.num_regions();
        // Roughly one worker per 384 regions, as the update is cheap.
        let workers = self
            .max_workers
            .min((num_regions as usize + 383) / 384)
            .max(1);
        let cursor = AtomicU32::new(0);
        let selected = AtomicU32::new(0);
        let cursor = &cursor;
        let selected = &selected;

        self.pool.scope(|s| {
            for _ in 0..workers {
                s.spawn(move |_| loop {
                    let i = cursor.fetch_add(1, Ordering::Relaxed);
                    if i >= num_regions {
                        break;
                    }
                    let region = self.heap.region(RegionIdx::new(i));
                    if self.update_remset_before_rebuild(region) {
                        selected.fetch_add(1, Ordering::Relaxed);
                    }
                    self.update_marked_bytes(region);
                });
            }
        });

        tracing::debug!(
            total = num_regions,
            selected = selected.load(Ordering::Relaxed),
            "remembered set tracking updated before rebuild"
        );
    }

    fn update_remset_before_rebuild(&self, region: &Region) -> bool {
        let selected = if region.is_humongous() {
            let is_live = region
                .humongous_start_region()
                .map(|start| self.liveness_words(start) > 0)
                .unwrap_or(false);
            self.remset_tracker
                .update_humongous_before_rebuild(region, is_live)
        } else {
            self.remset_tracker
                .update_before_rebuild(region, self.liveness(region.index()))
        };
        self.update_top_at_rebuild_start(region);
        selected
    }

    fn update_top_at_rebuild_start(&self, region: &Region) {
        let slot = &self.top_at_rebuild_starts[region.index().as_usize()];
        debug_assert_eq!(slot.load(Ordering::Relaxed), 0, "TARS already set");
        if self.remset_tracker.needs_scan_for_rebuild(region) {
            slot.store(region.top().as_usize(), Ordering::Release);
        }
        // Otherwise TARS stays null.
    }

    fn update_marked_bytes(&self, region: &Region) {
        let marked_words = self.liveness_words(region.index());
        if region.is_humongous() {
            debug_assert!(
                region.is_starts_humongous() || marked_words == 0,
                "marked words in a continues-humongous region"
            );
            if region.is_starts_humongous() {
                self.distribute_marked_bytes(region, marked_words);
            }
        } else {
            region.add_to_marked_bytes(marked_words * WORD_BYTES);
            region.note_end_of_marking();
        }
    }

    /// Marking attributes a humongous object's whole size to its starts
    /// region; spread it across the spanned regions and note end of
    /// marking for each, live or not.
    fn distribute_marked_bytes(&self, start: &Region, marked_words: usize) {
        let obj = ObjectRef::from_addr_unchecked(start.bottom());
        let obj_words = self.model.size_in_words(obj);
        debug_assert!(
            marked_words == 0 || marked_words == obj_words,
            "marked words should be 0 or the whole object"
        );
        let span = self.heap.humongous_size_in_regions(obj_words);
        let region_words = self.heap.region_words();

        let mut remaining = marked_words;
        for i in 0..span {
            let region = self.heap.region(RegionIdx::new(start.index().raw() + i));
            let words_to_add = remaining.min(region_words);
            tracing::trace!(
                region = region.index().raw(),
                words = words_to_add,
                "distributing humongous marked words"
            );
            region.add_to_marked_bytes(words_to_add * WORD_BYTES);
            region.note_end_of_marking();
            remaining -= words_to_add;
        }
        debug_assert_eq!(remaining, 0, "words left after distribution");
    }

    /// Free every collection-set region that turned out fully dead: no
    /// marked bytes and nothing allocated since the snapshot.
    fn reclaim_empty_regions(&self) {
        let num_regions = self.heap.num_regions();
        let cursor = AtomicU32::new(0);
        let freed_bytes = AtomicUsize::new(0);
        let reclaimed = AtomicU32::new(0);
        let cursor = &cursor;
        let freed_bytes = &freed_bytes;
        let reclaimed = &reclaimed;

        self.pool.scope(|s| {
            for _ in 0..self.max_workers {
                s.spawn(move |_| {
                    let mut local = FreeRegionList::new(
                        "local cleanup list",
                        Arc::clone(&self.heap),
                        None,
                    );
                    local.set_unrealistically_long_length(
                        self.config.resolved_list_bound(num_regions),
                    );
                    loop {
                        let i = cursor.fetch_add(1, Ordering::Relaxed);
                        if i >= num_regions {
                            break;
                        }
                        let idx = RegionIdx::new(i);
                        let region = self.heap.region(idx);
                        if region.used() > 0
                            && region.max_live_bytes() == 0
                            && region.in_cset()
                            && !region.is_young()
                            && !region.is_archive()
                        {
                            freed_bytes.fetch_add(region.used(), Ordering::Relaxed);
                            reclaimed.fetch_add(1, Ordering::Relaxed);
                            tracing::trace!(
                                region = i,
                                kind = region.region_type().as_str(),
                                "reclaimed empty region"
                            );
                            self.clear_statistics_in_region(idx);
                            region.reset_to_free();
                            local.add_ordered(idx);
                        }
                    }
                    if !local.is_empty() {
                        let _guard = self.cleanup_list_lock.lock();
                        self.cleanup_list.lock().add_ordered_list(&mut local);
                    }
                });
            }
        });

        if reclaimed.load(Ordering::Relaxed) > 0 {
            tracing::debug!(
                regions = reclaimed.load(Ordering::Relaxed),
                bytes = freed_bytes.load(Ordering::Relaxed),
                "reclaimed empty regions"
            );
        }
    }

    /// Hand the reclaimed regions to the embedder's master free list.
    pub fn take_cleanup_list(&self, dest: &mut FreeRegionList) {
        let _guard = self.cleanup_list_lock.lock();
        dest.add_ordered_list(&mut self.cleanup_list.lock());
    }

    /// Stop-the-world cleanup pause: settle the rebuild trackers and
    /// record the end of the cycle.
    pub fn cleanup(&self) {
        if self.has_aborted() {
            return;
        }
        self.set_phase(MarkPhase::Cleanup);

        for region in self.heap.regions() {
            self.remset_tracker.update_after_rebuild(region);
        }
        for region in self.heap.regions() {
            if region.in_cset() {
                tracing::trace!(
                    region = region.index().raw(),
                    kind = region.region_type().as_str(),
                    live_bytes = region.prev_marked_bytes(),
                    "post-cleanup region liveness"
                );
            }
            region.set_in_cset(false);
            region.set_cset_next(None);
        }
        self.cset_head.store(NO_REGION, Ordering::Release);
        self.finger.store(0, Ordering::Release);

        tracing::info!("concurrent marking cycle complete");
        self.set_phase(MarkPhase::Idle);
    }

    /// Abort the cycle (full-collection preemption). Cooperative: flags
    /// are raised and barriers aborted here; workers drop their work at
    /// the next regular-clock call, after which [`Self::finish_abort`]
    /// clears the leftover state.
    pub fn concurrent_cycle_abort(&self) {
        if self.current_phase() == MarkPhase::Idle || self.has_aborted() {
            return;
        }
        self.has_aborted.store(true, Ordering::Release);
        self.root_regions.cancel_scan();
        self.first_sync.abort();
        self.second_sync.abort();
        if self.satb.is_active() {
            self.satb.set_active_all_threads(false, true);
        }
        self.satb.abandon_partial_marking();
        self.ref_processor.abandon_discovery();
        tracing::info!("concurrent mark abort");
        self.set_phase(MarkPhase::Aborted);
    }

    /// Clear out the aborted cycle once every worker has quiesced: the
    /// next bitmap is wiped, queues and stack emptied, tasks reset.
    pub fn finish_abort(&self) {
        debug_assert!(self.has_aborted());
        self.next_bitmap.load().clear_all();
        // The cycle is dead; a flagged overflow must not grow the stack.
        self.has_overflown.store(false, Ordering::Release);
        self.reset_marking_state_stw();
        for region in self.heap.regions() {
            region.set_in_cset(false);
            region.set_cset_next(None);
        }
        self.cset_head.store(NO_REGION, Ordering::Release);
        self.finger.store(0, Ordering::Release);
        self.set_phase(MarkPhase::Idle);
    }

    /// Concurrently clear the next bitmap between cycles, yielding to
    /// pauses chunk by chunk.
    pub fn cleanup_for_next_mark(&self) {
        let bitmap = self.next_bitmap.load_full();
        let covered = bitmap.covered();
        bitmap.clear_range_chunked(covered, self.config.bitmap_clear_chunk_bytes, || {
            self.do_yield_check();
            false
        });
    }

    /// Clear the previous bitmap. Stop-the-world only.
    pub fn clear_prev_bitmap(&self) {
        self.prev_bitmap.load().clear_all();
    }

    // Region hooks.

    /// An eagerly reclaimed humongous object: drop its marks and any
    /// statistics gathered so far.
    pub fn humongous_object_eagerly_reclaimed(&self, idx: RegionIdx) {
        let region = self.heap.region(idx);
        debug_assert!(region.is_starts_humongous());
        let bottom = region.bottom();
        self.prev_bitmap.load().clear(bottom);
        self.next_bitmap.load().clear(bottom);

        if self.current_phase() == MarkPhase::Idle {
            return;
        }
        self.clear_statistics(idx);
    }

    /// Clear marking statistics for a region; for a humongous start this
    /// spans the whole object.
    pub fn clear_statistics(&self, idx: RegionIdx) {
        let region = self.heap.region(idx);
        if region.is_starts_humongous() {
            let mut j = idx.raw();
            loop {
                self.clear_statistics_in_region(RegionIdx::new(j));
                j += 1;
                if j >= self.heap.num_regions() {
                    break;
                }
                let next = self.heap.region(RegionIdx::new(j));
                if next.humongous_start_region() != Some(idx) || !next.is_continues_humongous() {
                    break;
                }
            }
        } else {
            self.clear_statistics_in_region(idx);
        }
    }

    fn clear_statistics_in_region(&self, idx: RegionIdx) {
        for task in &self.tasks {
            task.lock().clear_mark_stats_cache(idx);
        }
        self.top_at_rebuild_starts[idx.as_usize()].store(0, Ordering::Release);
        self.region_mark_stats.clear(idx);
    }

    /// Clear a range of the previous bitmap on behalf of the allocator.
    pub fn clear_range_in_prev_bitmap(&self, mr: MemRegion) {
        self.prev_bitmap.load().clear_range(mr);
    }

    // Queries.

    pub fn is_marked_in_prev_bitmap(&self, obj: ObjectRef) -> bool {
        self.prev_bitmap.load().is_marked(obj.addr())
    }

    pub fn is_marked_in_next_bitmap(&self, obj: ObjectRef) -> bool {
        self.next_bitmap.load().is_marked(obj.addr())
    }

    /// Live-object check used by reference processing and verification.
    pub fn is_live(&self, obj: ObjectRef) -> bool {
        match self.heap.region_containing(obj.addr()) {
            None => true,
            Some(region) => {
                if !region.in_cset() {
                    return true;
                }
                region.obj_allocated_since_mark_start(obj.addr())
                    || self.next_bitmap.load().is_marked(obj.addr())
            }
        }
    }

    fn liveness_words(&self, idx: RegionIdx) -> usize {
        self.region_mark_stats.live_words(idx)
    }

    /// Measured live bytes of a region in the current cycle.
    pub fn liveness(&self, idx: RegionIdx) -> usize {
        self.liveness_words(idx) * WORD_BYTES
    }

    /// The frontier snapshot taken for the rebuild phase, if the region
    /// was selected for rebuild bookkeeping.
    pub fn top_at_rebuild_start(&self, idx: RegionIdx) -> Option<HeapAddr> {
        let raw = self.top_at_rebuild_starts[idx.as_usize()].load(Ordering::Acquire);
        if raw == 0 {
            None
        } else {
            Some(HeapAddr::new(raw))
        }
    }

    fn print_stats(&self) {
        for task in &self.tasks {
            task.lock().print_stats();
        }
    }

    /// Drive one complete marking cycle over `cset`, with `roots` as the
    /// published root regions. Convenience driver wiring the phases in
    /// order, including overflow restarts.
    pub fn run_cycle(&self, cset: &[RegionIdx], roots: &[RegionIdx]) -> MarkResult<()> {
        self.pre_initial_mark();
        self.install_ms_cset(cset);
        for &idx in roots {
            self.root_regions.add(idx);
        }
        self.post_initial_mark();

        self.scan_root_regions();
        self.root_regions.wait_until_scan_finished();

        loop {
            self.concurrent_marking();
            if self.has_aborted() {
                break;
            }
            match self.remark() {
                Ok(()) => {}
                Err(MarkError::CycleAborted) => break,
                Err(e) => return Err(e),
            }
            if !self.restart_for_overflow() {
                break;
            }
            tracing::info!("restarting concurrent marking after remark overflow");
        }

        if self.has_aborted() {
            self.finish_abort();
            return Err(MarkError::CycleAborted);
        }
        self.cleanup();
        Ok(())
    }
}
