//! Per-worker marking task.
//!
//! `do_marking_step` is the building block of the whole marking framework:
//! it is invoked in a loop by every concurrent worker, by the remark pause
//! workers, and serially by reference processing, so one body serves all
//! three. A step traces until it runs out of work, time, or is told to
//! stop; the caller decides whether to reinvoke.

use std::sync::Arc;
use std::time::Instant;

use crate::bitmap::MarkBitmap;
use crate::heap::{Region, RegionIdx, TargetRef};
use crate::marker::Marker;
use crate::mark_stack::ENTRIES_PER_CHUNK;
use crate::object::{HeapAddr, ObjectRef, TaskEntry};
use crate::stats::MarkStatsCache;
use crate::task_queue::TaskQueue;

use crate::config::OBJ_ARRAY_SLICE_SLOTS;

/// State owned by one marking worker. Tasks outlive cycles and are reset at
/// each cycle start.
pub struct MarkerTask {
    worker_id: usize,
    queue: TaskQueue,
    stats_cache: MarkStatsCache,
    next_bitmap: Arc<MarkBitmap>,

    curr_region: Option<RegionIdx>,

    words_scanned: usize,
    refs_reached: usize,
    words_scanned_limit: usize,
    refs_reached_limit: usize,
    real_words_scanned_limit: usize,
    real_refs_reached_limit: usize,

    has_aborted: bool,
    has_timed_out: bool,
    draining_satb: bool,

    step_start: Instant,
    time_target_ms: f64,

    calls: usize,
    elapsed_time_ms: f64,
    termination_time_ms: f64,
}

impl MarkerTask {
    pub(crate) fn new(
        worker_id: usize,
        queue: TaskQueue,
        stats_cache: MarkStatsCache,
        next_bitmap: Arc<MarkBitmap>,
    ) -> Self {
        MarkerTask {
            worker_id,
            queue,
            stats_cache,
            next_bitmap,
            curr_region: None,
            words_scanned: 0,
            refs_reached: 0,
            words_scanned_limit: 0,
            refs_reached_limit: 0,
            real_words_scanned_limit: 0,
            real_refs_reached_limit: 0,
            has_aborted: false,
            has_timed_out: false,
            draining_satb: false,
            step_start: Instant::now(),
            time_target_ms: 0.0,
            calls: 0,
            elapsed_time_ms: 0.0,
            termination_time_ms: 0.0,
        }
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub(crate) fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn has_aborted(&self) -> bool {
        self.has_aborted
    }

    /// Whether the last step ended by crossing its soft time target.
    pub fn has_timed_out(&self) -> bool {
        self.has_timed_out
    }

    pub(crate) fn set_has_aborted(&mut self) {
        self.has_aborted = true;
    }

    pub(crate) fn clear_has_aborted(&mut self) {
        self.has_aborted = false;
    }

    pub fn refs_reached(&self) -> usize {
        self.refs_reached
    }

    pub fn words_scanned(&self) -> usize {
        self.words_scanned
    }

    pub fn calls(&self) -> usize {
        self.calls
    }

    /// Reinitialize for a new cycle with the cycle's `next` bitmap.
    pub(crate) fn reset(&mut self, next_bitmap: Arc<MarkBitmap>) {
        self.next_bitmap = next_bitmap;
        self.clear_region_fields();
        self.queue.set_empty();
        self.stats_cache.reset();
        self.words_scanned = 0;
        self.refs_reached = 0;
        self.words_scanned_limit = 0;
        self.refs_reached_limit = 0;
        self.real_words_scanned_limit = 0;
        self.real_refs_reached_limit = 0;
        self.has_aborted = false;
        self.has_timed_out = false;
        self.draining_satb = false;
        self.calls = 0;
        self.elapsed_time_ms = 0.0;
        self.termination_time_ms = 0.0;
    }

    pub(crate) fn clear_region_fields(&mut self) {
        self.curr_region = None;
    }

    fn setup_for_region(&mut self, region: RegionIdx) {
        self.curr_region = Some(region);
    }

    fn giveup_current_region(&mut self) {
        self.curr_region = None;
    }

    pub(crate) fn flush_mark_stats_cache(&mut self, marker: &Marker) -> (usize, usize) {
        self.stats_cache.evict_all(marker.region_mark_stats())
    }

    pub(crate) fn clear_mark_stats_cache(&mut self, region: RegionIdx) {
        self.stats_cache.reset_region(region);
    }

    pub(crate) fn reset_mark_stats_cache(&mut self) {
        self.stats_cache.reset();
    }

    // Work-based clock.

    fn recalculate_limits(&mut self, marker: &Marker) {
        let cfg = marker.config();
        self.real_words_scanned_limit = self.words_scanned + cfg.words_scanned_period;
        self.words_scanned_limit = self.real_words_scanned_limit;
        self.real_refs_reached_limit = self.refs_reached + cfg.refs_reached_period;
        self.refs_reached_limit = self.real_refs_reached_limit;
    }

    /// Pull the next clock call closer after an infrequent, expensive
    /// operation (global-stack transfer, producer-buffer drain).
    fn decrease_limits(&mut self, marker: &Marker) {
        let cfg = marker.config();
        self.words_scanned_limit = self
            .real_words_scanned_limit
            .saturating_sub(3 * cfg.words_scanned_period / 4);
        self.refs_reached_limit = self
            .real_refs_reached_limit
            .saturating_sub(3 * cfg.refs_reached_period / 4);
    }

    /// The regular-clock call: false means this step must abort.
    fn regular_clock_call(&mut self, marker: &Marker) -> bool {
        if self.has_aborted {
            return false;
        }
        self.recalculate_limits(marker);

        // (1) A flagged overflow aborts everyone.
        if marker.has_overflown() {
            return false;
        }
        // The remaining checks only apply to the concurrent phase; remark
        // runs to completion.
        if !marker.concurrent() {
            return true;
        }
        // (2) The cycle was aborted for a full collection.
        if marker.has_aborted() {
            return false;
        }
        // (3) A pause wants us to yield; the caller does the yielding.
        if marker.suspendible().should_yield() {
            return false;
        }
        // (4) Time quota.
        let elapsed_ms = self.step_start.elapsed().as_secs_f64() * 1000.0;
        if elapsed_ms > self.time_target_ms {
            self.has_timed_out = true;
            return false;
        }
        // (5) Enough completed producer buffers justify a restart to
        // process them, unless that is what we are already doing.
        if !self.draining_satb && marker.satb().process_completed_buffers() {
            return false;
        }
        true
    }

    fn abort_marking_if_regular_check_fail(&mut self, marker: &Marker) {
        if !self.regular_clock_call(marker) {
            self.has_aborted = true;
        }
    }

    fn check_limits(&mut self, marker: &Marker) {
        if self.words_scanned >= self.words_scanned_limit
            || self.refs_reached >= self.refs_reached_limit
        {
            self.abort_marking_if_regular_check_fail(marker);
        }
    }

    /// Exit predicate polled inside the termination protocol: leave the
    /// protocol when the clock fails, the global stack has work again, or
    /// we have aborted. Reads shared state only.
    pub(crate) fn should_exit_termination(&mut self, marker: &Marker) -> bool {
        if !self.regular_clock_call(marker) {
            return true;
        }
        !marker.mark_stack_empty() || self.has_aborted
    }

    // Tracing.

    /// Handle one raw reference-slot value read out of an object.
    fn deal_with_reference(&mut self, marker: &Marker, raw_slot_value: usize) {
        self.refs_reached += 1;
        if raw_slot_value == 0 {
            return;
        }
        let addr = HeapAddr::new(raw_slot_value);
        // Transport read check: the reference may originate in a source
        // region the CPU server has decommitted.
        if !marker.model().source_region_committed(addr) {
            return;
        }
        let obj = match ObjectRef::from_addr(addr) {
            Some(obj) => obj,
            None => return,
        };
        let region = match marker.heap().region_containing(addr) {
            Some(region) => region,
            None => return,
        };
        // Liveness of regions outside the collection set is decided
        // elsewhere; their references are not traced here.
        if !region.in_cset() {
            return;
        }
        self.make_reference_alive(marker, region, obj);
    }

    /// Mark `obj` in its region's alive bitmap and, on the 0 -> 1
    /// transition, account its size and queue it for scanning.
    pub(crate) fn make_reference_alive(
        &mut self,
        marker: &Marker,
        region: &Region,
        obj: ObjectRef,
    ) -> bool {
        if !self.mark_in_alive_bitmap(marker, region, obj) {
            return false;
        }
        let entry = TaskEntry::from_obj(obj);
        if marker.model().is_type_array(obj) {
            // Primitive arrays carry no references; bookkeeping only, no
            // trip through the queues.
            self.process_grey_task_entry(marker, entry, false);
        } else {
            self.push(marker, entry);
        }
        true
    }

    fn mark_in_alive_bitmap(&mut self, marker: &Marker, region: &Region, obj: ObjectRef) -> bool {
        debug_assert!(region.is_in_reserved(obj.addr()));
        // At or above NTAMS: allocated since the cycle started, implicitly
        // live, never examined.
        if region.obj_allocated_since_mark_start(obj.addr()) {
            return false;
        }
        debug_assert!(
            !region.is_continues_humongous(),
            "continues-humongous regions never carry marks"
        );
        let marked = self.next_bitmap.par_mark(obj.addr());
        if marked {
            let words = marker.model().size_in_words(obj);
            self.stats_cache
                .add_live_words(marker.region_mark_stats(), region.index(), words);
        }
        marked
    }

    /// Account an already-marked object again; only used when liveness
    /// counters were rebuilt from the bitmap after an overflow restart.
    fn reaccount_marked_object(&mut self, marker: &Marker, region: &Region, obj: ObjectRef) {
        let words = marker.model().size_in_words(obj);
        self.stats_cache
            .add_live_words(marker.region_mark_stats(), region.index(), words);
    }

    fn push(&mut self, marker: &Marker, entry: TaskEntry) {
        if !self.queue.push(entry) {
            // Local queue full: move one chunk to the global stack. That
            // frees room unless the global stack itself overflowed.
            self.move_entries_to_global_stack(marker);
            let pushed = self.queue.push(entry);
            debug_assert!(pushed, "spilling must free local queue space");
        }
    }

    fn move_entries_to_global_stack(&mut self, marker: &Marker) {
        let mut buffer = [TaskEntry::NULL; ENTRIES_PER_CHUNK];
        let mut n = 0;
        while n < ENTRIES_PER_CHUNK {
            match self.queue.pop_local() {
                Some(entry) => {
                    buffer[n] = entry;
                    n += 1;
                }
                None => break,
            }
        }
        if n < ENTRIES_PER_CHUNK {
            buffer[n] = TaskEntry::NULL;
        }
        if n > 0 && !marker.mark_stack_push(&buffer) {
            self.has_aborted = true;
        }
        self.decrease_limits(marker);
    }

    fn get_entries_from_global_stack(&mut self, marker: &Marker) -> bool {
        let mut buffer = [TaskEntry::NULL; ENTRIES_PER_CHUNK];
        if !marker.mark_stack_pop(&mut buffer) {
            return false;
        }
        for entry in buffer {
            if entry.is_null() {
                break;
            }
            let pushed = self.queue.push(entry);
            // Only called with the local queue at or below the drain
            // target, so there is room for a whole chunk.
            debug_assert!(pushed, "local queue full while refilling from global stack");
        }
        self.decrease_limits(marker);
        true
    }

    fn drain_local_queue(&mut self, marker: &Marker, partially: bool) {
        if self.has_aborted {
            return;
        }
        // Partial drains leave work behind so other tasks can steal.
        let target_size = if partially {
            (self.queue.max_elems() / 3).min(marker.config().drain_stack_target)
        } else {
            0
        };
        if self.queue.size() > target_size {
            while let Some(entry) = self.queue.pop_local() {
                self.scan_task_entry(marker, entry);
                if self.queue.size() <= target_size || self.has_aborted {
                    break;
                }
            }
        }
    }

    fn drain_global_stack(&mut self, marker: &Marker, partially: bool) {
        if self.has_aborted {
            return;
        }
        debug_assert!(partially || self.queue.size() == 0, "drain local queue first");

        if partially {
            let target = marker.config().drain_stack_target;
            while !self.has_aborted && marker.mark_stack_size() > target {
                if self.get_entries_from_global_stack(marker) {
                    self.drain_local_queue(marker, partially);
                } else {
                    break;
                }
            }
        } else {
            while !self.has_aborted && self.get_entries_from_global_stack(marker) {
                self.drain_local_queue(marker, partially);
            }
        }
    }

    /// Drain completed producer buffers. The `draining_satb` flag keeps the
    /// regular clock from aborting us for the very buffers we are emptying.
    pub(crate) fn drain_satb_buffers(&mut self, marker: &Marker) {
        if self.has_aborted {
            return;
        }
        self.draining_satb = true;
        loop {
            if self.has_aborted {
                break;
            }
            let this = &mut *self;
            let processed = marker
                .satb()
                .apply_closure_to_completed_buffer(&mut |obj| this.satb_entry(marker, obj));
            if !processed {
                break;
            }
            self.abort_marking_if_regular_check_fail(marker);
        }
        self.draining_satb = false;
        debug_assert!(
            self.has_aborted
                || marker.concurrent()
                || marker.satb().completed_buffers_num() == 0
        );
        self.decrease_limits(marker);
    }

    /// One pre-image logged by a mutator's snapshot barrier.
    pub(crate) fn satb_entry(&mut self, marker: &Marker, obj: ObjectRef) {
        self.refs_reached += 1;
        if let Some(region) = marker.heap().region_containing(obj.addr()) {
            if region.in_cset() {
                self.make_reference_alive(marker, region, obj);
            }
        }
    }

    /// Drain one producer thread's private buffer; used once per mutator
    /// during remark finalization.
    pub(crate) fn drain_thread_satb_buffer(&mut self, marker: &Marker, thread_id: u64) {
        let this = &mut *self;
        marker
            .satb()
            .apply_closure_and_empty(thread_id, &mut |obj| this.satb_entry(marker, obj));
    }

    // Target-object queue drain.

    fn dispatch_reference(&mut self, marker: &Marker, r: TargetRef) {
        match r.decode(marker.heap().start()) {
            Some(obj) => self.deal_with_reference(marker, obj.addr().as_usize()),
            None => {}
        }
    }

    fn trim_target_object_queue_to_threshold(
        &mut self,
        marker: &Marker,
        region: &Region,
        threshold: usize,
    ) {
        let queue = region.target_obj_queue();
        // Spill area first, so other workers can keep stealing from the
        // bounded part.
        while let Some(r) = queue.pop_overflow() {
            if let Err(r) = queue.try_push_to_taskqueue(r) {
                self.dispatch_reference(marker, r);
            }
            if self.has_aborted {
                return;
            }
        }
        while let Some(r) = queue.pop_local(threshold) {
            self.dispatch_reference(marker, r);
            if self.has_aborted {
                return;
            }
        }
    }

    fn trim_target_object_queue(&mut self, marker: &Marker, region: &Region) {
        // Bulk drain leaves a remainder for thieves, then the tail is taken
        // outright until the queue stays empty.
        let keep = marker.config().target_queue_keep_threshold;
        self.trim_target_object_queue_to_threshold(marker, region, keep);
        loop {
            self.trim_target_object_queue_to_threshold(marker, region, 0);
            if self.has_aborted || region.target_obj_queue().is_empty() {
                break;
            }
        }
    }

    // Entry scanning.

    pub(crate) fn scan_task_entry(&mut self, marker: &Marker, entry: TaskEntry) {
        self.process_grey_task_entry(marker, entry, true);
    }

    fn process_grey_task_entry(&mut self, marker: &Marker, entry: TaskEntry, scan: bool) {
        if scan {
            if let Some(slice) = entry.as_slice() {
                let words = self.process_slice(marker, slice);
                self.words_scanned += words;
            } else if let Some(obj) = entry.as_obj() {
                let model = marker.model();
                if model.is_obj_array(obj)
                    && model.obj_array_len(obj) > 2 * OBJ_ARRAY_SLICE_SLOTS
                {
                    let words = self.process_obj_array(marker, obj);
                    self.words_scanned += words;
                } else {
                    let this = &mut *self;
                    model.for_each_field(obj, &mut |raw| this.deal_with_reference(marker, raw));
                    self.words_scanned += model.size_in_words(obj);
                }
            }
        }
        self.check_limits(marker);
    }

    /// First visit of an oversized reference array: scan a leading stride
    /// and queue a slice cursor for the rest.
    fn process_obj_array(&mut self, marker: &Marker, obj: ObjectRef) -> usize {
        let model = marker.model();
        let len = model.obj_array_len(obj);
        let to = len.min(OBJ_ARRAY_SLICE_SLOTS);
        if to < len {
            let continuation = model.obj_array_slot_addr(obj, to);
            self.push(marker, TaskEntry::from_slice(continuation));
        }
        let this = &mut *self;
        model.for_each_array_slot(obj, 0, to, &mut |raw| this.deal_with_reference(marker, raw));
        to
    }

    /// Continue a sliced array scan from its cursor.
    fn process_slice(&mut self, marker: &Marker, slice: HeapAddr) -> usize {
        let model = marker.model();
        let array = model.array_containing_slice(slice);
        let base = model.obj_array_slot_addr(array, 0);
        let from = slice.words_since(base);
        let len = model.obj_array_len(array);
        let to = len.min(from + OBJ_ARRAY_SLICE_SLOTS);
        if to < len {
            let continuation = model.obj_array_slot_addr(array, to);
            self.push(marker, TaskEntry::from_slice(continuation));
        }
        let this = &mut *self;
        model.for_each_array_slot(array, from, to, &mut |raw| {
            this.deal_with_reference(marker, raw)
        });
        to - from
    }

    /// Re-scan a region's marked objects after an overflow restart. The
    /// restart dropped all queued entries and liveness counters; the marks
    /// themselves survive and seed the rescan. The liveness rebuild runs
    /// under a once-per-region claim because a timed-out rescan is simply
    /// redone, and redoing the accounting would double-count.
    fn rescan_marked_objects(&mut self, marker: &Marker, region: &Region) {
        let bottom = region.bottom();
        let ntams = region.ntams();
        let mut marked = Vec::new();
        self.next_bitmap.iterate(bottom, ntams, |addr| {
            marked.push(addr);
            true
        });
        if marker.claim_liveness_rebuild(region.index()) {
            for &addr in &marked {
                let obj = ObjectRef::from_addr_unchecked(addr);
                self.reaccount_marked_object(marker, region, obj);
            }
        }
        for addr in marked {
            let obj = ObjectRef::from_addr_unchecked(addr);
            self.scan_task_entry(marker, TaskEntry::from_obj(obj));
            if self.has_aborted {
                break;
            }
        }
    }

    fn process_current_region(&mut self, marker: &Marker, region_idx: RegionIdx) {
        let region = marker.heap().region(region_idx);
        if region.is_humongous() {
            // Only the starts-humongous region carries the header and the
            // mark; continues regions are skipped outright.
            if region.is_starts_humongous() {
                self.trim_target_object_queue(marker, region);
                if marker.restarted_after_overflow()
                    && !self.has_aborted
                    && self.next_bitmap.is_marked(region.bottom())
                {
                    let obj = ObjectRef::from_addr_unchecked(region.bottom());
                    if marker.claim_liveness_rebuild(region.index()) {
                        self.reaccount_marked_object(marker, region, obj);
                    }
                    self.scan_task_entry(marker, TaskEntry::from_obj(obj));
                }
            }
            // Give up the region even if this step aborted meanwhile.
            self.giveup_current_region();
            self.abort_marking_if_regular_check_fail(marker);
        } else {
            self.trim_target_object_queue(marker, region);
            if marker.restarted_after_overflow() && !self.has_aborted {
                self.rescan_marked_objects(marker, region);
            }
            if !self.has_aborted {
                self.giveup_current_region();
                self.abort_marking_if_regular_check_fail(marker);
            }
        }
    }

    /// One marking step; see the module header. `time_target_ms` is a soft
    /// target checked by the regular clock, `do_termination` enables the
    /// termination protocol, and `is_serial` suppresses stealing and the
    /// overflow barriers for single-threaded callers.
    pub(crate) fn do_marking_step(
        &mut self,
        marker: &Marker,
        time_target_ms: f64,
        do_termination: bool,
        is_serial: bool,
    ) {
        debug_assert!(time_target_ms >= 1.0, "minimum granularity is 1ms");
        self.step_start = Instant::now();
        self.time_target_ms = time_target_ms;

        let do_stealing = do_termination && !is_serial;

        self.clear_has_aborted();
        self.has_timed_out = false;
        self.calls += 1;

        // A stale overflow from before a yield point: abort immediately so
        // this task reaches the overflow protocol at the bottom.
        if marker.has_overflown() {
            self.set_has_aborted();
        }

        // Drain available producer buffers now; the regular clock will
        // abort us later if enough new ones queue up.
        self.drain_satb_buffers(marker);

        self.drain_local_queue(marker, true);
        self.drain_global_stack(marker, true);

        loop {
            if !self.has_aborted {
                if let Some(region_idx) = self.curr_region {
                    self.process_current_region(marker, region_idx);
                }
            }
            // Either done with the region or aborted; shed some local and
            // global backlog before claiming the next one.
            self.drain_local_queue(marker, true);
            self.drain_global_stack(marker, true);

            // Claim the next region. claim_region can return None with
            // regions still unclaimed (lost race, empty region), so the
            // only exhaustion signal is the finger going null.
            while !self.has_aborted && self.curr_region.is_none() && !marker.out_of_ms_cset() {
                if let Some(claimed) = marker.claim_region(self.worker_id) {
                    self.setup_for_region(claimed);
                }
                // Claiming can spin past many empty regions; keep the
                // clock honest each time around.
                self.abort_marking_if_regular_check_fail(marker);
            }

            if self.curr_region.is_none() || self.has_aborted {
                break;
            }
        }

        if !self.has_aborted {
            debug_assert!(marker.out_of_ms_cset(), "should be out of regions here");
        }

        // Fully drain what is left before trying to steal.
        self.drain_local_queue(marker, false);
        self.drain_global_stack(marker, false);

        if do_stealing && !self.has_aborted {
            while !self.has_aborted {
                match marker.try_stealing(self.worker_id) {
                    Some(entry) => {
                        self.scan_task_entry(marker, entry);
                        self.drain_local_queue(marker, false);
                        self.drain_global_stack(marker, false);
                    }
                    // A full survey of the other queues found nothing.
                    None => break,
                }
            }
        }

        if do_termination && !self.has_aborted {
            let termination_start = Instant::now();
            let finished = is_serial
                || marker
                    .terminator()
                    .offer_termination(|| self.should_exit_termination(marker));
            self.termination_time_ms += termination_start.elapsed().as_secs_f64() * 1000.0;

            if finished {
                debug_assert!(marker.out_of_ms_cset(), "only way to reach here");
                debug_assert!(self.queue.size() == 0, "only way to reach here");
                debug_assert!(!marker.has_overflown(), "only way to reach here");
            } else {
                // More work appeared somewhere; abort this step and let the
                // caller reinvoke us.
                self.set_has_aborted();
            }
        }

        self.elapsed_time_ms += self.step_start.elapsed().as_secs_f64() * 1000.0;

        if self.has_aborted && marker.has_overflown() {
            // Global overflow: every task must stop before worker 0 can
            // reset the shared marking state, hence the two barriers.
            let mut proceed = true;
            if !is_serial {
                proceed = marker.enter_first_sync_barrier(self.worker_id);
            }

            self.clear_region_fields();
            // The restart rebuilds liveness from the bitmap; drop instead
            // of flushing so nothing is counted twice.
            self.stats_cache.reset();
            self.queue.set_empty();

            if !is_serial && proceed {
                if marker.concurrent() && self.worker_id == 0 {
                    // Worker 0 reinitializes the global structures. During
                    // remark the flag must survive so the pause schedules a
                    // concurrent restart instead.
                    marker.reset_marking_for_restart();
                    tracing::info!("concurrent mark reset for overflow");
                }
                marker.enter_second_sync_barrier(self.worker_id);
            }
            // An aborted barrier means a full collection preempted us; the
            // step ends without restarting.
        }
    }

    pub(crate) fn print_stats(&self) {
        tracing::debug!(
            worker = self.worker_id,
            calls = self.calls,
            elapsed_ms = self.elapsed_time_ms,
            termination_ms = self.termination_time_ms,
            words_scanned = self.words_scanned,
            refs_reached = self.refs_reached,
            cache_hits = self.stats_cache.hits(),
            cache_misses = self.stats_cache.misses(),
            "marking task statistics"
        );
    }
}
