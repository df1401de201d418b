//! Tunables for the marking engine.
//!
//! All sizes and thresholds are per-engine; the defaults match the behavior
//! of a production memory server with 1 MiB regions.

/// Reference-array entries scanned per slice step.
pub const OBJ_ARRAY_SLICE_SLOTS: usize = 2048;

/// Configuration for one marking engine instance.
///
/// # Examples
///
/// ```
/// use conmark::config::MarkingConfig;
///
/// // Tiny mark stack to exercise the overflow protocol.
/// let config = MarkingConfig {
///     mark_stack_initial_chunks: 1,
///     mark_stack_max_chunks: 8,
///     ..Default::default()
/// };
/// assert!(config.mark_stack_initial_chunks <= config.mark_stack_max_chunks);
/// ```
#[derive(Debug, Clone)]
pub struct MarkingConfig {
    /// Region size in bytes. Must be a power of two.
    pub region_bytes: usize,

    /// Per-worker task queue capacity in entries. A full queue spills a
    /// chunk of entries to the global mark stack.
    pub task_queue_capacity: usize,

    /// Initial global mark stack capacity in chunks.
    pub mark_stack_initial_chunks: usize,

    /// Upper bound on global mark stack growth, in chunks. Needing more than
    /// this after an overflow restart is fatal.
    pub mark_stack_max_chunks: usize,

    /// Words scanned between two regular-clock calls.
    pub words_scanned_period: usize,

    /// References reached between two regular-clock calls.
    pub refs_reached_period: usize,

    /// Entry count the partial drains shrink the global stack down to.
    pub drain_stack_target: usize,

    /// Minimum entries a partial local-queue drain leaves behind so other
    /// workers still find something to steal.
    pub target_queue_keep_threshold: usize,

    /// Soft time target of one `do_marking_step` call during concurrent
    /// marking, in milliseconds.
    pub step_time_target_ms: f64,

    /// Direct-mapped per-task liveness cache size, in entries. Must be a
    /// power of two.
    pub stats_cache_entries: usize,

    /// Completed producer-buffer count above which a concurrent step aborts
    /// so the buffers get drained promptly.
    pub satb_process_threshold: usize,

    /// Entries per mutator-side producer buffer.
    pub satb_buffer_capacity: usize,

    /// Per-region bounded capacity of the inbound target-object queue;
    /// pushes beyond it land in the overflow spill area.
    pub target_queue_capacity: usize,

    /// Old regions whose live ratio is below this percentage are selected
    /// for remembered-set rebuild.
    pub rebuild_live_threshold_percent: usize,

    /// Free-list traversal bound; exceeding it means a corrupted list.
    /// `0` derives the bound from the region count at heap construction.
    pub unrealistically_long_length: u32,

    /// Bitmap clearing chunk size in bytes; each chunk checks the yield
    /// gate before continuing.
    pub bitmap_clear_chunk_bytes: usize,
}

impl Default for MarkingConfig {
    fn default() -> Self {
        MarkingConfig {
            region_bytes: 1024 * 1024,
            task_queue_capacity: 4096,
            mark_stack_initial_chunks: 16,
            mark_stack_max_chunks: 1024,
            words_scanned_period: 12 * 1024,
            refs_reached_period: 384,
            drain_stack_target: 64,
            target_queue_keep_threshold: 64,
            step_time_target_ms: 10.0,
            stats_cache_entries: 1024,
            satb_process_threshold: 4,
            satb_buffer_capacity: 256,
            target_queue_capacity: 4096,
            rebuild_live_threshold_percent: 85,
            unrealistically_long_length: 0,
            bitmap_clear_chunk_bytes: 1024 * 1024,
        }
    }
}

impl MarkingConfig {
    /// Resolve the free-list traversal bound for a heap of `num_regions`.
    pub fn resolved_list_bound(&self, num_regions: u32) -> u32 {
        if self.unrealistically_long_length != 0 {
            self.unrealistically_long_length
        } else {
            num_regions.saturating_mul(4).saturating_add(100)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let c = MarkingConfig::default();
        assert!(c.region_bytes.is_power_of_two());
        assert!(c.stats_cache_entries.is_power_of_two());
        assert!(c.mark_stack_initial_chunks <= c.mark_stack_max_chunks);
        assert!(c.drain_stack_target > 0);
    }

    #[test]
    fn list_bound_derives_from_region_count() {
        let c = MarkingConfig::default();
        assert_eq!(c.resolved_list_bound(10), 140);
        let fixed = MarkingConfig {
            unrealistically_long_length: 7,
            ..Default::default()
        };
        assert_eq!(fixed.resolved_list_bound(10), 7);
    }
}
