//! Cycle-wide marking bitmap with one bit per heap word.
//!
//! Writers publish a mark with an atomic test-and-set; readers pair with
//! acquire loads. Range clearing works in large chunks so a concurrent
//! clear between cycles can yield to pending pauses.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::object::{HeapAddr, MemRegion, WORD_BYTES};

const BITS_PER_WORD: usize = usize::BITS as usize;

/// One mark bit per word-aligned address in the covered range.
///
/// Two of these exist per engine: `prev` (last completed cycle, read by the
/// allocator and verification) and `next` (the cycle under construction).
/// Regions see the slice of `next` covering their own address range as
/// their alive bitmap.
///
/// # Examples
///
/// ```
/// use conmark::bitmap::MarkBitmap;
/// use conmark::object::{HeapAddr, MemRegion};
///
/// let covered = MemRegion::new(HeapAddr::new(0x10000), HeapAddr::new(0x20000));
/// let bitmap = MarkBitmap::new(covered);
///
/// let addr = HeapAddr::new(0x10040);
/// assert!(!bitmap.is_marked(addr));
/// assert!(bitmap.par_mark(addr));     // first transition 0 -> 1
/// assert!(!bitmap.par_mark(addr));    // idempotent afterwards
/// assert!(bitmap.is_marked(addr));
/// ```
pub struct MarkBitmap {
    words: Vec<AtomicUsize>,
    covered: MemRegion,
}

impl MarkBitmap {
    /// Allocate a cleared bitmap covering `covered`, one bit per heap word.
    pub fn new(covered: MemRegion) -> Self {
        let bits = covered.word_size();
        let words = bits.div_ceil(BITS_PER_WORD);
        MarkBitmap {
            words: (0..words).map(|_| AtomicUsize::new(0)).collect(),
            covered,
        }
    }

    #[inline]
    pub fn covered(&self) -> MemRegion {
        self.covered
    }

    #[inline]
    fn bit_index(&self, addr: HeapAddr) -> usize {
        debug_assert!(self.covered.contains(addr), "address outside bitmap");
        debug_assert!(addr.is_word_aligned());
        addr.words_since(self.covered.start)
    }

    /// Atomically set the bit for `addr`. Returns true iff this call made
    /// the 0 -> 1 transition.
    #[inline]
    pub fn par_mark(&self, addr: HeapAddr) -> bool {
        let bit = self.bit_index(addr);
        let mask = 1usize << (bit % BITS_PER_WORD);
        let prev = self.words[bit / BITS_PER_WORD].fetch_or(mask, Ordering::AcqRel);
        prev & mask == 0
    }

    /// Plain marked check; pairs with the release in [`Self::par_mark`].
    #[inline]
    pub fn is_marked(&self, addr: HeapAddr) -> bool {
        let bit = self.bit_index(addr);
        let mask = 1usize << (bit % BITS_PER_WORD);
        self.words[bit / BITS_PER_WORD].load(Ordering::Acquire) & mask != 0
    }

    /// Clear the bit for `addr` if set.
    #[inline]
    pub fn clear(&self, addr: HeapAddr) {
        let bit = self.bit_index(addr);
        let mask = 1usize << (bit % BITS_PER_WORD);
        self.words[bit / BITS_PER_WORD].fetch_and(!mask, Ordering::AcqRel);
    }

    /// Clear every bit covering `mr`. The range must be word aligned and
    /// inside the covered range.
    pub fn clear_range(&self, mr: MemRegion) {
        if mr.is_empty() {
            return;
        }
        let first = self.bit_index(mr.start);
        let last = first + mr.word_size(); // exclusive
        self.clear_bit_range(first, last);
    }

    /// Clear every bit covering `mr` in chunks of `chunk_bytes` of heap,
    /// invoking `should_abort` between chunks. Returns false when aborted.
    pub fn clear_range_chunked(
        &self,
        mr: MemRegion,
        chunk_bytes: usize,
        mut should_abort: impl FnMut() -> bool,
    ) -> bool {
        let mut cursor = mr.start;
        while cursor < mr.end {
            let chunk_end = HeapAddr::new((cursor.as_usize() + chunk_bytes).min(mr.end.as_usize()));
            self.clear_range(MemRegion::new(cursor, chunk_end));
            cursor = chunk_end;
            if cursor < mr.end && should_abort() {
                return false;
            }
        }
        true
    }

    /// Clear the whole covered range.
    pub fn clear_all(&self) {
        for word in &self.words {
            word.store(0, Ordering::Release);
        }
    }

    fn clear_bit_range(&self, first: usize, last: usize) {
        let first_word = first / BITS_PER_WORD;
        let last_word = (last - 1) / BITS_PER_WORD;
        let head_mask = !0usize << (first % BITS_PER_WORD);
        let tail_bits = last % BITS_PER_WORD;
        let tail_mask = if tail_bits == 0 { !0 } else { (1usize << tail_bits) - 1 };

        if first_word == last_word {
            self.words[first_word].fetch_and(!(head_mask & tail_mask), Ordering::AcqRel);
            return;
        }
        self.words[first_word].fetch_and(!head_mask, Ordering::AcqRel);
        for w in &self.words[first_word + 1..last_word] {
            w.store(0, Ordering::Release);
        }
        self.words[last_word].fetch_and(!tail_mask, Ordering::AcqRel);
    }

    /// Visit every marked address in `[begin, end)` in ascending order.
    /// The closure returns false to stop the walk early.
    pub fn iterate(
        &self,
        begin: HeapAddr,
        end: HeapAddr,
        mut f: impl FnMut(HeapAddr) -> bool,
    ) -> bool {
        if begin >= end {
            return true;
        }
        let first = self.bit_index(begin);
        let last = first + MemRegion::new(begin, end).word_size();
        let mut word_idx = first / BITS_PER_WORD;
        let last_word = (last - 1) / BITS_PER_WORD;

        while word_idx <= last_word {
            let mut word = self.words[word_idx].load(Ordering::Acquire);
            // Mask off bits outside [first, last).
            if word_idx == first / BITS_PER_WORD {
                word &= !0usize << (first % BITS_PER_WORD);
            }
            if word_idx == last_word && last % BITS_PER_WORD != 0 {
                word &= (1usize << (last % BITS_PER_WORD)) - 1;
            }
            while word != 0 {
                let bit = word.trailing_zeros() as usize;
                let global_bit = word_idx * BITS_PER_WORD + bit;
                let addr = self.covered.start.add_words(global_bit);
                if !f(addr) {
                    return false;
                }
                word &= word - 1;
            }
            word_idx += 1;
        }
        true
    }

    /// Number of marked bits in `[begin, end)`.
    pub fn count_marked(&self, begin: HeapAddr, end: HeapAddr) -> usize {
        let mut n = 0;
        self.iterate(begin, end, |_| {
            n += 1;
            true
        });
        n
    }

    /// Heap bytes of bitmap storage needed per byte of covered heap.
    pub const fn heap_map_factor() -> usize {
        WORD_BYTES * 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitmap() -> MarkBitmap {
        MarkBitmap::new(MemRegion::new(HeapAddr::new(0x10000), HeapAddr::new(0x30000)))
    }

    #[test]
    fn par_mark_first_call_wins() {
        let bm = bitmap();
        let addr = HeapAddr::new(0x10000);
        assert!(bm.par_mark(addr));
        assert!(!bm.par_mark(addr));
        assert!(bm.is_marked(addr));
    }

    #[test]
    fn clear_range_resets_exactly_the_range() {
        let bm = bitmap();
        let inside = HeapAddr::new(0x11000);
        let outside = HeapAddr::new(0x12000);
        bm.par_mark(inside);
        bm.par_mark(outside);

        bm.clear_range(MemRegion::new(HeapAddr::new(0x10800), HeapAddr::new(0x11800)));
        assert!(!bm.is_marked(inside));
        assert!(bm.is_marked(outside));
    }

    #[test]
    fn iterate_visits_marks_in_order() {
        let bm = bitmap();
        let addrs = [0x10008, 0x10400, 0x2fff8];
        for &a in &addrs {
            bm.par_mark(HeapAddr::new(a));
        }
        let mut seen = Vec::new();
        bm.iterate(HeapAddr::new(0x10000), HeapAddr::new(0x30000), |a| {
            seen.push(a.as_usize());
            true
        });
        assert_eq!(seen, addrs);
    }

    #[test]
    fn chunked_clear_honors_abort() {
        let bm = bitmap();
        let mr = bm.covered();
        for w in 0..mr.word_size() {
            if w % 512 == 0 {
                bm.par_mark(mr.start.add_words(w));
            }
        }
        // Abort after the first chunk; some marks must survive.
        let mut calls = 0;
        let completed = bm.clear_range_chunked(mr, 0x1000, || {
            calls += 1;
            true
        });
        assert!(!completed);
        assert_eq!(calls, 1);
        assert!(bm.count_marked(mr.start, mr.end) > 0);

        assert!(bm.clear_range_chunked(mr, 0x1000, || false));
        assert_eq!(bm.count_marked(mr.start, mr.end), 0);
    }

    #[test]
    fn concurrent_marking_is_race_free() {
        use std::sync::Arc;
        let bm = Arc::new(bitmap());
        let mut handles = Vec::new();
        let wins = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let bm = Arc::clone(&bm);
            let wins = Arc::clone(&wins);
            handles.push(std::thread::spawn(move || {
                for w in 0..2048 {
                    if bm.par_mark(HeapAddr::new(0x10000).add_words(w)) {
                        wins.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        // Each bit transitions exactly once no matter how many racers.
        assert_eq!(wins.load(Ordering::Relaxed), 2048);
    }
}
