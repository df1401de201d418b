//! The region arena and address-to-region mapping.

use crate::object::{HeapAddr, MemRegion, WORD_BYTES};

use super::region::{Region, RegionType};
use super::RegionIdx;

/// Fixed partition of the reserved heap range into power-of-two regions.
///
/// The layout owns every [`Region`] for the lifetime of the heap; all other
/// components refer to regions by [`RegionIdx`].
///
/// # Examples
///
/// ```
/// use conmark::heap::{HeapLayout, RegionIdx};
/// use conmark::object::HeapAddr;
///
/// let heap = HeapLayout::new(HeapAddr::new(0x1000_0000), 8, 1024 * 1024, 64);
/// assert_eq!(heap.num_regions(), 8);
///
/// let r = heap.region(RegionIdx::new(2));
/// assert_eq!(r.bottom(), HeapAddr::new(0x1020_0000));
/// assert_eq!(heap.addr_to_region(r.bottom()), Some(RegionIdx::new(2)));
/// assert_eq!(heap.addr_to_region(HeapAddr::new(0x0)), None);
/// ```
pub struct HeapLayout {
    start: HeapAddr,
    region_bytes: usize,
    regions: Vec<Region>,
}

impl HeapLayout {
    /// Reserve `num_regions` regions of `region_bytes` each starting at
    /// `start`. `region_bytes` must be a power of two and `start` aligned
    /// to it.
    pub fn new(
        start: HeapAddr,
        num_regions: u32,
        region_bytes: usize,
        target_queue_capacity: usize,
    ) -> Self {
        assert!(region_bytes.is_power_of_two(), "region size must be a power of two");
        assert!(
            start.as_usize() % region_bytes == 0,
            "heap start must be region aligned"
        );
        let regions = (0..num_regions)
            .map(|i| {
                let bottom = start.add_bytes(i as usize * region_bytes);
                Region::new(
                    RegionIdx::new(i),
                    bottom,
                    bottom.add_bytes(region_bytes),
                    target_queue_capacity,
                )
            })
            .collect();
        HeapLayout {
            start,
            region_bytes,
            regions,
        }
    }

    #[inline]
    pub fn start(&self) -> HeapAddr {
        self.start
    }

    #[inline]
    pub fn end(&self) -> HeapAddr {
        self.start.add_bytes(self.regions.len() * self.region_bytes)
    }

    #[inline]
    pub fn reserved(&self) -> MemRegion {
        MemRegion::new(self.start(), self.end())
    }

    #[inline]
    pub fn num_regions(&self) -> u32 {
        self.regions.len() as u32
    }

    #[inline]
    pub fn region_bytes(&self) -> usize {
        self.region_bytes
    }

    #[inline]
    pub fn region_words(&self) -> usize {
        self.region_bytes / WORD_BYTES
    }

    #[inline]
    pub fn region(&self, idx: RegionIdx) -> &Region {
        &self.regions[idx.as_usize()]
    }

    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    #[inline]
    pub fn is_in_reserved(&self, addr: HeapAddr) -> bool {
        self.reserved().contains(addr)
    }

    /// Region index covering `addr`, if inside the reserved range.
    #[inline]
    pub fn addr_to_region(&self, addr: HeapAddr) -> Option<RegionIdx> {
        if !self.is_in_reserved(addr) {
            return None;
        }
        let off = addr.as_usize() - self.start.as_usize();
        Some(RegionIdx::new((off / self.region_bytes) as u32))
    }

    /// Region covering `addr`, if inside the reserved range.
    #[inline]
    pub fn region_containing(&self, addr: HeapAddr) -> Option<&Region> {
        self.addr_to_region(addr).map(|idx| self.region(idx))
    }

    /// Regions needed for a humongous object of `words` words.
    pub fn humongous_size_in_regions(&self, words: usize) -> u32 {
        let bytes = words * WORD_BYTES;
        (bytes.div_ceil(self.region_bytes)) as u32
    }

    /// Lay out a humongous object of `words` words starting at region
    /// `first`: type the spanned regions and push their tops to cover it.
    pub fn set_up_humongous(&self, first: RegionIdx, words: usize) {
        let span = self.humongous_size_in_regions(words);
        assert!(first.raw() + span <= self.num_regions());
        let mut remaining_bytes = words * WORD_BYTES;
        for i in 0..span {
            let r = self.region(RegionIdx::new(first.raw() + i));
            if i == 0 {
                r.set_region_type(RegionType::HumongousStart);
            } else {
                r.set_continues_humongous(first);
            }
            let fill = remaining_bytes.min(self.region_bytes);
            r.set_top(r.bottom().add_bytes(fill));
            remaining_bytes -= fill;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> HeapLayout {
        HeapLayout::new(HeapAddr::new(0x4000_0000), 16, 0x10_0000, 16)
    }

    #[test]
    fn address_mapping_round_trips() {
        let h = heap();
        for i in 0..16 {
            let r = h.region(RegionIdx::new(i));
            assert_eq!(h.addr_to_region(r.bottom()), Some(RegionIdx::new(i)));
            let last = HeapAddr::new(r.end().as_usize() - WORD_BYTES);
            assert_eq!(h.addr_to_region(last), Some(RegionIdx::new(i)));
        }
        assert_eq!(h.addr_to_region(h.end()), None);
    }

    #[test]
    fn humongous_span_rounding() {
        let h = heap();
        let region_words = h.region_words();
        assert_eq!(h.humongous_size_in_regions(region_words), 1);
        assert_eq!(h.humongous_size_in_regions(region_words + 1), 2);
        assert_eq!(h.humongous_size_in_regions(region_words * 5 / 2), 3);
    }

    #[test]
    fn humongous_setup_types_and_fills_regions() {
        let h = heap();
        let words = h.region_words() * 5 / 2;
        h.set_up_humongous(RegionIdx::new(4), words);

        assert!(h.region(RegionIdx::new(4)).is_starts_humongous());
        assert!(h.region(RegionIdx::new(5)).is_continues_humongous());
        assert!(h.region(RegionIdx::new(6)).is_continues_humongous());
        assert_eq!(
            h.region(RegionIdx::new(5)).humongous_start_region(),
            Some(RegionIdx::new(4))
        );
        // The last region is half filled.
        let last = h.region(RegionIdx::new(6));
        assert_eq!(last.used(), h.region_bytes() / 2);
    }
}
