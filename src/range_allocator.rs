//! First-fit byte range allocator used inside buffer blocks.

/// Every range handed out starts and ends on a multiple of this
pub const GRANULARITY: u64 = 16;

/// Round `value` up to a multiple of `align`, which must be a power of two
pub fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// A reserved span inside the allocator's range
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SubRange {
    /// Start of the reservation. This is what gets passed back to `sub_free`.
    pub offset: u64,
    /// First byte satisfying the requested alignment
    pub aligned_offset: u64,
    /// Reserved bytes, counted from `offset`, including any alignment padding
    pub size: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct FreeRange {
    offset: u64,
    size: u64,
}

impl FreeRange {
    fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// Reservation for `size` bytes at `align` inside this range, if it fits
    fn fit(&self, size: u64, align: u64) -> Option<SubRange> {
        let aligned_offset = align_up(self.offset, align);
        let end = aligned_offset.checked_add(align_up(size, GRANULARITY))?;
        (end <= self.end()).then(|| SubRange {
            offset: self.offset,
            aligned_offset,
            size: end - self.offset,
        })
    }
}

/// Tracks the free spans of `[0, size)`, sorted by offset and always fully coalesced
#[derive(Debug, Clone)]
pub struct RangeAllocator {
    size: u64,
    free: Vec<FreeRange>,
}

impl RangeAllocator {
    /// `size` is rounded down to the granularity
    pub fn new(size: u64) -> Self {
        let size = size & !(GRANULARITY - 1);
        Self {
            size,
            free: vec![FreeRange { offset: 0, size }],
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Size rounded up the way `sub_allocate` will reserve it, ignoring alignment padding
    pub fn aligned_size(size: u64) -> u64 {
        align_up(size, GRANULARITY)
    }

    pub fn sub_allocate(&mut self, size: u64, align: u64) -> Option<SubRange> {
        if size == 0 {
            return None;
        }
        let align = align.max(GRANULARITY);

        let (index, range) = self
            .free
            .iter()
            .enumerate()
            .find_map(|(index, free)| free.fit(size, align).map(|range| (index, range)))?;

        let free = &mut self.free[index];
        free.offset += range.size;
        free.size -= range.size;
        if free.size == 0 {
            self.free.remove(index);
        }

        Some(range)
    }

    /// Return a reservation. `offset` and `size` must be exactly those of a live `SubRange`.
    pub fn sub_free(&mut self, offset: u64, size: u64) {
        debug_assert_eq!(offset % GRANULARITY, 0);
        debug_assert!(offset + size <= self.size);

        let index = self.free.partition_point(|free| free.offset < offset);
        debug_assert!(
            index == 0 || self.free[index - 1].end() <= offset,
            "freed range overlaps a free range"
        );
        debug_assert!(
            index == self.free.len() || offset + size <= self.free[index].offset,
            "freed range overlaps a free range"
        );

        let merges_prev = index > 0 && self.free[index - 1].end() == offset;
        let merges_next = index < self.free.len() && self.free[index].offset == offset + size;

        match (merges_prev, merges_next) {
            (true, true) => {
                let next = self.free.remove(index);
                self.free[index - 1].size += size + next.size;
            }
            (true, false) => self.free[index - 1].size += size,
            (false, true) => {
                let next = &mut self.free[index];
                next.offset = offset;
                next.size += size;
            }
            (false, false) => self.free.insert(index, FreeRange { offset, size }),
        }
    }

    /// No live reservations remain
    pub fn is_empty(&self) -> bool {
        self.free.len() == 1 && self.free[0] == FreeRange { offset: 0, size: self.size }
    }

    /// Whether `sub_allocate(size, align)` would succeed, without reserving anything
    pub fn is_available(&self, size: u64, align: u64) -> bool {
        let align = align.max(GRANULARITY);
        size != 0 && self.free.iter().any(|free| free.fit(size, align).is_some())
    }

    /// Bytes not covered by any reservation
    pub fn free_bytes(&self) -> u64 {
        self.free.iter().map(|free| free.size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn reservations_round_to_granularity() {
        let mut range = RangeAllocator::new(1024);
        let a = range.sub_allocate(100, 16).unwrap();
        let b = range.sub_allocate(200, 16).unwrap();
        assert_eq!(a, SubRange { offset: 0, aligned_offset: 0, size: 112 });
        assert_eq!(b, SubRange { offset: 112, aligned_offset: 112, size: 208 });
        assert_eq!(range.free_bytes(), 1024 - 320);
    }

    #[test]
    fn alignment_padding_is_reserved() {
        let mut range = RangeAllocator::new(1024);
        range.sub_allocate(16, 16).unwrap();
        let padded = range.sub_allocate(64, 256).unwrap();
        assert_eq!(padded.offset, 16);
        assert_eq!(padded.aligned_offset, 256);
        assert_eq!(padded.size, 256 - 16 + 64);
    }

    #[test]
    fn freeing_coalesces_back_to_empty() {
        let mut range = RangeAllocator::new(512);
        let a = range.sub_allocate(64, 16).unwrap();
        let b = range.sub_allocate(64, 16).unwrap();
        let c = range.sub_allocate(64, 16).unwrap();
        assert!(!range.is_empty());

        range.sub_free(b.offset, b.size);
        range.sub_free(a.offset, a.size);
        range.sub_free(c.offset, c.size);
        assert!(range.is_empty());
        assert!(range.is_available(512, 16));
    }

    #[test]
    fn exhaustion_and_availability_agree() {
        let mut range = RangeAllocator::new(256);
        assert!(range.is_available(256, 16));
        assert!(!range.is_available(257, 16));
        range.sub_allocate(200, 16).unwrap();
        assert!(!range.is_available(64, 16));
        assert!(range.sub_allocate(64, 16).is_none());
        assert!(range.is_available(48, 16));
        assert!(range.sub_allocate(0, 16).is_none());
    }

    #[test]
    fn holes_are_filled_first_fit() {
        let mut range = RangeAllocator::new(1024);
        let a = range.sub_allocate(128, 16).unwrap();
        range.sub_allocate(128, 16).unwrap();
        range.sub_free(a.offset, a.size);
        assert_eq!(range.sub_allocate(64, 16).unwrap().offset, 0);
    }

    proptest! {
        /// Live reservations never overlap and stay inside the range
        #[test]
        fn live_ranges_never_overlap(ops in prop::collection::vec((1u64..300, 0u32..6, any::<bool>()), 1..64)) {
            let mut range = RangeAllocator::new(4096);
            let mut live: Vec<SubRange> = Vec::new();

            for (size, align_shift, free) in ops {
                if free && !live.is_empty() {
                    let victim = live.remove(size as usize % live.len());
                    range.sub_free(victim.offset, victim.size);
                } else if let Some(sub) = range.sub_allocate(size, 16 << align_shift) {
                    prop_assert_eq!(sub.aligned_offset % (16 << align_shift), 0);
                    prop_assert!(sub.aligned_offset + size <= sub.offset + sub.size);
                    prop_assert!(sub.offset + sub.size <= 4096);
                    live.push(sub);
                }

                let mut sorted = live.clone();
                sorted.sort_by_key(|sub| sub.offset);
                for pair in sorted.windows(2) {
                    prop_assert!(pair[0].offset + pair[0].size <= pair[1].offset);
                }

                let reserved: u64 = live.iter().map(|sub| sub.size).sum();
                prop_assert_eq!(reserved + range.free_bytes(), 4096);
            }

            for sub in live.drain(..) {
                range.sub_free(sub.offset, sub.size);
            }
            prop_assert!(range.is_empty());
        }
    }
}
