//! Ordered index of block guest ranges, used to find what a memory write overlaps.

use crate::block::BlockId;

use std::collections::BTreeSet;

/// Half-open interval overlap test: does `[s1, e1)` intersect `[s2, e2)`?
#[inline(always)]
pub const fn range_intersect(s1: u64, e1: u64, s2: u64, e2: u64) -> bool {
    s1 < e2 && s2 < e1
}

/// Orders physical guest ranges by `(inclusive end, start, block)`.
///
/// The block is part of the key: mirrored guest addresses map to the same physical range, and each of their blocks
/// needs its own entry.
#[derive(Debug, Default)]
pub struct RangeIndex {
    entries: BTreeSet<(u32, u32, BlockId)>,
    /// Longest range inserted since the last clear. Bounds how far past the query window a block can start.
    max_span: u64,
}

impl RangeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `[start, start + len)`. `len` must not be 0.
    pub fn insert(&mut self, start: u32, len: u32, id: BlockId) {
        debug_assert!(len > 0);
        let last = (start as u64 + len as u64 - 1) as u32;
        self.entries.insert((last, start, id));
        self.max_span = self.max_span.max(len as u64);
    }

    /// Removes the entry of `id` for `[start, start + len)`. Returns false if there was none.
    pub fn remove(&mut self, start: u32, len: u32, id: BlockId) -> bool {
        let last = (start as u64 + len as u64 - 1) as u32;
        self.entries.remove(&(last, start, id))
    }

    /// Returns every block whose range intersects `[start, start + len)`.
    pub fn intersecting(&self, start: u32, len: u32) -> Vec<BlockId> {
        if len == 0 {
            return Vec::new();
        }

        let start = start as u64;
        let end = start + len as u64;
        // A block ending at `last` starts at `last + 1 - max_span` at the earliest.
        let scan_limit = end + self.max_span;

        self.entries
            .range((start as u32, 0, BlockId(0))..)
            .take_while(|(last, _, _)| (*last as u64) < scan_limit)
            .filter(|(last, first, _)| range_intersect(*first as u64, *last as u64 + 1, start, end))
            .map(|(_, _, id)| *id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.max_span = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intersect_is_half_open_and_symmetric() {
        assert!(range_intersect(0, 10, 5, 15));
        assert!(range_intersect(5, 15, 0, 10));
        assert!(range_intersect(0, 10, 2, 3));
        assert!(range_intersect(2, 3, 0, 10));
        assert!(!range_intersect(0, 10, 10, 20));
        assert!(!range_intersect(10, 20, 0, 10));
        assert!(!range_intersect(0, 0, 0, 10));
    }

    #[test]
    fn finds_partial_overlaps_only() {
        let mut index = RangeIndex::new();
        index.insert(0x1000, 0x40, BlockId(0));
        index.insert(0x1040, 0x20, BlockId(1));
        index.insert(0x2000, 0x10, BlockId(2));

        assert_eq!(index.intersecting(0x1040, 4), vec![BlockId(1)]);
        assert_eq!(index.intersecting(0x103C, 8), vec![BlockId(0), BlockId(1)]);
        assert!(index.intersecting(0x0FFC, 4).is_empty());
        assert!(index.intersecting(0x1060, 0xFA0).is_empty());
        assert_eq!(index.intersecting(0x0, 0x10000), vec![BlockId(0), BlockId(1), BlockId(2)]);
    }

    #[test]
    fn overlapping_blocks_with_different_ends() {
        let mut index = RangeIndex::new();
        // A long block starting before a short one but ending after it.
        index.insert(0x1000, 0x100, BlockId(0));
        index.insert(0x1010, 0x10, BlockId(1));

        let mut hits = index.intersecting(0x1014, 4);
        hits.sort();
        assert_eq!(hits, vec![BlockId(0), BlockId(1)]);
        assert_eq!(index.intersecting(0x1080, 4), vec![BlockId(0)]);
    }

    #[test]
    fn remove_checks_owner() {
        let mut index = RangeIndex::new();
        index.insert(0x1000, 0x40, BlockId(3));
        assert!(!index.remove(0x1000, 0x40, BlockId(4)));
        assert!(index.remove(0x1000, 0x40, BlockId(3)));
        assert!(index.is_empty());
        assert!(index.intersecting(0x1000, 0x40).is_empty());
    }

    #[test]
    fn same_range_keeps_every_block() {
        let mut index = RangeIndex::new();
        index.insert(0x1000, 0x40, BlockId(0));
        index.insert(0x1000, 0x40, BlockId(1));
        assert_eq!(index.len(), 2);
        assert_eq!(index.intersecting(0x1010, 4), vec![BlockId(0), BlockId(1)]);

        assert!(index.remove(0x1000, 0x40, BlockId(0)));
        assert_eq!(index.intersecting(0x1010, 4), vec![BlockId(1)]);
    }
}
