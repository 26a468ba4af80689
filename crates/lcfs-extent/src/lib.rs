#![forbid(unsafe_code)]
//! Interval arithmetic over block ranges.
//!
//! `ExtentMap` keeps a sorted, disjoint, coalesced set of block extents.
//! It backs the global free list, per-layer allocation pools, and the
//! per-inode record of metadata blocks.

use lcfs_types::BlockNumber;

/// A contiguous run of blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub start: BlockNumber,
    pub count: u64,
}

impl Extent {
    #[must_use]
    pub fn new(start: BlockNumber, count: u64) -> Self {
        Self { start, count }
    }

    /// One past the last block.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.start.0 + self.count
    }

    #[must_use]
    pub fn contains(&self, block: BlockNumber) -> bool {
        block.0 >= self.start.0 && block.0 < self.end()
    }
}

/// Sorted, disjoint, coalesced set of extents.
///
/// Invariants: extents are ordered by start block, never overlap, and no
/// two adjacent extents touch (they would have been merged).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtentMap {
    extents: Vec<Extent>,
}

impl ExtentMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// Number of extents (not blocks).
    #[must_use]
    pub fn len(&self) -> usize {
        self.extents.len()
    }

    /// Total blocks covered.
    #[must_use]
    pub fn total_blocks(&self) -> u64 {
        self.extents.iter().map(|e| e.count).sum()
    }

    #[must_use]
    pub fn contains(&self, block: BlockNumber) -> bool {
        match self
            .extents
            .binary_search_by(|e| e.start.0.cmp(&block.0))
        {
            Ok(_) => true,
            Err(0) => false,
            Err(idx) => self.extents[idx - 1].contains(block),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Extent> + '_ {
        self.extents.iter().copied()
    }

    /// Insert a range, coalescing with adjacent or overlapping extents.
    ///
    /// Inserting a range that overlaps existing coverage is tolerated; the
    /// union is kept.
    pub fn insert(&mut self, start: BlockNumber, count: u64) {
        if count == 0 {
            return;
        }
        let mut new_start = start.0;
        let mut new_end = start.0 + count;

        // First extent that could interact: the one before the insertion
        // point (it may touch us from the left).
        let mut idx = match self.extents.binary_search_by(|e| e.start.0.cmp(&new_start)) {
            Ok(idx) => idx,
            Err(idx) => idx.saturating_sub(1),
        };

        // Absorb every extent that overlaps or touches the new range.
        while idx < self.extents.len() {
            let e = self.extents[idx];
            if e.end() < new_start {
                idx += 1;
                continue;
            }
            if e.start.0 > new_end {
                break;
            }
            new_start = new_start.min(e.start.0);
            new_end = new_end.max(e.end());
            self.extents.remove(idx);
        }

        let pos = self
            .extents
            .binary_search_by(|e| e.start.0.cmp(&new_start))
            .unwrap_err();
        self.extents.insert(
            pos,
            Extent::new(BlockNumber(new_start), new_end - new_start),
        );
    }

    /// Remove the first extent able to satisfy `count` blocks, returning
    /// the removed range. Ties go to the lowest block number, which the
    /// sorted order gives for free.
    pub fn remove_first_fit(&mut self, count: u64) -> Option<Extent> {
        if count == 0 {
            return None;
        }
        let idx = self.extents.iter().position(|e| e.count >= count)?;
        let e = self.extents[idx];
        if e.count == count {
            self.extents.remove(idx);
        } else {
            self.extents[idx] = Extent::new(BlockNumber(e.start.0 + count), e.count - count);
        }
        Some(Extent::new(e.start, count))
    }

    /// Remove exactly `[start, start + count)`. Returns `false` (leaving
    /// the map unchanged) when the range is not fully covered.
    pub fn remove_exact(&mut self, start: BlockNumber, count: u64) -> bool {
        if count == 0 {
            return true;
        }
        let end = start.0 + count;
        let idx = match self.extents.binary_search_by(|e| e.start.0.cmp(&start.0)) {
            Ok(idx) => idx,
            Err(0) => return false,
            Err(idx) => idx - 1,
        };
        let e = self.extents[idx];
        if start.0 < e.start.0 || end > e.end() {
            return false;
        }

        let left = start.0 - e.start.0;
        let right = e.end() - end;
        match (left, right) {
            (0, 0) => {
                self.extents.remove(idx);
            }
            (0, _) => {
                self.extents[idx] = Extent::new(BlockNumber(end), right);
            }
            (_, 0) => {
                self.extents[idx] = Extent::new(e.start, left);
            }
            (_, _) => {
                self.extents[idx] = Extent::new(e.start, left);
                self.extents
                    .insert(idx + 1, Extent::new(BlockNumber(end), right));
            }
        }
        true
    }

    /// Take up to `max_count` blocks starting exactly at `start`, if
    /// `start` is free. Used for adjacency-preferring allocation.
    pub fn take_at(&mut self, start: BlockNumber, max_count: u64) -> Option<Extent> {
        if max_count == 0 {
            return None;
        }
        let idx = match self.extents.binary_search_by(|e| e.start.0.cmp(&start.0)) {
            Ok(idx) => idx,
            Err(0) => return None,
            Err(idx) => idx - 1,
        };
        let e = self.extents[idx];
        if !e.contains(start) {
            return None;
        }
        let take = max_count.min(e.end() - start.0);
        let taken = self.remove_exact(start, take);
        debug_assert!(taken);
        Some(Extent::new(start, take))
    }

    /// Take up to `max_count` blocks from the lowest-numbered extent.
    pub fn take_first(&mut self, max_count: u64) -> Option<Extent> {
        if max_count == 0 || self.extents.is_empty() {
            return None;
        }
        let e = self.extents[0];
        let take = max_count.min(e.count);
        let taken = self.remove_exact(e.start, take);
        debug_assert!(taken);
        Some(Extent::new(e.start, take))
    }

    /// Remove whatever part of `[start, start + count)` is covered,
    /// returning the removed pieces. Unlike `remove_exact`, partial
    /// coverage is fine.
    pub fn remove_range(&mut self, start: BlockNumber, count: u64) -> Vec<Extent> {
        if count == 0 {
            return Vec::new();
        }
        let end = start.0 + count;
        let mut removed = Vec::new();
        let mut idx = match self.extents.binary_search_by(|e| e.start.0.cmp(&start.0)) {
            Ok(idx) => idx,
            Err(idx) => idx.saturating_sub(1),
        };
        while idx < self.extents.len() {
            let e = self.extents[idx];
            if e.end() <= start.0 {
                idx += 1;
                continue;
            }
            if e.start.0 >= end {
                break;
            }
            let cut_start = e.start.0.max(start.0);
            let cut_end = e.end().min(end);
            self.extents.remove(idx);
            if e.start.0 < cut_start {
                self.extents.insert(
                    idx,
                    Extent::new(e.start, cut_start - e.start.0),
                );
                idx += 1;
            }
            if cut_end < e.end() {
                self.extents
                    .insert(idx, Extent::new(BlockNumber(cut_end), e.end() - cut_end));
            }
            removed.push(Extent::new(BlockNumber(cut_start), cut_end - cut_start));
        }
        removed
    }

    /// Remove everything, returning the extents that were held.
    pub fn drain(&mut self) -> Vec<Extent> {
        std::mem::take(&mut self.extents)
    }
}

impl FromIterator<Extent> for ExtentMap {
    fn from_iter<I: IntoIterator<Item = Extent>>(iter: I) -> Self {
        let mut map = Self::new();
        for e in iter {
            map.insert(e.start, e.count);
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_of(ranges: &[(u64, u64)]) -> ExtentMap {
        let mut map = ExtentMap::new();
        for &(start, count) in ranges {
            map.insert(BlockNumber(start), count);
        }
        map
    }

    fn ranges_of(map: &ExtentMap) -> Vec<(u64, u64)> {
        map.iter().map(|e| (e.start.0, e.count)).collect()
    }

    #[test]
    fn insert_keeps_sorted_disjoint() {
        let map = map_of(&[(100, 10), (10, 5), (50, 1)]);
        assert_eq!(ranges_of(&map), vec![(10, 5), (50, 1), (100, 10)]);
        assert_eq!(map.total_blocks(), 16);
    }

    #[test]
    fn adjacent_inserts_coalesce_in_any_order() {
        // Freeing adjacent blocks in any order produces a single extent.
        let orders: [&[u64]; 3] = [&[3, 4, 5, 6], &[6, 4, 3, 5], &[5, 3, 6, 4]];
        for order in orders {
            let mut map = ExtentMap::new();
            for &b in order {
                map.insert(BlockNumber(b), 1);
            }
            assert_eq!(ranges_of(&map), vec![(3, 4)], "order {order:?}");
        }
    }

    #[test]
    fn insert_bridges_two_extents() {
        let map = map_of(&[(0, 5), (10, 5), (5, 5)]);
        assert_eq!(ranges_of(&map), vec![(0, 15)]);
    }

    #[test]
    fn overlapping_insert_keeps_union() {
        let map = map_of(&[(10, 10), (15, 10)]);
        assert_eq!(ranges_of(&map), vec![(10, 15)]);
    }

    #[test]
    fn first_fit_prefers_lowest_block() {
        let mut map = map_of(&[(10, 2), (20, 8), (40, 8)]);
        let got = map.remove_first_fit(4).unwrap();
        assert_eq!((got.start.0, got.count), (20, 4));
        assert_eq!(ranges_of(&map), vec![(10, 2), (24, 4), (40, 8)]);
    }

    #[test]
    fn first_fit_exhausts_extent() {
        let mut map = map_of(&[(10, 4)]);
        let got = map.remove_first_fit(4).unwrap();
        assert_eq!((got.start.0, got.count), (10, 4));
        assert!(map.is_empty());
        assert!(map.remove_first_fit(1).is_none());
    }

    #[test]
    fn remove_exact_middle_splits() {
        let mut map = map_of(&[(10, 10)]);
        assert!(map.remove_exact(BlockNumber(13), 4));
        assert_eq!(ranges_of(&map), vec![(10, 3), (17, 3)]);
    }

    #[test]
    fn remove_exact_edges() {
        let mut map = map_of(&[(10, 10)]);
        assert!(map.remove_exact(BlockNumber(10), 3));
        assert!(map.remove_exact(BlockNumber(17), 3));
        assert_eq!(ranges_of(&map), vec![(13, 4)]);
    }

    #[test]
    fn remove_exact_rejects_uncovered() {
        let mut map = map_of(&[(10, 5)]);
        assert!(!map.remove_exact(BlockNumber(12), 10));
        assert!(!map.remove_exact(BlockNumber(0), 1));
        assert_eq!(ranges_of(&map), vec![(10, 5)]);
    }

    #[test]
    fn contains_finds_interior_blocks() {
        let map = map_of(&[(10, 5), (30, 1)]);
        assert!(map.contains(BlockNumber(10)));
        assert!(map.contains(BlockNumber(14)));
        assert!(!map.contains(BlockNumber(15)));
        assert!(map.contains(BlockNumber(30)));
        assert!(!map.contains(BlockNumber(29)));
    }

    #[test]
    fn take_at_prefers_exact_start() {
        let mut map = map_of(&[(10, 10)]);
        let got = map.take_at(BlockNumber(14), 4).unwrap();
        assert_eq!((got.start.0, got.count), (14, 4));
        assert_eq!(ranges_of(&map), vec![(10, 4), (18, 2)]);

        // Start not free.
        assert!(map.take_at(BlockNumber(15), 1).is_none());
        // Clipped at extent end.
        let got = map.take_at(BlockNumber(18), 100).unwrap();
        assert_eq!((got.start.0, got.count), (18, 2));
    }

    #[test]
    fn take_first_clips_to_extent() {
        let mut map = map_of(&[(10, 3), (20, 10)]);
        let got = map.take_first(8).unwrap();
        assert_eq!((got.start.0, got.count), (10, 3));
        let got = map.take_first(8).unwrap();
        assert_eq!((got.start.0, got.count), (20, 8));
        assert_eq!(ranges_of(&map), vec![(28, 2)]);
    }

    #[test]
    fn remove_range_takes_intersection() {
        let mut map = map_of(&[(10, 10), (30, 5)]);
        let removed = map.remove_range(BlockNumber(15), 20);
        assert_eq!(
            removed
                .iter()
                .map(|e| (e.start.0, e.count))
                .collect::<Vec<_>>(),
            vec![(15, 5), (30, 5)]
        );
        assert_eq!(ranges_of(&map), vec![(10, 5)]);
    }

    #[test]
    fn remove_range_interior_splits() {
        let mut map = map_of(&[(10, 10)]);
        let removed = map.remove_range(BlockNumber(13), 2);
        assert_eq!(removed.len(), 1);
        assert_eq!((removed[0].start.0, removed[0].count), (13, 2));
        assert_eq!(ranges_of(&map), vec![(10, 3), (15, 5)]);
    }

    #[test]
    fn remove_range_misses_are_empty() {
        let mut map = map_of(&[(10, 5)]);
        assert!(map.remove_range(BlockNumber(20), 5).is_empty());
        assert_eq!(ranges_of(&map), vec![(10, 5)]);
    }

    #[test]
    fn drain_empties_map() {
        let mut map = map_of(&[(1, 2), (8, 2)]);
        let drained = map.drain();
        assert_eq!(drained.len(), 2);
        assert!(map.is_empty());
    }
}
