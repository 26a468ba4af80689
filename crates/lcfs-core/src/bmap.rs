//! Logical→physical block mapping for regular files.
//!
//! A freshly written file keeps the compact contiguous form: a single
//! `(extent_block, extent_len)` pair meaning logical blocks `0..len` map to
//! `extent_block..extent_block+len`. The first write that would break
//! contiguity converts the file to a sparse map of sorted extents.

use lcfs_types::{BlockNumber, LC_INVALID_BLOCK};
use std::sync::Arc;

/// One sparse-map extent: `count` logical blocks starting at `logical`
/// map to physical blocks starting at `physical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BmapExtent {
    pub logical: u64,
    pub physical: BlockNumber,
    pub count: u64,
}

impl BmapExtent {
    #[must_use]
    pub fn logical_end(&self) -> u64 {
        self.logical + self.count
    }
}

/// Sparse block map, sorted by logical block, disjoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bmap {
    extents: Vec<BmapExtent>,
}

/// A resolved slice of a read request. `physical == None` is a hole that
/// reads as zeroes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BmapSlice {
    pub logical: u64,
    pub physical: Option<BlockNumber>,
    pub count: u64,
}

impl Bmap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a sparse map equivalent to a contiguous extent. Used when a
    /// contiguous file diverges.
    #[must_use]
    pub fn from_extent(start: BlockNumber, len: u64) -> Self {
        let mut map = Self::new();
        if len > 0 {
            map.extents.push(BmapExtent {
                logical: 0,
                physical: start,
                count: len,
            });
        }
        map
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = BmapExtent> + '_ {
        self.extents.iter().copied()
    }

    /// Total mapped blocks.
    #[must_use]
    pub fn mapped_blocks(&self) -> u64 {
        self.extents.iter().map(|e| e.count).sum()
    }

    /// Resolve `[logical, logical + count)` into physical slices with
    /// holes reported as `physical == None`.
    #[must_use]
    pub fn resolve(&self, logical: u64, count: u64) -> Vec<BmapSlice> {
        let mut out = Vec::new();
        let mut pos = logical;
        let end = logical + count;
        let mut idx = self.extents.partition_point(|e| e.logical_end() <= pos);
        while pos < end {
            match self.extents.get(idx) {
                Some(e) if e.logical <= pos => {
                    let take = (e.logical_end() - pos).min(end - pos);
                    out.push(BmapSlice {
                        logical: pos,
                        physical: Some(BlockNumber(e.physical.0 + (pos - e.logical))),
                        count: take,
                    });
                    pos += take;
                    idx += 1;
                }
                Some(e) => {
                    let take = (e.logical - pos).min(end - pos);
                    out.push(BmapSlice {
                        logical: pos,
                        physical: None,
                        count: take,
                    });
                    pos += take;
                }
                None => {
                    out.push(BmapSlice {
                        logical: pos,
                        physical: None,
                        count: end - pos,
                    });
                    break;
                }
            }
        }
        out
    }

    /// Physical block of a single logical block, if mapped.
    #[must_use]
    pub fn lookup(&self, logical: u64) -> Option<BlockNumber> {
        let idx = self.extents.partition_point(|e| e.logical_end() <= logical);
        let e = self.extents.get(idx)?;
        (e.logical <= logical).then(|| BlockNumber(e.physical.0 + (logical - e.logical)))
    }

    /// Map `[logical, logical + count)` to `physical..`, superseding any
    /// existing mapping of that logical range. Returns the physical ranges
    /// that were displaced so the caller can decide what to free.
    pub fn map(&mut self, logical: u64, physical: BlockNumber, count: u64) -> Vec<(BlockNumber, u64)> {
        let displaced = self.unmap(logical, count);

        // Insert, merging with a physically adjacent neighbor when the
        // logical runs also touch.
        let idx = self.extents.partition_point(|e| e.logical < logical);
        let merged_left = idx > 0 && {
            let left = &self.extents[idx - 1];
            left.logical_end() == logical && left.physical.0 + left.count == physical.0
        };
        if merged_left {
            self.extents[idx - 1].count += count;
        } else {
            self.extents.insert(
                idx,
                BmapExtent {
                    logical,
                    physical,
                    count,
                },
            );
        }
        let at = if merged_left { idx - 1 } else { idx };
        // Try to absorb the right neighbor.
        if at + 1 < self.extents.len() {
            let right = self.extents[at + 1];
            let cur = self.extents[at];
            if cur.logical_end() == right.logical
                && cur.physical.0 + cur.count == right.physical.0
            {
                self.extents[at].count += right.count;
                self.extents.remove(at + 1);
            }
        }
        displaced
    }

    /// Remove mappings covering `[logical, logical + count)`, returning
    /// the physical ranges removed.
    pub fn unmap(&mut self, logical: u64, count: u64) -> Vec<(BlockNumber, u64)> {
        if count == 0 {
            return Vec::new();
        }
        let end = logical + count;
        let mut removed = Vec::new();
        let mut idx = self.extents.partition_point(|e| e.logical_end() <= logical);
        while idx < self.extents.len() {
            let e = self.extents[idx];
            if e.logical >= end {
                break;
            }
            let cut_start = e.logical.max(logical);
            let cut_end = e.logical_end().min(end);
            removed.push((
                BlockNumber(e.physical.0 + (cut_start - e.logical)),
                cut_end - cut_start,
            ));
            self.extents.remove(idx);
            if e.logical < cut_start {
                self.extents.insert(
                    idx,
                    BmapExtent {
                        logical: e.logical,
                        physical: e.physical,
                        count: cut_start - e.logical,
                    },
                );
                idx += 1;
            }
            if cut_end < e.logical_end() {
                self.extents.insert(
                    idx,
                    BmapExtent {
                        logical: cut_end,
                        physical: BlockNumber(e.physical.0 + (cut_end - e.logical)),
                        count: e.logical_end() - cut_end,
                    },
                );
            }
        }
        removed
    }

    /// Drop all mappings at or beyond `logical`, returning the physical
    /// ranges removed. Used by truncate.
    pub fn truncate(&mut self, logical: u64) -> Vec<(BlockNumber, u64)> {
        let tail = self
            .extents
            .last()
            .map_or(0, BmapExtent::logical_end)
            .saturating_sub(logical);
        if tail == 0 {
            return Vec::new();
        }
        self.unmap(logical, tail)
    }
}

/// How a regular file's content is addressed.
#[derive(Debug, Clone)]
pub enum RegMap {
    /// No blocks allocated yet.
    Empty,
    /// Compact contiguous form: logical `0..len` at `start..start+len`.
    Extent { start: BlockNumber, len: u64 },
    /// Sparse form. The `Arc` is shared with a parent layer after a clone
    /// until the first mutation materializes a private copy.
    Sparse(Arc<Bmap>),
}

impl RegMap {
    /// Resolve a logical range regardless of representation.
    #[must_use]
    pub fn resolve(&self, logical: u64, count: u64) -> Vec<BmapSlice> {
        match self {
            Self::Empty => vec![BmapSlice {
                logical,
                physical: None,
                count,
            }],
            Self::Extent { start, len } => {
                Bmap::from_extent(*start, *len).resolve(logical, count)
            }
            Self::Sparse(map) => map.resolve(logical, count),
        }
    }

    /// Total mapped blocks.
    #[must_use]
    pub fn mapped_blocks(&self) -> u64 {
        match self {
            Self::Empty => 0,
            Self::Extent { len, .. } => *len,
            Self::Sparse(map) => map.mapped_blocks(),
        }
    }

    /// On-disk dinode fields `(extent_block, extent_len)` for this map.
    #[must_use]
    pub fn dinode_extent(&self) -> (u64, u64) {
        match self {
            Self::Extent { start, len } => (start.0, *len),
            _ => (LC_INVALID_BLOCK, 0),
        }
    }
}
