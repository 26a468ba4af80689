//! Block allocation.
//!
//! A single global free map feeds per-layer pools in slabs of
//! `LC_SLAB_SIZE` blocks, which amortizes global-lock traffic. Each layer
//! keeps two pools — metadata and data — plus a reserved run of inode
//! blocks. Allocation is first-fit; ties go to the lowest block number,
//! which keeps related blocks close together.
//!
//! The global free mutex is a leaf lock: nothing else is acquired while
//! it is held.

use crate::layer::Layer;
use lcfs_error::{LcError, Result};
use lcfs_extent::{Extent, ExtentMap};
use lcfs_types::{BlockNumber, LC_INODE_CLUSTER_SIZE, LC_SLAB_SIZE};
use parking_lot::Mutex;
use tracing::debug;

/// The process-wide free pool.
#[derive(Debug, Default)]
pub struct GlobalAlloc {
    free: Mutex<ExtentMap>,
}

impl GlobalAlloc {
    #[must_use]
    pub fn new(free: ExtentMap) -> Self {
        Self {
            free: Mutex::new(free),
        }
    }

    /// Fresh device: everything after the superblock is free.
    #[must_use]
    pub fn with_range(start: u64, count: u64) -> Self {
        let mut free = ExtentMap::new();
        free.insert(BlockNumber(start), count);
        Self::new(free)
    }

    /// Take a contiguous run of exactly `count` blocks.
    pub(crate) fn take_contiguous(&self, count: u64) -> Option<Extent> {
        self.free.lock().remove_first_fit(count)
    }

    /// Take up to `count` blocks from the lowest free extent.
    pub(crate) fn take_upto(&self, count: u64) -> Option<Extent> {
        self.free.lock().take_first(count)
    }

    /// Return blocks to the global pool.
    pub fn free(&self, start: BlockNumber, count: u64) {
        self.free.lock().insert(start, count);
    }

    #[must_use]
    pub fn free_blocks(&self) -> u64 {
        self.free.lock().total_blocks()
    }

    /// Snapshot of the free map, for persistence and verification.
    #[must_use]
    pub fn snapshot(&self) -> ExtentMap {
        self.free.lock().clone()
    }
}

impl Layer {
    /// Allocate a contiguous run of exactly `count` blocks.
    ///
    /// Tries the layer pool first; when nothing there fits, pulls a fresh
    /// slab from the global free map and retries; as a last resort asks
    /// the global map for the run directly. Fails with `NoSpace` only
    /// when no contiguous run of `count` exists anywhere.
    pub fn alloc_exact(&self, count: u64, metadata: bool) -> Result<BlockNumber> {
        let mut pools = self.pools.lock();
        let pool = if metadata {
            &mut pools.meta
        } else {
            &mut pools.data
        };
        if let Some(run) = pool.remove_first_fit(count) {
            return Ok(run.start);
        }
        if let Some(slab) = self.galloc.take_contiguous(count.max(LC_SLAB_SIZE)) {
            debug!(
                layer = self.index.0,
                start = slab.start.0,
                count = slab.count,
                metadata,
                "pool refill"
            );
            pool.insert(slab.start, slab.count);
            if let Some(run) = pool.remove_first_fit(count) {
                return Ok(run.start);
            }
        }
        if let Some(run) = self.galloc.take_contiguous(count) {
            return Ok(run.start);
        }
        Err(LcError::NoSpace)
    }

    /// Allocate up to `count` blocks, preferring a run that starts at
    /// `near` to keep files physically contiguous. The returned extent
    /// may be shorter than requested; it is never empty.
    pub fn alloc_near(
        &self,
        near: Option<BlockNumber>,
        count: u64,
        metadata: bool,
    ) -> Result<Extent> {
        let mut pools = self.pools.lock();
        let pool = if metadata {
            &mut pools.meta
        } else {
            &mut pools.data
        };
        if let Some(want) = near {
            if let Some(run) = pool.take_at(want, count) {
                return Ok(run);
            }
        }
        if let Some(run) = pool.remove_first_fit(count) {
            return Ok(run);
        }
        if let Some(slab) = self.galloc.take_contiguous(count.max(LC_SLAB_SIZE)) {
            pool.insert(slab.start, slab.count);
            if let Some(run) = pool.remove_first_fit(count) {
                return Ok(run);
            }
        }
        // Fragmented: hand out the best partial run available.
        if let Some(run) = pool.take_first(count) {
            return Ok(run);
        }
        if let Some(run) = self.galloc.take_upto(count) {
            return Ok(run);
        }
        Err(LcError::NoSpace)
    }

    /// Return blocks to this layer's pool.
    pub fn free_local(&self, start: BlockNumber, count: u64, metadata: bool) {
        if count == 0 {
            return;
        }
        let mut pools = self.pools.lock();
        let pool = if metadata {
            &mut pools.meta
        } else {
            &mut pools.data
        };
        pool.insert(start, count);
    }

    /// Take one inode block from the reserved run, reserving a fresh
    /// `LC_INODE_CLUSTER_SIZE` run when the current one is exhausted.
    pub fn alloc_inode_block(&self) -> Result<BlockNumber> {
        {
            let mut pools = self.pools.lock();
            if let Some(run) = &mut pools.inode_run {
                let block = run.start;
                run.start = BlockNumber(run.start.0 + 1);
                run.count -= 1;
                if run.count == 0 {
                    pools.inode_run = None;
                }
                return Ok(block);
            }
        }
        match self.alloc_exact(LC_INODE_CLUSTER_SIZE, true) {
            Ok(start) => {
                let mut pools = self.pools.lock();
                pools.inode_run = Some(Extent::new(
                    BlockNumber(start.0 + 1),
                    LC_INODE_CLUSTER_SIZE - 1,
                ));
                Ok(start)
            }
            // Too fragmented for a full run: take single blocks.
            Err(LcError::NoSpace) => self.alloc_near(None, 1, true).map(|run| run.start),
            Err(err) => Err(err),
        }
    }

    /// Return the unused part of the inode-block run to the metadata
    /// pool. Called at the end of a sync.
    pub fn release_inode_run(&self) {
        let mut pools = self.pools.lock();
        if let Some(run) = pools.inode_run.take() {
            pools.meta.insert(run.start, run.count);
        }
    }

    /// Drain every pool back to the global free map. Called at commit
    /// (so the persisted free list is complete) and at teardown.
    pub fn drain_pools(&self) {
        let mut pools = self.pools.lock();
        for e in pools.meta.drain() {
            self.galloc.free(e.start, e.count);
        }
        for e in pools.data.drain() {
            self.galloc.free(e.start, e.count);
        }
        if let Some(run) = pools.inode_run.take() {
            self.galloc.free(run.start, run.count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::Counters;
    use lcfs_block::MemBlockDevice;
    use lcfs_types::{Ino, LayerIndex};
    use std::sync::Arc;

    fn test_layer(free_blocks: u64) -> Arc<Layer> {
        let dev = Arc::new(MemBlockDevice::new(free_blocks + 1));
        Layer::new(
            LayerIndex(0),
            Ino::ROOT,
            None,
            dev,
            Arc::new(Counters::default()),
            Arc::new(GlobalAlloc::with_range(1, free_blocks)),
            false,
        )
    }

    #[test]
    fn alloc_exact_contiguous() {
        let layer = test_layer(1024);
        let start = layer.alloc_exact(300, false).unwrap();
        assert_eq!(start, BlockNumber(1));
        // The global pool shrank by the slab pulled plus the direct grab.
        let pooled = layer.pooled_blocks();
        let global = layer.galloc.free_blocks();
        assert_eq!(global + pooled + 300, 1024);
    }

    #[test]
    fn alloc_exhaustion_is_no_space() {
        let layer = test_layer(16);
        assert!(matches!(
            layer.alloc_exact(64, false),
            Err(LcError::NoSpace)
        ));
        // Smaller request still succeeds.
        layer.alloc_exact(8, false).unwrap();
    }

    #[test]
    fn alloc_near_prefers_hint() {
        let layer = test_layer(1024);
        let first = layer.alloc_near(None, 4, false).unwrap();
        let next = layer
            .alloc_near(Some(BlockNumber(first.end())), 4, false)
            .unwrap();
        assert_eq!(next.start.0, first.end());
    }

    #[test]
    fn freed_blocks_are_reused() {
        let layer = test_layer(1024);
        let run = layer.alloc_near(None, 8, false).unwrap();
        layer.free_local(run.start, run.count, false);
        let again = layer.alloc_near(Some(run.start), 8, false).unwrap();
        assert_eq!(again.start, run.start);
    }

    #[test]
    fn inode_blocks_come_from_one_run() {
        let layer = test_layer(1024);
        let a = layer.alloc_inode_block().unwrap();
        let b = layer.alloc_inode_block().unwrap();
        let c = layer.alloc_inode_block().unwrap();
        assert_eq!(b.0, a.0 + 1);
        assert_eq!(c.0, b.0 + 1);
    }

    #[test]
    fn drain_pools_restores_global() {
        let layer = test_layer(1024);
        layer.alloc_exact(10, true).unwrap();
        layer.alloc_inode_block().unwrap();
        layer.release_inode_run();
        layer.drain_pools();
        // Everything except the 10 + 1 live blocks is global again.
        assert_eq!(layer.pooled_blocks(), 0);
        assert_eq!(layer.galloc.free_blocks(), 1024 - 11);
    }
}
