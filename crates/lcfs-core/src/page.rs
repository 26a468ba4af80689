//! Per-layer page cache.
//!
//! Dirty metadata and data pages are staged here and emitted to the
//! device as clusters of block-adjacent writes. The cluster is an
//! explicit state machine: it stays empty, accumulates while each staged
//! page is the immediate successor of the previous one, and is emitted
//! when adjacency breaks or the cluster reaches `LC_CLUSTER_SIZE` pages.
//!
//! The cache also keeps recently-read metadata blocks. Staged writes go
//! through the read cache, so a read after a stage always sees the staged
//! bytes. There is no eviction policy; callers clear the cache at the end
//! of each sync, which bounds memory by work-in-progress.

use lcfs_block::BlockDevice;
use lcfs_error::Result;
use lcfs_types::{BlockNumber, LC_CLUSTER_SIZE};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

#[derive(Debug)]
enum ClusterState {
    Empty,
    Accumulating { last: BlockNumber },
}

#[derive(Debug)]
struct Cluster {
    state: ClusterState,
    first: BlockNumber,
    bufs: Vec<Vec<u8>>,
}

impl Cluster {
    fn new() -> Self {
        Self {
            state: ClusterState::Empty,
            first: BlockNumber::INVALID,
            bufs: Vec::new(),
        }
    }

    /// Detach the pending cluster for emission.
    fn take(&mut self) -> Option<(BlockNumber, Vec<Vec<u8>>)> {
        match self.state {
            ClusterState::Empty => None,
            ClusterState::Accumulating { .. } => {
                self.state = ClusterState::Empty;
                let first = self.first;
                self.first = BlockNumber::INVALID;
                Some((first, std::mem::take(&mut self.bufs)))
            }
        }
    }
}

#[derive(Debug)]
pub struct PageCache {
    cluster: Mutex<Cluster>,
    meta: Mutex<HashMap<u64, Arc<Vec<u8>>>>,
}

impl Default for PageCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PageCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cluster: Mutex::new(Cluster::new()),
            meta: Mutex::new(HashMap::new()),
        }
    }

    /// Stage a dirty page. Emits the pending cluster first when `block`
    /// is not the immediate successor of the previously staged page, and
    /// emits the grown cluster when it reaches the cap.
    pub fn stage(&self, dev: &dyn BlockDevice, block: BlockNumber, data: Vec<u8>) -> Result<()> {
        self.meta
            .lock()
            .insert(block.0, Arc::new(data.clone()));

        let mut to_emit = Vec::new();
        {
            let mut cluster = self.cluster.lock();
            if let ClusterState::Accumulating { last } = cluster.state {
                if last.checked_add(1) != Some(block) {
                    if let Some(pending) = cluster.take() {
                        to_emit.push(pending);
                    }
                }
            }
            match cluster.state {
                ClusterState::Empty => {
                    cluster.first = block;
                    cluster.bufs.push(data);
                    cluster.state = ClusterState::Accumulating { last: block };
                }
                ClusterState::Accumulating { .. } => {
                    cluster.bufs.push(data);
                    cluster.state = ClusterState::Accumulating { last: block };
                }
            }
            if cluster.bufs.len() >= LC_CLUSTER_SIZE {
                if let Some(pending) = cluster.take() {
                    to_emit.push(pending);
                }
            }
        }
        for (first, bufs) in to_emit {
            trace!(first = first.0, count = bufs.len(), "emit cluster");
            dev.write_cluster(first, &bufs)?;
        }
        Ok(())
    }

    /// Emit whatever is pending.
    pub fn flush(&self, dev: &dyn BlockDevice) -> Result<()> {
        let pending = self.cluster.lock().take();
        if let Some((first, bufs)) = pending {
            trace!(first = first.0, count = bufs.len(), "flush cluster");
            dev.write_cluster(first, &bufs)?;
        }
        Ok(())
    }

    /// Read a metadata block through the cache.
    pub fn read_meta(&self, dev: &dyn BlockDevice, block: BlockNumber) -> Result<Arc<Vec<u8>>> {
        if let Some(data) = self.meta.lock().get(&block.0) {
            return Ok(Arc::clone(data));
        }
        let data = Arc::new(dev.read_block(block)?);
        self.meta.lock().insert(block.0, Arc::clone(&data));
        Ok(data)
    }

    /// Drop cached reads. Called at the end of a sync.
    pub fn clear_meta(&self) {
        self.meta.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lcfs_block::MemBlockDevice;
    use lcfs_types::LC_BLOCK_SIZE;

    fn block_of(byte: u8) -> Vec<u8> {
        vec![byte; LC_BLOCK_SIZE as usize]
    }

    #[test]
    fn adjacent_pages_accumulate_until_flush() {
        let dev = MemBlockDevice::new(64);
        let cache = PageCache::new();
        cache.stage(&dev, BlockNumber(10), block_of(1)).unwrap();
        cache.stage(&dev, BlockNumber(11), block_of(2)).unwrap();
        // Nothing hits the device until the cluster is emitted.
        assert_eq!(dev.read_block(BlockNumber(10)).unwrap(), block_of(0));
        cache.flush(&dev).unwrap();
        assert_eq!(dev.read_block(BlockNumber(10)).unwrap(), block_of(1));
        assert_eq!(dev.read_block(BlockNumber(11)).unwrap(), block_of(2));
    }

    #[test]
    fn adjacency_break_emits_previous_cluster() {
        let dev = MemBlockDevice::new(64);
        let cache = PageCache::new();
        cache.stage(&dev, BlockNumber(10), block_of(1)).unwrap();
        cache.stage(&dev, BlockNumber(20), block_of(2)).unwrap();
        // The first cluster (block 10) was emitted by the break.
        assert_eq!(dev.read_block(BlockNumber(10)).unwrap(), block_of(1));
        assert_eq!(dev.read_block(BlockNumber(20)).unwrap(), block_of(0));
        cache.flush(&dev).unwrap();
        assert_eq!(dev.read_block(BlockNumber(20)).unwrap(), block_of(2));
    }

    #[test]
    fn cap_emits_cluster() {
        let dev = MemBlockDevice::new(1024);
        let cache = PageCache::new();
        for i in 0..LC_CLUSTER_SIZE as u64 {
            cache.stage(&dev, BlockNumber(i), block_of(7)).unwrap();
        }
        // The cap forced emission without an explicit flush.
        assert_eq!(dev.read_block(BlockNumber(0)).unwrap(), block_of(7));
        assert_eq!(
            dev.read_block(BlockNumber(LC_CLUSTER_SIZE as u64 - 1)).unwrap(),
            block_of(7)
        );
    }

    #[test]
    fn read_meta_sees_staged_writes() {
        let dev = MemBlockDevice::new(64);
        let cache = PageCache::new();
        cache.stage(&dev, BlockNumber(5), block_of(9)).unwrap();
        // Not flushed yet, but the cache must serve the staged bytes.
        assert_eq!(*cache.read_meta(&dev, BlockNumber(5)).unwrap(), block_of(9));
        cache.flush(&dev).unwrap();
        cache.clear_meta();
        assert_eq!(*cache.read_meta(&dev, BlockNumber(5)).unwrap(), block_of(9));
    }
}
