//! Layer ("fs") state.
//!
//! A layer is a named view of the filesystem: its own inodes layered over
//! a parent's. Layers form a tree through upward `Arc` parent pointers;
//! a layer with children is snapshotted and immutable. Inodes live in a
//! fixed-size per-layer hash and are only freed at layer teardown, which
//! keeps parent-chain lookups stable without reference counting.

use crate::alloc::GlobalAlloc;
use crate::inode::Inode;
use crate::page::PageCache;
use lcfs_block::BlockDevice;
use lcfs_extent::{Extent, ExtentMap};
use lcfs_types::{BlockNumber, Ino, LayerIndex, LC_ICACHE_SIZE};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Process-wide counters. Atomic; they never need a lock.
#[derive(Debug, Default)]
pub struct Counters {
    /// Last issued inode number.
    pub next_inode: AtomicU64,
    /// Live inode count. A hint for statfs and the superblock; not a
    /// consistency witness.
    pub inodes: AtomicU64,
    /// Copy-ups performed since mount.
    pub clones: AtomicU64,
    /// File writes since mount.
    pub writes: AtomicU64,
}

impl Counters {
    pub fn alloc_ino(&self) -> Ino {
        Ino(self.next_inode.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

/// Per-layer allocation pools, refilled from the global free map in slabs.
#[derive(Debug, Default)]
pub struct Pools {
    pub meta: ExtentMap,
    pub data: ExtentMap,
    /// Contiguous run reserved for inode blocks, so consecutive dirty
    /// inodes land on consecutive device blocks.
    pub inode_run: Option<Extent>,
}

/// The layer's inode-block index chain: which device blocks hold this
/// layer's inodes, and which blocks hold the index itself.
#[derive(Debug)]
pub struct InodeChain {
    /// Persisted head of the index chain.
    pub head: BlockNumber,
    /// Inode-block pointers, in chain order.
    pub blocks: Vec<u64>,
    /// Blocks occupied by the index chain itself.
    pub index_blocks: Vec<BlockNumber>,
    /// Set when `blocks` changed since the chain was last written.
    pub dirty: bool,
}

impl Default for InodeChain {
    fn default() -> Self {
        Self {
            head: BlockNumber::INVALID,
            blocks: Vec::new(),
            index_blocks: Vec::new(),
            dirty: false,
        }
    }
}

pub struct Layer {
    pub index: LayerIndex,
    pub root: Ino,
    pub parent: Option<Arc<Layer>>,

    pub(crate) dev: Arc<dyn BlockDevice>,
    pub(crate) counters: Arc<Counters>,
    pub(crate) galloc: Arc<GlobalAlloc>,

    /// Fixed-size inode hash; bucket index is `ino % LC_ICACHE_SIZE`.
    pub(crate) icache: Vec<Mutex<Vec<Arc<Inode>>>>,
    /// Serializes parent-chain traversal during copy-up.
    pub(crate) ilock: Mutex<()>,

    pub(crate) pools: Mutex<Pools>,
    pub(crate) chain: Mutex<InodeChain>,
    /// General metadata/data page staging.
    pub(crate) pages: PageCache,
    /// Inode-block page staging, clustered separately so inode writes
    /// stay adjacent.
    pub(crate) ipages: PageCache,

    snap: AtomicBool,
    frozen: AtomicBool,
    children: AtomicU32,
    pub(crate) icount: AtomicU64,
    pub(crate) iwrite: AtomicU64,
    pub(crate) root_inode: OnceLock<Arc<Inode>>,
}

impl Layer {
    pub(crate) fn new(
        index: LayerIndex,
        root: Ino,
        parent: Option<Arc<Layer>>,
        dev: Arc<dyn BlockDevice>,
        counters: Arc<Counters>,
        galloc: Arc<GlobalAlloc>,
        snap: bool,
    ) -> Arc<Self> {
        let mut icache = Vec::with_capacity(LC_ICACHE_SIZE);
        icache.resize_with(LC_ICACHE_SIZE, || Mutex::new(Vec::new()));
        Arc::new(Self {
            index,
            root,
            parent,
            dev,
            counters,
            galloc,
            icache,
            ilock: Mutex::new(()),
            pools: Mutex::new(Pools::default()),
            chain: Mutex::new(InodeChain::default()),
            pages: PageCache::new(),
            ipages: PageCache::new(),
            snap: AtomicBool::new(snap),
            frozen: AtomicBool::new(snap),
            children: AtomicU32::new(0),
            icount: AtomicU64::new(0),
            iwrite: AtomicU64::new(0),
            root_inode: OnceLock::new(),
        })
    }

    /// Snapshotted layers are observed as frozen: no writes may mutate
    /// their inodes.
    #[must_use]
    pub fn is_snap(&self) -> bool {
        self.snap.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Transition to immutable. Callers flush dirty state first so no
    /// writer can hold an inode lock across the transition.
    pub(crate) fn freeze(&self) {
        self.snap.store(true, Ordering::Release);
        self.frozen.store(true, Ordering::Release);
    }

    pub(crate) fn add_child(&self) {
        self.children.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn drop_child(&self) {
        self.children.fetch_sub(1, Ordering::SeqCst);
    }

    #[must_use]
    pub fn child_count(&self) -> u32 {
        self.children.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn in_memory_inodes(&self) -> u64 {
        self.icount.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn inodes_written(&self) -> u64 {
        self.iwrite.load(Ordering::Relaxed)
    }

    /// Blocks currently parked in this layer's pools.
    #[must_use]
    pub fn pooled_blocks(&self) -> u64 {
        let pools = self.pools.lock();
        pools.meta.total_blocks()
            + pools.data.total_blocks()
            + pools.inode_run.map_or(0, |run| run.count)
    }
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layer")
            .field("index", &self.index)
            .field("root", &self.root)
            .field("parent", &self.parent.as_ref().map(|p| p.index))
            .field("snap", &self.is_snap())
            .finish_non_exhaustive()
    }
}

/// Point-in-time statistics for one layer, surfaced by the stat-layer
/// control operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerStats {
    pub index: LayerIndex,
    pub root: Ino,
    pub parent: Option<LayerIndex>,
    pub snap: bool,
    pub in_memory_inodes: u64,
    pub inodes_written: u64,
    pub pooled_blocks: u64,
}

impl Layer {
    #[must_use]
    pub fn stats(&self) -> LayerStats {
        LayerStats {
            index: self.index,
            root: self.root,
            parent: self.parent.as_ref().map(|p| p.index),
            snap: self.is_snap(),
            in_memory_inodes: self.in_memory_inodes(),
            inodes_written: self.inodes_written(),
            pooled_blocks: self.pooled_blocks(),
        }
    }
}
