//! The layered inode cache and copy-up engine.
//!
//! Each layer keeps its own fixed-size inode hash. Lookups that miss walk
//! up the parent chain; modifications clone the parent's inode into the
//! requesting layer first (copy-up), sharing bodies until the first
//! mutation. Inodes are never freed while their layer is mounted, so
//! parent-chain references stay valid without reference counting.

use crate::bmap::{Bmap, RegMap};
use crate::dir::DirBody;
use crate::layer::Layer;
use crate::ondisk::{
    self, ChainBlock, DiskInode, IndexBlock, LC_BMAP_PER_BLOCK, LC_CHAIN_HEADER, LC_DINODE_SIZE,
    LC_IBLOCK_MAX, LC_INLINE_MAX,
};
use crate::xattr::XattrList;
use lcfs_error::{LcError, Result};
use lcfs_extent::ExtentMap;
use lcfs_types::{
    is_dir, is_reg, is_symlink, BlockNumber, FileKind, Ino, LayerIndex, LC_BLOCK_SIZE,
    LC_ICACHE_SIZE, LC_INVALID_BLOCK,
};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, warn};

// ── Timestamps and stat ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSpec {
    pub sec: i64,
    pub nsec: u32,
}

impl TimeSpec {
    pub const ZERO: Self = Self { sec: 0, nsec: 0 };

    #[must_use]
    pub fn now() -> Self {
        match SystemTime::now().duration_since(SystemTime::UNIX_EPOCH) {
            Ok(d) => Self {
                sec: d.as_secs() as i64,
                nsec: d.subsec_nanos(),
            },
            Err(_) => Self::ZERO,
        }
    }

    #[must_use]
    pub fn to_system_time(self) -> SystemTime {
        if self.sec >= 0 {
            SystemTime::UNIX_EPOCH + std::time::Duration::new(self.sec as u64, self.nsec)
        } else {
            SystemTime::UNIX_EPOCH
        }
    }
}

impl From<SystemTime> for TimeSpec {
    fn from(t: SystemTime) -> Self {
        match t.duration_since(SystemTime::UNIX_EPOCH) {
            Ok(d) => Self {
                sec: d.as_secs() as i64,
                nsec: d.subsec_nanos(),
            },
            Err(_) => Self::ZERO,
        }
    }
}

/// Standard inode metadata.
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub size: u64,
    pub blocks: u64,
    pub atime: TimeSpec,
    pub mtime: TimeSpec,
    pub ctime: TimeSpec,
}

impl Stat {
    #[must_use]
    pub fn kind(&self) -> FileKind {
        FileKind::from_mode(self.mode)
    }

    /// Selectively touch timestamps.
    pub fn update_times(&mut self, atime: bool, mtime: bool, ctime: bool) {
        let now = TimeSpec::now();
        if atime {
            self.atime = now;
        }
        if mtime {
            self.mtime = now;
        }
        if ctime {
            self.ctime = now;
        }
    }
}

// ── Inode body ──────────────────────────────────────────────────────────────

/// Kind-specific inode body. Directory entries, sparse block maps, and
/// symlink targets are `Arc`-shared with clones; `Arc::make_mut` gives
/// idempotent materialization on first mutation.
#[derive(Debug, Clone)]
pub enum Body {
    Regular(RegMap),
    Directory(Arc<DirBody>),
    Symlink(Arc<str>),
    Special,
}

impl Body {
    pub fn as_dir(&self) -> Result<&Arc<DirBody>> {
        match self {
            Self::Directory(dir) => Ok(dir),
            _ => Err(LcError::NotDirectory),
        }
    }

    /// Mutable directory access, copying a shared body first.
    pub fn dir_mut(&mut self) -> Result<&mut DirBody> {
        match self {
            Self::Directory(dir) => Ok(Arc::make_mut(dir)),
            _ => Err(LcError::NotDirectory),
        }
    }

    pub fn as_reg(&self) -> Result<&RegMap> {
        match self {
            Self::Regular(map) => Ok(map),
            Self::Directory(_) => Err(LcError::IsDirectory),
            _ => Err(LcError::Invalid("not a regular file".to_owned())),
        }
    }

    pub fn as_reg_mut(&mut self) -> Result<&mut RegMap> {
        match self {
            Self::Regular(map) => Ok(map),
            Self::Directory(_) => Err(LcError::IsDirectory),
            _ => Err(LcError::Invalid("not a regular file".to_owned())),
        }
    }
}

// ── Inode ───────────────────────────────────────────────────────────────────

/// Mutable inode state, guarded by the inode's read/write lock.
#[derive(Debug)]
pub struct InodeState {
    pub stat: Stat,
    /// Containing directory.
    pub parent: Ino,
    pub body: Body,
    pub xattrs: Arc<XattrList>,

    /// Body is borrowed from a parent layer; chain blocks and data blocks
    /// it references belong to that layer.
    pub shared: bool,
    /// Unlinked in this layer. Authoritative over parent-chain lookups.
    pub removed: bool,
    /// The dinode must be rewritten.
    pub dirty: bool,
    pub bmapdirty: bool,
    pub dirdirty: bool,
    pub xattrdirty: bool,

    /// On-disk inode block, `INVALID` until first flushed.
    pub disk_block: BlockNumber,
    /// Overflow chain head for the directory or sparse-map body.
    pub bmap_dir_block: BlockNumber,
    pub bmap_dir_extents: ExtentMap,
    pub xattr_block: BlockNumber,
    pub xattr_extents: ExtentMap,

    /// Physical data ranges allocated by this inode in this layer. Only
    /// these may be freed when mappings are superseded; everything else
    /// belongs to an ancestor.
    pub owned: ExtentMap,
    /// Dirty file pages by logical block, not yet allocated or written.
    pub dpages: BTreeMap<u64, Vec<u8>>,
}

impl InodeState {
    #[must_use]
    pub fn dirty_any(&self) -> bool {
        self.dirty || self.bmapdirty || self.dirdirty || self.xattrdirty || !self.dpages.is_empty()
    }
}

pub struct Inode {
    pub num: Ino,
    /// Index of the owning layer, so a request handle can tell whether
    /// its cached inode already lives in the target layer.
    pub layer: LayerIndex,
    state: RwLock<InodeState>,
}

impl Inode {
    pub(crate) fn new(num: Ino, layer: LayerIndex, state: InodeState) -> Self {
        Self {
            num,
            layer,
            state: RwLock::new(state),
        }
    }

    /// Shared lock on the inode state. For frozen layers this is always
    /// uncontended: frozen means no writers exist.
    pub fn read(&self) -> RwLockReadGuard<'_, InodeState> {
        self.state.read()
    }

    /// Exclusive lock on the inode state.
    pub fn write(&self) -> RwLockWriteGuard<'_, InodeState> {
        self.state.write()
    }
}

impl std::fmt::Debug for Inode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inode").field("num", &self.num).finish()
    }
}

fn new_state(stat: Stat, parent: Ino, body: Body) -> InodeState {
    InodeState {
        stat,
        parent,
        body,
        xattrs: Arc::new(XattrList::new()),
        shared: false,
        removed: false,
        dirty: false,
        bmapdirty: false,
        dirdirty: false,
        xattrdirty: false,
        disk_block: BlockNumber::INVALID,
        bmap_dir_block: BlockNumber::INVALID,
        bmap_dir_extents: ExtentMap::new(),
        xattr_block: BlockNumber::INVALID,
        xattr_extents: ExtentMap::new(),
        owned: ExtentMap::new(),
        dpages: BTreeMap::new(),
    }
}

/// Lock/copy mode for `Layer::get`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetMode {
    /// Read access; a parent layer's inode may be returned directly.
    Read,
    /// Write access to an inode already present in this layer.
    Write,
    /// Write access; clone from the parent chain if needed.
    Copy,
}

// ── Hash and lookup ─────────────────────────────────────────────────────────

fn bucket_of(ino: Ino) -> usize {
    ino.0 as usize % LC_ICACHE_SIZE
}

impl Layer {
    /// O(bucket) search of this layer's hash. The layer root takes a
    /// direct-pointer fast path.
    #[must_use]
    pub fn lookup_cached(&self, ino: Ino) -> Option<Arc<Inode>> {
        if ino == self.root {
            if let Some(root) = self.root_inode.get() {
                return Some(Arc::clone(root));
            }
        }
        let bucket = self.icache[bucket_of(ino)].lock();
        bucket.iter().find(|i| i.num == ino).cloned()
    }

    pub(crate) fn add_inode(&self, inode: Arc<Inode>) {
        let bucket = &mut self.icache[bucket_of(inode.num)].lock();
        debug_assert!(bucket.iter().all(|i| i.num != inode.num));
        bucket.push(inode);
        self.icount.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the inode locked view for the requested access.
    ///
    /// `Copy` clones a parent-layer inode into this layer first; `Read`
    /// may return a parent layer's inode directly. A `removed` inode is
    /// authoritative: the lookup fails without falling through to the
    /// parent chain.
    pub fn get(&self, ino: Ino, mode: GetMode) -> Result<Arc<Inode>> {
        if mode != GetMode::Read && self.is_snap() {
            return Err(LcError::ReadOnly);
        }
        if let Some(inode) = self.lookup_cached(ino) {
            if inode.read().removed {
                return Err(LcError::not_found(format!("inode {ino}")));
            }
            return Ok(inode);
        }
        if self.parent.is_none() {
            return Err(LcError::not_found(format!("inode {ino}")));
        }
        self.get_from_parent(ino, mode == GetMode::Copy)
    }

    /// Parent-chain lookup, serialized per layer so two racing copy-ups
    /// cannot both clone the same inode.
    fn get_from_parent(&self, ino: Ino, copy: bool) -> Result<Arc<Inode>> {
        let _chain = self.ilock.lock();
        // Re-check under the lock: a racing copy-up may have won.
        if let Some(inode) = self.lookup_cached(ino) {
            if inode.read().removed {
                return Err(LcError::not_found(format!("inode {ino}")));
            }
            return Ok(inode);
        }
        let mut next = self.parent.as_ref();
        while let Some(layer) = next {
            if let Some(found) = layer.lookup_cached(ino) {
                // Removed in an intermediate layer hides the inode.
                if found.read().removed {
                    return Err(LcError::not_found(format!("inode {ino}")));
                }
                if copy {
                    return Ok(self.clone_inode(&found, layer.root));
                }
                return Ok(found);
            }
            next = layer.parent.as_ref();
        }
        Err(LcError::not_found(format!("inode {ino}")))
    }

    /// Copy-up: materialize a parent-layer inode into this layer.
    ///
    /// Stat fields are copied; bodies are shared by reference until first
    /// mutation. A contiguous file keeps the parent's extent (copy-on-
    /// write at the data level, since this inode owns none of it).
    fn clone_inode(&self, parent: &Arc<Inode>, parent_root: Ino) -> Arc<Inode> {
        let src = parent.read();
        let mut state = new_state(
            src.stat,
            if src.parent == parent_root {
                self.root
            } else {
                src.parent
            },
            Body::Special,
        );
        match &src.body {
            Body::Regular(RegMap::Extent { start, len }) => {
                state.body = Body::Regular(RegMap::Extent {
                    start: *start,
                    len: *len,
                });
            }
            Body::Regular(RegMap::Sparse(map)) => {
                state.body = Body::Regular(RegMap::Sparse(Arc::clone(map)));
                state.shared = true;
                state.bmapdirty = true;
            }
            Body::Regular(RegMap::Empty) => {
                state.body = Body::Regular(RegMap::Empty);
            }
            Body::Directory(dir) => {
                state.body = Body::Directory(Arc::clone(dir));
                state.shared = true;
                state.dirdirty = true;
            }
            Body::Symlink(target) => {
                state.body = Body::Symlink(Arc::clone(target));
                state.shared = true;
            }
            Body::Special => {}
        }
        state.xattrs = Arc::clone(&src.xattrs);
        if !state.xattrs.is_empty() {
            state.xattrdirty = true;
        }
        state.dirty = true;
        let num = parent.num;
        drop(src);

        let inode = Arc::new(Inode::new(num, self.index, state));
        self.add_inode(Arc::clone(&inode));
        self.counters.clones.fetch_add(1, Ordering::Relaxed);
        self.counters.inodes.fetch_add(1, Ordering::Relaxed);
        debug!(layer = self.index.0, ino = num.0, "copy-up");
        inode
    }

    /// Create a brand-new inode in this layer.
    pub fn alloc_inode(
        &self,
        mode: u32,
        uid: u32,
        gid: u32,
        rdev: u32,
        parent: Ino,
        target: Option<&str>,
    ) -> Result<Arc<Inode>> {
        if self.is_snap() {
            return Err(LcError::ReadOnly);
        }
        let ino = self.counters.alloc_ino();
        let body = if is_dir(mode) {
            Body::Directory(Arc::new(DirBody::new()))
        } else if is_symlink(mode) {
            Body::Symlink(Arc::from(target.unwrap_or("")))
        } else if is_reg(mode) {
            Body::Regular(RegMap::Empty)
        } else {
            Body::Special
        };
        let size = target.map_or(0, str::len) as u64;
        let now = TimeSpec::now();
        let stat = Stat {
            mode,
            nlink: if is_dir(mode) { 2 } else { 1 },
            uid,
            gid,
            rdev,
            size,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
        };
        let mut state = new_state(stat, parent, body);
        state.dirty = true;
        let inode = Arc::new(Inode::new(ino, self.index, state));
        self.add_inode(Arc::clone(&inode));
        self.counters.inodes.fetch_add(1, Ordering::Relaxed);
        Ok(inode)
    }

    /// Initialize this layer's root directory inode (fresh layers only).
    pub(crate) fn root_init(&self) {
        let now = TimeSpec::now();
        let stat = Stat {
            mode: lcfs_types::S_IFDIR | 0o755,
            nlink: 2,
            uid: 0,
            gid: 0,
            rdev: 0,
            size: 0,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
        };
        let mut state = new_state(stat, self.root, Body::Directory(Arc::new(DirBody::new())));
        state.dirty = true;
        let inode = Arc::new(Inode::new(self.root, self.index, state));
        self.add_inode(Arc::clone(&inode));
        self.counters.inodes.fetch_add(1, Ordering::Relaxed);
        let _ = self.root_inode.set(inode);
    }

    /// Root for a child layer: a clone of the parent layer's root under a
    /// new inode number.
    pub(crate) fn root_init_from_parent(&self) -> Result<()> {
        let parent = self
            .parent
            .as_ref()
            .ok_or_else(|| LcError::Invalid("layer has no parent".to_owned()))?;
        let parent_root = parent
            .lookup_cached(parent.root)
            .ok_or_else(|| LcError::not_found("parent layer root inode"))?;
        let src = parent_root.read();
        let mut state = new_state(src.stat, self.root, Body::Special);
        if let Body::Directory(dir) = &src.body {
            state.body = Body::Directory(Arc::clone(dir));
            state.shared = true;
            state.dirdirty = true;
        } else {
            return Err(LcError::NotDirectory);
        }
        state.xattrs = Arc::clone(&src.xattrs);
        if !state.xattrs.is_empty() {
            state.xattrdirty = true;
        }
        state.dirty = true;
        drop(src);
        let inode = Arc::new(Inode::new(self.root, self.index, state));
        self.add_inode(Arc::clone(&inode));
        self.counters.inodes.fetch_add(1, Ordering::Relaxed);
        self.counters.clones.fetch_add(1, Ordering::Relaxed);
        let _ = self.root_inode.set(inode);
        Ok(())
    }

    /// All inodes currently hashed in this layer.
    pub(crate) fn all_inodes(&self) -> Vec<Arc<Inode>> {
        let mut out = Vec::new();
        for bucket in &self.icache {
            out.extend(bucket.lock().iter().cloned());
        }
        out
    }
}

// ── File data flush ─────────────────────────────────────────────────────────

impl Layer {
    /// Write out dirty file pages: allocate physical blocks preferring
    /// adjacency, stage the data through the page cache, and fold the new
    /// mappings into the block map. Superseded blocks owned by this inode
    /// go back to the layer pool; blocks inherited from a parent are left
    /// intact.
    pub(crate) fn flush_dpages(&self, st: &mut InodeState) -> Result<()> {
        if st.dpages.is_empty() {
            return Ok(());
        }
        let dpages = std::mem::take(&mut st.dpages);
        let mut run: Vec<(u64, Vec<u8>)> = Vec::new();
        for (logical, data) in dpages {
            let breaks = run.last().is_some_and(|(last, _)| logical != last + 1);
            if breaks {
                self.flush_run(st, &run)?;
                run.clear();
            }
            run.push((logical, data));
        }
        if !run.is_empty() {
            self.flush_run(st, &run)?;
        }
        st.stat.blocks = st.body.as_reg()?.mapped_blocks();
        st.dirty = true;
        Ok(())
    }

    /// Allocate and write one run of logically consecutive dirty pages.
    fn flush_run(&self, st: &mut InodeState, run: &[(u64, Vec<u8>)]) -> Result<()> {
        let mut idx = 0;
        while idx < run.len() {
            let logical = run[idx].0;
            let remaining = (run.len() - idx) as u64;
            let hint = self.adjacency_hint(st, logical);
            let got = self.alloc_near(hint, remaining, false)?;
            for (i, (_, data)) in run[idx..idx + got.count as usize].iter().enumerate() {
                self.pages
                    .stage(&*self.dev, BlockNumber(got.start.0 + i as u64), data.clone())?;
            }
            self.apply_mapping(st, logical, got.start, got.count)?;
            st.owned.insert(got.start, got.count);
            idx += got.count as usize;
        }
        Ok(())
    }

    fn adjacency_hint(&self, st: &InodeState, logical: u64) -> Option<BlockNumber> {
        if logical == 0 {
            return None;
        }
        let map = st.body.as_reg().ok()?;
        let slices = map.resolve(logical - 1, 1);
        slices
            .first()
            .and_then(|s| s.physical)
            .and_then(|p| p.checked_add(1))
    }

    /// Fold a freshly written physical run into the file's map, keeping
    /// the compact contiguous form as long as writes stay sequential.
    fn apply_mapping(
        &self,
        st: &mut InodeState,
        logical: u64,
        physical: BlockNumber,
        count: u64,
    ) -> Result<()> {
        let map = st.body.as_reg_mut()?;
        match map {
            RegMap::Empty if logical == 0 => {
                *map = RegMap::Extent {
                    start: physical,
                    len: count,
                };
                return Ok(());
            }
            RegMap::Extent { start, len } if logical == *len && physical.0 == start.0 + *len => {
                *len += count;
                return Ok(());
            }
            RegMap::Empty => {
                *map = RegMap::Sparse(Arc::new(Bmap::new()));
            }
            RegMap::Extent { start, len } => {
                // First non-appending write: contiguity breaks, move to
                // the sparse form.
                let (start, len) = (*start, *len);
                *map = RegMap::Sparse(Arc::new(Bmap::from_extent(start, len)));
            }
            RegMap::Sparse(_) => {}
        }
        let RegMap::Sparse(shared_map) = map else {
            unreachable!()
        };
        let displaced = Arc::make_mut(shared_map).map(logical, physical, count);
        st.shared = false;
        st.bmapdirty = true;
        for (block, blocks) in displaced {
            for freed in st.owned.remove_range(block, blocks) {
                self.free_local(freed.start, freed.count, false);
            }
        }
        Ok(())
    }

    /// Shrink or drop a file's blocks past `size` bytes.
    pub(crate) fn truncate_file(&self, st: &mut InodeState, size: u64) -> Result<()> {
        let old_size = st.stat.size;
        let keep_blocks = lcfs_types::blocks_for(size);
        st.dpages.retain(|logical, _| *logical < keep_blocks);
        let map = st.body.as_reg_mut()?;
        let removed: Vec<(BlockNumber, u64)> = match map {
            RegMap::Empty => Vec::new(),
            RegMap::Extent { start, len } => {
                let (start, len) = (*start, *len);
                if keep_blocks >= len {
                    Vec::new()
                } else {
                    let tail = (BlockNumber(start.0 + keep_blocks), len - keep_blocks);
                    *map = if keep_blocks == 0 {
                        RegMap::Empty
                    } else {
                        RegMap::Extent {
                            start,
                            len: keep_blocks,
                        }
                    };
                    vec![tail]
                }
            }
            RegMap::Sparse(shared_map) => {
                let removed = Arc::make_mut(shared_map).truncate(keep_blocks);
                st.shared = false;
                removed
            }
        };
        for (block, blocks) in removed {
            for freed in st.owned.remove_range(block, blocks) {
                self.free_local(freed.start, freed.count, false);
            }
        }
        // A shrink to a mid-block size must zero the retained page's
        // tail, or growing the file back exposes the old bytes instead
        // of a hole.
        let bs = u64::from(LC_BLOCK_SIZE);
        if size < old_size && size % bs != 0 {
            let logical = size / bs;
            let zero_from = (size % bs) as usize;
            if let Some(page) = st.dpages.get_mut(&logical) {
                page[zero_from..].fill(0);
            } else {
                let resolved = st.body.as_reg()?.resolve(logical, 1);
                if let Some(physical) = resolved.first().and_then(|s| s.physical) {
                    let mut page = self.dev.read_block(physical)?;
                    page[zero_from..].fill(0);
                    st.dpages.insert(logical, page);
                }
                // An unmapped page already reads as zeroes.
            }
        }
        st.stat.size = size;
        st.stat.blocks = st.body.as_reg()?.mapped_blocks();
        st.bmapdirty = true;
        st.dirty = true;
        Ok(())
    }
}

// ── Overflow chains ─────────────────────────────────────────────────────────

const CHAIN_PAYLOAD_MAX: usize = LC_BLOCK_SIZE as usize - LC_CHAIN_HEADER;

impl Layer {
    /// Write a list of `(payload, record_count)` chunks as a chained set
    /// of metadata blocks, staged through the page cache. Returns the
    /// chain head and the blocks used.
    fn write_chain(&self, chunks: Vec<(Vec<u8>, u32)>) -> Result<(BlockNumber, ExtentMap)> {
        if chunks.is_empty() {
            return Ok((BlockNumber::INVALID, ExtentMap::new()));
        }
        let mut blocks = Vec::with_capacity(chunks.len());
        let mut need = chunks.len() as u64;
        let mut hint = None;
        while need > 0 {
            let got = self.alloc_near(hint, need, true)?;
            for i in 0..got.count {
                blocks.push(BlockNumber(got.start.0 + i));
            }
            hint = Some(BlockNumber(got.end()));
            need -= got.count;
        }
        let mut extents = ExtentMap::new();
        for (i, ((payload, count), block)) in chunks.into_iter().zip(&blocks).enumerate() {
            let next = blocks.get(i + 1).map_or(LC_INVALID_BLOCK, |b| b.0);
            let data = ChainBlock::new(next, count, payload).encode();
            self.pages.stage(&*self.dev, *block, data)?;
            extents.insert(*block, 1);
        }
        Ok((blocks[0], extents))
    }

    /// Read a chain into `(block, ChainBlock)` pairs.
    fn read_chain(&self, head: BlockNumber) -> Result<Vec<(BlockNumber, ChainBlock)>> {
        let mut out = Vec::new();
        let mut block = head;
        let limit = self.dev.block_count();
        while block.is_valid() {
            if out.len() as u64 > limit {
                return Err(LcError::Corruption {
                    block: head.0,
                    detail: "metadata chain cycle".to_owned(),
                });
            }
            let data = self.pages.read_meta(&*self.dev, block)?;
            let cb = ChainBlock::decode(block, &data)?;
            let next = cb.next;
            out.push((block, cb));
            block = BlockNumber(next);
        }
        Ok(out)
    }

    fn free_chain_extents(&self, extents: &mut ExtentMap) {
        for e in extents.drain() {
            self.free_local(e.start, e.count, true);
        }
    }
}

// ── Inode flush and sync ────────────────────────────────────────────────────

/// Greedy-pack directory records into chain-block payloads.
fn chunk_dir_records(records: &[(Ino, u8, Vec<u8>)]) -> Vec<(Vec<u8>, u32)> {
    let mut chunks = Vec::new();
    let mut current: Vec<(Ino, u8, Vec<u8>)> = Vec::new();
    let mut size = 0_usize;
    for rec in records {
        let rec_size = ondisk::dir_record_size(rec.2.len());
        if size + rec_size > CHAIN_PAYLOAD_MAX && !current.is_empty() {
            chunks.push((
                ondisk::encode_dir_records(&current),
                current.len() as u32,
            ));
            current.clear();
            size = 0;
        }
        size += rec_size;
        current.push(rec.clone());
    }
    if !current.is_empty() {
        chunks.push((ondisk::encode_dir_records(&current), current.len() as u32));
    }
    chunks
}

fn chunk_xattr_records(records: &[(String, Vec<u8>)]) -> Vec<(Vec<u8>, u32)> {
    let mut chunks = Vec::new();
    let mut current: Vec<(String, Vec<u8>)> = Vec::new();
    let mut size = 0_usize;
    for rec in records {
        let rec_size = ondisk::xattr_record_size(rec.0.len(), rec.1.len());
        if size + rec_size > CHAIN_PAYLOAD_MAX && !current.is_empty() {
            chunks.push((
                ondisk::encode_xattr_records(&current),
                current.len() as u32,
            ));
            current.clear();
            size = 0;
        }
        size += rec_size;
        current.push(rec.clone());
    }
    if !current.is_empty() {
        chunks.push((ondisk::encode_xattr_records(&current), current.len() as u32));
    }
    chunks
}

fn chunk_bmap_records(records: &[(u64, u64, u64)]) -> Vec<(Vec<u8>, u32)> {
    records
        .chunks(LC_BMAP_PER_BLOCK)
        .map(|chunk| (ondisk::encode_bmap_records(chunk), chunk.len() as u32))
        .collect()
}

impl Layer {
    fn flush_xattrs(&self, st: &mut InodeState) -> Result<()> {
        self.free_chain_extents(&mut st.xattr_extents);
        if st.xattrs.is_empty() {
            st.xattr_block = BlockNumber::INVALID;
        } else {
            let chunks = chunk_xattr_records(&st.xattrs.to_records());
            let (head, extents) = self.write_chain(chunks)?;
            st.xattr_block = head;
            st.xattr_extents = extents;
        }
        st.xattrdirty = false;
        st.dirty = true;
        Ok(())
    }

    fn flush_bmap(&self, st: &mut InodeState) -> Result<()> {
        self.free_chain_extents(&mut st.bmap_dir_extents);
        st.bmap_dir_block = BlockNumber::INVALID;
        if let Body::Regular(RegMap::Sparse(map)) = &st.body {
            if !map.is_empty() {
                let records: Vec<(u64, u64, u64)> = map
                    .iter()
                    .map(|e| (e.logical, e.physical.0, e.count))
                    .collect();
                let (head, extents) = self.write_chain(chunk_bmap_records(&records))?;
                st.bmap_dir_block = head;
                st.bmap_dir_extents = extents;
            }
        }
        st.bmapdirty = false;
        st.dirty = true;
        Ok(())
    }

    fn flush_dir(&self, st: &mut InodeState) -> Result<()> {
        self.free_chain_extents(&mut st.bmap_dir_extents);
        st.bmap_dir_block = BlockNumber::INVALID;
        let records = st.body.as_dir()?.to_records();
        let inline_size: usize =
            4 + records.iter().map(|r| ondisk::dir_record_size(r.2.len())).sum::<usize>();
        if inline_size > LC_INLINE_MAX {
            let (head, extents) = self.write_chain(chunk_dir_records(&records))?;
            st.bmap_dir_block = head;
            st.bmap_dir_extents = extents;
        }
        st.dirdirty = false;
        st.dirty = true;
        Ok(())
    }

    /// Inline payload written after the dinode: symlink target, or small
    /// directory entries when no overflow chain is in use.
    fn inline_payload(st: &InodeState) -> Vec<u8> {
        match &st.body {
            Body::Symlink(target) => target.as_bytes().to_vec(),
            Body::Directory(dir) if !st.bmap_dir_block.is_valid() => {
                let records = dir.to_records();
                let mut out = Vec::new();
                out.extend_from_slice(&(records.len() as u32).to_le_bytes());
                out.extend_from_slice(&ondisk::encode_dir_records(&records));
                out
            }
            _ => Vec::new(),
        }
    }

    /// Persist one inode: xattrs, then the body map or entries, then the
    /// dinode itself. A removed inode with an on-disk copy is rewritten
    /// as a mode-0 tombstone; one never written is simply dropped.
    pub(crate) fn flush_inode(&self, inode: &Arc<Inode>) -> Result<bool> {
        let st = &mut *inode.write();
        if st.removed {
            return self.flush_removed(inode.num, st);
        }
        self.flush_dpages(st)?;
        if st.xattrdirty {
            self.flush_xattrs(st)?;
        }
        if st.bmapdirty {
            self.flush_bmap(st)?;
        }
        if st.dirdirty {
            self.flush_dir(st)?;
        }
        if !st.dirty {
            return Ok(false);
        }
        if !st.disk_block.is_valid() {
            let block = self.alloc_inode_block()?;
            st.disk_block = block;
            let mut chain = self.chain.lock();
            chain.blocks.push(block.0);
            chain.dirty = true;
        }
        self.write_dinode(inode.num, st, false)?;
        st.dirty = false;
        self.iwrite.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    fn flush_removed(&self, ino: Ino, st: &mut InodeState) -> Result<bool> {
        // Give back everything this inode allocated in this layer.
        for e in st.owned.drain() {
            self.free_local(e.start, e.count, false);
        }
        self.free_chain_extents(&mut st.bmap_dir_extents);
        self.free_chain_extents(&mut st.xattr_extents);
        st.bmap_dir_block = BlockNumber::INVALID;
        st.xattr_block = BlockNumber::INVALID;
        st.dpages.clear();
        st.bmapdirty = false;
        st.dirdirty = false;
        st.xattrdirty = false;
        if !st.dirty {
            return Ok(false);
        }
        st.dirty = false;
        if !st.disk_block.is_valid() {
            // Never reached disk: nothing marks its absence.
            return Ok(false);
        }
        self.write_dinode(ino, st, true)?;
        self.iwrite.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    fn write_dinode(&self, ino: Ino, st: &InodeState, tombstone: bool) -> Result<()> {
        let (extent_block, extent_len) = match &st.body {
            Body::Regular(map) => map.dinode_extent(),
            _ => (LC_INVALID_BLOCK, 0),
        };
        let di = DiskInode {
            ino: ino.0,
            mode: if tombstone { 0 } else { st.stat.mode },
            nlink: st.stat.nlink,
            uid: st.stat.uid,
            gid: st.stat.gid,
            rdev: st.stat.rdev,
            size: st.stat.size,
            blocks: st.stat.blocks,
            atime_sec: st.stat.atime.sec,
            mtime_sec: st.stat.mtime.sec,
            ctime_sec: st.stat.ctime.sec,
            atime_nsec: st.stat.atime.nsec,
            mtime_nsec: st.stat.mtime.nsec,
            ctime_nsec: st.stat.ctime.nsec,
            parent: st.parent.0,
            extent_block,
            extent_len,
            bmap_dir_block: st.bmap_dir_block.0,
            xattr_block: st.xattr_block.0,
        };
        let mut block = vec![0_u8; LC_BLOCK_SIZE as usize];
        di.encode_into(&mut block);
        if !tombstone {
            let payload = Self::inline_payload(st);
            block[LC_DINODE_SIZE..LC_DINODE_SIZE + payload.len()].copy_from_slice(&payload);
        }
        self.ipages.stage(&*self.dev, st.disk_block, block)
    }

    /// Rewrite the inode-block index chain when inode blocks were added
    /// or reclaimed.
    fn flush_inode_chain(&self) -> Result<()> {
        let chain = &mut *self.chain.lock();
        if !chain.dirty {
            return Ok(());
        }
        for block in chain.index_blocks.drain(..) {
            self.free_local(block, 1, true);
        }
        if chain.blocks.is_empty() {
            chain.head = BlockNumber::INVALID;
            chain.dirty = false;
            return Ok(());
        }
        let groups: Vec<&[u64]> = chain.blocks.chunks(LC_IBLOCK_MAX).collect();
        let mut blocks = Vec::with_capacity(groups.len());
        let mut need = groups.len() as u64;
        let mut hint = None;
        while need > 0 {
            let got = self.alloc_near(hint, need, true)?;
            for i in 0..got.count {
                blocks.push(BlockNumber(got.start.0 + i));
            }
            hint = Some(BlockNumber(got.end()));
            need -= got.count;
        }
        for (i, (slots, block)) in groups.iter().zip(&blocks).enumerate() {
            let ib = IndexBlock {
                next: blocks.get(i + 1).map_or(LC_INVALID_BLOCK, |b| b.0),
                slots: slots.to_vec(),
            };
            self.pages.stage(&*self.dev, *block, ib.encode())?;
        }
        chain.head = blocks[0];
        chain.index_blocks = blocks;
        chain.dirty = false;
        Ok(())
    }

    /// Flush every dirty inode in this layer, drain the inode-page
    /// cluster, then rewrite the index chain.
    pub fn sync_inodes(&self) -> Result<u64> {
        let mut written = 0_u64;
        for inode in self.all_inodes() {
            // The read guard must drop before flush_inode takes the
            // write lock.
            let dirty = inode.read().dirty_any();
            if dirty && self.flush_inode(&inode)? {
                written += 1;
            }
        }
        self.ipages.flush(&*self.dev)?;
        self.flush_inode_chain()?;
        self.release_inode_run();
        self.pages.flush(&*self.dev)?;
        self.pages.clear_meta();
        self.ipages.clear_meta();
        debug!(layer = self.index.0, written, "synced inodes");
        Ok(written)
    }
}

// ── Remount ─────────────────────────────────────────────────────────────────

impl Layer {
    /// Rebuild this layer's inode table from its on-disk chain. Parent
    /// layers must be fully loaded first; divergence against the parent's
    /// same-numbered inode decides block ownership.
    pub(crate) fn read_inodes(&self, head: BlockNumber) -> Result<()> {
        {
            let mut chain = self.chain.lock();
            chain.head = head;
        }
        if !head.is_valid() {
            return Err(LcError::Corruption {
                block: 0,
                detail: format!("layer {} has no inode chain on disk", self.index),
            });
        }
        let mut block = head;
        let mut index_blocks = Vec::new();
        let mut kept: Vec<u64> = Vec::new();
        let mut dropped_any = false;
        let limit = self.dev.block_count();
        while block.is_valid() {
            if index_blocks.len() as u64 > limit {
                return Err(LcError::Corruption {
                    block: head.0,
                    detail: "inode index chain cycle".to_owned(),
                });
            }
            let data = self.dev.read_block(block)?;
            let mut ib = IndexBlock::decode(block, &data)?;
            let mut rewrote = false;
            for slot in &mut ib.slots {
                if *slot == LC_INVALID_BLOCK {
                    continue;
                }
                let iblock = BlockNumber(*slot);
                match self.load_inode_block(iblock) {
                    Ok(true) => kept.push(*slot),
                    Ok(false) => {
                        // Tombstone: reclaim the block and mark the slot
                        // so a remount before the next sync skips it.
                        self.free_local(iblock, 1, true);
                        *slot = LC_INVALID_BLOCK;
                        rewrote = true;
                        dropped_any = true;
                    }
                    Err(err) => {
                        // Corrupt inode blocks are logged and skipped;
                        // the rest of the layer stays readable.
                        warn!(block = iblock.0, error = %err, "skipping corrupt inode block");
                        kept.push(*slot);
                    }
                }
            }
            if rewrote {
                self.dev.write_block(block, &ib.encode())?;
            }
            index_blocks.push(block);
            block = BlockNumber(ib.next);
        }
        {
            let mut chain = self.chain.lock();
            chain.blocks = kept;
            chain.index_blocks = index_blocks;
            chain.dirty = dropped_any;
        }
        if self.root_inode.get().is_none() {
            return Err(LcError::Corruption {
                block: head.0,
                detail: format!("layer {} root inode missing from chain", self.index),
            });
        }
        Ok(())
    }

    /// Load one inode block. Returns `false` for a tombstone.
    fn load_inode_block(&self, block: BlockNumber) -> Result<bool> {
        let data = self.dev.read_block(block)?;
        let di = DiskInode::decode(block, &data)?;
        if di.is_tombstone() {
            return Ok(false);
        }
        let ino = Ino(di.ino);
        let stat = Stat {
            mode: di.mode,
            nlink: di.nlink,
            uid: di.uid,
            gid: di.gid,
            rdev: di.rdev,
            size: di.size,
            blocks: di.blocks,
            atime: TimeSpec {
                sec: di.atime_sec,
                nsec: di.atime_nsec,
            },
            mtime: TimeSpec {
                sec: di.mtime_sec,
                nsec: di.mtime_nsec,
            },
            ctime: TimeSpec {
                sec: di.ctime_sec,
                nsec: di.ctime_nsec,
            },
        };
        let mut state = new_state(stat, Ino(di.parent), Body::Special);
        state.disk_block = block;

        match FileKind::from_mode(di.mode) {
            FileKind::Regular => {
                let map = if di.extent_len > 0 {
                    RegMap::Extent {
                        start: BlockNumber(di.extent_block),
                        len: di.extent_len,
                    }
                } else if di.bmap_dir_block != LC_INVALID_BLOCK {
                    let mut bmap = Bmap::new();
                    let mut extents = ExtentMap::new();
                    for (cb_block, cb) in self.read_chain(BlockNumber(di.bmap_dir_block))? {
                        for (logical, physical, count) in
                            ondisk::decode_bmap_records(cb_block, &cb.payload, cb.count)?
                        {
                            bmap.map(logical, BlockNumber(physical), count);
                        }
                        extents.insert(cb_block, 1);
                    }
                    state.bmap_dir_block = BlockNumber(di.bmap_dir_block);
                    state.bmap_dir_extents = extents;
                    RegMap::Sparse(Arc::new(bmap))
                } else {
                    RegMap::Empty
                };
                state.owned = self.rebuild_owned(ino, &map);
                state.body = Body::Regular(map);
            }
            FileKind::Directory => {
                let body = if di.bmap_dir_block != LC_INVALID_BLOCK {
                    let mut records = Vec::new();
                    let mut extents = ExtentMap::new();
                    for (cb_block, cb) in self.read_chain(BlockNumber(di.bmap_dir_block))? {
                        records
                            .extend(ondisk::decode_dir_records(cb_block, &cb.payload, cb.count)?);
                        extents.insert(cb_block, 1);
                    }
                    state.bmap_dir_block = BlockNumber(di.bmap_dir_block);
                    state.bmap_dir_extents = extents;
                    DirBody::from_records(records)
                } else {
                    let count = lcfs_types::read_u32(&data, LC_DINODE_SIZE)
                        .map_err(|e| LcError::Corruption {
                            block: block.0,
                            detail: e.to_string(),
                        })?;
                    let records = ondisk::decode_dir_records(
                        block,
                        &data[LC_DINODE_SIZE + 4..],
                        count,
                    )?;
                    DirBody::from_records(records)
                };
                state.body = Body::Directory(Arc::new(body));
            }
            FileKind::Symlink => {
                let len = di.size as usize;
                let raw = data
                    .get(LC_DINODE_SIZE..LC_DINODE_SIZE + len)
                    .ok_or_else(|| LcError::Corruption {
                        block: block.0,
                        detail: "symlink target extends past block".to_owned(),
                    })?;
                let target = std::str::from_utf8(raw).map_err(|_| LcError::Corruption {
                    block: block.0,
                    detail: "symlink target is not UTF-8".to_owned(),
                })?;
                state.body = Body::Symlink(Arc::from(target));
            }
            FileKind::Special => {}
        }

        if di.xattr_block != LC_INVALID_BLOCK {
            let mut records = Vec::new();
            let mut extents = ExtentMap::new();
            for (cb_block, cb) in self.read_chain(BlockNumber(di.xattr_block))? {
                records.extend(ondisk::decode_xattr_records(cb_block, &cb.payload, cb.count)?);
                extents.insert(cb_block, 1);
            }
            state.xattr_block = BlockNumber(di.xattr_block);
            state.xattr_extents = extents;
            state.xattrs = Arc::new(XattrList::from_records(records));
        }

        let inode = Arc::new(Inode::new(ino, self.index, state));
        self.add_inode(Arc::clone(&inode));
        if ino == self.root {
            let _ = self.root_inode.set(inode);
        }
        Ok(true)
    }

    /// Physical ranges this inode owns: whatever it references that its
    /// nearest same-numbered ancestor does not.
    fn rebuild_owned(&self, ino: Ino, map: &RegMap) -> ExtentMap {
        let mut owned = ExtentMap::new();
        match map {
            RegMap::Empty => return owned,
            RegMap::Extent { start, len } => owned.insert(*start, *len),
            RegMap::Sparse(bmap) => {
                for e in bmap.iter() {
                    owned.insert(e.physical, e.count);
                }
            }
        }
        let mut next = self.parent.as_ref();
        while let Some(layer) = next {
            if let Some(ancestor) = layer.lookup_cached(ino) {
                let st = ancestor.read();
                if let Body::Regular(parent_map) = &st.body {
                    match parent_map {
                        RegMap::Empty => {}
                        RegMap::Extent { start, len } => {
                            owned.remove_range(*start, *len);
                        }
                        RegMap::Sparse(bmap) => {
                            for e in bmap.iter() {
                                owned.remove_range(e.physical, e.count);
                            }
                        }
                    }
                }
                break;
            }
            next = layer.parent.as_ref();
        }
        owned
    }

    /// Drop every inode, optionally releasing all layer-local blocks to
    /// the global pool (layer removal). Flush is intentionally skipped.
    pub(crate) fn destroy_inodes(&self, remove: bool) {
        let mut live = 0_u64;
        for bucket in &self.icache {
            for inode in bucket.lock().drain(..) {
                let mut st = inode.write();
                if !st.removed {
                    live += 1;
                }
                if remove {
                    for e in st.owned.drain() {
                        self.galloc.free(e.start, e.count);
                    }
                    for e in st.bmap_dir_extents.drain() {
                        self.galloc.free(e.start, e.count);
                    }
                    for e in st.xattr_extents.drain() {
                        self.galloc.free(e.start, e.count);
                    }
                    if st.disk_block.is_valid() {
                        self.galloc.free(st.disk_block, 1);
                    }
                }
            }
        }
        if remove {
            let chain = &mut *self.chain.lock();
            for block in chain.index_blocks.drain(..) {
                self.galloc.free(block, 1);
            }
            chain.blocks.clear();
            chain.head = BlockNumber::INVALID;
            self.counters.inodes.fetch_sub(live, Ordering::Relaxed);
        }
        self.icount.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::GlobalAlloc;
    use crate::layer::Counters;
    use lcfs_block::MemBlockDevice;
    use lcfs_types::{LayerIndex, S_IFDIR, S_IFREG};

    fn base_layer(blocks: u64) -> Arc<Layer> {
        let dev = Arc::new(MemBlockDevice::new(blocks));
        let counters = Arc::new(Counters::default());
        counters.next_inode.store(1, Ordering::SeqCst);
        let layer = Layer::new(
            LayerIndex(0),
            Ino::ROOT,
            None,
            dev,
            counters,
            Arc::new(GlobalAlloc::with_range(1, blocks - 1)),
            false,
        );
        layer.root_init();
        layer
    }

    fn child_layer(parent: &Arc<Layer>, index: u32) -> Arc<Layer> {
        parent.freeze();
        parent.add_child();
        let root = parent.counters.alloc_ino();
        let layer = Layer::new(
            LayerIndex(index),
            root,
            Some(Arc::clone(parent)),
            Arc::clone(&parent.dev),
            Arc::clone(&parent.counters),
            Arc::clone(&parent.galloc),
            false,
        );
        layer.root_init_from_parent().unwrap();
        layer
    }

    #[test]
    fn hash_holds_one_entry_per_ino() {
        let layer = base_layer(256);
        let a = layer
            .alloc_inode(S_IFREG | 0o644, 0, 0, 0, layer.root, None)
            .unwrap();
        assert_eq!(layer.lookup_cached(a.num).unwrap().num, a.num);
        // Same number hashes to the same bucket exactly once.
        let all = layer.all_inodes();
        let matches = all.iter().filter(|i| i.num == a.num).count();
        assert_eq!(matches, 1);
    }

    #[test]
    fn get_walks_parent_chain_for_reads() {
        let base = base_layer(256);
        let file = base
            .alloc_inode(S_IFREG | 0o644, 0, 0, 0, base.root, None)
            .unwrap();
        let child = child_layer(&base, 1);

        let found = child.get(file.num, GetMode::Read).unwrap();
        // Read access returns the parent's inode without cloning.
        assert!(Arc::ptr_eq(&found, &file));
        assert_eq!(child.in_memory_inodes(), 1); // just the root clone
    }

    #[test]
    fn copy_up_clones_into_child() {
        let base = base_layer(256);
        let file = base
            .alloc_inode(S_IFREG | 0o644, 0, 0, 0, base.root, None)
            .unwrap();
        file.write().stat.size = 11;
        let child = child_layer(&base, 1);

        let clone = child.get(file.num, GetMode::Copy).unwrap();
        assert!(!Arc::ptr_eq(&clone, &file));
        assert_eq!(clone.num, file.num);
        assert_eq!(clone.read().stat.size, 11);
        assert!(clone.read().dirty);
        // Second get finds the clone, not a new copy.
        let again = child.get(file.num, GetMode::Copy).unwrap();
        assert!(Arc::ptr_eq(&again, &clone));
        assert_eq!(child.counters.clones.load(Ordering::Relaxed), 2); // root + file
    }

    #[test]
    fn snap_layer_rejects_writes() {
        let base = base_layer(256);
        let file = base
            .alloc_inode(S_IFREG | 0o644, 0, 0, 0, base.root, None)
            .unwrap();
        base.freeze();
        assert!(matches!(
            base.get(file.num, GetMode::Copy),
            Err(LcError::ReadOnly)
        ));
        assert!(base.get(file.num, GetMode::Read).is_ok());
    }

    #[test]
    fn removed_inode_is_authoritative() {
        let base = base_layer(256);
        let file = base
            .alloc_inode(S_IFREG | 0o644, 0, 0, 0, base.root, None)
            .unwrap();
        let child = child_layer(&base, 1);
        let clone = child.get(file.num, GetMode::Copy).unwrap();
        clone.write().removed = true;

        // The child's removed clone hides the parent's inode.
        assert!(matches!(
            child.get(file.num, GetMode::Read),
            Err(LcError::NotFound(_))
        ));
        // The parent still sees it.
        assert!(base.get(file.num, GetMode::Read).is_ok());
    }

    #[test]
    fn cloned_dir_shares_body_until_mutation() {
        let base = base_layer(256);
        let dir = base
            .alloc_inode(S_IFDIR | 0o755, 0, 0, 0, base.root, None)
            .unwrap();
        dir.write()
            .body
            .dir_mut()
            .unwrap()
            .add(b"x", Ino(99), 8)
            .unwrap();
        let child = child_layer(&base, 1);

        let clone = child.get(dir.num, GetMode::Copy).unwrap();
        {
            let st = clone.read();
            assert!(st.shared);
            let Body::Directory(body) = &st.body else {
                panic!("not a dir");
            };
            assert_eq!(body.lookup(b"x").unwrap().ino, Ino(99));
        }
        // Mutating the clone leaves the parent body untouched.
        clone.write().body.dir_mut().unwrap().remove(b"x").unwrap();
        let Body::Directory(parent_body) = &dir.read().body else {
            panic!("not a dir");
        };
        assert!(parent_body.lookup(b"x").is_some());
    }

    #[test]
    fn flush_dpages_keeps_sequential_files_contiguous() {
        let layer = base_layer(2048);
        let file = layer
            .alloc_inode(S_IFREG | 0o644, 0, 0, 0, layer.root, None)
            .unwrap();
        {
            let st = &mut *file.write();
            for i in 0..300_u64 {
                st.dpages.insert(i, vec![0xAA; LC_BLOCK_SIZE as usize]);
            }
            st.stat.size = 300 * u64::from(LC_BLOCK_SIZE);
            layer.flush_dpages(st).unwrap();
            match st.body.as_reg().unwrap() {
                RegMap::Extent { len, .. } => assert_eq!(*len, 300),
                other => panic!("expected contiguous extent, got {other:?}"),
            }
            assert_eq!(st.stat.blocks, 300);
            assert_eq!(st.owned.total_blocks(), 300);
        }
    }

    #[test]
    fn overwrite_breaks_contiguity_and_frees_owned() {
        let layer = base_layer(2048);
        let file = layer
            .alloc_inode(S_IFREG | 0o644, 0, 0, 0, layer.root, None)
            .unwrap();
        let st = &mut *file.write();
        for i in 0..4_u64 {
            st.dpages.insert(i, vec![1; LC_BLOCK_SIZE as usize]);
        }
        layer.flush_dpages(st).unwrap();
        let owned_before = st.owned.total_blocks();
        assert_eq!(owned_before, 4);

        // Rewrite page 1 only.
        st.dpages.insert(1, vec![2; LC_BLOCK_SIZE as usize]);
        layer.flush_dpages(st).unwrap();
        assert!(matches!(st.body.as_reg().unwrap(), RegMap::Sparse(_)));
        // One new block allocated, one old block freed.
        assert_eq!(st.owned.total_blocks(), 4);
        assert_eq!(st.stat.blocks, 4);
    }

    #[test]
    fn truncate_frees_owned_tail_only() {
        let layer = base_layer(2048);
        let file = layer
            .alloc_inode(S_IFREG | 0o644, 0, 0, 0, layer.root, None)
            .unwrap();
        let st = &mut *file.write();
        for i in 0..8_u64 {
            st.dpages.insert(i, vec![1; LC_BLOCK_SIZE as usize]);
        }
        st.stat.size = 8 * u64::from(LC_BLOCK_SIZE);
        layer.flush_dpages(st).unwrap();

        layer
            .truncate_file(st, 3 * u64::from(LC_BLOCK_SIZE))
            .unwrap();
        assert_eq!(st.stat.blocks, 3);
        assert_eq!(st.owned.total_blocks(), 3);

        layer.truncate_file(st, 0).unwrap();
        assert_eq!(st.stat.blocks, 0);
        assert_eq!(st.owned.total_blocks(), 0);
    }

    #[test]
    fn inherited_extent_is_never_freed_by_child() {
        let base = base_layer(2048);
        let file = base
            .alloc_inode(S_IFREG | 0o644, 0, 0, 0, base.root, None)
            .unwrap();
        {
            let st = &mut *file.write();
            for i in 0..4_u64 {
                st.dpages.insert(i, vec![7; LC_BLOCK_SIZE as usize]);
            }
            st.stat.size = 4 * u64::from(LC_BLOCK_SIZE);
            base.flush_dpages(st).unwrap();
        }
        let child = child_layer(&base, 1);
        let clone = child.get(file.num, GetMode::Copy).unwrap();
        {
            let st = &mut *clone.write();
            // The clone inherited the extent without owning it.
            assert!(matches!(
                st.body.as_reg().unwrap(),
                RegMap::Extent { len: 4, .. }
            ));
            assert!(st.owned.is_empty());

            let global_before = child.galloc.free_blocks() + child.pooled_blocks();
            st.dpages.insert(0, vec![9; LC_BLOCK_SIZE as usize]);
            child.flush_dpages(st).unwrap();
            // One block allocated for the divergent page; nothing freed.
            let global_after = child.galloc.free_blocks() + child.pooled_blocks();
            assert_eq!(global_before - global_after, 1);
            assert_eq!(st.owned.total_blocks(), 1);
        }
        // Parent data is untouched.
        let parent_st = file.read();
        assert!(matches!(
            parent_st.body.as_reg().unwrap(),
            RegMap::Extent { len: 4, .. }
        ));
    }
}
