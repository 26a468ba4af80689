//! Global filesystem state and request dispatch.
//!
//! `Gfs` owns the device, the superblock, the global free pool, and the
//! table of mounted layers. Every transport request enters through a
//! dispatch method that translates its handle into `(layer, inode)`,
//! performs the operation under the inode lock, and returns. A background
//! flusher drains dirty file pages between explicit flush points.

use crate::alloc::GlobalAlloc;
use crate::dir::{dirent_kind, DirEntry};
use crate::inode::{Body, GetMode, Inode, Stat, TimeSpec};
use crate::layer::{Counters, Layer, LayerStats};
use crate::ondisk::{
    self, ChainBlock, Superblock, LC_FREE_PER_BLOCK, LC_INLINE_MAX, LC_LAYER_FLAG_SNAP,
    LC_LAYER_PER_BLOCK,
};
use lcfs_block::BlockDevice;
use lcfs_error::{LcError, Result};
use lcfs_extent::ExtentMap;
use lcfs_types::{
    is_dir, is_reg, BlockNumber, Handle, Ino, LayerIndex, LC_BLOCK_SIZE, LC_INVALID_BLOCK,
    LC_LAYER_MAX,
};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

// ── Control operations ──────────────────────────────────────────────────────

/// Layer-management commands accepted on the snapshot root directory.
pub const LC_IOC_CREATE: u32 = 1;
pub const LC_IOC_CREATE_RO: u32 = 2;
pub const LC_IOC_REMOVE: u32 = 3;
pub const LC_IOC_COMMIT: u32 = 4;
pub const LC_IOC_STAT: u32 = 5;

/// Attribute view returned by dispatch operations.
#[derive(Debug, Clone, Copy)]
pub struct Attr {
    pub handle: Handle,
    pub stat: Stat,
}

/// Fields a setattr request may change.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<TimeSpec>,
    pub mtime: Option<TimeSpec>,
}

/// One readdir result row. `offset` is the cookie for resuming after
/// this entry.
#[derive(Debug, Clone)]
pub struct DirEntryOut {
    pub handle: Handle,
    pub offset: u64,
    pub kind: u8,
    pub name: Vec<u8>,
}

/// statfs snapshot.
#[derive(Debug, Clone, Copy)]
pub struct FsStats {
    pub blocks: u64,
    pub bfree: u64,
    pub files: u64,
    pub bsize: u32,
    pub namelen: u32,
}

struct OpenFile {
    layer: Arc<Layer>,
    inode: Arc<Inode>,
}

#[derive(Default)]
struct LayerTable {
    by_index: HashMap<u32, Arc<Layer>>,
    next_index: u32,
}

/// Blocks occupied by the persisted superblock chains, freed and
/// reallocated on every superblock write.
#[derive(Default)]
struct SuperMeta {
    free_blocks: Vec<BlockNumber>,
    layer_blocks: Vec<BlockNumber>,
}

struct FlusherHandle {
    join: JoinHandle<()>,
}

/// Process-wide filesystem state. One instance per mounted device.
pub struct Gfs {
    dev: Arc<dyn BlockDevice>,
    counters: Arc<Counters>,
    galloc: Arc<GlobalAlloc>,
    layers: RwLock<LayerTable>,
    /// Serializes superblock writes and layer lifecycle changes.
    commit_lock: Mutex<SuperMeta>,
    snap_root: Mutex<Ino>,
    snap_root_inode: Mutex<Option<Arc<Inode>>>,
    open_files: Mutex<HashMap<u64, OpenFile>>,
    next_fh: AtomicU64,
    unmounting: AtomicBool,
    flusher: Mutex<Option<FlusherHandle>>,
    flusher_cond: Arc<(Mutex<bool>, Condvar)>,
}

impl Gfs {
    /// Mount a device, formatting it first when it carries no valid
    /// superblock.
    pub fn mount(dev: Arc<dyn BlockDevice>) -> Result<Arc<Self>> {
        match Superblock::decode(&dev.read_block(BlockNumber(0))?) {
            Ok(sb) => Self::mount_existing(dev, sb),
            Err(err) => {
                info!(error = %err, "no valid superblock, formatting");
                Self::format(dev)
            }
        }
    }

    /// Initialize a fresh filesystem: base layer with an empty root
    /// directory, everything past block 0 free.
    pub fn format(dev: Arc<dyn BlockDevice>) -> Result<Arc<Self>> {
        let blocks = dev.block_count();
        if blocks < 8 {
            return Err(LcError::Invalid(format!(
                "device too small: {blocks} blocks"
            )));
        }
        let counters = Arc::new(Counters::default());
        counters.next_inode.store(Ino::ROOT.0, Ordering::SeqCst);
        let galloc = Arc::new(GlobalAlloc::with_range(1, blocks - 1));
        let base = Layer::new(
            LayerIndex(0),
            Ino::ROOT,
            None,
            Arc::clone(&dev),
            Arc::clone(&counters),
            Arc::clone(&galloc),
            false,
        );
        base.root_init();
        counters.inodes.store(1, Ordering::SeqCst);

        let mut table = LayerTable::default();
        table.by_index.insert(0, base);
        table.next_index = 1;

        let gfs = Arc::new(Self {
            dev,
            counters,
            galloc,
            layers: RwLock::new(table),
            commit_lock: Mutex::new(SuperMeta::default()),
            snap_root: Mutex::new(Ino(0)),
            snap_root_inode: Mutex::new(None),
            open_files: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
            unmounting: AtomicBool::new(false),
            flusher: Mutex::new(None),
            flusher_cond: Arc::new((Mutex::new(false), Condvar::new())),
        });
        gfs.sync_all()?;
        info!(blocks, "formatted");
        Ok(gfs)
    }

    fn mount_existing(dev: Arc<dyn BlockDevice>, sb: Superblock) -> Result<Arc<Self>> {
        if sb.block_count != dev.block_count() {
            warn!(
                superblock = sb.block_count,
                device = dev.block_count(),
                "block count mismatch, trusting superblock"
            );
        }
        let counters = Arc::new(Counters::default());
        counters.next_inode.store(sb.next_inode, Ordering::SeqCst);
        counters.inodes.store(sb.inode_count, Ordering::SeqCst);

        let mut meta = SuperMeta::default();

        // Global free pool.
        let mut free = ExtentMap::new();
        let mut block = BlockNumber(sb.free_head);
        while block.is_valid() {
            let cb = ChainBlock::decode(block, &dev.read_block(block)?)?;
            for (start, count) in ondisk::decode_free_records(block, &cb.payload, cb.count)? {
                free.insert(BlockNumber(start), count);
            }
            meta.free_blocks.push(block);
            block = BlockNumber(cb.next);
        }
        let galloc = Arc::new(GlobalAlloc::new(free));

        // Layer table.
        let mut records = Vec::new();
        let mut block = BlockNumber(sb.layer_head);
        while block.is_valid() {
            let cb = ChainBlock::decode(block, &dev.read_block(block)?)?;
            records.extend(ondisk::decode_layer_records(block, &cb.payload, cb.count)?);
            meta.layer_blocks.push(block);
            block = BlockNumber(cb.next);
        }
        records.sort_by_key(|r| r.index);

        let mut table = LayerTable::default();
        for rec in &records {
            let parent = if rec.parent_root == 0 {
                None
            } else {
                let found = table
                    .by_index
                    .values()
                    .find(|l| l.root.0 == rec.parent_root)
                    .cloned();
                // Layer-chain inconsistencies at mount are fatal.
                Some(found.ok_or_else(|| LcError::Corruption {
                    block: sb.layer_head,
                    detail: format!(
                        "layer {} references missing parent root {}",
                        rec.index, rec.parent_root
                    ),
                })?)
            };
            if let Some(parent) = &parent {
                parent.add_child();
            }
            let layer = Layer::new(
                LayerIndex(rec.index),
                Ino(rec.root),
                parent,
                Arc::clone(&dev),
                Arc::clone(&counters),
                Arc::clone(&galloc),
                rec.flags & LC_LAYER_FLAG_SNAP != 0,
            );
            layer.read_inodes(BlockNumber(rec.inode_head))?;
            table.next_index = table.next_index.max(rec.index + 1);
            table.by_index.insert(rec.index, layer);
        }
        if !table.by_index.contains_key(&0) {
            return Err(LcError::Corruption {
                block: 0,
                detail: "base layer missing from layer table".to_owned(),
            });
        }

        // The persisted inode counter is a hint; never reissue a live
        // number even if it is stale after a crash.
        let mut max_ino = sb.next_inode;
        for layer in table.by_index.values() {
            for inode in layer.all_inodes() {
                max_ino = max_ino.max(inode.num.0);
            }
        }
        counters.next_inode.store(max_ino, Ordering::SeqCst);

        let layer_count = table.by_index.len();
        let gfs = Arc::new(Self {
            dev,
            counters,
            galloc,
            layers: RwLock::new(table),
            commit_lock: Mutex::new(meta),
            snap_root: Mutex::new(Ino(sb.snap_root)),
            snap_root_inode: Mutex::new(None),
            open_files: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
            unmounting: AtomicBool::new(false),
            flusher: Mutex::new(None),
            flusher_cond: Arc::new((Mutex::new(false), Condvar::new())),
        });
        info!(layers = layer_count, "mounted");
        Ok(gfs)
    }

    /// Stop serving, flush everything, and write the final superblock.
    pub fn unmount(&self) -> Result<()> {
        self.unmounting.store(true, Ordering::SeqCst);
        self.stop_flusher();
        self.open_files.lock().clear();
        self.sync_all()?;
        self.dev.sync()?;
        info!("unmounted");
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.unmounting.load(Ordering::SeqCst) {
            return Err(LcError::ShuttingDown);
        }
        Ok(())
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.dev
    }

    // ── Layer resolution ────────────────────────────────────────────────

    fn layer_of(&self, handle: Handle) -> Result<Arc<Layer>> {
        self.layer_by_index(handle.layer())
    }

    fn layer_by_index(&self, index: LayerIndex) -> Result<Arc<Layer>> {
        self.layers
            .read()
            .by_index
            .get(&index.0)
            .cloned()
            .ok_or_else(|| LcError::not_found(format!("layer {index}")))
    }

    fn base_layer(&self) -> Result<Arc<Layer>> {
        self.layer_by_index(LayerIndex(0))
    }

    fn layer_by_root(&self, root: Ino) -> Option<Arc<Layer>> {
        self.layers
            .read()
            .by_index
            .values()
            .find(|l| l.root == root)
            .cloned()
    }

    fn all_layers(&self) -> Vec<Arc<Layer>> {
        let mut layers: Vec<Arc<Layer>> = self.layers.read().by_index.values().cloned().collect();
        layers.sort_by_key(|l| l.index.0);
        layers
    }

    /// The snapshot-root directory inode, kept as a direct reference so
    /// layer operations bypass the hash.
    fn snap_root_dir(&self) -> Result<Arc<Inode>> {
        if let Some(inode) = self.snap_root_inode.lock().as_ref() {
            return Ok(Arc::clone(inode));
        }
        let snap_root = *self.snap_root.lock();
        if snap_root.0 == 0 {
            return Err(LcError::Invalid("snapshot root is not set".to_owned()));
        }
        let inode = self.base_layer()?.get(snap_root, GetMode::Read)?;
        *self.snap_root_inode.lock() = Some(Arc::clone(&inode));
        Ok(inode)
    }

    fn layer_by_name(&self, name: &str) -> Result<Arc<Layer>> {
        let dir = self.snap_root_dir()?;
        let st = dir.read();
        let entry = st
            .body
            .as_dir()?
            .lookup(name.as_bytes())
            .ok_or_else(|| LcError::not_found(format!("layer {name}")))?;
        let root = entry.ino;
        drop(st);
        self.layer_by_root(root)
            .ok_or_else(|| LcError::not_found(format!("layer {name}")))
    }

    /// Handle for a directory entry. Entries of the snapshot root are
    /// layer roots and carry their own layer's index.
    fn entry_handle(&self, dir_layer: &Arc<Layer>, dir_ino: Ino, entry_ino: Ino) -> Handle {
        if dir_layer.index.0 == 0 && dir_ino == *self.snap_root.lock() && dir_ino.0 != 0 {
            if let Some(layer) = self.layer_by_root(entry_ino) {
                return Handle::new(layer.index, entry_ino);
            }
        }
        Handle::new(dir_layer.index, entry_ino)
    }

    fn attr_of(&self, layer: &Arc<Layer>, inode: &Arc<Inode>) -> Attr {
        Attr {
            handle: Handle::new(layer.index, inode.num),
            stat: inode.read().stat,
        }
    }

    // ── Lookup and attributes ───────────────────────────────────────────

    pub fn lookup(&self, parent: Handle, name: &[u8]) -> Result<Attr> {
        self.ensure_running()?;
        let layer = self.layer_of(parent)?;
        let dir = layer.get(parent.ino(), GetMode::Read)?;
        let st = dir.read();
        if name == b"." {
            drop(st);
            return Ok(Attr {
                handle: parent,
                stat: dir.read().stat,
            });
        }
        if name == b".." {
            let up = st.parent;
            drop(st);
            let up_inode = layer.get(up, GetMode::Read)?;
            return Ok(Attr {
                handle: Handle::new(layer.index, up),
                stat: up_inode.read().stat,
            });
        }
        let entry = st
            .body
            .as_dir()?
            .lookup(name)
            .ok_or_else(|| LcError::not_found(String::from_utf8_lossy(name).into_owned()))?;
        let ino = entry.ino;
        drop(st);
        let handle = self.entry_handle(&layer, parent.ino(), ino);
        let target_layer = self.layer_of(handle)?;
        let inode = target_layer.get(ino, GetMode::Read)?;
        let stat = inode.read().stat;
        Ok(Attr { handle, stat })
    }

    pub fn getattr(&self, handle: Handle) -> Result<Attr> {
        self.ensure_running()?;
        let layer = self.layer_of(handle)?;
        let inode = layer.get(handle.ino(), GetMode::Read)?;
        let stat = inode.read().stat;
        Ok(Attr { handle, stat })
    }

    pub fn setattr(&self, handle: Handle, set: SetAttr) -> Result<Attr> {
        self.ensure_running()?;
        let layer = self.layer_of(handle)?;
        let inode = layer.get(handle.ino(), GetMode::Copy)?;
        {
            let st = &mut *inode.write();
            if let Some(mode) = set.mode {
                st.stat.mode = (st.stat.mode & lcfs_types::S_IFMT) | (mode & !lcfs_types::S_IFMT);
            }
            if let Some(uid) = set.uid {
                st.stat.uid = uid;
            }
            if let Some(gid) = set.gid {
                st.stat.gid = gid;
            }
            if let Some(size) = set.size {
                if !is_reg(st.stat.mode) {
                    return Err(LcError::Invalid("truncate on non-regular file".to_owned()));
                }
                layer.truncate_file(st, size)?;
            }
            if let Some(atime) = set.atime {
                st.stat.atime = atime;
            }
            if let Some(mtime) = set.mtime {
                st.stat.mtime = mtime;
            }
            st.stat.update_times(false, false, true);
            st.dirty = true;
        }
        Ok(self.attr_of(&layer, &inode))
    }

    pub fn readlink(&self, handle: Handle) -> Result<Vec<u8>> {
        self.ensure_running()?;
        let layer = self.layer_of(handle)?;
        let inode = layer.get(handle.ino(), GetMode::Read)?;
        let st = inode.read();
        match &st.body {
            Body::Symlink(target) => Ok(target.as_bytes().to_vec()),
            _ => Err(LcError::Invalid("not a symlink".to_owned())),
        }
    }

    // ── Create and remove ───────────────────────────────────────────────

    /// Shared entry for mknod/mkdir/symlink/create.
    fn make_inode(
        &self,
        parent: Handle,
        name: &[u8],
        mode: u32,
        uid: u32,
        gid: u32,
        rdev: u32,
        target: Option<&str>,
    ) -> Result<(Arc<Layer>, Arc<Inode>)> {
        self.ensure_running()?;
        if let Some(target) = target {
            if target.len() >= LC_INLINE_MAX {
                return Err(LcError::NameTooLong);
            }
        }
        let layer = self.layer_of(parent)?;
        let dir = layer.get(parent.ino(), GetMode::Copy)?;
        let dst = &mut *dir.write();
        if dst.body.as_dir()?.lookup(name).is_some() {
            return Err(LcError::Exists);
        }
        let inode = layer.alloc_inode(mode, uid, gid, rdev, parent.ino(), target)?;
        dst.body.dir_mut()?.add(name, inode.num, dirent_kind(mode))?;
        dst.shared = false;
        if is_dir(mode) {
            dst.stat.nlink += 1;
        }
        dst.stat.update_times(false, true, true);
        dst.dirdirty = true;
        dst.dirty = true;
        Ok((layer, inode))
    }

    pub fn mknod(
        &self,
        parent: Handle,
        name: &[u8],
        mode: u32,
        rdev: u32,
        uid: u32,
        gid: u32,
    ) -> Result<Attr> {
        let (layer, inode) = self.make_inode(parent, name, mode, uid, gid, rdev, None)?;
        Ok(self.attr_of(&layer, &inode))
    }

    pub fn mkdir(&self, parent: Handle, name: &[u8], mode: u32, uid: u32, gid: u32) -> Result<Attr> {
        let mode = lcfs_types::S_IFDIR | (mode & !lcfs_types::S_IFMT);
        let (layer, inode) = self.make_inode(parent, name, mode, uid, gid, 0, None)?;
        Ok(self.attr_of(&layer, &inode))
    }

    pub fn symlink(
        &self,
        parent: Handle,
        name: &[u8],
        target: &str,
        uid: u32,
        gid: u32,
    ) -> Result<Attr> {
        let mode = lcfs_types::S_IFLNK | 0o777;
        let (layer, inode) = self.make_inode(parent, name, mode, uid, gid, 0, Some(target))?;
        Ok(self.attr_of(&layer, &inode))
    }

    pub fn create(
        &self,
        parent: Handle,
        name: &[u8],
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<(Attr, u64)> {
        let mode = lcfs_types::S_IFREG | (mode & !lcfs_types::S_IFMT);
        let (layer, inode) = self.make_inode(parent, name, mode, uid, gid, 0, None)?;
        let attr = self.attr_of(&layer, &inode);
        let fh = self.register_open(layer, inode);
        Ok((attr, fh))
    }

    /// Common unlink/rmdir path. Holds the parent directory's write lock
    /// for the whole operation so concurrent lookups never see a torn
    /// state.
    fn remove_entry(&self, parent: Handle, name: &[u8], want_dir: bool) -> Result<()> {
        self.ensure_running()?;
        let layer = self.layer_of(parent)?;
        let dir = layer.get(parent.ino(), GetMode::Copy)?;
        let dst = &mut *dir.write();
        let entry = dst
            .body
            .as_dir()?
            .lookup(name)
            .ok_or_else(|| LcError::not_found(String::from_utf8_lossy(name).into_owned()))?;
        let target_ino = entry.ino;

        let target = layer.get(target_ino, GetMode::Copy)?;
        {
            let tst = &mut *target.write();
            let target_is_dir = is_dir(tst.stat.mode);
            if want_dir != target_is_dir {
                return Err(if target_is_dir {
                    LcError::IsDirectory
                } else {
                    LcError::NotDirectory
                });
            }
            if target_is_dir {
                if !tst.body.as_dir()?.is_empty() {
                    return Err(LcError::NotEmpty);
                }
                tst.stat.nlink = 0;
            } else {
                tst.stat.nlink = tst.stat.nlink.saturating_sub(1);
            }
            if tst.stat.nlink == 0 {
                tst.removed = true;
                tst.dirty = true;
                self.counters.inodes.fetch_sub(1, Ordering::Relaxed);
            } else {
                tst.stat.update_times(false, false, true);
                tst.dirty = true;
            }
        }

        dst.body.dir_mut()?.remove(name);
        dst.shared = false;
        if want_dir {
            dst.stat.nlink = dst.stat.nlink.saturating_sub(1);
        }
        dst.stat.update_times(false, true, true);
        dst.dirdirty = true;
        dst.dirty = true;
        Ok(())
    }

    pub fn unlink(&self, parent: Handle, name: &[u8]) -> Result<()> {
        self.remove_entry(parent, name, false)
    }

    pub fn rmdir(&self, parent: Handle, name: &[u8]) -> Result<()> {
        self.remove_entry(parent, name, true)
    }

    pub fn rename(
        &self,
        parent: Handle,
        name: &[u8],
        new_parent: Handle,
        new_name: &[u8],
    ) -> Result<()> {
        self.ensure_running()?;
        if parent.layer() != new_parent.layer() {
            return Err(LcError::Invalid("rename across layers".to_owned()));
        }
        let layer = self.layer_of(parent)?;
        let src_dir = layer.get(parent.ino(), GetMode::Copy)?;

        let moved = if parent.ino() == new_parent.ino() {
            if name == new_name {
                return Ok(());
            }
            // One directory: a single write lock covers the whole move.
            let st = &mut *src_dir.write();
            let entry = st
                .body
                .as_dir()?
                .lookup(name)
                .ok_or_else(|| LcError::not_found(String::from_utf8_lossy(name).into_owned()))?;
            let moved = DirEntry {
                name: new_name.to_vec(),
                ino: entry.ino,
                kind: entry.kind,
            };
            // Old and new name already link to the same inode: no-op.
            if st
                .body
                .as_dir()?
                .lookup(new_name)
                .is_some_and(|e| e.ino == moved.ino)
            {
                return Ok(());
            }
            let moved_is_dir = moved.kind == dirent_kind(lcfs_types::S_IFDIR);
            self.unlink_replaced(&layer, st, new_name, moved_is_dir)?;
            let body = st.body.dir_mut()?;
            body.remove(name);
            body.add(&moved.name, moved.ino, moved.kind)?;
            st.shared = false;
            st.dirdirty = true;
            st.dirty = true;
            st.stat.update_times(false, true, true);
            moved
        } else {
            let dst_dir = layer.get(new_parent.ino(), GetMode::Copy)?;
            // Both directory locks are held for the whole move, acquired
            // in ascending inode order so two opposing renames cannot
            // deadlock.
            let (mut src_st, mut dst_st);
            if src_dir.num <= dst_dir.num {
                src_st = src_dir.write();
                dst_st = dst_dir.write();
            } else {
                dst_st = dst_dir.write();
                src_st = src_dir.write();
            }
            let entry = src_st
                .body
                .as_dir()?
                .lookup(name)
                .ok_or_else(|| LcError::not_found(String::from_utf8_lossy(name).into_owned()))?;
            let moved = DirEntry {
                name: new_name.to_vec(),
                ino: entry.ino,
                kind: entry.kind,
            };
            // Moving a directory into itself would create a cycle.
            if moved.ino == new_parent.ino() {
                return Err(LcError::Invalid("rename into self".to_owned()));
            }
            if dst_st
                .body
                .as_dir()?
                .lookup(new_name)
                .is_some_and(|e| e.ino == moved.ino)
            {
                return Ok(());
            }
            let moved_is_dir = moved.kind == dirent_kind(lcfs_types::S_IFDIR);
            self.unlink_replaced(&layer, &mut dst_st, new_name, moved_is_dir)?;
            src_st.body.dir_mut()?.remove(name);
            dst_st.body.dir_mut()?.add(&moved.name, moved.ino, moved.kind)?;
            if moved_is_dir {
                src_st.stat.nlink = src_st.stat.nlink.saturating_sub(1);
                dst_st.stat.nlink += 1;
            }
            for st in [&mut src_st, &mut dst_st] {
                st.shared = false;
                st.dirdirty = true;
                st.dirty = true;
                st.stat.update_times(false, true, true);
            }
            moved
        };

        // The moved inode records its new containing directory.
        let moved_inode = layer.get(moved.ino, GetMode::Copy)?;
        let mst = &mut *moved_inode.write();
        mst.parent = new_parent.ino();
        mst.stat.update_times(false, false, true);
        mst.dirty = true;
        Ok(())
    }

    /// Drop the entry `name` is about to replace, if any. POSIX rename
    /// over an existing target unlinks it, but only when the kinds
    /// agree: a directory cannot replace a file or vice versa, and a
    /// non-empty directory target fails.
    fn unlink_replaced(
        &self,
        layer: &Arc<Layer>,
        dir_state: &mut crate::inode::InodeState,
        name: &[u8],
        want_dir: bool,
    ) -> Result<()> {
        let Some(existing) = dir_state.body.as_dir()?.lookup(name) else {
            return Ok(());
        };
        let existing_ino = existing.ino;
        let victim = layer.get(existing_ino, GetMode::Copy)?;
        let vst = &mut *victim.write();
        let target_is_dir = is_dir(vst.stat.mode);
        if want_dir != target_is_dir {
            return Err(if target_is_dir {
                LcError::IsDirectory
            } else {
                LcError::NotDirectory
            });
        }
        if target_is_dir {
            if !vst.body.as_dir()?.is_empty() {
                return Err(LcError::NotEmpty);
            }
            vst.stat.nlink = 0;
        } else {
            vst.stat.nlink = vst.stat.nlink.saturating_sub(1);
        }
        if vst.stat.nlink == 0 {
            vst.removed = true;
            vst.dirty = true;
            self.counters.inodes.fetch_sub(1, Ordering::Relaxed);
        }
        dir_state.body.dir_mut()?.remove(name);
        Ok(())
    }

    pub fn link(&self, handle: Handle, new_parent: Handle, new_name: &[u8]) -> Result<Attr> {
        self.ensure_running()?;
        if handle.layer() != new_parent.layer() {
            return Err(LcError::Invalid("link across layers".to_owned()));
        }
        if handle.ino() == new_parent.ino() {
            return Err(LcError::IsDirectory);
        }
        let layer = self.layer_of(handle)?;
        let dir = layer.get(new_parent.ino(), GetMode::Copy)?;
        {
            let dst = &mut *dir.write();
            if dst.body.as_dir()?.lookup(new_name).is_some() {
                return Err(LcError::Exists);
            }
            let inode = layer.get(handle.ino(), GetMode::Copy)?;
            let st = &mut *inode.write();
            if is_dir(st.stat.mode) {
                return Err(LcError::IsDirectory);
            }
            dst.body
                .dir_mut()?
                .add(new_name, inode.num, dirent_kind(st.stat.mode))?;
            dst.shared = false;
            dst.dirdirty = true;
            dst.dirty = true;
            dst.stat.update_times(false, true, true);
            st.stat.nlink += 1;
            st.stat.update_times(false, false, true);
            st.dirty = true;
        }
        let inode = layer.get(handle.ino(), GetMode::Read)?;
        Ok(self.attr_of(&layer, &inode))
    }

    // ── Open files, read, write ─────────────────────────────────────────

    fn register_open(&self, layer: Arc<Layer>, inode: Arc<Inode>) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.open_files.lock().insert(fh, OpenFile { layer, inode });
        fh
    }

    /// Open carries a direct inode reference in the handle table so data
    /// calls skip the hash lookup.
    pub fn open(&self, handle: Handle) -> Result<u64> {
        self.ensure_running()?;
        let layer = self.layer_of(handle)?;
        let inode = layer.get(handle.ino(), GetMode::Read)?;
        Ok(self.register_open(layer, inode))
    }

    pub fn release(&self, fh: u64) {
        self.open_files.lock().remove(&fh);
    }

    fn cached_open(&self, fh: u64) -> Option<(Arc<Layer>, Arc<Inode>)> {
        let files = self.open_files.lock();
        files
            .get(&fh)
            .map(|f| (Arc::clone(&f.layer), Arc::clone(&f.inode)))
    }

    /// Resolve for reading, preferring the open-file cache.
    fn resolve_read(&self, handle: Handle, fh: u64) -> Result<(Arc<Layer>, Arc<Inode>)> {
        if let Some((layer, inode)) = self.cached_open(fh) {
            if inode.num == handle.ino() {
                return Ok((layer, inode));
            }
        }
        let layer = self.layer_of(handle)?;
        let inode = layer.get(handle.ino(), GetMode::Read)?;
        Ok((layer, inode))
    }

    /// Resolve for writing: the cached inode is only good if it already
    /// lives in the target layer; otherwise copy-up.
    fn resolve_write(&self, handle: Handle, fh: u64) -> Result<(Arc<Layer>, Arc<Inode>)> {
        if let Some((layer, inode)) = self.cached_open(fh) {
            if inode.num == handle.ino() && inode.layer == handle.layer() && !layer.is_snap() {
                return Ok((layer, inode));
            }
        }
        let layer = self.layer_of(handle)?;
        let inode = layer.get(handle.ino(), GetMode::Copy)?;
        // Refresh the handle cache so the next write skips the lookup.
        if fh != 0 {
            if let Some(open) = self.open_files.lock().get_mut(&fh) {
                open.layer = Arc::clone(&layer);
                open.inode = Arc::clone(&inode);
            }
        }
        Ok((layer, inode))
    }

    pub fn read(&self, handle: Handle, fh: u64, offset: u64, size: u32) -> Result<Vec<u8>> {
        self.ensure_running()?;
        let (_, inode) = self.resolve_read(handle, fh)?;
        let st = inode.read();
        if is_dir(st.stat.mode) {
            return Err(LcError::IsDirectory);
        }
        let file_size = st.stat.size;
        if offset >= file_size {
            return Ok(Vec::new());
        }
        let len = u64::from(size).min(file_size - offset) as usize;
        let mut out = vec![0_u8; len];
        let bs = u64::from(LC_BLOCK_SIZE);
        let mut pos = 0_usize;
        while pos < len {
            let byte = offset + pos as u64;
            let logical = byte / bs;
            let in_page = (byte % bs) as usize;
            let take = (bs as usize - in_page).min(len - pos);
            if let Some(page) = st.dpages.get(&logical) {
                out[pos..pos + take].copy_from_slice(&page[in_page..in_page + take]);
            } else {
                let slice = st.body.as_reg()?.resolve(logical, 1);
                if let Some(physical) = slice.first().and_then(|s| s.physical) {
                    let data = self.dev.read_block(physical)?;
                    out[pos..pos + take].copy_from_slice(&data[in_page..in_page + take]);
                }
                // Holes stay zeroed.
            }
            pos += take;
        }
        drop(st);
        // Track atime in memory only; it is not persisted on every read.
        inode.write().stat.atime = TimeSpec::now();
        Ok(out)
    }

    pub fn write(&self, handle: Handle, fh: u64, offset: u64, data: &[u8]) -> Result<u32> {
        self.ensure_running()?;
        if data.is_empty() {
            return Ok(0);
        }
        let (layer, inode) = self.resolve_write(handle, fh)?;
        let st = &mut *inode.write();
        if !is_reg(st.stat.mode) {
            return Err(LcError::Invalid("write on non-regular file".to_owned()));
        }
        let bs = u64::from(LC_BLOCK_SIZE);
        let mut pos = 0_usize;
        while pos < data.len() {
            let byte = offset + pos as u64;
            let logical = byte / bs;
            let in_page = (byte % bs) as usize;
            let take = (bs as usize - in_page).min(data.len() - pos);
            if let Some(page) = st.dpages.get_mut(&logical) {
                page[in_page..in_page + take].copy_from_slice(&data[pos..pos + take]);
            } else {
                let mut page = if in_page == 0 && take == bs as usize {
                    vec![0_u8; bs as usize]
                } else {
                    self.read_page(st, logical)?
                };
                page[in_page..in_page + take].copy_from_slice(&data[pos..pos + take]);
                st.dpages.insert(logical, page);
            }
            pos += take;
        }
        st.stat.size = st.stat.size.max(offset + data.len() as u64);
        st.stat.update_times(false, true, true);
        st.dirty = true;
        self.counters.writes.fetch_add(1, Ordering::Relaxed);

        // Bound work-in-progress: large dirty sets are written out
        // without waiting for the flusher.
        if st.dpages.len() >= lcfs_types::LC_CLUSTER_SIZE {
            layer.flush_dpages(st)?;
            layer.pages_flush()?;
        }
        Ok(data.len() as u32)
    }

    /// Existing content of one page, for read-modify-write.
    fn read_page(&self, st: &crate::inode::InodeState, logical: u64) -> Result<Vec<u8>> {
        let slice = st.body.as_reg()?.resolve(logical, 1);
        match slice.first().and_then(|s| s.physical) {
            Some(physical) => self.dev.read_block(physical),
            None => Ok(vec![0_u8; LC_BLOCK_SIZE as usize]),
        }
    }

    pub fn flush(&self, _handle: Handle, _fh: u64) -> Result<()> {
        // Writes are coalesced and flushed lazily; close is not a
        // durability point.
        self.ensure_running()
    }

    /// Durability point for one file: its layer's dirty state reaches
    /// the device.
    pub fn fsync(&self, handle: Handle, _fh: u64) -> Result<()> {
        self.ensure_running()?;
        let layer = self.layer_of(handle)?;
        if !layer.is_snap() {
            layer.sync_inodes()?;
            self.write_super()?;
        }
        self.dev.sync()
    }

    // ── Directories ─────────────────────────────────────────────────────

    pub fn readdir(&self, handle: Handle, offset: u64) -> Result<Vec<DirEntryOut>> {
        self.ensure_running()?;
        let layer = self.layer_of(handle)?;
        let inode = layer.get(handle.ino(), GetMode::Read)?;
        let st = inode.read();
        let body = st.body.as_dir()?;
        let mut out = Vec::new();
        if offset == 0 {
            out.push(DirEntryOut {
                handle,
                offset: 1,
                kind: dirent_kind(lcfs_types::S_IFDIR),
                name: b".".to_vec(),
            });
        }
        if offset <= 1 {
            out.push(DirEntryOut {
                handle: Handle::new(layer.index, st.parent),
                offset: 2,
                kind: dirent_kind(lcfs_types::S_IFDIR),
                name: b"..".to_vec(),
            });
        }
        let cookie = offset.saturating_sub(2);
        for (next, entry) in body.iterate(cookie) {
            out.push(DirEntryOut {
                handle: self.entry_handle(&layer, handle.ino(), entry.ino),
                offset: next + 2,
                kind: entry.kind,
                name: entry.name.clone(),
            });
        }
        Ok(out)
    }

    // ── Xattrs ──────────────────────────────────────────────────────────

    pub fn setxattr(&self, handle: Handle, name: &str, value: &[u8], flags: i32) -> Result<()> {
        self.ensure_running()?;
        let layer = self.layer_of(handle)?;
        let inode = layer.get(handle.ino(), GetMode::Copy)?;
        let st = &mut *inode.write();
        Arc::make_mut(&mut st.xattrs).set(name, value, flags)?;
        st.xattrdirty = true;
        st.dirty = true;
        st.stat.update_times(false, false, true);
        Ok(())
    }

    pub fn getxattr(&self, handle: Handle, name: &str) -> Result<Vec<u8>> {
        self.ensure_running()?;
        let layer = self.layer_of(handle)?;
        let inode = layer.get(handle.ino(), GetMode::Read)?;
        let st = inode.read();
        st.xattrs
            .get(name)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| LcError::not_found(name))
    }

    pub fn listxattr(&self, handle: Handle) -> Result<Vec<String>> {
        self.ensure_running()?;
        let layer = self.layer_of(handle)?;
        let inode = layer.get(handle.ino(), GetMode::Read)?;
        let st = inode.read();
        Ok(st.xattrs.names().into_iter().map(str::to_owned).collect())
    }

    pub fn removexattr(&self, handle: Handle, name: &str) -> Result<()> {
        self.ensure_running()?;
        let layer = self.layer_of(handle)?;
        let inode = layer.get(handle.ino(), GetMode::Copy)?;
        let st = &mut *inode.write();
        Arc::make_mut(&mut st.xattrs).remove(name)?;
        st.xattrdirty = true;
        st.dirty = true;
        st.stat.update_times(false, false, true);
        Ok(())
    }

    // ── statfs ──────────────────────────────────────────────────────────

    #[must_use]
    pub fn statfs(&self) -> FsStats {
        let pooled: u64 = self.all_layers().iter().map(|l| l.pooled_blocks()).sum();
        FsStats {
            blocks: self.dev.block_count(),
            bfree: self.galloc.free_blocks() + pooled,
            files: self.counters.inodes.load(Ordering::Relaxed),
            bsize: LC_BLOCK_SIZE,
            namelen: 255,
        }
    }
}

// ── Layer management ────────────────────────────────────────────────────────

impl Gfs {
    /// Register the directory under which layer operations arrive.
    /// Switching it while layers exist is almost certainly a caller bug;
    /// warn, drop the old root, and adopt the new one.
    pub fn set_snapshot_root(&self, ino: Ino) -> Result<()> {
        let base = self.base_layer()?;
        let inode = base.get(ino, GetMode::Read)?;
        if !is_dir(inode.read().stat.mode) {
            return Err(LcError::NotDirectory);
        }
        let mut snap_root = self.snap_root.lock();
        if snap_root.0 != 0 && *snap_root != ino {
            if self.layers.read().by_index.len() > 1 {
                warn!(
                    old = snap_root.0,
                    new = ino.0,
                    "snapshot root changed while layers are present"
                );
            }
            info!(old = snap_root.0, new = ino.0, "switching snapshot root");
        }
        *snap_root = ino;
        *self.snap_root_inode.lock() = Some(inode);
        Ok(())
    }

    #[must_use]
    pub fn snapshot_root(&self) -> Ino {
        *self.snap_root.lock()
    }

    /// Create a layer. With a parent, the parent is committed and frozen
    /// and the new root shares its directory tree; without one the layer
    /// starts empty. The layer appears as `name` under the snapshot root.
    pub fn create_layer(&self, name: &str, parent: Option<&str>, readonly: bool) -> Result<LayerIndex> {
        self.ensure_running()?;
        let snap_root = *self.snap_root.lock();
        if snap_root.0 == 0 {
            return Err(LcError::Invalid("snapshot root is not set".to_owned()));
        }
        if self.layer_by_name(name).is_ok() {
            return Err(LcError::Exists);
        }
        let parent_layer = match parent {
            Some(parent_name) => Some(self.layer_by_name(parent_name)?),
            None => None,
        };

        // A layer gains a child only after its state is on disk; from
        // then on it is immutable.
        if let Some(p) = &parent_layer {
            if !p.is_snap() {
                p.sync_inodes()?;
                p.freeze();
            }
            p.add_child();
        }

        let (index, layer) = {
            let mut table = self.layers.write();
            if table.next_index > LC_LAYER_MAX {
                return Err(LcError::Invalid("too many layers".to_owned()));
            }
            let index = LayerIndex(table.next_index);
            table.next_index += 1;
            let root = self.counters.alloc_ino();
            let layer = Layer::new(
                index,
                root,
                parent_layer.clone(),
                Arc::clone(&self.dev),
                Arc::clone(&self.counters),
                Arc::clone(&self.galloc),
                readonly,
            );
            table.by_index.insert(index.0, Arc::clone(&layer));
            (index, layer)
        };
        if parent_layer.is_some() {
            layer.root_init_from_parent()?;
        } else {
            layer.root_init();
        }

        // The layer's name lives as a directory entry of the snapshot
        // root in the base layer.
        let base = self.base_layer()?;
        let snap_dir = base.get(snap_root, GetMode::Copy)?;
        {
            let st = &mut *snap_dir.write();
            st.body
                .dir_mut()?
                .add(name.as_bytes(), layer.root, dirent_kind(lcfs_types::S_IFDIR))?;
            st.shared = false;
            st.stat.nlink += 1;
            st.stat.update_times(false, true, true);
            st.dirdirty = true;
            st.dirty = true;
        }
        info!(name, index = index.0, parent, readonly, "created layer");
        Ok(index)
    }

    /// Remove a layer. It must have no children. Nothing is flushed; all
    /// layer-local blocks return to the global pool.
    pub fn remove_layer(&self, name: &str) -> Result<()> {
        self.ensure_running()?;
        let layer = self.layer_by_name(name)?;
        if layer.index.0 == 0 {
            return Err(LcError::Invalid("cannot remove the base layer".to_owned()));
        }
        if layer.child_count() > 0 {
            return Err(LcError::Invalid(format!("layer {name} has children")));
        }

        let snap_root = *self.snap_root.lock();
        let base = self.base_layer()?;
        let snap_dir = base.get(snap_root, GetMode::Copy)?;
        {
            let st = &mut *snap_dir.write();
            st.body.dir_mut()?.remove(name.as_bytes());
            st.shared = false;
            st.stat.nlink = st.stat.nlink.saturating_sub(1);
            st.stat.update_times(false, true, true);
            st.dirdirty = true;
            st.dirty = true;
        }

        self.layers.write().by_index.remove(&layer.index.0);
        layer.destroy_inodes(true);
        layer.drain_pools();
        if let Some(parent) = &layer.parent {
            parent.drop_child();
        }
        // Persist the removal right away; a crash must not resurrect it.
        base.sync_inodes()?;
        self.write_super()?;
        info!(name, index = layer.index.0, "removed layer");
        Ok(())
    }

    /// Commit a layer: all of its dirty state reaches the device, then
    /// the superblock records the new shape. Idempotent.
    pub fn commit_layer(&self, name: &str) -> Result<()> {
        self.ensure_running()?;
        let layer = self.layer_by_name(name)?;
        layer.sync_inodes()?;
        // Layer names live in the base layer's snapshot root.
        self.base_layer()?.sync_inodes()?;
        self.write_super()?;
        self.dev.sync()?;
        debug!(name, "committed layer");
        Ok(())
    }

    pub fn layer_stats(&self, name: &str) -> Result<LayerStats> {
        self.ensure_running()?;
        Ok(self.layer_by_name(name)?.stats())
    }

    /// Decode and dispatch a layer-management control request arriving on
    /// a directory of the base layer.
    pub fn ioctl(&self, handle: Handle, cmd: u32, data: &[u8]) -> Result<Vec<u8>> {
        self.ensure_running()?;
        if handle.layer().0 != 0 {
            return Err(LcError::Invalid(
                "layer control outside the base layer".to_owned(),
            ));
        }
        // The first control request pins the snapshot root.
        if *self.snap_root.lock() != handle.ino() {
            self.set_snapshot_root(handle.ino())?;
        }
        let arg = std::str::from_utf8(data.split(|b| *b == 0).next().unwrap_or(data))
            .map_err(|_| LcError::Invalid("control argument is not UTF-8".to_owned()))?;
        match cmd {
            LC_IOC_CREATE | LC_IOC_CREATE_RO => {
                let (name, parent) = match arg.split_once('@') {
                    Some((name, parent)) if !parent.is_empty() => (name, Some(parent)),
                    Some((name, _)) => (name, None),
                    None => (arg, None),
                };
                self.create_layer(name, parent, cmd == LC_IOC_CREATE_RO)?;
                Ok(Vec::new())
            }
            LC_IOC_REMOVE => {
                self.remove_layer(arg)?;
                Ok(Vec::new())
            }
            LC_IOC_COMMIT => {
                self.commit_layer(arg)?;
                Ok(Vec::new())
            }
            LC_IOC_STAT => {
                let stats = self.layer_stats(arg)?;
                Ok(format!("{stats:?}").into_bytes())
            }
            other => Err(LcError::Invalid(format!("unknown control command {other}"))),
        }
    }
}

// ── Persistence ─────────────────────────────────────────────────────────────

impl Gfs {
    /// Flush every layer and write the superblock.
    pub fn sync_all(&self) -> Result<()> {
        for layer in self.all_layers() {
            layer.sync_inodes()?;
        }
        self.write_super()?;
        self.dev.sync()
    }

    /// Write the free-extent chain, the layer table, and block 0.
    ///
    /// Layer pools are drained back to the global map first so the
    /// persisted free list accounts for every unreferenced block; pools
    /// refill lazily afterwards.
    fn write_super(&self) -> Result<()> {
        let meta = &mut *self.commit_lock.lock();

        for block in meta.free_blocks.drain(..) {
            self.galloc.free(block, 1);
        }
        for block in meta.layer_blocks.drain(..) {
            self.galloc.free(block, 1);
        }
        let layers = self.all_layers();
        for layer in &layers {
            layer.drain_pools();
        }

        // Layer table chain.
        let records: Vec<ondisk::LayerRecord> = layers
            .iter()
            .map(|l| ondisk::LayerRecord {
                index: l.index.0,
                flags: if l.is_snap() { LC_LAYER_FLAG_SNAP } else { 0 },
                root: l.root.0,
                parent_root: l.parent.as_ref().map_or(0, |p| p.root.0),
                inode_head: l.chain_head().0,
            })
            .collect();
        let layer_block_count = records.len().div_ceil(LC_LAYER_PER_BLOCK).max(1);
        let mut layer_blocks = Vec::with_capacity(layer_block_count);
        for _ in 0..layer_block_count {
            let got = self.galloc.take_upto(1).ok_or(LcError::NoSpace)?;
            layer_blocks.push(got.start);
        }

        // Free-list chain: taking blocks from the head of the first
        // extent never grows the extent count, so this settles.
        let mut free_blocks: Vec<BlockNumber> = Vec::new();
        loop {
            let needed = self.galloc.snapshot().len().div_ceil(LC_FREE_PER_BLOCK);
            if free_blocks.len() >= needed {
                break;
            }
            let got = self.galloc.take_upto(1).ok_or(LcError::NoSpace)?;
            free_blocks.push(got.start);
        }

        // Everything is allocated; now the snapshots are final.
        let free_map = self.galloc.snapshot();
        let free_records: Vec<(u64, u64)> =
            free_map.iter().map(|e| (e.start.0, e.count)).collect();
        for (i, block) in free_blocks.iter().enumerate() {
            let chunk: Vec<(u64, u64)> = free_records
                .iter()
                .skip(i * LC_FREE_PER_BLOCK)
                .take(LC_FREE_PER_BLOCK)
                .copied()
                .collect();
            let next = free_blocks.get(i + 1).map_or(LC_INVALID_BLOCK, |b| b.0);
            let cb = ChainBlock::new(
                next,
                chunk.len() as u32,
                ondisk::encode_free_records(&chunk),
            );
            self.dev.write_block(*block, &cb.encode())?;
        }
        for (i, block) in layer_blocks.iter().enumerate() {
            let chunk: Vec<ondisk::LayerRecord> = records
                .iter()
                .skip(i * LC_LAYER_PER_BLOCK)
                .take(LC_LAYER_PER_BLOCK)
                .copied()
                .collect();
            let next = layer_blocks.get(i + 1).map_or(LC_INVALID_BLOCK, |b| b.0);
            let cb = ChainBlock::new(
                next,
                chunk.len() as u32,
                ondisk::encode_layer_records(&chunk),
            );
            self.dev.write_block(*block, &cb.encode())?;
        }

        let sb = Superblock {
            block_count: self.dev.block_count(),
            next_inode: self.counters.next_inode.load(Ordering::SeqCst),
            free_head: free_blocks.first().map_or(LC_INVALID_BLOCK, |b| b.0),
            layer_head: layer_blocks.first().map_or(LC_INVALID_BLOCK, |b| b.0),
            layer_count: records.len() as u32,
            inode_count: self.counters.inodes.load(Ordering::Relaxed),
            snap_root: self.snap_root.lock().0,
        };
        self.dev.write_block(BlockNumber(0), &sb.encode())?;

        meta.free_blocks = free_blocks;
        meta.layer_blocks = layer_blocks;
        debug!(
            layers = records.len(),
            free = free_map.total_blocks(),
            "wrote superblock"
        );
        Ok(())
    }
}

// ── Background flusher ──────────────────────────────────────────────────────

impl Gfs {
    /// Start the background flusher thread. It wakes on `interval` (or
    /// on shutdown) and writes out dirty file pages of writable layers.
    pub fn start_flusher(self: &Arc<Self>, interval: Duration) {
        let gfs = Arc::clone(self);
        let cond = Arc::clone(&self.flusher_cond);
        let join = std::thread::spawn(move || {
            let (lock, cvar) = &*cond;
            loop {
                {
                    let mut stop = lock.lock();
                    if !*stop {
                        cvar.wait_for(&mut stop, interval);
                    }
                    if *stop {
                        break;
                    }
                }
                if let Err(err) = gfs.flush_file_data() {
                    warn!(error = %err, "background flush failed");
                }
            }
            debug!("flusher exiting");
        });
        *self.flusher.lock() = Some(FlusherHandle { join });
    }

    fn stop_flusher(&self) {
        let handle = self.flusher.lock().take();
        if let Some(handle) = handle {
            let (lock, cvar) = &*self.flusher_cond;
            *lock.lock() = true;
            cvar.notify_all();
            let _ = handle.join.join();
        }
    }

    /// One flusher pass: dirty file pages of every writable layer reach
    /// the device (metadata stays lazy until commit).
    pub fn flush_file_data(&self) -> Result<()> {
        for layer in self.all_layers() {
            if layer.is_frozen() {
                continue;
            }
            for inode in layer.all_inodes() {
                let has_dpages = !inode.read().dpages.is_empty();
                if has_dpages {
                    let st = &mut *inode.write();
                    layer.flush_dpages(st)?;
                }
            }
            layer.pages_flush()?;
        }
        Ok(())
    }
}

impl Drop for Gfs {
    fn drop(&mut self) {
        self.stop_flusher();
    }
}

// ── Helpers on Layer used only by dispatch ──────────────────────────────────

impl Layer {
    pub(crate) fn pages_flush(&self) -> Result<()> {
        self.pages.flush(&*self.dev)
    }

    pub(crate) fn chain_head(&self) -> BlockNumber {
        self.chain.lock().head
    }
}
