#![forbid(unsafe_code)]
//! End-to-end test support for LCFS.
//!
//! The helpers here drive a mounted filesystem through its dispatch
//! surface and verify global invariants by walking the raw device, the
//! same way a recovery tool would: every block must be either on the
//! free list or reachable from exactly the metadata that owns it.

use anyhow::{bail, ensure, Context, Result};
use lcfs_block::BlockDevice;
use lcfs_core::ondisk::{
    ChainBlock, DiskInode, IndexBlock, Superblock, LC_DINODE_SIZE,
};
use lcfs_types::{is_dir, is_reg, BlockNumber, FileKind, LC_INVALID_BLOCK};
use std::collections::BTreeSet;

/// Everything the on-disk walk found for one inode.
#[derive(Debug, Clone)]
pub struct DiskInodeRef {
    pub layer_index: u32,
    pub block: BlockNumber,
    pub dinode: DiskInode,
}

/// Decode the superblock from block 0.
pub fn read_superblock(dev: &dyn BlockDevice) -> Result<Superblock> {
    Superblock::decode(&dev.read_block(BlockNumber(0))?).context("decoding superblock")
}

fn walk_chain(dev: &dyn BlockDevice, head: u64) -> Result<Vec<(BlockNumber, ChainBlock)>> {
    let mut out = Vec::new();
    let mut block = head;
    while block != LC_INVALID_BLOCK {
        let bn = BlockNumber(block);
        let cb = ChainBlock::decode(bn, &dev.read_block(bn)?)?;
        let next = cb.next;
        out.push((bn, cb));
        block = next;
        ensure!(out.len() as u64 <= dev.block_count(), "chain cycle");
    }
    Ok(out)
}

/// All persisted inodes, per layer, by walking the layer table and each
/// layer's inode-block index chain.
pub fn walk_inodes(dev: &dyn BlockDevice) -> Result<Vec<DiskInodeRef>> {
    let sb = read_superblock(dev)?;
    let mut out = Vec::new();
    for (table_block, cb) in walk_chain(dev, sb.layer_head)? {
        let records =
            lcfs_core::ondisk::decode_layer_records(table_block, &cb.payload, cb.count)?;
        for rec in records {
            let mut index_block = rec.inode_head;
            while index_block != LC_INVALID_BLOCK {
                let bn = BlockNumber(index_block);
                let ib = IndexBlock::decode(bn, &dev.read_block(bn)?)?;
                for slot in &ib.slots {
                    if *slot == LC_INVALID_BLOCK {
                        continue;
                    }
                    let iblock = BlockNumber(*slot);
                    let dinode = DiskInode::decode(iblock, &dev.read_block(iblock)?)?;
                    out.push(DiskInodeRef {
                        layer_index: rec.index,
                        block: iblock,
                        dinode,
                    });
                }
                index_block = ib.next;
            }
        }
    }
    Ok(out)
}

/// Find a persisted inode by number within one layer.
pub fn find_dinode(dev: &dyn BlockDevice, layer_index: u32, ino: u64) -> Result<DiskInodeRef> {
    walk_inodes(dev)?
        .into_iter()
        .find(|r| r.layer_index == layer_index && r.dinode.ino == ino)
        .with_context(|| format!("inode {ino} not on disk in layer {layer_index}"))
}

fn insert_range(set: &mut BTreeSet<u64>, start: u64, count: u64) {
    for b in start..start + count {
        set.insert(b);
    }
}

/// Free-list conservation: at a stable point (after a commit), every
/// device block is either on the persisted free list or reachable from
/// the superblock through exactly the metadata that owns it, and the two
/// sets never overlap. Data extents shared between layers count once.
pub fn assert_block_conservation(dev: &dyn BlockDevice) -> Result<()> {
    let sb = read_superblock(dev)?;
    let mut free = BTreeSet::new();
    let mut used = BTreeSet::new();
    used.insert(0_u64); // superblock

    for (block, cb) in walk_chain(dev, sb.free_head)? {
        used.insert(block.0);
        for (start, count) in
            lcfs_core::ondisk::decode_free_records(block, &cb.payload, cb.count)?
        {
            insert_range(&mut free, start, count);
        }
    }

    for (block, cb) in walk_chain(dev, sb.layer_head)? {
        used.insert(block.0);
        let records = lcfs_core::ondisk::decode_layer_records(block, &cb.payload, cb.count)?;
        for rec in records {
            let mut index_block = rec.inode_head;
            while index_block != LC_INVALID_BLOCK {
                let bn = BlockNumber(index_block);
                used.insert(bn.0);
                let ib = IndexBlock::decode(bn, &dev.read_block(bn)?)?;
                for slot in &ib.slots {
                    if *slot == LC_INVALID_BLOCK {
                        continue;
                    }
                    let iblock = BlockNumber(*slot);
                    used.insert(iblock.0);
                    let di = DiskInode::decode(iblock, &dev.read_block(iblock)?)?;
                    if di.is_tombstone() {
                        continue;
                    }
                    account_inode(dev, &di, &mut used)?;
                }
                index_block = ib.next;
            }
        }
    }

    if let Some(overlap) = free.intersection(&used).next() {
        bail!("block {overlap} is both free and referenced");
    }
    let covered = free.len() as u64 + used.len() as u64;
    ensure!(
        covered == dev.block_count(),
        "leaked blocks: {} free + {} used != {} total",
        free.len(),
        used.len(),
        dev.block_count()
    );
    Ok(())
}

fn account_inode(dev: &dyn BlockDevice, di: &DiskInode, used: &mut BTreeSet<u64>) -> Result<()> {
    if is_reg(di.mode) {
        if di.extent_len > 0 {
            insert_range(used, di.extent_block, di.extent_len);
        } else if di.bmap_dir_block != LC_INVALID_BLOCK {
            for (block, cb) in walk_chain(dev, di.bmap_dir_block)? {
                used.insert(block.0);
                for (_, physical, count) in
                    lcfs_core::ondisk::decode_bmap_records(block, &cb.payload, cb.count)?
                {
                    insert_range(used, physical, count);
                }
            }
        }
    } else if is_dir(di.mode) && di.bmap_dir_block != LC_INVALID_BLOCK {
        for (block, _) in walk_chain(dev, di.bmap_dir_block)? {
            used.insert(block.0);
        }
    }
    if di.xattr_block != LC_INVALID_BLOCK {
        for (block, _) in walk_chain(dev, di.xattr_block)? {
            used.insert(block.0);
        }
    }
    Ok(())
}

/// The persisted free list must be sorted, disjoint, and coalesced:
/// freeing adjacent blocks in any order yields single extents.
pub fn assert_free_list_coalesced(dev: &dyn BlockDevice) -> Result<()> {
    let sb = read_superblock(dev)?;
    let mut records = Vec::new();
    for (block, cb) in walk_chain(dev, sb.free_head)? {
        records.extend(lcfs_core::ondisk::decode_free_records(
            block,
            &cb.payload,
            cb.count,
        )?);
    }
    for pair in records.windows(2) {
        let (a_start, a_count) = pair[0];
        let (b_start, _) = pair[1];
        ensure!(
            a_start + a_count < b_start,
            "free extents ({a_start},{a_count}) and ({b_start},..) touch or overlap"
        );
    }
    Ok(())
}

/// Directory entries of a persisted inode, inline or chained.
pub fn read_disk_dir_entries(
    dev: &dyn BlockDevice,
    inode: &DiskInodeRef,
) -> Result<Vec<(u64, FileKind, String)>> {
    ensure!(is_dir(inode.dinode.mode), "inode {} is not a directory", inode.dinode.ino);
    let mut records = Vec::new();
    if inode.dinode.bmap_dir_block != LC_INVALID_BLOCK {
        for (block, cb) in walk_chain(dev, inode.dinode.bmap_dir_block)? {
            records.extend(lcfs_core::ondisk::decode_dir_records(
                block, &cb.payload, cb.count,
            )?);
        }
    } else {
        let data = dev.read_block(inode.block)?;
        let count = lcfs_types::read_u32(&data, LC_DINODE_SIZE)
            .map_err(|e| anyhow::anyhow!("inline count: {e}"))?;
        records.extend(lcfs_core::ondisk::decode_dir_records(
            inode.block,
            &data[LC_DINODE_SIZE + 4..],
            count,
        )?);
    }
    Ok(records
        .into_iter()
        .map(|(ino, kind, name)| {
            (
                ino.0,
                lcfs_core::dir::kind_from_dirent(kind),
                String::from_utf8_lossy(&name).into_owned(),
            )
        })
        .collect())
}
