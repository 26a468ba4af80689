//! On-disk record formats.
//!
//! Everything on disk lives in fixed-size blocks of `LC_BLOCK_SIZE` bytes.
//! Block 0 is the superblock; the rest are inode blocks, chained index and
//! overflow blocks, and raw data blocks. Multi-byte integers are
//! little-endian; the superblock version field gates any future layout
//! change.

use lcfs_error::{LcError, Result};
use lcfs_types::{
    read_u32, read_u64, BlockNumber, DecodeError, Ino, LC_BLOCK_SIZE, LC_INVALID_BLOCK,
};

/// Superblock magic ("LCFS").
pub const LC_SUPER_MAGIC: u32 = 0x4C43_4653;

/// Current on-disk format version.
pub const LC_VERSION: u32 = 1;

/// Size of the on-disk inode record at the front of an inode block.
pub const LC_DINODE_SIZE: usize = 128;

/// Header bytes of a chain block (`next` + `count` + pad).
pub const LC_CHAIN_HEADER: usize = 16;

/// Inode-block pointers per index block: `(block - next pointer) / 8`.
pub const LC_IBLOCK_MAX: usize = (LC_BLOCK_SIZE as usize - 8) / 8;

/// Free-extent records per free-list block.
pub const LC_FREE_PER_BLOCK: usize = (LC_BLOCK_SIZE as usize - LC_CHAIN_HEADER) / 16;

/// Layer records per layer-table block.
pub const LC_LAYER_PER_BLOCK: usize = (LC_BLOCK_SIZE as usize - LC_CHAIN_HEADER) / 32;

/// Block-map records per overflow block.
pub const LC_BMAP_PER_BLOCK: usize = (LC_BLOCK_SIZE as usize - LC_CHAIN_HEADER) / 24;

/// Bytes available for inline payload after the inode record.
pub const LC_INLINE_MAX: usize = LC_BLOCK_SIZE as usize - LC_DINODE_SIZE;

/// Layer record flag: layer was created read-only or has been snapshotted.
pub const LC_LAYER_FLAG_SNAP: u32 = 1;

fn bad(block: BlockNumber, detail: impl Into<String>) -> LcError {
    LcError::Corruption {
        block: block.0,
        detail: detail.into(),
    }
}

fn decode_err(block: BlockNumber, err: DecodeError) -> LcError {
    bad(block, err.to_string())
}

// ── Superblock ──────────────────────────────────────────────────────────────

/// Block 0. Field offsets:
///
/// ```text
/// 0x00 magic        u32    0x28 layer_count  u32
/// 0x04 version      u32    0x30 inode_count  u64
/// 0x08 block_count  u64    0x38 snap_root    u64
/// 0x10 next_inode   u64    0x40 checksum     u32
/// 0x18 free_head    u64
/// 0x20 layer_head   u64
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub block_count: u64,
    pub next_inode: u64,
    /// First block of the free-extent chain, `LC_INVALID_BLOCK` when empty.
    pub free_head: u64,
    /// First block of the layer-table chain.
    pub layer_head: u64,
    pub layer_count: u32,
    /// Live inode count. A hint only; not trusted across a crash.
    pub inode_count: u64,
    /// Snapshot-root inode number, 0 when unset.
    pub snap_root: u64,
}

impl Superblock {
    #[must_use]
    pub fn new(block_count: u64, next_inode: u64) -> Self {
        Self {
            block_count,
            next_inode,
            free_head: LC_INVALID_BLOCK,
            layer_head: LC_INVALID_BLOCK,
            layer_count: 0,
            inode_count: 0,
            snap_root: 0,
        }
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0_u8; LC_BLOCK_SIZE as usize];
        buf[0x00..0x04].copy_from_slice(&LC_SUPER_MAGIC.to_le_bytes());
        buf[0x04..0x08].copy_from_slice(&LC_VERSION.to_le_bytes());
        buf[0x08..0x10].copy_from_slice(&self.block_count.to_le_bytes());
        buf[0x10..0x18].copy_from_slice(&self.next_inode.to_le_bytes());
        buf[0x18..0x20].copy_from_slice(&self.free_head.to_le_bytes());
        buf[0x20..0x28].copy_from_slice(&self.layer_head.to_le_bytes());
        buf[0x28..0x2C].copy_from_slice(&self.layer_count.to_le_bytes());
        buf[0x30..0x38].copy_from_slice(&self.inode_count.to_le_bytes());
        buf[0x38..0x40].copy_from_slice(&self.snap_root.to_le_bytes());
        let csum = crc32fast::hash(&buf);
        buf[0x40..0x44].copy_from_slice(&csum.to_le_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let blk = BlockNumber(0);
        let magic = read_u32(data, 0x00).map_err(|e| decode_err(blk, e))?;
        if magic != LC_SUPER_MAGIC {
            return Err(bad(blk, format!("bad superblock magic {magic:#x}")));
        }
        let version = read_u32(data, 0x04).map_err(|e| decode_err(blk, e))?;
        if version != LC_VERSION {
            return Err(bad(blk, format!("unsupported format version {version}")));
        }
        let stored = read_u32(data, 0x40).map_err(|e| decode_err(blk, e))?;
        let mut copy = data.to_vec();
        copy[0x40..0x44].fill(0);
        if crc32fast::hash(&copy) != stored {
            return Err(bad(blk, "superblock checksum mismatch"));
        }
        Ok(Self {
            block_count: read_u64(data, 0x08).map_err(|e| decode_err(blk, e))?,
            next_inode: read_u64(data, 0x10).map_err(|e| decode_err(blk, e))?,
            free_head: read_u64(data, 0x18).map_err(|e| decode_err(blk, e))?,
            layer_head: read_u64(data, 0x20).map_err(|e| decode_err(blk, e))?,
            layer_count: read_u32(data, 0x28).map_err(|e| decode_err(blk, e))?,
            inode_count: read_u64(data, 0x30).map_err(|e| decode_err(blk, e))?,
            snap_root: read_u64(data, 0x38).map_err(|e| decode_err(blk, e))?,
        })
    }
}

// ── On-disk inode ───────────────────────────────────────────────────────────

/// The inode record at offset 0 of an inode block. Field offsets:
///
/// ```text
/// 0x00 ino      u64    0x30 atime_sec  i64    0x58 parent        u64
/// 0x08 mode     u32    0x38 mtime_sec  i64    0x60 extent_block  u64
/// 0x0C nlink    u32    0x40 ctime_sec  i64    0x68 extent_len    u64
/// 0x10 uid      u32    0x48 atime_nsec u32    0x70 bmap_dir      u64
/// 0x14 gid      u32    0x4C mtime_nsec u32    0x78 xattr         u64
/// 0x18 rdev     u32    0x50 ctime_nsec u32
/// 0x20 size     u64
/// 0x28 blocks   u64
/// ```
///
/// A mode of 0 is a tombstone: the inode was removed in this layer. For
/// symlinks the target immediately follows the record; small directories
/// store their entries inline the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskInode {
    pub ino: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub size: u64,
    pub blocks: u64,
    pub atime_sec: i64,
    pub mtime_sec: i64,
    pub ctime_sec: i64,
    pub atime_nsec: u32,
    pub mtime_nsec: u32,
    pub ctime_nsec: u32,
    pub parent: u64,
    pub extent_block: u64,
    pub extent_len: u64,
    pub bmap_dir_block: u64,
    pub xattr_block: u64,
}

impl DiskInode {
    /// Encode into the front of `block` (which must be a full block).
    pub fn encode_into(&self, block: &mut [u8]) {
        block[0x00..0x08].copy_from_slice(&self.ino.to_le_bytes());
        block[0x08..0x0C].copy_from_slice(&self.mode.to_le_bytes());
        block[0x0C..0x10].copy_from_slice(&self.nlink.to_le_bytes());
        block[0x10..0x14].copy_from_slice(&self.uid.to_le_bytes());
        block[0x14..0x18].copy_from_slice(&self.gid.to_le_bytes());
        block[0x18..0x1C].copy_from_slice(&self.rdev.to_le_bytes());
        block[0x20..0x28].copy_from_slice(&self.size.to_le_bytes());
        block[0x28..0x30].copy_from_slice(&self.blocks.to_le_bytes());
        block[0x30..0x38].copy_from_slice(&self.atime_sec.to_le_bytes());
        block[0x38..0x40].copy_from_slice(&self.mtime_sec.to_le_bytes());
        block[0x40..0x48].copy_from_slice(&self.ctime_sec.to_le_bytes());
        block[0x48..0x4C].copy_from_slice(&self.atime_nsec.to_le_bytes());
        block[0x4C..0x50].copy_from_slice(&self.mtime_nsec.to_le_bytes());
        block[0x50..0x54].copy_from_slice(&self.ctime_nsec.to_le_bytes());
        block[0x58..0x60].copy_from_slice(&self.parent.to_le_bytes());
        block[0x60..0x68].copy_from_slice(&self.extent_block.to_le_bytes());
        block[0x68..0x70].copy_from_slice(&self.extent_len.to_le_bytes());
        block[0x70..0x78].copy_from_slice(&self.bmap_dir_block.to_le_bytes());
        block[0x78..0x80].copy_from_slice(&self.xattr_block.to_le_bytes());
    }

    pub fn decode(block: BlockNumber, data: &[u8]) -> Result<Self> {
        let u32_at = |off| read_u32(data, off).map_err(|e| decode_err(block, e));
        let u64_at = |off| read_u64(data, off).map_err(|e| decode_err(block, e));
        let i64_at = |off: usize| u64_at(off).map(|v| v as i64);
        Ok(Self {
            ino: u64_at(0x00)?,
            mode: u32_at(0x08)?,
            nlink: u32_at(0x0C)?,
            uid: u32_at(0x10)?,
            gid: u32_at(0x14)?,
            rdev: u32_at(0x18)?,
            size: u64_at(0x20)?,
            blocks: u64_at(0x28)?,
            atime_sec: i64_at(0x30)?,
            mtime_sec: i64_at(0x38)?,
            ctime_sec: i64_at(0x40)?,
            atime_nsec: u32_at(0x48)?,
            mtime_nsec: u32_at(0x4C)?,
            ctime_nsec: u32_at(0x50)?,
            parent: u64_at(0x58)?,
            extent_block: u64_at(0x60)?,
            extent_len: u64_at(0x68)?,
            bmap_dir_block: u64_at(0x70)?,
            xattr_block: u64_at(0x78)?,
        })
    }

    /// A tombstone marks an inode removed in its layer.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.mode == 0
    }
}

// ── Chain blocks ────────────────────────────────────────────────────────────

/// Generic chained metadata block: `next` pointer, record count, payload.
///
/// Used for the free list, the layer table, and directory/bmap/xattr
/// overflow. The payload encoding is the caller's business.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainBlock {
    pub next: u64,
    pub payload: Vec<u8>,
    pub count: u32,
}

impl ChainBlock {
    #[must_use]
    pub fn new(next: u64, count: u32, payload: Vec<u8>) -> Self {
        Self {
            next,
            payload,
            count,
        }
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(self.payload.len() <= LC_BLOCK_SIZE as usize - LC_CHAIN_HEADER);
        let mut buf = vec![0_u8; LC_BLOCK_SIZE as usize];
        buf[0x00..0x08].copy_from_slice(&self.next.to_le_bytes());
        buf[0x08..0x0C].copy_from_slice(&self.count.to_le_bytes());
        buf[LC_CHAIN_HEADER..LC_CHAIN_HEADER + self.payload.len()]
            .copy_from_slice(&self.payload);
        buf
    }

    pub fn decode(block: BlockNumber, data: &[u8]) -> Result<Self> {
        let next = read_u64(data, 0x00).map_err(|e| decode_err(block, e))?;
        let count = read_u32(data, 0x08).map_err(|e| decode_err(block, e))?;
        Ok(Self {
            next,
            count,
            payload: data[LC_CHAIN_HEADER..].to_vec(),
        })
    }
}

// ── Typed chain records ─────────────────────────────────────────────────────

/// Free-list record: `{start u64, count u64}`.
pub fn encode_free_records(records: &[(u64, u64)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(records.len() * 16);
    for &(start, count) in records {
        out.extend_from_slice(&start.to_le_bytes());
        out.extend_from_slice(&count.to_le_bytes());
    }
    out
}

pub fn decode_free_records(
    block: BlockNumber,
    payload: &[u8],
    count: u32,
) -> Result<Vec<(u64, u64)>> {
    let mut out = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let off = i * 16;
        let start = read_u64(payload, off).map_err(|e| decode_err(block, e))?;
        let len = read_u64(payload, off + 8).map_err(|e| decode_err(block, e))?;
        out.push((start, len));
    }
    Ok(out)
}

/// A layer-table record (32 bytes):
/// `{index u32, flags u32, root u64, parent_root u64, inode_head u64}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerRecord {
    pub index: u32,
    pub flags: u32,
    pub root: u64,
    /// Root inode of the parent layer, 0 when the layer has no parent.
    pub parent_root: u64,
    /// First block of the layer's inode-block index chain.
    pub inode_head: u64,
}

pub fn encode_layer_records(records: &[LayerRecord]) -> Vec<u8> {
    let mut out = Vec::with_capacity(records.len() * 32);
    for rec in records {
        out.extend_from_slice(&rec.index.to_le_bytes());
        out.extend_from_slice(&rec.flags.to_le_bytes());
        out.extend_from_slice(&rec.root.to_le_bytes());
        out.extend_from_slice(&rec.parent_root.to_le_bytes());
        out.extend_from_slice(&rec.inode_head.to_le_bytes());
    }
    out
}

pub fn decode_layer_records(
    block: BlockNumber,
    payload: &[u8],
    count: u32,
) -> Result<Vec<LayerRecord>> {
    let mut out = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let off = i * 32;
        out.push(LayerRecord {
            index: read_u32(payload, off).map_err(|e| decode_err(block, e))?,
            flags: read_u32(payload, off + 4).map_err(|e| decode_err(block, e))?,
            root: read_u64(payload, off + 8).map_err(|e| decode_err(block, e))?,
            parent_root: read_u64(payload, off + 16).map_err(|e| decode_err(block, e))?,
            inode_head: read_u64(payload, off + 24).map_err(|e| decode_err(block, e))?,
        });
    }
    Ok(out)
}

// ── Inode-block index chain ─────────────────────────────────────────────────

/// An index block holds up to `LC_IBLOCK_MAX` pointers to inode blocks.
/// A pointer of 0 ends the list early; `LC_INVALID_BLOCK` marks a slot
/// whose inode block was reclaimed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexBlock {
    pub next: u64,
    pub slots: Vec<u64>,
}

impl IndexBlock {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(self.slots.len() <= LC_IBLOCK_MAX);
        let mut buf = vec![0_u8; LC_BLOCK_SIZE as usize];
        buf[0x00..0x08].copy_from_slice(&self.next.to_le_bytes());
        for (i, slot) in self.slots.iter().enumerate() {
            let off = 8 + i * 8;
            buf[off..off + 8].copy_from_slice(&slot.to_le_bytes());
        }
        buf
    }

    pub fn decode(block: BlockNumber, data: &[u8]) -> Result<Self> {
        let next = read_u64(data, 0x00).map_err(|e| decode_err(block, e))?;
        let mut slots = Vec::new();
        for i in 0..LC_IBLOCK_MAX {
            let val = read_u64(data, 8 + i * 8).map_err(|e| decode_err(block, e))?;
            if val == 0 {
                break;
            }
            slots.push(val);
        }
        Ok(Self { next, slots })
    }
}

// ── Directory entry records ─────────────────────────────────────────────────

/// Directory record: `{ino u64, kind u8, name_len u8, name bytes}`.
/// Used both inline after the inode record and in overflow chain blocks.
pub fn encode_dir_records(entries: &[(Ino, u8, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (ino, kind, name) in entries {
        out.extend_from_slice(&ino.0.to_le_bytes());
        out.push(*kind);
        out.push(name.len() as u8);
        out.extend_from_slice(name);
    }
    out
}

pub fn decode_dir_records(
    block: BlockNumber,
    payload: &[u8],
    count: u32,
) -> Result<Vec<(Ino, u8, Vec<u8>)>> {
    let mut out = Vec::with_capacity(count as usize);
    let mut off = 0_usize;
    for _ in 0..count {
        let ino = read_u64(payload, off).map_err(|e| decode_err(block, e))?;
        let rest = payload
            .get(off + 8..off + 10)
            .ok_or_else(|| bad(block, "truncated directory record"))?;
        let kind = rest[0];
        let name_len = rest[1] as usize;
        let name = payload
            .get(off + 10..off + 10 + name_len)
            .ok_or_else(|| bad(block, "truncated directory name"))?;
        out.push((Ino(ino), kind, name.to_vec()));
        off += 10 + name_len;
    }
    Ok(out)
}

/// Bytes a directory record occupies on disk.
#[must_use]
pub fn dir_record_size(name_len: usize) -> usize {
    10 + name_len
}

// ── Block-map records ───────────────────────────────────────────────────────

/// Sparse-map record: `{logical u64, physical u64, count u64}`.
pub fn encode_bmap_records(records: &[(u64, u64, u64)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(records.len() * 24);
    for &(logical, physical, count) in records {
        out.extend_from_slice(&logical.to_le_bytes());
        out.extend_from_slice(&physical.to_le_bytes());
        out.extend_from_slice(&count.to_le_bytes());
    }
    out
}

pub fn decode_bmap_records(
    block: BlockNumber,
    payload: &[u8],
    count: u32,
) -> Result<Vec<(u64, u64, u64)>> {
    let mut out = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let off = i * 24;
        out.push((
            read_u64(payload, off).map_err(|e| decode_err(block, e))?,
            read_u64(payload, off + 8).map_err(|e| decode_err(block, e))?,
            read_u64(payload, off + 16).map_err(|e| decode_err(block, e))?,
        ));
    }
    Ok(out)
}

// ── Xattr records ───────────────────────────────────────────────────────────

/// Xattr record: `{name_len u8, value_len u32, name bytes, value bytes}`.
pub fn encode_xattr_records(attrs: &[(String, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, value) in attrs {
        out.push(name.len() as u8);
        out.extend_from_slice(&(value.len() as u32).to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(value);
    }
    out
}

pub fn decode_xattr_records(
    block: BlockNumber,
    payload: &[u8],
    count: u32,
) -> Result<Vec<(String, Vec<u8>)>> {
    let mut out = Vec::with_capacity(count as usize);
    let mut off = 0_usize;
    for _ in 0..count {
        let name_len = *payload
            .get(off)
            .ok_or_else(|| bad(block, "truncated xattr record"))? as usize;
        let value_len = read_u32(payload, off + 1).map_err(|e| decode_err(block, e))? as usize;
        let name = payload
            .get(off + 5..off + 5 + name_len)
            .ok_or_else(|| bad(block, "truncated xattr name"))?;
        let value = payload
            .get(off + 5 + name_len..off + 5 + name_len + value_len)
            .ok_or_else(|| bad(block, "truncated xattr value"))?;
        let name = String::from_utf8(name.to_vec())
            .map_err(|_| bad(block, "xattr name is not UTF-8"))?;
        out.push((name, value.to_vec()));
        off += 5 + name_len + value_len;
    }
    Ok(out)
}

/// Bytes an xattr record occupies on disk.
#[must_use]
pub fn xattr_record_size(name_len: usize, value_len: usize) -> usize {
    5 + name_len + value_len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superblock_round_trip() {
        let mut sb = Superblock::new(1024, 17);
        sb.free_head = 9;
        sb.layer_head = 10;
        sb.layer_count = 3;
        sb.inode_count = 12;
        sb.snap_root = 4;
        let buf = sb.encode();
        assert_eq!(buf.len(), LC_BLOCK_SIZE as usize);
        let decoded = Superblock::decode(&buf).unwrap();
        assert_eq!(decoded, sb);
    }

    #[test]
    fn superblock_rejects_corruption() {
        let sb = Superblock::new(1024, 17);
        let mut buf = sb.encode();
        buf[0x08] ^= 0xFF;
        assert!(matches!(
            Superblock::decode(&buf),
            Err(LcError::Corruption { .. })
        ));

        let mut bad_magic = sb.encode();
        bad_magic[0] = 0;
        assert!(Superblock::decode(&bad_magic).is_err());
    }

    #[test]
    fn dinode_round_trip() {
        let di = DiskInode {
            ino: 42,
            mode: 0o100_644,
            nlink: 1,
            uid: 1000,
            gid: 1000,
            rdev: 0,
            size: 5,
            blocks: 1,
            atime_sec: 1_700_000_000,
            mtime_sec: 1_700_000_001,
            ctime_sec: 1_700_000_002,
            atime_nsec: 1,
            mtime_nsec: 2,
            ctime_nsec: 3,
            parent: 1,
            extent_block: 77,
            extent_len: 1,
            bmap_dir_block: LC_INVALID_BLOCK,
            xattr_block: LC_INVALID_BLOCK,
        };
        let mut block = vec![0_u8; LC_BLOCK_SIZE as usize];
        di.encode_into(&mut block);
        let decoded = DiskInode::decode(BlockNumber(7), &block).unwrap();
        assert_eq!(decoded, di);
        assert!(!decoded.is_tombstone());
    }

    #[test]
    fn tombstone_is_mode_zero() {
        let mut block = vec![0_u8; LC_BLOCK_SIZE as usize];
        let di = DiskInode::decode(BlockNumber(7), &block).unwrap();
        assert!(di.is_tombstone());
        block[0x08] = 0o644_u32 as u8;
        let di = DiskInode::decode(BlockNumber(7), &block).unwrap();
        assert!(!di.is_tombstone());
    }

    #[test]
    fn chain_block_round_trip() {
        let payload = encode_free_records(&[(10, 5), (100, 200)]);
        let cb = ChainBlock::new(33, 2, payload);
        let buf = cb.encode();
        let decoded = ChainBlock::decode(BlockNumber(1), &buf).unwrap();
        assert_eq!(decoded.next, 33);
        assert_eq!(decoded.count, 2);
        let records = decode_free_records(BlockNumber(1), &decoded.payload, 2).unwrap();
        assert_eq!(records, vec![(10, 5), (100, 200)]);
    }

    #[test]
    fn layer_records_round_trip() {
        let records = vec![
            LayerRecord {
                index: 0,
                flags: 0,
                root: 1,
                parent_root: 0,
                inode_head: 12,
            },
            LayerRecord {
                index: 3,
                flags: LC_LAYER_FLAG_SNAP,
                root: 90,
                parent_root: 1,
                inode_head: LC_INVALID_BLOCK,
            },
        ];
        let payload = encode_layer_records(&records);
        let decoded = decode_layer_records(BlockNumber(2), &payload, 2).unwrap();
        assert_eq!(decoded, records);
    }

    #[test]
    fn index_block_round_trip_stops_at_zero() {
        let ib = IndexBlock {
            next: LC_INVALID_BLOCK,
            slots: vec![5, LC_INVALID_BLOCK, 9],
        };
        let buf = ib.encode();
        let decoded = IndexBlock::decode(BlockNumber(3), &buf).unwrap();
        assert_eq!(decoded.slots, vec![5, LC_INVALID_BLOCK, 9]);
        assert_eq!(decoded.next, LC_INVALID_BLOCK);
    }

    #[test]
    fn dir_records_round_trip() {
        let entries = vec![
            (Ino(5), 4_u8, b"home".to_vec()),
            (Ino(6), 8_u8, b"a.txt".to_vec()),
        ];
        let payload = encode_dir_records(&entries);
        let decoded = decode_dir_records(BlockNumber(4), &payload, 2).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn dir_records_reject_truncation() {
        let payload = encode_dir_records(&[(Ino(5), 4, b"home".to_vec())]);
        let truncated = &payload[..payload.len() - 1];
        assert!(decode_dir_records(BlockNumber(4), truncated, 1).is_err());
    }

    #[test]
    fn bmap_records_round_trip() {
        let records = vec![(0, 100, 4), (8, 300, 2)];
        let payload = encode_bmap_records(&records);
        let decoded = decode_bmap_records(BlockNumber(5), &payload, 2).unwrap();
        assert_eq!(decoded, records);
    }

    #[test]
    fn xattr_records_round_trip() {
        let attrs = vec![
            ("user.k".to_owned(), b"v".to_vec()),
            ("security.selinux".to_owned(), vec![0_u8; 32]),
        ];
        let payload = encode_xattr_records(&attrs);
        let decoded = decode_xattr_records(BlockNumber(6), &payload, 2).unwrap();
        assert_eq!(decoded, attrs);
    }

    #[test]
    fn capacities_fit_in_a_block() {
        assert_eq!(LC_IBLOCK_MAX, 511);
        assert_eq!(LC_FREE_PER_BLOCK, 255);
        assert_eq!(LC_LAYER_PER_BLOCK, 127);
        assert!(LC_BMAP_PER_BLOCK * 24 + LC_CHAIN_HEADER <= LC_BLOCK_SIZE as usize);
    }
}
