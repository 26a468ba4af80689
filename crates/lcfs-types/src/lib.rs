#![forbid(unsafe_code)]
//! Shared identifiers and constants for LCFS.
//!
//! Newtype wrappers keep block numbers, inode numbers, and layer indexes
//! from being mixed up at call sites, and carry the checked arithmetic
//! used throughout the workspace.

use std::fmt;
use thiserror::Error;

/// Fixed device block size in bytes.
pub const LC_BLOCK_SIZE: u32 = 4096;

/// Number of inode hash buckets per layer.
pub const LC_ICACHE_SIZE: usize = 1024;

/// Maximum pages accumulated in a flush cluster before it is emitted.
pub const LC_CLUSTER_SIZE: usize = 256;

/// Inode blocks reserved from the metadata pool per grab, so consecutive
/// dirty inodes land on consecutive device blocks.
pub const LC_INODE_CLUSTER_SIZE: u64 = 32;

/// Blocks pulled from the global free pool into a layer pool per refill.
pub const LC_SLAB_SIZE: u64 = 256;

/// Directory bodies convert from a linear list to hash buckets above this
/// entry count.
pub const LC_DIR_HASH_THRESHOLD: usize = 32;

/// Name-hash buckets for wide directories.
pub const LC_DIRCACHE_SIZE: usize = 512;

/// Sentinel for "no block".
pub const LC_INVALID_BLOCK: u64 = u64::MAX;

/// Inode number of every layer's root directory handle space; the base
/// layer's root directory uses this number directly.
pub const LC_ROOT_INODE: u64 = 1;

/// Maximum number of live layers (the handle encoding reserves 16 bits).
pub const LC_LAYER_MAX: u32 = u16::MAX as u32;

/// Bits of a request handle that carry the inode number; the upper bits
/// carry the layer index.
pub const LC_HANDLE_INO_BITS: u32 = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockNumber(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ino(pub u64);

/// Global index of a mounted layer. Indexes increase monotonically and are
/// never reused while the filesystem is mounted, so a parent's index is
/// always lower than any child's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LayerIndex(pub u32);

impl BlockNumber {
    pub const INVALID: Self = Self(LC_INVALID_BLOCK);

    #[must_use]
    pub fn is_valid(self) -> bool {
        self.0 != LC_INVALID_BLOCK
    }

    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }

    /// Byte offset of this block for the fixed block size.
    #[must_use]
    pub fn byte_offset(self) -> Option<u64> {
        self.0.checked_mul(u64::from(LC_BLOCK_SIZE))
    }
}

impl Ino {
    pub const ROOT: Self = Self(LC_ROOT_INODE);

    #[must_use]
    pub fn is_root(self) -> bool {
        self.0 == LC_ROOT_INODE
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Ino {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for LayerIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Request handles ─────────────────────────────────────────────────────────

/// A request handle packs the owning layer index into the upper bits of the
/// inode number handed to the transport, so every request self-identifies
/// its layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub u64);

impl Handle {
    /// The transport's root handle: base layer, root inode.
    pub const ROOT: Self = Self(LC_ROOT_INODE);

    #[must_use]
    pub fn new(layer: LayerIndex, ino: Ino) -> Self {
        debug_assert!(ino.0 < (1 << LC_HANDLE_INO_BITS));
        Self((u64::from(layer.0) << LC_HANDLE_INO_BITS) | ino.0)
    }

    #[must_use]
    pub fn layer(self) -> LayerIndex {
        #[allow(clippy::cast_possible_truncation)]
        LayerIndex((self.0 >> LC_HANDLE_INO_BITS) as u32)
    }

    #[must_use]
    pub fn ino(self) -> Ino {
        Ino(self.0 & ((1 << LC_HANDLE_INO_BITS) - 1))
    }
}

// ── File kinds ──────────────────────────────────────────────────────────────

/// File type mask (upper bits of mode).
pub const S_IFMT: u32 = 0o170_000;
/// Named pipe (FIFO).
pub const S_IFIFO: u32 = 0o010_000;
/// Character device.
pub const S_IFCHR: u32 = 0o020_000;
/// Directory.
pub const S_IFDIR: u32 = 0o040_000;
/// Block device.
pub const S_IFBLK: u32 = 0o060_000;
/// Regular file.
pub const S_IFREG: u32 = 0o100_000;
/// Symbolic link.
pub const S_IFLNK: u32 = 0o120_000;
/// Socket.
pub const S_IFSOCK: u32 = 0o140_000;

/// Kind of an inode, derived from the mode bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    /// Block/char devices, fifos and sockets; carry an rdev and no body.
    Special,
}

impl FileKind {
    /// Derive the kind from a full mode value. A mode of 0 (tombstone) has
    /// no kind; callers filter tombstones before this.
    #[must_use]
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFDIR => Self::Directory,
            S_IFLNK => Self::Symlink,
            S_IFREG => Self::Regular,
            _ => Self::Special,
        }
    }
}

#[must_use]
pub fn is_dir(mode: u32) -> bool {
    mode & S_IFMT == S_IFDIR
}

#[must_use]
pub fn is_reg(mode: u32) -> bool {
    mode & S_IFMT == S_IFREG
}

#[must_use]
pub fn is_symlink(mode: u32) -> bool {
    mode & S_IFMT == S_IFLNK
}

// ── Byte helpers ────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], DecodeError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(DecodeError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };
    if end > data.len() {
        return Err(DecodeError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    Ok(&data[offset..end])
}

#[inline]
pub fn read_u16(data: &[u8], offset: usize) -> Result<u16, DecodeError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_u32(data: &[u8], offset: usize) -> Result<u32, DecodeError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_u64(data: &[u8], offset: usize) -> Result<u64, DecodeError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

/// Number of blocks needed to hold `bytes` bytes.
#[must_use]
pub fn blocks_for(bytes: u64) -> u64 {
    bytes.div_ceil(u64::from(LC_BLOCK_SIZE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_packs_layer_and_ino() {
        let h = Handle::new(LayerIndex(7), Ino(42));
        assert_eq!(h.layer(), LayerIndex(7));
        assert_eq!(h.ino(), Ino(42));

        let root = Handle::ROOT;
        assert_eq!(root.layer(), LayerIndex(0));
        assert_eq!(root.ino(), Ino::ROOT);
    }

    #[test]
    fn handle_max_layer() {
        let h = Handle::new(LayerIndex(LC_LAYER_MAX), Ino((1 << LC_HANDLE_INO_BITS) - 1));
        assert_eq!(h.layer(), LayerIndex(LC_LAYER_MAX));
        assert_eq!(h.ino(), Ino((1 << LC_HANDLE_INO_BITS) - 1));
    }

    #[test]
    fn file_kind_from_mode() {
        assert_eq!(FileKind::from_mode(S_IFDIR | 0o755), FileKind::Directory);
        assert_eq!(FileKind::from_mode(S_IFREG | 0o644), FileKind::Regular);
        assert_eq!(FileKind::from_mode(S_IFLNK | 0o777), FileKind::Symlink);
        assert_eq!(FileKind::from_mode(S_IFCHR | 0o600), FileKind::Special);
        assert_eq!(FileKind::from_mode(S_IFIFO | 0o600), FileKind::Special);
    }

    #[test]
    fn read_helpers() {
        let bytes = [0x34_u8, 0x12, 0x78, 0x56, 0xEF, 0xCD, 0xAB, 0x90];
        assert_eq!(read_u16(&bytes, 0).expect("u16"), 0x1234);
        assert_eq!(read_u32(&bytes, 0).expect("u32"), 0x5678_1234);
        assert_eq!(read_u64(&bytes, 0).expect("u64"), 0x90AB_CDEF_5678_1234);
        assert!(read_u32(&bytes, 6).is_err());
    }

    #[test]
    fn blocks_for_rounds_up() {
        assert_eq!(blocks_for(0), 0);
        assert_eq!(blocks_for(1), 1);
        assert_eq!(blocks_for(4096), 1);
        assert_eq!(blocks_for(4097), 2);
    }

    #[test]
    fn block_number_validity() {
        assert!(BlockNumber(0).is_valid());
        assert!(!BlockNumber::INVALID.is_valid());
        assert_eq!(BlockNumber(2).byte_offset(), Some(8192));
        assert_eq!(BlockNumber(u64::MAX / 2).byte_offset(), None);
    }
}
