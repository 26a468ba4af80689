#![forbid(unsafe_code)]
//! Block I/O layer.
//!
//! Provides the `BlockDevice` trait with aligned whole-block reads and
//! writes plus clustered sequential writes, a file-backed implementation
//! using `pread`/`pwrite` style I/O, and an in-memory device for tests.

use lcfs_error::{LcError, Result};
use lcfs_types::{BlockNumber, LC_BLOCK_SIZE};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Block-addressed I/O interface.
///
/// All buffers are exactly one block long; implementations fail with an
/// `Io` error on short reads or writes. The device performs no caching of
/// its own.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, block: BlockNumber) -> Result<Vec<u8>>;

    /// Write a block by number. `data.len()` MUST equal the block size.
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Write `bufs` to consecutive blocks starting at `first`.
    ///
    /// The default implementation degrades to scalar writes; file-backed
    /// devices override this with a single contiguous write.
    fn write_cluster(&self, first: BlockNumber, bufs: &[Vec<u8>]) -> Result<()> {
        for (i, buf) in bufs.iter().enumerate() {
            let block = first.checked_add(i as u64).ok_or_else(|| {
                LcError::Invalid(format!("cluster write overflows at block {first}"))
            })?;
            self.write_block(block, buf)?;
        }
        Ok(())
    }

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn check_block_len(data: &[u8]) -> Result<()> {
    if data.len() != LC_BLOCK_SIZE as usize {
        return Err(LcError::Invalid(format!(
            "buffer length {} is not the block size",
            data.len()
        )));
    }
    Ok(())
}

// ── File-backed device ──────────────────────────────────────────────────────

/// Device backed by a regular file or raw block device node.
///
/// Uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position.
#[derive(Debug)]
pub struct FileBlockDevice {
    file: Arc<File>,
    blocks: u64,
}

impl FileBlockDevice {
    /// Open an existing device file. The file length is truncated down to
    /// a whole number of blocks.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        let blocks = len / u64::from(LC_BLOCK_SIZE);
        if blocks == 0 {
            return Err(LcError::Invalid(format!(
                "device {} is smaller than one block",
                path.as_ref().display()
            )));
        }
        Ok(Self {
            file: Arc::new(file),
            blocks,
        })
    }

    /// Create (or truncate) a device file of `blocks` blocks.
    pub fn create(path: impl AsRef<Path>, blocks: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        let len = blocks
            .checked_mul(u64::from(LC_BLOCK_SIZE))
            .ok_or_else(|| LcError::Invalid("device size overflows u64".to_owned()))?;
        file.set_len(len)?;
        Ok(Self {
            file: Arc::new(file),
            blocks,
        })
    }

    fn offset_of(&self, block: BlockNumber) -> Result<u64> {
        if block.0 >= self.blocks {
            return Err(LcError::Invalid(format!(
                "block {block} out of range (device has {} blocks)",
                self.blocks
            )));
        }
        block
            .byte_offset()
            .ok_or_else(|| LcError::Invalid(format!("block {block} offset overflows u64")))
    }
}

impl BlockDevice for FileBlockDevice {
    fn read_block(&self, block: BlockNumber) -> Result<Vec<u8>> {
        let offset = self.offset_of(block)?;
        let mut buf = vec![0_u8; LC_BLOCK_SIZE as usize];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        check_block_len(data)?;
        let offset = self.offset_of(block)?;
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    fn write_cluster(&self, first: BlockNumber, bufs: &[Vec<u8>]) -> Result<()> {
        if bufs.is_empty() {
            return Ok(());
        }
        let last = first
            .checked_add(bufs.len() as u64 - 1)
            .ok_or_else(|| LcError::Invalid(format!("cluster at {first} overflows u64")))?;
        let offset = self.offset_of(first)?;
        self.offset_of(last)?;
        trace!(first = first.0, count = bufs.len(), "cluster write");
        let mut joined = Vec::with_capacity(bufs.len() * LC_BLOCK_SIZE as usize);
        for buf in bufs {
            check_block_len(buf)?;
            joined.extend_from_slice(buf);
        }
        self.file.write_all_at(&joined, offset)?;
        Ok(())
    }

    fn block_count(&self) -> u64 {
        self.blocks
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

// ── In-memory device ────────────────────────────────────────────────────────

/// Sparse in-memory device. Unwritten blocks read as zeroes.
#[derive(Debug)]
pub struct MemBlockDevice {
    blocks: u64,
    data: Mutex<HashMap<u64, Vec<u8>>>,
}

impl MemBlockDevice {
    #[must_use]
    pub fn new(blocks: u64) -> Self {
        Self {
            blocks,
            data: Mutex::new(HashMap::new()),
        }
    }

    fn check_range(&self, block: BlockNumber) -> Result<()> {
        if block.0 >= self.blocks {
            return Err(LcError::Invalid(format!(
                "block {block} out of range (device has {} blocks)",
                self.blocks
            )));
        }
        Ok(())
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&self, block: BlockNumber) -> Result<Vec<u8>> {
        self.check_range(block)?;
        let data = self.data.lock();
        Ok(data
            .get(&block.0)
            .cloned()
            .unwrap_or_else(|| vec![0_u8; LC_BLOCK_SIZE as usize]))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        check_block_len(data)?;
        self.check_range(block)?;
        self.data.lock().insert(block.0, data.to_vec());
        Ok(())
    }

    fn block_count(&self) -> u64 {
        self.blocks
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_of(byte: u8) -> Vec<u8> {
        vec![byte; LC_BLOCK_SIZE as usize]
    }

    #[test]
    fn mem_device_round_trip() {
        let dev = MemBlockDevice::new(16);
        dev.write_block(BlockNumber(3), &block_of(0xAB)).unwrap();
        assert_eq!(dev.read_block(BlockNumber(3)).unwrap(), block_of(0xAB));
        // Unwritten blocks read back zeroed.
        assert_eq!(dev.read_block(BlockNumber(4)).unwrap(), block_of(0));
    }

    #[test]
    fn mem_device_rejects_out_of_range() {
        let dev = MemBlockDevice::new(4);
        assert!(dev.read_block(BlockNumber(4)).is_err());
        assert!(dev.write_block(BlockNumber(9), &block_of(1)).is_err());
    }

    #[test]
    fn mem_device_rejects_short_buffer() {
        let dev = MemBlockDevice::new(4);
        assert!(dev.write_block(BlockNumber(0), &[0_u8; 100]).is_err());
    }

    #[test]
    fn cluster_write_lands_sequentially() {
        let dev = MemBlockDevice::new(16);
        let bufs = vec![block_of(1), block_of(2), block_of(3)];
        dev.write_cluster(BlockNumber(5), &bufs).unwrap();
        assert_eq!(dev.read_block(BlockNumber(5)).unwrap(), block_of(1));
        assert_eq!(dev.read_block(BlockNumber(6)).unwrap(), block_of(2));
        assert_eq!(dev.read_block(BlockNumber(7)).unwrap(), block_of(3));
    }

    #[test]
    fn file_device_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev.img");
        let dev = FileBlockDevice::create(&path, 32).unwrap();
        assert_eq!(dev.block_count(), 32);

        dev.write_block(BlockNumber(0), &block_of(0x5A)).unwrap();
        dev.write_cluster(BlockNumber(1), &[block_of(1), block_of(2)])
            .unwrap();
        dev.sync().unwrap();
        drop(dev);

        let dev = FileBlockDevice::open(&path).unwrap();
        assert_eq!(dev.block_count(), 32);
        assert_eq!(dev.read_block(BlockNumber(0)).unwrap(), block_of(0x5A));
        assert_eq!(dev.read_block(BlockNumber(1)).unwrap(), block_of(1));
        assert_eq!(dev.read_block(BlockNumber(2)).unwrap(), block_of(2));
    }

    #[test]
    fn file_device_rejects_out_of_range_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev.img");
        let dev = FileBlockDevice::create(&path, 4).unwrap();
        let bufs = vec![block_of(1), block_of(2), block_of(3)];
        assert!(dev.write_cluster(BlockNumber(2), &bufs).is_err());
    }
}
