//! Shared fixtures for the end-to-end suites.
#![allow(dead_code)] // each suite uses its own subset

use lcfs_block::{BlockDevice, FileBlockDevice, MemBlockDevice};
use lcfs_core::Gfs;
use lcfs_types::Handle;
use std::path::Path;
use std::sync::Arc;

pub fn mount_mem(blocks: u64) -> (Arc<Gfs>, Arc<MemBlockDevice>) {
    let dev = Arc::new(MemBlockDevice::new(blocks));
    let gfs = Gfs::mount(dev.clone() as Arc<dyn BlockDevice>).expect("mount");
    (gfs, dev)
}

pub fn create_file_device(path: &Path, blocks: u64) -> Arc<FileBlockDevice> {
    Arc::new(FileBlockDevice::create(path, blocks).expect("create device"))
}

pub fn open_file_device(path: &Path) -> Arc<FileBlockDevice> {
    Arc::new(FileBlockDevice::open(path).expect("open device"))
}

/// Create `/lcfs` and register it as the snapshot root.
pub fn setup_snap_root(gfs: &Gfs) -> Handle {
    let attr = gfs
        .mkdir(Handle::ROOT, b"lcfs", 0o755, 0, 0)
        .expect("mkdir snapshot root");
    gfs.set_snapshot_root(attr.handle.ino())
        .expect("set snapshot root");
    attr.handle
}

/// Resolve `/lcfs` after a remount.
pub fn find_snap_root(gfs: &Gfs) -> Handle {
    gfs.lookup(Handle::ROOT, b"lcfs").expect("snapshot root").handle
}

pub fn layer_root(gfs: &Gfs, snap: Handle, name: &str) -> Handle {
    gfs.lookup(snap, name.as_bytes())
        .unwrap_or_else(|e| panic!("layer {name}: {e}"))
        .handle
}

pub fn write_at(gfs: &Gfs, h: Handle, offset: u64, data: &[u8]) {
    assert_eq!(
        gfs.write(h, 0, offset, data).expect("write") as usize,
        data.len()
    );
}

pub fn read_at(gfs: &Gfs, h: Handle, offset: u64, size: u32) -> Vec<u8> {
    gfs.read(h, 0, offset, size).expect("read")
}

/// Directory names visible through readdir, excluding `.` and `..`.
pub fn dir_names(gfs: &Gfs, dir: Handle) -> Vec<String> {
    gfs.readdir(dir, 2)
        .expect("readdir")
        .into_iter()
        .map(|e| String::from_utf8(e.name).expect("utf8 name"))
        .collect()
}
