//! The literal end-to-end scenarios: layer branching, copy-on-write
//! divergence, contiguous allocation, wide directories, tombstones, and
//! xattr isolation, each checked across commit and remount where the
//! scenario calls for it.

mod common;

use common::*;
use lcfs_block::BlockDevice;
use lcfs_core::{Gfs, SetAttr};
use lcfs_harness::{assert_block_conservation, find_dinode, read_disk_dir_entries};
use lcfs_types::{Handle, LC_BLOCK_SIZE};
use std::sync::Arc;

/// S1: create a layer and a file on a fresh 1024-block device, commit,
/// remount, and list it.
#[test]
fn s1_create_commit_remount_readdir() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dev.img");
    {
        let dev = create_file_device(&path, 1024);
        let gfs = Gfs::mount(dev as Arc<dyn BlockDevice>).unwrap();
        let snap = setup_snap_root(&gfs);
        gfs.create_layer("l1", None, false).unwrap();
        let l1 = layer_root(&gfs, snap, "l1");
        let (file, _) = gfs.create(l1, b"a", 0o644, 0, 0).unwrap();
        assert_eq!(file.stat.size, 0);
        gfs.commit_layer("l1").unwrap();
        gfs.unmount().unwrap();
    }
    let dev = open_file_device(&path);
    let gfs = Gfs::mount(dev as Arc<dyn BlockDevice>).unwrap();
    let snap = find_snap_root(&gfs);
    let l1 = layer_root(&gfs, snap, "l1");
    assert_eq!(dir_names(&gfs, l1), vec!["a".to_owned()]);
    let a = gfs.lookup(l1, b"a").unwrap();
    assert_eq!(a.stat.size, 0);
    gfs.unmount().unwrap();
}

/// S2: writes in a child layer never change what the parent reads.
#[test]
fn s2_child_write_diverges_from_parent() {
    let (gfs, _dev) = mount_mem(4096);
    let snap = setup_snap_root(&gfs);
    gfs.create_layer("l1", None, false).unwrap();
    let l1 = layer_root(&gfs, snap, "l1");
    let (file, _) = gfs.create(l1, b"a", 0o644, 0, 0).unwrap();
    write_at(&gfs, file.handle, 0, b"hello");

    gfs.create_layer("l2", Some("l1"), false).unwrap();
    let l2 = layer_root(&gfs, snap, "l2");
    let a2 = gfs.lookup(l2, b"a").unwrap();
    assert_eq!(read_at(&gfs, a2.handle, 0, 64), b"hello");

    write_at(&gfs, a2.handle, 0, b"WORLD");
    let a1 = gfs.lookup(l1, b"a").unwrap();
    assert_eq!(read_at(&gfs, a1.handle, 0, 64), b"hello");
    assert_eq!(read_at(&gfs, a2.handle, 0, 64), b"WORLD");
    gfs.unmount().unwrap();
}

/// S2 across a remount: the divergence is persistent.
#[test]
fn s2_divergence_survives_remount() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dev.img");
    {
        let dev = create_file_device(&path, 4096);
        let gfs = Gfs::mount(dev as Arc<dyn BlockDevice>).unwrap();
        let snap = setup_snap_root(&gfs);
        gfs.create_layer("l1", None, false).unwrap();
        let l1 = layer_root(&gfs, snap, "l1");
        let (file, _) = gfs.create(l1, b"a", 0o644, 0, 0).unwrap();
        write_at(&gfs, file.handle, 0, b"hello");
        gfs.create_layer("l2", Some("l1"), false).unwrap();
        let l2 = layer_root(&gfs, snap, "l2");
        let a2 = gfs.lookup(l2, b"a").unwrap();
        write_at(&gfs, a2.handle, 0, b"WORLD");
        gfs.commit_layer("l2").unwrap();
        gfs.unmount().unwrap();
    }
    let dev = open_file_device(&path);
    let gfs = Gfs::mount(dev as Arc<dyn BlockDevice>).unwrap();
    let snap = find_snap_root(&gfs);
    let a1 = gfs.lookup(layer_root(&gfs, snap, "l1"), b"a").unwrap();
    let a2 = gfs.lookup(layer_root(&gfs, snap, "l2"), b"a").unwrap();
    assert_eq!(read_at(&gfs, a1.handle, 0, 64), b"hello");
    assert_eq!(read_at(&gfs, a2.handle, 0, 64), b"WORLD");
    gfs.unmount().unwrap();
}

/// S3: a 300-block sequential file costs exactly 300 blocks of free
/// space and lands as one contiguous extent.
#[test]
fn s3_large_sequential_file_stays_contiguous() {
    let (gfs, dev) = mount_mem(4096);
    let snap = setup_snap_root(&gfs);
    gfs.create_layer("l1", None, false).unwrap();
    let l1 = layer_root(&gfs, snap, "l1");
    let (file, _) = gfs.create(l1, b"big", 0o644, 0, 0).unwrap();

    let free_before = gfs.statfs().bfree;
    let payload = vec![0x5A_u8; LC_BLOCK_SIZE as usize];
    for i in 0..300_u64 {
        write_at(&gfs, file.handle, i * u64::from(LC_BLOCK_SIZE), &payload);
    }
    gfs.flush_file_data().unwrap();
    let free_after = gfs.statfs().bfree;
    assert_eq!(free_before - free_after, 300);

    gfs.commit_layer("l1").unwrap();
    let on_disk = find_dinode(&*dev, 1, file.handle.ino().0).unwrap();
    assert_eq!(on_disk.dinode.extent_len, 300);
    assert_eq!(on_disk.dinode.size, 300 * u64::from(LC_BLOCK_SIZE));
    gfs.unmount().unwrap();
}

/// S4: a 2048-entry directory uses hashed lookup, survives remount, and
/// keeps exactly the odd half after the evens are removed.
#[test]
fn s4_wide_directory_across_remount() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dev.img");
    {
        let dev = create_file_device(&path, 8192);
        let gfs = Gfs::mount(dev as Arc<dyn BlockDevice>).unwrap();
        let d = gfs.mkdir(Handle::ROOT, b"d", 0o755, 0, 0).unwrap();
        for i in 0..2048 {
            let name = format!("f{i:04}");
            gfs.mknod(
                d.handle,
                name.as_bytes(),
                lcfs_types::S_IFREG | 0o644,
                0,
                0,
                0,
            )
            .unwrap();
        }
        let hit = gfs.lookup(d.handle, b"f1234").unwrap();
        assert!(hit.stat.size == 0);
        for i in (0..2048).step_by(2) {
            let name = format!("f{i:04}");
            gfs.unlink(d.handle, name.as_bytes()).unwrap();
        }
        gfs.unmount().unwrap();
    }
    let dev = open_file_device(&path);
    let gfs = Gfs::mount(dev as Arc<dyn BlockDevice>).unwrap();
    let d = gfs.lookup(Handle::ROOT, b"d").unwrap();
    assert!(gfs.lookup(d.handle, b"f1235").is_ok());
    assert!(gfs.lookup(d.handle, b"f1234").is_err());
    let names = dir_names(&gfs, d.handle);
    assert_eq!(names.len(), 1024);
    assert!(names
        .iter()
        .all(|n| n[1..].parse::<usize>().unwrap() % 2 == 1));
    gfs.unmount().unwrap();
}

/// S5: an unlink in the child hides the parent's file, in memory and
/// across remount; the parent keeps it.
#[test]
fn s5_tombstone_visibility() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dev.img");
    {
        let dev = create_file_device(&path, 4096);
        let gfs = Gfs::mount(dev as Arc<dyn BlockDevice>).unwrap();
        let snap = setup_snap_root(&gfs);
        gfs.create_layer("l1", None, false).unwrap();
        let l1 = layer_root(&gfs, snap, "l1");
        gfs.create(l1, b"a", 0o644, 0, 0).unwrap();
        gfs.create_layer("l2", Some("l1"), false).unwrap();
        let l2 = layer_root(&gfs, snap, "l2");
        gfs.unlink(l2, b"a").unwrap();

        assert!(dir_names(&gfs, l2).is_empty());
        assert_eq!(dir_names(&gfs, l1), vec!["a".to_owned()]);
        gfs.commit_layer("l2").unwrap();
        gfs.unmount().unwrap();
    }
    let dev = open_file_device(&path);
    let gfs = Gfs::mount(dev as Arc<dyn BlockDevice>).unwrap();
    let snap = find_snap_root(&gfs);
    let l1 = layer_root(&gfs, snap, "l1");
    let l2 = layer_root(&gfs, snap, "l2");
    assert!(dir_names(&gfs, l2).is_empty());
    assert!(gfs.lookup(l2, b"a").is_err());
    assert_eq!(dir_names(&gfs, l1), vec!["a".to_owned()]);
    gfs.unmount().unwrap();
}

/// S6: removing an xattr in the child leaves the parent's value alone.
#[test]
fn s6_xattr_isolation_across_remount() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dev.img");
    {
        let dev = create_file_device(&path, 4096);
        let gfs = Gfs::mount(dev as Arc<dyn BlockDevice>).unwrap();
        let snap = setup_snap_root(&gfs);
        gfs.create_layer("l1", None, false).unwrap();
        let l1 = layer_root(&gfs, snap, "l1");
        let (file, _) = gfs.create(l1, b"a", 0o644, 0, 0).unwrap();
        gfs.setxattr(file.handle, "user.k", b"v", 0).unwrap();

        gfs.create_layer("l2", Some("l1"), false).unwrap();
        let l2 = layer_root(&gfs, snap, "l2");
        let a2 = gfs.lookup(l2, b"a").unwrap();
        gfs.removexattr(a2.handle, "user.k").unwrap();
        gfs.commit_layer("l2").unwrap();
        gfs.unmount().unwrap();
    }
    let dev = open_file_device(&path);
    let gfs = Gfs::mount(dev as Arc<dyn BlockDevice>).unwrap();
    let snap = find_snap_root(&gfs);
    let a1 = gfs.lookup(layer_root(&gfs, snap, "l1"), b"a").unwrap();
    let a2 = gfs.lookup(layer_root(&gfs, snap, "l2"), b"a").unwrap();
    assert_eq!(gfs.getxattr(a1.handle, "user.k").unwrap(), b"v");
    assert!(gfs.getxattr(a2.handle, "user.k").is_err());
    assert!(gfs.listxattr(a2.handle).unwrap().is_empty());
    gfs.unmount().unwrap();
}

/// Truncate in a child shrinks its copy only, and setattr round-trips
/// through a commit.
#[test]
fn truncate_in_child_keeps_parent_size() {
    let (gfs, dev) = mount_mem(4096);
    let snap = setup_snap_root(&gfs);
    gfs.create_layer("l1", None, false).unwrap();
    let l1 = layer_root(&gfs, snap, "l1");
    let (file, _) = gfs.create(l1, b"a", 0o644, 0, 0).unwrap();
    write_at(&gfs, file.handle, 0, &vec![7_u8; 5 * LC_BLOCK_SIZE as usize]);

    gfs.create_layer("l2", Some("l1"), false).unwrap();
    let l2 = layer_root(&gfs, snap, "l2");
    let a2 = gfs.lookup(l2, b"a").unwrap();
    gfs.setattr(
        a2.handle,
        SetAttr {
            size: Some(100),
            ..SetAttr::default()
        },
    )
    .unwrap();

    let a1 = gfs.lookup(l1, b"a").unwrap();
    assert_eq!(a1.stat.size, 5 * u64::from(LC_BLOCK_SIZE));
    assert_eq!(gfs.getattr(a2.handle).unwrap().stat.size, 100);

    gfs.commit_layer("l2").unwrap();
    gfs.sync_all().unwrap();
    assert_block_conservation(&*dev).unwrap();
    gfs.unmount().unwrap();
}

/// Persisted directory bodies on disk match what readdir serves.
#[test]
fn disk_directory_matches_dispatch_view() {
    let (gfs, dev) = mount_mem(4096);
    let snap = setup_snap_root(&gfs);
    gfs.create_layer("l1", None, false).unwrap();
    let l1 = layer_root(&gfs, snap, "l1");
    gfs.create(l1, b"x", 0o644, 0, 0).unwrap();
    gfs.mkdir(l1, b"sub", 0o755, 0, 0).unwrap();
    gfs.commit_layer("l1").unwrap();

    let root = find_dinode(&*dev, 1, l1.ino().0).unwrap();
    let mut on_disk: Vec<String> = read_disk_dir_entries(&*dev, &root)
        .unwrap()
        .into_iter()
        .map(|(_, _, name)| name)
        .collect();
    on_disk.sort();
    let mut served = dir_names(&gfs, l1);
    served.sort();
    assert_eq!(on_disk, served);
    gfs.unmount().unwrap();
}
