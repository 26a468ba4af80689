#![forbid(unsafe_code)]
//! FUSE adapter for LCFS.
//!
//! A thin translation layer: kernel requests arrive via the `fuser`
//! crate, are forwarded to the `lcfs-core` dispatch surface, and errors
//! map through `LcError::to_errno()`. The request handle encodes the
//! owning layer, so this adapter never interprets paths or layers
//! itself.

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyIoctl, ReplyOpen, ReplyStatfs, ReplyWrite,
    ReplyXattr, Request, TimeOrNow,
};
use lcfs_core::{Attr, Gfs, SetAttr, TimeSpec};
use lcfs_types::{
    Handle, LC_BLOCK_SIZE, S_IFBLK, S_IFCHR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK,
};
use std::ffi::OsStr;
use std::os::raw::c_int;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// TTL for cached attributes and entries. Layers mutate underneath the
/// kernel only through this mount, so a short TTL suffices.
const ATTR_TTL: Duration = Duration::from_secs(1);

// ── Error type ──────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FuseError {
    #[error("invalid mountpoint: {0}")]
    InvalidMountpoint(String),
    #[error("mount I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Type conversions ────────────────────────────────────────────────────────

fn to_file_type(mode: u32) -> FileType {
    match mode & S_IFMT {
        S_IFLNK => FileType::Symlink,
        S_IFREG => FileType::RegularFile,
        S_IFBLK => FileType::BlockDevice,
        S_IFCHR => FileType::CharDevice,
        S_IFIFO => FileType::NamedPipe,
        S_IFSOCK => FileType::Socket,
        _ => FileType::Directory,
    }
}

fn dirent_file_type(kind: u8) -> FileType {
    match kind {
        1 => FileType::NamedPipe,
        2 => FileType::CharDevice,
        6 => FileType::BlockDevice,
        8 => FileType::RegularFile,
        10 => FileType::Symlink,
        12 => FileType::Socket,
        _ => FileType::Directory,
    }
}

fn to_file_attr(attr: &Attr) -> FileAttr {
    let stat = attr.stat;
    FileAttr {
        ino: attr.handle.0,
        size: stat.size,
        // st_blocks counts 512-byte sectors.
        blocks: stat.blocks * u64::from(LC_BLOCK_SIZE / 512),
        atime: stat.atime.to_system_time(),
        mtime: stat.mtime.to_system_time(),
        ctime: stat.ctime.to_system_time(),
        crtime: stat.ctime.to_system_time(),
        kind: to_file_type(stat.mode),
        perm: (stat.mode & 0o7777) as u16,
        nlink: stat.nlink,
        uid: stat.uid,
        gid: stat.gid,
        rdev: stat.rdev,
        blksize: LC_BLOCK_SIZE,
        flags: 0,
    }
}

fn to_timespec(t: TimeOrNow) -> TimeSpec {
    match t {
        TimeOrNow::SpecificTime(t) => TimeSpec::from(t),
        TimeOrNow::Now => TimeSpec::now(),
    }
}

fn name_bytes(name: &OsStr) -> &[u8] {
    name.as_encoded_bytes()
}

// ── Mount options ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MountOptions {
    pub read_only: bool,
    pub allow_other: bool,
    pub auto_unmount: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            allow_other: true,
            auto_unmount: true,
        }
    }
}

fn build_mount_options(options: &MountOptions) -> Vec<MountOption> {
    let mut opts = vec![
        MountOption::FSName("lcfs".to_owned()),
        MountOption::Subtype("lcfs".to_owned()),
        MountOption::DefaultPermissions,
        MountOption::NoAtime,
    ];
    if options.read_only {
        opts.push(MountOption::RO);
    }
    if options.allow_other {
        opts.push(MountOption::AllowOther);
    }
    if options.auto_unmount {
        opts.push(MountOption::AutoUnmount);
    }
    opts
}

// ── FUSE filesystem adapter ─────────────────────────────────────────────────

/// FUSE adapter delegating every operation to the shared [`Gfs`].
///
/// Multiple adapters can serve the same `Gfs` at different mount points;
/// the shared state carries all coherence.
pub struct LcfsFuse {
    gfs: Arc<Gfs>,
}

impl LcfsFuse {
    #[must_use]
    pub fn new(gfs: Arc<Gfs>) -> Self {
        Self { gfs }
    }

    fn entry_reply(result: lcfs_error::Result<Attr>, reply: ReplyEntry) {
        match result {
            Ok(attr) => reply.entry(&ATTR_TTL, &to_file_attr(&attr), 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn empty_reply(result: lcfs_error::Result<()>, reply: ReplyEmpty) {
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }
}

impl Filesystem for LcfsFuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        Ok(())
    }

    fn destroy(&mut self) {}

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let result = self.gfs.lookup(Handle(parent), name_bytes(name));
        if let Err(e) = &result {
            if e.to_errno() != libc::ENOENT {
                warn!(parent, ?name, error = %e, "lookup failed");
            }
        }
        Self::entry_reply(result, reply);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.gfs.getattr(Handle(ino)) {
            Ok(attr) => reply.attr(&ATTR_TTL, &to_file_attr(&attr)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<std::time::SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<std::time::SystemTime>,
        _chgtime: Option<std::time::SystemTime>,
        _bkuptime: Option<std::time::SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let set = SetAttr {
            mode,
            uid,
            gid,
            size,
            atime: atime.map(to_timespec),
            mtime: mtime.map(to_timespec),
        };
        match self.gfs.setattr(Handle(ino), set) {
            Ok(attr) => reply.attr(&ATTR_TTL, &to_file_attr(&attr)),
            Err(e) => {
                warn!(ino, error = %e, "setattr failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.gfs.readlink(Handle(ino)) {
            Ok(target) => reply.data(&target),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let result = self
            .gfs
            .mknod(Handle(parent), name_bytes(name), mode, rdev, req.uid(), req.gid());
        Self::entry_reply(result, reply);
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let result = self
            .gfs
            .mkdir(Handle(parent), name_bytes(name), mode, req.uid(), req.gid());
        Self::entry_reply(result, reply);
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        Self::empty_reply(self.gfs.unlink(Handle(parent), name_bytes(name)), reply);
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        Self::empty_reply(self.gfs.rmdir(Handle(parent), name_bytes(name)), reply);
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let target = target.to_string_lossy();
        let result = self.gfs.symlink(
            Handle(parent),
            name_bytes(link_name),
            &target,
            req.uid(),
            req.gid(),
        );
        Self::entry_reply(result, reply);
    }

    #[allow(clippy::too_many_arguments)]
    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        Self::empty_reply(
            self.gfs.rename(
                Handle(parent),
                name_bytes(name),
                Handle(newparent),
                name_bytes(newname),
            ),
            reply,
        );
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let result = self
            .gfs
            .link(Handle(ino), Handle(newparent), name_bytes(newname));
        Self::entry_reply(result, reply);
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.gfs.open(Handle(ino)) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let offset = u64::try_from(offset).unwrap_or(0);
        match self.gfs.read(Handle(ino), fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => {
                warn!(ino, offset, size, error = %e, "read failed");
                reply.error(e.to_errno());
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let offset = u64::try_from(offset).unwrap_or(0);
        match self.gfs.write(Handle(ino), fh, offset, data) {
            Ok(written) => reply.written(written),
            Err(e) => {
                warn!(ino, offset, len = data.len(), error = %e, "write failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        Self::empty_reply(self.gfs.flush(Handle(ino), fh), reply);
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.gfs.release(fh);
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        Self::empty_reply(self.gfs.fsync(Handle(ino), fh), reply);
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        // Directory bodies resolve per request; no handle state needed.
        reply.opened(0, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let offset = u64::try_from(offset).unwrap_or(0);
        match self.gfs.readdir(Handle(ino), offset) {
            Ok(entries) => {
                for entry in &entries {
                    let full = reply.add(
                        entry.handle.0,
                        i64::try_from(entry.offset).unwrap_or(i64::MAX),
                        dirent_file_type(entry.kind),
                        OsStr::new(&String::from_utf8_lossy(&entry.name).into_owned()),
                    );
                    if full {
                        break;
                    }
                }
                reply.ok();
            }
            Err(e) => {
                warn!(ino, offset, error = %e, "readdir failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn fsyncdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        Self::empty_reply(self.gfs.fsync(Handle(ino), fh), reply);
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let stats = self.gfs.statfs();
        reply.statfs(
            stats.blocks,
            stats.bfree,
            stats.bfree,
            stats.files,
            u64::MAX,
            stats.bsize,
            stats.namelen,
            stats.bsize,
        );
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let name = name.to_string_lossy();
        Self::empty_reply(self.gfs.setxattr(Handle(ino), &name, value, flags), reply);
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let name = name.to_string_lossy();
        match self.gfs.getxattr(Handle(ino), &name) {
            Ok(value) => {
                if size == 0 {
                    reply.size(value.len() as u32);
                } else if value.len() as u32 <= size {
                    reply.data(&value);
                } else {
                    reply.error(libc::ERANGE);
                }
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        match self.gfs.listxattr(Handle(ino)) {
            Ok(names) => {
                let mut data = Vec::new();
                for name in names {
                    data.extend_from_slice(name.as_bytes());
                    data.push(0);
                }
                if size == 0 {
                    reply.size(data.len() as u32);
                } else if data.len() as u32 <= size {
                    reply.data(&data);
                } else {
                    reply.error(libc::ERANGE);
                }
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name.to_string_lossy();
        Self::empty_reply(self.gfs.removexattr(Handle(ino), &name), reply);
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        match self
            .gfs
            .create(Handle(parent), name_bytes(name), mode, req.uid(), req.gid())
        {
            Ok((attr, fh)) => reply.created(&ATTR_TTL, &to_file_attr(&attr), 0, fh, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn ioctl(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: u32,
        cmd: u32,
        in_data: &[u8],
        _out_size: u32,
        reply: ReplyIoctl,
    ) {
        match self.gfs.ioctl(Handle(ino), cmd, in_data) {
            Ok(out) => reply.ioctl(0, &out),
            Err(e) => {
                warn!(ino, cmd, error = %e, "layer ioctl failed");
                reply.error(e.to_errno());
            }
        }
    }
}

// ── Mount entrypoints ───────────────────────────────────────────────────────

fn check_mountpoint(mountpoint: &Path) -> Result<(), FuseError> {
    if mountpoint.as_os_str().is_empty() {
        return Err(FuseError::InvalidMountpoint(
            "mountpoint cannot be empty".to_owned(),
        ));
    }
    Ok(())
}

/// Serve the filesystem at `mountpoint`, blocking until unmounted.
pub fn mount(
    gfs: Arc<Gfs>,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<(), FuseError> {
    let mountpoint = mountpoint.as_ref();
    check_mountpoint(mountpoint)?;
    let opts = build_mount_options(options);
    fuser::mount2(LcfsFuse::new(gfs), mountpoint, &opts)?;
    Ok(())
}

/// Serve the filesystem in the background. Dropping the returned session
/// unmounts it.
pub fn mount_background(
    gfs: Arc<Gfs>,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<fuser::BackgroundSession, FuseError> {
    let mountpoint = mountpoint.as_ref();
    check_mountpoint(mountpoint)?;
    let opts = build_mount_options(options);
    Ok(fuser::spawn_mount2(LcfsFuse::new(gfs), mountpoint, &opts)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lcfs_core::Stat;
    use lcfs_types::{Ino, LayerIndex, S_IFDIR};

    fn stat_of(mode: u32) -> Stat {
        Stat {
            mode,
            nlink: 1,
            uid: 1000,
            gid: 1000,
            rdev: 0,
            size: 1024,
            blocks: 2,
            atime: TimeSpec::ZERO,
            mtime: TimeSpec::ZERO,
            ctime: TimeSpec::ZERO,
        }
    }

    #[test]
    fn file_attr_conversion() {
        let attr = Attr {
            handle: Handle::new(LayerIndex(3), Ino(42)),
            stat: stat_of(S_IFREG | 0o644),
        };
        let fattr = to_file_attr(&attr);
        assert_eq!(fattr.ino, attr.handle.0);
        assert_eq!(fattr.size, 1024);
        assert_eq!(fattr.blocks, 16); // two 4K blocks in 512B sectors
        assert_eq!(fattr.kind, FileType::RegularFile);
        assert_eq!(fattr.perm, 0o644);
        assert_eq!(fattr.uid, 1000);
        assert_eq!(fattr.blksize, LC_BLOCK_SIZE);
    }

    #[test]
    fn file_type_mapping() {
        assert_eq!(to_file_type(S_IFDIR | 0o755), FileType::Directory);
        assert_eq!(to_file_type(S_IFLNK | 0o777), FileType::Symlink);
        assert_eq!(to_file_type(S_IFCHR | 0o600), FileType::CharDevice);
        assert_eq!(dirent_file_type(8), FileType::RegularFile);
        assert_eq!(dirent_file_type(4), FileType::Directory);
        assert_eq!(dirent_file_type(10), FileType::Symlink);
    }

    #[test]
    fn mount_options_default_is_read_write() {
        let opts = MountOptions::default();
        assert!(!opts.read_only);
        let mount_opts = build_mount_options(&opts);
        assert!(!mount_opts.contains(&MountOption::RO));
        assert!(mount_opts.contains(&MountOption::AllowOther));
    }

    #[test]
    fn mount_rejects_empty_mountpoint() {
        assert!(check_mountpoint(Path::new("")).is_err());
        assert!(check_mountpoint(Path::new("/tmp/x")).is_ok());
    }
}
