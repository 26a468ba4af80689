#![forbid(unsafe_code)]
//! LCFS core: a user-space, copy-on-write, layered filesystem.
//!
//! A stack of immutable parent layers plus a writable top layer provides
//! standard file semantics while new layers share unchanged data with
//! their parents; branching a layer is O(1) in metadata. The modules map
//! onto the subsystems: on-disk records (`ondisk`), block allocation
//! (`alloc`), the cluster-writing page cache (`page`), the layered inode
//! cache and copy-up engine (`inode`), directory bodies (`dir`), file
//! block maps (`bmap`), extended attributes (`xattr`), layer lifecycle
//! (`layer`), and the dispatch surface (`fs`).
//!
//! They live in one crate because they share the `Inode`/`Layer` state
//! graph; the transport adapter and the mount binary live in their own
//! crates.

pub mod alloc;
pub mod bmap;
pub mod dir;
pub mod fs;
pub mod inode;
pub mod layer;
pub mod ondisk;
pub mod page;
pub mod xattr;

pub use fs::{
    Attr, DirEntryOut, FsStats, Gfs, SetAttr, LC_IOC_COMMIT, LC_IOC_CREATE, LC_IOC_CREATE_RO,
    LC_IOC_REMOVE, LC_IOC_STAT,
};
pub use inode::{GetMode, Stat, TimeSpec};
pub use layer::LayerStats;
