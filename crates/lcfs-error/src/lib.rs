#![forbid(unsafe_code)]
//! Error types for LCFS.
//!
//! Defines `LcError` and a `Result<T>` alias used throughout the workspace.
//! Includes errno mappings for FUSE response codes.

use thiserror::Error;

/// Unified error type for all LCFS operations.
#[derive(Debug, Error)]
pub enum LcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no space left on device")]
    NoSpace,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("file exists")]
    Exists,

    #[error("directory not empty")]
    NotEmpty,

    #[error("layer is read-only")]
    ReadOnly,

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("name too long")]
    NameTooLong,

    #[error("filesystem is shutting down")]
    ShuttingDown,

    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },
}

impl LcError {
    /// Convert this error into a POSIX errno suitable for FUSE replies.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::NoSpace => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::Exists => libc::EEXIST,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::ReadOnly => libc::EROFS,
            Self::Invalid(_) => libc::EINVAL,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::ShuttingDown | Self::Corruption { .. } => libc::EIO,
        }
    }

    /// Shorthand for a `NotFound` with a formatted subject.
    #[must_use]
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }
}

/// Result alias using `LcError`.
pub type Result<T> = std::result::Result<T, LcError>;
