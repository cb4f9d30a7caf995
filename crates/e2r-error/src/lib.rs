#![forbid(unsafe_code)]
//! Error types for Ext2Reader.
//!
//! # Error Taxonomy
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `e2r-types` | Byte-level format violations |
//! | Runtime | `Ext2Error` | `e2r-error` (this crate) | Errors returned by driver operations |
//!
//! `e2r-error` does not depend on `e2r-types`. The `ParseError` → `Ext2Error`
//! conversion lives in `e2r-core`, which sees both. Parse failures while
//! opening an image become `Format` or `InvalidGeometry`; parse failures on
//! live metadata become `Corruption` with the block number attached.
//!
//! ## errno Mapping
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error, else `EIO` |
//! | `Corruption` | `EIO` |
//! | `CorruptDirectory` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `InvalidGeometry` | `EINVAL` |
//! | `NotSymlink` | `EINVAL` |
//! | `InodeFreed` | `ENOENT` |
//! | `NotFound` | `ENOENT` |
//! | `NotDirectory` | `ENOTDIR` |
//! | `IsDirectory` | `EISDIR` |
//! | `FileTooLarge` | `EFBIG` |
//! | `BadHandle` | `EBADF` |
//! | `TableFull` | `ENFILE` |
//!
//! End of file and end of directory are ordinary return values, never errors.

use thiserror::Error;

/// Unified error type for all Ext2Reader operations.
#[derive(Debug, Error)]
pub enum Ext2Error {
    /// Operating system I/O error, including short reads past the image end.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata at a known block failed to decode.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// The image is not an ext2 filesystem (bad magic, truncated superblock).
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Superblock geometry is out of range.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// The inode bitmap marks this inode as unallocated.
    #[error("inode {ino} is not allocated")]
    InodeFreed { ino: u64 },

    /// Path component or inode number does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A path component used as a directory is not one.
    #[error("not a directory")]
    NotDirectory,

    /// File data read attempted on a directory.
    #[error("is a directory")]
    IsDirectory,

    /// `read_link` on an inode that is not a symbolic link.
    #[error("not a symbolic link")]
    NotSymlink,

    /// A directory record is malformed.
    #[error("corrupt directory record in block {block} at offset {offset}: {detail}")]
    CorruptDirectory {
        block: u64,
        offset: usize,
        detail: String,
    },

    /// Logical block index beyond the triply-indirect range.
    #[error("logical block {logical} is beyond the addressable range")]
    FileTooLarge { logical: u64 },

    /// Handle is out of range or not currently open.
    #[error("bad handle: {0}")]
    BadHandle(u64),

    /// Every handle slot is in use.
    #[error("too many open handles")]
    TableFull,
}

impl Ext2Error {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive; adding a variant is a compile error until
    /// its errno is assigned.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } | Self::CorruptDirectory { .. } => libc::EIO,
            Self::Format(_) | Self::InvalidGeometry(_) | Self::NotSymlink => libc::EINVAL,
            Self::InodeFreed { .. } | Self::NotFound(_) => libc::ENOENT,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::FileTooLarge { .. } => libc::EFBIG,
            Self::BadHandle(_) => libc::EBADF,
            Self::TableFull => libc::ENFILE,
        }
    }
}

/// Result alias using `Ext2Error`.
pub type Result<T> = std::result::Result<T, Ext2Error>;
