#![forbid(unsafe_code)]
//! e2r public API facade.
//!
//! Re-exports the driver from `e2r-core` together with the error, device
//! and on-disk types its signatures mention. Downstream consumers (the
//! harness, an eventual FUSE bridge) depend on this crate only.

pub use e2r_core::*;

pub use e2r_block::{
    BlockBuf, BlockDevice, ByteBlockDevice, ByteDevice, CountingBlockDevice, FileByteDevice,
    MemoryByteDevice,
};
pub use e2r_error::{Ext2Error, Result};
pub use e2r_ondisk::{Ext2DirEntry, Ext2FileType, Ext2GroupDesc, Ext2Inode, Ext2Superblock};
pub use e2r_types::{BlockNumber, GroupNumber, InodeNumber};
