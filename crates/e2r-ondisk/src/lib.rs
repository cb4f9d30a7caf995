#![forbid(unsafe_code)]
//! On-disk format parsing for ext2 structures.
//!
//! Pure parsing crate: no I/O, no side effects. Turns byte slices into typed
//! superblocks, group descriptors, inode records and directory records.

pub mod ext2;

pub use ext2::{
    Ext2DirEntry, Ext2DirEntryRef, Ext2FileType, Ext2GroupDesc, Ext2IncompatFeatures, Ext2Inode,
    Ext2Superblock, parse_dir_record,
};
