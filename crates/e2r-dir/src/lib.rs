#![forbid(unsafe_code)]
//! Directory operations.
//!
//! Linear scan of ext2 directory records. A directory's data is a sequence
//! of blocks, each tiled by variable-length records whose `rec_len` chains
//! to the next record and never crosses a block boundary. [`DirCursor`]
//! remembers where the scan stands so callers can decode one record at a
//! time while supplying the block bytes themselves.

use e2r_error::{Ext2Error, Result};
use e2r_ondisk::{Ext2DirEntryRef, parse_dir_record};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Scan position inside a directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirCursor {
    logical_block: u64,
    offset: usize,
}

impl DirCursor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Logical directory block the next record lives in.
    #[must_use]
    pub fn logical_block(&self) -> u64 {
        self.logical_block
    }

    /// Byte offset of the next record inside its block.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes of the directory consumed so far.
    #[must_use]
    pub fn position(&self, block_size: u32) -> u64 {
        self.logical_block * u64::from(block_size) + self.offset as u64
    }

    /// Whether every byte up to `dir_size` has been consumed.
    #[must_use]
    pub fn is_exhausted(&self, block_size: u32, dir_size: u64) -> bool {
        self.position(block_size) >= dir_size
    }

    /// Decode the record under the cursor and step past it.
    ///
    /// `block` must hold logical block [`logical_block`](Self::logical_block);
    /// `physical` is its block number, used in error reports. When the
    /// record ends on the block boundary the cursor moves to offset 0 of the
    /// next block. Unused records (inode 0) are returned too; callers skip
    /// them.
    pub fn next_record<'a>(&mut self, block: &'a [u8], physical: u64) -> Result<Ext2DirEntryRef<'a>> {
        let record = parse_dir_record(block, self.offset).map_err(|err| {
            warn!(
                block = physical,
                offset = self.offset,
                error = %err,
                "corrupt directory record"
            );
            Ext2Error::CorruptDirectory {
                block: physical,
                offset: self.offset,
                detail: err.to_string(),
            }
        })?;

        self.offset += usize::from(record.rec_len);
        if self.offset >= block.len() {
            self.logical_block += 1;
            self.offset = 0;
        }
        Ok(record)
    }
}
