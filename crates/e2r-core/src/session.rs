#![forbid(unsafe_code)]
//! Per-open-file read state.
//!
//! An [`OpenFile`] owns a copy of its inode plus a small cache: the last data
//! block it resolved and, for each indirection level, the index block on the
//! path to it. Sequential reads reuse the index blocks they share with the
//! previous lookup, so walking a doubly-indirect file reads each index block
//! once instead of once per data block.
//!
//! Invariant: when `current` is set, `data` holds the contents of that
//! logical block and `index[..depth]` hold the index blocks on its path.

use e2r_block::{BlockBuf, BlockDevice};
use e2r_bmap::{BlockMap, BlockPath, MAX_INDIRECTION, index_entry};
use e2r_dir::DirCursor;
use e2r_error::{Ext2Error, Result};
use e2r_ondisk::{Ext2DirEntry, Ext2Inode};
use e2r_types::{BlockNumber, BlockSize, InodeNumber};
use tracing::trace;

/// Index block cached at one indirection level.
#[derive(Debug, Clone)]
struct IndexBlock {
    physical: u32,
    buf: BlockBuf,
}

/// The logical block currently held in `data`.
#[derive(Debug, Clone, Copy)]
struct Resolved {
    logical: u64,
    path: BlockPath,
    /// 0 for a hole.
    physical: u32,
}

#[derive(Debug)]
pub struct OpenFile {
    ino: InodeNumber,
    inode: Ext2Inode,
    map: BlockMap,
    block_size: u32,
    current: Option<Resolved>,
    data: BlockBuf,
    /// `None` at a level means that subtree is a hole.
    index: [Option<IndexBlock>; MAX_INDIRECTION],
    cursor: DirCursor,
}

impl OpenFile {
    #[must_use]
    pub fn new(ino: InodeNumber, inode: Ext2Inode, block_size: BlockSize) -> Self {
        Self {
            ino,
            inode,
            map: BlockMap::new(block_size),
            block_size: block_size.get(),
            current: None,
            data: BlockBuf::zeroed(block_size.as_usize()),
            index: [None, None, None],
            cursor: DirCursor::new(),
        }
    }

    #[must_use]
    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    #[must_use]
    pub fn inode(&self) -> &Ext2Inode {
        &self.inode
    }

    /// Logical block last resolved, if any.
    #[must_use]
    pub fn cached_logical(&self) -> Option<u64> {
        self.current.map(|r| r.logical)
    }

    /// Populate the data cache for `logical` and return its bytes.
    ///
    /// Holes (a zero pointer at any level) read as zeros without I/O.
    pub fn read_block(&mut self, dev: &dyn BlockDevice, logical: u64) -> Result<&[u8]> {
        self.load(dev, logical)?;
        Ok(self.data.as_slice())
    }

    fn load(&mut self, dev: &dyn BlockDevice, logical: u64) -> Result<()> {
        if let Some(cur) = self.current {
            if cur.logical == logical {
                trace!(ino = self.ino.0, logical, "data block cache hit");
                return Ok(());
            }
        }

        let path = self.map.path(logical)?;
        let depth = path.depth();
        let shared = self
            .current
            .map_or(0, |cur| cur.path.shared_prefix(&path))
            .min(depth);
        // Drop the stale resolution first so a failed fetch cannot leave a
        // mismatched data buffer behind.
        self.current = None;

        for level in shared..depth {
            let ptr = if level == 0 {
                self.inode.block[path.root_slot]
            } else {
                self.index[level - 1]
                    .as_ref()
                    .map_or(0, |parent| index_entry(parent.buf.as_slice(), path.offsets()[level - 1]))
            };
            self.index[level] = if ptr == 0 {
                None
            } else {
                trace!(ino = self.ino.0, level, block = ptr, "index block fetch");
                Some(IndexBlock {
                    physical: ptr,
                    buf: fetch(dev, ptr)?,
                })
            };
        }
        for slot in self.index.iter_mut().skip(depth) {
            *slot = None;
        }
        if shared > 0 {
            trace!(ino = self.ino.0, logical, shared, "index blocks reused");
        }

        let physical = if depth == 0 {
            self.inode.block[path.root_slot]
        } else {
            self.index[depth - 1]
                .as_ref()
                .map_or(0, |leaf| index_entry(leaf.buf.as_slice(), path.offsets()[depth - 1]))
        };

        if physical == 0 {
            trace!(ino = self.ino.0, logical, "sparse hole");
            self.data = BlockBuf::zeroed(self.data.len());
        } else {
            trace!(ino = self.ino.0, logical, block = physical, "data block fetch");
            self.data = fetch(dev, physical)?;
        }

        self.current = Some(Resolved {
            logical,
            path,
            physical,
        });
        Ok(())
    }

    /// Physical block numbers of the cached index path, outermost first.
    #[must_use]
    pub fn cached_index_blocks(&self) -> Vec<Option<u32>> {
        let depth = self.current.map_or(0, |cur| cur.path.depth());
        self.index[..depth]
            .iter()
            .map(|lvl| lvl.as_ref().map(|b| b.physical))
            .collect()
    }

    /// Read up to `len` bytes at `offset`, clamped to the file size.
    ///
    /// Returns fewer bytes only at end of file, and none when `offset` is at
    /// or past it. A fast symlink's inline target is served from `i_block`.
    pub fn read_range(&mut self, dev: &dyn BlockDevice, offset: u64, len: usize) -> Result<Vec<u8>> {
        let size = self.inode.size;
        if offset >= size || len == 0 {
            return Ok(Vec::new());
        }
        if let Some(inline) = self.inode.fast_symlink_target(self.block_size) {
            let start = usize::try_from(offset).unwrap_or(usize::MAX).min(inline.len());
            let end = start.saturating_add(len).min(inline.len());
            return Ok(inline[start..end].to_vec());
        }
        let end = offset.saturating_add(len as u64).min(size);
        let bs = u64::from(self.block_size);
        let total = usize::try_from(end - offset)
            .map_err(|_| Ext2Error::FileTooLarge { logical: end / bs })?;

        let mut out = Vec::with_capacity(total);
        let mut pos = offset;
        while pos < end {
            let logical = pos / bs;
            let within = usize::try_from(pos % bs).unwrap_or(0);
            let take = usize::try_from((bs - pos % bs).min(end - pos)).unwrap_or(0);
            let block = self.read_block(dev, logical)?;
            out.extend_from_slice(&block[within..within + take]);
            pos += take as u64;
        }
        Ok(out)
    }

    /// Decode the next live directory record, or `None` at end of directory.
    pub fn next_dir_entry(&mut self, dev: &dyn BlockDevice) -> Result<Option<Ext2DirEntry>> {
        loop {
            if self.cursor.is_exhausted(self.block_size, self.inode.size) {
                return Ok(None);
            }
            let logical = self.cursor.logical_block();
            self.load(dev, logical)?;
            let physical = self.current.map_or(0, |cur| u64::from(cur.physical));
            let record = self.cursor.next_record(self.data.as_slice(), physical)?;
            if record.is_unused() {
                continue;
            }
            return Ok(Some(record.to_owned()));
        }
    }
}

fn fetch(dev: &dyn BlockDevice, ptr: u32) -> Result<BlockBuf> {
    let block = u64::from(ptr);
    if block >= dev.block_count() {
        return Err(Ext2Error::Corruption {
            block,
            detail: format!(
                "block pointer beyond end of device (block_count={})",
                dev.block_count()
            ),
        });
    }
    dev.read_block(BlockNumber(block))
}
