#![forbid(unsafe_code)]
//! Read-only ext2 driver.
//!
//! [`Ext2Fs`] loads and validates the superblock once, then serves
//! path-based operations: attribute lookup, open/read/close on files,
//! open/read/close on directories and symlink reads. Group descriptors and
//! inode records are re-read from the device on every lookup. File data goes
//! through a per-handle [`OpenFile`] session that caches the indirect block
//! path of the last block it read.
//!
//! # Opening an image
//!
//! ```no_run
//! use e2r_core::Ext2Fs;
//!
//! let fs = Ext2Fs::open("disk.img")?;
//! let fh = fs.open_file("/test")?;
//! let data = fs.read(fh, 4096, 0)?;
//! fs.close(fh)?;
//! # Ok::<(), e2r_error::Ext2Error>(())
//! ```

pub mod handles;
pub mod path;
pub mod session;

pub use handles::{DEFAULT_MAX_HANDLES, Handle, HandleKind, HandleTable};
pub use session::OpenFile;

use e2r_block::{
    BlockBuf, BlockDevice, ByteBlockDevice, ByteDevice, FileByteDevice,
    read_ext2_superblock_region,
};
use e2r_error::{Ext2Error, Result};
use e2r_ondisk::{Ext2FileType, Ext2GroupDesc, Ext2Inode, Ext2Superblock};
use e2r_types::{
    BlockNumber, BlockSize, EXT2_GROUP_DESC_SIZE, EXT2_SUPERBLOCK_OFFSET, EXT2_SUPERBLOCK_SIZE,
    GroupNumber, InodeNumber, ParseError, inode_index_in_group, inode_to_group,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

// ── Options & geometry ──────────────────────────────────────────────────────

/// Options controlling how an image is opened.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Parse the superblock without validating geometry or features.
    ///
    /// For diagnostics on damaged images only.
    pub skip_validation: bool,
    /// Ceiling on simultaneously open file and directory handles.
    pub max_handles: usize,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            skip_validation: false,
            max_handles: DEFAULT_MAX_HANDLES,
        }
    }
}

/// Geometry derived from the superblock at open time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2Geometry {
    pub block_size: u32,
    pub blocks_count: u32,
    pub free_blocks_count: u32,
    pub inodes_count: u32,
    pub free_inodes_count: u32,
    pub inodes_per_group: u32,
    pub blocks_per_group: u32,
    pub first_data_block: u32,
    pub inode_size: u16,
    pub groups_count: u32,
    pub rev_level: u32,
    /// Largest file, in blocks, the indirect tree can address.
    pub max_file_blocks: u64,
    pub volume_name: String,
}

impl Ext2Geometry {
    fn from_superblock(sb: &Ext2Superblock, block_size: BlockSize) -> Self {
        let map = e2r_bmap::BlockMap::new(block_size);
        Self {
            block_size: sb.block_size,
            blocks_count: sb.blocks_count,
            free_blocks_count: sb.free_blocks_count,
            inodes_count: sb.inodes_count,
            free_inodes_count: sb.free_inodes_count,
            inodes_per_group: sb.inodes_per_group,
            blocks_per_group: sb.blocks_per_group,
            first_data_block: sb.first_data_block,
            inode_size: sb.inode_size,
            groups_count: sb.groups_count(),
            rev_level: sb.rev_level,
            max_file_blocks: map.max_logical_blocks(),
            volume_name: sb.volume_name.clone(),
        }
    }
}

// ── Attributes ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    RegularFile,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

/// Stored metadata of one inode, as returned by [`Ext2Fs::get_attributes`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeAttr {
    pub ino: InodeNumber,
    pub size: u64,
    /// 512-byte sectors allocated.
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub kind: FileType,
    /// Permission bits (lower 12 bits of mode).
    pub perm: u16,
    /// Full `i_mode`, type bits included.
    pub mode: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub blksize: u32,
}

fn epoch_seconds(secs: u32) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(u64::from(secs))
}

fn inode_file_type(inode: &Ext2Inode) -> FileType {
    match inode.file_type() {
        Ext2FileType::Dir => FileType::Directory,
        Ext2FileType::Symlink => FileType::Symlink,
        Ext2FileType::Blkdev => FileType::BlockDevice,
        Ext2FileType::Chrdev => FileType::CharDevice,
        Ext2FileType::Fifo => FileType::Fifo,
        Ext2FileType::Sock => FileType::Socket,
        Ext2FileType::RegFile | Ext2FileType::Unknown => FileType::RegularFile,
    }
}

fn inode_to_attr(block_size: u32, ino: InodeNumber, inode: &Ext2Inode) -> InodeAttr {
    InodeAttr {
        ino,
        size: inode.size,
        blocks: u64::from(inode.blocks),
        atime: epoch_seconds(inode.atime),
        mtime: epoch_seconds(inode.mtime),
        ctime: epoch_seconds(inode.ctime),
        kind: inode_file_type(inode),
        perm: inode.permission_bits(),
        mode: inode.mode,
        nlink: u32::from(inode.links_count),
        uid: inode.uid,
        gid: inode.gid,
        blksize: block_size,
    }
}

// ── Error conversion ────────────────────────────────────────────────────────

/// Convert a superblock `ParseError` raised while opening an image.
fn parse_error_to_mount(e: &ParseError) -> Ext2Error {
    match e {
        ParseError::InvalidField { field, .. }
            if field.ends_with("_per_group")
                || matches!(
                    *field,
                    "s_log_block_size"
                        | "s_inode_size"
                        | "s_first_data_block"
                        | "s_blocks_count"
                        | "s_inodes_count"
                        | "block_size"
                ) =>
        {
            Ext2Error::InvalidGeometry(e.to_string())
        }
        _ => Ext2Error::Format(e.to_string()),
    }
}

/// Convert a `ParseError` raised while decoding live metadata in `block`.
fn parse_to_ext2_error(e: &ParseError, block: u64) -> Ext2Error {
    Ext2Error::Corruption {
        block,
        detail: e.to_string(),
    }
}

// ── Ext2Fs ──────────────────────────────────────────────────────────────────

/// An opened ext2 image.
///
/// `Ext2Fs` is `Send + Sync`. The superblock is immutable after open, the
/// device uses positional reads, and each handle's session has its own lock,
/// so independent handles can be read from different threads.
pub struct Ext2Fs {
    sb: Ext2Superblock,
    geometry: Ext2Geometry,
    block_size: BlockSize,
    dev: Arc<dyn BlockDevice>,
    handles: HandleTable,
}

impl std::fmt::Debug for Ext2Fs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ext2Fs")
            .field("geometry", &self.geometry)
            .field("block_count", &self.dev.block_count())
            .field("open_handles", &self.handles.open_count())
            .finish_non_exhaustive()
    }
}

impl Ext2Fs {
    /// Open the image at `path` with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, &OpenOptions::default())
    }

    pub fn open_with_options(path: impl AsRef<Path>, options: &OpenOptions) -> Result<Self> {
        debug!(path = %path.as_ref().display(), "opening ext2 image");
        let dev = FileByteDevice::open(path.as_ref())?;
        Self::from_device(Box::new(dev), options)
    }

    /// Open from a byte device; blocks are cut at the superblock's block size.
    pub fn from_device(dev: Box<dyn ByteDevice>, options: &OpenOptions) -> Result<Self> {
        let region = read_ext2_superblock_region(&*dev)?;
        let sb = Self::load_superblock(&region, options)?;
        let blocks = ByteBlockDevice::new(dev, sb.block_size)?;
        Self::assemble(sb, Arc::new(blocks), options)
    }

    /// Open from a block device whose block size matches the filesystem's.
    ///
    /// Lets callers interpose on block reads, e.g. with
    /// [`CountingBlockDevice`](e2r_block::CountingBlockDevice).
    pub fn from_block_device(dev: Arc<dyn BlockDevice>, options: &OpenOptions) -> Result<Self> {
        let dev_bs = u64::from(dev.block_size());
        let sb_offset = EXT2_SUPERBLOCK_OFFSET as u64;
        let mut region = [0_u8; EXT2_SUPERBLOCK_SIZE];
        let mut filled = 0_usize;
        while filled < EXT2_SUPERBLOCK_SIZE {
            let at = sb_offset + filled as u64;
            let block = BlockNumber(at / dev_bs);
            if block.0 >= dev.block_count() {
                return Err(Ext2Error::Format(
                    "image too small for superblock".to_owned(),
                ));
            }
            let buf = dev.read_block(block)?;
            let within = usize::try_from(at % dev_bs)
                .map_err(|_| Ext2Error::Format("superblock offset overflow".to_owned()))?;
            let take = (buf.len() - within).min(EXT2_SUPERBLOCK_SIZE - filled);
            region[filled..filled + take].copy_from_slice(&buf.as_slice()[within..within + take]);
            filled += take;
        }

        let sb = Self::load_superblock(&region, options)?;
        if dev.block_size() != sb.block_size {
            return Err(Ext2Error::InvalidGeometry(format!(
                "device block size {} does not match filesystem block size {}",
                dev.block_size(),
                sb.block_size
            )));
        }
        Self::assemble(sb, dev, options)
    }

    fn load_superblock(region: &[u8], options: &OpenOptions) -> Result<Ext2Superblock> {
        let sb = Ext2Superblock::parse_superblock_region(region)
            .map_err(|e| parse_error_to_mount(&e))?;
        if !options.skip_validation {
            sb.validate().map_err(|e| parse_error_to_mount(&e))?;
        }
        Ok(sb)
    }

    fn assemble(
        sb: Ext2Superblock,
        dev: Arc<dyn BlockDevice>,
        options: &OpenOptions,
    ) -> Result<Self> {
        let block_size = BlockSize::new(sb.block_size).map_err(|e| parse_error_to_mount(&e))?;
        let geometry = Ext2Geometry::from_superblock(&sb, block_size);
        debug!(
            block_size = geometry.block_size,
            blocks = geometry.blocks_count,
            inodes = geometry.inodes_count,
            groups = geometry.groups_count,
            inode_size = geometry.inode_size,
            rev = geometry.rev_level,
            "ext2 image opened"
        );
        Ok(Self {
            sb,
            geometry,
            block_size,
            dev,
            handles: HandleTable::new(options.max_handles),
        })
    }

    #[must_use]
    pub fn superblock(&self) -> &Ext2Superblock {
        &self.sb
    }

    /// Filesystem summary computed at open time.
    #[must_use]
    pub fn stat_fs(&self) -> &Ext2Geometry {
        &self.geometry
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size.get()
    }

    #[must_use]
    pub fn block_device(&self) -> &dyn BlockDevice {
        &*self.dev
    }

    #[must_use]
    pub fn open_handles(&self) -> usize {
        self.handles.open_count()
    }

    fn read_block(&self, block: u64) -> Result<BlockBuf> {
        if block >= self.dev.block_count() {
            return Err(Ext2Error::Corruption {
                block,
                detail: format!(
                    "metadata block beyond end of device (block_count={})",
                    self.dev.block_count()
                ),
            });
        }
        self.dev.read_block(BlockNumber(block))
    }

    // ── Metadata lookup ───────────────────────────────────────────────

    /// Read a group descriptor from the primary descriptor table.
    pub fn read_group_desc(&self, group: GroupNumber) -> Result<Ext2GroupDesc> {
        if group.0 >= self.geometry.groups_count {
            return Err(Ext2Error::NotFound(format!("block group {group}")));
        }
        let offset = self
            .sb
            .group_desc_offset(group)
            .ok_or_else(|| Ext2Error::InvalidGeometry("group desc offset overflow".into()))?;
        let bs = u64::from(self.sb.block_size);
        let block = offset / bs;
        let within = usize::try_from(offset % bs)
            .map_err(|_| Ext2Error::InvalidGeometry("group desc offset overflow".into()))?;
        let buf = self.read_block(block)?;
        let bytes = buf
            .as_slice()
            .get(within..within + EXT2_GROUP_DESC_SIZE)
            .ok_or_else(|| Ext2Error::Corruption {
                block,
                detail: "group descriptor straddles block end".into(),
            })?;
        Ext2GroupDesc::parse_from_bytes(bytes).map_err(|e| parse_to_ext2_error(&e, block))
    }

    /// Read inode `ino`, refusing inodes the bitmap marks unallocated.
    pub fn read_inode(&self, ino: InodeNumber) -> Result<Ext2Inode> {
        if ino.0 == 0 || ino.0 > u64::from(self.sb.inodes_count) {
            return Err(Ext2Error::NotFound(format!("inode {ino}")));
        }
        let group = inode_to_group(ino, self.sb.inodes_per_group);
        let index = inode_index_in_group(ino, self.sb.inodes_per_group);
        let gd = self.read_group_desc(group)?;

        if !self.inode_allocated(&gd, index)? {
            warn!(ino = ino.0, group = group.0, "lookup of unallocated inode");
            return Err(Ext2Error::InodeFreed { ino: ino.0 });
        }

        let offset = self
            .sb
            .inode_offset(gd.inode_table, index)
            .ok_or_else(|| Ext2Error::InvalidGeometry("inode offset overflow".into()))?;
        let bs = u64::from(self.sb.block_size);
        let block = offset / bs;
        let within = usize::try_from(offset % bs)
            .map_err(|_| Ext2Error::InvalidGeometry("inode offset overflow".into()))?;
        let buf = self.read_block(block)?;
        let end = within + usize::from(self.sb.inode_size);
        let bytes = buf
            .as_slice()
            .get(within..end)
            .ok_or_else(|| Ext2Error::Corruption {
                block,
                detail: "inode record straddles block end".into(),
            })?;
        Ext2Inode::parse_from_bytes(bytes, self.sb.rev_level)
            .map_err(|e| parse_to_ext2_error(&e, block))
    }

    fn inode_allocated(&self, gd: &Ext2GroupDesc, index: u32) -> Result<bool> {
        let block = u64::from(gd.inode_bitmap);
        let bitmap = self.read_block(block)?;
        let byte_idx = usize::try_from(index / 8)
            .map_err(|_| Ext2Error::InvalidGeometry("inode bitmap index overflow".into()))?;
        let byte = *bitmap
            .as_slice()
            .get(byte_idx)
            .ok_or_else(|| Ext2Error::Corruption {
                block,
                detail: format!("inode index {index} beyond bitmap"),
            })?;
        Ok((byte >> (index % 8)) & 1 == 1)
    }

    // ── Driver operations ─────────────────────────────────────────────

    /// Stored attributes of the inode at `path`.
    pub fn get_attributes(&self, path: &str) -> Result<InodeAttr> {
        let (ino, inode) = self.resolve_path_inode(path)?;
        Ok(inode_to_attr(self.sb.block_size, ino, &inode))
    }

    /// Open `path` for reading and return its handle.
    ///
    /// Directories may be opened this way, but reading them fails with
    /// `IsDirectory`.
    pub fn open_file(&self, path: &str) -> Result<Handle> {
        let (ino, inode) = self.resolve_path_inode(path)?;
        let handle = self.handles.allocate(
            OpenFile::new(ino, inode, self.block_size),
            HandleKind::File,
        )?;
        debug!(path, ino = ino.0, handle, "file opened");
        Ok(handle)
    }

    /// Read up to `len` bytes at `offset` from an open file.
    ///
    /// Returns fewer bytes only at end of file.
    pub fn read(&self, handle: Handle, len: usize, offset: u64) -> Result<Vec<u8>> {
        let (_, session) = self.handles.get_any(handle)?;
        let mut file = session.lock();
        if file.inode().is_dir() {
            return Err(Ext2Error::IsDirectory);
        }
        file.read_range(&*self.dev, offset, len)
    }

    /// Close a handle returned by [`open_file`](Self::open_file).
    pub fn close(&self, handle: Handle) -> Result<()> {
        self.handles.release(handle, HandleKind::File)?;
        debug!(handle, "file closed");
        Ok(())
    }

    /// Open the directory at `path` for iteration.
    pub fn open_directory(&self, path: &str) -> Result<Handle> {
        let (ino, inode) = self.resolve_path_inode(path)?;
        if !inode.is_dir() {
            return Err(Ext2Error::NotDirectory);
        }
        let handle = self.handles.allocate(
            OpenFile::new(ino, inode, self.block_size),
            HandleKind::Directory,
        )?;
        debug!(path, ino = ino.0, handle, "directory opened");
        Ok(handle)
    }

    /// Name of the next directory entry, or `None` once the directory is
    /// exhausted. `.` and `..` are returned like any other name.
    pub fn read_directory_entry(&self, handle: Handle) -> Result<Option<String>> {
        let session = self.handles.get(handle, HandleKind::Directory)?;
        let mut dir = session.lock();
        Ok(dir.next_dir_entry(&*self.dev)?.map(|e| e.name_str()))
    }

    pub fn close_directory(&self, handle: Handle) -> Result<()> {
        self.handles.release(handle, HandleKind::Directory)?;
        debug!(handle, "directory closed");
        Ok(())
    }

    /// Target of the symlink at `path`, at most `max_len` bytes.
    pub fn read_link(&self, path: &str, max_len: usize) -> Result<Vec<u8>> {
        let (ino, inode) = self.resolve_path_inode(path)?;
        if !inode.is_symlink() {
            return Err(Ext2Error::NotSymlink);
        }
        OpenFile::new(ino, inode, self.block_size).read_range(&*self.dev, 0, max_len)
    }
}
