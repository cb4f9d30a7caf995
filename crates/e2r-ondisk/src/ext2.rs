#![forbid(unsafe_code)]

use e2r_types::{
    EXT2_FAST_SYMLINK_MAX, EXT2_GOOD_OLD_INODE_SIZE, EXT2_GROUP_DESC_SIZE, EXT2_N_BLOCKS, EXT2_SUPER_MAGIC, EXT2_SUPERBLOCK_SIZE, GroupNumber,
    ParseError, S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK,
    ext2_block_size_from_log, read_fixed, read_le_u16, read_le_u32, read_u8, trim_nul_padded,
};
use serde::{Deserialize, Serialize};

/// Size of the fixed directory record header (inode, rec_len, name_len, file_type).
pub const EXT2_DIR_RECORD_HEADER: usize = 8;

// ── Feature flags ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2IncompatFeatures(pub u32);

impl Ext2IncompatFeatures {
    pub const COMPRESSION: Self = Self(0x0001);
    pub const FILETYPE: Self = Self(0x0002);
    pub const RECOVER: Self = Self(0x0004);
    pub const JOURNAL_DEV: Self = Self(0x0008);
    pub const META_BG: Self = Self(0x0010);
    pub const EXTENTS: Self = Self(0x0040);
    pub const BIT64: Self = Self(0x0080);
    pub const INLINE_DATA: Self = Self(0x8000);
    pub const ENCRYPT: Self = Self(0x0001_0000);

    /// Bits whose presence changes how blocks or directories are laid out
    /// in ways this reader does not decode.
    pub const UNREADABLE: u32 = Self::COMPRESSION.0
        | Self::JOURNAL_DEV.0
        | Self::META_BG.0
        | Self::EXTENTS.0
        | Self::BIT64.0
        | Self::INLINE_DATA.0
        | Self::ENCRYPT.0;

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn unreadable_bits(self) -> u32 {
        self.0 & Self::UNREADABLE
    }
}

// ── Superblock ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2Superblock {
    // ── Core geometry ────────────────────────────────────────────────────
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub block_size: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    /// Effective inode record size (128 on revision 0 images).
    pub inode_size: u16,

    // ── Identity & features ──────────────────────────────────────────────
    pub volume_name: String,
    pub rev_level: u32,
    pub feature_incompat: Ext2IncompatFeatures,
}

impl Ext2Superblock {
    /// Parse an ext2 superblock from the 1024-byte region at image byte 1024.
    pub fn parse_superblock_region(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < EXT2_SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: EXT2_SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u16(region, 0x38)?;
        if magic != EXT2_SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(EXT2_SUPER_MAGIC),
                actual: u64::from(magic),
            });
        }

        let log_block_size = read_le_u32(region, 0x18)?;
        let Some(block_size) = ext2_block_size_from_log(log_block_size) else {
            return Err(ParseError::InvalidField {
                field: "s_log_block_size",
                reason: "invalid shift",
            });
        };
        if !(1024..=65536).contains(&block_size) {
            return Err(ParseError::InvalidField {
                field: "s_log_block_size",
                reason: "block size outside 1024..=65536",
            });
        }

        let rev_level = read_le_u32(region, 0x4C)?;
        let inode_size = if rev_level == 0 {
            EXT2_GOOD_OLD_INODE_SIZE
        } else {
            read_le_u16(region, 0x58)?
        };

        Ok(Self {
            inodes_count: read_le_u32(region, 0x00)?,
            blocks_count: read_le_u32(region, 0x04)?,
            free_blocks_count: read_le_u32(region, 0x0C)?,
            free_inodes_count: read_le_u32(region, 0x10)?,
            first_data_block: read_le_u32(region, 0x14)?,
            block_size,
            blocks_per_group: read_le_u32(region, 0x20)?,
            inodes_per_group: read_le_u32(region, 0x28)?,
            inode_size,

            volume_name: trim_nul_padded(&read_fixed::<16>(region, 0x78)?),
            rev_level,
            feature_incompat: Ext2IncompatFeatures(read_le_u32(region, 0x60)?),
        })
    }

    /// Number of block groups covering `blocks_count`.
    #[must_use]
    pub fn groups_count(&self) -> u32 {
        if self.blocks_per_group == 0 {
            return 0;
        }
        let data_blocks = self.blocks_count.saturating_sub(self.first_data_block);
        data_blocks.div_ceil(self.blocks_per_group)
    }

    /// Whether directory records carry a file type byte.
    #[must_use]
    pub fn has_filetype(&self) -> bool {
        self.rev_level >= 1
            && self
                .feature_incompat
                .contains(Ext2IncompatFeatures::FILETYPE)
    }

    /// Validate geometry and feature flags before the image is used.
    pub fn validate(&self) -> Result<(), ParseError> {
        self.validate_geometry()?;
        self.validate_features()
    }

    /// Validate basic geometry: per-group counts, inode size, group layout.
    pub fn validate_geometry(&self) -> Result<(), ParseError> {
        self.validate_geometry_fields()?;
        self.validate_geometry_layout()
    }

    fn validate_geometry_fields(&self) -> Result<(), ParseError> {
        let bitmap_bits = self.block_size.saturating_mul(8);

        if self.blocks_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "cannot be zero",
            });
        }
        if self.blocks_per_group > bitmap_bits {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "exceeds block_size * 8 (block bitmap capacity)",
            });
        }

        if self.inodes_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                reason: "cannot be zero",
            });
        }
        if self.inodes_per_group > bitmap_bits {
            return Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                reason: "exceeds block_size * 8 (inode bitmap capacity)",
            });
        }

        if self.inode_size < EXT2_GOOD_OLD_INODE_SIZE {
            return Err(ParseError::InvalidField {
                field: "s_inode_size",
                reason: "must be >= 128",
            });
        }
        if !self.inode_size.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "s_inode_size",
                reason: "must be a power of two",
            });
        }
        if u32::from(self.inode_size) > self.block_size {
            return Err(ParseError::InvalidField {
                field: "s_inode_size",
                reason: "inode_size exceeds block_size",
            });
        }

        if self.rev_level > 1 {
            return Err(ParseError::InvalidField {
                field: "s_rev_level",
                reason: "unknown revision",
            });
        }

        Ok(())
    }

    fn validate_geometry_layout(&self) -> Result<(), ParseError> {
        if self.first_data_block >= self.blocks_count {
            return Err(ParseError::InvalidField {
                field: "s_first_data_block",
                reason: "first_data_block >= blocks_count",
            });
        }
        if self.block_size == 1024 && self.first_data_block != 1 {
            return Err(ParseError::InvalidField {
                field: "s_first_data_block",
                reason: "must be 1 for 1K block size",
            });
        }
        if self.block_size > 1024 && self.first_data_block != 0 {
            return Err(ParseError::InvalidField {
                field: "s_first_data_block",
                reason: "must be 0 for block sizes > 1K",
            });
        }

        let group_count = self.groups_count();
        let gdt_bytes = u64::from(group_count) * EXT2_GROUP_DESC_SIZE as u64;
        let device_bytes = u64::from(self.blocks_count) * u64::from(self.block_size);
        let gdt_start = self.group_desc_offset(GroupNumber(0)).unwrap_or(u64::MAX);
        if gdt_start.saturating_add(gdt_bytes) > device_bytes {
            return Err(ParseError::InvalidField {
                field: "s_blocks_count",
                reason: "group descriptor table extends beyond device",
            });
        }

        let max_inodes = u64::from(group_count) * u64::from(self.inodes_per_group);
        if u64::from(self.inodes_count) > max_inodes {
            return Err(ParseError::InvalidField {
                field: "s_inodes_count",
                reason: "inodes_count exceeds groups * inodes_per_group",
            });
        }

        Ok(())
    }

    /// Reject incompatible features that change on-disk addressing.
    pub fn validate_features(&self) -> Result<(), ParseError> {
        if self.feature_incompat.unreadable_bits() != 0 {
            return Err(ParseError::InvalidField {
                field: "s_feature_incompat",
                reason: "image uses incompatible features this reader cannot decode",
            });
        }
        Ok(())
    }

    /// First block of a group.
    #[must_use]
    pub fn group_first_block(&self, group: GroupNumber) -> u64 {
        u64::from(group.0) * u64::from(self.blocks_per_group) + u64::from(self.first_data_block)
    }

    /// Block holding the start of the group descriptor table.
    #[must_use]
    pub fn group_desc_table_block(&self) -> u64 {
        u64::from(self.first_data_block) + 1
    }

    /// Byte offset of a group's descriptor in the primary descriptor table.
    #[must_use]
    pub fn group_desc_offset(&self, group: GroupNumber) -> Option<u64> {
        let table = self
            .group_desc_table_block()
            .checked_mul(u64::from(self.block_size))?;
        let entry = u64::from(group.0).checked_mul(EXT2_GROUP_DESC_SIZE as u64)?;
        table.checked_add(entry)
    }

    /// Byte offset of the record at `index` within an inode table starting at
    /// block `inode_table`.
    #[must_use]
    pub fn inode_offset(&self, inode_table: u32, index: u32) -> Option<u64> {
        let table = u64::from(inode_table).checked_mul(u64::from(self.block_size))?;
        let rel = u64::from(index).checked_mul(u64::from(self.inode_size))?;
        table.checked_add(rel)
    }
}

// ── Group descriptor ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2GroupDesc {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
}

impl Ext2GroupDesc {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < EXT2_GROUP_DESC_SIZE {
            return Err(ParseError::InsufficientData {
                needed: EXT2_GROUP_DESC_SIZE,
                offset: 0,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            block_bitmap: read_le_u32(bytes, 0x00)?,
            inode_bitmap: read_le_u32(bytes, 0x04)?,
            inode_table: read_le_u32(bytes, 0x08)?,
            free_blocks_count: read_le_u16(bytes, 0x0C)?,
            free_inodes_count: read_le_u16(bytes, 0x0E)?,
            used_dirs_count: read_le_u16(bytes, 0x10)?,
        })
    }
}

// ── Inode ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2Inode {
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    /// Byte size. Includes `i_size_high` for regular files on revision 1.
    pub size: u64,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub links_count: u16,
    /// 512-byte sectors allocated, including index blocks.
    pub blocks: u32,
    pub flags: u32,
    pub generation: u32,
    pub file_acl: u32,
    /// 12 direct pointers, then single, double and triple indirect.
    pub block: [u32; EXT2_N_BLOCKS],
}

impl Ext2Inode {
    /// Parse an inode record. Only the first 128 bytes are interpreted.
    pub fn parse_from_bytes(bytes: &[u8], rev_level: u32) -> Result<Self, ParseError> {
        let base = usize::from(EXT2_GOOD_OLD_INODE_SIZE);
        if bytes.len() < base {
            return Err(ParseError::InsufficientData {
                needed: base,
                offset: 0,
                actual: bytes.len(),
            });
        }

        let mode = read_le_u16(bytes, 0x00)?;
        let uid_lo = u32::from(read_le_u16(bytes, 0x02)?);
        let gid_lo = u32::from(read_le_u16(bytes, 0x18)?);
        let uid_hi = u32::from(read_le_u16(bytes, 0x78)?);
        let gid_hi = u32::from(read_le_u16(bytes, 0x7A)?);

        let size_lo = u64::from(read_le_u32(bytes, 0x04)?);
        // For directories this slot is i_dir_acl.
        let size_hi = if rev_level >= 1 && mode & S_IFMT == S_IFREG {
            u64::from(read_le_u32(bytes, 0x6C)?)
        } else {
            0
        };

        let mut block = [0_u32; EXT2_N_BLOCKS];
        for (slot, ptr) in block.iter_mut().enumerate() {
            *ptr = read_le_u32(bytes, 0x28 + slot * 4)?;
        }

        Ok(Self {
            mode,
            uid: uid_lo | (uid_hi << 16),
            gid: gid_lo | (gid_hi << 16),
            size: size_lo | (size_hi << 32),
            atime: read_le_u32(bytes, 0x08)?,
            ctime: read_le_u32(bytes, 0x0C)?,
            mtime: read_le_u32(bytes, 0x10)?,
            dtime: read_le_u32(bytes, 0x14)?,
            links_count: read_le_u16(bytes, 0x1A)?,
            blocks: read_le_u32(bytes, 0x1C)?,
            flags: read_le_u32(bytes, 0x20)?,
            generation: read_le_u32(bytes, 0x64)?,
            file_acl: read_le_u32(bytes, 0x68)?,
            block,
        })
    }

    /// File type bits (`mode & S_IFMT`).
    #[must_use]
    pub fn file_type_mode(&self) -> u16 {
        self.mode & S_IFMT
    }

    /// Permission bits without the type.
    #[must_use]
    pub fn permission_bits(&self) -> u16 {
        self.mode & !S_IFMT
    }

    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.file_type_mode() == S_IFREG
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.file_type_mode() == S_IFDIR
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.file_type_mode() == S_IFLNK
    }

    /// Map the mode's type bits onto the directory-record file type.
    #[must_use]
    pub fn file_type(&self) -> Ext2FileType {
        match self.file_type_mode() {
            S_IFREG => Ext2FileType::RegFile,
            S_IFDIR => Ext2FileType::Dir,
            S_IFCHR => Ext2FileType::Chrdev,
            S_IFBLK => Ext2FileType::Blkdev,
            S_IFIFO => Ext2FileType::Fifo,
            S_IFSOCK => Ext2FileType::Sock,
            S_IFLNK => Ext2FileType::Symlink,
            _ => Ext2FileType::Unknown,
        }
    }

    /// A symlink whose target is stored inline in `i_block`.
    ///
    /// Fast symlinks own no data blocks apart from an optional
    /// extended-attribute block, and are shorter than 60 bytes.
    #[must_use]
    pub fn is_fast_symlink(&self, block_size: u32) -> bool {
        if !self.is_symlink() {
            return false;
        }
        let xattr_sectors = if self.file_acl == 0 {
            0
        } else {
            block_size >> 9
        };
        self.blocks == xattr_sectors && self.size < EXT2_FAST_SYMLINK_MAX as u64
    }

    /// Inline target of a fast symlink. `None` for other inodes.
    #[must_use]
    pub fn fast_symlink_target(&self, block_size: u32) -> Option<Vec<u8>> {
        if !self.is_fast_symlink(block_size) {
            return None;
        }
        let raw: Vec<u8> = self.block.iter().flat_map(|p| p.to_le_bytes()).collect();
        let len = usize::try_from(self.size).ok()?.min(raw.len());
        Some(raw[..len].to_vec())
    }

    /// Number of logical blocks needed to hold `size` bytes.
    #[must_use]
    pub fn logical_block_count(&self, block_size: u32) -> u64 {
        self.size.div_ceil(u64::from(block_size))
    }
}

// ── Directory records ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Ext2FileType {
    Unknown = 0,
    RegFile = 1,
    Dir = 2,
    Chrdev = 3,
    Blkdev = 4,
    Fifo = 5,
    Sock = 6,
    Symlink = 7,
}

impl Ext2FileType {
    #[must_use]
    pub fn from_raw(val: u8) -> Self {
        match val {
            1 => Self::RegFile,
            2 => Self::Dir,
            3 => Self::Chrdev,
            4 => Self::Blkdev,
            5 => Self::Fifo,
            6 => Self::Sock,
            7 => Self::Symlink,
            _ => Self::Unknown,
        }
    }
}

/// A borrowed directory record (name points into the block buffer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ext2DirEntryRef<'a> {
    pub inode: u32,
    pub rec_len: u16,
    pub name_len: u8,
    pub file_type: Ext2FileType,
    pub name: &'a [u8],
}

impl Ext2DirEntryRef<'_> {
    #[must_use]
    pub fn to_owned(&self) -> Ext2DirEntry {
        Ext2DirEntry {
            inode: self.inode,
            rec_len: self.rec_len,
            name_len: self.name_len,
            file_type: self.file_type,
            name: self.name.to_vec(),
        }
    }

    /// Deleted records and block padding have inode 0.
    #[must_use]
    pub fn is_unused(&self) -> bool {
        self.inode == 0
    }

    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(self.name).into_owned()
    }
}

/// An owned directory record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2DirEntry {
    pub inode: u32,
    pub rec_len: u16,
    pub name_len: u8,
    pub file_type: Ext2FileType,
    pub name: Vec<u8>,
}

impl Ext2DirEntry {
    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    #[must_use]
    pub fn is_dot(&self) -> bool {
        self.name == b"."
    }

    #[must_use]
    pub fn is_dotdot(&self) -> bool {
        self.name == b".."
    }
}

/// Decode the directory record starting at `offset` within `block`.
///
/// The record must lie entirely inside the block: `rec_len` at least the
/// 8-byte header, not past the block end, and large enough for the name.
pub fn parse_dir_record(block: &[u8], offset: usize) -> Result<Ext2DirEntryRef<'_>, ParseError> {
    let header_end = offset
        .checked_add(EXT2_DIR_RECORD_HEADER)
        .ok_or(ParseError::InvalidField {
            field: "de_rec_len",
            reason: "overflow",
        })?;
    if header_end > block.len() {
        return Err(ParseError::InsufficientData {
            needed: EXT2_DIR_RECORD_HEADER,
            offset,
            actual: block.len().saturating_sub(offset),
        });
    }

    let inode = read_le_u32(block, offset)?;
    let rec_len = read_le_u16(block, offset + 4)?;
    let name_len = read_u8(block, offset + 6)?;
    let file_type = read_u8(block, offset + 7)?;

    if usize::from(rec_len) < EXT2_DIR_RECORD_HEADER {
        return Err(ParseError::InvalidField {
            field: "de_rec_len",
            reason: "rec_len smaller than record header",
        });
    }
    let record_end = offset + usize::from(rec_len);
    if record_end > block.len() {
        return Err(ParseError::InvalidField {
            field: "de_rec_len",
            reason: "record extends past block boundary",
        });
    }
    let name_end = header_end + usize::from(name_len);
    if name_end > record_end {
        return Err(ParseError::InvalidField {
            field: "de_name_len",
            reason: "name extends past rec_len",
        });
    }

    Ok(Ext2DirEntryRef {
        inode,
        rec_len,
        name_len,
        file_type: Ext2FileType::from_raw(file_type),
        name: &block[header_end..name_end],
    })
}
