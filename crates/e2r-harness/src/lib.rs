#![forbid(unsafe_code)]
//! Synthetic ext2 images for tests and benchmarks.
//!
//! [`ImageBuilder`] lays out a small, well-formed ext2 filesystem entirely
//! in memory: superblock, group descriptor table, bitmaps, inode tables,
//! directories, regular files (dense or sparse, up to the triply-indirect
//! tier) and symlinks. The encoder is independent of the reader crates so
//! it can serve as an oracle for them. [`BuiltImage::layouts`] records
//! where every inode's data and index blocks landed, which lets tests
//! predict exact block-read counts.

use anyhow::{Context, Result, bail, ensure};
use e2r_block::MemoryByteDevice;
use e2r_types::{
    EXT2_DIND_BLOCK, EXT2_FAST_SYMLINK_MAX, EXT2_GOOD_OLD_FIRST_INO, EXT2_GOOD_OLD_INODE_SIZE,
    EXT2_GROUP_DESC_SIZE, EXT2_IND_BLOCK, EXT2_N_BLOCKS, EXT2_NAME_LEN, EXT2_NDIR_BLOCKS,
    EXT2_SUPER_MAGIC, EXT2_SUPERBLOCK_OFFSET, EXT2_TIND_BLOCK, InodeNumber, S_IFDIR, S_IFLNK,
    S_IFMT, S_IFREG,
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Timestamp written into every inode and the superblock.
pub const FIXTURE_TIME: u32 = 1_600_000_000;

const FEATURE_INCOMPAT_FILETYPE: u32 = 0x0002;
const DIR_RECORD_HEADER: usize = 8;

// Directory entry file_type codes.
const FT_REG_FILE: u8 = 1;
const FT_DIR: u8 = 2;
const FT_SYMLINK: u8 = 7;

#[derive(Debug, Clone)]
struct DirEntrySpec {
    name: Vec<u8>,
    ino: u64,
    live: bool,
}

#[derive(Debug, Clone)]
enum NodeKind {
    Dir {
        parent: u64,
        entries: Vec<DirEntrySpec>,
    },
    File {
        size: u64,
        chunks: BTreeMap<u64, Vec<u8>>,
    },
    Symlink(Vec<u8>),
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    perm: u16,
    uid: u32,
    gid: u32,
}

/// Where one inode's blocks were placed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InodeLayout {
    /// Logical block -> physical block, for every allocated data block.
    pub data_blocks: BTreeMap<u64, u32>,
    /// Index blocks in allocation order.
    pub index_blocks: Vec<u32>,
}

/// A finished image plus its placement record.
#[derive(Debug, Clone)]
pub struct BuiltImage {
    pub bytes: Vec<u8>,
    pub block_size: u32,
    pub layouts: BTreeMap<InodeNumber, InodeLayout>,
}

impl BuiltImage {
    /// Fresh in-memory device over a copy of the image.
    #[must_use]
    pub fn device(&self) -> MemoryByteDevice {
        MemoryByteDevice::new(self.bytes.clone())
    }

    #[must_use]
    pub fn layout(&self, ino: InodeNumber) -> Option<&InodeLayout> {
        self.layouts.get(&ino)
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        std::fs::write(path, &self.bytes)
            .with_context(|| format!("failed to write image to {}", path.display()))
    }

    /// Byte offset of `block` in the image.
    #[must_use]
    pub fn block_offset(&self, block: u32) -> usize {
        block as usize * self.block_size as usize
    }
}

#[derive(Debug, Clone)]
pub struct ImageBuilder {
    block_size: u32,
    groups: u32,
    blocks_per_group: u32,
    inodes_per_group: u32,
    inode_size: u16,
    revision: u32,
    volume_name: String,
    nodes: BTreeMap<u64, Node>,
    next_ino: u64,
    freed: BTreeSet<u64>,
}

impl ImageBuilder {
    /// One group, 1024 blocks, 64 inodes, revision 1 with 128-byte inodes.
    #[must_use]
    pub fn new(block_size: u32) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            InodeNumber::ROOT.0,
            Node {
                kind: NodeKind::Dir {
                    parent: InodeNumber::ROOT.0,
                    entries: Vec::new(),
                },
                perm: 0o755,
                uid: 0,
                gid: 0,
            },
        );
        Self {
            block_size,
            groups: 1,
            blocks_per_group: 1024,
            inodes_per_group: 64,
            inode_size: EXT2_GOOD_OLD_INODE_SIZE,
            revision: 1,
            volume_name: "e2r-fixture".to_owned(),
            nodes,
            next_ino: u64::from(EXT2_GOOD_OLD_FIRST_INO),
            freed: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn groups(mut self, groups: u32) -> Self {
        self.groups = groups;
        self
    }

    #[must_use]
    pub fn blocks_per_group(mut self, blocks: u32) -> Self {
        self.blocks_per_group = blocks;
        self
    }

    #[must_use]
    pub fn inodes_per_group(mut self, inodes: u32) -> Self {
        self.inodes_per_group = inodes;
        self
    }

    #[must_use]
    pub fn inode_size(mut self, size: u16) -> Self {
        self.inode_size = size;
        self
    }

    /// Revision 0 images use 128-byte inodes and carry no file types in
    /// directory records.
    #[must_use]
    pub fn revision(mut self, rev: u32) -> Self {
        self.revision = rev;
        self
    }

    #[must_use]
    pub fn volume_name(mut self, name: &str) -> Self {
        name.clone_into(&mut self.volume_name);
        self
    }

    #[must_use]
    pub fn root(&self) -> InodeNumber {
        InodeNumber::ROOT
    }

    pub fn mkdir(&mut self, parent: InodeNumber, name: &str) -> Result<InodeNumber> {
        self.add_node(
            parent,
            name,
            Node {
                kind: NodeKind::Dir {
                    parent: parent.0,
                    entries: Vec::new(),
                },
                perm: 0o755,
                uid: 0,
                gid: 0,
            },
        )
    }

    /// Regular file whose blocks are all allocated.
    pub fn add_file(&mut self, parent: InodeNumber, name: &str, data: &[u8]) -> Result<InodeNumber> {
        let chunks = data
            .chunks(self.block_size as usize)
            .enumerate()
            .map(|(i, chunk)| (i as u64, chunk.to_vec()))
            .collect();
        self.add_node(parent, name, Self::file_node(data.len() as u64, chunks))
    }

    /// Regular file of `size` bytes with data only at the given logical
    /// blocks; everything else is a hole.
    pub fn add_sparse_file(
        &mut self,
        parent: InodeNumber,
        name: &str,
        size: u64,
        blocks: &[(u64, &[u8])],
    ) -> Result<InodeNumber> {
        let mut chunks = BTreeMap::new();
        for &(logical, data) in blocks {
            ensure!(
                data.len() <= self.block_size as usize,
                "chunk for logical block {logical} exceeds block size"
            );
            chunks.insert(logical, data.to_vec());
        }
        self.add_node(parent, name, Self::file_node(size, chunks))
    }

    /// Symlink; targets shorter than 60 bytes are stored inline.
    pub fn add_symlink(&mut self, parent: InodeNumber, name: &str, target: &[u8]) -> Result<InodeNumber> {
        ensure!(!target.is_empty(), "symlink target must not be empty");
        self.add_node(
            parent,
            name,
            Node {
                kind: NodeKind::Symlink(target.to_vec()),
                perm: 0o777,
                uid: 0,
                gid: 0,
            },
        )
    }

    /// Add a second name for an existing inode.
    pub fn link(&mut self, parent: InodeNumber, name: &str, target: InodeNumber) -> Result<()> {
        ensure!(
            self.nodes.contains_key(&target.0),
            "link target {target} does not exist"
        );
        self.add_entry(parent, name, target.0)
    }

    /// Turn the named entry into an unused record (inode 0) in place.
    pub fn unlink(&mut self, parent: InodeNumber, name: &str) -> Result<()> {
        let entries = self.dir_entries_mut(parent)?;
        let entry = entries
            .iter_mut()
            .find(|e| e.live && e.name == name.as_bytes())
            .with_context(|| format!("no entry {name:?} in {parent}"))?;
        entry.live = false;
        Ok(())
    }

    pub fn set_owner(&mut self, ino: InodeNumber, uid: u32, gid: u32) -> Result<()> {
        let node = self.node_mut(ino)?;
        node.uid = uid;
        node.gid = gid;
        Ok(())
    }

    pub fn set_permissions(&mut self, ino: InodeNumber, perm: u16) -> Result<()> {
        self.node_mut(ino)?.perm = perm & 0o7777;
        Ok(())
    }

    /// Clear the inode's bitmap bit while leaving its directory entries.
    pub fn mark_inode_free(&mut self, ino: InodeNumber) -> Result<()> {
        ensure!(self.nodes.contains_key(&ino.0), "inode {ino} does not exist");
        self.freed.insert(ino.0);
        Ok(())
    }

    fn file_node(size: u64, chunks: BTreeMap<u64, Vec<u8>>) -> Node {
        Node {
            kind: NodeKind::File { size, chunks },
            perm: 0o644,
            uid: 0,
            gid: 0,
        }
    }

    fn node_mut(&mut self, ino: InodeNumber) -> Result<&mut Node> {
        self.nodes
            .get_mut(&ino.0)
            .with_context(|| format!("inode {ino} does not exist"))
    }

    fn dir_entries_mut(&mut self, dir: InodeNumber) -> Result<&mut Vec<DirEntrySpec>> {
        match &mut self.node_mut(dir)?.kind {
            NodeKind::Dir { entries, .. } => Ok(entries),
            _ => bail!("inode {dir} is not a directory"),
        }
    }

    fn add_entry(&mut self, parent: InodeNumber, name: &str, ino: u64) -> Result<()> {
        ensure!(
            !name.is_empty() && name.len() <= EXT2_NAME_LEN,
            "invalid entry name length {}",
            name.len()
        );
        ensure!(!name.contains('/'), "entry name {name:?} contains '/'");
        ensure!(name != "." && name != "..", "entry name {name:?} is reserved");
        let entries = self.dir_entries_mut(parent)?;
        ensure!(
            !entries.iter().any(|e| e.live && e.name == name.as_bytes()),
            "duplicate entry {name:?} in {parent}"
        );
        entries.push(DirEntrySpec {
            name: name.as_bytes().to_vec(),
            ino,
            live: true,
        });
        Ok(())
    }

    fn add_node(&mut self, parent: InodeNumber, name: &str, node: Node) -> Result<InodeNumber> {
        let ino = self.next_ino;
        let capacity = u64::from(self.groups) * u64::from(self.inodes_per_group);
        ensure!(ino <= capacity, "out of inodes ({capacity} total)");
        self.add_entry(parent, name, ino)?;
        self.nodes.insert(ino, node);
        self.next_ino += 1;
        Ok(InodeNumber(ino))
    }

    // ── Encoding ──────────────────────────────────────────────────────

    pub fn build(&self) -> Result<BuiltImage> {
        let bs = self.block_size;
        ensure!(
            bs.is_power_of_two() && (1024..=32768).contains(&bs),
            "unsupported block size {bs}"
        );
        ensure!(self.groups > 0, "need at least one group");
        ensure!(
            self.blocks_per_group > 0 && self.blocks_per_group <= bs * 8,
            "blocks_per_group must be in 1..={}",
            bs * 8
        );
        ensure!(
            self.inodes_per_group > 0 && self.inodes_per_group <= bs * 8,
            "inodes_per_group must be in 1..={}",
            bs * 8
        );
        ensure!(
            self.revision <= 1,
            "unsupported revision {}",
            self.revision
        );
        ensure!(
            self.revision == 1 || self.inode_size == EXT2_GOOD_OLD_INODE_SIZE,
            "revision 0 requires 128-byte inodes"
        );
        ensure!(
            self.inode_size >= EXT2_GOOD_OLD_INODE_SIZE
                && self.inode_size.is_power_of_two()
                && u32::from(self.inode_size) <= bs,
            "invalid inode size {}",
            self.inode_size
        );

        let first_data_block = u32::from(bs == 1024);
        let blocks_count = first_data_block + self.groups * self.blocks_per_group;
        let inodes_count = self.groups * self.inodes_per_group;
        let gdt_blocks = u32::try_from((self.groups as usize * EXT2_GROUP_DESC_SIZE).div_ceil(bs as usize))?;
        let itable_blocks = (self.inodes_per_group * u32::from(self.inode_size)).div_ceil(bs);

        let mut img = Image::new(bs, blocks_count);
        if first_data_block == 1 {
            img.used[0] = true;
        }

        let mut groups = Vec::with_capacity(self.groups as usize);
        for g in 0..self.groups {
            let start = first_data_block + g * self.blocks_per_group;
            let meta = if g == 0 { start + 1 + gdt_blocks } else { start };
            let desc = GroupMeta {
                block_bitmap: meta,
                inode_bitmap: meta + 1,
                inode_table: meta + 2,
            };
            let end = desc.inode_table + itable_blocks;
            ensure!(
                end <= start + self.blocks_per_group,
                "metadata of group {g} does not fit in {} blocks",
                self.blocks_per_group
            );
            for b in start..end {
                img.used[b as usize] = true;
            }
            groups.push(desc);
        }

        let link_counts = self.link_counts();
        let mut layouts = BTreeMap::new();
        for (&ino, node) in &self.nodes {
            let mut iblock = [0_u32; EXT2_N_BLOCKS];
            let mut layout = InodeLayout::default();
            let (mode, size) = match &node.kind {
                NodeKind::Dir { parent, entries } => {
                    let blocks = self.pack_directory(ino, *parent, entries);
                    let size = (blocks.len() * bs as usize) as u64;
                    let chunks: BTreeMap<u64, Vec<u8>> = blocks
                        .into_iter()
                        .enumerate()
                        .map(|(i, b)| (i as u64, b))
                        .collect();
                    img.map_blocks(&mut iblock, &chunks, &mut layout)?;
                    (S_IFDIR | node.perm, size)
                }
                NodeKind::File { size, chunks } => {
                    img.map_blocks(&mut iblock, chunks, &mut layout)?;
                    (S_IFREG | node.perm, *size)
                }
                NodeKind::Symlink(target) => {
                    if target.len() < EXT2_FAST_SYMLINK_MAX {
                        for (slot, word) in target.chunks(4).enumerate() {
                            let mut raw = [0_u8; 4];
                            raw[..word.len()].copy_from_slice(word);
                            iblock[slot] = u32::from_le_bytes(raw);
                        }
                    } else {
                        let chunks: BTreeMap<u64, Vec<u8>> = target
                            .chunks(bs as usize)
                            .enumerate()
                            .map(|(i, c)| (i as u64, c.to_vec()))
                            .collect();
                        img.map_blocks(&mut iblock, &chunks, &mut layout)?;
                    }
                    (S_IFLNK | node.perm, target.len() as u64)
                }
            };
            ensure!(
                size <= u64::from(u32::MAX) || (self.revision == 1 && mode & S_IFMT == S_IFREG),
                "inode {ino} size {size} needs i_size_high"
            );

            let sectors = (layout.data_blocks.len() + layout.index_blocks.len()) as u64
                * u64::from(bs / 512);
            let record = InodeRecord {
                mode,
                uid: node.uid,
                gid: node.gid,
                size,
                links: link_counts.get(&ino).copied().unwrap_or(0),
                sectors: u32::try_from(sectors)?,
                block: iblock,
                freed: self.freed.contains(&ino),
            };
            let group = ((ino - 1) / u64::from(self.inodes_per_group)) as usize;
            let index = (ino - 1) % u64::from(self.inodes_per_group);
            let offset = groups[group].inode_table as usize * bs as usize
                + index as usize * usize::from(self.inode_size);
            record.encode(&mut img.bytes[offset..offset + usize::from(self.inode_size)]);
            layouts.insert(InodeNumber(ino), layout);
        }

        // Bitmaps and descriptors.
        let mut total_free_blocks = 0_u32;
        let mut total_free_inodes = 0_u32;
        let gdt_offset = (first_data_block as usize + 1) * bs as usize;
        for (g, desc) in groups.iter().enumerate() {
            let g32 = u32::try_from(g)?;
            let start = first_data_block + g32 * self.blocks_per_group;

            let mut free_blocks = 0_u16;
            let bb = desc.block_bitmap as usize * bs as usize;
            for bit in 0..bs * 8 {
                let set = if bit < self.blocks_per_group {
                    let used = img.used[(start + bit) as usize];
                    if !used {
                        free_blocks += 1;
                    }
                    used
                } else {
                    true
                };
                if set {
                    img.bytes[bb + (bit / 8) as usize] |= 1 << (bit % 8);
                }
            }

            let mut free_inodes = 0_u16;
            let mut used_dirs = 0_u16;
            let ib = desc.inode_bitmap as usize * bs as usize;
            for bit in 0..bs * 8 {
                let ino = u64::from(g32 * self.inodes_per_group + bit + 1);
                let set = if bit < self.inodes_per_group {
                    let allocated = ino < u64::from(EXT2_GOOD_OLD_FIRST_INO)
                        || (self.nodes.contains_key(&ino) && !self.freed.contains(&ino));
                    if !allocated {
                        free_inodes += 1;
                    }
                    if allocated
                        && matches!(
                            self.nodes.get(&ino).map(|n| &n.kind),
                            Some(NodeKind::Dir { .. })
                        )
                    {
                        used_dirs += 1;
                    }
                    allocated
                } else {
                    true
                };
                if set {
                    img.bytes[ib + (bit / 8) as usize] |= 1 << (bit % 8);
                }
            }

            total_free_blocks += u32::from(free_blocks);
            total_free_inodes += u32::from(free_inodes);

            let d = &mut img.bytes[gdt_offset + g * EXT2_GROUP_DESC_SIZE..][..EXT2_GROUP_DESC_SIZE];
            put_u32(d, 0x00, desc.block_bitmap);
            put_u32(d, 0x04, desc.inode_bitmap);
            put_u32(d, 0x08, desc.inode_table);
            put_u16(d, 0x0C, free_blocks);
            put_u16(d, 0x0E, free_inodes);
            put_u16(d, 0x10, used_dirs);
        }

        let sb = &mut img.bytes[EXT2_SUPERBLOCK_OFFSET..EXT2_SUPERBLOCK_OFFSET + 1024];
        let log = bs.trailing_zeros() - 10;
        put_u32(sb, 0x00, inodes_count);
        put_u32(sb, 0x04, blocks_count);
        put_u32(sb, 0x08, 0);
        put_u32(sb, 0x0C, total_free_blocks);
        put_u32(sb, 0x10, total_free_inodes);
        put_u32(sb, 0x14, first_data_block);
        put_u32(sb, 0x18, log);
        put_u32(sb, 0x1C, log);
        put_u32(sb, 0x20, self.blocks_per_group);
        put_u32(sb, 0x24, self.blocks_per_group);
        put_u32(sb, 0x28, self.inodes_per_group);
        put_u32(sb, 0x2C, FIXTURE_TIME);
        put_u32(sb, 0x30, FIXTURE_TIME);
        put_u16(sb, 0x34, 0);
        put_u16(sb, 0x36, 20);
        put_u16(sb, 0x38, EXT2_SUPER_MAGIC);
        put_u16(sb, 0x3A, 1);
        put_u16(sb, 0x3C, 1);
        put_u32(sb, 0x40, FIXTURE_TIME);
        put_u32(sb, 0x4C, self.revision);
        if self.revision >= 1 {
            put_u32(sb, 0x54, EXT2_GOOD_OLD_FIRST_INO);
            put_u16(sb, 0x58, self.inode_size);
            put_u32(sb, 0x60, FEATURE_INCOMPAT_FILETYPE);
        }
        for (i, b) in sb[0x68..0x78].iter_mut().enumerate() {
            *b = 0xE2 ^ u8::try_from(i)?;
        }
        let name = self.volume_name.as_bytes();
        let len = name.len().min(16);
        sb[0x78..0x78 + len].copy_from_slice(&name[..len]);

        Ok(BuiltImage {
            bytes: img.bytes,
            block_size: bs,
            layouts,
        })
    }

    /// Names pointing at each inode, counting `.` and `..`.
    fn link_counts(&self) -> BTreeMap<u64, u16> {
        let mut counts = BTreeMap::new();
        for (&ino, node) in &self.nodes {
            if let NodeKind::Dir { parent, entries } = &node.kind {
                *counts.entry(ino).or_insert(0) += 1;
                *counts.entry(*parent).or_insert(0) += 1;
                for e in entries.iter().filter(|e| e.live) {
                    *counts.entry(e.ino).or_insert(0) += 1;
                }
            }
        }
        counts
    }

    fn file_type_of(&self, ino: u64) -> u8 {
        if self.revision == 0 {
            return 0;
        }
        match self.nodes.get(&ino).map(|n| &n.kind) {
            Some(NodeKind::Dir { .. }) => FT_DIR,
            Some(NodeKind::Symlink(_)) => FT_SYMLINK,
            _ => FT_REG_FILE,
        }
    }

    /// Tile directory records into blocks; the last record of each block
    /// absorbs the slack.
    fn pack_directory(&self, ino: u64, parent: u64, entries: &[DirEntrySpec]) -> Vec<Vec<u8>> {
        let bs = self.block_size as usize;
        let dot = [
            DirEntrySpec {
                name: b".".to_vec(),
                ino,
                live: true,
            },
            DirEntrySpec {
                name: b"..".to_vec(),
                ino: parent,
                live: true,
            },
        ];

        let mut blocks = Vec::new();
        let mut block = vec![0_u8; bs];
        let mut off = 0_usize;
        let mut last: Option<usize> = None;
        for entry in dot.iter().chain(entries) {
            let need = (DIR_RECORD_HEADER + entry.name.len()).next_multiple_of(4);
            if off + need > bs {
                if let Some(prev) = last {
                    set_rec_len(&mut block, prev, bs - prev);
                }
                blocks.push(std::mem::replace(&mut block, vec![0_u8; bs]));
                off = 0;
            }
            let rec_ino = if entry.live {
                u32::try_from(entry.ino).unwrap_or(0)
            } else {
                0
            };
            put_u32(&mut block, off, rec_ino);
            set_rec_len(&mut block, off, need);
            block[off + 6] = u8::try_from(entry.name.len()).unwrap_or(u8::MAX);
            block[off + 7] = self.file_type_of(entry.ino);
            block[off + DIR_RECORD_HEADER..off + DIR_RECORD_HEADER + entry.name.len()]
                .copy_from_slice(&entry.name);
            last = Some(off);
            off += need;
        }
        if let Some(prev) = last {
            set_rec_len(&mut block, prev, bs - prev);
        }
        blocks.push(block);
        blocks
    }
}

#[derive(Debug, Clone, Copy)]
struct GroupMeta {
    block_bitmap: u32,
    inode_bitmap: u32,
    inode_table: u32,
}

/// Image bytes plus a forward-only block allocator.
struct Image {
    bytes: Vec<u8>,
    bs: usize,
    used: Vec<bool>,
    cursor: usize,
}

impl Image {
    fn new(block_size: u32, blocks_count: u32) -> Self {
        Self {
            bytes: vec![0_u8; blocks_count as usize * block_size as usize],
            bs: block_size as usize,
            used: vec![false; blocks_count as usize],
            cursor: 0,
        }
    }

    fn alloc(&mut self) -> Result<u32> {
        while self.cursor < self.used.len() && self.used[self.cursor] {
            self.cursor += 1;
        }
        ensure!(self.cursor < self.used.len(), "image is out of blocks");
        self.used[self.cursor] = true;
        Ok(u32::try_from(self.cursor)?)
    }

    fn ptr(&self, table: u32, slot: usize) -> u32 {
        let at = table as usize * self.bs + slot * 4;
        u32::from_le_bytes([
            self.bytes[at],
            self.bytes[at + 1],
            self.bytes[at + 2],
            self.bytes[at + 3],
        ])
    }

    fn set_ptr(&mut self, table: u32, slot: usize, value: u32) {
        let at = table as usize * self.bs + slot * 4;
        self.bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn child(&mut self, table: u32, slot: usize, layout: &mut InodeLayout) -> Result<u32> {
        let existing = self.ptr(table, slot);
        if existing != 0 {
            return Ok(existing);
        }
        let block = self.alloc()?;
        layout.index_blocks.push(block);
        self.set_ptr(table, slot, block);
        Ok(block)
    }

    fn map_blocks(
        &mut self,
        iblock: &mut [u32; EXT2_N_BLOCKS],
        chunks: &BTreeMap<u64, Vec<u8>>,
        layout: &mut InodeLayout,
    ) -> Result<()> {
        for (&logical, data) in chunks {
            let phys = self.alloc()?;
            let at = phys as usize * self.bs;
            self.bytes[at..at + data.len()].copy_from_slice(data);
            self.place(iblock, logical, phys, layout)?;
            layout.data_blocks.insert(logical, phys);
        }
        Ok(())
    }

    fn place(
        &mut self,
        iblock: &mut [u32; EXT2_N_BLOCKS],
        logical: u64,
        phys: u32,
        layout: &mut InodeLayout,
    ) -> Result<()> {
        let p = (self.bs / 4) as u64;
        let ndir = EXT2_NDIR_BLOCKS as u64;
        if logical < ndir {
            iblock[logical as usize] = phys;
            return Ok(());
        }
        let mut rel = logical - ndir;
        let (root_slot, depth) = if rel < p {
            (EXT2_IND_BLOCK, 1)
        } else if rel - p < p * p {
            rel -= p;
            (EXT2_DIND_BLOCK, 2)
        } else {
            rel -= p + p * p;
            if rel >= p * p * p {
                bail!("logical block {logical} beyond triply-indirect range");
            }
            (EXT2_TIND_BLOCK, 3)
        };

        let mut offsets = [0_usize; 3];
        let mut r = rel;
        for d in (0..depth).rev() {
            offsets[d] = (r % p) as usize;
            r /= p;
        }

        if iblock[root_slot] == 0 {
            let block = self.alloc()?;
            layout.index_blocks.push(block);
            iblock[root_slot] = block;
        }
        let mut table = iblock[root_slot];
        for &off in &offsets[..depth - 1] {
            table = self.child(table, off, layout)?;
        }
        self.set_ptr(table, offsets[depth - 1], phys);
        Ok(())
    }
}

struct InodeRecord {
    mode: u16,
    uid: u32,
    gid: u32,
    size: u64,
    links: u16,
    sectors: u32,
    block: [u32; EXT2_N_BLOCKS],
    freed: bool,
}

impl InodeRecord {
    fn encode(&self, out: &mut [u8]) {
        put_u16(out, 0x00, self.mode);
        put_u16(out, 0x02, (self.uid & 0xFFFF) as u16);
        put_u32(out, 0x04, (self.size & 0xFFFF_FFFF) as u32);
        put_u32(out, 0x08, FIXTURE_TIME);
        put_u32(out, 0x0C, FIXTURE_TIME);
        put_u32(out, 0x10, FIXTURE_TIME);
        put_u32(out, 0x14, if self.freed { FIXTURE_TIME } else { 0 });
        put_u16(out, 0x18, (self.gid & 0xFFFF) as u16);
        put_u16(out, 0x1A, self.links);
        put_u32(out, 0x1C, self.sectors);
        for (slot, ptr) in self.block.iter().enumerate() {
            put_u32(out, 0x28 + slot * 4, *ptr);
        }
        put_u32(out, 0x6C, (self.size >> 32) as u32);
        put_u16(out, 0x78, (self.uid >> 16) as u16);
        put_u16(out, 0x7A, (self.gid >> 16) as u16);
    }
}

fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn set_rec_len(block: &mut [u8], offset: usize, len: usize) {
    put_u16(block, offset + 4, u16::try_from(len).unwrap_or(u16::MAX));
}

/// Root holding `test` ("TEST\n") and `test2`, in that order.
pub fn sample_image() -> Result<BuiltImage> {
    let mut b = ImageBuilder::new(1024);
    let root = b.root();
    b.add_file(root, "test", b"TEST\n")?;
    b.add_file(root, "test2", b"second file\n")?;
    b.build()
}
