#![forbid(unsafe_code)]
//! Block mapping: logical block index to position in the indirect block tree.
//!
//! An ext2 inode addresses its data through `i_block[15]`: twelve direct
//! pointers, then one singly, one doubly and one triply indirect pointer.
//! With `P = block_size / 4` pointers per index block, logical block `i`
//! falls in exactly one tier:
//!
//! | Tier | First index | Width | Slots walked |
//! |------|-------------|-------|--------------|
//! | Direct | 0 | 12 | `i` |
//! | Indirect | 12 | P | `i-12` |
//! | DoublyIndirect | 12+P | P² | `r/P`, `r%P` |
//! | TriplyIndirect | 12+P+P² | P³ | `r/P²`, `(r/P)%P`, `r%P` |
//!
//! where `r` is the index relative to the tier start. Everything here is a
//! pure function of the logical index and the block size; I/O happens in the
//! caller's session.

use e2r_error::{Ext2Error, Result};
use e2r_types::{
    BlockSize, EXT2_DIND_BLOCK, EXT2_IND_BLOCK, EXT2_NDIR_BLOCKS, EXT2_TIND_BLOCK,
};
use serde::{Deserialize, Serialize};

/// Deepest indirection used by ext2.
pub const MAX_INDIRECTION: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockTier {
    Direct,
    Indirect,
    DoublyIndirect,
    TriplyIndirect,
}

impl BlockTier {
    pub const ALL: [Self; 4] = [
        Self::Direct,
        Self::Indirect,
        Self::DoublyIndirect,
        Self::TriplyIndirect,
    ];

    /// Number of index blocks between the inode and the data block.
    #[must_use]
    pub fn depth(self) -> usize {
        match self {
            Self::Direct => 0,
            Self::Indirect => 1,
            Self::DoublyIndirect => 2,
            Self::TriplyIndirect => 3,
        }
    }
}

/// Position of one logical block in the inode's block tree.
///
/// `root_slot` indexes `i_block`. For indirect tiers, `offsets[k]` is the
/// pointer slot to follow inside the index block at level `k`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockPath {
    pub tier: BlockTier,
    pub root_slot: usize,
    offsets: [usize; MAX_INDIRECTION],
}

impl BlockPath {
    /// Pointer slots inside each index block, outermost first.
    #[must_use]
    pub fn offsets(&self) -> &[usize] {
        &self.offsets[..self.tier.depth()]
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.tier.depth()
    }

    /// How many index blocks this path shares with `other`.
    ///
    /// The level-0 index block hangs off `i_block[root_slot]`, so it is
    /// shared whenever the tiers match. Level `k` is shared when every slot
    /// above it matches as well. Direct paths share nothing.
    #[must_use]
    pub fn shared_prefix(&self, other: &Self) -> usize {
        if self.tier != other.tier || self.root_slot != other.root_slot {
            return 0;
        }
        let depth = self.depth();
        if depth == 0 {
            return 0;
        }
        let matching_slots = self
            .offsets()
            .iter()
            .zip(other.offsets())
            .take(depth - 1)
            .take_while(|(a, b)| a == b)
            .count();
        1 + matching_slots
    }
}

/// Tier arithmetic for one block size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMap {
    pointers_per_block: u64,
}

impl BlockMap {
    #[must_use]
    pub fn new(block_size: BlockSize) -> Self {
        Self {
            pointers_per_block: block_size.pointers_per_block(),
        }
    }

    #[must_use]
    pub fn pointers_per_block(&self) -> u64 {
        self.pointers_per_block
    }

    /// Number of logical blocks addressed by `tier`.
    #[must_use]
    pub fn tier_width(&self, tier: BlockTier) -> u64 {
        let p = self.pointers_per_block;
        match tier {
            BlockTier::Direct => EXT2_NDIR_BLOCKS as u64,
            BlockTier::Indirect => p,
            BlockTier::DoublyIndirect => p * p,
            BlockTier::TriplyIndirect => p * p * p,
        }
    }

    /// First logical block addressed by `tier`.
    #[must_use]
    pub fn tier_start(&self, tier: BlockTier) -> u64 {
        BlockTier::ALL
            .iter()
            .take_while(|t| **t != tier)
            .map(|t| self.tier_width(*t))
            .sum()
    }

    /// One past the last addressable logical block.
    #[must_use]
    pub fn max_logical_blocks(&self) -> u64 {
        BlockTier::ALL.iter().map(|t| self.tier_width(*t)).sum()
    }

    /// Tier that addresses `logical`.
    pub fn classify(&self, logical: u64) -> Result<BlockTier> {
        let mut start = 0_u64;
        for tier in BlockTier::ALL {
            let end = start + self.tier_width(tier);
            if logical < end {
                return Ok(tier);
            }
            start = end;
        }
        Err(Ext2Error::FileTooLarge { logical })
    }

    /// Resolve `logical` into a root slot plus per-level pointer slots.
    pub fn path(&self, logical: u64) -> Result<BlockPath> {
        let tier = self.classify(logical)?;
        let p = self.pointers_per_block;
        let r = logical - self.tier_start(tier);
        let mut offsets = [0_usize; MAX_INDIRECTION];
        let root_slot = match tier {
            BlockTier::Direct => slot(r)?,
            BlockTier::Indirect => {
                offsets[0] = slot(r)?;
                EXT2_IND_BLOCK
            }
            BlockTier::DoublyIndirect => {
                offsets[0] = slot(r / p)?;
                offsets[1] = slot(r % p)?;
                EXT2_DIND_BLOCK
            }
            BlockTier::TriplyIndirect => {
                offsets[0] = slot(r / (p * p))?;
                offsets[1] = slot((r / p) % p)?;
                offsets[2] = slot(r % p)?;
                EXT2_TIND_BLOCK
            }
        };
        Ok(BlockPath {
            tier,
            root_slot,
            offsets,
        })
    }

    /// Inverse of [`BlockMap::path`].
    #[must_use]
    pub fn logical(&self, path: &BlockPath) -> u64 {
        let p = self.pointers_per_block;
        let start = self.tier_start(path.tier);
        match path.tier {
            BlockTier::Direct => path.root_slot as u64,
            _ => {
                let rel = path
                    .offsets()
                    .iter()
                    .fold(0_u64, |acc, off| acc * p + *off as u64);
                start + rel
            }
        }
    }
}

fn slot(value: u64) -> Result<usize> {
    usize::try_from(value).map_err(|_| Ext2Error::FileTooLarge { logical: value })
}

/// Decode pointer `slot` from an index block.
///
/// Out-of-range slots read as a hole.
#[must_use]
pub fn index_entry(index_block: &[u8], slot: usize) -> u32 {
    let start = slot * 4;
    index_block
        .get(start..start + 4)
        .map_or(0, |b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}
