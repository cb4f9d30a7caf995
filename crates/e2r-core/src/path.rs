#![forbid(unsafe_code)]
//! Absolute path resolution.

use crate::Ext2Fs;
use crate::session::OpenFile;
use e2r_error::{Ext2Error, Result};
use e2r_ondisk::Ext2Inode;
use e2r_types::InodeNumber;
use tracing::trace;

impl Ext2Fs {
    /// Resolve an absolute path to an inode number.
    ///
    /// Empty components are ignored, so `/`, `//` and the empty string all
    /// name the root. Names match byte-for-byte. A relative path is
    /// `NotFound`; a non-directory used as an intermediate component is
    /// `NotDirectory`.
    pub fn resolve_path(&self, path: &str) -> Result<InodeNumber> {
        Ok(self.resolve_path_inode(path)?.0)
    }

    /// Like [`resolve_path`](Self::resolve_path) but also returns the inode.
    pub fn resolve_path_inode(&self, path: &str) -> Result<(InodeNumber, Ext2Inode)> {
        if !path.is_empty() && !path.starts_with('/') {
            return Err(Ext2Error::NotFound(format!("{path}: path is not absolute")));
        }

        let mut ino = InodeNumber::ROOT;
        let mut inode = self.read_inode(ino)?;

        for component in path.split('/').filter(|c| !c.is_empty()) {
            if !inode.is_dir() {
                return Err(Ext2Error::NotDirectory);
            }
            ino = self
                .lookup_in(ino, &inode, component.as_bytes())?
                .ok_or_else(|| Ext2Error::NotFound(component.to_owned()))?;
            inode = self.read_inode(ino)?;
        }

        trace!(path, ino = ino.0, "resolved path");
        Ok((ino, inode))
    }

    /// Scan directory `dir` for `name`.
    pub fn lookup_in(
        &self,
        dir: InodeNumber,
        dir_inode: &Ext2Inode,
        name: &[u8],
    ) -> Result<Option<InodeNumber>> {
        let mut cursor = OpenFile::new(dir, dir_inode.clone(), self.block_size);
        while let Some(entry) = cursor.next_dir_entry(self.block_device())? {
            if entry.name == name {
                return Ok(Some(InodeNumber(u64::from(entry.inode))));
            }
        }
        Ok(None)
    }
}
