#![forbid(unsafe_code)]
//! Block I/O layer.
//!
//! Provides the byte-addressed `ByteDevice` trait with file and in-memory
//! backends, the block-addressed `BlockDevice` trait on top of it, and a
//! read-counting wrapper used to assert how much I/O an operation performs.
//!
//! Every read is positional; no device shares a seek pointer, so a device can
//! be used from several threads at once.

use e2r_error::{Ext2Error, Result};
use e2r_types::{BlockNumber, EXT2_SUPERBLOCK_OFFSET, EXT2_SUPERBLOCK_SIZE};
use parking_lot::Mutex;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// A block of `len` zero bytes.
    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self {
            bytes: vec![0_u8; len],
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

fn out_of_bounds(offset: u64, len: usize, device_len: u64) -> Ext2Error {
    Ext2Error::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("read out of bounds: offset={offset} len={len} device_len={device_len}"),
    ))
}

fn check_range(offset: u64, len: usize, device_len: u64) -> Result<()> {
    let len_u64 = u64::try_from(len)
        .map_err(|_| Ext2Error::Format("read length overflows u64".to_owned()))?;
    let end = offset
        .checked_add(len_u64)
        .ok_or_else(|| Ext2Error::Format("read range overflows u64".to_owned()))?;
    if end > device_len {
        return Err(out_of_bounds(offset, len, device_len));
    }
    Ok(())
}

/// Byte-addressed, read-only device (pread semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

impl<D: ByteDevice + ?Sized> ByteDevice for Arc<D> {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }
}

impl<D: ByteDevice + ?Sized> ByteDevice for Box<D> {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }
}

/// File-backed byte device using positional reads.
///
/// Opened read-only; the image is never modified.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }

    #[must_use]
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }
}

/// In-memory image, used by tests and the synthetic image builder.
#[derive(Debug, Clone)]
pub struct MemoryByteDevice {
    bytes: Arc<[u8]>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::from(bytes),
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.len()).unwrap_or(u64::MAX)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len_bytes())?;
        let start = usize::try_from(offset)
            .map_err(|_| Ext2Error::Format("offset does not fit usize".to_owned()))?;
        buf.copy_from_slice(&self.bytes[start..start + buf.len()]);
        Ok(())
    }
}

/// Block-addressed, read-only I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;
}

impl<B: BlockDevice + ?Sized> BlockDevice for Arc<B> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        (**self).read_block(block)
    }

    fn block_size(&self) -> u32 {
        (**self).block_size()
    }

    fn block_count(&self) -> u64 {
        (**self).block_count()
    }
}

/// Presents a `ByteDevice` as fixed-size blocks.
#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: u32,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    /// Wrap `inner`. A trailing partial block is not addressable.
    pub fn new(inner: D, block_size: u32) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(Ext2Error::Format(format!(
                "invalid block_size={block_size} (must be power of two)"
            )));
        }
        let block_count = inner.len_bytes() / u64::from(block_size);
        Ok(Self {
            inner,
            block_size,
            block_count,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        if block.0 >= self.block_count {
            return Err(Ext2Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "block out of range: block={} block_count={}",
                    block.0, self.block_count
                ),
            )));
        }

        let offset = block
            .0
            .checked_mul(u64::from(self.block_size))
            .ok_or_else(|| Ext2Error::Format("block offset overflow".to_owned()))?;
        let mut buf = vec![
            0_u8;
            usize::try_from(self.block_size).map_err(|_| {
                Ext2Error::Format("block_size does not fit usize".to_owned())
            })?
        ];
        self.inner.read_exact_at(offset, &mut buf)?;
        Ok(BlockBuf::new(buf))
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }
}

/// Counts every block read that reaches the wrapped device.
///
/// Used to verify that sequential reads reuse cached index blocks.
#[derive(Debug)]
pub struct CountingBlockDevice<B: BlockDevice> {
    inner: B,
    reads: AtomicU64,
    history: Mutex<Vec<BlockNumber>>,
}

impl<B: BlockDevice> CountingBlockDevice<B> {
    #[must_use]
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            reads: AtomicU64::new(0),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Number of blocks read since creation or the last `reset`.
    #[must_use]
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Blocks read, in order, since creation or the last `reset`.
    #[must_use]
    pub fn history(&self) -> Vec<BlockNumber> {
        self.history.lock().clone()
    }

    /// How many times `block` has been read.
    #[must_use]
    pub fn reads_of(&self, block: BlockNumber) -> usize {
        self.history.lock().iter().filter(|b| **b == block).count()
    }

    pub fn reset(&self) {
        self.reads.store(0, Ordering::Relaxed);
        self.history.lock().clear();
    }

    #[must_use]
    pub fn inner(&self) -> &B {
        &self.inner
    }
}

impl<B: BlockDevice> BlockDevice for CountingBlockDevice<B> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        let buf = self.inner.read_block(block)?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.history.lock().push(block);
        trace!(block = block.0, "counted block read");
        Ok(buf)
    }

    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }
}

/// Read the ext2 superblock region (1024 bytes at offset 1024).
///
/// A device too short to hold it is reported as `Format`.
pub fn read_ext2_superblock_region(dev: &dyn ByteDevice) -> Result<[u8; EXT2_SUPERBLOCK_SIZE]> {
    let mut buf = [0_u8; EXT2_SUPERBLOCK_SIZE];
    let offset = u64::try_from(EXT2_SUPERBLOCK_OFFSET)
        .map_err(|_| Ext2Error::Format("ext2 superblock offset does not fit u64".to_owned()))?;
    let needed = offset + EXT2_SUPERBLOCK_SIZE as u64;
    if dev.len_bytes() < needed {
        return Err(Ext2Error::Format(format!(
            "image too small for superblock: len={} need={needed}",
            dev.len_bytes()
        )));
    }
    dev.read_exact_at(offset, &mut buf)?;
    Ok(buf)
}
