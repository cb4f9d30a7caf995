#![forbid(unsafe_code)]
//! Device-read accounting for path lookup and the per-handle block cache.

use e2r::{
    BlockNumber, ByteBlockDevice, CountingBlockDevice, Ext2Fs, InodeNumber, MemoryByteDevice,
    OpenOptions,
};
use e2r_harness::{BuiltImage, ImageBuilder, sample_image};
use std::sync::Arc;

type Counter = CountingBlockDevice<ByteBlockDevice<MemoryByteDevice>>;

fn mount_counted(image: &BuiltImage) -> (Ext2Fs, Arc<Counter>) {
    let dev = ByteBlockDevice::new(image.device(), image.block_size).expect("block device");
    let counter = Arc::new(CountingBlockDevice::new(dev));
    let fs = Ext2Fs::from_block_device(counter.clone(), &OpenOptions::default()).expect("mount");
    (fs, counter)
}

/// 12 direct + 256 indirect + 300 doubly-indirect blocks at 1 KiB.
const DOUBLY_BLOCKS: usize = 12 + 256 + 300;

fn doubly_image() -> (BuiltImage, InodeNumber, Vec<u8>) {
    let payload: Vec<u8> = (0..DOUBLY_BLOCKS * 1024)
        .map(|i| ((i / 1024) % 251) as u8)
        .collect();
    let mut b = ImageBuilder::new(1024);
    let root = b.root();
    let ino = b.add_file(root, "big", &payload).expect("file");
    (b.build().expect("image"), ino, payload)
}

#[test]
fn path_lookup_reads_metadata_fresh_each_time() {
    let (fs, counter) = mount_counted(&sample_image().unwrap());
    counter.reset();

    // Root inode (descriptor, bitmap, table), one root dir block, then
    // the target inode (descriptor, bitmap, table).
    let fh = fs.open_file("/test").unwrap();
    assert_eq!(counter.reads(), 7);
    fs.close(fh).unwrap();

    let fh = fs.open_file("/test").unwrap();
    assert_eq!(counter.reads(), 14);
    fs.close(fh).unwrap();
}

#[test]
fn sequential_read_fetches_every_block_once() {
    let (image, ino, payload) = doubly_image();
    let layout = image.layout(ino).unwrap().clone();
    assert_eq!(layout.data_blocks.len(), DOUBLY_BLOCKS);
    // Single-indirect, doubly-indirect and two second-level index blocks.
    assert_eq!(layout.index_blocks.len(), 4);

    let (fs, counter) = mount_counted(&image);
    let fh = fs.open_file("/big").unwrap();
    counter.reset();

    let mut got = Vec::with_capacity(payload.len());
    let mut offset = 0_u64;
    loop {
        let chunk = fs.read(fh, 4096, offset).unwrap();
        if chunk.is_empty() {
            break;
        }
        offset += chunk.len() as u64;
        got.extend_from_slice(&chunk);
    }
    assert_eq!(got, payload);
    assert_eq!(counter.reads(), (DOUBLY_BLOCKS + 4) as u64);

    for &phys in layout.data_blocks.values() {
        assert_eq!(counter.reads_of(BlockNumber(u64::from(phys))), 1);
    }
    for &phys in &layout.index_blocks {
        assert_eq!(counter.reads_of(BlockNumber(u64::from(phys))), 1);
    }
    fs.close(fh).unwrap();
}

#[test]
fn jumping_between_subtrees_refetches_only_what_changed() {
    let (image, _, payload) = doubly_image();
    let (fs, counter) = mount_counted(&image);
    let fh = fs.open_file("/big").unwrap();
    counter.reset();

    let at = |logical: u64| logical * 1024;
    let first_dind = 12 + 256_u64;

    // Doubly-indirect root, first second-level block, data.
    fs.read(fh, 1, at(first_dind)).unwrap();
    assert_eq!(counter.reads(), 3);

    // Second subtree: the doubly-indirect root is reused.
    fs.read(fh, 1, at(first_dind + 256)).unwrap();
    assert_eq!(counter.reads(), 5);

    // Back to the first subtree.
    let got = fs.read(fh, 1, at(first_dind + 1)).unwrap();
    assert_eq!(got[0], payload[usize::try_from(at(first_dind + 1)).unwrap()]);
    assert_eq!(counter.reads(), 7);

    // Same block again is served from the session.
    fs.read(fh, 10, at(first_dind + 1) + 5).unwrap();
    assert_eq!(counter.reads(), 7);

    // Direct block, then the whole doubly-indirect path again.
    fs.read(fh, 1, at(5)).unwrap();
    assert_eq!(counter.reads(), 8);
    fs.read(fh, 1, at(first_dind + 1)).unwrap();
    assert_eq!(counter.reads(), 11);

    fs.close(fh).unwrap();
}

#[test]
fn repeated_reads_are_identical() {
    let (image, _, payload) = doubly_image();
    let (fs, _) = mount_counted(&image);
    let fh = fs.open_file("/big").unwrap();
    let ranges = [(0_u64, 100_usize), (300_000, 5000), (12 * 1024 - 3, 10), (0, 100)];
    let first: Vec<Vec<u8>> = ranges
        .iter()
        .map(|&(off, len)| fs.read(fh, len, off).unwrap())
        .collect();
    let second: Vec<Vec<u8>> = ranges
        .iter()
        .map(|&(off, len)| fs.read(fh, len, off).unwrap())
        .collect();
    assert_eq!(first, second);
    for (got, &(off, len)) in first.iter().zip(&ranges) {
        let off = usize::try_from(off).unwrap();
        assert_eq!(got.as_slice(), &payload[off..off + len]);
    }
    fs.close(fh).unwrap();
}

#[test]
fn handles_keep_separate_caches() {
    let (image, _, _) = doubly_image();
    let (fs, counter) = mount_counted(&image);
    let h1 = fs.open_file("/big").unwrap();
    let h2 = fs.open_file("/big").unwrap();
    counter.reset();

    fs.read(h1, 1, 0).unwrap();
    fs.read(h2, 1, 0).unwrap();
    assert_eq!(counter.reads(), 2);
    fs.read(h1, 1, 0).unwrap();
    fs.read(h2, 1, 0).unwrap();
    assert_eq!(counter.reads(), 2);

    fs.close(h1).unwrap();
    fs.close(h2).unwrap();
}
