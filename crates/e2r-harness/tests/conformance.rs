#![forbid(unsafe_code)]
//! Driver behaviour against synthetic images.

use e2r::{Ext2Error, Ext2Fs, FileType, InodeNumber, OpenOptions};
use e2r_harness::{BuiltImage, FIXTURE_TIME, ImageBuilder, sample_image};
use std::time::{Duration, SystemTime};

fn mount(image: &BuiltImage) -> Ext2Fs {
    Ext2Fs::from_device(Box::new(image.device()), &OpenOptions::default()).expect("mount")
}

fn read_all_names(fs: &Ext2Fs, path: &str) -> Vec<String> {
    let dh = fs.open_directory(path).expect("opendir");
    let mut names = Vec::new();
    while let Some(name) = fs.read_directory_entry(dh).expect("readdir") {
        names.push(name);
    }
    fs.close_directory(dh).expect("closedir");
    names
}

fn le32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Byte offset of inode `ino` in a single-group image.
fn inode_offset(image: &BuiltImage, ino: u64) -> usize {
    let bs = image.block_size as usize;
    let gdt = if bs == 1024 { 2 * bs } else { bs };
    let inode_table = le32(&image.bytes, gdt + 8) as usize;
    let inode_size = usize::from(u16::from_le_bytes([
        image.bytes[1024 + 0x58],
        image.bytes[1024 + 0x59],
    ]));
    inode_table * bs + (ino as usize - 1) * inode_size
}

#[test]
fn sample_file_reads_back() {
    let fs = mount(&sample_image().expect("image"));
    let fh = fs.open_file("/test").expect("open");
    let data = fs.read(fh, 6, 0).expect("read");
    assert_eq!(data.len(), 5);
    assert_eq!(data, b"TEST\n");
    fs.close(fh).expect("close");
}

#[test]
fn sample_root_listing() {
    let fs = mount(&sample_image().expect("image"));
    assert_eq!(read_all_names(&fs, "/"), vec![".", "..", "test", "test2"]);
}

#[test]
fn missing_deep_path_is_enoent() {
    let fs = mount(&sample_image().expect("image"));
    let err = fs
        .open_file("/hello/there/general/kenobi")
        .expect_err("missing");
    assert_eq!(err.to_errno(), libc::ENOENT);
    let err = fs.get_attributes("/hello").expect_err("missing");
    assert!(matches!(err, Ext2Error::NotFound(_)));
}

#[test]
fn file_as_intermediate_component_is_enotdir() {
    let fs = mount(&sample_image().expect("image"));
    let err = fs.open_file("/test/nested").expect_err("not a dir");
    assert!(matches!(err, Ext2Error::NotDirectory));
    assert_eq!(err.to_errno(), libc::ENOTDIR);
}

#[test]
fn nested_directories_resolve() {
    let mut b = ImageBuilder::new(1024);
    let root = b.root();
    let a = b.mkdir(root, "a").unwrap();
    let ab = b.mkdir(a, "b").unwrap();
    let abc = b.mkdir(ab, "c").unwrap();
    b.add_file(abc, "leaf.txt", b"deep contents").unwrap();
    let fs = mount(&b.build().unwrap());

    let fh = fs.open_file("/a/b/c/leaf.txt").expect("open");
    assert_eq!(fs.read(fh, 100, 0).unwrap(), b"deep contents");
    fs.close(fh).unwrap();

    assert_eq!(fs.resolve_path("//a//b/c/").unwrap(), abc);
    assert_eq!(read_all_names(&fs, "/a/b"), vec![".", "..", "c"]);

    // `..` is an ordinary entry pointing at the parent.
    assert_eq!(fs.resolve_path("/a/b/..").unwrap(), a);
    assert_eq!(fs.resolve_path("/..").unwrap(), InodeNumber::ROOT);

    let attr = fs.get_attributes("/a").unwrap();
    assert_eq!(attr.kind, FileType::Directory);
    assert_eq!(attr.nlink, 3);
    assert_eq!(attr.perm, 0o755);
    assert_eq!(fs.get_attributes("/").unwrap().nlink, 3);
}

#[test]
fn attributes_carry_times_and_owners() {
    let mut b = ImageBuilder::new(1024);
    let root = b.root();
    let f = b.add_file(root, "owned", b"x").unwrap();
    b.set_owner(f, 70_000, 100_001).unwrap();
    b.set_permissions(f, 0o4750).unwrap();
    let fs = mount(&b.build().unwrap());

    let attr = fs.get_attributes("/owned").unwrap();
    assert_eq!(attr.uid, 70_000);
    assert_eq!(attr.gid, 100_001);
    assert_eq!(attr.perm, 0o4750);
    assert_eq!(attr.mode & 0o170_000, 0o100_000);
    assert_eq!(attr.blocks, 2);
    let t = SystemTime::UNIX_EPOCH + Duration::from_secs(u64::from(FIXTURE_TIME));
    assert_eq!(attr.mtime, t);
    assert_eq!(attr.atime, t);
    assert_eq!(attr.ctime, t);
}

#[test]
fn hard_link_counts() {
    let mut b = ImageBuilder::new(1024);
    let root = b.root();
    let f = b.add_file(root, "one", b"shared").unwrap();
    b.link(root, "two", f).unwrap();
    let fs = mount(&b.build().unwrap());
    assert_eq!(fs.resolve_path("/two").unwrap(), f);
    assert_eq!(fs.get_attributes("/one").unwrap().nlink, 2);
}

#[test]
fn unused_records_are_skipped() {
    let mut b = ImageBuilder::new(1024);
    let root = b.root();
    b.add_file(root, "keep", b"k").unwrap();
    b.add_file(root, "gone", b"g").unwrap();
    b.add_file(root, "also", b"a").unwrap();
    b.unlink(root, "gone").unwrap();
    let fs = mount(&b.build().unwrap());

    assert_eq!(read_all_names(&fs, "/"), vec![".", "..", "keep", "also"]);
    assert!(matches!(
        fs.resolve_path("/gone"),
        Err(Ext2Error::NotFound(_))
    ));
}

#[test]
fn large_directory_spans_blocks() {
    let mut b = ImageBuilder::new(1024).inodes_per_group(256);
    let root = b.root();
    let expected: Vec<String> = (0..150).map(|i| format!("entry-{i:04}-padding-name")).collect();
    for name in &expected {
        b.add_file(root, name, name.as_bytes()).unwrap();
    }
    let image = b.build().unwrap();
    assert!(image.layout(InodeNumber::ROOT).unwrap().data_blocks.len() > 3);
    let fs = mount(&image);

    let names = read_all_names(&fs, "/");
    assert_eq!(&names[..2], &[".", ".."]);
    assert_eq!(&names[2..], expected.as_slice());

    // Lookup reaches entries in the last block too.
    let last = expected.last().unwrap();
    let fh = fs.open_file(&format!("/{last}")).unwrap();
    assert_eq!(fs.read(fh, 100, 0).unwrap(), last.as_bytes());
    fs.close(fh).unwrap();
}

#[test]
fn freed_inode_is_refused() {
    let mut b = ImageBuilder::new(1024);
    let root = b.root();
    let f = b.add_file(root, "stale", b"old").unwrap();
    b.mark_inode_free(f).unwrap();
    let fs = mount(&b.build().unwrap());

    let err = fs.open_file("/stale").expect_err("freed");
    assert!(matches!(err, Ext2Error::InodeFreed { ino } if ino == f.0));
    assert_eq!(err.to_errno(), libc::ENOENT);
    // The directory itself still lists the name.
    assert!(read_all_names(&fs, "/").contains(&"stale".to_owned()));
}

#[test]
fn corrupt_directory_record_is_eio() {
    let mut image = sample_image().unwrap();
    let phys = image.layout(InodeNumber::ROOT).unwrap().data_blocks[&0];
    let at = image.block_offset(phys) + 4;
    image.bytes[at..at + 2].copy_from_slice(&3_u16.to_le_bytes());
    let fs = mount(&image);

    let dh = fs.open_directory("/").expect("opendir needs no records");
    let err = fs.read_directory_entry(dh).expect_err("corrupt");
    assert!(matches!(err, Ext2Error::CorruptDirectory { offset: 0, .. }));
    assert_eq!(err.to_errno(), libc::EIO);
    fs.close_directory(dh).unwrap();

    assert!(matches!(
        fs.resolve_path("/test"),
        Err(Ext2Error::CorruptDirectory { .. })
    ));
}

#[test]
fn pointer_past_device_is_corruption() {
    let mut image = sample_image().unwrap();
    let ino = {
        let fs = mount(&image);
        fs.resolve_path("/test").unwrap()
    };
    let at = inode_offset(&image, ino.0) + 0x28;
    image.bytes[at..at + 4].copy_from_slice(&50_000_u32.to_le_bytes());
    let fs = mount(&image);

    let fh = fs.open_file("/test").unwrap();
    let err = fs.read(fh, 5, 0).expect_err("bad pointer");
    assert!(matches!(err, Ext2Error::Corruption { block: 50_000, .. }));
    assert_eq!(err.to_errno(), libc::EIO);
    fs.close(fh).unwrap();
}

#[test]
fn sparse_file_holes_read_as_zero() {
    let mut b = ImageBuilder::new(1024);
    let root = b.root();
    let size = 40 * 1024;
    b.add_sparse_file(root, "sparse", size, &[(0, b"head"), (30, b"middle")])
        .unwrap();
    let fs = mount(&b.build().unwrap());

    let fh = fs.open_file("/sparse").unwrap();
    let all = fs.read(fh, usize::try_from(size).unwrap() + 10, 0).unwrap();
    assert_eq!(all.len(), 40 * 1024);
    assert_eq!(&all[..4], b"head");
    assert!(all[4..30 * 1024].iter().all(|&b| b == 0));
    assert_eq!(&all[30 * 1024..30 * 1024 + 6], b"middle");
    assert!(all[30 * 1024 + 6..].iter().all(|&b| b == 0));

    assert_eq!(fs.read(fh, 4, 5 * 1024).unwrap(), vec![0; 4]);
    fs.close(fh).unwrap();
}

#[test]
fn triply_indirect_block_is_reachable() {
    let mut b = ImageBuilder::new(1024);
    let root = b.root();
    let logical: u64 = 12 + 256 + 65_536 + 70_000;
    let size = (logical + 1) * 1024;
    b.add_sparse_file(root, "far", size, &[(logical, b"the far end"), (3, b"near")])
        .unwrap();
    let fs = mount(&b.build().unwrap());

    let attr = fs.get_attributes("/far").unwrap();
    assert_eq!(attr.size, size);
    let fh = fs.open_file("/far").unwrap();
    assert_eq!(fs.read(fh, 11, logical * 1024).unwrap(), b"the far end");
    assert_eq!(fs.read(fh, 4, 3 * 1024).unwrap(), b"near");
    // Tail of the last block is zero up to end of file.
    let tail = fs.read(fh, 4096, logical * 1024 + 11).unwrap();
    assert_eq!(tail.len(), 1024 - 11);
    assert!(tail.iter().all(|&b| b == 0));
    fs.close(fh).unwrap();
}

#[test]
fn large_file_size_uses_high_word() {
    let mut b = ImageBuilder::new(4096);
    let root = b.root();
    let size: u64 = 5 * 1024 * 1024 * 1024;
    let logical = 1_200_000_u64;
    b.add_sparse_file(root, "huge", size, &[(logical, b"beyond 4 GiB")])
        .unwrap();
    let fs = mount(&b.build().unwrap());

    assert_eq!(fs.get_attributes("/huge").unwrap().size, size);
    let fh = fs.open_file("/huge").unwrap();
    assert_eq!(fs.read(fh, 12, logical * 4096).unwrap(), b"beyond 4 GiB");
    assert!(fs.read(fh, 10, size).unwrap().is_empty());
    fs.close(fh).unwrap();
}

#[test]
fn four_k_image_round_trip() {
    let mut b = ImageBuilder::new(4096).inode_size(256).volume_name("big-blocks");
    let root = b.root();
    let docs = b.mkdir(root, "docs").unwrap();
    let payload: Vec<u8> = (0..20_000_u32).map(|i| (i % 251) as u8).collect();
    b.add_file(docs, "data.bin", &payload).unwrap();
    let fs = mount(&b.build().unwrap());

    let geo = fs.stat_fs();
    assert_eq!(geo.block_size, 4096);
    assert_eq!(geo.inode_size, 256);
    assert_eq!(geo.first_data_block, 0);
    assert_eq!(geo.volume_name, "big-blocks");

    let fh = fs.open_file("/docs/data.bin").unwrap();
    assert_eq!(fs.read(fh, 30_000, 0).unwrap(), payload);
    assert_eq!(fs.read(fh, 100, 4090).unwrap(), &payload[4090..4190]);
    fs.close(fh).unwrap();
    assert_eq!(fs.get_attributes("/docs/data.bin").unwrap().blksize, 4096);
}

#[test]
fn two_k_image_reads() {
    let mut b = ImageBuilder::new(2048);
    let root = b.root();
    let payload = vec![0xA5_u8; 2048 * 13 + 7];
    b.add_file(root, "f", &payload).unwrap();
    let fs = mount(&b.build().unwrap());
    let fh = fs.open_file("/f").unwrap();
    assert_eq!(fs.read(fh, payload.len() + 1, 0).unwrap(), payload);
    fs.close(fh).unwrap();
}

#[test]
fn revision_zero_image() {
    let mut b = ImageBuilder::new(1024).revision(0);
    let root = b.root();
    b.add_file(root, "old", b"good old format").unwrap();
    let fs = mount(&b.build().unwrap());

    let geo = fs.stat_fs();
    assert_eq!(geo.rev_level, 0);
    assert_eq!(geo.inode_size, 128);
    assert_eq!(read_all_names(&fs, "/"), vec![".", "..", "old"]);
    let fh = fs.open_file("/old").unwrap();
    assert_eq!(fs.read(fh, 64, 0).unwrap(), b"good old format");
    fs.close(fh).unwrap();
}

#[test]
fn inodes_in_later_groups() {
    let mut b = ImageBuilder::new(1024)
        .groups(3)
        .blocks_per_group(512)
        .inodes_per_group(16);
    let root = b.root();
    let mut inos = Vec::new();
    for i in 0..30 {
        inos.push(b.add_file(root, &format!("f{i}"), format!("body {i}").as_bytes()).unwrap());
    }
    let fs = mount(&b.build().unwrap());
    assert_eq!(fs.stat_fs().groups_count, 3);

    // f29 is inode 40, in group 2.
    assert_eq!(inos[29], InodeNumber(40));
    let fh = fs.open_file("/f29").unwrap();
    assert_eq!(fs.read(fh, 64, 0).unwrap(), b"body 29");
    fs.close(fh).unwrap();

    let gd = fs.read_group_desc(e2r::GroupNumber(2)).unwrap();
    assert_eq!(gd.free_inodes_count, 16 - 8);
}

#[test]
fn symlink_targets() {
    let mut b = ImageBuilder::new(1024);
    let root = b.root();
    b.add_file(root, "real", b"r").unwrap();
    b.add_symlink(root, "short", b"real").unwrap();
    let exactly_59 = vec![b'a'; 59];
    let exactly_60 = vec![b'b'; 60];
    b.add_symlink(root, "edge59", &exactly_59).unwrap();
    b.add_symlink(root, "edge60", &exactly_60).unwrap();
    let fs = mount(&b.build().unwrap());

    assert_eq!(fs.read_link("/short", 256).unwrap(), b"real");
    assert_eq!(fs.read_link("/edge59", 256).unwrap(), exactly_59);
    assert_eq!(fs.read_link("/edge60", 256).unwrap(), exactly_60);
    assert_eq!(fs.read_link("/edge60", 0).unwrap(), Vec::<u8>::new());
    assert_eq!(fs.get_attributes("/edge60").unwrap().size, 60);

    let err = fs.read_link("/real", 10).expect_err("not a link");
    assert_eq!(err.to_errno(), libc::EINVAL);
    let err = fs.read_link("/", 10).expect_err("not a link");
    assert!(matches!(err, Ext2Error::NotSymlink));
}

#[test]
fn handles_are_independent() {
    let mut b = ImageBuilder::new(1024);
    let root = b.root();
    let a: Vec<u8> = (0..5000_u32).map(|i| (i % 7) as u8).collect();
    let c: Vec<u8> = (0..5000_u32).map(|i| (i % 13) as u8).collect();
    b.add_file(root, "a", &a).unwrap();
    b.add_file(root, "c", &c).unwrap();
    let fs = mount(&b.build().unwrap());

    let ha = fs.open_file("/a").unwrap();
    let hc = fs.open_file("/c").unwrap();
    let ha2 = fs.open_file("/a").unwrap();
    assert_ne!(ha, ha2);
    assert_eq!(fs.read(ha, 100, 4000).unwrap(), &a[4000..4100]);
    assert_eq!(fs.read(hc, 100, 10).unwrap(), &c[10..110]);
    assert_eq!(fs.read(ha2, 100, 0).unwrap(), &a[..100]);
    assert_eq!(fs.read(ha, 100, 0).unwrap(), &a[..100]);
    assert_eq!(fs.open_handles(), 3);
    for h in [ha, hc, ha2] {
        fs.close(h).unwrap();
    }
    assert_eq!(fs.open_handles(), 0);
    assert_eq!(fs.close(ha).expect_err("closed").to_errno(), libc::EBADF);
}

#[test]
fn directory_handles_iterate_independently() {
    let fs = mount(&sample_image().unwrap());
    let d1 = fs.open_directory("/").unwrap();
    let d2 = fs.open_directory("/").unwrap();
    assert_eq!(fs.read_directory_entry(d1).unwrap().as_deref(), Some("."));
    assert_eq!(fs.read_directory_entry(d1).unwrap().as_deref(), Some(".."));
    assert_eq!(fs.read_directory_entry(d2).unwrap().as_deref(), Some("."));
    assert_eq!(fs.read_directory_entry(d1).unwrap().as_deref(), Some("test"));
    fs.close_directory(d1).unwrap();
    fs.close_directory(d2).unwrap();
    assert!(matches!(
        fs.read_directory_entry(d1),
        Err(Ext2Error::BadHandle(_))
    ));
}

#[test]
fn concurrent_readers_on_separate_handles() {
    let mut b = ImageBuilder::new(1024);
    let root = b.root();
    let payloads: Vec<Vec<u8>> = (0..4_u8)
        .map(|k| (0..30_000_u32).map(|i| (i as u8).wrapping_mul(k + 1)).collect())
        .collect();
    for (k, p) in payloads.iter().enumerate() {
        b.add_file(root, &format!("p{k}"), p).unwrap();
    }
    let fs = mount(&b.build().unwrap());

    std::thread::scope(|s| {
        for (k, expected) in payloads.iter().enumerate() {
            let fs = &fs;
            s.spawn(move || {
                let fh = fs.open_file(&format!("/p{k}")).unwrap();
                let mut got = Vec::new();
                let mut offset = 0_u64;
                loop {
                    let chunk = fs.read(fh, 1000, offset).unwrap();
                    if chunk.is_empty() {
                        break;
                    }
                    offset += chunk.len() as u64;
                    got.extend_from_slice(&chunk);
                }
                fs.close(fh).unwrap();
                assert_eq!(&got, expected);
            });
        }
    });
    assert_eq!(fs.open_handles(), 0);
}
