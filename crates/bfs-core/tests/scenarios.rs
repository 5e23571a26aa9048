#![forbid(unsafe_code)]
//! End-to-end behavior of both backends behind `init`.

use bfs_core::{
    BfsError, BootFs, ByteDevice, FileType, FsFormat, FsOps, HammerFs, HammerOptions, Hammer2Fs,
    Hammer2Options, MemoryByteDevice, OpenOptions, init,
};
use bfs_harness::{
    Hammer2ImageBuilder, HammerImageBuilder, SparseByteDevice, hammer2_header_copy,
    sample_hammer2_image, sample_hammer_image, sample_kernel,
};
use bfs_ondisk::hammer2::{BlockrefType, HAMMER2_ZONE_BYTES64, InodeBody};
use std::sync::Arc;

fn memory(image: Vec<u8>) -> Arc<dyn ByteDevice> {
    Arc::new(MemoryByteDevice::from_vec(image))
}

fn open(image: Vec<u8>) -> BootFs {
    init(memory(image), &OpenOptions::default()).expect("init")
}

fn both_samples() -> Vec<BootFs> {
    vec![
        open(sample_hammer_image().unwrap()),
        open(sample_hammer2_image().unwrap()),
    ]
}

// ── Scenario A: sparse HAMMER2 file behind an indirect block ────────────────

#[test]
fn hammer2_hole_between_extents_reads_as_zero() {
    // 2000 stored bytes in a 2 KiB block; no extent covers 2048..2100.
    let first = vec![0xA1_u8; 2000];
    let mut b = Hammer2ImageBuilder::new().with_fanout(1, 4);
    b.add_sparse_file(
        b.root(),
        "hello.txt",
        5000,
        &[(0, first), (2100, vec![0xB2; 2900])],
    )
    .unwrap();
    let fs = open(b.build().unwrap());
    assert_eq!(fs.format(), FsFormat::Hammer2);

    let obj = fs.lookup("/hello.txt").unwrap();
    let BootFs::Hammer2(h2) = &fs else {
        panic!("expected a HAMMER2 volume");
    };
    let inode = h2.inode(obj).unwrap();
    let InodeBody::Blockset(set) = &inode.body else {
        panic!("expected a blockset");
    };
    assert_eq!(set[0].kind(), Some(BlockrefType::Indirect));
    assert!(set[1..].iter().all(|bref| bref.is_empty()));

    let mut buf = [0xFF_u8; 200];
    assert_eq!(fs.read(obj, 1950, &mut buf).unwrap(), 200);
    assert!(buf[..50].iter().all(|b| *b == 0xA1));
    assert!(buf[50..150].iter().all(|b| *b == 0));
    assert!(buf[150..].iter().all(|b| *b == 0xB2));

    let mut gap = [0xFF_u8; 40];
    assert_eq!(fs.read(obj, 2055, &mut gap).unwrap(), 40);
    assert!(gap.iter().all(|b| *b == 0));

    assert_eq!(fs.stat(obj).unwrap().size, 5000);
    assert_eq!(fs.read(obj, 4990, &mut buf).unwrap(), 10);
}

// ── Scenario B: file used as a directory ────────────────────────────────────

#[test]
fn regular_file_in_the_middle_of_a_path_is_not_a_directory() {
    let mut h = HammerImageBuilder::new();
    h.add_file(h.root(), "a", b"plain").unwrap();
    let mut h2 = Hammer2ImageBuilder::new();
    h2.add_file(h2.root(), "a", b"plain").unwrap();

    for fs in [open(h.build()), open(h2.build().unwrap())] {
        assert!(
            matches!(fs.lookup("/a/b/c"), Err(BfsError::NotDirectory)),
            "{}",
            fs.format()
        );
        assert!(fs.lookup("/a").is_ok());
    }
}

// ── Scenario C: foreign devices ─────────────────────────────────────────────

#[test]
fn unknown_magic_is_not_this_format_everywhere() {
    let image = vec![0xAB_u8; 256 * 1024];

    let err = HammerFs::open(memory(image.clone()), 4, HammerOptions::default()).unwrap_err();
    assert!(err.is_not_this_format(), "{err}");
    let err = Hammer2Fs::open(memory(image.clone()), 4, Hammer2Options::default()).unwrap_err();
    assert!(err.is_not_this_format(), "{err}");

    let err = init(memory(image), &OpenOptions::default()).unwrap_err();
    assert!(err.is_not_this_format(), "{err}");
    let message = err.to_string();
    assert!(message.contains("hammer:") && message.contains("hammer2:"), "{message}");
}

#[test]
fn probe_order_is_honored() {
    let image = sample_hammer2_image().unwrap();
    let only_hammer = OpenOptions {
        probe_order: vec![FsFormat::Hammer],
        ..OpenOptions::default()
    };
    assert!(init(memory(image.clone()), &only_hammer).unwrap_err().is_not_this_format());

    let h2_first = OpenOptions {
        probe_order: vec![FsFormat::Hammer2, FsFormat::Hammer],
        ..OpenOptions::default()
    };
    assert_eq!(init(memory(image), &h2_first).unwrap().format(), FsFormat::Hammer2);
}

#[test]
fn corrupt_volume_of_the_right_format_stops_probing() {
    let mut image = sample_hammer_image().unwrap();
    let buf_beg = u64::from_le_bytes(image[0x18..0x20].try_into().unwrap());
    let root_btree = u64::from_le_bytes(image[0xF0..0xF8].try_into().unwrap());
    let node_at = usize::try_from((root_btree & ((1 << 52) - 1)) + buf_beg).unwrap();
    image[node_at + 0x14] = b'?';

    let err = init(memory(image), &OpenOptions::default()).unwrap_err();
    assert!(matches!(err, BfsError::CorruptIndex { .. }), "{err}");
}

// ── Scenario D: directory enumeration ───────────────────────────────────────

#[test]
fn readdir_lists_live_entries_once_in_cookie_order() {
    let names = ["alpha", "beta", "gamma", "delta", "epsilon", "zeta"];

    let mut h = HammerImageBuilder::new().with_fanout(3, 2);
    for name in names {
        h.add_file(h.root(), name, name.as_bytes()).unwrap();
    }
    h.add_file(h.root(), "removed", b"gone").unwrap();
    h.unlink(h.root(), "removed").unwrap();

    let mut h2 = Hammer2ImageBuilder::new().with_fanout(2, 2);
    for name in names {
        h2.add_file(h2.root(), name, name.as_bytes()).unwrap();
    }

    for fs in [open(h.build()), open(h2.build().unwrap())] {
        let root = fs.root();
        let mut cookie = 0;
        let mut last_cookie = None;
        let mut listed = Vec::new();
        while let Some(entry) = fs.readdir(root, &mut cookie).unwrap() {
            if let Some(prev) = last_cookie {
                assert!(cookie > prev, "{}: cookie went backwards", fs.format());
            }
            last_cookie = Some(cookie);
            listed.push(entry);
        }

        assert_eq!(listed[0].name, b".");
        assert_eq!(listed[0].object, root);
        assert_eq!(listed[1].name, b"..");
        assert_eq!(listed[1].object, root);
        let mut got: Vec<String> = listed[2..].iter().map(|e| e.name_str()).collect();
        got.sort();
        let mut want: Vec<String> = names.iter().map(ToString::to_string).collect();
        want.sort();
        assert_eq!(got, want, "{}", fs.format());

        for entry in &listed[2..] {
            assert_eq!(entry.kind, FileType::RegularFile);
            assert_eq!(fs.lookup(&format!("/{}", entry.name_str())).unwrap(), entry.object);
        }
        assert!(fs.readdir(root, &mut cookie).unwrap().is_none());
    }
}

// ── Shared behavior ─────────────────────────────────────────────────────────

#[test]
fn sample_volumes_agree() {
    for fs in both_samples() {
        let format = fs.format();
        let kernel = fs.lookup("/boot/kernel").unwrap();
        assert_eq!(fs.read_to_end(kernel).unwrap(), sample_kernel(), "{format}");

        let motd = fs.lookup("/etc/motd").unwrap();
        assert_eq!(fs.read_to_end(motd).unwrap(), b"DragonFly boot volume\n");

        let sparse = fs.lookup("/var/sparse.img").unwrap();
        let attrs = fs.stat(sparse).unwrap();
        assert_eq!(attrs.size, 1 << 20);
        let data = fs.read_to_end(sparse).unwrap();
        assert_eq!(data.iter().filter(|b| **b == 0x5A).count(), 4096, "{format}");

        let boot = fs.lookup("/boot").unwrap();
        let mut names: Vec<String> = fs
            .list_dir(boot)
            .unwrap()
            .iter()
            .map(bfs_core::DirEntry::name_str)
            .collect();
        names.sort();
        assert_eq!(names, [".", "..", "kernel", "loader.conf"]);

        let mut buf = [0_u8; 8];
        assert!(matches!(fs.read(boot, 0, &mut buf), Err(BfsError::IsDirectory)));
        let mut cookie = 0;
        assert!(matches!(
            fs.readdir(kernel, &mut cookie),
            Err(BfsError::NotDirectory)
        ));
        assert!(matches!(fs.lookup("/nope"), Err(BfsError::NotFound(_))));
    }
}

#[test]
fn stat_is_idempotent() {
    for fs in both_samples() {
        for path in ["/", "/boot", "/boot/kernel", "/etc/motd", "/var/sparse.img"] {
            let obj = fs.lookup(path).unwrap();
            let first = fs.stat(obj).unwrap();
            let second = fs.stat(obj).unwrap();
            assert_eq!(first, second, "{} {path}", fs.format());
        }
    }
}

#[test]
fn dotdot_entries_point_at_parents() {
    for fs in both_samples() {
        let boot = fs.lookup("/boot").unwrap();
        let listed = fs.list_dir(boot).unwrap();
        assert_eq!(listed[1].name, b"..");
        assert_eq!(listed[1].object, fs.root(), "{}", fs.format());
        assert_eq!(fs.lookup("/boot/..").unwrap(), fs.root());
    }
}

#[test]
fn newest_hammer2_header_is_selected_through_init() {
    let image = Hammer2ImageBuilder::new()
        .with_mirror_tid(10)
        .build()
        .unwrap();
    let mut dev = SparseByteDevice::new(4 * HAMMER2_ZONE_BYTES64);
    dev.write_at(0, &image);
    dev.write_at(HAMMER2_ZONE_BYTES64, &hammer2_header_copy(&image, 12));
    dev.write_at(3 * HAMMER2_ZONE_BYTES64, &hammer2_header_copy(&image, 11));

    let fs = init(Arc::new(dev), &OpenOptions::default()).unwrap();
    let BootFs::Hammer2(h2) = &fs else {
        panic!("expected a HAMMER2 volume");
    };
    assert_eq!((h2.header_slot(), h2.header().mirror_tid), (1, 12));
    assert_eq!(fs.lookup("/").unwrap(), fs.root());
}

#[test]
fn file_backed_devices_open_through_bootfs_open() {
    let dir = tempfile::tempdir().unwrap();
    for (name, image) in [
        ("hammer.img", sample_hammer_image().unwrap()),
        ("hammer2.img", sample_hammer2_image().unwrap()),
    ] {
        let path = dir.path().join(name);
        std::fs::write(&path, image).unwrap();
        let fs = BootFs::open(&path, &OpenOptions::default()).unwrap();
        let conf = fs.lookup("/boot/loader.conf").unwrap();
        assert_eq!(fs.read_to_end(conf).unwrap(), b"autoboot_delay=\"3\"\n");
        assert!(fs.cache_stats().misses > 0);
    }
    assert!(matches!(
        BootFs::open(dir.path().join("missing.img"), &OpenOptions::default()),
        Err(BfsError::Io(_))
    ));
}

// ── Sparse read completeness ────────────────────────────────────────────────

mod prop {
    use super::*;
    use proptest::prelude::*;

    /// Non-overlapping extents: one per 8 KiB slot, at most 4 KiB long.
    fn extents() -> impl Strategy<Value = Vec<(u64, Vec<u8>)>> {
        proptest::collection::vec(
            (any::<bool>(), 0_u64..1024, 1_usize..=4096, any::<u8>()),
            1..10,
        )
        .prop_map(|slots| {
            slots
                .into_iter()
                .enumerate()
                .filter(|(_, (used, ..))| *used)
                .map(|(i, (_, jitter, len, fill))| {
                    (i as u64 * 8192 + jitter, vec![fill | 1; len])
                })
                .collect()
        })
    }

    fn model(size: u64, extents: &[(u64, Vec<u8>)]) -> Vec<u8> {
        let mut bytes = vec![0_u8; usize::try_from(size).unwrap()];
        for (at, data) in extents {
            let at = usize::try_from(*at).unwrap();
            if at >= bytes.len() {
                continue;
            }
            let n = data.len().min(bytes.len() - at);
            bytes[at..at + n].copy_from_slice(&data[..n]);
        }
        bytes
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn reads_match_logical_content(
            extents in extents(),
            size in 1_u64..90_000,
            offset in 0_u64..95_000,
            len in 0_usize..20_000,
        ) {
            let expected = model(size, &extents);

            let mut h = HammerImageBuilder::new();
            h.add_sparse_file(h.root(), "f", size, &extents).unwrap();
            let mut h2 = Hammer2ImageBuilder::new().with_fanout(2, 2);
            h2.add_sparse_file(h2.root(), "f", size, &extents).unwrap();

            for fs in [open(h.build()), open(h2.build().unwrap())] {
                let obj = fs.lookup("/f").unwrap();
                let mut buf = vec![0xEE_u8; len];
                let n = fs.read(obj, offset, &mut buf).unwrap();
                let want = usize::try_from(size.saturating_sub(offset)).unwrap().min(len);
                prop_assert_eq!(n, want);
                if n > 0 {
                    let at = usize::try_from(offset).unwrap();
                    prop_assert_eq!(&buf[..n], &expected[at..at + n]);
                }
            }
        }
    }
}
