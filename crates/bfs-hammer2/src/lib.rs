#![forbid(unsafe_code)]
//! Read-only HAMMER2 volume browser.
//!
//! The newest of the redundant volume headers names the superroot inode.
//! Every lookup below it is a recursive search over blocksets: pick the
//! lowest-keyed blockref intersecting the wanted key range, descend through
//! INDIRECT blocks, and move past an indirect range once it is exhausted.
//! Directory children are INODE blockrefs keyed by the name's dirhash; file
//! content is DATA blockrefs keyed by file offset.

use bfs_block::{BlockCache, ByteDevice, Extent, read_extents};
use bfs_error::{BfsError, Result};
use bfs_ondisk::hammer2::{
    self, Blockref, BlockrefType, HAMMER2_COMP_AUTOZERO, HAMMER2_COMP_NONE,
    HAMMER2_DIRHASH_LOMASK, HAMMER2_INODE_BYTES, HAMMER2_INODE_RADIX, HAMMER2_NUM_VOLHDRS,
    HAMMER2_OFF_MASK_RADIX, HAMMER2_PBUFSIZE, HAMMER2_VOLUME_HEADER_SIZE, Hammer2Inode,
    Hammer2VolumeHeader, InodeBody, volume_header_offset,
};
use bfs_types::{
    Attrs, DirEntry, FileType, ObjectId, ParseError, S_IPERM, micros_to_system_time,
    uuid_to_unix_xid,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace};

/// Deepest chain of INDIRECT blocks accepted below one blockset.
const HAMMER2_MAX_INDIRECT_DEPTH: usize = 32;
/// Directory nesting explored when resolving `..` by inode number.
const HAMMER2_MAX_DIR_DEPTH: usize = 64;
/// Readdir cookies below this value name the synthetic `.` and `..`.
const FIRST_DIRENT_COOKIE: u64 = 2;

/// Tunables for HAMMER2 volumes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hammer2Options {
    /// Superroot child to use as the root directory (`"BOOT"`, `"ROOT"`).
    /// `None` browses the superroot itself.
    pub pfs: Option<String>,
}

/// An open HAMMER2 volume.
pub struct Hammer2Fs {
    cache: BlockCache,
    header: Hammer2VolumeHeader,
    header_slot: usize,
    superroot: ObjectId,
    root: ObjectId,
    opts: Hammer2Options,
    /// Most recently decoded inode, keyed by its handle.
    last_inode: Mutex<Option<(u64, Arc<Hammer2Inode>)>>,
}

impl std::fmt::Debug for Hammer2Fs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hammer2Fs")
            .field("header_slot", &self.header_slot)
            .field("mirror_tid", &self.header.mirror_tid)
            .field("root", &self.root)
            .field("opts", &self.opts)
            .finish_non_exhaustive()
    }
}

fn corrupt_at(offset: u64) -> impl FnOnce(ParseError) -> BfsError {
    move |err| BfsError::corrupt(offset, err.to_string())
}

/// Read every header slot that fits on the device and keep the newest.
fn select_header(cache: &BlockCache) -> Result<(usize, Hammer2VolumeHeader)> {
    let dev_len = cache.device().len_bytes();
    let mut best: Option<(usize, Hammer2VolumeHeader)> = None;

    for slot in 0..HAMMER2_NUM_VOLHDRS {
        let offset = volume_header_offset(slot);
        if offset.saturating_add(u64::from(HAMMER2_PBUFSIZE)) > dev_len {
            debug!(slot, "volume header slot past end of device");
            break;
        }
        let parsed = match cache.with_bytes(
            offset,
            HAMMER2_VOLUME_HEADER_SIZE,
            Hammer2VolumeHeader::parse_from_region,
        ) {
            Ok(parsed) => parsed,
            Err(err) if slot > 0 => {
                debug!(slot, error = %err, "volume header slot unreadable");
                continue;
            }
            Err(err) => return Err(err),
        };
        match parsed {
            Ok(header) => {
                debug!(slot, mirror_tid = header.mirror_tid, "volume header candidate");
                if best
                    .as_ref()
                    .is_none_or(|(_, cur)| header.mirror_tid > cur.mirror_tid)
                {
                    best = Some((slot, header));
                }
            }
            Err(err) => debug!(slot, error = %err, "volume header slot rejected"),
        }
    }

    best.ok_or_else(|| BfsError::NotThisFormat("no valid HAMMER2 volume header".to_owned()))
}

impl Hammer2Fs {
    /// Select the volume header, locate the superroot and, when configured,
    /// the PFS root.
    ///
    /// Returns `NotThisFormat` when no header slot carries the HAMMER2 magic.
    pub fn open(
        dev: Arc<dyn ByteDevice>,
        cache_lines: usize,
        opts: Hammer2Options,
    ) -> Result<Self> {
        if dev.len_bytes() < u64::from(HAMMER2_PBUFSIZE) {
            return Err(BfsError::NotThisFormat(format!(
                "device too small for a HAMMER2 volume header ({} bytes)",
                dev.len_bytes()
            )));
        }
        let cache = BlockCache::new(dev, HAMMER2_PBUFSIZE, cache_lines)?;
        let (header_slot, header) = select_header(&cache)?;
        let superroot = header
            .sroot_blockset
            .iter()
            .find(|bref| bref.kind() == Some(BlockrefType::Inode))
            .map(|bref| ObjectId(bref.data_off))
            .ok_or_else(|| {
                BfsError::corrupt(
                    volume_header_offset(header_slot),
                    "root blockset holds no superroot inode",
                )
            })?;
        debug!(
            slot = header_slot,
            mirror_tid = header.mirror_tid,
            superroot = %superroot,
            "hammer2 volume header selected"
        );

        let mut fs = Self {
            cache,
            header,
            header_slot,
            superroot,
            root: superroot,
            opts,
            last_inode: Mutex::new(None),
        };
        let sroot = fs.inode(superroot)?;
        if !hammer2::file_type(sroot.obj_type).is_dir() {
            return Err(BfsError::corrupt(
                superroot.0 & !HAMMER2_OFF_MASK_RADIX,
                "superroot is not a directory",
            ));
        }

        if let Some(name) = fs.opts.pfs.clone() {
            let (pfs, kind) = fs
                .lookup_in(superroot, name.as_bytes())?
                .ok_or_else(|| BfsError::NotFound(format!("PFS {name}")))?;
            if !kind.is_dir() {
                return Err(BfsError::NotDirectory);
            }
            debug!(pfs = %name, root = %pfs, "hammer2 PFS root selected");
            fs.root = pfs;
        }
        Ok(fs)
    }

    #[must_use]
    pub fn header(&self) -> &Hammer2VolumeHeader {
        &self.header
    }

    /// Index of the volume header copy in use.
    #[must_use]
    pub fn header_slot(&self) -> usize {
        self.header_slot
    }

    #[must_use]
    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    #[must_use]
    pub fn options(&self) -> &Hammer2Options {
        &self.opts
    }

    #[must_use]
    pub fn superroot(&self) -> ObjectId {
        self.superroot
    }

    #[must_use]
    pub fn root(&self) -> ObjectId {
        self.root
    }

    /// Decoded inode behind `obj`.
    ///
    /// The last decoded inode is kept and returned again without touching the
    /// block cache.
    pub fn inode(&self, obj: ObjectId) -> Result<Arc<Hammer2Inode>> {
        if let Some((cached, inode)) = &*self.last_inode.lock() {
            if *cached == obj.0 {
                trace!(obj = %obj, "inode cache hit");
                return Ok(Arc::clone(inode));
            }
        }

        if obj.0 & HAMMER2_OFF_MASK_RADIX != u64::from(HAMMER2_INODE_RADIX) {
            return Err(BfsError::NotFound(format!("object {obj}")));
        }
        let phys = obj.0 & !HAMMER2_OFF_MASK_RADIX;
        let in_bounds = phys
            .checked_add(HAMMER2_INODE_BYTES as u64)
            .is_some_and(|end| end <= self.cache.device().len_bytes());
        if !in_bounds {
            return Err(BfsError::NotFound(format!("object {obj}")));
        }

        let inode = Arc::new(
            self.cache
                .with_bytes(phys, HAMMER2_INODE_BYTES, Hammer2Inode::parse)?
                .map_err(corrupt_at(phys))?,
        );
        *self.last_inode.lock() = Some((obj.0, Arc::clone(&inode)));
        Ok(inode)
    }

    fn read_blockrefs(&self, bref: &Blockref) -> Result<Vec<Blockref>> {
        let phys = bref.physical();
        if bref.comp_method() != HAMMER2_COMP_NONE {
            return Err(BfsError::corrupt(phys, "compressed indirect block"));
        }
        let bytes = bref.bytes();
        if bytes == 0 || bytes > u64::from(HAMMER2_PBUFSIZE) {
            return Err(BfsError::corrupt(phys, format!("indirect block of {bytes} bytes")));
        }
        self.cache
            .with_bytes(phys, bytes as usize, Blockref::parse_array)?
            .map_err(corrupt_at(phys))
    }

    /// Lowest-keyed INODE, DATA or DIRENT blockref under `inode` whose key
    /// range intersects `[low, high]`.
    ///
    /// An inode with direct data has no blockrefs; its content is the inline
    /// area and this returns `None`.
    pub fn search(&self, inode: &Hammer2Inode, low: u64, high: u64) -> Result<Option<Blockref>> {
        match &inode.body {
            InodeBody::Direct(_) => Ok(None),
            InodeBody::Blockset(set) => self.search_set(set, low, high, 0),
        }
    }

    fn search_set(
        &self,
        set: &[Blockref],
        mut low: u64,
        high: u64,
        depth: usize,
    ) -> Result<Option<Blockref>> {
        loop {
            let Some(bref) = set
                .iter()
                .filter(|bref| !bref.is_empty() && bref.intersects(low, high))
                .min_by_key(|bref| bref.key)
            else {
                return Ok(None);
            };

            match bref.kind() {
                Some(BlockrefType::Inode | BlockrefType::Data | BlockrefType::Dirent) => {
                    return Ok(Some(*bref));
                }
                Some(BlockrefType::Indirect) => {
                    if depth >= HAMMER2_MAX_INDIRECT_DEPTH {
                        return Err(BfsError::corrupt(
                            bref.physical(),
                            format!("indirect blocks nested deeper than {HAMMER2_MAX_INDIRECT_DEPTH}"),
                        ));
                    }
                    trace!(
                        depth,
                        key = format_args!("{:#x}", bref.key),
                        keybits = bref.keybits,
                        "indirect descend"
                    );
                    let children = self.read_blockrefs(bref)?;
                    if let Some(found) = self.search_set(&children, low, high, depth + 1)? {
                        return Ok(Some(found));
                    }
                    match bref.key_end().checked_add(1) {
                        Some(next) if next <= high => low = next,
                        _ => return Ok(None),
                    }
                }
                _ => {
                    return Err(BfsError::corrupt(
                        bref.physical(),
                        format!("unexpected blockref type {}", bref.btype),
                    ));
                }
            }
        }
    }

    /// Inode named by a directory blockref.
    fn child_inode(&self, bref: &Blockref) -> Result<Arc<Hammer2Inode>> {
        match bref.kind() {
            Some(BlockrefType::Inode) => self.inode(ObjectId(bref.data_off)),
            Some(BlockrefType::Dirent) => Err(BfsError::corrupt(
                bref.physical(),
                "directory-entry blockrefs are not supported",
            )),
            _ => Err(BfsError::corrupt(
                bref.physical(),
                format!("blockref type {} inside a directory", bref.btype),
            )),
        }
    }

    fn directory(&self, obj: ObjectId) -> Result<Arc<Hammer2Inode>> {
        let inode = self.inode(obj)?;
        if !hammer2::file_type(inode.obj_type).is_dir() {
            return Err(BfsError::NotDirectory);
        }
        Ok(inode)
    }

    /// Find `name` in directory `dir`.
    pub fn lookup_in(&self, dir: ObjectId, name: &[u8]) -> Result<Option<(ObjectId, FileType)>> {
        let inode = self.directory(dir)?;
        let mut low = hammer2::dirhash(name);
        let high = low | HAMMER2_DIRHASH_LOMASK;

        loop {
            let Some(bref) = self.search(&inode, low, high)? else {
                return Ok(None);
            };
            let child = self.child_inode(&bref)?;
            if child.filename == name {
                return Ok(Some((
                    ObjectId(bref.data_off),
                    hammer2::file_type(child.obj_type),
                )));
            }
            trace!(dir = %dir, key = format_args!("{:#x}", bref.key), "dirhash collision");
            match bref.key.checked_add(1) {
                Some(next) if next <= high => low = next,
                _ => return Ok(None),
            }
        }
    }

    /// Resolve a slash-separated path from the root directory.
    ///
    /// `..` pops the directories walked so far and stays at the root.
    pub fn lookup(&self, path: &str) -> Result<ObjectId> {
        let mut walked = vec![self.root];
        let mut kind = FileType::Directory;

        for comp in path.split('/').filter(|c| !c.is_empty()) {
            if !kind.is_dir() {
                return Err(BfsError::NotDirectory);
            }
            match comp {
                "." => {}
                ".." => {
                    if walked.len() > 1 {
                        walked.pop();
                    }
                    kind = FileType::Directory;
                }
                _ => {
                    let cur = walked.last().copied().unwrap_or(self.root);
                    let (obj, child_kind) = self
                        .lookup_in(cur, comp.as_bytes())?
                        .ok_or_else(|| BfsError::NotFound(path.to_owned()))?;
                    walked.push(obj);
                    kind = child_kind;
                }
            }
        }
        Ok(walked.last().copied().unwrap_or(self.root))
    }

    /// Directory at or below `dir` whose inode number is `inum`.
    fn find_directory(&self, dir: ObjectId, inum: u64, depth: usize) -> Result<Option<ObjectId>> {
        let inode = self.inode(dir)?;
        if inode.inum == inum {
            return Ok(Some(dir));
        }
        if depth >= HAMMER2_MAX_DIR_DEPTH {
            return Ok(None);
        }
        let mut low = 0;
        while let Some(bref) = self.search(&inode, low, u64::MAX)? {
            let child = self.child_inode(&bref)?;
            if hammer2::file_type(child.obj_type).is_dir() {
                if let Some(found) = self.find_directory(ObjectId(bref.data_off), inum, depth + 1)? {
                    return Ok(Some(found));
                }
            }
            let Some(next) = bref.key.checked_add(1) else {
                break;
            };
            low = next;
        }
        Ok(None)
    }

    fn parent_of(&self, dir: ObjectId, inode: &Hammer2Inode) -> Result<ObjectId> {
        if dir == self.root || inode.iparent == 0 {
            return Ok(dir);
        }
        match self.find_directory(self.root, inode.iparent, 0)? {
            Some(parent) => Ok(parent),
            None => {
                debug!(dir = %dir, iparent = inode.iparent, "parent outside the root, using root");
                Ok(self.root)
            }
        }
    }

    pub fn stat(&self, obj: ObjectId) -> Result<Attrs> {
        let inode = self.inode(obj)?;
        let kind = hammer2::file_type(inode.obj_type);
        Ok(Attrs {
            ino: inode.inum,
            kind,
            mode: kind.mode_bits() | (inode.mode & S_IPERM),
            uid: uuid_to_unix_xid(&inode.uid),
            gid: uuid_to_unix_xid(&inode.gid),
            size: inode.size,
            nlink: inode.nlinks,
            mtime: micros_to_system_time(inode.mtime),
        })
    }

    /// Read file bytes at `offset`, zero-filling holes.
    ///
    /// Data blockrefs are keyed by the file offset of their first byte and
    /// cover `2^keybits` bytes; any part of that range beyond the stored
    /// block reads as zero.
    pub fn read(&self, obj: ObjectId, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let inode = self.inode(obj)?;
        if hammer2::file_type(inode.obj_type).is_dir() {
            return Err(BfsError::IsDirectory);
        }
        if offset >= inode.size {
            return Ok(0);
        }
        let len = usize::try_from(inode.size - offset).map_or(buf.len(), |left| left.min(buf.len()));
        let out = &mut buf[..len];

        if let InodeBody::Direct(inline) = &inode.body {
            out.fill(0);
            if let Some(rest) = usize::try_from(offset).ok().and_then(|at| inline.get(at..)) {
                let n = rest.len().min(len);
                out[..n].copy_from_slice(&rest[..n]);
            }
            return Ok(len);
        }

        read_extents(&self.cache, offset, out, |file_off| {
            let Some(bref) = self.search(&inode, file_off, u64::MAX)? else {
                return Ok(None);
            };
            if bref.kind() != Some(BlockrefType::Data) {
                return Err(BfsError::corrupt(
                    bref.physical(),
                    format!("blockref type {} inside file data", bref.btype),
                ));
            }
            let stored = match bref.comp_method() {
                HAMMER2_COMP_NONE => bref.bytes(),
                HAMMER2_COMP_AUTOZERO => 0,
                other => {
                    return Err(BfsError::corrupt(
                        bref.physical(),
                        format!("unsupported compression method {other}"),
                    ));
                }
            };
            let end = bref.key_end().saturating_add(1);
            Ok(Some(Extent {
                start: bref.key,
                end,
                stored: stored.min(end - bref.key),
                physical: bref.physical(),
            }))
        })
    }

    /// Next directory entry at or after `cookie`.
    ///
    /// Cookies 0 and 1 yield `.` and `..`; larger cookies are dirhash keys.
    pub fn readdir(&self, obj: ObjectId, cookie: &mut u64) -> Result<Option<DirEntry>> {
        let inode = self.directory(obj)?;

        match *cookie {
            0 => {
                *cookie = 1;
                return Ok(Some(DirEntry {
                    name: b".".to_vec(),
                    object: obj,
                    kind: FileType::Directory,
                }));
            }
            1 => {
                *cookie = FIRST_DIRENT_COOKIE;
                return Ok(Some(DirEntry {
                    name: b"..".to_vec(),
                    object: self.parent_of(obj, &inode)?,
                    kind: FileType::Directory,
                }));
            }
            _ => {}
        }

        let Some(bref) = self.search(&inode, *cookie, u64::MAX)? else {
            return Ok(None);
        };
        let child = self.child_inode(&bref)?;
        *cookie = bref.key.saturating_add(1);
        Ok(Some(DirEntry {
            name: child.filename.clone(),
            object: ObjectId(bref.data_off),
            kind: hammer2::file_type(child.obj_type),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bfs_block::MemoryByteDevice;
    use bfs_harness::{Hammer2ImageBuilder, SparseByteDevice, hammer2_header_copy};
    use bfs_ondisk::hammer2::{HAMMER2_OBJTYPE_CDEV, HAMMER2_ZONE_BYTES64};
    use bfs_types::ByteOffset;
    use std::io;

    fn open_with(image: Vec<u8>, opts: Hammer2Options) -> Result<Hammer2Fs> {
        let dev: Arc<dyn ByteDevice> = Arc::new(MemoryByteDevice::from_vec(image));
        Hammer2Fs::open(dev, 8, opts)
    }

    fn open(image: Vec<u8>) -> Hammer2Fs {
        open_with(image, Hammer2Options::default()).expect("open hammer2 image")
    }

    fn names(fs: &Hammer2Fs, dir: ObjectId) -> Vec<String> {
        let mut cookie = 0;
        let mut out = Vec::new();
        while let Some(entry) = fs.readdir(dir, &mut cookie).expect("readdir") {
            out.push(entry.name_str());
        }
        out
    }

    fn read_all(fs: &Hammer2Fs, obj: ObjectId) -> Vec<u8> {
        let size = fs.stat(obj).unwrap().size;
        let mut buf = vec![0xEE_u8; usize::try_from(size).unwrap()];
        let n = fs.read(obj, 0, &mut buf).unwrap();
        assert_eq!(n, buf.len());
        buf
    }

    /// Device whose reads fail from `fail_from` onwards.
    struct FailingTail {
        inner: SparseByteDevice,
        fail_from: u64,
    }

    impl ByteDevice for FailingTail {
        fn len_bytes(&self) -> u64 {
            self.inner.len_bytes()
        }

        fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
            if offset.0 >= self.fail_from {
                return Err(BfsError::Io(io::Error::other("medium error")));
            }
            self.inner.read_exact_at(offset, buf)
        }
    }

    #[test]
    fn open_rejects_foreign_and_small_devices() {
        let err = open_with(vec![0; 131_072], Hammer2Options::default()).unwrap_err();
        assert!(err.is_not_this_format(), "{err}");
        let err = open_with(vec![0; 4096], Hammer2Options::default()).unwrap_err();
        assert!(err.is_not_this_format(), "{err}");
    }

    #[test]
    fn lookup_and_read_direct_and_blockref_files() {
        let kernel: Vec<u8> = (0..150_000_u32).map(|i| (i % 251) as u8).collect();
        let mut b = Hammer2ImageBuilder::new();
        let boot = b.mkdir(b.root(), "boot").unwrap();
        let k = b.add_file(boot, "kernel", &kernel).unwrap();
        b.add_file(boot, "loader.conf", b"autoboot_delay=3\n").unwrap();
        let fs = open(b.build().unwrap());

        let obj = fs.lookup("/boot/kernel").unwrap();
        assert_eq!(fs.stat(obj).unwrap().ino, k);
        assert_eq!(read_all(&fs, obj), kernel);
        assert_eq!(fs.lookup("boot//kernel/").unwrap(), obj);
        assert_eq!(fs.lookup("/boot/../boot/./kernel").unwrap(), obj);
        assert_eq!(fs.lookup("/..").unwrap(), fs.root());

        // Read straddling the first 64 KiB data block.
        let mut buf = [0_u8; 100];
        assert_eq!(fs.read(obj, 65_500, &mut buf).unwrap(), 100);
        assert_eq!(&buf[..], &kernel[65_500..65_600]);

        let conf = fs.lookup("/boot/loader.conf").unwrap();
        let mut buf = [0_u8; 64];
        let n = fs.read(conf, 9, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"delay=3\n");

        assert!(matches!(fs.lookup("/boot/missing"), Err(BfsError::NotFound(_))));
        assert!(matches!(fs.lookup("/boot/kernel/x"), Err(BfsError::NotDirectory)));
    }

    #[test]
    fn dirhash_collisions_are_resolved_by_name() {
        // Segment sums ignore order, so only the folded whole-name bits differ.
        let (first, second) = (0_u32..2_000_000)
            .map(|i| (format!("{i}.boot"), format!("boot.{i}")))
            .find(|(a, b)| hammer2::dirhash(a.as_bytes()) == hammer2::dirhash(b.as_bytes()))
            .expect("colliding pair");

        let mut b = Hammer2ImageBuilder::new();
        let root = b.root();
        let one = b.add_file(root, &first, b"first").unwrap();
        let two = b.add_file(root, &second, b"second").unwrap();
        let base = hammer2::dirhash(b"loader.conf");
        b.add_file_with_key(root, "decoy", b"decoy", base).unwrap();
        let conf = b.add_file(root, "loader.conf", b"conf").unwrap();
        let fs = open(b.build().unwrap());

        for (name, ino, content) in [
            (first.as_str(), one, &b"first"[..]),
            (second.as_str(), two, &b"second"[..]),
            ("loader.conf", conf, &b"conf"[..]),
        ] {
            let obj = fs.lookup(&format!("/{name}")).unwrap();
            assert_eq!(fs.stat(obj).unwrap().ino, ino, "{name}");
            assert_eq!(read_all(&fs, obj), content);
        }

        // Stored outside its own hash range: listed, but not resolvable by name.
        assert!(matches!(fs.lookup("/decoy"), Err(BfsError::NotFound(_))));
        assert!(names(&fs, fs.root()).contains(&"decoy".to_owned()));
    }

    #[test]
    fn sparse_blocks_zero_fill_holes_and_unstored_tail() {
        let mut b = Hammer2ImageBuilder::new();
        let obj = b
            .add_sparse_file(
                b.root(),
                "disk.img",
                300_000,
                &[(65_536, vec![0x11; 3000]), (200_000, vec![0x22; 1024])],
            )
            .unwrap();
        let fs = open(b.build().unwrap());
        let handle = fs.lookup("/disk.img").unwrap();
        assert_eq!(fs.stat(handle).unwrap().ino, obj);

        let data = read_all(&fs, handle);
        assert!(data[..65_536].iter().all(|b| *b == 0));
        assert!(data[65_536..68_536].iter().all(|b| *b == 0x11));
        // Block padding up to the 4 KiB radix reads as zero.
        assert!(data[68_536..200_000].iter().all(|b| *b == 0));
        assert!(data[200_000..201_024].iter().all(|b| *b == 0x22));
        assert!(data[201_024..].iter().all(|b| *b == 0));

        let mut buf = [0xFF_u8; 10];
        assert_eq!(fs.read(handle, 299_995, &mut buf).unwrap(), 5);
        assert_eq!(fs.read(handle, 300_000, &mut buf).unwrap(), 0);
    }

    #[test]
    fn deep_indirect_trees_list_every_entry_once() {
        let mut b = Hammer2ImageBuilder::new().with_fanout(1, 2);
        let dir = b.mkdir(b.root(), "many").unwrap();
        let mut expected: Vec<String> = (0..50).map(|i| format!("entry-{i}")).collect();
        for name in &expected {
            b.add_file(dir, name, name.as_bytes()).unwrap();
        }
        let fs = open(b.build().unwrap());
        let many = fs.lookup("/many").unwrap();

        for name in &expected {
            let obj = fs.lookup(&format!("/many/{name}")).unwrap();
            assert_eq!(read_all(&fs, obj), name.as_bytes());
        }

        let mut listed = names(&fs, many);
        assert_eq!(&listed[..2], &[".", ".."]);
        listed.drain(..2);
        listed.sort();
        expected.sort();
        assert_eq!(listed, expected);
    }

    #[test]
    fn dotdot_entries_resolve_parents() {
        let mut b = Hammer2ImageBuilder::new();
        let a = b.mkdir(b.root(), "a").unwrap();
        b.mkdir(a, "b").unwrap();
        let fs = open(b.build().unwrap());

        let a_obj = fs.lookup("/a").unwrap();
        let b_obj = fs.lookup("/a/b").unwrap();
        let mut cookie = 1;
        let dotdot = fs.readdir(b_obj, &mut cookie).unwrap().unwrap();
        assert_eq!((dotdot.name_str().as_str(), dotdot.object), ("..", a_obj));
        assert_eq!(cookie, FIRST_DIRENT_COOKIE);

        let mut cookie = 1;
        let root_dotdot = fs.readdir(fs.root(), &mut cookie).unwrap().unwrap();
        assert_eq!(root_dotdot.object, fs.root());
        assert_eq!(names(&fs, b_obj), [".", ".."]);
    }

    #[test]
    fn pfs_option_selects_root() {
        let mut b = Hammer2ImageBuilder::new();
        let boot = b.add_pfs("BOOT").unwrap();
        b.add_file(boot, "kernel", b"pfs kernel").unwrap();
        b.add_pfs("ROOT").unwrap();
        let image = b.build().unwrap();

        let fs = open_with(
            image.clone(),
            Hammer2Options {
                pfs: Some("BOOT".into()),
            },
        )
        .unwrap();
        assert_ne!(fs.root(), fs.superroot());
        let obj = fs.lookup("/kernel").unwrap();
        assert_eq!(read_all(&fs, obj), b"pfs kernel");
        assert_eq!(fs.lookup("/..").unwrap(), fs.root());

        let err = open_with(
            image,
            Hammer2Options {
                pfs: Some("MISSING".into()),
            },
        )
        .unwrap_err();
        assert!(matches!(err, BfsError::NotFound(_)));
    }

    #[test]
    fn newest_readable_header_copy_wins() {
        let image = Hammer2ImageBuilder::new().with_mirror_tid(3).build().unwrap();
        let mut dev = SparseByteDevice::new(3 * HAMMER2_ZONE_BYTES64 + 65_536);
        dev.write_at(0, &image);
        dev.write_at(HAMMER2_ZONE_BYTES64, &hammer2_header_copy(&image, 5));
        let mut bad = hammer2_header_copy(&image, 9);
        bad[0] ^= 0xFF;
        dev.write_at(2 * HAMMER2_ZONE_BYTES64, &bad);

        let dev: Arc<dyn ByteDevice> = Arc::new(dev);
        let fs = Hammer2Fs::open(dev, 4, Hammer2Options::default()).unwrap();
        assert_eq!((fs.header_slot(), fs.header().mirror_tid), (1, 5));

        let mut tail = SparseByteDevice::new(2 * HAMMER2_ZONE_BYTES64 + 65_536);
        tail.write_at(0, &image);
        tail.write_at(HAMMER2_ZONE_BYTES64, &hammer2_header_copy(&image, 8));
        let failing: Arc<dyn ByteDevice> = Arc::new(FailingTail {
            inner: tail,
            fail_from: HAMMER2_ZONE_BYTES64,
        });
        let fs = Hammer2Fs::open(failing, 4, Hammer2Options::default()).unwrap();
        assert_eq!((fs.header_slot(), fs.header().mirror_tid), (0, 3));
    }

    #[test]
    fn stat_reports_attributes_and_reuses_cached_inode() {
        let mut b = Hammer2ImageBuilder::new();
        let f = b.add_file(b.root(), "motd", b"hello").unwrap();
        b.set_owner(f, 1001, 20);
        b.set_mode(f, 0o600);
        let dev_node = b.add_special(b.root(), "console", HAMMER2_OBJTYPE_CDEV).unwrap();
        let fs = open(b.build().unwrap());

        let motd = fs.lookup("/motd").unwrap();
        let attrs = fs.stat(motd).unwrap();
        assert_eq!(attrs.ino, f);
        assert_eq!(attrs.mode, bfs_types::S_IFREG | 0o600);
        assert_eq!((attrs.uid, attrs.gid, attrs.size, attrs.nlink), (1001, 20, 5, 1));

        let before = fs.cache().stats();
        assert_eq!(fs.stat(motd).unwrap(), attrs);
        assert_eq!(fs.cache().stats(), before);

        let console = fs.lookup("/console").unwrap();
        let attrs = fs.stat(console).unwrap();
        assert_eq!((attrs.ino, attrs.kind), (dev_node, FileType::CharDevice));
        assert!(matches!(fs.stat(ObjectId(0x1234)), Err(BfsError::NotFound(_))));
    }

    #[test]
    fn directory_and_file_misuse_errors() {
        let mut b = Hammer2ImageBuilder::new();
        b.add_file(b.root(), "f", b"x").unwrap();
        let fs = open(b.build().unwrap());
        let f = fs.lookup("/f").unwrap();

        let mut buf = [0_u8; 4];
        assert!(matches!(fs.read(fs.root(), 0, &mut buf), Err(BfsError::IsDirectory)));
        let mut cookie = 0;
        assert!(matches!(fs.readdir(f, &mut cookie), Err(BfsError::NotDirectory)));
        assert!(matches!(fs.lookup_in(f, b"x"), Err(BfsError::NotDirectory)));
    }

    #[test]
    fn compression_methods_on_data_blocks() {
        let content = vec![0x77_u8; 600];
        let mut b = Hammer2ImageBuilder::new();
        b.add_file(b.root(), "blob", &content).unwrap();
        let image = b.build().unwrap();

        let fs = open(image.clone());
        let blob = fs.lookup("/blob").unwrap();
        assert_eq!(read_all(&fs, blob), content);
        // methods byte of the first blockref in the inode's blockset
        let methods_at = usize::try_from(blob.0 & !HAMMER2_OFF_MASK_RADIX).unwrap() + 512 + 1;

        let mut autozero = image.clone();
        autozero[methods_at] = HAMMER2_COMP_AUTOZERO << 4;
        let fs = open(autozero);
        assert_eq!(read_all(&fs, blob), vec![0; 600]);

        let mut lz4 = image;
        lz4[methods_at] = 2 << 4;
        let fs = open(lz4);
        let mut buf = [0_u8; 16];
        assert!(matches!(
            fs.read(blob, 0, &mut buf),
            Err(BfsError::CorruptIndex { .. })
        ));
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(24))]

            /// Searching one past each match yields strictly increasing keys
            /// and reaches every child exactly once.
            #[test]
            fn advancing_search_is_monotonic(
                count in 1_usize..60,
                blockset_slots in 1_usize..=4,
                indirect_slots in 2_usize..6,
            ) {
                let mut b = Hammer2ImageBuilder::new().with_fanout(blockset_slots, indirect_slots);
                for i in 0..count {
                    b.add_special(b.root(), &format!("n{i}"), HAMMER2_OBJTYPE_CDEV).unwrap();
                }
                let fs = open(b.build().unwrap());
                let root = fs.inode(fs.root()).unwrap();

                let mut low = 0_u64;
                let mut seen = Vec::new();
                while let Some(bref) = fs.search(&root, low, u64::MAX).unwrap() {
                    if let Some(prev) = seen.last() {
                        prop_assert!(bref.key > *prev);
                    }
                    seen.push(bref.key);
                    low = bref.key + 1;
                }
                prop_assert_eq!(seen.len(), count);
            }
        }
    }
}
