#![forbid(unsafe_code)]
//! Read-only HAMMER volume browser.
//!
//! All lookups go through one iterative B-tree search ([`HammerFs::search`])
//! that returns the first visible leaf element inside an inclusive key range.
//! Directory scans, inode fetches and file-extent scans are all expressed as
//! repeated searches with an advancing low key.

use bfs_block::{BlockCache, ByteDevice, Extent, read_extents};
use bfs_error::{BfsError, Result};
use bfs_ondisk::hammer::{
    self, BtreeElm, BtreeKey, BtreeNode, DirhashMode, HAMMER_BTREE_NODE_SIZE, HAMMER_BUFSIZE,
    HAMMER_INODE_DATA_SIZE, HAMMER_LOCALIZE_INODE, HAMMER_LOCALIZE_MISC, HAMMER_OBJID_ROOT,
    HAMMER_RECTYPE_DIRENTRY, HAMMER_RECTYPE_INODE, HAMMER_VOLUME_HEADER_SIZE, HammerDirEntry,
    HammerInode, HammerVolumeHeader, NodeType,
};
use bfs_types::{
    Attrs, DirEntry, FileType, ObjectId, ParseError, S_IPERM, micros_to_system_time,
    uuid_to_unix_xid,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace};

/// Deepest tree accepted before the index is declared corrupt.
const HAMMER_BTREE_MAX_DEPTH: usize = 32;
/// Nodes with more elements than this are narrowed by bisection first.
const BINARY_SEARCH_THRESHOLD: usize = 8;
/// Readdir cookies below this value name the synthetic `.` and `..`.
const FIRST_DIRENT_COOKIE: u64 = 2;

/// Tunables for HAMMER volumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HammerOptions {
    /// Directory-entry key derivation.
    pub dirhash: DirhashMode,
    /// Transaction id the volume is viewed as of. Records created after it
    /// are invisible; records deleted after it are still visible.
    pub as_of: u64,
}

impl Default for HammerOptions {
    fn default() -> Self {
        Self {
            dirhash: DirhashMode::Stub,
            as_of: u64::MAX,
        }
    }
}

/// An open HAMMER volume.
pub struct HammerFs {
    cache: BlockCache,
    header: HammerVolumeHeader,
    opts: HammerOptions,
    /// Last directory whose entry localization was resolved.
    dir_localization: Mutex<Option<(i64, u32)>>,
}

impl std::fmt::Debug for HammerFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HammerFs")
            .field("label", &self.header.label)
            .field("root_btree", &format_args!("{:#x}", self.header.root_btree))
            .field("opts", &self.opts)
            .finish_non_exhaustive()
    }
}

fn corrupt_at(offset: u64) -> impl FnOnce(ParseError) -> BfsError {
    move |err| BfsError::corrupt(offset, err.to_string())
}

fn object_id(obj_id: i64) -> Result<ObjectId> {
    u64::try_from(obj_id)
        .map(ObjectId)
        .map_err(|_| BfsError::NotFound(format!("negative object id {obj_id}")))
}

fn obj_id_of(obj: ObjectId) -> Result<i64> {
    i64::try_from(obj.0).map_err(|_| BfsError::NotFound(format!("object {obj}")))
}

impl HammerFs {
    /// Validate the volume header and the root inode.
    ///
    /// Returns `NotThisFormat` when the device does not carry a HAMMER
    /// signature.
    pub fn open(dev: Arc<dyn ByteDevice>, cache_lines: usize, opts: HammerOptions) -> Result<Self> {
        if dev.len_bytes() < u64::from(HAMMER_BUFSIZE) {
            return Err(BfsError::NotThisFormat(format!(
                "device too small for a HAMMER volume header ({} bytes)",
                dev.len_bytes()
            )));
        }
        let cache = BlockCache::new(dev, HAMMER_BUFSIZE, cache_lines)?;
        let header = cache
            .with_bytes(0, HAMMER_VOLUME_HEADER_SIZE, HammerVolumeHeader::parse_from_region)?
            .map_err(|err| match err {
                ParseError::InvalidMagic { actual, .. } => {
                    BfsError::NotThisFormat(format!("HAMMER signature mismatch ({actual:#x})"))
                }
                other => BfsError::corrupt(0, other.to_string()),
            })?;
        if header.resolve(header.root_btree).is_none() {
            return Err(BfsError::corrupt(0, "root B-tree offset is not addressable"));
        }
        debug!(
            label = %header.label,
            version = header.version,
            next_tid = header.next_tid,
            root_btree = format_args!("{:#x}", header.root_btree),
            "hammer volume header"
        );

        let fs = Self {
            cache,
            header,
            opts,
            dir_localization: Mutex::new(None),
        };
        let root = fs.inode(HAMMER_OBJID_ROOT).map_err(|err| match err {
            BfsError::NotFound(_) => BfsError::corrupt(0, "root inode missing"),
            other => other,
        })?;
        if hammer::file_type(root.obj_type) != FileType::Directory {
            return Err(BfsError::corrupt(0, "root inode is not a directory"));
        }
        Ok(fs)
    }

    #[must_use]
    pub fn header(&self) -> &HammerVolumeHeader {
        &self.header
    }

    #[must_use]
    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    #[must_use]
    pub fn options(&self) -> &HammerOptions {
        &self.opts
    }

    #[must_use]
    pub fn root(&self) -> ObjectId {
        ObjectId(HAMMER_OBJID_ROOT.unsigned_abs())
    }

    fn resolve(&self, zone_off: u64) -> Result<u64> {
        self.header
            .resolve(zone_off)
            .ok_or_else(|| BfsError::corrupt(zone_off, "unaddressable zone offset"))
    }

    fn read_node(&self, zone_off: u64) -> Result<BtreeNode> {
        let phys = self.resolve(zone_off)?;
        self.cache
            .with_bytes(phys, HAMMER_BTREE_NODE_SIZE, BtreeNode::parse_from_block)?
            .map_err(corrupt_at(phys))
    }

    fn visible(&self, elm: &BtreeElm) -> bool {
        let base = &elm.base;
        base.create_tid <= self.opts.as_of
            && (base.delete_tid == 0 || base.delete_tid > self.opts.as_of)
    }

    /// First visible leaf element with `low <= key <= high`.
    ///
    /// When a leaf runs out, the search restarts from the root at the right
    /// boundary of the last subtree it descended into.
    pub fn search(&self, low: &BtreeKey, high: &BtreeKey) -> Result<Option<BtreeElm>> {
        let mut search = *low;

        'restart: loop {
            let mut node_off = self.header.root_btree;
            let mut boundary: Option<BtreeKey> = None;

            for depth in 0..=HAMMER_BTREE_MAX_DEPTH {
                let node = self.read_node(node_off)?;
                trace!(
                    depth,
                    node = format_args!("{node_off:#x}"),
                    count = node.count,
                    "btree descend"
                );
                let entries = node.entries();

                match node.node_type {
                    NodeType::Internal => {
                        if entries.is_empty() {
                            return Err(BfsError::corrupt(
                                self.resolve(node_off)?,
                                "empty internal node",
                            ));
                        }
                        let i = first_not_less(entries, &search);
                        let child = if i < entries.len() && entries[i].base == search {
                            i
                        } else {
                            i.saturating_sub(1)
                        };
                        boundary = node.elms.get(child + 1).map(|elm| elm.base);
                        node_off = entries[child]
                            .subtree_offset()
                            .ok_or_else(|| BfsError::corrupt(node_off, "missing subtree"))?;
                    }
                    NodeType::Leaf => {
                        for elm in &entries[first_not_less(entries, &search)..] {
                            if elm.base > *high {
                                return Ok(None);
                            }
                            if self.visible(elm) {
                                return Ok(Some(*elm));
                            }
                        }
                        match boundary {
                            Some(next) if next > search && next <= *high => {
                                search = next;
                                continue 'restart;
                            }
                            _ => return Ok(None),
                        }
                    }
                }
            }

            return Err(BfsError::corrupt(
                self.resolve(node_off)?,
                format!("B-tree deeper than {HAMMER_BTREE_MAX_DEPTH} levels"),
            ));
        }
    }

    fn with_record<R>(&self, elm: &BtreeElm, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let (data_offset, data_len) = elm
            .leaf_data()
            .ok_or_else(|| BfsError::corrupt(elm.base.key.unsigned_abs(), "not a leaf element"))?;
        let phys = self.resolve(data_offset)?;
        self.cache.with_bytes(phys, data_len as usize, f)
    }

    /// Decoded inode record of `obj_id`.
    pub fn inode(&self, obj_id: i64) -> Result<HammerInode> {
        let low = BtreeKey::first_of(HAMMER_LOCALIZE_INODE, obj_id, HAMMER_RECTYPE_INODE, 0);
        let high = BtreeKey::last_of(HAMMER_LOCALIZE_INODE, obj_id, HAMMER_RECTYPE_INODE, 0);
        let elm = self
            .search(&low, &high)?
            .ok_or_else(|| BfsError::NotFound(format!("inode {obj_id}")))?;
        let (data_offset, data_len) = elm.leaf_data().unwrap_or_default();
        if (data_len as usize) < HAMMER_INODE_DATA_SIZE {
            return Err(BfsError::corrupt(data_offset, "short inode record"));
        }
        let phys = self.resolve(data_offset)?;
        self.cache
            .with_bytes(phys, HAMMER_INODE_DATA_SIZE, HammerInode::parse)?
            .map_err(corrupt_at(phys))
    }

    fn dirent_localization(&self, dir: i64) -> Result<u32> {
        if let Some((cached, loc)) = *self.dir_localization.lock() {
            if cached == dir {
                return Ok(loc);
            }
        }
        let inode = self.inode(dir)?;
        if hammer::file_type(inode.obj_type) != FileType::Directory {
            return Err(BfsError::NotDirectory);
        }
        let loc = inode.dirent_localization();
        *self.dir_localization.lock() = Some((dir, loc));
        Ok(loc)
    }

    fn decode_dirent(&self, elm: &BtreeElm) -> Result<HammerDirEntry> {
        let (data_offset, _) = elm.leaf_data().unwrap_or_default();
        self.with_record(elm, HammerDirEntry::parse)?
            .map_err(corrupt_at(data_offset))
    }

    /// Find `name` in directory `dir`.
    pub fn lookup_in(&self, dir: i64, name: &[u8]) -> Result<Option<(i64, FileType)>> {
        let loc = self.dirent_localization(dir)?;
        let (mut key, key_end) = self.opts.dirhash.namekey_range(name);
        let high = BtreeKey::last_of(loc, dir, HAMMER_RECTYPE_DIRENTRY, key_end);

        loop {
            let low = BtreeKey::first_of(loc, dir, HAMMER_RECTYPE_DIRENTRY, key);
            let Some(elm) = self.search(&low, &high)? else {
                return Ok(None);
            };
            let entry = self.decode_dirent(&elm)?;
            if entry.name == name {
                return Ok(Some((entry.obj_id, hammer::file_type(elm.obj_type))));
            }
            trace!(dir, key = elm.base.key, "dirhash collision");
            match elm.base.key.checked_add(1) {
                Some(next) if next <= key_end => key = next,
                _ => return Ok(None),
            }
        }
    }

    fn parent_of(&self, obj_id: i64) -> Result<i64> {
        let inode = self.inode(obj_id)?;
        Ok(if obj_id == HAMMER_OBJID_ROOT || inode.parent_obj_id == 0 {
            obj_id
        } else {
            inode.parent_obj_id
        })
    }

    /// Resolve a slash-separated path from the root directory.
    pub fn lookup(&self, path: &str) -> Result<ObjectId> {
        let mut cur = HAMMER_OBJID_ROOT;
        let mut kind = FileType::Directory;

        for comp in path.split('/').filter(|c| !c.is_empty()) {
            if !kind.is_dir() {
                return Err(BfsError::NotDirectory);
            }
            match comp {
                "." => {}
                ".." => cur = self.parent_of(cur)?,
                _ => {
                    let (obj_id, child_kind) = self
                        .lookup_in(cur, comp.as_bytes())?
                        .ok_or_else(|| BfsError::NotFound(path.to_owned()))?;
                    cur = obj_id;
                    kind = child_kind;
                }
            }
        }
        object_id(cur)
    }

    pub fn stat(&self, obj: ObjectId) -> Result<Attrs> {
        let inode = self.inode(obj_id_of(obj)?)?;
        let kind = hammer::file_type(inode.obj_type);
        Ok(Attrs {
            ino: obj.0,
            kind,
            mode: kind.mode_bits() | (u32::from(inode.mode) & S_IPERM),
            uid: uuid_to_unix_xid(&inode.uid),
            gid: uuid_to_unix_xid(&inode.gid),
            size: inode.size,
            nlink: inode.nlinks,
            mtime: micros_to_system_time(inode.mtime),
        })
    }

    /// Read file bytes at `offset`, zero-filling holes.
    ///
    /// Data records are keyed by the file offset one past their last byte, so
    /// the extent holding `offset` is the first record whose key is greater
    /// than `offset`.
    pub fn read(&self, obj: ObjectId, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let obj_id = obj_id_of(obj)?;
        let inode = self.inode(obj_id)?;
        if hammer::file_type(inode.obj_type).is_dir() {
            return Err(BfsError::IsDirectory);
        }
        if offset >= inode.size {
            return Ok(0);
        }
        let len = usize::try_from(inode.size - offset).map_or(buf.len(), |left| left.min(buf.len()));
        let rec_type = inode.data_rec_type();
        let high = BtreeKey::last_of(HAMMER_LOCALIZE_MISC, obj_id, rec_type, i64::MAX);

        read_extents(&self.cache, offset, &mut buf[..len], |file_off| {
            let Ok(key) = i64::try_from(file_off + 1) else {
                return Ok(None);
            };
            let low = BtreeKey::first_of(HAMMER_LOCALIZE_MISC, obj_id, rec_type, key);
            let Some(elm) = self.search(&low, &high)? else {
                return Ok(None);
            };
            let (data_offset, data_len) = elm.leaf_data().unwrap_or_default();
            let end = elm.base.key.unsigned_abs();
            let start = end.checked_sub(u64::from(data_len)).ok_or_else(|| {
                BfsError::corrupt(data_offset, "data record longer than its end offset")
            })?;
            Ok(Some(Extent {
                start,
                end,
                stored: u64::from(data_len),
                physical: self.resolve(data_offset)?,
            }))
        })
    }

    /// Next directory entry at or after `cookie`.
    ///
    /// Cookies 0 and 1 yield `.` and `..`; larger cookies are entry keys.
    pub fn readdir(&self, obj: ObjectId, cookie: &mut u64) -> Result<Option<DirEntry>> {
        let dir = obj_id_of(obj)?;
        let loc = self.dirent_localization(dir)?;

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
                    object: object_id(self.parent_of(dir)?)?,
                    kind: FileType::Directory,
                }));
            }
            _ => {}
        }

        let Ok(key) = i64::try_from(*cookie) else {
            return Ok(None);
        };
        let low = BtreeKey::first_of(loc, dir, HAMMER_RECTYPE_DIRENTRY, key);
        let high = BtreeKey::last_of(loc, dir, HAMMER_RECTYPE_DIRENTRY, i64::MAX);
        let Some(elm) = self.search(&low, &high)? else {
            return Ok(None);
        };
        let entry = self.decode_dirent(&elm)?;
        *cookie = elm.base.key.unsigned_abs().saturating_add(1);
        Ok(Some(DirEntry {
            name: entry.name,
            object: object_id(entry.obj_id)?,
            kind: hammer::file_type(elm.obj_type),
        }))
    }
}

/// Index of the first element not less than `key`.
///
/// Large nodes are narrowed by bisection first. The narrowing only keeps a
/// lower bound that is known to be less than `key`, and the linear scan
/// restarts one position before it.
fn first_not_less(elms: &[BtreeElm], key: &BtreeKey) -> usize {
    let mut i = 0;
    if elms.len() > BINARY_SEARCH_THRESHOLD {
        let (mut lo, mut hi) = (0, elms.len());
        while hi - lo > BINARY_SEARCH_THRESHOLD / 2 {
            let mid = lo + (hi - lo) / 2;
            if elms[mid].base < *key {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        i = lo.saturating_sub(1);
    }
    while i < elms.len() && elms[i].base < *key {
        i += 1;
    }
    i
}
