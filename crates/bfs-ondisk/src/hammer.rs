#![forbid(unsafe_code)]
//! HAMMER (format A) on-disk structures.
//!
//! A HAMMER volume is addressed in 16 KiB buffers. The volume header sits at
//! offset zero; every index and data reference is a zone-tagged 64-bit offset
//! that resolves either to an absolute volume position (raw-volume zone) or
//! to a position relative to the volume's buffer area. The whole namespace
//! lives in one B-tree of 4 KiB nodes whose elements are ordered by
//! [`BtreeKey`].

use bfs_types::{
    FileType, ParseError, ensure_slice, read_fixed, read_le_i32, read_le_i64, read_le_u16,
    read_le_u32, read_le_u64, read_u8, trim_nul_padded,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Block unit for all cache fetches on a HAMMER volume.
pub const HAMMER_BUFSIZE: u32 = 16_384;
/// Volume header signature (`HAMMER_FSBUF_VOLUME`).
pub const HAMMER_FSBUF_VOLUME: u64 = 0xC841_4D4D_C552_3031;
/// Bytes of the volume header that are decoded.
pub const HAMMER_VOLUME_HEADER_SIZE: usize = 0x100;

pub const HAMMER_ZONE_RAW_VOLUME: u64 = 1;
pub const HAMMER_ZONE_RAW_BUFFER: u64 = 2;
pub const HAMMER_ZONE_BTREE: u64 = 8;
pub const HAMMER_ZONE_LARGE_DATA: u64 = 10;
pub const HAMMER_ZONE_SMALL_DATA: u64 = 11;
/// Low bits of a zone offset that carry the position inside the zone.
pub const HAMMER_OFF_SHORT_MASK: u64 = (1 << 52) - 1;

pub const HAMMER_BTREE_NODE_SIZE: usize = 4096;
pub const HAMMER_BTREE_ELM_SIZE: usize = 64;
const HAMMER_BTREE_HEADER_SIZE: usize = 0x40;
pub const HAMMER_BTREE_LEAF_ELMS: usize = 63;
/// Internal nodes reserve one slot for the right-boundary element.
pub const HAMMER_BTREE_INT_ELMS: usize = HAMMER_BTREE_LEAF_ELMS - 1;
pub const HAMMER_BTREE_TYPE_INTERNAL: u8 = b'I';
pub const HAMMER_BTREE_TYPE_LEAF: u8 = b'L';
pub const HAMMER_BTREE_TYPE_RECORD: u8 = b'R';

pub const HAMMER_RECTYPE_INODE: u16 = 0x0001;
pub const HAMMER_RECTYPE_DATA: u16 = 0x0010;
pub const HAMMER_RECTYPE_DIRENTRY: u16 = 0x0011;
pub const HAMMER_RECTYPE_DB: u16 = 0x0012;

pub const HAMMER_LOCALIZE_INODE: u32 = 0x0001;
pub const HAMMER_LOCALIZE_MISC: u32 = 0x0002;

pub const HAMMER_OBJID_ROOT: i64 = 1;

pub const HAMMER_OBJTYPE_UNKNOWN: u8 = 0;
pub const HAMMER_OBJTYPE_DIRECTORY: u8 = 1;
pub const HAMMER_OBJTYPE_REGFILE: u8 = 2;
pub const HAMMER_OBJTYPE_DBFILE: u8 = 3;
pub const HAMMER_OBJTYPE_FIFO: u8 = 4;
pub const HAMMER_OBJTYPE_CDEV: u8 = 5;
pub const HAMMER_OBJTYPE_BDEV: u8 = 6;
pub const HAMMER_OBJTYPE_SOFTLINK: u8 = 7;
pub const HAMMER_OBJTYPE_PSEUDOFS: u8 = 8;
pub const HAMMER_OBJTYPE_SOCKET: u8 = 9;

/// Inode capability flag: directory entries live in the inode localization.
pub const HAMMER_INODE_CAP_DIR_LOCAL_INO: u8 = 0x01;

pub const HAMMER_INODE_DATA_SIZE: usize = 128;
/// Fixed prefix of a directory-entry record before the name bytes.
pub const HAMMER_ENTRY_NAME_OFFSET: usize = 16;

// ── Volume header ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HammerVolumeHeader {
    pub signature: u64,
    pub bot_beg: u64,
    pub mem_beg: u64,
    pub buf_beg: u64,
    pub buf_end: u64,
    pub fsid: [u8; 16],
    pub fstype: [u8; 16],
    pub label: String,
    pub vol_no: i32,
    pub vol_count: i32,
    pub version: u32,
    pub crc: u32,
    pub flags: u32,
    pub rootvol: u32,
    /// Zone offset of the root B-tree node.
    pub root_btree: u64,
    /// Next transaction id; grows with every flush.
    pub next_tid: u64,
}

impl HammerVolumeHeader {
    pub fn parse_from_region(region: &[u8]) -> Result<Self, ParseError> {
        let signature = read_le_u64(region, 0x00)?;
        if signature != HAMMER_FSBUF_VOLUME {
            return Err(ParseError::InvalidMagic {
                expected: HAMMER_FSBUF_VOLUME,
                actual: signature,
            });
        }
        ensure_slice(region, 0, HAMMER_VOLUME_HEADER_SIZE)?;

        let buf_beg = read_le_u64(region, 0x18)?;
        let buf_end = read_le_u64(region, 0x20)?;
        if buf_beg % u64::from(HAMMER_BUFSIZE) != 0 {
            return Err(ParseError::InvalidField {
                field: "vol_buf_beg",
                reason: "not aligned to the buffer size",
            });
        }
        if buf_end < buf_beg {
            return Err(ParseError::InvalidField {
                field: "vol_buf_end",
                reason: "ends before vol_buf_beg",
            });
        }

        let vol_count = read_le_i32(region, 0x94)?;
        if vol_count < 1 {
            return Err(ParseError::InvalidField {
                field: "vol_count",
                reason: "must be at least one",
            });
        }

        Ok(Self {
            signature,
            bot_beg: read_le_u64(region, 0x08)?,
            mem_beg: read_le_u64(region, 0x10)?,
            buf_beg,
            buf_end,
            fsid: read_fixed::<16>(region, 0x30)?,
            fstype: read_fixed::<16>(region, 0x40)?,
            label: trim_nul_padded(&read_fixed::<64>(region, 0x50)?),
            vol_no: read_le_i32(region, 0x90)?,
            vol_count,
            version: read_le_u32(region, 0x98)?,
            crc: read_le_u32(region, 0x9C)?,
            flags: read_le_u32(region, 0xA0)?,
            rootvol: read_le_u32(region, 0xA4)?,
            root_btree: read_le_u64(region, 0xF0)?,
            next_tid: read_le_u64(region, 0xF8)?,
        })
    }

    /// Translate a zone offset into a device byte offset.
    ///
    /// Returns `None` for the unused zone 0 or when the result overflows.
    #[must_use]
    pub fn resolve(&self, zone_off: u64) -> Option<u64> {
        let short = zone_off & HAMMER_OFF_SHORT_MASK;
        match zone_of(zone_off) {
            0 => None,
            HAMMER_ZONE_RAW_VOLUME => Some(short),
            _ => self.buf_beg.checked_add(short),
        }
    }
}

#[must_use]
pub fn zone_of(zone_off: u64) -> u64 {
    zone_off >> 60
}

/// Build a zone offset from a zone index and an in-zone position.
#[must_use]
pub fn zone_offset(zone: u64, short: u64) -> u64 {
    (zone << 60) | (short & HAMMER_OFF_SHORT_MASK)
}

// ── B-tree keys ─────────────────────────────────────────────────────────────

/// Sort key of a B-tree element.
///
/// Fields compare in declaration order. A `delete_tid` of zero means the
/// record is live and sorts after every non-zero `delete_tid` of the same
/// tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BtreeKey {
    pub localization: u32,
    pub obj_id: i64,
    pub rec_type: u16,
    pub key: i64,
    pub create_tid: u64,
    pub delete_tid: u64,
}

impl BtreeKey {
    /// Smallest key of the given record tuple.
    #[must_use]
    pub fn first_of(localization: u32, obj_id: i64, rec_type: u16, key: i64) -> Self {
        Self {
            localization,
            obj_id,
            rec_type,
            key,
            create_tid: 0,
            delete_tid: 1,
        }
    }

    /// Largest key of the given record tuple.
    #[must_use]
    pub fn last_of(localization: u32, obj_id: i64, rec_type: u16, key: i64) -> Self {
        Self {
            localization,
            obj_id,
            rec_type,
            key,
            create_tid: u64::MAX,
            delete_tid: 0,
        }
    }

    fn delete_rank(self) -> (bool, u64) {
        (self.delete_tid == 0, self.delete_tid)
    }

    fn parse(elm: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            obj_id: read_le_i64(elm, 0)?,
            key: read_le_i64(elm, 8)?,
            create_tid: read_le_u64(elm, 16)?,
            delete_tid: read_le_u64(elm, 24)?,
            rec_type: read_le_u16(elm, 32)?,
            localization: read_le_u32(elm, 36)?,
        })
    }
}

impl Ord for BtreeKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.localization
            .cmp(&other.localization)
            .then(self.obj_id.cmp(&other.obj_id))
            .then(self.rec_type.cmp(&other.rec_type))
            .then(self.key.cmp(&other.key))
            .then(self.create_tid.cmp(&other.create_tid))
            .then_with(|| self.delete_rank().cmp(&other.delete_rank()))
    }
}

impl PartialOrd for BtreeKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ── B-tree nodes ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    Internal,
    Leaf,
}

impl NodeType {
    #[must_use]
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            HAMMER_BTREE_TYPE_INTERNAL => Some(Self::Internal),
            HAMMER_BTREE_TYPE_LEAF => Some(Self::Leaf),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElmPayload {
    /// Child node reference of an internal element.
    Internal { subtree_offset: u64 },
    /// Record payload descriptor of a leaf element.
    Leaf {
        atime: u32,
        data_len: u32,
        data_offset: u64,
        data_crc: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtreeElm {
    pub base: BtreeKey,
    pub obj_type: u8,
    pub btype: u8,
    pub payload: ElmPayload,
}

impl BtreeElm {
    fn parse(elm: &[u8], node_type: NodeType) -> Result<Self, ParseError> {
        let base = BtreeKey::parse(elm)?;
        let payload = match node_type {
            NodeType::Internal => ElmPayload::Internal {
                subtree_offset: read_le_u64(elm, 40)?,
            },
            NodeType::Leaf => {
                let data_len = read_le_i32(elm, 44)?;
                ElmPayload::Leaf {
                    atime: read_le_u32(elm, 40)?,
                    data_len: u32::try_from(data_len).map_err(|_| ParseError::InvalidField {
                        field: "data_len",
                        reason: "negative record length",
                    })?,
                    data_offset: read_le_u64(elm, 48)?,
                    data_crc: read_le_u32(elm, 56)?,
                }
            }
        };
        Ok(Self {
            base,
            obj_type: read_u8(elm, 34)?,
            btype: read_u8(elm, 35)?,
            payload,
        })
    }

    /// `(data_offset, data_len)` of a leaf element.
    #[must_use]
    pub fn leaf_data(&self) -> Option<(u64, u32)> {
        match self.payload {
            ElmPayload::Leaf {
                data_offset,
                data_len,
                ..
            } => Some((data_offset, data_len)),
            ElmPayload::Internal { .. } => None,
        }
    }

    #[must_use]
    pub fn subtree_offset(&self) -> Option<u64> {
        match self.payload {
            ElmPayload::Internal { subtree_offset } => Some(subtree_offset),
            ElmPayload::Leaf { .. } => None,
        }
    }
}

/// Decoded B-tree node.
///
/// Internal nodes carry `count + 1` elements: the last one is the right
/// boundary of the node's key range and has no usable subtree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtreeNode {
    pub parent: u64,
    pub crc: u32,
    pub count: usize,
    pub node_type: NodeType,
    pub mirror_tid: u64,
    pub elms: Vec<BtreeElm>,
}

impl BtreeNode {
    pub fn parse_from_block(block: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(block, 0, HAMMER_BTREE_NODE_SIZE)?;

        let node_type = NodeType::from_raw(block[0x14]).ok_or(ParseError::InvalidField {
            field: "node_type",
            reason: "unknown node type",
        })?;
        let count = usize::try_from(read_le_i32(block, 0x10)?).map_err(|_| {
            ParseError::InvalidField {
                field: "count",
                reason: "negative element count",
            }
        })?;
        let (max, stored) = match node_type {
            NodeType::Internal => (HAMMER_BTREE_INT_ELMS, count + 1),
            NodeType::Leaf => (HAMMER_BTREE_LEAF_ELMS, count),
        };
        if count > max {
            return Err(ParseError::InvalidField {
                field: "count",
                reason: "exceeds node capacity",
            });
        }

        let mut elms = Vec::with_capacity(stored);
        for idx in 0..stored {
            let at = HAMMER_BTREE_HEADER_SIZE + idx * HAMMER_BTREE_ELM_SIZE;
            elms.push(BtreeElm::parse(
                ensure_slice(block, at, HAMMER_BTREE_ELM_SIZE)?,
                node_type,
            )?);
        }

        Ok(Self {
            parent: read_le_u64(block, 0x00)?,
            crc: read_le_u32(block, 0x0C)?,
            count,
            node_type,
            mirror_tid: read_le_u64(block, 0x38)?,
            elms,
        })
    }

    /// Elements that participate in search (excludes the internal boundary).
    #[must_use]
    pub fn entries(&self) -> &[BtreeElm] {
        &self.elms[..self.count]
    }

    /// Right boundary element of an internal node.
    #[must_use]
    pub fn right_boundary(&self) -> Option<&BtreeElm> {
        match self.node_type {
            NodeType::Internal => self.elms.get(self.count),
            NodeType::Leaf => None,
        }
    }
}

// ── Records ─────────────────────────────────────────────────────────────────

/// Payload of an INODE record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HammerInode {
    pub version: u16,
    pub mode: u16,
    pub uflags: u32,
    pub rmajor: u32,
    pub rminor: u32,
    pub ctime: u64,
    pub parent_obj_id: i64,
    pub uid: [u8; 16],
    pub gid: [u8; 16],
    pub obj_type: u8,
    pub cap_flags: u8,
    pub size: u64,
    pub nlinks: u64,
    pub mtime: u64,
    pub atime: u64,
}

impl HammerInode {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(data, 0, HAMMER_INODE_DATA_SIZE)?;
        let size = read_le_i64(data, 72)?;
        Ok(Self {
            version: read_le_u16(data, 0)?,
            mode: read_le_u16(data, 2)?,
            uflags: read_le_u32(data, 4)?,
            rmajor: read_le_u32(data, 8)?,
            rminor: read_le_u32(data, 12)?,
            ctime: read_le_u64(data, 16)?,
            parent_obj_id: read_le_i64(data, 24)?,
            uid: read_fixed::<16>(data, 32)?,
            gid: read_fixed::<16>(data, 48)?,
            obj_type: data[64],
            cap_flags: data[65],
            size: u64::try_from(size).map_err(|_| ParseError::InvalidField {
                field: "size",
                reason: "negative file size",
            })?,
            nlinks: read_le_u64(data, 80)?,
            mtime: read_le_u64(data, 88)?,
            atime: read_le_u64(data, 96)?,
        })
    }

    /// Localization of this directory's entry records.
    #[must_use]
    pub fn dirent_localization(&self) -> u32 {
        if self.cap_flags & HAMMER_INODE_CAP_DIR_LOCAL_INO != 0 {
            HAMMER_LOCALIZE_INODE
        } else {
            HAMMER_LOCALIZE_MISC
        }
    }

    /// Record type holding this object's file content.
    #[must_use]
    pub fn data_rec_type(&self) -> u16 {
        if self.obj_type == HAMMER_OBJTYPE_DBFILE {
            HAMMER_RECTYPE_DB
        } else {
            HAMMER_RECTYPE_DATA
        }
    }
}

/// Payload of a DIRENTRY record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HammerDirEntry {
    pub obj_id: i64,
    pub localization: u32,
    pub name: Vec<u8>,
}

impl HammerDirEntry {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(data, 0, HAMMER_ENTRY_NAME_OFFSET)?;
        Ok(Self {
            obj_id: read_le_i64(data, 0)?,
            localization: read_le_u32(data, 8)?,
            name: data[HAMMER_ENTRY_NAME_OFFSET..].to_vec(),
        })
    }
}

#[must_use]
pub fn file_type(obj_type: u8) -> FileType {
    match obj_type {
        HAMMER_OBJTYPE_DIRECTORY => FileType::Directory,
        HAMMER_OBJTYPE_REGFILE | HAMMER_OBJTYPE_DBFILE => FileType::RegularFile,
        HAMMER_OBJTYPE_FIFO => FileType::Fifo,
        HAMMER_OBJTYPE_CDEV => FileType::CharDevice,
        HAMMER_OBJTYPE_BDEV => FileType::BlockDevice,
        HAMMER_OBJTYPE_SOFTLINK => FileType::Symlink,
        HAMMER_OBJTYPE_SOCKET => FileType::Socket,
        _ => FileType::Unknown,
    }
}

// ── Directory name keys ─────────────────────────────────────────────────────

/// How directory-entry keys are derived from names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirhashMode {
    /// Every name hashes to zero: lookups scan the whole directory.
    #[default]
    Stub,
    /// CRC-32 of the name in the high 32 bits of the key.
    Crc32,
}

impl DirhashMode {
    /// Inclusive key range a directory entry named `name` may be stored in.
    #[must_use]
    pub fn namekey_range(self, name: &[u8]) -> (i64, i64) {
        match self {
            Self::Stub => (0, i64::MAX),
            Self::Crc32 => {
                let key = crc32_namekey(name);
                (key, key | 0xFFFF_FFFF)
            }
        }
    }
}

/// Base key of a name under [`DirhashMode::Crc32`].
///
/// The low 32 bits are free for collision resolution; the result is never
/// below `1 << 32` so the small keys stay available to readdir cookies.
#[must_use]
pub fn crc32_namekey(name: &[u8]) -> i64 {
    let crc = crc32fast::hash(name) & 0x7FFF_FFFF;
    let key = i64::from(crc) << 32;
    if key == 0 { 1 << 32 } else { key }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(obj_id: i64, k: i64, create_tid: u64, delete_tid: u64) -> BtreeKey {
        BtreeKey {
            localization: HAMMER_LOCALIZE_MISC,
            obj_id,
            rec_type: HAMMER_RECTYPE_DIRENTRY,
            key: k,
            create_tid,
            delete_tid,
        }
    }

    fn put_internal_elm(block: &mut [u8], idx: usize, k: &BtreeKey, subtree: u64) {
        let at = 0x40 + idx * HAMMER_BTREE_ELM_SIZE;
        let elm = &mut block[at..at + HAMMER_BTREE_ELM_SIZE];
        elm[0..8].copy_from_slice(&k.obj_id.to_le_bytes());
        elm[8..16].copy_from_slice(&k.key.to_le_bytes());
        elm[16..24].copy_from_slice(&k.create_tid.to_le_bytes());
        elm[24..32].copy_from_slice(&k.delete_tid.to_le_bytes());
        elm[32..34].copy_from_slice(&k.rec_type.to_le_bytes());
        elm[36..40].copy_from_slice(&k.localization.to_le_bytes());
        elm[40..48].copy_from_slice(&subtree.to_le_bytes());
    }

    #[test]
    fn parse_volume_header_smoke() {
        let mut hdr = vec![0_u8; HAMMER_VOLUME_HEADER_SIZE];
        hdr[0..8].copy_from_slice(&HAMMER_FSBUF_VOLUME.to_le_bytes());
        hdr[0x18..0x20].copy_from_slice(&0x10000_u64.to_le_bytes());
        hdr[0x20..0x28].copy_from_slice(&0x80000_u64.to_le_bytes());
        hdr[0x50..0x54].copy_from_slice(b"BOOT");
        hdr[0x94..0x98].copy_from_slice(&1_i32.to_le_bytes());
        hdr[0x98..0x9C].copy_from_slice(&7_u32.to_le_bytes());
        let root = zone_offset(HAMMER_ZONE_BTREE, 0x4000);
        hdr[0xF0..0xF8].copy_from_slice(&root.to_le_bytes());
        hdr[0xF8..0x100].copy_from_slice(&42_u64.to_le_bytes());

        let parsed = HammerVolumeHeader::parse_from_region(&hdr).expect("volume header");
        assert_eq!(parsed.label, "BOOT");
        assert_eq!(parsed.version, 7);
        assert_eq!(parsed.next_tid, 42);
        assert_eq!(parsed.resolve(parsed.root_btree), Some(0x14000));
        assert_eq!(
            parsed.resolve(zone_offset(HAMMER_ZONE_RAW_VOLUME, 0x2000)),
            Some(0x2000)
        );
        assert_eq!(parsed.resolve(0x1234), None);
    }

    #[test]
    fn volume_header_rejects_wrong_signature() {
        let hdr = vec![0_u8; HAMMER_VOLUME_HEADER_SIZE];
        assert!(matches!(
            HammerVolumeHeader::parse_from_region(&hdr),
            Err(ParseError::InvalidMagic { actual: 0, .. })
        ));
    }

    #[test]
    fn live_record_sorts_after_deleted_versions() {
        let live = key(5, 100, 10, 0);
        let deleted = key(5, 100, 10, 20);
        assert_eq!(live.cmp(&deleted), Ordering::Greater);
        assert!(key(5, 100, 10, 20) < key(5, 100, 10, 30));
        assert!(key(5, 99, 10, 0) < key(5, 100, 10, 20));
        assert!(BtreeKey::first_of(2, 5, 0x11, 100) < deleted);
        assert!(BtreeKey::last_of(2, 5, 0x11, 100) >= live);
    }

    #[test]
    fn parse_internal_node_keeps_boundary() {
        let mut block = vec![0_u8; HAMMER_BTREE_NODE_SIZE];
        block[0x10..0x14].copy_from_slice(&2_i32.to_le_bytes());
        block[0x14] = HAMMER_BTREE_TYPE_INTERNAL;
        put_internal_elm(&mut block, 0, &key(1, 0, 0, 0), 0x8000_0000_0000_4000);
        put_internal_elm(&mut block, 1, &key(7, 0, 0, 0), 0x8000_0000_0000_5000);
        put_internal_elm(&mut block, 2, &key(i64::MAX, 0, 0, 0), 0);

        let node = BtreeNode::parse_from_block(&block).expect("node");
        assert_eq!(node.node_type, NodeType::Internal);
        assert_eq!(node.entries().len(), 2);
        assert_eq!(node.right_boundary().map(|e| e.base.obj_id), Some(i64::MAX));
        assert_eq!(
            node.entries()[1].subtree_offset(),
            Some(0x8000_0000_0000_5000)
        );
    }

    #[test]
    fn parse_node_rejects_unknown_type_and_overflow() {
        let mut block = vec![0_u8; HAMMER_BTREE_NODE_SIZE];
        block[0x14] = b'X';
        assert!(matches!(
            BtreeNode::parse_from_block(&block),
            Err(ParseError::InvalidField {
                field: "node_type",
                ..
            })
        ));

        block[0x14] = HAMMER_BTREE_TYPE_INTERNAL;
        block[0x10..0x14].copy_from_slice(&63_i32.to_le_bytes());
        assert!(matches!(
            BtreeNode::parse_from_block(&block),
            Err(ParseError::InvalidField { field: "count", .. })
        ));

        block[0x14] = HAMMER_BTREE_TYPE_LEAF;
        let node = BtreeNode::parse_from_block(&block).expect("full leaf");
        assert_eq!(node.elms.len(), 63);
        assert!(node.right_boundary().is_none());
    }

    #[test]
    fn parse_inode_and_dirent() {
        let mut ino = vec![0_u8; HAMMER_INODE_DATA_SIZE];
        ino[2..4].copy_from_slice(&0o755_u16.to_le_bytes());
        ino[24..32].copy_from_slice(&1_i64.to_le_bytes());
        ino[64] = HAMMER_OBJTYPE_DIRECTORY;
        ino[65] = HAMMER_INODE_CAP_DIR_LOCAL_INO;
        ino[72..80].copy_from_slice(&4096_i64.to_le_bytes());
        let inode = HammerInode::parse(&ino).expect("inode");
        assert_eq!(inode.mode, 0o755);
        assert_eq!(inode.dirent_localization(), HAMMER_LOCALIZE_INODE);
        assert_eq!(inode.data_rec_type(), HAMMER_RECTYPE_DATA);
        assert_eq!(file_type(inode.obj_type), FileType::Directory);

        let mut ent = vec![0_u8; HAMMER_ENTRY_NAME_OFFSET];
        ent[0..8].copy_from_slice(&77_i64.to_le_bytes());
        ent.extend_from_slice(b"kernel");
        let dirent = HammerDirEntry::parse(&ent).expect("dirent");
        assert_eq!(dirent.obj_id, 77);
        assert_eq!(dirent.name, b"kernel");
    }

    #[test]
    fn namekeys() {
        assert_eq!(DirhashMode::Stub.namekey_range(b"kernel"), (0, i64::MAX));
        let (lo, hi) = DirhashMode::Crc32.namekey_range(b"kernel");
        assert_eq!(lo & 0xFFFF_FFFF, 0);
        assert!(lo >= 1 << 32);
        assert_eq!(hi - lo, 0xFFFF_FFFF);
        assert_eq!(lo, crc32_namekey(b"kernel"));
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// A live element always compares after a deleted element of the
            /// same record tuple and creation version.
            #[test]
            fn live_is_infinite_delete(
                obj_id in any::<i64>(),
                k in any::<i64>(),
                create_tid in any::<u64>(),
                delete_tid in 1_u64..,
            ) {
                let live = key(obj_id, k, create_tid, 0);
                let dead = key(obj_id, k, create_tid, delete_tid);
                prop_assert_eq!(live.cmp(&dead), Ordering::Greater);
                prop_assert_eq!(dead.cmp(&live), Ordering::Less);
            }

            #[test]
            fn ordering_is_total_and_consistent(
                a in (any::<i64>(), 0_i64..4, 0_u64..4, 0_u64..4),
                b in (any::<i64>(), 0_i64..4, 0_u64..4, 0_u64..4),
            ) {
                let a = key(a.0 % 3, a.1, a.2, a.3);
                let b = key(b.0 % 3, b.1, b.2, b.3);
                prop_assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
                prop_assert_eq!(a.cmp(&b) == Ordering::Equal, a == b);
            }
        }
    }
}
