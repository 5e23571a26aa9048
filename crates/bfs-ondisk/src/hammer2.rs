#![forbid(unsafe_code)]
//! HAMMER2 (format B) on-disk structures.
//!
//! Everything below the volume header is reached through 128-byte blockrefs.
//! A blockref covers the key range `[key, key + 2^keybits - 1]` and points at
//! a power-of-two sized block whose size class (radix) is packed into the
//! low six bits of `data_off`. Blocksets of four blockrefs live in the volume
//! header and in every inode that does not embed its data directly.

use bfs_types::{
    FileType, ParseError, ensure_slice, read_fixed, read_le_u16, read_le_u32, read_le_u64,
    read_u8,
};
use serde::{Deserialize, Serialize};

/// Block unit for all cache fetches on a HAMMER2 volume.
pub const HAMMER2_PBUFSIZE: u32 = 65_536;
/// Host-byte-order volume magic.
pub const HAMMER2_VOLUME_ID_HBO: u64 = 0x4841_4d32_0517_2011;
/// Byte-swapped magic written by a foreign-endian host.
pub const HAMMER2_VOLUME_ID_ABO: u64 = HAMMER2_VOLUME_ID_HBO.swap_bytes();
/// Redundant volume header copies, one per zone.
pub const HAMMER2_NUM_VOLHDRS: usize = 4;
/// Distance between two volume header copies.
pub const HAMMER2_ZONE_BYTES64: u64 = 2 * 1024 * 1024 * 1024;
/// Bytes of the volume header that are decoded.
pub const HAMMER2_VOLUME_HEADER_SIZE: usize = 0x400;
const HAMMER2_SROOT_BLOCKSET_OFFSET: usize = 0x200;

pub const HAMMER2_BLOCKREF_BYTES: usize = 128;
pub const HAMMER2_SET_COUNT: usize = 4;
pub const HAMMER2_INODE_BYTES: usize = 1024;
pub const HAMMER2_INODE_RADIX: u8 = 10;
pub const HAMMER2_EMBEDDED_BYTES: usize = 512;
const HAMMER2_INODE_FILENAME_OFFSET: usize = 256;
const HAMMER2_INODE_NAME_MAX: usize = 256;
const HAMMER2_INODE_U_OFFSET: usize = 512;

pub const HAMMER2_OFF_MASK_RADIX: u64 = 0x3F;
pub const HAMMER2_RADIX_MAX: u8 = 16;

pub const HAMMER2_COMP_NONE: u8 = 0;
pub const HAMMER2_COMP_AUTOZERO: u8 = 1;

/// `op_flags` bit: file content is embedded in the inode.
pub const HAMMER2_OPFLAG_DIRECTDATA: u8 = 0x01;

pub const HAMMER2_OBJTYPE_UNKNOWN: u8 = 0;
pub const HAMMER2_OBJTYPE_DIRECTORY: u8 = 1;
pub const HAMMER2_OBJTYPE_REGFILE: u8 = 2;
pub const HAMMER2_OBJTYPE_FIFO: u8 = 4;
pub const HAMMER2_OBJTYPE_CDEV: u8 = 5;
pub const HAMMER2_OBJTYPE_BDEV: u8 = 6;
pub const HAMMER2_OBJTYPE_SOFTLINK: u8 = 7;
pub const HAMMER2_OBJTYPE_HARDLINK: u8 = 8;
pub const HAMMER2_OBJTYPE_SOCKET: u8 = 9;
pub const HAMMER2_OBJTYPE_WHITEOUT: u8 = 10;

/// Keys below this value are never produced by [`dirhash`].
pub const HAMMER2_DIRHASH_VISIBLE: u64 = 0x8000_0000_0000_0000;
/// Low bits of a dirhash free for collision resolution.
pub const HAMMER2_DIRHASH_LOMASK: u64 = 0x0000_0000_0000_7FFF;

// ── Blockrefs ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockrefType {
    Empty,
    Inode,
    Indirect,
    Data,
    Dirent,
    FreemapNode,
    FreemapLeaf,
    Freemap,
    Volume,
}

impl BlockrefType {
    #[must_use]
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Empty),
            1 => Some(Self::Inode),
            2 => Some(Self::Indirect),
            3 => Some(Self::Data),
            4 => Some(Self::Dirent),
            5 => Some(Self::FreemapNode),
            6 => Some(Self::FreemapLeaf),
            254 => Some(Self::Freemap),
            255 => Some(Self::Volume),
            _ => None,
        }
    }

    #[must_use]
    pub fn to_raw(self) -> u8 {
        match self {
            Self::Empty => 0,
            Self::Inode => 1,
            Self::Indirect => 2,
            Self::Data => 3,
            Self::Dirent => 4,
            Self::FreemapNode => 5,
            Self::FreemapLeaf => 6,
            Self::Freemap => 254,
            Self::Volume => 255,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blockref {
    /// Raw type byte; see [`Blockref::kind`].
    pub btype: u8,
    pub methods: u8,
    pub copyid: u8,
    pub keybits: u8,
    pub vradix: u8,
    pub flags: u8,
    pub leaf_count: u16,
    pub key: u64,
    pub mirror_tid: u64,
    pub modify_tid: u64,
    pub data_off: u64,
    pub update_tid: u64,
    pub embed: [u8; 16],
}

impl Blockref {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(data, 0, HAMMER2_BLOCKREF_BYTES)?;
        let keybits = read_u8(data, 3)?;
        if keybits > 64 {
            return Err(ParseError::InvalidField {
                field: "keybits",
                reason: "exceeds key width",
            });
        }
        let data_off = read_le_u64(data, 32)?;
        let radix = (data_off & HAMMER2_OFF_MASK_RADIX) as u8;
        if radix > HAMMER2_RADIX_MAX {
            return Err(ParseError::InvalidField {
                field: "data_off",
                reason: "radix exceeds the largest block size",
            });
        }
        Ok(Self {
            btype: data[0],
            methods: data[1],
            copyid: data[2],
            keybits,
            vradix: data[4],
            flags: data[5],
            leaf_count: read_le_u16(data, 6)?,
            key: read_le_u64(data, 8)?,
            mirror_tid: read_le_u64(data, 16)?,
            modify_tid: read_le_u64(data, 24)?,
            data_off,
            update_tid: read_le_u64(data, 40)?,
            embed: read_fixed::<16>(data, 48)?,
        })
    }

    /// Decode a packed array of blockrefs (a blockset or indirect block).
    pub fn parse_array(data: &[u8]) -> Result<Vec<Self>, ParseError> {
        if data.len() % HAMMER2_BLOCKREF_BYTES != 0 {
            return Err(ParseError::InvalidField {
                field: "blockref_array",
                reason: "length is not a multiple of the blockref size",
            });
        }
        data.chunks_exact(HAMMER2_BLOCKREF_BYTES)
            .map(Self::parse)
            .collect()
    }

    #[must_use]
    pub fn kind(&self) -> Option<BlockrefType> {
        BlockrefType::from_raw(self.btype)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.btype == BlockrefType::Empty.to_raw()
    }

    /// Last key covered by this blockref.
    #[must_use]
    pub fn key_end(&self) -> u64 {
        if self.keybits >= 64 {
            u64::MAX
        } else {
            self.key.saturating_add((1_u64 << self.keybits) - 1)
        }
    }

    /// Whether the covered key range intersects `[beg, end]`.
    #[must_use]
    pub fn intersects(&self, beg: u64, end: u64) -> bool {
        self.key <= end && self.key_end() >= beg
    }

    /// Compression method from the high nibble of `methods`.
    #[must_use]
    pub fn comp_method(&self) -> u8 {
        self.methods >> 4
    }

    #[must_use]
    pub fn radix(&self) -> u8 {
        (self.data_off & HAMMER2_OFF_MASK_RADIX) as u8
    }

    /// Size of the referenced block, zero when nothing is referenced.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        match self.radix() {
            0 => 0,
            radix => 1_u64 << radix,
        }
    }

    /// Device byte offset of the referenced block.
    #[must_use]
    pub fn physical(&self) -> u64 {
        self.data_off & !HAMMER2_OFF_MASK_RADIX
    }
}

// ── Volume header ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hammer2VolumeHeader {
    pub magic: u64,
    pub boot_beg: u64,
    pub boot_end: u64,
    pub aux_beg: u64,
    pub aux_end: u64,
    pub volu_size: u64,
    pub version: u32,
    pub flags: u32,
    pub fsid: [u8; 16],
    pub fstype: [u8; 16],
    /// Highest transaction id flushed to this copy.
    pub mirror_tid: u64,
    pub sroot_blockset: [Blockref; HAMMER2_SET_COUNT],
}

impl Hammer2VolumeHeader {
    pub fn parse_from_region(region: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u64(region, 0x00)?;
        if magic != HAMMER2_VOLUME_ID_HBO {
            return Err(ParseError::InvalidMagic {
                expected: HAMMER2_VOLUME_ID_HBO,
                actual: magic,
            });
        }
        ensure_slice(region, 0, HAMMER2_VOLUME_HEADER_SIZE)?;

        Ok(Self {
            magic,
            boot_beg: read_le_u64(region, 0x08)?,
            boot_end: read_le_u64(region, 0x10)?,
            aux_beg: read_le_u64(region, 0x18)?,
            aux_end: read_le_u64(region, 0x20)?,
            volu_size: read_le_u64(region, 0x28)?,
            version: read_le_u32(region, 0x30)?,
            flags: read_le_u32(region, 0x34)?,
            fsid: read_fixed::<16>(region, 0x40)?,
            fstype: read_fixed::<16>(region, 0x50)?,
            mirror_tid: read_le_u64(region, 0x78)?,
            sroot_blockset: parse_blockset(region, HAMMER2_SROOT_BLOCKSET_OFFSET)?,
        })
    }
}

/// Device offset of volume header copy `index`.
#[must_use]
pub fn volume_header_offset(index: usize) -> u64 {
    index as u64 * HAMMER2_ZONE_BYTES64
}

fn parse_blockset(data: &[u8], at: usize) -> Result<[Blockref; HAMMER2_SET_COUNT], ParseError> {
    let bytes = ensure_slice(data, at, HAMMER2_SET_COUNT * HAMMER2_BLOCKREF_BYTES)?;
    let mut set = [Blockref::parse(bytes)?; HAMMER2_SET_COUNT];
    for (idx, slot) in set.iter_mut().enumerate().skip(1) {
        *slot = Blockref::parse(&bytes[idx * HAMMER2_BLOCKREF_BYTES..])?;
    }
    Ok(set)
}

// ── Inodes ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InodeBody {
    /// Four blockrefs covering the inode's children or file data.
    Blockset([Blockref; HAMMER2_SET_COUNT]),
    /// File content stored in the inode itself.
    Direct(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hammer2Inode {
    pub version: u16,
    pub uflags: u32,
    pub rmajor: u32,
    pub rminor: u32,
    pub ctime: u64,
    pub mtime: u64,
    pub atime: u64,
    pub btime: u64,
    pub uid: [u8; 16],
    pub gid: [u8; 16],
    pub obj_type: u8,
    pub op_flags: u8,
    pub cap_flags: u8,
    pub mode: u32,
    pub inum: u64,
    pub size: u64,
    pub nlinks: u64,
    pub iparent: u64,
    pub name_key: u64,
    pub filename: Vec<u8>,
    pub body: InodeBody,
}

impl Hammer2Inode {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(data, 0, HAMMER2_INODE_BYTES)?;

        let name_len = usize::from(read_le_u16(data, 0x80)?);
        if name_len > HAMMER2_INODE_NAME_MAX {
            return Err(ParseError::InvalidField {
                field: "name_len",
                reason: "longer than the filename field",
            });
        }
        let filename = data[HAMMER2_INODE_FILENAME_OFFSET..HAMMER2_INODE_FILENAME_OFFSET + name_len]
            .to_vec();

        let op_flags = data[0x51];
        let body = if op_flags & HAMMER2_OPFLAG_DIRECTDATA != 0 {
            InodeBody::Direct(
                data[HAMMER2_INODE_U_OFFSET..HAMMER2_INODE_U_OFFSET + HAMMER2_EMBEDDED_BYTES]
                    .to_vec(),
            )
        } else {
            InodeBody::Blockset(parse_blockset(data, HAMMER2_INODE_U_OFFSET)?)
        };

        Ok(Self {
            version: read_le_u16(data, 0x00)?,
            uflags: read_le_u32(data, 0x04)?,
            rmajor: read_le_u32(data, 0x08)?,
            rminor: read_le_u32(data, 0x0C)?,
            ctime: read_le_u64(data, 0x10)?,
            mtime: read_le_u64(data, 0x18)?,
            atime: read_le_u64(data, 0x20)?,
            btime: read_le_u64(data, 0x28)?,
            uid: read_fixed::<16>(data, 0x30)?,
            gid: read_fixed::<16>(data, 0x40)?,
            obj_type: data[0x50],
            op_flags,
            cap_flags: data[0x52],
            mode: read_le_u32(data, 0x54)?,
            inum: read_le_u64(data, 0x58)?,
            size: read_le_u64(data, 0x60)?,
            nlinks: read_le_u64(data, 0x68)?,
            iparent: read_le_u64(data, 0x70)?,
            name_key: read_le_u64(data, 0x78)?,
            filename,
            body,
        })
    }

    #[must_use]
    pub fn is_direct_data(&self) -> bool {
        matches!(self.body, InodeBody::Direct(_))
    }
}

#[must_use]
pub fn file_type(obj_type: u8) -> FileType {
    match obj_type {
        HAMMER2_OBJTYPE_DIRECTORY => FileType::Directory,
        HAMMER2_OBJTYPE_REGFILE => FileType::RegularFile,
        HAMMER2_OBJTYPE_FIFO => FileType::Fifo,
        HAMMER2_OBJTYPE_CDEV => FileType::CharDevice,
        HAMMER2_OBJTYPE_BDEV => FileType::BlockDevice,
        HAMMER2_OBJTYPE_SOFTLINK => FileType::Symlink,
        HAMMER2_OBJTYPE_SOCKET => FileType::Socket,
        _ => FileType::Unknown,
    }
}

// ── Directory hash ──────────────────────────────────────────────────────────

/// Directory-entry key of `name`.
///
/// The high 32 bits are the sum of the CRC32C of every segment delimited by
/// `.`, `-`, `_` or `~`, with bit 63 forced on. Bits 16..32 fold the CRC32C of
/// the whole name. Bit 15 is always set so the values `0..0x8000` stay free
/// for the synthetic `.` and `..` entries.
#[must_use]
pub fn dirhash(name: &[u8]) -> u64 {
    let mut segments: u32 = 0;
    for segment in name.split(|b| matches!(b, b'.' | b'-' | b'_' | b'~')) {
        if !segment.is_empty() {
            segments = segments.wrapping_add(crc32c::crc32c(segment));
        }
    }
    let mut key = (u64::from(segments) << 32) | HAMMER2_DIRHASH_VISIBLE;

    let whole = crc32c::crc32c(name);
    let folded = whole ^ (whole << 16);
    key |= u64::from(folded & 0xFFFF_0000);
    key | 0x8000
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_blockref(btype: u8, keybits: u8, key: u64, data_off: u64) -> [u8; HAMMER2_BLOCKREF_BYTES] {
        let mut raw = [0_u8; HAMMER2_BLOCKREF_BYTES];
        raw[0] = btype;
        raw[3] = keybits;
        raw[8..16].copy_from_slice(&key.to_le_bytes());
        raw[32..40].copy_from_slice(&data_off.to_le_bytes());
        raw
    }

    #[test]
    fn blockref_geometry() {
        let raw = raw_blockref(3, 12, 0x2000, 0x0003_0000 | 12);
        let bref = Blockref::parse(&raw).expect("blockref");
        assert_eq!(bref.kind(), Some(BlockrefType::Data));
        assert_eq!(bref.key_end(), 0x2FFF);
        assert_eq!(bref.radix(), 12);
        assert_eq!(bref.bytes(), 4096);
        assert_eq!(bref.physical(), 0x0003_0000);
        assert!(bref.intersects(0x2FFF, u64::MAX));
        assert!(!bref.intersects(0x3000, u64::MAX));
        assert!(!bref.is_empty());

        let full = Blockref::parse(&raw_blockref(2, 64, 0, 0)).expect("root-wide");
        assert_eq!(full.key_end(), u64::MAX);
        assert_eq!(full.bytes(), 0);
    }

    #[test]
    fn blockref_rejects_bad_radix_and_keybits() {
        assert!(matches!(
            Blockref::parse(&raw_blockref(3, 12, 0, 0x4000 | 20)),
            Err(ParseError::InvalidField {
                field: "data_off",
                ..
            })
        ));
        assert!(matches!(
            Blockref::parse(&raw_blockref(2, 65, 0, 0)),
            Err(ParseError::InvalidField {
                field: "keybits",
                ..
            })
        ));
        assert!(Blockref::parse_array(&[0_u8; 100]).is_err());
    }

    #[test]
    fn parse_volume_header_smoke() {
        let mut hdr = vec![0_u8; HAMMER2_VOLUME_HEADER_SIZE];
        hdr[0..8].copy_from_slice(&HAMMER2_VOLUME_ID_HBO.to_le_bytes());
        hdr[0x78..0x80].copy_from_slice(&9_u64.to_le_bytes());
        let sroot = raw_blockref(1, 64, 0, 0x0001_0000 | 10);
        hdr[0x200..0x280].copy_from_slice(&sroot);

        let parsed = Hammer2VolumeHeader::parse_from_region(&hdr).expect("volume header");
        assert_eq!(parsed.mirror_tid, 9);
        assert_eq!(parsed.sroot_blockset[0].kind(), Some(BlockrefType::Inode));
        assert!(parsed.sroot_blockset[1].is_empty());

        hdr[0..8].copy_from_slice(&HAMMER2_VOLUME_ID_ABO.to_le_bytes());
        assert!(matches!(
            Hammer2VolumeHeader::parse_from_region(&hdr),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn parse_direct_data_inode() {
        let mut raw = vec![0_u8; HAMMER2_INODE_BYTES];
        raw[0x50] = HAMMER2_OBJTYPE_REGFILE;
        raw[0x51] = HAMMER2_OPFLAG_DIRECTDATA;
        raw[0x54..0x58].copy_from_slice(&0o644_u32.to_le_bytes());
        raw[0x60..0x68].copy_from_slice(&5_u64.to_le_bytes());
        raw[0x80..0x82].copy_from_slice(&9_u16.to_le_bytes());
        raw[256..265].copy_from_slice(b"hello.txt");
        raw[512..517].copy_from_slice(b"hello");

        let inode = Hammer2Inode::parse(&raw).expect("inode");
        assert_eq!(inode.filename, b"hello.txt");
        assert_eq!(inode.size, 5);
        assert!(inode.is_direct_data());
        assert_eq!(file_type(inode.obj_type), FileType::RegularFile);
        match &inode.body {
            InodeBody::Direct(bytes) => assert_eq!(&bytes[..5], b"hello"),
            InodeBody::Blockset(_) => panic!("expected direct data"),
        }

        raw[0x80..0x82].copy_from_slice(&300_u16.to_le_bytes());
        assert!(Hammer2Inode::parse(&raw).is_err());
    }

    #[test]
    fn dirhash_layout() {
        for name in [&b"kernel"[..], b"loader.conf", b"a-b_c~d", b"."] {
            let h = dirhash(name);
            assert!(h >= HAMMER2_DIRHASH_VISIBLE, "{name:?}");
            assert_eq!(h & HAMMER2_DIRHASH_LOMASK, 0, "{name:?}");
            assert_eq!(h & 0x8000, 0x8000);
        }
        // Segment sums are order-independent.
        assert_eq!(dirhash(b"boot.kernel") >> 32, dirhash(b"kernel.boot") >> 32);
        assert_eq!(dirhash(b"kernel") >> 32, dirhash(b"_kernel~") >> 32);
    }

    #[test]
    fn hardlink_and_whiteout_are_unknown() {
        assert_eq!(file_type(HAMMER2_OBJTYPE_HARDLINK), FileType::Unknown);
        assert_eq!(file_type(HAMMER2_OBJTYPE_WHITEOUT), FileType::Unknown);
        assert_eq!(file_type(HAMMER2_OBJTYPE_SOFTLINK), FileType::Symlink);
    }
}
