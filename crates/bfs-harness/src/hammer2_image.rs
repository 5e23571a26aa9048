#![forbid(unsafe_code)]
//! In-memory HAMMER2 volume builder.
//!
//! Volume header copy 0 occupies the first 64 KiB; every other block is
//! allocated after it, aligned to its own size so no block crosses a 64 KiB
//! cache unit. Blocksets that overflow are split into INDIRECT blocks along
//! power-of-two key boundaries, the same way the kernel lays them out.

use anyhow::{Result, bail};
use bfs_ondisk::hammer2::{
    BlockrefType, HAMMER2_BLOCKREF_BYTES, HAMMER2_EMBEDDED_BYTES, HAMMER2_INODE_BYTES,
    HAMMER2_INODE_RADIX, HAMMER2_OBJTYPE_DIRECTORY, HAMMER2_OBJTYPE_REGFILE,
    HAMMER2_OPFLAG_DIRECTDATA, HAMMER2_PBUFSIZE, HAMMER2_SET_COUNT, HAMMER2_VOLUME_ID_HBO,
    dirhash,
};

const PBUF: usize = HAMMER2_PBUFSIZE as usize;
const DATA_RADIX_MIN: u8 = 10;
const DATA_RADIX_MAX: u8 = 16;
const MAX_INDIRECT_DEPTH: usize = 16;
const NAME_MAX: usize = 255;
/// Superroot inode number; every other inode is numbered after it.
const SUPERROOT_INUM: u64 = 1;
const EPOCH_MICROS: u64 = 1_700_000_000_000_000;

#[derive(Debug, Clone)]
enum Content {
    None,
    Direct(Vec<u8>),
    Extents(Vec<(u64, Vec<u8>)>),
}

#[derive(Debug, Clone)]
struct Node {
    inum: u64,
    parent: u64,
    name: Vec<u8>,
    name_key: u64,
    obj_type: u8,
    mode: u32,
    uid: u32,
    gid: u32,
    size: u64,
    children: Vec<u64>,
    content: Content,
}

/// Block reference under construction.
#[derive(Debug, Clone, Copy)]
struct Bref {
    btype: BlockrefType,
    key: u64,
    keybits: u8,
    data_off: u64,
}

impl Bref {
    fn key_end(&self) -> u64 {
        if self.keybits >= 64 {
            u64::MAX
        } else {
            self.key.saturating_add((1_u64 << self.keybits) - 1)
        }
    }

    fn encode(&self, mirror_tid: u64) -> [u8; HAMMER2_BLOCKREF_BYTES] {
        let mut raw = [0_u8; HAMMER2_BLOCKREF_BYTES];
        raw[0] = self.btype.to_raw();
        raw[3] = self.keybits;
        raw[8..16].copy_from_slice(&self.key.to_le_bytes());
        raw[16..24].copy_from_slice(&mirror_tid.to_le_bytes());
        raw[24..32].copy_from_slice(&mirror_tid.to_le_bytes());
        raw[32..40].copy_from_slice(&self.data_off.to_le_bytes());
        raw[40..48].copy_from_slice(&mirror_tid.to_le_bytes());
        raw
    }
}

fn shr(value: u64, bits: u8) -> u64 {
    value.checked_shr(u32::from(bits)).unwrap_or(0)
}

/// Smallest block radix holding `len` bytes.
fn radix_for(len: usize) -> u8 {
    let mut radix = DATA_RADIX_MIN;
    while (1_usize << radix) < len {
        radix += 1;
    }
    radix
}

/// Builder for a single-volume HAMMER2 image.
///
/// Object handles are inode numbers. The superroot is the root directory;
/// [`Hammer2ImageBuilder::add_pfs`] adds PFS roots beneath it.
#[derive(Debug, Clone)]
pub struct Hammer2ImageBuilder {
    nodes: Vec<Node>,
    blockset_slots: usize,
    indirect_slots: usize,
    mirror_tid: u64,
}

impl Default for Hammer2ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Hammer2ImageBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                inum: SUPERROOT_INUM,
                parent: 0,
                name: Vec::new(),
                name_key: 0,
                obj_type: HAMMER2_OBJTYPE_DIRECTORY,
                mode: 0o755,
                uid: 0,
                gid: 0,
                size: 0,
                children: Vec::new(),
                content: Content::None,
            }],
            blockset_slots: HAMMER2_SET_COUNT,
            indirect_slots: PBUF / HAMMER2_BLOCKREF_BYTES,
            mirror_tid: 1,
        }
    }

    /// Limit used slots per inode blockset and per indirect block.
    #[must_use]
    pub fn with_fanout(mut self, blockset_slots: usize, indirect_slots: usize) -> Self {
        self.blockset_slots = blockset_slots.clamp(1, HAMMER2_SET_COUNT);
        self.indirect_slots = indirect_slots.clamp(2, PBUF / HAMMER2_BLOCKREF_BYTES);
        self
    }

    #[must_use]
    pub fn with_mirror_tid(mut self, mirror_tid: u64) -> Self {
        self.mirror_tid = mirror_tid;
        self
    }

    #[must_use]
    pub fn root(&self) -> u64 {
        SUPERROOT_INUM
    }

    fn node(&self, inum: u64) -> Option<&Node> {
        usize::try_from(inum.checked_sub(1)?)
            .ok()
            .and_then(|idx| self.nodes.get(idx))
    }

    fn node_mut(&mut self, inum: u64) -> Option<&mut Node> {
        usize::try_from(inum.checked_sub(1)?)
            .ok()
            .and_then(|idx| self.nodes.get_mut(idx))
    }

    pub fn mkdir(&mut self, parent: u64, name: &str) -> Result<u64> {
        self.create(parent, name, HAMMER2_OBJTYPE_DIRECTORY, 0, Content::None, None)
    }

    /// PFS root directory directly under the superroot.
    pub fn add_pfs(&mut self, name: &str) -> Result<u64> {
        self.mkdir(SUPERROOT_INUM, name)
    }

    /// Regular file; up to 512 bytes are embedded in the inode.
    pub fn add_file(&mut self, parent: u64, name: &str, content: &[u8]) -> Result<u64> {
        self.add_file_keyed(parent, name, content, None)
    }

    /// Regular file stored under directory key `key` instead of its dirhash.
    ///
    /// Lets tests place entries in another name's collision range.
    pub fn add_file_with_key(
        &mut self,
        parent: u64,
        name: &str,
        content: &[u8],
        key: u64,
    ) -> Result<u64> {
        self.add_file_keyed(parent, name, content, Some(key))
    }

    fn add_file_keyed(
        &mut self,
        parent: u64,
        name: &str,
        content: &[u8],
        key: Option<u64>,
    ) -> Result<u64> {
        let body = if content.len() <= HAMMER2_EMBEDDED_BYTES {
            Content::Direct(content.to_vec())
        } else {
            Content::Extents(
                content
                    .chunks(PBUF)
                    .enumerate()
                    .map(|(i, chunk)| ((i * PBUF) as u64, chunk.to_vec()))
                    .collect(),
            )
        };
        self.create(
            parent,
            name,
            HAMMER2_OBJTYPE_REGFILE,
            content.len() as u64,
            body,
            key,
        )
    }

    /// Regular file of `size` bytes backed only by `(key, bytes)` extents.
    ///
    /// Each extent becomes one DATA block keyed at `key` whose key range is
    /// its padded block size. Ranges may not overlap.
    pub fn add_sparse_file(
        &mut self,
        parent: u64,
        name: &str,
        size: u64,
        extents: &[(u64, Vec<u8>)],
    ) -> Result<u64> {
        let mut sorted: Vec<(u64, Vec<u8>)> = Vec::new();
        for (key, bytes) in extents {
            for (i, chunk) in bytes.chunks(PBUF).enumerate() {
                sorted.push((key + (i * PBUF) as u64, chunk.to_vec()));
            }
        }
        sorted.sort_by_key(|(key, _)| *key);
        for pair in sorted.windows(2) {
            let span = 1_u64 << radix_for(pair[0].1.len());
            if pair[0].0.saturating_add(span) > pair[1].0 {
                bail!("extent at {} overlaps extent at {}", pair[0].0, pair[1].0);
            }
        }
        self.create(
            parent,
            name,
            HAMMER2_OBJTYPE_REGFILE,
            size,
            Content::Extents(sorted),
            None,
        )
    }

    /// Data-less object such as a device node, fifo or socket.
    pub fn add_special(&mut self, parent: u64, name: &str, obj_type: u8) -> Result<u64> {
        self.create(parent, name, obj_type, 0, Content::None, None)
    }

    pub fn set_owner(&mut self, inum: u64, uid: u32, gid: u32) {
        if let Some(node) = self.node_mut(inum) {
            node.uid = uid;
            node.gid = gid;
        }
    }

    pub fn set_mode(&mut self, inum: u64, mode: u32) {
        if let Some(node) = self.node_mut(inum) {
            node.mode = mode;
        }
    }

    fn create(
        &mut self,
        parent: u64,
        name: &str,
        obj_type: u8,
        size: u64,
        content: Content,
        key: Option<u64>,
    ) -> Result<u64> {
        let Some(dir) = self.node(parent) else {
            bail!("unknown directory {parent}");
        };
        if dir.obj_type != HAMMER2_OBJTYPE_DIRECTORY {
            bail!("{parent} is not a directory");
        }
        if name.is_empty() || name.len() > NAME_MAX || name.contains('/') || name == "." || name == ".."
        {
            bail!("invalid entry name {name:?}");
        }
        let siblings: Vec<&Node> = dir.children.iter().filter_map(|c| self.node(*c)).collect();
        if siblings.iter().any(|s| s.name == name.as_bytes()) {
            bail!("{name:?} already exists in {parent}");
        }
        let name_key = match key {
            Some(key) if key < 2 => bail!("directory key {key} is reserved for . and .."),
            Some(key) if siblings.iter().any(|s| s.name_key == key) => {
                bail!("directory key {key:#x} already used in {parent}")
            }
            Some(key) => key,
            None => {
                let mut name_key = dirhash(name.as_bytes());
                while siblings.iter().any(|s| s.name_key == name_key) {
                    name_key += 1;
                }
                name_key
            }
        };

        let inum = self.nodes.len() as u64 + 1;
        let is_dir = obj_type == HAMMER2_OBJTYPE_DIRECTORY;
        self.nodes.push(Node {
            inum,
            parent,
            name: name.as_bytes().to_vec(),
            name_key,
            obj_type,
            mode: if is_dir { 0o755 } else { 0o644 },
            uid: 0,
            gid: 0,
            size,
            children: Vec::new(),
            content,
        });
        if let Some(dir) = self.node_mut(parent) {
            dir.children.push(inum);
        }
        Ok(inum)
    }

    /// Serialize the volume.
    pub fn build(&self) -> Result<Vec<u8>> {
        let mut out = Writer {
            image: vec![0_u8; PBUF],
            mirror_tid: self.mirror_tid,
            indirect_slots: self.indirect_slots,
        };
        let superroot = self.write_inode(&mut out, SUPERROOT_INUM)?;
        out.image.resize(out.image.len().next_multiple_of(PBUF), 0);

        let volu_size = out.image.len() as u64;
        let hdr = &mut out.image[..PBUF];
        hdr[0x00..0x08].copy_from_slice(&HAMMER2_VOLUME_ID_HBO.to_le_bytes());
        hdr[0x28..0x30].copy_from_slice(&volu_size.to_le_bytes());
        hdr[0x30..0x34].copy_from_slice(&1_u32.to_le_bytes());
        hdr[0x40..0x50].copy_from_slice(&[0x42; 16]);
        hdr[0x78..0x80].copy_from_slice(&self.mirror_tid.to_le_bytes());
        hdr[0x200..0x200 + HAMMER2_BLOCKREF_BYTES].copy_from_slice(&superroot.encode(self.mirror_tid));
        Ok(out.image)
    }

    fn write_inode(&self, out: &mut Writer, inum: u64) -> Result<Bref> {
        let Some(node) = self.node(inum) else {
            bail!("dangling inode {inum}");
        };

        let mut raw = vec![0_u8; HAMMER2_INODE_BYTES];
        match &node.content {
            Content::Direct(bytes) => {
                raw[0x51] = HAMMER2_OPFLAG_DIRECTDATA;
                raw[512..512 + bytes.len()].copy_from_slice(bytes);
            }
            Content::None | Content::Extents(_) => {
                let mut brefs = Vec::new();
                for child in &node.children {
                    brefs.push(self.write_inode(out, *child)?);
                }
                if let Content::Extents(extents) = &node.content {
                    for (key, bytes) in extents {
                        let radix = radix_for(bytes.len()).min(DATA_RADIX_MAX);
                        let phys = out.alloc(bytes, radix);
                        brefs.push(Bref {
                            btype: BlockrefType::Data,
                            key: *key,
                            keybits: radix,
                            data_off: phys | u64::from(radix),
                        });
                    }
                }
                brefs.sort_by_key(|b| b.key);
                let set = out.pack(brefs, self.blockset_slots, 0)?;
                for (slot, bref) in set.iter().enumerate() {
                    let at = 512 + slot * HAMMER2_BLOCKREF_BYTES;
                    raw[at..at + HAMMER2_BLOCKREF_BYTES].copy_from_slice(&bref.encode(out.mirror_tid));
                }
            }
        }

        let stamp = EPOCH_MICROS + inum * 1_000_000;
        raw[0x00..0x02].copy_from_slice(&1_u16.to_le_bytes());
        for at in [0x10, 0x18, 0x20, 0x28] {
            raw[at..at + 8].copy_from_slice(&stamp.to_le_bytes());
        }
        raw[0x3C..0x40].copy_from_slice(&node.uid.to_le_bytes());
        raw[0x4C..0x50].copy_from_slice(&node.gid.to_le_bytes());
        raw[0x50] = node.obj_type;
        raw[0x54..0x58].copy_from_slice(&node.mode.to_le_bytes());
        raw[0x58..0x60].copy_from_slice(&node.inum.to_le_bytes());
        raw[0x60..0x68].copy_from_slice(&node.size.to_le_bytes());
        let nlinks: u64 = if node.obj_type == HAMMER2_OBJTYPE_DIRECTORY { 2 } else { 1 };
        raw[0x68..0x70].copy_from_slice(&nlinks.to_le_bytes());
        raw[0x70..0x78].copy_from_slice(&node.parent.to_le_bytes());
        raw[0x78..0x80].copy_from_slice(&node.name_key.to_le_bytes());
        raw[0x80..0x82].copy_from_slice(&(node.name.len() as u16).to_le_bytes());
        raw[256..256 + node.name.len()].copy_from_slice(&node.name);

        let phys = out.alloc(&raw, HAMMER2_INODE_RADIX);
        Ok(Bref {
            btype: BlockrefType::Inode,
            key: node.name_key,
            keybits: 0,
            data_off: phys | u64::from(HAMMER2_INODE_RADIX),
        })
    }
}

struct Writer {
    image: Vec<u8>,
    mirror_tid: u64,
    indirect_slots: usize,
}

impl Writer {
    /// Place `bytes` in a zeroed block of `2^radix` bytes aligned to its size.
    fn alloc(&mut self, bytes: &[u8], radix: u8) -> u64 {
        let size = 1_usize << radix;
        let at = self.image.len().next_multiple_of(size);
        self.image.resize(at + size, 0);
        self.image[at..at + bytes.len()].copy_from_slice(bytes);
        at as u64
    }

    /// Fit `brefs` (sorted by key) into `capacity` slots.
    ///
    /// Picks the smallest key-bit split whose aligned ranges separate the
    /// entries into at most `capacity` groups; every group of more than one
    /// entry moves into an INDIRECT block covering that aligned range.
    fn pack(&mut self, brefs: Vec<Bref>, capacity: usize, depth: usize) -> Result<Vec<Bref>> {
        if brefs.len() <= capacity {
            return Ok(brefs);
        }
        if depth >= MAX_INDIRECT_DEPTH {
            bail!("cannot split {} blockrefs below depth {depth}", brefs.len());
        }

        let mut chosen = None;
        for keybits in 0..=64_u8 {
            let fits = brefs
                .iter()
                .all(|b| shr(b.key, keybits) == shr(b.key_end(), keybits));
            if !fits {
                continue;
            }
            let mut groups: Vec<Vec<Bref>> = Vec::new();
            for bref in &brefs {
                match groups.last_mut() {
                    Some(group) if shr(group[0].key, keybits) == shr(bref.key, keybits) => {
                        group.push(*bref);
                    }
                    _ => groups.push(vec![*bref]),
                }
            }
            if groups.len() <= capacity {
                chosen = Some((keybits, groups));
                break;
            }
        }
        let Some((keybits, groups)) = chosen else {
            bail!("no key split fits {} blockrefs in {capacity} slots", brefs.len());
        };

        let mut set = Vec::with_capacity(groups.len());
        for group in groups {
            if group.len() == 1 {
                set.extend(group);
                continue;
            }
            let base = if keybits >= 64 {
                0
            } else {
                shr(group[0].key, keybits) << keybits
            };
            let children = self.pack(group, self.indirect_slots, depth + 1)?;
            let mut block = Vec::with_capacity(children.len() * HAMMER2_BLOCKREF_BYTES);
            for child in &children {
                block.extend_from_slice(&child.encode(self.mirror_tid));
            }
            let radix = radix_for(self.indirect_slots * HAMMER2_BLOCKREF_BYTES);
            let phys = self.alloc(&block, radix);
            set.push(Bref {
                btype: BlockrefType::Indirect,
                key: base,
                keybits,
                data_off: phys | u64::from(radix),
            });
        }
        Ok(set)
    }
}

/// Copy of the volume header of `image` stamped with another `mirror_tid`.
///
/// Written at a header slot offset it forms a redundant header copy.
#[must_use]
pub fn hammer2_header_copy(image: &[u8], mirror_tid: u64) -> Vec<u8> {
    let mut copy = image[..PBUF.min(image.len())].to_vec();
    copy.resize(PBUF, 0);
    copy[0x78..0x80].copy_from_slice(&mirror_tid.to_le_bytes());
    copy
}
