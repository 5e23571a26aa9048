#![forbid(unsafe_code)]
//! In-memory HAMMER volume builder.
//!
//! Layout: the volume header fills the first 16 KiB buffer, record data
//! follows from `vol_buf_beg`, and the B-tree nodes are packed after the data.
//! Small records never cross a 16 KiB buffer; file extents may.

use anyhow::{Result, bail};
use bfs_ondisk::hammer::{
    BtreeKey, HAMMER_BTREE_ELM_SIZE, HAMMER_BTREE_INT_ELMS, HAMMER_BTREE_LEAF_ELMS,
    HAMMER_BTREE_NODE_SIZE, HAMMER_BTREE_TYPE_INTERNAL, HAMMER_BTREE_TYPE_LEAF,
    HAMMER_BTREE_TYPE_RECORD, HAMMER_BUFSIZE, HAMMER_ENTRY_NAME_OFFSET, HAMMER_FSBUF_VOLUME,
    HAMMER_INODE_CAP_DIR_LOCAL_INO, HAMMER_INODE_DATA_SIZE, HAMMER_LOCALIZE_INODE,
    HAMMER_LOCALIZE_MISC, HAMMER_OBJID_ROOT, HAMMER_OBJTYPE_DBFILE, HAMMER_OBJTYPE_DIRECTORY,
    HAMMER_OBJTYPE_REGFILE, HAMMER_RECTYPE_DATA, HAMMER_RECTYPE_DB, HAMMER_RECTYPE_DIRENTRY,
    HAMMER_RECTYPE_INODE, HAMMER_ZONE_BTREE, HAMMER_ZONE_LARGE_DATA, crc32_namekey, zone_offset,
};
use std::collections::BTreeMap;

const BUF: usize = HAMMER_BUFSIZE as usize;
const NAME_MAX: usize = 255;
/// Microsecond timestamp of transaction id zero.
const EPOCH_MICROS: u64 = 1_700_000_000_000_000;

const MIN_KEY: BtreeKey = BtreeKey {
    localization: 0,
    obj_id: i64::MIN,
    rec_type: 0,
    key: i64::MIN,
    create_tid: 0,
    delete_tid: 1,
};
const MAX_KEY: BtreeKey = BtreeKey {
    localization: u32::MAX,
    obj_id: i64::MAX,
    rec_type: u16::MAX,
    key: i64::MAX,
    create_tid: u64::MAX,
    delete_tid: 0,
};

#[derive(Debug, Clone)]
struct Object {
    obj_type: u8,
    cap_flags: u8,
    parent: i64,
    mode: u16,
    uid: u32,
    gid: u32,
    size: u64,
    nlinks: u64,
    create_tid: u64,
}

#[derive(Debug, Clone)]
struct Dirent {
    dir: i64,
    name: Vec<u8>,
    target: i64,
    key: i64,
    create_tid: u64,
    delete_tid: u64,
}

#[derive(Debug, Clone)]
struct DataRecord {
    obj: i64,
    rec_type: u16,
    start: u64,
    bytes: Vec<u8>,
    create_tid: u64,
}

struct LeafRecord {
    key: BtreeKey,
    obj_type: u8,
    data: Vec<u8>,
    /// File extents may cross a buffer boundary; metadata records may not.
    may_straddle: bool,
}

/// Builder for a single-volume HAMMER image.
///
/// Every mutation runs in its own transaction: the record gets the next
/// transaction id as its `create_tid`, and `unlink` stamps the next one as
/// the entry's `delete_tid`.
#[derive(Debug, Clone)]
pub struct HammerImageBuilder {
    objects: BTreeMap<i64, Object>,
    dirents: Vec<Dirent>,
    data: Vec<DataRecord>,
    next_obj_id: i64,
    tid: u64,
    leaf_fanout: usize,
    internal_fanout: usize,
    label: String,
}

impl Default for HammerImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HammerImageBuilder {
    #[must_use]
    pub fn new() -> Self {
        let mut objects = BTreeMap::new();
        objects.insert(
            HAMMER_OBJID_ROOT,
            Object {
                obj_type: HAMMER_OBJTYPE_DIRECTORY,
                cap_flags: 0,
                parent: 0,
                mode: 0o755,
                uid: 0,
                gid: 0,
                size: 0,
                nlinks: 2,
                create_tid: 1,
            },
        );
        Self {
            objects,
            dirents: Vec::new(),
            data: Vec::new(),
            next_obj_id: 0x100,
            tid: 1,
            leaf_fanout: HAMMER_BTREE_LEAF_ELMS,
            internal_fanout: HAMMER_BTREE_INT_ELMS,
            label: "HAMMER".to_owned(),
        }
    }

    /// Limit elements per leaf and per internal node to force deeper trees.
    #[must_use]
    pub fn with_fanout(mut self, leaf: usize, internal: usize) -> Self {
        self.leaf_fanout = leaf.clamp(1, HAMMER_BTREE_LEAF_ELMS);
        self.internal_fanout = internal.clamp(2, HAMMER_BTREE_INT_ELMS);
        self
    }

    #[must_use]
    pub fn with_label(mut self, label: &str) -> Self {
        self.label = label.to_owned();
        self
    }

    #[must_use]
    pub fn root(&self) -> i64 {
        HAMMER_OBJID_ROOT
    }

    /// Transaction id of the most recent mutation.
    #[must_use]
    pub fn current_tid(&self) -> u64 {
        self.tid
    }

    fn next_tid(&mut self) -> u64 {
        self.tid += 1;
        self.tid
    }

    pub fn mkdir(&mut self, parent: i64, name: &str) -> Result<i64> {
        self.create(parent, name, HAMMER_OBJTYPE_DIRECTORY, 0, 0)
    }

    /// Directory whose entries are stored in the inode localization.
    pub fn mkdir_local(&mut self, parent: i64, name: &str) -> Result<i64> {
        self.create(
            parent,
            name,
            HAMMER_OBJTYPE_DIRECTORY,
            HAMMER_INODE_CAP_DIR_LOCAL_INO,
            0,
        )
    }

    /// Regular file stored as 16 KiB extents.
    pub fn add_file(&mut self, parent: i64, name: &str, content: &[u8]) -> Result<i64> {
        let extents: Vec<(u64, Vec<u8>)> = content
            .chunks(BUF)
            .enumerate()
            .map(|(i, chunk)| ((i * BUF) as u64, chunk.to_vec()))
            .collect();
        self.add_object(
            parent,
            name,
            HAMMER_OBJTYPE_REGFILE,
            content.len() as u64,
            &extents,
        )
    }

    /// Regular file of `size` bytes holding only the given `(offset, bytes)`
    /// extents.
    pub fn add_sparse_file(
        &mut self,
        parent: i64,
        name: &str,
        size: u64,
        extents: &[(u64, Vec<u8>)],
    ) -> Result<i64> {
        self.add_object(parent, name, HAMMER_OBJTYPE_REGFILE, size, extents)
    }

    /// Object of any type with explicit data extents. DB files get `DB`
    /// records, everything else `DATA` records.
    pub fn add_object(
        &mut self,
        parent: i64,
        name: &str,
        obj_type: u8,
        size: u64,
        extents: &[(u64, Vec<u8>)],
    ) -> Result<i64> {
        let mut sorted = extents.to_vec();
        sorted.sort_by_key(|(start, _)| *start);
        for pair in sorted.windows(2) {
            if pair[0].0 + pair[0].1.len() as u64 > pair[1].0 {
                bail!("overlapping extents at {} and {}", pair[0].0, pair[1].0);
            }
        }

        let obj = self.create(parent, name, obj_type, 0, size)?;
        let rec_type = if obj_type == HAMMER_OBJTYPE_DBFILE {
            HAMMER_RECTYPE_DB
        } else {
            HAMMER_RECTYPE_DATA
        };
        let create_tid = self.tid;
        for (start, bytes) in sorted.into_iter().filter(|(_, b)| !b.is_empty()) {
            self.data.push(DataRecord {
                obj,
                rec_type,
                start,
                bytes,
                create_tid,
            });
        }
        Ok(obj)
    }

    /// Device node, fifo, socket or symlink without data.
    pub fn add_special(&mut self, parent: i64, name: &str, obj_type: u8) -> Result<i64> {
        self.create(parent, name, obj_type, 0, 0)
    }

    /// Add another name for `target` under an explicit directory key.
    pub fn link_with_key(&mut self, dir: i64, name: &str, target: i64, key: i64) -> Result<()> {
        self.check_new_name(dir, name)?;
        if !self.objects.contains_key(&target) {
            bail!("unknown link target {target}");
        }
        if self.dirents.iter().any(|d| d.dir == dir && d.key == key) {
            bail!("directory key {key:#x} already used in {dir}");
        }
        let create_tid = self.next_tid();
        self.dirents.push(Dirent {
            dir,
            name: name.as_bytes().to_vec(),
            target,
            key,
            create_tid,
            delete_tid: 0,
        });
        if let Some(obj) = self.objects.get_mut(&target) {
            obj.nlinks += 1;
        }
        Ok(())
    }

    /// Mark the live entry `name` in `dir` as deleted.
    pub fn unlink(&mut self, dir: i64, name: &str) -> Result<()> {
        let tid = self.tid + 1;
        let Some(entry) = self
            .dirents
            .iter_mut()
            .find(|d| d.dir == dir && d.delete_tid == 0 && d.name == name.as_bytes())
        else {
            bail!("no live entry {name:?} in {dir}");
        };
        entry.delete_tid = tid;
        self.tid = tid;
        Ok(())
    }

    pub fn set_owner(&mut self, obj: i64, uid: u32, gid: u32) {
        if let Some(o) = self.objects.get_mut(&obj) {
            o.uid = uid;
            o.gid = gid;
        }
    }

    pub fn set_mode(&mut self, obj: i64, mode: u16) {
        if let Some(o) = self.objects.get_mut(&obj) {
            o.mode = mode;
        }
    }

    fn check_new_name(&self, dir: i64, name: &str) -> Result<()> {
        match self.objects.get(&dir) {
            Some(o) if o.obj_type == HAMMER_OBJTYPE_DIRECTORY => {}
            Some(_) => bail!("{dir} is not a directory"),
            None => bail!("unknown directory {dir}"),
        }
        if name.is_empty() || name.len() > NAME_MAX || name.contains('/') {
            bail!("invalid entry name {name:?}");
        }
        if self
            .dirents
            .iter()
            .any(|d| d.dir == dir && d.delete_tid == 0 && d.name == name.as_bytes())
        {
            bail!("{name:?} already exists in {dir}");
        }
        Ok(())
    }

    /// Lowest free key in the name's CRC-32 bucket.
    fn free_key(&self, dir: i64, name: &str) -> Result<i64> {
        let base = crc32_namekey(name.as_bytes());
        (base..=base | 0xFFFF_FFFF)
            .find(|k| !self.dirents.iter().any(|d| d.dir == dir && d.key == *k))
            .ok_or_else(|| anyhow::anyhow!("directory hash bucket full for {name:?}"))
    }

    fn create(
        &mut self,
        parent: i64,
        name: &str,
        obj_type: u8,
        cap_flags: u8,
        size: u64,
    ) -> Result<i64> {
        self.check_new_name(parent, name)?;
        let key = self.free_key(parent, name)?;
        let obj = self.next_obj_id;
        self.next_obj_id += 1;
        let create_tid = self.next_tid();
        let is_dir = obj_type == HAMMER_OBJTYPE_DIRECTORY;
        self.objects.insert(
            obj,
            Object {
                obj_type,
                cap_flags,
                parent,
                mode: if is_dir { 0o755 } else { 0o644 },
                uid: 0,
                gid: 0,
                size,
                nlinks: if is_dir { 2 } else { 1 },
                create_tid,
            },
        );
        self.dirents.push(Dirent {
            dir: parent,
            name: name.as_bytes().to_vec(),
            target: obj,
            key,
            create_tid,
            delete_tid: 0,
        });
        Ok(obj)
    }

    // ── Serialization ────────────────────────────────────────────────────────

    fn leaf_records(&self) -> Vec<LeafRecord> {
        let mut out = Vec::new();
        for (obj_id, obj) in &self.objects {
            out.push(LeafRecord {
                key: BtreeKey {
                    localization: HAMMER_LOCALIZE_INODE,
                    obj_id: *obj_id,
                    rec_type: HAMMER_RECTYPE_INODE,
                    key: 0,
                    create_tid: obj.create_tid,
                    delete_tid: 0,
                },
                obj_type: obj.obj_type,
                data: encode_inode(obj),
                may_straddle: false,
            });
        }
        for d in &self.dirents {
            let dir_loc = match self.objects.get(&d.dir) {
                Some(o) if o.cap_flags & HAMMER_INODE_CAP_DIR_LOCAL_INO != 0 => {
                    HAMMER_LOCALIZE_INODE
                }
                _ => HAMMER_LOCALIZE_MISC,
            };
            let mut data = vec![0_u8; HAMMER_ENTRY_NAME_OFFSET];
            data[0..8].copy_from_slice(&d.target.to_le_bytes());
            data[8..12].copy_from_slice(&HAMMER_LOCALIZE_INODE.to_le_bytes());
            data.extend_from_slice(&d.name);
            out.push(LeafRecord {
                key: BtreeKey {
                    localization: dir_loc,
                    obj_id: d.dir,
                    rec_type: HAMMER_RECTYPE_DIRENTRY,
                    key: d.key,
                    create_tid: d.create_tid,
                    delete_tid: d.delete_tid,
                },
                obj_type: self.objects.get(&d.target).map_or(0, |o| o.obj_type),
                data,
                may_straddle: false,
            });
        }
        for r in &self.data {
            out.push(LeafRecord {
                key: BtreeKey {
                    localization: HAMMER_LOCALIZE_MISC,
                    obj_id: r.obj,
                    rec_type: r.rec_type,
                    key: (r.start + r.bytes.len() as u64) as i64,
                    create_tid: r.create_tid,
                    delete_tid: 0,
                },
                obj_type: self.objects.get(&r.obj).map_or(0, |o| o.obj_type),
                data: r.bytes.clone(),
                may_straddle: true,
            });
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Serialize the volume.
    #[must_use]
    pub fn build(&self) -> Vec<u8> {
        let records = self.leaf_records();

        // Record data, relative to vol_buf_beg.
        let mut data_area: Vec<u8> = Vec::new();
        let mut placed = Vec::with_capacity(records.len());
        for rec in &records {
            let len = rec.data.len();
            let within = data_area.len() % BUF;
            if !rec.may_straddle && within + len > BUF {
                data_area.resize(data_area.len() + (BUF - within), 0);
            }
            placed.push(data_area.len() as u64);
            data_area.extend_from_slice(&rec.data);
            data_area.resize(data_area.len().next_multiple_of(8), 0);
        }
        data_area.resize(data_area.len().next_multiple_of(BUF), 0);
        let node_base = data_area.len() as u64;

        // Leaves, then internal levels until a single root remains.
        let mut nodes: Vec<Vec<u8>> = Vec::new();
        let mut level: Vec<(BtreeKey, u64)> = Vec::new();
        let chunks: Vec<(usize, usize)> = (0..records.len())
            .step_by(self.leaf_fanout)
            .map(|s| (s, (s + self.leaf_fanout).min(records.len())))
            .collect();
        for (start, end) in chunks {
            let mut node = new_node(HAMMER_BTREE_TYPE_LEAF, end - start, self.tid);
            for (slot, idx) in (start..end).enumerate() {
                let rec = &records[idx];
                let elm = elm_slot(&mut node, slot);
                put_base(elm, &rec.key, rec.obj_type, HAMMER_BTREE_TYPE_RECORD);
                elm[44..48].copy_from_slice(&(rec.data.len() as i32).to_le_bytes());
                let data_off = zone_offset(HAMMER_ZONE_LARGE_DATA, placed[idx]);
                elm[48..56].copy_from_slice(&data_off.to_le_bytes());
                elm[56..60].copy_from_slice(&crc32fast::hash(&rec.data).to_le_bytes());
            }
            let first = if level.is_empty() { MIN_KEY } else { records[start].key };
            level.push((first, node_offset(node_base, nodes.len())));
            nodes.push(node);
        }

        while level.len() > 1 {
            let groups: Vec<&[(BtreeKey, u64)]> = level.chunks(self.internal_fanout).collect();
            let mut next = Vec::with_capacity(groups.len());
            for (g, group) in groups.iter().enumerate() {
                let mut node = new_node(HAMMER_BTREE_TYPE_INTERNAL, group.len(), self.tid);
                for (slot, (key, child)) in group.iter().enumerate() {
                    let elm = elm_slot(&mut node, slot);
                    put_base(elm, key, 0, 0);
                    elm[40..48].copy_from_slice(&child.to_le_bytes());
                }
                let right = groups.get(g + 1).map_or(MAX_KEY, |next| next[0].0);
                put_base(elm_slot(&mut node, group.len()), &right, 0, 0);
                next.push((group[0].0, node_offset(node_base, nodes.len())));
                nodes.push(node);
            }
            level = next;
        }
        let root_btree = level.first().map_or(0, |(_, off)| *off);

        let mut image = vec![0_u8; BUF];
        image.extend_from_slice(&data_area);
        for node in &nodes {
            image.extend_from_slice(node);
        }
        image.resize(image.len().next_multiple_of(BUF), 0);

        let total = image.len() as u64;
        let hdr = &mut image[..BUF];
        hdr[0x00..0x08].copy_from_slice(&HAMMER_FSBUF_VOLUME.to_le_bytes());
        hdr[0x18..0x20].copy_from_slice(&(BUF as u64).to_le_bytes());
        hdr[0x20..0x28].copy_from_slice(&total.to_le_bytes());
        hdr[0x30..0x40].copy_from_slice(&crc32fast::hash(self.label.as_bytes()).to_le_bytes().repeat(4));
        hdr[0x40..0x46].copy_from_slice(b"HAMMER");
        let label = self.label.as_bytes();
        let label_len = label.len().min(63);
        hdr[0x50..0x50 + label_len].copy_from_slice(&label[..label_len]);
        hdr[0x94..0x98].copy_from_slice(&1_i32.to_le_bytes());
        hdr[0x98..0x9C].copy_from_slice(&7_u32.to_le_bytes());
        hdr[0xF0..0xF8].copy_from_slice(&root_btree.to_le_bytes());
        hdr[0xF8..0x100].copy_from_slice(&(self.tid + 1).to_le_bytes());
        image
    }
}

fn node_offset(node_base: u64, index: usize) -> u64 {
    zone_offset(
        HAMMER_ZONE_BTREE,
        node_base + (index * HAMMER_BTREE_NODE_SIZE) as u64,
    )
}

fn new_node(node_type: u8, count: usize, mirror_tid: u64) -> Vec<u8> {
    let mut node = vec![0_u8; HAMMER_BTREE_NODE_SIZE];
    node[0x10..0x14].copy_from_slice(&(count as i32).to_le_bytes());
    node[0x14] = node_type;
    node[0x38..0x40].copy_from_slice(&mirror_tid.to_le_bytes());
    node
}

fn elm_slot(node: &mut [u8], slot: usize) -> &mut [u8] {
    let at = 0x40 + slot * HAMMER_BTREE_ELM_SIZE;
    &mut node[at..at + HAMMER_BTREE_ELM_SIZE]
}

fn put_base(elm: &mut [u8], key: &BtreeKey, obj_type: u8, btype: u8) {
    elm[0..8].copy_from_slice(&key.obj_id.to_le_bytes());
    elm[8..16].copy_from_slice(&key.key.to_le_bytes());
    elm[16..24].copy_from_slice(&key.create_tid.to_le_bytes());
    elm[24..32].copy_from_slice(&key.delete_tid.to_le_bytes());
    elm[32..34].copy_from_slice(&key.rec_type.to_le_bytes());
    elm[34] = obj_type;
    elm[35] = btype;
    elm[36..40].copy_from_slice(&key.localization.to_le_bytes());
}

fn uuid_for(id: u32) -> [u8; 16] {
    let mut uuid = [0_u8; 16];
    uuid[12..16].copy_from_slice(&id.to_le_bytes());
    uuid
}

fn encode_inode(obj: &Object) -> Vec<u8> {
    let stamp = EPOCH_MICROS + obj.create_tid * 1_000_000;
    let mut ino = vec![0_u8; HAMMER_INODE_DATA_SIZE];
    ino[0..2].copy_from_slice(&1_u16.to_le_bytes());
    ino[2..4].copy_from_slice(&obj.mode.to_le_bytes());
    ino[16..24].copy_from_slice(&stamp.to_le_bytes());
    ino[24..32].copy_from_slice(&obj.parent.to_le_bytes());
    ino[32..48].copy_from_slice(&uuid_for(obj.uid));
    ino[48..64].copy_from_slice(&uuid_for(obj.gid));
    ino[64] = obj.obj_type;
    ino[65] = obj.cap_flags;
    ino[72..80].copy_from_slice(&(obj.size as i64).to_le_bytes());
    ino[80..88].copy_from_slice(&obj.nlinks.to_le_bytes());
    ino[88..96].copy_from_slice(&stamp.to_le_bytes());
    ino[96..104].copy_from_slice(&stamp.to_le_bytes());
    ino
}
