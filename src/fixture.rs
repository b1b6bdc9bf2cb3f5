//! Builders for small but well-formed UBI images and UBIFS volumes, used by the tests.

use deku::DekuContainerWrite;

use crate::config::Config;
use crate::ubi::headers::{Ec, Vid, VolTableRecord, VolType};
use crate::ubi::{LAYOUT_VOLUME_ID, UBI_CRC};
use crate::ubifs::node::{
    ChHdr, DataNodeHdr, DentNodeHdr, IdxNodeHdr, InoNodeHdr, MstNodeHdr, SbNodeHdr,
};
use crate::ubi::UbiImage;
use crate::ubifs::{
    Branch, Compression, FileType, Key, KeyHash, KeyKind, Location, NodeType, Ubifs,
    BLOCK_SIZE, NODE_MAGIC, ROOT_INUM,
};

pub const PEB_SIZE: u32 = 0x4000;
const VID_HDR_OFFSET: u32 = 64;
const DATA_OFFSET: u32 = 128;
pub const LEB_SIZE: u32 = PEB_SIZE - DATA_OFFSET;
const IMAGE_SEQ: u32 = 0x5EED;

const MIN_IO_SIZE: u32 = 8;
const FANOUT: usize = 4;
const FIRST_INUM: u32 = 64;
const SUPERBLOCK_LEN: usize = 4096;
const MASTER_LEN: usize = 512;
const MAX_VOLUMES: usize = 128;

/// Lays volumes out one LEB per PEB, after the two layout volume copies
#[derive(Default)]
pub struct UbiBuilder {
    volumes: Vec<(u32, String, VolType, Vec<Vec<u8>>)>,
    stale: Vec<(u32, u32, Vec<u8>)>,
}

impl UbiBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dynamic_volume(mut self, id: u32, name: &str, lebs: Vec<Vec<u8>>) -> Self {
        self.volumes
            .push((id, name.to_string(), VolType::Dynamic, lebs));
        self
    }

    pub fn static_volume(mut self, id: u32, name: &str, lebs: Vec<Vec<u8>>) -> Self {
        self.volumes
            .push((id, name.to_string(), VolType::Static, lebs));
        self
    }

    /// Add an outdated copy of a LEB of a dynamic volume, in a PEB after all the current ones
    pub fn stale_copy(mut self, vol_id: u32, lnum: u32, data: Vec<u8>) -> Self {
        self.stale.push((vol_id, lnum, data));
        self
    }

    fn peb(vid: Vid, data: &[u8]) -> Vec<u8> {
        assert!(data.len() <= LEB_SIZE as usize, "LEB contents too large");

        let ec = Ec {
            ec: 1,
            vid_hdr_offset: VID_HDR_OFFSET,
            data_offset: DATA_OFFSET,
            image_seq: IMAGE_SEQ,
        };

        let mut peb = vec![0xFF; PEB_SIZE as usize];
        put(&mut peb, 0, &ec.encode());
        put(&mut peb, VID_HDR_OFFSET as usize, &vid.encode());
        put(&mut peb, DATA_OFFSET as usize, data);
        peb
    }

    pub fn build(self) -> Vec<u8> {
        let mut sqnum = 0;
        let mut next_sqnum = || {
            sqnum += 1;
            sqnum
        };

        let slots = MAX_VOLUMES.min(LEB_SIZE as usize / VolTableRecord::SIZE);
        let mut vtbl = Vec::with_capacity(slots * VolTableRecord::SIZE);
        for slot in 0..slots as u32 {
            let record = self
                .volumes
                .iter()
                .find(|(id, ..)| *id == slot)
                .map(|(_, name, vol_type, lebs)| VolTableRecord {
                    reserved_pebs: lebs.len().max(1) as u32,
                    alignment: 1,
                    vol_type: *vol_type,
                    name: name.clone(),
                    ..Default::default()
                });
            vtbl.extend(VolTableRecord::encode(record.as_ref()));
        }

        let mut image = Vec::new();
        for lnum in 0..2 {
            let vid = Vid {
                vol_type: VolType::Dynamic,
                compat: 5,
                vol_id: LAYOUT_VOLUME_ID,
                lnum,
                sqnum: next_sqnum(),
                ..Default::default()
            };
            image.extend(Self::peb(vid, &vtbl));
        }

        for (vol_id, _, vol_type, lebs) in &self.volumes {
            for (lnum, data) in lebs.iter().enumerate() {
                let mut vid = Vid {
                    vol_type: *vol_type,
                    vol_id: *vol_id,
                    lnum: lnum as u32,
                    sqnum: next_sqnum(),
                    ..Default::default()
                };
                if *vol_type == VolType::Static {
                    vid.data_size = data.len() as u32;
                    vid.used_ebs = lebs.len() as u32;
                    vid.data_crc = UBI_CRC.checksum(data);
                }
                image.extend(Self::peb(vid, data));
            }
        }

        for (vol_id, lnum, data) in &self.stale {
            let vid = Vid {
                vol_id: *vol_id,
                lnum: *lnum,
                sqnum: 0,
                ..Default::default()
            };
            image.extend(Self::peb(vid, data));
        }

        // A free PEB: EC header only
        let mut free = vec![0xFF; PEB_SIZE as usize];
        let ec = Ec {
            ec: 1,
            vid_hdr_offset: VID_HDR_OFFSET,
            data_offset: DATA_OFFSET,
            image_seq: IMAGE_SEQ,
        };
        put(&mut free, 0, &ec.encode());
        image.extend(free);

        image
    }
}

fn put(buf: &mut [u8], at: usize, bytes: &[u8]) {
    buf[at..at + bytes.len()].copy_from_slice(bytes);
}

fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// Writes nodes into the LEBs of a UBIFS volume the way `mkfs.ubifs` lays them out: superblock in
/// LEB 0, masters in LEBs 1 and 2, then leaves and index nodes appended from LEB 3.
///
/// Leaves are written as they are added; [FsBuilder::commit] builds an index over all of them.
pub struct FsBuilder {
    key_hash: KeyHash,
    lebs: Vec<Vec<u8>>,
    leaves: Vec<(Key, Location, u32)>,
    next_inum: u32,
    sqnum: u64,
    height: usize,
    leaf_count: usize,
}

impl FsBuilder {
    pub fn new() -> Self {
        let mut fs = Self {
            key_hash: KeyHash::R5,
            lebs: vec![Vec::new(); 4],
            leaves: Vec::new(),
            next_inum: FIRST_INUM,
            sqnum: 0,
            height: 0,
            leaf_count: 0,
        };
        fs.leaf(
            Key::inode(ROOT_INUM),
            inode_node(ROOT_INUM, 0o040755, b"", 0),
        );
        fs
    }

    pub fn key_hash(mut self, hash: KeyHash) -> Self {
        self.key_hash = hash;
        self
    }

    /// Append any node after the last one written, returning where it went and its length
    pub fn append_node(&mut self, node: Vec<u8>) -> (Location, u32) {
        self.sqnum += 1;
        let node = finish_node(node, self.sqnum);

        let mut lnum = self.lebs.len() - 1;
        let mut offs = align_up(self.lebs[lnum].len(), MIN_IO_SIZE as usize);
        if offs + node.len() > LEB_SIZE as usize {
            self.lebs.push(Vec::new());
            lnum += 1;
            offs = 0;
        }

        let leb = &mut self.lebs[lnum];
        leb.resize(offs, 0);
        leb.extend_from_slice(&node);
        (Location::new(lnum as u32, offs as u32), node.len() as u32)
    }

    fn leaf(&mut self, key: Key, node: Vec<u8>) -> Location {
        let (loc, len) = self.append_node(node);
        self.leaves.push((key, loc, len));
        loc
    }

    /// Write an inode node for a fresh inode number
    pub fn inode(&mut self, mode: u32, size: u64, data: &[u8]) -> u32 {
        let inum = self.next_inum;
        self.next_inum += 1;
        self.leaf(Key::inode(inum), inode_node(inum, mode, data, size));
        inum
    }

    pub fn link(&mut self, parent: u32, name: &str, inum: u32, file_type: FileType) -> Location {
        let name = name.as_bytes();
        let key = Key::dir_entry(parent, self.key_hash.hash(name));
        let node = dent_node(
            KeyKind::DirEntry,
            parent,
            self.key_hash,
            name,
            inum,
            dent_type(file_type),
        );
        self.leaf(key, node)
    }

    /// Write one block of file data, compressed with `codec`
    pub fn data(&mut self, inum: u32, block: u32, contents: &[u8], codec: Compression) -> Location {
        let payload = compress(codec, contents);
        let node = raw_data_node(inum, block, codec, &payload, contents.len() as u32);
        self.leaf(Key::data(inum, block), node)
    }

    /// Write a data node whose payload and compression tag are taken as given
    pub fn raw_data(&mut self, inum: u32, block: u32, compr_type: u16, payload: &[u8], size: u32) {
        let node = data_node(inum, block, compr_type, payload, size);
        self.leaf(Key::data(inum, block), node);
    }

    pub fn file(&mut self, parent: u32, name: &str, contents: &[u8]) -> u32 {
        self.file_with(parent, name, contents, Compression::None)
    }

    pub fn file_with(&mut self, parent: u32, name: &str, contents: &[u8], codec: Compression) -> u32 {
        let inum = self.inode(0o100644, contents.len() as u64, b"");
        for (block, chunk) in contents.chunks(BLOCK_SIZE as usize).enumerate() {
            self.data(inum, block as u32, chunk, codec);
        }
        self.link(parent, name, inum, FileType::Regular);
        inum
    }

    pub fn dir(&mut self, parent: u32, name: &str) -> u32 {
        let inum = self.inode(0o040755, 0, b"");
        self.link(parent, name, inum, FileType::Directory);
        inum
    }

    pub fn symlink(&mut self, parent: u32, name: &str, target: &[u8]) -> u32 {
        let inum = self.inode(0o120777, target.len() as u64, target);
        self.link(parent, name, inum, FileType::Symlink);
        inum
    }

    /// Attach an extended attribute to `inum`; the value lives in an inode of its own
    pub fn xattr(&mut self, inum: u32, name: &str, value: &[u8]) {
        let xinum = self.inode(0o100644, value.len() as u64, value);
        let name = name.as_bytes();
        let key = Key::xattr_entry(inum, self.key_hash.hash(name));
        let node = dent_node(KeyKind::XattrEntry, inum, self.key_hash, name, xinum, 0);
        self.leaf(key, node);
    }

    /// Build the index bottom-up over every leaf, returning the root branch
    fn build_index(&mut self) -> Branch {
        let mut leaves = self.leaves.clone();
        // Stable, so colliding keys keep their creation order
        leaves.sort_by_key(|(key, ..)| *key);
        self.leaf_count = leaves.len();

        let mut level: Vec<Branch> = leaves
            .into_iter()
            .map(|(key, loc, len)| Branch { key, loc, len })
            .collect();
        let mut height = 0;
        loop {
            let mut next = Vec::new();
            for chunk in level.chunks(FANOUT) {
                let (loc, len) = self.append_node(index_node(height, chunk));
                next.push(Branch {
                    key: chunk[0].key,
                    loc,
                    len,
                });
            }
            height += 1;
            level = next;

            if let [root] = level[..] {
                self.height = height.into();
                return root;
            }
        }
    }

    fn write_superblock(&mut self) {
        let leb_cnt = self.lebs.len() as u32;
        self.lebs[0] = finish_node(superblock_node(self.key_hash, leb_cnt), 1);
    }

    /// Write the index, and master nodes naming it with these sequence numbers in LEBs 1 and 2
    pub fn commit_masters(&mut self, masters: &[&[u64]]) {
        let root = self.build_index();
        self.write_masters(root.loc, root.len, masters);
    }

    fn write_masters(&mut self, root: Location, root_len: u32, masters: &[&[u64]]) {
        self.write_superblock();
        let highest_inum = u64::from(self.next_inum - 1);
        for (copy, sqnums) in masters.iter().enumerate() {
            let leb = &mut self.lebs[1 + copy];
            leb.clear();
            for (cmt_no, &sqnum) in sqnums.iter().enumerate() {
                let node = master_node(root, root_len, highest_inum, cmt_no as u64);
                leb.extend(finish_node(node, sqnum));
            }
        }
    }

    /// Write the index and one master node to each master LEB
    pub fn commit(&mut self) {
        let root = self.build_index();
        let sqnum = self.sqnum + 1;
        self.sqnum += 2;
        self.write_masters(root.loc, root.len, &[&[sqnum], &[sqnum + 1]]);
    }

    /// Write master nodes naming `root` without building an index
    pub fn commit_with_root(&mut self, root: Location, root_len: u32) {
        let sqnum = self.sqnum + 1;
        self.sqnum += 2;
        self.write_masters(root, root_len, &[&[sqnum], &[sqnum + 1]]);
    }

    /// Flip every bit of one byte, `byte` bytes into the node at `loc`
    pub fn corrupt(&mut self, loc: Location, byte: usize) {
        self.lebs[loc.lnum as usize][loc.offs as usize + byte] ^= 0xFF;
    }

    pub fn lebs(&self) -> Vec<Vec<u8>> {
        self.lebs.clone()
    }

    /// Number of index levels written by the last commit
    pub fn index_height(&self) -> usize {
        self.height
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    pub fn leaf_location(&self, key: Key) -> Option<Location> {
        self.leaves
            .iter()
            .find(|(k, ..)| *k == key)
            .map(|&(_, loc, _)| loc)
    }
}

/// Put `fs` in volume 0 of a fresh UBI image and hand the mounted filesystem to `f`
pub fn mount<T>(
    fs: &FsBuilder,
    config: &Config,
    f: impl FnOnce(&Ubifs<'_, Vec<u8>>) -> anyhow::Result<T>,
) -> anyhow::Result<T> {
    let image = UbiBuilder::new()
        .dynamic_volume(0, "rootfs", fs.lebs())
        .build();
    let ubi = UbiImage::open(image, config)?;
    let ubifs = Ubifs::open(ubi.volume(0)?, config)?;
    f(&ubifs)
}

fn hello_fs() -> FsBuilder {
    let mut fs = FsBuilder::new();
    fs.file(ROOT_INUM, "hello.txt", b"world");
    fs.commit();
    fs
}

/// A UBI image with a `rootfs` volume holding `/hello.txt` and a static `kernel` volume
pub fn hello_image() -> Vec<u8> {
    UbiBuilder::new()
        .dynamic_volume(0, "rootfs", hello_fs().lebs())
        .static_volume(1, "kernel", vec![b"not really a kernel".to_vec()])
        .build()
}

/// Like [hello_image], with `rootfs` as a static volume whose LEBs end where their data ends
pub fn static_hello_image() -> Vec<u8> {
    UbiBuilder::new()
        .static_volume(0, "rootfs", hello_fs().lebs())
        .build()
}

pub fn compress(codec: Compression, data: &[u8]) -> Vec<u8> {
    match codec {
        Compression::None => data.to_vec(),
        Compression::Lzo => {
            #[cfg(feature = "lzo")]
            {
                let mut out = Vec::with_capacity(rust_lzo::worst_compress(data.len()));
                let err = rust_lzo::LZOContext::new().compress(data, &mut out);
                assert!(err == rust_lzo::LZOError::OK, "LZO compression failed");
                out
            }
            #[cfg(not(feature = "lzo"))]
            panic!("lzo support not built")
        }
        Compression::Zlib => {
            #[cfg(feature = "zlib")]
            {
                use std::io::Write;

                let mut encoder = flate2::write::DeflateEncoder::new(
                    Vec::new(),
                    flate2::Compression::default(),
                );
                encoder.write_all(data).unwrap();
                encoder.finish().unwrap()
            }
            #[cfg(not(feature = "zlib"))]
            panic!("zlib support not built")
        }
        Compression::Zstd => {
            #[cfg(feature = "zstd")]
            {
                zstd::bulk::compress(data, 3).unwrap()
            }
            #[cfg(not(feature = "zstd"))]
            panic!("zstd support not built")
        }
    }
}

/// Fill in the magic, sequence number, length and CRC of a node
pub fn finish_node(mut node: Vec<u8>, sqnum: u64) -> Vec<u8> {
    let len = node.len() as u32;
    put(&mut node, 0, &NODE_MAGIC.to_le_bytes());
    put(&mut node, 8, &sqnum.to_le_bytes());
    put(&mut node, 16, &len.to_le_bytes());
    let crc = UBI_CRC.checksum(&node[8..]);
    put(&mut node, 4, &crc.to_le_bytes());
    node
}

fn common_header(node_type: NodeType) -> Vec<u8> {
    ChHdr {
        magic: NODE_MAGIC,
        crc: 0,
        sqnum: 0,
        len: 0,
        node_type: node_type.tag(),
        group_type: 0,
        padding: [0; 2],
    }
    .to_bytes()
    .unwrap()
}

fn leaf_key(key: Key) -> [u8; 16] {
    let mut raw = [0u8; 16];
    raw[..8].copy_from_slice(&key.encode());
    raw
}

fn dent_type(file_type: FileType) -> u8 {
    match file_type {
        FileType::Regular => 0,
        FileType::Directory => 1,
        FileType::Symlink => 2,
        FileType::BlockDevice => 3,
        FileType::CharDevice => 4,
        FileType::Fifo => 5,
        FileType::Socket => 6,
    }
}

pub fn inode_node(inum: u32, mode: u32, data: &[u8], size: u64) -> Vec<u8> {
    let mut node = common_header(NodeType::Inode);
    let hdr = InoNodeHdr {
        key: leaf_key(Key::inode(inum)),
        creat_sqnum: 0,
        size,
        atime_sec: 1_700_000_000,
        ctime_sec: 1_700_000_000,
        mtime_sec: 1_700_000_000,
        atime_nsec: 0,
        ctime_nsec: 0,
        mtime_nsec: 0,
        nlink: if mode & 0o170000 == 0o040000 { 2 } else { 1 },
        uid: 0,
        gid: 0,
        mode,
        flags: 0,
        data_len: data.len() as u32,
        xattr_cnt: 0,
        xattr_size: 0,
        padding1: [0; 4],
        xattr_names: 0,
        compr_type: 0,
        padding2: [0; 26],
    };
    node.extend(hdr.to_bytes().unwrap());
    node.extend_from_slice(data);
    finish_node(node, 1)
}

pub fn dent_node(
    kind: KeyKind,
    parent: u32,
    hash: KeyHash,
    name: &[u8],
    target: u32,
    dtype: u8,
) -> Vec<u8> {
    let node_type = match kind {
        KeyKind::XattrEntry => NodeType::XattrEntry,
        _ => NodeType::DirEntry,
    };
    let mut node = common_header(node_type);
    let hdr = DentNodeHdr {
        key: leaf_key(Key::new(parent, kind, hash.hash(name))),
        inum: target.into(),
        padding1: 0,
        dtype,
        nlen: name.len() as u16,
        cookie: 0,
    };
    node.extend(hdr.to_bytes().unwrap());
    node.extend_from_slice(name);
    node.push(0);
    finish_node(node, 1)
}

fn data_node(inum: u32, block: u32, compr_type: u16, payload: &[u8], size: u32) -> Vec<u8> {
    let mut node = common_header(NodeType::Data);
    let hdr = DataNodeHdr {
        key: leaf_key(Key::data(inum, block)),
        size,
        compr_type,
        compr_size: 0,
    };
    node.extend(hdr.to_bytes().unwrap());
    node.extend_from_slice(payload);
    finish_node(node, 1)
}

/// A data node carrying `payload` exactly as given, tagged as compressed with `codec`
pub fn raw_data_node(
    inum: u32,
    block: u32,
    codec: Compression,
    payload: &[u8],
    size: u32,
) -> Vec<u8> {
    data_node(inum, block, codec.tag(), payload, size)
}

pub fn index_node(level: u16, branches: &[Branch]) -> Vec<u8> {
    let mut node = common_header(NodeType::Index);
    let hdr = IdxNodeHdr {
        child_cnt: branches.len() as u16,
        level,
    };
    node.extend(hdr.to_bytes().unwrap());
    for branch in branches {
        node.extend_from_slice(&branch.loc.lnum.to_le_bytes());
        node.extend_from_slice(&branch.loc.offs.to_le_bytes());
        node.extend_from_slice(&branch.len.to_le_bytes());
        node.extend_from_slice(&branch.key.encode());
    }
    finish_node(node, 1)
}

fn superblock_node(key_hash: KeyHash, leb_cnt: u32) -> Vec<u8> {
    let mut node = common_header(NodeType::Superblock);
    let hdr = SbNodeHdr {
        padding: [0; 2],
        key_hash: match key_hash {
            KeyHash::R5 => 0,
            KeyHash::Test => 1,
        },
        key_fmt: 0,
        flags: 0,
        min_io_size: MIN_IO_SIZE,
        leb_size: LEB_SIZE,
        leb_cnt,
        max_leb_cnt: 256,
        max_bud_bytes: u64::from(LEB_SIZE) * 8,
        log_lebs: 0,
        lpt_lebs: 0,
        orph_lebs: 0,
        jhead_cnt: 1,
        fanout: FANOUT as u32,
        lsave_cnt: 0,
        fmt_version: 4,
        default_compr: Compression::None.tag(),
        padding1: [0; 2],
        rp_uid: 0,
        rp_gid: 0,
        rp_size: 0,
        time_gran: 1_000_000_000,
        uuid: *b"fixture-uuid-000",
        ro_compat_version: 0,
    };
    node.extend(hdr.to_bytes().unwrap());
    node.resize(SUPERBLOCK_LEN, 0);
    node
}

fn master_node(root: Location, root_len: u32, highest_inum: u64, cmt_no: u64) -> Vec<u8> {
    let mut node = common_header(NodeType::Master);
    let hdr = MstNodeHdr {
        highest_inum,
        cmt_no,
        flags: 0,
        log_lnum: 0,
        root_lnum: root.lnum,
        root_offs: root.offs,
        root_len,
        gc_lnum: 0,
        ihead_lnum: root.lnum,
        ihead_offs: root.offs,
        index_size: 0,
        total_free: 0,
        total_dirty: 0,
        total_used: 0,
        total_dead: 0,
        total_dark: 0,
        lpt_lnum: 0,
        lpt_offs: 0,
        nhead_lnum: 0,
        nhead_offs: 0,
        ltab_lnum: 0,
        ltab_offs: 0,
        lsave_lnum: 0,
        lsave_offs: 0,
        lscan_lnum: 0,
        empty_lebs: 0,
        idx_lebs: 0,
        leb_cnt: 0,
    };
    node.extend(hdr.to_bytes().unwrap());
    node.resize(MASTER_LEN, 0);
    node
}
