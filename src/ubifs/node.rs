//! Decoding of UBIFS nodes.
//!
//! Every node starts with the same 24-byte common header, followed by a type-specific payload.
//! All UBIFS fields are little-endian:
//!
//! ```text
//! 0   magic       0x06101831
//! 4   crc         CRC-32 of bytes 8..len
//! 8   sqnum       64-bit sequence number, unique per write
//! 16  len         total node length, header included
//! 20  node_type
//! 21  group_type
//! 22  2 bytes padding
//! ```

use std::borrow::Cow;
use std::fmt;

use deku::prelude::*;

use super::compress::Compression;
use super::key::{Key, KeyHash, KeyKind, KEY_SIZE};
use super::Location;
use crate::error::{Error, Result};
use crate::image::ImageSource;
use crate::ubi::{Volume, UBI_CRC};

pub const NODE_MAGIC: u32 = 0x06101831;
pub const COMMON_HEADER_SIZE: usize = 24;

/// Offset of the first byte covered by the node CRC
const CRC_START: usize = 8;

/// Key fields inside leaf nodes reserve room for 16 bytes; only the first 8 are used
const LEAF_KEY_SIZE: usize = 16;

const MAX_NAME_LEN: usize = 255;

#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub(crate) struct ChHdr {
    pub magic: u32,
    pub crc: u32,
    pub sqnum: u64,
    pub len: u32,
    pub node_type: u8,
    pub group_type: u8,
    pub padding: [u8; 2],
}

#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub(crate) struct InoNodeHdr {
    pub key: [u8; LEAF_KEY_SIZE],
    pub creat_sqnum: u64,
    pub size: u64,
    pub atime_sec: u64,
    pub ctime_sec: u64,
    pub mtime_sec: u64,
    pub atime_nsec: u32,
    pub ctime_nsec: u32,
    pub mtime_nsec: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub flags: u32,
    pub data_len: u32,
    pub xattr_cnt: u32,
    pub xattr_size: u32,
    pub padding1: [u8; 4],
    pub xattr_names: u32,
    pub compr_type: u16,
    pub padding2: [u8; 26],
}

#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub(crate) struct DataNodeHdr {
    pub key: [u8; LEAF_KEY_SIZE],
    pub size: u32,
    pub compr_type: u16,
    pub compr_size: u16,
}

#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub(crate) struct DentNodeHdr {
    pub key: [u8; LEAF_KEY_SIZE],
    pub inum: u64,
    pub padding1: u8,
    pub dtype: u8,
    pub nlen: u16,
    pub cookie: u32,
}

#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub(crate) struct TrunNodeHdr {
    pub inum: u32,
    pub padding: [u8; 12],
    pub old_size: u64,
    pub new_size: u64,
}

#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub(crate) struct PadNodeHdr {
    pub pad_len: u32,
}

#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub(crate) struct SbNodeHdr {
    pub padding: [u8; 2],
    pub key_hash: u8,
    pub key_fmt: u8,
    pub flags: u32,
    pub min_io_size: u32,
    pub leb_size: u32,
    pub leb_cnt: u32,
    pub max_leb_cnt: u32,
    pub max_bud_bytes: u64,
    pub log_lebs: u32,
    pub lpt_lebs: u32,
    pub orph_lebs: u32,
    pub jhead_cnt: u32,
    pub fanout: u32,
    pub lsave_cnt: u32,
    pub fmt_version: u32,
    pub default_compr: u16,
    pub padding1: [u8; 2],
    pub rp_uid: u32,
    pub rp_gid: u32,
    pub rp_size: u64,
    pub time_gran: u32,
    pub uuid: [u8; 16],
    pub ro_compat_version: u32,
}

#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub(crate) struct MstNodeHdr {
    pub highest_inum: u64,
    pub cmt_no: u64,
    pub flags: u32,
    pub log_lnum: u32,
    pub root_lnum: u32,
    pub root_offs: u32,
    pub root_len: u32,
    pub gc_lnum: u32,
    pub ihead_lnum: u32,
    pub ihead_offs: u32,
    pub index_size: u64,
    pub total_free: u64,
    pub total_dirty: u64,
    pub total_used: u64,
    pub total_dead: u64,
    pub total_dark: u64,
    pub lpt_lnum: u32,
    pub lpt_offs: u32,
    pub nhead_lnum: u32,
    pub nhead_offs: u32,
    pub ltab_lnum: u32,
    pub ltab_offs: u32,
    pub lsave_lnum: u32,
    pub lsave_offs: u32,
    pub lscan_lnum: u32,
    pub empty_lebs: u32,
    pub idx_lebs: u32,
    pub leb_cnt: u32,
}

#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub(crate) struct RefNodeHdr {
    pub lnum: u32,
    pub offs: u32,
    pub jhead: u32,
    pub padding: [u8; 28],
}

#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub(crate) struct IdxNodeHdr {
    pub child_cnt: u16,
    pub level: u16,
}

#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub(crate) struct BranchHdr {
    pub lnum: u32,
    pub offs: u32,
    pub len: u32,
    pub key: [u8; KEY_SIZE],
}

/// Also the layout of orphan nodes, which follow it with a list of inode numbers
#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub(crate) struct CsNodeHdr {
    pub cmt_no: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    Inode,
    Data,
    DirEntry,
    XattrEntry,
    Truncation,
    Padding,
    Superblock,
    Master,
    Ref,
    Index,
    CommitStart,
    Orphan,
}

impl NodeType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        use NodeType::*;

        Some(match tag {
            0 => Inode,
            1 => Data,
            2 => DirEntry,
            3 => XattrEntry,
            4 => Truncation,
            5 => Padding,
            6 => Superblock,
            7 => Master,
            8 => Ref,
            9 => Index,
            10 => CommitStart,
            11 => Orphan,
            _ => return None,
        })
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    /// The smallest valid on-flash length of a node of this type, common header included
    pub fn min_len(self) -> usize {
        use NodeType::*;

        match self {
            Inode => 160,
            Data => 48,
            DirEntry | XattrEntry => 56,
            Truncation => 56,
            Padding => 28,
            Superblock => 4096,
            Master => 512,
            Ref => 64,
            Index => 28,
            CommitStart => 32,
            Orphan => 32,
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use NodeType::*;

        f.write_str(match self {
            Inode => "inode",
            Data => "data",
            DirEntry => "dent",
            XattrEntry => "xent",
            Truncation => "trun",
            Padding => "pad",
            Superblock => "sb",
            Master => "mst",
            Ref => "ref",
            Index => "idx",
            CommitStart => "cs",
            Orphan => "orph",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommonHeader {
    pub crc: u32,
    pub sqnum: u64,
    pub len: u32,
    pub node_type: NodeType,
    pub group_type: u8,
}

/// A decoded node and where it was found
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub loc: Location,
    pub header: CommonHeader,
    pub body: NodeBody,
}

impl Node {
    pub fn node_type(&self) -> NodeType {
        self.header.node_type
    }

    /// The index key of a leaf node
    pub fn key(&self) -> Option<Key> {
        match &self.body {
            NodeBody::Inode(x) => Some(x.key),
            NodeBody::Data(x) => Some(x.key),
            NodeBody::DirEntry(x) | NodeBody::XattrEntry(x) => Some(x.key),
            _ => None,
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} sqnum={} len={}: {}",
            self.loc,
            self.header.node_type,
            self.header.sqnum,
            self.header.len,
            self.body
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeBody {
    Inode(Inode),
    Data(DataBlock),
    DirEntry(DirEntry),
    XattrEntry(DirEntry),
    Truncation(Truncation),
    Padding(Padding),
    Superblock(Superblock),
    Master(Master),
    Ref(LebRef),
    Index(IndexNode),
    CommitStart(CommitStart),
    Orphan(Orphan),
}

impl fmt::Display for NodeBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inode(x) => write!(
                f,
                "key={} size={} nlink={} mode={:o} uid={} gid={}",
                x.key, x.size, x.nlink, x.mode, x.uid, x.gid
            ),
            Self::Data(x) => write!(
                f,
                "key={} size={} compr={} stored={}",
                x.key,
                x.size,
                x.compr_type,
                x.payload.len()
            ),
            Self::DirEntry(x) | Self::XattrEntry(x) => write!(
                f,
                "key={} inum={} type={:?} name={:?}",
                x.key,
                x.inum,
                x.file_type,
                x.name_lossy()
            ),
            Self::Truncation(x) => write!(
                f,
                "inum={} old_size={} new_size={}",
                x.inum, x.old_size, x.new_size
            ),
            Self::Padding(x) => write!(f, "pad_len={}", x.pad_len),
            Self::Superblock(x) => write!(
                f,
                "leb_size={:#x} leb_cnt={} min_io={} fanout={} key_hash={} fmt_version={}",
                x.leb_size, x.leb_cnt, x.min_io_size, x.fanout, x.key_hash, x.fmt_version
            ),
            Self::Master(x) => write!(
                f,
                "cmt_no={} root={} root_len={} highest_inum={}",
                x.cmt_no, x.root, x.root_len, x.highest_inum
            ),
            Self::Ref(x) => write!(f, "lnum={} offs={:#x} jhead={}", x.lnum, x.offs, x.jhead),
            Self::Index(x) => write!(f, "level={} branches={}", x.level, x.branches.len()),
            Self::CommitStart(x) => write!(f, "cmt_no={}", x.cmt_no),
            Self::Orphan(x) => write!(
                f,
                "cmt_no={} last={} inums={:?}",
                x.cmt_no, x.last, x.inums
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl FileType {
    /// Decode the `type` field of a directory entry
    pub fn from_dent_type(tag: u8) -> Option<Self> {
        use FileType::*;

        Some(match tag {
            0 => Regular,
            1 => Directory,
            2 => Symlink,
            3 => BlockDevice,
            4 => CharDevice,
            5 => Fifo,
            6 => Socket,
            _ => return None,
        })
    }

    /// Decode the `S_IFMT` bits of an inode mode
    pub fn from_mode(mode: u32) -> Option<Self> {
        use FileType::*;

        Some(match mode & 0o170000 {
            0o100000 => Regular,
            0o040000 => Directory,
            0o120000 => Symlink,
            0o060000 => BlockDevice,
            0o020000 => CharDevice,
            0o010000 => Fifo,
            0o140000 => Socket,
            _ => return None,
        })
    }

    /// The character `ls -l` shows for this type
    pub fn symbol(self) -> char {
        use FileType::*;

        match self {
            Regular => '-',
            Directory => 'd',
            Symlink => 'l',
            BlockDevice => 'b',
            CharDevice => 'c',
            Fifo => 'p',
            Socket => 's',
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timestamp {
    pub sec: u64,
    pub nsec: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub key: Key,
    pub creat_sqnum: u64,
    pub size: u64,
    pub atime: Timestamp,
    pub ctime: Timestamp,
    pub mtime: Timestamp,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub flags: u32,
    pub xattr_cnt: u32,
    pub xattr_size: u32,
    pub xattr_names: u32,
    pub compr_type: u16,

    /// Symlink target, device number, or xattr value
    pub data: Vec<u8>,
}

impl Inode {
    pub fn inum(&self) -> u32 {
        self.key.inum
    }

    pub fn file_type(&self) -> Option<FileType> {
        FileType::from_mode(self.mode)
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == Some(FileType::Directory)
    }

    pub fn symlink(&self) -> Option<&[u8]> {
        (self.file_type() == Some(FileType::Symlink)).then_some(self.data.as_slice())
    }

    /// `(major, minor)` of a device special file
    pub fn device(&self) -> Option<(u32, u32)> {
        if !matches!(
            self.file_type(),
            Some(FileType::BlockDevice | FileType::CharDevice)
        ) {
            return None;
        }
        match self.data.len() {
            // Linux "new" encoding of a 32-bit dev_t
            4 => {
                let dev = u32::from_le_bytes(self.data[..4].try_into().ok()?);
                Some(((dev & 0xFFF00) >> 8, (dev & 0xFF) | ((dev >> 12) & 0xFFF00)))
            }
            // Full 64-bit dev_t
            8 => {
                let dev = u64::from_le_bytes(self.data[..8].try_into().ok()?);
                let major = ((dev >> 32) & 0xFFFF_F000) | ((dev >> 8) & 0xFFF);
                let minor = ((dev >> 12) & 0xFFFF_FF00) | (dev & 0xFF);
                Some((major as u32, minor as u32))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub key: Key,

    /// Inode number of the entry's target
    pub inum: u64,
    pub file_type: FileType,
    pub cookie: u32,
    pub name: Vec<u8>,
}

impl DirEntry {
    /// The inode number of the directory holding this entry
    pub fn parent(&self) -> u32 {
        self.key.inum
    }

    pub fn hash(&self) -> u32 {
        self.key.value
    }

    /// Is this an extended attribute rather than a directory entry?
    pub fn is_xattr(&self) -> bool {
        self.key.kind == KeyKind::XattrEntry
    }

    pub fn name_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.name)
    }

    /// Does the stored name match the hash in the key?
    pub fn hash_matches(&self, hash: KeyHash) -> bool {
        hash.hash(&self.name) == self.key.value
    }
}

/// One block of file contents, decompressed on demand by [DataBlock::contents]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBlock {
    pub loc: Location,
    pub key: Key,

    /// Decompressed size
    pub size: u32,
    pub compr_type: u16,
    pub payload: Vec<u8>,
}

impl DataBlock {
    pub fn inum(&self) -> u32 {
        self.key.inum
    }

    /// Block index within the file
    pub fn block(&self) -> u32 {
        self.key.value
    }

    pub fn compression(&self) -> Option<Compression> {
        Compression::from_tag(self.compr_type)
    }

    pub fn contents(&self) -> Result<Vec<u8>> {
        use super::compress::CodecError;

        let codec = self
            .compression()
            .ok_or(Error::UnsupportedCodec(self.compr_type))?;

        codec
            .decompress(&self.payload, self.size as usize)
            .map_err(|e| match e {
                CodecError::Disabled(x) => Error::UnsupportedCodec(x.tag()),
                e => Error::CorruptPayload {
                    loc: self.loc,
                    detail: e.to_string(),
                },
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Truncation {
    pub inum: u32,
    pub old_size: u64,
    pub new_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Padding {
    pub pad_len: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub key_hash: u8,
    pub key_fmt: u8,
    pub flags: u32,
    pub min_io_size: u32,
    pub leb_size: u32,
    pub leb_cnt: u32,
    pub max_leb_cnt: u32,
    pub max_bud_bytes: u64,
    pub log_lebs: u32,
    pub lpt_lebs: u32,
    pub orph_lebs: u32,
    pub jhead_cnt: u32,
    pub fanout: u32,
    pub lsave_cnt: u32,
    pub fmt_version: u32,
    pub default_compr: u16,
    pub rp_uid: u32,
    pub rp_gid: u32,
    pub rp_size: u64,
    pub time_gran: u32,
    pub uuid: [u8; 16],
    pub ro_compat_version: u32,
}

impl Superblock {
    pub fn hash(&self) -> Option<KeyHash> {
        KeyHash::from_tag(self.key_hash)
    }

    pub fn default_compression(&self) -> Option<Compression> {
        Compression::from_tag(self.default_compr)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Master {
    pub highest_inum: u64,
    pub cmt_no: u64,
    pub flags: u32,
    pub log_lnum: u32,
    pub root: Location,
    pub root_len: u32,
    pub gc_lnum: u32,
    pub ihead: Location,
    pub index_size: u64,
    pub total_free: u64,
    pub total_dirty: u64,
    pub total_used: u64,
    pub total_dead: u64,
    pub total_dark: u64,
    pub lpt: Location,
    pub nhead: Location,
    pub ltab: Location,
    pub lsave: Location,
    pub lscan_lnum: u32,
    pub empty_lebs: u32,
    pub idx_lebs: u32,
    pub leb_cnt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Branch {
    pub key: Key,
    pub loc: Location,

    /// Length of the child node, or 0 if not recorded
    pub len: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexNode {
    /// 0 for nodes whose branches point at leaves
    pub level: u16,
    pub branches: Vec<Branch>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LebRef {
    pub lnum: u32,
    pub offs: u32,
    pub jhead: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitStart {
    pub cmt_no: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Orphan {
    pub cmt_no: u64,

    /// Set on the last orphan node written by a commit
    pub last: bool,
    pub inums: Vec<u64>,
}

/// Parse a fixed-layout record off the front of `bytes`, returning whatever follows it
fn read_fixed<'a, T: DekuContainerRead<'a>>(
    bytes: &'a [u8],
    loc: Location,
    what: &str,
) -> Result<(&'a [u8], T)> {
    let ((rest, _), value) =
        T::from_bytes((bytes, 0)).map_err(|e| Error::truncated(loc, format!("{what}: {e}")))?;
    Ok((rest, value))
}

fn leaf_key(raw: &[u8], loc: Location, expected: KeyKind) -> Result<Key> {
    let key = Key::decode(raw).ok_or_else(|| Error::CorruptPayload {
        loc,
        detail: "leaf key has an unknown kind".into(),
    })?;
    if key.kind != expected {
        return Err(Error::CorruptPayload {
            loc,
            detail: format!("{} key in a {expected} node", key.kind),
        });
    }
    Ok(key)
}

/// Validate the magic, length and CRC of the node starting at `buf[0]`.
///
/// `buf` runs from the node to (at most) the end of its LEB.
pub(crate) fn check_header(buf: &[u8], loc: Location) -> Result<ChHdr> {
    if buf.len() < COMMON_HEADER_SIZE {
        return Err(Error::truncated(
            loc,
            format!("only {} bytes left in the LEB", buf.len()),
        ));
    }

    let (_, ch) = read_fixed::<ChHdr>(buf, loc, "common header")?;
    if ch.magic != NODE_MAGIC {
        return Err(Error::BadMagic {
            loc,
            found: ch.magic,
        });
    }

    let len = ch.len as usize;
    if len < COMMON_HEADER_SIZE || len > buf.len() {
        return Err(Error::truncated(
            loc,
            format!("node length {len} with {} bytes left in the LEB", buf.len()),
        ));
    }

    let actual = UBI_CRC.checksum(&buf[CRC_START..len]);
    if actual != ch.crc {
        return Err(Error::ChecksumMismatch {
            loc,
            tag: ch.node_type,
            expected: ch.crc,
            actual,
        });
    }

    Ok(ch)
}

/// Decode the node starting at `buf[0]`, found at `loc`.
pub fn decode_node(buf: &[u8], loc: Location) -> Result<Node> {
    let ch = check_header(buf, loc)?;

    let node_type = NodeType::from_tag(ch.node_type).ok_or(Error::UnknownNodeType {
        loc,
        tag: ch.node_type,
    })?;

    let len = ch.len as usize;
    if len < node_type.min_len() {
        return Err(Error::truncated(
            loc,
            format!("{node_type} node of {len} bytes, need {}", node_type.min_len()),
        ));
    }
    let payload = &buf[COMMON_HEADER_SIZE..len];

    let body = match node_type {
        NodeType::Inode => NodeBody::Inode(decode_inode(payload, loc)?),
        NodeType::Data => NodeBody::Data(decode_data(payload, loc)?),
        NodeType::DirEntry => NodeBody::DirEntry(decode_dent(payload, loc, KeyKind::DirEntry)?),
        NodeType::XattrEntry => {
            NodeBody::XattrEntry(decode_dent(payload, loc, KeyKind::XattrEntry)?)
        }
        NodeType::Truncation => {
            let (_, hdr) = read_fixed::<TrunNodeHdr>(payload, loc, "truncation node")?;
            NodeBody::Truncation(Truncation {
                inum: hdr.inum,
                old_size: hdr.old_size,
                new_size: hdr.new_size,
            })
        }
        NodeType::Padding => {
            let (_, hdr) = read_fixed::<PadNodeHdr>(payload, loc, "padding node")?;
            NodeBody::Padding(Padding {
                pad_len: hdr.pad_len,
            })
        }
        NodeType::Superblock => NodeBody::Superblock(decode_superblock(payload, loc)?),
        NodeType::Master => NodeBody::Master(decode_master(payload, loc)?),
        NodeType::Ref => {
            let (_, hdr) = read_fixed::<RefNodeHdr>(payload, loc, "reference node")?;
            NodeBody::Ref(LebRef {
                lnum: hdr.lnum,
                offs: hdr.offs,
                jhead: hdr.jhead,
            })
        }
        NodeType::Index => NodeBody::Index(decode_index(payload, loc)?),
        NodeType::CommitStart => {
            let (_, hdr) = read_fixed::<CsNodeHdr>(payload, loc, "commit start node")?;
            NodeBody::CommitStart(CommitStart { cmt_no: hdr.cmt_no })
        }
        NodeType::Orphan => {
            const LAST_ORPHAN: u64 = 1 << 63;

            let (rest, hdr) = read_fixed::<CsNodeHdr>(payload, loc, "orphan node")?;
            let inums = rest
                .chunks_exact(8)
                .filter_map(|x| x.try_into().ok().map(u64::from_le_bytes))
                .collect();
            NodeBody::Orphan(Orphan {
                cmt_no: hdr.cmt_no & !LAST_ORPHAN,
                last: hdr.cmt_no & LAST_ORPHAN != 0,
                inums,
            })
        }
    };

    log::trace!("decoded {node_type} node at {loc}");

    Ok(Node {
        loc,
        header: CommonHeader {
            crc: ch.crc,
            sqnum: ch.sqnum,
            len: ch.len,
            node_type,
            group_type: ch.group_type,
        },
        body,
    })
}

fn decode_inode(payload: &[u8], loc: Location) -> Result<Inode> {
    let (rest, hdr) = read_fixed::<InoNodeHdr>(payload, loc, "inode node")?;
    let data = rest
        .get(..hdr.data_len as usize)
        .ok_or_else(|| {
            Error::truncated(
                loc,
                format!("inode data of {} bytes, {} present", hdr.data_len, rest.len()),
            )
        })?
        .to_vec();

    Ok(Inode {
        key: leaf_key(&hdr.key, loc, KeyKind::Inode)?,
        creat_sqnum: hdr.creat_sqnum,
        size: hdr.size,
        atime: Timestamp {
            sec: hdr.atime_sec,
            nsec: hdr.atime_nsec,
        },
        ctime: Timestamp {
            sec: hdr.ctime_sec,
            nsec: hdr.ctime_nsec,
        },
        mtime: Timestamp {
            sec: hdr.mtime_sec,
            nsec: hdr.mtime_nsec,
        },
        nlink: hdr.nlink,
        uid: hdr.uid,
        gid: hdr.gid,
        mode: hdr.mode,
        flags: hdr.flags,
        xattr_cnt: hdr.xattr_cnt,
        xattr_size: hdr.xattr_size,
        xattr_names: hdr.xattr_names,
        compr_type: hdr.compr_type,
        data,
    })
}

fn decode_data(payload: &[u8], loc: Location) -> Result<DataBlock> {
    let (rest, hdr) = read_fixed::<DataNodeHdr>(payload, loc, "data node")?;
    Ok(DataBlock {
        loc,
        key: leaf_key(&hdr.key, loc, KeyKind::Data)?,
        size: hdr.size,
        compr_type: hdr.compr_type,
        payload: rest.to_vec(),
    })
}

fn decode_dent(payload: &[u8], loc: Location, kind: KeyKind) -> Result<DirEntry> {
    let (rest, hdr) = read_fixed::<DentNodeHdr>(payload, loc, "directory entry node")?;

    let nlen = hdr.nlen as usize;
    if nlen > MAX_NAME_LEN {
        return Err(Error::CorruptPayload {
            loc,
            detail: format!("name length {nlen}"),
        });
    }
    let name = rest
        .get(..nlen)
        .ok_or_else(|| Error::truncated(loc, format!("name of {nlen} bytes, {} present", rest.len())))?
        .to_vec();

    let file_type = FileType::from_dent_type(hdr.dtype).ok_or_else(|| Error::CorruptPayload {
        loc,
        detail: format!("unknown entry type {}", hdr.dtype),
    })?;

    Ok(DirEntry {
        key: leaf_key(&hdr.key, loc, kind)?,
        inum: hdr.inum,
        file_type,
        cookie: hdr.cookie,
        name,
    })
}

fn decode_superblock(payload: &[u8], loc: Location) -> Result<Superblock> {
    let (_, hdr) = read_fixed::<SbNodeHdr>(payload, loc, "superblock node")?;
    Ok(Superblock {
        key_hash: hdr.key_hash,
        key_fmt: hdr.key_fmt,
        flags: hdr.flags,
        min_io_size: hdr.min_io_size,
        leb_size: hdr.leb_size,
        leb_cnt: hdr.leb_cnt,
        max_leb_cnt: hdr.max_leb_cnt,
        max_bud_bytes: hdr.max_bud_bytes,
        log_lebs: hdr.log_lebs,
        lpt_lebs: hdr.lpt_lebs,
        orph_lebs: hdr.orph_lebs,
        jhead_cnt: hdr.jhead_cnt,
        fanout: hdr.fanout,
        lsave_cnt: hdr.lsave_cnt,
        fmt_version: hdr.fmt_version,
        default_compr: hdr.default_compr,
        rp_uid: hdr.rp_uid,
        rp_gid: hdr.rp_gid,
        rp_size: hdr.rp_size,
        time_gran: hdr.time_gran,
        uuid: hdr.uuid,
        ro_compat_version: hdr.ro_compat_version,
    })
}

fn decode_master(payload: &[u8], loc: Location) -> Result<Master> {
    let (_, hdr) = read_fixed::<MstNodeHdr>(payload, loc, "master node")?;
    Ok(Master {
        highest_inum: hdr.highest_inum,
        cmt_no: hdr.cmt_no,
        flags: hdr.flags,
        log_lnum: hdr.log_lnum,
        root: Location::new(hdr.root_lnum, hdr.root_offs),
        root_len: hdr.root_len,
        gc_lnum: hdr.gc_lnum,
        ihead: Location::new(hdr.ihead_lnum, hdr.ihead_offs),
        index_size: hdr.index_size,
        total_free: hdr.total_free,
        total_dirty: hdr.total_dirty,
        total_used: hdr.total_used,
        total_dead: hdr.total_dead,
        total_dark: hdr.total_dark,
        lpt: Location::new(hdr.lpt_lnum, hdr.lpt_offs),
        nhead: Location::new(hdr.nhead_lnum, hdr.nhead_offs),
        ltab: Location::new(hdr.ltab_lnum, hdr.ltab_offs),
        lsave: Location::new(hdr.lsave_lnum, hdr.lsave_offs),
        lscan_lnum: hdr.lscan_lnum,
        empty_lebs: hdr.empty_lebs,
        idx_lebs: hdr.idx_lebs,
        leb_cnt: hdr.leb_cnt,
    })
}

fn decode_index(payload: &[u8], loc: Location) -> Result<IndexNode> {
    let (mut rest, hdr) = read_fixed::<IdxNodeHdr>(payload, loc, "index node")?;
    if hdr.child_cnt == 0 {
        return Err(Error::structural(loc, "index node without branches"));
    }

    let mut branches: Vec<Branch> = Vec::with_capacity(hdr.child_cnt.into());
    for i in 0..hdr.child_cnt {
        let (next, raw) = read_fixed::<BranchHdr>(rest, loc, "index branch")?;
        rest = next;

        let key = Key::decode(&raw.key)
            .ok_or_else(|| Error::structural(loc, format!("branch {i} has an invalid key")))?;

        if let Some(prev) = branches.last() {
            let ordered = prev.key < key || (prev.key == key && key.kind.is_hashed());
            if !ordered {
                return Err(Error::structural(
                    loc,
                    format!("branch {i} key {key} does not follow {}", prev.key),
                ));
            }
        }

        branches.push(Branch {
            key,
            loc: Location::new(raw.lnum, raw.offs),
            len: raw.len,
        });
    }

    Ok(IndexNode {
        level: hdr.level,
        branches,
    })
}

/// Read and decode the node at `loc` in a UBIFS volume.
///
/// Only the node's own bytes are read, so this costs two small reads regardless of LEB size.
pub fn decode_at<S: ImageSource>(volume: &Volume<'_, S>, loc: Location) -> Result<Node> {
    let leb = volume.resolve(loc.lnum)?;
    let remaining = leb.len.checked_sub(loc.offs).ok_or_else(|| {
        Error::truncated(loc, format!("offset past LEB end {:#x}", leb.len))
    })? as usize;

    let mut header = vec![0u8; COMMON_HEADER_SIZE.min(remaining)];
    volume.read(loc.lnum, loc.offs, &mut header)?;
    let ch = match read_fixed::<ChHdr>(&header, loc, "common header") {
        Ok((_, ch)) => ch,
        Err(_) => return decode_node(&header, loc),
    };
    if ch.magic != NODE_MAGIC {
        return Err(Error::BadMagic {
            loc,
            found: ch.magic,
        });
    }

    let len = (ch.len as usize).clamp(COMMON_HEADER_SIZE, remaining);
    let mut buf = vec![0u8; len];
    volume.read(loc.lnum, loc.offs, &mut buf)?;

    if (ch.len as usize) > remaining {
        return Err(Error::truncated(
            loc,
            format!("node length {} with {remaining} bytes left in the LEB", ch.len),
        ));
    }
    decode_node(&buf, loc)
}
