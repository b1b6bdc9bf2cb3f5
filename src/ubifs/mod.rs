//! The UBIFS layer, read on top of one UBI volume.
//!
//! UBIFS stores every piece of metadata and data as a self-describing node somewhere in its
//! volume. Nodes are found through a B+tree (the "index") whose branches are sorted by [Key]; the
//! root of the index is named by the master node, which in turn is found at a fixed place.
//!
//! ```text
//! LEB 0      superblock        geometry, key hash, default compression
//! LEB 1, 2   master nodes      index root, highest inode number, commit number
//! ...        index nodes       key -> (LEB, offset) of the next level or of a leaf
//! ...        leaf nodes        inodes, directory entries, data blocks
//! ```
//!
//! Only what the last commit made reachable from the index root is visible; the journal is not
//! replayed.

mod compress;
mod fs;
mod index;
mod key;
mod master;
pub(crate) mod node;

use std::fmt;
use std::str::FromStr;

use crate::config::ParseConfigError;

pub use compress::{CodecError, Compression};
pub use fs::{DirEntryPath, Ubifs};
pub use index::{Children, IndexTree, Range, Visit, VisitNode, MAX_LEVELS};
pub use key::{Key, KeyHash, KeyKind};
pub use master::{MasterCopy, ResolvedMaster, MASTER_LNUMS, SUPERBLOCK_LNUM};
pub use node::{
    decode_at, decode_node, Branch, CommitStart, CommonHeader, DataBlock, DirEntry, FileType,
    IndexNode, Inode, LebRef, Master, Node, NodeBody, NodeType, Orphan, Padding, Superblock,
    Timestamp, Truncation, COMMON_HEADER_SIZE, NODE_MAGIC,
};

/// Data nodes each hold one block of this many bytes of file content, before compression
pub const BLOCK_SIZE: u64 = 4096;

/// The inode number of the root directory
pub const ROOT_INUM: u32 = 1;

/// Where a node starts: a byte offset within a LEB of the UBIFS volume
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Location {
    pub lnum: u32,
    pub offs: u32,
}

impl Location {
    pub const fn new(lnum: u32, offs: u32) -> Self {
        Self { lnum, offs }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:#x}", self.lnum, self.offs)
    }
}

fn parse_number(s: &str) -> Option<u32> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

/// `LEB:offset`, each either decimal or `0x`-prefixed hex
impl FromStr for Location {
    type Err = ParseConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseConfigError::new("location", s, "LEB:offset");

        let (lnum, offs) = s.split_once(':').ok_or_else(err)?;
        let lnum = parse_number(lnum.trim()).ok_or_else(err)?;
        let offs = parse_number(offs.trim()).ok_or_else(err)?;
        Ok(Self { lnum, offs })
    }
}

#[test]
fn test_parse_location() {
    assert_eq!("12:0x1f0".parse(), Ok(Location::new(12, 0x1F0)));
    assert_eq!("3:64".parse(), Ok(Location::new(3, 64)));
    assert_eq!(Location::new(3, 64).to_string(), "3:0x40");
    assert!("3".parse::<Location>().is_err());
    assert!("x:1".parse::<Location>().is_err());
}
