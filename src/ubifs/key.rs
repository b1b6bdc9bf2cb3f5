//! Index keys and the directory-entry name hashes.
//!
//! A key is stored on flash as two little-endian words: the inode number, then the key kind in
//! the top 3 bits over a 29-bit kind-specific value (block number for data, name hash for
//! directory and xattr entries, zero otherwise). Keys compare as `(inum, kind, value)`.

use std::fmt;
use std::str::FromStr;

use crate::config::ParseConfigError;

const KIND_SHIFT: u32 = 29;
const VALUE_MASK: u32 = (1 << KIND_SHIFT) - 1;

/// On-flash size of the part of a key this crate understands; key fields are padded to 16 bytes
pub const KEY_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyKind {
    Inode,
    Data,
    DirEntry,
    XattrEntry,
    Truncation,
}

impl KeyKind {
    pub fn from_tag(tag: u32) -> Option<Self> {
        Some(match tag {
            0 => Self::Inode,
            1 => Self::Data,
            2 => Self::DirEntry,
            3 => Self::XattrEntry,
            4 => Self::Truncation,
            _ => return None,
        })
    }

    pub fn tag(self) -> u32 {
        self as u32
    }

    /// Kinds whose value is a name hash, where distinct nodes may share a key
    pub fn is_hashed(self) -> bool {
        matches!(self, Self::DirEntry | Self::XattrEntry)
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Inode => "inode",
            Self::Data => "data",
            Self::DirEntry => "dent",
            Self::XattrEntry => "xent",
            Self::Truncation => "trun",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    pub inum: u32,
    pub kind: KeyKind,
    pub value: u32,
}

impl Key {
    pub fn new(inum: u32, kind: KeyKind, value: u32) -> Self {
        Self {
            inum,
            kind,
            value: value & VALUE_MASK,
        }
    }

    pub fn inode(inum: u32) -> Self {
        Self::new(inum, KeyKind::Inode, 0)
    }

    pub fn data(inum: u32, block: u32) -> Self {
        Self::new(inum, KeyKind::Data, block)
    }

    pub fn dir_entry(inum: u32, hash: u32) -> Self {
        Self::new(inum, KeyKind::DirEntry, hash)
    }

    pub fn xattr_entry(inum: u32, hash: u32) -> Self {
        Self::new(inum, KeyKind::XattrEntry, hash)
    }

    /// The smallest key of `kind` for `inum`
    pub fn first(inum: u32, kind: KeyKind) -> Self {
        Self::new(inum, kind, 0)
    }

    /// Parse the 8-byte on-flash form; `None` if the kind is not one UBIFS defines.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let inum = u32::from_le_bytes(bytes.get(0..4)?.try_into().ok()?);
        let word = u32::from_le_bytes(bytes.get(4..8)?.try_into().ok()?);
        let kind = KeyKind::from_tag(word >> KIND_SHIFT)?;
        Some(Self::new(inum, kind, word))
    }

    pub fn encode(&self) -> [u8; KEY_SIZE] {
        let mut out = [0u8; KEY_SIZE];
        out[..4].copy_from_slice(&self.inum.to_le_bytes());
        out[4..].copy_from_slice(&((self.kind.tag() << KIND_SHIFT) | self.value).to_le_bytes());
        out
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{:#010x}", self.inum, self.kind, self.value)
    }
}

/// The hash applied to names in directory and xattr entry keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KeyHash {
    /// The "r5" hash, used by every real-world filesystem
    #[default]
    R5,

    /// The first four bytes of the name, for debugging hash collisions
    Test,
}

impl KeyHash {
    /// Decode the superblock `key_hash` field
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::R5),
            1 => Some(Self::Test),
            _ => None,
        }
    }

    pub fn hash(self, name: &[u8]) -> u32 {
        let a = match self {
            Self::R5 => name.iter().fold(0u32, |a, &b| {
                // Bytes are sign-extended, as C's `signed char` would be
                let c = b as i8 as i32;
                a.wrapping_add((c << 4) as u32)
                    .wrapping_add((c >> 4) as u32)
                    .wrapping_mul(11)
            }),
            Self::Test => {
                let mut word = [0u8; 4];
                let len = name.len().min(4);
                word[..len].copy_from_slice(&name[..len]);
                u32::from_le_bytes(word)
            }
        };

        // 0, 1 and 2 are reserved for "." / ".." / end-of-directory cookies
        match a & VALUE_MASK {
            x if x <= 2 => x + 3,
            x => x,
        }
    }
}

impl FromStr for KeyHash {
    type Err = ParseConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "r5" => Ok(Self::R5),
            "test" => Ok(Self::Test),
            _ => Err(ParseConfigError::new("key hash", s, "r5 or test")),
        }
    }
}

impl fmt::Display for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::R5 => "r5",
            Self::Test => "test",
        })
    }
}

#[test]
fn test_key_order() {
    let inum = 65;
    let mut keys = vec![
        Key::dir_entry(inum, 5),
        Key::data(inum, 0),
        Key::inode(inum + 1),
        Key::inode(inum),
        Key::data(inum, 9),
    ];
    keys.sort();
    assert_eq!(
        keys,
        vec![
            Key::inode(inum),
            Key::data(inum, 0),
            Key::data(inum, 9),
            Key::dir_entry(inum, 5),
            Key::inode(inum + 1),
        ]
    );

    let key = Key::dir_entry(7, 0x1234567);
    assert_eq!(Key::decode(&key.encode()), Some(key));
    assert_eq!(Key::decode(&[1, 0, 0, 0, 0, 0, 0, 0xE0]), None);
}

#[test]
fn test_hashes() {
    // Short names cannot hash into the reserved range
    assert!(KeyHash::R5.hash(b"") > 2);
    assert!(KeyHash::Test.hash(b"\x01") > 2);

    assert_eq!(KeyHash::Test.hash(b"abcd"), 0x6463_6261 & VALUE_MASK);
    assert_eq!(KeyHash::Test.hash(b"abcd1"), KeyHash::Test.hash(b"abcd2"));

    // One byte: (b << 4) + (b >> 4), times 11
    assert_eq!(KeyHash::R5.hash(b"a"), ((0x61 << 4) + (0x61 >> 4)) * 11);
    assert_ne!(KeyHash::R5.hash(b"abcd1"), KeyHash::R5.hash(b"abcd2"));

    // High bytes are sign-extended
    let high = KeyHash::R5.hash(&[0x80]);
    let expected = ((-128i32 << 4) as u32)
        .wrapping_add((-8i32) as u32)
        .wrapping_mul(11)
        & VALUE_MASK;
    assert_eq!(high, expected);

    assert_eq!("R5".parse(), Ok(KeyHash::R5));
    assert!("crc".parse::<KeyHash>().is_err());
}
