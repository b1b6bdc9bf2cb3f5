//! Error and warning types shared by every layer.
//!
//! Failures split into two groups. Damage that only affects one PEB or one leaf node is recoverable:
//! callers usually record it as a [Warning] through [crate::Trace] and move on. Everything else
//! (an unreadable index node, no master node, a path that does not exist) is returned as an
//! [Error] and ends the operation.

use std::fmt;

use thiserror::Error;

use crate::ubi::{HeaderError, Rejection};
use crate::ubifs::{Location, NodeType};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The underlying image could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Not a single PEB of the image carries a valid UBI header.
    #[error("not a UBI image: {0}")]
    UnrecognizedImage(String),

    /// The requested volume has no mapped LEBs and no volume table entry.
    #[error("no such volume: {0}")]
    NoSuchVolume(String),

    /// The PEB's UBI headers were not accepted, so it backs no LEB.
    #[error("PEB {pnum} at {offset:#x} rejected: {reason}")]
    RejectedPeb {
        pnum: u32,
        offset: u64,
        reason: Rejection,
    },

    /// A record of one copy of the volume table failed to decode.
    #[error("volume table copy in PEB {pnum}: record {record}: {reason}")]
    BadVolumeTable {
        pnum: u32,
        record: usize,
        reason: HeaderError,
    },

    /// The LEB has no valid PEB backing it.
    #[error("volume {vol_id} LEB {lnum} is not mapped")]
    NotMapped { vol_id: u32, lnum: u32 },

    /// The bytes at a node location do not start with the UBIFS node magic.
    #[error("bad node magic {found:#010x} at {loc}")]
    BadMagic { loc: Location, found: u32 },

    /// A node (or a read) extends past the end of its LEB.
    #[error("truncated node at {loc}: {detail}")]
    Truncated { loc: Location, detail: String },

    #[error("checksum mismatch in node type {tag} at {loc}: stored {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch {
        loc: Location,
        tag: u8,
        expected: u32,
        actual: u32,
    },

    #[error("unknown node type {tag} at {loc}")]
    UnknownNodeType { loc: Location, tag: u8 },

    /// A data node payload failed to decompress, or decompressed to the wrong length.
    #[error("corrupt payload at {loc}: {detail}")]
    CorruptPayload { loc: Location, detail: String },

    /// The node decoded fine but violates an invariant of the index structure.
    #[error("structural corruption at {loc}: {detail}")]
    StructuralCorruption { loc: Location, detail: String },

    #[error("unsupported compression type {0}")]
    UnsupportedCodec(u16),

    #[error("unsupported filesystem feature: {0}")]
    UnsupportedFeature(String),

    #[error("no valid master node: {0}")]
    IndexUnavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("not a symbolic link: {0}")]
    NotASymlink(String),

    /// The per-operation node budget configured in [crate::Config] ran out.
    #[error("node budget of {limit} exhausted")]
    BudgetExhausted { limit: u64 },
}

impl Error {
    /// Bad magic, truncation and malformed structure all mean the same thing to a caller: the
    /// bytes at this location cannot be a valid node.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::BadMagic { .. } | Self::Truncated { .. } | Self::StructuralCorruption { .. }
        )
    }

    /// Can a reader skip over the node (or PEB) that produced this error and keep going?
    pub fn is_node_damage(&self) -> bool {
        self.is_structural()
            || matches!(
                self,
                Self::ChecksumMismatch { .. }
                    | Self::UnknownNodeType { .. }
                    | Self::CorruptPayload { .. }
                    | Self::NotMapped { .. }
                    | Self::RejectedPeb { .. }
                    | Self::BadVolumeTable { .. }
            )
    }

    /// The PEB this error refers to, if any.
    pub fn peb(&self) -> Option<u32> {
        match *self {
            Self::RejectedPeb { pnum, .. } | Self::BadVolumeTable { pnum, .. } => Some(pnum),
            _ => None,
        }
    }

    /// The node location this error refers to, if any.
    pub fn location(&self) -> Option<Location> {
        match *self {
            Self::BadMagic { loc, .. }
            | Self::Truncated { loc, .. }
            | Self::ChecksumMismatch { loc, .. }
            | Self::UnknownNodeType { loc, .. }
            | Self::CorruptPayload { loc, .. }
            | Self::StructuralCorruption { loc, .. } => Some(loc),
            Self::NotMapped { lnum, .. } => Some(Location::new(lnum, 0)),
            _ => None,
        }
    }

    pub(crate) fn structural(loc: Location, detail: impl Into<String>) -> Self {
        Self::StructuralCorruption {
            loc,
            detail: detail.into(),
        }
    }

    pub(crate) fn truncated(loc: Location, detail: impl Into<String>) -> Self {
        Self::Truncated {
            loc,
            detail: detail.into(),
        }
    }
}

/// A recoverable problem, with enough context to log or display it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub peb: Option<u32>,
    pub loc: Option<Location>,
    pub node_type: Option<NodeType>,
    pub expected: Option<u64>,
    pub actual: Option<u64>,
    pub message: String,
}

impl Warning {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            peb: None,
            loc: None,
            node_type: None,
            expected: None,
            actual: None,
            message: message.into(),
        }
    }

    pub fn in_peb(mut self, pnum: u32) -> Self {
        self.peb = Some(pnum);
        self
    }

    pub fn at(mut self, loc: Location) -> Self {
        self.loc = Some(loc);
        self
    }

    pub fn node_type(mut self, node_type: NodeType) -> Self {
        self.node_type = Some(node_type);
        self
    }

    pub fn mismatch(mut self, expected: u64, actual: u64) -> Self {
        self.expected = Some(expected);
        self.actual = Some(actual);
        self
    }
}

impl From<&Error> for Warning {
    fn from(error: &Error) -> Self {
        let mut warning = Self::new(error.to_string());
        warning.peb = error.peb();
        warning.loc = error.location();

        let crc = match *error {
            Error::ChecksumMismatch {
                tag,
                expected,
                actual,
                ..
            } => {
                warning.node_type = NodeType::from_tag(tag);
                Some((expected, actual))
            }
            Error::RejectedPeb {
                reason: Rejection::Ec(header) | Rejection::Vid(header),
                ..
            }
            | Error::BadVolumeTable { reason: header, .. } => match header {
                HeaderError::BadCrc { stored, computed } => Some((stored, computed)),
                _ => None,
            },
            _ => None,
        };
        if let Some((stored, computed)) = crc {
            warning = warning.mismatch(stored.into(), computed.into());
        }

        warning
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(loc) = self.loc {
            write!(f, "[{loc}] ")?;
        }
        if let Some(node_type) = self.node_type {
            write!(f, "{node_type}: ")?;
        }
        f.write_str(&self.message)?;
        if let (Some(expected), Some(actual)) = (self.expected, self.actual) {
            write!(f, " (expected {expected}, got {actual})")?;
        }
        Ok(())
    }
}

#[test]
fn test_error_classes() {
    let loc = Location::new(3, 0x40);

    let magic = Error::BadMagic { loc, found: 0 };
    assert!(magic.is_structural());
    assert!(magic.is_node_damage());
    assert_eq!(magic.location(), Some(loc));

    let crc = Error::ChecksumMismatch {
        loc,
        tag: 1,
        expected: 1,
        actual: 2,
    };
    assert!(!crc.is_structural());
    assert!(crc.is_node_damage());

    let warning = Warning::from(&crc);
    assert_eq!(warning.loc, Some(loc));
    assert_eq!(warning.node_type, Some(NodeType::Data));
    assert_eq!((warning.expected, warning.actual), (Some(1), Some(2)));

    let peb = Error::RejectedPeb {
        pnum: 4,
        offset: 0x10000,
        reason: Rejection::Vid(HeaderError::BadCrc {
            stored: 7,
            computed: 8,
        }),
    };
    assert!(peb.is_node_damage());
    let warning = Warning::from(&peb);
    assert_eq!(warning.peb, Some(4));
    assert_eq!(warning.loc, None);
    assert_eq!((warning.expected, warning.actual), (Some(7), Some(8)));
    assert!(warning.to_string().starts_with("PEB 4 at 0x10000 rejected: VID header"));

    assert!(!Error::UnsupportedCodec(9).is_node_damage());
    assert!(!Error::IndexUnavailable(String::new()).is_node_damage());
}
