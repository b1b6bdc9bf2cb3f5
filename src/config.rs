//! Caller-provided configuration.
//!
//! Everything that would otherwise be a process-wide default (PEB size, hash algorithm, which
//! master copy to trust) is carried in a [Config] value and passed down explicitly, so that any
//! number of images can be opened side by side.

use std::str::FromStr;

use thiserror::Error;

use crate::ubifs::{KeyHash, Location, MasterCopy};

/// Error returned by the `FromStr` implementations of configuration values
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid {what} {input:?}: expected {expected}")]
pub struct ParseConfigError {
    pub what: &'static str,
    pub input: String,
    pub expected: &'static str,
}

impl ParseConfigError {
    pub(crate) fn new(what: &'static str, input: &str, expected: &'static str) -> Self {
        Self {
            what,
            input: input.to_string(),
            expected,
        }
    }
}

/// Selects a UBI volume either by numeric ID or by name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeSelector {
    Id(u32),
    Name(String),
}

/// Numbers are IDs, anything else is a name
impl FromStr for VolumeSelector {
    type Err = ParseConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseConfigError::new("volume", s, "an ID or a name"));
        }
        Ok(s.parse()
            .map_or_else(|_| Self::Name(s.to_string()), Self::Id))
    }
}

/// How an image should be opened and traversed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    /// The PEB size in bytes, or `None` to probe it from the image.
    pub peb_size: Option<u32>,

    /// Which of the two master node copies to trust.
    pub master: MasterCopy,

    /// Start index lookups at this node instead of the root named by the master node.
    pub index_root: Option<Location>,

    /// The volumes to operate on; empty means all of them.
    pub volumes: Vec<VolumeSelector>,

    /// Override the directory-entry hash recorded in the superblock.
    pub key_hash: Option<KeyHash>,

    /// Fail on damage that would otherwise be skipped with a warning.
    pub strict: bool,

    /// Maximum number of nodes one operation may visit.
    pub node_limit: Option<u64>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a fixed PEB size instead of probing.
    pub fn peb_size(mut self, bytes: u32) -> Self {
        self.peb_size = Some(bytes);
        self
    }

    pub fn master(mut self, master: MasterCopy) -> Self {
        self.master = master;
        self
    }

    pub fn index_root(mut self, loc: Location) -> Self {
        self.index_root = Some(loc);
        self
    }

    /// Add a volume to the selection. May be called multiple times.
    pub fn volume(mut self, volume: VolumeSelector) -> Self {
        self.volumes.push(volume);
        self
    }

    pub fn key_hash(mut self, hash: KeyHash) -> Self {
        self.key_hash = Some(hash);
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn node_limit(mut self, nodes: u64) -> Self {
        self.node_limit = Some(nodes);
        self
    }

    /// Is a volume with this ID and name part of the selection?
    pub fn selects(&self, id: u32, name: &str) -> bool {
        self.volumes.is_empty()
            || self.volumes.iter().any(|sel| match sel {
                VolumeSelector::Id(x) => *x == id,
                VolumeSelector::Name(x) => x == name,
            })
    }
}

#[test]
fn test_volume_selection() {
    let config = Config::new();
    assert!(config.selects(3, "anything"));

    let config = Config::new()
        .volume("rootfs".parse().unwrap())
        .volume("7".parse().unwrap());
    assert!(config.selects(0, "rootfs"));
    assert!(config.selects(7, "data"));
    assert!(!config.selects(1, "data"));

    assert!("".parse::<VolumeSelector>().is_err());
}
