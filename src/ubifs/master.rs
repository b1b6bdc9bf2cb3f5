//! Finding the superblock and the authoritative master node.
//!
//! The master node is rewritten on every commit, appended to LEB 1 and LEB 2 in turn at
//! `min_io_size`-aligned offsets. The newest valid node of each LEB is that LEB's candidate, and
//! the newer of the two candidates names the index root.

use std::str::FromStr;

use super::key::KeyHash;
use super::node::{decode_at, Master, NodeBody, Superblock, COMMON_HEADER_SIZE};
use super::Location;
use crate::config::{Config, ParseConfigError};
use crate::error::{Error, Result};
use crate::image::{ImageSource, PageUtil};
use crate::redundant;
use crate::trace::Trace;
use crate::ubi::Volume;

pub const SUPERBLOCK_LNUM: u32 = 0;
pub const MASTER_LNUMS: [u32; 2] = [1, 2];

/// Nodes are never closer together than this, whatever `min_io_size` says
const NODE_ALIGN: u32 = 8;

/// Which master LEB to trust
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MasterCopy {
    /// Whichever holds the newest valid node
    #[default]
    Auto,
    First,
    Second,
}

/// `auto`, `0` or `1`
impl FromStr for MasterCopy {
    type Err = ParseConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "0" => Ok(Self::First),
            "1" => Ok(Self::Second),
            _ => Err(ParseConfigError::new("master copy", s, "auto, 0 or 1")),
        }
    }
}

/// Everything needed to start reading the index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMaster {
    pub superblock: Superblock,
    pub master: Master,

    /// Where the chosen master node was found
    pub loc: Location,
    pub sqnum: u64,

    /// Which master LEB (0 or 1) it came from
    pub copy: usize,

    /// The index root, after applying any override
    pub root: Location,
    pub root_len: u32,
    pub key_hash: KeyHash,
}

pub fn read_superblock<S: ImageSource>(volume: &Volume<'_, S>) -> Result<Superblock> {
    let loc = Location::new(SUPERBLOCK_LNUM, 0);
    let node = decode_at(volume, loc)?;
    match node.body {
        NodeBody::Superblock(sb) => Ok(sb),
        _ => Err(Error::structural(
            loc,
            format!("expected a superblock, found a {} node", node.header.node_type),
        )),
    }
}

fn align_up(value: u32, align: u32) -> Option<u32> {
    value.checked_add(align - 1).map(|x| x / align * align)
}

/// Walk the master nodes in one LEB and return the newest valid one.
///
/// The walk ends at the first erased or unrecognizable region. Damaged master nodes are reported
/// to `trace`.
pub fn scan_master_leb<S: ImageSource>(
    volume: &Volume<'_, S>,
    lnum: u32,
    min_io_size: u32,
    trace: &mut Trace,
) -> Result<Option<(Location, u64, Master)>> {
    let leb = match volume.resolve(lnum) {
        Ok(x) => x,
        Err(e) => {
            trace.tolerate(e)?;
            return Ok(None);
        }
    };
    let align = min_io_size.max(NODE_ALIGN);

    let mut candidates = Vec::new();
    let mut offs = 0u32;
    while u64::from(offs) + COMMON_HEADER_SIZE as u64 <= u64::from(leb.len) {
        let loc = Location::new(lnum, offs);

        let mut head = [0u8; COMMON_HEADER_SIZE];
        volume.read(lnum, offs, &mut head)?;
        if head.is_erased() {
            break;
        }
        let len = u32::from_le_bytes([head[16], head[17], head[18], head[19]]);

        trace.visit()?;
        match decode_at(volume, loc) {
            Ok(node) => match node.body {
                NodeBody::Master(master) => {
                    candidates.push(Some((loc, node.header.sqnum, master)));
                }
                _ => log::debug!(
                    "{loc}: skipping {} node in master LEB",
                    node.header.node_type
                ),
            },
            Err(Error::BadMagic { .. }) => {
                log::debug!("{loc}: end of master nodes");
                break;
            }
            Err(e @ Error::Truncated { .. }) => {
                trace.tolerate(e)?;
                break;
            }
            Err(e) => trace.tolerate(e)?,
        }

        match align_up(len.max(COMMON_HEADER_SIZE as u32), align) {
            Some(step) => match offs.checked_add(step) {
                Some(x) => offs = x,
                None => break,
            },
            None => break,
        }
    }

    Ok(redundant::newest(candidates, |(_, sqnum, _)| *sqnum).map(|(_, x)| x))
}

/// Read the superblock and pick the master node, honoring the overrides in `config`.
pub fn resolve<S: ImageSource>(
    volume: &Volume<'_, S>,
    config: &Config,
    trace: &mut Trace,
) -> Result<ResolvedMaster> {
    let superblock = read_superblock(volume)?;
    log::debug!(
        "superblock: LEB size {:#x}, min I/O {}, fanout {}",
        superblock.leb_size,
        superblock.min_io_size,
        superblock.fanout
    );

    if superblock.key_fmt != 0 {
        return Err(Error::UnsupportedFeature(format!(
            "key format {}",
            superblock.key_fmt
        )));
    }
    let key_hash = match config.key_hash {
        Some(x) => x,
        None => superblock.hash().ok_or_else(|| {
            Error::UnsupportedFeature(format!("key hash {}", superblock.key_hash))
        })?,
    };

    let mut copies = Vec::with_capacity(MASTER_LNUMS.len());
    for lnum in MASTER_LNUMS {
        copies.push(scan_master_leb(volume, lnum, superblock.min_io_size, trace)?);
    }

    let chosen = match config.master {
        MasterCopy::Auto => redundant::newest(copies, |(_, sqnum, _)| *sqnum),
        MasterCopy::First => copies.into_iter().next().flatten().map(|x| (0, x)),
        MasterCopy::Second => copies.into_iter().nth(1).flatten().map(|x| (1, x)),
    };
    let Some((copy, (loc, sqnum, master))) = chosen else {
        return Err(Error::IndexUnavailable(match config.master {
            MasterCopy::Auto => "neither master LEB holds a valid master node".into(),
            x => format!("requested master copy {x:?} is not valid"),
        }));
    };
    log::debug!("master node at {loc} (copy {copy}), sqnum {sqnum}, commit {}", master.cmt_no);

    let (root, root_len) = match config.index_root {
        Some(root) => (root, 0),
        None => (master.root, master.root_len),
    };

    Ok(ResolvedMaster {
        superblock,
        master,
        loc,
        sqnum,
        copy,
        root,
        root_len,
        key_hash,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fixture::{FsBuilder, UbiBuilder};
    use crate::ubi::UbiImage;

    fn open(fs: &FsBuilder) -> anyhow::Result<UbiImage<Vec<u8>>> {
        let image = UbiBuilder::new()
            .dynamic_volume(0, "rootfs", fs.lebs())
            .build();
        Ok(UbiImage::open(image, &Config::new())?)
    }

    #[test]
    fn test_newest_master() -> anyhow::Result<()> {
        // Copy 0 holds sequence numbers 3 and 5, copy 1 holds 7
        let mut fs = FsBuilder::new();
        fs.file(1, "a", b"a");
        fs.commit_masters(&[&[3, 5], &[7]]);

        let ubi = open(&fs)?;
        let vol = ubi.volume(0)?;
        let mut trace = Trace::new();

        let resolved = resolve(&vol, &Config::new(), &mut trace)?;
        assert_eq!(resolved.copy, 1);
        assert_eq!(resolved.sqnum, 7);
        assert_eq!(resolved.key_hash, KeyHash::R5);

        let resolved = resolve(&vol, &Config::new().master(MasterCopy::First), &mut trace)?;
        assert_eq!(resolved.copy, 0);
        assert_eq!(resolved.sqnum, 5);

        assert!(trace.warnings().is_empty());
        Ok(())
    }

    #[test]
    fn test_one_valid_master() -> anyhow::Result<()> {
        let mut fs = FsBuilder::new();
        fs.file(1, "a", b"a");
        fs.commit_masters(&[&[5], &[7]]);
        fs.corrupt(Location::new(MASTER_LNUMS[1], 0), 40);

        let ubi = open(&fs)?;
        let vol = ubi.volume(0)?;

        let mut trace = Trace::new();
        let resolved = resolve(&vol, &Config::new(), &mut trace)?;
        assert_eq!(resolved.sqnum, 5);
        assert_eq!(trace.warnings().len(), 1);

        let mut strict = Trace::new().strict(true);
        assert!(matches!(
            resolve(&vol, &Config::new(), &mut strict),
            Err(Error::ChecksumMismatch { .. })
        ));

        let mut trace = Trace::new();
        fs.corrupt(Location::new(MASTER_LNUMS[0], 0), 40);
        let ubi = open(&fs)?;
        assert!(matches!(
            resolve(&ubi.volume(0)?, &Config::new(), &mut trace),
            Err(Error::IndexUnavailable(_))
        ));
        Ok(())
    }

    #[test]
    fn test_overrides() -> anyhow::Result<()> {
        let mut fs = FsBuilder::new();
        fs.file(1, "a", b"a");
        fs.commit();

        let ubi = open(&fs)?;
        let config = Config::new()
            .index_root(Location::new(9, 0x80))
            .key_hash(KeyHash::Test);
        let resolved = resolve(&ubi.volume(0)?, &config, &mut Trace::new())?;
        assert_eq!(resolved.root, Location::new(9, 0x80));
        assert_eq!(resolved.root_len, 0);
        assert_eq!(resolved.key_hash, KeyHash::Test);
        Ok(())
    }

    #[test]
    fn test_parse_master_copy() {
        assert_eq!("1".parse(), Ok(MasterCopy::Second));
        assert!("2".parse::<MasterCopy>().is_err());
    }
}
