//! This module contains code to scan PEBs and determine their contents (per UBI).

use thiserror::Error;

use super::headers::*;
use crate::error::Result;
use crate::image::ImageSource;

/// The first ID reserved for UBI's own volumes; user volume IDs are all below it
pub const INTERNAL_VOLUME_START: u32 = 0x7FFF_EFFF;

/// The internal volume holding the volume table
pub const LAYOUT_VOLUME_ID: u32 = INTERNAL_VOLUME_START;

/// The internal volume holding the fastmap superblock
pub const FASTMAP_SB_VOLUME_ID: u32 = INTERNAL_VOLUME_START + 1;

/// PEB sizes tried by [probe_peb_size], in order
const PROBE_SIZES: std::ops::RangeInclusive<u32> = 10..=21;

/// How many PEBs [validate_at] looks at, from the start of the image
const PROBE_SAMPLES: u64 = 64;

/// Why a PEB was excluded from the LEB mapping
#[derive(Debug, Error, Eq, PartialEq, Copy, Clone)]
pub enum Rejection {
    #[error("EC header: {0}")]
    Ec(HeaderError),

    #[error("VID header: {0}")]
    Vid(HeaderError),

    #[error("header offsets outside the PEB (VID at {vid_hdr_offset:#x}, data at {data_offset:#x})")]
    BadOffsets {
        vid_hdr_offset: u32,
        data_offset: u32,
    },
}

/// These are the states that a given PEB may be detected in
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum BlockContent {
    /// The PEB is fully erased, perhaps because UBI has never used it
    Erased,

    /// The PEB has a UBI EC header but is not mapped to any LEB
    EcOnly(Ec),

    /// The PEB is in normal use, holding the LEB named by the VID header
    Data(Ec, Vid),

    /// The PEB is in some other (invalid, per UBI) state, and must not be trusted
    Rejected(Rejection),
}

impl BlockContent {
    /// Read the headers of the PEB starting at `start` and characterize its content
    fn scan_block<S: ImageSource + ?Sized>(source: &S, start: u64, peb_size: u32) -> Result<Self> {
        let mut buf = [0u8; Ec::SIZE];
        source.read_at(start, &mut buf)?;

        let ec = match Ec::decode(&buf) {
            Ok(x) => x,
            Err(HeaderError::Erased) => return Ok(Self::Erased),
            Err(e) => return Ok(Self::Rejected(Rejection::Ec(e))),
        };

        let vid_end = u64::from(ec.vid_hdr_offset) + Vid::SIZE as u64;
        if vid_end > u64::from(ec.data_offset) || ec.data_offset >= peb_size {
            return Ok(Self::Rejected(Rejection::BadOffsets {
                vid_hdr_offset: ec.vid_hdr_offset,
                data_offset: ec.data_offset,
            }));
        }

        let mut buf = [0u8; Vid::SIZE];
        source.read_at(start + u64::from(ec.vid_hdr_offset), &mut buf)?;

        Ok(match Vid::decode(&buf) {
            Ok(vid) => Self::Data(ec, vid),
            Err(HeaderError::Erased) => Self::EcOnly(ec),
            Err(e) => Self::Rejected(Rejection::Vid(e)),
        })
    }

    pub fn ec(&self) -> Option<&Ec> {
        match self {
            Self::EcOnly(ec) | Self::Data(ec, _) => Some(ec),
            _ => None,
        }
    }

    pub fn vid(&self) -> Option<&Vid> {
        match self {
            Self::Data(_, vid) => Some(vid),
            _ => None,
        }
    }

    /// Does this PEB belong to the layout volume?
    pub fn is_layout(&self) -> bool {
        self.vid().map_or(false, |x| x.vol_id == LAYOUT_VOLUME_ID)
    }
}

/// The (E)rase(b)lock (t)able. A map of every PEB in the image as determined by [scan_blocks],
/// indexed by PEB number.
pub type Ebt = Box<[BlockContent]>;

/// Read the headers of every whole PEB in the image, return the [Ebt]
pub fn scan_blocks<S: ImageSource + ?Sized>(source: &S, peb_size: u32) -> Result<Ebt> {
    let block_count = source.len() / u64::from(peb_size);
    let rpt = howudoin::new()
        .label("Scanning blocks")
        .set_len(block_count);

    let mut ebt = Vec::with_capacity(block_count as usize);
    for pnum in 0..block_count {
        let content = BlockContent::scan_block(source, pnum * u64::from(peb_size), peb_size)?;
        match content {
            BlockContent::Rejected(reason) => log::debug!("PEB {pnum}: rejected, {reason}"),
            BlockContent::Data(_, vid) => {
                log::trace!("PEB {pnum}: volume {} LEB {}", vid.vol_id, vid.lnum)
            }
            _ => (),
        }
        rpt.inc();
        ebt.push(content);
    }

    rpt.close();

    Ok(ebt.into())
}

/// Does the image look like a UBI image with PEBs of `size` bytes?
///
/// Two neighbouring PEBs among the first [PROBE_SAMPLES] must carry valid EC headers that agree
/// on their offsets and image sequence number, with the data offset inside the PEB. Looking for
/// a pair rather than at PEB 0 alone lets a worn first PEB pass, while a size smaller than the
/// real one never lines up two headers. An image exactly one PEB long only needs its own header.
pub fn validate_at<S: ImageSource + ?Sized>(source: &S, size: u32) -> bool {
    let valid_ec = |offset: u64| {
        let mut buf = [0u8; Ec::SIZE];
        source
            .read_at(offset, &mut buf)
            .ok()
            .and_then(|_| Ec::decode(&buf).ok())
            .filter(|ec| ec.data_offset < size)
    };

    let size64 = u64::from(size);
    if source.len() < size64 {
        return false;
    }
    if source.len() == size64 {
        return valid_ec(0).is_some();
    }

    let blocks = (source.len() / size64).min(PROBE_SAMPLES);
    let mut prev: Option<Ec> = None;
    for pnum in 0..blocks {
        let ec = valid_ec(pnum * size64);
        if let (Some(a), Some(b)) = (&prev, &ec) {
            if a.vid_hdr_offset == b.vid_hdr_offset
                && a.data_offset == b.data_offset
                && a.image_seq == b.image_seq
            {
                return true;
            }
        }
        prev = ec;
    }
    false
}

/// Find the PEB size by trying the powers of two from 1 KiB through 2 MiB, smallest first
pub fn probe_peb_size<S: ImageSource + ?Sized>(source: &S) -> Option<u32> {
    PROBE_SIZES
        .map(|shift| 1u32 << shift)
        .find(|&size| validate_at(source, size))
}

#[cfg(test)]
mod test {
    use super::*;

    const PEB: u32 = 4096;

    fn ec() -> Ec {
        Ec {
            ec: 1,
            vid_hdr_offset: 64,
            data_offset: 128,
            image_seq: 0,
        }
    }

    fn put(image: &mut [u8], at: usize, bytes: &[u8]) {
        image[at..at + bytes.len()].copy_from_slice(bytes);
    }

    #[test]
    fn test_scan() -> anyhow::Result<()> {
        let peb = PEB as usize;
        let mut image = vec![0xFF; peb * 6];

        let vid = Vid {
            vol_id: 3,
            lnum: 5,
            sqnum: 9,
            ..Default::default()
        };

        // 0: in use
        put(&mut image, 0, &ec().encode());
        put(&mut image, 64, &vid.encode());
        // 1: erased
        // 2: EC header but no VID header
        put(&mut image, 2 * peb, &ec().encode());
        // 3: corrupt EC header
        let mut bad = ec().encode();
        bad[20] ^= 0x55;
        put(&mut image, 3 * peb, &bad);
        // 4: corrupt VID header
        put(&mut image, 4 * peb, &ec().encode());
        let mut bad = vid.encode();
        bad[12] ^= 0x55;
        put(&mut image, 4 * peb + 64, &bad);
        // 5: garbage
        put(&mut image, 5 * peb, &[0xAA; 100]);

        let ebt = scan_blocks(&image, PEB)?;
        assert_eq!(ebt.len(), 6);
        assert_eq!(ebt[0], BlockContent::Data(ec(), vid));
        assert_eq!(ebt[1], BlockContent::Erased);
        assert_eq!(ebt[2], BlockContent::EcOnly(ec()));
        assert!(matches!(
            ebt[3],
            BlockContent::Rejected(Rejection::Ec(HeaderError::BadCrc { .. }))
        ));
        assert!(matches!(
            ebt[4],
            BlockContent::Rejected(Rejection::Vid(HeaderError::BadCrc { .. }))
        ));
        assert_eq!(
            ebt[5],
            BlockContent::Rejected(Rejection::Ec(HeaderError::BadMagic))
        );
        assert!(!ebt[0].is_layout());

        Ok(())
    }

    #[test]
    fn test_bad_offsets() -> anyhow::Result<()> {
        let mut image = vec![0xFF; PEB as usize];
        let ec = Ec {
            data_offset: PEB,
            ..ec()
        };
        put(&mut image, 0, &ec.encode());

        let ebt = scan_blocks(&image, PEB)?;
        assert!(matches!(
            ebt[0],
            BlockContent::Rejected(Rejection::BadOffsets { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_probe() {
        let mut image = vec![0xFF; 4 * PEB as usize];
        for pnum in 0..4 {
            put(&mut image, pnum * PEB as usize, &ec().encode());
        }
        assert!(!validate_at(&image, 1024));
        assert!(validate_at(&image, PEB));
        assert_eq!(probe_peb_size(&image), Some(PEB));

        // A single PEB is enough on its own
        assert_eq!(probe_peb_size(&image[..PEB as usize]), Some(PEB));

        assert_eq!(probe_peb_size(&vec![0xFF; 4 * PEB as usize]), None);

        // A worn first PEB does not hide the others
        let mut worn = image.clone();
        worn[10] ^= 0x01;
        assert!(!validate_at(&worn, 1024));
        assert!(validate_at(&worn, PEB));
        assert_eq!(probe_peb_size(&worn), Some(PEB));

        // Headers from different images do not make a pair
        let mut mixed = vec![0xFF; 2 * PEB as usize];
        put(&mut mixed, 0, &ec().encode());
        let other = Ec {
            image_seq: 9,
            ..ec()
        };
        put(&mut mixed, PEB as usize, &other.encode());
        assert!(!validate_at(&mixed, PEB));
    }
}
