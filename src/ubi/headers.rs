//! This module contains the code necessary to read EC/VID headers and volume table records, with
//! magic, version and CRC verification.

use crc::{Crc, CRC_32_JAMCRC};
use deku::DekuContainerRead;
use income::{EcHdr, VidHdr, VtblRecord, UBI_EC_HDR_MAGIC, UBI_VID_HDR_MAGIC};
use thiserror::Error;

use crate::image::PageUtil;

/// CRC-32 with initial value `0xFFFFFFFF` and no final XOR, shared by UBI and UBIFS
pub const UBI_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);
const UBI_VERSION: u8 = 1;

/// Why a header was not accepted
#[derive(Debug, Error, Eq, PartialEq, Copy, Clone)]
pub enum HeaderError {
    #[error("erased")]
    Erased,

    #[error("short read")]
    Short,

    #[error("bad magic")]
    BadMagic,

    #[error("unsupported version {0}")]
    BadVersion(u8),

    #[error("bad CRC (stored {stored:#010x}, computed {computed:#010x})")]
    BadCrc { stored: u32, computed: u32 },

    #[error("bad volume type {0}")]
    BadVolType(u8),
}

fn check_crc(raw: &[u8], stored: u32) -> Result<(), HeaderError> {
    let computed = UBI_CRC.checksum(&raw[..raw.len() - std::mem::size_of::<u32>()]);
    if computed != stored {
        return Err(HeaderError::BadCrc { stored, computed });
    }
    Ok(())
}

/// A trait missing from the `income` crate: implements parsing UBI headers from byteslices, with
/// magic and CRC verification.
pub trait ParseHeader<'a>: Sized + DekuContainerRead<'a> {
    /// Size of the header on flash, CRC included
    const SIZE: usize;

    fn get_magic() -> &'static [u8];
    fn get_crc(&self) -> u32;

    fn parse(buf: &'a [u8]) -> Result<Self, HeaderError> {
        let raw = buf.get(..Self::SIZE).ok_or(HeaderError::Short)?;
        if raw.is_erased() {
            return Err(HeaderError::Erased);
        }

        // `income` asserts on the magic (and for VID headers, the version) while parsing, so
        // both are checked here first to keep the rejection reason precise
        let magic = Self::get_magic();
        if &raw[..magic.len()] != magic {
            return Err(HeaderError::BadMagic);
        }
        let version = raw[magic.len()];
        if version != UBI_VERSION {
            return Err(HeaderError::BadVersion(version));
        }

        let (_, header) = Self::from_bytes((raw, 0)).map_err(|_| HeaderError::Short)?;
        check_crc(raw, header.get_crc())?;

        Ok(header)
    }
}

impl ParseHeader<'_> for EcHdr {
    const SIZE: usize = 64;

    fn get_magic() -> &'static [u8] {
        UBI_EC_HDR_MAGIC
    }
    fn get_crc(&self) -> u32 {
        self.hdr_crc
    }
}

impl ParseHeader<'_> for VidHdr {
    const SIZE: usize = 64;

    fn get_magic() -> &'static [u8] {
        UBI_VID_HDR_MAGIC
    }
    fn get_crc(&self) -> u32 {
        self.hdr_crc
    }
}

/// This represents the specific fields we care about in an EC header
///
/// This is meant to be more ergonomic to work with than EcHdr, which represents the raw data
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Ec {
    /// How many times this PEB has been erased.
    pub ec: u64,
    pub vid_hdr_offset: u32,
    pub data_offset: u32,
    pub image_seq: u32,
}

impl Ec {
    pub const SIZE: usize = 64;

    /// Convert from a byte slice
    pub fn decode(bytes: &[u8]) -> Result<Self, HeaderError> {
        EcHdr::parse(bytes).map(|x| x.into())
    }
}

impl From<EcHdr> for Ec {
    fn from(value: EcHdr) -> Self {
        let EcHdr {
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
            ..
        } = value;

        Self {
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
        }
    }
}

/// These represent UBI volume types
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum VolType {
    /// A volume that may be read and written in random order
    #[default]
    Dynamic,

    /// A volume that is read-only after it is initially written, except for whole-volume updates
    Static,
}

impl From<VolType> for u8 {
    fn from(value: VolType) -> Self {
        match value {
            VolType::Dynamic => 1,
            VolType::Static => 2,
        }
    }
}

impl TryFrom<u8> for VolType {
    type Error = HeaderError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Dynamic),
            2 => Ok(Self::Static),
            x => Err(HeaderError::BadVolType(x)),
        }
    }
}

impl std::fmt::Display for VolType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Dynamic => "dynamic",
            Self::Static => "static",
        })
    }
}

/// This represents the specific fields we care about in a VID header
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Vid {
    /// The type of volume.
    pub vol_type: VolType,

    /// Whether this PEB was written as a copy of another, for wear-leveling purposes.
    pub copy_flag: bool,

    /// For internal volumes, flags indicating how UBI should handle the volume.
    pub compat: u8,

    /// The ID of the volume, and entry in the volume table.
    pub vol_id: u32,

    /// The offset of the LEB within this volume.
    pub lnum: u32,

    /// For `Static` volumes and copied LEBs, the number of bytes written at the same time as the
    /// VID header, which are thus included in `data_crc`; otherwise 0.
    pub data_size: u32,

    /// The number of LEBs used by this volume, or 0 if this volume is `Dynamic`
    pub used_ebs: u32,

    /// The number of bytes unused at the end of the PEB, to cut the LEB down to a multiple of the
    /// requested volume alignment size.
    pub data_pad: u32,

    /// The CRC of the first `data_size` bytes of the LEB, or 0 when unused.
    pub data_crc: u32,

    /// A unique counter greater than any other VID header written, for resolving `vol_id:lnum`
    /// collisions.
    pub sqnum: u64,
}

impl Vid {
    pub const SIZE: usize = 64;

    /// Convert from a byte slice
    pub fn decode(bytes: &[u8]) -> Result<Self, HeaderError> {
        VidHdr::parse(bytes).and_then(|x| x.try_into())
    }
}

impl TryFrom<VidHdr> for Vid {
    type Error = HeaderError;

    fn try_from(value: VidHdr) -> Result<Self, Self::Error> {
        let VidHdr {
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
            ..
        } = value;

        let vol_type = vol_type.try_into()?;
        let copy_flag = copy_flag != 0;

        Ok(Self {
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
        })
    }
}

/// This represents the specific fields we care about in a volume table record
#[derive(Debug, Default, Eq, PartialEq, Clone)]
pub struct VolTableRecord {
    /// The total number of PEBs allocated to this volume.
    pub reserved_pebs: u32,

    /// All LEBs in this volume will be a multiple of this size.
    pub alignment: u32,

    /// The number of bytes reserved from the end of each PEB to ensure alignment.
    pub data_pad: u32,

    /// The type of volume.
    pub vol_type: VolType,

    /// Set to `true` during a whole-volume update, so that if interrupted, it's possible to detect
    /// that the volume is corrupt.
    pub upd_marker: bool,

    /// The name of the volume. Names that are not valid UTF-8 are converted lossily.
    pub name: String,

    /// Any flags set on this volume.
    pub flags: u8,
}

impl VolTableRecord {
    pub const SIZE: usize = 0xAC;

    /// Convert from a byte slice. An empty slot (all-erased, or zero reserved PEBs) is `None`.
    pub fn decode(bytes: &[u8]) -> Result<Option<Self>, HeaderError> {
        let raw = bytes.get(..Self::SIZE).ok_or(HeaderError::Short)?;
        if raw.is_erased() {
            return Ok(None);
        }

        let (_, vtblrec) = VtblRecord::from_bytes((raw, 0)).map_err(|_| HeaderError::Short)?;
        check_crc(raw, vtblrec.crc)?;

        if vtblrec.reserved_pebs == 0 {
            return Ok(None);
        }
        vtblrec.try_into().map(Some)
    }
}

impl TryFrom<VtblRecord> for VolTableRecord {
    type Error = HeaderError;

    fn try_from(value: VtblRecord) -> Result<Self, Self::Error> {
        let VtblRecord {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            name_len,
            flags,
            ..
        } = value;

        let vol_type = vol_type.try_into()?;
        let upd_marker = upd_marker != 0;
        let name_len = usize::from(name_len).min(name.len());
        let name = String::from_utf8_lossy(&name[..name_len]).into_owned();

        Ok(Self {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            flags,
        })
    }
}


#[test]
fn test_decode() -> anyhow::Result<()> {
    let ec = Ec {
        ec: 3,
        vid_hdr_offset: 64,
        data_offset: 128,
        image_seq: 0x1234,
    };
    let vid = Vid {
        vol_type: VolType::Static,
        vol_id: 2,
        lnum: 9,
        data_size: 100,
        sqnum: 77,
        ..Default::default()
    };
    let vtbl = VolTableRecord {
        reserved_pebs: 4,
        alignment: 1,
        name: "example".to_string(),
        ..Default::default()
    };

    let mut buf = ec.encode();
    assert_eq!(Ec::decode(&buf), Ok(ec));
    assert_eq!(Vid::decode(&buf), Err(HeaderError::BadMagic));

    buf[8] ^= 1;
    assert!(matches!(Ec::decode(&buf), Err(HeaderError::BadCrc { .. })));
    assert_eq!(Ec::decode(&[0xFF; 64]), Err(HeaderError::Erased));
    assert_eq!(Ec::decode(&[0xFF; 10]), Err(HeaderError::Short));

    assert_eq!(Ec::decode(&[0xAA; 64]), Err(HeaderError::BadMagic));
    let mut buf = ec.encode();
    buf[4] = 2;
    assert_eq!(Ec::decode(&buf), Err(HeaderError::BadVersion(2)));

    let mut buf = vid.encode();
    assert_eq!(Vid::decode(&buf), Ok(vid));
    buf[4] = 0;
    assert_eq!(Vid::decode(&buf), Err(HeaderError::BadVersion(0)));

    let buf = VolTableRecord::encode(Some(&vtbl));
    assert_eq!(buf.len(), VolTableRecord::SIZE);
    assert_eq!(VolTableRecord::decode(&buf), Ok(Some(vtbl)));

    let buf = VolTableRecord::encode(None);
    assert_eq!(VolTableRecord::decode(&buf), Ok(None));
    assert_eq!(VolTableRecord::decode(&[0xFF; 0xAC]), Ok(None));

    Ok(())
}
