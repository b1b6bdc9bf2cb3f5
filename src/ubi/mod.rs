//! The UBI layer: PEB headers, the LEB mapping and the volume table.
//!
//! UBI populates the start of every PEB it has touched with an "erase counter" ("EC") header, and
//! if the PEB is in use, a "volume ID" ("VID") header naming the LEB it holds:
//!
//! ```text
//! +----------- PEB -----------+
//! | EC header                 |  at 0
//! | VID header                |  at ec.vid_hdr_offset
//! | LEB contents ...          |  at ec.data_offset
//! |                           |
//! | (data_pad)                |
//! +---------------------------+
//! ```
//!
//! Nothing else records which PEB holds which LEB, so the mapping is rebuilt here by reading the
//! headers of every PEB in the image. When a LEB has been moved (wear-leveling, or an interrupted
//! update) more than one PEB can claim it; the VID header sequence number decides.

pub(crate) mod headers;
mod scan;
mod volume;
mod vtbl;

pub use headers::{Ec, HeaderError, Vid, VolTableRecord, VolType, UBI_CRC};
pub use scan::{
    probe_peb_size, scan_blocks, validate_at, BlockContent, Ebt, Rejection, FASTMAP_SB_VOLUME_ID,
    INTERNAL_VOLUME_START, LAYOUT_VOLUME_ID,
};
pub use volume::{Leb, UbiImage, Volume};
pub use vtbl::VolumeTable;
