//! Read-only access to UBI images and the UBIFS filesystems stored in them.
//!
//! The crate is layered the same way the flash is:
//!
//! ```text
//! image ──> ubi::scan ──> ubi::vtbl ──> ubi::volume ──> ubifs::node ──> ubifs::master
//!                                                            │              │
//!                                                            └──> ubifs::index ──> ubifs::fs
//! ```
//!
//! 1. [ubi] scans physical eraseblocks (PEBs), recovers which logical eraseblock (LEB) of which
//!    volume each one holds, and decodes the volume table from the layout volume.
//! 2. [ubifs] decodes the self-describing node format inside a volume, picks the newest master
//!    node, and walks the on-flash B+tree ("TNC" in UBIFS parlance) to answer path lookups,
//!    directory listings and file reads.
//!
//! Nothing here writes to the image, and the journal is not replayed: the filesystem view is
//! whatever the last committed index describes.

pub mod config;
pub mod error;
pub mod image;
pub mod redundant;
pub mod trace;
pub mod ubi;
pub mod ubifs;

#[cfg(test)]
mod fixture;

pub use config::{Config, VolumeSelector};
pub use error::{Error, Result, Warning};
pub use image::{FileImage, ImageSource};
pub use trace::Trace;
pub use ubi::{UbiImage, Volume};
pub use ubifs::Ubifs;
