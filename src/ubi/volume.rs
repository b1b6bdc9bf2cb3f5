//! Mapping of `(volume, LEB)` to byte ranges of the image.

use std::collections::BTreeMap;

use super::headers::{VolTableRecord, VolType};
use super::scan::{
    probe_peb_size, scan_blocks, BlockContent, Ebt, INTERNAL_VOLUME_START, LAYOUT_VOLUME_ID,
};
use super::vtbl::VolumeTable;
use crate::config::{Config, VolumeSelector};
use crate::error::{Error, Result, Warning};
use crate::image::ImageSource;
use crate::redundant;
use crate::trace::Trace;
use crate::ubifs::Location;

/// Where the contents of one LEB live in the image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Leb {
    pub vol_id: u32,
    pub lnum: u32,

    /// The PEB backing this LEB
    pub peb: u32,

    /// Absolute image offset of the first byte of the LEB
    pub start: u64,

    /// Usable length of the LEB in bytes. For static volumes, only what was written.
    pub len: u32,

    /// The LEB size of the volume, whatever the volume type
    pub capacity: u32,

    /// VID header sequence number of the winning PEB
    pub sqnum: u64,
}

/// A UBI image: the scanned PEBs, the LEB mapping derived from them, and the volume table
#[derive(Debug)]
pub struct UbiImage<S> {
    source: S,
    peb_size: u32,
    ebt: Ebt,

    /// `vol_id -> lnum -> pnum`, with duplicate copies already resolved
    lebs: BTreeMap<u32, BTreeMap<u32, u32>>,

    vtbl: VolumeTable,
    warnings: Vec<Warning>,
}

impl<S: ImageSource> UbiImage<S> {
    /// Scan `source` and build the LEB mapping and volume table.
    ///
    /// Damaged PEBs are left out of the mapping, each with a warning; the image is only rejected
    /// if none of its PEBs carries a valid UBI header. In strict mode any damaged PEB or volume
    /// table copy fails the open instead.
    pub fn open(source: S, config: &Config) -> Result<Self> {
        let peb_size = match config.peb_size {
            Some(x) => x,
            None => probe_peb_size(&source).ok_or_else(|| {
                Error::UnrecognizedImage("no valid EC header at any candidate PEB size".into())
            })?,
        };
        if peb_size == 0 {
            return Err(Error::UnrecognizedImage("zero PEB size".into()));
        }
        log::debug!("PEB size {peb_size:#x}");

        let mut trace = Trace::from_config(config);

        let tail = source.len() % u64::from(peb_size);
        if tail != 0 {
            trace.warn(Warning::new(format!(
                "ignoring {tail} trailing bytes after the last whole PEB"
            )));
        }

        let ebt = scan_blocks(&source, peb_size)?;
        if ebt.iter().all(|x| x.ec().is_none()) {
            return Err(Error::UnrecognizedImage(format!(
                "none of {} PEBs has a valid EC header",
                ebt.len()
            )));
        }

        for (pnum, content) in ebt.iter().enumerate() {
            if let BlockContent::Rejected(reason) = *content {
                trace.tolerate(Error::RejectedPeb {
                    pnum: pnum as u32,
                    offset: pnum as u64 * u64::from(peb_size),
                    reason,
                })?;
            }
        }

        let lebs = Self::map_lebs(&ebt);

        let mut image = Self {
            source,
            peb_size,
            ebt,
            lebs,
            vtbl: VolumeTable::default(),
            warnings: Vec::new(),
        };

        let copies = [0, 1].map(|lnum| image.resolve(LAYOUT_VOLUME_ID, lnum).ok());
        image.vtbl = VolumeTable::read(&image.source, copies, &mut trace)?;
        image.warnings = trace.take_warnings();

        Ok(image)
    }

    /// Group the mapped PEBs by `(volume, LEB)` and keep the newest copy of each
    fn map_lebs(ebt: &Ebt) -> BTreeMap<u32, BTreeMap<u32, u32>> {
        let mut claims: BTreeMap<(u32, u32), Vec<u32>> = BTreeMap::new();
        for (pnum, content) in ebt.iter().enumerate() {
            if let Some(vid) = content.vid() {
                claims
                    .entry((vid.vol_id, vid.lnum))
                    .or_default()
                    .push(pnum as u32);
            }
        }

        let sqnum = |pnum: &u32| {
            ebt[*pnum as usize].vid().map_or(0, |x| x.sqnum)
        };

        let mut lebs: BTreeMap<u32, BTreeMap<u32, u32>> = BTreeMap::new();
        for ((vol_id, lnum), pnums) in claims {
            if pnums.len() > 1 {
                log::debug!("volume {vol_id} LEB {lnum}: {} copies in PEBs {pnums:?}", pnums.len());
            }
            if let Some((_, pnum)) = redundant::newest(pnums.into_iter().map(Some), sqnum) {
                lebs.entry(vol_id).or_default().insert(lnum, pnum);
            }
        }
        lebs
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn peb_size(&self) -> u32 {
        self.peb_size
    }

    /// The state of every PEB, as determined by the scan
    pub fn ebt(&self) -> &Ebt {
        &self.ebt
    }

    pub fn vtbl(&self) -> &VolumeTable {
        &self.vtbl
    }

    /// Problems found while opening the image
    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    /// Find the PEB currently holding a LEB and the byte range of its contents
    pub fn resolve(&self, vol_id: u32, lnum: u32) -> Result<Leb> {
        let pnum = *self
            .lebs
            .get(&vol_id)
            .and_then(|x| x.get(&lnum))
            .ok_or(Error::NotMapped { vol_id, lnum })?;

        let (ec, vid) = match &self.ebt[pnum as usize] {
            BlockContent::Data(ec, vid) => (ec, vid),
            _ => return Err(Error::NotMapped { vol_id, lnum }),
        };

        let capacity = (self.peb_size - ec.data_offset).saturating_sub(vid.data_pad);
        let len = match vid.vol_type {
            VolType::Static => vid.data_size.min(capacity),
            VolType::Dynamic => capacity,
        };

        Ok(Leb {
            vol_id,
            lnum,
            peb: pnum,
            start: u64::from(pnum) * u64::from(self.peb_size) + u64::from(ec.data_offset),
            len,
            capacity,
            sqnum: vid.sqnum,
        })
    }

    /// Read the raw contents of a LEB
    pub fn read_leb(&self, vol_id: u32, lnum: u32) -> Result<Vec<u8>> {
        let leb = self.resolve(vol_id, lnum)?;
        let mut data = vec![0u8; leb.len as usize];
        self.source.read_at(leb.start, &mut data)?;
        Ok(data)
    }

    /// IDs of every user volume, whether named in the volume table or only seen in VID headers
    pub fn volume_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .vtbl
            .iter()
            .map(|(id, _)| id)
            .chain(self.lebs.keys().copied())
            .filter(|&id| id < INTERNAL_VOLUME_START)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    pub fn volume(&self, vol_id: u32) -> Result<Volume<'_, S>> {
        if self.vtbl.get(vol_id).is_none() && !self.lebs.contains_key(&vol_id) {
            return Err(Error::NoSuchVolume(vol_id.to_string()));
        }
        Ok(Volume {
            image: self,
            id: vol_id,
        })
    }

    pub fn volume_by_name(&self, name: &str) -> Result<Volume<'_, S>> {
        let id = self
            .vtbl
            .find_name(name)
            .ok_or_else(|| Error::NoSuchVolume(name.to_string()))?;
        self.volume(id)
    }

    pub fn select(&self, selector: &VolumeSelector) -> Result<Volume<'_, S>> {
        match selector {
            VolumeSelector::Id(id) => self.volume(*id),
            VolumeSelector::Name(name) => self.volume_by_name(name),
        }
    }

    /// The volumes picked by [Config::volumes], in ID order
    pub fn selected_volumes(&self, config: &Config) -> Result<Vec<Volume<'_, S>>> {
        if config.volumes.is_empty() {
            return self.volume_ids().into_iter().map(|x| self.volume(x)).collect();
        }
        config.volumes.iter().map(|x| self.select(x)).collect()
    }
}

/// A handle on one volume of a [UbiImage]
#[derive(Debug)]
pub struct Volume<'a, S> {
    image: &'a UbiImage<S>,
    id: u32,
}

impl<S> Clone for Volume<'_, S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S> Copy for Volume<'_, S> {}

impl<'a, S: ImageSource> Volume<'a, S> {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn image(&self) -> &'a UbiImage<S> {
        self.image
    }

    /// The volume table record, if the volume has one
    pub fn info(&self) -> Option<&'a VolTableRecord> {
        self.image.vtbl.get(self.id)
    }

    pub fn name(&self) -> Option<&'a str> {
        self.info().map(|x| x.name.as_str())
    }

    pub fn resolve(&self, lnum: u32) -> Result<Leb> {
        self.image.resolve(self.id, lnum)
    }

    /// The mapped LEB numbers, ascending
    pub fn lebs(&self) -> impl Iterator<Item = u32> + 'a {
        self.image
            .lebs
            .get(&self.id)
            .into_iter()
            .flat_map(|x| x.keys().copied())
    }

    pub fn leb_count(&self) -> usize {
        self.image.lebs.get(&self.id).map_or(0, |x| x.len())
    }

    /// Total bytes held by the mapped LEBs
    pub fn data_size(&self) -> u64 {
        self.lebs()
            .filter_map(|lnum| self.resolve(lnum).ok())
            .map(|x| u64::from(x.len))
            .sum()
    }

    /// Fill `buf` from `offs` bytes into LEB `lnum`
    pub fn read(&self, lnum: u32, offs: u32, buf: &mut [u8]) -> Result<()> {
        let leb = self.resolve(lnum)?;
        let end = u64::from(offs) + buf.len() as u64;
        if end > u64::from(leb.len) {
            return Err(Error::truncated(
                Location::new(lnum, offs),
                format!("read of {} bytes runs past LEB end {:#x}", buf.len(), leb.len),
            ));
        }
        self.image
            .source
            .read_at(leb.start + u64::from(offs), buf)?;
        Ok(())
    }

    pub fn read_leb(&self, lnum: u32) -> Result<Vec<u8>> {
        self.image.read_leb(self.id, lnum)
    }
}
