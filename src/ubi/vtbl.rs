//! The volume table, stored as an array of records in the layout volume.
//!
//! The layout volume occupies two LEBs holding identical copies of the table. A copy is only
//! usable if every one of its records passes its CRC check; if both are usable the one written
//! last wins.

use std::collections::BTreeMap;

use super::headers::VolTableRecord;
use super::volume::Leb;
use crate::error::{Error, Result, Warning};
use crate::image::ImageSource;
use crate::redundant;
use crate::trace::Trace;

/// Number of copies of the table kept in the layout volume
pub const LAYOUT_VOLUME_EBS: u32 = 2;

const MAX_VOLUMES: usize = 128;

/// The non-empty volume table records, by volume ID
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct VolumeTable {
    records: BTreeMap<u32, VolTableRecord>,

    /// The layout LEB the table was read from
    copy: Option<u32>,
}

impl VolumeTable {
    /// Decode both copies and keep the newest valid one. Missing or damaged copies are reported
    /// to `trace`; a damaged copy is an error if the trace is strict.
    pub(crate) fn read<S: ImageSource + ?Sized>(
        source: &S,
        copies: [Option<Leb>; LAYOUT_VOLUME_EBS as usize],
        trace: &mut Trace,
    ) -> Result<Self> {
        let mut decoded = Vec::with_capacity(copies.len());
        for leb in copies {
            decoded.push(match leb {
                Some(leb) => Self::read_copy(source, &leb, trace)?.map(|x| (leb.sqnum, x)),
                None => None,
            });
        }

        let Some((copy, (_, records))) = redundant::newest(decoded, |(sqnum, _)| *sqnum) else {
            trace.warn(Warning::new(
                "no valid volume table; volumes are only reachable by ID",
            ));
            return Ok(Self::default());
        };

        log::debug!(
            "volume table: {} volumes, from layout LEB {copy}",
            records.len()
        );

        Ok(Self {
            records,
            copy: Some(copy as u32),
        })
    }

    fn read_copy<S: ImageSource + ?Sized>(
        source: &S,
        leb: &Leb,
        trace: &mut Trace,
    ) -> Result<Option<BTreeMap<u32, VolTableRecord>>> {
        let slots = std::cmp::min(leb.len as usize / VolTableRecord::SIZE, MAX_VOLUMES);

        let mut data = vec![0u8; slots * VolTableRecord::SIZE];
        source.read_at(leb.start, &mut data)?;

        let mut records = BTreeMap::new();
        for (id, raw) in data.chunks_exact(VolTableRecord::SIZE).enumerate() {
            match VolTableRecord::decode(raw) {
                Ok(Some(record)) => {
                    records.insert(id as u32, record);
                }
                Ok(None) => (),
                Err(reason) => {
                    trace.tolerate(Error::BadVolumeTable {
                        pnum: leb.peb,
                        record: id,
                        reason,
                    })?;
                    return Ok(None);
                }
            }
        }

        Ok(Some(records))
    }

    pub fn get(&self, vol_id: u32) -> Option<&VolTableRecord> {
        self.records.get(&vol_id)
    }

    /// Find the ID of the volume with this name
    pub fn find_name(&self, name: &str) -> Option<u32> {
        self.records
            .iter()
            .find(|(_, x)| x.name == name)
            .map(|(&id, _)| id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &VolTableRecord)> {
        self.records.iter().map(|(&id, x)| (id, x))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Which layout LEB (0 or 1) supplied the table, if any did
    pub fn copy(&self) -> Option<u32> {
        self.copy
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ubi::headers::VolType;

    fn record(name: &str) -> VolTableRecord {
        VolTableRecord {
            reserved_pebs: 3,
            alignment: 1,
            vol_type: VolType::Dynamic,
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn table(names: &[Option<&str>]) -> Vec<u8> {
        names
            .iter()
            .flat_map(|x| VolTableRecord::encode(x.map(record).as_ref()))
            .collect()
    }

    fn leb(lnum: u32, start: u64, len: u32, sqnum: u64) -> Leb {
        Leb {
            vol_id: crate::ubi::LAYOUT_VOLUME_ID,
            lnum,
            peb: lnum,
            start,
            len,
            capacity: len,
            sqnum,
        }
    }

    #[test]
    fn test_newest_copy() -> anyhow::Result<()> {
        let len = 4 * VolTableRecord::SIZE;
        let mut image = table(&[Some("old"), None, None, None]);
        image.extend(table(&[Some("new"), None, Some("data"), None]));

        let mut trace = Trace::new();
        let vtbl = VolumeTable::read(
            &image,
            [
                Some(leb(0, 0, len as u32, 7)),
                Some(leb(1, len as u64, len as u32, 8)),
            ],
            &mut trace,
        )?;
        assert_eq!(vtbl.copy(), Some(1));
        assert_eq!(vtbl.len(), 2);
        assert_eq!(vtbl.find_name("data"), Some(2));
        assert_eq!(vtbl.get(0).map(|x| x.name.as_str()), Some("new"));
        assert!(trace.warnings().is_empty());

        // Damage one record of the newer copy: the whole copy is discarded
        image[len + 2 * VolTableRecord::SIZE + 20] ^= 1;
        let vtbl = VolumeTable::read(
            &image,
            [
                Some(leb(0, 0, len as u32, 7)),
                Some(leb(1, len as u64, len as u32, 8)),
            ],
            &mut trace,
        )?;
        assert_eq!(vtbl.copy(), Some(0));
        assert_eq!(vtbl.find_name("old"), Some(0));
        assert_eq!(trace.warnings().len(), 1);
        assert_eq!(trace.warnings()[0].peb, Some(1));
        assert!(trace.warnings()[0].expected.is_some());

        let mut strict = Trace::new().strict(true);
        let result = VolumeTable::read(
            &image,
            [
                Some(leb(0, 0, len as u32, 7)),
                Some(leb(1, len as u64, len as u32, 8)),
            ],
            &mut strict,
        );
        assert!(matches!(
            result,
            Err(Error::BadVolumeTable {
                pnum: 1,
                record: 2,
                reason: crate::ubi::HeaderError::BadCrc { .. },
            })
        ));

        Ok(())
    }

    #[test]
    fn test_missing() -> anyhow::Result<()> {
        let mut trace = Trace::new();
        let vtbl = VolumeTable::read(&Vec::<u8>::new(), [None, None], &mut trace)?;
        assert!(vtbl.is_empty());
        assert_eq!(trace.warnings().len(), 1);
        Ok(())
    }
}
