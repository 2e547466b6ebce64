// Label-neutral partition records shared between the slice model and the
// MBR/GPT codecs.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use carve_core::{CarveError, Disk};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What kind of table entry a slice is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SliceKind {
    Primary,
    Logical,
}

/// Answer from a label's can-create query for a run of empty space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateKind {
    Primary,
    Logical,
    Any,
    None,
}

/// A cylinder/head/sector address. Sectors are 1-based on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChsAddr {
    pub cylinder: u64,
    pub head: u32,
    pub sector: u32,
}

impl ChsAddr {
    /// Compute the CHS triple for an LBA under the disk's logical geometry.
    pub fn from_lba(disk: &Disk, lba: u64) -> Self {
        let cyl_sectors = disk.cylinder_sectors();
        let spt = disk.geometry.sectors_per_track as u64;
        ChsAddr {
            cylinder: lba / cyl_sectors,
            head: ((lba % cyl_sectors) / spt) as u32,
            sector: ((lba % cyl_sectors) % spt + 1) as u32,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChsRange {
    pub start: ChsAddr,
    pub end: ChsAddr,
}

/// The label-neutral partition record passed between the slice model and the
/// label codecs. GPT fields are zero for MBR slices and vice versa.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSlice {
    /// Table order within the label scheme.
    pub order: u32,
    pub kind: SliceKind,
    pub bootable: bool,
    /// MS-DOS partition tag.
    pub tag: u8,
    pub type_guid: Uuid,
    pub part_guid: Uuid,
    pub attributes: u64,
    pub start_lba: u64,
    pub size_lba: u64,
    pub geom: ChsRange,
}

impl Default for RawSlice {
    fn default() -> Self {
        RawSlice {
            order: 0,
            kind: SliceKind::Primary,
            bootable: false,
            tag: 0,
            type_guid: Uuid::nil(),
            part_guid: Uuid::nil(),
            attributes: 0,
            start_lba: 0,
            size_lba: 0,
            geom: ChsRange::default(),
        }
    }
}

impl RawSlice {
    pub fn end_lba(&self) -> u64 {
        self.start_lba + self.size_lba - 1
    }

    /// Recompute both CHS endpoints from the LBA fields.
    pub fn set_geom_from_lba(&mut self, disk: &Disk) {
        self.geom.start = ChsAddr::from_lba(disk, self.start_lba);
        self.geom.end = ChsAddr::from_lba(disk, self.end_lba());
    }

    // Backup records are a fixed binary layout, little-endian throughout.

    pub fn write_record<W: Write>(&self, w: &mut W) -> Result<(), CarveError> {
        w.write_u32::<LittleEndian>(self.order)?;
        w.write_u8(match self.kind {
            SliceKind::Primary => 0,
            SliceKind::Logical => 1,
        })?;
        w.write_u8(self.bootable as u8)?;
        w.write_u8(self.tag)?;
        w.write_u8(0)?;
        w.write_all(self.type_guid.as_bytes())?;
        w.write_all(self.part_guid.as_bytes())?;
        w.write_u64::<LittleEndian>(self.attributes)?;
        w.write_u64::<LittleEndian>(self.start_lba)?;
        w.write_u64::<LittleEndian>(self.size_lba)?;
        for chs in [&self.geom.start, &self.geom.end] {
            w.write_u64::<LittleEndian>(chs.cylinder)?;
            w.write_u32::<LittleEndian>(chs.head)?;
            w.write_u32::<LittleEndian>(chs.sector)?;
        }
        Ok(())
    }

    pub fn read_record<R: Read>(r: &mut R) -> Result<Self, CarveError> {
        let order = r.read_u32::<LittleEndian>()?;
        let kind = match r.read_u8()? {
            0 => SliceKind::Primary,
            1 => SliceKind::Logical,
            k => {
                return Err(CarveError::Corrupt(format!(
                    "bad slice kind {} in backup record",
                    k
                )))
            }
        };
        let bootable = r.read_u8()? != 0;
        let tag = r.read_u8()?;
        r.read_u8()?;
        let mut guid = [0u8; 16];
        r.read_exact(&mut guid)?;
        let type_guid = Uuid::from_bytes(guid);
        r.read_exact(&mut guid)?;
        let part_guid = Uuid::from_bytes(guid);
        let attributes = r.read_u64::<LittleEndian>()?;
        let start_lba = r.read_u64::<LittleEndian>()?;
        let size_lba = r.read_u64::<LittleEndian>()?;
        let mut read_chs = |r: &mut R| -> Result<ChsAddr, CarveError> {
            Ok(ChsAddr {
                cylinder: r.read_u64::<LittleEndian>()?,
                head: r.read_u32::<LittleEndian>()?,
                sector: r.read_u32::<LittleEndian>()?,
            })
        };
        let start = read_chs(r)?;
        let end = read_chs(r)?;
        Ok(RawSlice {
            order,
            kind,
            bootable,
            tag,
            type_guid,
            part_guid,
            attributes,
            start_lba,
            size_lba,
            geom: ChsRange { start, end },
        })
    }
}

/// One entry of a label's partition type list.
#[derive(Debug, Clone)]
pub struct TypeEntry {
    pub id: String,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use carve_core::test_utils::test_disk;

    #[test]
    fn test_chs_from_lba() {
        let disk = test_disk("hd0", 100);
        // First sector of cylinder 1.
        let chs = ChsAddr::from_lba(&disk, 16065);
        assert_eq!(
            chs,
            ChsAddr {
                cylinder: 1,
                head: 0,
                sector: 1
            }
        );
        // Last sector of cylinder 0.
        let chs = ChsAddr::from_lba(&disk, 16064);
        assert_eq!(
            chs,
            ChsAddr {
                cylinder: 0,
                head: 254,
                sector: 63
            }
        );
    }

    #[test]
    fn test_record_round_trip() {
        let disk = test_disk("hd0", 100);
        let mut raw = RawSlice {
            order: 2,
            kind: SliceKind::Logical,
            bootable: true,
            tag: 0x07,
            start_lba: 16128,
            size_lba: 803_187,
            ..Default::default()
        };
        raw.set_geom_from_lba(&disk);

        let mut buf = Vec::new();
        raw.write_record(&mut buf).unwrap();
        let back = RawSlice::read_record(&mut buf.as_slice()).unwrap();
        assert_eq!(back.order, 2);
        assert_eq!(back.kind, SliceKind::Logical);
        assert!(back.bootable);
        assert_eq!(back.tag, 0x07);
        assert_eq!(back.start_lba, raw.start_lba);
        assert_eq!(back.geom, raw.geom);
    }
}
