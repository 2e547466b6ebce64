// MS-DOS (MBR) disk label codec. Sector 0 carries four 16-byte entries at
// offset 0x1BE and the 0xAA55 boot signature; logical partitions live in a
// chain of secondary partition sectors reached through an extended container
// entry. In memory the chain is flattened: logicals are ordinary raw slices
// with kind Logical, and the writer re-synthesizes the chain.

use byteorder::{ByteOrder, LittleEndian};
use carve_core::{BlockDevice, CarveError, Disk};
use log::warn;

use crate::label::{Label, LabelCaps, LabelKind};
use crate::table::Slice;
use crate::types::{ChsAddr, CreateKind, RawSlice, SliceKind, TypeEntry};

pub const TABLE_OFFSET: usize = 0x1BE;
pub const SIGNATURE_OFFSET: usize = 510;
pub const BOOT_SIGNATURE: u16 = 0xAA55;
pub const DISK_SIG_OFFSET: usize = 440;
pub const ENTRY_SIZE: usize = 16;
pub const MAX_PRIMARY: usize = 4;
/// Upper bound on entries across the primary table and the logical chain.
pub const MAX_PARTITIONS: usize = 16;

pub const TAG_EXTENDED: u8 = 0x05;
pub const TAG_EXTENDED_LBA: u8 = 0x0F;
pub const TAG_LINUX_EXTENDED: u8 = 0x85;
pub const TAG_GPT_PROTECTIVE: u8 = 0xEE;

const MAX_CHS_CYLINDER: u64 = 1023;

/// Visible tags that gain a "hidden" twin at +0x10.
const HIDEABLE_TAGS: [u8; 7] = [0x01, 0x04, 0x06, 0x07, 0x0B, 0x0C, 0x0E];

const TAG_NAMES: &[(u8, &str)] = &[
    (0x01, "FAT12"),
    (0x04, "FAT16 (small)"),
    (0x05, "Extended"),
    (0x06, "FAT16"),
    (0x07, "NTFS or HPFS"),
    (0x0B, "FAT32"),
    (0x0C, "FAT32 (LBA)"),
    (0x0E, "FAT16 (LBA)"),
    (0x0F, "Extended (LBA)"),
    (0x11, "Hidden FAT12"),
    (0x14, "Hidden FAT16 (small)"),
    (0x16, "Hidden FAT16"),
    (0x17, "Hidden NTFS or HPFS"),
    (0x1B, "Hidden FAT32"),
    (0x1C, "Hidden FAT32 (LBA)"),
    (0x1E, "Hidden FAT16 (LBA)"),
    (0x42, "Windows dynamic"),
    (0x82, "Linux swap"),
    (0x83, "Linux"),
    (0x85, "Linux extended"),
    (0x8E, "Linux LVM"),
    (0xA5, "FreeBSD"),
    (0xA6, "OpenBSD"),
    (0xA9, "NetBSD"),
    (0xAB, "Apple boot"),
    (0xAF, "Apple HFS"),
    (0xEB, "BeOS"),
    (0xEE, "GPT protective"),
    (0xEF, "EFI system"),
];

pub fn is_extended_tag(tag: u8) -> bool {
    matches!(tag, TAG_EXTENDED | TAG_EXTENDED_LBA | TAG_LINUX_EXTENDED)
}

pub fn is_hideable_tag(tag: u8) -> bool {
    HIDEABLE_TAGS.contains(&tag)
}

pub fn is_hidden_tag(tag: u8) -> bool {
    tag >= 0x10 && HIDEABLE_TAGS.contains(&(tag - 0x10))
}

pub fn check_signature(sector: &[u8]) -> bool {
    LittleEndian::read_u16(&sector[SIGNATURE_OFFSET..]) == BOOT_SIGNATURE
}

fn is_logical(slice: &Slice) -> bool {
    slice.used && slice.raw.kind == SliceKind::Logical
}

/// Decode one 16-byte table entry into a raw slice (without the order/kind
/// fields, which depend on where in the chain the entry was found).
fn decode_entry(entry: &[u8]) -> RawSlice {
    let mut raw = RawSlice {
        bootable: entry[0] >> 7 != 0,
        tag: entry[4],
        start_lba: LittleEndian::read_u32(&entry[8..12]) as u64,
        size_lba: LittleEndian::read_u32(&entry[12..16]) as u64,
        ..Default::default()
    };
    raw.geom.start = ChsAddr {
        cylinder: entry[3] as u64 | (((entry[2] & 0xC0) as u64) << 2),
        head: entry[1] as u32,
        sector: (entry[2] & 0x3F) as u32,
    };
    raw.geom.end = ChsAddr {
        cylinder: entry[7] as u64 | (((entry[6] & 0xC0) as u64) << 2),
        head: entry[5] as u32,
        sector: (entry[6] & 0x3F) as u32,
    };
    raw
}

/// Encode a raw slice into a 16-byte table entry. Cylinder values beyond the
/// CHS limit are clamped to 1023; the LBA fields stay authoritative.
fn encode_entry(entry: &mut [u8], raw: &RawSlice) {
    let start_cyl = raw.geom.start.cylinder.min(MAX_CHS_CYLINDER);
    let end_cyl = raw.geom.end.cylinder.min(MAX_CHS_CYLINDER);

    entry[0] = if raw.bootable { 0x80 } else { 0 };
    entry[1] = raw.geom.start.head as u8;
    entry[2] = (((start_cyl & 0x300) >> 2) as u8) | (raw.geom.start.sector as u8 & 0x3F);
    entry[3] = (start_cyl & 0xFF) as u8;
    entry[4] = raw.tag;
    entry[5] = raw.geom.end.head as u8;
    entry[6] = (((end_cyl & 0x300) >> 2) as u8) | (raw.geom.end.sector as u8 & 0x3F);
    entry[7] = (end_cyl & 0xFF) as u8;
    LittleEndian::write_u32(&mut entry[8..12], raw.start_lba.min(u32::MAX as u64) as u32);
    LittleEndian::write_u32(&mut entry[12..16], raw.size_lba.min(u32::MAX as u64) as u32);
}

/// Given the run of slots starting with a logical slice, compute the size and
/// end geometry of the extended container that must span it and every
/// following logical.
fn calc_extended_size(disk: &Disk, container: &mut RawSlice, slots: &[Option<RawSlice>]) {
    let spt = disk.geometry.sectors_per_track as u64;
    container.size_lba = 0;
    for slot in slots {
        match slot {
            Some(s) if s.kind == SliceKind::Logical => {
                container.size_lba += s.size_lba + s.geom.start.head as u64 * spt;
                container.geom.end = s.geom.end;
            }
            _ => break,
        }
    }
}

pub struct MsdosLabel;

impl MsdosLabel {
    fn read_chain(
        &self,
        disk: &Disk,
        dev: &mut dyn BlockDevice,
        sector: u64,
        extended_start: u64,
        next_order: &mut u32,
        out: &mut Vec<RawSlice>,
    ) -> Result<(), CarveError> {
        let mut data = vec![0u8; disk.sector_size as usize];
        dev.read_sectors(sector, 1, &mut data)?;

        if !check_signature(&data) {
            return Err(CarveError::Corrupt(format!(
                "Partition table sector {} has no signature",
                sector
            )));
        }

        // Secondary partition sectors carry at most two meaningful entries.
        let max_entries = if sector == 0 { MAX_PRIMARY } else { 2 };
        let cyl_sectors = disk.cylinder_sectors();

        for i in 0..max_entries {
            let entry = &data[TABLE_OFFSET + i * ENTRY_SIZE..TABLE_OFFSET + (i + 1) * ENTRY_SIZE];
            let tag = entry[4];

            // Extended entries are links, handled in the second pass.
            if is_extended_tag(tag) {
                continue;
            }

            if tag == 0 {
                if sector == 0 {
                    // An empty primary slot keeps its position in the order.
                    *next_order += 1;
                    continue;
                } else {
                    break;
                }
            }

            let mut raw = decode_entry(entry);
            raw.order = *next_order;
            *next_order += 1;
            raw.kind = if sector == 0 {
                SliceKind::Primary
            } else {
                SliceKind::Logical
            };
            // Logical starts are stored relative to their partition sector.
            raw.start_lba += sector;

            // Maxed-out CHS cylinders don't describe the real position;
            // recompute from the LBA values.
            if raw.geom.start.cylinder == MAX_CHS_CYLINDER {
                raw.geom.start.cylinder = raw.start_lba / cyl_sectors;
            }
            if raw.geom.end.cylinder == MAX_CHS_CYLINDER {
                raw.geom.end.cylinder = raw.end_lba() / cyl_sectors;
            }

            out.push(raw);
        }

        // Drop order positions reserved for trailing empty slots.
        if sector == 0 {
            *next_order = out.iter().map(|r| r.order + 1).max().unwrap_or(0);
        }

        // Second pass: follow the extended link, if any.
        for i in 0..max_entries {
            let entry = &data[TABLE_OFFSET + i * ENTRY_SIZE..TABLE_OFFSET + (i + 1) * ENTRY_SIZE];
            if is_extended_tag(entry[4]) {
                let link = LittleEndian::read_u32(&entry[8..12]) as u64;
                let (next_sector, ext_start) = if sector != 0 {
                    // Chain links are relative to the first extended container.
                    (link + extended_start, extended_start)
                } else {
                    (link, link)
                };
                self.read_chain(disk, dev, next_sector, ext_start, next_order, out)?;
                break;
            }
        }

        Ok(())
    }

    fn write_chain(
        &self,
        disk: &Disk,
        dev: &mut dyn BlockDevice,
        sector: u64,
        extended_start: u64,
        slots: &[Option<RawSlice>],
    ) -> Result<(), CarveError> {
        let spt = disk.geometry.sectors_per_track as u64;
        let mut data = vec![0u8; disk.sector_size as usize];

        // Keep whatever boot code is in the sector; only the table and
        // signature are ours.
        dev.read_sectors(sector, 1, &mut data)?;
        data[TABLE_OFFSET..TABLE_OFFSET + MAX_PRIMARY * ENTRY_SIZE].fill(0);

        let max_entries = if sector == 0 { MAX_PRIMARY } else { 2 };
        let mut num_entries = 0usize;
        let mut i = 0usize;

        while i < slots.len() && num_entries < max_entries {
            let slot = match &slots[i] {
                None => {
                    if sector == 0 {
                        // Empty primary slot: a zeroed entry holds the place.
                        num_entries += 1;
                        i += 1;
                        continue;
                    } else {
                        break;
                    }
                }
                Some(s) => s,
            };

            let mut tmp = slot.clone();

            if tmp.kind == SliceKind::Logical && (sector == 0 || i != 0) {
                // Synthesize the extended entry enclosing this logical and
                // all that follow it.
                tmp.tag = TAG_EXTENDED_LBA;

                if tmp.geom.start.head == 0 {
                    return Err(CarveError::InvalidLayout(
                        "Logical partition cannot start on a cylinder boundary".to_string(),
                    ));
                }

                // The container starts on the cylinder boundary; the logical
                // starts one track later.
                tmp.start_lba -= tmp.geom.start.head as u64 * spt;
                tmp.geom.start.head = 0;
                calc_extended_size(disk, &mut tmp, &slots[i..]);

                let abs_start = tmp.start_lba;
                if sector != 0 {
                    tmp.start_lba -= extended_start;
                }

                let off = TABLE_OFFSET + num_entries * ENTRY_SIZE;
                encode_entry(&mut data[off..off + ENTRY_SIZE], &tmp);

                let ext_start = if sector == 0 { abs_start } else { extended_start };
                self.write_chain(disk, dev, abs_start, ext_start, &slots[i..])?;

                if sector == 0 {
                    // Skip past the logicals the container absorbed.
                    while i + 1 < slots.len()
                        && matches!(&slots[i + 1], Some(s) if s.kind == SliceKind::Logical)
                    {
                        i += 1;
                    }
                } else {
                    num_entries += 1;
                    break;
                }
            } else {
                if sector != 0 {
                    tmp.start_lba -= sector;
                }
                let off = TABLE_OFFSET + num_entries * ENTRY_SIZE;
                encode_entry(&mut data[off..off + ENTRY_SIZE], &tmp);
            }

            num_entries += 1;
            i += 1;
        }

        // A fresh label needs a non-zero disk signature for Windows to
        // recognize it.
        if sector == 0 && LittleEndian::read_u32(&data[DISK_SIG_OFFSET..DISK_SIG_OFFSET + 4]) == 0 {
            let mut sig: u32 = rand::random();
            if sig == 0 {
                sig = 0x12345678;
            }
            LittleEndian::write_u32(&mut data[DISK_SIG_OFFSET..DISK_SIG_OFFSET + 4], sig);
        }

        LittleEndian::write_u16(&mut data[SIGNATURE_OFFSET..], BOOT_SIGNATURE);
        dev.write_sectors(sector, 1, &data)?;
        Ok(())
    }
}

impl Label for MsdosLabel {
    fn kind(&self) -> LabelKind {
        LabelKind::Msdos
    }

    fn caps(&self) -> LabelCaps {
        LabelCaps {
            primary_parts: true,
            logical_parts: true,
            use_tags: true,
            use_guids: false,
            use_active: true,
        }
    }

    fn detect(&self, disk: &Disk, dev: &mut dyn BlockDevice) -> Result<bool, CarveError> {
        let mut data = vec![0u8; disk.sector_size as usize];
        dev.read_sectors(0, 1, &mut data)?;
        Ok(check_signature(&data))
    }

    fn read_table(
        &self,
        disk: &Disk,
        dev: &mut dyn BlockDevice,
    ) -> Result<Vec<RawSlice>, CarveError> {
        let mut out = Vec::new();
        let mut next_order = 0u32;
        self.read_chain(disk, dev, 0, 0, &mut next_order, &mut out)?;
        Ok(out)
    }

    fn write_table(
        &self,
        disk: &Disk,
        dev: &mut dyn BlockDevice,
        slices: &[RawSlice],
    ) -> Result<(), CarveError> {
        // Lay the slices out by table order; gaps stay as empty slots.
        let mut slots: Vec<Option<RawSlice>> = vec![None; MAX_PARTITIONS];
        for raw in slices {
            let order = raw.order as usize;
            if order >= MAX_PARTITIONS {
                return Err(CarveError::InvalidLayout(format!(
                    "slice order {} exceeds the MS-DOS table",
                    order
                )));
            }
            if slots[order].is_some() {
                return Err(CarveError::InvalidLayout(format!(
                    "duplicate slice order {}",
                    order
                )));
            }
            slots[order] = Some(raw.clone());
        }

        self.write_chain(disk, dev, 0, 0, &slots)?;
        dev.flush()?;
        Ok(())
    }

    fn describe_slice(&self, raw: &RawSlice) -> String {
        TAG_NAMES
            .iter()
            .find(|(tag, _)| *tag == raw.tag)
            .map(|(_, name)| name.to_string())
            .unwrap_or_else(|| format!("Unknown (0x{:02x})", raw.tag))
    }

    fn can_create(&self, slices: &[Slice], empty_index: usize) -> CreateKind {
        let mut num_primary = 0;
        let mut num_logical = 0;
        for s in slices {
            if s.used {
                if s.raw.kind == SliceKind::Logical {
                    num_logical += 1;
                } else {
                    num_primary += 1;
                }
            }
        }

        let mut ret = CreateKind::Any;
        let prev_logical = empty_index > 0 && is_logical(&slices[empty_index - 1]);
        let next_logical =
            empty_index + 1 < slices.len() && is_logical(&slices[empty_index + 1]);
        let first = empty_index == 0;
        let last = empty_index + 1 == slices.len();

        if num_logical > 0 {
            // The logicals collectively consume one primary slot for their
            // extended container.
            num_primary += 1;

            if first && !next_logical {
                ret = CreateKind::Primary;
            } else if last && !prev_logical {
                ret = CreateKind::Primary;
            } else if !first && !last && !prev_logical && !next_logical {
                ret = CreateKind::Primary;
            } else if prev_logical && next_logical {
                ret = CreateKind::Logical;
            }
        }

        if ret != CreateKind::Logical && num_primary >= MAX_PRIMARY {
            if num_logical > 0 && ret == CreateKind::Any {
                ret = CreateKind::Logical;
            } else {
                ret = CreateKind::None;
            }
        }

        // A logical can't live solely on cylinder 0.
        if slices[empty_index].raw.geom.start.cylinder == 0
            && slices[empty_index].raw.geom.end.cylinder == 0
        {
            ret = match ret {
                CreateKind::Any | CreateKind::Primary => CreateKind::Primary,
                _ => CreateKind::None,
            };
        }

        ret
    }

    fn can_hide(&self, slice: &Slice) -> bool {
        is_hideable_tag(slice.raw.tag) || is_hidden_tag(slice.raw.tag)
    }

    fn hide(&self, raw: &mut RawSlice) {
        if is_hidden_tag(raw.tag) {
            raw.tag -= 0x10;
        } else if is_hideable_tag(raw.tag) {
            raw.tag += 0x10;
        }
    }

    fn list_types(&self) -> Vec<TypeEntry> {
        TAG_NAMES
            .iter()
            .map(|(tag, name)| TypeEntry {
                id: format!("{:02x}", tag),
                name: format!("{:02x}  {}", tag, name),
            })
            .collect()
    }

    fn set_type(&self, raw: &mut RawSlice, index: usize) -> Result<(), CarveError> {
        let (tag, _) = TAG_NAMES.get(index).ok_or_else(|| {
            CarveError::Parameter(format!("no partition type with index {}", index))
        })?;
        if is_extended_tag(*tag) {
            warn!("Setting an extended tag 0x{:02x} on a regular slice", tag);
        }
        raw.tag = *tag;
        Ok(())
    }

    fn set_default_type(&self, raw: &mut RawSlice) {
        raw.tag = 0x01;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carve_core::test_utils::{test_disk, MemoryDevice};

    fn raw_primary(disk: &Disk, order: u32, start_cyl: u64, end_cyl: u64, tag: u8) -> RawSlice {
        let cyl = disk.cylinder_sectors();
        let spt = disk.geometry.sectors_per_track as u64;
        let mut raw = RawSlice {
            order,
            kind: SliceKind::Primary,
            tag,
            ..Default::default()
        };
        let start_head = if start_cyl == 0 { 1 } else { 0 };
        raw.start_lba = start_cyl * cyl + start_head as u64 * spt;
        raw.size_lba = (end_cyl - start_cyl + 1) * cyl - start_head as u64 * spt;
        raw.set_geom_from_lba(disk);
        raw
    }

    fn raw_logical(disk: &Disk, order: u32, start_cyl: u64, end_cyl: u64, tag: u8) -> RawSlice {
        let cyl = disk.cylinder_sectors();
        let spt = disk.geometry.sectors_per_track as u64;
        let mut raw = RawSlice {
            order,
            kind: SliceKind::Logical,
            tag,
            ..Default::default()
        };
        raw.start_lba = start_cyl * cyl + spt;
        raw.size_lba = (end_cyl - start_cyl + 1) * cyl - spt;
        raw.set_geom_from_lba(disk);
        raw
    }

    #[test]
    fn test_create_delete_round_trip() {
        // 100 cylinders, 255 heads, 63 sectors: 1,606,500 sectors total.
        let disk = test_disk("hd0", 100);
        let mut dev = MemoryDevice::new(disk.num_sectors, 512);
        let label = MsdosLabel;

        let raw = raw_primary(&disk, 0, 1, 50, 0x01);
        label.write_table(&disk, &mut dev, &[raw]).unwrap();

        let sector = dev.sector(0).to_vec();
        let entry = &sector[TABLE_OFFSET..TABLE_OFFSET + ENTRY_SIZE];
        assert_eq!(entry[0], 0); // not active
        assert_eq!((entry[1], entry[2], entry[3]), (0, 1, 1)); // CHS (1,0,1)
        assert_eq!(entry[4], 0x01);
        assert_eq!((entry[5], entry[6], entry[7]), (254, 63, 50)); // CHS (50,254,63)
        assert_eq!(LittleEndian::read_u32(&entry[8..12]), 16065);
        assert_eq!(LittleEndian::read_u32(&entry[12..16]), 803_250);
        assert_eq!(LittleEndian::read_u16(&sector[SIGNATURE_OFFSET..]), 0xAA55);

        let read = label.read_table(&disk, &mut dev).unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].start_lba, 16065);
        assert_eq!(read[0].size_lba, 803_250);
        assert_eq!(read[0].geom.start.cylinder, 1);
        assert_eq!(read[0].geom.end.cylinder, 50);

        // Delete: write an empty table. The signature must survive.
        label.write_table(&disk, &mut dev, &[]).unwrap();
        let sector = dev.sector(0);
        assert!(sector[TABLE_OFFSET..TABLE_OFFSET + 64].iter().all(|&b| b == 0));
        assert_eq!(LittleEndian::read_u16(&sector[SIGNATURE_OFFSET..]), 0xAA55);
    }

    #[test]
    fn test_logical_insertion_builds_extended_chain() {
        let disk = test_disk("hd0", 100);
        let cyl = disk.cylinder_sectors();
        let mut dev = MemoryDevice::new(disk.num_sectors, 512);
        let label = MsdosLabel;

        let primary = raw_primary(&disk, 0, 1, 10, 0x07);
        let logical = raw_logical(&disk, 1, 20, 50, 0x07);
        label
            .write_table(&disk, &mut dev, &[primary, logical.clone()])
            .unwrap();

        // Entry 1 of the primary table must be an extended container that
        // spans the logical, starting on the cylinder boundary.
        let sector0 = dev.sector(0).to_vec();
        let ext = &sector0[TABLE_OFFSET + ENTRY_SIZE..TABLE_OFFSET + 2 * ENTRY_SIZE];
        assert_eq!(ext[4], TAG_EXTENDED_LBA);
        assert_eq!(LittleEndian::read_u32(&ext[8..12]) as u64, 20 * cyl);
        assert_eq!(
            LittleEndian::read_u32(&ext[12..16]) as u64,
            logical.size_lba + 63
        );

        // The secondary partition sector holds the logical with a
        // container-relative start.
        let ebr = dev.sector(20 * cyl).to_vec();
        assert_eq!(LittleEndian::read_u16(&ebr[SIGNATURE_OFFSET..]), 0xAA55);
        let log_entry = &ebr[TABLE_OFFSET..TABLE_OFFSET + ENTRY_SIZE];
        assert_eq!(log_entry[4], 0x07);
        assert_eq!(LittleEndian::read_u32(&log_entry[8..12]), 63);
        assert_eq!(
            LittleEndian::read_u32(&log_entry[12..16]) as u64,
            logical.size_lba
        );

        // Round trip: the reader flattens the chain back.
        let read = label.read_table(&disk, &mut dev).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[1].kind, SliceKind::Logical);
        assert_eq!(read[1].start_lba, logical.start_lba);
        assert_eq!(read[1].size_lba, logical.size_lba);
        assert_eq!(read[1].order, 1);
    }

    #[test]
    fn test_two_logicals_chain() {
        let disk = test_disk("hd0", 100);
        let mut dev = MemoryDevice::new(disk.num_sectors, 512);
        let label = MsdosLabel;

        let l1 = raw_logical(&disk, 0, 10, 20, 0x0B);
        let l2 = raw_logical(&disk, 1, 21, 40, 0x83);
        label
            .write_table(&disk, &mut dev, &[l1.clone(), l2.clone()])
            .unwrap();

        let read = label.read_table(&disk, &mut dev).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].start_lba, l1.start_lba);
        assert_eq!(read[0].tag, 0x0B);
        assert_eq!(read[1].start_lba, l2.start_lba);
        assert_eq!(read[1].tag, 0x83);
        assert!(read.iter().all(|r| r.kind == SliceKind::Logical));
    }

    #[test]
    fn test_chs_sentinel_recovered_from_lba() {
        let disk = test_disk("hd0", 2000);
        let mut dev = MemoryDevice::new(disk.num_sectors, 512);
        let label = MsdosLabel;

        // A slice past the CHS limit: write clamps the cylinders to 1023.
        let raw = raw_primary(&disk, 0, 1500, 1800, 0x07);
        label.write_table(&disk, &mut dev, &[raw.clone()]).unwrap();

        let entry = dev.sector(0)[TABLE_OFFSET..TABLE_OFFSET + ENTRY_SIZE].to_vec();
        assert_eq!(entry[3] as u64 | (((entry[2] & 0xC0) as u64) << 2), 1023);

        // Reading must trust the LBA, not report corruption.
        let read = label.read_table(&disk, &mut dev).unwrap();
        assert_eq!(read[0].geom.start.cylinder, 1500);
        assert_eq!(read[0].geom.end.cylinder, 1800);
    }

    #[test]
    fn test_order_preserved_across_empty_slot() {
        let disk = test_disk("hd0", 100);
        let mut dev = MemoryDevice::new(disk.num_sectors, 512);
        let label = MsdosLabel;

        // Slot 0 empty, slice in slot 1.
        let raw = RawSlice {
            order: 1,
            ..raw_primary(&disk, 0, 1, 10, 0x83)
        };
        label.write_table(&disk, &mut dev, &[raw]).unwrap();

        let sector = dev.sector(0);
        assert!(sector[TABLE_OFFSET..TABLE_OFFSET + ENTRY_SIZE]
            .iter()
            .all(|&b| b == 0));
        assert_eq!(sector[TABLE_OFFSET + ENTRY_SIZE + 4], 0x83);

        let read = label.read_table(&disk, &mut dev).unwrap();
        assert_eq!(read[0].order, 1);
    }

    #[test]
    fn test_hide_toggles_tag_pair() {
        let label = MsdosLabel;
        let mut raw = RawSlice {
            tag: 0x07,
            ..Default::default()
        };
        label.hide(&mut raw);
        assert_eq!(raw.tag, 0x17);
        label.hide(&mut raw);
        assert_eq!(raw.tag, 0x07);

        // Tags outside the pair set are untouched.
        raw.tag = 0x83;
        label.hide(&mut raw);
        assert_eq!(raw.tag, 0x83);
    }

    #[test]
    fn test_can_create_rules() {
        let disk = test_disk("hd0", 100);
        let label = MsdosLabel;

        let empty = |start: u64, end: u64| {
            let mut raw = RawSlice::default();
            raw.start_lba = start * disk.cylinder_sectors();
            raw.size_lba = (end - start + 1) * disk.cylinder_sectors();
            raw.set_geom_from_lba(&disk);
            Slice::empty(raw)
        };
        let used = |raw: RawSlice| Slice::from_raw(raw, &disk);

        // Blank disk: anything goes.
        let slices = vec![empty(0, 99)];
        assert_eq!(label.can_create(&slices, 0), CreateKind::Any);

        // Space between two logicals must stay logical.
        let slices = vec![
            used(raw_logical(&disk, 0, 1, 10, 0x07)),
            empty(11, 20),
            used(raw_logical(&disk, 1, 21, 40, 0x07)),
            empty(41, 99),
        ];
        assert_eq!(label.can_create(&slices, 1), CreateKind::Logical);

        // Space solely on cylinder 0: primary only.
        let slices = vec![empty(0, 0), used(raw_primary(&disk, 0, 1, 99, 0x07))];
        assert_eq!(label.can_create(&slices, 0), CreateKind::Primary);

        // Full primary table with no logicals: nothing fits.
        let slices = vec![
            used(raw_primary(&disk, 0, 1, 10, 0x07)),
            used(raw_primary(&disk, 1, 11, 20, 0x07)),
            used(raw_primary(&disk, 2, 21, 30, 0x07)),
            used(raw_primary(&disk, 3, 31, 40, 0x07)),
            empty(41, 99),
        ];
        assert_eq!(label.can_create(&slices, 4), CreateKind::None);

        // Full table counting the extended container, but adjacent to a
        // logical: logical still possible.
        let slices = vec![
            used(raw_primary(&disk, 0, 1, 10, 0x07)),
            used(raw_primary(&disk, 1, 11, 20, 0x07)),
            used(raw_primary(&disk, 2, 21, 30, 0x07)),
            used(raw_logical(&disk, 3, 31, 40, 0x07)),
            empty(41, 99),
        ];
        assert_eq!(label.can_create(&slices, 4), CreateKind::Logical);
    }

    #[test]
    fn test_detect_requires_signature() {
        let disk = test_disk("hd0", 10);
        let mut dev = MemoryDevice::new(disk.num_sectors, 512);
        let label = MsdosLabel;
        assert!(!label.detect(&disk, &mut dev).unwrap());

        label.write_table(&disk, &mut dev, &[]).unwrap();
        assert!(label.detect(&disk, &mut dev).unwrap());
    }
}
