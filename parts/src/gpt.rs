// GPT disk label codec. The primary header lives in sector 1 (behind the
// protective MBR), the partition entry array at its entries LBA, and a
// mirrored copy of both sits at the end of the disk: entries first, then the
// alternate header in the last sector with this/alternate LBAs swapped.

use byteorder::{ByteOrder, LittleEndian};
use carve_core::{BlockDevice, CarveError, Disk};
use log::warn;
use uuid::Uuid;

use crate::label::{Label, LabelCaps, LabelKind};
use crate::mbr;
use crate::table::Slice;
use crate::types::{ChsAddr, CreateKind, RawSlice, SliceKind, TypeEntry};

pub const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
const HEADER_BYTES: u32 = 92;
const REVISION: u32 = 0x0001_0000;
pub const ENTRY_BYTES: u32 = 128;
pub const NUM_ENTRIES: u32 = 128;

pub const GUID_BASIC_DATA: &str = "ebd0a0a2-b9e5-4433-87c0-68b6b72699c7";

const TYPE_GUIDS: &[(&str, &str)] = &[
    ("c12a7328-f81f-11d2-ba4b-00a0c93ec93b", "EFI system"),
    ("21686148-6449-6e6f-744e-656564454649", "BIOS boot"),
    ("e3c9e316-0b5c-4db8-817d-f92df00215ae", "Microsoft reserved"),
    ("ebd0a0a2-b9e5-4433-87c0-68b6b72699c7", "Microsoft basic data"),
    ("de94bba4-06d1-4d40-a16a-bfd50179d6ac", "Windows recovery"),
    ("af9b60a0-1431-4f62-bc68-3311714a69ad", "Windows LDM data"),
    ("5808c8aa-7e8f-42e0-85d2-e1e90434cfb3", "Windows LDM metadata"),
    ("0fc63daf-8483-4772-8e79-3d69d8477de4", "Linux filesystem"),
    ("0657fd6d-a4ab-43c4-84e5-0933c84b4f4f", "Linux swap"),
    ("e6d6d379-f507-44c2-a23c-238f2a3df928", "Linux LVM"),
    ("a19d880f-05fc-4d3b-a006-743f0f84911e", "Linux RAID"),
    ("933ac7e1-2eb4-4f13-b844-0e14e2aef915", "Linux home"),
    ("44479540-f297-41b2-9af7-d131d5f0458a", "Linux root (x86)"),
    ("4f68bce3-e8cd-4db1-96e7-fbcaf984b709", "Linux root (x86-64)"),
    ("48465300-0000-11aa-aa11-00306543ecac", "Apple HFS+"),
    ("7c3457ef-0000-11aa-aa11-00306543ecac", "Apple APFS"),
    ("426f6f74-0000-11aa-aa11-00306543ecac", "Apple boot"),
    ("516e7cb4-6ecf-11d6-8ff8-00022d09712b", "FreeBSD data"),
    ("516e7cb5-6ecf-11d6-8ff8-00022d09712b", "FreeBSD swap"),
    ("6a898cc3-1dd2-11b2-99a6-080020736631", "Solaris /usr or Apple ZFS"),
];

/// Decoded GPT header. Field order matches the on-disk layout.
#[derive(Debug, Clone)]
pub struct GptHeader {
    pub revision: u32,
    pub header_bytes: u32,
    pub header_crc32: u32,
    pub my_lba: u64,
    pub alt_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: Uuid,
    pub part_entries_lba: u64,
    pub num_part_entries: u32,
    pub part_entry_bytes: u32,
    pub part_entries_crc32: u32,
}

impl GptHeader {
    pub fn decode(data: &[u8]) -> Result<Self, CarveError> {
        if &data[0..8] != GPT_SIGNATURE {
            return Err(CarveError::Corrupt("No GPT header signature".to_string()));
        }
        let header_bytes = LittleEndian::read_u32(&data[12..16]);
        if (header_bytes as usize) < HEADER_BYTES as usize || header_bytes as usize > data.len() {
            return Err(CarveError::Corrupt(format!(
                "Implausible GPT header size {}",
                header_bytes
            )));
        }
        let mut guid = [0u8; 16];
        guid.copy_from_slice(&data[56..72]);
        Ok(GptHeader {
            revision: LittleEndian::read_u32(&data[8..12]),
            header_bytes: LittleEndian::read_u32(&data[12..16]),
            header_crc32: LittleEndian::read_u32(&data[16..20]),
            my_lba: LittleEndian::read_u64(&data[24..32]),
            alt_lba: LittleEndian::read_u64(&data[32..40]),
            first_usable_lba: LittleEndian::read_u64(&data[40..48]),
            last_usable_lba: LittleEndian::read_u64(&data[48..56]),
            disk_guid: Uuid::from_bytes_le(guid),
            part_entries_lba: LittleEndian::read_u64(&data[72..80]),
            num_part_entries: LittleEndian::read_u32(&data[80..84]),
            part_entry_bytes: LittleEndian::read_u32(&data[84..88]),
            part_entries_crc32: LittleEndian::read_u32(&data[88..92]),
        })
    }

    pub fn encode(&self, data: &mut [u8]) {
        data[..HEADER_BYTES as usize].fill(0);
        data[0..8].copy_from_slice(GPT_SIGNATURE);
        LittleEndian::write_u32(&mut data[8..12], self.revision);
        LittleEndian::write_u32(&mut data[12..16], self.header_bytes);
        LittleEndian::write_u32(&mut data[16..20], self.header_crc32);
        LittleEndian::write_u64(&mut data[24..32], self.my_lba);
        LittleEndian::write_u64(&mut data[32..40], self.alt_lba);
        LittleEndian::write_u64(&mut data[40..48], self.first_usable_lba);
        LittleEndian::write_u64(&mut data[48..56], self.last_usable_lba);
        data[56..72].copy_from_slice(&self.disk_guid.to_bytes_le());
        LittleEndian::write_u64(&mut data[72..80], self.part_entries_lba);
        LittleEndian::write_u32(&mut data[80..84], self.num_part_entries);
        LittleEndian::write_u32(&mut data[84..88], self.part_entry_bytes);
        LittleEndian::write_u32(&mut data[88..92], self.part_entries_crc32);
    }

    /// CRC32 over the header with the CRC field itself zeroed.
    pub fn checksum(&self) -> u32 {
        let mut buf = vec![0u8; self.header_bytes as usize];
        let mut copy = self.clone();
        copy.header_crc32 = 0;
        copy.encode(&mut buf);
        crc32fast::hash(&buf[..self.header_bytes as usize])
    }

    pub fn entry_bytes_total(&self) -> usize {
        (self.num_part_entries * self.part_entry_bytes) as usize
    }

    pub fn entry_sectors(&self, disk: &Disk) -> u64 {
        let bytes = self.entry_bytes_total() as u64;
        bytes.div_ceil(disk.sector_size as u64)
    }
}

fn entries_checksum(entries: &[u8]) -> u32 {
    crc32fast::hash(entries)
}

fn is_entry_used(entry: &[u8]) -> bool {
    entry[0..16].iter().any(|&b| b != 0)
}

pub struct GptLabel;

impl GptLabel {
    /// Read and validate a header from the given sector. Signature failure is
    /// corruption; a CRC mismatch is reported through the return flag so the
    /// caller can try the other copy.
    fn read_header_at(
        &self,
        disk: &Disk,
        dev: &mut dyn BlockDevice,
        lba: u64,
    ) -> Result<(GptHeader, bool), CarveError> {
        let mut data = vec![0u8; disk.sector_size as usize];
        dev.read_sectors(lba, 1, &mut data)?;
        let header = GptHeader::decode(&data)?;
        let crc_ok = header.checksum() == header.header_crc32;
        Ok((header, crc_ok))
    }

    /// Read the GPT header, preferring the primary copy but falling back to
    /// the alternate at the last sector when the primary is damaged.
    fn read_header(&self, disk: &Disk, dev: &mut dyn BlockDevice) -> Result<GptHeader, CarveError> {
        let alt_lba = match self.read_header_at(disk, dev, 1) {
            Ok((primary, true)) => return Ok(primary),
            Ok((primary, false)) => {
                warn!(
                    "GPT header checksum mismatch ({:#x} != {:#x}); trying the alternate header",
                    primary.checksum(),
                    primary.header_crc32
                );
                if primary.alt_lba != 0 {
                    primary.alt_lba
                } else {
                    disk.num_sectors - 1
                }
            }
            Err(e) => {
                warn!("Can't read the primary GPT header ({}); trying the alternate", e);
                disk.num_sectors - 1
            }
        };

        match self.read_header_at(disk, dev, alt_lba) {
            Ok((alternate, true)) => {
                warn!("Using the alternate GPT header; the primary is damaged");
                Ok(alternate)
            }
            Ok((_, false)) => Err(CarveError::Corrupt(
                "Both GPT header checksums are bad".to_string(),
            )),
            Err(e) => Err(e),
        }
    }

    fn read_entries(
        &self,
        disk: &Disk,
        dev: &mut dyn BlockDevice,
        header: &GptHeader,
    ) -> Result<Vec<u8>, CarveError> {
        let sectors = header.entry_sectors(disk);
        let mut entries = vec![0u8; (sectors * disk.sector_size as u64) as usize];
        // The alternate header describes the mirrored array; part_entries_lba
        // always points at the copy it owns.
        dev.read_sectors(header.part_entries_lba, sectors, &mut entries)?;

        let crc = entries_checksum(&entries[..header.entry_bytes_total()]);
        if crc != header.part_entries_crc32 {
            warn!(
                "GPT entries checksum mismatch ({:#x} != {:#x})",
                crc, header.part_entries_crc32
            );
        }
        Ok(entries)
    }

    fn write_entries(
        &self,
        disk: &Disk,
        dev: &mut dyn BlockDevice,
        header: &mut GptHeader,
        entries: &[u8],
    ) -> Result<(), CarveError> {
        let sectors = header.entry_sectors(disk);
        dev.write_sectors(header.part_entries_lba, sectors, entries)?;
        // Mirrored copy immediately before the alternate header.
        dev.write_sectors(header.last_usable_lba + 1, sectors, entries)?;
        header.part_entries_crc32 = entries_checksum(&entries[..header.entry_bytes_total()]);
        Ok(())
    }

    fn write_header(
        &self,
        disk: &Disk,
        dev: &mut dyn BlockDevice,
        header: &GptHeader,
    ) -> Result<(), CarveError> {
        let mut data = vec![0u8; disk.sector_size as usize];

        let mut primary = header.clone();
        primary.my_lba = 1;
        primary.alt_lba = header.alt_lba;
        primary.header_crc32 = 0;
        primary.header_crc32 = primary.checksum();
        primary.encode(&mut data);
        dev.write_sectors(1, 1, &data)?;

        // Alternate header: this/alternate swapped, checksum recomputed, and
        // the entries pointer aimed at the mirrored array.
        let mut alternate = header.clone();
        alternate.my_lba = header.alt_lba;
        alternate.alt_lba = 1;
        alternate.part_entries_lba = header.last_usable_lba + 1;
        alternate.header_crc32 = 0;
        alternate.header_crc32 = alternate.checksum();
        data.fill(0);
        alternate.encode(&mut data);
        dev.write_sectors(header.alt_lba, 1, &data)?;

        Ok(())
    }

    /// Lay down a blank GPT: protective MBR, empty entry arrays, and both
    /// headers. Used when writing to a disk that has no GPT yet.
    pub fn format_blank(&self, disk: &Disk, dev: &mut dyn BlockDevice) -> Result<(), CarveError> {
        let entry_sectors =
            ((NUM_ENTRIES * ENTRY_BYTES) as u64).div_ceil(disk.sector_size as u64);
        let alt_lba = disk.num_sectors - 1;

        // Protective MBR: one 0xEE partition spanning the disk.
        let mut protective = RawSlice {
            tag: mbr::TAG_GPT_PROTECTIVE,
            start_lba: 1,
            size_lba: (disk.num_sectors - 1).min(u32::MAX as u64),
            ..Default::default()
        };
        protective.set_geom_from_lba(disk);
        mbr::MsdosLabel.write_table(disk, dev, &[protective])?;

        let mut header = GptHeader {
            revision: REVISION,
            header_bytes: HEADER_BYTES,
            header_crc32: 0,
            my_lba: 1,
            alt_lba,
            first_usable_lba: 2 + entry_sectors,
            last_usable_lba: alt_lba - 1 - entry_sectors,
            disk_guid: Uuid::new_v4(),
            part_entries_lba: 2,
            num_part_entries: NUM_ENTRIES,
            part_entry_bytes: ENTRY_BYTES,
            part_entries_crc32: 0,
        };

        let entries = vec![0u8; (entry_sectors * disk.sector_size as u64) as usize];
        self.write_entries(disk, dev, &mut header, &entries)?;
        self.write_header(disk, dev, &header)?;
        dev.flush()?;
        Ok(())
    }
}

impl Label for GptLabel {
    fn kind(&self) -> LabelKind {
        LabelKind::Gpt
    }

    fn caps(&self) -> LabelCaps {
        LabelCaps {
            primary_parts: true,
            logical_parts: false,
            use_tags: false,
            use_guids: true,
            use_active: false,
        }
    }

    fn detect(&self, disk: &Disk, dev: &mut dyn BlockDevice) -> Result<bool, CarveError> {
        // A GPT disk carries a protective MS-DOS table, so MS-DOS detection
        // must succeed first.
        if !mbr::MsdosLabel.detect(disk, dev)? {
            return Ok(false);
        }

        let mut sector0 = vec![0u8; disk.sector_size as usize];
        dev.read_sectors(0, 1, &mut sector0)?;
        let has_protective = (0..mbr::MAX_PRIMARY).any(|i| {
            sector0[mbr::TABLE_OFFSET + i * mbr::ENTRY_SIZE + 4] == mbr::TAG_GPT_PROTECTIVE
        });
        if !has_protective {
            return Ok(false);
        }

        Ok(self.read_header(disk, dev).is_ok())
    }

    fn read_table(
        &self,
        disk: &Disk,
        dev: &mut dyn BlockDevice,
    ) -> Result<Vec<RawSlice>, CarveError> {
        let header = self.read_header(disk, dev)?;
        let entries = self.read_entries(disk, dev, &header)?;

        let mut out = Vec::new();
        for i in 0..header.num_part_entries as usize {
            let entry = &entries[i * header.part_entry_bytes as usize..];
            let entry = &entry[..header.part_entry_bytes as usize];
            if !is_entry_used(entry) {
                continue;
            }

            let mut guid = [0u8; 16];
            guid.copy_from_slice(&entry[0..16]);
            let type_guid = Uuid::from_bytes_le(guid);
            guid.copy_from_slice(&entry[16..32]);
            let part_guid = Uuid::from_bytes_le(guid);

            let starting_lba = LittleEndian::read_u64(&entry[32..40]);
            let ending_lba = LittleEndian::read_u64(&entry[40..48]);

            let mut raw = RawSlice {
                order: out.len() as u32,
                kind: SliceKind::Primary,
                type_guid,
                part_guid,
                attributes: LittleEndian::read_u64(&entry[48..56]),
                start_lba: starting_lba,
                size_lba: ending_lba - starting_lba + 1,
                ..Default::default()
            };
            // GPT has no real CHS; synthesize it from the LBA range.
            raw.geom.start = ChsAddr::from_lba(disk, starting_lba);
            raw.geom.end = ChsAddr::from_lba(disk, ending_lba);
            out.push(raw);
        }
        Ok(out)
    }

    fn write_table(
        &self,
        disk: &Disk,
        dev: &mut dyn BlockDevice,
        slices: &[RawSlice],
    ) -> Result<(), CarveError> {
        let mut header = self.read_header(disk, dev)?;
        let mut entries = self.read_entries(disk, dev, &header)?;
        entries.fill(0);

        // When we fell back to the alternate header, write back in the
        // primary orientation; that repairs the damaged primary copy.
        if header.my_lba != 1 {
            header.alt_lba = header.my_lba;
            header.my_lba = 1;
            header.part_entries_lba = 2;
        }

        // Partition GUIDs must be unique on the disk.
        let mut seen = Vec::new();
        for raw in slices.iter().filter(|raw| !raw.part_guid.is_nil()) {
            if seen.contains(&raw.part_guid) {
                return Err(CarveError::InvalidLayout(format!(
                    "duplicate partition GUID {}",
                    raw.part_guid
                )));
            }
            seen.push(raw.part_guid);
        }

        let mut ordered: Vec<&RawSlice> = slices.iter().collect();
        ordered.sort_by_key(|raw| raw.order);

        for (i, raw) in ordered.iter().enumerate() {
            if i >= header.num_part_entries as usize {
                return Err(CarveError::InvalidLayout(
                    "More slices than GPT entries".to_string(),
                ));
            }
            let entry = &mut entries[i * header.part_entry_bytes as usize..];
            let entry = &mut entry[..header.part_entry_bytes as usize];

            // A newly-created partition has no GUID yet; generate one.
            let part_guid = if raw.part_guid.is_nil() {
                Uuid::new_v4()
            } else {
                raw.part_guid
            };

            entry[0..16].copy_from_slice(&raw.type_guid.to_bytes_le());
            entry[16..32].copy_from_slice(&part_guid.to_bytes_le());
            LittleEndian::write_u64(&mut entry[32..40], raw.start_lba);
            LittleEndian::write_u64(&mut entry[40..48], raw.end_lba());
            LittleEndian::write_u64(&mut entry[48..56], raw.attributes);
        }

        self.write_entries(disk, dev, &mut header, &entries)?;
        self.write_header(disk, dev, &header)?;
        dev.flush()?;
        Ok(())
    }

    fn describe_slice(&self, raw: &RawSlice) -> String {
        let guid = raw.type_guid.to_string().to_lowercase();
        TYPE_GUIDS
            .iter()
            .find(|(g, _)| *g == guid)
            .map(|(_, name)| name.to_string())
            .unwrap_or_else(|| "Unknown".to_string())
    }

    fn can_create(&self, _slices: &[Slice], _empty_index: usize) -> CreateKind {
        // No extended/logical scheme: empty space can always take a primary.
        CreateKind::Primary
    }

    fn list_types(&self) -> Vec<TypeEntry> {
        TYPE_GUIDS
            .iter()
            .map(|(guid, name)| TypeEntry {
                id: guid.to_string(),
                name: name.to_string(),
            })
            .collect()
    }

    fn set_type(&self, raw: &mut RawSlice, index: usize) -> Result<(), CarveError> {
        let (guid, _) = TYPE_GUIDS.get(index).ok_or_else(|| {
            CarveError::Parameter(format!("no partition type with index {}", index))
        })?;
        raw.type_guid = Uuid::parse_str(guid).expect("static GUID table entry");
        Ok(())
    }

    fn set_default_type(&self, raw: &mut RawSlice) {
        raw.type_guid = Uuid::parse_str(GUID_BASIC_DATA).expect("static GUID");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carve_core::test_utils::MemoryDevice;

    fn gpt_disk() -> (Disk, MemoryDevice) {
        // 1,000,000 sectors, flat 255/63 geometry.
        let disk = Disk::new("hd1", 512, 1_000_000, 255, 63);
        let dev = MemoryDevice::new(1_000_000, 512);
        (disk, dev)
    }

    fn blank_gpt() -> (Disk, MemoryDevice) {
        let (disk, mut dev) = gpt_disk();
        GptLabel.format_blank(&disk, &mut dev).unwrap();
        (disk, dev)
    }

    #[test]
    fn test_detect_needs_protective_mbr() {
        let (disk, mut dev) = gpt_disk();
        assert!(!GptLabel.detect(&disk, &mut dev).unwrap());

        GptLabel.format_blank(&disk, &mut dev).unwrap();
        assert!(GptLabel.detect(&disk, &mut dev).unwrap());

        // And MS-DOS detection also succeeds on it, which is why probing
        // must try GPT first.
        assert!(mbr::MsdosLabel.detect(&disk, &mut dev).unwrap());
    }

    #[test]
    fn test_create_with_generated_guid() {
        let (disk, mut dev) = blank_gpt();
        let label = GptLabel;

        let mut raw = RawSlice {
            type_guid: Uuid::parse_str(GUID_BASIC_DATA).unwrap(),
            start_lba: 2048,
            size_lba: 999_966 - 2048 + 1,
            ..Default::default()
        };
        raw.set_geom_from_lba(&disk);
        label.write_table(&disk, &mut dev, &[raw]).unwrap();

        // The entry's partition GUID must be freshly generated and non-zero.
        let read = label.read_table(&disk, &mut dev).unwrap();
        assert_eq!(read.len(), 1);
        assert!(!read[0].part_guid.is_nil());
        assert_eq!(
            read[0].type_guid.to_string().to_lowercase(),
            GUID_BASIC_DATA
        );
        assert_eq!(read[0].start_lba, 2048);
        assert_eq!(read[0].end_lba(), 999_966);

        // Header checksums must hold for both copies, and the alternate at
        // the last LBA mirrors the primary with this/alt swapped.
        let mut sector = vec![0u8; 512];
        let mut dyn_dev: &mut dyn BlockDevice = &mut dev;
        dyn_dev.read_sectors(1, 1, &mut sector).unwrap();
        let primary = GptHeader::decode(&sector).unwrap();
        assert_eq!(primary.checksum(), primary.header_crc32);
        assert_eq!(primary.my_lba, 1);
        assert_eq!(primary.alt_lba, 999_999);

        dyn_dev.read_sectors(999_999, 1, &mut sector).unwrap();
        let alternate = GptHeader::decode(&sector).unwrap();
        assert_eq!(alternate.checksum(), alternate.header_crc32);
        assert_eq!(alternate.my_lba, 999_999);
        assert_eq!(alternate.alt_lba, 1);
        assert_eq!(alternate.disk_guid, primary.disk_guid);
        assert_eq!(alternate.part_entries_crc32, primary.part_entries_crc32);
    }

    #[test]
    fn test_part_guid_survives_rewrite() {
        let (disk, mut dev) = blank_gpt();
        let label = GptLabel;

        let mut raw = RawSlice {
            type_guid: Uuid::parse_str(GUID_BASIC_DATA).unwrap(),
            start_lba: 2048,
            size_lba: 100_000,
            ..Default::default()
        };
        raw.set_geom_from_lba(&disk);
        label.write_table(&disk, &mut dev, &[raw]).unwrap();
        let first = label.read_table(&disk, &mut dev).unwrap();

        label.write_table(&disk, &mut dev, &first).unwrap();
        let second = label.read_table(&disk, &mut dev).unwrap();
        assert_eq!(first[0].part_guid, second[0].part_guid);
    }

    #[test]
    fn test_alternate_header_fallback() {
        let (disk, mut dev) = blank_gpt();
        let label = GptLabel;

        let mut raw = RawSlice {
            type_guid: Uuid::parse_str(GUID_BASIC_DATA).unwrap(),
            start_lba: 2048,
            size_lba: 4096,
            ..Default::default()
        };
        raw.set_geom_from_lba(&disk);
        label.write_table(&disk, &mut dev, &[raw]).unwrap();

        // Corrupt the primary header's CRC field.
        let mut sector = dev.sector(1).to_vec();
        sector[16] ^= 0xFF;
        {
            let dyn_dev: &mut dyn BlockDevice = &mut dev;
            dyn_dev.write_sectors(1, 1, &sector).unwrap();
        }

        // Reads still work through the alternate header.
        let read = label.read_table(&disk, &mut dev).unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].start_lba, 2048);
    }

    #[test]
    fn test_write_repairs_damaged_primary_header() {
        let (disk, mut dev) = blank_gpt();
        let label = GptLabel;

        let mut raw = RawSlice {
            type_guid: Uuid::parse_str(GUID_BASIC_DATA).unwrap(),
            start_lba: 2048,
            size_lba: 4096,
            ..Default::default()
        };
        raw.set_geom_from_lba(&disk);
        label.write_table(&disk, &mut dev, &[raw]).unwrap();

        // Trash the primary header, then rewrite the table through the
        // alternate.
        let mut sector = dev.sector(1).to_vec();
        sector[16] ^= 0xFF;
        {
            let dyn_dev: &mut dyn BlockDevice = &mut dev;
            dyn_dev.write_sectors(1, 1, &sector).unwrap();
        }

        let read = label.read_table(&disk, &mut dev).unwrap();
        label.write_table(&disk, &mut dev, &read).unwrap();

        // The primary header is whole again and points where it should.
        let mut sector = vec![0u8; 512];
        let dyn_dev: &mut dyn BlockDevice = &mut dev;
        dyn_dev.read_sectors(1, 1, &mut sector).unwrap();
        let primary = GptHeader::decode(&sector).unwrap();
        assert_eq!(primary.checksum(), primary.header_crc32);
        assert_eq!(primary.my_lba, 1);
        assert_eq!(primary.alt_lba, 999_999);
        assert_eq!(primary.part_entries_lba, 2);
    }

    #[test]
    fn test_both_headers_bad_is_corrupt() {
        let (disk, mut dev) = blank_gpt();

        for lba in [1u64, 999_999] {
            let mut sector = dev.sector(lba).to_vec();
            sector[16] ^= 0xFF;
            let dyn_dev: &mut dyn BlockDevice = &mut dev;
            dyn_dev.write_sectors(lba, 1, &sector).unwrap();
        }

        match GptLabel.read_table(&disk, &mut dev) {
            Err(CarveError::Corrupt(_)) => {}
            other => panic!("expected corruption, got {:?}", other),
        }
    }

    #[test]
    fn test_type_guid_on_disk_layout() {
        // The type GUID is stored mixed-endian: the first three fields are
        // little-endian.
        let (disk, mut dev) = blank_gpt();
        let label = GptLabel;

        let mut raw = RawSlice {
            type_guid: Uuid::parse_str(GUID_BASIC_DATA).unwrap(),
            start_lba: 2048,
            size_lba: 4096,
            ..Default::default()
        };
        raw.set_geom_from_lba(&disk);
        label.write_table(&disk, &mut dev, &[raw]).unwrap();

        let entry = dev.sector(2)[..16].to_vec();
        assert_eq!(
            entry,
            [
                0xA2, 0xA0, 0xD0, 0xEB, 0xE5, 0xB9, 0x33, 0x44, 0x87, 0xC0, 0x68, 0xB6, 0xB7,
                0x26, 0x99, 0xC7
            ]
        );
    }

    #[test]
    fn test_duplicate_part_guids_rejected() {
        let (disk, mut dev) = blank_gpt();
        let label = GptLabel;

        let guid = Uuid::new_v4();
        let mut a = RawSlice {
            type_guid: Uuid::parse_str(GUID_BASIC_DATA).unwrap(),
            part_guid: guid,
            start_lba: 2048,
            size_lba: 1024,
            ..Default::default()
        };
        a.set_geom_from_lba(&disk);
        let mut b = RawSlice {
            order: 1,
            part_guid: guid,
            start_lba: 4096,
            size_lba: 1024,
            ..a.clone()
        };
        b.set_geom_from_lba(&disk);

        match label.write_table(&disk, &mut dev, &[a, b]) {
            Err(CarveError::InvalidLayout(_)) => {}
            other => panic!("expected layout error, got {:?}", other),
        }
    }

    #[test]
    fn test_describe_and_types() {
        let label = GptLabel;
        let mut raw = RawSlice::default();
        label.set_default_type(&mut raw);
        assert_eq!(label.describe_slice(&raw), "Microsoft basic data");

        raw.type_guid = Uuid::new_v4();
        assert_eq!(label.describe_slice(&raw), "Unknown");

        let types = label.list_types();
        assert!(!types.is_empty());
        label.set_type(&mut raw, 0).unwrap();
        assert_eq!(
            raw.type_guid.to_string().to_lowercase(),
            types[0].id.to_lowercase()
        );
        assert!(label.set_type(&mut raw, types.len()).is_err());
    }
}
