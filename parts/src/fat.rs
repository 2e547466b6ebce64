// FAT BPB geometry fixup. A FAT payload copied to another disk keeps its old
// sectors-per-track / head-count / BIOS drive number; these must be patched
// to the destination disk's geometry or DOS-family systems misread it.

use byteorder::{ByteOrder, LittleEndian};
use carve_core::{BlockDevice, CarveError, Disk};
use log::debug;

const BPB_SECTORS_PER_TRACK: usize = 0x18;
const BPB_NUM_HEADS: usize = 0x1A;
const BPB_DRIVE_NUMBER_FAT: usize = 0x24;
const BPB_DRIVE_NUMBER_FAT32: usize = 0x40;

/// Rewrite the geometry fields of the FAT boot sector at `start_lba` to
/// match the disk. `fs_type` decides which drive-number slot applies.
pub fn set_fat_geometry(
    disk: &Disk,
    dev: &mut dyn BlockDevice,
    start_lba: u64,
    fs_type: &str,
) -> Result<(), CarveError> {
    let mut boot = vec![0u8; disk.sector_size as usize];
    dev.read_sectors(start_lba, 1, &mut boot)?;

    LittleEndian::write_u16(
        &mut boot[BPB_SECTORS_PER_TRACK..],
        disk.geometry.sectors_per_track as u16,
    );
    LittleEndian::write_u16(&mut boot[BPB_NUM_HEADS..], disk.geometry.heads as u16);

    let drive_offset = if fs_type == "fat32" {
        BPB_DRIVE_NUMBER_FAT32
    } else {
        BPB_DRIVE_NUMBER_FAT
    };
    boot[drive_offset] = 0x80 + disk.device_number as u8;

    debug!(
        "Set FAT geometry at sector {}: {} heads, {} sectors/track",
        start_lba, disk.geometry.heads, disk.geometry.sectors_per_track
    );

    dev.write_sectors(start_lba, 1, &boot)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use carve_core::test_utils::MemoryDevice;

    #[test]
    fn test_fat32_fields_rewritten() {
        let mut disk = Disk::new("hd1", 512, 4096, 128, 32);
        disk.device_number = 1;
        let mut dev = MemoryDevice::new(4096, 512);

        set_fat_geometry(&disk, &mut dev, 100, "fat32").unwrap();

        let boot = dev.sector(100);
        assert_eq!(LittleEndian::read_u16(&boot[BPB_SECTORS_PER_TRACK..]), 32);
        assert_eq!(LittleEndian::read_u16(&boot[BPB_NUM_HEADS..]), 128);
        assert_eq!(boot[BPB_DRIVE_NUMBER_FAT32], 0x81);
        assert_eq!(boot[BPB_DRIVE_NUMBER_FAT], 0);
    }

    #[test]
    fn test_fat16_drive_number_slot() {
        let disk = Disk::new("hd0", 512, 4096, 255, 63);
        let mut dev = MemoryDevice::new(4096, 512);

        set_fat_geometry(&disk, &mut dev, 0, "fat16").unwrap();
        assert_eq!(dev.sector(0)[BPB_DRIVE_NUMBER_FAT], 0x80);
    }
}
