use serde::{Deserialize, Serialize};

use crate::CarveError;

/// Logical disk geometry. The cylinder count may disagree with what
/// `cylinders * heads * sectors_per_track` suggests; the LBA sector count is
/// authoritative and `Disk::new` re-derives cylinders from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskGeometry {
    pub cylinders: u64,
    pub heads: u32,
    pub sectors_per_track: u32,
}

impl DiskGeometry {
    /// Sectors in one cylinder (heads x sectors per track).
    pub fn cylinder_sectors(&self) -> u64 {
        self.heads as u64 * self.sectors_per_track as u64
    }
}

/// A physical (or physical-looking) disk as the partitioner sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Disk {
    pub name: String,
    pub sector_size: u32,
    pub num_sectors: u64,
    pub geometry: DiskGeometry,
    /// BIOS-style device number; 0x80 + this goes into FAT BPB fixups.
    pub device_number: u32,
}

impl Disk {
    pub fn new(
        name: &str,
        sector_size: u32,
        num_sectors: u64,
        heads: u32,
        sectors_per_track: u32,
    ) -> Self {
        let cyl_sectors = heads as u64 * sectors_per_track as u64;
        Disk {
            name: name.to_string(),
            sector_size,
            num_sectors,
            geometry: DiskGeometry {
                cylinders: num_sectors / cyl_sectors,
                heads,
                sectors_per_track,
            },
            device_number: 0,
        }
    }

    pub fn cylinder_sectors(&self) -> u64 {
        self.geometry.cylinder_sectors()
    }

    pub fn size_bytes(&self) -> u64 {
        self.num_sectors * self.sector_size as u64
    }

    /// Whole megabytes spanned by the given cylinder count, rounded so a
    /// non-empty range never reports zero.
    pub fn cylinders_to_mb(&self, cylinders: u64) -> u64 {
        let mb = (cylinders * self.cylinder_sectors()) / (1_048_576 / self.sector_size as u64);
        mb.max(1)
    }

    /// Cylinders needed to hold the given number of megabytes, rounded up.
    pub fn mb_to_cylinders(&self, megabytes: u64) -> u64 {
        let sectors = (1_048_576 / self.sector_size as u64) * megabytes;
        let mut cylinders = sectors / self.cylinder_sectors();
        if sectors % self.cylinder_sectors() != 0 {
            cylinders += 1;
        }
        cylinders
    }
}

/// Random-access sector device. One operation is in flight per device at a
/// time; mutability enforces the exclusion.
pub trait BlockDevice: Send {
    fn read_sectors(&mut self, start: u64, count: u64, buf: &mut [u8]) -> Result<(), CarveError>;
    fn write_sectors(&mut self, start: u64, count: u64, buf: &[u8]) -> Result<(), CarveError>;
    fn flush(&mut self) -> Result<(), CarveError>;

    /// Securely erase a sector range with the given number of overwrite
    /// passes.
    fn erase_sectors(&mut self, start: u64, count: u64, passes: u32) -> Result<(), CarveError>;

    fn cache_enabled(&self) -> bool {
        false
    }

    /// Toggle the device write cache. Long raw copies disable it for their
    /// duration.
    fn set_cache_enabled(&mut self, _enabled: bool) {}
}
