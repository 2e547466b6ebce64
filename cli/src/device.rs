// File-backed block device: disk images (or raw device nodes, where the OS
// exposes them as files) presented through the core block-device contract.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use carve_core::{BlockDevice, CarveError, Disk};

pub const SECTOR_SIZE: u32 = 512;

pub struct FileDevice {
    file: File,
    sector_size: u32,
    num_sectors: u64,
    cache_enabled: bool,
}

impl FileDevice {
    pub fn open(path: &Path) -> Result<Self, CarveError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(FileDevice {
            file,
            sector_size: SECTOR_SIZE,
            num_sectors: len / SECTOR_SIZE as u64,
            cache_enabled: true,
        })
    }

    /// Disk description for this image, with classic 255/63 geometry.
    pub fn disk(&self, name: &str) -> Disk {
        Disk::new(name, self.sector_size, self.num_sectors, 255, 63)
    }

    fn seek_to(&mut self, sector: u64) -> Result<(), CarveError> {
        self.file
            .seek(SeekFrom::Start(sector * self.sector_size as u64))?;
        Ok(())
    }
}

impl BlockDevice for FileDevice {
    fn read_sectors(&mut self, start: u64, count: u64, buf: &mut [u8]) -> Result<(), CarveError> {
        self.seek_to(start)?;
        let len = (count * self.sector_size as u64) as usize;
        self.file.read_exact(&mut buf[..len])?;
        Ok(())
    }

    fn write_sectors(&mut self, start: u64, count: u64, buf: &[u8]) -> Result<(), CarveError> {
        self.seek_to(start)?;
        let len = (count * self.sector_size as u64) as usize;
        self.file.write_all(&buf[..len])?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), CarveError> {
        self.file.sync_all()?;
        Ok(())
    }

    fn erase_sectors(&mut self, start: u64, count: u64, passes: u32) -> Result<(), CarveError> {
        // Overwrite passes of zeroes; a real device driver would alternate
        // random patterns for the higher security levels.
        let zeroes = vec![0u8; (count * self.sector_size as u64) as usize];
        for _ in 0..passes {
            self.seek_to(start)?;
            self.file.write_all(&zeroes)?;
            self.file.sync_all()?;
        }
        Ok(())
    }

    fn cache_enabled(&self) -> bool {
        self.cache_enabled
    }

    fn set_cache_enabled(&mut self, enabled: bool) {
        self.cache_enabled = enabled;
    }
}
