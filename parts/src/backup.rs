// Partition table backup files. The format is a leading u32 record count
// followed by that many raw slice records. A temporary backup is written the
// moment a table is read for writing; it becomes the permanent per-disk
// backup only after a successful table write.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use carve_core::{CarveError, Config};
use log::warn;
use tempfile::NamedTempFile;

use crate::types::RawSlice;

pub fn write_backup<W: Write>(w: &mut W, raws: &[RawSlice]) -> Result<(), CarveError> {
    w.write_u32::<LittleEndian>(raws.len() as u32)?;
    for raw in raws {
        raw.write_record(w)?;
    }
    Ok(())
}

pub fn read_backup(path: &Path) -> Result<Vec<RawSlice>, CarveError> {
    let mut r = BufReader::new(File::open(path)?);
    let count = r.read_u32::<LittleEndian>()?;
    let mut raws = Vec::with_capacity(count as usize);
    for _ in 0..count {
        raws.push(RawSlice::read_record(&mut r)?);
    }
    Ok(raws)
}

/// The pre-mutation backup, deleted on drop unless promoted.
pub struct TempBackup {
    file: NamedTempFile,
}

impl TempBackup {
    /// Snapshot the raw slices into a temp file under the configured temp
    /// directory (falling back to the system default when it's absent).
    pub fn create(config: &Config, raws: &[RawSlice]) -> Result<Self, CarveError> {
        let file = if config.temp_dir.is_dir() {
            NamedTempFile::new_in(&config.temp_dir)?
        } else {
            NamedTempFile::new()?
        };
        let mut w = BufWriter::new(file.reopen()?);
        write_backup(&mut w, raws)?;
        w.flush()?;
        Ok(TempBackup { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Make this backup the disk's permanent one. A rename is attempted
    /// first; when the destination is on another filesystem the contents are
    /// copied instead.
    pub fn promote(self, dest: &PathBuf) -> Result<(), CarveError> {
        if let Some(parent) = dest.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        match self.file.persist(dest) {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("Backup rename failed ({}); copying instead", e.error);
                std::fs::copy(e.file.path(), dest)?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SliceKind;

    fn sample_raws() -> Vec<RawSlice> {
        vec![
            RawSlice {
                order: 0,
                tag: 0x07,
                start_lba: 16065,
                size_lba: 803_250,
                ..Default::default()
            },
            RawSlice {
                order: 1,
                kind: SliceKind::Logical,
                tag: 0x83,
                start_lba: 900_000,
                size_lba: 10_000,
                ..Default::default()
            },
        ]
    }

    #[test]
    fn test_backup_round_trip() {
        let mut buf = Vec::new();
        write_backup(&mut buf, &sample_raws()).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup-hd0.mbr");
        std::fs::write(&path, &buf).unwrap();

        let raws = read_backup(&path).unwrap();
        assert_eq!(raws.len(), 2);
        assert_eq!(raws[0].tag, 0x07);
        assert_eq!(raws[1].kind, SliceKind::Logical);
        assert_eq!(raws[1].start_lba, 900_000);
    }

    #[test]
    fn test_temp_backup_promote() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            boot_dir: dir.path().join("boot"),
            temp_dir: dir.path().to_path_buf(),
            ..Default::default()
        };

        let temp = TempBackup::create(&config, &sample_raws()).unwrap();
        let dest = config.backup_path("hd0");
        temp.promote(&dest).unwrap();

        let raws = read_backup(&dest).unwrap();
        assert_eq!(raws.len(), 2);
    }

    #[test]
    fn test_temp_backup_discarded_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            temp_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let temp = TempBackup::create(&config, &sample_raws()).unwrap();
        let path = temp.path().to_path_buf();
        drop(temp);
        assert!(!path.exists());
    }
}
