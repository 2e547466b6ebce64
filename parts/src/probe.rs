// Filesystem probing. The partitioner only needs a type string and the
// operation capabilities for each payload; anything deeper belongs to the
// filesystem tools themselves.

use carve_core::{BlockDevice, CarveError, Disk};

/// Which filesystem-level operations the payload supports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsOpFlags {
    pub resize: bool,
    pub resize_constraints: bool,
    pub defrag: bool,
}

#[derive(Debug, Clone)]
pub struct FsInfo {
    pub fs_type: String,
    pub op_flags: FsOpFlags,
}

impl Default for FsInfo {
    fn default() -> Self {
        FsInfo {
            fs_type: "unknown".to_string(),
            op_flags: FsOpFlags::default(),
        }
    }
}

/// External collaborator contract: inspect the payload starting at
/// `start_lba` and report its filesystem type.
pub trait FsProbe {
    fn probe(
        &self,
        disk: &Disk,
        dev: &mut dyn BlockDevice,
        start_lba: u64,
    ) -> Result<FsInfo, CarveError>;
}

/// Boot-sector signature sniffing. Enough to label slices and decide which
/// resize path applies; not a filesystem checker.
pub struct SignatureProbe;

impl SignatureProbe {
    fn classify(boot: &[u8]) -> FsInfo {
        if boot.len() < 512 {
            return FsInfo::default();
        }

        if &boot[3..11] == b"NTFS    " {
            return FsInfo {
                fs_type: "ntfs".to_string(),
                op_flags: FsOpFlags::default(),
            };
        }
        if &boot[3..11] == b"EXFAT   " {
            return FsInfo {
                fs_type: "exfat".to_string(),
                op_flags: FsOpFlags::default(),
            };
        }
        if boot.len() >= 90 && &boot[82..87] == b"FAT32" {
            return FsInfo {
                fs_type: "fat32".to_string(),
                op_flags: FsOpFlags::default(),
            };
        }
        if boot.len() >= 62 && &boot[54..59] == b"FAT16" {
            return FsInfo {
                fs_type: "fat16".to_string(),
                op_flags: FsOpFlags::default(),
            };
        }
        if boot.len() >= 57 && &boot[54..57] == b"FAT" {
            return FsInfo {
                fs_type: "fat".to_string(),
                op_flags: FsOpFlags::default(),
            };
        }

        FsInfo::default()
    }
}

impl FsProbe for SignatureProbe {
    fn probe(
        &self,
        disk: &Disk,
        dev: &mut dyn BlockDevice,
        start_lba: u64,
    ) -> Result<FsInfo, CarveError> {
        let mut boot = vec![0u8; disk.sector_size as usize];
        dev.read_sectors(start_lba, 1, &mut boot)?;
        Ok(Self::classify(&boot))
    }
}

/// Probe that reports nothing; used where no device access is wanted.
pub struct NullProbe;

impl FsProbe for NullProbe {
    fn probe(
        &self,
        _disk: &Disk,
        _dev: &mut dyn BlockDevice,
        _start_lba: u64,
    ) -> Result<FsInfo, CarveError> {
        Ok(FsInfo::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ntfs_signature() {
        let mut boot = vec![0u8; 512];
        boot[3..11].copy_from_slice(b"NTFS    ");
        assert_eq!(SignatureProbe::classify(&boot).fs_type, "ntfs");
    }

    #[test]
    fn test_fat32_signature() {
        let mut boot = vec![0u8; 512];
        boot[82..87].copy_from_slice(b"FAT32");
        assert_eq!(SignatureProbe::classify(&boot).fs_type, "fat32");
    }

    #[test]
    fn test_unknown() {
        let boot = vec![0u8; 512];
        assert_eq!(SignatureProbe::classify(&boot).fs_type, "unknown");
    }
}
