use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::CarveError;

/// Tool configuration: where backups, the simple-MBR image, and temporary
/// files live. Loaded from a JSON file when present, defaults otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding per-disk backup files and the simple MBR image.
    pub boot_dir: PathBuf,
    /// Directory for the temporary pre-mutation backup.
    pub temp_dir: PathBuf,
    /// File name of the 446-byte simple boot loader image inside `boot_dir`.
    pub simple_mbr_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            boot_dir: PathBuf::from("/system/boot"),
            temp_dir: PathBuf::from("/temp"),
            simple_mbr_file: "mbr.simple".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, CarveError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn load_or_default(path: &Path) -> Self {
        match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                log::debug!("No config at {}: {}; using defaults", path.display(), e);
                Config::default()
            }
        }
    }

    /// Path of the permanent backup file for the named disk.
    pub fn backup_path(&self, disk_name: &str) -> PathBuf {
        self.boot_dir.join(format!("backup-{}.mbr", disk_name))
    }

    pub fn simple_mbr_path(&self) -> PathBuf {
        self.boot_dir.join(&self.simple_mbr_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_path_per_disk() {
        let config = Config::default();
        assert_eq!(
            config.backup_path("hd0"),
            PathBuf::from("/system/boot/backup-hd0.mbr")
        );
    }

    #[test]
    fn test_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("carve.json");
        let mut config = Config::default();
        config.boot_dir = PathBuf::from("/opt/boot");
        std::fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.boot_dir, PathBuf::from("/opt/boot"));
        assert_eq!(loaded.simple_mbr_file, "mbr.simple");
    }

    #[test]
    fn test_missing_config_falls_back() {
        let config = Config::load_or_default(Path::new("/nonexistent/carve.json"));
        assert_eq!(config.temp_dir, PathBuf::from("/temp"));
    }
}
