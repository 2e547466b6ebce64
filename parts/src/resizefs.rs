// Filesystem resize hooks. Filesystem-aware resizing is a capability
// registered at startup; when no resizer is registered for a payload type,
// plain partition resizing still works.

use std::collections::HashMap;

use carve_core::{BlockDevice, CarveError, Disk, Progress};

/// Contract for a filesystem-specific resize engine operating on the payload
/// that starts at `start_lba`.
pub trait FilesystemResizer: Send + Sync {
    /// Filesystem type string this resizer handles, e.g. "ntfs".
    fn fs_type(&self) -> &str;

    /// Report the permissible payload size range in sectors:
    /// (minimum, maximum).
    fn constraints(
        &self,
        disk: &Disk,
        dev: &mut dyn BlockDevice,
        start_lba: u64,
        size_lba: u64,
        prog: &Progress,
    ) -> Result<(u64, u64), CarveError>;

    /// Resize the payload to `new_sectors` sectors. `size_lba` is the
    /// current extent of the enclosing partition.
    fn resize(
        &self,
        disk: &Disk,
        dev: &mut dyn BlockDevice,
        start_lba: u64,
        size_lba: u64,
        new_sectors: u64,
        prog: &Progress,
    ) -> Result<(), CarveError>;
}

#[derive(Default)]
pub struct ResizerRegistry {
    resizers: HashMap<String, Box<dyn FilesystemResizer>>,
}

impl ResizerRegistry {
    pub fn new() -> Self {
        ResizerRegistry::default()
    }

    pub fn register(&mut self, resizer: Box<dyn FilesystemResizer>) {
        self.resizers.insert(resizer.fs_type().to_string(), resizer);
    }

    pub fn get(&self, fs_type: &str) -> Option<&dyn FilesystemResizer> {
        self.resizers.get(fs_type).map(|b| b.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedResizer;

    impl FilesystemResizer for FixedResizer {
        fn fs_type(&self) -> &str {
            "testfs"
        }

        fn constraints(
            &self,
            _disk: &Disk,
            _dev: &mut dyn BlockDevice,
            _start_lba: u64,
            size_lba: u64,
            _prog: &Progress,
        ) -> Result<(u64, u64), CarveError> {
            Ok((size_lba / 2, size_lba * 2))
        }

        fn resize(
            &self,
            _disk: &Disk,
            _dev: &mut dyn BlockDevice,
            _start_lba: u64,
            _size_lba: u64,
            _new_sectors: u64,
            _prog: &Progress,
        ) -> Result<(), CarveError> {
            Ok(())
        }
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = ResizerRegistry::new();
        assert!(registry.get("testfs").is_none());
        registry.register(Box::new(FixedResizer));
        assert!(registry.get("testfs").is_some());
        assert!(registry.get("ntfs").is_none());
    }
}
