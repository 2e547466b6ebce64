// The slice model: a gap-less, ordered view of the disk where every sector
// belongs to exactly one entry, used or empty. The partition table owns the
// raw entries as read from the label plus this derived view, and runs the
// read/check/write lifecycle.

use carve_core::{BlockDevice, CarveError, Config, Disk};
use log::warn;

use crate::backup::{self, TempBackup};
use crate::label::{detect_label, Label};
use crate::probe::{FsOpFlags, FsProbe};
use crate::types::{ChsAddr, RawSlice, SliceKind};

// Column widths of the fixed-width description row.
const DISK_FIELD_WIDTH: usize = 5;
const LABEL_FIELD_WIDTH: usize = 22;
const FSTYPE_FIELD_WIDTH: usize = 11;
const CYLS_FIELD_WIDTH: usize = 14;
const SIZE_FIELD_WIDTH: usize = 9;

/// One entry of the derived view: a used partition or a run of empty space.
#[derive(Debug, Clone)]
pub struct Slice {
    pub raw: RawSlice,
    pub used: bool,
    /// Name of the payload device, e.g. "hd0a".
    pub disk_name: String,
    pub display_name: String,
    pub fs_type: String,
    pub op_flags: FsOpFlags,
    /// The rendered fixed-width description row.
    pub row: String,
}

fn payload_suffix(order: u32) -> String {
    if order < 26 {
        ((b'a' + order as u8) as char).to_string()
    } else {
        format!("p{}", order + 1)
    }
}

impl Slice {
    pub fn from_raw(raw: RawSlice, disk: &Disk) -> Self {
        let disk_name = format!("{}{}", disk.name, payload_suffix(raw.order));
        Slice {
            raw,
            used: true,
            display_name: disk_name.clone(),
            disk_name,
            fs_type: "unknown".to_string(),
            op_flags: FsOpFlags::default(),
            row: String::new(),
        }
    }

    pub fn empty(raw: RawSlice) -> Self {
        Slice {
            raw,
            used: false,
            disk_name: String::new(),
            display_name: String::new(),
            fs_type: "unknown".to_string(),
            op_flags: FsOpFlags::default(),
            row: String::new(),
        }
    }

    pub fn is_logical(&self) -> bool {
        self.used && self.raw.kind == SliceKind::Logical
    }
}

/// Outcome of the consistency check.
#[derive(Debug, Default)]
pub struct CheckReport {
    pub problems: Vec<String>,
    pub fixed: bool,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

pub struct PartitionTable {
    pub disk: Disk,
    pub label: Box<dyn Label>,
    /// Raw entries as last read from, or about to be written to, the label.
    pub raw_slices: Vec<RawSlice>,
    /// Derived view: used slices and empty spaces in LBA order.
    pub slices: Vec<Slice>,
    pub selected: usize,
    pub changes_pending: u32,
    pub backup_available: bool,
    /// Set once the user declines a repair so the question isn't re-asked.
    pub check_ignore: bool,
    temp_backup: Option<TempBackup>,
}

impl PartitionTable {
    /// Construct the table for a disk: detect the label (GPT before MS-DOS,
    /// because a GPT disk carries a valid protective MBR), read the raw
    /// entries, derive the slice view, and snapshot a temporary backup when
    /// mutation is possible.
    pub fn read(
        disk: &Disk,
        dev: &mut dyn BlockDevice,
        config: &Config,
        read_only: bool,
    ) -> Result<Self, CarveError> {
        let (label, detected): (Box<dyn Label>, bool) = match detect_label(disk, dev)? {
            Some(label) => (label, true),
            None => {
                warn!(
                    "Unknown disk label on {}; writing changes will create an MS-DOS label",
                    disk.name
                );
                (Box::new(crate::mbr::MsdosLabel), false)
            }
        };

        let raw_slices = if detected {
            match label.read_table(disk, dev) {
                Ok(raws) => raws,
                Err(e) => {
                    warn!(
                        "Error reading partition table on {}: {}; data may be incorrect",
                        disk.name, e
                    );
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let mut table = PartitionTable {
            disk: disk.clone(),
            label,
            raw_slices,
            slices: Vec::new(),
            selected: 0,
            changes_pending: 0,
            backup_available: config.backup_path(&disk.name).exists(),
            check_ignore: false,
            temp_backup: None,
        };

        if !read_only {
            match TempBackup::create(config, &table.raw_slices) {
                Ok(tb) => table.temp_backup = Some(tb),
                Err(e) => warn!("Can't create backup file: {}", e),
            }
        }

        table.make_slice_list();
        Ok(table)
    }

    /// Rebuild the slice view from the raw entries, ordered by start LBA.
    pub fn make_slice_list(&mut self) {
        let mut raws = self.raw_slices.clone();
        raws.sort_by_key(|raw| raw.start_lba);

        self.slices = raws
            .into_iter()
            .map(|raw| Slice::from_raw(raw, &self.disk))
            .collect();

        self.update_slice_list();
    }

    /// Re-derive the empty slices and refresh names and description rows.
    pub fn update_slice_list(&mut self) {
        self.update_empty_slices();

        let use_guids = self.label.caps().use_guids;
        for i in 0..self.slices.len() {
            if self.slices[i].used {
                let order = self.slices[i].raw.order;
                self.slices[i].disk_name =
                    format!("{}{}", self.disk.name, payload_suffix(order));
                self.slices[i].display_name = if use_guids {
                    format!("{}", order + 1)
                } else {
                    self.slices[i].disk_name.clone()
                };
            }
            self.slices[i].row = self.make_row(i);
        }
    }

    /// Query the filesystem probe for every used slice. Separate from
    /// `update_slice_list` because it needs the device.
    pub fn refresh_fs_info(&mut self, dev: &mut dyn BlockDevice, probe: &dyn FsProbe) {
        for i in 0..self.slices.len() {
            if !self.slices[i].used {
                continue;
            }
            match probe.probe(&self.disk, dev, self.slices[i].raw.start_lba) {
                Ok(info) => {
                    self.slices[i].fs_type = info.fs_type;
                    self.slices[i].op_flags = info.op_flags;
                }
                Err(e) => {
                    warn!("Filesystem probe failed on {}: {}", self.slices[i].disk_name, e);
                }
            }
            self.slices[i].row = self.make_row(i);
        }
    }

    fn make_empty_slice(&self, start_cylinder: u64, end_cylinder: u64) -> Slice {
        let cyl_sectors = self.disk.cylinder_sectors();
        let mut raw = RawSlice::default();
        raw.start_lba = start_cylinder * cyl_sectors;
        raw.size_lba = (end_cylinder - start_cylinder + 1) * cyl_sectors;
        raw.geom.start = ChsAddr::from_lba(&self.disk, raw.start_lba);
        raw.geom.end = ChsAddr::from_lba(&self.disk, raw.end_lba());
        Slice::empty(raw)
    }

    /// Make the empty slices reflect the actual empty spaces: every cylinder
    /// gap between used slices gets one, as does the tail of the disk.
    pub fn update_empty_slices(&mut self) {
        self.slices.retain(|s| s.used);
        self.slices.sort_by_key(|s| s.raw.start_lba);

        let mut i = 0;
        while i < self.slices.len() {
            let start_cyl = self.slices[i].raw.geom.start.cylinder;
            let prev_end = if i == 0 {
                None
            } else {
                Some(self.slices[i - 1].raw.geom.end.cylinder)
            };

            let gap_start = match prev_end {
                None if start_cyl > 0 => Some(0),
                Some(prev) if start_cyl > prev + 1 => Some(prev + 1),
                _ => None,
            };

            if let Some(gap_start) = gap_start {
                let empty = self.make_empty_slice(gap_start, start_cyl - 1);
                self.slices.insert(i, empty);
                i += 1;
            }
            i += 1;
        }

        // Empty space at the end of the disk?
        let last_cyl = self.disk.geometry.cylinders - 1;
        let tail_start = match self.slices.last() {
            None => Some(0),
            Some(last) if last.raw.geom.end.cylinder < last_cyl => {
                Some(last.raw.geom.end.cylinder + 1)
            }
            _ => None,
        };
        if let Some(tail_start) = tail_start {
            let empty = self.make_empty_slice(tail_start, last_cyl);
            self.slices.push(empty);
        }
    }

    fn pad_to(row: &mut String, width: usize) {
        let printed = row.chars().count();
        if printed < width {
            row.push_str(&" ".repeat(width - printed));
        } else {
            row.push(' ');
        }
    }

    /// Build the fixed-width description row for one slice.
    fn make_row(&self, index: usize) -> String {
        let slc = &self.slices[index];
        let mut row = String::new();
        let mut width = 0;

        if slc.used {
            row.push_str(&slc.display_name);
            width += DISK_FIELD_WIDTH;
            Self::pad_to(&mut row, width);

            row.push_str(&self.label.describe_slice(&slc.raw));
            width += LABEL_FIELD_WIDTH;
            Self::pad_to(&mut row, width);

            row.push_str(&slc.fs_type);
        } else {
            width += DISK_FIELD_WIDTH;
            Self::pad_to(&mut row, width);
            row.push_str("Empty space");
            width += LABEL_FIELD_WIDTH;
            Self::pad_to(&mut row, width);
        }
        width += FSTYPE_FIELD_WIDTH;
        Self::pad_to(&mut row, width);

        row.push_str(&format!(
            "{}-{}",
            slc.raw.geom.start.cylinder, slc.raw.geom.end.cylinder
        ));
        width += CYLS_FIELD_WIDTH;
        Self::pad_to(&mut row, width);

        let cylinders = slc.raw.geom.end.cylinder - slc.raw.geom.start.cylinder + 1;
        row.push_str(&format!("{}", self.disk.cylinders_to_mb(cylinders)));
        width += SIZE_FIELD_WIDTH;

        if slc.used {
            Self::pad_to(&mut row, width);
            row.push_str(if slc.is_logical() { "logical" } else { "primary" });
            if slc.raw.bootable {
                row.push_str("/active");
            }
        }

        row
    }

    /// Check that every used slice's stored CHS values agree with what its
    /// LBA values imply under the disk geometry. With `fix`, rewrite the
    /// stored values (each fix raises the pending-change counter).
    pub fn check_table(&mut self, fix: bool) -> CheckReport {
        let cyl_sectors = self.disk.cylinder_sectors();
        let spt = self.disk.geometry.sectors_per_track as u64;
        let mut report = CheckReport {
            fixed: fix,
            ..Default::default()
        };

        for slc in self.slices.iter_mut().filter(|s| s.used) {
            let end_lba = slc.raw.end_lba();
            let name = slc.disk_name.clone();

            let mut fixes = 0u32;

            // (description, stored value, expected value, fixer)
            let checks: [(&str, u64, u64, fn(&mut RawSlice, u64)); 6] = [
                (
                    "starting cylinder",
                    slc.raw.geom.start.cylinder,
                    slc.raw.start_lba / cyl_sectors,
                    |raw, v| raw.geom.start.cylinder = v,
                ),
                (
                    "ending cylinder",
                    slc.raw.geom.end.cylinder,
                    end_lba / cyl_sectors,
                    |raw, v| raw.geom.end.cylinder = v,
                ),
                (
                    "starting head",
                    slc.raw.geom.start.head as u64,
                    (slc.raw.start_lba % cyl_sectors) / spt,
                    |raw, v| raw.geom.start.head = v as u32,
                ),
                (
                    "ending head",
                    slc.raw.geom.end.head as u64,
                    (end_lba % cyl_sectors) / spt,
                    |raw, v| raw.geom.end.head = v as u32,
                ),
                (
                    "starting CHS sector",
                    slc.raw.geom.start.sector as u64,
                    (slc.raw.start_lba % cyl_sectors) % spt + 1,
                    |raw, v| raw.geom.start.sector = v as u32,
                ),
                (
                    "ending CHS sector",
                    slc.raw.geom.end.sector as u64,
                    (end_lba % cyl_sectors) % spt + 1,
                    |raw, v| raw.geom.end.sector = v as u32,
                ),
            ];

            for (field, stored, wanted, apply) in checks {
                if stored != wanted {
                    report.problems.push(format!(
                        "Partition {} {} is {}, should be {}",
                        name, field, stored, wanted
                    ));
                    if fix {
                        apply(&mut slc.raw, wanted);
                        fixes += 1;
                    }
                }
            }

            self.changes_pending += fixes;
        }

        if fix && !report.problems.is_empty() {
            self.update_slice_list();
        }

        report
    }

    /// Serialize the used slices back into the raw list, in label order.
    pub fn rebuild_raw_slices(&mut self) {
        let mut raws: Vec<RawSlice> = self
            .slices
            .iter()
            .filter(|s| s.used)
            .map(|s| s.raw.clone())
            .collect();
        raws.sort_by_key(|raw| raw.order);
        self.raw_slices = raws;
    }

    /// Write the table to the device. The consistency check runs first; a
    /// failing check aborts unless `force` is set. On success the temporary
    /// backup becomes the permanent per-disk backup and the pending-change
    /// counter clears.
    pub fn write(
        &mut self,
        dev: &mut dyn BlockDevice,
        config: &Config,
        force: bool,
    ) -> Result<(), CarveError> {
        // New GPT partitions get their GUID here so later writes keep it.
        if self.label.caps().use_guids {
            for s in self
                .slices
                .iter_mut()
                .filter(|s| s.used && s.raw.part_guid.is_nil())
            {
                s.raw.part_guid = uuid::Uuid::new_v4();
            }
        }

        self.rebuild_raw_slices();

        // Overlapping slices are never writable, consent or not.
        let mut by_start: Vec<&RawSlice> = self.raw_slices.iter().collect();
        by_start.sort_by_key(|raw| raw.start_lba);
        for pair in by_start.windows(2) {
            if pair[0].start_lba + pair[0].size_lba > pair[1].start_lba {
                return Err(CarveError::InvalidLayout(format!(
                    "slices at sectors {} and {} overlap",
                    pair[0].start_lba, pair[1].start_lba
                )));
            }
        }

        let report = self.check_table(false);
        if !report.is_clean() && !force {
            return Err(CarveError::InvalidLayout(format!(
                "Partition table consistency check failed:\n{}",
                report.problems.join("\n")
            )));
        }

        self.label.write_table(&self.disk, dev, &self.raw_slices)?;
        dev.flush()?;

        if let Some(tb) = self.temp_backup.take() {
            let dest = config.backup_path(&self.disk.name);
            if let Err(e) = tb.promote(&dest) {
                warn!("Couldn't promote backup file: {}", e);
            } else {
                self.backup_available = true;
            }
        }

        self.changes_pending = 0;
        Ok(())
    }

    /// Throw away pending changes and rebuild from the last-read raw slices.
    pub fn undo(&mut self) {
        if self.changes_pending > 0 {
            self.make_slice_list();
            self.selected = 0;
            self.changes_pending = 0;
        }
    }

    /// Replace the raw slices from the permanent backup file. The result is
    /// left as pending changes; nothing touches the device.
    pub fn restore_backup(&mut self, config: &Config) -> Result<(), CarveError> {
        let raws = backup::read_backup(&config.backup_path(&self.disk.name))?;
        self.raw_slices = raws;
        self.make_slice_list();
        self.changes_pending += 1;
        Ok(())
    }

    pub fn slice_count(&self) -> usize {
        self.slices.len()
    }

    /// Index of the slice whose payload starts at the given cylinder, if any.
    pub fn find_by_start_cylinder(&self, cylinder: u64) -> Option<usize> {
        self.slices
            .iter()
            .position(|s| s.raw.geom.start.cylinder == cylinder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mbr::MsdosLabel;
    use crate::types::SliceKind;
    use carve_core::test_utils::{test_disk, MemoryDevice};

    fn raw(disk: &Disk, order: u32, start_cyl: u64, end_cyl: u64, tag: u8) -> RawSlice {
        let cyl = disk.cylinder_sectors();
        let mut raw = RawSlice {
            order,
            tag,
            start_lba: start_cyl * cyl + if start_cyl == 0 { 63 } else { 0 },
            ..Default::default()
        };
        raw.size_lba = (end_cyl + 1) * cyl - raw.start_lba;
        raw.set_geom_from_lba(disk);
        raw
    }

    fn table_with(disk: &Disk, raws: Vec<RawSlice>) -> PartitionTable {
        let mut table = PartitionTable {
            disk: disk.clone(),
            label: Box::new(MsdosLabel),
            raw_slices: raws,
            slices: Vec::new(),
            selected: 0,
            changes_pending: 0,
            backup_available: false,
            check_ignore: false,
            temp_backup: None,
        };
        table.make_slice_list();
        table
    }

    #[test]
    fn test_slices_tile_the_disk() {
        let disk = test_disk("hd0", 100);
        let table = table_with(
            &disk,
            vec![raw(&disk, 0, 10, 20, 0x07), raw(&disk, 1, 40, 60, 0x83)],
        );

        // used at [10,20] and [40,60]; empties fill [0,9], [21,39], [61,99].
        assert_eq!(table.slices.len(), 5);
        let spans: Vec<(u64, u64, bool)> = table
            .slices
            .iter()
            .map(|s| {
                (
                    s.raw.geom.start.cylinder,
                    s.raw.geom.end.cylinder,
                    s.used,
                )
            })
            .collect();
        assert_eq!(
            spans,
            vec![
                (0, 9, false),
                (10, 20, true),
                (21, 39, false),
                (40, 60, true),
                (61, 99, false)
            ]
        );

        // LBA coverage is gap-free from 0 to the end of the last cylinder.
        let mut next = 0u64;
        for s in &table.slices {
            let start = s.raw.geom.start.cylinder * disk.cylinder_sectors();
            assert_eq!(start, next);
            next = (s.raw.geom.end.cylinder + 1) * disk.cylinder_sectors();
        }
        assert_eq!(next, disk.num_sectors);
    }

    #[test]
    fn test_update_empty_slices_idempotent() {
        let disk = test_disk("hd0", 100);
        let mut table = table_with(&disk, vec![raw(&disk, 0, 5, 30, 0x07)]);

        let before: Vec<(u64, u64, bool)> = table
            .slices
            .iter()
            .map(|s| (s.raw.start_lba, s.raw.size_lba, s.used))
            .collect();
        table.update_empty_slices();
        let after: Vec<(u64, u64, bool)> = table
            .slices
            .iter()
            .map(|s| (s.raw.start_lba, s.raw.size_lba, s.used))
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_empty_disk_is_one_empty_slice() {
        let disk = test_disk("hd0", 100);
        let table = table_with(&disk, vec![]);
        assert_eq!(table.slices.len(), 1);
        assert!(!table.slices[0].used);
        assert_eq!(table.slices[0].raw.geom.end.cylinder, 99);
    }

    #[test]
    fn test_check_table_fix_is_idempotent() {
        let disk = test_disk("hd0", 100);
        let mut table = table_with(&disk, vec![raw(&disk, 0, 10, 20, 0x07)]);

        // Corrupt the stored geometry.
        let idx = table.slices.iter().position(|s| s.used).unwrap();
        table.slices[idx].raw.geom.start.cylinder = 11;
        table.slices[idx].raw.geom.end.head = 7;

        let report = table.check_table(false);
        assert_eq!(report.problems.len(), 2);
        assert_eq!(table.changes_pending, 0);

        let report = table.check_table(true);
        assert_eq!(report.problems.len(), 2);
        assert_eq!(table.changes_pending, 2);

        let report = table.check_table(true);
        assert!(report.is_clean());
        assert_eq!(table.changes_pending, 2);
    }

    #[test]
    fn test_write_promotes_backup_and_clears_pending(){
        let disk = test_disk("hd0", 100);
        let mut dev = MemoryDevice::new(disk.num_sectors, 512);
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            boot_dir: dir.path().join("boot"),
            temp_dir: dir.path().to_path_buf(),
            ..Default::default()
        };

        // Start with a labelled disk so read() can parse it.
        MsdosLabel
            .write_table(&disk, &mut dev, &[raw(&disk, 0, 1, 20, 0x07)])
            .unwrap();

        let mut table = PartitionTable::read(&disk, &mut dev, &config, false).unwrap();
        assert!(!table.backup_available);

        table.changes_pending = 1;
        table.write(&mut dev, &config, false).unwrap();
        assert_eq!(table.changes_pending, 0);
        assert!(table.backup_available);
        assert!(config.backup_path("hd0").exists());

        let raws = backup::read_backup(&config.backup_path("hd0")).unwrap();
        assert_eq!(raws.len(), 1);
        assert_eq!(raws[0].tag, 0x07);
    }

    #[test]
    fn test_restore_backup_leaves_pending_changes() {
        let disk = test_disk("hd0", 100);
        let mut dev = MemoryDevice::new(disk.num_sectors, 512);
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            boot_dir: dir.path().join("boot"),
            temp_dir: dir.path().to_path_buf(),
            ..Default::default()
        };

        MsdosLabel
            .write_table(&disk, &mut dev, &[raw(&disk, 0, 1, 20, 0x07)])
            .unwrap();
        let mut table = PartitionTable::read(&disk, &mut dev, &config, false).unwrap();
        table.write(&mut dev, &config, false).unwrap();

        // Wipe the table in memory, then restore from the backup.
        table.slices.retain(|s| !s.used);
        table.rebuild_raw_slices();
        assert!(table.raw_slices.is_empty());

        table.restore_backup(&config).unwrap();
        assert_eq!(table.raw_slices.len(), 1);
        assert_eq!(table.raw_slices[0].tag, 0x07);
        assert_eq!(table.changes_pending, 1);
    }

    #[test]
    fn test_gpt_part_guid_stable_across_writes() {
        let disk = Disk::new("hd1", 512, 1_000_000, 255, 63);
        let mut dev = MemoryDevice::new(1_000_000, 512);
        crate::gpt::GptLabel.format_blank(&disk, &mut dev).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            boot_dir: dir.path().join("boot"),
            temp_dir: dir.path().to_path_buf(),
            ..Default::default()
        };

        let mut table = PartitionTable::read(&disk, &mut dev, &config, false).unwrap();
        assert!(table.label.caps().use_guids);

        crate::ops::create(&mut table, 0, SliceKind::Primary, 1, 40).unwrap();
        table.write(&mut dev, &config, false).unwrap();

        let first_guid = table
            .slices
            .iter()
            .find(|s| s.used)
            .unwrap()
            .raw
            .part_guid;
        assert!(!first_guid.is_nil());

        table.changes_pending = 1;
        table.write(&mut dev, &config, false).unwrap();
        let read = table.label.read_table(&disk, &mut dev).unwrap();
        assert_eq!(read[0].part_guid, first_guid);
    }

    #[test]
    fn test_overlapping_slices_refuse_to_write() {
        let disk = test_disk("hd0", 100);
        let mut dev = MemoryDevice::new(disk.num_sectors, 512);
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            boot_dir: dir.path().join("boot"),
            temp_dir: dir.path().to_path_buf(),
            ..Default::default()
        };

        let mut table = table_with(
            &disk,
            vec![raw(&disk, 0, 10, 30, 0x07), raw(&disk, 1, 40, 60, 0x83)],
        );
        // Stretch the first slice over the second.
        let first = table.slices.iter().position(|s| s.used).unwrap();
        table.slices[first].raw.size_lba = 45 * disk.cylinder_sectors();

        match table.write(&mut dev, &config, true) {
            Err(CarveError::InvalidLayout(msg)) => assert!(msg.contains("overlap")),
            other => panic!("expected overlap refusal, got {:?}", other),
        }
    }

    #[test]
    fn test_description_rows() {
        let disk = test_disk("hd0", 100);
        let mut raws = vec![raw(&disk, 0, 1, 20, 0x07)];
        raws[0].bootable = true;
        let mut table = table_with(&disk, raws);
        table.slices.iter_mut().for_each(|s| {
            if s.used {
                s.fs_type = "ntfs".to_string();
            }
        });
        table.update_slice_list();

        let used_row = &table
            .slices
            .iter()
            .find(|s| s.used)
            .unwrap()
            .row;
        assert!(used_row.starts_with("hd0a"));
        assert!(used_row.contains("NTFS or HPFS"));
        assert!(used_row.contains("1-20"));
        assert!(used_row.contains("primary/active"));

        let empty_row = &table.slices[0].row;
        assert!(empty_row.contains("Empty space"));
    }
}
