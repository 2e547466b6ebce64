// The interactive disk manager. All the heavy lifting lives in the library
// crates; this binary sequences user-chosen operations, renders progress,
// and commits or rolls back.

mod device;

use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context};
use carve_core::{Config, Progress};
use carve_parts::ops;
use carve_parts::probe::SignatureProbe;
use carve_parts::table::Slice;
use carve_parts::types::{CreateKind, SliceKind};
use carve_parts::{Clipboard, EraseLevel, MountedDecision, PartitionTable, ResizerRegistry};
use clap::Parser;
use log::warn;

use device::FileDevice;

#[derive(Parser)]
#[command(name = "carve")]
#[command(about = "Disk partitioning and filesystem manipulation tool", long_about = None)]
struct Cli {
    /// Force text mode (no graphics; operation semantics are identical).
    #[arg(short = 'T', long = "text")]
    _text_mode: bool,

    /// Clear the named disk's partition table on startup.
    #[arg(short = 'o', long = "clear")]
    clear: Option<PathBuf>,

    /// Configuration file.
    #[arg(long, default_value = "carve.json")]
    config: PathBuf,

    /// Disk image to select.
    disk: Option<PathBuf>,
}

struct Session {
    config: Config,
    disk_path: PathBuf,
    dev: FileDevice,
    table: PartitionTable,
    clipboard: Clipboard,
    resizers: ResizerRegistry,
}

fn prompt(text: &str) -> anyhow::Result<String> {
    print!("{}", text);
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn yes_or_no(question: &str) -> anyhow::Result<bool> {
    loop {
        let answer = prompt(&format!("{} (y/n): ", question))?;
        match answer.as_str() {
            "y" | "Y" => return Ok(true),
            "n" | "N" => return Ok(false),
            _ => continue,
        }
    }
}

fn disk_name(path: &PathBuf) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "disk".to_string())
}

impl Session {
    fn open(config: Config, path: PathBuf) -> anyhow::Result<Self> {
        let mut dev = FileDevice::open(&path)
            .with_context(|| format!("can't open disk image {}", path.display()))?;
        let disk = dev.disk(&disk_name(&path));
        let mut table = PartitionTable::read(&disk, &mut dev, &config, false)?;
        table.refresh_fs_info(&mut dev, &SignatureProbe);

        Ok(Session {
            config,
            disk_path: path,
            dev,
            table,
            clipboard: Clipboard::default(),
            resizers: ResizerRegistry::new(),
        })
    }

    /// The mounted check. Disk images have no mount state; a platform port
    /// would look the payload up in the mount table and offer
    /// ignore/unmount/cancel.
    fn mounted_check(&self, _slice: &Slice) -> MountedDecision {
        MountedDecision::Proceed
    }

    fn show(&self) {
        let disk = &self.table.disk;
        println!(
            "\nDisk {}: {} MB, {} cyls, {} heads, {} secs/track, {} bytes/sec",
            disk.name,
            disk.size_bytes() / 1_048_576,
            disk.geometry.cylinders,
            disk.geometry.heads,
            disk.geometry.sectors_per_track,
            disk.sector_size
        );
        if self.table.changes_pending > 0 {
            println!("({} changes pending)", self.table.changes_pending);
        }
        for (i, slice) in self.table.slices.iter().enumerate() {
            let marker = if i == self.table.selected { '>' } else { ' ' };
            println!("{} {:2}  {}", marker, i, slice.row);
        }
    }

    fn select_slice(&mut self) -> anyhow::Result<usize> {
        let line = prompt("Slice number: ")?;
        let index: usize = line.parse().context("not a slice number")?;
        if index >= self.table.slices.len() {
            bail!("no slice {}", index);
        }
        self.table.selected = index;
        Ok(index)
    }

    fn create(&mut self) -> anyhow::Result<()> {
        let index = self.select_slice()?;
        if self.table.slices[index].used {
            bail!("slice {} is not empty space", index);
        }

        let kind = match self.table.label.can_create(&self.table.slices, index) {
            CreateKind::None => bail!("no partition can be created there"),
            CreateKind::Primary => SliceKind::Primary,
            CreateKind::Logical => SliceKind::Logical,
            CreateKind::Any => {
                let choice = prompt("Partition type ([p]rimary/[l]ogical): ")?;
                match choice.as_str() {
                    "l" | "L" => SliceKind::Logical,
                    _ => SliceKind::Primary,
                }
            }
        };

        let min_start = self.table.slices[index].raw.geom.start.cylinder;
        let max_end = self.table.slices[index].raw.geom.end.cylinder;
        let start: u64 = prompt(&format!("Starting cylinder ({}-{}): ", min_start, max_end))?
            .parse()
            .context("not a cylinder number")?;
        let end_input = prompt(&format!(
            "Ending cylinder ({}-{}), or size in megabytes (<n>m) or cylinders (<n>c): ",
            start, max_end
        ))?;
        let end = ops::parse_end_cylinder(&self.table.disk, start, &end_input)?;

        let new_index = ops::create(&mut self.table, index, kind, start, end)?;
        self.table.selected = new_index;

        // Offer the type list; cancelling removes the just-created slice.
        if let Err(e) = self.choose_type(new_index) {
            warn!("{}; removing the new partition", e);
            ops::delete(&mut self.table, new_index)?;
        }
        Ok(())
    }

    fn choose_type(&mut self, index: usize) -> anyhow::Result<()> {
        let types = self.table.label.list_types();
        for (i, entry) in types.iter().enumerate() {
            println!("{:3}  {}", i, entry.name);
        }
        let line = prompt("Partition type number (enter to keep default): ")?;
        if line.is_empty() {
            return Ok(());
        }
        let type_index: usize = line.parse().context("not a type number")?;
        ops::set_type(&mut self.table, index, type_index)?;
        Ok(())
    }

    fn write_changes(&mut self, confirm: bool) -> anyhow::Result<()> {
        if self.table.changes_pending == 0 {
            return Ok(());
        }
        if confirm && !yes_or_no("Committing changes to disk. Are you SURE?")? {
            return Ok(());
        }

        // Offer to repair geometry inconsistencies once per session.
        let report = self.table.check_table(false);
        if !report.is_clean() && !self.table.check_ignore {
            println!("{}", report.problems.join("\n"));
            if yes_or_no("Fix these errors?")? {
                self.table.check_table(true);
            } else {
                self.table.check_ignore = true;
            }
        }

        let force = {
            let report = self.table.check_table(false);
            if report.is_clean() {
                false
            } else {
                yes_or_no("Partition table consistency check failed. Write anyway?")?
            }
        };

        self.table.write(&mut self.dev, &self.config, force)?;
        println!("Changes written.");
        Ok(())
    }

    fn resize(&mut self) -> anyhow::Result<()> {
        let index = self.select_slice()?;
        if !self.table.slices[index].used {
            bail!("slice {} is empty space", index);
        }
        if self.mounted_check(&self.table.slices[index]) == MountedDecision::Cancel {
            return Ok(());
        }

        let fs_type = self.table.slices[index].fs_type.clone();
        let resizer = self.resizers.get(&fs_type);
        let resizer = match resizer {
            Some(rz) => {
                println!("1. Filesystem and partition (recommended)");
                println!("2. Partition only");
                match prompt("Resize type: ")?.as_str() {
                    "2" => None,
                    _ => Some(rz),
                }
            }
            None => {
                if !yes_or_no(
                    "Resizing the filesystem on this partition is not supported.\n\
                     Resize the partition anyway and discard all of its data?",
                )? {
                    return Ok(());
                }
                None
            }
        };

        let fs_limits = if let Some(rz) = resizer {
            if self.table.changes_pending > 0 {
                bail!(
                    "a filesystem resize cannot be undone and must be committed \
                     immediately; write your other changes first"
                );
            }
            let slc = &self.table.slices[index];
            let prog = Progress::new(100);
            println!("Collecting filesystem resizing constraints...");
            match rz.constraints(
                &self.table.disk,
                &mut self.dev,
                slc.raw.start_lba,
                slc.raw.size_lba,
                &prog,
            ) {
                Ok(limits) => Some(limits),
                Err(e) => {
                    if !yes_or_no(&format!(
                        "Error reading filesystem information ({}). Resize the \
                         partition anyway and discard all of its data?",
                        e
                    ))? {
                        return Ok(());
                    }
                    None
                }
            }
        } else {
            None
        };
        let resizer = if fs_limits.is_some() { resizer } else { None };

        let (min_end, max_end) = ops::resize_bounds(&self.table, index, fs_limits)?;
        println!(
            "Current ending cylinder: {}",
            self.table.slices[index].raw.geom.end.cylinder
        );
        let input = prompt(&format!(
            "New ending cylinder ({}-{}), or size in megabytes (<n>m) or cylinders (<n>c): ",
            min_end, max_end
        ))?;
        let start_cyl = self.table.slices[index].raw.geom.start.cylinder;
        let new_end = ops::parse_end_cylinder(&self.table.disk, start_cyl, &input)?;
        if new_end < min_end || new_end > max_end {
            bail!("invalid ending cylinder");
        }

        if !yes_or_no(
            "Resizing should only be done after making a backup of all \
             important data. Continue?",
        )? {
            return Ok(());
        }

        let prog = Progress::new(100);
        ops::resize(
            &mut self.table,
            &mut self.dev,
            index,
            new_end,
            resizer,
            &prog,
            &self.config,
        )?;
        println!("Resize complete");
        Ok(())
    }

    fn run_menu(&mut self) -> anyhow::Result<()> {
        loop {
            self.show();
            println!(
                "\n[a]ctive [c]opy [d]elete [e]rase [f]ormat [g] defrag [h]ide \
                 [i]nfo [m]ove [n]ew [o]rder [p]aste [r]esize [t]ype [u]ndo \
                 [w]rite [x] delete all [B]ackup restore [D]isk copy [M]br [q]uit"
            );
            let choice = prompt("=> ")?;

            let result = match choice.as_str() {
                "a" => self.select_slice().and_then(|i| {
                    ops::set_active(&mut self.table, i).map_err(Into::into)
                }),
                "c" => self.select_slice().and_then(|i| {
                    ops::copy_to_clipboard(&mut self.clipboard, &self.table, i)
                        .map_err(Into::into)
                }),
                "d" => self.select_slice().and_then(|i| {
                    if let Some(warning) = ops::delete(&mut self.table, i)? {
                        println!("{}", warning);
                    }
                    Ok(())
                }),
                "e" => self.erase(),
                "f" => self.format(),
                "g" => self.defragment(),
                "h" => self.select_slice().and_then(|i| {
                    ops::hide(&mut self.table, i).map_err(Into::into)
                }),
                "i" => self.select_slice().map(|i| {
                    println!("\n{}", ops::slice_info(&self.table, i));
                }),
                "m" => self.move_slice(),
                "n" => self.create(),
                "o" => self.reorder(),
                "p" => self.paste(),
                "r" => self.resize(),
                "t" => self
                    .select_slice()
                    .and_then(|i| self.choose_type(i)),
                "u" => {
                    self.table.undo();
                    Ok(())
                }
                "w" => self.write_changes(true),
                "x" => {
                    ops::delete_all(&mut self.table);
                    Ok(())
                }
                "B" => self.restore_backup(),
                "D" => self.copy_disk(),
                "M" => self.simple_mbr(),
                "q" => {
                    if self.table.changes_pending > 0
                        && !yes_or_no("Quit and discard changes?")?
                    {
                        continue;
                    }
                    return Ok(());
                }
                _ => Ok(()),
            };

            if let Err(e) = result {
                eprintln!("Error: {}", e);
            }
        }
    }

    fn erase(&mut self) -> anyhow::Result<()> {
        let whole_disk = match prompt("Erase [p]artition or [w]hole disk?: ")?.as_str() {
            "w" | "W" => true,
            "p" | "P" => false,
            _ => return Ok(()),
        };

        let target = if whole_disk {
            None
        } else {
            let index = self.select_slice()?;
            if self.table.slices[index].used
                && self.mounted_check(&self.table.slices[index]) == MountedDecision::Cancel
            {
                return Ok(());
            }
            Some(index)
        };

        println!("0. basic (clear only)\n1. secure\n2. more secure\n3. most secure");
        let level = prompt("Security level: ")?
            .parse()
            .ok()
            .and_then(EraseLevel::from_choice)
            .context("bad security level")?;

        if !yes_or_no("Erase? (This change cannot be undone)")? {
            return Ok(());
        }

        let prog = Progress::new(0);
        match target {
            None => ops::erase_disk(&mut self.table, &mut self.dev, level, &prog)?,
            Some(index) => ops::erase_slice(&self.table, &mut self.dev, index, level, &prog)?,
        }
        println!("Erase complete");
        Ok(())
    }

    fn copy_disk(&mut self) -> anyhow::Result<()> {
        let dest_path = PathBuf::from(prompt("Destination disk image: ")?);
        if dest_path == self.disk_path {
            bail!("not much point in copying a disk to itself");
        }
        let mut dest_dev = FileDevice::open(&dest_path)
            .with_context(|| format!("can't open disk image {}", dest_path.display()))?;
        let dest_disk = dest_dev.disk(&disk_name(&dest_path));

        if !yes_or_no(&format!(
            "Copy disk {} to disk {}?\nWARNING: THIS WILL DESTROY ALL DATA ON \
             DISK {}. ARE YOU SURE?",
            self.table.disk.name, dest_disk.name, dest_disk.name
        ))? {
            return Ok(());
        }

        // Copy up to the end of the last used slice; a blank disk is copied
        // whole if the user insists.
        let mut last_used = match ops::last_used_sector(&self.table) {
            Some(sector) => sector,
            None => {
                if !yes_or_no("No partitions on the disk. Copy the whole disk anyway?")? {
                    return Ok(());
                }
                self.table.disk.num_sectors - 1
            }
        };
        if last_used >= dest_disk.num_sectors {
            if !yes_or_no(
                "The destination disk is smaller than the data on this disk.\n\
                 Copy only the data that fits?",
            )? {
                return Ok(());
            }
            last_used = dest_disk.num_sectors - 1;
        }

        let prog = Progress::new(last_used + 1);
        ops::copy_disk_data(
            &self.table.disk,
            &mut self.dev,
            &dest_disk,
            &mut dest_dev,
            last_used,
            self.table.label.kind(),
            &prog,
        )?;

        // Fit the copied table to the destination geometry, then fix the
        // geometry fields of any FAT payloads that survived.
        let mut dest_table = PartitionTable::read(&dest_disk, &mut dest_dev, &self.config, false)?;
        ops::truncate_to_disk(&mut dest_table);
        dest_table.changes_pending += 1;
        dest_table.write(&mut dest_dev, &self.config, false)?;
        dest_table.refresh_fs_info(&mut dest_dev, &SignatureProbe);
        for i in 0..dest_table.slices.len() {
            if dest_table.slices[i].used && dest_table.slices[i].fs_type.starts_with("fat") {
                let start = dest_table.slices[i].raw.start_lba;
                let fs_type = dest_table.slices[i].fs_type.clone();
                carve_parts::fat::set_fat_geometry(&dest_disk, &mut dest_dev, start, &fs_type)?;
            }
        }

        println!("Disk copy complete");
        Ok(())
    }

    fn format(&mut self) -> anyhow::Result<()> {
        let index = self.select_slice()?;
        if !self.table.slices[index].used {
            bail!("slice {} is empty space", index);
        }
        if self.table.changes_pending > 0 {
            bail!(
                "a partition format cannot be undone; write your other \
                 changes first"
            );
        }
        if self.mounted_check(&self.table.slices[index]) == MountedDecision::Cancel {
            return Ok(());
        }

        let fs_type = prompt("Filesystem type (e.g. ntfs, fat32, ext2): ")?;
        if fs_type.is_empty() {
            return Ok(());
        }
        if !yes_or_no(&format!(
            "Format partition {} as {}? (This change cannot be undone)",
            self.table.slices[index].display_name, fs_type
        ))? {
            return Ok(());
        }

        carve_parts::tools::format(&self.table.slices[index].disk_name, &fs_type)?;
        self.table.refresh_fs_info(&mut self.dev, &SignatureProbe);
        println!("Format complete");
        Ok(())
    }

    fn defragment(&mut self) -> anyhow::Result<()> {
        let index = self.select_slice()?;
        if self.table.changes_pending > 0 {
            bail!(
                "a defragmentation cannot be undone; write your other \
                 changes first"
            );
        }
        if self.mounted_check(&self.table.slices[index]) == MountedDecision::Cancel {
            return Ok(());
        }
        if !yes_or_no("Defragment? (This change cannot be undone)")? {
            return Ok(());
        }
        let slc = &self.table.slices[index];
        carve_parts::tools::defragment(&slc.disk_name, &slc.fs_type)?;
        println!("Defragmentation complete");
        Ok(())
    }

    fn move_slice(&mut self) -> anyhow::Result<()> {
        let index = self.select_slice()?;
        if self.mounted_check(&self.table.slices[index]) == MountedDecision::Cancel {
            return Ok(());
        }
        if self.table.changes_pending > 0 {
            bail!(
                "a partition move cannot be undone and must be committed \
                 immediately; write your other changes first"
            );
        }
        let (lo, hi) = ops::move_range(&self.table, index)?;
        let target: u64 = prompt(&format!("New starting cylinder ({}-{}): ", lo, hi))?
            .parse()
            .context("not a cylinder number")?;
        if target == self.table.slices[index].raw.geom.start.cylinder {
            return Ok(());
        }
        if !yes_or_no(&format!(
            "Moving partition from cylinder {} to cylinder {}. Continue?",
            self.table.slices[index].raw.geom.start.cylinder, target
        ))? {
            return Ok(());
        }

        let prog = Progress::new(0);
        let new_index =
            ops::move_slice(&mut self.table, &mut self.dev, index, target, &prog, &self.config)?;
        self.table.selected = new_index;
        Ok(())
    }

    fn paste(&mut self) -> anyhow::Result<()> {
        if !self.clipboard.is_valid() {
            bail!("no partition copied to the clipboard");
        }
        let index = self.select_slice()?;

        // Cross-disk pastes reopen the source image.
        let (clip_slice, clip_disk) = self.clipboard.slice().unwrap();
        let clip_name = clip_disk.name.clone();
        println!(
            "Pasting partition {} ({} sectors)",
            clip_slice.display_name, clip_slice.raw.size_lba
        );
        if !yes_or_no("Paste into the selected empty space?")? {
            return Ok(());
        }

        let prog = Progress::new(0);
        let new_index = if clip_name == self.table.disk.name {
            // Same disk: the source payload is on this device.
            let src_path = self.disk_path.clone();
            let mut src_dev = FileDevice::open(&src_path)?;
            ops::paste(
                &mut self.table,
                &mut self.dev,
                &self.clipboard,
                &mut src_dev,
                index,
                &prog,
            )?
        } else {
            let src_path = PathBuf::from(format!("{}.img", clip_name));
            let mut src_dev = FileDevice::open(&src_path)
                .with_context(|| format!("can't reopen source disk {}", clip_name))?;
            ops::paste(
                &mut self.table,
                &mut self.dev,
                &self.clipboard,
                &mut src_dev,
                index,
                &prog,
            )?
        };
        self.table.selected = new_index;
        Ok(())
    }

    fn reorder(&mut self) -> anyhow::Result<()> {
        let first = self.select_slice()?;
        let second = self.select_slice()?;
        ops::swap_order(&mut self.table, first, second)?;
        Ok(())
    }

    fn restore_backup(&mut self) -> anyhow::Result<()> {
        if !self.table.backup_available {
            bail!("no backup partition table is available for this disk");
        }
        if !yes_or_no("Restore old partition table from backup?")? {
            return Ok(());
        }
        self.table.restore_backup(&self.config)?;
        println!("Backup restored; write changes to commit it.");
        Ok(())
    }

    fn simple_mbr(&mut self) -> anyhow::Result<()> {
        if !yes_or_no(
            "After you write changes, the \"active\" partition will always \
             boot automatically. Proceed?",
        )? {
            return Ok(());
        }
        ops::write_simple_mbr(&self.table, &mut self.dev, &self.config)?;
        Ok(())
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => {}
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load_or_default(&cli.config);

    if let Some(path) = &cli.clear {
        let mut dev = FileDevice::open(path)
            .with_context(|| format!("can't open disk image {}", path.display()))?;
        let disk = dev.disk(&disk_name(path));
        ops::clear_disk_label(&disk, &mut dev, carve_parts::LabelKind::Msdos)?;
        println!("Cleared partition table on {}", disk.name);
    }

    let path = match cli.disk {
        Some(path) => path,
        None => {
            let line = prompt("Disk image: ")?;
            if line.is_empty() {
                bail!("no disk selected");
            }
            PathBuf::from(line)
        }
    };

    let mut session = Session::open(config, path)?;
    session.run_menu()
}
