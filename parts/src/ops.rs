// The partition operations. Everything here mutates the in-memory table and
// raises its pending-change counter; only the operations documented as
// committing immediately (move, resize-with-filesystem, erase, disk copy)
// touch the device themselves. Interactive decisions are made by the caller
// and passed in as parameters.

use std::io::Read;
use std::time::Instant;

use carve_core::{BlockDevice, CarveError, Config, Disk, Progress};
use log::{info, warn};

use crate::copier;
use crate::fat;
use crate::label::{Label, LabelKind};
use crate::resizefs::FilesystemResizer;
use crate::table::{PartitionTable, Slice};
use crate::types::{ChsAddr, CreateKind, RawSlice, SliceKind};

/// Outcome of the caller's mounted-filesystem dialogue. `Proceed` covers
/// both "ignore" and "successfully unmounted".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountedDecision {
    Proceed,
    Cancel,
}

/// The slice clipboard: one optional (slice, source disk) pair, last copy
/// wins.
#[derive(Default)]
pub struct Clipboard {
    entry: Option<(Slice, Disk)>,
}

impl Clipboard {
    pub fn is_valid(&self) -> bool {
        self.entry.is_some()
    }

    pub fn slice(&self) -> Option<&(Slice, Disk)> {
        self.entry.as_ref()
    }
}

/// Number of overwrite passes for a secure erase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseLevel {
    Basic,
    Secure,
    MoreSecure,
    MostSecure,
}

impl EraseLevel {
    pub fn passes(self) -> u32 {
        match self {
            EraseLevel::Basic => 1,
            EraseLevel::Secure => 3,
            EraseLevel::MoreSecure => 5,
            EraseLevel::MostSecure => 7,
        }
    }

    pub fn from_choice(choice: usize) -> Option<Self> {
        match choice {
            0 => Some(EraseLevel::Basic),
            1 => Some(EraseLevel::Secure),
            2 => Some(EraseLevel::MoreSecure),
            3 => Some(EraseLevel::MostSecure),
            _ => None,
        }
    }
}

fn used_slice<'a>(table: &'a PartitionTable, index: usize) -> Result<&'a Slice, CarveError> {
    match table.slices.get(index) {
        Some(s) if s.used => Ok(s),
        Some(_) => Err(CarveError::Parameter(format!(
            "slice {} is empty space",
            index
        ))),
        None => Err(CarveError::Parameter(format!("no slice {}", index))),
    }
}

fn empty_slice<'a>(table: &'a PartitionTable, index: usize) -> Result<&'a Slice, CarveError> {
    match table.slices.get(index) {
        Some(s) if !s.used => Ok(s),
        Some(_) => Err(CarveError::Parameter(format!(
            "slice {} is not empty space",
            index
        ))),
        None => Err(CarveError::Parameter(format!("no slice {}", index))),
    }
}

/// Parse an end-cylinder specification: a plain cylinder number, `<N>m` for
/// a size in megabytes, or `<N>c` for a size in cylinders.
pub fn parse_end_cylinder(
    disk: &Disk,
    start_cylinder: u64,
    input: &str,
) -> Result<u64, CarveError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CarveError::Parameter("empty cylinder value".to_string()));
    }

    let (digits, unit) = match input.chars().last().unwrap() {
        'm' | 'M' => (&input[..input.len() - 1], Some('m')),
        'c' | 'C' => (&input[..input.len() - 1], Some('c')),
        _ => (input, None),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| CarveError::Parameter(format!("bad cylinder value '{}'", input)))?;
    if unit.is_some() && value == 0 {
        return Err(CarveError::Parameter("zero-size partition".to_string()));
    }

    Ok(match unit {
        Some('m') => start_cylinder + disk.mb_to_cylinders(value) - 1,
        Some('c') => start_cylinder + value - 1,
        _ => value,
    })
}

/// Determine the table order for a new slice in the empty space at
/// `empty_index`, shifting the orders of existing slices as needed.
fn create_slice_order(table: &mut PartitionTable, empty_index: usize, kind: SliceKind) -> u32 {
    // The first free primary index is the starting point: it is the order of
    // a new primary, and of a new logical when no logicals exist yet.
    let mut order = 0u32;
    'search: loop {
        for s in &table.slices {
            if s.used && !s.is_logical() && s.raw.order == order {
                order += 1;
                continue 'search;
            }
        }
        break;
    }

    match kind {
        SliceKind::Primary => {
            for s in table.slices.iter_mut() {
                if s.is_logical() {
                    s.raw.order += 1;
                }
            }
        }
        SliceKind::Logical => {
            // Logicals' table order always corresponds with their on-disk
            // order, so a new one slots in next to its neighbors.
            if empty_index > 0 && table.slices[empty_index - 1].is_logical() {
                order = table.slices[empty_index - 1].raw.order + 1;
            } else if empty_index + 1 < table.slices.len()
                && table.slices[empty_index + 1].is_logical()
            {
                order = table.slices[empty_index + 1].raw.order;
            }

            for s in table.slices.iter_mut().skip(empty_index + 1) {
                if s.is_logical() {
                    s.raw.order += 1;
                }
            }
        }
    }

    order
}

/// Create a partition inside the empty space at `empty_index`, spanning the
/// given cylinder range. Returns the new slice's index in the updated view.
pub fn create(
    table: &mut PartitionTable,
    empty_index: usize,
    kind: SliceKind,
    start_cylinder: u64,
    end_cylinder: u64,
) -> Result<usize, CarveError> {
    let empty = empty_slice(table, empty_index)?;
    let min_start = empty.raw.geom.start.cylinder;
    let max_end = empty.raw.geom.end.cylinder;
    if start_cylinder < min_start
        || start_cylinder > max_end
        || end_cylinder < start_cylinder
        || end_cylinder > max_end
    {
        return Err(CarveError::Parameter(format!(
            "cylinder range {}-{} outside empty space {}-{}",
            start_cylinder, end_cylinder, min_start, max_end
        )));
    }

    match table.label.can_create(&table.slices, empty_index) {
        CreateKind::None => {
            return Err(CarveError::InvalidLayout(
                "No partition can be created in this space".to_string(),
            ))
        }
        CreateKind::Primary if kind == SliceKind::Logical => {
            return Err(CarveError::InvalidLayout(
                "Only a primary partition can be created here".to_string(),
            ))
        }
        CreateKind::Logical if kind == SliceKind::Primary => {
            return Err(CarveError::InvalidLayout(
                "Only a logical partition can be created here".to_string(),
            ))
        }
        _ => {}
    }

    let order = create_slice_order(table, empty_index, kind);

    let mut raw = RawSlice {
        order,
        kind,
        ..Default::default()
    };
    table.label.set_default_type(&mut raw);

    let mut start_cylinder = start_cylinder;
    let mut start_head = 0u32;
    if start_cylinder == 0 {
        if kind == SliceKind::Logical {
            // A logical slice never occupies the first cylinder.
            start_cylinder += 1;
        } else {
            // The first track of the first cylinder is reserved.
            start_head += 1;
        }
    }
    if kind == SliceKind::Logical {
        // The first track of the extended container is reserved too.
        start_head += 1;
    }

    let cyl_sectors = table.disk.cylinder_sectors();
    let spt = table.disk.geometry.sectors_per_track as u64;
    raw.geom.start = ChsAddr {
        cylinder: start_cylinder,
        head: start_head,
        sector: 1,
    };
    raw.geom.end = ChsAddr {
        cylinder: end_cylinder,
        head: table.disk.geometry.heads - 1,
        sector: table.disk.geometry.sectors_per_track,
    };
    raw.start_lba = start_cylinder * cyl_sectors + start_head as u64 * spt;
    raw.size_lba = (end_cylinder - start_cylinder + 1) * cyl_sectors - start_head as u64 * spt;

    table.slices.push(Slice::from_raw(raw, &table.disk));
    table.update_slice_list();
    table.changes_pending += 1;

    table
        .find_by_start_cylinder(start_cylinder)
        .ok_or_else(|| CarveError::Other("created slice vanished from the view".to_string()))
}

/// Delete a slice. Returns a warning when the deleted slice was active.
pub fn delete(table: &mut PartitionTable, index: usize) -> Result<Option<String>, CarveError> {
    let slc = used_slice(table, index)?;
    let warning = if slc.raw.bootable {
        Some("Deleting active partition. You should set another partition active.".to_string())
    } else {
        None
    };
    let order = slc.raw.order;

    table.slices.remove(index);
    for s in table.slices.iter_mut() {
        if s.used && s.raw.order > order {
            s.raw.order -= 1;
        }
    }

    table.update_slice_list();
    if table.selected >= table.slices.len() {
        table.selected = table.slices.len().saturating_sub(1);
    }
    table.changes_pending += 1;
    Ok(warning)
}

/// Empty the whole slice list. Unlike delete, this is not reconstructible
/// from the remaining entries.
pub fn delete_all(table: &mut PartitionTable) {
    table.slices.clear();
    table.selected = 0;
    table.changes_pending += 1;
    table.update_slice_list();
}

/// Toggle the bootable flag on the target slice and clear it everywhere
/// else.
pub fn set_active(table: &mut PartitionTable, index: usize) -> Result<(), CarveError> {
    used_slice(table, index)?;
    for (i, s) in table.slices.iter_mut().enumerate() {
        if !s.used {
            continue;
        }
        if i == index {
            s.raw.bootable = !s.raw.bootable;
        } else {
            s.raw.bootable = false;
        }
    }
    table.changes_pending += 1;
    table.update_slice_list();
    Ok(())
}

/// Toggle the hidden state of a slice, where the label supports it.
pub fn hide(table: &mut PartitionTable, index: usize) -> Result<(), CarveError> {
    let slc = used_slice(table, index)?;
    if !table.label.can_hide(slc) {
        return Err(CarveError::Unsupported(
            "This partition type can't be hidden".to_string(),
        ));
    }
    let label = &*table.label;
    label.hide(&mut table.slices[index].raw);
    table.changes_pending += 1;
    table.update_slice_list();
    Ok(())
}

/// Set the slice's partition type to the `type_index`-th entry of the
/// label's type list.
pub fn set_type(
    table: &mut PartitionTable,
    index: usize,
    type_index: usize,
) -> Result<(), CarveError> {
    used_slice(table, index)?;
    let label = &*table.label;
    label.set_type(&mut table.slices[index].raw, type_index)?;
    table.changes_pending += 1;
    table.update_slice_list();
    Ok(())
}

/// Detail report for one slice.
pub fn slice_info(table: &PartitionTable, index: usize) -> String {
    let slc = &table.slices[index];
    let mut out = String::new();

    if slc.used {
        out.push_str(&format!("PARTITION {} INFO:\n\n", slc.display_name));
        out.push_str(&format!(
            "Active : {}\n",
            if slc.raw.bootable { "yes" } else { "no" }
        ));
        let caps = table.label.caps();
        if caps.use_tags {
            out.push_str(&format!("Type ID : {:02x}\n", slc.raw.tag));
        } else if caps.use_guids {
            out.push_str(&format!("Type GUID : {}\n", slc.raw.type_guid));
        }
    } else {
        out.push_str("EMPTY SPACE INFO:\n\n");
    }

    out.push_str(&format!(
        "Starting Cyl/Hd/Sect: {}/{}/{}\nEnding Cyl/Hd/Sect  : {}/{}/{}\n",
        slc.raw.geom.start.cylinder,
        slc.raw.geom.start.head,
        slc.raw.geom.start.sector,
        slc.raw.geom.end.cylinder,
        slc.raw.geom.end.head,
        slc.raw.geom.end.sector
    ));
    out.push_str(&format!(
        "Logical start sector: {}\nLogical size: {}",
        slc.raw.start_lba, slc.raw.size_lba
    ));
    out
}

/// Snapshot a slice and its source disk into the clipboard.
pub fn copy_to_clipboard(
    clip: &mut Clipboard,
    table: &PartitionTable,
    index: usize,
) -> Result<(), CarveError> {
    let slc = used_slice(table, index)?;
    clip.entry = Some((slc.clone(), table.disk.clone()));
    Ok(())
}

/// Paste the clipboard slice into the empty space at `empty_index`: raw-copy
/// the payload, then create a matching slice over it.
pub fn paste(
    table: &mut PartitionTable,
    dev: &mut dyn BlockDevice,
    clip: &Clipboard,
    clip_dev: &mut dyn BlockDevice,
    empty_index: usize,
    prog: &Progress,
) -> Result<usize, CarveError> {
    let (clip_slice, clip_disk) = clip
        .entry
        .as_ref()
        .ok_or_else(|| CarveError::Parameter("No partition copied to the clipboard".to_string()))?;

    let empty = empty_slice(table, empty_index)?.clone();

    let kind = match table.label.can_create(&table.slices, empty_index) {
        CreateKind::None => {
            return Err(CarveError::InvalidLayout(
                "No partition can be created in this space".to_string(),
            ))
        }
        CreateKind::Logical => SliceKind::Logical,
        _ => SliceKind::Primary,
    };

    if empty.raw.size_lba < clip_slice.raw.size_lba {
        return Err(CarveError::NoSpace(format!(
            "Partition {} is too big ({} sectors) to fit in the selected empty space ({} sectors)",
            clip_slice.display_name, clip_slice.raw.size_lba, empty.raw.size_lba
        )));
    }

    copier::copy_data(
        clip_disk,
        clip_dev,
        clip_slice.raw.start_lba,
        &table.disk.clone(),
        dev,
        empty.raw.start_lba,
        clip_slice.raw.size_lba,
        prog,
    )?;

    let cyl_sectors = table.disk.cylinder_sectors();
    let new_end_cylinder = empty.raw.geom.start.cylinder
        + clip_slice.raw.size_lba / cyl_sectors
        + u64::from(clip_slice.raw.size_lba % cyl_sectors != 0)
        - 1;

    let new_index = create(
        table,
        empty_index,
        kind,
        empty.raw.geom.start.cylinder,
        new_end_cylinder,
    )?;

    // Match the clipboard slice's type.
    table.slices[new_index].raw.tag = clip_slice.raw.tag;
    table.slices[new_index].raw.type_guid = clip_slice.raw.type_guid;
    table.slices[new_index].raw.attributes = clip_slice.raw.attributes;
    table.slices[new_index].fs_type = clip_slice.fs_type.clone();
    table.update_slice_list();

    // A FAT payload carries disk geometry that must match its new home.
    if clip_slice.fs_type.starts_with("fat") {
        let start = table.slices[new_index].raw.start_lba;
        let fs_type = table.slices[new_index].fs_type.clone();
        fat::set_fat_geometry(&table.disk, dev, start, &fs_type)?;
    }

    table.selected = new_index;
    Ok(new_index)
}

/// The cylinder range a slice may be moved to, bounded by the free space
/// immediately before and after it.
pub fn move_range(table: &PartitionTable, index: usize) -> Result<(u64, u64), CarveError> {
    let slc = used_slice(table, index)?;

    let left_free = index > 0 && !table.slices[index - 1].used;
    let right_free = index + 1 < table.slices.len() && !table.slices[index + 1].used;
    if !left_free && !right_free {
        return Err(CarveError::InvalidLayout(
            "No empty space on either side".to_string(),
        ));
    }

    let mut lo = slc.raw.geom.start.cylinder;
    let mut hi = slc.raw.geom.start.cylinder;
    if left_free {
        lo = table.slices[index - 1].raw.geom.start.cylinder;
    }
    if right_free {
        hi = table.slices[index + 1].raw.geom.end.cylinder
            - (slc.raw.geom.end.cylinder - slc.raw.geom.start.cylinder);
    }

    if slc.is_logical() && lo == 0 {
        lo = 1;
    }

    Ok((lo, hi))
}

/// Move a slice's payload to a new start cylinder and immediately commit the
/// updated table. Copy direction is chosen so an overlapping destination
/// never clobbers unread source sectors, and cancellation is blocked for
/// exactly the chunks where it would.
pub fn move_slice(
    table: &mut PartitionTable,
    dev: &mut dyn BlockDevice,
    index: usize,
    new_start_cylinder: u64,
    prog: &Progress,
    config: &Config,
) -> Result<usize, CarveError> {
    if table.changes_pending > 0 {
        return Err(CarveError::Parameter(
            "A partition move cannot be undone and must be committed immediately; \
             write your other changes first"
                .to_string(),
        ));
    }

    let (lo, hi) = move_range(table, index)?;
    if new_start_cylinder < lo || new_start_cylinder > hi {
        return Err(CarveError::Parameter(format!(
            "starting cylinder {} outside permissible range {}-{}",
            new_start_cylinder, lo, hi
        )));
    }

    let slc = table.slices[index].clone();
    let cyl_sectors = table.disk.cylinder_sectors();
    let spt = table.disk.geometry.sectors_per_track as u64;

    let mut new_start_lba = new_start_cylinder * cyl_sectors;
    if new_start_cylinder == 0 {
        if slc.is_logical() {
            // A logical slice never occupies the first cylinder.
            new_start_lba += cyl_sectors;
        } else {
            // The first track of the first cylinder is reserved.
            new_start_lba += spt;
        }
    }
    if slc.is_logical() {
        // And so is the first track of the extended container.
        new_start_lba += spt;
    }

    if new_start_lba == slc.raw.start_lba {
        return Ok(index);
    }

    let move_left = new_start_lba < slc.raw.start_lba;
    let size = slc.raw.size_lba;
    let cur_start = slc.raw.start_lba;

    // One cylinder per chunk, shortened to the gap when it's smaller.
    let mut sectors_per_op = cyl_sectors;
    let distance = if move_left {
        cur_start - new_start_lba
    } else {
        new_start_lba - cur_start
    };
    if distance < sectors_per_op {
        sectors_per_op = distance;
    }

    // The first source sector an overlapping destination would destroy.
    let overlap = if move_left {
        (new_start_lba + size > cur_start).then_some(cur_start)
    } else {
        (cur_start + size > new_start_lba).then_some(cur_start + size - 1)
    };

    let mut buffer = vec![0u8; (sectors_per_op * table.disk.sector_size as u64) as usize];

    let window_hits = |dst: u64, chunk: u64| {
        overlap.map_or(false, |o| o >= dst && o < dst + chunk)
    };

    {
        let first_chunk = sectors_per_op.min(size);
        let first_dst = if move_left {
            new_start_lba
        } else {
            new_start_lba + size - first_chunk
        };
        prog.set_can_cancel(!window_hits(first_dst, first_chunk));
    }
    info!(
        "Moving {} sectors from {} to {}",
        size, cur_start, new_start_lba
    );
    prog.set_total(size);

    let started = Instant::now();
    let mut copied = 0u64;

    while copied < size {
        let chunk = sectors_per_op.min(size - copied);
        let offset = if move_left {
            copied
        } else {
            size - copied - chunk
        };
        let src = cur_start + offset;
        let dst = new_start_lba + offset;
        let len = (chunk * table.disk.sector_size as u64) as usize;

        dev.read_sectors(src, chunk, &mut buffer[..len])?;

        {
            let st = prog.snapshot();
            if st.cancel && st.can_cancel {
                return Err(CarveError::Cancelled);
            }
        }

        dev.write_sectors(dst, chunk, &buffer[..len])?;
        copied += chunk;

        prog.update_with_eta(copied, started, sectors_per_op);

        // Block cancellation while the next write would overwrite source
        // sectors that haven't been read yet.
        if copied < size {
            let next_chunk = sectors_per_op.min(size - copied);
            let next_offset = if move_left {
                copied
            } else {
                size - copied - next_chunk
            };
            prog.set_can_cancel(!window_hits(new_start_lba + next_offset, next_chunk));
        }
    }

    // Rewrite the slice coordinates and commit the table right away.
    {
        let raw = &mut table.slices[index].raw;
        raw.start_lba = new_start_lba;
        raw.set_geom_from_lba(&table.disk);
    }
    table.changes_pending += 1;
    table.update_slice_list();
    table.write(dev, config, false)?;
    prog.finish();

    table
        .slices
        .iter()
        .position(|s| s.used && s.raw.start_lba == new_start_lba)
        .ok_or_else(|| CarveError::Other("moved slice vanished from the view".to_string()))
}

/// End of the last used sector on the disk, if any slice exists.
pub fn last_used_sector(table: &PartitionTable) -> Option<u64> {
    table
        .slices
        .iter()
        .filter(|s| s.used)
        .map(|s| s.raw.end_lba())
        .max()
}

/// Raw-copy `[0, last_used_sector]` from one disk to another. On cancel the
/// destination's label is blanked, since its contents are undefined.
pub fn copy_disk_data(
    src_disk: &Disk,
    src_dev: &mut dyn BlockDevice,
    dst_disk: &Disk,
    dst_dev: &mut dyn BlockDevice,
    last_used_sector: u64,
    label_kind: LabelKind,
    prog: &Progress,
) -> Result<(), CarveError> {
    let result = copier::copy_data(
        src_disk,
        src_dev,
        0,
        dst_disk,
        dst_dev,
        0,
        last_used_sector + 1,
        prog,
    );

    if matches!(result, Err(CarveError::Cancelled)) {
        warn!("Disk copy cancelled; clearing the destination label");
        clear_disk_label(dst_disk, dst_dev, label_kind)?;
    }
    result
}

/// Write an empty label of the given kind over whatever the disk holds.
pub fn clear_disk_label(
    disk: &Disk,
    dev: &mut dyn BlockDevice,
    kind: LabelKind,
) -> Result<(), CarveError> {
    match kind {
        LabelKind::Msdos => crate::mbr::MsdosLabel.write_table(disk, dev, &[]),
        LabelKind::Gpt => crate::gpt::GptLabel.format_blank(disk, dev),
    }
}

/// After a disk copy, drop or truncate slices that fall outside the
/// destination's geometry.
pub fn truncate_to_disk(table: &mut PartitionTable) {
    let cylinders = table.disk.geometry.cylinders;
    let cyl_sectors = table.disk.cylinder_sectors();
    let spt = table.disk.geometry.sectors_per_track as u64;

    let mut i = table.slices.len();
    while i > 0 {
        i -= 1;
        if !table.slices[i].used {
            continue;
        }

        if table.slices[i].raw.geom.start.cylinder >= cylinders {
            // Entirely past the end of the disk.
            table.slices.remove(i);
            table.changes_pending += 1;
        } else if table.slices[i].raw.geom.end.cylinder >= cylinders {
            let raw = &mut table.slices[i].raw;
            raw.geom.end = ChsAddr {
                cylinder: cylinders - 1,
                head: table.disk.geometry.heads - 1,
                sector: table.disk.geometry.sectors_per_track,
            };
            raw.size_lba = (raw.geom.end.cylinder - raw.geom.start.cylinder + 1) * cyl_sectors
                - raw.geom.start.head as u64 * spt;
            table.changes_pending += 1;
        }
    }

    table.update_slice_list();
}

/// Securely erase a sector range, one cylinder at a time.
pub fn erase_data(
    disk: &Disk,
    dev: &mut dyn BlockDevice,
    start_sector: u64,
    num_sectors: u64,
    level: EraseLevel,
    prog: &Progress,
) -> Result<(), CarveError> {
    let started = Instant::now();
    prog.set_total(num_sectors);
    let cyl_sectors = disk.cylinder_sectors();
    let mut remaining = num_sectors;
    let mut sector = start_sector;

    while remaining > 0 {
        let chunk = remaining.min(cyl_sectors);
        dev.erase_sectors(sector, chunk, level.passes())?;

        if prog.is_cancelled() {
            return Err(CarveError::Cancelled);
        }

        remaining -= chunk;
        sector += chunk;
        prog.update_with_eta(num_sectors - remaining, started, chunk);
    }

    prog.finish();
    Ok(())
}

/// Erase one slice's sectors. The slice may be a partition or empty space.
pub fn erase_slice(
    table: &PartitionTable,
    dev: &mut dyn BlockDevice,
    index: usize,
    level: EraseLevel,
    prog: &Progress,
) -> Result<(), CarveError> {
    if table.changes_pending > 0 {
        return Err(CarveError::Parameter(
            "A partition erase cannot be undone; write your other changes first".to_string(),
        ));
    }
    let slc = table
        .slices
        .get(index)
        .ok_or_else(|| CarveError::Parameter(format!("no slice {}", index)))?;
    erase_data(&table.disk, dev, slc.raw.start_lba, slc.raw.size_lba, level, prog)
}

/// Erase the whole disk, then lay down a fresh empty label and re-derive the
/// (now single empty) slice list.
pub fn erase_disk(
    table: &mut PartitionTable,
    dev: &mut dyn BlockDevice,
    level: EraseLevel,
    prog: &Progress,
) -> Result<(), CarveError> {
    let result = erase_data(&table.disk, dev, 0, table.disk.num_sectors, level, prog);

    clear_disk_label(&table.disk, dev, table.label.kind())?;
    table.raw_slices.clear();
    table.make_slice_list();

    result
}

/// Swap the table order of two used slices. Payload data does not move.
pub fn swap_order(table: &mut PartitionTable, first: usize, second: usize) -> Result<(), CarveError> {
    used_slice(table, first)?;
    used_slice(table, second)?;

    let a = table.slices[first].raw.order;
    let b = table.slices[second].raw.order;
    table.slices[first].raw.order = b;
    table.slices[second].raw.order = a;

    table.changes_pending += 1;
    table.update_slice_list();
    Ok(())
}

/// Overwrite the boot code in sector 0 with the canned simple-MBR image,
/// preserving the partition table and signature. Commits immediately.
pub fn write_simple_mbr(
    table: &PartitionTable,
    dev: &mut dyn BlockDevice,
    config: &Config,
) -> Result<(), CarveError> {
    if table.changes_pending > 0 {
        return Err(CarveError::Parameter(
            "This operation cannot be undone; write your other changes first".to_string(),
        ));
    }

    let path = config.simple_mbr_path();
    let mut file = std::fs::File::open(&path).map_err(|e| {
        CarveError::Other(format!(
            "Can't locate simple MBR file {}: {}",
            path.display(),
            e
        ))
    })?;
    let mut boot_code = [0u8; 446];
    file.read_exact(&mut boot_code)
        .map_err(|e| CarveError::Other(format!("Can't read simple MBR file: {}", e)))?;

    let mut sector = vec![0u8; table.disk.sector_size as usize];
    dev.read_sectors(0, 1, &mut sector)?;
    sector[..446].copy_from_slice(&boot_code);
    dev.write_sectors(0, 1, &sector)?;
    dev.flush()?;
    Ok(())
}

/// Permissible end-cylinder range for resizing the slice, optionally bounded
/// by the filesystem's own (min, max) sector constraints.
pub fn resize_bounds(
    table: &PartitionTable,
    index: usize,
    fs_limits: Option<(u64, u64)>,
) -> Result<(u64, u64), CarveError> {
    let slc = used_slice(table, index)?;
    let cyl_sectors = table.disk.cylinder_sectors();

    let mut min_end = slc.raw.geom.start.cylinder;
    let mut max_end = if index + 1 < table.slices.len() && !table.slices[index + 1].used {
        table.slices[index + 1].raw.geom.end.cylinder
    } else {
        slc.raw.geom.end.cylinder
    };

    if let Some((min_fs, max_fs)) = fs_limits {
        min_end += min_fs.div_ceil(cyl_sectors) - 1;
        max_end = max_end.min(slc.raw.geom.start.cylinder + max_fs.div_ceil(cyl_sectors) - 1);
    }

    Ok((min_end, max_end))
}

fn apply_slice_resize(table: &mut PartitionTable, start_lba: u64, end: ChsAddr, new_size: u64) {
    if let Some(i) = table
        .slices
        .iter()
        .position(|s| s.used && s.raw.start_lba == start_lba)
    {
        table.slices[i].raw.geom.end = end;
        table.slices[i].raw.size_lba = new_size;
        table.update_slice_list();
        table.changes_pending += 1;
    }
}

/// Resize a slice to end at `new_end_cylinder`. With a filesystem resizer,
/// the payload is resized too: the partition grows before the filesystem
/// grows, or shrinks after the filesystem shrinks, and every step is
/// committed immediately. Without one, only the table entry changes.
pub fn resize(
    table: &mut PartitionTable,
    dev: &mut dyn BlockDevice,
    index: usize,
    new_end_cylinder: u64,
    resizer: Option<&dyn FilesystemResizer>,
    prog: &Progress,
    config: &Config,
) -> Result<(), CarveError> {
    let slc = used_slice(table, index)?;
    let cyl_sectors = table.disk.cylinder_sectors();
    let start_lba = slc.raw.start_lba;
    let new_size = (new_end_cylinder + 1) * cyl_sectors - start_lba;

    let old_end = slc.raw.geom.end;
    let old_size = slc.raw.size_lba;

    if resizer.is_some() && table.changes_pending > 0 {
        return Err(CarveError::Parameter(
            "A filesystem resize cannot be undone and must be committed immediately; \
             write your other changes first"
                .to_string(),
        ));
    }

    let new_end = ChsAddr {
        cylinder: new_end_cylinder,
        head: table.disk.geometry.heads - 1,
        sector: table.disk.geometry.sectors_per_track,
    };

    let mut did_resize = false;
    if new_size >= old_size {
        apply_slice_resize(table, start_lba, new_end, new_size);
        did_resize = true;
    }

    if let Some(rz) = resizer {
        table.write(dev, config, false)?;

        // The partition's current extent: already grown for a grow, still
        // the old size for a shrink.
        let current_size = table
            .slices
            .iter()
            .find(|s| s.used && s.raw.start_lba == start_lba)
            .map(|s| s.raw.size_lba)
            .unwrap_or(old_size);

        // Caching off for the duration of a large operation like this.
        let cache = dev.cache_enabled();
        if cache {
            dev.set_cache_enabled(false);
        }
        let result = rz.resize(&table.disk.clone(), dev, start_lba, current_size, new_size, prog);
        if cache {
            dev.set_cache_enabled(true);
        }

        table.update_slice_list();

        if let Err(e) = result {
            if did_resize {
                // Undo the partition grow; the payload was never resized.
                apply_slice_resize(table, start_lba, old_end, old_size);
                table.write(dev, config, false)?;
            }
            return Err(e);
        }
    }

    if !did_resize {
        apply_slice_resize(table, start_lba, new_end, new_size);
        if resizer.is_some() {
            table.write(dev, config, false)?;
        }
    }

    Ok(())
}
