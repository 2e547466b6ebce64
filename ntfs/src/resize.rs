// The NTFS resize engine. Shrinks or grows a volume's cluster count without
// touching file contents: referenced clusters are relocated out of the
// doomed region, $BadClus and $Bitmap are truncated to the new size, and the
// boot sector's sector count is rewritten last.

use byteorder::{ByteOrder, LittleEndian};
use carve_core::{CarveError, Progress};
use log::{debug, info, warn};

use crate::alloc::ClusterAlloc;
use crate::bitmap::{bitmap_byte_size, Bitmap};
use crate::meta::{
    Attribute, Lcn, MftRecord, NtfsVolume, RunEntry, FILE_BADCLUS, FILE_BITMAP, FILE_MFT,
    FILE_MFTMIRR, MAX_CLUSTER_SIZE,
};
use crate::runlist;

const BITMAP_WINDOW: usize = 4096;
/// Cluster-accounting mismatches tolerated before the check is fatal.
const MISMATCH_LIMIT: u64 = 10;

// Per-phase weights of the progress scale: (base percent, weight).
const PCT_CHECK: (u32, u32) = (0, 18);
const PCT_ACCOUNTING: (u32, u32) = (18, 1);
const PCT_CONSTRAINTS: (u32, u32) = (19, 17);
const PCT_VOLFIXUP: (u32, u32) = (36, 60);
const PCT_RELOCATIONS: (u32, u32) = (96, 1);
const PCT_BADCLUST: (u32, u32) = (97, 1);
const PCT_TRUNCBMP: (u32, u32) = (98, 1);
const PCT_BOOTSECT: (u32, u32) = (99, 1);

/// Options for one resize invocation.
#[derive(Debug, Clone, Default)]
pub struct ResizeRequest {
    /// Requested volume size in sectors; `None` means "fill the device".
    pub new_sectors: Option<u64>,
    /// Proceed even when the volume is already marked dirty.
    pub force: bool,
    /// Accept a volume with bad sectors.
    pub bad_sectors: bool,
}

/// Resize the volume to the requested size. A request matching the current
/// size (modulo the trailing backup-sector reservation) is a no-op.
pub fn resize(
    vol: &mut dyn NtfsVolume,
    req: &ResizeRequest,
    prog: &Progress,
) -> Result<(), CarveError> {
    run(vol, req, prog, false).map(|_| ())
}

/// Read-only constraint collection: the (minimum, maximum) payload size in
/// sectors this volume can be resized to.
pub fn resize_constraints(
    vol: &mut dyn NtfsVolume,
    prog: &Progress,
) -> Result<(u64, u64), CarveError> {
    let req = ResizeRequest {
        new_sectors: None,
        force: true,
        bad_sectors: true,
    };
    run(vol, &req, prog, true).map(|limits| limits.expect("info run reports limits"))
}

#[derive(Debug, Default, Clone, Copy)]
struct LastLcn {
    lcn: u64,
    mref: u64,
}

enum Bucket {
    Mft,
    MftMirr,
    MultiMft,
    Sparse,
    Compressed,
    Ordinary,
}

struct Engine<'a> {
    vol: &'a mut dyn NtfsVolume,
    prog: &'a Progress,
    info_only: bool,
    new_volume_size: u64,
    shrink: bool,
    inuse: u64,
    relocations: u64,
    outsider: u64,
    multi_ref: u64,
    badclusters: u64,
    bitmap: Bitmap,
    alloc: ClusterAlloc,
    last_mft: LastLcn,
    last_mftmirr: LastLcn,
    last_multi_mft: LastLcn,
    last_sparse: LastLcn,
    last_compressed: LastLcn,
    last_lcn: LastLcn,
    last_unsupp: u64,
    mft_highest_vcn: u64,
    mftmirr_new: Option<RunEntry>,
    mftmirr_old_lcn: Option<u64>,
}

fn is_badclus_bad(mref: u64, attr: &Attribute) -> bool {
    mref == FILE_BADCLUS && attr.is_data() && attr.name == "$Bad"
}

fn real_run_count(runs: &[RunEntry]) -> usize {
    runs.iter()
        .filter(|r| matches!(r.lcn, Lcn::At(_)))
        .count()
}

/// After the dirty flag is set and the log reset, a failure leaves metadata
/// only chkdsk can finish reconciling; say so.
fn chkdsk_required(e: CarveError) -> CarveError {
    CarveError::Other(format!(
        "{}; the volume is marked dirty and a consistency check (chkdsk) \
         will run on the next Windows boot",
        e
    ))
}

fn run(
    vol: &mut dyn NtfsVolume,
    req: &ResizeRequest,
    prog: &Progress,
    info_only: bool,
) -> Result<Option<(u64, u64)>, CarveError> {
    prog.set_status("Mounting volume");

    if vol.is_mounted_elsewhere() {
        return Err(CarveError::Parameter(
            "The volume is mounted. Unmount it first.".to_string(),
        ));
    }
    if vol.flags().dirty && !req.force {
        return Err(CarveError::Corrupt(
            "Volume is scheduled for check. Run chkdsk /f and try again, or force.".to_string(),
        ));
    }
    if vol.cluster_size() > MAX_CLUSTER_SIZE {
        return Err(CarveError::Unsupported(format!(
            "Cluster size {} is too large",
            vol.cluster_size()
        )));
    }
    let (major, minor) = vol.version();
    if !(1..=3).contains(&major) {
        return Err(CarveError::Unsupported(format!(
            "Unknown NTFS version {}.{}",
            major, minor
        )));
    }
    debug!("NTFS volume version {}.{}", major, minor);

    let sector_size = vol.sector_size() as u64;
    let cluster_size = vol.cluster_size() as u64;
    let nr_clusters = vol.nr_clusters();
    let device_bytes = vol.device_size_sectors() * sector_size;

    if device_bytes < nr_clusters * cluster_size {
        return Err(CarveError::Corrupt(
            "Current NTFS volume size is bigger than the device size. Corrupt partition \
             table or incorrect device partitioning?"
                .to_string(),
        ));
    }

    let bytes = req
        .new_sectors
        .map(|s| s * sector_size)
        .unwrap_or(device_bytes);
    if !info_only && device_bytes < bytes {
        return Err(CarveError::Parameter(
            "New size can't be bigger than the device size".to_string(),
        ));
    }

    // One cluster is held back so a trailing sector remains for the backup
    // boot record.
    let new_volume_size = if info_only {
        0
    } else {
        let mut clusters = bytes / cluster_size;
        if clusters > 0 {
            clusters -= 1;
        }
        clusters
    };

    if !info_only
        && (new_volume_size == nr_clusters
            || (bytes == device_bytes && new_volume_size == nr_clusters - 1))
    {
        info!("Nothing to do: NTFS volume size is already OK.");
        prog.finish();
        return Ok(None);
    }

    let mut engine = Engine {
        vol,
        prog,
        info_only,
        new_volume_size,
        shrink: new_volume_size < nr_clusters,
        inuse: 0,
        relocations: 0,
        outsider: 0,
        multi_ref: 0,
        badclusters: 0,
        bitmap: Bitmap::new(nr_clusters),
        alloc: ClusterAlloc::new(),
        last_mft: LastLcn::default(),
        last_mftmirr: LastLcn::default(),
        last_multi_mft: LastLcn::default(),
        last_sparse: LastLcn::default(),
        last_compressed: LastLcn::default(),
        last_lcn: LastLcn::default(),
        last_unsupp: 0,
        mft_highest_vcn: 0,
        mftmirr_new: None,
        mftmirr_old_lcn: None,
    };

    engine.check_bad_sectors(req.bad_sectors)?;
    engine.check_cancel()?;

    engine.check_cluster_allocation()?;
    engine.check_cancel()?;

    engine.set_resize_constraints()?;
    engine.set_disk_usage_constraint();
    engine.check_cancel()?;

    engine.check_resize_constraints()?;

    if info_only {
        let min_sectors = engine.min_supported_sectors()?;
        // NTFS itself can grow to its architectural cluster limit; the
        // enclosing partition bounds the practical maximum.
        let max_sectors = (u32::MAX as u64 * cluster_size) / sector_size;
        prog.complete_only();
        return Ok(Some((min_sectors, max_sectors)));
    }
    engine.check_cancel()?;

    // From the first metadata write onward the operation must run to its
    // end; the dirty flag plus chkdsk is the recovery path, not rollback.
    prog.set_can_cancel(false);

    engine.prepare_volume_fixup()?;
    prog.update_weighted(PCT_VOLFIXUP.0, PCT_VOLFIXUP.1, 1, 1);

    if engine.relocations > 0 {
        engine.relocate_inodes().map_err(chkdsk_required)?;
    }
    prog.update_weighted(PCT_RELOCATIONS.0, PCT_RELOCATIONS.1, 1, 1);

    engine.truncate_badclust_file().map_err(chkdsk_required)?;
    prog.update_weighted(PCT_BADCLUST.0, PCT_BADCLUST.1, 1, 1);

    engine.truncate_bitmap_file().map_err(chkdsk_required)?;
    prog.update_weighted(PCT_TRUNCBMP.0, PCT_TRUNCBMP.1, 1, 1);

    engine.update_bootsector().map_err(chkdsk_required)?;
    prog.update_weighted(PCT_BOOTSECT.0, PCT_BOOTSECT.1, 1, 1);

    prog.set_status("Syncing device");
    engine.vol.sync().map_err(chkdsk_required)?;

    info!("Successfully resized NTFS volume to {} clusters", new_volume_size);
    prog.finish();
    Ok(None)
}

impl<'a> Engine<'a> {
    fn check_cancel(&self) -> Result<(), CarveError> {
        if self.prog.is_cancelled() {
            Err(CarveError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn nr_mft_records(&self) -> u64 {
        self.vol.mft_initialized_size() / self.vol.mft_record_size() as u64
    }

    /// Tally $BadClus:$Bad. Bad sectors are refused unless the caller opted
    /// in, since chkdsk can't repair a $Bitmap that overlaps them.
    fn check_bad_sectors(&mut self, bad_sectors_ok: bool) -> Result<(), CarveError> {
        self.prog.set_status("Checking for bad sectors");

        let record = self
            .vol
            .read_record(FILE_BADCLUS)?
            .ok_or_else(|| CarveError::Corrupt("Can't read $BadClus".to_string()))?;

        if record.has_attr_list {
            return Err(CarveError::Unsupported(
                "Hopelessly many bad sectors have been detected. The disk surface is \
                 damaged; replace it as soon as possible."
                    .to_string(),
            ));
        }

        let attr = record
            .attrs
            .iter()
            .find(|a| is_badclus_bad(FILE_BADCLUS, a))
            .ok_or_else(|| CarveError::Corrupt("$BadClus has no $Bad attribute".to_string()))?;
        if !attr.non_resident {
            return Err(CarveError::Unsupported(
                "Resident attribute in $BadClus isn't supported".to_string(),
            ));
        }

        for run in &attr.runlist {
            if let Lcn::At(lcn) = run.lcn {
                warn!(
                    "Bad cluster: {:#x} - {:#x} ({})",
                    lcn,
                    lcn + run.length - 1,
                    run.length
                );
                self.badclusters += run.length;
            }
        }

        if self.badclusters > 0 {
            warn!(
                "The device has at least {} bad sector{}",
                self.badclusters,
                if self.badclusters == 1 { "" } else { "s" }
            );
            if !bad_sectors_ok {
                return Err(CarveError::Unsupported(
                    "The device has bad sectors. They can cause reliability problems \
                     and massive data loss; retry with bad-sector support enabled."
                        .to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Phase 2 and 3: rebuild the cluster usage bitmap from every MFT record
    /// and reconcile it against the on-disk $Bitmap.
    fn check_cluster_allocation(&mut self) -> Result<(), CarveError> {
        self.build_allocation_bitmap()?;

        if self.outsider > 0 || self.multi_ref > 0 {
            if self.outsider > 0 {
                warn!(
                    "{} clusters are referenced outside of the volume",
                    self.outsider
                );
            }
            if self.multi_ref > 0 {
                warn!("{} clusters are referenced multiple times", self.multi_ref);
            }
            return Err(CarveError::Corrupt(
                "Filesystem check failed. The volume metadata is inconsistent; run \
                 chkdsk /f and try again."
                    .to_string(),
            ));
        }

        self.compare_bitmaps()
    }

    fn build_allocation_bitmap(&mut self) -> Result<(), CarveError> {
        self.prog.set_status("Checking filesystem consistency");

        let nr_clusters = self.vol.nr_clusters();
        let nr_records = self.nr_mft_records();
        let mut shown_outsiders = 0u32;
        let mut shown_multi = 0u32;

        for mref in 0..nr_records {
            self.prog
                .update_weighted(PCT_CHECK.0, PCT_CHECK.1, mref, nr_records.saturating_sub(1));
            if self.prog.is_cancelled() {
                return Err(CarveError::Cancelled);
            }

            let record = match self.vol.read_record(mref)? {
                Some(record) => record,
                None => continue,
            };
            // Extension records are covered through their base record.
            if record.base_record.is_some() {
                continue;
            }

            for attr in record.attrs.iter().filter(|a| a.non_resident) {
                for r in &attr.runlist {
                    let lcn = match r.lcn {
                        Lcn::Hole | Lcn::NotMapped => continue,
                        Lcn::At(lcn) => lcn,
                    };
                    if r.length == 0 {
                        return Err(CarveError::Corrupt(format!(
                            "Corrupt runlist in record {} (zero-length run)",
                            mref
                        )));
                    }

                    for k in lcn..lcn + r.length {
                        if k >= nr_clusters {
                            let outsiders = lcn + r.length - k;
                            self.outsider += outsiders;
                            shown_outsiders += 1;
                            if shown_outsiders <= 10 {
                                warn!(
                                    "Outside of the volume reference for record {} at {}:{}",
                                    mref, k, outsiders
                                );
                            }
                            break;
                        }
                        if self.bitmap.get_and_set(k) {
                            self.multi_ref += 1;
                            shown_multi += 1;
                            if shown_multi <= 10 {
                                warn!("Cluster {} is referenced multiple times", k);
                            }
                        }
                    }
                    self.inuse += r.length;
                }
            }
        }
        Ok(())
    }

    /// Stream the on-disk $Bitmap and compare it byte-by-byte (bit-by-bit on
    /// mismatching bytes) against the reconstructed bitmap. A single missing
    /// bit at the volume's middle cluster marks the backup boot sector and
    /// is tolerated.
    fn compare_bitmaps(&mut self) -> Result<(), CarveError> {
        self.prog.set_status("Accounting clusters");

        let nr_clusters = self.vol.nr_clusters();
        let expected = self.bitmap.as_bytes().to_vec();
        let mut window = vec![0u8; BITMAP_WINDOW];
        let mut pos = 0usize;
        let mut mismatch = 0u64;
        let mut backup_boot = false;

        'outer: loop {
            let count = self.vol.read_bitmap(pos as u64, &mut window)?;
            if count == 0 {
                if expected.len() > pos {
                    return Err(CarveError::Corrupt(format!(
                        "$Bitmap size is smaller than expected ({} != {})",
                        expected.len(),
                        pos
                    )));
                }
                break;
            }

            for i in 0..count {
                self.prog.update_weighted(
                    PCT_ACCOUNTING.0,
                    PCT_ACCOUNTING.1,
                    pos as u64,
                    expected.len() as u64,
                );
                if self.prog.is_cancelled() {
                    return Err(CarveError::Cancelled);
                }

                if pos >= expected.len() {
                    break 'outer;
                }
                if expected[pos] == window[i] {
                    pos += 1;
                    continue;
                }

                for cl in (pos as u64 * 8)..(pos as u64 + 1) * 8 {
                    let ours = expected[pos] & (1 << (cl % 8)) != 0;
                    let disk = window[i] & (1 << (cl % 8)) != 0;
                    if ours == disk {
                        continue;
                    }

                    if mismatch == 0 && !ours && !backup_boot && cl == nr_clusters / 2 {
                        debug!("Found backup boot sector in the middle of the volume");
                        backup_boot = true;
                        continue;
                    }

                    mismatch += 1;
                    if mismatch <= MISMATCH_LIMIT {
                        warn!(
                            "Cluster accounting failed at {} ({:#x}): {} cluster in $Bitmap",
                            cl,
                            cl,
                            if ours { "missing" } else { "extra" }
                        );
                    }
                }
                pos += 1;
            }
        }

        if mismatch > MISMATCH_LIMIT {
            return Err(CarveError::Corrupt(format!(
                "Filesystem check failed. Total of {} cluster accounting mismatches.",
                mismatch
            )));
        }
        if mismatch > 0 {
            warn!("{} cluster accounting mismatches tolerated", mismatch);
        }
        Ok(())
    }

    /// Phase 4: walk every attribute's runs, tracking the last LCN used per
    /// category and the highest cluster pinned by an unsupported layout.
    fn set_resize_constraints(&mut self) -> Result<(), CarveError> {
        self.prog.set_status("Collecting resizing constraints");

        let nr_records = self.nr_mft_records();
        for mref in 0..nr_records {
            let record = match self.vol.read_record(mref)? {
                Some(record) => record,
                None => continue,
            };
            if record.base_record.is_some() {
                continue;
            }

            for attr in record.attrs.iter().filter(|a| a.non_resident) {
                for run in &attr.runlist {
                    if !matches!(run.lcn, Lcn::At(_)) {
                        continue;
                    }
                    self.collect_resize_constraints(mref, &record, attr, run)?;
                    if self.shrink {
                        self.collect_relocation_info(mref, attr, run)?;
                    }
                }
            }

            self.prog
                .update_weighted(PCT_CONSTRAINTS.0, PCT_CONSTRAINTS.1, mref, nr_records);
            if self.prog.is_cancelled() {
                return Err(CarveError::Cancelled);
            }
        }
        Ok(())
    }

    fn collect_resize_constraints(
        &mut self,
        mref: u64,
        record: &MftRecord,
        attr: &Attribute,
        run: &RunEntry,
    ) -> Result<(), CarveError> {
        let lcn = match run.lcn {
            Lcn::At(lcn) => lcn,
            _ => return Ok(()),
        };
        let last_lcn = lcn + run.length - 1;

        // $BadClus:$Bad runs were tallied separately; they are neither
        // relocatable nor a supported-layout constraint.
        if is_badclus_bad(mref, attr) {
            return Ok(());
        }

        let (bucket, supported) = if mref == FILE_BITMAP {
            if attr.is_data() && record.has_attr_list {
                return Err(CarveError::Unsupported(
                    "Highly fragmented $Bitmap isn't supported yet".to_string(),
                ));
            }
            (Bucket::Ordinary, true)
        } else if mref == FILE_MFT {
            // The first data run of $MFT can't be relocated yet.
            (Bucket::Mft, !(attr.is_data() && run.vcn == 0))
        } else if record.has_attr_list {
            (Bucket::MultiMft, mref != FILE_MFTMIRR)
        } else if attr.flags.sparse {
            (Bucket::Sparse, true)
        } else if attr.flags.compressed {
            (Bucket::Compressed, true)
        } else if mref == FILE_MFTMIRR {
            // A fragmented $MFTMirr data attribute isn't supported yet.
            let supported =
                !(attr.is_data() && (real_run_count(&attr.runlist) > 1 || run.vcn != 0));
            (Bucket::MftMirr, supported)
        } else {
            (Bucket::Ordinary, true)
        };

        let slot = match bucket {
            Bucket::Mft => &mut self.last_mft,
            Bucket::MftMirr => &mut self.last_mftmirr,
            Bucket::MultiMft => &mut self.last_multi_mft,
            Bucket::Sparse => &mut self.last_sparse,
            Bucket::Compressed => &mut self.last_compressed,
            Bucket::Ordinary => &mut self.last_lcn,
        };
        if slot.lcn < last_lcn {
            slot.lcn = last_lcn;
            slot.mref = mref;
        }

        if !supported && self.last_unsupp < last_lcn {
            self.last_unsupp = last_lcn;
        }
        Ok(())
    }

    fn collect_relocation_info(
        &mut self,
        mref: u64,
        attr: &Attribute,
        run: &RunEntry,
    ) -> Result<(), CarveError> {
        let lcn = match run.lcn {
            Lcn::At(lcn) => lcn,
            _ => return Ok(()),
        };

        if lcn + run.length <= self.new_volume_size {
            return Ok(());
        }
        // $Bitmap:$DATA is reallocated wholesale, never relocated.
        if mref == FILE_BITMAP && attr.is_data() {
            return Ok(());
        }

        let mut len = run.length;
        if lcn < self.new_volume_size {
            len = run.length - (self.new_volume_size - lcn);
            if !self.info_only && mref == FILE_MFTMIRR {
                return Err(CarveError::Unsupported(
                    "$MFTMirr can't be split up yet. Please try a different size.".to_string(),
                ));
            }
        }

        self.relocations += len;
        if self.info_only {
            debug!("Relocation needed for record {}", mref);
        }
        Ok(())
    }

    /// Phase 5: never shrink below the number of clusters in use, even if
    /// every one of them were movable.
    fn set_disk_usage_constraint(&mut self) {
        let last = self.inuse.saturating_sub(1);
        if self.last_unsupp < last {
            self.last_unsupp = last;
        }
    }

    fn check_resize_constraints(&self) -> Result<(), CarveError> {
        self.prog.set_status("Checking resize constraints");

        if !self.shrink {
            return Ok(());
        }
        if self.inuse == self.vol.nr_clusters() {
            return Err(CarveError::NoSpace(
                "Volume is full. To shrink it, delete unused files.".to_string(),
            ));
        }
        if self.info_only {
            return Ok(());
        }
        if self.new_volume_size < self.inuse {
            return Err(CarveError::NoSpace(
                "New size can't be less than the space already occupied by data. \
                 You need to delete unused files."
                    .to_string(),
            ));
        }
        if self.new_volume_size <= self.last_unsupp {
            return Err(CarveError::Unsupported(
                "The fragmentation type you have isn't supported yet. The requested \
                 size is less than the smallest shrunken volume size supported."
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Smallest payload size in sectors: the last pinned cluster plus one
    /// free cluster and the trailing backup boot sector.
    fn min_supported_sectors(&self) -> Result<u64, CarveError> {
        let supported = self.last_unsupp + 2;
        if supported > self.vol.nr_clusters() {
            return Err(CarveError::Unsupported(
                "Very rare, unsupported fragmentation type detected. Try to \
                 defragment the volume and retry."
                    .to_string(),
            ));
        }
        let bytes = supported * self.vol.cluster_size() as u64;
        Ok(bytes.div_ceil(self.vol.sector_size() as u64))
    }

    /// Phase 7: mark the volume dirty so Windows schedules chkdsk, and reset
    /// the journal.
    fn prepare_volume_fixup(&mut self) -> Result<(), CarveError> {
        self.prog
            .set_status("Scheduling chkdsk for NTFS consistency check at Windows boot time");

        let mut flags = self.vol.flags();
        flags.dirty = true;
        if self.vol.version().0 >= 2 {
            flags.mounted_on_nt4 = true;
        }
        self.vol.write_flags(flags)?;
        self.vol.sync()?;

        self.prog
            .set_status("Resetting $LogFile (this might take a while)");
        self.vol.reset_logfile(self.prog)?;
        self.vol.sync()
    }

    /// Phase 8: two relocation passes. Pass A moves every attribute except
    /// $MFT's own data; pass B walks records backwards repeatedly, following
    /// the $MFT data attribute's highest-VCN chain so extension records are
    /// rewritten before the records that describe them.
    fn relocate_inodes(&mut self) -> Result<(), CarveError> {
        self.prog.set_status("Relocating needed data");
        self.relocations = 0;

        let nr_records = self.nr_mft_records();
        for mref in 0..nr_records {
            self.relocate_inode(mref, false)?;
        }

        loop {
            let highest = self.mft_highest_vcn;
            let mut mref = nr_records;
            loop {
                mref -= 1;
                self.relocate_inode(mref, true)?;
                if self.mft_highest_vcn == 0 {
                    return Ok(());
                }
                if mref == 0 {
                    break;
                }
            }
            if highest == self.mft_highest_vcn {
                return Err(CarveError::Corrupt(format!(
                    "Relocation sanity check failed: $MFT highest VCN {} did not decrease",
                    highest
                )));
            }
        }
    }

    fn relocate_inode(&mut self, mref: u64, do_mftdata: bool) -> Result<(), CarveError> {
        let mut record = match self.vol.read_record(mref)? {
            Some(record) => record,
            None => return Ok(()),
        };
        if !record.in_use {
            return Ok(());
        }

        let mut dirty = false;
        for ai in 0..record.attrs.len() {
            if !self.handle_mftdata(&record, ai, do_mftdata) {
                continue;
            }
            if is_badclus_bad(mref, &record.attrs[ai]) {
                continue;
            }
            if mref == FILE_BITMAP && record.attrs[ai].is_data() {
                continue;
            }
            if self.relocate_attribute(mref, &mut record, ai)? {
                dirty = true;
            }
        }

        if dirty {
            self.vol.write_record(&record)?;
        }
        Ok(())
    }

    /// Decide whether this attribute is processed in the current pass, and
    /// maintain the $MFT data highest-VCN bookkeeping.
    fn handle_mftdata(&mut self, record: &MftRecord, ai: usize, do_mftdata: bool) -> bool {
        let attr = &record.attrs[ai];
        let is_mftdata = attr.is_data()
            && (record.mref == FILE_MFT || record.base_record == Some(FILE_MFT));

        if do_mftdata {
            if !is_mftdata {
                return false;
            }
            if self.mft_highest_vcn != attr.highest_vcn {
                return false;
            }
            self.mft_highest_vcn = attr.lowest_vcn.saturating_sub(1);
            true
        } else {
            if is_mftdata {
                if self.mft_highest_vcn < attr.highest_vcn {
                    self.mft_highest_vcn = attr.highest_vcn;
                }
                return false;
            }
            true
        }
    }

    /// Relocate every run of one attribute that lies (or ends) beyond the
    /// new volume size. Returns whether the record was modified.
    fn relocate_attribute(
        &mut self,
        mref: u64,
        record: &mut MftRecord,
        ai: usize,
    ) -> Result<bool, CarveError> {
        if !record.attrs[ai].non_resident {
            return Ok(false);
        }

        let mut rl = record.attrs[ai].runlist.clone();
        let mut moved = false;
        let mut i = 0;
        while i < rl.len() {
            match rl[i].lcn {
                Lcn::Hole | Lcn::NotMapped => {}
                Lcn::At(_) => {
                    if rl[i].length == 0 {
                        return Err(CarveError::Corrupt(format!(
                            "Corrupt runlist in record {} (zero-length run)",
                            mref
                        )));
                    }
                    self.relocate_run(mref, record, ai, &mut rl, i, &mut moved)?;
                }
            }
            i += 1;
        }

        if moved {
            self.replace_attribute_runlist(record, ai, rl)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn relocate_run(
        &mut self,
        mref: u64,
        record: &MftRecord,
        ai: usize,
        rl: &mut Vec<RunEntry>,
        i: usize,
        moved: &mut bool,
    ) -> Result<(), CarveError> {
        let (lcn, length) = match rl[i].lcn {
            Lcn::At(lcn) => (lcn, rl[i].length),
            _ => return Ok(()),
        };

        if lcn + length <= self.new_volume_size {
            return Ok(());
        }
        if lcn < self.new_volume_size {
            // Straddles the boundary: keep the left piece, revisit the right
            // piece on the next iteration.
            runlist::split_run(rl, i, self.new_volume_size)?;
            return Ok(());
        }

        // $MFTMirr prefers the middle of the volume, like format puts it.
        let hint = mref == FILE_MFTMIRR;
        let dest = self
            .alloc
            .alloc(&mut self.bitmap, length, self.new_volume_size, hint)?;

        if mref == FILE_MFTMIRR && record.attrs[ai].is_data() {
            if self.mftmirr_old_lcn.is_some() {
                return Err(CarveError::Unsupported(
                    "Multi-run $MFTMirr isn't supported".to_string(),
                ));
            }
            self.mftmirr_new = Some(dest[0]);
            self.mftmirr_old_lcn = Some(lcn);
        }

        info!(
            "Relocating record {} clusters {:#x} -> {:#x}",
            mref,
            lcn,
            match dest[0].lcn {
                Lcn::At(l) => l,
                _ => 0,
            }
        );

        let mut src = lcn;
        for d in &dest {
            if let Lcn::At(dst) = d.lcn {
                self.copy_clusters(dst, src, d.length)?;
                src += d.length;
            }
        }

        // The old clusters stay marked in the bitmap; the truncation later
        // drops them by being outside the new volume.
        runlist::insert_at_run(rl, i, &dest);
        *moved = true;
        Ok(())
    }

    fn copy_clusters(&mut self, dest: u64, src: u64, length: u64) -> Result<(), CarveError> {
        let mut buf = vec![0u8; self.vol.cluster_size() as usize];
        for i in 0..length {
            self.vol.read_clusters(src + i, 1, &mut buf)?;
            self.vol.write_clusters(dest + i, 1, &buf)?;
            self.relocations += 1;
        }
        Ok(())
    }

    /// Swap an attribute's runlist for a new one, growing the attribute
    /// record in place when the encoded mapping pairs need more room.
    fn replace_attribute_runlist(
        &mut self,
        record: &mut MftRecord,
        ai: usize,
        mut rl: Vec<RunEntry>,
    ) -> Result<(), CarveError> {
        runlist::fixup(&mut rl)?;

        let mp_size = self.vol.mapping_pairs_size(&rl)?;
        let slack = record.attrs[ai].record_length as usize
            - record.attrs[ai].mapping_pairs_offset as usize;

        if mp_size > slack {
            let rounded = (mp_size + 7) & !7;
            let growth = (rounded - slack) as u32;
            debug!(
                "Enlarging attribute header: mapping pairs {} bytes, slack {}",
                mp_size, slack
            );

            if record.bytes_in_use + growth > record.bytes_allocated {
                return Err(CarveError::Unsupported(format!(
                    "Extended record needed ({} > {}), not yet supported. Please \
                     try to free more space.",
                    record.bytes_in_use + growth,
                    record.bytes_allocated
                )));
            }
            record.bytes_in_use += growth;
            record.attrs[ai].record_length += growth;
        }

        record.attrs[ai].runlist = rl;
        Ok(())
    }

    /// Phase 9: $BadClus:$Bad notionally spans the whole volume; truncate it
    /// (or extend its hole) to the new cluster count.
    fn truncate_badclust_file(&mut self) -> Result<(), CarveError> {
        self.prog.set_status("Updating $BadClust file");

        let mut record = self
            .vol
            .read_record(FILE_BADCLUS)?
            .ok_or_else(|| CarveError::Corrupt("Can't read $BadClus".to_string()))?;
        let ai = record
            .attrs
            .iter()
            .position(|a| is_badclus_bad(FILE_BADCLUS, a))
            .ok_or_else(|| CarveError::Corrupt("$BadClus has no $Bad attribute".to_string()))?;
        if !record.attrs[ai].non_resident {
            return Err(CarveError::Unsupported(
                "Resident attribute in $BadClus isn't supported".to_string(),
            ));
        }

        let mut rl = record.attrs[ai].runlist.clone();
        runlist::truncate(&mut rl, self.new_volume_size)?;
        self.replace_attribute_runlist(&mut record, ai, rl)?;

        let bytes = self.new_volume_size * self.vol.cluster_size() as u64;
        let attr = &mut record.attrs[ai];
        attr.highest_vcn = self.new_volume_size - 1;
        attr.allocated_size = bytes;
        attr.data_size = bytes;

        self.vol.write_record(&record)
    }

    /// Phase 10: reallocate $Bitmap:$DATA for the new cluster count and
    /// write the shrunken (or grown) bitmap payload through it.
    fn truncate_bitmap_file(&mut self) -> Result<(), CarveError> {
        self.prog.set_status("Updating $Bitmap file");

        let mut record = self
            .vol
            .read_record(FILE_BITMAP)?
            .ok_or_else(|| CarveError::Corrupt("Can't read $Bitmap".to_string()))?;
        let ai = record
            .attrs
            .iter()
            .position(|a| a.is_data() && a.name.is_empty())
            .ok_or_else(|| CarveError::Corrupt("$Bitmap has no data attribute".to_string()))?;
        if !record.attrs[ai].non_resident {
            return Err(CarveError::Unsupported(
                "Resident attribute in $Bitmap isn't supported".to_string(),
            ));
        }

        let bm_bytes = bitmap_byte_size(self.new_volume_size);
        let nr_bm_clusters = bm_bytes.div_ceil(self.vol.cluster_size() as u64);

        let new_rl;
        if self.shrink {
            // Free the old payload clusters, allocate the smaller payload
            // from the reduced region, then cut the bitmap itself down.
            self.alloc.reset_max_range();
            self.bitmap.set_runs(&record.attrs[ai].runlist, false);
            new_rl = self
                .alloc
                .alloc(&mut self.bitmap, nr_bm_clusters, self.new_volume_size, false)?;
            self.bitmap.resize(bm_bytes, self.new_volume_size);
        } else {
            // Growing is the reverse: extend the bitmap first so the new
            // region exists to allocate from.
            self.bitmap.resize(bm_bytes, self.new_volume_size);
            self.alloc.reset_max_range();
            self.bitmap.set_runs(&record.attrs[ai].runlist, false);
            new_rl = self
                .alloc
                .alloc(&mut self.bitmap, nr_bm_clusters, self.new_volume_size, false)?;
        }

        self.replace_attribute_runlist(&mut record, ai, new_rl.clone())?;

        let attr = &mut record.attrs[ai];
        attr.highest_vcn = nr_bm_clusters - 1;
        attr.allocated_size = nr_bm_clusters * self.vol.cluster_size() as u64;
        attr.data_size = bm_bytes;
        attr.initialized_size = bm_bytes;

        self.vol
            .write_run_data(&new_rl, &self.bitmap.as_bytes()[..bm_bytes as usize])?;
        self.vol.write_record(&record)
    }

    /// Phase 11: rewrite the boot sector's sector count, and when $MFTMirr
    /// moved, copy its payload to the new home and point the boot sector at
    /// it.
    fn update_bootsector(&mut self) -> Result<(), CarveError> {
        self.prog.set_status("Updating boot record");

        let mut boot = self.vol.read_boot_sector()?;
        let sectors_per_cluster = boot[0x0D] as u64;
        LittleEndian::write_u64(
            &mut boot[0x28..0x30],
            self.new_volume_size * sectors_per_cluster,
        );

        if let (Some(new_run), Some(old_lcn)) = (self.mftmirr_new, self.mftmirr_old_lcn) {
            if let Lcn::At(new_lcn) = new_run.lcn {
                self.copy_clusters(new_lcn, old_lcn, new_run.length)?;
                LittleEndian::write_u64(&mut boot[0x38..0x40], new_lcn);
            }
        }

        self.vol.write_boot_sector(&boot)
    }
}
