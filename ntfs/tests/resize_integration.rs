// Resize engine tests against the in-memory mock volume.

use carve_core::{CarveError, Progress};
use carve_ntfs::bitmap::bitmap_byte_size;
use carve_ntfs::meta::{Lcn, RunEntry, FILE_BADCLUS, FILE_BITMAP, FILE_MFTMIRR};
use carve_ntfs::mock::MockVolume;
use carve_ntfs::{resize, resize_constraints, ResizeRequest};

const CLUSTER: u64 = 512;

/// 1000-cluster volume whose $MFT sits at clusters 500..509, pinning
/// `last_unsupp` at 509 (the first $MFT data run can't be relocated).
fn pinned_volume() -> MockVolume {
    let mut vol = MockVolume::new(1000);
    vol.add_data_record(0, "", vec![RunEntry::new(0, Lcn::At(500), 10)]);
    vol.records.get_mut(&0).unwrap().attrs[0].highest_vcn = 9;
    vol.sync_bitmap_from_records();
    vol
}

fn request(clusters: u64) -> ResizeRequest {
    ResizeRequest {
        new_sectors: Some(clusters),
        force: false,
        bad_sectors: false,
    }
}

#[test]
fn test_noop_when_size_unchanged() {
    let mut vol = MockVolume::new(1000);
    vol.sync_bitmap_from_records();

    // 1001 requested sectors less the backup reservation is exactly the
    // current 1000 clusters.
    let prog = Progress::new(100);
    resize(&mut vol, &request(1001), &prog).unwrap();

    assert_eq!(vol.logfile_resets, 0);
    assert_eq!(vol.syncs, 0);
    assert!(!vol.flags.dirty);
    assert_eq!(vol.boot_sector_count(), 1000);
    assert!(prog.snapshot().complete);
}

#[test]
fn test_shrink_constraint_ladder() {
    // last_unsupp = 509 after constraint collection. A shrink needs
    // new_size > last_unsupp, where new_size = requested clusters - 1.
    {
        let mut vol = pinned_volume();
        let prog = Progress::new(100);
        resize(&mut vol, &request(511), &prog).unwrap();
        assert_eq!(vol.boot_sector_count(), 510);
        assert!(vol.flags.dirty);
        assert_eq!(vol.logfile_resets, 1);
    }
    {
        let mut vol = pinned_volume();
        let prog = Progress::new(100);
        match resize(&mut vol, &request(510), &prog) {
            Err(CarveError::Unsupported(msg)) => {
                assert!(msg.contains("fragmentation"), "got: {}", msg)
            }
            other => panic!("expected fragmentation refusal, got {:?}", other),
        }
        // Refused before any metadata write.
        assert!(!vol.flags.dirty);
        assert_eq!(vol.logfile_resets, 0);
    }
}

#[test]
fn test_shrink_below_in_use_rejected() {
    let mut vol = MockVolume::new(1000);
    // A big user file: 700 clusters in use in total.
    vol.add_data_record(24, "", vec![RunEntry::new(0, Lcn::At(64), 650)]);
    vol.sync_bitmap_from_records();

    let prog = Progress::new(100);
    match resize(&mut vol, &request(300), &prog) {
        Err(CarveError::NoSpace(msg)) => {
            assert!(msg.contains("already occupied"), "got: {}", msg)
        }
        other => panic!("expected in-use refusal, got {:?}", other),
    }
}

#[test]
fn test_constraints_info_mode_is_read_only() {
    let mut vol = pinned_volume();
    let prog = Progress::new(100);
    let (min_sectors, max_sectors) = resize_constraints(&mut vol, &prog).unwrap();

    // last_unsupp 509 plus one free cluster plus the backup boot sector.
    assert_eq!(min_sectors, 511);
    assert!(max_sectors > vol.nr_clusters);

    assert!(!vol.flags.dirty);
    assert_eq!(vol.logfile_resets, 0);
    assert_eq!(vol.boot_sector_count(), 1000);
    assert!(prog.snapshot().complete);
}

#[test]
fn test_shrink_relocates_straddling_run() {
    let mut vol = MockVolume::new(1000);
    // User file straddling the shrink boundary: clusters 590..619.
    vol.add_data_record(30, "", vec![RunEntry::new(0, Lcn::At(590), 30)]);
    vol.sync_bitmap_from_records();

    for i in 0..30 {
        vol.stamp_cluster(590 + i, 0xC5);
    }

    // Shrink to 600 clusters (601 requested sectors).
    let prog = Progress::new(100);
    resize(&mut vol, &request(601), &prog).unwrap();

    let record = &vol.records[&30];
    let runs = &record.attrs[0].runlist;
    assert!(runs.len() >= 2, "straddling run must split: {:?}", runs);
    assert_eq!(runs[0], RunEntry::new(0, Lcn::At(590), 10));

    // The relocated tail lives below the new volume end and carries the
    // payload.
    let mut covered = 10;
    for run in &runs[1..] {
        let lcn = match run.lcn {
            Lcn::At(lcn) => lcn,
            other => panic!("unexpected run target {:?}", other),
        };
        assert!(lcn + run.length <= 600);
        for i in 0..run.length {
            assert_eq!(vol.cluster_byte(lcn + i), 0xC5);
        }
        covered += run.length;
    }
    assert_eq!(covered, 30);

    assert_eq!(vol.boot_sector_count(), 600);
    assert!(vol.records_written.contains(&30));

    // $BadClus:$Bad was truncated to the new cluster count.
    let bad = &vol.records[&FILE_BADCLUS].attrs[0];
    assert_eq!(bad.highest_vcn, 599);
    assert_eq!(bad.allocated_size, 600 * CLUSTER);
    assert_eq!(bad.runlist, vec![RunEntry::new(0, Lcn::Hole, 600)]);

    // $Bitmap matches the new size.
    let bm = &vol.records[&FILE_BITMAP].attrs[0];
    assert_eq!(bm.data_size, bitmap_byte_size(600));
    assert_eq!(vol.bitmap_bytes.len() as u64, bitmap_byte_size(600));
}

#[test]
fn test_shrink_relocates_mftmirr_and_updates_bootsector() {
    let mut vol = MockVolume::new(1000);
    // Move $MFTMirr's single run beyond the shrink target.
    vol.records.get_mut(&FILE_MFTMIRR).unwrap().attrs[0].runlist =
        vec![RunEntry::new(0, Lcn::At(700), 1)];
    vol.sync_bitmap_from_records();
    vol.stamp_cluster(700, 0x4D);

    let prog = Progress::new(100);
    resize(&mut vol, &request(601), &prog).unwrap();

    let mirr = &vol.records[&FILE_MFTMIRR].attrs[0];
    let new_lcn = match mirr.runlist[0].lcn {
        Lcn::At(lcn) => lcn,
        other => panic!("unexpected $MFTMirr target {:?}", other),
    };
    assert!(new_lcn < 600);
    // The allocation hint aims at the middle of the new volume.
    assert!(new_lcn >= 300, "expected a mid-volume home, got {}", new_lcn);

    assert_eq!(vol.boot_mftmirr_lcn(), new_lcn);
    assert_eq!(vol.cluster_byte(new_lcn), 0x4D);
}

#[test]
fn test_grow_extends_badclust_and_bitmap() {
    let mut vol = MockVolume::new(1000);
    vol.device_sectors = 2001;
    vol.sync_bitmap_from_records();

    let prog = Progress::new(100);
    resize(&mut vol, &request(1501), &prog).unwrap();

    assert_eq!(vol.boot_sector_count(), 1500);

    let bad = &vol.records[&FILE_BADCLUS].attrs[0];
    assert_eq!(bad.runlist, vec![RunEntry::new(0, Lcn::Hole, 1500)]);
    assert_eq!(bad.highest_vcn, 1499);

    let bm = &vol.records[&FILE_BITMAP].attrs[0];
    assert_eq!(bm.data_size, bitmap_byte_size(1500));
    assert_eq!(vol.bitmap_bytes.len() as u64, bitmap_byte_size(1500));
}

#[test]
fn test_grow_beyond_device_rejected() {
    let mut vol = MockVolume::new(1000);
    vol.sync_bitmap_from_records();

    let prog = Progress::new(100);
    assert!(matches!(
        resize(&mut vol, &request(5000), &prog),
        Err(CarveError::Parameter(_))
    ));
}

#[test]
fn test_dirty_volume_needs_force() {
    let mut vol = pinned_volume();
    vol.flags.dirty = true;

    let prog = Progress::new(100);
    assert!(matches!(
        resize(&mut vol, &request(511), &prog),
        Err(CarveError::Corrupt(_))
    ));

    let forced = ResizeRequest {
        new_sectors: Some(511),
        force: true,
        bad_sectors: false,
    };
    let prog = Progress::new(100);
    resize(&mut vol, &forced, &prog).unwrap();
    assert_eq!(vol.boot_sector_count(), 510);
}

#[test]
fn test_bad_sectors_refused_without_opt_in() {
    let mut vol = MockVolume::new(1000);
    // One bad cluster recorded in $BadClus:$Bad.
    vol.records.get_mut(&FILE_BADCLUS).unwrap().attrs[0].runlist = vec![
        RunEntry::new(0, Lcn::Hole, 400),
        RunEntry::new(400, Lcn::At(400), 1),
        RunEntry::new(401, Lcn::Hole, 599),
    ];
    vol.sync_bitmap_from_records();

    let prog = Progress::new(100);
    match resize(&mut vol, &request(901), &prog) {
        Err(CarveError::Unsupported(msg)) => assert!(msg.contains("bad sectors")),
        other => panic!("expected bad-sector refusal, got {:?}", other),
    }

    let opted_in = ResizeRequest {
        new_sectors: Some(901),
        force: false,
        bad_sectors: true,
    };
    let prog = Progress::new(100);
    resize(&mut vol, &opted_in, &prog).unwrap();
}

#[test]
fn test_bitmap_mismatch_past_threshold_is_fatal() {
    let mut vol = MockVolume::new(1000);
    vol.sync_bitmap_from_records();
    // Sixteen spurious extra bits, well past the tolerated threshold.
    vol.bitmap_bytes[10] = 0xFF;
    vol.bitmap_bytes[11] = 0xFF;

    let prog = Progress::new(100);
    match resize(&mut vol, &request(601), &prog) {
        Err(CarveError::Corrupt(msg)) => assert!(msg.contains("mismatches"), "got: {}", msg),
        other => panic!("expected accounting failure, got {:?}", other),
    }
}

#[test]
fn test_backup_boot_bit_tolerated() {
    // sync_bitmap_from_records marks the middle cluster used without any
    // record referencing it; the check must accept that.
    let mut vol = MockVolume::new(1000);
    vol.sync_bitmap_from_records();

    let prog = Progress::new(100);
    resize(&mut vol, &request(601), &prog).unwrap();
}

#[test]
fn test_fragmented_mftmirr_is_unsupported() {
    let mut vol = MockVolume::new(1000);
    vol.records.get_mut(&FILE_MFTMIRR).unwrap().attrs[0].runlist = vec![
        RunEntry::new(0, Lcn::At(700), 1),
        RunEntry::new(1, Lcn::At(800), 1),
    ];
    vol.sync_bitmap_from_records();

    // The fragmented mirror pins last_unsupp at 800; shrinking past it is
    // refused as unsupported fragmentation.
    let prog = Progress::new(100);
    match resize(&mut vol, &request(601), &prog) {
        Err(CarveError::Unsupported(msg)) => {
            assert!(msg.contains("fragmentation"), "got: {}", msg)
        }
        other => panic!("expected refusal, got {:?}", other),
    }
}

#[test]
fn test_mapping_pairs_growth_bounded_by_record() {
    let mut vol = MockVolume::new(1000);
    // A run beyond the boundary whose record has no slack at all.
    vol.add_data_record(40, "", vec![RunEntry::new(0, Lcn::At(700), 20)]);
    {
        let record = vol.records.get_mut(&40).unwrap();
        record.bytes_allocated = record.bytes_in_use;
        record.attrs[0].record_length = 66;
        record.attrs[0].mapping_pairs_offset = 64;
    }
    vol.sync_bitmap_from_records();

    let prog = Progress::new(100);
    match resize(&mut vol, &request(601), &prog) {
        Err(CarveError::Other(msg)) => {
            assert!(msg.contains("Extended record needed"), "got: {}", msg);
            assert!(msg.contains("chkdsk"), "got: {}", msg);
        }
        other => panic!("expected extended-record refusal, got {:?}", other),
    }
}

#[test]
fn test_cancellation_between_phases() {
    let mut vol = pinned_volume();
    let prog = Progress::new(100);
    prog.request_cancel();

    match resize(&mut vol, &request(511), &prog) {
        Err(CarveError::Cancelled) => {}
        other => panic!("expected cancellation, got {:?}", other),
    }
    // A cancelled scan leaves the volume untouched.
    assert!(!vol.flags.dirty);
    assert_eq!(vol.logfile_resets, 0);
}
