/// In-memory mock volume for exercising the resize engine without the real
/// metadata library or hardware.
use std::collections::BTreeMap;

use byteorder::{ByteOrder, LittleEndian};
use carve_core::{CarveError, Progress};

use crate::bitmap::Bitmap;
use crate::meta::{
    Attribute, Lcn, MftRecord, NtfsVolume, RunEntry, VolumeFlags, FILE_BADCLUS, FILE_BITMAP,
    FILE_MFT, FILE_MFTMIRR,
};

pub struct MockVolume {
    pub sector_size: u32,
    pub cluster_size: u32,
    pub nr_clusters: u64,
    pub mft_record_size: u32,
    pub device_sectors: u64,
    pub version: (u8, u8),
    pub mounted_elsewhere: bool,
    pub flags: VolumeFlags,
    pub records: BTreeMap<u64, MftRecord>,
    /// Raw cluster payload store, one slot per cluster of the device.
    pub clusters: Vec<u8>,
    /// On-disk $Bitmap:$DATA content.
    pub bitmap_bytes: Vec<u8>,
    pub boot: Vec<u8>,
    pub logfile_resets: u32,
    pub syncs: u32,
    pub records_written: Vec<u64>,
}

impl MockVolume {
    /// A small coherent volume: cluster size 512, one sector per cluster,
    /// with the reserved system records the engine expects.
    pub fn new(nr_clusters: u64) -> Self {
        let cluster_size = 512u32;
        let mut vol = MockVolume {
            sector_size: 512,
            cluster_size,
            nr_clusters,
            mft_record_size: 1024,
            device_sectors: nr_clusters + 1,
            version: (3, 1),
            mounted_elsewhere: false,
            flags: VolumeFlags::default(),
            records: BTreeMap::new(),
            clusters: vec![0u8; (nr_clusters * cluster_size as u64) as usize],
            bitmap_bytes: Vec::new(),
            boot: vec![0u8; 512],
            logfile_resets: 0,
            syncs: 0,
            records_written: Vec::new(),
        };

        // Boot sector: sectors-per-cluster and the current sector count.
        vol.boot[0x0D] = 1;
        LittleEndian::write_u64(&mut vol.boot[0x28..0x30], nr_clusters);
        LittleEndian::write_u64(&mut vol.boot[0x38..0x40], 8);

        // $MFT: sixteen clusters at LCN 16.
        vol.add_data_record(FILE_MFT, "", vec![RunEntry::new(0, Lcn::At(16), 16)]);
        // $MFTMirr: one cluster at LCN 8.
        vol.add_data_record(FILE_MFTMIRR, "", vec![RunEntry::new(0, Lcn::At(8), 1)]);
        // $Bitmap: one cluster at LCN 32.
        vol.add_data_record(FILE_BITMAP, "", vec![RunEntry::new(0, Lcn::At(32), 1)]);
        // $BadClus:$Bad: a hole spanning the volume, no bad clusters.
        vol.add_data_record(
            FILE_BADCLUS,
            "$Bad",
            vec![RunEntry::new(0, Lcn::Hole, nr_clusters)],
        );

        vol
    }

    /// Add a record holding one non-resident data attribute with the given
    /// runlist.
    pub fn add_data_record(&mut self, mref: u64, name: &str, runs: Vec<RunEntry>) {
        let clusters: u64 = runs.iter().map(|r| r.length).sum();
        let data_bytes = clusters * self.cluster_size as u64;
        let attr = Attribute {
            kind: crate::meta::AttrType::Data,
            name: name.to_string(),
            non_resident: true,
            lowest_vcn: 0,
            highest_vcn: clusters.saturating_sub(1),
            allocated_size: data_bytes,
            data_size: data_bytes,
            initialized_size: data_bytes,
            flags: Default::default(),
            record_length: 128,
            mapping_pairs_offset: 64,
            runlist: runs,
        };
        self.records.insert(
            mref,
            MftRecord {
                mref,
                in_use: true,
                base_record: None,
                has_attr_list: false,
                bytes_in_use: 256,
                bytes_allocated: self.mft_record_size,
                attrs: vec![attr],
            },
        );
    }

    /// Derive the on-disk $Bitmap from the current records, with the backup
    /// boot sector cluster at the volume middle marked used.
    pub fn sync_bitmap_from_records(&mut self) {
        let mut bm = Bitmap::new(self.nr_clusters);
        for record in self.records.values() {
            if record.base_record.is_some() {
                continue;
            }
            for attr in &record.attrs {
                if attr.non_resident {
                    bm.set_runs(&attr.runlist, true);
                }
            }
        }
        bm.set(self.nr_clusters / 2, true);
        self.bitmap_bytes = bm.as_bytes().to_vec();
    }

    /// Fill a cluster with a recognizable byte.
    pub fn stamp_cluster(&mut self, lcn: u64, value: u8) {
        let start = (lcn * self.cluster_size as u64) as usize;
        self.clusters[start..start + self.cluster_size as usize].fill(value);
    }

    pub fn cluster_byte(&self, lcn: u64) -> u8 {
        self.clusters[(lcn * self.cluster_size as u64) as usize]
    }

    pub fn boot_sector_count(&self) -> u64 {
        LittleEndian::read_u64(&self.boot[0x28..0x30])
    }

    pub fn boot_mftmirr_lcn(&self) -> u64 {
        LittleEndian::read_u64(&self.boot[0x38..0x40])
    }
}

fn unsigned_bytes(value: u64) -> usize {
    let mut bytes = 1;
    let mut v = value >> 8;
    while v != 0 {
        bytes += 1;
        v >>= 8;
    }
    bytes
}

fn signed_bytes(value: i64) -> usize {
    let mut bytes = 1;
    loop {
        let shifted = value >> (bytes * 8 - 1);
        if shifted == 0 || shifted == -1 {
            return bytes;
        }
        bytes += 1;
    }
}

impl NtfsVolume for MockVolume {
    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn cluster_size(&self) -> u32 {
        self.cluster_size
    }

    fn nr_clusters(&self) -> u64 {
        self.nr_clusters
    }

    fn mft_record_size(&self) -> u32 {
        self.mft_record_size
    }

    fn mft_initialized_size(&self) -> u64 {
        let highest = self.records.keys().max().copied().unwrap_or(0);
        (highest + 1) * self.mft_record_size as u64
    }

    fn version(&self) -> (u8, u8) {
        self.version
    }

    fn device_size_sectors(&self) -> u64 {
        self.device_sectors
    }

    fn is_mounted_elsewhere(&self) -> bool {
        self.mounted_elsewhere
    }

    fn flags(&self) -> VolumeFlags {
        self.flags
    }

    fn write_flags(&mut self, flags: VolumeFlags) -> Result<(), CarveError> {
        self.flags = flags;
        Ok(())
    }

    fn read_record(&mut self, mref: u64) -> Result<Option<MftRecord>, CarveError> {
        Ok(self.records.get(&mref).cloned())
    }

    fn write_record(&mut self, record: &MftRecord) -> Result<(), CarveError> {
        self.records_written.push(record.mref);
        self.records.insert(record.mref, record.clone());
        Ok(())
    }

    fn read_bitmap(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, CarveError> {
        if offset >= self.bitmap_bytes.len() as u64 {
            return Ok(0);
        }
        let available = self.bitmap_bytes.len() - offset as usize;
        let len = buf.len().min(available);
        buf[..len].copy_from_slice(&self.bitmap_bytes[offset as usize..offset as usize + len]);
        Ok(len)
    }

    fn write_run_data(&mut self, runs: &[RunEntry], data: &[u8]) -> Result<(), CarveError> {
        let mut offset = 0usize;
        for run in runs {
            let len = (run.length * self.cluster_size as u64) as usize;
            if let Lcn::At(lcn) = run.lcn {
                let start = (lcn * self.cluster_size as u64) as usize;
                let take = len.min(data.len().saturating_sub(offset));
                self.clusters[start..start + take].copy_from_slice(&data[offset..offset + take]);
            }
            offset += len;
        }
        // Keep the mock's on-disk bitmap view in step when $Bitmap moves.
        self.bitmap_bytes = data.to_vec();
        Ok(())
    }

    fn read_clusters(&mut self, lcn: u64, count: u64, buf: &mut [u8]) -> Result<(), CarveError> {
        let start = (lcn * self.cluster_size as u64) as usize;
        let len = (count * self.cluster_size as u64) as usize;
        buf[..len].copy_from_slice(&self.clusters[start..start + len]);
        Ok(())
    }

    fn write_clusters(&mut self, lcn: u64, count: u64, buf: &[u8]) -> Result<(), CarveError> {
        let start = (lcn * self.cluster_size as u64) as usize;
        let len = (count * self.cluster_size as u64) as usize;
        self.clusters[start..start + len].copy_from_slice(&buf[..len]);
        Ok(())
    }

    fn read_boot_sector(&mut self) -> Result<Vec<u8>, CarveError> {
        Ok(self.boot.clone())
    }

    fn write_boot_sector(&mut self, data: &[u8]) -> Result<(), CarveError> {
        self.boot = data.to_vec();
        Ok(())
    }

    fn reset_logfile(&mut self, _prog: &Progress) -> Result<(), CarveError> {
        self.logfile_resets += 1;
        Ok(())
    }

    fn sync(&mut self) -> Result<(), CarveError> {
        self.syncs += 1;
        Ok(())
    }

    fn mapping_pairs_size(&self, runs: &[RunEntry]) -> Result<usize, CarveError> {
        // The compact NTFS encoding: one header byte per run plus the
        // minimal length and (for real runs) signed delta-LCN bytes, and a
        // terminator.
        let mut size = 1usize;
        let mut prev_lcn = 0i64;
        for run in runs {
            match run.lcn {
                Lcn::Hole => {
                    size += 1 + unsigned_bytes(run.length);
                }
                Lcn::At(lcn) => {
                    let delta = lcn as i64 - prev_lcn;
                    size += 1 + unsigned_bytes(run.length) + signed_bytes(delta);
                    prev_lcn = lcn as i64;
                }
                Lcn::NotMapped => {
                    return Err(CarveError::Parameter(
                        "unmapped run in mapping pairs".to_string(),
                    ))
                }
            }
        }
        Ok(size)
    }
}
