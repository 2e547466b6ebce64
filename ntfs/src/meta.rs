// Contract of the external NTFS metadata library. The resize engine drives a
// volume through these types; it never decodes MFT records, mapping pairs,
// or Unicode names itself.

use carve_core::{CarveError, Progress};

// Reserved system file record numbers.
pub const FILE_MFT: u64 = 0;
pub const FILE_MFTMIRR: u64 = 1;
pub const FILE_LOGFILE: u64 = 2;
pub const FILE_VOLUME: u64 = 3;
pub const FILE_ATTRDEF: u64 = 4;
pub const FILE_ROOT: u64 = 5;
pub const FILE_BITMAP: u64 = 6;
pub const FILE_BOOT: u64 = 7;
pub const FILE_BADCLUS: u64 = 8;

pub const MAX_CLUSTER_SIZE: u32 = 65536;

/// Where a run's clusters live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lcn {
    /// Sparse hole; no clusters allocated.
    Hole,
    /// Not mapped by this runlist fragment.
    NotMapped,
    At(u64),
}

/// One element of a decoded runlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunEntry {
    pub vcn: u64,
    pub lcn: Lcn,
    pub length: u64,
}

impl RunEntry {
    pub fn new(vcn: u64, lcn: Lcn, length: u64) -> Self {
        RunEntry { vcn, lcn, length }
    }
}

/// Total virtual length covered by a runlist.
pub fn runlist_vcn_length(runs: &[RunEntry]) -> u64 {
    runs.last().map(|r| r.vcn + r.length).unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrType {
    StandardInformation,
    AttributeList,
    FileName,
    VolumeName,
    VolumeInformation,
    Data,
    IndexRoot,
    IndexAllocation,
    Bitmap,
    LoggedUtilityStream,
    Other(u32),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttrFlags {
    pub sparse: bool,
    pub compressed: bool,
}

/// One attribute of an MFT record, as materialized by the metadata library.
/// Non-resident attributes carry their decoded runlist; the encoded mapping
/// pairs stay inside the library.
#[derive(Debug, Clone)]
pub struct Attribute {
    pub kind: AttrType,
    pub name: String,
    pub non_resident: bool,
    pub lowest_vcn: u64,
    pub highest_vcn: u64,
    pub allocated_size: u64,
    pub data_size: u64,
    pub initialized_size: u64,
    pub flags: AttrFlags,
    /// Length of the whole attribute record inside the MFT record.
    pub record_length: u32,
    /// Offset of the mapping pairs within the attribute record; the slack
    /// after it bounds in-place runlist growth.
    pub mapping_pairs_offset: u16,
    pub runlist: Vec<RunEntry>,
}

impl Attribute {
    pub fn is_data(&self) -> bool {
        self.kind == AttrType::Data
    }
}

/// A parsed MFT record view.
#[derive(Debug, Clone)]
pub struct MftRecord {
    pub mref: u64,
    pub in_use: bool,
    /// Base record number when this is an extension record.
    pub base_record: Option<u64>,
    /// Whether the owning inode has an attribute list.
    pub has_attr_list: bool,
    pub bytes_in_use: u32,
    pub bytes_allocated: u32,
    pub attrs: Vec<Attribute>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VolumeFlags {
    pub dirty: bool,
    pub mounted_on_nt4: bool,
}

/// An open NTFS volume as provided by the metadata library.
pub trait NtfsVolume {
    fn sector_size(&self) -> u32;
    fn cluster_size(&self) -> u32;
    fn nr_clusters(&self) -> u64;
    fn mft_record_size(&self) -> u32;
    /// Initialized byte size of $MFT:$DATA; bounds the record scan.
    fn mft_initialized_size(&self) -> u64;
    /// NTFS (major, minor) version.
    fn version(&self) -> (u8, u8);
    /// Total size of the underlying device, in sectors.
    fn device_size_sectors(&self) -> u64;
    /// Whether another process holds the volume open.
    fn is_mounted_elsewhere(&self) -> bool;

    fn flags(&self) -> VolumeFlags;
    fn write_flags(&mut self, flags: VolumeFlags) -> Result<(), CarveError>;

    /// Read one MFT record. `Ok(None)` means the record can't be read or
    /// doesn't exist; callers skip it.
    fn read_record(&mut self, mref: u64) -> Result<Option<MftRecord>, CarveError>;
    fn write_record(&mut self, record: &MftRecord) -> Result<(), CarveError>;

    /// Read from $Bitmap:$DATA at the given byte offset; returns the number
    /// of bytes read, 0 at end of data.
    fn read_bitmap(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, CarveError>;

    /// Write `data` across the clusters a runlist describes.
    fn write_run_data(&mut self, runs: &[RunEntry], data: &[u8]) -> Result<(), CarveError>;

    fn read_clusters(&mut self, lcn: u64, count: u64, buf: &mut [u8]) -> Result<(), CarveError>;
    fn write_clusters(&mut self, lcn: u64, count: u64, buf: &[u8]) -> Result<(), CarveError>;

    fn read_boot_sector(&mut self) -> Result<Vec<u8>, CarveError>;
    fn write_boot_sector(&mut self, data: &[u8]) -> Result<(), CarveError>;

    /// Reset $LogFile; drives its own share of the progress scale.
    fn reset_logfile(&mut self, prog: &Progress) -> Result<(), CarveError>;
    fn sync(&mut self) -> Result<(), CarveError>;

    /// Byte size of the encoded mapping pairs for a runlist.
    fn mapping_pairs_size(&self, runs: &[RunEntry]) -> Result<usize, CarveError>;
}
