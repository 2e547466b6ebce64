// The disk label interface. MBR and GPT are the two implementations; code
// elsewhere consults the capability flags, never the concrete kind.

use carve_core::{BlockDevice, CarveError, Disk};

use crate::table::Slice;
use crate::types::{CreateKind, RawSlice, TypeEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelKind {
    Msdos,
    Gpt,
}

/// What a label scheme supports. Callers branch on these flags instead of
/// matching on [`LabelKind`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelCaps {
    pub primary_parts: bool,
    pub logical_parts: bool,
    pub use_tags: bool,
    pub use_guids: bool,
    pub use_active: bool,
}

pub trait Label: Send + Sync {
    fn kind(&self) -> LabelKind;
    fn caps(&self) -> LabelCaps;

    /// Probe the device for this label. `Ok(false)` means "not this label";
    /// errors are real I/O failures.
    fn detect(&self, disk: &Disk, dev: &mut dyn BlockDevice) -> Result<bool, CarveError>;

    /// Read the on-disk table into raw slices, ordered by table order.
    fn read_table(&self, disk: &Disk, dev: &mut dyn BlockDevice)
        -> Result<Vec<RawSlice>, CarveError>;

    /// Serialize and write the table. `slices` holds only used entries; the
    /// codec lays them out by their `order` fields.
    fn write_table(
        &self,
        disk: &Disk,
        dev: &mut dyn BlockDevice,
        slices: &[RawSlice],
    ) -> Result<(), CarveError>;

    /// Human-readable partition type name.
    fn describe_slice(&self, raw: &RawSlice) -> String;

    /// Whether (and what kind of) a partition can be created in the empty
    /// slice at `empty_index`.
    fn can_create(&self, slices: &[Slice], empty_index: usize) -> CreateKind;

    fn can_hide(&self, _slice: &Slice) -> bool {
        false
    }

    fn hide(&self, _raw: &mut RawSlice) {}

    fn list_types(&self) -> Vec<TypeEntry>;

    /// Set the type of `raw` to the `index`-th entry of `list_types`.
    fn set_type(&self, raw: &mut RawSlice, index: usize) -> Result<(), CarveError>;

    /// Give a brand-new slice the label's default type.
    fn set_default_type(&self, raw: &mut RawSlice);
}

/// Probe a disk for its label. GPT must be tried first: a GPT disk carries a
/// legal protective MBR that would otherwise satisfy MS-DOS detection.
pub fn detect_label(
    disk: &Disk,
    dev: &mut dyn BlockDevice,
) -> Result<Option<Box<dyn Label>>, CarveError> {
    let gpt = crate::gpt::GptLabel;
    if gpt.detect(disk, dev)? {
        return Ok(Some(Box::new(gpt)));
    }
    let msdos = crate::mbr::MsdosLabel;
    if msdos.detect(disk, dev)? {
        return Ok(Some(Box::new(msdos)));
    }
    Ok(None)
}
