// Partition table management: disk labels, slice views, and the operations
// that act on them.

pub mod backup;
pub mod copier;
pub mod fat;
pub mod gpt;
pub mod label;
pub mod mbr;
pub mod ops;
pub mod probe;
pub mod resizefs;
pub mod table;
pub mod tools;
pub mod types;

pub use gpt::GptLabel;
pub use label::{detect_label, Label, LabelCaps, LabelKind};
pub use mbr::MsdosLabel;
pub use ops::{Clipboard, EraseLevel, MountedDecision};
pub use probe::{FsInfo, FsOpFlags, FsProbe, SignatureProbe};
pub use resizefs::{FilesystemResizer, ResizerRegistry};
pub use table::{PartitionTable, Slice};
pub use types::{ChsAddr, ChsRange, CreateKind, RawSlice, SliceKind};
