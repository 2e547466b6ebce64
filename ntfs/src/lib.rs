// Non-destructive NTFS volume resizing. The engine consumes the NTFS
// metadata library through the contract in `meta` and never touches raw MFT
// byte layout itself.

pub mod alloc;
pub mod bitmap;
pub mod hook;
pub mod meta;
pub mod mock;
pub mod resize;
pub mod runlist;

pub use bitmap::Bitmap;
pub use meta::{AttrFlags, AttrType, Attribute, Lcn, MftRecord, NtfsVolume, RunEntry, VolumeFlags};
pub use resize::{resize, resize_constraints, ResizeRequest};
