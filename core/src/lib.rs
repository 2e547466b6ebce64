pub mod config;
pub mod device;
pub mod error;
pub mod progress;
pub mod test_utils;

pub use config::Config;
pub use device::{BlockDevice, Disk, DiskGeometry};
pub use error::CarveError;
pub use progress::Progress;
