use thiserror::Error;

#[derive(Debug, Error)]
pub enum CarveError {
    #[error("Disk not found: {0}")]
    DiskNotFound(String),

    #[error("Invalid parameter: {0}")]
    Parameter(String),

    #[error("Invalid layout: {0}")]
    InvalidLayout(String),

    #[error("Corrupt on-disk data: {0}")]
    Corrupt(String),

    #[error("Unsupported configuration: {0}")]
    Unsupported(String),

    #[error("Not enough free space: {0}")]
    NoSpace(String),

    #[error("Operation cancelled by user")]
    Cancelled,

    #[error("External tool missing: {0}")]
    ExternalToolMissing(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}
