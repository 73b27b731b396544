use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checksum mismatch in snapshot {0}")]
    ChecksumMismatch(String),

    #[error("invalid snapshot name: {0}")]
    InvalidName(String),

    #[error("transient snapshot {0} was persisted before being taken")]
    NotTaken(String),
}

pub type Result<T> = std::result::Result<T, SnapshotError>;
