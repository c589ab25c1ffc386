//! Error types for the image cache

use std::fmt;

#[derive(Debug)]
pub enum CacheError {
    /// The request descriptor could not be normalized into a cache key.
    InvalidKeyDerivation(String),
    /// An entry does not fit under the disk ceiling even with every other entry reclaimed.
    DiskQuotaExceeded { required: u64, limit: u64 },
    Io(Box<std::io::Error>),
    Codec(Box<image::ImageError>),
    /// The background disk worker is gone (the runtime shut down).
    WorkerStopped,
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::InvalidKeyDerivation(msg) => {
                write!(f, "Invalid cache key derivation: {}", msg)
            }
            CacheError::DiskQuotaExceeded { required, limit } => write!(
                f,
                "Disk quota exceeded: entry needs {} bytes, limit is {} bytes",
                required, limit
            ),
            CacheError::Io(err) => write!(f, "Disk IO error: {}", err),
            CacheError::Codec(err) => write!(f, "Image codec error: {}", err),
            CacheError::WorkerStopped => write!(f, "Disk worker stopped"),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::Io(err) => Some(err.as_ref()),
            CacheError::Codec(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(Box::new(err))
    }
}

impl From<image::ImageError> for CacheError {
    fn from(err: image::ImageError) -> Self {
        CacheError::Codec(Box::new(err))
    }
}

impl From<tokio::task::JoinError> for CacheError {
    fn from(err: tokio::task::JoinError) -> Self {
        CacheError::Io(Box::new(std::io::Error::other(err)))
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
