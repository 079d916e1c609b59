//! Error types for Arbor
//!
//! This module defines the common error types used throughout the store.

use thiserror::Error;

/// Common result type for Arbor operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Arbor
#[derive(Debug, Error)]
pub enum Error {
    // Storage errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("corrupt data in {file} at offset {offset}: {reason}")]
    Corrupt {
        file: String,
        offset: u64,
        reason: String,
    },

    #[error("unexpected end of data")]
    UnexpectedEof,

    #[error("overlay segment is frozen: {0}")]
    Frozen(String),

    // Manifest errors
    #[error("manifest error: {0}")]
    Manifest(String),

    // Caller errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a corruption error for `file` at `offset`
    pub fn corrupt(file: impl Into<String>, offset: u64, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            file: file.into(),
            offset,
            reason: reason.into(),
        }
    }

    /// Create a manifest error
    pub fn manifest(msg: impl Into<String>) -> Self {
        Self::Manifest(msg.into())
    }

    /// True when the data simply ran out, as opposed to being malformed
    #[must_use]
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::UnexpectedEof)
    }

    /// True for errors that mean the bytes on disk cannot be trusted
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupt { .. } | Self::UnexpectedEof)
    }

    /// Attach a file name and offset to a bare decoding error.
    ///
    /// Errors that already carry a location are returned unchanged.
    #[must_use]
    pub fn at(self, file: &str, offset: u64) -> Self {
        match self {
            Self::UnexpectedEof => Self::corrupt(file, offset, "truncated data"),
            Self::Serialization(reason) => Self::corrupt(file, offset, reason),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_eof() {
        assert!(Error::UnexpectedEof.is_eof());
        assert!(!Error::storage("boom").is_eof());
    }

    #[test]
    fn test_error_at_adds_location() {
        let err = Error::UnexpectedEof.at("base-00000001.idx", 42);
        match err {
            Error::Corrupt { file, offset, .. } => {
                assert_eq!(file, "base-00000001.idx");
                assert_eq!(offset, 42);
            }
            other => panic!("unexpected error: {other}"),
        }

        // Already-located errors pass through
        let err = Error::invalid_argument("x").at("f", 1);
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_error_corruption() {
        assert!(Error::corrupt("f", 0, "bad").is_corruption());
        assert!(!Error::Frozen("overlay-1".into()).is_corruption());
    }
}
