//! Error types for the storage engine.

use thiserror::Error;

use crate::types::Xid;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in engine operations.
///
/// Reads of absent, invisible or invalidated data are not errors; they surface as `None`
/// or `false` from the operation that performed them.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No page with enough free space could be found or allocated in time.
    #[error("database is busy, retry the operation")]
    Busy,

    #[error("data is too large: {size} bytes (max {max})")]
    DataTooLarge { size: usize, max: usize },

    /// Every handle slot of a bounded cache is in use.
    #[error("cache is full")]
    CacheFull,

    /// The transaction hit a write conflict or lost a deadlock check and may only abort.
    #[error("could not serialize access for transaction {xid} due to concurrent update")]
    SerializationFailure { xid: Xid },

    /// A file failed its integrity check at open time.
    #[error("corrupt file: {0}")]
    CorruptFile(String),

    /// Stored bytes do not decode into the structure expected at that location.
    #[error("corrupt data: {0}")]
    Corrupt(String),

    #[error("memory budget too small: {memory} bytes (min {minimum})")]
    MemoryTooSmall { memory: u64, minimum: u64 },

    #[error("unknown transaction: {0}")]
    UnknownTransaction(Xid),

    #[error("invalid key: {0}")]
    InvalidKey(u64),
}

impl Error {
    /// Transient failures; the whole operation may be retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Busy | Error::CacheFull)
    }

    /// Failures after which the engine must not be used any further.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::CorruptFile(_) | Error::Corrupt(_)
        )
    }
}

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::Busy.is_retryable());
        assert!(Error::CacheFull.is_retryable());
        assert!(!Error::SerializationFailure { xid: 3 }.is_retryable());

        let io = Error::from(std::io::Error::new(std::io::ErrorKind::Other, "disk gone"));
        assert!(io.is_fatal());
        assert!(Error::CorruptFile("bad xid file".to_string()).is_fatal());
        assert!(!Error::DataTooLarge { size: 10, max: 5 }.is_fatal());
    }

    #[test]
    fn test_error_messages() {
        let err = Error::DataTooLarge {
            size: 9000,
            max: 8189,
        };
        assert_eq!(err.to_string(), "data is too large: 9000 bytes (max 8189)");
        assert_eq!(
            Error::SerializationFailure { xid: 7 }.to_string(),
            "could not serialize access for transaction 7 due to concurrent update"
        );
    }
}
