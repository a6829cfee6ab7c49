//! Error types for the ledger

use crate::chain::ChainBreak;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or malformed required field, rejected before any I/O
    #[error("Validation error: {0}")]
    Validation(String),

    /// Computed hash collides with a stored hash
    #[error("Duplicate hash {hash} for stream {stream_key}")]
    DuplicateHash {
        /// Stream the colliding record was destined for
        stream_key: String,
        /// The colliding hash
        hash: String,
    },

    /// Chain verification found discontinuities (never raised by insertion)
    #[error("Chain broken for stream {stream_key}: {} break(s)", breaks.len())]
    ChainBreak {
        /// Stream that failed verification
        stream_key: String,
        /// Every break found, in sequence order
        breaks: Vec<ChainBreak>,
    },

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Lock or task contention on a stream's tail
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// JSON export error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the caller may retry the whole operation unchanged.
    ///
    /// Storage and concurrency failures leave no partial state behind.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::Concurrency(_) | Error::Io(_))
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Storage("disk full".to_string()).is_retryable());
        assert!(Error::Concurrency("lock timeout".to_string()).is_retryable());
        assert!(!Error::Validation("missing endpoint".to_string()).is_retryable());
        assert!(!Error::DuplicateHash {
            stream_key: "github".to_string(),
            hash: "ab".repeat(32),
        }
        .is_retryable());
    }

    #[test]
    fn test_chain_break_display_counts_breaks() {
        let err = Error::ChainBreak {
            stream_key: "stripe".to_string(),
            breaks: vec![],
        };
        assert_eq!(err.to_string(), "Chain broken for stream stripe: 0 break(s)");
    }
}
