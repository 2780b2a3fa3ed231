//! Error types for the state stores
//!
//! Every store operation surfaces failures synchronously through
//! [`StoreError`]. Reaching the end of a cursor is not an error; it is
//! reported as `None`.

use thiserror::Error;

/// State store operation errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// Operation attempted on a store that is closed or was never opened
    #[error("store not open: {store}")]
    NotOpen { store: String },

    /// Key or time range with `from > to`
    #[error("invalid range: {reason}")]
    InvalidRange { reason: String },

    /// Write older than the retention floor under the reject policy
    #[error("retention violation in store '{store}': timestamp {timestamp} is older than retention floor {floor}")]
    RetentionViolation {
        store: String,
        timestamp: i64,
        floor: i64,
    },

    /// Invalid or incomplete store configuration
    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    /// Window store ran out of sequence numbers for retained duplicates
    #[error("duplicate sequence exhausted in store '{store}'")]
    SequenceExhausted { store: String },

    /// Cursor used after it was closed
    #[error("cursor already closed")]
    CursorClosed,

    /// Underlying storage engine failure
    #[error("storage error in {backend_type}: {details}")]
    Storage {
        backend_type: String,
        details: String,
    },

    /// Changelog record or configuration (de)serialization failure
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub(crate) fn not_open(store: &str) -> Self {
        StoreError::NotOpen {
            store: store.to_string(),
        }
    }

    pub(crate) fn invalid_range(reason: impl Into<String>) -> Self {
        StoreError::InvalidRange {
            reason: reason.into(),
        }
    }

    pub(crate) fn configuration(reason: impl Into<String>) -> Self {
        StoreError::Configuration {
            reason: reason.into(),
        }
    }
}

/// Result type alias for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Storage {
            backend_type: "sled".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_open_display() {
        let err = StoreError::not_open("counts");
        assert_eq!(err.to_string(), "store not open: counts");
    }

    #[test]
    fn test_retention_violation_display() {
        let err = StoreError::RetentionViolation {
            store: "clicks".to_string(),
            timestamp: 10,
            floor: 100,
        };
        let msg = err.to_string();
        assert!(msg.contains("retention violation"));
        assert!(msg.contains("floor 100"));
    }

    #[test]
    fn test_invalid_range_display() {
        let err = StoreError::invalid_range("from key is after to key");
        assert!(err.to_string().contains("invalid range"));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<u32>("not a number").unwrap_err();
        let err: StoreError = json_err.into();
        assert!(matches!(err, StoreError::Serialization(_)));
    }
}
