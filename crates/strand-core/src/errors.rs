//! Unified error system for Strand
//!
//! A single error enum shared by every crate in the workspace. Errors are
//! serializable so they survive the cross-store RPC boundary unchanged: the
//! server encodes [`StrandError::code`] and the message, and the client
//! rebuilds the same variant with [`StrandError::from_wire`].

use serde::{Deserialize, Serialize};

/// Unified error type for all Strand operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum StrandError {
    /// Timeline, block, lock, transaction, store or migration is absent
    #[error("Not found: {message}")]
    NotFound {
        /// What was looked up
        message: String,
    },

    /// The resource already exists
    #[error("Already exists: {message}")]
    AlreadyExists {
        /// What collided
        message: String,
    },

    /// A non-expired lease is held by someone else
    #[error("Already locked: {key} is held by {owner}")]
    AlreadyLocked {
        /// Lock key that was requested
        key: String,
        /// Current holder of the lease
        owner: String,
    },

    /// The store has no room left for the write
    #[error("Capacity exceeded on store {store}: used {used}, max {max}")]
    CapacityExceeded {
        /// Store that rejected the write
        store: String,
        /// Slots in use at the time of the write
        used: u64,
        /// Configured maximum
        max: u64,
    },

    /// Operation ran past its deadline
    #[error("Timeout: {operation}")]
    Timeout {
        /// Operation that timed out
        operation: String,
    },

    /// Operation is not supported on this path
    #[error("Unimplemented: {operation}")]
    Unimplemented {
        /// Operation that was requested
        operation: String,
    },

    /// Some targets were updated and some were not
    #[error("Partial failure in {operation}: applied {applied:?}, failed {failed:?}")]
    PartialFailure {
        /// Operation that partially failed
        operation: String,
        /// Targets that were applied
        applied: Vec<String>,
        /// Targets that failed, with their error text
        failed: Vec<String>,
    },

    /// Invalid input or state transition
    #[error("Invalid: {message}")]
    Invalid {
        /// Description of the invalid input
        message: String,
    },

    /// Request conflicts with the current authoritative state
    #[error("Conflict: {message}")]
    Conflict {
        /// Description of the conflict
        message: String,
    },

    /// Storage I/O failed
    #[error("Storage error: {message}")]
    Storage {
        /// Description of the failure
        message: String,
    },

    /// Persisted data failed an integrity check
    #[error("Corruption detected: {message}")]
    Corruption {
        /// Description of the corrupted data
        message: String,
    },

    /// Encoding or decoding failed
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the failure
        message: String,
    },

    /// Network or transport failure
    #[error("Network error: {message}")]
    Network {
        /// Description of the failure
        message: String,
    },

    /// No healthy store can serve the request
    #[error("Unavailable: {message}")]
    Unavailable {
        /// Description of the outage
        message: String,
    },

    /// Operation was cancelled cooperatively
    #[error("Cancelled: {message}")]
    Cancelled {
        /// What was cancelled
        message: String,
    },

    /// Internal system error
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the failure
        message: String,
    },
}

/// Stable error codes used on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// [`StrandError::NotFound`]
    NotFound,
    /// [`StrandError::AlreadyExists`]
    AlreadyExists,
    /// [`StrandError::AlreadyLocked`]
    AlreadyLocked,
    /// [`StrandError::CapacityExceeded`]
    CapacityExceeded,
    /// [`StrandError::Timeout`]
    Timeout,
    /// [`StrandError::Unimplemented`]
    Unimplemented,
    /// [`StrandError::PartialFailure`]
    PartialFailure,
    /// [`StrandError::Invalid`]
    Invalid,
    /// [`StrandError::Conflict`]
    Conflict,
    /// [`StrandError::Storage`]
    Storage,
    /// [`StrandError::Corruption`]
    Corruption,
    /// [`StrandError::Serialization`]
    Serialization,
    /// [`StrandError::Network`]
    Network,
    /// [`StrandError::Unavailable`]
    Unavailable,
    /// [`StrandError::Cancelled`]
    Cancelled,
    /// [`StrandError::Internal`]
    Internal,
}

impl StrandError {
    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create an already exists error
    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::AlreadyExists {
            message: message.into(),
        }
    }

    /// Create an already locked error
    pub fn already_locked(key: impl Into<String>, owner: impl Into<String>) -> Self {
        Self::AlreadyLocked {
            key: key.into(),
            owner: owner.into(),
        }
    }

    /// Create a capacity exceeded error
    pub fn capacity_exceeded(store: impl Into<String>, used: u64, max: u64) -> Self {
        Self::CapacityExceeded {
            store: store.into(),
            used,
            max,
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Create an unimplemented error
    pub fn unimplemented(operation: impl Into<String>) -> Self {
        Self::Unimplemented {
            operation: operation.into(),
        }
    }

    /// Create a partial failure error
    pub fn partial_failure(
        operation: impl Into<String>,
        applied: Vec<String>,
        failed: Vec<String>,
    ) -> Self {
        Self::PartialFailure {
            operation: operation.into(),
            applied,
            failed,
        }
    }

    /// Create an invalid input error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create a corruption error
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create an unavailable error
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Create a cancelled error
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Wire code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::AlreadyExists { .. } => ErrorCode::AlreadyExists,
            Self::AlreadyLocked { .. } => ErrorCode::AlreadyLocked,
            Self::CapacityExceeded { .. } => ErrorCode::CapacityExceeded,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Unimplemented { .. } => ErrorCode::Unimplemented,
            Self::PartialFailure { .. } => ErrorCode::PartialFailure,
            Self::Invalid { .. } => ErrorCode::Invalid,
            Self::Conflict { .. } => ErrorCode::Conflict,
            Self::Storage { .. } => ErrorCode::Storage,
            Self::Corruption { .. } => ErrorCode::Corruption,
            Self::Serialization { .. } => ErrorCode::Serialization,
            Self::Network { .. } => ErrorCode::Network,
            Self::Unavailable { .. } => ErrorCode::Unavailable,
            Self::Cancelled { .. } => ErrorCode::Cancelled,
            Self::Internal { .. } => ErrorCode::Internal,
        }
    }

    /// Rebuild an error from its wire code and optional structured detail.
    ///
    /// Structured variants travel as JSON in `detail`; when it is missing or
    /// unreadable the message is kept and structure is best effort.
    pub fn from_wire(code: ErrorCode, message: String, detail: Option<serde_json::Value>) -> Self {
        if let Some(detail) = detail {
            if let Ok(err) = serde_json::from_value::<StrandError>(detail) {
                if err.code() == code {
                    return err;
                }
            }
        }
        match code {
            ErrorCode::NotFound => Self::not_found(message),
            ErrorCode::AlreadyExists => Self::already_exists(message),
            ErrorCode::AlreadyLocked => Self::already_locked(message, "unknown"),
            ErrorCode::CapacityExceeded => Self::capacity_exceeded(message, 0, 0),
            ErrorCode::Timeout => Self::timeout(message),
            ErrorCode::Unimplemented => Self::unimplemented(message),
            ErrorCode::PartialFailure => Self::partial_failure(message, Vec::new(), Vec::new()),
            ErrorCode::Invalid => Self::invalid(message),
            ErrorCode::Conflict => Self::conflict(message),
            ErrorCode::Storage => Self::storage(message),
            ErrorCode::Corruption => Self::corruption(message),
            ErrorCode::Serialization => Self::serialization(message),
            ErrorCode::Network => Self::network(message),
            ErrorCode::Unavailable => Self::unavailable(message),
            ErrorCode::Cancelled => Self::cancelled(message),
            ErrorCode::Internal => Self::internal(message),
        }
    }

    /// Whether a caller may reasonably retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AlreadyLocked { .. }
                | Self::Timeout { .. }
                | Self::Network { .. }
                | Self::Unavailable { .. }
        )
    }
}

/// Standard Result type for Strand operations
pub type Result<T> = std::result::Result<T, StrandError>;

impl From<std::io::Error> for StrandError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(err.to_string()),
            std::io::ErrorKind::UnexpectedEof => Self::corruption(err.to_string()),
            _ => Self::storage(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StrandError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<bincode::Error> for StrandError {
    fn from(err: bincode::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = StrandError::invalid("test message");
        assert!(matches!(err, StrandError::Invalid { .. }));
        assert_eq!(err.to_string(), "Invalid: test message");
    }

    #[test]
    fn test_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = StrandError::from(io_err);
        assert!(matches!(err, StrandError::NotFound { .. }));
    }

    #[test]
    fn test_structured_error_survives_wire() {
        let err = StrandError::already_locked("timeline:conv:c1", "txn-7");
        let detail = serde_json::to_value(&err).unwrap();
        let rebuilt = StrandError::from_wire(err.code(), err.to_string(), Some(detail));
        assert_eq!(rebuilt, err);
    }

    #[test]
    fn test_wire_fallback_keeps_variant() {
        let rebuilt = StrandError::from_wire(ErrorCode::Timeout, "rpc".into(), None);
        assert!(matches!(rebuilt, StrandError::Timeout { .. }));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(StrandError::already_locked("k", "o").is_retryable());
        assert!(!StrandError::not_found("k").is_retryable());
    }
}
