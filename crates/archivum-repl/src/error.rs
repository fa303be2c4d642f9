//! Error types for the reconstruction subsystem.

use archivum_transport::Retryable;
use thiserror::Error;

/// Errors that can occur while reconstructing secondary stores.
#[derive(Debug, Error)]
pub enum ReconError {
    /// Store, index or object storage unreachable or timing out.
    #[error("transient I/O failure: {msg}")]
    TransientIo {
        /// Error message describing the failure.
        msg: String,
    },

    /// A backup object referenced by the log is not (yet) visible.
    #[error("backup object not found: {container}/{file_name}")]
    NotFound {
        /// Container (tenant/category stream) holding the object.
        container: String,
        /// Object file name.
        file_name: String,
    },

    /// Backup content could not be decoded.
    #[error("malformed payload in {file_name}: {msg}")]
    MalformedPayload {
        /// Object file name.
        file_name: String,
        /// What was wrong with it.
        msg: String,
    },

    /// Category name not registered for reconstruction.
    #[error("unknown category: {name}")]
    UnknownCategory {
        /// The category name as requested.
        name: String,
    },

    /// The offset cursor could not be persisted.
    #[error("offset persistence failed for tenant {tenant} category {category}: {msg}")]
    OffsetPersistence {
        /// Tenant of the cursor.
        tenant: u32,
        /// Category of the cursor.
        category: String,
        /// Error message.
        msg: String,
    },

    /// Optimistic guard on a primary-store document did not match.
    #[error("concurrent modification of document {id}")]
    Conflict {
        /// The document id.
        id: String,
    },

    /// The request item is not acceptable.
    #[error("invalid request: {msg}")]
    InvalidRequest {
        /// Error message.
        msg: String,
    },

    /// Configuration is inconsistent.
    #[error("configuration error: {msg}")]
    Config {
        /// Error message.
        msg: String,
    },

    /// Graph snapshot production failed.
    #[error("graph store error: {msg}")]
    GraphStore {
        /// Error message.
        msg: String,
    },

    /// JSON encoding/decoding error.
    #[error("serialization error")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl ReconError {
    /// Shorthand for a transient I/O error.
    pub fn transient(msg: impl Into<String>) -> Self {
        ReconError::TransientIo { msg: msg.into() }
    }

    /// Shorthand for a malformed payload error.
    pub fn malformed(file_name: impl Into<String>, msg: impl Into<String>) -> Self {
        ReconError::MalformedPayload {
            file_name: file_name.into(),
            msg: msg.into(),
        }
    }

    /// True for a missing backup object.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ReconError::NotFound { .. })
    }
}

impl Retryable for ReconError {
    fn is_retryable(&self) -> bool {
        match self {
            ReconError::TransientIo { .. } => true,
            // Object storage visibility is eventual.
            ReconError::NotFound { .. } => true,
            ReconError::Conflict { .. } => true,
            ReconError::OffsetPersistence { .. } => true,
            ReconError::Io(e) => e.is_retryable(),
            ReconError::MalformedPayload { .. } => false,
            ReconError::UnknownCategory { .. } => false,
            ReconError::InvalidRequest { .. } => false,
            ReconError::Config { .. } => false,
            ReconError::GraphStore { .. } => false,
            ReconError::Serialization(_) => false,
        }
    }
}

/// Result alias for the reconstruction subsystem.
pub type Result<T> = std::result::Result<T, ReconError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors_are_retryable() {
        assert!(ReconError::transient("index down").is_retryable());
        assert!(ReconError::Conflict { id: "a".into() }.is_retryable());
        assert!(ReconError::NotFound {
            container: "0/UNIT".into(),
            file_name: "a.json".into()
        }
        .is_retryable());
        assert!(ReconError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "t")).is_retryable());
    }

    #[test]
    fn test_business_errors_are_not_retryable() {
        assert!(!ReconError::malformed("a.json", "not an object").is_retryable());
        assert!(!ReconError::UnknownCategory { name: "FOO".into() }.is_retryable());
        assert!(!ReconError::InvalidRequest { msg: "x".into() }.is_retryable());
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(!ReconError::from(json_err).is_retryable());
        assert!(!ReconError::Io(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "p")).is_retryable());
    }

    #[test]
    fn test_display() {
        let err = ReconError::OffsetPersistence {
            tenant: 3,
            category: "UNIT".into(),
            msg: "disk full".into(),
        };
        assert_eq!(
            err.to_string(),
            "offset persistence failed for tenant 3 category UNIT: disk full"
        );
        assert!(ReconError::NotFound {
            container: "0/UNIT".into(),
            file_name: "x.json".into()
        }
        .is_not_found());
    }
}
