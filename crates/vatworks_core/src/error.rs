//! Core error types for vatworks.

use std::fmt;

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Invalid encoding
    InvalidEncoding {
        /// What could not be decoded
        reason: String,
    },

    /// Hash mismatch
    HashMismatch {
        /// Expected hash
        expected: String,
        /// Hash actually computed
        actual: String,
    },

    /// Invalid hash format
    InvalidHash {
        /// Why the hash was rejected
        reason: String,
    },

    /// Invalid ID format
    InvalidId {
        /// Why the id was rejected
        reason: String,
    },

    /// Unknown wire message kind
    UnknownKind {
        /// Message family (delivery, syscall, ...)
        family: String,
        /// Tag found on the wire
        kind: String,
    },

    /// Not found
    NotFound {
        /// Kind of entity
        kind: String,
        /// Entity id
        id: String,
    },

    /// Already exists
    AlreadyExists {
        /// Kind of entity
        kind: String,
        /// Entity id
        id: String,
    },

    /// I/O failure in a storage collaborator
    Io {
        /// Underlying error message
        reason: String,
    },
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEncoding { reason } => write!(f, "Invalid encoding: {}", reason),
            Self::HashMismatch { expected, actual } => {
                write!(f, "Hash mismatch: expected {}, got {}", expected, actual)
            }
            Self::InvalidHash { reason } => write!(f, "Invalid hash: {}", reason),
            Self::InvalidId { reason } => write!(f, "Invalid ID: {}", reason),
            Self::UnknownKind { family, kind } => write!(f, "Unknown {} kind: {}", family, kind),
            Self::NotFound { kind, id } => write!(f, "{} not found: {}", kind, id),
            Self::AlreadyExists { kind, id } => write!(f, "{} already exists: {}", kind, id),
            Self::Io { reason } => write!(f, "IO error: {}", reason),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidEncoding {
            reason: err.to_string(),
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::NotFound {
            kind: "Vat".to_string(),
            id: "v7".to_string(),
        };
        assert_eq!(format!("{}", err), "Vat not found: v7");

        let err = CoreError::UnknownKind {
            family: "syscall".to_string(),
            kind: "teleport".to_string(),
        };
        assert_eq!(err.to_string(), "Unknown syscall kind: teleport");
    }

    #[test]
    fn test_hash_mismatch_error() {
        let err = CoreError::HashMismatch {
            expected: "abc123".to_string(),
            actual: "def456".to_string(),
        };
        let s = format!("{}", err);
        assert!(s.contains("abc123"));
        assert!(s.contains("def456"));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: CoreError = json_err.into();
        assert!(matches!(err, CoreError::InvalidEncoding { .. }));
    }
}
