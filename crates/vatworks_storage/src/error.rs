//! Storage errors.

use vatworks_core::CoreError;

/// Store error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Snapshot not found
    SnapshotNotFound {
        /// Hash or vat the lookup used
        id: String,
    },
    /// Stored bytes no longer match their hash
    Corrupt {
        /// Hash the snapshot is stored under
        hash: String,
        /// Hash of the bytes actually read
        actual: String,
    },
    /// Vat unknown to the keeper
    UnknownVat {
        /// Vat id
        vat_id: String,
    },
    /// Bundle unknown to the handler
    UnknownBundle {
        /// Bundle id
        bundle_id: String,
    },
    /// IO error
    Io {
        /// Underlying error
        reason: String,
    },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SnapshotNotFound { id } => write!(f, "Snapshot not found: {}", id),
            Self::Corrupt { hash, actual } => {
                write!(f, "Snapshot {} failed verification (content hashes to {})", hash, actual)
            }
            Self::UnknownVat { vat_id } => write!(f, "Unknown vat: {}", vat_id),
            Self::UnknownBundle { bundle_id } => write!(f, "Unknown bundle: {}", bundle_id),
            Self::Io { reason } => write!(f, "IO error: {}", reason),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::SnapshotNotFound { id } => CoreError::NotFound {
                kind: "Snapshot".to_string(),
                id,
            },
            StoreError::UnknownVat { vat_id } => CoreError::NotFound {
                kind: "Vat".to_string(),
                id: vat_id,
            },
            StoreError::UnknownBundle { bundle_id } => CoreError::NotFound {
                kind: "Bundle".to_string(),
                id: bundle_id,
            },
            StoreError::Corrupt { hash, actual } => CoreError::HashMismatch {
                expected: hash,
                actual,
            },
            StoreError::Io { reason } => CoreError::Io { reason },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::SnapshotNotFound {
            id: "abc".to_string(),
        };
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_into_core_error() {
        let err: CoreError = StoreError::UnknownVat {
            vat_id: "v4".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "Vat not found: v4");
    }
}
