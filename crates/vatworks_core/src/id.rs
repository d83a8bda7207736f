//! Identifiers for vatworks entities.
//!
//! Vat and bundle ids are opaque strings assigned by the kernel; they are
//! serialized as plain JSON strings so transcript files stay readable.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};

/// Position of a delivery in a vat's transcript
pub type DeliveryNum = u64;

/// Vat identifier - stable for the life of the vat, never reused
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VatId(String);

impl VatId {
    /// Create a vat id from its kernel name (e.g. `v12`)
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Parse a vat id, rejecting empty strings
    ///
    /// # Errors
    ///
    /// Returns error if the id is empty or contains whitespace
    pub fn parse(id: &str) -> CoreResult<Self> {
        if id.is_empty() || id.chars().any(char::is_whitespace) {
            return Err(CoreError::InvalidId {
                reason: format!("bad vat id {:?}", id),
            });
        }
        Ok(Self(id.to_string()))
    }

    /// Get as string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VatId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Bundle identifier - names the source bundle a vat was started from
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BundleId(String);

impl BundleId {
    /// Create a bundle id
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BundleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vat_id_display() {
        let id = VatId::new("v3");
        assert_eq!(id.to_string(), "v3");
        assert_eq!(id.as_str(), "v3");
    }

    #[test]
    fn test_vat_id_parse_rejects_blank() {
        assert!(VatId::parse("").is_err());
        assert!(VatId::parse("v 1").is_err());
        assert_eq!(VatId::parse("v1").unwrap(), VatId::from("v1"));
    }

    #[test]
    fn test_vat_id_serializes_as_string() {
        let json = serde_json::to_string(&VatId::new("v9")).unwrap();
        assert_eq!(json, "\"v9\"");
        let back: VatId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, VatId::new("v9"));
    }
}
