//! Identifiers for cluster members and supervised children.
//!
//! Member ids are UUIDs so they order the same way on every member. Child ids are
//! caller-chosen names, unique within a cluster.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Member identifier - identifies one participating node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberId(Uuid);

impl MemberId {
    /// Create a new random MemberId
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from UUID bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Create from name (for named members)
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        // Name-based UUID (v5) so every process derives the same id for a name
        Self(Uuid::new_v5(&Uuid::NAMESPACE_DNS, name.as_bytes()))
    }

    /// Get as UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Get as bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Short form used in log lines
    #[must_use]
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for MemberId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MemberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "member_{}", self.0)
    }
}

/// Child identifier - the cluster-unique name of a supervised worker
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChildId(String);

impl ChildId {
    /// Create a child id from any string-like value
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Parse a child id, rejecting empty or whitespace-padded names
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidId` if the name is empty or has surrounding whitespace
    pub fn parse(name: &str) -> CoreResult<Self> {
        if name.is_empty() {
            return Err(CoreError::InvalidId {
                reason: "child id is empty".to_string(),
            });
        }
        if name.trim() != name {
            return Err(CoreError::InvalidId {
                reason: format!("child id {:?} has surrounding whitespace", name),
            });
        }
        Ok(Self(name.to_string()))
    }

    /// Get as string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChildId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChildId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ChildId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_id_creation() {
        assert_ne!(MemberId::new(), MemberId::new());
    }

    #[test]
    fn test_member_id_from_bytes() {
        let bytes = [1u8; 16];
        let id = MemberId::from_bytes(bytes);
        assert_eq!(id.as_bytes(), &bytes);
    }

    #[test]
    fn test_member_id_display() {
        let id = MemberId::new();
        assert!(id.to_string().starts_with("member_"));
        assert_eq!(id.short().len(), 8);
    }

    #[test]
    fn test_member_id_from_name() {
        let id1 = MemberId::from_name("a@host");
        let id2 = MemberId::from_name("a@host");
        assert_eq!(id1, id2);
        assert_ne!(id1, MemberId::from_name("b@host"));
    }

    #[test]
    fn test_child_id_parse() {
        assert_eq!(ChildId::parse("worker-1").unwrap().as_str(), "worker-1");
        assert!(ChildId::parse("").is_err());
        assert!(ChildId::parse(" padded").is_err());
    }

    #[test]
    fn test_child_id_ord() {
        let a = ChildId::from("a");
        let b = ChildId::from("b".to_string());
        assert!(a < b);
        assert_eq!(a.to_string(), "a");
    }
}
