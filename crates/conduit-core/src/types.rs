//! Core types shared by the pool and broker crates.
//!
//! A connection request is described by who is asking ([`Principal`]) and
//! with which driver-specific parameters ([`RequestCriteria`]). Both take part
//! in sub-pool routing and in connection matching, so they are hashable and
//! compared structurally.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// The security identity a connection is requested for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Principal {
    name: String,
    #[serde(default)]
    credential: Option<String>,
}

impl Principal {
    /// Creates a principal without credentials.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            credential: None,
        }
    }

    /// Attaches a credential (e.g. a password) to the principal.
    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn credential(&self) -> Option<&str> {
        self.credential.as_deref()
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // credentials are never printed
        f.write_str(&self.name)
    }
}

/// Driver-specific connection request parameters.
///
/// An empty criteria set is the default request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestCriteria {
    #[serde(default)]
    properties: BTreeMap<String, String>,
}

impl RequestCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style property setter.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }
}

impl fmt::Display for RequestCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (k, v)) in self.properties.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", k, v)?;
        }
        f.write_str("}")
    }
}

/// Process-unique numeric identifier.
///
/// Used for listeners, managers and caches, which are compared by identity
/// rather than by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(u64);

impl ObjectId {
    /// Allocates the next identifier.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_principal_display_hides_credential() {
        let p = Principal::new("scott").with_credential("tiger");
        assert_eq!(p.to_string(), "scott");
        assert_eq!(p.credential(), Some("tiger"));
    }

    #[test]
    fn test_criteria_equality_is_structural() {
        let a = RequestCriteria::new().with("schema", "orders").with("ro", "true");
        let b = RequestCriteria::new().with("ro", "true").with("schema", "orders");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "{ro=true, schema=orders}");
        assert!(RequestCriteria::default().is_empty());
    }

    #[test]
    fn test_object_ids_are_unique() {
        let a = ObjectId::next();
        let b = ObjectId::next();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }
}
