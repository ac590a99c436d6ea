//! Destination and correlation identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Logical address of a transport endpoint (queue name, topic, URL).
///
/// Destinations are the sharing key of the multiplexer: every subscription
/// for an equal destination shares one underlying connection. Cloning is
/// cheap (the name is reference counted).
///
/// # Example
///
/// ```rust
/// use reactive_messaging::Destination;
///
/// let orders = Destination::new("orders.created");
/// assert_eq!(orders.as_str(), "orders.created");
/// assert_eq!(orders, Destination::from("orders.created"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Destination(Arc<str>);

impl Destination {
    /// Create a destination from its name.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// Get the destination name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Destination {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Destination {
    fn from(name: String) -> Self {
        Self(Arc::from(name))
    }
}

impl From<&Destination> for Destination {
    fn from(destination: &Destination) -> Self {
        destination.clone()
    }
}

impl AsRef<str> for Destination {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Tag linking an asynchronous reply to the request that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Arc<str>);

impl CorrelationId {
    /// Generate a fresh random correlation id (UUID v4).
    pub fn generate() -> Self {
        Self::from(uuid::Uuid::new_v4().to_string())
    }

    /// Get the id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        Self(Arc::from(id))
    }
}

impl From<String> for CorrelationId {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_destination_equality_and_hash() {
        let mut set = HashSet::new();
        set.insert(Destination::new("queue.a"));
        set.insert(Destination::from("queue.a".to_string()));
        set.insert(Destination::from("queue.b"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_destination_display() {
        assert_eq!(Destination::new("topic/x").to_string(), "topic/x");
    }

    #[test]
    fn test_destination_serialization() {
        let json = serde_json::to_string(&Destination::new("orders")).unwrap();
        assert_eq!(json, "\"orders\"");
        let back: Destination = serde_json::from_str(&json).unwrap();
        assert_eq!(back.as_str(), "orders");
    }

    #[test]
    fn test_correlation_id_serialization() {
        let id = CorrelationId::from("req-42");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"req-42\"");
        let back: CorrelationId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_correlation_ids_are_unique() {
        let ids: HashSet<_> = (0..1000).map(|_| CorrelationId::generate()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
