//! Entity addressing shared by all sync components

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies one entity within a named collection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    /// Remote collection the entity belongs to
    pub collection: String,
    /// Application-assigned entity id
    pub entity_id: String,
}

impl EntityKey {
    /// Create a key from a collection name and entity id
    pub fn new(collection: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.entity_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_with_same_parts_are_equal() {
        let a = EntityKey::new("tasks", "t1");
        let b = EntityKey::new("tasks".to_string(), "t1".to_string());
        assert_eq!(a, b);
    }

    #[test]
    fn display_joins_collection_and_id() {
        let key = EntityKey::new("habits", "h42");
        assert_eq!(key.to_string(), "habits/h42");
    }
}
