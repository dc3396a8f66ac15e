//! Entity identity, records and pending mutations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Field map of an entity as stored locally and remotely.
pub type Record = Map<String, Value>;

/// Identity of a replicated entity: `(entity_id, entity_type)`.
///
/// Every registry, tracker and store in the crate is keyed by this pair, never
/// by a session or form instance.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_id: String,
    pub entity_type: String,
}

impl EntityKey {
    /// Create a new entity key
    pub fn new(entity_id: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            entity_type: entity_type.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

/// A user record (task, goal, project, category) in the replica.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub key: EntityKey,
    pub data: Record,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// Create an entity stamped with the current time
    pub fn new(key: EntityKey, data: Record) -> Self {
        Self {
            key,
            data,
            updated_at: Utc::now(),
        }
    }

    /// Get a field value
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }
}

/// What a pending mutation does to its entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MutationKind {
    /// Create or replace the entity with these fields
    Upsert { data: Record },
    /// Remove the entity
    Delete,
}

/// A local write not yet confirmed by the remote authority.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    pub id: Uuid,
    pub key: EntityKey,
    pub kind: MutationKind,
    pub created_at: DateTime<Utc>,
}

impl PendingMutation {
    /// Create an upsert mutation
    pub fn upsert(key: EntityKey, data: Record) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            kind: MutationKind::Upsert { data },
            created_at: Utc::now(),
        }
    }

    /// Create a delete mutation
    pub fn delete(key: EntityKey) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            kind: MutationKind::Delete,
            created_at: Utc::now(),
        }
    }
}
