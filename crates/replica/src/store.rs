//! Local storage collaborator.
//!
//! This module defines the `LocalStore` trait the orchestrator uses to read
//! and write the on-device replica and its queue of pending mutations, plus
//! `MemoryStore`, an in-memory implementation that can snapshot itself to a
//! JSON file.

use crate::entity::{Entity, EntityKey, PendingMutation};
use crate::error::{SyncError, SyncResult};
use crate::lock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

/// Position in the remote change feed up to which the replica is current
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Checkpoint(pub u64);

impl Checkpoint {
    /// Create a checkpoint at the given position
    pub fn new(position: u64) -> Self {
        Self(position)
    }

    /// Checkpoint before any remote change
    pub fn initial() -> Self {
        Self(0)
    }

    /// Get the position
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Trait for local replica storage backends.
///
/// Methods take `&self`; implementations use interior mutability and must be
/// safe to share between the orchestrator and UI handlers.
#[trait_variant::make(Send)]
pub trait LocalStore: Send + Sync {
    /// List queued mutations in the order they were made
    async fn pending_mutations(&self) -> SyncResult<Vec<PendingMutation>>;

    /// Append a mutation to the queue
    async fn enqueue_mutation(&self, mutation: PendingMutation) -> SyncResult<()>;

    /// Remove a mutation the remote authority accepted
    async fn confirm_mutation(&self, id: Uuid) -> SyncResult<()>;

    /// Read an entity
    async fn read_entity(&self, key: &EntityKey) -> SyncResult<Option<Entity>>;

    /// Create or replace an entity
    async fn write_entity(&self, entity: Entity) -> SyncResult<()>;

    /// Remove an entity. No-op if absent.
    async fn remove_entity(&self, key: &EntityKey) -> SyncResult<()>;

    /// Get the last pulled position
    async fn checkpoint(&self) -> SyncResult<Checkpoint>;

    /// Record the last pulled position
    async fn set_checkpoint(&self, checkpoint: Checkpoint) -> SyncResult<()>;
}

/// Serializable contents of a `MemoryStore`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub entities: Vec<Entity>,
    pub queue: Vec<PendingMutation>,
    pub checkpoint: Checkpoint,
}

#[derive(Default)]
struct StoreState {
    entities: HashMap<EntityKey, Entity>,
    queue: Vec<PendingMutation>,
    checkpoint: Checkpoint,
}

/// In-memory implementation of `LocalStore`.
///
/// Intended for tests, demos and as a write-through cache in front of a real
/// database. `set_failing(true)` makes every call return `StorageFailure`.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    failing: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding the given entities
    pub fn with_entities(entities: impl IntoIterator<Item = Entity>) -> Self {
        let store = Self::new();
        {
            let mut state = lock(&store.state);
            for entity in entities {
                state.entities.insert(entity.key.clone(), entity);
            }
        }
        store
    }

    /// Make every subsequent call fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> SyncResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SyncError::StorageFailure("store unavailable".to_string()));
        }
        Ok(())
    }

    /// Get an entity without going through the async trait
    pub fn get(&self, key: &EntityKey) -> Option<Entity> {
        lock(&self.state).entities.get(key).cloned()
    }

    /// Get the number of stored entities
    pub fn entity_count(&self) -> usize {
        lock(&self.state).entities.len()
    }

    /// Get the number of queued mutations
    pub fn queue_len(&self) -> usize {
        lock(&self.state).queue.len()
    }

    /// Get the IDs of queued mutations in order
    pub fn queued_ids(&self) -> Vec<Uuid> {
        lock(&self.state).queue.iter().map(|m| m.id).collect()
    }

    /// Get a serializable copy of the store
    pub fn snapshot(&self) -> StoreSnapshot {
        let state = lock(&self.state);
        let mut entities: Vec<_> = state.entities.values().cloned().collect();
        entities.sort_by(|a, b| a.key.cmp(&b.key));
        StoreSnapshot {
            entities,
            queue: state.queue.clone(),
            checkpoint: state.checkpoint,
        }
    }

    /// Replace the store contents
    pub fn restore(&self, snapshot: StoreSnapshot) {
        let mut state = lock(&self.state);
        state.entities = snapshot
            .entities
            .into_iter()
            .map(|e| (e.key.clone(), e))
            .collect();
        state.queue = snapshot.queue;
        state.checkpoint = snapshot.checkpoint;
    }

    /// Save the store to a JSON file
    pub async fn save_to(&self, path: impl AsRef<Path>) -> SyncResult<()> {
        let json = serde_json::to_string_pretty(&self.snapshot())?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    /// Load the store from a JSON file. A missing file leaves it empty.
    pub async fn load_from(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        let store = Self::new();
        if !path.exists() {
            return Ok(store);
        }
        let json = tokio::fs::read_to_string(path).await?;
        let snapshot: StoreSnapshot = serde_json::from_str(&json)?;
        store.restore(snapshot);
        Ok(store)
    }
}

impl LocalStore for MemoryStore {
    async fn pending_mutations(&self) -> SyncResult<Vec<PendingMutation>> {
        self.check()?;
        Ok(lock(&self.state).queue.clone())
    }

    async fn enqueue_mutation(&self, mutation: PendingMutation) -> SyncResult<()> {
        self.check()?;
        lock(&self.state).queue.push(mutation);
        Ok(())
    }

    async fn confirm_mutation(&self, id: Uuid) -> SyncResult<()> {
        self.check()?;
        lock(&self.state).queue.retain(|m| m.id != id);
        Ok(())
    }

    async fn read_entity(&self, key: &EntityKey) -> SyncResult<Option<Entity>> {
        self.check()?;
        Ok(self.get(key))
    }

    async fn write_entity(&self, entity: Entity) -> SyncResult<()> {
        self.check()?;
        lock(&self.state).entities.insert(entity.key.clone(), entity);
        Ok(())
    }

    async fn remove_entity(&self, key: &EntityKey) -> SyncResult<()> {
        self.check()?;
        lock(&self.state).entities.remove(key);
        Ok(())
    }

    async fn checkpoint(&self) -> SyncResult<Checkpoint> {
        self.check()?;
        Ok(lock(&self.state).checkpoint)
    }

    async fn set_checkpoint(&self, checkpoint: Checkpoint) -> SyncResult<()> {
        self.check()?;
        lock(&self.state).checkpoint = checkpoint;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Record;
    use serde_json::json;

    fn task(id: &str, name: &str) -> Entity {
        let mut data = Record::new();
        data.insert("name".to_string(), json!(name));
        Entity::new(EntityKey::new(id, "tasks"), data)
    }

    #[tokio::test]
    async fn test_entity_read_write_remove() {
        let store = MemoryStore::new();
        let key = EntityKey::new("t1", "tasks");
        assert!(store.read_entity(&key).await.unwrap().is_none());

        store.write_entity(task("t1", "a")).await.unwrap();
        let read = store.read_entity(&key).await.unwrap().unwrap();
        assert_eq!(read.field("name"), Some(&json!("a")));

        store.remove_entity(&key).await.unwrap();
        store.remove_entity(&key).await.unwrap();
        assert_eq!(store.entity_count(), 0);
    }

    #[tokio::test]
    async fn test_queue_order_and_confirm() {
        let store = MemoryStore::new();
        let m1 = PendingMutation::delete(EntityKey::new("t1", "tasks"));
        let m2 = PendingMutation::delete(EntityKey::new("t2", "tasks"));
        store.enqueue_mutation(m1.clone()).await.unwrap();
        store.enqueue_mutation(m2.clone()).await.unwrap();

        assert_eq!(store.queued_ids(), vec![m1.id, m2.id]);
        store.confirm_mutation(m1.id).await.unwrap();
        assert_eq!(store.queued_ids(), vec![m2.id]);
    }

    #[tokio::test]
    async fn test_checkpoint() {
        let store = MemoryStore::new();
        assert_eq!(store.checkpoint().await.unwrap(), Checkpoint::initial());
        store.set_checkpoint(Checkpoint::new(7)).await.unwrap();
        assert_eq!(store.checkpoint().await.unwrap().value(), 7);
        assert_eq!(Checkpoint::new(7).to_string(), "@7");
    }

    #[tokio::test]
    async fn test_failing_store() {
        let store = MemoryStore::with_entities([task("t1", "a")]);
        store.set_failing(true);
        let err = store.read_entity(&EntityKey::new("t1", "tasks")).await.unwrap_err();
        assert!(matches!(err, SyncError::StorageFailure(_)));

        store.set_failing(false);
        assert!(store.read_entity(&EntityKey::new("t1", "tasks")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_save_and_load_snapshot() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("replica.json");

        {
            let store = MemoryStore::with_entities([task("t1", "a"), task("t2", "b")]);
            store
                .enqueue_mutation(PendingMutation::delete(EntityKey::new("t2", "tasks")))
                .await
                .unwrap();
            store.set_checkpoint(Checkpoint::new(3)).await.unwrap();
            store.save_to(&path).await.unwrap();
        }

        let store = MemoryStore::load_from(&path).await.unwrap();
        assert_eq!(store.entity_count(), 2);
        assert_eq!(store.queue_len(), 1);
        assert_eq!(store.checkpoint().await.unwrap(), Checkpoint::new(3));
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::load_from(temp_dir.path().join("none.json")).await.unwrap();
        assert_eq!(store.entity_count(), 0);
    }
}
