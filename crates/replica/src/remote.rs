//! Remote authority collaborator.
//!
//! The orchestrator only needs two calls from the network layer: submit one
//! mutation, and fetch everything that changed since a checkpoint. The wire
//! format behind them is not this crate's concern.

use crate::entity::{Entity, EntityKey, MutationKind, PendingMutation, Record};
use crate::error::{SyncError, SyncResult};
use crate::lock;
use crate::store::Checkpoint;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Result of fetching remote changes
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PullBatch {
    /// Entities created or updated since the requested checkpoint
    pub entities: Vec<Entity>,
    /// Entities deleted since the requested checkpoint
    pub removed: Vec<EntityKey>,
    /// Position to request from next time
    pub checkpoint: Checkpoint,
}

impl PullBatch {
    /// Check if the batch carries no changes
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.removed.is_empty()
    }
}

/// Trait for the remote authority.
///
/// Both calls are fallible; a transport timeout should surface as
/// `NetworkUnavailable` rather than hang.
#[trait_variant::make(Send)]
pub trait RemoteAuthority: Send + Sync {
    /// Submit one local mutation. `RemoteRejected` refers to this mutation only.
    async fn submit_mutation(&self, mutation: &PendingMutation) -> SyncResult<()>;

    /// Fetch entities changed after `since`
    async fn fetch_since(&self, since: Checkpoint) -> SyncResult<PullBatch>;
}

#[derive(Clone, Debug)]
struct LoggedChange {
    position: u64,
    key: EntityKey,
    /// `None` for a deletion
    data: Option<Record>,
}

#[derive(Default)]
struct RemoteState {
    entities: HashMap<EntityKey, Record>,
    log: Vec<LoggedChange>,
    rejected: HashSet<EntityKey>,
    unreachable: HashSet<EntityKey>,
}

impl RemoteState {
    fn record(&mut self, key: EntityKey, data: Option<Record>) {
        let position = self.log.len() as u64 + 1;
        match &data {
            Some(record) => {
                self.entities.insert(key.clone(), record.clone());
            }
            None => {
                self.entities.remove(&key);
            }
        }
        self.log.push(LoggedChange {
            position,
            key,
            data,
        });
    }
}

/// In-memory remote authority with a versioned change log.
///
/// Stands in for the server in tests and in the simulator. Failure switches
/// let callers reproduce offline passes, per-mutation rejections and
/// per-entity transport failures.
#[derive(Default)]
pub struct InMemoryRemote {
    state: Mutex<RemoteState>,
    offline: AtomicBool,
    pull_failing: AtomicBool,
    latency: Mutex<Option<Duration>>,
    submit_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
}

impl InMemoryRemote {
    /// Create an empty remote
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a change made by another device
    pub fn apply_remote_change(&self, key: EntityKey, data: Record) {
        lock(&self.state).record(key, Some(data));
    }

    /// Delete an entity from another device
    pub fn remove_remote(&self, key: EntityKey) {
        lock(&self.state).record(key, None);
    }

    /// Get the remote value of an entity
    pub fn get(&self, key: &EntityKey) -> Option<Record> {
        lock(&self.state).entities.get(key).cloned()
    }

    /// Get the latest change position
    pub fn head(&self) -> Checkpoint {
        Checkpoint::new(lock(&self.state).log.len() as u64)
    }

    /// Make every call fail with `NetworkUnavailable`
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make only `fetch_since` fail
    pub fn set_pull_failing(&self, failing: bool) {
        self.pull_failing.store(failing, Ordering::SeqCst);
    }

    /// Reject every mutation for an entity
    pub fn reject_entity(&self, key: EntityKey) {
        lock(&self.state).rejected.insert(key);
    }

    /// Fail submissions for an entity with `NetworkUnavailable`
    pub fn make_unreachable(&self, key: EntityKey) {
        lock(&self.state).unreachable.insert(key);
    }

    /// Clear per-entity failure injections
    pub fn clear_failures(&self) {
        let mut state = lock(&self.state);
        state.rejected.clear();
        state.unreachable.clear();
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        *lock(&self.latency) = latency;
    }

    /// Get the number of `submit_mutation` calls
    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    /// Get the number of `fetch_since` calls
    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    async fn delay(&self) {
        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_online(&self) -> SyncResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SyncError::NetworkUnavailable("remote unreachable".to_string()));
        }
        Ok(())
    }
}

impl RemoteAuthority for InMemoryRemote {
    async fn submit_mutation(&self, mutation: &PendingMutation) -> SyncResult<()> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        self.check_online()?;

        let mut state = lock(&self.state);
        if state.unreachable.contains(&mutation.key) {
            return Err(SyncError::NetworkUnavailable(format!(
                "connection dropped while submitting {}",
                mutation.key
            )));
        }
        if state.rejected.contains(&mutation.key) {
            return Err(SyncError::RemoteRejected {
                mutation: mutation.id,
                reason: format!("{} is read-only", mutation.key),
            });
        }

        match &mutation.kind {
            MutationKind::Upsert { data } => state.record(mutation.key.clone(), Some(data.clone())),
            MutationKind::Delete => state.record(mutation.key.clone(), None),
        }
        Ok(())
    }

    async fn fetch_since(&self, since: Checkpoint) -> SyncResult<PullBatch> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        self.check_online()?;
        if self.pull_failing.load(Ordering::SeqCst) {
            return Err(SyncError::NetworkUnavailable("pull request failed".to_string()));
        }

        let state = lock(&self.state);
        // Latest change per entity wins
        let mut latest: HashMap<&EntityKey, &LoggedChange> = HashMap::new();
        for change in state.log.iter().filter(|c| c.position > since.value()) {
            latest.insert(&change.key, change);
        }

        let mut changes: Vec<_> = latest.into_values().collect();
        changes.sort_by_key(|c| c.position);

        let mut batch = PullBatch {
            checkpoint: Checkpoint::new((state.log.len() as u64).max(since.value())),
            ..Default::default()
        };
        for change in changes {
            match &change.data {
                Some(data) => batch.entities.push(Entity {
                    key: change.key.clone(),
                    data: data.clone(),
                    updated_at: Utc::now(),
                }),
                None => batch.removed.push(change.key.clone()),
            }
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(name: &str) -> Record {
        let mut record = Record::new();
        record.insert("name".to_string(), json!(name));
        record
    }

    fn task(id: &str) -> EntityKey {
        EntityKey::new(id, "tasks")
    }

    #[tokio::test]
    async fn test_fetch_since_returns_latest_per_entity() {
        let remote = InMemoryRemote::new();
        remote.apply_remote_change(task("t1"), data("a"));
        remote.apply_remote_change(task("t1"), data("b"));
        remote.apply_remote_change(task("t2"), data("c"));

        let batch = remote.fetch_since(Checkpoint::initial()).await.unwrap();
        assert_eq!(batch.entities.len(), 2);
        assert_eq!(batch.entities[0].key, task("t1"));
        assert_eq!(batch.entities[0].data, data("b"));
        assert_eq!(batch.checkpoint, Checkpoint::new(3));

        let batch = remote.fetch_since(batch.checkpoint).await.unwrap();
        assert!(batch.is_empty());
        assert_eq!(batch.checkpoint, Checkpoint::new(3));
    }

    #[tokio::test]
    async fn test_deletions_reported() {
        let remote = InMemoryRemote::new();
        remote.apply_remote_change(task("t1"), data("a"));
        remote.remove_remote(task("t1"));

        let batch = remote.fetch_since(Checkpoint::initial()).await.unwrap();
        assert!(batch.entities.is_empty());
        assert_eq!(batch.removed, vec![task("t1")]);
        assert!(remote.get(&task("t1")).is_none());
    }

    #[tokio::test]
    async fn test_submit_applies_and_logs() {
        let remote = InMemoryRemote::new();
        let mutation = PendingMutation::upsert(task("t1"), data("mine"));
        remote.submit_mutation(&mutation).await.unwrap();

        assert_eq!(remote.get(&task("t1")), Some(data("mine")));
        assert_eq!(remote.head(), Checkpoint::new(1));
        assert_eq!(remote.submit_calls(), 1);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let remote = InMemoryRemote::new();
        remote.reject_entity(task("t1"));
        remote.make_unreachable(task("t2"));

        let rejected = PendingMutation::upsert(task("t1"), data("x"));
        let err = remote.submit_mutation(&rejected).await.unwrap_err();
        assert_eq!(
            err,
            SyncError::RemoteRejected {
                mutation: rejected.id,
                reason: "tasks/t1 is read-only".to_string()
            }
        );

        let dropped = PendingMutation::upsert(task("t2"), data("y"));
        assert!(matches!(
            remote.submit_mutation(&dropped).await,
            Err(SyncError::NetworkUnavailable(_))
        ));

        remote.clear_failures();
        assert!(remote.submit_mutation(&dropped).await.is_ok());
    }

    #[tokio::test]
    async fn test_offline_and_pull_failing() {
        let remote = InMemoryRemote::new();
        remote.set_pull_failing(true);
        assert!(remote.fetch_since(Checkpoint::initial()).await.is_err());
        let mutation = PendingMutation::delete(task("t1"));
        assert!(remote.submit_mutation(&mutation).await.is_ok());

        remote.set_pull_failing(false);
        remote.set_offline(true);
        assert!(matches!(
            remote.fetch_since(Checkpoint::initial()).await,
            Err(SyncError::NetworkUnavailable(_))
        ));
        assert_eq!(remote.fetch_calls(), 2);
    }
}
