//! Deferred remote changes.
//!
//! When a sync pass pulls a remote value for an entity that is open in an edit
//! form, the value is withheld and a [`DeferralRecord`] is kept here until the
//! user resolves it. Views learn about records through a broadcast channel
//! instead of polling.

use crate::entity::{EntityKey, Record};
use crate::lock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 64;

/// What the remote authority did to an entity
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "change", content = "data", rename_all = "snake_case")]
pub enum RemoteChange {
    /// The entity now has these fields
    Update(Record),
    /// The entity was deleted on another device
    Removal,
}

impl RemoteChange {
    /// Get the remote fields, `None` for a removal
    pub fn record(&self) -> Option<&Record> {
        match self {
            RemoteChange::Update(record) => Some(record),
            RemoteChange::Removal => None,
        }
    }

    /// Check if this is a removal
    pub fn is_removal(&self) -> bool {
        matches!(self, RemoteChange::Removal)
    }
}

/// A remote change withheld from an entity under edit
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeferralRecord {
    pub key: EntityKey,
    pub detected_at: DateTime<Utc>,
    /// Newest remote change observed while the record was live
    pub remote: RemoteChange,
}

/// Change notification published by the tracker
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeferralEvent {
    /// A new record was created
    Deferred(EntityKey),
    /// A live record received a newer remote value
    Refreshed(EntityKey),
    /// A record was removed
    Cleared(EntityKey),
}

impl DeferralEvent {
    /// Get the entity the event is about
    pub fn key(&self) -> &EntityKey {
        match self {
            DeferralEvent::Deferred(key)
            | DeferralEvent::Refreshed(key)
            | DeferralEvent::Cleared(key) => key,
        }
    }
}

/// What the tracker did with a remote change observed for an entity under edit
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Observation {
    /// A new record was created
    Deferred,
    /// The live record now holds the newer remote change
    Refreshed,
    /// The live record already held this change
    Unchanged,
    /// The change is one the user dismissed; nothing is held for it
    Suppressed,
    /// The remote matches local again; the live record was dropped
    Resolved,
    /// The remote matches local and nothing was held
    InSync,
}

impl Observation {
    /// Whether the remote change must stay out of local storage
    pub fn withholds(&self) -> bool {
        !matches!(self, Observation::Resolved | Observation::InSync)
    }
}

#[derive(Default)]
struct TrackerState {
    records: HashMap<EntityKey, DeferralRecord>,
    /// Remote changes the user dismissed during the current edit session
    acknowledged: HashMap<EntityKey, RemoteChange>,
}

impl TrackerState {
    fn hold(&mut self, key: &EntityKey, remote: RemoteChange) -> Observation {
        match self.records.get_mut(key) {
            Some(record) if record.remote == remote => Observation::Unchanged,
            Some(record) => {
                record.remote = remote;
                Observation::Refreshed
            }
            None => {
                self.records.insert(
                    key.clone(),
                    DeferralRecord {
                        key: key.clone(),
                        detected_at: Utc::now(),
                        remote,
                    },
                );
                Observation::Deferred
            }
        }
    }
}

/// Map of entities with a remote change pending application.
pub struct DeferralTracker {
    state: Mutex<TrackerState>,
    events: broadcast::Sender<DeferralEvent>,
}

impl DeferralTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(TrackerState::default()),
            events,
        }
    }

    /// Subscribe to deferral events
    pub fn subscribe(&self) -> broadcast::Receiver<DeferralEvent> {
        self.events.subscribe()
    }

    /// Record a withheld remote change.
    ///
    /// Returns true when a new record was created. A repeated remote change
    /// for a live record keeps the original detection time and only refreshes
    /// the held value.
    pub fn mark_deferred(&self, key: EntityKey, remote: RemoteChange) -> bool {
        let observation = {
            let mut state = lock(&self.state);
            state.hold(&key, remote)
        };
        self.publish_observation(&key, observation);
        observation == Observation::Deferred
    }

    /// Reconcile the newest remote change for an entity under edit.
    ///
    /// `differs` tells whether the change differs from the stored local value
    /// in a watched field. Record, acknowledgement and change are reconciled
    /// in one step so the tracker never holds a value older than the newest
    /// one pulled:
    ///
    /// - no difference: any live record and acknowledgement are dropped
    /// - the acknowledged change: any live record is dropped, nothing is held
    /// - anything else: the record is created or refreshed and a stale
    ///   acknowledgement is dropped
    pub fn observe(&self, key: &EntityKey, remote: RemoteChange, differs: bool) -> Observation {
        let (observation, dropped) = {
            let mut state = lock(&self.state);
            if !differs {
                state.acknowledged.remove(key);
                match state.records.remove(key) {
                    Some(_) => (Observation::Resolved, true),
                    None => (Observation::InSync, false),
                }
            } else if state.acknowledged.get(key) == Some(&remote) {
                let dropped = state.records.remove(key).is_some();
                (Observation::Suppressed, dropped)
            } else {
                state.acknowledged.remove(key);
                (state.hold(key, remote), false)
            }
        };
        if dropped {
            self.publish(DeferralEvent::Cleared(key.clone()));
        } else {
            self.publish_observation(key, observation);
        }
        observation
    }

    /// Check if the entity has a withheld remote change
    pub fn has_deferred_changes(&self, key: &EntityKey) -> bool {
        lock(&self.state).records.contains_key(key)
    }

    /// Get a copy of the record for an entity
    pub fn deferred(&self, key: &EntityKey) -> Option<DeferralRecord> {
        lock(&self.state).records.get(key).cloned()
    }

    /// Get all entities with a live record
    pub fn deferred_keys(&self) -> Vec<EntityKey> {
        let mut keys: Vec<_> = lock(&self.state).records.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Get the number of live records
    pub fn len(&self) -> usize {
        lock(&self.state).records.len()
    }

    /// Check if no records are live
    pub fn is_empty(&self) -> bool {
        lock(&self.state).records.is_empty()
    }

    /// Remove the record for an entity, returning it
    pub fn clear_deferred_changes(&self, key: &EntityKey) -> Option<DeferralRecord> {
        let removed = lock(&self.state).records.remove(key);
        if removed.is_some() {
            self.publish(DeferralEvent::Cleared(key.clone()));
        }
        removed
    }

    /// Remember a remote change the user chose to dismiss
    pub fn acknowledge(&self, key: EntityKey, remote: RemoteChange) {
        lock(&self.state).acknowledged.insert(key, remote);
    }

    /// Check if this exact remote change was already dismissed
    pub fn is_acknowledged(&self, key: &EntityKey, remote: &RemoteChange) -> bool {
        lock(&self.state)
            .acknowledged
            .get(key)
            .is_some_and(|ack| ack == remote)
    }

    /// Drop everything held for an entity whose edit session closed.
    ///
    /// Returns the newest withheld remote change, preferring a live record
    /// over an acknowledged one.
    pub fn release(&self, key: &EntityKey) -> Option<RemoteChange> {
        let (record, acknowledged) = {
            let mut state = lock(&self.state);
            (state.records.remove(key), state.acknowledged.remove(key))
        };
        if record.is_some() {
            self.publish(DeferralEvent::Cleared(key.clone()));
        }
        record.map(|r| r.remote).or(acknowledged)
    }

    fn publish_observation(&self, key: &EntityKey, observation: Observation) {
        let event = match observation {
            Observation::Deferred => DeferralEvent::Deferred(key.clone()),
            Observation::Refreshed => DeferralEvent::Refreshed(key.clone()),
            _ => return,
        };
        self.publish(event);
    }

    fn publish(&self, event: DeferralEvent) {
        // No receivers is not an error
        let _ = self.events.send(event);
    }
}

impl Default for DeferralTracker {
    fn default() -> Self {
        Self::new()
    }
}
