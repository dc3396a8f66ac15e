//! Sync status state machine.
//!
//! One `SyncStatusState` exists per service. It tracks the phase of the
//! current pass (`Idle`, `Syncing`, `Error`) and the number of local mutations
//! not yet confirmed by the remote authority, and notifies observers on every
//! change.
//!
//! # Observers
//!
//! - `subscribe` registers a callback and returns a [`Subscription`]
//! - `watch` hands out a `tokio::sync::watch` receiver for async consumers

use crate::lock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;

/// Phase of the sync state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    /// No pass running, last pass succeeded (or none ran yet)
    Idle,
    /// A pass is in flight
    Syncing,
    /// The last pass failed
    Error,
}

impl Default for SyncPhase {
    fn default() -> Self {
        SyncPhase::Idle
    }
}

/// Snapshot of the sync status for display
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    /// Local mutations not yet confirmed pushed
    pub pending_count: usize,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl SyncStatus {
    /// Check if a pass is in flight
    pub fn is_syncing(&self) -> bool {
        self.phase == SyncPhase::Syncing
    }

    /// Get a short status string
    pub fn short_status(&self) -> &'static str {
        match self.phase {
            SyncPhase::Idle if self.pending_count > 0 => "Pending",
            SyncPhase::Idle => "Synced",
            SyncPhase::Syncing => "Syncing",
            SyncPhase::Error => "Sync failed",
        }
    }

    /// Whether a retry affordance should be offered
    pub fn should_offer_retry(&self) -> bool {
        self.phase == SyncPhase::Error
    }
}

type Listener = Arc<dyn Fn(&SyncStatus) + Send + Sync>;

struct Inner {
    status: SyncStatus,
    listeners: Vec<(u64, Listener)>,
    next_listener_id: u64,
    torn_down: bool,
}

/// Process-wide sync status, owned by the sync service.
pub struct SyncStatusState {
    inner: Arc<Mutex<Inner>>,
    watch_tx: watch::Sender<SyncStatus>,
}

impl SyncStatusState {
    /// Create a new state in the `Idle` phase with no pending mutations
    pub fn new() -> Self {
        let (watch_tx, _) = watch::channel(SyncStatus::default());
        Self {
            inner: Arc::new(Mutex::new(Inner {
                status: SyncStatus::default(),
                listeners: Vec::new(),
                next_listener_id: 0,
                torn_down: false,
            })),
            watch_tx,
        }
    }

    /// Get the current status
    pub fn snapshot(&self) -> SyncStatus {
        lock(&self.inner).status.clone()
    }

    /// Get the current phase
    pub fn phase(&self) -> SyncPhase {
        lock(&self.inner).status.phase
    }

    /// Get the outstanding mutation count
    pub fn pending_count(&self) -> usize {
        lock(&self.inner).status.pending_count
    }

    /// Register a listener invoked on every phase or pending-count change.
    ///
    /// After `teardown` this returns an inert subscription and the listener is
    /// never called.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncStatus) + Send + Sync + 'static,
    {
        let mut inner = lock(&self.inner);
        if inner.torn_down {
            return Subscription::inert();
        }
        let id = inner.next_listener_id;
        inner.next_listener_id += 1;
        inner.listeners.push((id, Arc::new(listener)));
        Subscription {
            state: Arc::downgrade(&self.inner),
            id: Some(id),
        }
    }

    /// Get a watch receiver that always holds the latest status
    pub fn watch(&self) -> watch::Receiver<SyncStatus> {
        self.watch_tx.subscribe()
    }

    /// Transition `Idle | Error -> Syncing`.
    ///
    /// Check and set happen under one lock. Returns false, changing nothing,
    /// when a pass is already in flight.
    pub fn begin_sync(&self) -> bool {
        self.update(|status| {
            if status.phase == SyncPhase::Syncing {
                return false;
            }
            status.phase = SyncPhase::Syncing;
            true
        })
    }

    /// Transition `Syncing -> Idle` on success or `Syncing -> Error` on failure.
    ///
    /// Ignored when no pass is in flight. Never touches `pending_count`.
    pub fn complete_sync(&self, success: bool) -> bool {
        if success {
            self.finish(None)
        } else {
            self.finish(Some("Sync failed".to_string()))
        }
    }

    /// Transition `Syncing -> Error`, recording the reason
    pub fn fail_sync(&self, reason: impl Into<String>) -> bool {
        self.finish(Some(reason.into()))
    }

    fn finish(&self, error: Option<String>) -> bool {
        self.update(|status| {
            if status.phase != SyncPhase::Syncing {
                return false;
            }
            match error {
                None => {
                    status.phase = SyncPhase::Idle;
                    status.last_synced_at = Some(Utc::now());
                    status.last_error = None;
                }
                Some(reason) => {
                    status.phase = SyncPhase::Error;
                    status.last_error = Some(reason);
                }
            }
            true
        })
    }

    /// Count one more local mutation awaiting push
    pub fn increment_pending(&self) {
        self.update(|status| {
            status.pending_count += 1;
            true
        });
    }

    /// Count `n` confirmed pushes. Floors at zero.
    pub fn decrement_pending(&self, n: usize) {
        self.update(|status| {
            let next = status.pending_count.saturating_sub(n);
            let changed = next != status.pending_count;
            status.pending_count = next;
            changed
        });
    }

    /// Seed the counter from the persisted mutation queue
    pub fn set_pending(&self, n: usize) {
        self.update(|status| {
            let changed = status.pending_count != n;
            status.pending_count = n;
            changed
        });
    }

    /// Drop every listener; later subscriptions are no-ops
    pub fn teardown(&self) {
        let mut inner = lock(&self.inner);
        inner.torn_down = true;
        inner.listeners.clear();
    }

    /// Check whether `teardown` has run
    pub fn is_torn_down(&self) -> bool {
        lock(&self.inner).torn_down
    }

    /// Apply a mutation as one step and notify observers if it changed anything.
    ///
    /// Callback listeners run after the lock is released so they may read the
    /// state.
    fn update(&self, apply: impl FnOnce(&mut SyncStatus) -> bool) -> bool {
        let (snapshot, listeners) = {
            let mut inner = lock(&self.inner);
            if !apply(&mut inner.status) {
                return false;
            }
            let listeners: Vec<Listener> =
                inner.listeners.iter().map(|(_, l)| Arc::clone(l)).collect();
            // Published under the lock so watchers see changes in order
            self.watch_tx.send_replace(inner.status.clone());
            (inner.status.clone(), listeners)
        };

        for listener in listeners {
            listener(&snapshot);
        }
        true
    }
}

impl Default for SyncStatusState {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by [`SyncStatusState::subscribe`].
///
/// Dropping the handle keeps the listener attached; call `unsubscribe` to
/// detach it.
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    state: Weak<Mutex<Inner>>,
    id: Option<u64>,
}

impl Subscription {
    fn inert() -> Self {
        Self {
            state: Weak::new(),
            id: None,
        }
    }

    /// Whether this subscription ever registered a listener
    pub fn is_active(&self) -> bool {
        self.id.is_some() && self.state.strong_count() > 0
    }

    /// Detach the listener. Safe to call after teardown.
    pub fn unsubscribe(mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        if let Some(state) = self.state.upgrade() {
            lock(&state).listeners.retain(|(lid, _)| *lid != id);
        }
    }
}
