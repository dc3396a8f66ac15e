//! Sync orchestrator.
//!
//! `perform_sync` runs one pass:
//!
//! 1. Claim the pass through `SyncStatusState::begin_sync`; a concurrent
//!    caller gets `SyncOutcome::AlreadyRunning` and nothing is pushed twice
//! 2. Push queued local mutations in order. A failed mutation stays queued and
//!    counted; mutations for other entities are still submitted
//! 3. Pull remote changes since the stored checkpoint and reconcile them
//!    against open edit sessions. Entities under edit with a differing remote
//!    value are deferred instead of overwritten
//! 4. Finish as `Idle` when the pull completed, `Error` otherwise

use crate::config::SyncConfig;
use crate::deferral::{DeferralTracker, Observation, RemoteChange};
use crate::diff::{has_field_changes, FieldLabels};
use crate::entity::{Entity, EntityKey, Record};
use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteAuthority;
use crate::session::EditSessionRegistry;
use crate::status::SyncStatusState;
use crate::store::LocalStore;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// What started a sync pass
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    /// Explicit user request, e.g. a pull-to-refresh gesture
    Manual,
    /// The periodic timer
    Periodic,
    /// The application returned to the foreground
    AppResume,
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncTrigger::Manual => "manual",
            SyncTrigger::Periodic => "periodic",
            SyncTrigger::AppResume => "app-resume",
        };
        f.write_str(name)
    }
}

/// A mutation the remote authority did not accept in this pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PushFailure {
    pub mutation: Uuid,
    pub key: EntityKey,
    pub error: SyncError,
}

/// Summary of a completed pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Mutations confirmed by the remote authority
    pub pushed: usize,
    /// Mutations that failed and stay queued
    pub push_failures: Vec<PushFailure>,
    /// Mutations not submitted because an earlier one for the same entity failed
    pub held_back: usize,
    /// Remote values written to local storage
    pub applied: usize,
    /// Remote deletions applied to local storage
    pub removed: usize,
    /// Entities whose remote change was withheld for an open edit session
    pub deferred: Vec<EntityKey>,
    /// Remote changes matching a value the user already dismissed
    pub suppressed: usize,
}

impl SyncReport {
    /// Check if every queued mutation was pushed
    pub fn fully_pushed(&self) -> bool {
        self.push_failures.is_empty() && self.held_back == 0
    }
}

/// Outcome of a `perform_sync` call
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// This call ran the pass
    Completed(SyncReport),
    /// Another pass was in flight; nothing was done
    AlreadyRunning,
}

impl SyncOutcome {
    /// Get the report if this call ran the pass
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::Completed(report) => Some(report),
            SyncOutcome::AlreadyRunning => None,
        }
    }
}

/// Re-renders views from the local store after a successful pass.
///
/// Called synchronously at the end of the pass; implementations should hand
/// the work off rather than block.
pub trait ViewRefresher: Send + Sync {
    fn refresh(&self, report: &SyncReport);
}

/// Moves the status to `Error` if a pass is dropped before finishing.
struct PassGuard<'a> {
    status: &'a SyncStatusState,
    finished: bool,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.status.fail_sync("sync pass cancelled");
        }
    }
}

/// Runs sync passes between a local store and a remote authority.
pub struct SyncOrchestrator<S, R> {
    store: Arc<S>,
    remote: Arc<R>,
    status: Arc<SyncStatusState>,
    sessions: Arc<EditSessionRegistry>,
    deferrals: Arc<DeferralTracker>,
    config: Arc<SyncConfig>,
    refresher: Option<Arc<dyn ViewRefresher>>,
}

impl<S: LocalStore, R: RemoteAuthority> SyncOrchestrator<S, R> {
    /// Create an orchestrator over shared state handles
    pub fn new(
        store: Arc<S>,
        remote: Arc<R>,
        status: Arc<SyncStatusState>,
        sessions: Arc<EditSessionRegistry>,
        deferrals: Arc<DeferralTracker>,
        config: Arc<SyncConfig>,
    ) -> Self {
        Self {
            store,
            remote,
            status,
            sessions,
            deferrals,
            config,
            refresher: None,
        }
    }

    /// Set the collaborator notified after successful passes
    pub fn with_refresher(mut self, refresher: Arc<dyn ViewRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// Run one sync pass.
    ///
    /// Returns `AlreadyRunning` without side effects if a pass is in flight.
    /// Pull failures and timeouts leave the status in `Error` and are returned
    /// to the caller, who owns the retry affordance.
    pub async fn perform_sync(&self, trigger: SyncTrigger) -> SyncResult<SyncOutcome> {
        if !self.status.begin_sync() {
            tracing::debug!("Sync pass ({}) skipped, another pass is in flight", trigger);
            return Ok(SyncOutcome::AlreadyRunning);
        }
        let mut guard = PassGuard {
            status: &self.status,
            finished: false,
        };

        tracing::info!("Sync pass started ({})", trigger);
        let timeout = self.config.pass_timeout();
        let result = match tokio::time::timeout(timeout, self.run_pass()).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(timeout)),
        };
        guard.finished = true;

        match result {
            Ok(report) => {
                self.status.complete_sync(true);
                tracing::info!(
                    "Sync pass finished ({}): pushed {}, failed {}, applied {}, removed {}, deferred {}",
                    trigger,
                    report.pushed,
                    report.push_failures.len(),
                    report.applied,
                    report.removed,
                    report.deferred.len()
                );
                if let Some(refresher) = &self.refresher {
                    refresher.refresh(&report);
                }
                Ok(SyncOutcome::Completed(report))
            }
            Err(err) => {
                self.status.fail_sync(err.to_string());
                tracing::error!("Sync pass failed ({}): {}", trigger, err);
                Err(err)
            }
        }
    }

    async fn run_pass(&self) -> SyncResult<SyncReport> {
        let mut report = SyncReport::default();
        self.push_phase(&mut report).await?;
        self.pull_phase(&mut report).await?;
        Ok(report)
    }

    async fn push_phase(&self, report: &mut SyncReport) -> SyncResult<()> {
        let mutations = self.store.pending_mutations().await?;
        // Entities with a failed mutation in this pass; later mutations for
        // them wait so per-entity order holds.
        let mut blocked: HashSet<EntityKey> = HashSet::new();

        for mutation in mutations {
            if blocked.contains(&mutation.key) {
                report.held_back += 1;
                continue;
            }
            match self.remote.submit_mutation(&mutation).await {
                Ok(()) => {
                    self.store.confirm_mutation(mutation.id).await?;
                    self.status.decrement_pending(1);
                    report.pushed += 1;
                }
                Err(err) if err.is_per_mutation() => {
                    tracing::warn!("Push of {} for {} failed: {}", mutation.id, mutation.key, err);
                    blocked.insert(mutation.key.clone());
                    report.push_failures.push(PushFailure {
                        mutation: mutation.id,
                        key: mutation.key,
                        error: err,
                    });
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn pull_phase(&self, report: &mut SyncReport) -> SyncResult<()> {
        let since = self.store.checkpoint().await?;
        let batch = self.remote.fetch_since(since).await?;
        tracing::debug!(
            "Pulled {} changed and {} removed entities since {}",
            batch.entities.len(),
            batch.removed.len(),
            since
        );

        for entity in batch.entities {
            self.reconcile_update(entity, report).await?;
        }
        for key in batch.removed {
            self.reconcile_removal(key, report).await?;
        }

        self.store.set_checkpoint(batch.checkpoint).await?;
        Ok(())
    }

    async fn reconcile_update(&self, remote: Entity, report: &mut SyncReport) -> SyncResult<()> {
        let key = remote.key.clone();
        if self.sessions.is_editing(&key) {
            let local = self
                .store
                .read_entity(&key)
                .await?
                .map(|e| e.data)
                .unwrap_or_default();
            let labels = self.labels_for(&key.entity_type, &remote.data);
            let differs = has_field_changes(&local, &remote.data, &labels);

            // Recheck: the session may have closed while storage was read
            if self.sessions.is_editing(&key)
                && self.observe(&key, RemoteChange::Update(remote.data.clone()), differs, report)
            {
                return Ok(());
            }
        }

        tracing::debug!("Applying remote value for {}", key);
        self.store.write_entity(remote).await?;
        report.applied += 1;
        Ok(())
    }

    async fn reconcile_removal(&self, key: EntityKey, report: &mut SyncReport) -> SyncResult<()> {
        if self.sessions.is_editing(&key) && self.observe(&key, RemoteChange::Removal, true, report) {
            return Ok(());
        }

        tracing::debug!("Applying remote removal of {}", key);
        self.store.remove_entity(&key).await?;
        report.removed += 1;
        Ok(())
    }

    /// Hand the newest remote change for an entity under edit to the tracker.
    /// Returns true when the change must not reach local storage.
    fn observe(&self, key: &EntityKey, change: RemoteChange, differs: bool, report: &mut SyncReport) -> bool {
        let observation = self.deferrals.observe(key, change, differs);
        match observation {
            Observation::Deferred => {
                tracing::warn!("Remote change for {} deferred, entity is being edited", key);
                report.deferred.push(key.clone());
            }
            Observation::Refreshed | Observation::Unchanged => report.deferred.push(key.clone()),
            Observation::Suppressed => {
                tracing::debug!("Remote change for {} was already dismissed", key);
                report.suppressed += 1;
            }
            Observation::Resolved => {
                tracing::debug!("Remote value for {} matches local again, deferral dropped", key);
            }
            Observation::InSync => {}
        }
        observation.withholds()
    }

    fn labels_for(&self, entity_type: &str, remote: &Record) -> FieldLabels {
        self.config
            .labels_for(entity_type)
            .cloned()
            .unwrap_or_else(|| FieldLabels::from_record(remote))
    }
}
