//! Sync service facade.
//!
//! `SyncService` owns the status state, the edit-session registry, the
//! deferral tracker and the orchestrator for one client process. Hosts create
//! one instance at startup and share it as `Arc<SyncService<_, _>>`; edit
//! forms, status indicators and the scheduler all go through it.

use crate::config::SyncConfig;
use crate::deferral::{DeferralTracker, RemoteChange};
use crate::diff::FieldLabels;
use crate::entity::{Entity, EntityKey, PendingMutation, Record};
use crate::error::SyncResult;
use crate::orchestrator::{SyncOrchestrator, SyncOutcome, SyncTrigger, ViewRefresher};
use crate::remote::RemoteAuthority;
use crate::resolution::{PendingConflict, Resolution, ResolutionForm};
use crate::session::{EditOutcome, EditSession, EditSessionRegistry, FormType};
use crate::status::{SyncStatus, SyncStatusState};
use crate::store::LocalStore;
use chrono::Utc;
use std::sync::Arc;

/// Process-wide entry point to the sync core.
pub struct SyncService<S, R> {
    config: Arc<SyncConfig>,
    store: Arc<S>,
    status: Arc<SyncStatusState>,
    sessions: Arc<EditSessionRegistry>,
    deferrals: Arc<DeferralTracker>,
    orchestrator: SyncOrchestrator<S, R>,
}

impl<S: LocalStore, R: RemoteAuthority> SyncService<S, R> {
    /// Create the service.
    ///
    /// The pending count is seeded from the store's queue so mutations left
    /// over from a previous run are reported and pushed.
    pub async fn new(config: SyncConfig, store: Arc<S>, remote: Arc<R>) -> SyncResult<Arc<Self>> {
        Self::build(config, store, remote, None).await
    }

    /// Create the service with a view refresher notified after each
    /// successful pass
    pub async fn with_refresher(
        config: SyncConfig,
        store: Arc<S>,
        remote: Arc<R>,
        refresher: Arc<dyn ViewRefresher>,
    ) -> SyncResult<Arc<Self>> {
        Self::build(config, store, remote, Some(refresher)).await
    }

    async fn build(
        config: SyncConfig,
        store: Arc<S>,
        remote: Arc<R>,
        refresher: Option<Arc<dyn ViewRefresher>>,
    ) -> SyncResult<Arc<Self>> {
        config.validate()?;
        let config = Arc::new(config);
        let status = Arc::new(SyncStatusState::new());
        let sessions = Arc::new(EditSessionRegistry::new());
        let deferrals = Arc::new(DeferralTracker::new());

        let queued = store.pending_mutations().await?.len();
        status.set_pending(queued);

        let mut orchestrator = SyncOrchestrator::new(
            Arc::clone(&store),
            remote,
            Arc::clone(&status),
            Arc::clone(&sessions),
            Arc::clone(&deferrals),
            Arc::clone(&config),
        );
        if let Some(refresher) = refresher {
            orchestrator = orchestrator.with_refresher(refresher);
        }

        tracing::info!("Sync service started with {} queued mutations", queued);
        Ok(Arc::new(Self {
            config,
            store,
            status,
            sessions,
            deferrals,
            orchestrator,
        }))
    }

    // ========== Sync ==========

    /// Run one sync pass. See [`SyncOrchestrator::perform_sync`].
    pub async fn perform_sync(&self, trigger: SyncTrigger) -> SyncResult<SyncOutcome> {
        self.orchestrator.perform_sync(trigger).await
    }

    /// Sync after the application returned to the foreground.
    ///
    /// Returns `None` without syncing when the last successful pass is more
    /// recent than the configured minimum interval.
    pub async fn on_app_resume(&self) -> SyncResult<Option<SyncOutcome>> {
        let min_interval = self.config.resume_min_interval();
        if let Some(last) = self.status.snapshot().last_synced_at {
            let recent = (Utc::now() - last)
                .to_std()
                .is_ok_and(|elapsed| elapsed < min_interval);
            if recent {
                tracing::debug!("Skipping resume sync, last pass at {}", last);
                return Ok(None);
            }
        }
        self.perform_sync(SyncTrigger::AppResume).await.map(Some)
    }

    /// Queue a local write for the next push.
    ///
    /// An open form for the entity has nothing unsaved left once its values
    /// are queued, so its dirty fields are reset.
    pub async fn queue_local_mutation(&self, mutation: PendingMutation) -> SyncResult<()> {
        tracing::debug!("Queued {} for {}", mutation.id, mutation.key);
        let key = mutation.key.clone();
        self.store.enqueue_mutation(mutation).await?;
        self.status.increment_pending();
        self.sessions.mark_clean(&key);
        Ok(())
    }

    // ========== Edit sessions ==========

    /// Register an edit form for an existing entity
    pub fn begin_edit(&self, key: EntityKey, form_type: FormType) {
        self.sessions.begin_edit(key, form_type);
    }

    /// Record that the user changed a field in an open form
    pub fn mark_field_dirty(&self, key: &EntityKey, field: impl Into<String>) -> bool {
        self.sessions.mark_field_dirty(key, field)
    }

    /// Check if an edit form is open for the entity
    pub fn is_editing(&self, key: &EntityKey) -> bool {
        self.sessions.is_editing(key)
    }

    /// Close an edit form.
    ///
    /// A remote change still withheld for the entity is dropped when the form
    /// was submitted, since the local save is queued and will be pushed. When
    /// the form was discarded the withheld change is written to storage; the
    /// pull checkpoint has already moved past it, so no later pass would.
    pub async fn end_edit(&self, key: &EntityKey, outcome: EditOutcome) -> SyncResult<Option<EditSession>> {
        let session = self.sessions.end_edit(key);
        let Some(change) = self.deferrals.release(key) else {
            return Ok(session);
        };

        match outcome {
            EditOutcome::Submitted => {
                tracing::debug!("Dropped withheld remote change for {}, local save wins", key);
            }
            EditOutcome::Discarded => {
                tracing::debug!("Applying withheld remote change for {}", key);
                self.apply_change(key, change).await?;
            }
        }
        Ok(session)
    }

    // ========== Conflict resolution ==========

    /// Build the conflict for an entity under edit, diffed against the form's
    /// current values
    pub fn pending_conflict(&self, key: &EntityKey, local: &Record) -> Option<PendingConflict> {
        let record = self.deferrals.deferred(key)?;
        let labels = match self.config.labels_for(&key.entity_type) {
            Some(labels) => labels.clone(),
            None => record
                .remote
                .record()
                .map(FieldLabels::from_record)
                .unwrap_or_default(),
        };
        PendingConflict::load(Arc::clone(&self.deferrals), key, local, &labels)
    }

    /// Resolve a conflict by taking the remote value into the form and the
    /// local store
    pub async fn take_remote<F: ResolutionForm + ?Sized>(
        &self,
        conflict: PendingConflict,
        form: &mut F,
    ) -> SyncResult<Resolution> {
        let key = conflict.key().clone();
        let resolution = conflict.take_remote(form);
        if let Resolution::TookRemote(change) = &resolution {
            self.apply_change(&key, change.clone()).await?;
        }
        Ok(resolution)
    }

    /// Resolve a conflict by keeping the form's local values
    pub fn dismiss<F: ResolutionForm + ?Sized>(&self, conflict: PendingConflict, form: &mut F) -> Resolution {
        conflict.dismiss(form)
    }

    async fn apply_change(&self, key: &EntityKey, change: RemoteChange) -> SyncResult<()> {
        match change {
            RemoteChange::Update(data) => self.store.write_entity(Entity::new(key.clone(), data)).await,
            RemoteChange::Removal => self.store.remove_entity(key).await,
        }
    }

    // ========== Accessors ==========

    /// Get the current status
    pub fn status(&self) -> SyncStatus {
        self.status.snapshot()
    }

    /// Get the status state, for subscribing
    pub fn status_state(&self) -> &Arc<SyncStatusState> {
        &self.status
    }

    pub fn deferrals(&self) -> &Arc<DeferralTracker> {
        &self.deferrals
    }

    pub fn sessions(&self) -> &Arc<EditSessionRegistry> {
        &self.sessions
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Detach all status listeners. Later subscriptions are inert.
    pub fn teardown(&self) {
        self.status.teardown();
        tracing::info!("Sync service torn down");
    }

    /// Close every open edit form as discarded, then tear down.
    ///
    /// Withheld remote changes are written to storage on the way out; the
    /// pull checkpoint is already past them.
    pub async fn shutdown(&self) -> SyncResult<()> {
        let mut open = self.sessions.open_sessions();
        open.sort_by(|a, b| a.key.cmp(&b.key));
        for session in open {
            self.end_edit(&session.key, EditOutcome::Discarded).await?;
        }
        self.teardown();
        Ok(())
    }
}
