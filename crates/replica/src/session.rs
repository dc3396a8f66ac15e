//! Edit session tracking.
//!
//! Forms register an edit session when they mount for an existing entity and
//! end it when they unmount or submit. The orchestrator consults the registry
//! during reconciliation so it never overwrites an entity that is open for
//! editing.

use crate::entity::EntityKey;
use crate::lock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

/// How a form persists its edits
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FormType {
    /// Changes are saved by an explicit submit
    ManualSave,
    /// Changes are saved as the user types
    AutoSave,
}

/// An open edit form for one entity
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditSession {
    pub key: EntityKey,
    pub form_type: FormType,
    pub opened_at: DateTime<Utc>,
    /// Fields the user has changed but not saved
    pub dirty_fields: BTreeSet<String>,
}

impl EditSession {
    /// Create a new session opened now
    pub fn new(key: EntityKey, form_type: FormType) -> Self {
        Self {
            key,
            form_type,
            opened_at: Utc::now(),
            dirty_fields: BTreeSet::new(),
        }
    }

    /// Check if any field has unsaved changes
    pub fn is_dirty(&self) -> bool {
        !self.dirty_fields.is_empty()
    }
}

/// How an edit session ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EditOutcome {
    /// The form saved its values; they will be pushed
    Submitted,
    /// The form closed without saving
    Discarded,
}

/// Registry of open edit sessions, keyed by entity identity.
#[derive(Default)]
pub struct EditSessionRegistry {
    sessions: Mutex<HashMap<EntityKey, EditSession>>,
}

impl EditSessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an open session.
    ///
    /// Idempotent per key: a second registration for the same entity replaces
    /// the form type and open time but keeps the dirty fields, since both
    /// forms alias the same deferral key.
    pub fn begin_edit(&self, key: EntityKey, form_type: FormType) {
        let mut sessions = lock(&self.sessions);
        match sessions.get_mut(&key) {
            Some(session) => {
                session.form_type = form_type;
                session.opened_at = Utc::now();
            }
            None => {
                tracing::debug!("Edit session opened for {}", key);
                sessions.insert(key.clone(), EditSession::new(key, form_type));
            }
        }
    }

    /// Remove the session. No-op when none is open.
    pub(crate) fn end_edit(&self, key: &EntityKey) -> Option<EditSession> {
        let removed = lock(&self.sessions).remove(key);
        if removed.is_some() {
            tracing::debug!("Edit session closed for {}", key);
        }
        removed
    }

    /// Check whether an edit session is open for the entity
    pub fn is_editing(&self, key: &EntityKey) -> bool {
        lock(&self.sessions).contains_key(key)
    }

    /// Record that the user changed a field.
    ///
    /// Returns false if no session is open for the entity.
    pub fn mark_field_dirty(&self, key: &EntityKey, field: impl Into<String>) -> bool {
        match lock(&self.sessions).get_mut(key) {
            Some(session) => {
                session.dirty_fields.insert(field.into());
                true
            }
            None => false,
        }
    }

    /// Forget unsaved-field tracking after an auto-save
    pub fn mark_clean(&self, key: &EntityKey) {
        if let Some(session) = lock(&self.sessions).get_mut(key) {
            session.dirty_fields.clear();
        }
    }

    /// Get the dirty fields of an open session
    pub fn dirty_fields(&self, key: &EntityKey) -> BTreeSet<String> {
        lock(&self.sessions)
            .get(key)
            .map(|s| s.dirty_fields.clone())
            .unwrap_or_default()
    }

    /// Get a copy of an open session
    pub fn session(&self, key: &EntityKey) -> Option<EditSession> {
        lock(&self.sessions).get(key).cloned()
    }

    /// Get all open sessions
    pub fn open_sessions(&self) -> Vec<EditSession> {
        lock(&self.sessions).values().cloned().collect()
    }

    /// Get the number of open sessions
    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    /// Check if no sessions are open
    pub fn is_empty(&self) -> bool {
        lock(&self.sessions).is_empty()
    }
}
