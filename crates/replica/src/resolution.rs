//! Conflict resolution contract.
//!
//! A form that shows a deferred remote change implements [`ResolutionForm`]
//! and resolves the change through a [`PendingConflict`]. Both resolutions
//! clear the tracker record before any form callback runs, so a sync pass that
//! lands between the click and the callback cannot see a stale record.

use crate::deferral::{DeferralTracker, RemoteChange};
use crate::diff::{compute_field_diffs, FieldDiff, FieldLabels};
use crate::entity::{EntityKey, Record};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// What an edit form implements to take part in conflict resolution.
pub trait ResolutionForm {
    /// Current in-memory values of the form
    fn local_data(&self) -> Record;

    /// Replace the in-memory values. `None` means the entity was deleted
    /// remotely.
    fn replace_with_remote(&mut self, remote: Option<&Record>);

    /// Called after the form took the remote value
    fn on_load_remote(&mut self) {}

    /// Called after the user kept their local edits
    fn on_dismiss(&mut self) {}
}

/// How a conflict ended
#[derive(Clone, Debug, PartialEq)]
pub enum Resolution {
    /// The form now shows the remote value; the store should receive it too
    TookRemote(RemoteChange),
    /// Local edits kept; the remote change is acknowledged for this session
    Dismissed,
    /// The record was already gone when the user acted; nothing was done
    Stale,
}

/// A deferred remote change with its field diff against a form snapshot.
pub struct PendingConflict {
    key: EntityKey,
    detected_at: DateTime<Utc>,
    remote: RemoteChange,
    diffs: Vec<FieldDiff>,
    deferrals: Arc<DeferralTracker>,
}

impl PendingConflict {
    /// Build the conflict for an entity, if it has a deferred change.
    ///
    /// `local` is the form's current snapshot; the diff is recomputed on every
    /// call, never cached across passes.
    pub fn load(
        deferrals: Arc<DeferralTracker>,
        key: &EntityKey,
        local: &Record,
        labels: &FieldLabels,
    ) -> Option<Self> {
        let record = deferrals.deferred(key)?;
        let diffs = match &record.remote {
            RemoteChange::Update(remote) => compute_field_diffs(local, remote, labels),
            RemoteChange::Removal => Vec::new(),
        };
        Some(Self {
            key: record.key,
            detected_at: record.detected_at,
            remote: record.remote,
            diffs,
            deferrals,
        })
    }

    /// Get the entity
    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    /// Get when the remote change was first seen
    pub fn detected_at(&self) -> DateTime<Utc> {
        self.detected_at
    }

    /// Get the differing fields in label order
    pub fn diffs(&self) -> &[FieldDiff] {
        &self.diffs
    }

    /// Get the withheld remote change
    pub fn remote(&self) -> &RemoteChange {
        &self.remote
    }

    /// Check if the remote side deleted the entity
    pub fn is_removal(&self) -> bool {
        self.remote.is_removal()
    }

    /// Replace the form's values with the remote change.
    ///
    /// Uses the newest held remote value, which may be newer than the one
    /// this conflict was built from.
    pub fn take_remote<F: ResolutionForm + ?Sized>(self, form: &mut F) -> Resolution {
        let Some(record) = self.deferrals.clear_deferred_changes(&self.key) else {
            tracing::debug!("Conflict for {} already resolved", self.key);
            return Resolution::Stale;
        };
        form.replace_with_remote(record.remote.record());
        form.on_load_remote();
        tracing::info!("Took remote value for {}", self.key);
        Resolution::TookRemote(record.remote)
    }

    /// Keep the form's local edits.
    ///
    /// The dismissed remote change is acknowledged so an identical value is
    /// not deferred again while the session stays open; a different, newer
    /// remote value defers again on the next pass.
    pub fn dismiss<F: ResolutionForm + ?Sized>(self, form: &mut F) -> Resolution {
        let Some(record) = self.deferrals.clear_deferred_changes(&self.key) else {
            tracing::debug!("Conflict for {} already resolved", self.key);
            return Resolution::Stale;
        };
        self.deferrals.acknowledge(self.key.clone(), record.remote);
        form.on_dismiss();
        tracing::info!("Kept local edits for {}", self.key);
        Resolution::Dismissed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct TestForm {
        values: Record,
        loaded: bool,
        dismissed: bool,
        deleted: bool,
    }

    impl ResolutionForm for TestForm {
        fn local_data(&self) -> Record {
            self.values.clone()
        }

        fn replace_with_remote(&mut self, remote: Option<&Record>) {
            match remote {
                Some(remote) => self.values = remote.clone(),
                None => self.deleted = true,
            }
        }

        fn on_load_remote(&mut self) {
            self.loaded = true;
        }

        fn on_dismiss(&mut self) {
            self.dismissed = true;
        }
    }

    fn task(id: &str) -> EntityKey {
        EntityKey::new(id, "tasks")
    }

    fn named(name: &str) -> Record {
        let mut data = Record::new();
        data.insert("name".to_string(), json!(name));
        data
    }

    fn labels() -> FieldLabels {
        FieldLabels::new().with("name", "Name")
    }

    #[test]
    fn test_load_without_record() {
        let tracker = Arc::new(DeferralTracker::new());
        assert!(PendingConflict::load(tracker, &task("t1"), &named("x"), &labels()).is_none());
    }

    #[test]
    fn test_take_remote() {
        let tracker = Arc::new(DeferralTracker::new());
        tracker.mark_deferred(task("t1"), RemoteChange::Update(named("remote")));
        let mut form = TestForm {
            values: named("local"),
            ..Default::default()
        };

        let conflict =
            PendingConflict::load(Arc::clone(&tracker), &task("t1"), &form.local_data(), &labels())
                .unwrap();
        assert_eq!(conflict.diffs().len(), 1);
        assert_eq!(conflict.diffs()[0].label, "Name");
        assert_eq!(conflict.diffs()[0].old_value, "local");
        assert_eq!(conflict.diffs()[0].new_value, "remote");

        let resolution = conflict.take_remote(&mut form);
        assert_eq!(resolution, Resolution::TookRemote(RemoteChange::Update(named("remote"))));
        assert_eq!(form.values, named("remote"));
        assert!(form.loaded);
        assert!(!tracker.has_deferred_changes(&task("t1")));
    }

    #[test]
    fn test_take_remote_uses_newest_value() {
        let tracker = Arc::new(DeferralTracker::new());
        tracker.mark_deferred(task("t1"), RemoteChange::Update(named("first")));
        let mut form = TestForm::default();
        let conflict =
            PendingConflict::load(Arc::clone(&tracker), &task("t1"), &form.local_data(), &labels())
                .unwrap();

        tracker.mark_deferred(task("t1"), RemoteChange::Update(named("second")));
        conflict.take_remote(&mut form);
        assert_eq!(form.values, named("second"));
    }

    #[test]
    fn test_dismiss_acknowledges() {
        let tracker = Arc::new(DeferralTracker::new());
        tracker.mark_deferred(task("t1"), RemoteChange::Update(named("remote")));
        let mut form = TestForm {
            values: named("local"),
            ..Default::default()
        };

        let conflict =
            PendingConflict::load(Arc::clone(&tracker), &task("t1"), &form.local_data(), &labels())
                .unwrap();
        assert_eq!(conflict.dismiss(&mut form), Resolution::Dismissed);
        assert!(form.dismissed);
        assert_eq!(form.values, named("local"));
        assert!(!tracker.has_deferred_changes(&task("t1")));
        assert!(tracker.is_acknowledged(&task("t1"), &RemoteChange::Update(named("remote"))));
    }

    #[test]
    fn test_second_resolution_is_stale() {
        let tracker = Arc::new(DeferralTracker::new());
        tracker.mark_deferred(task("t1"), RemoteChange::Update(named("remote")));
        let mut form = TestForm::default();
        let local = form.local_data();

        let first = PendingConflict::load(Arc::clone(&tracker), &task("t1"), &local, &labels()).unwrap();
        let second = PendingConflict::load(Arc::clone(&tracker), &task("t1"), &local, &labels()).unwrap();

        assert_eq!(first.dismiss(&mut form), Resolution::Dismissed);
        assert_eq!(second.take_remote(&mut form), Resolution::Stale);
        assert!(!form.loaded);
    }

    #[test]
    fn test_removal_conflict() {
        let tracker = Arc::new(DeferralTracker::new());
        tracker.mark_deferred(task("t1"), RemoteChange::Removal);
        let mut form = TestForm {
            values: named("local"),
            ..Default::default()
        };

        let conflict =
            PendingConflict::load(Arc::clone(&tracker), &task("t1"), &form.local_data(), &labels())
                .unwrap();
        assert!(conflict.is_removal());
        assert!(conflict.diffs().is_empty());

        conflict.take_remote(&mut form);
        assert!(form.deleted);
    }
}
