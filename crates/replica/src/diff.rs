//! Field-level diff between a local edit snapshot and a remote value.
//!
//! Only whitelisted fields are compared. A field missing from the remote
//! record carries no information and is never reported; a remote explicit
//! `null` is a value and is compared like any other.

use crate::entity::Record;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A watched field and its display label
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldLabel {
    pub field: String,
    pub label: String,
}

/// Ordered whitelist of watched fields.
///
/// Iteration order is insertion order and determines the order of diffs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldLabels(Vec<FieldLabel>);

impl FieldLabels {
    /// Create an empty whitelist
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a watched field. Re-adding a field replaces its label in place.
    pub fn with(mut self, field: impl Into<String>, label: impl Into<String>) -> Self {
        self.insert(field, label);
        self
    }

    /// Add a watched field
    pub fn insert(&mut self, field: impl Into<String>, label: impl Into<String>) {
        let field = field.into();
        let label = label.into();
        match self.0.iter_mut().find(|l| l.field == field) {
            Some(existing) => existing.label = label,
            None => self.0.push(FieldLabel { field, label }),
        }
    }

    /// Watch every field of a record, labelled by its name
    pub fn from_record(record: &Record) -> Self {
        let mut labels = Self::new();
        for field in record.keys() {
            labels.insert(field.clone(), field.clone());
        }
        labels
    }

    /// Get the label of a field
    pub fn label(&self, field: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|l| l.field == field)
            .map(|l| l.label.as_str())
    }

    /// Iterate `(field, label)` pairs in order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|l| (l.field.as_str(), l.label.as_str()))
    }

    /// Get the number of watched fields
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if no fields are watched
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<F: Into<String>, L: Into<String>> FromIterator<(F, L)> for FieldLabels {
    fn from_iter<I: IntoIterator<Item = (F, L)>>(iter: I) -> Self {
        let mut labels = Self::new();
        for (field, label) in iter {
            labels.insert(field, label);
        }
        labels
    }
}

/// One differing field, formatted for display
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub field: String,
    pub label: String,
    pub old_value: String,
    pub new_value: String,
}

/// Compute the ordered list of watched fields where local and remote differ.
pub fn compute_field_diffs(local: &Record, remote: &Record, labels: &FieldLabels) -> Vec<FieldDiff> {
    labels
        .iter()
        .filter_map(|(field, label)| {
            let new = remote.get(field)?;
            let old = local.get(field);
            if old == Some(new) {
                return None;
            }
            Some(FieldDiff {
                field: field.to_string(),
                label: label.to_string(),
                old_value: format_value(old),
                new_value: format_value(Some(new)),
            })
        })
        .collect()
}

/// Check if any watched field differs, without formatting
pub fn has_field_changes(local: &Record, remote: &Record, labels: &FieldLabels) -> bool {
    labels.iter().any(|(field, _)| match remote.get(field) {
        Some(new) => local.get(field) != Some(new),
        None => false,
    })
}

/// Format a field value for the resolution banner.
///
/// Booleans render as "On"/"Off", null or absent as "None", arrays as their
/// comma-joined elements.
pub fn format_value(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "None".to_string(),
        Some(Value::Bool(true)) => "On".to_string(),
        Some(Value::Bool(false)) => "Off".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| format_value(Some(item)))
            .collect::<Vec<_>>()
            .join(", "),
        Some(other @ Value::Object(_)) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn rec(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_boolean_diff_display() {
        let local = rec(json!({"a": 1, "b": true}));
        let remote = rec(json!({"a": 1, "b": false}));
        let labels = FieldLabels::new().with("a", "A").with("b", "B");

        let diffs = compute_field_diffs(&local, &remote, &labels);
        assert_eq!(
            diffs,
            vec![FieldDiff {
                field: "b".to_string(),
                label: "B".to_string(),
                old_value: "On".to_string(),
                new_value: "Off".to_string(),
            }]
        );
    }

    #[test]
    fn test_missing_remote_field_is_not_a_conflict() {
        let local = rec(json!({"name": "Local", "notes": "x"}));
        let remote = rec(json!({"name": "Local"}));
        let labels = FieldLabels::new().with("name", "Name").with("notes", "Notes");
        assert!(compute_field_diffs(&local, &remote, &labels).is_empty());
        assert!(!has_field_changes(&local, &remote, &labels));
    }

    #[test]
    fn test_remote_null_is_compared() {
        let local = rec(json!({"due": "2026-01-01"}));
        let remote = rec(json!({"due": null}));
        let labels = FieldLabels::new().with("due", "Due date");

        let diffs = compute_field_diffs(&local, &remote, &labels);
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].old_value, "2026-01-01");
        assert_eq!(diffs[0].new_value, "None");
    }

    #[test]
    fn test_unwatched_fields_ignored() {
        let local = rec(json!({"name": "a", "color": "red"}));
        let remote = rec(json!({"name": "a", "color": "blue"}));
        let labels = FieldLabels::new().with("name", "Name");
        assert!(compute_field_diffs(&local, &remote, &labels).is_empty());
    }

    #[test]
    fn test_diff_order_follows_labels() {
        let local = rec(json!({"a": 1, "b": 2, "c": 3}));
        let remote = rec(json!({"a": 9, "b": 9, "c": 9}));
        let labels = FieldLabels::new().with("c", "C").with("a", "A").with("b", "B");

        let fields: Vec<_> = compute_field_diffs(&local, &remote, &labels)
            .into_iter()
            .map(|d| d.field)
            .collect();
        assert_eq!(fields, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_local_missing_field_renders_none() {
        let local = Record::new();
        let remote = rec(json!({"tags": ["home", "urgent"]}));
        let labels = FieldLabels::new().with("tags", "Tags");

        let diffs = compute_field_diffs(&local, &remote, &labels);
        assert_eq!(diffs[0].old_value, "None");
        assert_eq!(diffs[0].new_value, "home, urgent");
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(None), "None");
        assert_eq!(format_value(Some(&json!(null))), "None");
        assert_eq!(format_value(Some(&json!(true))), "On");
        assert_eq!(format_value(Some(&json!(false))), "Off");
        assert_eq!(format_value(Some(&json!(42))), "42");
        assert_eq!(format_value(Some(&json!(1.5))), "1.5");
        assert_eq!(format_value(Some(&json!("text"))), "text");
        assert_eq!(format_value(Some(&json!([1, true, null]))), "1, On, None");
        assert_eq!(format_value(Some(&json!([]))), "");
        assert_eq!(format_value(Some(&json!({"k": 1}))), "{\"k\":1}");
    }

    #[test]
    fn test_labels_insert_replaces_in_place() {
        let labels = FieldLabels::new()
            .with("name", "Name")
            .with("due", "Due")
            .with("name", "Title");
        assert_eq!(labels.len(), 2);
        assert_eq!(labels.label("name"), Some("Title"));
        assert_eq!(labels.iter().next(), Some(("name", "Title")));
    }

    #[test]
    fn test_labels_from_record() {
        let labels = FieldLabels::from_record(&rec(json!({"name": "x", "done": false})));
        assert_eq!(labels.len(), 2);
        assert_eq!(labels.label("done"), Some("done"));
    }

    #[test]
    fn test_labels_serialize_as_ordered_list() {
        let labels = FieldLabels::new().with("z", "Zed").with("a", "Ay");
        let json = serde_json::to_value(&labels).unwrap();
        assert_eq!(json, json!([{"field": "z", "label": "Zed"}, {"field": "a", "label": "Ay"}]));
    }

    proptest! {
        #[test]
        fn identical_records_never_diff(name in ".*", done in any::<bool>(), count in any::<i64>()) {
            let record = rec(json!({"name": name, "done": done, "count": count}));
            let labels = FieldLabels::from_record(&record);
            prop_assert!(compute_field_diffs(&record, &record, &labels).is_empty());
        }

        #[test]
        fn detection_is_symmetric_for_shared_fields(a in any::<i64>(), b in any::<i64>()) {
            let left = rec(json!({"n": a}));
            let right = rec(json!({"n": b}));
            let labels = FieldLabels::new().with("n", "N");
            prop_assert_eq!(
                has_field_changes(&left, &right, &labels),
                has_field_changes(&right, &left, &labels)
            );
            prop_assert_eq!(has_field_changes(&left, &right, &labels), a != b);
        }
    }
}
