//! Sync configuration.
//!
//! Settings are persisted as pretty JSON. A missing file yields defaults.

use crate::diff::FieldLabels;
use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Configuration for the sync service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Interval between periodic passes in seconds
    pub periodic_interval_secs: u64,
    /// Upper bound for a whole pass in seconds
    pub pass_timeout_secs: u64,
    /// App-resume only syncs if the last success is older than this (seconds)
    pub resume_min_interval_secs: u64,
    /// Watched fields per entity type
    pub watched_fields: BTreeMap<String, FieldLabels>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let mut watched_fields = BTreeMap::new();
        watched_fields.insert(
            "tasks".to_string(),
            FieldLabels::new()
                .with("name", "Name")
                .with("description", "Description")
                .with("due_date", "Due date")
                .with("completed", "Completed")
                .with("priority", "Priority")
                .with("project_id", "Project")
                .with("category_ids", "Categories"),
        );
        watched_fields.insert(
            "goals".to_string(),
            FieldLabels::new()
                .with("name", "Name")
                .with("description", "Description")
                .with("target_date", "Target date")
                .with("achieved", "Achieved"),
        );
        watched_fields.insert(
            "projects".to_string(),
            FieldLabels::new()
                .with("name", "Name")
                .with("description", "Description")
                .with("goal_id", "Goal")
                .with("archived", "Archived"),
        );
        watched_fields.insert(
            "categories".to_string(),
            FieldLabels::new().with("name", "Name").with("color", "Color"),
        );

        Self {
            periodic_interval_secs: 60,
            pass_timeout_secs: 30,
            resume_min_interval_secs: 15,
            watched_fields,
        }
    }
}

/// Whole seconds, rounding a fractional part up so short durations stay
/// non-zero
fn whole_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

impl SyncConfig {
    /// Set the periodic interval
    pub fn with_periodic_interval(mut self, interval: Duration) -> Self {
        self.periodic_interval_secs = whole_secs(interval);
        self
    }

    /// Set the pass timeout
    pub fn with_pass_timeout(mut self, timeout: Duration) -> Self {
        self.pass_timeout_secs = whole_secs(timeout);
        self
    }

    /// Set the minimum age of the last sync before app-resume triggers a pass
    pub fn with_resume_min_interval(mut self, interval: Duration) -> Self {
        self.resume_min_interval_secs = whole_secs(interval);
        self
    }

    /// Set the watched fields for an entity type
    pub fn with_watched_fields(mut self, entity_type: impl Into<String>, labels: FieldLabels) -> Self {
        self.watched_fields.insert(entity_type.into(), labels);
        self
    }

    /// Get the periodic interval
    pub fn periodic_interval(&self) -> Duration {
        Duration::from_secs(self.periodic_interval_secs.max(1))
    }

    /// Get the pass timeout
    pub fn pass_timeout(&self) -> Duration {
        Duration::from_secs(self.pass_timeout_secs)
    }

    /// Get the app-resume threshold
    pub fn resume_min_interval(&self) -> Duration {
        Duration::from_secs(self.resume_min_interval_secs)
    }

    /// Get the configured watched fields for an entity type
    pub fn labels_for(&self, entity_type: &str) -> Option<&FieldLabels> {
        self.watched_fields.get(entity_type)
    }

    /// Check the configuration for values the service cannot run with
    pub fn validate(&self) -> SyncResult<()> {
        if self.pass_timeout_secs == 0 {
            return Err(SyncError::Config("pass_timeout_secs must be positive".to_string()));
        }
        if let Some((entity_type, _)) = self.watched_fields.iter().find(|(_, l)| l.is_empty()) {
            return Err(SyncError::Config(format!(
                "no watched fields configured for {}",
                entity_type
            )));
        }
        Ok(())
    }

    /// Load configuration from disk, or return defaults if the file doesn't exist
    pub async fn load(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("No sync config at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| SyncError::Config(e.to_string()))?;
        let config: SyncConfig =
            serde_json::from_str(&json).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to disk
    pub async fn save(&self, path: impl AsRef<Path>) -> SyncResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::Config(e.to_string()))?;
        }
        let json =
            serde_json::to_string_pretty(self).map_err(|e| SyncError::Config(e.to_string()))?;
        tokio::fs::write(path, json)
            .await
            .map_err(|e| SyncError::Config(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.periodic_interval(), Duration::from_secs(60));
        assert_eq!(config.pass_timeout(), Duration::from_secs(30));
        assert_eq!(config.labels_for("tasks").unwrap().label("name"), Some("Name"));
        assert!(config.labels_for("notes").is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builders() {
        let config = SyncConfig::default()
            .with_periodic_interval(Duration::from_secs(5))
            .with_pass_timeout(Duration::from_secs(2))
            .with_resume_min_interval(Duration::from_secs(1))
            .with_watched_fields("notes", FieldLabels::new().with("body", "Body"));

        assert_eq!(config.periodic_interval_secs, 5);
        assert_eq!(config.pass_timeout_secs, 2);
        assert_eq!(config.resume_min_interval_secs, 1);
        assert_eq!(config.labels_for("notes").unwrap().label("body"), Some("Body"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = SyncConfig::default().with_pass_timeout(Duration::ZERO);
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));

        let config = SyncConfig::default().with_watched_fields("notes", FieldLabels::new());
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_builders_round_fractional_seconds_up() {
        let config = SyncConfig::default()
            .with_periodic_interval(Duration::from_millis(200))
            .with_pass_timeout(Duration::from_millis(500))
            .with_resume_min_interval(Duration::from_millis(1500));

        assert_eq!(config.periodic_interval(), Duration::from_secs(1));
        assert_eq!(config.pass_timeout(), Duration::from_secs(1));
        assert_eq!(config.resume_min_interval(), Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_periodic_interval_never_zero() {
        let config = SyncConfig::default().with_periodic_interval(Duration::ZERO);
        assert_eq!(config.periodic_interval(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_load_missing_file_gives_defaults() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = SyncConfig::load(temp_dir.path().join("missing.json")).await.unwrap();
        assert_eq!(config, SyncConfig::default());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("sync.json");

        let config = SyncConfig::default()
            .with_periodic_interval(Duration::from_secs(120))
            .with_watched_fields("notes", FieldLabels::new().with("body", "Body").with("pinned", "Pinned"));
        config.save(&path).await.unwrap();

        let loaded = SyncConfig::load(&path).await.unwrap();
        assert_eq!(loaded, config);
        let order: Vec<_> = loaded.labels_for("notes").unwrap().iter().map(|(f, _)| f).collect();
        assert_eq!(order, vec!["body", "pinned"]);
    }

    #[tokio::test]
    async fn test_partial_file_fills_defaults() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("sync.json");
        tokio::fs::write(&path, r#"{"periodic_interval_secs": 10}"#).await.unwrap();

        let config = SyncConfig::load(&path).await.unwrap();
        assert_eq!(config.periodic_interval_secs, 10);
        assert_eq!(config.pass_timeout_secs, 30);
        assert!(config.labels_for("goals").is_some());
    }

    #[tokio::test]
    async fn test_load_invalid_json() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("sync.json");
        tokio::fs::write(&path, "not json").await.unwrap();
        assert!(matches!(SyncConfig::load(&path).await, Err(SyncError::Config(_))));
    }
}
