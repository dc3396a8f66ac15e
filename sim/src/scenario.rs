//! Two devices editing the same task through one in-memory remote.

use anyhow::{bail, Context};
use replica::{
    EditOutcome, Entity, EntityKey, FormType, InMemoryRemote, MemoryStore, PendingMutation,
    Record, Resolution, ResolutionForm, SyncConfig, SyncReport, SyncScheduler, SyncService,
    SyncTrigger, ViewRefresher,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

type Device = Arc<SyncService<MemoryStore, InMemoryRemote>>;

/// Edit form state on the laptop
struct TaskForm {
    values: Record,
}

impl ResolutionForm for TaskForm {
    fn local_data(&self) -> Record {
        self.values.clone()
    }

    fn replace_with_remote(&mut self, remote: Option<&Record>) {
        self.values = remote.cloned().unwrap_or_default();
    }

    fn on_load_remote(&mut self) {
        tracing::info!("Form reloaded with remote values");
    }

    fn on_dismiss(&mut self) {
        tracing::info!("Form kept local edits");
    }
}

/// Logs what a view would re-render
struct LogRefresher(&'static str);

impl ViewRefresher for LogRefresher {
    fn refresh(&self, report: &SyncReport) {
        if report.applied + report.removed > 0 {
            tracing::info!(
                "[{}] refreshing views: {} updated, {} removed",
                self.0,
                report.applied,
                report.removed
            );
        }
    }
}

fn task_data(name: &str, completed: bool) -> Record {
    let mut data = Record::new();
    data.insert("name".to_string(), json!(name));
    data.insert("completed".to_string(), json!(completed));
    data.insert("category_ids".to_string(), json!(["home", "errands"]));
    data
}

async fn device(
    name: &'static str,
    config: &SyncConfig,
    remote: &Arc<InMemoryRemote>,
    seed: Vec<Entity>,
) -> anyhow::Result<Device> {
    let store = Arc::new(MemoryStore::with_entities(seed));
    let service = SyncService::with_refresher(
        config.clone(),
        store,
        Arc::clone(remote),
        Arc::new(LogRefresher(name)),
    )
    .await
    .with_context(|| format!("Failed to start {}", name))?;
    Ok(service)
}

async fn save(device: &Device, key: &EntityKey, data: Record) -> anyhow::Result<()> {
    device
        .queue_local_mutation(PendingMutation::upsert(key.clone(), data))
        .await?;
    Ok(())
}

fn print_conflict(device: &Device, key: &EntityKey, form: &TaskForm) {
    if let Some(conflict) = device.pending_conflict(key, &form.local_data()) {
        for diff in conflict.diffs() {
            tracing::info!("  {}: {} -> {}", diff.label, diff.old_value, diff.new_value);
        }
    }
}

/// Run the scripted scenario
pub async fn run(config: SyncConfig, data_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let remote = Arc::new(InMemoryRemote::new());
    let key = EntityKey::new("t1", "tasks");
    let seed = vec![Entity::new(key.clone(), task_data("Buy milk", false))];

    let laptop = device("laptop", &config, &remote, seed.clone()).await?;
    let phone = device("phone", &config, &remote, seed).await?;

    let _status_log = laptop.status_state().subscribe(|status| {
        tracing::info!("[laptop] status: {}", status.short_status());
    });

    // Laptop opens the task while the phone renames it
    laptop.begin_edit(key.clone(), FormType::ManualSave);
    let mut form = TaskForm {
        values: task_data("Buy milk", false),
    };
    save(&phone, &key, task_data("Buy oat milk", false)).await?;
    phone.perform_sync(SyncTrigger::Manual).await?;
    laptop.perform_sync(SyncTrigger::Manual).await?;

    let deferred = laptop.deferrals().deferred_keys();
    if !deferred.contains(&key) {
        bail!("expected the phone's rename to be deferred on the laptop");
    }
    tracing::info!("[laptop] {} entities with remote changes held back", deferred.len());
    tracing::info!("[laptop] {} changed on another device:", key);
    print_conflict(&laptop, &key, &form);

    // Keep the local value first
    if let Some(conflict) = laptop.pending_conflict(&key, &form.local_data()) {
        laptop.dismiss(conflict, &mut form);
    }

    // A second edit on the phone defers again
    save(&phone, &key, task_data("Buy oat milk", true)).await?;
    phone.perform_sync(SyncTrigger::Manual).await?;
    laptop.perform_sync(SyncTrigger::AppResume).await?;
    tracing::info!("[laptop] {} changed again:", key);
    print_conflict(&laptop, &key, &form);

    if let Some(conflict) = laptop.pending_conflict(&key, &form.local_data()) {
        match laptop.take_remote(conflict, &mut form).await? {
            Resolution::TookRemote(_) => tracing::info!("[laptop] took remote value"),
            other => tracing::warn!("[laptop] conflict already resolved: {:?}", other),
        }
    }
    laptop.end_edit(&key, EditOutcome::Discarded).await?;

    // Let the phone's timer run a few passes while the laptop goes offline
    let interval = config.periodic_interval();
    let scheduler = SyncScheduler::spawn_from_config(Arc::clone(&phone));
    remote.set_offline(true);
    if let Err(e) = laptop.perform_sync(SyncTrigger::Manual).await {
        tracing::info!("[laptop] offline pass failed as expected: {}", e);
    }
    remote.set_offline(false);
    tokio::time::sleep(interval * 3).await;
    scheduler.stop().await;
    laptop.perform_sync(SyncTrigger::Manual).await?;

    let laptop_value = laptop.store().get(&key).map(|e| e.data);
    let phone_value = phone.store().get(&key).map(|e| e.data);
    if laptop_value != phone_value {
        bail!("devices diverged: {:?} vs {:?}", laptop_value, phone_value);
    }
    tracing::info!(
        "Devices converged on {}",
        serde_json::to_string(&laptop_value).context("Failed to render value")?
    );
    tracing::info!(
        "[laptop] final status: {}",
        serde_json::to_string(&laptop.status()).context("Failed to render status")?
    );

    if let Some(dir) = data_dir {
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {:?}", dir))?;
        laptop.store().save_to(dir.join("laptop.json")).await?;
        phone.store().save_to(dir.join("phone.json")).await?;
        config.save(dir.join("sync.json")).await?;
        tracing::info!("Saved replicas to {:?}", dir);
    }

    laptop.shutdown().await?;
    phone.shutdown().await?;
    Ok(())
}
