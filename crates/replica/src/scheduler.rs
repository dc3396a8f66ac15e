//! Periodic sync timer.

use crate::orchestrator::SyncTrigger;
use crate::remote::RemoteAuthority;
use crate::service::SyncService;
use crate::store::LocalStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Handle for stopping a running scheduler.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: broadcast::Sender<()>,
}

impl ShutdownHandle {
    /// Signal the scheduler to stop after the current pass.
    pub fn shutdown(&self) {
        let _ = self.tx.send(());
    }
}

/// Background task running `perform_sync(Periodic)` on a fixed interval.
///
/// The first pass runs one full interval after spawning. A failed pass is
/// logged and the next attempt waits a full interval; there is no immediate
/// retry.
pub struct SyncScheduler {
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl SyncScheduler {
    /// Start the timer on the current tokio runtime
    pub fn spawn<S, R>(service: Arc<SyncService<S, R>>, interval: Duration) -> Self
    where
        S: LocalStore + 'static,
        R: RemoteAuthority + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        // `interval` panics on a zero period
        let interval = interval.max(Duration::from_millis(1));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            tracing::info!("Periodic sync every {:?}", interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = service.perform_sync(SyncTrigger::Periodic).await {
                            tracing::warn!("Periodic sync failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Periodic sync stopped");
                        break;
                    }
                }
            }
        });

        Self { shutdown_tx, task }
    }

    /// Start the timer with the service's configured periodic interval
    pub fn spawn_from_config<S, R>(service: Arc<SyncService<S, R>>) -> Self
    where
        S: LocalStore + 'static,
        R: RemoteAuthority + 'static,
    {
        let interval = service.config().periodic_interval();
        Self::spawn(service, interval)
    }

    /// Get a handle that stops this scheduler
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Check if the timer task has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the timer and wait for the task to exit
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            tracing::error!("Periodic sync task panicked: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::remote::InMemoryRemote;
    use crate::status::SyncPhase;
    use crate::store::MemoryStore;

    async fn service_with(
        config: SyncConfig,
    ) -> (Arc<SyncService<MemoryStore, InMemoryRemote>>, Arc<InMemoryRemote>) {
        let remote = Arc::new(InMemoryRemote::new());
        let service = SyncService::new(config, Arc::new(MemoryStore::new()), Arc::clone(&remote))
            .await
            .unwrap();
        (service, remote)
    }

    async fn service() -> (Arc<SyncService<MemoryStore, InMemoryRemote>>, Arc<InMemoryRemote>) {
        service_with(SyncConfig::default()).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_every_interval() {
        let (service, remote) = service().await;
        let scheduler = SyncScheduler::spawn(Arc::clone(&service), Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(remote.fetch_calls(), 0);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(remote.fetch_calls(), 1);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(remote.fetch_calls(), 3);

        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_from_config_uses_configured_interval() {
        let config = SyncConfig::default().with_periodic_interval(Duration::from_secs(5));
        let (service, remote) = service_with(config).await;
        let scheduler = SyncScheduler::spawn_from_config(Arc::clone(&service));

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(remote.fetch_calls(), 0);

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(remote.fetch_calls(), 2);

        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_stop_the_loop() {
        let (service, remote) = service().await;
        remote.set_offline(true);
        let scheduler = SyncScheduler::spawn(Arc::clone(&service), Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(remote.fetch_calls(), 2);
        assert_eq!(service.status().phase, SyncPhase::Error);

        remote.set_offline(false);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(service.status().phase, SyncPhase::Idle);
        assert!(!scheduler.is_finished());

        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_handle_stops_task() {
        let (service, remote) = service().await;
        let scheduler = SyncScheduler::spawn(service, Duration::from_secs(10));
        scheduler.shutdown_handle().shutdown();

        tokio::time::sleep(Duration::from_secs(50)).await;
        assert!(scheduler.is_finished());
        assert_eq!(remote.fetch_calls(), 0);
    }
}
