//! Local-first replica synchronization.
//!
//! This crate keeps an on-device replica of user records in step with a remote
//! authority without overwriting what the user currently has open in a form.
//!
//! # Modules
//!
//! - `status`: Sync phase state machine and pending-mutation counter
//! - `session`: Registry of open edit sessions
//! - `deferral`: Remote changes withheld from entities under edit
//! - `diff`: Field-level diff between a local and a remote record
//! - `resolution`: Take-remote / dismiss contract for edit forms
//! - `orchestrator`: One push-then-pull sync pass
//! - `service`: Process-wide facade owning all of the above
//! - `scheduler`: Periodic sync timer
//! - `store`, `remote`: Storage and network collaborators
//! - `config`, `error`: Settings and error types
//!
//! # Example
//!
//! ```
//! use replica::{EntityKey, FormType, InMemoryRemote, MemoryStore, SyncConfig, SyncService, SyncTrigger};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> replica::SyncResult<()> {
//! let service = SyncService::new(
//!     SyncConfig::default(),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(InMemoryRemote::new()),
//! )
//! .await?;
//!
//! service.begin_edit(EntityKey::new("t1", "tasks"), FormType::ManualSave);
//! service.perform_sync(SyncTrigger::Manual).await?;
//! assert_eq!(service.status().short_status(), "Synced");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod deferral;
pub mod diff;
pub mod entity;
pub mod error;
pub mod orchestrator;
pub mod remote;
pub mod resolution;
pub mod scheduler;
pub mod service;
pub mod session;
pub mod status;
pub mod store;

use std::sync::{Mutex, MutexGuard, PoisonError};

// Re-export commonly used types
pub use config::SyncConfig;
pub use deferral::{DeferralEvent, DeferralRecord, DeferralTracker, Observation, RemoteChange};
pub use diff::{compute_field_diffs, format_value, has_field_changes, FieldDiff, FieldLabels};
pub use entity::{Entity, EntityKey, MutationKind, PendingMutation, Record};
pub use error::{SyncError, SyncResult};
pub use orchestrator::{PushFailure, SyncOrchestrator, SyncOutcome, SyncReport, SyncTrigger, ViewRefresher};
pub use remote::{InMemoryRemote, PullBatch, RemoteAuthority};
pub use resolution::{PendingConflict, Resolution, ResolutionForm};
pub use scheduler::{ShutdownHandle, SyncScheduler};
pub use service::SyncService;
pub use session::{EditOutcome, EditSession, EditSessionRegistry, FormType};
pub use status::{Subscription, SyncPhase, SyncStatus, SyncStatusState};
pub use store::{Checkpoint, LocalStore, MemoryStore, StoreSnapshot};

/// Lock shared state, recovering the data if a holder panicked.
///
/// Every critical section is a single step that leaves the data consistent,
/// so a poisoned lock still guards valid state.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
