pub mod cache;
pub mod episodic;
pub mod facade;
pub mod procedural;
pub mod registry;
pub mod remote;
pub mod scheduler;
pub mod semantic;

pub use cache::ReadCache;
pub use episodic::{EpisodicMemory, EpisodicSummary};
pub use facade::{ClearScope, MemoryFacade, MemorySummary, ProceduralSummary, SemanticSummary};
pub use procedural::ProceduralMemory;
pub use registry::SessionRegistry;
pub use remote::{RemoteError, RemoteQuery, RemoteStore, RestRemoteStore};
pub use scheduler::{BackupPlan, MemoryScheduler, SchedulerConfig};
pub use semantic::{ExtractedFact, SemanticMemory};

use std::sync::Arc;
use thiserror::Error;
use tony_storage::StorageError;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type MemoryResult<T> = Result<T, MemoryError>;

/// Cache, then remote, then local. The remote is skipped while the session still has
/// local rows of this kind it never confirmed, since its answer would miss them. A
/// failed remote read falls through to the local store; local failures propagate.
pub(crate) fn read_through<T: Clone>(
    cache: &ReadCache<Vec<T>>,
    key: String,
    table: &str,
    remote: Option<&Arc<dyn RemoteStore>>,
    local_pending: impl FnOnce() -> Result<bool, StorageError>,
    fetch_remote: impl FnOnce(&dyn RemoteStore) -> Result<Vec<T>, RemoteError>,
    fetch_local: impl FnOnce() -> Result<Vec<T>, StorageError>,
) -> MemoryResult<Vec<T>> {
    if let Some(hit) = cache.get(&key) {
        return Ok(hit);
    }

    if let Some(remote) = remote {
        if local_pending()? {
            debug!(event = "remote_read_skipped", table, reason = "unsynced_local_rows");
        } else {
            match fetch_remote(remote.as_ref()) {
                Ok(rows) => {
                    cache.insert(key, rows.clone());
                    return Ok(rows);
                }
                Err(err) => warn!(event = "remote_read_failed", table, error = %err),
            }
        }
    }

    let rows = fetch_local()?;
    cache.insert(key, rows.clone());
    Ok(rows)
}

/// Runs a best-effort remote write; returns whether it was confirmed.
pub(crate) fn mirror_write(
    table: &str,
    session_id: &str,
    write: impl FnOnce() -> Result<(), RemoteError>,
) -> bool {
    match write() {
        Ok(()) => true,
        Err(err) => {
            warn!(event = "remote_write_failed", table, session_id, error = %err);
            false
        }
    }
}
