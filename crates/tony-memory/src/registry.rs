use crate::facade::MemoryFacade;
use crate::remote::RemoteStore;
use crate::MemoryResult;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tony_core::MemoryConfig;
use tony_storage::LocalStore;
use tracing::{info, warn};

struct RegistryEntry {
    facade: Arc<MemoryFacade>,
    last_activity: Instant,
}

/// Live `MemoryFacade` per session, owned by the composition root.
///
/// A session never has two live facades. Eviction only drops the in-process object;
/// persisted data stays.
pub struct SessionRegistry {
    local: Arc<LocalStore>,
    remote: Option<Arc<dyn RemoteStore>>,
    config: MemoryConfig,
    sessions: Mutex<HashMap<String, RegistryEntry>>,
}

impl SessionRegistry {
    pub fn new(
        local: Arc<LocalStore>,
        remote: Option<Arc<dyn RemoteStore>>,
        config: MemoryConfig,
    ) -> Self {
        Self {
            local,
            remote,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn local(&self) -> &Arc<LocalStore> {
        &self.local
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, RegistryEntry>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the live facade for `session_id`, opening one when needed. The facade is
    /// opened without holding the registry lock; when two callers race, the first one
    /// inserted wins and the other is dropped.
    pub fn get_or_create(&self, session_id: &str) -> MemoryResult<Arc<MemoryFacade>> {
        if let Some(entry) = self.sessions().get_mut(session_id) {
            entry.last_activity = Instant::now();
            return Ok(entry.facade.clone());
        }

        let opened = Arc::new(MemoryFacade::open(
            session_id,
            self.local.clone(),
            self.remote.clone(),
            &self.config,
        )?);

        let mut sessions = self.sessions();
        let live_sessions = sessions.len();
        let entry = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| RegistryEntry {
                facade: opened.clone(),
                last_activity: Instant::now(),
            });
        entry.last_activity = Instant::now();
        let facade = entry.facade.clone();
        if Arc::ptr_eq(&facade, &opened) {
            info!(event = "session_opened", session_id, live_sessions = live_sessions + 1);
        }
        Ok(facade)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<MemoryFacade>> {
        self.sessions()
            .get(session_id)
            .map(|entry| entry.facade.clone())
    }

    /// Drops facades idle for at least `timeout`, backing each one up first.
    /// A failed backup is logged and the eviction still happens.
    pub fn evict_inactive(&self, timeout: Duration) -> Vec<String> {
        let evicted = {
            let mut sessions = self.sessions();
            let idle = sessions
                .iter()
                .filter(|(_, entry)| entry.last_activity.elapsed() >= timeout)
                .map(|(session_id, _)| session_id.clone())
                .collect::<Vec<_>>();
            idle.into_iter()
                .filter_map(|session_id| {
                    sessions
                        .remove(&session_id)
                        .map(|entry| (session_id, entry.facade))
                })
                .collect::<Vec<_>>()
        };

        let mut ids = Vec::with_capacity(evicted.len());
        for (session_id, facade) in evicted {
            match facade.backup() {
                Ok(bytes) => info!(event = "session_evicted", session_id = %session_id, bytes),
                Err(err) => warn!(
                    event = "session_evict_backup_failed",
                    session_id = %session_id,
                    error = %err
                ),
            }
            ids.push(session_id);
        }
        ids
    }

    pub fn active_sessions(&self) -> Vec<String> {
        let mut ids = self.sessions().keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Backs up a live session. `None` when the session is not (or no longer) live.
    pub fn backup_session(&self, session_id: &str) -> MemoryResult<Option<usize>> {
        match self.get(session_id) {
            Some(facade) => Ok(Some(facade.backup()?)),
            None => Ok(None),
        }
    }

    /// Backs up every live session; returns how many succeeded.
    pub fn backup_all(&self) -> usize {
        let mut succeeded = 0;
        for session_id in self.active_sessions() {
            match self.backup_session(&session_id) {
                Ok(Some(_)) => succeeded += 1,
                Ok(None) => {}
                Err(err) => warn!(
                    event = "session_backup_failed",
                    session_id = %session_id,
                    error = %err
                ),
            }
        }
        succeeded
    }
}
