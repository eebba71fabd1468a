use crate::registry::SessionRegistry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tony_core::MemoryConfig;
use tony_storage::LocalStore;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub backup_interval: Duration,
    pub backup_retry: Duration,
    pub eviction_interval: Duration,
    pub session_timeout: Duration,
    pub archive_interval: Duration,
    pub archive_after_days: i64,
}

impl SchedulerConfig {
    pub fn from_memory_config(config: &MemoryConfig) -> Self {
        Self {
            backup_interval: config.backup_interval(),
            backup_retry: config.backup_retry(),
            eviction_interval: config.eviction_interval(),
            session_timeout: config.session_timeout(),
            archive_interval: config.archive_interval(),
            archive_after_days: config.archive_after_days,
        }
    }

    /// How often the backup plan is consulted.
    fn backup_tick(&self) -> Duration {
        self.backup_interval.min(self.backup_retry)
    }
}

/// When each live session is next due for an automatic backup.
#[derive(Debug)]
pub struct BackupPlan {
    interval: Duration,
    retry: Duration,
    next_due: HashMap<String, Instant>,
}

impl BackupPlan {
    pub fn new(interval: Duration, retry: Duration) -> Self {
        Self {
            interval,
            retry,
            next_due: HashMap::new(),
        }
    }

    /// Syncs the plan with the live sessions and returns those due at `now`.
    /// Newly seen sessions become due one interval later.
    pub fn due(&mut self, active: &[String], now: Instant) -> Vec<String> {
        self.next_due
            .retain(|session_id, _| active.contains(session_id));
        for session_id in active {
            self.next_due
                .entry(session_id.clone())
                .or_insert(now + self.interval);
        }

        let mut due = self
            .next_due
            .iter()
            .filter(|(_, next)| **next <= now)
            .map(|(session_id, _)| session_id.clone())
            .collect::<Vec<_>>();
        due.sort();
        due
    }

    pub fn record_success(&mut self, session_id: &str, now: Instant) {
        self.next_due
            .insert(session_id.to_string(), now + self.interval);
    }

    pub fn record_failure(&mut self, session_id: &str, now: Instant) {
        self.next_due.insert(session_id.to_string(), now + self.retry);
    }

    pub fn next_due(&self, session_id: &str) -> Option<Instant> {
        self.next_due.get(session_id).copied()
    }
}

/// Backs up every session the plan says is due. Returns the number backed up.
pub fn run_backup_pass(registry: &SessionRegistry, plan: &mut BackupPlan, now: Instant) -> usize {
    let due = plan.due(&registry.active_sessions(), now);
    let mut backed_up = 0;
    for session_id in due {
        match registry.backup_session(&session_id) {
            Ok(Some(bytes)) => {
                plan.record_success(&session_id, now);
                backed_up += 1;
                debug!(event = "scheduled_backup", session_id = %session_id, bytes);
            }
            Ok(None) => {}
            Err(err) => {
                plan.record_failure(&session_id, now);
                warn!(
                    event = "scheduled_backup_failed",
                    session_id = %session_id,
                    error = %err
                );
            }
        }
    }
    backed_up
}

/// Owns the periodic backup, eviction and archive tasks.
pub struct MemoryScheduler {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl MemoryScheduler {
    /// Spawns the periodic tasks on the current tokio runtime.
    pub fn start(registry: Arc<SessionRegistry>, config: SchedulerConfig) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();

        let plan = Arc::new(Mutex::new(BackupPlan::new(
            config.backup_interval,
            config.backup_retry,
        )));
        let backup_registry = registry.clone();
        handles.push(spawn_periodic(
            "backup",
            config.backup_tick(),
            shutdown_rx.clone(),
            move || {
                let mut guard = plan.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                run_backup_pass(&backup_registry, &mut guard, Instant::now());
            },
        ));

        let eviction_registry = registry.clone();
        let session_timeout = config.session_timeout;
        handles.push(spawn_periodic(
            "eviction",
            config.eviction_interval,
            shutdown_rx.clone(),
            move || {
                let evicted = eviction_registry.evict_inactive(session_timeout);
                if !evicted.is_empty() {
                    info!(event = "sessions_evicted", count = evicted.len());
                }
            },
        ));

        handles.push(spawn_archiver(registry.local().clone(), &config, shutdown_rx));

        info!(
            event = "memory_scheduler_started",
            backup_interval_secs = config.backup_interval.as_secs(),
            eviction_interval_secs = config.eviction_interval.as_secs(),
            archive_interval_secs = config.archive_interval.as_secs()
        );
        Self { shutdown, handles }
    }

    /// Spawns only the archive sweep, for processes that hold no live sessions.
    pub fn start_archiver(local: Arc<LocalStore>, config: SchedulerConfig) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handles = vec![spawn_archiver(local, &config, shutdown_rx)];
        info!(
            event = "memory_archiver_started",
            archive_interval_secs = config.archive_interval.as_secs(),
            archive_after_days = config.archive_after_days
        );
        Self { shutdown, handles }
    }

    /// Signals every task to stop and waits for them.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(err) = handle.await {
                warn!(event = "memory_scheduler_join_failed", error = %err);
            }
        }
        info!(event = "memory_scheduler_stopped");
    }
}

fn spawn_archiver(
    local: Arc<LocalStore>,
    config: &SchedulerConfig,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let archive_after_days = config.archive_after_days;
    spawn_periodic("archive", config.archive_interval, shutdown, move || {
        match local.cleanup_sessions_older_than(archive_after_days) {
            Ok(archived) => {
                if archived > 0 {
                    info!(event = "sessions_archived", archived, archive_after_days);
                }
            }
            Err(err) => warn!(event = "session_archive_failed", error = %err),
        }
    })
}

fn spawn_periodic<F>(
    task: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    job: F,
) -> JoinHandle<()>
where
    F: Fn() + Send + Sync + 'static,
{
    let job = Arc::new(job);
    let period = period.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut ticker = tokio::time::interval_at(start, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let job = job.clone();
                    if let Err(err) = tokio::task::spawn_blocking(move || job()).await {
                        warn!(event = "memory_task_failed", task, error = %err);
                    }
                }
            }
        }
        debug!(event = "memory_task_stopped", task);
    })
}
