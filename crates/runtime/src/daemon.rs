//! Long-running scheduling loop and its control handle.
//!
//! The loop runs a cycle, then waits for the tick interval, a manual trigger,
//! or a mode change.  Pause and stop are only observed between cycles, so an
//! in-flight activity always commits.  A fatal error (exhausted persistence)
//! stops the loop; every exit path ends with a final flush.
//!
//! Only one writer may own a store: [`bootstrap`] takes the store's exclusive
//! lock and keeps it inside the scheduler.  [`open_read_only`] skips the lock
//! and never writes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use being_config::AppConfig;
use being_memory::{
    Loaded, MemoryError, MemoryRecord, MemoryStats, MemoryStore, PersistenceManager, RetryPolicy,
    State, StateTracker,
};

use crate::collaborators::{ActivityExecutor, DryRunExecutor, RankingService, UnavailableRanking};
use crate::events::SchedulerEvent;
use crate::registry::{ConstraintRegistry, NextAvailable};
use crate::scheduler::{Phase, Scheduler, SchedulerSettings};

/// Records shown in a status view.
const STATUS_RECENT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Running,
    Paused,
    Stopping,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub mode: RunMode,
    pub phase: Phase,
    pub state: State,
    pub recent: Vec<MemoryRecord>,
    pub pending_chat: Vec<MemoryRecord>,
    pub next_available: Vec<NextAvailable>,
    pub memory: MemoryStats,
}

impl StatusSnapshot {
    pub async fn collect(scheduler: &Scheduler, mode: RunMode) -> Self {
        let now = Utc::now();
        let next_available = scheduler.next_available(now).await;
        let (state, recent, pending_chat, memory) = scheduler
            .view(|state, memory| {
                (
                    state.clone(),
                    memory
                        .recent(STATUS_RECENT)
                        .into_iter()
                        .cloned()
                        .collect::<Vec<_>>(),
                    memory.pending_chat().into_iter().cloned().collect::<Vec<_>>(),
                    memory.stats(),
                )
            })
            .await;
        Self {
            mode,
            phase: scheduler.phase(),
            state,
            recent,
            pending_chat,
            next_available,
            memory,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DaemonOptions {
    pub tick_interval: Duration,
    /// Stop after this many cycles (exhausted cycles count).
    pub max_cycles: Option<u64>,
    pub start_paused: bool,
}

impl DaemonOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            tick_interval: Duration::from_secs(config.scheduler.tick_interval_secs),
            ..Self::default()
        }
    }
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            max_cycles: None,
            start_paused: false,
        }
    }
}

#[derive(Clone)]
pub struct SchedulerHandle {
    scheduler: Arc<Scheduler>,
    mode: Arc<watch::Sender<RunMode>>,
    trigger: Arc<Notify>,
}

impl SchedulerHandle {
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn mode(&self) -> RunMode {
        *self.mode.borrow()
    }

    /// Takes effect once the current cycle has committed.
    pub fn pause(&self) {
        let paused = self.mode.send_if_modified(|mode| match mode {
            RunMode::Running => {
                *mode = RunMode::Paused;
                true
            }
            _ => false,
        });
        if paused {
            info!("scheduler paused");
            self.scheduler.emit(SchedulerEvent::Paused);
        }
    }

    pub fn resume(&self) {
        let resumed = self.mode.send_if_modified(|mode| match mode {
            RunMode::Paused => {
                *mode = RunMode::Running;
                true
            }
            _ => false,
        });
        if resumed {
            info!("scheduler resumed");
            self.scheduler.emit(SchedulerEvent::Resumed);
        }
    }

    /// Drain the in-flight cycle, flush, halt.
    pub fn stop(&self) {
        self.mode.send_replace(RunMode::Stopping);
    }

    /// Run the next cycle now instead of waiting for the tick.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    pub async fn status(&self) -> StatusSnapshot {
        StatusSnapshot::collect(&self.scheduler, self.mode()).await
    }
}

pub fn spawn(
    scheduler: Arc<Scheduler>,
    options: DaemonOptions,
) -> (SchedulerHandle, JoinHandle<Result<()>>) {
    let initial = if options.start_paused {
        RunMode::Paused
    } else {
        RunMode::Running
    };
    let (mode, _) = watch::channel(initial);
    let handle = SchedulerHandle {
        scheduler,
        mode: Arc::new(mode),
        trigger: Arc::new(Notify::new()),
    };
    let task = tokio::spawn(run_loop(handle.clone(), options));
    (handle, task)
}

async fn run_loop(handle: SchedulerHandle, options: DaemonOptions) -> Result<()> {
    let scheduler = handle.scheduler.clone();
    let mut mode = handle.mode.subscribe();
    let mut completed = 0u64;
    info!(
        tick_secs = options.tick_interval.as_secs_f64(),
        max_cycles = options.max_cycles,
        "scheduler loop started"
    );

    let outcome: Result<()> = loop {
        let current = *mode.borrow_and_update();
        match current {
            RunMode::Stopping => break Ok(()),
            RunMode::Paused => {
                if mode.changed().await.is_err() {
                    break Ok(());
                }
                continue;
            }
            RunMode::Running => {}
        }
        if options.max_cycles.is_some_and(|max| completed >= max) {
            info!(completed, "cycle budget reached");
            break Ok(());
        }

        let mut follow_up = false;
        match scheduler.run_cycle().await {
            Ok(report) => {
                completed += 1;
                follow_up = report.wants_follow_up();
            }
            Err(err) if err.is_fatal() => {
                error!(error = %err, "fatal scheduler error, stopping");
                break Err(anyhow!(err));
            }
            Err(err) => warn!(error = %err, "cycle failed"),
        }
        if follow_up {
            debug!("activity requested a follow-up cycle");
            continue;
        }

        tokio::select! {
            _ = tokio::time::sleep(options.tick_interval) => {}
            _ = handle.trigger.notified() => debug!("cycle triggered"),
            changed = mode.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
            }
        }
    };

    let flushed = scheduler.shutdown().await;
    scheduler.emit(SchedulerEvent::Stopped);
    info!(completed, "scheduler loop stopped");
    outcome?;
    flushed.context("final snapshot flush failed")?;
    Ok(())
}

/// How a process opens the snapshot store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreAccess {
    /// Hold the writer lock, repair on load, flush after every mutation.
    Exclusive,
    /// No lock and no writes; the view is whatever was last flushed.
    ReadOnly,
}

/// Lock the store, load the durable snapshot, build the registry from
/// config, and wire up a scheduler with persistence.  Fails while another
/// process owns the store.
pub async fn bootstrap(
    config: &AppConfig,
    executor: Arc<dyn ActivityExecutor>,
    ranking: Arc<dyn RankingService>,
) -> Result<Arc<Scheduler>> {
    open_store(config, executor, ranking, StoreAccess::Exclusive).await
}

/// A scheduler over the last flushed snapshot that never writes it back.
/// Safe to use while a daemon owns the store.
pub async fn open_read_only(config: &AppConfig) -> Result<Arc<Scheduler>> {
    open_store(
        config,
        Arc::new(DryRunExecutor),
        Arc::new(UnavailableRanking),
        StoreAccess::ReadOnly,
    )
    .await
}

pub async fn open_store(
    config: &AppConfig,
    executor: Arc<dyn ActivityExecutor>,
    ranking: Arc<dyn RankingService>,
    access: StoreAccess,
) -> Result<Arc<Scheduler>> {
    let path = config.memory_file();
    let manager =
        PersistenceManager::new(&path).with_empty_fallback(config.persistence.allow_empty_fallback);
    let lock = match access {
        StoreAccess::Exclusive => Some(manager.try_lock().map_err(|err| {
            let hint = match &err {
                MemoryError::Locked(_) => format!(
                    "{} is in use by another being process; stop it first",
                    path.display()
                ),
                _ => format!("failed to lock {}", path.display()),
            };
            anyhow::Error::new(err).context(hint)
        })?),
        StoreAccess::ReadOnly => None,
    };
    let loaded = match access {
        StoreAccess::Exclusive => manager.load(),
        StoreAccess::ReadOnly => manager.inspect(),
    }
    .with_context(|| format!("failed to load snapshot {}", path.display()))?;
    match &loaded {
        Loaded::Fresh => info!(path = %path.display(), "no snapshot found, starting fresh"),
        Loaded::Primary(_) => debug!(path = %path.display(), "snapshot loaded"),
        Loaded::Restored(_) => warn!(path = %path.display(), "snapshot restored from backup"),
        Loaded::EmptyFallback => {
            warn!(path = %path.display(), "snapshot unrecoverable, starting empty")
        }
    }

    let max = config.memory.short_term_max;
    let (state, memory) = match loaded.into_snapshot() {
        Some(snapshot) => {
            let memory = MemoryStore::restore(snapshot.memory, max)
                .map_err(|reason| anyhow!("snapshot memory is inconsistent: {reason}"))?;
            (snapshot.state, memory)
        }
        None => (
            State {
                mood: config.state.initial_mood.clone(),
                ..State::default()
            },
            MemoryStore::new(max),
        ),
    };

    let tracker = StateTracker::new(state, config.state.energy_regen_per_hour);
    if !config.agent.personality.is_empty() {
        tracker.set_personality(config.agent.personality.clone()).await;
    }

    let (mut registry, errors) = ConstraintRegistry::from_config(&config.activities);
    if !errors.is_empty() {
        warn!(rejected = errors.len(), "some activities were excluded");
    }
    registry.hydrate_last_execution(&memory);
    info!(
        activities = registry.len(),
        records = memory.stats().total,
        ?access,
        "scheduler bootstrapped"
    );

    let policy = RetryPolicy {
        max_attempts: config.persistence.max_attempts,
        initial_backoff: Duration::from_millis(config.persistence.initial_backoff_ms),
    };
    let mut scheduler = Scheduler::new(
        registry,
        tracker,
        memory,
        executor,
        SchedulerSettings::from_config(&config.scheduler),
    )
    .with_ranking(ranking);
    if let Some(lock) = lock {
        scheduler = scheduler
            .with_persistence(Arc::new(manager), policy)
            .with_store_lock(lock);
    }
    Ok(Arc::new(scheduler))
}
