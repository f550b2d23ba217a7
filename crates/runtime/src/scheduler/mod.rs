//! The activity scheduler: one cycle walks
//! `Idle → Filtering → Deciding → Dispatching → Committing → Idle`.
//!
//! Cycles are single-flight.  Committing is the only phase that mutates
//! state, the registry and memory, and it does so under the commit barrier so
//! that [`Scheduler::snapshot`] never observes a half-applied cycle.  The
//! durable snapshot is written on a background task; the next mutation waits
//! for it, so saves land in commit order.  Once a flush exhausts its retry
//! budget, every later cycle and mutation fails fatally until
//! [`Scheduler::flush_now`] succeeds.

pub mod decide;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use being_config::{ActivityConfig, SchedulerConfig};
use being_memory::{
    ActivityResult, MemoryError, MemoryRecord, MemoryStore, PersistenceManager, RecordId,
    RetryPolicy, Snapshot, State, StateDelta, StateTracker, StoreLock,
};

use crate::collaborators::{ActivityExecutor, RankingService, UnavailableRanking};
use crate::error::{ConfigError, SchedulerError};
use crate::events::SchedulerEvent;
use crate::registry::{ActivityDescriptor, ConstraintRegistry, NextAvailable};
use crate::shared_data::SharedData;

pub use decide::{Decision, FallbackReason, ScoringWeights};

/// Metadata key holding the SharedData written during dispatch.
pub const SHARED_METADATA_KEY: &str = "shared";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Filtering,
    Deciding,
    Dispatching,
    Committing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    pub capabilities: BTreeSet<String>,
    pub weights: ScoringWeights,
    pub ranking_timeout: Duration,
}

impl SchedulerSettings {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            capabilities: config
                .capabilities
                .iter()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
            weights: ScoringWeights {
                staleness_weight: config.staleness_weight,
                efficiency_weight: config.efficiency_weight,
                staleness_horizon: Duration::from_secs(config.staleness_horizon_secs),
            },
            ranking_timeout: Duration::from_millis(config.ranking_timeout_ms),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    Executed {
        activity: String,
        decision: Decision,
        record_id: RecordId,
        success: bool,
        /// The activity asked to be scheduled again without waiting a tick.
        follow_up: bool,
    },
    /// Nothing passed admission; nothing was mutated.
    EligibilityExhausted { next_available: Vec<NextAvailable> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub outcome: CycleOutcome,
    /// State once the cycle finished.
    pub state: State,
}

impl CycleReport {
    pub fn wants_follow_up(&self) -> bool {
        matches!(self.outcome, CycleOutcome::Executed { follow_up: true, .. })
    }
}

type FlushHandle = JoinHandle<being_memory::Result<()>>;

#[derive(Default)]
struct FlushSlot {
    in_flight: Option<FlushHandle>,
    /// Set when a flush failed fatally; cleared by a successful `flush_now`.
    exhausted: Option<String>,
}

impl FlushSlot {
    async fn drain(&mut self) -> Result<(), SchedulerError> {
        if let Some(reason) = &self.exhausted {
            return Err(SchedulerError::PersistenceExhausted(reason.clone()));
        }
        let Some(handle) = self.in_flight.take() else {
            return Ok(());
        };
        let outcome = match handle.await {
            Ok(result) => result.map_err(SchedulerError::from),
            Err(join) => Err(SchedulerError::FlushTask(join.to_string())),
        };
        if let Err(err) = &outcome {
            if err.is_fatal() {
                self.exhausted = Some(err.to_string());
            }
        }
        outcome
    }
}

struct Flusher {
    manager: Arc<PersistenceManager>,
    policy: RetryPolicy,
    slot: Mutex<FlushSlot>,
}

impl Flusher {
    fn spawn(&self, slot: &mut FlushSlot, snapshot: Snapshot) {
        let manager = self.manager.clone();
        let policy = self.policy;
        slot.in_flight = Some(tokio::spawn(async move {
            manager.save_with_retry(&snapshot, policy).await
        }));
    }
}

pub struct Scheduler {
    registry: RwLock<ConstraintRegistry>,
    pending_registry: Mutex<Option<ConstraintRegistry>>,
    state: StateTracker,
    memory: RwLock<MemoryStore>,
    executor: Arc<dyn ActivityExecutor>,
    ranking: Arc<dyn RankingService>,
    settings: SchedulerSettings,
    cycle_gate: Mutex<()>,
    commit_barrier: RwLock<()>,
    phase: watch::Sender<Phase>,
    events: broadcast::Sender<SchedulerEvent>,
    flusher: Option<Flusher>,
    store_lock: Option<StoreLock>,
}

impl Scheduler {
    pub fn new(
        registry: ConstraintRegistry,
        state: StateTracker,
        memory: MemoryStore,
        executor: Arc<dyn ActivityExecutor>,
        settings: SchedulerSettings,
    ) -> Self {
        let (phase, _) = watch::channel(Phase::Idle);
        let (events, _) = broadcast::channel(256);
        Self {
            registry: RwLock::new(registry),
            pending_registry: Mutex::new(None),
            state,
            memory: RwLock::new(memory),
            executor,
            ranking: Arc::new(UnavailableRanking),
            settings,
            cycle_gate: Mutex::new(()),
            commit_barrier: RwLock::new(()),
            phase,
            events,
            flusher: None,
            store_lock: None,
        }
    }

    pub fn with_ranking(mut self, ranking: Arc<dyn RankingService>) -> Self {
        self.ranking = ranking;
        self
    }

    /// Write a snapshot after every commit and on shutdown.
    pub fn with_persistence(
        mut self,
        manager: Arc<PersistenceManager>,
        policy: RetryPolicy,
    ) -> Self {
        self.flusher = Some(Flusher {
            manager,
            policy,
            slot: Mutex::new(FlushSlot::default()),
        });
        self
    }

    /// Hold the store's writer lock for as long as this scheduler lives.
    pub fn with_store_lock(mut self, lock: StoreLock) -> Self {
        self.store_lock = Some(lock);
        self
    }

    pub fn holds_store_lock(&self) -> bool {
        self.store_lock.is_some()
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    pub async fn current_state(&self) -> State {
        self.state.current().await
    }

    pub async fn memory(&self) -> RwLockReadGuard<'_, MemoryStore> {
        self.memory.read().await
    }

    pub async fn registry(&self) -> RwLockReadGuard<'_, ConstraintRegistry> {
        self.registry.read().await
    }

    pub async fn next_available(&self, now: DateTime<Utc>) -> Vec<NextAvailable> {
        self.registry.read().await.next_available(now)
    }

    /// Queue a replacement registry.  It takes effect at the start of the
    /// next cycle; run history of surviving names is kept.
    pub async fn reload(&self, registry: ConstraintRegistry) {
        *self.pending_registry.lock().await = Some(registry);
    }

    pub async fn reload_from_config(&self, entries: &[ActivityConfig]) -> Vec<ConfigError> {
        let (registry, errors) = ConstraintRegistry::from_config(entries);
        self.reload(registry).await;
        errors
    }

    pub(crate) fn emit(&self, event: SchedulerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn set_phase(&self, phase: Phase) {
        debug!(?phase, "scheduler phase");
        self.phase.send_replace(phase);
    }

    pub async fn run_cycle(&self) -> Result<CycleReport, SchedulerError> {
        self.run_cycle_at(Utc::now()).await
    }

    /// Run one full cycle as of `now`.  Waits for any cycle already running.
    /// Refuses to start while persistence is exhausted.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> Result<CycleReport, SchedulerError> {
        let _gate = self.cycle_gate.lock().await;
        if let Some(reason) = self.persistence_exhausted().await {
            warn!(%reason, "cycle refused, persistence is exhausted");
            return Err(SchedulerError::PersistenceExhausted(reason));
        }
        self.apply_pending_registry().await;
        let report = self.cycle(now).await;
        self.set_phase(Phase::Idle);
        report
    }

    async fn apply_pending_registry(&self) {
        let Some(mut fresh) = self.pending_registry.lock().await.take() else {
            return;
        };
        let mut registry = self.registry.write().await;
        fresh.carry_over_from(&registry);
        info!(before = registry.len(), after = fresh.len(), "activity registry reloaded");
        *registry = fresh;
    }

    async fn cycle(&self, now: DateTime<Utc>) -> Result<CycleReport, SchedulerError> {
        self.set_phase(Phase::Filtering);
        let state = self.state.decay_to(now).await;
        let candidates = self
            .registry
            .read()
            .await
            .candidates(now, &self.settings.capabilities, state.energy);
        info!(candidates = candidates.len(), energy = state.energy, "cycle started");
        self.emit(SchedulerEvent::CycleStarted {
            candidates: candidates.len(),
        });

        self.set_phase(Phase::Deciding);
        let picked = decide::choose(
            &candidates,
            &state,
            now,
            &self.settings.weights,
            self.ranking.as_ref(),
            self.settings.ranking_timeout,
        )
        .await;
        let Some((chosen, decision)) = picked else {
            let next_available = self.next_available(now).await;
            info!(
                soonest = next_available.first().map(|n| n.activity.as_str()),
                "no eligible activity"
            );
            self.emit(SchedulerEvent::NeedsNewActivity {
                next_available: next_available.clone(),
            });
            return Ok(CycleReport {
                started_at: now,
                outcome: CycleOutcome::EligibilityExhausted { next_available },
                state,
            });
        };
        info!(activity = %chosen.name, ?decision, "activity selected");
        self.emit(SchedulerEvent::Selected {
            activity: chosen.name.clone(),
            decision: decision.clone(),
        });

        self.set_phase(Phase::Dispatching);
        let result = self.dispatch(&chosen).await;

        let success = result.success;
        let follow_up = result.wants_follow_up();
        let (state, record_id) = self.commit(&chosen, result, now).await?;
        info!(
            activity = %chosen.name,
            success,
            energy = state.energy,
            record = %record_id,
            "cycle committed"
        );
        self.emit(SchedulerEvent::Completed {
            activity: chosen.name.clone(),
            success,
            record_id,
        });

        Ok(CycleReport {
            started_at: now,
            outcome: CycleOutcome::Executed {
                activity: chosen.name,
                decision,
                record_id,
                success,
                follow_up,
            },
            state,
        })
    }

    async fn dispatch(&self, descriptor: &ActivityDescriptor) -> ActivityResult {
        let scope = SharedData::new();
        let mut result = match self.executor.execute(descriptor, &scope).await {
            Ok(result) => result,
            Err(err) => {
                warn!(activity = %descriptor.name, error = %err, "activity execution failed");
                ActivityResult::error_result(format!("{err:#}"))
            }
        };
        let shared = scope.snapshot().await;
        if !shared.is_empty() {
            result
                .metadata
                .insert(SHARED_METADATA_KEY.to_string(), Value::Object(shared));
        }
        result
    }

    async fn commit(
        &self,
        descriptor: &ActivityDescriptor,
        result: ActivityResult,
        at: DateTime<Utc>,
    ) -> Result<(State, RecordId), SchedulerError> {
        let mut slot = self.lock_flush_slot().await;
        let prior_flush = self.settle_flush(slot.as_deref_mut()).await;

        self.set_phase(Phase::Committing);
        let cost = if result.success || descriptor.consume_on_failure {
            descriptor.energy_cost
        } else {
            0.0
        };
        let mut delta = StateDelta::consume(cost, at);
        if let Some(mood) = result.requested_mood() {
            delta = delta.with_mood(mood);
        }

        let (state, record_id, snapshot) = {
            let _barrier = self.commit_barrier.write().await;
            let state = self.state.apply(&delta).await?;
            self.registry.write().await.mark_executed(&descriptor.name, at);
            let mut memory = self.memory.write().await;
            let record_id = memory.commit_at(&descriptor.name, result, at);
            let snapshot = slot
                .is_some()
                .then(|| Snapshot::new(state.clone(), memory.export()));
            (state, record_id, snapshot)
        };

        prior_flush?;
        self.schedule_flush(slot.as_deref_mut(), snapshot);
        Ok((state, record_id))
    }

    async fn lock_flush_slot(&self) -> Option<MutexGuard<'_, FlushSlot>> {
        match &self.flusher {
            Some(flusher) => Some(flusher.slot.lock().await),
            None => None,
        }
    }

    /// Reason the last flush exhausted its retries, if it has not recovered.
    pub async fn persistence_exhausted(&self) -> Option<String> {
        let flusher = self.flusher.as_ref()?;
        flusher.slot.lock().await.exhausted.clone()
    }

    /// Wait for the previous background flush.  A fresh failure is reported
    /// here; an already exhausted slot just fails again.
    async fn settle_flush(&self, slot: Option<&mut FlushSlot>) -> Result<(), SchedulerError> {
        let Some(slot) = slot else {
            return Ok(());
        };
        let outcome = slot.drain().await;
        if let Err(err) = &outcome {
            if !matches!(err, SchedulerError::PersistenceExhausted(_)) {
                error!(error = %err, "snapshot flush failed");
                self.emit(SchedulerEvent::PersistenceFailed {
                    error: err.to_string(),
                });
            }
        }
        outcome
    }

    fn schedule_flush(&self, slot: Option<&mut FlushSlot>, snapshot: Option<Snapshot>) {
        if let (Some(flusher), Some(slot), Some(snapshot)) = (&self.flusher, slot, snapshot) {
            flusher.spawn(slot, snapshot);
        }
    }

    /// Mutate memory outside a cycle (chat transport) and flush afterwards.
    async fn mutate_memory<T>(
        &self,
        apply: impl FnOnce(&mut MemoryStore) -> Result<T, MemoryError>,
    ) -> Result<T, SchedulerError> {
        let mut slot = self.lock_flush_slot().await;
        self.settle_flush(slot.as_deref_mut()).await?;

        let (value, snapshot) = {
            let _barrier = self.commit_barrier.write().await;
            let state = self.state.current().await;
            let mut memory = self.memory.write().await;
            let value = apply(&mut *memory)?;
            let snapshot = slot.is_some().then(|| Snapshot::new(state, memory.export()));
            (value, snapshot)
        };

        self.schedule_flush(slot.as_deref_mut(), snapshot);
        Ok(value)
    }

    pub async fn add_chat_message(
        &self,
        sender: &str,
        message: &str,
    ) -> Result<RecordId, SchedulerError> {
        let id = self
            .mutate_memory(|memory| Ok(memory.add_chat_message(sender, message)))
            .await?;
        info!(record = %id, sender, "chat message received");
        Ok(id)
    }

    pub async fn mark_answered(
        &self,
        id: RecordId,
        response: &str,
    ) -> Result<MemoryRecord, SchedulerError> {
        let record = self
            .mutate_memory(|memory| {
                memory
                    .mark_answered(&id, response, Utc::now())
                    .map(MemoryRecord::clone)
            })
            .await?;
        info!(record = %id, status = ?record.status, "chat message answered");
        Ok(record)
    }

    /// Read state and memory together, never between the halves of a commit.
    pub async fn view<T>(&self, read: impl FnOnce(&State, &MemoryStore) -> T) -> T {
        let _barrier = self.commit_barrier.read().await;
        let state = self.state.current().await;
        let memory = self.memory.read().await;
        read(&state, &*memory)
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.view(|state, memory| Snapshot::new(state.clone(), memory.export()))
            .await
    }

    /// Wait for any background flush, then write the current snapshot.  A
    /// successful write clears an exhausted persistence state.
    pub async fn flush_now(&self) -> Result<(), SchedulerError> {
        let Some(flusher) = &self.flusher else {
            return Ok(());
        };
        let mut slot = flusher.slot.lock().await;
        let prior = self.settle_flush(Some(&mut *slot)).await;
        let snapshot = self.snapshot().await;
        let saved = flusher
            .manager
            .save_with_retry(&snapshot, flusher.policy)
            .await
            .map_err(SchedulerError::from);
        if let Err(err) = &saved {
            error!(error = %err, "final snapshot flush failed");
            self.emit(SchedulerEvent::PersistenceFailed {
                error: err.to_string(),
            });
        } else {
            slot.exhausted = None;
            if prior.is_err() {
                info!("snapshot recovered after an earlier flush failure");
            }
        }
        saved
    }

    /// Let the in-flight cycle finish, then flush.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        let _gate = self.cycle_gate.lock().await;
        self.flush_now().await
    }
}
