//! Mutable resource state of the agent (energy, mood, timestamps).
//!
//! Exactly one [`StateTracker`] exists per running agent.  Every mutation goes
//! through it and is serialized by its lock; readers get cloned snapshots.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{MemoryError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    /// Bounded to `[0, 1]`.
    pub energy: f64,
    pub mood: String,
    pub last_activity_timestamp: Option<DateTime<Utc>>,
    /// When passive regeneration was last applied.
    #[serde(default)]
    pub last_decay_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub personality: BTreeMap<String, f64>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            energy: 1.0,
            mood: "neutral".to_string(),
            last_activity_timestamp: None,
            last_decay_at: None,
            personality: BTreeMap::new(),
        }
    }
}

impl State {
    pub fn trait_weight(&self, name: &str) -> f64 {
        self.personality.get(name).copied().unwrap_or(0.5)
    }
}

/// Change merged into [`State`] by [`StateTracker::apply`].
#[derive(Debug, Clone, PartialEq)]
pub struct StateDelta {
    pub energy: f64,
    pub mood: Option<String>,
    pub at: DateTime<Utc>,
}

impl StateDelta {
    pub fn consume(cost: f64, at: DateTime<Utc>) -> Self {
        Self {
            energy: -cost,
            mood: None,
            at,
        }
    }

    pub fn with_mood(mut self, mood: impl Into<String>) -> Self {
        self.mood = Some(mood.into());
        self
    }
}

/// Energy after `elapsed` of passive regeneration, capped at 1.0.
pub fn regenerate(energy: f64, regen_per_hour: f64, elapsed: Duration) -> f64 {
    let gained = regen_per_hour * elapsed.as_secs_f64() / 3600.0;
    (energy + gained).clamp(0.0, 1.0)
}

pub struct StateTracker {
    inner: RwLock<State>,
    regen_per_hour: f64,
}

impl StateTracker {
    pub fn new(state: State, regen_per_hour: f64) -> Self {
        Self {
            inner: RwLock::new(state),
            regen_per_hour: regen_per_hour.max(0.0),
        }
    }

    pub async fn current(&self) -> State {
        self.inner.read().await.clone()
    }

    /// Merge `delta` atomically.  A non-finite energy delta is rejected and
    /// leaves the state untouched.
    pub async fn apply(&self, delta: &StateDelta) -> Result<State> {
        if !delta.energy.is_finite() {
            return Err(MemoryError::Config(format!(
                "energy delta must be finite, got {}",
                delta.energy
            )));
        }

        let mut state = self.inner.write().await;
        let energy = (state.energy + delta.energy).clamp(0.0, 1.0);
        debug!(before = state.energy, after = energy, "applying state delta");
        state.energy = energy;
        if let Some(mood) = &delta.mood {
            state.mood = mood.clone();
        }
        state.last_activity_timestamp = Some(delta.at);
        Ok(state.clone())
    }

    /// Apply passive drift for `elapsed` wall time.
    pub async fn decay(&self, elapsed: Duration) -> State {
        let mut state = self.inner.write().await;
        state.energy = regenerate(state.energy, self.regen_per_hour, elapsed);
        state.clone()
    }

    /// Apply drift for the time since the previous call and remember `now`.
    /// The very first call only records the timestamp.
    pub async fn decay_to(&self, now: DateTime<Utc>) -> State {
        let mut state = self.inner.write().await;
        if let Some(previous) = state.last_decay_at {
            let elapsed = (now - previous).to_std().unwrap_or_default();
            state.energy = regenerate(state.energy, self.regen_per_hour, elapsed);
        }
        state.last_decay_at = Some(now);
        state.clone()
    }

    pub async fn set_personality(&self, personality: BTreeMap<String, f64>) {
        self.inner.write().await.personality = personality;
    }

    pub async fn set_mood(&self, mood: impl Into<String>) {
        self.inner.write().await.mood = mood.into();
    }
}
