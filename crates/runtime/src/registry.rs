//! Activity descriptors and the admission checks applied to them.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use being_config::ActivityConfig;
use being_memory::MemoryStore;

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityDescriptor {
    pub name: String,
    pub energy_cost: f64,
    pub cooldown: Duration,
    pub required_capabilities: BTreeSet<String>,
    /// Set only by the scheduler, once per attempted run.
    pub last_execution: Option<DateTime<Utc>>,
    pub consume_on_failure: bool,
    pub creativity_factor: f64,
    pub social_factor: f64,
}

impl ActivityDescriptor {
    pub fn new(name: impl Into<String>, energy_cost: f64, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            energy_cost,
            cooldown,
            required_capabilities: BTreeSet::new(),
            last_execution: None,
            consume_on_failure: true,
            creativity_factor: 0.0,
            social_factor: 0.0,
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.insert(capability.into());
        self
    }

    pub fn with_last_execution(mut self, at: DateTime<Utc>) -> Self {
        self.last_execution = Some(at);
        self
    }

    /// Time since the last run, or `None` when it never ran.  A last run in
    /// the future (clock moved backwards) counts as zero elapsed.
    pub fn since_last(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.last_execution
            .map(|last| (now - last).to_std().unwrap_or_default())
    }

    pub fn cooldown_remaining(&self, now: DateTime<Utc>) -> Duration {
        match self.since_last(now) {
            Some(elapsed) => self.cooldown.saturating_sub(elapsed),
            None => Duration::ZERO,
        }
    }

    fn try_from_config(entry: &ActivityConfig) -> Result<Self, ConfigError> {
        let name = entry.name.trim();
        if name.is_empty() {
            return Err(ConfigError::new(&entry.name, "name must not be empty"));
        }
        if !entry.energy_cost.is_finite() || entry.energy_cost < 0.0 {
            return Err(ConfigError::new(
                name,
                format!("energy_cost must be a non-negative number, got {}", entry.energy_cost),
            ));
        }
        let cooldown = Duration::try_from_secs_f64(entry.cooldown_secs).map_err(|_| {
            ConfigError::new(
                name,
                format!("cooldown_secs must be a non-negative number, got {}", entry.cooldown_secs),
            )
        })?;
        for (label, factor) in [
            ("creativity_factor", entry.creativity_factor),
            ("social_factor", entry.social_factor),
        ] {
            if !factor.is_finite() || factor < 0.0 {
                return Err(ConfigError::new(
                    name,
                    format!("{label} must be a non-negative number, got {factor}"),
                ));
            }
        }

        Ok(Self {
            name: name.to_string(),
            energy_cost: entry.energy_cost,
            cooldown,
            required_capabilities: entry
                .required_capabilities
                .iter()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
            last_execution: None,
            consume_on_failure: entry.consume_on_failure,
            creativity_factor: entry.creativity_factor,
            social_factor: entry.social_factor,
        })
    }
}

/// Admission check, evaluated in order: capabilities, energy, cooldown.
pub fn eligible(
    descriptor: &ActivityDescriptor,
    now: DateTime<Utc>,
    capabilities: &BTreeSet<String>,
    energy: f64,
) -> bool {
    if !descriptor.required_capabilities.is_subset(capabilities) {
        return false;
    }
    if energy < descriptor.energy_cost {
        return false;
    }
    match descriptor.since_last(now) {
        Some(elapsed) => elapsed >= descriptor.cooldown,
        None => true,
    }
}

/// When one descriptor becomes cooldown-eligible again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextAvailable {
    pub activity: String,
    pub available_in_secs: f64,
    pub next_available_at: DateTime<Utc>,
    pub cooldown_secs: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConstraintRegistry {
    descriptors: BTreeMap<String, ActivityDescriptor>,
}

impl ConstraintRegistry {
    /// Build a registry, rejecting duplicate names.
    pub fn new(
        descriptors: impl IntoIterator<Item = ActivityDescriptor>,
    ) -> (Self, Vec<ConfigError>) {
        let mut registry = Self::default();
        let mut errors = Vec::new();
        for descriptor in descriptors {
            if registry.descriptors.contains_key(&descriptor.name) {
                errors.push(ConfigError::new(&descriptor.name, "duplicate activity name"));
                continue;
            }
            registry.descriptors.insert(descriptor.name.clone(), descriptor);
        }
        (registry, errors)
    }

    /// Build from raw config entries.  Disabled entries are skipped; malformed
    /// ones are logged, returned, and excluded.
    pub fn from_config(entries: &[ActivityConfig]) -> (Self, Vec<ConfigError>) {
        let mut errors = Vec::new();
        let mut valid = Vec::new();
        for entry in entries {
            if !entry.enabled {
                debug!(activity = %entry.name, "skipping disabled activity");
                continue;
            }
            match ActivityDescriptor::try_from_config(entry) {
                Ok(descriptor) => valid.push(descriptor),
                Err(err) => errors.push(err),
            }
        }
        let (registry, duplicates) = Self::new(valid);
        errors.extend(duplicates);
        for err in &errors {
            warn!(%err, "excluding activity from registry");
        }
        (registry, errors)
    }

    pub fn get(&self, name: &str) -> Option<&ActivityDescriptor> {
        self.descriptors.get(name)
    }

    /// Descriptors in name order.
    pub fn descriptors(&self) -> impl Iterator<Item = &ActivityDescriptor> {
        self.descriptors.values()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn candidates(
        &self,
        now: DateTime<Utc>,
        capabilities: &BTreeSet<String>,
        energy: f64,
    ) -> Vec<ActivityDescriptor> {
        self.descriptors()
            .filter(|descriptor| eligible(descriptor, now, capabilities, energy))
            .cloned()
            .collect()
    }

    pub fn mark_executed(&mut self, name: &str, at: DateTime<Utc>) {
        if let Some(descriptor) = self.descriptors.get_mut(name) {
            descriptor.last_execution = Some(at);
        }
    }

    /// Seed `last_execution` from the newest record of each activity so that
    /// cooldowns hold across restarts.
    pub fn hydrate_last_execution(&mut self, memory: &MemoryStore) {
        for descriptor in self.descriptors.values_mut() {
            if let Some(at) = memory.last_execution_of(&descriptor.name) {
                if descriptor.last_execution.is_none_or(|known| at > known) {
                    descriptor.last_execution = Some(at);
                }
            }
        }
    }

    /// Keep the run history of descriptors that survive a reload.
    pub fn carry_over_from(&mut self, previous: &Self) {
        for descriptor in self.descriptors.values_mut() {
            if descriptor.last_execution.is_none() {
                descriptor.last_execution = previous
                    .get(&descriptor.name)
                    .and_then(|old| old.last_execution);
            }
        }
    }

    /// Cooldown status of every descriptor, soonest first.
    pub fn next_available(&self, now: DateTime<Utc>) -> Vec<NextAvailable> {
        let mut entries = self
            .descriptors()
            .map(|descriptor| {
                let remaining = descriptor.cooldown_remaining(now);
                let next_at = chrono::TimeDelta::from_std(remaining)
                    .map(|delta| now + delta)
                    .unwrap_or(now);
                NextAvailable {
                    activity: descriptor.name.clone(),
                    available_in_secs: remaining.as_secs_f64(),
                    next_available_at: next_at,
                    cooldown_secs: descriptor.cooldown.as_secs_f64(),
                }
            })
            .collect::<Vec<_>>();
        entries.sort_by(|left, right| left.available_in_secs.total_cmp(&right.available_in_secs));
        entries
    }
}
