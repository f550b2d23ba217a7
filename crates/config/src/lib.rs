use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    /// Identifies a finished setup.  The daemon refuses to run cycles until
    /// this is `true`.
    pub setup_complete: bool,
    /// Personality weights (e.g. `creativity`, `friendliness`) used by the
    /// scheduler to bias scoring towards activities with matching factors.
    pub personality: BTreeMap<String, f64>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "Digital Being".to_string(),
            setup_complete: true,
            personality: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between scheduling cycles when no follow-up was requested.
    pub tick_interval_secs: u64,
    /// Upper bound on how long the ranking service may take to break a tie.
    pub ranking_timeout_ms: u64,
    /// Staleness saturates after this many seconds since the last run.
    pub staleness_horizon_secs: u64,
    pub staleness_weight: f64,
    pub efficiency_weight: f64,
    /// Capabilities ("skills") currently available to activities.
    pub capabilities: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 5,
            ranking_timeout_ms: 2_000,
            staleness_horizon_secs: 86_400,
            staleness_weight: 0.6,
            efficiency_weight: 0.4,
            capabilities: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Passive energy regeneration, in energy units per hour of wall time.
    pub energy_regen_per_hour: f64,
    /// Mood assigned when no snapshot exists yet.
    pub initial_mood: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            energy_regen_per_hour: 0.1,
            initial_mood: "neutral".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Directory holding `memory.json` and its `.bak` / `.tmp` siblings.
    pub storage_dir: String,
    /// Maximum number of records kept in the short-term buffer.  Older
    /// records are consolidated into the long-term archive, never dropped.
    pub short_term_max: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            storage_dir: ".being/storage".to_string(),
            short_term_max: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Attempts per flush before the daemon gives up and stops.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on every further attempt.
    pub initial_backoff_ms: u64,
    /// Start from an empty snapshot when the durable file is corrupt and no
    /// valid backup exists.  When `false` such a start-up fails instead.
    pub allow_empty_fallback: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 200,
            allow_empty_fallback: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// One `[[activities]]` entry.  Validation happens when the runtime builds its
/// registry; this layer only carries the raw values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityConfig {
    pub name: String,
    #[serde(default = "default_energy_cost")]
    pub energy_cost: f64,
    #[serde(default)]
    pub cooldown_secs: f64,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Whether a failed run still consumes its energy cost.
    #[serde(default = "default_true")]
    pub consume_on_failure: bool,
    #[serde(default)]
    pub creativity_factor: f64,
    #[serde(default)]
    pub social_factor: f64,
}

fn default_energy_cost() -> f64 {
    0.2
}

fn default_true() -> bool {
    true
}

impl ActivityConfig {
    pub fn new(name: impl Into<String>, energy_cost: f64, cooldown_secs: f64) -> Self {
        Self {
            name: name.into(),
            energy_cost,
            cooldown_secs,
            required_capabilities: vec![],
            enabled: true,
            consume_on_failure: true,
            creativity_factor: 0.0,
            social_factor: 0.0,
        }
    }
}

fn default_activities() -> Vec<ActivityConfig> {
    vec![
        ActivityConfig::new("CheckPendingMessages", 0.3, 60.0),
        ActivityConfig::new("Nap", 0.0, 1800.0),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub scheduler: SchedulerConfig,
    pub state: StateConfig,
    pub memory: MemoryConfig,
    pub persistence: PersistenceConfig,
    pub telemetry: TelemetryConfig,
    pub activities: Vec<ActivityConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            agent: AgentConfig::default(),
            scheduler: SchedulerConfig::default(),
            state: StateConfig::default(),
            memory: MemoryConfig::default(),
            persistence: PersistenceConfig::default(),
            telemetry: TelemetryConfig::default(),
            activities: default_activities(),
        }
    }
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(dir) = env::var("BEING_STORAGE_DIR") {
            if !dir.is_empty() {
                config.memory.storage_dir = dir;
            }
        }

        if let Ok(level) = env::var("BEING_LOG_LEVEL") {
            if !level.is_empty() {
                config.telemetry.log_level = level;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    pub fn memory_file(&self) -> std::path::PathBuf {
        Path::new(&self.memory.storage_dir).join("memory.json")
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.agent.name, "Digital Being");
        assert_eq!(cfg.memory.short_term_max, 100);
        assert_eq!(cfg.memory.storage_dir, ".being/storage");
        assert_eq!(cfg.scheduler.ranking_timeout_ms, 2_000);
        assert_eq!(cfg.persistence.max_attempts, 5);
        assert!(!cfg.persistence.allow_empty_fallback);
        assert!((cfg.state.energy_regen_per_hour - 0.1).abs() < f64::EPSILON);
        assert_eq!(cfg.activities.len(), 2);
    }

    #[test]
    fn load_from_missing_file_returns_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = AppConfig::load_from(dir.path().join("nonexistent.toml")).unwrap();
        assert_eq!(cfg.agent.name, "Digital Being");
        assert_eq!(cfg.telemetry.log_level, "info");
    }

    #[test]
    fn load_from_valid_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("being.toml");
        fs::write(
            &path,
            r#"
[agent]
name = "Lem"

[agent.personality]
creativity = 0.8

[scheduler]
capabilities = ["openai_chat", "web_scraping"]
ranking_timeout_ms = 500

[[activities]]
name = "fetch_news"
energy_cost = 0.3
cooldown_secs = 1800
required_capabilities = ["web_scraping"]

[[activities]]
name = "draw"
energy_cost = 0.6
cooldown_secs = 1000
enabled = false
creativity_factor = 1.5
"#,
        )
        .unwrap();

        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.agent.name, "Lem");
        assert_eq!(cfg.agent.personality.get("creativity"), Some(&0.8));
        assert_eq!(cfg.scheduler.capabilities, vec!["openai_chat", "web_scraping"]);
        assert_eq!(cfg.scheduler.ranking_timeout_ms, 500);
        assert_eq!(cfg.activities.len(), 2);
        assert_eq!(cfg.activities[0].required_capabilities, vec!["web_scraping"]);
        assert!(cfg.activities[0].consume_on_failure);
        assert!(!cfg.activities[1].enabled);
        assert!((cfg.activities[1].creativity_factor - 1.5).abs() < f64::EPSILON);
        // Unspecified sections keep their defaults.
        assert_eq!(cfg.memory.short_term_max, 100);
    }

    #[test]
    fn activity_entry_defaults_cost_and_flags() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.toml");
        fs::write(
            &path,
            r#"
[[activities]]
name = "Test"
"#,
        )
        .unwrap();

        let cfg = AppConfig::load_from(&path).unwrap();
        let entry = &cfg.activities[0];
        assert!((entry.energy_cost - 0.2).abs() < f64::EPSILON);
        assert_eq!(entry.cooldown_secs, 0.0);
        assert!(entry.enabled);
        assert!(entry.required_capabilities.is_empty());
    }

    #[test]
    fn load_from_invalid_toml_returns_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "this is not valid toml {{{{").unwrap();
        assert!(AppConfig::load_from(&path).is_err());
    }

    #[test]
    fn save_and_reload_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub/being.toml");

        let mut cfg = AppConfig::default();
        cfg.agent.name = "RoundTrip".to_string();
        cfg.memory.short_term_max = 7;
        cfg.activities = vec![ActivityConfig::new("A", 0.1, 300.0)];

        cfg.save_to(&path).unwrap();
        assert!(path.exists());

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.agent.name, "RoundTrip");
        assert_eq!(loaded.memory.short_term_max, 7);
        assert_eq!(loaded.activities, cfg.activities);
    }

    #[test]
    fn memory_file_lives_in_storage_dir() {
        let mut cfg = AppConfig::default();
        cfg.memory.storage_dir = "/tmp/being".to_string();
        assert_eq!(cfg.memory_file(), Path::new("/tmp/being/memory.json"));
    }

    #[test]
    fn env_storage_dir_overrides_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("env.toml");
        fs::write(
            &path,
            r#"
[memory]
storage_dir = "from-file"
"#,
        )
        .unwrap();

        // SAFETY: test is single-threaded for this env var.
        unsafe { env::set_var("BEING_STORAGE_DIR", "from-env") };
        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.memory.storage_dir, "from-env");
        unsafe { env::remove_var("BEING_STORAGE_DIR") };
    }
}
