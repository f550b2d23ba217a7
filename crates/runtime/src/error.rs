use thiserror::Error;

use being_memory::MemoryError;

/// A descriptor entry that was rejected while building the registry.  The
/// entry is excluded; the rest of the registry is unaffected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("activity '{name}': {reason}")]
pub struct ConfigError {
    pub name: String,
    pub reason: String,
}

impl ConfigError {
    pub fn new(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("background flush task failed: {0}")]
    FlushTask(String),

    /// An earlier flush exhausted its retries and nothing has been written
    /// since.
    #[error("persistence is exhausted: {0}")]
    PersistenceExhausted(String),
}

impl SchedulerError {
    /// Only exhausted persistence may take the scheduling loop down.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Memory(MemoryError::Persistence { .. })
                | Self::FlushTask(_)
                | Self::PersistenceExhausted(_)
        )
    }
}
