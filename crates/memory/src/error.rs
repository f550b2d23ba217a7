use std::path::PathBuf;

use thiserror::Error;

use crate::schema::RecordId;

#[derive(Debug, Error)]
pub enum MemoryError {
    /// A malformed state delta or configuration value.  State is unchanged.
    #[error("config error: {0}")]
    Config(String),

    #[error("no record with id {0}")]
    UnknownRecord(RecordId),

    #[error("record {0} is not a chat record")]
    NotChat(RecordId),

    #[error("chat record {0} is already answered")]
    AlreadyAnswered(RecordId),

    /// Writing the snapshot kept failing after the whole retry budget.
    #[error("persistence failed after {attempts} attempts: {source}")]
    Persistence {
        attempts: u32,
        #[source]
        source: Box<MemoryError>,
    },

    /// The durable snapshot failed validation and no valid backup exists.
    #[error("snapshot {} is corrupt: {reason}", path.display())]
    Corruption { path: PathBuf, reason: String },

    /// Another writer holds the store's exclusive lock.
    #[error("snapshot store is locked by another process ({})", .0.display())]
    Locked(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MemoryError>;
