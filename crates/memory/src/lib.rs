pub mod error;
pub mod persistence;
pub mod schema;
pub mod state;
pub mod store;

pub use error::{MemoryError, Result};
pub use persistence::{
    Loaded, PersistenceManager, RetryPolicy, SNAPSHOT_VERSION, Snapshot, StoreLock,
};
pub use schema::{
    ActivityResult, CHAT_CATEGORY, ChatMessage, ChatResponse, MOOD_KEY, MemoryRecord, RecordId,
    RecordPayload, RecordStatus, SCHEDULE_AGAIN_KEY,
};
pub use state::{State, StateDelta, StateTracker};
pub use store::{MemoryImage, MemoryStats, MemoryStore};
