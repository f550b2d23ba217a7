use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::registry::NextAvailable;
use crate::scheduler::Decision;

/// Broadcast to every [`subscribe`](crate::Scheduler::subscribe)r.  Lagging
/// receivers miss events; nothing here is needed for correctness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SchedulerEvent {
    CycleStarted { candidates: usize },
    /// No descriptor passed admission this cycle.
    NeedsNewActivity { next_available: Vec<NextAvailable> },
    Selected { activity: String, decision: Decision },
    Completed { activity: String, success: bool, record_id: Uuid },
    Paused,
    Resumed,
    Stopped,
    PersistenceFailed { error: String },
}
