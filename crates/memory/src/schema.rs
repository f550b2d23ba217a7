use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub type RecordId = Uuid;

/// Category under which conversational records are filed.
pub const CHAT_CATEGORY: &str = "chat";

/// Metadata key an activity sets to ask for another pass right away.
pub const SCHEDULE_AGAIN_KEY: &str = "schedule_again";

/// Metadata key an activity sets to change the agent's mood on commit.
pub const MOOD_KEY: &str = "mood";

/// Lifecycle of a stored record.
///
/// | Status     | Meaning                                                  |
/// |------------|----------------------------------------------------------|
/// | `Pending`  | Chat message waiting for a reply                         |
/// | `Answered` | Chat message with a response attached                    |
/// | `Archived` | Settled; every activity record starts here               |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Pending,
    Answered,
    Archived,
}

/// Outcome of one executed activity.  Created once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityResult {
    pub success: bool,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl ActivityResult {
    pub fn success_result(data: Value) -> Self {
        Self {
            success: true,
            data,
            error: None,
            metadata: Map::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn error_result(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Value::Null,
            error: Some(error.into()),
            metadata: Map::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// True when the activity asked for another scheduling pass immediately.
    pub fn wants_follow_up(&self) -> bool {
        self.metadata
            .get(SCHEDULE_AGAIN_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn requested_mood(&self) -> Option<&str> {
        self.metadata.get(MOOD_KEY).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub message: String,
    pub answered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordPayload {
    Activity(ActivityResult),
    Chat {
        message: ChatMessage,
        #[serde(default)]
        response: Option<ChatResponse>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: RecordId,
    pub category: String,
    pub timestamp: DateTime<Utc>,
    pub payload: RecordPayload,
    pub status: RecordStatus,
}

impl MemoryRecord {
    pub fn activity(category: impl Into<String>, result: ActivityResult) -> Self {
        Self {
            id: Uuid::new_v4(),
            category: category.into(),
            timestamp: Utc::now(),
            payload: RecordPayload::Activity(result),
            status: RecordStatus::Archived,
        }
    }

    pub fn chat(sender: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            category: CHAT_CATEGORY.to_string(),
            timestamp: Utc::now(),
            payload: RecordPayload::Chat {
                message: ChatMessage {
                    sender: sender.into(),
                    message: message.into(),
                },
                response: None,
            },
            status: RecordStatus::Pending,
        }
    }

    pub fn is_chat(&self) -> bool {
        matches!(self.payload, RecordPayload::Chat { .. })
    }

    pub fn activity_result(&self) -> Option<&ActivityResult> {
        match &self.payload {
            RecordPayload::Activity(result) => Some(result),
            RecordPayload::Chat { .. } => None,
        }
    }

    /// First 8 characters of the UUID, used as a compact display identifier.
    pub fn id_short(&self) -> String {
        self.id.to_string()[..8].to_string()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn activity_records_start_archived() {
        let record = MemoryRecord::activity("nap", ActivityResult::success_result(json!({})));
        assert_eq!(record.status, RecordStatus::Archived);
        assert!(!record.is_chat());
        assert!(record.activity_result().is_some());
    }

    #[test]
    fn chat_records_start_pending() {
        let record = MemoryRecord::chat("user", "hello");
        assert_eq!(record.status, RecordStatus::Pending);
        assert_eq!(record.category, CHAT_CATEGORY);
        assert!(record.is_chat());
    }

    #[test]
    fn follow_up_and_mood_come_from_metadata() {
        let result = ActivityResult::success_result(Value::Null)
            .with_metadata(SCHEDULE_AGAIN_KEY, json!(true))
            .with_metadata(MOOD_KEY, json!("curious"));
        assert!(result.wants_follow_up());
        assert_eq!(result.requested_mood(), Some("curious"));

        let plain = ActivityResult::error_result("boom");
        assert!(!plain.wants_follow_up());
        assert_eq!(plain.requested_mood(), None);
        assert_eq!(plain.error.as_deref(), Some("boom"));
    }

    #[test]
    fn payload_is_tagged_by_kind() {
        let record = MemoryRecord::chat("user", "hi");
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["payload"]["kind"], "chat");
        assert_eq!(value["status"], "pending");
    }
}
