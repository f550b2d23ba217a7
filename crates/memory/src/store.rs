//! Record store: bounded short-term buffer, per-category long-term archive and
//! the chat ledger.
//!
//! Every record is held exactly once in `records`.  The buffer, the archive
//! and the ledger are ordered id lists over that set, so a chat record that
//! moves from short-term to long-term is never duplicated.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MemoryError, Result};
use crate::schema::{
    ActivityResult, ChatResponse, MemoryRecord, RecordId, RecordPayload, RecordStatus,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub total: usize,
    pub short_term: usize,
    pub long_term: usize,
    pub pending_chat: usize,
    pub categories: usize,
}

/// Serializable, expanded form of a [`MemoryStore`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryImage {
    pub short_term: Vec<MemoryRecord>,
    pub long_term: BTreeMap<String, Vec<MemoryRecord>>,
    pub chat_ledger: Vec<RecordId>,
}

impl MemoryImage {
    pub fn len(&self) -> usize {
        self.short_term.len() + self.long_term.values().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Structural checks: ids are unique, archived records sit under their
    /// own category, every record's status agrees with its payload, and the
    /// chat ledger lists every chat record exactly once.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let mut seen = HashSet::new();
        let archived = self
            .long_term
            .iter()
            .flat_map(|(category, records)| {
                records.iter().map(move |record| (Some(category), record))
            });
        let buffered = self.short_term.iter().map(|record| (None, record));

        let mut chats = HashSet::new();
        for (category, record) in archived.chain(buffered) {
            if !seen.insert(record.id) {
                return Err(format!("duplicate record id {}", record.id));
            }
            if let Some(category) = category {
                if &record.category != category {
                    return Err(format!(
                        "record {} filed under '{category}' but belongs to '{}'",
                        record.id, record.category
                    ));
                }
            }
            check_lifecycle(record)?;
            if record.is_chat() {
                chats.insert(record.id);
            }
        }

        let mut listed = HashSet::new();
        for id in &self.chat_ledger {
            if !seen.contains(id) {
                return Err(format!("chat ledger entry {id} has no record"));
            }
            if !chats.contains(id) {
                return Err(format!("chat ledger entry {id} is not a chat record"));
            }
            if !listed.insert(*id) {
                return Err(format!("chat ledger lists {id} twice"));
            }
        }
        if listed.len() != chats.len() {
            return Err("chat record missing from the ledger".to_string());
        }
        Ok(())
    }
}

/// Activity records are always archived.  A chat record is pending exactly
/// when it has no response.
fn check_lifecycle(record: &MemoryRecord) -> std::result::Result<(), String> {
    match &record.payload {
        RecordPayload::Activity(_) if record.status != RecordStatus::Archived => Err(format!(
            "activity record {} has status {:?}",
            record.id, record.status
        )),
        RecordPayload::Chat { response, .. }
            if response.is_none() != (record.status == RecordStatus::Pending) =>
        {
            Err(format!(
                "chat record {} is {:?} but {} a response",
                record.id,
                record.status,
                if response.is_some() { "has" } else { "lacks" }
            ))
        }
        _ => Ok(()),
    }
}

#[derive(Debug)]
pub struct MemoryStore {
    records: HashMap<RecordId, MemoryRecord>,
    short_term: VecDeque<RecordId>,
    long_term: BTreeMap<String, Vec<RecordId>>,
    chat_ledger: Vec<RecordId>,
    last_by_category: HashMap<String, DateTime<Utc>>,
    max_short_term: usize,
}

impl MemoryStore {
    pub fn new(max_short_term: usize) -> Self {
        Self {
            records: HashMap::new(),
            short_term: VecDeque::new(),
            long_term: BTreeMap::new(),
            chat_ledger: Vec::new(),
            last_by_category: HashMap::new(),
            max_short_term,
        }
    }

    pub fn max_short_term(&self) -> usize {
        self.max_short_term
    }

    /// Store an activity outcome under `category` and return its id.
    pub fn commit(&mut self, category: &str, result: ActivityResult) -> RecordId {
        let record = MemoryRecord::activity(category, result);
        let id = record.id;
        self.insert(record);
        id
    }

    /// Same as [`commit`](Self::commit) with an explicit record timestamp.
    pub fn commit_at(
        &mut self,
        category: &str,
        result: ActivityResult,
        at: DateTime<Utc>,
    ) -> RecordId {
        let mut record = MemoryRecord::activity(category, result);
        record.timestamp = at;
        let id = record.id;
        self.insert(record);
        id
    }

    /// Record an incoming chat message as a pending chat record.
    pub fn add_chat_message(&mut self, sender: &str, message: &str) -> RecordId {
        let record = MemoryRecord::chat(sender, message);
        let id = record.id;
        self.insert(record);
        id
    }

    /// Append a record to the short-term buffer.  Returns `false`
    /// (and stores nothing) when the id is already known.
    pub fn insert(&mut self, record: MemoryRecord) -> bool {
        if self.records.contains_key(&record.id) {
            return false;
        }

        let id = record.id;
        self.note_timestamp(&record);
        if record.is_chat() {
            self.chat_ledger.push(id);
        }
        self.records.insert(id, record);
        self.short_term.push_back(id);

        if self.short_term.len() > self.max_short_term {
            self.consolidate();
        }
        true
    }

    /// Move the oldest excess records from the short-term buffer into the
    /// long-term archive, preserving their order.  Returns how many moved.
    pub fn consolidate(&mut self) -> usize {
        let mut moved = 0usize;
        while self.short_term.len() > self.max_short_term {
            let Some(id) = self.short_term.pop_front() else {
                break;
            };
            let Some(record) = self.records.get_mut(&id) else {
                continue;
            };
            if record.status == RecordStatus::Answered {
                record.status = RecordStatus::Archived;
            }
            self.long_term
                .entry(record.category.clone())
                .or_default()
                .push(id);
            moved += 1;
        }
        if moved > 0 {
            debug!(moved, short_term = self.short_term.len(), "consolidated short-term memory");
        }
        moved
    }

    pub fn get(&self, id: &RecordId) -> Option<&MemoryRecord> {
        self.records.get(id)
    }

    /// Up to `limit` short-term records, most recent first.
    pub fn recent(&self, limit: usize) -> Vec<&MemoryRecord> {
        self.recent_page(limit, 0)
    }

    pub fn recent_page(&self, limit: usize, offset: usize) -> Vec<&MemoryRecord> {
        self.short_term
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .filter_map(|id| self.records.get(id))
            .collect()
    }

    /// Pending chat records in arrival order, wherever they are stored.
    pub fn pending_chat(&self) -> Vec<&MemoryRecord> {
        self.chat_ledger
            .iter()
            .filter_map(|id| self.records.get(id))
            .filter(|record| record.status == RecordStatus::Pending)
            .collect()
    }

    /// The newest `limit` chat records, oldest first.
    pub fn chat_history(&self, limit: usize) -> Vec<&MemoryRecord> {
        let skip = self.chat_ledger.len().saturating_sub(limit);
        self.chat_ledger
            .iter()
            .skip(skip)
            .filter_map(|id| self.records.get(id))
            .collect()
    }

    /// Attach a response to a pending chat record.  A record that was already
    /// consolidated into the archive settles straight to `Archived`.
    pub fn mark_answered(
        &mut self,
        id: &RecordId,
        response: &str,
        at: DateTime<Utc>,
    ) -> Result<&MemoryRecord> {
        let in_archive = !self.short_term.contains(id);
        let record = self
            .records
            .get_mut(id)
            .ok_or(MemoryError::UnknownRecord(*id))?;

        let RecordPayload::Chat { response: slot, .. } = &mut record.payload else {
            return Err(MemoryError::NotChat(*id));
        };
        if record.status != RecordStatus::Pending {
            return Err(MemoryError::AlreadyAnswered(*id));
        }

        *slot = Some(ChatResponse {
            message: response.to_string(),
            answered_at: at,
        });
        record.status = if in_archive {
            RecordStatus::Archived
        } else {
            RecordStatus::Answered
        };
        Ok(&*record)
    }

    /// Long-term archive of one category, in original order.
    pub fn activity_history(&self, category: &str) -> Vec<&MemoryRecord> {
        self.long_term
            .get(category)
            .map(|ids| ids.iter().filter_map(|id| self.records.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn activity_count(&self) -> usize {
        self.records.len()
    }

    pub fn last_activity_timestamp(&self) -> Option<DateTime<Utc>> {
        self.last_by_category.values().max().copied()
    }

    /// Timestamp of the newest record filed under `category`.
    pub fn last_execution_of(&self, category: &str) -> Option<DateTime<Utc>> {
        self.last_by_category.get(category).copied()
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            total: self.records.len(),
            short_term: self.short_term.len(),
            long_term: self.long_term.values().map(Vec::len).sum(),
            pending_chat: self.pending_chat().len(),
            categories: self.long_term.len(),
        }
    }

    pub fn export(&self) -> MemoryImage {
        let resolve = |ids: &[RecordId]| -> Vec<MemoryRecord> {
            ids.iter().filter_map(|id| self.records.get(id)).cloned().collect()
        };
        let short_term = self.short_term.iter().copied().collect::<Vec<_>>();
        MemoryImage {
            short_term: resolve(short_term.as_slice()),
            long_term: self
                .long_term
                .iter()
                .map(|(category, ids)| (category.clone(), resolve(ids.as_slice())))
                .collect(),
            chat_ledger: self.chat_ledger.clone(),
        }
    }

    /// Rebuild a store from a validated image.  A buffer larger than
    /// `max_short_term` is consolidated immediately.
    pub fn restore(image: MemoryImage, max_short_term: usize) -> std::result::Result<Self, String> {
        image.validate()?;

        let mut store = Self::new(max_short_term);
        for (category, records) in image.long_term {
            let ids = records.iter().map(|record| record.id).collect();
            for record in records {
                store.admit(record);
            }
            store.long_term.insert(category, ids);
        }
        for record in image.short_term {
            store.short_term.push_back(record.id);
            store.admit(record);
        }
        store.chat_ledger = image.chat_ledger;

        store.consolidate();
        Ok(store)
    }

    fn admit(&mut self, record: MemoryRecord) {
        self.note_timestamp(&record);
        self.records.insert(record.id, record);
    }

    fn note_timestamp(&mut self, record: &MemoryRecord) {
        let slot = self
            .last_by_category
            .entry(record.category.clone())
            .or_insert(record.timestamp);
        if record.timestamp > *slot {
            *slot = record.timestamp;
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use serde_json::json;

    use super::*;
    use crate::schema::CHAT_CATEGORY;

    fn result(n: usize) -> ActivityResult {
        ActivityResult::success_result(json!({ "n": n }))
    }

    fn n_of(record: &MemoryRecord) -> u64 {
        record.activity_result().unwrap().data["n"].as_u64().unwrap()
    }

    #[test]
    fn overflow_moves_oldest_into_archive_in_order() {
        let mut store = MemoryStore::new(100);
        for n in 0..120 {
            store.commit("Test", result(n));
        }

        let stats = store.stats();
        assert_eq!(stats.short_term, 100);
        assert_eq!(stats.long_term, 20);
        assert_eq!(stats.total, 120);

        let recent = store.recent(100);
        assert_eq!(n_of(recent[0]), 119);
        assert_eq!(n_of(recent[99]), 20);

        let archived = store.activity_history("Test");
        let order: Vec<u64> = archived.iter().map(|r| n_of(r)).collect();
        assert_eq!(order, (0..20).collect::<Vec<u64>>());
    }

    #[test]
    fn buffer_never_exceeds_max_and_nothing_is_lost() {
        let mut store = MemoryStore::new(7);
        let mut ids = Vec::new();
        for n in 0..50 {
            let category = if n % 3 == 0 { "A" } else { "B" };
            ids.push(store.commit(category, result(n)));
            assert!(store.stats().short_term <= 7);
        }
        for id in &ids {
            assert!(store.get(id).is_some());
        }
        assert_eq!(store.activity_count(), 50);
    }

    #[test]
    fn recent_page_paginates_most_recent_first() {
        let mut store = MemoryStore::new(10);
        for n in 0..6 {
            store.commit("Test", result(n));
        }
        let page: Vec<u64> = store.recent_page(2, 1).iter().map(|r| n_of(r)).collect();
        assert_eq!(page, vec![4, 3]);
        assert!(store.recent_page(5, 10).is_empty());
    }

    #[test]
    fn chat_lifecycle_pending_answered_archived() {
        let mut store = MemoryStore::new(2);
        let id = store.add_chat_message("user", "hello?");
        assert_eq!(store.pending_chat().len(), 1);

        store.mark_answered(&id, "hi there", Utc::now()).unwrap();
        assert_eq!(store.get(&id).unwrap().status, RecordStatus::Answered);
        assert!(store.pending_chat().is_empty());

        store.commit("Test", result(1));
        store.commit("Test", result(2));
        let record = store.get(&id).unwrap();
        assert_eq!(record.status, RecordStatus::Archived);
        assert_eq!(store.activity_history(CHAT_CATEGORY).len(), 1);
        // Stored once: not in the short-term view any more, still in the ledger.
        assert!(store.recent(10).iter().all(|r| r.id != id));
        assert_eq!(store.chat_history(10).len(), 1);
    }

    #[test]
    fn pending_chat_survives_consolidation() {
        let mut store = MemoryStore::new(1);
        let id = store.add_chat_message("user", "still waiting");
        store.commit("Test", result(1));
        store.commit("Test", result(2));

        let pending = store.pending_chat();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].status, RecordStatus::Pending);

        let record = store.mark_answered(&id, "late reply", Utc::now()).unwrap();
        assert_eq!(record.status, RecordStatus::Archived);
        assert!(matches!(&record.payload, RecordPayload::Chat { response: Some(_), .. }));
    }

    #[test]
    fn mark_answered_rejects_bad_targets() {
        let mut store = MemoryStore::new(10);
        let activity = store.commit("Test", result(0));
        let chat = store.add_chat_message("user", "q");

        assert!(matches!(
            store.mark_answered(&activity, "x", Utc::now()),
            Err(MemoryError::NotChat(_))
        ));
        assert!(matches!(
            store.mark_answered(&uuid::Uuid::new_v4(), "x", Utc::now()),
            Err(MemoryError::UnknownRecord(_))
        ));
        store.mark_answered(&chat, "a", Utc::now()).unwrap();
        assert!(matches!(
            store.mark_answered(&chat, "again", Utc::now()),
            Err(MemoryError::AlreadyAnswered(_))
        ));
    }

    #[test]
    fn chat_history_returns_newest_oldest_first() {
        let mut store = MemoryStore::new(10);
        for text in ["one", "two", "three"] {
            store.add_chat_message("user", text);
        }
        let history: Vec<String> = store
            .chat_history(2)
            .iter()
            .map(|r| match &r.payload {
                RecordPayload::Chat { message, .. } => message.message.clone(),
                RecordPayload::Activity(_) => unreachable!(),
            })
            .collect();
        assert_eq!(history, vec!["two", "three"]);
    }

    #[test]
    fn last_execution_tracks_newest_record_per_category() {
        let mut store = MemoryStore::new(10);
        let t0 = Utc::now();
        store.commit_at("A", result(0), t0);
        store.commit_at("A", result(1), t0 + TimeDelta::seconds(30));
        store.commit_at("B", result(2), t0 + TimeDelta::seconds(10));
        assert_eq!(store.last_execution_of("A"), Some(t0 + TimeDelta::seconds(30)));
        assert_eq!(store.last_execution_of("B"), Some(t0 + TimeDelta::seconds(10)));
        assert_eq!(store.last_execution_of("C"), None);
        assert_eq!(store.last_activity_timestamp(), Some(t0 + TimeDelta::seconds(30)));
    }

    #[test]
    fn duplicate_insert_is_ignored() {
        let mut store = MemoryStore::new(10);
        let record = MemoryRecord::activity("A", result(0));
        assert!(store.insert(record.clone()));
        assert!(!store.insert(record));
        assert_eq!(store.activity_count(), 1);
    }

    #[test]
    fn export_restore_preserves_everything() {
        let mut store = MemoryStore::new(3);
        for n in 0..5 {
            store.commit("A", result(n));
        }
        let chat = store.add_chat_message("user", "hey");
        let image = store.export();

        let restored = MemoryStore::restore(image.clone(), 3).unwrap();
        assert_eq!(restored.export(), image);
        assert_eq!(restored.pending_chat()[0].id, chat);
        assert!(restored.last_execution_of("A").is_some());
    }

    #[test]
    fn restore_with_smaller_max_consolidates() {
        let mut store = MemoryStore::new(10);
        for n in 0..8 {
            store.commit("A", result(n));
        }
        let restored = MemoryStore::restore(store.export(), 5).unwrap();
        assert_eq!(restored.stats().short_term, 5);
        let archived: Vec<u64> = restored.activity_history("A").iter().map(|r| n_of(r)).collect();
        assert_eq!(archived, vec![0, 1, 2]);
    }

    #[test]
    fn restore_rejects_inconsistent_images() {
        let mut store = MemoryStore::new(10);
        store.commit("A", result(0));
        store.add_chat_message("user", "q");

        let mut dangling = store.export();
        dangling.chat_ledger.push(uuid::Uuid::new_v4());
        assert!(MemoryStore::restore(dangling, 10).is_err());

        let mut duplicated = store.export();
        let copy = duplicated.short_term[0].clone();
        duplicated.short_term.push(copy);
        assert!(MemoryStore::restore(duplicated, 10).is_err());

        let mut orphaned = store.export();
        orphaned.chat_ledger.clear();
        assert!(MemoryStore::restore(orphaned, 10).is_err());
    }

    #[test]
    fn restore_rejects_status_payload_mismatches() {
        let mut store = MemoryStore::new(10);
        store.commit("A", result(0));
        let chat = store.add_chat_message("user", "q");

        let mut answered_without_reply = store.export();
        let record = answered_without_reply
            .short_term
            .iter_mut()
            .find(|record| record.id == chat)
            .unwrap();
        record.status = RecordStatus::Answered;
        let err = MemoryStore::restore(answered_without_reply, 10).unwrap_err();
        assert!(err.contains("lacks a response"), "{err}");

        let mut replied_but_pending = store.export();
        let record = replied_but_pending
            .short_term
            .iter_mut()
            .find(|record| record.id == chat)
            .unwrap();
        if let RecordPayload::Chat { response, .. } = &mut record.payload {
            *response = Some(ChatResponse {
                message: "a".to_string(),
                answered_at: Utc::now(),
            });
        }
        assert!(MemoryStore::restore(replied_but_pending, 10).is_err());

        let mut pending_activity = store.export();
        pending_activity.short_term[0].status = RecordStatus::Pending;
        let err = MemoryStore::restore(pending_activity, 10).unwrap_err();
        assert!(err.contains("activity record"), "{err}");
    }

    #[test]
    fn answered_and_archived_chats_validate() {
        let mut store = MemoryStore::new(1);
        let first = store.add_chat_message("user", "one");
        store.mark_answered(&first, "1", Utc::now()).unwrap();
        let second = store.add_chat_message("user", "two");
        store.mark_answered(&second, "2", Utc::now()).unwrap();
        store.add_chat_message("user", "three");

        assert_eq!(store.get(&first).unwrap().status, RecordStatus::Archived);
        assert!(store.export().validate().is_ok());
    }
}
