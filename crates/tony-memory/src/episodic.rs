use crate::cache::ReadCache;
use crate::remote::{
    decode_rows, to_payload, ChatHistoryRow, RemoteQuery, RemoteStore, CHAT_HISTORY_TABLE,
};
use crate::{mirror_write, read_through, MemoryResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tony_core::{format_timestamp, ChatMessage, EpisodicRecord, MessageType, RecordKind};
use tony_storage::LocalStore;
use tracing::debug;

const ALL_MESSAGES_KEY: &str = "all";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EpisodicSummary {
    pub total_messages: usize,
    pub human_messages: usize,
    pub ai_messages: usize,
    pub first_message: Option<DateTime<Utc>>,
    pub last_message: Option<DateTime<Utc>>,
}

/// Full conversation history of one session.
pub struct EpisodicMemory {
    session_id: String,
    local: Arc<LocalStore>,
    remote: Option<Arc<dyn RemoteStore>>,
    cache: ReadCache<Vec<EpisodicRecord>>,
}

impl EpisodicMemory {
    pub fn new(
        session_id: impl Into<String>,
        local: Arc<LocalStore>,
        remote: Option<Arc<dyn RemoteStore>>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            local,
            remote,
            cache: ReadCache::new(cache_ttl),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn add_message(&self, message: &ChatMessage, context: &str) -> MemoryResult<i64> {
        let mut metadata = Map::new();
        metadata.insert(
            "timestamp".to_string(),
            Value::String(format_timestamp(Utc::now())),
        );
        metadata.insert("context".to_string(), Value::String(context.to_string()));
        metadata.insert(
            "message_length".to_string(),
            Value::from(message.content.chars().count() as u64),
        );
        metadata.insert(
            "session_id".to_string(),
            Value::String(self.session_id.clone()),
        );

        let id = self.local.save_episodic(
            &self.session_id,
            message.message_type,
            &message.content,
            &metadata,
        )?;

        if let Some(remote) = &self.remote {
            let row = ChatHistoryRow {
                id: None,
                session_id: self.session_id.clone(),
                message_type: message.message_type,
                content: message.content.clone(),
                metadata,
                created_at: None,
            };
            let synced = mirror_write(CHAT_HISTORY_TABLE, &self.session_id, || {
                remote.insert(CHAT_HISTORY_TABLE, &to_payload(&row)?)
            });
            if synced {
                self.local.mark_synced(RecordKind::Episodic, id)?;
            }
        }

        self.cache.invalidate();
        debug!(
            event = "episodic_message_added",
            session_id = %self.session_id,
            message_type = %message.message_type,
            id
        );
        Ok(id)
    }

    /// All records of the session, oldest first.
    pub fn records(&self) -> MemoryResult<Vec<EpisodicRecord>> {
        read_through(
            &self.cache,
            ALL_MESSAGES_KEY.to_string(),
            CHAT_HISTORY_TABLE,
            self.remote.as_ref(),
            || Ok(self.local.unsynced_records(RecordKind::Episodic, &self.session_id)? > 0),
            |remote| {
                let query = RemoteQuery::session(&self.session_id).order_by("created_at.asc");
                let rows = remote.fetch(CHAT_HISTORY_TABLE, &query)?;
                Ok(decode_rows::<ChatHistoryRow>(CHAT_HISTORY_TABLE, rows)
                    .into_iter()
                    .map(ChatHistoryRow::into_record)
                    .collect())
            },
            || self.local.get_episodic(&self.session_id, None),
        )
    }

    pub fn messages(&self) -> MemoryResult<Vec<ChatMessage>> {
        Ok(self
            .records()?
            .iter()
            .map(EpisodicRecord::to_message)
            .collect())
    }

    /// The newest `count` messages, oldest first.
    pub fn recent_messages(&self, count: usize) -> MemoryResult<Vec<ChatMessage>> {
        let mut messages = self.messages()?;
        let skip = messages.len().saturating_sub(count);
        Ok(messages.split_off(skip))
    }

    pub fn summary(&self) -> MemoryResult<EpisodicSummary> {
        let records = self.records()?;
        let count_of = |kind: MessageType| {
            records
                .iter()
                .filter(|record| record.message_type == kind)
                .count()
        };
        Ok(EpisodicSummary {
            total_messages: records.len(),
            human_messages: count_of(MessageType::Human),
            ai_messages: count_of(MessageType::Ai),
            first_message: records.first().map(|record| record.created_at),
            last_message: records.last().map(|record| record.created_at),
        })
    }

    pub fn clear(&self) -> MemoryResult<usize> {
        let removed = self
            .local
            .delete_records(RecordKind::Episodic, &self.session_id)?;
        if let Some(remote) = &self.remote {
            mirror_write(CHAT_HISTORY_TABLE, &self.session_id, || {
                remote.delete(CHAT_HISTORY_TABLE, &RemoteQuery::session(&self.session_id))
            });
        }
        self.cache.invalidate();
        Ok(removed)
    }

    pub fn invalidate_cache(&self) {
        self.cache.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRemote;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn local() -> Arc<LocalStore> {
        Arc::new(LocalStore::open_in_memory().expect("open db"))
    }

    #[test]
    fn add_message_records_metadata_and_orders_history() {
        let store = local();
        let memory = EpisodicMemory::new("s1", store.clone(), None, Duration::from_secs(60));

        memory
            .add_message(&ChatMessage::human("¿Cuántos días de vacaciones?"), "whatsapp")
            .expect("human");
        memory
            .add_message(&ChatMessage::ai("Quince días hábiles."), "")
            .expect("ai");

        let records = memory.records().expect("records");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].message_type, MessageType::Human);
        assert_eq!(records[0].metadata["context"], json!("whatsapp"));
        assert_eq!(records[0].metadata["message_length"], json!(28));
        assert_eq!(records[0].metadata["session_id"], json!("s1"));
        assert!(!records[0].synced_to_remote);

        let summary = memory.summary().expect("summary");
        assert_eq!(summary.total_messages, 2);
        assert_eq!(summary.human_messages, 1);
        assert_eq!(summary.ai_messages, 1);
        assert!(summary.first_message <= summary.last_message);
    }

    #[test]
    fn failing_remote_keeps_local_write_and_falls_back_on_read() {
        let store = local();
        let remote = Arc::new(FakeRemote::failing());
        let memory = EpisodicMemory::new(
            "s1",
            store.clone(),
            Some(remote.clone() as Arc<dyn RemoteStore>),
            Duration::from_secs(60),
        );

        let id = memory
            .add_message(&ChatMessage::human("hola"), "")
            .expect("local write succeeds");
        assert!(id > 0);
        assert_eq!(store.unsynced_count("s1").expect("unsynced"), 1);

        let messages = memory.messages().expect("fallback read");
        assert_eq!(messages, vec![ChatMessage::human("hola")]);
    }

    #[test]
    fn confirmed_remote_write_marks_row_synced() {
        let store = local();
        let remote = Arc::new(FakeRemote::default());
        let memory = EpisodicMemory::new(
            "s1",
            store.clone(),
            Some(remote.clone() as Arc<dyn RemoteStore>),
            Duration::from_secs(60),
        );

        memory
            .add_message(&ChatMessage::ai("Hola"), "")
            .expect("write");
        assert_eq!(store.unsynced_count("s1").expect("unsynced"), 0);
        assert_eq!(remote.rows(CHAT_HISTORY_TABLE).len(), 1);
        assert_eq!(remote.rows(CHAT_HISTORY_TABLE)[0]["session_id"], json!("s1"));
    }

    #[test]
    fn fresh_cache_serves_reads_without_remote_calls() {
        let store = local();
        let remote = Arc::new(FakeRemote::default());
        let memory = EpisodicMemory::new(
            "s1",
            store,
            Some(remote.clone() as Arc<dyn RemoteStore>),
            Duration::from_secs(60),
        );
        memory
            .add_message(&ChatMessage::human("uno"), "")
            .expect("write");

        memory.records().expect("first read");
        let calls = remote.calls.load(Ordering::SeqCst);
        memory.records().expect("cached read");
        assert_eq!(remote.calls.load(Ordering::SeqCst), calls);
    }

    #[test]
    fn recent_messages_keeps_tail_in_order() {
        let memory = EpisodicMemory::new("s1", local(), None, Duration::from_secs(60));
        for idx in 0..4 {
            memory
                .add_message(&ChatMessage::human(format!("m{idx}")), "")
                .expect("write");
        }

        let recent = memory.recent_messages(2).expect("recent");
        assert_eq!(recent, vec![ChatMessage::human("m2"), ChatMessage::human("m3")]);
        assert_eq!(memory.recent_messages(10).expect("all").len(), 4);
    }

    #[test]
    fn clear_empties_local_and_remote_history() {
        let store = local();
        let remote = Arc::new(FakeRemote::default());
        let memory = EpisodicMemory::new(
            "s1",
            store.clone(),
            Some(remote.clone() as Arc<dyn RemoteStore>),
            Duration::from_secs(60),
        );
        memory
            .add_message(&ChatMessage::human("hola"), "")
            .expect("write");

        assert_eq!(memory.clear().expect("clear"), 1);
        assert!(memory.messages().expect("read").is_empty());
        assert!(remote.rows(CHAT_HISTORY_TABLE).is_empty());
        assert_eq!(
            store
                .record_count(RecordKind::Episodic, "s1")
                .expect("count"),
            0
        );
    }
}
