use crate::cache::ReadCache;
use crate::remote::{
    decode_rows, to_payload, upsert_by_key, RemoteQuery, RemoteStore, SemanticMemoryRow,
    SEMANTIC_TABLE,
};
use crate::{mirror_write, read_through, MemoryResult};
use std::sync::Arc;
use std::time::Duration;
use tony_core::records::{
    clamp_unit, CONVERSATION_TOPICS_CATEGORY, DEFAULT_CATEGORY, USER_PROFILE_CATEGORY,
    USER_PROFILE_PREFIX,
};
use tony_core::{ChatMessage, RecordKind, SemanticRecord};
use tony_storage::{LocalStore, SemanticFilter};
use tracing::debug;

pub const TOPICS_CONCEPT: &str = "discussed_topics";
pub const TOPIC_KEYWORDS: [&str; 6] = [
    "reglamento",
    "laboral",
    "empresa",
    "trabajo",
    "empleado",
    "normas",
];

const PROFILE_CONFIDENCE: f64 = 0.8;
const TOPICS_CONFIDENCE: f64 = 0.9;
const NAME_PHRASES: [&str; 2] = ["mi nombre es", "my name is"];
const WORK_PHRASES: [&str; 2] = ["trabajo en", "i work at"];
const WORK_WORDS: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedFact {
    pub concept: String,
    pub knowledge: String,
    pub category: String,
    pub confidence: f64,
}

/// Facts and preferences learned about the user of one session.
pub struct SemanticMemory {
    session_id: String,
    local: Arc<LocalStore>,
    remote: Option<Arc<dyn RemoteStore>>,
    cache: ReadCache<Vec<SemanticRecord>>,
}

impl SemanticMemory {
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

    pub fn store_knowledge(
        &self,
        concept: &str,
        knowledge: &str,
        category: &str,
        confidence: f64,
    ) -> MemoryResult<i64> {
        let confidence = clamp_unit(confidence);
        let id = self
            .local
            .save_semantic(&self.session_id, concept, knowledge, category, confidence)?;

        if let Some(remote) = &self.remote {
            let row = SemanticMemoryRow {
                id: None,
                session_id: self.session_id.clone(),
                concept: concept.to_string(),
                knowledge: knowledge.to_string(),
                category: category.to_string(),
                confidence,
                created_at: None,
                updated_at: None,
            };
            let key = RemoteQuery::session(&self.session_id).eq("concept", concept);
            let synced = mirror_write(SEMANTIC_TABLE, &self.session_id, || {
                upsert_by_key(remote.as_ref(), SEMANTIC_TABLE, &key, &to_payload(&row)?)
            });
            if synced {
                self.local.mark_synced(RecordKind::Semantic, id)?;
            }
        }

        self.cache.invalidate();
        debug!(event = "knowledge_stored", session_id = %self.session_id, concept, category);
        Ok(id)
    }

    pub fn get_knowledge(&self, filter: &SemanticFilter) -> MemoryResult<Vec<SemanticRecord>> {
        read_through(
            &self.cache,
            filter.cache_key(),
            SEMANTIC_TABLE,
            self.remote.as_ref(),
            || Ok(self.local.unsynced_records(RecordKind::Semantic, &self.session_id)? > 0),
            |remote| {
                let mut query = RemoteQuery::session(&self.session_id);
                if let Some(concept) = &filter.concept {
                    query = query.ilike("concept", concept.as_str());
                }
                if let Some(category) = &filter.category {
                    query = query.eq("category", category.as_str());
                }
                let rows = remote.fetch(SEMANTIC_TABLE, &query.order_by("created_at.asc"))?;
                Ok(decode_rows::<SemanticMemoryRow>(SEMANTIC_TABLE, rows)
                    .into_iter()
                    .map(SemanticMemoryRow::into_record)
                    .collect())
            },
            || self.local.get_semantic(&self.session_id, filter),
        )
    }

    /// Replaces the knowledge of the first concept matching `concept`, keeping its
    /// category. Unknown concepts are created under the default category.
    pub fn update_knowledge(
        &self,
        concept: &str,
        knowledge: &str,
        confidence: Option<f64>,
    ) -> MemoryResult<i64> {
        let existing = self
            .get_knowledge(&SemanticFilter::concept(concept))?
            .into_iter()
            .next();
        match existing {
            Some(record) => self.store_knowledge(
                &record.concept,
                knowledge,
                &record.category,
                confidence.unwrap_or(record.confidence),
            ),
            None => self.store_knowledge(
                concept,
                knowledge,
                DEFAULT_CATEGORY,
                confidence.unwrap_or(1.0),
            ),
        }
    }

    /// Stores whatever [`extract_facts`] finds; returns the number of facts written.
    pub fn extract_and_store_from_conversation(
        &self,
        messages: &[ChatMessage],
    ) -> MemoryResult<usize> {
        let facts = extract_facts(messages);
        for fact in &facts {
            self.store_knowledge(
                &fact.concept,
                &fact.knowledge,
                &fact.category,
                fact.confidence,
            )?;
        }
        Ok(facts.len())
    }

    pub fn clear(&self) -> MemoryResult<usize> {
        let removed = self
            .local
            .delete_records(RecordKind::Semantic, &self.session_id)?;
        if let Some(remote) = &self.remote {
            mirror_write(SEMANTIC_TABLE, &self.session_id, || {
                remote.delete(SEMANTIC_TABLE, &RemoteQuery::session(&self.session_id))
            });
        }
        self.cache.invalidate();
        Ok(removed)
    }

    pub fn invalidate_cache(&self) {
        self.cache.invalidate();
    }
}

/// Pattern-based extraction over human messages: user name, workplace and the
/// labor topics mentioned. Later mentions win over earlier ones.
pub fn extract_facts(messages: &[ChatMessage]) -> Vec<ExtractedFact> {
    let mut name = None;
    let mut profession = None;
    let mut topics = Vec::new();

    for message in messages.iter().filter(|message| message.is_human()) {
        if let Some(tail) = text_after(&message.content, &NAME_PHRASES) {
            if let Some(word) = tail.split_whitespace().next().map(strip_punctuation) {
                if !word.is_empty() {
                    name = Some(word.to_string());
                }
            }
        }

        if let Some(tail) = text_after(&message.content, &WORK_PHRASES) {
            let tail = tail
                .split_whitespace()
                .take(WORK_WORDS)
                .collect::<Vec<_>>()
                .join(" ");
            let tail = strip_punctuation(&tail);
            if !tail.is_empty() {
                profession = Some(tail.to_string());
            }
        }

        let content = message.content.to_lowercase();
        for keyword in TOPIC_KEYWORDS {
            if content.contains(keyword) && !topics.contains(&keyword) {
                topics.push(keyword);
            }
        }
    }

    let mut facts = Vec::new();
    for (key, value) in [("name", name), ("profession", profession)] {
        if let Some(value) = value {
            facts.push(ExtractedFact {
                concept: format!("{USER_PROFILE_PREFIX}{key}"),
                knowledge: value,
                category: USER_PROFILE_CATEGORY.to_string(),
                confidence: PROFILE_CONFIDENCE,
            });
        }
    }

    if !topics.is_empty() {
        // keyword order, independent of message order
        topics.sort_by_key(|topic| TOPIC_KEYWORDS.iter().position(|keyword| keyword == topic));
        facts.push(ExtractedFact {
            concept: TOPICS_CONCEPT.to_string(),
            knowledge: topics.join(", "),
            category: CONVERSATION_TOPICS_CATEGORY.to_string(),
            confidence: TOPICS_CONFIDENCE,
        });
    }

    facts
}

/// Text following the first phrase found as a case-insensitive substring, in the
/// original casing.
fn text_after<'a>(content: &'a str, phrases: &[&str]) -> Option<&'a str> {
    let (lowered, offsets) = lowercase_with_offsets(content);
    phrases.iter().find_map(|phrase| {
        lowered.find(phrase).map(|start| {
            let end = offsets
                .get(start + phrase.len())
                .copied()
                .unwrap_or(content.len());
            &content[end..]
        })
    })
}

/// Lowercased text plus, for each of its bytes, the offset of the source char.
fn lowercase_with_offsets(content: &str) -> (String, Vec<usize>) {
    let mut lowered = String::with_capacity(content.len());
    let mut offsets = Vec::with_capacity(content.len());
    for (offset, ch) in content.char_indices() {
        for lower in ch.to_lowercase() {
            lowered.push(lower);
            offsets.extend(std::iter::repeat(offset).take(lower.len_utf8()));
        }
    }
    (lowered, offsets)
}

fn strip_punctuation(value: &str) -> &str {
    value.trim_matches(|ch: char| !ch.is_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRemote;

    fn memory(remote: Option<Arc<dyn RemoteStore>>) -> (Arc<LocalStore>, SemanticMemory) {
        let store = Arc::new(LocalStore::open_in_memory().expect("open db"));
        let memory = SemanticMemory::new("s1", store.clone(), remote, Duration::from_secs(60));
        (store, memory)
    }

    #[test]
    fn extracts_name_with_original_casing() {
        let facts = extract_facts(&[ChatMessage::human("Hola, mi nombre es Ana.")]);
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].concept, "user_name");
        assert_eq!(facts[0].knowledge, "Ana");
        assert_eq!(facts[0].category, USER_PROFILE_CATEGORY);
        assert!((facts[0].confidence - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn extracts_workplace_and_topics_in_keyword_order() {
        let facts = extract_facts(&[
            ChatMessage::human("Trabajo en Banco de Chile, ¿qué dice el reglamento?"),
            ChatMessage::ai("mi nombre es Tony"),
            ChatMessage::human("Somos una empresa con normas estrictas"),
        ]);

        let profession = facts
            .iter()
            .find(|fact| fact.concept == "user_profession")
            .expect("profession");
        assert_eq!(profession.knowledge, "Banco de Chile");
        assert!(facts.iter().all(|fact| fact.concept != "user_name"));

        let topics = facts
            .iter()
            .find(|fact| fact.concept == TOPICS_CONCEPT)
            .expect("topics");
        assert_eq!(topics.knowledge, "reglamento, empresa, trabajo, normas");
        assert_eq!(topics.category, CONVERSATION_TOPICS_CATEGORY);
    }

    #[test]
    fn phrases_match_inside_surrounding_text() {
        let facts = extract_facts(&[ChatMessage::human(
            "Hola,MI NOMBRE ES:Ángela y trabajo en: Falabella Retail",
        )]);
        let knowledge = facts
            .iter()
            .filter(|fact| fact.category == USER_PROFILE_CATEGORY)
            .map(|fact| (fact.concept.as_str(), fact.knowledge.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(
            knowledge,
            vec![
                ("user_name", "Ángela"),
                ("user_profession", "Falabella Retail")
            ]
        );
    }

    #[test]
    fn english_phrases_are_recognized() {
        let facts = extract_facts(&[ChatMessage::human("My name is John and I work at Acme")]);
        let knowledge = facts
            .iter()
            .map(|fact| (fact.concept.as_str(), fact.knowledge.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(
            knowledge,
            vec![("user_name", "John"), ("user_profession", "Acme")]
        );
    }

    #[test]
    fn nothing_to_extract_is_a_silent_no_op() {
        let (store, memory) = memory(None);
        let stored = memory
            .extract_and_store_from_conversation(&[ChatMessage::human("¿A qué hora abren?")])
            .expect("extract");
        assert_eq!(stored, 0);
        assert_eq!(
            store
                .record_count(RecordKind::Semantic, "s1")
                .expect("count"),
            0
        );
    }

    #[test]
    fn repeated_concept_overwrites_knowledge() {
        let (_store, memory) = memory(None);
        memory
            .store_knowledge("x", "v1", DEFAULT_CATEGORY, 1.0)
            .expect("first");
        memory
            .store_knowledge("x", "v2", DEFAULT_CATEGORY, 1.0)
            .expect("second");

        let rows = memory
            .get_knowledge(&SemanticFilter::concept("x"))
            .expect("read");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].knowledge, "v2");
    }

    #[test]
    fn update_knowledge_keeps_category_or_creates_general() {
        let (_store, memory) = memory(None);
        memory
            .store_knowledge("user_name", "Ana", USER_PROFILE_CATEGORY, 0.8)
            .expect("store");

        memory
            .update_knowledge("user_name", "Ana María", None)
            .expect("update");
        memory
            .update_knowledge("jornada", "45 horas", Some(0.7))
            .expect("create");

        let profile = memory
            .get_knowledge(&SemanticFilter::category(USER_PROFILE_CATEGORY))
            .expect("profile");
        assert_eq!(profile[0].knowledge, "Ana María");
        assert!((profile[0].confidence - 0.8).abs() < f64::EPSILON);

        let created = memory
            .get_knowledge(&SemanticFilter::concept("jornada"))
            .expect("created");
        assert_eq!(created[0].category, DEFAULT_CATEGORY);
    }

    #[test]
    fn remote_mirror_upserts_by_concept() {
        let remote = Arc::new(FakeRemote::default());
        let (store, memory) = memory(Some(remote.clone() as Arc<dyn RemoteStore>));

        memory
            .store_knowledge("x", "v1", DEFAULT_CATEGORY, 1.0)
            .expect("first");
        memory
            .store_knowledge("x", "v2", DEFAULT_CATEGORY, 0.5)
            .expect("second");

        let rows = remote.rows(SEMANTIC_TABLE);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["knowledge"], serde_json::json!("v2"));
        assert_eq!(store.unsynced_count("s1").expect("unsynced"), 0);

        let read = memory
            .get_knowledge(&SemanticFilter::concept("X"))
            .expect("remote read");
        assert_eq!(read[0].knowledge, "v2");
        assert!(read[0].synced_to_remote);
    }
}
