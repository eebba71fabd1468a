use crate::episodic::{EpisodicMemory, EpisodicSummary};
use crate::procedural::ProceduralMemory;
use crate::remote::RemoteStore;
use crate::semantic::SemanticMemory;
use crate::MemoryResult;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tony_core::records::{USER_PROFILE_CATEGORY, USER_PROFILE_PREFIX};
use tony_core::{
    truncate_chars, ChatMessage, EpisodicRecord, MemoryConfig, MessageType, ProceduralRecord,
    RecordKind,
};
use tony_storage::{LocalStore, ProceduralFilter, SemanticFilter};
use tracing::{debug, info, warn};

/// Human messages considered by semantic extraction after each turn.
const EXTRACTION_WINDOW: usize = 5;
const EXPERIENCE_KEYWORDS: [&str; 5] = ["vacacion", "permiso", "sueldo", "horario", "contrato"];
const EXPERIENCE_MIN_SUCCESS: f64 = 0.7;
const EXPERIENCE_STEPS: usize = 2;
const CONTEXT_SEARCH_LIMIT: usize = 3;
const CONTEXT_SNIPPETS: usize = 2;
const SNIPPET_CHARS: usize = 50;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClearScope {
    /// Short-term window plus every long-term store.
    #[default]
    All,
    /// Short-term window and episodic history only.
    KeepLongTerm,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SemanticSummary {
    pub total_concepts: usize,
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProceduralSummary {
    pub total_procedures: usize,
    pub avg_success_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemorySummary {
    pub session_id: String,
    pub episodic: EpisodicSummary,
    pub semantic: SemanticSummary,
    pub procedural: ProceduralSummary,
    pub short_term_messages: usize,
}

/// Everything the agent needs from memory for one session.
pub struct MemoryFacade {
    session_id: String,
    local: Arc<LocalStore>,
    short_term: Mutex<VecDeque<ChatMessage>>,
    short_term_k: usize,
    episodic: EpisodicMemory,
    semantic: SemanticMemory,
    procedural: ProceduralMemory,
}

impl MemoryFacade {
    /// Assembles the session's memories, restoring from backup when a record set is
    /// empty and a backup exists, then warms the short-term window from history.
    pub fn open(
        session_id: impl Into<String>,
        local: Arc<LocalStore>,
        remote: Option<Arc<dyn RemoteStore>>,
        config: &MemoryConfig,
    ) -> MemoryResult<Self> {
        Self::assemble(session_id.into(), local, remote, config, true)
    }

    /// Like `open`, but never restores a backup. For read-only callers.
    pub fn inspect(
        session_id: impl Into<String>,
        local: Arc<LocalStore>,
        remote: Option<Arc<dyn RemoteStore>>,
        config: &MemoryConfig,
    ) -> MemoryResult<Self> {
        Self::assemble(session_id.into(), local, remote, config, false)
    }

    fn assemble(
        session_id: String,
        local: Arc<LocalStore>,
        remote: Option<Arc<dyn RemoteStore>>,
        config: &MemoryConfig,
        restore: bool,
    ) -> MemoryResult<Self> {
        let facade = Self {
            episodic: EpisodicMemory::new(
                session_id.clone(),
                local.clone(),
                remote.clone(),
                config.episodic_cache_ttl(),
            ),
            semantic: SemanticMemory::new(
                session_id.clone(),
                local.clone(),
                remote.clone(),
                config.knowledge_cache_ttl(),
            ),
            procedural: ProceduralMemory::new(
                session_id.clone(),
                local.clone(),
                remote,
                config.knowledge_cache_ttl(),
            ),
            short_term: Mutex::new(VecDeque::with_capacity(config.short_term_k)),
            short_term_k: config.short_term_k.max(1),
            session_id,
            local,
        };

        if restore {
            facade.restore_if_empty()?;
        }
        facade.warm_short_term()?;
        Ok(facade)
    }

    fn restore_if_empty(&self) -> MemoryResult<()> {
        let has_backup = self
            .local
            .session_metadata(&self.session_id)?
            .is_some_and(|metadata| metadata.has_backup());
        if !has_backup {
            return Ok(());
        }

        let mut any_empty = false;
        for kind in [RecordKind::Episodic, RecordKind::Semantic, RecordKind::Procedural] {
            any_empty |= self.local.record_count(kind, &self.session_id)? == 0;
        }
        if any_empty && self.local.restore_backup(&self.session_id)? {
            self.episodic.invalidate_cache();
            self.semantic.invalidate_cache();
            self.procedural.invalidate_cache();
        }
        Ok(())
    }

    /// The window always comes from the local store, which holds every turn even when
    /// the remote missed some.
    fn warm_short_term(&self) -> MemoryResult<()> {
        let messages = self
            .local
            .recent_episodic(&self.session_id, self.short_term_k)?
            .iter()
            .filter(|record| record.message_type != MessageType::System)
            .map(EpisodicRecord::to_message)
            .collect::<Vec<_>>();

        let mut window = self.window();
        window.clear();
        window.extend(messages);
        debug!(
            event = "short_term_warmed",
            session_id = %self.session_id,
            messages = window.len()
        );
        Ok(())
    }

    fn window(&self) -> MutexGuard<'_, VecDeque<ChatMessage>> {
        self.short_term
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn episodic(&self) -> &EpisodicMemory {
        &self.episodic
    }

    pub fn semantic(&self) -> &SemanticMemory {
        &self.semantic
    }

    pub fn procedural(&self) -> &ProceduralMemory {
        &self.procedural
    }

    /// Records one turn. Human turns also feed semantic extraction and, when tools
    /// were involved, procedural learning.
    pub fn add_message(
        &self,
        message: ChatMessage,
        context: &str,
        tools_used: &[String],
        success: bool,
    ) -> MemoryResult<()> {
        self.episodic.add_message(&message, context)?;

        let window = {
            let mut window = self.window();
            if message.message_type != MessageType::System {
                window.push_back(message.clone());
                while window.len() > self.short_term_k {
                    window.pop_front();
                }
            }
            let skip = window.len().saturating_sub(EXTRACTION_WINDOW);
            window.iter().skip(skip).cloned().collect::<Vec<_>>()
        };

        if message.is_human() {
            self.semantic.extract_and_store_from_conversation(&window)?;
            if !tools_used.is_empty() {
                self.procedural
                    .learn_from_interaction(&message.content, tools_used, success)?;
            }
        }
        Ok(())
    }

    /// Case-insensitive substring search over the whole history, oldest first.
    pub fn search(&self, query: &str, limit: usize) -> MemoryResult<Vec<ChatMessage>> {
        let needle = query.to_lowercase();
        Ok(self
            .episodic
            .messages()?
            .into_iter()
            .filter(|message| message.content.to_lowercase().contains(&needle))
            .take(limit)
            .collect())
    }

    pub fn user_profile(&self) -> MemoryResult<BTreeMap<String, String>> {
        let records = self
            .semantic
            .get_knowledge(&SemanticFilter::category(USER_PROFILE_CATEGORY))?;
        Ok(records
            .into_iter()
            .map(|record| {
                let key = record
                    .concept
                    .strip_prefix(USER_PROFILE_PREFIX)
                    .map(str::to_string)
                    .unwrap_or(record.concept);
                (key, record.knowledge)
            })
            .collect())
    }

    pub fn summary(&self) -> MemoryResult<MemorySummary> {
        let knowledge = self.semantic.get_knowledge(&SemanticFilter::default())?;
        let procedures = self.learned_procedures()?;
        let categories = knowledge
            .iter()
            .map(|record| record.category.clone())
            .collect::<BTreeSet<_>>();
        let avg_success_rate = if procedures.is_empty() {
            0.0
        } else {
            procedures
                .iter()
                .map(|procedure| procedure.success_rate)
                .sum::<f64>()
                / procedures.len() as f64
        };

        Ok(MemorySummary {
            session_id: self.session_id.clone(),
            episodic: self.episodic.summary()?,
            semantic: SemanticSummary {
                total_concepts: knowledge.len(),
                categories: categories.into_iter().collect(),
            },
            procedural: ProceduralSummary {
                total_procedures: procedures.len(),
                avg_success_rate,
            },
            short_term_messages: self.window().len(),
        })
    }

    pub fn clear(&self, scope: ClearScope) -> MemoryResult<()> {
        self.window().clear();
        let episodic = self.episodic.clear()?;
        let (semantic, procedural) = match scope {
            ClearScope::All => (self.semantic.clear()?, self.procedural.clear()?),
            ClearScope::KeepLongTerm => (0, 0),
        };
        info!(
            event = "memory_cleared",
            session_id = %self.session_id,
            scope = ?scope,
            episodic,
            semantic,
            procedural
        );
        Ok(())
    }

    /// The short-term window, oldest first.
    pub fn recent_messages(&self) -> Vec<ChatMessage> {
        self.window().iter().cloned().collect()
    }

    pub fn all_messages(&self) -> MemoryResult<Vec<ChatMessage>> {
        self.episodic.messages()
    }

    pub fn learned_procedures(&self) -> MemoryResult<Vec<ProceduralRecord>> {
        self.procedural.get_procedures(&ProceduralFilter::default())
    }

    /// Drops procedures stored under the old `query_pattern_*` naming.
    pub fn cleanup_old_procedural_patterns(&self) -> MemoryResult<usize> {
        self.procedural.cleanup_old_patterns()
    }

    pub fn backup(&self) -> MemoryResult<usize> {
        Ok(self.local.create_backup(&self.session_id)?)
    }

    /// Appends what long-term memory knows about the user and similar past queries.
    /// Falls back to the bare query on any failure.
    pub fn enrich_query(&self, query: &str) -> String {
        match self.enrichment(query) {
            Ok(sections) if !sections.is_empty() => {
                debug!(
                    event = "query_enriched",
                    session_id = %self.session_id,
                    sections = sections.len()
                );
                format!("{query}\n\n{}", sections.join(" "))
            }
            Ok(_) => query.to_string(),
            Err(err) => {
                warn!(
                    event = "query_enrichment_failed",
                    session_id = %self.session_id,
                    error = %err
                );
                query.to_string()
            }
        }
    }

    fn enrichment(&self, query: &str) -> MemoryResult<Vec<String>> {
        let mut sections = Vec::new();

        let profile = self.user_profile()?;
        if !profile.is_empty() {
            let entries = profile
                .iter()
                .map(|(key, value)| format!("{key}: {value}"))
                .collect::<Vec<_>>();
            sections.push(format!("[USER PROFILE: {}]", entries.join(", ")));
        }

        let lowered = query.to_lowercase();
        if EXPERIENCE_KEYWORDS
            .iter()
            .any(|keyword| lowered.contains(keyword))
        {
            let best = self
                .learned_procedures()?
                .into_iter()
                .filter(|procedure| procedure.success_rate > EXPERIENCE_MIN_SUCCESS)
                .max_by(|left, right| {
                    left.success_rate
                        .partial_cmp(&right.success_rate)
                        .unwrap_or(Ordering::Equal)
                });
            if let Some(best) = best.filter(|procedure| !procedure.steps.is_empty()) {
                let steps = best
                    .steps
                    .iter()
                    .take(EXPERIENCE_STEPS)
                    .cloned()
                    .collect::<Vec<_>>();
                sections.push(format!("[PRIOR EXPERIENCE: {}]", steps.join(", ")));
            }
        }

        let hits = self.search(query, CONTEXT_SEARCH_LIMIT)?;
        let skip = hits.len().saturating_sub(CONTEXT_SNIPPETS);
        let context = hits
            .iter()
            .skip(skip)
            .filter(|message| message.is_human())
            .map(|message| format!("User asked: {}", snippet(&message.content)))
            .collect::<Vec<_>>();
        if !context.is_empty() {
            sections.push(format!("[PRIOR CONTEXT: {}]", context.join("; ")));
        }

        Ok(sections)
    }
}

fn snippet(content: &str) -> String {
    if content.chars().count() > SNIPPET_CHARS {
        format!("{}...", truncate_chars(content, SNIPPET_CHARS))
    } else {
        content.to_string()
    }
}
