use crate::cache::ReadCache;
use crate::remote::{
    decode_rows, to_payload, upsert_by_key, ProceduralMemoryRow, RemoteQuery, RemoteStore,
    PROCEDURAL_TABLE,
};
use crate::{mirror_write, read_through, MemoryResult};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tony_core::records::clamp_unit;
use tony_core::{truncate_chars, ProceduralRecord, RecordKind};
use tony_storage::{LocalStore, ProceduralFilter};
use tracing::{debug, info};

pub const LEGACY_PATTERN_PREFIX: &str = "query_pattern_";

/// Query keyword to procedure category; the first keyword found wins.
pub const QUERY_CATEGORIES: [(&str, &str); 16] = [
    ("vacaciones", "vacaciones"),
    ("permiso", "permisos"),
    ("sueldo", "remuneracion"),
    ("salario", "remuneracion"),
    ("horario", "horarios"),
    ("trabajo", "condiciones_laborales"),
    ("contrato", "contrato"),
    ("despido", "terminacion_laboral"),
    ("licencia", "licencias"),
    ("beneficio", "beneficios"),
    ("reglamento", "normativas"),
    ("ley", "normativas"),
    ("derecho", "derechos_laborales"),
    ("obligacion", "obligaciones"),
    ("falta", "faltas_disciplinarias"),
    ("sancion", "sanciones"),
];

/// Tool name to the step recorded for it, in the order steps are written.
const TOOL_STEPS: [(&str, &str); 4] = [
    ("buscar_documentos", "Búsqueda en documentos internos"),
    ("buscar_web", "Búsqueda complementaria en web"),
    ("respuesta_directa", "Respuesta directa sin herramientas"),
    ("error_handling", "Manejo de error en el procesamiento"),
];

const SUMMARY_MAX_CHARS: usize = 50;
const SUMMARY_TRUNCATED_CHARS: usize = 47;
const CONTEXT_NEEDLE_CHARS: usize = 30;

/// Learned resolution patterns with running success rates.
pub struct ProceduralMemory {
    session_id: String,
    local: Arc<LocalStore>,
    remote: Option<Arc<dyn RemoteStore>>,
    cache: ReadCache<Vec<ProceduralRecord>>,
}

impl ProceduralMemory {
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

    pub fn store_procedure(
        &self,
        procedure_name: &str,
        steps: &[String],
        context: &str,
        success_rate: f64,
    ) -> MemoryResult<i64> {
        let success_rate = clamp_unit(success_rate);
        let id = self.local.save_procedural(
            &self.session_id,
            procedure_name,
            steps,
            context,
            success_rate,
        )?;

        if let Some(remote) = &self.remote {
            let row = ProceduralMemoryRow {
                id: None,
                session_id: self.session_id.clone(),
                procedure_name: procedure_name.to_string(),
                steps: steps.to_vec(),
                context: context.to_string(),
                success_rate,
                usage_count: 1,
                created_at: None,
                last_used: None,
            };
            let key = self.remote_key(procedure_name);
            let synced = mirror_write(PROCEDURAL_TABLE, &self.session_id, || {
                upsert_by_key(remote.as_ref(), PROCEDURAL_TABLE, &key, &to_payload(&row)?)
            });
            if synced {
                self.local.mark_synced(RecordKind::Procedural, id)?;
            }
        }

        self.cache.invalidate();
        debug!(event = "procedure_stored", session_id = %self.session_id, procedure_name);
        Ok(id)
    }

    pub fn get_procedures(
        &self,
        filter: &ProceduralFilter,
    ) -> MemoryResult<Vec<ProceduralRecord>> {
        read_through(
            &self.cache,
            filter.cache_key(),
            PROCEDURAL_TABLE,
            self.remote.as_ref(),
            || Ok(self.local.unsynced_records(RecordKind::Procedural, &self.session_id)? > 0),
            |remote| {
                let mut query = RemoteQuery::session(&self.session_id);
                if let Some(name) = &filter.name {
                    query = query.ilike("procedure_name", name.as_str());
                }
                if let Some(context) = &filter.context {
                    query = query.ilike("context", context.as_str());
                }
                let rows = remote.fetch(PROCEDURAL_TABLE, &query.order_by("created_at.asc"))?;
                Ok(decode_rows::<ProceduralMemoryRow>(PROCEDURAL_TABLE, rows)
                    .into_iter()
                    .map(ProceduralMemoryRow::into_record)
                    .collect())
            },
            || self.local.get_procedural(&self.session_id, filter),
        )
    }

    /// Folds one outcome into the first procedure whose name contains `procedure_name`.
    /// Returns the updated record, or `None` when nothing matches.
    pub fn update_procedure_success(
        &self,
        procedure_name: &str,
        success: bool,
    ) -> MemoryResult<Option<ProceduralRecord>> {
        let filter = ProceduralFilter::name(procedure_name);
        let Some(current) = self.find_procedure(&filter)? else {
            return Ok(None);
        };

        let (success_rate, usage_count) = current.with_outcome(success);
        let now = Utc::now();
        let id = match self.local.record_procedure_outcome(
            &self.session_id,
            &current.procedure_name,
            success_rate,
            usage_count,
        )? {
            Some(id) => id,
            None => {
                // known remotely only; materialize it locally first
                let id = self.local.save_procedural(
                    &self.session_id,
                    &current.procedure_name,
                    &current.steps,
                    &current.context,
                    success_rate,
                )?;
                self.local
                    .record_procedure_outcome(
                        &self.session_id,
                        &current.procedure_name,
                        success_rate,
                        usage_count,
                    )?
                    .unwrap_or(id)
            }
        };

        if let Some(remote) = &self.remote {
            // full row, so a remote that missed earlier writes catches up
            let row = ProceduralMemoryRow {
                id: None,
                session_id: self.session_id.clone(),
                procedure_name: current.procedure_name.clone(),
                steps: current.steps.clone(),
                context: current.context.clone(),
                success_rate,
                usage_count,
                created_at: None,
                last_used: Some(now),
            };
            let key = self.remote_key(&current.procedure_name);
            let synced = mirror_write(PROCEDURAL_TABLE, &self.session_id, || {
                upsert_by_key(remote.as_ref(), PROCEDURAL_TABLE, &key, &to_payload(&row)?)
            });
            if synced {
                self.local.mark_synced(RecordKind::Procedural, id)?;
            }
        }

        self.cache.invalidate();
        debug!(
            event = "procedure_outcome_recorded",
            session_id = %self.session_id,
            procedure_name = %current.procedure_name,
            success,
            success_rate,
            usage_count
        );

        Ok(Some(ProceduralRecord {
            id,
            success_rate,
            usage_count,
            last_used: now,
            synced_to_remote: false,
            ..current
        }))
    }

    /// Records how a query was handled. A procedure whose context already mentions
    /// the query summary gets a new outcome; otherwise a new procedure is stored.
    /// Returns the name of the procedure that was touched.
    pub fn learn_from_interaction(
        &self,
        query: &str,
        tools_used: &[String],
        success: bool,
    ) -> MemoryResult<String> {
        let summary = summarize_query(query);
        let needle = truncate_chars(&summary, CONTEXT_NEEDLE_CHARS);
        let existing = self.find_procedure(&ProceduralFilter::context(needle))?;

        if let Some(existing) = existing {
            let updated = self.update_procedure_success(&existing.procedure_name, success)?;
            return Ok(updated
                .map(|record| record.procedure_name)
                .unwrap_or(existing.procedure_name));
        }

        let procedure_name = format!("consulta_{}", summary.replace(' ', "_"));
        let context = format!("Consulta sobre: {summary}");
        let steps = procedure_steps(tools_used, success);
        self.store_procedure(
            &procedure_name,
            &steps,
            &context,
            if success { 1.0 } else { 0.0 },
        )?;
        Ok(procedure_name)
    }

    /// Deletes procedures left behind by the older `query_pattern_*` naming scheme.
    pub fn cleanup_old_patterns(&self) -> MemoryResult<usize> {
        let removed = self
            .local
            .delete_procedures_with_prefix(&self.session_id, LEGACY_PATTERN_PREFIX)?;
        if let Some(remote) = &self.remote {
            let query = RemoteQuery::session(&self.session_id)
                .like("procedure_name", format!("{LEGACY_PATTERN_PREFIX}*"));
            mirror_write(PROCEDURAL_TABLE, &self.session_id, || {
                remote.delete(PROCEDURAL_TABLE, &query)
            });
        }
        self.cache.invalidate();
        info!(event = "procedural_patterns_cleaned", session_id = %self.session_id, removed);
        Ok(removed)
    }

    pub fn clear(&self) -> MemoryResult<usize> {
        let removed = self
            .local
            .delete_records(RecordKind::Procedural, &self.session_id)?;
        if let Some(remote) = &self.remote {
            mirror_write(PROCEDURAL_TABLE, &self.session_id, || {
                remote.delete(PROCEDURAL_TABLE, &RemoteQuery::session(&self.session_id))
            });
        }
        self.cache.invalidate();
        Ok(removed)
    }

    pub fn invalidate_cache(&self) {
        self.cache.invalidate();
    }

    /// First procedure matching `filter`. Outcomes are folded into the local row, so
    /// the local store is asked first; the remote only supplies procedures it alone knows.
    fn find_procedure(&self, filter: &ProceduralFilter) -> MemoryResult<Option<ProceduralRecord>> {
        if let Some(local) = self
            .local
            .get_procedural(&self.session_id, filter)?
            .into_iter()
            .next()
        {
            return Ok(Some(local));
        }
        Ok(self.get_procedures(filter)?.into_iter().next())
    }

    fn remote_key(&self, procedure_name: &str) -> RemoteQuery {
        RemoteQuery::session(&self.session_id).eq("procedure_name", procedure_name)
    }
}

/// Category of a query, or the query itself (shortened) when no keyword matches.
pub fn summarize_query(query: &str) -> String {
    let lowered = query.to_lowercase();
    if let Some((_, category)) = QUERY_CATEGORIES
        .iter()
        .find(|(keyword, _)| lowered.contains(keyword))
    {
        return category.to_string();
    }

    let query = query.trim();
    if query.chars().count() > SUMMARY_MAX_CHARS {
        format!("{}...", truncate_chars(query, SUMMARY_TRUNCATED_CHARS))
    } else {
        query.to_string()
    }
}

pub fn procedure_steps(tools_used: &[String], success: bool) -> Vec<String> {
    let mut steps = TOOL_STEPS
        .iter()
        .filter(|(tool, _)| tools_used.iter().any(|used| used == tool))
        .map(|(_, step)| step.to_string())
        .collect::<Vec<_>>();
    steps.push(if success {
        "Consulta resuelta exitosamente".to_string()
    } else {
        "Consulta no resuelta".to_string()
    });
    steps
}
