use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tony_core::records::clamp_unit;
use tony_core::{
    format_timestamp, parse_timestamp, EpisodicRecord, MessageType, ProceduralRecord, RecordKind,
    SemanticRecord, SessionMetadata,
};
use tracing::debug;

mod backup;

pub use backup::{decode_snapshot, encode_snapshot};

pub const MEMORY_SCHEMA_VERSION: i64 = 1;
pub const DATABASE_FILE_NAME: &str = "memory.db";

const EPISODIC_COLUMNS: &str =
    "id, session_id, message_type, content, metadata_json, created_at, synced_to_remote";
const SEMANTIC_COLUMNS: &str = "id, session_id, concept, knowledge, category, confidence, created_at, updated_at, synced_to_remote";
const PROCEDURAL_COLUMNS: &str = "id, session_id, procedure_name, steps_json, context, success_rate, usage_count, created_at, last_used, synced_to_remote";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("backup compression error: {0}")]
    Compression(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SemanticFilter {
    pub concept: Option<String>,
    pub category: Option<String>,
}

impl SemanticFilter {
    pub fn concept(concept: impl Into<String>) -> Self {
        Self {
            concept: Some(concept.into()),
            category: None,
        }
    }

    pub fn category(category: impl Into<String>) -> Self {
        Self {
            concept: None,
            category: Some(category.into()),
        }
    }

    /// Stable string form used as a read-cache key.
    pub fn cache_key(&self) -> String {
        format!(
            "concept={}|category={}",
            self.concept.as_deref().unwrap_or("*"),
            self.category.as_deref().unwrap_or("*")
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProceduralFilter {
    pub name: Option<String>,
    pub context: Option<String>,
}

impl ProceduralFilter {
    pub fn name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            context: None,
        }
    }

    pub fn context(context: impl Into<String>) -> Self {
        Self {
            name: None,
            context: Some(context.into()),
        }
    }

    pub fn cache_key(&self) -> String {
        format!(
            "name={}|context={}",
            self.name.as_deref().unwrap_or("*"),
            self.context.as_deref().unwrap_or("*")
        )
    }
}

/// Embedded SQLite store for the three memory kinds plus per-session metadata.
///
/// One connection is shared process-wide behind a mutex; compound writes run in a
/// single transaction while the lock is held, so `total_messages` never loses updates.
pub struct LocalStore {
    conn: Mutex<Connection>,
}

impl LocalStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        Self::from_connection(conn)
    }

    /// Opens `memory.db` inside `dir`, creating the directory when needed.
    pub fn open_in_dir(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        Self::open(dir.join(DATABASE_FILE_NAME))
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn()
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let conn = self.conn();
        let current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if current > MEMORY_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: MEMORY_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_memory_schema.sql");
            conn.execute_batch(sql)?;
            conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
        }

        Ok(())
    }

    pub fn table_exists(&self, table: &str) -> Result<bool, StorageError> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Inserts one conversation turn and bumps the session's activity counters atomically.
    pub fn save_episodic(
        &self,
        session_id: &str,
        message_type: MessageType,
        content: &str,
        metadata: &Map<String, Value>,
    ) -> Result<i64, StorageError> {
        let metadata_json = serde_json::to_string(metadata)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        let now = Utc::now();

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let id = insert_episodic(
            &tx,
            session_id,
            message_type,
            content,
            &metadata_json,
            now,
            false,
        )?;
        touch_session(&tx, session_id, now)?;
        tx.commit()?;

        debug!(event = "episodic_saved", session_id, id);
        Ok(id)
    }

    pub fn save_semantic(
        &self,
        session_id: &str,
        concept: &str,
        knowledge: &str,
        category: &str,
        confidence: f64,
    ) -> Result<i64, StorageError> {
        let now = Utc::now();
        let conn = self.conn();
        let id = upsert_semantic(
            &conn,
            &SemanticRow {
                session_id,
                concept,
                knowledge,
                category,
                confidence: clamp_unit(confidence),
                created_at: now,
                updated_at: now,
                synced: false,
            },
        )?;
        debug!(event = "semantic_saved", session_id, concept, id);
        Ok(id)
    }

    pub fn save_procedural(
        &self,
        session_id: &str,
        procedure_name: &str,
        steps: &[String],
        context: &str,
        success_rate: f64,
    ) -> Result<i64, StorageError> {
        let now = Utc::now();
        let conn = self.conn();
        let id = upsert_procedural(
            &conn,
            &ProceduralRow {
                session_id,
                procedure_name,
                steps,
                context,
                success_rate: clamp_unit(success_rate),
                usage_count: 1,
                created_at: now,
                last_used: now,
                synced: false,
            },
        )?;
        debug!(event = "procedural_saved", session_id, procedure_name, id);
        Ok(id)
    }

    /// Persists a running-average update; returns the local row id when the procedure exists.
    pub fn record_procedure_outcome(
        &self,
        session_id: &str,
        procedure_name: &str,
        success_rate: f64,
        usage_count: i64,
    ) -> Result<Option<i64>, StorageError> {
        let id = self
            .conn()
            .query_row(
                "
                UPDATE procedural_memory
                SET success_rate = ?3,
                    usage_count = ?4,
                    last_used = ?5,
                    synced_to_remote = 0
                WHERE session_id = ?1 AND procedure_name = ?2
                RETURNING id
                ",
                params![
                    session_id,
                    procedure_name,
                    clamp_unit(success_rate),
                    usage_count.max(1),
                    format_timestamp(Utc::now()),
                ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Episodic records in creation order; `limit` keeps the oldest `limit` records.
    pub fn get_episodic(
        &self,
        session_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<EpisodicRecord>, StorageError> {
        let conn = self.conn();
        query_episodic(&conn, session_id, limit)
    }

    /// The newest `count` episodic records, still returned oldest first.
    pub fn recent_episodic(
        &self,
        session_id: &str,
        count: usize,
    ) -> Result<Vec<EpisodicRecord>, StorageError> {
        let conn = self.conn();
        let mut statement = conn.prepare(&format!(
            "
            SELECT {EPISODIC_COLUMNS}
            FROM episodic_memory
            WHERE session_id = ?1
            ORDER BY created_at DESC, id DESC
            LIMIT ?2
            "
        ))?;
        let rows = statement.query_map(params![session_id, count as i64], episodic_from_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        records.reverse();
        Ok(records)
    }

    pub fn get_semantic(
        &self,
        session_id: &str,
        filter: &SemanticFilter,
    ) -> Result<Vec<SemanticRecord>, StorageError> {
        let conn = self.conn();
        query_semantic(&conn, session_id, filter)
    }

    pub fn get_procedural(
        &self,
        session_id: &str,
        filter: &ProceduralFilter,
    ) -> Result<Vec<ProceduralRecord>, StorageError> {
        let conn = self.conn();
        query_procedural(&conn, session_id, filter)
    }

    pub fn mark_synced(&self, kind: RecordKind, id: i64) -> Result<(), StorageError> {
        self.conn().execute(
            &format!(
                "UPDATE {} SET synced_to_remote = 1 WHERE id = ?1",
                table_name(kind)
            ),
            [id],
        )?;
        Ok(())
    }

    /// Rows of the session whose remote mirror write never succeeded.
    pub fn unsynced_count(&self, session_id: &str) -> Result<i64, StorageError> {
        let count = self.conn().query_row(
            "
            SELECT
                (SELECT COUNT(*) FROM episodic_memory WHERE session_id = ?1 AND synced_to_remote = 0)
              + (SELECT COUNT(*) FROM semantic_memory WHERE session_id = ?1 AND synced_to_remote = 0)
              + (SELECT COUNT(*) FROM procedural_memory WHERE session_id = ?1 AND synced_to_remote = 0)
            ",
            [session_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn record_count(&self, kind: RecordKind, session_id: &str) -> Result<i64, StorageError> {
        let conn = self.conn();
        count_records(&conn, kind, session_id)
    }

    /// Rows of one kind the remote store never confirmed.
    pub fn unsynced_records(&self, kind: RecordKind, session_id: &str) -> Result<i64, StorageError> {
        let count = self.conn().query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE session_id = ?1 AND synced_to_remote = 0",
                table_name(kind)
            ),
            [session_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn delete_records(&self, kind: RecordKind, session_id: &str) -> Result<usize, StorageError> {
        let removed = self.conn().execute(
            &format!("DELETE FROM {} WHERE session_id = ?1", table_name(kind)),
            [session_id],
        )?;
        debug!(event = "records_deleted", kind = %kind, session_id, removed);
        Ok(removed)
    }

    pub fn delete_procedures_with_prefix(
        &self,
        session_id: &str,
        prefix: &str,
    ) -> Result<usize, StorageError> {
        let removed = self.conn().execute(
            "
            DELETE FROM procedural_memory
            WHERE session_id = ?1 AND substr(procedure_name, 1, length(?2)) = ?2
            ",
            params![session_id, prefix],
        )?;
        Ok(removed)
    }

    pub fn session_metadata(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionMetadata>, StorageError> {
        let conn = self.conn();
        query_session_metadata(&conn, session_id)
    }

    pub fn session_ids(&self) -> Result<Vec<String>, StorageError> {
        let conn = self.conn();
        let mut statement =
            conn.prepare("SELECT session_id FROM session_metadata ORDER BY session_id ASC")?;
        let rows = statement.query_map([], |row| row.get(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }
}

pub(crate) struct SemanticRow<'a> {
    pub session_id: &'a str,
    pub concept: &'a str,
    pub knowledge: &'a str,
    pub category: &'a str,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub synced: bool,
}

pub(crate) struct ProceduralRow<'a> {
    pub session_id: &'a str,
    pub procedure_name: &'a str,
    pub steps: &'a [String],
    pub context: &'a str,
    pub success_rate: f64,
    pub usage_count: i64,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub synced: bool,
}

pub(crate) fn table_name(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::Episodic => "episodic_memory",
        RecordKind::Semantic => "semantic_memory",
        RecordKind::Procedural => "procedural_memory",
    }
}

pub(crate) fn insert_episodic(
    conn: &Connection,
    session_id: &str,
    message_type: MessageType,
    content: &str,
    metadata_json: &str,
    created_at: DateTime<Utc>,
    synced: bool,
) -> Result<i64, StorageError> {
    conn.execute(
        "
        INSERT INTO episodic_memory (
            session_id,
            message_type,
            content,
            metadata_json,
            created_at,
            synced_to_remote
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ",
        params![
            session_id,
            message_type.as_str(),
            content,
            metadata_json,
            format_timestamp(created_at),
            synced,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn touch_session(
    conn: &Connection,
    session_id: &str,
    now: DateTime<Utc>,
) -> Result<(), StorageError> {
    conn.execute(
        "
        INSERT INTO session_metadata (session_id, last_activity, total_messages)
        VALUES (?1, ?2, 1)
        ON CONFLICT(session_id) DO UPDATE SET
            last_activity = excluded.last_activity,
            total_messages = session_metadata.total_messages + 1
        ",
        params![session_id, format_timestamp(now)],
    )?;
    Ok(())
}

pub(crate) fn upsert_semantic(conn: &Connection, row: &SemanticRow<'_>) -> Result<i64, StorageError> {
    let id = conn.query_row(
        "
        INSERT INTO semantic_memory (
            session_id,
            concept,
            knowledge,
            category,
            confidence,
            created_at,
            updated_at,
            synced_to_remote
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(session_id, concept) DO UPDATE SET
            knowledge = excluded.knowledge,
            category = excluded.category,
            confidence = excluded.confidence,
            updated_at = excluded.updated_at,
            synced_to_remote = excluded.synced_to_remote
        RETURNING id
        ",
        params![
            row.session_id,
            row.concept,
            row.knowledge,
            row.category,
            row.confidence,
            format_timestamp(row.created_at),
            format_timestamp(row.updated_at),
            row.synced,
        ],
        |row| row.get(0),
    )?;
    Ok(id)
}

pub(crate) fn upsert_procedural(
    conn: &Connection,
    row: &ProceduralRow<'_>,
) -> Result<i64, StorageError> {
    let steps_json = serde_json::to_string(row.steps)
        .map_err(|err| StorageError::Serialization(err.to_string()))?;
    let id = conn.query_row(
        "
        INSERT INTO procedural_memory (
            session_id,
            procedure_name,
            steps_json,
            context,
            success_rate,
            usage_count,
            created_at,
            last_used,
            synced_to_remote
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT(session_id, procedure_name) DO UPDATE SET
            steps_json = excluded.steps_json,
            context = excluded.context,
            success_rate = excluded.success_rate,
            last_used = excluded.last_used,
            synced_to_remote = excluded.synced_to_remote
        RETURNING id
        ",
        params![
            row.session_id,
            row.procedure_name,
            steps_json,
            row.context,
            row.success_rate,
            row.usage_count.max(1),
            format_timestamp(row.created_at),
            format_timestamp(row.last_used),
            row.synced,
        ],
        |row| row.get(0),
    )?;
    Ok(id)
}

pub(crate) fn query_episodic(
    conn: &Connection,
    session_id: &str,
    limit: Option<usize>,
) -> Result<Vec<EpisodicRecord>, StorageError> {
    let mut statement = conn.prepare(&format!(
        "
        SELECT {EPISODIC_COLUMNS}
        FROM episodic_memory
        WHERE session_id = ?1
        ORDER BY created_at ASC, id ASC
        LIMIT ?2
        "
    ))?;
    let limit = limit.map(|value| value as i64).unwrap_or(-1);
    let rows = statement.query_map(params![session_id, limit], episodic_from_row)?;

    let mut records = Vec::new();
    for row in rows {
        records.push(row?);
    }
    Ok(records)
}

pub(crate) fn query_semantic(
    conn: &Connection,
    session_id: &str,
    filter: &SemanticFilter,
) -> Result<Vec<SemanticRecord>, StorageError> {
    let mut statement = conn.prepare(&format!(
        "
        SELECT {SEMANTIC_COLUMNS}
        FROM semantic_memory
        WHERE session_id = ?1
          AND (?2 IS NULL OR instr(lower(concept), lower(?2)) > 0)
          AND (?3 IS NULL OR category = ?3)
        ORDER BY created_at ASC, id ASC
        "
    ))?;
    let rows = statement.query_map(
        params![session_id, filter.concept, filter.category],
        semantic_from_row,
    )?;

    let mut records = Vec::new();
    for row in rows {
        records.push(row?);
    }
    Ok(records)
}

pub(crate) fn query_procedural(
    conn: &Connection,
    session_id: &str,
    filter: &ProceduralFilter,
) -> Result<Vec<ProceduralRecord>, StorageError> {
    let mut statement = conn.prepare(&format!(
        "
        SELECT {PROCEDURAL_COLUMNS}
        FROM procedural_memory
        WHERE session_id = ?1
          AND (?2 IS NULL OR instr(lower(procedure_name), lower(?2)) > 0)
          AND (?3 IS NULL OR instr(lower(context), lower(?3)) > 0)
        ORDER BY created_at ASC, id ASC
        "
    ))?;
    let rows = statement.query_map(
        params![session_id, filter.name, filter.context],
        procedural_from_row,
    )?;

    let mut records = Vec::new();
    for row in rows {
        records.push(row?);
    }
    Ok(records)
}

pub(crate) fn count_records(
    conn: &Connection,
    kind: RecordKind,
    session_id: &str,
) -> Result<i64, StorageError> {
    let count = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM {} WHERE session_id = ?1",
            table_name(kind)
        ),
        [session_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub(crate) fn query_session_metadata(
    conn: &Connection,
    session_id: &str,
) -> Result<Option<SessionMetadata>, StorageError> {
    let metadata = conn
        .query_row(
            "
            SELECT session_id, last_activity, total_messages, compressed_backup, backup_timestamp
            FROM session_metadata
            WHERE session_id = ?1
            ",
            [session_id],
            |row| {
                let backup_timestamp = row
                    .get::<_, Option<String>>(4)?
                    .map(|value| {
                        parse_timestamp(&value).map_err(|err| conversion_error(4, err))
                    })
                    .transpose()?;
                Ok(SessionMetadata {
                    session_id: row.get(0)?,
                    last_activity: timestamp_column(row, 1)?,
                    total_messages: row.get(2)?,
                    compressed_backup: row.get(3)?,
                    backup_timestamp,
                })
            },
        )
        .optional()?;
    Ok(metadata)
}

fn episodic_from_row(row: &Row<'_>) -> rusqlite::Result<EpisodicRecord> {
    let message_type_raw: String = row.get(2)?;
    let message_type = message_type_raw
        .parse::<MessageType>()
        .map_err(|reason| conversion_error(2, invalid_data(reason)))?;
    let metadata_json: String = row.get(4)?;
    let metadata: Map<String, Value> =
        serde_json::from_str(&metadata_json).map_err(|err| conversion_error(4, err))?;

    Ok(EpisodicRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        message_type,
        content: row.get(3)?,
        metadata,
        created_at: timestamp_column(row, 5)?,
        synced_to_remote: row.get::<_, i64>(6)? != 0,
    })
}

fn semantic_from_row(row: &Row<'_>) -> rusqlite::Result<SemanticRecord> {
    Ok(SemanticRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        concept: row.get(2)?,
        knowledge: row.get(3)?,
        category: row.get(4)?,
        confidence: row.get(5)?,
        created_at: timestamp_column(row, 6)?,
        updated_at: timestamp_column(row, 7)?,
        synced_to_remote: row.get::<_, i64>(8)? != 0,
    })
}

fn procedural_from_row(row: &Row<'_>) -> rusqlite::Result<ProceduralRecord> {
    let steps_json: String = row.get(3)?;
    let steps: Vec<String> =
        serde_json::from_str(&steps_json).map_err(|err| conversion_error(3, err))?;

    Ok(ProceduralRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        procedure_name: row.get(2)?,
        steps,
        context: row.get(4)?,
        success_rate: row.get(5)?,
        usage_count: row.get(6)?,
        created_at: timestamp_column(row, 7)?,
        last_used: timestamp_column(row, 8)?,
        synced_to_remote: row.get::<_, i64>(9)? != 0,
    })
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw).map_err(|err| conversion_error(idx, err))
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn invalid_data(reason: String) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::thread;
    use tempfile::tempdir;

    fn metadata(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("object metadata")
    }

    #[test]
    fn migration_creates_memory_tables() {
        let store = LocalStore::open_in_memory().expect("open db");

        for table in [
            "episodic_memory",
            "semantic_memory",
            "procedural_memory",
            "session_metadata",
        ] {
            assert!(store.table_exists(table).expect("table check"));
        }
        assert_eq!(
            store.schema_version().expect("schema version"),
            MEMORY_SCHEMA_VERSION
        );
    }

    #[test]
    fn reopening_file_database_keeps_rows_and_schema() {
        let dir = tempdir().expect("temp dir");
        {
            let store = LocalStore::open_in_dir(dir.path().join("nested")).expect("open");
            store
                .save_episodic("s1", MessageType::Human, "hola", &Map::new())
                .expect("save");
        }

        let store = LocalStore::open_in_dir(dir.path().join("nested")).expect("reopen");
        assert_eq!(store.schema_version().expect("version"), MEMORY_SCHEMA_VERSION);
        assert_eq!(
            store
                .record_count(RecordKind::Episodic, "s1")
                .expect("count"),
            1
        );
    }

    #[test]
    fn episodic_records_come_back_in_insertion_order() {
        let store = LocalStore::open_in_memory().expect("open db");
        for idx in 0..5 {
            store
                .save_episodic(
                    "s1",
                    if idx % 2 == 0 {
                        MessageType::Human
                    } else {
                        MessageType::Ai
                    },
                    &format!("turn {idx}"),
                    &metadata(json!({ "turn": idx })),
                )
                .expect("save");
        }
        store
            .save_episodic("s2", MessageType::Human, "other session", &Map::new())
            .expect("save other");

        let records = store.get_episodic("s1", None).expect("load");
        let contents = records
            .iter()
            .map(|record| record.content.as_str())
            .collect::<Vec<_>>();
        assert_eq!(contents, vec!["turn 0", "turn 1", "turn 2", "turn 3", "turn 4"]);
        assert!(records
            .windows(2)
            .all(|pair| pair[0].created_at <= pair[1].created_at));
        assert_eq!(records[3].metadata.get("turn"), Some(&json!(3)));
        assert!(records.iter().all(|record| record.session_id == "s1"));

        let limited = store.get_episodic("s1", Some(2)).expect("limited");
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].content, "turn 0");

        let recent = store.recent_episodic("s1", 2).expect("recent");
        assert_eq!(recent[0].content, "turn 3");
        assert_eq!(recent[1].content, "turn 4");
    }

    #[test]
    fn episodic_writes_bump_session_metadata() {
        let store = LocalStore::open_in_memory().expect("open db");
        store
            .save_episodic("s1", MessageType::Human, "uno", &Map::new())
            .expect("save");
        let first = store
            .session_metadata("s1")
            .expect("metadata")
            .expect("row exists");
        store
            .save_episodic("s1", MessageType::Ai, "dos", &Map::new())
            .expect("save");
        let second = store
            .session_metadata("s1")
            .expect("metadata")
            .expect("row exists");

        assert_eq!(first.total_messages, 1);
        assert_eq!(second.total_messages, 2);
        assert!(second.last_activity >= first.last_activity);
        assert!(!second.has_backup());
    }

    #[test]
    fn concurrent_episodic_writes_do_not_lose_counter_updates() {
        let store = Arc::new(LocalStore::open_in_memory().expect("open db"));
        let handles = (0..4)
            .map(|worker| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for idx in 0..25 {
                        store
                            .save_episodic(
                                "shared",
                                MessageType::Human,
                                &format!("w{worker}-{idx}"),
                                &Map::new(),
                            )
                            .expect("save");
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().expect("worker");
        }

        let metadata = store
            .session_metadata("shared")
            .expect("metadata")
            .expect("row");
        assert_eq!(metadata.total_messages, 100);
        assert_eq!(
            store
                .record_count(RecordKind::Episodic, "shared")
                .expect("count"),
            100
        );
    }

    #[test]
    fn semantic_upsert_keeps_single_row_per_concept() {
        let store = LocalStore::open_in_memory().expect("open db");
        let first = store
            .save_semantic("s1", "x", "v1", "general", 0.4)
            .expect("first");
        let second = store
            .save_semantic("s1", "x", "v2", "general", 0.9)
            .expect("second");
        store
            .save_semantic("s2", "x", "other", "general", 1.0)
            .expect("other session");

        assert_eq!(first, second);
        let rows = store
            .get_semantic("s1", &SemanticFilter::concept("x"))
            .expect("load");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].knowledge, "v2");
        assert!((rows[0].confidence - 0.9).abs() < f64::EPSILON);
        assert!(rows[0].updated_at >= rows[0].created_at);
    }

    #[test]
    fn semantic_filters_match_concept_substring_and_exact_category() {
        let store = LocalStore::open_in_memory().expect("open db");
        store
            .save_semantic("s1", "user_name", "Ana", "user_profile", 0.8)
            .expect("name");
        store
            .save_semantic("s1", "user_profession", "rrhh", "user_profile", 0.8)
            .expect("profession");
        store
            .save_semantic("s1", "discussed_topics", "laboral", "conversation_topics", 0.9)
            .expect("topics");

        let by_concept = store
            .get_semantic("s1", &SemanticFilter::concept("USER_"))
            .expect("by concept");
        assert_eq!(by_concept.len(), 2);

        let by_category = store
            .get_semantic("s1", &SemanticFilter::category("user"))
            .expect("by category");
        assert!(by_category.is_empty());

        let profile = store
            .get_semantic("s1", &SemanticFilter::category("user_profile"))
            .expect("profile");
        assert_eq!(profile.len(), 2);
    }

    #[test]
    fn confidence_is_clamped_into_unit_range() {
        let store = LocalStore::open_in_memory().expect("open db");
        store
            .save_semantic("s1", "c", "k", "general", 3.5)
            .expect("save");
        let rows = store
            .get_semantic("s1", &SemanticFilter::default())
            .expect("load");
        assert_eq!(rows[0].confidence, 1.0);
    }

    #[test]
    fn procedural_steps_roundtrip_and_outcome_updates_in_place() {
        let store = LocalStore::open_in_memory().expect("open db");
        let steps = vec!["buscar".to_string(), "responder".to_string()];
        store
            .save_procedural("s1", "consulta_vacaciones", &steps, "Consulta sobre: vacaciones", 1.0)
            .expect("save");

        let id = store
            .record_procedure_outcome("s1", "consulta_vacaciones", 0.5, 2)
            .expect("update")
            .expect("procedure exists");
        let rows = store
            .get_procedural("s1", &ProceduralFilter::name("VACACIONES"))
            .expect("load");

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, id);
        assert_eq!(rows[0].steps, steps);
        assert_eq!(rows[0].usage_count, 2);
        assert!((rows[0].success_rate - 0.5).abs() < f64::EPSILON);
        assert!(store
            .record_procedure_outcome("s1", "missing", 1.0, 2)
            .expect("update")
            .is_none());
    }

    #[test]
    fn procedural_upsert_preserves_usage_count() {
        let store = LocalStore::open_in_memory().expect("open db");
        store
            .save_procedural("s1", "p", &["a".to_string()], "ctx", 1.0)
            .expect("save");
        store
            .record_procedure_outcome("s1", "p", 1.0, 3)
            .expect("outcome");
        store
            .save_procedural("s1", "p", &["b".to_string()], "ctx2", 0.2)
            .expect("resave");

        let rows = store
            .get_procedural("s1", &ProceduralFilter::context("ctx2"))
            .expect("load");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].usage_count, 3);
        assert_eq!(rows[0].steps, vec!["b".to_string()]);
    }

    #[test]
    fn sync_flags_start_false_and_flip_after_confirmation() {
        let store = LocalStore::open_in_memory().expect("open db");
        let id = store
            .save_episodic("s1", MessageType::Human, "hola", &Map::new())
            .expect("save");
        store
            .save_semantic("s1", "c", "k", "general", 1.0)
            .expect("save semantic");
        assert_eq!(store.unsynced_count("s1").expect("unsynced"), 2);

        store
            .mark_synced(RecordKind::Episodic, id)
            .expect("mark synced");
        assert_eq!(store.unsynced_count("s1").expect("unsynced"), 1);
        assert!(store.get_episodic("s1", None).expect("load")[0].synced_to_remote);
        assert_eq!(
            store
                .unsynced_records(RecordKind::Episodic, "s1")
                .expect("episodic unsynced"),
            0
        );
        assert_eq!(
            store
                .unsynced_records(RecordKind::Semantic, "s1")
                .expect("semantic unsynced"),
            1
        );
    }

    #[test]
    fn prefix_delete_only_touches_matching_procedures() {
        let store = LocalStore::open_in_memory().expect("open db");
        for name in ["query_pattern_1", "query_pattern_2", "consulta_permisos"] {
            store
                .save_procedural("s1", name, &[], "", 1.0)
                .expect("save");
        }

        let removed = store
            .delete_procedures_with_prefix("s1", "query_pattern_")
            .expect("delete");
        assert_eq!(removed, 2);
        let remaining = store
            .get_procedural("s1", &ProceduralFilter::default())
            .expect("load");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].procedure_name, "consulta_permisos");
    }
}
