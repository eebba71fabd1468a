use crate::{
    count_records, insert_episodic, query_episodic, query_procedural,
    query_semantic, query_session_metadata, table_name, upsert_procedural, upsert_semantic,
    LocalStore, ProceduralFilter, ProceduralRow, SemanticFilter, SemanticRow, StorageError,
};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rusqlite::{params, Connection};
use std::io::{Read, Write};
use tony_core::{format_timestamp, RecordKind, SessionSnapshot};
use tracing::{info, warn};

const RECORD_KINDS: [RecordKind; 3] = [
    RecordKind::Episodic,
    RecordKind::Semantic,
    RecordKind::Procedural,
];

pub fn encode_snapshot(snapshot: &SessionSnapshot) -> Result<Vec<u8>, StorageError> {
    let json = serde_json::to_vec(snapshot)
        .map_err(|err| StorageError::Serialization(err.to_string()))?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&json)
        .map_err(|err| StorageError::Compression(err.to_string()))?;
    encoder
        .finish()
        .map_err(|err| StorageError::Compression(err.to_string()))
}

pub fn decode_snapshot(blob: &[u8]) -> Result<SessionSnapshot, StorageError> {
    let mut decoder = GzDecoder::new(blob);
    let mut json = Vec::new();
    decoder
        .read_to_end(&mut json)
        .map_err(|err| StorageError::Compression(err.to_string()))?;
    serde_json::from_slice(&json).map_err(|err| StorageError::Serialization(err.to_string()))
}

impl LocalStore {
    /// Snapshots all three record sets into the session's metadata row, replacing any
    /// previous backup. Returns the compressed size in bytes.
    pub fn create_backup(&self, session_id: &str) -> Result<usize, StorageError> {
        let conn = self.conn();
        write_backup(&conn, session_id, Utc::now())
    }

    /// Decodes the stored backup. A blob that fails to decode is reported and treated
    /// as absent.
    pub fn load_backup(&self, session_id: &str) -> Result<Option<SessionSnapshot>, StorageError> {
        let metadata = {
            let conn = self.conn();
            query_session_metadata(&conn, session_id)?
        };
        let Some(blob) = metadata.and_then(|metadata| metadata.compressed_backup) else {
            return Ok(None);
        };
        if blob.is_empty() {
            return Ok(None);
        }

        match decode_snapshot(&blob) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(err) => {
                warn!(
                    event = "backup_corrupt",
                    session_id,
                    bytes = blob.len(),
                    error = %err
                );
                Ok(None)
            }
        }
    }

    /// Re-inserts backed-up records into every record set that is currently empty.
    pub fn restore_backup(&self, session_id: &str) -> Result<bool, StorageError> {
        let Some(snapshot) = self.load_backup(session_id)? else {
            return Ok(false);
        };

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut restored = [0usize; 3];

        if count_records(&tx, RecordKind::Episodic, session_id)? == 0 {
            for record in &snapshot.episodic {
                let metadata_json = serde_json::to_string(&record.metadata)
                    .map_err(|err| StorageError::Serialization(err.to_string()))?;
                insert_episodic(
                    &tx,
                    session_id,
                    record.message_type,
                    &record.content,
                    &metadata_json,
                    record.created_at,
                    record.synced_to_remote,
                )?;
                restored[0] += 1;
            }
        }

        if count_records(&tx, RecordKind::Semantic, session_id)? == 0 {
            for record in &snapshot.semantic {
                upsert_semantic(
                    &tx,
                    &SemanticRow {
                        session_id,
                        concept: &record.concept,
                        knowledge: &record.knowledge,
                        category: &record.category,
                        confidence: record.confidence,
                        created_at: record.created_at,
                        updated_at: record.updated_at,
                        synced: record.synced_to_remote,
                    },
                )?;
                restored[1] += 1;
            }
        }

        if count_records(&tx, RecordKind::Procedural, session_id)? == 0 {
            for record in &snapshot.procedural {
                upsert_procedural(
                    &tx,
                    &ProceduralRow {
                        session_id,
                        procedure_name: &record.procedure_name,
                        steps: &record.steps,
                        context: &record.context,
                        success_rate: record.success_rate,
                        usage_count: record.usage_count,
                        created_at: record.created_at,
                        last_used: record.last_used,
                        synced: record.synced_to_remote,
                    },
                )?;
                restored[2] += 1;
            }
        }

        tx.commit()?;
        info!(
            event = "backup_restored",
            session_id,
            backup_timestamp = %snapshot.timestamp,
            episodic = restored[0],
            semantic = restored[1],
            procedural = restored[2]
        );
        Ok(true)
    }

    pub fn cleanup_sessions_older_than(&self, days: i64) -> Result<usize, StorageError> {
        let cutoff = Utc::now() - chrono::Duration::days(days.max(0));
        self.cleanup_sessions_before(cutoff)
    }

    /// Archives every session idle since before `cutoff`: backup first, then its record
    /// sets are deleted in the same transaction. The metadata row keeps the backup.
    pub fn cleanup_sessions_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        let mut conn = self.conn();
        let candidates = {
            let mut statement = conn.prepare(
                "
                SELECT session_id
                FROM session_metadata
                WHERE last_activity < ?1
                ORDER BY last_activity ASC
                ",
            )?;
            let rows = statement.query_map([format_timestamp(cutoff)], |row| row.get(0))?;
            let mut ids: Vec<String> = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            ids
        };

        let mut archived = 0;
        for session_id in candidates {
            let tx = conn.transaction()?;
            let mut rows = 0;
            for kind in RECORD_KINDS {
                rows += count_records(&tx, kind, &session_id)?;
            }
            if rows == 0 {
                continue;
            }

            let bytes = write_backup(&tx, &session_id, Utc::now())?;
            for kind in RECORD_KINDS {
                tx.execute(
                    &format!("DELETE FROM {} WHERE session_id = ?1", table_name(kind)),
                    [&session_id],
                )?;
            }
            tx.commit()?;

            archived += 1;
            info!(event = "session_archived", session_id = %session_id, rows, bytes);
        }

        Ok(archived)
    }
}

fn write_backup(
    conn: &Connection,
    session_id: &str,
    now: DateTime<Utc>,
) -> Result<usize, StorageError> {
    let snapshot = SessionSnapshot {
        session_id: session_id.to_string(),
        timestamp: now,
        episodic: query_episodic(conn, session_id, None)?,
        semantic: query_semantic(conn, session_id, &SemanticFilter::default())?,
        procedural: query_procedural(conn, session_id, &ProceduralFilter::default())?,
    };
    let blob = encode_snapshot(&snapshot)?;

    conn.execute(
        "
        INSERT INTO session_metadata (
            session_id,
            last_activity,
            total_messages,
            compressed_backup,
            backup_timestamp
        ) VALUES (?1, ?2, 0, ?3, ?2)
        ON CONFLICT(session_id) DO UPDATE SET
            compressed_backup = excluded.compressed_backup,
            backup_timestamp = excluded.backup_timestamp
        ",
        params![session_id, format_timestamp(now), blob],
    )?;

    info!(
        event = "backup_created",
        session_id,
        bytes = blob.len(),
        episodic = snapshot.episodic.len(),
        semantic = snapshot.semantic.len(),
        procedural = snapshot.procedural.len()
    );
    Ok(blob.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};
    use tony_core::MessageType;

    fn seed(store: &LocalStore, session_id: &str) {
        let metadata = json!({ "context": "whatsapp" })
            .as_object()
            .cloned()
            .expect("object");
        store
            .save_episodic(session_id, MessageType::Human, "mi nombre es Ana", &metadata)
            .expect("human");
        store
            .save_episodic(session_id, MessageType::Ai, "Hola Ana", &Map::new())
            .expect("ai");
        store
            .save_semantic(session_id, "user_name", "Ana", "user_profile", 0.8)
            .expect("semantic");
        store
            .save_procedural(
                session_id,
                "consulta_vacaciones",
                &["Búsqueda en documentos internos".to_string()],
                "Consulta sobre: vacaciones",
                1.0,
            )
            .expect("procedural");
    }

    fn wipe(store: &LocalStore, session_id: &str) {
        for kind in RECORD_KINDS {
            store.delete_records(kind, session_id).expect("delete");
        }
    }

    #[test]
    fn restore_without_backup_returns_false() {
        let store = LocalStore::open_in_memory().expect("open db");
        assert!(!store.restore_backup("nobody").expect("restore"));
        assert!(store.load_backup("nobody").expect("load").is_none());
    }

    #[test]
    fn backup_then_restore_reproduces_all_record_sets() {
        let store = LocalStore::open_in_memory().expect("open db");
        seed(&store, "s1");
        let before_episodic = store.get_episodic("s1", None).expect("episodic");
        let before_semantic = store
            .get_semantic("s1", &SemanticFilter::default())
            .expect("semantic");

        let bytes = store.create_backup("s1").expect("backup");
        assert!(bytes > 0);
        let metadata = store
            .session_metadata("s1")
            .expect("metadata")
            .expect("row");
        assert!(metadata.has_backup());
        assert!(metadata.backup_timestamp.is_some());

        wipe(&store, "s1");
        assert!(store.restore_backup("s1").expect("restore"));

        let after_episodic = store.get_episodic("s1", None).expect("episodic");
        assert_eq!(after_episodic.len(), before_episodic.len());
        for (before, after) in before_episodic.iter().zip(&after_episodic) {
            assert_eq!(before.content, after.content);
            assert_eq!(before.message_type, after.message_type);
            assert_eq!(before.created_at, after.created_at);
            assert_eq!(before.metadata, after.metadata);
        }

        let after_semantic = store
            .get_semantic("s1", &SemanticFilter::default())
            .expect("semantic");
        assert_eq!(after_semantic.len(), 1);
        assert_eq!(after_semantic[0].knowledge, before_semantic[0].knowledge);
        assert_eq!(after_semantic[0].updated_at, before_semantic[0].updated_at);

        let procedures = store
            .get_procedural("s1", &ProceduralFilter::default())
            .expect("procedural");
        assert_eq!(procedures[0].steps.len(), 1);
        assert_eq!(
            store
                .session_metadata("s1")
                .expect("metadata")
                .expect("row")
                .total_messages,
            2
        );
    }

    #[test]
    fn restore_never_overwrites_non_empty_sets() {
        let store = LocalStore::open_in_memory().expect("open db");
        seed(&store, "s1");
        store.create_backup("s1").expect("backup");

        store
            .delete_records(RecordKind::Episodic, "s1")
            .expect("delete episodic");
        store
            .save_semantic("s1", "user_name", "Beatriz", "user_profile", 0.8)
            .expect("newer semantic");

        assert!(store.restore_backup("s1").expect("restore"));
        assert_eq!(store.get_episodic("s1", None).expect("episodic").len(), 2);
        let semantic = store
            .get_semantic("s1", &SemanticFilter::concept("user_name"))
            .expect("semantic");
        assert_eq!(semantic[0].knowledge, "Beatriz");
    }

    #[test]
    fn second_backup_replaces_the_first() {
        let store = LocalStore::open_in_memory().expect("open db");
        seed(&store, "s1");
        store.create_backup("s1").expect("first backup");
        let first = store
            .session_metadata("s1")
            .expect("metadata")
            .expect("row")
            .backup_timestamp
            .expect("timestamp");

        store
            .save_episodic("s1", MessageType::Human, "otra consulta", &Map::new())
            .expect("save");
        store.create_backup("s1").expect("second backup");

        let snapshot = store.load_backup("s1").expect("load").expect("snapshot");
        assert_eq!(snapshot.episodic.len(), 3);
        assert!(snapshot.timestamp >= first);
    }

    #[test]
    fn corrupt_blob_is_treated_as_missing() {
        let store = LocalStore::open_in_memory().expect("open db");
        seed(&store, "s1");
        store
            .conn()
            .execute(
                "UPDATE session_metadata SET compressed_backup = ?1 WHERE session_id = 's1'",
                [vec![0x1f_u8, 0x8b, 0x00, 0x42]],
            )
            .expect("corrupt blob");

        assert!(store.load_backup("s1").expect("load").is_none());
        assert!(!store.restore_backup("s1").expect("restore"));
    }

    #[test]
    fn cleanup_archives_cold_sessions_into_restorable_backup() {
        let store = LocalStore::open_in_memory().expect("open db");
        seed(&store, "cold");
        seed(&store, "warm");
        store
            .conn()
            .execute(
                "UPDATE session_metadata SET last_activity = ?1 WHERE session_id = 'cold'",
                [format_timestamp(Utc::now() - chrono::Duration::days(45))],
            )
            .expect("age session");

        assert_eq!(store.cleanup_sessions_older_than(30).expect("cleanup"), 1);
        for kind in RECORD_KINDS {
            assert_eq!(store.record_count(kind, "cold").expect("count"), 0);
            assert!(store.record_count(kind, "warm").expect("count") > 0);
        }
        let metadata = store
            .session_metadata("cold")
            .expect("metadata")
            .expect("row survives");
        assert!(metadata.has_backup());

        // already archived: nothing to do, backup kept
        assert_eq!(store.cleanup_sessions_older_than(30).expect("cleanup"), 0);

        assert!(store.restore_backup("cold").expect("restore"));
        assert_eq!(store.get_episodic("cold", None).expect("episodic").len(), 2);
        assert_eq!(
            store
                .record_count(RecordKind::Procedural, "cold")
                .expect("count"),
            1
        );
    }

    #[test]
    fn snapshot_codec_rejects_plain_json() {
        let err = decode_snapshot(br#"{"session_id":"s1"}"#).expect_err("not gzip");
        assert!(matches!(err, StorageError::Compression(_)));
    }
}
