use crate::codec::{decode_embedding, encode_embedding};
use chrono::{DateTime, SecondsFormat, Utc};
use roster_core::{
    AttendanceRecord, AttendanceSession, AttendanceStatus, AttendanceStore, Candidate,
    EnrollmentStore, Identity, Pose, PoseEmbeddings, StoreError,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS students (
    roll          TEXT PRIMARY KEY,
    name          TEXT NOT NULL,
    course        TEXT NOT NULL,
    emb_center    BLOB NOT NULL,
    emb_left      BLOB NOT NULL,
    emb_right     BLOB NOT NULL,
    model_version TEXT,
    enrolled_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS attendance (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id  TEXT NOT NULL UNIQUE,
    session_id TEXT NOT NULL,
    roll       TEXT NOT NULL,
    name       TEXT NOT NULL,
    course     TEXT NOT NULL,
    time       TEXT NOT NULL,
    confidence REAL NOT NULL,
    status     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS attendance_time ON attendance (time);

CREATE TABLE IF NOT EXISTS sessions (
    id         TEXT PRIMARY KEY,
    course     TEXT,
    started_at TEXT NOT NULL
);
";

const ATTENDANCE_COLUMNS: &str =
    "id, record_id, session_id, roll, name, course, time, confidence, status";

/// Enrolled identity as listed for administration, without embeddings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrolledIdentity {
    #[serde(flatten)]
    pub identity: Identity,
    pub model_version: Option<String>,
    pub enrolled_at: DateTime<Utc>,
}

/// SQLite-backed enrollment and attendance store.
///
/// The connection sits behind a mutex so one store can be shared by both
/// adapters and handed to the engine thread.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(Box::new(e))
}

/// Fixed-width RFC 3339 so that text ordering matches time ordering.
fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {s:?}: {e}")))
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Corrupt(format!("uuid {s:?}: {e}")))
}

/// Attendance row exactly as stored.
struct AttendanceRow {
    rowid: i64,
    record_id: String,
    session_id: String,
    roll: String,
    name: String,
    course: String,
    time: String,
    confidence: f64,
    status: String,
}

impl AttendanceRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            rowid: row.get(0)?,
            record_id: row.get(1)?,
            session_id: row.get(2)?,
            roll: row.get(3)?,
            name: row.get(4)?,
            course: row.get(5)?,
            time: row.get(6)?,
            confidence: row.get(7)?,
            status: row.get(8)?,
        })
    }

    fn into_record(self) -> Result<AttendanceRecord, StoreError> {
        let status = AttendanceStatus::parse(&self.status)
            .ok_or_else(|| StoreError::Corrupt(format!("attendance status {:?}", self.status)))?;

        Ok(AttendanceRecord {
            id: parse_uuid(&self.record_id)?,
            session_id: parse_uuid(&self.session_id)?,
            identity: Identity::new(self.roll, self.name, self.course),
            timestamp: parse_time(&self.time)?,
            confidence: self.confidence as f32,
            status,
        })
    }
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", path.display())))?;
        tracing::info!(path = %path.display(), "opened roster database");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Unavailable(format!("in-memory database: {e}")))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(backend)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("database connection lock poisoned".into()))
    }

    /// Enrolled identities ordered by roll number.
    pub fn list_identities(&self) -> Result<Vec<EnrolledIdentity>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT roll, name, course, model_version, enrolled_at
                 FROM students ORDER BY roll",
            )
            .map_err(backend)?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(backend)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(backend)?;

        rows.into_iter()
            .map(|(roll, name, course, model_version, enrolled_at)| {
                Ok(EnrolledIdentity {
                    identity: Identity::new(roll, name, course),
                    model_version,
                    enrolled_at: parse_time(&enrolled_at)?,
                })
            })
            .collect()
    }

    /// Attendance records, newest first.
    pub fn list_attendance(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let conn = self.conn()?;
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {ATTENDANCE_COLUMNS} FROM attendance ORDER BY time DESC, id DESC LIMIT ?1"
            ))
            .map_err(backend)?;

        let rows = stmt
            .query_map([limit], AttendanceRow::from_row)
            .map_err(backend)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(backend)?;

        rows.into_iter().map(AttendanceRow::into_record).collect()
    }

    /// Delete an enrolled identity. Its attendance history is kept.
    pub fn remove_identity(&self, roll: &str) -> Result<bool, StoreError> {
        let removed = self
            .conn()?
            .execute("DELETE FROM students WHERE roll = ?1", [roll])
            .map_err(backend)?;
        tracing::info!(roll, removed = removed > 0, "remove identity");
        Ok(removed > 0)
    }
}

impl EnrollmentStore for SqliteStore {
    fn load_candidates(&self) -> Result<Vec<Candidate>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT roll, name, course, emb_center, emb_left, emb_right, model_version
                 FROM students ORDER BY roll",
            )
            .map_err(backend)?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    Identity::new(
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ),
                    [
                        row.get::<_, Vec<u8>>(3)?,
                        row.get::<_, Vec<u8>>(4)?,
                        row.get::<_, Vec<u8>>(5)?,
                    ],
                    row.get::<_, Option<String>>(6)?,
                ))
            })
            .map_err(backend)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(backend)?;

        let candidates = rows
            .into_iter()
            .map(|(identity, blobs, model_version)| {
                let embeddings = blobs
                    .iter()
                    .map(|blob| decode_embedding(blob, model_version.clone()))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Candidate::new(identity, embeddings))
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        tracing::debug!(count = candidates.len(), "loaded candidates");
        Ok(candidates)
    }

    fn save_embeddings(
        &self,
        identity: &Identity,
        embeddings: &PoseEmbeddings,
    ) -> Result<(), StoreError> {
        let [center, left, right] = Pose::ALL.map(|pose| encode_embedding(embeddings.get(pose)));

        self.conn()?
            .execute(
                "INSERT INTO students
                     (roll, name, course, emb_center, emb_left, emb_right,
                      model_version, enrolled_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (roll) DO UPDATE SET
                     name = excluded.name,
                     course = excluded.course,
                     emb_center = excluded.emb_center,
                     emb_left = excluded.emb_left,
                     emb_right = excluded.emb_right,
                     model_version = excluded.model_version,
                     enrolled_at = excluded.enrolled_at",
                params![
                    identity.id,
                    identity.name,
                    identity.course,
                    center,
                    left,
                    right,
                    embeddings.center.model_version(),
                    format_time(&Utc::now()),
                ],
            )
            .map_err(backend)?;

        tracing::debug!(roll = %identity.id, "saved pose embeddings");
        Ok(())
    }

    fn find_identity(&self, id: &str) -> Result<Option<Identity>, StoreError> {
        self.conn()?
            .query_row(
                "SELECT roll, name, course FROM students WHERE roll = ?1",
                [id],
                |row| {
                    Ok(Identity::new(
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(backend)
    }
}

impl AttendanceStore for SqliteStore {
    fn append(&self, record: &AttendanceRecord) -> Result<(), StoreError> {
        self.conn()?
            .execute(
                "INSERT INTO attendance
                     (record_id, session_id, roll, name, course, time, confidence, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.id.to_string(),
                    record.session_id.to_string(),
                    record.identity.id,
                    record.identity.name,
                    record.identity.course,
                    format_time(&record.timestamp),
                    record.confidence as f64,
                    record.status.as_str(),
                ],
            )
            .map_err(backend)?;
        Ok(())
    }

    fn delete_most_recent(&self) -> Result<Option<AttendanceRecord>, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(backend)?;

        let newest = tx
            .query_row(
                &format!(
                    "SELECT {ATTENDANCE_COLUMNS} FROM attendance
                     ORDER BY time DESC, id DESC LIMIT 1"
                ),
                [],
                AttendanceRow::from_row,
            )
            .optional()
            .map_err(backend)?;

        let Some(row) = newest else {
            return Ok(None);
        };
        let rowid = row.rowid;
        let record = row.into_record()?;

        tx.execute("DELETE FROM attendance WHERE id = ?1", [rowid])
            .map_err(backend)?;
        tx.commit().map_err(backend)?;

        Ok(Some(record))
    }

    fn log_session(&self, session: &AttendanceSession) -> Result<(), StoreError> {
        self.conn()?
            .execute(
                "INSERT OR IGNORE INTO sessions (id, course, started_at) VALUES (?1, ?2, ?3)",
                params![
                    session.id().to_string(),
                    session.course(),
                    format_time(&session.started_at()),
                ],
            )
            .map_err(backend)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use roster_core::Embedding;
    use tempfile::tempdir;

    fn poses(center: Vec<f32>, left: Vec<f32>, right: Vec<f32>) -> PoseEmbeddings {
        let tag = Some("facenet512".to_string());
        PoseEmbeddings {
            center: Embedding::new(center).with_model_version(tag.clone()),
            left: Embedding::new(left).with_model_version(tag.clone()),
            right: Embedding::new(right).with_model_version(tag),
        }
    }

    fn record(roll: &str, session: Uuid, at: DateTime<Utc>) -> AttendanceRecord {
        AttendanceRecord {
            id: Uuid::new_v4(),
            session_id: session,
            identity: Identity::new(roll, format!("Student {roll}"), "CS101"),
            timestamp: at,
            confidence: 0.8125,
            status: AttendanceStatus::Present,
        }
    }

    #[test]
    fn test_candidates_ordered_by_roll() {
        let store = SqliteStore::open_in_memory().unwrap();
        for roll in ["S3", "S1", "S2"] {
            let embeddings = poses(vec![1.0, 0.0], vec![0.0, 1.0], vec![1.0, 1.0]);
            store
                .save_embeddings(&Identity::new(roll, "n", "c"), &embeddings)
                .unwrap();
        }

        let rolls: Vec<String> = store
            .load_candidates()
            .unwrap()
            .into_iter()
            .map(|c| c.identity.id)
            .collect();
        assert_eq!(rolls, ["S1", "S2", "S3"]);
    }

    #[test]
    fn test_candidate_embeddings_in_pose_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .save_embeddings(
                &Identity::new("S1", "Asha", "CS101"),
                &poses(vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0], vec![0.0, 0.0, 1.0]),
            )
            .unwrap();

        let candidates = store.load_candidates().unwrap();
        assert_eq!(candidates.len(), 1);
        let embs = &candidates[0].embeddings;
        assert_eq!(embs[0].values(), &[1.0, 0.0, 0.0]);
        assert_eq!(embs[1].values(), &[0.0, 1.0, 0.0]);
        assert_eq!(embs[2].values(), &[0.0, 0.0, 1.0]);
        assert_eq!(embs[0].model_version(), Some("facenet512"));
    }

    #[test]
    fn test_re_enrollment_replaces_all_poses() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = Identity::new("S1", "Asha", "CS101");
        let first = poses(vec![1.0, 0.0], vec![1.0, 0.0], vec![1.0, 0.0]);
        store.save_embeddings(&id, &first).unwrap();

        let renamed = Identity::new("S1", "Asha R.", "CS102");
        let second = poses(vec![0.0, 1.0], vec![0.0, 1.0], vec![0.0, 1.0]);
        store.save_embeddings(&renamed, &second).unwrap();

        let candidates = store.load_candidates().unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].identity, renamed);
        assert!(candidates[0].embeddings.iter().all(|e| e.values() == [0.0, 1.0]));
    }

    #[test]
    fn test_list_and_remove_identities() {
        let store = SqliteStore::open_in_memory().unwrap();
        let embeddings = poses(vec![1.0], vec![1.0], vec![1.0]);
        store
            .save_embeddings(&Identity::new("S2", "Ben", "CS101"), &embeddings)
            .unwrap();

        let listed = store.list_identities().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].identity.name, "Ben");
        assert_eq!(listed[0].model_version.as_deref(), Some("facenet512"));

        assert!(store.remove_identity("S2").unwrap());
        assert!(!store.remove_identity("S2").unwrap());
        assert!(store.load_candidates().unwrap().is_empty());
    }

    #[test]
    fn test_append_and_list_newest_first() {
        let store = SqliteStore::open_in_memory().unwrap();
        let session = Uuid::new_v4();
        let t0 = Utc::now();
        let first = record("S1", session, t0);
        let second = record("S2", session, t0 + Duration::seconds(5));

        store.append(&second).unwrap();
        store.append(&first).unwrap();

        let listed = store.list_attendance(None).unwrap();
        assert_eq!(listed, vec![second.clone(), first]);
        assert_eq!(store.list_attendance(Some(1)).unwrap(), vec![second]);
    }

    #[test]
    fn test_delete_most_recent_removes_only_newest() {
        let store = SqliteStore::open_in_memory().unwrap();
        let session = Uuid::new_v4();
        let t0 = Utc::now();
        let older = record("S1", session, t0);
        let newer = record("S2", session, t0 + Duration::milliseconds(1));
        store.append(&older).unwrap();
        store.append(&newer).unwrap();

        assert_eq!(store.delete_most_recent().unwrap(), Some(newer));
        assert_eq!(store.list_attendance(None).unwrap(), vec![older.clone()]);
        assert_eq!(store.delete_most_recent().unwrap(), Some(older));
        assert_eq!(store.delete_most_recent().unwrap(), None);
    }

    #[test]
    fn test_log_session() {
        let store = SqliteStore::open_in_memory().unwrap();
        let session = AttendanceSession::new(Some("CS101".into()));
        store.log_session(&session).unwrap();
        store.log_session(&session).unwrap();

        let (count, course): (i64, Option<String>) = store
            .conn()
            .unwrap()
            .query_row("SELECT COUNT(*), MAX(course) FROM sessions", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(course.as_deref(), Some("CS101"));
    }

    #[test]
    fn test_find_identity() {
        let store = SqliteStore::open_in_memory().unwrap();
        let asha = Identity::new("S1", "Asha", "CS101");
        store
            .save_embeddings(&asha, &poses(vec![1.0], vec![1.0], vec![1.0]))
            .unwrap();

        assert_eq!(store.find_identity("S1").unwrap(), Some(asha));
        assert_eq!(store.find_identity("S2").unwrap(), None);
    }

    #[test]
    fn test_open_file_database() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("roster.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .save_embeddings(
                    &Identity::new("S1", "Asha", "CS101"),
                    &poses(vec![1.0], vec![1.0], vec![1.0]),
                )
                .unwrap();
        }
        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.load_candidates().unwrap().len(), 1);
    }
}
