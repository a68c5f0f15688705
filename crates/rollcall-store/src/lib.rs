//! rollcall-store — SQLite persistence for the attendance pipeline.
//!
//! All access goes through one `tokio_rusqlite` connection, so every call
//! runs serialized on the connection thread. Session status changes are
//! compare-and-set inside a transaction: a row only moves along an edge of
//! the lifecycle graph, and counters land in the same statement as
//! `completed`.

mod rows;
mod schema;

use chrono::{NaiveDate, Utc};
use rollcall_core::key::allocate_key;
use rollcall_core::{
    AttendanceRecord, AttendanceSession, ErrorKind, RecognitionResult, SessionCounters,
    SessionStatus, Student, TransitionError,
};
use rusqlite::{params, OptionalExtension};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::rows::{SESSION_COLUMNS, STUDENT_COLUMNS};
use crate::schema::MIGRATIONS;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("failed to prepare database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error("student not found: {0}")]
    StudentNotFound(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("session {0} is not processing")]
    NotProcessing(String),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Database(_) | Self::Io(_) => ErrorKind::Resource,
            _ => ErrorKind::Validation,
        }
    }
}

/// Roster-level training counts for status reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrainingCounts {
    pub total_students: u32,
    pub with_photos: u32,
    pub trained: u32,
}

/// Handle to the attendance database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the database file and apply the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).await?;
        tracing::info!(path = %path.display(), "attendance database opened");
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().await?).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.execute_batch("PRAGMA foreign_keys=ON; PRAGMA journal_mode=WAL;")?;
            for migration in MIGRATIONS {
                conn.execute_batch(migration)?;
            }
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    // --- Students ---

    /// Add a student to the roster, fixing their dataset key for good.
    pub async fn register_student(
        &self,
        name: &str,
        roster_id: Option<&str>,
    ) -> Result<Student, StoreError> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(StoreError::Invalid("student name must not be empty".into()));
        }
        let roster_id = roster_id.map(str::to_string);

        let student = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let taken: HashSet<String> = {
                    let mut stmt = tx.prepare("SELECT dataset_key FROM students")?;
                    let keys = stmt.query_map([], |row| row.get(0))?;
                    let keys = keys.collect::<rusqlite::Result<HashSet<String>>>()?;
                    keys
                };
                let student = Student {
                    id: Uuid::new_v4().to_string(),
                    dataset_key: allocate_key(&name, |k| taken.contains(k)),
                    name,
                    roster_id,
                    photos: Vec::new(),
                    embedding: None,
                    is_training_complete: false,
                    created_at: Utc::now(),
                };
                tx.execute(
                    "INSERT INTO students (id, name, roster_id, dataset_key, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        student.id,
                        student.name,
                        student.roster_id,
                        student.dataset_key,
                        student.created_at,
                    ],
                )?;
                tx.commit()?;
                Ok(student)
            })
            .await?;

        tracing::info!(id = %student.id, key = %student.dataset_key, "student registered");
        Ok(student)
    }

    pub async fn student(&self, id: &str) -> Result<Student, StoreError> {
        let lookup = id.to_string();
        let found = self
            .conn
            .call(move |conn| {
                let student = conn
                    .query_row(
                        &format!("SELECT {STUDENT_COLUMNS} FROM students WHERE id = ?1"),
                        params![lookup],
                        rows::student_from_row,
                    )
                    .optional()?;
                Ok(student)
            })
            .await?;
        found.ok_or_else(|| StoreError::StudentNotFound(id.to_string()))
    }

    pub async fn students(&self) -> Result<Vec<Student>, StoreError> {
        let students = self
            .conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare(&format!("SELECT {STUDENT_COLUMNS} FROM students ORDER BY name, id"))?;
                let rows = stmt.query_map([], rows::student_from_row)?;
                let students = rows.collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(students)
            })
            .await?;
        Ok(students)
    }

    /// Record a new set of training photos. Always drops the trained flag.
    pub async fn set_student_photos(
        &self,
        id: &str,
        photos: Vec<String>,
    ) -> Result<(), StoreError> {
        let lookup = id.to_string();
        let photos_json = serde_json::to_string(&photos)
            .map_err(|e| StoreError::Invalid(format!("photo list: {e}")))?;
        let updated = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE students SET photos = ?1, is_training_complete = 0 WHERE id = ?2",
                    params![photos_json, lookup],
                )?;
                Ok(n)
            })
            .await?;
        if updated == 0 {
            return Err(StoreError::StudentNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Flag students as trained. Returns how many rows changed.
    pub async fn mark_trained(&self, ids: Vec<String>) -> Result<usize, StoreError> {
        let changed = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut changed = 0;
                for id in &ids {
                    changed += tx.execute(
                        "UPDATE students SET is_training_complete = 1 WHERE id = ?1",
                        params![id],
                    )?;
                }
                tx.commit()?;
                Ok(changed)
            })
            .await?;
        Ok(changed)
    }

    pub async fn training_counts(&self) -> Result<TrainingCounts, StoreError> {
        let counts = self
            .conn
            .call(|conn| {
                let counts = conn.query_row(
                    "SELECT COUNT(*),
                            COALESCE(SUM(CASE WHEN photos != '[]' THEN 1 ELSE 0 END), 0),
                            COALESCE(SUM(is_training_complete), 0)
                     FROM students",
                    [],
                    |row| {
                        Ok(TrainingCounts {
                            total_students: row.get(0)?,
                            with_photos: row.get(1)?,
                            trained: row.get(2)?,
                        })
                    },
                )?;
                Ok(counts)
            })
            .await?;
        Ok(counts)
    }

    // --- Sessions ---

    pub async fn create_session(
        &self,
        class_id: Option<String>,
        capture_date: NaiveDate,
    ) -> Result<AttendanceSession, StoreError> {
        let now = Utc::now();
        let session = AttendanceSession {
            id: Uuid::new_v4().to_string(),
            class_id,
            capture_date,
            status: SessionStatus::Pending,
            counters: SessionCounters::default(),
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        let row = session.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO attendance_sessions (id, class_id, capture_date, status, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        row.id,
                        row.class_id,
                        row.capture_date,
                        row.status.as_str(),
                        row.created_at,
                        row.updated_at,
                    ],
                )?;
                Ok(())
            })
            .await?;
        tracing::info!(session = %session.id, date = %session.capture_date, "session created");
        Ok(session)
    }

    pub async fn session(&self, id: &str) -> Result<AttendanceSession, StoreError> {
        let lookup = id.to_string();
        let found = self
            .conn
            .call(move |conn| Ok(rows::load_session(conn, &lookup)?))
            .await?;
        found.ok_or_else(|| StoreError::SessionNotFound(id.to_string()))
    }

    /// `pending → processing`.
    pub async fn begin_processing(&self, id: &str) -> Result<AttendanceSession, StoreError> {
        self.set_status(id, SessionStatus::Processing, None, None).await
    }

    /// `processing → completed`, writing the counters in the same statement.
    pub async fn complete_session(
        &self,
        id: &str,
        counters: SessionCounters,
    ) -> Result<AttendanceSession, StoreError> {
        self.set_status(id, SessionStatus::Completed, Some(counters), None)
            .await
    }

    /// `pending | processing → failed`.
    pub async fn fail_session(
        &self,
        id: &str,
        reason: &str,
    ) -> Result<AttendanceSession, StoreError> {
        self.set_status(id, SessionStatus::Failed, None, Some(reason.to_string()))
            .await
    }

    async fn set_status(
        &self,
        id: &str,
        to: SessionStatus,
        counters: Option<SessionCounters>,
        reason: Option<String>,
    ) -> Result<AttendanceSession, StoreError> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let updated = transition(&tx, &id, to, counters, reason)?;
                if updated.is_ok() {
                    tx.commit()?;
                }
                Ok(updated)
            })
            .await?
    }

    /// Persist one batch and close its session.
    ///
    /// Results go in first, in worker order, then the records, then the
    /// `processing → completed` transition with its counters. All of it is
    /// one transaction: a session is never completed without its rows, and
    /// rows never outlive a batch that failed to complete.
    pub async fn complete_batch(
        &self,
        session_id: &str,
        results: Vec<RecognitionResult>,
        records: Vec<AttendanceRecord>,
        counters: SessionCounters,
    ) -> Result<AttendanceSession, StoreError> {
        let id = session_id.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                match rows::load_session(&tx, &id)? {
                    None => return Ok(Err(StoreError::SessionNotFound(id))),
                    Some(s) if s.status != SessionStatus::Processing => {
                        return Ok(Err(StoreError::NotProcessing(id)))
                    }
                    Some(_) => {}
                }
                for result in &results {
                    rows::insert_result(&tx, result)?;
                }
                for record in &records {
                    rows::insert_record(&tx, record)?;
                }
                let completed =
                    transition(&tx, &id, SessionStatus::Completed, Some(counters), None)?;
                if completed.is_ok() {
                    tx.commit()?;
                }
                Ok(completed)
            })
            .await?
    }

    pub async fn recognition_results(
        &self,
        session_id: &str,
    ) -> Result<Vec<RecognitionResult>, StoreError> {
        let id = session_id.to_string();
        let results = self
            .conn
            .call(move |conn| Ok(rows::list_results(conn, &id)?))
            .await?;
        Ok(results)
    }

    pub async fn attendance_records(
        &self,
        session_id: &str,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let id = session_id.to_string();
        let records = self
            .conn
            .call(move |conn| Ok(rows::list_records(conn, &id)?))
            .await?;
        Ok(records)
    }

    /// Force every session still marked `processing` to `failed`.
    ///
    /// Run at startup: nothing can be processing before the daemon is up.
    pub async fn fail_stale_sessions(&self, reason: &str) -> Result<Vec<String>, StoreError> {
        let reason = reason.to_string();
        let ids = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let ids = {
                    let mut stmt = tx.prepare(&format!(
                        "SELECT {SESSION_COLUMNS} FROM attendance_sessions WHERE status = 'processing'"
                    ))?;
                    let rows = stmt.query_map([], rows::session_from_row)?;
                    let ids = rows
                        .map(|r| r.map(|s| s.id))
                        .collect::<rusqlite::Result<Vec<String>>>()?;
                    ids
                };
                for id in &ids {
                    tx.execute(
                        "UPDATE attendance_sessions
                         SET status = 'failed', failure_reason = ?1, updated_at = ?2
                         WHERE id = ?3 AND status = 'processing'",
                        params![reason, Utc::now(), id],
                    )?;
                }
                tx.commit()?;
                Ok(ids)
            })
            .await?;
        if !ids.is_empty() {
            tracing::warn!(count = ids.len(), "stale processing sessions marked failed");
        }
        Ok(ids)
    }
}

/// Compare-and-set one session along a lifecycle edge inside `conn`'s
/// open transaction. The caller commits.
fn transition(
    conn: &rusqlite::Connection,
    id: &str,
    to: SessionStatus,
    counters: Option<SessionCounters>,
    reason: Option<String>,
) -> rusqlite::Result<Result<AttendanceSession, StoreError>> {
    let Some(current) = rows::load_session(conn, id)? else {
        return Ok(Err(StoreError::SessionNotFound(id.to_string())));
    };
    if let Err(e) = current.status.transition(to) {
        return Ok(Err(e.into()));
    }

    let now = Utc::now();
    match counters {
        Some(c) => conn.execute(
            "UPDATE attendance_sessions
             SET status = ?1, total_images = ?2, total_faces_detected = ?3,
                 total_students_recognized = ?4, average_confidence = ?5, updated_at = ?6
             WHERE id = ?7 AND status = ?8",
            params![
                to.as_str(),
                c.total_images,
                c.total_faces_detected,
                c.total_students_recognized,
                c.average_confidence as f64,
                now,
                id,
                current.status.as_str(),
            ],
        )?,
        None => conn.execute(
            "UPDATE attendance_sessions
             SET status = ?1, failure_reason = COALESCE(?2, failure_reason), updated_at = ?3
             WHERE id = ?4 AND status = ?5",
            params![to.as_str(), reason, now, id, current.status.as_str()],
        )?,
    };

    tracing::debug!(session = %id, from = %current.status, to = %to, "session transition");
    Ok(rows::load_session(conn, id)?.ok_or_else(|| StoreError::SessionNotFound(id.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::BoundingBox;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    fn result(session: &str, student: Option<&str>, confidence: f32, accepted: bool) -> RecognitionResult {
        RecognitionResult {
            session_id: session.into(),
            student_id: student.map(String::from),
            label: Some("label".into()),
            confidence,
            image_index: 0,
            bbox: BoundingBox { x: 1.0, y: 2.0, width: 3.0, height: 4.0 },
            accepted,
        }
    }

    #[tokio::test]
    async fn test_register_allocates_unique_keys() {
        let store = Store::open_in_memory().await.unwrap();
        let a = store.register_student("Jane Doe", Some("R-1")).await.unwrap();
        let b = store.register_student("jane  doe", None).await.unwrap();
        assert_eq!(a.dataset_key, "jane_doe");
        assert_eq!(b.dataset_key, "jane_doe_2");
        assert_ne!(a.id, b.id);

        let loaded = store.student(&a.id).await.unwrap();
        assert_eq!(loaded.roster_id.as_deref(), Some("R-1"));
        assert!(!loaded.is_training_complete);
        assert!(loaded.photos.is_empty());

        assert!(store.register_student("   ", None).await.is_err());
        assert!(matches!(
            store.student("missing").await,
            Err(StoreError::StudentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_photos_reset_trained_flag() {
        let store = Store::open_in_memory().await.unwrap();
        let s = store.register_student("Ana", None).await.unwrap();
        store.set_student_photos(&s.id, vec!["ana/ana_01.png".into()]).await.unwrap();
        assert_eq!(store.mark_trained(vec![s.id.clone()]).await.unwrap(), 1);
        assert!(store.student(&s.id).await.unwrap().is_training_complete);

        store.set_student_photos(&s.id, vec!["ana/ana_01.jpg".into()]).await.unwrap();
        let reloaded = store.student(&s.id).await.unwrap();
        assert!(!reloaded.is_training_complete);
        assert_eq!(reloaded.photos, vec!["ana/ana_01.jpg".to_string()]);

        assert!(matches!(
            store.set_student_photos("nobody", vec![]).await,
            Err(StoreError::StudentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_training_counts() {
        let store = Store::open_in_memory().await.unwrap();
        assert_eq!(store.training_counts().await.unwrap(), TrainingCounts::default());

        let a = store.register_student("Ana", None).await.unwrap();
        store.register_student("Ben", None).await.unwrap();
        store.set_student_photos(&a.id, vec!["x.png".into()]).await.unwrap();
        store.mark_trained(vec![a.id.clone()]).await.unwrap();

        let counts = store.training_counts().await.unwrap();
        assert_eq!(
            counts,
            TrainingCounts { total_students: 2, with_photos: 1, trained: 1 }
        );
    }

    #[tokio::test]
    async fn test_session_happy_path_writes_counters() {
        let store = Store::open_in_memory().await.unwrap();
        let s = store.create_session(Some("class-7".into()), date()).await.unwrap();
        assert_eq!(s.status, SessionStatus::Pending);

        store.begin_processing(&s.id).await.unwrap();
        let counters = SessionCounters {
            total_images: 3,
            total_faces_detected: 4,
            total_students_recognized: 1,
            average_confidence: 0.675,
        };
        let done = store.complete_session(&s.id, counters).await.unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(done.counters.total_faces_detected, 4);
        assert!((done.counters.average_confidence - 0.675).abs() < 1e-6);
        assert_eq!(done.capture_date, date());
        assert_eq!(done.class_id.as_deref(), Some("class-7"));
    }

    #[tokio::test]
    async fn test_terminal_sessions_are_final() {
        let store = Store::open_in_memory().await.unwrap();
        let s = store.create_session(None, date()).await.unwrap();

        // Cannot complete without processing first.
        assert!(matches!(
            store.complete_session(&s.id, SessionCounters::default()).await,
            Err(StoreError::Transition(_))
        ));

        store.begin_processing(&s.id).await.unwrap();
        assert!(store.begin_processing(&s.id).await.is_err());
        let failed = store.fail_session(&s.id, "worker timed out").await.unwrap();
        assert_eq!(failed.status, SessionStatus::Failed);
        assert_eq!(failed.failure_reason.as_deref(), Some("worker timed out"));

        assert!(store.begin_processing(&s.id).await.is_err());
        assert!(store.fail_session(&s.id, "again").await.is_err());
        assert!(store.complete_session(&s.id, SessionCounters::default()).await.is_err());
        assert_eq!(store.session(&s.id).await.unwrap().status, SessionStatus::Failed);

        assert!(matches!(
            store.begin_processing("nope").await,
            Err(StoreError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_complete_batch_order_and_guard() {
        let store = Store::open_in_memory().await.unwrap();
        let ana = store.register_student("Ana", None).await.unwrap();
        let s = store.create_session(None, date()).await.unwrap();

        let results = vec![
            result(&s.id, Some(&ana.id), 0.8, true),
            result(&s.id, None, 0.4, false),
            result(&s.id, Some(&ana.id), 0.6, true),
        ];
        let records = vec![AttendanceRecord {
            session_id: s.id.clone(),
            student_id: ana.id.clone(),
            is_present: true,
            confidence: 0.8,
            detection_count: 2,
        }];
        let counters = SessionCounters {
            total_images: 2,
            total_faces_detected: 3,
            total_students_recognized: 1,
            average_confidence: 0.7,
        };

        // Pending sessions do not accept results.
        assert!(matches!(
            store.complete_batch(&s.id, results.clone(), records.clone(), counters).await,
            Err(StoreError::NotProcessing(_))
        ));

        store.begin_processing(&s.id).await.unwrap();
        let done = store
            .complete_batch(&s.id, results.clone(), records.clone(), counters)
            .await
            .unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(done.counters.total_faces_detected, 3);

        let stored = store.recognition_results(&s.id).await.unwrap();
        assert_eq!(stored, results);
        assert_eq!(store.attendance_records(&s.id).await.unwrap(), records);

        // Completed sessions are closed to writes.
        assert!(matches!(
            store.complete_batch(&s.id, vec![], records, counters).await,
            Err(StoreError::NotProcessing(_))
        ));
    }

    #[tokio::test]
    async fn test_complete_batch_is_all_or_nothing() {
        let store = Store::open_in_memory().await.unwrap();
        let ana = store.register_student("Ana", None).await.unwrap();
        let s = store.create_session(None, date()).await.unwrap();
        store.begin_processing(&s.id).await.unwrap();

        // The record points at an unknown student, so its insert fails after
        // the results were written.
        let results = vec![result(&s.id, Some(&ana.id), 0.8, true)];
        let records = vec![AttendanceRecord {
            session_id: s.id.clone(),
            student_id: "ghost".into(),
            is_present: true,
            confidence: 0.8,
            detection_count: 1,
        }];
        let err = store
            .complete_batch(&s.id, results, records, SessionCounters::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Database(_)));

        assert!(store.recognition_results(&s.id).await.unwrap().is_empty());
        assert!(store.attendance_records(&s.id).await.unwrap().is_empty());
        assert_eq!(store.session(&s.id).await.unwrap().status, SessionStatus::Processing);

        let failed = store.fail_session(&s.id, &err.to_string()).await.unwrap();
        assert_eq!(failed.status, SessionStatus::Failed);
        assert!(store.recognition_results(&s.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fail_stale_sessions() {
        let store = Store::open_in_memory().await.unwrap();
        let stuck = store.create_session(None, date()).await.unwrap();
        let idle = store.create_session(None, date()).await.unwrap();
        store.begin_processing(&stuck.id).await.unwrap();

        let failed = store.fail_stale_sessions("daemon restarted").await.unwrap();
        assert_eq!(failed, vec![stuck.id.clone()]);
        assert_eq!(store.session(&stuck.id).await.unwrap().status, SessionStatus::Failed);
        assert_eq!(store.session(&idle.id).await.unwrap().status, SessionStatus::Pending);
        assert!(store.fail_stale_sessions("again").await.unwrap().is_empty());
    }
}
