//! Row ↔ domain mapping.

use rollcall_core::{
    AttendanceRecord, AttendanceSession, BoundingBox, RecognitionResult, SessionCounters,
    SessionStatus, Student,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

pub const STUDENT_COLUMNS: &str =
    "id, name, roster_id, dataset_key, photos, embedding, is_training_complete, created_at";

pub const SESSION_COLUMNS: &str = "id, class_id, capture_date, status, total_images, \
     total_faces_detected, total_students_recognized, average_confidence, failure_reason, \
     created_at, updated_at";

const RESULT_COLUMNS: &str = "session_id, student_id, label, confidence, image_index, \
     bbox_x, bbox_y, bbox_width, bbox_height, accepted";

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

pub fn student_from_row(row: &Row<'_>) -> rusqlite::Result<Student> {
    let photos: String = row.get(4)?;
    let embedding: Option<String> = row.get(5)?;
    Ok(Student {
        id: row.get(0)?,
        name: row.get(1)?,
        roster_id: row.get(2)?,
        dataset_key: row.get(3)?,
        photos: serde_json::from_str(&photos).map_err(|e| conversion_error(4, e))?,
        embedding: embedding
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(|e| conversion_error(5, e))?,
        is_training_complete: row.get(6)?,
        created_at: row.get(7)?,
    })
}

pub fn session_from_row(row: &Row<'_>) -> rusqlite::Result<AttendanceSession> {
    let status: String = row.get(3)?;
    let average_confidence: f64 = row.get(7)?;
    Ok(AttendanceSession {
        id: row.get(0)?,
        class_id: row.get(1)?,
        capture_date: row.get(2)?,
        status: status
            .parse::<SessionStatus>()
            .map_err(|e| conversion_error(3, e))?,
        counters: SessionCounters {
            total_images: row.get(4)?,
            total_faces_detected: row.get(5)?,
            total_students_recognized: row.get(6)?,
            average_confidence: average_confidence as f32,
        },
        failure_reason: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn result_from_row(row: &Row<'_>) -> rusqlite::Result<RecognitionResult> {
    let confidence: f64 = row.get(3)?;
    let bbox: [f64; 4] = [row.get(5)?, row.get(6)?, row.get(7)?, row.get(8)?];
    Ok(RecognitionResult {
        session_id: row.get(0)?,
        student_id: row.get(1)?,
        label: row.get(2)?,
        confidence: confidence as f32,
        image_index: row.get(4)?,
        bbox: BoundingBox {
            x: bbox[0] as f32,
            y: bbox[1] as f32,
            width: bbox[2] as f32,
            height: bbox[3] as f32,
        },
        accepted: row.get(9)?,
    })
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    let confidence: f64 = row.get(3)?;
    Ok(AttendanceRecord {
        session_id: row.get(0)?,
        student_id: row.get(1)?,
        is_present: row.get(2)?,
        confidence: confidence as f32,
        detection_count: row.get(4)?,
    })
}

pub fn load_session(conn: &Connection, id: &str) -> rusqlite::Result<Option<AttendanceSession>> {
    conn.query_row(
        &format!("SELECT {SESSION_COLUMNS} FROM attendance_sessions WHERE id = ?1"),
        params![id],
        session_from_row,
    )
    .optional()
}

pub fn insert_result(conn: &Connection, result: &RecognitionResult) -> rusqlite::Result<()> {
    conn.execute(
        &format!("INSERT INTO recognition_results ({RESULT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
        params![
            result.session_id,
            result.student_id,
            result.label,
            result.confidence as f64,
            result.image_index,
            result.bbox.x as f64,
            result.bbox.y as f64,
            result.bbox.width as f64,
            result.bbox.height as f64,
            result.accepted,
        ],
    )?;
    Ok(())
}

pub fn insert_record(conn: &Connection, record: &AttendanceRecord) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO attendance_records (session_id, student_id, is_present, confidence, detection_count)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            record.session_id,
            record.student_id,
            record.is_present,
            record.confidence as f64,
            record.detection_count,
        ],
    )?;
    Ok(())
}

pub fn list_results(conn: &Connection, session_id: &str) -> rusqlite::Result<Vec<RecognitionResult>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RESULT_COLUMNS} FROM recognition_results WHERE session_id = ?1 ORDER BY id"
    ))?;
    let rows = stmt.query_map(params![session_id], result_from_row)?;
    let results = rows.collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(results)
}

pub fn list_records(conn: &Connection, session_id: &str) -> rusqlite::Result<Vec<AttendanceRecord>> {
    let mut stmt = conn.prepare(
        "SELECT session_id, student_id, is_present, confidence, detection_count
         FROM attendance_records WHERE session_id = ?1 ORDER BY student_id",
    )?;
    let rows = stmt.query_map(params![session_id], record_from_row)?;
    let records = rows.collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(records)
}
