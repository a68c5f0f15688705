use crate::session::SessionStatus;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Axis-aligned face bounding box in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    /// Build from the worker's `[x1, y1, x2, y2]` corner form.
    pub fn from_corners(corners: [f32; 4]) -> Self {
        let [x1, y1, x2, y2] = corners;
        Self {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
        }
    }
}

/// Face embedding vector learned for a student.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "buffalo_l").
    pub model_version: Option<String>,
}

/// A student on the roster, as far as the recognition pipeline cares.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Student {
    pub id: String,
    pub name: String,
    pub roster_id: Option<String>,
    /// Dataset folder key, fixed at registration. Renames never touch it.
    pub dataset_key: String,
    /// Stored training-photo references, in upload order.
    pub photos: Vec<String>,
    pub embedding: Option<Embedding>,
    pub is_training_complete: bool,
    pub created_at: DateTime<Utc>,
}

/// Aggregate counters written atomically with the `completed` transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionCounters {
    pub total_images: u32,
    pub total_faces_detected: u32,
    pub total_students_recognized: u32,
    pub average_confidence: f32,
}

/// One capture-and-process attendance event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttendanceSession {
    pub id: String,
    pub class_id: Option<String>,
    pub capture_date: NaiveDate,
    pub status: SessionStatus,
    pub counters: SessionCounters,
    /// Human-readable reason recorded with the `failed` transition.
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One raw detection reported by the worker. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionResult {
    pub session_id: String,
    /// Resolved student, `None` when the label matched nobody on the roster.
    pub student_id: Option<String>,
    /// Label as reported by the worker.
    pub label: Option<String>,
    pub confidence: f32,
    /// Index of the source image in the submitted batch.
    pub image_index: u32,
    pub bbox: BoundingBox,
    /// Resolved and at or above the acceptance threshold.
    pub accepted: bool,
}

/// Presence decision for one student in one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub session_id: String,
    pub student_id: String,
    pub is_present: bool,
    /// Best confidence among the student's accepted detections.
    pub confidence: f32,
    pub detection_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bbox_from_corners() {
        let b = BoundingBox::from_corners([10.0, 20.0, 110.0, 140.0]);
        assert_eq!(b.x, 10.0);
        assert_eq!(b.y, 20.0);
        assert_eq!(b.width, 100.0);
        assert_eq!(b.height, 120.0);
    }

    #[test]
    fn test_counters_default_zero() {
        let c = SessionCounters::default();
        assert_eq!(c.total_images, 0);
        assert_eq!(c.average_confidence, 0.0);
    }
}
