//! Detection → attendance reduction.
//!
//! Each accepted detection votes for one student; the student's record
//! keeps the single best confidence and the number of accepted sightings.
//! Weak repeat sightings never dilute a strong one.

use crate::types::{AttendanceRecord, RecognitionResult};
use std::collections::BTreeMap;

/// A detection counts toward attendance only when resolved and confident enough.
pub fn is_accepted(student_id: Option<&str>, confidence: f32, threshold: f32) -> bool {
    student_id.is_some() && confidence >= threshold
}

/// Reduce a batch's results to at most one record per student.
///
/// Only results flagged `accepted` contribute. Output is ordered by student id.
pub fn aggregate_records(session_id: &str, results: &[RecognitionResult]) -> Vec<AttendanceRecord> {
    let mut best: BTreeMap<&str, (f32, u32)> = BTreeMap::new();

    for result in results.iter().filter(|r| r.accepted) {
        let Some(student_id) = result.student_id.as_deref() else {
            continue;
        };
        let entry = best.entry(student_id).or_insert((f32::NEG_INFINITY, 0));
        if result.confidence > entry.0 {
            entry.0 = result.confidence;
        }
        entry.1 += 1;
    }

    best.into_iter()
        .map(|(student_id, (confidence, detection_count))| AttendanceRecord {
            session_id: session_id.to_string(),
            student_id: student_id.to_string(),
            is_present: true,
            confidence,
            detection_count,
        })
        .collect()
}

/// Mean confidence of accepted detections, 0.0 when there are none.
pub fn average_confidence(results: &[RecognitionResult]) -> f32 {
    let accepted: Vec<f32> = results
        .iter()
        .filter(|r| r.accepted)
        .map(|r| r.confidence)
        .collect();
    if accepted.is_empty() {
        0.0
    } else {
        accepted.iter().sum::<f32>() / accepted.len() as f32
    }
}
