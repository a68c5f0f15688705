//! Recognition worker output schema.
//!
//! The worker may print any number of log lines, JSON-shaped ones included;
//! the last stdout line that deserializes as a result record is the record.
//! It is validated as a whole and rejected rather than partially trusted.

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("worker emitted no result record")]
    NoRecord,
    #[error("malformed result record: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid result record: {0}")]
    Invalid(String),
    #[error("worker reported error: {0}")]
    Reported(String),
}

/// Final structured record printed by the recognition worker.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPayload {
    pub processed_images: u32,
    pub total_faces: u32,
    pub average_confidence: f32,
    pub detections: Vec<RawDetection>,
    #[serde(default)]
    pub error: Option<String>,
}

/// One face as reported by the worker, before identity resolution.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawDetection {
    /// Dataset folder key of the matched person, `None` for an unknown face.
    #[serde(alias = "studentId")]
    pub label: Option<String>,
    pub confidence: f32,
    /// `[x1, y1, x2, y2]`.
    pub bbox: [f32; 4],
    /// Position of the source image in the worker's sorted input listing.
    pub image_index: u32,
    #[serde(default)]
    pub face_index: Option<u32>,
}

impl WorkerPayload {
    fn validate(&self) -> Result<(), PayloadError> {
        if let Some(err) = &self.error {
            return Err(PayloadError::Reported(err.clone()));
        }
        if self.total_faces as usize != self.detections.len() {
            return Err(PayloadError::Invalid(format!(
                "totalFaces is {} but {} detections were listed",
                self.total_faces,
                self.detections.len()
            )));
        }
        if !self.average_confidence.is_finite() {
            return Err(PayloadError::Invalid("averageConfidence is not finite".into()));
        }
        for (i, det) in self.detections.iter().enumerate() {
            if !(0.0..=1.0).contains(&det.confidence) {
                return Err(PayloadError::Invalid(format!(
                    "detection {i}: confidence {} outside [0, 1]",
                    det.confidence
                )));
            }
            if det.image_index >= self.processed_images {
                return Err(PayloadError::Invalid(format!(
                    "detection {i}: imageIndex {} but only {} images processed",
                    det.image_index, self.processed_images
                )));
            }
            if det.bbox.iter().any(|v| !v.is_finite()) {
                return Err(PayloadError::Invalid(format!("detection {i}: bbox not finite")));
            }
        }
        Ok(())
    }
}

/// Lines that open a JSON object, last first.
fn object_lines(stdout: &str) -> impl Iterator<Item = &str> {
    stdout.lines().rev().map(str::trim).filter(|l| l.starts_with('{'))
}

/// Parse and validate the worker's result record out of its full stdout.
///
/// When no object line is a record, the error is the one from the last
/// object line, which is the most likely intended record.
pub fn parse_payload(stdout: &str) -> Result<WorkerPayload, PayloadError> {
    let mut first_err = None;
    for line in object_lines(stdout) {
        match serde_json::from_str::<WorkerPayload>(line) {
            Ok(payload) => {
                payload.validate()?;
                return Ok(payload);
            }
            Err(e) => {
                first_err.get_or_insert(e);
            }
        }
    }
    Err(first_err.map_or(PayloadError::NoRecord, PayloadError::Malformed))
}

/// Pull the worker's `"error"` string out of its output, if it left one.
///
/// Used to enrich non-zero exits; never fails.
pub fn reported_error(stdout: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorOnly {
        error: Option<String>,
    }
    object_lines(stdout)
        .find_map(|line| serde_json::from_str::<ErrorOnly>(line).ok()?.error)
}
