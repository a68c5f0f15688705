//! Batch recognition orchestrator.
//!
//! One call turns one capture batch into committed attendance. Once the
//! session has moved to `processing`, every exit path either completes it or
//! fails it; a session is never left processing.

use chrono::{DateTime, Utc};
use rollcall_core::aggregate::{aggregate_records, average_confidence, is_accepted};
use rollcall_core::key::folder_key;
use rollcall_core::payload::{PayloadError, WorkerPayload};
use rollcall_core::{
    AttendanceRecord, AttendanceSession, BoundingBox, ErrorKind, RecognitionResult,
    SessionCounters, SessionStatus,
};
use rollcall_dataset::{DatasetError, FailedImage, StagedBatch, StagingArea};
use rollcall_store::{Store, StoreError};
use serde::Serialize;
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::worker::{WorkerError, WorkerGateway};

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("batch contains no images")]
    EmptyBatch,
    #[error("session {id} is {status}, expected pending")]
    SessionNotPending { id: String, status: SessionStatus },
    #[error("no trained model at {0}; run training first")]
    ModelMissing(PathBuf),
    #[error("none of the {submitted} images could be decoded")]
    NoStageableImages { submitted: usize },
    #[error("staging failed: {0}")]
    Staging(#[from] DatasetError),
    #[error("staging task failed: {0}")]
    StagingTask(#[from] tokio::task::JoinError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl BatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyBatch | Self::NoStageableImages { .. } => ErrorKind::Validation,
            Self::SessionNotPending { status, .. } => match status {
                SessionStatus::Processing => ErrorKind::Conflict,
                _ => ErrorKind::Validation,
            },
            Self::ModelMissing(_) | Self::Staging(_) | Self::StagingTask(_) => ErrorKind::Resource,
            Self::Worker(e) => e.kind(),
            Self::Store(e) => e.kind(),
        }
    }
}

/// Outcome of a completed batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub session: AttendanceSession,
    pub staged_images: usize,
    pub rejected_images: Vec<FailedImage>,
    pub unresolved_detections: usize,
    pub results: Vec<RecognitionResult>,
    pub records: Vec<AttendanceRecord>,
}

/// Contents of `output_dir/<session_id>.json`.
#[derive(Serialize)]
struct AuditFile<'a> {
    generated_at: DateTime<Utc>,
    #[serde(flatten)]
    report: &'a BatchReport,
}

#[derive(Clone)]
pub struct BatchOrchestrator {
    store: Store,
    staging: StagingArea,
    gateway: WorkerGateway,
    args: Vec<String>,
    embeddings_path: PathBuf,
    output_dir: PathBuf,
    acceptance_threshold: f32,
    timeout: Duration,
}

impl BatchOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        staging: StagingArea,
        gateway: WorkerGateway,
        args: Vec<String>,
        embeddings_path: PathBuf,
        output_dir: PathBuf,
        acceptance_threshold: f32,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            staging,
            gateway,
            args,
            embeddings_path,
            output_dir,
            acceptance_threshold,
            timeout,
        }
    }

    /// Recognize one batch of base64 images for a pending session.
    pub async fn process(
        &self,
        session_id: &str,
        images: Vec<String>,
    ) -> Result<BatchReport, BatchError> {
        if images.is_empty() {
            return Err(BatchError::EmptyBatch);
        }
        let session = self.store.session(session_id).await?;
        if session.status != SessionStatus::Pending {
            return Err(BatchError::SessionNotPending {
                id: session.id,
                status: session.status,
            });
        }
        let model_ok = tokio::fs::metadata(&self.embeddings_path)
            .await
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false);
        if !model_ok {
            return Err(BatchError::ModelMissing(self.embeddings_path.clone()));
        }

        self.store.begin_processing(session_id).await?;
        tracing::info!(session = session_id, images = images.len(), "batch processing");

        match self.run_batch(session_id, images).await {
            Ok(report) => {
                self.write_audit(&report).await;
                Ok(report)
            }
            Err(e) => {
                tracing::error!(session = session_id, error = %e, "batch failed");
                if let Err(fail_err) = self.store.fail_session(session_id, &e.to_string()).await {
                    tracing::error!(session = session_id, error = %fail_err, "could not mark session failed");
                }
                Err(e)
            }
        }
    }

    async fn run_batch(
        &self,
        session_id: &str,
        images: Vec<String>,
    ) -> Result<BatchReport, BatchError> {
        let submitted = images.len();
        let staging = self.staging.clone();
        let id = session_id.to_string();
        let batch = match tokio::task::spawn_blocking(move || staging.stage(&id, &images)).await? {
            Ok(batch) => batch,
            Err(DatasetError::NoValidImages { .. }) => {
                return Err(BatchError::NoStageableImages { submitted })
            }
            Err(e) => return Err(e.into()),
        };
        tracing::info!(
            session = session_id,
            staged = batch.staged_count(),
            rejected = batch.failed.len(),
            "batch staged"
        );

        let envs: [(&str, OsString); 3] = [
            ("ROLLCALL_IMAGE_DIR", batch.dir.clone().into()),
            ("ROLLCALL_EMBEDDINGS_PATH", self.embeddings_path.clone().into()),
            ("ROLLCALL_OUTPUT_DIR", self.output_dir.clone().into()),
        ];
        let outcome = self.gateway.recognize(&self.args, &envs, self.timeout).await;
        let staging = self.staging.clone();
        let id = session_id.to_string();
        match tokio::task::spawn_blocking(move || staging.purge(&id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(session = session_id, error = %e, "failed to remove staged batch"),
            Err(e) => tracing::warn!(session = session_id, error = %e, "staging cleanup task failed"),
        }
        let payload = outcome?;

        let results = self.resolve(session_id, &batch, &payload).await?;
        let records = aggregate_records(session_id, &results);
        let unresolved = results.iter().filter(|r| r.student_id.is_none()).count();

        let counters = SessionCounters {
            total_images: submitted as u32,
            total_faces_detected: results.len() as u32,
            total_students_recognized: records.len() as u32,
            average_confidence: average_confidence(&results),
        };
        let session = self
            .store
            .complete_batch(session_id, results.clone(), records.clone(), counters)
            .await?;
        tracing::info!(
            session = session_id,
            faces = counters.total_faces_detected,
            present = counters.total_students_recognized,
            unresolved,
            "batch completed"
        );

        Ok(BatchReport {
            session,
            staged_images: batch.staged_count(),
            rejected_images: batch.failed,
            unresolved_detections: unresolved,
            results,
            records,
        })
    }

    /// Map worker detections to students, in worker order.
    async fn resolve(
        &self,
        session_id: &str,
        batch: &StagedBatch,
        payload: &WorkerPayload,
    ) -> Result<Vec<RecognitionResult>, BatchError> {
        if payload.processed_images as usize > batch.staged_count() {
            return Err(WorkerError::Payload(PayloadError::Invalid(format!(
                "worker processed {} images but only {} were staged",
                payload.processed_images,
                batch.staged_count()
            )))
            .into());
        }

        let by_key: HashMap<String, String> = self
            .store
            .students()
            .await?
            .into_iter()
            .map(|s| (s.dataset_key, s.id))
            .collect();

        let mut results = Vec::with_capacity(payload.detections.len());
        for det in &payload.detections {
            let student_id = det
                .label
                .as_deref()
                .and_then(|label| by_key.get(&folder_key(label)))
                .cloned();
            if student_id.is_none() {
                tracing::debug!(label = ?det.label, "detection not matched to a student");
            }
            let image_index = batch.source_index(det.image_index).unwrap_or(det.image_index);
            results.push(RecognitionResult {
                session_id: session_id.to_string(),
                accepted: is_accepted(student_id.as_deref(), det.confidence, self.acceptance_threshold),
                student_id,
                label: det.label.clone(),
                confidence: det.confidence,
                image_index,
                bbox: BoundingBox::from_corners(det.bbox),
            });
        }
        Ok(results)
    }

    /// Best effort: the session is already committed.
    async fn write_audit(&self, report: &BatchReport) {
        let path = self.output_dir.join(format!("{}.json", report.session.id));
        let audit = AuditFile {
            generated_at: Utc::now(),
            report,
        };
        let written = async {
            let body = serde_json::to_vec_pretty(&audit).map_err(std::io::Error::other)?;
            tokio::fs::create_dir_all(&self.output_dir).await?;
            tokio::fs::write(&path, body).await
        };
        match written.await {
            Ok(()) => tracing::debug!(path = %path.display(), "audit written"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to write audit"),
        }
    }
}
