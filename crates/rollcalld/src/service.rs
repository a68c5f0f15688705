//! Service facade over the orchestrators.
//!
//! Every operation resolves to a [`Reply`] or a [`ServiceError`]; the bus
//! layer folds both into an [`Outcome`] so callers always get a message and,
//! on failure, an error classification.

use chrono::{NaiveDate, Utc};
use rollcall_core::{AttendanceRecord, AttendanceSession, ErrorKind, RecognitionResult};
use rollcall_dataset::{DatasetError, DatasetStore, FailedImage, StagingArea};
use rollcall_store::{Store, StoreError};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::config::Config;
use crate::recognition::{BatchError, BatchOrchestrator};
use crate::training::{TrainingError, TrainingOrchestrator, TrainingScope};
use crate::worker::WorkerGateway;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Training(#[from] TrainingError),
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("failed to encode reply: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Invalid(_) => ErrorKind::Validation,
            Self::Store(e) => e.kind(),
            Self::Dataset(e) => e.kind(),
            Self::Training(e) => e.kind(),
            Self::Batch(e) => e.kind(),
            Self::Task(_) | Self::Encode(_) => ErrorKind::Resource,
        }
    }
}

/// Successful operation result.
#[derive(Debug, Clone)]
pub struct Reply {
    pub message: String,
    pub data: Value,
}

impl Reply {
    fn new(message: impl Into<String>, data: impl Serialize) -> Result<Self, ServiceError> {
        Ok(Self {
            message: message.into(),
            data: serde_json::to_value(data)?,
        })
    }
}

/// Wire shape of every service response.
#[derive(Debug, Clone, Serialize)]
pub struct Outcome {
    pub ok: bool,
    pub message: String,
    pub error: Option<ErrorKind>,
    pub data: Value,
}

impl From<Result<Reply, ServiceError>> for Outcome {
    fn from(result: Result<Reply, ServiceError>) -> Self {
        match result {
            Ok(reply) => Self {
                ok: true,
                message: reply.message,
                error: None,
                data: reply.data,
            },
            Err(e) => Self {
                ok: false,
                message: e.to_string(),
                error: Some(e.kind()),
                data: Value::Null,
            },
        }
    }
}

impl Outcome {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"ok":false,"message":"encode error: {e}","error":"resource","data":null}}"#)
        })
    }
}

#[derive(Serialize)]
struct PhotoUpload {
    saved: usize,
    failed: Vec<FailedImage>,
    photos: Vec<String>,
}

#[derive(Serialize)]
struct SessionView {
    session: AttendanceSession,
    results: Vec<RecognitionResult>,
    records: Vec<AttendanceRecord>,
}

/// Shared daemon state. Cheap to clone.
#[derive(Clone)]
pub struct AttendanceService {
    config: Arc<Config>,
    store: Store,
    dataset: DatasetStore,
    staging: StagingArea,
    training: TrainingOrchestrator,
    batches: BatchOrchestrator,
}

impl AttendanceService {
    pub fn new(config: Config, store: Store) -> Self {
        let gateway = WorkerGateway::from_config(&config);
        let dataset = DatasetStore::new(config.dataset_dir.clone());
        let staging = StagingArea::new(config.staging_dir.clone());
        let training = TrainingOrchestrator::new(
            store.clone(),
            dataset.clone(),
            gateway.clone(),
            config.train_args.clone(),
            config.embeddings_path.clone(),
            config.training_timeout(),
        );
        let batches = BatchOrchestrator::new(
            store.clone(),
            staging.clone(),
            gateway,
            config.recognize_args.clone(),
            config.embeddings_path.clone(),
            config.output_dir.clone(),
            config.acceptance_threshold,
            config.recognition_timeout(),
        );
        Self {
            config: Arc::new(config),
            store,
            dataset,
            staging,
            training,
            batches,
        }
    }

    /// Fail sessions a previous run left in `processing` and drop their scratch files.
    pub async fn reconcile(&self) -> Result<Vec<String>, ServiceError> {
        let failed = self
            .store
            .fail_stale_sessions("daemon restarted while the batch was processing")
            .await?;
        let staging = self.staging.clone();
        let ids = failed.clone();
        tokio::task::spawn_blocking(move || {
            for id in &ids {
                if let Err(e) = staging.purge(id) {
                    tracing::warn!(session = %id, error = %e, "failed to purge stale staging folder");
                }
            }
        })
        .await?;
        Ok(failed)
    }

    pub async fn register_student(
        &self,
        name: &str,
        roster_id: Option<&str>,
    ) -> Result<Reply, ServiceError> {
        let student = self.store.register_student(name, roster_id).await?;
        Reply::new(format!("Registered {}", student.name), student)
    }

    /// Replace a student's training photos. Succeeds if at least one was stored.
    pub async fn submit_photos(
        &self,
        student_id: &str,
        images: Vec<String>,
    ) -> Result<Reply, ServiceError> {
        if images.is_empty() {
            return Err(ServiceError::Invalid("no photos submitted".into()));
        }
        let student = self.store.student(student_id).await?;
        let dataset = self.dataset.clone();
        let key = student.dataset_key.clone();
        let saved = tokio::task::spawn_blocking(move || dataset.save_photos(&key, &images)).await?;

        let report = match saved {
            Ok(report) => report,
            Err(e @ DatasetError::NoValidImages { .. }) => {
                // The old photos are gone either way.
                self.store.set_student_photos(&student.id, Vec::new()).await?;
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        let photos = relative_names(&student.dataset_key, &report.saved);
        self.store.set_student_photos(&student.id, photos.clone()).await?;
        Reply::new(
            format!("Saved {} photos for {}", report.saved.len(), student.name),
            PhotoUpload {
                saved: report.saved.len(),
                failed: report.failed,
                photos,
            },
        )
    }

    pub async fn clear_photos(&self, student_id: &str) -> Result<Reply, ServiceError> {
        let student = self.store.student(student_id).await?;
        let dataset = self.dataset.clone();
        let key = student.dataset_key.clone();
        tokio::task::spawn_blocking(move || dataset.clear(&key)).await??;
        self.store.set_student_photos(&student.id, Vec::new()).await?;
        Reply::new(format!("Cleared photos for {}", student.name), Value::Null)
    }

    pub async fn list_photos(&self, student_id: &str) -> Result<Reply, ServiceError> {
        let student = self.store.student(student_id).await?;
        let dataset = self.dataset.clone();
        let key = student.dataset_key.clone();
        let photos = tokio::task::spawn_blocking(move || dataset.list_photos(&key)).await??;
        let names = relative_names(&student.dataset_key, &photos);
        Reply::new(format!("{} has {} photos", student.name, names.len()), names)
    }

    pub async fn start_training(&self) -> Result<Reply, ServiceError> {
        let info = self.training.start(TrainingScope::All).await?;
        Reply::new(
            format!("Training started for {} students", info.students),
            info,
        )
    }

    pub async fn retrain_students(&self, ids: Vec<String>) -> Result<Reply, ServiceError> {
        let info = self.training.start(TrainingScope::Students(ids)).await?;
        Reply::new(
            format!("Retraining started for {} students", info.students),
            info,
        )
    }

    pub async fn training_status(&self) -> Result<Reply, ServiceError> {
        let status = self.training.status().await?;
        Reply::new(status.progress.message.clone(), status)
    }

    /// `date` is `YYYY-MM-DD`; today (UTC) when absent.
    pub async fn create_session(
        &self,
        class_id: Option<String>,
        date: Option<&str>,
    ) -> Result<Reply, ServiceError> {
        let capture_date = match date {
            Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .map_err(|e| ServiceError::Invalid(format!("invalid date {raw:?}: {e}")))?,
            None => Utc::now().date_naive(),
        };
        let session = self.store.create_session(class_id, capture_date).await?;
        Reply::new(format!("Session {} created", session.id), session)
    }

    pub async fn submit_batch(
        &self,
        session_id: &str,
        images: Vec<String>,
    ) -> Result<Reply, ServiceError> {
        let report = self.batches.process(session_id, images).await?;
        Reply::new(
            format!(
                "Recognized {} students from {} faces",
                report.records.len(),
                report.results.len()
            ),
            report,
        )
    }

    pub async fn session_results(&self, session_id: &str) -> Result<Reply, ServiceError> {
        let session = self.store.session(session_id).await?;
        let view = SessionView {
            results: self.store.recognition_results(session_id).await?,
            records: self.store.attendance_records(session_id).await?,
            session,
        };
        Reply::new(format!("Session is {}", view.session.status), view)
    }

    pub async fn status(&self) -> Result<Reply, ServiceError> {
        let training = self.training.status().await?;
        let model_present = tokio::fs::metadata(&self.config.embeddings_path)
            .await
            .map(|m| m.len() > 0)
            .unwrap_or(false);
        Reply::new(
            "rollcalld running",
            serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "training": training,
                "model_present": model_present,
                "acceptance_threshold": self.config.acceptance_threshold,
                "dataset_dir": self.config.dataset_dir,
                "worker_program": self.config.worker_program,
            }),
        )
    }
}

/// `key/file` names for the photo list stored on the student row.
fn relative_names(key: &str, paths: &[std::path::PathBuf]) -> Vec<String> {
    paths
        .iter()
        .filter_map(|p| p.file_name())
        .map(|name| format!("{key}/{}", name.to_string_lossy()))
        .collect()
}
