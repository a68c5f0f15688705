//! Training orchestrator.
//!
//! At most one training run is in flight. A second request is refused with
//! `AlreadyTraining` instead of queuing. The dataset is validated before the
//! worker is spawned, progress is published on a watch channel while the
//! worker runs, and students are only marked trained after the worker exits 0
//! and left a usable embeddings file behind.

use chrono::{DateTime, Utc};
use rollcall_core::progress::{ProgressChain, ProgressParser};
use rollcall_core::ErrorKind;
use rollcall_dataset::{DatasetError, DatasetStore, DatasetSummary};
use rollcall_store::{Store, StoreError};
use serde::Serialize;
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::watch;

use crate::worker::{WorkerError, WorkerGateway};

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("training is already in progress")]
    AlreadyTraining,
    #[error("dataset is not trainable: {}", .0.join("; "))]
    DatasetInvalid(Vec<String>),
    #[error("unknown students: {}", .0.join(", "))]
    UnknownStudents(Vec<String>),
    #[error("training worker timed out after {}s", .0.as_secs())]
    WorkerTimeout(Duration),
    #[error("training worker failed: {0}")]
    WorkerExitNonZero(String),
    #[error("training worker produced no model at {0}")]
    ArtifactMissing(PathBuf),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("dataset scan failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl TrainingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyTraining => ErrorKind::Conflict,
            Self::DatasetInvalid(_) | Self::Task(_) => ErrorKind::Resource,
            Self::UnknownStudents(_) => ErrorKind::Validation,
            Self::WorkerTimeout(_) => ErrorKind::WorkerTimeout,
            Self::WorkerExitNonZero(_) | Self::ArtifactMissing(_) => ErrorKind::WorkerFailure,
            Self::Store(e) => e.kind(),
        }
    }
}

impl From<WorkerError> for TrainingError {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::Timeout(after) => Self::WorkerTimeout(after),
            other => Self::WorkerExitNonZero(other.to_string()),
        }
    }
}

/// Which students a run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrainingScope {
    /// Every folder in the dataset.
    All,
    /// Only these student ids.
    Students(Vec<String>),
}

/// In-memory progress of the current (or last) run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrainingProgress {
    pub is_training: bool,
    pub progress: u8,
    pub message: String,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Progress plus roster counts, as reported to clients.
#[derive(Debug, Clone, Serialize)]
pub struct TrainingStatus {
    #[serde(flatten)]
    pub progress: TrainingProgress,
    pub total_students: u32,
    pub students_with_photos: u32,
    pub trained_students: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub trained: usize,
    pub warnings: Vec<String>,
}

/// Try-acquire single-slot lock.
#[derive(Debug, Clone, Default)]
struct TrainingSlot {
    busy: Arc<AtomicBool>,
}

impl TrainingSlot {
    fn try_acquire(&self) -> Option<SlotGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SlotGuard {
                busy: Arc::clone(&self.busy),
            })
    }
}

/// Releases the slot on drop, whatever way the run ends.
#[derive(Debug)]
struct SlotGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// A validated run that holds the slot but has not started the worker.
#[derive(Debug)]
pub struct TrainingJob {
    _guard: SlotGuard,
    student_ids: Vec<String>,
    /// Folder keys passed to the worker for a subset run.
    subset_keys: Option<Vec<String>>,
    folder_count: usize,
    pub warnings: Vec<String>,
}

impl TrainingJob {
    pub fn student_count(&self) -> usize {
        self.student_ids.len()
    }
}

#[derive(Clone)]
pub struct TrainingOrchestrator {
    store: Store,
    dataset: DatasetStore,
    gateway: WorkerGateway,
    args: Vec<String>,
    embeddings_path: PathBuf,
    timeout: Duration,
    slot: TrainingSlot,
    progress: Arc<watch::Sender<TrainingProgress>>,
}

impl TrainingOrchestrator {
    pub fn new(
        store: Store,
        dataset: DatasetStore,
        gateway: WorkerGateway,
        args: Vec<String>,
        embeddings_path: PathBuf,
        timeout: Duration,
    ) -> Self {
        let (progress, _) = watch::channel(TrainingProgress {
            message: "Idle".to_string(),
            ..Default::default()
        });
        Self {
            store,
            dataset,
            gateway,
            args,
            embeddings_path,
            timeout,
            slot: TrainingSlot::default(),
            progress: Arc::new(progress),
        }
    }

    pub fn progress(&self) -> TrainingProgress {
        self.progress.borrow().clone()
    }

    pub async fn status(&self) -> Result<TrainingStatus, TrainingError> {
        let counts = self.store.training_counts().await?;
        Ok(TrainingStatus {
            progress: self.progress(),
            total_students: counts.total_students,
            students_with_photos: counts.with_photos,
            trained_students: counts.trained,
        })
    }

    /// Acquire the slot and validate the dataset.
    ///
    /// Nothing observable changes when this fails.
    pub async fn begin(&self, scope: TrainingScope) -> Result<TrainingJob, TrainingError> {
        let guard = self.slot.try_acquire().ok_or(TrainingError::AlreadyTraining)?;

        let dataset = self.dataset.clone();
        let summary = match tokio::task::spawn_blocking(move || dataset.summarize()).await? {
            Ok(summary) => summary,
            Err(DatasetError::RootMissing(root)) => {
                return Err(TrainingError::DatasetInvalid(vec![format!(
                    "dataset root {} does not exist",
                    root.display()
                )]))
            }
            Err(e) => return Err(TrainingError::DatasetInvalid(vec![e.to_string()])),
        };

        let (student_ids, subset_keys, folder_count, warnings) = match scope {
            TrainingScope::All => {
                let (ids, folders, warnings) = self.plan_full(&summary).await?;
                (ids, None, folders, warnings)
            }
            TrainingScope::Students(ids) => {
                let (ids, keys, warnings) = self.plan_subset(&summary, ids).await?;
                let folders = keys.len();
                (ids, Some(keys), folders, warnings)
            }
        };

        for warning in &warnings {
            tracing::warn!(%warning, "dataset warning");
        }

        self.progress.send_replace(TrainingProgress {
            is_training: true,
            progress: 0,
            message: format!("Starting training on {folder_count} folders"),
            last_error: None,
            started_at: Some(Utc::now()),
            finished_at: None,
        });

        Ok(TrainingJob {
            _guard: guard,
            student_ids,
            subset_keys,
            folder_count,
            warnings,
        })
    }

    async fn plan_full(
        &self,
        summary: &DatasetSummary,
    ) -> Result<(Vec<String>, usize, Vec<String>), TrainingError> {
        if summary.folders.is_empty() {
            return Err(TrainingError::DatasetInvalid(vec![
                "dataset contains no student folders".to_string(),
            ]));
        }

        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        for folder in &summary.folders {
            match folder.image_count {
                0 => errors.push(format!("folder {} has no images", folder.key)),
                1 => warnings.push(format!("folder {} has only one image", folder.key)),
                _ => {}
            }
        }
        if !errors.is_empty() {
            return Err(TrainingError::DatasetInvalid(errors));
        }

        let students = self.store.students().await?;
        let ids = students
            .into_iter()
            .filter(|s| summary.folder(&s.dataset_key).is_some())
            .map(|s| s.id)
            .collect();
        Ok((ids, summary.folders.len(), warnings))
    }

    async fn plan_subset(
        &self,
        summary: &DatasetSummary,
        ids: Vec<String>,
    ) -> Result<(Vec<String>, Vec<String>, Vec<String>), TrainingError> {
        let ids: BTreeSet<String> = ids.into_iter().collect();
        if ids.is_empty() {
            return Err(TrainingError::DatasetInvalid(vec![
                "no students selected for retraining".to_string(),
            ]));
        }

        let mut students = Vec::with_capacity(ids.len());
        let mut unknown = Vec::new();
        for id in &ids {
            match self.store.student(id).await {
                Ok(student) => students.push(student),
                Err(StoreError::StudentNotFound(_)) => unknown.push(id.clone()),
                Err(e) => return Err(e.into()),
            }
        }
        if !unknown.is_empty() {
            return Err(TrainingError::UnknownStudents(unknown));
        }

        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut keys = Vec::new();
        for student in students {
            match summary.folder(&student.dataset_key).map(|f| f.image_count) {
                None | Some(0) => errors.push(format!("{} has no training photos", student.name)),
                Some(1) => {
                    warnings.push(format!("{} has only one training photo", student.name));
                    keys.push(student.dataset_key);
                }
                Some(_) => keys.push(student.dataset_key),
            }
        }
        if !errors.is_empty() {
            return Err(TrainingError::DatasetInvalid(errors));
        }
        Ok((ids.into_iter().collect(), keys, warnings))
    }

    /// Run the worker for a validated job and record the outcome.
    pub async fn execute(&self, job: TrainingJob) -> Result<TrainingReport, TrainingError> {
        let outcome = self.run_worker(&job).await;
        let finished_at = Some(Utc::now());
        match &outcome {
            Ok(report) => {
                tracing::info!(trained = report.trained, "training complete");
                self.progress.send_modify(|p| {
                    p.is_training = false;
                    p.progress = 100;
                    p.message = format!("Training complete: {} students trained", report.trained);
                    p.finished_at = finished_at;
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "training failed");
                self.progress.send_modify(|p| {
                    p.is_training = false;
                    p.progress = 0;
                    p.message = "Training failed".to_string();
                    p.last_error = Some(e.to_string());
                    p.finished_at = finished_at;
                });
            }
        }
        outcome
    }

    async fn run_worker(&self, job: &TrainingJob) -> Result<TrainingReport, TrainingError> {
        let mut envs: Vec<(&str, OsString)> = vec![
            ("ROLLCALL_DATASET_DIR", self.dataset.root().into()),
            ("ROLLCALL_EMBEDDINGS_PATH", self.embeddings_path.clone().into()),
        ];
        if let Some(keys) = &job.subset_keys {
            envs.push(("ROLLCALL_TRAIN_KEYS", keys.join(",").into()));
        }

        tracing::info!(
            folders = job.folder_count,
            students = job.student_ids.len(),
            subset = job.subset_keys.is_some(),
            "training started"
        );

        let previous = artifact_stamp(&self.embeddings_path).await;
        let mut parser = ProgressChain::for_training(job.folder_count);
        let progress = &self.progress;
        let run = self
            .gateway
            .run(&self.args, &envs, self.timeout, |line| {
                if let Some(update) = parser.parse_line(line) {
                    progress.send_modify(|p| {
                        p.progress = update.progress;
                        p.message = update.message;
                    });
                }
            })
            .await?;
        if !run.stderr_tail.is_empty() {
            tracing::debug!(stderr = %run.stderr_tail, "training worker stderr");
        }

        // A model left over from an earlier run does not count.
        let artifact_ok = match (artifact_stamp(&self.embeddings_path).await, previous) {
            (Some(written), Some(before)) => written > before,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !artifact_ok {
            return Err(TrainingError::ArtifactMissing(self.embeddings_path.clone()));
        }

        let trained = self.store.mark_trained(job.student_ids.clone()).await?;
        Ok(TrainingReport {
            trained,
            warnings: job.warnings.clone(),
        })
    }

    /// Validate synchronously, then run the worker in a background task.
    pub async fn start(&self, scope: TrainingScope) -> Result<TrainingJobInfo, TrainingError> {
        let job = self.begin(scope).await?;
        let info = TrainingJobInfo {
            students: job.student_count(),
            folders: job.folder_count,
            warnings: job.warnings.clone(),
        };
        let this = self.clone();
        tokio::spawn(async move {
            // Outcome is recorded in the progress channel.
            let _ = this.execute(job).await;
        });
        Ok(info)
    }

    /// Validate and run to completion.
    #[cfg(test)]
    pub async fn train(&self, scope: TrainingScope) -> Result<TrainingReport, TrainingError> {
        let job = self.begin(scope).await?;
        self.execute(job).await
    }
}

/// Modification time of a non-empty model file, if there is one.
async fn artifact_stamp(path: &Path) -> Option<SystemTime> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    if !meta.is_file() || meta.len() == 0 {
        return None;
    }
    meta.modified().ok()
}

/// What a background run was started with.
#[derive(Debug, Clone, Serialize)]
pub struct TrainingJobInfo {
    pub students: usize,
    pub folders: usize,
    pub warnings: Vec<String>,
}
