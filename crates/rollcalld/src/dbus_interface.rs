use serde::de::DeserializeOwned;
use zbus::interface;

use crate::service::{AttendanceService, Outcome, Reply, ServiceError};

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
///
/// Every method answers with a JSON `Outcome`; failures are carried in the
/// payload, not as D-Bus errors. Optional string arguments use `""` for none.
pub struct AttendanceInterface {
    service: AttendanceService,
}

impl AttendanceInterface {
    pub fn new(service: AttendanceService) -> Self {
        Self { service }
    }
}

fn respond(result: Result<Reply, ServiceError>) -> zbus::fdo::Result<String> {
    Ok(Outcome::from(result).to_json())
}

fn optional(value: &str) -> Option<&str> {
    let value = value.trim();
    (!value.is_empty()).then_some(value)
}

fn json_arg<T: DeserializeOwned>(name: &str, raw: &str) -> Result<T, ServiceError> {
    serde_json::from_str(raw)
        .map_err(|e| ServiceError::Invalid(format!("{name} must be a JSON array of strings: {e}")))
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceInterface {
    /// Add a student to the roster.
    async fn register_student(&self, name: &str, roster_id: &str) -> zbus::fdo::Result<String> {
        tracing::info!(name, "register_student requested");
        respond(self.service.register_student(name, optional(roster_id)).await)
    }

    /// Replace a student's training photos with base64 images.
    async fn submit_photos(&self, student_id: &str, images_json: &str) -> zbus::fdo::Result<String> {
        tracing::info!(student_id, "submit_photos requested");
        let result = match json_arg::<Vec<String>>("images", images_json) {
            Ok(images) => self.service.submit_photos(student_id, images).await,
            Err(e) => Err(e),
        };
        respond(result)
    }

    async fn clear_photos(&self, student_id: &str) -> zbus::fdo::Result<String> {
        tracing::info!(student_id, "clear_photos requested");
        respond(self.service.clear_photos(student_id).await)
    }

    async fn list_photos(&self, student_id: &str) -> zbus::fdo::Result<String> {
        respond(self.service.list_photos(student_id).await)
    }

    /// Start a full training run in the background.
    async fn start_training(&self) -> zbus::fdo::Result<String> {
        tracing::info!("start_training requested");
        respond(self.service.start_training().await)
    }

    /// Retrain only the given students (JSON array of ids).
    async fn retrain_students(&self, ids_json: &str) -> zbus::fdo::Result<String> {
        tracing::info!("retrain_students requested");
        let result = match json_arg::<Vec<String>>("ids", ids_json) {
            Ok(ids) => self.service.retrain_students(ids).await,
            Err(e) => Err(e),
        };
        respond(result)
    }

    async fn training_status(&self) -> zbus::fdo::Result<String> {
        respond(self.service.training_status().await)
    }

    /// Create a pending session. `date` is `YYYY-MM-DD`, empty for today.
    async fn create_session(&self, class_id: &str, date: &str) -> zbus::fdo::Result<String> {
        tracing::info!(class_id, date, "create_session requested");
        respond(
            self.service
                .create_session(optional(class_id).map(str::to_string), optional(date))
                .await,
        )
    }

    /// Recognize a batch of base64 images. Returns when the batch is committed.
    async fn submit_batch(&self, session_id: &str, images_json: &str) -> zbus::fdo::Result<String> {
        tracing::info!(session_id, "submit_batch requested");
        let result = match json_arg::<Vec<String>>("images", images_json) {
            Ok(images) => self.service.submit_batch(session_id, images).await,
            Err(e) => Err(e),
        };
        respond(result)
    }

    async fn session_results(&self, session_id: &str) -> zbus::fdo::Result<String> {
        respond(self.service.session_results(session_id).await)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        respond(self.service.status().await)
    }
}
