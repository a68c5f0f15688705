//! rollcall-core — Attendance domain model and worker contract.
//!
//! Holds the types shared by the daemon, the dataset store and the
//! persistence layer: session lifecycle rules, dataset folder keys, the
//! recognition worker's output schema, progress-line parsing and the
//! max-by-confidence attendance aggregation.

pub mod aggregate;
pub mod error;
pub mod key;
pub mod payload;
pub mod progress;
pub mod session;
pub mod types;

pub use error::ErrorKind;
pub use session::{SessionStatus, TransitionError};
pub use types::{
    AttendanceRecord, AttendanceSession, BoundingBox, Embedding, RecognitionResult,
    SessionCounters, Student,
};
