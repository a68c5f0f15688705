//! rollcall-dataset — Filesystem storage for training photos and captures.
//!
//! The dataset root holds one folder per student, named by the student's
//! dataset key. The staging root holds one scratch folder per attendance
//! session while its batch is being recognized.

pub mod decode;
pub mod staging;
pub mod store;

pub use decode::{decode_image, DecodeError, DecodedImage};
pub use staging::{StagedBatch, StagingArea};
pub use store::{DatasetError, DatasetStore, DatasetSummary, FailedImage, FolderSummary, PhotoSaveReport};

/// File extensions the recognition worker will pick up.
pub const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// Whether a path names an image file the worker understands.
pub fn is_image_file(path: &std::path::Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|ok| e.eq_ignore_ascii_case(ok)))
        .unwrap_or(false)
}
