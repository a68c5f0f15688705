//! Per-student training photo folders.

use crate::decode::decode_image;
use crate::is_image_file;
use rollcall_core::key::folder_key;
use rollcall_core::ErrorKind;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("dataset root not found: {0}")]
    RootMissing(PathBuf),
    #[error("invalid dataset key: {0:?}")]
    InvalidKey(String),
    #[error("no valid images ({} rejected)", .failed.len())]
    NoValidImages { failed: Vec<FailedImage> },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl DatasetError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidKey(_) | Self::NoValidImages { .. } => ErrorKind::Validation,
            Self::RootMissing(_) | Self::Io { .. } => ErrorKind::Resource,
        }
    }

    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// An input image that could not be stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedImage {
    /// Position of the image in the submitted list.
    pub index: usize,
    pub reason: String,
}

/// Outcome of a photo upload that stored at least one image.
#[derive(Debug, Clone, Serialize)]
pub struct PhotoSaveReport {
    pub saved: Vec<PathBuf>,
    pub failed: Vec<FailedImage>,
}

/// One student folder and how many usable images it holds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FolderSummary {
    pub key: String,
    pub image_count: usize,
}

/// Snapshot of the dataset root, folders sorted by key.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DatasetSummary {
    pub folders: Vec<FolderSummary>,
}

impl DatasetSummary {
    pub fn folder(&self, key: &str) -> Option<&FolderSummary> {
        self.folders.iter().find(|f| f.key == key)
    }
}

/// Filesystem-backed training photo store.
#[derive(Debug, Clone)]
pub struct DatasetStore {
    root: PathBuf,
}

impl DatasetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Folder for a dataset key. Rejects anything that is not already a
    /// sanitized key so a caller can never escape the root.
    pub fn folder(&self, key: &str) -> Result<PathBuf, DatasetError> {
        if key.is_empty() || folder_key(key) != key {
            return Err(DatasetError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }

    /// Replace a student's photos with `images`.
    ///
    /// The folder is cleared first. Images that fail to decode or write are
    /// reported by index; the call fails only if none could be stored.
    pub fn save_photos<S: AsRef<str>>(
        &self,
        key: &str,
        images: &[S],
    ) -> Result<PhotoSaveReport, DatasetError> {
        let folder = self.folder(key)?;
        self.clear(key)?;
        fs::create_dir_all(&folder).map_err(|e| DatasetError::io(&folder, e))?;

        let mut saved = Vec::new();
        let mut failed = Vec::new();

        for (index, encoded) in images.iter().enumerate() {
            let decoded = match decode_image(encoded.as_ref()) {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(key, index, error = %e, "rejecting training photo");
                    failed.push(FailedImage {
                        index,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let path = folder.join(format!("{key}_{:02}.{}", index + 1, decoded.extension()));
            match fs::write(&path, &decoded.bytes) {
                Ok(()) => saved.push(path),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to write training photo");
                    failed.push(FailedImage {
                        index,
                        reason: e.to_string(),
                    });
                }
            }
        }

        if saved.is_empty() {
            // Leave no empty folder behind; training treats it as a broken entry.
            self.clear(key)?;
            return Err(DatasetError::NoValidImages { failed });
        }

        tracing::info!(key, saved = saved.len(), failed = failed.len(), "training photos stored");
        Ok(PhotoSaveReport { saved, failed })
    }

    /// Remove a student's folder. Succeeds when there is nothing to remove.
    pub fn clear(&self, key: &str) -> Result<(), DatasetError> {
        let folder = self.folder(key)?;
        match fs::remove_dir_all(&folder) {
            Ok(()) => {
                tracing::debug!(key, "dataset folder cleared");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DatasetError::io(&folder, e)),
        }
    }

    /// Image files currently stored for a student, sorted by name.
    pub fn list_photos(&self, key: &str) -> Result<Vec<PathBuf>, DatasetError> {
        let folder = self.folder(key)?;
        let entries = match fs::read_dir(&folder) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(DatasetError::io(&folder, e)),
        };

        let mut photos = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| DatasetError::io(&folder, e))?.path();
            if path.is_file() && is_image_file(&path) {
                photos.push(path);
            }
        }
        photos.sort();
        Ok(photos)
    }

    /// Enumerate student folders under the root.
    pub fn summarize(&self) -> Result<DatasetSummary, DatasetError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(DatasetError::RootMissing(self.root.clone()))
            }
            Err(e) => return Err(DatasetError::io(&self.root, e)),
        };

        let mut folders = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| DatasetError::io(&self.root, e))?.path();
            if !path.is_dir() {
                continue;
            }
            let Some(key) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Ok(photos) = self.list_photos(key) else {
                tracing::warn!(folder = %path.display(), "skipping folder with unsanitized name");
                continue;
            };
            folders.push(FolderSummary {
                key: key.to_string(),
                image_count: photos.len(),
            });
        }
        folders.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(DatasetSummary { folders })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::encoded_image;
    use image::ImageFormat;
    use tempfile::TempDir;

    fn store() -> (TempDir, DatasetStore) {
        let dir = TempDir::new().expect("tempdir");
        let store = DatasetStore::new(dir.path().join("dataset"));
        (dir, store)
    }

    #[test]
    fn test_save_photos_all_valid() {
        let (_dir, store) = store();
        let images = vec![encoded_image(ImageFormat::Png), encoded_image(ImageFormat::Jpeg)];
        let report = store.save_photos("jane_doe", &images).unwrap();
        assert_eq!(report.saved.len(), 2);
        assert!(report.failed.is_empty());

        let listed = store.list_photos("jane_doe").unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed[0].ends_with("jane_doe_01.png"));
        assert!(listed[1].ends_with("jane_doe_02.jpg"));
    }

    #[test]
    fn test_save_photos_partial_failure() {
        let (_dir, store) = store();
        let images = vec![
            "garbage".to_string(),
            encoded_image(ImageFormat::Png),
            String::new(),
        ];
        let report = store.save_photos("ana", &images).unwrap();
        assert_eq!(report.saved.len(), 1);
        let failed: Vec<usize> = report.failed.iter().map(|f| f.index).collect();
        assert_eq!(failed, vec![0, 2]);
    }

    #[test]
    fn test_save_photos_none_valid_leaves_nothing() {
        let (_dir, store) = store();
        let err = store.save_photos("ana", &["bad", "worse"]).unwrap_err();
        match err {
            DatasetError::NoValidImages { failed } => assert_eq!(failed.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!store.folder("ana").unwrap().exists());
    }

    #[test]
    fn test_save_replaces_previous_photos() {
        let (_dir, store) = store();
        let three = vec![encoded_image(ImageFormat::Png); 3];
        store.save_photos("ana", &three).unwrap();
        store.save_photos("ana", &[encoded_image(ImageFormat::Jpeg)]).unwrap();
        assert_eq!(store.list_photos("ana").unwrap().len(), 1);
    }

    #[test]
    fn test_clear_idempotent() {
        let (_dir, store) = store();
        // Never populated.
        store.clear("ghost").unwrap();
        store.clear("ghost").unwrap();

        store.save_photos("ana", &[encoded_image(ImageFormat::Png)]).unwrap();
        store.clear("ana").unwrap();
        store.clear("ana").unwrap();
        assert!(store.list_photos("ana").unwrap().is_empty());
    }

    #[test]
    fn test_invalid_keys_rejected() {
        let (_dir, store) = store();
        for key in ["../etc", "a/b", "", "Upper"] {
            assert!(matches!(store.folder(key), Err(DatasetError::InvalidKey(_))), "{key}");
        }
        assert_eq!(store.clear("a/b").unwrap_err().kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_summarize() {
        let (_dir, store) = store();
        let missing = store.summarize().unwrap_err();
        assert!(matches!(missing, DatasetError::RootMissing(_)));
        assert_eq!(missing.kind(), ErrorKind::Resource);

        store.save_photos("ben", &[encoded_image(ImageFormat::Png)]).unwrap();
        store
            .save_photos("ana", &vec![encoded_image(ImageFormat::Png); 2])
            .unwrap();
        fs::create_dir_all(store.root().join("empty")).unwrap();
        fs::write(store.root().join("stray.txt"), b"x").unwrap();

        let summary = store.summarize().unwrap();
        let keys: Vec<&str> = summary.folders.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(keys, vec!["ana", "ben", "empty"]);
        assert_eq!(summary.folder("ana").unwrap().image_count, 2);
        assert_eq!(summary.folder("empty").unwrap().image_count, 0);
    }
}
