//! Per-session scratch space for captured images.
//!
//! Each batch gets its own `staging/<session_id>/` folder so concurrent
//! batches never see each other's files. Staged files are named by their
//! capture index (`0003.jpg`), which keeps the worker's sorted listing in
//! capture order.

use crate::decode::decode_image;
use crate::store::{DatasetError, FailedImage};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Images of one batch that made it to disk.
#[derive(Debug)]
pub struct StagedBatch {
    pub dir: PathBuf,
    /// Capture index of each staged file, in the worker's listing order.
    source_indices: Vec<u32>,
    pub failed: Vec<FailedImage>,
}

impl StagedBatch {
    pub fn staged_count(&self) -> usize {
        self.source_indices.len()
    }

    /// Map the worker's image index back to the original capture index.
    pub fn source_index(&self, worker_index: u32) -> Option<u32> {
        self.source_indices.get(worker_index as usize).copied()
    }
}

#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn batch_dir(&self, session_id: &str) -> Result<PathBuf, DatasetError> {
        let safe = !session_id.is_empty()
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !safe {
            return Err(DatasetError::InvalidKey(session_id.to_string()));
        }
        Ok(self.root.join(session_id))
    }

    /// Decode and write a batch into a fresh folder for `session_id`.
    ///
    /// Undecodable images are skipped and reported. If nothing could be
    /// staged the folder is removed and `NoValidImages` is returned.
    pub fn stage<S: AsRef<str>>(
        &self,
        session_id: &str,
        images: &[S],
    ) -> Result<StagedBatch, DatasetError> {
        let dir = self.batch_dir(session_id)?;
        remove_dir(&dir)?;
        fs::create_dir_all(&dir).map_err(|source| DatasetError::Io {
            path: dir.clone(),
            source,
        })?;

        let mut source_indices = Vec::new();
        let mut failed = Vec::new();

        for (index, encoded) in images.iter().enumerate() {
            let written = decode_image(encoded.as_ref())
                .map_err(|e| e.to_string())
                .and_then(|decoded| {
                    let path = dir.join(format!("{index:04}.{}", decoded.extension()));
                    fs::write(&path, &decoded.bytes).map_err(|e| e.to_string())
                });
            match written {
                Ok(()) => source_indices.push(index as u32),
                Err(reason) => {
                    tracing::warn!(session = session_id, index, %reason, "capture image not staged");
                    failed.push(FailedImage { index, reason });
                }
            }
        }

        if source_indices.is_empty() {
            remove_dir(&dir)?;
            return Err(DatasetError::NoValidImages { failed });
        }

        tracing::debug!(
            session = session_id,
            staged = source_indices.len(),
            rejected = failed.len(),
            dir = %dir.display(),
            "batch staged"
        );
        Ok(StagedBatch {
            dir,
            source_indices,
            failed,
        })
    }

    /// Remove a session's batch folder, after a batch or whatever a crash
    /// left behind. Missing folders are fine.
    pub fn purge(&self, session_id: &str) -> Result<(), DatasetError> {
        remove_dir(&self.batch_dir(session_id)?)
    }
}

fn remove_dir(dir: &Path) -> Result<(), DatasetError> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(DatasetError::Io {
            path: dir.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::encoded_image;
    use image::ImageFormat;
    use tempfile::TempDir;

    #[test]
    fn test_stage_skips_bad_images_and_maps_indices() {
        let dir = TempDir::new().expect("tempdir");
        let staging = StagingArea::new(dir.path());
        let images = vec![
            encoded_image(ImageFormat::Png),
            "corrupt".to_string(),
            encoded_image(ImageFormat::Jpeg),
            String::new(),
            encoded_image(ImageFormat::Png),
        ];

        let batch = staging.stage("session-1", &images).unwrap();
        assert_eq!(batch.staged_count(), 3);
        assert_eq!(batch.failed.iter().map(|f| f.index).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(batch.source_index(0), Some(0));
        assert_eq!(batch.source_index(1), Some(2));
        assert_eq!(batch.source_index(2), Some(4));
        assert_eq!(batch.source_index(3), None);

        let mut names: Vec<String> = fs::read_dir(&batch.dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["0000.png", "0002.jpg", "0004.png"]);

        staging.purge("session-1").unwrap();
        assert!(!batch.dir.exists());
        staging.purge("session-1").unwrap();
    }

    #[test]
    fn test_stage_isolated_per_session() {
        let dir = TempDir::new().expect("tempdir");
        let staging = StagingArea::new(dir.path());
        let a = staging.stage("a", &[encoded_image(ImageFormat::Png)]).unwrap();
        let b = staging
            .stage("b", &vec![encoded_image(ImageFormat::Png); 2])
            .unwrap();
        assert_ne!(a.dir, b.dir);
        assert_eq!(fs::read_dir(&a.dir).unwrap().count(), 1);
        assert_eq!(fs::read_dir(&b.dir).unwrap().count(), 2);
    }

    #[test]
    fn test_restage_clears_previous_files() {
        let dir = TempDir::new().expect("tempdir");
        let staging = StagingArea::new(dir.path());
        staging
            .stage("s", &vec![encoded_image(ImageFormat::Png); 3])
            .unwrap();
        let batch = staging.stage("s", &[encoded_image(ImageFormat::Png)]).unwrap();
        assert_eq!(fs::read_dir(&batch.dir).unwrap().count(), 1);
    }

    #[test]
    fn test_stage_nothing_valid() {
        let dir = TempDir::new().expect("tempdir");
        let staging = StagingArea::new(dir.path());
        let err = staging.stage("s", &["x", "y"]).unwrap_err();
        assert!(matches!(err, DatasetError::NoValidImages { .. }));
        assert!(!dir.path().join("s").exists());
    }

    #[test]
    fn test_purge_leftovers() {
        let dir = TempDir::new().expect("tempdir");
        let staging = StagingArea::new(dir.path());
        staging.stage("crashed", &[encoded_image(ImageFormat::Png)]).unwrap();
        staging.purge("crashed").unwrap();
        assert!(!dir.path().join("crashed").exists());
        staging.purge("never-staged").unwrap();
    }

    #[test]
    fn test_unsafe_session_id_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let staging = StagingArea::new(dir.path());
        assert!(matches!(
            staging.stage("../escape", &["x"]),
            Err(DatasetError::InvalidKey(_))
        ));
    }
}
