//! Worker progress lines.
//!
//! Workers report progress with tagged lines:
//!
//! ```text
//! PROGRESS {"progress": 40, "message": "embedding ana"}
//! ```
//!
//! Older training scripts only print free text, so a best-effort text
//! matcher sits behind the same [`ProgressParser`] trait.

use serde::Deserialize;

/// Line prefix of a tagged progress event.
pub const PROGRESS_PREFIX: &str = "PROGRESS ";

const LEGACY_STUDENT_MARKER: &str = "Processing student:";
const LEGACY_COMPLETE_MARKER: &str = "Training Complete";
const LEGACY_START: f32 = 10.0;
const LEGACY_SPAN: f32 = 80.0;
const LEGACY_COMPLETE_PROGRESS: u8 = 95;

/// A progress observation extracted from one output line.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    /// Percentage in `0..=100`.
    pub progress: u8,
    pub message: String,
}

/// Strategy for turning worker output lines into progress updates.
pub trait ProgressParser: Send {
    fn parse_line(&mut self, line: &str) -> Option<ProgressUpdate>;
}

/// Parser for `PROGRESS {json}` lines.
pub struct TaggedProgress;

#[derive(Deserialize)]
struct TaggedEvent {
    progress: f32,
    #[serde(default)]
    message: String,
}

impl ProgressParser for TaggedProgress {
    fn parse_line(&mut self, line: &str) -> Option<ProgressUpdate> {
        let body = line.trim().strip_prefix(PROGRESS_PREFIX)?;
        let event: TaggedEvent = serde_json::from_str(body).ok()?;
        if !event.progress.is_finite() {
            return None;
        }
        Some(ProgressUpdate {
            progress: event.progress.clamp(0.0, 100.0).round() as u8,
            message: event.message,
        })
    }
}

/// Text matcher for training scripts that predate the tagged protocol.
pub struct LegacyTextProgress {
    expected_students: usize,
    seen: usize,
}

impl LegacyTextProgress {
    pub fn new(expected_students: usize) -> Self {
        Self {
            expected_students: expected_students.max(1),
            seen: 0,
        }
    }
}

impl ProgressParser for LegacyTextProgress {
    fn parse_line(&mut self, line: &str) -> Option<ProgressUpdate> {
        if let Some(idx) = line.find(LEGACY_STUDENT_MARKER) {
            let name = line[idx + LEGACY_STUDENT_MARKER.len()..].trim();
            self.seen += 1;
            let fraction = (self.seen as f32 / self.expected_students as f32).min(1.0);
            return Some(ProgressUpdate {
                progress: (LEGACY_START + LEGACY_SPAN * fraction).round() as u8,
                message: format!("Processing student: {name}"),
            });
        }
        if line.contains(LEGACY_COMPLETE_MARKER) {
            return Some(ProgressUpdate {
                progress: LEGACY_COMPLETE_PROGRESS,
                message: "Training complete, saving model".to_string(),
            });
        }
        None
    }
}

/// Tries each parser in order; the first match wins.
pub struct ProgressChain {
    parsers: Vec<Box<dyn ProgressParser>>,
}

impl ProgressChain {
    pub fn new(parsers: Vec<Box<dyn ProgressParser>>) -> Self {
        Self { parsers }
    }

    /// Tagged protocol first, text matching as fallback.
    pub fn for_training(expected_students: usize) -> Self {
        Self::new(vec![
            Box::new(TaggedProgress),
            Box::new(LegacyTextProgress::new(expected_students)),
        ])
    }
}

impl ProgressParser for ProgressChain {
    fn parse_line(&mut self, line: &str) -> Option<ProgressUpdate> {
        self.parsers.iter_mut().find_map(|p| p.parse_line(line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_line() {
        let update = TaggedProgress
            .parse_line(r#"PROGRESS {"progress": 42.4, "message": "embedding ana"}"#)
            .unwrap();
        assert_eq!(update.progress, 42);
        assert_eq!(update.message, "embedding ana");
    }

    #[test]
    fn test_tagged_clamps_and_ignores_garbage() {
        let update = TaggedProgress
            .parse_line(r#"PROGRESS {"progress": 250}"#)
            .unwrap();
        assert_eq!(update.progress, 100);
        assert!(TaggedProgress.parse_line("PROGRESS not json").is_none());
        assert!(TaggedProgress.parse_line("Processing student: ana").is_none());
    }

    #[test]
    fn test_legacy_students_advance() {
        let mut p = LegacyTextProgress::new(4);
        let first = p.parse_line("Processing student: ana").unwrap();
        assert_eq!(first.progress, 30);
        assert_eq!(first.message, "Processing student: ana");
        p.parse_line("Processing student: ben");
        p.parse_line("Processing student: cy");
        let last = p.parse_line("Processing student: dee").unwrap();
        assert_eq!(last.progress, 90);
        // More folders than expected never pushes past the span.
        assert_eq!(p.parse_line("Processing student: eve").unwrap().progress, 90);
    }

    #[test]
    fn test_legacy_complete_and_noise() {
        let mut p = LegacyTextProgress::new(1);
        assert_eq!(
            p.parse_line("\n✅ Training Complete!").unwrap().progress,
            LEGACY_COMPLETE_PROGRESS
        );
        assert!(p.parse_line("  - Processed 3 images for ana").is_none());
    }

    #[test]
    fn test_chain_prefers_tagged() {
        let mut chain = ProgressChain::for_training(2);
        let tagged = chain
            .parse_line(r#"PROGRESS {"progress": 5, "message": "loading"}"#)
            .unwrap();
        assert_eq!(tagged.progress, 5);
        let legacy = chain.parse_line("Processing student: ana").unwrap();
        assert_eq!(legacy.progress, 50);
        assert!(chain.parse_line("unrelated").is_none());
    }
}
