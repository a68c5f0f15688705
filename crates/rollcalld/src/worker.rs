//! Recognition worker gateway.
//!
//! Runs one external worker process per request under a hard wall-clock
//! timeout. Stdout is streamed line by line to a caller-supplied callback
//! (progress) and kept for result parsing; stderr is kept only as a
//! truncated tail for failure reports. Output of a process that timed out
//! is discarded.

use rollcall_core::payload::{parse_payload, reported_error, PayloadError, WorkerPayload};
use rollcall_core::ErrorKind;
use std::ffi::OsStr;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

use crate::config::Config;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to start worker {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("worker I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("worker timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("worker exited with {}: {detail}", exit_label(.code))]
    ExitNonZero { code: Option<i32>, detail: String },
    #[error(transparent)]
    Payload(#[from] PayloadError),
}

impl WorkerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout(_) => ErrorKind::WorkerTimeout,
            _ => ErrorKind::WorkerFailure,
        }
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("status {c}"),
        None => "signal".to_string(),
    }
}

/// Raw output of a worker that exited 0.
#[derive(Debug)]
pub struct WorkerRun {
    pub stdout: String,
    pub stderr_tail: String,
}

/// Spawns the configured worker program. Does not serialize calls.
#[derive(Debug, Clone)]
pub struct WorkerGateway {
    program: String,
    worker_dir: PathBuf,
    stderr_tail_bytes: usize,
}

impl WorkerGateway {
    pub fn new(program: impl Into<String>, worker_dir: impl Into<PathBuf>, stderr_tail_bytes: usize) -> Self {
        Self {
            program: program.into(),
            worker_dir: worker_dir.into(),
            stderr_tail_bytes,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.worker_program.clone(),
            config.worker_dir.clone(),
            config.stderr_tail_bytes,
        )
    }

    /// Run the worker to completion and return its output.
    ///
    /// `on_line` sees every stdout line as it arrives. A non-zero exit is an
    /// error carrying the stderr tail (and the worker's own `error` field,
    /// if its last record had one).
    pub async fn run<K, V, F>(
        &self,
        args: &[String],
        envs: &[(K, V)],
        timeout: Duration,
        mut on_line: F,
    ) -> Result<WorkerRun, WorkerError>
    where
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
        F: FnMut(&str) + Send,
    {
        let mut command = Command::new(&self.program);
        command
            .args(args)
            .current_dir(&self.worker_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in envs {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|source| WorkerError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        tracing::debug!(program = %self.program, ?args, pid = child.id(), "worker spawned");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("worker stdout not captured"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("worker stderr not captured"))?;

        let run = async {
            let read_stdout = async {
                // Stray non-UTF-8 bytes in log lines are replaced, not fatal.
                let mut reader = BufReader::new(stdout);
                let mut buf = Vec::new();
                let mut collected = String::new();
                loop {
                    buf.clear();
                    if reader.read_until(b'\n', &mut buf).await? == 0 {
                        break;
                    }
                    let decoded = String::from_utf8_lossy(&buf);
                    let line = decoded.trim_end_matches(['\n', '\r']);
                    if !line.trim_start().starts_with('{') {
                        tracing::debug!(line = %line, "worker output");
                    }
                    on_line(line);
                    collected.push_str(line);
                    collected.push('\n');
                }
                Ok::<_, io::Error>(collected)
            };
            let read_stderr = async {
                let mut buf = Vec::new();
                stderr.read_to_end(&mut buf).await?;
                Ok::<_, io::Error>(buf)
            };
            let (out, err) = tokio::try_join!(read_stdout, read_stderr)?;
            let status = child.wait().await?;
            Ok::<(ExitStatus, String, Vec<u8>), io::Error>((status, out, err))
        };

        let outcome = tokio::time::timeout(timeout, run).await;
        let (status, stdout, stderr) = match outcome {
            Ok(result) => result?,
            Err(_) => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "failed to kill timed-out worker");
                }
                tracing::warn!(timeout_secs = timeout.as_secs(), "worker timed out and was killed");
                return Err(WorkerError::Timeout(timeout));
            }
        };

        let stderr_tail = tail(&stderr, self.stderr_tail_bytes);
        if !status.success() {
            let detail = match reported_error(&stdout) {
                Some(reported) if stderr_tail.is_empty() => reported,
                Some(reported) => format!("{reported}; stderr: {stderr_tail}"),
                None => stderr_tail,
            };
            tracing::warn!(code = ?status.code(), "worker exited unsuccessfully");
            return Err(WorkerError::ExitNonZero {
                code: status.code(),
                detail,
            });
        }

        Ok(WorkerRun {
            stdout,
            stderr_tail,
        })
    }

    /// Run a recognition pass and parse its result record.
    pub async fn recognize<K, V>(
        &self,
        args: &[String],
        envs: &[(K, V)],
        timeout: Duration,
    ) -> Result<WorkerPayload, WorkerError>
    where
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        let run = self.run(args, envs, timeout, |_| {}).await?;
        let payload = parse_payload(&run.stdout)?;
        tracing::debug!(
            processed = payload.processed_images,
            faces = payload.total_faces,
            "worker result parsed"
        );
        Ok(payload)
    }
}

/// Last `max` bytes of `bytes` as trimmed, lossy UTF-8.
fn tail(bytes: &[u8], max: usize) -> String {
    let start = bytes.len().saturating_sub(max);
    String::from_utf8_lossy(&bytes[start..]).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const NO_ENV: &[(&str, &str)] = &[];

    fn gateway(dir: &TempDir) -> WorkerGateway {
        WorkerGateway::new("sh", dir.path(), 100)
    }

    fn script(body: &str) -> Vec<String> {
        vec!["-c".to_string(), body.to_string()]
    }

    #[tokio::test]
    async fn test_recognize_parses_last_record() {
        let dir = TempDir::new().unwrap();
        let body = r#"
            echo 'loading model'
            echo '{"not": "the record"}'
            echo '{"processedImages": 2, "totalFaces": 1, "averageConfidence": 0.9, "detections": [{"label": "ana", "confidence": 0.9, "bbox": [0, 0, 10, 10], "imageIndex": 1}]}'
        "#;
        let payload = gateway(&dir)
            .recognize(&script(body), NO_ENV, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(payload.processed_images, 2);
        assert_eq!(payload.detections[0].label.as_deref(), Some("ana"));
    }

    #[tokio::test]
    async fn test_lines_env_and_cwd_reach_caller() {
        let dir = TempDir::new().unwrap();
        let body = r#"echo "dir=$ROLLCALL_IMAGE_DIR"; pwd; echo 'PROGRESS {"progress": 50}'"#;
        let mut seen = Vec::new();
        let run = gateway(&dir)
            .run(
                &script(body),
                &[("ROLLCALL_IMAGE_DIR", "/tmp/batch")],
                Duration::from_secs(10),
                |line| seen.push(line.to_string()),
            )
            .await
            .unwrap();
        assert_eq!(seen[0], "dir=/tmp/batch");
        let cwd = std::fs::canonicalize(dir.path()).unwrap();
        assert_eq!(std::fs::canonicalize(&seen[1]).unwrap(), cwd);
        assert_eq!(seen.len(), 3);
        assert!(run.stdout.ends_with("PROGRESS {\"progress\": 50}\n"));
    }

    #[tokio::test]
    async fn test_timeout_kills_worker() {
        let dir = TempDir::new().unwrap();
        let started = std::time::Instant::now();
        let err = gateway(&dir)
            .recognize(&script("echo '{}'; sleep 30"), NO_ENV, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Timeout(_)));
        assert_eq!(err.kind(), ErrorKind::WorkerTimeout);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_stderr_and_reported_error() {
        let dir = TempDir::new().unwrap();
        let body = r#"echo '{"error": "embeddings file missing"}'; echo 'Traceback: boom' >&2; exit 3"#;
        let err = gateway(&dir)
            .recognize(&script(body), NO_ENV, Duration::from_secs(10))
            .await
            .unwrap_err();
        match err {
            WorkerError::ExitNonZero { code, ref detail } => {
                assert_eq!(code, Some(3));
                assert!(detail.contains("embeddings file missing"));
                assert!(detail.contains("Traceback: boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.kind(), ErrorKind::WorkerFailure);
    }

    #[tokio::test]
    async fn test_stderr_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let body = "i=0; while [ $i -lt 500 ]; do printf 'xxxxxxxxxx' >&2; i=$((i+1)); done; printf END >&2; exit 1";
        let err = gateway(&dir)
            .run(&script(body), NO_ENV, Duration::from_secs(10), |_| {})
            .await
            .unwrap_err();
        let WorkerError::ExitNonZero { detail, .. } = err else {
            panic!("expected non-zero exit");
        };
        assert!(detail.len() <= 100);
        assert!(detail.ends_with("END"));
    }

    #[tokio::test]
    async fn test_exit_zero_with_bad_record_is_failure() {
        let dir = TempDir::new().unwrap();
        for body in [
            "echo 'no json here'",
            "echo '{\"processedImages\": 1}'",
            r#"echo '{"processedImages": 1, "totalFaces": 0, "averageConfidence": 0, "detections": [], "error": "no model"}'"#,
        ] {
            let err = gateway(&dir)
                .recognize(&script(body), NO_ENV, Duration::from_secs(10))
                .await
                .unwrap_err();
            assert!(matches!(err, WorkerError::Payload(_)), "{body}: {err}");
            assert_eq!(err.kind(), ErrorKind::WorkerFailure);
        }
    }

    #[tokio::test]
    async fn test_non_utf8_log_line_is_tolerated() {
        let dir = TempDir::new().unwrap();
        let body = r#"
            printf 'caf\351 loaded\n'
            echo '{"processedImages": 1, "totalFaces": 0, "averageConfidence": 0, "detections": []}'
            echo '{"event": "shutdown"}'
        "#;
        let mut seen = Vec::new();
        let run = gateway(&dir)
            .run(&script(body), NO_ENV, Duration::from_secs(10), |line| {
                seen.push(line.to_string())
            })
            .await
            .unwrap();
        assert_eq!(seen[0], "caf\u{FFFD} loaded");
        assert_eq!(seen.len(), 3);

        let payload = gateway(&dir)
            .recognize(&script(body), NO_ENV, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(payload.processed_images, 1);
        assert!(run.stdout.contains("shutdown"));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let dir = TempDir::new().unwrap();
        let gw = WorkerGateway::new("/nonexistent/rollcall-worker", dir.path(), 100);
        let err = gw.run(&[], NO_ENV, Duration::from_secs(1), |_| {}).await.unwrap_err();
        assert!(matches!(err, WorkerError::Spawn { .. }));
    }

    #[test]
    fn test_tail() {
        assert_eq!(tail(b"  hello world \n", 100), "hello world");
        assert_eq!(tail(b"abcdef", 3), "def");
    }
}
