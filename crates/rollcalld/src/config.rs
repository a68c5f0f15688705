use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Which message bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Session,
    System,
}

/// Daemon configuration: TOML file, then `ROLLCALL_*` environment, then defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Root of the per-student training photo folders.
    pub dataset_dir: PathBuf,
    /// Scratch root for capture batches (one subfolder per session).
    pub staging_dir: PathBuf,
    /// Audit JSON output, one file per completed session.
    pub output_dir: PathBuf,
    /// Working directory of the worker process.
    pub worker_dir: PathBuf,
    /// Model artifact written by training and read by recognition.
    pub embeddings_path: PathBuf,
    pub worker_program: String,
    pub train_args: Vec<String>,
    pub recognize_args: Vec<String>,
    /// Minimum confidence for a detection to count toward attendance.
    pub acceptance_threshold: f32,
    pub training_timeout_secs: u64,
    pub recognition_timeout_secs: u64,
    /// How much of the worker's stderr to keep on failure.
    pub stderr_tail_bytes: usize,
    pub bus: BusKind,
}

/// Shape of the optional TOML file. Every key may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    data_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    dataset_dir: Option<PathBuf>,
    staging_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    worker_dir: Option<PathBuf>,
    embeddings_path: Option<PathBuf>,
    worker_program: Option<String>,
    train_args: Option<Vec<String>>,
    recognize_args: Option<Vec<String>>,
    acceptance_threshold: Option<f32>,
    training_timeout_secs: Option<u64>,
    recognition_timeout_secs: Option<u64>,
    stderr_tail_bytes: Option<usize>,
    bus: Option<BusKind>,
}

impl Config {
    /// Load configuration from `ROLLCALL_CONFIG` (if set) and `ROLLCALL_*` variables.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => read_file(Path::new(&path))?,
            Err(_) => FileConfig::default(),
        };
        Self::resolve(file, |key| std::env::var(key).ok())
    }

    fn resolve(
        file: FileConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let path = |key: &str, from_file: Option<PathBuf>| env(key).map(PathBuf::from).or(from_file);

        let data_dir = path("ROLLCALL_DATA_DIR", file.data_dir).unwrap_or_else(|| {
            env("XDG_DATA_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| {
                    let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
                    PathBuf::from(home).join(".local/share")
                })
                .join("rollcall")
        });

        let worker_dir = path("ROLLCALL_WORKER_DIR", file.worker_dir).unwrap_or_else(|| data_dir.clone());
        let embeddings_path = path("ROLLCALL_EMBEDDINGS_PATH", file.embeddings_path)
            .unwrap_or_else(|| worker_dir.join("face_embeddings.pkl"));

        let acceptance_threshold = parsed(&env, "ROLLCALL_ACCEPTANCE_THRESHOLD")?
            .or(file.acceptance_threshold)
            .unwrap_or(0.45);
        if !(0.0..=1.0).contains(&acceptance_threshold) {
            return Err(ConfigError::Invalid {
                key: "acceptance_threshold",
                value: acceptance_threshold.to_string(),
            });
        }

        let bus = match env("ROLLCALL_BUS") {
            Some(v) => match v.as_str() {
                "session" => BusKind::Session,
                "system" => BusKind::System,
                _ => return Err(ConfigError::Invalid { key: "ROLLCALL_BUS", value: v }),
            },
            None => file.bus.unwrap_or(BusKind::Session),
        };

        Ok(Self {
            db_path: path("ROLLCALL_DB_PATH", file.db_path).unwrap_or_else(|| data_dir.join("attendance.db")),
            dataset_dir: path("ROLLCALL_DATASET_DIR", file.dataset_dir).unwrap_or_else(|| data_dir.join("dataset")),
            staging_dir: path("ROLLCALL_STAGING_DIR", file.staging_dir).unwrap_or_else(|| data_dir.join("staging")),
            output_dir: path("ROLLCALL_OUTPUT_DIR", file.output_dir).unwrap_or_else(|| data_dir.join("output")),
            worker_program: env("ROLLCALL_WORKER_PROGRAM")
                .or(file.worker_program)
                .unwrap_or_else(|| "python3".to_string()),
            train_args: env("ROLLCALL_TRAIN_ARGS")
                .map(|v| split_args(&v))
                .or(file.train_args)
                .unwrap_or_else(|| vec!["train.py".to_string()]),
            recognize_args: env("ROLLCALL_RECOGNIZE_ARGS")
                .map(|v| split_args(&v))
                .or(file.recognize_args)
                .unwrap_or_else(|| vec!["recognize.py".to_string()]),
            acceptance_threshold,
            training_timeout_secs: parsed(&env, "ROLLCALL_TRAINING_TIMEOUT_SECS")?
                .or(file.training_timeout_secs)
                .unwrap_or(600),
            recognition_timeout_secs: parsed(&env, "ROLLCALL_RECOGNITION_TIMEOUT_SECS")?
                .or(file.recognition_timeout_secs)
                .unwrap_or(120),
            stderr_tail_bytes: parsed(&env, "ROLLCALL_STDERR_TAIL_BYTES")?
                .or(file.stderr_tail_bytes)
                .unwrap_or(2000),
            bus,
            worker_dir,
            embeddings_path,
            data_dir,
        })
    }

    /// Defaults rooted at `dir`, ignoring the process environment.
    #[cfg(test)]
    pub(crate) fn rooted_at(dir: &Path) -> Self {
        let dir = dir.to_string_lossy().into_owned();
        Self::resolve(FileConfig::default(), |key| {
            (key == "ROLLCALL_DATA_DIR").then(|| dir.clone())
        })
        .expect("default config is valid")
    }

    pub fn training_timeout(&self) -> Duration {
        Duration::from_secs(self.training_timeout_secs)
    }

    pub fn recognition_timeout(&self) -> Duration {
        Duration::from_secs(self.recognition_timeout_secs)
    }
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn split_args(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

fn parsed<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match env(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_derive_from_data_dir() {
        let cfg = Config::resolve(FileConfig::default(), env_of(&[("XDG_DATA_HOME", "/srv/data")])).unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("/srv/data/rollcall"));
        assert_eq!(cfg.db_path, PathBuf::from("/srv/data/rollcall/attendance.db"));
        assert_eq!(cfg.dataset_dir, PathBuf::from("/srv/data/rollcall/dataset"));
        assert_eq!(cfg.embeddings_path, PathBuf::from("/srv/data/rollcall/face_embeddings.pkl"));
        assert_eq!(cfg.worker_program, "python3");
        assert_eq!(cfg.train_args, vec!["train.py"]);
        assert!((cfg.acceptance_threshold - 0.45).abs() < f32::EPSILON);
        assert_eq!(cfg.training_timeout(), Duration::from_secs(600));
        assert_eq!(cfg.recognition_timeout(), Duration::from_secs(120));
        assert_eq!(cfg.bus, BusKind::Session);
    }

    #[test]
    fn test_env_overrides_file() {
        let file: FileConfig = toml::from_str(
            r#"
            data_dir = "/var/lib/rollcall"
            worker_program = "python3.11"
            acceptance_threshold = 0.6
            recognize_args = ["-u", "recognize.py"]
            bus = "system"
            "#,
        )
        .unwrap();
        let env = env_of(&[
            ("ROLLCALL_ACCEPTANCE_THRESHOLD", "0.5"),
            ("ROLLCALL_WORKER_DIR", "/opt/worker"),
            ("ROLLCALL_TRAIN_ARGS", "-u  train.py --fast"),
        ]);
        let cfg = Config::resolve(file, env).unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/rollcall"));
        assert_eq!(cfg.worker_program, "python3.11");
        assert!((cfg.acceptance_threshold - 0.5).abs() < f32::EPSILON);
        assert_eq!(cfg.embeddings_path, PathBuf::from("/opt/worker/face_embeddings.pkl"));
        assert_eq!(cfg.train_args, vec!["-u", "train.py", "--fast"]);
        assert_eq!(cfg.recognize_args, vec!["-u", "recognize.py"]);
        assert_eq!(cfg.bus, BusKind::System);
    }

    #[test]
    fn test_rejects_bad_values() {
        let bad_number = env_of(&[("ROLLCALL_TRAINING_TIMEOUT_SECS", "ten")]);
        assert!(matches!(
            Config::resolve(FileConfig::default(), bad_number),
            Err(ConfigError::Invalid { .. })
        ));

        let bad_threshold = env_of(&[("ROLLCALL_ACCEPTANCE_THRESHOLD", "1.5")]);
        assert!(Config::resolve(FileConfig::default(), bad_threshold).is_err());

        let bad_bus = env_of(&[("ROLLCALL_BUS", "tcp")]);
        assert!(Config::resolve(FileConfig::default(), bad_bus).is_err());

        assert!(toml::from_str::<FileConfig>("unknown_key = 1").is_err());
    }
}
