use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose, Engine};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    fn register_student(&self, name: &str, roster_id: &str) -> zbus::Result<String>;
    fn submit_photos(&self, student_id: &str, images_json: &str) -> zbus::Result<String>;
    fn clear_photos(&self, student_id: &str) -> zbus::Result<String>;
    fn list_photos(&self, student_id: &str) -> zbus::Result<String>;
    fn start_training(&self) -> zbus::Result<String>;
    fn retrain_students(&self, ids_json: &str) -> zbus::Result<String>;
    fn training_status(&self) -> zbus::Result<String>;
    fn create_session(&self, class_id: &str, date: &str) -> zbus::Result<String>;
    fn submit_batch(&self, session_id: &str, images_json: &str) -> zbus::Result<String>;
    fn session_results(&self, session_id: &str) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall classroom attendance CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a student
    Register {
        /// Display name
        name: String,
        /// External roster identifier
        #[arg(short, long)]
        roster_id: Option<String>,
    },
    /// Manage a student's training photos
    Photos {
        #[command(subcommand)]
        action: PhotoAction,
    },
    /// Train the recognition model (all students, or only --student)
    Train {
        /// Retrain only these student ids
        #[arg(short, long = "student")]
        students: Vec<String>,
    },
    /// Show training progress and daemon status
    Status,
    /// Manage attendance sessions
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Submit captured images for a pending session
    Recognize {
        session_id: String,
        /// Image files, in capture order
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Show recognition results and attendance for a session
    Results { session_id: String },
}

#[derive(Subcommand)]
enum PhotoAction {
    /// Replace a student's photos with these files
    Add {
        student_id: String,
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Remove all of a student's photos
    Clear { student_id: String },
    /// List a student's stored photos
    List { student_id: String },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Create a pending session
    Create {
        /// Class identifier
        #[arg(short, long)]
        class: Option<String>,
        /// Capture date (YYYY-MM-DD), defaults to today
        #[arg(short, long)]
        date: Option<String>,
    },
}

/// Read image files and encode them as a JSON array of base64 strings.
fn encode_images(paths: &[PathBuf]) -> Result<String> {
    let encoded = paths
        .iter()
        .map(|path| {
            std::fs::read(path)
                .map(|bytes| general_purpose::STANDARD.encode(bytes))
                .with_context(|| format!("failed to read {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(serde_json::to_string(&encoded)?)
}

/// Print a daemon outcome; fail the process if it reports an error.
fn report(raw: String) -> Result<()> {
    let outcome: Value = serde_json::from_str(&raw).context("daemon sent malformed reply")?;
    let message = outcome["message"].as_str().unwrap_or_default();
    if outcome["ok"].as_bool() != Some(true) {
        let kind = outcome["error"].as_str().unwrap_or("unknown");
        bail!("{message} ({kind})");
    }
    println!("{message}");
    if !outcome["data"].is_null() {
        println!("{}", serde_json::to_string_pretty(&outcome["data"])?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("failed to connect to D-Bus")?;
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")?;
    tracing::debug!(system_bus = cli.system, "connected to rollcalld");

    let reply = match cli.command {
        Commands::Register { name, roster_id } => {
            proxy
                .register_student(&name, roster_id.as_deref().unwrap_or(""))
                .await?
        }
        Commands::Photos { action } => match action {
            PhotoAction::Add { student_id, images } => {
                proxy.submit_photos(&student_id, &encode_images(&images)?).await?
            }
            PhotoAction::Clear { student_id } => proxy.clear_photos(&student_id).await?,
            PhotoAction::List { student_id } => proxy.list_photos(&student_id).await?,
        },
        Commands::Train { students } => {
            if students.is_empty() {
                proxy.start_training().await?
            } else {
                proxy
                    .retrain_students(&serde_json::to_string(&students)?)
                    .await?
            }
        }
        Commands::Status => {
            report(proxy.status().await?)?;
            proxy.training_status().await?
        }
        Commands::Session { action } => match action {
            SessionAction::Create { class, date } => {
                proxy
                    .create_session(
                        class.as_deref().unwrap_or(""),
                        date.as_deref().unwrap_or(""),
                    )
                    .await?
            }
        },
        Commands::Recognize { session_id, images } => {
            println!("Submitting {} images...", images.len());
            proxy
                .submit_batch(&session_id, &encode_images(&images)?)
                .await?
        }
        Commands::Results { session_id } => proxy.session_results(&session_id).await?,
    };

    report(reply)
}
