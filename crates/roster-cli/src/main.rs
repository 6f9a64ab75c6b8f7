use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use roster_core::{
    EnrollmentImages, EnrollmentStore, Identity, ImagePayload, MarkOutcome, MatchResult,
};
use roster_store::SqliteStore;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
#[cfg(test)]
mod testing;
mod worker;

use config::Config;
use worker::{EngineHandle, WorkerError};

#[derive(Parser)]
#[command(name = "roster", about = "Face-identity attendance CLI")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll (or re-enroll) a student from pose images
    Enroll {
        /// Roll number
        #[arg(long)]
        roll: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        course: String,
        /// Frontal face image
        #[arg(long)]
        center: PathBuf,
        /// Face turned left; defaults to the center image
        #[arg(long)]
        left: Option<PathBuf>,
        /// Face turned right; defaults to the center image
        #[arg(long)]
        right: Option<PathBuf>,
    },
    /// Identify the face in an image
    Identify { image: PathBuf },
    /// Open a session and mark every recognized face present
    Attend {
        #[arg(long)]
        course: Option<String>,
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Open a session and mark students present by roll number
    Mark {
        #[arg(long)]
        course: Option<String>,
        /// Roll number; repeatable
        #[arg(long = "roll", required = true)]
        rolls: Vec<String>,
    },
    /// Delete the most recent attendance record
    Undo,
    /// List enrolled students
    List,
    /// List attendance records, newest first
    Attendance {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Remove an enrolled student
    Remove { roll: String },
    /// Show configuration and database status
    Status,
}

/// One image of an `attend` run.
#[derive(Debug, Serialize)]
struct Attended {
    image: PathBuf,
    #[serde(flatten)]
    result: Option<MatchResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mark: Option<MarkOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// One roll number of a `mark` run.
#[derive(Debug, Serialize)]
struct Marked {
    roll: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    mark: Option<MarkOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    tracing::debug!(?config, "configuration loaded");

    let store = Arc::new(open_store(&config.db_path)?);

    match cli.command {
        Commands::Enroll {
            roll,
            name,
            course,
            center,
            left,
            right,
        } => {
            let images = EnrollmentImages {
                center: load_payload(&center)?,
                left: left.as_deref().map(load_payload).transpose()?,
                right: right.as_deref().map(load_payload).transpose()?,
            };
            let engine = worker::spawn_engine(&config, store)?;
            let result = engine
                .enroll(Identity::new(roll, name, course), images)
                .await?;
            print_json(&result)?;
            if !result.is_accepted() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Identify { image } => {
            let payload = load_payload(&image)?;
            let engine = worker::spawn_engine(&config, store)?;
            let result = engine.identify(payload).await?;
            print_json(&result)?;
            if !result.accepted {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Attend { course, images } => {
            let engine = worker::spawn_engine(&config, store)?;
            let session = engine.begin_session(course).await?;
            tracing::info!(session = %session.id, images = images.len(), "taking attendance");

            let attended = attend_all(&engine, images).await?;
            print_json(&serde_json::json!({ "session": session, "attended": attended }))?;
            if attended.iter().any(|a| a.error.is_some()) {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Mark { course, rolls } => {
            let engine = worker::spawn_records_engine(&config, store)?;
            let session = engine.begin_session(course).await?;

            let marked = mark_all(&engine, rolls).await?;
            print_json(&serde_json::json!({ "session": session, "marked": marked }))?;
            if marked.iter().any(|m| m.error.is_some()) {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Undo => {
            let engine = worker::spawn_records_engine(&config, store)?;
            print_json(&engine.undo().await?)?;
        }
        Commands::List => {
            print_json(&store.list_identities()?)?;
        }
        Commands::Attendance { limit } => {
            print_json(&store.list_attendance(limit)?)?;
        }
        Commands::Remove { roll } => {
            let removed = store.remove_identity(&roll)?;
            print_json(&serde_json::json!({ "roll": roll, "removed": removed }))?;
            if !removed {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Status => {
            let detector = config.detector_model_path();
            let embedder = config.embedder_model_path();
            print_json(&serde_json::json!({
                "db_path": config.db_path,
                "similarity_threshold": config.similarity_threshold,
                "detector_model": { "path": detector, "present": detector.is_file() },
                "embedder_model": { "path": embedder, "present": embedder.is_file() },
                "enrolled": store.load_candidates()?.len(),
                "attendance_records": store.list_attendance(None)?.len(),
            }))?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Attend every image in the live session.
///
/// A frame that cannot be read or decoded is reported in its entry and
/// skipped. Store and engine failures end the run.
async fn attend_all(
    engine: &EngineHandle,
    images: Vec<PathBuf>,
) -> Result<Vec<Attended>, WorkerError> {
    let mut attended = Vec::with_capacity(images.len());
    for image in images {
        let outcome = match load_payload(&image) {
            Ok(payload) => engine.attend(payload).await,
            Err(e) => {
                tracing::warn!(image = %image.display(), error = %e, "skipping unreadable frame");
                attended.push(Attended {
                    image,
                    result: None,
                    mark: None,
                    error: Some(format!("{e:#}")),
                });
                continue;
            }
        };

        let entry = match outcome {
            Ok((result, mark)) => Attended {
                image,
                result: Some(result),
                mark: Some(mark),
                error: None,
            },
            Err(e) if e.is_per_request() => {
                tracing::warn!(image = %image.display(), error = %e, "skipping frame");
                Attended {
                    image,
                    result: None,
                    mark: None,
                    error: Some(e.to_string()),
                }
            }
            Err(e) => return Err(e),
        };
        attended.push(entry);
    }
    Ok(attended)
}

/// Mark every roll number in the live session; unknown rolls are reported.
async fn mark_all(engine: &EngineHandle, rolls: Vec<String>) -> Result<Vec<Marked>, WorkerError> {
    let mut marked = Vec::with_capacity(rolls.len());
    for roll in rolls {
        let entry = match engine.mark(roll.as_str()).await {
            Ok(mark) => Marked {
                roll,
                mark: Some(mark),
                error: None,
            },
            Err(e) if e.is_per_request() => Marked {
                roll,
                mark: None,
                error: Some(e.to_string()),
            },
            Err(e) => return Err(e),
        };
        marked.push(entry);
    }
    Ok(marked)
}

fn open_store(db_path: &Path) -> Result<SqliteStore> {
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating data directory {}", parent.display()))?;
    }
    SqliteStore::open(db_path).with_context(|| format!("opening database {}", db_path.display()))
}

/// Read an image argument. `.b64` and `.txt` files hold base64 text,
/// anything else is an encoded image.
fn load_payload(path: &Path) -> Result<ImagePayload> {
    let is_text = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("b64") || ext.eq_ignore_ascii_case("txt"));

    let payload = if is_text {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        ImagePayload::Base64(text)
    } else {
        let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        ImagePayload::Encoded(bytes)
    };
    Ok(payload)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
