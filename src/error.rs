use crate::pipeline::Stage;
use crate::Status;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;

/// An external program could not be run to a successful exit.
#[derive(Debug, Error)]
#[error("external tool {program} failed: {failure}")]
pub struct ToolError {
    pub program: String,
    pub failure: ToolFailure,
    /// Stdout and stderr interleaved in the order they were read, up to the
    /// failure. A timed out tool keeps what it printed before being killed.
    pub output: String,
}

#[derive(Debug, Error)]
pub enum ToolFailure {
    #[error("could not be started: {0}")]
    Spawn(std::io::Error),

    #[error("{0}")]
    Exit(ExitStatus),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("i/o error while running: {0}")]
    Io(std::io::Error),
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("attempt {attempt} failed: {source}")]
    Attempt {
        attempt: usize,
        #[source]
        source: Box<StageError>,
    },

    #[error("expected output {} is missing", .path.display())]
    MissingArtifact { path: PathBuf },

    #[error("expected output {} is empty", .path.display())]
    EmptyArtifact { path: PathBuf },

    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to build archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("tool environment: {0}")]
    Environment(String),
}

impl StageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StageError::Io {
            path: path.into(),
            source,
        }
    }
}

/// A stage aborted the pipeline for one job.
#[derive(Debug, Error)]
#[error("{stage} stage failed: {source}")]
pub struct PipelineError {
    pub stage: Stage,
    #[source]
    pub source: StageError,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("job {0} not found")]
    NotFound(i64),

    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition { id: i64, from: Status, to: Status },
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("invalid email address: {0}")]
    Address(#[from] lettre::address::AddressError),

    #[error("failed to build email: {0}")]
    Message(#[from] lettre::error::Error),

    #[error("smtp delivery failed: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),

    #[error("invalid notification settings: {0}")]
    Config(String),
}
