//! One function per pipeline stage.
//!
//! Stages only talk to the outside world through [`JobContext::run_tool`]
//! and files inside the job's working directory. They validate their own
//! artifacts and never touch job status.

use crate::config::WorkerConfig;
use crate::error::{StageError, ToolError};
use crate::invoke::{Invoker, ToolEnv};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

pub mod archive;
pub mod charts;
pub mod eman2;
pub mod reconstruct;

pub const STACK_FILE: &str = "stack.hdf";
pub const STACK_RESIZED_FILE: &str = "stack_resized.hdf";
pub const AVERAGE_DIR: &str = "spt_01";
pub const FINAL_AVERAGE_FILE: &str = "final_avg_ali2ref.hdf";
pub const FSC_DATA_FILE: &str = "fsc_0.txt";
pub const DENSITY_MAP_FILE: &str = "output_averaged.ccp4";
pub const FSC_CHART_FILE: &str = "fsc.png";
pub const SUMMARY_CHART_FILE: &str = "summary.png";
pub const JOB_LOG_FILE: &str = "worker.log";

/// Per-job state shared read-only by every stage and attempt.
#[derive(Debug)]
pub struct JobContext<'a> {
    pub job_id: i64,
    pub config: &'a WorkerConfig,
    invoker: Invoker,
    log: JobLog,
}

impl<'a> JobContext<'a> {
    pub fn new(job_id: i64, config: &'a WorkerConfig, workspace: &Path, env: ToolEnv) -> Self {
        JobContext {
            job_id,
            config,
            invoker: Invoker::new(workspace, config.timeout(), env),
            log: JobLog::new(workspace.join(JOB_LOG_FILE)),
        }
    }

    pub fn workspace(&self) -> &Path {
        self.invoker.working_dir()
    }

    pub fn path(&self, name: impl AsRef<Path>) -> PathBuf {
        self.workspace().join(name)
    }

    pub async fn run_tool(&self, program: &Path, args: &[String]) -> Result<String, ToolError> {
        let result = self.invoker.run(program, args).await;
        self.log.record(program, args, &result).await;
        result
    }

    pub async fn run_tool_with_input(
        &self,
        program: &Path,
        args: &[String],
        input: &[u8],
    ) -> Result<String, ToolError> {
        let result = self.invoker.run_with_input(program, args, input).await;
        self.log.record(program, args, &result).await;
        result
    }
}

/// Append-only transcript of every tool run for one job, kept in its
/// working directory so it ends up in the post-mortem archive.
#[derive(Debug, Clone)]
pub struct JobLog {
    path: PathBuf,
}

impl JobLog {
    pub fn new(path: PathBuf) -> Self {
        JobLog { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn record(&self, program: &Path, args: &[String], result: &Result<String, ToolError>) {
        let (output, outcome) = match result {
            Ok(output) => (output.as_str(), "ok".to_string()),
            Err(err) => (err.output.as_str(), err.failure.to_string()),
        };
        let entry = format!(
            "=== {} {} {}\n{}\n--- {}\n",
            Utc::now().to_rfc3339(),
            program.display(),
            args.join(" "),
            output.trim_end(),
            outcome
        );

        let written = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(entry.as_bytes()).await?;
            file.flush().await
        }
        .await;

        if let Err(err) = written {
            warn!(path = %self.path.display(), error = %err, "Failed writing job log");
        }
    }
}

/// Fails unless `path` exists and is non-empty.
pub async fn require_artifact(path: &Path) -> Result<(), StageError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => {
            debug!(path = %path.display(), size = meta.len(), "Artifact present");
            Ok(())
        }
        Ok(meta) if meta.is_file() => Err(StageError::EmptyArtifact {
            path: path.to_path_buf(),
        }),
        Ok(_) => Err(StageError::MissingArtifact {
            path: path.to_path_buf(),
        }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            Err(StageError::MissingArtifact {
                path: path.to_path_buf(),
            })
        }
        Err(err) => Err(StageError::io(path, err)),
    }
}

/// Reads an artifact, treating absence or emptiness as failure.
pub async fn read_artifact(path: &Path) -> Result<Vec<u8>, StageError> {
    require_artifact(path).await?;
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|err| StageError::io(path, err))?;
    if bytes.is_empty() {
        return Err(StageError::EmptyArtifact {
            path: path.to_path_buf(),
        });
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn artifact_checks() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("map.ccp4");
        let empty = dir.path().join("empty.ccp4");
        std::fs::write(&present, b"density").unwrap();
        std::fs::write(&empty, b"").unwrap();

        assert_eq!(read_artifact(&present).await.unwrap(), b"density");
        assert!(matches!(
            require_artifact(&empty).await,
            Err(StageError::EmptyArtifact { .. })
        ));
        assert!(matches!(
            require_artifact(&dir.path().join("absent")).await,
            Err(StageError::MissingArtifact { .. })
        ));
        assert!(matches!(
            require_artifact(dir.path()).await,
            Err(StageError::MissingArtifact { .. })
        ));
    }

    #[tokio::test]
    async fn tool_runs_are_logged() {
        let dir = tempfile::tempdir().unwrap();
        let config = WorkerConfig {
            max_seconds: 10,
            ..Default::default()
        };
        let ctx = JobContext::new(7, &config, dir.path(), ToolEnv::default());

        ctx.run_tool(Path::new("sh"), &["-c".into(), "echo first".into()])
            .await
            .unwrap();
        ctx.run_tool(Path::new("sh"), &["-c".into(), "echo second; exit 1".into()])
            .await
            .unwrap_err();

        let log = std::fs::read_to_string(dir.path().join(JOB_LOG_FILE)).unwrap();
        assert!(log.contains("first"));
        assert!(log.contains("second"));
        assert!(log.contains("--- ok"));
        assert!(log.contains("exit status: 1"));
        assert_eq!(ctx.config.timeout(), Duration::from_secs(10));
    }
}
