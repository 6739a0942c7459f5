use crate::config::WorkerConfig;
use crate::db::JobStore;
use crate::error::{PipelineError, StageError};
use crate::invoke::ToolEnv;
use crate::stages::{self, JobContext};
use crate::{Job, JobOutputs, Progress};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// Linear per-job state machine. Each stage runs only after the previous
/// one succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Setup,
    Reconstruct,
    Assemble,
    Average,
    AnalyzeFsc,
    AnalyzeSummary,
    Archive,
    Done,
}

impl Stage {
    pub const SEQUENCE: [Stage; 8] = [
        Stage::Setup,
        Stage::Reconstruct,
        Stage::Assemble,
        Stage::Average,
        Stage::AnalyzeFsc,
        Stage::AnalyzeSummary,
        Stage::Archive,
        Stage::Done,
    ];

    pub fn task_name(&self) -> &'static str {
        match self {
            Stage::Setup => "Setup",
            Stage::Reconstruct => "Reconstruction",
            Stage::Assemble => "Volume assembly",
            Stage::Average => "Averaging",
            Stage::AnalyzeFsc => "FSC chart",
            Stage::AnalyzeSummary => "Summary chart",
            Stage::Archive => "Archive",
            Stage::Done => "Done",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Stage::Setup => "Preparing job workspace",
            Stage::Reconstruct => "Running DENSS reconstructions",
            Stage::Assemble => "Building volume stack with EMAN2",
            Stage::Average => "Aligning and averaging volumes with EMAN2",
            Stage::AnalyzeFsc => "Plotting Fourier shell correlation curve",
            Stage::AnalyzeSummary => "Plotting summary statistics",
            Stage::Archive => "Archiving raw results",
            Stage::Done => "Job completed",
        }
    }

    /// Percent complete reported when the stage begins.
    pub fn checkpoint(&self) -> i32 {
        match self {
            Stage::Setup => 0,
            Stage::Reconstruct => 25,
            Stage::Assemble => 50,
            Stage::Average => 75,
            Stage::AnalyzeFsc => 85,
            Stage::AnalyzeSummary => 90,
            Stage::Archive => 95,
            Stage::Done => 100,
        }
    }

    pub fn progress(&self) -> Progress {
        Progress {
            task: self.task_name().to_string(),
            message: self.message().to_string(),
            percent: self.checkpoint(),
        }
    }

    pub fn failed(&self, err: &StageError) -> Progress {
        Progress {
            task: self.task_name().to_string(),
            message: format!("{} failed: {}", self.task_name(), err),
            percent: self.checkpoint(),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.task_name())
    }
}

/// Drives one job through every stage.
#[derive(Debug, Clone)]
pub struct Pipeline {
    config: Arc<WorkerConfig>,
}

impl Pipeline {
    pub fn new(config: Arc<WorkerConfig>) -> Self {
        Pipeline { config }
    }

    /// Runs every stage in order inside `workspace`, which must already
    /// exist. Returns whatever outputs were produced alongside the result so
    /// a failed job keeps its partial artifacts.
    #[instrument(skip_all, fields(job_id = job.id))]
    pub async fn run(
        &self,
        job: &Job,
        store: &dyn JobStore,
        workspace: &Path,
    ) -> (Result<(), PipelineError>, JobOutputs) {
        let mut outputs = JobOutputs::default();
        let result = self.run_stages(job, store, workspace, &mut outputs).await;

        match &result {
            Ok(()) => {
                report(store, job.id, Stage::Done.progress()).await;
                info!(job_id = job.id, "Pipeline finished");
            }
            Err(err) => {
                report(store, job.id, err.stage.failed(&err.source)).await;
                error!(job_id = job.id, stage = %err.stage, error = %err.source, "Pipeline failed");
            }
        }

        (result, outputs)
    }

    async fn run_stages(
        &self,
        job: &Job,
        store: &dyn JobStore,
        workspace: &Path,
        outputs: &mut JobOutputs,
    ) -> Result<(), PipelineError> {
        let env = ToolEnv::prepare(&self.config).map_err(|source| PipelineError {
            stage: Stage::Setup,
            source,
        })?;
        let ctx = JobContext::new(job.id, &self.config, workspace, env);

        for stage in Stage::SEQUENCE {
            if stage == Stage::Done {
                break;
            }
            report(store, job.id, stage.progress()).await;
            run_stage(stage, &ctx, job, outputs)
                .await
                .map_err(|source| PipelineError { stage, source })?;
        }

        Ok(())
    }
}

async fn run_stage(
    stage: Stage,
    ctx: &JobContext<'_>,
    job: &Job,
    outputs: &mut JobOutputs,
) -> Result<(), StageError> {
    match stage {
        Stage::Setup => setup(ctx).await,
        Stage::Reconstruct => stages::reconstruct::run(ctx, job).await,
        Stage::Assemble => stages::eman2::assemble(ctx, job).await,
        Stage::Average => stages::eman2::average(ctx, outputs).await,
        Stage::AnalyzeFsc => stages::charts::fsc(ctx, outputs).await,
        Stage::AnalyzeSummary => stages::charts::summary(ctx, outputs).await,
        Stage::Archive => stages::archive::run(ctx, outputs).await,
        Stage::Done => Ok(()),
    }
}

async fn setup(ctx: &JobContext<'_>) -> Result<(), StageError> {
    let workspace = ctx.workspace();
    match tokio::fs::metadata(workspace).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(StageError::MissingArtifact {
            path: workspace.to_path_buf(),
        }),
        Err(err) => Err(StageError::io(workspace, err)),
    }
}

/// Progress writes are best effort; a failed one never stops the job.
async fn report(store: &dyn JobStore, job_id: i64, progress: Progress) {
    if let Err(err) = store.log_progress(job_id, &progress).await {
        warn!(job_id, task = %progress.task, error = %err, "Failed to log job progress");
    }
}
