use super::{require_artifact, JobContext};
use crate::batch::run_batched;
use crate::error::StageError;
use crate::Job;
use tracing::{info, instrument};

/// Answer to map2map's input format prompt: xplor.
const MAP2MAP_XPLOR: &[u8] = b"2\n";

pub fn input_file_name(job: &Job) -> String {
    format!("input.{}", job.file_type)
}

pub fn output_prefix(attempt: usize) -> String {
    format!("output_{}", attempt)
}

pub fn attempt_map_file(attempt: usize) -> String {
    format!("{}.mrc", output_prefix(attempt))
}

/// Command line for one denss run. Parameters left at zero or empty are
/// omitted so denss falls back to its own defaults.
pub fn denss_args(job: &Job, attempt: usize) -> Vec<String> {
    let params = &job.params;
    let mut args = vec![
        "-f".to_string(),
        input_file_name(job),
        "-o".to_string(),
        output_prefix(attempt),
        "--plot_off".to_string(),
        "--quiet".to_string(),
    ];

    if params.oversampling > 0.0 {
        args.push("--oversampling".into());
        args.push(format!("{:.4}", params.oversampling));
    }
    if params.dmax > 0.0 {
        args.push("-d".into());
        args.push(format!("{:.4}", params.dmax));
    }
    if params.voxel_size > 0.0 {
        args.push("--voxel".into());
        args.push(format!("{:.4}", params.voxel_size));
    }
    if params.electrons > 0 {
        args.push("--ne".into());
        args.push(params.electrons.to_string());
    }
    if params.num_samples > 0 {
        args.push("-n".into());
        args.push(params.num_samples.to_string());
    }
    if params.max_steps > 0 {
        args.push("--steps".into());
        args.push(params.max_steps.to_string());
    }
    if !params.mode.is_empty() {
        args.push("--mode".into());
        args.push(params.mode.to_uppercase());
    }
    if !params.units.is_empty() {
        args.push("--units".into());
        args.push(params.units.clone());
    }
    if params.symmetry > 0 {
        args.push("-ncs".into());
        args.push(params.symmetry.to_string());
        if params.symmetry_axis > 0 {
            args.push("-ncs_axis".into());
            args.push(params.symmetry_axis.to_string());
        }
        if !params.symmetry_steps.is_empty() {
            args.push("-ncs_steps".into());
            args.push(params.symmetry_steps.clone());
        }
    }

    args
}

/// Writes the input data and runs every reconstruction attempt, at most
/// `threads` at a time.
#[instrument(skip_all, fields(job_id = ctx.job_id, attempts = job.params.attempts()))]
pub async fn run(ctx: &JobContext<'_>, job: &Job) -> Result<(), StageError> {
    let input = ctx.path(input_file_name(job));
    tokio::fs::write(&input, &job.input_data)
        .await
        .map_err(|err| StageError::io(&input, err))?;

    let attempts = job.params.attempts();
    let limit = ctx.config.concurrency();
    info!(attempts, limit, "Spawning denss runs");

    run_batched(attempts, limit, move |attempt| run_attempt(ctx, job, attempt))
        .await
        .map_err(|failure| StageError::Attempt {
            attempt: failure.attempt,
            source: Box::new(failure.error),
        })?;

    info!(attempts, "denss runs completed successfully");
    Ok(())
}

async fn run_attempt(ctx: &JobContext<'_>, job: &Job, attempt: usize) -> Result<(), StageError> {
    info!(job_id = ctx.job_id, attempt, "Running denss");
    ctx.run_tool(&ctx.config.tools.denss, &denss_args(job, attempt))
        .await?;

    if let Some(map2map) = &ctx.config.tools.map2map {
        let xplor = format!("{}.xplor", output_prefix(attempt));
        require_artifact(&ctx.path(&xplor)).await?;
        ctx.run_tool_with_input(map2map, &[xplor, attempt_map_file(attempt)], MAP2MAP_XPLOR)
            .await?;
    }

    require_artifact(&ctx.path(attempt_map_file(attempt))).await?;
    info!(job_id = ctx.job_id, attempt, "denss completed successfully");
    Ok(())
}
