use super::reconstruct::attempt_map_file;
use super::{
    read_artifact, require_artifact, JobContext, AVERAGE_DIR, DENSITY_MAP_FILE,
    FINAL_AVERAGE_FILE, STACK_FILE, STACK_RESIZED_FILE,
};
use crate::error::StageError;
use crate::{Job, JobOutputs};
use std::path::Path;
use tracing::{info, instrument};

pub fn stack_args(attempts: usize) -> Vec<String> {
    let mut args = vec!["--stackname".to_string(), STACK_FILE.to_string()];
    args.extend((0..attempts).map(attempt_map_file));
    args
}

pub fn resize_args(num_samples: i64) -> Vec<String> {
    let mut args = vec![STACK_FILE.to_string(), STACK_RESIZED_FILE.to_string()];
    if num_samples > 0 {
        args.push(format!("--clip={0},{0},{0}", num_samples));
    }
    args
}

pub fn average_args(threads: usize) -> Vec<String> {
    vec![
        "--input".to_string(),
        STACK_RESIZED_FILE.to_string(),
        format!("--parallel=thread:{}", threads),
        "--saveali".to_string(),
        "--savesteps".to_string(),
        "--keep".to_string(),
        "3.0".to_string(),
        "--keepsig".to_string(),
    ]
}

pub fn final_average_path() -> String {
    format!("{}/{}", AVERAGE_DIR, FINAL_AVERAGE_FILE)
}

/// Stacks the per-attempt maps into one file and normalizes its grid.
#[instrument(skip_all, fields(job_id = ctx.job_id))]
pub async fn assemble(ctx: &JobContext<'_>, job: &Job) -> Result<(), StageError> {
    let attempts = job.params.attempts();
    let stacks = ctx.config.eman2_tool(&ctx.config.tools.e2buildstacks);
    let proc3d = ctx.config.eman2_tool(&ctx.config.tools.e2proc3d);

    info!(attempts, "Building stack hdf using EMAN2");
    ctx.run_tool(&stacks, &stack_args(attempts)).await?;
    require_artifact(&ctx.path(STACK_FILE)).await?;

    info!(num_samples = job.params.num_samples, "Resizing stack");
    ctx.run_tool(&proc3d, &resize_args(job.params.num_samples))
        .await?;
    require_artifact(&ctx.path(STACK_RESIZED_FILE)).await?;

    info!("Stack hdf built successfully");
    Ok(())
}

/// Aligns and averages the stack, then converts the average to CCP4 and
/// stores it as the job's density map.
#[instrument(skip_all, fields(job_id = ctx.job_id))]
pub async fn average(ctx: &JobContext<'_>, outputs: &mut JobOutputs) -> Result<(), StageError> {
    let classaverage = ctx.config.eman2_tool(&ctx.config.tools.e2spt_classaverage);
    let proc3d = ctx.config.eman2_tool(&ctx.config.tools.e2proc3d);
    let threads = ctx.config.concurrency();

    // e2spt_classaverage numbers its output directory after the ones already
    // present, so a previous run would push the result into spt_02.
    remove_dir_if_present(&ctx.path(AVERAGE_DIR)).await?;

    info!(threads, "Running averaging using EMAN2");
    ctx.run_tool(&classaverage, &average_args(threads)).await?;

    let final_average = final_average_path();
    require_artifact(&ctx.path(&final_average)).await?;
    info!("Averaging completed successfully");

    info!("Converting electron density map to CCP4");
    ctx.run_tool(&proc3d, &[final_average, DENSITY_MAP_FILE.to_string()])
        .await?;
    outputs.density_map = Some(read_artifact(&ctx.path(DENSITY_MAP_FILE)).await?);

    info!("Successfully converted electron density map to CCP4");
    Ok(())
}

async fn remove_dir_if_present(path: &Path) -> Result<(), StageError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(StageError::io(path, err)),
    }
}
