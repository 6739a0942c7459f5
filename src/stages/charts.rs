use super::{read_artifact, JobContext, AVERAGE_DIR, FSC_CHART_FILE, FSC_DATA_FILE, SUMMARY_CHART_FILE};
use crate::error::StageError;
use crate::JobOutputs;
use std::path::Path;
use tracing::{info, instrument};

fn chart_args(input: &Path, output: &Path) -> Vec<String> {
    vec![
        "--input".to_string(),
        input.display().to_string(),
        "--output".to_string(),
        output.display().to_string(),
    ]
}

/// Plots the Fourier shell correlation curve of the averaged map.
#[instrument(skip_all, fields(job_id = ctx.job_id))]
pub async fn fsc(ctx: &JobContext<'_>, outputs: &mut JobOutputs) -> Result<(), StageError> {
    let data = ctx.path(Path::new(AVERAGE_DIR).join(FSC_DATA_FILE));
    let png = ctx.path(FSC_CHART_FILE);

    info!(data = %data.display(), "Plotting fsc curve");
    ctx.run_tool(&ctx.config.tools.fsc_chart, &chart_args(&data, &png))
        .await?;
    outputs.fsc_chart = Some(read_artifact(&png).await?);

    info!(png = %png.display(), "Successfully created FSC curve");
    Ok(())
}

/// Plots summary statistics over everything in the working directory.
#[instrument(skip_all, fields(job_id = ctx.job_id))]
pub async fn summary(ctx: &JobContext<'_>, outputs: &mut JobOutputs) -> Result<(), StageError> {
    let png = ctx.path(SUMMARY_CHART_FILE);

    info!("Plotting summary chart");
    ctx.run_tool(
        &ctx.config.tools.summary_chart,
        &chart_args(ctx.workspace(), &png),
    )
    .await?;
    outputs.summary_chart = Some(read_artifact(&png).await?);

    info!(png = %png.display(), "Successfully created Summary chart");
    Ok(())
}
