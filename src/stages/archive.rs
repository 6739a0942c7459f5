use super::eman2::final_average_path;
use super::{
    read_artifact, JobContext, AVERAGE_DIR, DENSITY_MAP_FILE, FINAL_AVERAGE_FILE, FSC_CHART_FILE,
    FSC_DATA_FILE,
};
use crate::error::StageError;
use crate::JobOutputs;
use std::io::{Cursor, Write};
use std::path::Path;
use tracing::{info, instrument};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Builds an in-memory deflate zip from `(name, bytes)` entries.
pub fn zip_entries<'a, I>(entries: I) -> Result<Vec<u8>, StageError>
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o600);

    for (name, body) in entries {
        zip.start_file(name, options)?;
        zip.write_all(body)
            .map_err(|err| StageError::io(Path::new(name), err))?;
    }

    Ok(zip.finish()?.into_inner())
}

/// Packs the deliverables into the job's raw output archive.
#[instrument(skip_all, fields(job_id = ctx.job_id))]
pub async fn run(ctx: &JobContext<'_>, outputs: &mut JobOutputs) -> Result<(), StageError> {
    info!("Creating zip archive");

    let density_map = read_artifact(&ctx.path(DENSITY_MAP_FILE)).await?;
    let final_average = read_artifact(&ctx.path(final_average_path())).await?;
    let fsc_chart = read_artifact(&ctx.path(FSC_CHART_FILE)).await?;
    let fsc_data = read_artifact(&ctx.path(Path::new(AVERAGE_DIR).join(FSC_DATA_FILE))).await?;

    let archive = zip_entries([
        ("density-map.ccp4", density_map.as_slice()),
        (FINAL_AVERAGE_FILE, final_average.as_slice()),
        ("fsc.png", fsc_chart.as_slice()),
        ("fsc_01.txt", fsc_data.as_slice()),
    ])?;

    info!(size = archive.len(), "Successfully created zip archive");
    outputs.raw_data = Some(archive);
    Ok(())
}
