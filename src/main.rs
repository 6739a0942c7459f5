use anyhow::{bail, Context, Error};
use clap::{Args, Parser, Subcommand};

use denss_worker::config::WorkerConfig;
use denss_worker::db::{DbHandle, JobStore};
use denss_worker::worker::Worker;
use denss_worker::{notify, telemetry, JobParams, JobRequest};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

#[derive(Parser, Clone, Debug, PartialEq)]
#[command(author, version, about = "DENSSWeb job worker")]
pub struct Cli {
    #[arg(short = 'c', long = "config", help = "Path to the YAML configuration file")]
    config: Option<PathBuf>,

    #[arg(short = 'd', long = "debug", help = "Enable debug logging")]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Clone, Debug, PartialEq)]
enum Command {
    /// Poll the job store and process jobs until interrupted
    Run(RunArgs),
    /// Queue a new job
    Submit(SubmitArgs),
}

#[derive(Args, Clone, Debug, PartialEq)]
struct RunArgs {
    #[arg(long = "connect-url", help = "PostgreSQL Connection URL")]
    connect_url: Option<String>,

    #[arg(short = 't', long = "threads", help = "Number of reconstructions run in parallel")]
    threads: Option<usize>,

    #[arg(long = "work-dir", help = "Directory for per-job working directories")]
    work_dir: Option<PathBuf>,
}

#[derive(Args, Clone, Debug, PartialEq)]
struct SubmitArgs {
    #[arg(long = "connect-url", help = "PostgreSQL Connection URL")]
    connect_url: Option<String>,

    #[arg(long, help = "Job name")]
    name: String,

    #[arg(long, help = "Scattering profile to reconstruct from")]
    input: PathBuf,

    #[arg(long, help = "Address notified when the job finishes")]
    email: Option<String>,

    #[arg(long, default_value_t = 0.0)]
    dmax: f64,

    #[arg(long = "max-runs", default_value_t = 0)]
    max_runs: i64,

    #[arg(long, default_value_t = 0.0)]
    oversampling: f64,

    #[arg(long, default_value_t = 0.0)]
    voxel: f64,

    #[arg(long, default_value_t = 0)]
    electrons: i64,

    #[arg(long, default_value = "")]
    mode: String,
}

impl SubmitArgs {
    fn request(&self) -> Result<JobRequest, Error> {
        let file_type = match self.input.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if !ext.is_empty() => ext.to_lowercase(),
            _ => bail!("Cannot tell file type of {}", self.input.display()),
        };
        let input_data = std::fs::read(&self.input)
            .with_context(|| format!("Failed reading {}", self.input.display()))?;

        Ok(JobRequest {
            name: self.name.clone(),
            email: self.email.clone(),
            file_type,
            input_data,
            params: JobParams {
                dmax: self.dmax,
                oversampling: self.oversampling,
                voxel_size: self.voxel,
                electrons: self.electrons,
                max_runs: self.max_runs,
                mode: self.mode.clone(),
                ..Default::default()
            },
        })
    }
}

#[instrument(skip_all)]
async fn run(mut config: WorkerConfig, args: RunArgs, cancel_token: CancellationToken) -> Result<(), Error> {
    if let Some(connect_url) = args.connect_url {
        config.connect_url = connect_url;
    }
    if let Some(threads) = args.threads {
        config.threads = threads;
    }
    if let Some(work_dir) = args.work_dir {
        config.work_dir = work_dir;
    }

    let store = DbHandle::new(&config.connect_url)
        .await
        .context("Failed connecting to job store")?;
    let notifier = notify::from_config(&config.notifications)?;

    let worker = Worker::new(Arc::new(config), Arc::new(store), notifier);
    worker.run(cancel_token).await;
    Ok(())
}

#[instrument(skip_all, fields(name = %args.name))]
async fn submit(config: WorkerConfig, args: SubmitArgs) -> Result<(), Error> {
    let request = args.request()?;
    let connect_url = args.connect_url.unwrap_or(config.connect_url);
    let store = DbHandle::new(&connect_url)
        .await
        .context("Failed connecting to job store")?;

    let id = store.submit(&request).await?;
    info!(job_id = id, "Job queued");
    println!("{}", id);
    Ok(())
}

fn watch_signals(token: CancellationToken) -> Result<(), Error> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => debug!("Received SIGTERM"),
            _ = sigint.recv() => debug!("Received SIGINT"),
        }
        info!("Shutting down after the current job");
        token.cancel();
    });
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let cli = Cli::parse();
    let config = WorkerConfig::load(cli.config.as_deref())?;

    telemetry::init(cli.debug, config.jaeger_endpoint.as_deref())?;

    let token = CancellationToken::new();
    watch_signals(token.clone())?;

    let result = match cli.command {
        Command::Run(args) => run(config, args, token).await,
        Command::Submit(args) => submit(config, args).await,
    };
    if let Err(err) = &result {
        error!(error = ?err, "Exiting with error");
    }

    telemetry::shutdown();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_overrides() {
        let cli = Cli::parse_from([
            "denss-worker",
            "--debug",
            "run",
            "--connect-url",
            "postgres://db/denss",
            "-t",
            "4",
        ]);
        assert!(cli.debug);
        assert_eq!(
            cli.command,
            Command::Run(RunArgs {
                connect_url: Some("postgres://db/denss".into()),
                threads: Some(4),
                work_dir: None,
            })
        );
    }

    #[test]
    fn submit_reads_input_and_file_type() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("lysozyme.DAT");
        std::fs::write(&input, b"0.01 100.0 1.0\n").unwrap();

        let cli = Cli::parse_from([
            "denss-worker",
            "submit",
            "--name",
            "lysozyme",
            "--input",
            input.to_str().unwrap(),
            "--max-runs",
            "4",
            "--dmax",
            "50",
        ]);
        let Command::Submit(args) = cli.command else {
            panic!("expected submit");
        };
        let request = args.request().unwrap();

        assert_eq!(request.file_type, "dat");
        assert_eq!(request.input_data, b"0.01 100.0 1.0\n");
        assert_eq!(request.params.max_runs, 4);
        assert_eq!(request.params.dmax, 50.0);
        assert_eq!(request.email, None);
    }
}
