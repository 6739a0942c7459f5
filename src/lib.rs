use chrono::{DateTime, Utc};
use std::fmt;

pub mod batch;
pub mod config;
pub mod db;
pub mod error;
pub mod invoke;
pub mod memory;
pub mod notify;
pub mod pipeline;
pub mod stages;
pub mod telemetry;
pub mod worker;
pub mod workspace;

/// A reconstruction request as handed to the job store by a submission boundary.
#[derive(Debug, Clone, Default)]
pub struct JobRequest {
    pub name: String,
    pub email: Option<String>,
    pub file_type: String,
    pub input_data: Vec<u8>,
    pub params: JobParams,
}

/// Tuning parameters for a job. Zero or empty means "unset": the external
/// tools apply their own defaults for anything not passed on the command line.
#[derive(Debug, Clone, Default, PartialEq, sqlx::FromRow)]
pub struct JobParams {
    pub dmax: f64,
    pub oversampling: f64,
    pub num_samples: i64,
    pub voxel_size: f64,
    pub electrons: i64,
    pub max_steps: i64,
    pub max_runs: i64,
    pub symmetry: i64,
    pub symmetry_axis: i64,
    pub symmetry_steps: String,
    pub mode: String,
    pub units: String,
    pub enantiomer: bool,
}

pub const MAX_RUNS_LIMIT: i64 = 20;

impl JobParams {
    /// Store-side defaults applied on submission.
    pub fn with_defaults(mut self) -> Self {
        if self.oversampling <= 0.0 {
            self.oversampling = 3.0;
        }
        if self.electrons <= 0 {
            self.electrons = 10000;
        }
        if self.max_steps <= 0 {
            self.max_steps = 3000;
        }
        if self.max_runs <= 0 || self.max_runs > MAX_RUNS_LIMIT {
            self.max_runs = MAX_RUNS_LIMIT;
        }
        self
    }

    /// Number of independent reconstruction attempts, never less than one.
    pub fn attempts(&self) -> usize {
        self.max_runs.max(1) as usize
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    pub id: i64,
    pub token: String,
    pub name: String,
    pub email: Option<String>,
    #[sqlx(rename = "status_id")]
    pub status: Status,
    pub task: String,
    pub log_message: String,
    pub percent_complete: i32,
    pub file_type: String,
    pub input_data: Vec<u8>,
    #[sqlx(flatten)]
    pub params: JobParams,
    pub submitted: Option<DateTime<Utc>>,
    pub started: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
}

impl Job {
    pub fn url(&self, base_url: &str) -> String {
        format!("{}/job/{}", base_url.trim_end_matches('/'), self.token)
    }

    /// Address to notify, if the submitter left a non-blank one.
    pub fn contact(&self) -> Option<&str> {
        self.email
            .as_deref()
            .map(str::trim)
            .filter(|email| !email.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type)]
#[repr(i32)]
pub enum Status {
    Pending = 1,
    Running = 2,
    Complete = 3,
    Error = 4,
}

impl Status {
    pub fn label(&self) -> &'static str {
        match self {
            Status::Pending => "Pending",
            Status::Running => "Running",
            Status::Complete => "Complete",
            Status::Error => "Error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Complete | Status::Error)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One progress update as shown to whoever watches the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub task: String,
    pub message: String,
    pub percent: i32,
}

/// Artifacts accumulated stage by stage while a job runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOutputs {
    pub density_map: Option<Vec<u8>>,
    pub fsc_chart: Option<Vec<u8>>,
    pub summary_chart: Option<Vec<u8>>,
    pub raw_data: Option<Vec<u8>>,
}

impl JobOutputs {
    pub fn is_complete(&self) -> bool {
        [
            &self.density_map,
            &self.fsc_chart,
            &self.summary_chart,
            &self.raw_data,
        ]
        .iter()
        .all(|field| field.as_ref().is_some_and(|bytes| !bytes.is_empty()))
    }

    pub fn is_empty(&self) -> bool {
        self.density_map.is_none()
            && self.fsc_chart.is_none()
            && self.summary_chart.is_none()
            && self.raw_data.is_none()
    }
}
