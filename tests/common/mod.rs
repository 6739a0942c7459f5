#![allow(dead_code)]

use denss_worker::config::{ToolPaths, WorkerConfig};
use denss_worker::error::NotifyError;
use denss_worker::notify::{Notification, Notifier};
use denss_worker::{JobParams, JobRequest};
use futures::future::{self, BoxFuture, FutureExt};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// How the fake toolchain should misbehave.
#[derive(Debug, Clone, Default)]
pub struct StubOptions {
    /// denss exits non-zero for this output prefix, e.g. `output_2`.
    pub fail_output: Option<String>,
    /// e2spt_classaverage exits zero without writing its averages.
    pub skip_average: bool,
}

/// Shell scripts standing in for the external tools. Each one appends a
/// line to `calls.log`, outside any job workspace, and writes the files
/// the real program would.
pub struct StubTools {
    pub bin: PathBuf,
    pub calls: PathBuf,
}

impl StubTools {
    pub fn install(root: &Path, options: &StubOptions) -> Self {
        let bin = root.join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let calls = root.join("calls.log");
        let log = calls.display().to_string();

        let fail = match &options.fail_output {
            Some(prefix) => format!(
                "if [ \"$out\" = \"{}\" ]; then echo \"denss blew up\" >&2; exit 3; fi\n",
                prefix
            ),
            None => String::new(),
        };
        write_script(
            &bin.join("denss.py"),
            &format!(
                "out=\"\"\n\
                 while [ $# -gt 0 ]; do\n\
                 \x20 if [ \"$1\" = \"-o\" ]; then out=\"$2\"; fi\n\
                 \x20 shift\n\
                 done\n\
                 echo \"denss $out\" >> \"{log}\"\n\
                 sleep 0.1\n\
                 {fail}\
                 echo \"map $out\" > \"$out.mrc\"\n"
            ),
        );

        write_script(
            &bin.join("e2buildstacks.py"),
            &format!(
                "echo \"e2buildstacks $*\" >> \"{log}\"\n\
                 echo stack > stack.hdf\n"
            ),
        );

        write_script(
            &bin.join("e2proc3d.py"),
            &format!(
                "echo \"e2proc3d $1 $2\" >> \"{log}\"\n\
                 echo \"converted $1\" > \"$2\"\n"
            ),
        );

        let average = if options.skip_average {
            String::new()
        } else {
            // Mimics EMAN2 picking the next free spt_NN directory.
            "if [ -d spt_01 ]; then d=spt_02; else d=spt_01; fi\n\
             mkdir -p \"$d\"\n\
             echo average > \"$d/final_avg_ali2ref.hdf\"\n\
             echo \"0.1 0.9\" > \"$d/fsc_0.txt\"\n"
                .to_string()
        };
        write_script(
            &bin.join("e2spt_classaverage.py"),
            &format!("echo \"e2spt_classaverage $*\" >> \"{log}\"\n{average}"),
        );

        let chart = format!(
            "out=\"\"\n\
             while [ $# -gt 0 ]; do\n\
             \x20 if [ \"$1\" = \"--output\" ]; then out=\"$2\"; fi\n\
             \x20 shift\n\
             done\n\
             echo \"chart $out\" >> \"{log}\"\n\
             echo png > \"$out\"\n"
        );
        write_script(&bin.join("fsc-chart.py"), &chart);
        write_script(&bin.join("summary-chart.py"), &chart);

        StubTools { bin, calls }
    }

    pub fn tools(&self) -> ToolPaths {
        ToolPaths {
            denss: self.bin.join("denss.py"),
            map2map: None,
            e2buildstacks: self.bin.join("e2buildstacks.py"),
            e2proc3d: self.bin.join("e2proc3d.py"),
            e2spt_classaverage: self.bin.join("e2spt_classaverage.py"),
            fsc_chart: self.bin.join("fsc-chart.py"),
            summary_chart: self.bin.join("summary-chart.py"),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(&self.calls)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|line| line.starts_with(prefix))
            .count()
    }
}

fn write_script(path: &Path, body: &str) {
    std::fs::write(path, format!("#!/bin/sh\n{}", body)).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

pub fn test_config(root: &Path, stubs: &StubTools) -> WorkerConfig {
    let work_dir = root.join("work");
    std::fs::create_dir_all(&work_dir).unwrap();

    WorkerConfig {
        work_dir,
        threads: 2,
        max_seconds: 30,
        poll_interval_secs: 0,
        base_url: "https://denss.example".into(),
        tools: stubs.tools(),
        ..Default::default()
    }
}

pub fn sample_request(max_runs: i64) -> JobRequest {
    JobRequest {
        name: "lysozyme".into(),
        email: Some("someone@example.org".into()),
        file_type: "dat".into(),
        input_data: b"0.01 100.0 1.0\n0.02 90.0 1.0\n".to_vec(),
        params: JobParams {
            dmax: 50.0,
            max_runs,
            ..Default::default()
        },
    }
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, Result<(), NotifyError>> {
        self.sent.lock().unwrap().push(notification.clone());
        future::ready(Ok(())).boxed()
    }
}
