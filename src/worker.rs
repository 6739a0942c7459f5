use crate::config::WorkerConfig;
use crate::db::JobStore;
use crate::notify::{Notification, Notifier, STATUS_COMPLETED, STATUS_FAILED};
use crate::pipeline::Pipeline;
use crate::workspace;
use crate::{Job, JobOutputs, Status};
use std::path::Path;
use std::sync::Arc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::*;

/// Polls the job store and runs claimed jobs one at a time.
pub struct Worker {
    config: Arc<WorkerConfig>,
    store: Arc<dyn JobStore>,
    notifier: Arc<dyn Notifier>,
    pipeline: Pipeline,
}

impl Worker {
    pub fn new(
        config: Arc<WorkerConfig>,
        store: Arc<dyn JobStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Worker {
            pipeline: Pipeline::new(config.clone()),
            config,
            store,
            notifier,
        }
    }

    /// Runs until `cancel_token` fires. A job already in flight is finished
    /// before the loop notices cancellation.
    pub async fn run(&self, cancel_token: CancellationToken) {
        info!(
            work_dir = %self.config.work_dir.display(),
            threads = self.config.concurrency(),
            "Worker started"
        );
        self.report_orphans().await;

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("Worker Cancelled");
                    break;
                },
                _ = sleep(self.config.poll_interval()) => {
                    self.poll_once().await;
                }
            }
        }
        info!("Worker stopped.");
    }

    /// Claims and processes at most one job. Returns the job id and the
    /// terminal status it was given.
    pub async fn poll_once(&self) -> Option<(i64, Status)> {
        let job = match self.store.fetch_next_pending().await {
            Ok(Some(job)) => job,
            Ok(None) => return None,
            Err(err) => {
                error!(message = "Failed to claim next job", error = %err);
                return None;
            }
        };

        let job_id = job.id;
        let span = info_span!("job", job_id, token = %job.token);
        let status = self.process(job).instrument(span).await;
        Some((job_id, status))
    }

    async fn process(&self, job: Job) -> Status {
        info!(name = %job.name, attempts = job.params.attempts(), "Starting job");

        let dir = match workspace::create(&self.config.work_dir, job.id).await {
            Ok(dir) => dir,
            Err(err) => {
                error!(message = "Failed to create working directory", error = %err);
                self.finalize(&job, Status::Error, &JobOutputs::default()).await;
                self.notify(&job, STATUS_FAILED).await;
                return Status::Error;
            }
        };

        let (result, outputs) = self.pipeline.run(&job, self.store.as_ref(), &dir).await;
        let status = match result {
            Ok(()) => {
                self.notify(&job, STATUS_COMPLETED).await;
                self.finalize(&job, Status::Complete, &outputs).await;
                Status::Complete
            }
            Err(err) => {
                warn!(stage = %err.stage, error = %err, "Job failed");
                self.archive_failed(&dir, job.id).await;
                self.finalize(&job, Status::Error, &outputs).await;
                self.notify(&job, STATUS_FAILED).await;
                Status::Error
            }
        };

        workspace::remove(&dir).await;
        info!(status = %status, "Job finished");
        status
    }

    async fn finalize(&self, job: &Job, status: Status, outputs: &JobOutputs) {
        if let Err(err) = self.store.complete_job(job.id, status, outputs).await {
            error!(message = "Failed to record job result", status = %status, error = %err);
        }
    }

    async fn notify(&self, job: &Job, status: &str) {
        let Some(address) = job.contact() else {
            debug!("No email on job, skipping notification");
            return;
        };

        let notification = Notification {
            address: address.to_string(),
            status: status.to_string(),
            job_url: job.url(&self.config.base_url),
            job_id: job.id,
        };
        if let Err(err) = self.notifier.notify(&notification).await {
            warn!(message = "Failed to send notification", error = %err);
        }
    }

    async fn archive_failed(&self, dir: &Path, job_id: i64) {
        let Some(failed_dir) = &self.config.failed_dir else {
            return;
        };
        match workspace::archive_failed(dir, failed_dir, job_id).await {
            Ok(path) => info!(archive = %path.display(), "Archived failed job"),
            Err(err) => warn!(message = "Failed to archive working directory", error = %err),
        }
    }

    async fn report_orphans(&self) {
        match workspace::scan_orphans(&self.config.work_dir).await {
            Ok(ids) if ids.is_empty() => {}
            Ok(ids) => warn!(
                job_ids = ?ids,
                "Found working directories left by an earlier run"
            ),
            Err(err) => debug!(error = %err, "Could not scan work directory for leftovers"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryJobStore;
    use crate::notify::LogNotifier;
    use crate::JobRequest;
    use std::time::Duration;

    fn worker_with(store: Arc<MemoryJobStore>, work_dir: &Path) -> Worker {
        let config = WorkerConfig {
            work_dir: work_dir.to_path_buf(),
            poll_interval_secs: 0,
            ..Default::default()
        };
        Worker::new(Arc::new(config), store, Arc::new(LogNotifier))
    }

    #[tokio::test]
    async fn empty_queue_is_a_quiet_poll() {
        let root = tempfile::tempdir().unwrap();
        let worker = worker_with(Arc::new(MemoryJobStore::new()), root.path());
        assert_eq!(worker.poll_once().await, None);
    }

    #[tokio::test]
    async fn unusable_work_dir_fails_the_job() {
        let root = tempfile::tempdir().unwrap();
        let not_a_dir = root.path().join("file");
        std::fs::write(&not_a_dir, b"").unwrap();

        let store = Arc::new(MemoryJobStore::new());
        let id = store.insert(&JobRequest {
            name: "blocked".into(),
            file_type: "dat".into(),
            input_data: b"data".to_vec(),
            ..Default::default()
        });

        let worker = worker_with(store.clone(), &not_a_dir);
        assert_eq!(worker.poll_once().await, Some((id, Status::Error)));
        assert_eq!(store.status(id), Some(Status::Error));
    }

    #[tokio::test]
    async fn cancelled_worker_stops() {
        let root = tempfile::tempdir().unwrap();
        let worker = worker_with(Arc::new(MemoryJobStore::new()), root.path());
        let cancel = CancellationToken::new();
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(5), worker.run(cancel))
            .await
            .unwrap();
    }
}
