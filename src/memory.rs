use crate::db::{new_token, JobStore};
use crate::error::StoreError;
use crate::{Job, JobOutputs, JobRequest, Progress, Status};
use chrono::Utc;
use futures::future::{self, BoxFuture, FutureExt};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Everything the store knows about one job.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job: Job,
    pub outputs: JobOutputs,
    /// Every progress update in the order it was logged.
    pub history: Vec<Progress>,
}

/// In-process job store. Claims are serialized by a mutex, which gives the
/// same atomicity the database store gets from row locking.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    records: Mutex<BTreeMap<i64, JobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<i64, JobRecord>> {
        // A panic while holding the lock leaves the map itself consistent.
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self, id: i64) -> Option<JobRecord> {
        self.lock().get(&id).cloned()
    }

    pub fn status(&self, id: i64) -> Option<Status> {
        self.lock().get(&id).map(|record| record.job.status)
    }

    pub fn insert(&self, request: &JobRequest) -> i64 {
        let mut records = self.lock();
        let id = records.keys().next_back().map_or(1, |last| last + 1);
        let job = Job {
            id,
            token: new_token(),
            name: request.name.clone(),
            email: request.email.clone(),
            status: Status::Pending,
            task: "Not started".to_string(),
            log_message: String::new(),
            percent_complete: 0,
            file_type: request.file_type.clone(),
            input_data: request.input_data.clone(),
            params: request.params.clone().with_defaults(),
            submitted: Some(Utc::now()),
            started: None,
            completed: None,
        };
        records.insert(
            id,
            JobRecord {
                job,
                outputs: JobOutputs::default(),
                history: Vec::new(),
            },
        );
        debug!(job_id = id, "Queued job");
        id
    }

    pub fn claim(&self) -> Option<Job> {
        let mut records = self.lock();
        let record = records
            .values_mut()
            .filter(|record| record.job.status == Status::Pending)
            .min_by_key(|record| (record.job.submitted, record.job.id))?;

        record.job.status = Status::Running;
        record.job.started = Some(Utc::now());
        Some(record.job.clone())
    }

    pub fn log(&self, id: i64, progress: &Progress) -> Result<(), StoreError> {
        let mut records = self.lock();
        let record = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        record.job.task = progress.task.clone();
        record.job.log_message = progress.message.clone();
        record.job.percent_complete = progress.percent;
        record.history.push(progress.clone());
        Ok(())
    }

    pub fn complete(&self, id: i64, status: Status, outputs: &JobOutputs) -> Result<(), StoreError> {
        let mut records = self.lock();
        let record = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if record.job.status != Status::Running || !status.is_terminal() {
            return Err(StoreError::InvalidTransition {
                id,
                from: record.job.status,
                to: status,
            });
        }

        record.job.status = status;
        record.job.completed = Some(Utc::now());
        record.outputs = outputs.clone();
        Ok(())
    }
}

impl JobStore for MemoryJobStore {
    fn fetch_next_pending(&self) -> BoxFuture<'_, Result<Option<Job>, StoreError>> {
        future::ready(Ok(self.claim())).boxed()
    }

    fn log_progress<'a>(
        &'a self,
        job_id: i64,
        progress: &'a Progress,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        future::ready(self.log(job_id, progress)).boxed()
    }

    fn complete_job<'a>(
        &'a self,
        job_id: i64,
        status: Status,
        outputs: &'a JobOutputs,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        future::ready(self.complete(job_id, status, outputs)).boxed()
    }

    fn submit<'a>(&'a self, request: &'a JobRequest) -> BoxFuture<'a, Result<i64, StoreError>> {
        future::ready(Ok(self.insert(request))).boxed()
    }
}
