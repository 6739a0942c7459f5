use crate::error::StoreError;
use crate::{Job, JobOutputs, JobRequest, Progress, Status};
use futures::future::{BoxFuture, FutureExt};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Executor;
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

/// The persistent record of jobs the worker consumes.
///
/// Claiming must be atomic: two callers racing on `fetch_next_pending`
/// never receive the same job.
pub trait JobStore: Send + Sync {
    /// Flips the oldest Pending job to Running, stamping `started`.
    /// `Ok(None)` when the queue is empty.
    fn fetch_next_pending(&self) -> BoxFuture<'_, Result<Option<Job>, StoreError>>;

    fn log_progress<'a>(
        &'a self,
        job_id: i64,
        progress: &'a Progress,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Records a terminal status and the outputs, stamping `completed`.
    /// Only a Running job can be completed.
    fn complete_job<'a>(
        &'a self,
        job_id: i64,
        status: Status,
        outputs: &'a JobOutputs,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Queues a new Pending job with store-side defaults applied.
    fn submit<'a>(&'a self, request: &'a JobRequest) -> BoxFuture<'a, Result<i64, StoreError>>;
}

pub(crate) fn new_token() -> String {
    Uuid::new_v4().simple().to_string()
}

const JOB_COLUMNS: &str = "id, token, name, email, status_id, task, log_message, \
    percent_complete, file_type, input_data, dmax, oversampling, num_samples, voxel_size, \
    electrons, max_steps, max_runs, symmetry, symmetry_axis, symmetry_steps, mode, units, \
    enantiomer, submitted, started, completed";

#[derive(Clone)]
pub struct DbHandle {
    pool: Arc<PgPool>,
}

impl DbHandle {
    #[instrument(name = "db.new", skip_all)]
    pub async fn new(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;

        (&pool).execute(include_str!("setup.sql")).await?;

        Ok(DbHandle {
            pool: Arc::new(pool),
        })
    }

    #[instrument(name = "db.claim_next_pending", skip_all)]
    pub(crate) async fn claim_next_pending(&self) -> Result<Option<Job>, StoreError> {
        debug!("Claiming next pending job");
        let query = format!(
            "UPDATE job \
                SET status_id = $1, started = now() \
            WHERE id = ( \
                SELECT id FROM job \
                WHERE status_id = $2 \
                ORDER BY submitted ASC, id ASC \
                LIMIT 1 \
                FOR UPDATE SKIP LOCKED) \
            RETURNING {}",
            JOB_COLUMNS
        );

        Ok(sqlx::query_as::<_, Job>(&query)
            .bind(Status::Running)
            .bind(Status::Pending)
            .fetch_optional(&*self.pool)
            .await?)
    }

    #[instrument(name = "db.log_job_message", skip_all, fields(job_id = %id))]
    pub(crate) async fn log_job_message(&self, id: i64, progress: &Progress) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE job \
                SET task = $1, log_message = $2, percent_complete = $3 \
            WHERE id = $4",
        )
        .bind(&progress.task)
        .bind(&progress.message)
        .bind(progress.percent)
        .bind(id)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    #[instrument(name = "db.finish_job", skip_all, fields(job_id = %id, status = %status))]
    pub(crate) async fn finish_job(
        &self,
        id: i64,
        status: Status,
        outputs: &JobOutputs,
    ) -> Result<(), StoreError> {
        if !status.is_terminal() {
            return Err(StoreError::InvalidTransition {
                id,
                from: Status::Running,
                to: status,
            });
        }

        let result = sqlx::query(
            "UPDATE job \
                SET status_id = $1, \
                density_map = $2, \
                fsc_chart = $3, \
                summary_chart = $4, \
                raw_data = $5, \
                completed = now() \
            WHERE id = $6 AND status_id = $7",
        )
        .bind(status)
        .bind(&outputs.density_map)
        .bind(&outputs.fsc_chart)
        .bind(&outputs.summary_chart)
        .bind(&outputs.raw_data)
        .bind(id)
        .bind(Status::Running)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let current: Option<Status> =
                sqlx::query_scalar("SELECT status_id FROM job WHERE id = $1")
                    .bind(id)
                    .fetch_optional(&*self.pool)
                    .await?;
            return Err(match current {
                None => StoreError::NotFound(id),
                Some(from) => StoreError::InvalidTransition {
                    id,
                    from,
                    to: status,
                },
            });
        }
        Ok(())
    }

    #[instrument(name = "db.submit_job_request", skip_all, fields(job_id))]
    pub(crate) async fn submit_job_request(&self, job: &JobRequest) -> Result<i64, StoreError> {
        debug!(name = %job.name, file_type = %job.file_type, "Submitting job");
        let params = job.params.clone().with_defaults();
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO job \
            (token, name, email, status_id, file_type, input_data, dmax, oversampling, \
             num_samples, voxel_size, electrons, max_steps, max_runs, symmetry, symmetry_axis, \
             symmetry_steps, mode, units, enantiomer, submitted) \
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
             $17, $18, $19, now()) \
            RETURNING id",
        )
        .bind(new_token())
        .bind(&job.name)
        .bind(&job.email)
        .bind(Status::Pending)
        .bind(&job.file_type)
        .bind(&job.input_data)
        .bind(params.dmax)
        .bind(params.oversampling)
        .bind(params.num_samples)
        .bind(params.voxel_size)
        .bind(params.electrons)
        .bind(params.max_steps)
        .bind(params.max_runs)
        .bind(params.symmetry)
        .bind(params.symmetry_axis)
        .bind(&params.symmetry_steps)
        .bind(&params.mode)
        .bind(&params.units)
        .bind(params.enantiomer)
        .fetch_one(&*self.pool)
        .await?;

        tracing::Span::current().record("job_id", id);
        Ok(id)
    }
}

impl JobStore for DbHandle {
    fn fetch_next_pending(&self) -> BoxFuture<'_, Result<Option<Job>, StoreError>> {
        self.claim_next_pending().boxed()
    }

    fn log_progress<'a>(
        &'a self,
        job_id: i64,
        progress: &'a Progress,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        self.log_job_message(job_id, progress).boxed()
    }

    fn complete_job<'a>(
        &'a self,
        job_id: i64,
        status: Status,
        outputs: &'a JobOutputs,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        self.finish_job(job_id, status, outputs).boxed()
    }

    fn submit<'a>(&'a self, request: &'a JobRequest) -> BoxFuture<'a, Result<i64, StoreError>> {
        self.submit_job_request(request).boxed()
    }
}
