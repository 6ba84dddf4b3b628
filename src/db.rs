use crate::error::{StoreError, StoreResult};
use crate::{Job, JobStatus, Showcase, ShowcaseStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Executor, Postgres, QueryBuilder};
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

pub mod memory;

const JOB_COLUMNS: &str = "id, showcase_id, input_path, output_path, status, attempt_count, \
    started_at, finished_at, error, created_at, updated_at";

const SHOWCASE_COLUMNS: &str = "id, user_id, title, slug, visibility, status, \
    input_path, output_path, created_at, updated_at";

/// Fields to overwrite on a job row. `None` leaves the column alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub output_path: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Fields to overwrite on a showcase row. `None` leaves the column alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShowcaseUpdate {
    pub status: Option<ShowcaseStatus>,
    pub output_path: Option<String>,
}

/// Typed access to the `jobs` and `showcases` tables.
///
/// Only `claim_next_queued` is guarded; the update calls overwrite whatever
/// they are given.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Moves the oldest queued job to `running` and returns it, or `None` if
    /// the queue is empty or another worker won the row first.
    async fn claim_next_queued(&self) -> StoreResult<Option<Job>>;

    async fn update_job(&self, id: Uuid, fields: JobUpdate) -> StoreResult<()>;

    async fn update_showcase(&self, id: Uuid, fields: ShowcaseUpdate) -> StoreResult<()>;

    async fn get_job(&self, id: Uuid) -> StoreResult<Option<Job>>;

    async fn get_showcase(&self, id: Uuid) -> StoreResult<Option<Showcase>>;
}

#[derive(Clone)]
pub struct DbHandle {
    pool: Arc<PgPool>,
}

impl DbHandle {
    #[instrument(name = "db.new", skip(url))]
    pub async fn new(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        Ok(DbHandle {
            pool: Arc::new(pool),
        })
    }

    /// Creates the enum types, tables and indexes if they are missing.
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        (&*self.pool).execute(include_str!("setup.sql")).await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for DbHandle {
    #[instrument(name = "db.claim_next_queued", skip_all)]
    async fn claim_next_queued(&self) -> StoreResult<Option<Job>> {
        let candidate: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM jobs \
            WHERE status = 'queued' \
            ORDER BY created_at ASC \
            LIMIT 1",
        )
        .fetch_optional(&*self.pool)
        .await?;

        let Some(id) = candidate else {
            return Ok(None);
        };

        // The status predicate makes the update a no-op for everyone but the
        // first worker to reach the row.
        let claimed = sqlx::query_as::<_, Job>(&format!(
            "UPDATE jobs \
                SET status = 'running', \
                started_at = now(), \
                updated_at = now() \
            WHERE id = $1 AND status = 'queued' \
            RETURNING {JOB_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        if claimed.is_none() {
            debug!(job_id = %id, "Job was claimed by another worker");
        }

        Ok(claimed)
    }

    #[instrument(name = "db.update_job", skip(self, fields), fields(job_id = %id))]
    async fn update_job(&self, id: Uuid, fields: JobUpdate) -> StoreResult<()> {
        let mut query = QueryBuilder::<Postgres>::new("UPDATE jobs SET updated_at = now()");
        if let Some(status) = fields.status {
            query.push(", status = ").push_bind(status);
        }
        if let Some(output_path) = fields.output_path {
            query.push(", output_path = ").push_bind(output_path);
        }
        if let Some(error) = fields.error {
            query.push(", error = ").push_bind(error);
        }
        if let Some(started_at) = fields.started_at {
            query.push(", started_at = ").push_bind(started_at);
        }
        if let Some(finished_at) = fields.finished_at {
            query.push(", finished_at = ").push_bind(finished_at);
        }
        query.push(" WHERE id = ").push_bind(id);

        let result = query.build().execute(&*self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { table: "jobs", id });
        }

        Ok(())
    }

    #[instrument(name = "db.update_showcase", skip(self, fields), fields(showcase_id = %id))]
    async fn update_showcase(&self, id: Uuid, fields: ShowcaseUpdate) -> StoreResult<()> {
        let mut query = QueryBuilder::<Postgres>::new("UPDATE showcases SET updated_at = now()");
        if let Some(status) = fields.status {
            query.push(", status = ").push_bind(status);
        }
        if let Some(output_path) = fields.output_path {
            query.push(", output_path = ").push_bind(output_path);
        }
        query.push(" WHERE id = ").push_bind(id);

        let result = query.build().execute(&*self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                table: "showcases",
                id,
            });
        }

        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> StoreResult<Option<Job>> {
        Ok(
            sqlx::query_as::<_, Job>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
                .bind(id)
                .fetch_optional(&*self.pool)
                .await?,
        )
    }

    async fn get_showcase(&self, id: Uuid) -> StoreResult<Option<Showcase>> {
        Ok(sqlx::query_as::<_, Showcase>(&format!(
            "SELECT {SHOWCASE_COLUMNS} FROM showcases WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?)
    }
}
