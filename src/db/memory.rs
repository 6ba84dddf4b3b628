//! In-process job store.
//!
//! Behaves like the PostgreSQL store for everything the worker needs. The
//! claim runs under one lock, which stands in for the row-level atomicity
//! the database provides.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{JobStore, JobUpdate, ShowcaseUpdate};
use crate::error::{StoreError, StoreResult};
use crate::{Job, JobStatus, Showcase, ShowcaseStatus, Visibility};

#[derive(Default)]
struct Tables {
    jobs: HashMap<Uuid, Job>,
    showcases: HashMap<Uuid, Showcase>,
}

#[derive(Default)]
pub struct MemoryJobStore {
    tables: Mutex<Tables>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Tables>> {
        self.tables.lock().map_err(|_| StoreError::Poisoned)
    }

    pub fn insert_showcase(&self, showcase: Showcase) -> StoreResult<()> {
        self.lock()?.showcases.insert(showcase.id, showcase);
        Ok(())
    }

    pub fn insert_job(&self, job: Job) -> StoreResult<()> {
        self.lock()?.jobs.insert(job.id, job);
        Ok(())
    }

    /// Inserts an `uploaded` showcase and its `queued` job for an object
    /// already sitting in the uploaded bucket at `input_path`.
    pub fn enqueue(&self, user_id: Uuid, input_path: &str) -> StoreResult<(Showcase, Job)> {
        let now = Utc::now();
        let title = Path::new(input_path)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("model")
            .to_string();
        let showcase_id = Uuid::new_v4();
        let showcase = Showcase {
            id: showcase_id,
            user_id,
            slug: format!("{}-{}", title.to_lowercase(), &showcase_id.simple().to_string()[..8]),
            title,
            visibility: Visibility::Unlisted,
            status: ShowcaseStatus::Uploaded,
            input_path: Some(input_path.to_string()),
            output_path: None,
            created_at: now,
            updated_at: now,
        };
        let job = Job {
            id: Uuid::new_v4(),
            showcase_id,
            input_path: input_path.to_string(),
            output_path: None,
            status: JobStatus::Queued,
            attempt_count: 0,
            started_at: None,
            finished_at: None,
            error: None,
            created_at: now,
            updated_at: now,
        };

        let mut tables = self.lock()?;
        tables.showcases.insert(showcase.id, showcase.clone());
        tables.jobs.insert(job.id, job.clone());
        Ok((showcase, job))
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn claim_next_queued(&self) -> StoreResult<Option<Job>> {
        let mut tables = self.lock()?;
        let next = tables
            .jobs
            .values_mut()
            .filter(|job| job.status == JobStatus::Queued)
            .min_by_key(|job| (job.created_at, job.id));

        Ok(next.map(|job| {
            let now = Utc::now();
            job.status = JobStatus::Running;
            job.started_at = Some(now);
            job.updated_at = now;
            job.clone()
        }))
    }

    async fn update_job(&self, id: Uuid, fields: JobUpdate) -> StoreResult<()> {
        let mut tables = self.lock()?;
        let job = tables
            .jobs
            .get_mut(&id)
            .ok_or(StoreError::NotFound { table: "jobs", id })?;

        if let Some(status) = fields.status {
            job.status = status;
        }
        if let Some(output_path) = fields.output_path {
            job.output_path = Some(output_path);
        }
        if let Some(error) = fields.error {
            job.error = Some(error);
        }
        if let Some(started_at) = fields.started_at {
            job.started_at = Some(started_at);
        }
        if let Some(finished_at) = fields.finished_at {
            job.finished_at = Some(finished_at);
        }
        job.updated_at = Utc::now();

        Ok(())
    }

    async fn update_showcase(&self, id: Uuid, fields: ShowcaseUpdate) -> StoreResult<()> {
        let mut tables = self.lock()?;
        let showcase = tables.showcases.get_mut(&id).ok_or(StoreError::NotFound {
            table: "showcases",
            id,
        })?;

        if let Some(status) = fields.status {
            showcase.status = status;
        }
        if let Some(output_path) = fields.output_path {
            showcase.output_path = Some(output_path);
        }
        showcase.updated_at = Utc::now();

        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> StoreResult<Option<Job>> {
        Ok(self.lock()?.jobs.get(&id).cloned())
    }

    async fn get_showcase(&self, id: Uuid) -> StoreResult<Option<Showcase>> {
        Ok(self.lock()?.showcases.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    #[tokio::test]
    async fn claims_oldest_queued_first() {
        let store = MemoryJobStore::new();
        let user = Uuid::new_v4();
        let (_, newer) = store.enqueue(user, "u1/b.step").unwrap();
        let (_, mut older) = store.enqueue(user, "u1/a.step").unwrap();
        older.created_at = newer.created_at - Duration::seconds(10);
        store.insert_job(older.clone()).unwrap();

        let claimed = store.claim_next_queued().await.unwrap().unwrap();
        assert_eq!(claimed.id, older.id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert!(claimed.started_at.is_some());

        let claimed = store.claim_next_queued().await.unwrap().unwrap();
        assert_eq!(claimed.id, newer.id);
    }

    #[tokio::test]
    async fn empty_queue_claims_nothing() {
        let store = MemoryJobStore::new();
        assert!(store.claim_next_queued().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn non_queued_jobs_are_never_claimed() {
        let store = MemoryJobStore::new();
        let user = Uuid::new_v4();
        for status in [JobStatus::Running, JobStatus::Complete, JobStatus::Failed] {
            let (_, mut job) = store.enqueue(user, "u1/a.step").unwrap();
            job.status = status;
            store.insert_job(job).unwrap();
        }

        assert!(store.claim_next_queued().await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_claims_have_one_winner() {
        let store = Arc::new(MemoryJobStore::new());
        store.enqueue(Uuid::new_v4(), "u1/a.step").unwrap();

        let claims = (0..8).map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.claim_next_queued().await })
        });
        let winners = futures::future::join_all(claims)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .filter(Option::is_some)
            .count();

        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn updates_leave_unset_fields_alone() {
        let store = MemoryJobStore::new();
        let (showcase, job) = store.enqueue(Uuid::new_v4(), "u1/a.step").unwrap();

        store
            .update_job(
                job.id,
                JobUpdate {
                    error: Some("boom".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.error.as_deref(), Some("boom"));

        store
            .update_showcase(
                showcase.id,
                ShowcaseUpdate {
                    status: Some(ShowcaseStatus::Processing),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let stored = store.get_showcase(showcase.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ShowcaseStatus::Processing);
        assert!(stored.output_path.is_none());
    }

    #[tokio::test]
    async fn updating_missing_rows_fails() {
        let store = MemoryJobStore::new();
        let err = store
            .update_job(Uuid::new_v4(), JobUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { table: "jobs", .. }));
    }
}
