use crate::convert::{output_path_for, Converter, MESH_CONTENT_TYPE, MESH_EXTENSION};
use crate::db::{JobStore, JobUpdate, ShowcaseUpdate};
use crate::error::{Failure, StoreError};
use crate::storage::FileTransfer;
use crate::{Job, JobStatus, ShowcaseStatus};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

/// What happened to the job a cycle claimed.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed { job_id: Uuid, output_path: String },
    Failed { job_id: Uuid, error: String },
}

#[derive(Debug, Clone)]
pub struct Buckets {
    pub uploaded: String,
    pub converted: String,
}

impl Default for Buckets {
    fn default() -> Self {
        Self {
            uploaded: "cad-uploaded".into(),
            converted: "cad-converted".into(),
        }
    }
}

/// Single-job-at-a-time poller over the job store.
pub struct Worker {
    store: Arc<dyn JobStore>,
    transfer: FileTransfer,
    converter: Converter,
    buckets: Buckets,
}

impl Worker {
    pub fn new(
        store: Arc<dyn JobStore>,
        transfer: FileTransfer,
        converter: Converter,
        buckets: Buckets,
    ) -> Self {
        Self {
            store,
            transfer,
            converter,
            buckets,
        }
    }

    /// Polls until `cancel_token` fires. Cancellation is only noticed between
    /// cycles, so a claimed job is always finalised first.
    pub async fn start(&self, cancel_token: CancellationToken, poll_interval: Duration) {
        info!(interval = ?poll_interval, "Worker started");
        loop {
            match self.poll_once().await {
                Ok(Some(JobOutcome::Completed {
                    job_id,
                    output_path,
                })) => {
                    info!(%job_id, output_path = %output_path, "Job complete");
                }
                Ok(Some(JobOutcome::Failed { job_id, error })) => {
                    warn!(%job_id, error = %error, "Job failed");
                }
                Ok(None) => {
                    trace!("No queued jobs");
                }
                Err(err) => {
                    error!(message = "Poll cycle failed", error = %err);
                }
            }

            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("Worker cancelled");
                    break;
                },
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
        info!("Worker stopped.");
    }

    /// One cycle: claim the oldest queued job, if any, and run it to a
    /// terminal state.
    ///
    /// Errors are store failures; pipeline failures are reported through
    /// [`JobOutcome::Failed`].
    pub async fn poll_once(&self) -> Result<Option<JobOutcome>, StoreError> {
        let Some(job) = self.store.claim_next_queued().await? else {
            return Ok(None);
        };
        debug!(job_id = %job.id, input_path = %job.input_path, "Claimed job");

        if let Err(err) = self
            .store
            .update_showcase(
                job.showcase_id,
                ShowcaseUpdate {
                    status: Some(ShowcaseStatus::Processing),
                    ..Default::default()
                },
            )
            .await
        {
            warn!(job_id = %job.id, showcase_id = %job.showcase_id, error = %err, "Could not mark showcase processing");
        }

        let mut scratch = Vec::new();
        let result = self.process(&job, &mut scratch).await;
        remove_scratch(&scratch).await;

        self.finalize(&job, result).await.map(Some)
    }

    #[instrument(skip_all, fields(job_id = %job.id))]
    async fn process(&self, job: &Job, scratch: &mut Vec<PathBuf>) -> Result<String, Failure> {
        let owner = job
            .owner()
            .ok_or_else(|| Failure::InvalidInput(job.input_path.clone()))?;

        let input = self
            .transfer
            .download(&self.buckets.uploaded, &job.input_path)
            .await?;
        scratch.push(input.clone());

        let output = output_path_for(&input);
        scratch.push(output.clone());
        self.converter.convert(&input, &output).await?;

        let key = format!("{}/{}.{}", owner, job.id, MESH_EXTENSION);
        Ok(self
            .transfer
            .upload(&self.buckets.converted, &key, &output, MESH_CONTENT_TYPE)
            .await?)
    }

    /// Writes the terminal job state, then the showcase state. The two writes
    /// are separate; if the second fails the job row is already final.
    async fn finalize(
        &self,
        job: &Job,
        result: Result<String, Failure>,
    ) -> Result<JobOutcome, StoreError> {
        let finished_at = Some(Utc::now());

        match result {
            Ok(output_path) => {
                self.store
                    .update_job(
                        job.id,
                        JobUpdate {
                            status: Some(JobStatus::Complete),
                            output_path: Some(output_path.clone()),
                            finished_at,
                            ..Default::default()
                        },
                    )
                    .await?;
                self.store
                    .update_showcase(
                        job.showcase_id,
                        ShowcaseUpdate {
                            status: Some(ShowcaseStatus::Ready),
                            output_path: Some(output_path.clone()),
                        },
                    )
                    .await?;

                Ok(JobOutcome::Completed {
                    job_id: job.id,
                    output_path,
                })
            }
            Err(failure) => {
                let error = failure.to_string();
                self.store
                    .update_job(
                        job.id,
                        JobUpdate {
                            status: Some(JobStatus::Failed),
                            error: Some(error.clone()),
                            finished_at,
                            ..Default::default()
                        },
                    )
                    .await?;
                self.store
                    .update_showcase(
                        job.showcase_id,
                        ShowcaseUpdate {
                            status: Some(ShowcaseStatus::Failed),
                            ..Default::default()
                        },
                    )
                    .await?;

                Ok(JobOutcome::Failed {
                    job_id: job.id,
                    error,
                })
            }
        }
    }
}

async fn remove_scratch(paths: &[PathBuf]) {
    for path in paths {
        match tokio::fs::remove_file(path).await {
            Ok(()) => trace!(path = %path.display(), "Removed scratch file"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %path.display(), error = %err, "Could not remove scratch file"),
        }
    }
}
