use chrono::{DateTime, Utc};
use uuid::Uuid;

pub mod config;
pub mod convert;
pub mod db;
pub mod error;
pub mod storage;
pub mod telemetry;
pub mod verify;
pub mod worker;

/// A single conversion attempt for a showcase.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    pub id: Uuid,
    pub showcase_id: Uuid,
    pub input_path: String,
    pub output_path: Option<String>,
    pub status: JobStatus,
    pub attempt_count: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Owner of the uploaded object, taken from `<owner>/<filename>`.
    pub fn owner(&self) -> Option<&str> {
        match self.input_path.split_once('/') {
            Some((owner, file)) if !owner.is_empty() && !file.is_empty() => Some(owner),
            _ => None,
        }
    }
}

/// A user's CAD upload and its presentation state.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Showcase {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub slug: String,
    pub visibility: Visibility,
    pub status: ShowcaseStatus,
    pub input_path: Option<String>,
    pub output_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "job_status_t", rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "showcase_status_t", rename_all = "lowercase")]
pub enum ShowcaseStatus {
    Uploaded,
    Processing,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "visibility_t", rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Unlisted,
    Private,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_with_path(path: &str) -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            showcase_id: Uuid::new_v4(),
            input_path: path.into(),
            output_path: None,
            status: JobStatus::Queued,
            attempt_count: 0,
            started_at: None,
            finished_at: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn owner_is_leading_segment() {
        assert_eq!(job_with_path("u1/model.step").owner(), Some("u1"));
        assert_eq!(job_with_path("u1/nested/model.step").owner(), Some("u1"));
    }

    #[test]
    fn owner_requires_both_segments() {
        assert_eq!(job_with_path("model.step").owner(), None);
        assert_eq!(job_with_path("/model.step").owner(), None);
        assert_eq!(job_with_path("u1/").owner(), None);
    }
}
