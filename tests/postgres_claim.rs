//! Claims against a real PostgreSQL job store.
//!
//! Ignored by default; run against a disposable database with
//! `DATABASE_URL=postgres://... cargo test --test postgres_claim -- --ignored`.

use std::collections::HashSet;

use futures::future::join_all;
use uuid::Uuid;

use showcase_worker::db::{DbHandle, JobStore};
use showcase_worker::JobStatus;

async fn connect() -> DbHandle {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must point at a scratch database");
    let db = DbHandle::new(&url, 16).await.unwrap();
    db.init_schema().await.unwrap();
    db
}

/// Inserts a showcase and a queued job that sorts before anything already
/// queued, returning the job id.
async fn enqueue_oldest(url: &str) -> Uuid {
    let pool = sqlx::PgPool::connect(url).await.unwrap();
    let owner = Uuid::new_v4();

    let showcase_id: Uuid = sqlx::query_scalar(
        "INSERT INTO showcases (user_id, title, slug, input_path) \
        VALUES ($1, 'race', $2, $3) RETURNING id",
    )
    .bind(owner)
    .bind(format!("race-{owner}"))
    .bind(format!("{owner}/model.step"))
    .fetch_one(&pool)
    .await
    .unwrap();

    sqlx::query_scalar(
        "INSERT INTO jobs (showcase_id, input_path, created_at) \
        VALUES ($1, $2, now() - interval '100 years') RETURNING id",
    )
    .bind(showcase_id)
    .bind(format!("{owner}/model.step"))
    .fetch_one(&pool)
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore = "needs DATABASE_URL"]
async fn concurrent_claims_take_a_row_once() {
    let db = connect().await;
    let url = std::env::var("DATABASE_URL").unwrap();
    let job_id = enqueue_oldest(&url).await;

    let claims = (0..8).map(|_| {
        let db = db.clone();
        tokio::spawn(async move { db.claim_next_queued().await })
    });
    let winners: Vec<Uuid> = join_all(claims)
        .await
        .into_iter()
        .filter_map(|joined| joined.unwrap().unwrap())
        .map(|job| job.id)
        .collect();

    let distinct: HashSet<_> = winners.iter().collect();
    assert_eq!(distinct.len(), winners.len(), "a job was claimed twice: {winners:?}");
    assert_eq!(winners.iter().filter(|id| **id == job_id).count(), 1);

    let job = db.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert!(job.started_at.is_some());
}
