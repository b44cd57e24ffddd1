//! Integration tests for the PostgreSQL job store.
//!
//! Exercises the repositories and [`PgJobStore`] against a real database:
//! - completion is write-once (compare-and-set and upsert)
//! - duplicate completions produce a single result
//! - completion writes share one transaction
//! - retention deletes only expired results
//! - owner listing joins through the job

use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use sqlx::PgPool;
use territorium_core::artifact::ArtifactRef;
use territorium_db::models::map_result::MapResult;
use territorium_db::models::render_job::{RenderJob, SubmitRenderJob};
use territorium_db::repositories::{MapResultRepo, RenderJobRepo};
use territorium_db::store::{CompletionOutcome, JobStore, PgJobStore};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn submit(pool: &PgPool, guid: &str, owner_id: i64) -> RenderJob {
    RenderJobRepo::submit(
        pool,
        &SubmitRenderJob {
            guid: guid.to_string(),
            owner_id,
        },
    )
    .await
    .unwrap()
}

fn result_for(job: &str, age: Duration) -> MapResult {
    MapResult::new(
        Uuid::new_v4(),
        job,
        &ArtifactRef::new(format!("maps/{job}/out.png")),
        "out.png",
        Utc::now() - age,
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "./migrations")]
async fn test_health_check(pool: PgPool) {
    territorium_db::health_check(&pool).await.unwrap();
}

#[sqlx::test(migrations = "./migrations")]
async fn test_submitted_job_is_pending(pool: PgPool) {
    let job = submit(&pool, "J1", 42).await;
    assert!(!job.is_completed());

    let store = PgJobStore::new(pool);
    let found = store.get_job("J1").await.unwrap().unwrap();
    assert_eq!(found.owner_id, 42);
    assert!(found.completed_at.is_none());
    assert!(store.get_job("J9").await.unwrap().is_none());
}

#[sqlx::test(migrations = "./migrations")]
async fn test_mark_completed_is_compare_and_set(pool: PgPool) {
    submit(&pool, "J1", 1).await;

    assert!(RenderJobRepo::mark_completed(&pool, "J1", Utc::now()).await.unwrap());
    let first = RenderJobRepo::find_by_guid(&pool, "J1").await.unwrap().unwrap();

    assert!(!RenderJobRepo::mark_completed(&pool, "J1", Utc::now() + Duration::hours(1))
        .await
        .unwrap());
    let second = RenderJobRepo::find_by_guid(&pool, "J1").await.unwrap().unwrap();
    assert_eq!(first.completed_at, second.completed_at);

    assert!(!RenderJobRepo::mark_completed(&pool, "missing", Utc::now()).await.unwrap());
}

#[sqlx::test(migrations = "./migrations")]
async fn test_upsert_never_clears_completion(pool: PgPool) {
    let job = submit(&pool, "J1", 1).await;
    RenderJobRepo::mark_completed(&pool, "J1", Utc::now()).await.unwrap();
    let completed = RenderJobRepo::find_by_guid(&pool, "J1").await.unwrap().unwrap();

    let saved = RenderJobRepo::upsert(&pool, &job).await.unwrap();
    assert_eq!(saved.completed_at, completed.completed_at);
}

#[sqlx::test(migrations = "./migrations")]
async fn test_complete_job_once(pool: PgPool) {
    let job = submit(&pool, "J1", 1).await;
    let store = PgJobStore::new(pool.clone());

    let first = store
        .complete_job(&job, &result_for("J1", Duration::zero()), Utc::now())
        .await
        .unwrap();
    // Same stale snapshot, as a duplicate delivery racing the first would hold.
    let second = store
        .complete_job(&job, &result_for("J1", Duration::zero()), Utc::now())
        .await
        .unwrap();

    assert_eq!(first, CompletionOutcome::Completed);
    assert_eq!(second, CompletionOutcome::AlreadyCompleted);
    assert_eq!(MapResultRepo::list_by_job(&pool, "J1").await.unwrap().len(), 1);
    assert!(store.get_job("J1").await.unwrap().unwrap().is_completed());
}

#[sqlx::test(migrations = "./migrations")]
async fn test_completion_writes_roll_back_together(pool: PgPool) {
    submit(&pool, "J1", 1).await;
    let result = result_for("J1", Duration::zero());

    let mut tx = pool.begin().await.unwrap();
    assert!(RenderJobRepo::mark_completed(&mut *tx, "J1", Utc::now()).await.unwrap());
    let created = MapResultRepo::create(&mut *tx, &result).await.unwrap();
    assert_eq!(created.guid, result.guid);
    tx.rollback().await.unwrap();

    let job = RenderJobRepo::find_by_guid(&pool, "J1").await.unwrap().unwrap();
    assert!(!job.is_completed());
    assert!(MapResultRepo::find_by_guid(&pool, result.guid).await.unwrap().is_none());
}

#[sqlx::test(migrations = "./migrations")]
async fn test_complete_job_sees_completion_from_repository(pool: PgPool) {
    let job = submit(&pool, "J1", 1).await;
    RenderJobRepo::mark_completed(&pool, "J1", Utc::now()).await.unwrap();

    let outcome = PgJobStore::new(pool.clone())
        .complete_job(&job, &result_for("J1", Duration::zero()), Utc::now())
        .await
        .unwrap();

    assert_eq!(outcome, CompletionOutcome::AlreadyCompleted);
    assert!(MapResultRepo::list_by_job(&pool, "J1").await.unwrap().is_empty());
}

#[sqlx::test(migrations = "./migrations")]
async fn test_result_requires_existing_job(pool: PgPool) {
    let store = PgJobStore::new(pool);
    let err = store
        .create_result(&result_for("ghost", Duration::zero()))
        .await
        .unwrap_err();
    assert_matches!(err, territorium_db::store::StoreError::Database(_));
}

#[sqlx::test(migrations = "./migrations")]
async fn test_retention_deletes_only_expired(pool: PgPool) {
    submit(&pool, "J1", 1).await;
    submit(&pool, "J2", 1).await;
    let store = PgJobStore::new(pool.clone());

    let old = result_for("J1", Duration::days(8));
    let fresh = result_for("J2", Duration::days(1));
    store.create_result(&old).await.unwrap();
    store.create_result(&fresh).await.unwrap();

    let cutoff = Utc::now() - Duration::days(7);
    let expired = store.expired_results(cutoff).await.unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].guid, old.guid);

    assert_eq!(store.delete_results_older_than(cutoff).await.unwrap(), 1);
    assert!(MapResultRepo::find_by_guid(&pool, old.guid).await.unwrap().is_none());
    assert!(MapResultRepo::find_by_guid(&pool, fresh.guid).await.unwrap().is_some());
}

#[sqlx::test(migrations = "./migrations")]
async fn test_list_by_owner(pool: PgPool) {
    submit(&pool, "A1", 1).await;
    submit(&pool, "B1", 2).await;
    MapResultRepo::create(&pool, &result_for("A1", Duration::zero())).await.unwrap();
    MapResultRepo::create(&pool, &result_for("B1", Duration::zero())).await.unwrap();

    let mine = MapResultRepo::list_by_owner(&pool, 1).await.unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].job_guid, "A1");
}

#[sqlx::test(migrations = "./migrations")]
async fn test_list_pending(pool: PgPool) {
    submit(&pool, "J1", 1).await;
    submit(&pool, "J2", 1).await;
    RenderJobRepo::mark_completed(&pool, "J1", Utc::now()).await.unwrap();

    let pending = RenderJobRepo::list_pending(&pool, None).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].guid, "J2");
}
