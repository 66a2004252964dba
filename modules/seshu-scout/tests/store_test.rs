//! Postgres-backed stores and queue.
//!
//! Skipped unless DATABASE_TEST_URL points at a scratch database:
//!
//!   DATABASE_TEST_URL=postgres://localhost/seshu_test cargo test -p seshu-scout --test store_test
//!
//! Every test provisions its own uniquely named tables.

use chrono::{Duration, TimeZone, Utc};
use seshu_common::{
    CandidateEvent, FieldValidation, GeoLocation, JobStatus, JobUpdate, NewSession, SeshuJob,
    SessionStatus, SessionUpdate, TargetSelectors,
};
use seshu_scout::queue::{PgQueue, WorkQueue};
use seshu_scout::store::{JobStore, PgJobStore, PgSessionStore, SessionStore};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

async fn test_pool() -> Option<PgPool> {
    let url = std::env::var("DATABASE_TEST_URL").ok()?;
    Some(
        PgPoolOptions::new()
            .max_connections(4)
            .connect(&url)
            .await
            .expect("DATABASE_TEST_URL is set but unreachable"),
    )
}

fn table(prefix: &str) -> String {
    format!("{prefix}_{}", rand::random::<u32>())
}

async fn drop_table(pool: &PgPool, name: &str) {
    sqlx::query(&format!("DROP TABLE IF EXISTS {name}"))
        .execute(pool)
        .await
        .unwrap();
}

fn job(url: &str, hour: i32) -> SeshuJob {
    SeshuJob {
        normalized_url_key: url.into(),
        location: Some(GeoLocation {
            latitude: 44.9778,
            longitude: -93.265,
            address: "Minneapolis, MN".into(),
        }),
        location_timezone: "America/Chicago".into(),
        scheduled_hour: hour,
        targets: TargetSelectors {
            name: "h2.title".into(),
            ..Default::default()
        },
        is_recursive: false,
        status: JobStatus::Healthy,
        last_scrape_success: None,
        last_scrape_failure: None,
        last_scrape_failure_count: 0,
        owner_id: "owner-1".into(),
        known_scrape_source: "generic".into(),
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn session_lifecycle_round_trips_through_postgres() {
    let Some(pool) = test_pool().await else { return };
    let name = table("seshu_sessions_test");
    let store = PgSessionStore::new(pool.clone(), &name).unwrap();
    store.ensure_schema().await.unwrap();

    let now = Utc.with_ymd_and_hms(2025, 7, 1, 12, 0, 0).unwrap();
    let url = "https://example.com/events?page=2";
    let created = store
        .insert(
            NewSession {
                owner_id: "owner-1".into(),
                url: url.into(),
                html: "<html></html>".into(),
                event_candidates: vec![CandidateEvent {
                    title: "Jazz Night".into(),
                    ..Default::default()
                }],
                ..Default::default()
            },
            now,
        )
        .await
        .unwrap();
    assert_eq!(created.status, SessionStatus::Draft);
    assert_eq!(created.url_query_params["page"], vec!["2".to_string()]);

    let fetched = store.get(url, now).await.unwrap().unwrap();
    assert_eq!(fetched.event_candidates, created.event_candidates);
    assert_eq!(fetched.expire_at, now + Duration::hours(24));

    let later = now + Duration::minutes(5);
    let patch = SessionUpdate {
        event_validations: Some(vec![FieldValidation {
            title: true,
            ..Default::default()
        }]),
        status: Some(SessionStatus::Committed),
        ..Default::default()
    };
    let updated = store.update(url, &patch, later).await.unwrap().unwrap();
    assert_eq!(updated.status, SessionStatus::Committed);
    assert_eq!(updated.event_validations.len(), 1);
    assert_eq!(updated.html, "<html></html>");
    assert_eq!(updated.owner_id, "owner-1");
    assert_eq!(updated.updated_at, later);

    assert!(store.get(url, now + Duration::hours(25)).await.unwrap().is_none());
    assert!(store.delete(url).await.unwrap());
    assert!(!store.delete(url).await.unwrap());

    drop_table(&pool, &name).await;
}

#[tokio::test]
async fn expired_sessions_are_purged() {
    let Some(pool) = test_pool().await else { return };
    let name = table("seshu_sessions_test");
    let store = PgSessionStore::new(pool.clone(), &name).unwrap();
    store.ensure_schema().await.unwrap();

    let now = Utc.with_ymd_and_hms(2025, 7, 1, 12, 0, 0).unwrap();
    for (i, created) in [now - Duration::hours(30), now].into_iter().enumerate() {
        store
            .insert(
                NewSession {
                    owner_id: "owner-1".into(),
                    url: format!("https://example.com/{i}"),
                    ..Default::default()
                },
                created,
            )
            .await
            .unwrap();
    }

    assert_eq!(store.purge_expired(now).await.unwrap(), 1);
    assert!(store.get("https://example.com/1", now).await.unwrap().is_some());

    drop_table(&pool, &name).await;
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn jobs_are_bucketed_and_patched_sparsely() {
    let Some(pool) = test_pool().await else { return };
    let name = table("seshu_jobs_test");
    let store = PgJobStore::new(pool.clone(), &name).unwrap();
    store.ensure_schema().await.unwrap();

    store.create(job("https://b.example.com/events", 5)).await.unwrap();
    store.create(job("https://a.example.com/events", 5)).await.unwrap();
    store.create(job("https://c.example.com/events", 6)).await.unwrap();

    let five: Vec<String> = store
        .jobs_scheduled_for_hour(5)
        .await
        .unwrap()
        .into_iter()
        .map(|j| j.normalized_url_key)
        .collect();
    assert_eq!(five, vec!["https://a.example.com/events", "https://b.example.com/events"]);

    let patch = JobUpdate {
        scheduled_hour: Some(7),
        ..Default::default()
    };
    let once = store.update("https://a.example.com/events", &patch).await.unwrap().unwrap();
    let twice = store.update("https://a.example.com/events", &patch).await.unwrap().unwrap();
    assert_eq!(once, twice);
    assert_eq!(twice.scheduled_hour, 7);
    assert_eq!(twice.targets.name, "h2.title");
    assert_eq!(twice.location_timezone, "America/Chicago");

    drop_table(&pool, &name).await;
}

#[tokio::test]
async fn scrape_outcomes_update_health() {
    let Some(pool) = test_pool().await else { return };
    let name = table("seshu_jobs_test");
    let store = PgJobStore::new(pool.clone(), &name).unwrap();
    store.ensure_schema().await.unwrap();
    let url = "https://example.com/events";
    store.create(job(url, 5)).await.unwrap();

    let at = Utc.with_ymd_and_hms(2025, 7, 1, 5, 0, 0).unwrap();
    store.record_failure(url, at).await.unwrap();
    store.record_failure(url, at).await.unwrap();
    let failed = store.get(url).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Unhealthy);
    assert_eq!(failed.last_scrape_failure_count, 2);
    assert_eq!(failed.last_scrape_failure, Some(at));

    store.record_success(url, at + Duration::hours(24)).await.unwrap();
    let healed = store.get(url).await.unwrap().unwrap();
    assert_eq!(healed.status, JobStatus::Healthy);
    assert_eq!(healed.last_scrape_failure_count, 0);
    assert_eq!(healed.last_scrape_failure, Some(at));
    assert_eq!(healed.owner_id, "owner-1");

    assert!(store.record_success("https://example.com/unknown", at).await.is_err());
    assert!(store.delete(url).await.unwrap());

    drop_table(&pool, &name).await;
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[tokio::test]
async fn queue_provisions_itself_and_keeps_subjects_apart() {
    let Some(pool) = test_pool().await else { return };
    let name = table("seshu_queue_test");
    let scrape = PgQueue::new(pool.clone(), &name, "seshu.jobs.scrape").unwrap();
    let other = PgQueue::new(pool.clone(), &name, "seshu.jobs.other").unwrap();

    assert_eq!(scrape.peek_top().await.unwrap(), None);
    scrape.publish(&json!({"n": 1})).await.unwrap();
    scrape.publish(&json!({"n": 2})).await.unwrap();
    other.publish(&json!({"n": 99})).await.unwrap();

    assert_eq!(scrape.peek_top().await.unwrap(), Some(json!({"n": 1})));
    assert_eq!(scrape.peek_top().await.unwrap(), Some(json!({"n": 1})));
    assert!(scrape.consume().await.unwrap());
    assert_eq!(scrape.peek_top().await.unwrap(), Some(json!({"n": 2})));

    assert_eq!(scrape.purge().await.unwrap(), 1);
    assert!(!scrape.consume().await.unwrap());
    assert_eq!(other.peek_top().await.unwrap(), Some(json!({"n": 99})));

    drop_table(&pool, &name).await;
}
