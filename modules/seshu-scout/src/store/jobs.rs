use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use seshu_common::error::Result;
use seshu_common::urls::normalize_url_key;
use seshu_common::{GeoLocation, JobStatus, JobUpdate, SeshuError, SeshuJob, TargetSelectors};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::info;

use super::validate_table_name;

/// Scheduled jobs keyed by normalized source URL. Every method accepts a raw
/// URL and normalizes it before touching storage.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Store a job, replacing any job already held for the same URL.
    async fn create(&self, job: SeshuJob) -> Result<SeshuJob>;

    async fn get(&self, url: &str) -> Result<Option<SeshuJob>>;

    async fn update(&self, url: &str, patch: &JobUpdate) -> Result<Option<SeshuJob>>;

    async fn delete(&self, url: &str) -> Result<bool>;

    async fn jobs_scheduled_for_hour(&self, hour: i32) -> Result<Vec<SeshuJob>>;

    /// Zero the failure counter, stamp the success time, mark healthy.
    async fn record_success(&self, url: &str, at: DateTime<Utc>) -> Result<()>;

    /// Bump the failure counter, stamp the failure time, mark unhealthy.
    async fn record_failure(&self, url: &str, at: DateTime<Utc>) -> Result<()>;
}

fn prepare(mut job: SeshuJob) -> Result<SeshuJob> {
    job.validate()?;
    job.normalized_url_key = normalize_url_key(&job.normalized_url_key)?;
    Ok(job)
}

fn check_hour(patch: &JobUpdate) -> Result<()> {
    match patch.scheduled_hour {
        Some(hour) if !(0..24).contains(&hour) => Err(SeshuError::Validation(format!(
            "scheduled hour {hour} is outside 0-23"
        ))),
        _ => Ok(()),
    }
}

fn missing(url: &str) -> SeshuError {
    SeshuError::Validation(format!("no scheduled job for {url}"))
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<String, SeshuJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, SeshuJob>>> {
        self.jobs
            .lock()
            .map_err(|_| SeshuError::Storage("job map lock poisoned".into()))
    }

    fn modify(&self, url: &str, f: impl FnOnce(&mut SeshuJob)) -> Result<Option<SeshuJob>> {
        let key = normalize_url_key(url)?;
        Ok(self.lock()?.get_mut(&key).map(|job| {
            f(job);
            job.clone()
        }))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: SeshuJob) -> Result<SeshuJob> {
        let job = prepare(job)?;
        self.lock()?
            .insert(job.normalized_url_key.clone(), job.clone());
        Ok(job)
    }

    async fn get(&self, url: &str) -> Result<Option<SeshuJob>> {
        let key = normalize_url_key(url)?;
        Ok(self.lock()?.get(&key).cloned())
    }

    async fn update(&self, url: &str, patch: &JobUpdate) -> Result<Option<SeshuJob>> {
        check_hour(patch)?;
        self.modify(url, |job| patch.apply_to(job))
    }

    async fn delete(&self, url: &str) -> Result<bool> {
        let key = normalize_url_key(url)?;
        Ok(self.lock()?.remove(&key).is_some())
    }

    async fn jobs_scheduled_for_hour(&self, hour: i32) -> Result<Vec<SeshuJob>> {
        let mut jobs: Vec<SeshuJob> = self
            .lock()?
            .values()
            .filter(|j| j.scheduled_hour == hour)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.normalized_url_key.cmp(&b.normalized_url_key));
        Ok(jobs)
    }

    async fn record_success(&self, url: &str, at: DateTime<Utc>) -> Result<()> {
        self.modify(url, |job| {
            job.status = JobStatus::Healthy;
            job.last_scrape_success = Some(at);
            job.last_scrape_failure_count = 0;
        })?
        .map(|_| ())
        .ok_or_else(|| missing(url))
    }

    async fn record_failure(&self, url: &str, at: DateTime<Utc>) -> Result<()> {
        self.modify(url, |job| {
            job.status = JobStatus::Unhealthy;
            job.last_scrape_failure = Some(at);
            job.last_scrape_failure_count += 1;
        })?
        .map(|_| ())
        .ok_or_else(|| missing(url))
    }
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct JobRow {
    normalized_url_key: String,
    location: Option<Json<GeoLocation>>,
    location_timezone: String,
    scheduled_hour: i32,
    targets: Json<TargetSelectors>,
    is_recursive: bool,
    status: String,
    last_scrape_success: Option<DateTime<Utc>>,
    last_scrape_failure: Option<DateTime<Utc>>,
    last_scrape_failure_count: i32,
    owner_id: String,
    known_scrape_source: String,
}

impl TryFrom<JobRow> for SeshuJob {
    type Error = SeshuError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(SeshuJob {
            normalized_url_key: row.normalized_url_key,
            location: row.location.map(|l| l.0),
            location_timezone: row.location_timezone,
            scheduled_hour: row.scheduled_hour,
            targets: row.targets.0,
            is_recursive: row.is_recursive,
            status: row.status.parse()?,
            last_scrape_success: row.last_scrape_success,
            last_scrape_failure: row.last_scrape_failure,
            last_scrape_failure_count: row.last_scrape_failure_count,
            owner_id: row.owner_id,
            known_scrape_source: row.known_scrape_source,
        })
    }
}

pub struct PgJobStore {
    pool: PgPool,
    table: String,
}

impl PgJobStore {
    pub fn new(pool: PgPool, table: &str) -> Result<Self> {
        validate_table_name("jobs", table)?;
        Ok(Self {
            pool,
            table: table.to_string(),
        })
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {t} (
                normalized_url_key TEXT PRIMARY KEY,
                location JSONB,
                location_timezone TEXT NOT NULL DEFAULT '',
                scheduled_hour INTEGER NOT NULL CHECK (scheduled_hour BETWEEN 0 AND 23),
                targets JSONB NOT NULL DEFAULT '{{}}',
                is_recursive BOOLEAN NOT NULL DEFAULT FALSE,
                status TEXT NOT NULL,
                last_scrape_success TIMESTAMPTZ,
                last_scrape_failure TIMESTAMPTZ,
                last_scrape_failure_count INTEGER NOT NULL DEFAULT 0,
                owner_id TEXT NOT NULL,
                known_scrape_source TEXT NOT NULL DEFAULT ''
            )
            "#,
            t = self.table
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {t}_scheduled_hour_idx ON {t} (scheduled_hour)",
            t = self.table
        ))
        .execute(&self.pool)
        .await?;

        info!(table = %self.table, "Job table ready");
        Ok(())
    }

    async fn stamp(&self, url: &str, sql_set: &str, at: DateTime<Utc>) -> Result<()> {
        let key = normalize_url_key(url)?;
        let result = sqlx::query(&format!(
            "UPDATE {} SET {sql_set} WHERE normalized_url_key = $2",
            self.table
        ))
        .bind(at)
        .bind(&key)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(missing(url));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, job: SeshuJob) -> Result<SeshuJob> {
        let job = prepare(job)?;
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            INSERT INTO {} (normalized_url_key, location, location_timezone, scheduled_hour,
                            targets, is_recursive, status, last_scrape_success,
                            last_scrape_failure, last_scrape_failure_count, owner_id,
                            known_scrape_source)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (normalized_url_key) DO UPDATE SET
                location = EXCLUDED.location,
                location_timezone = EXCLUDED.location_timezone,
                scheduled_hour = EXCLUDED.scheduled_hour,
                targets = EXCLUDED.targets,
                is_recursive = EXCLUDED.is_recursive,
                status = EXCLUDED.status,
                last_scrape_success = EXCLUDED.last_scrape_success,
                last_scrape_failure = EXCLUDED.last_scrape_failure,
                last_scrape_failure_count = EXCLUDED.last_scrape_failure_count,
                owner_id = EXCLUDED.owner_id,
                known_scrape_source = EXCLUDED.known_scrape_source
            RETURNING *
            "#,
            self.table
        ))
        .bind(&job.normalized_url_key)
        .bind(job.location.as_ref().map(Json))
        .bind(&job.location_timezone)
        .bind(job.scheduled_hour)
        .bind(Json(&job.targets))
        .bind(job.is_recursive)
        .bind(job.status.as_str())
        .bind(job.last_scrape_success)
        .bind(job.last_scrape_failure)
        .bind(job.last_scrape_failure_count)
        .bind(&job.owner_id)
        .bind(&job.known_scrape_source)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn get(&self, url: &str) -> Result<Option<SeshuJob>> {
        let key = normalize_url_key(url)?;
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT * FROM {} WHERE normalized_url_key = $1",
            self.table
        ))
        .bind(&key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SeshuJob::try_from).transpose()
    }

    async fn update(&self, url: &str, patch: &JobUpdate) -> Result<Option<SeshuJob>> {
        check_hour(patch)?;
        let key = normalize_url_key(url)?;
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "UPDATE {} SET normalized_url_key = normalized_url_key",
            self.table
        ));

        if let Some(v) = &patch.location {
            qb.push(", location = ").push_bind(Json(v.clone()));
        }
        if let Some(v) = &patch.location_timezone {
            qb.push(", location_timezone = ").push_bind(v.clone());
        }
        if let Some(v) = patch.scheduled_hour {
            qb.push(", scheduled_hour = ").push_bind(v);
        }
        if let Some(v) = &patch.targets {
            qb.push(", targets = ").push_bind(Json(v.clone()));
        }
        if let Some(v) = patch.is_recursive {
            qb.push(", is_recursive = ").push_bind(v);
        }
        if let Some(v) = patch.status {
            qb.push(", status = ").push_bind(v.as_str());
        }
        if let Some(v) = &patch.owner_id {
            qb.push(", owner_id = ").push_bind(v.clone());
        }
        if let Some(v) = &patch.known_scrape_source {
            qb.push(", known_scrape_source = ").push_bind(v.clone());
        }
        qb.push(" WHERE normalized_url_key = ").push_bind(key);
        qb.push(" RETURNING *");

        let row = qb
            .build_query_as::<JobRow>()
            .fetch_optional(&self.pool)
            .await?;

        row.map(SeshuJob::try_from).transpose()
    }

    async fn delete(&self, url: &str) -> Result<bool> {
        let key = normalize_url_key(url)?;
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE normalized_url_key = $1",
            self.table
        ))
        .bind(&key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn jobs_scheduled_for_hour(&self, hour: i32) -> Result<Vec<SeshuJob>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT * FROM {} WHERE scheduled_hour = $1 ORDER BY normalized_url_key",
            self.table
        ))
        .bind(hour)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SeshuJob::try_from).collect()
    }

    async fn record_success(&self, url: &str, at: DateTime<Utc>) -> Result<()> {
        self.stamp(
            url,
            "status = 'HEALTHY', last_scrape_success = $1, last_scrape_failure_count = 0",
            at,
        )
        .await
    }

    async fn record_failure(&self, url: &str, at: DateTime<Utc>) -> Result<()> {
        self.stamp(
            url,
            "status = 'UNHEALTHY', last_scrape_failure = $1, \
             last_scrape_failure_count = last_scrape_failure_count + 1",
            at,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 20, hour, 0, 0).unwrap()
    }

    fn job(url: &str, hour: i32) -> SeshuJob {
        SeshuJob {
            normalized_url_key: url.into(),
            location: None,
            location_timezone: "America/Chicago".into(),
            scheduled_hour: hour,
            targets: TargetSelectors::default(),
            is_recursive: false,
            status: JobStatus::Healthy,
            last_scrape_success: None,
            last_scrape_failure: None,
            last_scrape_failure_count: 0,
            owner_id: "owner-1".into(),
            known_scrape_source: String::new(),
        }
    }

    #[tokio::test]
    async fn create_normalizes_the_key() {
        let store = InMemoryJobStore::new();
        let stored = store
            .create(job("HTTPS://Example.com/events/?b=2&a=1#top", 9))
            .await
            .unwrap();

        assert_eq!(stored.normalized_url_key, "https://example.com/events?a=1&b=2");
        assert!(store
            .get("https://example.com/events?b=2&a=1")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn hour_query_returns_only_that_bucket() {
        let store = InMemoryJobStore::new();
        store.create(job("https://a.example.com/events", 9)).await.unwrap();
        store.create(job("https://b.example.com/events", 9)).await.unwrap();
        store.create(job("https://c.example.com/events", 10)).await.unwrap();

        let nine = store.jobs_scheduled_for_hour(9).await.unwrap();
        let keys: Vec<&str> = nine.iter().map(|j| j.normalized_url_key.as_str()).collect();
        assert_eq!(keys, vec!["https://a.example.com/events", "https://b.example.com/events"]);
        assert!(store.jobs_scheduled_for_hour(11).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn outcomes_touch_only_health_fields() {
        let store = InMemoryJobStore::new();
        let url = "https://example.com/events";
        let created = store.create(job(url, 9)).await.unwrap();

        store.record_failure(url, at(9)).await.unwrap();
        store.record_failure(url, at(10)).await.unwrap();
        let failed = store.get(url).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Unhealthy);
        assert_eq!(failed.last_scrape_failure_count, 2);
        assert_eq!(failed.last_scrape_failure, Some(at(10)));
        assert_eq!(failed.location_timezone, created.location_timezone);
        assert_eq!(failed.scheduled_hour, 9);

        store.record_success(url, at(11)).await.unwrap();
        let healed = store.get(url).await.unwrap().unwrap();
        assert_eq!(healed.status, JobStatus::Healthy);
        assert_eq!(healed.last_scrape_failure_count, 0);
        assert_eq!(healed.last_scrape_success, Some(at(11)));
        assert_eq!(healed.last_scrape_failure, Some(at(10)));
    }

    #[tokio::test]
    async fn outcome_for_unknown_job_is_an_error() {
        let store = InMemoryJobStore::new();
        let err = store
            .record_success("https://example.com/none", at(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SeshuError::Validation(_)));
    }

    #[tokio::test]
    async fn sparse_update_is_idempotent() {
        let store = InMemoryJobStore::new();
        let url = "https://example.com/events";
        store.create(job(url, 9)).await.unwrap();

        let patch = JobUpdate {
            scheduled_hour: Some(14),
            known_scrape_source: Some(String::new()),
            ..Default::default()
        };
        let once = store.update(url, &patch).await.unwrap().unwrap();
        let twice = store.update(url, &patch).await.unwrap().unwrap();
        assert_eq!(once, twice);
        assert_eq!(twice.scheduled_hour, 14);
        assert_eq!(twice.owner_id, "owner-1");

        let bad = JobUpdate {
            scheduled_hour: Some(24),
            ..Default::default()
        };
        assert!(store.update(url, &bad).await.is_err());
        assert!(store.delete(url).await.unwrap());
        assert!(store.update(url, &patch).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalid_jobs_are_rejected() {
        let store = InMemoryJobStore::new();
        assert!(store.create(job("https://example.com/events", 24)).await.is_err());
        let mut ownerless = job("https://example.com/events", 3);
        ownerless.owner_id.clear();
        assert!(store.create(ownerless).await.is_err());
    }
}
