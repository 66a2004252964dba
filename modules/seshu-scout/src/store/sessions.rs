use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use ai_client::truncate_to_char_boundary;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use seshu_common::error::Result;
use seshu_common::urls::decompose;
use seshu_common::{
    CandidateEvent, FieldValidation, GeoLocation, NewSession, SeshuError, SeshuSession,
    SessionStatus, SessionUpdate,
};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::info;

use super::validate_table_name;

/// Largest HTML body kept on a draft.
pub const MAX_HTML_BYTES: usize = 400 * 1024;

/// Drafts expire a day after they are first written.
pub const SESSION_TTL_HOURS: i64 = 24;

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// The live draft for `url`. Expired drafts are treated as absent.
    async fn get(&self, url: &str, now: DateTime<Utc>) -> Result<Option<SeshuSession>>;

    /// Write a fresh draft, replacing any earlier one for the same URL.
    async fn insert(&self, new: NewSession, now: DateTime<Utc>) -> Result<SeshuSession>;

    /// Patch the fields present in `patch` and re-stamp `updated_at`.
    /// Returns `None` when no draft exists for `url`.
    async fn update(
        &self,
        url: &str,
        patch: &SessionUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<SeshuSession>>;

    async fn delete(&self, url: &str) -> Result<bool>;

    /// Remove every draft whose expiry has passed. Returns how many went.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Build the stored form of a new draft.
pub fn new_draft(new: NewSession, now: DateTime<Utc>) -> Result<SeshuSession> {
    if new.url.trim().is_empty() {
        return Err(SeshuError::Validation("session URL is empty".into()));
    }
    let parts = decompose(&new.url)?;
    let html = truncate_to_char_boundary(&new.html, MAX_HTML_BYTES).to_string();

    Ok(SeshuSession {
        owner_id: new.owner_id,
        url: new.url,
        url_domain: parts.domain,
        url_path: parts.path,
        url_query_params: parts.query_params,
        location: new.location,
        html,
        child_id: new.child_id,
        event_candidates: new.event_candidates,
        event_validations: new.event_validations,
        status: SessionStatus::Draft,
        created_at: now,
        updated_at: now,
        expire_at: now + Duration::hours(SESSION_TTL_HOURS),
    })
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, SeshuSession>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, SeshuSession>>> {
        self.sessions
            .lock()
            .map_err(|_| SeshuError::Storage("session map lock poisoned".into()))
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, url: &str, now: DateTime<Utc>) -> Result<Option<SeshuSession>> {
        Ok(self.lock()?.get(url).filter(|s| !s.is_expired(now)).cloned())
    }

    async fn insert(&self, new: NewSession, now: DateTime<Utc>) -> Result<SeshuSession> {
        let session = new_draft(new, now)?;
        self.lock()?.insert(session.url.clone(), session.clone());
        Ok(session)
    }

    async fn update(
        &self,
        url: &str,
        patch: &SessionUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<SeshuSession>> {
        let mut sessions = self.lock()?;
        Ok(sessions.get_mut(url).map(|session| {
            patch.apply_to(session);
            if session.html.len() > MAX_HTML_BYTES {
                session.html = truncate_to_char_boundary(&session.html, MAX_HTML_BYTES).to_string();
            }
            session.updated_at = now;
            session.clone()
        }))
    }

    async fn delete(&self, url: &str) -> Result<bool> {
        Ok(self.lock()?.remove(url).is_some())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut sessions = self.lock()?;
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired(now));
        Ok((before - sessions.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct SessionRow {
    url: String,
    owner_id: String,
    url_domain: String,
    url_path: String,
    url_query_params: Json<BTreeMap<String, Vec<String>>>,
    location: Option<Json<GeoLocation>>,
    html: String,
    child_id: Option<String>,
    event_candidates: Json<Vec<CandidateEvent>>,
    event_validations: Json<Vec<FieldValidation>>,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    expire_at: DateTime<Utc>,
}

impl TryFrom<SessionRow> for SeshuSession {
    type Error = SeshuError;

    fn try_from(row: SessionRow) -> Result<Self> {
        Ok(SeshuSession {
            owner_id: row.owner_id,
            url: row.url,
            url_domain: row.url_domain,
            url_path: row.url_path,
            url_query_params: row.url_query_params.0,
            location: row.location.map(|l| l.0),
            html: row.html,
            child_id: row.child_id,
            event_candidates: row.event_candidates.0,
            event_validations: row.event_validations.0,
            status: row.status.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            expire_at: row.expire_at,
        })
    }
}

pub struct PgSessionStore {
    pool: PgPool,
    table: String,
}

impl PgSessionStore {
    pub fn new(pool: PgPool, table: &str) -> Result<Self> {
        validate_table_name("sessions", table)?;
        Ok(Self {
            pool,
            table: table.to_string(),
        })
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {t} (
                url TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                url_domain TEXT NOT NULL,
                url_path TEXT NOT NULL,
                url_query_params JSONB NOT NULL DEFAULT '{{}}',
                location JSONB,
                html TEXT NOT NULL DEFAULT '',
                child_id TEXT,
                event_candidates JSONB NOT NULL DEFAULT '[]',
                event_validations JSONB NOT NULL DEFAULT '[]',
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                expire_at TIMESTAMPTZ NOT NULL
            )
            "#,
            t = self.table
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {t}_expire_at_idx ON {t} (expire_at)",
            t = self.table
        ))
        .execute(&self.pool)
        .await?;

        info!(table = %self.table, "Session table ready");
        Ok(())
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn get(&self, url: &str, now: DateTime<Utc>) -> Result<Option<SeshuSession>> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT * FROM {} WHERE url = $1 AND expire_at > $2",
            self.table
        ))
        .bind(url)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SeshuSession::try_from).transpose()
    }

    async fn insert(&self, new: NewSession, now: DateTime<Utc>) -> Result<SeshuSession> {
        let s = new_draft(new, now)?;
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            r#"
            INSERT INTO {} (url, owner_id, url_domain, url_path, url_query_params, location, html,
                            child_id, event_candidates, event_validations, status,
                            created_at, updated_at, expire_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (url) DO UPDATE SET
                owner_id = EXCLUDED.owner_id,
                url_domain = EXCLUDED.url_domain,
                url_path = EXCLUDED.url_path,
                url_query_params = EXCLUDED.url_query_params,
                location = EXCLUDED.location,
                html = EXCLUDED.html,
                child_id = EXCLUDED.child_id,
                event_candidates = EXCLUDED.event_candidates,
                event_validations = EXCLUDED.event_validations,
                status = EXCLUDED.status,
                created_at = EXCLUDED.created_at,
                updated_at = EXCLUDED.updated_at,
                expire_at = EXCLUDED.expire_at
            RETURNING *
            "#,
            self.table
        ))
        .bind(&s.url)
        .bind(&s.owner_id)
        .bind(&s.url_domain)
        .bind(&s.url_path)
        .bind(Json(&s.url_query_params))
        .bind(s.location.as_ref().map(Json))
        .bind(&s.html)
        .bind(&s.child_id)
        .bind(Json(&s.event_candidates))
        .bind(Json(&s.event_validations))
        .bind(s.status.as_str())
        .bind(s.created_at)
        .bind(s.updated_at)
        .bind(s.expire_at)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn update(
        &self,
        url: &str,
        patch: &SessionUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<SeshuSession>> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("UPDATE {} SET updated_at = ", self.table));
        qb.push_bind(now);

        if let Some(v) = &patch.owner_id {
            qb.push(", owner_id = ").push_bind(v.clone());
        }
        if let Some(v) = &patch.url_domain {
            qb.push(", url_domain = ").push_bind(v.clone());
        }
        if let Some(v) = &patch.url_path {
            qb.push(", url_path = ").push_bind(v.clone());
        }
        if let Some(v) = &patch.url_query_params {
            qb.push(", url_query_params = ").push_bind(Json(v.clone()));
        }
        if let Some(v) = &patch.location {
            qb.push(", location = ").push_bind(Json(v.clone()));
        }
        if let Some(v) = &patch.html {
            let html = truncate_to_char_boundary(v, MAX_HTML_BYTES).to_string();
            qb.push(", html = ").push_bind(html);
        }
        if let Some(v) = &patch.child_id {
            qb.push(", child_id = ").push_bind(v.clone());
        }
        if let Some(v) = &patch.event_candidates {
            qb.push(", event_candidates = ").push_bind(Json(v.clone()));
        }
        if let Some(v) = &patch.event_validations {
            qb.push(", event_validations = ").push_bind(Json(v.clone()));
        }
        if let Some(v) = patch.status {
            qb.push(", status = ").push_bind(v.as_str());
        }
        qb.push(" WHERE url = ").push_bind(url.to_string());
        qb.push(" RETURNING *");

        let row = qb
            .build_query_as::<SessionRow>()
            .fetch_optional(&self.pool)
            .await?;

        row.map(SeshuSession::try_from).transpose()
    }

    async fn delete(&self, url: &str) -> Result<bool> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE url = $1", self.table))
            .bind(url)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE expire_at <= $1", self.table))
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 20, 12, 0, 0).unwrap()
    }

    fn draft(url: &str) -> NewSession {
        NewSession {
            owner_id: "owner-1".into(),
            url: url.into(),
            html: "<html>events</html>".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn insert_decomposes_url_and_stamps_times() {
        let store = InMemorySessionStore::new();
        let session = store
            .insert(draft("https://example.com/events?page=2&tag=jazz&tag=blues"), now())
            .await
            .unwrap();

        assert_eq!(session.status, SessionStatus::Draft);
        assert_eq!(session.url_domain, "example.com");
        assert_eq!(session.url_path, "/events");
        assert_eq!(session.url_query_params["tag"], vec!["jazz", "blues"]);
        assert_eq!(session.created_at, now());
        assert_eq!(session.expire_at, now() + Duration::hours(24));
        assert!(session.event_candidates.is_empty());
        assert!(session.event_validations.is_empty());
    }

    #[tokio::test]
    async fn oversized_html_is_truncated() {
        let store = InMemorySessionStore::new();
        let mut new = draft("https://example.com/events");
        new.html = "é".repeat(MAX_HTML_BYTES);

        let session = store.insert(new, now()).await.unwrap();
        assert!(session.html.len() <= MAX_HTML_BYTES);
        assert!(session.html.chars().all(|c| c == 'é'));
    }

    #[tokio::test]
    async fn invalid_url_is_rejected() {
        let store = InMemorySessionStore::new();
        let err = store.insert(draft("not a url"), now()).await.unwrap_err();
        assert!(matches!(err, SeshuError::Validation(_)));
        let err = store.insert(draft(""), now()).await.unwrap_err();
        assert!(matches!(err, SeshuError::Validation(_)));
    }

    #[tokio::test]
    async fn update_patches_present_fields_and_restamps() {
        let store = InMemorySessionStore::new();
        let url = "https://example.com/events";
        store.insert(draft(url), now()).await.unwrap();

        let later = now() + Duration::minutes(5);
        let patch = SessionUpdate {
            event_validations: Some(vec![FieldValidation::default()]),
            html: Some(String::new()),
            ..Default::default()
        };
        let once = store.update(url, &patch, later).await.unwrap().unwrap();
        let twice = store.update(url, &patch, later).await.unwrap().unwrap();

        assert_eq!(once, twice);
        assert_eq!(twice.html, "");
        assert_eq!(twice.owner_id, "owner-1");
        assert_eq!(twice.event_validations.len(), 1);
        assert_eq!(twice.updated_at, later);
        assert_eq!(twice.created_at, now());
    }

    #[tokio::test]
    async fn oversized_html_patch_is_truncated() {
        let store = InMemorySessionStore::new();
        let url = "https://example.com/events";
        store.insert(draft(url), now()).await.unwrap();

        let patch = SessionUpdate {
            html: Some("é".repeat(MAX_HTML_BYTES)),
            ..Default::default()
        };
        let updated = store.update(url, &patch, now()).await.unwrap().unwrap();
        assert!(updated.html.len() <= MAX_HTML_BYTES);
        assert!(updated.html.len() > MAX_HTML_BYTES - 2);
        assert!(updated.html.chars().all(|c| c == 'é'));
    }

    #[tokio::test]
    async fn update_of_missing_session_is_none() {
        let store = InMemorySessionStore::new();
        let patch = SessionUpdate::default();
        assert!(store
            .update("https://example.com/nope", &patch, now())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn expired_drafts_are_hidden_and_purged() {
        let store = InMemorySessionStore::new();
        store.insert(draft("https://example.com/old"), now()).await.unwrap();
        let tomorrow = now() + Duration::hours(25);
        store.insert(draft("https://example.com/new"), tomorrow).await.unwrap();

        assert!(store.get("https://example.com/old", tomorrow).await.unwrap().is_none());
        assert_eq!(store.purge_expired(tomorrow).await.unwrap(), 1);
        assert!(store.get("https://example.com/new", tomorrow).await.unwrap().is_some());
        assert!(!store.delete("https://example.com/old").await.unwrap());
    }
}
