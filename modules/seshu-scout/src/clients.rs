//! Process-wide client handles, built once and shared.

use std::sync::Arc;

use ai_client::OpenAi;
use scraping_client::ScrapingClient;
use seshu_common::error::Result;
use seshu_common::{Config, SeshuError};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::OnceCell;
use tracing::info;

use crate::fetch::ScrapingBeeFetcher;
use crate::queue::PgQueue;
use crate::store::{PgJobStore, PgSessionStore};

/// Owns the configuration and the lazily opened database pool. Construct one
/// per process and hand it to whatever needs a client.
pub struct Clients {
    config: Config,
    pool: OnceCell<PgPool>,
}

impl Clients {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            pool: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Connects on first call; later calls reuse the same pool.
    pub async fn pool(&self) -> Result<&PgPool> {
        self.pool
            .get_or_try_init(|| async {
                if self.config.database_url.is_empty() {
                    return Err(SeshuError::Config("DATABASE_URL is empty".into()));
                }
                let pool = PgPoolOptions::new()
                    .max_connections(8)
                    .connect(&self.config.database_url)
                    .await?;
                info!("Connected to database");
                Ok(pool)
            })
            .await
    }

    pub async fn session_store(&self) -> Result<PgSessionStore> {
        PgSessionStore::new(self.pool().await?.clone(), &self.config.sessions_table)
    }

    pub async fn job_store(&self) -> Result<PgJobStore> {
        PgJobStore::new(self.pool().await?.clone(), &self.config.jobs_table)
    }

    pub async fn queue(&self) -> Result<PgQueue> {
        PgQueue::new(
            self.pool().await?.clone(),
            &self.config.queue_table,
            &self.config.queue_subject,
        )
    }

    pub fn fetcher(&self) -> Result<ScrapingBeeFetcher> {
        let client = ScrapingClient::new(
            &self.config.scrapingbee_base_url,
            &self.config.scrapingbee_api_key,
        )
        .map_err(|e| SeshuError::Config(e.to_string()))?;
        Ok(ScrapingBeeFetcher::new(client))
    }

    pub fn interpreter(&self) -> Result<Arc<OpenAi>> {
        OpenAi::new(&self.config.openai_api_key, &self.config.openai_model)
            .map(Arc::new)
            .map_err(|e| SeshuError::Config(e.to_string()))
    }
}
