use std::env;

use tracing::info;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Postgres
    pub database_url: String,
    pub sessions_table: String,
    pub jobs_table: String,
    pub queue_table: String,
    pub queue_subject: String,

    // Rendering fetch service
    pub scrapingbee_api_key: String,
    pub scrapingbee_base_url: String,

    // Text understanding
    pub openai_api_key: String,
    pub openai_model: String,

    // Scheduling
    pub time_compression_ratio: f64,
    pub gather_interval_secs: u64,
    pub poll_interval_secs: u64,
}

impl Config {
    /// Load configuration from environment variables.
    /// Panics with a clear message if required vars are missing.
    pub fn from_env() -> Self {
        Self {
            database_url: required_env("DATABASE_URL"),
            sessions_table: env_or("SESHU_SESSIONS_TABLE", "seshu_sessions"),
            jobs_table: env_or("SESHU_JOBS_TABLE", "seshu_jobs"),
            queue_table: env_or("SESHU_QUEUE_TABLE", "seshu_queue"),
            queue_subject: env_or("SESHU_QUEUE_SUBJECT", "seshu.jobs.scrape"),
            scrapingbee_api_key: required_env("SCRAPINGBEE_API_KEY"),
            scrapingbee_base_url: env_or(
                "SCRAPINGBEE_API_URL_BASE",
                "https://app.scrapingbee.com/api/v1",
            ),
            openai_api_key: required_env("OPENAI_API_KEY"),
            openai_model: env_or("OPENAI_MODEL", "gpt-4o-mini"),
            time_compression_ratio: env_or("TIME_COMPRESSION_RATIO", "1.0")
                .parse()
                .expect("TIME_COMPRESSION_RATIO must be a number"),
            gather_interval_secs: env_or("SESHU_GATHER_INTERVAL_SECONDS", "3600")
                .parse()
                .expect("SESHU_GATHER_INTERVAL_SECONDS must be a whole number"),
            poll_interval_secs: env_or("SESHU_POLL_INTERVAL_SECONDS", "5")
                .parse()
                .expect("SESHU_POLL_INTERVAL_SECONDS must be a whole number"),
        }
    }

    /// Log the effective configuration with secrets masked.
    pub fn log_redacted(&self) {
        info!(
            database_url = %redact(&self.database_url),
            sessions_table = %self.sessions_table,
            jobs_table = %self.jobs_table,
            queue_table = %self.queue_table,
            queue_subject = %self.queue_subject,
            scrapingbee_base_url = %self.scrapingbee_base_url,
            scrapingbee_api_key = %redact(&self.scrapingbee_api_key),
            openai_model = %self.openai_model,
            openai_api_key = %redact(&self.openai_api_key),
            time_compression_ratio = self.time_compression_ratio,
            gather_interval_secs = self.gather_interval_secs,
            "Loaded configuration"
        );
    }
}

fn required_env(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| panic!("{key} environment variable is required"))
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Keep the first four characters so operators can tell keys apart.
fn redact(secret: &str) -> String {
    if secret.is_empty() {
        return "<unset>".to_string();
    }
    let prefix: String = secret.chars().take(4).collect();
    format!("{prefix}****")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_keeps_short_prefix() {
        assert_eq!(redact("sk-abcdef123"), "sk-a****");
        assert_eq!(redact(""), "<unset>");
    }
}
