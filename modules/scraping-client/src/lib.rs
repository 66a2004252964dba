pub mod error;

pub use error::{Result, ScrapingError};

use std::time::Duration;

use tracing::debug;

/// The rendering service gives up after 140s; the HTTP timeout matches it.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(140);

/// Render parameters forwarded to the fetch service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderOptions {
    /// Milliseconds the headless browser waits after load. Zero omits the parameter.
    pub wait_ms: u32,
    pub render_js: bool,
    /// CSS selector the browser waits for before returning the DOM.
    pub wait_for: Option<String>,
}

pub struct ScrapingClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl ScrapingClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        if base_url.trim().is_empty() {
            return Err(ScrapingError::Config("scraping base URL is empty".into()));
        }
        if api_key.trim().is_empty() {
            return Err(ScrapingError::Config("scraping API key is empty".into()));
        }

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ScrapingError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    /// Fetch the rendered HTML body for `url`.
    ///
    /// `url` must be passed unescaped; the client escapes it once when building
    /// the query string.
    pub async fn content(&self, url: &str, options: &RenderOptions) -> Result<String> {
        ensure_unescaped(url)?;

        let mut query: Vec<(&str, String)> = vec![
            ("api_key", self.api_key.clone()),
            ("url", url.to_string()),
        ];
        if options.render_js {
            query.push(("render_js", "true".to_string()));
        }
        if options.wait_ms > 0 {
            query.push(("wait", options.wait_ms.to_string()));
        }
        if let Some(selector) = options.wait_for.as_deref().filter(|s| !s.is_empty()) {
            query.push(("wait_for", selector.to_string()));
        }

        debug!(
            url,
            render_js = options.render_js,
            wait_ms = options.wait_ms,
            "Requesting rendered page"
        );

        let resp = self.client.get(&self.base_url).query(&query).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ScrapingError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(resp.text().await?)
    }
}

/// Reject a URL that still contains percent-escapes.
fn ensure_unescaped(url: &str) -> Result<()> {
    let changed = match urlencoding::decode(url) {
        Ok(decoded) => decoded != url,
        Err(_) => true,
    };
    if changed {
        return Err(ScrapingError::EncodedUrl(format!(
            "{url} (expected something like 'https://example.com/path?query=value')"
        )));
    }
    Ok(())
}
