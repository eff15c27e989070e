use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{header::ACCEPT, Client};
use shared::{error::CsrfError, protocol::CsrfResponse};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

#[async_trait]
pub trait CsrfSource: Send + Sync {
    async fn fetch_csrf_token(&self) -> Result<String, CsrfError>;
}

/// Fetches anti-forgery tokens with `PATCH /csrf`.
pub struct HttpCsrfSource {
    http: Client,
    url: String,
}

impl HttpCsrfSource {
    pub fn new(http: Client, base_url: &Url) -> Self {
        Self {
            http,
            url: format!("{}/csrf", base_url.as_str().trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl CsrfSource for HttpCsrfSource {
    async fn fetch_csrf_token(&self) -> Result<String, CsrfError> {
        let response: CsrfResponse = self
            .http
            .patch(&self.url)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| CsrfError::FetchFailed(e.to_string()))?
            .error_for_status()
            .map_err(|e| CsrfError::FetchFailed(e.to_string()))?
            .json()
            .await
            .map_err(|e| CsrfError::FetchFailed(format!("invalid csrf payload: {e}")))?;

        if response.csrf_token.trim().is_empty() {
            return Err(CsrfError::FetchFailed("server returned an empty token".into()));
        }
        Ok(response.csrf_token)
    }
}

/// Caches one CSRF token per client and fetches it lazily.
///
/// The cache lock is held for the whole fetch, so callers that arrive while
/// the first fetch is in flight queue behind it and read its result instead
/// of starting their own.
pub struct CsrfGuard {
    source: Arc<dyn CsrfSource>,
    cached: Mutex<Option<String>>,
}

impl CsrfGuard {
    pub fn new(source: Arc<dyn CsrfSource>) -> Self {
        Self {
            source,
            cached: Mutex::new(None),
        }
    }

    pub async fn ensure_token(&self) -> Result<String, CsrfError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }

        let token = self.source.fetch_csrf_token().await.map_err(|err| {
            warn!(%err, "csrf: fetch failed");
            err
        })?;
        debug!("csrf: token cached");
        *cached = Some(token.clone());
        Ok(token)
    }

    pub async fn invalidate(&self) {
        if self.cached.lock().await.take().is_some() {
            debug!("csrf: token invalidated");
        }
    }

    /// Drops the cached token only if it is still the one the server just
    /// rejected; a token refreshed in the meantime is kept.
    pub async fn invalidate_stale(&self, rejected: &str) {
        let mut cached = self.cached.lock().await;
        if cached.as_deref() == Some(rejected) {
            *cached = None;
            debug!("csrf: rejected token invalidated");
        }
    }

    pub async fn cached_token(&self) -> Option<String> {
        self.cached.lock().await.clone()
    }
}

#[cfg(test)]
#[path = "tests/csrf_tests.rs"]
mod tests;
