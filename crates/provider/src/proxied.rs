//! Search provider reached through an HTTP scraping proxy.
//!
//! The inner search URL (carrying the search key) is URL-encoded into the
//! proxy's `url` parameter; the proxy key goes alongside it. Only the proxy's
//! HTTP status is trusted here. What the search provider meant is decided by
//! `payload::classify_payload` on the returned body.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::Url;
use tracing::debug;

use crate::{FetchError, FetchRequest, SearchBackend};

/// Catch-all search database.
const ALL_DATABASES: &str = "999";
/// JSON output mode.
const OUTPUT_JSON: &str = "2";

pub struct ProxiedSearchBackend {
    client: reqwest::Client,
    search_endpoint: String,
    proxy_endpoint: String,
    timeout: Duration,
    results: u32,
}

impl ProxiedSearchBackend {
    pub fn new(
        client: reqwest::Client,
        search_endpoint: impl Into<String>,
        proxy_endpoint: impl Into<String>,
        timeout: Duration,
        results: u32,
    ) -> Self {
        Self {
            client,
            search_endpoint: search_endpoint.into(),
            proxy_endpoint: proxy_endpoint.into(),
            timeout,
            results,
        }
    }

    /// Build the proxy URL wrapping the search URL.
    fn build_url(&self, request: &FetchRequest<'_>) -> Result<Url, FetchError> {
        let results = self.results.to_string();
        let inner = Url::parse_with_params(
            &self.search_endpoint,
            &[
                ("db", ALL_DATABASES),
                ("output_type", OUTPUT_JSON),
                ("numres", results.as_str()),
                ("url", request.image_url),
                ("api_key", request.search_key.expose().as_str()),
            ],
        )
        .map_err(|e| FetchError::Transport(format!("invalid search endpoint: {e}")))?;

        Url::parse_with_params(
            &self.proxy_endpoint,
            &[
                ("api_key", request.proxy_key.expose().as_str()),
                ("url", inner.as_str()),
            ],
        )
        .map_err(|e| FetchError::Transport(format!("invalid proxy endpoint: {e}")))
    }
}

impl SearchBackend for ProxiedSearchBackend {
    fn id(&self) -> &str {
        "proxied"
    }

    fn fetch<'a>(
        &'a self,
        request: FetchRequest<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<String, FetchError>> + Send + 'a>> {
        Box::pin(async move {
            let url = self.build_url(&request)?;
            debug!(
                search_key = %request.search_key.preview(),
                proxy_key = %request.proxy_key.preview(),
                "fetching through proxy"
            );

            let response = self
                .client
                .get(url)
                .timeout(self.timeout)
                .send()
                .await
                .map_err(map_reqwest_error)?;

            let status = response.status();
            let body = response.text().await.map_err(map_reqwest_error)?;

            if !status.is_success() {
                debug!(status = status.as_u16(), "proxy stage returned non-success status");
                return Err(FetchError::Status {
                    status: status.as_u16(),
                    body,
                });
            }

            Ok(body)
        })
    }
}

/// Strip the URL (it carries both secrets) before the error can reach a log.
fn map_reqwest_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Transport(e.without_url().to_string())
    }
}
