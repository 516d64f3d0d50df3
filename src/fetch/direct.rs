use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::cli::config::FetchSettings;
use crate::crawl::types::PageOptions;
use crate::error::CrawlError;
use crate::fetch::{map_request_error, FetchResponse, PageFetcher};

/// Plain HTTP GET fetcher. Each worker owns one instance so the cookie
/// jar is per-worker, never shared.
pub struct DirectFetcher {
    client: Client,
    base_timeout: Duration,
}

impl DirectFetcher {
    pub fn new(settings: &FetchSettings) -> Self {
        let client = Client::builder()
            .cookie_store(true)
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_timeout: Duration::from_millis(settings.base_timeout_ms),
        }
    }
}

#[async_trait]
impl PageFetcher for DirectFetcher {
    async fn fetch(&self, url: &str, options: &PageOptions) -> Result<FetchResponse, CrawlError> {
        let timeout = self.base_timeout + Duration::from_millis(options.wait_for);

        debug!("Fetching {} directly", url);

        let mut request = self.client.get(url).timeout(timeout);
        for (name, value) in &options.headers {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(map_request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Ok(FetchResponse {
                content: String::new(),
                page_status_code: Some(status.as_u16()),
                page_error: Some(
                    status
                        .canonical_reason()
                        .unwrap_or("request failed")
                        .to_string(),
                ),
            });
        }

        // Content is returned raw; no automatic JSON parsing
        let content = response.text().await.map_err(map_request_error)?;

        Ok(FetchResponse {
            content,
            page_status_code: Some(status.as_u16()),
            page_error: None,
        })
    }
}
