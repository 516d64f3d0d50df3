use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::cli::config::FetchSettings;
use crate::crawl::types::PageOptions;
use crate::error::CrawlError;
use crate::fetch::{map_request_error, FetchResponse, PageFetcher};

#[derive(Debug, Clone, Serialize)]
struct RenderRequest<'a> {
    url: &'a str,
    wait_after_load: u64,
    headers: &'a HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RenderResponse {
    #[serde(default)]
    content: String,
    #[serde(rename = "pageStatusCode")]
    page_status_code: Option<u16>,
    #[serde(rename = "pageError")]
    page_error: Option<String>,
}

/// Fetcher backed by the headless rendering service.
pub struct RenderingFetcher {
    client: Client,
    service_url: String,
    base_timeout: Duration,
}

impl RenderingFetcher {
    pub fn new(settings: &FetchSettings) -> Self {
        let client = Client::builder().build().unwrap_or_default();

        Self {
            client,
            service_url: settings.render_service_url.clone(),
            base_timeout: Duration::from_millis(settings.base_timeout_ms),
        }
    }
}

#[async_trait]
impl PageFetcher for RenderingFetcher {
    async fn fetch(&self, url: &str, options: &PageOptions) -> Result<FetchResponse, CrawlError> {
        let request = RenderRequest {
            url,
            wait_after_load: options.wait_for,
            headers: &options.headers,
        };

        // The render timeout covers the page's own settle time
        let timeout = self.base_timeout + Duration::from_millis(options.wait_for);

        debug!("Rendering {} via {}", url, self.service_url);

        let response = self
            .client
            .post(&self.service_url)
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(map_request_error)?;

        let status = response.status();
        if !status.is_success() {
            // A failing rendering service is reported on the document, with
            // the upstream status code attached
            return Ok(FetchResponse {
                content: String::new(),
                page_status_code: Some(status.as_u16()),
                page_error: Some(format!("rendering service returned status {}", status.as_u16())),
            });
        }

        let rendered: RenderResponse = response.json().await.map_err(|e| {
            CrawlError::PermanentFetch(format!("malformed rendering service response: {}", e))
        })?;

        Ok(FetchResponse {
            content: rendered.content,
            page_status_code: rendered.page_status_code,
            page_error: rendered.page_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_request_wire_format() {
        let headers = HashMap::from([("X-Auth".to_string(), "token".to_string())]);
        let request = RenderRequest {
            url: "https://ex.com/a",
            wait_after_load: 250,
            headers: &headers,
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["url"], "https://ex.com/a");
        assert_eq!(json["wait_after_load"], 250);
        assert_eq!(json["headers"]["X-Auth"], "token");
    }

    #[test]
    fn test_render_response_parses_camel_case() {
        let body = r#"{"content":"<html></html>","pageStatusCode":200,"pageError":null}"#;
        let parsed: RenderResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.page_status_code, Some(200));
        assert!(parsed.page_error.is_none());
        assert_eq!(parsed.content, "<html></html>");
    }

    #[test]
    fn test_render_response_tolerates_missing_content() {
        let body = r#"{"pageStatusCode":500,"pageError":"boom"}"#;
        let parsed: RenderResponse = serde_json::from_str(body).unwrap();
        assert!(parsed.content.is_empty());
        assert_eq!(parsed.page_error.as_deref(), Some("boom"));
    }
}
