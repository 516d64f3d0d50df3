pub mod direct;
pub mod render;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::crawl::types::PageOptions;
use crate::error::CrawlError;

// Re-export common types
pub use direct::DirectFetcher;
pub use render::RenderingFetcher;

/// What both fetch backends return. HTTP-level failures land here as
/// `page_error`; only network-level problems surface as errors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchResponse {
    pub content: String,
    pub page_status_code: Option<u16>,
    pub page_error: Option<String>,
}

impl FetchResponse {
    /// A 5xx answer is worth retrying even though it parsed cleanly.
    pub fn is_transient_failure(&self) -> bool {
        matches!(self.page_status_code, Some(code) if code >= 500)
    }
}

/// A page fetch backend. The rendering fetcher is the default; the direct
/// fetcher serves fast mode and binary documents.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str, options: &PageOptions) -> Result<FetchResponse, CrawlError>;
}

/// Shared error mapping for reqwest failures: timeouts get a stable
/// message, everything else preserves the original error text.
pub(crate) fn map_request_error(error: reqwest::Error) -> CrawlError {
    if error.is_timeout() {
        CrawlError::TransientFetch("Request timed out".to_string())
    } else {
        CrawlError::TransientFetch(error.to_string())
    }
}
