use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CrawlError;

/// Tenant entitlement band, used by the priority policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Hobby,
    Standard,
    Growth,
    Scale,
}

impl Plan {
    pub fn parse(value: &str) -> Result<Self, CrawlError> {
        match value {
            "free" => Ok(Plan::Free),
            "hobby" => Ok(Plan::Hobby),
            "standard" => Ok(Plan::Standard),
            "growth" => Ok(Plan::Growth),
            "scale" => Ok(Plan::Scale),
            other => Err(CrawlError::Validation(format!("unknown plan: {}", other))),
        }
    }
}

/// Tenant identity attached to a crawl at submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub tenant_id: String,
    pub plan: Plan,
}

/// Crawl-wide policy. All fields optional at the submission surface;
/// normalized here with defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerOptions {
    /// Regex sources applied to the URL path; when non-empty, a path must
    /// match at least one to be crawled.
    pub includes: Vec<String>,

    /// Regex sources applied to the URL path; any match rejects the URL.
    pub excludes: Vec<String>,

    /// Maximum link depth, relative to the seed URL's own path depth.
    pub max_depth: usize,

    /// Cap on links discovered during crawling.
    pub max_crawled_links: usize,

    /// Overall page cap for the crawl.
    pub limit: usize,

    /// When true (the default), skip the sitemap and enqueue the seed only.
    pub ignore_sitemap: bool,

    /// Allow discovered links on hosts other than the seed's.
    pub allow_external_links: bool,

    /// Emit discovered URLs without page content.
    pub return_only_urls: bool,

    pub mode: CrawlMode,
}

impl Default for CrawlerOptions {
    fn default() -> Self {
        Self {
            includes: Vec::new(),
            excludes: Vec::new(),
            max_depth: 10,
            max_crawled_links: 1000,
            limit: 10000,
            ignore_sitemap: true,
            allow_external_links: false,
            return_only_urls: false,
            mode: CrawlMode::Default,
        }
    }
}

impl CrawlerOptions {
    /// Compile both pattern sets, failing submission on the first invalid
    /// source. Patterns arrive as either comma-strings or arrays at the
    /// ingress; by this point they are normalized to a vec of sources.
    pub fn compile_patterns(&self) -> Result<CompiledPatterns, CrawlError> {
        Ok(CompiledPatterns {
            includes: compile_set(&self.includes)?,
            excludes: compile_set(&self.excludes)?,
        })
    }
}

fn compile_set(sources: &[String]) -> Result<Vec<Regex>, CrawlError> {
    sources
        .iter()
        .map(|source| {
            Regex::new(source)
                .map_err(|e| CrawlError::Validation(format!("invalid pattern '{}': {}", source, e)))
        })
        .collect()
}

/// Include/exclude sets compiled once per crawl.
#[derive(Debug, Clone)]
pub struct CompiledPatterns {
    pub includes: Vec<Regex>,
    pub excludes: Vec<Regex>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlMode {
    Default,
    Fast,
}

/// Per-page scraping policy, frozen into each job at submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageOptions {
    pub include_markdown: bool,
    pub include_raw_html: bool,
    pub include_links: bool,
    pub only_include_tags: Vec<String>,
    pub remove_tags: Vec<String>,
    /// Extra render settle time in milliseconds, added to the base timeout.
    pub wait_for: u64,
    pub headers: HashMap<String, String>,
    pub parse_pdf: bool,
    pub screenshot: bool,
    pub full_page_screenshot: bool,
    pub replace_all_paths_with_absolute_paths: bool,
    pub use_fast_mode: bool,
    pub disable_js_dom: bool,
}

/// The persistent record of a crawl. Created at submission and immutable
/// thereafter, apart from the cancellation flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCrawl {
    pub id: String,
    pub origin_url: String,
    pub crawler_options: CrawlerOptions,
    pub page_options: PageOptions,
    pub tenant_id: String,
    pub plan: Plan,
    /// Millisecond timestamp.
    pub created_at: i64,
    /// Text of the seed host's robots.txt, when it could be retrieved.
    pub robots: Option<String>,
    pub cancelled: bool,
    pub webhook_urls: Vec<String>,
    pub webhook_metadata: Option<Value>,
}

/// The only runtime job mode; `crawl` submissions expand into many
/// `single_urls` jobs before they reach the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobMode {
    #[serde(rename = "single_urls")]
    SingleUrls,
}

/// One URL to fetch; the unit of queue work. Carries frozen copies of the
/// crawl policy so workers need no extra lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub crawl_id: String,
    pub url: String,
    pub mode: JobMode,
    /// Lower is sooner.
    pub priority: i32,
    /// Set when the URL came from the seed host's sitemap.
    pub sitemapped: bool,
    pub tenant_id: String,
    pub plan: Plan,
    pub crawler_options: CrawlerOptions,
    pub page_options: PageOptions,
    pub sitemap: Option<SitemapMeta>,
    pub webhook_urls: Vec<String>,
    pub webhook_metadata: Option<Value>,
}

/// Sitemap hints carried through to the emitted document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SitemapMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changefreq: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lastmod: Option<String>,
}

/// Output record per page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub markdown: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub links: Option<Vec<String>>,
    pub metadata: DocumentMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(rename = "sourceURL")]
    pub source_url: String,
    #[serde(rename = "pageStatusCode", skip_serializing_if = "Option::is_none")]
    pub page_status_code: Option<u16>,
    #[serde(rename = "pageError", skip_serializing_if = "Option::is_none")]
    pub page_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sitemap: Option<SitemapMeta>,
}

/// Per-job progress payload; `current`/`total` are per-crawl counters and
/// `total` grows monotonically while discovery enqueues more URLs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub current: u64,
    pub total: u64,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_document_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_document: Option<Document>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = CrawlerOptions::default();
        assert_eq!(options.max_depth, 10);
        assert_eq!(options.max_crawled_links, 1000);
        assert_eq!(options.limit, 10000);
        assert!(options.ignore_sitemap);
        assert!(!options.allow_external_links);
    }

    #[test]
    fn test_compile_patterns_rejects_invalid_regex() {
        let options = CrawlerOptions {
            includes: vec!["^/docs".to_string(), "[unclosed".to_string()],
            ..Default::default()
        };
        let err = options.compile_patterns().unwrap_err();
        assert!(matches!(err, CrawlError::Validation(_)));
    }

    #[test]
    fn test_plan_parse() {
        assert_eq!(Plan::parse("growth").unwrap(), Plan::Growth);
        assert!(Plan::parse("platinum").is_err());
    }

    #[test]
    fn test_job_mode_wire_format() {
        let json = serde_json::to_string(&JobMode::SingleUrls).unwrap();
        assert_eq!(json, "\"single_urls\"");
    }

    #[test]
    fn test_document_metadata_wire_names() {
        let metadata = DocumentMetadata {
            source_url: "https://ex.com/a".to_string(),
            page_status_code: Some(200),
            page_error: None,
            sitemap: None,
        };
        let json = serde_json::to_value(&metadata).unwrap();
        assert!(json.get("sourceURL").is_some());
        assert!(json.get("pageStatusCode").is_some());
        assert!(json.get("pageError").is_none());
    }
}
