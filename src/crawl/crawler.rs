use std::sync::Arc;

use anyhow::Result;
use scraper::{Html, Selector};
use tracing::debug;
use url::Url;

use crate::crawl::policy;
use crate::crawl::types::{CompiledPatterns, StoredCrawl};
use crate::error::CrawlError;
use crate::site::robots;
use crate::storage::store::CrawlStore;

/// Lifecycle of a single URL within a crawl.
///
/// `Unseen → Locked` happens through the atomic lock (losing the race
/// means `Skipped`), `Locked → Fetching` when a worker dequeues the job,
/// and `Fetching` ends in `Emitted` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlState {
    Unseen,
    Locked,
    Fetching,
    Emitted,
    Skipped,
    Failed,
}

impl UrlState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UrlState::Unseen => "unseen",
            UrlState::Locked => "locked",
            UrlState::Fetching => "fetching",
            UrlState::Emitted => "emitted",
            UrlState::Skipped => "skipped",
            UrlState::Failed => "failed",
        }
    }
}

/// A discovered URL that passed the policy filter and won its lock.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Canonical URL used for fetching.
    pub url: String,
    /// Lock-set key (www-collapsed).
    pub lock_key: String,
}

enum Rejection {
    Invalid,
    Scheme,
    Depth,
    ExternalHost,
    RobotsDenied,
    PatternMismatch,
}

impl Rejection {
    fn reason(&self) -> &'static str {
        match self {
            Rejection::Invalid => "unparseable",
            Rejection::Scheme => "non-http scheme",
            Rejection::Depth => "over depth budget",
            Rejection::ExternalHost => "external host",
            Rejection::RobotsDenied => "robots disallow",
            Rejection::PatternMismatch => "include/exclude mismatch",
        }
    }
}

/// Link discovery for one crawl: extracts outbound URLs from fetched HTML
/// and claims the ones that survive the crawl policy.
pub struct LinkDiscovery {
    crawl_id: String,
    seed_host: String,
    max_depth: usize,
    enqueue_cap: usize,
    allow_external: bool,
    patterns: CompiledPatterns,
    robots: Option<String>,
    user_agent: String,
}

impl LinkDiscovery {
    pub fn new(crawl: &StoredCrawl, user_agent: &str) -> Result<Self, CrawlError> {
        let seed = Url::parse(&crawl.origin_url)
            .map_err(|e| CrawlError::Validation(format!("invalid seed URL: {}", e)))?;
        let seed_host = seed
            .host_str()
            .ok_or_else(|| CrawlError::Validation("seed URL has no host".to_string()))?
            .trim_start_matches("www.")
            .to_string();

        let options = &crawl.crawler_options;

        Ok(Self {
            crawl_id: crawl.id.clone(),
            seed_host,
            max_depth: policy::adjusted_max_depth(&crawl.origin_url, options.max_depth),
            enqueue_cap: options.limit.min(options.max_crawled_links),
            allow_external: options.allow_external_links,
            patterns: options.compile_patterns()?,
            robots: crawl.robots.clone(),
            user_agent: user_agent.to_string(),
        })
    }

    /// Absolute outbound URLs in document order.
    pub fn extract_links(&self, html: &str, base: &Url) -> Vec<String> {
        let document = Html::parse_document(html);
        let selector = Selector::parse("a[href]").expect("static selector");

        document
            .select(&selector)
            .filter_map(|element| element.value().attr("href"))
            .filter_map(|href| base.join(href).ok())
            .map(|absolute| absolute.to_string())
            .collect()
    }

    /// Run one page's discovered links through the policy filter and the
    /// lock set, in document order. Returns the candidates this caller
    /// claimed; everything else is silently skipped.
    pub async fn discover(
        &self,
        store: &Arc<dyn CrawlStore>,
        html: &str,
        base: &Url,
    ) -> Result<Vec<Candidate>> {
        let mut claimed = Vec::new();

        for link in self.extract_links(html, base) {
            let candidate = match self.filter_candidate(&link) {
                Ok(candidate) => candidate,
                Err(rejection) => {
                    debug!("Rejected {} ({})", link, rejection.reason());
                    continue;
                }
            };

            // The cap bounds total enqueued URLs, checked against the lock
            // set so racing workers cannot blow past it together
            if store.lock_count(&self.crawl_id).await? as usize >= self.enqueue_cap {
                debug!("Enqueue cap reached for crawl {}", self.crawl_id);
                break;
            }

            if !store.lock_url(&self.crawl_id, &candidate.lock_key).await? {
                debug!("Skipping already locked URL: {}", candidate.url);
                continue;
            }

            claimed.push(candidate);
        }

        Ok(claimed)
    }

    /// Policy filter for a single candidate URL. Rejections are silent
    /// control flow; the URL simply does not enter the lock set.
    fn filter_candidate(&self, link: &str) -> Result<Candidate, Rejection> {
        let normalized = policy::normalize_url(link);
        let parsed = Url::parse(&normalized).map_err(|_| Rejection::Invalid)?;

        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(Rejection::Scheme);
        }

        if policy::url_depth(&normalized) > self.max_depth {
            return Err(Rejection::Depth);
        }

        let host = parsed.host_str().ok_or(Rejection::Invalid)?;
        if !self.allow_external && host.trim_start_matches("www.") != self.seed_host {
            return Err(Rejection::ExternalHost);
        }

        if let Some(robots) = &self.robots {
            if !robots::is_allowed(robots, &self.user_agent, normalized.as_str()) {
                return Err(Rejection::RobotsDenied);
            }
        }

        if !policy::matches_patterns(
            parsed.path(),
            &self.patterns.includes,
            &self.patterns.excludes,
        ) {
            return Err(Rejection::PatternMismatch);
        }

        Ok(Candidate {
            lock_key: policy::lock_key(&normalized),
            url: normalized,
        })
    }
}
