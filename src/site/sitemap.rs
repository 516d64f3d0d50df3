use std::io::Cursor;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use sitemap::reader::{SiteMapEntity, SiteMapReader};
use sitemap::structs::ChangeFreq;
use tracing::{debug, warn};
use url::Url;

use crate::cli::config::SiteSettings;
use crate::crawl::types::SitemapMeta;

/// One urlset entry, with the optional hints sitemaps may carry.
#[derive(Debug, Clone)]
pub struct SitemapEntry {
    pub loc: String,
    pub changefreq: Option<String>,
    pub priority: Option<f32>,
    pub lastmod: Option<String>,
}

impl SitemapEntry {
    pub fn meta(&self) -> SitemapMeta {
        SitemapMeta {
            changefreq: self.changefreq.clone(),
            priority: self.priority,
            lastmod: self.lastmod.clone(),
        }
    }
}

/// Sitemap retrieval seam; the coordinator takes this as an injected
/// dependency.
#[async_trait]
pub trait SitemapFetcher: Send + Sync {
    /// All urlset entries reachable from the seed host's sitemap. Empty on
    /// any error.
    async fn try_get_sitemap(&self, seed: &Url) -> Vec<SitemapEntry>;
}

/// Sitemap client. Resolves sitemap indexes recursively up to a fetch cap;
/// any failure yields an empty list rather than an error.
pub struct SitemapClient {
    client: Client,
    user_agent: String,
    max_fetches: usize,
}

impl SitemapClient {
    pub fn new(settings: &SiteSettings, user_agent: &str) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.sitemap_timeout_ms))
            .build()
            .unwrap_or_default();

        Self {
            client,
            user_agent: user_agent.to_string(),
            max_fetches: settings.max_sitemap_fetches,
        }
    }

    async fn fetch(&self, sitemap_url: &str) -> Option<Vec<u8>> {
        let response = self
            .client
            .get(sitemap_url)
            .header("User-Agent", &self.user_agent)
            .send()
            .await
            .ok()?;

        if !response.status().is_success() {
            debug!("Sitemap fetch failed: {} ({})", sitemap_url, response.status());
            return None;
        }

        response.bytes().await.ok().map(|bytes| bytes.to_vec())
    }
}

#[async_trait]
impl SitemapFetcher for SitemapClient {
    async fn try_get_sitemap(&self, seed: &Url) -> Vec<SitemapEntry> {
        let Some(host) = seed.host_str() else {
            return Vec::new();
        };
        let root = format!("{}://{}/sitemap.xml", seed.scheme(), host);

        let mut entries = Vec::new();
        let mut queue = vec![root];
        let mut fetched = 0;

        while let Some(sitemap_url) = queue.pop() {
            if fetched >= self.max_fetches {
                warn!("Sitemap fetch cap reached for {}", host);
                break;
            }
            fetched += 1;

            let Some(body) = self.fetch(&sitemap_url).await else {
                continue;
            };

            let (urls, nested) = parse_sitemap(&body);
            debug!(
                "Parsed {}: {} URLs, {} nested sitemaps",
                sitemap_url,
                urls.len(),
                nested.len()
            );

            entries.extend(urls);
            queue.extend(nested);
        }

        entries
    }
}

/// Parse sitemap XML into urlset entries and nested sitemap locations.
pub fn parse_sitemap(xml: &[u8]) -> (Vec<SitemapEntry>, Vec<String>) {
    let mut urls = Vec::new();
    let mut nested = Vec::new();

    let parser = SiteMapReader::new(Cursor::new(xml));
    for entity in parser {
        match entity {
            SiteMapEntity::Url(entry) => {
                let Some(loc) = entry.loc.get_url() else {
                    continue;
                };
                urls.push(SitemapEntry {
                    loc: loc.to_string(),
                    changefreq: changefreq_name(entry.changefreq),
                    priority: entry.priority.get_priority(),
                    lastmod: entry.lastmod.get_time().map(|time| time.to_rfc3339()),
                });
            }
            SiteMapEntity::SiteMap(entry) => {
                if let Some(loc) = entry.loc.get_url() {
                    nested.push(loc.to_string());
                }
            }
            SiteMapEntity::Err(error) => {
                debug!("Sitemap parse error: {}", error);
            }
        }
    }

    (urls, nested)
}

fn changefreq_name(changefreq: ChangeFreq) -> Option<String> {
    let name = match changefreq {
        ChangeFreq::Always => "always",
        ChangeFreq::Hourly => "hourly",
        ChangeFreq::Daily => "daily",
        ChangeFreq::Weekly => "weekly",
        ChangeFreq::Monthly => "monthly",
        ChangeFreq::Yearly => "yearly",
        ChangeFreq::Never => "never",
        _ => return None,
    };
    Some(name.to_string())
}
