use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::cli::config::DeploymentSettings;
use crate::crawl::policy;
use crate::crawl::priority::{
    job_priority, LARGE_SITEMAP_BASE_PRIORITY, LARGE_SITEMAP_THRESHOLD, SEED_PRIORITY,
    SITEMAP_PRIORITY,
};
use crate::crawl::types::{
    CrawlerOptions, Job, JobMode, PageOptions, SitemapMeta, StoredCrawl, Tenant,
};
use crate::error::CrawlError;
use crate::site::robots::RobotsFetcher;
use crate::site::sitemap::SitemapFetcher;
use crate::storage::queue::JobQueue;
use crate::storage::store::CrawlStore;

/// A crawl submission, after ingress parsing.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub origin_url: String,
    pub crawler_options: CrawlerOptions,
    pub page_options: PageOptions,
    pub tenant: Tenant,
    pub webhook_urls: Vec<String>,
    pub webhook_metadata: Option<Value>,
}

/// What a successful submission returns to the caller.
#[derive(Debug, Clone)]
pub struct Submission {
    pub id: String,
    /// Resource URL of the crawl, `<scheme>://<host>/v1/crawl/<id>`.
    pub url: String,
}

/// Point-in-time view of a crawl's progress.
#[derive(Debug, Clone)]
pub struct CrawlStatus {
    pub id: String,
    pub state: String,
    pub completed: u64,
    pub total: u64,
}

/// Orchestrates crawl submission: validation, crawl-record persistence,
/// URL locking, and the fan-out from seed (or sitemap) into queued jobs.
pub struct CrawlCoordinator {
    store: Arc<dyn CrawlStore>,
    queue: Arc<dyn JobQueue>,
    robots: Arc<dyn RobotsFetcher>,
    sitemap: Arc<dyn SitemapFetcher>,
    deployment: DeploymentSettings,
}

impl CrawlCoordinator {
    pub fn new(
        store: Arc<dyn CrawlStore>,
        queue: Arc<dyn JobQueue>,
        robots: Arc<dyn RobotsFetcher>,
        sitemap: Arc<dyn SitemapFetcher>,
        deployment: DeploymentSettings,
    ) -> Self {
        Self {
            store,
            queue,
            robots,
            sitemap,
            deployment,
        }
    }

    /// Validate and register a crawl, then enqueue its initial jobs.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Submission, CrawlError> {
        let seed = Self::validate_origin(&request.origin_url)?;

        // Patterns must compile before anything is persisted
        request.crawler_options.compile_patterns()?;

        let crawl_id = Uuid::new_v4().to_string();

        // Robots failure is non-fatal; absence means no policy retrieved
        let robots = self.robots.fetch_robots(&seed).await;
        if robots.is_none() {
            warn!("No robots.txt retrieved for {}", seed);
        }

        let crawl = StoredCrawl {
            id: crawl_id.clone(),
            origin_url: request.origin_url.clone(),
            crawler_options: request.crawler_options.clone(),
            page_options: request.page_options.clone(),
            tenant_id: request.tenant.tenant_id.clone(),
            plan: request.tenant.plan,
            created_at: Utc::now().timestamp_millis(),
            robots,
            cancelled: false,
            webhook_urls: request.webhook_urls.clone(),
            webhook_metadata: request.webhook_metadata.clone(),
        };

        self.store.save_crawl(&crawl).await?;

        if crawl.crawler_options.ignore_sitemap {
            self.enqueue_seed(&crawl).await?;
        } else {
            let entries = self.sitemap.try_get_sitemap(&seed).await;
            if entries.is_empty() {
                // Empty or unreachable sitemap falls back to the seed path
                info!("No sitemap for {}; falling back to seed job", seed);
                self.enqueue_seed(&crawl).await?;
            } else {
                self.enqueue_sitemap(&crawl, entries).await?;
            }
        }

        info!("Crawl {} submitted for {}", crawl_id, crawl.origin_url);

        Ok(Submission {
            url: self.resource_url(&crawl_id),
            id: crawl_id,
        })
    }

    /// Progress counters and terminal-state detection for a crawl.
    pub async fn status(&self, crawl_id: &str) -> Result<CrawlStatus, CrawlError> {
        let crawl = self
            .store
            .get_crawl(crawl_id)
            .await?
            .ok_or_else(|| CrawlError::Validation(format!("unknown crawl: {}", crawl_id)))?;

        let total = self.store.job_count(crawl_id).await?;
        let completed = self.store.done_count(crawl_id).await?;

        // A crawl is complete when its job set drains, whether individual
        // pages succeeded or not
        let state = if crawl.cancelled {
            "cancelled"
        } else if total > 0 && completed >= total {
            "completed"
        } else {
            "scraping"
        };

        Ok(CrawlStatus {
            id: crawl_id.to_string(),
            state: state.to_string(),
            completed,
            total,
        })
    }

    /// Mark a crawl terminal. In-flight jobs finish; queued jobs for it are
    /// discarded at dequeue.
    pub async fn cancel(&self, crawl_id: &str) -> Result<(), CrawlError> {
        self.store.cancel_crawl(crawl_id).await?;
        info!("Crawl {} cancelled", crawl_id);
        Ok(())
    }

    fn validate_origin(origin_url: &str) -> Result<Url, CrawlError> {
        let parsed = Url::parse(origin_url)
            .map_err(|e| CrawlError::Validation(format!("invalid URL '{}': {}", origin_url, e)))?;

        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(CrawlError::Validation(format!(
                "URL must be http(s), got '{}'",
                parsed.scheme()
            )));
        }

        Ok(parsed)
    }

    /// The single-seed path: one job at the seed priority band.
    async fn enqueue_seed(&self, crawl: &StoredCrawl) -> Result<(), CrawlError> {
        let canonical = policy::normalize_url(&crawl.origin_url);

        self.store
            .lock_url(&crawl.id, &policy::lock_key(&canonical))
            .await?;

        let job = self.build_job(crawl, canonical, SEED_PRIORITY, false, None);
        self.store.add_job(&crawl.id, &job.id).await?;
        self.queue.enqueue(&job).await?;

        Ok(())
    }

    /// The sitemap path: lock every entry, then bulk-enqueue one job per
    /// newly locked URL. Large sitemaps go through the priority policy.
    async fn enqueue_sitemap(
        &self,
        crawl: &StoredCrawl,
        entries: Vec<crate::site::SitemapEntry>,
    ) -> Result<(), CrawlError> {
        let mut entries = entries;
        entries.truncate(crawl.crawler_options.limit);

        let priority = if entries.len() > LARGE_SITEMAP_THRESHOLD {
            let load = self.queue.pending_count(&crawl.tenant_id).await?;
            job_priority(crawl.plan, load, LARGE_SITEMAP_BASE_PRIORITY)
        } else {
            SITEMAP_PRIORITY
        };

        // Dedupe by lock key up front so the bulk lock sees each URL once
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for entry in entries {
            let canonical = policy::normalize_url(&entry.loc);
            let key = policy::lock_key(&canonical);
            if seen.insert(key.clone()) {
                candidates.push((key, canonical, entry.meta()));
            }
        }

        let keys: Vec<String> = candidates.iter().map(|(key, _, _)| key.clone()).collect();
        let locked: HashSet<String> = self
            .store
            .lock_urls(&crawl.id, &keys)
            .await?
            .into_iter()
            .collect();

        let jobs: Vec<Job> = candidates
            .into_iter()
            .filter(|(key, _, _)| locked.contains(key))
            .map(|(_, canonical, meta)| self.build_job(crawl, canonical, priority, true, Some(meta)))
            .collect();

        let job_ids: Vec<String> = jobs.iter().map(|job| job.id.clone()).collect();
        self.store.add_jobs(&crawl.id, &job_ids).await?;
        self.queue.enqueue_bulk(&jobs).await?;

        info!(
            "Crawl {}: {} sitemap jobs enqueued at priority {}",
            crawl.id,
            job_ids.len(),
            priority
        );

        Ok(())
    }

    fn build_job(
        &self,
        crawl: &StoredCrawl,
        url: String,
        priority: i32,
        sitemapped: bool,
        sitemap: Option<SitemapMeta>,
    ) -> Job {
        Job {
            id: Uuid::new_v4().to_string(),
            crawl_id: crawl.id.clone(),
            url,
            mode: JobMode::SingleUrls,
            priority,
            sitemapped,
            tenant_id: crawl.tenant_id.clone(),
            plan: crawl.plan,
            crawler_options: crawl.crawler_options.clone(),
            page_options: crawl.page_options.clone(),
            sitemap,
            webhook_urls: crawl.webhook_urls.clone(),
            webhook_metadata: crawl.webhook_metadata.clone(),
        }
    }

    fn resource_url(&self, crawl_id: &str) -> String {
        let scheme = if self.deployment.local { "http" } else { "https" };
        format!(
            "{}://{}/v1/crawl/{}",
            scheme, self.deployment.public_host, crawl_id
        )
    }
}
