pub mod pipeline;
pub mod progress;
pub mod webhook;

// Re-export common types
pub use pipeline::JobPipeline;
pub use webhook::WebhookNotifier;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Semaphore;
use tracing::{error, info};

use crate::cli::config::AppConfig;
use crate::fetch::{DirectFetcher, PageFetcher, RenderingFetcher};
use crate::storage::queue::JobQueue;
use crate::storage::store::CrawlStore;

/// Pool of worker tasks draining the shared priority queue. Each worker
/// owns its own direct fetcher (and with it a private cookie jar) and
/// bounds its in-flight fetches with a semaphore.
pub struct WorkerPool {
    store: Arc<dyn CrawlStore>,
    queue: Arc<dyn JobQueue>,
    config: AppConfig,
}

impl WorkerPool {
    pub fn new(store: Arc<dyn CrawlStore>, queue: Arc<dyn JobQueue>, config: AppConfig) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    /// Spawn the worker tasks and run until the process is stopped.
    pub async fn run(&self) -> Result<()> {
        let worker_count = resolve_worker_count(self.config.worker.count);
        info!("Starting {} workers", worker_count);

        let (tracker, aggregator) = progress::channel();
        tokio::spawn(aggregator.run());

        let renderer: Arc<dyn PageFetcher> = Arc::new(RenderingFetcher::new(&self.config.fetch));
        let webhooks = Arc::new(WebhookNotifier::new(&self.config.webhook));

        let mut handles = Vec::new();
        for index in 0..worker_count {
            let pipeline = Arc::new(JobPipeline {
                store: self.store.clone(),
                queue: self.queue.clone(),
                renderer: renderer.clone(),
                // One direct fetcher per worker keeps cookie jars private
                direct: Arc::new(DirectFetcher::new(&self.config.fetch)),
                webhooks: webhooks.clone(),
                progress: tracker.clone(),
                user_agent: self.config.deployment.user_agent.clone(),
                max_retries: self.config.worker.max_retries,
                backoff_base: Duration::from_millis(self.config.worker.backoff_base_ms),
            });

            let queue = self.queue.clone();
            let fan_out = self.config.fetch.concurrent_requests.max(1);
            let idle = Duration::from_millis(self.config.worker.idle_poll_ms);

            handles.push(tokio::spawn(async move {
                run_worker(index, queue, pipeline, fan_out, idle).await;
            }));
        }

        futures::future::join_all(handles).await;

        Ok(())
    }
}

fn resolve_worker_count(configured: usize) -> usize {
    if configured == 0 {
        num_cpus::get()
    } else {
        configured
    }
}

async fn run_worker(
    index: usize,
    queue: Arc<dyn JobQueue>,
    pipeline: Arc<JobPipeline>,
    fan_out: usize,
    idle: Duration,
) {
    info!("Worker {} started", index);

    let semaphore = Arc::new(Semaphore::new(fan_out));

    loop {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };

        match queue.dequeue().await {
            Ok(Some(job)) => {
                let pipeline = pipeline.clone();
                let queue = queue.clone();

                tokio::spawn(async move {
                    let _permit = permit;

                    if let Err(e) = pipeline.process(&job).await {
                        error!("Job {} failed: {}", job.id, e);

                        // Infrastructure failure: hand the job back for
                        // redelivery
                        if let Err(e) = queue.move_to_failed(&job, &e.to_string(), true).await {
                            error!("Failed to requeue job {}: {}", job.id, e);
                        }
                    }
                });
            }
            Ok(None) => {
                drop(permit);
                tokio::time::sleep(idle).await;
            }
            Err(e) => {
                drop(permit);
                error!("Worker {} failed to dequeue: {}", index, e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::cli::config::{DeploymentSettings, WebhookSettings};
    use crate::crawl::coordinator::{CrawlCoordinator, SubmitRequest};
    use crate::crawl::policy;
    use crate::crawl::types::{CrawlerOptions, PageOptions, Plan, Tenant};
    use crate::error::CrawlError;
    use crate::fetch::FetchResponse;
    use crate::site::robots::RobotsFetcher;
    use crate::site::sitemap::{SitemapEntry, SitemapFetcher};
    use crate::storage::memory::{MemoryQueue, MemoryStore};
    use url::Url;

    struct NoRobots;

    #[async_trait]
    impl RobotsFetcher for NoRobots {
        async fn fetch_robots(&self, _seed: &Url) -> Option<String> {
            None
        }
    }

    struct NoSitemap;

    #[async_trait]
    impl SitemapFetcher for NoSitemap {
        async fn try_get_sitemap(&self, _seed: &Url) -> Vec<SitemapEntry> {
            Vec::new()
        }
    }

    /// Serves a tiny site: the root links to /a and /b, /a links onward
    /// to /a/deeper, and everything else is a leaf.
    struct SiteFetcher;

    #[async_trait]
    impl crate::fetch::PageFetcher for SiteFetcher {
        async fn fetch(
            &self,
            url: &str,
            _options: &PageOptions,
        ) -> Result<FetchResponse, CrawlError> {
            let html = match url {
                "https://ex.com/" => {
                    r#"<html><body><a href="/a">a</a><a href="/b">b</a><a href="/a">dup</a></body></html>"#
                }
                "https://ex.com/a" => r#"<html><body><a href="/a/deeper">deep</a></body></html>"#,
                _ => "<html><body>leaf</body></html>",
            };
            Ok(FetchResponse {
                content: html.to_string(),
                page_status_code: Some(200),
                page_error: None,
            })
        }
    }

    #[test]
    fn test_resolve_worker_count() {
        assert_eq!(resolve_worker_count(4), 4);
        assert!(resolve_worker_count(0) >= 1);
    }

    #[tokio::test]
    async fn test_crawl_drains_to_completion() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());

        let coordinator = CrawlCoordinator::new(
            store.clone(),
            queue.clone(),
            Arc::new(NoRobots),
            Arc::new(NoSitemap),
            DeploymentSettings {
                local: true,
                public_host: "localhost:3002".to_string(),
                user_agent: "webharvest/0.1".to_string(),
            },
        );

        let submission = coordinator
            .submit(SubmitRequest {
                origin_url: "https://ex.com/".to_string(),
                crawler_options: CrawlerOptions {
                    max_depth: 2,
                    ..Default::default()
                },
                page_options: PageOptions::default(),
                tenant: Tenant {
                    tenant_id: "t1".to_string(),
                    plan: Plan::Standard,
                },
                webhook_urls: Vec::new(),
                webhook_metadata: None,
            })
            .await
            .unwrap();

        let (tracker, _aggregator) = progress::channel();
        let pipeline = JobPipeline {
            store: store.clone(),
            queue: queue.clone(),
            renderer: Arc::new(SiteFetcher),
            direct: Arc::new(SiteFetcher),
            webhooks: Arc::new(WebhookNotifier::new(&WebhookSettings {
                max_attempts: 1,
                backoff_base_ms: 1,
            })),
            progress: tracker,
            user_agent: "webharvest/0.1".to_string(),
            max_retries: 1,
            backoff_base: Duration::from_millis(1),
        };

        // Drain the queue the way a worker would, one job at a time
        let mut emitted = Vec::new();
        while let Some(job) = queue.dequeue().await.unwrap() {
            if let Some(document) = pipeline.process(&job).await.unwrap() {
                emitted.push(document);
            }
        }

        // Seed, /a, /b, /a/deeper; the duplicate /a was never enqueued
        assert_eq!(emitted.len(), 4);

        let status = coordinator.status(&submission.id).await.unwrap();
        assert_eq!(status.state, "completed");
        assert_eq!(status.total, 4);
        assert_eq!(status.completed, 4);

        // Every emitted document satisfies the crawl policy
        let max_depth = policy::adjusted_max_depth("https://ex.com/", 2);
        for document in &emitted {
            assert!(policy::url_depth(&document.metadata.source_url) <= max_depth);
        }
    }
}
