use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use crate::cli::config::AppConfig;
use crate::crawl::coordinator::{CrawlCoordinator, SubmitRequest};
use crate::crawl::types::{CrawlMode, CrawlerOptions, PageOptions, Plan, Tenant};
use crate::site::{RobotsClient, SitemapClient};
use crate::storage::{QueueFactory, StoreFactory};
use crate::worker::WorkerPool;

/// Flattened submit parameters from the CLI surface.
pub struct SubmitArgs {
    pub url: String,
    pub max_depth: Option<usize>,
    pub max_pages: Option<usize>,
    pub limit: Option<usize>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub use_sitemap: bool,
    pub allow_external_links: bool,
    pub only_urls: bool,
    pub fast: bool,
    pub markdown: bool,
    pub raw_html: bool,
    pub wait_for: Option<u64>,
    pub webhook: Vec<String>,
    pub tenant: String,
    pub plan: String,
}

async fn build_coordinator(config: &AppConfig) -> Result<CrawlCoordinator> {
    let store = StoreFactory::create(&config.store).await?;
    let queue = QueueFactory::create(&config.queue).await?;
    let robots = Arc::new(RobotsClient::new(&config.site, &config.deployment.user_agent));
    let sitemap = Arc::new(SitemapClient::new(&config.site, &config.deployment.user_agent));

    Ok(CrawlCoordinator::new(
        store,
        queue,
        robots,
        sitemap,
        config.deployment.clone(),
    ))
}

/// Submit a new crawl
pub async fn submit(args: SubmitArgs) -> Result<()> {
    let config = AppConfig::load_default()?;

    let plan = Plan::parse(&args.plan).context("Invalid plan")?;

    let defaults = CrawlerOptions::default();
    let crawler_options = CrawlerOptions {
        includes: args.include,
        excludes: args.exclude,
        max_depth: args.max_depth.unwrap_or(defaults.max_depth),
        max_crawled_links: args.max_pages.unwrap_or(defaults.max_crawled_links),
        limit: args.limit.unwrap_or(defaults.limit),
        ignore_sitemap: !args.use_sitemap,
        allow_external_links: args.allow_external_links,
        return_only_urls: args.only_urls,
        mode: if args.fast {
            CrawlMode::Fast
        } else {
            CrawlMode::Default
        },
    };

    let page_options = PageOptions {
        include_markdown: args.markdown,
        include_raw_html: args.raw_html,
        wait_for: args.wait_for.unwrap_or(0),
        use_fast_mode: args.fast,
        ..Default::default()
    };

    let coordinator = build_coordinator(&config).await?;

    let submission = coordinator
        .submit(SubmitRequest {
            origin_url: args.url,
            crawler_options,
            page_options,
            tenant: Tenant {
                tenant_id: args.tenant,
                plan,
            },
            webhook_urls: args.webhook,
            webhook_metadata: None,
        })
        .await
        .context("Submission failed")?;

    println!(
        "{}",
        serde_json::json!({
            "success": true,
            "id": submission.id,
            "url": submission.url,
        })
    );

    Ok(())
}

/// Check the status of a crawl
pub async fn status(crawl_id: String) -> Result<()> {
    let config = AppConfig::load_default()?;
    let coordinator = build_coordinator(&config).await?;

    let status = coordinator
        .status(&crawl_id)
        .await
        .context("Status lookup failed")?;

    println!("Crawl ID: {}", status.id);
    println!("Status: {}", status.state);
    println!("Pages: {}/{}", status.completed, status.total);

    Ok(())
}

/// Cancel a crawl
pub async fn cancel(crawl_id: String) -> Result<()> {
    let config = AppConfig::load_default()?;
    let coordinator = build_coordinator(&config).await?;

    coordinator
        .cancel(&crawl_id)
        .await
        .context("Cancellation failed")?;

    println!("Crawl {} cancelled", crawl_id);

    Ok(())
}

/// Run the worker pool until interrupted
pub async fn worker(workers: Option<usize>) -> Result<()> {
    let mut config = AppConfig::load_default()?;
    if let Some(count) = workers {
        config.worker.count = count;
    }

    let store = StoreFactory::create(&config.store).await?;
    let queue = QueueFactory::create(&config.queue).await?;

    let pool = WorkerPool::new(store, queue, config);
    pool.run().await
}

/// Show the current configuration
pub async fn show_config(save: bool) -> Result<()> {
    let config = AppConfig::load_default()?;

    if save {
        config.save_as_default()?;
        info!("Configuration saved");
    }

    println!("{:#?}", config);

    Ok(())
}
