use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use regex::Regex;
use scraper::{Html, Selector};
use tracing::{debug, warn};
use url::Url;

use crate::crawl::crawler::{LinkDiscovery, UrlState};
use crate::crawl::policy;
use crate::crawl::priority::SITEMAP_PRIORITY;
use crate::crawl::types::{
    CrawlMode, Document, DocumentMetadata, Job, JobProgress, PageOptions,
};
use crate::error::CrawlError;
use crate::fetch::{FetchResponse, PageFetcher};
use crate::storage::queue::JobQueue;
use crate::storage::store::CrawlStore;
use crate::worker::progress::{ProgressTracker, ProgressUpdate};
use crate::worker::webhook::{WebhookNotifier, WebhookPayload};

/// Executes one job end to end: resolve the crawl, fetch the page, build
/// and emit the document, and (for crawl-discovered pages) feed new URLs
/// back into the queue.
pub struct JobPipeline {
    pub store: Arc<dyn CrawlStore>,
    pub queue: Arc<dyn JobQueue>,
    pub renderer: Arc<dyn PageFetcher>,
    pub direct: Arc<dyn PageFetcher>,
    pub webhooks: Arc<WebhookNotifier>,
    pub progress: ProgressTracker,
    pub user_agent: String,
    pub max_retries: u32,
    pub backoff_base: Duration,
}

impl JobPipeline {
    /// Returns the emitted document, or None when the job was discarded
    /// (cancelled or orphaned crawl). Only infrastructure errors escape.
    pub async fn process(&self, job: &Job) -> Result<Option<Document>> {
        let Some(crawl) = self.store.get_crawl(&job.crawl_id).await? else {
            warn!("Discarding job {} for unknown crawl {}", job.id, job.crawl_id);
            return Ok(None);
        };

        if crawl.cancelled {
            debug!("Discarding job {} for cancelled crawl {}", job.id, job.crawl_id);
            self.store.mark_job_done(&job.crawl_id, &job.id).await?;
            self.report(job, UrlState::Skipped, None).await?;
            return Ok(None);
        }

        self.report(job, UrlState::Fetching, None).await?;

        let binary = policy::is_binary_document(&job.url);
        let fast = job.page_options.use_fast_mode
            || job.page_options.disable_js_dom
            || job.crawler_options.mode == CrawlMode::Fast;

        // Fast mode consults the page cache before touching the network
        if fast {
            let cache_key = policy::normalize_url(&job.url);
            if let Some(cached) = self.store.get_cached_document(&cache_key).await? {
                debug!("Cache hit for {}", job.url);
                return self.emit(job, cached).await.map(Some);
            }
        }

        // Binary documents bypass the renderer and go to the extractor path
        let fetcher = if fast || binary {
            &self.direct
        } else {
            &self.renderer
        };

        let response = self.fetch_with_retry(fetcher, job).await?;
        let document = self.build_document(job, &response, binary);

        if document.metadata.page_error.is_none() {
            let cache_key = policy::normalize_url(&job.url);
            if let Err(e) = self.store.cache_document(&cache_key, &document).await {
                warn!("Failed to cache {}: {}", job.url, e);
            }

            // Sitemapped jobs scrape a known URL list and never recurse.
            // Discovery reads the raw page, not the extracted content.
            if !job.sitemapped && !binary {
                self.discover_children(&crawl, job, &response.content).await?;
            }
        }

        self.emit(job, document).await.map(Some)
    }

    /// Fetch with bounded retries for transient failures. Exhausted retries
    /// and permanent failures both fold into the response as `page_error`;
    /// the document is still emitted so the crawl makes progress.
    async fn fetch_with_retry(
        &self,
        fetcher: &Arc<dyn PageFetcher>,
        job: &Job,
    ) -> Result<FetchResponse> {
        let mut last_transient = String::new();

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.backoff_base * 2u32.pow(attempt - 1);
                debug!(
                    "Retrying {} in {:?} (attempt {}/{})",
                    job.url, delay, attempt, self.max_retries
                );
                tokio::time::sleep(delay).await;
            }

            match fetcher.fetch(&job.url, &job.page_options).await {
                Ok(response) if response.is_transient_failure() => {
                    last_transient = response
                        .page_error
                        .clone()
                        .unwrap_or_else(|| "server error".to_string());
                    if attempt == self.max_retries {
                        return Ok(response);
                    }
                }
                Ok(response) => return Ok(response),
                Err(CrawlError::TransientFetch(message)) => {
                    last_transient = message;
                    if attempt == self.max_retries {
                        break;
                    }
                }
                Err(CrawlError::PermanentFetch(message)) => {
                    return Ok(FetchResponse {
                        content: String::new(),
                        page_status_code: None,
                        page_error: Some(message),
                    });
                }
                Err(CrawlError::Infrastructure(e)) => return Err(e),
                Err(CrawlError::Validation(message)) => {
                    return Ok(FetchResponse {
                        content: String::new(),
                        page_status_code: None,
                        page_error: Some(message),
                    });
                }
            }
        }

        Ok(FetchResponse {
            content: String::new(),
            page_status_code: None,
            page_error: Some(last_transient),
        })
    }

    fn build_document(&self, job: &Job, response: &FetchResponse, binary: bool) -> Document {
        let options = &job.page_options;
        let base = Url::parse(&job.url).ok();

        // Path rewriting applies whenever HTML output is emitted
        let html_source = match (&base, options.replace_all_paths_with_absolute_paths) {
            (Some(base), true) => rewrite_paths(&response.content, base),
            _ => response.content.clone(),
        };

        let content = if job.crawler_options.return_only_urls {
            String::new()
        } else if binary {
            // Binary payloads go to the document extractor untouched
            response.content.clone()
        } else {
            extract_text(&html_source, options)
        };

        let links = if options.include_links && !binary {
            let extracted = base
                .as_ref()
                .map(|base| extract_link_urls(&response.content, base))
                .unwrap_or_default();
            Some(extracted)
        } else {
            None
        };

        Document {
            content,
            html: options.include_raw_html.then(|| html_source.clone()),
            markdown: (options.include_markdown && !binary)
                .then(|| html2md::parse_html(&html_source)),
            links,
            metadata: DocumentMetadata {
                source_url: job.url.clone(),
                page_status_code: response.page_status_code,
                page_error: response.page_error.clone(),
                sitemap: job.sitemap.clone(),
            },
        }
    }

    /// Run link discovery over the fetched page and enqueue the claimed
    /// URLs as child jobs, in document order.
    async fn discover_children(
        &self,
        crawl: &crate::crawl::types::StoredCrawl,
        job: &Job,
        html: &str,
    ) -> Result<()> {
        let discovery = match LinkDiscovery::new(crawl, &self.user_agent) {
            Ok(discovery) => discovery,
            Err(e) => {
                warn!("Skipping discovery for crawl {}: {}", crawl.id, e);
                return Ok(());
            }
        };

        let Ok(base) = Url::parse(&job.url) else {
            return Ok(());
        };

        let claimed = discovery.discover(&self.store, html, &base).await?;

        for candidate in claimed {
            let child = self.child_job(job, candidate.url);
            self.store.add_job(&job.crawl_id, &child.id).await?;
            self.queue.enqueue(&child).await?;
        }

        Ok(())
    }

    fn child_job(&self, parent: &Job, url: String) -> Job {
        Job {
            id: uuid::Uuid::new_v4().to_string(),
            crawl_id: parent.crawl_id.clone(),
            url,
            mode: parent.mode,
            priority: SITEMAP_PRIORITY,
            sitemapped: false,
            tenant_id: parent.tenant_id.clone(),
            plan: parent.plan,
            crawler_options: parent.crawler_options.clone(),
            page_options: parent.page_options.clone(),
            sitemap: None,
            webhook_urls: parent.webhook_urls.clone(),
            webhook_metadata: parent.webhook_metadata.clone(),
        }
    }

    /// Deliver the document, record completion, and report final progress.
    async fn emit(&self, job: &Job, document: Document) -> Result<Document> {
        if !job.webhook_urls.is_empty() {
            let payload = WebhookPayload::from_document(job, &document);
            self.webhooks.deliver(&job.webhook_urls, &payload).await;
        }

        self.store.mark_job_done(&job.crawl_id, &job.id).await?;

        let state = if document.metadata.page_error.is_some() {
            UrlState::Failed
        } else {
            UrlState::Emitted
        };
        self.report(job, state, Some(document.clone())).await?;

        Ok(document)
    }

    async fn report(&self, job: &Job, state: UrlState, document: Option<Document>) -> Result<()> {
        let total = self.store.job_count(&job.crawl_id).await?;
        let current = self.store.done_count(&job.crawl_id).await?;

        let progress = JobProgress {
            current,
            total,
            status: state.as_str().to_string(),
            current_document_url: Some(job.url.clone()),
            current_document: document,
        };

        self.queue.update_progress(&job.id, &progress).await?;
        self.progress.report(ProgressUpdate {
            crawl_id: job.crawl_id.clone(),
            job_id: job.id.clone(),
            progress,
        });

        Ok(())
    }
}

/// Strip unwanted elements, then collect readable text. `only_include_tags`
/// narrows extraction to matching elements; `remove_tags` drops subtrees.
fn extract_text(html: &str, options: &PageOptions) -> String {
    let cleaned = clean_html(html, &options.remove_tags);
    let document = Html::parse_document(&cleaned);

    if !options.only_include_tags.is_empty() {
        if let Ok(selector) = Selector::parse(&options.only_include_tags.join(", ")) {
            let parts: Vec<String> = document
                .select(&selector)
                .map(|element| element.text().collect::<Vec<_>>().join(" "))
                .collect();
            return squeeze_whitespace(&parts.join(" "));
        }
    }

    let body = Selector::parse("body").expect("static selector");
    let text = match document.select(&body).next() {
        Some(body) => body.text().collect::<Vec<_>>().join(" "),
        None => document.root_element().text().collect::<Vec<_>>().join(" "),
    };

    squeeze_whitespace(&text)
}

/// Remove listed elements (plus script/style noise) at the markup level.
fn clean_html(html: &str, remove_tags: &[String]) -> String {
    let mut cleaned = html.to_string();

    let mut tags: Vec<&str> = vec!["script", "style", "noscript"];
    tags.extend(remove_tags.iter().map(String::as_str));

    for tag in tags {
        if !tag.chars().all(|c| c.is_ascii_alphanumeric()) {
            continue;
        }
        let pattern = format!(r"(?is)<{tag}\b[^>]*>.*?</{tag}>");
        if let Ok(re) = Regex::new(&pattern) {
            cleaned = re.replace_all(&cleaned, "").into_owned();
        }
    }

    cleaned
}

/// Rewrite relative href/src attribute values to absolute URLs.
fn rewrite_paths(html: &str, base: &Url) -> String {
    let re = Regex::new(r#"(?i)\b(href|src)=["']([^"']*)["']"#).expect("static pattern");

    re.replace_all(html, |caps: &regex::Captures| {
        let value = &caps[2];
        if value.starts_with("http://")
            || value.starts_with("https://")
            || value.starts_with("data:")
            || value.starts_with("mailto:")
            || value.starts_with('#')
        {
            return caps[0].to_string();
        }
        match base.join(value) {
            Ok(absolute) => format!(r#"{}="{}""#, &caps[1], absolute),
            Err(_) => caps[0].to_string(),
        }
    })
    .into_owned()
}

fn extract_link_urls(html: &str, base: &Url) -> Vec<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("a[href]").expect("static selector");

    document
        .select(&selector)
        .filter_map(|element| element.value().attr("href"))
        .filter_map(|href| base.join(href).ok())
        .map(|absolute| absolute.to_string())
        .collect()
}

fn squeeze_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    use crate::cli::config::WebhookSettings;
    use crate::crawl::types::{CrawlerOptions, JobMode, Plan, StoredCrawl};
    use crate::storage::memory::{MemoryQueue, MemoryStore};
    use crate::worker::progress;

    /// Replays a scripted sequence of fetch outcomes.
    struct ScriptedFetcher {
        script: Mutex<VecDeque<Result<FetchResponse, CrawlError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedFetcher {
        fn new(script: Vec<Result<FetchResponse, CrawlError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(0),
            })
        }

        async fn call_count(&self) -> u32 {
            *self.calls.lock().await
        }
    }

    #[async_trait]
    impl PageFetcher for ScriptedFetcher {
        async fn fetch(
            &self,
            _url: &str,
            _options: &PageOptions,
        ) -> Result<FetchResponse, CrawlError> {
            *self.calls.lock().await += 1;
            self.script
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| Ok(FetchResponse::default()))
        }
    }

    fn ok_response(html: &str) -> Result<FetchResponse, CrawlError> {
        Ok(FetchResponse {
            content: html.to_string(),
            page_status_code: Some(200),
            page_error: None,
        })
    }

    fn server_error() -> Result<FetchResponse, CrawlError> {
        Ok(FetchResponse {
            content: String::new(),
            page_status_code: Some(503),
            page_error: Some("rendering service returned status 503".to_string()),
        })
    }

    struct Harness {
        store: Arc<MemoryStore>,
        queue: Arc<MemoryQueue>,
        fetcher: Arc<ScriptedFetcher>,
        pipeline: JobPipeline,
    }

    fn create_harness(script: Vec<Result<FetchResponse, CrawlError>>) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let fetcher = ScriptedFetcher::new(script);
        let (tracker, _aggregator) = progress::channel();

        let pipeline = JobPipeline {
            store: store.clone(),
            queue: queue.clone(),
            renderer: fetcher.clone(),
            direct: ScriptedFetcher::new(Vec::new()),
            webhooks: Arc::new(WebhookNotifier::new(&WebhookSettings {
                max_attempts: 1,
                backoff_base_ms: 1,
            })),
            progress: tracker,
            user_agent: "webharvest/0.1".to_string(),
            max_retries: 3,
            backoff_base: Duration::from_millis(1),
        };

        Harness {
            store,
            queue,
            fetcher,
            pipeline,
        }
    }

    fn create_test_crawl(options: CrawlerOptions) -> StoredCrawl {
        StoredCrawl {
            id: "c1".to_string(),
            origin_url: "https://ex.com/".to_string(),
            crawler_options: options,
            page_options: PageOptions::default(),
            tenant_id: "t1".to_string(),
            plan: Plan::Free,
            created_at: 0,
            robots: None,
            cancelled: false,
            webhook_urls: Vec::new(),
            webhook_metadata: None,
        }
    }

    fn create_test_job(crawl: &StoredCrawl, url: &str) -> Job {
        Job {
            id: uuid::Uuid::new_v4().to_string(),
            crawl_id: crawl.id.clone(),
            url: url.to_string(),
            mode: JobMode::SingleUrls,
            priority: 15,
            sitemapped: false,
            tenant_id: crawl.tenant_id.clone(),
            plan: crawl.plan,
            crawler_options: crawl.crawler_options.clone(),
            page_options: crawl.page_options.clone(),
            sitemap: None,
            webhook_urls: Vec::new(),
            webhook_metadata: None,
        }
    }

    async fn seed_job(harness: &Harness, crawl: &StoredCrawl, url: &str) -> Job {
        harness.store.save_crawl(crawl).await.unwrap();
        let job = create_test_job(crawl, url);
        harness
            .store
            .lock_url(&crawl.id, &policy::lock_key(url))
            .await
            .unwrap();
        harness.store.add_job(&crawl.id, &job.id).await.unwrap();
        job
    }

    #[tokio::test]
    async fn test_discovery_enqueues_children_once() {
        let html = r#"<html><body>
            <a href="/a">a</a>
            <a href="/b">b</a>
            <a href="/a">dup</a>
            <a href="https://other.com/x">external</a>
        </body></html>"#;
        let harness = create_harness(vec![ok_response(html)]);
        let crawl = create_test_crawl(CrawlerOptions {
            max_depth: 1,
            ..Default::default()
        });
        let job = seed_job(&harness, &crawl, "https://ex.com/").await;

        let document = harness.pipeline.process(&job).await.unwrap().unwrap();
        assert!(document.metadata.page_error.is_none());

        let queued = harness.queue.queued_jobs().await;
        let urls: Vec<&str> = queued.iter().map(|j| j.url.as_str()).collect();
        assert_eq!(urls, vec!["https://ex.com/a", "https://ex.com/b"]);
        assert!(queued.iter().all(|j| j.priority == SITEMAP_PRIORITY));

        // Membership covers the seed and both children
        assert_eq!(harness.store.job_count("c1").await.unwrap(), 3);
        assert_eq!(harness.store.done_count("c1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_transient_errors_retry_until_success() {
        let harness = create_harness(vec![
            server_error(),
            server_error(),
            server_error(),
            ok_response("<html><body>made it</body></html>"),
        ]);
        let crawl = create_test_crawl(CrawlerOptions::default());
        let job = seed_job(&harness, &crawl, "https://ex.com/").await;

        let document = harness.pipeline.process(&job).await.unwrap().unwrap();

        assert_eq!(harness.fetcher.call_count().await, 4);
        assert!(document.metadata.page_error.is_none());
        assert_eq!(document.content, "made it");
        assert_eq!(document.metadata.page_status_code, Some(200));
    }

    #[tokio::test]
    async fn test_exhausted_retries_emit_failed_document() {
        let harness = create_harness(vec![
            Err(CrawlError::TransientFetch("Request timed out".to_string())),
            Err(CrawlError::TransientFetch("Request timed out".to_string())),
            Err(CrawlError::TransientFetch("Request timed out".to_string())),
            Err(CrawlError::TransientFetch("Request timed out".to_string())),
        ]);
        let crawl = create_test_crawl(CrawlerOptions::default());
        let job = seed_job(&harness, &crawl, "https://ex.com/").await;

        let document = harness.pipeline.process(&job).await.unwrap().unwrap();

        assert_eq!(harness.fetcher.call_count().await, 4);
        assert_eq!(
            document.metadata.page_error.as_deref(),
            Some("Request timed out")
        );
        assert!(document.content.is_empty());
        // Failed pages still count toward completion
        assert_eq!(harness.store.done_count("c1").await.unwrap(), 1);
        assert!(harness.queue.queued_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let harness = create_harness(vec![Ok(FetchResponse {
            content: String::new(),
            page_status_code: Some(404),
            page_error: Some("Not Found".to_string()),
        })]);
        let crawl = create_test_crawl(CrawlerOptions::default());
        let job = seed_job(&harness, &crawl, "https://ex.com/gone").await;

        let document = harness.pipeline.process(&job).await.unwrap().unwrap();

        assert_eq!(harness.fetcher.call_count().await, 1);
        assert_eq!(document.metadata.page_status_code, Some(404));
        assert_eq!(document.metadata.page_error.as_deref(), Some("Not Found"));
    }

    #[tokio::test]
    async fn test_cancelled_crawl_discards_job() {
        let harness = create_harness(vec![ok_response("<html></html>")]);
        let mut crawl = create_test_crawl(CrawlerOptions::default());
        crawl.cancelled = true;
        let job = seed_job(&harness, &crawl, "https://ex.com/").await;

        let result = harness.pipeline.process(&job).await.unwrap();

        assert!(result.is_none());
        assert_eq!(harness.fetcher.call_count().await, 0);
        // Discarded jobs still drain from the job set
        assert_eq!(harness.store.done_count("c1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sitemapped_jobs_do_not_recurse() {
        let html = r#"<html><body><a href="/a">a</a></body></html>"#;
        let harness = create_harness(vec![ok_response(html)]);
        let crawl = create_test_crawl(CrawlerOptions::default());
        let mut job = seed_job(&harness, &crawl, "https://ex.com/").await;
        job.sitemapped = true;

        harness.pipeline.process(&job).await.unwrap().unwrap();
        assert!(harness.queue.queued_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn test_markdown_and_raw_html_outputs() {
        let html = "<html><body><h1>Title</h1><p>Body text</p></body></html>";
        let harness = create_harness(vec![ok_response(html)]);
        let mut crawl = create_test_crawl(CrawlerOptions::default());
        crawl.page_options.include_markdown = true;
        crawl.page_options.include_raw_html = true;
        let job = seed_job(&harness, &crawl, "https://ex.com/").await;

        let document = harness.pipeline.process(&job).await.unwrap().unwrap();

        assert_eq!(document.content, "Title Body text");
        assert_eq!(document.html.as_deref(), Some(html));
        let markdown = document.markdown.unwrap();
        assert!(markdown.contains("Title"));
    }

    #[tokio::test]
    async fn test_fast_mode_serves_from_cache() {
        let harness = create_harness(Vec::new());
        let mut crawl = create_test_crawl(CrawlerOptions::default());
        crawl.page_options.use_fast_mode = true;
        let job = seed_job(&harness, &crawl, "https://ex.com/cached").await;

        let cached = Document {
            content: "from cache".to_string(),
            html: None,
            markdown: None,
            links: None,
            metadata: DocumentMetadata {
                source_url: job.url.clone(),
                page_status_code: Some(200),
                page_error: None,
                sitemap: None,
            },
        };
        harness
            .store
            .cache_document("https://ex.com/cached", &cached)
            .await
            .unwrap();

        let document = harness.pipeline.process(&job).await.unwrap().unwrap();
        assert_eq!(document.content, "from cache");
        assert_eq!(harness.fetcher.call_count().await, 0);
    }

    #[test]
    fn test_rewrite_paths() {
        let base = Url::parse("https://ex.com/docs/page").unwrap();
        let html = r#"<img src="/logo.png"><a href="sub/page">x</a><a href="https://other.com/">y</a>"#;
        let rewritten = rewrite_paths(html, &base);

        assert!(rewritten.contains(r#"src="https://ex.com/logo.png""#));
        assert!(rewritten.contains(r#"href="https://ex.com/docs/sub/page""#));
        assert!(rewritten.contains(r#"href="https://other.com/""#));
    }

    #[test]
    fn test_extract_text_honors_tag_options() {
        let html = r#"<html><body>
            <script>var x = 1;</script>
            <nav>menu</nav>
            <article>real content</article>
        </body></html>"#;

        let default_options = PageOptions::default();
        let text = extract_text(html, &default_options);
        assert!(text.contains("real content"));
        assert!(!text.contains("var x"));

        let removed = PageOptions {
            remove_tags: vec!["nav".to_string()],
            ..Default::default()
        };
        assert!(!extract_text(html, &removed).contains("menu"));

        let only = PageOptions {
            only_include_tags: vec!["article".to_string()],
            ..Default::default()
        };
        assert_eq!(extract_text(html, &only), "real content");
    }
}
