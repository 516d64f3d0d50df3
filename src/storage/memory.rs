//! In-process store and queue backends. Used for single-node deployments
//! and throughout the test suite; they honor the same atomicity contracts
//! as the Redis backends.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::crawl::types::{Document, Job, JobProgress, StoredCrawl};
use crate::storage::queue::JobQueue;
use crate::storage::store::CrawlStore;

#[derive(Default)]
struct MemoryStoreInner {
    crawls: HashMap<String, StoredCrawl>,
    locks: HashMap<String, HashSet<String>>,
    jobs: HashMap<String, HashSet<String>>,
    done: HashMap<String, HashSet<String>>,
    cache: HashMap<String, Document>,
}

/// In-memory `CrawlStore`.
#[derive(Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryStoreInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CrawlStore for MemoryStore {
    async fn save_crawl(&self, crawl: &StoredCrawl) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.crawls.insert(crawl.id.clone(), crawl.clone());
        Ok(())
    }

    async fn get_crawl(&self, crawl_id: &str) -> Result<Option<StoredCrawl>> {
        let inner = self.inner.lock().await;
        Ok(inner.crawls.get(crawl_id).cloned())
    }

    async fn cancel_crawl(&self, crawl_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let crawl = inner
            .crawls
            .get_mut(crawl_id)
            .context(format!("Crawl not found: {}", crawl_id))?;
        crawl.cancelled = true;
        Ok(())
    }

    async fn lock_url(&self, crawl_id: &str, url: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        Ok(inner
            .locks
            .entry(crawl_id.to_string())
            .or_default()
            .insert(url.to_string()))
    }

    async fn lock_urls(&self, crawl_id: &str, urls: &[String]) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().await;
        let locks = inner.locks.entry(crawl_id.to_string()).or_default();
        Ok(urls
            .iter()
            .filter(|url| locks.insert((*url).clone()))
            .cloned()
            .collect())
    }

    async fn lock_count(&self, crawl_id: &str) -> Result<u64> {
        let inner = self.inner.lock().await;
        Ok(inner.locks.get(crawl_id).map_or(0, |set| set.len() as u64))
    }

    async fn add_job(&self, crawl_id: &str, job_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .jobs
            .entry(crawl_id.to_string())
            .or_default()
            .insert(job_id.to_string());
        Ok(())
    }

    async fn add_jobs(&self, crawl_id: &str, job_ids: &[String]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let jobs = inner.jobs.entry(crawl_id.to_string()).or_default();
        jobs.extend(job_ids.iter().cloned());
        Ok(())
    }

    async fn job_count(&self, crawl_id: &str) -> Result<u64> {
        let inner = self.inner.lock().await;
        Ok(inner.jobs.get(crawl_id).map_or(0, |set| set.len() as u64))
    }

    async fn mark_job_done(&self, crawl_id: &str, job_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .done
            .entry(crawl_id.to_string())
            .or_default()
            .insert(job_id.to_string());
        Ok(())
    }

    async fn done_count(&self, crawl_id: &str) -> Result<u64> {
        let inner = self.inner.lock().await;
        Ok(inner.done.get(crawl_id).map_or(0, |set| set.len() as u64))
    }

    async fn cache_document(&self, url: &str, document: &Document) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.cache.insert(url.to_string(), document.clone());
        Ok(())
    }

    async fn get_cached_document(&self, url: &str) -> Result<Option<Document>> {
        let inner = self.inner.lock().await;
        Ok(inner.cache.get(url).cloned())
    }
}

#[derive(Default)]
struct MemoryQueueInner {
    /// Keyed by (priority, seq) so iteration order matches dispatch order.
    ready: BTreeMap<(i32, u64), Job>,
    seq: u64,
    pending: HashMap<String, u64>,
    progress: HashMap<String, JobProgress>,
    failed: Vec<(String, String)>,
}

/// In-memory `JobQueue`.
#[derive(Default)]
pub struct MemoryQueue {
    inner: Arc<Mutex<MemoryQueueInner>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of queued jobs in dispatch order. Test-facing.
    pub async fn queued_jobs(&self) -> Vec<Job> {
        let inner = self.inner.lock().await;
        inner.ready.values().cloned().collect()
    }

    /// Recorded permanent failures as (job id, error) pairs. Test-facing.
    pub async fn failures(&self) -> Vec<(String, String)> {
        let inner = self.inner.lock().await;
        inner.failed.clone()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: &Job) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.seq += 1;
        let key = (job.priority, inner.seq);
        inner.ready.insert(key, job.clone());
        *inner.pending.entry(job.tenant_id.clone()).or_default() += 1;
        Ok(())
    }

    async fn enqueue_bulk(&self, jobs: &[Job]) -> Result<()> {
        for job in jobs {
            self.enqueue(job).await?;
        }
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Job>> {
        let mut inner = self.inner.lock().await;
        let Some((&key, _)) = inner.ready.iter().next() else {
            return Ok(None);
        };
        let Some(job) = inner.ready.remove(&key) else {
            return Ok(None);
        };
        if let Some(count) = inner.pending.get_mut(&job.tenant_id) {
            *count = count.saturating_sub(1);
        }
        Ok(Some(job))
    }

    async fn update_progress(&self, job_id: &str, progress: &JobProgress) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.progress.insert(job_id.to_string(), progress.clone());
        Ok(())
    }

    async fn move_to_failed(&self, job: &Job, error: &str, retryable: bool) -> Result<()> {
        if retryable {
            return self.enqueue(job).await;
        }
        let mut inner = self.inner.lock().await;
        inner.failed.push((job.id.clone(), error.to_string()));
        Ok(())
    }

    async fn pending_count(&self, tenant_id: &str) -> Result<u64> {
        let inner = self.inner.lock().await;
        Ok(inner.pending.get(tenant_id).copied().unwrap_or(0))
    }
}
