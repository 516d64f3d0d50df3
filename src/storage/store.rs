use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, Client};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::cli::config::StoreSettings;
use crate::crawl::types::{Document, StoredCrawl};

/// Durable shared state for crawls: crawl records, the per-crawl URL lock
/// set, job membership, and the page cache.
///
/// Lock-set writes are atomic set-if-absent; a URL never leaves the lock
/// set for the lifetime of its crawl.
#[async_trait]
pub trait CrawlStore: Send + Sync {
    /// Persist a crawl record.
    async fn save_crawl(&self, crawl: &StoredCrawl) -> Result<()>;

    /// Fetch a crawl record.
    async fn get_crawl(&self, crawl_id: &str) -> Result<Option<StoredCrawl>>;

    /// Mark a crawl terminal; subsequent dequeues for it are discarded.
    async fn cancel_crawl(&self, crawl_id: &str) -> Result<()>;

    /// Atomically claim a URL for a crawl. Returns true when the caller
    /// won the claim, false when the URL was already locked.
    async fn lock_url(&self, crawl_id: &str, url: &str) -> Result<bool>;

    /// Claim many URLs with per-URL atomicity; returns the subset that was
    /// newly locked, in input order.
    async fn lock_urls(&self, crawl_id: &str, urls: &[String]) -> Result<Vec<String>>;

    /// Size of the crawl's lock set.
    async fn lock_count(&self, crawl_id: &str) -> Result<u64>;

    /// Record a job as belonging to a crawl.
    async fn add_job(&self, crawl_id: &str, job_id: &str) -> Result<()>;

    /// Bulk variant of `add_job`.
    async fn add_jobs(&self, crawl_id: &str, job_ids: &[String]) -> Result<()>;

    /// Number of jobs ever enqueued for the crawl.
    async fn job_count(&self, crawl_id: &str) -> Result<u64>;

    /// Record a job as finished (emitted or failed).
    async fn mark_job_done(&self, crawl_id: &str, job_id: &str) -> Result<()>;

    /// Number of finished jobs for the crawl.
    async fn done_count(&self, crawl_id: &str) -> Result<u64>;

    /// Cache a fetched document under its normalized URL.
    async fn cache_document(&self, url: &str, document: &Document) -> Result<()>;

    /// Look up a cached document by normalized URL.
    async fn get_cached_document(&self, url: &str) -> Result<Option<Document>>;
}

/// Redis-backed store.
pub struct RedisStore {
    conn: Arc<Mutex<MultiplexedConnection>>,

    /// Coarse TTL applied to every crawl key, in seconds.
    ttl: u64,

    /// TTL for cached documents, in seconds.
    cache_ttl: u64,
}

impl RedisStore {
    pub async fn new(settings: &StoreSettings) -> Result<Self> {
        let client = Client::open(settings.redis_url.clone())
            .context(format!("Failed to connect to Redis at {}", settings.redis_url))?;

        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to get Redis connection")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            ttl: settings.ttl_secs,
            cache_ttl: settings.cache_ttl_secs,
        })
    }

    fn crawl_key(crawl_id: &str) -> String {
        format!("crawl:{}", crawl_id)
    }

    fn locks_key(crawl_id: &str) -> String {
        format!("crawl:{}:locks", crawl_id)
    }

    fn jobs_key(crawl_id: &str) -> String {
        format!("crawl:{}:jobs", crawl_id)
    }

    fn done_key(crawl_id: &str) -> String {
        format!("crawl:{}:done", crawl_id)
    }

    fn cache_key(url: &str) -> String {
        format!("web-scraper-cache:{}", url)
    }

    /// Set the coarse TTL on a key if none is set yet.
    async fn ensure_ttl(&self, conn: &mut MultiplexedConnection, key: &str) -> Result<()> {
        let ttl: i64 = redis::cmd("TTL")
            .arg(key)
            .query_async(conn)
            .await
            .unwrap_or(-1);

        if ttl == -1 {
            redis::cmd("EXPIRE")
                .arg(key)
                .arg(self.ttl)
                .query_async::<_, ()>(conn)
                .await
                .context(format!("Failed to set TTL on {}", key))?;
        }

        Ok(())
    }
}

#[async_trait]
impl CrawlStore for RedisStore {
    async fn save_crawl(&self, crawl: &StoredCrawl) -> Result<()> {
        let payload = serde_json::to_string(crawl).context("Failed to serialize crawl record")?;

        let mut conn = self.conn.lock().await;

        redis::cmd("SET")
            .arg(Self::crawl_key(&crawl.id))
            .arg(payload)
            .arg("EX")
            .arg(self.ttl)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to store crawl record")?;

        debug!("Stored crawl record: {}", crawl.id);

        Ok(())
    }

    async fn get_crawl(&self, crawl_id: &str) -> Result<Option<StoredCrawl>> {
        let mut conn = self.conn.lock().await;

        let payload: Option<String> = redis::cmd("GET")
            .arg(Self::crawl_key(crawl_id))
            .query_async(&mut *conn)
            .await
            .context("Failed to read crawl record")?;

        match payload {
            Some(payload) => {
                let crawl: StoredCrawl = serde_json::from_str(&payload)
                    .context("Failed to deserialize crawl record")?;
                Ok(Some(crawl))
            }
            None => Ok(None),
        }
    }

    async fn cancel_crawl(&self, crawl_id: &str) -> Result<()> {
        let mut crawl = self
            .get_crawl(crawl_id)
            .await?
            .context(format!("Crawl not found: {}", crawl_id))?;

        crawl.cancelled = true;
        self.save_crawl(&crawl).await?;

        debug!("Cancelled crawl: {}", crawl_id);

        Ok(())
    }

    async fn lock_url(&self, crawl_id: &str, url: &str) -> Result<bool> {
        let key = Self::locks_key(crawl_id);
        let mut conn = self.conn.lock().await;

        let added: i64 = redis::cmd("SADD")
            .arg(&key)
            .arg(url)
            .query_async(&mut *conn)
            .await
            .context("Failed to add URL to lock set")?;

        self.ensure_ttl(&mut conn, &key).await?;

        Ok(added == 1)
    }

    async fn lock_urls(&self, crawl_id: &str, urls: &[String]) -> Result<Vec<String>> {
        let key = Self::locks_key(crawl_id);
        let mut conn = self.conn.lock().await;
        let mut locked = Vec::new();

        // Per-URL SADD keeps each claim atomic while preserving input order.
        for url in urls {
            let added: i64 = redis::cmd("SADD")
                .arg(&key)
                .arg(url)
                .query_async(&mut *conn)
                .await
                .context("Failed to add URL to lock set")?;

            if added == 1 {
                locked.push(url.clone());
            }
        }

        self.ensure_ttl(&mut conn, &key).await?;

        Ok(locked)
    }

    async fn lock_count(&self, crawl_id: &str) -> Result<u64> {
        let mut conn = self.conn.lock().await;

        let count: u64 = redis::cmd("SCARD")
            .arg(Self::locks_key(crawl_id))
            .query_async(&mut *conn)
            .await
            .context("Failed to get lock set size")?;

        Ok(count)
    }

    async fn add_job(&self, crawl_id: &str, job_id: &str) -> Result<()> {
        let key = Self::jobs_key(crawl_id);
        let mut conn = self.conn.lock().await;

        redis::cmd("SADD")
            .arg(&key)
            .arg(job_id)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to add job to membership set")?;

        self.ensure_ttl(&mut conn, &key).await?;

        Ok(())
    }

    async fn add_jobs(&self, crawl_id: &str, job_ids: &[String]) -> Result<()> {
        if job_ids.is_empty() {
            return Ok(());
        }

        let key = Self::jobs_key(crawl_id);
        let mut conn = self.conn.lock().await;

        redis::cmd("SADD")
            .arg(&key)
            .arg(job_ids)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to add jobs to membership set")?;

        self.ensure_ttl(&mut conn, &key).await?;

        Ok(())
    }

    async fn job_count(&self, crawl_id: &str) -> Result<u64> {
        let mut conn = self.conn.lock().await;

        let count: u64 = redis::cmd("SCARD")
            .arg(Self::jobs_key(crawl_id))
            .query_async(&mut *conn)
            .await
            .context("Failed to get membership set size")?;

        Ok(count)
    }

    async fn mark_job_done(&self, crawl_id: &str, job_id: &str) -> Result<()> {
        let key = Self::done_key(crawl_id);
        let mut conn = self.conn.lock().await;

        redis::cmd("SADD")
            .arg(&key)
            .arg(job_id)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to mark job done")?;

        self.ensure_ttl(&mut conn, &key).await?;

        Ok(())
    }

    async fn done_count(&self, crawl_id: &str) -> Result<u64> {
        let mut conn = self.conn.lock().await;

        let count: u64 = redis::cmd("SCARD")
            .arg(Self::done_key(crawl_id))
            .query_async(&mut *conn)
            .await
            .context("Failed to get done set size")?;

        Ok(count)
    }

    async fn cache_document(&self, url: &str, document: &Document) -> Result<()> {
        let payload =
            serde_json::to_string(document).context("Failed to serialize cached document")?;

        let mut conn = self.conn.lock().await;

        redis::cmd("SET")
            .arg(Self::cache_key(url))
            .arg(payload)
            .arg("EX")
            .arg(self.cache_ttl)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to cache document")?;

        Ok(())
    }

    async fn get_cached_document(&self, url: &str) -> Result<Option<Document>> {
        let mut conn = self.conn.lock().await;

        let payload: Option<String> = redis::cmd("GET")
            .arg(Self::cache_key(url))
            .query_async(&mut *conn)
            .await
            .context("Failed to read cached document")?;

        match payload {
            Some(payload) => {
                let document: Document = serde_json::from_str(&payload)
                    .context("Failed to deserialize cached document")?;
                Ok(Some(document))
            }
            None => Ok(None),
        }
    }
}
