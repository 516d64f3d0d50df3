use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, Client};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::cli::config::QueueSettings;
use crate::crawl::types::{Job, JobProgress};

/// The shared dispatch channel between the coordinator and workers.
///
/// Ordering is strictly by priority band (lower serves first) and FIFO
/// within a band.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: &Job) -> Result<()>;

    async fn enqueue_bulk(&self, jobs: &[Job]) -> Result<()>;

    /// Pop the next job, or None when the queue is empty.
    async fn dequeue(&self) -> Result<Option<Job>>;

    async fn update_progress(&self, job_id: &str, progress: &JobProgress) -> Result<()>;

    /// Route a failed job: retryable failures are re-enqueued at their
    /// original priority, permanent ones are recorded and dropped.
    async fn move_to_failed(&self, job: &Job, error: &str, retryable: bool) -> Result<()>;

    /// Number of jobs currently queued for a tenant; input to the
    /// priority policy.
    async fn pending_count(&self, tenant_id: &str) -> Result<u64>;
}

const QUEUE_KEY: &str = "queue:jobs";
const SEQ_KEY: &str = "queue:seq";

/// Redis-backed priority queue. A single ZSET holds serialized jobs scored
/// by `priority * 2^32 + seq`, so bands order first and the insertion
/// sequence breaks ties FIFO within a band.
pub struct RedisQueue {
    conn: Arc<Mutex<MultiplexedConnection>>,

    /// TTL for progress, failure, and tenant counter keys, in seconds.
    task_ttl: u64,
}

impl RedisQueue {
    pub async fn new(settings: &QueueSettings) -> Result<Self> {
        let client = Client::open(settings.redis_url.clone())
            .context(format!("Failed to connect to Redis at {}", settings.redis_url))?;

        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to get Redis connection")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            task_ttl: settings.task_ttl,
        })
    }

    fn tenant_key(tenant_id: &str) -> String {
        format!("queue:tenant:{}:pending", tenant_id)
    }

    fn progress_key(job_id: &str) -> String {
        format!("queue:progress:{}", job_id)
    }

    fn error_key(job_id: &str) -> String {
        format!("queue:error:{}", job_id)
    }

    fn score(priority: i32, seq: u64) -> f64 {
        (priority as f64) * 4294967296.0 + seq as f64
    }

    async fn next_seq(conn: &mut MultiplexedConnection) -> Result<u64> {
        let seq: u64 = redis::cmd("INCR")
            .arg(SEQ_KEY)
            .query_async(conn)
            .await
            .context("Failed to allocate queue sequence number")?;
        Ok(seq)
    }

    async fn bump_tenant(
        &self,
        conn: &mut MultiplexedConnection,
        tenant_id: &str,
        delta: i64,
    ) -> Result<()> {
        let key = Self::tenant_key(tenant_id);

        let count: i64 = redis::cmd("INCRBY")
            .arg(&key)
            .arg(delta)
            .query_async(&mut *conn)
            .await
            .context("Failed to update tenant pending counter")?;

        // Counters can drift below zero after a TTL reset mid-crawl
        if count < 0 {
            redis::cmd("SET")
                .arg(&key)
                .arg(0)
                .query_async::<_, ()>(&mut *conn)
                .await
                .context("Failed to reset tenant pending counter")?;
        }

        redis::cmd("EXPIRE")
            .arg(&key)
            .arg(self.task_ttl)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to set TTL on tenant pending counter")?;

        Ok(())
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn enqueue(&self, job: &Job) -> Result<()> {
        let payload = serde_json::to_string(job).context("Failed to serialize job")?;

        let mut conn = self.conn.lock().await;
        let seq = Self::next_seq(&mut conn).await?;

        redis::cmd("ZADD")
            .arg(QUEUE_KEY)
            .arg(Self::score(job.priority, seq))
            .arg(payload)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to push job to queue")?;

        self.bump_tenant(&mut conn, &job.tenant_id, 1).await?;

        debug!("Enqueued job {} at priority {}", job.id, job.priority);

        Ok(())
    }

    async fn enqueue_bulk(&self, jobs: &[Job]) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock().await;

        let mut cmd = redis::cmd("ZADD");
        cmd.arg(QUEUE_KEY);
        for job in jobs {
            let payload = serde_json::to_string(job).context("Failed to serialize job")?;
            let seq = Self::next_seq(&mut conn).await?;
            cmd.arg(Self::score(job.priority, seq)).arg(payload);
        }

        cmd.query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to bulk-push jobs to queue")?;

        self.bump_tenant(&mut conn, &jobs[0].tenant_id, jobs.len() as i64)
            .await?;

        debug!("Bulk-enqueued {} jobs", jobs.len());

        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Job>> {
        let mut conn = self.conn.lock().await;

        let popped: Vec<(String, f64)> = redis::cmd("ZPOPMIN")
            .arg(QUEUE_KEY)
            .arg(1)
            .query_async(&mut *conn)
            .await
            .context("Failed to pop job from queue")?;

        let Some((payload, _score)) = popped.into_iter().next() else {
            return Ok(None);
        };

        let job: Job = serde_json::from_str(&payload).context("Failed to deserialize job")?;

        self.bump_tenant(&mut conn, &job.tenant_id, -1).await?;

        debug!("Dequeued job {} for {}", job.id, job.url);

        Ok(Some(job))
    }

    async fn update_progress(&self, job_id: &str, progress: &JobProgress) -> Result<()> {
        let payload = serde_json::to_string(progress).context("Failed to serialize progress")?;

        let mut conn = self.conn.lock().await;

        redis::cmd("SET")
            .arg(Self::progress_key(job_id))
            .arg(payload)
            .arg("EX")
            .arg(self.task_ttl)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to store job progress")?;

        Ok(())
    }

    async fn move_to_failed(&self, job: &Job, error: &str, retryable: bool) -> Result<()> {
        if retryable {
            debug!("Re-enqueueing retryable job {}: {}", job.id, error);
            return self.enqueue(job).await;
        }

        let mut conn = self.conn.lock().await;

        redis::cmd("SADD")
            .arg("queue:failed")
            .arg(&job.id)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to add job to failed set")?;

        redis::cmd("SET")
            .arg(Self::error_key(&job.id))
            .arg(error)
            .arg("EX")
            .arg(self.task_ttl)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to store job error")?;

        debug!("Marked job {} as failed: {}", job.id, error);

        Ok(())
    }

    async fn pending_count(&self, tenant_id: &str) -> Result<u64> {
        let mut conn = self.conn.lock().await;

        let count: Option<i64> = redis::cmd("GET")
            .arg(Self::tenant_key(tenant_id))
            .query_async(&mut *conn)
            .await
            .context("Failed to read tenant pending counter")?;

        Ok(count.unwrap_or(0).max(0) as u64)
    }
}
