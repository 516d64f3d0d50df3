pub mod memory;
pub mod queue;
pub mod store;

use std::sync::Arc;

use anyhow::Result;

use crate::cli::config::{QueueSettings, StoreSettings};
use memory::{MemoryQueue, MemoryStore};
use queue::RedisQueue;
use store::RedisStore;

// Re-export common types
pub use queue::JobQueue;
pub use store::CrawlStore;

/// Factory for creating a CrawlStore implementation.
pub struct StoreFactory;

impl StoreFactory {
    /// Create a new store instance based on the settings
    pub async fn create(settings: &StoreSettings) -> Result<Arc<dyn CrawlStore>> {
        match settings.backend.as_str() {
            "redis" => {
                let store = RedisStore::new(settings).await?;
                Ok(Arc::new(store))
            }
            "memory" => Ok(Arc::new(MemoryStore::new())),
            _ => {
                anyhow::bail!("Unsupported store backend: {}", settings.backend);
            }
        }
    }
}

/// Factory for creating a JobQueue implementation.
pub struct QueueFactory;

impl QueueFactory {
    /// Create a new queue instance based on the settings
    pub async fn create(settings: &QueueSettings) -> Result<Arc<dyn JobQueue>> {
        match settings.backend.as_str() {
            "redis" => {
                let queue = RedisQueue::new(settings).await?;
                Ok(Arc::new(queue))
            }
            "memory" => Ok(Arc::new(MemoryQueue::new())),
            _ => {
                anyhow::bail!("Unsupported queue backend: {}", settings.backend);
            }
        }
    }
}
