use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::crawl::types::JobProgress;

/// One progress report from a worker.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub crawl_id: String,
    pub job_id: String,
    pub progress: JobProgress,
}

/// Worker-side handle: fire-and-forget progress reports over a channel.
#[derive(Clone)]
pub struct ProgressTracker {
    sender: mpsc::UnboundedSender<ProgressUpdate>,
}

impl ProgressTracker {
    pub fn report(&self, update: ProgressUpdate) {
        // A closed aggregator only means the process is shutting down
        let _ = self.sender.send(update);
    }
}

/// Aggregates worker progress per crawl. Subscribers read the latest
/// snapshot; workers never block on slow readers.
pub struct ProgressAggregator {
    receiver: mpsc::UnboundedReceiver<ProgressUpdate>,
    latest: Arc<Mutex<HashMap<String, JobProgress>>>,
}

impl ProgressAggregator {
    /// Read-side handle onto the latest per-crawl progress.
    pub fn snapshots(&self) -> ProgressSnapshots {
        ProgressSnapshots {
            latest: self.latest.clone(),
        }
    }

    /// Consume updates until all trackers are dropped.
    pub async fn run(mut self) {
        while let Some(update) = self.receiver.recv().await {
            debug!(
                "Crawl {} progress: {}/{} ({})",
                update.crawl_id, update.progress.current, update.progress.total,
                update.progress.status
            );
            let mut latest = self.latest.lock().await;
            latest.insert(update.crawl_id, update.progress);
        }
    }
}

/// Cloneable reader over aggregated progress.
#[derive(Clone)]
pub struct ProgressSnapshots {
    latest: Arc<Mutex<HashMap<String, JobProgress>>>,
}

impl ProgressSnapshots {
    pub async fn get(&self, crawl_id: &str) -> Option<JobProgress> {
        self.latest.lock().await.get(crawl_id).cloned()
    }
}

/// Build a connected tracker/aggregator pair.
pub fn channel() -> (ProgressTracker, ProgressAggregator) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        ProgressTracker { sender },
        ProgressAggregator {
            receiver,
            latest: Arc::new(Mutex::new(HashMap::new())),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(current: u64, total: u64) -> JobProgress {
        JobProgress {
            current,
            total,
            status: "fetching".to_string(),
            current_document_url: None,
            current_document: None,
        }
    }

    #[tokio::test]
    async fn test_aggregator_keeps_latest_per_crawl() {
        let (tracker, aggregator) = channel();
        let snapshots = aggregator.snapshots();
        let handle = tokio::spawn(aggregator.run());

        tracker.report(ProgressUpdate {
            crawl_id: "c1".to_string(),
            job_id: "j1".to_string(),
            progress: progress(1, 3),
        });
        tracker.report(ProgressUpdate {
            crawl_id: "c1".to_string(),
            job_id: "j2".to_string(),
            progress: progress(2, 4),
        });

        drop(tracker);
        handle.await.unwrap();

        let latest = snapshots.get("c1").await.unwrap();
        assert_eq!(latest.current, 2);
        assert_eq!(latest.total, 4);
        assert!(snapshots.get("c2").await.is_none());
    }
}
