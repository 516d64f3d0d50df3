pub mod coordinator;
pub mod crawler;
pub mod policy;
pub mod priority;
pub mod types;

// Re-export common types
pub use coordinator::{CrawlCoordinator, Submission, SubmitRequest};
pub use crawler::{LinkDiscovery, UrlState};
pub use types::{CrawlerOptions, Document, Job, PageOptions, StoredCrawl};
