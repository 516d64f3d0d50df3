pub mod robots;
pub mod sitemap;

// Re-export common types
pub use robots::{RobotsClient, RobotsFetcher};
pub use sitemap::{SitemapClient, SitemapEntry, SitemapFetcher};
