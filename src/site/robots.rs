use async_trait::async_trait;
use reqwest::Client;
use robotstxt::DefaultMatcher;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::cli::config::SiteSettings;

/// Robots retrieval seam; the coordinator takes this as an injected
/// dependency.
#[async_trait]
pub trait RobotsFetcher: Send + Sync {
    /// Fetch the robots.txt for the seed's host, or None when the file is
    /// absent or unreachable. Never errors.
    async fn fetch_robots(&self, seed: &Url) -> Option<String>;
}

/// Best-effort robots.txt client. Failures never propagate to callers;
/// a missing robots.txt simply means no policy was retrieved.
pub struct RobotsClient {
    client: Client,
    user_agent: String,
}

impl RobotsClient {
    pub fn new(settings: &SiteSettings, user_agent: &str) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.robots_timeout_ms))
            .build()
            .unwrap_or_default();

        Self {
            client,
            user_agent: user_agent.to_string(),
        }
    }

    fn robots_url(seed: &Url) -> Option<String> {
        let host = seed.host_str()?;
        Some(format!("{}://{}/robots.txt", seed.scheme(), host))
    }
}

#[async_trait]
impl RobotsFetcher for RobotsClient {
    async fn fetch_robots(&self, seed: &Url) -> Option<String> {
        let robots_url = Self::robots_url(seed)?;

        debug!("Fetching robots.txt from {}", robots_url);

        let response = self
            .client
            .get(&robots_url)
            .header("User-Agent", &self.user_agent)
            .send()
            .await
            .ok()?;

        if !response.status().is_success() {
            debug!("No robots.txt at {} ({})", robots_url, response.status());
            return None;
        }

        response.text().await.ok()
    }
}

/// Check a URL against fetched robots.txt rules.
pub fn is_allowed(robots_txt: &str, user_agent: &str, url: &str) -> bool {
    let mut matcher = DefaultMatcher::default();
    matcher.one_agent_allowed_by_robots(robots_txt, user_agent, url)
}
