use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub deployment: DeploymentSettings,
    pub store: StoreSettings,
    pub queue: QueueSettings,
    pub fetch: FetchSettings,
    pub worker: WorkerSettings,
    pub webhook: WebhookSettings,
    pub site: SiteSettings,
}

/// Deployment-level settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DeploymentSettings {
    /// Local deployments build http:// resource URLs instead of https://.
    pub local: bool,
    /// Host used when building crawl resource URLs.
    pub public_host: String,
    pub user_agent: String,
}

/// KV store settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoreSettings {
    pub backend: String, // "redis", "memory"
    pub redis_url: String,
    /// Coarse TTL for crawl state in seconds
    pub ttl_secs: u64,
    /// TTL for cached documents in seconds
    pub cache_ttl_secs: u64,
}

/// Queue settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct QueueSettings {
    pub backend: String, // "redis", "memory"
    pub redis_url: String,
    /// Time to live for per-job bookkeeping keys in seconds
    pub task_ttl: u64,
}

/// Fetch client settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FetchSettings {
    /// Rendering service endpoint
    pub render_service_url: String,
    /// Base per-request timeout in milliseconds; each job adds its own
    /// wait_for on top.
    pub base_timeout_ms: u64,
    /// In-flight fetches allowed per worker
    pub concurrent_requests: usize,
}

/// Worker pool settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WorkerSettings {
    /// Worker task count; 0 means one per CPU core
    pub count: usize,
    /// Retry cap for transient fetch failures
    pub max_retries: u32,
    /// First backoff delay in milliseconds; doubles per attempt
    pub backoff_base_ms: u64,
    /// Poll interval when the queue is empty, in milliseconds
    pub idle_poll_ms: u64,
}

/// Webhook delivery settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WebhookSettings {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
}

/// Sitemap and robots client settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SiteSettings {
    pub robots_timeout_ms: u64,
    pub sitemap_timeout_ms: u64,
    /// Cap on sitemap files fetched while resolving indexes
    pub max_sitemap_fetches: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            deployment: DeploymentSettings {
                local: false,
                public_host: "localhost:3002".to_string(),
                user_agent: "webharvest/0.1".to_string(),
            },
            store: StoreSettings {
                backend: "redis".to_string(),
                redis_url: "redis://localhost:6379".to_string(),
                ttl_secs: 86400,
                cache_ttl_secs: 3600,
            },
            queue: QueueSettings {
                backend: "redis".to_string(),
                redis_url: "redis://localhost:6379".to_string(),
                task_ttl: 86400,
            },
            fetch: FetchSettings {
                render_service_url: "http://localhost:3000/scrape".to_string(),
                base_timeout_ms: 30000,
                concurrent_requests: 20,
            },
            worker: WorkerSettings {
                count: 0,
                max_retries: 3,
                backoff_base_ms: 500,
                idle_poll_ms: 100,
            },
            webhook: WebhookSettings {
                max_attempts: 3,
                backoff_base_ms: 1000,
            },
            site: SiteSettings {
                robots_timeout_ms: 5000,
                sitemap_timeout_ms: 10000,
                max_sitemap_fetches: 50,
            },
        }
    }
}

impl AppConfig {
    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        let path = if let Some(proj_dirs) =
            directories::ProjectDirs::from("com", "webharvest", "webharvest")
        {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        };

        if !path.exists() {
            if let Err(e) = fs::create_dir_all(&path) {
                error!("Failed to create config directory: {}", e);
            }
        }

        path
    }

    /// Load the default configuration, creating it on first run, then apply
    /// environment overrides.
    pub fn load_default() -> Result<Self> {
        let config_path = Self::config_dir().join("default.yaml");

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            config.save_as_default()?;
            config
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a file
    fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))?;

        Ok(config)
    }

    /// Save the configuration as the default
    pub fn save_as_default(&self) -> Result<()> {
        let config_path = Self::config_dir().join("default.yaml");
        self.save_to_file(&config_path)
    }

    /// Save the configuration to a file
    fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }

    /// Environment variables override the file-based configuration for the
    /// deployment knobs that differ per environment.
    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("WEBHARVEST_LOCAL") {
            self.deployment.local = value == "1" || value.eq_ignore_ascii_case("true");
        }
        if let Ok(value) = std::env::var("RENDER_SERVICE_URL") {
            self.fetch.render_service_url = value;
        }
        if let Ok(value) = std::env::var("WEBHARVEST_TIMEOUT_MS") {
            if let Ok(timeout) = value.parse() {
                self.fetch.base_timeout_ms = timeout;
            }
        }
        if let Ok(value) = std::env::var("REDIS_URL") {
            self.store.redis_url = value.clone();
            self.queue.redis_url = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert!(!config.deployment.local);
        assert_eq!(config.worker.max_retries, 3);
        assert_eq!(config.fetch.concurrent_requests, 20);
    }

    #[test]
    fn test_config_round_trips_through_yaml() {
        let config = AppConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: AppConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.store.backend, config.store.backend);
        assert_eq!(parsed.fetch.base_timeout_ms, config.fetch.base_timeout_ms);
    }
}
