use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cli::config::WebhookSettings;
use crate::crawl::types::{Document, DocumentMetadata, Job};

/// Per-document webhook body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub crawl_id: String,
    pub job_id: String,
    pub url: String,
    pub metadata: DocumentMetadata,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub markdown: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_metadata: Option<Value>,
}

impl WebhookPayload {
    pub fn from_document(job: &Job, document: &Document) -> Self {
        Self {
            crawl_id: job.crawl_id.clone(),
            job_id: job.id.clone(),
            url: job.url.clone(),
            metadata: document.metadata.clone(),
            content: document.content.clone(),
            html: document.html.clone(),
            markdown: document.markdown.clone(),
            webhook_metadata: job.webhook_metadata.clone(),
        }
    }
}

/// At-least-once webhook delivery with bounded backoff. Delivery problems
/// are logged, never surfaced to the job.
pub struct WebhookNotifier {
    client: Client,
    max_attempts: u32,
    backoff_base: Duration,
}

impl WebhookNotifier {
    pub fn new(settings: &WebhookSettings) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            client,
            max_attempts: settings.max_attempts.max(1),
            backoff_base: Duration::from_millis(settings.backoff_base_ms),
        }
    }

    pub async fn deliver(&self, urls: &[String], payload: &WebhookPayload) {
        for url in urls {
            self.deliver_one(url, payload).await;
        }
    }

    async fn deliver_one(&self, url: &str, payload: &WebhookPayload) {
        for attempt in 0..self.max_attempts {
            match self.client.post(url).json(payload).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!("Webhook delivered to {} for job {}", url, payload.job_id);
                    return;
                }
                Ok(response) => {
                    warn!(
                        "Webhook {} answered {} (attempt {}/{})",
                        url,
                        response.status(),
                        attempt + 1,
                        self.max_attempts
                    );
                }
                Err(e) => {
                    warn!(
                        "Webhook {} failed: {} (attempt {}/{})",
                        url,
                        e,
                        attempt + 1,
                        self.max_attempts
                    );
                }
            }

            if attempt + 1 < self.max_attempts {
                tokio::time::sleep(self.backoff_base * 2u32.pow(attempt)).await;
            }
        }

        warn!("Giving up webhook delivery to {} for job {}", url, payload.job_id);
    }
}
