use thiserror::Error;

/// Error classes that callers branch on.
///
/// Policy rejections and lock contention are deliberately absent: both are
/// silent control flow in the crawler, not error values.
#[derive(Debug, Error)]
pub enum CrawlError {
    /// Malformed URL, uncompilable regex, invalid enum value. The ingress
    /// layer maps this to a 400 response.
    #[error("validation error: {0}")]
    Validation(String),

    /// Network reset, timeout, or 5xx from a fetch backend. Retried by the
    /// worker with backoff; converted to a permanent error at the retry cap.
    #[error("transient fetch error: {0}")]
    TransientFetch(String),

    /// 4xx or malformed response. Recorded as `page_error` on the emitted
    /// document, never retried.
    #[error("permanent fetch error: {0}")]
    PermanentFetch(String),

    /// KV store or queue unavailable. The only class that escapes the
    /// worker pipeline; the job is redelivered.
    #[error("infrastructure error: {0}")]
    Infrastructure(#[from] anyhow::Error),
}
