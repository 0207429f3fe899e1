//! Source fetches with retry and backoff.
//!
//! Only failures that may go away on their own are retried: connection
//! errors, timeouts, `429` and `5xx`. Any other non-2xx status means the
//! source does not have the resource and is returned immediately.

use reqwest::{Client, Response, StatusCode};
use std::time::Duration;
use tracing::warn;

/// Default number of fetch attempts (1 initial + 2 retries).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default backoff before the first retry in milliseconds. Doubles per retry.
pub const DEFAULT_BACKOFF_MS: u64 = 250;

/// Configuration for [`fetch_with_retry`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of attempts (minimum 1; 0 is treated as 1).
    pub max_attempts: u32,
    /// Sleep before the first retry; each later retry waits twice as long.
    pub backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Duration::from_millis(DEFAULT_BACKOFF_MS),
        }
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// GET `url`, retrying transient failures with exponential backoff.
///
/// # Errors
///
/// Returns the status error for a permanent non-2xx response, or the last
/// error seen once all attempts are used.
pub async fn fetch_with_retry(
    client: &Client,
    url: &str,
    config: &RetryConfig,
) -> Result<Response, reqwest::Error> {
    let max_attempts = config.max_attempts.max(1);
    let mut backoff = config.backoff;
    let mut attempt_no = 1;

    loop {
        let last_attempt = attempt_no >= max_attempts;
        match client.get(url).send().await {
            Ok(response) if response.status().is_success() => return Ok(response),
            Ok(response) if !is_transient_status(response.status()) || last_attempt => {
                warn!(
                    "Source fetch returned {} for {} (attempt {}/{})",
                    response.status(),
                    url,
                    attempt_no,
                    max_attempts
                );
                return response.error_for_status();
            }
            Ok(response) => {
                warn!(
                    "Source fetch returned {} for {} (attempt {}/{})",
                    response.status(),
                    url,
                    attempt_no,
                    max_attempts
                );
            }
            Err(e) if last_attempt => {
                warn!(
                    "Source fetch failed for {} (attempt {}/{}): {}",
                    url, attempt_no, max_attempts, e
                );
                return Err(e);
            }
            Err(e) => {
                warn!(
                    "Source fetch failed for {} (attempt {}/{}): {}",
                    url, attempt_no, max_attempts, e
                );
            }
        }

        warn!("Retrying source fetch in {}ms...", backoff.as_millis());
        tokio::time::sleep(backoff).await;
        backoff = backoff.saturating_mul(2);
        attempt_no += 1;
    }
}
