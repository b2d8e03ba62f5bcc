use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::ImageTransport;
use crate::{config::PipelineConfig, error::NetworkError, key::Locator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first.
    pub retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            retries: config.retry_count,
            base_delay: config.retry_delay,
        }
    }

    /// Wait after failed attempt `attempt` (0-based): `base * 2^attempt`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

/// Up to `retries + 1` attempts with exponential backoff and no jitter.
///
/// Cancellation during an attempt or a backoff sleep returns
/// [`NetworkError::Cancelled`] at once.
pub async fn fetch_with_retry(
    transport: &dyn ImageTransport,
    locator: &Locator,
    policy: RetryPolicy,
    cancel: &CancellationToken,
) -> Result<Bytes, NetworkError> {
    let cancelled = || NetworkError::Cancelled(locator.address().to_string());
    let mut attempt = 0u32;

    loop {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            res = transport.fetch(locator) => res,
        };

        let err = match outcome {
            Ok(bytes) => return Ok(bytes),
            Err(e) => e,
        };

        if attempt >= policy.retries {
            log::warn!(
                "image fetch failed; url={}, attempts={}, err={}",
                locator.address(),
                attempt + 1,
                err
            );
            return Err(err);
        }

        let delay = policy.delay_after(attempt);
        log::debug!(
            "image fetch attempt failed; url={}, attempt={}, \
             retry_in_ms={}, err={}",
            locator.address(),
            attempt + 1,
            delay.as_millis(),
            err
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}
