//! Retry with exponential backoff for fetchers and committers.

use std::future::Future;
use std::time::Duration;

use crate::fingerprint::Fingerprint;

/// How many times a failing fetch or commit is retried, and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Retries after the first attempt
  pub max_retries: u32,
  /// Delay before the first retry; doubles for every further retry
  pub backoff: Duration,
  pub max_backoff: Duration,
}

impl RetryPolicy {
  /// A single attempt, no retries.
  pub fn none() -> Self {
    Self {
      max_retries: 0,
      backoff: Duration::ZERO,
      max_backoff: Duration::ZERO,
    }
  }

  pub fn new(max_retries: u32, backoff: Duration) -> Self {
    Self {
      max_retries,
      backoff,
      max_backoff: Duration::from_secs(30),
    }
  }

  /// Delay before retry number `retry` (1-based).
  pub fn delay_for(&self, retry: u32) -> Duration {
    let factor = 2u32.saturating_pow(retry.saturating_sub(1));
    self.backoff.saturating_mul(factor).min(self.max_backoff)
  }

  /// Run `attempt` until it succeeds or retries are exhausted, returning the last error.
  /// `on_retry` is called with the retry number before each retry.
  pub(crate) async fn run<T, F, Fut>(
    &self,
    operation: &'static str,
    fingerprint: &Fingerprint,
    mut attempt: F,
    mut on_retry: impl FnMut(u32),
  ) -> color_eyre::Result<T>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = color_eyre::Result<T>>,
  {
    let mut retries = 0;
    loop {
      match attempt().await {
        Ok(value) => return Ok(value),
        Err(e) if retries < self.max_retries => {
          retries += 1;
          let delay = self.delay_for(retries);
          tracing::warn!(
            %fingerprint,
            operation,
            retry = retries,
            delay_ms = delay.as_millis() as u64,
            error = %e,
            "attempt failed, retrying"
          );
          on_retry(retries);
          tokio::time::sleep(delay).await;
        }
        Err(e) => return Err(e),
      }
    }
  }
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 2,
      backoff: Duration::from_millis(100),
      max_backoff: Duration::from_secs(5),
    }
  }
}
