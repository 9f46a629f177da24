//! Exponential backoff for retryable request failures.

use std::time::Duration;

use rand::Rng;

use crate::config::QueueConfig;

/// Backoff state for one queue head (or one main-queue request).
///
/// The first wait is `min_wait` plus random jitter; each following wait
/// doubles, capped at `max_wait`.
#[derive(Clone, Debug)]
pub struct RequestThrottle {
    min_wait: Duration,
    jitter: Duration,
    max_wait: Duration,
    max_retries: u32,
    retry_count: u32,
    current_wait: Option<Duration>,
}

impl RequestThrottle {
    pub fn new(cfg: &QueueConfig) -> Self {
        Self {
            min_wait: cfg.retry_min_wait,
            jitter: cfg.retry_jitter,
            max_wait: cfg.retry_max_wait,
            max_retries: cfg.max_request_retries,
            retry_count: 0,
            current_wait: None,
        }
    }

    /// Number of waits handed out since the last `clear`.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// True once the retry ceiling is reached (never when unbounded).
    pub fn is_exhausted(&self) -> bool {
        self.max_retries > 0 && self.retry_count >= self.max_retries
    }

    /// Compute the next wait and count the retry.
    pub fn next_wait(&mut self) -> Duration {
        let wait = match self.current_wait {
            Some(prev) => prev.saturating_mul(2).min(self.max_wait),
            None => {
                let jitter_ms = self.jitter.as_millis().min(u128::from(u64::MAX)) as u64;
                let extra = if jitter_ms == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=jitter_ms)
                };
                (self.min_wait + Duration::from_millis(extra)).min(self.max_wait)
            }
        };
        self.current_wait = Some(wait);
        self.retry_count = self.retry_count.saturating_add(1);
        wait
    }

    pub fn clear(&mut self) {
        self.retry_count = 0;
        self.current_wait = None;
    }
}
