//! Per-domain rate limiting with adaptive delays.
//!
//! Each registrable domain carries a current delay: requests to the same
//! domain wait out the remainder of that delay, failures grow it by 1.5x up
//! to a cap, and a success resets it to the minimum.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::normalize::domain_of;

pub const MIN_DELAY: Duration = Duration::from_secs(2);
pub const MAX_DELAY: Duration = Duration::from_secs(10);
pub const FAILURE_MULTIPLIER: f64 = 1.5;

#[derive(Debug, Clone, Copy)]
struct DomainState {
    last_request: Option<Instant>,
    delay: Duration,
}

impl Default for DomainState {
    fn default() -> Self {
        DomainState {
            last_request: None,
            delay: MIN_DELAY,
        }
    }
}

pub struct DomainRateLimiter {
    state: Mutex<HashMap<String, DomainState>>,
}

impl DomainRateLimiter {
    pub fn new() -> Self {
        DomainRateLimiter {
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Sleep out the remainder of the domain's delay, then stamp the
    /// request time. The lock is never held across the sleep.
    pub async fn wait_for(&self, url: &str) {
        let domain = domain_of(url);

        let wait = {
            let state = self.state.lock().await;
            match state.get(&domain) {
                Some(entry) => match entry.last_request {
                    Some(last) => entry.delay.checked_sub(last.elapsed()),
                    None => None,
                },
                None => None,
            }
        };

        if let Some(wait) = wait {
            if !wait.is_zero() {
                tracing::debug!(domain = %domain, wait_ms = wait.as_millis() as u64, "rate limit wait");
                tokio::time::sleep(wait).await;
            }
        }

        let mut state = self.state.lock().await;
        state.entry(domain).or_default().last_request = Some(Instant::now());
    }

    /// Reset the domain's delay to the minimum.
    pub async fn record_success(&self, url: &str) {
        let domain = domain_of(url);
        let mut state = self.state.lock().await;
        state.entry(domain).or_default().delay = MIN_DELAY;
    }

    /// Grow the domain's delay, capped at the maximum.
    pub async fn record_failure(&self, url: &str) {
        let domain = domain_of(url);
        let mut state = self.state.lock().await;
        let entry = state.entry(domain.clone()).or_default();
        let grown = entry.delay.as_secs_f64() * FAILURE_MULTIPLIER;
        entry.delay = Duration::from_secs_f64(grown.min(MAX_DELAY.as_secs_f64()));
        tracing::debug!(domain = %domain, delay_ms = entry.delay.as_millis() as u64, "rate limit grow");
    }

    /// Current delay per domain, for diagnostics.
    pub async fn delays(&self) -> HashMap<String, Duration> {
        let state = self.state.lock().await;
        state.iter().map(|(k, v)| (k.clone(), v.delay)).collect()
    }
}

impl Default for DomainRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_request_does_not_wait() {
        let limiter = DomainRateLimiter::new();
        let start = Instant::now();
        limiter.wait_for("https://example.com/a").await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_failure_grows_delay_to_cap() {
        let limiter = DomainRateLimiter::new();
        let url = "https://slow.example.com/x";
        for _ in 0..10 {
            limiter.record_failure(url).await;
        }
        let delays = limiter.delays().await;
        assert_eq!(delays["slow.example.com"], MAX_DELAY);
    }

    #[tokio::test]
    async fn test_success_resets_delay() {
        let limiter = DomainRateLimiter::new();
        let url = "https://flaky.example.com/x";
        limiter.record_failure(url).await;
        limiter.record_failure(url).await;
        limiter.record_success(url).await;
        let delays = limiter.delays().await;
        assert_eq!(delays["flaky.example.com"], MIN_DELAY);
    }

    #[tokio::test]
    async fn test_domains_tracked_independently() {
        let limiter = DomainRateLimiter::new();
        limiter.record_failure("https://a.example.com/1").await;
        limiter.record_success("https://b.example.com/1").await;
        let delays = limiter.delays().await;
        assert!(delays["a.example.com"] > delays["b.example.com"]);
    }

    #[tokio::test]
    async fn test_www_prefix_shares_domain() {
        let limiter = DomainRateLimiter::new();
        limiter.record_failure("https://www.example.com/1").await;
        let delays = limiter.delays().await;
        assert!(delays.contains_key("example.com"));
    }
}
