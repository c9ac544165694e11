use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Fixed-window budget: `limit` hits per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateRule {
    pub limit: u64,
    pub window: Duration,
}

impl RateRule {
    pub const fn per_minute(limit: u64) -> Self {
        Self {
            limit,
            window: Duration::from_secs(60),
        }
    }

    pub const fn per_quarter_hour(limit: u64) -> Self {
        Self {
            limit,
            window: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Default)]
pub struct RateLimiter {
    inner: Mutex<HashMap<String, RateState>>,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitOutcome {
    pub allowed: bool,
    pub remaining: u64,
    pub retry_after: Option<Duration>,
}

struct RateState {
    window_start: Instant,
    window: Duration,
    count: u64,
}

const PRUNE_THRESHOLD: usize = 10_000;

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn check(&self, key: &str, rule: RateRule) -> RateLimitOutcome {
        if rule.limit == 0 {
            return RateLimitOutcome {
                allowed: false,
                remaining: 0,
                retry_after: Some(rule.window),
            };
        }

        let mut guard = self.inner.lock().await;
        if guard.len() >= PRUNE_THRESHOLD {
            guard.retain(|_, state| state.window_start.elapsed() < state.window);
        }

        let now = Instant::now();
        let entry = guard.entry(key.to_string()).or_insert_with(|| RateState {
            window_start: now,
            window: rule.window,
            count: 0,
        });

        if entry.window_start.elapsed() >= rule.window {
            entry.window_start = now;
            entry.count = 0;
        }
        entry.window = rule.window;

        entry.count += 1;
        if entry.count > rule.limit {
            let retry_after = rule.window.saturating_sub(entry.window_start.elapsed());
            return RateLimitOutcome {
                allowed: false,
                remaining: 0,
                retry_after: Some(retry_after),
            };
        }

        RateLimitOutcome {
            allowed: true,
            remaining: rule.limit.saturating_sub(entry.count),
            retry_after: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn blocks_after_limit_and_resets_with_window() {
        let limiter = RateLimiter::new();
        let rule = RateRule::per_minute(2);

        assert!(limiter.check("auth:1.2.3.4", rule).await.allowed);
        let second = limiter.check("auth:1.2.3.4", rule).await;
        assert!(second.allowed);
        assert_eq!(second.remaining, 0);

        let blocked = limiter.check("auth:1.2.3.4", rule).await;
        assert!(!blocked.allowed);
        assert!(blocked.retry_after.unwrap() <= Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.check("auth:1.2.3.4", rule).await.allowed);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let limiter = RateLimiter::new();
        let rule = RateRule::per_minute(1);
        assert!(limiter.check("a", rule).await.allowed);
        assert!(!limiter.check("a", rule).await.allowed);
        assert!(limiter.check("b", rule).await.allowed);
    }

    #[tokio::test]
    async fn zero_limit_always_blocks() {
        let limiter = RateLimiter::new();
        let outcome = limiter.check("any", RateRule::per_quarter_hour(0)).await;
        assert!(!outcome.allowed);
        assert_eq!(outcome.retry_after, Some(Duration::from_secs(900)));
    }
}
