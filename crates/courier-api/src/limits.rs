use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use uuid::Uuid;

/// What the limiter decided for one request. No exceptions, no side
/// channels: the HTTP layer maps these to status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    /// Over the window budget; come back after `retry_after`.
    RateLimited { retry_after: Duration },
    /// Far over budget; the client must solve a push challenge before any
    /// further sends are accepted.
    Blocked,
}

/// Multiplier over the window budget at which throttling escalates from
/// 429 to a push challenge.
const BLOCK_MULTIPLIER: u32 = 3;

/// Sliding-window rate limiter for message sends, keyed by sender account.
/// Same shape as the gateway's connection limiter; the per-account budget is
/// configured, not hard-coded.
pub struct MessageRateLimiter {
    state: Arc<Mutex<HashMap<Uuid, Vec<Instant>>>>,
    max_per_window: u32,
    window: Duration,
    /// Counter for periodic full sweep to prevent memory growth from
    /// accounts that never return.
    call_count: Arc<AtomicU64>,
}

impl MessageRateLimiter {
    pub fn new(max_per_window: u32, window: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(HashMap::new())),
            max_per_window,
            window,
            call_count: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn check(&self, account: Uuid) -> Decision {
        let mut map = self.state.lock().unwrap();
        let now = Instant::now();

        // Every 100th call, sweep all accounts to prune stale entries.
        let count = self.call_count.fetch_add(1, Ordering::Relaxed);
        if count % 100 == 0 {
            let window = self.window;
            map.retain(|_, timestamps| {
                timestamps.retain(|t| now.duration_since(*t) < window);
                !timestamps.is_empty()
            });
        }

        let timestamps = map.entry(account).or_default();
        timestamps.retain(|t| now.duration_since(*t) < self.window);

        let used = timestamps.len() as u32;
        if used >= self.max_per_window.saturating_mul(BLOCK_MULTIPLIER) {
            // Keep recording so a hammering client stays blocked.
            timestamps.push(now);
            return Decision::Blocked;
        }
        if used >= self.max_per_window {
            timestamps.push(now);
            let oldest = timestamps.first().copied().unwrap_or(now);
            let retry_after = self
                .window
                .saturating_sub(now.duration_since(oldest));
            return Decision::RateLimited { retry_after };
        }

        timestamps.push(now);
        Decision::Allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_budget() {
        let limiter = MessageRateLimiter::new(3, Duration::from_secs(60));
        let account = Uuid::new_v4();
        for _ in 0..3 {
            assert_eq!(limiter.check(account), Decision::Allowed);
        }
        assert!(matches!(
            limiter.check(account),
            Decision::RateLimited { .. }
        ));
    }

    #[test]
    fn retry_after_is_within_window() {
        let limiter = MessageRateLimiter::new(1, Duration::from_secs(60));
        let account = Uuid::new_v4();
        assert_eq!(limiter.check(account), Decision::Allowed);
        match limiter.check(account) {
            Decision::RateLimited { retry_after } => {
                assert!(retry_after <= Duration::from_secs(60));
            }
            other => panic!("unexpected decision {:?}", other),
        }
    }

    #[test]
    fn escalates_to_blocked() {
        let limiter = MessageRateLimiter::new(2, Duration::from_secs(60));
        let account = Uuid::new_v4();
        let mut last = Decision::Allowed;
        for _ in 0..10 {
            last = limiter.check(account);
        }
        assert_eq!(last, Decision::Blocked);
    }

    #[test]
    fn accounts_are_isolated() {
        let limiter = MessageRateLimiter::new(1, Duration::from_secs(60));
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(limiter.check(a), Decision::Allowed);
        assert!(matches!(limiter.check(a), Decision::RateLimited { .. }));
        assert_eq!(limiter.check(b), Decision::Allowed);
    }
}
