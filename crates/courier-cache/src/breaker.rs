use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

/// Failure-isolation gate for one cache shard.
///
/// Tracks the outcome of the most recent calls in a fixed-size ring. When the
/// failure ratio over a full ring reaches the configured threshold the
/// breaker opens and calls fail fast without touching the network. After a
/// cooldown the breaker lets a single probe call through (half-open); the
/// probe's outcome decides between closing and re-opening.
pub struct CircuitBreaker {
    name: String,
    inner: Mutex<BreakerInner>,
    window_size: usize,
    failure_ratio: f64,
    open_cooldown: Duration,
}

struct BreakerInner {
    window: VecDeque<bool>,
    state: BreakerState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open { until_probe: Instant },
    HalfOpen,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, window_size: usize, failure_ratio: f64, open_cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(BreakerInner {
                window: VecDeque::with_capacity(window_size),
                state: BreakerState::Closed,
            }),
            window_size: window_size.max(1),
            failure_ratio,
            open_cooldown,
        }
    }

    /// Returns `true` when the call may proceed. In the open state only the
    /// first caller after the cooldown gets through, as the half-open probe.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open { until_probe } => {
                if Instant::now() >= until_probe {
                    inner.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.state = BreakerState::Closed;
            inner.window.clear();
        }
        push_outcome(&mut inner.window, self.window_size, true);
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();

        if inner.state == BreakerState::HalfOpen {
            // Probe failed; go straight back to open.
            inner.state = BreakerState::Open {
                until_probe: Instant::now() + self.open_cooldown,
            };
            inner.window.clear();
            warn!("cache breaker {} re-opened after failed probe", self.name);
            return;
        }

        push_outcome(&mut inner.window, self.window_size, false);

        if inner.window.len() == self.window_size {
            let failures = inner.window.iter().filter(|ok| !**ok).count();
            let ratio = failures as f64 / self.window_size as f64;
            if ratio >= self.failure_ratio {
                inner.state = BreakerState::Open {
                    until_probe: Instant::now() + self.open_cooldown,
                };
                inner.window.clear();
                warn!(
                    "cache breaker {} opened ({}/{} recent calls failed)",
                    self.name, failures, self.window_size
                );
            }
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.inner.lock().state, BreakerState::Open { .. })
    }
}

fn push_outcome(window: &mut VecDeque<bool>, cap: usize, ok: bool) {
    if window.len() == cap {
        window.pop_front();
    }
    window.push_back(ok);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("test", 4, 0.5, Duration::from_millis(20))
    }

    #[test]
    fn stays_closed_below_threshold() {
        let b = breaker();
        b.record_failure();
        b.record_success();
        b.record_success();
        b.record_success();
        assert!(!b.is_open());
        assert!(b.try_acquire());
    }

    #[test]
    fn opens_at_failure_ratio_and_fails_fast() {
        let b = breaker();
        b.record_success();
        b.record_success();
        b.record_failure();
        b.record_failure();
        // 2/4 failed == ratio 0.5
        assert!(b.is_open());
        assert!(!b.try_acquire());
    }

    #[test]
    fn half_open_probe_closes_on_success() {
        let b = breaker();
        for _ in 0..4 {
            b.record_failure();
        }
        assert!(b.is_open());

        std::thread::sleep(Duration::from_millis(25));
        assert!(b.try_acquire()); // probe allowed
        b.record_success();
        assert!(!b.is_open());
        assert!(b.try_acquire());
    }

    #[test]
    fn half_open_probe_reopens_on_failure() {
        let b = breaker();
        for _ in 0..4 {
            b.record_failure();
        }
        std::thread::sleep(Duration::from_millis(25));
        assert!(b.try_acquire());
        b.record_failure();
        assert!(b.is_open());
        assert!(!b.try_acquire());
    }
}
