//! Sliding-window admission control.
//!
//! Each key keeps the timestamps of its accepted requests inside the trailing
//! window. Entries at or before `now - window` are purged lazily on every
//! check, so a key admits at most `capacity` requests in any window-length
//! interval.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub window: Duration,
    pub capacity: u32,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self { window: Duration::seconds(60), capacity: 60 }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub retry_after: StdDuration,
    pub limit: u32,
    pub remaining: u32,
}

#[derive(Debug, Default)]
struct RateWindow {
    accepted: VecDeque<DateTime<Utc>>,
}

impl RateWindow {
    fn prune(&mut self, now: DateTime<Utc>, window: Duration) {
        let cutoff = now - window;
        while self.accepted.front().is_some_and(|oldest| *oldest <= cutoff) {
            self.accepted.pop_front();
        }
    }

    fn record(&mut self, now: DateTime<Utc>) {
        // Callers sample the clock before taking the lock, so arrivals can be
        // slightly out of order; keep the deque sorted for front pruning.
        let position = self.accepted.partition_point(|existing| *existing <= now);
        self.accepted.insert(position, now);
    }

    fn retry_after(&self, now: DateTime<Utc>, window: Duration) -> StdDuration {
        self.accepted
            .front()
            .map(|oldest| window - (now - *oldest))
            .and_then(|wait| wait.to_std().ok())
            .unwrap_or(StdDuration::ZERO)
    }

    fn is_full(&self, capacity: u32) -> bool {
        self.accepted.len() >= capacity as usize
    }

    fn remaining(&self, capacity: u32) -> u32 {
        let used = u32::try_from(self.accepted.len()).unwrap_or(u32::MAX);
        capacity.saturating_sub(used)
    }
}

/// In-memory limiter shared by every request task. The key map lock is held
/// only to find a key's window; each window then has its own lock.
#[derive(Debug, Default)]
pub struct SlidingWindowLimiter {
    policy: RateLimitPolicy,
    windows: Mutex<HashMap<String, Arc<Mutex<RateWindow>>>>,
}

impl SlidingWindowLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self { policy, windows: Mutex::new(HashMap::new()) }
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    pub fn admit(&self, key: &str, now: DateTime<Utc>) -> RateDecision {
        self.admit_all(&[key], now)
    }

    /// Admits only if every key has room; on success all keys record `now`,
    /// on denial none do. `retry_after` is the longest wait among full keys.
    pub fn admit_all(&self, keys: &[&str], now: DateTime<Utc>) -> RateDecision {
        let RateLimitPolicy { window, capacity } = self.policy;

        let mut ordered = keys.to_vec();
        ordered.sort_unstable();
        ordered.dedup();
        let slots = ordered.iter().map(|key| (*key, self.window_for(key))).collect::<Vec<_>>();
        let mut guards = slots.iter().map(|(key, slot)| (*key, lock(&**slot))).collect::<Vec<_>>();

        let mut retry_after = StdDuration::ZERO;
        let mut denied_key = None;
        for (key, window_state) in guards.iter_mut() {
            window_state.prune(now, window);
            if window_state.is_full(capacity) {
                let wait = window_state.retry_after(now, window);
                if denied_key.is_none() || wait > retry_after {
                    retry_after = wait;
                    denied_key = Some(*key);
                }
            }
        }

        if let Some(key) = denied_key {
            warn!(
                event_name = "rate_limit.denied",
                rate_key = key,
                limit = capacity,
                retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
                "rate limit exceeded"
            );
            return RateDecision { allowed: false, retry_after, limit: capacity, remaining: 0 };
        }

        let mut remaining = capacity;
        for (_, window_state) in guards.iter_mut() {
            window_state.record(now);
            remaining = remaining.min(window_state.remaining(capacity));
        }
        debug!(event_name = "rate_limit.admitted", remaining, "request admitted");

        RateDecision { allowed: true, retry_after: StdDuration::ZERO, limit: capacity, remaining }
    }

    /// Drops keys whose windows have fully drained; returns how many were removed.
    pub fn prune_idle(&self, now: DateTime<Utc>) -> usize {
        let window = self.policy.window;
        let mut windows = lock(&self.windows);
        let before = windows.len();
        windows.retain(|_, slot| match slot.try_lock() {
            Ok(mut state) => {
                state.prune(now, window);
                !state.accepted.is_empty()
            }
            Err(_) => true,
        });
        before - windows.len()
    }

    pub fn tracked_keys(&self) -> usize {
        lock(&self.windows).len()
    }

    fn window_for(&self, key: &str) -> Arc<Mutex<RateWindow>> {
        let mut windows = lock(&self.windows);
        Arc::clone(windows.entry(key.to_string()).or_default())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    use chrono::{DateTime, Duration, TimeZone, Utc};

    use super::{RateLimitPolicy, SlidingWindowLimiter};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).single().expect("valid timestamp")
    }

    fn limiter(capacity: u32, window_secs: i64) -> SlidingWindowLimiter {
        SlidingWindowLimiter::new(RateLimitPolicy {
            window: Duration::seconds(window_secs),
            capacity,
        })
    }

    #[test]
    fn sixty_per_minute_scenario() {
        let limiter = limiter(60, 60);
        for index in 0..60 {
            let decision = limiter.admit("s1", t0());
            assert!(decision.allowed, "call {index} should be admitted");
        }

        let denied = limiter.admit("s1", t0());
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, StdDuration::from_secs(60));
        assert_eq!(denied.remaining, 0);

        let later = limiter.admit("s1", t0() + Duration::seconds(61));
        assert!(later.allowed);
        assert_eq!(later.remaining, 59);
    }

    #[test]
    fn waiting_retry_after_is_enough() {
        let limiter = limiter(3, 60);
        limiter.admit("k", t0());
        limiter.admit("k", t0() + Duration::seconds(10));
        limiter.admit("k", t0() + Duration::seconds(20));

        let now = t0() + Duration::seconds(30);
        let denied = limiter.admit("k", now);
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, StdDuration::from_secs(30));

        let retry_at = now + Duration::from_std(denied.retry_after).expect("fits");
        assert!(limiter.admit("k", retry_at).allowed);
    }

    #[test]
    fn boundary_timestamp_is_outside_the_window() {
        let limiter = limiter(1, 60);
        assert!(limiter.admit("k", t0()).allowed);
        assert!(!limiter.admit("k", t0() + Duration::milliseconds(59_999)).allowed);
        assert!(limiter.admit("k", t0() + Duration::seconds(60)).allowed);
    }

    #[test]
    fn denied_calls_do_not_consume_capacity() {
        let limiter = limiter(2, 60);
        limiter.admit("k", t0());
        limiter.admit("k", t0());
        for _ in 0..10 {
            assert!(!limiter.admit("k", t0() + Duration::seconds(1)).allowed);
        }
        assert!(limiter.admit("k", t0() + Duration::seconds(60)).allowed);
    }

    #[test]
    fn keys_are_independent() {
        let limiter = limiter(1, 60);
        assert!(limiter.admit("session:a", t0()).allowed);
        assert!(limiter.admit("session:b", t0()).allowed);
        assert!(!limiter.admit("session:a", t0()).allowed);
    }

    #[test]
    fn admit_all_is_all_or_nothing() {
        let limiter = limiter(1, 60);
        assert!(limiter.admit("client:10.0.0.1", t0()).allowed);

        let decision = limiter.admit_all(&["session:s1", "client:10.0.0.1"], t0());
        assert!(!decision.allowed);

        // the session key must not have been charged by the denied turn
        assert!(limiter.admit("session:s1", t0()).allowed);
    }

    #[test]
    fn admit_all_reports_longest_wait() {
        let limiter = limiter(1, 60);
        limiter.admit("a", t0());
        limiter.admit("b", t0() + Duration::seconds(30));

        let decision = limiter.admit_all(&["a", "b"], t0() + Duration::seconds(40));
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after, StdDuration::from_secs(50));
    }

    #[test]
    fn out_of_order_arrivals_stay_sorted() {
        let limiter = limiter(2, 60);
        limiter.admit("k", t0() + Duration::seconds(5));
        limiter.admit("k", t0());

        let denied = limiter.admit("k", t0() + Duration::seconds(10));
        assert_eq!(denied.retry_after, StdDuration::from_secs(50));
    }

    #[test]
    fn prune_idle_drops_drained_keys() {
        let limiter = limiter(5, 60);
        limiter.admit("old", t0());
        limiter.admit("fresh", t0() + Duration::seconds(50));

        assert_eq!(limiter.prune_idle(t0() + Duration::seconds(70)), 1);
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn concurrent_callers_never_exceed_capacity() {
        let limiter = Arc::new(limiter(50, 60));
        let handles = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    (0..20).filter(|_| limiter.admit("shared", t0()).allowed).count()
                })
            })
            .collect::<Vec<_>>();

        let admitted: usize = handles.into_iter().map(|handle| handle.join().unwrap_or(0)).sum();
        assert_eq!(admitted, 50);
    }
}
