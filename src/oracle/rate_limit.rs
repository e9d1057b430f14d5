//! Outbound request rate limiters
//!
//! `FixedIntervalLimiter` spaces calls by a minimum interval (exchange REST
//! APIs). `SlidingWindowLimiter` enforces a request quota over a trailing
//! window (RapidAPI quota).

use async_trait::async_trait;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Gate awaited before every outbound request
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Block until the next request may be issued, then record it
    async fn wait_if_needed(&self);
}

/// Enforces a minimum gap between consecutive calls
#[derive(Debug)]
pub struct FixedIntervalLimiter {
    min_interval: Duration,
    // Held across the sleep so concurrent callers queue up behind each other
    last_call: tokio::sync::Mutex<Option<Instant>>,
}

impl FixedIntervalLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: tokio::sync::Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }
}

#[async_trait]
impl RateLimiter for FixedIntervalLimiter {
    async fn wait_if_needed(&self) {
        let mut last_call = self.last_call.lock().await;
        if let Some(last) = *last_call {
            let elapsed = last.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last_call = Some(Instant::now());
    }
}

/// Introspection snapshot exposed by the coinranking endpoints
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterStats {
    pub requests_this_minute: usize,
    pub queue_length: usize,
    pub limit: usize,
    pub window_ms: u64,
    pub available_slots: usize,
    /// Milliseconds until a slot frees up (0 when one is available)
    pub time_until_next_slot: u64,
}

/// Allows at most `limit` requests within any trailing `window`
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    limit: usize,
    window: Duration,
    requests: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            requests: Mutex::new(VecDeque::with_capacity(limit)),
        }
    }

    /// Lock the timestamp log with expired entries already dropped
    fn pruned(&self) -> MutexGuard<'_, VecDeque<Instant>> {
        let mut requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        while let Some(&oldest) = requests.front() {
            if now.duration_since(oldest) >= self.window {
                requests.pop_front();
            } else {
                break;
            }
        }
        requests
    }

    fn wait_for(&self, requests: &VecDeque<Instant>) -> Duration {
        if requests.len() < self.limit {
            return Duration::ZERO;
        }
        requests
            .front()
            .map(|&oldest| (oldest + self.window).saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }

    pub fn can_make_request(&self) -> bool {
        self.pruned().len() < self.limit
    }

    pub fn time_until_next_slot(&self) -> Duration {
        let requests = self.pruned();
        self.wait_for(&requests)
    }

    pub fn record_request(&self) {
        self.pruned().push_back(Instant::now());
    }

    pub fn requests_in_window(&self) -> usize {
        self.pruned().len()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn stats(&self, queue_length: usize) -> RateLimiterStats {
        let requests = self.pruned();
        RateLimiterStats {
            requests_this_minute: requests.len(),
            queue_length,
            limit: self.limit,
            window_ms: self.window.as_millis() as u64,
            available_slots: self.limit.saturating_sub(requests.len()),
            time_until_next_slot: self.wait_for(&requests).as_millis() as u64,
        }
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowLimiter {
    async fn wait_if_needed(&self) {
        loop {
            let wait = {
                let mut requests = self.pruned();
                if requests.len() < self.limit {
                    requests.push_back(Instant::now());
                    return;
                }
                self.wait_for(&requests)
            };
            tracing::debug!(wait_ms = wait.as_millis() as u64, "Rate limit window full");
            // A zero wait can only happen at the exact window edge; pruning on
            // the next pass frees the slot.
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fixed_interval_spacing() {
        let limiter = FixedIntervalLimiter::new(Duration::from_millis(100));

        limiter.wait_if_needed().await;
        let first = Instant::now();
        limiter.wait_if_needed().await;
        let second = Instant::now();

        assert!(second.duration_since(first) >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_interval_no_wait_after_gap() {
        let limiter = FixedIntervalLimiter::new(Duration::from_millis(100));
        limiter.wait_if_needed().await;
        tokio::time::sleep(Duration::from_millis(250)).await;

        let before = Instant::now();
        limiter.wait_if_needed().await;
        assert_eq!(Instant::now(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_interval_concurrent_callers_serialized() {
        let limiter = std::sync::Arc::new(FixedIntervalLimiter::new(Duration::from_millis(100)));
        let start = Instant::now();

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.wait_if_needed().await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(Instant::now().duration_since(start) >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_window_blocks_after_limit() {
        let limiter = SlidingWindowLimiter::new(50, Duration::from_millis(60_000));

        for _ in 0..50 {
            assert!(limiter.can_make_request());
            limiter.record_request();
        }
        assert!(!limiter.can_make_request());
        assert_eq!(limiter.time_until_next_slot(), Duration::from_millis(60_000));

        tokio::time::advance(Duration::from_millis(30_000)).await;
        assert!(!limiter.can_make_request());
        assert_eq!(limiter.time_until_next_slot(), Duration::from_millis(30_000));

        tokio::time::advance(Duration::from_millis(30_000)).await;
        assert!(limiter.can_make_request());
        assert_eq!(limiter.requests_in_window(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_window_wait_if_needed_sleeps_until_oldest_expires() {
        let limiter = SlidingWindowLimiter::new(2, Duration::from_millis(1000));
        let start = Instant::now();

        limiter.wait_if_needed().await;
        tokio::time::advance(Duration::from_millis(400)).await;
        limiter.wait_if_needed().await;
        limiter.wait_if_needed().await;

        // Third call waits for the first timestamp to leave the window
        assert!(Instant::now().duration_since(start) >= Duration::from_millis(1000));
        assert_eq!(limiter.requests_in_window(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_window_stats() {
        let limiter = SlidingWindowLimiter::new(3, Duration::from_millis(60_000));
        limiter.record_request();

        let stats = limiter.stats(4);
        assert_eq!(stats.requests_this_minute, 1);
        assert_eq!(stats.queue_length, 4);
        assert_eq!(stats.available_slots, 2);
        assert_eq!(stats.time_until_next_slot, 0);
        assert_eq!(stats.window_ms, 60_000);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["requestsThisMinute"], 1);
        assert_eq!(json["timeUntilNextSlot"], 0);
    }
}
