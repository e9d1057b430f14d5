//! Rate-limited request queue and short-lived response cache
//!
//! The queue owns a single worker task that drains jobs in FIFO order and
//! awaits the limiter before each dispatch, so no two queued requests ever
//! run concurrently.

use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::error::{SourceError, SourceResult};
use crate::oracle::rate_limit::RateLimiter;

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// FIFO queue serializing outbound calls through a rate limiter
pub struct RequestQueue {
    tx: mpsc::UnboundedSender<Job>,
    pending: Arc<AtomicUsize>,
}

impl RequestQueue {
    /// Create the queue and spawn its worker on the current runtime
    pub fn new(limiter: Arc<dyn RateLimiter>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));

        tokio::spawn(Self::run_worker(rx, limiter, pending.clone()));

        Self { tx, pending }
    }

    async fn run_worker(
        mut rx: mpsc::UnboundedReceiver<Job>,
        limiter: Arc<dyn RateLimiter>,
        pending: Arc<AtomicUsize>,
    ) {
        while let Some(job) = rx.recv().await {
            limiter.wait_if_needed().await;
            pending.fetch_sub(1, Ordering::SeqCst);
            job().await;
        }
        tracing::debug!("Request queue worker stopped");
    }

    /// Queue an operation and wait for its result
    pub async fn enqueue<T, F, Fut>(&self, op: F) -> SourceResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = SourceResult<T>> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            Box::pin(async move {
                // Caller may have gone away; nothing to report to
                let _ = done_tx.send(op().await);
            })
        });

        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(job).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(SourceError::QueueClosed);
        }

        done_rx.await.map_err(|_| SourceError::QueueClosed)?
    }

    /// Jobs waiting to be dispatched
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Introspection snapshot of the response cache
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    pub size: usize,
    /// Time-to-live in milliseconds
    pub ttl: u64,
    pub keys: Vec<String>,
}

struct CacheEntry {
    stored_at: Instant,
    value: Value,
}

/// TTL cache keyed by endpoint + serialized params
pub struct ResponseCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn key(endpoint: &str, params: &Value) -> String {
        format!("{}{}", endpoint, params)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries();
        match entries.get(key) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: String, value: Value) {
        self.entries().insert(
            key,
            CacheEntry {
                stored_at: Instant::now(),
                value,
            },
        );
    }

    /// Drop every entry, returning how many were removed
    pub fn clear(&self) -> usize {
        let mut entries = self.entries();
        let removed = entries.len();
        entries.clear();
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let mut entries = self.entries();
        let ttl = self.ttl;
        entries.retain(|_, entry| entry.stored_at.elapsed() < ttl);

        let mut keys: Vec<String> = entries.keys().cloned().collect();
        keys.sort();
        CacheStats {
            size: keys.len(),
            ttl: ttl.as_millis() as u64,
            keys,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::rate_limit::SlidingWindowLimiter;
    use serde_json::json;

    fn queue_with(limit: usize, window_ms: u64) -> (RequestQueue, Arc<SlidingWindowLimiter>) {
        let limiter = Arc::new(SlidingWindowLimiter::new(
            limit,
            Duration::from_millis(window_ms),
        ));
        (RequestQueue::new(limiter.clone()), limiter)
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_returns_result() {
        let (queue, limiter) = queue_with(10, 1000);
        let value = queue.enqueue(|| async { Ok(41 + 1) }).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(limiter.requests_in_window(), 1);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_propagates_error() {
        let (queue, _) = queue_with(10, 1000);
        let result: SourceResult<()> = queue
            .enqueue(|| async { Err(SourceError::MissingCredentials("RAPID_API_KEY")) })
            .await;
        assert!(matches!(result, Err(SourceError::MissingCredentials(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_jobs_run_in_order_one_at_a_time() {
        let (queue, _) = queue_with(100, 1000);
        let queue = Arc::new(queue);
        let log = Arc::new(Mutex::new(Vec::new()));
        let active = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..5 {
            let queue = queue.clone();
            let log = log.clone();
            let active = active.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .enqueue(move || async move {
                        assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        log.lock().unwrap().push(i);
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
            // Keep submission order deterministic
            tokio::task::yield_now().await;
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_waits_on_limiter() {
        let (queue, _) = queue_with(1, 5000);
        let start = Instant::now();
        queue.enqueue(|| async { Ok(()) }).await.unwrap();
        queue.enqueue(|| async { Ok(()) }).await.unwrap();
        assert!(Instant::now().duration_since(start) >= Duration::from_millis(5000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hit_and_expiry() {
        let cache = ResponseCache::new(Duration::from_secs(30));
        let key = ResponseCache::key("/coins", &json!({"limit": 10, "offset": 0}));
        assert_eq!(key, r#"/coins{"limit":10,"offset":0}"#);

        cache.insert(key.clone(), json!({"ok": true}));
        assert_eq!(cache.get(&key), Some(json!({"ok": true})));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(cache.get(&key), None);
        assert_eq!(cache.stats().size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_stats_and_clear() {
        let cache = ResponseCache::new(Duration::from_secs(30));
        cache.insert("/stats{}".to_string(), json!(1));
        cache.insert("/coin/abc{}".to_string(), json!(2));

        let stats = cache.stats();
        assert_eq!(stats.size, 2);
        assert_eq!(stats.ttl, 30_000);
        assert_eq!(stats.keys, vec!["/coin/abc{}", "/stats{}"]);

        assert_eq!(cache.clear(), 2);
        assert_eq!(cache.stats().size, 0);
    }
}
