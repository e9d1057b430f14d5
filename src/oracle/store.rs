//! Global price store - reconciles prices from every source
//!
//! Holds exactly one record per symbol. Writes follow a fixed priority:
//! Binance > Coinbase > Coinranking. Each tier may overwrite itself and any
//! lower tier but is never displaced by a lower one, so the final table does
//! not depend on how updates from different adapters interleave.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

use crate::types::{canonical_symbol, now_millis, PriceRecord, PriceSource, PriceUpdate, SourceTier};

type Callback = Box<dyn Fn(&HashMap<String, PriceRecord>) + Send + Sync>;
type Gate = Box<dyn Fn() -> bool + Send + Sync>;

struct Subscriber {
    /// Checked under the table lock; `false` means the snapshot is not built
    active: Gate,
    callback: Callback,
}

/// Table snapshot taken by one merge, tagged with its commit order
pub(crate) struct PendingNotify {
    seq: u64,
    snapshot: HashMap<String, PriceRecord>,
}

/// Per-tier record counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total: usize,
    pub coinranking: usize,
    pub binance: usize,
    pub coinbase: usize,
}

/// Result of merging one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Records written
    pub applied: usize,
    /// Valid updates that lost to a higher-priority record
    pub skipped: usize,
    /// Updates with an unusable symbol or price
    pub rejected: usize,
}

#[derive(Default)]
pub struct PriceStore {
    prices: Mutex<HashMap<String, PriceRecord>>,
    subscribers: RwLock<Vec<Subscriber>>,
    /// Bumped under the table lock for every merge that produced a snapshot
    next_seq: AtomicU64,
    /// Highest sequence handed to subscribers; held while callbacks run
    delivered: Mutex<u64>,
}

impl PriceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, PriceRecord>> {
        self.prices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Floor dataset: only fills gaps or refreshes earlier coinranking values
    pub fn update_from_coinranking(&self, coins: &[PriceUpdate]) -> MergeOutcome {
        self.merge(PriceSource::Coinranking, coins)
    }

    /// Highest priority: always overwrites
    pub fn update_from_binance(&self, items: &[PriceUpdate]) -> MergeOutcome {
        self.merge(PriceSource::Binance, items)
    }

    /// Overwrites everything except a binance-tier record
    pub fn update_from_coinbase(&self, items: &[PriceUpdate]) -> MergeOutcome {
        self.merge(PriceSource::Coinbase, items)
    }

    /// Merge a batch tagged with `source` under the tier rules
    pub fn merge(&self, source: PriceSource, updates: &[PriceUpdate]) -> MergeOutcome {
        let (outcome, pending) = self.apply(source, updates);
        if let Some(pending) = pending {
            self.deliver(pending);
        }
        outcome
    }

    /// Write a batch; returns a snapshot only if some subscriber is listening
    pub(crate) fn apply(
        &self,
        source: PriceSource,
        updates: &[PriceUpdate],
    ) -> (MergeOutcome, Option<PendingNotify>) {
        let tier = source.tier();
        let now = now_millis();
        let mut outcome = MergeOutcome::default();

        let pending = {
            let mut table = self.table();

            for update in updates {
                let symbol = canonical_symbol(&update.symbol);
                if symbol.is_empty() || !update.price.is_finite() || update.price < 0.0 {
                    outcome.rejected += 1;
                    continue;
                }

                let allowed = table
                    .get(&symbol)
                    .map_or(true, |existing| existing.source.tier() <= tier);
                if !allowed {
                    outcome.skipped += 1;
                    continue;
                }

                let record = update.clone().into_record(symbol.clone(), source, now);
                table.insert(symbol, record);
                outcome.applied += 1;
            }

            if outcome.applied > 0 && self.has_active_subscribers() {
                Some(PendingNotify {
                    seq: self.next_seq.fetch_add(1, Ordering::SeqCst) + 1,
                    snapshot: table.clone(),
                })
            } else {
                None
            }
        };

        if outcome.rejected > 0 {
            tracing::debug!(
                source = %source,
                rejected = outcome.rejected,
                "Rejected malformed price updates"
            );
        }

        (outcome, pending)
    }

    /// Hand a snapshot to subscribers unless a newer one already went out
    pub(crate) fn deliver(&self, pending: PendingNotify) {
        let mut delivered = self.delivered.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.seq <= *delivered {
            tracing::trace!(seq = pending.seq, latest = *delivered, "Dropped stale snapshot");
            return;
        }
        *delivered = pending.seq;

        let subscribers = self.subscribers.read().unwrap_or_else(PoisonError::into_inner);
        for subscriber in subscribers.iter() {
            if (subscriber.active)() {
                (subscriber.callback)(&pending.snapshot);
            }
        }
    }

    /// Register a callback invoked after every batch that changed the table.
    /// Callbacks run in merge order and must not call back into the store.
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&HashMap<String, PriceRecord>) + Send + Sync + 'static,
    {
        self.subscribe_while(|| true, callback);
    }

    /// Like [`subscribe`](Self::subscribe), but no snapshot is built while
    /// `active` returns false
    pub fn subscribe_while<A, F>(&self, active: A, callback: F)
    where
        A: Fn() -> bool + Send + Sync + 'static,
        F: Fn(&HashMap<String, PriceRecord>) + Send + Sync + 'static,
    {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber {
                active: Box::new(active),
                callback: Box::new(callback),
            });
    }

    fn has_active_subscribers(&self) -> bool {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|subscriber| (subscriber.active)())
    }

    pub fn get(&self, symbol: &str) -> Option<PriceRecord> {
        self.table().get(&canonical_symbol(symbol)).cloned()
    }

    /// All records sorted by symbol ascending
    pub fn get_all_prices(&self) -> Vec<PriceRecord> {
        sorted_records(&self.table())
    }

    pub fn get_stats(&self) -> StoreStats {
        let table = self.table();
        let mut stats = StoreStats {
            total: table.len(),
            ..StoreStats::default()
        };
        for record in table.values() {
            match record.source.tier() {
                SourceTier::Coinranking => stats.coinranking += 1,
                SourceTier::Binance => stats.binance += 1,
                SourceTier::Coinbase => stats.coinbase += 1,
            }
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }
}

/// Records of a table sorted by symbol ascending
pub fn sorted_records(table: &HashMap<String, PriceRecord>) -> Vec<PriceRecord> {
    let mut records: Vec<PriceRecord> = table.values().cloned().collect();
    records.sort_by(|a, b| a.symbol.cmp(&b.symbol));
    records
}

impl std::fmt::Debug for PriceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriceStore")
            .field("stats", &self.get_stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Arc;

    fn upd(symbol: &str, price: f64) -> PriceUpdate {
        PriceUpdate::new(symbol, price)
    }

    #[test]
    fn test_coinranking_fills_gap_then_coinbase_overrides() {
        let store = PriceStore::new();
        store.update_from_coinranking(&[upd("eth", 3000.0)]);
        store.update_from_coinbase(&[upd("ETH", 3010.0)]);

        let all = store.get_all_prices();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].symbol, "ETH");
        assert_eq!(all[0].price, 3010.0);
        assert_eq!(all[0].source, PriceSource::Coinbase);
    }

    #[test]
    fn test_binance_wins_and_blocks_coinbase() {
        let store = PriceStore::new();
        store.update_from_coinranking(&[upd("ETH", 3000.0)]);
        store.update_from_coinbase(&[upd("ETH", 3010.0)]);
        store.update_from_binance(&[upd("ETH", 3015.0)]);

        let outcome = store.update_from_coinbase(&[upd("ETH", 3020.0)]);
        assert_eq!(outcome.skipped, 1);

        let eth = store.get("eth").unwrap();
        assert_eq!(eth.price, 3015.0);
        assert_eq!(eth.source, PriceSource::Binance);
    }

    #[test]
    fn test_coinranking_never_displaces_exchange_prices() {
        let store = PriceStore::new();
        store.update_from_binance(&[upd("BTC", 50000.0)]);
        store.update_from_coinbase(&[upd("SOL", 150.0)]);

        let outcome = store.update_from_coinranking(&[upd("BTC", 1.0), upd("SOL", 2.0)]);
        assert_eq!(outcome.applied, 0);
        assert_eq!(outcome.skipped, 2);
        assert_eq!(store.get("BTC").unwrap().price, 50000.0);
        assert_eq!(store.get("SOL").unwrap().price, 150.0);
    }

    #[test]
    fn test_coinranking_refreshes_itself() {
        let store = PriceStore::new();
        store.update_from_coinranking(&[upd("DOGE", 0.1)]);
        store.update_from_coinranking(&[upd("DOGE", 0.2)]);
        assert_eq!(store.get("DOGE").unwrap().price, 0.2);
    }

    #[test]
    fn test_sub_variants_share_tier() {
        let store = PriceStore::new();
        store.merge(PriceSource::BinanceWs, &[upd("BTC", 1.0)]);
        store.merge(PriceSource::CoinbaseRefresh, &[upd("BTC", 2.0)]);
        assert_eq!(store.get("BTC").unwrap().source, PriceSource::BinanceWs);

        store.merge(PriceSource::BinanceRefresh, &[upd("BTC", 3.0)]);
        let btc = store.get("BTC").unwrap();
        assert_eq!(btc.price, 3.0);
        assert_eq!(btc.source, PriceSource::BinanceRefresh);

        let stats = store.get_stats();
        assert_eq!(stats.binance, 1);
        assert_eq!(stats.total, 1);
    }

    #[test]
    fn test_idempotent_binance_update() {
        let store = PriceStore::new();
        store.update_from_binance(&[upd("BTC", 50000.0)]);
        let first = store.get_all_prices();
        store.update_from_binance(&[upd("BTC", 50000.0)]);
        let second = store.get_all_prices();

        assert_eq!(first.len(), second.len());
        assert_eq!(first[0].price, second[0].price);
        assert_eq!(first[0].source, second[0].source);
    }

    #[test]
    fn test_get_all_prices_sorted() {
        let store = PriceStore::new();
        store.update_from_coinranking(&[upd("ETH", 1.0), upd("AAVE", 2.0), upd("BTC", 3.0)]);
        let symbols: Vec<String> = store.get_all_prices().into_iter().map(|r| r.symbol).collect();
        assert_eq!(symbols, vec!["AAVE", "BTC", "ETH"]);
    }

    #[test]
    fn test_rejects_invalid_prices() {
        let store = PriceStore::new();
        let outcome = store.update_from_binance(&[
            upd("BTC", f64::NAN),
            upd("ETH", -1.0),
            upd("--", 5.0),
            upd("SOL", f64::INFINITY),
            upd("ADA", 0.5),
        ]);
        assert_eq!(outcome.rejected, 4);
        assert_eq!(outcome.applied, 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_stats_counts_by_tier() {
        let store = PriceStore::new();
        store.update_from_coinranking(&[upd("A", 1.0), upd("B", 1.0), upd("C", 1.0)]);
        store.update_from_coinbase(&[upd("B", 1.0)]);
        store.update_from_binance(&[upd("C", 1.0)]);

        assert_eq!(
            store.get_stats(),
            StoreStats {
                total: 3,
                coinranking: 1,
                binance: 1,
                coinbase: 1,
            }
        );
    }

    #[test]
    fn test_event_timestamp_preserved() {
        let store = PriceStore::new();
        store.update_from_binance(&[upd("BTC", 1.0).with_timestamp(1_704_067_200_000)]);
        assert_eq!(store.get("BTC").unwrap().timestamp, 1_704_067_200_000);
    }

    #[test]
    fn test_subscribers_receive_full_table_on_change_only() {
        let store = PriceStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let last_len = Arc::new(AtomicUsize::new(0));

        let calls_cb = calls.clone();
        let len_cb = last_len.clone();
        store.subscribe(move |table| {
            calls_cb.fetch_add(1, Ordering::SeqCst);
            len_cb.store(table.len(), Ordering::SeqCst);
        });

        store.update_from_binance(&[upd("BTC", 1.0)]);
        store.update_from_coinranking(&[upd("ETH", 1.0)]);
        // Skipped entirely, no notification
        store.update_from_coinranking(&[upd("BTC", 2.0)]);

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(last_len.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_stale_snapshot_is_not_delivered_after_newer_one() {
        let store = PriceStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        store.subscribe(move |table| {
            seen_cb.lock().unwrap().push(table["BTC"].price);
        });

        // Writer A commits first but is delayed before delivering
        let (_, first) = store.apply(PriceSource::Binance, &[upd("BTC", 1.0)]);
        let (_, second) = store.apply(PriceSource::Binance, &[upd("BTC", 2.0)]);
        store.deliver(second.unwrap());
        store.deliver(first.unwrap());

        assert_eq!(*seen.lock().unwrap(), vec![2.0]);
        assert_eq!(store.get("BTC").unwrap().price, 2.0);
    }

    #[test]
    fn test_concurrent_merges_end_on_latest_table() {
        let store = Arc::new(PriceStore::new());
        let last = Arc::new(Mutex::new(0.0));
        let last_cb = last.clone();
        store.subscribe(move |table| {
            *last_cb.lock().unwrap() = table["BTC"].price;
        });

        let handles: Vec<_> = (1..=8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for j in 0..50 {
                        store.update_from_binance(&[upd("BTC", (i * 100 + j) as f64)]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*last.lock().unwrap(), store.get("BTC").unwrap().price);
    }

    #[test]
    fn test_inactive_subscriber_skips_snapshot() {
        let store = PriceStore::new();
        let listening = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicUsize::new(0));

        let gate = listening.clone();
        let calls_cb = calls.clone();
        store.subscribe_while(
            move || gate.load(Ordering::SeqCst),
            move |_| {
                calls_cb.fetch_add(1, Ordering::SeqCst);
            },
        );

        let (outcome, pending) = store.apply(PriceSource::Binance, &[upd("BTC", 1.0)]);
        assert_eq!(outcome.applied, 1);
        assert!(pending.is_none());

        listening.store(true, Ordering::SeqCst);
        store.update_from_binance(&[upd("BTC", 2.0)]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
