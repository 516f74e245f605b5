use crate::entities::stock_level;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Point-in-time view of a stock row, served to read paths that tolerate
/// slightly stale numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockSnapshot {
    pub on_hand: i32,
    pub reserved: i32,
    pub version: i64,
}

impl StockSnapshot {
    pub fn available(&self) -> i32 {
        (self.on_hand - self.reserved).max(0)
    }
}

impl From<&stock_level::Model> for StockSnapshot {
    fn from(row: &stock_level::Model) -> Self {
        Self {
            on_hand: row.on_hand,
            reserved: row.reserved,
            version: row.version,
        }
    }
}

/// Advisory in-process cache of stock snapshots. Every ledger mutation
/// invalidates the product's entry; correctness never depends on a hit.
#[derive(Debug)]
pub struct StockCache {
    entries: DashMap<i64, (StockSnapshot, Instant)>,
    ttl: Duration,
}

impl StockCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, product_id: i64) -> Option<StockSnapshot> {
        if let Some(entry) = self.entries.get(&product_id) {
            let (snapshot, cached_at) = *entry;
            if cached_at.elapsed() < self.ttl {
                return Some(snapshot);
            }
        }
        // Drop the read guard before removing the stale entry.
        self.entries.remove(&product_id);
        None
    }

    pub fn put(&self, product_id: i64, snapshot: StockSnapshot) {
        self.entries.insert(product_id, (snapshot, Instant::now()));
    }

    pub fn invalidate(&self, product_id: i64) {
        self.entries.remove(&product_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(on_hand: i32, reserved: i32) -> StockSnapshot {
        StockSnapshot {
            on_hand,
            reserved,
            version: 1,
        }
    }

    #[test]
    fn get_returns_fresh_entries() {
        let cache = StockCache::new(Duration::from_secs(60));
        cache.put(1, snapshot(10, 2));
        assert_eq!(cache.get(1).unwrap().available(), 8);
    }

    #[test]
    fn stale_entries_are_evicted() {
        let cache = StockCache::new(Duration::from_millis(0));
        cache.put(1, snapshot(10, 2));
        assert!(cache.get(1).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache = StockCache::new(Duration::from_secs(60));
        cache.put(1, snapshot(10, 2));
        cache.invalidate(1);
        assert!(cache.get(1).is_none());
    }
}
