//! In-process TTL cache of company fundamentals.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use basalt_events::Fundamentals;
use granite_config::FundamentalsConfig;
use parking_lot::RwLock;

struct Cached {
    value: Arc<Fundamentals>,
    stored_at: Instant,
}

pub struct FundamentalsCache {
    ttl: Duration,
    fresh_ttl: Duration,
    store: RwLock<HashMap<String, Cached>>,
}

impl FundamentalsCache {
    pub fn new(ttl: Duration, fresh_ttl: Duration) -> Self {
        Self {
            ttl,
            fresh_ttl,
            store: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(cfg: &FundamentalsConfig) -> Self {
        Self::new(
            Duration::from_secs(cfg.ttl_secs),
            Duration::from_secs(cfg.fresh_ttl_secs),
        )
    }

    /// Cached value if present and not older than the TTL.
    pub fn get(&self, symbol: &str) -> Option<Arc<Fundamentals>> {
        let store = self.store.read();
        let item = store.get(symbol)?;
        (item.stored_at.elapsed() <= self.ttl).then(|| Arc::clone(&item.value))
    }

    pub fn set(&self, symbol: &str, value: Fundamentals) {
        self.insert_at(symbol, value, Instant::now());
    }

    /// Missing entries count as expired.
    pub fn is_expired(&self, symbol: &str) -> bool {
        self.store
            .read()
            .get(symbol)
            .is_none_or(|item| item.stored_at.elapsed() > self.ttl)
    }

    /// Whether a lookup should schedule a background fetch. Forced refreshes
    /// are throttled by the fresh TTL so repeated `fresh` requests do not
    /// hammer the source.
    pub fn needs_refresh(&self, symbol: &str, force: bool) -> bool {
        let store = self.store.read();
        match store.get(symbol) {
            None => true,
            Some(item) => {
                let age = item.stored_at.elapsed();
                age > self.ttl || (force && age > self.fresh_ttl)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.read().is_empty()
    }

    fn insert_at(&self, symbol: &str, value: Fundamentals, stored_at: Instant) {
        self.store.write().insert(
            symbol.to_string(),
            Cached {
                value: Arc::new(value),
                stored_at,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aged(cache: &FundamentalsCache, symbol: &str, age: Duration) {
        let at = Instant::now().checked_sub(age).unwrap();
        cache.insert_at(symbol, Fundamentals::empty(symbol, "test"), at);
    }

    #[test]
    fn get_respects_ttl() {
        let cache = FundamentalsCache::new(Duration::from_secs(60), Duration::from_secs(5));
        assert!(cache.get("AAPL").is_none());
        assert!(cache.is_expired("AAPL"));

        cache.set("AAPL", Fundamentals::empty("AAPL", "test"));
        assert_eq!(cache.get("AAPL").unwrap().symbol, "AAPL");
        assert!(!cache.is_expired("AAPL"));

        aged(&cache, "MSFT", Duration::from_secs(120));
        assert!(cache.get("MSFT").is_none());
        assert!(cache.is_expired("MSFT"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn forced_refresh_is_throttled() {
        let cache = FundamentalsCache::new(Duration::from_secs(60), Duration::from_secs(5));
        assert!(cache.needs_refresh("AAPL", false));

        cache.set("AAPL", Fundamentals::empty("AAPL", "test"));
        assert!(!cache.needs_refresh("AAPL", false));
        assert!(!cache.needs_refresh("AAPL", true));

        aged(&cache, "AAPL", Duration::from_secs(10));
        assert!(!cache.needs_refresh("AAPL", false));
        assert!(cache.needs_refresh("AAPL", true));

        aged(&cache, "AAPL", Duration::from_secs(61));
        assert!(cache.needs_refresh("AAPL", false));
    }
}
