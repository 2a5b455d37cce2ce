//! Symbol metadata cache (§3 Market Metadata; §4.2 local validation).
//!
//! Grounded in the teacher's `binance/client.rs::get_symbol_info`, which
//! fetched a single spot `exchangeInfo` payload; generalised here to the
//! futures swap/future union rule and given a real TTL + invalidate-on-
//! validation-failure policy (the teacher refreshed unconditionally on
//! every call, which spec §3/§4.2 explicitly forbid for a hot path).

use chrono::{Duration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::types::MarketMetadata;

const REFRESH_INTERVAL: Duration = Duration::hours(1);

#[derive(Clone)]
pub struct MetadataCacheHandle {
    inner: Arc<RwLock<HashMap<String, MarketMetadata>>>,
    /// Symbols whose most recent validation failed; force a refresh before
    /// the next lookup regardless of TTL.
    invalidated: Arc<RwLock<std::collections::HashSet<String>>>,
}

impl Default for MetadataCacheHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataCacheHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            invalidated: Arc::new(RwLock::new(std::collections::HashSet::new())),
        }
    }

    /// Whether the cached entry (if any) must be refetched: missing,
    /// expired, or marked invalid by a prior validation failure.
    pub fn needs_refresh(&self, symbol: &str) -> bool {
        if self.invalidated.read().contains(symbol) {
            return true;
        }
        match self.inner.read().get(symbol) {
            None => true,
            Some(meta) => Utc::now() - meta.fetched_at > REFRESH_INTERVAL,
        }
    }

    pub fn get(&self, symbol: &str) -> Option<MarketMetadata> {
        self.inner.read().get(symbol).cloned()
    }

    pub fn insert(&self, metadata: MarketMetadata) {
        let symbol = metadata.symbol.clone();
        self.inner.write().insert(symbol.clone(), metadata);
        self.invalidated.write().remove(&symbol);
    }

    pub fn invalidate(&self, symbol: &str) {
        self.invalidated.write().insert(symbol.to_string());
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(symbol: &str) -> MarketMetadata {
        MarketMetadata {
            symbol: symbol.to_string(),
            min_amount: 0.001,
            max_amount: 1000.0,
            amount_step: 0.001,
            price_step: 0.01,
            contract_size: 1.0,
            active: true,
            is_swap: true,
            is_future: false,
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn missing_entry_needs_refresh() {
        let cache = MetadataCacheHandle::new();
        assert!(cache.needs_refresh("BTC/USDT:USDT"));
    }

    #[test]
    fn fresh_entry_does_not_need_refresh() {
        let cache = MetadataCacheHandle::new();
        cache.insert(sample("BTC/USDT:USDT"));
        assert!(!cache.needs_refresh("BTC/USDT:USDT"));
    }

    #[test]
    fn invalidated_entry_forces_refresh_even_if_fresh() {
        let cache = MetadataCacheHandle::new();
        cache.insert(sample("BTC/USDT:USDT"));
        cache.invalidate("BTC/USDT:USDT");
        assert!(cache.needs_refresh("BTC/USDT:USDT"));
    }

    #[test]
    fn insert_clears_invalidation() {
        let cache = MetadataCacheHandle::new();
        cache.invalidate("BTC/USDT:USDT");
        cache.insert(sample("BTC/USDT:USDT"));
        assert!(!cache.needs_refresh("BTC/USDT:USDT"));
    }
}
