//! In-memory LRU cache backend.
//!
//! Grounded in
//! `examples/original_source/postfix_mta_sts_resolver/internal_cache.py`'s
//! `InternalLRUCache`, which keeps a `collections.OrderedDict` and moves a
//! key to the end on every touch. `indexmap::IndexMap` gives the same
//! "insertion order doubles as recency order" property with O(1)
//! amortized move-to-end via `shift_remove` + re-`insert`.

use std::sync::Mutex;

use async_trait::async_trait;
use indexmap::IndexMap;

use super::{Cache, CacheEntry, CacheError, ScanToken};

struct State {
    entries: IndexMap<String, CacheEntry>,
    proactive_fetch_ts: i64,
}

pub struct InternalCache {
    capacity: usize,
    state: Mutex<State>,
}

impl InternalCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(State {
                entries: IndexMap::new(),
                proactive_fetch_ts: 0,
            }),
        }
    }
}

#[async_trait]
impl Cache for InternalCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let mut state = self.state.lock().unwrap();
        match state.entries.shift_remove(key) {
            Some(value) => {
                state.entries.insert(key.to_string(), value.clone());
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError> {
        let mut state = self.state.lock().unwrap();
        match state.entries.shift_remove(key) {
            Some(existing) if existing.ts > entry.ts => {
                // Stale write racing behind a newer one: keep the newer
                // value, but still promote the touched key to MRU.
                state.entries.insert(key.to_string(), existing);
            }
            removed => {
                if removed.is_none() && state.entries.len() >= self.capacity {
                    state.entries.shift_remove_index(0);
                }
                state.entries.insert(key.to_string(), entry);
            }
        }
        Ok(())
    }

    async fn scan(
        &self,
        token: Option<ScanToken>,
        amount_hint: usize,
    ) -> Result<(Option<ScanToken>, Vec<(String, CacheEntry)>), CacheError> {
        let mut state = self.state.lock().unwrap();
        let token = token.unwrap_or(0).max(0) as usize;
        let total = state.entries.len();
        if token >= total {
            return Ok((None, Vec::new()));
        }

        let amount = amount_hint.min(total - token);
        let batch: Vec<(String, CacheEntry)> = state
            .entries
            .get_range(token..token + amount)
            .map(|slice| slice.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        // Promote scanned keys to MRU, same as the reference `get`.
        for (key, _) in &batch {
            if let Some(value) = state.entries.shift_remove(key) {
                state.entries.insert(key.clone(), value);
            }
        }

        let new_token = token + amount;
        let next = if new_token < total { Some(new_token as ScanToken) } else { None };
        Ok((next, batch))
    }

    async fn get_proactive_fetch_ts(&self) -> Result<i64, CacheError> {
        Ok(self.state.lock().unwrap().proactive_fetch_ts)
    }

    async fn set_proactive_fetch_ts(&self, ts: i64) -> Result<(), CacheError> {
        self.state.lock().unwrap().proactive_fetch_ts = ts;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::contract_tests;
    use super::*;
    use crate::resolver::PolicyMode;

    #[tokio::test]
    async fn newest_wins() {
        let cache = InternalCache::new(10);
        contract_tests::newest_wins(&cache).await;
    }

    #[tokio::test]
    async fn scan_covers_every_key() {
        let cache = InternalCache::new(10);
        contract_tests::scan_covers_every_key(&cache, &["a", "b", "c", "d", "e"]).await;
    }

    #[tokio::test]
    async fn lru_eviction_keeps_last_c_touched() {
        let cache = InternalCache::new(2);
        let mk = |id: &str| CacheEntry {
            ts: 0,
            pol_id: id.to_string(),
            pol_body: crate::resolver::PolicyBody {
                mode: PolicyMode::None,
                max_age: 0,
                mx: vec![],
            },
        };
        cache.set("a", mk("a")).await.unwrap();
        cache.set("b", mk("b")).await.unwrap();
        cache.set("c", mk("c")).await.unwrap();

        assert!(cache.get("a").await.unwrap().is_none());
        assert!(cache.get("b").await.unwrap().is_some());
        assert!(cache.get("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn get_promotes_to_mru() {
        let cache = InternalCache::new(2);
        let mk = |id: &str| CacheEntry {
            ts: 0,
            pol_id: id.to_string(),
            pol_body: crate::resolver::PolicyBody {
                mode: PolicyMode::None,
                max_age: 0,
                mx: vec![],
            },
        };
        cache.set("a", mk("a")).await.unwrap();
        cache.set("b", mk("b")).await.unwrap();
        cache.get("a").await.unwrap();
        cache.set("c", mk("c")).await.unwrap();

        assert!(cache.get("b").await.unwrap().is_none());
        assert!(cache.get("a").await.unwrap().is_some());
        assert!(cache.get("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn proactive_fetch_ts_defaults_to_zero() {
        let cache = InternalCache::new(10);
        assert_eq!(cache.get_proactive_fetch_ts().await.unwrap(), 0);
        cache.set_proactive_fetch_ts(42).await.unwrap();
        assert_eq!(cache.get_proactive_fetch_ts().await.unwrap(), 42);
    }
}
