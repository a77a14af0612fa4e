use crate::models::{SearchRequest, SearchResponse};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SearchCacheConfig {
    pub ttl_secs: u64,
    pub max_entries: usize,
}

impl Default for SearchCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            max_entries: 100,
        }
    }
}

struct CachedSearch {
    stored_at: Instant,
    response: SearchResponse,
}

/// Short-lived memo of faceted search responses. Blank queries are never
/// cached, and every lifecycle change clears the whole cache.
///
/// Each clear starts a new epoch. A response computed in an earlier epoch
/// is refused by `put`, so a search racing a delete cannot repopulate the
/// cache with the deleted document.
pub struct SearchCache {
    config: SearchCacheConfig,
    entries: Mutex<HashMap<String, CachedSearch>>,
    epoch: AtomicU64,
}

impl SearchCache {
    pub fn new(config: SearchCacheConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
            epoch: AtomicU64::new(0),
        }
    }

    /// Read before computing a response and hand back to `put`.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn key(request: &SearchRequest) -> Option<String> {
        if request.query.trim().is_empty() {
            return None;
        }
        serde_json::to_string(request).ok()
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.config.ttl_secs)
    }

    pub fn get(&self, request: &SearchRequest) -> Option<SearchResponse> {
        let key = Self::key(request)?;
        let mut entries = self.entries.lock();
        match entries.get(&key) {
            Some(cached) if cached.stored_at.elapsed() < self.ttl() => Some(cached.response.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, request: &SearchRequest, response: &SearchResponse, epoch: u64) {
        if self.config.max_entries == 0 {
            return;
        }
        let Some(key) = Self::key(request) else {
            return;
        };

        let mut entries = self.entries.lock();
        if self.epoch.load(Ordering::Acquire) != epoch {
            return;
        }
        if !entries.contains_key(&key) && entries.len() >= self.config.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, cached)| cached.stored_at)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            key,
            CachedSearch {
                stored_at: Instant::now(),
                response: response.clone(),
            },
        );
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        self.epoch.fetch_add(1, Ordering::AcqRel);
        entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SearchCache {
    fn default() -> Self {
        Self::new(SearchCacheConfig::default())
    }
}
