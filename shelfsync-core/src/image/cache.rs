use super::sniff::ImageKind;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Cache key for an image URL: SHA-256 of the URL, hex encoded.
pub fn cache_key(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))
}

#[derive(Debug, Clone)]
pub struct CachedImage {
    pub key: String,
    pub bytes: Arc<[u8]>,
    pub kind: ImageKind,
    pub size: usize,
    inserted_at: Instant,
}

impl CachedImage {
    fn age(&self) -> Duration {
        self.inserted_at.elapsed()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub key_bytes: usize,
    pub value_bytes: usize,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CachedImage>,
    order: VecDeque<String>,
    value_bytes: usize,
    hits: u64,
    misses: u64,
}

impl CacheState {
    fn remove(&mut self, key: &str) -> Option<CachedImage> {
        let removed = self.entries.remove(key)?;
        self.value_bytes -= removed.size;
        self.order.retain(|k| k != key);
        Some(removed)
    }

    fn evict_oldest(&mut self) -> bool {
        while let Some(key) = self.order.pop_front() {
            if let Some(entry) = self.entries.remove(&key) {
                self.value_bytes -= entry.size;
                debug!("Evicted cached image {}", key);
                return true;
            }
        }
        false
    }
}

/// Bounded TTL cache of downloaded images. Expired entries read as absent.
pub struct ImageCache {
    state: Mutex<CacheState>,
    ttl: Duration,
    max_entries: usize,
    max_bytes: usize,
}

impl ImageCache {
    pub fn new(ttl: Duration, max_entries: usize, max_bytes: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            ttl,
            max_entries: max_entries.max(1),
            max_bytes,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn get(&self, url: &str) -> Option<CachedImage> {
        let key = cache_key(url);
        let mut state = self.state.lock().await;

        let lookup = state
            .entries
            .get(&key)
            .map(|entry| (entry.age() <= self.ttl).then(|| entry.clone()));

        match lookup {
            Some(Some(entry)) => {
                state.hits += 1;
                Some(entry)
            }
            Some(None) => {
                debug!("Cached image {} expired", key);
                state.remove(&key);
                state.misses += 1;
                None
            }
            None => {
                state.misses += 1;
                None
            }
        }
    }

    /// Store an image, evicting the oldest entries until the cache fits its
    /// bounds again. Images larger than the whole byte budget are not kept.
    pub async fn insert(&self, url: &str, bytes: Arc<[u8]>, kind: ImageKind) -> Option<CachedImage> {
        let size = bytes.len();
        if size > self.max_bytes {
            debug!("Image of {} bytes exceeds cache budget, not caching", size);
            return None;
        }

        let key = cache_key(url);
        let entry = CachedImage {
            key: key.clone(),
            bytes,
            kind,
            size,
            inserted_at: Instant::now(),
        };

        let mut state = self.state.lock().await;
        state.remove(&key);
        while state.entries.len() >= self.max_entries || state.value_bytes + size > self.max_bytes {
            if !state.evict_oldest() {
                break;
            }
        }

        state.value_bytes += size;
        state.order.push_back(key.clone());
        state.entries.insert(key, entry.clone());
        Some(entry)
    }

    /// Drop expired entries, returning how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let mut state = self.state.lock().await;
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.age() > self.ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            state.remove(key);
        }
        expired.len()
    }

    pub async fn stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        CacheStats {
            entries: state.entries.len(),
            hits: state.hits,
            misses: state.misses,
            key_bytes: state.entries.keys().map(String::len).sum(),
            value_bytes: state.value_bytes,
        }
    }

    /// Remove everything; returns the number of entries purged.
    pub async fn clear(&self) -> usize {
        let mut state = self.state.lock().await;
        let purged = state.entries.len();
        state.entries.clear();
        state.order.clear();
        state.value_bytes = 0;
        purged
    }
}
