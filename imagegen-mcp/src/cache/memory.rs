//! In-process cache backend with TTL expiry and LRU eviction by size.

use super::{CacheBackend, CacheEntry};
use crate::fingerprint::Fingerprint;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use imagegen_mcp_common::error::CacheError;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

struct Slot {
    entry: CacheEntry,
    size: u64,
    last_used: u64,
}

#[derive(Default)]
struct State {
    slots: HashMap<Fingerprint, Slot>,
    total_bytes: u64,
}

impl State {
    fn remove(&mut self, key: &Fingerprint) -> bool {
        match self.slots.remove(key) {
            Some(slot) => {
                self.total_bytes = self.total_bytes.saturating_sub(slot.size);
                true
            }
            None => false,
        }
    }
}

/// Memory backend bounded by the approximate size of its entries.
pub struct MemoryBackend {
    state: Mutex<State>,
    max_bytes: u64,
    clock: AtomicU64,
}

/// Approximate footprint of one entry: key, value and bookkeeping.
fn entry_size(entry: &CacheEntry) -> u64 {
    let value = serde_json::to_vec(entry).map(|v| v.len()).unwrap_or(256);
    (value + 32 + std::mem::size_of::<Slot>()) as u64
}

impl MemoryBackend {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            state: Mutex::new(State::default()),
            max_bytes,
            clock: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, State>, CacheError> {
        self.state
            .lock()
            .map_err(|_| CacheError::backend("memory", "state lock poisoned"))
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.slots.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> u64 {
        self.state.lock().map(|s| s.total_bytes).unwrap_or(0)
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &Fingerprint) -> Result<Option<CacheEntry>, CacheError> {
        let now = Utc::now();
        let tick = self.tick();
        let mut state = self.state()?;
        let expired = match state.slots.get_mut(key) {
            None => return Ok(None),
            Some(slot) if slot.entry.is_expired_at(now) => true,
            Some(slot) => {
                slot.last_used = tick;
                return Ok(Some(slot.entry.clone()));
            }
        };
        if expired {
            state.remove(key);
        }
        Ok(None)
    }

    async fn put(&self, key: &Fingerprint, entry: &CacheEntry) -> Result<(), CacheError> {
        let size = entry_size(entry);
        let tick = self.tick();
        let mut state = self.state()?;
        state.remove(key);
        if size > self.max_bytes {
            return Ok(());
        }

        while state.total_bytes + size > self.max_bytes {
            let oldest = state
                .slots
                .iter()
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(k, _)| *k);
            match oldest {
                Some(victim) => {
                    state.remove(&victim);
                }
                None => break,
            }
        }

        state.total_bytes += size;
        state.slots.insert(
            *key,
            Slot {
                entry: entry.clone(),
                size,
                last_used: tick,
            },
        );
        Ok(())
    }

    async fn remove(&self, key: &Fingerprint) -> Result<(), CacheError> {
        self.state()?.remove(key);
        Ok(())
    }

    async fn evict_expired(&self, now: DateTime<Utc>) -> Result<usize, CacheError> {
        let mut state = self.state()?;
        let expired: Vec<Fingerprint> = state
            .slots
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired_at(now))
            .map(|(k, _)| *k)
            .collect();
        for key in &expired {
            state.remove(key);
        }
        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ArtifactRef;
    use imagegen_mcp_common::params::OutputFormat;
    use std::time::Duration;

    fn key(n: u8) -> Fingerprint {
        Fingerprint::from_hex(&hex::encode([n; 32])).unwrap()
    }

    fn entry(id: &str, ttl: Duration) -> CacheEntry {
        CacheEntry::new(
            ArtifactRef {
                image_id: id.to_string(),
                format: OutputFormat::Png,
            },
            Utc::now(),
            ttl,
        )
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let backend = MemoryBackend::new(1024 * 1024);
        backend.put(&key(1), &entry("img_1", Duration::from_secs(60))).await.unwrap();
        assert_eq!(backend.get(&key(1)).await.unwrap().unwrap().artifact.image_id, "img_1");
        assert!(backend.get(&key(2)).await.unwrap().is_none());
        backend.remove(&key(1)).await.unwrap();
        assert!(backend.get(&key(1)).await.unwrap().is_none());
        assert_eq!(backend.total_bytes(), 0);
    }

    #[tokio::test]
    async fn test_expired_entries_are_purged_lazily() {
        let backend = MemoryBackend::new(1024 * 1024);
        backend.put(&key(1), &entry("img_1", Duration::ZERO)).await.unwrap();
        assert!(backend.get(&key(1)).await.unwrap().is_none());
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_evict_expired() {
        let backend = MemoryBackend::new(1024 * 1024);
        backend.put(&key(1), &entry("img_1", Duration::from_secs(1))).await.unwrap();
        backend.put(&key(2), &entry("img_2", Duration::from_secs(3600))).await.unwrap();
        let later = Utc::now() + chrono::Duration::seconds(5);
        assert_eq!(backend.evict_expired(later).await.unwrap(), 1);
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn test_least_recently_used_is_evicted_first() {
        let one = entry_size(&entry("img_0", Duration::from_secs(60)));
        let backend = MemoryBackend::new(one * 2 + one / 2);
        backend.put(&key(0), &entry("img_0", Duration::from_secs(60))).await.unwrap();
        backend.put(&key(1), &entry("img_1", Duration::from_secs(60))).await.unwrap();
        // Touch 0 so 1 becomes the eviction candidate.
        backend.get(&key(0)).await.unwrap();
        backend.put(&key(2), &entry("img_2", Duration::from_secs(60))).await.unwrap();

        assert!(backend.get(&key(0)).await.unwrap().is_some());
        assert!(backend.get(&key(1)).await.unwrap().is_none());
        assert!(backend.get(&key(2)).await.unwrap().is_some());
        assert!(backend.total_bytes() <= one * 2 + one / 2);
    }
}
