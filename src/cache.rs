//! DNS response cache with TTL-based expiration.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::CacheSettings;
use crate::dns::DnsMessage;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid cache backend {0:?}")]
    UnknownBackend(String),

    #[error("refusing to cache a response without answers")]
    EmptyAnswer,

    #[error("cache lock poisoned")]
    Poisoned,
}

/// Storage for upstream answers, keyed by normalized question.
///
/// Implementations are shared by every query task and must synchronize
/// internally. `get` hands out an independent copy so callers can rewrite
/// the transaction ID without touching shared state.
pub trait ResponseCache: Send + Sync {
    /// Look up a fresh entry. Expired entries behave as absent.
    fn get(&self, key: &str) -> Option<DnsMessage>;

    /// Store `message` under `key`, evicting if the cache is full.
    fn set(&self, key: &str, message: &DnsMessage) -> Result<(), CacheError>;

    /// Drop every expired entry, returning how many were removed.
    fn purge_expired(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Build the cache backend selected in the settings.
pub fn build(settings: &CacheSettings) -> Result<Arc<dyn ResponseCache>, CacheError> {
    match settings.backend.as_str() {
        "memory" => Ok(Arc::new(MemoryCache::new(
            Duration::from_secs(settings.expire),
            settings.max_count,
        ))),
        other => Err(CacheError::UnknownBackend(other.to_string())),
    }
}

struct CacheEntry {
    message: DnsMessage,
    stored_at: Instant,
}

/// In-process cache behind a reader/writer lock.
///
/// Entries live for a fixed expiry. When an insert would exceed
/// `max_count`, expired entries are purged first and, if the table is
/// still full, the oldest entry is evicted.
pub struct MemoryCache {
    entries: RwLock<FxHashMap<String, CacheEntry>>,
    expire: Duration,
    max_count: usize,
}

impl MemoryCache {
    pub fn new(expire: Duration, max_count: usize) -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
            expire,
            max_count,
        }
    }

    fn is_fresh(&self, entry: &CacheEntry, now: Instant) -> bool {
        now.saturating_duration_since(entry.stored_at) < self.expire
    }
}

impl ResponseCache for MemoryCache {
    fn get(&self, key: &str) -> Option<DnsMessage> {
        let now = Instant::now();

        {
            let entries = self.entries.read().ok()?;
            match entries.get(key) {
                Some(entry) if self.is_fresh(entry, now) => return Some(entry.message.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        let mut entries = self.entries.write().ok()?;
        if let Some(entry) = entries.get(key) {
            if !self.is_fresh(entry, now) {
                entries.remove(key);
            }
        }
        None
    }

    fn set(&self, key: &str, message: &DnsMessage) -> Result<(), CacheError> {
        if message.answers.is_empty() {
            return Err(CacheError::EmptyAnswer);
        }

        let now = Instant::now();
        let mut entries = self.entries.write().map_err(|_| CacheError::Poisoned)?;

        if !entries.contains_key(key) && entries.len() >= self.max_count {
            entries.retain(|_, entry| self.is_fresh(entry, now));

            while entries.len() >= self.max_count {
                let Some(oldest) = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.stored_at)
                    .map(|(k, _)| k.clone())
                else {
                    break;
                };
                entries.remove(&oldest);
            }
        }

        entries.insert(
            key.to_string(),
            CacheEntry {
                message: message.clone(),
                stored_at: now,
            },
        );

        Ok(())
    }

    fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let Ok(mut entries) = self.entries.write() else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|_, entry| self.is_fresh(entry, now));
        before - entries.len()
    }

    fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{DnsRecord, rtype};
    use std::net::Ipv4Addr;

    fn answer(domain: &str, last_octet: u8) -> DnsMessage {
        let mut message = DnsMessage::reply_to(&DnsMessage::query(0x1111, domain, rtype::A));
        message
            .answers
            .push(DnsRecord::a(domain, 300, Ipv4Addr::new(10, 0, 0, last_octet)));
        message
    }

    #[tokio::test(start_paused = true)]
    async fn get_returns_stored_copy() {
        let cache = MemoryCache::new(Duration::from_secs(60), 10);
        let message = answer("example.com", 1);

        cache.set("example.com IN A", &message).unwrap();

        assert_eq!(cache.get("example.com IN A"), Some(message));
        assert!(cache.get("example.org IN A").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn returned_copy_is_independent_of_cache() {
        let cache = MemoryCache::new(Duration::from_secs(60), 10);
        cache.set("k", &answer("example.com", 1)).unwrap();

        let mut first = cache.get("k").unwrap();
        first.id = 0xAAAA;

        assert_eq!(cache.get("k").unwrap().id, 0x1111);
    }

    #[tokio::test(start_paused = true)]
    async fn entry_expires_after_ttl() {
        let cache = MemoryCache::new(Duration::from_secs(60), 10);
        cache.set("k", &answer("example.com", 1)).unwrap();

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(cache.get("k").is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.get("k").is_none());
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn set_overwrites_and_refreshes_timestamp() {
        let cache = MemoryCache::new(Duration::from_secs(60), 10);
        cache.set("k", &answer("example.com", 1)).unwrap();

        tokio::time::advance(Duration::from_secs(45)).await;
        cache.set("k", &answer("example.com", 2)).unwrap();
        tokio::time::advance(Duration::from_secs(45)).await;

        let cached = cache.get("k").unwrap();
        assert_eq!(cached.answers[0].rdata, answer("example.com", 2).answers[0].rdata);
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_evicts_oldest_entry() {
        let cache = MemoryCache::new(Duration::from_secs(600), 3);
        for (i, key) in ["a", "b", "c"].iter().enumerate() {
            cache.set(key, &answer("example.com", i as u8)).unwrap();
            tokio::time::advance(Duration::from_secs(1)).await;
        }

        cache.set("d", &answer("example.com", 4)).unwrap();

        assert_eq!(cache.len(), 3);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("d").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_prefers_purging_expired_entries() {
        let cache = MemoryCache::new(Duration::from_secs(10), 2);
        cache.set("stale", &answer("example.com", 1)).unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        cache.set("fresh", &answer("example.com", 2)).unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;

        cache.set("new", &answer("example.com", 3)).unwrap();

        assert!(cache.get("fresh").is_some());
        assert!(cache.get("new").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_never_grows_past_max_count() {
        let cache = MemoryCache::new(Duration::from_secs(600), 16);

        for i in 0..1000 {
            cache
                .set(&format!("host{i}.example.com IN A"), &answer("example.com", 1))
                .unwrap();
        }

        assert_eq!(cache.len(), 16);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_answers_are_not_cached() {
        let cache = MemoryCache::new(Duration::from_secs(60), 10);
        let empty = DnsMessage::reply_to(&DnsMessage::query(1, "example.com", rtype::A));

        assert!(matches!(cache.set("k", &empty), Err(CacheError::EmptyAnswer)));
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn purge_expired_removes_only_stale_entries() {
        let cache = MemoryCache::new(Duration::from_secs(10), 10);
        cache.set("old", &answer("example.com", 1)).unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        cache.set("young", &answer("example.com", 2)).unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn build_rejects_unknown_backend() {
        let settings = CacheSettings {
            backend: "redis".into(),
            ..CacheSettings::default()
        };

        assert!(matches!(
            build(&settings),
            Err(CacheError::UnknownBackend(name)) if name == "redis"
        ));
    }

    #[test]
    fn build_creates_memory_backend() {
        let cache = build(&CacheSettings::default()).unwrap();

        assert!(cache.is_empty());
    }
}
