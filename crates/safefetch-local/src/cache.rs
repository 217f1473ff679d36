//! In-memory content cache.
//!
//! Capacity-bounded LRU (recency is refreshed by inserts and reads) with a fixed TTL per entry.
//! Reads never extend `expires_at_ms`. Expired entries are dropped lazily on read and in an
//! amortized sweep piggybacked on writes.

use crate::clock::Clock;
use crate::url_guard::NormalizedUrl;
use lru::LruCache;
use safefetch_core::{CacheUpdate, Error, Result};
use sha2::{Digest, Sha256};
use std::fmt;
use std::num::NonZeroUsize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// The only namespace served through cache URIs and the download endpoint.
pub const NAMESPACE_MARKDOWN: &str = "markdown";
pub const CACHE_URI_PREFIX: &str = "safefetch://cache/";

const HASH_HEX_LEN: usize = 16;

/// Address of one cached artifact: `namespace`, a truncated sha256 of the normalized URL, and
/// an optional truncated sha256 of the vary value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    namespace: String,
    url_hash: String,
    vary_hash: Option<String>,
}

fn short_hash(domain: &str, value: &str) -> String {
    let mut h = Sha256::new();
    h.update(domain.as_bytes());
    h.update(b":");
    h.update(value.as_bytes());
    let mut s = hex::encode(h.finalize());
    s.truncate(HASH_HEX_LEN);
    s
}

impl CacheKey {
    pub fn derive(namespace: &str, url: &NormalizedUrl, vary: Option<&str>) -> Self {
        Self {
            namespace: namespace.to_string(),
            url_hash: short_hash("url", url.href()),
            vary_hash: vary
                .filter(|v| !v.is_empty())
                .map(|v| short_hash("vary", v)),
        }
    }

    /// Rebuild a key from the `{namespace}/{hash}` pair of a cache URI or download path.
    pub fn from_parts(namespace: &str, fragment: &str) -> Result<Self> {
        if namespace != NAMESPACE_MARKDOWN {
            return Err(Error::InvalidParams(format!(
                "unknown cache namespace '{namespace}'"
            )));
        }
        if !is_valid_fragment(fragment) {
            return Err(Error::InvalidParams(format!(
                "malformed cache hash '{fragment}'"
            )));
        }
        let (url_hash, vary_hash) = match fragment.split_once('.') {
            Some((u, v)) if !u.is_empty() && !v.is_empty() && !v.contains('.') => {
                (u.to_string(), Some(v.to_string()))
            }
            None => (fragment.to_string(), None),
            _ => {
                return Err(Error::InvalidParams(format!(
                    "malformed cache hash '{fragment}'"
                )))
            }
        };
        Ok(Self {
            namespace: namespace.to_string(),
            url_hash,
            vary_hash,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// `urlhash` or `urlhash.varyhash`.
    pub fn hash_fragment(&self) -> String {
        match &self.vary_hash {
            Some(v) => format!("{}.{}", self.url_hash, v),
            None => self.url_hash.clone(),
        }
    }

    pub fn uri(&self) -> String {
        format!("{CACHE_URI_PREFIX}{}/{}", self.namespace, self.hash_fragment())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.hash_fragment())
    }
}

/// `^[a-f0-9.]{8,64}$`
pub fn is_valid_fragment(s: &str) -> bool {
    (8..=64).contains(&s.len()) && s.bytes().all(|b| matches!(b, b'a'..=b'f' | b'0'..=b'9' | b'.'))
}

pub fn parse_cache_uri(uri: &str) -> Result<CacheKey> {
    let rest = uri
        .strip_prefix(CACHE_URI_PREFIX)
        .ok_or_else(|| Error::InvalidParams(format!("not a cache uri: {uri}")))?;
    let (namespace, fragment) = rest
        .split_once('/')
        .ok_or_else(|| Error::InvalidParams(format!("not a cache uri: {uri}")))?;
    CacheKey::from_parts(namespace, fragment)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub url: String,
    pub title: Option<String>,
    pub content: String,
    pub fetched_at_ms: u64,
    pub expires_at_ms: u64,
}

/// What a caller hands to [`ContentCache::set`]; timestamps are assigned by the cache.
#[derive(Debug, Clone)]
pub struct CacheValue {
    pub url: String,
    pub title: Option<String>,
    pub content: String,
}

pub type UpdateListener = Arc<dyn Fn(&CacheUpdate) + Send + Sync>;

type ListenerList = Mutex<Vec<(u64, UpdateListener)>>;

/// Handle returned by [`ContentCache::on_update`].
pub struct Subscription {
    id: u64,
    listeners: Weak<ListenerList>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(list) = self.listeners.upgrade() {
            list.lock()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|(id, _)| *id != self.id);
        }
    }
}

struct Store {
    lru: LruCache<String, Arc<CacheEntry>>,
    last_sweep_ms: u64,
    len_at_sweep: usize,
}

pub struct ContentCache {
    store: Mutex<Store>,
    listeners: Arc<ListenerList>,
    next_listener_id: AtomicU64,
    clock: Arc<dyn Clock>,
    ttl_ms: u64,
    sweep_interval_ms: u64,
    sweep_growth: usize,
}

impl ContentCache {
    pub fn new(max_keys: usize, ttl_ms: u64, clock: Arc<dyn Clock>) -> Self {
        let cap = NonZeroUsize::new(max_keys).unwrap_or(NonZeroUsize::MIN);
        let now = clock.now_ms();
        Self {
            store: Mutex::new(Store {
                lru: LruCache::new(cap),
                last_sweep_ms: now,
                len_at_sweep: 0,
            }),
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener_id: AtomicU64::new(1),
            clock,
            ttl_ms,
            sweep_interval_ms: ttl_ms.clamp(1_000, 60_000),
            sweep_growth: (cap.get() / 4).max(1),
        }
    }

    pub fn ttl_ms(&self) -> u64 {
        self.ttl_ms
    }

    pub fn capacity(&self) -> usize {
        self.lock().lru.cap().get()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Entry for `key` if present and unexpired. Refreshes recency, never expiry.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let k = key.to_string();
        let now = self.clock.now_ms();
        let mut store = self.lock();
        match store.lru.get(&k) {
            None => return None,
            Some(e) if now < e.expires_at_ms => return Some(Arc::clone(e)),
            Some(_) => {}
        }
        store.lru.pop(&k);
        tracing::debug!(cache_key = %k, "cache entry expired on read");
        None
    }

    /// Insert or replace `key`. Expiry is always `now + ttl`.
    pub fn set(&self, key: &CacheKey, value: CacheValue) -> Arc<CacheEntry> {
        let now = self.clock.now_ms();
        let entry = Arc::new(CacheEntry {
            url: value.url,
            title: value.title,
            content: value.content,
            fetched_at_ms: now,
            expires_at_ms: now.saturating_add(self.ttl_ms),
        });
        {
            let mut store = self.lock();
            if let Some((evicted, _)) = store.lru.push(key.to_string(), Arc::clone(&entry)) {
                if evicted != key.to_string() {
                    tracing::debug!(cache_key = %evicted, "cache entry evicted for capacity");
                }
            }
            self.maybe_sweep(&mut store, now);
        }
        self.notify(&CacheUpdate {
            cache_key: key.to_string(),
            namespace: key.namespace().to_string(),
            hash_fragment: key.hash_fragment(),
        });
        entry
    }

    /// Unexpired keys, most recently used first.
    pub fn keys(&self) -> Vec<String> {
        let now = self.clock.now_ms();
        let mut store = self.lock();
        purge_expired(&mut store, now);
        store.lru.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn on_update(&self, listener: impl Fn(&CacheUpdate) + Send + Sync + 'static) -> Subscription {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(listener)));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    fn maybe_sweep(&self, store: &mut Store, now: u64) {
        let grown = store.lru.len() >= store.len_at_sweep + self.sweep_growth;
        let stale = now.saturating_sub(store.last_sweep_ms) >= self.sweep_interval_ms;
        if grown || stale {
            let removed = purge_expired(store, now);
            if removed > 0 {
                tracing::debug!(removed, "cache sweep removed expired entries");
            }
        }
    }

    fn notify(&self, update: &CacheUpdate) {
        // Snapshot so listeners may (un)subscribe from inside a callback.
        let snapshot: Vec<UpdateListener> = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(update))).is_err() {
                tracing::warn!(cache_key = %update.cache_key, "cache update listener panicked");
            }
        }
    }
}

fn purge_expired(store: &mut Store, now: u64) -> usize {
    let dead: Vec<String> = store
        .lru
        .iter()
        .filter(|(_, e)| now >= e.expires_at_ms)
        .map(|(k, _)| k.clone())
        .collect();
    for k in &dead {
        store.lru.pop(k);
    }
    store.last_sweep_ms = now;
    store.len_at_sweep = store.lru.len();
    dead.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::SecurityConfig;
    use crate::url_guard::UrlGuard;
    use std::time::Duration;

    fn key(path: &str) -> CacheKey {
        let u = UrlGuard::new(&SecurityConfig::default())
            .normalize(&format!("https://example.com/{path}"))
            .unwrap();
        CacheKey::derive(NAMESPACE_MARKDOWN, &u, None)
    }

    fn value(content: &str) -> CacheValue {
        CacheValue {
            url: "https://example.com/".into(),
            title: None,
            content: content.into(),
        }
    }

    fn cache(max: usize, ttl_ms: u64) -> (ContentCache, ManualClock) {
        let clock = ManualClock::new(1_000_000);
        (ContentCache::new(max, ttl_ms, Arc::new(clock.clone())), clock)
    }

    #[test]
    fn set_then_get_within_ttl_and_gone_after() {
        let (c, clock) = cache(10, 5_000);
        let k = key("a");
        c.set(&k, value("hello"));
        let e = c.get(&k).unwrap();
        assert_eq!(e.content, "hello");
        assert_eq!(e.expires_at_ms - e.fetched_at_ms, 5_000);

        clock.advance(Duration::from_millis(4_999));
        assert!(c.get(&k).is_some());
        clock.advance(Duration::from_millis(1));
        assert!(c.get(&k).is_none());
        assert!(!c.keys().contains(&k.to_string()));
    }

    #[test]
    fn reads_do_not_extend_expiry_but_reinsert_resets_it() {
        let (c, clock) = cache(10, 1_000);
        let k = key("a");
        c.set(&k, value("v1"));
        clock.advance(Duration::from_millis(900));
        let first = c.get(&k).unwrap();
        clock.advance(Duration::from_millis(50));
        c.set(&k, value("v2"));
        let second = c.get(&k).unwrap();
        assert_eq!(second.content, "v2");
        assert_eq!(second.expires_at_ms, first.expires_at_ms + 950);
        assert_eq!(second.expires_at_ms - second.fetched_at_ms, 1_000);
    }

    #[test]
    fn capacity_evicts_least_recently_used_first() {
        let (c, _clock) = cache(3, 60_000);
        let keys: Vec<CacheKey> = (0..5).map(|i| key(&format!("p{i}"))).collect();
        c.set(&keys[0], value("0"));
        c.set(&keys[1], value("1"));
        c.set(&keys[2], value("2"));
        // Touch 0 so 1 becomes the oldest.
        assert!(c.get(&keys[0]).is_some());
        c.set(&keys[3], value("3"));
        assert!(c.get(&keys[1]).is_none());
        assert!(c.get(&keys[0]).is_some());
        c.set(&keys[4], value("4"));
        assert_eq!(c.len(), 3);
        assert!(c.get(&keys[2]).is_none());
    }

    #[test]
    fn write_sweeps_expired_entries() {
        let (c, clock) = cache(100, 1_000);
        for i in 0..10 {
            c.set(&key(&format!("old{i}")), value("x"));
        }
        clock.advance(Duration::from_secs(61));
        c.set(&key("fresh"), value("y"));
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn listeners_fire_are_isolated_and_unsubscribe() {
        let (c, _clock) = cache(10, 60_000);
        let seen = Arc::new(Mutex::new(Vec::<CacheUpdate>::new()));
        let _bad = c.on_update(|_| panic!("listener bug"));
        let seen2 = Arc::clone(&seen);
        let sub = c.on_update(move |u| seen2.lock().unwrap().push(u.clone()));

        let k = key("a");
        c.set(&k, value("hello"));
        assert_eq!(c.get(&k).unwrap().content, "hello");
        {
            let got = seen.lock().unwrap();
            assert_eq!(got.len(), 1);
            assert_eq!(got[0].namespace, NAMESPACE_MARKDOWN);
            assert_eq!(got[0].hash_fragment, k.hash_fragment());
            assert_eq!(got[0].cache_key, k.to_string());
        }

        sub.unsubscribe();
        c.set(&key("b"), value("again"));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn keys_are_deterministic_and_vary_aware() {
        let g = UrlGuard::new(&SecurityConfig::default());
        let u = g.normalize("https://example.com/page#frag").unwrap();
        let a = CacheKey::derive(NAMESPACE_MARKDOWN, &u, None);
        let plain = g.normalize("https://example.com/page").unwrap();
        let b = CacheKey::derive(NAMESPACE_MARKDOWN, &plain, None);
        assert_eq!(a, b);
        let v = CacheKey::derive(NAMESPACE_MARKDOWN, &u, Some("noise=off"));
        assert_ne!(a, v);
        assert_eq!(a.hash_fragment().len(), 16);
        assert_eq!(v.hash_fragment().len(), 33);
        assert!(is_valid_fragment(&v.hash_fragment()));
    }

    #[test]
    fn cache_uris_parse_back_and_reject_garbage() {
        let k = key("doc");
        assert_eq!(parse_cache_uri(&k.uri()).unwrap(), k);
        for bad in [
            "safefetch://cache/html/0123456789abcdef",
            "safefetch://cache/markdown/0123",
            "safefetch://cache/markdown/0123456789ABCDEF",
            "safefetch://cache/markdown/01234567..89abcdef",
            "other://cache/markdown/0123456789abcdef",
        ] {
            assert!(
                matches!(parse_cache_uri(bad), Err(Error::InvalidParams(_))),
                "{bad}"
            );
        }
    }
}
