//! Shared response cache for proxied images.
//!
//! The image handler only sees the [`EdgeCache`] trait: look a request
//! identity up, or store a response under it. Freshness comes from the
//! `Cache-Control` header the response was stored with.

use crate::cache::policy::max_age_from;
use crate::cache::sled_cache::DEFAULT_MAX_CACHE_SIZE;
use axum::http::{header, HeaderMap, Method, StatusCode};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;

/// Inbound headers that take part in the cache identity.
pub const VARY_HEADERS: [&str; 2] = ["accept", "accept-encoding"];

/// Method, absolute URL and the vary headers of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIdentity {
    pub method: Method,
    pub url: String,
    pub vary: Vec<(String, String)>,
}

impl RequestIdentity {
    pub fn new(method: Method, url: impl Into<String>, headers: &HeaderMap) -> Self {
        let vary = VARY_HEADERS
            .iter()
            .map(|name| {
                let value = headers
                    .get(*name)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .trim()
                    .to_string();
                (name.to_string(), value)
            })
            .collect();
        Self {
            method,
            url: url.into(),
            vary,
        }
    }

    pub fn canonical(&self) -> String {
        let mut out = format!("{} {}", self.method, self.url);
        for (name, value) in &self.vary {
            out.push('\n');
            out.push_str(name);
            out.push(':');
            out.push_str(value);
        }
        out
    }

    /// Storage key: hex SHA-256 of the canonical form.
    pub fn key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// A fully buffered HTTP response as held by the edge cache.
#[derive(Debug, Clone)]
pub struct StoredResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Unix seconds at store time
    pub stored_at: i64,
}

impl StoredResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
            stored_at: now_unix(),
        }
    }

    /// Lifetime taken from the stored `Cache-Control: max-age`.
    pub fn max_age(&self) -> Option<u64> {
        self.headers
            .get(header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .and_then(max_age_from)
    }

    /// Responses without a max-age stay fresh until the backend evicts them.
    pub fn is_fresh_at(&self, now: i64) -> bool {
        match self.max_age() {
            Some(max_age) => now.saturating_sub(self.stored_at) < max_age as i64,
            None => true,
        }
    }
}

pub fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

/// Shared, durable response cache keyed by request identity.
#[async_trait::async_trait]
pub trait EdgeCache: Send + Sync {
    /// Returns a fresh stored response, if any.
    async fn lookup(&self, identity: &RequestIdentity) -> Result<Option<StoredResponse>, String>;

    /// Stores `response`. Completes once the entry is readable by `lookup`.
    async fn store(
        &self,
        identity: &RequestIdentity,
        response: StoredResponse,
    ) -> Result<(), String>;
}

struct MemorySlot {
    response: StoredResponse,
    accessed_at: AtomicI64,
}

/// Instance-local edge cache. Nothing survives a restart.
///
/// Bounded by total body bytes, like [`SledEdgeCache`](crate::cache::SledEdgeCache):
/// every store sweeps expired entries, then evicts least recently used ones
/// down to 90% of the limit.
pub struct MemoryEdgeCache {
    entries: RwLock<HashMap<String, MemorySlot>>,
    max_size: u64,
}

impl Default for MemoryEdgeCache {
    fn default() -> Self {
        Self::with_max_size(DEFAULT_MAX_CACHE_SIZE)
    }
}

impl MemoryEdgeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_size(max_size: u64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_size,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total body bytes currently held.
    pub fn size_bytes(&self) -> u64 {
        self.entries
            .read()
            .map(|e| e.values().map(|slot| slot.response.body.len() as u64).sum())
            .unwrap_or(0)
    }

    fn sweep(&self, entries: &mut HashMap<String, MemorySlot>, now: i64) {
        let before = entries.len();
        entries.retain(|_, slot| slot.response.is_fresh_at(now));
        let expired = before - entries.len();
        if expired > 0 {
            tracing::debug!("Dropped {} expired edge cache entries", expired);
        }

        let current: u64 = entries
            .values()
            .map(|slot| slot.response.body.len() as u64)
            .sum();
        if current <= self.max_size {
            return;
        }

        tracing::info!(
            "Edge cache size {} exceeds limit {}, starting eviction",
            current,
            self.max_size
        );

        let mut by_access: Vec<(i64, String, u64)> = entries
            .iter()
            .map(|(key, slot)| {
                let accessed_at = slot.accessed_at.load(Ordering::Relaxed);
                (accessed_at, key.clone(), slot.response.body.len() as u64)
            })
            .collect();
        by_access.sort();

        let target_to_free = current.saturating_sub(self.max_size / 100 * 90);
        let mut freed = 0u64;
        let mut evicted_count = 0;
        for (_, key, size) in by_access {
            if freed >= target_to_free {
                break;
            }
            entries.remove(&key);
            freed += size;
            evicted_count += 1;
        }

        tracing::info!("Evicted {} edge cache entries, freed {} bytes", evicted_count, freed);
    }
}

#[async_trait::async_trait]
impl EdgeCache for MemoryEdgeCache {
    async fn lookup(&self, identity: &RequestIdentity) -> Result<Option<StoredResponse>, String> {
        let key = identity.key();
        let now = now_unix();
        let fresh = {
            let entries = self.entries.read().map_err(|e| e.to_string())?;
            match entries.get(&key) {
                Some(slot) if slot.response.is_fresh_at(now) => {
                    slot.accessed_at.store(now, Ordering::Relaxed);
                    Some(Some(slot.response.clone()))
                }
                Some(_) => Some(None),
                None => None,
            }
        };

        match fresh {
            Some(Some(stored)) => Ok(Some(stored)),
            Some(None) => {
                self.entries.write().map_err(|e| e.to_string())?.remove(&key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn store(
        &self,
        identity: &RequestIdentity,
        response: StoredResponse,
    ) -> Result<(), String> {
        if response.body.len() as u64 > self.max_size {
            tracing::debug!(
                "Not caching {}: {} bytes exceeds edge cache limit",
                identity.url,
                response.body.len()
            );
            return Ok(());
        }

        let slot = MemorySlot {
            accessed_at: AtomicI64::new(response.stored_at),
            response,
        };
        let mut entries = self.entries.write().map_err(|e| e.to_string())?;
        entries.insert(identity.key(), slot);
        self.sweep(&mut entries, now_unix());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn identity(url: &str) -> RequestIdentity {
        RequestIdentity::new(Method::GET, url, &HeaderMap::new())
    }

    fn image_response(cache_control: &str) -> StoredResponse {
        let mut headers = HeaderMap::new();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_str(cache_control).unwrap());
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/jpeg"));
        StoredResponse::new(StatusCode::OK, headers, Bytes::from_static(b"jpeg-bytes"))
    }

    #[test]
    fn identity_key_depends_on_url_and_vary_headers() {
        let a = identity("https://image.tmdb.org/t/p/w500/a.jpg");
        let b = identity("https://image.tmdb.org/t/p/w500/a.jpg");
        let c = identity("https://image.tmdb.org/t/p/w500/b.jpg");
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
        assert_eq!(a.key().len(), 64);

        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        let url = "https://image.tmdb.org/t/p/w500/a.jpg";
        let gz = RequestIdentity::new(Method::GET, url, &headers);
        assert_ne!(a.key(), gz.key());
    }

    #[test]
    fn identity_ignores_unrelated_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::REFERER, HeaderValue::from_static("https://example.com"));
        let with_referer = RequestIdentity::new(Method::GET, "https://x/t/p/a.jpg", &headers);
        assert_eq!(with_referer.key(), identity("https://x/t/p/a.jpg").key());
    }

    #[test]
    fn freshness_follows_max_age() {
        let mut stored = image_response("public, max-age=86400");
        let now = stored.stored_at;
        assert!(stored.is_fresh_at(now));
        assert!(stored.is_fresh_at(now + 86399));
        assert!(!stored.is_fresh_at(now + 86400));

        stored.headers.remove(header::CACHE_CONTROL);
        assert!(stored.is_fresh_at(now + 10 * 86400));
    }

    #[tokio::test]
    async fn memory_cache_round_trip() {
        let cache = MemoryEdgeCache::new();
        let id = identity("https://image.tmdb.org/t/p/w500/a.jpg");
        assert!(cache.lookup(&id).await.unwrap().is_none());

        cache.store(&id, image_response("public, max-age=86400")).await.unwrap();
        let hit = cache.lookup(&id).await.unwrap().expect("stored response");
        assert_eq!(hit.status, StatusCode::OK);
        assert_eq!(hit.body, Bytes::from_static(b"jpeg-bytes"));
        assert_eq!(hit.headers.get(header::CONTENT_TYPE).unwrap(), "image/jpeg");
    }

    #[tokio::test]
    async fn memory_cache_drops_expired_entries() {
        let cache = MemoryEdgeCache::new();
        let id = identity("https://image.tmdb.org/t/p/w92/old.jpg");
        let mut stale = image_response("public, max-age=60");
        stale.stored_at -= 120;
        cache.store(&id, stale).await.unwrap();

        assert!(cache.lookup(&id).await.unwrap().is_none());
        assert!(cache.is_empty());
    }

    fn sized_response(len: usize, stored_at: i64) -> StoredResponse {
        let mut response = image_response("public, max-age=86400");
        response.body = Bytes::from(vec![0u8; len]);
        response.stored_at = stored_at;
        response
    }

    #[tokio::test]
    async fn memory_cache_store_sweeps_expired_entries() {
        let cache = MemoryEdgeCache::new();
        for i in 0..1000 {
            let mut stale = image_response("public, max-age=60");
            stale.stored_at -= 3600;
            let id = identity(&format!("https://image.tmdb.org/t/p/w92/{}.jpg", i));
            cache.store(&id, stale).await.unwrap();
        }
        assert!(cache.is_empty());

        let id = identity("https://image.tmdb.org/t/p/w92/fresh.jpg");
        cache.store(&id, image_response("public, max-age=86400")).await.unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.lookup(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn memory_cache_evicts_least_recently_used_over_limit() {
        let cache = MemoryEdgeCache::with_max_size(250);
        let now = now_unix();
        let a = identity("https://image.tmdb.org/t/p/w92/a.jpg");
        let b = identity("https://image.tmdb.org/t/p/w92/b.jpg");
        let c = identity("https://image.tmdb.org/t/p/w92/c.jpg");

        cache.store(&a, sized_response(100, now - 30)).await.unwrap();
        cache.store(&b, sized_response(100, now - 20)).await.unwrap();
        // Reading `a` makes `b` the least recently used entry.
        assert!(cache.lookup(&a).await.unwrap().is_some());
        cache.store(&c, sized_response(100, now - 10)).await.unwrap();

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.size_bytes(), 200);
        assert!(cache.lookup(&b).await.unwrap().is_none());
        assert!(cache.lookup(&a).await.unwrap().is_some());
        assert!(cache.lookup(&c).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn memory_cache_skips_bodies_over_limit() {
        let cache = MemoryEdgeCache::with_max_size(10);
        let id = identity("https://image.tmdb.org/t/p/original/huge.jpg");
        cache.store(&id, sized_response(11, now_unix())).await.unwrap();
        assert!(cache.is_empty());
    }
}
