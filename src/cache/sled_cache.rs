use crate::cache::edge::{now_unix, EdgeCache, RequestIdentity, StoredResponse};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sled::Db;
use std::path::Path;

/// Default maximum cache size: 10GB
pub const DEFAULT_MAX_CACHE_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// Metadata stored alongside cached response bodies
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CacheMetadata {
    pub key: String,
    pub url: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub size: usize,
    pub stored_at: i64,
    pub accessed_at: i64,
}

/// Statistics about the cache
#[derive(Debug, Serialize)]
pub struct CacheStats {
    pub total_size_bytes: u64,
    pub entry_count: usize,
    pub max_size_bytes: u64,
}

/// Sled-based edge cache with LRU eviction
///
/// This cache provides:
/// - Persistent storage that survives restarts
/// - LRU (Least Recently Used) eviction once over the size limit
/// - Freshness checks against the stored `Cache-Control` max-age
/// - Pure Rust (no C++ compilation needed)
pub struct SledEdgeCache {
    db: Db,
    max_size: u64,
}

impl SledEdgeCache {
    /// Open (or create) a Sled edge cache
    ///
    /// # Arguments
    /// * `path` - Directory to store the Sled database
    /// * `max_size` - Optional maximum body bytes (default: 10GB)
    pub fn new(path: impl AsRef<Path>, max_size: Option<u64>) -> Result<Self, String> {
        let db = sled::open(path).map_err(|e| format!("Failed to open Sled database: {}", e))?;

        Ok(Self {
            db,
            max_size: max_size.unwrap_or(DEFAULT_MAX_CACHE_SIZE),
        })
    }

    fn metadata_key(key: &str) -> String {
        format!("meta:{}", key)
    }

    fn data_key(key: &str) -> String {
        format!("data:{}", key)
    }

    fn all_metadata(&self) -> Vec<CacheMetadata> {
        self.db
            .scan_prefix(b"meta:")
            .filter_map(|item| item.ok())
            .filter_map(|(_, value)| serde_json::from_slice::<CacheMetadata>(&value).ok())
            .collect()
    }

    fn remove(&self, key: &str) -> Result<(), String> {
        self.db.remove(Self::metadata_key(key).as_bytes()).map_err(|e| e.to_string())?;
        self.db.remove(Self::data_key(key).as_bytes()).map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Evict least recently used entries until under size limit
    fn evict_if_needed(&self) -> Result<(), String> {
        let mut entries = self.all_metadata();
        let current: u64 = entries.iter().map(|m| m.size as u64).sum();

        if current <= self.max_size {
            return Ok(());
        }

        tracing::info!(
            "Edge cache size {} exceeds limit {}, starting eviction",
            current,
            self.max_size
        );

        entries.sort_by_key(|e| e.accessed_at);

        // Remove entries until we're under target size (90% of max)
        let target_to_free = current.saturating_sub(self.max_size * 90 / 100);
        let mut freed = 0u64;
        let mut evicted_count = 0;

        for entry in entries {
            if freed >= target_to_free {
                break;
            }
            self.remove(&entry.key)?;
            freed += entry.size as u64;
            evicted_count += 1;
            tracing::debug!("Evicted edge cache entry: url={}, size={}", entry.url, entry.size);
        }

        self.db.flush().map_err(|e| e.to_string())?;
        tracing::info!(
            "Eviction complete: freed {} bytes by removing {} entries",
            freed,
            evicted_count
        );
        Ok(())
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let entries = self.all_metadata();
        CacheStats {
            total_size_bytes: entries.iter().map(|m| m.size as u64).sum(),
            entry_count: entries.len(),
            max_size_bytes: self.max_size,
        }
    }
}

fn headers_to_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (name.as_str().to_string(), String::from_utf8_lossy(value.as_bytes()).into_owned())
        })
        .collect()
}

fn pairs_to_headers(pairs: &[(String, String)]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }
    headers
}

#[async_trait::async_trait]
impl EdgeCache for SledEdgeCache {
    async fn lookup(&self, identity: &RequestIdentity) -> Result<Option<StoredResponse>, String> {
        let key = identity.key();
        let meta_key = Self::metadata_key(&key);

        let mut meta = match self.db.get(meta_key.as_bytes()).map_err(|e| e.to_string())? {
            Some(bytes) => {
                serde_json::from_slice::<CacheMetadata>(&bytes).map_err(|e| e.to_string())?
            }
            None => return Ok(None),
        };

        let data = match self.db.get(Self::data_key(&key).as_bytes()).map_err(|e| e.to_string())? {
            Some(d) => d.to_vec(),
            None => return Ok(None),
        };

        let status = StatusCode::from_u16(meta.status).map_err(|e| e.to_string())?;
        let stored = StoredResponse {
            status,
            headers: pairs_to_headers(&meta.headers),
            body: Bytes::from(data),
            stored_at: meta.stored_at,
        };

        let now = now_unix();
        if !stored.is_fresh_at(now) {
            tracing::debug!("Edge cache entry expired: url={}", meta.url);
            self.remove(&key)?;
            return Ok(None);
        }

        // Update access time (cache hit)
        meta.accessed_at = now;
        if let Ok(bytes) = serde_json::to_vec(&meta) {
            let _ = self.db.insert(meta_key.as_bytes(), bytes);
        }

        Ok(Some(stored))
    }

    async fn store(
        &self,
        identity: &RequestIdentity,
        response: StoredResponse,
    ) -> Result<(), String> {
        let key = identity.key();
        let now = now_unix();

        let metadata = CacheMetadata {
            key: key.clone(),
            url: identity.url.clone(),
            status: response.status.as_u16(),
            headers: headers_to_pairs(&response.headers),
            size: response.body.len(),
            stored_at: response.stored_at,
            accessed_at: now,
        };
        let meta_bytes = serde_json::to_vec(&metadata).map_err(|e| e.to_string())?;

        self.db
            .insert(Self::data_key(&key).as_bytes(), response.body.as_ref())
            .map_err(|e| format!("Failed to write cache data: {}", e))?;
        self.db
            .insert(Self::metadata_key(&key).as_bytes(), meta_bytes)
            .map_err(|e| format!("Failed to write cache metadata: {}", e))?;

        self.db.flush().map_err(|e| e.to_string())?;

        self.evict_if_needed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{header, Method};
    use std::path::PathBuf;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("tmdb-edge-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn identity(path: &str) -> RequestIdentity {
        let url = format!("https://image.tmdb.org{}", path);
        RequestIdentity::new(Method::GET, url, &HeaderMap::new())
    }

    fn image(body: &'static [u8]) -> StoredResponse {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/jpeg"));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("public, max-age=86400"));
        headers.insert("x-worker-cache", HeaderValue::from_static("MISS"));
        StoredResponse::new(StatusCode::OK, headers, Bytes::from_static(body))
    }

    #[tokio::test]
    async fn store_then_lookup_survives_reopen() {
        let dir = temp_dir("reopen");
        let id = identity("/t/p/w500/abc.jpg");
        {
            let cache = SledEdgeCache::new(&dir, None).unwrap();
            assert!(cache.lookup(&id).await.unwrap().is_none());
            cache.store(&id, image(b"abc")).await.unwrap();
        }

        let cache = SledEdgeCache::new(&dir, None).unwrap();
        let hit = cache.lookup(&id).await.unwrap().expect("persisted entry");
        assert_eq!(hit.status, StatusCode::OK);
        assert_eq!(hit.body, Bytes::from_static(b"abc"));
        assert_eq!(hit.headers.get(header::CONTENT_TYPE).unwrap(), "image/jpeg");
        assert_eq!(hit.headers.get("x-worker-cache").unwrap(), "MISS");

        drop(cache);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn expired_entries_are_removed_on_lookup() {
        let dir = temp_dir("expired");
        let cache = SledEdgeCache::new(&dir, None).unwrap();
        let id = identity("/t/p/w92/old.jpg");

        let mut stale = image(b"old");
        stale.stored_at -= 2 * 86400;
        cache.store(&id, stale).await.unwrap();

        assert!(cache.lookup(&id).await.unwrap().is_none());
        assert_eq!(cache.stats().entry_count, 0);

        drop(cache);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn evicts_least_recently_used_over_limit() {
        let dir = temp_dir("evict");
        let cache = SledEdgeCache::new(&dir, Some(10)).unwrap();

        cache.store(&identity("/t/p/a.jpg"), image(b"aaaaaa")).await.unwrap();
        cache.store(&identity("/t/p/b.jpg"), image(b"bbbbbb")).await.unwrap();

        let stats = cache.stats();
        assert!(stats.total_size_bytes <= 10);
        assert_eq!(stats.entry_count, 1);

        drop(cache);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
