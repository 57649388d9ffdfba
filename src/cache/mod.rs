// Re-export modules
pub mod api;
pub mod edge;
pub mod policy;
pub mod sled_cache;

pub use api::{ApiCache, CacheEntry};
pub use edge::{EdgeCache, MemoryEdgeCache, RequestIdentity, StoredResponse};
pub use policy::CachePolicy;
pub use sled_cache::{CacheStats, SledEdgeCache};

use crate::config::ProxyConfig;
use std::sync::Arc;

/// Opens the edge cache backend the config asks for: sled when a directory
/// is set, memory otherwise.
pub fn open_edge_cache(config: &ProxyConfig) -> Result<Arc<dyn EdgeCache>, String> {
    match &config.edge_cache_dir {
        Some(dir) => {
            tracing::info!("Using sled edge cache at {}", dir.display());
            Ok(Arc::new(SledEdgeCache::new(dir, Some(config.edge_cache_max_bytes))?))
        }
        None => {
            tracing::info!("Using in-memory edge cache");
            Ok(Arc::new(MemoryEdgeCache::with_max_size(config.edge_cache_max_bytes)))
        }
    }
}
