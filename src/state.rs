use crate::cache::{ApiCache, EdgeCache};
use crate::config::ProxyConfig;
use crate::fetch::Upstream;
use crate::handlers::api::InFlight;
use crate::ProxyError;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Everything the handlers share. Built once at startup; clones are cheap.
///
/// The API cache is instance-local: separate processes hold separate caches.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ProxyConfig>,
    pub api_cache: Arc<Mutex<ApiCache>>,
    pub in_flight: Arc<InFlight>,
    pub edge_cache: Arc<dyn EdgeCache>,
    pub upstream: Upstream,
}

impl AppState {
    pub fn new(config: ProxyConfig, edge_cache: Arc<dyn EdgeCache>) -> Result<Self, ProxyError> {
        let upstream = Upstream::new(&config)?;
        let api_cache = ApiCache::new(config.api_cache_ttl, config.api_cache_max_entries);
        Ok(Self {
            config: Arc::new(config),
            api_cache: Arc::new(Mutex::new(api_cache)),
            in_flight: Arc::new(InFlight::default()),
            edge_cache,
            upstream,
        })
    }

    /// Never hold the guard across an `.await`.
    pub fn api_cache(&self) -> MutexGuard<'_, ApiCache> {
        self.api_cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
