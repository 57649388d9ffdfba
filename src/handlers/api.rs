//! Proxy for metadata API calls.
//!
//! Injects the caller's `api_key` upstream, applies the default `language`,
//! and serves repeated calls from the in-memory [`ApiCache`](crate::cache::ApiCache).

use crate::cache::CachePolicy;
use crate::{AppState, ProxyError};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

pub const API_CONTENT_TYPE: &str = "application/json;charset=utf-8";

struct Slot {
    lock: Arc<Mutex<()>>,
    users: usize,
}

/// Per-key locks that coalesce concurrent misses into one upstream call.
///
/// A key stays registered while at least one [`Flight`] for it is alive.
/// Flights leave on drop, so a cancelled request cannot strand its entry.
#[derive(Default)]
pub struct InFlight {
    slots: DashMap<String, Slot>,
}

impl InFlight {
    /// Registers interest in `key`; await [`Flight::lock`] to take the turn.
    pub fn join(&self, key: &str) -> Flight<'_> {
        let lock = {
            let mut slot = self.slots.entry(key.to_string()).or_insert_with(|| Slot {
                lock: Arc::default(),
                users: 0,
            });
            slot.users += 1;
            slot.lock.clone()
        };
        Flight {
            flights: self,
            key: key.to_string(),
            lock,
        }
    }

    fn leave(&self, key: &str) {
        self.slots.remove_if_mut(key, |_, slot| {
            slot.users = slot.users.saturating_sub(1);
            slot.users == 0
        });
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// One request's membership in an [`InFlight`] key.
pub struct Flight<'a> {
    flights: &'a InFlight,
    key: String,
    lock: Arc<Mutex<()>>,
}

impl Flight<'_> {
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        self.flights.leave(&self.key);
    }
}

/// Query string after credential removal and locale defaulting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiQuery {
    pub api_key: Option<String>,
    /// Form-encoded remaining pairs, original order, `language` guaranteed.
    pub params: String,
}

impl ApiQuery {
    pub fn parse(raw: &str, default_language: &str) -> Result<Self, ProxyError> {
        let mut pairs: Vec<(String, String)> =
            serde_urlencoded::from_str(raw).map_err(|e| ProxyError::InvalidQuery(e.to_string()))?;

        let api_key = pairs
            .iter()
            .find(|(k, _)| k == "api_key")
            .map(|(_, v)| v.clone())
            .filter(|v| !v.is_empty());
        pairs.retain(|(k, _)| k != "api_key");

        if !pairs.iter().any(|(k, _)| k == "language") {
            pairs.push(("language".to_string(), default_language.to_string()));
        }

        let params = serde_urlencoded::to_string(&pairs)
            .map_err(|e| ProxyError::InvalidQuery(e.to_string()))?;
        Ok(Self { api_key, params })
    }

    pub fn cache_key(&self, path: &str) -> String {
        format!("{}?{}", path, self.params)
    }
}

fn prefers_html(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|accept| accept.contains(mime::TEXT_HTML.essence_str()))
        .unwrap_or(false)
}

fn json_response(data: String, max_age: u32) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    if let Ok(value) = HeaderValue::from_str(&CachePolicy::for_api(max_age).cache_control_value()) {
        headers.insert(header::CACHE_CONTROL, value);
    }
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(API_CONTENT_TYPE));
    (headers, data).into_response()
}

pub async fn handle(state: &AppState, uri: &Uri, headers: &HeaderMap) -> Response {
    match proxy(state, uri, headers).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!("API request for {} failed: {}", uri.path(), e);
            e.into_response()
        }
    }
}

async fn proxy(state: &AppState, uri: &Uri, headers: &HeaderMap) -> Result<Response, ProxyError> {
    {
        let mut cache = state.api_cache();
        cache.clean_expired();
        cache.enforce_capacity();
    }

    let query = ApiQuery::parse(uri.query().unwrap_or(""), &state.config.default_language)?;
    let api_key = match query.api_key.as_deref() {
        Some(key) => key,
        None if prefers_html(headers) => {
            let location = [(header::LOCATION, state.config.docs_url.clone())];
            return Ok((StatusCode::FOUND, location).into_response());
        }
        None => return Err(ProxyError::MissingApiKey),
    };

    let path = uri.path();
    let cache_key = query.cache_key(path);
    let max_age = state.config.api_max_age();

    let cached = state.api_cache().get_fresh(&cache_key);
    if let Some(data) = cached {
        tracing::debug!("API cache hit for key={}", cache_key);
        return Ok(json_response(data, max_age));
    }

    let flight = state.in_flight.join(&cache_key);
    let _turn = flight.lock().await;

    // Another request may have filled the entry while we waited.
    let cached = state.api_cache().get_fresh(&cache_key);
    if let Some(data) = cached {
        tracing::debug!("API cache filled by concurrent request, key={}", cache_key);
        return Ok(json_response(data, max_age));
    }

    tracing::info!("API cache miss for key={}", cache_key);
    let data = fetch_and_store(state, path, &query.params, api_key, &cache_key).await?;
    Ok(json_response(data, max_age))
}

async fn fetch_and_store(
    state: &AppState,
    path: &str,
    params: &str,
    api_key: &str,
    cache_key: &str,
) -> Result<String, ProxyError> {
    let url = state.upstream.api_url(path, params, api_key);
    let resp = state.upstream.get_json(&url).await?;

    let status = resp.status();
    if !status.is_success() {
        return Err(ProxyError::UpstreamHttp {
            status,
            message: format!("TMDB API error: {}", status.as_u16()),
        });
    }

    let bytes = resp.bytes().await?;
    let value: serde_json::Value =
        serde_json::from_slice(&bytes).map_err(|e| ProxyError::InvalidPayload(e.to_string()))?;
    let data =
        serde_json::to_string(&value).map_err(|e| ProxyError::InvalidPayload(e.to_string()))?;

    state.api_cache().set(cache_key.to_string(), data.clone());
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_default_language() {
        let q = ApiQuery::parse("api_key=X", "zh-CN").unwrap();
        assert_eq!(q.api_key.as_deref(), Some("X"));
        assert_eq!(q.params, "language=zh-CN");
        assert_eq!(q.cache_key("/movie/550"), "/movie/550?language=zh-CN");
    }

    #[test]
    fn keeps_explicit_language_and_order() {
        let raw = "page=2&api_key=X&language=en-US&query=fight+club";
        let q = ApiQuery::parse(raw, "zh-CN").unwrap();
        assert_eq!(q.params, "page=2&language=en-US&query=fight+club");
    }

    #[test]
    fn strips_every_api_key() {
        let q = ApiQuery::parse("api_key=A&page=1&api_key=B", "zh-CN").unwrap();
        assert_eq!(q.api_key.as_deref(), Some("A"));
        assert!(!q.params.contains("api_key"));
        assert_eq!(q.params, "page=1&language=zh-CN");
    }

    #[test]
    fn empty_api_key_counts_as_missing() {
        assert_eq!(ApiQuery::parse("api_key=", "zh-CN").unwrap().api_key, None);
        assert_eq!(ApiQuery::parse("", "zh-CN").unwrap().api_key, None);
    }

    #[test]
    fn html_preference() {
        let mut headers = HeaderMap::new();
        assert!(!prefers_html(&headers));
        headers.insert(header::ACCEPT, HeaderValue::from_static("text/html,application/xhtml+xml"));
        assert!(prefers_html(&headers));
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        assert!(!prefers_html(&headers));
    }

    #[test]
    fn in_flight_key_lives_while_any_flight_does() {
        let flights = InFlight::default();
        let first = flights.join("/movie/1?language=zh-CN");
        let second = flights.join("/movie/1?language=zh-CN");
        let other = flights.join("/movie/2?language=zh-CN");
        assert_eq!(flights.len(), 2);

        drop(first);
        assert_eq!(flights.len(), 2);
        drop(other);
        assert_eq!(flights.len(), 1);
        drop(second);
        assert!(flights.is_empty());
    }

    #[tokio::test]
    async fn flights_on_one_key_share_a_lock() {
        let flights = InFlight::default();
        let leader = flights.join("/movie/1?language=zh-CN");
        let follower = flights.join("/movie/1?language=zh-CN");

        let turn = leader.lock().await;
        assert!(follower.lock.try_lock().is_err());
        drop(turn);
        assert!(follower.lock.try_lock().is_ok());
    }

    #[tokio::test]
    async fn cancelled_waiter_leaves_its_key() {
        let flights = InFlight::default();
        let leader = flights.join("/movie/1?language=zh-CN");
        let turn = leader.lock().await;

        let waiter = async {
            let flight = flights.join("/movie/1?language=zh-CN");
            let _turn = flight.lock().await;
        };
        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(10), waiter).await;
        assert!(timed_out.is_err());
        assert_eq!(flights.len(), 1);

        drop(turn);
        drop(leader);
        assert!(flights.is_empty());
    }
}
