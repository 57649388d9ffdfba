use crate::cache::{CachePolicy, RequestIdentity, StoredResponse};
use crate::{AppState, ProxyError};
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

pub const X_WORKER_CACHE: &str = "x-worker-cache";

/// Marker the image origin puts in its HTML error page for unknown sizes.
pub const SIZE_NOT_SUPPORTED_MARKER: &str = "<h1>Image size not supported</h1>";

/// Origin response headers that describe the hop rather than the image.
/// `Content-Length` is recomputed from the buffered body.
const STRIPPED_RESPONSE_HEADERS: [HeaderName; 4] = [
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::CONTENT_LENGTH,
    header::UPGRADE,
];

/// Serves `/t/p/...` from the edge cache, filling it from the image origin on
/// a miss.
pub async fn handle(state: &AppState, method: Method, uri: &Uri, headers: &HeaderMap) -> Response {
    if method != Method::GET {
        return ProxyError::MethodNotAllowed.into_response();
    }

    let origin_url = state.upstream.image_url(uri.path(), uri.query());
    let identity = RequestIdentity::new(method, origin_url.clone(), headers);

    match state.edge_cache.lookup(&identity).await {
        Ok(Some(stored)) => {
            tracing::debug!("Cache hit for: {}", origin_url);
            return cache_hit(stored);
        }
        Ok(None) => {}
        Err(e) => tracing::warn!("Edge cache lookup failed for {}: {}", origin_url, e),
    }

    tracing::info!("Cache miss for: {}", origin_url);
    match fetch_and_store(state, &identity, &origin_url, headers).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

fn cache_hit(stored: StoredResponse) -> Response {
    let mut headers = stored.headers;
    headers.insert(X_WORKER_CACHE, HeaderValue::from_static("HIT"));
    build_response(stored.status, headers, stored.body)
}

fn build_response(status: StatusCode, headers: HeaderMap, body: Bytes) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

async fn fetch_and_store(
    state: &AppState,
    identity: &RequestIdentity,
    origin_url: &str,
    inbound: &HeaderMap,
) -> Result<Response, ProxyError> {
    let resp = state
        .upstream
        .get_image(origin_url, inbound)
        .await
        .map_err(fetch_failure)?;

    let status = resp.status();
    if !status.is_success() {
        let reason = status.canonical_reason().unwrap_or("");
        let diagnostic = match resp.text().await {
            Ok(body) => normalize_origin_error(body),
            Err(_) => "Failed to read error body".to_string(),
        };
        let message = format!(
            "Error fetching image: {} {} - {}",
            status.as_u16(),
            reason,
            diagnostic
        );
        tracing::error!("{}", message);
        return Err(ProxyError::UpstreamHttp { status, message });
    }

    let mut headers = resp.headers().clone();
    for name in STRIPPED_RESPONSE_HEADERS.iter() {
        headers.remove(name);
    }
    let body = resp.bytes().await.map_err(fetch_failure)?;

    let policy = CachePolicy::for_images(state.config.image_cache_max_age);
    if let Ok(value) = HeaderValue::from_str(&policy.cache_control_value()) {
        headers.insert(header::CACHE_CONTROL, value);
    }
    headers.insert(X_WORKER_CACHE, HeaderValue::from_static("MISS"));

    // Stored and returned copies share nothing mutable; the write completes
    // before the caller sees the response.
    let stored = StoredResponse::new(status, headers.clone(), body.clone());
    if let Err(e) = state.edge_cache.store(identity, stored).await {
        tracing::warn!("Failed to cache image {}: {}", origin_url, e);
    }

    Ok(build_response(status, headers, body))
}

/// Collapses the origin's HTML page for unsupported sizes into a short message.
pub fn normalize_origin_error(body: String) -> String {
    if body.contains(SIZE_NOT_SUPPORTED_MARKER) {
        "Image size not supported".to_string()
    } else {
        body
    }
}

fn fetch_failure(e: reqwest::Error) -> ProxyError {
    tracing::error!("Error fetching image: {}", e);
    let detail = if e.is_connect() || e.is_timeout() {
        format!("Connection error: {}", e)
    } else {
        format!("Error: {}", e)
    };
    ProxyError::Network(format!("An error occurred while fetching the image ({})", detail))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_size_marker() {
        let page = "<html><body><h1>Image size not supported</h1><p>w123</p></body></html>";
        assert_eq!(normalize_origin_error(page.to_string()), "Image size not supported");
        assert_eq!(normalize_origin_error("Not Found".to_string()), "Not Found");
    }

    #[test]
    fn hit_overrides_cache_marker() {
        let mut headers = HeaderMap::new();
        headers.insert(X_WORKER_CACHE, HeaderValue::from_static("MISS"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/jpeg"));
        let stored = StoredResponse::new(StatusCode::OK, headers, Bytes::from_static(b"img"));

        let response = cache_hit(stored);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(X_WORKER_CACHE).unwrap(), "HIT");
        assert_eq!(response.headers().get(header::CONTENT_TYPE).unwrap(), "image/jpeg");
    }
}
