use axum::{
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use thiserror::Error;
use tower_http::trace::TraceLayer;

pub mod cache;
pub mod config;
pub mod fetch;
pub mod handlers;
pub mod state;

pub use crate::state::AppState;

/// Per-request failures. Every variant ends as a plain-text response.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Missing api_key parameter")]
    MissingApiKey,
    #[error("Invalid query string: {0}")]
    InvalidQuery(String),
    /// Non-success status from either upstream; the status is passed through.
    #[error("{message}")]
    UpstreamHttp { status: StatusCode, message: String },
    #[error("{0}")]
    Network(String),
    #[error("{0}")]
    InvalidPayload(String),
    #[error("Method not allowed")]
    MethodNotAllowed,
}

pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::MissingApiKey | ProxyError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
            ProxyError::UpstreamHttp { status, .. } => *status,
            ProxyError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ProxyError::Network(_) | ProxyError::InvalidPayload(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(e: reqwest::Error) -> Self {
        ProxyError::Network(e.to_string())
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

/// Path prefix served by the image proxy.
pub const IMAGE_PATH_PREFIX: &str = "/t/p/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Image,
    Api,
}

/// Image paths go to the image proxy, everything else to the API proxy.
pub fn classify(path: &str) -> Route {
    if path.starts_with(IMAGE_PATH_PREFIX) {
        Route::Image
    } else {
        Route::Api
    }
}

async fn dispatch(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    match classify(uri.path()) {
        Route::Image => handlers::image::handle(&state, method, &uri, &headers).await,
        Route::Api => handlers::api::handle(&state, &uri, &headers).await,
    }
}

/// Every request lands on a single dispatcher; there are no fixed routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .fallback(dispatch)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_prefix() {
        assert_eq!(classify("/t/p/w500/abc.jpg"), Route::Image);
        assert_eq!(classify("/t/p/original/x.png"), Route::Image);
        assert_eq!(classify("/3/movie/550"), Route::Api);
        assert_eq!(classify("/movie/550"), Route::Api);
        assert_eq!(classify("/t/p"), Route::Api);
        assert_eq!(classify("/"), Route::Api);
    }

    #[test]
    fn error_statuses() {
        assert_eq!(ProxyError::MissingApiKey.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ProxyError::MethodNotAllowed.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(ProxyError::Network("dns".into()).status(), StatusCode::INTERNAL_SERVER_ERROR);
        let upstream = ProxyError::UpstreamHttp {
            status: StatusCode::NOT_FOUND,
            message: "TMDB API error: 404".into(),
        };
        assert_eq!(upstream.status(), StatusCode::NOT_FOUND);
        assert_eq!(upstream.to_string(), "TMDB API error: 404");
        assert_eq!(ProxyError::MissingApiKey.to_string(), "Missing api_key parameter");
    }
}
