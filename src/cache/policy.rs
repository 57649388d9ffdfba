/// `Cache-Control` directives written by the proxy.
///
/// API responses go out as `max-age=600` so clients can reuse them for as long
/// as the in-memory cache would. Images go out as `public, max-age=86400`, and
/// that same header decides how long the edge cache treats a stored image as
/// fresh.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachePolicy {
    /// Cache lifetime in seconds (max-age directive).
    pub max_age: u32,

    /// Emit the `public` directive so shared caches may store the response.
    pub public: bool,
}

impl CachePolicy {
    /// Policy for proxied image bytes.
    pub fn for_images(max_age: u32) -> Self {
        Self {
            max_age,
            public: true,
        }
    }

    /// Policy for JSON API responses.
    pub fn for_api(max_age: u32) -> Self {
        Self {
            max_age,
            public: false,
        }
    }

    pub fn cache_control_value(&self) -> String {
        if self.public {
            format!("public, max-age={}", self.max_age)
        } else {
            format!("max-age={}", self.max_age)
        }
    }
}

/// Extracts the `max-age` directive from a `Cache-Control` header value.
///
/// `s-maxage` is ignored. Returns `None` when no parsable max-age is present.
pub fn max_age_from(value: &str) -> Option<u64> {
    value
        .split(',')
        .map(str::trim)
        .filter_map(|directive| directive.split_once('='))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("max-age"))
        .and_then(|(_, secs)| secs.trim().trim_matches('"').parse().ok())
}
