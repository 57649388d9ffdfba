use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_API_HOST: &str = "https://api.themoviedb.org";
pub const DEFAULT_IMAGE_HOST: &str = "https://image.tmdb.org";
pub const DEFAULT_DOCS_URL: &str = "https://developer.themoviedb.org/docs";
pub const DEFAULT_LANGUAGE: &str = "zh-CN";
pub const DEFAULT_PORT: u16 = 8080;

/// 10 minutes
pub const DEFAULT_API_CACHE_TTL: Duration = Duration::from_millis(10 * 60 * 1000);
pub const DEFAULT_API_CACHE_MAX_ENTRIES: usize = 1000;
/// 24 hours, in seconds
pub const DEFAULT_IMAGE_CACHE_MAX_AGE: u32 = 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Listen port for the binary
    pub port: u16,
    /// Origin of the metadata API, without trailing slash
    pub api_host: String,
    /// Origin of the image CDN, without trailing slash
    pub image_host: String,
    /// Where HTML clients without an api_key get redirected
    pub docs_url: String,
    pub default_language: String,
    /// Also advertised as `max-age`, so it must be whole seconds that fit a u32
    pub api_cache_ttl: Duration,
    pub api_cache_max_entries: usize,
    pub image_cache_max_age: u32, // seconds
    /// `None` keeps images in an instance-local memory cache
    pub edge_cache_dir: Option<PathBuf>,
    /// Byte limit for either edge cache backend
    pub edge_cache_max_bytes: u64,
    pub upstream_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            api_host: DEFAULT_API_HOST.into(),
            image_host: DEFAULT_IMAGE_HOST.into(),
            docs_url: DEFAULT_DOCS_URL.into(),
            default_language: DEFAULT_LANGUAGE.into(),
            api_cache_ttl: DEFAULT_API_CACHE_TTL,
            api_cache_max_entries: DEFAULT_API_CACHE_MAX_ENTRIES,
            image_cache_max_age: DEFAULT_IMAGE_CACHE_MAX_AGE,
            edge_cache_dir: None,
            edge_cache_max_bytes: crate::cache::sled_cache::DEFAULT_MAX_CACHE_SIZE,
            upstream_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be an absolute http(s) origin")]
    InvalidHost(&'static str),
    #[error("Default language cannot be empty")]
    EmptyLanguage,
    #[error("API cache TTL must be between 1 and {} seconds", u32::MAX)]
    InvalidTtl,
    #[error("API cache capacity must be > 0")]
    InvalidCapacity,
    #[error("Invalid value for {0}: {1}")]
    InvalidEnv(&'static str, String),
}

impl ProxyConfig {
    /// Builds a config from environment variables, falling back to defaults
    /// for anything unset. Unparsable values fail instead of defaulting.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        if let Some(port) = parse_env::<u16>("PORT")? {
            cfg.port = port;
        }
        if let Ok(v) = std::env::var("TMDB_API_HOST") {
            cfg.api_host = v.trim_end_matches('/').to_string();
        }
        if let Ok(v) = std::env::var("TMDB_IMAGE_HOST") {
            cfg.image_host = v.trim_end_matches('/').to_string();
        }
        if let Ok(v) = std::env::var("TMDB_DOCS_URL") {
            cfg.docs_url = v;
        }
        if let Ok(v) = std::env::var("DEFAULT_LANGUAGE") {
            cfg.default_language = v;
        }
        if let Some(ms) = parse_env::<u64>("API_CACHE_TTL_MS")? {
            cfg.api_cache_ttl = Duration::from_millis(ms);
        }
        if let Some(n) = parse_env::<usize>("API_CACHE_MAX_ENTRIES")? {
            cfg.api_cache_max_entries = n;
        }
        if let Some(s) = parse_env::<u32>("IMAGE_CACHE_MAX_AGE")? {
            cfg.image_cache_max_age = s;
        }
        if let Ok(v) = std::env::var("EDGE_CACHE_DIR") {
            if !v.trim().is_empty() {
                cfg.edge_cache_dir = Some(PathBuf::from(v));
            }
        }
        if let Some(b) = parse_env::<u64>("EDGE_CACHE_MAX_BYTES")? {
            cfg.edge_cache_max_bytes = b;
        }
        if let Some(s) = parse_env::<u64>("UPSTREAM_TIMEOUT_SECS")? {
            cfg.upstream_timeout = Duration::from_secs(s);
        }
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_origin(&self.api_host) {
            return Err(ConfigError::InvalidHost("api_host"));
        }
        if !is_origin(&self.image_host) {
            return Err(ConfigError::InvalidHost("image_host"));
        }
        if self.default_language.trim().is_empty() {
            return Err(ConfigError::EmptyLanguage);
        }
        if self.api_cache_ttl < Duration::from_secs(1)
            || self.api_cache_ttl.as_secs() > u64::from(u32::MAX)
        {
            return Err(ConfigError::InvalidTtl);
        }
        if self.api_cache_max_entries == 0 {
            return Err(ConfigError::InvalidCapacity);
        }
        Ok(())
    }

    /// `max-age` advertised on API responses, in whole seconds.
    pub fn api_max_age(&self) -> u32 {
        u32::try_from(self.api_cache_ttl.as_secs()).unwrap_or(u32::MAX)
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => parse_value(name, &raw).map(Some),
        Err(_) => Ok(None),
    }
}

fn parse_value<T: std::str::FromStr>(name: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| ConfigError::InvalidEnv(name, raw.to_string()))
}

fn is_origin(host: &str) -> bool {
    (host.starts_with("http://") || host.starts_with("https://")) && !host.ends_with('/')
}
