use crate::config::ProxyConfig;
use crate::ProxyError;
use axum::http::{header, HeaderMap, HeaderName};
use reqwest::{Client, Response};

/// Inbound headers never forwarded to the image origin. `Referer` would leak
/// the client's page and `Host` would break the origin's virtual hosting; the
/// rest are hop-by-hop.
pub const STRIPPED_REQUEST_HEADERS: [HeaderName; 8] = [
    header::REFERER,
    header::HOST,
    header::CONNECTION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::PROXY_AUTHORIZATION,
];

/// Shared HTTP client for both upstreams.
///
/// Wraps a single `reqwest::Client` so connections are pooled across
/// requests. No retries: every failure goes straight back to the caller.
#[derive(Clone, Debug)]
pub struct Upstream {
    client: Client,
    api_host: String,
    image_host: String,
}

impl Upstream {
    pub fn new(config: &ProxyConfig) -> Result<Self, ProxyError> {
        let client = Client::builder()
            .timeout(config.upstream_timeout)
            .build()
            .map_err(ProxyError::from)?;
        Ok(Self {
            client,
            api_host: config.api_host.clone(),
            image_host: config.image_host.clone(),
        })
    }

    /// `<api-host><path>?<params>&api_key=<key>`, without a leading `&` when
    /// `params` is empty.
    pub fn api_url(&self, path: &str, params: &str, api_key: &str) -> String {
        let key_pair =
            serde_urlencoded::to_string(&[("api_key", api_key)][..]).unwrap_or_default();
        let sep = if params.is_empty() { "" } else { "&" };
        format!("{}{}?{}{}{}", self.api_host, path, params, sep, key_pair)
    }

    /// `<image-host><path><search>`; `query` excludes the `?`.
    pub fn image_url(&self, path: &str, query: Option<&str>) -> String {
        match query {
            Some(q) if !q.is_empty() => format!("{}{}?{}", self.image_host, path, q),
            _ => format!("{}{}", self.image_host, path),
        }
    }

    /// Issues the upstream GET for an API call and returns the response as-is.
    pub async fn get_json(&self, url: &str) -> Result<Response, ProxyError> {
        self.client
            .get(url)
            .header(header::ACCEPT, mime::APPLICATION_JSON.as_ref())
            .send()
            .await
            .map_err(ProxyError::from)
    }

    /// Issues the origin GET for an image, forwarding the inbound headers
    /// minus [`STRIPPED_REQUEST_HEADERS`].
    pub async fn get_image(
        &self,
        url: &str,
        inbound: &HeaderMap,
    ) -> Result<Response, reqwest::Error> {
        self.client
            .get(url)
            .headers(forwardable_headers(inbound))
            .send()
            .await
    }
}

pub fn forwardable_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = inbound.clone();
    for name in STRIPPED_REQUEST_HEADERS.iter() {
        headers.remove(name);
    }
    headers
}
