use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::config::CatalogConfig;
use crate::model::{ProductDetail, ProductId, ProductPage};

pub const MAX_URL_LENGTH: usize = 2048;
pub const MAX_RESPONSE_BODY_SIZE: usize = 20 * 1024 * 1024;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const MAX_TIMEOUT_MS: u64 = 300_000;

const PRODUCTS_PATH: &str = "products";
const ERROR_SNIPPET_LENGTH: usize = 200;

/// Network side of the catalog: listing pages and product details.
#[async_trait::async_trait]
pub trait CatalogApi: Send + Sync {
    async fn fetch_products(&self, page: u32) -> Result<ProductPage, HttpError>;
    async fn fetch_product_details(&self, id: ProductId) -> Result<ProductDetail, HttpError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidatedUrl {
    url: Url,
    scheme: String,
    host: String,
}

impl ValidatedUrl {
    pub fn new(url: impl Into<String>) -> Result<Self, HttpError> {
        Self::with_policy(url, false)
    }

    /// Same checks as [`ValidatedUrl::new`], optionally letting loopback and LAN hosts through.
    pub fn with_policy(url: impl Into<String>, allow_private_hosts: bool) -> Result<Self, HttpError> {
        let url = url.into();
        let parsed = Self::validate(&url, allow_private_hosts)?;

        let host = parsed
            .host_str()
            .ok_or_else(|| HttpError::InvalidUrl {
                url: Self::truncate_url(&url),
                reason: "missing host".to_string(),
            })?
            .to_lowercase();

        Ok(Self {
            scheme: parsed.scheme().to_lowercase(),
            url: parsed,
            host,
        })
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn as_url(&self) -> &Url {
        &self.url
    }

    pub fn into_url(self) -> Url {
        self.url
    }

    fn validate(url: &str, allow_private_hosts: bool) -> Result<Url, HttpError> {
        if url.is_empty() {
            return Err(HttpError::InvalidUrl {
                url: String::new(),
                reason: "URL cannot be empty".to_string(),
            });
        }

        if url.len() > MAX_URL_LENGTH {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(url),
                reason: format!("URL exceeds maximum length of {} bytes", MAX_URL_LENGTH),
            });
        }

        if url.trim().is_empty() {
            return Err(HttpError::InvalidUrl {
                url: url.to_string(),
                reason: "URL cannot be only whitespace".to_string(),
            });
        }

        let parsed = Url::parse(url).map_err(|e| HttpError::InvalidUrl {
            url: Self::truncate_url(url),
            reason: e.to_string(),
        })?;

        let scheme = parsed.scheme().to_lowercase();
        if scheme != "http" && scheme != "https" {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(url),
                reason: format!(
                    "invalid scheme '{}', only 'http' and 'https' are allowed",
                    scheme
                ),
            });
        }

        let Some(host) = parsed.host_str().map(str::to_lowercase) else {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(url),
                reason: "URL must have a host".to_string(),
            });
        };

        if !allow_private_hosts && Self::is_private_host(&host, &parsed) {
            return Err(HttpError::PrivateNetworkBlocked {
                url: Self::truncate_url(url),
                host,
            });
        }

        if !parsed.username().is_empty() || parsed.password().is_some() {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(url),
                reason: "credentials in URL are not allowed".to_string(),
            });
        }

        Ok(parsed)
    }

    fn is_private_host(host: &str, parsed: &Url) -> bool {
        if matches!(host, "localhost" | "127.0.0.1" | "::1" | "[::1]" | "0.0.0.0") {
            return true;
        }

        if host.ends_with(".local") || host.ends_with(".localhost") || host.ends_with(".internal") {
            return true;
        }

        if host.starts_with("10.") || host.starts_with("192.168.") || host.starts_with("169.254.") {
            return true;
        }

        if let Some(rest) = host.strip_prefix("172.") {
            let second = rest.split('.').next().and_then(|o| o.parse::<u8>().ok());
            if matches!(second, Some(16..=31)) {
                return true;
            }
        }

        if host.starts_with("[fd") || host.starts_with("[fe80:") {
            return true;
        }

        matches!(parsed.port(), Some(22 | 23 | 25 | 6379 | 11211))
    }

    fn truncate_url(url: &str) -> String {
        if url.len() <= 100 {
            return url.to_string();
        }
        let mut end = 100;
        while !url.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &url[..end])
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum HttpError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("private network access blocked: {url} resolves to {host}")]
    PrivateNetworkBlocked { url: String, host: String },

    #[error("response body too large: {size} bytes exceeds maximum of {max} bytes")]
    ResponseTooLarge { size: usize, max: usize },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("connection failed to {host}: {message}")]
    ConnectionError { host: String, message: String },

    #[error("timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64, request_id: String },

    #[error("HTTP error {status}: {message}")]
    HttpStatus {
        status: u16,
        message: String,
        request_id: String,
        retryable: bool,
    },

    #[error("invalid response: {reason}")]
    InvalidResponse { reason: String, request_id: String },

    #[error("request aborted: {reason}")]
    Aborted { reason: String },
}

impl HttpError {
    pub fn is_retryable(&self) -> bool {
        match self {
            HttpError::Timeout { .. }
            | HttpError::ConnectionError { .. }
            | HttpError::Aborted { .. } => true,
            HttpError::HttpStatus { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            HttpError::Timeout { request_id, .. }
            | HttpError::HttpStatus { request_id, .. }
            | HttpError::InvalidResponse { request_id, .. } => Some(request_id),
            _ => None,
        }
    }

    pub fn is_client_error(&self) -> bool {
        matches!(self, HttpError::HttpStatus { status, .. } if (400..500).contains(status))
    }

    pub fn from_status(status: u16, body: &[u8], request_id: &str) -> Self {
        let snippet: String = String::from_utf8_lossy(body)
            .chars()
            .take(ERROR_SNIPPET_LENGTH)
            .collect();
        let message = if snippet.trim().is_empty() {
            format!("HTTP error: {status}")
        } else {
            snippet
        };
        HttpError::HttpStatus {
            status,
            message,
            request_id: request_id.to_string(),
            retryable: matches!(status, 408 | 429 | 500..=599),
        }
    }

    fn from_reqwest(err: &reqwest::Error, host: &str, request_id: &str, timeout_ms: u64) -> Self {
        if err.is_timeout() {
            HttpError::Timeout {
                timeout_ms,
                request_id: request_id.to_string(),
            }
        } else if err.is_decode() || err.is_body() {
            HttpError::InvalidResponse {
                reason: err.to_string(),
                request_id: request_id.to_string(),
            }
        } else if err.is_builder() {
            HttpError::InvalidRequest {
                reason: err.to_string(),
            }
        } else {
            HttpError::ConnectionError {
                host: host.to_string(),
                message: err.to_string(),
            }
        }
    }
}

/// A buffered 2xx response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    status: u16,
    body: Bytes,
    request_id: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: Bytes, request_id: String) -> Self {
        Self {
            status,
            body,
            request_id,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

pub type HttpResult = Result<HttpResponse, HttpError>;

pub(crate) fn build_client(timeout: Duration) -> Result<reqwest::Client, HttpError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| HttpError::InvalidRequest {
            reason: format!("failed to build HTTP client: {e}"),
        })
}

/// Issues a GET and buffers the body, enforcing `max_body` and mapping non-2xx to errors.
pub(crate) async fn send_get(
    client: &reqwest::Client,
    url: &Url,
    timeout_ms: u64,
    max_body: usize,
) -> HttpResult {
    let request_id = Uuid::new_v4().to_string();
    let host = url.host_str().unwrap_or_default();
    let start = Instant::now();

    let response = client
        .get(url.clone())
        .header("x-request-id", request_id.as_str())
        .send()
        .await
        .map_err(|e| HttpError::from_reqwest(&e, host, &request_id, timeout_ms))?;

    let status = response.status().as_u16();

    if let Some(len) = response.content_length() {
        let len = usize::try_from(len).unwrap_or(usize::MAX);
        if len > max_body {
            return Err(HttpError::ResponseTooLarge {
                size: len,
                max: max_body,
            });
        }
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| HttpError::from_reqwest(&e, host, &request_id, timeout_ms))?;

    if body.len() > max_body {
        return Err(HttpError::ResponseTooLarge {
            size: body.len(),
            max: max_body,
        });
    }

    let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
    debug!(%status, duration_ms, %request_id, "GET {}", url);

    let response = HttpResponse::new(status, body, request_id);
    if !response.is_success() {
        return Err(HttpError::from_status(
            status,
            response.body(),
            response.request_id(),
        ));
    }
    Ok(response)
}

// ============================================================================
// Wire format
// ============================================================================

#[derive(Deserialize)]
struct ProductListEnvelope {
    #[serde(rename = "Result", alias = "result", default)]
    result: Option<ProductListResult>,
}

#[derive(Deserialize)]
struct ProductListResult {
    #[serde(rename = "ProductList", alias = "productList", default)]
    product_list: Option<ProductPage>,
}

#[derive(Deserialize)]
struct ProductDetailEnvelope {
    #[serde(rename = "Result", alias = "result", default)]
    result: Option<ProductDetail>,
}

/// Parses a listing payload. A missing or null result list is an empty page.
pub fn parse_product_page(body: &[u8], request_id: &str) -> Result<ProductPage, HttpError> {
    let envelope: ProductListEnvelope =
        serde_json::from_slice(body).map_err(|e| HttpError::InvalidResponse {
            reason: format!("failed to parse product list: {e}"),
            request_id: request_id.to_string(),
        })?;
    Ok(envelope
        .result
        .and_then(|r| r.product_list)
        .unwrap_or_default())
}

pub fn parse_product_detail(body: &[u8], request_id: &str) -> Result<ProductDetail, HttpError> {
    let envelope: ProductDetailEnvelope =
        serde_json::from_slice(body).map_err(|e| HttpError::InvalidResponse {
            reason: format!("failed to parse product detail: {e}"),
            request_id: request_id.to_string(),
        })?;
    envelope.result.ok_or_else(|| HttpError::InvalidResponse {
        reason: "product detail response has no result".to_string(),
        request_id: request_id.to_string(),
    })
}

// ============================================================================
// reqwest-backed client
// ============================================================================

/// `CatalogApi` over HTTP: `GET {base}/products?page=N` and `GET {base}/products/{id}`.
#[derive(Clone)]
pub struct HttpCatalogClient {
    client: reqwest::Client,
    base_url: Url,
    timeout_ms: u64,
}

impl HttpCatalogClient {
    pub fn new(config: &CatalogConfig) -> Result<Self, HttpError> {
        let base = ValidatedUrl::with_policy(config.api_base_url.as_str(), config.allow_private_hosts)?;
        let timeout_ms = config.request_timeout_ms.clamp(1, MAX_TIMEOUT_MS);
        Ok(Self {
            client: build_client(Duration::from_millis(timeout_ms))?,
            base_url: base.into_url(),
            timeout_ms,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn products_url(&self, page: u32) -> Result<Url, HttpError> {
        let mut url = self.endpoint(&[PRODUCTS_PATH])?;
        url.query_pairs_mut()
            .append_pair("page", &page.to_string());
        Ok(url)
    }

    pub fn product_details_url(&self, id: ProductId) -> Result<Url, HttpError> {
        self.endpoint(&[PRODUCTS_PATH, &id.to_string()])
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, HttpError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| HttpError::InvalidUrl {
                url: self.base_url.to_string(),
                reason: "base URL cannot have path segments".to_string(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

#[async_trait::async_trait]
impl CatalogApi for HttpCatalogClient {
    #[instrument(skip(self), fields(base = %self.base_url))]
    async fn fetch_products(&self, page: u32) -> Result<ProductPage, HttpError> {
        let url = self.products_url(page)?;
        let response = send_get(&self.client, &url, self.timeout_ms, MAX_RESPONSE_BODY_SIZE)
            .await
            .inspect_err(|e| warn!(error = %e, "product page request failed"))?;
        let products = parse_product_page(response.body(), response.request_id())?;
        debug!(count = products.len(), "product page received");
        Ok(products)
    }

    #[instrument(skip(self), fields(base = %self.base_url))]
    async fn fetch_product_details(&self, id: ProductId) -> Result<ProductDetail, HttpError> {
        let url = self.product_details_url(id)?;
        let response = send_get(&self.client, &url, self.timeout_ms, MAX_RESPONSE_BODY_SIZE)
            .await
            .inspect_err(|e| warn!(error = %e, "product detail request failed"))?;
        parse_product_detail(response.body(), response.request_id())
    }
}
