//! # OffKit Net
//!
//! HTTP asset fetching for the OffKit offline cache worker.
//!
//! ## Design Goals
//!
//! 1. **Async HTTP**: Non-blocking asset requests
//! 2. **Full buffering**: Static assets are small and always read whole
//! 3. **Pass-through responses**: Status, headers, and body surface unmodified

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info, trace};
use url::Url;

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid method: {0}")]
    InvalidMethod(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Create a request from a method name.
    pub fn from_method(method: &str, url: Url) -> Result<Self, NetError> {
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| NetError::InvalidMethod(method.to_string()))?;

        Ok(Self {
            id: RequestId::new(),
            url,
            method,
            headers: HeaderMap::new(),
            body: None,
        })
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Add a header from string parts. Invalid names or values are skipped.
    pub fn header_str(mut self, name: &str, value: &str) -> Self {
        if let (Ok(n), Ok(v)) = (
            HeaderName::try_from(name),
            HeaderValue::try_from(value),
        ) {
            self.headers.insert(n, v);
        }
        self
    }

    /// Set the request body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// HTTP response, fully buffered.
#[derive(Debug, Clone)]
pub struct NetResponse {
    pub request_id: RequestId,
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl NetResponse {
    /// Check if the request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }
}

/// Asset loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Accept-Language header.
    pub accept_language: String,
    /// Client timeout.
    pub timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: "OffKit/0.1".to_string(),
            accept_language: "en-US,en;q=0.9".to_string(),
            timeout: Duration::from_secs(30),
            max_redirects: 10,
        }
    }
}

/// Asset loader for fetching URLs.
pub struct AssetLoader {
    client: Client,
    config: LoaderConfig,
}

impl AssetLoader {
    /// Create a new asset loader.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!("AssetLoader initialized");

        Ok(Self { client, config })
    }

    /// Fetch a URL.
    ///
    /// A non-2xx status is a response, not an error. Errors are transport
    /// failures only.
    pub async fn fetch(&self, request: Request) -> Result<NetResponse, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching asset");

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            req_builder = req_builder.header(name, value);
        }

        req_builder = req_builder.header("Accept-Language", self.config.accept_language.as_str());

        if let Some(body) = request.body {
            req_builder = req_builder.body(body);
        }

        let response = req_builder.send().await?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await?;

        trace!(
            url = %url,
            status = %status,
            body_len = body.len(),
            "Response received"
        );

        Ok(NetResponse {
            request_id: request.id,
            url,
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    #[test]
    fn test_request_builder() {
        let url = Url::parse("https://example.com/style.css").unwrap();
        let request = Request::get(url.clone())
            .header(
                HeaderName::from_static("accept"),
                HeaderValue::from_static("text/css"),
            )
            .with_body(b"x=1".to_vec());

        assert_eq!(request.url, url);
        assert_eq!(request.method, Method::GET);
        assert!(request.headers.contains_key("accept"));
        assert_eq!(request.body.as_deref(), Some(b"x=1".as_slice()));
    }

    #[test]
    fn test_request_from_method() {
        let url = Url::parse("https://example.com/").unwrap();

        let request = Request::from_method("POST", url.clone()).unwrap();
        assert_eq!(request.method, Method::POST);

        assert!(matches!(
            Request::from_method("NOT A METHOD", url),
            Err(NetError::InvalidMethod(_))
        ));
    }

    #[test]
    fn test_request_header_str_skips_invalid() {
        let url = Url::parse("https://example.com/").unwrap();
        let request = Request::get(url)
            .header_str("x-custom", "1")
            .header_str("bad header", "value");

        assert!(request.headers.contains_key("x-custom"));
        assert_eq!(request.headers.len(), 1);
    }

    #[test]
    fn test_request_id_uniqueness() {
        let id1 = RequestId::new();
        let id2 = RequestId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_loader_config_default() {
        let config = LoaderConfig::default();
        assert_eq!(config.user_agent, "OffKit/0.1");
        assert_eq!(config.timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_fetch_success() {
        init_tracing();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/statics/style.css"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/css")
                    .set_body_bytes(b"body { margin: 0; }".to_vec()),
            )
            .mount(&server)
            .await;

        let loader = AssetLoader::new(LoaderConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/statics/style.css", server.uri())).unwrap();
        let response = loader.fetch(Request::get(url)).await.unwrap();

        assert!(response.ok());
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body.as_ref(), b"body { margin: 0; }");
        assert_eq!(
            response.headers.get("content-type").unwrap(),
            "text/css"
        );
    }

    #[tokio::test]
    async fn test_fetch_non_2xx_is_a_response() {
        init_tracing();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing.png"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let loader = AssetLoader::new(LoaderConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/missing.png", server.uri())).unwrap();
        let response = loader.fetch(Request::get(url)).await.unwrap();

        assert!(!response.ok());
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_fetch_connection_refused() {
        init_tracing();
        // Grab a port that stops listening once the server drops
        let server = MockServer::start().await;
        let uri = server.uri();
        drop(server);

        let loader = AssetLoader::new(LoaderConfig::default()).unwrap();
        let url = Url::parse(&format!("{uri}/")).unwrap();
        let result = loader.fetch(Request::get(url)).await;

        assert!(matches!(result, Err(NetError::HttpError(_))));
    }
}
