// HTTP transport seam
//
// Every network request in the pipeline goes through `HttpTransport`. The
// session installs the Edge Proxy as a decorator over the real client, so the
// Transfer Engine and anything else above it issue plain requests.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Method, StatusCode, Url};
use serde::{Deserialize, Serialize};

use super::errors::TransportError;
use crate::config::NetworkConfig;

/// Lazy, non-replayable sequence of body chunks
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Spoofed request headers applied by the proxy layers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpoofHeaders {
    pub user_agent: String,
    pub referer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accept: Option<String>,
}

impl SpoofHeaders {
    /// Overwrite the spoofed headers on `headers`, keeping everything else
    pub fn apply(&self, headers: &mut HeaderMap) {
        set_header(headers, reqwest::header::USER_AGENT, &self.user_agent);
        set_header(headers, reqwest::header::REFERER, &self.referer);
        if let Some(origin) = &self.origin {
            set_header(headers, reqwest::header::ORIGIN, origin);
        }
        if let Some(accept) = &self.accept {
            set_header(headers, reqwest::header::ACCEPT, accept);
        }
    }

    /// Header pairs for engines that take them as options
    pub fn pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("User-Agent".to_string(), self.user_agent.clone()),
            ("Referer".to_string(), self.referer.clone()),
        ];
        if let Some(origin) = &self.origin {
            pairs.push(("Origin".to_string(), origin.clone()));
        }
        if let Some(accept) = &self.accept {
            pairs.push(("Accept".to_string(), accept.clone()));
        }
        pairs
    }
}

fn set_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    // Values come from config; an unencodable one is skipped rather than sent mangled
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

/// Outgoing request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
}

impl HttpRequest {
    pub fn get(url: &str) -> Result<Self, TransportError> {
        let url = Url::parse(url).map_err(|e| TransportError::InvalidUrl(format!("{}: {}", url, e)))?;
        Ok(Self {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
        })
    }

    pub fn with_headers(mut self, spoof: &SpoofHeaders) -> Self {
        spoof.apply(&mut self.headers);
        self
    }

    /// Drop ambient credentials: no cookies, no authorization
    pub fn omit_credentials(mut self) -> Self {
        self.headers.remove(reqwest::header::COOKIE);
        self.headers.remove(reqwest::header::AUTHORIZATION);
        self
    }

    pub fn host(&self) -> Option<&str> {
        self.url.host_str()
    }
}

/// Response with a streaming body
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

impl HttpResponse {
    /// Response whose whole body is already in memory
    pub fn from_bytes(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body: stream::once(async move { Ok(body) }).boxed(),
        }
    }

    /// Response built from pre-split chunks
    pub fn from_chunks(status: StatusCode, headers: HeaderMap, chunks: Vec<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: stream::iter(chunks.into_iter().map(Ok)).boxed(),
        }
    }

    /// Synthetic JSON error response (`{"error": ..., "details": ...}`)
    pub fn json_error(status: StatusCode, error: &str, details: &str) -> Self {
        let body = serde_json::json!({ "error": error, "details": details }).to_string();
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        Self::from_bytes(status, headers, Bytes::from(body))
    }

    /// Declared `Content-Length`, if any
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }

    /// Declared `Content-Type`, if any
    pub fn content_type(&self) -> Option<String> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }

    /// Drain the body into one buffer
    pub async fn bytes(mut self) -> Result<Bytes, TransportError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Network boundary used by every component
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// `HttpTransport` over a shared reqwest client
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &NetworkConfig) -> Result<Self, TransportError> {
        // No cookie store: requests never carry ambient credentials. No overall
        // timeout either, media bodies may stream for a long time.
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_seconds));

        if let Some(proxy_url) = config.proxy.as_deref() {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| TransportError::Request(format!("invalid proxy {}: {}", proxy_url, e)))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let response = self
            .client
            .request(request.method, request.url)
            .headers(request.headers)
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(TransportError::from))
            .boxed();

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
