// Edge Proxy - transport decorator for restricted domains
//
// GET requests to a restricted host are reissued through the primary mirror
// with spoofed headers, then once through the secondary mirror. Failures come
// back as a synthetic HTTP 500 response, never as an error.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use tracing::{debug, warn};

use super::{DomainList, ProxyEndpoint};
use crate::config::ProxyConfig;
use crate::downloader::errors::TransportError;
use crate::downloader::http::{HttpRequest, HttpResponse, HttpTransport, SpoofHeaders};

pub struct EdgeProxy {
    inner: Arc<dyn HttpTransport>,
    restricted: DomainList,
    primary: ProxyEndpoint,
    secondary: ProxyEndpoint,
    headers: SpoofHeaders,
    proxy_hosts: Vec<String>,
}

impl EdgeProxy {
    pub fn new(
        inner: Arc<dyn HttpTransport>,
        restricted: DomainList,
        primary: ProxyEndpoint,
        secondary: ProxyEndpoint,
        headers: SpoofHeaders,
    ) -> Self {
        let proxy_hosts = [primary.host(), secondary.host()]
            .into_iter()
            .flatten()
            .collect();
        Self {
            inner,
            restricted,
            primary,
            secondary,
            headers,
            proxy_hosts,
        }
    }

    pub fn from_config(config: &ProxyConfig, inner: Arc<dyn HttpTransport>) -> Self {
        Self::new(
            inner,
            DomainList::new(config.restricted_domains.iter().cloned()),
            ProxyEndpoint::new(config.primary.clone()),
            ProxyEndpoint::new(config.secondary.clone()),
            config.edge_headers.clone(),
        )
    }

    /// Whether `request` is rewritten instead of passed through
    pub fn intercepts(&self, request: &HttpRequest) -> bool {
        if request.method != Method::GET {
            return false;
        }
        let Some(host) = request.host() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        // Already a proxy request
        if self.proxy_hosts.iter().any(|p| *p == host) {
            return false;
        }
        self.restricted.matches_host(&host)
    }

    fn proxied(&self, request: &HttpRequest, endpoint: &ProxyEndpoint) -> Result<HttpRequest, TransportError> {
        let mut proxied = HttpRequest::get(&endpoint.rewrite(request.url.as_str()))?;
        proxied.headers = request.headers.clone();
        self.headers.apply(&mut proxied.headers);
        Ok(proxied.omit_credentials())
    }

    async fn forward(&self, request: &HttpRequest, endpoint: &ProxyEndpoint) -> Result<HttpResponse, TransportError> {
        let proxied = self.proxied(request, endpoint)?;
        debug!(target_url = %request.url, proxy = endpoint.base(), "Edge proxy forwarding");
        self.inner.send(proxied).await
    }
}

#[async_trait]
impl HttpTransport for EdgeProxy {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        if !self.intercepts(&request) {
            return self.inner.send(request).await;
        }

        match self.forward(&request, &self.primary).await {
            Ok(response) if response.status.is_success() => return Ok(response),
            Ok(response) => {
                warn!(url = %request.url, status = %response.status, "Primary proxy refused, trying secondary");
            }
            Err(e) => {
                warn!(url = %request.url, error = %e, "Primary proxy failed, trying secondary");
            }
        }

        match self.forward(&request, &self.secondary).await {
            Ok(response) => Ok(response),
            Err(e) => {
                warn!(url = %request.url, error = %e, "Secondary proxy failed");
                Ok(HttpResponse::json_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to proxy request",
                    &e.to_string(),
                ))
            }
        }
    }
}
