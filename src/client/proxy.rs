//! Requests through an HTTP proxy.
//!
//! Plain `http` URLs are forwarded: the request goes to the proxy in absolute form, over
//! a single pool of proxy connections. `https` URLs are tunneled: each destination gets
//! its own pool whose connections send `CONNECT host:port` to the proxy before TLS.

use bytes::Bytes;
use http::{HeaderMap, Method};
use url::Url;

use super::fields::Fields;
use super::manager::{ManagerConfig, PoolManager, ProxySettings};
use super::pool::{ConnectionPool, Destination, Scheme};
use super::request::RequestOptions;
use super::response::Response;
use super::Error;

/// A [`PoolManager`] which sends every request through one proxy.
#[derive(Debug, Clone)]
pub struct ProxyManager {
    manager: PoolManager,
    proxy: Destination,
}

impl ProxyManager {
    /// Create a manager for the proxy at `proxy_url`.
    ///
    /// `proxy_headers` are sent to the proxy: with forwarded requests, and with the
    /// `CONNECT` request of a tunnel.
    pub fn new(
        proxy_url: &str,
        proxy_headers: HeaderMap,
        config: ManagerConfig,
    ) -> Result<Self, Error> {
        let url = Url::parse(proxy_url)
            .map_err(|error| Error::LocationValue(format!("{proxy_url}: {error}")))?;
        let proxy = Destination::from_url(&url)?;
        if proxy.scheme() != Scheme::Http {
            return Err(Error::Proxy {
                message: format!("unsupported proxy scheme {}", proxy.scheme()),
                source: None,
            });
        }

        let settings = ProxySettings {
            destination: proxy.clone(),
            headers: proxy_headers,
        };

        Ok(Self {
            manager: PoolManager::build(config, Some(settings)),
            proxy,
        })
    }

    /// The proxy all requests go through.
    pub fn proxy(&self) -> &Destination {
        &self.proxy
    }

    /// Number of pools currently kept.
    pub fn len(&self) -> usize {
        self.manager.len()
    }

    /// Whether no pools are kept.
    pub fn is_empty(&self) -> bool {
        self.manager.is_empty()
    }

    /// The pool used for `url`: the shared proxy pool for `http`, a tunneling pool
    /// per destination for `https`.
    pub fn connection_from_url(&self, url: &str) -> Result<ConnectionPool, Error> {
        self.manager.connection_from_url(url)
    }

    /// The pool used for `host`.
    pub fn connection_from_host(
        &self,
        scheme: Scheme,
        host: &str,
        port: Option<u16>,
    ) -> Result<ConnectionPool, Error> {
        self.manager.connection_from_host(scheme, host, port)
    }

    /// Close every pool.
    pub fn clear(&self) {
        self.manager.clear()
    }

    /// Send a request to an absolute URL through the proxy.
    pub async fn urlopen(
        &self,
        method: Method,
        url: &str,
        body: Option<Bytes>,
        options: RequestOptions,
    ) -> Result<Response, Error> {
        self.manager.urlopen(method, url, body, options).await
    }

    /// Send a request with form `fields` to an absolute URL through the proxy.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        fields: Option<&Fields>,
        options: RequestOptions,
    ) -> Result<Response, Error> {
        self.manager.request(method, url, fields, options).await
    }
}
