//! Pool registry keyed by destination.
//!
//! A [`PoolManager`] creates one [`ConnectionPool`] per [`Destination`] on demand, and
//! keeps at most `num_pools` of them, closing the least recently used pool when a new one
//! would exceed that bound. Requests take absolute URLs; redirects are followed across
//! hosts by switching pools.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, COOKIE, HOST};
use http::{HeaderMap, Method, StatusCode};
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, trace};
use url::Url;

use super::conn::{ProxyTunnel, TlsMode};
use super::fields::Fields;
use super::pool::{request_uri, Config as PoolConfig, ConnectionPool, Destination, Scheme, Via};
use super::request::{encode_fields, RequestOptions};
use super::response::Response;
use super::retry::RetryCause;
use super::Error;

/// Headers removed from a redirected request when the host changes.
const CROSS_HOST_STRIPPED: [HeaderName; 2] = [AUTHORIZATION, COOKIE];

/// Configuration for a [`PoolManager`].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ManagerConfig {
    /// Number of pools kept before the least recently used one is closed.
    pub num_pools: usize,

    /// Follow `301` and `302` redirects of a `POST` with a `GET`.
    pub post_redirect_as_get: bool,

    /// Configuration for every pool the manager creates.
    pub pool: PoolConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            num_pools: 10,
            post_redirect_as_get: false,
            pool: PoolConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// Set the number of pools.
    pub fn with_num_pools(mut self, num_pools: usize) -> Self {
        self.num_pools = num_pools;
        self
    }

    /// Set whether `POST` redirects become `GET`.
    pub fn with_post_redirect_as_get(mut self, enabled: bool) -> Self {
        self.post_redirect_as_get = enabled;
        self
    }

    /// Set the pool configuration.
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }
}

/// Where a proxying manager sends requests.
#[derive(Debug, Clone)]
pub(crate) struct ProxySettings {
    pub(crate) destination: Destination,
    pub(crate) headers: HeaderMap,
}

/// How a URL is reached: the pool for it, and the request target to send.
struct Route {
    pool: ConnectionPool,
    target: String,
}

struct ManagerInner {
    config: ManagerConfig,
    proxy: Option<ProxySettings>,
    /// Shared by every `https` pool.
    https: TlsMode,
    pools: Mutex<IndexMap<Destination, ConnectionPool>>,
}

/// Routes requests for any host to a connection pool for that host.
///
/// Cloning a manager is cheap, and clones share pools.
#[derive(Clone)]
pub struct PoolManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolManager")
            .field("num_pools", &self.inner.config.num_pools)
            .field("pools", &self.len())
            .finish()
    }
}

impl Default for PoolManager {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

impl PoolManager {
    /// Create a manager.
    pub fn new(config: ManagerConfig) -> Self {
        Self::build(config, None)
    }

    pub(crate) fn build(config: ManagerConfig, proxy: Option<ProxySettings>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                https: TlsMode::https(&config.pool.tls),
                config,
                proxy,
                pools: Mutex::new(IndexMap::new()),
            }),
        }
    }

    /// The manager configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Number of pools currently kept.
    pub fn len(&self) -> usize {
        self.inner.pools.lock().len()
    }

    /// Whether no pools are kept.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The pool for `destination`, creating it if needed.
    fn pool_for(&self, destination: Destination, via: impl FnOnce() -> Via) -> ConnectionPool {
        if let Some(pool) = touch(&mut self.inner.pools.lock(), &destination) {
            return pool;
        }

        let tls = match destination.scheme() {
            Scheme::Http => TlsMode::Plain,
            Scheme::Https => self.inner.https.clone(),
        };
        let pool = ConnectionPool::with_tls(
            destination.clone(),
            self.inner.config.pool.clone(),
            via(),
            tls,
        );

        let mut pools = self.inner.pools.lock();
        if let Some(pool) = touch(&mut pools, &destination) {
            trace!(%destination, "pool created concurrently");
            return pool;
        }

        debug!(%destination, "new pool");
        pools.insert(destination, pool.clone());

        while pools.len() > self.inner.config.num_pools.max(1) {
            if let Some((evicted, pool)) = pools.shift_remove_index(0) {
                debug!(destination = %evicted, "evicting least recently used pool");
                pool.close();
            }
        }
        pool
    }

    fn route(&self, url: &Url) -> Result<Route, Error> {
        let destination = Destination::from_url(url)?;

        let Some(proxy) = &self.inner.proxy else {
            let pool = self.pool_for(destination, || Via::Direct);
            return Ok(Route {
                pool,
                target: request_uri(url),
            });
        };

        match destination.scheme() {
            Scheme::Http => Ok(Route {
                pool: self.pool_for(proxy.destination.clone(), || Via::Forward),
                target: url.to_string(),
            }),
            Scheme::Https => {
                let tunnel = ProxyTunnel {
                    proxy: proxy.destination.clone(),
                    headers: proxy.headers.clone(),
                };
                Ok(Route {
                    pool: self.pool_for(destination, move || Via::Tunnel(tunnel)),
                    target: request_uri(url),
                })
            }
        }
    }

    /// The pool serving `url`.
    ///
    /// Fails with [`Error::LocationValue`] when `url` has no usable scheme or host.
    pub fn connection_from_url(&self, url: &str) -> Result<ConnectionPool, Error> {
        let url = parse_url(url)?;
        Ok(self.route(&url)?.pool)
    }

    /// The pool serving `host`. The port defaults to the scheme's default port.
    pub fn connection_from_host(
        &self,
        scheme: Scheme,
        host: &str,
        port: Option<u16>,
    ) -> Result<ConnectionPool, Error> {
        let destination = Destination::new(scheme, host, port)?;
        self.connection_from_url(&destination.to_string())
    }

    /// Close every pool and forget them.
    pub fn clear(&self) {
        let pools = std::mem::take(&mut *self.inner.pools.lock());
        for (_, pool) in pools {
            pool.close();
        }
    }

    /// Headers for a request forwarded through the proxy.
    fn forwarding_headers(&self, url: &Url, headers: Option<HeaderMap>) -> Result<HeaderMap, Error> {
        let mut headers = headers.unwrap_or_else(|| self.inner.config.pool.headers.clone());
        if let Some(proxy) = &self.inner.proxy {
            for (name, value) in &proxy.headers {
                headers.insert(name.clone(), value.clone());
            }
        }
        if !headers.contains_key(ACCEPT) {
            headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        }
        if !headers.contains_key(HOST) {
            let host = Destination::from_url(url)?.host_header();
            let host = HeaderValue::from_str(&host)
                .map_err(|error| Error::LocationValue(error.to_string()))?;
            headers.insert(HOST, host);
        }
        Ok(headers)
    }

    /// Send a request to an absolute URL, following redirects across hosts.
    #[cfg_attr(not(tarpaulin), tracing::instrument(skip_all, fields(%method, url), level = "debug"))]
    pub async fn urlopen(
        &self,
        method: Method,
        url: &str,
        body: Option<Bytes>,
        options: RequestOptions,
    ) -> Result<Response, Error> {
        let mut url = parse_url(url)?;
        let mut method = method;
        let mut body = body;
        let mut retries = options
            .retries
            .clone()
            .unwrap_or_else(|| self.inner.config.pool.retries.clone());
        let mut headers = options.headers.clone();

        loop {
            let route = self.route(&url)?;

            let mut attempt = options.clone();
            attempt.redirect = false;
            attempt.assert_same_host = false;
            attempt.retries = Some(retries.clone());
            attempt.headers = if route.target.starts_with('/') {
                headers.clone()
            } else {
                Some(self.forwarding_headers(&url, headers.clone())?)
            };

            let mut response = route
                .pool
                .urlopen(method.clone(), &route.target, body.clone(), attempt)
                .await?;

            if let Some(after) = response.retries() {
                retries = after.clone();
            }

            let location = match response.redirect_location() {
                Some(location) if options.redirect && retries.follows_redirects() => location,
                _ => return Ok(response),
            };

            let status = response.status();
            let redirected = url
                .join(&location)
                .map_err(|error| Error::LocationValue(format!("{location}: {error}")))?;

            let as_get = status == StatusCode::SEE_OTHER
                || (self.inner.config.post_redirect_as_get
                    && method == Method::POST
                    && matches!(status, StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND));
            if as_get {
                method = Method::GET;
                body = None;
            }

            match retries.increment(
                &method,
                url.as_str(),
                RetryCause::Redirect {
                    status,
                    location: location.clone(),
                },
            ) {
                Ok(next) => retries = next,
                Err(error) if retries.raise_on_redirect => return Err(error),
                Err(_) => return Ok(response.with_retries(retries)),
            }

            if let Err(error) = response.drain().await {
                trace!(%error, "failed to drain redirect response");
            }

            if Destination::from_url(&redirected)? != Destination::from_url(&url)? {
                if let Some(headers) = headers.as_mut() {
                    for name in &CROSS_HOST_STRIPPED {
                        headers.remove(name);
                    }
                }
            }

            debug!("Redirecting {} -> {}", url, redirected);
            url = redirected;
        }
    }

    /// Send a request with form `fields` to an absolute URL.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        fields: Option<&Fields>,
        options: RequestOptions,
    ) -> Result<Response, Error> {
        let (url, body, options) =
            encode_fields(&method, url, fields, options, &self.inner.config.pool.headers);
        self.urlopen(method, &url, body, options).await
    }
}

/// Mark the pool for `destination` as most recently used, and return it.
fn touch(
    pools: &mut IndexMap<Destination, ConnectionPool>,
    destination: &Destination,
) -> Option<ConnectionPool> {
    let index = pools.get_index_of(destination)?;
    let last = pools.len() - 1;
    pools.move_index(index, last);
    trace!(%destination, "reusing pool");
    Some(pools[last].clone())
}

fn parse_url(url: &str) -> Result<Url, Error> {
    Url::parse(url).map_err(|error| Error::LocationValue(format!("{url}: {error}")))
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(PoolManager: Send, Sync, Clone);

    #[test]
    fn same_destination_same_pool() {
        let manager = PoolManager::default();

        let a = manager.connection_from_url("http://localhost:8081/foo").unwrap();
        let b = manager.connection_from_url("http://LOCALHOST:8081/bar?baz").unwrap();
        assert_eq!(a, b);

        let c = manager.connection_from_url("http://localhost/").unwrap();
        let d = manager.connection_from_url("http://localhost:80/").unwrap();
        assert_eq!(c, d);
        assert_ne!(a, c);

        let e = manager
            .connection_from_host(Scheme::Http, "localhost", Some(8081))
            .unwrap();
        assert_eq!(a, e);
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn evicts_least_recently_used() {
        let manager = PoolManager::new(ManagerConfig::default().with_num_pools(2));

        let first = manager.connection_from_url("http://a.example/").unwrap();
        let second = manager.connection_from_url("http://b.example/").unwrap();

        // touch the first so the second is evicted
        assert_eq!(manager.connection_from_url("http://a.example/").unwrap(), first);
        manager.connection_from_url("http://c.example/").unwrap();

        assert_eq!(manager.len(), 2);
        assert!(second.is_closed());
        assert!(!first.is_closed());
        assert_ne!(manager.connection_from_url("http://b.example/").unwrap(), second);
        assert!(first.is_closed());
    }

    #[test]
    fn bad_urls() {
        let manager = PoolManager::default();
        assert!(matches!(
            manager.connection_from_url("http://"),
            Err(Error::LocationValue(_))
        ));
        assert!(matches!(
            manager.connection_from_url("no-scheme"),
            Err(Error::LocationValue(_))
        ));
        assert!(matches!(
            manager.connection_from_url("ftp://example.com/"),
            Err(Error::LocationValue(_))
        ));
    }

    #[cfg(feature = "tls")]
    #[test]
    fn https_pools_share_tls_setup() {
        let manager = PoolManager::default();
        let a = manager.connection_from_url("https://a.example/").unwrap();
        let b = manager.connection_from_url("https://b.example:8443/").unwrap();
        assert_ne!(a, b);

        match (a.tls(), b.tls()) {
            (TlsMode::Tls(a), TlsMode::Tls(b)) => assert!(a.shares_config(b)),
            (TlsMode::Unavailable(a), TlsMode::Unavailable(b)) => assert_eq!(a, b),
            other => panic!("unexpected TLS modes: {other:?}"),
        }

        let plain = manager.connection_from_url("http://a.example/").unwrap();
        assert!(matches!(plain.tls(), TlsMode::Plain));
    }

    #[tokio::test]
    async fn clear_closes_pools() {
        let manager = PoolManager::default();
        let pool = manager.connection_from_url("http://localhost:8081/").unwrap();
        manager.clear();

        assert!(manager.is_empty());
        assert!(pool.is_closed());
        assert!(matches!(pool.get_conn(None).await, Err(Error::ClosedPool)));
    }
}
