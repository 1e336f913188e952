//! Hyperpool
//!
//! Connection pooling for HTTP/1.1 clients: bounded per-destination pools, retries and
//! redirects with explicit budgets, timeouts, proxies and TLS verification policy.

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

use http::HeaderMap;

pub mod client;

pub use client::{
    ConnectionPool, Destination, Error, ErrorKind, Fields, ManagerConfig, PoolConfig,
    PoolManager, ProxyManager, RequestOptions, Response, Retry, Scheme, Timeout,
};

/// Boxed error type used for erased error sources.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Create a [`ConnectionPool`] for the host of an absolute URL.
///
/// ```
/// # fn main() -> Result<(), hyperpool::Error> {
/// let pool = hyperpool::connection_from_url("http://localhost:8080/path", Default::default())?;
/// assert_eq!(pool.destination().port(), 8080);
/// # Ok(())
/// # }
/// ```
pub fn connection_from_url(url: &str, config: PoolConfig) -> Result<ConnectionPool, Error> {
    ConnectionPool::from_url(url, config)
}

/// Create a [`ProxyManager`] for the proxy at `url`, with default configuration and no
/// proxy headers.
pub fn proxy_from_url(url: &str) -> Result<ProxyManager, Error> {
    ProxyManager::new(url, HeaderMap::new(), ManagerConfig::default())
}
