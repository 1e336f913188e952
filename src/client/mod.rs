//! HTTP/1.1 client with connection pooling, built on top of [hyper].
//!
//! There are three levels of available APIs in this library:
//!
//! 1. The [`PoolManager`] (and [`ProxyManager`]), which take absolute URLs, keep one pool
//!    per destination and follow redirects across hosts.
//! 2. The [`ConnectionPool`], which serves a single destination. It runs the retry loop,
//!    follows same-host redirects and bounds the number of connections in use.
//! 3. The [connection][self::conn] API, single HTTP/1.1 connections with explicit connect
//!    and close. Pools hand these out as [`PooledConnection`] guards.
//!
//! Timeouts are described by [`Timeout`], retry and redirect behavior by [`Retry`]. Every
//! failure is an [`Error`].

pub mod conn;
mod error;
mod fields;
mod manager;
pub mod pool;
mod proxy;
mod request;
mod response;
mod retry;
mod timeout;

pub use self::conn::tls::{AssertHostname, CertReqs, TlsSettings};
pub use self::conn::transport::TcpConfig;
pub use self::conn::Connection;
pub use self::error::{Error, ErrorKind, TimerError};
pub use self::fields::{FieldValue, Fields};
pub use self::manager::{ManagerConfig, PoolManager};
pub use self::pool::Config as PoolConfig;
pub use self::pool::{ConnectionPool, Destination, PooledConnection, Scheme};
pub use self::proxy::ProxyManager;
pub use self::request::{encodes_url, RequestOptions};
pub use self::response::Response;
pub use self::retry::{default_method_whitelist, Budget, RequestHistory, Retry, RetryCause, BACKOFF_MAX};
pub use self::timeout::Timeout;
