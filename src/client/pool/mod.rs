//! Connection Pooling for Clients
//!
//! A [`ConnectionPool`] serves one [`Destination`]. It holds up to `maxsize` connection
//! slots in a LIFO queue; each slot is an idle connection or a placeholder for one which
//! has not been created yet. Connections are created lazily when a placeholder is
//! checked out, and returned to the queue when the [`PooledConnection`] guard is dropped.
//!
//! When the queue is empty, a blocking pool waits up to the pool timeout for a slot to be
//! returned and then fails with [`Error::EmptyPool`]. A non-blocking pool creates a new
//! connection instead, and discards connections returned to a full queue. Pool
//! configuration happens in the [`Config`] type.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderValue, HOST};
use http::{HeaderMap, Method, StatusCode};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};
use url::Url;

mod key;
mod slots;

pub use self::key::{Destination, Scheme};
use self::slots::Slots;

use super::conn::tls::TlsSettings;
use super::conn::transport::{TcpConfig, TcpTransport};
use super::conn::{Connection, Connector, ProxyTunnel, RequestBody, TlsMode};
use super::error::ErrorKind;
use super::fields::Fields;
use super::request::{encode_fields, RequestOptions};
use super::response::Response;
use super::retry::{Retry, RetryCause};
use super::timeout::Timeout;
use super::Error;

/// Configuration for a connection pool.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    /// Number of connection slots kept in the pool.
    pub maxsize: usize,

    /// Wait for a slot when the pool is exhausted, instead of creating a new connection.
    pub block: bool,

    /// Upper bound on connections checked out at once from a non-blocking pool. `None`
    /// leaves non-blocking pools unbounded.
    pub max_connections: Option<usize>,

    /// Connections idle for longer than this reconnect before use.
    pub idle_timeout: Option<Duration>,

    /// Default timeout for requests.
    pub timeout: Timeout,

    /// Default retry policy for requests.
    pub retries: Retry,

    /// Headers sent with every request which does not bring its own.
    pub headers: HeaderMap,

    /// TLS verification for `https` pools.
    pub tls: TlsSettings,

    /// Socket options.
    pub tcp: TcpConfig,

    /// HTTP/1.1 protocol options.
    pub http1: hyper::client::conn::http1::Builder,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            maxsize: 1,
            block: false,
            max_connections: None,
            idle_timeout: None,
            timeout: Timeout::default(),
            retries: Retry::default(),
            headers: HeaderMap::new(),
            tls: TlsSettings::default(),
            tcp: TcpConfig::default(),
            http1: hyper::client::conn::http1::Builder::new(),
        }
    }
}

impl Config {
    /// Set the number of slots.
    pub fn with_maxsize(mut self, maxsize: usize) -> Self {
        self.maxsize = maxsize;
        self
    }

    /// Set blocking behavior.
    pub fn with_block(mut self, block: bool) -> Self {
        self.block = block;
        self
    }

    /// Cap connections checked out from a non-blocking pool.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    /// Set the idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Set the default timeout.
    pub fn with_timeout(mut self, timeout: impl Into<Timeout>) -> Self {
        self.timeout = timeout.into();
        self
    }

    /// Set the default retry policy.
    pub fn with_retries(mut self, retries: impl Into<Retry>) -> Self {
        self.retries = retries.into();
        self
    }

    /// Set the default headers.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Set the TLS settings.
    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.tls = tls;
        self
    }

    /// Set the socket options.
    pub fn with_tcp(mut self, tcp: TcpConfig) -> Self {
        self.tcp = tcp;
        self
    }
}

/// How a pool reaches its destination through a proxy.
#[derive(Debug, Clone)]
pub(crate) enum Via {
    Direct,
    /// Plain HTTP forwarded through the proxy which is this pool's destination.
    Forward,
    /// `CONNECT` tunnels through the proxy.
    Tunnel(ProxyTunnel),
}

struct PoolState {
    /// `None` once the pool is closed.
    slots: Option<Slots>,
    checked_out: usize,
}

struct PoolInner {
    connector: Arc<Connector>,
    config: Config,
    /// Connections go through a proxy.
    proxied: bool,
    /// Requests are forwarded by the proxy in absolute form.
    forwarding: bool,
    state: Mutex<PoolState>,
    available: Notify,
    num_connections: AtomicUsize,
    num_requests: AtomicUsize,
}

impl PoolInner {
    /// Return a slot to the queue, waking one waiter.
    fn put(&self, slot: Option<Connection>) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.checked_out = state.checked_out.saturating_sub(1);

        let Some(slots) = state.slots.as_mut() else {
            drop(state);
            if let Some(mut conn) = slot {
                trace!("pool closed, closing returned connection");
                conn.close();
            }
            return Err(Error::ClosedPool);
        };

        let slot = slot.map(|mut conn| {
            if conn.is_in_flight() {
                debug!(
                    host = %self.connector.destination.host(),
                    "Closing connection returned with a request in flight"
                );
                conn.reset();
            } else if conn.is_dropped() {
                conn.reset();
            }
            conn
        });

        if let Err(Some(mut conn)) = slots.push(slot) {
            warn!(
                host = %self.connector.destination.host(),
                "Connection pool is full, discarding connection"
            );
            conn.close();
        }
        drop(state);

        self.available.notify_one();
        Ok(())
    }
}

/// A pool of connections to one [`Destination`].
///
/// Cloning a pool is cheap, and clones share connections. Two pools compare equal when
/// they are clones of each other.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("destination", &self.inner.connector.destination)
            .field("maxsize", &self.inner.config.maxsize)
            .field("block", &self.inner.config.block)
            .finish()
    }
}

impl PartialEq for ConnectionPool {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for ConnectionPool {}

impl ConnectionPool {
    /// Create a pool for `destination`.
    pub fn new(destination: Destination, config: Config) -> Self {
        Self::with_via(destination, config, Via::Direct)
    }

    /// Create a pool for the host of an absolute URL.
    pub fn from_url(url: &str, config: Config) -> Result<Self, Error> {
        Ok(Self::new(url.parse()?, config))
    }

    pub(crate) fn with_via(destination: Destination, config: Config, via: Via) -> Self {
        let tls = TlsMode::for_destination(&destination, &config.tls);
        Self::with_tls(destination, config, via, tls)
    }

    pub(crate) fn with_tls(destination: Destination, config: Config, via: Via, tls: TlsMode) -> Self {
        let forwarding = matches!(via, Via::Forward);
        let (tunnel, proxied) = match via {
            Via::Direct => (None, false),
            Via::Forward => (None, true),
            Via::Tunnel(tunnel) => (Some(tunnel), true),
        };

        let connector = Connector {
            destination,
            transport: TcpTransport::new(config.tcp.clone()),
            tls,
            tunnel,
            http1: config.http1.clone(),
        };

        let state = PoolState {
            slots: Some(Slots::with_placeholders(config.maxsize)),
            checked_out: 0,
        };

        Self {
            inner: Arc::new(PoolInner {
                connector: Arc::new(connector),
                config,
                proxied,
                forwarding,
                state: Mutex::new(state),
                available: Notify::new(),
                num_connections: AtomicUsize::new(0),
                num_requests: AtomicUsize::new(0),
            }),
        }
    }

    /// The destination served by this pool.
    pub fn destination(&self) -> &Destination {
        &self.inner.connector.destination
    }

    #[cfg(test)]
    pub(crate) fn tls(&self) -> &TlsMode {
        &self.inner.connector.tls
    }

    /// The pool configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Connections created so far.
    pub fn num_connections(&self) -> usize {
        self.inner.num_connections.load(Ordering::SeqCst)
    }

    /// Requests sent so far.
    pub fn num_requests(&self) -> usize {
        self.inner.num_requests.load(Ordering::SeqCst)
    }

    /// Slots in the queue: idle connections plus placeholders.
    pub fn available(&self) -> usize {
        self.inner
            .state
            .lock()
            .slots
            .as_ref()
            .map_or(0, |slots| slots.len())
    }

    /// Connections currently checked out.
    pub fn checked_out(&self) -> usize {
        self.inner.state.lock().checked_out
    }

    /// Whether the pool has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().slots.is_none()
    }

    /// Whether `url` is served by this pool. Relative URLs always are.
    pub fn is_same_host(&self, url: &str) -> bool {
        if url.starts_with('/') {
            return true;
        }
        url.parse::<Destination>()
            .map_or(false, |destination| &destination == self.destination())
    }

    /// Create a connection for this pool.
    ///
    /// Fails with [`Error::Ssl`] when the pool needs TLS but it is not available.
    pub fn new_conn(&self) -> Result<Connection, Error> {
        if let Some(error) = self.inner.connector.unavailable() {
            return Err(error);
        }
        let n = self.inner.num_connections.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            "Starting new {} connection ({}): {}",
            self.destination().scheme(),
            n,
            self.destination().host()
        );
        Ok(Connection::new(self.inner.connector.clone()))
    }

    fn checkout(&self, slot: Option<Connection>) -> Result<PooledConnection, Error> {
        let conn = match slot {
            Some(mut conn) => {
                if conn.is_dropped() {
                    debug!(host = %self.destination().host(), "Resetting dropped connection");
                    conn.reset();
                }
                conn
            }
            None => match self.new_conn() {
                Ok(conn) => conn,
                Err(error) => {
                    // The slot was taken for this checkout; give it back.
                    let _ = self.inner.put(None);
                    return Err(error);
                }
            },
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::downgrade(&self.inner),
        })
    }

    /// Check a connection out of the pool.
    ///
    /// With `block` set, waits up to `pool_timeout` (forever when `None`) for a slot and
    /// fails with [`Error::EmptyPool`] when none is returned in time.
    #[cfg_attr(not(tarpaulin), tracing::instrument(skip_all, fields(destination = %self.destination()), level = "debug"))]
    pub async fn get_conn(&self, pool_timeout: Option<Duration>) -> Result<PooledConnection, Error> {
        let deadline = pool_timeout.map(|timeout| tokio::time::Instant::now() + timeout);

        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                let checked_out = state.checked_out;
                let Some(slots) = state.slots.as_mut() else {
                    return Err(Error::ClosedPool);
                };

                match slots.pop(self.inner.config.idle_timeout) {
                    Some(slot) => {
                        state.checked_out += 1;
                        drop(state);
                        trace!("slot taken from pool");
                        return self.checkout(slot);
                    }
                    None if !self.inner.config.block => {
                        if let Some(max) = self.inner.config.max_connections {
                            if checked_out >= max {
                                return Err(Error::EmptyPool);
                            }
                        }
                        state.checked_out += 1;
                        drop(state);
                        trace!("pool empty, creating an extra connection");
                        return self.checkout(None);
                    }
                    None => trace!("pool empty, waiting for a connection"),
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(Error::EmptyPool);
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Return a connection to the pool.
    ///
    /// Fails with [`Error::ClosedPool`] when the pool has been closed; the connection is
    /// closed in that case. Dropping the [`PooledConnection`] has the same effect.
    pub fn put_conn(&self, mut conn: PooledConnection) -> Result<(), Error> {
        let slot = conn.conn.take();
        conn.pool = Weak::new();
        self.inner.put(slot)
    }

    /// Close every idle connection and reject further use of the pool.
    pub fn close(&self) {
        let slots = self.inner.state.lock().slots.take();
        if let Some(mut slots) = slots {
            for mut conn in slots.drain() {
                conn.close();
            }
            debug!(destination = %self.destination(), "pool closed");
        }
        self.inner.available.notify_waiters();
    }

    /// Send `request` over `conn`, connecting it first if needed.
    ///
    /// `timeout` should be fresh: its clock is started here.
    pub async fn make_request(
        &self,
        conn: &mut PooledConnection,
        request: http::Request<RequestBody>,
        timeout: &mut Timeout,
    ) -> Result<http::Response<hyper::body::Incoming>, Error> {
        self.inner.num_requests.fetch_add(1, Ordering::SeqCst);
        if timeout.start_connect().is_err() {
            trace!("timeout clock already running");
        }

        if !conn.is_connected() {
            conn.connect(timeout.connect_timeout()).await?;
        }

        let method = request.method().clone();
        let uri = request.uri().clone();
        let response = conn.send(request, timeout.read_timeout()).await?;
        debug!(
            "\"{} {} {:?}\" {}",
            method,
            uri,
            response.version(),
            response.status().as_u16()
        );
        Ok(response)
    }

    fn build_request(
        &self,
        method: &Method,
        url: &str,
        body: Option<Bytes>,
        headers: &HeaderMap,
    ) -> Result<http::Request<RequestBody>, Error> {
        let target = if !self.inner.forwarding && !url.starts_with('/') {
            // Same-host absolute URLs are sent in origin form.
            Url::parse(url)
                .map(|url| request_uri(&url))
                .map_err(|error| Error::LocationValue(format!("{url}: {error}")))?
        } else {
            url.to_owned()
        };

        let mut request = http::Request::builder()
            .method(method.clone())
            .uri(target)
            .body(RequestBody::new(body.unwrap_or_default()))?;

        *request.headers_mut() = headers.clone();
        if !request.headers().contains_key(HOST) {
            let host = HeaderValue::from_str(&self.destination().host_header())
                .map_err(|error| Error::LocationValue(error.to_string()))?;
            request.headers_mut().insert(HOST, host);
        }
        Ok(request)
    }

    async fn attempt(
        &self,
        method: &Method,
        url: &str,
        body: Option<Bytes>,
        options: &RequestOptions,
        release_conn: bool,
    ) -> Result<Response, Error> {
        let mut timeout = options.timeout.unwrap_or(self.inner.config.timeout).fresh();
        let headers = options.headers.as_ref().unwrap_or(&self.inner.config.headers);
        let request = self.build_request(method, url, body, headers)?;

        let mut conn = self.get_conn(options.pool_timeout).await?;
        let response = match self.make_request(&mut conn, request, &mut timeout).await {
            Ok(response) => response,
            Err(error) => {
                conn.discard();
                return Err(error);
            }
        };

        let mut response = Response::new(
            response,
            url.to_owned(),
            timeout.read_timeout(),
            options.decode_content,
            Some(conn),
        );

        if options.preload_content {
            // Without release_conn the response keeps its connection until released.
            response.set_release_on_eof(release_conn);
            response.preload().await?;
        }
        Ok(response)
    }

    /// Send a request and return the response, retrying and following same-host
    /// redirects according to the retry policy.
    ///
    /// `url` is a path, or an absolute URL on this pool's host.
    #[cfg_attr(not(tarpaulin), tracing::instrument(skip_all, fields(%method, url), level = "debug"))]
    pub async fn urlopen(
        &self,
        method: Method,
        url: &str,
        body: Option<Bytes>,
        options: RequestOptions,
    ) -> Result<Response, Error> {
        let mut retries = options
            .retries
            .clone()
            .unwrap_or_else(|| self.inner.config.retries.clone());
        let release_conn = options.release_conn.unwrap_or(options.preload_content);
        let mut method = method;
        let mut url = url.to_owned();
        let mut body = body;

        loop {
            if options.assert_same_host && !self.is_same_host(&url) {
                return Err(Error::HostChanged { url });
            }

            let mut response = match self
                .attempt(&method, &url, body.clone(), &options, release_conn)
                .await
            {
                Ok(response) => response,
                Err(error) => {
                    let error = self.proxy_error(error);
                    if error.kind() == ErrorKind::Terminal {
                        return Err(error);
                    }
                    let message = error.to_string();
                    retries = retries.increment(&method, &url, RetryCause::Error(error))?;
                    debug!(
                        error = %message,
                        retries = ?retries,
                        "Retrying after connection broken"
                    );
                    retries.sleep().await;
                    continue;
                }
            };

            if options.redirect && retries.follows_redirects() {
                if let Some(location) = response.redirect_location() {
                    let status = response.status();
                    if status == StatusCode::SEE_OTHER {
                        method = Method::GET;
                        body = None;
                    }
                    match retries.increment(
                        &method,
                        &url,
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
                    let next = join_location(self.destination(), &url, &location)?;
                    debug!("Redirecting {} -> {}", url, next);
                    url = next;
                    continue;
                }
            }

            let status = response.status();
            if retries.is_forced_retry(&method, status) {
                match retries.increment(&method, &url, RetryCause::Status(status)) {
                    Ok(next) => retries = next,
                    Err(error) if retries.raise_on_status => return Err(error),
                    Err(_) => return Ok(response.with_retries(retries)),
                }
                if let Err(error) = response.drain().await {
                    trace!(%error, "failed to drain retried response");
                }
                retries.sleep().await;
                debug!(url, "Forced retry");
                continue;
            }

            return Ok(response.with_retries(retries));
        }
    }

    /// Send a request with form `fields`, encoded into the query string for `GET`-like
    /// methods and into the body otherwise.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        fields: Option<&Fields>,
        options: RequestOptions,
    ) -> Result<Response, Error> {
        let (url, body, options) =
            encode_fields(&method, url, fields, options, &self.inner.config.headers);
        self.urlopen(method, &url, body, options).await
    }

    fn proxy_error(&self, error: Error) -> Error {
        match error {
            Error::NewConnection { host, source } if self.inner.proxied => {
                Error::proxy(format!("Cannot connect to proxy {host}"), source)
            }
            error => error,
        }
    }
}

/// Path and query of `url`, as sent in origin-form requests.
pub(crate) fn request_uri(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_owned(),
    }
}

/// Resolve a redirect `location` against the URL it was returned for.
pub(crate) fn join_location(
    destination: &Destination,
    url: &str,
    location: &str,
) -> Result<String, Error> {
    let base = if url.starts_with('/') {
        Url::parse(&format!("{destination}{url}"))
    } else {
        Url::parse(url)
    }
    .map_err(|error| Error::LocationValue(format!("{url}: {error}")))?;

    base.join(location)
        .map(String::from)
        .map_err(|error| Error::LocationValue(format!("{location}: {error}")))
}

/// A connection checked out of a [`ConnectionPool`].
///
/// Dropping the guard returns the connection to its pool. The connection is available
/// via `Deref` and `DerefMut`.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Weak<PoolInner>,
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PooledConnection").field(&self.conn).finish()
    }
}

impl PooledConnection {
    /// Close the connection and return an empty slot to the pool in its place.
    pub fn discard(mut self) {
        if let Some(mut conn) = self.conn.take() {
            trace!("discarding connection");
            conn.close();
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_ref()
            .expect("connection only taken on drop or discard")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
            .as_mut()
            .expect("connection only taken on drop or discard")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            trace!("connection returned to pool");
            if pool.put(self.conn.take()).is_err() {
                trace!("pool closed, connection dropped");
            }
        }
    }
}
