//! Single HTTP/1.1 connections.
//!
//! A [`Connection`] owns at most one transport. It starts unconnected, connects on the
//! first request, and is closed explicitly or when the transport breaks. The protocol is
//! hyper's HTTP/1.1 client connection, driven by a spawned task which is aborted when the
//! connection is closed or dropped.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::HeaderMap;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::client::conn::http1;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tower::ServiceExt as _;
use tracing::{debug, trace};

pub mod tls;
pub mod transport;
pub(crate) mod tunnel;

use self::transport::{Stream, TcpTransport};
use super::pool::{Destination, Scheme};
use super::Error;

/// Request body type sent over pooled connections.
pub type RequestBody = Full<Bytes>;

/// Await `future` for at most `timeout`. `None` waits forever.
pub(crate) async fn within<F: Future>(timeout: Option<Duration>, future: F) -> Option<F::Output> {
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, future).await.ok(),
        None => Some(future.await),
    }
}

/// How a connection wraps its transport in TLS.
#[derive(Debug, Clone)]
pub(crate) enum TlsMode {
    Plain,
    #[cfg(feature = "tls")]
    Tls(tls::TlsConnector),
    Unavailable(String),
}

impl TlsMode {
    pub(crate) fn for_destination(destination: &Destination, settings: &tls::TlsSettings) -> Self {
        match destination.scheme() {
            Scheme::Http => TlsMode::Plain,
            Scheme::Https => TlsMode::https(settings),
        }
    }

    /// TLS for `https` destinations. Loads the trust roots, so build it once and clone it.
    pub(crate) fn https(settings: &tls::TlsSettings) -> Self {
        #[cfg(feature = "tls")]
        let mode = match tls::TlsConnector::new(settings) {
            Ok(connector) => TlsMode::Tls(connector),
            Err(error) => TlsMode::Unavailable(error.to_string()),
        };

        #[cfg(not(feature = "tls"))]
        let mode = {
            let _ = settings;
            TlsMode::Unavailable(
                "Can't connect to HTTPS URL because the TLS support is not available".into(),
            )
        };

        mode
    }
}

/// A proxy through which connections are tunneled with `CONNECT`.
#[derive(Debug, Clone)]
pub(crate) struct ProxyTunnel {
    pub(crate) proxy: Destination,
    pub(crate) headers: HeaderMap,
}

/// Everything needed to open connections to one destination.
#[derive(Debug)]
pub(crate) struct Connector {
    pub(crate) destination: Destination,
    pub(crate) transport: TcpTransport,
    pub(crate) tls: TlsMode,
    pub(crate) tunnel: Option<ProxyTunnel>,
    pub(crate) http1: http1::Builder,
}

impl Connector {
    /// The error new connections would fail with, if TLS could not be set up.
    pub(crate) fn unavailable(&self) -> Option<Error> {
        match &self.tls {
            TlsMode::Unavailable(message) => Some(Error::Ssl(message.clone())),
            _ => None,
        }
    }

    async fn open(&self) -> Result<Stream, Error> {
        let target = match &self.tunnel {
            Some(tunnel) => &tunnel.proxy,
            None => &self.destination,
        };

        let mut tcp: TcpStream = self
            .transport
            .clone()
            .oneshot(target.clone())
            .await
            .map_err(|source| Error::NewConnection {
                host: target.host().to_owned(),
                source,
            })?;

        if let Some(tunnel) = &self.tunnel {
            tunnel::establish(&mut tcp, &self.destination, &tunnel.headers).await?;
        }

        match &self.tls {
            TlsMode::Plain => Ok(Stream::Tcp(tcp)),
            #[cfg(feature = "tls")]
            TlsMode::Tls(connector) => {
                let stream = connector.connect(self.destination.hostname(), tcp).await?;
                Ok(Stream::Tls(Box::new(stream)))
            }
            TlsMode::Unavailable(message) => Err(Error::Ssl(message.clone())),
        }
    }
}

enum State {
    Unconnected,
    Connected {
        sender: http1::SendRequest<RequestBody>,
        driver: JoinHandle<()>,
    },
    Closed,
}

/// A single HTTP/1.1 connection to a [`Destination`].
pub struct Connection {
    connector: Arc<Connector>,
    state: State,
    in_flight: bool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            State::Unconnected => "unconnected",
            State::Connected { .. } => "connected",
            State::Closed => "closed",
        };
        f.debug_struct("Connection")
            .field("destination", &self.connector.destination)
            .field("state", &state)
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(connector: Arc<Connector>) -> Self {
        Self {
            connector,
            state: State::Unconnected,
            in_flight: false,
        }
    }

    /// The destination this connection talks to.
    pub fn destination(&self) -> &Destination {
        &self.connector.destination
    }

    /// Whether a transport is open.
    pub fn is_connected(&self) -> bool {
        matches!(self.state, State::Connected { .. })
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    /// Whether the transport was connected but has since been closed by the peer or
    /// broken. Such a connection must not be reused.
    pub fn is_dropped(&self) -> bool {
        match &self.state {
            State::Connected { sender, .. } => sender.is_closed(),
            State::Unconnected => false,
            State::Closed => true,
        }
    }

    /// Whether a request was sent and its response body has not been read to the end.
    /// Such a connection must not be reused.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Mark the response to the last request as read to the end.
    pub(crate) fn complete(&mut self) {
        self.in_flight = false;
    }

    /// Open the transport, if it is not already open.
    #[cfg_attr(not(tarpaulin), tracing::instrument(skip_all, fields(destination = %self.connector.destination), level = "debug"))]
    pub async fn connect(&mut self, timeout: Option<Duration>) -> Result<(), Error> {
        if self.is_connected() {
            return Ok(());
        }

        let connector = self.connector.clone();
        let connecting = async {
            let stream = connector.open().await?;
            trace!("handshake h1");
            connector
                .http1
                .handshake::<_, RequestBody>(stream)
                .await
                .map_err(Error::protocol_from("Connection aborted during handshake"))
        };

        let (sender, conn) = within(timeout, connecting).await.ok_or_else(|| {
            Error::ConnectTimeout {
                host: connector.destination.host().to_owned(),
                timeout,
            }
        })??;

        let driver = tokio::spawn(async move {
            if let Err(err) = conn.await {
                debug!(%err, "h1 connection driver error");
            }
        });
        trace!("handshake complete");

        self.state = State::Connected { sender, driver };
        Ok(())
    }

    /// Send a request and wait up to `read_timeout` for the response head.
    ///
    /// Any failure leaves the connection closed.
    pub async fn send(
        &mut self,
        request: http::Request<RequestBody>,
        read_timeout: Option<Duration>,
    ) -> Result<http::Response<Incoming>, Error> {
        let url = request.uri().to_string();
        let State::Connected { sender, .. } = &mut self.state else {
            return Err(Error::protocol("Connection aborted: not connected"));
        };
        self.in_flight = true;

        let exchange = async {
            sender
                .ready()
                .await
                .map_err(Error::protocol_from("Connection aborted"))?;
            sender
                .send_request(request)
                .await
                .map_err(|error| {
                    let message = if error.is_parse() {
                        "Connection aborted: bad status line"
                    } else if error.is_incomplete_message() {
                        "Connection aborted: remote end closed connection without response"
                    } else {
                        "Connection aborted"
                    };
                    Error::protocol_from(message)(error)
                })
        };

        let result = match within(read_timeout, exchange).await {
            Some(result) => result,
            None => Err(Error::ReadTimeout {
                url,
                timeout: read_timeout,
            }),
        };

        if result.is_err() {
            self.close();
        }
        result
    }

    /// Close the transport. A closed connection reconnects on the next
    /// [`connect`][Connection::connect].
    pub fn close(&mut self) {
        self.in_flight = false;
        if let State::Connected { driver, .. } = std::mem::replace(&mut self.state, State::Closed) {
            trace!(destination = %self.connector.destination, "closing connection");
            driver.abort();
        }
    }

    /// Forget a closed transport so the next [`connect`][Connection::connect] opens a new one.
    pub(crate) fn reset(&mut self) {
        self.close();
        self.state = State::Unconnected;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let State::Connected { driver, .. } = &self.state {
            driver.abort();
        }
    }
}
