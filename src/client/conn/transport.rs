//! TCP transport for client connections.
//!
//! [`TcpTransport`] is a [`tower::Service`] which resolves a [`Destination`] and opens a
//! TCP connection to it, applying the socket options in [`TcpConfig`]. The resulting
//! stream, optionally wrapped in TLS, is what hyper reads and writes.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpSocket, TcpStream};
use tracing::{trace, warn, Instrument};

use crate::client::pool::Destination;

/// Configuration for TCP connections.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct TcpConfig {
    /// Idle time before TCP keep-alive probes start.
    pub keep_alive_timeout: Option<Duration>,

    /// The local IPv4 address to bind to.
    pub local_address_ipv4: Option<Ipv4Addr>,

    /// The local IPv6 address to bind to.
    pub local_address_ipv6: Option<Ipv6Addr>,

    /// Whether to disable Nagle's algorithm.
    pub nodelay: bool,

    /// Whether to reuse the local address.
    pub reuse_address: bool,

    /// The size of the send buffer.
    pub send_buffer_size: Option<usize>,

    /// The size of the receive buffer.
    pub recv_buffer_size: Option<usize>,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            keep_alive_timeout: Some(Duration::from_secs(90)),
            local_address_ipv4: None,
            local_address_ipv6: None,
            nodelay: true,
            reuse_address: true,
            send_buffer_size: None,
            recv_buffer_size: None,
        }
    }
}

impl TcpConfig {
    /// Set the keep-alive idle time.
    pub fn with_keep_alive_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.keep_alive_timeout = timeout;
        self
    }

    /// Bind outgoing IPv4 connections to `address`.
    pub fn with_local_address_ipv4(mut self, address: Ipv4Addr) -> Self {
        self.local_address_ipv4 = Some(address);
        self
    }

    /// Bind outgoing IPv6 connections to `address`.
    pub fn with_local_address_ipv6(mut self, address: Ipv6Addr) -> Self {
        self.local_address_ipv6 = Some(address);
        self
    }

    /// Set `TCP_NODELAY`.
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

/// A TCP connector for client connections.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: Arc<TcpConfig>,
}

impl TcpTransport {
    /// Create a transport with the given socket options.
    pub fn new(config: TcpConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// The socket options.
    pub fn config(&self) -> &TcpConfig {
        &self.config
    }

    /// Resolve `host` and try each address in turn, returning the first connection.
    async fn connect(self, host: String, port: u16) -> io::Result<TcpStream> {
        let addrs = tokio::net::lookup_host((host.as_str(), port)).await?;

        let mut last_error = None;
        for addr in addrs {
            let span = tracing::trace_span!("connect", address = %addr);
            match connect(&addr, &self.config)?.instrument(span).await {
                Ok(stream) => {
                    if let Err(error) = stream.set_nodelay(self.config.nodelay) {
                        warn!("tcp set_nodelay error: {}", error);
                    }
                    trace!(peer.addr = %addr, "tcp connected");
                    return Ok(stream);
                }
                Err(error) => {
                    trace!(%error, "connection attempt failed");
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses found for {host}"),
            )
        }))
    }
}

impl tower::Service<Destination> for TcpTransport {
    type Response = TcpStream;
    type Error = io::Error;
    type Future = BoxFuture<'static, Result<TcpStream, io::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Destination) -> Self::Future {
        let transport = self.clone();
        let span = tracing::trace_span!("tcp", host = %req.hostname(), port = %req.port());
        Box::pin(
            transport
                .connect(req.hostname().to_owned(), req.port())
                .instrument(span),
        )
    }
}

fn bind_local_address(
    socket: &socket2::Socket,
    dst_addr: &SocketAddr,
    config: &TcpConfig,
) -> io::Result<()> {
    match (*dst_addr, config.local_address_ipv4, config.local_address_ipv6) {
        (SocketAddr::V4(_), Some(addr), _) => {
            socket.bind(&SocketAddr::new(addr.into(), 0).into())?;
        }
        (SocketAddr::V6(_), _, Some(addr)) => {
            socket.bind(&SocketAddr::new(addr.into(), 0).into())?;
        }
        _ => {}
    }

    Ok(())
}

fn connect(
    addr: &SocketAddr,
    config: &TcpConfig,
) -> io::Result<impl std::future::Future<Output = io::Result<TcpStream>>> {
    use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};

    let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;

    // Tokio requires O_NONBLOCK on sockets it adopts.
    socket.set_nonblocking(true)?;

    if let Some(dur) = config.keep_alive_timeout {
        let conf = TcpKeepalive::new().with_time(dur);
        if let Err(e) = socket.set_tcp_keepalive(&conf) {
            warn!("tcp set_keepalive error: {}", e);
        }
    }

    bind_local_address(&socket, addr, config)?;

    #[allow(unsafe_code)]
    let socket = unsafe {
        // Safety: `into_raw_fd` transfers ownership of the descriptor out of the
        // socket2 socket, so the tokio socket is its only owner.
        use std::os::unix::io::{FromRawFd, IntoRawFd};
        TcpSocket::from_raw_fd(socket.into_raw_fd())
    };

    if config.reuse_address {
        if let Err(e) = socket.set_reuseaddr(true) {
            warn!("tcp set_reuse_address error: {}", e);
        }
    }

    if let Some(size) = config.send_buffer_size {
        if let Err(e) = socket.set_send_buffer_size(size.try_into().unwrap_or(u32::MAX)) {
            warn!("tcp set_buffer_size error: {}", e);
        }
    }

    if let Some(size) = config.recv_buffer_size {
        if let Err(e) = socket.set_recv_buffer_size(size.try_into().unwrap_or(u32::MAX)) {
            warn!("tcp set_recv_buffer_size error: {}", e);
        }
    }

    Ok(socket.connect(*addr))
}

/// A connected byte stream, plain or TLS.
pub(crate) enum Stream {
    Tcp(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stream::Tcp(stream) => f.debug_tuple("Tcp").field(stream).finish(),
            #[cfg(feature = "tls")]
            Stream::Tls(_) => f.debug_tuple("Tls").finish(),
        }
    }
}

impl Stream {
    fn poll_read_tokio(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self {
            Stream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            Stream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

#[allow(unsafe_code)]
impl hyper::rt::Read for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        mut buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        let n = unsafe {
            // Safety: tokio's ReadBuf only writes initialized bytes into the
            // uninitialized region and reports how many it filled.
            let mut tbuf = tokio::io::ReadBuf::uninit(buf.as_mut());
            match this.poll_read_tokio(cx, &mut tbuf) {
                Poll::Ready(Ok(())) => tbuf.filled().len(),
                other => return other,
            }
        };

        unsafe {
            // Safety: `n` bytes were just initialized by the read above.
            buf.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl hyper::rt::Write for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            Stream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            Stream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            Stream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}
