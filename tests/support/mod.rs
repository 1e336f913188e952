//! In-process HTTP/1.1 servers for integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub const DUMMY_BODY: &str = "Dummy server!";

/// A parsed request, as seen by the server.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub target: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Read one request head and its `Content-Length` body. `None` at EOF.
pub async fn read_request<R>(reader: &mut R) -> io::Result<Option<Request>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }

    let mut parts = line.trim_end().splitn(3, ' ');
    let method = parts.next().unwrap_or_default().to_owned();
    let target = parts.next().unwrap_or_default().to_owned();

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_owned()));
        }
    }

    let length = headers
        .iter()
        .find(|(name, _)| name == "content-length")
        .and_then(|(_, value)| value.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = vec![0; length];
    reader.read_exact(&mut body).await?;

    // absolute-form targets come from proxies
    let origin = match target.find("://") {
        Some(scheme_end) => match target[scheme_end + 3..].find('/') {
            Some(path_start) => target[scheme_end + 3 + path_start..].to_owned(),
            None => "/".to_owned(),
        },
        None => target.clone(),
    };
    let (path, query) = match origin.split_once('?') {
        Some((path, query)) => (path.to_owned(), query.to_owned()),
        None => (origin.clone(), String::new()),
    };
    let query = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();

    Ok(Some(Request {
        method,
        target,
        path,
        query,
        headers,
        body,
    }))
}

/// A response to write.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub close: bool,
}

impl Reply {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
            close: false,
        }
    }

    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self::new(200, body)
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_owned(), value.into()));
        self
    }

    fn reason(&self) -> &'static str {
        match self.status {
            200 => "OK",
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            307 => "Temporary Redirect",
            400 => "Bad Request",
            404 => "Not Found",
            418 => "I'm a teapot",
            500 => "Internal Server Error",
            503 => "Service Unavailable",
            _ => "Unknown",
        }
    }

    pub fn to_bytes(&self, head_only: bool) -> Vec<u8> {
        let mut out = format!("HTTP/1.1 {} {}\r\n", self.status, self.reason()).into_bytes();
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        if self.close {
            out.extend_from_slice(b"Connection: close\r\n");
        }
        out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", self.body.len()).as_bytes());
        if !head_only {
            out.extend_from_slice(&self.body);
        }
        out
    }
}

#[derive(Debug, Default)]
struct State {
    connections: AtomicUsize,
    requests: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    retries: Mutex<HashMap<String, u32>>,
}

fn gzip(data: &[u8]) -> Vec<u8> {
    use std::io::Write as _;
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn deflate(data: &[u8]) -> Vec<u8> {
    use std::io::Write as _;
    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

async fn route(state: &State, request: &Request) -> Reply {
    let param = |name: &str| request.query.get(name).map(String::as_str);

    match request.path.as_str() {
        "/" => Reply::ok(DUMMY_BODY),
        "/specific_method" => {
            let expected = param("method").unwrap_or_default();
            if request.method == expected {
                Reply::ok("")
            } else {
                Reply::new(
                    400,
                    format!("Wrong method: {} != {}", expected, request.method),
                )
            }
        }
        "/upload" => {
            let content_type = request.header("content-type").unwrap_or_default();
            let body = String::from_utf8_lossy(&request.body);
            let filename = param("upload_filename").unwrap_or_default();
            let field = param("upload_param").unwrap_or_default();
            if !content_type.starts_with("multipart/form-data; boundary=") {
                Reply::new(400, format!("bad content type: {content_type}"))
            } else if !body.contains(&format!("name=\"{field}\"; filename=\"{filename}\"")) {
                Reply::new(400, "missing file")
            } else {
                Reply::ok("")
            }
        }
        "/echo" => {
            if request.body.is_empty() {
                let query = request.target.split_once('?').map(|(_, q)| q).unwrap_or_default();
                Reply::ok(query)
            } else {
                Reply::ok(request.body.clone())
            }
        }
        "/headers" => {
            let mut body = String::new();
            for (name, value) in &request.headers {
                body.push_str(&format!("{name}: {value}\n"));
            }
            Reply::ok(body)
        }
        "/redirect" => {
            let target = param("target").unwrap_or("/");
            let status = param("status").and_then(|s| s.parse().ok()).unwrap_or(303);
            Reply::new(status, format!("Redirecting to {target}")).header("Location", target)
        }
        "/keepalive" => {
            let mut reply = Reply::ok("Keeping alive");
            reply.close = param("close") == Some("1");
            reply
        }
        "/sleep" => {
            let seconds: f64 = param("seconds").and_then(|s| s.parse().ok()).unwrap_or(0.0);
            tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
            Reply::ok("TEH DATAS")
        }
        "/status" => {
            let status = param("status").and_then(|s| s.parse().ok()).unwrap_or(200);
            Reply::new(status, "")
        }
        "/successful_retry" => {
            let name = request.header("test-name").unwrap_or_default().to_owned();
            let mut retries = state.retries.lock().unwrap();
            let count = retries.entry(name).or_insert(0);
            *count += 1;
            if *count == 1 {
                Reply::new(418, "")
            } else {
                Reply::ok("Retry successful!")
            }
        }
        "/encodingrequest" => {
            let accept = request.header("accept-encoding").unwrap_or_default();
            let data = b"hello, world!";
            if accept.contains("garbage-gzip") {
                Reply::ok("this is not gzip data").header("Content-Encoding", "gzip")
            } else if accept.contains("gzip") {
                Reply::ok(gzip(data)).header("Content-Encoding", "gzip")
            } else if accept.contains("deflate") {
                Reply::ok(deflate(data)).header("Content-Encoding", "deflate")
            } else {
                Reply::ok(&data[..])
            }
        }
        "/set_cookies" => Reply::ok("")
            .header("Set-Cookie", "foo=1")
            .header("Set-Cookie", "bar=1"),
        _ => Reply::new(404, "Not found"),
    }
}

async fn serve<S>(stream: S, state: Arc<State>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufReader::new(stream);
    loop {
        let request = match read_request(&mut stream).await {
            Ok(Some(request)) => request,
            _ => return,
        };

        state.requests.fetch_add(1, Ordering::SeqCst);
        let active = state.active.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_active.fetch_max(active, Ordering::SeqCst);

        let mut reply = route(&state, &request).await;
        state.active.fetch_sub(1, Ordering::SeqCst);

        if request
            .header("connection")
            .is_some_and(|value| value.eq_ignore_ascii_case("close"))
        {
            reply.close = true;
        }

        let head_only = request.method == "HEAD";
        if stream.write_all(&reply.to_bytes(head_only)).await.is_err() {
            return;
        }
        let _ = stream.flush().await;
        if reply.close {
            let _ = stream.shutdown().await;
            return;
        }
    }
}

/// The dummy HTTP server.
pub struct Server {
    addr: SocketAddr,
    scheme: &'static str,
    host: &'static str,
    state: Arc<State>,
    handle: JoinHandle<()>,
}

impl Server {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(State::default());

        let accept_state = state.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, accept_state.clone()));
            }
        });

        Self {
            addr,
            scheme: "http",
            host: "127.0.0.1",
            state,
            handle,
        }
    }

    /// A server behind TLS, with the `localhost` certificate from `tests/minica`.
    #[cfg(feature = "tls")]
    pub async fn start_tls() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(State::default());
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(tls::server_config()));

        let accept_state = state.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                let acceptor = acceptor.clone();
                let state = accept_state.clone();
                tokio::spawn(async move {
                    if let Ok(stream) = acceptor.accept(stream).await {
                        serve(stream, state).await;
                    }
                });
            }
        });

        Self {
            addr,
            scheme: "https",
            host: "localhost",
            state,
            handle,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn host(&self) -> &'static str {
        self.host
    }

    pub fn base(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.addr.port())
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base(), path)
    }

    /// TCP connections accepted so far.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Requests served so far.
    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    /// Most requests handled at the same time.
    pub fn max_active(&self) -> usize {
        self.state.max_active.load(Ordering::SeqCst)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Percent-encode a query value.
pub fn quote(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Accept connections on a fresh listener and hand each one, with its index, to
/// `handler`.
pub async fn socket_server<F, Fut>(handler: F) -> (SocketAddr, JoinHandle<()>)
where
    F: Fn(usize, TcpStream) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let mut index = 0;
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(handler(index, stream));
            index += 1;
        }
    });
    (addr, handle)
}

/// Read a request head from a raw socket, discarding it.
pub async fn consume_request(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|window| window == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    buf
}

/// A forwarding and `CONNECT` proxy which records the requests it receives.
pub struct Proxy {
    addr: SocketAddr,
    seen: Arc<Mutex<Vec<Request>>>,
    handle: JoinHandle<()>,
}

impl Proxy {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let accept_seen = seen.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(proxy_connection(stream, accept_seen.clone()));
            }
        });

        Self { addr, seen, handle }
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.addr.port())
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn seen(&self) -> Vec<Request> {
        self.seen.lock().unwrap().clone()
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn authority_of(target: &str) -> Option<String> {
    let rest = target.split_once("://").map_or(target, |(_, rest)| rest);
    let authority = rest.split('/').next()?;
    if authority.contains(':') {
        Some(authority.to_owned())
    } else {
        Some(format!("{authority}:80"))
    }
}

async fn proxy_connection(stream: TcpStream, seen: Arc<Mutex<Vec<Request>>>) {
    let mut client = BufReader::new(stream);
    loop {
        let request = match read_request(&mut client).await {
            Ok(Some(request)) => request,
            _ => return,
        };
        seen.lock().unwrap().push(request.clone());

        let Some(authority) = authority_of(&request.target) else {
            return;
        };
        let Ok(mut upstream) = TcpStream::connect(authority.as_str()).await else {
            let reply = Reply::new(502, "Bad Gateway");
            let _ = client.write_all(&reply.to_bytes(false)).await;
            return;
        };

        if request.method == "CONNECT" {
            if client
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .is_err()
            {
                return;
            }
            let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
            return;
        }

        let mut head = format!("{} {} HTTP/1.1\r\n", request.method, request.target).into_bytes();
        for (name, value) in &request.headers {
            if name != "connection" && name != "content-length" {
                head.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
            }
        }
        head.extend_from_slice(
            format!("connection: close\r\ncontent-length: {}\r\n\r\n", request.body.len()).as_bytes(),
        );
        head.extend_from_slice(&request.body);

        if upstream.write_all(&head).await.is_err() {
            return;
        }
        let mut response = Vec::new();
        if upstream.read_to_end(&mut response).await.is_err() {
            return;
        }

        // the client keeps its connection to the proxy
        let marker = b"Connection: close\r\n";
        if let Some(pos) = response.windows(marker.len()).position(|window| window == marker) {
            response.drain(pos..pos + marker.len());
        }
        if client.write_all(&response).await.is_err() {
            return;
        }
    }
}

#[cfg(feature = "tls")]
pub mod tls {
    use std::path::PathBuf;

    pub fn ca_path() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/minica/minica.pem")
    }

    pub fn server_config() -> rustls::ServerConfig {
        let (_, cert) = pem_rfc7468::decode_vec(include_bytes!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/tests/minica/localhost/cert.pem"
        )))
        .unwrap();
        let (_, key) = pem_rfc7468::decode_vec(include_bytes!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/tests/minica/localhost/key.pem"
        )))
        .unwrap();

        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(
                vec![rustls::pki_types::CertificateDer::from(cert)],
                rustls::pki_types::PrivateKeyDer::Pkcs8(key.into()),
            )
            .unwrap();
        config.alpn_protocols.push(b"http/1.1".to_vec());
        config
    }
}
