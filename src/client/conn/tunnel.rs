//! `CONNECT` tunnels through an HTTP proxy.

use bytes::BytesMut;
use http::HeaderMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::client::pool::Destination;
use crate::client::Error;

const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Ask the proxy on the other end of `stream` to open a tunnel to `target`.
///
/// On success the stream carries raw bytes to and from `target`.
pub(crate) async fn establish(
    stream: &mut TcpStream,
    target: &Destination,
    headers: &HeaderMap,
) -> Result<(), Error> {
    let authority = target.authority();
    debug!(%authority, "establishing CONNECT tunnel");

    let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n").into_bytes();
    for (name, value) in headers {
        request.extend_from_slice(name.as_str().as_bytes());
        request.extend_from_slice(b": ");
        request.extend_from_slice(value.as_bytes());
        request.extend_from_slice(b"\r\n");
    }
    request.extend_from_slice(b"\r\n");

    stream
        .write_all(&request)
        .await
        .map_err(|error| Error::proxy("failed to send CONNECT", error))?;

    let mut buf = BytesMut::with_capacity(1024);
    let head_len = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_RESPONSE_HEAD {
            return Err(Error::Proxy {
                message: "proxy response headers too large".into(),
                source: None,
            });
        }
        let n = stream
            .read_buf(&mut buf)
            .await
            .map_err(|error| Error::proxy("failed to read CONNECT response", error))?;
        if n == 0 {
            return Err(Error::Proxy {
                message: "proxy closed the connection during CONNECT".into(),
                source: None,
            });
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_len]);
    let status_line = head.lines().next().unwrap_or_default();
    trace!(status_line, "CONNECT response");

    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    let code = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") || code != "200" {
        return Err(Error::Proxy {
            message: format!("Tunnel connection failed: {}", status_line.trim()),
            source: None,
        });
    }

    Ok(())
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n").map(|pos| pos + 4)
}
