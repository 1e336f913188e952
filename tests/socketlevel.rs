//! Tests against hand-written servers, for behavior a well-formed server never shows.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http::{Method, StatusCode};
use hyperpool::{ConnectionPool, Error, PoolConfig, RequestOptions, Retry, Timeout};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

mod support;
use support::{consume_request, socket_server};

fn pool_for(addr: std::net::SocketAddr) -> ConnectionPool {
    hyperpool::connection_from_url(&format!("http://{addr}"), PoolConfig::default()).unwrap()
}

fn get() -> RequestOptions {
    RequestOptions::default()
}

async fn reply(stream: &mut TcpStream, response: &[u8]) {
    consume_request(stream).await;
    stream.write_all(response).await.unwrap();
    stream.flush().await.unwrap();
}

#[tokio::test]
async fn truncated_body() {
    let _ = tracing_subscriber::fmt::try_init();
    let (addr, _server) = socket_server(|_, mut stream| async move {
        reply(
            &mut stream,
            b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\nContent-Type: text/plain\r\n\r\nshort",
        )
        .await;
    })
    .await;
    let pool = pool_for(addr);

    let mut response = pool
        .urlopen(Method::GET, "/", None, get().with_preload_content(false))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let err = response.read(None).await.unwrap_err();
    assert!(matches!(err, Error::Protocol { .. }), "{err}");
    assert!(err.to_string().contains("IncompleteRead"), "{err}");
    assert!(!response.has_connection());
    assert_eq!(pool.available(), 1);

    let err = pool
        .urlopen(Method::GET, "/", None, get().with_retries(Retry::disabled()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Protocol { .. }), "{err}");
}

#[tokio::test]
async fn bad_status_line() {
    let (addr, _server) = socket_server(|_, mut stream| async move {
        reply(&mut stream, b"HTTP/0.5 200 OK\r\n\r\n").await;
    })
    .await;
    let pool = pool_for(addr);

    let err = pool
        .urlopen(Method::GET, "/", None, get().with_retries(Retry::disabled()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Protocol { .. }), "{err}");
    assert_eq!(err.kind(), hyperpool::ErrorKind::Read);

    let err = pool
        .urlopen(Method::GET, "/", None, get().with_retries(1))
        .await
        .unwrap_err();
    assert!(matches!(err.reason(), Some(Error::Protocol { .. })), "{err}");
}

#[tokio::test]
async fn retries_after_connection_reset() {
    let _ = tracing_subscriber::fmt::try_init();
    let (addr, _server) = socket_server(|index, mut stream| async move {
        if index == 0 {
            consume_request(&mut stream).await;
            drop(stream);
        } else {
            reply(&mut stream, b"HTTP/1.1 200 OK\r\nContent-Length: 9\r\n\r\nrecovered").await;
        }
    })
    .await;
    let pool = pool_for(addr);

    let mut response = pool.urlopen(Method::GET, "/", None, get()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.data().await.unwrap(), "recovered");
    assert_eq!(response.retries().unwrap().history().len(), 1);
    assert_eq!(pool.num_connections(), 2);
}

#[tokio::test]
async fn post_is_not_retried_after_read_error() {
    let (addr, _server) = socket_server(|_, mut stream| async move {
        consume_request(&mut stream).await;
        drop(stream);
    })
    .await;
    let pool = pool_for(addr);

    let err = pool
        .urlopen(Method::POST, "/", Some("data".into()), get())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Protocol { .. }), "{err}");
    assert_eq!(pool.num_connections(), 1);
}

#[tokio::test]
async fn body_read_timeout() {
    let (addr, _server) = socket_server(|_, mut stream| async move {
        reply(&mut stream, b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nhalf").await;
        tokio::time::sleep(Duration::from_secs(1)).await;
    })
    .await;
    let pool = pool_for(addr);

    let mut response = pool
        .urlopen(
            Method::GET,
            "/",
            None,
            get()
                .with_preload_content(false)
                .with_timeout(Timeout::default().with_read(Duration::from_millis(50))),
        )
        .await
        .unwrap();

    assert_eq!(response.read(Some(4)).await.unwrap(), "half");
    let err = response.read(None).await.unwrap_err();
    assert!(matches!(err, Error::ReadTimeout { .. }), "{err}");
    assert!(!response.has_connection());
}

#[tokio::test]
async fn reconnects_after_server_closes_idle_connection() {
    let _ = tracing_subscriber::fmt::try_init();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    let (addr, _server) = socket_server(move |_, mut stream| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move {
            reply(&mut stream, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;
            // keep-alive was promised, but the connection is closed anyway
            drop(stream);
        }
    })
    .await;
    let pool = pool_for(addr);

    for _ in 0..2 {
        let mut response = pool.urlopen(Method::GET, "/", None, get()).await.unwrap();
        assert_eq!(response.data().await.unwrap(), "ok");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn raw_deflate_body() {
    use std::io::Write as _;

    let mut encoder =
        flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(b"raw deflate data").unwrap();
    let compressed = encoder.finish().unwrap();

    let mut head = format!(
        "HTTP/1.1 200 OK\r\nContent-Encoding: deflate\r\nContent-Length: {}\r\n\r\n",
        compressed.len()
    )
    .into_bytes();
    head.extend_from_slice(&compressed);
    let response = Arc::new(head);

    let (addr, _server) = socket_server(move |_, mut stream| {
        let response = response.clone();
        async move {
            reply(&mut stream, &response).await;
        }
    })
    .await;
    let pool = pool_for(addr);

    let mut response = pool.urlopen(Method::GET, "/", None, get()).await.unwrap();
    assert_eq!(response.data().await.unwrap(), "raw deflate data");
}

#[tokio::test]
async fn chunked_body() {
    let (addr, _server) = socket_server(|_, mut stream| async move {
        reply(
            &mut stream,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
              4\r\nhell\r\n3\r\no, \r\n6\r\nworld!\r\n0\r\n\r\n",
        )
        .await;
    })
    .await;
    let pool = pool_for(addr);

    let mut response = pool
        .urlopen(Method::GET, "/", None, get().with_preload_content(false))
        .await
        .unwrap();
    let mut body = Vec::new();
    loop {
        let chunk = response.read(Some(2)).await.unwrap();
        if chunk.is_empty() {
            break;
        }
        assert!(chunk.len() <= 2);
        body.extend_from_slice(&chunk);
    }
    assert_eq!(body, b"hello, world!");
    assert!(response.is_complete());
    assert_eq!(pool.available(), 1);
}

#[tokio::test]
async fn request_on_the_wire() {
    let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
    let (addr, _server) = socket_server(move |_, stream| {
        let sender = sender.clone();
        async move {
            let mut stream = BufReader::new(stream);
            let request = support::read_request(&mut stream).await.unwrap().unwrap();
            let _ = sender.send(request);
            stream
                .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
                .await
                .unwrap();
        }
    })
    .await;
    let pool = pool_for(addr);

    let response = pool
        .urlopen(
            Method::PUT,
            &format!("http://{addr}/path?query=1"),
            Some("payload".into()),
            get(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let request = receiver.recv().await.unwrap();
    assert_eq!(request.method, "PUT");
    assert_eq!(request.target, "/path?query=1");
    assert_eq!(request.header("host"), Some(addr.to_string().as_str()));
    assert_eq!(request.body, b"payload");
}
