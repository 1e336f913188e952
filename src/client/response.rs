//! Responses read from pooled connections.
//!
//! The body is read lazily, frame by frame, unless the request asked for it to be
//! preloaded. A response keeps the connection it arrived on until the body has been read
//! to the end, then hands it back to its pool. A response dropped or released before
//! that point closes the connection instead, so a half-read stream is never reused.

use std::error::Error as _;
use std::fmt;
use std::io::{self, Write as _};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use flate2::write::{DeflateDecoder, GzDecoder, ZlibDecoder};
use http::header::{CONTENT_ENCODING, LOCATION};
use http::{HeaderMap, StatusCode, Version};
use http_body::Body as _;
use http_body_util::BodyExt as _;
use hyper::body::Incoming;
use tracing::trace;

use super::conn::within;
use super::pool::PooledConnection;
use super::retry::Retry;
use super::Error;

/// Incremental content decoder.
enum Decoder {
    Gzip(GzDecoder<Vec<u8>>),
    /// `deflate` before the first two bytes have arrived. Servers send either zlib-wrapped
    /// or raw deflate data under that name; the header tells them apart.
    Sniffing(Vec<u8>),
    Zlib(ZlibDecoder<Vec<u8>>),
    Deflate(DeflateDecoder<Vec<u8>>),
}

fn take_output(buffer: &mut Vec<u8>) -> Bytes {
    Bytes::from(std::mem::take(buffer))
}

/// Whether `header` starts a zlib stream: deflate compression, and a valid check value.
fn is_zlib_header(header: &[u8]) -> bool {
    match header {
        [cmf, flg, ..] => (cmf & 0x0f) == 8 && ((u16::from(*cmf) << 8) | u16::from(*flg)) % 31 == 0,
        _ => false,
    }
}

impl Decoder {
    fn for_encoding(encoding: &str) -> Option<Self> {
        match encoding {
            "gzip" => Some(Decoder::Gzip(GzDecoder::new(Vec::new()))),
            "deflate" => Some(Decoder::Sniffing(Vec::new())),
            _ => None,
        }
    }

    fn decode(&mut self, chunk: &[u8]) -> io::Result<Bytes> {
        match self {
            Decoder::Gzip(decoder) => {
                decoder.write_all(chunk)?;
                Ok(take_output(decoder.get_mut()))
            }
            Decoder::Zlib(decoder) => {
                decoder.write_all(chunk)?;
                Ok(take_output(decoder.get_mut()))
            }
            Decoder::Deflate(decoder) => {
                decoder.write_all(chunk)?;
                Ok(take_output(decoder.get_mut()))
            }
            Decoder::Sniffing(buffered) => {
                buffered.extend_from_slice(chunk);
                if buffered.len() < 2 {
                    return Ok(Bytes::new());
                }
                let header = std::mem::take(buffered);
                *self = if is_zlib_header(&header) {
                    Decoder::Zlib(ZlibDecoder::new(Vec::new()))
                } else {
                    trace!("no zlib header, decoding raw deflate");
                    Decoder::Deflate(DeflateDecoder::new(Vec::new()))
                };
                self.decode(&header)
            }
        }
    }

    fn finish(&mut self) -> io::Result<Bytes> {
        match self {
            Decoder::Gzip(decoder) => {
                decoder.try_finish()?;
                Ok(take_output(decoder.get_mut()))
            }
            Decoder::Zlib(decoder) => {
                decoder.try_finish()?;
                Ok(take_output(decoder.get_mut()))
            }
            Decoder::Deflate(decoder) => {
                decoder.try_finish()?;
                Ok(take_output(decoder.get_mut()))
            }
            Decoder::Sniffing(buffered) if buffered.is_empty() => Ok(Bytes::new()),
            Decoder::Sniffing(_) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "deflate stream ended early",
            )),
        }
    }
}

/// An HTTP response.
pub struct Response {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    url: String,

    body: Option<Incoming>,
    decoder: Option<(String, Decoder)>,
    pending: BytesMut,
    data: Option<Bytes>,
    read_timeout: Option<Duration>,
    eof: bool,

    conn: Option<PooledConnection>,
    release_on_eof: bool,
    retries: Option<Retry>,
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("version", &self.version)
            .field("url", &self.url)
            .field("headers", &self.headers)
            .field("eof", &self.eof)
            .finish()
    }
}

impl Response {
    pub(crate) fn new(
        response: http::Response<Incoming>,
        url: String,
        read_timeout: Option<Duration>,
        decode_content: bool,
        conn: Option<PooledConnection>,
    ) -> Self {
        let (parts, body) = response.into_parts();

        let decoder = if decode_content {
            parts
                .headers
                .get(CONTENT_ENCODING)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.trim().to_ascii_lowercase())
                .and_then(|encoding| {
                    Decoder::for_encoding(&encoding).map(|decoder| (encoding, decoder))
                })
        } else {
            None
        };

        Self {
            status: parts.status,
            version: parts.version,
            headers: parts.headers,
            url,
            body: Some(body),
            decoder,
            pending: BytesMut::new(),
            data: None,
            read_timeout,
            eof: false,
            conn,
            release_on_eof: true,
            retries: None,
        }
    }

    pub(crate) fn set_release_on_eof(&mut self, release: bool) {
        self.release_on_eof = release;
    }

    pub(crate) fn with_retries(mut self, retries: Retry) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Read the whole body into [`Response::data`].
    pub(crate) async fn preload(&mut self) -> Result<(), Error> {
        let data = self.read(None).await?;
        self.data = Some(data);
        Ok(())
    }

    /// The response status.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The HTTP version of the response.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// All values of the header `name`, joined with `", "`.
    pub fn header(&self, name: &str) -> Option<String> {
        let values: Vec<&str> = self
            .headers
            .get_all(name)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(values.join(", "))
        }
    }

    /// The URL this response was returned for.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The `Location` of a redirect response.
    pub fn redirect_location(&self) -> Option<String> {
        match self.status.as_u16() {
            301 | 302 | 303 | 307 | 308 => self
                .headers
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned),
            _ => None,
        }
    }

    /// The retry policy as it stood after the request which produced this response.
    pub fn retries(&self) -> Option<&Retry> {
        self.retries.as_ref()
    }

    /// Whether the response still holds its connection.
    pub fn has_connection(&self) -> bool {
        self.conn.is_some()
    }

    /// Whether the body has been read to the end.
    pub fn is_complete(&self) -> bool {
        self.eof && self.pending.is_empty()
    }

    /// The whole body. Reads the rest of it when it was not preloaded.
    pub async fn data(&mut self) -> Result<Bytes, Error> {
        if let Some(data) = &self.data {
            return Ok(data.clone());
        }
        let data = self.read(None).await?;
        self.data = Some(data.clone());
        Ok(data)
    }

    /// Read up to `amount` bytes of the body, or all of the remaining body with `None`.
    ///
    /// Returns an empty buffer at the end of the body.
    pub async fn read(&mut self, amount: Option<usize>) -> Result<Bytes, Error> {
        loop {
            if let Some(amount) = amount {
                if self.pending.len() >= amount {
                    return Ok(self.pending.split_to(amount).freeze());
                }
            }
            if self.eof {
                return Ok(self.pending.split().freeze());
            }
            if let Some(chunk) = self.next_chunk().await? {
                self.pending.extend_from_slice(&chunk);
            }
        }
    }

    /// Read and discard the rest of the body, returning the connection to its pool.
    pub async fn drain(&mut self) -> Result<(), Error> {
        while !self.eof {
            self.next_chunk().await?;
        }
        self.pending.clear();
        self.release_conn();
        Ok(())
    }

    /// Give the connection back to the pool.
    ///
    /// A connection whose response has not been read to the end is closed, and its slot
    /// returned empty. Releasing more than once does nothing.
    pub fn release_conn(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.eof {
                trace!("releasing connection");
                drop(conn);
            } else {
                trace!("releasing connection with unread body");
                conn.discard();
            }
        }
    }

    fn finish(&mut self) {
        self.eof = true;
        self.body = None;
        if let Some(conn) = self.conn.as_mut() {
            conn.complete();
        }
        if self.release_on_eof {
            self.release_conn();
        }
    }

    fn fail(&mut self, error: Error) -> Error {
        self.body = None;
        self.eof = true;
        if let Some(conn) = self.conn.take() {
            conn.discard();
        }
        error
    }

    fn decode(&mut self, chunk: Bytes, last: bool) -> Result<Bytes, Error> {
        let Some((encoding, decoder)) = self.decoder.as_mut() else {
            return Ok(chunk);
        };

        let decoded = decoder.decode(&chunk).and_then(|mut decoded| {
            if last {
                let tail = decoder.finish()?;
                if !tail.is_empty() {
                    let mut joined = BytesMut::from(&decoded[..]);
                    joined.extend_from_slice(&tail);
                    decoded = joined.freeze();
                }
            }
            Ok(decoded)
        });

        decoded.map_err(|source| Error::Decode {
            encoding: encoding.clone(),
            source,
        })
    }

    /// The next chunk of decoded body, or `None` once the end has been reached.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, Error> {
        let Some(body) = self.body.as_mut() else {
            return Ok(None);
        };

        let frame = if body.is_end_stream() {
            Some(None)
        } else {
            within(self.read_timeout, body.frame()).await
        };
        let chunk = match frame {
            None => {
                let error = Error::ReadTimeout {
                    url: self.url.clone(),
                    timeout: self.read_timeout,
                };
                return Err(self.fail(error));
            }
            Some(None) => {
                let tail = self.decode(Bytes::new(), true);
                self.finish();
                return match tail {
                    Ok(tail) if tail.is_empty() => Ok(None),
                    Ok(tail) => Ok(Some(tail)),
                    Err(error) => Err(self.fail(error)),
                };
            }
            Some(Some(Err(error))) => return Err(self.fail(broken(error))),
            Some(Some(Ok(frame))) => match frame.into_data() {
                Ok(data) => data,
                Err(_) => return Ok(Some(Bytes::new())),
            },
        };

        match self.decode(chunk, false) {
            Ok(decoded) => Ok(Some(decoded)),
            Err(error) => Err(self.fail(error)),
        }
    }
}

impl Drop for Response {
    fn drop(&mut self) {
        self.release_conn();
    }
}

/// Map a body read error to a protocol error.
fn broken(error: hyper::Error) -> Error {
    let truncated = error.is_incomplete_message() || {
        let mut source = error.source();
        let mut found = false;
        while let Some(cause) = source {
            if let Some(io) = cause.downcast_ref::<io::Error>() {
                found |= io.kind() == io::ErrorKind::UnexpectedEof;
            }
            source = cause.source();
        }
        found
    };

    let message = if truncated {
        "Connection broken: IncompleteRead"
    } else {
        "Connection broken"
    };
    Error::protocol_from(message)(error)
}
