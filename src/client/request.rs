//! Per-request options and form field encoding shared by pools and managers.

use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, Method};

use super::fields::Fields;
use super::retry::Retry;
use super::timeout::Timeout;

/// Options for a single request.
///
/// Unset options fall back to the defaults of the pool serving the request.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct RequestOptions {
    /// Request headers. Replaces the pool's default headers when set.
    pub headers: Option<HeaderMap>,

    /// Retry policy.
    pub retries: Option<Retry>,

    /// Timeout for each attempt.
    pub timeout: Option<Timeout>,

    /// How long to wait for a connection from a blocking pool.
    pub pool_timeout: Option<Duration>,

    /// Follow redirects.
    pub redirect: bool,

    /// Refuse URLs for a different host than the pool serves.
    pub assert_same_host: bool,

    /// Return the connection to the pool once the response body is read. Defaults to
    /// `preload_content`.
    pub release_conn: Option<bool>,

    /// Read the whole body before returning the response.
    pub preload_content: bool,

    /// Decode `gzip` and `deflate` response bodies.
    pub decode_content: bool,

    /// Encode form fields as `multipart/form-data` rather than urlencoded.
    pub encode_multipart: bool,

    /// Boundary for multipart bodies. Random when unset.
    pub multipart_boundary: Option<String>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            headers: None,
            retries: None,
            timeout: None,
            pool_timeout: None,
            redirect: true,
            assert_same_host: true,
            release_conn: None,
            preload_content: true,
            decode_content: true,
            encode_multipart: true,
            multipart_boundary: None,
        }
    }
}

impl RequestOptions {
    /// Set the request headers.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Set the retry policy.
    pub fn with_retries(mut self, retries: impl Into<Retry>) -> Self {
        self.retries = Some(retries.into());
        self
    }

    /// Set the timeout.
    pub fn with_timeout(mut self, timeout: impl Into<Timeout>) -> Self {
        self.timeout = Some(timeout.into());
        self
    }

    /// Set the pool timeout.
    pub fn with_pool_timeout(mut self, timeout: Duration) -> Self {
        self.pool_timeout = Some(timeout);
        self
    }

    /// Set whether redirects are followed.
    pub fn with_redirect(mut self, redirect: bool) -> Self {
        self.redirect = redirect;
        self
    }

    /// Set whether foreign hosts are refused.
    pub fn with_assert_same_host(mut self, assert_same_host: bool) -> Self {
        self.assert_same_host = assert_same_host;
        self
    }

    /// Set whether the connection is released once the body is read.
    pub fn with_release_conn(mut self, release_conn: bool) -> Self {
        self.release_conn = Some(release_conn);
        self
    }

    /// Set whether the body is read eagerly.
    pub fn with_preload_content(mut self, preload_content: bool) -> Self {
        self.preload_content = preload_content;
        self
    }

    /// Set whether the body is decoded.
    pub fn with_decode_content(mut self, decode_content: bool) -> Self {
        self.decode_content = decode_content;
        self
    }

    /// Set whether fields are sent as a multipart body.
    pub fn with_encode_multipart(mut self, encode_multipart: bool) -> Self {
        self.encode_multipart = encode_multipart;
        self
    }

    /// Set the multipart boundary.
    pub fn with_multipart_boundary(mut self, boundary: impl Into<String>) -> Self {
        self.multipart_boundary = Some(boundary.into());
        self
    }
}

/// Methods which carry form fields in the query string.
pub fn encodes_url(method: &Method) -> bool {
    matches!(
        *method,
        Method::DELETE | Method::GET | Method::HEAD | Method::OPTIONS
    )
}

/// Apply `fields` to a request: appended to the query string of `url` for
/// [`encodes_url`] methods, otherwise encoded into the body with a matching
/// `Content-Type` header.
pub(crate) fn encode_fields(
    method: &Method,
    url: &str,
    fields: Option<&Fields>,
    mut options: RequestOptions,
    default_headers: &HeaderMap,
) -> (String, Option<Bytes>, RequestOptions) {
    let Some(fields) = fields else {
        return (url.to_owned(), None, options);
    };

    if encodes_url(method) {
        if fields.is_empty() {
            return (url.to_owned(), None, options);
        }
        let separator = if url.contains('?') { '&' } else { '?' };
        return (
            format!("{url}{separator}{}", fields.urlencode()),
            None,
            options,
        );
    }

    let (body, content_type) = if options.encode_multipart {
        fields.encode_multipart(options.multipart_boundary.as_deref())
    } else {
        (
            Bytes::from(fields.urlencode()),
            "application/x-www-form-urlencoded".to_owned(),
        )
    };

    let mut headers = options
        .headers
        .take()
        .unwrap_or_else(|| default_headers.clone());
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        headers.insert(CONTENT_TYPE, value);
    }
    options.headers = Some(headers);

    (url.to_owned(), Some(body), options)
}
