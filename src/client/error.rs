use std::io;
use std::time::Duration;

use http::StatusCode;
use thiserror::Error;

use crate::BoxError;

/// Client error type.
///
/// Every failure a request can end with is one of these variants. The retry loop
/// classifies them with [`Error::kind`] rather than by inspecting messages.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The connection could not be established within the connect timeout.
    #[error("connection to {host} timed out (connect timeout={timeout:?})")]
    ConnectTimeout {
        /// Host the pool was connecting to.
        host: String,
        /// The budget which ran out.
        timeout: Option<Duration>,
    },

    /// The server did not send data within the read timeout.
    #[error("read timed out for {url} (read timeout={timeout:?})")]
    ReadTimeout {
        /// URL of the request which timed out.
        url: String,
        /// The budget which ran out.
        timeout: Option<Duration>,
    },

    /// A new connection could not be opened (refused, unreachable, DNS failure).
    #[error("failed to establish a new connection to {host}: {source}")]
    NewConnection {
        /// Host the pool was connecting to.
        host: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The connection broke or the server sent something which is not HTTP/1.x.
    #[error("{message}")]
    Protocol {
        /// Description of what went wrong.
        message: String,
        /// The underlying error, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// TLS verification or configuration failed.
    #[error("ssl: {0}")]
    Ssl(String),

    /// The pool had no connection available within the pool timeout.
    #[error("pool reached maximum size and no more connections are allowed")]
    EmptyPool,

    /// The pool has been closed.
    #[error("pool is closed")]
    ClosedPool,

    /// The URL has no usable host or scheme.
    #[error("no host specified: {0}")]
    LocationValue(String),

    /// The proxy could not be reached or refused the tunnel.
    #[error("cannot connect to proxy: {message}")]
    Proxy {
        /// Description of what went wrong.
        message: String,
        /// The underlying error, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// The retry budget was exhausted. `reason` is the error which used it up.
    #[error("max retries exceeded with url: {url} (caused by {reason})")]
    MaxRetry {
        /// URL of the final attempt.
        url: String,
        /// The last underlying error.
        reason: Box<Error>,
    },

    /// A redirect pointed to a different host than the pool serves.
    #[error("tried to open a foreign host with url: {url}")]
    HostChanged {
        /// The foreign location.
        url: String,
    },

    /// Content decoding failed.
    #[error("received response with content-encoding: {encoding}, but failed to decode it")]
    Decode {
        /// The content-encoding which could not be decoded.
        encoding: String,
        /// The decoder error.
        #[source]
        source: io::Error,
    },

    /// Too many responses with a status in the retry forcelist.
    #[error("too many {0} error responses")]
    ResponseStatus(StatusCode),

    /// Too many redirects.
    #[error("too many redirects")]
    TooManyRedirects,

    /// The request could not be assembled.
    #[error("invalid request: {0}")]
    Http(#[from] http::Error),
}

/// Which retry counter a failure is charged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request never reached the server; safe to retry for any method.
    Connect,
    /// The request may have reached the server.
    Read,
    /// Failure talking to the proxy; only charged against the total budget.
    Proxy,
    /// Not retryable.
    Terminal,
}

impl Error {
    pub(crate) fn protocol<S: Into<String>>(message: S) -> Self {
        Error::Protocol {
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn protocol_from<S, E>(message: S) -> impl FnOnce(E) -> Self
    where
        S: Into<String>,
        E: Into<BoxError>,
    {
        move |error| Error::Protocol {
            message: message.into(),
            source: Some(error.into()),
        }
    }

    pub(crate) fn proxy<S, E>(message: S, error: E) -> Self
    where
        S: Into<String>,
        E: Into<BoxError>,
    {
        Error::Proxy {
            message: message.into(),
            source: Some(error.into()),
        }
    }

    /// Classify this error for retry accounting.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ConnectTimeout { .. } | Error::NewConnection { .. } => ErrorKind::Connect,
            Error::ReadTimeout { .. } | Error::Protocol { .. } => ErrorKind::Read,
            Error::Proxy { .. } => ErrorKind::Proxy,
            Error::Ssl(_)
            | Error::EmptyPool
            | Error::ClosedPool
            | Error::LocationValue(_)
            | Error::MaxRetry { .. }
            | Error::HostChanged { .. }
            | Error::Decode { .. }
            | Error::ResponseStatus(_)
            | Error::TooManyRedirects
            | Error::Http(_) => ErrorKind::Terminal,
        }
    }

    /// Returns `true` for connect and read timeouts.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::ConnectTimeout { .. } | Error::ReadTimeout { .. })
    }

    /// The error which exhausted the retry budget, when this is [`Error::MaxRetry`].
    pub fn reason(&self) -> Option<&Error> {
        match self {
            Error::MaxRetry { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

/// The timer of a [`Timeout`][crate::Timeout] was misused.
#[derive(Debug, Error)]
#[error("timer error: {message}")]
pub struct TimerError {
    message: &'static str,
}

impl TimerError {
    pub(crate) fn new(message: &'static str) -> Self {
        Self { message }
    }
}
