//! Retry policy.
//!
//! A [`Retry`] is an immutable value. Each failure produces a new `Retry` with the
//! relevant counters decremented via [`Retry::increment`], so one policy can be shared
//! between concurrent requests without them affecting each other.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use http::{Method, StatusCode};
use tracing::debug;

use super::error::{Error, ErrorKind};

/// Upper bound on a single backoff sleep.
pub const BACKOFF_MAX: Duration = Duration::from_secs(120);

/// A retry counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Budget {
    /// Not limited by this counter; other counters still apply.
    Unlimited,

    /// This many more retries are allowed.
    Remaining(u32),

    /// Do not retry; failures of this class are returned as-is.
    Disabled,
}

impl Budget {
    /// Spend one retry. Returns the new budget, and whether it is exhausted.
    fn spend(self) -> (Budget, bool) {
        match self {
            Budget::Unlimited => (Budget::Unlimited, false),
            Budget::Remaining(0) | Budget::Disabled => (Budget::Remaining(0), true),
            Budget::Remaining(n) => (Budget::Remaining(n - 1), false),
        }
    }
}

impl From<u32> for Budget {
    fn from(value: u32) -> Self {
        Budget::Remaining(value)
    }
}

/// Why [`Retry::increment`] is being called.
#[derive(Debug)]
pub enum RetryCause {
    /// The attempt failed.
    Error(Error),

    /// The server answered with a redirect.
    Redirect {
        /// Status of the redirect response.
        status: StatusCode,
        /// Where it points.
        location: String,
    },

    /// The server answered with a status in the forcelist.
    Status(StatusCode),
}

/// One entry of [`Retry::history`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHistory {
    /// Request method.
    pub method: Method,
    /// Request URL.
    pub url: String,
    /// Rendered error, for failed attempts.
    pub error: Option<String>,
    /// Response status, for attempts which got a response.
    pub status: Option<StatusCode>,
    /// Redirect target, for redirects.
    pub redirect_location: Option<String>,
}

/// Methods which are retried after a read error.
pub fn default_method_whitelist() -> HashSet<Method> {
    [
        Method::HEAD,
        Method::GET,
        Method::PUT,
        Method::DELETE,
        Method::OPTIONS,
        Method::TRACE,
    ]
    .into_iter()
    .collect()
}

/// Retry configuration.
///
/// `total` bounds every kind of retry. `connect`, `read` and `redirect` additionally
/// bound their own failure class. A counter set to [`Budget::Disabled`] makes failures of
/// that class return immediately with the original error.
#[derive(Clone, PartialEq)]
pub struct Retry {
    /// Overall budget.
    pub total: Budget,

    /// Budget for failures before the request reached the server.
    pub connect: Budget,

    /// Budget for failures after the request was sent.
    pub read: Budget,

    /// Budget for redirects.
    pub redirect: Budget,

    /// Methods eligible for forced-status and read retries. `None` allows all methods.
    pub method_whitelist: Option<HashSet<Method>>,

    /// Statuses which are retried even though a response was received.
    pub status_forcelist: HashSet<StatusCode>,

    /// Backoff multiplier, in seconds.
    pub backoff_factor: f64,

    /// Raise [`Error::MaxRetry`] when redirects are exhausted, instead of returning the
    /// last redirect response.
    pub raise_on_redirect: bool,

    /// Raise [`Error::MaxRetry`] when forced-status retries are exhausted, instead of
    /// returning the last response.
    pub raise_on_status: bool,

    observed_errors: u32,
    history: Vec<RequestHistory>,
}

impl fmt::Debug for Retry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retry")
            .field("total", &self.total)
            .field("connect", &self.connect)
            .field("read", &self.read)
            .field("redirect", &self.redirect)
            .finish()
    }
}

impl Default for Retry {
    fn default() -> Self {
        Retry::new(3)
    }
}

impl From<u32> for Retry {
    fn from(value: u32) -> Self {
        Retry::new(value)
    }
}

impl Retry {
    /// A policy allowing `total` retries of any kind.
    pub fn new(total: u32) -> Self {
        Self::with_total(Budget::Remaining(total))
    }

    /// A policy which never retries and never follows redirects. Errors are returned
    /// as they happened, not wrapped in [`Error::MaxRetry`].
    pub fn disabled() -> Self {
        Self::with_total(Budget::Disabled)
    }

    /// A policy with no overall limit. Set the per-class counters to bound it.
    pub fn unlimited() -> Self {
        Self::with_total(Budget::Unlimited)
    }

    fn with_total(total: Budget) -> Self {
        Self {
            total,
            connect: Budget::Unlimited,
            read: Budget::Unlimited,
            redirect: Budget::Unlimited,
            method_whitelist: Some(default_method_whitelist()),
            status_forcelist: HashSet::new(),
            backoff_factor: 0.0,
            raise_on_redirect: true,
            raise_on_status: true,
            observed_errors: 0,
            history: Vec::new(),
        }
    }

    /// Set the connect budget.
    pub fn with_connect(mut self, connect: impl Into<Budget>) -> Self {
        self.connect = connect.into();
        self
    }

    /// Set the read budget.
    pub fn with_read(mut self, read: impl Into<Budget>) -> Self {
        self.read = read.into();
        self
    }

    /// Set the redirect budget.
    pub fn with_redirect(mut self, redirect: impl Into<Budget>) -> Self {
        self.redirect = redirect.into();
        self
    }

    /// Set the statuses which force a retry.
    pub fn with_status_forcelist<I>(mut self, statuses: I) -> Self
    where
        I: IntoIterator<Item = StatusCode>,
    {
        self.status_forcelist = statuses.into_iter().collect();
        self
    }

    /// Set the methods eligible for forced-status and read retries.
    pub fn with_method_whitelist<I>(mut self, methods: Option<I>) -> Self
    where
        I: IntoIterator<Item = Method>,
    {
        self.method_whitelist = methods.map(|methods| methods.into_iter().collect());
        self
    }

    /// Set the backoff factor, in seconds.
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Set whether exhausted redirects raise.
    pub fn with_raise_on_redirect(mut self, raise: bool) -> Self {
        self.raise_on_redirect = raise;
        self
    }

    /// Set whether exhausted forced-status retries raise.
    pub fn with_raise_on_status(mut self, raise: bool) -> Self {
        self.raise_on_status = raise;
        self
    }

    /// Attempts recorded so far.
    pub fn history(&self) -> &[RequestHistory] {
        &self.history
    }

    /// Whether redirects should be followed at all.
    pub fn follows_redirects(&self) -> bool {
        !matches!(self.redirect, Budget::Disabled) && !matches!(self.total, Budget::Disabled)
    }

    /// Whether `method` may be retried after the request was sent.
    pub fn is_retryable_method(&self, method: &Method) -> bool {
        self.method_whitelist
            .as_ref()
            .map_or(true, |methods| methods.contains(method))
    }

    /// Whether a response with `status` to `method` should be retried.
    pub fn is_forced_retry(&self, method: &Method, status: StatusCode) -> bool {
        self.is_retryable_method(method) && self.status_forcelist.contains(&status)
    }

    /// How long to sleep before the next attempt.
    ///
    /// No backoff is applied until there have been two consecutive errors.
    pub fn backoff(&self) -> Duration {
        if self.observed_errors <= 1 || self.backoff_factor <= 0.0 {
            return Duration::ZERO;
        }
        let exponent = (self.observed_errors - 1).min(31) as i32;
        let seconds = self.backoff_factor * 2f64.powi(exponent);
        Duration::try_from_secs_f64(seconds)
            .map_or(BACKOFF_MAX, |backoff| backoff.min(BACKOFF_MAX))
    }

    /// Sleep for [`Retry::backoff`].
    pub async fn sleep(&self) {
        let backoff = self.backoff();
        if !backoff.is_zero() {
            debug!(?backoff, "backing off before retry");
            tokio::time::sleep(backoff).await;
        }
    }

    /// Account for a failed or redirected attempt.
    ///
    /// Returns the policy for the next attempt, or the error to give to the caller:
    /// the original error when its class is disabled, or [`Error::MaxRetry`] when a
    /// counter ran out.
    pub fn increment(&self, method: &Method, url: &str, cause: RetryCause) -> Result<Retry, Error> {
        let mut next = self.clone();
        let mut entry = RequestHistory {
            method: method.clone(),
            url: url.to_owned(),
            error: None,
            status: None,
            redirect_location: None,
        };

        if self.total == Budget::Disabled {
            if let RetryCause::Error(error) = cause {
                return Err(error);
            }
        }

        let (total, mut exhausted) = self.total.spend();
        next.total = total;

        let reason = match cause {
            RetryCause::Error(error) => {
                entry.error = Some(error.to_string());
                match error.kind() {
                    ErrorKind::Connect => {
                        if self.connect == Budget::Disabled {
                            return Err(error);
                        }
                        let (connect, spent) = self.connect.spend();
                        next.connect = connect;
                        exhausted |= spent;
                    }
                    ErrorKind::Read => {
                        if self.read == Budget::Disabled || !self.is_retryable_method(method) {
                            return Err(error);
                        }
                        let (read, spent) = self.read.spend();
                        next.read = read;
                        exhausted |= spent;
                    }
                    ErrorKind::Proxy => {}
                    ErrorKind::Terminal => return Err(error),
                }
                next.observed_errors += 1;
                error
            }
            RetryCause::Redirect { status, location } => {
                entry.status = Some(status);
                entry.redirect_location = Some(location);
                let (redirect, spent) = self.redirect.spend();
                next.redirect = redirect;
                exhausted |= spent;
                // A redirect ends a run of consecutive errors.
                next.observed_errors = 0;
                Error::TooManyRedirects
            }
            RetryCause::Status(status) => {
                entry.status = Some(status);
                next.observed_errors += 1;
                Error::ResponseStatus(status)
            }
        };

        next.history.push(entry);

        if exhausted {
            return Err(Error::MaxRetry {
                url: url.to_owned(),
                reason: Box::new(reason),
            });
        }

        debug!(url, retries = ?next, "incremented retry");
        Ok(next)
    }
}
