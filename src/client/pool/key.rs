use std::{fmt, str::FromStr};

use url::Url;

use crate::client::Error;

/// URL scheme supported by the pools.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum Scheme {
    /// Plain HTTP.
    Http,
    /// HTTP over TLS.
    Https,
}

impl Scheme {
    /// The port used when a URL does not name one.
    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    /// The scheme as it appears in a URL.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("http") {
            Ok(Scheme::Http)
        } else if s.eq_ignore_ascii_case("https") {
            Ok(Scheme::Https)
        } else {
            Err(Error::LocationValue(format!("unsupported scheme: {s}")))
        }
    }
}

/// Pool key: scheme, host and port.
///
/// Hosts are stored lowercase and the port is always explicit, so two destinations
/// compare equal exactly when they would be served by the same pool.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct Destination {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl Destination {
    /// Build a destination from its parts. `port` defaults to the scheme's port.
    pub fn new(scheme: Scheme, host: &str, port: Option<u16>) -> Result<Self, Error> {
        if host.is_empty() {
            return Err(Error::LocationValue("empty host".into()));
        }
        Ok(Self {
            scheme,
            host: host.to_ascii_lowercase(),
            port: port.unwrap_or_else(|| scheme.default_port()),
        })
    }

    /// Destination for an absolute URL.
    pub fn from_url(url: &Url) -> Result<Self, Error> {
        let scheme: Scheme = url.scheme().parse()?;
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| Error::LocationValue(url.to_string()))?;
        Self::new(scheme, host, url.port())
    }

    /// The scheme.
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// The host, with IPv6 literals in brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The host in the form used for DNS lookup and TLS server names.
    pub fn hostname(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }

    /// The port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Value for the `Host` header: the port is omitted when it is the default.
    pub fn host_header(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.host.clone()
        } else {
            self.authority()
        }
    }

    /// `host:port`, as used by `CONNECT`.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

impl TryFrom<&Url> for Destination {
    type Error = Error;

    fn try_from(value: &Url) -> Result<Self, Self::Error> {
        Destination::from_url(value)
    }
}

impl FromStr for Destination {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(s).map_err(|error| Error::LocationValue(format!("{s}: {error}")))?;
        Destination::from_url(&url)
    }
}
