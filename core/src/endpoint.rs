//! Server addresses the pool may connect to.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 9200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    #[error("endpoint has an empty host")]
    EmptyHost,

    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid port: {0}")]
    InvalidPort(String),

    #[error("invalid host: {0}")]
    InvalidHost(String),
}

/// A single server address. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "EndpointRepr")]
pub struct Endpoint {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl Endpoint {
    /// `host` may be an IPv6 literal, with or without brackets.
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Result<Self, EndpointError> {
        let host = host.into();
        let host = match host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
            Some(inner) => inner.to_string(),
            None => host,
        };
        if host.trim().is_empty() {
            return Err(EndpointError::EmptyHost);
        }
        Ok(Self { scheme, host, port })
    }

    pub fn http(host: impl Into<String>, port: u16) -> Result<Self, EndpointError> {
        Self::new(Scheme::Http, host, port)
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `scheme://host:port`, without a trailing slash. IPv6 hosts are
    /// bracketed.
    pub fn base_url(&self) -> String {
        if self.host.contains(':') {
            format!("{}://[{}]:{}", self.scheme.as_str(), self.host, self.port)
        } else {
            format!("{}://{}:{}", self.scheme.as_str(), self.host, self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base_url())
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    /// Accepts `host`, `host:port` and `scheme://host[:port][/]`. An IPv6
    /// host needs brackets to carry a port (`[::1]:9200`); a bare `::1`
    /// takes the default port.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (scheme, rest) = match s.split_once("://") {
            Some(("http", rest)) => (Scheme::Http, rest),
            Some(("https", rest)) => (Scheme::Https, rest),
            Some((other, _)) => return Err(EndpointError::UnsupportedScheme(other.to_string())),
            None => (Scheme::Http, s),
        };
        let authority = rest.trim_end_matches('/');
        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| EndpointError::InvalidHost(authority.to_string()))?;
            match tail {
                "" => (host, None),
                _ => match tail.strip_prefix(':') {
                    Some(port) => (host, Some(port)),
                    None => return Err(EndpointError::InvalidHost(authority.to_string())),
                },
            }
        } else if authority.matches(':').count() > 1 {
            (authority, None)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };
        let port = match port {
            Some(port) => port
                .parse::<u16>()
                .map_err(|_| EndpointError::InvalidPort(port.to_string()))?,
            None => DEFAULT_PORT,
        };
        Endpoint::new(scheme, host, port)
    }
}

/// Serialized forms: either a URL-ish string or a table.
#[derive(Deserialize)]
#[serde(untagged)]
enum EndpointRepr {
    Url(String),
    Parts {
        host: String,
        #[serde(default = "default_port")]
        port: u16,
        #[serde(default)]
        scheme: Scheme,
    },
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl TryFrom<EndpointRepr> for Endpoint {
    type Error = EndpointError;

    fn try_from(repr: EndpointRepr) -> Result<Self, Self::Error> {
        match repr {
            EndpointRepr::Url(url) => url.parse(),
            EndpointRepr::Parts { host, port, scheme } => Endpoint::new(scheme, host, port),
        }
    }
}
