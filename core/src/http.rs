//! HTTP transport types shared by the pool and the façade.
//!
//! # Design
//! Requests and responses are plain data. The façade builds `HttpRequest`
//! values, a pooled `Connection` turns them into `HttpResponse` values, and
//! the façade maps the response onto a `Reply`. Keeping the wire step behind
//! plain data lets tests script responses without opening sockets.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

/// HTTP verb for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Put,
    Post,
    Head,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Put => "PUT",
            HttpMethod::Post => "POST",
            HttpMethod::Head => "HEAD",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a verb string names none of the supported methods.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported HTTP method: {0}")]
pub struct UnknownMethod(pub String);

impl FromStr for HttpMethod {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "PUT" => Ok(HttpMethod::Put),
            "POST" => Ok(HttpMethod::Post),
            "HEAD" => Ok(HttpMethod::Head),
            "DELETE" => Ok(HttpMethod::Delete),
            _ => Err(UnknownMethod(s.to_string())),
        }
    }
}

/// An HTTP request described as plain data.
///
/// `path` is relative to the endpoint the request is sent to, e.g.
/// `/people/_doc/1`. `params` become the query string.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub params: Vec<(String, String)>,
    pub body: Option<String>,
}

/// An HTTP response described as plain data.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

/// What the façade hands back for a completed request.
///
/// `Empty` covers both "not found" and "nothing to decode"; callers must not
/// expect an error when the target does not exist.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Empty,
    /// Raw status code of a `HEAD` request.
    Status(u16),
    Document(Value),
}

impl Reply {
    pub fn into_document(self) -> Option<Value> {
        match self {
            Reply::Document(value) => Some(value),
            Reply::Empty | Reply::Status(_) => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Reply::Status(status) => Some(*status),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Reply::Empty)
    }
}
