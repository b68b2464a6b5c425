//! Transport seam between the pool and the network.
//!
//! # Design
//! The pool only knows about `Connector` (opens connections to an endpoint)
//! and `Connection` (executes one `HttpRequest`). The production
//! implementation wraps a single-socket `ureq::Agent` per pooled connection;
//! tests plug in scripted connectors instead.

use std::time::Duration;

use tracing::debug;

use crate::endpoint::Endpoint;
use crate::http::{HttpMethod, HttpRequest, HttpResponse};

/// Failures below the HTTP status layer. Always propagated, never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection to {endpoint} failed: {message}")]
    Connect { endpoint: String, message: String },

    #[error("request to {endpoint} timed out: {message}")]
    Timeout { endpoint: String, message: String },

    #[error("malformed response from {endpoint}: {message}")]
    Protocol { endpoint: String, message: String },
}

impl TransportError {
    pub fn connect(endpoint: &Endpoint, message: impl Into<String>) -> Self {
        TransportError::Connect {
            endpoint: endpoint.to_string(),
            message: message.into(),
        }
    }

    pub fn timeout(endpoint: &Endpoint, message: impl Into<String>) -> Self {
        TransportError::Timeout {
            endpoint: endpoint.to_string(),
            message: message.into(),
        }
    }

    pub fn protocol(endpoint: &Endpoint, message: impl Into<String>) -> Self {
        TransportError::Protocol {
            endpoint: endpoint.to_string(),
            message: message.into(),
        }
    }

    fn from_ureq(endpoint: &Endpoint, err: ureq::Error) -> Self {
        match err {
            ureq::Error::Timeout(_) => TransportError::timeout(endpoint, err.to_string()),
            ureq::Error::ConnectionFailed | ureq::Error::HostNotFound | ureq::Error::Io(_) => {
                TransportError::connect(endpoint, err.to_string())
            }
            other => TransportError::protocol(endpoint, other.to_string()),
        }
    }
}

/// A live handle bound to one endpoint.
pub trait Connection: Send {
    fn endpoint(&self) -> &Endpoint;

    fn perform(&mut self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Opens connections on behalf of the pool.
pub trait Connector: Send + Sync {
    type Conn: Connection;

    fn connect(&self, endpoint: &Endpoint) -> Result<Self::Conn, TransportError>;
}

/// Opens `UreqConnection`s.
#[derive(Debug, Clone)]
pub struct UreqConnector {
    connect_timeout: Duration,
    request_timeout: Option<Duration>,
}

impl UreqConnector {
    pub fn new(connect_timeout: Duration, request_timeout: Option<Duration>) -> Self {
        Self {
            connect_timeout,
            request_timeout,
        }
    }
}

impl Connector for UreqConnector {
    type Conn = UreqConnection;

    fn connect(&self, endpoint: &Endpoint) -> Result<UreqConnection, TransportError> {
        // Status codes come back as data so the façade decides what 404 means.
        let agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_connect(Some(self.connect_timeout))
            .timeout_global(self.request_timeout)
            .max_idle_connections(1)
            .max_idle_connections_per_host(1)
            .build()
            .new_agent();

        Ok(UreqConnection {
            endpoint: endpoint.clone(),
            base_url: endpoint.base_url(),
            agent,
        })
    }
}

/// One kept-alive socket to an endpoint, driven by `ureq`.
pub struct UreqConnection {
    endpoint: Endpoint,
    base_url: String,
    agent: ureq::Agent,
}

impl Connection for UreqConnection {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn perform(&mut self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let url = format!("{}{}", self.base_url, request.path);
        debug!(endpoint = %self.endpoint, method = %request.method, path = %request.path, "sending request");

        let result = match (request.method, request.body.as_deref()) {
            (HttpMethod::Get, None) => decorate(self.agent.get(&url), request).call(),
            (HttpMethod::Get, Some(body)) => decorate(self.agent.get(&url), request)
                .force_send_body()
                .send(body.as_bytes()),
            (HttpMethod::Head, _) => decorate(self.agent.head(&url), request).call(),
            (HttpMethod::Delete, None) => decorate(self.agent.delete(&url), request).call(),
            (HttpMethod::Delete, Some(body)) => decorate(self.agent.delete(&url), request)
                .force_send_body()
                .send(body.as_bytes()),
            (HttpMethod::Post, Some(body)) => decorate(self.agent.post(&url), request).send(body.as_bytes()),
            (HttpMethod::Post, None) => decorate(self.agent.post(&url), request).send_empty(),
            (HttpMethod::Put, Some(body)) => decorate(self.agent.put(&url), request).send(body.as_bytes()),
            (HttpMethod::Put, None) => decorate(self.agent.put(&url), request).send_empty(),
        };
        let mut response = result.map_err(|e| TransportError::from_ureq(&self.endpoint, e))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let body = if request.method == HttpMethod::Head {
            String::new()
        } else {
            // ureq caps bodies at 10 MiB unless told otherwise.
            response
                .body_mut()
                .with_config()
                .limit(u64::MAX)
                .read_to_string()
                .map_err(|e| TransportError::from_ureq(&self.endpoint, e))?
        };

        Ok(HttpResponse { status, headers, body })
    }
}

fn decorate<B>(mut builder: ureq::RequestBuilder<B>, request: &HttpRequest) -> ureq::RequestBuilder<B> {
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    for (key, value) in &request.params {
        builder = builder.query(key.as_str(), value.as_str());
    }
    builder
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_messages_name_the_endpoint() {
        let ep = Endpoint::http("localhost", 9200).unwrap();
        let err = TransportError::connect(&ep, "refused");
        assert_eq!(err.to_string(), "connection to http://localhost:9200 failed: refused");
        let err = TransportError::timeout(&ep, "read");
        assert_eq!(err.to_string(), "request to http://localhost:9200 timed out: read");
    }

    #[test]
    fn ureq_connector_binds_connection_to_endpoint() {
        let ep = Endpoint::http("127.0.0.1", 1).unwrap();
        let connector = UreqConnector::new(Duration::from_millis(50), None);
        let conn = connector.connect(&ep).unwrap();
        assert_eq!(conn.endpoint(), &ep);
    }

    #[test]
    fn refused_connection_is_a_transport_error() {
        // Port 1 on loopback is never listening in test environments.
        let ep = Endpoint::http("127.0.0.1", 1).unwrap();
        let connector = UreqConnector::new(Duration::from_millis(200), Some(Duration::from_secs(2)));
        let mut conn = connector.connect(&ep).unwrap();
        let request = HttpRequest {
            method: HttpMethod::Get,
            path: "/".to_string(),
            headers: Vec::new(),
            params: Vec::new(),
            body: None,
        };
        assert!(conn.perform(&request).is_err());
    }
}
