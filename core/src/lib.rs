//! Pooled HTTP client for a document-search server.
//!
//! # Overview
//! `SearchClient` exposes one method per HTTP verb (`get`, `put`, `post`,
//! `head`, `delete`) plus `search`, each a thin projection onto
//! `SearchClient::request`. Requests run over a `ConnectionPool` that rotates
//! round-robin across the configured endpoints and sits out endpoints that
//! fail.
//!
//! # Design
//! - Request building and response parsing are plain functions over
//!   `HttpRequest` / `HttpResponse`; only `Connection::perform` touches the
//!   network.
//! - A 404 is an empty reply, not an error. `HEAD` returns the status code.
//! - The search target (`index`, `type`) is per-client state, or passed
//!   explicitly to `search_in`.

pub mod client;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod http;
pub mod pool;
pub mod response;

pub use client::{Request, SearchClient, SearchTarget};
pub use config::{ClientConfig, PoolSettings};
pub use connection::{Connection, Connector, TransportError, UreqConnection, UreqConnector};
pub use endpoint::{Endpoint, EndpointError, Scheme};
pub use error::ClientError;
pub use http::{HttpMethod, HttpRequest, HttpResponse, Reply};
pub use pool::{ConnectionPool, PoolConfig, PoolError, PoolStats, PooledConnection};
pub use response::SearchResponse;
