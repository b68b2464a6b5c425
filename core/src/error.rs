//! Error types surfaced by `SearchClient`.
//!
//! # Design
//! "Not found" is deliberately absent: a 404 is recovered inside the façade
//! and handed back as an empty reply. Everything here is a real failure the
//! caller has to deal with, and none of it is retried.

use crate::connection::TransportError;
use crate::pool::PoolError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// No connection could be checked out.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// The request never produced an HTTP response.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The server answered with a non-2xx status other than 404.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// The response body was not valid JSON.
    #[error("deserialization failed: {0}")]
    DeserializationError(String),

    /// The request body could not be serialized to JSON.
    #[error("serialization failed: {0}")]
    SerializationError(String),
}
