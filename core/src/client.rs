//! Request façade over the connection pool.
//!
//! # Design
//! Every call goes through `SearchClient::request`, which splits into the
//! same three steps: `build_request` turns a `Request` into an `HttpRequest`,
//! a pooled connection performs it, and `parse_response` maps the
//! `HttpResponse` onto a `Reply`. The connection is released before the body
//! is decoded.
//!
//! Two outcomes are permissive on purpose and are part of the contract:
//! - a 404 yields `Reply::Empty` (or `Reply::Status(404)` for `HEAD`),
//!   never an error;
//! - `search` with a verb other than GET or POST yields `Ok(None)`.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::connection::{Connector, UreqConnector};
use crate::endpoint::Endpoint;
use crate::error::ClientError;
use crate::http::{HttpMethod, HttpRequest, HttpResponse, Reply};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::response::SearchResponse;

const CONTENT_TYPE: &str = "content-type";
const APPLICATION_JSON: &str = "application/json";

/// One call to make through the façade.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: HttpMethod,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub params: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl Request {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: Vec::new(),
            params: Vec::new(),
            body: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn params<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.params
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// The `index`/`type` pair that `search` runs against.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchTarget {
    pub index: String,
    pub doc_type: String,
}

impl SearchTarget {
    pub fn new(index: impl Into<String>, doc_type: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            doc_type: doc_type.into(),
        }
    }

    /// `/<index>/<type>/_search`; empty segments are left out.
    pub fn search_path(&self) -> String {
        let mut path = String::new();
        for segment in [&self.index, &self.doc_type] {
            if !segment.is_empty() {
                path.push('/');
                path.push_str(segment);
            }
        }
        path.push_str("/_search");
        path
    }
}

/// Verb-per-method client for a document-search server.
pub struct SearchClient<C: Connector = UreqConnector> {
    pool: ConnectionPool<C>,
    default_headers: Vec<(String, String)>,
    target: SearchTarget,
}

impl SearchClient<UreqConnector> {
    pub fn new(endpoints: Vec<Endpoint>) -> Result<Self, ClientError> {
        Self::with_pool_config(endpoints, PoolConfig::default())
    }

    pub fn with_pool_config(endpoints: Vec<Endpoint>, config: PoolConfig) -> Result<Self, ClientError> {
        let connector = UreqConnector::new(config.connect_timeout, config.request_timeout);
        Self::with_connector(connector, endpoints, config)
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, ClientError> {
        let mut client = Self::with_pool_config(config.endpoints.clone(), config.pool.to_pool_config())?
            .with_target(config.index.clone(), config.doc_type.clone());
        for (name, value) in &config.headers {
            client = client.with_header(name.clone(), value.clone());
        }
        Ok(client)
    }
}

impl<C: Connector> SearchClient<C> {
    pub fn with_connector(connector: C, endpoints: Vec<Endpoint>, config: PoolConfig) -> Result<Self, ClientError> {
        Ok(Self {
            pool: ConnectionPool::new(connector, endpoints, config)?,
            default_headers: Vec::new(),
            target: SearchTarget::default(),
        })
    }

    pub fn with_target(mut self, index: impl Into<String>, doc_type: impl Into<String>) -> Self {
        self.target = SearchTarget::new(index, doc_type);
        self
    }

    /// Attach a header to every request, e.g. `Authorization`.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.push((name.into(), value.into()));
        self
    }

    pub fn target(&self) -> &SearchTarget {
        &self.target
    }

    pub fn pool(&self) -> &ConnectionPool<C> {
        &self.pool
    }

    pub fn build_request(&self, request: &Request) -> Result<HttpRequest, ClientError> {
        let mut headers: Vec<(String, String)> = Vec::new();
        for (name, value) in self.default_headers.iter().chain(&request.headers) {
            headers.retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
            headers.push((name.clone(), value.clone()));
        }

        let body = match &request.body {
            Some(value) => {
                let text =
                    serde_json::to_string(value).map_err(|e| ClientError::SerializationError(e.to_string()))?;
                if !headers.iter().any(|(name, _)| name.eq_ignore_ascii_case(CONTENT_TYPE)) {
                    headers.push((CONTENT_TYPE.to_string(), APPLICATION_JSON.to_string()));
                }
                Some(text)
            }
            None => None,
        };

        Ok(HttpRequest {
            method: request.method,
            path: request.path.clone(),
            headers,
            params: request.params.clone(),
            body,
        })
    }

    /// Send `request` over a pooled connection and decode the answer.
    pub fn request(&self, request: &Request) -> Result<Reply, ClientError> {
        let http_request = self.build_request(request)?;

        let mut conn = self.pool.acquire()?;
        let outcome = conn.perform(&http_request);
        self.pool.release(conn);

        let response = outcome?;
        debug!(
            method = %request.method,
            path = %request.path,
            status = response.status,
            "request completed"
        );
        parse_response(request.method, response)
    }

    pub fn get(&self, path: &str, params: &[(&str, &str)]) -> Result<Option<Value>, ClientError> {
        let request = Request::new(HttpMethod::Get, path).params(params.iter().copied());
        Ok(self.request(&request)?.into_document())
    }

    /// `PUT` with an optional body; `None` sends an empty body.
    pub fn put<T: Serialize + ?Sized>(&self, path: &str, body: Option<&T>) -> Result<Option<Value>, ClientError> {
        let request = with_body(Request::new(HttpMethod::Put, path), body)?;
        Ok(self.request(&request)?.into_document())
    }

    pub fn post<T: Serialize + ?Sized>(&self, path: &str, body: Option<&T>) -> Result<Option<Value>, ClientError> {
        let request = with_body(Request::new(HttpMethod::Post, path), body)?;
        Ok(self.request(&request)?.into_document())
    }

    pub fn delete(&self, path: &str, params: &[(&str, &str)]) -> Result<Option<Value>, ClientError> {
        let request = Request::new(HttpMethod::Delete, path).params(params.iter().copied());
        Ok(self.request(&request)?.into_document())
    }

    /// Raw status code of a `HEAD` request; 404 comes back as `Ok(404)`.
    pub fn head(&self, path: &str) -> Result<u16, ClientError> {
        match self.request(&Request::new(HttpMethod::Head, path))? {
            Reply::Status(status) => Ok(status),
            // parse_response always answers HEAD with a status.
            Reply::Empty | Reply::Document(_) => Ok(404),
        }
    }

    /// Search the client's own target. See `search_in`.
    pub fn search(&self, query: Option<&Value>, method: HttpMethod) -> Result<Option<Value>, ClientError> {
        self.search_in(&self.target, query, method)
    }

    /// Search `target`. GET sends `query` as URL parameters, POST as the
    /// body; any other verb is refused with `Ok(None)`.
    pub fn search_in(
        &self,
        target: &SearchTarget,
        query: Option<&Value>,
        method: HttpMethod,
    ) -> Result<Option<Value>, ClientError> {
        let mut request = Request::new(method, target.search_path());
        match method {
            HttpMethod::Get => {
                if let Some(query) = query {
                    request = request.params(query_params(query)?);
                }
            }
            HttpMethod::Post => {
                if let Some(query) = query {
                    request = request.body(query.clone());
                }
            }
            other => {
                warn!(method = %other, "search only supports GET and POST");
                return Ok(None);
            }
        }
        Ok(self.request(&request)?.into_document())
    }

    /// POST `query` to the client's target and decode the hits as `T`.
    pub fn search_hits<T: DeserializeOwned>(&self, query: &Value) -> Result<Option<SearchResponse<T>>, ClientError> {
        match self.search(Some(query), HttpMethod::Post)? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| ClientError::DeserializationError(e.to_string())),
            None => Ok(None),
        }
    }
}

/// Map a response onto a `Reply`.
///
/// `HEAD` yields the status for 2xx and 404. Otherwise 2xx decodes the body
/// (an empty body is `Empty`), 404 is `Empty`, anything else is an error.
pub fn parse_response(method: HttpMethod, response: HttpResponse) -> Result<Reply, ClientError> {
    match (method, response.status) {
        (HttpMethod::Head, status @ (200..=299 | 404)) => Ok(Reply::Status(status)),
        (_, 404) => Ok(Reply::Empty),
        (_, 200..=299) if response.body.trim().is_empty() => Ok(Reply::Empty),
        (_, 200..=299) => serde_json::from_str(&response.body)
            .map(Reply::Document)
            .map_err(|e| ClientError::DeserializationError(e.to_string())),
        (_, status) => Err(ClientError::HttpError {
            status,
            body: response.body,
        }),
    }
}

/// Flatten a query into URL parameters for a GET search.
///
/// A string becomes `q`. An object of scalars (or arrays of scalars) maps
/// key by key, arrays comma-joined. Anything nested is sent whole as a JSON
/// `source` parameter.
pub fn query_params(query: &Value) -> Result<Vec<(String, String)>, ClientError> {
    match query {
        Value::Null => Ok(Vec::new()),
        Value::String(q) => Ok(vec![("q".to_string(), q.clone())]),
        Value::Object(map) if map.values().all(is_flat) => Ok(map
            .iter()
            .map(|(key, value)| (key.clone(), param_value(value)))
            .collect()),
        _ => {
            let source = serde_json::to_string(query).map_err(|e| ClientError::SerializationError(e.to_string()))?;
            Ok(vec![
                ("source".to_string(), source),
                ("source_content_type".to_string(), APPLICATION_JSON.to_string()),
            ])
        }
    }
}

fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

fn is_flat(value: &Value) -> bool {
    match value {
        Value::Array(items) => items.iter().all(is_scalar),
        other => is_scalar(other),
    }
}

fn param_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(param_value).collect::<Vec<_>>().join(","),
        other => other.to_string(),
    }
}

fn with_body<T: Serialize + ?Sized>(request: Request, body: Option<&T>) -> Result<Request, ClientError> {
    match body {
        Some(body) => {
            let body = serde_json::to_value(body).map_err(|e| ClientError::SerializationError(e.to_string()))?;
            Ok(request.body(body))
        }
        None => Ok(request),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;
    use crate::connection::{Connection, TransportError};

    /// Answers every request with a fixed outcome and records what it saw.
    #[derive(Clone)]
    struct ScriptedConnector {
        outcome: Result<HttpResponse, TransportError>,
        seen: Arc<Mutex<Vec<HttpRequest>>>,
    }

    struct ScriptedConnection {
        endpoint: Endpoint,
        outcome: Result<HttpResponse, TransportError>,
        seen: Arc<Mutex<Vec<HttpRequest>>>,
    }

    impl Connector for ScriptedConnector {
        type Conn = ScriptedConnection;

        fn connect(&self, endpoint: &Endpoint) -> Result<ScriptedConnection, TransportError> {
            Ok(ScriptedConnection {
                endpoint: endpoint.clone(),
                outcome: self.outcome.clone(),
                seen: Arc::clone(&self.seen),
            })
        }
    }

    impl Connection for ScriptedConnection {
        fn endpoint(&self) -> &Endpoint {
            &self.endpoint
        }

        fn perform(&mut self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
            self.seen.lock().unwrap().push(request.clone());
            self.outcome.clone()
        }
    }

    fn respond(status: u16, body: &str) -> Result<HttpResponse, TransportError> {
        Ok(HttpResponse {
            status,
            headers: Vec::new(),
            body: body.to_string(),
        })
    }

    fn client(outcome: Result<HttpResponse, TransportError>) -> (SearchClient<ScriptedConnector>, Arc<Mutex<Vec<HttpRequest>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let connector = ScriptedConnector {
            outcome,
            seen: Arc::clone(&seen),
        };
        let endpoints = vec![Endpoint::http("localhost", 9200).unwrap()];
        let client = SearchClient::with_connector(connector, endpoints, PoolConfig::default())
            .unwrap()
            .with_target("people", "_doc");
        (client, seen)
    }

    fn last_request(seen: &Arc<Mutex<Vec<HttpRequest>>>) -> HttpRequest {
        seen.lock().unwrap().last().cloned().unwrap()
    }

    #[test]
    fn get_decodes_json_body() {
        let (client, seen) = client(respond(200, r#"{"name":"Zhao Yun","age":25}"#));
        let doc = client.get("/people/_doc/1", &[("pretty", "true")]).unwrap();
        assert_eq!(doc, Some(json!({"name": "Zhao Yun", "age": 25})));

        let req = last_request(&seen);
        assert_eq!(req.method, HttpMethod::Get);
        assert_eq!(req.path, "/people/_doc/1");
        assert_eq!(req.params, vec![("pretty".to_string(), "true".to_string())]);
        assert!(req.body.is_none());
        assert!(req.headers.is_empty());
    }

    #[test]
    fn put_serializes_body_with_json_content_type() {
        let (client, seen) = client(respond(201, r#"{"result":"created"}"#));
        client.put("/people/_doc/1", Some(&json!({"name": "Zhao Yun"}))).unwrap();

        let req = last_request(&seen);
        assert_eq!(req.method, HttpMethod::Put);
        assert_eq!(
            req.headers,
            vec![("content-type".to_string(), "application/json".to_string())]
        );
        let body: Value = serde_json::from_str(req.body.as_deref().unwrap()).unwrap();
        assert_eq!(body, json!({"name": "Zhao Yun"}));
    }

    #[test]
    fn bodyless_put_and_delete_with_params() {
        let (client, seen) = client(respond(200, r#"{"acknowledged":true}"#));
        client.put("/people", None::<&Value>).unwrap();
        let req = last_request(&seen);
        assert_eq!(req.method, HttpMethod::Put);
        assert!(req.body.is_none());
        assert!(req.headers.is_empty());

        client.post("/people/_refresh", None::<&Value>).unwrap();
        assert!(last_request(&seen).body.is_none());

        client.delete("/people/_doc/1", &[("refresh", "true")]).unwrap();
        let req = last_request(&seen);
        assert_eq!(req.method, HttpMethod::Delete);
        assert_eq!(req.params, vec![("refresh".to_string(), "true".to_string())]);
    }

    #[test]
    fn not_found_is_empty_for_every_verb_but_head() {
        let (client, _) = client(respond(404, r#"{"found":false}"#));
        assert_eq!(client.get("/people/_doc/9", &[]).unwrap(), None);
        assert_eq!(client.put("/people/_doc/9", Some(&json!({}))).unwrap(), None);
        assert_eq!(client.post("/people/_doc/9", Some(&json!({}))).unwrap(), None);
        assert_eq!(client.delete("/people/_doc/9", &[]).unwrap(), None);
        assert_eq!(client.head("/people/_doc/9").unwrap(), 404);
        let reply = client.request(&Request::new(HttpMethod::Get, "/missing")).unwrap();
        assert_eq!(reply, Reply::Empty);
    }

    #[test]
    fn head_returns_status_without_decoding() {
        let (client, _) = client(respond(200, "not json at all"));
        assert_eq!(client.head("/people").unwrap(), 200);
    }

    #[test]
    fn server_error_propagates() {
        let (client, _) = client(respond(500, "boom"));
        let err = client.get("/people", &[]).unwrap_err();
        assert!(matches!(err, ClientError::HttpError { status: 500, .. }));
        let err = client.head("/people").unwrap_err();
        assert!(matches!(err, ClientError::HttpError { status: 500, .. }));
    }

    #[test]
    fn malformed_body_is_a_deserialization_error() {
        let (client, _) = client(respond(200, "{not json"));
        let err = client.get("/people", &[]).unwrap_err();
        assert!(matches!(err, ClientError::DeserializationError(_)));
    }

    #[test]
    fn empty_success_body_is_empty_reply() {
        let (client, _) = client(respond(200, ""));
        assert_eq!(client.delete("/people", &[]).unwrap(), None);
    }

    #[test]
    fn transport_failure_propagates_and_still_releases() {
        let ep = Endpoint::http("localhost", 9200).unwrap();
        let (client, _) = client(Err(TransportError::connect(&ep, "refused")));

        let err = client.get("/people", &[]).unwrap_err();
        assert!(matches!(err, ClientError::Transport(_)));

        let stats = client.pool().stats();
        assert_eq!(stats.total_acquired, 1);
        assert_eq!(stats.total_released, 1);
        assert_eq!(stats.in_use, 0);
    }

    #[test]
    fn every_verb_releases_its_connection_once() {
        for status in [200, 404, 500] {
            let (client, _) = client(respond(status, "{}"));
            let _ = client.get("/p", &[]);
            let _ = client.put("/p", Some(&json!({})));
            let _ = client.post("/p", Some(&json!({})));
            let _ = client.head("/p");
            let _ = client.delete("/p", &[]);

            let stats = client.pool().stats();
            assert_eq!(stats.total_acquired, 5, "status {status}");
            assert_eq!(stats.total_released, 5, "status {status}");
            assert_eq!(stats.in_use, 0, "status {status}");
        }
    }

    #[test]
    fn search_get_sends_query_as_params() {
        let (client, seen) = client(respond(200, r#"{"hits":{}}"#));
        let query = json!({"q": "name:Zhao", "size": 2});
        client.search(Some(&query), HttpMethod::Get).unwrap();

        let req = last_request(&seen);
        assert_eq!(req.method, HttpMethod::Get);
        assert_eq!(req.path, "/people/_doc/_search");
        assert!(req.body.is_none());
        assert!(req.params.contains(&("q".to_string(), "name:Zhao".to_string())));
        assert!(req.params.contains(&("size".to_string(), "2".to_string())));
    }

    #[test]
    fn search_post_sends_query_as_body() {
        let (client, seen) = client(respond(200, r#"{"hits":{}}"#));
        let query = json!({"query": {"match": {"name": "Liu"}}, "size": 20});
        client.search(Some(&query), HttpMethod::Post).unwrap();

        let req = last_request(&seen);
        assert_eq!(req.method, HttpMethod::Post);
        assert_eq!(req.path, "/people/_doc/_search");
        assert!(req.params.is_empty());
        let body: Value = serde_json::from_str(req.body.as_deref().unwrap()).unwrap();
        assert_eq!(body, query);
    }

    #[test]
    fn search_rejects_other_verbs_without_sending() {
        let (client, seen) = client(respond(200, "{}"));
        for method in [HttpMethod::Put, HttpMethod::Delete, HttpMethod::Head] {
            assert_eq!(client.search(None, method).unwrap(), None);
        }
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(client.pool().stats().total_acquired, 0);
    }

    #[test]
    fn search_in_uses_explicit_target() {
        let (client, seen) = client(respond(200, "{}"));
        client
            .search_in(&SearchTarget::new("cities", ""), None, HttpMethod::Get)
            .unwrap();
        assert_eq!(last_request(&seen).path, "/cities/_search");
    }

    #[test]
    fn search_hits_decodes_typed_response() {
        let body = r#"{"took":1,"timed_out":false,
            "_shards":{"total":1,"successful":1,"skipped":0,"failed":0},
            "hits":{"total":{"value":1,"relation":"eq"},"max_score":1.0,
                "hits":[{"_index":"people","_id":"1","_score":1.0,"_source":{"name":"Zhao Yun"}}]}}"#;
        let (client, _) = client(respond(200, body));
        let response = client
            .search_hits::<Value>(&json!({"query": {"match_all": {}}}))
            .unwrap()
            .unwrap();
        assert_eq!(response.hits.hits[0].id, "1");
        assert_eq!(response.hits.hits[0].source, Some(json!({"name": "Zhao Yun"})));
    }

    #[test]
    fn request_headers_override_defaults() {
        let (client, seen) = client(respond(200, "{}"));
        let client = client
            .with_header("Authorization", "Basic abc")
            .with_header("X-Opaque-Id", "default");
        let request = Request::new(HttpMethod::Get, "/").header("x-opaque-id", "call");
        client.request(&request).unwrap();

        let req = last_request(&seen);
        assert_eq!(
            req.headers,
            vec![
                ("Authorization".to_string(), "Basic abc".to_string()),
                ("x-opaque-id".to_string(), "call".to_string()),
            ]
        );
    }

    #[test]
    fn search_path_skips_empty_segments() {
        assert_eq!(SearchTarget::new("a", "b").search_path(), "/a/b/_search");
        assert_eq!(SearchTarget::new("a", "").search_path(), "/a/_search");
        assert_eq!(SearchTarget::default().search_path(), "/_search");
    }

    #[test]
    fn query_params_flatten_scalars() {
        let params = query_params(&json!({"from": 0, "size": 2, "_source": ["name", "age"], "explain": true})).unwrap();
        assert_eq!(
            params,
            vec![
                ("_source".to_string(), "name,age".to_string()),
                ("explain".to_string(), "true".to_string()),
                ("from".to_string(), "0".to_string()),
                ("size".to_string(), "2".to_string()),
            ]
        );
        assert_eq!(
            query_params(&json!("name:Zhao")).unwrap(),
            vec![("q".to_string(), "name:Zhao".to_string())]
        );
        assert!(query_params(&Value::Null).unwrap().is_empty());
    }

    #[test]
    fn query_params_send_nested_queries_as_source() {
        let query = json!({"query": {"term": {"name.keyword": "Liu Chan"}}});
        let params = query_params(&query).unwrap();
        assert_eq!(params[0].0, "source");
        let source: Value = serde_json::from_str(&params[0].1).unwrap();
        assert_eq!(source, query);
        assert_eq!(
            params[1],
            ("source_content_type".to_string(), "application/json".to_string())
        );
    }
}
