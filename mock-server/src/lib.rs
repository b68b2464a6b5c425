use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::RwLock};
use tracing::debug;
use uuid::Uuid;

/// Stored documents keyed by their full path, e.g. `/people/_doc/1`.
pub type Db = Arc<RwLock<BTreeMap<String, Value>>>;

const DEFAULT_SIZE: usize = 10;

pub fn app() -> Router {
    app_with_db(Db::default())
}

pub fn app_with_db(db: Db) -> Router {
    Router::new()
        .route("/_search", get(search).post(search))
        .route("/{index}/_search", get(search).post(search))
        .route("/{index}/{doc_type}/_search", get(search).post(search))
        .fallback(document)
        .with_state(db)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

async fn document(State(db): State<Db>, method: Method, uri: Uri, body: Bytes) -> Response {
    let path = uri.path().trim_end_matches('/').to_string();
    debug!(%method, %path, "document request");

    if path.is_empty() {
        return match method {
            Method::GET => Json(json!({"name": "mock-server", "tagline": "You Know, for Search"})).into_response(),
            Method::HEAD => StatusCode::OK.into_response(),
            _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
        };
    }

    match method {
        Method::GET => match db.read().await.get(&path) {
            Some(doc) => Json(doc.clone()).into_response(),
            None => not_found(),
        },
        Method::HEAD => {
            if db.read().await.contains_key(&path) {
                StatusCode::OK.into_response()
            } else {
                StatusCode::NOT_FOUND.into_response()
            }
        }
        Method::PUT | Method::POST => {
            let doc: Value = match serde_json::from_slice(&body) {
                Ok(doc) => doc,
                Err(e) => return bad_request(&e.to_string()),
            };
            // POST on a collection lets the server pick the id.
            let path = if method == Method::POST && segments(&path).len() == 2 {
                format!("{path}/{}", Uuid::new_v4())
            } else {
                path
            };
            let created = db.write().await.insert(path.clone(), doc).is_none();
            let (status, result) = if created {
                (StatusCode::CREATED, "created")
            } else {
                (StatusCode::OK, "updated")
            };
            (status, Json(json!({"_id": last_segment(&path), "result": result}))).into_response()
        }
        Method::DELETE => match db.write().await.remove(&path) {
            Some(_) => Json(json!({"_id": last_segment(&path), "result": "deleted"})).into_response(),
            None => not_found(),
        },
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

async fn search(
    State(db): State<Db>,
    uri: Uri,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let prefix = uri.path().trim_end_matches("/_search").to_string();

    let query: Value = if !body.is_empty() {
        match serde_json::from_slice(&body) {
            Ok(query) => query,
            Err(e) => return bad_request(&e.to_string()),
        }
    } else if let Some(source) = params.get("source") {
        match serde_json::from_str(source) {
            Ok(query) => query,
            Err(e) => return bad_request(&e.to_string()),
        }
    } else {
        Value::Null
    };

    let docs = db.read().await;
    let scope = format!("{prefix}/");
    if !prefix.is_empty() && !docs.keys().any(|path| *path == prefix || path.starts_with(&scope)) {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": {"type": "index_not_found_exception"}, "status": 404})),
        )
            .into_response();
    }

    let matching: Vec<(&String, &Value)> = docs
        .iter()
        .filter(|(path, _)| path.starts_with(&scope) && segments(path).len() >= 3)
        .filter(|(_, doc)| matches_query(doc, &query, &params))
        .collect();

    let from = page_value(&query, &params, "from").unwrap_or(0);
    let size = page_value(&query, &params, "size").unwrap_or(DEFAULT_SIZE);
    let hits: Vec<Value> = matching
        .iter()
        .skip(from)
        .take(size)
        .map(|(path, doc)| hit(path, doc))
        .collect();
    let max_score = if hits.is_empty() { Value::Null } else { json!(1.0) };

    Json(json!({
        "took": 0,
        "timed_out": false,
        "_shards": {"total": 1, "successful": 1, "skipped": 0, "failed": 0},
        "hits": {
            "total": {"value": matching.len(), "relation": "eq"},
            "max_score": max_score,
            "hits": hits,
        }
    }))
    .into_response()
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({"found": false}))).into_response()
}

fn bad_request(reason: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": reason, "status": 400}))).into_response()
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn last_segment(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or_default()
}

/// Shape a stored document as a search hit.
fn hit(path: &str, doc: &Value) -> Value {
    let parts = segments(path);
    json!({
        "_index": parts[0],
        "_type": parts[1],
        "_id": parts[parts.len() - 1],
        "_score": 1.0,
        "_source": doc,
    })
}

/// `from`/`size` from the query body, falling back to URL parameters.
fn page_value(query: &Value, params: &HashMap<String, String>, key: &str) -> Option<usize> {
    query
        .get(key)
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .or_else(|| params.get(key).and_then(|v| v.parse().ok()))
}

/// Supports `q=field:value` and `{"query": {"term": {field: value}}}`
/// as exact matches on top-level fields; every other query matches all.
fn matches_query(doc: &Value, query: &Value, params: &HashMap<String, String>) -> bool {
    if let Some((field, expected)) = params.get("q").and_then(|q| q.split_once(':')) {
        return doc.get(field).is_some_and(|actual| render(actual) == expected);
    }
    if let Some(term) = query.pointer("/query/term").and_then(Value::as_object) {
        return term.iter().all(|(field, expected)| {
            let field = field.trim_end_matches(".keyword");
            let expected = expected.get("value").unwrap_or(expected);
            doc.get(field) == Some(expected)
        });
    }
    true
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
