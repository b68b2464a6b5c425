//! Typed view of a `_search` response body.
//!
//! Only the fields common to the 7.x and 8.x response shapes are mapped;
//! `_type` disappeared in 8.x and is optional here. Everything a
//! `filter_path`, `_source: false` or `track_total_hits: false` request can
//! strip is optional or defaulted.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse<T> {
    #[serde(default)]
    pub took: u64,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(rename = "_shards", default)]
    pub shards: Shards,
    #[serde(default = "Hits::empty")]
    pub hits: Hits<T>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shards {
    pub total: u64,
    pub successful: u64,
    #[serde(default)]
    pub skipped: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hits<T> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<HitsTotal>,
    #[serde(default)]
    pub max_score: Option<f64>,
    #[serde(default = "Vec::new")]
    pub hits: Vec<Hit<T>>,
}

impl<T> Hits<T> {
    pub fn empty() -> Self {
        Self {
            total: None,
            max_score: None,
            hits: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HitsTotal {
    pub value: u64,
    pub relation: TotalRelation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TotalRelation {
    #[serde(rename = "eq")]
    Exact,
    #[serde(rename = "gte")]
    LowerBound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hit<T> {
    #[serde(rename = "_index", default)]
    pub index: String,
    #[serde(rename = "_type", default, skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
    #[serde(rename = "_id", default)]
    pub id: String,
    #[serde(rename = "_score", default)]
    pub score: Option<f64>,
    #[serde(rename = "_source", skip_serializing_if = "Option::is_none")]
    pub source: Option<T>,
}

impl<T> SearchResponse<T> {
    /// The `_source` of every hit that carries one, in ranking order.
    pub fn sources(&self) -> impl Iterator<Item = &T> {
        self.hits.hits.iter().filter_map(|hit| hit.source.as_ref())
    }
}
