use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{LogId, Visibility};

/// One movie as returned by the metadata search API. Fields beyond these are
/// ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovieSummary {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub popularity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poster_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overview: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MovieSearchResponse {
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub results: Vec<MovieSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSummary {
    pub log_id: LogId,
    pub name: String,
    #[serde(default)]
    pub visibility: Visibility,
    pub seq: u64,
    pub entry_count: usize,
    pub updated_at: DateTime<Utc>,
}
