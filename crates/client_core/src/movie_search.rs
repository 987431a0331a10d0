use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use shared::protocol::{MovieSearchResponse, MovieSummary};
use tracing::debug;
use url::Url;

pub const DEFAULT_MOVIE_API_URL: &str = "https://api.themoviedb.org/3/";

/// Movie metadata lookup used when adding entries to a log. Results keep the
/// ranking of the upstream API.
#[async_trait]
pub trait MovieSearch: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<MovieSummary>>;
}

pub struct MissingMovieSearch;

#[async_trait]
impl MovieSearch for MissingMovieSearch {
    async fn search(&self, query: &str) -> Result<Vec<MovieSummary>> {
        Err(anyhow!(
            "movie search unavailable for query '{query}': no API key configured"
        ))
    }
}

#[derive(Serialize)]
struct SearchQuery<'a> {
    api_key: &'a str,
    query: &'a str,
    include_adult: bool,
}

pub struct HttpMovieSearch {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl HttpMovieSearch {
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self> {
        let mut base_url =
            Url::parse(base_url).with_context(|| format!("invalid movie API url '{base_url}'"))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            http: Client::new(),
            base_url,
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl MovieSearch for HttpMovieSearch {
    async fn search(&self, query: &str) -> Result<Vec<MovieSummary>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let url = self
            .base_url
            .join("search/movie")
            .context("failed to build movie search url")?;
        let response = self
            .http
            .get(url)
            .query(&SearchQuery {
                api_key: &self.api_key,
                query,
                include_adult: false,
            })
            .send()
            .await
            .context("movie search request failed")?
            .error_for_status()
            .context("movie search rejected")?;

        let body: MovieSearchResponse = response
            .json()
            .await
            .context("failed to decode movie search response")?;
        debug!(query, results = body.results.len(), "movie search completed");
        Ok(body.results)
    }
}

#[cfg(test)]
#[path = "tests/movie_search_tests.rs"]
mod tests;
