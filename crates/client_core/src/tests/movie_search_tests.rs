use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use super::*;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;

#[derive(Clone, Default)]
struct SearchServerState {
    queries: Arc<Mutex<Vec<HashMap<String, String>>>>,
}

async fn handle_search(
    State(state): State<SearchServerState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, StatusCode> {
    state
        .queries
        .lock()
        .expect("queries lock")
        .push(params.clone());
    if params.get("api_key").map(String::as_str) != Some("test-key") {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(Json(json!({
        "page": 1,
        "results": [
            {
                "id": 603,
                "title": "The Matrix",
                "popularity": 81.5,
                "poster_path": "/matrix.jpg",
                "release_date": "1999-03-30",
                "overview": "A hacker learns the truth."
            },
            {
                "id": 604,
                "title": "The Matrix Reloaded",
                "popularity": 40.25,
                "poster_path": null
            }
        ]
    })))
}

async fn spawn_search_server() -> anyhow::Result<(String, SearchServerState)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = SearchServerState::default();
    let app = Router::new()
        .route("/3/search/movie", get(handle_search))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}/3"), state))
}

#[tokio::test]
async fn search_returns_results_in_api_order() {
    let (base_url, state) = spawn_search_server().await.expect("server");
    let search = HttpMovieSearch::new(&base_url, "test-key").expect("client");

    let results = search.search("  matrix ").await.expect("search");

    let titles: Vec<&str> = results.iter().map(|movie| movie.title.as_str()).collect();
    assert_eq!(titles, ["The Matrix", "The Matrix Reloaded"]);
    assert_eq!(results[0].id, 603);
    assert_eq!(results[0].release_date.as_deref(), Some("1999-03-30"));
    assert_eq!(results[1].poster_path, None);
    assert_eq!(results[1].overview, None);

    let queries = state.queries.lock().expect("queries lock");
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].get("query").map(String::as_str), Some("matrix"));
    assert_eq!(
        queries[0].get("include_adult").map(String::as_str),
        Some("false")
    );
}

#[tokio::test]
async fn blank_query_skips_the_request() {
    let (base_url, state) = spawn_search_server().await.expect("server");
    let search = HttpMovieSearch::new(&base_url, "test-key").expect("client");

    let results = search.search("   ").await.expect("search");

    assert!(results.is_empty());
    assert!(state.queries.lock().expect("queries lock").is_empty());
}

#[tokio::test]
async fn rejected_request_is_an_error() {
    let (base_url, _state) = spawn_search_server().await.expect("server");
    let search = HttpMovieSearch::new(&base_url, "wrong-key").expect("client");

    let error = search.search("matrix").await.expect_err("unauthorized");

    assert!(error.to_string().contains("rejected"));
}

#[tokio::test]
async fn missing_search_reports_configuration() {
    let error = MissingMovieSearch
        .search("matrix")
        .await
        .expect_err("no api key");

    assert!(error.to_string().contains("no API key"));
}

#[test]
fn invalid_base_url_is_rejected() {
    assert!(HttpMovieSearch::new("not a url", "key").is_err());
}
