use super::tweet::{compare_ids, PayloadError, Tweet};
use super::{Fetch, SourceError, TweetSource};
use crate::config::types::TwitterSourceConfig;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

const SEARCH_PATH: &str = "/2/tweets/search/recent";

#[derive(Debug, Default, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Option<Vec<Value>>,
    #[serde(default)]
    includes: Option<Includes>,
    #[serde(default)]
    meta: Option<Meta>,
}

#[derive(Debug, Default, Deserialize)]
struct Includes {
    #[serde(default)]
    users: Vec<User>,
}

#[derive(Debug, Deserialize)]
struct User {
    id: String,
    username: String,
}

#[derive(Debug, Default, Deserialize)]
struct Meta {
    next_token: Option<String>,
    #[serde(default)]
    result_count: u32,
}

/// A `since_id` search that is still being paged.
///
/// Pages arrive newest first, so nothing from the window is handed out
/// until its last page is in: emitting early would move the cursor past the
/// older tweets still waiting behind `next_token`.
#[derive(Debug)]
struct SearchWindow {
    since_id: Option<String>,
    next_token: Option<String>,
    pages: usize,
    items: Vec<Result<Tweet, PayloadError>>,
}

impl SearchWindow {
    fn new(since_id: Option<&str>) -> Self {
        Self {
            since_id: since_id.map(str::to_string),
            next_token: None,
            pages: 0,
            items: Vec::new(),
        }
    }
}

/// Polls the Twitter API v2 recent-search endpoint.
///
/// Each fetch asks for tweets after the cursor (`since_id`) and follows
/// `next_token` for at most `max_pages` pages. A window with more pages than
/// that is continued by the next fetch. The API returns newest first;
/// results are reordered oldest first before they are handed out.
pub struct TwitterSource {
    client: reqwest::Client,
    search_url: String,
    bearer_token: String,
    query: String,
    max_results: u32,
    max_pages: usize,
    poll_interval: Duration,
    window: Option<SearchWindow>,
}

impl TwitterSource {
    pub fn new(config: &TwitterSourceConfig) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("twitter-to-kafka/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            search_url: format!("{}{}", config.base_url.trim_end_matches('/'), SEARCH_PATH),
            bearer_token: config.bearer_token.clone(),
            query: config.query.clone(),
            max_results: config.max_results,
            max_pages: config.max_pages.max(1),
            poll_interval: config.poll_interval,
            window: None,
        })
    }

    async fn fetch_page(
        &self,
        cursor: Option<&str>,
        next_token: Option<&str>,
    ) -> Result<SearchResponse, SourceError> {
        let mut params: Vec<(&str, String)> = vec![
            ("query", self.query.clone()),
            ("max_results", self.max_results.to_string()),
            ("tweet.fields", "created_at,author_id".to_string()),
            ("expansions", "author_id".to_string()),
            ("user.fields", "username".to_string()),
        ];
        if let Some(since_id) = cursor {
            params.push(("since_id", since_id.to_string()));
        }
        if let Some(token) = next_token {
            params.push(("next_token", token.to_string()));
        }

        let response = self
            .client
            .get(&self.search_url)
            .bearer_auth(&self.bearer_token)
            .query(&params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let status = status.as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(match status {
                401 | 403 => SourceError::Unauthorized { status, message },
                _ => SourceError::Status { status, message },
            });
        }

        Ok(response.json().await?)
    }
}

/// Normalize one response page into tweets, keeping the page order.
fn normalize_page(page: &SearchResponse) -> Vec<Result<Tweet, PayloadError>> {
    let usernames: HashMap<String, String> = page
        .includes
        .iter()
        .flat_map(|includes| includes.users.iter())
        .map(|user| (user.id.clone(), user.username.clone()))
        .collect();

    page.data
        .iter()
        .flatten()
        .map(|value| Tweet::from_v2_value(value, &usernames))
        .collect()
}

/// Oldest first. Corrupt payloads keep their relative position at the end.
fn sort_oldest_first(items: &mut [Result<Tweet, PayloadError>]) {
    items.sort_by(|a, b| match (a, b) {
        (Ok(a), Ok(b)) => compare_ids(a.id(), b.id()).unwrap_or(Ordering::Equal),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => Ordering::Equal,
    });
}

#[async_trait]
impl TweetSource for TwitterSource {
    fn name(&self) -> &str {
        "twitter"
    }

    async fn fetch(&mut self, cursor: Option<&str>) -> Result<Fetch, SourceError> {
        let mut window = match self.window.take() {
            Some(window) if window.since_id.as_deref() == cursor => window,
            Some(stale) => {
                debug!(
                    since_id = stale.since_id.as_deref().unwrap_or(""),
                    pages = stale.pages,
                    "Cursor moved, restarting search window"
                );
                SearchWindow::new(cursor)
            }
            None => SearchWindow::new(cursor),
        };

        for _ in 0..self.max_pages {
            let page = match self
                .fetch_page(window.since_id.as_deref(), window.next_token.as_deref())
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    // Pages already collected stay; the retry resumes at next_token
                    self.window = Some(window);
                    return Err(e);
                }
            };

            let meta = page.meta.as_ref();
            debug!(
                page = window.pages,
                result_count = meta.map(|m| m.result_count).unwrap_or(0),
                "Fetched search page"
            );

            window.pages += 1;
            window.items.extend(normalize_page(&page));
            window.next_token = meta.and_then(|m| m.next_token.clone());

            if window.next_token.is_none() {
                let mut items = window.items;
                sort_oldest_first(&mut items);
                return Ok(Fetch::Items(items));
            }
        }

        info!(
            pages = window.pages,
            buffered = window.items.len(),
            "Search window spans more than max_pages, continuing on next poll"
        );
        self.window = Some(window);
        Ok(Fetch::Items(Vec::new()))
    }

    fn idle_interval(&self) -> Duration {
        self.poll_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::http::{header, HeaderMap, StatusCode};
    use axum::routing::get;
    use axum::Router;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
    use std::sync::{Arc, Mutex};

    type Params = HashMap<String, String>;
    type Responder = Arc<dyn Fn(&Params) -> (StatusCode, String) + Send + Sync>;

    /// Serve the search endpoint on a loopback port, recording every query
    async fn serve_search(respond: Responder) -> (String, Arc<Mutex<Vec<Params>>>) {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = requests.clone();
        let app = Router::new().route(
            SEARCH_PATH,
            get(move |headers: HeaderMap, Query(mut params): Query<Params>| {
                let respond = respond.clone();
                let recorded = recorded.clone();
                async move {
                    if let Some(auth) = headers
                        .get(header::AUTHORIZATION)
                        .and_then(|value| value.to_str().ok())
                    {
                        params.insert("authorization".to_string(), auth.to_string());
                    }
                    let (status, body) = respond(&params);
                    recorded.lock().unwrap().push(params);
                    (status, [(header::CONTENT_TYPE, "application/json")], body)
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{}", addr), requests)
    }

    fn search_page(ids: &[u64], next_token: Option<&str>) -> (StatusCode, String) {
        let data: Vec<Value> = ids
            .iter()
            .map(|id| {
                json!({
                    "id": id.to_string(),
                    "text": format!("tweet {}", id),
                    "author_id": "7",
                    "created_at": "2026-01-28T10:00:00Z"
                })
            })
            .collect();
        let mut meta = json!({"result_count": ids.len()});
        if let Some(token) = next_token {
            meta["next_token"] = json!(token);
        }
        let body = json!({
            "data": data,
            "includes": {"users": [{"id": "7", "username": "ferris"}]},
            "meta": meta
        });
        (StatusCode::OK, body.to_string())
    }

    fn source_config(base_url: String, max_pages: usize) -> TwitterSourceConfig {
        TwitterSourceConfig {
            bearer_token: "token".to_string(),
            query: "rust kafka".to_string(),
            base_url,
            poll_interval: Duration::from_millis(10),
            max_results: 10,
            max_pages,
            timeout: Duration::from_secs(5),
        }
    }

    fn query<'a>(params: &'a Params, name: &str) -> Option<&'a str> {
        params.get(name).map(String::as_str)
    }

    fn emitted_ids(fetch: Fetch) -> Vec<String> {
        match fetch {
            Fetch::Items(items) => items
                .into_iter()
                .map(|item| item.unwrap().id().to_string())
                .collect(),
            Fetch::Exhausted => panic!("twitter source never exhausts"),
        }
    }

    #[tokio::test]
    async fn test_window_past_page_limit_continues_on_next_fetch() {
        let respond: Responder = Arc::new(|params: &Params| {
            match (query(params, "since_id"), query(params, "next_token")) {
                (None, None) => search_page(&[6, 5], Some("p2")),
                (None, Some("p2")) => search_page(&[4, 3], Some("p3")),
                (None, Some("p3")) => search_page(&[2, 1], None),
                (Some("6"), None) => search_page(&[], None),
                _ => (StatusCode::BAD_REQUEST, "{}".to_string()),
            }
        });
        let (base_url, requests) = serve_search(respond).await;
        let mut source = TwitterSource::new(&source_config(base_url, 2)).unwrap();

        // Two pages in, the window is not complete: nothing is handed out yet
        assert!(emitted_ids(source.fetch(None).await.unwrap()).is_empty());

        let ids = emitted_ids(source.fetch(None).await.unwrap());
        assert_eq!(ids, vec!["1", "2", "3", "4", "5", "6"]);

        assert!(emitted_ids(source.fetch(Some("6")).await.unwrap()).is_empty());

        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 4);
        assert_eq!(query(&requests[0], "authorization"), Some("Bearer token"));
        assert_eq!(query(&requests[0], "query"), Some("rust kafka"));
        assert_eq!(query(&requests[0], "expansions"), Some("author_id"));
        assert_eq!(query(&requests[2], "next_token"), Some("p3"));
        assert_eq!(query(&requests[3], "since_id"), Some("6"));
        assert_eq!(query(&requests[3], "next_token"), None);
    }

    #[tokio::test]
    async fn test_failed_page_resumes_at_next_token() {
        let failures = Arc::new(AtomicU32::new(1));
        let respond: Responder = {
            let failures = failures.clone();
            Arc::new(move |params: &Params| match query(params, "next_token") {
                None => search_page(&[4, 3], Some("p2")),
                Some("p2") => {
                    let remaining = failures.load(AtomicOrdering::SeqCst);
                    if remaining > 0 {
                        failures.store(remaining - 1, AtomicOrdering::SeqCst);
                        return (StatusCode::SERVICE_UNAVAILABLE, "{}".to_string());
                    }
                    search_page(&[2, 1], None)
                }
                _ => (StatusCode::BAD_REQUEST, "{}".to_string()),
            })
        };
        let (base_url, requests) = serve_search(respond).await;
        let mut source = TwitterSource::new(&source_config(base_url, 5)).unwrap();

        let err = source.fetch(None).await.unwrap_err();
        assert!(matches!(err, SourceError::Status { status: 503, .. }));
        assert!(err.is_transient());

        let ids = emitted_ids(source.fetch(None).await.unwrap());
        assert_eq!(ids, vec!["1", "2", "3", "4"]);

        // The first page was not fetched again
        let requests = requests.lock().unwrap();
        let first_pages = requests
            .iter()
            .filter(|params| query(params, "next_token").is_none())
            .count();
        assert_eq!(first_pages, 1);
        assert_eq!(requests.len(), 3);
    }

    #[tokio::test]
    async fn test_moved_cursor_restarts_window() {
        let respond: Responder = Arc::new(|params: &Params| {
            match (query(params, "since_id"), query(params, "next_token")) {
                (None, None) => search_page(&[9, 8], Some("p2")),
                (Some("4"), None) => search_page(&[6, 5], None),
                _ => (StatusCode::BAD_REQUEST, "{}".to_string()),
            }
        });
        let (base_url, requests) = serve_search(respond).await;
        let mut source = TwitterSource::new(&source_config(base_url, 1)).unwrap();

        assert!(emitted_ids(source.fetch(None).await.unwrap()).is_empty());
        let ids = emitted_ids(source.fetch(Some("4")).await.unwrap());
        assert_eq!(ids, vec!["5", "6"]);
        assert_eq!(requests.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_error_status_mapping() {
        for status in [429u16, 500, 503, 400, 401, 403] {
            let respond: Responder = Arc::new(move |_: &Params| {
                let code = StatusCode::from_u16(status).unwrap();
                (code, r#"{"title":"error"}"#.to_string())
            });
            let (base_url, _) = serve_search(respond).await;
            let mut source = TwitterSource::new(&source_config(base_url, 1)).unwrap();

            let err = source.fetch(None).await.unwrap_err();
            match status {
                401 | 403 => {
                    assert!(
                        matches!(err, SourceError::Unauthorized { status: s, .. } if s == status)
                    );
                    assert!(!err.is_transient());
                }
                400 => {
                    assert!(matches!(err, SourceError::Status { status: 400, .. }));
                    assert!(!err.is_transient());
                }
                _ => {
                    assert!(matches!(err, SourceError::Status { status: s, .. } if s == status));
                    assert!(err.is_transient(), "status {} should be retried", status);
                }
            }
        }
    }

    fn page(json: &str) -> SearchResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_normalize_page_expands_usernames() {
        let response = page(
            r#"{
                "data": [
                    {"id": "1002", "text": "kafka", "author_id": "7", "created_at": "2026-01-28T10:00:02Z"},
                    {"id": "1001", "text": "rust", "author_id": "8", "created_at": "2026-01-28T10:00:01Z"}
                ],
                "includes": {"users": [{"id": "7", "username": "ferris"}, {"id": "8", "username": "duke"}]},
                "meta": {"result_count": 2, "newest_id": "1002", "oldest_id": "1001"}
            }"#,
        );

        let mut items = normalize_page(&response);
        sort_oldest_first(&mut items);

        let tweets: Vec<Tweet> = items.into_iter().map(Result::unwrap).collect();
        assert_eq!(tweets[0].id(), "1001");
        assert_eq!(tweets[0].author(), "duke");
        assert_eq!(tweets[1].id(), "1002");
        assert_eq!(tweets[1].author(), "ferris");
    }

    #[test]
    fn test_empty_page_has_no_data() {
        let response = page(r#"{"meta": {"result_count": 0}}"#);
        assert!(normalize_page(&response).is_empty());
        assert!(response.meta.unwrap().next_token.is_none());
    }

    #[test]
    fn test_corrupt_entries_sort_last() {
        let response = page(
            r#"{"data": [
                {"id": "5", "text": "no author", "created_at": "2026-01-28T10:00:00Z"},
                {"id": "4", "text": "ok", "author_id": "1", "created_at": "2026-01-28T10:00:00Z"}
            ]}"#,
        );
        let mut items = normalize_page(&response);
        sort_oldest_first(&mut items);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(PayloadError::MissingField("author_id"))));
    }

    #[test]
    fn test_search_url_trims_trailing_slash() {
        let config = TwitterSourceConfig {
            bearer_token: "token".to_string(),
            query: "rust".to_string(),
            base_url: "http://localhost:8080/".to_string(),
            poll_interval: Duration::from_secs(15),
            max_results: 10,
            max_pages: 0,
            timeout: Duration::from_secs(5),
        };
        let source = TwitterSource::new(&config).unwrap();
        assert_eq!(source.search_url, "http://localhost:8080/2/tweets/search/recent");
        assert_eq!(source.max_pages, 1);
    }
}
