//! In-process mock of the CouchDB endpoints a follower talks to.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, RawQuery, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

use follow_client::{FeedEvent, RetryConfig};

/// Which feed a subscriber is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Channel {
    DbUpdates,
    Changes(String),
}

#[derive(Default)]
struct Inner {
    next_seq: u64,
    databases: HashSet<String>,
    /// (seq ordinal, line) per channel.
    db_updates: Vec<(u64, String)>,
    changes: HashMap<String, Vec<(u64, String)>>,
    revisions: HashMap<(String, String), u32>,
    subscribers: Vec<(Channel, mpsc::UnboundedSender<Bytes>)>,
    feed_queries: Vec<String>,
    fail_next: VecDeque<u16>,
}

impl Inner {
    fn publish(&mut self, channel: Channel, ordinal: u64, line: String) {
        match &channel {
            Channel::DbUpdates => self.db_updates.push((ordinal, line.clone())),
            Channel::Changes(db) => self
                .changes
                .entry(db.clone())
                .or_default()
                .push((ordinal, line.clone())),
        }
        self.send_live(&channel, line);
    }

    fn send_live(&mut self, channel: &Channel, line: String) {
        let chunk = Bytes::from(format!("{}\n", line));
        self.subscribers
            .retain(|(c, tx)| c != channel || tx.send(chunk.clone()).is_ok());
    }

    fn history(&self, channel: &Channel) -> &[(u64, String)] {
        match channel {
            Channel::DbUpdates => &self.db_updates,
            Channel::Changes(db) => self.changes.get(db).map(Vec::as_slice).unwrap_or(&[]),
        }
    }
}

#[derive(Clone, Default)]
struct MockState {
    inner: Arc<Mutex<Inner>>,
}

/// A running mock server.
pub struct MockCouch {
    addr: SocketAddr,
    state: MockState,
}

impl MockCouch {
    /// Bind on an ephemeral port and serve in the background.
    pub async fn start() -> Self {
        let state = MockState::default();
        let app = Router::new()
            .route("/_db_updates", get(db_updates))
            .route("/:db/_changes", get(changes))
            .route("/:db", put(create_db).delete(delete_db))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    /// Base URL of the server.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Create a database directly, without going through HTTP.
    pub fn create(&self, db: &str) {
        create(&mut self.state.inner.lock(), db);
    }

    /// Write a document to a database, producing a `_changes` record.
    /// Returns the record's sequence number.
    pub fn put_doc(&self, db: &str, id: &str) -> u64 {
        self.write_doc(db, id, false)
    }

    /// Delete a document.
    pub fn delete_doc(&self, db: &str, id: &str) -> u64 {
        self.write_doc(db, id, true)
    }

    fn write_doc(&self, db: &str, id: &str, deleted: bool) -> u64 {
        let mut inner = self.state.inner.lock();
        inner.next_seq += 1;
        let seq = inner.next_seq;
        let rev = {
            let rev = inner
                .revisions
                .entry((db.to_string(), id.to_string()))
                .or_insert(0);
            *rev += 1;
            *rev
        };
        let mut record = json!({
            "seq": seq,
            "id": id,
            "changes": [{ "rev": format!("{}-abc{}", rev, seq) }],
        });
        if deleted {
            record["deleted"] = json!(true);
        }
        inner.publish(Channel::Changes(db.to_string()), seq, record.to_string());
        seq
    }

    /// Send a raw line to every open `_changes` stream of a database.
    pub fn send_changes_line(&self, db: &str, line: &str) {
        self.state
            .inner
            .lock()
            .send_live(&Channel::Changes(db.to_string()), line.to_string());
    }

    /// Send a raw line to every open `_db_updates` stream.
    pub fn send_db_updates_line(&self, line: &str) {
        self.state
            .inner
            .lock()
            .send_live(&Channel::DbUpdates, line.to_string());
    }

    /// End every open stream cleanly.
    pub fn close_streams(&self) {
        self.state.inner.lock().subscribers.clear();
    }

    /// Number of open streams.
    pub fn open_streams(&self) -> usize {
        let mut inner = self.state.inner.lock();
        inner.subscribers.retain(|(_, tx)| !tx.is_closed());
        inner.subscribers.len()
    }

    /// Answer the next `n` feed requests with `status`.
    pub fn fail_next(&self, status: u16, n: usize) {
        let mut inner = self.state.inner.lock();
        for _ in 0..n {
            inner.fail_next.push_back(status);
        }
    }

    /// Raw query strings of every feed request received.
    pub fn feed_queries(&self) -> Vec<String> {
        self.state.inner.lock().feed_queries.clone()
    }

    /// `since` parameter of every continuous feed request received.
    pub fn since_params(&self) -> Vec<String> {
        self.feed_queries()
            .iter()
            .map(String::as_str)
            .map(url_pairs)
            .filter(|pairs| pairs.iter().any(|(k, v)| k == "feed" && v == "continuous"))
            .filter_map(|pairs| pairs.into_iter().find(|(k, _)| k == "since").map(|(_, v)| v))
            .collect()
    }
}

fn url_pairs(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn create(inner: &mut Inner, db: &str) -> bool {
    if !inner.databases.insert(db.to_string()) {
        return false;
    }
    inner.next_seq += 1;
    let seq = inner.next_seq;
    let line = json!({ "db_name": db, "type": "created", "seq": format!("{}-g1AAAA", seq) });
    inner.publish(Channel::DbUpdates, seq, line.to_string());
    true
}

#[derive(Debug, Deserialize)]
struct FeedParams {
    feed: Option<String>,
    since: Option<String>,
}

fn since_ordinal(since: Option<&str>, current: u64) -> u64 {
    match since {
        None => 0,
        Some("now") => current,
        Some(value) => value
            .split('-')
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or(0),
    }
}

fn open_stream(state: &MockState, channel: Channel, params: FeedParams, raw: Option<String>) -> Response {
    let mut inner = state.inner.lock();
    inner.feed_queries.push(raw.unwrap_or_default());

    if let Some(status) = inner.fail_next.pop_front() {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return (status, Json(json!({ "error": "mock", "reason": "injected failure" }))).into_response();
    }
    if let Channel::Changes(db) = &channel {
        if !inner.databases.contains(db) {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "not_found", "reason": "Database does not exist." })),
            )
                .into_response();
        }
    }

    if params.feed.as_deref() != Some("continuous") {
        // one-shot request: report the current position only
        let last_seq = match &channel {
            Channel::DbUpdates => json!(format!("{}-g1AAAA", inner.next_seq)),
            Channel::Changes(_) => json!(inner.next_seq),
        };
        return (StatusCode::OK, Json(json!({ "results": [], "last_seq": last_seq }))).into_response();
    }

    let since = since_ordinal(params.since.as_deref(), inner.next_seq);
    let (tx, rx) = mpsc::unbounded_channel();
    for (ordinal, line) in inner.history(&channel) {
        if *ordinal > since {
            let _ = tx.send(Bytes::from(format!("{}\n", line)));
        }
    }
    inner.subscribers.push((channel, tx));

    let body = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (Ok::<_, Infallible>(chunk), rx))
    });
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(Body::from_stream(body))
        .unwrap()
}

async fn db_updates(
    State(state): State<MockState>,
    Query(params): Query<FeedParams>,
    RawQuery(raw): RawQuery,
) -> Response {
    open_stream(&state, Channel::DbUpdates, params, raw)
}

async fn changes(
    State(state): State<MockState>,
    Path(db): Path<String>,
    Query(params): Query<FeedParams>,
    RawQuery(raw): RawQuery,
) -> Response {
    open_stream(&state, Channel::Changes(db), params, raw)
}

async fn create_db(State(state): State<MockState>, Path(db): Path<String>) -> Response {
    let mut inner = state.inner.lock();
    if create(&mut inner, &db) {
        (StatusCode::CREATED, Json(json!({ "ok": true }))).into_response()
    } else {
        (
            StatusCode::PRECONDITION_FAILED,
            Json(json!({ "error": "file_exists", "reason": "The database could not be created, the file already exists." })),
        )
            .into_response()
    }
}

async fn delete_db(State(state): State<MockState>, Path(db): Path<String>) -> Response {
    let mut inner = state.inner.lock();
    if !inner.databases.remove(&db) {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "not_found", "reason": "Database does not exist." })),
        )
            .into_response();
    }
    inner.changes.remove(&db);
    inner.next_seq += 1;
    let seq = inner.next_seq;
    let line = json!({ "db_name": db, "type": "deleted", "seq": format!("{}-g1AAAA", seq) });
    inner.publish(Channel::DbUpdates, seq, line.to_string());
    (StatusCode::OK, Json(json!({ "ok": true }))).into_response()
}

/// Retry policy that keeps tests fast.
pub fn fast_retry() -> RetryConfig {
    RetryConfig::new()
        .with_initial_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(50))
        .with_jitter(0.0)
}

/// Receive the next value or fail the test after five seconds.
pub async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Forward every event of the given kinds into a channel.
pub fn record(
    feed: &follow_client::FeedHandle,
    kinds: &[follow_client::EventKind],
) -> mpsc::UnboundedReceiver<FeedEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    for kind in kinds {
        let tx = tx.clone();
        feed.on(*kind, move |event| {
            let _ = tx.send(event.clone());
        });
    }
    rx
}
