//! Streaming connection to a continuous change feed.
//!
//! The connection owns one long-lived HTTP response at a time and turns its
//! body into lines. Transport failures never end the sequence: they are
//! yielded as [`StreamItem::Failed`] and the next call reconnects after a
//! backoff delay, resuming from the last sequence the caller confirmed.
//!
//! A connection that starts at [`Since::Now`] asks the server for its current
//! `last_seq` before the first stream is opened, so reconnects resume from a
//! concrete sequence and never skip changes made while disconnected.

use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::Url;
use tracing::{debug, info, warn};

use follow_proto::{Line, LineFramer, Seq};

use crate::config::{FeedConfig, Since};
use crate::error::{ConnectionError, Error};

/// Longest error body kept from a non-2xx response.
const MAX_ERROR_BODY: usize = 1024;

/// One step of the connection's lazy sequence.
#[derive(Debug)]
pub enum StreamItem {
    /// A response with a 2xx status was received. `attempt` counts every
    /// connection attempt made so far, starting at 1.
    Connected { attempt: u32 },
    /// One non-blank line.
    Frame(Bytes),
    /// A blank keep-alive line.
    Heartbeat,
    /// The connection will wait `delay` before attempt number `attempt`.
    Retrying { attempt: u32, delay: Duration },
    /// The response ended cleanly. The next call reconnects.
    Ended,
    /// The connection failed. The next call retries unless retries are
    /// exhausted, in which case the connection has closed itself.
    Failed(ConnectionError),
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No response is open; the next call connects.
    Disconnected,
    /// A response body is being read.
    Streaming,
    /// Closed for good.
    Closed,
}

type ByteStream = BoxStream<'static, reqwest::Result<Bytes>>;

/// A resumable streaming connection to a change feed.
pub struct StreamConnection {
    client: reqwest::Client,
    config: FeedConfig,
    since: Since,
    state: ConnectionState,
    body: Option<ByteStream>,
    framer: LineFramer,
    /// Consecutive failures without receiving data.
    failures: u32,
    /// Total connection attempts.
    attempts: u32,
    /// Backoff delay announced but not yet slept.
    pending_delay: Option<Duration>,
    /// Whether the open response has delivered any bytes.
    received_data: bool,
}

impl StreamConnection {
    /// Create a connection. Nothing is sent until [`next`](Self::next).
    pub fn new(config: FeedConfig) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build http client: {}", e)))?;

        Ok(Self {
            client,
            since: config.since.clone(),
            config,
            state: ConnectionState::Disconnected,
            body: None,
            framer: LineFramer::new(),
            failures: 0,
            attempts: 0,
            pending_delay: None,
            received_data: false,
        })
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Position the next request will resume from.
    pub fn since(&self) -> &Since {
        &self.since
    }

    /// Record the last processed sequence; reconnects resume after it.
    pub fn resume_from(&mut self, seq: Seq) {
        self.since = Since::Seq(seq);
    }

    /// Complete lines already received but not yet yielded.
    pub fn take_buffered(&mut self) -> Vec<Bytes> {
        self.framer.drain_records()
    }

    /// Close the connection. Idempotent.
    pub fn close(&mut self) {
        if self.state != ConnectionState::Closed {
            debug!(feed = %self.config.target, "closing feed connection");
        }
        self.state = ConnectionState::Closed;
        self.body = None;
        self.pending_delay = None;
        self.framer.clear();
    }

    /// Produce the next item, or `None` once closed.
    pub async fn next(&mut self) -> Option<StreamItem> {
        loop {
            match self.state {
                ConnectionState::Closed => return None,
                ConnectionState::Streaming => {
                    if let Some(line) = self.framer.next_line() {
                        return Some(match line {
                            Line::Record(bytes) => StreamItem::Frame(bytes),
                            Line::Heartbeat => StreamItem::Heartbeat,
                        });
                    }
                    if let Some(item) = self.read_chunk().await {
                        return Some(item);
                    }
                }
                ConnectionState::Disconnected => {
                    if self.failures > 0 && self.pending_delay.is_none() {
                        if !self.config.retry.allows(self.failures) {
                            let attempts = self.attempts;
                            warn!(attempts, feed = %self.config.target, "giving up on feed");
                            self.close();
                            return Some(StreamItem::Failed(ConnectionError::RetriesExhausted {
                                attempts,
                            }));
                        }
                        let delay = self.config.retry.delay_for_attempt(self.failures);
                        self.pending_delay = Some(delay);
                        return Some(StreamItem::Retrying {
                            attempt: self.attempts + 1,
                            delay,
                        });
                    }
                    if let Some(delay) = self.pending_delay {
                        tokio::time::sleep(delay).await;
                        self.pending_delay = None;
                    }
                    return Some(self.connect().await);
                }
            }
        }
    }

    /// Read one chunk into the framer. Returns an item when the response
    /// failed or ended.
    async fn read_chunk(&mut self) -> Option<StreamItem> {
        let inactivity = self.config.inactivity_timeout;
        let next = match self.body.as_mut() {
            Some(body) => tokio::time::timeout(inactivity, body.next()).await,
            None => return Some(self.fail(ConnectionError::Request("no open response".into()))),
        };

        match next {
            Err(_) => Some(self.fail(ConnectionError::Inactivity(inactivity))),
            Ok(Some(Err(e))) => Some(self.fail(e.into())),
            Ok(Some(Ok(chunk))) => {
                if !chunk.is_empty() {
                    self.received_data = true;
                    self.failures = 0;
                }
                match self.framer.push(&chunk) {
                    Ok(()) => None,
                    Err(e) => Some(self.fail(e.into())),
                }
            }
            Ok(None) => {
                if self.framer.has_partial() {
                    let buffered = self.framer.buffered_len();
                    return Some(self.fail(ConnectionError::MalformedTermination { buffered }));
                }
                info!(
                    feed = %self.config.target,
                    since = %self.since.as_query_value(),
                    "feed response ended, reconnecting"
                );
                if !self.received_data {
                    // an empty response counts against the backoff so a server
                    // that closes immediately is not hammered
                    self.failures += 1;
                }
                self.disconnect();
                Some(StreamItem::Ended)
            }
        }
    }

    async fn connect(&mut self) -> StreamItem {
        self.attempts += 1;
        let attempt = self.attempts;

        if self.since == Since::Now {
            let resolved = match self.config.position_url() {
                Ok(url) => fetch_last_seq(self.get(url), self.config.request_timeout).await,
                Err(e) => Err(e),
            };
            match resolved {
                Ok(seq) => {
                    debug!(seq = %seq, feed = %self.config.target, "resolved since=now");
                    self.since = Since::Seq(seq);
                }
                Err(e) => return self.fail(e),
            }
        }

        let opened = match self.config.feed_url(&self.since) {
            Ok(url) => open(self.get(url), self.config.request_timeout).await,
            Err(e) => Err(e),
        };
        match opened {
            Ok(body) => {
                info!(
                    attempt,
                    feed = %self.config.target,
                    since = %self.since.as_query_value(),
                    "feed connected"
                );
                self.body = Some(body);
                self.received_data = false;
                self.framer.clear();
                self.state = ConnectionState::Streaming;
                StreamItem::Connected { attempt }
            }
            Err(e) => self.fail(e),
        }
    }

    fn get(&self, url: Url) -> reqwest::RequestBuilder {
        let (url, credentials) = split_credentials(url);
        debug!(url = %url, "opening feed request");

        let mut request = self.client.get(url).header(ACCEPT, "application/json");
        for (name, value) in &self.config.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some((user, password)) = credentials {
            request = request.basic_auth(user, password);
        }
        request
    }

    fn fail(&mut self, error: ConnectionError) -> StreamItem {
        self.failures += 1;
        warn!(
            error = %error,
            failures = self.failures,
            feed = %self.config.target,
            "feed connection failed"
        );
        self.disconnect();
        StreamItem::Failed(error)
    }

    fn disconnect(&mut self) {
        self.body = None;
        self.framer.clear();
        self.state = ConnectionState::Disconnected;
    }
}

/// Send the feed request and hand back its body once a 2xx status arrives.
async fn open(
    request: reqwest::RequestBuilder,
    timeout: Duration,
) -> Result<ByteStream, ConnectionError> {
    let response = send(request, timeout).await?;
    Ok(response.bytes_stream().boxed())
}

/// Read `last_seq` from a one-shot feed response.
async fn fetch_last_seq(
    request: reqwest::RequestBuilder,
    timeout: Duration,
) -> Result<Seq, ConnectionError> {
    let response = send(request, timeout).await?;
    let body = tokio::time::timeout(timeout, response.bytes())
        .await
        .map_err(|_| ConnectionError::Request(format!("no response body within {:?}", timeout)))??;

    let value: serde_json::Value =
        serde_json::from_slice(&body).map_err(follow_proto::Error::from)?;
    let last_seq = value
        .get("last_seq")
        .ok_or(follow_proto::Error::MissingField("last_seq"))?;
    Ok(Seq::from_json(last_seq)?)
}

async fn send(
    request: reqwest::RequestBuilder,
    timeout: Duration,
) -> Result<reqwest::Response, ConnectionError> {
    let response = tokio::time::timeout(timeout, request.send())
        .await
        .map_err(|_| ConnectionError::Request(format!("no response within {:?}", timeout)))??;

    let status = response.status();
    if !status.is_success() {
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut end = MAX_ERROR_BODY;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body.truncate(end);
        }
        return Err(ConnectionError::Status {
            status: status.as_u16(),
            body: body.trim().to_string(),
        });
    }
    Ok(response)
}

impl std::fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection")
            .field("target", &self.config.target)
            .field("state", &self.state)
            .field("since", &self.since)
            .field("failures", &self.failures)
            .field("attempts", &self.attempts)
            .finish()
    }
}

/// Move URL user-info into basic auth credentials.
pub(crate) fn split_credentials(mut url: Url) -> (Url, Option<(String, Option<String>)>) {
    if url.username().is_empty() {
        return (url, None);
    }
    let user = url.username().to_string();
    let password = url.password().map(str::to_string);
    // setting credentials on an http(s) URL cannot fail
    let _ = url.set_username("");
    let _ = url.set_password(None);
    (url, Some((user, password)))
}
