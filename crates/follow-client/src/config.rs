//! Feed configuration.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use follow_proto::{ChangeEvent, Seq};
use reqwest::Url;

use crate::backoff::RetryConfig;
use crate::error::ConnectionError;

/// Default interval at which the server is asked to send heartbeats.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

/// Extra time allowed past a missed heartbeat before the connection is
/// considered dead.
pub const DEFAULT_RESPONSE_GRACE: Duration = Duration::from_secs(5);

/// Default timeout for establishing a connection.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default user agent sent with feed requests.
pub const DEFAULT_USER_AGENT: &str = concat!("follow-client/", env!("CARGO_PKG_VERSION"));

/// Where in the feed to begin.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Since {
    /// Replay the whole feed.
    #[default]
    Beginning,
    /// Only changes made after the feed first connects.
    Now,
    /// Resume after the given sequence.
    Seq(Seq),
}

impl Since {
    /// Value of the `since` query parameter.
    pub fn as_query_value(&self) -> String {
        match self {
            Since::Beginning => "0".to_string(),
            Since::Now => "now".to_string(),
            Since::Seq(seq) => seq.to_string(),
        }
    }
}

impl From<Seq> for Since {
    fn from(seq: Seq) -> Self {
        Since::Seq(seq)
    }
}

impl FromStr for Since {
    type Err = follow_proto::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "now" => Ok(Since::Now),
            "" | "0" => Ok(Since::Beginning),
            other => Ok(Since::Seq(other.parse()?)),
        }
    }
}

/// Client-side predicate deciding which changes reach `change` listeners.
pub type ChangeFilter = Arc<dyn Fn(&ChangeEvent) -> bool + Send + Sync>;

/// Configuration of one feed.
#[derive(Clone)]
pub struct FeedConfig {
    /// Database URL (`http://host:5984/db`), a `_changes` URL, or a
    /// `_db_updates` URL.
    pub target: String,

    /// Database name given to document-level changes. Derived from the
    /// target when unset.
    pub db_name: Option<String>,

    /// Starting position.
    pub since: Since,

    /// Client-side filter. Rejected changes still advance the sequence.
    pub filter: Option<ChangeFilter>,

    /// Server-side filter function (`ddoc/name`).
    pub remote_filter: Option<String>,

    /// Ask the server to include full documents.
    pub include_docs: bool,

    /// Heartbeat interval requested from the server.
    pub heartbeat: Duration,

    /// Maximum silence tolerated on an open connection.
    pub inactivity_timeout: Duration,

    /// Timeout for establishing a connection.
    pub request_timeout: Duration,

    /// Extra query parameters.
    pub query_params: Vec<(String, String)>,

    /// Extra request headers.
    pub headers: Vec<(String, String)>,

    /// Reconnect policy.
    pub retry: RetryConfig,

    /// User agent header.
    pub user_agent: String,
}

impl FeedConfig {
    /// Create a configuration for the given target URL.
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            db_name: None,
            since: Since::default(),
            filter: None,
            remote_filter: None,
            include_docs: false,
            heartbeat: DEFAULT_HEARTBEAT,
            inactivity_timeout: DEFAULT_HEARTBEAT + DEFAULT_RESPONSE_GRACE,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            query_params: Vec::new(),
            headers: Vec::new(),
            retry: RetryConfig::default(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    /// Follow the `_changes` feed of a database on a server.
    pub fn database(server: &str, db: &str) -> Self {
        let target = format!("{}/{}", server.trim_end_matches('/'), encode_db_name(db));
        Self::new(target).with_db_name(db)
    }

    /// Follow the server-wide `_db_updates` feed.
    pub fn db_updates(server: &str) -> Self {
        Self::new(format!("{}/_db_updates", server.trim_end_matches('/')))
    }

    /// Set the database name used for document-level changes.
    pub fn with_db_name(mut self, db_name: impl Into<String>) -> Self {
        self.db_name = Some(db_name.into());
        self
    }

    /// Set the starting position.
    pub fn with_since(mut self, since: impl Into<Since>) -> Self {
        self.since = since.into();
        self
    }

    /// Set a client-side filter.
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&ChangeEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Set a server-side filter function.
    pub fn with_remote_filter(mut self, name: impl Into<String>) -> Self {
        self.remote_filter = Some(name.into());
        self
    }

    /// Include full documents in change payloads.
    pub fn with_include_docs(mut self, include: bool) -> Self {
        self.include_docs = include;
        self
    }

    /// Set the heartbeat interval. The inactivity timeout follows it.
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self.inactivity_timeout = heartbeat + DEFAULT_RESPONSE_GRACE;
        self
    }

    /// Set the inactivity timeout.
    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    /// Set the connection timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Add a query parameter.
    pub fn with_query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.push((key.into(), value.into()));
        self
    }

    /// Add a request header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the reconnect policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the user agent.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// True if the target is the server-wide `_db_updates` feed.
    pub fn is_db_updates(&self) -> bool {
        Url::parse(&self.target)
            .ok()
            .and_then(|url| last_segment(&url))
            .is_some_and(|segment| segment == "_db_updates")
    }

    /// Database name for document-level changes.
    pub fn database_name(&self) -> Option<String> {
        if let Some(name) = &self.db_name {
            return Some(name.clone());
        }
        if self.is_db_updates() {
            return None;
        }

        let url = Url::parse(&self.target).ok()?;
        let segments: Vec<&str> = url.path_segments()?.filter(|s| !s.is_empty()).collect();
        let name = match segments.as_slice() {
            [.., db, "_changes"] => db,
            [.., db] => db,
            [] => return None,
        };
        Some(decode_db_name(name))
    }

    /// Build the streaming request URL.
    pub fn feed_url(&self, since: &Since) -> Result<Url, ConnectionError> {
        let mut url = self.endpoint_url()?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("feed", "continuous");
            query.append_pair("heartbeat", &self.heartbeat.as_millis().to_string());
            query.append_pair("since", &since.as_query_value());
            if self.include_docs {
                query.append_pair("include_docs", "true");
            }
            if let Some(filter) = &self.remote_filter {
                query.append_pair("filter", filter);
            }
            for (key, value) in &self.query_params {
                query.append_pair(key, value);
            }
        }

        Ok(url)
    }

    /// Build a one-shot request URL whose response carries the feed's
    /// current `last_seq` and no records.
    pub fn position_url(&self) -> Result<Url, ConnectionError> {
        let mut url = self.endpoint_url()?;
        url.query_pairs_mut()
            .append_pair("since", "now")
            .append_pair("limit", "0");
        Ok(url)
    }

    fn endpoint_url(&self) -> Result<Url, ConnectionError> {
        let mut url = Url::parse(&self.target)
            .map_err(|e| ConnectionError::InvalidUrl(format!("{}: {}", self.target, e)))?;

        let has_endpoint = matches!(
            last_segment(&url).as_deref(),
            Some("_changes") | Some("_db_updates")
        );
        if !has_endpoint {
            url.path_segments_mut()
                .map_err(|_| ConnectionError::InvalidUrl(self.target.clone()))?
                .pop_if_empty()
                .push("_changes");
        }
        Ok(url)
    }
}

impl fmt::Debug for FeedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedConfig")
            .field("target", &self.target)
            .field("db_name", &self.db_name)
            .field("since", &self.since)
            .field("filter", &self.filter.as_ref().map(|_| "<fn>"))
            .field("remote_filter", &self.remote_filter)
            .field("include_docs", &self.include_docs)
            .field("heartbeat", &self.heartbeat)
            .field("inactivity_timeout", &self.inactivity_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl From<&str> for FeedConfig {
    fn from(target: &str) -> Self {
        Self::new(target)
    }
}

impl From<String> for FeedConfig {
    fn from(target: String) -> Self {
        Self::new(target)
    }
}

fn last_segment(url: &Url) -> Option<String> {
    url.path_segments()?
        .filter(|s| !s.is_empty())
        .last()
        .map(str::to_string)
}

/// CouchDB allows `/` and other reserved characters in database names;
/// they must be escaped in the path.
pub(crate) fn encode_db_name(name: &str) -> String {
    urlencoding::encode(name).into_owned()
}

fn decode_db_name(segment: &str) -> String {
    urlencoding::decode(segment)
        .map(Cow::into_owned)
        .unwrap_or_else(|_| segment.to_string())
}
