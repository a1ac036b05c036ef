//! Feed lifecycle and processing task.
//!
//! A [`FeedHandle`] is created idle. Listeners are registered on it, then
//! [`FeedHandle::start`] spawns one [`FeedProcessor`] task on the current
//! tokio runtime. The processor owns the connection and is the only place
//! records are normalized and dispatched, so events reach listeners in
//! transport order.
//!
//! Stopping is cooperative: [`FeedHandle::stop`] raises a flag and wakes the
//! processor. The processor finishes the frame in hand and delivers every
//! frame already received. It then closes the connection and emits a
//! single `stop`.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, trace, warn};

use follow_proto::{ChangeEvent, ChangeType, FeedRecord, Normalizer, Seq};

use crate::config::FeedConfig;
use crate::connection::{StreamConnection, StreamItem};
use crate::dispatcher::{EventDispatcher, EventKind, FeedEvent, ListenerId};
use crate::error::{ConnectionError, Error, Result};

/// Lifecycle state of a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedState {
    /// Created, not started.
    Idle,
    /// Waiting for a connection (first or after a failure).
    Connecting,
    /// Receiving records.
    Active,
    /// Stop requested; draining.
    Stopping,
    /// Finished. Terminal.
    Stopped,
}

impl FeedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedState::Idle => "idle",
            FeedState::Connecting => "connecting",
            FeedState::Active => "active",
            FeedState::Stopping => "stopping",
            FeedState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for FeedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a feed task ended early.
#[derive(Debug, Clone)]
enum Fatal {
    Unhandled(Arc<Error>),
    Panicked(String),
}

impl Fatal {
    fn to_error(&self) -> Error {
        match self {
            Fatal::Unhandled(inner) => Error::Unhandled(inner.clone()),
            Fatal::Panicked(message) => Error::Panicked(message.clone()),
        }
    }
}

struct Shared {
    config: FeedConfig,
    dispatcher: EventDispatcher,
    state: watch::Sender<FeedState>,
    /// Flipped after the final `stop` event has been delivered.
    done: watch::Sender<bool>,
    last_seq: Mutex<Option<Seq>>,
    stop_requested: AtomicBool,
    stop_notify: Notify,
    fatal: Mutex<Option<Fatal>>,
}

impl Shared {
    fn transition(&self, from: FeedState, to: FeedState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    fn finish(&self, fatal: Option<Fatal>) {
        if let Some(fatal) = fatal {
            *self.fatal.lock() = Some(fatal);
        }
        self.state.send_replace(FeedState::Stopped);
        info!(
            feed = %self.config.target,
            last_seq = ?self.last_seq.lock().as_ref(),
            "feed stopped"
        );

        let delivered = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.dispatcher.emit(&FeedEvent::Stop);
        }));
        if let Err(panic) = delivered {
            error!(panic = %panic_message(panic.as_ref()), "stop listener panicked");
        }
        self.done.send_replace(true);
    }
}

/// Handle to one feed. Cheap to clone; all clones control the same feed.
#[derive(Clone)]
pub struct FeedHandle {
    shared: Arc<Shared>,
}

impl FeedHandle {
    /// Create an idle feed.
    ///
    /// Fails if the target cannot be turned into a request URL.
    pub fn new(config: FeedConfig) -> Result<Self> {
        config.feed_url(&config.since)?;

        let (state, _) = watch::channel(FeedState::Idle);
        let (done, _) = watch::channel(false);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                dispatcher: EventDispatcher::new(),
                state,
                done,
                last_seq: Mutex::new(None),
                stop_requested: AtomicBool::new(false),
                stop_notify: Notify::new(),
                fatal: Mutex::new(None),
            }),
        })
    }

    /// The feed's configuration.
    pub fn config(&self) -> &FeedConfig {
        &self.shared.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> FeedState {
        *self.shared.state.borrow()
    }

    /// Last sequence processed, including filtered changes.
    pub fn last_seq(&self) -> Option<Seq> {
        self.shared.last_seq.lock().clone()
    }

    /// Register a listener for any event kind.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&FeedEvent) + Send + Sync + 'static,
    {
        self.shared.dispatcher.on(kind, listener)
    }

    pub fn on_start<F>(&self, listener: F) -> ListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on(EventKind::Start, move |_| listener())
    }

    pub fn on_change<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.on(EventKind::Change, move |event| {
            if let FeedEvent::Change(change) = event {
                listener(change);
            }
        })
    }

    pub fn on_catchup<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Seq) + Send + Sync + 'static,
    {
        self.on(EventKind::CatchUp, move |event| {
            if let FeedEvent::CatchUp(seq) = event {
                listener(seq);
            }
        })
    }

    pub fn on_retry<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(u32, Duration) + Send + Sync + 'static,
    {
        self.on(EventKind::Retry, move |event| {
            if let FeedEvent::Retry { attempt, delay } = event {
                listener(*attempt, *delay);
            }
        })
    }

    /// Register an error listener. A feed with no error listener treats the
    /// first error as fatal.
    pub fn on_error<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.on(EventKind::Error, move |event| {
            if let FeedEvent::Error(err) = event {
                listener(err);
            }
        })
    }

    pub fn on_stop<F>(&self, listener: F) -> ListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on(EventKind::Stop, move |_| listener())
    }

    /// Remove a listener.
    pub fn remove_listener(&self, id: ListenerId) -> Result<()> {
        self.shared.dispatcher.remove_listener(id)
    }

    /// Start following.
    ///
    /// Must be called from within a tokio runtime, and only once.
    pub fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::InvalidUse("start requires a tokio runtime".to_string()))?;
        let conn = StreamConnection::new(self.shared.config.clone())?;

        if !self.shared.transition(FeedState::Idle, FeedState::Connecting) {
            return Err(Error::InvalidUse(format!(
                "cannot start a feed that is {}",
                self.state()
            )));
        }

        info!(
            feed = %self.shared.config.target,
            since = %self.shared.config.since.as_query_value(),
            "starting feed"
        );
        let processor = FeedProcessor::new(self.shared.clone(), conn);
        runtime.spawn(processor.run());
        Ok(())
    }

    /// Request the feed to stop. Idempotent and safe to call from listeners.
    ///
    /// `stop` is never emitted before this returns. A running feed emits it
    /// from its task once buffered changes have been delivered. An idle feed
    /// moves to `Stopping` and emits it from a spawned task, or from a
    /// short-lived thread when called outside a tokio runtime.
    pub fn stop(&self) {
        let mut previous = FeedState::Stopped;
        self.shared.state.send_if_modified(|state| {
            previous = *state;
            match *state {
                FeedState::Idle | FeedState::Connecting | FeedState::Active => {
                    *state = FeedState::Stopping;
                    true
                }
                FeedState::Stopping | FeedState::Stopped => false,
            }
        });

        match previous {
            FeedState::Idle => {
                debug!(feed = %self.shared.config.target, "stopping feed that never started");
                let shared = self.shared.clone();
                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        runtime.spawn(async move { shared.finish(None) });
                    }
                    Err(_) => {
                        std::thread::spawn(move || shared.finish(None));
                    }
                }
            }
            FeedState::Connecting | FeedState::Active => {
                debug!(feed = %self.shared.config.target, "stop requested");
                self.shared.stop_requested.store(true, Ordering::SeqCst);
                self.shared.stop_notify.notify_one();
            }
            FeedState::Stopping | FeedState::Stopped => {}
        }
    }

    /// Wait until the feed has stopped and its `stop` event was delivered.
    ///
    /// Returns the fatal error if the feed ended because of one. A feed that
    /// was neither started nor stopped would never finish, so waiting on it
    /// is an invalid use.
    pub async fn wait(&self) -> Result<()> {
        let mut done = self.shared.done.subscribe();
        if self.state() == FeedState::Idle {
            return Err(Error::InvalidUse(
                "cannot wait on a feed that was never started".to_string(),
            ));
        }
        // the sender lives in `shared`, which this handle keeps alive
        let _ = done.wait_for(|done| *done).await;

        match self.shared.fatal.lock().as_ref() {
            Some(fatal) => Err(fatal.to_error()),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for FeedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedHandle")
            .field("target", &self.shared.config.target)
            .field("state", &self.state())
            .field("last_seq", &self.last_seq())
            .finish()
    }
}

/// Reports create/delete sequences that should not happen for one database.
#[derive(Debug, Default)]
struct LifecycleTracker {
    last: HashMap<String, ChangeType>,
}

impl LifecycleTracker {
    /// Returns true if the event repeats the previous lifecycle change.
    fn observe(&mut self, event: &ChangeEvent) -> bool {
        if event.change_type == ChangeType::Updated {
            return false;
        }
        let previous = self
            .last
            .insert(event.db_name.clone(), event.change_type);
        previous == Some(event.change_type)
    }
}

/// The task that drives one feed.
struct FeedProcessor {
    shared: Arc<Shared>,
    conn: StreamConnection,
    normalizer: Normalizer,
    lifecycle: LifecycleTracker,
    started: bool,
}

impl FeedProcessor {
    fn new(shared: Arc<Shared>, conn: StreamConnection) -> Self {
        let normalizer = Normalizer::new(shared.config.database_name());
        Self {
            shared,
            conn,
            normalizer,
            lifecycle: LifecycleTracker::default(),
            started: false,
        }
    }

    async fn run(mut self) {
        let outcome = AssertUnwindSafe(self.drive()).catch_unwind().await;
        self.conn.close();

        let fatal = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(Fatal::Unhandled(err))) => {
                error!(
                    error = %err,
                    feed = %self.shared.config.target,
                    "unhandled feed error, stopping"
                );
                Some(Fatal::Unhandled(err))
            }
            Ok(Err(fatal)) => Some(fatal),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(panic = %message, feed = %self.shared.config.target, "listener panicked, stopping");
                Some(Fatal::Panicked(message))
            }
        };
        self.shared.finish(fatal);
    }

    async fn drive(&mut self) -> std::result::Result<(), Fatal> {
        loop {
            if self.shared.stop_requested.load(Ordering::SeqCst) {
                break;
            }

            let item = tokio::select! {
                biased;
                _ = self.shared.stop_notify.notified() => continue,
                item = self.conn.next() => item,
            };
            let Some(item) = item else {
                break;
            };

            match item {
                StreamItem::Connected { attempt } => self.on_connected(attempt),
                StreamItem::Frame(frame) => self.process_frame(&frame)?,
                StreamItem::Heartbeat => trace!(feed = %self.shared.config.target, "heartbeat"),
                StreamItem::Ended => {
                    self.shared
                        .transition(FeedState::Active, FeedState::Connecting);
                }
                StreamItem::Retrying { attempt, delay } => {
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
                    self.shared
                        .dispatcher
                        .emit(&FeedEvent::Retry { attempt, delay });
                }
                StreamItem::Failed(err) => self.on_failed(err)?,
            }
        }

        let pending = self.conn.take_buffered();
        if !pending.is_empty() {
            debug!(frames = pending.len(), "delivering buffered frames before stop");
        }
        for frame in pending {
            self.process_frame(&frame)?;
        }
        Ok(())
    }

    fn on_connected(&mut self, attempt: u32) {
        self.shared
            .transition(FeedState::Connecting, FeedState::Active);
        if self.started || self.shared.stop_requested.load(Ordering::SeqCst) {
            return;
        }
        self.started = true;
        info!(attempt, feed = %self.shared.config.target, "feed started");
        self.shared.dispatcher.emit(&FeedEvent::Start);
    }

    fn on_failed(&mut self, err: ConnectionError) -> std::result::Result<(), Fatal> {
        self.shared
            .transition(FeedState::Active, FeedState::Connecting);
        self.emit_error(Error::Connection(err))
    }

    fn process_frame(&mut self, frame: &Bytes) -> std::result::Result<(), Fatal> {
        match self.normalizer.normalize(frame) {
            Ok(FeedRecord::Change(event)) => {
                debug!(
                    db = %event.db_name,
                    change_type = %event.change_type,
                    seq = %event.seq,
                    "change received"
                );
                if self.lifecycle.observe(&event) {
                    warn!(
                        db = %event.db_name,
                        change_type = %event.change_type,
                        seq = %event.seq,
                        "repeated lifecycle change without the opposite change in between"
                    );
                }

                self.advance(event.seq.clone());
                let accepted = self
                    .shared
                    .config
                    .filter
                    .as_ref()
                    .map_or(true, |filter| filter(&event));
                if accepted {
                    self.shared.dispatcher.emit(&FeedEvent::Change(event));
                } else {
                    trace!(seq = %event.seq, "change filtered out");
                }
                Ok(())
            }
            Ok(FeedRecord::LastSeq(seq)) => {
                debug!(seq = %seq, "caught up");
                self.advance(seq.clone());
                self.shared.dispatcher.emit(&FeedEvent::CatchUp(seq));
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, bytes = frame.len(), "skipping unreadable record");
                self.emit_error(Error::Protocol(err))
            }
        }
    }

    /// Record a processed sequence. A sequence that compares lower than the
    /// current one does not move the resume point back.
    fn advance(&mut self, seq: Seq) {
        let resume = {
            let mut last = self.shared.last_seq.lock();
            match last.as_ref() {
                Some(current) if seq.is_behind(current) => {
                    warn!(seq = %seq, last_seq = %current, "sequence went backwards");
                    None
                }
                _ => {
                    *last = Some(seq.clone());
                    Some(seq)
                }
            }
        };
        if let Some(seq) = resume {
            self.conn.resume_from(seq);
        }
    }

    fn emit_error(&self, err: Error) -> std::result::Result<(), Fatal> {
        let err = Arc::new(err);
        let invoked = self.shared.dispatcher.emit(&FeedEvent::Error(err.clone()));
        if invoked == 0 {
            return Err(Fatal::Unhandled(err));
        }
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
