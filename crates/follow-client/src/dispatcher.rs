//! In-process fan-out of feed events to listeners.
//!
//! Every emission works on a snapshot of the listener list taken when the
//! pass begins, so listeners may add or remove listeners (including
//! themselves) while being invoked:
//!
//! - a listener added during a pass is not invoked by that pass;
//! - a listener removed during a pass is skipped if its turn has not come;
//! - removal holds for every later pass.
//!
//! Snapshots are cached per registry generation; any mutation bumps the
//! generation. The registry lock is never held while a listener runs.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use follow_proto::{ChangeEvent, Seq};

use crate::error::Error;

/// Identifies one registered listener. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Kinds of events a feed emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The first connection was established.
    Start,
    /// A change passed the filter.
    Change,
    /// The server reported its current end of feed.
    CatchUp,
    /// A reconnect is scheduled.
    Retry,
    /// A connection or record error.
    Error,
    /// The feed finished.
    Stop,
}

impl EventKind {
    /// Event name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Start => "start",
            EventKind::Change => "change",
            EventKind::CatchUp => "catchup",
            EventKind::Retry => "retry",
            EventKind::Error => "error",
            EventKind::Stop => "stop",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event delivered to listeners.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    Start,
    Change(ChangeEvent),
    CatchUp(Seq),
    Retry { attempt: u32, delay: Duration },
    Error(Arc<Error>),
    Stop,
}

impl FeedEvent {
    /// The kind this event is dispatched under.
    pub fn kind(&self) -> EventKind {
        match self {
            FeedEvent::Start => EventKind::Start,
            FeedEvent::Change(_) => EventKind::Change,
            FeedEvent::CatchUp(_) => EventKind::CatchUp,
            FeedEvent::Retry { .. } => EventKind::Retry,
            FeedEvent::Error(_) => EventKind::Error,
            FeedEvent::Stop => EventKind::Stop,
        }
    }
}

/// A listener callback.
pub type Listener = Arc<dyn Fn(&FeedEvent) + Send + Sync>;

#[derive(Clone)]
struct Entry {
    id: ListenerId,
    listener: Listener,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    generation: u64,
    lists: HashMap<EventKind, Vec<Entry>>,
    /// Registered ids and their kinds. An id missing here has been removed.
    live: HashMap<ListenerId, EventKind>,
    /// Cached dispatch lists, tagged with the generation they were built at.
    snapshots: HashMap<EventKind, (u64, Arc<[Entry]>)>,
}

impl Registry {
    fn snapshot(&mut self, kind: EventKind) -> Arc<[Entry]> {
        if let Some((generation, entries)) = self.snapshots.get(&kind) {
            if *generation == self.generation {
                return entries.clone();
            }
        }
        let entries: Arc<[Entry]> = self
            .lists
            .get(&kind)
            .map(|list| list.as_slice().into())
            .unwrap_or_else(|| Arc::from(Vec::new()));
        self.snapshots
            .insert(kind, (self.generation, entries.clone()));
        entries
    }
}

/// Listener registry and event fan-out.
pub struct EventDispatcher {
    registry: Mutex<Registry>,
}

impl EventDispatcher {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Register a listener for one event kind.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&FeedEvent) + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock();
        registry.next_id += 1;
        let id = ListenerId(registry.next_id);
        registry.generation += 1;
        registry.live.insert(id, kind);
        registry.lists.entry(kind).or_default().push(Entry {
            id,
            listener: Arc::new(listener),
        });
        id
    }

    /// Remove a listener. Fails if the id is not registered.
    pub fn remove_listener(&self, id: ListenerId) -> Result<(), Error> {
        let mut registry = self.registry.lock();
        let kind = registry.live.remove(&id).ok_or(Error::UnknownListener(id))?;
        registry.generation += 1;
        if let Some(list) = registry.lists.get_mut(&kind) {
            list.retain(|entry| entry.id != id);
        }
        Ok(())
    }

    /// Number of listeners registered for a kind.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.registry.lock().lists.get(&kind).map_or(0, Vec::len)
    }

    /// Deliver an event to the listeners of its kind.
    ///
    /// Returns the number of listeners invoked.
    pub fn emit(&self, event: &FeedEvent) -> usize {
        let snapshot = self.registry.lock().snapshot(event.kind());

        let mut invoked = 0;
        for entry in snapshot.iter() {
            if !self.registry.lock().live.contains_key(&entry.id) {
                continue;
            }
            (entry.listener)(event);
            invoked += 1;
        }
        invoked
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.registry.lock();
        f.debug_struct("EventDispatcher")
            .field("listeners", &registry.live.len())
            .field("generation", &registry.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use follow_proto::ChangeType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn change() -> FeedEvent {
        FeedEvent::Change(ChangeEvent::new("db", ChangeType::Created, 1))
    }

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> impl Fn(&FeedEvent) {
        let log = log.clone();
        move |_| log.lock().push(name)
    }

    #[test]
    fn test_registration_order() {
        let dispatcher = EventDispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.on(EventKind::Change, recorder(&log, "a"));
        dispatcher.on(EventKind::Change, recorder(&log, "b"));
        dispatcher.on(EventKind::Stop, recorder(&log, "stop"));

        assert_eq!(dispatcher.emit(&change()), 2);
        assert_eq!(*log.lock(), vec!["a", "b"]);
        assert_eq!(dispatcher.listener_count(EventKind::Change), 2);
        assert_eq!(dispatcher.listener_count(EventKind::Error), 0);
    }

    #[test]
    fn test_remove_listener() {
        let dispatcher = EventDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let id = dispatcher.on(EventKind::Change, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.emit(&change());
        dispatcher.remove_listener(id).unwrap();
        dispatcher.emit(&change());

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(matches!(
            dispatcher.remove_listener(id),
            Err(Error::UnknownListener(_))
        ));
    }

    #[test]
    fn test_remove_self_during_dispatch() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let own_id = Arc::new(Mutex::new(None));

        let (d, l, own) = (dispatcher.clone(), log.clone(), own_id.clone());
        let id = dispatcher.on(EventKind::Change, move |_| {
            l.lock().push("once");
            if let Some(id) = own.lock().take() {
                d.remove_listener(id).unwrap();
            }
        });
        *own_id.lock() = Some(id);
        dispatcher.on(EventKind::Change, recorder(&log, "sibling"));

        dispatcher.emit(&change());
        dispatcher.emit(&change());

        assert_eq!(*log.lock(), vec!["once", "sibling", "sibling"]);
    }

    #[test]
    fn test_sibling_removed_before_its_turn_is_skipped() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let victim = Arc::new(Mutex::new(None));

        let (d, l, v) = (dispatcher.clone(), log.clone(), victim.clone());
        dispatcher.on(EventKind::Change, move |_| {
            l.lock().push("first");
            if let Some(id) = v.lock().take() {
                d.remove_listener(id).unwrap();
            }
        });
        let victim_id = dispatcher.on(EventKind::Change, recorder(&log, "victim"));
        *victim.lock() = Some(victim_id);
        dispatcher.on(EventKind::Change, recorder(&log, "last"));

        assert_eq!(dispatcher.emit(&change()), 2);
        assert_eq!(*log.lock(), vec!["first", "last"]);
    }

    #[test]
    fn test_listener_added_during_dispatch_waits_for_next_pass() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let added = Arc::new(AtomicUsize::new(0));

        let (d, l, a) = (dispatcher.clone(), log.clone(), added.clone());
        dispatcher.on(EventKind::Change, move |_| {
            if a.fetch_add(1, Ordering::SeqCst) == 0 {
                let l = l.clone();
                d.on(EventKind::Change, move |_| l.lock().push("late"));
            }
        });

        dispatcher.emit(&change());
        assert!(log.lock().is_empty());

        dispatcher.emit(&change());
        assert_eq!(*log.lock(), vec!["late"]);
    }

    #[test]
    fn test_emit_without_listeners() {
        let dispatcher = EventDispatcher::new();
        assert_eq!(dispatcher.emit(&FeedEvent::Start), 0);
        assert_eq!(FeedEvent::Stop.kind().as_str(), "stop");
    }
}
