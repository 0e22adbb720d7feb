//! Local store adapter.
//!
//! Wraps a [`KeyValueBackend`] with snapshot (de)serialization, per-key
//! read-modify-write, and change notifications. Every collection lives under
//! one key whose value is the JSON array of its records.
//!
//! Storage failures are logged and swallowed here: a failed write leaves
//! the previous contents in place and emits no event, a failed or corrupt
//! read behaves as if the key were absent.

mod backend;
mod events;

pub use backend::{FileBackend, KeyValueBackend, MemoryBackend};
pub use events::{ChangeEvent, ChangeOrigin, ExternalHandler, HandlerId};

use crate::StorageError;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tandem_engine::Snapshot;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

/// Local persistent store for collection snapshots.
pub struct LocalStore {
    backend: Arc<dyn KeyValueBackend>,
    events: broadcast::Sender<ChangeEvent>,
    /// External-change handlers by collection key
    handlers: DashMap<String, Vec<(HandlerId, ExternalHandler)>>,
    /// Serializes read-modify-write per key
    locks: DashMap<String, Arc<Mutex<()>>>,
    next_handler: AtomicU64,
}

impl LocalStore {
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            backend,
            events,
            handlers: DashMap::new(),
            locks: DashMap::new(),
            next_handler: AtomicU64::new(1),
        }
    }

    /// A store over a fresh in-memory backend.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Read a collection snapshot; `None` when absent or unreadable.
    pub fn read(&self, key: &str) -> Option<Snapshot> {
        match self.load(key) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(collection = %key, error = %e, "Local read failed, treating as empty");
                None
            }
        }
    }

    /// Read a collection snapshot, empty when absent.
    pub fn read_or_empty(&self, key: &str) -> Snapshot {
        self.read(key).unwrap_or_default()
    }

    /// Replace a collection snapshot.
    ///
    /// Returns whether the write reached the backend.
    pub fn write(&self, key: &str, snapshot: &Snapshot, origin: ChangeOrigin) -> bool {
        let lock = self.key_lock(key);
        let event = {
            let _guard = lock.lock();
            self.persist(key, snapshot, origin)
        };
        self.dispatch(event)
    }

    /// Read-modify-write a collection under its key lock.
    ///
    /// The snapshot is written back (and an event emitted) only when `f`
    /// changed it.
    pub fn modify<T>(&self, key: &str, origin: ChangeOrigin, f: impl FnOnce(&mut Snapshot) -> T) -> T {
        let lock = self.key_lock(key);
        let (out, event) = {
            let _guard = lock.lock();
            let before = self.read_or_empty(key);
            let mut snapshot = before.clone();
            let out = f(&mut snapshot);
            let event = if snapshot != before {
                self.persist(key, &snapshot, origin)
            } else {
                None
            };
            (out, event)
        };
        self.dispatch(event);
        out
    }

    /// Fallible [`modify`](Self::modify); on `Err` nothing is written.
    pub fn update<T, E>(
        &self,
        key: &str,
        origin: ChangeOrigin,
        f: impl FnOnce(&mut Snapshot) -> Result<T, E>,
    ) -> Result<T, E> {
        self.modify(key, origin, |snapshot| {
            let mut draft = snapshot.clone();
            let out = f(&mut draft)?;
            *snapshot = draft;
            Ok(out)
        })
    }

    /// Delete a collection key, notifying subscribers with an empty snapshot.
    pub fn remove(&self, key: &str) {
        let lock = self.key_lock(key);
        let event = {
            let _guard = lock.lock();
            match self.backend.remove(key) {
                Ok(()) => {
                    let event = self.event(key, Snapshot::new(), ChangeOrigin::Local);
                    let _ = self.events.send(event.clone());
                    Some(event)
                }
                Err(e) => {
                    tracing::warn!(collection = %key, error = %e, "Local remove failed");
                    None
                }
            }
        };
        self.dispatch(event);
    }

    /// Receive every change to every collection.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    /// Register a handler for changes to `key` this process's UI did not
    /// make: remote merges, back-fills and writes by other processes.
    pub fn subscribe_external(
        &self,
        key: &str,
        handler: impl Fn(&ChangeEvent) + Send + Sync + 'static,
    ) -> HandlerId {
        let id = HandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .entry(key.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler registered with [`subscribe_external`](Self::subscribe_external).
    pub fn unsubscribe_external(&self, id: HandlerId) {
        self.handlers.retain(|_, handlers| {
            handlers.retain(|(handler_id, _)| *handler_id != id);
            !handlers.is_empty()
        });
    }

    /// Signal that another process wrote `key` directly to the backend.
    pub fn notify_external(&self, key: &str) {
        let snapshot = self.read_or_empty(key);
        let event = self.event(key, snapshot, ChangeOrigin::External);
        let _ = self.events.send(event.clone());
        self.dispatch(Some(event));
    }

    fn load(&self, key: &str) -> Result<Option<Snapshot>, StorageError> {
        let Some(raw) = self.backend.get(key)? else {
            return Ok(None);
        };
        Snapshot::from_json(&raw)
            .map(Some)
            .map_err(|e| StorageError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })
    }

    /// Write through to the backend and publish on the broadcast channel.
    /// Caller holds the key lock.
    fn persist(&self, key: &str, snapshot: &Snapshot, origin: ChangeOrigin) -> Option<ChangeEvent> {
        let result = snapshot
            .to_json()
            .map_err(|e| StorageError::Serialization(e.to_string()))
            .and_then(|json| self.backend.set(key, &json));

        match result {
            Ok(()) => {
                tracing::debug!(collection = %key, records = snapshot.len(), ?origin, "Local write");
                let event = self.event(key, snapshot.clone(), origin);
                let _ = self.events.send(event.clone());
                Some(event)
            }
            Err(e) => {
                tracing::warn!(collection = %key, error = %e, "Local write failed, keeping previous contents");
                None
            }
        }
    }

    /// Run external handlers outside the key lock so they may write back.
    /// Returns whether there was an event.
    fn dispatch(&self, event: Option<ChangeEvent>) -> bool {
        let Some(event) = event else {
            return false;
        };
        if event.origin != ChangeOrigin::Local {
            let handlers: Vec<ExternalHandler> = self
                .handlers
                .get(&event.collection)
                .map(|entry| entry.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default();
            for handler in handlers {
                handler(&event);
            }
        }
        true
    }

    fn event(&self, key: &str, snapshot: Snapshot, origin: ChangeOrigin) -> ChangeEvent {
        ChangeEvent {
            collection: key.to_string(),
            snapshot: Arc::new(snapshot),
            origin,
        }
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks.entry(key.to_string()).or_default().clone()
    }
}
