//! In-process remote service.
//!
//! Behaves like the real service (server-side UUIDs, per-principal rows,
//! newest-first listing) and adds knobs for staging failures: reachability,
//! one-shot error injection, a validation predicate and a response gate.

use super::{RemoteCollection, RemoteService};
use crate::RemoteError;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tandem_engine::{
    derive_stable_local_id, CollectionDescriptor, CollectionName, PrincipalId, Record, RemoteId,
};
use tokio::sync::watch;
use uuid::Uuid;

/// Remote operation kinds, for call assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    Create,
    Update,
    Delete,
    List,
}

/// One call received by a [`MemoryRemote`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCall {
    pub op: RemoteOp,
    pub collection: CollectionName,
    pub principal: PrincipalId,
}

type Validator = Arc<dyn Fn(&str, &Record) -> Option<String> + Send + Sync>;

/// In-memory [`RemoteService`]. Clones share state.
#[derive(Clone)]
pub struct MemoryRemote {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    rows: Mutex<HashMap<(PrincipalId, CollectionName), Vec<Record>>>,
    reachable: AtomicBool,
    failures: Mutex<VecDeque<RemoteError>>,
    validator: RwLock<Option<Validator>>,
    /// `true` while writes are held
    gate: watch::Sender<bool>,
    held: AtomicUsize,
    calls: Mutex<Vec<RemoteCall>>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(false);
        Self {
            inner: Arc::new(MemoryInner {
                rows: Mutex::new(HashMap::new()),
                reachable: AtomicBool::new(true),
                failures: Mutex::new(VecDeque::new()),
                validator: RwLock::new(None),
                gate,
                held: AtomicUsize::new(0),
                calls: Mutex::new(Vec::new()),
            }),
        }
    }

    /// While unreachable every call fails with a network error.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Fail the next call (of any kind) with `error`.
    pub fn fail_next(&self, error: RemoteError) {
        self.inner.failures.lock().push_back(error);
    }

    /// Reject creates and updates for which `check(collection, record)`
    /// returns a reason.
    pub fn reject_when(
        &self,
        check: impl Fn(&str, &Record) -> Option<String> + Send + Sync + 'static,
    ) {
        *self.inner.validator.write() = Some(Arc::new(check));
    }

    /// Apply writes but hold their responses until [`release`](Self::release).
    pub fn hold(&self) {
        self.inner.gate.send_replace(true);
    }

    pub fn release(&self) {
        self.inner.gate.send_replace(false);
    }

    /// Responses currently waiting on the gate.
    pub fn held_responses(&self) -> usize {
        self.inner.held.load(Ordering::SeqCst)
    }

    /// Insert a row directly, as another device would. Returns its remote id.
    pub fn insert(&self, principal: &str, collection: &str, record: Record) -> RemoteId {
        let remote_id = record
            .remote_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let row = stored(&remote_id, &record);
        self.inner
            .rows
            .lock()
            .entry((principal.to_string(), collection.to_string()))
            .or_default()
            .push(row);
        remote_id
    }

    /// Rows a principal owns in a collection, in insertion order.
    pub fn rows(&self, principal: &str, collection: &str) -> Vec<Record> {
        self.inner
            .rows
            .lock()
            .get(&(principal.to_string(), collection.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.inner.calls.lock().clone()
    }

    /// Number of calls of one kind against a collection.
    pub fn count(&self, op: RemoteOp, collection: &str) -> usize {
        self.inner
            .calls
            .lock()
            .iter()
            .filter(|call| call.op == op && call.collection == collection)
            .count()
    }
}

impl RemoteService for MemoryRemote {
    fn collection(&self, descriptor: &CollectionDescriptor) -> Arc<dyn RemoteCollection> {
        Arc::new(MemoryCollection {
            inner: self.inner.clone(),
            descriptor: descriptor.clone(),
        })
    }
}

/// The server-side copy of a record.
fn stored(remote_id: &str, record: &Record) -> Record {
    Record {
        local_id: derive_stable_local_id(remote_id),
        remote_id: Some(remote_id.to_string()),
        updated_at: record.updated_at,
        fields: record.fields.clone(),
    }
}

struct HeldResponse<'a>(&'a AtomicUsize);

impl Drop for HeldResponse<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryInner {
    fn enter(&self, op: RemoteOp, collection: &str, principal: &str) -> Result<(), RemoteError> {
        self.calls.lock().push(RemoteCall {
            op,
            collection: collection.to_string(),
            principal: principal.to_string(),
        });
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("remote unreachable".to_string()));
        }
        match self.failures.lock().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn check(&self, collection: &str, record: &Record) -> Result<(), RemoteError> {
        let validator = self.validator.read().clone();
        match validator.and_then(|check| check(collection, record)) {
            Some(reason) => Err(RemoteError::Validation(reason)),
            None => Ok(()),
        }
    }

    async fn respond(&self) {
        let mut gate = self.gate.subscribe();
        let holding = *gate.borrow();
        if !holding {
            return;
        }
        self.held.fetch_add(1, Ordering::SeqCst);
        let _held = HeldResponse(&self.held);
        let _ = gate.wait_for(|held| !*held).await;
    }
}

struct MemoryCollection {
    inner: Arc<MemoryInner>,
    descriptor: CollectionDescriptor,
}

impl MemoryCollection {
    fn key(&self, principal: &str) -> (PrincipalId, CollectionName) {
        (principal.to_string(), self.descriptor.name.clone())
    }
}

#[async_trait]
impl RemoteCollection for MemoryCollection {
    fn descriptor(&self) -> &CollectionDescriptor {
        &self.descriptor
    }

    async fn create(&self, principal: &str, record: &Record) -> Result<Record, RemoteError> {
        let name = &self.descriptor.name;
        self.inner.enter(RemoteOp::Create, name, principal)?;
        self.inner.check(name, record)?;

        let remote_id = Uuid::new_v4().to_string();
        self.inner
            .rows
            .lock()
            .entry(self.key(principal))
            .or_default()
            .push(stored(&remote_id, record));

        self.inner.respond().await;
        Ok(record.clone().with_remote_id(remote_id))
    }

    async fn update(
        &self,
        principal: &str,
        remote_id: &RemoteId,
        record: &Record,
    ) -> Result<Record, RemoteError> {
        let name = &self.descriptor.name;
        self.inner.enter(RemoteOp::Update, name, principal)?;
        self.inner.check(name, record)?;

        let found = {
            let mut rows = self.inner.rows.lock();
            let row = rows
                .get_mut(&self.key(principal))
                .and_then(|rows| rows.iter_mut().find(|r| r.remote_id.as_ref() == Some(remote_id)));
            match row {
                Some(row) => {
                    row.replace_content(record);
                    true
                }
                None => false,
            }
        };
        if !found {
            return Err(RemoteError::NotFound(format!("{}/{}", name, remote_id)));
        }

        self.inner.respond().await;
        Ok(record.clone().with_remote_id(remote_id.clone()))
    }

    async fn delete(&self, principal: &str, remote_id: &RemoteId) -> Result<(), RemoteError> {
        let name = &self.descriptor.name;
        self.inner.enter(RemoteOp::Delete, name, principal)?;

        let removed = {
            let mut rows = self.inner.rows.lock();
            match rows.get_mut(&self.key(principal)) {
                Some(rows) => {
                    let before = rows.len();
                    rows.retain(|r| r.remote_id.as_ref() != Some(remote_id));
                    rows.len() < before
                }
                None => false,
            }
        };
        if !removed {
            return Err(RemoteError::NotFound(format!("{}/{}", name, remote_id)));
        }

        self.inner.respond().await;
        Ok(())
    }

    async fn list(&self, principal: &str) -> Result<Vec<Record>, RemoteError> {
        self.inner
            .enter(RemoteOp::List, &self.descriptor.name, principal)?;

        let mut records = self
            .inner
            .rows
            .lock()
            .get(&self.key(principal))
            .cloned()
            .unwrap_or_default();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(records)
    }
}
