//! Sync facade.
//!
//! The one entry point the rest of an application uses. Writes land in the
//! local store immediately and are pushed later by the scheduler; reads only
//! ever see local data.

use crate::error::Result;
use crate::local::{ChangeEvent, ChangeOrigin, HandlerId, LocalStore};
use crate::remote::RemoteService;
use crate::scheduler::{Scheduler, SyncStatus};
use crate::{SyncConfig, SyncError};
use chrono::Utc;
use std::sync::Arc;
use tandem_engine::{LocalId, PrincipalId, Record, Schema, Snapshot, Timestamp};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Local-first sync engine for one application session.
pub struct SyncEngine {
    schema: Schema,
    store: Arc<LocalStore>,
    scheduler: Scheduler,
    wipe_on_sign_out: bool,
}

impl SyncEngine {
    pub fn new(
        schema: Schema,
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteService>,
        config: SyncConfig,
    ) -> Self {
        let wipe_on_sign_out = config.wipe_on_sign_out;
        Self {
            scheduler: Scheduler::new(schema.clone(), store.clone(), remote, config),
            schema,
            store,
            wipe_on_sign_out,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// Sign in: pull and merge every collection, then start syncing.
    ///
    /// Collections whose pull fails stay local-only; only a sign-in that was
    /// itself replaced by a newer one returns an error.
    pub async fn initialize_for_principal(&self, principal: &str) -> Result<()> {
        self.scheduler.start(principal).await
    }

    /// Replace a collection's records.
    ///
    /// The write is local and immediate; the remote push follows after the
    /// debounce. Remote ids already back-filled locally are kept, and
    /// `updated_at` is stamped for changed records.
    pub fn save(&self, collection: &str, records: Vec<Record>) -> Result<()> {
        self.schema.require(collection)?;
        let now = now_millis();

        self.store
            .update(collection, ChangeOrigin::Local, |current| {
                *current = Snapshot::prepare_save(current, records, now)?;
                Ok::<_, tandem_engine::Error>(())
            })?;
        self.scheduler.mark_pending(collection);
        Ok(())
    }

    /// Delete one record locally and, if it ever reached the remote store,
    /// remotely on the next flush. Returns whether the record existed.
    pub fn delete(&self, collection: &str, local_id: LocalId) -> Result<bool> {
        self.schema.require(collection)?;

        let removed = self
            .store
            .modify(collection, ChangeOrigin::Local, |snapshot| snapshot.remove(local_id));
        let Some(record) = removed else {
            return Ok(false);
        };

        match record.remote_id {
            Some(remote_id) => {
                self.scheduler
                    .queue_remote_delete(collection, local_id, remote_id)
            }
            None => tracing::debug!(
                collection = %collection,
                local_id = %local_id,
                "Deleted record that never reached the remote store"
            ),
        }
        Ok(true)
    }

    /// Current local contents of a collection.
    pub fn snapshot(&self, collection: &str) -> Result<Snapshot> {
        self.schema.require(collection)?;
        Ok(self.store.read_or_empty(collection))
    }

    /// Flush every collection now.
    pub async fn force_sync(&self) -> Result<()> {
        self.scheduler.flush_all().await
    }

    /// Pull every collection again, picking up other devices' writes.
    pub async fn refresh(&self) -> Result<()> {
        self.scheduler.refresh().await
    }

    /// Sign out: stop timers, drop in-flight work and pending state, and
    /// (unless configured otherwise) remove the local collections.
    pub fn clear_principal_data(&self) {
        let principal = self.scheduler.principal();
        self.scheduler.stop();

        if self.wipe_on_sign_out {
            for name in self.schema.names() {
                self.store.remove(name);
            }
        }
        tracing::info!(
            principal = principal.as_deref().unwrap_or("-"),
            wiped = self.wipe_on_sign_out,
            "Cleared principal data"
        );
    }

    pub fn principal(&self) -> Option<PrincipalId> {
        self.scheduler.principal()
    }

    pub fn status(&self) -> SyncStatus {
        self.scheduler.status()
    }

    /// Report connectivity; coming back online flushes immediately.
    pub fn set_online(&self, online: bool) {
        self.scheduler.set_online(online);
    }

    /// Resume syncing after the host refreshed the remote credentials.
    pub fn credentials_refreshed(&self) {
        self.scheduler.credentials_refreshed();
    }

    /// Every change to every collection, saves and merges alike.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.store.subscribe()
    }

    /// Changes to one collection that did not come from this facade's saves.
    pub fn subscribe_external(
        &self,
        collection: &str,
        handler: impl Fn(&ChangeEvent) + Send + Sync + 'static,
    ) -> Result<HandlerId> {
        self.schema.require(collection)?;
        Ok(self.store.subscribe_external(collection, handler))
    }

    /// Best-effort flush on process exit. Stops the timers and returns the
    /// detached flush task, which gives up after the teardown timeout.
    pub fn shutdown(&self) -> JoinHandle<()> {
        self.scheduler.teardown()
    }

    /// Fail with [`SyncError::NotInitialized`] unless someone is signed in.
    pub fn require_principal(&self) -> Result<PrincipalId> {
        self.principal().ok_or(SyncError::NotInitialized)
    }
}

pub(crate) fn now_millis() -> Timestamp {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}
