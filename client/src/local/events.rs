//! Change notifications for local collections.

use serde::Serialize;
use std::sync::Arc;
use tandem_engine::{CollectionName, Snapshot};

/// Where a change to a local collection came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOrigin {
    /// A save or delete through this process
    Local,
    /// Merged remote data or a remote-id back-fill
    Remote,
    /// Another process or tab wrote the key
    External,
}

/// A collection's new contents after a write.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub collection: CollectionName,
    pub snapshot: Arc<Snapshot>,
    pub origin: ChangeOrigin,
}

/// Callback for changes a UI did not make itself.
pub type ExternalHandler = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Handle returned by
/// [`LocalStore::subscribe_external`](super::LocalStore::subscribe_external).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(pub(crate) u64);
