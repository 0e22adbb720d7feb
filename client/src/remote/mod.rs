//! Remote collection client.
//!
//! One generic client per collection, parameterized by its
//! [`CollectionDescriptor`]. Every call is scoped to a principal and can fail
//! with a typed [`RemoteError`]; nothing here retries, that is the
//! scheduler's job.

mod http;
mod memory;

pub use http::HttpRemote;
pub use memory::{MemoryRemote, RemoteCall, RemoteOp};

use crate::RemoteError;
use async_trait::async_trait;
use std::sync::Arc;
use tandem_engine::{CollectionDescriptor, Record, RemoteId};

/// CRUD access to one remote collection.
///
/// Records returned by the remote side always carry a remote id; their
/// local id is the one derived from it.
#[async_trait]
pub trait RemoteCollection: Send + Sync {
    fn descriptor(&self) -> &CollectionDescriptor;

    /// Insert a record. The returned record carries the new remote id.
    async fn create(&self, principal: &str, record: &Record) -> Result<Record, RemoteError>;

    /// Overwrite an existing row, replacing its children wholesale.
    async fn update(
        &self,
        principal: &str,
        remote_id: &RemoteId,
        record: &Record,
    ) -> Result<Record, RemoteError>;

    async fn delete(&self, principal: &str, remote_id: &RemoteId) -> Result<(), RemoteError>;

    /// Every record owned by the principal, newest first.
    async fn list(&self, principal: &str) -> Result<Vec<Record>, RemoteError>;
}

/// Hands out collection clients.
pub trait RemoteService: Send + Sync + 'static {
    fn collection(&self, descriptor: &CollectionDescriptor) -> Arc<dyn RemoteCollection>;
}
